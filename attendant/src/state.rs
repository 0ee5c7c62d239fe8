//! The mutex-guarded state machine and its three condition variables.
//!
//! Mirrors `struct process`'s `mutex`/`cond.{running,shutdown}` pair plus
//! the `running`/`restarting`/`shutdown`/`instance` fields from the
//! original POSIX source, with `pthread_getspecific`'s per-thread instance
//! key reimplemented as a `thread_local!`.

use std::cell::Cell;
use std::sync::{Condvar, Mutex, MutexGuard};

use crate::monotonic;

thread_local! {
    /// The instance number this thread last observed the server running
    /// at. Used by `retry()` to collapse a thundering herd of concurrent
    /// restart requests into a single write to the REAPER pipe per
    /// instance: only the thread whose observed instance matches the
    /// current one is "first to notice" and gets to request a restart.
    static LAST_OBSERVED_INSTANCE: Cell<i64> = Cell::new(0);
}

pub fn last_observed_instance() -> i64 {
    LAST_OBSERVED_INSTANCE.with(|c| c.get())
}

pub fn set_last_observed_instance(value: i64) {
    LAST_OBSERVED_INSTANCE.with(|c| c.set(value));
}

#[derive(Debug, Default)]
struct Inner {
    running: bool,
    restarting: bool,
    shutdown: bool,
    instance: i64,
}

#[derive(Debug, Default)]
pub struct State {
    inner: Mutex<Inner>,
    cond_running: Condvar,
    cond_shutdown: Condvar,
    /// Used only by the reaper's non-waitable pid-reuse poll: a pure
    /// 250ms timeout, never signaled. See `wait_tick`.
    cond_tick: Condvar,
}

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("attendant state mutex poisoned")
    }

    /// `start()`'s preamble: fail if already running, otherwise bump and
    /// return the new instance number.
    pub fn begin_start(&self) -> Option<i64> {
        let mut guard = self.lock();
        if guard.running {
            return None;
        }
        guard.instance += 1;
        Some(guard.instance)
    }

    pub fn current_instance(&self) -> i64 {
        self.lock().instance
    }

    /// Called by the reaper worker once the server process is confirmed
    /// up: flips `running` on, clears `restarting`, wakes anyone blocked
    /// in `ready()`.
    pub fn mark_launch_success(&self) {
        let mut guard = self.lock();
        guard.running = true;
        guard.restarting = false;
        self.cond_running.notify_all();
    }

    /// `signal_termination`'s mutex section. Returns `(should_restart,
    /// instance_at_termination)`.
    pub fn begin_termination(&self) -> (bool, i64) {
        let mut guard = self.lock();
        guard.restarting = !guard.shutdown;
        guard.running = false;
        let instance = guard.instance;
        self.cond_running.notify_all();
        (guard.restarting, instance)
    }

    /// `signal_termination`'s post-starter-callback section. If the
    /// instance hasn't moved since `begin_termination` (i.e. the starter
    /// callback did not itself call `start()`), we conclude the caller
    /// gave up, and latch a final shutdown.
    pub fn finalize_after_starter(&self, instance_at_termination: i64) {
        let mut guard = self.lock();
        if guard.instance == instance_at_termination {
            guard.restarting = false;
            guard.shutdown = true;
            self.cond_running.notify_all();
            self.cond_shutdown.notify_all();
        }
    }

    /// Fatal, unrecoverable reaper anomaly: latch shutdown immediately,
    /// regardless of the starter callback.
    pub fn force_shutdown(&self) {
        let mut guard = self.lock();
        guard.shutdown = true;
        self.cond_running.notify_all();
        self.cond_shutdown.notify_all();
    }

    /// Blocks until the server is running or shutdown is latched. Returns
    /// `true` ("ready") unless shutdown won the race.
    pub fn ready(&self) -> bool {
        let guard = self.lock();
        let guard = monotonic::wait_while(&self.cond_running, guard, -1, |s| {
            !s.running && !s.shutdown
        });
        !guard.shutdown
    }

    /// `retry()`'s mutex section: if this thread's last observed instance
    /// is still the current one and the server is believed running, this
    /// thread is first to notice the failure — mark not-running and
    /// report that a REAPER pipe write is needed.
    pub fn claim_retry(&self, thread_instance: i64) -> bool {
        let mut guard = self.lock();
        if guard.instance == thread_instance && guard.running {
            guard.running = false;
            true
        } else {
            false
        }
    }

    /// `shutdown()`'s mutex section: latch the shutdown request is done by
    /// the caller (writing to the REAPER pipe) before this is called; this
    /// waits out any in-flight restart, then waits for shutdown to latch,
    /// returning whether the server was still running at that point.
    pub fn await_shutdown(&self) -> bool {
        let mut guard = self.lock();
        while guard.restarting {
            guard = self.cond_running.wait(guard).expect("state mutex poisoned");
        }
        while !guard.shutdown {
            guard = self
                .cond_shutdown
                .wait(guard)
                .expect("state mutex poisoned");
        }
        guard.running
    }

    /// `done(timeout)`: if shutdown is latched and the server is still
    /// running, wait (possibly bounded) for it to stop. Returns whether
    /// the server has stopped running.
    pub fn await_done(&self, millis: i64) -> bool {
        let mut guard = self.lock();
        if guard.shutdown && guard.running {
            guard = monotonic::wait_while(&self.cond_running, guard, millis, |s| s.running);
        }
        !guard.running
    }

    pub fn is_shutdown(&self) -> bool {
        self.lock().shutdown
    }

    /// Blocks for 250ms. Used by the reaper's non-waitable exit-detection
    /// poll in place of `pthread_cond_waitforabit(&cond.getgpid, ..., 250)`
    /// — the original only ever used that condvar for its timeout, never
    /// its signal, so this reduces to a plain bounded wait.
    pub fn wait_tick(&self) {
        let guard = self.lock();
        let _ = monotonic::wait(&self.cond_tick, guard, 250);
    }
}
