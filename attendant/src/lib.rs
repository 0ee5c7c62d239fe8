//! An in-process supervisor for a single long-lived server process,
//! launched and monitored over a fixed pipe protocol.
//!
//! An `Attendant` is linked into a dynamically loaded host library that
//! cannot assume control of its host's signal handling, threading model,
//! or async runtime. It forks, execs an intermediate relay program that
//! scrubs inherited resources, then execs the caller's server program; it
//! then watches a canary pipe for the server's exit (never relying on
//! `waitpid`/`SIGCHLD` cooperation from the host) and restarts it through
//! a host-supplied [`Starter`] callback.
//!
//! See [`Attendant::initialize`] to begin.

mod callbacks;
mod error;
mod launcher;
mod monotonic;
mod pipes;
mod reaper;
mod registry;
mod state;

use std::ffi::CString;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

pub use callbacks::{Connector, NoopCallbacks, Starter};
pub use error::{AttendantError, ErrorPair, Result};

use tracing::debug;

use error::LastError;
use registry::Registry;
use state::State;

/// Arguments to [`Attendant::initialize`]. Mirrors the original C API's
/// `struct attendant__initializer`, whose `starter`/`connector` function
/// pointers could be null; `None` here maps to the same
/// `InitStarterRequired`/`InitConnectorRequired` failures.
pub struct Initializer {
    pub starter: Option<Box<dyn Starter>>,
    pub connector: Option<Box<dyn Connector>>,
    pub relay_path: String,
    pub canary_slot: RawFd,
}

struct Inner {
    state: State,
    registry: Mutex<Registry>,
    last_error: LastError,
    starter: Box<dyn Starter>,
    connector: Box<dyn Connector>,
    relay_path: CString,
    canary_slot: RawFd,
    waitable: bool,
    reaper_handle: Mutex<Option<JoinHandle<()>>>,
}

/// A cheaply cloneable handle onto the supervisor. Background worker
/// threads hold their own clone, the same way the teacher's activity
/// tracker shares an `Arc<Inner>` with the tasks that observe it, instead
/// of reaching for unsafe lifetime extension.
#[derive(Clone)]
pub struct Attendant(Arc<Inner>);

impl Attendant {
    /// Validates the initializer, preallocates the long-lived pipes, and
    /// spawns a no-op placeholder thread for the first launcher worker to
    /// join in place of "the previous reaper". Must be called exactly
    /// once; there is no re-initialization.
    pub fn initialize(initializer: Initializer) -> Result<Self> {
        let starter = initializer
            .starter
            .ok_or(AttendantError::InitStarterRequired)?;
        let connector = initializer
            .connector
            .ok_or(AttendantError::InitConnectorRequired)?;

        if initializer.canary_slot < 0 {
            return Err(AttendantError::InvalidCanarySlot);
        }
        if !initializer.relay_path.starts_with('/') {
            return Err(AttendantError::RelayPathNotAbsolute);
        }
        let relay_path =
            CString::new(initializer.relay_path).map_err(|_| AttendantError::RelayPathNotAbsolute)?;

        let registry = Registry::new()?;
        let waitable = sigchld_waitable();

        // Stands in as "the previous reaper" so the first launcher worker
        // has a join target, exactly like the original's `kickoff` thread.
        let placeholder = std::thread::spawn(|| {});

        Ok(Self(Arc::new(Inner {
            state: State::new(),
            registry: Mutex::new(registry),
            last_error: LastError::new(),
            starter,
            connector,
            relay_path,
            canary_slot: initializer.canary_slot,
            waitable,
            reaper_handle: Mutex::new(Some(placeholder)),
        })))
    }

    /// Begins (or restarts) the server process. Legal as the first call
    /// after `initialize`, and legal again only from inside the starter
    /// callback while it is handling `restart = true`. Returns once the
    /// launcher worker has been spawned; it does not wait for the launch
    /// to complete — call [`Attendant::ready`] for that.
    pub fn start(&self, server_path: String, server_argv: Vec<String>) -> Result<()> {
        if self.0.state.begin_start().is_none() {
            return Err(AttendantError::AlreadyRunning);
        }
        debug!(server_path = %server_path, "start requested");
        self.0.last_error.reset();

        let inner = self.clone();
        // The launcher worker's own thread is never joined, matching the
        // original (`start` never rejoins `process.launcher`); only the
        // *reaper* it eventually spawns gets joined, by the next launcher
        // or by `done`.
        std::thread::Builder::new()
            .spawn(move || inner.launch_worker(server_path, server_argv))
            .map_err(|_| AttendantError::CannotSpawnLauncherThread)?;

        Ok(())
    }

    fn launch_worker(&self, server_path: String, server_argv: Vec<String>) {
        // `spec.md` §4.3 never calls the starter from the launcher worker —
        // only `signal_termination` (§4.5) does, exactly once per detected
        // termination. Calling it here too would fire it twice whenever the
        // starter itself is what triggered this launch by calling `start`.
        if let Some(previous) = self
            .0
            .reaper_handle
            .lock()
            .expect("reaper handle poisoned")
            .take()
        {
            let _ = previous.join();
        }

        let mut registry = self.0.registry.lock().expect("registry mutex poisoned");
        registry.close_launch_pipes();
        if let Err(e) = registry.recycle_stdio() {
            self.0.last_error.record(e);
            drop(registry);
            self.fail_start();
            return;
        }

        let req = launcher::LaunchRequest {
            relay_path: &self.0.relay_path,
            canary_slot: self.0.canary_slot,
            server_path: &server_path,
            server_argv: &server_argv,
            waitable: self.0.waitable,
        };

        let launched = launcher::launch(
            &mut registry,
            &req,
            self.0.connector.as_ref(),
            &self.0.last_error,
        );
        drop(registry);

        match launched {
            Ok(success) => {
                let reap_req = reaper::ReapRequest {
                    pid: success.pid,
                    waitable: self.0.waitable,
                    reaper_read: success.reaper_read,
                    canary_read: success.canary_read,
                    stdout_read: success.stdout_read,
                    stderr_read: success.stderr_read,
                };
                let reaper_inner = self.clone();
                let handle = std::thread::spawn(move || {
                    reaper::run(
                        reap_req,
                        &reaper_inner.0.state,
                        reaper_inner.0.starter.as_ref(),
                        &reaper_inner.0.last_error,
                    );
                });
                *self.0.reaper_handle.lock().expect("reaper handle poisoned") = Some(handle);
            }
            Err(_) => self.fail_start(),
        }
    }

    /// The original's `signal_termination`, invoked directly by a failed
    /// launch rather than by the reaper.
    fn fail_start(&self) {
        let (restarting, instance) = self.0.state.begin_termination();
        if restarting {
            self.0.starter.on_start(true);
            self.0.state.finalize_after_starter(instance);
        }
    }

    /// Blocks until the server is running, or until shutdown is latched
    /// (in which case it never will be). Returns `false` in the latter
    /// case.
    pub fn ready(&self) -> bool {
        self.0.state.ready()
    }

    /// Reports that IPC with the server failed and the caller believes it
    /// crashed or hung. Collapses concurrent callers reporting the same
    /// failure into a single termination request, then blocks for the
    /// restart (or shutdown) to resolve. `grace_millis` is the SIGTERM
    /// grace window the reaper will give the old instance before
    /// escalating to SIGKILL (`-1` skips SIGTERM and kills immediately).
    pub fn retry(&self, grace_millis: i64) -> bool {
        // A thread that has never called `retry` before starts believing
        // the very first instance (1) is current. On any instance after
        // the first, that can never match, so a never-yet-called thread
        // cannot itself be "first to notice" a later crash — it falls
        // through to `ready()` below. Only a thread that has already seen
        // a previous instance via a prior `retry` call can race to claim
        // the next one.
        let thread_instance = match state::last_observed_instance() {
            0 => 1,
            instance => instance,
        };

        if self.0.state.claim_retry(thread_instance) {
            let message = encode_reaper_message(thread_instance as i32, grace_millis as i32);
            let registry = self.0.registry.lock().expect("registry mutex poisoned");
            let _ = nix::unistd::write(registry.reaper_write, &message);
        }

        if self.0.state.ready() {
            state::set_last_observed_instance(self.0.state.current_instance());
            true
        } else {
            false
        }
    }

    /// Tells the attendant not to restart the server the next time it
    /// exits, then waits for that latch to take effect. Returns whether
    /// the server was still running at that point; the caller is
    /// expected to have already asked the server to exit over its own
    /// IPC channel before calling this.
    pub fn shutdown(&self) -> bool {
        debug!("shutdown requested");
        {
            let registry = self.0.registry.lock().expect("registry mutex poisoned");
            let message = encode_reaper_message(-1, 0);
            let _ = nix::unistd::write(registry.reaper_write, &message);
        }
        self.0.state.await_shutdown()
    }

    /// Waits (bounded by `timeout_millis`, or indefinitely if negative)
    /// for the server to stop running after a shutdown has been latched.
    /// Returns whether it has stopped. On success, reclaims the reaper
    /// worker's thread.
    pub fn done(&self, timeout_millis: i64) -> bool {
        let done = self.0.state.await_done(timeout_millis);
        if done {
            if let Some(handle) = self
                .0
                .reaper_handle
                .lock()
                .expect("reaper handle poisoned")
                .take()
            {
                let _ = handle.join();
            }
        }
        done
    }

    /// Shuts down immediately with `SIGKILL`, superseding any in-flight
    /// restart: sends an instance number no future `retry`/`scram` call
    /// can exceed, with `aux = -1` so the reaper skips SIGTERM.
    pub fn scram(&self) -> bool {
        if self.shutdown() {
            let message = encode_reaper_message(i32::MAX, -1);
            let registry = self.0.registry.lock().expect("registry mutex poisoned");
            let _ = nix::unistd::write(registry.reaper_write, &message);
            true
        } else {
            false
        }
    }

    /// The first error recorded since the last `start()`, if any.
    pub fn errors(&self) -> Option<ErrorPair> {
        self.0.last_error.get()
    }

    /// Releases the pipes and relay path. Does not stop the server
    /// process; the caller must shut it down (and call `done`) first.
    pub fn destroy(&self) {
        self.0
            .registry
            .lock()
            .expect("registry mutex poisoned")
            .close_all();
    }
}

fn encode_reaper_message(instance: i32, aux: i32) -> [u8; 8] {
    let mut buf = [0u8; 8];
    buf[0..4].copy_from_slice(&instance.to_ne_bytes());
    buf[4..8].copy_from_slice(&aux.to_ne_bytes());
    buf
}

fn sigchld_waitable() -> bool {
    unsafe {
        let mut current: libc::sigaction = std::mem::zeroed();
        libc::sigaction(libc::SIGCHLD, std::ptr::null(), &mut current);
        current.sa_sigaction != libc::SIG_IGN
    }
}
