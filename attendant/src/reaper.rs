//! The reaper worker: the single long-running thread that multiplexes the
//! canary pipe, the REAPER command pipe, and the server's standard output
//! and error, and escalates forced termination through SIGTERM then
//! SIGKILL.
//!
//! Grounded directly on the original POSIX `reap()`: same four-channel
//! `poll` loop, same 2048-byte discard buffer, same SIGTERM-then-SIGKILL
//! escalation driven by a REAPER pipe message of `(instance, aux_millis)`.
//! The one deliberate behavior change is documented at [`escalate`]: `spec.md`
//! states, in its own words, that an `aux` of `-1` skips SIGTERM outright,
//! where the original always sent SIGTERM on the first visit regardless of
//! `aux`. That stated text governs here.

use std::os::unix::io::RawFd;

use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::{getpgid, read, Pid};
use tracing::{debug, warn};

use attendant_common::AttendantError as CommonError;

use crate::callbacks::Starter;
use crate::error::LastError;
use crate::pipes;
use crate::state::State;

/// A drained standard-I/O channel is marked dead by setting its fd to `-1`,
/// matching the original's `fds[i] = -1` sentinel.
const DEAD: RawFd = -1;

const DISCARD_BUFFER_LEN: usize = 2048;

pub struct ReapRequest {
    pub pid: Pid,
    pub waitable: bool,
    pub reaper_read: RawFd,
    pub canary_read: RawFd,
    pub stdout_read: RawFd,
    pub stderr_read: RawFd,
}

/// Runs until the server process exits (or is killed), reaps it, and
/// performs the equivalent of `signal_termination`: flips `running` off,
/// and if a restart is warranted, invokes the starter callback and either
/// latches shutdown (the starter gave up) or lets the next `start()`
/// proceed (the starter already called back in).
pub fn run(req: ReapRequest, state: &State, starter: &dyn Starter, last_error: &LastError) {
    debug!(pid = req.pid.as_raw(), "reaper worker starting");
    state.mark_launch_success();

    let mut local_instance: i64 = 0;
    let mut sig = Signal::SIGTERM;
    let mut timeout_ms: i32 = -1;
    let mut hangup = false;
    let mut shutdown_latched = false;
    let mut fatal = false;

    let mut stdout_fd = req.stdout_read;
    let mut stderr_fd = req.stderr_read;

    let mut buffer = [0u8; DISCARD_BUFFER_LEN];

    while !hangup {
        // Index 0 is always REAPER, index 1 always CANARY; a parallel fd
        // list keeps us from depending on `PollFd`'s accessor for the raw
        // fd it was built from.
        let mut channel_fds = vec![req.reaper_read, req.canary_read];
        let mut fds = vec![
            PollFd::new(req.reaper_read, PollFlags::POLLIN),
            PollFd::new(req.canary_read, PollFlags::POLLHUP),
        ];
        if stdout_fd != DEAD {
            channel_fds.push(stdout_fd);
            fds.push(PollFd::new(stdout_fd, PollFlags::POLLIN | PollFlags::POLLHUP));
        }
        if stderr_fd != DEAD {
            channel_fds.push(stderr_fd);
            fds.push(PollFd::new(stderr_fd, PollFlags::POLLIN | PollFlags::POLLHUP));
        }

        loop {
            match poll(&mut fds, timeout_ms) {
                Ok(_) => break,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(_) => break,
            }
        }

        // Drain and retire standard output/error. We never store what we
        // read; the host application's own IPC, not this pipe, is the
        // channel of record.
        for (pfd, &fd) in fds.iter().zip(channel_fds.iter()).skip(2) {
            let Some(revents) = pfd.revents() else { continue };
            if revents.contains(PollFlags::POLLIN) {
                match read(fd, &mut buffer) {
                    Ok(_) => {}
                    Err(_) => retire(fd, &mut stdout_fd, &mut stderr_fd),
                }
            }
            if revents.intersects(PollFlags::POLLHUP | PollFlags::POLLERR | PollFlags::POLLNVAL) {
                retire(fd, &mut stdout_fd, &mut stderr_fd);
            }
        }

        let canary_revents = fds[1].revents().unwrap_or(PollFlags::empty());
        if canary_revents.contains(PollFlags::POLLHUP) {
            debug!(pid = req.pid.as_raw(), "canary pipe hung up, server exited");
            hangup = true;
        } else if !canary_revents.is_empty() {
            warn!(?canary_revents, "unexpected canary pipe event");
            last_error.record(CommonError::ReaperUnexpectedCanaryPipeEvent);
            fatal = true;
        }

        let reaper_revents = fds[0].revents().unwrap_or(PollFlags::empty());
        if reaper_revents.contains(PollFlags::POLLIN) {
            let mut message = [0u8; 8];
            match read(req.reaper_read, &mut message) {
                Ok(8) => {
                    let instance = i32::from_ne_bytes(message[0..4].try_into().unwrap()) as i64;
                    let aux = i32::from_ne_bytes(message[4..8].try_into().unwrap());
                    if instance == -1 {
                        debug!(pid = req.pid.as_raw(), "shutdown requested");
                        shutdown_latched = true;
                    } else if instance > local_instance {
                        debug!(pid = req.pid.as_raw(), instance, aux, "termination requested");
                        local_instance = instance;
                        timeout_ms = aux;
                    }
                }
                Ok(_) => {
                    last_error.record(CommonError::ReaperTruncatedReaperPipeRead);
                    fatal = true;
                }
                Err(_) => {
                    last_error.record(CommonError::ReaperCannotReadReaperPipe);
                    fatal = true;
                }
            }
        } else if !reaper_revents.is_empty() {
            last_error.record(CommonError::ReaperUnexpectedReaperPipeEvent);
            fatal = true;
        }

        if fatal {
            shutdown_latched = true;
            hangup = true;
            let _ = kill(req.pid, Signal::SIGKILL);
        }

        if shutdown_latched {
            state.force_shutdown();
            shutdown_latched = false;
        }

        if local_instance > 0 && !hangup {
            escalate(req.pid, &mut sig, &mut timeout_ms);
            continue;
        }
    }

    reap_exit(req.pid, req.waitable, state);

    pipes::close_quietly(req.canary_read);
    pipes::close_quietly(req.stdout_read);
    pipes::close_quietly(req.stderr_read);

    let (restarting, instance) = state.begin_termination();
    if restarting {
        starter.on_start(true);
        state.finalize_after_starter(instance);
    }
}

/// Escalating kill: SIGTERM, then (after `aux` milliseconds, or
/// indefinitely if negative) SIGKILL.
///
/// `spec.md` states that `aux == -1` skips SIGTERM and kills immediately on
/// the first visit — notably the contract `scram()` relies on ("shutdown
/// immediately with a SIGKILL" passes `aux = -1`). We honor that stated
/// text rather than the original C's literal unconditional-SIGTERM-first
/// behavior.
fn escalate(pid: Pid, sig: &mut Signal, timeout_ms: &mut i32) {
    if *sig == Signal::SIGTERM && *timeout_ms == -1 {
        debug!(pid = pid.as_raw(), "escalation skipping SIGTERM, sending SIGKILL");
        let _ = kill(pid, Signal::SIGKILL);
        *sig = Signal::SIGKILL;
        *timeout_ms = -1;
        return;
    }
    debug!(pid = pid.as_raw(), signal = ?sig, "sending termination signal");
    let _ = kill(pid, *sig);
    *timeout_ms = if *sig == Signal::SIGTERM { *timeout_ms } else { -1 };
    *sig = Signal::SIGKILL;
}

fn retire(fd: RawFd, stdout_fd: &mut RawFd, stderr_fd: &mut RawFd) {
    if *stdout_fd == fd {
        *stdout_fd = DEAD;
    }
    if *stderr_fd == fd {
        *stderr_fd = DEAD;
    }
}

/// Reaps the exited server process. When `waitable` is false (the host
/// application has set `SIGCHLD` to `SIG_IGN`), `waitpid` cannot be used,
/// so this falls back to polling for the pid's continued existence —
/// accepting the original's documented, theoretical pid-reuse race.
fn reap_exit(pid: Pid, waitable: bool, state: &State) {
    if waitable {
        loop {
            match waitpid(pid, None) {
                Err(nix::errno::Errno::EINTR) => continue,
                _ => break,
            }
        }
        return;
    }

    while getpgid(Some(pid)).is_ok() {
        state.wait_tick();
    }
}
