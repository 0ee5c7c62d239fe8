//! The launcher worker: fork, exec the relay, validate the handshake.

use std::ffi::CString;
use std::os::unix::io::RawFd;

use nix::sys::wait::waitpid;
use nix::unistd::{dup2, execv, fork, read, write, ForkResult, Pid};
use tracing::{debug, warn};

use attendant_common::{
    self, decode_status, AttendantError as CommonError, RELAY_ARGV_CANARY_SLOT_INDEX,
    RELAY_ARGV_FIXED_LEN, RELAY_ARGV_SERVER_PATH_INDEX, RELAY_ARGV_STATUS_FD_INDEX,
    STATUS_MESSAGE_LEN,
};

use crate::callbacks::Connector;
use crate::error::{AttendantError, LastError, Result};
use crate::pipes;
use crate::registry::Registry;

/// Everything the launcher needs that doesn't live in the registry.
pub struct LaunchRequest<'a> {
    pub relay_path: &'a CString,
    pub canary_slot: RawFd,
    pub server_path: &'a str,
    pub server_argv: &'a [String],
    pub waitable: bool,
}

pub struct LaunchSuccess {
    pub pid: Pid,
    pub canary_read: RawFd,
    pub stdout_read: RawFd,
    pub stderr_read: RawFd,
    pub reaper_read: RawFd,
}

/// Build `[relay_path, status_fd_placeholder, canary_slot, server_path,
/// ...server_argv]` as the relay will receive it, with the status fd slot
/// filled in once the RELAY pipe exists.
fn build_argv(req: &LaunchRequest<'_>, status_fd: RawFd) -> Result<Vec<CString>> {
    let mut argv = Vec::with_capacity(RELAY_ARGV_FIXED_LEN + req.server_argv.len());
    argv.push(req.relay_path.clone());
    debug_assert_eq!(argv.len(), RELAY_ARGV_STATUS_FD_INDEX);
    argv.push(CString::new(status_fd.to_string()).expect("fd string has no NUL"));
    debug_assert_eq!(argv.len(), RELAY_ARGV_CANARY_SLOT_INDEX);
    argv.push(CString::new(req.canary_slot.to_string()).expect("fd string has no NUL"));
    debug_assert_eq!(argv.len(), RELAY_ARGV_SERVER_PATH_INDEX);
    argv.push(CString::new(req.server_path).map_err(|_| AttendantError::CannotFork)?);
    for arg in req.server_argv {
        argv.push(CString::new(arg.as_str()).map_err(|_| AttendantError::CannotFork)?);
    }
    Ok(argv)
}

/// Everything that happens between `fork()` and `execv()` in the child.
/// Async-signal-safe only: no allocation, no locking, no buffered I/O.
/// `argv` and `relay_path` must already be fully constructed before fork.
///
/// # Safety
/// Must only be called in the freshly forked child, before any other
/// code runs.
unsafe fn child_exec(
    relay_path: &CString,
    argv: &[CString],
    status_write: RawFd,
    stdin_read: RawFd,
    stdout_write: RawFd,
    stderr_write: RawFd,
    canary_write: RawFd,
    canary_slot: RawFd,
) -> ! {
    let _ = dup2(stdin_read, libc::STDIN_FILENO);
    let _ = dup2(stdout_write, libc::STDOUT_FILENO);
    let _ = dup2(stderr_write, libc::STDERR_FILENO);

    // A no-op if canary_write already happens to be canary_slot, exactly
    // as dup2 specifies for fd == fd2.
    let _ = dup2(canary_write, canary_slot);

    let _ = execv(relay_path, argv);

    // execv only returns on failure. Distinct from `CannotFork`: the fork
    // itself succeeded, it's exec'ing the relay program that failed
    // (`spec.md` §4.3 step 5 / §7's `StartCannotExecv`).
    let message = attendant_common::encode_status(
        CommonError::CannotExecRelay.domain_code(),
        std::io::Error::last_os_error().raw_os_error().unwrap_or(0),
    );
    let _ = write(status_write, &message);
    libc::_exit(libc::EXIT_FAILURE);
}

/// Launcher worker steps 2–8. Expects `registry.recycle_stdio()` to have
/// already run (step 1, joining the previous reaper, is the caller's
/// responsibility since it needs a `JoinHandle`, not a registry borrow).
pub fn launch(
    registry: &mut Registry,
    req: &LaunchRequest<'_>,
    connector: &dyn Connector,
    last_error: &LastError,
) -> Result<LaunchSuccess> {
    registry.create_launch_pipes()?;
    debug!(server_path = req.server_path, "launching server process");

    let fork_pipe = registry.fork.expect("fork pipe just created");
    let relay_pipe = registry.relay.expect("relay pipe just created");
    let canary_pipe = registry.canary.expect("canary pipe just created");

    // Captured before fork: the child's copy of this fd number is what it
    // will use to report status. The parent closes its own copy right
    // after fork and reads replies from `relay_pipe.read` instead.
    let status_fd = relay_pipe.write;
    let argv = build_argv(req, status_fd)?;

    let stdin_read = registry.stdin_read;
    let stdout_write = registry.stdout_write;
    let stderr_write = registry.stderr_write;
    let canary_write = canary_pipe.write;
    let canary_slot = req.canary_slot;
    let relay_path = req.relay_path;

    // Safety: nix::unistd::fork is unsafe because the child must restrict
    // itself to async-signal-safe calls, which `child_exec` does.
    let fork_result = unsafe { fork() };

    let pid = match fork_result {
        Ok(ForkResult::Child) => unsafe {
            child_exec(
                relay_path,
                &argv,
                status_fd,
                stdin_read,
                stdout_write,
                stderr_write,
                canary_write,
                canary_slot,
            )
        },
        Ok(ForkResult::Parent { child }) => child,
        Err(_) => {
            warn!("fork failed");
            last_error.record(AttendantError::CannotFork);
            registry.close_launch_pipes();
            return Err(AttendantError::CannotFork);
        }
    };
    debug!(pid = pid.as_raw(), "forked child");

    registry.close_launch_child_ends();

    let result = run_handshake(fork_pipe.read, status_fd, relay_pipe.read, registry.stdout_read);

    match result {
        Ok(()) => {
            debug!(pid = pid.as_raw(), "handshake completed, server running");
            connector.on_connect(registry.stdin_write, registry.stdout_read);
            Ok(LaunchSuccess {
                pid,
                canary_read: canary_pipe.read,
                stdout_read: registry.stdout_read,
                stderr_read: registry.stderr_read,
                reaper_read: registry.reaper_read,
            })
        }
        Err(e) => {
            warn!(pid = pid.as_raw(), error = %e, "launch handshake failed");
            last_error.record_with(e, nix::errno::errno());
            fail_launch(pid, req.waitable, registry);
            Err(e)
        }
    }
}

fn fail_launch(pid: Pid, waitable: bool, registry: &mut Registry) {
    let _ = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGKILL);
    if waitable {
        let _ = waitpid(pid, None);
    }
    registry.close_launch_pipes();
}

/// The parent-side handshake of launcher worker step 6, `spec.md` §4.3.
fn run_handshake(
    fork_read: RawFd,
    status_fd_value: RawFd,
    relay_read: RawFd,
    stdout_read: RawFd,
) -> Result<()> {
    // 6a: FORK pipe hangs up once close-on-exec fires on successful exec
    // of the relay. Nothing ever writes to this pipe, so any nonzero read
    // is an assertion failure. The parent has no further use for this fd
    // after the read either way, so it closes it here rather than leaving
    // cleanup to the next launch's sweep (unlike RELAY, below).
    let mut scratch = [0u8; 4];
    let fork_result = retry_read(fork_read, &mut scratch);
    pipes::close_quietly(fork_read);
    let n = fork_result?;
    if n != 0 {
        return Err(AttendantError::HandshakeForkPipeHungupEarly);
    }

    // 6b: read the echoed status fd number from STDOUT.
    let mut confirm = [0u8; 4];
    let n = retry_read(stdout_read, &mut confirm)?;
    if n == 0 {
        // The relay exited immediately; its reason, if any, is on the
        // status pipe.
        return Err(read_status_error(relay_read)?.unwrap_or(AttendantError::HandshakeUnexpectedStatus));
    }
    if n != 4 {
        return Err(AttendantError::HandshakeUnexpectedStatus);
    }
    if i32::from_ne_bytes(confirm) != status_fd_value {
        return Err(AttendantError::HandshakeStatusPipeFdMismatch);
    }

    // 6c: read the echoed status fd number back from the status pipe
    // itself, proving the channel is alive.
    let n = retry_read(relay_read, &mut confirm)?;
    if n == 0 {
        return Err(AttendantError::HandshakeForkPipeHungupEarly);
    }
    if n != 4 {
        return Err(AttendantError::HandshakeUnexpectedStatus);
    }
    if i32::from_ne_bytes(confirm) != status_fd_value {
        return Err(AttendantError::HandshakeStatusPipeFdMismatch);
    }

    // 6d: final status read. Zero bytes (hang-up via close-on-exec) means
    // the relay exec'd the server program successfully.
    match read_status_error(relay_read)? {
        None => Ok(()),
        Some(e) => Err(e),
    }
}

/// Reads one status message from the RELAY pipe's read end. `Ok(None)`
/// means hang-up (success); `Ok(Some(e))` means the relay (or a handshake
/// assertion) reported a failure.
fn read_status_error(relay_read: RawFd) -> Result<Option<AttendantError>> {
    let mut buf = [0u8; STATUS_MESSAGE_LEN];
    let n = retry_read(relay_read, &mut buf)?;
    if n == 0 {
        return Ok(None);
    }
    if n != STATUS_MESSAGE_LEN {
        return Ok(Some(AttendantError::HandshakeUnexpectedStatus));
    }
    let (domain_code, _os_code) = decode_status(&buf);
    Ok(Some(common_code_to_error(domain_code)))
}

fn common_code_to_error(domain_code: i32) -> AttendantError {
    // The relay and the attendant share attendant-common's catalog; any
    // code it can send maps 1:1 onto our own error type.
    match domain_code {
        c if c == CommonError::CannotExecRelay.domain_code() => AttendantError::CannotExecRelay,
        c if c == CommonError::RelayProgramMissing.domain_code() => {
            AttendantError::RelayProgramMissing
        }
        c if c == CommonError::RelayProgramPathNotAbsolute.domain_code() => {
            AttendantError::RelayProgramPathNotAbsolute
        }
        c if c == CommonError::RelayCannotOpenProcFd.domain_code() => {
            AttendantError::RelayCannotOpenProcFd
        }
        c if c == CommonError::RelayCannotExec.domain_code() => AttendantError::RelayCannotExec,
        _ => AttendantError::HandshakeUnexpectedStatus,
    }
}

fn retry_read(fd: RawFd, buf: &mut [u8]) -> Result<usize> {
    loop {
        match read(fd, buf) {
            Ok(n) => return Ok(n),
            Err(nix::errno::Errno::EINTR) => continue,
            Err(_) => return Err(AttendantError::HandshakeUnexpectedStatus),
        }
    }
}
