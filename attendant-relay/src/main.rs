//! `attendant-relay` — the external collaborator of `spec.md` §4.8.
//!
//! Exec'd by the attendant's launcher worker as
//! `attendant-relay <status_fd> <canary_fd> <server_path> [server_argv...]`,
//! this program's entire job is to occupy the forked child in a clean,
//! single-threaded process image, scrub everything the host application may
//! have leaked across `fork`, and then exec-replace itself with the real
//! server program. Grounded on `original_source/relay.c`; the argv layout
//! (four fixed slots, canary fd as its own positional argument) follows
//! `spec.md` §4.8/§6 rather than the older two-slot layout in that source.
//!
//! Never logs to stdout/stderr/stdin — those are the server's inherited
//! standard I/O, and contaminating them would break the host's IPC. A
//! debug trace is written to the file named by `ATTENDANT_RELAY_LOG`, if
//! set, purely for field debugging.

use std::env;
use std::ffi::CString;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::os::unix::io::RawFd;
use std::path::Path;

use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::unistd::{execv, write};

use attendant_common::{encode_status, AttendantError};

fn trace(msg: &str) {
    if let Ok(path) = env::var("ATTENDANT_RELAY_LOG") {
        if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
            let _ = writeln!(file, "[attendant-relay {}] {}", std::process::id(), msg);
        }
    }
}

/// Reads `argv[1]` as the status pipe fd and performs the two-echo
/// handshake: first to stdout (proves the kernel handed us the argv the
/// launcher worker built), then to the status pipe itself (proves the
/// channel is alive). `exit(127)` on any failure here — too early in the
/// protocol to use the status pipe at all.
fn handshake(args: &[String]) -> RawFd {
    let Some(raw) = args.get(1) else {
        std::process::exit(127);
    };
    let Ok(status_fd) = raw.parse::<RawFd>() else {
        std::process::exit(127);
    };
    if status_fd <= 0 {
        std::process::exit(127);
    }

    let bytes = (status_fd as i32).to_ne_bytes();
    if write(libc::STDOUT_FILENO, &bytes).is_err() {
        std::process::exit(127);
    }
    if write(status_fd, &bytes).is_err() {
        std::process::exit(127);
    }
    status_fd
}

fn send_error(status_fd: RawFd, domain: AttendantError) -> ! {
    let os_code = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
    let message = encode_status(domain.domain_code(), os_code);
    let _ = write(status_fd, &message);
    std::process::exit(libc::EXIT_FAILURE);
}

/// `argv[2]` is the canary slot (kept open across the coming cloexec sweep
/// and the final exec, so the server itself — not just this relay — holds
/// it open); `argv[3]` is the server's own absolute path; everything after
/// is its argv.
fn verify_arguments(args: &[String], status_fd: RawFd) -> (RawFd, &str) {
    let Some(canary_raw) = args.get(2) else {
        send_error(status_fd, AttendantError::RelayProgramMissing);
    };
    let Ok(canary_fd) = canary_raw.parse::<RawFd>() else {
        send_error(status_fd, AttendantError::RelayProgramMissing);
    };
    let Some(server_path) = args.get(3) else {
        send_error(status_fd, AttendantError::RelayProgramMissing);
    };
    if !server_path.starts_with('/') {
        send_error(status_fd, AttendantError::RelayProgramPathNotAbsolute);
    }
    (canary_fd, server_path.as_str())
}

/// Resets every signal currently disposed `SIG_IGN` back to `SIG_DFL`. A
/// host application that masked signals before loading the plugin must not
/// hand that disposition down to the server program; `SIGKILL`/`SIGSTOP`
/// cannot be queried or changed and are skipped. Uses raw `libc::sigaction`
/// with a null new-action pointer to *query* the current disposition
/// without altering it, exactly as `original_source/relay.c`'s
/// `reset_signals` does with `sigaction(signum, NULL, &sig)`; `nix`'s
/// wrapper has no query-only form.
fn reset_ignored_signals() {
    for signum in 1..libc::NSIG {
        if signum == libc::SIGKILL || signum == libc::SIGSTOP {
            continue;
        }
        unsafe {
            let mut current: libc::sigaction = std::mem::zeroed();
            if libc::sigaction(signum, std::ptr::null(), &mut current) != 0 {
                continue;
            }
            if current.sa_sigaction == libc::SIG_IGN {
                let mut dfl: libc::sigaction = std::mem::zeroed();
                dfl.sa_sigaction = libc::SIG_DFL;
                libc::sigemptyset(&mut dfl.sa_mask);
                let _ = libc::sigaction(signum, &dfl, std::ptr::null_mut());
            }
        }
    }
}

/// Sets `FD_CLOEXEC` on every fd discovered under `/proc/self/fd` except
/// stdin/stdout/stderr, the canary fd, and (deliberately, per `spec.md`
/// §4.8) the status pipe itself — its closure on the exec below is the
/// "done, and it worked" signal the launcher worker's handshake step 6d is
/// blocked reading.
fn cloexec_sweep(status_fd: RawFd, canary_fd: RawFd) {
    let dir = match std::fs::read_dir("/proc/self/fd") {
        Ok(dir) => dir,
        Err(_) => {
            trace("cannot enumerate /proc/self/fd, continuing without a cloexec sweep");
            return;
        }
    };
    for entry in dir.flatten() {
        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            continue;
        };
        let Ok(fd) = name.parse::<RawFd>() else {
            continue;
        };
        if matches!(fd, 0 | 1 | 2) || fd == canary_fd || fd == status_fd {
            continue;
        }
        let _ = fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC));
    }
}

/// Set `FD_CLOEXEC` on the status pipe itself, after the general sweep
/// excluded it. Must happen last, right before `execv`.
fn arm_status_pipe_cloexec(status_fd: RawFd) {
    let _ = fcntl(status_fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC));
}

fn execute(server_path: &str, server_argv: &[String], status_fd: RawFd) -> ! {
    let Ok(path) = CString::new(server_path) else {
        send_error(status_fd, AttendantError::RelayProgramPathNotAbsolute);
    };
    let mut argv = Vec::with_capacity(server_argv.len() + 1);
    argv.push(path.clone());
    for arg in server_argv {
        match CString::new(arg.as_str()) {
            Ok(c) => argv.push(c),
            Err(_) => send_error(status_fd, AttendantError::RelayCannotExec),
        }
    }

    let _ = execv(&path, &argv);
    // execv only returns on failure.
    send_error(status_fd, AttendantError::RelayCannotExec)
}

fn main() {
    let args: Vec<String> = env::args().collect();
    trace(&format!("invoked with {} arguments", args.len()));

    let status_fd = handshake(&args);
    let (canary_fd, server_path) = verify_arguments(&args, status_fd);

    if !Path::new(server_path).exists() {
        trace(&format!("server path {server_path} does not exist, letting execv report it"));
    }

    reset_ignored_signals();
    cloexec_sweep(status_fd, canary_fd);
    arm_status_pipe_cloexec(status_fd);

    let server_argv = if args.len() > 4 { &args[4..] } else { &[] };
    execute(server_path, server_argv, status_fd);
}
