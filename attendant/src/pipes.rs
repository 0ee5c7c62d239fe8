//! The fixed seven-pipe registry.
//!
//! `Stdin`/`Stdout`/`Stderr` are created once, at `initialize`, and their
//! parent-side fd numbers are preserved across every subsequent `start` by
//! `dup2`-ing a freshly created pipe onto the old number (`recycle`, in
//! `launcher.rs`). `Fork`/`Relay`/`Canary` are created fresh on every
//! `start`. `Reaper` is created once and never recreated or closed until
//! `destroy`.

use std::os::unix::io::RawFd;

use attendant_common::PipeRole;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::unistd::{close, pipe};

use crate::error::{AttendantError, Result};

/// A single pipe: `read` is the end the attendant (or the child, for
/// stdin) keeps; `write` is the end handed to or held by the other party.
#[derive(Debug, Clone, Copy)]
pub struct PipePair {
    pub read: RawFd,
    pub write: RawFd,
}

impl PipePair {
    pub fn close_read(&self) -> Result<()> {
        close(self.read).map_err(|_| AttendantError::CannotCloseStdinPipe)
    }

    pub fn close_write(&self) -> Result<()> {
        close(self.write).map_err(|_| AttendantError::CannotCloseStdinPipe)
    }
}

pub fn creation_error(role: PipeRole) -> AttendantError {
    match role {
        PipeRole::Stdin => AttendantError::CannotCreateStdinPipe,
        PipeRole::Stdout => AttendantError::CannotCreateStdoutPipe,
        PipeRole::Stderr => AttendantError::CannotCreateStderrPipe,
        PipeRole::Fork => AttendantError::CannotCreateForkPipe,
        PipeRole::Relay => AttendantError::CannotCreateRelayPipe,
        PipeRole::Canary => AttendantError::CannotCreateCanaryPipe,
        PipeRole::Reaper => AttendantError::CannotCreateReaperPipe,
    }
}

/// Create a pipe for `role` and apply the close-on-exec pattern the
/// original implementation uses: for every pipe except `Stdin`, the read
/// end is close-on-exec (so the attendant's own end never leaks into a
/// grandchild); the write ends of `Stdin` and `Fork` are additionally
/// close-on-exec (so the relay's close-on-exec sweep is not the only line
/// of defense for those two).
pub fn create_pipe(role: PipeRole) -> Result<PipePair> {
    let (read, write) = pipe().map_err(|_| creation_error(role))?;

    if !matches!(role, PipeRole::Stdin) {
        set_cloexec(read).map_err(|_| creation_error(role))?;
    }
    if matches!(role, PipeRole::Stdin | PipeRole::Fork | PipeRole::Reaper) {
        set_cloexec(write).map_err(|_| creation_error(role))?;
    }

    Ok(PipePair { read, write })
}

pub fn set_cloexec(fd: RawFd) -> nix::Result<()> {
    fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map(|_| ())
}

/// Close a pipe end, tolerating it already being closed (EBADF), which
/// happens legitimately on cleanup paths that race with a child's own
/// close-on-exec.
pub fn close_quietly(fd: RawFd) {
    let _ = close(fd);
}
