//! The fixed seven-pipe registry (`spec` §3's Pipe registry entity).
//!
//! STDIN/STDOUT/STDERR keep a stable parent-side fd across restarts via
//! `recycle`; FORK/RELAY/CANARY are recreated on every launch; REAPER is
//! created once, in `Registry::new`, and lives until `destroy`.

use std::os::unix::io::RawFd;

use attendant_common::PipeRole;
use nix::unistd::dup2;

use crate::error::Result;
use crate::pipes::{self, PipePair};

/// Which end of a freshly created pipe gets `dup2`'d onto the preserved,
/// caller-visible fd.
#[derive(Debug, Clone, Copy)]
enum StableEnd {
    Read,
    Write,
}

/// Replaces the pipe behind `preserved_fd`, keeping `preserved_fd`'s
/// numeric identity, and returns the transient fd on the other end.
/// Mirrors `recycle()` in the original POSIX source, including its
/// re-application of `FD_CLOEXEC` to the preserved fd: `dup2` never
/// carries the source fd's close-on-exec flag to its target, so without
/// this the attendant's own long-lived stdio handles would leak into
/// every child forked after the first restart.
fn recycle(role: PipeRole, preserved_fd: RawFd, stable: StableEnd) -> Result<RawFd> {
    let pair = pipes::create_pipe(role)?;
    let (stable_new, transient_new) = match stable {
        StableEnd::Read => (pair.read, pair.write),
        StableEnd::Write => (pair.write, pair.read),
    };
    dup2(stable_new, preserved_fd).map_err(|_| pipes::creation_error(role))?;
    pipes::close_quietly(stable_new);
    pipes::set_cloexec(preserved_fd).map_err(|_| pipes::creation_error(role))?;
    Ok(transient_new)
}

pub struct Registry {
    /// Parent-owned write end, stable across restarts.
    pub stdin_write: RawFd,
    /// Child-owned read end, replaced every launch.
    pub stdin_read: RawFd,

    /// Parent-owned read end, stable across restarts.
    pub stdout_read: RawFd,
    /// Child-owned write end, replaced every launch.
    pub stdout_write: RawFd,

    pub stderr_read: RawFd,
    pub stderr_write: RawFd,

    /// Per-launch pipes. `None` outside of an in-flight launch.
    ///
    /// `relay`'s read end is deliberately left open across a successful
    /// launch: the launcher keeps reading it for as long as the server
    /// runs only indirectly (it doesn't), but the original never closed
    /// its parent-side status-pipe read end right after the handshake
    /// either — `close_pipes()` sweeps any still-open FORK/RELAY/CANARY
    /// fds at the top of the *next* `start()` instead. `start()` must call
    /// `close_launch_pipes` before `create_launch_pipes` to reproduce that.
    pub fork: Option<PipePair>,
    pub relay: Option<PipePair>,
    pub canary: Option<PipePair>,

    /// Lifetime pipe: host writes commands, reaper worker reads them.
    /// Never inherited by any child.
    pub reaper_read: RawFd,
    pub reaper_write: RawFd,
}

impl Registry {
    pub fn new() -> Result<Self> {
        let stdin = pipes::create_pipe(PipeRole::Stdin)?;
        let stdout = pipes::create_pipe(PipeRole::Stdout)?;
        let stderr = pipes::create_pipe(PipeRole::Stderr)?;
        let reaper = pipes::create_pipe(PipeRole::Reaper)?;

        Ok(Self {
            stdin_write: stdin.write,
            stdin_read: stdin.read,
            stdout_read: stdout.read,
            stdout_write: stdout.write,
            stderr_read: stderr.read,
            stderr_write: stderr.write,
            fork: None,
            relay: None,
            canary: None,
            reaper_read: reaper.read,
            reaper_write: reaper.write,
        })
    }

    /// Launcher worker step 2: recycle the three stdio pipes, preserving
    /// the parent-visible fd numbers.
    pub fn recycle_stdio(&mut self) -> Result<()> {
        self.stdin_read = recycle(PipeRole::Stdin, self.stdin_write, StableEnd::Write)?;
        self.stdout_write = recycle(PipeRole::Stdout, self.stdout_read, StableEnd::Read)?;
        self.stderr_write = recycle(PipeRole::Stderr, self.stderr_read, StableEnd::Read)?;
        Ok(())
    }

    /// Launcher worker step 3: create FORK, RELAY, CANARY fresh.
    pub fn create_launch_pipes(&mut self) -> Result<()> {
        self.fork = Some(pipes::create_pipe(PipeRole::Fork)?);
        self.relay = Some(pipes::create_pipe(PipeRole::Relay)?);
        self.canary = Some(pipes::create_pipe(PipeRole::Canary)?);
        Ok(())
    }

    /// Close the parent's view of the per-launch pipes' child ends, after
    /// fork, in the parent.
    pub fn close_launch_child_ends(&mut self) {
        pipes::close_quietly(self.stdin_read);
        pipes::close_quietly(self.stdout_write);
        pipes::close_quietly(self.stderr_write);
        if let Some(p) = self.fork.take() {
            pipes::close_quietly(p.write);
        }
        if let Some(p) = self.relay.as_ref() {
            pipes::close_quietly(p.write);
        }
        if let Some(p) = self.canary.take() {
            pipes::close_quietly(p.write);
        }
    }

    /// Close whatever per-launch pipes remain open, on a failed launch.
    pub fn close_launch_pipes(&mut self) {
        if let Some(p) = self.fork.take() {
            pipes::close_quietly(p.read);
            pipes::close_quietly(p.write);
        }
        if let Some(p) = self.relay.take() {
            pipes::close_quietly(p.read);
            pipes::close_quietly(p.write);
        }
        if let Some(p) = self.canary.take() {
            pipes::close_quietly(p.read);
            pipes::close_quietly(p.write);
        }
    }

    /// Final teardown, called from `destroy`.
    pub fn close_all(&mut self) {
        self.close_launch_pipes();
        pipes::close_quietly(self.stdin_write);
        pipes::close_quietly(self.stdin_read);
        pipes::close_quietly(self.stdout_read);
        pipes::close_quietly(self.stdout_write);
        pipes::close_quietly(self.stderr_read);
        pipes::close_quietly(self.stderr_write);
        pipes::close_quietly(self.reaper_read);
        pipes::close_quietly(self.reaper_write);
    }
}
