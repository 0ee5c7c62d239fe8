//! Host-supplied capability traits.
//!
//! The original C API takes two bare function pointers, `starter_t` and
//! `connector_t`, and leaves a single comment ("be sure to be thread-safe")
//! to cover the fact that both are invoked from the launcher worker thread,
//! never from the thread that called `start`. Rust lets us put that
//! contract in the type system instead of a comment: both traits require
//! `Send + Sync`, so a caller cannot hand over a callback relying on
//! thread-local or unsynchronized state.

use std::os::unix::io::RawFd;

/// Invoked from the reaper thread after the server process has terminated,
/// to decide whether it should be relaunched. `restart` is always `true`:
/// `spec.md` §4.5 only ever calls this once per detected termination, never
/// for the initial launch, so the argument exists to mirror the original
/// C callback's signature rather than to distinguish call sites.
pub trait Starter: Send + Sync {
    fn on_start(&self, restart: bool);
}

/// Invoked once the relay has confirmed the server process exec'd
/// successfully, with the parent-side stdin (write) and stdout (read)
/// pipe file descriptors, so the host can wire up its own IPC protocol
/// over them.
pub trait Connector: Send + Sync {
    fn on_connect(&self, stdin_write: RawFd, stdout_read: RawFd);
}

/// A `Starter`/`Connector` pair that does nothing, for hosts that only
/// need standard I/O and no startup hook.
pub struct NoopCallbacks;

impl Starter for NoopCallbacks {
    fn on_start(&self, _restart: bool) {}
}

impl Connector for NoopCallbacks {
    fn on_connect(&self, _stdin_write: RawFd, _stdout_read: RawFd) {}
}
