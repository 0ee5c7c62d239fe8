//! Wire protocol and error catalog shared by `attendant` and `attendant-relay`.
//!
//! Neither the supervisor nor the relay binary ever need the other's source
//! tree, only this crate: the pipe roles, the status-message encoding, and
//! the error codes that travel over the status pipe.

use std::fmt;

/// The seven pipes the attendant ever creates. `Stdin`/`Stdout`/`Stderr` are
/// long lived: their parent-side fd numbers stay stable across restarts so a
/// host can cache them. `Fork`/`Relay`/`Canary` are recreated on every
/// `start`. `Reaper` lives for the whole lifetime of the attendant and is
/// never inherited by any child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipeRole {
    Stdin,
    Stdout,
    Stderr,
    Fork,
    Relay,
    Canary,
    Reaper,
}

impl fmt::Display for PipeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PipeRole::Stdin => "stdin",
            PipeRole::Stdout => "stdout",
            PipeRole::Stderr => "stderr",
            PipeRole::Fork => "fork",
            PipeRole::Relay => "relay",
            PipeRole::Canary => "canary",
            PipeRole::Reaper => "reaper",
        };
        f.write_str(s)
    }
}

/// Argv layout the launcher worker builds and the relay parses.
/// `[relay_path, status_fd, canary_slot, server_path, ...server_argv]`.
pub const RELAY_ARGV_STATUS_FD_INDEX: usize = 1;
pub const RELAY_ARGV_CANARY_SLOT_INDEX: usize = 2;
pub const RELAY_ARGV_SERVER_PATH_INDEX: usize = 3;
pub const RELAY_ARGV_FIXED_LEN: usize = 4;

/// A status-pipe message is two native-endian `i32`s: `(domain_code,
/// os_errno)`, matching the original relay's `int message[2]` wire format.
pub const STATUS_MESSAGE_LEN: usize = 8;

pub fn encode_status(domain_code: i32, os_errno: i32) -> [u8; STATUS_MESSAGE_LEN] {
    let mut buf = [0u8; STATUS_MESSAGE_LEN];
    buf[0..4].copy_from_slice(&domain_code.to_ne_bytes());
    buf[4..8].copy_from_slice(&os_errno.to_ne_bytes());
    buf
}

pub fn decode_status(buf: &[u8; STATUS_MESSAGE_LEN]) -> (i32, i32) {
    let domain_code = i32::from_ne_bytes(buf[0..4].try_into().unwrap());
    let os_errno = i32::from_ne_bytes(buf[4..8].try_into().unwrap());
    (domain_code, os_errno)
}

/// The full, disjoint error catalog. Every variant corresponds to exactly
/// one original ad hoc `errors.h` code or one gap the distillation exposed
/// (handshake assertions, reaper anomalies); none are derived by adding an
/// offset to another variant's value the way the original's
/// `RELAY_*` codes were laid out relative to `START_*`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[repr(i32)]
pub enum AttendantError {
    // --- Configuration ---
    #[error("start called while the attendant is already running")]
    AlreadyRunning = 1,
    #[error("canary slot must be a non-negative file descriptor number")]
    InvalidCanarySlot = 3,
    #[error("relay path must be an absolute path")]
    RelayPathNotAbsolute = 4,
    #[error("initialize requires a starter callback")]
    InitStarterRequired = 5,
    #[error("initialize requires a connector callback")]
    InitConnectorRequired = 6,

    // --- Resource exhaustion (pipe creation) ---
    #[error("cannot create stdin pipe")]
    CannotCreateStdinPipe = 10,
    #[error("cannot create stdout pipe")]
    CannotCreateStdoutPipe = 11,
    #[error("cannot create stderr pipe")]
    CannotCreateStderrPipe = 12,
    #[error("cannot create fork pipe")]
    CannotCreateForkPipe = 13,
    #[error("cannot create relay pipe")]
    CannotCreateRelayPipe = 14,
    #[error("cannot create canary pipe")]
    CannotCreateCanaryPipe = 15,
    #[error("cannot create reaper pipe")]
    CannotCreateReaperPipe = 16,

    // --- Exec failure ---
    #[error("cannot fork")]
    CannotFork = 20,
    #[error("cannot spawn reaper thread")]
    CannotSpawnReaperThread = 21,
    #[error("cannot spawn launcher thread")]
    CannotSpawnLauncherThread = 2,
    #[error("cannot close stdin pipe in child")]
    CannotCloseStdinPipe = 22,
    #[error("cannot close stdout pipe in child")]
    CannotCloseStdoutPipe = 23,
    #[error("cannot close stderr pipe in child")]
    CannotCloseStderrPipe = 24,
    #[error("relay program cannot be exec'd")]
    CannotExecRelay = 28,
    #[error("cannot duplicate stdin pipe onto fd 0")]
    CannotDupStdinPipe = 25,
    #[error("cannot duplicate stdout pipe onto fd 1")]
    CannotDupStdoutPipe = 26,
    #[error("cannot duplicate stderr pipe onto fd 2")]
    CannotDupStderrPipe = 27,

    // --- Relay / handshake assertion failures (sent over the status pipe) ---
    #[error("relay program path is missing")]
    RelayProgramMissing = 30,
    #[error("relay program path is not absolute")]
    RelayProgramPathNotAbsolute = 31,
    #[error("relay cannot enumerate its open file descriptors")]
    RelayCannotOpenProcFd = 32,
    #[error("relay cannot exec the server program")]
    RelayCannotExec = 33,
    #[error("launcher received an unexpected status pipe message")]
    HandshakeUnexpectedStatus = 34,
    #[error("fork pipe hung up before the handshake completed")]
    HandshakeForkPipeHungupEarly = 35,
    #[error("status pipe fd echoed by the relay did not match what was sent")]
    HandshakeStatusPipeFdMismatch = 36,

    // --- Reaper anomalies ---
    #[error("reaper observed an unexpected event on the canary pipe")]
    ReaperUnexpectedCanaryPipeEvent = 40,
    #[error("reaper observed an unexpected event on the reaper pipe")]
    ReaperUnexpectedReaperPipeEvent = 41,
    #[error("waitpid failed in the reaper thread")]
    ReaperWaitFailed = 42,
    #[error("reaper could not read the reaper command pipe")]
    ReaperCannotReadReaperPipe = 43,
    #[error("reaper read a truncated message from the reaper command pipe")]
    ReaperTruncatedReaperPipeRead = 44,
}

impl AttendantError {
    pub fn domain_code(self) -> i32 {
        self as i32
    }
}

/// `(domain_code, os_code)` pair, as returned by `Attendant::errors()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorPair {
    pub domain: AttendantError,
    pub os_code: i32,
}

impl ErrorPair {
    pub fn new(domain: AttendantError, os_code: i32) -> Self {
        Self { domain, os_code }
    }
}

impl fmt::Display for ErrorPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (os error {})", self.domain, self.os_code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips() {
        let encoded = encode_status(AttendantError::RelayCannotExec.domain_code(), 2);
        let (code, errno) = decode_status(&encoded);
        assert_eq!(code, AttendantError::RelayCannotExec.domain_code());
        assert_eq!(errno, 2);
    }

    #[test]
    fn codes_are_disjoint() {
        let codes = [
            AttendantError::AlreadyRunning.domain_code(),
            AttendantError::CannotCreateStdinPipe.domain_code(),
            AttendantError::CannotFork.domain_code(),
            AttendantError::RelayProgramMissing.domain_code(),
            AttendantError::ReaperUnexpectedCanaryPipeEvent.domain_code(),
        ];
        let mut sorted = codes.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), codes.len());
    }
}
