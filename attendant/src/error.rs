//! Error catalog re-export and the "first writer wins" last-error slot.

use std::sync::Mutex;

pub use attendant_common::{AttendantError, ErrorPair};

pub type Result<T> = std::result::Result<T, AttendantError>;

/// Holds the first error recorded since the last `start()`, plus its
/// `errno`. Subsequent errors in the same `start()` attempt are dropped —
/// the first failure is almost always the root cause, and is what the
/// original's `set_error`/`FAIL` macros preserved by simply never
/// overwriting `process.errors` once set.
#[derive(Debug, Default)]
pub struct LastError(Mutex<Option<ErrorPair>>);

impl LastError {
    pub fn new() -> Self {
        Self(Mutex::new(None))
    }

    /// Reset at the top of every `start()` call.
    pub fn reset(&self) {
        *self.0.lock().expect("last error mutex poisoned") = None;
    }

    /// Record `domain` with the OS error currently in `errno`, unless an
    /// error has already been recorded this attempt.
    pub fn record(&self, domain: AttendantError) {
        self.record_with(domain, nix::errno::errno());
    }

    pub fn record_with(&self, domain: AttendantError, os_code: i32) {
        let mut guard = self.0.lock().expect("last error mutex poisoned");
        if guard.is_none() {
            *guard = Some(ErrorPair::new(domain, os_code));
        }
    }

    pub fn get(&self) -> Option<ErrorPair> {
        *self.0.lock().expect("last error mutex poisoned")
    }

    pub fn is_set(&self) -> bool {
        self.0.lock().expect("last error mutex poisoned").is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_writer_wins() {
        let last = LastError::new();
        last.record_with(AttendantError::CannotFork, 12);
        last.record_with(AttendantError::CannotCreateStdinPipe, 99);
        let pair = last.get().unwrap();
        assert_eq!(pair.domain, AttendantError::CannotFork);
        assert_eq!(pair.os_code, 12);
    }

    #[test]
    fn reset_clears() {
        let last = LastError::new();
        last.record_with(AttendantError::CannotFork, 1);
        last.reset();
        assert!(!last.is_set());
    }
}
