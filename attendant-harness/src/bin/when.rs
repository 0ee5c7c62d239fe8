//! `when` — a well-behaved fixture server, named for the scenario it plays
//! in `spec.md` §8's end-to-end walkthroughs ("start `./t/bin/when`").
//!
//! Speaks a tiny newline-delimited protocol over the stdio pipes the
//! attendant's connector callback hands to the host: this is the "host's
//! own IPC channel" the spec treats as an external collaborator. Mirrors
//! `original_source/src/t/server.c`'s well-behaved test server, minus the
//! fifo indirection (our harness talks directly over the redirected
//! stdin/stdout the connector already received).
//!
//! - `ping` replies with a token fixed at process startup, so a test can
//!   tell two instances apart by whether the token changed.
//! - `close` closes stdout, simulating IPC that silently breaks without
//!   the process itself exiting (what `retry()` exists to detect).
//! - `exit` (or EOF) ends the process normally — this is what the host
//!   application calls after `Attendant::shutdown()` returns `true`.

use std::io::{self, BufRead, Write};
use std::time::{SystemTime, UNIX_EPOCH};

fn main() {
    let token = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();

    let stdin = io::stdin();
    let mut stdout_open = true;

    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        match line.trim() {
            "ping" if stdout_open => {
                let mut out = io::stdout();
                if writeln!(out, "{token}").is_err() || out.flush().is_err() {
                    break;
                }
            }
            "close" if stdout_open => {
                // Closes the real fd 1, not just this process's buffered
                // handle onto it, so the attendant's parent-side read end
                // observes EOF the way a broken IPC channel would.
                let _ = nix::unistd::close(libc::STDOUT_FILENO);
                stdout_open = false;
            }
            "exit" => break,
            _ => {}
        }
    }
}
