//! End-to-end scenarios from `spec.md` §8, driven against the real
//! `attendant-relay` binary and the `when`/`crasher` fixture servers built
//! by this crate — the same shape as the teacher's `conmon-rs-tests`,
//! which drives the real `conmon-server`/`conmon-client` binaries rather
//! than mocking them.

use std::env;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, OnceLock};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use attendant::{Attendant, Connector, Initializer, Starter};
use nix::unistd::write as nix_write;

/// Locates sibling binaries built into the same `target/{debug,release}`
/// directory as the test binary itself. Lifted from `conmon-rs-tests`'
/// `cargo_dir`, which in turn credits Cargo's own test support.
fn cargo_dir() -> PathBuf {
    env::var_os("CARGO_BIN_PATH")
        .map(PathBuf::from)
        .or_else(|| {
            env::current_exe().ok().map(|mut path| {
                path.pop();
                if path.ends_with("deps") {
                    path.pop();
                }
                path
            })
        })
        .unwrap_or_else(|| panic!("could not find CARGO_BIN_PATH directory"))
}

fn relay_path() -> String {
    cargo_dir()
        .join("attendant-relay")
        .to_str()
        .expect("relay path is utf8")
        .to_owned()
}

fn fixture(name: &str) -> String {
    cargo_dir()
        .join(name)
        .to_str()
        .expect("fixture path is utf8")
        .to_owned()
}

fn when_path() -> String {
    fixture("attendant-harness-when")
}

fn crasher_path() -> String {
    fixture("attendant-harness-crasher")
}

/// Captures the parent-side stdio pipes handed to the most recent
/// `on_connect` call, so tests can drive the fixture server's own
/// newline protocol.
#[derive(Default)]
struct CapturingConnector {
    pipes: Mutex<Option<(RawFd, RawFd)>>,
}

impl Connector for CapturingConnector {
    fn on_connect(&self, stdin_write: RawFd, stdout_read: RawFd) {
        *self.pipes.lock().expect("pipes mutex poisoned") = Some((stdin_write, stdout_read));
    }
}

impl CapturingConnector {
    fn pipes(&self) -> (RawFd, RawFd) {
        self.pipes
            .lock()
            .expect("pipes mutex poisoned")
            .expect("connector has not been invoked yet")
    }
}

fn send_line(fd: RawFd, line: &str) -> Result<()> {
    let mut buf = line.as_bytes().to_vec();
    buf.push(b'\n');
    nix_write(fd, &buf).context("write to fixture stdin")?;
    Ok(())
}

/// Restarts into a fixed `(path, argv)` up to `budget` times, then lets
/// the attendant latch terminal shutdown. Needs the `Attendant` handle it
/// is itself registered on, which doesn't exist yet at construction time —
/// `set_attendant` wires it up right after `initialize` returns, exactly
/// once, before any launch can reach the reaper thread that calls back in.
struct BoundedRestarter {
    attendant: OnceLock<Attendant>,
    budget: AtomicU32,
    next_path: String,
    next_argv: Vec<String>,
    calls: AtomicU32,
}

impl BoundedRestarter {
    fn new(budget: u32, next_path: String, next_argv: Vec<String>) -> Self {
        Self {
            attendant: OnceLock::new(),
            budget: AtomicU32::new(budget),
            next_path,
            next_argv,
            calls: AtomicU32::new(0),
        }
    }

    fn set_attendant(&self, attendant: Attendant) {
        self.attendant
            .set(attendant)
            .unwrap_or_else(|_| panic!("attendant already set"));
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Starter for BoundedRestarter {
    fn on_start(&self, restart: bool) {
        assert!(restart, "starter is only ever invoked after a termination");
        self.calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.budget.load(Ordering::SeqCst);
        if remaining == 0 {
            return;
        }
        self.budget.store(remaining - 1, Ordering::SeqCst);
        let attendant = self
            .attendant
            .get()
            .expect("attendant registered before any restart")
            .clone();
        let _ = attendant.start(self.next_path.clone(), self.next_argv.clone());
    }
}

fn initialize(
    relay: String,
    starter: Box<dyn Starter>,
    connector: Box<dyn Connector>,
) -> attendant::Result<Attendant> {
    Attendant::initialize(Initializer {
        starter: Some(starter),
        connector: Some(connector),
        relay_path: relay,
        canary_slot: 31,
    })
}

/// Scenario 1: orderly shutdown of a well-behaved server.
#[test]
fn orderly_shutdown() {
    let connector = std::sync::Arc::new(CapturingConnector::default());
    let starter = std::sync::Arc::new(BoundedRestarter::new(0, when_path(), vec![]));

    let attendant = initialize(
        relay_path(),
        Box::new(NoopStarter(starter.clone())),
        Box::new(ForwardingConnector(connector.clone())),
    )
    .expect("initialize");
    starter.set_attendant(attendant.clone());

    attendant
        .start(when_path(), vec![])
        .expect("start when fixture");
    assert!(attendant.ready(), "server should come up");
    assert!(attendant.shutdown(), "server should still be running");

    let (stdin_write, _stdout_read) = connector.pipes();
    send_line(stdin_write, "exit").expect("tell fixture to exit");

    assert!(attendant.done(30_000), "server should exit within 30s");
    attendant.destroy();
}

/// Scenario 2: an unplanned crash triggers exactly one starter
/// invocation, which restarts into a well-behaved server.
#[test]
fn crash_and_restart() {
    let connector = std::sync::Arc::new(CapturingConnector::default());
    let starter = std::sync::Arc::new(BoundedRestarter::new(1, when_path(), vec![]));

    let attendant = initialize(
        relay_path(),
        Box::new(NoopStarter(starter.clone())),
        Box::new(ForwardingConnector(connector.clone())),
    )
    .expect("initialize");
    starter.set_attendant(attendant.clone());

    attendant
        .start(crasher_path(), vec![])
        .expect("start crasher fixture");

    assert!(attendant.ready(), "restarted server should come up");
    assert_eq!(starter.calls(), 1, "starter invoked exactly once");

    assert!(attendant.shutdown());
    let (stdin_write, _stdout_read) = connector.pipes();
    send_line(stdin_write, "exit").expect("tell fixture to exit");
    assert!(attendant.done(30_000));
    attendant.destroy();
}

/// Scenario 3: `scram` forces an immediate kill when an orderly shutdown
/// would otherwise hang because the caller never told the server to exit.
#[test]
fn scram_path() {
    let connector = std::sync::Arc::new(CapturingConnector::default());
    let starter = std::sync::Arc::new(BoundedRestarter::new(0, when_path(), vec![]));

    let attendant = initialize(
        relay_path(),
        Box::new(NoopStarter(starter.clone())),
        Box::new(ForwardingConnector(connector.clone())),
    )
    .expect("initialize");
    starter.set_attendant(attendant.clone());

    attendant.start(when_path(), vec![]).expect("start");
    assert!(attendant.ready());
    assert!(attendant.shutdown(), "server still alive at shutdown");

    assert!(
        !attendant.done(250),
        "nothing told the server to exit yet, so done must not return early"
    );

    assert!(attendant.scram(), "scram observes the server still alive");
    assert!(attendant.done(-1), "scram's SIGKILL must unblock done");
    attendant.destroy();
}

/// Scenario 4: two threads independently notice the same broken IPC
/// (server closed its end) and both call `retry`; exactly one restart
/// results, and both calls eventually return `true`.
#[test]
fn retry_collapses_concurrent_callers() {
    let connector = std::sync::Arc::new(CapturingConnector::default());
    let starter = std::sync::Arc::new(BoundedRestarter::new(1, when_path(), vec![]));

    let attendant = initialize(
        relay_path(),
        Box::new(NoopStarter(starter.clone())),
        Box::new(ForwardingConnector(connector.clone())),
    )
    .expect("initialize");
    starter.set_attendant(attendant.clone());

    attendant.start(when_path(), vec![]).expect("start");
    assert!(attendant.ready());

    let (stdin_write, _) = connector.pipes();
    send_line(stdin_write, "close").expect("break the fixture's stdout");
    thread::sleep(Duration::from_millis(100));

    let a1 = attendant.clone();
    let a2 = attendant.clone();
    let t1 = thread::spawn(move || a1.retry(1_000));
    let t2 = thread::spawn(move || a2.retry(1_000));

    let r1 = t1.join().expect("thread 1 joins");
    let r2 = t2.join().expect("thread 2 joins");

    assert!(r1 && r2, "both callers observe the restarted instance");
    assert_eq!(
        starter.calls(),
        1,
        "only one of the two concurrent retries may trigger a restart"
    );

    assert!(attendant.shutdown());
    let (stdin_write, _) = connector.pipes();
    send_line(stdin_write, "exit").expect("tell fixture to exit");
    assert!(attendant.done(30_000));
    attendant.destroy();
}

/// Scenario 5: the starter declines to restart after a crash; `ready`
/// reports the terminal shutdown instead of hanging.
#[test]
fn starter_refuses_restart() {
    let connector = std::sync::Arc::new(CapturingConnector::default());
    let starter = std::sync::Arc::new(BoundedRestarter::new(0, when_path(), vec![]));

    let attendant = initialize(
        relay_path(),
        Box::new(NoopStarter(starter.clone())),
        Box::new(ForwardingConnector(connector.clone())),
    )
    .expect("initialize");
    starter.set_attendant(attendant.clone());

    attendant
        .start(crasher_path(), vec![])
        .expect("start crasher fixture");

    assert!(!attendant.ready(), "no restart was attempted");
    assert_eq!(starter.calls(), 1);
    attendant.destroy();
}

/// Scenario 6: the relay path itself is wrong. `start` still returns
/// successfully (the failure is discovered asynchronously in the launcher
/// worker); the starter still fires once, and `errors()` reports the
/// relay-exec failure.
#[test]
fn missing_relay_binary() {
    let connector = std::sync::Arc::new(CapturingConnector::default());
    let starter = std::sync::Arc::new(BoundedRestarter::new(0, when_path(), vec![]));

    let attendant = initialize(
        "/nonexistent/attendant-relay-that-does-not-exist".to_owned(),
        Box::new(NoopStarter(starter.clone())),
        Box::new(ForwardingConnector(connector.clone())),
    )
    .expect("initialize");
    starter.set_attendant(attendant.clone());

    attendant
        .start(when_path(), vec![])
        .expect("start returns before the launch has even been attempted");

    assert!(!attendant.ready(), "the launch can never succeed");
    assert_eq!(starter.calls(), 1);

    let error = attendant.errors().expect("an error was recorded");
    assert_eq!(error.domain, attendant::AttendantError::CannotExecRelay);
    attendant.destroy();
}

/// Thin `Starter`/`Connector` adaptors so each scenario can share one
/// `Arc`-held fixture between the `Box<dyn Trait>` the attendant owns and
/// the test code driving it.
struct NoopStarter(std::sync::Arc<BoundedRestarter>);
impl Starter for NoopStarter {
    fn on_start(&self, restart: bool) {
        self.0.on_start(restart)
    }
}

struct ForwardingConnector(std::sync::Arc<CapturingConnector>);
impl Connector for ForwardingConnector {
    fn on_connect(&self, stdin_write: RawFd, stdout_read: RawFd) {
        self.0.on_connect(stdin_write, stdout_read)
    }
}
