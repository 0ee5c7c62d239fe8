//! `crasher` — a fixture server that exits immediately, simulating the
//! unplanned termination `spec.md` §8 scenario 2 ("crash and restart")
//! exercises: the reaper worker must observe the canary pipe hang up and
//! invoke the starter callback with `restart = true`.

fn main() {
    std::process::exit(1);
}
