pub(crate) mod counter;

pub(crate) mod logging;

pub(crate) mod mem_log;

pub(crate) mod node;

pub(crate) mod transport;

use std::time::{Duration, Instant};

/// Poll `condition` until it holds, panicking with `what` if it does not within `timeout`.
pub(crate) fn wait_until(timeout: Duration, what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while !condition() {
        if Instant::now() > deadline {
            panic!("timed out waiting for: {what}");
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}
