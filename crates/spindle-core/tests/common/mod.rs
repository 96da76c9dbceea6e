//! Helpers shared by the integration tests

#![allow(dead_code)]

use spindle::{Runtime, RuntimeConfig};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

/// Upper bound for one runtime run before the watchdog stops it
pub const RUN_TIMEOUT: Duration = Duration::from_secs(30);

pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_test_writer()
        .try_init();
}

/// Runtime with `threads` workers and small stacks
pub fn runtime(threads: usize) -> Runtime {
    init_test_logging();
    Runtime::new(
        RuntimeConfig::default()
            .with_threads(threads)
            .with_stack_size(128 * 1024),
    )
}

/// Run until a fiber stops the runtime, failing the test if that takes
/// longer than [`RUN_TIMEOUT`].
pub fn run(runtime: &Runtime) {
    let handle = runtime.handle();
    let (done_tx, done_rx) = mpsc::channel::<()>();
    let watchdog = thread::spawn(move || {
        let timed_out = done_rx.recv_timeout(RUN_TIMEOUT).is_err();
        if timed_out {
            handle.stop();
        }
        timed_out
    });

    runtime.run().unwrap();
    let _ = done_tx.send(());
    let timed_out = watchdog.join().unwrap();
    assert!(!timed_out, "runtime did not stop within {:?}", RUN_TIMEOUT);
}

/// Countdown that stops the calling fiber's runtime when it reaches zero
pub struct StopAfter {
    remaining: AtomicUsize,
}

impl StopAfter {
    pub fn new(count: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(count),
        }
    }

    /// Count one completion; the last one stops the runtime
    pub fn done(&self) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            spindle::handle().unwrap().stop();
        }
    }

    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }
}

/// Yield `times` times in a row
pub fn yield_times(times: usize) {
    for _ in 0..times {
        spindle::yield_now().unwrap();
    }
}
