#![allow(dead_code)]

use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use concord_core::ThreadSignal;
use tracing::Level;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .with_test_writer()
        .try_init();
}

// Spawns a thread and returns its signal handle, so the test can interrupt it.
//
pub fn spawn_with_signal<F, R>(f: F) -> (JoinHandle<R>, ThreadSignal)
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    let (sender, receiver) = mpsc::channel();

    let handle = thread::spawn(move || {
        sender.send(ThreadSignal::current()).unwrap();
        f()
    });

    let signal = receiver.recv().unwrap();

    (handle, signal)
}

// Polls until the predicate holds, failing the test after a few seconds.
//
pub fn eventually(mut predicate: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);

    while !predicate() {
        assert!(Instant::now() < deadline, "condition was not reached in time");
        thread::sleep(Duration::from_millis(1));
    }
}
