mod common;

use std::io;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use concord_core::{CoordinationError, CyclicBarrier, ThreadSignal, is_current_interrupted};
use rstest::rstest;
use serial_test::serial;

use common::{eventually, init_tracing, spawn_with_signal};

fn spawn_waiter(barrier: &Arc<CyclicBarrier>) -> thread::JoinHandle<Result<usize, CoordinationError>> {
    let barrier = Arc::clone(barrier);
    thread::spawn(move || barrier.wait())
}

// =============================================================================
// Tripping
// =============================================================================

#[test]
fn two_parties_trip_three_generations() {
    init_tracing();

    let trips = Arc::new(AtomicUsize::new(0));

    let barrier = {
        let trips = Arc::clone(&trips);
        Arc::new(
            CyclicBarrier::with_action(2, move || {
                trips.fetch_add(1, Ordering::SeqCst);
                Ok::<(), io::Error>(())
            })
            .unwrap(),
        )
    };

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                (0..3)
                    .map(|_| barrier.wait().unwrap())
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let indices: Vec<Vec<usize>> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    for generation in 0..3 {
        let mut arrivals = vec![indices[0][generation], indices[1][generation]];
        arrivals.sort();

        assert_eq!(vec![0, 1], arrivals);
    }

    assert_eq!(3, trips.load(Ordering::SeqCst));
    assert!(!barrier.is_broken());
    assert_eq!(0, barrier.number_waiting());
}

#[test]
fn single_party_trips_immediately() {
    let trips = Arc::new(AtomicUsize::new(0));

    let barrier = {
        let trips = Arc::clone(&trips);
        CyclicBarrier::with_action(1, move || {
            trips.fetch_add(1, Ordering::SeqCst);
            Ok::<(), io::Error>(())
        })
        .unwrap()
    };

    assert_eq!(0, barrier.wait().unwrap());
    assert_eq!(0, barrier.wait().unwrap());
    assert_eq!(2, trips.load(Ordering::SeqCst));
}

#[test]
fn action_runs_before_waiters_are_released() {
    let trips = Arc::new(AtomicUsize::new(0));

    let barrier = {
        let trips = Arc::clone(&trips);
        Arc::new(
            CyclicBarrier::with_action(3, move || {
                thread::sleep(Duration::from_millis(20));
                trips.fetch_add(1, Ordering::SeqCst);
                Ok::<(), io::Error>(())
            })
            .unwrap(),
        )
    };

    let handles: Vec<_> = (0..3)
        .map(|_| {
            let barrier = Arc::clone(&barrier);
            let trips = Arc::clone(&trips);
            thread::spawn(move || {
                barrier.wait().unwrap();
                trips.load(Ordering::SeqCst)
            })
        })
        .collect();

    for handle in handles {
        assert_eq!(1, handle.join().unwrap());
    }
}

#[test]
fn number_waiting_counts_arrivals() {
    let barrier = Arc::new(CyclicBarrier::new(3).unwrap());

    assert_eq!(3, barrier.parties());
    assert_eq!(0, barrier.number_waiting());

    let first = spawn_waiter(&barrier);
    eventually(|| barrier.number_waiting() == 1);

    let second = spawn_waiter(&barrier);
    eventually(|| barrier.number_waiting() == 2);

    assert_eq!(0, barrier.wait().unwrap());

    let mut indices = vec![first.join().unwrap().unwrap(), second.join().unwrap().unwrap()];
    indices.sort();

    assert_eq!(vec![1, 2], indices);
    assert_eq!(0, barrier.number_waiting());
}

#[test]
fn wait_timeout_beyond_clock_range_trips_normally() {
    let barrier = Arc::new(CyclicBarrier::new(2).unwrap());

    let waiter = {
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || barrier.wait_timeout(Duration::MAX))
    };
    eventually(|| barrier.number_waiting() == 1);

    assert_eq!(0, barrier.wait_timeout(Duration::MAX).unwrap());
    assert_eq!(1, waiter.join().unwrap().unwrap());

    assert!(!barrier.is_broken());
    assert_eq!(0, barrier.number_waiting());
}

// =============================================================================
// Construction
// =============================================================================

#[test]
fn zero_parties_is_rejected() {
    assert!(matches!(
        CyclicBarrier::new(0),
        Err(CoordinationError::InvalidArgument(_))
    ));
}

// =============================================================================
// Breaking
// =============================================================================

#[test]
fn timeout_breaks_barrier_for_everyone() {
    init_tracing();

    let barrier = Arc::new(CyclicBarrier::new(3).unwrap());

    let waiter = spawn_waiter(&barrier);
    eventually(|| barrier.number_waiting() == 1);

    let start = Instant::now();
    let result = barrier.wait_timeout(Duration::from_millis(30));

    assert!(matches!(result, Err(CoordinationError::Timeout)));
    assert!(start.elapsed() >= Duration::from_millis(30));

    assert!(matches!(
        waiter.join().unwrap(),
        Err(CoordinationError::BrokenBarrier)
    ));
    assert!(barrier.is_broken());

    // New arrivals fail until the barrier is reset.
    //
    assert!(matches!(barrier.wait(), Err(CoordinationError::BrokenBarrier)));

    barrier.reset();
    assert!(!barrier.is_broken());

    let handles: Vec<_> = (0..2).map(|_| spawn_waiter(&barrier)).collect();
    assert!(barrier.wait().is_ok());

    for handle in handles {
        assert!(handle.join().unwrap().is_ok());
    }
}

#[test]
fn zero_timeout_breaks_unless_last_to_arrive() {
    let barrier = Arc::new(CyclicBarrier::new(2).unwrap());

    assert!(matches!(
        barrier.wait_timeout(Duration::ZERO),
        Err(CoordinationError::Timeout)
    ));
    assert!(barrier.is_broken());

    barrier.reset();

    let waiter = spawn_waiter(&barrier);
    eventually(|| barrier.number_waiting() == 1);

    assert_eq!(0, barrier.wait_timeout(Duration::ZERO).unwrap());
    assert_eq!(1, waiter.join().unwrap().unwrap());
}

#[test]
fn reset_fails_current_waiters() {
    let barrier = Arc::new(CyclicBarrier::new(3).unwrap());

    let waiters: Vec<_> = (0..2).map(|_| spawn_waiter(&barrier)).collect();
    eventually(|| barrier.number_waiting() == 2);

    barrier.reset();

    for waiter in waiters {
        assert!(matches!(
            waiter.join().unwrap(),
            Err(CoordinationError::BrokenBarrier)
        ));
    }

    assert!(!barrier.is_broken());
    assert_eq!(0, barrier.number_waiting());
}

#[test]
fn interrupted_waiter_breaks_barrier() {
    let barrier = Arc::new(CyclicBarrier::new(3).unwrap());

    let other = spawn_waiter(&barrier);
    eventually(|| barrier.number_waiting() == 1);

    let (interrupted, signal) = {
        let barrier = Arc::clone(&barrier);
        spawn_with_signal(move || barrier.wait())
    };
    eventually(|| barrier.number_waiting() == 2);

    signal.interrupt();

    assert!(matches!(
        interrupted.join().unwrap(),
        Err(CoordinationError::Interrupted)
    ));
    assert!(matches!(
        other.join().unwrap(),
        Err(CoordinationError::BrokenBarrier)
    ));
    assert!(barrier.is_broken());
}

#[test]
fn interrupt_after_trip_is_kept_for_caller() {
    let target: Arc<Mutex<Option<ThreadSignal>>> = Arc::new(Mutex::new(None));

    // The action interrupts the waiter after the last arrival, before the
    // waiter is released into the next generation.
    //
    let barrier = {
        let target = Arc::clone(&target);
        Arc::new(
            CyclicBarrier::with_action(2, move || {
                if let Some(signal) = target.lock().unwrap().as_ref() {
                    signal.interrupt();
                }
                Ok::<(), io::Error>(())
            })
            .unwrap(),
        )
    };

    let (waiter, signal) = {
        let barrier = Arc::clone(&barrier);
        spawn_with_signal(move || {
            let index = barrier.wait();
            (index, is_current_interrupted())
        })
    };
    *target.lock().unwrap() = Some(signal);

    eventually(|| barrier.number_waiting() == 1);
    assert_eq!(0, barrier.wait().unwrap());

    let (index, still_interrupted) = waiter.join().unwrap();

    assert_eq!(1, index.unwrap());
    assert!(still_interrupted);
    assert!(!barrier.is_broken());
}

#[test]
fn pending_interrupt_breaks_barrier_on_arrival() {
    let barrier = CyclicBarrier::new(2).unwrap();

    ThreadSignal::current().interrupt();

    assert!(matches!(barrier.wait(), Err(CoordinationError::Interrupted)));
    assert!(barrier.is_broken());
    assert!(!concord_core::interrupted());
}

#[rstest]
#[case::error(false)]
#[case::panic(true)]
fn failing_action_breaks_barrier(#[case] panics: bool) {
    let barrier = Arc::new(
        CyclicBarrier::with_action(2, move || {
            if panics {
                panic!("action exploded");
            }
            Err(io::Error::other("action failed"))
        })
        .unwrap(),
    );

    let waiter = spawn_waiter(&barrier);
    eventually(|| barrier.number_waiting() == 1);

    let result = barrier.wait();

    match result {
        Err(CoordinationError::ComputationFailed(error)) => {
            let expected = if panics {
                "panicked: action exploded"
            } else {
                "action failed"
            };
            assert_eq!(expected, error.to_string());
        }
        other => panic!("unexpected trip result: {other:?}"),
    }

    assert!(matches!(
        waiter.join().unwrap(),
        Err(CoordinationError::BrokenBarrier)
    ));
    assert!(barrier.is_broken());
}

// =============================================================================
// Stress
// =============================================================================

#[rstest]
#[serial(stress_tests)]
#[case::pair(2, 500)]
#[case::eight(8, 200)]
#[case::thirty_two(32, 50)]
fn stress_many_generations(#[case] parties: usize, #[case] generations: usize) {
    let trips = Arc::new(AtomicUsize::new(0));

    let barrier = {
        let trips = Arc::clone(&trips);
        Arc::new(
            CyclicBarrier::with_action(parties, move || {
                trips.fetch_add(1, Ordering::SeqCst);
                Ok::<(), io::Error>(())
            })
            .unwrap(),
        )
    };

    let handles: Vec<_> = (0..parties)
        .map(|_| {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mut leader_count = 0;
                for _ in 0..generations {
                    if barrier.wait().unwrap() == 0 {
                        leader_count += 1;
                    }
                }
                leader_count
            })
        })
        .collect();

    let leaders: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

    assert_eq!(generations, leaders);
    assert_eq!(generations, trips.load(Ordering::SeqCst));
}
