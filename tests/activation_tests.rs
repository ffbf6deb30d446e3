// Activation record semantics: counter arithmetic, the unique zero
// transition under contention and cross-mapping through the shared block.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Barrier};

use mediaflow::graph::activation::NodeStatus;
use mediaflow::graph::memblock::Activation;

#[test]
fn reset_rearms_pending_from_required() {
    let activation = Activation::alloc(1024).unwrap();
    let state = activation.record().state();

    state.increment_required();
    state.increment_required();
    state.increment_required();
    state.reset();

    assert_eq!(state.pending(), 3);
    assert_eq!(state.required(), 3);

    assert!(!state.dec_pending());
    assert!(!state.dec_pending());
    assert!(state.dec_pending());
    assert_eq!(state.pending(), 0);

    // Re-arming restores the full fan-in.
    state.reset();
    assert_eq!(state.pending(), 3);
}

#[test]
fn decrement_required_shrinks_next_cycle() {
    let activation = Activation::alloc(1024).unwrap();
    let state = activation.record().state();

    state.increment_required();
    state.increment_required();
    state.decrement_required();
    state.reset();

    assert_eq!(state.pending(), 1);
    assert!(state.dec_pending());
}

/// Two threads race `dec_pending` a million times; every trial must see
/// exactly one winner of the zero transition.
#[test]
fn concurrent_dec_pending_has_unique_winner() {
    const TRIALS: usize = 1_000_000;

    let activation = Arc::new(Activation::alloc(1024).unwrap());
    activation.record().state().increment_required();
    activation.record().state().increment_required();
    activation.record().state().reset();

    let zero_observations = Arc::new(AtomicU64::new(0));
    let start = Arc::new(Barrier::new(2));
    let done = Arc::new(Barrier::new(2));

    let mut handles = Vec::new();
    for worker in 0..2 {
        let activation = activation.clone();
        let zero_observations = zero_observations.clone();
        let start = start.clone();
        let done = done.clone();
        handles.push(std::thread::spawn(move || {
            for _ in 0..TRIALS {
                start.wait();
                if activation.record().state().dec_pending() {
                    zero_observations.fetch_add(1, Ordering::SeqCst);
                }
                done.wait();
                // Thread 0 re-arms between trials; the next start barrier
                // keeps the reset ordered before any new decrement.
                if worker == 0 {
                    activation.record().state().reset();
                }
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(
        zero_observations.load(Ordering::SeqCst) as usize,
        TRIALS,
        "every trial must produce exactly one zero observation"
    );
}

#[test]
fn status_and_timestamps_round_trip() {
    let activation = Activation::alloc(256).unwrap();
    let record = activation.record();

    record.set_status(NodeStatus::Triggered);
    record.set_signal_time(100);
    record.set_status(NodeStatus::Awake);
    record.set_awake_time(200);
    record.set_status(NodeStatus::Finished);
    record.set_finish_time(300);

    assert_eq!(record.status(), NodeStatus::Finished);
    assert!(record.signal_time() <= record.awake_time());
    assert!(record.awake_time() <= record.finish_time());
}

/// A peer process maps the same block through the fd; counters and the
/// running flag are shared.
#[test]
fn peer_mapping_shares_the_record() {
    let local = Activation::alloc(512).unwrap();
    let peer = Activation::from_fd(local.fd()).unwrap();

    local.record().state().increment_required();
    local.record().state().increment_required();
    local.record().state().reset();
    local.record().set_running(true);

    assert!(peer.record().running());
    assert!(!peer.record().state().dec_pending());
    assert!(peer.record().state().dec_pending());
    assert_eq!(local.record().state().pending(), 0);

    peer.record().set_status(NodeStatus::Finished);
    assert_eq!(local.record().status(), NodeStatus::Finished);
}
