// Exported nodes: the activation record is mapped by a peer through its fd,
// the peer finishes the cycle and signals; the local driver observes the
// completion without having processed the node itself.

mod support;

use std::sync::Arc;

use serial_test::serial;

use mediaflow::graph::activation::NodeStatus;
use mediaflow::graph::backend::ProcessStatus;
use mediaflow::graph::core::GraphCore;
use mediaflow::graph::memblock::Activation;
use mediaflow::graph::params::MediaFormat;
use mediaflow::graph::types::{GraphConfig, NodeState, Properties};

use support::{wait_for, TestBackend};

fn stereo() -> Vec<MediaFormat> {
    vec![MediaFormat::audio(48000, 2)]
}

#[test]
#[serial]
fn exported_node_cycle_is_completed_by_the_peer() {
    let mut core = GraphCore::new(GraphConfig::default());

    let driver_backend = TestBackend::new_driver("driver");
    driver_backend.add_output_port(0, stereo());
    let driver = core
        .node_new("driver", Properties::new().with("node.driver", "true"))
        .unwrap();
    core.node_set_implementation(driver, driver_backend.clone())
        .unwrap();
    core.node_register(driver, None).unwrap();

    // The exported node reports Ok from process: its real work happens in
    // the peer process.
    let exported_backend = TestBackend::new("exported");
    exported_backend.add_input_port(0, stereo());
    exported_backend.set_process_status(ProcessStatus::Ok);
    let exported = core.node_new("exported", Properties::new()).unwrap();
    core.node_set_implementation(exported, exported_backend.clone())
        .unwrap();
    core.node_register(exported, None).unwrap();
    core.node_set_exported(exported, true).unwrap();

    core.link_new(driver, 0, exported, 0, Properties::new())
        .unwrap();
    core.node_set_active(driver, true).unwrap();
    core.node_set_active(exported, true).unwrap();
    assert_eq!(core.node(exported).unwrap().info.state, NodeState::Running);

    let exported_record = core.node(exported).unwrap().activation.clone();
    wait_for(
        || exported_record.record().state().required() == 2,
        "exported fan-in",
    );

    // The peer maps both activation records out-of-band through their fds.
    let peer_exported = Activation::from_fd(exported_record.fd()).unwrap();
    let driver_record = core.node(driver).unwrap().activation.clone();
    let peer_driver = Activation::from_fd(driver_record.fd()).unwrap();
    let driver_signal = core.node(driver).unwrap().signal.clone();

    let metrics = core.loop_metrics();
    driver_backend.tick(ProcessStatus::Ok);

    // The exported node was triggered locally, returned Ok and the cycle is
    // continuing asynchronously: the driver is still running.
    wait_for(|| exported_backend.process_count() == 1, "exported trigger");
    assert_eq!(metrics.cycles_completed(), 0);
    assert!(driver_record.record().running());

    // The peer finishes the node's cycle through its own mapping, then
    // decrements the driver's pending and raises the driver's wake, exactly
    // as an eventfd peer would.
    peer_exported.record().set_status(NodeStatus::Finished);
    if peer_driver.record().state().dec_pending() {
        driver_signal.wake();
    }

    wait_for(|| metrics.cycles_completed() == 1, "peer-completed cycle");
    assert!(!driver_record.record().running());
    // The local side observes the finished status the peer wrote.
    assert_eq!(exported_record.record().status(), NodeStatus::Finished);
    // The driver never processed the exported node a second time.
    assert_eq!(exported_backend.process_count(), 1);
}

/// A peer target registered on a local node is signalled through its custom
/// raise function when its mapped counter hits zero.
#[test]
#[serial]
fn custom_peer_target_is_signalled_once_per_cycle() {
    let mut core = GraphCore::new(GraphConfig::default());

    let driver_backend = TestBackend::new_driver("driver");
    driver_backend.add_output_port(0, stereo());
    let driver = core
        .node_new("driver", Properties::new().with("node.driver", "true"))
        .unwrap();
    core.node_set_implementation(driver, driver_backend.clone())
        .unwrap();
    core.node_register(driver, None).unwrap();
    core.node_set_active(driver, true).unwrap();
    core.node_set_state(driver, NodeState::Running).unwrap();

    // A pseudo-peer with its own activation record.
    let peer_activation = Activation::alloc(1024).unwrap();
    let raised = Arc::new(std::sync::atomic::AtomicU64::new(0));
    let raised2 = raised.clone();
    let peer_record = Activation::from_fd(peer_activation.fd()).unwrap();
    core.add_peer_target(
        driver,
        9999,
        peer_activation.clone(),
        Arc::new(move || {
            raised2.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }),
    )
    .unwrap();

    wait_for(
        || peer_record.record().state().required() == 1,
        "peer fan-in",
    );

    let metrics = core.loop_metrics();
    driver_backend.tick(ProcessStatus::Ok);
    wait_for(
        || raised.load(std::sync::atomic::Ordering::SeqCst) == 1,
        "peer raise",
    );
    assert_eq!(peer_record.record().status(), NodeStatus::Triggered);
    // The driver's own completion is independent of the peer's.
    wait_for(|| metrics.cycles_completed() == 1, "driver cycle");

    driver_backend.tick(ProcessStatus::Ok);
    wait_for(
        || raised.load(std::sync::atomic::Ordering::SeqCst) == 2,
        "second raise",
    );
}
