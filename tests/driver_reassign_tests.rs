// Driver election and reassignment: target-list migration must take effect
// at invoke-queue drain points, never mid-cycle.

mod support;

use serial_test::serial;

use mediaflow::graph::backend::ProcessStatus;
use mediaflow::graph::core::GraphCore;
use mediaflow::graph::params::MediaFormat;
use mediaflow::graph::types::{GraphConfig, NodeState, Properties};

use support::{wait_for, TestBackend};

fn stereo() -> Vec<MediaFormat> {
    vec![MediaFormat::audio(48000, 2)]
}

fn make_driver(core: &mut GraphCore, name: &str) -> (u32, std::sync::Arc<TestBackend>) {
    let backend = TestBackend::new_driver(name);
    backend.add_output_port(0, stereo());
    let node = core
        .node_new(name, Properties::new().with("node.driver", "true"))
        .unwrap();
    core.node_set_implementation(node, backend.clone()).unwrap();
    core.node_register(node, None).unwrap();
    core.node_set_active(node, true).unwrap();
    (node, backend)
}

#[test]
#[serial]
fn election_prefers_registration_order() {
    let mut core = GraphCore::new(GraphConfig::default());

    let (d1, _) = make_driver(&mut core, "d1");
    let (d2, _) = make_driver(&mut core, "d2");

    let sink_backend = TestBackend::new("sink");
    sink_backend.add_input_port(0, stereo());
    let sink = core.node_new("sink", Properties::new()).unwrap();
    core.node_set_implementation(sink, sink_backend).unwrap();
    core.node_register(sink, None).unwrap();
    core.node_set_active(sink, true).unwrap();

    // Linked to both components? No - link only to d2: the sink joins d2's
    // component, d1 keeps its own.
    core.link_new(d2, 0, sink, 0, Properties::new()).unwrap();

    assert_eq!(core.node(sink).unwrap().driver_id, d2);
    assert_eq!(core.node(d1).unwrap().driver_id, d1);
    assert!(core.node(d1).unwrap().master);
    assert!(core.node(d2).unwrap().master);
}

#[test]
#[serial]
fn moved_node_only_runs_under_its_new_driver() {
    let mut core = GraphCore::new(GraphConfig::default());

    let (d1, d1_backend) = make_driver(&mut core, "d1");
    let (d2, d2_backend) = make_driver(&mut core, "d2");

    // A standalone processing node, active and running on its own.
    let a_backend = TestBackend::new("a");
    a_backend.set_process_status(ProcessStatus::NeedBuffer);
    let a = core.node_new("a", Properties::new()).unwrap();
    core.node_set_implementation(a, a_backend.clone()).unwrap();
    core.node_register(a, None).unwrap();
    core.node_set_active(a, true).unwrap();
    core.node_set_state(a, NodeState::Running).unwrap();
    assert_eq!(core.node(a).unwrap().info.state, NodeState::Running);

    // Drivers must be running to cycle.
    core.node_set_state(d1, NodeState::Running).unwrap();
    core.node_set_state(d2, NodeState::Running).unwrap();

    // Route A under D1.
    core.node_set_driver(a, d1).unwrap();
    let a_record = core.node(a).unwrap().activation.clone();
    wait_for(|| a_record.record().state().required() == 1, "A under D1");

    let metrics = core.loop_metrics();
    d1_backend.tick(ProcessStatus::Ok);
    wait_for(|| metrics.cycles_completed() == 1, "D1 cycle with A");
    assert_eq!(a_backend.process_count(), 1);

    // Move A to D2. The migration drains through the invoke queue.
    core.node_set_driver(a, d2).unwrap();
    let d1_record = core.node(d1).unwrap().activation.clone();
    wait_for(
        || d1_record.record().state().required() == 2,
        "A to leave D1's fan-in",
    );

    // No D1 cycle after the drain signals A.
    d1_backend.tick(ProcessStatus::Ok);
    wait_for(|| metrics.cycles_completed() == 2, "D1 cycle without A");
    assert_eq!(a_backend.process_count(), 1);

    // Every D2 cycle after the drain does.
    d2_backend.tick(ProcessStatus::Ok);
    wait_for(|| metrics.cycles_completed() == 3, "D2 cycle with A");
    assert_eq!(a_backend.process_count(), 2);
}
