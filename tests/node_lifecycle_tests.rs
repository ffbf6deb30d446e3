// Node lifecycle and state machine behavior against scripted backends.

mod support;

use std::sync::{Arc, Mutex};

use mediaflow::graph::backend::BackendCommand;
use mediaflow::graph::core::GraphCore;
use mediaflow::graph::error::GraphError;
use mediaflow::graph::events::NodeEvent;
use mediaflow::graph::params::MediaFormat;
use mediaflow::graph::port::Port;
use mediaflow::graph::types::{Direction, GraphConfig, NodeState, Properties, ID_INVALID};

use support::TestBackend;

fn stereo() -> Vec<MediaFormat> {
    vec![MediaFormat::audio(48000, 2)]
}

/// Record every state a node moves through.
fn record_states(core: &mut GraphCore, node: u32) -> Arc<Mutex<Vec<NodeState>>> {
    let states = Arc::new(Mutex::new(Vec::new()));
    let states2 = states.clone();
    core.node_mut(node).unwrap().listeners.add(move |event| {
        if let NodeEvent::StateChanged { new, .. } = event {
            states2.lock().unwrap().push(*new);
        }
    });
    states
}

#[test]
fn register_assigns_id_and_suspends() {
    let mut core = GraphCore::new(GraphConfig::default());
    let backend = TestBackend::new("source");
    backend.add_output_port(0, stereo());

    let node = core.node_new("source", Properties::new()).unwrap();
    core.node_set_implementation(node, backend.clone()).unwrap();

    assert_eq!(core.node(node).unwrap().info.state, NodeState::Creating);
    core.node_register(node, None).unwrap();

    let info = &core.node(node).unwrap().info;
    assert_eq!(info.id, node);
    assert_eq!(info.state, NodeState::Suspended);
    assert_eq!(info.n_output_ports, 1);
    assert_eq!(
        core.node(node).unwrap().properties.get("node.id"),
        Some(node.to_string().as_str())
    );
}

#[test]
fn node_without_backend_stays_creating() {
    let mut core = GraphCore::new(GraphConfig::default());
    let node = core.node_new("empty", Properties::new()).unwrap();

    // Registration requires an implementation.
    let err = core.node_register(node, None).unwrap_err();
    assert!(matches!(err, GraphError::BadState(_)));

    // And no state transition can leave creating.
    let err = core.node_set_state(node, NodeState::Idle).unwrap_err();
    assert!(matches!(err, GraphError::BadState(_)));
    assert_eq!(core.node(node).unwrap().info.state, NodeState::Creating);
}

#[test]
fn second_implementation_is_rejected() {
    let mut core = GraphCore::new(GraphConfig::default());
    let node = core.node_new("node", Properties::new()).unwrap();
    core.node_set_implementation(node, TestBackend::new("a"))
        .unwrap();
    let err = core
        .node_set_implementation(node, TestBackend::new("b"))
        .unwrap_err();
    assert!(matches!(err, GraphError::Exists(_)));
}

#[test]
fn colliding_port_id_fails_with_exists() {
    let mut core = GraphCore::new(GraphConfig::default());
    let backend = TestBackend::new("node");
    backend.add_input_port(0, stereo());

    let node = core.node_new("node", Properties::new()).unwrap();
    core.node_set_implementation(node, backend).unwrap();

    let err = core
        .add_port(node, Port::new(Direction::Input, 0, 0, Properties::new()))
        .unwrap_err();
    assert!(matches!(err, GraphError::Exists(_)));
}

#[test]
fn running_is_deferred_until_links_ready() {
    let mut core = GraphCore::new(GraphConfig::default());

    let source_backend = TestBackend::new_driver("source");
    source_backend.add_output_port(0, stereo());
    let sink_backend = TestBackend::new("sink");
    sink_backend.add_input_port(0, stereo());

    let source = core
        .node_new("source", Properties::new().with("node.driver", "true"))
        .unwrap();
    core.node_set_implementation(source, source_backend.clone())
        .unwrap();
    core.node_register(source, None).unwrap();

    let sink = core.node_new("sink", Properties::new()).unwrap();
    core.node_set_implementation(sink, sink_backend.clone())
        .unwrap();
    core.node_register(sink, None).unwrap();

    // Hold the sink's format set asynchronous so the link cannot reach
    // ready yet.
    sink_backend.set_async_format(7);

    core.link_new(source, 0, sink, 0, Properties::new()).unwrap();
    core.node_set_active(source, true).unwrap();
    core.node_set_active(sink, true).unwrap();

    // The explicit start request is a silent no-op while the link counts
    // disagree.
    core.node_set_state(sink, NodeState::Running).unwrap();
    assert_eq!(core.node(sink).unwrap().info.state, NodeState::Idle);
    assert!(!sink_backend
        .commands()
        .contains(&BackendCommand::Start));

    // The link-ready transition completes the deferred start.
    sink_backend.complete(7, 0);
    core.dispatch();

    assert_eq!(core.node(sink).unwrap().info.state, NodeState::Running);
    assert!(sink_backend.commands().contains(&BackendCommand::Start));
}

#[test]
fn pause_on_idle_gates_the_pause_command() {
    for (pause_on_idle, expect_pause) in [("true", true), ("false", false)] {
        let mut core = GraphCore::new(GraphConfig::default());

        let source_backend = TestBackend::new_driver("source");
        source_backend.add_output_port(0, stereo());
        let sink_backend = TestBackend::new("sink");
        sink_backend.add_input_port(0, stereo());

        let source = core
            .node_new("source", Properties::new().with("node.driver", "true"))
            .unwrap();
        core.node_set_implementation(source, source_backend.clone())
            .unwrap();
        core.node_register(source, None).unwrap();

        let sink = core
            .node_new(
                "sink",
                Properties::new().with("node.pause-on-idle", pause_on_idle),
            )
            .unwrap();
        core.node_set_implementation(sink, sink_backend.clone())
            .unwrap();
        core.node_register(sink, None).unwrap();

        core.link_new(source, 0, sink, 0, Properties::new()).unwrap();
        core.node_set_active(source, true).unwrap();
        core.node_set_active(sink, true).unwrap();
        assert_eq!(core.node(sink).unwrap().info.state, NodeState::Running);

        core.node_set_state(sink, NodeState::Idle).unwrap();
        assert_eq!(core.node(sink).unwrap().info.state, NodeState::Idle);
        assert_eq!(
            sink_backend.commands().contains(&BackendCommand::Pause),
            expect_pause,
            "pause-on-idle={pause_on_idle}"
        );
    }
}

#[test]
fn superseded_transition_is_dropped() {
    let mut core = GraphCore::new(GraphConfig::default());

    let source_backend = TestBackend::new_driver("source");
    source_backend.add_output_port(0, stereo());
    let sink_backend = TestBackend::new("sink");
    sink_backend.add_input_port(0, stereo());

    let source = core
        .node_new("source", Properties::new().with("node.driver", "true"))
        .unwrap();
    core.node_set_implementation(source, source_backend).unwrap();
    core.node_register(source, None).unwrap();

    let sink = core.node_new("sink", Properties::new()).unwrap();
    core.node_set_implementation(sink, sink_backend.clone())
        .unwrap();
    core.node_register(sink, None).unwrap();

    // Let the Start command itself answer asynchronously.
    sink_backend.set_async_start(21);

    core.link_new(source, 0, sink, 0, Properties::new()).unwrap();
    core.node_set_active(source, true).unwrap();
    core.node_set_active(sink, true).unwrap();

    // Start is in flight; the node has not reached running yet.
    assert_eq!(core.node(sink).unwrap().info.state, NodeState::Idle);

    // A newer transition supersedes the pending start...
    core.node_set_state(sink, NodeState::Idle).unwrap();
    // ...so its late completion must not flip the node to running.
    sink_backend.complete(21, 0);
    core.dispatch();
    assert_eq!(core.node(sink).unwrap().info.state, NodeState::Idle);
}

#[test]
fn state_sequence_is_suspended_idle_running() {
    let mut core = GraphCore::new(GraphConfig::default());

    let source_backend = TestBackend::new_driver("source");
    source_backend.add_output_port(0, stereo());
    let sink_backend = TestBackend::new("sink");
    sink_backend.add_input_port(0, stereo());

    let source = core
        .node_new("source", Properties::new().with("node.driver", "true"))
        .unwrap();
    core.node_set_implementation(source, source_backend).unwrap();

    let sink = core.node_new("sink", Properties::new()).unwrap();
    core.node_set_implementation(sink, sink_backend).unwrap();

    let states = record_states(&mut core, sink);

    core.node_register(source, None).unwrap();
    core.node_register(sink, None).unwrap();
    core.link_new(source, 0, sink, 0, Properties::new()).unwrap();
    core.node_set_active(source, true).unwrap();
    core.node_set_active(sink, true).unwrap();

    assert_eq!(
        *states.lock().unwrap(),
        vec![NodeState::Suspended, NodeState::Idle, NodeState::Running]
    );
}

#[test]
fn find_port_and_free_id_use_backend_limits() {
    let mut core = GraphCore::new(GraphConfig::default());
    let backend = TestBackend::new("node");
    backend.add_input_port(0, stereo());
    backend.add_input_port(1, stereo());

    let node = core.node_new("node", Properties::new()).unwrap();
    core.node_set_implementation(node, backend).unwrap();

    let found = core
        .node(node)
        .unwrap()
        .find_port(Direction::Input, ID_INVALID)
        .unwrap();
    assert_eq!(found.port_id, 0);

    let free = core
        .node(node)
        .unwrap()
        .get_free_port_id(Direction::Input)
        .unwrap();
    assert_eq!(free, 2);
}

#[test]
fn latency_property_drives_driver_quantum() {
    let mut core = GraphCore::new(GraphConfig::default());

    let source_backend = TestBackend::new_driver("source");
    source_backend.add_output_port(0, stereo());
    let sink_backend = TestBackend::new("sink");
    sink_backend.add_input_port(0, stereo());

    let source = core
        .node_new("source", Properties::new().with("node.driver", "true"))
        .unwrap();
    core.node_set_implementation(source, source_backend).unwrap();
    core.node_register(source, None).unwrap();

    let sink = core
        .node_new("sink", Properties::new().with("node.latency", "128/48000"))
        .unwrap();
    core.node_set_implementation(sink, sink_backend).unwrap();
    core.node_register(sink, None).unwrap();

    core.link_new(source, 0, sink, 0, Properties::new()).unwrap();
    core.node_set_active(source, true).unwrap();
    core.node_set_active(sink, true).unwrap();

    // The driver's position block carries the folded component quantum.
    let quantum = core
        .node(source)
        .unwrap()
        .activation
        .record()
        .position
        .size();
    assert_eq!(quantum, 128);
}
