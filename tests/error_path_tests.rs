// Backend failure propagation: error states, link teardown and the idle
// fallback.

mod support;

use std::sync::{Arc, Mutex};

use mediaflow::graph::core::GraphCore;
use mediaflow::graph::events::NodeEvent;
use mediaflow::graph::params::MediaFormat;
use mediaflow::graph::types::{GraphConfig, LinkState, NodeState, Properties};

use support::TestBackend;

fn stereo() -> Vec<MediaFormat> {
    vec![MediaFormat::audio(48000, 2)]
}

#[test]
fn backend_error_drives_node_to_error_then_idle() {
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
    core.node_set_implementation(sink, sink_backend).unwrap();
    core.node_register(sink, None).unwrap();

    let source_states: Arc<Mutex<Vec<(NodeState, Option<String>)>>> =
        Arc::new(Mutex::new(Vec::new()));
    let recorder = source_states.clone();
    core.node_mut(source).unwrap().listeners.add(move |event| {
        if let NodeEvent::StateChanged { new, error, .. } = event {
            recorder.lock().unwrap().push((*new, error.clone()));
        }
    });

    let link = core.link_new(source, 0, sink, 0, Properties::new()).unwrap();
    core.node_set_active(source, true).unwrap();
    core.node_set_active(sink, true).unwrap();

    assert_eq!(core.node(source).unwrap().info.state, NodeState::Running);
    assert_eq!(core.node(sink).unwrap().info.state, NodeState::Running);

    // The source hits an unrecoverable failure.
    source_backend.emit_error("stream died");
    core.dispatch();

    // The link errored out and both nodes settled at idle.
    assert_eq!(core.link(link).unwrap().state(), LinkState::Error);
    assert_eq!(core.node(source).unwrap().info.state, NodeState::Idle);
    assert_eq!(core.node(sink).unwrap().info.state, NodeState::Idle);

    // The error state was observable and carried the backend's message.
    let states = source_states.lock().unwrap();
    assert!(states
        .iter()
        .any(|(state, error)| *state == NodeState::Error
            && error.as_deref() == Some("stream died")));
    assert_eq!(states.last().unwrap().0, NodeState::Idle);
}

#[test]
fn result_errors_are_recorded_on_the_node() {
    let mut core = GraphCore::new(GraphConfig::default());
    let backend = TestBackend::new("node");
    backend.add_input_port(0, stereo());

    let node = core.node_new("node", Properties::new()).unwrap();
    core.node_set_implementation(node, backend.clone()).unwrap();
    core.node_register(node, None).unwrap();

    let results: Arc<Mutex<Vec<(u32, i32)>>> = Arc::new(Mutex::new(Vec::new()));
    let recorder = results.clone();
    core.node_mut(node).unwrap().listeners.add(move |event| {
        if let NodeEvent::Result { seq, res, .. } = event {
            recorder.lock().unwrap().push((*seq, *res));
        }
    });

    backend.complete(42, -7);
    core.dispatch();

    assert_eq!(core.node(node).unwrap().last_error, -7);
    let results = results.lock().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].1, -7);
}
