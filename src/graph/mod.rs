// Graph module - the driver-clocked media processing graph
//
// This module provides the graph execution core broken down into logical components:
// - types: ids, states, properties and info structs
// - activation: atomic per-node scheduling counters in shared memory
// - memblock: fd-backed shared memory segments
// - backend: the processing-implementation interface nodes consume
// - port / link / node: the topology entities and their state machines
// - core: registries, dispatch, driver election and graph recalculation
// - data_loop: the realtime per-cycle scheduler
// - work_queue: async backend completion reconciliation
// - events: typed listener lists for external observers

pub mod activation;
pub mod backend;
pub mod core;
pub mod data_loop;
pub mod error;
pub mod events;
pub mod invoke;
pub mod link;
pub mod memblock;
pub mod node;
pub mod params;
pub mod port;
pub mod types;
pub mod work_queue;

// Re-export commonly used types for easier imports
pub use activation::{ActivationRecord, ActivationState, NodeStatus};
pub use backend::{
    BackendCallbacks, BackendCommand, BackendEvent, BackendEventSender, BackendInfo,
    BackendNotify, BackendPortInfo, BufferPool, Completion, IoBuffers, IoKind, NodeBackend,
    ProcessStatus,
};
pub use self::core::{GraphCore, GraphStats};
pub use data_loop::{DataLoopHandle, DataLoopMetrics};
pub use error::{GraphError, Result};
pub use events::{CoreEvent, LinkEvent, ListenerList, ListenerToken, NodeEvent, PortEvent};
pub use link::Link;
pub use memblock::{Activation, MemBlock};
pub use node::Node;
pub use params::{BufferRequirements, MediaFormat, MediaSubtype, MediaType, ParamId, ParamValue};
pub use port::{Port, PortFlags};
pub use types::{
    Direction, GraphConfig, LinkId, LinkInfo, LinkState, NodeId, NodeInfo, NodeState, PortId,
    PortInfo, PortState, Properties,
};
