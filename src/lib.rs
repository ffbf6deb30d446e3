//! mediaflow - a driver-clocked realtime media graph server core.
//!
//! A directed graph of processing nodes is executed by a barrier-based
//! scheduler on a dedicated realtime thread, while the main thread manages
//! topology: node/port/link lifecycle, state machines, format negotiation
//! and driver election. The two contexts meet only at the per-node
//! activation records (atomic counters in shared memory) and a
//! single-producer invoke queue.

pub mod graph;
pub mod log;
pub mod service;

pub use graph::{
    Activation, BackendCallbacks, BackendCommand, BackendEvent, BackendEventSender, BackendInfo,
    BackendNotify, BackendPortInfo, BufferPool, Completion, Direction, GraphConfig, GraphCore,
    GraphError, GraphStats, IoBuffers, IoKind, LinkId, LinkInfo, LinkState, MediaFormat,
    MediaSubtype, MediaType, NodeBackend, NodeId, NodeInfo, NodeState, NodeStatus, ParamId,
    ParamValue, Port, PortFlags, PortId, PortInfo, PortState, ProcessStatus, Properties,
};
pub use service::{GraphCommand, GraphHandle, GraphService};
