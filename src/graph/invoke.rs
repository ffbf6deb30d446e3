//! The invoke queue between the main thread and the data loop.
//!
//! Topology mutations the realtime thread must observe are marshalled as
//! by-value operations through a single-producer/single-consumer ring. The
//! main thread is the only producer; the data loop drains the ring at
//! well-defined points inside its cycle.

use std::sync::mpsc::Sender;
use std::sync::Arc;

use crate::graph::backend::{IoBuffers, NodeBackend, ProcessStatus};
use crate::graph::memblock::Activation;
use crate::graph::types::{Direction, LinkId, NodeId, PortId};

/// How a target entry is woken when its pending counter reaches zero.
#[derive(Clone)]
pub enum TargetSignal {
    /// The target is processed inline by the local data loop.
    Local,
    /// The target lives elsewhere (another process, a test harness); raising
    /// it runs the provided function.
    Custom(Arc<dyn Fn() + Send + Sync>),
}

impl std::fmt::Debug for TargetSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetSignal::Local => write!(f, "Local"),
            TargetSignal::Custom(_) => write!(f, "Custom"),
        }
    }
}

/// Why a target entry exists in some node's target list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    /// A node's own entry in its driver's list.
    Node,
    /// The entry a node keeps towards its driver, so its completion counts
    /// into the driver's fan-in.
    Driver,
    /// An entry added by an active link towards the downstream node.
    Link(LinkId),
}

/// One entry in a target list: decrement this activation when the owning
/// node completes, raise `signal` on the unique zero transition.
#[derive(Debug, Clone)]
pub struct Target {
    pub node: NodeId,
    pub kind: TargetKind,
    pub activation: Activation,
    pub signal: TargetSignal,
}

/// Operations marshalled to the data loop. Payloads are moved by value; the
/// realtime thread never follows pointers back into main-thread state.
pub enum InvokeOp {
    /// Make a node known to the loop (at creation time).
    RegisterNode {
        node: NodeId,
        activation: Activation,
        is_driver: bool,
        exported: bool,
    },
    /// Forget a node entirely (at destroy time).
    FreeNode { node: NodeId },
    /// Attach or replace the backend handle used for realtime processing.
    SetBackend {
        node: NodeId,
        backend: Option<Arc<dyn NodeBackend>>,
    },
    /// Insert the node's target entries under its driver (entering running).
    AddNode { node: NodeId, driver: NodeId },
    /// Remove the node's target entries from its driver (leaving running).
    RemoveNode { node: NodeId },
    /// Migrate the node's entries to a different driver.
    MoveNode { node: NodeId, driver: NodeId },
    /// Update the driver/master flags after a recalculation.
    SetDriverFlags {
        node: NodeId,
        is_driver: bool,
        master: bool,
    },
    /// Mark the node as signalled from another process.
    SetExported { node: NodeId, exported: bool },
    /// Register a port's io area with the realtime side.
    AddPort {
        node: NodeId,
        direction: Direction,
        port_id: PortId,
        io: Arc<IoBuffers>,
    },
    /// Remove a port's io area.
    RemovePort {
        node: NodeId,
        direction: Direction,
        port_id: PortId,
    },
    /// Wire an activated link: mix slots on both ports plus the target entry
    /// from the output node towards the input node.
    ActivateLink {
        link: LinkId,
        output_node: NodeId,
        output_port: PortId,
        input_node: NodeId,
        input_port: PortId,
        io: Arc<IoBuffers>,
    },
    /// Undo `ActivateLink`.
    DeactivateLink {
        link: LinkId,
        output_node: NodeId,
        output_port: PortId,
        input_node: NodeId,
        input_port: PortId,
    },
    /// Install an extra target entry raised through a custom signal; used
    /// for peers whose activation is mapped from another process.
    AddCustomTarget { from: NodeId, target: Target },
    /// Remove a custom target entry by node id.
    RemoveCustomTarget { from: NodeId, target_node: NodeId },
}

impl std::fmt::Debug for InvokeOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            InvokeOp::RegisterNode { .. } => "RegisterNode",
            InvokeOp::FreeNode { .. } => "FreeNode",
            InvokeOp::SetBackend { .. } => "SetBackend",
            InvokeOp::AddNode { .. } => "AddNode",
            InvokeOp::RemoveNode { .. } => "RemoveNode",
            InvokeOp::MoveNode { .. } => "MoveNode",
            InvokeOp::SetDriverFlags { .. } => "SetDriverFlags",
            InvokeOp::SetExported { .. } => "SetExported",
            InvokeOp::AddPort { .. } => "AddPort",
            InvokeOp::RemovePort { .. } => "RemovePort",
            InvokeOp::ActivateLink { .. } => "ActivateLink",
            InvokeOp::DeactivateLink { .. } => "DeactivateLink",
            InvokeOp::AddCustomTarget { .. } => "AddCustomTarget",
            InvokeOp::RemoveCustomTarget { .. } => "RemoveCustomTarget",
        };
        write!(f, "{name}")
    }
}

/// Mailbox messages waking the data loop.
#[derive(Debug)]
pub enum LoopMsg {
    /// A driver clock tick or an exported-node completion report.
    Ready { node: NodeId, status: ProcessStatus },
    /// The eventfd analog: process this node now.
    Wake { node: NodeId },
    /// Recycle a buffer on an input port.
    ReuseBuffer {
        node: NodeId,
        port_id: PortId,
        buffer_id: u32,
    },
    /// Drain the invoke ring.
    Invoke,
    /// Shut the loop down.
    Quit,
}

/// Cloneable wake handle for one node, handed to backends as the `ready`
/// callback destination and used as the signal side of target entries.
#[derive(Debug, Clone)]
pub struct NodeSignal {
    node: NodeId,
    tx: Sender<LoopMsg>,
}

impl NodeSignal {
    pub fn new(node: NodeId, tx: Sender<LoopMsg>) -> Self {
        Self { node, tx }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Driver tick / exported completion entry point.
    pub fn ready(&self, status: ProcessStatus) {
        let _ = self.tx.send(LoopMsg::Ready {
            node: self.node,
            status,
        });
    }

    /// Raise the node's wake, like writing its eventfd.
    pub fn wake(&self) {
        let _ = self.tx.send(LoopMsg::Wake { node: self.node });
    }

    pub fn reuse_buffer(&self, port_id: PortId, buffer_id: u32) {
        let _ = self.tx.send(LoopMsg::ReuseBuffer {
            node: self.node,
            port_id,
            buffer_id,
        });
    }
}
