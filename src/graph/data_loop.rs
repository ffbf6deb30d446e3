//! The realtime data loop.
//!
//! One dedicated thread runs the per-cycle protocol: a driver tick resets
//! the activation counters of every routed target, the driver's backend
//! fills the clock, then the first wave is signalled through the atomic
//! decrement of each target's pending counter. A signalled node runs its
//! input mixes and its backend, then performs the same decrement-and-signal
//! walk over its own target list. There are no locks on this path; the only
//! cross-thread state is the activation records.
//!
//! Target lists and port mixes are owned exclusively by this thread and are
//! mutated only through the invoke ring.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;

use rtrb::{Consumer, Producer, RingBuffer};
use tracing::{debug, info, trace, warn};

use crate::graph::activation::{monotonic_nanos, NodeStatus};
use crate::graph::backend::{IoBuffers, NodeBackend, ProcessStatus};
use crate::graph::invoke::{InvokeOp, LoopMsg, NodeSignal, Target, TargetKind, TargetSignal};
use crate::graph::memblock::Activation;
use crate::graph::types::{Direction, LinkId, NodeId, PortId};

const INVOKE_RING_CAPACITY: usize = 1024;

/// Counters shared with the main thread for observability.
#[derive(Debug, Default)]
pub struct DataLoopMetrics {
    cycles_started: AtomicU64,
    cycles_completed: AtomicU64,
    nodes_processed: AtomicU64,
    watchdog_trips: AtomicU64,
    invokes_handled: AtomicU64,
}

impl DataLoopMetrics {
    pub fn cycles_started(&self) -> u64 {
        self.cycles_started.load(Ordering::Relaxed)
    }

    pub fn cycles_completed(&self) -> u64 {
        self.cycles_completed.load(Ordering::Relaxed)
    }

    pub fn nodes_processed(&self) -> u64 {
        self.nodes_processed.load(Ordering::Relaxed)
    }

    pub fn watchdog_trips(&self) -> u64 {
        self.watchdog_trips.load(Ordering::Relaxed)
    }

    pub fn invokes_handled(&self) -> u64 {
        self.invokes_handled.load(Ordering::Relaxed)
    }
}

/// Realtime-side port state: the port's io area plus one mix slot per
/// active link.
struct RtPort {
    port_id: PortId,
    io: Arc<IoBuffers>,
    mix_ios: Vec<(LinkId, Arc<IoBuffers>)>,
}

impl RtPort {
    /// Input mixer: forward the first ready mix slot into the port io.
    fn mix_process(&self) {
        if let Some((_, first)) = self.mix_ios.first() {
            self.io.copy_from(first);
            first.set_status(IoBuffers::STATUS_NEED_BUFFER);
        }
    }

    /// Output tee: copy the port io into every mix slot.
    fn tee_process(&self) {
        for (_, mix) in &self.mix_ios {
            mix.copy_from(&self.io);
        }
        self.io.set_status(IoBuffers::STATUS_NEED_BUFFER);
    }
}

/// Realtime-side node state, the data loop's exclusive property.
struct RtNode {
    id: NodeId,
    activation: Activation,
    backend: Option<Arc<dyn NodeBackend>>,
    driver: NodeId,
    is_driver: bool,
    master: bool,
    exported: bool,
    /// Whether the node's entries are currently linked under its driver.
    added: bool,
    /// Entries this node decrements and signals when it completes.
    targets: Vec<Target>,
    input_ports: Vec<RtPort>,
    output_ports: Vec<RtPort>,
}

/// Handle owned by the core: the single invoke producer plus the mailbox.
pub struct DataLoopHandle {
    tx: Sender<LoopMsg>,
    invoke_tx: Producer<InvokeOp>,
    metrics: Arc<DataLoopMetrics>,
    thread: Option<JoinHandle<()>>,
}

impl DataLoopHandle {
    /// Spawn the data loop thread.
    pub fn start(name: &str) -> DataLoopHandle {
        let (tx, rx) = mpsc::channel();
        let (invoke_tx, invoke_rx) = RingBuffer::new(INVOKE_RING_CAPACITY);
        let metrics = Arc::new(DataLoopMetrics::default());

        let thread_metrics = metrics.clone();
        let thread = std::thread::Builder::new()
            .name(format!("{name}-data"))
            .spawn(move || {
                DataLoop {
                    rx,
                    invoke_rx,
                    nodes: HashMap::new(),
                    metrics: thread_metrics,
                }
                .run();
            })
            .expect("failed to spawn data loop thread");

        info!("🧵 DATA_LOOP: started thread '{name}-data'");

        DataLoopHandle {
            tx,
            invoke_tx,
            metrics,
            thread: Some(thread),
        }
    }

    /// Marshal one operation to the realtime thread.
    ///
    /// Blocks (spinning briefly) only when the ring is full, which means the
    /// data loop is alive and draining.
    pub fn invoke(&mut self, op: InvokeOp) {
        let mut op = op;
        loop {
            match self.invoke_tx.push(op) {
                Ok(()) => break,
                Err(rtrb::PushError::Full(back)) => {
                    op = back;
                    std::thread::yield_now();
                }
            }
        }
        let _ = self.tx.send(LoopMsg::Invoke);
    }

    /// Wake handle for one node, shared with its backend callbacks.
    pub fn signal(&self, node: NodeId) -> NodeSignal {
        NodeSignal::new(node, self.tx.clone())
    }

    pub fn metrics(&self) -> Arc<DataLoopMetrics> {
        self.metrics.clone()
    }
}

impl Drop for DataLoopHandle {
    fn drop(&mut self) {
        let _ = self.tx.send(LoopMsg::Quit);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

struct DataLoop {
    rx: Receiver<LoopMsg>,
    invoke_rx: Consumer<InvokeOp>,
    nodes: HashMap<NodeId, RtNode>,
    metrics: Arc<DataLoopMetrics>,
}

impl DataLoop {
    fn run(&mut self) {
        debug!("data loop: running");
        while let Ok(msg) = self.rx.recv() {
            match msg {
                LoopMsg::Ready { node, status } => {
                    self.drain_invokes();
                    self.handle_ready(node, status);
                }
                LoopMsg::Wake { node } => self.process_node(node),
                LoopMsg::ReuseBuffer {
                    node,
                    port_id,
                    buffer_id,
                } => self.handle_reuse_buffer(node, port_id, buffer_id),
                LoopMsg::Invoke => self.drain_invokes(),
                LoopMsg::Quit => break,
            }
        }
        debug!("data loop: stopped with {} nodes", self.nodes.len());
    }

    fn drain_invokes(&mut self) {
        while let Ok(op) = self.invoke_rx.pop() {
            self.metrics.invokes_handled.fetch_add(1, Ordering::Relaxed);
            self.handle_invoke(op);
        }
    }

    fn handle_invoke(&mut self, op: InvokeOp) {
        trace!("data loop: invoke {:?}", op);
        match op {
            InvokeOp::RegisterNode {
                node,
                activation,
                is_driver,
                exported,
            } => {
                self.nodes.entry(node).or_insert(RtNode {
                    id: node,
                    activation,
                    backend: None,
                    driver: node,
                    is_driver,
                    master: true,
                    exported,
                    added: false,
                    targets: Vec::new(),
                    input_ports: Vec::new(),
                    output_ports: Vec::new(),
                });
            }
            InvokeOp::FreeNode { node } => {
                if self.nodes.get(&node).map(|n| n.added) == Some(true) {
                    self.remove_node(node);
                }
                self.nodes.remove(&node);
            }
            InvokeOp::SetBackend { node, backend } => {
                if let Some(rt) = self.nodes.get_mut(&node) {
                    rt.backend = backend;
                }
            }
            InvokeOp::AddNode { node, driver } => self.add_node(node, driver),
            InvokeOp::RemoveNode { node } => self.remove_node(node),
            InvokeOp::MoveNode { node, driver } => {
                if self.nodes.get(&node).map(|n| n.added) == Some(true) {
                    self.remove_node(node);
                    self.add_node(node, driver);
                } else if let Some(rt) = self.nodes.get_mut(&node) {
                    rt.driver = driver;
                }
            }
            InvokeOp::SetDriverFlags {
                node,
                is_driver,
                master,
            } => {
                if let Some(rt) = self.nodes.get_mut(&node) {
                    rt.is_driver = is_driver;
                    rt.master = master;
                }
            }
            InvokeOp::SetExported { node, exported } => {
                if let Some(rt) = self.nodes.get_mut(&node) {
                    rt.exported = exported;
                }
            }
            InvokeOp::AddPort {
                node,
                direction,
                port_id,
                io,
            } => {
                if let Some(rt) = self.nodes.get_mut(&node) {
                    let ports = match direction {
                        Direction::Input => &mut rt.input_ports,
                        Direction::Output => &mut rt.output_ports,
                    };
                    ports.push(RtPort {
                        port_id,
                        io,
                        mix_ios: Vec::new(),
                    });
                }
            }
            InvokeOp::RemovePort {
                node,
                direction,
                port_id,
            } => {
                if let Some(rt) = self.nodes.get_mut(&node) {
                    let ports = match direction {
                        Direction::Input => &mut rt.input_ports,
                        Direction::Output => &mut rt.output_ports,
                    };
                    ports.retain(|p| p.port_id != port_id);
                }
            }
            InvokeOp::ActivateLink {
                link,
                output_node,
                output_port,
                input_node,
                input_port,
                io,
            } => {
                let input_activation = match self.nodes.get(&input_node) {
                    Some(rt) => rt.activation.clone(),
                    None => return,
                };
                if let Some(rt) = self.nodes.get_mut(&input_node) {
                    if let Some(p) = rt.input_ports.iter_mut().find(|p| p.port_id == input_port) {
                        p.mix_ios.push((link, io.clone()));
                    }
                }
                if let Some(rt) = self.nodes.get_mut(&output_node) {
                    if let Some(p) = rt.output_ports.iter_mut().find(|p| p.port_id == output_port)
                    {
                        p.mix_ios.push((link, io));
                    }
                    if output_node != input_node {
                        input_activation.record().state().increment_required();
                        rt.targets.push(Target {
                            node: input_node,
                            kind: TargetKind::Link(link),
                            activation: input_activation,
                            signal: TargetSignal::Local,
                        });
                    }
                }
            }
            InvokeOp::DeactivateLink {
                link,
                output_node,
                output_port,
                input_node,
                input_port,
            } => {
                if let Some(rt) = self.nodes.get_mut(&input_node) {
                    if let Some(p) = rt.input_ports.iter_mut().find(|p| p.port_id == input_port) {
                        p.mix_ios.retain(|(l, _)| *l != link);
                    }
                }
                if let Some(rt) = self.nodes.get_mut(&output_node) {
                    if let Some(p) = rt.output_ports.iter_mut().find(|p| p.port_id == output_port)
                    {
                        p.mix_ios.retain(|(l, _)| *l != link);
                    }
                    if let Some(pos) = rt
                        .targets
                        .iter()
                        .position(|t| t.kind == TargetKind::Link(link))
                    {
                        let target = rt.targets.remove(pos);
                        target.activation.record().state().decrement_required();
                    }
                }
            }
            InvokeOp::AddCustomTarget { from, target } => {
                if let Some(rt) = self.nodes.get_mut(&from) {
                    target.activation.record().state().increment_required();
                    rt.targets.push(target);
                }
            }
            InvokeOp::RemoveCustomTarget { from, target_node } => {
                if let Some(rt) = self.nodes.get_mut(&from) {
                    if let Some(pos) = rt.targets.iter().position(|t| {
                        t.node == target_node && !matches!(t.kind, TargetKind::Link(_))
                    }) {
                        let target = rt.targets.remove(pos);
                        target.activation.record().state().decrement_required();
                    }
                }
            }
        }
    }

    /// Insert `node`'s entries under `driver`: the node's own entry into the
    /// driver's list and the driver entry into the node's own list.
    fn add_node(&mut self, node: NodeId, driver: NodeId) {
        trace!("data loop: add node {} to driver {}", node, driver);
        let (node_activation, driver_activation) = match (
            self.nodes.get(&node).map(|n| n.activation.clone()),
            self.nodes.get(&driver).map(|n| n.activation.clone()),
        ) {
            (Some(n), Some(d)) => (n, d),
            _ => {
                warn!("data loop: add node {}: unknown node or driver {}", node, driver);
                return;
            }
        };

        {
            let rt = self.nodes.get_mut(&node).unwrap();
            if rt.added {
                return;
            }
            rt.driver = driver;
            rt.added = true;
            driver_activation.record().state().increment_required();
            rt.targets.push(Target {
                node: driver,
                kind: TargetKind::Driver,
                activation: driver_activation,
                signal: TargetSignal::Local,
            });
        }
        {
            let rt = self.nodes.get_mut(&driver).unwrap();
            node_activation.record().state().increment_required();
            rt.targets.push(Target {
                node,
                kind: TargetKind::Node,
                activation: node_activation,
                signal: TargetSignal::Local,
            });
        }
    }

    /// Undo [`Self::add_node`].
    fn remove_node(&mut self, node: NodeId) {
        let driver = match self.nodes.get(&node) {
            Some(rt) if rt.added => rt.driver,
            _ => return,
        };
        trace!("data loop: remove node {} from driver {}", node, driver);

        if let Some(rt) = self.nodes.get_mut(&node) {
            if let Some(pos) = rt.targets.iter().position(|t| t.kind == TargetKind::Driver) {
                let target = rt.targets.remove(pos);
                target.activation.record().state().decrement_required();
            }
            rt.added = false;
        }
        if let Some(rt) = self.nodes.get_mut(&driver) {
            if let Some(pos) = rt
                .targets
                .iter()
                .position(|t| t.kind == TargetKind::Node && t.node == node)
            {
                let target = rt.targets.remove(pos);
                target.activation.record().state().decrement_required();
            }
        }
    }

    /// Driver clock tick (or exported-node completion report).
    fn handle_ready(&mut self, node: NodeId, status: ProcessStatus) {
        let (is_master_driver, is_slaved_driver, added) = match self.nodes.get(&node) {
            Some(rt) => (
                rt.driver == rt.id && rt.master,
                rt.is_driver && !rt.master,
                rt.added,
            ),
            None => return,
        };

        if is_master_driver {
            if !added {
                // The driver is not running; ignore stray ticks.
                return;
            }
            let activation = self.nodes.get(&node).map(|n| n.activation.clone()).unwrap();
            let record = activation.record();

            if record.running() {
                // The previous cycle never completed. Dump every target's
                // timestamps and kick the driver entry to re-arm the graph.
                self.metrics.watchdog_trips.fetch_add(1, Ordering::Relaxed);
                warn!("⏱️ DATA_LOOP: driver {} graph not finished", node);
                self.dump_states(node);
                self.process_node(node);
            }

            if let Some(rt) = self.nodes.get(&node) {
                for target in &rt.targets {
                    let t = target.activation.record();
                    t.state().reset();
                    t.set_status(NodeStatus::NotTriggered);
                }
            }
            record.set_running(true);
            self.metrics.cycles_started.fetch_add(1, Ordering::Relaxed);
            crate::graph_debug!(
                "cycle {}: driver {} armed, quantum {}",
                self.metrics.cycles_started(),
                node,
                record.position.size()
            );

            // The driver processes first and publishes clock and position
            // before anything downstream wakes up.
            if let Some(backend) = self.nodes.get(&node).and_then(|n| n.backend.clone()) {
                let driver_status = backend.process();
                record.state().set_status(driver_status.as_i32());
            }
            let nsec = monotonic_nanos();
            record.set_status(NodeStatus::Finished);
            record.set_finish_time(nsec);

            self.trigger_targets(node, nsec);
            return;
        }

        if is_slaved_driver {
            // A driver-capable node slaved to another driver does not run
            // cycles of its own.
            return;
        }

        self.resume_node(node, status);
    }

    /// Decrement every target of `from`; signal the ones reaching zero.
    fn trigger_targets(&mut self, from: NodeId, nsec: u64) {
        let to_signal: Vec<(NodeId, TargetSignal)> = {
            let rt = match self.nodes.get(&from) {
                Some(rt) => rt,
                None => return,
            };
            rt.targets
                .iter()
                .filter_map(|target| {
                    let record = target.activation.record();
                    trace!(
                        "data loop: node {} pending {}/{}",
                        target.node,
                        record.state().pending(),
                        record.state().required()
                    );
                    if record.state().dec_pending() {
                        record.set_status(NodeStatus::Triggered);
                        record.set_signal_time(nsec);
                        Some((target.node, target.signal.clone()))
                    } else {
                        None
                    }
                })
                .collect()
        };

        for (node, signal) in to_signal {
            match signal {
                TargetSignal::Local => self.process_node(node),
                TargetSignal::Custom(raise) => raise(),
            }
        }
    }

    /// Run one node's quantum: input mixes, backend process, then the
    /// decrement-and-signal walk over its own target list.
    fn process_node(&mut self, node: NodeId) {
        let (activation, backend, is_completion_kick, exported) = match self.nodes.get(&node) {
            Some(rt) => (
                rt.activation.clone(),
                rt.backend.clone(),
                rt.driver == rt.id && rt.master,
                rt.exported,
            ),
            None => return,
        };
        let record = activation.record();

        if is_completion_kick {
            // The driver's own entry reached zero: every routed node has
            // finished, the cycle is complete.
            let nsec = monotonic_nanos();
            record.set_status(NodeStatus::Finished);
            record.set_signal_time(record.finish_time());
            record.set_finish_time(nsec);
            record.set_running(false);
            self.metrics.cycles_completed.fetch_add(1, Ordering::Relaxed);
            crate::graph_debug!(
                "cycle {}: driver {} finished in {}ns",
                self.metrics.cycles_completed(),
                node,
                record.finish_time().saturating_sub(record.signal_time())
            );
            trace!(
                "data loop: driver {} cycle complete wait:{} run:{}",
                node,
                record.awake_time().saturating_sub(record.signal_time()),
                record.finish_time().saturating_sub(record.awake_time())
            );
            return;
        }

        record.set_status(NodeStatus::Awake);
        record.set_awake_time(monotonic_nanos());
        self.metrics.nodes_processed.fetch_add(1, Ordering::Relaxed);

        if let Some(rt) = self.nodes.get(&node) {
            for port in &rt.input_ports {
                port.mix_process();
            }
        }

        let status = match backend {
            Some(backend) => backend.process(),
            None => ProcessStatus::Ok,
        };
        record.state().set_status(status.as_i32());

        match status {
            ProcessStatus::Async => {
                trace!("data loop: node {} async continue", node);
            }
            ProcessStatus::Ok if exported => {
                trace!("data loop: exported node {} continues elsewhere", node);
            }
            _ => self.resume_node(node, status),
        }
    }

    /// Completion half of a node's cycle.
    fn resume_node(&mut self, node: NodeId, status: ProcessStatus) {
        if status == ProcessStatus::HaveBuffer {
            if let Some(rt) = self.nodes.get(&node) {
                for port in &rt.output_ports {
                    port.tee_process();
                }
            }
        }

        let nsec = monotonic_nanos();
        if let Some(rt) = self.nodes.get(&node) {
            let record = rt.activation.record();
            record.set_status(NodeStatus::Finished);
            record.set_finish_time(nsec);
        }

        self.trigger_targets(node, nsec);
    }

    fn handle_reuse_buffer(&mut self, node: NodeId, port_id: PortId, buffer_id: u32) {
        trace!(
            "data loop: node {} reuse buffer {} on port {}",
            node,
            buffer_id,
            port_id
        );
        if let Some(rt) = self.nodes.get(&node) {
            if let Some(port) = rt.input_ports.iter().find(|p| p.port_id == port_id) {
                port.io.set_status(IoBuffers::STATUS_NEED_BUFFER);
            }
        }
    }

    /// Diagnostic dump of all targets of a stuck driver.
    fn dump_states(&self, driver: NodeId) {
        let rt = match self.nodes.get(&driver) {
            Some(rt) => rt,
            None => return,
        };
        for target in &rt.targets {
            let a = target.activation.record();
            warn!(
                "node {}: required:{} s:{} a:{} f:{} waiting:{} process:{} status:{:?}",
                target.node,
                a.state().required(),
                a.signal_time(),
                a.awake_time(),
                a.finish_time(),
                a.awake_time().saturating_sub(a.signal_time()),
                a.finish_time().saturating_sub(a.awake_time()),
                a.status()
            );
        }
    }
}
