//! The graph core: registries, dispatch and the cross-entity state machines.
//!
//! One [`GraphCore`] value owns every node and link (spec'd as an arena of
//! id-indexed entities), the work queue, the backend event channel and the
//! data-loop handle. All methods run on the main thread; realtime-observed
//! state is reconciled exclusively through the invoke queue.

use std::collections::{HashMap, VecDeque};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;

use colored::Colorize;
use tracing::{debug, info, trace, warn};

use crate::graph::backend::{
    seq_is_async, seq_number, BackendCallbacks, BackendCommand, BackendEvent, BackendEventSender,
    BufferPool, Completion, IoKind, NodeBackend,
};
use crate::graph::data_loop::{DataLoopHandle, DataLoopMetrics};
use crate::graph::error::{GraphError, Result};
use crate::graph::events::{CoreEvent, LinkEvent, ListenerList, NodeEvent, PortEvent};
use crate::graph::invoke::{InvokeOp, Target, TargetKind, TargetSignal};
use crate::graph::link::{Link, LinkKey};
use crate::graph::memblock::Activation;
use crate::graph::node::Node;
use crate::graph::params::{self, MediaFormat, ParamId, ParamValue};
use crate::graph::port::Port;
use crate::graph::types::{
    Direction, GraphConfig, LinkId, LinkState, NodeChangeMask, NodeId, NodeState, PortId,
    PortState, Properties,
};
use crate::graph::work_queue::{WorkKind, WorkQueue};

/// Callback parked in the work queue; receives the core and the completion
/// result code.
pub type WorkFn = Box<dyn FnOnce(&mut GraphCore, i32) + Send>;

/// Aggregate counters for observers.
#[derive(Debug, Clone, serde::Serialize)]
pub struct GraphStats {
    pub n_nodes: usize,
    pub n_links: usize,
    pub cycles_started: u64,
    pub cycles_completed: u64,
    pub nodes_processed: u64,
    pub watchdog_trips: u64,
}

/// The single value owning the whole graph.
pub struct GraphCore {
    config: GraphConfig,
    nodes: HashMap<NodeId, Node>,
    links: HashMap<LinkId, Link>,
    link_registry: HashMap<LinkKey, LinkId>,
    /// Driver-eligible nodes in registration order; election ties break on
    /// this order.
    driver_list: Vec<NodeId>,
    registration_order: Vec<NodeId>,
    next_id: u32,
    next_seq: u32,
    work: WorkQueue<WorkFn>,
    backend_events_tx: Sender<(NodeId, BackendEvent)>,
    backend_events_rx: Receiver<(NodeId, BackendEvent)>,
    deferred_events: VecDeque<(NodeId, BackendEvent)>,
    data_loop: DataLoopHandle,
    pub listeners: ListenerList<CoreEvent>,
}

impl GraphCore {
    pub fn new(config: GraphConfig) -> GraphCore {
        info!(
            "🎛️ {}: creating core '{}'",
            "GRAPH_CORE".on_purple().white(),
            config.name
        );
        let (backend_events_tx, backend_events_rx) = mpsc::channel();
        let data_loop = DataLoopHandle::start(&config.name);
        GraphCore {
            config,
            nodes: HashMap::new(),
            links: HashMap::new(),
            link_registry: HashMap::new(),
            driver_list: Vec::new(),
            registration_order: Vec::new(),
            next_id: 0,
            next_seq: 0,
            work: WorkQueue::new(),
            backend_events_tx,
            backend_events_rx,
            deferred_events: VecDeque::new(),
            data_loop,
            listeners: ListenerList::new(),
        }
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    pub fn stats(&self) -> GraphStats {
        let metrics = self.data_loop.metrics();
        GraphStats {
            n_nodes: self.nodes.len(),
            n_links: self.links.len(),
            cycles_started: metrics.cycles_started(),
            cycles_completed: metrics.cycles_completed(),
            nodes_processed: metrics.nodes_processed(),
            watchdog_trips: metrics.watchdog_trips(),
        }
    }

    pub fn loop_metrics(&self) -> Arc<DataLoopMetrics> {
        self.data_loop.metrics()
    }

    fn alloc_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn alloc_seq(&mut self) -> u32 {
        self.next_seq = (self.next_seq + 1) & 0x7fff_ffff;
        if self.next_seq == 0 {
            self.next_seq = 1;
        }
        self.next_seq
    }

    // --- Accessors -----------------------------------------------------

    pub fn node(&self, id: NodeId) -> Result<&Node> {
        self.nodes.get(&id).ok_or(GraphError::NoEntity(id))
    }

    pub fn node_mut(&mut self, id: NodeId) -> Result<&mut Node> {
        self.nodes.get_mut(&id).ok_or(GraphError::NoEntity(id))
    }

    pub fn link(&self, id: LinkId) -> Result<&Link> {
        self.links.get(&id).ok_or(GraphError::NoEntity(id))
    }

    pub fn link_mut(&mut self, id: LinkId) -> Result<&mut Link> {
        self.links.get_mut(&id).ok_or(GraphError::NoEntity(id))
    }

    pub fn port(&self, node: NodeId, direction: Direction, port_id: PortId) -> Result<&Port> {
        self.node(node)?
            .ports(direction)
            .get(&port_id)
            .ok_or(GraphError::NoEntity(port_id))
    }

    pub fn port_mut(
        &mut self,
        node: NodeId,
        direction: Direction,
        port_id: PortId,
    ) -> Result<&mut Port> {
        self.node_mut(node)?
            .ports_mut(direction)
            .get_mut(&port_id)
            .ok_or(GraphError::NoEntity(port_id))
    }

    /// Find a link by its endpoints.
    pub fn find_link(
        &self,
        output_node: NodeId,
        output_port: PortId,
        input_node: NodeId,
        input_port: PortId,
    ) -> Option<LinkId> {
        self.link_registry
            .get(&(output_node, output_port, input_node, input_port))
            .copied()
    }

    // --- Node lifecycle ------------------------------------------------

    /// Create a node: allocates its shared activation block and makes it
    /// known to the data loop. The node is invisible until registered.
    pub fn node_new(&mut self, name: &str, properties: Properties) -> Result<NodeId> {
        let id = self.alloc_id();
        let signal = self.data_loop.signal(id);
        let node = Node::new(id, name, properties, signal, &self.config)?;

        self.data_loop.invoke(InvokeOp::RegisterNode {
            node: id,
            activation: node.activation.clone(),
            is_driver: node.is_driver,
            exported: false,
        });
        if node.is_driver {
            self.driver_list.push(id);
        }
        self.nodes.insert(id, node);
        Ok(id)
    }

    /// Attach the processing backend. Fails with `exists` when one is
    /// already attached.
    pub fn node_set_implementation(
        &mut self,
        id: NodeId,
        backend: Arc<dyn NodeBackend>,
    ) -> Result<()> {
        let events_tx = self.backend_events_tx.clone();
        {
            let node = self.node_mut(id)?;
            if node.backend.is_some() {
                return Err(GraphError::exists("node already has an implementation"));
            }
            debug!("node {}: set implementation", id);

            backend.set_event_sender(BackendEventSender::new(id, events_tx));
            let ready_signal = node.signal.clone();
            let reuse_signal = node.signal.clone();
            backend.set_callbacks(Some(BackendCallbacks::new(
                move |status| ready_signal.ready(status),
                move |port_id, buffer_id| reuse_signal.reuse_buffer(port_id, buffer_id),
            )));

            if let Err(e) = backend.set_io(IoKind::Position, Some(node.activation.clone())) {
                warn!("node {}: set position io: {}", id, e);
            }
            if let Err(e) = backend.set_io(IoKind::Clock, Some(node.activation.clone())) {
                warn!("node {}: set clock io: {}", id, e);
            }

            node.backend = Some(backend.clone());
        }
        self.data_loop.invoke(InvokeOp::SetBackend {
            node: id,
            backend: Some(backend),
        });
        // Backends typically announce their info and ports on attach.
        self.dispatch();
        Ok(())
    }

    /// Insert the node into the registry, making it visible: assigns the
    /// stable id into its info, registers its ports, emits "initialized"
    /// and moves it to suspended.
    pub fn node_register(&mut self, id: NodeId, properties: Option<Properties>) -> Result<()> {
        let driver_changed = {
            let node = self.node_mut(id)?;
            if node.registered {
                return Err(GraphError::exists("node already registered"));
            }
            if node.backend.is_none() {
                return Err(GraphError::bad_state(
                    "cannot register a node without an implementation",
                ));
            }
            let mut driver_changed = false;
            if let Some(props) = properties {
                driver_changed = node.update_properties(&props).1;
            }
            node.registered = true;
            node.info.id = id;
            let id_string = id.to_string();
            node.properties
                .set(crate::graph::types::keys::NODE_ID, &id_string);
            node.activation.record().position.clock.set_id(id);

            info!(
                "✅ {}: registered node {} \"{}\"",
                "GRAPH_CORE".on_purple().white(),
                id,
                node.info.name
            );
            node.listeners.emit(&NodeEvent::Initialized);
            driver_changed
        };
        if driver_changed {
            self.sync_driver_flag(id);
        }
        self.registration_order.push(id);
        self.listeners.emit(&CoreEvent::NodeAdded { node: id });
        self.node_update_state(id, NodeState::Suspended, None);
        Ok(())
    }

    /// Drive the node state machine towards `state`.
    ///
    /// Asynchronous backend completions are reconciled through the work
    /// queue; a transition requested in an inconsistent phase (running with
    /// unready links, inactive node) is silently deferred.
    pub fn node_set_state(&mut self, id: NodeId, state: NodeState) -> Result<()> {
        let old = self.node(id)?.info.state;
        debug!(
            "node {}: set state {} -> {}",
            id,
            old.as_str(),
            state.as_str()
        );
        if state == NodeState::Creating {
            return Err(GraphError::invalid("cannot request the creating state"));
        }
        if old == NodeState::Creating {
            // Nothing can leave creating except registration itself.
            return Err(GraphError::bad_state(
                "node is still being created; register it first",
            ));
        }

        // Re-requesting a transition that is already in flight is a no-op;
        // any other request supersedes the pending one.
        if state == NodeState::Running && self.work.has_kind(id, WorkKind::NodeState) {
            return Ok(());
        }
        self.work.cancel(id, WorkKind::NodeState);

        if old == state {
            return Ok(());
        }

        match state {
            NodeState::Creating => unreachable!(),
            NodeState::Suspended => {
                self.suspend_node(id)?;
            }
            NodeState::Idle => {
                let (active, pause_on_idle) = {
                    let node = self.node(id)?;
                    (node.active, node.pause_on_idle)
                };
                if active {
                    self.pause_node(id, pause_on_idle)?;
                }
                self.node_update_state(id, NodeState::Idle, None);
            }
            NodeState::Running => {
                if !self.node(id)?.active {
                    return Ok(());
                }
                self.node_activate_links(id);
                match self.start_node(id)? {
                    None => {
                        // Gate not met; a later link-ready transition
                        // completes the deferred start.
                    }
                    Some(Completion::Done) => {
                        self.node_update_state(id, NodeState::Running, None);
                    }
                    Some(Completion::Async(seq)) => {
                        self.work.add(
                            id,
                            seq,
                            WorkKind::NodeState,
                            Box::new(move |core, res| {
                                if res < 0 {
                                    core.node_update_state(
                                        id,
                                        NodeState::Error,
                                        Some(format!("error changing node state: {res}")),
                                    );
                                } else {
                                    core.node_update_state(id, NodeState::Running, None);
                                }
                            }),
                        );
                    }
                }
            }
            NodeState::Error => {
                self.node_update_state(id, NodeState::Error, None);
            }
        }
        Ok(())
    }

    /// Activate or deactivate a node. Deactivating forces idle; activating
    /// cascades link activation and recalculates the graph.
    pub fn node_set_active(&mut self, id: NodeId, active: bool) -> Result<()> {
        let old = self.node(id)?.active;
        if old == active {
            return Ok(());
        }
        debug!("node {}: {}", id, if active { "activate" } else { "deactivate" });

        if !active {
            let _ = self.node_set_state(id, NodeState::Idle);
        }
        {
            let node = self.node_mut(id)?;
            node.active = active;
            node.listeners.emit(&NodeEvent::ActiveChanged { active });
        }
        if active {
            if self.node(id)?.info.state == NodeState::Suspended {
                self.node_update_state(id, NodeState::Idle, None);
            }
            self.node_activate_links(id);
        }
        self.recalc_graph();
        if active {
            // Links that were already ready while the node was inactive can
            // complete the deferred start now.
            let should_run = {
                let node = self.node(id)?;
                node.links_ready()
                    && node.n_used_input_links + node.n_used_output_links > 0
            };
            if should_run {
                let _ = self.node_set_state(id, NodeState::Running);
            }
        }
        Ok(())
    }

    /// Reassign the node's driver. The target-list migration is marshalled
    /// through the invoke queue so the realtime thread observes a
    /// consistent list.
    pub fn node_set_driver(&mut self, id: NodeId, driver: NodeId) -> Result<()> {
        let driver = if driver == crate::graph::types::ID_INVALID {
            id
        } else {
            driver
        };
        let driver_activation = self.node(driver)?.activation.clone();
        let (old, is_driver, master, backend) = {
            let node = self.node_mut(id)?;
            let old = node.driver_id;
            node.master = node.is_driver && driver == id;
            (old, node.is_driver, node.master, node.backend.clone())
        };

        if old != driver {
            {
                let node = self.node_mut(id)?;
                node.driver_id = driver;
                node.listeners
                    .emit(&NodeEvent::DriverChanged { old, new: driver });
            }
            trace!("node {}: driver {} -> {}", id, old, driver);

            // Point the backend's position io at the new driver's clock.
            if let Some(backend) = backend {
                if let Err(e) = backend.set_io(IoKind::Position, Some(driver_activation)) {
                    warn!("node {}: set position: {}", id, e);
                }
            }
        }

        self.data_loop.invoke(InvokeOp::SetDriverFlags {
            node: id,
            is_driver,
            master,
        });
        if old != driver {
            self.data_loop.invoke(InvokeOp::MoveNode { node: id, driver });
        }
        Ok(())
    }

    /// Update the node property bag, re-reading the behavior flags.
    pub fn node_update_properties(&mut self, id: NodeId, props: &Properties) -> Result<usize> {
        let (changed, driver_changed) = self.node_mut(id)?.update_properties(props);
        if driver_changed {
            self.sync_driver_flag(id);
            self.recalc_graph();
        }
        Ok(changed)
    }

    /// Mark the node's activation record as signalled from another process.
    pub fn node_set_exported(&mut self, id: NodeId, exported: bool) -> Result<()> {
        self.node_mut(id)?.exported = exported;
        self.data_loop
            .invoke(InvokeOp::SetExported { node: id, exported });
        Ok(())
    }

    /// Query node parameters, dispatching each result to `callback` as it
    /// arrives on the backend's result channel.
    pub fn node_for_each_param(
        &mut self,
        id: NodeId,
        param_id: ParamId,
        index: u32,
        max: u32,
        filter: Option<&ParamValue>,
        mut callback: impl FnMut(u32, ParamId, u32, u32, &ParamValue),
    ) -> Result<Completion> {
        let backend = self
            .node(id)?
            .backend
            .clone()
            .ok_or_else(|| GraphError::bad_state("node has no implementation"))?;
        let max = if max == 0 { u32::MAX } else { max };
        let seq = self.alloc_seq();
        let completion = backend.enum_params(seq, param_id, index, max, filter)?;
        for (s, pid, idx, next, value) in self.collect_param_results(id, seq) {
            callback(s, pid, idx, next, &value);
        }
        Ok(completion)
    }

    /// Destroy a node: pauses and suspends it, tears down every link and
    /// port, releases the activation block at the next cycle boundary.
    pub fn node_destroy(&mut self, id: NodeId) -> Result<()> {
        self.node(id)?;
        info!(
            "🗑️ {}: destroying node {}",
            "GRAPH_CORE".on_purple().white(),
            id
        );
        self.node_mut(id)?.listeners.emit(&NodeEvent::Destroy);

        let pause_on_idle = self.node(id)?.pause_on_idle;
        let _ = self.pause_node(id, pause_on_idle);
        let _ = self.suspend_node(id);

        // Tear down every link on every port.
        let link_ids = self.collect_node_links(id);
        for link in link_ids {
            let _ = self.link_destroy(link);
        }

        // Destroy the ports.
        let port_keys: Vec<(Direction, PortId)> = {
            let node = self.node(id)?;
            node.input_ports
                .keys()
                .map(|p| (Direction::Input, *p))
                .chain(node.output_ports.keys().map(|p| (Direction::Output, *p)))
                .collect()
        };
        for (direction, port_id) in port_keys {
            let _ = self.port_destroy(id, direction, port_id);
        }

        if let Some(backend) = self.node(id)?.backend.clone() {
            backend.set_callbacks(None);
        }

        self.work.remove_owner(id);
        self.driver_list.retain(|n| *n != id);
        self.registration_order.retain(|n| *n != id);
        for node in self.nodes.values_mut() {
            node.slaves.retain(|n| *n != id);
        }

        // The realtime thread drops its entries at the next drain point;
        // the shared block is freed when the last mapping goes away.
        self.data_loop.invoke(InvokeOp::FreeNode { node: id });
        self.nodes.remove(&id);
        self.listeners.emit(&CoreEvent::NodeRemoved { node: id });
        self.recalc_graph();
        Ok(())
    }

    // --- Node state machine internals ---------------------------------

    /// Unset every port format and force configure, then report suspended.
    fn suspend_node(&mut self, id: NodeId) -> Result<()> {
        debug!("node {}: suspend", id);
        let port_keys: Vec<(Direction, PortId)> = {
            let node = self.node(id)?;
            node.input_ports
                .keys()
                .map(|p| (Direction::Input, *p))
                .chain(node.output_ports.keys().map(|p| (Direction::Output, *p)))
                .collect()
        };
        for (direction, port_id) in port_keys {
            if let Err(e) = self.port_set_param(id, direction, port_id, ParamId::Format, 0, None) {
                warn!("error unset format {}: {}", direction.as_str(), e);
            }
            // Force configure even when the backend answered asynchronously.
            if let Ok(port) = self.port_mut(id, direction, port_id) {
                port.update_state(PortState::Configure);
            }
        }
        self.data_loop.invoke(InvokeOp::RemoveNode { node: id });
        self.node_update_state(id, NodeState::Suspended, None);
        Ok(())
    }

    /// Deactivate links, leave the driver's target list and optionally send
    /// the backend Pause command.
    fn pause_node(&mut self, id: NodeId, send_pause: bool) -> Result<()> {
        if self.node(id)?.info.state <= NodeState::Idle {
            return Ok(());
        }
        debug!("node {}: pause", id);
        self.node_deactivate_links(id);
        self.data_loop.invoke(InvokeOp::RemoveNode { node: id });

        if send_pause {
            if let Some(backend) = self.node(id)?.backend.clone() {
                if let Err(e) = backend.send_command(BackendCommand::Pause) {
                    debug!("node {}: pause error {}", id, e);
                }
            }
        }
        Ok(())
    }

    /// Send Start when every used link is ready; `None` means the start is
    /// deferred until link readiness.
    fn start_node(&mut self, id: NodeId) -> Result<Option<Completion>> {
        let (state, ready, counts, backend) = {
            let node = self.node(id)?;
            (
                node.info.state,
                node.links_ready(),
                (
                    node.n_ready_output_links,
                    node.n_used_output_links,
                    node.n_ready_input_links,
                    node.n_used_input_links,
                ),
                node.backend.clone(),
            )
        };
        if state >= NodeState::Running {
            return Ok(Some(Completion::Done));
        }
        debug!(
            "node {}: start node {} {} {} {}",
            id, counts.0, counts.1, counts.2, counts.3
        );
        if !ready {
            return Ok(None);
        }
        let backend =
            backend.ok_or_else(|| GraphError::bad_state("node has no implementation"))?;
        match backend.send_command(BackendCommand::Start) {
            Ok(completion) => Ok(Some(completion)),
            Err(e) => {
                debug!("node {}: start node error {}", id, e);
                Err(e)
            }
        }
    }

    /// Record the state move and marshal its scheduling consequences.
    fn node_update_state(&mut self, id: NodeId, state: NodeState, error: Option<String>) {
        let moved = match self.nodes.get_mut(&id) {
            Some(node) => node.update_state(state, error).is_some(),
            None => false,
        };
        if moved && state == NodeState::Running {
            let driver = self.nodes[&id].driver_id;
            self.data_loop.invoke(InvokeOp::AddNode { node: id, driver });
        }
    }

    /// Cascade activation over every attached link.
    fn node_activate_links(&mut self, id: NodeId) {
        let links = self.collect_node_links(id);
        for link in links {
            let _ = self.link_activate(link);
        }
    }

    /// Cascade deactivation over every attached link.
    fn node_deactivate_links(&mut self, id: NodeId) {
        let links = self.collect_node_links(id);
        for link in links {
            let _ = self.link_deactivate(link);
        }
    }

    fn collect_node_links(&self, id: NodeId) -> Vec<LinkId> {
        let mut out = Vec::new();
        if let Some(node) = self.nodes.get(&id) {
            for port in node.input_ports.values() {
                out.extend(port.links.iter().copied());
            }
            for port in node.output_ports.values() {
                out.extend(port.links.iter().copied());
            }
        }
        out
    }

    fn sync_driver_flag(&mut self, id: NodeId) {
        let is_driver = self.nodes.get(&id).map(|n| n.is_driver).unwrap_or(false);
        let listed = self.driver_list.contains(&id);
        if is_driver && !listed {
            self.driver_list.push(id);
        } else if !is_driver && listed {
            self.driver_list.retain(|n| *n != id);
        }
    }

    // --- Ports ---------------------------------------------------------

    /// Attach a port to a node and register its io with the realtime side.
    pub fn add_port(&mut self, node: NodeId, port: Port) -> Result<()> {
        let direction = port.direction;
        let port_id = port.port_id;
        let io = port.io.clone();

        self.node_mut(node)?.add_port(port)?;

        if let Ok(port) = self.port_mut(node, direction, port_id) {
            if port.state <= PortState::Init {
                port.update_state(PortState::Configure);
            }
        }
        self.data_loop.invoke(InvokeOp::AddPort {
            node,
            direction,
            port_id,
            io,
        });
        if let Ok(n) = self.node_mut(node) {
            n.emit_info_changed();
        }
        Ok(())
    }

    /// Remove a port: destroys its links first, then drops the realtime io.
    pub fn port_destroy(
        &mut self,
        node: NodeId,
        direction: Direction,
        port_id: PortId,
    ) -> Result<()> {
        let links = self.port(node, direction, port_id)?.links.clone();
        for link in links {
            let _ = self.link_destroy(link);
        }
        self.data_loop.invoke(InvokeOp::RemovePort {
            node,
            direction,
            port_id,
        });
        if let Some(mut port) = self
            .nodes
            .get_mut(&node)
            .and_then(|n| n.take_port(direction, port_id))
        {
            port.listeners.emit(&PortEvent::Destroy);
        }
        if let Ok(n) = self.node_mut(node) {
            n.emit_info_changed();
        }
        Ok(())
    }

    /// Set a parameter on a port, forwarding to the backend and driving the
    /// port state machine for Format.
    pub fn port_set_param(
        &mut self,
        node: NodeId,
        direction: Direction,
        port_id: PortId,
        id: ParamId,
        flags: u32,
        param: Option<&ParamValue>,
    ) -> Result<Completion> {
        self.port(node, direction, port_id)?;
        let backend = self
            .node(node)?
            .backend
            .clone()
            .ok_or_else(|| GraphError::bad_state("node has no implementation"))?;

        let result = backend.port_set_param(direction, port_id, id, flags, param);
        trace!(
            "port {}:{}: set param {:?} -> {:?}",
            node,
            port_id,
            id,
            result
        );

        if id == ParamId::Format {
            let port = self.port_mut(node, direction, port_id)?;
            // Setting the format always destroys the negotiated buffers.
            port.allocation = None;
            match &result {
                Err(_) => {
                    port.current_format = None;
                    port.update_state(PortState::Configure);
                }
                Ok(_) if param.is_none() => {
                    port.current_format = None;
                    port.update_state(PortState::Configure);
                }
                Ok(Completion::Done) => {
                    port.current_format = param.and_then(|p| p.as_format().copied());
                    port.update_state(PortState::Ready);
                }
                Ok(Completion::Async(_)) => {
                    port.current_format = param.and_then(|p| p.as_format().copied());
                }
            }
        }
        result
    }

    /// Bind or release a buffer pool on a port.
    pub fn port_use_buffers(
        &mut self,
        node: NodeId,
        direction: Direction,
        port_id: PortId,
        pool: Option<Arc<BufferPool>>,
    ) -> Result<Completion> {
        let state = self.port(node, direction, port_id)?.state;
        if pool.is_none() && state <= PortState::Ready {
            return Ok(Completion::Done);
        }
        if pool.is_some() && state < PortState::Ready {
            return Err(GraphError::bad_state(format!(
                "port in state {} cannot take buffers",
                state.as_str()
            )));
        }
        let backend = self
            .node(node)?
            .backend
            .clone()
            .ok_or_else(|| GraphError::bad_state("node has no implementation"))?;
        let completion = backend.port_use_buffers(direction, port_id, pool.clone())?;

        let port = self.port_mut(node, direction, port_id)?;
        port.allocation = pool.clone();
        if pool.is_none() && state == PortState::Paused {
            port.update_state(PortState::Ready);
        }
        Ok(completion)
    }

    // --- Links ---------------------------------------------------------

    /// Create a link between an output and an input port.
    ///
    /// Validates both endpoints, refuses same-node pairs, duplicates and
    /// cycle-forming links. The link starts negotiating immediately when
    /// both nodes are active.
    pub fn link_new(
        &mut self,
        output_node: NodeId,
        output_port: PortId,
        input_node: NodeId,
        input_port: PortId,
        properties: Properties,
    ) -> Result<LinkId> {
        self.port(output_node, Direction::Output, output_port)?;
        self.port(input_node, Direction::Input, input_port)?;

        if output_node == input_node {
            return Err(GraphError::invalid("cannot link ports of the same node"));
        }
        let key = (output_node, output_port, input_node, input_port);
        if self.link_registry.contains_key(&key) {
            return Err(GraphError::exists("link already exists"));
        }
        if self.can_reach(input_node, output_node) {
            return Err(GraphError::invalid("link would create a cycle"));
        }

        let id = self.alloc_id();
        let link = Link::new(
            id,
            output_node,
            output_port,
            input_node,
            input_port,
            properties,
        );
        info!(
            "🔗 {}: link {} {}:{} -> {}:{}",
            "GRAPH_CORE".on_purple().white(),
            id,
            output_node,
            output_port,
            input_node,
            input_port
        );

        self.links.insert(id, link);
        self.link_registry.insert(key, id);
        self.port_mut(output_node, Direction::Output, output_port)?
            .links
            .push(id);
        self.port_mut(input_node, Direction::Input, input_port)?
            .links
            .push(id);
        if let Ok(port) = self.port_mut(output_node, Direction::Output, output_port) {
            port.listeners.emit(&PortEvent::LinkAdded { link: id });
        }
        if let Ok(port) = self.port_mut(input_node, Direction::Input, input_port) {
            port.listeners.emit(&PortEvent::LinkAdded { link: id });
        }
        self.listeners.emit(&CoreEvent::LinkAdded { link: id });

        let both_active =
            self.nodes[&output_node].active && self.nodes[&input_node].active;
        if both_active {
            let _ = self.link_prepare(id);
        }
        self.recalc_graph();
        Ok(id)
    }

    /// Move a link towards active: negotiate, allocate and install the
    /// realtime wiring once paused.
    pub fn link_activate(&mut self, id: LinkId) -> Result<()> {
        let state = self.link(id)?.state();
        debug!("link {}: activate in state {}", id, state.as_str());
        self.link_prepare(id)?;
        if self.link(id)?.state() == LinkState::Paused {
            self.link_activate_rt(id);
        }
        Ok(())
    }

    /// Inverse of activation: drops the realtime wiring, decrements the
    /// ready/used counters and lets fully idle nodes fall back to idle.
    pub fn link_deactivate(&mut self, id: LinkId) -> Result<()> {
        let (prepared, activated, passive, output_node, output_port, input_node, input_port) = {
            let link = self.link(id)?;
            (
                link.prepared,
                link.activated,
                link.passive,
                link.output_node,
                link.output_port,
                link.input_node,
                link.input_port,
            )
        };
        if !prepared {
            return Ok(());
        }
        debug!("link {}: deactivate (activated: {})", id, activated);

        if activated {
            self.data_loop.invoke(InvokeOp::DeactivateLink {
                link: id,
                output_node,
                output_port,
                input_node,
                input_port,
            });
            if let Some(node) = self.nodes.get_mut(&output_node) {
                node.n_ready_output_links -= 1;
            }
            if let Some(node) = self.nodes.get_mut(&input_node) {
                node.n_ready_input_links -= 1;
            }
        }
        {
            let link = self.link_mut(id)?;
            link.prepared = false;
            link.activated = false;
            link.out_have_buffers = false;
            link.in_have_buffers = false;
        }
        if let Some(node) = self.nodes.get_mut(&output_node) {
            node.n_used_output_links -= 1;
            if passive {
                node.idle_used_output_links -= 1;
            }
        }
        if let Some(node) = self.nodes.get_mut(&input_node) {
            node.n_used_input_links -= 1;
            if passive {
                node.idle_used_input_links -= 1;
            }
        }

        for endpoint in [input_node, output_node] {
            let drop_to_idle = self
                .nodes
                .get(&endpoint)
                .map(|n| n.links_idle() && n.info.state > NodeState::Idle)
                .unwrap_or(false);
            if drop_to_idle {
                let _ = self.node_set_state(endpoint, NodeState::Idle);
            }
        }

        if self.link(id)?.state() > LinkState::Init {
            self.link_update_state(id, LinkState::Init, None);
        }
        Ok(())
    }

    /// Destroy a link, removing it from both endpoints and the registry.
    pub fn link_destroy(&mut self, id: LinkId) -> Result<()> {
        let key = self.link(id)?.key();
        debug!("link {}: destroy", id);
        self.link_mut(id)?.listeners.emit(&LinkEvent::Destroy);
        let _ = self.link_deactivate(id);

        let (output_node, output_port, input_node, input_port) = key;
        if let Ok(port) = self.port_mut(output_node, Direction::Output, output_port) {
            port.links.retain(|l| *l != id);
            port.listeners.emit(&PortEvent::LinkRemoved { link: id });
        }
        if let Ok(port) = self.port_mut(input_node, Direction::Input, input_port) {
            port.links.retain(|l| *l != id);
            port.listeners.emit(&PortEvent::LinkRemoved { link: id });
        }
        self.link_registry.remove(&key);
        self.links.remove(&id);
        self.listeners.emit(&CoreEvent::LinkRemoved { link: id });
        self.recalc_graph();
        Ok(())
    }

    // --- Link state machine internals ----------------------------------

    /// Count the link into both nodes and kick the negotiation chain.
    fn link_prepare(&mut self, id: LinkId) -> Result<()> {
        let (prepared, passive, output_node, input_node) = {
            let link = self.link(id)?;
            (link.prepared, link.passive, link.output_node, link.input_node)
        };
        if prepared {
            self.link_check_states(id);
            return Ok(());
        }
        debug!("link {}: prepare", id);
        self.link_mut(id)?.prepared = true;
        if let Some(node) = self.nodes.get_mut(&output_node) {
            node.n_used_output_links += 1;
            if passive {
                node.idle_used_output_links += 1;
            }
        }
        if let Some(node) = self.nodes.get_mut(&input_node) {
            node.n_used_input_links += 1;
            if passive {
                node.idle_used_input_links += 1;
            }
        }
        self.link_check_states(id);
        Ok(())
    }

    /// Push the link forward as far as the port states allow.
    fn link_check_states(&mut self, id: LinkId) {
        let (state, output_node, output_port, input_node, input_port) = match self.links.get(&id) {
            Some(link) => (
                link.state(),
                link.output_node,
                link.output_port,
                link.input_node,
                link.input_port,
            ),
            None => return,
        };
        if matches!(state, LinkState::Error | LinkState::Paused | LinkState::Active) {
            return;
        }

        let nodes_ok = self
            .nodes
            .get(&output_node)
            .zip(self.nodes.get(&input_node))
            .map(|(o, i)| {
                o.info.state != NodeState::Error && i.info.state != NodeState::Error
            })
            .unwrap_or(false);
        if !nodes_ok {
            warn!("link {}: one of the nodes is in error", id);
            return;
        }

        let ports_errored = self
            .port(output_node, Direction::Output, output_port)
            .map(|p| p.state == PortState::Error)
            .unwrap_or(true)
            || self
                .port(input_node, Direction::Input, input_port)
                .map(|p| p.state == PortState::Error)
                .unwrap_or(true);
        if ports_errored {
            self.link_update_state(id, LinkState::Error, Some("ports are in error".into()));
            return;
        }

        if self.link_negotiate(id).is_err() {
            return;
        }
        let _ = self.link_allocate(id);

        // A link re-prepared after deactivation may find both ports still
        // negotiated and holding buffers; it can go straight back to paused.
        let short_circuit = {
            match self.links.get(&id) {
                Some(link) if link.state() <= LinkState::Negotiating => {
                    self.port(output_node, Direction::Output, output_port)
                        .map(|p| p.state == PortState::Paused)
                        .unwrap_or(false)
                        && self
                            .port(input_node, Direction::Input, input_port)
                            .map(|p| p.state == PortState::Paused)
                            .unwrap_or(false)
                }
                _ => false,
            }
        };
        if short_circuit {
            if let Some(link) = self.links.get_mut(&id) {
                link.out_have_buffers = true;
                link.in_have_buffers = true;
            }
            self.link_update_state(id, LinkState::Paused, None);
        }
    }

    /// Negotiate a common format and set it on both ports. Asynchronous
    /// completions park a work-queue entry holding the link in negotiating.
    fn link_negotiate(&mut self, id: LinkId) -> Result<()> {
        let (state, output_node, output_port, input_node, input_port) = {
            let link = self.link(id)?;
            (
                link.state(),
                link.output_node,
                link.output_port,
                link.input_node,
                link.input_port,
            )
        };
        if state >= LinkState::Negotiating {
            return Ok(());
        }

        let out_state = self.port(output_node, Direction::Output, output_port)?.state;
        let in_state = self.port(input_node, Direction::Input, input_port)?.state;
        debug!(
            "link {}: negotiate in_state:{} out_state:{}",
            id,
            in_state.as_str(),
            out_state.as_str()
        );
        if in_state != PortState::Configure && out_state != PortState::Configure {
            return Ok(());
        }

        self.link_update_state(id, LinkState::Negotiating, None);

        let format = match self.find_format(
            (output_node, output_port),
            (input_node, input_port),
        ) {
            Ok(format) => format,
            Err(e) => {
                self.link_update_state(id, LinkState::Error, Some(e.to_string()));
                return Err(e);
            }
        };

        // A configured port on an idle node may renegotiate; a format change
        // suspends the node so the port falls back to configure.
        for (node, direction, port_id, port_state) in [
            (output_node, Direction::Output, output_port, out_state),
            (input_node, Direction::Input, input_port, in_state),
        ] {
            if port_state > PortState::Configure
                && self.nodes[&node].info.state == NodeState::Idle
            {
                let current = self.port(node, direction, port_id)?.current_format;
                if current != Some(format) {
                    debug!("link {}: {} format change, renegotiate", id, direction.as_str());
                    let _ = self.node_set_state(node, NodeState::Suspended);
                }
            }
        }

        for (node, direction, port_id) in [
            (output_node, Direction::Output, output_port),
            (input_node, Direction::Input, input_port),
        ] {
            if self.port(node, direction, port_id)?.state != PortState::Configure {
                continue;
            }
            debug!("link {}: set format on {}", id, direction.as_str());
            match self.port_set_param(
                node,
                direction,
                port_id,
                ParamId::Format,
                0,
                Some(&ParamValue::Format(format)),
            ) {
                Err(e) => {
                    let msg = format!("error set {} format: {}", direction.as_str(), e);
                    self.link_update_state(id, LinkState::Error, Some(msg.clone()));
                    return Err(GraphError::Invalid(msg));
                }
                Ok(Completion::Async(seq)) => {
                    self.work.add(
                        node,
                        seq,
                        WorkKind::LinkReady,
                        Box::new(move |core, res| {
                            core.link_complete_ready(id, direction, res);
                        }),
                    );
                }
                Ok(Completion::Done) => {
                    self.link_complete_ready(id, direction, 0);
                }
            }
        }

        self.link_mut(id)?.set_format(format);
        Ok(())
    }

    /// Completion of a format set: moves the port and, when both sides are
    /// ready, the link into allocating.
    fn link_complete_ready(&mut self, id: LinkId, side: Direction, res: i32) {
        let (node, port_id) = match self.links.get(&id) {
            Some(link) => match side {
                Direction::Output => (link.output_node, link.output_port),
                Direction::Input => (link.input_node, link.input_port),
            },
            None => return,
        };
        if let Ok(port) = self.port_mut(node, side, port_id) {
            if res >= 0 {
                port.update_state(PortState::Ready);
            } else {
                warn!("port {}:{} failed to go to ready", node, port_id);
                // The failing side falls back to configure; the peer port is
                // left in its previous state.
                port.current_format = None;
                port.update_state(PortState::Configure);
            }
        }
        if res < 0 {
            self.link_update_state(
                id,
                LinkState::Error,
                Some(format!("format set failed: {res}")),
            );
            return;
        }

        let both_ready = match self.links.get(&id) {
            Some(link) => {
                self.port(link.output_node, Direction::Output, link.output_port)
                    .map(|p| p.state >= PortState::Ready)
                    .unwrap_or(false)
                    && self
                        .port(link.input_node, Direction::Input, link.input_port)
                        .map(|p| p.state >= PortState::Ready)
                        .unwrap_or(false)
            }
            None => return,
        };
        if both_ready {
            self.link_update_state(id, LinkState::Allocating, None);
            let _ = self.link_allocate(id);
        }
    }

    /// Allocate the shared buffer pool and bind it to both ports.
    fn link_allocate(&mut self, id: LinkId) -> Result<()> {
        let (state, output_node, output_port, input_node, input_port) = {
            let link = self.link(id)?;
            (
                link.state(),
                link.output_node,
                link.output_port,
                link.input_node,
                link.input_port,
            )
        };
        if state != LinkState::Allocating {
            return Ok(());
        }
        debug!("link {}: allocating buffers", id);

        let out_reqs = self.enum_port_buffers(output_node, Direction::Output, output_port);
        let in_reqs = self.enum_port_buffers(input_node, Direction::Input, input_port);
        let reqs = out_reqs
            .unwrap_or_default()
            .merge(&in_reqs.unwrap_or_default());

        let pool = match BufferPool::alloc(reqs.buffers, reqs.size, reqs.stride, reqs.align) {
            Ok(pool) => Arc::new(pool),
            Err(e) => {
                let msg = format!("error alloc buffers: {e}");
                self.link_update_state(id, LinkState::Error, Some(msg.clone()));
                return Err(GraphError::NoMemory(msg));
            }
        };
        debug!(
            "link {}: allocated {} buffers of {} bytes",
            id,
            pool.n_buffers(),
            pool.buffer_size()
        );
        self.link_mut(id)?.pool = Some(pool.clone());

        for (node, direction, port_id) in [
            (output_node, Direction::Output, output_port),
            (input_node, Direction::Input, input_port),
        ] {
            match self.port_use_buffers(node, direction, port_id, Some(pool.clone())) {
                Err(e) => {
                    let msg = format!("error use {} buffers: {}", direction.as_str(), e);
                    self.link_update_state(id, LinkState::Error, Some(msg.clone()));
                    return Err(GraphError::Invalid(msg));
                }
                Ok(Completion::Async(seq)) => {
                    self.work.add(
                        node,
                        seq,
                        WorkKind::LinkPaused,
                        Box::new(move |core, res| {
                            core.link_complete_paused(id, direction, res);
                        }),
                    );
                }
                Ok(Completion::Done) => {
                    self.link_complete_paused(id, direction, 0);
                }
            }
        }
        Ok(())
    }

    /// Completion of a buffer bind: both sides holding buffers pauses the
    /// link, which in turn activates it.
    fn link_complete_paused(&mut self, id: LinkId, side: Direction, res: i32) {
        let (node, port_id) = match self.links.get(&id) {
            Some(link) => match side {
                Direction::Output => (link.output_node, link.output_port),
                Direction::Input => (link.input_node, link.input_port),
            },
            None => return,
        };
        if let Ok(port) = self.port_mut(node, side, port_id) {
            if res >= 0 {
                port.update_state(PortState::Paused);
            } else {
                warn!("port {}:{} failed to go to paused", node, port_id);
                port.update_state(PortState::Error);
            }
        }
        {
            let link = match self.links.get_mut(&id) {
                Some(link) => link,
                None => return,
            };
            match side {
                Direction::Output => link.out_have_buffers = res >= 0,
                Direction::Input => link.in_have_buffers = res >= 0,
            }
        }
        if res < 0 {
            self.link_update_state(
                id,
                LinkState::Error,
                Some(format!("buffer bind failed: {res}")),
            );
            return;
        }
        let both = {
            let link = &self.links[&id];
            link.out_have_buffers && link.in_have_buffers
        };
        if both {
            self.link_update_state(id, LinkState::Paused, None);
        }
    }

    /// Install the realtime wiring and count the link as ready on both
    /// nodes, starting them when every used link is ready.
    fn link_activate_rt(&mut self, id: LinkId) {
        let (activated, output_node, output_port, input_node, input_port, io) =
            match self.links.get(&id) {
                Some(link) => (
                    link.activated,
                    link.output_node,
                    link.output_port,
                    link.input_node,
                    link.input_port,
                    link.io.clone(),
                ),
                None => return,
            };
        if activated {
            return;
        }
        trace!("link {}: rt activate", id);

        self.data_loop.invoke(InvokeOp::ActivateLink {
            link: id,
            output_node,
            output_port,
            input_node,
            input_port,
            io,
        });
        if let Some(link) = self.links.get_mut(&id) {
            link.activated = true;
        }
        if let Some(node) = self.nodes.get_mut(&output_node) {
            node.n_ready_output_links += 1;
        }
        if let Some(node) = self.nodes.get_mut(&input_node) {
            node.n_ready_input_links += 1;
        }
        self.link_update_state(id, LinkState::Active, None);

        for endpoint in [output_node, input_node] {
            let start = self
                .nodes
                .get(&endpoint)
                .map(|n| n.links_ready() && n.active)
                .unwrap_or(false);
            if start {
                let _ = self.node_set_state(endpoint, NodeState::Running);
            }
        }
    }

    fn link_update_state(&mut self, id: LinkId, state: LinkState, error: Option<String>) {
        let transition = match self.links.get_mut(&id) {
            Some(link) => link.update_state(state, error),
            None => return,
        };
        if let Some((_, new)) = transition {
            if new == LinkState::Paused {
                self.link_activate_rt(id);
            }
        }
    }

    /// Whether `to` is reachable downstream of `from`.
    fn can_reach(&self, from: NodeId, to: NodeId) -> bool {
        if from == to {
            return true;
        }
        let node = match self.nodes.get(&from) {
            Some(node) => node,
            None => return false,
        };
        for port in node.output_ports.values() {
            for link_id in &port.links {
                if let Some(link) = self.links.get(link_id) {
                    if self.can_reach(link.input_node, to) {
                        return true;
                    }
                }
            }
        }
        false
    }

    // --- Format negotiation --------------------------------------------

    /// Find a common format between two ports, honoring idle
    /// reconfiguration: a configured port on an idle node counts as
    /// configure and may change formats.
    pub fn find_format(
        &mut self,
        output: (NodeId, PortId),
        input: (NodeId, PortId),
    ) -> Result<MediaFormat> {
        let mut out_state = self.port(output.0, Direction::Output, output.1)?.state;
        let mut in_state = self.port(input.0, Direction::Input, input.1)?.state;

        if out_state > PortState::Configure
            && self.nodes[&output.0].info.state == NodeState::Idle
        {
            out_state = PortState::Configure;
        }
        if in_state > PortState::Configure && self.nodes[&input.0].info.state == NodeState::Idle {
            in_state = PortState::Configure;
        }
        debug!(
            "core: finding best format {} {}",
            out_state.as_str(),
            in_state.as_str()
        );

        let current_out = self
            .port(output.0, Direction::Output, output.1)?
            .current_format;
        let current_in = self.port(input.0, Direction::Input, input.1)?.current_format;

        if in_state == PortState::Configure && out_state > PortState::Configure {
            // Only the input needs a format; filter against the output's.
            let fixed = current_out
                .ok_or_else(|| GraphError::bad_state("output has no configured format"))?;
            let candidates = self.enum_port_formats(input.0, Direction::Input, input.1)?;
            params::filter_formats(&[fixed], &candidates)
                .ok_or_else(|| GraphError::invalid("no common format"))
        } else if out_state == PortState::Configure && in_state > PortState::Configure {
            let fixed = current_in
                .ok_or_else(|| GraphError::bad_state("input has no configured format"))?;
            let candidates = self.enum_port_formats(output.0, Direction::Output, output.1)?;
            params::filter_formats(&candidates, &[fixed])
                .ok_or_else(|| GraphError::invalid("no common format"))
        } else if out_state == PortState::Configure && in_state == PortState::Configure {
            let outs = self.enum_port_formats(output.0, Direction::Output, output.1)?;
            let ins = self.enum_port_formats(input.0, Direction::Input, input.1)?;
            params::filter_formats(&outs, &ins)
                .ok_or_else(|| GraphError::invalid("no common format"))
        } else {
            Err(GraphError::bad_state("wrong port states for negotiation"))
        }
    }

    /// Enumerate the formats a port can take.
    fn enum_port_formats(
        &mut self,
        node: NodeId,
        direction: Direction,
        port_id: PortId,
    ) -> Result<Vec<MediaFormat>> {
        let backend = self
            .node(node)?
            .backend
            .clone()
            .ok_or_else(|| GraphError::bad_state("node has no implementation"))?;
        let seq = self.alloc_seq();
        backend.port_enum_params(seq, direction, port_id, ParamId::EnumFormat, 0, u32::MAX, None)?;
        let formats = self
            .collect_param_results(node, seq)
            .into_iter()
            .filter_map(|(_, _, _, _, value)| value.as_format().copied())
            .collect();
        Ok(formats)
    }

    /// Buffer requirements of a port, if the backend announces any.
    fn enum_port_buffers(
        &mut self,
        node: NodeId,
        direction: Direction,
        port_id: PortId,
    ) -> Option<crate::graph::params::BufferRequirements> {
        let backend = self.nodes.get(&node)?.backend.clone()?;
        let seq = self.alloc_seq();
        backend
            .port_enum_params(seq, direction, port_id, ParamId::Buffers, 0, u32::MAX, None)
            .ok()?;
        self.collect_param_results(node, seq)
            .into_iter()
            .find_map(|(_, _, _, _, value)| value.as_buffers().copied())
    }

    /// Drain the backend event channel, keeping the results of `seq` for
    /// `node` and deferring everything else for `dispatch`.
    fn collect_param_results(
        &mut self,
        node: NodeId,
        seq: u32,
    ) -> Vec<(u32, ParamId, u32, u32, ParamValue)> {
        let mut out = Vec::new();
        while let Ok((from, event)) = self.backend_events_rx.try_recv() {
            match event {
                BackendEvent::Result {
                    seq: s,
                    res: _,
                    param: Some((id, index, next, value)),
                } if from == node && s == seq => {
                    out.push((s, id, index, next, value));
                }
                other => self.deferred_events.push_back((from, other)),
            }
        }
        out
    }

    // --- Graph recalculation -------------------------------------------

    /// Recompute driver assignment for the whole graph: walk the node list,
    /// group nodes by connected component, elect one driver per component
    /// and migrate target entries through the invoke queue.
    pub fn recalc_graph(&mut self) {
        trace!("core: recalc graph");
        let driver_ids = self.driver_list.clone();
        for driver in driver_ids {
            let visited = self.nodes.get(&driver).map(|n| n.visited).unwrap_or(true);
            if !visited {
                self.collect_component(driver);
            }
        }

        let all: Vec<NodeId> = self.nodes.keys().copied().collect();
        for id in all {
            let assigned = self.nodes.get(&id).map(|n| n.visited).unwrap_or(true);
            if !assigned {
                let active = self.nodes[&id].active;
                debug!("unassigned node {}: active {}", id, active);
                let _ = self.node_set_driver(id, id);
            }
        }
        for node in self.nodes.values_mut() {
            node.visited = false;
        }

        for id in self.driver_list.clone() {
            if let Some(node) = self.nodes.get(&id) {
                if node.master {
                    debug!(
                        "master {}: quantum:{} '{}'",
                        id,
                        node.activation.record().position.size(),
                        node.info.name
                    );
                }
            }
        }
        self.listeners.emit(&CoreEvent::GraphRecalculated);
    }

    /// Breadth-first walk of one connected component rooted at `driver`,
    /// assigning every active member to it and folding the quantum.
    fn collect_component(&mut self, driver: NodeId) {
        let driver_name = self.nodes[&driver].info.name.clone();
        debug!("driver {}: '{}'", driver, driver_name);

        let mut queue = VecDeque::new();
        let mut members = Vec::new();
        let mut quantum = self.config.default_quantum;

        queue.push_back(driver);
        self.nodes.get_mut(&driver).unwrap().visited = true;

        while let Some(id) = queue.pop_front() {
            members.push(id);
            let node = &self.nodes[&id];
            if node.quantum_size > 0 && node.quantum_size < quantum {
                quantum = node.quantum_size;
            }

            let mut neighbors = Vec::new();
            for port in node.input_ports.values() {
                for link_id in &port.links {
                    if let Some(link) = self.links.get(link_id) {
                        neighbors.push(link.output_node);
                    }
                }
            }
            for port in node.output_ports.values() {
                for link_id in &port.links {
                    if let Some(link) = self.links.get(link_id) {
                        neighbors.push(link.input_node);
                    }
                }
            }
            for neighbor in neighbors {
                if let Some(node) = self.nodes.get_mut(&neighbor) {
                    if !node.visited && node.active {
                        node.visited = true;
                        queue.push_back(neighbor);
                    }
                }
            }
        }

        for member in &members {
            let _ = self.node_set_driver(*member, driver);
        }
        if let Some(node) = self.nodes.get_mut(&driver) {
            node.slaves = members;
        }

        let quantum = quantum.max(self.config.min_quantum);
        self.nodes[&driver]
            .activation
            .record()
            .position
            .set_size(quantum);
    }

    // --- Peers ---------------------------------------------------------

    /// Map a peer's activation record (received as an fd out-of-band) into
    /// `from`'s target list; `signal` is raised on the zero transition.
    pub fn add_peer_target(
        &mut self,
        from: NodeId,
        peer: NodeId,
        activation: Activation,
        signal: Arc<dyn Fn() + Send + Sync>,
    ) -> Result<()> {
        self.node(from)?;
        self.data_loop.invoke(InvokeOp::AddCustomTarget {
            from,
            target: Target {
                node: peer,
                kind: TargetKind::Node,
                activation,
                signal: TargetSignal::Custom(signal),
            },
        });
        Ok(())
    }

    pub fn remove_peer_target(&mut self, from: NodeId, peer: NodeId) -> Result<()> {
        self.node(from)?;
        self.data_loop
            .invoke(InvokeOp::RemoveCustomTarget {
                from,
                target_node: peer,
            });
        Ok(())
    }

    // --- Dispatch ------------------------------------------------------

    /// Drain pending backend events and work-queue completions. The main
    /// loop calls this from its poll; tests call it directly.
    pub fn dispatch(&mut self) -> usize {
        let mut handled = 0;
        loop {
            let next = self
                .deferred_events
                .pop_front()
                .or_else(|| self.backend_events_rx.try_recv().ok());
            let (node, event) = match next {
                Some(pair) => pair,
                None => break,
            };
            self.handle_backend_event(node, event);
            handled += 1;
        }
        handled
    }

    fn handle_backend_event(&mut self, id: NodeId, event: BackendEvent) {
        if !self.nodes.contains_key(&id) {
            trace!("core: dropping event for vanished node {}", id);
            return;
        }
        match event {
            BackendEvent::Info(info) => {
                let driver_changed = {
                    let node = self.nodes.get_mut(&id).unwrap();
                    node.info.max_input_ports = info.max_input_ports;
                    node.info.max_output_ports = info.max_output_ports;
                    let mut driver_changed = false;
                    if let Some(props) = &info.properties {
                        driver_changed = node.update_properties(props).1;
                    }
                    if !info.changed_params.is_empty() {
                        node.info.change_mask |= NodeChangeMask::PARAMS;
                    }
                    node.emit_info_changed();
                    for param in &info.changed_params {
                        node.listeners.emit(&NodeEvent::ParamChanged { id: *param });
                    }
                    driver_changed
                };
                if driver_changed {
                    self.sync_driver_flag(id);
                    self.recalc_graph();
                }
            }
            BackendEvent::PortInfo {
                direction,
                port_id,
                info,
            } => {
                let exists = self.nodes[&id].ports(direction).contains_key(&port_id);
                match (exists, info) {
                    (true, None) => {
                        debug!("node {}: {} port {} removed", id, direction.as_str(), port_id);
                        let _ = self.port_destroy(id, direction, port_id);
                    }
                    (true, Some(info)) => {
                        let port = self
                            .nodes
                            .get_mut(&id)
                            .unwrap()
                            .ports_mut(direction)
                            .get_mut(&port_id)
                            .unwrap();
                        port.update_info(Some(info.flags), Some(&info.properties));
                        port.emit_info_changed();
                    }
                    (false, Some(info)) => {
                        debug!("node {}: {} port {} added", id, direction.as_str(), port_id);
                        let port = Port::new(direction, port_id, info.flags, info.properties);
                        if let Err(e) = self.add_port(id, port) {
                            warn!("node {}: can't add port {}: {}", id, port_id, e);
                        }
                    }
                    (false, None) => {
                        warn!("node {}: {} port {} unknown", id, direction.as_str(), port_id);
                    }
                }
            }
            BackendEvent::Result { seq, res, param } => {
                trace!("node {}: result seq:{} res:{}", id, seq, res);
                if let Some(node) = self.nodes.get_mut(&id) {
                    node.last_error = res;
                    node.listeners.emit(&NodeEvent::Result {
                        seq,
                        res,
                        param: param.map(|(_, _, _, value)| value),
                    });
                }
                if seq_is_async(seq) {
                    self.complete_work(id, seq_number(seq), res);
                }
            }
            BackendEvent::Event(notify) => match notify {
                crate::graph::backend::BackendNotify::Error { message } => {
                    self.handle_node_error(id, message);
                }
                crate::graph::backend::BackendNotify::RequestProcess => {
                    trace!("node {}: requests a process cycle", id);
                    if let Some(node) = self.nodes.get(&id) {
                        if node.master && node.info.state == NodeState::Running {
                            node.signal
                                .ready(crate::graph::backend::ProcessStatus::Ok);
                        }
                    }
                }
            },
        }
    }

    /// A backend raised an unrecoverable error: the node goes to error and
    /// emits info-changed, its links error out and both endpoints settle
    /// back to idle once deactivated.
    fn handle_node_error(&mut self, id: NodeId, message: String) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.last_error = -1;
        }
        self.node_update_state(id, NodeState::Error, Some(message));

        let links = self.collect_node_links(id);
        for link in links {
            self.link_update_state(link, LinkState::Error, Some("node in error".into()));
            let _ = self.link_deactivate(link);
        }
        // The failure has been surfaced; the node settles at idle.
        self.data_loop.invoke(InvokeOp::RemoveNode { node: id });
        self.node_update_state(id, NodeState::Idle, None);
    }

    fn complete_work(&mut self, owner: NodeId, seq: u32, res: i32) {
        if let Some(callback) = self.work.complete(owner, seq) {
            callback(self, res);
        }
    }
}

impl std::fmt::Debug for GraphCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphCore")
            .field("nodes", &self.nodes.len())
            .field("links", &self.links.len())
            .field("drivers", &self.driver_list)
            .finish_non_exhaustive()
    }
}
