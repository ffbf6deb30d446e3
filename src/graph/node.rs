//! Nodes: the processing entities of the graph.
//!
//! A node owns its ports, wraps a backend and carries the activation record
//! that schedules it. The cross-entity state machine (suspend/pause/start,
//! link bookkeeping, driver election) is driven from `graph::core`; this
//! module holds the entity itself and the intra-node logic.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info};

use crate::graph::backend::NodeBackend;
use crate::graph::events::{ListenerList, NodeEvent};
use crate::graph::invoke::NodeSignal;
use crate::graph::memblock::Activation;
use crate::graph::port::Port;
use crate::graph::types::{
    flp2, keys, Direction, GraphConfig, NodeChangeMask, NodeId, NodeInfo, NodeState, PortId,
    Properties, ID_INVALID,
};
use crate::graph::error::{GraphError, Result};

/// One node of the graph. Main-thread owned; the realtime mirror lives in
/// the data loop and is reconciled through the invoke queue.
pub struct Node {
    /// Arena id, stable for the node's lifetime.
    pub id: NodeId,
    pub info: NodeInfo,
    pub properties: Properties,
    pub backend: Option<Arc<dyn NodeBackend>>,
    /// Shared-memory activation record of this node.
    pub activation: Activation,
    /// Wake handle towards the data loop.
    pub signal: NodeSignal,
    pub input_ports: BTreeMap<PortId, Port>,
    pub output_ports: BTreeMap<PortId, Port>,
    /// Nodes routed through this node when it is a driver.
    pub slaves: Vec<NodeId>,
    /// Driver this node is routed through; its own id when self-driven.
    pub driver_id: NodeId,
    /// The node declared the driver property and may be elected.
    pub is_driver: bool,
    /// This node is the elected driver of its component.
    pub master: bool,
    pub active: bool,
    /// The activation record is signalled from another process.
    pub exported: bool,
    pub registered: bool,
    /// Scratch flag used by graph recalculation.
    pub visited: bool,
    pub pause_on_idle: bool,
    /// Quantum derived from the latency property, 0 when unset.
    pub quantum_size: u32,
    pub n_used_input_links: i32,
    pub n_ready_input_links: i32,
    pub n_used_output_links: i32,
    pub n_ready_output_links: i32,
    pub idle_used_input_links: i32,
    pub idle_used_output_links: i32,
    pub last_error: i32,
    pub listeners: ListenerList<NodeEvent>,
}

impl Node {
    pub fn new(
        id: NodeId,
        name: &str,
        properties: Properties,
        signal: NodeSignal,
        config: &GraphConfig,
    ) -> Result<Node> {
        info!("🧩 node {}: new \"{}\"", id, name);

        let activation = Activation::alloc(config.default_quantum)?;

        let mut node = Node {
            id,
            info: NodeInfo::new(name),
            properties,
            backend: None,
            activation,
            signal,
            input_ports: BTreeMap::new(),
            output_ports: BTreeMap::new(),
            slaves: Vec::new(),
            driver_id: id,
            is_driver: false,
            master: true,
            active: false,
            exported: false,
            registered: false,
            visited: false,
            pause_on_idle: true,
            quantum_size: 0,
            n_used_input_links: 0,
            n_ready_input_links: 0,
            n_used_output_links: 0,
            n_ready_output_links: 0,
            idle_used_input_links: 0,
            idle_used_output_links: 0,
            last_error: 0,
            listeners: ListenerList::new(),
        };
        node.check_properties();
        Ok(node)
    }

    /// Re-read the behavior-bearing properties. Returns whether the driver
    /// eligibility flag changed, so the core can maintain its driver list.
    pub fn check_properties(&mut self) -> bool {
        self.pause_on_idle = self
            .properties
            .parse_bool(keys::NODE_PAUSE_ON_IDLE)
            .unwrap_or(true);

        let driver = self
            .properties
            .parse_bool(keys::NODE_DRIVER)
            .unwrap_or(false);
        let driver_changed = driver != self.is_driver;
        if driver_changed {
            info!(
                "node {}: driver {} -> {}",
                self.id, self.is_driver, driver
            );
            self.is_driver = driver;
        }

        if let Some((num, denom)) = self.properties.parse_fraction(keys::NODE_LATENCY) {
            self.quantum_size = flp2(num * 48000 / denom);
            info!("node {}: quantum {}", self.id, self.quantum_size);
        } else {
            self.quantum_size = 0;
        }

        debug!("node {}: driver:{}", self.id, self.is_driver);
        driver_changed
    }

    pub fn ports(&self, direction: Direction) -> &BTreeMap<PortId, Port> {
        match direction {
            Direction::Input => &self.input_ports,
            Direction::Output => &self.output_ports,
        }
    }

    pub fn ports_mut(&mut self, direction: Direction) -> &mut BTreeMap<PortId, Port> {
        match direction {
            Direction::Input => &mut self.input_ports,
            Direction::Output => &mut self.output_ports,
        }
    }

    /// Attach a port to this node. Fails with `exists` when the id collides.
    pub fn add_port(&mut self, mut port: Port) -> Result<()> {
        if port.node.is_some() {
            return Err(GraphError::exists("port already belongs to a node"));
        }
        let port_id = port.port_id;
        let direction = port.direction;
        if self.ports(direction).contains_key(&port_id) {
            return Err(GraphError::exists(format!(
                "{} port {} already registered",
                direction.as_str(),
                port_id
            )));
        }

        port.node = Some(self.id);
        self.ports_mut(direction).insert(port_id, port);

        match direction {
            Direction::Input => {
                self.info.n_input_ports += 1;
                self.info.change_mask |= NodeChangeMask::INPUT_PORTS;
            }
            Direction::Output => {
                self.info.n_output_ports += 1;
                self.info.change_mask |= NodeChangeMask::OUTPUT_PORTS;
            }
        }

        debug!("node {}: added {} port {}", self.id, direction.as_str(), port_id);
        self.listeners
            .emit(&NodeEvent::PortAdded { direction, port_id });
        Ok(())
    }

    /// Detach and return a port.
    pub fn take_port(&mut self, direction: Direction, port_id: PortId) -> Option<Port> {
        let port = self.ports_mut(direction).remove(&port_id)?;
        match direction {
            Direction::Input => {
                self.info.n_input_ports -= 1;
                self.info.change_mask |= NodeChangeMask::INPUT_PORTS;
            }
            Direction::Output => {
                self.info.n_output_ports -= 1;
                self.info.change_mask |= NodeChangeMask::OUTPUT_PORTS;
            }
        }
        self.listeners
            .emit(&NodeEvent::PortRemoved { direction, port_id });
        Some(port)
    }

    /// Find a port by id, or any linkable port when `port_id` is
    /// [`ID_INVALID`]: first an unlinked one, otherwise one that multiplexes.
    pub fn find_port(&self, direction: Direction, port_id: PortId) -> Option<&Port> {
        let ports = self.ports(direction);
        if port_id != ID_INVALID {
            return ports.get(&port_id);
        }
        let mut best = None;
        for port in ports.values() {
            if !port.is_linked() {
                return Some(port);
            }
            if port.is_multiplex() {
                best = Some(port);
            }
        }
        best
    }

    /// Allocate a free port id within the backend-announced limits.
    pub fn get_free_port_id(&self, direction: Direction) -> Result<PortId> {
        let (max_ports, n_ports) = match direction {
            Direction::Input => (self.info.max_input_ports, self.info.n_input_ports),
            Direction::Output => (self.info.max_output_ports, self.info.n_output_ports),
        };
        if max_ports > 0 && n_ports >= max_ports {
            return Err(GraphError::NoMemory("no more ports available".into()));
        }
        let ports = self.ports(direction);
        let mut candidate = 0;
        while ports.contains_key(&candidate) {
            candidate += 1;
        }
        Ok(candidate)
    }

    /// Whether every used link on both sides reached ready; gates the
    /// backend Start command.
    pub fn links_ready(&self) -> bool {
        self.n_ready_output_links == self.n_used_output_links
            && self.n_ready_input_links == self.n_used_input_links
    }

    /// Whether the node has no non-passive links left keeping it busy.
    pub fn links_idle(&self) -> bool {
        self.n_used_input_links <= self.idle_used_input_links
            && self.n_used_output_links <= self.idle_used_output_links
    }

    /// Record a state move and emit the events. The core wraps this to also
    /// marshal the scheduling consequences.
    pub fn update_state(&mut self, state: NodeState, error: Option<String>) -> Option<NodeState> {
        let old = self.info.state;
        if old == state {
            return None;
        }
        if state == NodeState::Error {
            tracing::error!(
                "node {}: update state from {} -> error ({})",
                self.id,
                old.as_str(),
                error.as_deref().unwrap_or("unknown")
            );
        } else {
            debug!(
                "node {}: update state from {} -> {}",
                self.id,
                old.as_str(),
                state.as_str()
            );
        }
        self.info.error = error.clone();
        self.info.state = state;
        self.info.change_mask |= NodeChangeMask::STATE;
        self.listeners.emit(&NodeEvent::StateChanged {
            old,
            new: state,
            error,
        });
        self.emit_info_changed();
        Some(old)
    }

    /// Merge a property update, re-checking behavior flags. Returns
    /// (changed count, driver flag changed).
    pub fn update_properties(&mut self, props: &Properties) -> (usize, bool) {
        let changed = self.properties.update(props);
        debug!("node {}: updated {} properties", self.id, changed);
        let mut driver_changed = false;
        if changed > 0 {
            driver_changed = self.check_properties();
            self.info.change_mask |= NodeChangeMask::PROPS;
            self.emit_info_changed();
        }
        (changed, driver_changed)
    }

    pub fn emit_info_changed(&mut self) {
        if self.info.change_mask == 0 {
            return;
        }
        let mask = self.info.change_mask;
        self.info.change_mask = 0;
        self.listeners.emit(&NodeEvent::InfoChanged { change_mask: mask });
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("name", &self.info.name)
            .field("state", &self.info.state)
            .field("driver", &self.driver_id)
            .field("master", &self.master)
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}
