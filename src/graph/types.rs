use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Stable arena id of a node. Assigned when the node is registered with the
/// core and never reused for the lifetime of the core.
pub type NodeId = u32;

/// Stable arena id of a link.
pub type LinkId = u32;

/// Port id, unique within one node and direction.
pub type PortId = u32;

/// Id value meaning "not assigned yet" / "pick any".
pub const ID_INVALID: u32 = u32::MAX;

/// Default cycle quantum in frames.
pub const DEFAULT_QUANTUM: u32 = 1024;

/// Lower bound for the cycle quantum in frames.
pub const MIN_QUANTUM: u32 = 64;

/// Well-known property keys.
pub mod keys {
    /// "true" marks a node as eligible for driver election.
    pub const NODE_DRIVER: &str = "node.driver";
    /// Whether idle translates to a backend Pause command.
    pub const NODE_PAUSE_ON_IDLE: &str = "node.pause-on-idle";
    /// Requested latency as "num/denom", drives the quantum.
    pub const NODE_LATENCY: &str = "node.latency";
    /// Human-readable node name.
    pub const NODE_NAME: &str = "node.name";
    /// Registered node id, mirrored into the property bag.
    pub const NODE_ID: &str = "node.id";
    /// Media class of the node ("Audio/Source", ...).
    pub const MEDIA_CLASS: &str = "media.class";
    /// Port direction, "in" or "out".
    pub const PORT_DIRECTION: &str = "port.direction";
    /// Human-readable port name.
    pub const PORT_NAME: &str = "port.name";
    /// Channel name of the port ("FL", "FR", ...).
    pub const PORT_CHANNEL: &str = "port.channel";
    /// "true" marks a link that should not keep nodes running on its own.
    pub const LINK_PASSIVE: &str = "link.passive";
}

/// Ordered string property bag attached to nodes, ports and links.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Properties {
    map: BTreeMap<String, String>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.map.insert(key.to_string(), value.to_string());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: &str, value: &str) -> bool {
        self.map.insert(key.to_string(), value.to_string()).as_deref() != Some(value)
    }

    pub fn remove(&mut self, key: &str) -> bool {
        self.map.remove(key).is_some()
    }

    /// Merge `other` into self, returning the number of changed entries.
    pub fn update(&mut self, other: &Properties) -> usize {
        let mut changed = 0;
        for (k, v) in &other.map {
            if self.map.get(k) != Some(v) {
                self.map.insert(k.clone(), v.clone());
                changed += 1;
            }
        }
        changed
    }

    pub fn parse_bool(&self, key: &str) -> Option<bool> {
        self.get(key)
            .map(|v| matches!(v, "true" | "1" | "yes" | "on"))
    }

    /// Parse a "num/denom" fraction property.
    pub fn parse_fraction(&self, key: &str) -> Option<(u32, u32)> {
        let value = self.get(key)?;
        let (num, denom) = value.split_once('/')?;
        let num = num.trim().parse().ok()?;
        let denom: u32 = denom.trim().parse().ok()?;
        if denom == 0 {
            return None;
        }
        Some((num, denom))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.map.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Direction of a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Input,
    Output,
}

impl Direction {
    pub fn reverse(self) -> Self {
        match self {
            Direction::Input => Direction::Output,
            Direction::Output => Direction::Input,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Input => "in",
            Direction::Output => "out",
        }
    }
}

/// Node lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NodeState {
    /// Error state with a recorded reason in `NodeInfo::error`.
    Error,
    /// The node is being created and has no backend yet.
    Creating,
    /// Backend released all buffers, ports are back in configure.
    Suspended,
    /// Ready to process but not scheduled.
    Idle,
    /// Scheduled in a driver's target list.
    Running,
}

impl NodeState {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeState::Error => "error",
            NodeState::Creating => "creating",
            NodeState::Suspended => "suspended",
            NodeState::Idle => "idle",
            NodeState::Running => "running",
        }
    }
}

/// Port states, ordered by configuration progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PortState {
    Error,
    Init,
    Configure,
    Ready,
    Paused,
}

impl PortState {
    pub fn as_str(self) -> &'static str {
        match self {
            PortState::Error => "error",
            PortState::Init => "init",
            PortState::Configure => "configure",
            PortState::Ready => "ready",
            PortState::Paused => "paused",
        }
    }
}

/// Link states, ordered by negotiation progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LinkState {
    Error,
    Init,
    Negotiating,
    Allocating,
    Paused,
    Active,
}

impl LinkState {
    pub fn as_str(self) -> &'static str {
        match self {
            LinkState::Error => "error",
            LinkState::Init => "init",
            LinkState::Negotiating => "negotiating",
            LinkState::Allocating => "allocating",
            LinkState::Paused => "paused",
            LinkState::Active => "active",
        }
    }
}

/// Change mask bits for [`NodeInfo`].
pub struct NodeChangeMask;

impl NodeChangeMask {
    pub const STATE: u32 = 1 << 0;
    pub const PROPS: u32 = 1 << 1;
    pub const INPUT_PORTS: u32 = 1 << 2;
    pub const OUTPUT_PORTS: u32 = 1 << 3;
    pub const PARAMS: u32 = 1 << 4;
}

/// Change mask bits for [`PortInfo`].
pub struct PortChangeMask;

impl PortChangeMask {
    pub const FLAGS: u32 = 1 << 0;
    pub const PROPS: u32 = 1 << 1;
    pub const PARAMS: u32 = 1 << 2;
}

/// Change mask bits for [`LinkInfo`].
pub struct LinkChangeMask;

impl LinkChangeMask {
    pub const STATE: u32 = 1 << 0;
    pub const FORMAT: u32 = 1 << 1;
    pub const PROPS: u32 = 1 << 2;
}

/// Externally observable node information.
#[derive(Debug, Clone, Serialize)]
pub struct NodeInfo {
    pub id: u32,
    pub name: String,
    pub state: NodeState,
    pub error: Option<String>,
    pub max_input_ports: u32,
    pub max_output_ports: u32,
    pub n_input_ports: u32,
    pub n_output_ports: u32,
    #[serde(skip)]
    pub change_mask: u32,
}

impl NodeInfo {
    pub fn new(name: &str) -> Self {
        Self {
            id: ID_INVALID,
            name: name.to_string(),
            state: NodeState::Creating,
            error: None,
            max_input_ports: 0,
            max_output_ports: 0,
            n_input_ports: 0,
            n_output_ports: 0,
            change_mask: 0,
        }
    }
}

/// Externally observable port information.
#[derive(Debug, Clone, Serialize)]
pub struct PortInfo {
    pub direction: Direction,
    pub port_id: PortId,
    pub name: String,
    pub flags: u32,
    #[serde(skip)]
    pub change_mask: u32,
}

/// Externally observable link information.
#[derive(Debug, Clone, Serialize)]
pub struct LinkInfo {
    pub id: u32,
    pub output_node: NodeId,
    pub output_port: PortId,
    pub input_node: NodeId,
    pub input_port: PortId,
    pub state: LinkState,
    pub error: Option<String>,
    pub format: Option<crate::graph::params::MediaFormat>,
    #[serde(skip)]
    pub change_mask: u32,
}

/// Core-wide configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    /// Name of the core, mirrored into logs and the data-loop thread name.
    pub name: String,
    /// Quantum used when no node requests a latency.
    pub default_quantum: u32,
    /// Lower bound applied to any requested quantum.
    pub min_quantum: u32,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            name: format!("mediaflow-{}", std::process::id()),
            default_quantum: DEFAULT_QUANTUM,
            min_quantum: MIN_QUANTUM,
        }
    }
}

/// Largest power of two not greater than `x`. Used to round the quantum
/// derived from a latency request.
pub fn flp2(x: u32) -> u32 {
    let mut x = x;
    x |= x >> 1;
    x |= x >> 2;
    x |= x >> 4;
    x |= x >> 8;
    x |= x >> 16;
    x - (x >> 1)
}
