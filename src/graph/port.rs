//! Ports: the endpoints nodes expose for linking.
//!
//! A port belongs to exactly one node for its lifetime. Its links list is
//! mutated only on the main thread; the mix/tee attached to it runs only on
//! the realtime thread (see `data_loop`).

use std::sync::Arc;

use tracing::{debug, error};

use crate::graph::backend::{BufferPool, IoBuffers};
use crate::graph::events::{ListenerList, PortEvent};
use crate::graph::params::{MediaFormat, ParamId};
use crate::graph::types::{
    Direction, LinkId, NodeId, PortChangeMask, PortId, PortInfo, PortState, Properties,
};

/// Port flags announced by backends.
pub struct PortFlags;

impl PortFlags {
    /// The port represents a physical device endpoint.
    pub const PHYSICAL: u32 = 1 << 0;
    /// The port terminates the media chain.
    pub const TERMINAL: u32 = 1 << 1;
    /// More than one link may share the port through its mixer.
    pub const MULTIPLEX: u32 = 1 << 2;
}

/// One port of a node.
pub struct Port {
    pub direction: Direction,
    pub port_id: PortId,
    /// Owning node; set once when the port is added.
    pub node: Option<NodeId>,
    pub state: PortState,
    pub info: PortInfo,
    pub properties: Properties,
    /// Links attached on the opposite side, main-thread owned.
    pub links: Vec<LinkId>,
    /// Parameter classes the backend announced for this port.
    pub cached_params: Vec<ParamId>,
    /// Format configured by the last successful `set_param(Format)`.
    pub current_format: Option<MediaFormat>,
    /// Buffer io area shared with the realtime mix/tee.
    pub io: Arc<IoBuffers>,
    /// Buffer pool bound to this port, if any.
    pub allocation: Option<Arc<BufferPool>>,
    pub listeners: ListenerList<PortEvent>,
}

impl Port {
    /// Create a detached port. Fails only through [`crate::graph::core`]
    /// when added to a node with a colliding id.
    pub fn new(direction: Direction, port_id: PortId, flags: u32, properties: Properties) -> Port {
        debug!("port: new {} {}", direction.as_str(), port_id);

        let mut properties = properties;
        properties.set(crate::graph::types::keys::PORT_DIRECTION, direction.as_str());

        let name = match properties.get(crate::graph::types::keys::PORT_NAME) {
            Some(name) => name.to_string(),
            None => match properties.get(crate::graph::types::keys::PORT_CHANNEL) {
                Some(channel) if channel != "UNK" => {
                    format!("{}_{}", direction.as_str(), channel)
                }
                _ => format!("{}_{}", direction.as_str(), port_id),
            },
        };
        properties.set(crate::graph::types::keys::PORT_NAME, &name);

        Port {
            direction,
            port_id,
            node: None,
            state: PortState::Init,
            info: PortInfo {
                direction,
                port_id,
                name,
                flags,
                change_mask: PortChangeMask::PROPS,
            },
            properties,
            links: Vec::new(),
            cached_params: Vec::new(),
            current_format: None,
            io: Arc::new(IoBuffers::new()),
            allocation: None,
            listeners: ListenerList::new(),
        }
    }

    pub fn is_multiplex(&self) -> bool {
        self.info.flags & PortFlags::MULTIPLEX != 0
    }

    pub fn is_linked(&self) -> bool {
        !self.links.is_empty()
    }

    /// Move the port state machine, emitting a state-changed event.
    pub fn update_state(&mut self, state: PortState) {
        if self.state == state {
            return;
        }
        if state == PortState::Error {
            error!(
                "port {}: state {} -> {}",
                self.port_id,
                self.state.as_str(),
                state.as_str()
            );
        } else {
            debug!(
                "port {}: state {} -> {}",
                self.port_id,
                self.state.as_str(),
                state.as_str()
            );
        }
        let old = self.state;
        self.state = state;
        self.listeners
            .emit(&PortEvent::StateChanged { old, new: state });
    }

    /// Merge backend-reported info; returns the accumulated change mask.
    pub fn update_info(&mut self, flags: Option<u32>, properties: Option<&Properties>) -> u32 {
        if let Some(flags) = flags {
            if flags != self.info.flags {
                self.info.flags = flags;
                self.info.change_mask |= PortChangeMask::FLAGS;
            }
        }
        if let Some(props) = properties {
            if self.properties.update(props) > 0 {
                self.info.change_mask |= PortChangeMask::PROPS;
            }
        }
        self.info.change_mask
    }

    /// Emit an info-changed event if any change bits accumulated.
    pub fn emit_info_changed(&mut self) {
        if self.info.change_mask == 0 {
            return;
        }
        let mask = self.info.change_mask;
        self.info.change_mask = 0;
        self.listeners.emit(&PortEvent::InfoChanged { change_mask: mask });
    }
}

impl std::fmt::Debug for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Port")
            .field("direction", &self.direction)
            .field("port_id", &self.port_id)
            .field("node", &self.node)
            .field("state", &self.state)
            .field("links", &self.links)
            .finish_non_exhaustive()
    }
}
