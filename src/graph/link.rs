//! Links: one output port bound to one input port.
//!
//! A link is owned by the core registry keyed on its port pair and only
//! referenced from the endpoints' link lists. Destroying either endpoint
//! destroys the link first. The negotiation state machine lives in
//! `graph::core`; this module holds the entity and its bookkeeping.

use std::sync::Arc;

use tracing::{debug, error};

use crate::graph::backend::{BufferPool, IoBuffers};
use crate::graph::events::{LinkEvent, ListenerList};
use crate::graph::types::{
    LinkChangeMask, LinkId, LinkInfo, LinkState, NodeId, PortId, Properties,
};

/// Key of the global link registry: (output node, output port, input node,
/// input port).
pub type LinkKey = (NodeId, PortId, NodeId, PortId);

/// One link between an output port and an input port of different nodes.
pub struct Link {
    pub id: LinkId,
    pub output_node: NodeId,
    pub output_port: PortId,
    pub input_node: NodeId,
    pub input_port: PortId,
    pub info: LinkInfo,
    pub properties: Properties,
    /// A passive link does not keep its nodes running on its own.
    pub passive: bool,
    /// Counters on both nodes were incremented, negotiation is under way.
    pub prepared: bool,
    /// Realtime wiring is installed.
    pub activated: bool,
    /// Shared buffer io area between the two realtime mix slots.
    pub io: Arc<IoBuffers>,
    /// Negotiated buffer pool, bound to both ports.
    pub pool: Option<Arc<BufferPool>>,
    pub out_have_buffers: bool,
    pub in_have_buffers: bool,
    pub listeners: ListenerList<LinkEvent>,
}

impl Link {
    pub fn new(
        id: LinkId,
        output_node: NodeId,
        output_port: PortId,
        input_node: NodeId,
        input_port: PortId,
        properties: Properties,
    ) -> Link {
        debug!(
            "link {}: new {}:{} -> {}:{}",
            id, output_node, output_port, input_node, input_port
        );
        let passive = properties
            .parse_bool(crate::graph::types::keys::LINK_PASSIVE)
            .unwrap_or(false);
        Link {
            id,
            output_node,
            output_port,
            input_node,
            input_port,
            info: LinkInfo {
                id,
                output_node,
                output_port,
                input_node,
                input_port,
                state: LinkState::Init,
                error: None,
                format: None,
                change_mask: 0,
            },
            properties,
            passive,
            prepared: false,
            activated: false,
            io: Arc::new(IoBuffers::new()),
            pool: None,
            out_have_buffers: false,
            in_have_buffers: false,
            listeners: ListenerList::new(),
        }
    }

    pub fn key(&self) -> LinkKey {
        (
            self.output_node,
            self.output_port,
            self.input_node,
            self.input_port,
        )
    }

    pub fn state(&self) -> LinkState {
        self.info.state
    }

    /// Move the link state machine; emits state-changed and info-changed.
    /// Returns (old, new) when the state actually moved.
    pub fn update_state(
        &mut self,
        state: LinkState,
        error: Option<String>,
    ) -> Option<(LinkState, LinkState)> {
        let old = self.info.state;
        if old == state {
            return None;
        }
        if state == LinkState::Error {
            error!(
                "link {}: state {} -> error ({})",
                self.id,
                old.as_str(),
                error.as_deref().unwrap_or("unknown")
            );
        } else {
            debug!(
                "link {}: state {} -> {}",
                self.id,
                old.as_str(),
                state.as_str()
            );
        }
        self.info.state = state;
        self.info.error = error.clone();
        self.info.change_mask |= LinkChangeMask::STATE;
        self.listeners.emit(&LinkEvent::StateChanged {
            old,
            new: state,
            error,
        });
        self.emit_info_changed();
        Some((old, state))
    }

    pub fn set_format(&mut self, format: crate::graph::params::MediaFormat) {
        self.info.format = Some(format);
        self.info.change_mask |= LinkChangeMask::FORMAT;
        self.listeners.emit(&LinkEvent::FormatChanged {
            format: Some(format),
        });
        self.emit_info_changed();
    }

    fn emit_info_changed(&mut self) {
        if self.info.change_mask == 0 {
            return;
        }
        let mask = self.info.change_mask;
        self.info.change_mask = 0;
        self.listeners
            .emit(&LinkEvent::InfoChanged { change_mask: mask });
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("id", &self.id)
            .field("output", &(self.output_node, self.output_port))
            .field("input", &(self.input_node, self.input_port))
            .field("state", &self.info.state)
            .field("prepared", &self.prepared)
            .field("activated", &self.activated)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passive_flag_comes_from_properties() {
        let props = Properties::new().with("link.passive", "true");
        let link = Link::new(1, 1, 0, 2, 0, props);
        assert!(link.passive);

        let link = Link::new(2, 1, 0, 2, 0, Properties::new());
        assert!(!link.passive);
    }

    #[test]
    fn update_state_reports_transition() {
        let mut link = Link::new(1, 1, 0, 2, 0, Properties::new());
        assert_eq!(
            link.update_state(LinkState::Negotiating, None),
            Some((LinkState::Init, LinkState::Negotiating))
        );
        assert_eq!(link.update_state(LinkState::Negotiating, None), None);
    }

    #[test]
    fn error_state_records_reason() {
        let mut link = Link::new(1, 1, 0, 2, 0, Properties::new());
        link.update_state(LinkState::Error, Some("no common format".into()));
        assert_eq!(link.info.error.as_deref(), Some("no common format"));
    }

    #[test]
    fn state_and_format_changes_emit_info_updates() {
        use std::sync::{Arc, Mutex};

        let mut link = Link::new(1, 1, 0, 2, 0, Properties::new());
        let masks = Arc::new(Mutex::new(Vec::new()));
        let masks2 = masks.clone();
        link.listeners.add(move |event| {
            if let crate::graph::events::LinkEvent::InfoChanged { change_mask } = event {
                masks2.lock().unwrap().push(*change_mask);
            }
        });

        link.update_state(LinkState::Negotiating, None);
        link.set_format(crate::graph::params::MediaFormat::audio(48000, 2));
        // Re-stating the same state accumulates no mask and emits nothing.
        link.update_state(LinkState::Negotiating, None);

        let masks = masks.lock().unwrap();
        assert_eq!(masks.len(), 2);
        assert_ne!(masks[0] & LinkChangeMask::STATE, 0);
        assert_ne!(masks[1] & LinkChangeMask::FORMAT, 0);
    }
}
