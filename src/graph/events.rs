//! Typed listener lists for external observers.
//!
//! Every entity (node, port, link, core) carries a [`ListenerList`] of
//! callback bundles. Emission runs in registration order; listeners removed
//! while an emission is in flight are only marked dead and reaped after the
//! iteration finishes, so removal is always safe.

use crate::graph::params::{MediaFormat, ParamId};
use crate::graph::types::{
    Direction, LinkId, LinkState, NodeId, NodeState, PortId, PortState,
};

/// Listener interface version understood by current emitters.
pub const EVENTS_VERSION: u32 = 1;

/// Token returned by [`ListenerList::add`]; identifies one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerToken(u64);

struct ListenerEntry<E> {
    token: ListenerToken,
    version: u32,
    dead: bool,
    callback: Box<dyn FnMut(&E) + Send>,
}

/// Ordered list of typed listeners with safe removal during emission.
pub struct ListenerList<E> {
    entries: Vec<ListenerEntry<E>>,
    next_token: u64,
    emitting: bool,
}

impl<E> Default for ListenerList<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> ListenerList<E> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_token: 1,
            emitting: false,
        }
    }

    /// Subscribe with the current interface version.
    pub fn add(&mut self, callback: impl FnMut(&E) + Send + 'static) -> ListenerToken {
        self.add_with_version(EVENTS_VERSION, callback)
    }

    /// Subscribe declaring the interface version the listener understands.
    /// Events introduced after that version are not delivered to it.
    pub fn add_with_version(
        &mut self,
        version: u32,
        callback: impl FnMut(&E) + Send + 'static,
    ) -> ListenerToken {
        let token = ListenerToken(self.next_token);
        self.next_token += 1;
        self.entries.push(ListenerEntry {
            token,
            version,
            dead: false,
            callback: Box::new(callback),
        });
        token
    }

    /// Unsubscribe. Returns false if the token is unknown.
    pub fn remove(&mut self, token: ListenerToken) -> bool {
        if self.emitting {
            for entry in &mut self.entries {
                if entry.token == token && !entry.dead {
                    entry.dead = true;
                    return true;
                }
            }
            false
        } else {
            let before = self.entries.len();
            self.entries.retain(|e| e.token != token);
            self.entries.len() != before
        }
    }

    /// Emit an event to every live listener, in registration order.
    pub fn emit(&mut self, event: &E) {
        self.emit_versioned(0, event);
    }

    /// Emit an event that only listeners with `version >= since` understand.
    pub fn emit_versioned(&mut self, since: u32, event: &E) {
        self.emitting = true;
        let mut index = 0;
        while index < self.entries.len() {
            let entry = &mut self.entries[index];
            if !entry.dead && entry.version >= since {
                (entry.callback)(event);
            }
            index += 1;
        }
        self.emitting = false;
        self.entries.retain(|e| !e.dead);
    }

    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| !e.dead).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<E> std::fmt::Debug for ListenerList<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerList")
            .field("listeners", &self.len())
            .finish()
    }
}

/// Events emitted by a node for external observers.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// Registration completed, the node is about to go suspended.
    Initialized,
    StateChanged {
        old: NodeState,
        new: NodeState,
        error: Option<String>,
    },
    InfoChanged {
        change_mask: u32,
    },
    DriverChanged {
        old: NodeId,
        new: NodeId,
    },
    ActiveChanged {
        active: bool,
    },
    PortAdded {
        direction: Direction,
        port_id: PortId,
    },
    PortRemoved {
        direction: Direction,
        port_id: PortId,
    },
    ParamChanged {
        id: ParamId,
    },
    Result {
        seq: u32,
        res: i32,
        param: Option<crate::graph::params::ParamValue>,
    },
    Destroy,
}

/// Events emitted by a port.
#[derive(Debug, Clone)]
pub enum PortEvent {
    StateChanged { old: PortState, new: PortState },
    InfoChanged { change_mask: u32 },
    LinkAdded { link: LinkId },
    LinkRemoved { link: LinkId },
    Destroy,
}

/// Events emitted by a link.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    StateChanged {
        old: LinkState,
        new: LinkState,
        error: Option<String>,
    },
    InfoChanged {
        change_mask: u32,
    },
    FormatChanged {
        format: Option<MediaFormat>,
    },
    Destroy,
}

/// Events emitted by the core itself.
#[derive(Debug, Clone)]
pub enum CoreEvent {
    NodeAdded { node: NodeId },
    NodeRemoved { node: NodeId },
    LinkAdded { link: LinkId },
    LinkRemoved { link: LinkId },
    GraphRecalculated,
}
