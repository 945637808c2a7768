//! External events a [`Context`](crate::context::Context) surfaces to the embedder when event
//! emission is enabled. Drained with `get_event`, independent of the received-payload queue.

use crossbeam_queue::SegQueue;

use crate::identity::ConnectionId;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Event {
    /// A handshake completed, from either side's perspective.
    Connected(ConnectionId),
    /// The connection was removed, whether by explicit drop, timeout, or peer-initiated
    /// disconnect.
    Disconnected(ConnectionId),
    /// RTT recovered enough to move back to the 30 Hz send rate.
    GoodMode(ConnectionId),
    /// RTT degraded enough to drop to the 10 Hz send rate.
    BadMode(ConnectionId),
}

impl Event {
    #[inline]
    pub fn connection_id(&self) -> ConnectionId {
        match self {
            Event::Connected(id)
            | Event::Disconnected(id)
            | Event::GoodMode(id)
            | Event::BadMode(id) => *id,
        }
    }
}

/// Unbounded, populated only while emit-events is on; drained by the embedder via `get_event`.
pub struct EventQueue {
    inner: SegQueue<Event>,
}

impl EventQueue {
    pub fn new() -> EventQueue {
        EventQueue { inner: SegQueue::new() }
    }

    #[inline]
    pub fn push(&self, event: Event) {
        self.inner.push(event);
    }

    #[inline]
    pub fn pop(&self) -> Option<Event> {
        self.inner.pop()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl Default for EventQueue {
    fn default() -> EventQueue {
        EventQueue::new()
    }
}
