//! The ingress/egress queues a [`Context`](crate::context::Context) hands to callers.
//!
//! The user-facing send queue is the one place this lineage's "lock-free-ish" framing is taken
//! literally: `crossbeam_queue::SegQueue` lets a producer thread hand off outgoing payloads
//! without ever blocking on the Context mutex. Everything downstream of that handoff (per-peer
//! pending buffers, resend ordering, delivered payloads, events) is plain `VecDeque`/`Vec` guarded
//! by the same mutex as the rest of the connection state, since those structures are only ever
//! touched from inside a single `update` tick.

use std::collections::VecDeque;

use crossbeam_queue::SegQueue;

use crate::identity::ConnectionId;

/// Per-connection cap on queued-but-not-yet-sent payloads. A connection that can't keep up with
/// its own backlog starts dropping the oldest queued payload rather than growing without bound.
pub const MAX_PENDING_SEND: usize = 64;

/// A payload the caller wants delivered to a specific peer, still waiting for its turn to be
/// promoted into a connection's pending-send buffer.
#[derive(Clone, Debug)]
pub struct OutboundPayload {
    pub to: ConnectionId,
    pub data: Vec<u8>,
}

/// Unbounded multi-producer handoff from caller threads into the next `update` tick.
pub struct SendQueue {
    inner: SegQueue<OutboundPayload>,
}

impl SendQueue {
    pub fn new() -> SendQueue {
        SendQueue { inner: SegQueue::new() }
    }

    #[inline]
    pub fn push(&self, payload: OutboundPayload) {
        self.inner.push(payload);
    }

    #[inline]
    pub fn pop(&self) -> Option<OutboundPayload> {
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

impl Default for SendQueue {
    fn default() -> SendQueue {
        SendQueue::new()
    }
}

/// A connection's own outgoing backlog: payloads promoted off the [`SendQueue`] that are waiting
/// for their connection's next send opportunity (good/bad-mode pacing in `connection.rs`).
#[derive(Default)]
pub struct PendingSendBuffer {
    queue: VecDeque<Vec<u8>>,
}

impl PendingSendBuffer {
    pub fn new() -> PendingSendBuffer {
        PendingSendBuffer::default()
    }

    /// Pushes a payload unless already at capacity. Returns the payload back to the caller
    /// when the buffer is full, so it can be retried on a later tick instead of being lost.
    pub fn push(&mut self, payload: Vec<u8>) -> Result<(), Vec<u8>> {
        if self.queue.len() >= MAX_PENDING_SEND {
            return Err(payload);
        }
        self.queue.push_back(payload);
        Ok(())
    }

    #[inline]
    pub fn pop_front(&mut self) -> Option<Vec<u8>> {
        self.queue.pop_front()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// An entry awaiting resend, ordered strictly by insertion (oldest-first), separate from fresh
/// sends so a burst of loss doesn't starve retransmission behind new traffic.
#[derive(Clone, Debug)]
pub struct ResendEntry {
    pub to: ConnectionId,
    pub seq: u32,
    pub data: Vec<u8>,
}

#[derive(Default)]
pub struct ResendQueue {
    queue: VecDeque<ResendEntry>,
}

impl ResendQueue {
    pub fn new() -> ResendQueue {
        ResendQueue::default()
    }

    #[inline]
    pub fn push(&mut self, entry: ResendEntry) {
        self.queue.push_back(entry);
    }

    #[inline]
    pub fn pop_front(&mut self) -> Option<ResendEntry> {
        self.queue.pop_front()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// A payload that has been received, verified, and accepted for a connection, waiting for the
/// embedder to call `get_received`.
#[derive(Clone, Debug)]
pub struct ReceivedPayload {
    pub from: ConnectionId,
    pub data: Vec<u8>,
}

/// Unbounded, lock-free like [`SendQueue`]: the core pushes from inside the tick, the embedder
/// pops from any thread.
pub struct ReceivedQueue {
    inner: SegQueue<ReceivedPayload>,
}

impl ReceivedQueue {
    pub fn new() -> ReceivedQueue {
        ReceivedQueue { inner: SegQueue::new() }
    }

    #[inline]
    pub fn push(&self, payload: ReceivedPayload) {
        self.inner.push(payload);
    }

    #[inline]
    pub fn pop(&self) -> Option<ReceivedPayload> {
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

impl Default for ReceivedQueue {
    fn default() -> ReceivedQueue {
        ReceivedQueue::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv6Addr;

    fn id() -> ConnectionId {
        ConnectionId::from_socket(Ipv6Addr::LOCALHOST, 9000)
    }

    #[test]
    fn send_queue_is_fifo_across_threads() {
        let queue = SendQueue::new();
        queue.push(OutboundPayload { to: id(), data: vec![1] });
        queue.push(OutboundPayload { to: id(), data: vec![2] });

        assert_eq!(queue.pop().unwrap().data, vec![1]);
        assert_eq!(queue.pop().unwrap().data, vec![2]);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn pending_send_buffer_rejects_newest_when_full() {
        let mut buffer = PendingSendBuffer::new();
        for i in 0..MAX_PENDING_SEND {
            assert!(buffer.push(vec![i as u8]).is_ok());
        }

        let rejected = buffer.push(vec![255]);
        assert_eq!(rejected, Err(vec![255]));
        assert_eq!(buffer.len(), MAX_PENDING_SEND);
        assert_eq!(buffer.pop_front().unwrap(), vec![0]);
    }

    #[test]
    fn resend_queue_preserves_order() {
        let mut queue = ResendQueue::new();
        queue.push(ResendEntry { to: id(), seq: 1, data: vec![1] });
        queue.push(ResendEntry { to: id(), seq: 2, data: vec![2] });

        assert_eq!(queue.pop_front().unwrap().seq, 1);
        assert_eq!(queue.pop_front().unwrap().seq, 2);
    }
}
