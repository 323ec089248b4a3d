//! In-memory raw channel pair.
//!
//! Two linked endpoints in one process: what one side sends, the other
//! receives as a `RawEvent::Message`. In auto-drain mode delivery is
//! immediate and `buffered_amount` stays zero. In manual-drain mode sends
//! queue until [`MemoryChannel::drain`] releases them, which makes the
//! backpressure path deterministic under test: the queue is the "buffered
//! amount", and draining it to or below the threshold fires the low-buffer
//! signal.
//!
//! Closing either side closes the pair: both endpoints transition to the
//! closed state and both event streams end with [`RawEvent::Closed`].

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use bytes::Bytes;
use strand_core::ChannelError;
use tokio::sync::{mpsc, Notify};

use crate::raw::{RawChannel, RawEvent, ReadyState};

/// One side of an in-memory channel pair.
pub struct MemoryChannel {
    inner: Mutex<Inner>,
    low_buffer: Arc<Notify>,
    threshold: usize,
    auto_drain: bool,
}

struct Inner {
    state: ReadyState,
    queued: VecDeque<Bytes>,
    buffered: usize,
    local: mpsc::UnboundedSender<RawEvent>,
    peer: mpsc::UnboundedSender<RawEvent>,
    peer_channel: Weak<MemoryChannel>,
}

/// A channel endpoint plus the event stream its protocol wrapper consumes.
pub struct MemoryEndpoint {
    pub channel: Arc<MemoryChannel>,
    pub events: mpsc::UnboundedReceiver<RawEvent>,
}

impl MemoryChannel {
    /// Linked pair with immediate delivery. Both sides start open.
    pub fn pair(threshold: usize) -> (MemoryEndpoint, MemoryEndpoint) {
        Self::pair_inner(threshold, true)
    }

    /// Linked pair where outbound messages queue until `drain` is called.
    pub fn manual_pair(threshold: usize) -> (MemoryEndpoint, MemoryEndpoint) {
        Self::pair_inner(threshold, false)
    }

    fn pair_inner(threshold: usize, auto_drain: bool) -> (MemoryEndpoint, MemoryEndpoint) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();

        let a = Arc::new(Self::new(a_tx.clone(), b_tx.clone(), threshold, auto_drain));
        let b = Arc::new(Self::new(b_tx, a_tx, threshold, auto_drain));
        a.lock().peer_channel = Arc::downgrade(&b);
        b.lock().peer_channel = Arc::downgrade(&a);

        (
            MemoryEndpoint {
                channel: a,
                events: a_rx,
            },
            MemoryEndpoint {
                channel: b,
                events: b_rx,
            },
        )
    }

    fn new(
        local: mpsc::UnboundedSender<RawEvent>,
        peer: mpsc::UnboundedSender<RawEvent>,
        threshold: usize,
        auto_drain: bool,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: ReadyState::Open,
                queued: VecDeque::new(),
                buffered: 0,
                local,
                peer,
                peer_channel: Weak::new(),
            }),
            low_buffer: Arc::new(Notify::new()),
            threshold,
            auto_drain,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Never held across an await, so poisoning only follows a panic
        // that already ended the test or task.
        self.inner.lock().expect("memory channel state poisoned")
    }

    /// Force the lifecycle state. Test hook for exercising preconditions.
    pub fn set_ready_state(&self, state: ReadyState) {
        self.lock().state = state;
    }

    /// Deliver up to `count` queued messages to the peer. Fires the
    /// low-buffer signal when the queue dips to or below the threshold.
    /// Returns how many messages were delivered.
    pub fn drain(&self, count: usize) -> usize {
        let mut inner = self.lock();
        let mut delivered = 0;
        while delivered < count {
            let Some(message) = inner.queued.pop_front() else {
                break;
            };
            inner.buffered -= message.len();
            let _ = inner.peer.send(RawEvent::Message(message));
            delivered += 1;
        }
        if inner.buffered <= self.threshold {
            self.low_buffer.notify_waiters();
        }
        delivered
    }

    /// Deliver every queued message to the peer.
    pub fn drain_all(&self) -> usize {
        self.drain(usize::MAX)
    }

    /// Number of messages still queued (manual-drain mode).
    pub fn queued_messages(&self) -> usize {
        self.lock().queued.len()
    }
}

impl RawChannel for MemoryChannel {
    fn ready_state(&self) -> ReadyState {
        self.lock().state
    }

    fn send(&self, data: Bytes) -> Result<(), ChannelError> {
        let mut inner = self.lock();
        if inner.state != ReadyState::Open {
            return Err(ChannelError::NotOpen);
        }
        if self.auto_drain {
            let _ = inner.peer.send(RawEvent::Message(data));
        } else {
            inner.buffered += data.len();
            inner.queued.push_back(data);
        }
        Ok(())
    }

    fn buffered_amount(&self) -> usize {
        self.lock().buffered
    }

    fn low_buffer_threshold(&self) -> usize {
        self.threshold
    }

    fn low_buffer_notify(&self) -> Arc<Notify> {
        self.low_buffer.clone()
    }

    fn close(&self) {
        let peer = {
            let mut inner = self.lock();
            if inner.state == ReadyState::Closed {
                return;
            }
            inner.state = ReadyState::Closed;
            // Both drivers observe the close, not just the peer's.
            let _ = inner.local.send(RawEvent::Closed);
            let _ = inner.peer.send(RawEvent::Closed);
            inner.peer_channel.upgrade()
        };
        // The peer's lock is taken only after ours is released.
        if let Some(peer) = peer {
            peer.lock().state = ReadyState::Closed;
        }
    }
}
