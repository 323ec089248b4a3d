//! The raw channel contract.
//!
//! The raw channel is the external transport collaborator: an ordered,
//! reliable, full-duplex message pipe established and torn down elsewhere.
//! Protocol channels consume it through this trait plus an event stream.
//! If the concrete transport is not actually reliable, loss surfaces as
//! protocol-level timeouts, never as data corruption.

use std::sync::Arc;

use bytes::Bytes;
use strand_core::ChannelError;
use tokio::sync::Notify;

/// Lifecycle state of a raw channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Events a raw channel delivers to its wrapping protocol channel.
///
/// Delivered over an `mpsc::UnboundedReceiver<RawEvent>` handed to the
/// protocol channel at construction. Order matches wire order.
#[derive(Debug, Clone)]
pub enum RawEvent {
    /// The channel reached the open state.
    Open,
    /// One inbound message, exactly as the peer sent it.
    Message(Bytes),
    /// A transport-level error. The channel may still close afterwards.
    Error(String),
    /// The channel closed. No further events follow.
    Closed,
}

/// Outbound operations on a raw channel.
pub trait RawChannel: Send + Sync {
    /// Current lifecycle state.
    fn ready_state(&self) -> ReadyState;

    /// Transmit one opaque message. Fails with `NotOpen` if the channel
    /// is not in the open state.
    fn send(&self, data: Bytes) -> Result<(), ChannelError>;

    /// Estimate of queued-to-send bytes not yet handed to the network.
    fn buffered_amount(&self) -> usize;

    /// Threshold at or below which the low-buffer signal fires.
    fn low_buffer_threshold(&self) -> usize;

    /// The backpressure signal: notified when `buffered_amount` drains to
    /// or below the threshold. Senders register a waiter before re-checking
    /// the buffered amount so a concurrent drain is never missed.
    fn low_buffer_notify(&self) -> Arc<Notify>;

    /// Close the channel. Idempotent.
    fn close(&self);
}
