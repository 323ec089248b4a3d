//! Protocol error types.
//!
//! Unroutable inbound traffic (a response for an unknown id, a chunk for an
//! unknown transfer) is deliberately not an error variant: it is logged and
//! dropped, never surfaced to the application.

use std::time::Duration;

/// Failures surfaced to callers of the protocol channels.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ChannelError {
    /// Operation attempted while the raw channel is not open.
    #[error("raw channel is not open")]
    NotOpen,

    /// The channel was closed before or while the operation was in flight.
    #[error("channel closed")]
    Closed,

    /// No response arrived within the escalating timeout window.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The peer's handler reported failure. Carries the peer's error text.
    #[error("remote error: {0}")]
    Remote(String),

    /// A payload could not be serialized for the wire.
    #[error("encoding failed: {0}")]
    Encoding(String),

    /// The raw channel rejected a send.
    #[error("transport error: {0}")]
    Transport(String),
}

impl From<crate::wire::WireError> for ChannelError {
    fn from(err: crate::wire::WireError) -> Self {
        ChannelError::Encoding(err.to_string())
    }
}
