//! strand-channels — two application-level protocols over a raw,
//! message-oriented peer channel.
//!
//! [`RequestChannel`] turns fire-and-forget sends into awaitable calls with
//! escalating timeouts. [`TransferChannel`] streams a large binary payload as
//! bounded chunks, pacing against transport backpressure, and reassembles it
//! on the receiving peer. Both speak the envelope format from `strand-core`
//! and consume the [`RawChannel`] contract; the [`memory`] module provides an
//! in-process raw channel for tests and loopback peers.

pub mod memory;
pub mod raw;
pub mod request;
pub mod transfer;

pub use memory::{MemoryChannel, MemoryEndpoint};
pub use raw::{RawChannel, RawEvent, ReadyState};
pub use request::{RequestChannel, RequestHandler};
pub use transfer::{IncomingTransfer, TransferChannel, TransferEvent};
