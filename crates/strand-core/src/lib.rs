//! strand-core — wire format, configuration, and error types.
//! The protocol crates depend on this one.

pub mod config;
pub mod error;
pub mod wire;

pub use config::ChannelConfig;
pub use error::ChannelError;
pub use wire::{Envelope, WireError};
