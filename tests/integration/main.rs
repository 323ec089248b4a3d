//! Strand integration test harness.
//!
//! End-to-end tests wire two protocol endpoints over the in-memory raw
//! channel pair: correlated calls in `requests`, chunked transfers in
//! `transfers`. Everything runs in-process; no external transport is needed.

mod transfers;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use strand_channels::{
    MemoryChannel, RequestChannel, RequestHandler, TransferChannel, TransferEvent,
};
use strand_core::ChannelConfig;

// ── Harness ───────────────────────────────────────────────────────────────────

/// Replies `"pong"` to `{"op": "ping"}`, rejects anything else.
pub struct PingHandler;

#[async_trait]
impl RequestHandler for PingHandler {
    async fn handle(&self, data: Value) -> Result<Value, String> {
        match data["op"].as_str() {
            Some("ping") => Ok(Value::String("pong".into())),
            other => Err(format!("unknown op: {other:?}")),
        }
    }
}

/// Echoes the payload back after sleeping `delay_ms` milliseconds, so tests
/// can force calls to resolve out of send order.
pub struct DelayedEcho;

#[async_trait]
impl RequestHandler for DelayedEcho {
    async fn handle(&self, data: Value) -> Result<Value, String> {
        if let Some(ms) = data["delay_ms"].as_u64() {
            tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
        }
        Ok(data)
    }
}

/// Never answers. Calls against this peer can only time out.
pub struct NeverAnswers;

#[async_trait]
impl RequestHandler for NeverAnswers {
    async fn handle(&self, _data: Value) -> Result<Value, String> {
        std::future::pending::<()>().await;
        unreachable!()
    }
}

/// Two linked request channels: (caller side, peer side).
pub fn request_pair(
    caller_handler: Arc<dyn RequestHandler>,
    peer_handler: Arc<dyn RequestHandler>,
    config: ChannelConfig,
) -> (Arc<RequestChannel>, Arc<RequestChannel>) {
    let (a, b) = MemoryChannel::pair(config.low_buffer_threshold);
    let caller = RequestChannel::spawn(a.channel, a.events, caller_handler, config.clone());
    let peer = RequestChannel::spawn(b.channel, b.events, peer_handler, config);
    (caller, peer)
}

/// Two linked transfer channels plus each side's inbound event stream.
pub fn transfer_pair(
    config: ChannelConfig,
) -> (
    Arc<TransferChannel>,
    mpsc::UnboundedReceiver<TransferEvent>,
    Arc<TransferChannel>,
    mpsc::UnboundedReceiver<TransferEvent>,
) {
    let (a, b) = MemoryChannel::pair(config.low_buffer_threshold);
    let (sender, sender_incoming) = TransferChannel::spawn(a.channel, a.events, config.clone());
    let (receiver, receiver_incoming) = TransferChannel::spawn(b.channel, b.events, config);
    (sender, sender_incoming, receiver, receiver_incoming)
}

/// A deterministic payload of `len` bytes.
pub fn patterned_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
