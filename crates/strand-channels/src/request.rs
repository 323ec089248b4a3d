//! Correlated request/response channel.
//!
//! Every outbound call gets a fresh correlation id and a oneshot waiter in
//! the pending table; a driver task demuxes inbound envelopes and resolves
//! waiters. The timeout window grows with channel load: `base + increment ×
//! pending-at-send`, favoring fewer spurious timeouts over fast failure.
//!
//! Correlation ids come from a per-instance monotonic counter, so collisions
//! within an instance are impossible. Ids carry no meaning across instances.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use strand_core::{ChannelConfig, ChannelError, Envelope};

use crate::raw::{RawChannel, RawEvent, ReadyState};

/// Application hook for inbound requests.
///
/// Returning `Ok` sends a SUCCESS_RESPONSE with the value; returning `Err`
/// sends an ERROR_RESPONSE with the text. Exactly one response goes out per
/// request either way, so the remote caller never times out on a failure
/// this side can observe.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, data: Value) -> Result<Value, String>;
}

type PendingTable = Arc<DashMap<String, oneshot::Sender<Result<Value, ChannelError>>>>;

/// Awaitable calls over a raw channel.
pub struct RequestChannel {
    raw: Arc<dyn RawChannel>,
    pending: PendingTable,
    next_id: AtomicU64,
    closed: Arc<AtomicBool>,
    config: ChannelConfig,
}

impl RequestChannel {
    /// Wrap a raw channel and spawn the demux driver.
    pub fn spawn(
        raw: Arc<dyn RawChannel>,
        events: mpsc::UnboundedReceiver<RawEvent>,
        handler: Arc<dyn RequestHandler>,
        config: ChannelConfig,
    ) -> Arc<Self> {
        let channel = Arc::new(Self {
            raw: raw.clone(),
            pending: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(0),
            closed: Arc::new(AtomicBool::new(false)),
            config,
        });
        tokio::spawn(drive(
            raw,
            channel.pending.clone(),
            channel.closed.clone(),
            events,
            handler,
        ));
        channel
    }

    /// Send a request and await the matching response.
    ///
    /// Fails immediately with `Closed` after `close()`, or `NotOpen` if the
    /// raw channel is not open — the wire is never touched in either case.
    /// Otherwise resolves with the peer handler's value, `Remote` if the
    /// peer reported failure, or `Timeout` when the window elapses.
    pub async fn call(&self, data: Value) -> Result<Value, ChannelError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }
        if self.raw.ready_state() != ReadyState::Open {
            return Err(ChannelError::NotOpen);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed).to_string();
        let timeout = self.config.request_timeout(self.pending.len());

        let text = Envelope::Request {
            id: id.clone(),
            data,
        }
        .encode()?;

        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.insert(id.clone(), reply_tx);

        // close() may sweep the table between the check above and this
        // insert; a waiter registered after the sweep must not linger.
        if self.closed.load(Ordering::SeqCst) {
            self.pending.remove(&id);
            return Err(ChannelError::Closed);
        }

        if let Err(err) = self.raw.send(Bytes::from(text)) {
            self.pending.remove(&id);
            return Err(err);
        }

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            // Driver dropped the waiter without resolving: shutdown.
            Ok(Err(_)) => Err(ChannelError::Closed),
            Err(_) => {
                // First resolution wins. A response racing this removal
                // finds no entry and is logged as unroutable.
                self.pending.remove(&id);
                Err(ChannelError::Timeout(timeout))
            }
        }
    }

    /// Calls currently awaiting a response.
    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    /// Reject every pending call with `Closed` and close the raw channel.
    /// Idempotent. No awaited call is ever left unresolved by shutdown.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        reject_all(&self.pending);
        self.raw.close();
    }
}

fn reject_all(pending: &PendingTable) {
    let ids: Vec<String> = pending.iter().map(|entry| entry.key().clone()).collect();
    for id in ids {
        if let Some((_, reply_tx)) = pending.remove(&id) {
            let _ = reply_tx.send(Err(ChannelError::Closed));
        }
    }
}

/// Demux loop: decode inbound envelopes, dispatch requests to the handler,
/// resolve pending waiters, drop everything unroutable.
async fn drive(
    raw: Arc<dyn RawChannel>,
    pending: PendingTable,
    closed: Arc<AtomicBool>,
    mut events: mpsc::UnboundedReceiver<RawEvent>,
    handler: Arc<dyn RequestHandler>,
) {
    loop {
        match events.recv().await {
            Some(RawEvent::Message(data)) => {
                handle_message(&raw, &pending, &handler, data);
            }
            Some(RawEvent::Error(err)) => {
                tracing::warn!(error = %err, "raw channel error");
            }
            Some(RawEvent::Open) => {}
            Some(RawEvent::Closed) | None => break,
        }
    }
    closed.store(true, Ordering::SeqCst);
    reject_all(&pending);
}

fn handle_message(
    raw: &Arc<dyn RawChannel>,
    pending: &PendingTable,
    handler: &Arc<dyn RequestHandler>,
    data: Bytes,
) {
    let Ok(text) = std::str::from_utf8(&data) else {
        tracing::warn!(bytes = data.len(), "non-text message on request channel, dropping");
        return;
    };
    let envelope = match Envelope::decode(text) {
        Ok(envelope) => envelope,
        Err(err) => {
            tracing::warn!(error = %err, "undecodable envelope, dropping");
            return;
        }
    };

    match envelope {
        Envelope::Request { id, data } => {
            // Handlers run in their own task: a slow handler never blocks
            // the demux of responses to our own outbound calls.
            let raw = raw.clone();
            let handler = handler.clone();
            tokio::spawn(async move {
                let response = match handler.handle(data).await {
                    Ok(value) => Envelope::SuccessResponse {
                        id: id.clone(),
                        data: value,
                    },
                    Err(err) => Envelope::ErrorResponse {
                        id: id.clone(),
                        err,
                    },
                };
                send_response(&raw, response, &id);
            });
        }
        Envelope::SuccessResponse { id, data } => resolve(pending, &id, Ok(data)),
        Envelope::ErrorResponse { id, err } => {
            resolve(pending, &id, Err(ChannelError::Remote(err)));
        }
        other => {
            tracing::warn!(
                kind = other.kind(),
                id = %other.id(),
                "chunk envelope on request channel, dropping"
            );
        }
    }
}

/// Send a response envelope. If the success payload fails to encode, the
/// peer gets an ERROR_RESPONSE describing the encode failure instead of
/// being left to time out.
fn send_response(raw: &Arc<dyn RawChannel>, response: Envelope, id: &str) {
    let text = match response.encode() {
        Ok(text) => text,
        Err(err) => {
            let fallback = Envelope::ErrorResponse {
                id: id.to_string(),
                err: format!("response encoding failed: {err}"),
            };
            match fallback.encode() {
                Ok(text) => text,
                Err(err) => {
                    tracing::error!(id = %id, error = %err, "cannot encode error response");
                    return;
                }
            }
        }
    };
    if let Err(err) = raw.send(Bytes::from(text)) {
        tracing::warn!(id = %id, error = %err, "failed to send response");
    }
}

fn resolve(pending: &PendingTable, id: &str, result: Result<Value, ChannelError>) {
    match pending.remove(id) {
        Some((_, reply_tx)) => {
            let _ = reply_tx.send(result);
        }
        None => {
            tracing::debug!(id = %id, "response for unknown or expired call, dropping");
        }
    }
}
