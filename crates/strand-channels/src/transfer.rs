//! Chunked transfer channel.
//!
//! The sender declares a transfer with one CHUNK_META envelope (total size,
//! chunk count, application metadata), then streams ordered CHUNK_DATA
//! frames, suspending on the raw channel's low-buffer signal whenever the
//! queued-bytes estimate sits above the threshold. There is no end-to-end
//! acknowledgment: `send_transfer` resolves when the last chunk is handed to
//! the transport.
//!
//! The receiver reassembles per transfer id. A transfer is never emitted
//! with a byte count that disagrees with its declared size; duplicate and
//! out-of-range chunks are ignored, and chunks for unknown ids are dropped
//! with a warning. Assemblies that stop making progress are expired and
//! reported as timed out.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::{Instant, MissedTickBehavior};

use strand_core::{ChannelConfig, ChannelError, Envelope};

use crate::raw::{RawChannel, RawEvent, ReadyState};

/// A fully reassembled inbound transfer.
#[derive(Debug, Clone)]
pub struct IncomingTransfer {
    pub payload: Bytes,
    pub meta: Value,
}

/// Receiver-side notifications.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    /// All declared chunks arrived and the byte count checks out.
    Completed(IncomingTransfer),
    /// The transfer stopped making progress and was discarded.
    TimedOut {
        meta: Value,
        received_chunks: u32,
        expected_chunks: u32,
    },
}

/// Streams large payloads as bounded chunks over a raw channel.
pub struct TransferChannel {
    raw: Arc<dyn RawChannel>,
    next_id: AtomicU64,
    closed: Arc<AtomicBool>,
    close_notify: Arc<Notify>,
    // One active send cursor: concurrent transfers never interleave chunks.
    send_cursor: Mutex<()>,
    config: ChannelConfig,
}

impl TransferChannel {
    /// Wrap a raw channel, spawn the reassembly driver, and return the
    /// channel plus the stream of completed/expired inbound transfers.
    pub fn spawn(
        raw: Arc<dyn RawChannel>,
        events: mpsc::UnboundedReceiver<RawEvent>,
        config: ChannelConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<TransferEvent>) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let channel = Arc::new(Self {
            raw,
            next_id: AtomicU64::new(0),
            closed: Arc::new(AtomicBool::new(false)),
            close_notify: Arc::new(Notify::new()),
            send_cursor: Mutex::new(()),
            config: config.clone(),
        });
        tokio::spawn(drive(
            channel.closed.clone(),
            channel.close_notify.clone(),
            events,
            out_tx,
            config,
        ));
        (channel, out_rx)
    }

    /// Send one payload as a metadata frame plus ordered chunks.
    ///
    /// Resolves when the whole payload has been handed to the raw channel.
    /// Suspends between chunks while the transport's queued bytes sit above
    /// its low-buffer threshold. Aborts with `Closed` if the channel closes
    /// mid-transfer.
    pub async fn send_transfer(&self, payload: Bytes, meta: Value) -> Result<(), ChannelError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }
        if self.raw.ready_state() != ReadyState::Open {
            return Err(ChannelError::NotOpen);
        }

        let _cursor = self.send_cursor.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed).to_string();
        let chunk_size = self.config.chunk_size;
        let chunk_count = payload.len().div_ceil(chunk_size) as u32;

        self.send_envelope(Envelope::ChunkMeta {
            id: id.clone(),
            total_size: payload.len() as u64,
            chunk_count,
            meta,
        })?;

        for index in 0..chunk_count {
            if index > 0 {
                self.wait_for_buffer_room().await?;
            }
            if self.closed.load(Ordering::SeqCst) {
                return Err(ChannelError::Closed);
            }
            let start = index as usize * chunk_size;
            let end = (start + chunk_size).min(payload.len());
            self.send_envelope(Envelope::ChunkData {
                id: id.clone(),
                index,
                data: payload.slice(start..end),
            })?;
        }
        Ok(())
    }

    /// Close the channel. An in-flight `send_transfer` wakes and fails with
    /// `Closed`; partial inbound assemblies are discarded without emission.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.close_notify.notify_waiters();
        self.raw.close();
    }

    fn send_envelope(&self, envelope: Envelope) -> Result<(), ChannelError> {
        let text = envelope.encode()?;
        self.raw.send(Bytes::from(text))
    }

    /// Park until the transport's queue drains to the threshold. Waiters
    /// are enabled before the re-checks so a drain or close racing this
    /// call is never missed.
    async fn wait_for_buffer_room(&self) -> Result<(), ChannelError> {
        let threshold = self.raw.low_buffer_threshold();
        loop {
            let notify = self.raw.low_buffer_notify();
            let drained = notify.notified();
            let closed = self.close_notify.notified();
            tokio::pin!(drained, closed);
            drained.as_mut().enable();
            closed.as_mut().enable();

            if self.closed.load(Ordering::SeqCst) {
                return Err(ChannelError::Closed);
            }
            if self.raw.buffered_amount() <= threshold {
                return Ok(());
            }
            tokio::select! {
                _ = &mut drained => {}
                _ = &mut closed => return Err(ChannelError::Closed),
            }
        }
    }
}

// Chunks live in a map keyed by index, not a pre-sized slot vector:
// nothing here allocates from peer-declared counts, so an anomalous
// metadata frame cannot force a huge allocation.
struct Assembly {
    total_size: u64,
    chunk_count: u32,
    meta: Value,
    chunks: BTreeMap<u32, Bytes>,
    last_chunk_at: Instant,
}

/// Reassembly loop: owns the per-id assembly table, emits completed
/// transfers, expires stalled ones.
async fn drive(
    closed: Arc<AtomicBool>,
    close_notify: Arc<Notify>,
    mut events: mpsc::UnboundedReceiver<RawEvent>,
    out: mpsc::UnboundedSender<TransferEvent>,
    config: ChannelConfig,
) {
    let mut assemblies: HashMap<String, Assembly> = HashMap::new();
    let mut expiry = tokio::time::interval(Duration::from_secs(1));
    expiry.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(RawEvent::Message(data)) => {
                    handle_message(&mut assemblies, &out, data);
                }
                Some(RawEvent::Error(err)) => {
                    tracing::warn!(error = %err, "raw channel error");
                }
                Some(RawEvent::Open) => {}
                Some(RawEvent::Closed) | None => break,
            },
            _ = expiry.tick() => {
                if let Some(timeout) = config.transfer_timeout() {
                    expire_stalled(&mut assemblies, &out, timeout);
                }
            }
        }
    }

    if !assemblies.is_empty() {
        tracing::debug!(
            partial = assemblies.len(),
            "discarding partial transfers on close"
        );
    }
    closed.store(true, Ordering::SeqCst);
    close_notify.notify_waiters();
}

fn handle_message(
    assemblies: &mut HashMap<String, Assembly>,
    out: &mpsc::UnboundedSender<TransferEvent>,
    data: Bytes,
) {
    let Ok(text) = std::str::from_utf8(&data) else {
        tracing::warn!(bytes = data.len(), "non-text message on transfer channel, dropping");
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
        Envelope::ChunkMeta {
            id,
            total_size,
            chunk_count,
            meta,
        } => {
            // Latest metadata for an id wins: progress under the old
            // metadata does not count toward the new one.
            if assemblies.remove(&id).is_some() {
                tracing::debug!(id = %id, "replacing in-progress transfer");
            }
            if chunk_count == 0 {
                if total_size == 0 {
                    let _ = out.send(TransferEvent::Completed(IncomingTransfer {
                        payload: Bytes::new(),
                        meta,
                    }));
                } else {
                    tracing::warn!(
                        id = %id,
                        total_size,
                        "chunkless transfer declares nonzero size, dropping"
                    );
                }
                return;
            }
            // Every chunk carries at least one byte, so an honest sender
            // never declares more chunks than payload bytes.
            if u64::from(chunk_count) > total_size {
                tracing::warn!(
                    id = %id,
                    chunk_count,
                    total_size,
                    "declared chunk count exceeds payload size, dropping"
                );
                return;
            }
            assemblies.insert(
                id,
                Assembly {
                    total_size,
                    chunk_count,
                    meta,
                    chunks: BTreeMap::new(),
                    last_chunk_at: Instant::now(),
                },
            );
        }
        Envelope::ChunkData { id, index, data } => {
            let Some(assembly) = assemblies.get_mut(&id) else {
                tracing::warn!(id = %id, index, "chunk for unknown transfer, dropping");
                return;
            };
            if index >= assembly.chunk_count {
                tracing::warn!(
                    id = %id,
                    index,
                    chunk_count = assembly.chunk_count,
                    "chunk index out of range, ignoring"
                );
                return;
            }
            if assembly.chunks.contains_key(&index) {
                tracing::debug!(id = %id, index, "duplicate chunk, ignoring");
                return;
            }
            assembly.chunks.insert(index, data);
            assembly.last_chunk_at = Instant::now();

            if assembly.chunks.len() as u32 == assembly.chunk_count {
                if let Some(assembly) = assemblies.remove(&id) {
                    complete(assembly, &id, out);
                }
            }
        }
        other => {
            tracing::warn!(
                kind = other.kind(),
                id = %other.id(),
                "request envelope on transfer channel, dropping"
            );
        }
    }
}

/// Concatenate chunks in index order and emit, unless the byte count
/// disagrees with the declared size. Allocates from the bytes actually
/// received, never from the peer-declared total.
fn complete(assembly: Assembly, id: &str, out: &mpsc::UnboundedSender<TransferEvent>) {
    let received: usize = assembly.chunks.values().map(|chunk| chunk.len()).sum();
    if received as u64 != assembly.total_size {
        tracing::warn!(
            id = %id,
            declared = assembly.total_size,
            actual = received,
            "reassembled size mismatch, dropping transfer"
        );
        return;
    }
    let mut payload = Vec::with_capacity(received);
    for chunk in assembly.chunks.values() {
        payload.extend_from_slice(chunk);
    }
    tracing::debug!(
        id = %id,
        bytes = payload.len(),
        chunks = assembly.chunk_count,
        "transfer reassembled"
    );
    let _ = out.send(TransferEvent::Completed(IncomingTransfer {
        payload: Bytes::from(payload),
        meta: assembly.meta,
    }));
}

fn expire_stalled(
    assemblies: &mut HashMap<String, Assembly>,
    out: &mpsc::UnboundedSender<TransferEvent>,
    timeout: Duration,
) {
    let stalled: Vec<String> = assemblies
        .iter()
        .filter(|(_, assembly)| assembly.last_chunk_at.elapsed() > timeout)
        .map(|(id, _)| id.clone())
        .collect();
    for id in stalled {
        if let Some(assembly) = assemblies.remove(&id) {
            let received = assembly.chunks.len() as u32;
            tracing::warn!(
                id = %id,
                received,
                expected = assembly.chunk_count,
                "transfer stalled, discarding"
            );
            let _ = out.send(TransferEvent::TimedOut {
                meta: assembly.meta,
                received_chunks: received,
                expected_chunks: assembly.chunk_count,
            });
        }
    }
}
