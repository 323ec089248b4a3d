//! Strand wire format — the envelope exchanged over the raw channel.
//!
//! Every message either protocol puts on the wire is one envelope: a JSON
//! text record with a numeric `kind` discriminant and a correlation/transfer
//! `id` string. Field names are part of the protocol and must not change.
//! Binary chunk payloads travel as hex strings inside the text envelope.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Wire discriminant: outbound call.
pub const KIND_REQUEST: u8 = 0;
/// Wire discriminant: successful response to a call.
pub const KIND_SUCCESS_RESPONSE: u8 = 1;
/// Wire discriminant: failed response to a call.
pub const KIND_ERROR_RESPONSE: u8 = 2;
/// Wire discriminant: transfer metadata, sent before the first chunk.
pub const KIND_CHUNK_META: u8 = 3;
/// Wire discriminant: one chunk of a transfer payload.
pub const KIND_CHUNK_DATA: u8 = 4;

/// One self-describing message unit exchanged over the raw channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    /// A correlated call. `id` links the eventual response back to the caller.
    Request { id: String, data: Value },
    /// The peer handler succeeded.
    SuccessResponse { id: String, data: Value },
    /// The peer handler failed. `err` is a description, not a structured error.
    ErrorResponse { id: String, err: String },
    /// Declares a transfer: total byte size, chunk count, application metadata.
    ChunkMeta {
        id: String,
        total_size: u64,
        chunk_count: u32,
        meta: Value,
    },
    /// One ordered slice of a transfer payload.
    ChunkData { id: String, index: u32, data: Bytes },
}

impl Envelope {
    /// The correlation or transfer id this envelope belongs to.
    pub fn id(&self) -> &str {
        match self {
            Envelope::Request { id, .. }
            | Envelope::SuccessResponse { id, .. }
            | Envelope::ErrorResponse { id, .. }
            | Envelope::ChunkMeta { id, .. }
            | Envelope::ChunkData { id, .. } => id,
        }
    }

    /// The numeric wire discriminant.
    pub fn kind(&self) -> u8 {
        match self {
            Envelope::Request { .. } => KIND_REQUEST,
            Envelope::SuccessResponse { .. } => KIND_SUCCESS_RESPONSE,
            Envelope::ErrorResponse { .. } => KIND_ERROR_RESPONSE,
            Envelope::ChunkMeta { .. } => KIND_CHUNK_META,
            Envelope::ChunkData { .. } => KIND_CHUNK_DATA,
        }
    }

    /// Encode to the JSON text form sent over the raw channel.
    pub fn encode(&self) -> Result<String, WireError> {
        let raw = match self {
            Envelope::Request { id, data } => RawEnvelope {
                kind: KIND_REQUEST,
                id: id.clone(),
                data: Some(data.clone()),
                ..RawEnvelope::empty()
            },
            Envelope::SuccessResponse { id, data } => RawEnvelope {
                kind: KIND_SUCCESS_RESPONSE,
                id: id.clone(),
                data: Some(data.clone()),
                ..RawEnvelope::empty()
            },
            Envelope::ErrorResponse { id, err } => RawEnvelope {
                kind: KIND_ERROR_RESPONSE,
                id: id.clone(),
                err: Some(err.clone()),
                ..RawEnvelope::empty()
            },
            Envelope::ChunkMeta {
                id,
                total_size,
                chunk_count,
                meta,
            } => RawEnvelope {
                kind: KIND_CHUNK_META,
                id: id.clone(),
                total_size: Some(*total_size),
                chunk_count: Some(*chunk_count),
                meta: Some(meta.clone()),
                ..RawEnvelope::empty()
            },
            Envelope::ChunkData { id, index, data } => RawEnvelope {
                kind: KIND_CHUNK_DATA,
                id: id.clone(),
                index: Some(*index),
                data: Some(Value::String(hex::encode(data))),
                ..RawEnvelope::empty()
            },
        };
        Ok(serde_json::to_string(&raw)?)
    }

    /// Decode an envelope from its JSON text form.
    pub fn decode(text: &str) -> Result<Envelope, WireError> {
        let raw: RawEnvelope = serde_json::from_str(text)?;
        let kind = raw.kind;
        match kind {
            // A JSON `null` payload and an absent one are indistinguishable
            // after deserialization; both decode as Value::Null.
            KIND_REQUEST => Ok(Envelope::Request {
                id: raw.id,
                data: raw.data.unwrap_or(Value::Null),
            }),
            KIND_SUCCESS_RESPONSE => Ok(Envelope::SuccessResponse {
                id: raw.id,
                data: raw.data.unwrap_or(Value::Null),
            }),
            KIND_ERROR_RESPONSE => Ok(Envelope::ErrorResponse {
                id: raw.id,
                err: require(kind, "err", raw.err)?,
            }),
            KIND_CHUNK_META => Ok(Envelope::ChunkMeta {
                id: raw.id,
                total_size: require(kind, "totalSize", raw.total_size)?,
                chunk_count: require(kind, "chunkCount", raw.chunk_count)?,
                meta: raw.meta.unwrap_or(Value::Null),
            }),
            KIND_CHUNK_DATA => {
                let data = require(kind, "data", raw.data)?;
                let text = data.as_str().ok_or(WireError::MissingField {
                    kind,
                    field: "data",
                })?;
                Ok(Envelope::ChunkData {
                    id: raw.id,
                    index: require(kind, "index", raw.index)?,
                    data: Bytes::from(hex::decode(text)?),
                })
            }
            other => Err(WireError::UnknownKind(other)),
        }
    }
}

fn require<T>(kind: u8, field: &'static str, value: Option<T>) -> Result<T, WireError> {
    value.ok_or(WireError::MissingField { kind, field })
}

/// The literal on-wire record. All per-kind fields are optional here;
/// `Envelope::decode` enforces which ones each kind requires.
#[derive(Serialize, Deserialize)]
struct RawEnvelope {
    kind: u8,
    id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    err: Option<String>,
    #[serde(rename = "totalSize", default, skip_serializing_if = "Option::is_none")]
    total_size: Option<u64>,
    #[serde(rename = "chunkCount", default, skip_serializing_if = "Option::is_none")]
    chunk_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    meta: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    index: Option<u32>,
}

impl RawEnvelope {
    fn empty() -> Self {
        Self {
            kind: 0,
            id: String::new(),
            data: None,
            err: None,
            total_size: None,
            chunk_count: None,
            meta: None,
            index: None,
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("unknown envelope kind: {0}")]
    UnknownKind(u8),

    #[error("envelope kind {kind} missing field `{field}`")]
    MissingField { kind: u8, field: &'static str },

    #[error("chunk data is not valid hex: {0}")]
    InvalidChunkData(#[from] hex::FromHexError),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
