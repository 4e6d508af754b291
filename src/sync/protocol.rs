// Protocol - Request/response messages exchanged between replicas
//
// Every message travels inside a versioned envelope. A peer that speaks a
// different protocol version is refused at decode time, before any state
// is touched. Page sizes are capped on both sides with MAX_BATCH_SIZE.

use crate::ledger::{EntityChange, InstanceId};
use crate::sector::{GlobalDigest, SectorDigest};
use crate::sync::apply::SkippedChange;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use crate::config::MAX_BATCH_SIZE;

/// Version of the wire protocol spoken by this build
pub const PROTOCOL_VERSION: u16 = 1;

/// Protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    #[error("Deserialization failed")]
    DeserializationFailed,

    #[error("Unsupported protocol version {got} (expected {expected})")]
    UnsupportedVersion { got: u16, expected: u16 },
}

/// Versioned wrapper around every message on the wire
#[derive(Clone, Debug, Serialize, Deserialize)]
struct Envelope<T> {
    version: u16,
    body: T,
}

fn encode<T: Serialize>(body: &T) -> Result<Vec<u8>, ProtocolError> {
    postcard::to_allocvec(&Envelope {
        version: PROTOCOL_VERSION,
        body,
    })
    .map_err(|e| ProtocolError::SerializationFailed(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    // The version is the first field, so it can be read before the body
    let (version, _): (u16, &[u8]) =
        postcard::take_from_bytes(bytes).map_err(|_| ProtocolError::DeserializationFailed)?;
    if version != PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion {
            got: version,
            expected: PROTOCOL_VERSION,
        });
    }
    let envelope: Envelope<T> =
        postcard::from_bytes(bytes).map_err(|_| ProtocolError::DeserializationFailed)?;
    Ok(envelope.body)
}

// ============================================================================
// CHANGE RECORD
// ============================================================================

/// One change as it travels between replicas
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    change: EntityChange,
    /// Entity payload, present only while this record is the sender's
    /// current version of a live entity
    payload: Option<Vec<u8>>,
    /// The sender holds a newer record for the same key
    superseded: bool,
}

impl ChangeRecord {
    pub fn new(change: EntityChange, payload: Option<Vec<u8>>, superseded: bool) -> Self {
        Self {
            change,
            payload,
            superseded,
        }
    }

    pub fn change(&self) -> &EntityChange {
        &self.change
    }

    pub fn payload(&self) -> Option<&[u8]> {
        self.payload.as_deref()
    }

    pub fn is_superseded(&self) -> bool {
        self.superseded
    }
}

// ============================================================================
// REQUESTS
// ============================================================================

/// Requests sent by the session initiator
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    /// Identify ourselves and learn who is on the other end
    Handshake {
        instance_id: InstanceId,
        protocol_version: u16,
        head_sequence: u64,
    },
    /// Combination of every sector digest
    GetGlobalDigest,
    /// A page of per-sector digests
    GetSectorDigests { start: u16, limit: u16 },
    /// Changes after `since`, optionally restricted to one sector.
    /// Changes that originated at `requester` are left out.
    GetChanges {
        requester: InstanceId,
        sector: Option<u8>,
        since: u64,
        limit: u32,
    },
    /// Changes for the responder to apply
    PushChanges {
        origin: InstanceId,
        records: Vec<ChangeRecord>,
    },
    /// Cursors the initiator committed, mirrored by the responder
    Finished {
        requester: InstanceId,
        pulled: u64,
        pushed: u64,
    },
}

impl Request {
    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Request::Handshake { .. } => "handshake",
            Request::GetGlobalDigest => "get_global_digest",
            Request::GetSectorDigests { .. } => "get_sector_digests",
            Request::GetChanges { .. } => "get_changes",
            Request::PushChanges { .. } => "push_changes",
            Request::Finished { .. } => "finished",
        }
    }

    /// Serialize inside a versioned envelope
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    /// Deserialize, refusing other protocol versions
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

// ============================================================================
// RESPONSES
// ============================================================================

/// Responses returned by the session responder
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Handshake {
        instance_id: InstanceId,
        protocol_version: u16,
        head_sequence: u64,
        /// The responder holds committed sync state for the requester
        knows_requester: bool,
    },
    GlobalDigest(GlobalDigest),
    SectorDigests {
        digests: Vec<SectorDigest>,
        /// First sector of the next page, if any
        next: Option<u16>,
    },
    Changes {
        records: Vec<ChangeRecord>,
        has_more: bool,
        /// Restart token: sequence id of the last record scanned,
        /// including records filtered out for the requester
        last_sequence: u64,
    },
    Pushed {
        adopted: u32,
        kept_local: u32,
        unchanged: u32,
        skipped: Vec<SkippedChange>,
    },
    Finished,
    Error { message: String },
}

impl Response {
    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Response::Handshake { .. } => "handshake",
            Response::GlobalDigest(_) => "global_digest",
            Response::SectorDigests { .. } => "sector_digests",
            Response::Changes { .. } => "changes",
            Response::Pushed { .. } => "pushed",
            Response::Finished => "finished",
            Response::Error { .. } => "error",
        }
    }

    /// Serialize inside a versioned envelope
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    /// Deserialize, refusing other protocol versions
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}
