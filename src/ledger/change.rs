// Entity Change - One record per mutation of a syncable entity
//
// The ledger only ever stores flat key/hash/timestamp records. Payloads are
// opaque bytes owned by entity storage; the engine compares hashes,
// timestamps and the erased flag, never payload contents.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Number of hash buckets the key space is partitioned into
pub const SECTOR_COUNT: usize = 256;

/// Separator appended to encoded keys; never valid inside UTF-8 text
const KEY_TERMINATOR: u8 = 0xFF;

/// Errors from parsing or decoding change records
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChangeError {
    #[error("Unknown entity type: {0}")]
    UnknownEntityType(String),

    #[error("Invalid entity key encoding")]
    InvalidKey,

    #[error("Entity id must not be empty")]
    EmptyEntityId,

    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    #[error("Deserialization failed")]
    DeserializationFailed,
}

// ============================================================================
// ENTITY TYPE
// ============================================================================

/// Closed set of syncable entity kinds
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityType {
    Note,
    Branch,
    Attribute,
    Revision,
    Attachment,
    Blob,
    Option,
    EtapiToken,
}

impl EntityType {
    /// Every entity type, in tag order
    pub const ALL: [EntityType; 8] = [
        EntityType::Note,
        EntityType::Branch,
        EntityType::Attribute,
        EntityType::Revision,
        EntityType::Attachment,
        EntityType::Blob,
        EntityType::Option,
        EntityType::EtapiToken,
    ];

    /// Storage name of the entity kind
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Note => "notes",
            EntityType::Branch => "branches",
            EntityType::Attribute => "attributes",
            EntityType::Revision => "revisions",
            EntityType::Attachment => "attachments",
            EntityType::Blob => "blobs",
            EntityType::Option => "options",
            EntityType::EtapiToken => "etapi_tokens",
        }
    }

    /// Stable one-byte tag used in storage keys
    pub fn tag(&self) -> u8 {
        match self {
            EntityType::Note => 1,
            EntityType::Branch => 2,
            EntityType::Attribute => 3,
            EntityType::Revision => 4,
            EntityType::Attachment => 5,
            EntityType::Blob => 6,
            EntityType::Option => 7,
            EntityType::EtapiToken => 8,
        }
    }

    /// Reverse of [`EntityType::tag`]
    pub fn from_tag(tag: u8) -> std::option::Option<Self> {
        Self::ALL.iter().copied().find(|t| t.tag() == tag)
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = ChangeError;

    /// Accepts both the storage name ("notes") and the singular form ("note")
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        Self::ALL
            .iter()
            .copied()
            .find(|t| {
                let name = t.as_str();
                lower == name
                    || name.strip_suffix('s') == Some(lower.as_str())
                    || (name == "branches" && lower == "branch")
            })
            .ok_or_else(|| ChangeError::UnknownEntityType(s.to_string()))
    }
}

// ============================================================================
// ENTITY KEY
// ============================================================================

/// Identity of one syncable entity: `(entityType, entityId)`
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    entity_type: EntityType,
    entity_id: String,
}

impl EntityKey {
    /// Create a key
    pub fn new(entity_type: EntityType, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type,
            entity_id: entity_id.into(),
        }
    }

    /// Get the entity type
    pub fn entity_type(&self) -> EntityType {
        self.entity_type
    }

    /// Get the entity id
    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    /// Sector this key belongs to.
    ///
    /// Low-order byte of a hash over the key, so membership never changes
    /// when the entity's content does.
    pub fn sector(&self) -> u8 {
        let mut hasher = Sha256::new();
        hasher.update(b"sector:");
        hasher.update([self.entity_type.tag()]);
        hasher.update(self.entity_id.as_bytes());
        let digest = hasher.finalize();
        digest[digest.len() - 1]
    }

    /// Encode as a storage key: tag, id bytes, terminator.
    ///
    /// The terminator keeps one key from being a prefix of another, so
    /// per-key prefix scans never pick up a neighbour.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.entity_id.len() + 2);
        bytes.push(self.entity_type.tag());
        bytes.extend_from_slice(self.entity_id.as_bytes());
        bytes.push(KEY_TERMINATOR);
        bytes
    }

    /// Decode a storage key produced by [`EntityKey::to_bytes`]
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ChangeError> {
        let (tag, rest) = bytes.split_first().ok_or(ChangeError::InvalidKey)?;
        let (terminator, id) = rest.split_last().ok_or(ChangeError::InvalidKey)?;
        if *terminator != KEY_TERMINATOR {
            return Err(ChangeError::InvalidKey);
        }
        let entity_type = EntityType::from_tag(*tag).ok_or(ChangeError::InvalidKey)?;
        let entity_id = std::str::from_utf8(id).map_err(|_| ChangeError::InvalidKey)?;
        Ok(Self::new(entity_type, entity_id))
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity_type, self.entity_id)
    }
}

// ============================================================================
// CONTENT HASH
// ============================================================================

/// Digest of an entity's serialized state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Fixed sentinel carried by every erased record
    pub const ERASED: ContentHash = ContentHash([0u8; 32]);

    /// Hash an entity payload
    pub fn of(payload: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"content:");
        hasher.update(payload);
        let result = hasher.finalize();
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&result);
        Self(bytes)
    }

    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Whether this is the erased sentinel
    pub fn is_erased_sentinel(&self) -> bool {
        *self == Self::ERASED
    }

    /// Full hex encoding
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

// ============================================================================
// INSTANCE ID
// ============================================================================

/// Identifies one replica of the database
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId(String);

impl InstanceId {
    /// Generate a random instance id (16 hex characters)
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    /// Wrap an existing id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for InstanceId {
    type Err = ChangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(ChangeError::EmptyEntityId);
        }
        Ok(Self(trimmed.to_string()))
    }
}

// ============================================================================
// CHANGE TIMESTAMP
// ============================================================================

/// Hybrid logical timestamp: wall clock milliseconds plus a logical counter.
///
/// Ordering is by wall time first, then the counter.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ChangeTimestamp {
    wall_ms: u64,
    logical: u32,
}

impl ChangeTimestamp {
    pub fn new(wall_ms: u64, logical: u32) -> Self {
        Self { wall_ms, logical }
    }

    /// Timestamp at a wall-clock instant with a zero counter
    pub fn from_millis(wall_ms: u64) -> Self {
        Self::new(wall_ms, 0)
    }

    pub fn wall_ms(&self) -> u64 {
        self.wall_ms
    }

    pub fn logical(&self) -> u32 {
        self.logical
    }

    /// Wall-clock part as a UTC datetime
    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        let millis = i64::try_from(self.wall_ms).ok()?;
        Utc.timestamp_millis_opt(millis).single()
    }
}

impl fmt::Display for ChangeTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_datetime() {
            Some(dt) => write!(f, "{}#{}", dt.to_rfc3339(), self.logical),
            None => write!(f, "{}ms#{}", self.wall_ms, self.logical),
        }
    }
}

// ============================================================================
// ENTITY CHANGE
// ============================================================================

/// One ledger record describing the state of an entity after a mutation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityChange {
    entity_type: EntityType,
    entity_id: String,
    sequence_id: u64,
    content_hash: ContentHash,
    is_erased: bool,
    utc_changed_at: ChangeTimestamp,
    origin_instance_id: InstanceId,
    sector: u8,
}

impl EntityChange {
    /// Create a change record. Erased records always carry the sentinel hash.
    pub fn new(
        key: &EntityKey,
        sequence_id: u64,
        content_hash: ContentHash,
        is_erased: bool,
        utc_changed_at: ChangeTimestamp,
        origin_instance_id: InstanceId,
    ) -> Self {
        let content_hash = if is_erased {
            ContentHash::ERASED
        } else {
            content_hash
        };

        Self {
            entity_type: key.entity_type(),
            entity_id: key.entity_id().to_string(),
            sequence_id,
            content_hash,
            is_erased,
            utc_changed_at,
            origin_instance_id,
            sector: key.sector(),
        }
    }

    /// Same version re-numbered into another ledger's sequence space
    pub fn with_sequence(mut self, sequence_id: u64) -> Self {
        self.sequence_id = sequence_id;
        self
    }

    pub fn entity_type(&self) -> EntityType {
        self.entity_type
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.entity_type, self.entity_id.clone())
    }

    pub fn sequence_id(&self) -> u64 {
        self.sequence_id
    }

    pub fn content_hash(&self) -> ContentHash {
        self.content_hash
    }

    pub fn is_erased(&self) -> bool {
        self.is_erased
    }

    pub fn utc_changed_at(&self) -> ChangeTimestamp {
        self.utc_changed_at
    }

    pub fn origin_instance_id(&self) -> &InstanceId {
        &self.origin_instance_id
    }

    /// Sector as recorded. Use [`EntityChange::has_consistent_sector`] to
    /// validate records that arrived over the wire.
    pub fn sector(&self) -> u8 {
        self.sector
    }

    /// Whether the recorded sector matches the one derived from the key
    pub fn has_consistent_sector(&self) -> bool {
        self.key().sector() == self.sector
    }

    /// Whether two records describe the same version, ignoring sequence numbers
    pub fn same_version(&self, other: &EntityChange) -> bool {
        self.entity_type == other.entity_type
            && self.entity_id == other.entity_id
            && self.content_hash == other.content_hash
            && self.is_erased == other.is_erased
            && self.utc_changed_at == other.utc_changed_at
            && self.origin_instance_id == other.origin_instance_id
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, ChangeError> {
        postcard::to_allocvec(self).map_err(|e| ChangeError::SerializationFailed(e.to_string()))
    }

    /// Deserialize from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ChangeError> {
        postcard::from_bytes(bytes).map_err(|_| ChangeError::DeserializationFailed)
    }
}
