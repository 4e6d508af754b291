// Apply - Runs received change records through the conflict resolver
//
// Each record is validated and applied on its own. A record that cannot be
// applied is reported as skipped and the batch carries on; only a storage
// failure stops the batch.

use crate::ledger::{ContentHash, EntityChange, EntityKey, LedgerError, Resolution};
use crate::storage::EntityStore;
use crate::sync::protocol::ChangeRecord;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::warn;

/// Why a single change could not be applied
#[derive(Error, Debug)]
pub enum ApplyError {
    #[error("Recorded sector does not match key {0}")]
    SectorMismatch(EntityKey),

    #[error("Erased record for {0} carries a content hash")]
    ErasedWithContent(EntityKey),

    #[error("Payload for {0} does not match its content hash")]
    HashMismatch(EntityKey),

    #[error("No payload available to adopt {0}")]
    MissingPayload(EntityKey),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

/// A change that was reported instead of applied
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedChange {
    key: EntityKey,
    sequence_id: u64,
    reason: String,
}

impl SkippedChange {
    pub fn new(change: &EntityChange, reason: impl Into<String>) -> Self {
        Self {
            key: change.key(),
            sequence_id: change.sequence_id(),
            reason: reason.into(),
        }
    }

    pub fn key(&self) -> &EntityKey {
        &self.key
    }

    /// Sequence id in the sender's ledger
    pub fn sequence_id(&self) -> u64 {
        self.sequence_id
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

impl fmt::Display for SkippedChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}: {}", self.key, self.sequence_id, self.reason)
    }
}

/// Outcome of applying one batch
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BatchApplyReport {
    pub adopted: usize,
    pub kept_local: usize,
    pub unchanged: usize,
    pub skipped: Vec<SkippedChange>,
    /// Highest sender sequence id seen in the batch
    pub highest_sequence: u64,
}

impl BatchApplyReport {
    pub fn total(&self) -> usize {
        self.adopted + self.kept_local + self.unchanged + self.skipped.len()
    }
}

fn validate(record: &ChangeRecord) -> Result<(), ApplyError> {
    let change = record.change();
    if !change.has_consistent_sector() {
        return Err(ApplyError::SectorMismatch(change.key()));
    }
    if change.is_erased() && change.content_hash() != ContentHash::ERASED {
        return Err(ApplyError::ErasedWithContent(change.key()));
    }
    if let Some(payload) = record.payload() {
        if change.is_erased() || ContentHash::of(payload) != change.content_hash() {
            return Err(ApplyError::HashMismatch(change.key()));
        }
    }
    Ok(())
}

/// Validate and apply one record.
///
/// A current live record sent without a payload belongs to the sender's
/// external store and is adopted as a record only.
pub fn apply_record(entities: &EntityStore, record: &ChangeRecord) -> Result<Resolution, ApplyError> {
    validate(record)?;
    let change = record.change();
    let applied = match record.payload() {
        None if !record.is_superseded() => entities.apply_external_state(change),
        payload => entities.apply_state(change, payload),
    };
    applied.map_err(|e| match e {
        LedgerError::MissingPayload(key) => ApplyError::MissingPayload(key),
        other => ApplyError::Ledger(other),
    })
}

/// Apply a batch in order.
///
/// A superseded record without a payload cannot be adopted on its own, but
/// the sender's newer record for the key follows in the same stream, so it
/// counts as unchanged rather than skipped.
pub fn apply_batch(
    entities: &EntityStore,
    records: &[ChangeRecord],
) -> Result<BatchApplyReport, LedgerError> {
    let mut report = BatchApplyReport::default();

    for record in records {
        let change = record.change();
        report.highest_sequence = report.highest_sequence.max(change.sequence_id());

        match apply_record(entities, record) {
            Ok(Resolution::AdoptRemote) => report.adopted += 1,
            Ok(Resolution::KeepLocal) => report.kept_local += 1,
            Ok(Resolution::NoOp) => report.unchanged += 1,
            Err(ApplyError::MissingPayload(_)) if record.is_superseded() => report.unchanged += 1,
            Err(ApplyError::Ledger(e)) => return Err(e),
            Err(e) => {
                warn!(
                    key = %change.key(),
                    sequence = change.sequence_id(),
                    origin = %change.origin_instance_id(),
                    error = %e,
                    "skipping change"
                );
                report.skipped.push(SkippedChange::new(change, e.to_string()));
            }
        }
    }

    Ok(report)
}
