// Entity Store - Built-in entity storage collaborator
//
// Payloads are opaque bytes keyed by (entityType, entityId). Every mutation
// goes through the ledger so the payload and its change record land in the
// same transaction.

use crate::ledger::{
    ChangeLedger, ChangeTimestamp, ContentHash, EntityChange, EntityKey, EntityType, LedgerError,
    Resolution,
};
use std::sync::Arc;
use tracing::{info, warn};

/// Entity storage backed by the ledger's `entities` tree
#[derive(Clone)]
pub struct EntityStore {
    ledger: Arc<ChangeLedger>,
}

impl EntityStore {
    pub fn new(ledger: Arc<ChangeLedger>) -> Self {
        Self { ledger }
    }

    pub fn ledger(&self) -> &Arc<ChangeLedger> {
        &self.ledger
    }

    // ========================================================================
    // LOCAL MUTATIONS
    // ========================================================================

    /// Create or update an entity
    pub fn put(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        payload: &[u8],
    ) -> Result<EntityChange, LedgerError> {
        let key = EntityKey::new(entity_type, entity_id);
        self.ledger.record_mutation(&key, Some(payload), None)
    }

    /// Create or update an entity with an explicit change time
    pub fn put_at(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        payload: &[u8],
        changed_at: ChangeTimestamp,
    ) -> Result<EntityChange, LedgerError> {
        let key = EntityKey::new(entity_type, entity_id);
        self.ledger.record_mutation(&key, Some(payload), Some(changed_at))
    }

    /// Erase an entity, leaving a tombstone in the ledger
    pub fn erase(&self, entity_type: EntityType, entity_id: &str) -> Result<EntityChange, LedgerError> {
        let key = EntityKey::new(entity_type, entity_id);
        self.ledger.record_mutation(&key, None, None)
    }

    /// Erase an entity with an explicit change time
    pub fn erase_at(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        changed_at: ChangeTimestamp,
    ) -> Result<EntityChange, LedgerError> {
        let key = EntityKey::new(entity_type, entity_id);
        self.ledger.record_mutation(&key, None, Some(changed_at))
    }

    // ========================================================================
    // READS
    // ========================================================================

    /// Current payload of an entity, `None` if absent or erased
    pub fn get_current_state(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Option<Vec<u8>>, LedgerError> {
        self.ledger
            .entity_payload(&EntityKey::new(entity_type, entity_id))
    }

    pub fn contains(&self, entity_type: EntityType, entity_id: &str) -> Result<bool, LedgerError> {
        Ok(self.get_current_state(entity_type, entity_id)?.is_some())
    }

    pub fn entity_count(&self) -> usize {
        self.ledger.entity_count()
    }

    /// Payload matching a record exactly.
    ///
    /// `None` for erased records and whenever the stored payload no longer
    /// hashes to the record's content hash (a newer local write replaced it).
    pub fn payload_for(&self, change: &EntityChange) -> Result<Option<Vec<u8>>, LedgerError> {
        if change.is_erased() {
            return Ok(None);
        }
        let payload = self.ledger.entity_payload(&change.key())?;
        Ok(payload.filter(|bytes| ContentHash::of(bytes) == change.content_hash()))
    }

    // ========================================================================
    // REMOTE APPLY
    // ========================================================================

    /// Apply a remote version through the conflict resolver.
    ///
    /// Replaying the same record is a no-op once it has been adopted.
    pub fn apply_state(
        &self,
        change: &EntityChange,
        payload: Option<&[u8]>,
    ) -> Result<Resolution, LedgerError> {
        self.ledger.merge_remote(change, payload)
    }

    /// Apply a remote version whose payload the sender keeps outside its
    /// entity store. An adopted version is held as a record only, and the
    /// key reads as absent here.
    pub fn apply_external_state(&self, change: &EntityChange) -> Result<Resolution, LedgerError> {
        self.ledger.merge_remote_external(change)
    }

    // ========================================================================
    // REPAIR
    // ========================================================================

    /// Bring the ledger in line with entity storage.
    ///
    /// Records a change for every stored entity whose current record is
    /// missing, erased or carries another hash, and a tombstone for every
    /// live record whose payload is gone. Externally owned keys have no
    /// payload here and are left alone. Returns the number of records
    /// written.
    pub fn fill_entity_changes(&self) -> Result<usize, LedgerError> {
        let mut written = 0;

        let stored: Vec<(EntityKey, Vec<u8>)> = self.ledger.entities().collect::<Result<_, _>>()?;
        for (key, payload) in &stored {
            let hash = ContentHash::of(payload);
            let current = self.ledger.latest_for_key(key)?;
            let in_sync = current
                .map(|c| !c.is_erased() && c.content_hash() == hash)
                .unwrap_or(false);
            if !in_sync {
                self.ledger.record_mutation(key, Some(payload), None)?;
                written += 1;
            }
        }

        let orphaned: Vec<EntityKey> = self
            .ledger
            .current_view()
            .filter_map(|entry| match entry {
                Ok(change) if change.is_erased() => None,
                Ok(change) => Some(Ok(change.key())),
                Err(e) => Some(Err(e)),
            })
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .filter(|key| !stored.iter().any(|(k, _)| k == key))
            .collect();

        for key in &orphaned {
            if self.ledger.is_external(key)? {
                continue;
            }
            warn!(key = %key, "ledger record has no payload, recording tombstone");
            self.ledger.record_mutation(key, None, None)?;
            written += 1;
        }

        if written > 0 {
            info!(written, "filled entity changes");
        }
        Ok(written)
    }
}
