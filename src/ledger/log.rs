// Change Ledger - Durable, append-only log of entity mutations
//
// Layout (one sled tree each):
// - changes:   sequence id (BE u64)        -> EntityChange
// - latest:    entity key                  -> current EntityChange for the key
// - history:   entity key ++ sequence id   -> ()
// - by_sector: sector ++ sequence id       -> ()
// - entities:  entity key                  -> opaque payload
//
// Every write touches these trees in one sled transaction, so a reader never
// sees an entity's new payload without its change record or the reverse.
// Sequence allocation is serialized by a single lock that is held across the
// transaction, which also makes commit order equal sequence order.

use crate::ledger::change::{
    ChangeError, ChangeTimestamp, ContentHash, EntityChange, EntityKey, EntityType, InstanceId,
};
use crate::ledger::clock::HybridClock;
use crate::ledger::conflict::{ConflictResolver, Resolution};
use crate::sector::SectorIndex;
use crate::storage::{trees, NoteStore, StoreError};
use sled::transaction::{TransactionError, TransactionResult, Transactional};
use sled::Tree;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::debug;

const EMPTY: &[u8] = &[];

/// Errors from ledger operations
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Transaction failed: {0}")]
    Transaction(String),

    #[error("Corrupt ledger record at sequence {0}")]
    CorruptRecord(u64),

    #[error("Corrupt ledger key: {0}")]
    CorruptKey(#[from] ChangeError),

    #[error("Failed to encode record: {0}")]
    Encoding(ChangeError),

    #[error("No payload available to adopt {0}")]
    MissingPayload(EntityKey),
}

impl From<sled::Error> for LedgerError {
    fn from(err: sled::Error) -> Self {
        LedgerError::Storage(StoreError::from(err))
    }
}

fn transaction_error(err: TransactionError<()>) -> LedgerError {
    match err {
        TransactionError::Abort(()) => LedgerError::Transaction("aborted".to_string()),
        TransactionError::Storage(e) => LedgerError::from(e),
    }
}

fn decode_sequence(bytes: &[u8]) -> Result<u64, LedgerError> {
    let array: [u8; 8] = bytes
        .try_into()
        .map_err(|_| LedgerError::CorruptKey(ChangeError::InvalidKey))?;
    Ok(u64::from_be_bytes(array))
}

fn decode_change(sequence_id: u64, bytes: &[u8]) -> Result<EntityChange, LedgerError> {
    EntityChange::from_bytes(bytes).map_err(|_| LedgerError::CorruptRecord(sequence_id))
}

// ============================================================================
// SEQUENCE ALLOCATION
// ============================================================================

/// Single exclusion point for sequence numbers.
///
/// A writer locks, reads the candidate with [`SequenceGuard::peek`], performs
/// its durable write and only then calls [`SequenceGuard::advance`]. A failed
/// write never consumes a number, so the sequence stays gapless.
#[derive(Debug)]
pub struct SequenceAllocator {
    next: Mutex<u64>,
}

/// Exclusive access to the next sequence number
pub struct SequenceGuard<'a> {
    next: MutexGuard<'a, u64>,
}

impl SequenceAllocator {
    /// Allocator whose first number is `next`
    pub fn starting_at(next: u64) -> Self {
        Self {
            next: Mutex::new(next.max(1)),
        }
    }

    /// Acquire the allocator
    pub fn lock(&self) -> SequenceGuard<'_> {
        SequenceGuard {
            next: self.next.lock().unwrap_or_else(|e| e.into_inner()),
        }
    }

    /// Next number that will be handed out
    pub fn peek(&self) -> u64 {
        *self.next.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl SequenceGuard<'_> {
    pub fn peek(&self) -> u64 {
        *self.next
    }

    /// Consume the current number after it has been durably written
    pub fn advance(&mut self) -> u64 {
        let used = *self.next;
        *self.next += 1;
        used
    }
}

// ============================================================================
// CHANGE CURSOR
// ============================================================================

/// Lazy, finite, restartable walk over the ledger in sequence order.
///
/// The restart token is [`ChangeCursor::position`]: the sequence id of the
/// last record returned.
pub struct ChangeCursor {
    changes: Tree,
    sector: Option<u8>,
    iter: sled::Iter,
    position: u64,
    remaining: usize,
}

impl ChangeCursor {
    fn new(changes: Tree, by_sector: &Tree, sector: Option<u8>, since: u64, limit: usize) -> Self {
        let start = since.saturating_add(1).to_be_bytes();
        let iter = match sector {
            None => changes.range(start.to_vec()..),
            Some(sector) => {
                let mut from = vec![sector];
                from.extend_from_slice(&start);
                by_sector.range(from..)
            }
        };

        Self {
            changes,
            sector,
            iter,
            position: since,
            remaining: limit,
        }
    }

    /// Sequence id of the last record returned (or the starting point)
    pub fn position(&self) -> u64 {
        self.position
    }

    fn next_record(&mut self) -> Option<Result<EntityChange, LedgerError>> {
        let (key, value) = match self.iter.next()? {
            Ok(kv) => kv,
            Err(e) => return Some(Err(e.into())),
        };

        let change = match self.sector {
            None => decode_sequence(&key).and_then(|seq| decode_change(seq, &value)),
            Some(sector) => {
                if key.first() != Some(&sector) {
                    self.remaining = 0;
                    return None;
                }
                decode_sequence(&key[1..]).and_then(|seq| {
                    match self.changes.get(seq.to_be_bytes()) {
                        Ok(Some(bytes)) => decode_change(seq, &bytes),
                        Ok(None) => Err(LedgerError::CorruptRecord(seq)),
                        Err(e) => Err(e.into()),
                    }
                })
            }
        };

        Some(change)
    }
}

impl Iterator for ChangeCursor {
    type Item = Result<EntityChange, LedgerError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }

        let item = self.next_record()?;
        if let Ok(change) = &item {
            self.position = change.sequence_id();
        }
        self.remaining -= 1;
        Some(item)
    }
}

// ============================================================================
// CHANGE LEDGER
// ============================================================================

#[derive(Clone, Copy)]
enum EntityWrite<'a> {
    Untouched,
    Put(&'a [u8]),
    Remove,
    /// Payload lives in an external store; drop any local copy
    External,
}

/// The change ledger of one instance
pub struct ChangeLedger {
    instance_id: InstanceId,
    changes: Tree,
    latest: Tree,
    history: Tree,
    by_sector: Tree,
    entities: Tree,
    external: Tree,
    allocator: SequenceAllocator,
    clock: HybridClock,
    resolver: ConflictResolver,
    index: Arc<SectorIndex>,
}

impl ChangeLedger {
    /// Open the ledger trees of a store.
    ///
    /// Recovers the next sequence number as `max(existing) + 1`, advances the
    /// clock past every current record and rebuilds the sector index.
    pub fn open(
        store: &NoteStore,
        instance_id: InstanceId,
        index: Arc<SectorIndex>,
    ) -> Result<Self, LedgerError> {
        let changes = store.tree(trees::CHANGES)?;
        let next = match changes.last()? {
            Some((key, _)) => decode_sequence(&key)? + 1,
            None => 1,
        };

        let ledger = Self {
            instance_id,
            changes,
            latest: store.tree(trees::LATEST)?,
            history: store.tree(trees::HISTORY)?,
            by_sector: store.tree(trees::BY_SECTOR)?,
            entities: store.tree(trees::ENTITIES)?,
            external: store.tree(trees::EXTERNAL)?,
            allocator: SequenceAllocator::starting_at(next),
            clock: HybridClock::new(),
            resolver: ConflictResolver::new(),
            index,
        };

        for change in ledger.current_view() {
            ledger.clock.observe(change?.utc_changed_at());
        }
        ledger.rebuild_index()?;

        debug!(
            instance = %ledger.instance_id,
            next_sequence = next,
            keys = ledger.key_count(),
            "ledger opened"
        );
        Ok(ledger)
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    pub fn clock(&self) -> &HybridClock {
        &self.clock
    }

    pub fn index(&self) -> &Arc<SectorIndex> {
        &self.index
    }

    /// Number of records in the log (history included)
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Number of keys with a current record
    pub fn key_count(&self) -> usize {
        self.latest.len()
    }

    /// Highest sequence id written so far (0 for an empty ledger)
    pub fn head_sequence(&self) -> u64 {
        self.allocator.peek() - 1
    }

    // ========================================================================
    // RECORDING
    // ========================================================================

    /// Record a mutation made by an external entity store.
    ///
    /// Only the ledger is written; the caller owns the entity payload. The key
    /// is marked as externally owned, so any payload held here is dropped and
    /// `fill_entity_changes` leaves the record alone. Peers adopt such a
    /// record without content.
    pub fn record(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        new_hash: ContentHash,
        is_erased: bool,
    ) -> Result<EntityChange, LedgerError> {
        let key = EntityKey::new(entity_type, entity_id);
        self.record_local(&key, new_hash, is_erased, EntityWrite::External, None)
    }

    /// Record with an explicit timestamp (for importing)
    pub fn record_with_timestamp(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        new_hash: ContentHash,
        is_erased: bool,
        changed_at: ChangeTimestamp,
    ) -> Result<EntityChange, LedgerError> {
        let key = EntityKey::new(entity_type, entity_id);
        self.record_local(&key, new_hash, is_erased, EntityWrite::External, Some(changed_at))
    }

    /// Write an entity payload (or erase it) together with its change record
    pub(crate) fn record_mutation(
        &self,
        key: &EntityKey,
        payload: Option<&[u8]>,
        changed_at: Option<ChangeTimestamp>,
    ) -> Result<EntityChange, LedgerError> {
        match payload {
            Some(payload) => self.record_local(
                key,
                ContentHash::of(payload),
                false,
                EntityWrite::Put(payload),
                changed_at,
            ),
            None => self.record_local(
                key,
                ContentHash::ERASED,
                true,
                EntityWrite::Remove,
                changed_at,
            ),
        }
    }

    fn record_local(
        &self,
        key: &EntityKey,
        hash: ContentHash,
        is_erased: bool,
        entity: EntityWrite<'_>,
        changed_at: Option<ChangeTimestamp>,
    ) -> Result<EntityChange, LedgerError> {
        let mut seq = self.allocator.lock();

        let changed_at = match changed_at {
            Some(at) => {
                self.clock.observe(at);
                at
            }
            None => self.clock.now(),
        };

        let previous = self.latest_for_key(key)?;
        let change = EntityChange::new(
            key,
            seq.peek(),
            hash,
            is_erased,
            changed_at,
            self.instance_id.clone(),
        );

        self.write(&change, entity, true)?;
        seq.advance();
        self.index.update(previous.as_ref(), &change);

        debug!(
            key = %key,
            sequence = change.sequence_id(),
            erased = is_erased,
            "recorded local change"
        );
        Ok(change)
    }

    /// Resolve a remote version against the current one and apply the outcome.
    ///
    /// Adopted versions become current and their payload is written with
    /// them; losing versions are appended once as history. The check and the
    /// write happen under the sequence lock so no local write can interleave.
    /// Adopting a live version without a payload fails with `MissingPayload`.
    pub(crate) fn merge_remote(
        &self,
        remote: &EntityChange,
        payload: Option<&[u8]>,
    ) -> Result<Resolution, LedgerError> {
        self.merge(remote, payload.map(EntityWrite::Put))
    }

    /// Merge a remote version whose payload is owned outside the sender's
    /// entity store. If adopted, only the record is kept and the key is
    /// marked as externally owned here too.
    pub(crate) fn merge_remote_external(
        &self,
        remote: &EntityChange,
    ) -> Result<Resolution, LedgerError> {
        self.merge(remote, Some(EntityWrite::External))
    }

    fn merge(
        &self,
        remote: &EntityChange,
        adopt: Option<EntityWrite<'_>>,
    ) -> Result<Resolution, LedgerError> {
        let key = remote.key();
        let mut seq = self.allocator.lock();

        let local = self.latest_for_key(&key)?;
        let resolution = self.resolver.resolve(local.as_ref(), remote);

        match resolution {
            Resolution::NoOp => {}
            Resolution::KeepLocal => {
                if !self.has_version(&key, remote)? {
                    let record = remote.clone().with_sequence(seq.peek());
                    self.write(&record, EntityWrite::Untouched, false)?;
                    seq.advance();
                }
            }
            Resolution::AdoptRemote => {
                let entity = if remote.is_erased() {
                    EntityWrite::Remove
                } else {
                    match adopt {
                        Some(entity) => entity,
                        None => return Err(LedgerError::MissingPayload(key)),
                    }
                };

                let record = remote.clone().with_sequence(seq.peek());
                self.write(&record, entity, true)?;
                seq.advance();
                self.index.update(local.as_ref(), &record);
            }
        }

        self.clock.observe(remote.utc_changed_at());

        debug!(
            key = %key,
            origin = %remote.origin_instance_id(),
            resolution = ?resolution,
            "merged remote change"
        );
        Ok(resolution)
    }

    fn write(
        &self,
        change: &EntityChange,
        entity: EntityWrite<'_>,
        make_current: bool,
    ) -> Result<(), LedgerError> {
        let key_bytes = change.key().to_bytes();
        let seq_key = change.sequence_id().to_be_bytes();
        let encoded = change.to_bytes().map_err(LedgerError::Encoding)?;

        let mut history_key = key_bytes.clone();
        history_key.extend_from_slice(&seq_key);
        let mut sector_key = vec![change.sector()];
        sector_key.extend_from_slice(&seq_key);

        let result: TransactionResult<()> = (
            &self.changes,
            &self.latest,
            &self.history,
            &self.by_sector,
            &self.entities,
            &self.external,
        )
            .transaction(|(changes, latest, history, by_sector, entities, external)| {
                changes.insert(&seq_key[..], encoded.as_slice())?;
                history.insert(history_key.as_slice(), EMPTY)?;
                by_sector.insert(sector_key.as_slice(), EMPTY)?;
                if make_current {
                    latest.insert(key_bytes.as_slice(), encoded.as_slice())?;
                }
                match entity {
                    EntityWrite::Untouched => {}
                    EntityWrite::Put(payload) => {
                        entities.insert(key_bytes.as_slice(), payload)?;
                        external.remove(key_bytes.as_slice())?;
                    }
                    EntityWrite::Remove => {
                        entities.remove(key_bytes.as_slice())?;
                        external.remove(key_bytes.as_slice())?;
                    }
                    EntityWrite::External => {
                        entities.remove(key_bytes.as_slice())?;
                        external.insert(key_bytes.as_slice(), EMPTY)?;
                    }
                }
                Ok(())
            });

        result.map_err(transaction_error)
    }

    // ========================================================================
    // READING
    // ========================================================================

    /// Current record for a key
    pub fn latest_for(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Option<EntityChange>, LedgerError> {
        self.latest_for_key(&EntityKey::new(entity_type, entity_id))
    }

    pub fn latest_for_key(&self, key: &EntityKey) -> Result<Option<EntityChange>, LedgerError> {
        match self.latest.get(key.to_bytes())? {
            Some(bytes) => {
                let change = EntityChange::from_bytes(&bytes)?;
                Ok(Some(change))
            }
            None => Ok(None),
        }
    }

    /// Records after `since`, ascending, at most `limit`
    pub fn changes_since(&self, since: u64, limit: usize) -> ChangeCursor {
        ChangeCursor::new(self.changes.clone(), &self.by_sector, None, since, limit)
    }

    /// Records of one sector after `since`, ascending, at most `limit`
    pub fn sector_changes_since(&self, sector: u8, since: u64, limit: usize) -> ChangeCursor {
        ChangeCursor::new(self.changes.clone(), &self.by_sector, Some(sector), since, limit)
    }

    /// Collect one page of records, optionally restricted to a sector
    pub fn page(
        &self,
        since: u64,
        sector: Option<u8>,
        limit: usize,
    ) -> Result<Vec<EntityChange>, LedgerError> {
        ChangeCursor::new(self.changes.clone(), &self.by_sector, sector, since, limit).collect()
    }

    /// Every record ever written for a key, oldest first
    pub fn history(&self, key: &EntityKey) -> Result<Vec<EntityChange>, LedgerError> {
        let prefix = key.to_bytes();
        let mut records = Vec::new();

        for entry in self.history.scan_prefix(&prefix) {
            let (history_key, _) = entry?;
            let seq = decode_sequence(&history_key[prefix.len()..])?;
            let bytes = self
                .changes
                .get(seq.to_be_bytes())?
                .ok_or(LedgerError::CorruptRecord(seq))?;
            records.push(decode_change(seq, &bytes)?);
        }

        Ok(records)
    }

    fn has_version(&self, key: &EntityKey, version: &EntityChange) -> Result<bool, LedgerError> {
        Ok(self.history(key)?.iter().any(|r| r.same_version(version)))
    }

    /// Current record of every key, in key order
    pub fn current_view(&self) -> impl Iterator<Item = Result<EntityChange, LedgerError>> + '_ {
        self.latest.iter().values().map(|entry| -> Result<EntityChange, LedgerError> {
            let bytes = entry?;
            Ok(EntityChange::from_bytes(&bytes)?)
        })
    }

    /// Payload currently held in entity storage
    pub fn entity_payload(&self, key: &EntityKey) -> Result<Option<Vec<u8>>, LedgerError> {
        Ok(self.entities.get(key.to_bytes())?.map(|v| v.to_vec()))
    }

    /// Every stored entity with its payload
    pub fn entities(&self) -> impl Iterator<Item = Result<(EntityKey, Vec<u8>), LedgerError>> + '_ {
        self.entities.iter().map(|entry| -> Result<(EntityKey, Vec<u8>), LedgerError> {
            let (key, value) = entry?;
            Ok((EntityKey::from_bytes(&key)?, value.to_vec()))
        })
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    /// Whether the key's payload is owned by an external store
    pub fn is_external(&self, key: &EntityKey) -> Result<bool, LedgerError> {
        Ok(self.external.contains_key(key.to_bytes())?)
    }

    // ========================================================================
    // INTEGRITY
    // ========================================================================

    /// Keys whose current record does not match the log entry it claims to be
    pub fn verify_pointers(&self) -> Result<Vec<EntityKey>, LedgerError> {
        let mut broken = Vec::new();

        for entry in self.latest.iter() {
            let (key_bytes, value) = entry?;
            let key = EntityKey::from_bytes(&key_bytes)?;
            let current = match EntityChange::from_bytes(&value) {
                Ok(change) => change,
                Err(_) => {
                    broken.push(key);
                    continue;
                }
            };

            let logged = self.changes.get(current.sequence_id().to_be_bytes())?;
            let consistent = current.key() == key
                && logged.map(|bytes| bytes.as_ref() == value.as_ref()) == Some(true);
            if !consistent {
                broken.push(key);
            }
        }

        Ok(broken)
    }

    /// Recompute every sector digest from the current view.
    ///
    /// Holds the sequence lock so no write lands between scan and swap.
    pub fn rebuild_index(&self) -> Result<(), LedgerError> {
        let _seq = self.allocator.lock();
        self.index.full_rebuild(self)
    }
}
