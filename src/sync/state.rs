// Sync State Store - Per-peer cursor bookkeeping
//
// Cursors live in the `peers` tree keyed by the handle a peer is known
// under. Every update is a read-modify-compare-and-swap loop, so two
// writers for the same peer serialize on the key and never lose an advance.
//
// Cursor spaces:
// - pushed: sequence ids of this instance's ledger
// - pulled: sequence ids of the peer's ledger

use crate::ledger::InstanceId;
use crate::storage::{trees, NoteStore, StoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sled::Tree;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors from sync state operations
#[derive(Error, Debug)]
pub enum StateError {
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Peer {peer} presented instance {presented}, expected {expected}")]
    IdentityMismatch {
        peer: String,
        expected: InstanceId,
        presented: InstanceId,
    },

    #[error("Refusing to move {cursor} cursor of {peer} backward ({current} -> {requested})")]
    CursorRegression {
        peer: String,
        cursor: &'static str,
        current: u64,
        requested: u64,
    },

    #[error("No sync state for peer {0}")]
    UnknownPeer(String),

    #[error("Corrupt sync state for peer {0}")]
    CorruptState(String),
}

impl From<sled::Error> for StateError {
    fn from(err: sled::Error) -> Self {
        StateError::Storage(StoreError::from(err))
    }
}

// ============================================================================
// PEER SYNC STATE
// ============================================================================

/// Progress inside one divergent sector, kept until the session commits
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectorCursor {
    pushed: u64,
    pulled: u64,
}

impl SectorCursor {
    pub fn pushed(&self) -> u64 {
        self.pushed
    }

    pub fn pulled(&self) -> u64 {
        self.pulled
    }
}

/// Everything this instance remembers about one peer
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSyncState {
    peer: String,
    peer_instance_id: Option<InstanceId>,
    last_pushed_sequence: u64,
    last_pulled_sequence: u64,
    last_full_sync_at: Option<DateTime<Utc>>,
    full_sync_pending: bool,
    sector_cursors: BTreeMap<u8, SectorCursor>,
    queued_sectors: BTreeSet<u8>,
}

impl PeerSyncState {
    /// Fresh state: no cursors, a full stream pending
    pub fn new(peer: &str) -> Self {
        Self {
            peer: peer.to_string(),
            peer_instance_id: None,
            last_pushed_sequence: 0,
            last_pulled_sequence: 0,
            last_full_sync_at: None,
            full_sync_pending: true,
            sector_cursors: BTreeMap::new(),
            queued_sectors: BTreeSet::new(),
        }
    }

    /// Handle the peer is known under
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Instance id pinned at the first successful handshake
    pub fn peer_instance_id(&self) -> Option<&InstanceId> {
        self.peer_instance_id.as_ref()
    }

    /// Highest local sequence id the peer is known to hold
    pub fn last_pushed_sequence(&self) -> u64 {
        self.last_pushed_sequence
    }

    /// Highest peer sequence id fully applied here
    pub fn last_pulled_sequence(&self) -> u64 {
        self.last_pulled_sequence
    }

    pub fn last_full_sync_at(&self) -> Option<DateTime<Utc>> {
        self.last_full_sync_at
    }

    /// Whether the next session must stream everything
    pub fn full_sync_pending(&self) -> bool {
        self.full_sync_pending
    }

    pub fn sector_cursor(&self, sector: u8) -> Option<SectorCursor> {
        self.sector_cursors.get(&sector).copied()
    }

    pub fn queued_sectors(&self) -> impl Iterator<Item = u8> + '_ {
        self.queued_sectors.iter().copied()
    }

    pub fn is_queued(&self, sector: u8) -> bool {
        self.queued_sectors.contains(&sector)
    }

    /// Where pulling a sector resumes
    pub fn pull_since(&self, sector: u8) -> u64 {
        if self.is_queued(sector) {
            return 0;
        }
        let local = self.sector_cursor(sector).map(|c| c.pulled).unwrap_or(0);
        self.last_pulled_sequence.max(local)
    }

    /// Where pushing a sector resumes
    pub fn push_since(&self, sector: u8) -> u64 {
        if self.is_queued(sector) {
            return 0;
        }
        let local = self.sector_cursor(sector).map(|c| c.pushed).unwrap_or(0);
        self.last_pushed_sequence.max(local)
    }

    fn check_advance(
        &self,
        cursor: &'static str,
        current: u64,
        requested: u64,
    ) -> Result<(), StateError> {
        if requested < current {
            return Err(StateError::CursorRegression {
                peer: self.peer.clone(),
                cursor,
                current,
                requested,
            });
        }
        Ok(())
    }

    fn clear_cursors(&mut self) {
        self.last_pushed_sequence = 0;
        self.last_pulled_sequence = 0;
        self.sector_cursors.clear();
        self.full_sync_pending = true;
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, StoreError> {
        postcard::to_allocvec(self).map_err(|e| StoreError::SerializationFailed(e.to_string()))
    }

    /// Deserialize from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StoreError> {
        postcard::from_bytes(bytes).map_err(|e| StoreError::DeserializationFailed(e.to_string()))
    }
}

// ============================================================================
// SYNC STATE STORE
// ============================================================================

/// Durable store of [`PeerSyncState`] records
#[derive(Clone)]
pub struct SyncStateStore {
    peers: Tree,
}

impl SyncStateStore {
    pub fn open(store: &NoteStore) -> Result<Self, StoreError> {
        Ok(Self {
            peers: store.tree(trees::PEERS)?,
        })
    }

    /// State for a peer, if any session ever started with it
    pub fn get(&self, peer: &str) -> Result<Option<PeerSyncState>, StateError> {
        match self.peers.get(peer.as_bytes())? {
            Some(bytes) => Ok(Some(self.decode(peer, &bytes)?)),
            None => Ok(None),
        }
    }

    /// Every known peer, ordered by handle
    pub fn all(&self) -> Result<Vec<PeerSyncState>, StateError> {
        let mut states = Vec::new();
        for entry in self.peers.iter() {
            let (key, value) = entry?;
            let peer = String::from_utf8_lossy(&key).into_owned();
            states.push(self.decode(&peer, &value)?);
        }
        Ok(states)
    }

    fn decode(&self, peer: &str, bytes: &[u8]) -> Result<PeerSyncState, StateError> {
        PeerSyncState::from_bytes(bytes).map_err(|_| StateError::CorruptState(peer.to_string()))
    }

    /// Read-modify-write with compare-and-swap retry.
    ///
    /// `create` decides whether a missing state is started fresh or
    /// reported as [`StateError::UnknownPeer`].
    fn update<F>(&self, peer: &str, create: bool, mut apply: F) -> Result<PeerSyncState, StateError>
    where
        F: FnMut(&mut PeerSyncState) -> Result<(), StateError>,
    {
        loop {
            let current = self.peers.get(peer.as_bytes())?;
            let mut state = match &current {
                Some(bytes) => self.decode(peer, bytes)?,
                None if create => PeerSyncState::new(peer),
                None => return Err(StateError::UnknownPeer(peer.to_string())),
            };

            apply(&mut state)?;
            let encoded = state.to_bytes()?;

            match self
                .peers
                .compare_and_swap(peer.as_bytes(), current, Some(encoded))?
            {
                Ok(()) => return Ok(state),
                Err(_) => {
                    debug!(peer, "sync state changed concurrently, retrying update");
                    continue;
                }
            }
        }
    }

    /// Pin the peer's instance id, creating its state on first contact.
    ///
    /// A peer that once presented one id and now presents another is
    /// rejected until [`SyncStateStore::force_full_sync`] clears the pin.
    pub fn pin(&self, peer: &str, presented: &InstanceId) -> Result<PeerSyncState, StateError> {
        self.update(peer, true, |state| match &state.peer_instance_id {
            Some(expected) if expected != presented => Err(StateError::IdentityMismatch {
                peer: peer.to_string(),
                expected: expected.clone(),
                presented: presented.clone(),
            }),
            Some(_) => Ok(()),
            None => {
                state.peer_instance_id = Some(presented.clone());
                Ok(())
            }
        })
    }

    /// Advance the global cursors. Moving either one backward is an error.
    pub fn advance(
        &self,
        peer: &str,
        pushed: Option<u64>,
        pulled: Option<u64>,
    ) -> Result<PeerSyncState, StateError> {
        self.update(peer, false, |state| {
            if let Some(pushed) = pushed {
                state.check_advance("pushed", state.last_pushed_sequence, pushed)?;
            }
            if let Some(pulled) = pulled {
                state.check_advance("pulled", state.last_pulled_sequence, pulled)?;
            }
            if let Some(pushed) = pushed {
                state.last_pushed_sequence = pushed;
            }
            if let Some(pulled) = pulled {
                state.last_pulled_sequence = pulled;
            }
            Ok(())
        })
    }

    /// Record progress inside one sector. Lower values than the stored
    /// ones are ignored, so re-streaming a sector from zero is harmless.
    pub fn advance_sector(
        &self,
        peer: &str,
        sector: u8,
        pushed: Option<u64>,
        pulled: Option<u64>,
    ) -> Result<PeerSyncState, StateError> {
        self.update(peer, false, |state| {
            let cursor = state.sector_cursors.entry(sector).or_default();
            if let Some(pushed) = pushed {
                cursor.pushed = cursor.pushed.max(pushed);
            }
            if let Some(pulled) = pulled {
                cursor.pulled = cursor.pulled.max(pulled);
            }
            Ok(())
        })
    }

    /// Close a successful session: fold the committed heads into the global
    /// cursors, drop per-sector progress and queued sectors.
    pub fn commit(&self, peer: &str, pushed: u64, pulled: u64) -> Result<PeerSyncState, StateError> {
        let now = Utc::now();
        self.update(peer, false, |state| {
            state.last_pushed_sequence = state.last_pushed_sequence.max(pushed);
            state.last_pulled_sequence = state.last_pulled_sequence.max(pulled);
            state.sector_cursors.clear();
            state.queued_sectors.clear();
            state.full_sync_pending = false;
            state.last_full_sync_at = Some(now);
            Ok(())
        })
    }

    /// Record that a session found nothing to do
    pub fn touch_full_sync(&self, peer: &str) -> Result<PeerSyncState, StateError> {
        let now = Utc::now();
        self.update(peer, false, |state| {
            state.last_full_sync_at = Some(now);
            Ok(())
        })
    }

    /// States whose pinned instance id is `instance`
    pub fn find_by_instance(&self, instance: &InstanceId) -> Result<Vec<PeerSyncState>, StateError> {
        Ok(self
            .all()?
            .into_iter()
            .filter(|state| state.peer_instance_id.as_ref() == Some(instance))
            .collect())
    }

    /// Mirror the cursors a remote initiator committed against us.
    ///
    /// `peer_pulled` is in our sequence space, `peer_pushed` in theirs. Every
    /// state pinned to the initiator is updated; without one, a state keyed
    /// by its instance id is created.
    pub fn mirror(
        &self,
        requester: &InstanceId,
        peer_pulled: u64,
        peer_pushed: u64,
    ) -> Result<usize, StateError> {
        let mut handles: Vec<String> = self
            .find_by_instance(requester)?
            .into_iter()
            .map(|state| state.peer)
            .collect();
        if handles.is_empty() {
            handles.push(requester.as_str().to_string());
        }

        let now = Utc::now();
        for handle in &handles {
            self.update(handle, true, |state| {
                state.peer_instance_id = Some(requester.clone());
                state.last_pushed_sequence = state.last_pushed_sequence.max(peer_pulled);
                state.last_pulled_sequence = state.last_pulled_sequence.max(peer_pushed);
                state.sector_cursors.clear();
                state.full_sync_pending = false;
                state.last_full_sync_at = Some(now);
                Ok(())
            })?;
        }
        Ok(handles.len())
    }

    /// Restart a full stream without forgetting who the peer is.
    /// Cursors already reset for a pending full stream are left alone so an
    /// interrupted full stream resumes.
    pub fn begin_full_sync(&self, peer: &str) -> Result<PeerSyncState, StateError> {
        self.update(peer, true, |state| {
            if !state.full_sync_pending {
                state.clear_cursors();
            }
            Ok(())
        })
    }

    /// Clear cursors and the identity pin; the next session streams
    /// everything from sequence 0. Ledger history is untouched.
    pub fn force_full_sync(&self, peer: &str) -> Result<PeerSyncState, StateError> {
        let state = self.update(peer, true, |state| {
            state.clear_cursors();
            state.queued_sectors.clear();
            state.peer_instance_id = None;
            Ok(())
        })?;
        info!(peer, "forced full sync");
        Ok(state)
    }

    /// Re-stream one sector from sequence 0 at the next session
    pub fn queue_sector(&self, peer: &str, sector: u8) -> Result<PeerSyncState, StateError> {
        self.update(peer, false, |state| {
            state.queued_sectors.insert(sector);
            state.sector_cursors.remove(&sector);
            Ok(())
        })
    }

    /// Flag every known peer for a full stream (after corruption repair)
    pub fn mark_all_full_sync(&self) -> Result<usize, StateError> {
        let peers: Vec<String> = self.all()?.into_iter().map(|s| s.peer).collect();
        for peer in &peers {
            self.update(peer, false, |state| {
                state.clear_cursors();
                Ok(())
            })?;
        }
        if !peers.is_empty() {
            warn!(peers = peers.len(), "all peers flagged for full sync");
        }
        Ok(peers.len())
    }
}
