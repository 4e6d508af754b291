// Sync Engine - Entry point for collaborators
//
// Owns the peer registry and runs sessions: on demand, with retry, or from
// the periodic scheduler. At most one session per peer is in flight; a
// second trigger for the same peer is rejected.

use crate::config::{ConfigError, EngineConfig};
use crate::ledger::InstanceId;
use crate::replica::Replica;
use crate::sector::SectorError;
use crate::sync::responder::SyncResponder;
use crate::sync::session::{PeerHello, SessionOutcome, SessionReport, SyncError, SyncSession};
use crate::sync::state::PeerSyncState;
use crate::transport::PeerChannel;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Sync status of one peer
#[derive(Clone, Debug, Serialize)]
pub struct SyncStatus {
    pub peer: String,
    pub registered: bool,
    pub in_flight: bool,
    /// Cursors, pinned identity and last full sync
    pub state: Option<PeerSyncState>,
    pub last_outcome: Option<SessionOutcome>,
    pub last_error: Option<String>,
}

/// Session counters since the engine started
#[derive(Clone, Debug, Default, Serialize)]
pub struct SessionCounters {
    pub started: u64,
    pub committed: u64,
    pub failed: u64,
    pub retries: u64,
    pub rejected: u64,
    /// Total backoff waited before retries
    pub backoff_ms: u64,
}

/// Health snapshot for operational endpoints
#[derive(Clone, Debug, Serialize)]
pub struct SyncStats {
    pub instance_id: InstanceId,
    pub ledger_size: usize,
    pub key_count: usize,
    pub entity_count: usize,
    pub head_sequence: u64,
    pub sector_count: usize,
    pub per_sector_counts: Vec<u64>,
    pub sessions: SessionCounters,
    pub integrity_error: Option<String>,
    pub peers: Vec<SyncStatus>,
}

#[derive(Default)]
struct PeerRecord {
    last_outcome: Option<SessionOutcome>,
    last_error: Option<String>,
}

/// Removes the peer from the in-flight set when the session ends
struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<String>>,
    peer: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.peer);
    }
}

/// Runs sync sessions for one replica
pub struct SyncEngine {
    replica: Arc<Replica>,
    config: EngineConfig,
    responder: Arc<SyncResponder>,
    peers: RwLock<HashMap<String, Arc<dyn PeerChannel>>>,
    in_flight: Mutex<HashSet<String>>,
    records: Mutex<HashMap<String, PeerRecord>>,
    counters: Mutex<SessionCounters>,
    integrity_error: Mutex<Option<String>>,
    shutdown: watch::Sender<bool>,
}

impl SyncEngine {
    pub fn new(replica: Arc<Replica>, config: EngineConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let responder = Arc::new(SyncResponder::new(replica.clone()));
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            replica,
            config,
            responder,
            peers: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
            records: Mutex::new(HashMap::new()),
            counters: Mutex::new(SessionCounters::default()),
            integrity_error: Mutex::new(None),
            shutdown,
        })
    }

    pub fn replica(&self) -> &Arc<Replica> {
        &self.replica
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Handler for sessions other instances start against this one
    pub fn responder(&self) -> Arc<SyncResponder> {
        self.responder.clone()
    }

    // ========================================================================
    // PEERS
    // ========================================================================

    /// Register (or replace) the channel for a peer handle
    pub fn register_peer(&self, peer: &str, channel: Arc<dyn PeerChannel>) {
        info!(peer, channel = %channel.describe(), "peer registered");
        self.peers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(peer.to_string(), channel);
    }

    pub fn unregister_peer(&self, peer: &str) -> bool {
        self.peers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(peer)
            .is_some()
    }

    /// Registered peer handles, sorted
    pub fn peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self
            .peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        peers.sort();
        peers
    }

    fn channel(&self, peer: &str) -> Result<Arc<dyn PeerChannel>, SyncError> {
        self.peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(peer)
            .cloned()
            .ok_or_else(|| SyncError::UnknownPeer(peer.to_string()))
    }

    fn begin(&self, peer: &str) -> Result<InFlightGuard<'_>, SyncError> {
        let mut set = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if !set.insert(peer.to_string()) {
            self.counters.lock().unwrap_or_else(|e| e.into_inner()).rejected += 1;
            return Err(SyncError::SessionInFlight(peer.to_string()));
        }
        Ok(InFlightGuard {
            set: &self.in_flight,
            peer: peer.to_string(),
        })
    }

    pub fn is_in_flight(&self, peer: &str) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(peer)
    }

    // ========================================================================
    // SESSIONS
    // ========================================================================

    /// Run one session against a registered peer
    pub async fn trigger_sync(&self, peer: &str) -> Result<SessionReport, SyncError> {
        let channel = self.channel(peer)?;
        let _guard = self.begin(peer)?;
        self.counters.lock().unwrap_or_else(|e| e.into_inner()).started += 1;

        let session = SyncSession::new(&self.replica, &self.config, peer, channel.as_ref())
            .with_cancel(self.shutdown.subscribe());
        let result = session.run().await;
        self.record(peer, &result);
        result
    }

    /// Run a session, retrying retryable failures with exponential backoff
    pub async fn sync_with_retry(&self, peer: &str) -> Result<SessionReport, SyncError> {
        let mut shutdown = self.shutdown.subscribe();
        let mut attempt: u32 = 0;
        loop {
            match self.trigger_sync(peer).await {
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    attempt += 1;
                    let backoff = self.config.backoff_for(attempt);
                    {
                        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
                        counters.retries += 1;
                        counters.backoff_ms += backoff.as_millis() as u64;
                    }
                    warn!(
                        peer,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "retrying sync"
                    );
                    tokio::select! {
                        _ = sleep(backoff) => {}
                        _ = shutdown.changed() => return Err(SyncError::Cancelled),
                    }
                }
                result => return result,
            }
        }
    }

    fn record(&self, peer: &str, result: &Result<SessionReport, SyncError>) {
        {
            let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
            match result {
                Ok(_) => counters.committed += 1,
                Err(_) => counters.failed += 1,
            }
        }

        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let record = records.entry(peer.to_string()).or_default();
        record.last_outcome = Some(SessionOutcome::from_result(result));
        record.last_error = result.as_ref().err().map(|e| e.to_string());
    }

    /// Handshake only: reachability, protocol version and identity
    pub async fn test_peer(&self, peer: &str) -> Result<PeerHello, SyncError> {
        let channel = self.channel(peer)?;
        SyncSession::new(&self.replica, &self.config, peer, channel.as_ref())
            .probe()
            .await
    }

    /// Stream everything at the next session and accept a new identity
    pub fn force_full_sync(&self, peer: &str) -> Result<PeerSyncState, SyncError> {
        let state = self.replica.states().force_full_sync(peer)?;
        if let Some(record) = self
            .records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(peer)
        {
            record.last_error = None;
        }
        Ok(state)
    }

    /// Re-stream one sector from sequence 0 at the next session
    pub fn queue_sector(&self, peer: &str, sector: u8) -> Result<PeerSyncState, SyncError> {
        let state = self.replica.states().queue_sector(peer, sector)?;
        info!(peer, sector, "sector queued");
        Ok(state)
    }

    // ========================================================================
    // STATUS
    // ========================================================================

    pub fn get_sync_status(&self, peer: &str) -> Result<SyncStatus, SyncError> {
        let state = self.replica.states().get(peer)?;
        let registered = self
            .peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(peer);
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let record = records.get(peer);

        Ok(SyncStatus {
            peer: peer.to_string(),
            registered,
            in_flight: self.is_in_flight(peer),
            state,
            last_outcome: record.and_then(|r| r.last_outcome.clone()),
            last_error: record.and_then(|r| r.last_error.clone()),
        })
    }

    pub fn get_stats(&self) -> Result<SyncStats, SyncError> {
        let ledger = self.replica.ledger();
        let index = self.replica.index();

        let mut handles: Vec<String> = self.peers();
        for state in self.replica.states().all()? {
            if !handles.iter().any(|h| h == state.peer()) {
                handles.push(state.peer().to_string());
            }
        }
        handles.sort();

        let peers = handles
            .iter()
            .map(|peer| self.get_sync_status(peer))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(SyncStats {
            instance_id: self.replica.instance_id().clone(),
            ledger_size: ledger.len(),
            key_count: ledger.key_count(),
            entity_count: self.replica.entities().entity_count(),
            head_sequence: ledger.head_sequence(),
            sector_count: index.sector_count(),
            per_sector_counts: index.per_sector_counts(),
            sessions: self.counters.lock().unwrap_or_else(|e| e.into_inner()).clone(),
            integrity_error: self
                .integrity_error
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
            peers,
        })
    }

    /// Compare the sector index with a fresh scan of the ledger.
    ///
    /// On mismatch the index is rebuilt from the ledger, every known peer is
    /// flagged for a full sync and the error stays visible in stats.
    pub fn check_integrity(&self) -> Result<(), SyncError> {
        match self.replica.index().verify(self.replica.ledger()) {
            Ok(()) => {
                debug!("integrity check passed");
                Ok(())
            }
            Err(SectorError::Corruption {
                sectors,
                broken_keys,
            }) => {
                error!(sectors = ?sectors, broken_keys, "ledger corruption detected");
                self.replica.ledger().rebuild_index()?;
                let flagged = self.replica.states().mark_all_full_sync()?;
                let err = SyncError::LedgerCorruption { sectors };
                *self
                    .integrity_error
                    .lock()
                    .unwrap_or_else(|e| e.into_inner()) = Some(err.to_string());
                info!(flagged, "sector index rebuilt");
                Err(err)
            }
            Err(e) => Err(e.into()),
        }
    }

    // ========================================================================
    // SCHEDULER
    // ========================================================================

    /// Sync every registered peer each `sync_interval_secs` until shutdown.
    /// Returns `None` when the interval is disabled.
    pub fn spawn_scheduler(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let secs = self.config.sync_interval_secs?;
        let engine = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();

        Some(tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(secs));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(interval_secs = secs, "sync scheduler started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        for peer in engine.peers() {
                            if engine.is_in_flight(&peer) {
                                debug!(peer = %peer, "session already running, skipping tick");
                                continue;
                            }
                            let engine = Arc::clone(&engine);
                            tokio::spawn(async move {
                                if let Err(e) = engine.sync_with_retry(&peer).await {
                                    debug!(peer = %peer, error = %e, "scheduled sync failed");
                                }
                            });
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("sync scheduler stopped");
        }))
    }

    /// Cancel running sessions at their next batch boundary and stop the
    /// scheduler
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }
}
