// Sync Session - Drives one reconciliation round with a peer
//
// Idle -> Handshaking -> DigestComparing -> SectorReconciling -> Streaming
//      -> Applying -> Committed, with Failed reachable from every working
// state. A peer we never finished a session with (or one flagged for a full
// sync) skips the digest rounds and streams everything.
//
// Cursors only move after a batch has been applied and flushed, so a failed
// session leaves state that a retry resumes from.

use crate::config::{EngineConfig, MAX_BATCH_SIZE};
use crate::ledger::{InstanceId, LedgerError};
use crate::replica::Replica;
use crate::sector::SectorError;
use crate::storage::StoreError;
use crate::sync::apply::{apply_batch, SkippedChange};
use crate::sync::protocol::{ChangeRecord, Request, Response, PROTOCOL_VERSION};
use crate::sync::responder::outgoing_record;
use crate::sync::state::{PeerSyncState, StateError};
use crate::transport::{PeerChannel, TransportError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

// ============================================================================
// ERRORS
// ============================================================================

/// Errors that end a session
#[derive(Error, Debug, Clone)]
pub enum SyncError {
    #[error("Network error: {0}")]
    TransientNetwork(#[from] TransportError),

    #[error("Peer {peer} presented instance {presented}, expected {expected}")]
    PeerIdentityMismatch {
        peer: String,
        expected: InstanceId,
        presented: InstanceId,
    },

    #[error("Ledger corruption detected in sectors {sectors:?}")]
    LedgerCorruption { sectors: Vec<u8> },

    #[error("A session with {0} is already in flight")]
    SessionInFlight(String),

    #[error("Unknown peer: {0}")]
    UnknownPeer(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Session cancelled")]
    Cancelled,

    #[error("Peer reported an error: {0}")]
    Remote(String),
}

impl SyncError {
    /// Whether retrying the same session later can succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::TransientNetwork(_) | SyncError::Remote(_))
    }
}

impl From<LedgerError> for SyncError {
    fn from(err: LedgerError) -> Self {
        SyncError::Storage(err.to_string())
    }
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        SyncError::Storage(err.to_string())
    }
}

impl From<StateError> for SyncError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::IdentityMismatch {
                peer,
                expected,
                presented,
            } => SyncError::PeerIdentityMismatch {
                peer,
                expected,
                presented,
            },
            StateError::UnknownPeer(peer) => SyncError::UnknownPeer(peer),
            other => SyncError::Storage(other.to_string()),
        }
    }
}

impl From<SectorError> for SyncError {
    fn from(err: SectorError) -> Self {
        match err {
            SectorError::Corruption { sectors, .. } => SyncError::LedgerCorruption { sectors },
            SectorError::Ledger(e) => SyncError::from(e),
        }
    }
}

// ============================================================================
// SESSION STATE
// ============================================================================

/// Where a session is in its protocol
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    Idle,
    Handshaking,
    DigestComparing,
    SectorReconciling,
    Streaming,
    Applying,
    Committed,
    Failed,
}

impl SessionState {
    /// Check if transition to another state is valid
    pub fn can_transition_to(&self, target: SessionState) -> bool {
        use SessionState::*;
        match (self, target) {
            (Idle, Handshaking) => true,
            (Handshaking, DigestComparing) => true,
            (Handshaking, Streaming) => true,
            (DigestComparing, SectorReconciling) => true,
            (DigestComparing, Committed) => true,
            (SectorReconciling, Streaming) => true,
            (SectorReconciling, Committed) => true,
            (Streaming, Applying) => true,
            (Streaming, Committed) => true,
            (Applying, Streaming) => true,
            (Committed, Idle) => true,
            (Failed, Idle) => true,
            (from, Failed) => !matches!(from, Idle | Committed | Failed),
            _ => false,
        }
    }

    /// Idle is both the initial and the resting state
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Committed | SessionState::Failed)
    }
}

// ============================================================================
// SESSION REPORT
// ============================================================================

/// User-visible result of one sync attempt
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionOutcome {
    Success,
    PartialSuccess { skipped: usize },
    Failed { retryable: bool, error: String },
}

impl SessionOutcome {
    pub fn from_result(result: &Result<SessionReport, SyncError>) -> Self {
        match result {
            Ok(report) => report.outcome(),
            Err(e) => SessionOutcome::Failed {
                retryable: e.is_retryable(),
                error: e.to_string(),
            },
        }
    }
}

/// What a completed session did
#[derive(Clone, Debug, Default)]
pub struct SessionReport {
    pub peer: String,
    pub peer_instance_id: Option<InstanceId>,
    /// Everything was streamed without digest comparison
    pub full_sync: bool,
    pub divergent_sectors: Vec<u8>,
    /// Records received from the peer
    pub pulled: usize,
    pub adopted: usize,
    pub kept_local: usize,
    /// Records sent to the peer
    pub pushed: usize,
    /// Changes either side could not apply
    pub skipped: Vec<SkippedChange>,
    /// States entered, in order
    pub transitions: Vec<SessionState>,
}

impl SessionReport {
    pub fn outcome(&self) -> SessionOutcome {
        if self.skipped.is_empty() {
            SessionOutcome::Success
        } else {
            SessionOutcome::PartialSuccess {
                skipped: self.skipped.len(),
            }
        }
    }
}

/// What the peer told us in the handshake
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerHello {
    pub instance_id: InstanceId,
    pub head_sequence: u64,
    pub knows_requester: bool,
}

struct ChangePage {
    records: Vec<ChangeRecord>,
    has_more: bool,
    last_sequence: u64,
}

fn unexpected(expected: &str, got: &Response) -> SyncError {
    SyncError::Protocol(format!("expected {} response, got {}", expected, got.kind()))
}

// ============================================================================
// SYNC SESSION
// ============================================================================

/// One session against one peer
pub struct SyncSession<'a> {
    replica: &'a Replica,
    config: &'a EngineConfig,
    peer: &'a str,
    channel: &'a dyn PeerChannel,
    cancel: Option<watch::Receiver<bool>>,
    state: SessionState,
    remote: Option<InstanceId>,
    report: SessionReport,
}

impl<'a> SyncSession<'a> {
    pub fn new(
        replica: &'a Replica,
        config: &'a EngineConfig,
        peer: &'a str,
        channel: &'a dyn PeerChannel,
    ) -> Self {
        Self {
            replica,
            config,
            peer,
            channel,
            cancel: None,
            state: SessionState::Idle,
            remote: None,
            report: SessionReport {
                peer: peer.to_string(),
                ..SessionReport::default()
            },
        }
    }

    /// Stop at the next batch boundary once `cancel` turns true
    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Run the session to completion
    pub async fn run(mut self) -> Result<SessionReport, SyncError> {
        info!(peer = self.peer, channel = %self.channel.describe(), "sync session starting");

        match self.drive().await {
            Ok(()) => {
                self.enter(SessionState::Idle);
                info!(
                    peer = self.peer,
                    full = self.report.full_sync,
                    sectors = self.report.divergent_sectors.len(),
                    pulled = self.report.pulled,
                    pushed = self.report.pushed,
                    skipped = self.report.skipped.len(),
                    "sync session committed"
                );
                Ok(self.report)
            }
            Err(e) => {
                self.enter(SessionState::Failed);
                match &e {
                    SyncError::PeerIdentityMismatch { .. } | SyncError::LedgerCorruption { .. } => {
                        error!(peer = self.peer, error = %e, "sync session failed")
                    }
                    _ => warn!(
                        peer = self.peer,
                        error = %e,
                        retryable = e.is_retryable(),
                        "sync session failed"
                    ),
                }
                self.enter(SessionState::Idle);
                Err(e)
            }
        }
    }

    /// Handshake only: check the peer is reachable, speaks our protocol and
    /// is who we pinned. Touches no cursors.
    pub async fn probe(mut self) -> Result<PeerHello, SyncError> {
        self.transition(SessionState::Handshaking)?;
        let result = self.probe_inner().await;
        self.enter(if result.is_ok() {
            SessionState::Idle
        } else {
            SessionState::Failed
        });
        result
    }

    async fn probe_inner(&mut self) -> Result<PeerHello, SyncError> {
        let hello = self.handshake().await?;
        if let Some(state) = self.replica.states().get(self.peer)? {
            if let Some(expected) = state.peer_instance_id() {
                if *expected != hello.instance_id {
                    return Err(SyncError::PeerIdentityMismatch {
                        peer: self.peer.to_string(),
                        expected: expected.clone(),
                        presented: hello.instance_id,
                    });
                }
            }
        }
        Ok(hello)
    }

    // ========================================================================
    // STATE MACHINE
    // ========================================================================

    fn transition(&mut self, next: SessionState) -> Result<(), SyncError> {
        if self.state == next {
            return Ok(());
        }
        if !self.state.can_transition_to(next) {
            return Err(SyncError::Protocol(format!(
                "invalid session transition {:?} -> {:?}",
                self.state, next
            )));
        }
        self.enter(next);
        Ok(())
    }

    fn enter(&mut self, next: SessionState) {
        debug!(peer = self.peer, from = ?self.state, to = ?next, "session transition");
        self.state = next;
        self.report.transitions.push(next);
    }

    fn check_cancelled(&self) -> Result<(), SyncError> {
        match &self.cancel {
            Some(cancel) if *cancel.borrow() => Err(SyncError::Cancelled),
            _ => Ok(()),
        }
    }

    async fn drive(&mut self) -> Result<(), SyncError> {
        self.transition(SessionState::Handshaking)?;
        let local_head = self.replica.ledger().head_sequence();
        let hello = self.handshake().await?;

        let states = self.replica.states();
        let prior = states.get(self.peer)?;
        let pinned = states.pin(self.peer, &hello.instance_id)?;
        self.report.peer_instance_id = Some(hello.instance_id.clone());

        let full = prior.is_none() || pinned.full_sync_pending() || !hello.knows_requester;
        self.report.full_sync = full;

        if full {
            let state = states.begin_full_sync(self.peer)?;
            info!(
                peer = self.peer,
                since_pulled = state.last_pulled_sequence(),
                since_pushed = state.last_pushed_sequence(),
                "streaming everything"
            );
            self.transition(SessionState::Streaming)?;
            self.stream_all(&state).await?;
        } else {
            self.transition(SessionState::DigestComparing)?;
            let local = self.replica.index().global_digest();
            let remote = self.global_digest().await?;
            let queued: Vec<u8> = pinned.queued_sectors().collect();

            if local == remote && queued.is_empty() {
                self.transition(SessionState::Committed)?;
                states.touch_full_sync(self.peer)?;
                info!(peer = self.peer, digest = %local, "digests match");
                return Ok(());
            }

            self.transition(SessionState::SectorReconciling)?;
            let mut divergent = if local == remote {
                Vec::new()
            } else {
                self.divergent_sectors().await?
            };
            divergent.extend(queued);
            divergent.sort_unstable();
            divergent.dedup();
            self.report.divergent_sectors = divergent.clone();
            info!(peer = self.peer, sectors = ?divergent, "divergent sectors");

            for sector in divergent {
                self.check_cancelled()?;
                self.reconcile_sector(sector).await?;
            }
        }

        self.transition(SessionState::Committed)?;
        let committed = states.commit(self.peer, local_head, hello.head_sequence)?;
        self.finish(&committed).await;
        Ok(())
    }

    // ========================================================================
    // ROUND TRIPS
    // ========================================================================

    /// One request with the configured timeout
    async fn call(&self, request: Request) -> Result<Response, SyncError> {
        let kind = request.kind();
        let response = timeout(self.config.request_timeout(), self.channel.request(request))
            .await
            .map_err(|_| SyncError::TransientNetwork(TransportError::Timeout))??;

        match response {
            Response::Error { message } => {
                debug!(peer = self.peer, request = kind, %message, "peer returned an error");
                Err(SyncError::Remote(message))
            }
            response => Ok(response),
        }
    }

    fn remote(&self) -> Result<&InstanceId, SyncError> {
        self.remote
            .as_ref()
            .ok_or_else(|| SyncError::Protocol("no handshake yet".to_string()))
    }

    async fn handshake(&mut self) -> Result<PeerHello, SyncError> {
        let request = Request::Handshake {
            instance_id: self.replica.instance_id().clone(),
            protocol_version: PROTOCOL_VERSION,
            head_sequence: self.replica.ledger().head_sequence(),
        };

        match self.call(request).await? {
            Response::Handshake {
                instance_id,
                protocol_version,
                head_sequence,
                knows_requester,
            } => {
                if protocol_version != PROTOCOL_VERSION {
                    return Err(SyncError::Protocol(format!(
                        "peer speaks protocol {}, we speak {}",
                        protocol_version, PROTOCOL_VERSION
                    )));
                }
                if instance_id == *self.replica.instance_id() {
                    return Err(SyncError::Protocol("peer is this instance".to_string()));
                }
                debug!(
                    peer = self.peer,
                    instance = %instance_id,
                    head = head_sequence,
                    knows_requester,
                    "handshake complete"
                );
                self.remote = Some(instance_id.clone());
                Ok(PeerHello {
                    instance_id,
                    head_sequence,
                    knows_requester,
                })
            }
            other => Err(unexpected("handshake", &other)),
        }
    }

    async fn global_digest(&self) -> Result<crate::sector::GlobalDigest, SyncError> {
        match self.call(Request::GetGlobalDigest).await? {
            Response::GlobalDigest(digest) => Ok(digest),
            other => Err(unexpected("global digest", &other)),
        }
    }

    /// Page through the peer's sector digests and collect mismatches
    async fn divergent_sectors(&self) -> Result<Vec<u8>, SyncError> {
        let index = self.replica.index();
        let limit = self.config.sector_page_size as u16;
        let mut divergent = Vec::new();
        let mut start: u16 = 0;

        loop {
            self.check_cancelled()?;
            match self.call(Request::GetSectorDigests { start, limit }).await? {
                Response::SectorDigests { digests, next } => {
                    for remote in &digests {
                        if !index.digest_of(remote.sector()).matches(remote) {
                            divergent.push(remote.sector());
                        }
                    }
                    match next {
                        Some(next) if next > start => start = next,
                        Some(_) => {
                            return Err(SyncError::Protocol(
                                "sector digest paging did not advance".to_string(),
                            ))
                        }
                        None => break,
                    }
                }
                other => return Err(unexpected("sector digests", &other)),
            }
        }

        Ok(divergent)
    }

    async fn sector_matches(&self, sector: u8) -> Result<bool, SyncError> {
        let request = Request::GetSectorDigests {
            start: sector as u16,
            limit: 1,
        };
        match self.call(request).await? {
            Response::SectorDigests { digests, .. } => {
                let remote = digests
                    .iter()
                    .find(|d| d.sector() == sector)
                    .ok_or_else(|| SyncError::Protocol(format!("no digest for sector {}", sector)))?;
                Ok(self.replica.index().digest_of(sector).matches(remote))
            }
            other => Err(unexpected("sector digests", &other)),
        }
    }

    async fn fetch_changes(&self, sector: Option<u8>, since: u64) -> Result<ChangePage, SyncError> {
        let request = Request::GetChanges {
            requester: self.replica.instance_id().clone(),
            sector,
            since,
            limit: self.config.batch_size as u32,
        };

        match self.call(request).await? {
            Response::Changes {
                records,
                has_more,
                last_sequence,
            } => {
                if records.len() > MAX_BATCH_SIZE {
                    return Err(SyncError::Protocol(format!(
                        "peer sent {} records in one page",
                        records.len()
                    )));
                }
                if has_more && last_sequence <= since {
                    return Err(SyncError::Protocol("change paging did not advance".to_string()));
                }
                Ok(ChangePage {
                    records,
                    has_more,
                    last_sequence: last_sequence.max(since),
                })
            }
            other => Err(unexpected("changes", &other)),
        }
    }

    // ========================================================================
    // STREAMING
    // ========================================================================

    /// Apply one received page and make it durable
    async fn apply_page(&mut self, records: &[ChangeRecord]) -> Result<(), SyncError> {
        if records.is_empty() {
            return Ok(());
        }

        self.transition(SessionState::Applying)?;
        let batch = apply_batch(self.replica.entities(), records)?;
        self.replica.store().flush_async().await?;

        self.report.pulled += records.len();
        self.report.adopted += batch.adopted;
        self.report.kept_local += batch.kept_local;
        self.report.skipped.extend(batch.skipped);
        self.transition(SessionState::Streaming)?;
        Ok(())
    }

    /// Send one page of local changes. Returns the new push position and
    /// whether more local changes may follow.
    async fn push_page(&mut self, sector: Option<u8>, since: u64) -> Result<(u64, bool), SyncError> {
        let limit = self.config.batch_size;
        let changes = self.replica.ledger().page(since, sector, limit)?;
        let has_more = changes.len() == limit;
        let position = changes.last().map(|c| c.sequence_id()).unwrap_or(since);

        let remote = self.remote()?.clone();
        let mut records = Vec::with_capacity(changes.len());
        for change in changes {
            if change.origin_instance_id() != &remote {
                records.push(outgoing_record(self.replica, change)?);
            }
        }

        if !records.is_empty() {
            let count = records.len();
            let request = Request::PushChanges {
                origin: self.replica.instance_id().clone(),
                records,
            };
            match self.call(request).await? {
                Response::Pushed { skipped, .. } => {
                    self.report.pushed += count;
                    for change in &skipped {
                        warn!(peer = self.peer, skipped = %change, "peer skipped change");
                    }
                    self.report.skipped.extend(skipped);
                }
                other => return Err(unexpected("pushed", &other)),
            }
        }

        Ok((position, has_more))
    }

    /// Pull then push the whole ledger, advancing the global cursors per page
    async fn stream_all(&mut self, state: &PeerSyncState) -> Result<(), SyncError> {
        let states = self.replica.states();

        let mut since = state.last_pulled_sequence();
        loop {
            self.check_cancelled()?;
            let page = self.fetch_changes(None, since).await?;
            self.apply_page(&page.records).await?;
            if page.last_sequence > since {
                states.advance(self.peer, None, Some(page.last_sequence))?;
                since = page.last_sequence;
            }
            debug!(peer = self.peer, since, records = page.records.len(), "pulled page");
            if !page.has_more {
                break;
            }
        }

        let mut since = state.last_pushed_sequence();
        loop {
            self.check_cancelled()?;
            let (position, has_more) = self.push_page(None, since).await?;
            if position > since {
                states.advance(self.peer, Some(position), None)?;
                since = position;
            }
            debug!(peer = self.peer, since, "pushed page");
            if !has_more {
                break;
            }
        }

        Ok(())
    }

    /// Stream one divergent sector both ways, then confirm it converged.
    /// A sector that still differs is streamed once more from the start.
    async fn reconcile_sector(&mut self, sector: u8) -> Result<(), SyncError> {
        self.transition(SessionState::Streaming)?;
        let state = self
            .replica
            .states()
            .get(self.peer)?
            .ok_or_else(|| SyncError::UnknownPeer(self.peer.to_string()))?;

        self.stream_sector(sector, state.pull_since(sector), state.push_since(sector))
            .await?;

        if !self.sector_matches(sector).await? {
            info!(peer = self.peer, sector, "sector still differs, streaming from the start");
            self.stream_sector(sector, 0, 0).await?;
            if !self.sector_matches(sector).await? {
                warn!(peer = self.peer, sector, "sector differs after full re-stream");
            }
        }
        Ok(())
    }

    async fn stream_sector(&mut self, sector: u8, pull_since: u64, push_since: u64) -> Result<(), SyncError> {
        let states = self.replica.states();

        let mut since = pull_since;
        loop {
            self.check_cancelled()?;
            let page = self.fetch_changes(Some(sector), since).await?;
            self.apply_page(&page.records).await?;
            since = page.last_sequence;
            states.advance_sector(self.peer, sector, None, Some(since))?;
            debug!(peer = self.peer, sector, since, records = page.records.len(), "pulled sector page");
            if !page.has_more {
                break;
            }
        }

        let mut since = push_since;
        loop {
            self.check_cancelled()?;
            let (position, has_more) = self.push_page(Some(sector), since).await?;
            since = position;
            states.advance_sector(self.peer, sector, Some(since), None)?;
            if !has_more {
                break;
            }
        }

        Ok(())
    }

    /// Tell the peer what we committed. Best effort: the peer only uses it
    /// to skip a full stream next time.
    async fn finish(&self, committed: &PeerSyncState) {
        let request = Request::Finished {
            requester: self.replica.instance_id().clone(),
            pulled: committed.last_pulled_sequence(),
            pushed: committed.last_pushed_sequence(),
        };
        match self.call(request).await {
            Ok(Response::Finished) => {}
            Ok(other) => warn!(peer = self.peer, response = other.kind(), "unexpected finish response"),
            Err(e) => warn!(peer = self.peer, error = %e, "could not notify peer"),
        }
    }
}
