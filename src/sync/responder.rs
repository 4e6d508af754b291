// Responder - Serves sync requests against the local replica
//
// Stateless apart from the replica itself: every request is answered from
// the ledger, the sector index and the sync state store. Failures become
// `Response::Error` so the initiator can report them.

use crate::ledger::{EntityChange, InstanceId, LedgerError, SECTOR_COUNT};
use crate::replica::Replica;
use crate::storage::StoreError;
use crate::sync::apply::apply_batch;
use crate::sync::protocol::{ChangeRecord, Request, Response, MAX_BATCH_SIZE, PROTOCOL_VERSION};
use crate::sync::state::StateError;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors while serving a request
#[derive(Error, Debug)]
enum ResponderError {
    #[error("Unsupported protocol version {0}")]
    UnsupportedVersion(u16),

    #[error("Batch of {0} records exceeds the limit")]
    BatchTooLarge(usize),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Sync state error: {0}")]
    State(#[from] StateError),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),
}

/// Wrap a local change for sending.
///
/// The payload is attached only while the record is still the current
/// version of a live entity.
pub(crate) fn outgoing_record(
    replica: &Replica,
    change: EntityChange,
) -> Result<ChangeRecord, LedgerError> {
    let current = replica
        .ledger()
        .latest_for_key(&change.key())?
        .map(|latest| latest.sequence_id() == change.sequence_id())
        .unwrap_or(false);

    let payload = if current {
        replica.entities().payload_for(&change)?
    } else {
        None
    };
    Ok(ChangeRecord::new(change, payload, !current))
}

/// Answers requests from remote session initiators
pub struct SyncResponder {
    replica: Arc<Replica>,
}

impl SyncResponder {
    pub fn new(replica: Arc<Replica>) -> Self {
        Self { replica }
    }

    pub fn replica(&self) -> &Arc<Replica> {
        &self.replica
    }

    /// Handle one request
    pub fn handle(&self, request: Request) -> Response {
        let kind = request.kind();
        match self.dispatch(request) {
            Ok(response) => {
                debug!(request = kind, response = response.kind(), "served request");
                response
            }
            Err(e) => {
                warn!(request = kind, error = %e, "request failed");
                Response::Error {
                    message: e.to_string(),
                }
            }
        }
    }

    fn dispatch(&self, request: Request) -> Result<Response, ResponderError> {
        match request {
            Request::Handshake {
                instance_id,
                protocol_version,
                ..
            } => self.handshake(&instance_id, protocol_version),
            Request::GetGlobalDigest => {
                Ok(Response::GlobalDigest(self.replica.index().global_digest()))
            }
            Request::GetSectorDigests { start, limit } => Ok(self.sector_digests(start, limit)),
            Request::GetChanges {
                requester,
                sector,
                since,
                limit,
            } => self.changes(&requester, sector, since, limit as usize),
            Request::PushChanges { origin, records } => self.push(&origin, &records),
            Request::Finished {
                requester,
                pulled,
                pushed,
            } => {
                self.replica.states().mirror(&requester, pulled, pushed)?;
                info!(peer = %requester, pulled, pushed, "peer finished sync");
                Ok(Response::Finished)
            }
        }
    }

    fn handshake(
        &self,
        requester: &InstanceId,
        protocol_version: u16,
    ) -> Result<Response, ResponderError> {
        if protocol_version != PROTOCOL_VERSION {
            return Err(ResponderError::UnsupportedVersion(protocol_version));
        }

        let knows_requester = self
            .replica
            .states()
            .find_by_instance(requester)?
            .iter()
            .any(|state| state.last_full_sync_at().is_some() && !state.full_sync_pending());

        Ok(Response::Handshake {
            instance_id: self.replica.instance_id().clone(),
            protocol_version: PROTOCOL_VERSION,
            head_sequence: self.replica.ledger().head_sequence(),
            knows_requester,
        })
    }

    fn sector_digests(&self, start: u16, limit: u16) -> Response {
        let start = start as usize;
        let limit = (limit as usize).clamp(1, SECTOR_COUNT);
        let digests = self.replica.index().page(start, limit);
        let end = start + digests.len();
        let next = if end < SECTOR_COUNT && !digests.is_empty() {
            Some(end as u16)
        } else {
            None
        };
        Response::SectorDigests { digests, next }
    }

    fn changes(
        &self,
        requester: &InstanceId,
        sector: Option<u8>,
        since: u64,
        limit: usize,
    ) -> Result<Response, ResponderError> {
        let ledger = self.replica.ledger();
        let limit = limit.clamp(1, MAX_BATCH_SIZE);
        let mut cursor = match sector {
            Some(sector) => ledger.sector_changes_since(sector, since, limit),
            None => ledger.changes_since(since, limit),
        };

        let mut records = Vec::new();
        let mut scanned = 0;
        for change in cursor.by_ref() {
            let change = change?;
            scanned += 1;
            if change.origin_instance_id() == requester {
                continue;
            }
            records.push(outgoing_record(&self.replica, change)?);
        }

        Ok(Response::Changes {
            records,
            has_more: scanned == limit,
            last_sequence: cursor.position(),
        })
    }

    fn push(
        &self,
        origin: &InstanceId,
        records: &[ChangeRecord],
    ) -> Result<Response, ResponderError> {
        if records.len() > MAX_BATCH_SIZE {
            return Err(ResponderError::BatchTooLarge(records.len()));
        }

        let report = apply_batch(self.replica.entities(), records)?;
        self.replica.store().flush()?;

        debug!(
            peer = %origin,
            adopted = report.adopted,
            kept_local = report.kept_local,
            skipped = report.skipped.len(),
            "applied pushed changes"
        );
        Ok(Response::Pushed {
            adopted: report.adopted as u32,
            kept_local: report.kept_local as u32,
            unchanged: report.unchanged as u32,
            skipped: report.skipped,
        })
    }
}
