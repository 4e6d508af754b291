// Sync module - HOW REPLICAS CONVERGE
// Wire protocol, per-peer cursors, the apply path, and the session driver

mod apply;
mod engine;
mod protocol;
mod responder;
mod session;
mod state;

pub use apply::{apply_batch, apply_record, ApplyError, BatchApplyReport, SkippedChange};
pub use engine::{SessionCounters, SyncEngine, SyncStats, SyncStatus};
pub use protocol::{
    ChangeRecord, ProtocolError, Request, Response, MAX_BATCH_SIZE, PROTOCOL_VERSION,
};
pub use responder::SyncResponder;
pub use session::{PeerHello, SessionOutcome, SessionReport, SessionState, SyncError, SyncSession};
pub use state::{PeerSyncState, SectorCursor, StateError, SyncStateStore};
