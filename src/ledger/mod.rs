// Ledger module - THE CHANGE HISTORY
// Append-only log of entity mutations, the hybrid clock that stamps them,
// and the last-writer-wins resolver used when a peer's version arrives.

mod change;
mod clock;
mod conflict;
mod log;

pub use change::{
    ChangeError, ChangeTimestamp, ContentHash, EntityChange, EntityKey, EntityType, InstanceId,
    SECTOR_COUNT,
};
pub use clock::HybridClock;
pub use conflict::{ConflictResolver, Resolution};
pub use log::{ChangeCursor, ChangeLedger, LedgerError, SequenceAllocator, SequenceGuard};
