// notesync - Entity synchronization engine for a hierarchical note store
//
// Keeps two independently writable copies of the note database eventually
// consistent: every mutation lands in a change ledger, the ledger is
// partitioned into hashed sectors with order-independent digests, and sync
// sessions reconcile only the sectors whose digests differ.

pub mod config;
pub mod ledger;
pub mod replica;
pub mod sector;
pub mod storage;
pub mod sync;
pub mod transport;

pub use config::{ConfigError, EngineConfig};
pub use replica::Replica;
