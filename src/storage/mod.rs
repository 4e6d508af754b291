// Storage module - PERSISTENCE
// sled-backed store shared by the ledger, entity payloads and peer cursors

mod entities;
mod store;

pub use entities::EntityStore;
pub use store::{trees, NoteStore, StorageStats, StoreError};
