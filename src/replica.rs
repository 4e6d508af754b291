// Replica - One instance's database and the components built on it

use crate::ledger::{ChangeLedger, InstanceId, LedgerError};
use crate::sector::SectorIndex;
use crate::storage::{EntityStore, NoteStore};
use crate::sync::SyncStateStore;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Store, ledger, sector index, entity storage and sync state of one instance
pub struct Replica {
    store: NoteStore,
    ledger: Arc<ChangeLedger>,
    entities: EntityStore,
    states: SyncStateStore,
}

impl Replica {
    /// Open (or create) a replica at a path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, LedgerError> {
        let store = NoteStore::open(path)?;
        let instance_id = store.get_or_create_instance_id()?;
        Self::from_store(store, instance_id)
    }

    /// In-memory replica with a random instance id
    pub fn temporary() -> Result<Self, LedgerError> {
        Self::temporary_as(InstanceId::generate())
    }

    /// In-memory replica with a chosen instance id
    pub fn temporary_as(instance_id: InstanceId) -> Result<Self, LedgerError> {
        let store = NoteStore::temporary()?;
        store.save_instance_id(&instance_id)?;
        Self::from_store(store, instance_id)
    }

    fn from_store(store: NoteStore, instance_id: InstanceId) -> Result<Self, LedgerError> {
        let index = Arc::new(SectorIndex::new());
        let ledger = Arc::new(ChangeLedger::open(&store, instance_id, index)?);
        let entities = EntityStore::new(ledger.clone());
        let states = SyncStateStore::open(&store)?;

        info!(
            instance = %ledger.instance_id(),
            head = ledger.head_sequence(),
            "replica opened"
        );
        Ok(Self {
            store,
            ledger,
            entities,
            states,
        })
    }

    pub fn instance_id(&self) -> &InstanceId {
        self.ledger.instance_id()
    }

    pub fn store(&self) -> &NoteStore {
        &self.store
    }

    pub fn ledger(&self) -> &Arc<ChangeLedger> {
        &self.ledger
    }

    pub fn index(&self) -> &Arc<SectorIndex> {
        self.ledger.index()
    }

    pub fn entities(&self) -> &EntityStore {
        &self.entities
    }

    pub fn states(&self) -> &SyncStateStore {
        &self.states
    }
}
