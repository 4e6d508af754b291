// Store Tests
// Tests for the sled store wrapper and instance identity

use notesync::ledger::{EntityType, InstanceId};
use notesync::storage::{trees, NoteStore};
use notesync::Replica;
use tempfile::TempDir;

// ============================================================================
// STORE CREATION
// ============================================================================

#[test]
fn test_store_open_new() {
    let temp_dir = TempDir::new().unwrap();
    let store = NoteStore::open(temp_dir.path()).unwrap();

    assert!(store.is_empty().unwrap());
}

#[test]
fn test_temporary_store_is_empty() {
    let store = NoteStore::temporary().unwrap();
    assert!(store.is_empty().unwrap());
    assert_eq!(store.load_instance_id().unwrap(), None);
}

#[test]
fn test_store_not_empty_after_identity() {
    let store = NoteStore::temporary().unwrap();
    store.get_or_create_instance_id().unwrap();
    assert!(!store.is_empty().unwrap());
}

#[test]
fn test_open_fails_on_file_path() {
    let temp_dir = TempDir::new().unwrap();
    let file = temp_dir.path().join("not-a-dir");
    std::fs::write(&file, b"plain file").unwrap();

    assert!(NoteStore::open(&file).is_err());
}

// ============================================================================
// INSTANCE IDENTITY
// ============================================================================

#[test]
fn test_instance_id_generated_once() {
    let temp_dir = TempDir::new().unwrap();

    let first = {
        let store = NoteStore::open(temp_dir.path()).unwrap();
        let id = store.get_or_create_instance_id().unwrap();
        store.flush().unwrap();
        id
    };

    let store = NoteStore::open(temp_dir.path()).unwrap();
    assert_eq!(store.get_or_create_instance_id().unwrap(), first);
}

#[test]
fn test_saved_instance_id_wins() {
    let store = NoteStore::temporary().unwrap();
    store.save_instance_id(&InstanceId::new("chosen")).unwrap();
    assert_eq!(store.get_or_create_instance_id().unwrap(), InstanceId::new("chosen"));
}

#[test]
fn test_replica_keeps_identity_across_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let id = Replica::open(temp_dir.path()).unwrap().instance_id().clone();
    let reopened = Replica::open(temp_dir.path()).unwrap();
    assert_eq!(reopened.instance_id(), &id);
}

// ============================================================================
// TREES AND STATS
// ============================================================================

#[test]
fn test_trees_are_independent() {
    let store = NoteStore::temporary().unwrap();
    store.tree(trees::ENTITIES).unwrap().insert(b"k", b"v").unwrap();

    assert!(store.tree(trees::PEERS).unwrap().get(b"k").unwrap().is_none());
    assert!(store.tree(trees::ENTITIES).unwrap().get(b"k").unwrap().is_some());
}

#[test]
fn test_stats_count_ledger_keys() {
    let replica = Replica::temporary().unwrap();
    let before = replica.store().stats().unwrap().key_count;

    replica.entities().put(EntityType::Note, "n1", b"hello").unwrap();
    let after = replica.store().stats().unwrap().key_count;

    // changes, latest, history, by_sector and entities each gain one key
    assert_eq!(after - before, 5);
}

#[tokio::test]
async fn test_flush_async() {
    let temp_dir = TempDir::new().unwrap();
    let store = NoteStore::open(temp_dir.path()).unwrap();
    store.get_or_create_instance_id().unwrap();
    store.flush_async().await.unwrap();
}
