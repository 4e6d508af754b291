// Entity Store Tests
// Atomic payload + ledger writes and the fill repair pass

use notesync::ledger::{ContentHash, EntityKey, EntityType};
use notesync::storage::trees;
use notesync::Replica;

fn entities_tree(replica: &Replica) -> sled::Tree {
    replica.store().tree(trees::ENTITIES).unwrap()
}

// ============================================================================
// MUTATIONS
// ============================================================================

#[test]
fn test_put_writes_payload_and_record() {
    let replica = Replica::temporary().unwrap();
    let change = replica.entities().put(EntityType::Note, "n1", b"hello").unwrap();

    assert_eq!(change.content_hash(), ContentHash::of(b"hello"));
    assert_eq!(
        replica.entities().get_current_state(EntityType::Note, "n1").unwrap(),
        Some(b"hello".to_vec())
    );
    assert_eq!(replica.entities().entity_count(), 1);
    assert_eq!(replica.ledger().len(), 1);
}

#[test]
fn test_erase_removes_payload() {
    let replica = Replica::temporary().unwrap();
    replica.entities().put(EntityType::Attachment, "a1", b"bytes").unwrap();
    replica.entities().erase(EntityType::Attachment, "a1").unwrap();

    assert!(!replica.entities().contains(EntityType::Attachment, "a1").unwrap());
    assert_eq!(replica.entities().entity_count(), 0);
    assert_eq!(replica.ledger().key_count(), 1);
}

#[test]
fn test_erase_of_unknown_entity_records_tombstone() {
    let replica = Replica::temporary().unwrap();
    let tombstone = replica.entities().erase(EntityType::Note, "never").unwrap();
    assert!(tombstone.is_erased());
    assert_eq!(replica.ledger().key_count(), 1);
}

#[test]
fn test_payload_for_current_and_stale_records() {
    let replica = Replica::temporary().unwrap();
    let first = replica.entities().put(EntityType::Note, "n1", b"v1").unwrap();
    let second = replica.entities().put(EntityType::Note, "n1", b"v2").unwrap();

    assert_eq!(replica.entities().payload_for(&first).unwrap(), None);
    assert_eq!(replica.entities().payload_for(&second).unwrap(), Some(b"v2".to_vec()));

    let tombstone = replica.entities().erase(EntityType::Note, "n1").unwrap();
    assert_eq!(replica.entities().payload_for(&tombstone).unwrap(), None);
}

// ============================================================================
// FILL ENTITY CHANGES
// ============================================================================

#[test]
fn test_fill_records_entities_written_behind_the_ledger() {
    let replica = Replica::temporary().unwrap();
    replica.entities().put(EntityType::Note, "tracked", b"ok").unwrap();

    let key = EntityKey::new(EntityType::Note, "untracked");
    entities_tree(&replica)
        .insert(key.to_bytes(), b"written directly".to_vec())
        .unwrap();

    assert_eq!(replica.entities().fill_entity_changes().unwrap(), 1);

    let latest = replica.ledger().latest_for_key(&key).unwrap().unwrap();
    assert_eq!(latest.content_hash(), ContentHash::of(b"written directly"));
    assert!(replica.index().verify(replica.ledger()).is_ok());

    assert_eq!(replica.entities().fill_entity_changes().unwrap(), 0);
}

#[test]
fn test_fill_records_changed_payload() {
    let replica = Replica::temporary().unwrap();
    replica.entities().put(EntityType::Note, "n1", b"v1").unwrap();

    let key = EntityKey::new(EntityType::Note, "n1");
    entities_tree(&replica).insert(key.to_bytes(), b"v2".to_vec()).unwrap();

    assert_eq!(replica.entities().fill_entity_changes().unwrap(), 1);
    let latest = replica.ledger().latest_for_key(&key).unwrap().unwrap();
    assert_eq!(latest.content_hash(), ContentHash::of(b"v2"));
    assert_eq!(replica.ledger().history(&key).unwrap().len(), 2);
}

#[test]
fn test_fill_tombstones_records_without_payload() {
    let replica = Replica::temporary().unwrap();
    replica.entities().put(EntityType::Note, "n1", b"v1").unwrap();

    let key = EntityKey::new(EntityType::Note, "n1");
    entities_tree(&replica).remove(key.to_bytes()).unwrap();

    assert_eq!(replica.entities().fill_entity_changes().unwrap(), 1);
    let latest = replica.ledger().latest_for_key(&key).unwrap().unwrap();
    assert!(latest.is_erased());
}

#[test]
fn test_fill_on_consistent_store_writes_nothing() {
    let replica = Replica::temporary().unwrap();
    for i in 0..10 {
        replica.entities().put(EntityType::Note, &format!("n{}", i), b"x").unwrap();
    }
    replica.entities().erase(EntityType::Note, "n3").unwrap();

    let before = replica.ledger().len();
    assert_eq!(replica.entities().fill_entity_changes().unwrap(), 0);
    assert_eq!(replica.ledger().len(), before);
}
