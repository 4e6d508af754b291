// Apply Path Tests
// Validation, skipped changes, record-only adoption and batch accounting

use notesync::ledger::{
    ChangeTimestamp, ContentHash, EntityChange, EntityKey, EntityType, InstanceId,
};
use notesync::sync::{apply_batch, apply_record, ApplyError, ChangeRecord};
use notesync::Replica;

fn remote(id: &str, body: Option<&[u8]>, at: u64) -> EntityChange {
    let (hash, erased) = match body {
        Some(body) => (ContentHash::of(body), false),
        None => (ContentHash::ERASED, true),
    };
    EntityChange::new(
        &EntityKey::new(EntityType::Note, id),
        1,
        hash,
        erased,
        ChangeTimestamp::from_millis(at),
        InstanceId::new("remote"),
    )
}

fn live(id: &str, body: &[u8], at: u64) -> ChangeRecord {
    ChangeRecord::new(remote(id, Some(body), at), Some(body.to_vec()), false)
}

#[test]
fn test_payload_must_match_hash() {
    let replica = Replica::temporary().unwrap();
    let record = ChangeRecord::new(remote("n1", Some(b"claimed"), 100), Some(b"actual".to_vec()), false);

    assert!(matches!(
        apply_record(replica.entities(), &record),
        Err(ApplyError::HashMismatch(_))
    ));
    assert!(replica.ledger().is_empty());
}

#[test]
fn test_forged_sector_rejected() {
    let replica = Replica::temporary().unwrap();
    let mut bytes = remote("n1", Some(b"x"), 100).to_bytes().unwrap();
    // The sector is the last field and encodes as one raw byte
    let last = bytes.len() - 1;
    bytes[last] = bytes[last].wrapping_add(1);
    let forged = EntityChange::from_bytes(&bytes).unwrap();
    assert!(!forged.has_consistent_sector());

    let record = ChangeRecord::new(forged, Some(b"x".to_vec()), false);
    assert!(matches!(
        apply_record(replica.entities(), &record),
        Err(ApplyError::SectorMismatch(_))
    ));
}

#[test]
fn test_current_record_without_payload_is_adopted_as_record_only() {
    let replica = Replica::temporary().unwrap();
    let records = vec![
        ChangeRecord::new(remote("n1", Some(b"x"), 100), None, false),
        live("n2", b"y", 100),
    ];

    let report = apply_batch(replica.entities(), &records).unwrap();
    assert_eq!(report.adopted, 2);
    assert!(report.skipped.is_empty());
    assert!(replica.entities().contains(EntityType::Note, "n2").unwrap());

    let key = EntityKey::new(EntityType::Note, "n1");
    let current = replica.ledger().latest_for_key(&key).unwrap().unwrap();
    assert_eq!(current.content_hash(), ContentHash::of(b"x"));
    assert!(!replica.entities().contains(EntityType::Note, "n1").unwrap());
    assert!(replica.ledger().is_external(&key).unwrap());

    let again = apply_batch(replica.entities(), &records).unwrap();
    assert_eq!(again.unchanged, 2);
}

#[test]
fn test_record_only_adoption_drops_stale_payload() {
    let replica = Replica::temporary().unwrap();
    replica.entities().put(EntityType::Note, "n1", b"old").unwrap();

    let newer = ChangeRecord::new(
        remote("n1", Some(b"new"), 4_000_000_000_000),
        None,
        false,
    );
    let report = apply_batch(replica.entities(), &[newer]).unwrap();
    assert_eq!(report.adopted, 1);
    assert_eq!(
        replica.entities().get_current_state(EntityType::Note, "n1").unwrap(),
        None
    );
    assert_eq!(replica.entities().fill_entity_changes().unwrap(), 0);
}

#[test]
fn test_superseded_record_without_payload_is_not_skipped() {
    let replica = Replica::temporary().unwrap();
    let records = vec![
        ChangeRecord::new(remote("n1", Some(b"created"), 100), None, true),
        ChangeRecord::new(remote("n1", None, 200), None, false),
    ];

    let report = apply_batch(replica.entities(), &records).unwrap();
    assert!(report.skipped.is_empty());
    assert_eq!(report.unchanged, 1);
    assert_eq!(report.adopted, 1);

    let current = replica
        .ledger()
        .latest_for(EntityType::Note, "n1")
        .unwrap()
        .unwrap();
    assert!(current.is_erased());
}

#[test]
fn test_reapplying_batch_is_idempotent() {
    let replica = Replica::temporary().unwrap();
    let records: Vec<ChangeRecord> = (0..10)
        .map(|i| live(&format!("n{}", i), format!("{}", i).as_bytes(), 100))
        .collect();

    let first = apply_batch(replica.entities(), &records).unwrap();
    let len = replica.ledger().len();
    let digest = replica.index().global_digest();

    let second = apply_batch(replica.entities(), &records).unwrap();
    assert_eq!(first.adopted, 10);
    assert_eq!(second.adopted, 0);
    assert_eq!(second.unchanged, 10);
    assert_eq!(replica.ledger().len(), len);
    assert_eq!(replica.index().global_digest(), digest);
}

#[test]
fn test_highest_sequence_tracks_sender_numbers() {
    let replica = Replica::temporary().unwrap();
    let records: Vec<ChangeRecord> = [4u64, 9, 6]
        .iter()
        .map(|seq| {
            let body = format!("{}", seq);
            ChangeRecord::new(
                remote(&format!("n{}", seq), Some(body.as_bytes()), 100).with_sequence(*seq),
                Some(body.into_bytes()),
                false,
            )
        })
        .collect();

    let report = apply_batch(replica.entities(), &records).unwrap();
    assert_eq!(report.highest_sequence, 9);
}
