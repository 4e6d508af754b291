// Protocol Tests
// Wire messages, envelopes and versioning

use notesync::ledger::{
    ChangeTimestamp, ContentHash, EntityChange, EntityKey, EntityType, InstanceId,
};
use notesync::sector::SectorIndex;
use notesync::sync::{
    ChangeRecord, ProtocolError, Request, Response, MAX_BATCH_SIZE, PROTOCOL_VERSION,
};

fn change(id: &str, body: &[u8]) -> EntityChange {
    EntityChange::new(
        &EntityKey::new(EntityType::Note, id),
        3,
        ContentHash::of(body),
        false,
        ChangeTimestamp::new(1_700_000_000_000, 2),
        InstanceId::new("sender"),
    )
}

// ============================================================================
// REQUESTS
// ============================================================================

#[test]
fn test_handshake_roundtrip() {
    let request = Request::Handshake {
        instance_id: InstanceId::new("a1b2"),
        protocol_version: PROTOCOL_VERSION,
        head_sequence: 42,
    };
    let decoded = Request::from_bytes(&request.to_bytes().unwrap()).unwrap();
    assert_eq!(decoded, request);
    assert_eq!(decoded.kind(), "handshake");
}

#[test]
fn test_get_changes_keeps_sector_filter() {
    for sector in [None, Some(0u8), Some(255u8)] {
        let request = Request::GetChanges {
            requester: InstanceId::new("me"),
            sector,
            since: u64::MAX - 1,
            limit: MAX_BATCH_SIZE as u32,
        };
        let decoded = Request::from_bytes(&request.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, request);
    }
}

#[test]
fn test_push_carries_payloads_and_superseded_flag() {
    let records = vec![
        ChangeRecord::new(change("n1", b"body"), Some(b"body".to_vec()), false),
        ChangeRecord::new(change("n2", b"old"), None, true),
    ];
    let request = Request::PushChanges {
        origin: InstanceId::new("sender"),
        records,
    };

    match Request::from_bytes(&request.to_bytes().unwrap()).unwrap() {
        Request::PushChanges { records, .. } => {
            assert_eq!(records[0].payload(), Some(&b"body"[..]));
            assert!(!records[0].is_superseded());
            assert_eq!(records[1].payload(), None);
            assert!(records[1].is_superseded());
            assert_eq!(records[1].change(), &change("n2", b"old"));
        }
        other => panic!("unexpected request {:?}", other),
    }
}

// ============================================================================
// RESPONSES
// ============================================================================

#[test]
fn test_sector_digest_page_roundtrip() {
    let index = SectorIndex::new();
    let response = Response::SectorDigests {
        digests: index.page(64, 64),
        next: Some(128),
    };
    assert_eq!(Response::from_bytes(&response.to_bytes().unwrap()).unwrap(), response);
}

#[test]
fn test_error_response_roundtrip() {
    let response = Response::Error {
        message: "ledger unavailable".to_string(),
    };
    let decoded = Response::from_bytes(&response.to_bytes().unwrap()).unwrap();
    assert_eq!(decoded, response);
    assert_eq!(decoded.kind(), "error");
}

// ============================================================================
// VERSIONING
// ============================================================================

#[test]
fn test_other_version_rejected() {
    let mut bytes = Response::Finished.to_bytes().unwrap();
    bytes[0] = (PROTOCOL_VERSION + 1) as u8;

    assert_eq!(
        Response::from_bytes(&bytes),
        Err(ProtocolError::UnsupportedVersion {
            got: PROTOCOL_VERSION + 1,
            expected: PROTOCOL_VERSION,
        })
    );
}

#[test]
fn test_garbage_rejected() {
    assert_eq!(Request::from_bytes(&[]), Err(ProtocolError::DeserializationFailed));
    assert!(Request::from_bytes(&[PROTOCOL_VERSION as u8, 0xEE, 0xEE]).is_err());
}
