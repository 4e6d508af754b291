// Sync Engine Tests
// Peer registry, in-flight rejection, retry, integrity and the scheduler

use notesync::ledger::{ChangeTimestamp, ContentHash, EntityChange, EntityKey, EntityType, InstanceId};
use notesync::sync::{SessionOutcome, SyncEngine, SyncError, SyncResponder};
use notesync::transport::LoopbackChannel;
use notesync::{EngineConfig, Replica};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

fn replica(id: &str) -> Arc<Replica> {
    Arc::new(Replica::temporary_as(InstanceId::new(id)).unwrap())
}

fn fast_config() -> EngineConfig {
    EngineConfig::default()
        .with_retry_backoff_ms(10)
        .with_max_backoff_ms(50)
        .with_sync_interval_secs(None)
}

/// Engine on `local` with `remote` registered as "remote"
fn engine_with_peer(local: &Arc<Replica>, remote: &Arc<Replica>, config: EngineConfig) -> (Arc<SyncEngine>, Arc<LoopbackChannel>) {
    let engine = Arc::new(SyncEngine::new(local.clone(), config).unwrap());
    let channel = Arc::new(LoopbackChannel::new(Arc::new(SyncResponder::new(remote.clone()))));
    engine.register_peer("remote", channel.clone());
    (engine, channel)
}

// ============================================================================
// REGISTRY AND STATUS
// ============================================================================

#[tokio::test]
async fn test_register_and_unregister() {
    let a = replica("aaaa");
    let b = replica("bbbb");
    let (engine, _) = engine_with_peer(&a, &b, fast_config());

    assert_eq!(engine.peers(), vec!["remote".to_string()]);
    assert!(engine.unregister_peer("remote"));
    assert!(!engine.unregister_peer("remote"));
    assert!(matches!(
        engine.trigger_sync("remote").await,
        Err(SyncError::UnknownPeer(_))
    ));
}

#[tokio::test]
async fn test_status_after_successful_session() {
    let a = replica("aaaa");
    let b = replica("bbbb");
    b.entities().put(EntityType::Note, "n1", b"x").unwrap();
    let (engine, _) = engine_with_peer(&a, &b, fast_config());

    let before = engine.get_sync_status("remote").unwrap();
    assert!(before.registered);
    assert!(before.state.is_none());
    assert!(before.last_outcome.is_none());

    engine.trigger_sync("remote").await.unwrap();

    let status = engine.get_sync_status("remote").unwrap();
    assert!(!status.in_flight);
    assert_eq!(status.last_outcome, Some(SessionOutcome::Success));
    assert!(status.last_error.is_none());
    let state = status.state.unwrap();
    assert_eq!(state.peer_instance_id(), Some(&InstanceId::new("bbbb")));
    assert_eq!(state.last_pulled_sequence(), 1);
}

#[tokio::test]
async fn test_stats_reflect_ledger_and_sessions() {
    let a = replica("aaaa");
    let b = replica("bbbb");
    for i in 0..4 {
        b.entities().put(EntityType::Note, &format!("n{}", i), b"x").unwrap();
    }
    a.entities().put(EntityType::Note, "n0", b"y").unwrap();
    let (engine, _) = engine_with_peer(&a, &b, fast_config());
    engine.trigger_sync("remote").await.unwrap();

    let stats = engine.get_stats().unwrap();
    assert_eq!(stats.instance_id, InstanceId::new("aaaa"));
    assert_eq!(stats.key_count, 4);
    assert_eq!(stats.entity_count, 4);
    assert_eq!(stats.ledger_size, 5);
    assert_eq!(stats.head_sequence, 5);
    assert_eq!(stats.sector_count, 256);
    assert_eq!(stats.per_sector_counts.iter().sum::<u64>(), 4);
    assert_eq!(stats.sessions.started, 1);
    assert_eq!(stats.sessions.committed, 1);
    assert!(stats.integrity_error.is_none());
    assert_eq!(stats.peers.len(), 1);
    assert_eq!(stats.peers[0].peer, "remote");
}

#[tokio::test]
async fn test_stats_include_unregistered_peers_with_state() {
    let a = replica("aaaa");
    let b = replica("bbbb");
    let (engine, _) = engine_with_peer(&a, &b, fast_config());
    engine.trigger_sync("remote").await.unwrap();
    engine.unregister_peer("remote");

    let stats = engine.get_stats().unwrap();
    assert_eq!(stats.peers.len(), 1);
    assert!(!stats.peers[0].registered);
    assert!(stats.peers[0].state.is_some());
}

// ============================================================================
// IN-FLIGHT AND RETRY
// ============================================================================

#[tokio::test]
async fn test_concurrent_trigger_is_rejected() {
    let a = replica("aaaa");
    let b = replica("bbbb");
    let engine = Arc::new(SyncEngine::new(a.clone(), fast_config()).unwrap());
    let slow = LoopbackChannel::new(Arc::new(SyncResponder::new(b.clone()))).with_delay_ms(200);
    engine.register_peer("remote", Arc::new(slow));

    let second = async {
        sleep(Duration::from_millis(50)).await;
        assert!(engine.is_in_flight("remote"));
        engine.trigger_sync("remote").await
    };
    let (first, second) = tokio::join!(engine.trigger_sync("remote"), second);

    assert!(first.is_ok());
    assert!(matches!(second, Err(SyncError::SessionInFlight(_))));
    assert!(!engine.is_in_flight("remote"));
    let stats = engine.get_stats().unwrap();
    assert_eq!(stats.sessions.rejected, 1);
    assert_eq!(stats.sessions.started, 1);
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let a = replica("aaaa");
    let b = replica("bbbb");
    b.entities().put(EntityType::Note, "n1", b"x").unwrap();
    let (engine, channel) = engine_with_peer(&a, &b, fast_config());

    channel.fail_next(2);
    let report = engine.sync_with_retry("remote").await.unwrap();
    assert_eq!(report.pulled, 1);

    let stats = engine.get_stats().unwrap();
    assert_eq!(stats.sessions.retries, 2);
    assert_eq!(stats.sessions.failed, 2);
    assert_eq!(stats.sessions.committed, 1);
    assert_eq!(
        engine.get_sync_status("remote").unwrap().last_outcome,
        Some(SessionOutcome::Success)
    );
}

#[tokio::test]
async fn test_retry_backoff_doubles_from_base() {
    let a = replica("aaaa");
    let b = replica("bbbb");
    let config = fast_config().with_max_backoff_ms(1_000).with_max_retries(3);
    let (engine, channel) = engine_with_peer(&a, &b, config);

    channel.fail_next(3);
    let started = std::time::Instant::now();
    engine.sync_with_retry("remote").await.unwrap();

    // 10 + 20 + 40
    let stats = engine.get_stats().unwrap();
    assert_eq!(stats.sessions.retries, 3);
    assert_eq!(stats.sessions.backoff_ms, 70);
    assert!(started.elapsed() >= Duration::from_millis(70));
}

#[tokio::test]
async fn test_retries_give_up_after_limit() {
    let a = replica("aaaa");
    let b = replica("bbbb");
    let (engine, channel) = engine_with_peer(&a, &b, fast_config().with_max_retries(2));

    channel.fail_next(100);
    let result = engine.sync_with_retry("remote").await;
    assert!(matches!(result, Err(SyncError::TransientNetwork(_))));

    let stats = engine.get_stats().unwrap();
    assert_eq!(stats.sessions.retries, 2);
    assert_eq!(stats.sessions.failed, 3);
    match engine.get_sync_status("remote").unwrap().last_outcome {
        Some(SessionOutcome::Failed { retryable, .. }) => assert!(retryable),
        other => panic!("expected failure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_identity_mismatch_is_not_retried() {
    let a = replica("aaaa");
    let b = replica("bbbb");
    let c = replica("cccc");
    let (engine, _) = engine_with_peer(&a, &b, fast_config());
    engine.trigger_sync("remote").await.unwrap();

    let impostor = LoopbackChannel::new(Arc::new(SyncResponder::new(c.clone())));
    engine.register_peer("remote", Arc::new(impostor));

    let result = engine.sync_with_retry("remote").await;
    assert!(matches!(result, Err(SyncError::PeerIdentityMismatch { .. })));
    assert_eq!(engine.get_stats().unwrap().sessions.retries, 0);
    assert!(engine.get_sync_status("remote").unwrap().last_error.is_some());

    // Forcing a full sync accepts the new instance
    engine.force_full_sync("remote").unwrap();
    assert!(engine.get_sync_status("remote").unwrap().last_error.is_none());
    let report = engine.trigger_sync("remote").await.unwrap();
    assert!(report.full_sync);
    assert_eq!(
        engine.get_sync_status("remote").unwrap().state.unwrap().peer_instance_id(),
        Some(&InstanceId::new("cccc"))
    );
}

#[tokio::test]
async fn test_test_peer_reports_handshake() {
    let a = replica("aaaa");
    let b = replica("bbbb");
    b.entities().put(EntityType::Note, "n1", b"x").unwrap();
    let (engine, channel) = engine_with_peer(&a, &b, fast_config());

    let hello = engine.test_peer("remote").await.unwrap();
    assert_eq!(hello.instance_id, InstanceId::new("bbbb"));
    assert_eq!(hello.head_sequence, 1);
    assert_eq!(channel.requests().len(), 1);
    assert!(engine.get_sync_status("remote").unwrap().state.is_none());
}

#[tokio::test]
async fn test_queue_sector_restreams_at_next_session() {
    let a = replica("aaaa");
    let b = replica("bbbb");
    b.entities().put(EntityType::Note, "n1", b"x").unwrap();
    let (engine, _) = engine_with_peer(&a, &b, fast_config());
    engine.trigger_sync("remote").await.unwrap();

    let sector = EntityKey::new(EntityType::Note, "n1").sector();
    let state = engine.queue_sector("remote", sector).unwrap();
    assert!(state.is_queued(sector));

    let report = engine.trigger_sync("remote").await.unwrap();
    assert_eq!(report.divergent_sectors, vec![sector]);
    let state = engine.get_sync_status("remote").unwrap().state.unwrap();
    assert!(!state.is_queued(sector));
}

// ============================================================================
// INTEGRITY
// ============================================================================

#[tokio::test]
async fn test_integrity_check_passes_on_clean_replica() {
    let a = replica("aaaa");
    a.entities().put(EntityType::Note, "n1", b"x").unwrap();
    let engine = SyncEngine::new(a, fast_config()).unwrap();
    assert!(engine.check_integrity().is_ok());
}

#[tokio::test]
async fn test_corruption_rebuilds_index_and_flags_peers() {
    let a = replica("aaaa");
    let b = replica("bbbb");
    a.entities().put(EntityType::Note, "n1", b"x").unwrap();
    let (engine, _) = engine_with_peer(&a, &b, fast_config());
    engine.trigger_sync("remote").await.unwrap();

    let ghost = EntityChange::new(
        &EntityKey::new(EntityType::Note, "ghost"),
        999,
        ContentHash::of(b"never written"),
        false,
        ChangeTimestamp::from_millis(1),
        InstanceId::new("ghost"),
    );
    a.index().update(None, &ghost);

    match engine.check_integrity() {
        Err(SyncError::LedgerCorruption { sectors }) => assert_eq!(sectors, vec![ghost.sector()]),
        other => panic!("expected corruption, got {:?}", other),
    }

    // Index repaired, peers flagged, error kept for operators
    assert!(a.index().verify(a.ledger()).is_ok());
    assert!(engine.check_integrity().is_ok());
    let stats = engine.get_stats().unwrap();
    assert!(stats.integrity_error.is_some());
    assert!(stats.peers[0].state.as_ref().unwrap().full_sync_pending());

    let report = engine.trigger_sync("remote").await.unwrap();
    assert!(report.full_sync);
    assert_eq!(a.index().global_digest(), b.index().global_digest());
}

// ============================================================================
// SCHEDULER AND SHUTDOWN
// ============================================================================

#[tokio::test]
async fn test_scheduler_disabled_without_interval() {
    let a = replica("aaaa");
    let engine = Arc::new(SyncEngine::new(a, fast_config()).unwrap());
    assert!(engine.spawn_scheduler().is_none());
}

#[tokio::test]
async fn test_scheduler_syncs_registered_peers_until_shutdown() {
    let a = replica("aaaa");
    let b = replica("bbbb");
    b.entities().put(EntityType::Note, "n1", b"scheduled").unwrap();
    let (engine, _) = engine_with_peer(&a, &b, fast_config().with_sync_interval_secs(Some(1)));

    let handle = engine.spawn_scheduler().unwrap();
    let mut waited = 0;
    while a.entities().entity_count() == 0 && waited < 50 {
        sleep(Duration::from_millis(100)).await;
        waited += 1;
    }
    assert_eq!(
        a.entities().get_current_state(EntityType::Note, "n1").unwrap(),
        Some(b"scheduled".to_vec())
    );

    engine.shutdown();
    assert!(engine.is_shut_down());
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_sessions_after_shutdown_are_cancelled() {
    let a = replica("aaaa");
    let b = replica("bbbb");
    b.entities().put(EntityType::Note, "n1", b"x").unwrap();
    let (engine, _) = engine_with_peer(&a, &b, fast_config());

    engine.shutdown();
    let result = engine.sync_with_retry("remote").await;
    assert!(matches!(result, Err(SyncError::Cancelled)));
    assert_eq!(a.entities().entity_count(), 0);
}
