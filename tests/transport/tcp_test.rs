// TCP Transport Tests
// Framing, the frame cap, and sessions over a real socket

use notesync::ledger::{EntityType, InstanceId};
use notesync::sync::{Request, Response, SyncEngine, SyncResponder, SyncSession};
use notesync::transport::{read_frame, write_frame, PeerChannel, TcpChannel, TcpSyncServer, TransportError};
use notesync::{EngineConfig, Replica};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{duplex, AsyncWriteExt};
use tokio::sync::watch;

const MAX: usize = 64 * 1024;

fn replica(id: &str) -> Arc<Replica> {
    Arc::new(Replica::temporary_as(InstanceId::new(id)).unwrap())
}

async fn serve(replica: &Arc<Replica>) -> (String, watch::Sender<bool>, tokio::task::JoinHandle<()>) {
    let server = TcpSyncServer::bind("127.0.0.1:0", Arc::new(SyncResponder::new(replica.clone())), MAX)
        .await
        .unwrap();
    let address = server.local_addr().unwrap().to_string();
    let (stop, stopped) = watch::channel(false);
    let handle = server.spawn(stopped);
    (address, stop, handle)
}

// ============================================================================
// FRAMING
// ============================================================================

#[tokio::test]
async fn test_frames_keep_boundaries() {
    let (mut client, mut server) = duplex(1024);

    write_frame(&mut client, b"first", MAX).await.unwrap();
    write_frame(&mut client, b"", MAX).await.unwrap();
    write_frame(&mut client, &[7u8; 300], MAX).await.unwrap();

    assert_eq!(read_frame(&mut server, MAX).await.unwrap(), b"first");
    assert!(read_frame(&mut server, MAX).await.unwrap().is_empty());
    assert_eq!(read_frame(&mut server, MAX).await.unwrap(), vec![7u8; 300]);
}

#[tokio::test]
async fn test_oversized_frame_is_not_written() {
    let (mut client, _server) = duplex(1024);
    let result = write_frame(&mut client, &[0u8; 2048], 1024).await;
    assert!(matches!(
        result,
        Err(TransportError::FrameTooLarge { size: 2048, max: 1024 })
    ));
}

#[tokio::test]
async fn test_oversized_length_prefix_is_rejected() {
    let (mut client, mut server) = duplex(1024);
    client.write_all(&(10_000_000u32).to_be_bytes()).await.unwrap();

    let result = read_frame(&mut server, MAX).await;
    assert!(matches!(
        result,
        Err(TransportError::FrameTooLarge { size: 10_000_000, .. })
    ));
}

#[tokio::test]
async fn test_closed_stream_reads_as_not_connected() {
    let (client, mut server) = duplex(1024);
    drop(client);
    assert!(matches!(
        read_frame(&mut server, MAX).await,
        Err(TransportError::NotConnected)
    ));
}

// ============================================================================
// CHANNEL AND SERVER
// ============================================================================

#[tokio::test]
async fn test_channel_round_trip_over_socket() {
    let b = replica("bbbb");
    b.entities().put(EntityType::Note, "n1", b"x").unwrap();
    let (address, stop, handle) = serve(&b).await;

    let channel = TcpChannel::new(&address, MAX);
    assert_eq!(channel.describe(), format!("tcp://{}", address));

    // The connection is reused across requests
    for _ in 0..3 {
        match channel.request(Request::GetGlobalDigest).await.unwrap() {
            Response::GlobalDigest(digest) => assert_eq!(digest, b.index().global_digest()),
            other => panic!("unexpected response {:?}", other),
        }
    }

    stop.send_replace(true);
    handle.await.unwrap();
}

#[tokio::test]
async fn test_unreachable_peer_fails_to_connect() {
    // Bind then drop to get a port nothing listens on
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    drop(listener);

    let channel = TcpChannel::new(&address, MAX).with_connect_timeout(Duration::from_secs(2));
    let result = channel.request(Request::GetGlobalDigest).await;
    assert!(matches!(
        result,
        Err(TransportError::ConnectionFailed(_)) | Err(TransportError::Timeout)
    ));
}

// ============================================================================
// SESSIONS OVER TCP
// ============================================================================

#[tokio::test]
async fn test_session_over_tcp_converges() {
    let a = replica("aaaa");
    let b = replica("bbbb");
    for i in 0..150 {
        a.entities().put(EntityType::Note, &format!("a{}", i), b"from a").unwrap();
        b.entities().put(EntityType::Branch, &format!("b{}", i), b"from b").unwrap();
    }
    let (address, stop, handle) = serve(&b).await;

    let config = EngineConfig::default().with_batch_size(40);
    let channel = TcpChannel::new(&address, config.max_frame_bytes);
    let report = SyncSession::new(&a, &config, "b", &channel).run().await.unwrap();

    assert!(report.full_sync);
    assert_eq!(report.pulled, 150);
    assert_eq!(report.pushed, 150);
    assert_eq!(a.entities().entity_count(), 300);
    assert_eq!(b.entities().entity_count(), 300);
    assert_eq!(a.index().global_digest(), b.index().global_digest());

    stop.send_replace(true);
    handle.await.unwrap();
}

#[tokio::test]
async fn test_engines_sync_each_other_over_tcp() {
    let a = replica("aaaa");
    let b = replica("bbbb");
    let config = EngineConfig::default().with_sync_interval_secs(None);
    let engine_a = Arc::new(SyncEngine::new(a.clone(), config.clone()).unwrap());
    let engine_b = Arc::new(SyncEngine::new(b.clone(), config.clone()).unwrap());

    let server_a = TcpSyncServer::bind("127.0.0.1:0", engine_a.responder(), MAX).await.unwrap();
    let server_b = TcpSyncServer::bind("127.0.0.1:0", engine_b.responder(), MAX).await.unwrap();
    let address_a = server_a.local_addr().unwrap().to_string();
    let address_b = server_b.local_addr().unwrap().to_string();
    let (stop, stopped) = watch::channel(false);
    let handles = vec![server_a.spawn(stopped.clone()), server_b.spawn(stopped)];

    engine_a.register_peer("b", Arc::new(TcpChannel::new(&address_b, MAX)));
    engine_b.register_peer("a", Arc::new(TcpChannel::new(&address_a, MAX)));

    a.entities().put(EntityType::Note, "shared", b"from a").unwrap();
    engine_a.trigger_sync("b").await.unwrap();
    assert_eq!(
        b.entities().get_current_state(EntityType::Note, "shared").unwrap(),
        Some(b"from a".to_vec())
    );

    b.entities().put(EntityType::Note, "shared", b"edited on b").unwrap();
    let report = engine_b.trigger_sync("a").await.unwrap();
    assert!(report.full_sync);
    assert_eq!(
        a.entities().get_current_state(EntityType::Note, "shared").unwrap(),
        Some(b"edited on b".to_vec())
    );
    assert_eq!(a.index().global_digest(), b.index().global_digest());

    stop.send_replace(true);
    for handle in handles {
        handle.await.unwrap();
    }
}
