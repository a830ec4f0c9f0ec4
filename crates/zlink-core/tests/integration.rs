//! End-to-end tests with two nodes over an in-process link.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio_test::assert_ok;

use zlink_core::harness::{linked_pair, LinkedPair};
use zlink_core::transfer::chunker::sha256_file;
use zlink_core::transfer::CheckpointPolicy;
use zlink_core::{
    ConnectionConfig, CoreError, ErrorCode, HandlerError, InMemoryStore, NodeConfig, PeerNode, Store, TransferConfig,
    TransferDirection, TransferRecord, TransferStatus,
};
use zlink_security::{Ed25519Signer, Ed25519Verifier, PermissionLevel, Signer};
use zlink_transport::{ConnectionState, LoopbackTransport, ReconnectionPolicy};

const WAIT: Duration = Duration::from_secs(10);

/// Poll `check` until it returns true or `WAIT` elapses.
async fn wait_for<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check().await {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_for_status(node: &PeerNode, transfer_id: &str, status: TransferStatus) {
    wait_for(&format!("{} to be {}", transfer_id, status), || async {
        node.transfers().get(transfer_id).map(|r| r.status) == Some(status)
    })
    .await;
}

fn transfer_config(dir: &Path, auto_accept: bool) -> TransferConfig {
    TransferConfig {
        chunk_size: 100,
        download_dir: dir.join("downloads"),
        temp_dir: dir.join("partial"),
        auto_accept,
        checkpoint: CheckpointPolicy {
            min_save_interval: Duration::from_millis(50),
            checkpoint_chunks: 4,
            checkpoint_bytes: 400,
            batch_flush_interval: Duration::from_millis(100),
        },
        command_timeout: Duration::from_secs(5),
        ..TransferConfig::default()
    }
}

fn node_config(dir: &Path, auto_accept: bool) -> NodeConfig {
    NodeConfig {
        transfer: transfer_config(dir, auto_accept),
        rpc_timeout: Duration::from_secs(5),
        ..NodeConfig::default()
    }
}

fn sample_content(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

async fn write_source(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
    let path = dir.join(name);
    tokio::fs::write(&path, content).await.unwrap();
    path
}

async fn pair_with_echo(config_a: NodeConfig, config_b: NodeConfig) -> LinkedPair {
    let pair = linked_pair(config_a, config_b).await.unwrap();
    for node in [&pair.a, &pair.b] {
        node.dispatcher()
            .register_fn("system:echo", |_, params| async move { Ok::<_, HandlerError>(params) })
            .await;
    }
    pair
}

// ============================================================================
// Commands and events
// ============================================================================

#[tokio::test]
async fn command_round_trip_between_nodes() {
    let pair = pair_with_echo(NodeConfig::default(), NodeConfig::default()).await;

    let reply: Value = assert_ok!(pair.a.call("system:echo", json!({"text": "hi"})).await);
    assert_eq!(reply, json!({"text": "hi"}));

    // First contact registers the caller as a pending device.
    let devices = pair.b.devices().list().await;
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].identity, pair.a.identity());
    assert_eq!(devices[0].permission_level, PermissionLevel::Authenticated);

    pair.shutdown().await;
}

#[tokio::test]
async fn admin_methods_denied_until_authorized() {
    let pair = pair_with_echo(NodeConfig::default(), NodeConfig::default()).await;
    pair.b
        .dispatcher()
        .register_fn("device:list", |_, _| async { Ok::<_, HandlerError>(json!([])) })
        .await;

    let err = pair.a.call::<Value, _>("device:list", json!({})).await.unwrap_err();
    assert!(matches!(
        err,
        CoreError::Remote {
            code: ErrorCode::PermissionDenied,
            ..
        }
    ));
    assert_eq!(pair.b.dispatcher().stats().snapshot().denied, 1);

    pair.authorize_both(PermissionLevel::Admin).await.unwrap();
    let list: Value = assert_ok!(pair.a.call("device:list", json!({})).await);
    assert_eq!(list, json!([]));

    pair.shutdown().await;
}

#[tokio::test]
async fn audit_trail_reaches_the_store_on_shutdown() {
    let pair = pair_with_echo(NodeConfig::default(), NodeConfig::default()).await;
    let _: Value = pair.a.call("system:echo", json!(1)).await.unwrap();
    let _ = pair.a.call::<Value, _>("system:reboot", json!({})).await;

    pair.shutdown().await;
    let audit = pair.store_b.recent_audit(10).await.unwrap();
    assert!(audit.iter().any(|e| e.method == "system:echo"));
    assert!(audit.iter().any(|e| e.method == "system:reboot" && e.kind.is_denial()));
}

#[tokio::test]
async fn peer_events_are_delivered() {
    let pair = pair_with_echo(NodeConfig::default(), NodeConfig::default()).await;
    let mut events = pair.b.events();

    pair.a.emit("clipboard:changed", json!({"len": 12})).await.unwrap();

    let event = tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap();
    assert_eq!(event.name, "clipboard:changed");
    assert_eq!(event.payload, json!({"len": 12}));

    pair.shutdown().await;
}

// ============================================================================
// Transfers
// ============================================================================

#[tokio::test]
async fn auto_accepted_transfer_completes() {
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();
    let pair = linked_pair(node_config(dir_a.path(), false), node_config(dir_b.path(), true))
        .await
        .unwrap();

    let content = sample_content(1050);
    let source = write_source(dir_a.path(), "report.bin", &content).await;
    let transfer_id = pair.a.transfers().request_upload(&source).await.unwrap();

    wait_for_status(&pair.b, &transfer_id, TransferStatus::Completed).await;
    wait_for_status(&pair.a, &transfer_id, TransferStatus::Completed).await;

    let received = pair.b.transfers().get(&transfer_id).unwrap();
    assert_eq!(received.total_chunks, 11);
    assert_eq!(received.completed_chunks, 11);
    let destination = received.local_path.unwrap();
    assert_eq!(destination, dir_b.path().join("downloads").join("report.bin"));
    assert_eq!(tokio::fs::read(&destination).await.unwrap(), content);

    let sent = pair.a.transfers().get(&transfer_id).unwrap();
    assert_eq!(sent.bytes_transferred, 1050);

    pair.shutdown().await;
    let stored = pair.store_b.load_transfer(&transfer_id).await.unwrap().unwrap();
    assert_eq!(stored.status, TransferStatus::Completed);
}

#[tokio::test]
async fn manual_accept_and_name_collision() {
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();
    tokio::fs::create_dir_all(dir_b.path().join("downloads")).await.unwrap();
    tokio::fs::write(dir_b.path().join("downloads").join("notes.txt"), b"old")
        .await
        .unwrap();

    let pair = linked_pair(node_config(dir_a.path(), false), node_config(dir_b.path(), false))
        .await
        .unwrap();
    let source = write_source(dir_a.path(), "notes.txt", b"fresh notes").await;
    let transfer_id = pair.a.transfers().request_upload(&source).await.unwrap();

    wait_for_status(&pair.b, &transfer_id, TransferStatus::Requesting).await;
    pair.b.transfers().accept_transfer(&transfer_id).await.unwrap();
    wait_for_status(&pair.b, &transfer_id, TransferStatus::Completed).await;

    let destination = pair.b.transfers().get(&transfer_id).unwrap().local_path.unwrap();
    assert_eq!(destination, dir_b.path().join("downloads").join("notes (1).txt"));
    assert_eq!(tokio::fs::read(&destination).await.unwrap(), b"fresh notes");

    pair.shutdown().await;
}

#[tokio::test]
async fn rejected_transfer_is_terminal_on_both_sides() {
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();
    let pair = linked_pair(node_config(dir_a.path(), false), node_config(dir_b.path(), false))
        .await
        .unwrap();
    let source = write_source(dir_a.path(), "unwanted.bin", &sample_content(300)).await;
    let transfer_id = pair.a.transfers().request_upload(&source).await.unwrap();

    wait_for_status(&pair.b, &transfer_id, TransferStatus::Requesting).await;
    pair.b.transfers().reject_transfer(&transfer_id).await.unwrap();

    wait_for_status(&pair.a, &transfer_id, TransferStatus::Rejected).await;
    assert_eq!(
        pair.b.transfers().get(&transfer_id).unwrap().status,
        TransferStatus::Rejected
    );
    assert!(pair.a.transfers().accept_transfer(&transfer_id).await.is_err());
    assert_eq!(pair.a.transfers().active_tasks(), 0);

    pair.shutdown().await;
}

#[tokio::test]
async fn cancelled_transfer_can_be_retried() {
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();
    let pair = linked_pair(node_config(dir_a.path(), false), node_config(dir_b.path(), false))
        .await
        .unwrap();
    let content = sample_content(500);
    let source = write_source(dir_a.path(), "again.bin", &content).await;
    let transfer_id = pair.a.transfers().request_upload(&source).await.unwrap();
    wait_for_status(&pair.b, &transfer_id, TransferStatus::Requesting).await;

    pair.a.transfers().cancel_transfer(&transfer_id).await.unwrap();
    wait_for_status(&pair.b, &transfer_id, TransferStatus::Cancelled).await;
    assert!(pair.a.transfers().get(&transfer_id).unwrap().is_retry_eligible());

    // The receiver treats the retried request as a fresh offer.
    pair.a.transfers().retry_transfer(&transfer_id).await.unwrap();
    wait_for_status(&pair.b, &transfer_id, TransferStatus::Requesting).await;
    pair.b.transfers().accept_transfer(&transfer_id).await.unwrap();
    wait_for_status(&pair.b, &transfer_id, TransferStatus::Completed).await;

    let destination = pair.b.transfers().get(&transfer_id).unwrap().local_path.unwrap();
    assert_eq!(tokio::fs::read(&destination).await.unwrap(), content);

    pair.shutdown().await;
}

#[tokio::test]
async fn failed_upload_reaches_receiver_and_can_be_retried() {
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();
    let pair = linked_pair(node_config(dir_a.path(), false), node_config(dir_b.path(), false))
        .await
        .unwrap();
    let content = sample_content(500);
    let source = write_source(dir_a.path(), "vanishing.bin", &content).await;
    let transfer_id = pair.a.transfers().request_upload(&source).await.unwrap();
    wait_for_status(&pair.b, &transfer_id, TransferStatus::Requesting).await;

    // The source goes away before the receiver says yes.
    tokio::fs::remove_file(&source).await.unwrap();
    pair.b.transfers().accept_transfer(&transfer_id).await.unwrap();

    wait_for_status(&pair.a, &transfer_id, TransferStatus::Failed).await;
    wait_for_status(&pair.b, &transfer_id, TransferStatus::Failed).await;
    let inbound = pair.b.transfers().get(&transfer_id).unwrap();
    assert!(inbound.error.is_some());
    assert!(!inbound.temp_path.unwrap().exists());
    assert!(pair.a.transfers().get(&transfer_id).unwrap().is_retry_eligible());

    tokio::fs::write(&source, &content).await.unwrap();
    pair.a.transfers().retry_transfer(&transfer_id).await.unwrap();
    wait_for_status(&pair.b, &transfer_id, TransferStatus::Requesting).await;
    pair.b.transfers().accept_transfer(&transfer_id).await.unwrap();
    wait_for_status(&pair.a, &transfer_id, TransferStatus::Completed).await;
    wait_for_status(&pair.b, &transfer_id, TransferStatus::Completed).await;

    let destination = pair.b.transfers().get(&transfer_id).unwrap().local_path.unwrap();
    assert_eq!(tokio::fs::read(&destination).await.unwrap(), content);

    pair.shutdown().await;
}

/// Seeds both stores as if a transfer had been interrupted after three of
/// ten chunks, then restarts both nodes and resumes.
#[tokio::test]
async fn interrupted_transfer_resumes_after_restart() {
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();
    let content = sample_content(1000);
    let source = write_source(dir_a.path(), "resume.bin", &content).await;
    let checksum = sha256_file(&source).await.unwrap();

    let partial_dir = dir_b.path().join("partial");
    tokio::fs::create_dir_all(&partial_dir).await.unwrap();
    let partial = partial_dir.join("t-resume.part");
    tokio::fs::write(&partial, &content[..300]).await.unwrap();

    let signer_a = Arc::new(Ed25519Signer::generate());
    let signer_b = Arc::new(Ed25519Signer::generate());

    let base = |direction: TransferDirection, peer: String| {
        let now = Utc::now();
        TransferRecord {
            transfer_id: "t-resume".into(),
            peer_id: peer,
            file_name: "resume.bin".into(),
            file_size: 1000,
            chunk_size: 100,
            total_chunks: 10,
            completed_chunks: 3,
            bytes_transferred: 300,
            status: TransferStatus::Transferring,
            checksum: checksum.clone(),
            direction,
            local_path: None,
            temp_path: None,
            retry_count: 0,
            retryable: direction == TransferDirection::Outbound,
            error: None,
            created_at: now,
            updated_at: now,
        }
    };
    let store_a = Arc::new(InMemoryStore::new());
    let store_b = Arc::new(InMemoryStore::new());
    store_a
        .save_transfer(&TransferRecord {
            local_path: Some(source.clone()),
            ..base(TransferDirection::Outbound, signer_b.identity())
        })
        .await
        .unwrap();
    store_b
        .save_transfer(&TransferRecord {
            temp_path: Some(partial.clone()),
            ..base(TransferDirection::Inbound, signer_a.identity())
        })
        .await
        .unwrap();

    let (ta, tb) = LoopbackTransport::pair();
    let a = PeerNode::new(
        Arc::new(ta),
        signer_a.clone(),
        Arc::new(Ed25519Verifier),
        store_a.clone(),
        node_config(dir_a.path(), false),
    );
    let b = PeerNode::new(
        Arc::new(tb),
        signer_b.clone(),
        Arc::new(Ed25519Verifier),
        store_b.clone(),
        node_config(dir_b.path(), false),
    );

    let recovered = a.start().await.unwrap();
    assert_eq!(recovered.len(), 1);
    assert_eq!(recovered[0].status, TransferStatus::Paused);
    assert!(recovered[0].can_resume());
    let recovered = b.start().await.unwrap();
    assert_eq!(recovered[0].status, TransferStatus::Paused);
    assert!(recovered[0].can_resume());

    a.connect(signer_b.identity()).await.unwrap();
    b.connect(signer_a.identity()).await.unwrap();

    let mut progress = b.transfers().progress_stream();
    a.transfers().resume_transfer("t-resume").await.unwrap();
    wait_for_status(&b, "t-resume", TransferStatus::Completed).await;

    // Reception restarted at chunk three, never from zero.
    let mut first_seen = None;
    while let Ok(update) = progress.try_recv() {
        if update.status == TransferStatus::Transferring && first_seen.is_none() {
            first_seen = Some(update.completed_chunks);
        }
    }
    assert_eq!(first_seen, Some(3));

    let destination = b.transfers().get("t-resume").unwrap().local_path.unwrap();
    assert_eq!(tokio::fs::read(&destination).await.unwrap(), content);
    wait_for_status(&a, "t-resume", TransferStatus::Completed).await;

    a.shutdown().await;
    b.shutdown().await;
}

// ============================================================================
// Link loss
// ============================================================================

fn fast_reconnect(dir: &Path) -> NodeConfig {
    NodeConfig {
        connection: ConnectionConfig {
            reconnection: ReconnectionPolicy {
                base_delay: Duration::from_millis(20),
                max_delay: Duration::from_millis(100),
                backoff_factor: 2.0,
                max_attempts: 100,
            },
            ..ConnectionConfig::default()
        },
        ..node_config(dir, true)
    }
}

#[tokio::test]
async fn severed_link_reconnects_and_commands_flow_again() {
    let dir = TempDir::new().unwrap();
    let pair = pair_with_echo(fast_reconnect(dir.path()), fast_reconnect(dir.path())).await;

    pair.sever();
    wait_for("both sides to notice", || async {
        pair.a.connection().state() != ConnectionState::Connected
            && pair.b.connection().state() != ConnectionState::Connected
    })
    .await;
    assert!(matches!(
        pair.a.call::<Value, _>("system:echo", json!(1)).await,
        Err(CoreError::NotConnected)
    ));

    pair.heal();
    wait_for("both sides to reconnect", || async {
        pair.a.connection().is_connected() && pair.b.connection().is_connected()
    })
    .await;

    let mut reply = None;
    for _ in 0..50 {
        match pair.a.call::<Value, _>("system:echo", json!("back")).await {
            Ok(value) => {
                reply = Some(value);
                break;
            }
            Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
        }
    }
    assert_eq!(reply, Some(json!("back")));
    assert!(pair.a.connection().stats().reconnects >= 1);

    pair.shutdown().await;
}

#[tokio::test]
async fn link_loss_pauses_running_transfers() {
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();
    let pair = linked_pair(node_config(dir_a.path(), false), node_config(dir_b.path(), false))
        .await
        .unwrap();
    let source = write_source(dir_a.path(), "big.bin", &sample_content(2_000_000)).await;
    let transfer_id = pair.a.transfers().request_upload(&source).await.unwrap();
    wait_for_status(&pair.b, &transfer_id, TransferStatus::Requesting).await;

    // Cut the link once the first chunks have landed.
    pair.b.transfers().accept_transfer(&transfer_id).await.unwrap();
    wait_for("first chunks", || async {
        pair.b
            .transfers()
            .get(&transfer_id)
            .is_some_and(|r| r.completed_chunks > 0)
    })
    .await;
    pair.sever();

    wait_for_status(&pair.b, &transfer_id, TransferStatus::Paused).await;
    wait_for_status(&pair.a, &transfer_id, TransferStatus::Paused).await;
    assert_eq!(pair.a.transfers().active_tasks(), 0);

    let stored = pair.store_b.load_transfer(&transfer_id).await.unwrap().unwrap();
    assert_eq!(stored.status, TransferStatus::Paused);

    pair.shutdown().await;
}
