//! Connection and RPC flows against a scripted transport.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde_json::json;
use tokio::sync::broadcast;
use tokio::time::Instant;

use zlink_core::{
    CommandResponse, ConnectionConfig, ConnectionEvent, ConnectionManager, CoreError, ReconnectEvent, RpcCorrelator,
    WireMessage,
};
use zlink_security::Ed25519Signer;
use zlink_transport::{ConnectionState, MockTransport, PeerId};

fn setup(config: ConnectionConfig) -> (Arc<MockTransport>, Arc<ConnectionManager>, RpcCorrelator) {
    let transport = Arc::new(MockTransport::new());
    let connection = ConnectionManager::new(transport.clone(), config);
    let rpc = RpcCorrelator::new(connection.clone(), Arc::new(Ed25519Signer::generate()));
    (transport, connection, rpc)
}

/// Answer every command with a response carrying the same id and params.
fn echo_responder(data: &Bytes) -> Vec<Bytes> {
    match WireMessage::decode(data) {
        Ok(WireMessage::Command(cmd)) => {
            let response = WireMessage::Response(CommandResponse::ok(cmd.id, cmd.params));
            response.encode().map(|b| vec![b]).unwrap_or_default()
        }
        _ => Vec::new(),
    }
}

async fn next_reconnect(events: &mut broadcast::Receiver<ConnectionEvent>) -> ReconnectEvent {
    loop {
        match events.recv().await.unwrap() {
            ConnectionEvent::Reconnect(event) => return event,
            _ => continue,
        }
    }
}

#[tokio::test]
async fn echo_resolves_before_timeout() {
    let (transport, connection, rpc) = setup(ConnectionConfig::default());
    transport.set_responder(Box::new(echo_responder));
    connection
        .connect(PeerId::new("peerA"), PeerId::new("didA"))
        .await
        .unwrap();

    let value = rpc
        .send_command_raw("echo", json!({}), Some(Duration::from_millis(5000)))
        .await
        .unwrap();
    assert_eq!(value, json!({}));
    assert!(connection.pending().is_empty());

    let sent = transport.sent();
    let WireMessage::Command(cmd) = WireMessage::decode(&sent[0]).unwrap() else {
        panic!("expected a command");
    };
    assert_eq!(cmd.method, "echo");
    let auth = cmd.auth.expect("commands are signed");
    assert!(auth.identity.starts_with("ed25519:"));
}

#[tokio::test]
async fn typed_send_command_deserializes_result() {
    let (transport, connection, rpc) = setup(ConnectionConfig::default());
    transport.set_responder(Box::new(echo_responder));
    connection.connect(PeerId::new("p"), PeerId::new("me")).await.unwrap();

    let numbers: Vec<u32> = rpc.send_command("echo", vec![1u32, 2, 3], None).await.unwrap();
    assert_eq!(numbers, vec![1, 2, 3]);
}

#[tokio::test(start_paused = true)]
async fn unanswered_command_times_out() {
    let (transport, connection, rpc) = setup(ConnectionConfig::default());
    connection
        .connect(PeerId::new("peerA"), PeerId::new("didA"))
        .await
        .unwrap();

    let started = Instant::now();
    let result = rpc
        .send_command_raw("echo", json!({}), Some(Duration::from_millis(5000)))
        .await;
    let elapsed = started.elapsed();

    assert!(matches!(result, Err(CoreError::Timeout { .. })));
    assert!(elapsed >= Duration::from_millis(5000));
    assert!(elapsed < Duration::from_millis(5100));
    assert!(connection.pending().is_empty());

    // A late response for the timed-out request is dropped silently.
    let WireMessage::Command(cmd) = WireMessage::decode(&transport.sent()[0]).unwrap() else {
        panic!("expected a command");
    };
    let late = WireMessage::Response(CommandResponse::ok(cmd.id, json!("late")));
    assert!(transport.inject(late.encode().unwrap()));
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(connection.pending().is_empty());
    assert!(connection.is_connected());
}

#[tokio::test]
async fn remote_error_is_typed() {
    let (transport, connection, rpc) = setup(ConnectionConfig::default());
    transport.set_responder(Box::new(|data: &Bytes| match WireMessage::decode(data) {
        Ok(WireMessage::Command(cmd)) => {
            let err = CoreError::PermissionDenied {
                method: cmd.method.clone(),
                required: zlink_security::PermissionLevel::Admin,
                actual: zlink_security::PermissionLevel::Authenticated,
            };
            vec![WireMessage::Response(CommandResponse::err(cmd.id, &err)).encode().unwrap()]
        }
        _ => Vec::new(),
    }));
    connection.connect(PeerId::new("p"), PeerId::new("me")).await.unwrap();

    let err = rpc.send_command_raw("device:list", json!({}), None).await.unwrap_err();
    assert!(matches!(
        err,
        CoreError::Remote {
            code: zlink_core::ErrorCode::PermissionDenied,
            ..
        }
    ));
}

#[tokio::test]
async fn send_fails_fast_when_not_connected() {
    let (_, _, rpc) = setup(ConnectionConfig::default());
    let result = rpc.send_command_raw("echo", json!({}), None).await;
    assert!(matches!(result, Err(CoreError::NotConnected)));
}

#[tokio::test(start_paused = true)]
async fn reconnect_backoff_sequence_until_terminal() {
    let (transport, connection, _) = setup(ConnectionConfig::default());
    connection.connect(PeerId::new("p"), PeerId::new("me")).await.unwrap();
    let mut events = connection.events();

    transport.fail_all_connects(true);
    transport.drop_link("network gone");

    let mut delays = Vec::new();
    let terminal = loop {
        match next_reconnect(&mut events).await {
            ReconnectEvent::Scheduled { delay, max_attempts, .. } => {
                assert_eq!(max_attempts, 10);
                delays.push(delay.as_millis() as u64);
            }
            ReconnectEvent::Failed { terminal: true, attempt, .. } => break attempt,
            ReconnectEvent::Failed { terminal: false, .. } | ReconnectEvent::Attempting { .. } => {}
            ReconnectEvent::Success { .. } => panic!("no connect should succeed"),
        }
    };

    assert_eq!(
        delays,
        vec![1000, 2000, 4000, 8000, 16000, 32000, 60000, 60000, 60000, 60000]
    );
    assert_eq!(terminal, 10);
    assert_eq!(connection.state(), ConnectionState::Error);

    // No eleventh attempt is ever scheduled.
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(transport.connect_calls(), 11);
}

#[tokio::test(start_paused = true)]
async fn successful_reconnect_resets_backoff() {
    let (transport, connection, _) = setup(ConnectionConfig::default());
    connection.connect(PeerId::new("p"), PeerId::new("me")).await.unwrap();
    let mut events = connection.events();

    transport.push_connect_result(Err("still down".into()));
    transport.drop_link("blip");

    let success = loop {
        if let ReconnectEvent::Success { attempt } = next_reconnect(&mut events).await {
            break attempt;
        }
    };
    assert_eq!(success, 2);
    assert_eq!(connection.state(), ConnectionState::Connected);
    assert_eq!(connection.reconnect_attempts(), 0);
    assert_eq!(connection.stats().reconnects, 1);

    // The next loss starts again from the base delay.
    transport.drop_link("blip again");
    let delay = loop {
        if let ReconnectEvent::Scheduled { delay, .. } = next_reconnect(&mut events).await {
            break delay;
        }
    };
    assert_eq!(delay, Duration::from_millis(1000));
}

#[tokio::test(start_paused = true)]
async fn silent_link_fires_one_heartbeat_timeout() {
    let (transport, connection, _) = setup(ConnectionConfig::default());
    connection.connect(PeerId::new("p"), PeerId::new("me")).await.unwrap();
    let mut events = connection.events();

    tokio::time::sleep(Duration::from_secs(60)).await;

    let mut timeouts = 0;
    let mut reconnect_started = false;
    while let Ok(event) = events.try_recv() {
        match event {
            ConnectionEvent::HeartbeatTimeout { elapsed } => {
                assert!(elapsed > Duration::from_secs(45));
                timeouts += 1;
            }
            ConnectionEvent::Reconnect(ReconnectEvent::Scheduled { .. }) => reconnect_started = true,
            _ => {}
        }
    }
    assert_eq!(timeouts, 1);
    assert!(reconnect_started);
    assert!(transport.connect_calls() >= 2);
}

#[tokio::test(start_paused = true)]
async fn heartbeat_acks_keep_link_alive() {
    let (transport, connection, _) = setup(ConnectionConfig::default());
    transport.set_responder(Box::new(|data: &Bytes| match WireMessage::decode(data) {
        Ok(WireMessage::Heartbeat { timestamp }) => {
            vec![WireMessage::HeartbeatAck { timestamp }.encode().unwrap()]
        }
        _ => Vec::new(),
    }));
    connection.connect(PeerId::new("p"), PeerId::new("me")).await.unwrap();
    let mut events = connection.events();

    tokio::time::sleep(Duration::from_secs(180)).await;

    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, ConnectionEvent::HeartbeatTimeout { .. }));
    }
    assert_eq!(connection.state(), ConnectionState::Connected);
    assert_eq!(transport.connect_calls(), 1);
}

#[tokio::test]
async fn explicit_disconnect_fails_pending_and_stops_reconnect() {
    let (transport, connection, rpc) = setup(ConnectionConfig::default());
    connection.connect(PeerId::new("p"), PeerId::new("me")).await.unwrap();
    let rpc = Arc::new(rpc);

    let call = {
        let rpc = rpc.clone();
        tokio::spawn(async move { rpc.send_command_raw("slow", json!({}), None).await })
    };
    while connection.pending().is_empty() {
        tokio::task::yield_now().await;
    }
    connection.disconnect().await;

    let result = call.await.unwrap();
    assert!(matches!(result, Err(CoreError::Transport(_))));
    assert_eq!(connection.state(), ConnectionState::Disconnected);
    assert!(!connection.auto_reconnect());
    assert_eq!(transport.connect_calls(), 1);
}
