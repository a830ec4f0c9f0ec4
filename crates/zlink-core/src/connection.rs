//! Connection lifecycle: state machine, reconnection and heartbeats.
//!
//! The manager owns the transport handle. A successful connect starts three
//! link tasks under a per-link cancellation token: the receive loop, the
//! heartbeat sender and the heartbeat-timeout monitor. Losing the link
//! cancels them, fails every pending request and, when auto-reconnect is on,
//! starts a reconnection task driven by the capped exponential backoff.
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Reconnecting -> Connected
//!                                                 \-> Error (attempts exhausted)
//! any state -> Disconnected (explicit disconnect)
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use zlink_transport::{
    Backoff, ConnectionState, ConnectionStats, LinkReceiver, PeerId, ReconnectionPolicy, StatsTracker, Transport,
    TransportError, TransportEvent,
};

use crate::errors::CoreError;
use crate::messages::WireMessage;
use crate::rpc::PendingRequests;

const EVENT_CAPACITY: usize = 256;

// ============================================================================
// Configuration and Events
// ============================================================================

/// Connection manager settings.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub reconnection: ReconnectionPolicy,
    pub auto_reconnect: bool,
    /// Interval between outgoing heartbeats
    pub heartbeat_interval: Duration,
    /// Silence after which the link is considered dead
    pub heartbeat_timeout: Duration,
    /// How often the monitor checks for silence
    pub monitor_interval: Duration,
    /// Queue depth for inbound application messages
    pub inbound_buffer: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            reconnection: ReconnectionPolicy::default(),
            auto_reconnect: true,
            heartbeat_interval: Duration::from_secs(15),
            heartbeat_timeout: Duration::from_secs(45),
            monitor_interval: Duration::from_secs(1),
            inbound_buffer: 256,
        }
    }
}

/// Reconnection lifecycle, for "reconnecting (attempt N/max)" displays.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconnectEvent {
    Scheduled {
        attempt: u32,
        max_attempts: u32,
        delay: Duration,
    },
    Attempting {
        attempt: u32,
    },
    Success {
        attempt: u32,
    },
    Failed {
        attempt: u32,
        error: String,
        terminal: bool,
    },
}

/// Observable connection events.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    StateChanged(ConnectionState),
    Reconnect(ReconnectEvent),
    HeartbeatTimeout { elapsed: Duration },
}

/// The currently connected peer.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub local_id: PeerId,
    pub connected_at: DateTime<Utc>,
}

// ============================================================================
// Connection Manager
// ============================================================================

/// Owns one logical command channel to one peer.
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    config: ConnectionConfig,
    state_tx: watch::Sender<ConnectionState>,
    events_tx: broadcast::Sender<ConnectionEvent>,
    peer: Mutex<Option<PeerInfo>>,
    target: Mutex<Option<(PeerId, PeerId)>>,
    auto_reconnect: AtomicBool,
    backoff: Mutex<Backoff>,
    root: CancellationToken,
    link_token: Mutex<CancellationToken>,
    reconnect_token: Mutex<Option<CancellationToken>>,
    generation: AtomicU64,
    last_heartbeat: Mutex<Instant>,
    pending: Arc<PendingRequests>,
    inbound_tx: mpsc::Sender<WireMessage>,
    inbound_rx: Mutex<Option<mpsc::Receiver<WireMessage>>>,
    send_lock: tokio::sync::Mutex<()>,
    stats: StatsTracker,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>, config: ConnectionConfig) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_buffer.max(1));
        let root = CancellationToken::new();

        Arc::new(Self {
            transport,
            backoff: Mutex::new(config.reconnection.backoff()),
            auto_reconnect: AtomicBool::new(config.auto_reconnect),
            config,
            state_tx,
            events_tx,
            peer: Mutex::new(None),
            target: Mutex::new(None),
            link_token: Mutex::new(root.child_token()),
            root,
            reconnect_token: Mutex::new(None),
            generation: AtomicU64::new(0),
            last_heartbeat: Mutex::new(Instant::now()),
            pending: Arc::new(PendingRequests::new()),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            send_lock: tokio::sync::Mutex::new(()),
            stats: StatsTracker::new(),
        })
    }

    // ------------------------------------------------------------------------
    // Observation
    // ------------------------------------------------------------------------

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Current state plus every later change.
    pub fn state_stream(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events_tx.subscribe()
    }

    pub fn peer_info(&self) -> Option<PeerInfo> {
        self.peer.lock().clone()
    }

    pub fn stats(&self) -> ConnectionStats {
        self.stats.snapshot()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn pending(&self) -> &Arc<PendingRequests> {
        &self.pending
    }

    /// Inbound commands, events and chunks. Can be taken once.
    pub fn take_inbound(&self) -> Option<mpsc::Receiver<WireMessage>> {
        self.inbound_rx.lock().take()
    }

    pub fn auto_reconnect(&self) -> bool {
        self.auto_reconnect.load(Ordering::SeqCst)
    }

    pub fn set_auto_reconnect(&self, enabled: bool) {
        self.auto_reconnect.store(enabled, Ordering::SeqCst);
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.backoff.lock().attempts()
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Connect to `peer`, identifying as `local`.
    pub async fn connect(self: &Arc<Self>, peer: PeerId, local: PeerId) -> Result<(), CoreError> {
        if self.state() == ConnectionState::Connected {
            debug!(peer = %peer, "already connected, dropping current link first");
            self.teardown_link().await;
        }
        self.cancel_reconnect();

        self.set_auto_reconnect(self.config.auto_reconnect);
        *self.target.lock() = Some((peer.clone(), local.clone()));
        self.set_state(ConnectionState::Connecting);
        info!(peer = %peer, local = %local, "connecting");

        match self.transport.connect(&peer, &local).await {
            Ok(link) => {
                if self.state() != ConnectionState::Connecting {
                    // Disconnected while the transport was connecting
                    let _ = self.transport.disconnect().await;
                    return Err(CoreError::Cancelled);
                }
                self.on_link_established(peer, local, link);
                Ok(())
            }
            Err(e) => {
                warn!(peer = %peer, error = %e, "connect failed");
                self.set_state(ConnectionState::Error);
                Err(e.into())
            }
        }
    }

    /// Close the link and forget the peer. No reconnection follows.
    pub async fn disconnect(&self) {
        self.set_auto_reconnect(false);
        self.cancel_reconnect();
        self.teardown_link().await;
        *self.target.lock() = None;
        self.set_state(ConnectionState::Disconnected);
        info!("disconnected");
    }

    /// Close the link but keep the target; reconnects if auto-reconnect is on.
    pub async fn disconnect_temporary(self: &Arc<Self>) {
        self.cancel_reconnect();
        self.teardown_link().await;
        self.set_state(ConnectionState::Disconnected);

        if self.auto_reconnect() && self.target.lock().is_some() {
            self.schedule_reconnect();
        }
    }

    /// React to the link being lost.
    ///
    /// Only acts while Connected or Connecting, so late transport events after
    /// an explicit disconnect or during reconnection are ignored.
    pub async fn handle_disconnection(self: &Arc<Self>, reason: &str) {
        let generation = self.generation.load(Ordering::SeqCst);
        self.handle_disconnection_for(generation, reason).await;
    }

    /// Stop everything permanently.
    pub async fn shutdown(&self) {
        self.disconnect().await;
        self.root.cancel();
    }

    async fn handle_disconnection_for(self: &Arc<Self>, generation: u64, reason: &str) {
        if generation != self.generation.load(Ordering::SeqCst) {
            debug!(reason = %reason, "ignoring disconnect from a stale link");
            return;
        }

        let mut previous = ConnectionState::Disconnected;
        let changed = self.state_tx.send_if_modified(|state| match *state {
            ConnectionState::Connected | ConnectionState::Connecting => {
                previous = *state;
                *state = ConnectionState::Disconnected;
                true
            }
            _ => false,
        });
        if !changed {
            debug!(reason = %reason, "disconnect ignored in state {}", self.state());
            return;
        }

        warn!(reason = %reason, "connection lost");
        self.after_transition(previous, ConnectionState::Disconnected);
        self.teardown_link().await;

        if self.auto_reconnect() && self.target.lock().is_some() {
            self.schedule_reconnect();
        }
    }

    // ------------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------------

    /// Send one message. Sends are serialized per connection.
    pub async fn send_message(&self, message: &WireMessage) -> Result<(), CoreError> {
        let data = message.encode()?;
        self.send_bytes(data).await
    }

    async fn send_bytes(&self, data: Bytes) -> Result<(), CoreError> {
        let _guard = self.send_lock.lock().await;
        if !self.is_connected() {
            return Err(CoreError::NotConnected);
        }
        let len = data.len();
        self.transport.send(data).await?;
        self.stats.record_sent(len);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // State transitions
    // ------------------------------------------------------------------------

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state_tx.send_replace(next);
        if previous != next {
            self.after_transition(previous, next);
        }
    }

    fn after_transition(&self, previous: ConnectionState, next: ConnectionState) {
        debug!(from = %previous, to = %next, "connection state changed");
        if previous == ConnectionState::Connected && next != ConnectionState::Connected {
            let failed = self
                .pending
                .fail_all(CoreError::Transport(TransportError::ConnectionClosed));
            if failed > 0 {
                debug!(failed, "failed pending requests on connection loss");
            }
        }
        self.emit(ConnectionEvent::StateChanged(next));
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events_tx.send(event);
    }

    fn on_link_established(self: &Arc<Self>, peer: PeerId, local: PeerId, link: LinkReceiver) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let token = self.root.child_token();
        *self.link_token.lock() = token.clone();

        *self.peer.lock() = Some(PeerInfo {
            peer_id: peer.clone(),
            local_id: local,
            connected_at: Utc::now(),
        });
        self.backoff.lock().reset();
        self.touch_heartbeat();
        self.stats.mark_connected();
        self.set_state(ConnectionState::Connected);
        info!(peer = %peer, generation, "connected");

        let this = self.clone();
        let t = token.clone();
        tokio::spawn(async move { this.receive_loop(generation, link, t).await });

        let this = self.clone();
        let t = token.clone();
        tokio::spawn(async move { this.heartbeat_loop(t).await });

        let this = self.clone();
        tokio::spawn(async move { this.monitor_loop(generation, token).await });
    }

    async fn teardown_link(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.link_token.lock().cancel();
        if let Err(e) = self.transport.disconnect().await {
            debug!(error = %e, "transport disconnect failed");
        }
        self.pending
            .fail_all(CoreError::Transport(TransportError::ConnectionClosed));
        *self.peer.lock() = None;
        self.stats.mark_disconnected();
    }

    // ------------------------------------------------------------------------
    // Reconnection
    // ------------------------------------------------------------------------

    fn cancel_reconnect(&self) {
        if let Some(token) = self.reconnect_token.lock().take() {
            token.cancel();
        }
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        let token = self.root.child_token();
        if let Some(previous) = self.reconnect_token.lock().replace(token.clone()) {
            previous.cancel();
        }
        let this = self.clone();
        tokio::spawn(async move { this.reconnect_loop(token).await });
    }

    async fn reconnect_loop(self: Arc<Self>, token: CancellationToken) {
        loop {
            let next = self.backoff.lock().next_attempt();
            let Some((attempt, delay)) = next else {
                self.give_up(self.backoff.lock().attempts(), "max reconnection attempts reached".into());
                return;
            };
            let Some((peer, local)) = self.target.lock().clone() else {
                return;
            };
            let max_attempts = self.config.reconnection.max_attempts;

            self.set_state(ConnectionState::Reconnecting);
            info!(peer = %peer, attempt, max_attempts, delay_ms = delay.as_millis() as u64, "reconnect scheduled");
            self.emit(ConnectionEvent::Reconnect(ReconnectEvent::Scheduled {
                attempt,
                max_attempts,
                delay,
            }));

            tokio::select! {
                biased;
                _ = token.cancelled() => return,
                _ = sleep(delay) => {}
            }

            self.emit(ConnectionEvent::Reconnect(ReconnectEvent::Attempting { attempt }));
            let result = tokio::select! {
                biased;
                _ = token.cancelled() => return,
                result = self.transport.connect(&peer, &local) => result,
            };

            match result {
                Ok(link) => {
                    if token.is_cancelled() {
                        let _ = self.transport.disconnect().await;
                        return;
                    }
                    self.stats.record_reconnect();
                    self.on_link_established(peer, local, link);
                    self.emit(ConnectionEvent::Reconnect(ReconnectEvent::Success { attempt }));
                    self.reconnect_token.lock().take();
                    return;
                }
                Err(e) => {
                    let exhausted = self.backoff.lock().is_exhausted();
                    if exhausted {
                        self.give_up(attempt, e.to_string());
                        return;
                    }
                    warn!(peer = %peer, attempt, error = %e, "reconnect attempt failed");
                    self.emit(ConnectionEvent::Reconnect(ReconnectEvent::Failed {
                        attempt,
                        error: e.to_string(),
                        terminal: false,
                    }));
                }
            }
        }
    }

    fn give_up(&self, attempt: u32, error: String) {
        warn!(attempt, error = %error, "reconnection attempts exhausted");
        self.emit(ConnectionEvent::Reconnect(ReconnectEvent::Failed {
            attempt,
            error,
            terminal: true,
        }));
        self.set_state(ConnectionState::Error);
        self.reconnect_token.lock().take();
    }

    // ------------------------------------------------------------------------
    // Link tasks
    // ------------------------------------------------------------------------

    async fn receive_loop(self: Arc<Self>, generation: u64, mut link: LinkReceiver, token: CancellationToken) {
        loop {
            let event = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                event = link.recv() => event,
            };

            match event {
                Some(TransportEvent::Message(data)) => {
                    self.stats.record_received(data.len());
                    self.handle_incoming(&data).await;
                }
                Some(TransportEvent::Disconnected { reason }) => {
                    self.handle_disconnection_for(generation, &reason).await;
                    break;
                }
                None => {
                    self.handle_disconnection_for(generation, "link closed").await;
                    break;
                }
            }
        }
        debug!(generation, "receive loop stopped");
    }

    async fn handle_incoming(&self, data: &[u8]) {
        let message = match WireMessage::decode(data) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, len = data.len(), "dropping undecodable message");
                return;
            }
        };

        match message {
            WireMessage::Heartbeat { .. } => {
                self.touch_heartbeat();
                let ack = WireMessage::HeartbeatAck {
                    timestamp: Utc::now().timestamp_millis(),
                };
                if let Err(e) = self.send_message(&ack).await {
                    debug!(error = %e, "failed to acknowledge heartbeat");
                }
            }
            WireMessage::HeartbeatAck { .. } => self.touch_heartbeat(),
            WireMessage::Response(response) => {
                let id = response.id.clone();
                if !self.pending.complete(response) {
                    debug!(request_id = %id, "dropping response with no pending request");
                }
            }
            other => {
                if self.inbound_tx.send(other).await.is_err() {
                    debug!("inbound consumer gone, dropping message");
                }
            }
        }
    }

    async fn heartbeat_loop(self: Arc<Self>, token: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = sleep(self.config.heartbeat_interval) => {}
            }
            if token.is_cancelled() || !self.is_connected() {
                break;
            }
            let beat = WireMessage::Heartbeat {
                timestamp: Utc::now().timestamp_millis(),
            };
            if let Err(e) = self.send_message(&beat).await {
                debug!(error = %e, "heartbeat send failed");
            }
        }
    }

    async fn monitor_loop(self: Arc<Self>, generation: u64, token: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = sleep(self.config.monitor_interval) => {}
            }
            let elapsed = self.last_heartbeat.lock().elapsed();
            if elapsed > self.config.heartbeat_timeout {
                warn!(elapsed_ms = elapsed.as_millis() as u64, "heartbeat timeout");
                self.emit(ConnectionEvent::HeartbeatTimeout { elapsed });
                self.handle_disconnection_for(generation, "heartbeat timeout").await;
                break;
            }
        }
    }

    fn touch_heartbeat(&self) {
        *self.last_heartbeat.lock() = Instant::now();
    }
}
