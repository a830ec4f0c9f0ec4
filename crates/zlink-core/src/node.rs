//! One end of a pairing, with every runtime component wired together.
//!
//! `PeerNode` owns the connection, the RPC correlator, the dispatcher, the
//! device registry and the transfer coordinator, and runs the background
//! tasks that connect them:
//!
//! - inbound loop: commands to the dispatcher, chunks to transfers, events
//!   to the event stream
//! - audit flusher
//! - progress flusher
//! - connection watcher: pauses transfers when the link drops
//!
//! All of them stop when [`PeerNode::shutdown`] cancels the node token.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use zlink_security::{AuthConfig, SignatureVerifier, Signer};
use zlink_transport::{ConnectionState, PeerId, Transport};

use crate::connection::{ConnectionConfig, ConnectionManager};
use crate::devices::DeviceRegistry;
use crate::dispatch::{Dispatcher, GatewayConfig, HandlerError};
use crate::errors::CoreError;
use crate::messages::{PeerEvent, WireMessage};
use crate::rpc::{RpcCorrelator, DEFAULT_RPC_TIMEOUT};
use crate::store::Store;
use crate::transfer::{TransferConfig, TransferCoordinator, TransferRecord};

const PEER_EVENT_CAPACITY: usize = 256;

/// Control commands routed to the transfer coordinator.
pub const TRANSFER_METHODS: &[&str] = &[
    "transfer:request",
    "transfer:accept",
    "transfer:reject",
    "transfer:pause",
    "transfer:resume",
    "transfer:cancel",
    "transfer:complete",
    "transfer:fail",
];

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub connection: ConnectionConfig,
    pub auth: AuthConfig,
    pub gateway: GatewayConfig,
    pub transfer: TransferConfig,
    /// Default timeout for outgoing commands
    pub rpc_timeout: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            auth: AuthConfig::default(),
            gateway: GatewayConfig::default(),
            transfer: TransferConfig::default(),
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
        }
    }
}

pub struct PeerNode {
    signer: Arc<dyn Signer>,
    store: Arc<dyn Store>,
    connection: Arc<ConnectionManager>,
    rpc: Arc<RpcCorrelator>,
    devices: Arc<DeviceRegistry>,
    dispatcher: Arc<Dispatcher>,
    transfers: Arc<TransferCoordinator>,
    events_tx: broadcast::Sender<PeerEvent>,
    audit_flush_interval: Duration,
    progress_flush_interval: Duration,
    token: CancellationToken,
    started: AtomicBool,
}

impl PeerNode {
    pub fn new(
        transport: Arc<dyn Transport>,
        signer: Arc<dyn Signer>,
        verifier: Arc<dyn SignatureVerifier>,
        store: Arc<dyn Store>,
        config: NodeConfig,
    ) -> Arc<Self> {
        let connection = ConnectionManager::new(transport, config.connection);
        let rpc = Arc::new(RpcCorrelator::new(connection.clone(), signer.clone()).with_default_timeout(config.rpc_timeout));
        let devices = Arc::new(DeviceRegistry::new(store.clone(), config.gateway.first_contact_level));
        let audit_flush_interval = config.gateway.audit_flush_interval;
        let progress_flush_interval = config.transfer.checkpoint.batch_flush_interval;
        let dispatcher = Arc::new(Dispatcher::new(verifier, config.auth, config.gateway, devices.clone()));
        let transfers = TransferCoordinator::new(config.transfer, store.clone(), rpc.clone());
        let (events_tx, _) = broadcast::channel(PEER_EVENT_CAPACITY);

        Arc::new(Self {
            signer,
            store,
            connection,
            rpc,
            devices,
            dispatcher,
            transfers,
            events_tx,
            audit_flush_interval,
            progress_flush_interval,
            token: CancellationToken::new(),
            started: AtomicBool::new(false),
        })
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn identity(&self) -> String {
        self.signer.identity()
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn rpc(&self) -> &Arc<RpcCorrelator> {
        &self.rpc
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn devices(&self) -> &Arc<DeviceRegistry> {
        &self.devices
    }

    pub fn transfers(&self) -> &Arc<TransferCoordinator> {
        &self.transfers
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Application events published by the peer.
    pub fn events(&self) -> broadcast::Receiver<PeerEvent> {
        self.events_tx.subscribe()
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Load persisted state, register the transfer commands and start the
    /// background tasks. Returns transfers recovered from the store.
    pub async fn start(self: &Arc<Self>) -> Result<Vec<TransferRecord>, CoreError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(CoreError::InvalidState("node already started".into()));
        }
        let inbound = self
            .connection
            .take_inbound()
            .ok_or_else(|| CoreError::InvalidState("inbound queue already taken".into()))?;

        let devices = self.devices.load().await?;
        self.register_transfer_handlers().await;

        tokio::spawn(self.clone().inbound_loop(inbound));
        tokio::spawn(self.clone().audit_flusher());
        tokio::spawn(self.clone().progress_flusher());
        tokio::spawn(self.clone().connection_watcher());

        let recovered = self.transfers.recover().await?;
        info!(
            identity = %self.identity(),
            devices,
            recovered = recovered.len(),
            "node started"
        );
        Ok(recovered)
    }

    /// Connect to `peer` as this node's identity.
    pub async fn connect(&self, peer: impl Into<PeerId>) -> Result<(), CoreError> {
        self.connection.connect(peer.into(), PeerId::new(self.identity())).await
    }

    pub async fn disconnect(&self) {
        self.connection.disconnect().await;
    }

    /// Send a command with the default timeout.
    pub async fn call<T, P>(&self, method: &str, params: P) -> Result<T, CoreError>
    where
        T: DeserializeOwned,
        P: Serialize,
    {
        self.rpc.send_command(method, params, None).await
    }

    /// Publish an application event to the peer.
    pub async fn emit(&self, name: &str, payload: Value) -> Result<(), CoreError> {
        self.rpc.send_event(name, payload).await
    }

    /// Stop all background work, close the link and flush buffered state.
    pub async fn shutdown(&self) {
        self.token.cancel();
        self.transfers.shutdown();
        self.connection.shutdown().await;
        self.transfers.on_connection_lost().await;
        self.transfers.flush_progress().await;
        let flushed = self.dispatcher.flush_audit(self.store.as_ref()).await;
        info!(audit_flushed = flushed, "node stopped");
    }

    // ------------------------------------------------------------------------
    // Background tasks
    // ------------------------------------------------------------------------

    async fn register_transfer_handlers(&self) {
        for method in TRANSFER_METHODS {
            let transfers = self.transfers.clone();
            self.dispatcher
                .register_fn(method, move |ctx, params| {
                    let transfers = transfers.clone();
                    async move {
                        transfers
                            .handle_command(&ctx.method, params)
                            .await
                            .map_err(HandlerError::from)
                    }
                })
                .await;
        }
    }

    async fn inbound_loop(self: Arc<Self>, mut inbound: mpsc::Receiver<WireMessage>) {
        loop {
            let message = tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                message = inbound.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };

            match message {
                WireMessage::Command(command) => {
                    let node = self.clone();
                    tokio::spawn(async move {
                        let response = tokio::select! {
                            biased;
                            _ = node.token.cancelled() => return,
                            response = node.dispatcher.dispatch(command) => response,
                        };
                        if let Err(e) = node.connection.send_message(&WireMessage::Response(response)).await {
                            debug!(error = %e, "response not sent");
                        }
                    });
                }
                WireMessage::Chunk(chunk) => {
                    if let Err(e) = self.transfers.handle_chunk(chunk).await {
                        warn!(error = %e, "chunk rejected");
                    }
                }
                WireMessage::Event(event) => {
                    debug!(name = %event.name, "peer event");
                    let _ = self.events_tx.send(event);
                }
                other => debug!(kind = other.kind(), "unexpected inbound message"),
            }
        }
        debug!("inbound loop stopped");
    }

    async fn audit_flusher(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.audit_flush_interval);
        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                _ = ticker.tick() => {
                    let flushed = self.dispatcher.flush_audit(self.store.as_ref()).await;
                    if flushed > 0 {
                        debug!(flushed, "audit flushed");
                    }
                }
            }
        }
    }

    async fn progress_flusher(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.progress_flush_interval);
        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                _ = ticker.tick() => {
                    self.transfers.flush_progress().await;
                }
            }
        }
    }

    async fn connection_watcher(self: Arc<Self>) {
        let mut states = self.connection.state_stream();
        let mut previous = *states.borrow_and_update();
        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                changed = states.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            let current = *states.borrow_and_update();
            if previous == ConnectionState::Connected && current != ConnectionState::Connected {
                self.transfers.on_connection_lost().await;
            }
            previous = current;
        }
    }
}
