//! Testing utilities for transport implementations.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;

use crate::traits::{LinkReceiver, PeerId, Transport, TransportError, TransportEvent};

const LINK_QUEUE: usize = 1024;

/// Produces inbound replies for a message sent through a [`MockTransport`].
pub type Responder = Box<dyn Fn(&Bytes) -> Vec<Bytes> + Send + Sync>;

/// Scriptable transport for tests.
///
/// Connect outcomes can be queued with [`MockTransport::push_connect_result`];
/// once the script is empty every connect succeeds unless
/// [`MockTransport::fail_all_connects`] is set.
pub struct MockTransport {
    sent: Mutex<Vec<Bytes>>,
    link: Mutex<Option<mpsc::Sender<TransportEvent>>>,
    connect_script: Mutex<VecDeque<Result<(), String>>>,
    fail_all: AtomicBool,
    connected: AtomicBool,
    connect_calls: AtomicU32,
    targets: Mutex<Vec<PeerId>>,
    responder: Mutex<Option<Responder>>,
    latency: Duration,
    packet_loss: f64,
}

impl MockTransport {
    /// Create a new mock transport
    pub fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            link: Mutex::new(None),
            connect_script: Mutex::new(VecDeque::new()),
            fail_all: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            connect_calls: AtomicU32::new(0),
            targets: Mutex::new(Vec::new()),
            responder: Mutex::new(None),
            latency: Duration::ZERO,
            packet_loss: 0.0,
        }
    }

    /// Configure simulated send latency
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Configure simulated packet loss (0.0 - 1.0)
    pub fn with_packet_loss(mut self, loss: f64) -> Self {
        self.packet_loss = loss.clamp(0.0, 1.0);
        self
    }

    /// Queue the outcome of the next `connect` call
    pub fn push_connect_result(&self, result: Result<(), String>) {
        self.connect_script.lock().push_back(result);
    }

    /// Make every `connect` fail until cleared
    pub fn fail_all_connects(&self, fail: bool) {
        self.fail_all.store(fail, Ordering::SeqCst);
    }

    /// Install a function that answers sent messages with inbound ones
    pub fn set_responder(&self, responder: Responder) {
        *self.responder.lock() = Some(responder);
    }

    pub fn clear_responder(&self) {
        *self.responder.lock() = None;
    }

    /// Number of `connect` calls so far
    pub fn connect_calls(&self) -> u32 {
        self.connect_calls.load(Ordering::SeqCst)
    }

    /// Targets passed to `connect`, in order
    pub fn connect_targets(&self) -> Vec<PeerId> {
        self.targets.lock().clone()
    }

    /// Deliver an inbound message on the current link
    pub fn inject(&self, data: Bytes) -> bool {
        match self.link.lock().as_ref() {
            Some(tx) => tx.try_send(TransportEvent::Message(data)).is_ok(),
            None => false,
        }
    }

    /// Simulate the link dropping underneath the caller
    pub fn drop_link(&self, reason: &str) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(tx) = self.link.lock().take() {
            let _ = tx.try_send(TransportEvent::Disconnected {
                reason: reason.to_string(),
            });
        }
    }

    /// Get sent messages
    pub fn sent(&self) -> Vec<Bytes> {
        self.sent.lock().clone()
    }

    /// Clear sent messages
    pub fn clear_sent(&self) {
        self.sent.lock().clear();
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, target: &PeerId, _local: &PeerId) -> Result<LinkReceiver, TransportError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        self.targets.lock().push(target.clone());

        let scripted = self.connect_script.lock().pop_front();
        let outcome = match scripted {
            Some(result) => result,
            None if self.fail_all.load(Ordering::SeqCst) => Err("scripted failure".to_string()),
            None => Ok(()),
        };
        outcome.map_err(TransportError::ConnectFailed)?;

        let (tx, rx) = mpsc::channel(LINK_QUEUE);
        *self.link.lock() = Some(tx);
        self.connected.store(true, Ordering::SeqCst);
        Ok(rx)
    }

    async fn send(&self, data: Bytes) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }

        let should_drop = {
            let mut rng = rand::thread_rng();
            rng.gen::<f64>() < self.packet_loss
        };
        if should_drop {
            return Err(TransportError::Other("packet lost".to_string()));
        }

        if !self.latency.is_zero() {
            sleep(self.latency).await;
        }

        self.sent.lock().push(data.clone());

        let replies = self
            .responder
            .lock()
            .as_ref()
            .map(|respond| respond(&data))
            .unwrap_or_default();
        for reply in replies {
            self.inject(reply);
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.connected.store(false, Ordering::SeqCst);
        self.link.lock().take();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
struct LoopbackSlot {
    inbox: Mutex<Option<mpsc::Sender<TransportEvent>>>,
}

/// In-process transport joining two peers.
pub struct LoopbackTransport {
    own: Arc<LoopbackSlot>,
    remote: Arc<LoopbackSlot>,
    severed: Arc<AtomicBool>,
}

impl LoopbackTransport {
    /// Create connected pair
    pub fn pair() -> (Self, Self) {
        let a = Arc::new(LoopbackSlot::default());
        let b = Arc::new(LoopbackSlot::default());
        let severed = Arc::new(AtomicBool::new(false));

        let first = Self {
            own: a.clone(),
            remote: b.clone(),
            severed: severed.clone(),
        };
        let second = Self {
            own: b,
            remote: a,
            severed,
        };
        (first, second)
    }

    /// Simulate network loss: both ends see a disconnect and further
    /// connects fail until [`LoopbackTransport::heal`] is called.
    pub fn sever(&self) {
        self.severed.store(true, Ordering::SeqCst);
        for slot in [&self.own, &self.remote] {
            if let Some(tx) = slot.inbox.lock().take() {
                let _ = tx.try_send(TransportEvent::Disconnected {
                    reason: "link severed".to_string(),
                });
            }
        }
    }

    pub fn heal(&self) {
        self.severed.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn connect(&self, _target: &PeerId, _local: &PeerId) -> Result<LinkReceiver, TransportError> {
        if self.severed.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectFailed("link severed".into()));
        }
        let (tx, rx) = mpsc::channel(LINK_QUEUE);
        *self.own.inbox.lock() = Some(tx);
        Ok(rx)
    }

    async fn send(&self, data: Bytes) -> Result<(), TransportError> {
        if self.severed.load(Ordering::SeqCst) || self.own.inbox.lock().is_none() {
            return Err(TransportError::Disconnected);
        }
        let tx = self
            .remote
            .inbox
            .lock()
            .clone()
            .ok_or(TransportError::Disconnected)?;
        tx.send(TransportEvent::Message(data))
            .await
            .map_err(|_| TransportError::Disconnected)
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.own.inbox.lock().take();
        if let Some(tx) = self.remote.inbox.lock().take() {
            let _ = tx.try_send(TransportEvent::Disconnected {
                reason: "peer disconnected".to_string(),
            });
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.severed.load(Ordering::SeqCst) && self.own.inbox.lock().is_some()
    }
}
