//! TCP transport using length-prefixed frames.
//!
//! The first frame on every new link is a hello carrying the sender's peer
//! id. A listening transport only keeps connections whose hello names the
//! expected target.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::framing::LengthCodec;
use crate::traits::{LinkReceiver, PeerId, Transport, TransportError, TransportEvent};

const HELLO_PREFIX: &str = "ZLINK/1 ";
const EVENT_QUEUE: usize = 256;

/// How a [`TcpTransport`] establishes links
#[derive(Clone, Debug)]
pub enum TcpMode {
    /// Dial the given `host:port`
    Dial(String),
    /// Accept on the given `host:port`
    Listen(String),
}

struct Link {
    writer: OwnedWriteHalf,
    reader: JoinHandle<()>,
}

/// Stream transport over TCP
pub struct TcpTransport {
    mode: TcpMode,
    codec: LengthCodec,
    connect_timeout: Duration,
    listener: Mutex<Option<TcpListener>>,
    link: Mutex<Option<Link>>,
    connected: Arc<AtomicBool>,
}

impl TcpTransport {
    pub fn new(mode: TcpMode) -> Self {
        Self {
            mode,
            codec: LengthCodec::default(),
            connect_timeout: Duration::from_secs(10),
            listener: Mutex::new(None),
            link: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn dial(addr: impl Into<String>) -> Self {
        Self::new(TcpMode::Dial(addr.into()))
    }

    pub fn listen(addr: impl Into<String>) -> Self {
        Self::new(TcpMode::Listen(addr.into()))
    }

    /// Set the connect (or accept) timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    async fn open_stream(&self, target: &PeerId, local: &PeerId) -> Result<TcpStream, TransportError> {
        match &self.mode {
            TcpMode::Dial(addr) => {
                let mut stream = TcpStream::connect(addr)
                    .await
                    .map_err(|e| TransportError::ConnectFailed(format!("{}: {}", addr, e)))?;
                stream.set_nodelay(true)?;
                self.write_hello(&mut stream, local).await?;
                let remote = self.read_hello(&mut stream).await?;
                if &remote != target {
                    return Err(TransportError::UnexpectedPeer {
                        expected: target.to_string(),
                        actual: remote.to_string(),
                    });
                }
                Ok(stream)
            }
            TcpMode::Listen(addr) => {
                let mut guard = self.listener.lock().await;
                if guard.is_none() {
                    let listener = TcpListener::bind(addr).await?;
                    info!(addr = %addr, "listening for peer");
                    *guard = Some(listener);
                }
                let listener = guard
                    .as_ref()
                    .ok_or_else(|| TransportError::Other("listener unavailable".into()))?;

                loop {
                    let (mut stream, remote_addr) = listener.accept().await?;
                    stream.set_nodelay(true)?;
                    let remote = match self.read_hello(&mut stream).await {
                        Ok(remote) => remote,
                        Err(e) => {
                            warn!(remote = %remote_addr, error = %e, "dropping connection without valid hello");
                            continue;
                        }
                    };
                    if &remote != target {
                        warn!(remote = %remote_addr, peer = %remote, expected = %target, "dropping connection from unexpected peer");
                        continue;
                    }
                    self.write_hello(&mut stream, local).await?;
                    return Ok(stream);
                }
            }
        }
    }

    async fn write_hello(&self, stream: &mut TcpStream, local: &PeerId) -> Result<(), TransportError> {
        let hello = format!("{}{}", HELLO_PREFIX, local);
        let frame = self.codec.encode(hello.as_bytes())?;
        stream.write_all(&frame).await?;
        Ok(())
    }

    async fn read_hello(&self, stream: &mut TcpStream) -> Result<PeerId, TransportError> {
        let mut buf = BytesMut::with_capacity(256);
        loop {
            if let Some(frame) = self.codec.decode_stream(&mut buf)? {
                let text = std::str::from_utf8(&frame)
                    .map_err(|_| TransportError::Other("hello is not UTF-8".into()))?;
                let id = text
                    .strip_prefix(HELLO_PREFIX)
                    .ok_or_else(|| TransportError::Other("malformed hello".into()))?;
                return Ok(PeerId::new(id));
            }
            if stream.read_buf(&mut buf).await? == 0 {
                return Err(TransportError::ConnectionClosed);
            }
        }
    }

    fn spawn_reader(
        &self,
        mut reader: OwnedReadHalf,
        events: mpsc::Sender<TransportEvent>,
    ) -> JoinHandle<()> {
        let codec = self.codec;
        let connected = self.connected.clone();
        tokio::spawn(async move {
            let mut buf = BytesMut::with_capacity(64 * 1024);
            let reason = loop {
                match codec.decode_stream(&mut buf) {
                    Ok(Some(frame)) => {
                        if events.send(TransportEvent::Message(frame)).await.is_err() {
                            debug!("link receiver dropped, stopping reader");
                            return;
                        }
                        continue;
                    }
                    Ok(None) => {}
                    Err(e) => break format!("framing error: {}", e),
                }
                match reader.read_buf(&mut buf).await {
                    Ok(0) => break "connection closed by peer".to_string(),
                    Ok(_) => {}
                    Err(e) => break format!("read error: {}", e),
                }
            };
            connected.store(false, Ordering::SeqCst);
            let _ = events.send(TransportEvent::Disconnected { reason }).await;
        })
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, target: &PeerId, local: &PeerId) -> Result<LinkReceiver, TransportError> {
        self.disconnect().await?;

        let stream = tokio::time::timeout(self.connect_timeout, self.open_stream(target, local))
            .await
            .map_err(|_| TransportError::Timeout)??;

        let (reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::channel(EVENT_QUEUE);
        let reader = self.spawn_reader(reader, tx);

        *self.link.lock().await = Some(Link { writer, reader });
        self.connected.store(true, Ordering::SeqCst);
        info!(peer = %target, "tcp link established");
        Ok(rx)
    }

    async fn send(&self, data: Bytes) -> Result<(), TransportError> {
        let frame = self.codec.encode(&data)?;
        let mut guard = self.link.lock().await;
        let link = guard.as_mut().ok_or(TransportError::Disconnected)?;
        if let Err(e) = link.writer.write_all(&frame).await {
            self.connected.store(false, Ordering::SeqCst);
            return Err(e.into());
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let link = self.link.lock().await.take();
        self.connected.store(false, Ordering::SeqCst);
        if let Some(mut link) = link {
            link.reader.abort();
            let _ = link.writer.shutdown().await;
            debug!("tcp link closed");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
