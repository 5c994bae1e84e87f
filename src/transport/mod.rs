use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use crate::protocol::wire;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(std::io::Error),
    #[error("connect timed out")]
    ConnectTimeout,
    #[error("transport closed")]
    Closed,
}

/// One duplex byte stream carrying length-prefixed frames.
///
/// `send` takes a fully encoded frame (see [`wire::encode_frame`]); `recv`
/// yields frame bodies with the length prefix stripped. Writes are serialized
/// by a single writer task.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, frame: Vec<u8>) -> Result<(), TransportError>;
    async fn recv(&self) -> Option<Vec<u8>>;
    fn is_connected(&self) -> bool;
    fn close(&self);
}

/// Produces a fresh transport per connection attempt. Recovery reconnects
/// through the same connector the node was first opened with.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Transport>, TransportError>;
}

pub struct TcpConnector {
    pub address: String,
    pub timeout: Duration,
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>, TransportError> {
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| TransportError::ConnectTimeout)?
            .map_err(TransportError::Connect)?;
        let _ = stream.set_nodelay(true);
        Ok(Box::new(StreamTransport::new(stream)))
    }
}

/// Frame transport over any byte stream: a reader task feeding an inbound
/// channel and a writer task draining an outbound channel.
pub struct StreamTransport {
    outbound_tx: mpsc::UnboundedSender<Vec<u8>>,
    inbound_rx: AsyncMutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    connected: Arc<AtomicBool>,
    tasks: std::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl StreamTransport {
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let connected = Arc::new(AtomicBool::new(true));

        let read_flag = connected.clone();
        let read_task = tokio::spawn(async move {
            loop {
                match wire::read_frame(&mut reader).await {
                    Ok(body) => {
                        if inbound_tx.send(body).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        if !matches!(err, wire::WireError::Closed) {
                            tracing::debug!(
                                target = "farmhand::transport",
                                error = %err,
                                "read loop terminated"
                            );
                        }
                        break;
                    }
                }
            }
            read_flag.store(false, Ordering::SeqCst);
        });

        let write_flag = connected.clone();
        let write_task = tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if wire::write_frame(&mut writer, &frame).await.is_err() {
                    break;
                }
            }
            write_flag.store(false, Ordering::SeqCst);
        });

        Self {
            outbound_tx,
            inbound_rx: AsyncMutex::new(inbound_rx),
            connected,
            tasks: std::sync::Mutex::new(vec![read_task, write_task]),
        }
    }
}

#[async_trait]
impl Transport for StreamTransport {
    async fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Closed);
        }
        self.outbound_tx
            .send(frame)
            .map_err(|_| TransportError::Closed)
    }

    async fn recv(&self) -> Option<Vec<u8>> {
        let mut rx = self.inbound_rx.lock().await;
        rx.recv().await
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap());
        for task in tasks {
            task.abort();
        }
    }
}

impl Drop for StreamTransport {
    fn drop(&mut self) {
        self.close();
    }
}

/// In-memory transport pair for tests and loopback wiring.
pub fn pair() -> (StreamTransport, StreamTransport) {
    let (near, far) = tokio::io::duplex(wire::MAX_FRAME_LEN);
    (StreamTransport::new(near), StreamTransport::new(far))
}
