use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, oneshot, watch};
use tokio_util::sync::CancellationToken;

use super::ClientError;
use crate::protocol::wire::{decode_server_frame, encode_frame, ClientEnvelope};
use crate::protocol::{ClientMessage, ReplyKind, ServerMessage};
use crate::transport::Transport;

type PendingMap = HashMap<u64, oneshot::Sender<ServerMessage>>;

/// One live link to a node. Owns the transport, runs the read loop, and
/// demultiplexes correlated replies from unsolicited events.
///
/// Events are re-broadcast off the read loop; reply waiters are woken
/// directly. When the transport drops, every outstanding waiter fails with
/// [`ClientError::Disconnected`] and the connected watch flips false exactly
/// once.
pub struct Connection {
    transport: Arc<dyn Transport>,
    // None once the read loop has drained the table; requests arriving after
    // that fail fast instead of waiting forever.
    pending: Arc<Mutex<Option<PendingMap>>>,
    next_id: AtomicU64,
    events: broadcast::Sender<ServerMessage>,
    connected_rx: watch::Receiver<bool>,
}

impl Connection {
    pub fn spawn(transport: Box<dyn Transport>) -> Arc<Self> {
        let transport: Arc<dyn Transport> = Arc::from(transport);
        let pending: Arc<Mutex<Option<PendingMap>>> =
            Arc::new(Mutex::new(Some(HashMap::new())));
        let (events, _) = broadcast::channel(256);
        let (connected_tx, connected_rx) = watch::channel(true);

        let connection = Arc::new(Self {
            transport: transport.clone(),
            pending: pending.clone(),
            next_id: AtomicU64::new(0),
            events: events.clone(),
            connected_rx,
        });

        tokio::spawn(async move {
            loop {
                let Some(body) = transport.recv().await else {
                    break;
                };
                let envelope = match decode_server_frame(&body) {
                    Ok(envelope) => envelope,
                    Err(err) => {
                        tracing::warn!(
                            target = "farmhand::client::connection",
                            error = %err,
                            "malformed inbound frame; closing connection"
                        );
                        break;
                    }
                };
                match envelope.id {
                    Some(id) => {
                        let waiter = pending
                            .lock()
                            .unwrap()
                            .as_mut()
                            .and_then(|map| map.remove(&id));
                        match waiter {
                            Some(tx) => {
                                let _ = tx.send(envelope.message);
                            }
                            None => {
                                tracing::warn!(
                                    target = "farmhand::client::connection",
                                    id,
                                    "reply without outstanding request"
                                );
                            }
                        }
                    }
                    None => {
                        let _ = events.send(envelope.message);
                    }
                }
            }
            transport.close();
            let _ = connected_tx.send(false);
            // Dropping the waiters wakes every outstanding request with a
            // disconnected error.
            drop(pending.lock().unwrap().take());
        });

        connection
    }

    pub fn is_connected(&self) -> bool {
        *self.connected_rx.borrow()
    }

    pub fn watch_connected(&self) -> watch::Receiver<bool> {
        self.connected_rx.clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ServerMessage> {
        self.events.subscribe()
    }

    /// Write and flush without expecting a reply.
    pub async fn send_oneway(&self, message: ClientMessage) -> Result<(), ClientError> {
        let frame = encode_frame(&ClientEnvelope { id: None, message })?;
        self.transport
            .send(frame)
            .await
            .map_err(|_| ClientError::Disconnected)
    }

    /// Send a correlated request and wait for its reply, the cancel signal,
    /// or the transport dropping. A reply of the wrong type is a protocol
    /// violation that terminates the connection.
    pub async fn request(
        &self,
        message: ClientMessage,
        expect: ReplyKind,
        cancel: &CancellationToken,
    ) -> Result<ServerMessage, ClientError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let frame = encode_frame(&ClientEnvelope {
            id: Some(id),
            message,
        })?;

        let (tx, rx) = oneshot::channel();
        {
            let mut guard = self.pending.lock().unwrap();
            match guard.as_mut() {
                Some(map) => {
                    map.insert(id, tx);
                }
                None => return Err(ClientError::Disconnected),
            }
        }
        if self.transport.send(frame).await.is_err() {
            self.forget(id);
            return Err(ClientError::Disconnected);
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                self.forget(id);
                Err(ClientError::Cancelled)
            }
            reply = rx => match reply {
                Ok(reply) if reply.reply_kind() == Some(expect) => Ok(reply),
                Ok(reply) => {
                    tracing::error!(
                        target = "farmhand::client::connection",
                        expected = ?expect,
                        received = ?reply.reply_kind(),
                        "reply type mismatch; terminating connection"
                    );
                    self.shutdown();
                    Err(ClientError::Protocol(format!(
                        "expected {expect:?} reply, received {:?}",
                        reply.reply_kind()
                    )))
                }
                Err(_) => Err(ClientError::Disconnected),
            }
        }
    }

    /// Close the transport; the read loop observes the drop and finishes the
    /// lifecycle (waiter drain + disconnected notification).
    pub fn shutdown(&self) {
        self.transport.close();
    }

    fn forget(&self, id: u64) {
        if let Some(map) = self.pending.lock().unwrap().as_mut() {
            map.remove(&id);
        }
    }
}
