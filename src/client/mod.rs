pub mod connection;
mod handshake;
mod recovery;
mod render;
mod sync;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::node::{Node, NodeChange};
use crate::protocol::wire::WireError;
use crate::protocol::{ClientMessage, ReplyKind, ServerMessage};
use crate::transport::{Connector, TransportError};
use crate::wol;
use connection::Connection;

pub use render::{RenderedFrame, SceneInfo};
pub use sync::SYNC_CHUNK_SIZE;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("not connected")]
    Disconnected,
    #[error("operation cancelled")]
    Cancelled,
    #[error("node protocol {server} does not match client protocol {client}")]
    OutdatedProtocol { server: u32, client: u32 },
    #[error("authentication rejected")]
    AuthFailed,
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("sync failed: {0}")]
    SyncFailed(String),
    #[error("a render task is already in flight")]
    AlreadyRendering,
    #[error("node reported failure: {0}")]
    Remote(String),
    #[error("recovery failed: {0}")]
    RecoverFailed(String),
    #[error("retry budget exhausted while recovering")]
    RecoverExhausted,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Client session for one render node.
///
/// Owns the connection for the node's connected lifetime and carries the
/// node's observable state through connects, disconnects, and recoveries.
/// Concurrent clients for different nodes are fully independent.
pub struct NodeClient {
    node: Arc<Node>,
    config: Config,
    connector: Arc<dyn Connector>,
    conn: tokio::sync::Mutex<Option<Arc<Connection>>>,
    // Monitor tasks from stale connections check this before touching state.
    generation: Arc<AtomicU64>,
    events: broadcast::Sender<ServerMessage>,
    render_cancel: Mutex<Option<CancellationToken>>,
}

impl NodeClient {
    pub fn new(node: Node, connector: Arc<dyn Connector>, config: Config) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            node: Arc::new(node),
            config,
            connector,
            conn: tokio::sync::Mutex::new(None),
            generation: Arc::new(AtomicU64::new(0)),
            events,
            render_cancel: Mutex::new(None),
        }
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Node-lifetime event stream: server events from the current connection
    /// and every later one recovery opens. Batch results are fanned out here
    /// untouched.
    pub fn subscribe_events(&self) -> broadcast::Receiver<ServerMessage> {
        self.events.subscribe()
    }

    /// Open the transport and run the handshake. A no-op when already
    /// connected. Emits the wake-on-LAN packet first when the node has a MAC
    /// configured.
    pub async fn connect(&self) -> Result<(), ClientError> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            if conn.is_connected() {
                return Ok(());
            }
        }
        if let Some(stale) = guard.take() {
            // A connection still in the slot died by transport drop (an
            // orderly disconnect empties the slot). Its monitor normally
            // resets the node state; make sure that happened before a new
            // connection goes up.
            stale.shutdown();
            self.node.on_disconnected();
        }

        if let Some(mac) = self.node.mac() {
            wol::wake(mac).await;
        }

        let transport = self.connector.connect().await.map_err(|err| {
            self.node.set_exception(err.to_string());
            err
        })?;
        let conn = Connection::spawn(transport);

        if let Err(err) = handshake::run(&conn, &self.node).await {
            conn.shutdown();
            self.node.set_exception(err.to_string());
            return Err(err);
        }

        self.spawn_monitor(&conn);
        *guard = Some(conn);
        drop(guard);

        self.node.set_connected(true);
        self.node.clear_exception();
        Ok(())
    }

    /// Close the connection without invalidating sync state: the node still
    /// holds the files, so the synced flags survive an orderly disconnect.
    /// Only an observed transport drop clears them.
    pub async fn disconnect(&self) {
        // Detach the monitor before closing so the drop is not treated as a
        // failure.
        self.generation.fetch_add(1, Ordering::SeqCst);
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.take() {
            conn.shutdown();
        }
        drop(guard);
        self.node.set_connected(false);
    }

    /// Ask the node to download and install a Blender version.
    pub async fn prepare(&self, version: &str) -> Result<(), ClientError> {
        let conn = self.current_connection().await?;
        let _scope = ActivityScope::enter(&self.node, format!("Preparing {version}"));
        let reply = conn
            .request(
                ClientMessage::Prepare {
                    version: version.to_string(),
                },
                ReplyKind::Prepare,
                &CancellationToken::new(),
            )
            .await?;
        match reply {
            ServerMessage::PrepareResponse { success: true, .. } => {
                self.node.add_available_version(version);
                self.node.set_prepared(true);
                self.node.set_last_status(format!("Prepared {version}"));
                Ok(())
            }
            ServerMessage::PrepareResponse { message, .. } => {
                self.node.set_exception(message.clone());
                Err(ClientError::Remote(message))
            }
            other => Err(ClientError::Protocol(format!(
                "prepare reply out of shape: {other:?}"
            ))),
        }
    }

    /// Probe whether a Blender version is already present on the node.
    pub async fn is_version_available(&self, version: &str) -> Result<bool, ClientError> {
        let conn = self.current_connection().await?;
        let reply = conn
            .request(
                ClientMessage::IsVersionAvailable {
                    version: version.to_string(),
                },
                ReplyKind::VersionAvailable,
                &CancellationToken::new(),
            )
            .await?;
        match reply {
            ServerMessage::VersionAvailableResponse { success } => {
                if success {
                    self.node.add_available_version(version);
                }
                Ok(success)
            }
            other => Err(ClientError::Protocol(format!(
                "version probe reply out of shape: {other:?}"
            ))),
        }
    }

    pub async fn is_busy(&self) -> Result<bool, ClientError> {
        let conn = self.current_connection().await?;
        let reply = conn
            .request(
                ClientMessage::IsBusy,
                ReplyKind::IsBusy,
                &CancellationToken::new(),
            )
            .await?;
        match reply {
            ServerMessage::IsBusyResponse { is_busy } => Ok(is_busy),
            other => Err(ClientError::Protocol(format!(
                "busy probe reply out of shape: {other:?}"
            ))),
        }
    }

    pub(crate) async fn current_connection(&self) -> Result<Arc<Connection>, ClientError> {
        let guard = self.conn.lock().await;
        match guard.as_ref() {
            Some(conn) if conn.is_connected() => Ok(conn.clone()),
            _ => Err(ClientError::Disconnected),
        }
    }

    pub(crate) fn store_render_cancel(&self, token: CancellationToken) {
        *self.render_cancel.lock().unwrap() = Some(token);
    }

    pub(crate) fn take_render_cancel(&self) {
        self.render_cancel.lock().unwrap().take();
    }

    pub(crate) fn current_render_cancel(&self) -> Option<CancellationToken> {
        self.render_cancel.lock().unwrap().clone()
    }

    /// Per-connection watcher: forwards events into the node-lifetime stream,
    /// applies activity/console/error pushes to node state, and handles the
    /// disconnect transition exactly once.
    fn spawn_monitor(&self, conn: &Arc<Connection>) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let generations = self.generation.clone();
        let node = self.node.clone();
        let events_out = self.events.clone();
        let mut events = conn.subscribe_events();
        let mut connected = conn.watch_connected();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(message) => {
                            apply_event(&node, &message);
                            let _ = events_out.send(message);
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(
                                target = "farmhand::client",
                                node = node.name(),
                                skipped,
                                "event stream lagged"
                            );
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    changed = connected.changed() => {
                        if changed.is_err() || !*connected.borrow() {
                            break;
                        }
                    }
                }
            }
            if generations.load(Ordering::SeqCst) == generation {
                tracing::info!(
                    target = "farmhand::client",
                    node = node.name(),
                    "connection lost"
                );
                node.on_disconnected();
            }
        });
    }
}

fn apply_event(node: &Node, message: &ServerMessage) {
    match message {
        ServerMessage::ActivityRequest { activity, progress } => {
            node.set_activity(activity.clone());
            node.set_activity_progress(*progress);
        }
        ServerMessage::ConsoleActivityResponse { output } => {
            node.append_log(output);
        }
        ServerMessage::Disconnected { is_error, reason } => {
            if *is_error {
                node.set_exception(reason.clone());
            }
            node.set_last_status(reason.clone());
        }
        // Render progress and batch results are consumed by the task
        // controller through the event stream.
        _ => {}
    }
}

/// Labels the node's activity for the duration of an operation and restores
/// the idle state on every exit path.
pub(crate) struct ActivityScope<'a> {
    node: &'a Node,
}

impl<'a> ActivityScope<'a> {
    pub(crate) fn enter(node: &'a Node, label: impl Into<String>) -> Self {
        node.set_activity(label.into());
        Self { node }
    }
}

impl Drop for ActivityScope<'_> {
    fn drop(&mut self) {
        self.node.set_activity("");
        self.node.set_activity_progress(-1.0);
    }
}

/// Releases the single in-flight task slot and the cancel handle.
pub(crate) struct TaskScope<'a> {
    client: &'a NodeClient,
}

impl<'a> TaskScope<'a> {
    pub(crate) fn new(client: &'a NodeClient) -> Self {
        Self { client }
    }
}

impl Drop for TaskScope<'_> {
    fn drop(&mut self) {
        self.client.take_render_cancel();
        self.client.node.release_task();
    }
}

/// Convenience re-export so UI layers can watch a node without importing the
/// node module.
pub type NodeChanges = broadcast::Receiver<NodeChange>;
