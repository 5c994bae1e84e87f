#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use farmhand::protocol::wire::{decode_client_frame, encode_frame, ServerEnvelope};
use farmhand::protocol::{ClientMessage, ServerMessage, PROTOCOL_VERSION};
use farmhand::transport::{pair, Connector, StreamTransport, Transport, TransportError};

/// Scripted render node. One instance may serve several connections in a
/// row; uploaded files and behavior flags persist across them, the way a
/// real daemon outlives a client's transport.
pub struct MockNode {
    pub protocol_version: u32,
    pub require_auth: bool,
    pub pass: String,
    pub render_tiles: u32,
    /// Pause between the progress events and the render reply, so observers
    /// of the client's activity can keep up.
    pub render_reply_delay: Duration,
    /// Close the transport instead of answering the next render request.
    pub drop_next_render: AtomicBool,
    pub reject_sync: AtomicBool,
    pub upload_chunks: AtomicU32,
    pub chunk_sizes: Mutex<Vec<usize>>,
    pub recovered_sessions: Mutex<Vec<String>>,
    pub known_files: Mutex<HashSet<(String, i64)>>,
    pub uploads: Mutex<HashMap<String, (String, i64)>>,
    pub next_upload: AtomicU32,
}

impl Default for MockNode {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            require_auth: false,
            pass: String::new(),
            render_tiles: 4,
            render_reply_delay: Duration::from_millis(50),
            drop_next_render: AtomicBool::new(false),
            reject_sync: AtomicBool::new(false),
            upload_chunks: AtomicU32::new(0),
            chunk_sizes: Mutex::new(Vec::new()),
            recovered_sessions: Mutex::new(Vec::new()),
            known_files: Mutex::new(HashSet::new()),
            uploads: Mutex::new(HashMap::new()),
            next_upload: AtomicU32::new(0),
        }
    }
}

impl MockNode {
    pub fn knows_file(&self, session: &str, file_id: i64) -> bool {
        self.known_files
            .lock()
            .unwrap()
            .contains(&(session.to_string(), file_id))
    }

    async fn reply(&self, transport: &StreamTransport, id: Option<u64>, message: ServerMessage) {
        let frame = encode_frame(&ServerEnvelope { id, message }).unwrap();
        let _ = transport.send(frame).await;
    }

    async fn event(&self, transport: &StreamTransport, message: ServerMessage) {
        self.reply(transport, None, message).await;
    }

    pub async fn serve(self: Arc<Self>, transport: StreamTransport) {
        let transport = Arc::new(transport);
        loop {
            let Some(body) = transport.recv().await else {
                break;
            };
            let envelope = decode_client_frame(&body).expect("client frame");
            let id = envelope.id;
            match envelope.message {
                ClientMessage::CheckProtocol { .. } => {
                    self.reply(
                        &transport,
                        id,
                        ServerMessage::CheckProtocolResponse {
                            protocol_version: self.protocol_version,
                            require_auth: self.require_auth,
                        },
                    )
                    .await;
                }
                ClientMessage::Auth { pass } => {
                    self.reply(
                        &transport,
                        id,
                        ServerMessage::AuthResponse {
                            is_authenticated: pass == self.pass,
                        },
                    )
                    .await;
                }
                ClientMessage::ComputerInfo => {
                    self.reply(
                        &transport,
                        id,
                        ServerMessage::ComputerInfoResponse {
                            name: "mock-node".into(),
                            os: "linux".into(),
                            cores: 16,
                        },
                    )
                    .await;
                }
                ClientMessage::Prepare { .. } => {
                    self.reply(
                        &transport,
                        id,
                        ServerMessage::PrepareResponse {
                            success: true,
                            message: String::new(),
                        },
                    )
                    .await;
                }
                ClientMessage::IsVersionAvailable { version } => {
                    self.reply(
                        &transport,
                        id,
                        ServerMessage::VersionAvailableResponse {
                            success: version.starts_with('3'),
                        },
                    )
                    .await;
                }
                ClientMessage::SyncStart {
                    session_id,
                    file_id,
                    ..
                } => {
                    if self.reject_sync.load(Ordering::SeqCst) {
                        self.reply(
                            &transport,
                            id,
                            ServerMessage::SyncResponse {
                                success: false,
                                same_file: false,
                                upload_id: None,
                                message: "disk full".into(),
                            },
                        )
                        .await;
                    } else if self.knows_file(&session_id, file_id) {
                        self.reply(
                            &transport,
                            id,
                            ServerMessage::SyncResponse {
                                success: true,
                                same_file: true,
                                upload_id: None,
                                message: String::new(),
                            },
                        )
                        .await;
                    } else {
                        let upload_id =
                            format!("u{}", self.next_upload.fetch_add(1, Ordering::SeqCst));
                        self.uploads
                            .lock()
                            .unwrap()
                            .insert(upload_id.clone(), (session_id, file_id));
                        self.reply(
                            &transport,
                            id,
                            ServerMessage::SyncResponse {
                                success: true,
                                same_file: false,
                                upload_id: Some(upload_id),
                                message: String::new(),
                            },
                        )
                        .await;
                    }
                }
                ClientMessage::SyncUpload { data, .. } => {
                    self.upload_chunks.fetch_add(1, Ordering::SeqCst);
                    self.chunk_sizes.lock().unwrap().push(data.len());
                    self.reply(
                        &transport,
                        id,
                        ServerMessage::SyncUploadResponse {
                            success: true,
                            message: String::new(),
                        },
                    )
                    .await;
                }
                ClientMessage::SyncComplete { upload_id } => {
                    if let Some(entry) = self.uploads.lock().unwrap().remove(&upload_id) {
                        self.known_files.lock().unwrap().insert(entry);
                    }
                    self.reply(
                        &transport,
                        id,
                        ServerMessage::SyncCompleteResponse { success: true },
                    )
                    .await;
                }
                ClientMessage::SyncNetwork {
                    session_id,
                    file_id,
                    ..
                } => {
                    self.known_files
                        .lock()
                        .unwrap()
                        .insert((session_id, file_id));
                    self.reply(
                        &transport,
                        id,
                        ServerMessage::SyncResponse {
                            success: true,
                            same_file: false,
                            upload_id: None,
                            message: String::new(),
                        },
                    )
                    .await;
                }
                ClientMessage::CheckSync {
                    session_id,
                    file_id,
                } => {
                    let success = self.knows_file(&session_id, file_id);
                    self.reply(
                        &transport,
                        id,
                        ServerMessage::CheckSyncResponse { success },
                    )
                    .await;
                }
                ClientMessage::Render { task_id, .. } => {
                    if self.drop_next_render.swap(false, Ordering::SeqCst) {
                        transport.close();
                        break;
                    }
                    for tile in 1..=self.render_tiles {
                        self.event(
                            &transport,
                            ServerMessage::ConsoleActivityResponse {
                                output: format!("Fra:{tile} | Rendering"),
                            },
                        )
                        .await;
                        self.event(
                            &transport,
                            ServerMessage::RenderInfo {
                                task_id: task_id.clone(),
                                tiles_finished: tile,
                                tiles_total: self.render_tiles,
                            },
                        )
                        .await;
                    }
                    // reply later without blocking the serve loop, so cancels
                    // and probes still get answered mid-render
                    let node = self.clone();
                    let transport = transport.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(node.render_reply_delay).await;
                        node.reply(
                            &transport,
                            id,
                            ServerMessage::RenderResponse {
                                task_id,
                                success: true,
                                message: String::new(),
                                frame: Some(vec![0u8; 16]),
                            },
                        )
                        .await;
                    });
                }
                ClientMessage::RenderBatch {
                    task_id, frames, ..
                } => {
                    if self.drop_next_render.swap(false, Ordering::SeqCst) {
                        transport.close();
                        break;
                    }
                    for frame in &frames {
                        self.event(
                            &transport,
                            ServerMessage::RenderBatchResult {
                                task_id: task_id.clone(),
                                frame: *frame,
                                data: vec![1u8; 8],
                            },
                        )
                        .await;
                    }
                    let node = self.clone();
                    let transport = transport.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(node.render_reply_delay).await;
                        node.reply(
                            &transport,
                            id,
                            ServerMessage::RenderBatchResponse {
                                task_id,
                                success: true,
                                message: String::new(),
                            },
                        )
                        .await;
                    });
                }
                ClientMessage::BlenderPeek { task_id, .. } => {
                    self.reply(
                        &transport,
                        id,
                        ServerMessage::BlenderPeekResponse {
                            task_id,
                            success: true,
                            message: String::new(),
                            resolution_x: 1920,
                            resolution_y: 1080,
                            frame_start: 1,
                            frame_end: 250,
                            cameras: vec!["Camera".into(), "Camera.001".into()],
                        },
                    )
                    .await;
                }
                ClientMessage::IsBusy => {
                    self.reply(
                        &transport,
                        id,
                        ServerMessage::IsBusyResponse { is_busy: false },
                    )
                    .await;
                }
                ClientMessage::CancelRender { .. } => {
                    // oneway; nothing to answer
                }
                ClientMessage::Recover { session_ids } => {
                    self.recovered_sessions
                        .lock()
                        .unwrap()
                        .extend(session_ids);
                    self.reply(
                        &transport,
                        id,
                        ServerMessage::RecoverResponse {
                            success: true,
                            message: String::new(),
                        },
                    )
                    .await;
                }
            }
        }
    }
}

/// Hands the client an in-memory transport wired to a [`MockNode`], with a
/// scripted pass/fail outcome per connect attempt.
pub struct MockConnector {
    node: Arc<MockNode>,
    // one entry per connect: true = refuse; empty falls back to `exhausted`
    outcomes: Mutex<VecDeque<bool>>,
    exhausted: bool,
    pub connects: AtomicU32,
}

impl MockConnector {
    pub fn up(node: Arc<MockNode>) -> Arc<Self> {
        Self::scripted(node, Vec::new(), false)
    }

    pub fn scripted(node: Arc<MockNode>, outcomes: Vec<bool>, fail_when_exhausted: bool) -> Arc<Self> {
        Arc::new(Self {
            node,
            outcomes: Mutex::new(outcomes.into()),
            exhausted: fail_when_exhausted,
            connects: AtomicU32::new(0),
        })
    }

    pub fn connect_count(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let refuse = self
            .outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.exhausted);
        if refuse {
            return Err(TransportError::Connect(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "connection refused",
            )));
        }
        let (near, far) = pair();
        let node = self.node.clone();
        tokio::spawn(async move {
            node.serve(far).await;
        });
        Ok(Box::new(near))
    }
}

/// Records every activity string a node passes through.
pub fn record_activities(
    node: &std::sync::Arc<farmhand::node::Node>,
) -> Arc<Mutex<Vec<String>>> {
    use farmhand::node::NodeChange;
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let mut changes = node.subscribe();
    tokio::spawn(async move {
        while let Ok(change) = changes.recv().await {
            if let NodeChange::Activity(activity) = change {
                sink.lock().unwrap().push(activity);
            }
        }
    });
    seen
}
