use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::{ActivityScope, ClientError, NodeClient, TaskScope};
use crate::node::Node;
use crate::protocol::{ClientMessage, RenderSettings, ReplyKind, ServerMessage};

/// Completed single render.
#[derive(Debug, Clone)]
pub struct RenderedFrame {
    pub task_id: String,
    pub frame: Option<Vec<u8>>,
    pub message: String,
}

/// Scene facts reported by a peek.
#[derive(Debug, Clone)]
pub struct SceneInfo {
    pub resolution_x: u32,
    pub resolution_y: u32,
    pub frame_start: i64,
    pub frame_end: i64,
    pub cameras: Vec<String>,
}

impl NodeClient {
    /// Render one frame. Fails synchronously with [`ClientError::AlreadyRendering`]
    /// when another render or peek holds the task slot. Transient disconnects
    /// are recovered transparently up to the configured budget.
    pub async fn render(
        &self,
        session_id: &str,
        task_id: &str,
        settings: RenderSettings,
    ) -> Result<RenderedFrame, ClientError> {
        if !self.node.try_claim_task(task_id) {
            return Err(ClientError::AlreadyRendering);
        }
        let _task = TaskScope::new(self);
        let cancel = CancellationToken::new();
        self.store_render_cancel(cancel.clone());
        let _scope = ActivityScope::enter(&self.node, "Render Loading..");

        let progress = spawn_progress_listener(
            self.node.clone(),
            self.subscribe_events(),
            task_id.to_string(),
        );

        let request = ClientMessage::Render {
            task_id: task_id.to_string(),
            session_id: session_id.to_string(),
            settings,
        };
        let result = self
            .send_with_recovery(
                request,
                ReplyKind::Render,
                &cancel,
                session_id,
                Some(self.config.render_retry_budget),
            )
            .await;
        progress.abort();

        match result? {
            ServerMessage::RenderResponse {
                task_id,
                success: true,
                message,
                frame,
            } => Ok(RenderedFrame {
                task_id,
                frame,
                message,
            }),
            ServerMessage::RenderResponse { message, .. } => {
                self.node.set_exception(message.clone());
                Err(ClientError::Remote(message))
            }
            other => Err(ClientError::Protocol(format!(
                "render reply out of shape: {other:?}"
            ))),
        }
    }

    /// Render a batch of frames. Per-frame results arrive as
    /// `RenderBatchResult` events on [`NodeClient::subscribe_events`]; the
    /// reply only closes the batch. Unlike single renders, the recovery loop
    /// is unbounded by default: long batches are expected to outlive several
    /// connection flaps.
    pub async fn render_batch(
        &self,
        session_id: &str,
        task_id: &str,
        frames: Vec<i64>,
        settings: RenderSettings,
    ) -> Result<(), ClientError> {
        if !self.node.try_claim_task(task_id) {
            return Err(ClientError::AlreadyRendering);
        }
        let _task = TaskScope::new(self);
        let cancel = CancellationToken::new();
        self.store_render_cancel(cancel.clone());
        let _scope = ActivityScope::enter(&self.node, "Render Loading..");

        let progress = spawn_progress_listener(
            self.node.clone(),
            self.subscribe_events(),
            task_id.to_string(),
        );

        let request = ClientMessage::RenderBatch {
            task_id: task_id.to_string(),
            session_id: session_id.to_string(),
            frames,
            settings,
        };
        let result = self
            .send_with_recovery(
                request,
                ReplyKind::RenderBatch,
                &cancel,
                session_id,
                self.config.batch_retry_budget,
            )
            .await;
        progress.abort();

        match result? {
            ServerMessage::RenderBatchResponse { success: true, .. } => Ok(()),
            ServerMessage::RenderBatchResponse { message, .. } => {
                self.node.set_exception(message.clone());
                Err(ClientError::Remote(message))
            }
            other => Err(ClientError::Protocol(format!(
                "batch reply out of shape: {other:?}"
            ))),
        }
    }

    /// Inspect the scene without rendering: resolutions, cameras, frame
    /// range. Shares the task slot and recovery behavior with `render`.
    pub async fn peek(&self, session_id: &str) -> Result<SceneInfo, ClientError> {
        let task_id = uuid::Uuid::new_v4().to_string();
        if !self.node.try_claim_task(&task_id) {
            return Err(ClientError::AlreadyRendering);
        }
        let _task = TaskScope::new(self);
        let cancel = CancellationToken::new();
        self.store_render_cancel(cancel.clone());
        let _scope = ActivityScope::enter(&self.node, "Render Loading..");

        let request = ClientMessage::BlenderPeek {
            task_id,
            session_id: session_id.to_string(),
        };
        let reply = self
            .send_with_recovery(
                request,
                ReplyKind::BlenderPeek,
                &cancel,
                session_id,
                Some(self.config.render_retry_budget),
            )
            .await?;

        match reply {
            ServerMessage::BlenderPeekResponse {
                success: true,
                resolution_x,
                resolution_y,
                frame_start,
                frame_end,
                cameras,
                ..
            } => Ok(SceneInfo {
                resolution_x,
                resolution_y,
                frame_start,
                frame_end,
                cameras,
            }),
            ServerMessage::BlenderPeekResponse { message, .. } => {
                Err(ClientError::Remote(message))
            }
            other => Err(ClientError::Protocol(format!(
                "peek reply out of shape: {other:?}"
            ))),
        }
    }

    /// Cancel the in-flight render: trips the local cancel handle and sends a
    /// best-effort cancel to the node. Progress flips to indeterminate while
    /// the cancellation drains.
    pub async fn cancel_render(&self, session_id: &str) {
        if let Some(token) = self.current_render_cancel() {
            token.cancel();
        }
        self.node.set_activity_progress(-1.0);
        if let Ok(conn) = self.current_connection().await {
            let _ = conn
                .send_oneway(ClientMessage::CancelRender {
                    session_id: session_id.to_string(),
                })
                .await;
        }
    }

    /// Shared send loop for render-class requests: a disconnect mid-request
    /// triggers recovery and a resend. With a budget, the attempt counter
    /// caps the loop ([`ClientError::RecoverExhausted`] past it) and a failed
    /// recovery is simply counted on the next pass; without one, a failed
    /// recovery propagates immediately so an unbounded batch cannot spin.
    pub(crate) async fn send_with_recovery(
        &self,
        request: ClientMessage,
        expect: ReplyKind,
        cancel: &CancellationToken,
        session_id: &str,
        budget: Option<u32>,
    ) -> Result<ServerMessage, ClientError> {
        let sessions = vec![session_id.to_string()];
        let mut attempts: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(ClientError::Cancelled);
            }
            let result = match self.current_connection().await {
                Ok(conn) => conn.request(request.clone(), expect, cancel).await,
                Err(err) => Err(err),
            };
            match result {
                Err(ClientError::Disconnected) => {
                    attempts += 1;
                    if let Some(max) = budget {
                        if attempts > max {
                            return Err(ClientError::RecoverExhausted);
                        }
                    }
                    tracing::info!(
                        target = "farmhand::client::render",
                        node = self.node.name(),
                        attempts,
                        "connection lost mid-task; recovering"
                    );
                    let recovered = self
                        .connect_recover(
                            self.config.recover_attempts,
                            self.config.recover_interval,
                            &sessions,
                        )
                        .await;
                    if let Err(err) = recovered {
                        if budget.is_none() {
                            return Err(err);
                        }
                        tracing::warn!(
                            target = "farmhand::client::render",
                            node = self.node.name(),
                            error = %err,
                            "recovery failed; retrying within budget"
                        );
                    }
                }
                other => return other,
            }
        }
    }
}

/// Applies render progress events for one task to the node's activity. Other
/// tasks' events and non-progress events pass through untouched.
fn spawn_progress_listener(
    node: Arc<Node>,
    mut events: broadcast::Receiver<ServerMessage>,
    task_id: String,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ServerMessage::RenderInfo {
                    task_id: event_task,
                    tiles_finished,
                    tiles_total,
                }) => {
                    if event_task != task_id {
                        continue;
                    }
                    node.set_activity(format!("Rendering ({tiles_finished}/{tiles_total})"));
                    if tiles_total > 0 {
                        let percent = ((tiles_finished as f64 / tiles_total as f64) * 1000.0)
                            .round()
                            / 10.0;
                        node.set_activity_progress(percent);
                    } else {
                        node.set_activity_progress(-1.0);
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
