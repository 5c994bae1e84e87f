use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;

use super::connection::Connection;
use super::{ActivityScope, ClientError, NodeClient};
use crate::protocol::{ClientMessage, Compression, ReplyKind, ServerMessage};

/// Fixed upload chunk size. The final chunk carries its actual length.
pub const SYNC_CHUNK_SIZE: usize = 10 * 1024 * 1024;

impl NodeClient {
    /// Upload a scene file revision to the node and verify it.
    ///
    /// The synced flag for `session_id` flips true only after the node's
    /// `check_sync` confirms the `(session, file)` pair; a failure at any
    /// stage leaves it false.
    pub async fn sync_file<R>(
        &self,
        session_id: &str,
        file_id: i64,
        mut reader: R,
        total: u64,
        compression: Compression,
        cancel: &CancellationToken,
    ) -> Result<(), ClientError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let conn = self.current_connection().await?;
        let _scope = ActivityScope::enter(&self.node, "Syncing");

        let reply = conn
            .request(
                ClientMessage::SyncStart {
                    session_id: session_id.to_string(),
                    file_id,
                    compression,
                },
                ReplyKind::Sync,
                cancel,
            )
            .await?;
        let upload_id = match reply {
            ServerMessage::SyncResponse { success: false, message, .. } => {
                self.node.set_session_synced(session_id, false);
                return Err(ClientError::SyncFailed(message));
            }
            ServerMessage::SyncResponse { same_file: true, .. } => {
                // Node already holds this exact revision; nothing to send.
                tracing::debug!(
                    target = "farmhand::client::sync",
                    node = self.node.name(),
                    session_id,
                    file_id,
                    "file already current on node"
                );
                self.node.set_session_synced(session_id, true);
                self.node.set_last_file_id(file_id);
                return Ok(());
            }
            ServerMessage::SyncResponse { upload_id: Some(upload_id), .. } => upload_id,
            ServerMessage::SyncResponse { upload_id: None, .. } => {
                return Err(ClientError::Protocol(
                    "sync accepted without an upload id".into(),
                ))
            }
            other => {
                return Err(ClientError::Protocol(format!(
                    "sync reply out of shape: {other:?}"
                )))
            }
        };

        let mut written: u64 = 0;
        let mut buf = vec![0u8; SYNC_CHUNK_SIZE];
        loop {
            let read = read_chunk(&mut reader, &mut buf).await?;
            if read == 0 {
                break;
            }
            let reply = conn
                .request(
                    ClientMessage::SyncUpload {
                        upload_id: upload_id.clone(),
                        data: buf[..read].to_vec(),
                    },
                    ReplyKind::SyncUpload,
                    cancel,
                )
                .await?;
            if let ServerMessage::SyncUploadResponse { success: false, message } = reply {
                self.node.set_session_synced(session_id, false);
                return Err(ClientError::SyncFailed(message));
            }
            written += read as u64;
            let percent = if total > 0 {
                ((written as f64 / total as f64) * 1000.0).round() / 10.0
            } else {
                100.0
            };
            self.node.set_activity(format!("Syncing ({percent:.1}%)"));
            self.node.set_activity_progress(percent);
        }

        let reply = conn
            .request(
                ClientMessage::SyncComplete {
                    upload_id: upload_id.clone(),
                },
                ReplyKind::SyncComplete,
                cancel,
            )
            .await?;
        if let ServerMessage::SyncCompleteResponse { success: false } = reply {
            self.node.set_session_synced(session_id, false);
            return Err(ClientError::SyncFailed("finalize rejected".into()));
        }

        self.verify_sync(&conn, session_id, file_id, cancel).await
    }

    /// Point the node at a network share instead of uploading. The node pulls
    /// the file itself from the per-OS path that matches it.
    pub async fn sync_network_file(
        &self,
        session_id: &str,
        file_id: i64,
        windows_path: &str,
        linux_path: &str,
        macos_path: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ClientError> {
        let conn = self.current_connection().await?;
        let _scope = ActivityScope::enter(&self.node, "Syncing");

        let reply = conn
            .request(
                ClientMessage::SyncNetwork {
                    session_id: session_id.to_string(),
                    file_id,
                    windows_path: windows_path.to_string(),
                    linux_path: linux_path.to_string(),
                    macos_path: macos_path.to_string(),
                },
                ReplyKind::Sync,
                cancel,
            )
            .await?;
        match reply {
            ServerMessage::SyncResponse { success: false, message, .. } => {
                self.node.set_session_synced(session_id, false);
                Err(ClientError::SyncFailed(message))
            }
            ServerMessage::SyncResponse { same_file: true, .. } => {
                self.node.set_session_synced(session_id, true);
                self.node.set_last_file_id(file_id);
                Ok(())
            }
            ServerMessage::SyncResponse { .. } => {
                self.verify_sync(&conn, session_id, file_id, cancel).await
            }
            other => Err(ClientError::Protocol(format!(
                "sync reply out of shape: {other:?}"
            ))),
        }
    }

    /// Ask the node whether `(session, file)` is current, updating the synced
    /// flag either way.
    pub async fn check_sync(&self, session_id: &str, file_id: i64) -> Result<bool, ClientError> {
        let conn = self.current_connection().await?;
        let cancel = CancellationToken::new();
        let reply = conn
            .request(
                ClientMessage::CheckSync {
                    session_id: session_id.to_string(),
                    file_id,
                },
                ReplyKind::CheckSync,
                &cancel,
            )
            .await?;
        match reply {
            ServerMessage::CheckSyncResponse { success } => {
                self.node.set_session_synced(session_id, success);
                if success {
                    self.node.set_last_file_id(file_id);
                }
                Ok(success)
            }
            other => Err(ClientError::Protocol(format!(
                "check_sync reply out of shape: {other:?}"
            ))),
        }
    }

    async fn verify_sync(
        &self,
        conn: &Connection,
        session_id: &str,
        file_id: i64,
        cancel: &CancellationToken,
    ) -> Result<(), ClientError> {
        let reply = conn
            .request(
                ClientMessage::CheckSync {
                    session_id: session_id.to_string(),
                    file_id,
                },
                ReplyKind::CheckSync,
                cancel,
            )
            .await?;
        match reply {
            ServerMessage::CheckSyncResponse { success: true } => {
                self.node.set_session_synced(session_id, true);
                self.node.set_last_file_id(file_id);
                self.node.set_last_status("Synced".to_string());
                Ok(())
            }
            ServerMessage::CheckSyncResponse { success: false } => {
                self.node.set_session_synced(session_id, false);
                Err(ClientError::SyncFailed(
                    "node rejected sync verification".into(),
                ))
            }
            other => Err(ClientError::Protocol(format!(
                "check_sync reply out of shape: {other:?}"
            ))),
        }
    }
}

/// Fill `buf` from the reader, tolerating short reads. Returns the number of
/// bytes gathered; zero means end of input.
async fn read_chunk<R>(reader: &mut R, buf: &mut [u8]) -> Result<usize, ClientError>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let read = reader.read(&mut buf[filled..]).await?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    Ok(filled)
}
