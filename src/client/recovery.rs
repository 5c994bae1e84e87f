use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::{ClientError, NodeClient};
use crate::protocol::{ClientMessage, ReplyKind, ServerMessage};

impl NodeClient {
    /// Reconnect and reclaim sessions after a dropped transport.
    ///
    /// Each iteration runs a full connect (wake-on-LAN hint, transport,
    /// handshake) followed by a `recover` request naming the sessions to
    /// resume. Any failure inside an iteration waits `interval` and retries,
    /// up to `attempts` times. Synced flags are not restored here; a
    /// subsequent `check_sync` or re-sync re-verifies them.
    pub async fn connect_recover(
        &self,
        attempts: u32,
        interval: Duration,
        session_ids: &[String],
    ) -> Result<(), ClientError> {
        for attempt in 1..=attempts {
            match self.try_recover_once(session_ids).await {
                Ok(()) => {
                    tracing::info!(
                        target = "farmhand::client::recovery",
                        node = self.node.name(),
                        attempt,
                        sessions = session_ids.len(),
                        "session recovered"
                    );
                    return Ok(());
                }
                Err(err) => {
                    tracing::debug!(
                        target = "farmhand::client::recovery",
                        node = self.node.name(),
                        attempt,
                        error = %err,
                        "recovery attempt failed"
                    );
                    if attempt < attempts {
                        tokio::time::sleep(interval).await;
                    }
                }
            }
        }
        let message = format!("gave up after {attempts} attempts");
        self.node.set_exception(message.clone());
        Err(ClientError::RecoverFailed(message))
    }

    async fn try_recover_once(&self, session_ids: &[String]) -> Result<(), ClientError> {
        self.connect().await?;
        let conn = self.current_connection().await?;
        let reply = conn
            .request(
                ClientMessage::Recover {
                    session_ids: session_ids.to_vec(),
                },
                ReplyKind::Recover,
                &CancellationToken::new(),
            )
            .await?;
        match reply {
            ServerMessage::RecoverResponse { success: true, .. } => Ok(()),
            ServerMessage::RecoverResponse { message, .. } => {
                Err(ClientError::RecoverFailed(message))
            }
            other => Err(ClientError::Protocol(format!(
                "recover reply out of shape: {other:?}"
            ))),
        }
    }
}
