use tokio_util::sync::CancellationToken;

use super::connection::Connection;
use super::ClientError;
use crate::node::Node;
use crate::protocol::{client_version, ClientMessage, ReplyKind, ServerMessage, PROTOCOL_VERSION};

/// Version gate, optional authentication, and capability query. Runs first
/// on every fresh connection, including the ones recovery opens.
pub(crate) async fn run(conn: &Connection, node: &Node) -> Result<(), ClientError> {
    let cancel = CancellationToken::new();
    let (major, minor, patch) = client_version();

    let reply = conn
        .request(
            ClientMessage::CheckProtocol {
                major,
                minor,
                patch,
                protocol_version: PROTOCOL_VERSION,
            },
            ReplyKind::CheckProtocol,
            &cancel,
        )
        .await?;
    let require_auth = match reply {
        ServerMessage::CheckProtocolResponse {
            protocol_version,
            require_auth,
        } => {
            if protocol_version != PROTOCOL_VERSION {
                return Err(ClientError::OutdatedProtocol {
                    server: protocol_version,
                    client: PROTOCOL_VERSION,
                });
            }
            require_auth
        }
        other => {
            return Err(ClientError::Protocol(format!(
                "handshake reply out of shape: {other:?}"
            )))
        }
    };

    if require_auth {
        let pass = node.pass().unwrap_or_default().to_string();
        match conn
            .request(ClientMessage::Auth { pass }, ReplyKind::Auth, &cancel)
            .await
        {
            Ok(ServerMessage::AuthResponse {
                is_authenticated: true,
            }) => {}
            // A rejected password and a connection that died during auth
            // surface the same way to the caller.
            Ok(_) | Err(_) => return Err(ClientError::AuthFailed),
        }
        tracing::debug!(
            target = "farmhand::client::handshake",
            node = node.name(),
            "authenticated"
        );
    }

    let reply = conn
        .request(ClientMessage::ComputerInfo, ReplyKind::ComputerInfo, &cancel)
        .await?;
    if let ServerMessage::ComputerInfoResponse { name, os, cores } = reply {
        tracing::info!(
            target = "farmhand::client::handshake",
            node = node.name(),
            computer = %name,
            os = %os,
            cores,
            "handshake complete"
        );
        node.set_computer_info(name, os, cores);
    }

    Ok(())
}
