pub mod wire;

use serde::{Deserialize, Serialize};

/// Wire protocol revision. A node whose protocol differs is rejected during
/// the handshake; there is no cross-version negotiation.
pub const PROTOCOL_VERSION: u32 = 1;

/// Client semver reported in `CheckProtocol`, taken from the crate version.
pub fn client_version() -> (u32, u32, u32) {
    let mut parts = env!("CARGO_PKG_VERSION")
        .split('.')
        .map(|part| part.parse::<u32>().unwrap_or(0));
    (
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
    )
}

/// Render backend requested from the node. Forwarded opaquely; the node
/// decides what it can actually provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderType {
    Cpu,
    Cuda,
    Optix,
    Hip,
    Metal,
    OneApi,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    None,
    Gzip,
}

/// Crop window in normalized scene coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Crop {
    pub x_min: f64,
    pub x_max: f64,
    pub y_min: f64,
    pub y_max: f64,
}

/// Per-task render parameters forwarded to the node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderSettings {
    pub frame: i64,
    pub cores: i32,
    pub device: RenderType,
    pub width: u32,
    pub height: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub samples: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crop: Option<Crop>,
}

/// Messages sent from the client to a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    CheckProtocol {
        major: u32,
        minor: u32,
        patch: u32,
        protocol_version: u32,
    },
    Auth {
        pass: String,
    },
    ComputerInfo,
    Prepare {
        version: String,
    },
    IsVersionAvailable {
        version: String,
    },
    SyncStart {
        session_id: String,
        file_id: i64,
        compression: Compression,
    },
    SyncUpload {
        upload_id: String,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    SyncComplete {
        upload_id: String,
    },
    SyncNetwork {
        session_id: String,
        file_id: i64,
        windows_path: String,
        linux_path: String,
        macos_path: String,
    },
    CheckSync {
        session_id: String,
        file_id: i64,
    },
    Render {
        task_id: String,
        session_id: String,
        settings: RenderSettings,
    },
    RenderBatch {
        task_id: String,
        session_id: String,
        frames: Vec<i64>,
        settings: RenderSettings,
    },
    BlenderPeek {
        task_id: String,
        session_id: String,
    },
    IsBusy,
    CancelRender {
        session_id: String,
    },
    Recover {
        session_ids: Vec<String>,
    },
}

/// Messages received from a node: correlated replies and unsolicited events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    CheckProtocolResponse {
        protocol_version: u32,
        require_auth: bool,
    },
    AuthResponse {
        is_authenticated: bool,
    },
    ComputerInfoResponse {
        name: String,
        os: String,
        cores: i32,
    },
    PrepareResponse {
        success: bool,
        #[serde(default)]
        message: String,
    },
    VersionAvailableResponse {
        success: bool,
    },
    SyncResponse {
        success: bool,
        #[serde(default)]
        same_file: bool,
        #[serde(default)]
        upload_id: Option<String>,
        #[serde(default)]
        message: String,
    },
    SyncUploadResponse {
        success: bool,
        #[serde(default)]
        message: String,
    },
    SyncCompleteResponse {
        success: bool,
    },
    CheckSyncResponse {
        success: bool,
    },
    RenderResponse {
        task_id: String,
        success: bool,
        #[serde(default)]
        message: String,
        #[serde(default, with = "opt_base64_bytes")]
        frame: Option<Vec<u8>>,
    },
    RenderBatchResponse {
        task_id: String,
        success: bool,
        #[serde(default)]
        message: String,
    },
    BlenderPeekResponse {
        task_id: String,
        success: bool,
        #[serde(default)]
        message: String,
        #[serde(default)]
        resolution_x: u32,
        #[serde(default)]
        resolution_y: u32,
        #[serde(default)]
        frame_start: i64,
        #[serde(default)]
        frame_end: i64,
        #[serde(default)]
        cameras: Vec<String>,
    },
    IsBusyResponse {
        is_busy: bool,
    },
    RecoverResponse {
        success: bool,
        #[serde(default)]
        message: String,
    },
    // Unsolicited events below; these never carry a correlation id.
    RenderInfo {
        task_id: String,
        tiles_finished: u32,
        tiles_total: u32,
    },
    RenderBatchResult {
        task_id: String,
        frame: i64,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    ActivityRequest {
        activity: String,
        progress: f64,
    },
    ConsoleActivityResponse {
        output: String,
    },
    Disconnected {
        is_error: bool,
        #[serde(default)]
        reason: String,
    },
}

/// Reply discriminant used to validate correlated responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    CheckProtocol,
    Auth,
    ComputerInfo,
    Prepare,
    VersionAvailable,
    Sync,
    SyncUpload,
    SyncComplete,
    CheckSync,
    Render,
    RenderBatch,
    BlenderPeek,
    IsBusy,
    Recover,
}

impl ServerMessage {
    /// Reply discriminant, or `None` for unsolicited events.
    pub fn reply_kind(&self) -> Option<ReplyKind> {
        match self {
            ServerMessage::CheckProtocolResponse { .. } => Some(ReplyKind::CheckProtocol),
            ServerMessage::AuthResponse { .. } => Some(ReplyKind::Auth),
            ServerMessage::ComputerInfoResponse { .. } => Some(ReplyKind::ComputerInfo),
            ServerMessage::PrepareResponse { .. } => Some(ReplyKind::Prepare),
            ServerMessage::VersionAvailableResponse { .. } => Some(ReplyKind::VersionAvailable),
            ServerMessage::SyncResponse { .. } => Some(ReplyKind::Sync),
            ServerMessage::SyncUploadResponse { .. } => Some(ReplyKind::SyncUpload),
            ServerMessage::SyncCompleteResponse { .. } => Some(ReplyKind::SyncComplete),
            ServerMessage::CheckSyncResponse { .. } => Some(ReplyKind::CheckSync),
            ServerMessage::RenderResponse { .. } => Some(ReplyKind::Render),
            ServerMessage::RenderBatchResponse { .. } => Some(ReplyKind::RenderBatch),
            ServerMessage::BlenderPeekResponse { .. } => Some(ReplyKind::BlenderPeek),
            ServerMessage::IsBusyResponse { .. } => Some(ReplyKind::IsBusy),
            ServerMessage::RecoverResponse { .. } => Some(ReplyKind::Recover),
            _ => None,
        }
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

mod opt_base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded = Option::<String>::deserialize(deserializer)?;
        encoded
            .map(|value| STANDARD.decode(value.as_bytes()))
            .transpose()
            .map_err(serde::de::Error::custom)
    }
}
