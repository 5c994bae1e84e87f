use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed settings: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// A node remembered across launches. Mirrors the connect parameters, not
/// the live state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PastClient {
    pub name: String,
    pub address: String,
    #[serde(default)]
    pub render_type: Option<String>,
    #[serde(default)]
    pub performance: f64,
    #[serde(default)]
    pub pass: Option<String>,
    #[serde(default)]
    pub mac: Option<String>,
}

/// Per-project sync preferences: direct upload versus a network share the
/// node can read itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSettings {
    #[serde(default)]
    pub use_networked: bool,
    #[serde(default)]
    pub net_path_windows: String,
    #[serde(default)]
    pub net_path_linux: String,
    #[serde(default, rename = "netPathMacOS")]
    pub net_path_macos: String,
}

/// The persisted settings blob. The schema is stable across releases; fields
/// default individually so blobs written by older builds still load.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default)]
    pub local_blend_files: String,
    #[serde(default)]
    pub listen_for_broadcasts: bool,
    #[serde(default)]
    pub last_version: String,
    #[serde(default)]
    pub history: Vec<String>,
    #[serde(default)]
    pub past_clients: BTreeMap<String, PastClient>,
    #[serde(default)]
    pub project_settings: BTreeMap<String, ProjectSettings>,
    /// Free-form `option_*` feature toggles.
    #[serde(flatten)]
    pub options: BTreeMap<String, bool>,
}

impl Settings {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let raw = tokio::fs::read(path).await?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Load, falling back to defaults when the file does not exist yet.
    pub async fn load_or_default(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        match tokio::fs::read(path).await {
            Ok(raw) => Ok(serde_json::from_slice(&raw)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(err.into()),
        }
    }

    /// Write atomically: serialize to a sibling temp file, then rename over
    /// the destination.
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<(), SettingsError> {
        let path = path.as_ref();
        let raw = serde_json::to_vec_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &raw).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    pub fn option(&self, name: &str) -> bool {
        self.options.get(name).copied().unwrap_or(false)
    }

    pub fn set_option(&mut self, name: impl Into<String>, value: bool) {
        self.options.insert(name.into(), value);
    }
}
