//! Durable tunnel definitions.
//!
//! [`ConfigStore`] persists the full id → [`TunnelConfig`] mapping as one
//! pretty-printed JSON file under the data directory. There are no partial
//! writes: callers load the whole mapping, mutate it in memory, and save it
//! back. The stored record is the single source of truth for what should be
//! running — process handles and session flags are derived caches.
//!
//! A missing file reads as an empty mapping (first boot). A file that exists
//! but does not parse is [`StoreError::Corrupt`], which is fatal at startup:
//! silently dropping records would orphan running tunnels.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;

/// File name of the tunnel store inside the data directory.
const STORE_FILE: &str = "tunnels.json";

/// How visitors authenticate against the relay edge for a tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// Relay-side single sign-on in front of the tunnel.
    Sso,
    /// Tunnel is publicly reachable.
    None,
}

impl Default for AuthMode {
    fn default() -> Self {
        AuthMode::Sso
    }
}

impl AuthMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            AuthMode::Sso => "sso",
            AuthMode::None => "none",
        }
    }
}

/// One tunnel definition. `id` is assigned at creation and never changes;
/// every other field may be replaced by an update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Opaque identifier (8 hex chars), unique, immutable.
    pub id: String,
    /// Address of the local service being exposed.
    pub service_url: String,
    /// Human-facing identifier, also used for relay registration.
    pub label: String,
    /// Optional display name; presentation falls back to `label`.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub auth_mode: AuthMode,
    /// Whether the agent validates the upstream TLS certificate.
    #[serde(default = "default_true")]
    pub verify_ssl: bool,
    #[serde(default = "default_true")]
    pub websocket_enabled: bool,
    /// Per-tunnel credential override; `None` means the process-wide key.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Credential forwarded to the local service.
    #[serde(default)]
    pub upstream_basic_auth: Option<String>,
    /// Relay-assigned public identifier. Set only after the relay confirms
    /// the tunnel live; cleared whenever `service_url` or `label` changes,
    /// since a new agent invocation may register under a different name.
    #[serde(default)]
    pub subdomain: Option<String>,
}

fn default_true() -> bool {
    true
}

impl TunnelConfig {
    /// Display name: `name` when set, otherwise `label`.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.label)
    }
}

/// Whole-mapping JSON persistence for tunnel definitions.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join(STORE_FILE),
        }
    }

    /// Path of the backing file (for logging and tests).
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the full mapping. A missing file is an empty mapping; anything
    /// else that fails to read or parse is an error.
    pub async fn load_all(&self) -> Result<HashMap<String, TunnelConfig>, StoreError> {
        let data = match fs::read(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => return Err(StoreError::Io(e)),
        };
        serde_json::from_slice(&data).map_err(StoreError::Corrupt)
    }

    /// Write the full mapping, creating the data directory if needed.
    pub async fn save_all(
        &self,
        tunnels: &HashMap<String, TunnelConfig>,
    ) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await.map_err(StoreError::Io)?;
        }
        let data = serde_json::to_vec_pretty(tunnels).map_err(StoreError::Corrupt)?;
        fs::write(&self.path, data).await.map_err(StoreError::Io)
    }
}

/// Errors from [`ConfigStore`] operations.
#[derive(Debug)]
pub enum StoreError {
    /// The backing file could not be read or written.
    Io(std::io::Error),
    /// The backing file exists but is not valid JSON for the expected shape.
    Corrupt(serde_json::Error),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Io(e) => write!(f, "Tunnel store I/O error: {e}"),
            StoreError::Corrupt(e) => write!(f, "Tunnel store is corrupt: {e}"),
        }
    }
}
