//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `TUNNELD_API_KEY`, `TUNNELD_RELAY_HOST`,
//!    `TUNNELD_DATA_DIR`
//! 2. **Config file** — path via `--config <path>`, or `tunneld.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [relay]
//! host = "tunneld.dev"
//! api_key = "your-relay-key"
//! confirm_attempts = 15
//! confirm_interval_secs = 2
//!
//! [agent]
//! program = "tunnel-agent"
//! stop_timeout_secs = 5
//!
//! [storage]
//! data_dir = "/var/lib/tunneld"
//! log_dir = "/var/lib/tunneld/logs"
//!
//! [logging]
//! level = "info"
//! ```

use serde::Deserialize;
use std::path::Path;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub relay: RelaySettings,
    #[serde(default)]
    pub agent: AgentSettings,
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Relay connectivity and confirmation-poll settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RelaySettings {
    /// Relay domain. Public URLs are `https://<subdomain>.<host>` and the
    /// relay API lives at `https://api.<host>` unless `api_url` overrides it.
    #[serde(default = "default_relay_host")]
    pub host: String,
    /// Process-wide relay credential. Empty means unconfigured — tunnels are
    /// not spawned until a key is set. Override with `TUNNELD_API_KEY`.
    #[serde(default)]
    pub api_key: String,
    /// Base URL override for the relay API (self-hosted relays, tests).
    pub api_url: Option<String>,
    /// Poll attempts before giving up on relay confirmation (default 15).
    #[serde(default = "default_confirm_attempts")]
    pub confirm_attempts: u32,
    /// Seconds between confirmation polls (default 2).
    #[serde(default = "default_confirm_interval")]
    pub confirm_interval_secs: u64,
}

/// Tunnel agent binary settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentSettings {
    /// Agent executable spawned per tunnel (default `tunnel-agent`, resolved
    /// via `PATH` unless absolute).
    #[serde(default = "default_agent_program")]
    pub program: String,
    /// Seconds to wait after SIGTERM before escalating to SIGKILL (default 5).
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,
}

/// Durable state locations.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageSettings {
    /// Directory for persistent data (`tunnels.json`). Default `/var/lib/tunneld`.
    /// Override with `TUNNELD_DATA_DIR`.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Directory for per-tunnel agent logs. Default `/var/lib/tunneld/logs`.
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSettings {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_relay_host() -> String {
    "tunneld.dev".to_string()
}
fn default_confirm_attempts() -> u32 {
    15
}
fn default_confirm_interval() -> u64 {
    2
}
fn default_agent_program() -> String {
    "tunnel-agent".to_string()
}
fn default_stop_timeout() -> u64 {
    5
}
fn default_data_dir() -> String {
    "/var/lib/tunneld".to_string()
}
fn default_log_dir() -> String {
    "/var/lib/tunneld/logs".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            relay: RelaySettings::default(),
            agent: AgentSettings::default(),
            storage: StorageSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            host: default_relay_host(),
            api_key: String::new(),
            api_url: None,
            confirm_attempts: default_confirm_attempts(),
            confirm_interval_secs: default_confirm_interval(),
        }
    }
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            program: default_agent_program(),
            stop_timeout_secs: default_stop_timeout(),
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_dir: default_log_dir(),
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Settings {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise looks
    /// for `tunneld.toml` in the current directory, falling back to compiled
    /// defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut settings = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("tunneld.toml").exists() {
            let content =
                std::fs::read_to_string("tunneld.toml").expect("Failed to read tunneld.toml");
            toml::from_str(&content).expect("Failed to parse tunneld.toml")
        } else {
            Settings::default()
        };

        // Env var overrides
        if let Ok(key) = std::env::var("TUNNELD_API_KEY") {
            settings.relay.api_key = key;
        }
        if let Ok(host) = std::env::var("TUNNELD_RELAY_HOST") {
            settings.relay.host = host;
        }
        if let Ok(dir) = std::env::var("TUNNELD_DATA_DIR") {
            settings.storage.data_dir = dir;
        }

        settings
    }

    /// Whether a process-wide relay credential is configured. Without one,
    /// agents would fail to authenticate, so startup restoration is skipped.
    pub fn has_api_key(&self) -> bool {
        !self.relay.api_key.is_empty()
    }

    /// Base URL of the relay API (without trailing slash).
    pub fn relay_api_url(&self) -> String {
        match &self.relay.api_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("https://api.{}", self.relay.host),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.relay.host, "tunneld.dev");
        assert_eq!(settings.relay.confirm_attempts, 15);
        assert_eq!(settings.agent.stop_timeout_secs, 5);
        assert!(!settings.has_api_key());
    }

    #[test]
    fn test_parse_partial_toml() {
        let settings: Settings = toml::from_str(
            r#"
            [relay]
            host = "relay.example.com"
            api_key = "k-123"

            [agent]
            program = "/usr/local/bin/tunnel-agent"
            "#,
        )
        .unwrap();
        assert_eq!(settings.relay.host, "relay.example.com");
        assert!(settings.has_api_key());
        assert_eq!(settings.agent.program, "/usr/local/bin/tunnel-agent");
        // Unspecified sections keep compiled defaults
        assert_eq!(settings.storage.data_dir, "/var/lib/tunneld");
        assert_eq!(settings.relay.confirm_interval_secs, 2);
    }

    #[test]
    fn test_relay_api_url() {
        let mut settings = Settings::default();
        assert_eq!(settings.relay_api_url(), "https://api.tunneld.dev");
        settings.relay.api_url = Some("http://127.0.0.1:9000/".to_string());
        assert_eq!(settings.relay_api_url(), "http://127.0.0.1:9000");
    }
}
