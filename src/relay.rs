//! HTTP client for the relay's management API.
//!
//! [`RelayClient`] wraps `reqwest::Client` and exposes the one read-only
//! lookup the supervision core needs: the list of currently live tunnel
//! registrations. Confirmation pollers call it on every tick, so transport
//! failures are expected traffic — they are surfaced as [`RelayError`] and
//! handled (retried) by the caller, never panicked on.

use std::time::Duration;

use serde::Deserialize;

use crate::config::Settings;

/// One live tunnel registration as reported by the relay.
#[derive(Debug, Clone, Deserialize)]
pub struct Registration {
    /// Local service address the agent registered for.
    #[serde(default)]
    pub service_url: String,
    /// Label the agent registered under.
    #[serde(default)]
    pub label: String,
    /// Relay-assigned public subdomain.
    pub subdomain: String,
}

/// HTTP client for a single relay.
#[derive(Clone)]
pub struct RelayClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl RelayClient {
    /// Build a client for the relay named in `settings`.
    pub fn new(settings: &Settings) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(15))
            .build()
            .expect("Failed to build HTTP client");
        Self {
            http,
            base_url: settings.relay_api_url(),
            api_key: settings.relay.api_key.clone(),
        }
    }

    /// `GET /v1/tunnels` — list currently live tunnel registrations.
    pub async fn live_tunnels(&self) -> Result<Vec<Registration>, RelayError> {
        let resp = self
            .http
            .get(format!("{}/v1/tunnels", self.base_url))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(RelayError::Request)?;

        let status = resp.status();
        let body = resp.text().await.map_err(RelayError::Request)?;
        if !status.is_success() {
            return Err(RelayError::Status {
                status: status.as_u16(),
                message: body,
            });
        }
        serde_json::from_str(&body)
            .map_err(|e| RelayError::Protocol(format!("Invalid JSON from relay: {e}")))
    }
}

/// Errors returned by [`RelayClient`] methods.
#[derive(Debug)]
pub enum RelayError {
    /// HTTP transport error (connection refused, timeout, DNS failure, etc.).
    Request(reqwest::Error),
    /// The relay returned a non-2xx HTTP status.
    Status { status: u16, message: String },
    /// The response body was not valid JSON.
    Protocol(String),
}

impl std::fmt::Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayError::Request(e) => write!(f, "Relay request failed: {e}"),
            RelayError::Status { status, message } => {
                write!(f, "Relay error (HTTP {status}): {message}")
            }
            RelayError::Protocol(msg) => write!(f, "Relay protocol error: {msg}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registration_parses_bare_array() {
        let body = r#"[
            {"service_url": "http://localhost:8000", "label": "homeassistant", "subdomain": "abc123"},
            {"subdomain": "xyz789"}
        ]"#;
        let regs: Vec<Registration> = serde_json::from_str(body).unwrap();
        assert_eq!(regs.len(), 2);
        assert_eq!(regs[0].subdomain, "abc123");
        assert_eq!(regs[0].label, "homeassistant");
        // Fields the relay omits default to empty rather than failing the poll
        assert!(regs[1].service_url.is_empty());
    }
}
