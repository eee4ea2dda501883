//! Relay confirmation poller.
//!
//! Every spawn starts one fire-and-forget poller task that repeatedly asks
//! the relay whether the new agent's registration has come live. On a match
//! it persists the discovered subdomain and marks the tunnel connected; on
//! exhausted attempts it simply ends, leaving the tunnel in the connecting
//! presentation state until some future spawn tries again.
//!
//! Pollers are never force-cancelled. Each one captures the pid of the spawn
//! that started it and aborts as soon as the registry entry is gone, exited,
//! or owned by a different pid, so a superseded poller cannot corrupt state
//! with a late-arriving confirmation.

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::relay::Registration;

use super::TunnelManager;

/// Start the confirmation poller for one spawn event.
pub(super) fn spawn_confirm_poller(
    manager: TunnelManager,
    id: String,
    service_url: String,
    label: String,
    pid: u32,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let attempts = manager.settings.relay.confirm_attempts;
        let interval = Duration::from_secs(manager.settings.relay.confirm_interval_secs);

        for attempt in 1..=attempts {
            tokio::time::sleep(interval).await;

            // The process this poller was started for is gone or replaced —
            // a late confirmation would describe a different agent.
            if !manager.agent_pid_matches(&id, pid).await {
                debug!("Tunnel {id}: poller superseded, stopping");
                return;
            }

            let registrations = match manager.relay.live_tunnels().await {
                Ok(regs) => regs,
                Err(e) => {
                    // Transient relay unavailability — retry on the next tick.
                    debug!("Tunnel {id}: relay poll {attempt}/{attempts} failed: {e}");
                    continue;
                }
            };

            if let Some(subdomain) = match_registration(&registrations, &service_url, &label) {
                info!("Tunnel {id}: relay confirmed live as '{subdomain}'");
                manager.confirm_connected(&id, &subdomain).await;
                return;
            }
        }
        debug!("Tunnel {id}: not confirmed after {attempts} attempts, giving up");
    })
}

/// Match a live registration to a tunnel by service URL or label.
fn match_registration(
    registrations: &[Registration],
    service_url: &str,
    label: &str,
) -> Option<String> {
    registrations
        .iter()
        .find(|reg| reg.service_url == service_url || reg.label == label)
        .map(|reg| reg.subdomain.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reg(service_url: &str, label: &str, subdomain: &str) -> Registration {
        Registration {
            service_url: service_url.to_string(),
            label: label.to_string(),
            subdomain: subdomain.to_string(),
        }
    }

    #[test]
    fn test_match_by_service_url() {
        let regs = vec![reg("http://localhost:8000", "other", "abc123")];
        assert_eq!(
            match_registration(&regs, "http://localhost:8000", "homeassistant").as_deref(),
            Some("abc123")
        );
    }

    #[test]
    fn test_match_by_label() {
        let regs = vec![reg("http://elsewhere:1234", "homeassistant", "abc123")];
        assert_eq!(
            match_registration(&regs, "http://localhost:8000", "homeassistant").as_deref(),
            Some("abc123")
        );
    }

    #[test]
    fn test_no_match() {
        let regs = vec![reg("http://elsewhere:1234", "other", "abc123")];
        assert!(match_registration(&regs, "http://localhost:8000", "homeassistant").is_none());
    }

    #[test]
    fn test_first_match_wins() {
        let regs = vec![
            reg("http://localhost:8000", "ha", "first"),
            reg("http://localhost:8000", "ha", "second"),
        ];
        assert_eq!(
            match_registration(&regs, "http://localhost:8000", "ha").as_deref(),
            Some("first")
        );
    }
}
