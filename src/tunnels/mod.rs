//! Tunnel lifecycle management.
//!
//! [`TunnelManager`] is the single authority for creating, updating,
//! starting, stopping, and removing tunnels. It owns three pieces of state:
//!
//! - the durable [`ConfigStore`] — what *should* be running,
//! - the agent registry — which child processes *are* running,
//! - the session flags — whether a tunnel was confirmed by the relay this
//!   process lifetime, and whether the operator deliberately stopped it.
//!
//! The registry and flags are ephemeral: on restart the registry is empty
//! and [`TunnelManager::restore_all`] rebuilds it from the store. Presented
//! status is always derived from live observation (see [`derive_state`]) so
//! it can never contradict the actual OS process state.
//!
//! ## Concurrency
//!
//! The registry and flags sit behind `RwLock`s. Graceful kills happen
//! outside the registry lock so a slow-to-die agent cannot stall status
//! queries. Operations against a single tunnel id are expected to be issued
//! sequentially by the caller; the store itself is read-modify-write with
//! last-writer-wins.

pub mod agent;
pub mod logs;
mod poller;

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Settings;
use crate::relay::RelayClient;
use crate::store::{AuthMode, ConfigStore, StoreError, TunnelConfig};

use agent::{AgentProcess, LaunchError};

/// Presented tunnel state, derived from live observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TunnelState {
    /// Operator asked for the tunnel to be stopped; process is down.
    Stopped,
    /// Process is up but the relay has not confirmed the registration yet.
    Connecting,
    /// Process is up and the relay confirmed the registration this lifetime.
    Connected,
    /// Process is down without the operator asking for it.
    Failed,
}

impl TunnelState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            TunnelState::Stopped => "STOPPED",
            TunnelState::Connecting => "CONNECTING",
            TunnelState::Connected => "CONNECTED",
            TunnelState::Failed => "FAILED",
        }
    }
}

/// Derive the presented state from the three observed facts.
///
/// "Not running and not user-stopped" is always FAILED — there is no
/// distinct "never started" state, because a config only exists after at
/// least one spawn attempt.
#[must_use]
pub fn derive_state(running: bool, user_stopped: bool, connected: bool) -> TunnelState {
    match (running, user_stopped, connected) {
        (false, true, _) => TunnelState::Stopped,
        (false, false, _) => TunnelState::Failed,
        (true, _, true) => TunnelState::Connected,
        (true, _, false) => TunnelState::Connecting,
    }
}

/// A tunnel definition together with its derived runtime status.
#[derive(Debug, Clone, Serialize)]
pub struct TunnelStatus {
    #[serde(flatten)]
    pub config: TunnelConfig,
    pub state: TunnelState,
    /// `https://<subdomain>.<relay host>` once a subdomain is known.
    pub public_url: Option<String>,
    /// Agent PID, exposed only while the process is running.
    pub pid: Option<u32>,
    /// Last non-empty agent log line, attached only in FAILED.
    pub error: Option<String>,
}

/// Request to create a tunnel. Unset optional fields become none.
#[derive(Debug, Clone, Deserialize)]
pub struct AddTunnelRequest {
    pub service_url: String,
    pub label: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub auth_mode: AuthMode,
    #[serde(default = "default_true")]
    pub verify_ssl: bool,
    #[serde(default = "default_true")]
    pub websocket_enabled: bool,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub upstream_basic_auth: Option<String>,
}

fn default_true() -> bool {
    true
}

/// Partial update: only fields present are applied. An explicit empty string
/// clears an optional field (distinguished from the field being omitted).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateTunnelRequest {
    pub service_url: Option<String>,
    pub label: Option<String>,
    pub name: Option<String>,
    pub auth_mode: Option<AuthMode>,
    pub verify_ssl: Option<bool>,
    pub websocket_enabled: Option<bool>,
    pub api_key: Option<String>,
    pub upstream_basic_auth: Option<String>,
}

/// Errors returned by the mutating [`TunnelManager`] operations.
#[derive(Debug)]
pub enum TunnelError {
    /// The operation referenced an unknown tunnel id.
    NotFound(String),
    /// The durable store failed underneath the operation.
    Store(StoreError),
}

impl std::fmt::Display for TunnelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TunnelError::NotFound(id) => write!(f, "Tunnel {id} not found"),
            TunnelError::Store(e) => write!(f, "{e}"),
        }
    }
}

impl From<StoreError> for TunnelError {
    fn from(e: StoreError) -> Self {
        TunnelError::Store(e)
    }
}

/// Ephemeral per-session presentation flags.
///
/// Process exit alone cannot distinguish "operator stopped it" from "it
/// crashed"; `user_stopped` carries that intent. Both sets reset with the
/// process.
#[derive(Default)]
struct SessionFlags {
    connected: HashSet<String>,
    user_stopped: HashSet<String>,
}

/// Manages the pool of tunnel agent processes.
///
/// Cloneable — all clones share the same registries.
#[derive(Clone)]
pub struct TunnelManager {
    settings: Arc<Settings>,
    store: ConfigStore,
    relay: RelayClient,
    agents: Arc<RwLock<HashMap<String, AgentProcess>>>,
    flags: Arc<RwLock<SessionFlags>>,
}

impl TunnelManager {
    pub fn new(settings: Settings) -> Self {
        let store = ConfigStore::new(Path::new(&settings.storage.data_dir));
        let relay = RelayClient::new(&settings);
        Self {
            settings: Arc::new(settings),
            store,
            relay,
            agents: Arc::new(RwLock::new(HashMap::new())),
            flags: Arc::new(RwLock::new(SessionFlags::default())),
        }
    }

    /// Spawn agents for every persisted config that isn't already running.
    /// Called once at startup, and again whenever the process-wide relay key
    /// changes.
    ///
    /// With no relay key configured nothing is spawned — the agents could
    /// not authenticate, so the configs are left un-spawned until a key
    /// arrives. Per-tunnel spawn failures are reported, never fatal to the
    /// batch. A corrupt store *is* fatal: silently dropping records is worse
    /// than refusing to start.
    pub async fn restore_all(&self) -> Result<(), TunnelError> {
        if !self.settings.has_api_key() {
            warn!("No relay API key configured — leaving persisted tunnels stopped");
            return Ok(());
        }

        let tunnels = self.store.load_all().await?;
        let mut started = 0usize;
        let mut failed = 0usize;
        for (id, cfg) in &tunnels {
            if self.is_agent_running(id).await {
                continue;
            }
            self.flags.write().await.user_stopped.remove(id);
            match self.spawn_agent(cfg).await {
                Ok(pid) => {
                    self.start_poller(cfg, pid);
                    started += 1;
                }
                Err(e) => {
                    warn!("Tunnel {id}: restore failed: {e}");
                    failed += 1;
                }
            }
        }
        if !tunnels.is_empty() {
            info!(
                "Restored {started} of {} tunnel(s) ({failed} failed)",
                tunnels.len()
            );
        }
        Ok(())
    }

    /// Best-effort orderly shutdown of every running agent.
    ///
    /// SIGTERM all process groups at once, wait up to the stop timeout for
    /// them to exit, then SIGKILL the stragglers. Individual failures never
    /// block cleanup of the rest and nothing here can hang the caller.
    pub async fn shutdown_all(&self) {
        let mut agents = self.agents.write().await;
        let count = agents.len();
        if count == 0 {
            return;
        }

        // Phase 1: SIGTERM all
        for (id, a) in agents.iter() {
            if a.is_running().await {
                a.signal_group(libc::SIGTERM);
                info!("Tunnel {id}: SIGTERM sent (shutdown)");
            }
        }

        // Phase 2: bounded wait for everything to exit
        let deadline = tokio::time::Instant::now() + self.stop_timeout();
        loop {
            let mut all_exited = true;
            for a in agents.values() {
                if a.is_running().await {
                    all_exited = false;
                    break;
                }
            }
            if all_exited || tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        // Phase 3: SIGKILL any remaining
        for (id, a) in agents.drain() {
            if a.is_running().await {
                a.kill();
                info!("Tunnel {id}: SIGKILL (shutdown)");
            }
        }
        info!("Shut down {count} tunnel agent(s)");
    }

    /// Create a tunnel: fresh id, spawn, persist, start the confirmation
    /// poller. A spawn failure is surfaced through FAILED status rather than
    /// an error return — the definition is stored either way.
    pub async fn add_tunnel(&self, req: AddTunnelRequest) -> Result<TunnelConfig, TunnelError> {
        let mut tunnels = self.store.load_all().await?;
        let cfg = TunnelConfig {
            id: short_id(),
            service_url: req.service_url,
            label: req.label,
            name: req.name,
            auth_mode: req.auth_mode,
            verify_ssl: req.verify_ssl,
            websocket_enabled: req.websocket_enabled,
            api_key: req.api_key,
            upstream_basic_auth: req.upstream_basic_auth,
            subdomain: None,
        };

        let pid = match self.spawn_agent(&cfg).await {
            Ok(pid) => Some(pid),
            Err(e) => {
                warn!("Tunnel {}: agent failed to start: {e}", cfg.id);
                None
            }
        };

        tunnels.insert(cfg.id.clone(), cfg.clone());
        self.store.save_all(&tunnels).await?;

        if let Some(pid) = pid {
            self.start_poller(&cfg, pid);
        }
        info!(
            "Tunnel {} added ({} -> '{}')",
            cfg.id, cfg.service_url, cfg.label
        );
        Ok(cfg)
    }

    /// Apply a partial update, then respawn regardless of prior run state.
    ///
    /// When the effective `service_url` or `label` changes the stored
    /// subdomain is cleared — the new agent invocation may register under a
    /// different name, and a stale subdomain must not be presented as live.
    pub async fn update_tunnel(
        &self,
        id: &str,
        patch: UpdateTunnelRequest,
    ) -> Result<TunnelConfig, TunnelError> {
        let mut tunnels = self.store.load_all().await?;
        let Some(existing) = tunnels.get_mut(id) else {
            return Err(TunnelError::NotFound(id.to_string()));
        };

        let old_service_url = existing.service_url.clone();
        let old_label = existing.label.clone();

        if let Some(v) = patch.service_url {
            existing.service_url = v;
        }
        if let Some(v) = patch.label {
            existing.label = v;
        }
        if let Some(v) = patch.name {
            existing.name = none_if_empty(v);
        }
        if let Some(v) = patch.auth_mode {
            existing.auth_mode = v;
        }
        if let Some(v) = patch.verify_ssl {
            existing.verify_ssl = v;
        }
        if let Some(v) = patch.websocket_enabled {
            existing.websocket_enabled = v;
        }
        if let Some(v) = patch.api_key {
            existing.api_key = none_if_empty(v);
        }
        if let Some(v) = patch.upstream_basic_auth {
            existing.upstream_basic_auth = none_if_empty(v);
        }
        if existing.service_url != old_service_url || existing.label != old_label {
            existing.subdomain = None;
        }

        let cfg = existing.clone();
        self.store.save_all(&tunnels).await?;

        if let Some(a) = self.take_agent(id).await {
            a.stop_graceful(self.stop_timeout()).await;
        }
        {
            let mut flags = self.flags.write().await;
            flags.connected.remove(id);
            flags.user_stopped.remove(id);
        }
        match self.spawn_agent(&cfg).await {
            Ok(pid) => self.start_poller(&cfg, pid),
            Err(e) => warn!("Tunnel {id}: agent failed to start after update: {e}"),
        }
        info!("Tunnel {id} updated");
        Ok(cfg)
    }

    /// Stop the agent, drop all in-memory state for the id, and delete the
    /// persisted record.
    pub async fn remove_tunnel(&self, id: &str) -> Result<(), TunnelError> {
        let mut tunnels = self.store.load_all().await?;
        if !tunnels.contains_key(id) {
            return Err(TunnelError::NotFound(id.to_string()));
        }

        // Mark stopped first so concurrent observers see STOPPED rather than
        // FAILED while the agent is being torn down.
        {
            let mut flags = self.flags.write().await;
            flags.user_stopped.insert(id.to_string());
            flags.connected.remove(id);
        }
        if let Some(a) = self.take_agent(id).await {
            a.stop_graceful(self.stop_timeout()).await;
        }

        tunnels.remove(id);
        self.store.save_all(&tunnels).await?;

        let mut flags = self.flags.write().await;
        flags.user_stopped.remove(id);
        flags.connected.remove(id);
        info!("Tunnel {id} removed");
        Ok(())
    }

    /// Start a stopped or failed tunnel. No-op if already running.
    pub async fn start_tunnel(&self, id: &str) -> Result<(), TunnelError> {
        let tunnels = self.store.load_all().await?;
        let Some(cfg) = tunnels.get(id) else {
            return Err(TunnelError::NotFound(id.to_string()));
        };
        if self.is_agent_running(id).await {
            return Ok(());
        }

        {
            let mut flags = self.flags.write().await;
            flags.connected.remove(id);
            flags.user_stopped.remove(id);
        }
        match self.spawn_agent(cfg).await {
            Ok(pid) => {
                self.start_poller(cfg, pid);
                info!("Tunnel {id} started");
            }
            Err(e) => warn!("Tunnel {id}: agent failed to start: {e}"),
        }
        Ok(())
    }

    /// Stop the agent and remember that the operator asked for it.
    pub async fn stop_tunnel(&self, id: &str) {
        {
            let mut flags = self.flags.write().await;
            flags.user_stopped.insert(id.to_string());
            flags.connected.remove(id);
        }
        if let Some(a) = self.take_agent(id).await {
            a.stop_graceful(self.stop_timeout()).await;
            info!("Tunnel {id} stopped");
        }
    }

    /// Status of every persisted tunnel.
    pub async fn list_tunnels(&self) -> Result<Vec<TunnelStatus>, TunnelError> {
        let tunnels = self.store.load_all().await?;
        let mut result = Vec::with_capacity(tunnels.len());
        for cfg in tunnels.values() {
            result.push(self.status_for(cfg).await);
        }
        Ok(result)
    }

    /// Status of one tunnel, or `None` for an unknown id.
    pub async fn get_tunnel(&self, id: &str) -> Result<Option<TunnelStatus>, TunnelError> {
        let tunnels = self.store.load_all().await?;
        match tunnels.get(id) {
            Some(cfg) => Ok(Some(self.status_for(cfg).await)),
            None => Ok(None),
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    async fn status_for(&self, cfg: &TunnelConfig) -> TunnelStatus {
        let mut pid = None;
        {
            let agents = self.agents.read().await;
            if let Some(a) = agents.get(&cfg.id) {
                if a.is_running().await {
                    pid = Some(a.pid);
                }
            }
        }
        let (user_stopped, connected) = {
            let flags = self.flags.read().await;
            (
                flags.user_stopped.contains(&cfg.id),
                flags.connected.contains(&cfg.id),
            )
        };
        let state = derive_state(pid.is_some(), user_stopped, connected);

        let error = if state == TunnelState::Failed {
            let path = logs::log_path(Path::new(&self.settings.storage.log_dir), &cfg.id);
            logs::last_line(&path).await
        } else {
            None
        };
        let public_url = cfg
            .subdomain
            .as_ref()
            .map(|s| format!("https://{s}.{}", self.settings.relay.host));

        TunnelStatus {
            config: cfg.clone(),
            state,
            public_url,
            pid,
            error,
        }
    }

    /// Launch the agent and record its handle. The caller starts the poller
    /// once the config is safely persisted.
    async fn spawn_agent(&self, cfg: &TunnelConfig) -> Result<u32, LaunchError> {
        let a = AgentProcess::launch(cfg, &self.settings)?;
        let pid = a.pid;
        self.agents.write().await.insert(cfg.id.clone(), a);
        info!("Tunnel {}: agent spawned (pid {pid})", cfg.id);
        Ok(pid)
    }

    fn start_poller(&self, cfg: &TunnelConfig, pid: u32) {
        poller::spawn_confirm_poller(
            self.clone(),
            cfg.id.clone(),
            cfg.service_url.clone(),
            cfg.label.clone(),
            pid,
        );
    }

    /// Remove and return the agent handle, releasing the registry lock
    /// before any slow kill work.
    async fn take_agent(&self, id: &str) -> Option<AgentProcess> {
        self.agents.write().await.remove(id)
    }

    async fn is_agent_running(&self, id: &str) -> bool {
        let agents = self.agents.read().await;
        match agents.get(id) {
            Some(a) => a.is_running().await,
            None => false,
        }
    }

    /// Whether the registry still holds a running agent with this exact pid.
    /// Used by pollers to detect that their spawn was superseded.
    async fn agent_pid_matches(&self, id: &str, pid: u32) -> bool {
        let agents = self.agents.read().await;
        match agents.get(id) {
            Some(a) => a.pid == pid && a.is_running().await,
            None => false,
        }
    }

    /// Persist a relay-confirmed subdomain and mark the tunnel connected.
    /// Best-effort: if the record vanished (concurrent remove) nothing is
    /// written and the confirmation is dropped.
    async fn confirm_connected(&self, id: &str, subdomain: &str) {
        let mut tunnels = match self.store.load_all().await {
            Ok(t) => t,
            Err(e) => {
                warn!("Tunnel {id}: cannot persist subdomain: {e}");
                return;
            }
        };
        let Some(cfg) = tunnels.get_mut(id) else {
            return;
        };
        cfg.subdomain = Some(subdomain.to_string());
        if let Err(e) = self.store.save_all(&tunnels).await {
            warn!("Tunnel {id}: cannot persist subdomain: {e}");
        }
        self.flags.write().await.connected.insert(id.to_string());
    }

    fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.settings.agent.stop_timeout_secs)
    }
}

/// 8-hex-char tunnel id from a v4 UUID.
fn short_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}

fn none_if_empty(v: String) -> Option<String> {
    if v.is_empty() {
        None
    } else {
        Some(v)
    }
}
