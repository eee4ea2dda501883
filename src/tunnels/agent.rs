//! Tunnel agent process spawning and lifecycle.
//!
//! An [`AgentProcess`] wraps one running network-exposure agent. The child is
//! spawned detached into its own process group (`setpgid(0, 0)` via
//! `pre_exec`) so signals sent to `-pgid` reach the agent and any of its
//! descendants without touching sibling tunnels. Stdout and stderr are bound
//! to a per-tunnel append-only log file — logs accumulate across restarts.
//!
//! The relay credential travels through the child's environment, never argv,
//! so it stays invisible to process-listing tools. Everything else is passed
//! as a literal argument vector — no shell interpolation anywhere.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::config::Settings;
use crate::store::TunnelConfig;

use super::logs;

/// Environment variable the agent reads its relay credential from.
pub const CREDENTIAL_ENV: &str = "TUNNELD_API_KEY";

/// Agent lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStatus {
    Running,
    Exited,
}

/// A spawned tunnel agent with its observed run state.
pub struct AgentProcess {
    /// OS process ID of the agent.
    pub pid: u32,
    /// Lifecycle status, updated by the exit watcher task.
    status: Arc<Mutex<AgentStatus>>,
    /// Exit code, set when the process exits.
    exit_code: Arc<Mutex<Option<i32>>>,
}

impl AgentProcess {
    /// Spawn the agent for `cfg` and start its exit watcher.
    ///
    /// On spawn failure the error is also appended to the tunnel's log file
    /// so status derivation can surface it as the FAILED diagnostic.
    pub fn launch(cfg: &TunnelConfig, settings: &Settings) -> Result<Self, LaunchError> {
        let log_dir = std::path::Path::new(&settings.storage.log_dir);
        std::fs::create_dir_all(log_dir).map_err(LaunchError::LogFile)?;

        let log_path = logs::log_path(log_dir, &cfg.id);
        let stdout_log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(LaunchError::LogFile)?;
        let stderr_log = stdout_log.try_clone().map_err(LaunchError::LogFile)?;

        let key = cfg
            .api_key
            .as_deref()
            .unwrap_or(&settings.relay.api_key);

        let mut cmd = Command::new(&settings.agent.program);
        cmd.args(agent_args(cfg, &settings.relay.host))
            .env(CREDENTIAL_ENV, key)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout_log))
            .stderr(Stdio::from(stderr_log))
            .kill_on_drop(true);
        // SAFETY: setpgid is async-signal-safe per POSIX.
        unsafe {
            cmd.pre_exec(|| {
                libc::setpgid(0, 0);
                Ok(())
            });
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                use std::io::Write;
                if let Ok(mut log) = std::fs::OpenOptions::new().append(true).open(&log_path) {
                    let _ = writeln!(log, "Failed to launch agent: {e}");
                }
                return Err(LaunchError::Spawn(e));
            }
        };
        let pid = child.id().unwrap_or(0);

        let status = Arc::new(Mutex::new(AgentStatus::Running));
        let exit_code: Arc<Mutex<Option<i32>>> = Arc::new(Mutex::new(None));

        // Exit watcher task — owns the child, records its fate.
        let tunnel_id = cfg.id.clone();
        let status_exit = Arc::clone(&status);
        let exit_code_exit = Arc::clone(&exit_code);
        tokio::spawn(async move {
            match child.wait().await {
                Ok(s) => {
                    let code = s.code().unwrap_or(-1);
                    info!("Tunnel {tunnel_id}: agent exited with code {code}");
                    *exit_code_exit.lock().await = Some(code);
                }
                Err(e) => {
                    error!("Tunnel {tunnel_id}: agent wait error: {e}");
                    *exit_code_exit.lock().await = Some(-1);
                }
            }
            *status_exit.lock().await = AgentStatus::Exited;
        });

        Ok(AgentProcess {
            pid,
            status,
            exit_code,
        })
    }

    /// Whether the agent process is still running.
    pub async fn is_running(&self) -> bool {
        *self.status.lock().await == AgentStatus::Running
    }

    /// Exit code, once the process has exited.
    pub async fn exit_code(&self) -> Option<i32> {
        *self.exit_code.lock().await
    }

    /// Send a signal to the agent's entire process group.
    pub fn signal_group(&self, signal: i32) {
        #[allow(clippy::cast_possible_wrap)]
        let pgid = self.pid as i32;
        if pgid > 0 {
            unsafe {
                libc::kill(-pgid, signal);
            }
        }
    }

    /// SIGKILL the process group immediately.
    pub fn kill(&self) {
        self.signal_group(libc::SIGKILL);
    }

    /// Gracefully stop the agent: SIGTERM, wait up to `timeout` for the
    /// process to exit, then SIGKILL if it's still running. Never hangs the
    /// caller beyond the timeout.
    pub async fn stop_graceful(&self, timeout: Duration) {
        if self.pid == 0 {
            return;
        }

        self.signal_group(libc::SIGTERM);

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if !self.is_running().await {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                self.kill();
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

/// Build the agent's argument vector. The credential is deliberately absent —
/// it goes through [`CREDENTIAL_ENV`].
pub fn agent_args(cfg: &TunnelConfig, relay_host: &str) -> Vec<String> {
    let mut args = vec![
        "expose".to_string(),
        "--service".to_string(),
        cfg.service_url.clone(),
        "--label".to_string(),
        cfg.label.clone(),
        "--auth".to_string(),
        cfg.auth_mode.as_str().to_string(),
        "--relay-host".to_string(),
        relay_host.to_string(),
    ];
    if !cfg.verify_ssl {
        args.push("--no-verify-ssl".to_string());
    }
    if !cfg.websocket_enabled {
        args.push("--no-websocket".to_string());
    }
    if let Some(auth) = &cfg.upstream_basic_auth {
        args.push("--upstream-auth".to_string());
        args.push(auth.clone());
    }
    args
}

/// Errors that can occur while launching an agent.
#[derive(Debug)]
pub enum LaunchError {
    /// The agent executable could not be started (not found, permission denied).
    Spawn(std::io::Error),
    /// The per-tunnel log file could not be opened.
    LogFile(std::io::Error),
}

impl std::fmt::Display for LaunchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LaunchError::Spawn(e) => write!(f, "Failed to spawn agent: {e}"),
            LaunchError::LogFile(e) => write!(f, "Failed to open agent log: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::AuthMode;

    fn sample_config() -> TunnelConfig {
        TunnelConfig {
            id: "ab12cd34".to_string(),
            service_url: "http://localhost:8000".to_string(),
            label: "homeassistant".to_string(),
            name: None,
            auth_mode: AuthMode::Sso,
            verify_ssl: true,
            websocket_enabled: true,
            api_key: None,
            upstream_basic_auth: None,
            subdomain: None,
        }
    }

    #[test]
    fn test_agent_args_defaults() {
        let args = agent_args(&sample_config(), "tunneld.dev");
        assert_eq!(
            args,
            vec![
                "expose",
                "--service",
                "http://localhost:8000",
                "--label",
                "homeassistant",
                "--auth",
                "sso",
                "--relay-host",
                "tunneld.dev",
            ]
        );
    }

    #[test]
    fn test_agent_args_flags_and_upstream_auth() {
        let mut cfg = sample_config();
        cfg.auth_mode = AuthMode::None;
        cfg.verify_ssl = false;
        cfg.websocket_enabled = false;
        cfg.upstream_basic_auth = Some("user:pass".to_string());
        let args = agent_args(&cfg, "tunneld.dev");
        assert!(args.contains(&"--no-verify-ssl".to_string()));
        assert!(args.contains(&"--no-websocket".to_string()));
        assert_eq!(args[args.len() - 2..], ["--upstream-auth", "user:pass"]);
        assert!(args.contains(&"none".to_string()));
    }

    #[test]
    fn test_agent_args_never_contain_credentials() {
        let mut cfg = sample_config();
        cfg.api_key = Some("super-secret".to_string());
        let args = agent_args(&cfg, "tunneld.dev");
        assert!(!args.iter().any(|a| a.contains("super-secret")));
    }

    fn test_settings(dir: &std::path::Path, program: &str) -> Settings {
        let mut settings = Settings::default();
        settings.agent.program = program.to_string();
        settings.storage.data_dir = dir.display().to_string();
        settings.storage.log_dir = dir.join("logs").display().to_string();
        settings.relay.api_key = "test-key".to_string();
        settings
    }

    /// Write a small executable script that sleeps until signalled.
    fn write_fake_agent(dir: &std::path::Path) -> String {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("fake-agent");
        std::fs::write(&path, "#!/bin/sh\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.display().to_string()
    }

    #[tokio::test]
    async fn test_launch_and_graceful_stop() {
        let dir = tempfile::tempdir().unwrap();
        let program = write_fake_agent(dir.path());
        let settings = test_settings(dir.path(), &program);

        let agent = AgentProcess::launch(&sample_config(), &settings).unwrap();
        assert!(agent.pid > 0);
        assert!(agent.is_running().await);

        agent.stop_graceful(Duration::from_secs(5)).await;
        // Give the exit watcher a moment to observe the death
        for _ in 0..50 {
            if !agent.is_running().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!agent.is_running().await);
        assert!(agent.exit_code().await.is_some());
    }

    #[tokio::test]
    async fn test_launch_missing_program_writes_log_line() {
        let dir = tempfile::tempdir().unwrap();
        let settings = test_settings(dir.path(), "/nonexistent/bin/tunnel-agent");
        let cfg = sample_config();

        match AgentProcess::launch(&cfg, &settings) {
            Err(LaunchError::Spawn(_)) => {}
            other => panic!("expected spawn failure, got {:?}", other.map(|a| a.pid)),
        }

        let log_path = logs::log_path(std::path::Path::new(&settings.storage.log_dir), &cfg.id);
        let contents = std::fs::read_to_string(log_path).unwrap();
        assert!(contents.contains("Failed to launch agent"));
    }
}
