#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]

//! tunneld library — the tunnel process-supervision core.
//!
//! This library keeps a set of long-lived "tunnel" agent processes running
//! and reconciled: durable definitions in a JSON store, live child processes
//! in an in-memory registry, and a background poller per spawn that promotes
//! a tunnel to CONNECTED once the relay reports its registration live.
//!
//! Building blocks:
//! - `config` — TOML + env-var configuration
//! - `store` — durable tunnel definitions (whole-mapping JSON persistence)
//! - `relay` — read-only HTTP client for the relay's live-registration list
//! - `tunnels` — agent spawning, lifecycle orchestration, status derivation

pub mod config;
pub mod relay;
pub mod store;
pub mod tunnels;

// Re-export key types at crate root for convenience.
pub use config::Settings;
pub use store::{ConfigStore, TunnelConfig};
pub use tunnels::{TunnelManager, TunnelState, TunnelStatus};
