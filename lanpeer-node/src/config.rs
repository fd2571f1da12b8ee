//! Load config from file and environment.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use lanpeer_core::NodeOptions;
use serde::Deserialize;

/// Daemon configuration. File: ~/.config/lanpeer/config.toml or /etc/lanpeer/config.toml.
/// Env overrides: LANPEER_PORT, LANPEER_BROADCAST_ADDR, LANPEER_INCOMING_DIR, LANPEER_OUTGOING_DIR.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// UDP port shared by all peers (default 8080).
    pub port: u16,
    /// Destination of discovery heartbeats.
    pub broadcast_addr: Ipv4Addr,
    pub incoming_dir: PathBuf,
    pub outgoing_dir: PathBuf,
    pub heartbeat_interval_ms: u64,
    pub reap_interval_ms: u64,
    /// How often the retransmit monitor runs.
    pub retransmit_monitor_ms: u64,
    /// Age of the last send before a retransmit is due.
    pub retransmit_after_ms: u64,
    pub max_attempts: u32,
    pub peer_timeout_ms: u64,
    pub dedup_ttl_ms: u64,
    /// Wait for the ACK of a FILE or END frame.
    pub control_ack_timeout_ms: u64,
    pub chunk_pacing_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: lanpeer_core::DEFAULT_PORT,
            broadcast_addr: Ipv4Addr::BROADCAST,
            incoming_dir: PathBuf::from("received_files"),
            outgoing_dir: PathBuf::from("files"),
            heartbeat_interval_ms: 5_000,
            reap_interval_ms: 1_000,
            retransmit_monitor_ms: 5_000,
            retransmit_after_ms: 1_000,
            max_attempts: lanpeer_core::delivery::MAX_ATTEMPTS,
            peer_timeout_ms: 10_000,
            dedup_ttl_ms: 5 * 60 * 1_000,
            control_ack_timeout_ms: 3_500,
            chunk_pacing_ms: 50,
        }
    }
}

impl Config {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }

    pub fn retransmit_monitor(&self) -> Duration {
        Duration::from_millis(self.retransmit_monitor_ms)
    }

    pub fn node_options(&self) -> NodeOptions {
        NodeOptions {
            peer_timeout: Duration::from_millis(self.peer_timeout_ms),
            dedup_ttl: Duration::from_millis(self.dedup_ttl_ms),
            retransmit_after: Duration::from_millis(self.retransmit_after_ms),
            max_attempts: self.max_attempts,
            control_ack_timeout: Duration::from_millis(self.control_ack_timeout_ms),
            chunk_pacing: Duration::from_millis(self.chunk_pacing_ms),
            incoming_dir: self.incoming_dir.clone(),
            outgoing_dir: self.outgoing_dir.clone(),
        }
    }
}

/// Errors reading an explicitly requested config file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Load config: defaults, then the given file or the first default path that exists, then env vars.
/// An explicit path must exist and parse; a broken default file is skipped with a warning.
pub fn load(explicit: Option<&Path>) -> Result<Config, ConfigError> {
    let mut c = match explicit {
        Some(path) => read_file(path)?,
        None => load_default_file().unwrap_or_default(),
    };
    apply_env(&mut c, |k| std::env::var(k).ok());
    Ok(c)
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(p) = var("LANPEER_PORT").and_then(|s| s.parse::<u16>().ok()) {
        c.port = p;
    }
    if let Some(a) = var("LANPEER_BROADCAST_ADDR").and_then(|s| s.parse::<Ipv4Addr>().ok()) {
        c.broadcast_addr = a;
    }
    if let Some(d) = var("LANPEER_INCOMING_DIR") {
        c.incoming_dir = PathBuf::from(d);
    }
    if let Some(d) = var("LANPEER_OUTGOING_DIR") {
        c.outgoing_dir = PathBuf::from(d);
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/lanpeer/config.toml"));
    }
    out.push(PathBuf::from("/etc/lanpeer/config.toml"));
    out
}

fn load_default_file() -> Option<Config> {
    let path = config_paths().into_iter().find(|p| p.exists())?;
    match read_file(&path) {
        Ok(c) => Some(c),
        Err(e) => {
            tracing::warn!(error = %e, "ignoring config file");
            None
        }
    }
}

fn read_file(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
