//! Layered configuration: defaults → TOML file → environment → CLI flags.
//!
//! Mirrors the teacher workspace's split between a config crate
//! (`sven-config`) and a thin CLI binary — here folded into one module since
//! this daemon has a single binary rather than a multi-frontend workspace.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

fn default_name() -> String {
    "default".to_string()
}

fn default_coordinator_url() -> String {
    "wss://signal.zajel.example/ws".to_string()
}

fn default_heartbeat_secs() -> u64 {
    15
}

fn default_handshake_timeout_secs() -> u64 {
    30
}

fn default_file_transfer_timeout_secs() -> u64 {
    300
}

fn default_max_file_size() -> u64 {
    256 * 1024 * 1024
}

fn default_max_chunks() -> u32 {
    8192
}

fn default_max_concurrent_transfers() -> usize {
    10
}

fn default_max_chunks_per_channel() -> usize {
    1000
}

fn default_max_messages_per_group() -> usize {
    5000
}

fn default_max_seq_gap() -> u64 {
    1000
}

fn default_max_message_size() -> usize {
    1024 * 1024
}

fn default_auto_accept_group_invitations() -> bool {
    true
}

fn default_persist_session_keys() -> bool {
    false
}

/// Bounded-store and timeout constants, retunable without a rebuild.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub heartbeat_secs: u64,
    pub handshake_timeout_secs: u64,
    pub file_transfer_timeout_secs: u64,
    pub max_file_size: u64,
    pub max_chunks: u32,
    pub max_concurrent_transfers: usize,
    pub max_chunks_per_channel: usize,
    pub max_messages_per_group: usize,
    pub max_seq_gap: u64,
    pub max_message_size: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            heartbeat_secs: default_heartbeat_secs(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            file_transfer_timeout_secs: default_file_transfer_timeout_secs(),
            max_file_size: default_max_file_size(),
            max_chunks: default_max_chunks(),
            max_concurrent_transfers: default_max_concurrent_transfers(),
            max_chunks_per_channel: default_max_chunks_per_channel(),
            max_messages_per_group: default_max_messages_per_group(),
            max_seq_gap: default_max_seq_gap(),
            max_message_size: default_max_message_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Instance name; validated against `^[A-Za-z0-9_-]+$` by `ipc::socket_path`.
    pub name: String,
    pub state_dir: Option<PathBuf>,
    pub coordinator_url: String,
    pub media_dir: Option<PathBuf>,
    pub receive_dir: Option<PathBuf>,
    pub auto_accept_group_invitations: bool,
    pub persist_session_keys: bool,
    #[serde(flatten)]
    pub limits: Limits,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            name: default_name(),
            state_dir: None,
            coordinator_url: default_coordinator_url(),
            media_dir: None,
            receive_dir: None,
            auto_accept_group_invitations: default_auto_accept_group_invitations(),
            persist_session_keys: default_persist_session_keys(),
            limits: Limits::default(),
        }
    }
}

impl Config {
    /// Resolve the state directory, creating it if absent.
    pub fn resolve_state_dir(&self) -> PathBuf {
        let dir = self.state_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("zajel")
                .join(&self.name)
        });
        let _ = std::fs::create_dir_all(&dir);
        dir
    }

    pub fn resolve_media_dir(&self) -> PathBuf {
        let dir = self.media_dir.clone().unwrap_or_else(|| self.resolve_state_dir().join("media"));
        let _ = std::fs::create_dir_all(&dir);
        dir
    }

    pub fn resolve_receive_dir(&self) -> PathBuf {
        let dir = self
            .receive_dir
            .clone()
            .unwrap_or_else(|| self.resolve_state_dir().join("received"));
        let _ = std::fs::create_dir_all(&dir);
        dir
    }

    /// Directory the IPC socket is created in. `XDG_RUNTIME_DIR` when
    /// available, falling back to the state directory (still owner-only,
    /// just not cleared on reboot).
    pub fn resolve_runtime_dir(&self) -> PathBuf {
        let dir = dirs::runtime_dir().unwrap_or_else(|| self.resolve_state_dir());
        let _ = std::fs::create_dir_all(&dir);
        dir
    }

    /// Load a config by layering defaults, an optional TOML file, and
    /// environment variables (`ZAJEL_*`). CLI flags are applied by the
    /// caller afterwards (see `main.rs`), since `clap` already parsed them.
    pub fn load(file: Option<&Path>) -> anyhow::Result<Config> {
        let mut cfg = Config::default();

        if let Some(path) = file {
            if path.exists() {
                let text = std::fs::read_to_string(path)?;
                cfg = toml::from_str(&text)?;
            }
        }

        if let Ok(url) = std::env::var("ZAJEL_COORDINATOR_URL") {
            cfg.coordinator_url = url;
        }
        if let Ok(name) = std::env::var("ZAJEL_NAME") {
            cfg.name = name;
        }
        if let Ok(dir) = std::env::var("ZAJEL_STATE_DIR") {
            cfg.state_dir = Some(PathBuf::from(dir));
        }

        Ok(cfg)
    }
}
