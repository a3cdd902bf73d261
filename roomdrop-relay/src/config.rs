//! Load relay config from file and environment.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Relay configuration. File: ~/.config/roomdrop/relay.toml or /etc/roomdrop/relay.toml.
/// Env overrides: ROOMDROP_RELAY_LISTEN, ROOMDROP_RELAY_PATH, ROOMDROP_RELAY_MAX_MESSAGE_BYTES.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Socket address to accept WebSocket clients on (default 0.0.0.0:3000).
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    /// HTTP path of the WebSocket endpoint (default /ws).
    #[serde(default = "default_path")]
    pub path: String,
    /// Largest accepted envelope in bytes (default 64 KiB).
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 3000))
}
fn default_path() -> String {
    "/ws".to_string()
}
fn default_max_message_bytes() -> usize {
    64 * 1024
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            path: default_path(),
            max_message_bytes: default_max_message_bytes(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c);
    c
}

/// Load from an explicit file (must exist), then apply env vars.
pub fn load_from(path: &Path) -> Result<Config, ConfigError> {
    let mut c = read_file(path)?;
    apply_env(&mut c);
    Ok(c)
}

fn apply_env(c: &mut Config) {
    if let Ok(s) = std::env::var("ROOMDROP_RELAY_LISTEN") {
        match s.parse::<SocketAddr>() {
            Ok(addr) => c.listen_addr = addr,
            Err(_) => warn!(value = %s, "ignoring invalid ROOMDROP_RELAY_LISTEN"),
        }
    }
    if let Ok(s) = std::env::var("ROOMDROP_RELAY_PATH") {
        if s.starts_with('/') {
            c.path = s;
        } else {
            warn!(value = %s, "ignoring ROOMDROP_RELAY_PATH without leading /");
        }
    }
    if let Ok(s) = std::env::var("ROOMDROP_RELAY_MAX_MESSAGE_BYTES") {
        if let Ok(n) = s.parse::<usize>() {
            c.max_message_bytes = n;
        }
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/roomdrop/relay.toml"));
    }
    out.push(PathBuf::from("/etc/roomdrop/relay.toml"));
    out
}

fn load_file() -> Option<Config> {
    let path = config_paths().into_iter().find(|p| p.exists())?;
    match read_file(&path) {
        Ok(c) => Some(c),
        Err(e) => {
            warn!(error = %e, "falling back to default relay config");
            None
        }
    }
}

fn read_file(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn parse(s: &str) -> Result<Config, toml::de::Error> {
    toml::from_str::<Config>(s)
}
