//! Load peer config from file and environment.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::warn;

use roomdrop_core::coordinator::DEFAULT_NEGOTIATION_TIMEOUT_TICKS;

/// Peer configuration. File: ~/.config/roomdrop/peer.toml or /etc/roomdrop/peer.toml.
/// Env overrides: ROOMDROP_RELAY_URL, ROOMDROP_LINK_BIND, ROOMDROP_DOWNLOAD_DIR,
/// ROOMDROP_NEGOTIATION_TIMEOUT.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// WebSocket URL of the relay (default ws://127.0.0.1:3000/ws).
    #[serde(default = "default_relay_url")]
    pub relay_url: String,
    /// Where the initiator listens for the peer link (default 0.0.0.0, any port).
    #[serde(default = "default_link_bind_addr")]
    pub link_bind_addr: SocketAddr,
    /// Addresses to offer instead of the detected ones, e.g. behind port forwarding.
    #[serde(default)]
    pub advertise_addrs: Vec<SocketAddr>,
    /// Where received files are written (default: current directory).
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    /// Seconds a link negotiation may take; 0 waits forever (default 30).
    #[serde(default = "default_negotiation_timeout_secs")]
    pub negotiation_timeout_secs: u64,
}

fn default_relay_url() -> String {
    "ws://127.0.0.1:3000/ws".to_string()
}
fn default_link_bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 0))
}
fn default_download_dir() -> PathBuf {
    PathBuf::from(".")
}
fn default_negotiation_timeout_secs() -> u64 {
    DEFAULT_NEGOTIATION_TIMEOUT_TICKS
}

impl Default for Config {
    fn default() -> Self {
        Self {
            relay_url: default_relay_url(),
            link_bind_addr: default_link_bind_addr(),
            advertise_addrs: Vec::new(),
            download_dir: default_download_dir(),
            negotiation_timeout_secs: default_negotiation_timeout_secs(),
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
    if let Ok(s) = std::env::var("ROOMDROP_RELAY_URL") {
        c.relay_url = s;
    }
    if let Ok(s) = std::env::var("ROOMDROP_LINK_BIND") {
        match s.parse::<SocketAddr>() {
            Ok(addr) => c.link_bind_addr = addr,
            Err(_) => warn!(value = %s, "ignoring invalid ROOMDROP_LINK_BIND"),
        }
    }
    if let Some(dir) = std::env::var_os("ROOMDROP_DOWNLOAD_DIR") {
        c.download_dir = PathBuf::from(dir);
    }
    if let Ok(s) = std::env::var("ROOMDROP_NEGOTIATION_TIMEOUT") {
        if let Ok(n) = s.parse::<u64>() {
            c.negotiation_timeout_secs = n;
        }
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/roomdrop/peer.toml"));
    }
    out.push(PathBuf::from("/etc/roomdrop/peer.toml"));
    out
}

fn load_file() -> Option<Config> {
    let path = config_paths().into_iter().find(|p| p.exists())?;
    match read_file(&path) {
        Ok(c) => Some(c),
        Err(e) => {
            warn!(error = %e, "falling back to default peer config");
            None
        }
    }
}

fn read_file(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str::<Config>(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> Result<Config, toml::de::Error> {
        toml::from_str(s)
    }

    #[test]
    fn empty_file_gives_defaults() {
        let c = parse("").unwrap();
        assert_eq!(c.relay_url, "ws://127.0.0.1:3000/ws");
        assert!(c.link_bind_addr.ip().is_unspecified());
        assert_eq!(c.link_bind_addr.port(), 0);
        assert!(c.advertise_addrs.is_empty());
        assert_eq!(c.negotiation_timeout_secs, 30);
    }

    #[test]
    fn advertise_addrs_parse() {
        let c = parse(
            "relay_url = \"wss://relay.example/ws\"\nadvertise_addrs = [\"203.0.113.5:7000\"]",
        )
        .unwrap();
        assert_eq!(c.relay_url, "wss://relay.example/ws");
        assert_eq!(c.advertise_addrs, vec!["203.0.113.5:7000".parse().unwrap()]);
    }

    #[test]
    fn unknown_fields_rejected() {
        assert!(parse("listen_addr = \"0.0.0.0:3000\"").is_err());
    }
}
