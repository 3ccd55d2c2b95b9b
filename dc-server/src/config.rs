//! Load config from file and environment.

use dc_core::{EngineConfig, HubSettings};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Daemon configuration. File: ~/.config/dcpp/config.toml or /etc/dcpp/config.toml.
/// Env overrides: DCPP_NICK, DCPP_TCP_PORT, DCPP_UDP_PORT, DCPP_DATA_DIR.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_nick")]
    pub nick: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub email: String,
    /// Address other users dial; unset means passive mode.
    #[serde(default)]
    pub external_ip: Option<String>,
    /// Peer listen port (default 4120). 0 picks a free port.
    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,
    /// Search result port (default 4121).
    #[serde(default = "default_udp_port")]
    pub udp_port: u16,
    #[serde(default = "default_slots")]
    pub slots: u32,
    /// queue.json, share.json, hashindex.json, hashdata.bin.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    #[serde(default)]
    pub shares: Vec<ShareRootConfig>,
    /// Hubs joined at startup.
    #[serde(default)]
    pub hubs: Vec<HubSettings>,
    /// Engine tunables; missing keys keep their defaults.
    #[serde(default)]
    pub engine: Option<EngineConfig>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ShareRootConfig {
    pub name: String,
    pub path: PathBuf,
}

fn default_nick() -> String {
    EngineConfig::default().nick
}
fn default_tcp_port() -> u16 {
    4120
}
fn default_udp_port() -> u16 {
    4121
}
fn default_slots() -> u32 {
    dc_core::config::DEFAULT_MAX_SLOTS
}
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}
fn default_data_dir() -> PathBuf {
    home_dir().join(".local/share/dcpp")
}
fn default_download_dir() -> PathBuf {
    home_dir().join("Downloads")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            nick: default_nick(),
            description: String::new(),
            email: String::new(),
            external_ip: None,
            tcp_port: default_tcp_port(),
            udp_port: default_udp_port(),
            slots: default_slots(),
            data_dir: default_data_dir(),
            download_dir: default_download_dir(),
            shares: Vec::new(),
            hubs: Vec::new(),
            engine: None,
        }
    }
}

impl Config {
    /// Tunables for the core, with identity, ports and slots taken from the top level.
    pub fn engine_config(&self) -> EngineConfig {
        let mut e = self.engine.clone().unwrap_or_default();
        e.nick = self.nick.clone();
        e.description = self.description.clone();
        e.email = self.email.clone();
        e.external_ip = self.external_ip.clone();
        e.tcp_port = self.tcp_port;
        e.udp_port = self.udp_port;
        e.max_slots = self.slots;
        e
    }

    /// Apply environment overrides; `var` is `std::env::var` outside tests.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(nick) = var("DCPP_NICK") {
            if !nick.is_empty() {
                self.nick = nick;
            }
        }
        if let Some(p) = var("DCPP_TCP_PORT").and_then(|s| s.parse::<u16>().ok()) {
            self.tcp_port = p;
        }
        if let Some(p) = var("DCPP_UDP_PORT").and_then(|s| s.parse::<u16>().ok()) {
            self.udp_port = p;
        }
        if let Some(dir) = var("DCPP_DATA_DIR") {
            if !dir.is_empty() {
                self.data_dir = PathBuf::from(dir);
            }
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    c.apply_env(|k| std::env::var(k).ok());
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/dcpp/config.toml"));
    }
    out.push(PathBuf::from("/etc/dcpp/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match load_path(&p) {
                Ok(c) => return Some(c),
                Err(e) => tracing::warn!(path = %p.display(), error = %e, "ignoring config file"),
            }
            break;
        }
    }
    None
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse: {0}")]
    Toml(#[from] toml::de::Error),
}

pub fn load_path(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path)?;
    Ok(toml::from_str::<Config>(&s)?)
}
