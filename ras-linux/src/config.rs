//! Load config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;
use std::str::FromStr;

/// Which side of the ranging service this daemon plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Measures procedures, stores records and serves them to the peer.
    Responder,
    /// Connects to a responder and fetches every record it announces.
    Requester,
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "responder" => Ok(Role::Responder),
            "requester" => Ok(Role::Requester),
            other => Err(format!("unknown role {other:?}")),
        }
    }
}

/// Daemon configuration. File: ~/.config/ras/config.toml or /etc/ras/config.toml.
/// Env overrides: RAS_ROLE, RAS_ADDR, RAS_MTU, RAS_BUFFERS_PER_CONN,
/// RAS_ACK_TIMEOUT_MS, RAS_PROCEDURE_INTERVAL_MS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_role")]
    pub role: Role,
    /// Responder listens here; requester connects here.
    #[serde(default = "default_addr")]
    pub addr: String,
    /// Local ATT MTU offered to the peer (default 247).
    #[serde(default = "default_mtu")]
    pub mtu: u16,
    /// Time between synthetic procedures on each responder connection.
    #[serde(default = "default_procedure_interval_ms")]
    pub procedure_interval_ms: u64,
    #[serde(default = "default_subevents_per_procedure")]
    pub subevents_per_procedure: u8,
    #[serde(default = "default_steps_per_subevent")]
    pub steps_per_subevent: u8,
    /// Record store and transfer engine settings.
    #[serde(default)]
    pub ras: ras_core::Config,
}

fn default_role() -> Role {
    Role::Responder
}
fn default_addr() -> String {
    "127.0.0.1:45700".to_string()
}
fn default_mtu() -> u16 {
    247
}
fn default_procedure_interval_ms() -> u64 {
    1000
}
fn default_subevents_per_procedure() -> u8 {
    2
}
fn default_steps_per_subevent() -> u8 {
    24
}

impl Default for Config {
    fn default() -> Self {
        Self {
            role: default_role(),
            addr: default_addr(),
            mtu: default_mtu(),
            procedure_interval_ms: default_procedure_interval_ms(),
            subevents_per_procedure: default_subevents_per_procedure(),
            steps_per_subevent: default_steps_per_subevent(),
            ras: ras_core::Config::default(),
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |key| std::env::var(key).ok());
    c
}

/// Apply overrides from `get`; unparsable values are ignored.
pub fn apply_env(c: &mut Config, get: impl Fn(&str) -> Option<String>) {
    if let Some(r) = get("RAS_ROLE").and_then(|s| s.parse().ok()) {
        c.role = r;
    }
    if let Some(a) = get("RAS_ADDR") {
        c.addr = a;
    }
    if let Some(m) = get("RAS_MTU").and_then(|s| s.parse().ok()) {
        c.mtu = m;
    }
    if let Some(n) = get("RAS_BUFFERS_PER_CONN").and_then(|s| s.parse().ok()) {
        c.ras.buffers_per_conn = n;
    }
    if let Some(ms) = get("RAS_ACK_TIMEOUT_MS").and_then(|s| s.parse().ok()) {
        c.ras.ack_timeout_ms = ms;
    }
    if let Some(ms) = get("RAS_PROCEDURE_INTERVAL_MS").and_then(|s| s.parse().ok()) {
        c.procedure_interval_ms = ms;
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/ras/config.toml"));
    }
    out.push(PathBuf::from("/etc/ras/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p) {
                Ok(s) => match toml::from_str::<Config>(&s) {
                    Ok(c) => return Some(c),
                    Err(e) => tracing::warn!(path = %p.display(), error = %e, "invalid config file"),
                },
                Err(e) => tracing::warn!(path = %p.display(), error = %e, "cannot read config file"),
            }
            break;
        }
    }
    None
}
