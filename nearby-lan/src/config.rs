//! Load daemon config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;

/// Daemon configuration. File: ~/.config/nearby/config.toml or
/// /etc/nearby/config.toml. Env overrides: NEARBY_SERVICE,
/// NEARBY_ADVERT_ADDR, NEARBY_ADVERT_PORT, NEARBY_PULL_PORT,
/// NEARBY_BEACON_INTERVAL_MS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LanConfig {
    /// Service identity (uuid string) all radios of a deployment share.
    #[serde(default = "default_service")]
    pub service: String,
    /// Advertisement destination: multicast group by default, a unicast
    /// address for point-to-point setups.
    #[serde(default = "default_advert_addr")]
    pub advert_addr: String,
    /// Advertisement UDP port (default 45760).
    #[serde(default = "default_advert_port")]
    pub advert_port: u16,
    /// Pull TCP port (default 45761).
    #[serde(default = "default_pull_port")]
    pub pull_port: u16,
    /// Re-advertisement cadence in milliseconds (default 3000).
    #[serde(default = "default_beacon_interval_ms")]
    pub beacon_interval_ms: u64,
    /// Negotiated transfer unit in bytes; chunks are sized to fit it minus
    /// framing overhead (default 1200).
    #[serde(default = "default_transfer_unit")]
    pub transfer_unit: usize,
    /// Largest envelope carried inline in an advertisement (default 960).
    #[serde(default = "default_inline_limit")]
    pub inline_limit: usize,
    /// Presence liveness window in seconds (default 10).
    #[serde(default = "default_presence_ttl_secs")]
    pub presence_ttl_secs: u64,
}

fn default_service() -> String {
    "4b7d2840-9e1a-4f6e-8d12-6f5a3d9b0c77".to_string()
}
fn default_advert_addr() -> String {
    "239.255.61.61".to_string()
}
fn default_advert_port() -> u16 {
    45760
}
fn default_pull_port() -> u16 {
    45761
}
fn default_beacon_interval_ms() -> u64 {
    3000
}
fn default_transfer_unit() -> usize {
    1200
}
fn default_inline_limit() -> usize {
    960
}
fn default_presence_ttl_secs() -> u64 {
    10
}

impl Default for LanConfig {
    fn default() -> Self {
        Self {
            service: default_service(),
            advert_addr: default_advert_addr(),
            advert_port: default_advert_port(),
            pull_port: default_pull_port(),
            beacon_interval_ms: default_beacon_interval_ms(),
            transfer_unit: default_transfer_unit(),
            inline_limit: default_inline_limit(),
            presence_ttl_secs: default_presence_ttl_secs(),
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> LanConfig {
    let mut c = load_file().unwrap_or_default();
    if let Ok(s) = std::env::var("NEARBY_SERVICE") {
        if !s.is_empty() {
            c.service = s;
        }
    }
    if let Ok(s) = std::env::var("NEARBY_ADVERT_ADDR") {
        if !s.is_empty() {
            c.advert_addr = s;
        }
    }
    if let Ok(s) = std::env::var("NEARBY_ADVERT_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.advert_port = p;
        }
    }
    if let Ok(s) = std::env::var("NEARBY_PULL_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.pull_port = p;
        }
    }
    if let Ok(s) = std::env::var("NEARBY_BEACON_INTERVAL_MS") {
        if let Ok(ms) = s.parse::<u64>() {
            c.beacon_interval_ms = ms;
        }
    }
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/nearby/config.toml"));
    }
    out.push(PathBuf::from("/etc/nearby/config.toml"));
    out
}

fn load_file() -> Option<LanConfig> {
    for p in config_paths() {
        if p.exists() {
            if let Ok(s) = std::fs::read_to_string(&p) {
                if let Ok(c) = toml::from_str::<LanConfig>(&s) {
                    return Some(c);
                }
            }
            break;
        }
    }
    None
}
