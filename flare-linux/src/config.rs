//! Load config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Daemon configuration. File: ~/.config/flare/config.toml or /etc/flare/config.toml.
/// Env overrides: FLARE_USER_NAME, FLARE_DEVICE_NAME, FLARE_HARDWARE_ID,
/// FLARE_DISCOVERY_PORT, FLARE_TRANSPORT_PORT, FLARE_DATA_DIR.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_user_name")]
    pub user_name: String,
    #[serde(default = "default_device_name")]
    pub device_name: String,
    /// Stable hardware identifier; read from the first network interface when unset.
    #[serde(default)]
    pub hardware_id: Option<String>,
    /// Rendezvous UDP port (default 45678).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// First TCP port of the transport range (default 8988).
    #[serde(default = "default_transport_base_port")]
    pub transport_base_port: u16,
    #[serde(default = "default_port_range")]
    pub port_range: u16,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_ttl")]
    pub default_ttl: u8,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Used when RUST_LOG is not set.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_user_name() -> String {
    std::env::var("USER").unwrap_or_else(|_| "anonymous".to_string())
}
fn default_device_name() -> String {
    gethostname::gethostname().to_string_lossy().into_owned()
}
fn default_discovery_port() -> u16 {
    45678
}
fn default_transport_base_port() -> u16 {
    8988
}
fn default_port_range() -> u16 {
    5
}
fn default_heartbeat_secs() -> u64 {
    10
}
fn default_connect_timeout_secs() -> u64 {
    5
}
fn default_connect_attempts() -> u32 {
    3
}
fn default_send_timeout_secs() -> u64 {
    3
}
fn default_debounce_ms() -> u64 {
    300
}
fn default_ttl() -> u8 {
    flare_core::DEFAULT_TTL
}
fn default_data_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(h) => PathBuf::from(h).join(".local/share/flare"),
        None => PathBuf::from("/var/lib/flare"),
    }
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            user_name: default_user_name(),
            device_name: default_device_name(),
            hardware_id: None,
            discovery_port: default_discovery_port(),
            transport_base_port: default_transport_base_port(),
            port_range: default_port_range(),
            heartbeat_secs: default_heartbeat_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            connect_attempts: default_connect_attempts(),
            send_timeout_secs: default_send_timeout_secs(),
            debounce_ms: default_debounce_ms(),
            default_ttl: default_ttl(),
            data_dir: default_data_dir(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs.max(1))
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |key| std::env::var(key).ok());
    c
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("FLARE_USER_NAME") {
        if !s.trim().is_empty() {
            c.user_name = s;
        }
    }
    if let Some(s) = var("FLARE_DEVICE_NAME") {
        if !s.trim().is_empty() {
            c.device_name = s;
        }
    }
    if let Some(s) = var("FLARE_HARDWARE_ID") {
        c.hardware_id = Some(s);
    }
    if let Some(s) = var("FLARE_DISCOVERY_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.discovery_port = p;
        }
    }
    if let Some(s) = var("FLARE_TRANSPORT_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.transport_base_port = p;
        }
    }
    if let Some(s) = var("FLARE_DATA_DIR") {
        c.data_dir = PathBuf::from(s);
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/flare/config.toml"));
    }
    out.push(PathBuf::from("/etc/flare/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p) {
                Ok(s) => match toml::from_str::<Config>(&s) {
                    Ok(c) => return Some(c),
                    Err(e) => tracing::warn!(path = %p.display(), error = %e, "ignoring bad config"),
                },
                Err(e) => tracing::warn!(path = %p.display(), error = %e, "cannot read config"),
            }
            break;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn partial_file_keeps_defaults() {
        let c: Config = toml::from_str("user_name = \"ana\"\ntransport_base_port = 9100\n").unwrap();
        assert_eq!(c.user_name, "ana");
        assert_eq!(c.transport_base_port, 9100);
        assert_eq!(c.port_range, 5);
        assert_eq!(c.discovery_port, 45678);
        assert_eq!(c.default_ttl, 3);
        assert_eq!(c.heartbeat(), Duration::from_secs(10));
    }

    #[test]
    fn unknown_keys_rejected() {
        assert!(toml::from_str::<Config>("proxy_port = 3128\n").is_err());
    }

    #[test]
    fn env_overrides_file_values() {
        let env: HashMap<&str, &str> = [
            ("FLARE_USER_NAME", "bo"),
            ("FLARE_DISCOVERY_PORT", "50000"),
            ("FLARE_TRANSPORT_PORT", "not-a-port"),
            ("FLARE_DATA_DIR", "/tmp/flare-test"),
        ]
        .into_iter()
        .collect();
        let mut c = Config::default();
        apply_env(&mut c, |k| env.get(k).map(|v| v.to_string()));
        assert_eq!(c.user_name, "bo");
        assert_eq!(c.discovery_port, 50000);
        assert_eq!(c.transport_base_port, 8988);
        assert_eq!(c.data_dir, PathBuf::from("/tmp/flare-test"));
    }
}
