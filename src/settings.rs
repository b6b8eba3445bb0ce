// src/settings.rs
//
// Bridge configuration. Layered as defaults < TOML file < environment;
// the CLI applies its own flags on top and then calls `validate`.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tracing::{info, warn};

use crate::announce::AnnounceConfig;
use crate::error::{BridgeError, Result};
use crate::link_setup::LinkSetupConfig;
use crate::listener::ListenerConfig;
use crate::logging::LoggingConfig;
use crate::registry::RegistryConfig;
use crate::watchdog::WatchdogConfig;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct BridgeConfig {
    #[serde(default = "default_can_ports")]
    pub can_ports: Vec<String>,
    /// Configure links through iproute2 before opening sockets
    #[serde(default = "default_auto_setup")]
    pub auto_setup: bool,
    /// Periodic status log interval (0 = disabled)
    #[serde(default = "default_status_interval_secs")]
    pub status_interval_secs: u64,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub watchdog: WatchdogConfig,
    #[serde(default)]
    pub listener: ListenerConfig,
    #[serde(default)]
    pub link: LinkSetupConfig,
    #[serde(default)]
    pub announce: AnnounceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_can_ports() -> Vec<String> {
    vec!["can0".to_string()]
}

fn default_auto_setup() -> bool {
    true
}

fn default_status_interval_secs() -> u64 {
    60
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            can_ports: default_can_ports(),
            auto_setup: default_auto_setup(),
            status_interval_secs: default_status_interval_secs(),
            registry: RegistryConfig::default(),
            watchdog: WatchdogConfig::default(),
            listener: ListenerConfig::default(),
            link: LinkSetupConfig::default(),
            announce: AnnounceConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl BridgeConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| BridgeError::config(format!("failed to parse config: {}", e)))
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| BridgeError::config(format!("failed to serialize config: {}", e)))
    }

    pub fn is_configured(&self, name: &str) -> bool {
        self.can_ports.iter().any(|p| p == name)
    }

    /// Apply `CAN_*` overrides from `vars`. Unparseable values are skipped.
    pub fn apply_env_overrides<I>(&mut self, vars: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let value = value.trim();
            match key.as_str() {
                "CAN_PORTS" => {
                    let ports: Vec<String> = value
                        .split(',')
                        .map(str::trim)
                        .filter(|p| !p.is_empty())
                        .map(String::from)
                        .collect();
                    if ports.is_empty() {
                        warn!(var = %key, "ignoring empty port list");
                    } else {
                        self.can_ports = ports;
                    }
                }
                "CAN_AUTO_SETUP" => {
                    if let Some(v) = parse_env(&key, value, parse_bool) {
                        self.auto_setup = v;
                    }
                }
                "CAN_BITRATE" => {
                    if let Some(v) = parse_env(&key, value, |s| s.parse().ok()) {
                        self.link.bitrate = v;
                    }
                }
                "CAN_SAMPLE_POINT" => {
                    if let Some(v) = parse_env(&key, value, |s| s.parse::<f64>().ok().map(|_| s.to_string())) {
                        self.link.sample_point = v;
                    }
                }
                "CAN_RESTART_MS" => {
                    if let Some(v) = parse_env(&key, value, |s| s.parse().ok()) {
                        self.link.restart_ms = v;
                    }
                }
                "CAN_SETUP_RETRY" => {
                    if let Some(v) = parse_env(&key, value, |s| s.parse().ok()) {
                        self.link.retry_attempts = v;
                    }
                }
                "CAN_SETUP_DELAY" => {
                    if let Some(secs) = parse_env(&key, value, |s| s.parse::<u64>().ok()) {
                        self.link.retry_delay_ms = secs.saturating_mul(1000);
                    }
                }
                _ => {}
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.can_ports.is_empty() {
            return Err(BridgeError::config("no CAN ports configured"));
        }
        let mut seen = HashSet::new();
        for port in &self.can_ports {
            if port.trim().is_empty() {
                return Err(BridgeError::config("CAN port names must not be blank"));
            }
            if !seen.insert(port.as_str()) {
                return Err(BridgeError::config(format!("duplicate CAN port {}", port)));
            }
        }

        self.link.validate()?;
        self.logging.validate()?;
        self.announce.target()?;

        if self.registry.init_retries == 0 {
            return Err(BridgeError::config("init retries must be positive"));
        }
        if self.listener.buffer_size == 0 {
            return Err(BridgeError::config("listener buffer size must be positive"));
        }
        if self.listener.read_timeout_ms == 0 {
            return Err(BridgeError::config("listener read timeout must be positive"));
        }
        if self.watchdog.check_interval_secs == 0 {
            return Err(BridgeError::config("watchdog check interval must be positive"));
        }
        Ok(())
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_env<T>(key: &str, value: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
    let parsed = parse(value);
    if parsed.is_none() {
        warn!(var = %key, value = %value, "ignoring unparseable environment override");
    }
    parsed
}

/// Load defaults, then `path` (when given), then the process environment.
/// The result is not validated.
pub fn load_settings(path: Option<&Path>) -> Result<BridgeConfig> {
    let mut config = match path {
        Some(path) => {
            let content = std::fs::read_to_string(path).map_err(|e| {
                BridgeError::config(format!("failed to read {}: {}", path.display(), e))
            })?;
            let config = BridgeConfig::from_toml_str(&content)?;
            info!(path = %path.display(), "loaded configuration");
            config
        }
        None => BridgeConfig::default(),
    };
    config.apply_env_overrides(std::env::vars());
    Ok(config)
}

pub fn save_settings(path: &Path, config: &BridgeConfig) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| {
            BridgeError::config(format!("failed to create {}: {}", parent.display(), e))
        })?;
    }
    let content = config.to_toml_string()?;
    std::fs::write(path, content)
        .map_err(|e| BridgeError::config(format!("failed to write {}: {}", path.display(), e)))
}
