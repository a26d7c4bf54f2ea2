//! Configuration handling for the wss binary.
//!
//! Values come from a YAML file (all keys optional), then `WSS_*` environment
//! variables, then command line flags applied by `main`.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use wss_session::{AuthConfig, BackoffConfig, ClientConfig, ServerConfig, DEFAULT_BROADCAST_INTERVAL};

/// wss configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WssConfig {
    /// Server listen port, and default client port
    pub port: u16,
    /// Connect with `wss://`
    pub use_ssl: bool,
    /// Client reconnects after failures and closes
    pub retry: bool,
    /// Authenticate peers
    pub auth: bool,
    /// Private exponent file
    pub private_key_file: PathBuf,
    /// Trust registry file
    pub registry_file: PathBuf,
    /// Coalesce server broadcasts
    pub broadcast_throttled: bool,
    /// Throttled broadcast delivery period
    #[serde(with = "duration_str")]
    pub broadcast_interval: Duration,
    /// With auth on, broadcast only to authenticated sessions
    pub gate_broadcast: bool,
    /// With auth on, withhold payloads from unauthenticated peers
    pub gate_dispatch: bool,
}

impl Default for WssConfig {
    fn default() -> Self {
        let auth = AuthConfig::default();
        let server = ServerConfig::default();
        Self {
            port: 9000,
            use_ssl: false,
            retry: true,
            auth: false,
            private_key_file: auth.private_key_file,
            registry_file: auth.registry_file,
            broadcast_throttled: server.broadcast_throttled,
            broadcast_interval: DEFAULT_BROADCAST_INTERVAL,
            gate_broadcast: server.gate_broadcast,
            gate_dispatch: server.gate_dispatch,
        }
    }
}

impl WssConfig {
    /// Load configuration from file and environment variables. A missing or
    /// unparsable file falls back to defaults.
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => match serde_yaml::from_str::<WssConfig>(&content) {
                Ok(config) => {
                    info!("Loaded configuration from {:?}", path);
                    config
                }
                Err(e) => {
                    warn!("Failed to parse config file {:?} ({}), using defaults", path, e);
                    Self::default()
                }
            },
            Err(_) => {
                info!("Config file {:?} not found, using defaults", path);
                Self::default()
            }
        };

        config.apply_environment_overrides();
        Ok(config)
    }

    /// Apply `WSS_*` environment variable overrides
    pub fn apply_environment_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from `lookup`, which maps a `WSS_*` name to its value.
    /// Unparsable values are logged and ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = parsed(&lookup, "WSS_PORT", |v| v.parse::<u16>().ok()) {
            self.port = port;
        }
        if let Some(value) = parsed(&lookup, "WSS_USE_SSL", parse_bool) {
            self.use_ssl = value;
        }
        if let Some(value) = parsed(&lookup, "WSS_RETRY", parse_bool) {
            self.retry = value;
        }
        if let Some(value) = parsed(&lookup, "WSS_AUTH", parse_bool) {
            self.auth = value;
        }
        if let Some(path) = lookup("WSS_PRIVATE_KEY_FILE") {
            self.private_key_file = PathBuf::from(path);
        }
        if let Some(path) = lookup("WSS_REGISTRY_FILE") {
            self.registry_file = PathBuf::from(path);
        }
        if let Some(value) = parsed(&lookup, "WSS_BROADCAST_THROTTLED", parse_bool) {
            self.broadcast_throttled = value;
        }
        if let Some(interval) = parsed(&lookup, "WSS_BROADCAST_INTERVAL", |v| {
            humantime::parse_duration(v).ok()
        }) {
            self.broadcast_interval = interval;
        }
        if let Some(value) = parsed(&lookup, "WSS_GATE_BROADCAST", parse_bool) {
            self.gate_broadcast = value;
        }
        if let Some(value) = parsed(&lookup, "WSS_GATE_DISPATCH", parse_bool) {
            self.gate_dispatch = value;
        }
    }

    /// Authentication file locations
    pub fn auth_config(&self) -> AuthConfig {
        AuthConfig {
            private_key_file: self.private_key_file.clone(),
            registry_file: self.registry_file.clone(),
        }
    }

    /// Server settings
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            broadcast_throttled: self.broadcast_throttled,
            broadcast_interval: self.broadcast_interval,
            gate_broadcast: self.gate_broadcast,
            gate_dispatch: self.gate_dispatch,
        }
    }

    /// Client settings for a server at `host:port`
    pub fn client_config(&self, host: &str, port: u16) -> ClientConfig {
        let scheme = if self.use_ssl { "wss" } else { "ws" };
        ClientConfig {
            address: format!("{}://{}:{}", scheme, host, port),
            retry: self.retry,
            backoff: BackoffConfig::default(),
            gate_dispatch: self.gate_dispatch,
        }
    }
}

fn parsed<T, F, P>(lookup: &F, key: &str, parse: P) -> Option<T>
where
    F: Fn(&str) -> Option<String>,
    P: Fn(&str) -> Option<T>,
{
    let raw = lookup(key)?;
    match parse(raw.trim()) {
        Some(value) => {
            info!("{} overridden by environment: {}", key, raw);
            Some(value)
        }
        None => {
            warn!("Ignoring unparsable {}={:?}", key, raw);
            None
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Durations written the humantime way, e.g. `100ms` or `2s`
mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}
