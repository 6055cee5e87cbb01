//! Configuration management for callbridge

use crate::registry::RelayPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// HTTP configuration
    #[serde(default)]
    pub http: HttpConfig,

    /// Signaling relay configuration
    #[serde(default)]
    pub signaling: SignalingConfig,

    /// Call negotiation configuration
    #[serde(default)]
    pub negotiation: NegotiationConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Listen address
    #[serde(default = "default_host")]
    pub host: String,

    /// Listen port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Directory with the built web client
    #[serde(default = "default_web_root")]
    pub web_root: PathBuf,

    /// Origins allowed to open the signaling socket (empty allows any)
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            web_root: default_web_root(),
            allowed_origins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingConfig {
    /// WebSocket path
    #[serde(default = "default_signaling_path")]
    pub path: String,

    /// Ping interval in seconds
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    /// Sockets silent for this long are dropped
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Largest accepted text frame
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,

    /// Concurrent participant cap
    #[serde(default = "default_max_participants")]
    pub max_participants: usize,

    /// Signal routing policy
    #[serde(default)]
    pub relay_policy: RelayPolicy,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            path: default_signaling_path(),
            ping_interval_secs: default_ping_interval(),
            idle_timeout_secs: default_idle_timeout(),
            max_message_bytes: default_max_message_bytes(),
            max_participants: default_max_participants(),
            relay_policy: RelayPolicy::default(),
        }
    }
}

/// STUN/TURN server entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServerConfig {
    pub fn stun(url: &str) -> Self {
        Self {
            urls: vec![url.to_string()],
            username: None,
            credential: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NegotiationConfig {
    /// Seconds a call attempt may take to reach connectivity
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Remote candidates held before a remote description exists
    #[serde(default = "default_max_buffered_candidates")]
    pub max_buffered_candidates: usize,

    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<IceServerConfig>,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            max_buffered_candidates: default_max_buffered_candidates(),
            ice_servers: default_ice_servers(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default log filter when CALLBRIDGE_LOG is unset
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn load(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.http.port == 0 {
            return Err("HTTP port must be non-zero".into());
        }

        if !self.signaling.path.starts_with('/') {
            return Err("Signaling path must start with '/'".into());
        }

        if self.signaling.path == "/health" || self.signaling.path == "/turn" {
            return Err(format!("Signaling path conflicts with {}", self.signaling.path).into());
        }

        if self.signaling.ping_interval_secs == 0 {
            return Err("Signaling ping interval must be non-zero".into());
        }

        if self.signaling.idle_timeout_secs <= self.signaling.ping_interval_secs {
            return Err("Signaling idle timeout must exceed the ping interval".into());
        }

        if self.signaling.max_message_bytes < 1024 {
            return Err("Signaling max_message_bytes must be at least 1024".into());
        }

        if self.signaling.max_participants < 2 {
            return Err("Signaling max_participants must allow at least two peers".into());
        }

        if self.negotiation.connect_timeout_secs == 0 {
            return Err("Negotiation connect timeout must be non-zero".into());
        }

        if self.negotiation.max_buffered_candidates == 0 {
            return Err("Negotiation candidate buffer must hold at least one candidate".into());
        }

        for server in &self.negotiation.ice_servers {
            if server.urls.is_empty() {
                return Err("ICE server entries need at least one URL".into());
            }
            for url in &server.urls {
                if !(url.starts_with("stun:") || url.starts_with("turn:") || url.starts_with("turns:")) {
                    return Err(format!("Unsupported ICE server URL: {}", url).into());
                }
            }
        }

        Ok(())
    }
}

fn default_signaling_path() -> String {
    "/signaling".to_string()
}

fn default_ping_interval() -> u64 {
    30
}

fn default_idle_timeout() -> u64 {
    90
}

fn default_max_message_bytes() -> usize {
    64 * 1024
}

fn default_max_participants() -> usize {
    256
}

fn default_connect_timeout() -> u64 {
    45
}

fn default_max_buffered_candidates() -> usize {
    64
}

fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![
        IceServerConfig::stun("stun:stun.l.google.com:19302"),
        IceServerConfig::stun("stun:stun1.l.google.com:19302"),
    ]
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    10000
}

fn default_web_root() -> PathBuf {
    PathBuf::from("web/dist")
}

fn default_log_level() -> String {
    "info".to_string()
}
