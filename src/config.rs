//! Configuration parsing and management

use serde::{Deserialize, Deserializer, Serialize};
use std::path::Path;

use crate::error::{Error, Result};

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Proxy settings
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Permitted domain suffixes. A host is allowed if it equals an entry
    /// or is a subdomain of one. Empty means deny everything.
    #[serde(default)]
    pub allowed_hosts: Vec<String>,
}

/// Proxy-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyConfig {
    /// Address to bind the proxy server
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Bound on outbound connection establishment, in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Per-read idle bound inside CONNECT tunnels, in seconds
    #[serde(default = "default_tunnel_idle_timeout")]
    pub tunnel_idle_timeout_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            connect_timeout_secs: default_connect_timeout(),
            tunnel_idle_timeout_secs: default_tunnel_idle_timeout(),
        }
    }
}

fn default_bind_address() -> String {
    "127.0.0.1:8088".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_tunnel_idle_timeout() -> u64 {
    300
}

/// Logging configuration
#[derive(Debug, Clone, Serialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,

    /// Whether to log allowed requests
    pub log_allowed_requests: bool,

    /// Whether to log blocked requests
    pub log_blocked_requests: bool,

    /// Audit log destination, reset at every startup. None disables it.
    pub audit_log: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_allowed_requests: true,
            log_blocked_requests: true,
            audit_log: default_audit_log(),
        }
    }
}

fn default_audit_log() -> Option<String> {
    Some("logs/external-requests.log".to_string())
}

/// Helper for deserializing `log_requests` as either a bool or a table.
#[derive(Deserialize)]
#[serde(untagged)]
enum LogRequestsValue {
    Bool(bool),
    Table {
        #[serde(default = "default_true")]
        allowed: bool,
        #[serde(default = "default_true")]
        blocked: bool,
    },
}

fn default_true() -> bool {
    true
}

/// Raw helper struct for deserializing LoggingConfig from TOML.
#[derive(Deserialize)]
struct LoggingConfigRaw {
    #[serde(default = "default_log_level")]
    level: String,
    #[serde(default)]
    log_requests: Option<LogRequestsValue>,
    #[serde(default = "default_audit_log")]
    audit_log: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl<'de> Deserialize<'de> for LoggingConfig {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = LoggingConfigRaw::deserialize(deserializer)?;
        let (log_allowed, log_blocked) = match raw.log_requests {
            None => (true, true),
            Some(LogRequestsValue::Bool(b)) => (b, b),
            Some(LogRequestsValue::Table { allowed, blocked }) => (allowed, blocked),
        };
        Ok(LoggingConfig {
            level: raw.level,
            log_allowed_requests: log_allowed,
            log_blocked_requests: log_blocked,
            audit_log: raw.audit_log,
        })
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::config(format!(
                "Failed to read config file '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| Error::config(format!("Invalid TOML: {}", e)))?;

        for (i, entry) in config.allowed_hosts.iter().enumerate() {
            Self::validate_entry(i, entry)?;
        }

        Ok(config)
    }

    /// Validate a single allow-list entry. Entries must be bare hostnames.
    fn validate_entry(index: usize, entry: &str) -> Result<()> {
        let ctx = |msg: &str| Error::config(format!("allowed_hosts #{}: {}", index + 1, msg));

        let entry = entry.trim();
        if entry.is_empty() {
            return Err(ctx("entry is empty"));
        }
        if entry.contains("://") {
            return Err(ctx("must be a bare hostname, not a URL"));
        }
        if entry.contains('/') {
            return Err(ctx("must not contain a path"));
        }
        if entry.contains(':') {
            return Err(ctx("must not contain a port"));
        }
        if entry.contains('*') {
            return Err(ctx(
                "wildcards are not supported — subdomains of an entry always match",
            ));
        }
        if entry.chars().any(|c| c.is_whitespace()) {
            return Err(ctx("must not contain whitespace"));
        }

        Ok(())
    }

    /// Create a minimal configuration with just a bind address.
    /// The audit log is disabled so tests opt in explicitly.
    pub fn minimal(bind_address: String) -> Self {
        Self {
            proxy: ProxyConfig {
                bind_address,
                ..ProxyConfig::default()
            },
            logging: LoggingConfig {
                audit_log: None,
                ..LoggingConfig::default()
            },
            allowed_hosts: Vec::new(),
        }
    }
}
