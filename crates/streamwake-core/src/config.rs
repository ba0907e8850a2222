use std::fmt;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_BASE_URL, DEFAULT_REFRESH_INTERVAL_SECS, DEFAULT_TOKEN_TTL_SECS, DEFAULT_WAKE_COOLDOWN_SECS,
    DEFAULT_WAKE_TIMEOUT_SECS,
};

/// Listener settings that can be loaded from a JSON file.
/// Every field is optional; flags and environment variables take precedence.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub wake: Option<bool>,

    /// Shell-style command line; the wake message is appended as the last argument
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wake_command: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub wake_cooldown: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub wake_timeout: Option<u64>,

    /// Seconds between channel discovery passes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_interval: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_ttl: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub verbose: Option<bool>,
}

impl FileConfig {
    /// Load config from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: FileConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to deserialize config")
    }

    /// Fill every unset field from `lower`
    pub fn or(self, lower: FileConfig) -> FileConfig {
        FileConfig {
            token: self.token.or(lower.token),
            server_id: self.server_id.or(lower.server_id),
            base_url: self.base_url.or(lower.base_url),
            wake: self.wake.or(lower.wake),
            wake_command: self.wake_command.or(lower.wake_command),
            wake_cooldown: self.wake_cooldown.or(lower.wake_cooldown),
            wake_timeout: self.wake_timeout.or(lower.wake_timeout),
            refresh_interval: self.refresh_interval.or(lower.refresh_interval),
            token_ttl: self.token_ttl.or(lower.token_ttl),
            verbose: self.verbose.or(lower.verbose),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("API token is required (--token or STREAMWAKE_TOKEN)")]
    MissingToken,

    #[error("server id is required (--server-id or STREAMWAKE_SERVER_ID)")]
    MissingServerId,

    #[error("wake is enabled but no wake command is configured (--wake-command or STREAMWAKE_WAKE_COMMAND)")]
    MissingWakeCommand,

    #[error("{0} must be greater than zero")]
    ZeroValue(&'static str),
}

/// Fully resolved listener configuration
#[derive(Clone, PartialEq)]
pub struct ListenerConfig {
    pub token: String,
    pub server_id: String,
    pub base_url: String,
    pub wake_enabled: bool,
    pub wake_command: Option<String>,
    pub wake_cooldown: Duration,
    pub wake_timeout: Duration,
    pub refresh_interval: Duration,
    pub token_ttl_secs: u64,
    pub verbose: bool,
}

impl fmt::Debug for ListenerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerConfig")
            .field("token", &"<redacted>")
            .field("server_id", &self.server_id)
            .field("base_url", &self.base_url)
            .field("wake_enabled", &self.wake_enabled)
            .field("wake_command", &self.wake_command)
            .field("wake_cooldown", &self.wake_cooldown)
            .field("wake_timeout", &self.wake_timeout)
            .field("refresh_interval", &self.refresh_interval)
            .field("token_ttl_secs", &self.token_ttl_secs)
            .field("verbose", &self.verbose)
            .finish()
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn positive(value: Option<u64>, default: u64, name: &'static str) -> Result<u64, ConfigError> {
    match value.unwrap_or(default) {
        0 => Err(ConfigError::ZeroValue(name)),
        v => Ok(v),
    }
}

impl ListenerConfig {
    /// Resolve layered settings into a validated config. Callers merge the
    /// layers beforehand with [`FileConfig::or`], highest precedence first.
    pub fn resolve(settings: FileConfig) -> Result<Self, ConfigError> {
        let token = non_empty(settings.token).ok_or(ConfigError::MissingToken)?;
        let server_id = non_empty(settings.server_id).ok_or(ConfigError::MissingServerId)?;
        let wake_enabled = settings.wake.unwrap_or(false);
        let wake_command = non_empty(settings.wake_command);
        if wake_enabled && wake_command.is_none() {
            return Err(ConfigError::MissingWakeCommand);
        }

        Ok(Self {
            token,
            server_id,
            base_url: non_empty(settings.base_url).unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            wake_enabled,
            wake_command,
            wake_cooldown: Duration::from_secs(settings.wake_cooldown.unwrap_or(DEFAULT_WAKE_COOLDOWN_SECS)),
            wake_timeout: Duration::from_secs(positive(
                settings.wake_timeout,
                DEFAULT_WAKE_TIMEOUT_SECS,
                "wake timeout",
            )?),
            refresh_interval: Duration::from_secs(positive(
                settings.refresh_interval,
                DEFAULT_REFRESH_INTERVAL_SECS,
                "refresh interval",
            )?),
            token_ttl_secs: positive(settings.token_ttl, DEFAULT_TOKEN_TTL_SECS, "token ttl")?,
            verbose: settings.verbose.unwrap_or(false),
        })
    }
}
