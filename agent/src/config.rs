//! Configuration for the backup agent.
//!
//! Loads configuration from a TOML file; every field has a default so the
//! agent can start with no file at all.

use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Unique agent identifier
    #[serde(default = "default_agent_id")]
    pub id: String,

    /// Backup-manager scope this agent participates in (empty = default)
    #[serde(default)]
    pub scope: String,

    /// Orchestrator base URL
    #[serde(default = "default_orchestrator_url")]
    pub orchestrator_url: String,

    /// Seconds between registration re-sends while no acknowledgement has
    /// arrived; 0 sends the registration exactly once.
    #[serde(default = "default_seconds_to_retry_ack")]
    pub seconds_to_retry_ack: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_agent_id() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "backup-agent-01".to_string())
}

fn default_orchestrator_url() -> String {
    "http://localhost:7001".to_string()
}

fn default_seconds_to_retry_ack() -> u64 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            id: default_agent_id(),
            scope: String::new(),
            orchestrator_url: default_orchestrator_url(),
            seconds_to_retry_ack: default_seconds_to_retry_ack(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { level: default_log_level() }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}
