//! sqlscout configuration loader.
//!
//! Configuration comes from a TOML file (`sqlscout.toml` by default) with
//! serde defaults for everything optional. The API key may instead come from
//! the `SQLSCOUT_API_KEY` environment variable so it can stay out of the
//! config file.

use crate::prompts::AgentRole;
use anyhow::{Context, Result};
use scout_llm::LlmClient;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_PATH: &str = "sqlscout.toml";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScoutConfig {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
}

impl ScoutConfig {
    pub async fn load(path: Option<PathBuf>) -> Result<(Self, PathBuf)> {
        let path = path.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        if !path.exists() {
            tracing::info!(path = %path.display(), "config file not found; using defaults");
            return Ok((Self::default(), path));
        }
        let raw = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading config file {}", path.display()))?;
        let cfg: Self = toml::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        Ok((cfg, path))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    /// Base URL of an OpenAI-compatible endpoint, e.g. `https://api.openai.com/v1`.
    pub api_url: Option<String>,
    pub api_key: Option<String>,
    pub model: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

fn default_temperature() -> f32 {
    0.2
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_url: None,
            api_key: None,
            model: None,
            temperature: default_temperature(),
        }
    }
}

impl LlmConfig {
    fn api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| std::env::var("SQLSCOUT_API_KEY").ok())
            .filter(|k| !k.trim().is_empty())
    }

    /// Build the backend client, or `None` when the endpoint is not fully
    /// configured. Turns started without a client fail with a configuration
    /// error instead of reaching the network.
    pub fn client(&self) -> Option<LlmClient> {
        let api_url = self.api_url.as_deref().filter(|u| !u.trim().is_empty())?;
        let model = self.model.as_deref().filter(|m| !m.trim().is_empty())?;
        let api_key = self.api_key()?;
        Some(LlmClient::new(api_url, &api_key, model, self.temperature))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

fn default_bind() -> String {
    "0.0.0.0:8888".to_string()
}

fn default_data_dir() -> String {
    "./data".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            data_dir: default_data_dir(),
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.bind
            .parse()
            .with_context(|| format!("invalid server.bind address: {}", self.bind))
    }

    pub fn store_path(&self) -> PathBuf {
        Path::new(&self.data_dir).join("sqlscout.db")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub role: AgentRole,
    #[serde(default = "default_max_rounds")]
    pub max_rounds: usize,
    #[serde(default = "default_max_observation_chars")]
    pub max_observation_chars: usize,
}

fn default_max_rounds() -> usize {
    10
}

fn default_max_observation_chars() -> usize {
    80_000
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            role: AgentRole::default(),
            max_rounds: default_max_rounds(),
            max_observation_chars: default_max_observation_chars(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectorMode {
    /// In-process dev connector; no live database server.
    #[default]
    Dev,
    /// An externally linked `SqlConnector` implementation.
    External,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub mode: ConnectorMode,
    /// Database names the dev connector advertises.
    #[serde(default = "default_dev_databases")]
    pub dev_databases: Vec<String>,
}

fn default_dev_databases() -> Vec<String> {
    vec!["devdb".to_string()]
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            mode: ConnectorMode::default(),
            dev_databases: default_dev_databases(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_missing_sections() {
        let cfg: ScoutConfig = toml::from_str("").expect("empty config parses");
        assert_eq!(cfg.agent.max_rounds, 10);
        assert_eq!(cfg.agent.max_observation_chars, 80_000);
        assert_eq!(cfg.server.bind, "0.0.0.0:8888");
        assert_eq!(cfg.database.mode, ConnectorMode::Dev);
        assert!((cfg.llm.temperature - 0.2).abs() < f32::EPSILON);
    }

    #[test]
    fn partial_llm_config_yields_no_client() {
        let cfg: ScoutConfig = toml::from_str(
            r#"
[llm]
api_url = "https://llm.example.com/v1"
"#,
        )
        .expect("partial config parses");
        assert!(cfg.llm.model.is_none());
        assert!(cfg.llm.client().is_none());
    }

    #[test]
    fn role_is_parsed_from_lowercase_name() {
        let cfg: ScoutConfig = toml::from_str(
            r#"
[agent]
role = "assistant"
max_rounds = 4
"#,
        )
        .expect("agent config parses");
        assert_eq!(cfg.agent.role, AgentRole::Assistant);
        assert_eq!(cfg.agent.max_rounds, 4);
    }
}
