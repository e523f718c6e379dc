use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::DEFAULT_HTTP_PORT;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("malformed config at {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SecurityConfig {
    /// Session sliding window in milliseconds.
    pub session_timeout: u64,
    /// Maximum admissible command age in milliseconds.
    pub command_timeout: u64,
    /// Maximum admissible future timestamp in milliseconds.
    pub clock_skew_tolerance: u64,
    pub max_commands_per_minute: u32,
    pub allow_custom_origins: bool,
    pub custom_origin_acknowledged: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            session_timeout: 30 * 60 * 1000,
            command_timeout: 30_000,
            clock_skew_tolerance: 5_000,
            max_commands_per_minute: 100,
            allow_custom_origins: false,
            custom_origin_acknowledged: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentsConfig {
    pub preferred: Option<String>,
    /// Explicit binary path per agent kind; wins over the search list.
    pub paths: HashMap<String, String>,
    /// Per-execution wall clock ceiling in milliseconds.
    pub timeout: u64,
    pub retry_attempts: u32,
    pub max_buffer_bytes: usize,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            preferred: None,
            paths: HashMap::new(),
            timeout: 10 * 60 * 1000,
            retry_attempts: 1,
            max_buffer_bytes: 4 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default, rename = "wsPort")]
    pub ws_port: Option<u16>,
    #[serde(default = "default_allowed_origins", rename = "allowedOrigins")]
    pub allowed_origins: Vec<String>,
    #[serde(default, rename = "customOrigins")]
    pub custom_origins: Vec<String>,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub agents: AgentsConfig,
    /// Opaque flags handed through to the workspace adapter.
    #[serde(default)]
    pub git: HashMap<String, Value>,
    #[serde(default)]
    pub hub: Option<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            ws_port: None,
            allowed_origins: default_allowed_origins(),
            custom_origins: Vec::new(),
            security: SecurityConfig::default(),
            agents: AgentsConfig::default(),
            git: HashMap::new(),
            hub: None,
        }
    }
}

fn default_port() -> u16 {
    DEFAULT_HTTP_PORT
}

fn default_allowed_origins() -> Vec<String> {
    vec![
        "https://promptdock.app".to_string(),
        "http://localhost:3000".to_string(),
        "http://localhost:5173".to_string(),
    ]
}

/// Flag-level overrides collected by the CLI. Highest-precedence layer.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub port: Option<u16>,
    pub agent: Option<String>,
    pub hub: Option<String>,
}

impl BridgeConfig {
    /// Layered load: built-in defaults < config file < environment < CLI.
    pub fn load(config_path: &Path, cli: &CliOverrides) -> Result<Self, ConfigError> {
        let mut config = if config_path.exists() {
            let raw = std::fs::read_to_string(config_path).map_err(|source| ConfigError::Read {
                path: config_path.to_path_buf(),
                source,
            })?;
            serde_json::from_str::<BridgeConfig>(&raw).map_err(|source| ConfigError::Parse {
                path: config_path.to_path_buf(),
                source,
            })?
        } else {
            BridgeConfig::default()
        };

        config.apply_env();
        config.apply_cli(cli);
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Some(port) = env_u16("PROMPT_DOCK_PORT") {
            self.port = port;
        }
        if let Some(ws_port) = env_u16("PROMPT_DOCK_WS_PORT") {
            self.ws_port = Some(ws_port);
        }
        if let Ok(hub) = std::env::var("PROMPT_DOCK_HUB") {
            if !hub.trim().is_empty() {
                self.hub = Some(hub.trim().to_string());
            }
        }
    }

    fn apply_cli(&mut self, cli: &CliOverrides) {
        if let Some(port) = cli.port {
            self.port = port;
        }
        if let Some(agent) = &cli.agent {
            self.agents.preferred = Some(agent.clone());
        }
        if let Some(hub) = &cli.hub {
            self.hub = Some(hub.clone());
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ws_port() == self.port {
            return Err(ConfigError::Invalid(
                "wsPort must differ from port".to_string(),
            ));
        }
        if self.security.session_timeout < 60_000 {
            return Err(ConfigError::Invalid(
                "security.sessionTimeout must be at least 60000 ms".to_string(),
            ));
        }
        if self.security.max_commands_per_minute < 1 {
            return Err(ConfigError::Invalid(
                "security.maxCommandsPerMinute must be at least 1".to_string(),
            ));
        }
        if self.agents.timeout < 30_000 {
            return Err(ConfigError::Invalid(
                "agents.timeout must be at least 30000 ms".to_string(),
            ));
        }
        Ok(())
    }

    pub fn ws_port(&self) -> u16 {
        self.ws_port.unwrap_or(self.port.wrapping_add(1))
    }

    /// The exhaustive set of accepted origin values. Custom origins extend
    /// the list only when both opt-in flags are set.
    pub fn effective_origins(&self) -> Vec<String> {
        let mut origins = self.allowed_origins.clone();
        if self.security.allow_custom_origins && self.security.custom_origin_acknowledged {
            origins.extend(self.custom_origins.iter().cloned());
        } else if !self.custom_origins.is_empty() {
            warn!("customOrigins present but not acknowledged; ignoring");
        }
        origins
    }

    pub fn origin_allowed(&self, origin: &str) -> bool {
        self.effective_origins().iter().any(|o| o == origin)
    }
}

pub fn default_state_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("PROMPT_DOCK_STATE_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir.trim());
        }
    }
    dirs::home_dir()
        .map(|home| home.join(".prompt-dock"))
        .unwrap_or_else(|| PathBuf::from(".prompt-dock"))
}

fn env_u16(name: &str) -> Option<u16> {
    std::env::var(name).ok()?.trim().parse().ok()
}
