//! Configuration for sqlpilot.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (SQLPILOT_DATABASE, SQLPILOT_LLM_ENDPOINT,
//!    SQLPILOT_MODEL, OPENAI_API_KEY, SQLPILOT_ADDRESS)
//! 2. Config file (.sqlpilot/config.yaml)
//! 3. Defaults
//!
//! Config file discovery:
//! - Searches current directory and parents for .sqlpilot/config.yaml
//! - Relative paths in the config file resolve against the project root
//!   (the directory containing .sqlpilot/)

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::core::policy::Policy;
use crate::steps::DEFAULT_SUBJECT;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

const CONFIG_DIR: &str = ".sqlpilot";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub policy: Policy,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite file (relative to the project root)
    pub path: Option<String>,
    pub pool_size: Option<usize>,
    pub max_rows: Option<usize>,
    /// What the data is about, used when routing questions
    pub subject: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LlmConfig {
    pub endpoint: Option<String>,
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub deterministic_temperature: Option<f32>,
    pub exploratory_temperature: Option<f32>,
    pub request_timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerConfig {
    pub address: Option<String>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub database: DatabaseSettings,
    pub llm: LlmSettings,
    pub policy: Policy,
    pub server: ServerSettings,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DatabaseSettings {
    pub path: PathBuf,
    pub pool_size: usize,
    /// Rows returned per query at most
    pub max_rows: usize,
    pub subject: String,
}

impl DatabaseSettings {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            pool_size: 4,
            max_rows: 1000,
            subject: DEFAULT_SUBJECT.to_string(),
        }
    }
}

#[derive(Clone, PartialEq)]
pub struct LlmSettings {
    pub endpoint: String,
    pub model: String,
    pub api_key: Option<String>,
    pub deterministic_temperature: f32,
    pub exploratory_temperature: f32,
    pub request_timeout_seconds: u64,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            model: "gpt-4o".to_string(),
            api_key: None,
            deterministic_temperature: 0.0,
            exploratory_temperature: 0.7,
            request_timeout_seconds: 120,
        }
    }
}

// Keep the key out of logs and `config` output
impl fmt::Debug for LlmSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LlmSettings")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("deterministic_temperature", &self.deterministic_temperature)
            .field("exploratory_temperature", &self.exploratory_temperature)
            .field("request_timeout_seconds", &self.request_timeout_seconds)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerSettings {
    pub address: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:8000".to_string(),
        }
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(CONFIG_DIR).join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the project root
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Merge a config file (if any) with environment overrides and defaults
fn resolve(
    config_path: Option<&Path>,
    file: ConfigFile,
    env: impl Fn(&str) -> Option<String>,
) -> Result<ResolvedConfig> {
    // Project root is the parent of .sqlpilot/
    let base_dir = config_path
        .and_then(|p| p.parent())
        .and_then(|p| p.parent())
        .unwrap_or(Path::new("."));

    let database_path = if let Some(path) = env("SQLPILOT_DATABASE") {
        PathBuf::from(path)
    } else if let Some(ref path) = file.database.path {
        resolve_path(base_dir, path)
    } else {
        dirs::home_dir()
            .context("Failed to determine home directory")?
            .join(CONFIG_DIR)
            .join("chinook.db")
    };

    let mut database = DatabaseSettings::at(database_path);
    if let Some(pool_size) = file.database.pool_size {
        database.pool_size = pool_size.max(1);
    }
    if let Some(max_rows) = file.database.max_rows {
        database.max_rows = max_rows;
    }
    if let Some(subject) = file.database.subject {
        database.subject = subject;
    }

    let defaults = LlmSettings::default();
    let llm = LlmSettings {
        endpoint: env("SQLPILOT_LLM_ENDPOINT")
            .or(file.llm.endpoint)
            .unwrap_or(defaults.endpoint),
        model: env("SQLPILOT_MODEL")
            .or(file.llm.model)
            .unwrap_or(defaults.model),
        api_key: env("OPENAI_API_KEY")
            .or(file.llm.api_key)
            .filter(|key| !key.trim().is_empty()),
        deterministic_temperature: file
            .llm
            .deterministic_temperature
            .unwrap_or(defaults.deterministic_temperature),
        exploratory_temperature: file
            .llm
            .exploratory_temperature
            .unwrap_or(defaults.exploratory_temperature),
        request_timeout_seconds: file
            .llm
            .request_timeout_seconds
            .unwrap_or(defaults.request_timeout_seconds),
    };

    let server = ServerSettings {
        address: env("SQLPILOT_ADDRESS")
            .or(file.server.address)
            .unwrap_or_else(|| ServerSettings::default().address),
    };

    file.policy.validate().context("Invalid policy settings")?;

    Ok(ResolvedConfig {
        database,
        llm,
        policy: file.policy,
        server,
        config_file: config_path.map(Path::to_path_buf),
    })
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let config_file = find_config_file();
    let file = match config_file {
        Some(ref path) => load_config_file(path)?,
        None => ConfigFile::default(),
    };
    resolve(config_file.as_deref(), file, |key| std::env::var(key).ok())
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| format!("{:#}", e)));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}
