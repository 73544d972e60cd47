//! Application configuration.
//!
//! Settings are merged with figment, lowest precedence first:
//!
//! 1. Programmatic defaults (`AppConfig::default()`)
//! 2. `paper-search.yaml` in the working directory, or the file given with
//!    `--config`
//! 3. Environment variables prefixed `PAPER_SEARCH_`, nested with `__`
//!    (e.g. `PAPER_SEARCH_SERVER__PORT=9000`)

use std::path::{Path, PathBuf};

use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Config file looked up in the working directory when none is given.
pub const DEFAULT_CONFIG_FILE: &str = "paper-search.yaml";

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "PAPER_SEARCH_";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    MissingFile(PathBuf),

    #[error("Failed to extract configuration: {0}")]
    Extraction(#[from] Box<figment::Error>),

    #[error("Invalid embedding workers: {0}. Must be at least 1")]
    InvalidWorkers(usize),

    #[error("Invalid feed_batch_size: {0}. Must be at least 1")]
    InvalidBatchSize(usize),

    #[error("Invalid max_attempts: {0}. Must be at least 1")]
    InvalidMaxAttempts(u32),

    #[error("Invalid max_top_k: {0}. Must be at least 1")]
    InvalidMaxTopK(usize),

    #[error("Invalid default_top_k: {default_top_k}. Must be between 1 and max_top_k ({max_top_k})")]
    InvalidDefaultTopK { default_top_k: usize, max_top_k: usize },

    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    /// Root of `records.db`, `embeddings.db` and `snapshots/`
    pub data_dir: PathBuf,
    pub embedding: EmbeddingSettings,
    pub ingestion: IngestionSettings,
    pub server: ServerSettings,
    pub logging: LoggingSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            embedding: EmbeddingSettings::default(),
            ingestion: IngestionSettings::default(),
            server: ServerSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl AppConfig {
    pub fn records_db(&self) -> PathBuf {
        self.data_dir.join("records.db")
    }

    pub fn embeddings_db(&self) -> PathBuf {
        self.data_dir.join("embeddings.db")
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.data_dir.join("snapshots")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EmbeddingSettings {
    /// fastembed model name, e.g. `AllMiniLML6V2` or `all-MiniLM-L6-v2`
    pub model: String,

    /// Where model files are downloaded; the user cache dir when unset
    pub cache_dir: Option<PathBuf>,

    /// Concurrent embedding calls
    pub workers: usize,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            model: "AllMiniLML6V2".to_string(),
            cache_dir: None,
            workers: 2,
        }
    }
}

impl EmbeddingSettings {
    /// Configured cache dir, falling back to `<user cache>/fastembed`.
    pub fn resolved_cache_dir(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .map(|p| p.join("fastembed"))
                .unwrap_or_else(|| PathBuf::from(".cache/fastembed"))
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IngestionSettings {
    pub feed_batch_size: usize,
    pub max_attempts: u32,
    pub retry_delay_secs: u64,
    pub batch_pause_ms: u64,
}

impl Default for IngestionSettings {
    fn default() -> Self {
        Self {
            feed_batch_size: 100,
            max_attempts: 3,
            retry_delay_secs: 5,
            batch_pause_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub allowed_origins: Vec<String>,
    pub default_top_k: usize,
    pub max_top_k: usize,

    /// Rebuild at startup when the snapshot disagrees with the record store
    pub rebuild_on_mismatch: bool,

    /// How often a running server checks `snapshots/CURRENT` for a newer
    /// generation; 0 disables the check
    pub reload_interval_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            allowed_origins: vec![
                "http://localhost:3000".to_string(),
                "https://jack855558.github.io".to_string(),
            ],
            default_top_k: 5,
            max_top_k: 100,
            rebuild_on_mismatch: true,
            reload_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    /// `pretty` or `json`
    pub format: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// Configuration loader with hierarchical merging
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from defaults, a YAML file and the environment.
    ///
    /// With `path` set the file must exist; otherwise `paper-search.yaml` is
    /// used when present.
    pub fn load(path: Option<&Path>) -> ConfigResult<AppConfig> {
        let file = match path {
            Some(path) if !path.exists() => return Err(ConfigError::MissingFile(path.to_path_buf())),
            Some(path) => path.to_path_buf(),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        Self::from_figment(
            Figment::new()
                .merge(Serialized::defaults(AppConfig::default()))
                .merge(Yaml::file(file))
                .merge(Env::prefixed(ENV_PREFIX).split("__")),
        )
    }

    /// Extract and validate from a prepared figment.
    pub fn from_figment(figment: Figment) -> ConfigResult<AppConfig> {
        let config: AppConfig = figment.extract().map_err(Box::new)?;
        Self::validate(&config)?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(config: &AppConfig) -> ConfigResult<()> {
        if config.data_dir.as_os_str().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "data_dir cannot be empty".to_string(),
            ));
        }

        if config.embedding.workers == 0 {
            return Err(ConfigError::InvalidWorkers(config.embedding.workers));
        }
        if config.embedding.model.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "embedding.model cannot be empty".to_string(),
            ));
        }

        if config.ingestion.feed_batch_size == 0 {
            return Err(ConfigError::InvalidBatchSize(config.ingestion.feed_batch_size));
        }
        if config.ingestion.max_attempts == 0 {
            return Err(ConfigError::InvalidMaxAttempts(config.ingestion.max_attempts));
        }

        let server = &config.server;
        if server.max_top_k == 0 {
            return Err(ConfigError::InvalidMaxTopK(server.max_top_k));
        }
        if server.default_top_k == 0 || server.default_top_k > server.max_top_k {
            return Err(ConfigError::InvalidDefaultTopK {
                default_top_k: server.default_top_k,
                max_top_k: server.max_top_k,
            });
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&config.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }

        let valid_log_formats = ["json", "pretty"];
        if !valid_log_formats.contains(&config.logging.format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(config.logging.format.clone()));
        }

        Ok(())
    }
}
