//! Configuration for luapool
//!
//! Values are layered, lowest precedence first:
//! 1. Built-in defaults
//! 2. A TOML file (builder path, `LUAPOOL_CONFIG_PATH`, or `./luapool.toml`)
//! 3. `.env` in the working directory
//! 4. Environment variables such as `LUAPOOL_POOL__CAPACITY=32`
//!
//! # Example
//!
//! ```rust,no_run
//! use luapool::config::Config;
//!
//! let config = Config::builder()
//!     .config_path(Some("deploy/luapool.toml".into()))
//!     .build()?;
//! assert!(config.pool.capacity >= 1);
//! # Ok::<(), luapool::config::ConfigError>(())
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

const ENV_PREFIX: &str = "LUAPOOL";
const CONFIG_PATH_VAR: &str = "LUAPOOL_CONFIG_PATH";
const DEFAULT_CONFIG_FILE: &str = "luapool.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("config file not found: {0}")]
    MissingFile(PathBuf),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to render configuration: {0}")]
    Render(#[from] toml::ser::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub pool: PoolConfig,
    pub engine: EngineConfig,
    pub logging: LoggingConfig,
}

/// Sizing and timing of the context pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum number of idle contexts kept for reuse
    pub capacity: usize,

    /// Contexts created up front
    pub warm_contexts: usize,

    /// How long an acquire waits for an idle context before creating one
    pub acquire_timeout_ms: u64,

    /// How long a released context waits for a free idle slot before it is destroyed
    pub release_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            warm_contexts: 1,
            acquire_timeout_ms: 50,
            release_timeout_ms: 1000,
        }
    }
}

impl PoolConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn release_timeout(&self) -> Duration {
        Duration::from_millis(self.release_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::Invalid(
                "pool.capacity must be at least 1".to_string(),
            ));
        }
        if self.warm_contexts > self.capacity {
            return Err(ConfigError::Invalid(format!(
                "pool.warm_contexts ({}) exceeds pool.capacity ({})",
                self.warm_contexts, self.capacity
            )));
        }
        if self.release_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "pool.release_timeout_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on memory used by the whole Lua state
    pub memory_limit_bytes: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive used when `RUST_LOG` is unset
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Load with default search rules.
    pub fn load() -> Result<Self, ConfigError> {
        Self::builder().build()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pool.validate()?;
        if self.engine.memory_limit_bytes == Some(0) {
            return Err(ConfigError::Invalid(
                "engine.memory_limit_bytes must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

pub struct ConfigBuilder {
    config_path: Option<PathBuf>,
    env_prefix: String,
    load_dotenv: bool,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self {
            config_path: None,
            env_prefix: ENV_PREFIX.to_string(),
            load_dotenv: true,
        }
    }
}

impl ConfigBuilder {
    /// Config file to read instead of the default search
    pub fn config_path(mut self, path: Option<PathBuf>) -> Self {
        self.config_path = path;
        self
    }

    /// Prefix for environment overrides (`<PREFIX>_<SECTION>__<KEY>`)
    pub fn env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Whether to read `.env` before looking at the environment
    pub fn dotenv(mut self, load: bool) -> Self {
        self.load_dotenv = load;
        self
    }

    pub fn build(self) -> Result<Config, ConfigError> {
        if self.load_dotenv {
            dotenvy::dotenv().ok();
        }

        let mut builder = config::Config::builder();

        if let Some(path) = self.resolve_path()? {
            builder = builder.add_source(
                config::File::from(path.as_path())
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }

        builder = builder.add_source(
            config::Environment::with_prefix(&self.env_prefix)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn resolve_path(&self) -> Result<Option<PathBuf>, ConfigError> {
        if let Some(path) = &self.config_path {
            if !path.exists() {
                return Err(ConfigError::MissingFile(path.clone()));
            }
            return Ok(Some(path.clone()));
        }

        if let Ok(path) = std::env::var(CONFIG_PATH_VAR) {
            let path = PathBuf::from(path);
            if !path.exists() {
                return Err(ConfigError::MissingFile(path));
            }
            return Ok(Some(path));
        }

        let default = PathBuf::from(DEFAULT_CONFIG_FILE);
        Ok(default.exists().then_some(default))
    }
}
