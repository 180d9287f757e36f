use easel_sync::ServerConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Process configuration, read from the environment.
///
/// Variables: `HOST`, `PORT`, `HTTP_PORT`, `STORAGE_PATH`,
/// `VOLATILE_CAPACITY`, `LOG_LEVEL`. An `app.env` or `.env` file in the
/// working directory is loaded first when present.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,

    /// WebSocket port
    #[serde(default = "default_port")]
    pub port: u16,

    /// REST port; the REST surface is off when unset
    pub http_port: Option<u16>,

    /// RocksDB directory; snapshots live in memory when unset
    pub storage_path: Option<PathBuf>,

    #[serde(default = "default_volatile_capacity")]
    pub volatile_capacity: usize,

    /// Default `env_logger` filter; `RUST_LOG` wins when set
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("environment variable error: {0}")]
    Env(#[from] envy::Error),
    #[error("volatile capacity must be at least 1")]
    ZeroVolatileCapacity,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        if Path::new("app.env").exists() {
            dotenvy::from_filename("app.env").ok();
        } else {
            dotenvy::dotenv().ok();
        }
        Self::from_vars(std::env::vars())
    }

    fn from_vars<I>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let config: Config = envy::from_iter(vars)?;
        if config.volatile_capacity == 0 {
            return Err(ConfigError::ZeroVolatileCapacity);
        }
        Ok(config)
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: format!("{}:{}", self.host, self.port),
            http_addr: self.http_port.map(|port| format!("{}:{}", self.host, port)),
            volatile_capacity: self.volatile_capacity,
            storage_path: self.storage_path.clone(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            http_port: None,
            storage_path: None,
            volatile_capacity: default_volatile_capacity(),
            log_level: default_log_level(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5000
}

fn default_volatile_capacity() -> usize {
    64
}

fn default_log_level() -> String {
    "info".to_string()
}
