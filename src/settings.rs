//! Configuration management with environment variable support and validation.

use anyhow::{anyhow, Result};
use config::{Config, Environment};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub enable_cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            enable_cors: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "text"
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorSettings {
    /// Worker pool size for background jobs.
    pub workers: usize,
    /// Seconds a finished job stays queryable.
    pub retention_seconds: u64,
    /// Seconds between expiry sweeps.
    pub sweep_interval_seconds: u64,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            retention_seconds: 300,
            sweep_interval_seconds: 30,
        }
    }
}

/// Main settings structure with all configuration sections.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub executor: ExecutorSettings,
}

impl Settings {
    /// Load settings: embedded defaults, then an optional local `config`
    /// file, then `ADA__`-prefixed environment variables.
    pub fn load() -> Result<Self> {
        let config = Config::builder()
            .add_source(config::File::from_str(
                include_str!("../config.toml"),
                config::FileFormat::Toml,
            ))
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                Environment::with_prefix("ADA")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Settings = config.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow!("server port cannot be 0"));
        }
        if self.executor.workers == 0 {
            return Err(anyhow!("executor needs at least one worker"));
        }
        if self.executor.retention_seconds == 0 {
            return Err(anyhow!("job retention cannot be 0"));
        }
        match self.logging.format.as_str() {
            "json" | "text" => {}
            other => return Err(anyhow!("unknown logging format '{other}'")),
        }
        Ok(())
    }
}
