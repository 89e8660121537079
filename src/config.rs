//! Configuration management for the log drain
//!
//! Values come from an optional TOML/YAML file, then `DRAIN__SECTION__KEY`
//! environment variables, then the flat variables used by existing drain
//! deployments (`PORT`, `AUTH_USER`, `AUTH_SECRET`, `SOURCES`, `PGWATCH2_URL`,
//! `HKPG_LOGDRAIN_DEBUG`).

use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

pub const PORT_ENV: &str = "PORT";
pub const AUTH_USER_ENV: &str = "AUTH_USER";
pub const AUTH_SECRET_ENV: &str = "AUTH_SECRET";
pub const SOURCES_ENV: &str = "SOURCES";
pub const METRICS_DB_URL_ENV: &str = "PGWATCH2_URL";
pub const DEBUG_ENV: &str = "HKPG_LOGDRAIN_DEBUG";

/// Main configuration structure for the drain
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub storage: StorageConfig,
    pub ingest: IngestConfig,
    pub logging: LoggingConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: SocketAddr,
    pub request_timeout_secs: u64,
    pub max_body_size: usize,
}

/// Basic authentication credentials expected from the drain
#[derive(Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AuthConfig {
    pub user: String,
    pub secret: String,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("user", &self.user)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// Metrics database configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    pub database_url: String,
    /// libpq `sslmode` ("disable", "prefer", "require", ...)
    pub ssl_mode: String,
    pub pool_size: u32,
    pub acquire_timeout_secs: u64,
}

/// Ingestion pipeline configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Syslog PROCID of the frames carrying database metrics
    pub proc_id: String,
    /// JSON object mapping source tags to tenant identifiers
    pub sources: String,
    pub max_frame_length: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Raise the default filter to debug and log raw request bodies
    pub debug: bool,
    /// Log format ("json", "pretty")
    pub format: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([0, 0, 0, 0], 8080)),
            request_timeout_secs: 30,
            max_body_size: 2 * 1024 * 1024, // 2MB
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            ssl_mode: "require".to_string(),
            pool_size: 10,
            acquire_timeout_secs: 10,
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            proc_id: "heroku-postgres".to_string(),
            sources: "{}".to_string(),
            max_frame_length: crate::frame::DEFAULT_MAX_FRAME_LENGTH,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            debug: false,
            format: "pretty".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from an optional file, `DRAIN__*` variables and the legacy variables
    pub fn load_with_overrides(path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        let config_path = path.unwrap_or("config.toml");
        if Path::new(config_path).exists() {
            let format = if config_path.ends_with(".yaml") || config_path.ends_with(".yml") {
                FileFormat::Yaml
            } else {
                FileFormat::Toml
            };
            builder = builder.add_source(File::new(config_path, format));
        } else if path.is_some() {
            anyhow::bail!("Config file not found: {}", config_path);
        }

        builder = builder.add_source(
            Environment::with_prefix("DRAIN")
                .separator("__")
                .try_parsing(true),
        );

        let mut config: Config = builder
            .build()
            .context("Failed to assemble configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        config.apply_legacy_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay the flat environment variables used by existing drain deployments.
    ///
    /// `lookup` is `std::env::var` in production; tests pass a map.
    pub fn apply_legacy_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup(PORT_ENV) {
            let port: u16 = port
                .trim()
                .parse()
                .with_context(|| format!("Invalid {} value: {}", PORT_ENV, port))?;
            self.server.bind_address.set_port(port);
        }
        if let Some(user) = lookup(AUTH_USER_ENV) {
            self.auth.user = user;
        }
        if let Some(secret) = lookup(AUTH_SECRET_ENV) {
            self.auth.secret = secret;
        }
        if let Some(sources) = lookup(SOURCES_ENV) {
            self.ingest.sources = sources;
        }
        if let Some(url) = lookup(METRICS_DB_URL_ENV) {
            self.storage.database_url = url;
        }
        if lookup(DEBUG_ENV).is_some() {
            self.logging.debug = true;
        }
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.auth.user.is_empty() || self.auth.secret.is_empty() {
            anyhow::bail!("Basic auth user and secret must be configured");
        }

        if self.storage.database_url.is_empty() {
            anyhow::bail!("Metrics database URL must be configured");
        }

        if self.storage.pool_size == 0 {
            anyhow::bail!("Storage pool_size must be greater than 0");
        }

        if self.ingest.proc_id.is_empty() {
            anyhow::bail!("Ingest proc_id filter cannot be empty");
        }

        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            anyhow::bail!("Unsupported log format: {}", self.logging.format);
        }

        Ok(())
    }
}
