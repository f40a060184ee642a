//! Process configuration loaded from environment variables.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use manager::{DispatchPolicy, ManagerConfig, ResourceConfig};

/// Errors raised while turning the configuration into running parts.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown log backend '{0}'")]
    UnknownBackend(String),

    #[error("DATABASE_URL must be set for the postgres log")]
    MissingDatabaseUrl,

    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid resource file {}: {source}", path.display())]
    Resources {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("manager configuration: {0}")]
    Manager(#[from] manager::ManagerError),

    #[error("transaction log: {0}")]
    Log(#[from] transaction_log::LogError),

    #[error("database: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// Where the coordinator keeps its transaction log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogBackend {
    /// Lost on exit; for trying things out.
    Memory,
    File,
    Postgres,
}

impl FromStr for LogBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(LogBackend::Memory),
            "file" => Ok(LogBackend::File),
            "postgres" => Ok(LogBackend::Postgres),
            other => Err(ConfigError::UnknownBackend(other.to_string())),
        }
    }
}

/// Process configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`, `PORT`: admin API bind address (default `0.0.0.0:3000`)
/// - `RUST_LOG`: tracing filter directive (default `info`)
/// - `TM_LOG`: `memory`, `file` or `postgres` (default `file`)
/// - `TM_LOG_PATH`: file log location (default `transaction.log`)
/// - `DATABASE_URL`: connection string for the postgres log
/// - `TM_DISPATCH`: `blocking` or `non-blocking` (default `non-blocking`)
/// - `TM_TIMEOUT_SCAN_MS`: timeout sweep interval (default `1000`)
/// - `TM_RESOURCES`: JSON file with the resource list (optional)
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_backend: LogBackend,
    pub log_path: PathBuf,
    pub database_url: Option<String>,
    pub dispatch: DispatchPolicy,
    pub timeout_scan: Duration,
    pub resources_path: Option<PathBuf>,
}

impl Config {
    /// Loads configuration from environment variables, falling back to
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: std::env::var("HOST").unwrap_or(defaults.host),
            port: parsed("PORT").unwrap_or(defaults.port),
            log_level: std::env::var("RUST_LOG").unwrap_or(defaults.log_level),
            log_backend: parsed("TM_LOG").unwrap_or(defaults.log_backend),
            log_path: std::env::var("TM_LOG_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.log_path),
            database_url: std::env::var("DATABASE_URL").ok(),
            dispatch: parsed("TM_DISPATCH").unwrap_or(defaults.dispatch),
            timeout_scan: parsed("TM_TIMEOUT_SCAN_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.timeout_scan),
            resources_path: std::env::var("TM_RESOURCES").ok().map(PathBuf::from),
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Coordinator settings, with the resource list read from
    /// `resources_path` when one is configured.
    pub fn manager_config(&self) -> Result<ManagerConfig, ConfigError> {
        let resources = match &self.resources_path {
            Some(path) => load_resources(path)?,
            None => Vec::new(),
        };

        let config = ManagerConfig::default()
            .with_dispatch(self.dispatch)
            .with_timeout_scan(self.timeout_scan)
            .with_resources(resources);
        config.validate()?;
        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_backend: LogBackend::File,
            log_path: PathBuf::from("transaction.log"),
            database_url: None,
            dispatch: DispatchPolicy::NonBlocking,
            timeout_scan: Duration::from_millis(1000),
            resources_path: None,
        }
    }
}

fn parsed<T: FromStr>(name: &str) -> Option<T> {
    let value = std::env::var(name).ok()?;
    match value.parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            tracing::warn!(variable = name, %value, "ignoring unparsable setting");
            None
        }
    }
}

fn load_resources(path: &Path) -> Result<Vec<ResourceConfig>, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| ConfigError::Resources {
        path: path.to_path_buf(),
        source,
    })
}
