//! Configuration for leadflow.
//!
//! Values resolve in three layers: built-in defaults, the optional settings
//! file, then environment variables (after `.env` is loaded by the binary).

mod engine;
pub(crate) mod helpers;

use std::path::{Path, PathBuf};

use secrecy::SecretString;

pub use self::engine::{AuditConfig, EngineConfig};
use self::helpers::optional_env;
use crate::error::ConfigError;
use crate::settings::Settings;

/// Which storage backend to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseBackend {
    LibSql,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub backend: DatabaseBackend,
    pub libsql_path: Option<PathBuf>,
    pub libsql_url: Option<String>,
    pub libsql_auth_token: Option<SecretString>,
}

impl DatabaseConfig {
    pub(crate) fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let libsql_path = optional_env("LEADFLOW_DB_PATH")?
            .or_else(|| settings.database.path.clone())
            .map(PathBuf::from);
        let libsql_url = optional_env("LIBSQL_URL")?.or_else(|| settings.database.url.clone());
        let libsql_auth_token = optional_env("LIBSQL_AUTH_TOKEN")?.map(SecretString::from);

        if libsql_url.is_some() && libsql_auth_token.is_none() {
            return Err(ConfigError::MissingRequired {
                key: "LIBSQL_AUTH_TOKEN".to_string(),
                hint: "Set LIBSQL_AUTH_TOKEN when LIBSQL_URL points at a remote database."
                    .to_string(),
            });
        }

        Ok(Self {
            backend: DatabaseBackend::LibSql,
            libsql_path,
            libsql_url,
            libsql_auth_token,
        })
    }

    /// Local database file used when no path is configured.
    pub fn local_path(&self) -> PathBuf {
        self.libsql_path.clone().unwrap_or_else(default_libsql_path)
    }
}

/// Default location of the embedded database.
pub fn default_libsql_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".leadflow")
        .join("leadflow.db")
}

/// Fully resolved configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub engine: EngineConfig,
    pub audit: AuditConfig,
}

impl Config {
    /// Resolve configuration from an optional settings file plus the environment.
    pub fn load(settings_path: Option<&Path>) -> Result<Self, ConfigError> {
        let settings = match settings_path {
            Some(path) => Settings::load(path)?,
            None => Settings::default(),
        };
        Self::resolve(&settings)
    }

    pub fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        Ok(Self {
            database: DatabaseConfig::resolve(settings)?,
            engine: EngineConfig::resolve(settings)?,
            audit: AuditConfig::resolve(settings)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::settings::Settings;

    #[test]
    fn resolve_from_defaults_succeeds() {
        let config = super::Config::resolve(&Settings::default()).expect("config");
        assert!(config.audit.enabled);
        assert!(config.database.libsql_url.is_none());
        assert!(config.database.local_path().ends_with("leadflow.db"));
    }

    #[test]
    fn settings_path_feeds_database_location() {
        let mut settings = Settings::default();
        settings.database.path = Some("/var/lib/leadflow/crm.db".to_string());
        let config = super::DatabaseConfig::resolve(&settings).expect("database config");
        assert_eq!(
            config.local_path(),
            std::path::PathBuf::from("/var/lib/leadflow/crm.db")
        );
    }
}
