//! File-backed settings.
//!
//! Settings are the persisted layer underneath [`crate::config::Config`]:
//! every field has a default, the optional TOML file overrides defaults, and
//! environment variables override both when the config is resolved.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub database: DatabaseSettings,
    pub engine: EngineSettings,
    pub audit: AuditSettings,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub path: Option<String>,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub rescore_window_minutes: u32,
    pub score_history_limit: u32,
    pub value_based_min_value: String,
    pub value_based_min_score: u32,
    pub fallback_roles: Vec<String>,
    pub terminal_statuses: Vec<String>,
    pub route_on_status_change: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            rescore_window_minutes: 60,
            score_history_limit: 10,
            value_based_min_value: "50000".to_string(),
            value_based_min_score: 80,
            fallback_roles: vec!["admin".to_string(), "manager".to_string()],
            terminal_statuses: vec!["closed_won".to_string(), "closed_lost".to_string()],
            route_on_status_change: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditSettings {
    pub enabled: bool,
    pub path: String,
    pub hash_chain: bool,
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            path: "logs/leadflow_audit.jsonl".to_string(),
            hash_chain: true,
        }
    }
}

impl Settings {
    /// Load settings from a TOML file. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        toml::from_str(raw)
            .map_err(|e| ConfigError::ParseError(format!("invalid settings TOML: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::Settings;

    #[test]
    fn partial_toml_keeps_defaults_for_missing_fields() {
        let settings = Settings::from_toml(
            r#"
            [engine]
            rescore_window_minutes = 15
            fallback_roles = ["director"]

            [audit]
            enabled = false
            "#,
        )
        .expect("parse settings");

        assert_eq!(settings.engine.rescore_window_minutes, 15);
        assert_eq!(settings.engine.fallback_roles, vec!["director".to_string()]);
        assert_eq!(settings.engine.score_history_limit, 10);
        assert!(!settings.audit.enabled);
        assert!(settings.audit.hash_chain);
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let err = Settings::from_toml("[engine\nbroken").expect_err("must fail");
        assert!(matches!(err, crate::error::ConfigError::ParseError(_)));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = Settings::load(&dir.path().join("absent.toml")).expect("defaults");
        assert_eq!(settings.engine.rescore_window_minutes, 60);
    }
}
