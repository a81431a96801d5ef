use std::path::{Component, PathBuf};

use chrono::Duration;
use rust_decimal::Decimal;

use crate::config::helpers::{
    parse_bool_env, parse_csv_env, parse_decimal_env, parse_string_env, parse_u32_env,
};
use crate::db::ContactStatus;
use crate::error::ConfigError;
use crate::settings::Settings;

/// Routing and lifecycle tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Contacts scored more recently than this are not rescored unless forced.
    pub rescore_window: Duration,
    pub score_history_limit: usize,
    /// Value-based routing applies above either threshold.
    pub value_based_min_value: Decimal,
    pub value_based_min_score: i32,
    /// Owner roles eligible for fallback assignment.
    pub fallback_roles: Vec<String>,
    /// Statuses that no longer count toward an owner's active load.
    pub terminal_statuses: Vec<ContactStatus>,
    pub route_on_status_change: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rescore_window: Duration::minutes(60),
            score_history_limit: 10,
            value_based_min_value: Decimal::from(50_000),
            value_based_min_score: 80,
            fallback_roles: vec!["admin".to_string(), "manager".to_string()],
            terminal_statuses: vec![ContactStatus::ClosedWon, ContactStatus::ClosedLost],
            route_on_status_change: true,
        }
    }
}

/// Decision audit log controls.
#[derive(Debug, Clone)]
pub struct AuditConfig {
    pub enabled: bool,
    pub path: PathBuf,
    pub hash_chain: bool,
}

fn parse_terminal_statuses(raw: &[String]) -> Result<Vec<ContactStatus>, ConfigError> {
    let mut out = Vec::with_capacity(raw.len());
    for value in raw {
        let status = ContactStatus::from_db_value(value.trim()).ok_or_else(|| {
            ConfigError::InvalidValue {
                key: "LEADFLOW_TERMINAL_STATUSES".to_string(),
                message: format!("unknown contact status '{}'", value.trim()),
            }
        })?;
        if !out.contains(&status) {
            out.push(status);
        }
    }
    Ok(out)
}

fn validate_audit_path(raw: &str) -> Result<PathBuf, ConfigError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ConfigError::InvalidValue {
            key: "LEADFLOW_AUDIT_PATH".to_string(),
            message: "audit log path must not be empty".to_string(),
        });
    }

    let raw_path = PathBuf::from(trimmed);
    if raw_path.is_absolute() {
        return Err(ConfigError::InvalidValue {
            key: "LEADFLOW_AUDIT_PATH".to_string(),
            message: "audit log path must be relative to the working directory".to_string(),
        });
    }

    let mut normalized = PathBuf::new();
    for component in raw_path.components() {
        match component {
            Component::Normal(segment) => normalized.push(segment),
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(ConfigError::InvalidValue {
                    key: "LEADFLOW_AUDIT_PATH".to_string(),
                    message: "audit log path must not contain '..' components".to_string(),
                });
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(ConfigError::InvalidValue {
                    key: "LEADFLOW_AUDIT_PATH".to_string(),
                    message: "audit log path must be relative to the working directory"
                        .to_string(),
                });
            }
        }
    }

    if normalized.components().count() < 2 || !normalized.starts_with("logs") {
        return Err(ConfigError::InvalidValue {
            key: "LEADFLOW_AUDIT_PATH".to_string(),
            message: "audit log path must be under 'logs/' and include a filename".to_string(),
        });
    }

    Ok(normalized)
}

impl EngineConfig {
    pub(crate) fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let engine = &settings.engine;

        let history_limit =
            parse_u32_env("LEADFLOW_SCORE_HISTORY_LIMIT", engine.score_history_limit)?;
        if !(1..=100).contains(&history_limit) {
            return Err(ConfigError::InvalidValue {
                key: "LEADFLOW_SCORE_HISTORY_LIMIT".to_string(),
                message: format!("must be between 1 and 100, got {history_limit}"),
            });
        }

        let default_min_value = engine.value_based_min_value.trim().parse::<Decimal>().map_err(
            |e| ConfigError::InvalidValue {
                key: "engine.value_based_min_value".to_string(),
                message: e.to_string(),
            },
        )?;
        let min_score =
            parse_u32_env("LEADFLOW_VALUE_BASED_MIN_SCORE", engine.value_based_min_score)?;

        let fallback_roles = parse_csv_env(
            "LEADFLOW_FALLBACK_ROLES",
            engine
                .fallback_roles
                .iter()
                .map(|role| role.to_ascii_lowercase())
                .collect(),
        )?;
        if fallback_roles.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "LEADFLOW_FALLBACK_ROLES".to_string(),
                message: "at least one fallback role is required".to_string(),
            });
        }

        let terminal_raw =
            parse_csv_env("LEADFLOW_TERMINAL_STATUSES", engine.terminal_statuses.clone())?;

        Ok(Self {
            rescore_window: Duration::minutes(i64::from(parse_u32_env(
                "LEADFLOW_RESCORE_WINDOW_MINUTES",
                engine.rescore_window_minutes,
            )?)),
            score_history_limit: history_limit as usize,
            value_based_min_value: parse_decimal_env(
                "LEADFLOW_VALUE_BASED_MIN_VALUE",
                default_min_value,
            )?,
            value_based_min_score: i32::try_from(min_score).map_err(|_| {
                ConfigError::InvalidValue {
                    key: "LEADFLOW_VALUE_BASED_MIN_SCORE".to_string(),
                    message: "value out of range".to_string(),
                }
            })?,
            fallback_roles,
            terminal_statuses: parse_terminal_statuses(&terminal_raw)?,
            route_on_status_change: parse_bool_env(
                "LEADFLOW_ROUTE_ON_STATUS_CHANGE",
                engine.route_on_status_change,
            )?,
        })
    }
}

impl AuditConfig {
    pub(crate) fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        Ok(Self {
            enabled: parse_bool_env("LEADFLOW_AUDIT_ENABLED", settings.audit.enabled)?,
            path: {
                let raw = parse_string_env("LEADFLOW_AUDIT_PATH", settings.audit.path.clone())?;
                validate_audit_path(&raw)?
            },
            hash_chain: parse_bool_env("LEADFLOW_AUDIT_HASH_CHAIN", settings.audit.hash_chain)?,
        })
    }
}
