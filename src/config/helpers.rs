use std::str::FromStr;

use rust_decimal::Decimal;

use crate::error::ConfigError;

/// Read an env var, treating empty values as unset.
pub(crate) fn optional_env(key: &str) -> Result<Option<String>, ConfigError> {
    match std::env::var(key) {
        Ok(value) if value.trim().is_empty() => Ok(None),
        Ok(value) => Ok(Some(value)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(std::env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "value is not valid UTF-8".to_string(),
        }),
    }
}

pub(crate) fn parse_bool_env(key: &str, default: bool) -> Result<bool, ConfigError> {
    match optional_env(key)? {
        Some(raw) => parse_bool(key, &raw),
        None => Ok(default),
    }
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected a boolean, got '{other}'"),
        }),
    }
}

pub(crate) fn parse_string_env(key: &str, default: String) -> Result<String, ConfigError> {
    Ok(optional_env(key)?.unwrap_or(default))
}

pub(crate) fn parse_u32_env(key: &str, default: u32) -> Result<u32, ConfigError> {
    parse_env(key, default)
}

pub(crate) fn parse_decimal_env(key: &str, default: Decimal) -> Result<Decimal, ConfigError> {
    parse_env(key, default)
}

pub(crate) fn parse_csv_env(key: &str, default: Vec<String>) -> Result<Vec<String>, ConfigError> {
    Ok(match optional_env(key)? {
        Some(raw) => parse_csv(&raw),
        None => default,
    })
}

pub(crate) fn parse_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.to_ascii_lowercase())
        .collect()
}

fn parse_env<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match optional_env(key)? {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("'{}': {}", raw.trim(), e),
            }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use crate::error::ConfigError;

    #[test]
    fn bool_parser_accepts_common_spellings() {
        assert!(super::parse_bool("K", "YES").expect("yes"));
        assert!(!super::parse_bool("K", "off").expect("off"));
        let err = super::parse_bool("K", "maybe").expect_err("reject");
        let ConfigError::InvalidValue { key, message } = err else {
            panic!("expected InvalidValue");
        };
        assert_eq!(key, "K");
        assert!(message.contains("maybe"), "unexpected message: {message}");
    }

    #[test]
    fn csv_parser_trims_lowercases_and_drops_empty_entries() {
        assert_eq!(
            super::parse_csv(" Admin, ,MANAGER ,"),
            vec!["admin".to_string(), "manager".to_string()]
        );
    }
}
