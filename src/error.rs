//! Error types for leadflow.

use uuid::Uuid;

/// Top-level error type for the binary and embedding callers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[cfg(feature = "libsql")]
    #[error("LibSQL error: {0}")]
    LibSql(#[from] libsql::Error),
}

/// Errors surfaced by the routing and lifecycle engines.
///
/// `RateLimited` and `OutsideBusinessHours` are gating outcomes: the automatic
/// path treats them as "try the next rule" and only dry runs report them.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Invalid status transition from {from} to {to}: {reason}")]
    InvalidTransition {
        from: String,
        to: String,
        reason: String,
    },

    #[error("No assignees available{}", rule_suffix(.rule_id))]
    NoAssigneesAvailable { rule_id: Option<Uuid> },

    #[error("Assignment rule {rule_id} has reached its rate limit")]
    RateLimited { rule_id: Uuid },

    #[error("Assignment rule {rule_id} is outside its business hours")]
    OutsideBusinessHours { rule_id: Uuid },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Persistence failed: {0}")]
    Persistence(#[from] DatabaseError),
}

fn rule_suffix(rule_id: &Option<Uuid>) -> String {
    match rule_id {
        Some(id) => format!(" for rule {id}"),
        None => String::new(),
    }
}

impl EngineError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

/// One failed item of a bulk operation that still committed.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BulkItemError {
    pub contact_id: Uuid,
    pub message: String,
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::EngineError;

    #[test]
    fn no_assignees_message_mentions_rule_when_present() {
        let rule_id = Uuid::new_v4();
        let err = EngineError::NoAssigneesAvailable {
            rule_id: Some(rule_id),
        };
        assert_eq!(
            err.to_string(),
            format!("No assignees available for rule {rule_id}")
        );
        let err = EngineError::NoAssigneesAvailable { rule_id: None };
        assert_eq!(err.to_string(), "No assignees available");
    }
}
