//! Rule building blocks shared by routing and lifecycle: predicates,
//! scoring criteria, business-hours windows, and contact field resolution.

pub mod condition;
pub mod criteria;
pub mod fields;
pub mod hours;

pub use condition::{
    Condition, ConditionValue, FieldResolver, Operator, ValueType, evaluate, evaluate_all,
};
pub use criteria::ScoringCriterion;
pub use fields::ContactFields;
pub use hours::{BusinessHours, BusinessHoursSpec, RuleTimezone, local_day_key};

use crate::error::EngineError;

pub const RULE_NAME_MIN_CHARS: usize = 3;
pub const RULE_NAME_MAX_CHARS: usize = 255;

/// Trimmed rule name, or a validation error when it is out of bounds.
pub fn validate_rule_name(raw: &str) -> Result<String, EngineError> {
    let name = raw.trim();
    let chars = name.chars().count();
    if !(RULE_NAME_MIN_CHARS..=RULE_NAME_MAX_CHARS).contains(&chars) {
        return Err(EngineError::Validation(format!(
            "rule name must be between {RULE_NAME_MIN_CHARS} and {RULE_NAME_MAX_CHARS} characters"
        )));
    }
    Ok(name.to_string())
}

/// Reject any condition that could never be meaningfully evaluated.
pub fn validate_conditions(conditions: &[Condition]) -> Result<(), EngineError> {
    for condition in conditions {
        condition.validate().map_err(EngineError::Validation)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::validate_rule_name;

    #[test]
    fn rule_name_bounds_are_enforced_after_trimming() {
        assert!(validate_rule_name("  ab ").is_err());
        assert_eq!(validate_rule_name(" VIP ").unwrap(), "VIP");
        assert!(validate_rule_name(&"x".repeat(256)).is_err());
        assert!(validate_rule_name(&"x".repeat(255)).is_ok());
    }
}
