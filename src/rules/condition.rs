//! Predicate matching shared by assignment, scoring, and transition rules.
//!
//! Conditions are decoded once from their stored JSON form into a typed
//! [`ConditionValue`], so evaluation never re-inspects raw JSON and never
//! fails: anything that cannot be compared simply does not match.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Comparison operator of a [`Condition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    GreaterThan,
    LessThan,
    In,
    NotIn,
    /// Operator name not recognised when the rule was decoded. Never matches.
    Unsupported,
}

impl Operator {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Equals => "equals",
            Self::NotEquals => "not_equals",
            Self::Contains => "contains",
            Self::NotContains => "not_contains",
            Self::GreaterThan => "greater_than",
            Self::LessThan => "less_than",
            Self::In => "in",
            Self::NotIn => "not_in",
            Self::Unsupported => "unsupported",
        }
    }

    pub fn from_db_value(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "equals" => Self::Equals,
            "not_equals" => Self::NotEquals,
            "contains" => Self::Contains,
            "not_contains" => Self::NotContains,
            "greater_than" => Self::GreaterThan,
            "less_than" => Self::LessThan,
            "in" => Self::In,
            "not_in" => Self::NotIn,
            _ => Self::Unsupported,
        }
    }

    fn expects_array(self) -> bool {
        matches!(self, Self::In | Self::NotIn)
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declared type of a condition's comparison value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    String,
    Number,
    Boolean,
    Array,
}

/// A resolved field value or a condition's comparison value.
#[derive(Debug, Clone, PartialEq)]
pub enum ConditionValue {
    Null,
    String(String),
    Number(f64),
    Bool(bool),
    StringArray(Vec<String>),
}

impl ConditionValue {
    /// Decode a JSON value, honouring the declared type where it is coercible.
    pub fn from_json(value: &serde_json::Value, declared: Option<ValueType>) -> Self {
        use serde_json::Value;

        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(*b),
            Value::Number(n) => Self::Number(n.as_f64().unwrap_or(0.0)),
            Value::String(s) => match declared {
                Some(ValueType::Number) => s
                    .trim()
                    .parse::<f64>()
                    .map(Self::Number)
                    .unwrap_or_else(|_| Self::String(s.clone())),
                Some(ValueType::Boolean) => match s.trim().to_ascii_lowercase().as_str() {
                    "true" => Self::Bool(true),
                    "false" => Self::Bool(false),
                    _ => Self::String(s.clone()),
                },
                Some(ValueType::Array) => Self::StringArray(
                    s.split(',')
                        .map(str::trim)
                        .filter(|part| !part.is_empty())
                        .map(str::to_string)
                        .collect(),
                ),
                _ => Self::String(s.clone()),
            },
            Value::Array(items) => Self::StringArray(
                items
                    .iter()
                    .map(|item| Self::from_json(item, None).normalized())
                    .collect(),
            ),
            Value::Object(_) => Self::String(value.to_string()),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::String(s) => serde_json::Value::String(s.clone()),
            Self::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 9.0e15 {
                    serde_json::json!(*n as i64)
                } else {
                    serde_json::json!(n)
                }
            }
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::StringArray(items) => serde_json::json!(items),
        }
    }

    /// String form used by equality and substring operators.
    pub fn normalized(&self) -> String {
        match self {
            Self::Null => String::new(),
            Self::String(s) => s.clone(),
            Self::Number(n) => n.to_string(),
            Self::Bool(b) => b.to_string(),
            Self::StringArray(items) => items.join(","),
        }
    }

    /// Numeric coercion; anything non-numeric counts as zero.
    pub fn as_number(&self) -> f64 {
        match self {
            Self::Number(n) => *n,
            Self::String(s) => s.trim().parse::<f64>().unwrap_or(0.0),
            _ => 0.0,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Null => true,
            Self::String(s) => s.trim().is_empty(),
            Self::StringArray(items) => items.is_empty(),
            Self::Number(_) | Self::Bool(_) => false,
        }
    }
}

impl From<&str> for ConditionValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for ConditionValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<f64> for ConditionValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<i64> for ConditionValue {
    fn from(value: i64) -> Self {
        Self::Number(value as f64)
    }
}

impl From<i32> for ConditionValue {
    fn from(value: i32) -> Self {
        Self::Number(f64::from(value))
    }
}

impl From<bool> for ConditionValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl<T: Into<ConditionValue>> From<Option<T>> for ConditionValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Self::Null)
    }
}

/// Single field predicate. Rule condition lists are AND-combined.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawCondition", into = "RawCondition")]
pub struct Condition {
    pub field: String,
    pub operator: Operator,
    pub value: ConditionValue,
    pub value_type: Option<ValueType>,
}

/// Stored JSON shape of a condition.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawCondition {
    field: String,
    operator: String,
    #[serde(default)]
    value: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value_type: Option<ValueType>,
}

impl From<RawCondition> for Condition {
    fn from(raw: RawCondition) -> Self {
        Self {
            value: ConditionValue::from_json(&raw.value, raw.value_type),
            operator: Operator::from_db_value(&raw.operator),
            field: raw.field.trim().to_string(),
            value_type: raw.value_type,
        }
    }
}

impl From<Condition> for RawCondition {
    fn from(condition: Condition) -> Self {
        Self {
            value: condition.value.to_json(),
            operator: condition.operator.as_str().to_string(),
            field: condition.field,
            value_type: condition.value_type,
        }
    }
}

impl Condition {
    pub fn new(field: impl Into<String>, operator: Operator, value: ConditionValue) -> Self {
        Self {
            field: field.into(),
            operator,
            value,
            value_type: None,
        }
    }

    /// Structural problems that would make this condition meaningless.
    pub fn validate(&self) -> Result<(), String> {
        if self.field.is_empty() {
            return Err("condition field must not be empty".to_string());
        }
        if self.operator == Operator::Unsupported {
            return Err(format!("condition on '{}' uses an unsupported operator", self.field));
        }
        if self.operator.expects_array() && !matches!(self.value, ConditionValue::StringArray(_))
        {
            return Err(format!(
                "operator '{}' on '{}' requires an array value",
                self.operator, self.field
            ));
        }
        Ok(())
    }
}

/// Maps a condition's field name to the value it should be compared against.
pub trait FieldResolver {
    fn resolve(&self, field: &str) -> ConditionValue;
}

impl FieldResolver for HashMap<String, ConditionValue> {
    fn resolve(&self, field: &str) -> ConditionValue {
        self.get(field).cloned().unwrap_or(ConditionValue::Null)
    }
}

pub fn evaluate(condition: &Condition, fields: &dyn FieldResolver) -> bool {
    let actual = fields.resolve(&condition.field);
    let expected = &condition.value;

    match condition.operator {
        Operator::Equals => actual.normalized() == expected.normalized(),
        Operator::NotEquals => actual.normalized() != expected.normalized(),
        Operator::Contains => contains(&actual, expected),
        Operator::NotContains => !contains(&actual, expected),
        Operator::GreaterThan => actual.as_number() > expected.as_number(),
        Operator::LessThan => actual.as_number() < expected.as_number(),
        Operator::In => member_of(&actual, expected),
        Operator::NotIn => !member_of(&actual, expected),
        Operator::Unsupported => false,
    }
}

/// True when every condition holds. An empty list always holds.
pub fn evaluate_all(conditions: &[Condition], fields: &dyn FieldResolver) -> bool {
    conditions
        .iter()
        .all(|condition| evaluate(condition, fields))
}

fn contains(actual: &ConditionValue, needle: &ConditionValue) -> bool {
    let needle = needle.normalized().to_lowercase();
    match actual {
        ConditionValue::StringArray(items) => items
            .iter()
            .any(|item| item.to_lowercase().contains(&needle)),
        other => other.normalized().to_lowercase().contains(&needle),
    }
}

fn member_of(actual: &ConditionValue, expected: &ConditionValue) -> bool {
    match (actual, expected) {
        (_, ConditionValue::StringArray(options)) => {
            let probe = actual.normalized();
            options.iter().any(|option| *option == probe)
        }
        (ConditionValue::StringArray(items), scalar) => {
            let probe = scalar.normalized();
            items.iter().any(|item| *item == probe)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::{Condition, ConditionValue, Operator, ValueType, evaluate, evaluate_all};

    fn fields() -> HashMap<String, ConditionValue> {
        HashMap::from([
            ("country".to_string(), ConditionValue::from("US")),
            ("company".to_string(), ConditionValue::from("Acme Widgets")),
            ("lead_score".to_string(), ConditionValue::from(72)),
            ("estimated_value".to_string(), ConditionValue::from(75_000.0)),
            ("email_opened".to_string(), ConditionValue::from(true)),
            ("city".to_string(), ConditionValue::from("not a number")),
            (
                "tags".to_string(),
                ConditionValue::StringArray(vec!["vip".to_string(), "Partner".to_string()]),
            ),
        ])
    }

    fn cond(field: &str, op: Operator, value: ConditionValue) -> Condition {
        Condition::new(field, op, value)
    }

    #[test]
    fn equality_compares_normalized_strings() {
        let f = fields();
        assert!(evaluate(&cond("country", Operator::Equals, "US".into()), &f));
        assert!(!evaluate(&cond("country", Operator::Equals, "us".into()), &f));
        assert!(evaluate(&cond("lead_score", Operator::Equals, "72".into()), &f));
        assert!(evaluate(&cond("email_opened", Operator::Equals, "true".into()), &f));
        assert!(evaluate(&cond("country", Operator::NotEquals, "CA".into()), &f));
    }

    #[test]
    fn contains_is_case_insensitive() {
        let f = fields();
        assert!(evaluate(&cond("company", Operator::Contains, "widget".into()), &f));
        assert!(evaluate(&cond("company", Operator::NotContains, "gmail".into()), &f));
        assert!(evaluate(&cond("tags", Operator::Contains, "PART".into()), &f));
    }

    #[test]
    fn numeric_operators_coerce_non_numbers_to_zero() {
        let f = fields();
        assert!(evaluate(&cond("estimated_value", Operator::GreaterThan, 50_000.0.into()), &f));
        assert!(evaluate(&cond("lead_score", Operator::LessThan, "80".into()), &f));
        assert!(evaluate(&cond("city", Operator::LessThan, 1.0.into()), &f));
        assert!(evaluate(&cond("missing", Operator::GreaterThan, (-1.0).into()), &f));
    }

    #[test]
    fn membership_checks_array_values() {
        let f = fields();
        let options = ConditionValue::StringArray(vec!["US".to_string(), "CA".to_string()]);
        assert!(evaluate(&cond("country", Operator::In, options.clone()), &f));
        assert!(!evaluate(&cond("country", Operator::NotIn, options), &f));
        assert!(evaluate(&cond("tags", Operator::In, "vip".into()), &f));
        assert!(!evaluate(&cond("country", Operator::In, "US".into()), &f));
    }

    #[test]
    fn unsupported_operator_fails_closed() {
        let raw = serde_json::json!({"field": "country", "operator": "matches", "value": "US"});
        let condition: Condition = serde_json::from_value(raw).expect("decode");
        assert_eq!(condition.operator, Operator::Unsupported);
        assert!(!evaluate(&condition, &fields()));
        assert!(condition.validate().is_err());
    }

    #[test]
    fn empty_condition_list_always_matches() {
        assert!(evaluate_all(&[], &fields()));
    }

    #[test]
    fn all_conditions_must_hold() {
        let f = fields();
        let conditions = vec![
            cond("country", Operator::Equals, "US".into()),
            cond("lead_score", Operator::GreaterThan, 80.0.into()),
        ];
        assert!(!evaluate_all(&conditions, &f));
    }

    #[test]
    fn decoding_honours_declared_value_type() {
        let raw = serde_json::json!({
            "field": "lead_score",
            "operator": "greater_than",
            "value": "50",
            "value_type": "number"
        });
        let condition: Condition = serde_json::from_value(raw).expect("decode");
        assert_eq!(condition.value, ConditionValue::Number(50.0));
        assert_eq!(condition.value_type, Some(ValueType::Number));

        let raw = serde_json::json!({
            "field": "contact_type_id",
            "operator": "in",
            "value": [1, 2]
        });
        let condition: Condition = serde_json::from_value(raw).expect("decode");
        assert_eq!(
            condition.value,
            ConditionValue::StringArray(vec!["1".to_string(), "2".to_string()])
        );
    }

    #[test]
    fn stored_form_keeps_integral_numbers_integral() {
        let condition = cond("lead_score", Operator::GreaterThan, 80.0.into());
        let json = serde_json::to_value(&condition).expect("encode");
        assert_eq!(json["value"], serde_json::json!(80));
        assert_eq!(json["operator"], serde_json::json!("greater_than"));
    }

    #[test]
    fn array_operator_without_array_value_is_invalid() {
        let condition = cond("country", Operator::In, "US".into());
        let err = condition.validate().expect_err("invalid");
        assert!(err.contains("array"), "unexpected message: {err}");
    }
}
