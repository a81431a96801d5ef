use serde::{Deserialize, Serialize};

use crate::rules::condition::{Condition, ConditionValue, Operator, ValueType};

/// Weighted scoring predicate inside a lead-scoring rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawCriterion", into = "RawCriterion")]
pub struct ScoringCriterion {
    pub name: String,
    pub condition: Condition,
    pub points: i32,
    pub weight: f64,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawCriterion {
    #[serde(default)]
    name: String,
    field: String,
    operator: String,
    #[serde(default)]
    value: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value_type: Option<ValueType>,
    #[serde(alias = "score", alias = "score_points")]
    points: i32,
    #[serde(default = "default_weight")]
    weight: f64,
    #[serde(default)]
    description: String,
}

fn default_weight() -> f64 {
    1.0
}

impl From<RawCriterion> for ScoringCriterion {
    fn from(raw: RawCriterion) -> Self {
        Self {
            condition: Condition {
                field: raw.field.trim().to_string(),
                operator: Operator::from_db_value(&raw.operator),
                value: ConditionValue::from_json(&raw.value, raw.value_type),
                value_type: raw.value_type,
            },
            name: raw.name,
            points: raw.points,
            weight: raw.weight,
            description: raw.description,
        }
    }
}

impl From<ScoringCriterion> for RawCriterion {
    fn from(criterion: ScoringCriterion) -> Self {
        Self {
            name: criterion.name,
            field: criterion.condition.field,
            operator: criterion.condition.operator.as_str().to_string(),
            value: criterion.condition.value.to_json(),
            value_type: criterion.condition.value_type,
            points: criterion.points,
            weight: criterion.weight,
            description: criterion.description,
        }
    }
}

impl ScoringCriterion {
    pub fn new(name: impl Into<String>, condition: Condition, points: i32) -> Self {
        Self {
            name: name.into(),
            condition,
            points,
            weight: 1.0,
            description: String::new(),
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    /// `round(points * weight)`, clamped to the `i32` range.
    pub fn weighted_points(&self) -> i32 {
        let weighted = (f64::from(self.points) * self.weight).round();
        weighted.clamp(f64::from(i32::MIN), f64::from(i32::MAX)) as i32
    }

    pub fn validate(&self) -> Result<(), String> {
        self.condition.validate()?;
        if !self.weight.is_finite() || self.weight < 0.0 {
            return Err(format!(
                "criterion on '{}' has an invalid weight {}",
                self.condition.field, self.weight
            ));
        }
        Ok(())
    }
}
