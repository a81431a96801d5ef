//! Owner-selection algorithms.
//!
//! Selection is pure: the engine loads workloads and the rule's previous
//! owner up front, so every strategy can be exercised without storage.

use std::collections::HashMap;

use rust_decimal::Decimal;
use uuid::Uuid;

use crate::db::{AssignmentStrategy, ContactRecord, UserWorkloadRecord};
use crate::error::EngineError;
use crate::routing::workload::workload_score;

/// Thresholds above which value-based routing prefers the best converter.
#[derive(Debug, Clone, Copy)]
pub struct ValueThresholds {
    pub min_value: Decimal,
    pub min_score: i32,
}

/// Everything a strategy needs to pick an owner for one contact.
pub struct SelectionContext<'a> {
    pub rule_id: Option<Uuid>,
    pub strategy: AssignmentStrategy,
    pub pool: &'a [Uuid],
    pub fallback_owner_id: Option<Uuid>,
    pub contact: &'a ContactRecord,
    /// Workload rows keyed by owner. Owners without a row count as
    /// available with zero load.
    pub workloads: &'a HashMap<Uuid, UserWorkloadRecord>,
    /// Owner of the latest assignment created under this rule.
    pub last_owner_id: Option<Uuid>,
    pub thresholds: ValueThresholds,
}

impl SelectionContext<'_> {
    fn is_available(&self, owner_id: &Uuid) -> bool {
        self.workloads
            .get(owner_id)
            .is_none_or(|workload| workload.is_available)
    }

    fn load(&self, owner_id: &Uuid) -> f64 {
        self.workloads.get(owner_id).map_or(0.0, workload_score)
    }
}

pub fn select_owner(ctx: &SelectionContext<'_>) -> Result<Uuid, EngineError> {
    if ctx.pool.is_empty() {
        return ctx
            .fallback_owner_id
            .ok_or(EngineError::NoAssigneesAvailable {
                rule_id: ctx.rule_id,
            });
    }

    let owner = match ctx.strategy {
        AssignmentStrategy::RoundRobin | AssignmentStrategy::Custom => {
            round_robin(ctx.pool, ctx.last_owner_id)
        }
        AssignmentStrategy::LoadBased => load_or_fallback(ctx, ctx.pool),
        AssignmentStrategy::SkillBased => {
            let matches = filter_pool(ctx, |w| skill_match(w, ctx.contact));
            least_loaded(ctx, &matches).unwrap_or_else(|| load_or_fallback(ctx, ctx.pool))
        }
        AssignmentStrategy::GeographyBased => {
            let matches = filter_pool(ctx, |w| territory_match(w, ctx.contact));
            least_loaded(ctx, &matches).unwrap_or_else(|| load_or_fallback(ctx, ctx.pool))
        }
        AssignmentStrategy::ValueBased => {
            if is_high_value(ctx.contact, ctx.thresholds) {
                best_converter(ctx).unwrap_or_else(|| load_or_fallback(ctx, ctx.pool))
            } else {
                load_or_fallback(ctx, ctx.pool)
            }
        }
    };
    Ok(owner)
}

/// Next owner after `last` in pool order; the first owner when `last` is
/// unknown or no longer in the pool.
pub fn round_robin(pool: &[Uuid], last: Option<Uuid>) -> Uuid {
    let next = last
        .and_then(|last| pool.iter().position(|id| *id == last))
        .map_or(0, |idx| (idx + 1) % pool.len());
    pool[next]
}

/// Least-loaded available owner among `candidates`; ties keep pool order.
fn least_loaded(ctx: &SelectionContext<'_>, candidates: &[Uuid]) -> Option<Uuid> {
    let mut best: Option<(Uuid, f64)> = None;
    for owner_id in candidates.iter().filter(|id| ctx.is_available(id)) {
        let score = ctx.load(owner_id);
        if best.is_none_or(|(_, best_score)| score < best_score) {
            best = Some((*owner_id, score));
        }
    }
    best.map(|(owner_id, _)| owner_id)
}

fn load_or_fallback(ctx: &SelectionContext<'_>, pool: &[Uuid]) -> Uuid {
    least_loaded(ctx, pool)
        .or(ctx.fallback_owner_id)
        .unwrap_or(pool[0])
}

fn filter_pool<F>(ctx: &SelectionContext<'_>, predicate: F) -> Vec<Uuid>
where
    F: Fn(&UserWorkloadRecord) -> bool,
{
    ctx.pool
        .iter()
        .filter(|id| ctx.workloads.get(*id).is_some_and(&predicate))
        .copied()
        .collect()
}

fn is_high_value(contact: &ContactRecord, thresholds: ValueThresholds) -> bool {
    contact
        .estimated_value
        .is_some_and(|value| value > thresholds.min_value)
        || contact.lead_score > thresholds.min_score
}

/// Available owner with the highest conversion rate; ties keep pool order.
fn best_converter(ctx: &SelectionContext<'_>) -> Option<Uuid> {
    let mut best: Option<(Uuid, f64)> = None;
    for owner_id in ctx.pool.iter().filter(|id| ctx.is_available(id)) {
        let rate = ctx
            .workloads
            .get(owner_id)
            .map_or(0.0, |workload| workload.conversion_rate);
        if best.is_none_or(|(_, best_rate)| rate > best_rate) {
            best = Some((*owner_id, rate));
        }
    }
    best.map(|(owner_id, _)| owner_id)
}

/// Skill tags of a contact: its type plus any `skills` custom field.
fn contact_skill_tags(contact: &ContactRecord) -> Vec<String> {
    let mut tags = Vec::new();
    if let Some(contact_type) = contact.contact_type_id.as_deref() {
        tags.push(contact_type.to_string());
    }
    match contact.custom_fields.get("skills") {
        Some(serde_json::Value::Array(items)) => {
            tags.extend(items.iter().filter_map(|v| v.as_str()).map(str::to_string));
        }
        Some(serde_json::Value::String(skill)) => tags.push(skill.clone()),
        _ => {}
    }
    tags
}

fn skill_match(workload: &UserWorkloadRecord, contact: &ContactRecord) -> bool {
    let tags = contact_skill_tags(contact);
    let has_skill = tags.iter().any(|tag| {
        workload
            .skills
            .iter()
            .any(|skill| skill.eq_ignore_ascii_case(tag))
    });
    let handles_type = contact.contact_type_id.as_deref().is_some_and(|contact_type| {
        workload
            .contact_types
            .iter()
            .any(|t| t.eq_ignore_ascii_case(contact_type))
    });
    has_skill || handles_type
}

fn territory_match(workload: &UserWorkloadRecord, contact: &ContactRecord) -> bool {
    let places = [
        contact.country.as_deref(),
        contact.state.as_deref(),
        contact.city.as_deref(),
    ];
    workload.territories.iter().any(|territory| {
        places
            .iter()
            .flatten()
            .any(|place| !place.is_empty() && territory.eq_ignore_ascii_case(place))
    })
}
