//! Rule-weighted lead scoring.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::audit::{self, Decision};
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::db::{
    ContactDirectory, ContactLifecycleRecord, ContactRecord, CreateScoringRuleParams, Database,
    LeadScoringRuleRecord, LifecycleEventType, LifecycleStage, LifecycleStore, NewLifecycleEvent,
    ScoreSnapshot, ScoringCategory, ScoringFactor, ScoringRuleStore, TriggerType,
    UpdateScoringRuleParams,
};
use crate::error::EngineError;
use crate::lifecycle::{score_grade, stage_for_score, whole_days};
use crate::rules::{
    ContactFields, FieldResolver, ScoringCriterion, evaluate, evaluate_all, validate_conditions,
    validate_rule_name,
};

const SCORE_CEILING: i32 = 100;

/// Per-category totals and contributing rules of one scoring pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScoreComputation {
    /// Clamped to `[0, 100]`.
    pub total: i32,
    /// Sum of rule scores before clamping.
    pub raw_total: i32,
    pub demographic: i32,
    pub behavioral: i32,
    pub engagement: i32,
    pub firmographic: i32,
    pub factors: BTreeMap<String, ScoringFactor>,
    /// Rules that contributed a positive score.
    pub applied_rule_ids: Vec<Uuid>,
}

impl ScoreComputation {
    fn add(&mut self, category: ScoringCategory, score: i32) {
        self.raw_total = self.raw_total.saturating_add(score);
        let bucket = match category {
            ScoringCategory::Demographic => &mut self.demographic,
            ScoringCategory::Behavioral => &mut self.behavioral,
            ScoringCategory::Engagement => &mut self.engagement,
            ScoringCategory::Firmographic => &mut self.firmographic,
        };
        *bucket = bucket.saturating_add(score);
    }
}

/// `base_score` plus every matching criterion's weighted points, capped at
/// the rule's `max_score`. Sums saturate at the `i32` bounds.
pub fn rule_score(rule: &LeadScoringRuleRecord, fields: &dyn FieldResolver) -> i32 {
    let earned = rule
        .criteria
        .iter()
        .filter(|criterion| evaluate(&criterion.condition, fields))
        .map(ScoringCriterion::weighted_points)
        .fold(0i32, i32::saturating_add);
    rule.base_score.saturating_add(earned).min(rule.max_score)
}

/// Score a contact against rules already in evaluation order.
pub fn compute_score(
    rules: &[LeadScoringRuleRecord],
    fields: &dyn FieldResolver,
) -> ScoreComputation {
    let mut out = ScoreComputation::default();
    for rule in rules {
        if !evaluate_all(&rule.applicable_when, fields) {
            continue;
        }
        let score = rule_score(rule, fields);
        out.add(rule.category, score);
        if score > 0 {
            out.factors.insert(
                rule.name.clone(),
                ScoringFactor {
                    rule_name: rule.name.clone(),
                    category: rule.category,
                    score,
                },
            );
            out.applied_rule_ids.push(rule.id);
        }
    }
    out.total = out.raw_total.clamp(0, SCORE_CEILING);
    out
}

/// Result of [`LeadScoringEngine::score_contact`].
#[derive(Debug, Clone)]
pub struct ScoreOutcome {
    pub lifecycle: ContactLifecycleRecord,
    pub previous_score: i32,
    /// False when the rescore window short-circuited the pass.
    pub rescored: bool,
    pub previous_stage: LifecycleStage,
}

impl ScoreOutcome {
    pub fn stage_changed(&self) -> bool {
        self.rescored && self.previous_stage != self.lifecycle.current_stage
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RuleAnalysis {
    pub rule_id: Uuid,
    pub rule_name: String,
    pub category: ScoringCategory,
    pub score: i32,
    pub max_score: i32,
}

/// Read-only breakdown of how a contact scores right now.
#[derive(Debug, Clone, Serialize)]
pub struct ScoringAnalysis {
    pub contact_id: Uuid,
    pub total_score: i32,
    pub max_possible_score: i32,
    pub score_percentage: f64,
    pub grade: &'static str,
    pub category_breakdown: BTreeMap<String, i32>,
    pub rules: Vec<RuleAnalysis>,
    pub scoring_factors: BTreeMap<String, ScoringFactor>,
    pub recommendations: Vec<String>,
    pub last_scored_at: Option<DateTime<Utc>>,
}

pub struct LeadScoringEngine {
    db: Arc<dyn Database>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl LeadScoringEngine {
    pub fn new(db: Arc<dyn Database>, clock: Arc<dyn Clock>, config: EngineConfig) -> Self {
        Self { db, clock, config }
    }

    async fn load_contact(&self, contact_id: Uuid) -> Result<ContactRecord, EngineError> {
        self.db
            .get_contact(contact_id)
            .await?
            .ok_or_else(|| EngineError::not_found("contact", contact_id))
    }

    /// Recompute and persist a contact's score. Within the rescore window the
    /// stored lifecycle is returned untouched unless `force` is set.
    pub async fn score_contact(
        &self,
        contact_id: Uuid,
        force: bool,
        reason: &str,
        actor_id: Option<Uuid>,
    ) -> Result<ScoreOutcome, EngineError> {
        let contact = self.load_contact(contact_id).await?;
        let now = self.clock.now();
        let existing = self.db.get_lifecycle(contact_id).await?;

        if !force
            && let Some(lifecycle) = &existing
            && lifecycle
                .last_scored_at
                .is_some_and(|at| now - at < self.config.rescore_window)
        {
            tracing::debug!(contact_id = %contact_id, "Scored recently, skipping rescore");
            return Ok(ScoreOutcome {
                previous_score: lifecycle.current_score,
                previous_stage: lifecycle.current_stage,
                lifecycle: lifecycle.clone(),
                rescored: false,
            });
        }

        let rules = self.db.list_active_scoring_rules().await?;
        let overrides = HashMap::new();
        let computed = compute_score(&rules, &ContactFields::new(&contact, &overrides));
        if computed.raw_total < 0 {
            tracing::warn!(
                contact_id = %contact_id,
                raw_total = computed.raw_total,
                "Negative scoring rules pushed the total below zero; clamped"
            );
        }

        let mut lifecycle = existing.unwrap_or_else(|| {
            ContactLifecycleRecord::new_for(&contact, stage_for_score(contact.lead_score), now)
        });
        let previous_score = lifecycle.current_score;
        let previous_stage = lifecycle.current_stage;

        lifecycle.current_score = computed.total;
        lifecycle.demographic_score = computed.demographic;
        lifecycle.behavioral_score = computed.behavioral;
        lifecycle.engagement_score = computed.engagement;
        lifecycle.firmographic_score = computed.firmographic;
        lifecycle.scoring_factors = computed.factors.clone();
        lifecycle.score_history.push(ScoreSnapshot {
            score: computed.total,
            demographic_score: computed.demographic,
            behavioral_score: computed.behavioral,
            engagement_score: computed.engagement,
            firmographic_score: computed.firmographic,
            factors: computed.factors.clone(),
            reason: reason.to_string(),
            scored_at: now,
        });
        let overflow = lifecycle
            .score_history
            .len()
            .saturating_sub(self.config.score_history_limit);
        lifecycle.score_history.drain(..overflow);

        let new_stage = stage_for_score(computed.total);
        if new_stage != previous_stage {
            *lifecycle
                .stage_velocity
                .entry(previous_stage.as_str().to_string())
                .or_insert(0) += whole_days(lifecycle.stage_entered_at, now);
            lifecycle.current_stage = new_stage;
            lifecycle.stage_entered_at = now;
        }
        lifecycle.last_scored_at = Some(now);
        lifecycle.updated_at = now;

        self.db.save_score(&lifecycle, now).await?;

        if let Err(e) = self
            .db
            .record_scoring_rules_applied(&computed.applied_rule_ids, now)
            .await
        {
            tracing::warn!(
                contact_id = %contact_id,
                error = %e,
                "Failed to bump scoring rule counters"
            );
        }

        let trigger_type = if force {
            TriggerType::Manual
        } else {
            TriggerType::Automatic
        };
        let delta = computed.total - previous_score;
        let mut events = vec![NewLifecycleEvent {
            contact_id,
            lifecycle_id: lifecycle.id,
            event_type: LifecycleEventType::ScoreChange,
            event_name: "score_change".to_string(),
            description: format!(
                "Lead score updated from {previous_score} to {} ({delta:+})",
                computed.total
            ),
            previous_value: Some(previous_score.to_string()),
            new_value: Some(computed.total.to_string()),
            change_amount: Some(delta),
            trigger_type,
            trigger_source: "lead_scoring".to_string(),
            trigger_data: serde_json::json!({
                "reason": reason,
                "applied_rules": computed.factors.keys().collect::<Vec<_>>(),
            }),
            triggered_by: actor_id,
            created_at: now,
        }];
        if new_stage != previous_stage {
            events.push(NewLifecycleEvent {
                contact_id,
                lifecycle_id: lifecycle.id,
                event_type: LifecycleEventType::StageChange,
                event_name: "stage_change".to_string(),
                description: format!(
                    "Stage changed from {} to {}",
                    previous_stage.as_str(),
                    new_stage.as_str()
                ),
                previous_value: Some(previous_stage.as_str().to_string()),
                new_value: Some(new_stage.as_str().to_string()),
                change_amount: None,
                trigger_type,
                trigger_source: "lead_scoring".to_string(),
                trigger_data: serde_json::json!({ "score": computed.total }),
                triggered_by: actor_id,
                created_at: now,
            });
        }
        for event in &events {
            if let Err(e) = self.db.append_lifecycle_event(event).await {
                tracing::warn!(
                    contact_id = %contact_id,
                    event_type = event.event_type.as_str(),
                    error = %e,
                    "Failed to record lifecycle event"
                );
            }
        }

        tracing::info!(
            contact_id = %contact_id,
            previous_score,
            new_score = computed.total,
            change = delta,
            applied_rules = computed.applied_rule_ids.len(),
            reason,
            "Contact scored"
        );
        audit::record(
            Decision::LeadScored,
            serde_json::json!({
                "contact_id": contact_id,
                "previous_score": previous_score,
                "score": computed.total,
                "stage": new_stage.as_str(),
                "forced": force,
                "actor_id": actor_id,
            }),
        );

        Ok(ScoreOutcome {
            lifecycle,
            previous_score,
            rescored: true,
            previous_stage,
        })
    }

    /// How the contact would score against the current active rules, with
    /// hints for data that would earn more points. Writes nothing.
    pub async fn analyze_scoring(&self, contact_id: Uuid) -> Result<ScoringAnalysis, EngineError> {
        let contact = self.load_contact(contact_id).await?;
        let lifecycle = self.db.get_lifecycle(contact_id).await?;
        let rules = self.db.list_active_scoring_rules().await?;
        let overrides = HashMap::new();
        let fields = ContactFields::new(&contact, &overrides);
        let computed = compute_score(&rules, &fields);

        let mut analyses = Vec::new();
        let mut max_possible_score: i32 = 0;
        let mut recommendations = Vec::new();
        for rule in rules.iter().filter(|rule| evaluate_all(&rule.applicable_when, &fields)) {
            max_possible_score = max_possible_score.saturating_add(rule.max_score);
            analyses.push(RuleAnalysis {
                rule_id: rule.id,
                rule_name: rule.name.clone(),
                category: rule.category,
                score: rule_score(rule, &fields),
                max_score: rule.max_score,
            });
            for criterion in &rule.criteria {
                let points = criterion.weighted_points();
                if points > 0
                    && fields.resolve(&criterion.condition.field).is_empty()
                    && !evaluate(&criterion.condition, &fields)
                {
                    recommendations.push(format!(
                        "Provide {} to earn up to {points} points from '{}'",
                        criterion.condition.field, rule.name
                    ));
                }
            }
        }

        if computed.engagement < 20 {
            recommendations.push(
                "Increase engagement through email campaigns and content marketing".to_string(),
            );
        }
        if computed.behavioral < 15 {
            recommendations.push(
                "Track website visits and content downloads to improve behavioral scoring"
                    .to_string(),
            );
        }
        if computed.total < 40 {
            recommendations.push("Focus on lead nurturing to increase overall score".to_string());
        } else if computed.total >= 60 {
            recommendations.push("Consider moving to sales qualification process".to_string());
        }

        let score_percentage = if max_possible_score > 0 {
            f64::from(computed.total) / f64::from(max_possible_score) * 100.0
        } else {
            0.0
        };
        let category_breakdown = BTreeMap::from([
            (ScoringCategory::Demographic.as_str().to_string(), computed.demographic),
            (ScoringCategory::Behavioral.as_str().to_string(), computed.behavioral),
            (ScoringCategory::Engagement.as_str().to_string(), computed.engagement),
            (ScoringCategory::Firmographic.as_str().to_string(), computed.firmographic),
        ]);

        Ok(ScoringAnalysis {
            contact_id,
            total_score: computed.total,
            max_possible_score,
            score_percentage,
            grade: score_grade(computed.total),
            category_breakdown,
            rules: analyses,
            scoring_factors: computed.factors,
            recommendations,
            last_scored_at: lifecycle.and_then(|l| l.last_scored_at),
        })
    }

    pub async fn create_rule(
        &self,
        params: &CreateScoringRuleParams,
    ) -> Result<LeadScoringRuleRecord, EngineError> {
        let mut params = params.clone();
        params.name = validate_rule_name(&params.name)?;
        validate_scoring_parts(params.max_score, &params.criteria, &params.applicable_when)?;
        let rule = self.db.create_scoring_rule(&params, self.clock.now()).await?;
        tracing::info!(rule_id = %rule.id, name = %rule.name, "Scoring rule created");
        Ok(rule)
    }

    pub async fn update_rule(
        &self,
        rule_id: Uuid,
        params: &UpdateScoringRuleParams,
    ) -> Result<LeadScoringRuleRecord, EngineError> {
        let current = self.get_rule(rule_id).await?;
        let mut params = params.clone();
        if let Some(name) = &params.name {
            params.name = Some(validate_rule_name(name)?);
        }
        validate_scoring_parts(
            params.max_score.unwrap_or(current.max_score),
            params.criteria.as_deref().unwrap_or(&current.criteria),
            params
                .applicable_when
                .as_deref()
                .unwrap_or(&current.applicable_when),
        )?;
        self.db
            .update_scoring_rule(rule_id, &params, self.clock.now())
            .await?
            .ok_or_else(|| EngineError::not_found("scoring rule", rule_id))
    }

    pub async fn delete_rule(&self, rule_id: Uuid) -> Result<(), EngineError> {
        if !self.db.delete_scoring_rule(rule_id).await? {
            return Err(EngineError::not_found("scoring rule", rule_id));
        }
        Ok(())
    }

    pub async fn get_rule(&self, rule_id: Uuid) -> Result<LeadScoringRuleRecord, EngineError> {
        self.db
            .get_scoring_rule(rule_id)
            .await?
            .ok_or_else(|| EngineError::not_found("scoring rule", rule_id))
    }

    pub async fn list_rules(&self) -> Result<Vec<LeadScoringRuleRecord>, EngineError> {
        Ok(self.db.list_scoring_rules().await?)
    }
}

fn validate_scoring_parts(
    max_score: i32,
    criteria: &[ScoringCriterion],
    applicable_when: &[crate::rules::Condition],
) -> Result<(), EngineError> {
    if max_score <= 0 {
        return Err(EngineError::Validation(
            "max_score must be greater than zero".to_string(),
        ));
    }
    for criterion in criteria {
        criterion.validate().map_err(EngineError::Validation)?;
    }
    validate_conditions(applicable_when)
}
