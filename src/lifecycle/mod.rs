//! Lead scoring and the contact lifecycle state machine.
//!
//! Stage is derived from the score alone; status moves either by caller
//! request (checked against [`allowed_transitions`]) or by transition rules
//! evaluated after each scoring pass.

pub mod machine;
pub mod scoring;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::db::{
    ContactLifecycleRecord, ContactRecord, ContactStatus, LifecycleStage, ScoreSnapshot,
    ScoringFactor,
};

pub use machine::{BulkStatusChange, BulkStatusSummary, LifecycleMachine, StatusChange};
pub use scoring::{LeadScoringEngine, RuleAnalysis, ScoreComputation, ScoreOutcome, ScoringAnalysis};

/// Score thresholds, highest first.
const STAGE_THRESHOLDS: [(i32, LifecycleStage); 4] = [
    (80, LifecycleStage::SalesQualifiedLead),
    (60, LifecycleStage::MarketingQualifiedLead),
    (40, LifecycleStage::Prospect),
    (20, LifecycleStage::Suspect),
];

pub fn stage_for_score(score: i32) -> LifecycleStage {
    STAGE_THRESHOLDS
        .iter()
        .find(|(threshold, _)| score >= *threshold)
        .map_or(LifecycleStage::Unknown, |(_, stage)| *stage)
}

/// Statuses reachable from `from` without forcing.
pub fn allowed_transitions(from: ContactStatus) -> &'static [ContactStatus] {
    use ContactStatus::*;

    match from {
        New => &[Contacted, Qualified, ClosedLost],
        Contacted => &[Qualified, Nurturing, ClosedLost],
        Qualified => &[Proposal, Nurturing, ClosedLost],
        Proposal => &[Negotiation, Qualified, ClosedLost],
        Negotiation => &[ClosedWon, ClosedLost, OnHold],
        Nurturing => &[Qualified, Contacted, ClosedLost],
        OnHold => &[Negotiation, Qualified, ClosedLost],
        ClosedWon | ClosedLost => &[],
    }
}

pub fn is_transition_allowed(from: ContactStatus, to: ContactStatus) -> bool {
    allowed_transitions(from).contains(&to)
}

pub fn score_grade(score: i32) -> &'static str {
    match score {
        s if s >= 90 => "A",
        s if s >= 80 => "B",
        s if s >= 70 => "C",
        s if s >= 60 => "D",
        _ => "F",
    }
}

pub fn qualification_status(score: i32, status: ContactStatus) -> &'static str {
    if score >= 60 || status == ContactStatus::Qualified {
        "qualified"
    } else if score >= 40 {
        "pending"
    } else {
        "unqualified"
    }
}

pub fn next_suggested_action(score: i32, status: ContactStatus) -> &'static str {
    match status {
        ContactStatus::New if score >= 80 => "Qualify lead and move to sales",
        ContactStatus::Contacted if score >= 60 => "Schedule demo or consultation",
        ContactStatus::New if score >= 40 => "Initiate contact via phone or email",
        ContactStatus::Qualified => "Send proposal or pricing information",
        ContactStatus::Proposal => "Follow up on proposal status",
        _ => "Continue nurturing with targeted content",
    }
}

/// Whole days between `since` and `now`, never negative.
pub(crate) fn whole_days(since: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (now - since).num_days().max(0)
}

/// Lifecycle row plus the values derived from it at read time.
#[derive(Debug, Clone, Serialize)]
pub struct LifecycleSnapshot {
    pub id: Uuid,
    pub contact_id: Uuid,
    /// False for a contact that has never been scored or moved.
    pub persisted: bool,
    pub current_stage: LifecycleStage,
    pub current_status: ContactStatus,
    pub current_score: i32,
    pub demographic_score: i32,
    pub behavioral_score: i32,
    pub engagement_score: i32,
    pub firmographic_score: i32,
    pub score_history: Vec<ScoreSnapshot>,
    pub scoring_factors: BTreeMap<String, ScoringFactor>,
    pub stage_velocity: BTreeMap<String, i64>,
    pub stage_entered_at: DateTime<Utc>,
    pub status_entered_at: DateTime<Utc>,
    pub last_scored_at: Option<DateTime<Utc>>,
    pub first_engagement_at: Option<DateTime<Utc>>,
    pub qualification_at: Option<DateTime<Utc>>,
    pub opportunity_at: Option<DateTime<Utc>>,
    pub conversion_at: Option<DateTime<Utc>>,
    pub days_in_current_stage: i64,
    pub days_in_current_status: i64,
    pub total_lifecycle_days: i64,
    pub score_grade: &'static str,
    pub qualification_status: &'static str,
    pub next_suggested_action: &'static str,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LifecycleSnapshot {
    pub fn build(lifecycle: ContactLifecycleRecord, persisted: bool, now: DateTime<Utc>) -> Self {
        let score = lifecycle.current_score;
        let status = lifecycle.current_status;
        Self {
            id: lifecycle.id,
            contact_id: lifecycle.contact_id,
            persisted,
            current_stage: lifecycle.current_stage,
            current_status: status,
            current_score: score,
            demographic_score: lifecycle.demographic_score,
            behavioral_score: lifecycle.behavioral_score,
            engagement_score: lifecycle.engagement_score,
            firmographic_score: lifecycle.firmographic_score,
            days_in_current_stage: whole_days(lifecycle.stage_entered_at, now),
            days_in_current_status: whole_days(lifecycle.status_entered_at, now),
            total_lifecycle_days: whole_days(lifecycle.created_at, now),
            score_history: lifecycle.score_history,
            scoring_factors: lifecycle.scoring_factors,
            stage_velocity: lifecycle.stage_velocity,
            stage_entered_at: lifecycle.stage_entered_at,
            status_entered_at: lifecycle.status_entered_at,
            last_scored_at: lifecycle.last_scored_at,
            first_engagement_at: lifecycle.first_engagement_at,
            qualification_at: lifecycle.qualification_at,
            opportunity_at: lifecycle.opportunity_at,
            conversion_at: lifecycle.conversion_at,
            score_grade: score_grade(score),
            qualification_status: qualification_status(score, status),
            next_suggested_action: next_suggested_action(score, status),
            created_at: lifecycle.created_at,
            updated_at: lifecycle.updated_at,
        }
    }

    /// Unpersisted view of a contact that has no lifecycle row yet, dated
    /// from the contact's creation.
    pub fn synthesized(contact: &ContactRecord, now: DateTime<Utc>) -> Self {
        let lifecycle = ContactLifecycleRecord::new_for(
            contact,
            stage_for_score(contact.lead_score),
            contact.created_at,
        );
        Self::build(lifecycle, false, now)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use super::{
        allowed_transitions, is_transition_allowed, next_suggested_action, qualification_status,
        score_grade, stage_for_score, whole_days,
    };
    use crate::db::{ContactStatus, LifecycleStage};

    #[test]
    fn stage_thresholds_are_inclusive() {
        assert_eq!(stage_for_score(-5), LifecycleStage::Unknown);
        assert_eq!(stage_for_score(19), LifecycleStage::Unknown);
        assert_eq!(stage_for_score(20), LifecycleStage::Suspect);
        assert_eq!(stage_for_score(25), LifecycleStage::Suspect);
        assert_eq!(stage_for_score(40), LifecycleStage::Prospect);
        assert_eq!(stage_for_score(60), LifecycleStage::MarketingQualifiedLead);
        assert_eq!(stage_for_score(80), LifecycleStage::SalesQualifiedLead);
        assert_eq!(stage_for_score(100), LifecycleStage::SalesQualifiedLead);
    }

    #[test]
    fn stage_never_drops_as_score_rises() {
        let mut previous = stage_for_score(-10).rank();
        for score in -10..=110 {
            let rank = stage_for_score(score).rank();
            assert!(rank >= previous, "stage rank fell at score {score}");
            previous = rank;
        }
    }

    #[test]
    fn adjacency_table_matches_sales_pipeline() {
        assert!(is_transition_allowed(ContactStatus::New, ContactStatus::Contacted));
        assert!(is_transition_allowed(ContactStatus::Negotiation, ContactStatus::ClosedWon));
        assert!(!is_transition_allowed(ContactStatus::New, ContactStatus::ClosedWon));
        assert!(!is_transition_allowed(ContactStatus::Proposal, ContactStatus::New));
        assert!(allowed_transitions(ContactStatus::ClosedWon).is_empty());
        assert!(allowed_transitions(ContactStatus::ClosedLost).is_empty());
    }

    #[test]
    fn derived_labels_follow_score_and_status() {
        assert_eq!(score_grade(95), "A");
        assert_eq!(score_grade(80), "B");
        assert_eq!(score_grade(59), "F");
        assert_eq!(qualification_status(10, ContactStatus::Qualified), "qualified");
        assert_eq!(qualification_status(45, ContactStatus::New), "pending");
        assert_eq!(qualification_status(10, ContactStatus::New), "unqualified");
        assert_eq!(
            next_suggested_action(85, ContactStatus::New),
            "Qualify lead and move to sales"
        );
        assert_eq!(
            next_suggested_action(45, ContactStatus::New),
            "Initiate contact via phone or email"
        );
        assert_eq!(
            next_suggested_action(10, ContactStatus::OnHold),
            "Continue nurturing with targeted content"
        );
    }

    #[test]
    fn whole_days_truncates_and_floors_at_zero() {
        let start = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
        assert_eq!(whole_days(start, start + Duration::hours(47)), 1);
        assert_eq!(whole_days(start, start - Duration::days(2)), 0);
    }
}
