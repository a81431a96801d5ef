//! Composition root: one storage handle and one clock shared by the
//! assignment engine, the scoring engine and the lifecycle machine.

use std::collections::HashMap;
use std::sync::Arc;

use uuid::Uuid;

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::db::{AssignmentStore, Database};
use crate::error::EngineError;
use crate::lifecycle::{
    BulkStatusChange, BulkStatusSummary, LeadScoringEngine, LifecycleMachine, LifecycleSnapshot,
    StatusChange,
};
use crate::routing::AssignmentEngine;

pub struct Leadflow {
    db: Arc<dyn Database>,
    config: EngineConfig,
    assignment: AssignmentEngine,
    scoring: LeadScoringEngine,
    lifecycle: LifecycleMachine,
}

impl Leadflow {
    pub fn new(db: Arc<dyn Database>, clock: Arc<dyn Clock>, config: EngineConfig) -> Self {
        Self {
            assignment: AssignmentEngine::new(Arc::clone(&db), Arc::clone(&clock), config.clone()),
            scoring: LeadScoringEngine::new(Arc::clone(&db), Arc::clone(&clock), config.clone()),
            lifecycle: LifecycleMachine::new(Arc::clone(&db), clock, config.clone()),
            db,
            config,
        }
    }

    pub fn assignment(&self) -> &AssignmentEngine {
        &self.assignment
    }

    pub fn scoring(&self) -> &LeadScoringEngine {
        &self.scoring
    }

    pub fn lifecycle(&self) -> &LifecycleMachine {
        &self.lifecycle
    }

    /// Score a contact, then let the automatic transition rules react to the
    /// new score. Transition and re-routing failures are logged, not returned.
    pub async fn score_contact(
        &self,
        contact_id: Uuid,
        force: bool,
        reason: &str,
        actor_id: Option<Uuid>,
    ) -> Result<LifecycleSnapshot, EngineError> {
        let outcome = self
            .scoring
            .score_contact(contact_id, force, reason, actor_id)
            .await?;

        if outcome.rescored {
            match self.lifecycle.apply_automatic_transitions(contact_id).await {
                Ok(Some(rule)) => {
                    tracing::debug!(
                        contact_id = %contact_id,
                        rule_id = %rule.id,
                        "Transition fired after scoring"
                    );
                    self.route_after_transition(contact_id).await;
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(
                    contact_id = %contact_id,
                    error = %e,
                    "Automatic transition pass failed"
                ),
            }
        }

        self.lifecycle.get_lifecycle(contact_id).await
    }

    pub async fn change_status(
        &self,
        request: &StatusChange,
    ) -> Result<LifecycleSnapshot, EngineError> {
        self.lifecycle.change_status(request).await?;
        self.lifecycle.get_lifecycle(request.contact_id).await
    }

    pub async fn bulk_change_status(
        &self,
        request: &BulkStatusChange,
    ) -> Result<BulkStatusSummary, EngineError> {
        self.lifecycle.bulk_change_status(request).await
    }

    /// Sweep scheduled transition rules; moved contacts are re-routed the
    /// same way as after a scoring pass.
    pub async fn run_scheduled_transitions(&self) -> Result<Vec<Uuid>, EngineError> {
        let moved = self.lifecycle.run_scheduled_transitions().await?;
        for contact_id in &moved {
            self.route_after_transition(*contact_id).await;
        }
        Ok(moved)
    }

    async fn route_after_transition(&self, contact_id: Uuid) {
        if !self.config.route_on_status_change {
            return;
        }
        match self.db.get_active_assignment(contact_id).await {
            Ok(Some(_)) => return,
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(
                    contact_id = %contact_id,
                    error = %e,
                    "Could not check assignment before re-routing"
                );
                return;
            }
        }
        if let Err(e) = self
            .assignment
            .assign_automatically(contact_id, &HashMap::new())
            .await
        {
            tracing::warn!(
                contact_id = %contact_id,
                error = %e,
                "Re-routing after status change failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{TimeZone, Utc};

    use super::Leadflow;
    use crate::clock::ManualClock;
    use crate::config::EngineConfig;
    use crate::db::libsql::test_support::setup_backend;
    use crate::db::{
        AssignmentStore, ContactDirectory, ContactStatus, CreateScoringRuleParams,
        CreateTransitionRuleParams, OwnerDirectory, ScoringCategory, UpsertContactParams,
        UpsertOwnerParams,
    };
    use crate::rules::{Condition, Operator, ScoringCriterion};

    #[tokio::test]
    async fn scoring_can_move_status_and_route_the_contact() {
        let fixture = setup_backend().await;
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(now));
        let engine = Leadflow::new(fixture.database(), clock, EngineConfig::default());

        let manager = fixture
            .backend
            .upsert_owner(&UpsertOwnerParams::new("Dana", "manager"), now)
            .await
            .expect("owner");
        let mut params = UpsertContactParams::new("Ari", "Stone");
        params.phone = Some("+1 555 0100".to_string());
        let contact = fixture.backend.upsert_contact(&params, now).await.expect("contact");

        let rule = CreateScoringRuleParams::new(
            "Phone provided",
            ScoringCategory::Demographic,
            vec![ScoringCriterion::new(
                "phone",
                Condition::new("phone", Operator::NotEquals, "".into()),
                65,
            )],
        );
        engine.scoring().create_rule(&rule).await.expect("scoring rule");

        let mut transition = CreateTransitionRuleParams::new(
            "Auto qualify",
            ContactStatus::New,
            ContactStatus::Qualified,
        );
        transition.required_score = 60;
        engine.lifecycle().create_rule(&transition).await.expect("transition rule");

        let snapshot = engine
            .score_contact(contact.id, false, "import", None)
            .await
            .expect("score");
        assert_eq!(snapshot.current_score, 65);
        assert_eq!(snapshot.current_status, ContactStatus::Qualified);
        assert_eq!(snapshot.qualification_at, Some(now));

        let active = fixture
            .backend
            .get_active_assignment(contact.id)
            .await
            .expect("query")
            .expect("routed to fallback manager");
        assert_eq!(active.owner_id, manager.id);
    }
}
