//! Status transitions: caller-requested moves, rule-driven moves after
//! scoring, and scheduled sweeps.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::audit::{self, Decision};
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::db::{
    ContactDirectory, ContactLifecycleRecord, ContactRecord, ContactStatus,
    CreateTransitionRuleParams, Database, LifecycleEventRecord, LifecycleEventType,
    LifecycleStore, NewLifecycleEvent, StatusChangeCommit, StatusTransitionRuleRecord,
    TransitionRuleStore, TriggerType, UpdateTransitionRuleParams,
};
use crate::error::{BulkItemError, EngineError};
use crate::lifecycle::{LifecycleSnapshot, is_transition_allowed, stage_for_score, whole_days};
use crate::routing::workload::WorkloadTracker;
use crate::rules::{ContactFields, evaluate_all, validate_conditions, validate_rule_name};

/// Caller-requested status move.
#[derive(Debug, Clone)]
pub struct StatusChange {
    pub contact_id: Uuid,
    pub new_status: ContactStatus,
    pub reason: String,
    /// Skip the adjacency check. Moving to the current status is still refused.
    pub force: bool,
    pub actor_id: Option<Uuid>,
}

#[derive(Debug, Clone)]
pub struct BulkStatusChange {
    pub contact_ids: Vec<Uuid>,
    pub new_status: ContactStatus,
    pub reason: String,
    pub force: bool,
    pub actor_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkStatusSummary {
    pub succeeded: usize,
    pub errors: Vec<BulkItemError>,
}

/// Who or what moved the status, as recorded on the event.
struct Trigger {
    trigger_type: TriggerType,
    source: String,
    description: String,
    data: serde_json::Value,
    actor_id: Option<Uuid>,
    rule_id: Option<Uuid>,
}

fn milestone_for(
    lifecycle: &mut ContactLifecycleRecord,
    status: ContactStatus,
) -> Option<(&'static str, &mut Option<DateTime<Utc>>)> {
    match status {
        ContactStatus::Contacted => Some(("first_engagement", &mut lifecycle.first_engagement_at)),
        ContactStatus::Qualified => Some(("qualification", &mut lifecycle.qualification_at)),
        ContactStatus::Proposal | ContactStatus::Negotiation => {
            Some(("opportunity", &mut lifecycle.opportunity_at))
        }
        ContactStatus::ClosedWon => Some(("conversion", &mut lifecycle.conversion_at)),
        _ => None,
    }
}

/// Build the atomic write for moving `contact` to `to`.
fn build_status_change(
    contact: &ContactRecord,
    existing: Option<ContactLifecycleRecord>,
    to: ContactStatus,
    trigger: Trigger,
    now: DateTime<Utc>,
) -> StatusChangeCommit {
    let mut lifecycle = existing.unwrap_or_else(|| {
        ContactLifecycleRecord::new_for(contact, stage_for_score(contact.lead_score), now)
    });
    let from = contact.status;
    lifecycle.current_status = to;
    lifecycle.status_entered_at = now;
    lifecycle.updated_at = now;

    let mut events = vec![NewLifecycleEvent {
        contact_id: contact.id,
        lifecycle_id: lifecycle.id,
        event_type: LifecycleEventType::StatusChange,
        event_name: "status_change".to_string(),
        description: trigger.description,
        previous_value: Some(from.as_str().to_string()),
        new_value: Some(to.as_str().to_string()),
        change_amount: None,
        trigger_type: trigger.trigger_type,
        trigger_source: trigger.source.clone(),
        trigger_data: trigger.data,
        triggered_by: trigger.actor_id,
        created_at: now,
    }];

    let lifecycle_id = lifecycle.id;
    if let Some((name, slot)) = milestone_for(&mut lifecycle, to)
        && slot.is_none()
    {
        *slot = Some(now);
        events.push(NewLifecycleEvent {
            contact_id: contact.id,
            lifecycle_id,
            event_type: LifecycleEventType::Milestone,
            event_name: name.to_string(),
            description: format!("Milestone reached: {name}"),
            previous_value: None,
            new_value: Some(to.as_str().to_string()),
            change_amount: None,
            trigger_type: trigger.trigger_type,
            trigger_source: trigger.source,
            trigger_data: serde_json::Value::Null,
            triggered_by: trigger.actor_id,
            created_at: now,
        });
    }

    StatusChangeCommit {
        lifecycle,
        events,
        transition_rule_id: trigger.rule_id,
    }
}

fn check_manual_transition(
    from: ContactStatus,
    to: ContactStatus,
    force: bool,
) -> Result<(), EngineError> {
    let reason = if from == to {
        format!("contact is already in {} status", to.as_str())
    } else if !force && !is_transition_allowed(from, to) {
        "transition is not allowed".to_string()
    } else {
        return Ok(());
    };
    Err(EngineError::InvalidTransition {
        from: from.as_str().to_string(),
        to: to.as_str().to_string(),
        reason,
    })
}

fn rule_trigger(rule: &StatusTransitionRuleRecord, from: ContactStatus) -> Trigger {
    Trigger {
        trigger_type: rule.transition_type,
        source: format!("rule:{}", rule.id),
        description: format!(
            "Automatic status transition from {} to {} via rule: {}",
            from.as_str(),
            rule.to_status.as_str(),
            rule.name
        ),
        data: serde_json::json!({
            "rule_id": rule.id,
            "rule_name": rule.name,
            "actions": rule.actions,
            "notify_owner_ids": rule.notify_owner_ids,
        }),
        actor_id: None,
        rule_id: Some(rule.id),
    }
}

pub struct LifecycleMachine {
    db: Arc<dyn Database>,
    clock: Arc<dyn Clock>,
    workloads: WorkloadTracker,
}

impl LifecycleMachine {
    pub fn new(db: Arc<dyn Database>, clock: Arc<dyn Clock>, config: EngineConfig) -> Self {
        let workloads =
            WorkloadTracker::new(Arc::clone(&db), Arc::clone(&clock), config.terminal_statuses);
        Self {
            db,
            clock,
            workloads,
        }
    }

    async fn load_contact(&self, contact_id: Uuid) -> Result<ContactRecord, EngineError> {
        self.db
            .get_contact(contact_id)
            .await?
            .ok_or_else(|| EngineError::not_found("contact", contact_id))
    }

    pub async fn change_status(
        &self,
        request: &StatusChange,
    ) -> Result<ContactLifecycleRecord, EngineError> {
        let contact = self.load_contact(request.contact_id).await?;
        check_manual_transition(contact.status, request.new_status, request.force)?;

        let now = self.clock.now();
        let existing = self.db.get_lifecycle(contact.id).await?;
        let trigger = self.manual_trigger(
            &contact,
            request.new_status,
            &request.reason,
            request.force,
            request.actor_id,
        );
        let change = build_status_change(&contact, existing, request.new_status, trigger, now);
        self.db.commit_status_change(&change, now).await?;
        self.after_status_change(&contact, request.new_status, "user_action", request.actor_id)
            .await;
        Ok(change.lifecycle)
    }

    fn manual_trigger(
        &self,
        contact: &ContactRecord,
        to: ContactStatus,
        reason: &str,
        force: bool,
        actor_id: Option<Uuid>,
    ) -> Trigger {
        Trigger {
            trigger_type: TriggerType::Manual,
            source: "user_action".to_string(),
            description: format!(
                "Status changed from {} to {}: {reason}",
                contact.status.as_str(),
                to.as_str()
            ),
            data: serde_json::json!({ "reason": reason, "forced": force }),
            actor_id,
            rule_id: None,
        }
    }

    /// Move many contacts in one transaction. Items fail independently; when
    /// none succeeds nothing is written and the last item error is returned.
    pub async fn bulk_change_status(
        &self,
        request: &BulkStatusChange,
    ) -> Result<BulkStatusSummary, EngineError> {
        let now = self.clock.now();
        let mut errors = Vec::new();
        let mut last_error: Option<EngineError> = None;
        let mut changes = Vec::new();
        let mut contacts = HashMap::new();

        let mut seen = HashSet::new();
        for contact_id in request.contact_ids.iter().filter(|id| seen.insert(**id)) {
            let prepared = async {
                let contact = self.load_contact(*contact_id).await?;
                check_manual_transition(contact.status, request.new_status, request.force)?;
                let existing = self.db.get_lifecycle(contact.id).await?;
                Ok::<_, EngineError>((contact, existing))
            }
            .await;
            match prepared {
                Ok((contact, existing)) => {
                    let trigger = self.manual_trigger(
                        &contact,
                        request.new_status,
                        &request.reason,
                        request.force,
                        request.actor_id,
                    );
                    changes.push(build_status_change(
                        &contact,
                        existing,
                        request.new_status,
                        trigger,
                        now,
                    ));
                    contacts.insert(contact.id, contact);
                }
                Err(e) => {
                    errors.push(BulkItemError {
                        contact_id: *contact_id,
                        message: e.to_string(),
                    });
                    last_error = Some(e);
                }
            }
        }

        let failures = self.db.commit_status_changes(&changes, now).await?;
        let failed: HashSet<Uuid> = failures.iter().map(|(id, _)| *id).collect();
        for (contact_id, err) in failures {
            tracing::warn!(
                contact_id = %contact_id,
                error = %err,
                "Bulk status change item failed"
            );
            errors.push(BulkItemError {
                contact_id,
                message: err.to_string(),
            });
            last_error = Some(err.into());
        }

        let succeeded = changes.len() - failed.len();
        if succeeded == 0 {
            return Err(last_error.unwrap_or_else(|| {
                EngineError::Validation("bulk status change needs at least one contact".to_string())
            }));
        }

        for change in &changes {
            let contact_id = change.lifecycle.contact_id;
            if failed.contains(&contact_id) {
                continue;
            }
            if let Some(contact) = contacts.get(&contact_id) {
                self.after_status_change(
                    contact,
                    request.new_status,
                    "user_action",
                    request.actor_id,
                )
                .await;
            }
        }
        tracing::info!(
            total = request.contact_ids.len(),
            succeeded,
            failed = errors.len(),
            new_status = request.new_status.as_str(),
            "Bulk status change completed"
        );
        Ok(BulkStatusSummary { succeeded, errors })
    }

    /// Fire the first automatic or triggered rule leaving the contact's
    /// current status whose gates all pass. At most one rule fires.
    pub async fn apply_automatic_transitions(
        &self,
        contact_id: Uuid,
    ) -> Result<Option<StatusTransitionRuleRecord>, EngineError> {
        let contact = self.load_contact(contact_id).await?;
        let now = self.clock.now();
        let lifecycle = match self.db.get_lifecycle(contact_id).await? {
            Some(lifecycle) => lifecycle,
            None => {
                ContactLifecycleRecord::new_for(&contact, stage_for_score(contact.lead_score), now)
            }
        };

        let rules = self.db.list_active_transition_rules_from(contact.status).await?;
        for rule in rules.into_iter().filter(|rule| {
            matches!(
                rule.transition_type,
                TriggerType::Automatic | TriggerType::Triggered
            )
        }) {
            if should_trigger(&rule, &contact, &lifecycle, now) {
                self.fire(&rule, &contact, Some(lifecycle), now).await?;
                return Ok(Some(rule));
            }
        }
        Ok(None)
    }

    /// Evaluate every active scheduled rule against the lifecycles sitting in
    /// its from-status. Returns the contacts that moved; each contact moves
    /// at most once per sweep.
    pub async fn run_scheduled_transitions(&self) -> Result<Vec<Uuid>, EngineError> {
        let rules = self.db.list_transition_rules().await?;
        let mut moved = Vec::new();
        let mut seen = HashSet::new();

        for rule in rules
            .iter()
            .filter(|rule| rule.is_active && rule.transition_type == TriggerType::Scheduled)
        {
            for lifecycle in self.db.list_lifecycles_in_status(rule.from_status).await? {
                if seen.contains(&lifecycle.contact_id) {
                    continue;
                }
                let Some(contact) = self.db.get_contact(lifecycle.contact_id).await? else {
                    continue;
                };
                if contact.status != rule.from_status {
                    continue;
                }
                let now = self.clock.now();
                if !should_trigger(rule, &contact, &lifecycle, now) {
                    continue;
                }
                let contact_id = contact.id;
                match self.fire(rule, &contact, Some(lifecycle), now).await {
                    Ok(()) => {
                        seen.insert(contact_id);
                        moved.push(contact_id);
                    }
                    Err(e) => tracing::warn!(
                        contact_id = %contact_id,
                        rule_id = %rule.id,
                        error = %e,
                        "Scheduled transition failed"
                    ),
                }
            }
        }
        tracing::info!(moved = moved.len(), "Scheduled transitions finished");
        Ok(moved)
    }

    async fn fire(
        &self,
        rule: &StatusTransitionRuleRecord,
        contact: &ContactRecord,
        lifecycle: Option<ContactLifecycleRecord>,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let change = build_status_change(
            contact,
            lifecycle,
            rule.to_status,
            rule_trigger(rule, contact.status),
            now,
        );
        self.db.commit_status_change(&change, now).await?;
        tracing::info!(
            contact_id = %contact.id,
            rule_id = %rule.id,
            previous_status = contact.status.as_str(),
            new_status = rule.to_status.as_str(),
            "Automatic status transition executed"
        );
        self.after_status_change(contact, rule.to_status, &format!("rule:{}", rule.id), None)
            .await;
        Ok(())
    }

    async fn after_status_change(
        &self,
        contact: &ContactRecord,
        to: ContactStatus,
        source: &str,
        actor_id: Option<Uuid>,
    ) {
        // Terminal statuses drop out of the owner's active load.
        if let Some(owner_id) = contact.assigned_to {
            self.workloads.recompute_best_effort(owner_id).await;
        }
        if source == "user_action" {
            tracing::info!(
                contact_id = %contact.id,
                previous_status = contact.status.as_str(),
                new_status = to.as_str(),
                actor_id = ?actor_id,
                "Contact status changed"
            );
        }
        audit::record(
            Decision::StatusChanged,
            serde_json::json!({
                "contact_id": contact.id,
                "from": contact.status.as_str(),
                "to": to.as_str(),
                "source": source,
                "actor_id": actor_id,
            }),
        );
    }

    /// Stored lifecycle, or a synthesised one for a contact never scored.
    pub async fn get_lifecycle(&self, contact_id: Uuid) -> Result<LifecycleSnapshot, EngineError> {
        let contact = self.load_contact(contact_id).await?;
        let now = self.clock.now();
        Ok(match self.db.get_lifecycle(contact_id).await? {
            Some(lifecycle) => LifecycleSnapshot::build(lifecycle, true, now),
            None => LifecycleSnapshot::synthesized(&contact, now),
        })
    }

    pub async fn lifecycle_events(
        &self,
        contact_id: Uuid,
        limit: usize,
    ) -> Result<Vec<LifecycleEventRecord>, EngineError> {
        Ok(self.db.list_lifecycle_events(contact_id, limit).await?)
    }

    pub async fn create_rule(
        &self,
        params: &CreateTransitionRuleParams,
    ) -> Result<StatusTransitionRuleRecord, EngineError> {
        let mut params = params.clone();
        params.name = validate_rule_name(&params.name)?;
        validate_transition_parts(
            params.from_status,
            params.to_status,
            params.required_score,
            params.days_in_status,
        )?;
        validate_conditions(&params.conditions)?;
        let rule = self
            .db
            .create_transition_rule(&params, self.clock.now())
            .await?;
        tracing::info!(rule_id = %rule.id, name = %rule.name, "Transition rule created");
        Ok(rule)
    }

    pub async fn update_rule(
        &self,
        rule_id: Uuid,
        params: &UpdateTransitionRuleParams,
    ) -> Result<StatusTransitionRuleRecord, EngineError> {
        let current = self.get_rule(rule_id).await?;
        let mut params = params.clone();
        if let Some(name) = &params.name {
            params.name = Some(validate_rule_name(name)?);
        }
        validate_transition_parts(
            params.from_status.unwrap_or(current.from_status),
            params.to_status.unwrap_or(current.to_status),
            params.required_score.unwrap_or(current.required_score),
            params.days_in_status.unwrap_or(current.days_in_status),
        )?;
        if let Some(conditions) = &params.conditions {
            validate_conditions(conditions)?;
        }
        self.db
            .update_transition_rule(rule_id, &params, self.clock.now())
            .await?
            .ok_or_else(|| EngineError::not_found("transition rule", rule_id))
    }

    pub async fn delete_rule(&self, rule_id: Uuid) -> Result<(), EngineError> {
        if !self.db.delete_transition_rule(rule_id).await? {
            return Err(EngineError::not_found("transition rule", rule_id));
        }
        Ok(())
    }

    pub async fn get_rule(&self, rule_id: Uuid) -> Result<StatusTransitionRuleRecord, EngineError> {
        self.db
            .get_transition_rule(rule_id)
            .await?
            .ok_or_else(|| EngineError::not_found("transition rule", rule_id))
    }

    pub async fn list_rules(&self) -> Result<Vec<StatusTransitionRuleRecord>, EngineError> {
        Ok(self.db.list_transition_rules().await?)
    }
}

fn should_trigger(
    rule: &StatusTransitionRuleRecord,
    contact: &ContactRecord,
    lifecycle: &ContactLifecycleRecord,
    now: DateTime<Utc>,
) -> bool {
    if rule.required_score > 0 && lifecycle.current_score < rule.required_score {
        return false;
    }
    if rule.days_in_status > 0
        && whole_days(lifecycle.status_entered_at, now) < i64::from(rule.days_in_status)
    {
        return false;
    }
    let overrides = HashMap::new();
    evaluate_all(&rule.conditions, &ContactFields::new(contact, &overrides))
}

fn validate_transition_parts(
    from: ContactStatus,
    to: ContactStatus,
    required_score: i32,
    days_in_status: i32,
) -> Result<(), EngineError> {
    if from == to {
        return Err(EngineError::Validation(
            "from_status and to_status must differ".to_string(),
        ));
    }
    if required_score < 0 || days_in_status < 0 {
        return Err(EngineError::Validation(
            "required_score and days_in_status must not be negative".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{DateTime, Duration, TimeZone, Utc};
    use uuid::Uuid;

    use super::{BulkStatusChange, LifecycleMachine, StatusChange};
    use crate::clock::{Clock, ManualClock};
    use crate::config::EngineConfig;
    use crate::db::libsql::test_support::{TestBackend, setup_backend};
    use crate::db::{
        ContactDirectory, ContactLifecycleRecord, ContactStatus, CreateTransitionRuleParams,
        LifecycleEventType, LifecycleStage, LifecycleStore, TransitionRuleStore, TriggerType,
        UpsertContactParams,
    };
    use crate::error::EngineError;
    use crate::rules::{Condition, Operator};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
    }

    async fn harness() -> (TestBackend, Arc<ManualClock>, LifecycleMachine) {
        let fixture = setup_backend().await;
        let clock = Arc::new(ManualClock::new(t0()));
        let machine =
            LifecycleMachine::new(fixture.database(), clock.clone(), EngineConfig::default());
        (fixture, clock, machine)
    }

    async fn contact_with(fixture: &TestBackend, status: ContactStatus, score: i32) -> Uuid {
        let mut params = UpsertContactParams::new("Kim", "Lane");
        params.status = status;
        params.lead_score = score;
        fixture
            .backend
            .upsert_contact(&params, t0())
            .await
            .expect("contact")
            .id
    }

    fn request(contact_id: Uuid, to: ContactStatus, force: bool) -> StatusChange {
        StatusChange {
            contact_id,
            new_status: to,
            reason: "call went well".to_string(),
            force,
            actor_id: None,
        }
    }

    #[tokio::test]
    async fn manual_change_follows_adjacency_unless_forced() {
        let (fixture, _clock, machine) = harness().await;
        let contact_id = contact_with(&fixture, ContactStatus::New, 0).await;

        let err = machine
            .change_status(&request(contact_id, ContactStatus::ClosedWon, false))
            .await
            .expect_err("not adjacent");
        assert!(matches!(err, EngineError::InvalidTransition { .. }));

        let same = machine
            .change_status(&request(contact_id, ContactStatus::New, true))
            .await
            .expect_err("same status");
        assert!(matches!(same, EngineError::InvalidTransition { .. }));

        let lifecycle = machine
            .change_status(&request(contact_id, ContactStatus::ClosedWon, true))
            .await
            .expect("forced");
        assert_eq!(lifecycle.current_status, ContactStatus::ClosedWon);
        assert_eq!(lifecycle.conversion_at, Some(t0()));
        let contact = fixture.backend.get_contact(contact_id).await.unwrap().unwrap();
        assert_eq!(contact.status, ContactStatus::ClosedWon);
    }

    #[tokio::test]
    async fn milestones_are_set_once() {
        let (fixture, clock, machine) = harness().await;
        let contact_id = contact_with(&fixture, ContactStatus::New, 0).await;

        machine
            .change_status(&request(contact_id, ContactStatus::Qualified, false))
            .await
            .expect("qualify");
        clock.advance(Duration::days(1));
        machine
            .change_status(&request(contact_id, ContactStatus::Nurturing, false))
            .await
            .expect("nurture");
        clock.advance(Duration::days(1));
        let lifecycle = machine
            .change_status(&request(contact_id, ContactStatus::Qualified, false))
            .await
            .expect("requalify");
        assert_eq!(lifecycle.qualification_at, Some(t0()));
        assert_eq!(lifecycle.status_entered_at, clock.now());

        let events = machine.lifecycle_events(contact_id, 0).await.expect("events");
        let milestones = events
            .iter()
            .filter(|e| e.event_type == LifecycleEventType::Milestone)
            .count();
        assert_eq!(milestones, 1);
        let status_event = events
            .iter()
            .find(|e| e.event_type == LifecycleEventType::StatusChange)
            .expect("status event");
        assert_eq!(status_event.trigger_type, TriggerType::Manual);
        assert_eq!(status_event.trigger_source, "user_action");
        assert_eq!(
            status_event.description,
            "Status changed from nurturing to qualified: call went well"
        );
    }

    #[tokio::test]
    async fn automatic_rules_fire_once_with_gates() {
        let (fixture, clock, machine) = harness().await;

        let mut too_strict = CreateTransitionRuleParams::new(
            "Hot leads",
            ContactStatus::New,
            ContactStatus::Qualified,
        );
        too_strict.required_score = 90;
        too_strict.priority = 10;
        machine.create_rule(&too_strict).await.expect("strict");

        let mut waiting = CreateTransitionRuleParams::new(
            "Warm leads",
            ContactStatus::New,
            ContactStatus::Contacted,
        );
        waiting.required_score = 60;
        waiting.days_in_status = 2;
        waiting.conditions = vec![Condition::new("lead_score", Operator::GreaterThan, 50.0.into())];
        let waiting = machine.create_rule(&waiting).await.expect("waiting");

        let fresh = contact_with(&fixture, ContactStatus::New, 70).await;
        let mut lifecycle = ContactLifecycleRecord::new_for(
            &fixture.backend.get_contact(fresh).await.unwrap().unwrap(),
            LifecycleStage::MarketingQualifiedLead,
            clock.now(),
        );
        lifecycle.current_score = 70;
        fixture.backend.save_score(&lifecycle, clock.now()).await.expect("seed");

        assert!(machine.apply_automatic_transitions(fresh).await.unwrap().is_none());
        clock.advance(Duration::days(2));
        let fired = machine
            .apply_automatic_transitions(fresh)
            .await
            .expect("apply")
            .expect("rule fired");
        assert_eq!(fired.id, waiting.id);

        let contact = fixture.backend.get_contact(fresh).await.unwrap().unwrap();
        assert_eq!(contact.status, ContactStatus::Contacted);
        let stored = fixture.backend.get_transition_rule(waiting.id).await.unwrap().unwrap();
        assert_eq!(stored.times_triggered, 1);
        let events = fixture.backend.list_lifecycle_events(fresh, 0).await.unwrap();
        let event = events
            .iter()
            .find(|e| e.event_type == LifecycleEventType::StatusChange)
            .expect("status event");
        assert_eq!(event.trigger_source, format!("rule:{}", waiting.id));
        assert_eq!(event.trigger_type, TriggerType::Automatic);
    }

    #[tokio::test]
    async fn scheduled_rules_only_run_in_sweeps() {
        let (fixture, clock, machine) = harness().await;
        let contact_id = contact_with(&fixture, ContactStatus::New, 0).await;
        machine
            .change_status(&request(contact_id, ContactStatus::Contacted, false))
            .await
            .expect("contacted");

        let mut stale = CreateTransitionRuleParams::new(
            "Stale contacts",
            ContactStatus::Contacted,
            ContactStatus::Nurturing,
        );
        stale.transition_type = TriggerType::Scheduled;
        stale.days_in_status = 14;
        machine.create_rule(&stale).await.expect("rule");

        assert!(machine.apply_automatic_transitions(contact_id).await.unwrap().is_none());
        assert!(machine.run_scheduled_transitions().await.unwrap().is_empty());

        clock.advance(Duration::days(14));
        assert!(machine.apply_automatic_transitions(contact_id).await.unwrap().is_none());
        assert_eq!(machine.run_scheduled_transitions().await.unwrap(), vec![contact_id]);
        let contact = fixture.backend.get_contact(contact_id).await.unwrap().unwrap();
        assert_eq!(contact.status, ContactStatus::Nurturing);
    }

    #[tokio::test]
    async fn bulk_status_change_commits_partial_success() {
        let (fixture, _clock, machine) = harness().await;
        let ok = contact_with(&fixture, ContactStatus::New, 0).await;
        let terminal = contact_with(&fixture, ContactStatus::ClosedLost, 0).await;
        let missing = Uuid::new_v4();

        let summary = machine
            .bulk_change_status(&BulkStatusChange {
                contact_ids: vec![ok, terminal, missing],
                new_status: ContactStatus::Contacted,
                reason: "campaign".to_string(),
                force: false,
                actor_id: None,
            })
            .await
            .expect("bulk");
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.errors.len(), 2);
        assert_eq!(
            fixture.backend.get_contact(ok).await.unwrap().unwrap().status,
            ContactStatus::Contacted
        );

        let none = machine
            .bulk_change_status(&BulkStatusChange {
                contact_ids: vec![terminal, missing],
                new_status: ContactStatus::Contacted,
                reason: "retry".to_string(),
                force: false,
                actor_id: None,
            })
            .await;
        assert!(matches!(none, Err(EngineError::NotFound { .. })));
    }

    #[tokio::test]
    async fn bulk_status_change_moves_a_repeated_contact_once() {
        let (fixture, _clock, machine) = harness().await;
        let contact_id = contact_with(&fixture, ContactStatus::New, 0).await;

        let summary = machine
            .bulk_change_status(&BulkStatusChange {
                contact_ids: vec![contact_id, contact_id],
                new_status: ContactStatus::Contacted,
                reason: "campaign".to_string(),
                force: false,
                actor_id: None,
            })
            .await
            .expect("bulk");
        assert_eq!(summary.succeeded, 1);
        assert!(summary.errors.is_empty());

        let events = machine.lifecycle_events(contact_id, 0).await.unwrap();
        let status_events: Vec<_> = events
            .iter()
            .filter(|e| e.event_type == LifecycleEventType::StatusChange)
            .collect();
        assert_eq!(status_events.len(), 1);
        assert_eq!(status_events[0].previous_value.as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn unscored_contact_gets_synthesised_snapshot() {
        let (fixture, clock, machine) = harness().await;
        let contact_id = contact_with(&fixture, ContactStatus::New, 45).await;
        clock.advance(Duration::days(3));
        let snapshot = machine.get_lifecycle(contact_id).await.expect("snapshot");
        assert!(!snapshot.persisted);
        assert_eq!(snapshot.current_stage, LifecycleStage::Prospect);
        assert_eq!(snapshot.total_lifecycle_days, 3);
        assert_eq!(snapshot.qualification_status, "pending");
        assert!(fixture.backend.get_lifecycle(contact_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn transition_rule_validation() {
        let (_fixture, _clock, machine) = harness().await;
        let same = CreateTransitionRuleParams::new("Loop", ContactStatus::New, ContactStatus::New);
        assert!(matches!(machine.create_rule(&same).await, Err(EngineError::Validation(_))));
        let short =
            CreateTransitionRuleParams::new("no", ContactStatus::New, ContactStatus::Contacted);
        assert!(matches!(machine.create_rule(&short).await, Err(EngineError::Validation(_))));
    }
}
