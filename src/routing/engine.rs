//! Assignment orchestration: rule lookup, gating, selection, commit, audit.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::audit::{self, Decision, Route};
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::db::{
    AssignmentHistoryRecord, AssignmentProgress, AssignmentRuleRecord, AssignmentRuleStore,
    AssignmentStore, AssignmentStrategy, AssignmentType, CommitOutcome, CommittedAssignment,
    ContactAssignmentRecord, ContactDirectory, ContactPriority, ContactRecord,
    CreateAssignmentRuleParams, Database, NewAssignment, OwnerDirectory, RuleStatus,
    UpdateAssignmentRuleParams, UserWorkloadRecord, WindowReservation, WorkloadProfileParams,
    WorkloadStore,
};
use crate::error::{BulkItemError, EngineError};
use crate::routing::strategy::{SelectionContext, ValueThresholds, select_owner};
use crate::routing::workload::{WorkloadSnapshot, WorkloadTracker};
use crate::rules::{
    ConditionValue, ContactFields, RuleTimezone, evaluate_all, local_day_key, validate_conditions,
    validate_rule_name,
};

pub const FALLBACK_REASON: &str = "Fallback assignment - no matching rules";

/// Caller-directed assignment to a specific owner.
#[derive(Debug, Clone)]
pub struct ManualAssignment {
    pub contact_id: Uuid,
    pub owner_id: Uuid,
    pub reason: String,
    /// Defaults to the contact's own priority.
    pub priority: Option<ContactPriority>,
    pub actor_id: Option<Uuid>,
}

#[derive(Debug, Clone)]
pub struct BulkAssignment {
    pub contact_ids: Vec<Uuid>,
    pub owner_id: Uuid,
    pub reason: String,
    pub priority: Option<ContactPriority>,
    pub actor_id: Option<Uuid>,
}

/// Partial-success report of a bulk assignment that committed.
#[derive(Debug, Clone, Serialize)]
pub struct BulkAssignmentSummary {
    pub succeeded: usize,
    pub assignments: Vec<ContactAssignmentRecord>,
    pub errors: Vec<BulkItemError>,
}

/// What a rule would do for a contact right now. Nothing is written.
#[derive(Debug, Clone, Serialize)]
pub struct RuleDryRun {
    pub rule_id: Uuid,
    pub rule_name: String,
    pub rule_active: bool,
    pub conditions_match: bool,
    pub within_business_hours: bool,
    pub within_rate_limits: bool,
    /// First gate that would skip the rule.
    pub gating_error: Option<String>,
    pub selected_owner_id: Option<Uuid>,
    pub selection_error: Option<String>,
    pub would_assign: bool,
}

pub struct AssignmentEngine {
    db: Arc<dyn Database>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    workloads: WorkloadTracker,
    /// Serialises select-then-commit per rule so round-robin cursors and
    /// rate-limit reads never race each other in-process.
    rule_locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

impl AssignmentEngine {
    pub fn new(db: Arc<dyn Database>, clock: Arc<dyn Clock>, config: EngineConfig) -> Self {
        let workloads = WorkloadTracker::new(
            Arc::clone(&db),
            Arc::clone(&clock),
            config.terminal_statuses.clone(),
        );
        Self {
            db,
            clock,
            config,
            workloads,
            rule_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn workloads(&self) -> &WorkloadTracker {
        &self.workloads
    }

    fn rule_lock(&self, rule_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = match self.rule_locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(locks.entry(rule_id).or_default())
    }

    async fn load_contact(&self, contact_id: Uuid) -> Result<ContactRecord, EngineError> {
        self.db
            .get_contact(contact_id)
            .await?
            .ok_or_else(|| EngineError::not_found("contact", contact_id))
    }

    /// Route a contact through the active rules, falling back to the
    /// configured manager roles when no rule produces an owner.
    pub async fn assign_automatically(
        &self,
        contact_id: Uuid,
        overrides: &HashMap<String, ConditionValue>,
    ) -> Result<ContactAssignmentRecord, EngineError> {
        let contact = self.load_contact(contact_id).await?;
        let fields = ContactFields::new(&contact, overrides);
        let rules = self.db.list_active_assignment_rules().await?;

        for rule in &rules {
            let now = self.clock.now();
            if let Some(hours) = &rule.business_hours
                && !hours.contains(now)
            {
                tracing::debug!(rule_id = %rule.id, "Rule outside business hours, skipping");
                continue;
            }
            if !evaluate_all(&rule.conditions, &fields) {
                continue;
            }

            let lock = self.rule_lock(rule.id);
            let _guard = lock.lock().await;

            let reservations = window_reservations(rule, now);
            if !self.under_rate_limits(rule, &reservations).await? {
                tracing::debug!(rule_id = %rule.id, "Rule rate limit reached, skipping");
                self.note_rate_limited(rule, contact_id);
                continue;
            }

            let owner_id = match self.select_for_rule(rule, &contact).await {
                Ok(owner_id) => owner_id,
                Err(e) => {
                    tracing::warn!(
                        rule_id = %rule.id,
                        contact_id = %contact_id,
                        error = %e,
                        "Owner selection failed, trying next rule"
                    );
                    continue;
                }
            };

            let input = NewAssignment {
                contact_id,
                owner_id,
                assigned_by: None,
                rule_id: Some(rule.id),
                assignment_type: AssignmentType::Automatic,
                reason: assignment_reason(rule),
                priority: contact.priority,
                reservations,
            };
            match self.db.commit_assignment(&input, now).await? {
                CommitOutcome::Committed(committed) => {
                    drop(_guard);
                    audit::count_route(Route::Rule);
                    self.after_commit(&committed, Some(&rule.name)).await;
                    return Ok(committed.assignment);
                }
                CommitOutcome::RateLimited { window_key } => {
                    tracing::debug!(
                        rule_id = %rule.id,
                        window_key = %window_key,
                        "Rate-limit reservation lost"
                    );
                    self.note_rate_limited(rule, contact_id);
                }
            }
        }

        self.fallback_assignment(&contact).await
    }

    async fn fallback_assignment(
        &self,
        contact: &ContactRecord,
    ) -> Result<ContactAssignmentRecord, EngineError> {
        let owners = self
            .db
            .list_active_owners_with_roles(&self.config.fallback_roles)
            .await?;
        let pool: Vec<Uuid> = owners.iter().map(|owner| owner.id).collect();
        if pool.is_empty() {
            return Err(EngineError::NoAssigneesAvailable { rule_id: None });
        }

        let workloads = self.load_workloads(&pool).await?;
        let owner_id = select_owner(&SelectionContext {
            rule_id: None,
            strategy: AssignmentStrategy::LoadBased,
            pool: &pool,
            fallback_owner_id: None,
            contact,
            workloads: &workloads,
            last_owner_id: None,
            thresholds: self.thresholds(),
        })?;

        let input = NewAssignment {
            contact_id: contact.id,
            owner_id,
            assigned_by: None,
            rule_id: None,
            assignment_type: AssignmentType::Automatic,
            reason: FALLBACK_REASON.to_string(),
            priority: contact.priority,
            reservations: Vec::new(),
        };
        let committed = self.commit_unlimited(&input).await?;
        audit::count_route(Route::Fallback);
        self.after_commit(&committed, None).await;
        Ok(committed.assignment)
    }

    pub async fn assign_manually(
        &self,
        request: &ManualAssignment,
    ) -> Result<ContactAssignmentRecord, EngineError> {
        self.require_active_owner(request.owner_id).await?;
        let contact = self.load_contact(request.contact_id).await?;

        let input = NewAssignment {
            contact_id: contact.id,
            owner_id: request.owner_id,
            assigned_by: request.actor_id,
            rule_id: None,
            assignment_type: AssignmentType::Manual,
            reason: request.reason.clone(),
            priority: request.priority.unwrap_or(contact.priority),
            reservations: Vec::new(),
        };
        let committed = self.commit_unlimited(&input).await?;
        audit::count_route(Route::Manual);
        self.after_commit(&committed, None).await;
        Ok(committed.assignment)
    }

    /// Assign many contacts to one owner in a single transaction. Items fail
    /// independently; when none succeeds nothing is written and the last
    /// item error is returned.
    pub async fn bulk_assign(
        &self,
        request: &BulkAssignment,
    ) -> Result<BulkAssignmentSummary, EngineError> {
        self.require_active_owner(request.owner_id).await?;

        let mut errors = Vec::new();
        let mut last_error: Option<EngineError> = None;
        let mut inputs = Vec::with_capacity(request.contact_ids.len());
        let mut seen = HashSet::new();
        for contact_id in request.contact_ids.iter().filter(|id| seen.insert(**id)) {
            match self.db.get_contact(*contact_id).await? {
                Some(contact) => inputs.push(NewAssignment {
                    contact_id: contact.id,
                    owner_id: request.owner_id,
                    assigned_by: request.actor_id,
                    rule_id: None,
                    assignment_type: AssignmentType::Manual,
                    reason: request.reason.clone(),
                    priority: request.priority.unwrap_or(contact.priority),
                    reservations: Vec::new(),
                }),
                None => {
                    let err = EngineError::not_found("contact", contact_id);
                    errors.push(BulkItemError {
                        contact_id: *contact_id,
                        message: err.to_string(),
                    });
                    last_error = Some(err);
                }
            }
        }

        let outcome = self.db.commit_assignments(&inputs, self.clock.now()).await?;
        for (contact_id, err) in outcome.failures {
            tracing::warn!(contact_id = %contact_id, error = %err, "Bulk assignment item failed");
            errors.push(BulkItemError {
                contact_id,
                message: err.to_string(),
            });
            last_error = Some(err.into());
        }

        if outcome.committed.is_empty() {
            return Err(last_error.unwrap_or_else(|| {
                EngineError::Validation("bulk assignment needs at least one contact".to_string())
            }));
        }

        let mut touched = vec![request.owner_id];
        for committed in &outcome.committed {
            audit::count_route(Route::Manual);
            if let Some(previous) = committed.previous_owner_id
                && !touched.contains(&previous)
            {
                touched.push(previous);
            }
        }
        for owner_id in touched {
            self.workloads.recompute_best_effort(owner_id).await;
        }

        let assignments: Vec<ContactAssignmentRecord> = outcome
            .committed
            .into_iter()
            .map(|committed| committed.assignment)
            .collect();
        tracing::info!(
            owner_id = %request.owner_id,
            total = request.contact_ids.len(),
            succeeded = assignments.len(),
            failed = errors.len(),
            "Bulk contact assignment completed"
        );
        audit::record(
            Decision::BulkAssigned,
            serde_json::json!({
                "owner_id": request.owner_id,
                "actor_id": request.actor_id,
                "succeeded": assignments.len(),
                "failed": errors.len(),
            }),
        );
        Ok(BulkAssignmentSummary {
            succeeded: assignments.len(),
            assignments,
            errors,
        })
    }

    pub async fn unassign(
        &self,
        contact_id: Uuid,
        actor_id: Option<Uuid>,
        reason: &str,
    ) -> Result<ContactAssignmentRecord, EngineError> {
        let (assignment, _history) = self
            .db
            .unassign_contact(contact_id, actor_id, reason, self.clock.now())
            .await?
            .ok_or_else(|| EngineError::not_found("active assignment", contact_id))?;

        self.workloads.recompute_best_effort(assignment.owner_id).await;
        tracing::info!(
            contact_id = %contact_id,
            owner_id = %assignment.owner_id,
            "Contact unassigned"
        );
        audit::record(
            Decision::ContactUnassigned,
            serde_json::json!({
                "contact_id": contact_id,
                "from_owner_id": assignment.owner_id,
                "actor_id": actor_id,
                "reason": reason,
            }),
        );
        Ok(assignment)
    }

    pub async fn record_progress(
        &self,
        assignment_id: Uuid,
        progress: AssignmentProgress,
    ) -> Result<ContactAssignmentRecord, EngineError> {
        let assignment = self
            .db
            .record_assignment_progress(assignment_id, progress, self.clock.now())
            .await?
            .ok_or_else(|| EngineError::not_found("assignment", assignment_id))?;
        self.workloads.recompute_best_effort(assignment.owner_id).await;
        Ok(assignment)
    }

    pub async fn get_workload(&self, owner_id: Uuid) -> Result<WorkloadSnapshot, EngineError> {
        self.workloads.snapshot(owner_id).await
    }

    pub async fn update_workload_profile(
        &self,
        owner_id: Uuid,
        params: &WorkloadProfileParams,
    ) -> Result<WorkloadSnapshot, EngineError> {
        self.workloads.update_profile(owner_id, params).await
    }

    pub async fn reconcile_workloads(&self) -> Result<usize, EngineError> {
        self.workloads.reconcile().await
    }

    pub async fn active_assignment(
        &self,
        contact_id: Uuid,
    ) -> Result<Option<ContactAssignmentRecord>, EngineError> {
        Ok(self.db.get_active_assignment(contact_id).await?)
    }

    pub async fn assignments_for_contact(
        &self,
        contact_id: Uuid,
    ) -> Result<Vec<ContactAssignmentRecord>, EngineError> {
        Ok(self.db.list_assignments_for_contact(contact_id).await?)
    }

    pub async fn assignment_history(
        &self,
        contact_id: Uuid,
    ) -> Result<Vec<AssignmentHistoryRecord>, EngineError> {
        Ok(self.db.list_assignment_history(contact_id).await?)
    }

    pub async fn test_assignment_rule(
        &self,
        rule_id: Uuid,
        contact_id: Uuid,
        overrides: &HashMap<String, ConditionValue>,
    ) -> Result<RuleDryRun, EngineError> {
        let rule = self
            .db
            .get_assignment_rule(rule_id)
            .await?
            .ok_or_else(|| EngineError::not_found("assignment rule", rule_id))?;
        let contact = self.load_contact(contact_id).await?;
        let now = self.clock.now();

        let fields = ContactFields::new(&contact, overrides);
        let conditions_match = evaluate_all(&rule.conditions, &fields);
        let within_business_hours = rule
            .business_hours
            .as_ref()
            .is_none_or(|hours| hours.contains(now));
        let within_rate_limits = self
            .under_rate_limits(&rule, &window_reservations(&rule, now))
            .await?;
        let (selected_owner_id, selection_error) = match self.select_for_rule(&rule, &contact).await
        {
            Ok(owner_id) => (Some(owner_id), None),
            Err(e) => (None, Some(e.to_string())),
        };
        let rule_active = rule.status == RuleStatus::Active;
        let gating_error = if !within_business_hours {
            Some(EngineError::OutsideBusinessHours { rule_id }.to_string())
        } else if !within_rate_limits {
            Some(EngineError::RateLimited { rule_id }.to_string())
        } else {
            None
        };

        Ok(RuleDryRun {
            rule_id,
            rule_name: rule.name,
            rule_active,
            conditions_match,
            within_business_hours,
            within_rate_limits,
            would_assign: rule_active
                && gating_error.is_none()
                && conditions_match
                && selected_owner_id.is_some(),
            gating_error,
            selected_owner_id,
            selection_error,
        })
    }

    pub async fn create_rule(
        &self,
        params: &CreateAssignmentRuleParams,
    ) -> Result<AssignmentRuleRecord, EngineError> {
        let mut params = params.clone();
        params.name = validate_rule_name(&params.name)?;
        validate_conditions(&params.conditions)?;
        self.validate_owners(&params.assignee_ids, params.fallback_owner_id)
            .await?;
        validate_limits(params.max_assignments_per_hour, params.max_assignments_per_day)?;

        let rule = self
            .db
            .create_assignment_rule(&params, self.clock.now())
            .await?;
        tracing::info!(rule_id = %rule.id, name = %rule.name, "Assignment rule created");
        Ok(rule)
    }

    pub async fn update_rule(
        &self,
        rule_id: Uuid,
        params: &UpdateAssignmentRuleParams,
    ) -> Result<AssignmentRuleRecord, EngineError> {
        let mut params = params.clone();
        if let Some(name) = &params.name {
            params.name = Some(validate_rule_name(name)?);
        }
        if let Some(conditions) = &params.conditions {
            validate_conditions(conditions)?;
        }
        self.validate_owners(
            params.assignee_ids.as_deref().unwrap_or_default(),
            params.fallback_owner_id.flatten(),
        )
        .await?;
        validate_limits(
            params.max_assignments_per_hour.flatten(),
            params.max_assignments_per_day.flatten(),
        )?;

        self.db
            .update_assignment_rule(rule_id, &params, self.clock.now())
            .await?
            .ok_or_else(|| EngineError::not_found("assignment rule", rule_id))
    }

    pub async fn set_rule_status(
        &self,
        rule_id: Uuid,
        status: RuleStatus,
    ) -> Result<(), EngineError> {
        if !self
            .db
            .set_assignment_rule_status(rule_id, status, self.clock.now())
            .await?
        {
            return Err(EngineError::not_found("assignment rule", rule_id));
        }
        tracing::info!(
            rule_id = %rule_id,
            status = status.as_str(),
            "Assignment rule status changed"
        );
        Ok(())
    }

    pub async fn delete_rule(&self, rule_id: Uuid) -> Result<(), EngineError> {
        if !self.db.delete_assignment_rule(rule_id).await? {
            return Err(EngineError::not_found("assignment rule", rule_id));
        }
        Ok(())
    }

    pub async fn get_rule(&self, rule_id: Uuid) -> Result<AssignmentRuleRecord, EngineError> {
        self.db
            .get_assignment_rule(rule_id)
            .await?
            .ok_or_else(|| EngineError::not_found("assignment rule", rule_id))
    }

    pub async fn list_rules(&self) -> Result<Vec<AssignmentRuleRecord>, EngineError> {
        Ok(self.db.list_assignment_rules().await?)
    }

    fn thresholds(&self) -> ValueThresholds {
        ValueThresholds {
            min_value: self.config.value_based_min_value,
            min_score: self.config.value_based_min_score,
        }
    }

    async fn load_workloads(
        &self,
        owners: &[Uuid],
    ) -> Result<HashMap<Uuid, UserWorkloadRecord>, EngineError> {
        let mut workloads = HashMap::with_capacity(owners.len());
        for owner_id in owners {
            if let Some(workload) = self.db.get_workload(*owner_id).await? {
                workloads.insert(*owner_id, workload);
            }
        }
        Ok(workloads)
    }

    async fn select_for_rule(
        &self,
        rule: &AssignmentRuleRecord,
        contact: &ContactRecord,
    ) -> Result<Uuid, EngineError> {
        let last_owner_id = match rule.strategy {
            AssignmentStrategy::RoundRobin | AssignmentStrategy::Custom => self
                .db
                .last_assignment_for_rule(rule.id)
                .await?
                .map(|assignment| assignment.owner_id),
            _ => None,
        };
        let workloads = self.load_workloads(&rule.assignee_ids).await?;
        select_owner(&SelectionContext {
            rule_id: Some(rule.id),
            strategy: rule.strategy,
            pool: &rule.assignee_ids,
            fallback_owner_id: rule.fallback_owner_id,
            contact,
            workloads: &workloads,
            last_owner_id,
            thresholds: self.thresholds(),
        })
    }

    async fn under_rate_limits(
        &self,
        rule: &AssignmentRuleRecord,
        reservations: &[WindowReservation],
    ) -> Result<bool, EngineError> {
        if reservations.is_empty() {
            return Ok(true);
        }
        let keys: Vec<String> = reservations.iter().map(|r| r.window_key.clone()).collect();
        let counts = self.db.rule_window_counts(rule.id, &keys).await?;
        Ok(reservations
            .iter()
            .zip(counts)
            .all(|(reservation, count)| count < reservation.limit))
    }

    fn note_rate_limited(&self, rule: &AssignmentRuleRecord, contact_id: Uuid) {
        audit::record(
            Decision::RuleRateLimited,
            serde_json::json!({ "rule_id": rule.id, "contact_id": contact_id }),
        );
    }

    async fn require_active_owner(&self, owner_id: Uuid) -> Result<(), EngineError> {
        match self.db.get_owner(owner_id).await? {
            Some(owner) if owner.is_active => Ok(()),
            Some(_) => Err(EngineError::Validation(format!(
                "owner {owner_id} is inactive"
            ))),
            None => Err(EngineError::not_found("owner", owner_id)),
        }
    }

    async fn validate_owners(
        &self,
        pool: &[Uuid],
        fallback_owner_id: Option<Uuid>,
    ) -> Result<(), EngineError> {
        for owner_id in pool.iter().chain(fallback_owner_id.iter()) {
            if self.db.get_owner(*owner_id).await?.is_none() {
                return Err(EngineError::Validation(format!(
                    "owner {owner_id} does not exist"
                )));
            }
        }
        Ok(())
    }

    /// Commit an assignment that carries no rate-limit reservations.
    async fn commit_unlimited(
        &self,
        input: &NewAssignment,
    ) -> Result<CommittedAssignment, EngineError> {
        match self.db.commit_assignment(input, self.clock.now()).await? {
            CommitOutcome::Committed(committed) => Ok(committed),
            CommitOutcome::RateLimited { window_key } => Err(EngineError::Validation(format!(
                "unexpected rate-limit window {window_key} on an unlimited assignment"
            ))),
        }
    }

    async fn after_commit(&self, committed: &CommittedAssignment, rule_name: Option<&str>) {
        let assignment = &committed.assignment;
        self.workloads.recompute_best_effort(assignment.owner_id).await;
        if let Some(previous) = committed.previous_owner_id
            && previous != assignment.owner_id
        {
            self.workloads.recompute_best_effort(previous).await;
        }

        tracing::info!(
            contact_id = %assignment.contact_id,
            owner_id = %assignment.owner_id,
            rule_id = ?assignment.rule_id,
            assignment_type = assignment.assignment_type.as_str(),
            "Contact assigned"
        );
        audit::record(
            Decision::ContactAssigned,
            serde_json::json!({
                "contact_id": assignment.contact_id,
                "owner_id": assignment.owner_id,
                "from_owner_id": committed.previous_owner_id,
                "rule_id": assignment.rule_id,
                "rule_name": rule_name,
                "assignment_type": assignment.assignment_type.as_str(),
                "change_type": committed.history.change_type.as_str(),
                "reason": assignment.reason,
            }),
        );
    }
}

/// Rate-limit buckets the rule reserves for an assignment made at `now`.
pub fn window_reservations(
    rule: &AssignmentRuleRecord,
    now: DateTime<Utc>,
) -> Vec<WindowReservation> {
    let mut out = Vec::new();
    if let Some(limit) = rule.max_assignments_per_hour {
        out.push(WindowReservation {
            window_key: format!("hour:{}", now.format("%Y-%m-%dT%H")),
            limit,
        });
    }
    if let Some(limit) = rule.max_assignments_per_day {
        let timezone = rule
            .business_hours
            .as_ref()
            .map(|hours| hours.timezone.clone())
            .unwrap_or_else(RuleTimezone::utc);
        out.push(WindowReservation {
            window_key: format!("day:{}", local_day_key(now, &timezone)),
            limit,
        });
    }
    out
}

pub fn assignment_reason(rule: &AssignmentRuleRecord) -> String {
    match rule.strategy {
        AssignmentStrategy::RoundRobin => {
            format!("Round-robin assignment via rule: {}", rule.name)
        }
        AssignmentStrategy::LoadBased => format!("Load-based assignment via rule: {}", rule.name),
        AssignmentStrategy::SkillBased => format!("Skill-based assignment via rule: {}", rule.name),
        AssignmentStrategy::GeographyBased => {
            format!("Geography-based assignment via rule: {}", rule.name)
        }
        AssignmentStrategy::ValueBased => format!("Value-based assignment via rule: {}", rule.name),
        AssignmentStrategy::Custom => format!("Automatic assignment via rule: {}", rule.name),
    }
}

fn validate_limits(per_hour: Option<u32>, per_day: Option<u32>) -> Result<(), EngineError> {
    if per_hour == Some(0) || per_day == Some(0) {
        return Err(EngineError::Validation(
            "rate limits must be positive when set".to_string(),
        ));
    }
    Ok(())
}
