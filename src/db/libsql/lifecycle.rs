use chrono::{DateTime, Utc};
use libsql::params;
use uuid::Uuid;

use crate::db::{
    ContactLifecycleRecord, ContactStatus, CreateScoringRuleParams, CreateTransitionRuleParams,
    LeadScoringRuleRecord, LifecycleEventRecord, LifecycleEventType, LifecycleStage,
    LifecycleStore, NewLifecycleEvent, ScoringCategory, ScoringRuleStore, StatusChangeCommit,
    StatusTransitionRuleRecord, TransitionRuleStore, TriggerType, UpdateScoringRuleParams,
    UpdateTransitionRuleParams,
};
use crate::error::DatabaseError;

use super::directory::parse_status;
use super::{
    LibSqlBackend, fmt_ts, from_json_text, get_bool, get_i32, get_i64, get_opt_i64, get_opt_text,
    get_text, opt_i64, opt_text, opt_text_owned, opt_ts, opt_uuid, parse_dt, parse_dt_opt,
    parse_opt_uuid, parse_uuid, to_json_text,
};

const SCORING_RULE_COLUMNS: &str = "id, name, description, category, base_score, max_score, \
     criteria, applicable_when, is_active, priority, times_applied, last_applied_at, created_at, \
     updated_at";

const TRANSITION_RULE_COLUMNS: &str = "id, name, description, from_status, to_status, \
     transition_type, conditions, required_score, days_in_status, actions, notify_owner_ids, \
     is_active, priority, times_triggered, last_triggered_at, created_at, updated_at";

const LIFECYCLE_COLUMNS: &str = "id, contact_id, current_stage, current_status, current_score, \
     demographic_score, behavioral_score, engagement_score, firmographic_score, score_history, \
     scoring_factors, stage_velocity, stage_entered_at, status_entered_at, last_scored_at, \
     first_engagement_at, qualification_at, opportunity_at, conversion_at, created_at, updated_at";

const EVENT_COLUMNS: &str = "id, contact_id, lifecycle_id, event_type, event_name, description, \
     previous_value, new_value, change_amount, trigger_type, trigger_source, trigger_data, \
     triggered_by, created_at";

fn parse_category(raw: &str) -> Result<ScoringCategory, DatabaseError> {
    ScoringCategory::from_db_value(raw)
        .ok_or_else(|| DatabaseError::Serialization(format!("invalid scoring category '{raw}'")))
}

fn parse_trigger_type(raw: &str) -> Result<TriggerType, DatabaseError> {
    TriggerType::from_db_value(raw)
        .ok_or_else(|| DatabaseError::Serialization(format!("invalid trigger type '{raw}'")))
}

fn parse_json_value(raw: &str, field: &str) -> Result<serde_json::Value, DatabaseError> {
    if raw.trim().is_empty() {
        return Ok(serde_json::Value::Null);
    }
    serde_json::from_str(raw)
        .map_err(|e| DatabaseError::Serialization(format!("invalid {field} json: {e}")))
}

fn row_to_scoring_rule(row: &libsql::Row) -> Result<LeadScoringRuleRecord, DatabaseError> {
    Ok(LeadScoringRuleRecord {
        id: parse_uuid(&get_text(row, 0), "scoring_rule.id")?,
        name: get_text(row, 1),
        description: get_opt_text(row, 2),
        category: parse_category(&get_text(row, 3))?,
        base_score: get_i32(row, 4)?,
        max_score: get_i32(row, 5)?,
        criteria: from_json_text(&get_text(row, 6), "scoring_rule.criteria")?,
        applicable_when: from_json_text(&get_text(row, 7), "scoring_rule.applicable_when")?,
        is_active: get_bool(row, 8),
        priority: get_i32(row, 9)?,
        times_applied: get_i64(row, 10),
        last_applied_at: parse_dt_opt(get_opt_text(row, 11))?,
        created_at: parse_dt(&get_text(row, 12), "scoring_rule.created_at")?,
        updated_at: parse_dt(&get_text(row, 13), "scoring_rule.updated_at")?,
    })
}

fn row_to_transition_rule(row: &libsql::Row) -> Result<StatusTransitionRuleRecord, DatabaseError> {
    let notify: Vec<String> = from_json_text(&get_text(row, 10), "transition_rule.notify")?;
    Ok(StatusTransitionRuleRecord {
        id: parse_uuid(&get_text(row, 0), "transition_rule.id")?,
        name: get_text(row, 1),
        description: get_opt_text(row, 2),
        from_status: parse_status(&get_text(row, 3))?,
        to_status: parse_status(&get_text(row, 4))?,
        transition_type: parse_trigger_type(&get_text(row, 5))?,
        conditions: from_json_text(&get_text(row, 6), "transition_rule.conditions")?,
        required_score: get_i32(row, 7)?,
        days_in_status: get_i32(row, 8)?,
        actions: parse_json_value(&get_text(row, 9), "transition_rule.actions")?,
        notify_owner_ids: notify
            .iter()
            .map(|id| parse_uuid(id, "transition_rule.notify_owner_ids"))
            .collect::<Result<_, _>>()?,
        is_active: get_bool(row, 11),
        priority: get_i32(row, 12)?,
        times_triggered: get_i64(row, 13),
        last_triggered_at: parse_dt_opt(get_opt_text(row, 14))?,
        created_at: parse_dt(&get_text(row, 15), "transition_rule.created_at")?,
        updated_at: parse_dt(&get_text(row, 16), "transition_rule.updated_at")?,
    })
}

fn row_to_lifecycle(row: &libsql::Row) -> Result<ContactLifecycleRecord, DatabaseError> {
    let stage_raw = get_text(row, 2);
    Ok(ContactLifecycleRecord {
        id: parse_uuid(&get_text(row, 0), "lifecycle.id")?,
        contact_id: parse_uuid(&get_text(row, 1), "lifecycle.contact_id")?,
        current_stage: LifecycleStage::from_db_value(&stage_raw).ok_or_else(|| {
            DatabaseError::Serialization(format!("invalid lifecycle stage '{stage_raw}'"))
        })?,
        current_status: parse_status(&get_text(row, 3))?,
        current_score: get_i32(row, 4)?,
        demographic_score: get_i32(row, 5)?,
        behavioral_score: get_i32(row, 6)?,
        engagement_score: get_i32(row, 7)?,
        firmographic_score: get_i32(row, 8)?,
        score_history: from_json_text(&get_text(row, 9), "lifecycle.score_history")?,
        scoring_factors: from_json_text(&get_text(row, 10), "lifecycle.scoring_factors")?,
        stage_velocity: from_json_text(&get_text(row, 11), "lifecycle.stage_velocity")?,
        stage_entered_at: parse_dt(&get_text(row, 12), "lifecycle.stage_entered_at")?,
        status_entered_at: parse_dt(&get_text(row, 13), "lifecycle.status_entered_at")?,
        last_scored_at: parse_dt_opt(get_opt_text(row, 14))?,
        first_engagement_at: parse_dt_opt(get_opt_text(row, 15))?,
        qualification_at: parse_dt_opt(get_opt_text(row, 16))?,
        opportunity_at: parse_dt_opt(get_opt_text(row, 17))?,
        conversion_at: parse_dt_opt(get_opt_text(row, 18))?,
        created_at: parse_dt(&get_text(row, 19), "lifecycle.created_at")?,
        updated_at: parse_dt(&get_text(row, 20), "lifecycle.updated_at")?,
    })
}

fn row_to_event(row: &libsql::Row) -> Result<LifecycleEventRecord, DatabaseError> {
    let event_type_raw = get_text(row, 3);
    let change_amount = get_opt_i64(row, 8)
        .map(|value| {
            i32::try_from(value)
                .map_err(|_| DatabaseError::Serialization(format!("invalid change amount {value}")))
        })
        .transpose()?;
    Ok(LifecycleEventRecord {
        id: parse_uuid(&get_text(row, 0), "event.id")?,
        contact_id: parse_uuid(&get_text(row, 1), "event.contact_id")?,
        lifecycle_id: parse_uuid(&get_text(row, 2), "event.lifecycle_id")?,
        event_type: LifecycleEventType::from_db_value(&event_type_raw).ok_or_else(|| {
            DatabaseError::Serialization(format!("invalid event type '{event_type_raw}'"))
        })?,
        event_name: get_text(row, 4),
        description: get_text(row, 5),
        previous_value: get_opt_text(row, 6),
        new_value: get_opt_text(row, 7),
        change_amount,
        trigger_type: parse_trigger_type(&get_text(row, 9))?,
        trigger_source: get_text(row, 10),
        trigger_data: parse_json_value(&get_text(row, 11), "event.trigger_data")?,
        triggered_by: parse_opt_uuid(get_opt_text(row, 12), "event.triggered_by")?,
        created_at: parse_dt(&get_text(row, 13), "event.created_at")?,
    })
}

async fn upsert_lifecycle(
    conn: &libsql::Connection,
    lifecycle: &ContactLifecycleRecord,
    now: DateTime<Utc>,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO contact_lifecycles \
         (id, contact_id, current_stage, current_status, current_score, demographic_score, \
          behavioral_score, engagement_score, firmographic_score, score_history, scoring_factors, \
          stage_velocity, stage_entered_at, status_entered_at, last_scored_at, \
          first_engagement_at, qualification_at, opportunity_at, conversion_at, created_at, \
          updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, \
                 ?19, ?20, ?21) \
         ON CONFLICT(contact_id) DO UPDATE SET \
           current_stage = excluded.current_stage, \
           current_status = excluded.current_status, \
           current_score = excluded.current_score, \
           demographic_score = excluded.demographic_score, \
           behavioral_score = excluded.behavioral_score, \
           engagement_score = excluded.engagement_score, \
           firmographic_score = excluded.firmographic_score, \
           score_history = excluded.score_history, \
           scoring_factors = excluded.scoring_factors, \
           stage_velocity = excluded.stage_velocity, \
           stage_entered_at = excluded.stage_entered_at, \
           status_entered_at = excluded.status_entered_at, \
           last_scored_at = excluded.last_scored_at, \
           first_engagement_at = excluded.first_engagement_at, \
           qualification_at = excluded.qualification_at, \
           opportunity_at = excluded.opportunity_at, \
           conversion_at = excluded.conversion_at, \
           updated_at = excluded.updated_at",
        params![
            lifecycle.id.to_string(),
            lifecycle.contact_id.to_string(),
            lifecycle.current_stage.as_str(),
            lifecycle.current_status.as_str(),
            i64::from(lifecycle.current_score),
            i64::from(lifecycle.demographic_score),
            i64::from(lifecycle.behavioral_score),
            i64::from(lifecycle.engagement_score),
            i64::from(lifecycle.firmographic_score),
            to_json_text(&lifecycle.score_history)?,
            to_json_text(&lifecycle.scoring_factors)?,
            to_json_text(&lifecycle.stage_velocity)?,
            fmt_ts(&lifecycle.stage_entered_at),
            fmt_ts(&lifecycle.status_entered_at),
            opt_ts(lifecycle.last_scored_at),
            opt_ts(lifecycle.first_engagement_at),
            opt_ts(lifecycle.qualification_at),
            opt_ts(lifecycle.opportunity_at),
            opt_ts(lifecycle.conversion_at),
            fmt_ts(&lifecycle.created_at),
            fmt_ts(&now),
        ],
    )
    .await?;
    Ok(())
}

async fn insert_event(
    conn: &libsql::Connection,
    event: &NewLifecycleEvent,
) -> Result<LifecycleEventRecord, DatabaseError> {
    let id = Uuid::new_v4();
    conn.execute(
        "INSERT INTO lifecycle_events \
         (id, contact_id, lifecycle_id, event_type, event_name, description, previous_value, \
          new_value, change_amount, trigger_type, trigger_source, trigger_data, triggered_by, \
          created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            id.to_string(),
            event.contact_id.to_string(),
            event.lifecycle_id.to_string(),
            event.event_type.as_str(),
            event.event_name.as_str(),
            event.description.as_str(),
            opt_text(event.previous_value.as_deref()),
            opt_text(event.new_value.as_deref()),
            opt_i64(event.change_amount.map(i64::from)),
            event.trigger_type.as_str(),
            event.trigger_source.as_str(),
            to_json_text(&event.trigger_data)?,
            opt_uuid(event.triggered_by),
            fmt_ts(&event.created_at),
        ],
    )
    .await?;
    Ok(LifecycleEventRecord {
        id,
        contact_id: event.contact_id,
        lifecycle_id: event.lifecycle_id,
        event_type: event.event_type,
        event_name: event.event_name.clone(),
        description: event.description.clone(),
        previous_value: event.previous_value.clone(),
        new_value: event.new_value.clone(),
        change_amount: event.change_amount,
        trigger_type: event.trigger_type,
        trigger_source: event.trigger_source.clone(),
        trigger_data: event.trigger_data.clone(),
        triggered_by: event.triggered_by,
        created_at: event.created_at,
    })
}

/// All writes of one status change. Callers own the surrounding transaction.
async fn write_status_change(
    conn: &libsql::Connection,
    change: &StatusChangeCommit,
    now: DateTime<Utc>,
) -> Result<(), DatabaseError> {
    let lifecycle = &change.lifecycle;
    let ts = fmt_ts(&now);
    let updated = conn
        .execute(
            "UPDATE contacts SET status = ?2, updated_at = ?3 WHERE id = ?1",
            params![
                lifecycle.contact_id.to_string(),
                lifecycle.current_status.as_str(),
                ts.as_str(),
            ],
        )
        .await?;
    if updated == 0 {
        return Err(DatabaseError::NotFound {
            entity: "contact".to_string(),
            id: lifecycle.contact_id.to_string(),
        });
    }
    upsert_lifecycle(conn, lifecycle, now).await?;
    for event in &change.events {
        insert_event(conn, event).await?;
    }
    if let Some(rule_id) = change.transition_rule_id {
        conn.execute(
            "UPDATE status_transition_rules SET \
               times_triggered = times_triggered + 1, \
               last_triggered_at = ?2 \
             WHERE id = ?1",
            params![rule_id.to_string(), ts.as_str()],
        )
        .await?;
    }
    Ok(())
}

#[async_trait::async_trait]
impl ScoringRuleStore for LibSqlBackend {
    async fn create_scoring_rule(
        &self,
        input: &CreateScoringRuleParams,
        now: DateTime<Utc>,
    ) -> Result<LeadScoringRuleRecord, DatabaseError> {
        let conn = self.connect().await?;
        let id = Uuid::new_v4();
        conn.execute(
            "INSERT INTO lead_scoring_rules \
             (id, name, description, category, base_score, max_score, criteria, applicable_when, \
              is_active, priority, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)",
            params![
                id.to_string(),
                input.name.trim(),
                opt_text(input.description.as_deref()),
                input.category.as_str(),
                i64::from(input.base_score),
                i64::from(input.max_score),
                to_json_text(&input.criteria)?,
                to_json_text(&input.applicable_when)?,
                i64::from(input.is_active),
                i64::from(input.priority),
                fmt_ts(&now),
            ],
        )
        .await?;
        self.get_scoring_rule(id)
            .await?
            .ok_or_else(|| DatabaseError::Query("failed to load created scoring rule".to_string()))
    }

    async fn get_scoring_rule(
        &self,
        rule_id: Uuid,
    ) -> Result<Option<LeadScoringRuleRecord>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {SCORING_RULE_COLUMNS} FROM lead_scoring_rules WHERE id = ?1 LIMIT 1"
                ),
                params![rule_id.to_string()],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_scoring_rule(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_scoring_rules(&self) -> Result<Vec<LeadScoringRuleRecord>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {SCORING_RULE_COLUMNS} FROM lead_scoring_rules \
                     ORDER BY priority DESC, created_at ASC, rowid ASC"
                ),
                (),
            )
            .await?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(row_to_scoring_rule(&row)?);
        }
        Ok(out)
    }

    async fn list_active_scoring_rules(
        &self,
    ) -> Result<Vec<LeadScoringRuleRecord>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {SCORING_RULE_COLUMNS} FROM lead_scoring_rules WHERE is_active = 1 \
                     ORDER BY priority DESC, created_at ASC, rowid ASC"
                ),
                (),
            )
            .await?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(row_to_scoring_rule(&row)?);
        }
        Ok(out)
    }

    async fn update_scoring_rule(
        &self,
        rule_id: Uuid,
        input: &UpdateScoringRuleParams,
        now: DateTime<Utc>,
    ) -> Result<Option<LeadScoringRuleRecord>, DatabaseError> {
        let Some(existing) = self.get_scoring_rule(rule_id).await? else {
            return Ok(None);
        };
        let name = input.name.clone().unwrap_or(existing.name);
        let description = input.description.clone().unwrap_or(existing.description);
        let category = input.category.unwrap_or(existing.category);
        let base_score = input.base_score.unwrap_or(existing.base_score);
        let max_score = input.max_score.unwrap_or(existing.max_score);
        let criteria = input.criteria.clone().unwrap_or(existing.criteria);
        let applicable_when = input
            .applicable_when
            .clone()
            .unwrap_or(existing.applicable_when);
        let is_active = input.is_active.unwrap_or(existing.is_active);
        let priority = input.priority.unwrap_or(existing.priority);

        let conn = self.connect().await?;
        conn.execute(
            "UPDATE lead_scoring_rules SET \
               name = ?2, description = ?3, category = ?4, base_score = ?5, max_score = ?6, \
               criteria = ?7, applicable_when = ?8, is_active = ?9, priority = ?10, \
               updated_at = ?11 \
             WHERE id = ?1",
            params![
                rule_id.to_string(),
                name.trim(),
                opt_text_owned(description),
                category.as_str(),
                i64::from(base_score),
                i64::from(max_score),
                to_json_text(&criteria)?,
                to_json_text(&applicable_when)?,
                i64::from(is_active),
                i64::from(priority),
                fmt_ts(&now),
            ],
        )
        .await?;
        self.get_scoring_rule(rule_id).await
    }

    async fn delete_scoring_rule(&self, rule_id: Uuid) -> Result<bool, DatabaseError> {
        let conn = self.connect().await?;
        let deleted = conn
            .execute(
                "DELETE FROM lead_scoring_rules WHERE id = ?1",
                params![rule_id.to_string()],
            )
            .await?;
        Ok(deleted > 0)
    }

    async fn record_scoring_rules_applied(
        &self,
        rule_ids: &[Uuid],
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        if rule_ids.is_empty() {
            return Ok(());
        }
        let conn = self.connect().await?;
        let ts = fmt_ts(&now);
        for rule_id in rule_ids {
            conn.execute(
                "UPDATE lead_scoring_rules SET \
                   times_applied = times_applied + 1, \
                   last_applied_at = ?2 \
                 WHERE id = ?1",
                params![rule_id.to_string(), ts.as_str()],
            )
            .await?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl TransitionRuleStore for LibSqlBackend {
    async fn create_transition_rule(
        &self,
        input: &CreateTransitionRuleParams,
        now: DateTime<Utc>,
    ) -> Result<StatusTransitionRuleRecord, DatabaseError> {
        let conn = self.connect().await?;
        let id = Uuid::new_v4();
        let notify = input
            .notify_owner_ids
            .iter()
            .map(Uuid::to_string)
            .collect::<Vec<_>>();
        conn.execute(
            "INSERT INTO status_transition_rules \
             (id, name, description, from_status, to_status, transition_type, conditions, \
              required_score, days_in_status, actions, notify_owner_ids, is_active, priority, \
              created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?14)",
            params![
                id.to_string(),
                input.name.trim(),
                opt_text(input.description.as_deref()),
                input.from_status.as_str(),
                input.to_status.as_str(),
                input.transition_type.as_str(),
                to_json_text(&input.conditions)?,
                i64::from(input.required_score),
                i64::from(input.days_in_status),
                to_json_text(&input.actions)?,
                to_json_text(&notify)?,
                i64::from(input.is_active),
                i64::from(input.priority),
                fmt_ts(&now),
            ],
        )
        .await?;
        self.get_transition_rule(id).await?.ok_or_else(|| {
            DatabaseError::Query("failed to load created transition rule".to_string())
        })
    }

    async fn get_transition_rule(
        &self,
        rule_id: Uuid,
    ) -> Result<Option<StatusTransitionRuleRecord>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {TRANSITION_RULE_COLUMNS} FROM status_transition_rules \
                     WHERE id = ?1 LIMIT 1"
                ),
                params![rule_id.to_string()],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_transition_rule(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_transition_rules(
        &self,
    ) -> Result<Vec<StatusTransitionRuleRecord>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {TRANSITION_RULE_COLUMNS} FROM status_transition_rules \
                     ORDER BY priority DESC, created_at ASC, rowid ASC"
                ),
                (),
            )
            .await?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(row_to_transition_rule(&row)?);
        }
        Ok(out)
    }

    async fn list_active_transition_rules_from(
        &self,
        from: ContactStatus,
    ) -> Result<Vec<StatusTransitionRuleRecord>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {TRANSITION_RULE_COLUMNS} FROM status_transition_rules \
                     WHERE is_active = 1 AND from_status = ?1 \
                     ORDER BY priority DESC, created_at ASC, rowid ASC"
                ),
                params![from.as_str()],
            )
            .await?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(row_to_transition_rule(&row)?);
        }
        Ok(out)
    }

    async fn update_transition_rule(
        &self,
        rule_id: Uuid,
        input: &UpdateTransitionRuleParams,
        now: DateTime<Utc>,
    ) -> Result<Option<StatusTransitionRuleRecord>, DatabaseError> {
        let Some(existing) = self.get_transition_rule(rule_id).await? else {
            return Ok(None);
        };
        let name = input.name.clone().unwrap_or(existing.name);
        let description = input.description.clone().unwrap_or(existing.description);
        let from_status = input.from_status.unwrap_or(existing.from_status);
        let to_status = input.to_status.unwrap_or(existing.to_status);
        let transition_type = input.transition_type.unwrap_or(existing.transition_type);
        let conditions = input.conditions.clone().unwrap_or(existing.conditions);
        let required_score = input.required_score.unwrap_or(existing.required_score);
        let days_in_status = input.days_in_status.unwrap_or(existing.days_in_status);
        let actions = input.actions.clone().unwrap_or(existing.actions);
        let notify = input
            .notify_owner_ids
            .clone()
            .unwrap_or(existing.notify_owner_ids)
            .iter()
            .map(Uuid::to_string)
            .collect::<Vec<_>>();
        let is_active = input.is_active.unwrap_or(existing.is_active);
        let priority = input.priority.unwrap_or(existing.priority);

        let conn = self.connect().await?;
        conn.execute(
            "UPDATE status_transition_rules SET \
               name = ?2, description = ?3, from_status = ?4, to_status = ?5, \
               transition_type = ?6, conditions = ?7, required_score = ?8, days_in_status = ?9, \
               actions = ?10, notify_owner_ids = ?11, is_active = ?12, priority = ?13, \
               updated_at = ?14 \
             WHERE id = ?1",
            params![
                rule_id.to_string(),
                name.trim(),
                opt_text_owned(description),
                from_status.as_str(),
                to_status.as_str(),
                transition_type.as_str(),
                to_json_text(&conditions)?,
                i64::from(required_score),
                i64::from(days_in_status),
                to_json_text(&actions)?,
                to_json_text(&notify)?,
                i64::from(is_active),
                i64::from(priority),
                fmt_ts(&now),
            ],
        )
        .await?;
        self.get_transition_rule(rule_id).await
    }

    async fn delete_transition_rule(&self, rule_id: Uuid) -> Result<bool, DatabaseError> {
        let conn = self.connect().await?;
        let deleted = conn
            .execute(
                "DELETE FROM status_transition_rules WHERE id = ?1",
                params![rule_id.to_string()],
            )
            .await?;
        Ok(deleted > 0)
    }
}

#[async_trait::async_trait]
impl LifecycleStore for LibSqlBackend {
    async fn get_lifecycle(
        &self,
        contact_id: Uuid,
    ) -> Result<Option<ContactLifecycleRecord>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {LIFECYCLE_COLUMNS} FROM contact_lifecycles \
                     WHERE contact_id = ?1 LIMIT 1"
                ),
                params![contact_id.to_string()],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_lifecycle(&row)?)),
            None => Ok(None),
        }
    }

    async fn save_score(
        &self,
        lifecycle: &ContactLifecycleRecord,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let conn = self.connect().await?;
        conn.execute("BEGIN IMMEDIATE", ()).await?;
        let result = async {
            upsert_lifecycle(&conn, lifecycle, now).await?;
            conn.execute(
                "UPDATE contacts SET lead_score = ?2, updated_at = ?3 WHERE id = ?1",
                params![
                    lifecycle.contact_id.to_string(),
                    i64::from(lifecycle.current_score),
                    fmt_ts(&now),
                ],
            )
            .await?;
            Ok::<_, DatabaseError>(())
        }
        .await;

        match result {
            Ok(()) => {
                conn.execute("COMMIT", ()).await?;
                Ok(())
            }
            Err(err) => {
                let _ = conn.execute("ROLLBACK", ()).await;
                Err(err)
            }
        }
    }

    async fn commit_status_change(
        &self,
        change: &StatusChangeCommit,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let conn = self.connect().await?;
        conn.execute("BEGIN IMMEDIATE", ()).await?;
        match write_status_change(&conn, change, now).await {
            Ok(()) => {
                conn.execute("COMMIT", ()).await?;
                Ok(())
            }
            Err(err) => {
                let _ = conn.execute("ROLLBACK", ()).await;
                Err(err)
            }
        }
    }

    async fn commit_status_changes(
        &self,
        changes: &[StatusChangeCommit],
        now: DateTime<Utc>,
    ) -> Result<Vec<(Uuid, DatabaseError)>, DatabaseError> {
        if changes.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.connect().await?;
        conn.execute("BEGIN IMMEDIATE", ()).await?;
        let mut failures = Vec::new();
        let mut succeeded = 0_usize;
        for change in changes {
            if let Err(err) = conn.execute("SAVEPOINT bulk_status", ()).await {
                let _ = conn.execute("ROLLBACK", ()).await;
                return Err(err.into());
            }
            match write_status_change(&conn, change, now).await {
                Ok(()) => {
                    conn.execute("RELEASE SAVEPOINT bulk_status", ()).await?;
                    succeeded += 1;
                }
                Err(err) => {
                    let _ = conn.execute("ROLLBACK TO SAVEPOINT bulk_status", ()).await;
                    let _ = conn.execute("RELEASE SAVEPOINT bulk_status", ()).await;
                    failures.push((change.lifecycle.contact_id, err));
                }
            }
        }

        if succeeded == 0 {
            let _ = conn.execute("ROLLBACK", ()).await;
        } else {
            conn.execute("COMMIT", ()).await?;
        }
        Ok(failures)
    }

    async fn append_lifecycle_event(
        &self,
        event: &NewLifecycleEvent,
    ) -> Result<LifecycleEventRecord, DatabaseError> {
        let conn = self.connect().await?;
        insert_event(&conn, event).await
    }

    async fn list_lifecycle_events(
        &self,
        contact_id: Uuid,
        limit: usize,
    ) -> Result<Vec<LifecycleEventRecord>, DatabaseError> {
        // SQLite treats a negative LIMIT as unbounded.
        let limit = if limit == 0 {
            -1
        } else {
            i64::try_from(limit).unwrap_or(i64::MAX)
        };
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {EVENT_COLUMNS} FROM lifecycle_events WHERE contact_id = ?1 \
                     ORDER BY created_at DESC, rowid DESC LIMIT ?2"
                ),
                params![contact_id.to_string(), limit],
            )
            .await?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(row_to_event(&row)?);
        }
        Ok(out)
    }

    async fn list_lifecycles_in_status(
        &self,
        status: ContactStatus,
    ) -> Result<Vec<ContactLifecycleRecord>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {LIFECYCLE_COLUMNS} FROM contact_lifecycles WHERE current_status = ?1 \
                     ORDER BY created_at ASC, rowid ASC"
                ),
                params![status.as_str()],
            )
            .await?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(row_to_lifecycle(&row)?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::{DateTime, Duration, TimeZone, Utc};
    use uuid::Uuid;

    use crate::db::libsql::test_support::setup_backend;
    use crate::db::{
        ContactDirectory, ContactLifecycleRecord, ContactStatus, CreateScoringRuleParams,
        CreateTransitionRuleParams, LifecycleEventType, LifecycleStage, LifecycleStore,
        NewLifecycleEvent, ScoreSnapshot, ScoringCategory, ScoringFactor, ScoringRuleStore,
        StatusChangeCommit, TransitionRuleStore, TriggerType, UpdateScoringRuleParams,
        UpsertContactParams,
    };
    use crate::rules::{Condition, Operator, ScoringCriterion};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap()
    }

    fn event(
        lifecycle: &ContactLifecycleRecord,
        name: &str,
        at: DateTime<Utc>,
    ) -> NewLifecycleEvent {
        NewLifecycleEvent {
            contact_id: lifecycle.contact_id,
            lifecycle_id: lifecycle.id,
            event_type: LifecycleEventType::StatusChange,
            event_name: name.to_string(),
            description: String::new(),
            previous_value: Some("new".to_string()),
            new_value: Some("contacted".to_string()),
            change_amount: None,
            trigger_type: TriggerType::Manual,
            trigger_source: "user_action".to_string(),
            trigger_data: serde_json::json!({}),
            triggered_by: None,
            created_at: at,
        }
    }

    #[tokio::test]
    async fn scoring_rule_criteria_survive_storage() {
        let fixture = setup_backend().await;
        let db = &fixture.backend;
        let criterion = ScoringCriterion::new(
            "Has phone",
            Condition::new("phone", Operator::NotEquals, "".into()),
            15,
        )
        .with_weight(1.5);
        let mut params = CreateScoringRuleParams::new(
            "Phone provided",
            ScoringCategory::Demographic,
            vec![criterion],
        );
        params.max_score = 20;
        let rule = db.create_scoring_rule(&params, t0()).await.expect("create");
        assert_eq!(rule.criteria, params.criteria);
        assert_eq!(rule.max_score, 20);

        db.record_scoring_rules_applied(&[rule.id], t0()).await.expect("applied");
        let updated = db
            .update_scoring_rule(
                rule.id,
                &UpdateScoringRuleParams {
                    is_active: Some(false),
                    ..Default::default()
                },
                t0(),
            )
            .await
            .expect("update")
            .expect("exists");
        assert_eq!(updated.times_applied, 1);
        assert_eq!(updated.last_applied_at, Some(t0()));
        assert!(db.list_active_scoring_rules().await.expect("active").is_empty());
        assert_eq!(db.list_scoring_rules().await.expect("all").len(), 1);
    }

    #[tokio::test]
    async fn transition_rules_filter_by_from_status() {
        let fixture = setup_backend().await;
        let db = &fixture.backend;
        let mut params = CreateTransitionRuleParams::new(
            "Auto qualify",
            ContactStatus::New,
            ContactStatus::Qualified,
        );
        params.required_score = 60;
        params.notify_owner_ids = vec![Uuid::new_v4()];
        let rule = db.create_transition_rule(&params, t0()).await.expect("create");
        assert_eq!(rule.notify_owner_ids, params.notify_owner_ids);
        assert_eq!(rule.transition_type, TriggerType::Automatic);

        let from_new = db
            .list_active_transition_rules_from(ContactStatus::New)
            .await
            .expect("list");
        assert_eq!(from_new.len(), 1);
        assert!(
            db.list_active_transition_rules_from(ContactStatus::Contacted)
                .await
                .expect("list")
                .is_empty()
        );
    }

    #[tokio::test]
    async fn status_change_commit_writes_contact_lifecycle_and_events() {
        let fixture = setup_backend().await;
        let db = &fixture.backend;
        let contact = db
            .upsert_contact(&UpsertContactParams::new("Mo", "Ali"), t0())
            .await
            .expect("contact");
        let params = CreateTransitionRuleParams::new(
            "Reach out",
            ContactStatus::New,
            ContactStatus::Contacted,
        );
        let rule = db.create_transition_rule(&params, t0()).await.expect("rule");

        let mut lifecycle =
            ContactLifecycleRecord::new_for(&contact, LifecycleStage::Unknown, t0());
        lifecycle.current_status = ContactStatus::Contacted;
        lifecycle.first_engagement_at = Some(t0());
        lifecycle.score_history.push(ScoreSnapshot {
            score: 10,
            demographic_score: 10,
            behavioral_score: 0,
            engagement_score: 0,
            firmographic_score: 0,
            factors: BTreeMap::from([(
                "Business email".to_string(),
                ScoringFactor {
                    rule_name: "Business email".to_string(),
                    category: ScoringCategory::Demographic,
                    score: 10,
                },
            )]),
            reason: "initial".to_string(),
            scored_at: t0(),
        });
        lifecycle.stage_velocity.insert("unknown".to_string(), 2);

        let change = StatusChangeCommit {
            events: vec![
                event(&lifecycle, "status_changed", t0()),
                event(&lifecycle, "milestone_reached", t0() + Duration::seconds(1)),
            ],
            lifecycle,
            transition_rule_id: Some(rule.id),
        };
        db.commit_status_change(&change, t0()).await.expect("commit");

        let stored = db.get_lifecycle(contact.id).await.expect("get").expect("row");
        assert_eq!(stored.current_status, ContactStatus::Contacted);
        assert_eq!(stored.score_history, change.lifecycle.score_history);
        assert_eq!(stored.stage_velocity.get("unknown"), Some(&2));
        assert_eq!(stored.first_engagement_at, Some(t0()));

        let reloaded = db.get_contact(contact.id).await.expect("get").expect("contact");
        assert_eq!(reloaded.status, ContactStatus::Contacted);
        let rule = db.get_transition_rule(rule.id).await.expect("get").expect("rule");
        assert_eq!(rule.times_triggered, 1);

        let events = db.list_lifecycle_events(contact.id, 0).await.expect("events");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_name, "milestone_reached");
        assert_eq!(db.list_lifecycle_events(contact.id, 1).await.expect("events").len(), 1);
        assert_eq!(
            db.list_lifecycles_in_status(ContactStatus::Contacted)
                .await
                .expect("by status")
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn bulk_status_changes_commit_iff_any_succeeds() {
        let fixture = setup_backend().await;
        let db = &fixture.backend;
        let contact = db
            .upsert_contact(&UpsertContactParams::new("Real", "Contact"), t0())
            .await
            .expect("contact");
        let mut ghost_params = UpsertContactParams::new("Ghost", "Contact");
        ghost_params.id = Uuid::new_v4();
        let ghost = db.upsert_contact(&ghost_params, t0()).await.expect("ghost");
        db.delete_contact(ghost.id).await.expect("delete");

        let to_contacted = |c: &crate::db::ContactRecord| {
            let mut lifecycle = ContactLifecycleRecord::new_for(c, LifecycleStage::Unknown, t0());
            lifecycle.current_status = ContactStatus::Contacted;
            StatusChangeCommit {
                lifecycle,
                events: Vec::new(),
                transition_rule_id: None,
            }
        };
        let failures = db
            .commit_status_changes(&[to_contacted(&contact), to_contacted(&ghost)], t0())
            .await
            .expect("bulk");
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, ghost.id);
        assert!(db.get_lifecycle(contact.id).await.expect("get").is_some());
        assert!(db.get_lifecycle(ghost.id).await.expect("get").is_none());
    }

    #[tokio::test]
    async fn save_score_updates_contact_cache() {
        let fixture = setup_backend().await;
        let db = &fixture.backend;
        let contact = db
            .upsert_contact(&UpsertContactParams::new("Sam", "Oak"), t0())
            .await
            .expect("contact");
        let mut lifecycle =
            ContactLifecycleRecord::new_for(&contact, LifecycleStage::Suspect, t0());
        lifecycle.current_score = 25;
        lifecycle.last_scored_at = Some(t0());
        db.save_score(&lifecycle, t0()).await.expect("save");

        let reloaded = db.get_contact(contact.id).await.expect("get").expect("contact");
        assert_eq!(reloaded.lead_score, 25);
        let stored = db.get_lifecycle(contact.id).await.expect("get").expect("row");
        assert_eq!(stored.current_stage, LifecycleStage::Suspect);
        assert_eq!(stored.last_scored_at, Some(t0()));
    }
}
