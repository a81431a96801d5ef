use chrono::{DateTime, Duration, Utc};
use libsql::params;
use uuid::Uuid;

use crate::db::{
    AssignmentHistoryRecord, AssignmentProgress, AssignmentRuleRecord, AssignmentRuleStore,
    AssignmentStatus, AssignmentStore, AssignmentStrategy, AssignmentType, BulkCommitOutcome,
    CommitOutcome, CommittedAssignment, ContactAssignmentRecord, ContactPriority, ContactStatus,
    CreateAssignmentRuleParams, HistoryChangeType, NewAssignment, RuleStatus,
    UpdateAssignmentRuleParams, UserWorkloadRecord, WorkloadProfileParams, WorkloadStore,
};
use crate::error::DatabaseError;
use crate::rules::{BusinessHours, Condition};

use super::directory::parse_status;
use super::{
    LibSqlBackend, fmt_ts, from_json_text, get_bool, get_f64, get_i32, get_i64, get_opt_i64,
    get_opt_text, get_text, opt_i64, opt_text, opt_text_owned, opt_uuid, parse_dt, parse_dt_opt,
    parse_opt_uuid, parse_uuid, to_json_text,
};

const RULE_COLUMNS: &str = "id, name, description, strategy, status, priority, conditions, \
     assignee_ids, fallback_owner_id, business_hours, max_assignments_per_hour, \
     max_assignments_per_day, total_assignments, successful_assignments, last_assignment_at, \
     created_by, created_at, updated_at";

const ASSIGNMENT_COLUMNS: &str = "id, contact_id, owner_id, assigned_by, rule_id, \
     assignment_type, reason, priority, status, accepted_at, first_response_at, completed_at, \
     created_at, updated_at";

const HISTORY_COLUMNS: &str = "id, contact_id, from_owner_id, to_owner_id, changed_by, rule_id, \
     change_type, reason, previous_status, new_status, created_at";

const WORKLOAD_COLUMNS: &str = "owner_id, active_contacts, pending_contacts, overdue_contacts, \
     total_contacts, today_assignments, weekly_assignments, avg_response_time_hours, \
     avg_resolution_time_hours, conversion_rate, is_available, max_daily_assignments, \
     max_active_contacts, skills, territories, contact_types, last_calculated_at, created_at, \
     updated_at";

fn parse_strategy(raw: &str) -> Result<AssignmentStrategy, DatabaseError> {
    AssignmentStrategy::from_db_value(raw)
        .ok_or_else(|| DatabaseError::Serialization(format!("invalid assignment strategy '{raw}'")))
}

fn parse_rule_status(raw: &str) -> Result<RuleStatus, DatabaseError> {
    RuleStatus::from_db_value(raw)
        .ok_or_else(|| DatabaseError::Serialization(format!("invalid rule status '{raw}'")))
}

fn parse_assignment_status(raw: &str) -> Result<AssignmentStatus, DatabaseError> {
    AssignmentStatus::from_db_value(raw)
        .ok_or_else(|| DatabaseError::Serialization(format!("invalid assignment status '{raw}'")))
}

fn parse_opt_assignment_status(
    raw: Option<String>,
) -> Result<Option<AssignmentStatus>, DatabaseError> {
    raw.map(|value| parse_assignment_status(&value)).transpose()
}

fn parse_limit(raw: Option<i64>) -> Result<Option<u32>, DatabaseError> {
    raw.map(|value| {
        u32::try_from(value)
            .map_err(|_| DatabaseError::Serialization(format!("invalid rate limit {value}")))
    })
    .transpose()
}

fn parse_business_hours(raw: Option<String>) -> Result<Option<BusinessHours>, DatabaseError> {
    raw.filter(|value| !value.trim().is_empty() && value.trim() != "null")
        .map(|value| {
            serde_json::from_str::<BusinessHours>(&value).map_err(|e| {
                DatabaseError::Serialization(format!("invalid business_hours json: {e}"))
            })
        })
        .transpose()
}

fn business_hours_json(hours: Option<&BusinessHours>) -> Result<libsql::Value, DatabaseError> {
    match hours {
        Some(hours) => Ok(libsql::Value::Text(to_json_text(hours)?)),
        None => Ok(libsql::Value::Null),
    }
}

fn parse_uuid_list(raw: &str, field: &str) -> Result<Vec<Uuid>, DatabaseError> {
    let values: Vec<String> = from_json_text(raw, field)?;
    values.iter().map(|value| parse_uuid(value, field)).collect()
}

fn row_to_rule_record(row: &libsql::Row) -> Result<AssignmentRuleRecord, DatabaseError> {
    let conditions: Vec<Condition> = from_json_text(&get_text(row, 6), "rule.conditions")?;
    Ok(AssignmentRuleRecord {
        id: parse_uuid(&get_text(row, 0), "rule.id")?,
        name: get_text(row, 1),
        description: get_opt_text(row, 2),
        strategy: parse_strategy(&get_text(row, 3))?,
        status: parse_rule_status(&get_text(row, 4))?,
        priority: get_i32(row, 5)?,
        conditions,
        assignee_ids: parse_uuid_list(&get_text(row, 7), "rule.assignee_ids")?,
        fallback_owner_id: parse_opt_uuid(get_opt_text(row, 8), "rule.fallback_owner_id")?,
        business_hours: parse_business_hours(get_opt_text(row, 9))?,
        max_assignments_per_hour: parse_limit(get_opt_i64(row, 10))?,
        max_assignments_per_day: parse_limit(get_opt_i64(row, 11))?,
        total_assignments: get_i64(row, 12),
        successful_assignments: get_i64(row, 13),
        last_assignment_at: parse_dt_opt(get_opt_text(row, 14))?,
        created_by: parse_opt_uuid(get_opt_text(row, 15), "rule.created_by")?,
        created_at: parse_dt(&get_text(row, 16), "rule.created_at")?,
        updated_at: parse_dt(&get_text(row, 17), "rule.updated_at")?,
    })
}

fn row_to_assignment_record(row: &libsql::Row) -> Result<ContactAssignmentRecord, DatabaseError> {
    let assignment_type_raw = get_text(row, 5);
    let priority_raw = get_text(row, 7);
    Ok(ContactAssignmentRecord {
        id: parse_uuid(&get_text(row, 0), "assignment.id")?,
        contact_id: parse_uuid(&get_text(row, 1), "assignment.contact_id")?,
        owner_id: parse_uuid(&get_text(row, 2), "assignment.owner_id")?,
        assigned_by: parse_opt_uuid(get_opt_text(row, 3), "assignment.assigned_by")?,
        rule_id: parse_opt_uuid(get_opt_text(row, 4), "assignment.rule_id")?,
        assignment_type: AssignmentType::from_db_value(&assignment_type_raw).ok_or_else(|| {
            DatabaseError::Serialization(format!("invalid assignment type '{assignment_type_raw}'"))
        })?,
        reason: get_text(row, 6),
        priority: ContactPriority::from_db_value(&priority_raw).ok_or_else(|| {
            DatabaseError::Serialization(format!("invalid assignment priority '{priority_raw}'"))
        })?,
        status: parse_assignment_status(&get_text(row, 8))?,
        accepted_at: parse_dt_opt(get_opt_text(row, 9))?,
        first_response_at: parse_dt_opt(get_opt_text(row, 10))?,
        completed_at: parse_dt_opt(get_opt_text(row, 11))?,
        created_at: parse_dt(&get_text(row, 12), "assignment.created_at")?,
        updated_at: parse_dt(&get_text(row, 13), "assignment.updated_at")?,
    })
}

fn row_to_history_record(row: &libsql::Row) -> Result<AssignmentHistoryRecord, DatabaseError> {
    let change_type_raw = get_text(row, 6);
    Ok(AssignmentHistoryRecord {
        id: parse_uuid(&get_text(row, 0), "history.id")?,
        contact_id: parse_uuid(&get_text(row, 1), "history.contact_id")?,
        from_owner_id: parse_opt_uuid(get_opt_text(row, 2), "history.from_owner_id")?,
        to_owner_id: parse_opt_uuid(get_opt_text(row, 3), "history.to_owner_id")?,
        changed_by: parse_opt_uuid(get_opt_text(row, 4), "history.changed_by")?,
        rule_id: parse_opt_uuid(get_opt_text(row, 5), "history.rule_id")?,
        change_type: HistoryChangeType::from_db_value(&change_type_raw).ok_or_else(|| {
            DatabaseError::Serialization(format!("invalid history change type '{change_type_raw}'"))
        })?,
        reason: get_text(row, 7),
        previous_status: parse_opt_assignment_status(get_opt_text(row, 8))?,
        new_status: parse_opt_assignment_status(get_opt_text(row, 9))?,
        created_at: parse_dt(&get_text(row, 10), "history.created_at")?,
    })
}

fn row_to_workload_record(row: &libsql::Row) -> Result<UserWorkloadRecord, DatabaseError> {
    Ok(UserWorkloadRecord {
        owner_id: parse_uuid(&get_text(row, 0), "workload.owner_id")?,
        active_contacts: get_i64(row, 1),
        pending_contacts: get_i64(row, 2),
        overdue_contacts: get_i64(row, 3),
        total_contacts: get_i64(row, 4),
        today_assignments: get_i64(row, 5),
        weekly_assignments: get_i64(row, 6),
        avg_response_time_hours: get_f64(row, 7),
        avg_resolution_time_hours: get_f64(row, 8),
        conversion_rate: get_f64(row, 9),
        is_available: get_bool(row, 10),
        max_daily_assignments: get_opt_i64(row, 11),
        max_active_contacts: get_opt_i64(row, 12),
        skills: from_json_text(&get_text(row, 13), "workload.skills")?,
        territories: from_json_text(&get_text(row, 14), "workload.territories")?,
        contact_types: from_json_text(&get_text(row, 15), "workload.contact_types")?,
        last_calculated_at: parse_dt_opt(get_opt_text(row, 16))?,
        created_at: parse_dt(&get_text(row, 17), "workload.created_at")?,
        updated_at: parse_dt(&get_text(row, 18), "workload.updated_at")?,
    })
}

fn uuid_list_json(ids: &[Uuid]) -> Result<String, DatabaseError> {
    to_json_text(&ids.iter().map(Uuid::to_string).collect::<Vec<_>>())
}

async fn load_assignment(
    conn: &libsql::Connection,
    assignment_id: &str,
) -> Result<ContactAssignmentRecord, DatabaseError> {
    let row = conn
        .query(
            &format!("SELECT {ASSIGNMENT_COLUMNS} FROM contact_assignments WHERE id = ?1 LIMIT 1"),
            params![assignment_id],
        )
        .await?
        .next()
        .await?
        .ok_or_else(|| DatabaseError::Query("failed to load assignment".to_string()))?;
    row_to_assignment_record(&row)
}

async fn active_assignment_on(
    conn: &libsql::Connection,
    contact_id: Uuid,
) -> Result<Option<ContactAssignmentRecord>, DatabaseError> {
    let mut rows = conn
        .query(
            &format!(
                "SELECT {ASSIGNMENT_COLUMNS} FROM contact_assignments \
                 WHERE contact_id = ?1 AND status = 'active' LIMIT 1"
            ),
            params![contact_id.to_string()],
        )
        .await?;
    match rows.next().await? {
        Some(row) => Ok(Some(row_to_assignment_record(&row)?)),
        None => Ok(None),
    }
}

#[allow(clippy::too_many_arguments)]
async fn insert_history(
    conn: &libsql::Connection,
    contact_id: Uuid,
    from_owner_id: Option<Uuid>,
    to_owner_id: Option<Uuid>,
    changed_by: Option<Uuid>,
    rule_id: Option<Uuid>,
    change_type: HistoryChangeType,
    reason: &str,
    previous_status: Option<AssignmentStatus>,
    new_status: Option<AssignmentStatus>,
    now: DateTime<Utc>,
) -> Result<AssignmentHistoryRecord, DatabaseError> {
    let id = Uuid::new_v4();
    conn.execute(
        "INSERT INTO assignment_history \
         (id, contact_id, from_owner_id, to_owner_id, changed_by, rule_id, change_type, reason, \
          previous_status, new_status, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            id.to_string(),
            contact_id.to_string(),
            opt_uuid(from_owner_id),
            opt_uuid(to_owner_id),
            opt_uuid(changed_by),
            opt_uuid(rule_id),
            change_type.as_str(),
            reason,
            opt_text(previous_status.map(AssignmentStatus::as_str)),
            opt_text(new_status.map(AssignmentStatus::as_str)),
            fmt_ts(&now),
        ],
    )
    .await?;
    Ok(AssignmentHistoryRecord {
        id,
        contact_id,
        from_owner_id,
        to_owner_id,
        changed_by,
        rule_id,
        change_type,
        reason: reason.to_string(),
        previous_status,
        new_status,
        created_at: now,
    })
}

/// Reserve one slot in each rate-limit bucket. Returns the first bucket
/// that is already full.
async fn reserve_windows(
    conn: &libsql::Connection,
    input: &NewAssignment,
) -> Result<Option<String>, DatabaseError> {
    let Some(rule_id) = input.rule_id else {
        return Ok(None);
    };
    for reservation in &input.reservations {
        if reservation.limit == 0 {
            return Ok(Some(reservation.window_key.clone()));
        }
        let reserved = conn
            .execute(
                "INSERT INTO assignment_rule_windows (rule_id, window_key, assignments) \
                 VALUES (?1, ?2, 1) \
                 ON CONFLICT(rule_id, window_key) DO UPDATE \
                 SET assignments = assignments + 1 WHERE assignments < ?3",
                params![
                    rule_id.to_string(),
                    reservation.window_key.as_str(),
                    i64::from(reservation.limit),
                ],
            )
            .await?;
        if reserved == 0 {
            return Ok(Some(reservation.window_key.clone()));
        }
    }
    Ok(None)
}

/// All writes of one assignment. Callers own the surrounding transaction.
async fn write_assignment(
    conn: &libsql::Connection,
    input: &NewAssignment,
    now: DateTime<Utc>,
) -> Result<CommitOutcome, DatabaseError> {
    if let Some(window_key) = reserve_windows(conn, input).await? {
        return Ok(CommitOutcome::RateLimited { window_key });
    }

    let ts = fmt_ts(&now);
    let contact_id = input.contact_id.to_string();
    let updated = conn
        .execute(
            "UPDATE contacts SET assigned_to = ?2, assigned_at = ?3, updated_at = ?3 WHERE id = ?1",
            params![contact_id.as_str(), input.owner_id.to_string(), ts.as_str()],
        )
        .await?;
    if updated == 0 {
        return Err(DatabaseError::NotFound {
            entity: "contact".to_string(),
            id: contact_id,
        });
    }

    let previous = active_assignment_on(conn, input.contact_id).await?;
    if let Some(previous) = &previous {
        conn.execute(
            "UPDATE contact_assignments SET status = 'reassigned', updated_at = ?2 WHERE id = ?1",
            params![previous.id.to_string(), ts.as_str()],
        )
        .await?;
    }

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO contact_assignments \
         (id, contact_id, owner_id, assigned_by, rule_id, assignment_type, reason, priority, \
          status, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'active', ?9, ?9)",
        params![
            id.as_str(),
            contact_id.as_str(),
            input.owner_id.to_string(),
            opt_uuid(input.assigned_by),
            opt_uuid(input.rule_id),
            input.assignment_type.as_str(),
            input.reason.as_str(),
            input.priority.as_str(),
            ts.as_str(),
        ],
    )
    .await?;

    if let Some(rule_id) = input.rule_id {
        conn.execute(
            "UPDATE assignment_rules SET \
               total_assignments = total_assignments + 1, \
               successful_assignments = successful_assignments + 1, \
               last_assignment_at = ?2 \
             WHERE id = ?1",
            params![rule_id.to_string(), ts.as_str()],
        )
        .await?;
    }

    let (change_type, previous_owner_id, previous_status) = match &previous {
        Some(prev) => (
            HistoryChangeType::Reassigned,
            Some(prev.owner_id),
            Some(AssignmentStatus::Active),
        ),
        None => (HistoryChangeType::Assigned, None, None),
    };
    let history = insert_history(
        conn,
        input.contact_id,
        previous_owner_id,
        Some(input.owner_id),
        input.assigned_by,
        input.rule_id,
        change_type,
        &input.reason,
        previous_status,
        Some(AssignmentStatus::Active),
        now,
    )
    .await?;

    let assignment = load_assignment(conn, &id).await?;
    Ok(CommitOutcome::Committed(CommittedAssignment {
        assignment,
        previous_owner_id,
        history,
    }))
}

#[async_trait::async_trait]
impl AssignmentRuleStore for LibSqlBackend {
    async fn create_assignment_rule(
        &self,
        input: &CreateAssignmentRuleParams,
        now: DateTime<Utc>,
    ) -> Result<AssignmentRuleRecord, DatabaseError> {
        let conn = self.connect().await?;
        let id = Uuid::new_v4();
        conn.execute(
            "INSERT INTO assignment_rules \
             (id, name, description, strategy, status, priority, conditions, assignee_ids, \
              fallback_owner_id, business_hours, max_assignments_per_hour, \
              max_assignments_per_day, created_by, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?14)",
            params![
                id.to_string(),
                input.name.trim(),
                opt_text(input.description.as_deref()),
                input.strategy.as_str(),
                input.status.as_str(),
                i64::from(input.priority),
                to_json_text(&input.conditions)?,
                uuid_list_json(&input.assignee_ids)?,
                opt_uuid(input.fallback_owner_id),
                business_hours_json(input.business_hours.as_ref())?,
                opt_i64(input.max_assignments_per_hour.map(i64::from)),
                opt_i64(input.max_assignments_per_day.map(i64::from)),
                opt_uuid(input.created_by),
                fmt_ts(&now),
            ],
        )
        .await?;

        self.get_assignment_rule(id)
            .await?
            .ok_or_else(|| DatabaseError::Query("failed to load created rule".to_string()))
    }

    async fn get_assignment_rule(
        &self,
        rule_id: Uuid,
    ) -> Result<Option<AssignmentRuleRecord>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {RULE_COLUMNS} FROM assignment_rules WHERE id = ?1 LIMIT 1"),
                params![rule_id.to_string()],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_rule_record(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_assignment_rules(&self) -> Result<Vec<AssignmentRuleRecord>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {RULE_COLUMNS} FROM assignment_rules \
                     ORDER BY priority DESC, created_at ASC, rowid ASC"
                ),
                (),
            )
            .await?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(row_to_rule_record(&row)?);
        }
        Ok(out)
    }

    async fn list_active_assignment_rules(
        &self,
    ) -> Result<Vec<AssignmentRuleRecord>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {RULE_COLUMNS} FROM assignment_rules WHERE status = 'active' \
                     ORDER BY priority DESC, created_at ASC, rowid ASC"
                ),
                (),
            )
            .await?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(row_to_rule_record(&row)?);
        }
        Ok(out)
    }

    async fn update_assignment_rule(
        &self,
        rule_id: Uuid,
        input: &UpdateAssignmentRuleParams,
        now: DateTime<Utc>,
    ) -> Result<Option<AssignmentRuleRecord>, DatabaseError> {
        let Some(existing) = self.get_assignment_rule(rule_id).await? else {
            return Ok(None);
        };

        let name = input.name.clone().unwrap_or(existing.name);
        let description = input.description.clone().unwrap_or(existing.description);
        let strategy = input.strategy.unwrap_or(existing.strategy);
        let status = input.status.unwrap_or(existing.status);
        let priority = input.priority.unwrap_or(existing.priority);
        let conditions = input.conditions.clone().unwrap_or(existing.conditions);
        let assignee_ids = input.assignee_ids.clone().unwrap_or(existing.assignee_ids);
        let fallback_owner_id = input.fallback_owner_id.unwrap_or(existing.fallback_owner_id);
        let business_hours = input
            .business_hours
            .clone()
            .unwrap_or(existing.business_hours);
        let per_hour = input
            .max_assignments_per_hour
            .unwrap_or(existing.max_assignments_per_hour);
        let per_day = input
            .max_assignments_per_day
            .unwrap_or(existing.max_assignments_per_day);

        let conn = self.connect().await?;
        conn.execute(
            "UPDATE assignment_rules SET \
               name = ?2, \
               description = ?3, \
               strategy = ?4, \
               status = ?5, \
               priority = ?6, \
               conditions = ?7, \
               assignee_ids = ?8, \
               fallback_owner_id = ?9, \
               business_hours = ?10, \
               max_assignments_per_hour = ?11, \
               max_assignments_per_day = ?12, \
               updated_at = ?13 \
             WHERE id = ?1",
            params![
                rule_id.to_string(),
                name.trim(),
                opt_text_owned(description),
                strategy.as_str(),
                status.as_str(),
                i64::from(priority),
                to_json_text(&conditions)?,
                uuid_list_json(&assignee_ids)?,
                opt_uuid(fallback_owner_id),
                business_hours_json(business_hours.as_ref())?,
                opt_i64(per_hour.map(i64::from)),
                opt_i64(per_day.map(i64::from)),
                fmt_ts(&now),
            ],
        )
        .await?;

        self.get_assignment_rule(rule_id).await
    }

    async fn set_assignment_rule_status(
        &self,
        rule_id: Uuid,
        status: RuleStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let conn = self.connect().await?;
        let updated = conn
            .execute(
                "UPDATE assignment_rules SET status = ?2, updated_at = ?3 WHERE id = ?1",
                params![rule_id.to_string(), status.as_str(), fmt_ts(&now)],
            )
            .await?;
        Ok(updated > 0)
    }

    async fn delete_assignment_rule(&self, rule_id: Uuid) -> Result<bool, DatabaseError> {
        let conn = self.connect().await?;
        conn.execute("BEGIN IMMEDIATE", ()).await?;
        let result = async {
            conn.execute(
                "DELETE FROM assignment_rule_windows WHERE rule_id = ?1",
                params![rule_id.to_string()],
            )
            .await?;
            let deleted = conn
                .execute(
                    "DELETE FROM assignment_rules WHERE id = ?1",
                    params![rule_id.to_string()],
                )
                .await?;
            Ok::<_, DatabaseError>(deleted > 0)
        }
        .await;

        match result {
            Ok(deleted) => {
                conn.execute("COMMIT", ()).await?;
                Ok(deleted)
            }
            Err(err) => {
                let _ = conn.execute("ROLLBACK", ()).await;
                Err(err)
            }
        }
    }
}

#[async_trait::async_trait]
impl AssignmentStore for LibSqlBackend {
    async fn get_active_assignment(
        &self,
        contact_id: Uuid,
    ) -> Result<Option<ContactAssignmentRecord>, DatabaseError> {
        let conn = self.connect().await?;
        active_assignment_on(&conn, contact_id).await
    }

    async fn list_assignments_for_contact(
        &self,
        contact_id: Uuid,
    ) -> Result<Vec<ContactAssignmentRecord>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {ASSIGNMENT_COLUMNS} FROM contact_assignments \
                     WHERE contact_id = ?1 ORDER BY created_at DESC, rowid DESC"
                ),
                params![contact_id.to_string()],
            )
            .await?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(row_to_assignment_record(&row)?);
        }
        Ok(out)
    }

    async fn last_assignment_for_rule(
        &self,
        rule_id: Uuid,
    ) -> Result<Option<ContactAssignmentRecord>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {ASSIGNMENT_COLUMNS} FROM contact_assignments \
                     WHERE rule_id = ?1 ORDER BY created_at DESC, rowid DESC LIMIT 1"
                ),
                params![rule_id.to_string()],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_assignment_record(&row)?)),
            None => Ok(None),
        }
    }

    async fn rule_window_counts(
        &self,
        rule_id: Uuid,
        window_keys: &[String],
    ) -> Result<Vec<u32>, DatabaseError> {
        let conn = self.connect().await?;
        let mut out = Vec::with_capacity(window_keys.len());
        for key in window_keys {
            let mut rows = conn
                .query(
                    "SELECT assignments FROM assignment_rule_windows \
                     WHERE rule_id = ?1 AND window_key = ?2",
                    params![rule_id.to_string(), key.as_str()],
                )
                .await?;
            let count = match rows.next().await? {
                Some(row) => get_i64(&row, 0),
                None => 0,
            };
            out.push(u32::try_from(count).unwrap_or(u32::MAX));
        }
        Ok(out)
    }

    async fn commit_assignment(
        &self,
        input: &NewAssignment,
        now: DateTime<Utc>,
    ) -> Result<CommitOutcome, DatabaseError> {
        let conn = self.connect().await?;
        conn.execute("BEGIN IMMEDIATE", ()).await?;
        let result = write_assignment(&conn, input, now).await;

        match result {
            Ok(outcome @ CommitOutcome::Committed(_)) => {
                conn.execute("COMMIT", ()).await?;
                Ok(outcome)
            }
            Ok(outcome @ CommitOutcome::RateLimited { .. }) => {
                let _ = conn.execute("ROLLBACK", ()).await;
                Ok(outcome)
            }
            Err(err) => {
                let _ = conn.execute("ROLLBACK", ()).await;
                Err(err)
            }
        }
    }

    async fn commit_assignments(
        &self,
        inputs: &[NewAssignment],
        now: DateTime<Utc>,
    ) -> Result<BulkCommitOutcome, DatabaseError> {
        let mut outcome = BulkCommitOutcome {
            committed: Vec::new(),
            failures: Vec::new(),
        };
        if inputs.is_empty() {
            return Ok(outcome);
        }

        let conn = self.connect().await?;
        conn.execute("BEGIN IMMEDIATE", ()).await?;
        for input in inputs {
            if let Err(err) = conn.execute("SAVEPOINT bulk_item", ()).await {
                let _ = conn.execute("ROLLBACK", ()).await;
                return Err(err.into());
            }
            let item = write_assignment(&conn, input, now).await;
            let item_err = match item {
                Ok(CommitOutcome::Committed(committed)) => {
                    conn.execute("RELEASE SAVEPOINT bulk_item", ()).await?;
                    outcome.committed.push(committed);
                    continue;
                }
                Ok(CommitOutcome::RateLimited { window_key }) => {
                    DatabaseError::Constraint(format!("rate limit reached for window {window_key}"))
                }
                Err(err) => err,
            };
            let _ = conn.execute("ROLLBACK TO SAVEPOINT bulk_item", ()).await;
            let _ = conn.execute("RELEASE SAVEPOINT bulk_item", ()).await;
            outcome.failures.push((input.contact_id, item_err));
        }

        if outcome.committed.is_empty() {
            let _ = conn.execute("ROLLBACK", ()).await;
        } else {
            conn.execute("COMMIT", ()).await?;
        }
        Ok(outcome)
    }

    async fn unassign_contact(
        &self,
        contact_id: Uuid,
        changed_by: Option<Uuid>,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<(ContactAssignmentRecord, AssignmentHistoryRecord)>, DatabaseError> {
        let conn = self.connect().await?;
        conn.execute("BEGIN IMMEDIATE", ()).await?;
        let result = async {
            let Some(active) = active_assignment_on(&conn, contact_id).await? else {
                return Ok(None);
            };
            let ts = fmt_ts(&now);
            conn.execute(
                "UPDATE contact_assignments SET status = 'unassigned', updated_at = ?2 \
                 WHERE id = ?1",
                params![active.id.to_string(), ts.as_str()],
            )
            .await?;
            conn.execute(
                "UPDATE contacts SET assigned_to = NULL, assigned_at = NULL, updated_at = ?2 \
                 WHERE id = ?1",
                params![contact_id.to_string(), ts.as_str()],
            )
            .await?;
            let history = insert_history(
                &conn,
                contact_id,
                Some(active.owner_id),
                None,
                changed_by,
                None,
                HistoryChangeType::Unassigned,
                reason,
                Some(AssignmentStatus::Active),
                Some(AssignmentStatus::Unassigned),
                now,
            )
            .await?;
            let updated = load_assignment(&conn, &active.id.to_string()).await?;
            Ok::<_, DatabaseError>(Some((updated, history)))
        }
        .await;

        match result {
            Ok(Some(done)) => {
                conn.execute("COMMIT", ()).await?;
                Ok(Some(done))
            }
            Ok(None) => {
                let _ = conn.execute("ROLLBACK", ()).await;
                Ok(None)
            }
            Err(err) => {
                let _ = conn.execute("ROLLBACK", ()).await;
                Err(err)
            }
        }
    }

    async fn record_assignment_progress(
        &self,
        assignment_id: Uuid,
        progress: AssignmentProgress,
        now: DateTime<Utc>,
    ) -> Result<Option<ContactAssignmentRecord>, DatabaseError> {
        let sql = match progress {
            AssignmentProgress::Accepted => {
                "UPDATE contact_assignments SET accepted_at = COALESCE(accepted_at, ?2), \
                 updated_at = ?2 WHERE id = ?1"
            }
            AssignmentProgress::FirstResponse => {
                "UPDATE contact_assignments \
                 SET first_response_at = COALESCE(first_response_at, ?2), updated_at = ?2 \
                 WHERE id = ?1"
            }
            AssignmentProgress::Completed => {
                "UPDATE contact_assignments SET completed_at = COALESCE(completed_at, ?2), \
                 status = CASE WHEN status = 'active' THEN 'completed' ELSE status END, \
                 updated_at = ?2 WHERE id = ?1"
            }
        };
        let conn = self.connect().await?;
        let updated = conn
            .execute(sql, params![assignment_id.to_string(), fmt_ts(&now)])
            .await?;
        if updated == 0 {
            return Ok(None);
        }
        load_assignment(&conn, &assignment_id.to_string())
            .await
            .map(Some)
    }

    async fn list_assignment_history(
        &self,
        contact_id: Uuid,
    ) -> Result<Vec<AssignmentHistoryRecord>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {HISTORY_COLUMNS} FROM assignment_history \
                     WHERE contact_id = ?1 ORDER BY created_at ASC, rowid ASC"
                ),
                params![contact_id.to_string()],
            )
            .await?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(row_to_history_record(&row)?);
        }
        Ok(out)
    }
}

/// Load counters derived from an owner's contacts and assignments.
#[derive(Debug, Default, PartialEq)]
struct WorkloadCounts {
    active: i64,
    pending: i64,
    overdue: i64,
    total: i64,
    today: i64,
    weekly: i64,
    avg_response_hours: f64,
    avg_resolution_hours: f64,
    conversion_rate: f64,
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

async fn count_workload(
    conn: &libsql::Connection,
    owner_id: Uuid,
    terminal: &[ContactStatus],
    now: DateTime<Utc>,
) -> Result<WorkloadCounts, DatabaseError> {
    let mut counts = WorkloadCounts::default();
    let (mut won, mut lost) = (0_i64, 0_i64);

    let mut rows = conn
        .query(
            "SELECT status, next_followup_at FROM contacts WHERE assigned_to = ?1",
            params![owner_id.to_string()],
        )
        .await?;
    while let Some(row) = rows.next().await? {
        let status = parse_status(&get_text(&row, 0))?;
        let followup = parse_dt_opt(get_opt_text(&row, 1))?;
        let is_terminal = terminal.contains(&status);
        counts.total += 1;
        if !is_terminal {
            counts.active += 1;
            if followup.is_some_and(|due| due < now) {
                counts.overdue += 1;
            }
        }
        match status {
            ContactStatus::New => counts.pending += 1,
            ContactStatus::ClosedWon => won += 1,
            ContactStatus::ClosedLost => lost += 1,
            _ => {}
        }
    }
    if won + lost > 0 {
        counts.conversion_rate = won as f64 / (won + lost) as f64;
    }

    let day_start = now
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|naive| naive.and_utc())
        .unwrap_or(now);
    let week_start = now - Duration::days(7);
    let mut response_hours = Vec::new();
    let mut resolution_hours = Vec::new();
    let mut rows = conn
        .query(
            "SELECT created_at, first_response_at, completed_at FROM contact_assignments \
             WHERE owner_id = ?1",
            params![owner_id.to_string()],
        )
        .await?;
    while let Some(row) = rows.next().await? {
        let created = parse_dt(&get_text(&row, 0), "assignment.created_at")?;
        if created >= day_start {
            counts.today += 1;
        }
        if created >= week_start {
            counts.weekly += 1;
        }
        if let Some(responded) = parse_dt_opt(get_opt_text(&row, 1))? {
            response_hours.push((responded - created).num_seconds() as f64 / 3600.0);
        }
        if let Some(completed) = parse_dt_opt(get_opt_text(&row, 2))? {
            resolution_hours.push((completed - created).num_seconds() as f64 / 3600.0);
        }
    }
    counts.avg_response_hours = mean(&response_hours);
    counts.avg_resolution_hours = mean(&resolution_hours);
    Ok(counts)
}

#[async_trait::async_trait]
impl WorkloadStore for LibSqlBackend {
    async fn get_workload(
        &self,
        owner_id: Uuid,
    ) -> Result<Option<UserWorkloadRecord>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {WORKLOAD_COLUMNS} FROM user_workloads WHERE owner_id = ?1"),
                params![owner_id.to_string()],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_workload_record(&row)?)),
            None => Ok(None),
        }
    }

    async fn ensure_workload(
        &self,
        owner_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<UserWorkloadRecord, DatabaseError> {
        let conn = self.connect().await?;
        conn.execute(
            "INSERT OR IGNORE INTO user_workloads (owner_id, created_at, updated_at) \
             VALUES (?1, ?2, ?2)",
            params![owner_id.to_string(), fmt_ts(&now)],
        )
        .await?;
        self.get_workload(owner_id)
            .await?
            .ok_or_else(|| DatabaseError::Query("failed to load workload row".to_string()))
    }

    async fn recompute_workload(
        &self,
        owner_id: Uuid,
        terminal_statuses: &[ContactStatus],
        now: DateTime<Utc>,
    ) -> Result<UserWorkloadRecord, DatabaseError> {
        let conn = self.connect().await?;
        let counts = count_workload(&conn, owner_id, terminal_statuses, now).await?;
        let ts = fmt_ts(&now);
        conn.execute(
            "INSERT INTO user_workloads \
             (owner_id, active_contacts, pending_contacts, overdue_contacts, total_contacts, \
              today_assignments, weekly_assignments, avg_response_time_hours, \
              avg_resolution_time_hours, conversion_rate, last_calculated_at, created_at, \
              updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11, ?11) \
             ON CONFLICT(owner_id) DO UPDATE SET \
               active_contacts = excluded.active_contacts, \
               pending_contacts = excluded.pending_contacts, \
               overdue_contacts = excluded.overdue_contacts, \
               total_contacts = excluded.total_contacts, \
               today_assignments = excluded.today_assignments, \
               weekly_assignments = excluded.weekly_assignments, \
               avg_response_time_hours = excluded.avg_response_time_hours, \
               avg_resolution_time_hours = excluded.avg_resolution_time_hours, \
               conversion_rate = excluded.conversion_rate, \
               last_calculated_at = excluded.last_calculated_at, \
               updated_at = excluded.updated_at",
            params![
                owner_id.to_string(),
                counts.active,
                counts.pending,
                counts.overdue,
                counts.total,
                counts.today,
                counts.weekly,
                counts.avg_response_hours,
                counts.avg_resolution_hours,
                counts.conversion_rate,
                ts.as_str(),
            ],
        )
        .await?;
        self.get_workload(owner_id)
            .await?
            .ok_or_else(|| DatabaseError::Query("failed to load recomputed workload".to_string()))
    }

    async fn update_workload_profile(
        &self,
        owner_id: Uuid,
        input: &WorkloadProfileParams,
        now: DateTime<Utc>,
    ) -> Result<UserWorkloadRecord, DatabaseError> {
        let existing = self.ensure_workload(owner_id, now).await?;
        let is_available = input.is_available.unwrap_or(existing.is_available);
        let max_daily = input
            .max_daily_assignments
            .unwrap_or(existing.max_daily_assignments);
        let max_active = input
            .max_active_contacts
            .unwrap_or(existing.max_active_contacts);
        let skills = input.skills.clone().unwrap_or(existing.skills);
        let territories = input.territories.clone().unwrap_or(existing.territories);
        let contact_types = input.contact_types.clone().unwrap_or(existing.contact_types);

        let conn = self.connect().await?;
        conn.execute(
            "UPDATE user_workloads SET \
               is_available = ?2, \
               max_daily_assignments = ?3, \
               max_active_contacts = ?4, \
               skills = ?5, \
               territories = ?6, \
               contact_types = ?7, \
               updated_at = ?8 \
             WHERE owner_id = ?1",
            params![
                owner_id.to_string(),
                i64::from(is_available),
                opt_i64(max_daily),
                opt_i64(max_active),
                to_json_text(&skills)?,
                to_json_text(&territories)?,
                to_json_text(&contact_types)?,
                fmt_ts(&now),
            ],
        )
        .await?;
        self.get_workload(owner_id)
            .await?
            .ok_or_else(|| DatabaseError::Query("failed to load workload row".to_string()))
    }

    async fn list_workload_owner_ids(&self) -> Result<Vec<Uuid>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT owner_id FROM user_workloads \
                 UNION \
                 SELECT assigned_to FROM contacts WHERE assigned_to IS NOT NULL \
                 ORDER BY 1",
                (),
            )
            .await?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(parse_uuid(&get_text(&row, 0), "workload.owner_id")?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use uuid::Uuid;

    use crate::db::libsql::test_support::setup_backend;
    use crate::db::{
        AssignmentProgress, AssignmentRuleStore, AssignmentStatus, AssignmentStore,
        AssignmentStrategy, AssignmentType, CommitOutcome, ContactDirectory, ContactPriority,
        ContactStatus, CreateAssignmentRuleParams, HistoryChangeType, NewAssignment, RuleStatus,
        UpdateAssignmentRuleParams, UpsertContactParams, WindowReservation,
        WorkloadProfileParams, WorkloadStore,
    };
    use crate::rules::{BusinessHours, BusinessHoursSpec, Condition, Operator};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap()
    }

    fn manual(contact_id: Uuid, owner_id: Uuid) -> NewAssignment {
        NewAssignment {
            contact_id,
            owner_id,
            assigned_by: None,
            rule_id: None,
            assignment_type: AssignmentType::Manual,
            reason: "test".to_string(),
            priority: ContactPriority::Medium,
            reservations: Vec::new(),
        }
    }

    fn committed(outcome: CommitOutcome) -> crate::db::CommittedAssignment {
        match outcome {
            CommitOutcome::Committed(done) => done,
            CommitOutcome::RateLimited { window_key } => panic!("unexpected limit {window_key}"),
        }
    }

    #[tokio::test]
    async fn rule_round_trip_preserves_conditions_hours_and_limits() {
        let fixture = setup_backend().await;
        let db = &fixture.backend;
        let owner = Uuid::new_v4();

        let mut params = CreateAssignmentRuleParams::new(
            "West coast",
            AssignmentStrategy::GeographyBased,
            vec![owner],
        );
        params.priority = 7;
        params.conditions = vec![Condition::new("state", Operator::Equals, "CA".into())];
        params.max_assignments_per_hour = Some(5);
        params.business_hours = Some(
            BusinessHours::from_spec(&BusinessHoursSpec {
                start: "08:00".to_string(),
                end: "18:00".to_string(),
                working_days: vec!["mon".to_string(), "fri".to_string()],
                timezone: "-08:00".to_string(),
            })
            .expect("hours"),
        );
        let rule = db.create_assignment_rule(&params, t0()).await.expect("create");
        assert_eq!(rule.assignee_ids, vec![owner]);
        assert_eq!(rule.conditions, params.conditions);
        assert_eq!(rule.business_hours, params.business_hours);
        assert_eq!(rule.max_assignments_per_hour, Some(5));
        assert_eq!(rule.max_assignments_per_day, None);

        let updated = db
            .update_assignment_rule(
                rule.id,
                &UpdateAssignmentRuleParams {
                    max_assignments_per_hour: Some(None),
                    business_hours: Some(None),
                    ..Default::default()
                },
                t0(),
            )
            .await
            .expect("update")
            .expect("exists");
        assert_eq!(updated.max_assignments_per_hour, None);
        assert!(updated.business_hours.is_none());
        assert_eq!(updated.priority, 7);

        assert!(
            db.set_assignment_rule_status(rule.id, RuleStatus::Paused, t0())
                .await
                .expect("pause")
        );
        assert!(db.list_active_assignment_rules().await.expect("list").is_empty());
        assert!(db.delete_assignment_rule(rule.id).await.expect("delete"));
    }

    #[tokio::test]
    async fn active_rules_order_by_priority_then_creation() {
        let fixture = setup_backend().await;
        let db = &fixture.backend;
        let mut low = CreateAssignmentRuleParams::new("low", AssignmentStrategy::LoadBased, vec![]);
        low.priority = 1;
        let mut first_high =
            CreateAssignmentRuleParams::new("high one", AssignmentStrategy::LoadBased, vec![]);
        first_high.priority = 10;
        let mut second_high = first_high.clone();
        second_high.name = "high two".to_string();

        db.create_assignment_rule(&low, t0()).await.expect("low");
        db.create_assignment_rule(&first_high, t0()).await.expect("h1");
        db.create_assignment_rule(&second_high, t0()).await.expect("h2");

        let names = db
            .list_active_assignment_rules()
            .await
            .expect("list")
            .into_iter()
            .map(|rule| rule.name)
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["high one", "high two", "low"]);
    }

    #[tokio::test]
    async fn reassignment_keeps_exactly_one_active_row() {
        let fixture = setup_backend().await;
        let db = &fixture.backend;
        let contact = db
            .upsert_contact(&UpsertContactParams::new("Lee", "Park"), t0())
            .await
            .expect("contact");
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        let first = committed(db.commit_assignment(&manual(contact.id, a), t0()).await.expect("a"));
        assert_eq!(first.history.change_type, HistoryChangeType::Assigned);
        assert_eq!(first.previous_owner_id, None);

        let second = committed(
            db.commit_assignment(&manual(contact.id, b), t0() + Duration::minutes(1))
                .await
                .expect("b"),
        );
        assert_eq!(second.history.change_type, HistoryChangeType::Reassigned);
        assert_eq!(second.history.from_owner_id, Some(a));
        assert_eq!(second.history.to_owner_id, Some(b));

        let rows = db.list_assignments_for_contact(contact.id).await.expect("rows");
        let active = rows
            .iter()
            .filter(|row| row.status == AssignmentStatus::Active)
            .count();
        assert_eq!(active, 1);
        assert_eq!(rows[1].status, AssignmentStatus::Reassigned);

        let reloaded = db.get_contact(contact.id).await.expect("get").expect("exists");
        assert_eq!(reloaded.assigned_to, Some(b));
    }

    #[tokio::test]
    async fn window_reservation_rejects_once_full_and_rolls_back() {
        let fixture = setup_backend().await;
        let db = &fixture.backend;
        let rule = db
            .create_assignment_rule(
                &CreateAssignmentRuleParams::new("capped", AssignmentStrategy::RoundRobin, vec![]),
                t0(),
            )
            .await
            .expect("rule");
        let owner = Uuid::new_v4();
        let key = "hour:2026-03-02T10".to_string();

        let mut outcomes = Vec::new();
        for name in ["One", "Two"] {
            let contact = db
                .upsert_contact(&UpsertContactParams::new(name, "Contact"), t0())
                .await
                .expect("contact");
            let mut input = manual(contact.id, owner);
            input.rule_id = Some(rule.id);
            input.reservations = vec![WindowReservation {
                window_key: key.clone(),
                limit: 1,
            }];
            outcomes.push((contact.id, db.commit_assignment(&input, t0()).await.expect("commit")));
        }

        assert!(matches!(outcomes[0].1, CommitOutcome::Committed(_)));
        assert!(matches!(outcomes[1].1, CommitOutcome::RateLimited { .. }));
        assert!(
            db.get_active_assignment(outcomes[1].0)
                .await
                .expect("lookup")
                .is_none()
        );
        assert_eq!(
            db.rule_window_counts(rule.id, &[key, "day:2026-03-02".to_string()])
                .await
                .expect("counts"),
            vec![1, 0]
        );
        let rule = db.get_assignment_rule(rule.id).await.expect("get").expect("rule");
        assert_eq!(rule.total_assignments, 1);
    }

    #[tokio::test]
    async fn bulk_commit_skips_missing_contacts_and_commits_the_rest() {
        let fixture = setup_backend().await;
        let db = &fixture.backend;
        let owner = Uuid::new_v4();
        let existing = db
            .upsert_contact(&UpsertContactParams::new("Kept", "Contact"), t0())
            .await
            .expect("contact");
        let inputs = vec![manual(existing.id, owner), manual(Uuid::new_v4(), owner)];

        let outcome = db.commit_assignments(&inputs, t0()).await.expect("bulk");
        assert_eq!(outcome.committed.len(), 1);
        assert_eq!(outcome.failures.len(), 1);
        assert!(db.get_active_assignment(existing.id).await.expect("get").is_some());

        let none = db
            .commit_assignments(&[manual(Uuid::new_v4(), owner)], t0())
            .await
            .expect("bulk");
        assert!(none.committed.is_empty());
        assert_eq!(none.failures.len(), 1);
    }

    #[tokio::test]
    async fn unassign_clears_contact_and_logs_history() {
        let fixture = setup_backend().await;
        let db = &fixture.backend;
        let owner = Uuid::new_v4();
        let contact = db
            .upsert_contact(&UpsertContactParams::new("Ivy", "Cole"), t0())
            .await
            .expect("contact");
        assert!(
            db.unassign_contact(contact.id, None, "nothing", t0())
                .await
                .expect("noop")
                .is_none()
        );

        db.commit_assignment(&manual(contact.id, owner), t0())
            .await
            .expect("assign");
        let (assignment, history) = db
            .unassign_contact(contact.id, None, "left team", t0())
            .await
            .expect("unassign")
            .expect("had assignment");
        assert_eq!(assignment.status, AssignmentStatus::Unassigned);
        assert_eq!(history.change_type, HistoryChangeType::Unassigned);
        assert_eq!(history.to_owner_id, None);

        let reloaded = db.get_contact(contact.id).await.expect("get").expect("exists");
        assert!(reloaded.assigned_to.is_none());
        assert_eq!(db.list_assignment_history(contact.id).await.expect("history").len(), 2);
    }

    #[tokio::test]
    async fn recompute_counts_load_response_and_conversion() {
        let fixture = setup_backend().await;
        let db = &fixture.backend;
        let owner = Uuid::new_v4();
        let now = t0();

        let mut assignment_ids = Vec::new();
        for (name, status, followup) in [
            ("New", ContactStatus::New, None),
            ("Late", ContactStatus::Contacted, Some(now - Duration::days(1))),
            ("Won", ContactStatus::ClosedWon, Some(now - Duration::days(1))),
            ("Lost", ContactStatus::ClosedLost, None),
        ] {
            let mut input = UpsertContactParams::new(name, "Contact");
            input.status = status;
            input.next_followup_at = followup;
            let contact = db.upsert_contact(&input, now).await.expect("contact");
            let done = committed(
                db.commit_assignment(&manual(contact.id, owner), now - Duration::hours(4))
                    .await
                    .expect("assign"),
            );
            assignment_ids.push(done.assignment.id);
        }
        db.record_assignment_progress(
            assignment_ids[0],
            AssignmentProgress::FirstResponse,
            now - Duration::hours(2),
        )
        .await
        .expect("progress");
        let completed = db
            .record_assignment_progress(assignment_ids[1], AssignmentProgress::Completed, now)
            .await
            .expect("progress")
            .expect("exists");
        assert_eq!(completed.status, AssignmentStatus::Completed);

        db.update_workload_profile(
            owner,
            &WorkloadProfileParams {
                skills: Some(vec!["enterprise".to_string()]),
                max_active_contacts: Some(Some(10)),
                ..Default::default()
            },
            now,
        )
        .await
        .expect("profile");

        let workload = db
            .recompute_workload(owner, &[ContactStatus::ClosedWon, ContactStatus::ClosedLost], now)
            .await
            .expect("recompute");
        assert_eq!(workload.total_contacts, 4);
        assert_eq!(workload.active_contacts, 2);
        assert_eq!(workload.pending_contacts, 1);
        assert_eq!(workload.overdue_contacts, 1);
        assert_eq!(workload.today_assignments, 4);
        assert_eq!(workload.weekly_assignments, 4);
        assert!((workload.avg_response_time_hours - 2.0).abs() < 1e-9);
        assert!((workload.avg_resolution_time_hours - 4.0).abs() < 1e-9);
        assert!((workload.conversion_rate - 0.5).abs() < 1e-9);
        assert_eq!(workload.skills, vec!["enterprise".to_string()]);
        assert_eq!(workload.max_active_contacts, Some(10));
        assert_eq!(workload.last_calculated_at, Some(now));

        assert_eq!(db.list_workload_owner_ids().await.expect("ids"), vec![owner]);
    }
}
