use std::str::FromStr;

use chrono::{DateTime, Utc};
use libsql::params;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::db::{
    ContactDirectory, ContactPriority, ContactRecord, ContactStatus, OwnerDirectory, OwnerRecord,
    UpsertContactParams, UpsertOwnerParams,
};
use crate::error::DatabaseError;

use super::{
    LibSqlBackend, fmt_ts, get_bool, get_i32, get_opt_text, get_text, opt_text, opt_text_owned,
    opt_ts, opt_uuid, parse_dt, parse_dt_opt, parse_opt_uuid, parse_uuid, placeholders,
};

pub(crate) const CONTACT_COLUMNS: &str = "id, first_name, last_name, email, phone, company, \
     contact_type_id, contact_source_id, priority, status, lead_score, estimated_value, country, \
     state, city, utm_source, utm_medium, utm_campaign, email_opened, email_clicked, \
     total_interactions, next_followup_at, custom_fields, assigned_to, assigned_at, created_at, \
     updated_at";

const OWNER_COLUMNS: &str = "id, name, email, role, is_active, created_at, updated_at";

fn parse_priority(raw: &str) -> Result<ContactPriority, DatabaseError> {
    ContactPriority::from_db_value(raw)
        .ok_or_else(|| DatabaseError::Serialization(format!("invalid contact priority '{raw}'")))
}

pub(crate) fn parse_status(raw: &str) -> Result<ContactStatus, DatabaseError> {
    ContactStatus::from_db_value(raw)
        .ok_or_else(|| DatabaseError::Serialization(format!("invalid contact status '{raw}'")))
}

fn parse_decimal_opt(raw: Option<String>) -> Result<Option<Decimal>, DatabaseError> {
    raw.filter(|value| !value.trim().is_empty())
        .map(|value| {
            Decimal::from_str(value.trim()).map_err(|e| {
                DatabaseError::Serialization(format!("invalid estimated_value '{value}': {e}"))
            })
        })
        .transpose()
}

fn parse_custom_fields(raw: &str) -> Result<serde_json::Value, DatabaseError> {
    if raw.trim().is_empty() {
        return Ok(serde_json::json!({}));
    }
    let value: serde_json::Value =
        serde_json::from_str(raw).map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    if value.is_object() {
        Ok(value)
    } else {
        Ok(serde_json::json!({}))
    }
}

pub(crate) fn row_to_contact_record(row: &libsql::Row) -> Result<ContactRecord, DatabaseError> {
    Ok(ContactRecord {
        id: parse_uuid(&get_text(row, 0), "contact.id")?,
        first_name: get_text(row, 1),
        last_name: get_text(row, 2),
        email: get_opt_text(row, 3),
        phone: get_opt_text(row, 4),
        company: get_opt_text(row, 5),
        contact_type_id: get_opt_text(row, 6),
        contact_source_id: get_opt_text(row, 7),
        priority: parse_priority(&get_text(row, 8))?,
        status: parse_status(&get_text(row, 9))?,
        lead_score: get_i32(row, 10)?,
        estimated_value: parse_decimal_opt(get_opt_text(row, 11))?,
        country: get_opt_text(row, 12),
        state: get_opt_text(row, 13),
        city: get_opt_text(row, 14),
        utm_source: get_opt_text(row, 15),
        utm_medium: get_opt_text(row, 16),
        utm_campaign: get_opt_text(row, 17),
        email_opened: get_bool(row, 18),
        email_clicked: get_bool(row, 19),
        total_interactions: get_i32(row, 20)?,
        next_followup_at: parse_dt_opt(get_opt_text(row, 21))?,
        custom_fields: parse_custom_fields(&get_text(row, 22))?,
        assigned_to: parse_opt_uuid(get_opt_text(row, 23), "contact.assigned_to")?,
        assigned_at: parse_dt_opt(get_opt_text(row, 24))?,
        created_at: parse_dt(&get_text(row, 25), "contact.created_at")?,
        updated_at: parse_dt(&get_text(row, 26), "contact.updated_at")?,
    })
}

fn row_to_owner_record(row: &libsql::Row) -> Result<OwnerRecord, DatabaseError> {
    Ok(OwnerRecord {
        id: parse_uuid(&get_text(row, 0), "owner.id")?,
        name: get_text(row, 1),
        email: get_opt_text(row, 2),
        role: get_text(row, 3),
        is_active: get_bool(row, 4),
        created_at: parse_dt(&get_text(row, 5), "owner.created_at")?,
        updated_at: parse_dt(&get_text(row, 6), "owner.updated_at")?,
    })
}

#[async_trait::async_trait]
impl ContactDirectory for LibSqlBackend {
    async fn upsert_contact(
        &self,
        input: &UpsertContactParams,
        now: DateTime<Utc>,
    ) -> Result<ContactRecord, DatabaseError> {
        let first_name = input.first_name.trim();
        if first_name.is_empty() {
            return Err(DatabaseError::Serialization(
                "contact first name cannot be empty".to_string(),
            ));
        }
        let custom_fields = input
            .custom_fields
            .clone()
            .unwrap_or_else(|| serde_json::json!({}));
        let ts = fmt_ts(&now);

        let conn = self.connect().await?;
        conn.execute(
            "INSERT INTO contacts \
             (id, first_name, last_name, email, phone, company, contact_type_id, \
              contact_source_id, priority, status, lead_score, estimated_value, country, state, \
              city, utm_source, utm_medium, utm_campaign, email_opened, email_clicked, \
              total_interactions, next_followup_at, custom_fields, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, \
                     ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?24) \
             ON CONFLICT(id) DO UPDATE SET \
               first_name = excluded.first_name, \
               last_name = excluded.last_name, \
               email = excluded.email, \
               phone = excluded.phone, \
               company = excluded.company, \
               contact_type_id = excluded.contact_type_id, \
               contact_source_id = excluded.contact_source_id, \
               priority = excluded.priority, \
               status = excluded.status, \
               lead_score = excluded.lead_score, \
               estimated_value = excluded.estimated_value, \
               country = excluded.country, \
               state = excluded.state, \
               city = excluded.city, \
               utm_source = excluded.utm_source, \
               utm_medium = excluded.utm_medium, \
               utm_campaign = excluded.utm_campaign, \
               email_opened = excluded.email_opened, \
               email_clicked = excluded.email_clicked, \
               total_interactions = excluded.total_interactions, \
               next_followup_at = excluded.next_followup_at, \
               custom_fields = excluded.custom_fields, \
               updated_at = excluded.updated_at",
            params![
                input.id.to_string(),
                first_name,
                input.last_name.trim(),
                opt_text(input.email.as_deref()),
                opt_text(input.phone.as_deref()),
                opt_text(input.company.as_deref()),
                opt_text(input.contact_type_id.as_deref()),
                opt_text(input.contact_source_id.as_deref()),
                input.priority.as_str(),
                input.status.as_str(),
                i64::from(input.lead_score),
                opt_text_owned(input.estimated_value.map(|v| v.to_string())),
                opt_text(input.country.as_deref()),
                opt_text(input.state.as_deref()),
                opt_text(input.city.as_deref()),
                opt_text(input.utm_source.as_deref()),
                opt_text(input.utm_medium.as_deref()),
                opt_text(input.utm_campaign.as_deref()),
                i64::from(input.email_opened),
                i64::from(input.email_clicked),
                i64::from(input.total_interactions),
                opt_ts(input.next_followup_at),
                custom_fields.to_string(),
                ts.as_str(),
            ],
        )
        .await?;

        self.get_contact(input.id)
            .await?
            .ok_or_else(|| DatabaseError::Query("failed to load upserted contact".to_string()))
    }

    async fn get_contact(&self, contact_id: Uuid) -> Result<Option<ContactRecord>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE id = ?1 LIMIT 1"),
                params![contact_id.to_string()],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_contact_record(&row)?)),
            None => Ok(None),
        }
    }

    async fn delete_contact(&self, contact_id: Uuid) -> Result<bool, DatabaseError> {
        let conn = self.connect().await?;
        let deleted = conn
            .execute(
                "DELETE FROM contacts WHERE id = ?1",
                params![contact_id.to_string()],
            )
            .await?;
        Ok(deleted > 0)
    }

    async fn set_contact_lead_score(
        &self,
        contact_id: Uuid,
        score: i32,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let conn = self.connect().await?;
        let updated = conn
            .execute(
                "UPDATE contacts SET lead_score = ?2, updated_at = ?3 WHERE id = ?1",
                params![contact_id.to_string(), i64::from(score), fmt_ts(&now)],
            )
            .await?;
        Ok(updated > 0)
    }
}

#[async_trait::async_trait]
impl OwnerDirectory for LibSqlBackend {
    async fn upsert_owner(
        &self,
        input: &UpsertOwnerParams,
        now: DateTime<Utc>,
    ) -> Result<OwnerRecord, DatabaseError> {
        let name = input.name.trim();
        if name.is_empty() {
            return Err(DatabaseError::Serialization(
                "owner name cannot be empty".to_string(),
            ));
        }
        let conn = self.connect().await?;
        conn.execute(
            "INSERT INTO owners (id, name, email, role, is_active, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6) \
             ON CONFLICT(id) DO UPDATE SET \
               name = excluded.name, \
               email = excluded.email, \
               role = excluded.role, \
               is_active = excluded.is_active, \
               updated_at = excluded.updated_at",
            params![
                input.id.to_string(),
                name,
                opt_text(input.email.as_deref()),
                input.role.trim().to_ascii_lowercase(),
                i64::from(input.is_active),
                fmt_ts(&now),
            ],
        )
        .await?;

        self.get_owner(input.id)
            .await?
            .ok_or_else(|| DatabaseError::Query("failed to load upserted owner".to_string()))
    }

    async fn get_owner(&self, owner_id: Uuid) -> Result<Option<OwnerRecord>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {OWNER_COLUMNS} FROM owners WHERE id = ?1 LIMIT 1"),
                params![owner_id.to_string()],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_owner_record(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_active_owners_with_roles(
        &self,
        roles: &[String],
    ) -> Result<Vec<OwnerRecord>, DatabaseError> {
        if roles.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {OWNER_COLUMNS} FROM owners \
             WHERE is_active = 1 AND lower(role) IN ({}) \
             ORDER BY created_at ASC, rowid ASC",
            placeholders(1, roles.len())
        );
        let values = roles
            .iter()
            .map(|role| libsql::Value::Text(role.trim().to_ascii_lowercase()))
            .collect::<Vec<_>>();

        let conn = self.connect().await?;
        let mut rows = conn
            .query(&sql, libsql::params::Params::Positional(values))
            .await?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(row_to_owner_record(&row)?);
        }
        Ok(out)
    }
}
