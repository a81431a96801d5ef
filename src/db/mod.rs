//! Database abstraction layer.
//!
//! Provides a backend-agnostic `Database` trait that unifies every
//! persistence operation the routing and lifecycle engines need. Engine
//! components receive an `Arc<dyn Database>` at construction; leaf consumers
//! can depend on a single sub-trait instead.
//!
//! Writes that must be atomic (assignment commits, status changes, scoring
//! results) are exposed as coarse-grained methods so each backend can wrap
//! them in one transaction.

#[cfg(feature = "libsql")]
pub mod libsql;

#[cfg(feature = "libsql")]
pub mod libsql_migrations;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::rules::{BusinessHours, Condition, ScoringCriterion};

/// Create a database backend from configuration, run migrations, and return it.
pub async fn connect_from_config(
    config: &crate::config::DatabaseConfig,
) -> Result<Arc<dyn Database>, DatabaseError> {
    match config.backend {
        #[cfg(feature = "libsql")]
        crate::config::DatabaseBackend::LibSql => {
            use secrecy::ExposeSecret as _;

            let db_path = config.local_path();
            let backend = if let Some(ref url) = config.libsql_url {
                let token = config.libsql_auth_token.as_ref().ok_or_else(|| {
                    DatabaseError::Pool(
                        "LIBSQL_AUTH_TOKEN required when LIBSQL_URL is set".to_string(),
                    )
                })?;
                libsql::LibSqlBackend::new_remote_replica(&db_path, url, token.expose_secret())
                    .await?
            } else {
                libsql::LibSqlBackend::new_local(&db_path).await?
            };
            backend.run_migrations().await?;
            Ok(Arc::new(backend))
        }
        #[cfg(not(feature = "libsql"))]
        _ => Err(DatabaseError::Pool(
            "No database backend available. Enable the 'libsql' feature.".to_string(),
        )),
    }
}

/// Sales status of a contact. Independent of the score-derived stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContactStatus {
    #[default]
    New,
    Contacted,
    Qualified,
    Proposal,
    Negotiation,
    ClosedWon,
    ClosedLost,
    OnHold,
    Nurturing,
}

impl ContactStatus {
    pub const ALL: [ContactStatus; 9] = [
        Self::New,
        Self::Contacted,
        Self::Qualified,
        Self::Proposal,
        Self::Negotiation,
        Self::ClosedWon,
        Self::ClosedLost,
        Self::OnHold,
        Self::Nurturing,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Contacted => "contacted",
            Self::Qualified => "qualified",
            Self::Proposal => "proposal",
            Self::Negotiation => "negotiation",
            Self::ClosedWon => "closed_won",
            Self::ClosedLost => "closed_lost",
            Self::OnHold => "on_hold",
            Self::Nurturing => "nurturing",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "new" => Some(Self::New),
            "contacted" => Some(Self::Contacted),
            "qualified" => Some(Self::Qualified),
            "proposal" => Some(Self::Proposal),
            "negotiation" => Some(Self::Negotiation),
            "closed_won" => Some(Self::ClosedWon),
            "closed_lost" => Some(Self::ClosedLost),
            "on_hold" => Some(Self::OnHold),
            "nurturing" => Some(Self::Nurturing),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContactPriority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

impl ContactPriority {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "urgent" => Some(Self::Urgent),
            _ => None,
        }
    }
}

/// Owner-selection algorithm of an assignment rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStrategy {
    RoundRobin,
    LoadBased,
    SkillBased,
    #[serde(alias = "geography")]
    GeographyBased,
    ValueBased,
    Custom,
}

impl AssignmentStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::LoadBased => "load_based",
            Self::SkillBased => "skill_based",
            Self::GeographyBased => "geography_based",
            Self::ValueBased => "value_based",
            Self::Custom => "custom",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "round_robin" => Some(Self::RoundRobin),
            "load_based" => Some(Self::LoadBased),
            "skill_based" => Some(Self::SkillBased),
            "geography_based" | "geography" => Some(Self::GeographyBased),
            "value_based" => Some(Self::ValueBased),
            "custom" => Some(Self::Custom),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleStatus {
    Active,
    Inactive,
    Paused,
}

impl RuleStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Paused => "paused",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "inactive" => Some(Self::Inactive),
            "paused" => Some(Self::Paused),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentType {
    Automatic,
    Manual,
}

impl AssignmentType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Automatic => "automatic",
            Self::Manual => "manual",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "automatic" => Some(Self::Automatic),
            "manual" => Some(Self::Manual),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    Active,
    Reassigned,
    Unassigned,
    Completed,
}

impl AssignmentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Reassigned => "reassigned",
            Self::Unassigned => "unassigned",
            Self::Completed => "completed",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "reassigned" => Some(Self::Reassigned),
            "unassigned" => Some(Self::Unassigned),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryChangeType {
    Assigned,
    Reassigned,
    Unassigned,
}

impl HistoryChangeType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Assigned => "assigned",
            Self::Reassigned => "reassigned",
            Self::Unassigned => "unassigned",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "assigned" => Some(Self::Assigned),
            "reassigned" => Some(Self::Reassigned),
            "unassigned" => Some(Self::Unassigned),
            _ => None,
        }
    }
}

/// Milestone reached on an assignment after it was made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentProgress {
    Accepted,
    FirstResponse,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoringCategory {
    Demographic,
    Behavioral,
    Engagement,
    Firmographic,
}

impl ScoringCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Demographic => "demographic",
            Self::Behavioral => "behavioral",
            Self::Engagement => "engagement",
            Self::Firmographic => "firmographic",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "demographic" => Some(Self::Demographic),
            "behavioral" => Some(Self::Behavioral),
            "engagement" => Some(Self::Engagement),
            "firmographic" => Some(Self::Firmographic),
            _ => None,
        }
    }
}

/// Score-derived funnel position.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStage {
    #[default]
    Unknown,
    Suspect,
    Prospect,
    MarketingQualifiedLead,
    SalesQualifiedLead,
    Opportunity,
    Customer,
    Evangelist,
    Other,
}

impl LifecycleStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Suspect => "suspect",
            Self::Prospect => "prospect",
            Self::MarketingQualifiedLead => "marketing_qualified_lead",
            Self::SalesQualifiedLead => "sales_qualified_lead",
            Self::Opportunity => "opportunity",
            Self::Customer => "customer",
            Self::Evangelist => "evangelist",
            Self::Other => "other",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "unknown" => Some(Self::Unknown),
            "suspect" => Some(Self::Suspect),
            "prospect" => Some(Self::Prospect),
            "marketing_qualified_lead" => Some(Self::MarketingQualifiedLead),
            "sales_qualified_lead" => Some(Self::SalesQualifiedLead),
            "opportunity" => Some(Self::Opportunity),
            "customer" => Some(Self::Customer),
            "evangelist" => Some(Self::Evangelist),
            "other" => Some(Self::Other),
            _ => None,
        }
    }

    /// Position in the funnel; `Other` sits outside it at rank 0.
    pub fn rank(self) -> u8 {
        match self {
            Self::Unknown | Self::Other => 0,
            Self::Suspect => 1,
            Self::Prospect => 2,
            Self::MarketingQualifiedLead => 3,
            Self::SalesQualifiedLead => 4,
            Self::Opportunity => 5,
            Self::Customer => 6,
            Self::Evangelist => 7,
        }
    }
}

/// How a lifecycle change was initiated. Also the type of a transition rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Automatic,
    Manual,
    Scheduled,
    Triggered,
}

impl TriggerType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Automatic => "automatic",
            Self::Manual => "manual",
            Self::Scheduled => "scheduled",
            Self::Triggered => "triggered",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "automatic" => Some(Self::Automatic),
            "manual" => Some(Self::Manual),
            "scheduled" => Some(Self::Scheduled),
            "triggered" => Some(Self::Triggered),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEventType {
    ScoreChange,
    StatusChange,
    StageChange,
    Milestone,
}

impl LifecycleEventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ScoreChange => "score_change",
            Self::StatusChange => "status_change",
            Self::StageChange => "stage_change",
            Self::Milestone => "milestone",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "score_change" => Some(Self::ScoreChange),
            "status_change" => Some(Self::StatusChange),
            "stage_change" => Some(Self::StageChange),
            "milestone" => Some(Self::Milestone),
            _ => None,
        }
    }
}

/// Contact as supplied by the CRM. Only `assigned_to`, `assigned_at`,
/// `lead_score` and `status` are ever written by the engines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactRecord {
    pub id: Uuid,
    pub first_name: String,
    pub last_name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub company: Option<String>,
    pub contact_type_id: Option<String>,
    pub contact_source_id: Option<String>,
    pub priority: ContactPriority,
    pub status: ContactStatus,
    pub lead_score: i32,
    pub estimated_value: Option<Decimal>,
    pub country: Option<String>,
    pub state: Option<String>,
    pub city: Option<String>,
    pub utm_source: Option<String>,
    pub utm_medium: Option<String>,
    pub utm_campaign: Option<String>,
    pub email_opened: bool,
    pub email_clicked: bool,
    pub total_interactions: i32,
    pub next_followup_at: Option<DateTime<Utc>>,
    pub custom_fields: serde_json::Value,
    pub assigned_to: Option<Uuid>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct UpsertContactParams {
    pub id: Uuid,
    pub first_name: String,
    pub last_name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub company: Option<String>,
    pub contact_type_id: Option<String>,
    pub contact_source_id: Option<String>,
    pub priority: ContactPriority,
    pub status: ContactStatus,
    pub lead_score: i32,
    pub estimated_value: Option<Decimal>,
    pub country: Option<String>,
    pub state: Option<String>,
    pub city: Option<String>,
    pub utm_source: Option<String>,
    pub utm_medium: Option<String>,
    pub utm_campaign: Option<String>,
    pub email_opened: bool,
    pub email_clicked: bool,
    pub total_interactions: i32,
    pub next_followup_at: Option<DateTime<Utc>>,
    pub custom_fields: Option<serde_json::Value>,
}

impl UpsertContactParams {
    pub fn new(first_name: impl Into<String>, last_name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            first_name: first_name.into(),
            last_name: last_name.into(),
            ..Self::default()
        }
    }
}

/// Member of the owner directory (sales reps, managers, admins).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OwnerRecord {
    pub id: Uuid,
    pub name: String,
    pub email: Option<String>,
    pub role: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct UpsertOwnerParams {
    pub id: Uuid,
    pub name: String,
    pub email: Option<String>,
    pub role: String,
    pub is_active: bool,
}

impl UpsertOwnerParams {
    pub fn new(name: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            email: None,
            role: role.into(),
            is_active: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignmentRuleRecord {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub strategy: AssignmentStrategy,
    pub status: RuleStatus,
    pub priority: i32,
    pub conditions: Vec<Condition>,
    pub assignee_ids: Vec<Uuid>,
    pub fallback_owner_id: Option<Uuid>,
    pub business_hours: Option<BusinessHours>,
    pub max_assignments_per_hour: Option<u32>,
    pub max_assignments_per_day: Option<u32>,
    pub total_assignments: i64,
    pub successful_assignments: i64,
    pub last_assignment_at: Option<DateTime<Utc>>,
    pub created_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateAssignmentRuleParams {
    pub name: String,
    pub description: Option<String>,
    pub strategy: AssignmentStrategy,
    pub status: RuleStatus,
    pub priority: i32,
    pub conditions: Vec<Condition>,
    pub assignee_ids: Vec<Uuid>,
    pub fallback_owner_id: Option<Uuid>,
    pub business_hours: Option<BusinessHours>,
    pub max_assignments_per_hour: Option<u32>,
    pub max_assignments_per_day: Option<u32>,
    pub created_by: Option<Uuid>,
}

impl CreateAssignmentRuleParams {
    pub fn new(name: impl Into<String>, strategy: AssignmentStrategy, pool: Vec<Uuid>) -> Self {
        Self {
            name: name.into(),
            description: None,
            strategy,
            status: RuleStatus::Active,
            priority: 0,
            conditions: Vec::new(),
            assignee_ids: pool,
            fallback_owner_id: None,
            business_hours: None,
            max_assignments_per_hour: None,
            max_assignments_per_day: None,
            created_by: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct UpdateAssignmentRuleParams {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
    pub strategy: Option<AssignmentStrategy>,
    pub status: Option<RuleStatus>,
    pub priority: Option<i32>,
    pub conditions: Option<Vec<Condition>>,
    pub assignee_ids: Option<Vec<Uuid>>,
    pub fallback_owner_id: Option<Option<Uuid>>,
    pub business_hours: Option<Option<BusinessHours>>,
    pub max_assignments_per_hour: Option<Option<u32>>,
    pub max_assignments_per_day: Option<Option<u32>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactAssignmentRecord {
    pub id: Uuid,
    pub contact_id: Uuid,
    pub owner_id: Uuid,
    pub assigned_by: Option<Uuid>,
    pub rule_id: Option<Uuid>,
    pub assignment_type: AssignmentType,
    pub reason: String,
    pub priority: ContactPriority,
    pub status: AssignmentStatus,
    pub accepted_at: Option<DateTime<Utc>>,
    pub first_response_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Rate-limit bucket a commit must reserve a slot in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowReservation {
    pub window_key: String,
    pub limit: u32,
}

/// Everything needed to write one assignment atomically.
#[derive(Debug, Clone)]
pub struct NewAssignment {
    pub contact_id: Uuid,
    pub owner_id: Uuid,
    pub assigned_by: Option<Uuid>,
    pub rule_id: Option<Uuid>,
    pub assignment_type: AssignmentType,
    pub reason: String,
    pub priority: ContactPriority,
    pub reservations: Vec<WindowReservation>,
}

#[derive(Debug, Clone)]
pub struct CommittedAssignment {
    pub assignment: ContactAssignmentRecord,
    pub previous_owner_id: Option<Uuid>,
    pub history: AssignmentHistoryRecord,
}

#[derive(Debug, Clone)]
pub enum CommitOutcome {
    Committed(CommittedAssignment),
    /// A window reservation failed; nothing was written.
    RateLimited { window_key: String },
}

/// Result of a multi-contact commit. Empty `committed` means it rolled back.
#[derive(Debug)]
pub struct BulkCommitOutcome {
    pub committed: Vec<CommittedAssignment>,
    pub failures: Vec<(Uuid, DatabaseError)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignmentHistoryRecord {
    pub id: Uuid,
    pub contact_id: Uuid,
    pub from_owner_id: Option<Uuid>,
    pub to_owner_id: Option<Uuid>,
    pub changed_by: Option<Uuid>,
    pub rule_id: Option<Uuid>,
    pub change_type: HistoryChangeType,
    pub reason: String,
    pub previous_status: Option<AssignmentStatus>,
    pub new_status: Option<AssignmentStatus>,
    pub created_at: DateTime<Utc>,
}

/// Recomputed load counters and routing profile for one owner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserWorkloadRecord {
    pub owner_id: Uuid,
    pub active_contacts: i64,
    pub pending_contacts: i64,
    pub overdue_contacts: i64,
    pub total_contacts: i64,
    pub today_assignments: i64,
    pub weekly_assignments: i64,
    pub avg_response_time_hours: f64,
    pub avg_resolution_time_hours: f64,
    pub conversion_rate: f64,
    pub is_available: bool,
    pub max_daily_assignments: Option<i64>,
    pub max_active_contacts: Option<i64>,
    pub skills: Vec<String>,
    pub territories: Vec<String>,
    pub contact_types: Vec<String>,
    pub last_calculated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserWorkloadRecord {
    /// Zero-load, available row for an owner without history.
    pub fn empty(owner_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            owner_id,
            active_contacts: 0,
            pending_contacts: 0,
            overdue_contacts: 0,
            total_contacts: 0,
            today_assignments: 0,
            weekly_assignments: 0,
            avg_response_time_hours: 0.0,
            avg_resolution_time_hours: 0.0,
            conversion_rate: 0.0,
            is_available: true,
            max_daily_assignments: None,
            max_active_contacts: None,
            skills: Vec::new(),
            territories: Vec::new(),
            contact_types: Vec::new(),
            last_calculated_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct WorkloadProfileParams {
    pub is_available: Option<bool>,
    pub max_daily_assignments: Option<Option<i64>>,
    pub max_active_contacts: Option<Option<i64>>,
    pub skills: Option<Vec<String>>,
    pub territories: Option<Vec<String>>,
    pub contact_types: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeadScoringRuleRecord {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub category: ScoringCategory,
    pub base_score: i32,
    pub max_score: i32,
    pub criteria: Vec<ScoringCriterion>,
    pub applicable_when: Vec<Condition>,
    pub is_active: bool,
    pub priority: i32,
    pub times_applied: i64,
    pub last_applied_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateScoringRuleParams {
    pub name: String,
    pub description: Option<String>,
    pub category: ScoringCategory,
    pub base_score: i32,
    pub max_score: i32,
    pub criteria: Vec<ScoringCriterion>,
    pub applicable_when: Vec<Condition>,
    pub is_active: bool,
    pub priority: i32,
}

impl CreateScoringRuleParams {
    pub fn new(
        name: impl Into<String>,
        category: ScoringCategory,
        criteria: Vec<ScoringCriterion>,
    ) -> Self {
        Self {
            name: name.into(),
            description: None,
            category,
            base_score: 0,
            max_score: 100,
            criteria,
            applicable_when: Vec::new(),
            is_active: true,
            priority: 0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct UpdateScoringRuleParams {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
    pub category: Option<ScoringCategory>,
    pub base_score: Option<i32>,
    pub max_score: Option<i32>,
    pub criteria: Option<Vec<ScoringCriterion>>,
    pub applicable_when: Option<Vec<Condition>>,
    pub is_active: Option<bool>,
    pub priority: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusTransitionRuleRecord {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub from_status: ContactStatus,
    pub to_status: ContactStatus,
    pub transition_type: TriggerType,
    pub conditions: Vec<Condition>,
    pub required_score: i32,
    pub days_in_status: i32,
    pub actions: serde_json::Value,
    pub notify_owner_ids: Vec<Uuid>,
    pub is_active: bool,
    pub priority: i32,
    pub times_triggered: i64,
    pub last_triggered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateTransitionRuleParams {
    pub name: String,
    pub description: Option<String>,
    pub from_status: ContactStatus,
    pub to_status: ContactStatus,
    pub transition_type: TriggerType,
    pub conditions: Vec<Condition>,
    pub required_score: i32,
    pub days_in_status: i32,
    pub actions: serde_json::Value,
    pub notify_owner_ids: Vec<Uuid>,
    pub is_active: bool,
    pub priority: i32,
}

impl CreateTransitionRuleParams {
    pub fn new(name: impl Into<String>, from: ContactStatus, to: ContactStatus) -> Self {
        Self {
            name: name.into(),
            description: None,
            from_status: from,
            to_status: to,
            transition_type: TriggerType::Automatic,
            conditions: Vec::new(),
            required_score: 0,
            days_in_status: 0,
            actions: serde_json::json!([]),
            notify_owner_ids: Vec::new(),
            is_active: true,
            priority: 0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct UpdateTransitionRuleParams {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
    pub from_status: Option<ContactStatus>,
    pub to_status: Option<ContactStatus>,
    pub transition_type: Option<TriggerType>,
    pub conditions: Option<Vec<Condition>>,
    pub required_score: Option<i32>,
    pub days_in_status: Option<i32>,
    pub actions: Option<serde_json::Value>,
    pub notify_owner_ids: Option<Vec<Uuid>>,
    pub is_active: Option<bool>,
    pub priority: Option<i32>,
}

/// Contribution of one scoring rule to a score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringFactor {
    pub rule_name: String,
    pub category: ScoringCategory,
    pub score: i32,
}

/// Immutable record of one scoring pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreSnapshot {
    pub score: i32,
    pub demographic_score: i32,
    pub behavioral_score: i32,
    pub engagement_score: i32,
    pub firmographic_score: i32,
    pub factors: BTreeMap<String, ScoringFactor>,
    pub reason: String,
    pub scored_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactLifecycleRecord {
    pub id: Uuid,
    pub contact_id: Uuid,
    pub current_stage: LifecycleStage,
    pub current_status: ContactStatus,
    pub current_score: i32,
    pub demographic_score: i32,
    pub behavioral_score: i32,
    pub engagement_score: i32,
    pub firmographic_score: i32,
    pub score_history: Vec<ScoreSnapshot>,
    pub scoring_factors: BTreeMap<String, ScoringFactor>,
    /// Whole days spent in each stage the contact has left.
    pub stage_velocity: BTreeMap<String, i64>,
    pub stage_entered_at: DateTime<Utc>,
    pub status_entered_at: DateTime<Utc>,
    pub last_scored_at: Option<DateTime<Utc>>,
    pub first_engagement_at: Option<DateTime<Utc>>,
    pub qualification_at: Option<DateTime<Utc>>,
    pub opportunity_at: Option<DateTime<Utc>>,
    pub conversion_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ContactLifecycleRecord {
    /// Fresh, never-scored lifecycle seeded from the contact.
    pub fn new_for(contact: &ContactRecord, stage: LifecycleStage, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            contact_id: contact.id,
            current_stage: stage,
            current_status: contact.status,
            current_score: contact.lead_score,
            demographic_score: 0,
            behavioral_score: 0,
            engagement_score: 0,
            firmographic_score: 0,
            score_history: Vec::new(),
            scoring_factors: BTreeMap::new(),
            stage_velocity: BTreeMap::new(),
            stage_entered_at: now,
            status_entered_at: now,
            last_scored_at: None,
            first_engagement_at: None,
            qualification_at: None,
            opportunity_at: None,
            conversion_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewLifecycleEvent {
    pub contact_id: Uuid,
    pub lifecycle_id: Uuid,
    pub event_type: LifecycleEventType,
    pub event_name: String,
    pub description: String,
    pub previous_value: Option<String>,
    pub new_value: Option<String>,
    pub change_amount: Option<i32>,
    pub trigger_type: TriggerType,
    pub trigger_source: String,
    pub trigger_data: serde_json::Value,
    pub triggered_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleEventRecord {
    pub id: Uuid,
    pub contact_id: Uuid,
    pub lifecycle_id: Uuid,
    pub event_type: LifecycleEventType,
    pub event_name: String,
    pub description: String,
    pub previous_value: Option<String>,
    pub new_value: Option<String>,
    pub change_amount: Option<i32>,
    pub trigger_type: TriggerType,
    pub trigger_source: String,
    pub trigger_data: serde_json::Value,
    pub triggered_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// Atomic write of one status change: contact cache, lifecycle row, events,
/// and the firing rule's trigger counter.
#[derive(Debug, Clone)]
pub struct StatusChangeCommit {
    pub lifecycle: ContactLifecycleRecord,
    pub events: Vec<NewLifecycleEvent>,
    pub transition_rule_id: Option<Uuid>,
}

#[async_trait]
pub trait ContactDirectory: Send + Sync {
    async fn upsert_contact(
        &self,
        input: &UpsertContactParams,
        now: DateTime<Utc>,
    ) -> Result<ContactRecord, DatabaseError>;
    async fn get_contact(&self, contact_id: Uuid) -> Result<Option<ContactRecord>, DatabaseError>;
    async fn delete_contact(&self, contact_id: Uuid) -> Result<bool, DatabaseError>;
    /// Write the cached lead score back onto the contact.
    async fn set_contact_lead_score(
        &self,
        contact_id: Uuid,
        score: i32,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;
}

#[async_trait]
pub trait OwnerDirectory: Send + Sync {
    async fn upsert_owner(
        &self,
        input: &UpsertOwnerParams,
        now: DateTime<Utc>,
    ) -> Result<OwnerRecord, DatabaseError>;
    async fn get_owner(&self, owner_id: Uuid) -> Result<Option<OwnerRecord>, DatabaseError>;
    /// Active owners whose role is in `roles`, oldest first.
    async fn list_active_owners_with_roles(
        &self,
        roles: &[String],
    ) -> Result<Vec<OwnerRecord>, DatabaseError>;
}

#[async_trait]
pub trait AssignmentRuleStore: Send + Sync {
    async fn create_assignment_rule(
        &self,
        input: &CreateAssignmentRuleParams,
        now: DateTime<Utc>,
    ) -> Result<AssignmentRuleRecord, DatabaseError>;
    async fn get_assignment_rule(
        &self,
        rule_id: Uuid,
    ) -> Result<Option<AssignmentRuleRecord>, DatabaseError>;
    /// All rules in evaluation order (priority DESC, creation ASC).
    async fn list_assignment_rules(&self) -> Result<Vec<AssignmentRuleRecord>, DatabaseError>;
    /// Active rules in evaluation order.
    async fn list_active_assignment_rules(
        &self,
    ) -> Result<Vec<AssignmentRuleRecord>, DatabaseError>;
    async fn update_assignment_rule(
        &self,
        rule_id: Uuid,
        input: &UpdateAssignmentRuleParams,
        now: DateTime<Utc>,
    ) -> Result<Option<AssignmentRuleRecord>, DatabaseError>;
    async fn set_assignment_rule_status(
        &self,
        rule_id: Uuid,
        status: RuleStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;
    async fn delete_assignment_rule(&self, rule_id: Uuid) -> Result<bool, DatabaseError>;
}

#[async_trait]
pub trait AssignmentStore: Send + Sync {
    async fn get_active_assignment(
        &self,
        contact_id: Uuid,
    ) -> Result<Option<ContactAssignmentRecord>, DatabaseError>;
    /// Every assignment row for a contact, newest first.
    async fn list_assignments_for_contact(
        &self,
        contact_id: Uuid,
    ) -> Result<Vec<ContactAssignmentRecord>, DatabaseError>;
    /// Most recent assignment created under a rule.
    async fn last_assignment_for_rule(
        &self,
        rule_id: Uuid,
    ) -> Result<Option<ContactAssignmentRecord>, DatabaseError>;
    /// Current counts of the given rate-limit buckets, in key order.
    async fn rule_window_counts(
        &self,
        rule_id: Uuid,
        window_keys: &[String],
    ) -> Result<Vec<u32>, DatabaseError>;
    async fn commit_assignment(
        &self,
        input: &NewAssignment,
        now: DateTime<Utc>,
    ) -> Result<CommitOutcome, DatabaseError>;
    /// Commit several assignments in one transaction. Items fail
    /// independently; the transaction commits iff at least one succeeded.
    async fn commit_assignments(
        &self,
        inputs: &[NewAssignment],
        now: DateTime<Utc>,
    ) -> Result<BulkCommitOutcome, DatabaseError>;
    /// Retire the active assignment. `None` when there was none.
    async fn unassign_contact(
        &self,
        contact_id: Uuid,
        changed_by: Option<Uuid>,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<(ContactAssignmentRecord, AssignmentHistoryRecord)>, DatabaseError>;
    async fn record_assignment_progress(
        &self,
        assignment_id: Uuid,
        progress: AssignmentProgress,
        now: DateTime<Utc>,
    ) -> Result<Option<ContactAssignmentRecord>, DatabaseError>;
    /// Assignment history for a contact, oldest first.
    async fn list_assignment_history(
        &self,
        contact_id: Uuid,
    ) -> Result<Vec<AssignmentHistoryRecord>, DatabaseError>;
}

#[async_trait]
pub trait WorkloadStore: Send + Sync {
    async fn get_workload(&self, owner_id: Uuid)
    -> Result<Option<UserWorkloadRecord>, DatabaseError>;
    /// Existing row, or a freshly inserted empty one.
    async fn ensure_workload(
        &self,
        owner_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<UserWorkloadRecord, DatabaseError>;
    /// Recount load counters from contacts and assignments; profile fields
    /// (availability, caps, affinities) are preserved.
    async fn recompute_workload(
        &self,
        owner_id: Uuid,
        terminal_statuses: &[ContactStatus],
        now: DateTime<Utc>,
    ) -> Result<UserWorkloadRecord, DatabaseError>;
    async fn update_workload_profile(
        &self,
        owner_id: Uuid,
        input: &WorkloadProfileParams,
        now: DateTime<Utc>,
    ) -> Result<UserWorkloadRecord, DatabaseError>;
    /// Owners with a workload row or any assigned contact.
    async fn list_workload_owner_ids(&self) -> Result<Vec<Uuid>, DatabaseError>;
}

#[async_trait]
pub trait ScoringRuleStore: Send + Sync {
    async fn create_scoring_rule(
        &self,
        input: &CreateScoringRuleParams,
        now: DateTime<Utc>,
    ) -> Result<LeadScoringRuleRecord, DatabaseError>;
    async fn get_scoring_rule(
        &self,
        rule_id: Uuid,
    ) -> Result<Option<LeadScoringRuleRecord>, DatabaseError>;
    async fn list_scoring_rules(&self) -> Result<Vec<LeadScoringRuleRecord>, DatabaseError>;
    /// Active rules, priority DESC then creation ASC.
    async fn list_active_scoring_rules(&self)
    -> Result<Vec<LeadScoringRuleRecord>, DatabaseError>;
    async fn update_scoring_rule(
        &self,
        rule_id: Uuid,
        input: &UpdateScoringRuleParams,
        now: DateTime<Utc>,
    ) -> Result<Option<LeadScoringRuleRecord>, DatabaseError>;
    async fn delete_scoring_rule(&self, rule_id: Uuid) -> Result<bool, DatabaseError>;
    /// Bump `times_applied` and `last_applied_at` on each rule.
    async fn record_scoring_rules_applied(
        &self,
        rule_ids: &[Uuid],
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;
}

#[async_trait]
pub trait TransitionRuleStore: Send + Sync {
    async fn create_transition_rule(
        &self,
        input: &CreateTransitionRuleParams,
        now: DateTime<Utc>,
    ) -> Result<StatusTransitionRuleRecord, DatabaseError>;
    async fn get_transition_rule(
        &self,
        rule_id: Uuid,
    ) -> Result<Option<StatusTransitionRuleRecord>, DatabaseError>;
    async fn list_transition_rules(&self)
    -> Result<Vec<StatusTransitionRuleRecord>, DatabaseError>;
    /// Active rules leaving `from`, priority DESC then creation ASC.
    async fn list_active_transition_rules_from(
        &self,
        from: ContactStatus,
    ) -> Result<Vec<StatusTransitionRuleRecord>, DatabaseError>;
    async fn update_transition_rule(
        &self,
        rule_id: Uuid,
        input: &UpdateTransitionRuleParams,
        now: DateTime<Utc>,
    ) -> Result<Option<StatusTransitionRuleRecord>, DatabaseError>;
    async fn delete_transition_rule(&self, rule_id: Uuid) -> Result<bool, DatabaseError>;
}

#[async_trait]
pub trait LifecycleStore: Send + Sync {
    async fn get_lifecycle(
        &self,
        contact_id: Uuid,
    ) -> Result<Option<ContactLifecycleRecord>, DatabaseError>;
    /// Persist a scoring result: lifecycle row plus the contact's cached
    /// lead score, in one transaction.
    async fn save_score(
        &self,
        lifecycle: &ContactLifecycleRecord,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;
    async fn commit_status_change(
        &self,
        change: &StatusChangeCommit,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;
    /// Bulk variant: per-item failures are reported, and the transaction
    /// commits iff at least one change was written.
    async fn commit_status_changes(
        &self,
        changes: &[StatusChangeCommit],
        now: DateTime<Utc>,
    ) -> Result<Vec<(Uuid, DatabaseError)>, DatabaseError>;
    async fn append_lifecycle_event(
        &self,
        event: &NewLifecycleEvent,
    ) -> Result<LifecycleEventRecord, DatabaseError>;
    /// Newest first. `limit == 0` returns every event.
    async fn list_lifecycle_events(
        &self,
        contact_id: Uuid,
        limit: usize,
    ) -> Result<Vec<LifecycleEventRecord>, DatabaseError>;
    async fn list_lifecycles_in_status(
        &self,
        status: ContactStatus,
    ) -> Result<Vec<ContactLifecycleRecord>, DatabaseError>;
}

/// Backend-agnostic database supertrait.
#[async_trait]
pub trait Database:
    ContactDirectory
    + OwnerDirectory
    + AssignmentRuleStore
    + AssignmentStore
    + WorkloadStore
    + ScoringRuleStore
    + TransitionRuleStore
    + LifecycleStore
    + Send
    + Sync
{
    /// Run schema migrations for this backend.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;
}

#[cfg(test)]
mod tests {
    use super::{AssignmentStrategy, ContactStatus, LifecycleStage};

    #[test]
    fn status_values_round_trip_through_db_strings() {
        for status in ContactStatus::ALL {
            assert_eq!(ContactStatus::from_db_value(status.as_str()), Some(status));
        }
        assert_eq!(ContactStatus::from_db_value("archived"), None);
    }

    #[test]
    fn geography_strategy_accepts_short_name() {
        assert_eq!(
            AssignmentStrategy::from_db_value("geography"),
            Some(AssignmentStrategy::GeographyBased)
        );
        let parsed: AssignmentStrategy =
            serde_json::from_str("\"geography\"").expect("deserialize alias");
        assert_eq!(parsed, AssignmentStrategy::GeographyBased);
    }

    #[test]
    fn stage_rank_orders_the_funnel() {
        assert!(LifecycleStage::Suspect.rank() < LifecycleStage::Prospect.rank());
        assert!(
            LifecycleStage::MarketingQualifiedLead.rank()
                < LifecycleStage::SalesQualifiedLead.rank()
        );
        assert_eq!(LifecycleStage::Other.rank(), LifecycleStage::Unknown.rank());
    }
}
