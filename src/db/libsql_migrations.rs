//! SQLite-dialect schema for the libSQL backend.
//!
//! Applied with `execute_batch` on every start; every statement is
//! idempotent. Timestamps are RFC 3339 text with millisecond precision,
//! identifiers are text UUIDs, sets and rule bodies are JSON text.

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS contacts (
    id TEXT PRIMARY KEY,
    first_name TEXT NOT NULL,
    last_name TEXT NOT NULL,
    email TEXT,
    phone TEXT,
    company TEXT,
    contact_type_id TEXT,
    contact_source_id TEXT,
    priority TEXT NOT NULL DEFAULT 'medium',
    status TEXT NOT NULL DEFAULT 'new',
    lead_score INTEGER NOT NULL DEFAULT 0,
    estimated_value TEXT,
    country TEXT,
    state TEXT,
    city TEXT,
    utm_source TEXT,
    utm_medium TEXT,
    utm_campaign TEXT,
    email_opened INTEGER NOT NULL DEFAULT 0,
    email_clicked INTEGER NOT NULL DEFAULT 0,
    total_interactions INTEGER NOT NULL DEFAULT 0,
    next_followup_at TEXT,
    custom_fields TEXT NOT NULL DEFAULT '{}',
    assigned_to TEXT,
    assigned_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_contacts_assigned_to ON contacts(assigned_to);

CREATE TABLE IF NOT EXISTS owners (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    email TEXT,
    role TEXT NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS assignment_rules (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    description TEXT,
    strategy TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'active',
    priority INTEGER NOT NULL DEFAULT 0,
    conditions TEXT NOT NULL DEFAULT '[]',
    assignee_ids TEXT NOT NULL DEFAULT '[]',
    fallback_owner_id TEXT,
    business_hours TEXT,
    max_assignments_per_hour INTEGER,
    max_assignments_per_day INTEGER,
    total_assignments INTEGER NOT NULL DEFAULT 0,
    successful_assignments INTEGER NOT NULL DEFAULT 0,
    last_assignment_at TEXT,
    created_by TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_assignment_rules_order
    ON assignment_rules(status, priority DESC, created_at ASC);

CREATE TABLE IF NOT EXISTS contact_assignments (
    id TEXT PRIMARY KEY,
    contact_id TEXT NOT NULL,
    owner_id TEXT NOT NULL,
    assigned_by TEXT,
    rule_id TEXT,
    assignment_type TEXT NOT NULL,
    reason TEXT NOT NULL DEFAULT '',
    priority TEXT NOT NULL DEFAULT 'medium',
    status TEXT NOT NULL DEFAULT 'active',
    accepted_at TEXT,
    first_response_at TEXT,
    completed_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_contact_assignments_one_active
    ON contact_assignments(contact_id) WHERE status = 'active';
CREATE INDEX IF NOT EXISTS idx_contact_assignments_rule
    ON contact_assignments(rule_id, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_contact_assignments_owner
    ON contact_assignments(owner_id, created_at DESC);

CREATE TABLE IF NOT EXISTS assignment_history (
    id TEXT PRIMARY KEY,
    contact_id TEXT NOT NULL,
    from_owner_id TEXT,
    to_owner_id TEXT,
    changed_by TEXT,
    rule_id TEXT,
    change_type TEXT NOT NULL,
    reason TEXT NOT NULL DEFAULT '',
    previous_status TEXT,
    new_status TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_assignment_history_contact
    ON assignment_history(contact_id, created_at);

CREATE TABLE IF NOT EXISTS assignment_rule_windows (
    rule_id TEXT NOT NULL,
    window_key TEXT NOT NULL,
    assignments INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (rule_id, window_key)
);

CREATE TABLE IF NOT EXISTS user_workloads (
    owner_id TEXT PRIMARY KEY,
    active_contacts INTEGER NOT NULL DEFAULT 0,
    pending_contacts INTEGER NOT NULL DEFAULT 0,
    overdue_contacts INTEGER NOT NULL DEFAULT 0,
    total_contacts INTEGER NOT NULL DEFAULT 0,
    today_assignments INTEGER NOT NULL DEFAULT 0,
    weekly_assignments INTEGER NOT NULL DEFAULT 0,
    avg_response_time_hours REAL NOT NULL DEFAULT 0,
    avg_resolution_time_hours REAL NOT NULL DEFAULT 0,
    conversion_rate REAL NOT NULL DEFAULT 0,
    is_available INTEGER NOT NULL DEFAULT 1,
    max_daily_assignments INTEGER,
    max_active_contacts INTEGER,
    skills TEXT NOT NULL DEFAULT '[]',
    territories TEXT NOT NULL DEFAULT '[]',
    contact_types TEXT NOT NULL DEFAULT '[]',
    last_calculated_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS lead_scoring_rules (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    description TEXT,
    category TEXT NOT NULL,
    base_score INTEGER NOT NULL DEFAULT 0,
    max_score INTEGER NOT NULL DEFAULT 100,
    criteria TEXT NOT NULL DEFAULT '[]',
    applicable_when TEXT NOT NULL DEFAULT '[]',
    is_active INTEGER NOT NULL DEFAULT 1,
    priority INTEGER NOT NULL DEFAULT 0,
    times_applied INTEGER NOT NULL DEFAULT 0,
    last_applied_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS status_transition_rules (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    description TEXT,
    from_status TEXT NOT NULL,
    to_status TEXT NOT NULL,
    transition_type TEXT NOT NULL,
    conditions TEXT NOT NULL DEFAULT '[]',
    required_score INTEGER NOT NULL DEFAULT 0,
    days_in_status INTEGER NOT NULL DEFAULT 0,
    actions TEXT NOT NULL DEFAULT '[]',
    notify_owner_ids TEXT NOT NULL DEFAULT '[]',
    is_active INTEGER NOT NULL DEFAULT 1,
    priority INTEGER NOT NULL DEFAULT 0,
    times_triggered INTEGER NOT NULL DEFAULT 0,
    last_triggered_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_status_transition_rules_from
    ON status_transition_rules(from_status, is_active);

CREATE TABLE IF NOT EXISTS contact_lifecycles (
    id TEXT PRIMARY KEY,
    contact_id TEXT NOT NULL UNIQUE,
    current_stage TEXT NOT NULL,
    current_status TEXT NOT NULL,
    current_score INTEGER NOT NULL DEFAULT 0,
    demographic_score INTEGER NOT NULL DEFAULT 0,
    behavioral_score INTEGER NOT NULL DEFAULT 0,
    engagement_score INTEGER NOT NULL DEFAULT 0,
    firmographic_score INTEGER NOT NULL DEFAULT 0,
    score_history TEXT NOT NULL DEFAULT '[]',
    scoring_factors TEXT NOT NULL DEFAULT '{}',
    stage_velocity TEXT NOT NULL DEFAULT '{}',
    stage_entered_at TEXT NOT NULL,
    status_entered_at TEXT NOT NULL,
    last_scored_at TEXT,
    first_engagement_at TEXT,
    qualification_at TEXT,
    opportunity_at TEXT,
    conversion_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_contact_lifecycles_status
    ON contact_lifecycles(current_status);

CREATE TABLE IF NOT EXISTS lifecycle_events (
    id TEXT PRIMARY KEY,
    contact_id TEXT NOT NULL,
    lifecycle_id TEXT NOT NULL,
    event_type TEXT NOT NULL,
    event_name TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    previous_value TEXT,
    new_value TEXT,
    change_amount INTEGER,
    trigger_type TEXT NOT NULL,
    trigger_source TEXT NOT NULL DEFAULT '',
    trigger_data TEXT NOT NULL DEFAULT '{}',
    triggered_by TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_lifecycle_events_contact
    ON lifecycle_events(contact_id, created_at DESC);
"#;
