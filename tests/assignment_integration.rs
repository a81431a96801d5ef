//! End-to-end routing scenarios against an on-disk libSQL database.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use pretty_assertions::assert_eq;
use uuid::Uuid;

use leadflow::Leadflow;
use leadflow::clock::ManualClock;
use leadflow::config::EngineConfig;
use leadflow::db::libsql::LibSqlBackend;
use leadflow::db::{
    AssignmentStatus, AssignmentStore, AssignmentStrategy, ContactDirectory,
    CreateAssignmentRuleParams, Database, HistoryChangeType, OwnerDirectory, UpsertContactParams,
    UpsertOwnerParams,
};
use leadflow::routing::{BulkAssignment, ManualAssignment};

struct Env {
    _dir: tempfile::TempDir,
    db: Arc<LibSqlBackend>,
    clock: Arc<ManualClock>,
    engine: Leadflow,
}

/// Monday morning, inside any nine-to-five window.
fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap()
}

async fn env() -> Env {
    let dir = tempfile::tempdir().expect("tempdir");
    let backend = LibSqlBackend::new_local(&dir.path().join("routing.db"))
        .await
        .expect("open database");
    backend.run_migrations().await.expect("migrations");
    let db = Arc::new(backend);
    let clock = Arc::new(ManualClock::new(start()));
    let engine = Leadflow::new(db.clone(), clock.clone(), EngineConfig::default());
    Env {
        _dir: dir,
        db,
        clock,
        engine,
    }
}

async fn owner(env: &Env, name: &str, role: &str) -> Uuid {
    env.db
        .upsert_owner(&UpsertOwnerParams::new(name, role), start())
        .await
        .expect("owner")
        .id
}

async fn contact(env: &Env, first_name: &str) -> Uuid {
    env.db
        .upsert_contact(&UpsertContactParams::new(first_name, "Test"), start())
        .await
        .expect("contact")
        .id
}

async fn active_rows(env: &Env, contact_id: Uuid) -> usize {
    env.db
        .list_assignments_for_contact(contact_id)
        .await
        .expect("assignments")
        .iter()
        .filter(|row| row.status == AssignmentStatus::Active)
        .count()
}

#[tokio::test]
async fn round_robin_sales_assigns_x_then_y() {
    let env = env().await;
    let a = owner(&env, "A", "sales").await;
    let b = owner(&env, "B", "sales").await;
    let c = owner(&env, "C", "sales").await;
    let mut rule = CreateAssignmentRuleParams::new(
        "Round Robin Sales",
        AssignmentStrategy::RoundRobin,
        vec![a, b, c],
    );
    rule.priority = 10;
    env.engine.assignment().create_rule(&rule).await.expect("rule");

    let x = contact(&env, "X").await;
    let first = env
        .engine
        .assignment()
        .assign_automatically(x, &HashMap::new())
        .await
        .expect("assign X");
    env.clock.advance(Duration::seconds(5));
    let y = contact(&env, "Y").await;
    let second = env
        .engine
        .assignment()
        .assign_automatically(y, &HashMap::new())
        .await
        .expect("assign Y");

    assert_eq!(first.owner_id, a);
    assert_eq!(second.owner_id, b);
    let cached = env.db.get_contact(y).await.unwrap().unwrap();
    assert_eq!(cached.assigned_to, Some(b));
}

#[tokio::test]
async fn manual_reassignment_keeps_one_active_row() {
    let env = env().await;
    let a = owner(&env, "A", "sales").await;
    let b = owner(&env, "B", "sales").await;
    let x = contact(&env, "X").await;

    let request = |owner_id| ManualAssignment {
        contact_id: x,
        owner_id,
        reason: "territory change".to_string(),
        priority: None,
        actor_id: None,
    };
    let first = env
        .engine
        .assignment()
        .assign_manually(&request(a))
        .await
        .expect("assign A");
    env.clock.advance(Duration::minutes(1));
    let second = env
        .engine
        .assignment()
        .assign_manually(&request(b))
        .await
        .expect("reassign B");

    let rows = env.db.list_assignments_for_contact(x).await.unwrap();
    let retired = rows.iter().find(|row| row.id == first.id).expect("first row");
    assert_eq!(retired.status, AssignmentStatus::Reassigned);
    assert_eq!(second.status, AssignmentStatus::Active);
    assert_eq!(active_rows(&env, x).await, 1);

    let history = env.db.list_assignment_history(x).await.unwrap();
    let last = history.last().expect("history");
    assert_eq!(last.change_type, HistoryChangeType::Reassigned);
    assert_eq!(last.from_owner_id, Some(a));
    assert_eq!(last.to_owner_id, Some(b));

    env.engine
        .assignment()
        .unassign(x, None, "lead went cold")
        .await
        .expect("unassign");
    assert_eq!(active_rows(&env, x).await, 0);
    assert_eq!(env.db.get_contact(x).await.unwrap().unwrap().assigned_to, None);
}

#[tokio::test]
async fn bulk_assign_with_deleted_targets_commits_the_rest() {
    let env = env().await;
    let owner_id = owner(&env, "Closer", "sales").await;
    let mut ids = Vec::new();
    for name in ["One", "Two", "Three", "Four", "Five"] {
        ids.push(contact(&env, name).await);
    }
    assert!(env.db.delete_contact(ids[1]).await.unwrap());
    assert!(env.db.delete_contact(ids[3]).await.unwrap());

    let summary = env
        .engine
        .assignment()
        .bulk_assign(&BulkAssignment {
            contact_ids: ids.clone(),
            owner_id,
            reason: "campaign handoff".to_string(),
            priority: None,
            actor_id: None,
        })
        .await
        .expect("bulk assign");

    assert_eq!(summary.succeeded, 3);
    assert_eq!(summary.errors.len(), 2);
    let failed: Vec<Uuid> = summary.errors.iter().map(|e| e.contact_id).collect();
    assert_eq!(failed, vec![ids[1], ids[3]]);
    for id in [ids[0], ids[2], ids[4]] {
        let active = env.db.get_active_assignment(id).await.unwrap().expect("active");
        assert_eq!(active.owner_id, owner_id);
    }

    let workload = env.engine.assignment().get_workload(owner_id).await.expect("workload");
    assert_eq!(workload.workload.active_contacts, 3);
}

#[tokio::test]
async fn automatic_routing_never_leaves_two_active_rows() {
    let env = env().await;
    let a = owner(&env, "A", "sales").await;
    let b = owner(&env, "B", "sales").await;
    env.engine
        .assignment()
        .create_rule(&CreateAssignmentRuleParams::new(
            "Everyone",
            AssignmentStrategy::RoundRobin,
            vec![a, b],
        ))
        .await
        .expect("rule");

    let x = contact(&env, "X").await;
    for _ in 0..3 {
        env.engine
            .assignment()
            .assign_automatically(x, &HashMap::new())
            .await
            .expect("assign");
        assert_eq!(active_rows(&env, x).await, 1);
        env.clock.advance(Duration::seconds(1));
    }
    assert_eq!(env.db.list_assignments_for_contact(x).await.unwrap().len(), 3);
}
