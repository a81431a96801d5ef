//! Per-owner load accounting consumed by the selection strategies.

use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::clock::Clock;
use crate::db::{
    ContactStatus, Database, OwnerDirectory, UserWorkloadRecord, WorkloadProfileParams,
    WorkloadStore,
};
use crate::error::EngineError;

/// Lower is more available.
pub fn workload_score(workload: &UserWorkloadRecord) -> f64 {
    let mut score = workload.active_contacts as f64 * 1.0
        + workload.pending_contacts as f64 * 0.8
        + workload.overdue_contacts as f64 * 2.0;

    if workload.avg_response_time_hours > 24.0 {
        score += 5.0;
    } else if workload.avg_response_time_hours > 8.0 {
        score += 2.0;
    }
    score
}

/// Between 0 and 1; higher is more available.
pub fn availability_score(workload: &UserWorkloadRecord) -> f64 {
    if !workload.is_available {
        return 0.0;
    }

    let mut score = 1.0;
    if let Some(cap) = workload.max_daily_assignments
        && workload.today_assignments >= cap
    {
        score *= 0.5;
    }
    if let Some(cap) = workload.max_active_contacts
        && workload.active_contacts >= cap
    {
        score *= 0.3;
    }
    score *= 1.0 + workload.conversion_rate;
    score.min(1.0)
}

/// Workload row plus the derived scores callers display.
#[derive(Debug, Clone, Serialize)]
pub struct WorkloadSnapshot {
    #[serde(flatten)]
    pub workload: UserWorkloadRecord,
    pub workload_score: f64,
    pub availability_score: f64,
}

impl From<UserWorkloadRecord> for WorkloadSnapshot {
    fn from(workload: UserWorkloadRecord) -> Self {
        Self {
            workload_score: workload_score(&workload),
            availability_score: availability_score(&workload),
            workload,
        }
    }
}

/// Recomputes and exposes owner workload rows.
///
/// Recomputation is eventually consistent with assignments: it runs after
/// the assignment transaction has committed, and a failure only leaves the
/// counters stale until the next recompute.
pub struct WorkloadTracker {
    db: Arc<dyn Database>,
    clock: Arc<dyn Clock>,
    terminal_statuses: Vec<ContactStatus>,
}

impl WorkloadTracker {
    pub fn new(
        db: Arc<dyn Database>,
        clock: Arc<dyn Clock>,
        terminal_statuses: Vec<ContactStatus>,
    ) -> Self {
        Self {
            db,
            clock,
            terminal_statuses,
        }
    }

    pub async fn recompute(&self, owner_id: Uuid) -> Result<UserWorkloadRecord, EngineError> {
        let record = self
            .db
            .recompute_workload(owner_id, &self.terminal_statuses, self.clock.now())
            .await?;
        tracing::debug!(
            owner_id = %owner_id,
            active = record.active_contacts,
            today = record.today_assignments,
            "Workload recomputed"
        );
        Ok(record)
    }

    /// Recompute, logging instead of failing.
    pub async fn recompute_best_effort(&self, owner_id: Uuid) {
        if let Err(e) = self.recompute(owner_id).await {
            tracing::warn!(owner_id = %owner_id, error = %e, "Workload recompute failed");
        }
    }

    /// Snapshot for an existing owner; a default row is created on first read.
    pub async fn snapshot(&self, owner_id: Uuid) -> Result<WorkloadSnapshot, EngineError> {
        if self.db.get_owner(owner_id).await?.is_none() {
            return Err(EngineError::not_found("owner", owner_id));
        }
        let record = self.db.ensure_workload(owner_id, self.clock.now()).await?;
        Ok(record.into())
    }

    pub async fn update_profile(
        &self,
        owner_id: Uuid,
        params: &WorkloadProfileParams,
    ) -> Result<WorkloadSnapshot, EngineError> {
        if self.db.get_owner(owner_id).await?.is_none() {
            return Err(EngineError::not_found("owner", owner_id));
        }
        for cap in [params.max_daily_assignments, params.max_active_contacts]
            .into_iter()
            .flatten()
            .flatten()
        {
            if cap <= 0 {
                return Err(EngineError::Validation(
                    "workload caps must be positive".to_string(),
                ));
            }
        }
        let record = self
            .db
            .update_workload_profile(owner_id, params, self.clock.now())
            .await?;
        Ok(record.into())
    }

    /// Recompute every known owner; returns how many rows were refreshed.
    pub async fn reconcile(&self) -> Result<usize, EngineError> {
        let owners = self.db.list_workload_owner_ids().await?;
        let mut refreshed = 0;
        for owner_id in owners {
            match self.recompute(owner_id).await {
                Ok(_) => refreshed += 1,
                Err(e) => {
                    tracing::warn!(owner_id = %owner_id, error = %e, "Workload reconcile failed");
                }
            }
        }
        tracing::info!(refreshed, "Workload reconciliation finished");
        Ok(refreshed)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    use super::{availability_score, workload_score};
    use crate::db::UserWorkloadRecord;

    fn workload() -> UserWorkloadRecord {
        UserWorkloadRecord::empty(
            Uuid::new_v4(),
            Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap(),
        )
    }

    #[test]
    fn workload_score_weights_counts_and_slow_responses() {
        let mut w = workload();
        w.active_contacts = 4;
        w.pending_contacts = 5;
        w.overdue_contacts = 1;
        assert_eq!(workload_score(&w), 4.0 + 4.0 + 2.0);

        w.avg_response_time_hours = 10.0;
        assert_eq!(workload_score(&w), 12.0);
        w.avg_response_time_hours = 30.0;
        assert_eq!(workload_score(&w), 15.0);
    }

    #[test]
    fn availability_score_applies_caps_and_conversion() {
        let mut w = workload();
        assert_eq!(availability_score(&w), 1.0);

        w.max_daily_assignments = Some(3);
        w.today_assignments = 3;
        assert_eq!(availability_score(&w), 0.5);

        w.max_active_contacts = Some(2);
        w.active_contacts = 2;
        w.conversion_rate = 0.5;
        assert!((availability_score(&w) - 0.225).abs() < 1e-9);

        w.is_available = false;
        assert_eq!(availability_score(&w), 0.0);
    }
}
