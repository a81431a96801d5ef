//! Contact routing: owner selection strategies, workload tracking and the
//! assignment engine that ties them to the stored rules.

pub mod engine;
pub mod strategy;
pub mod workload;

pub use engine::{
    AssignmentEngine, BulkAssignment, BulkAssignmentSummary, FALLBACK_REASON, ManualAssignment,
    RuleDryRun,
};
pub use strategy::{SelectionContext, ValueThresholds, select_owner};
pub use workload::{WorkloadSnapshot, WorkloadTracker, availability_score, workload_score};
