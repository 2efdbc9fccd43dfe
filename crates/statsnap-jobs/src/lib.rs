//! Jobs driving the aggregation service
//!
//! The scheduled job computes every snapshot type for the last complete
//! periods under an execution lease, retrying transient failures. The backfill
//! job recomputes daily snapshots over a historical date range in batches.

pub mod backfill;
pub mod lease;
pub mod retry;
pub mod scheduled;

pub use backfill::{
    BackfillJob, BackfillPlan, BackfillReport, BackfillRequest, BackfillTask, TaskAction,
    TaskFailure, DEFAULT_BATCH_SIZE,
};
pub use lease::{
    lease_key, local_hostname, FileLeaseStore, LeaseEntry, LeaseGuard, LeaseManager, LeaseRecord,
    LeaseStore, MemoryLeaseStore, ProcessLivenessChecker, ProcfsLivenessChecker,
    DEFAULT_UNREADABLE_GRACE_SECS,
};
pub use retry::{run_with_retry, RetryOutcome, RetryPolicy};
pub use scheduled::{parse_periods, ExecutionReport, ScheduledSnapshotJob, SnapshotFailure};
