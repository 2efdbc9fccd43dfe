//! Scheduled computation of every snapshot type for the last complete periods

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use statsnap_common::{Result, StatsError};
use statsnap_core::{AggregationService, Granularity, Period, SnapshotSource, SnapshotType};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

use crate::lease::LeaseManager;
use crate::retry::{run_with_retry, RetryPolicy};

/// A snapshot that could not be produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotFailure {
    pub snapshot_type: SnapshotType,
    pub period: String,
    pub error: String,
    pub retries: u32,
}

/// Outcome of one scheduled run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_ms: u64,
    pub total_snapshots: u32,
    pub successful_snapshots: u32,
    pub failed_snapshots: u32,
    pub skipped_snapshots: u32,
    pub retries: u32,
    pub errors: Vec<SnapshotFailure>,
}

impl ExecutionReport {
    fn started(start_time: DateTime<Utc>) -> Self {
        Self {
            start_time,
            end_time: start_time,
            duration_ms: 0,
            total_snapshots: 0,
            successful_snapshots: 0,
            failed_snapshots: 0,
            skipped_snapshots: 0,
            retries: 0,
            errors: Vec::new(),
        }
    }

    pub fn has_failures(&self) -> bool {
        self.failed_snapshots > 0
    }

    pub fn summary(&self) -> String {
        format!(
            "{}/{} snapshots succeeded, {} failed, {} skipped, {} retries in {}ms",
            self.successful_snapshots,
            self.total_snapshots,
            self.failed_snapshots,
            self.skipped_snapshots,
            self.retries,
            self.duration_ms
        )
    }
}

/// Validate and de-duplicate requested period names, keeping their order
pub fn parse_periods<S: AsRef<str>>(periods: &[S]) -> Result<Vec<Granularity>> {
    if periods.is_empty() {
        return Err(StatsError::validation_field(
            "At least one period is required",
            "periods",
        ));
    }

    let mut granularities = Vec::with_capacity(periods.len());
    for name in periods {
        let granularity = Granularity::from_str(name.as_ref())?;
        if !granularities.contains(&granularity) {
            granularities.push(granularity);
        }
    }
    Ok(granularities)
}

/// Computes all snapshot types for the previous complete window of each period
#[derive(Clone)]
pub struct ScheduledSnapshotJob {
    service: AggregationService,
    leases: LeaseManager,
    retry_base_delay: Duration,
}

impl ScheduledSnapshotJob {
    pub fn new(
        service: AggregationService,
        leases: LeaseManager,
        retry_base_delay: Duration,
    ) -> Self {
        Self {
            service,
            leases,
            retry_base_delay,
        }
    }

    pub async fn execute<S: AsRef<str>>(
        &self,
        periods: &[S],
        max_retries: u32,
        force: bool,
    ) -> Result<ExecutionReport> {
        self.execute_at(Utc::now(), periods, max_retries, force).await
    }

    /// Run against an explicit clock value.
    ///
    /// Only invalid input and lease contention fail the run; individual
    /// snapshot failures are recorded in the report.
    #[instrument(skip_all, fields(now = %now, max_retries = max_retries, force = force))]
    pub async fn execute_at<S: AsRef<str>>(
        &self,
        now: DateTime<Utc>,
        periods: &[S],
        max_retries: u32,
        force: bool,
    ) -> Result<ExecutionReport> {
        let granularities = parse_periods(periods)?;
        let names: Vec<&str> = granularities.iter().map(Granularity::as_str).collect();
        let lease = self.leases.acquire(&names, now)?;

        let started = Utc::now();
        info!(periods = ?names, lease_key = lease.key(), "Scheduled snapshot run started");

        let policy = RetryPolicy::new(max_retries, self.retry_base_delay);
        let mut report = ExecutionReport::started(started);

        for granularity in granularities {
            let period = Period::previous_complete(granularity, now);
            for snapshot_type in SnapshotType::ALL {
                self.run_item(snapshot_type, &period, &policy, force, &mut report)
                    .await;
            }
        }

        report.end_time = Utc::now();
        report.duration_ms = (report.end_time - report.start_time)
            .num_milliseconds()
            .max(0) as u64;

        if let Err(e) = lease.release() {
            warn!(error = %e, "Failed to release lease");
        }

        info!(summary = %report.summary(), "Scheduled snapshot run finished");
        Ok(report)
    }

    async fn run_item(
        &self,
        snapshot_type: SnapshotType,
        period: &Period,
        policy: &RetryPolicy,
        force: bool,
        report: &mut ExecutionReport,
    ) {
        report.total_snapshots += 1;
        let label = format!("{}:{}", snapshot_type, period.key());

        let outcome = run_with_retry(policy, &label, || {
            self.service.recompute_snapshot(
                snapshot_type,
                period,
                force,
                Some(SnapshotSource::Scheduled.metadata()),
            )
        })
        .await;
        report.retries += outcome.retries;

        match outcome.result {
            Ok(result) if result.is_skipped() => {
                debug!(item = %label, "Snapshot exists, skipped");
                report.skipped_snapshots += 1;
            }
            Ok(_) => {
                debug!(item = %label, retries = outcome.retries, "Snapshot stored");
                report.successful_snapshots += 1;
            }
            Err(StatsError::NoDataForPeriod { .. }) | Err(StatsError::DuplicateSnapshot { .. }) => {
                debug!(item = %label, "No data or concurrent write, skipped");
                report.skipped_snapshots += 1;
            }
            Err(e) => {
                error!(
                    snapshot_type = %snapshot_type,
                    period = %period,
                    retries = outcome.retries,
                    error = %e,
                    "Snapshot failed"
                );
                report.failed_snapshots += 1;
                report.errors.push(SnapshotFailure {
                    snapshot_type,
                    period: period.key(),
                    error: e.to_string(),
                    retries: outcome.retries,
                });
            }
        }
    }
}
