//! Historical recomputation over an explicit date range

use chrono::{Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use statsnap_common::utils::{days_inclusive, parse_date, yesterday};
use statsnap_common::{Result, StatsError};
use statsnap_core::{AggregationService, Period, SnapshotSource, SnapshotType};
use std::fmt;
use std::fmt::Write as _;
use tracing::{error, info, instrument, warn};

pub const DEFAULT_BATCH_SIZE: usize = 30;
pub const DEFAULT_DAYS: u32 = 30;
pub const MAX_BATCH_SIZE: usize = 365;

/// Raw backfill arguments, validated by `BackfillJob::plan_at`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackfillRequest {
    /// One snapshot type; all four when absent
    pub snapshot_type: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub force: bool,
    pub batch_size: usize,
    pub dry_run: bool,
}

impl Default for BackfillRequest {
    fn default() -> Self {
        Self {
            snapshot_type: None,
            start_date: None,
            end_date: None,
            force: false,
            batch_size: DEFAULT_BATCH_SIZE,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskAction {
    Process,
    Skip,
}

impl fmt::Display for TaskAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskAction::Process => f.write_str("process"),
            TaskAction::Skip => f.write_str("skip"),
        }
    }
}

/// One (window, type) unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackfillTask {
    pub snapshot_type: SnapshotType,
    pub batch_start: NaiveDate,
    pub batch_end: NaiveDate,
    /// Every daily snapshot in the window is already stored
    pub exists_already: bool,
    pub action: TaskAction,
}

impl BackfillTask {
    pub fn days(&self) -> Vec<NaiveDate> {
        days_inclusive(self.batch_start, self.batch_end)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackfillPlan {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub batch_size: usize,
    pub force: bool,
    pub tasks: Vec<BackfillTask>,
}

impl BackfillPlan {
    pub fn process_count(&self) -> usize {
        self.tasks
            .iter()
            .filter(|task| task.action == TaskAction::Process)
            .count()
    }

    pub fn skip_count(&self) -> usize {
        self.tasks.len() - self.process_count()
    }

    /// Fixed-width task table for dry-run output
    pub fn render_table(&self) -> String {
        let mut table = String::new();
        let _ = writeln!(
            table,
            "{:<10} {:<12} {:<12} {:<7} {:<8}",
            "TYPE", "START", "END", "EXISTS", "ACTION"
        );
        for task in &self.tasks {
            let _ = writeln!(
                table,
                "{:<10} {:<12} {:<12} {:<7} {:<8}",
                task.snapshot_type.as_str(),
                task.batch_start.to_string(),
                task.batch_end.to_string(),
                if task.exists_already { "yes" } else { "no" },
                task.action.to_string()
            );
        }
        let _ = write!(
            table,
            "{} task(s): {} to process, {} to skip",
            self.tasks.len(),
            self.process_count(),
            self.skip_count()
        );
        table
    }
}

/// A task in which at least one day failed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub snapshot_type: SnapshotType,
    pub batch_start: NaiveDate,
    pub batch_end: NaiveDate,
    pub message: String,
    pub days_succeeded: u32,
    pub days_failed: u32,
    pub days_skipped: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackfillReport {
    pub dry_run: bool,
    pub tasks: Vec<BackfillTask>,
    pub processed: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub skipped: u32,
    pub failures: Vec<TaskFailure>,
}

impl BackfillReport {
    fn new(dry_run: bool, tasks: Vec<BackfillTask>) -> Self {
        Self {
            dry_run,
            tasks,
            processed: 0,
            succeeded: 0,
            failed: 0,
            skipped: 0,
            failures: Vec::new(),
        }
    }

    /// True when no processed task failed
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }
}

#[derive(Default)]
struct DayTally {
    succeeded: u32,
    failed: u32,
    skipped: u32,
    last_error: Option<String>,
}

/// Batched recomputation of daily snapshots
#[derive(Clone)]
pub struct BackfillJob {
    service: AggregationService,
    default_days: u32,
}

impl BackfillJob {
    pub fn new(service: AggregationService) -> Self {
        Self {
            service,
            default_days: DEFAULT_DAYS,
        }
    }

    /// Length of the default range ending yesterday
    pub fn with_default_days(mut self, days: u32) -> Self {
        self.default_days = days.max(1);
        self
    }

    pub async fn run(&self, request: &BackfillRequest) -> Result<BackfillReport> {
        self.run_at(request, Utc::now().date_naive()).await
    }

    pub async fn run_at(
        &self,
        request: &BackfillRequest,
        today: NaiveDate,
    ) -> Result<BackfillReport> {
        let plan = self.plan_at(request, today).await?;
        if request.dry_run {
            info!(tasks = plan.tasks.len(), "Dry run, nothing computed");
            return Ok(BackfillReport::new(true, plan.tasks));
        }
        Ok(self.execute(plan).await)
    }

    /// Validate the request and split its range into tasks.
    ///
    /// Every invalid argument is reported in a single `InvalidArguments` error.
    pub async fn plan_at(
        &self,
        request: &BackfillRequest,
        today: NaiveDate,
    ) -> Result<BackfillPlan> {
        let mut errors = Vec::new();

        let types = match &request.snapshot_type {
            None => SnapshotType::ALL.to_vec(),
            Some(name) => match name.parse::<SnapshotType>() {
                Ok(snapshot_type) => vec![snapshot_type],
                Err(_) => {
                    errors.push(format!(
                        "Invalid snapshot type '{}', expected one of {}",
                        name, "overview, posts, users, popular"
                    ));
                    Vec::new()
                }
            },
        };

        let end_date = match &request.end_date {
            Some(value) => parse_date(value, "end_date")
                .map_err(|e| errors.push(e.to_string()))
                .ok(),
            None => Some(yesterday(today)),
        };
        let start_date = match (&request.start_date, end_date) {
            (Some(value), _) => parse_date(value, "start_date")
                .map_err(|e| errors.push(e.to_string()))
                .ok(),
            (None, Some(end)) => Some(end - Duration::days(i64::from(self.default_days) - 1)),
            (None, None) => None,
        };

        if let (Some(start), Some(end)) = (start_date, end_date) {
            if start > end {
                errors.push(format!(
                    "Start date {} must not be after end date {}",
                    start, end
                ));
            }
        }
        if let Some(end) = end_date {
            if end >= today {
                errors.push(format!(
                    "End date {} must be before today ({})",
                    end, today
                ));
            }
        }
        if !(1..=MAX_BATCH_SIZE).contains(&request.batch_size) {
            errors.push(format!(
                "Batch size {} must be between 1 and {}",
                request.batch_size, MAX_BATCH_SIZE
            ));
        }

        let (Some(start_date), Some(end_date)) = (start_date, end_date) else {
            return Err(StatsError::InvalidArguments { errors });
        };
        if !errors.is_empty() {
            return Err(StatsError::InvalidArguments { errors });
        }

        let days = days_inclusive(start_date, end_date);
        let mut tasks = Vec::new();
        for window in days.chunks(request.batch_size) {
            let (batch_start, batch_end) = (window[0], window[window.len() - 1]);
            for &snapshot_type in &types {
                let exists_already = self.window_exists(snapshot_type, window).await?;
                let action = if exists_already && !request.force {
                    TaskAction::Skip
                } else {
                    TaskAction::Process
                };
                tasks.push(BackfillTask {
                    snapshot_type,
                    batch_start,
                    batch_end,
                    exists_already,
                    action,
                });
            }
        }

        Ok(BackfillPlan {
            start_date,
            end_date,
            batch_size: request.batch_size,
            force: request.force,
            tasks,
        })
    }

    async fn window_exists(&self, snapshot_type: SnapshotType, days: &[NaiveDate]) -> Result<bool> {
        for day in days {
            if !self
                .service
                .repository()
                .exists(snapshot_type, &Period::daily(*day))
                .await?
            {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Run every `Process` task, one recomputation per day. A failing day is
    /// recorded against its task and never stops the remaining work.
    #[instrument(skip_all, fields(tasks = plan.tasks.len(), force = plan.force))]
    pub async fn execute(&self, plan: BackfillPlan) -> BackfillReport {
        let force = plan.force;
        let mut report = BackfillReport::new(false, Vec::new());

        for task in &plan.tasks {
            if task.action == TaskAction::Skip {
                report.skipped += 1;
                continue;
            }
            report.processed += 1;

            let tally = self.run_task(task, force).await;
            if tally.failed == 0 {
                report.succeeded += 1;
                continue;
            }

            report.failed += 1;
            let message = tally.last_error.unwrap_or_default();
            error!(
                snapshot_type = %task.snapshot_type,
                batch_start = %task.batch_start,
                batch_end = %task.batch_end,
                days_failed = tally.failed,
                error = %message,
                "Backfill task failed"
            );
            report.failures.push(TaskFailure {
                snapshot_type: task.snapshot_type,
                batch_start: task.batch_start,
                batch_end: task.batch_end,
                message,
                days_succeeded: tally.succeeded,
                days_failed: tally.failed,
                days_skipped: tally.skipped,
            });
        }

        info!(
            processed = report.processed,
            succeeded = report.succeeded,
            failed = report.failed,
            skipped = report.skipped,
            "Backfill finished"
        );
        report.tasks = plan.tasks;
        report
    }

    async fn run_task(&self, task: &BackfillTask, force: bool) -> DayTally {
        let mut tally = DayTally::default();

        for day in task.days() {
            let period = Period::daily(day);
            let outcome = self
                .service
                .recompute_snapshot(
                    task.snapshot_type,
                    &period,
                    force,
                    Some(SnapshotSource::Backfill.metadata()),
                )
                .await;

            match outcome {
                Ok(result) if result.is_skipped() => tally.skipped += 1,
                Ok(_) => tally.succeeded += 1,
                Err(StatsError::NoDataForPeriod { .. })
                | Err(StatsError::DuplicateSnapshot { .. }) => tally.skipped += 1,
                Err(e) => {
                    warn!(
                        snapshot_type = %task.snapshot_type,
                        day = %day,
                        error = %e,
                        "Backfill day failed"
                    );
                    tally.failed += 1;
                    tally.last_error = Some(format!("{}: {}", day, e));
                }
            }
        }

        tally
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2023, 1, d).unwrap()
    }

    fn task(d: u32, exists_already: bool, action: TaskAction) -> BackfillTask {
        BackfillTask {
            snapshot_type: SnapshotType::Overview,
            batch_start: date(d),
            batch_end: date(d + 1),
            exists_already,
            action,
        }
    }

    #[test]
    fn test_plan_counts_and_table() {
        let plan = BackfillPlan {
            start_date: date(1),
            end_date: date(4),
            batch_size: 2,
            force: false,
            tasks: vec![task(1, true, TaskAction::Skip), task(3, false, TaskAction::Process)],
        };

        assert_eq!(plan.process_count(), 1);
        assert_eq!(plan.skip_count(), 1);

        let table = plan.render_table();
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("TYPE"));
        assert!(lines[1].contains("2023-01-01") && lines[1].contains("skip"));
        assert!(lines[2].contains("2023-01-04") && lines[2].contains("process"));
        assert_eq!(lines[3], "2 task(s): 1 to process, 1 to skip");
    }

    #[test]
    fn test_task_days_are_inclusive() {
        assert_eq!(task(1, false, TaskAction::Process).days(), vec![date(1), date(2)]);
    }

    #[test]
    fn test_default_request() {
        let request = BackfillRequest::default();
        assert_eq!(request.batch_size, DEFAULT_BATCH_SIZE);
        assert!(!request.force && !request.dry_run);
        assert!(request.snapshot_type.is_none());
    }
}
