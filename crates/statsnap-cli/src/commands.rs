//! Subcommand handlers and adapter wiring

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use serde::Serialize;
use statsnap_common::utils::{format_timestamp, parse_date, start_of_day};
use statsnap_config::AppConfig;
use statsnap_core::{
    ActivityDump, AggregationService, AggregationSettings, CacheConfig, FileSnapshotRepository,
    Granularity, Period, RecordActivitySource, SnapshotReader, SnapshotType, TaggedCache,
    TrendReport,
};
use statsnap_jobs::{
    BackfillJob, BackfillRequest, FileLeaseStore, LeaseManager, ProcfsLivenessChecker,
    ScheduledSnapshotJob,
};
use statsnap_processors::{TrendAnalysis, TrendAnalysisProcessor, TrendOptions};
use std::collections::BTreeMap;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Adapters built from configuration
pub struct Runtime {
    pub config: AppConfig,
    pub service: AggregationService,
    pub cache: Arc<TaggedCache>,
}

impl Runtime {
    /// Open the snapshot store and, when `with_activity` is set, the activity dump
    pub fn open(config: AppConfig, with_activity: bool) -> Result<Self> {
        let repository = Arc::new(
            FileSnapshotRepository::open(&config.storage.snapshots_path)
                .context("Failed to open snapshot store")?,
        );

        let dump = if with_activity {
            ActivityDump::load(&config.storage.activity_path)
                .context("Failed to load activity dump")?
        } else {
            ActivityDump::default()
        };
        let source = Arc::new(RecordActivitySource::new(dump));

        let cache = Arc::new(TaggedCache::new(CacheConfig {
            max_capacity: config.cache.max_capacity,
            ttl: config.cache.ttl(),
        }));

        let settings = AggregationSettings {
            snapshot_ttl: config.snapshots.ttl(),
            popular_limit: config.snapshots.popular_limit,
            most_active_limit: config.snapshots.most_active_limit,
        };

        let service =
            AggregationService::new(source.clone(), source, repository, cache.clone(), settings);
        Ok(Self {
            config,
            service,
            cache,
        })
    }

    fn leases(&self) -> Result<LeaseManager> {
        let store = FileLeaseStore::new(&self.config.lease.directory)
            .context("Failed to prepare lease directory")?;
        Ok(LeaseManager::new(
            Arc::new(store),
            Arc::new(ProcfsLivenessChecker::default()),
            self.config.lease.max_age(),
        ))
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// `statsnap snapshot`
pub async fn snapshot(
    runtime: &Runtime,
    periods: Vec<String>,
    max_retries: Option<u32>,
    force: bool,
) -> Result<ExitCode> {
    let scheduling = &runtime.config.scheduling;
    let periods = if periods.is_empty() {
        scheduling.periods.clone()
    } else {
        periods
    };
    let max_retries = max_retries.unwrap_or(scheduling.max_retries);

    let job = ScheduledSnapshotJob::new(
        runtime.service.clone(),
        runtime.leases()?,
        scheduling.retry_base_delay(),
    );
    let report = job.execute(&periods, max_retries, force).await?;
    print_json(&report)?;

    Ok(if report.has_failures() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

/// `statsnap backfill`
pub async fn backfill(runtime: &Runtime, mut request: BackfillRequest) -> Result<ExitCode> {
    if request
        .snapshot_type
        .as_deref()
        .is_some_and(|name| name.eq_ignore_ascii_case("all"))
    {
        request.snapshot_type = None;
    }

    let job = BackfillJob::new(runtime.service.clone())
        .with_default_days(runtime.config.backfill.default_days);
    let today = Utc::now().date_naive();

    if request.dry_run {
        let plan = job.plan_at(&request, today).await?;
        println!("{}", plan.render_table());
        return Ok(ExitCode::SUCCESS);
    }

    let report = job.run_at(&request, today).await?;
    println!(
        "Backfill complete: {} succeeded, {} failed, {} skipped",
        report.succeeded, report.failed, report.skipped
    );
    for failure in &report.failures {
        println!(
            "  {} {}..{}: {} ({} of {} days failed)",
            failure.snapshot_type,
            failure.batch_start,
            failure.batch_end,
            failure.message,
            failure.days_failed,
            failure.days_succeeded + failure.days_failed + failure.days_skipped
        );
    }

    Ok(if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// `statsnap clean`
pub async fn clean(runtime: &Runtime, before: Option<String>) -> Result<ExitCode> {
    let before = match before {
        Some(value) => start_of_day(parse_date(&value, "before")?),
        None => Utc::now(),
    };
    let removed = runtime.service.clean_expired_snapshots(before).await?;
    println!("Removed {} snapshot(s) expired by {}", removed, format_timestamp(before));
    Ok(ExitCode::SUCCESS)
}

fn period_for(granularity: &str, date: &str) -> Result<Period> {
    let granularity: Granularity = granularity.parse()?;
    let date: NaiveDate = parse_date(date, "date")?;
    Ok(Period::containing(granularity, date))
}

/// `statsnap show`
pub async fn show(
    runtime: &Runtime,
    snapshot_type: &str,
    period: &str,
    date: &str,
) -> Result<ExitCode> {
    let snapshot_type: SnapshotType = snapshot_type.parse()?;
    let period = period_for(period, date)?;
    let reader = SnapshotReader::new(
        runtime.service.repository().clone(),
        runtime.cache.clone(),
        runtime.config.cache.ttl(),
    );

    let found = reader.find(snapshot_type, &period).await?;
    let stats = runtime.cache.stats();
    debug!(hits = stats.hits, misses = stats.misses, entries = stats.entries, "Cache usage");

    match found {
        Some(snapshot) => {
            print_json(&snapshot)?;
            Ok(ExitCode::SUCCESS)
        }
        None => {
            warn!(snapshot_type = %snapshot_type, period = %period, "No snapshot stored");
            Ok(ExitCode::FAILURE)
        }
    }
}

#[derive(Debug, Serialize)]
struct TrendOutput {
    report: TrendReport,
    /// Per-metric analysis over the most recent stored snapshots of the same granularity
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    history: BTreeMap<String, TrendAnalysis>,
}

/// `statsnap trends`
pub async fn trends(
    runtime: &Runtime,
    snapshot_type: &str,
    period: &str,
    date: &str,
    history: usize,
) -> Result<ExitCode> {
    let snapshot_type: SnapshotType = snapshot_type.parse()?;
    let current = period_for(period, date)?;
    let previous = current.previous();

    let report = runtime
        .service
        .calculate_trends(&current, &previous, snapshot_type)
        .await?;

    let history = if history >= 2 {
        metric_history(runtime, snapshot_type, &current, history).await?
    } else {
        BTreeMap::new()
    };

    print_json(&TrendOutput { report, history })?;
    Ok(ExitCode::SUCCESS)
}

async fn metric_history(
    runtime: &Runtime,
    snapshot_type: SnapshotType,
    current: &Period,
    limit: usize,
) -> Result<BTreeMap<String, TrendAnalysis>> {
    let mut snapshots: Vec<_> = runtime
        .service
        .repository()
        .find_by_type(snapshot_type)
        .await?
        .into_iter()
        .filter(|snapshot| {
            snapshot.period.granularity() == current.granularity()
                && snapshot.period.start_time() <= current.start_time()
        })
        .collect();
    snapshots.sort_by_key(|snapshot| snapshot.period.start_time());
    let skip = snapshots.len().saturating_sub(limit);
    let snapshots = &snapshots[skip..];

    let mut series: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    for snapshot in snapshots {
        for (key, value) in snapshot.numeric_metrics() {
            series.entry(key).or_default().push(value);
        }
    }

    let processor = TrendAnalysisProcessor::new(TrendOptions::default());
    let mut analyses = BTreeMap::new();
    // Metrics missing from some snapshots are left out
    for (key, values) in series.into_iter().filter(|(_, values)| values.len() == snapshots.len()) {
        analyses.insert(key, processor.analyze(&values)?);
    }

    info!(snapshots = snapshots.len(), metrics = analyses.len(), "Analyzed metric history");
    Ok(analyses)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn config_in(dir: &TempDir) -> AppConfig {
        let mut config = AppConfig::default();
        let path = |name: &str| dir.path().join(name).to_string_lossy().into_owned();
        config.storage.snapshots_path = path("snapshots.json");
        config.storage.activity_path = path("activity.json");
        config.lease.directory = path("leases");
        config.scheduling.retry_base_delay_ms = 0;
        config
    }

    fn write_activity(config: &AppConfig) {
        let dump = json!({
            "posts": [
                {"id": "p1", "author_id": "u1", "status": "published", "source": "web",
                 "views": 10, "body_length": 120, "created_at": "2023-01-02T10:00:00Z"},
                {"id": "p2", "author_id": "u2", "status": "draft", "source": "api",
                 "views": 3, "body_length": 40, "created_at": "2023-01-03T12:00:00Z"}
            ],
            "users": [
                {"id": "u1", "username": "ada", "registered_at": "2022-12-01T00:00:00Z",
                 "activity": ["2023-01-02T10:00:00Z"]},
                {"id": "u2", "username": "lin", "registered_at": "2023-01-03T09:00:00Z",
                 "activity": ["2023-01-03T12:00:00Z"]}
            ]
        });
        std::fs::write(&config.storage.activity_path, dump.to_string()).unwrap();
    }

    #[tokio::test]
    async fn test_backfill_then_trends() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);
        write_activity(&config);
        let runtime = Runtime::open(config, true).unwrap();

        let request = BackfillRequest {
            snapshot_type: Some("all".to_string()),
            start_date: Some("2023-01-01".to_string()),
            end_date: Some("2023-01-04".to_string()),
            batch_size: 2,
            ..BackfillRequest::default()
        };
        let code = backfill(&runtime, request).await.unwrap();
        assert_eq!(code, ExitCode::SUCCESS);

        let code = trends(&runtime, "overview", "daily", "2023-01-03", 4).await.unwrap();
        assert_eq!(code, ExitCode::SUCCESS);

        let code = show(&runtime, "overview", "daily", "2023-01-02").await.unwrap();
        assert_eq!(code, ExitCode::SUCCESS);
    }

    #[tokio::test]
    async fn test_snapshot_releases_lease() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);
        write_activity(&config);
        let lease_dir = config.lease.directory.clone();
        let runtime = Runtime::open(config, true).unwrap();

        snapshot(&runtime, vec!["daily".to_string()], Some(0), false).await.unwrap();

        let leases = std::fs::read_dir(lease_dir)
            .unwrap()
            .filter(|entry| {
                let path = entry.as_ref().unwrap().path();
                path.extension().is_some_and(|extension| extension == "lease")
            })
            .count();
        assert_eq!(leases, 0);
    }

    #[tokio::test]
    async fn test_clean_removes_snapshots_expired_by_date() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);
        write_activity(&config);
        let runtime = Runtime::open(config.clone(), true).unwrap();

        let request = BackfillRequest {
            snapshot_type: Some("overview".to_string()),
            start_date: Some("2023-01-02".to_string()),
            end_date: Some("2023-01-02".to_string()),
            ..BackfillRequest::default()
        };
        backfill(&runtime, request).await.unwrap();

        let code = clean(&runtime, Some("2023-06-01".to_string())).await.unwrap();
        assert_eq!(code, ExitCode::SUCCESS);
        let code = show(&runtime, "overview", "daily", "2023-01-02").await.unwrap();
        assert_eq!(code, ExitCode::SUCCESS);

        clean(&runtime, Some("2999-01-01".to_string())).await.unwrap();
        let reopened = Runtime::open(config, false).unwrap();
        let code = show(&reopened, "overview", "daily", "2023-01-02").await.unwrap();
        assert_eq!(code, ExitCode::FAILURE);

        assert!(clean(&runtime, Some("yesterday".to_string())).await.is_err());
    }

    #[tokio::test]
    async fn test_show_missing_snapshot_fails() {
        let dir = TempDir::new().unwrap();
        let runtime = Runtime::open(config_in(&dir), false).unwrap();

        let code = show(&runtime, "posts", "weekly", "2023-01-04").await.unwrap();
        assert_eq!(code, ExitCode::FAILURE);
        assert!(show(&runtime, "posts", "hourly", "2023-01-04").await.is_err());
    }
}
