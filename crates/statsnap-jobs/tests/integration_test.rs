//! Integration tests for the scheduled and backfill jobs.

use chrono::{NaiveDate, TimeZone, Utc};
use statsnap_common::StatsError;
use statsnap_core::testing::{FixedActivitySource, FlakySource, WriteLimitedRepository};
use statsnap_core::{
    AggregationService, AggregationSettings, InMemorySnapshotRepository, Period, PostActivitySource,
    SnapshotRepository, SnapshotType, TaggedCache,
};
use statsnap_jobs::{
    lease_key, local_hostname, BackfillJob, BackfillRequest, FileLeaseStore, LeaseManager,
    LeaseRecord, LeaseStore, MemoryLeaseStore, ProcessLivenessChecker, ScheduledSnapshotJob,
    TaskAction,
};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

struct FixedLiveness(bool);

impl ProcessLivenessChecker for FixedLiveness {
    fn is_alive(&self, _pid: u32) -> bool {
        self.0
    }
}

fn service_with(
    posts: Arc<dyn PostActivitySource>,
    repository: Arc<dyn SnapshotRepository>,
) -> AggregationService {
    AggregationService::new(
        posts,
        Arc::new(FixedActivitySource::default()),
        repository,
        Arc::new(TaggedCache::default()),
        AggregationSettings::default(),
    )
}

fn service() -> (AggregationService, Arc<InMemorySnapshotRepository>) {
    let repository = Arc::new(InMemorySnapshotRepository::new());
    let service = service_with(Arc::new(FixedActivitySource::default()), repository.clone());
    (service, repository)
}

fn leases(store: Arc<dyn LeaseStore>, alive: bool) -> LeaseManager {
    LeaseManager::new(store, Arc::new(FixedLiveness(alive)), None)
}

fn scheduled(service: AggregationService, store: Arc<dyn LeaseStore>) -> ScheduledSnapshotJob {
    ScheduledSnapshotJob::new(service, leases(store, true), Duration::ZERO)
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

#[tokio::test]
async fn test_daily_run_stores_every_type() {
    let (service, repository) = service();
    let dir = TempDir::new().unwrap();
    let store: Arc<dyn LeaseStore> = Arc::new(FileLeaseStore::new(dir.path()).unwrap());
    let job = scheduled(service, store.clone());
    let now = Utc.with_ymd_and_hms(2024, 1, 2, 3, 0, 0).unwrap();

    let report = job.execute_at(now, &["daily"], 2, false).await.unwrap();

    assert_eq!(report.total_snapshots, 4);
    assert_eq!(report.successful_snapshots, 4);
    assert_eq!(report.failed_snapshots, 0);
    assert_eq!(report.retries, 0);
    assert!(report.errors.is_empty());
    assert_eq!(repository.len().await, 4);

    let yesterday = Period::daily(date(2024, 1, 1));
    for snapshot_type in SnapshotType::ALL {
        assert!(repository.exists(snapshot_type, &yesterday).await.unwrap());
    }
    assert!(store.read(&lease_key(&["daily"])).unwrap().is_none());
}

#[tokio::test]
async fn test_second_run_skips_existing_snapshots() {
    let (service, repository) = service();
    let job = scheduled(service, Arc::new(MemoryLeaseStore::new()));
    let now = Utc.with_ymd_and_hms(2024, 1, 2, 3, 0, 0).unwrap();

    job.execute_at(now, &["daily"], 0, false).await.unwrap();
    let rerun = job.execute_at(now, &["daily"], 0, false).await.unwrap();
    assert_eq!(rerun.skipped_snapshots, 4);
    assert_eq!(rerun.successful_snapshots, 0);

    let forced = job.execute_at(now, &["daily"], 0, true).await.unwrap();
    assert_eq!(forced.successful_snapshots, 4);
    assert_eq!(repository.len().await, 4);
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    for failures in 0..=2 {
        let repository = Arc::new(InMemorySnapshotRepository::new());
        let flaky = Arc::new(FlakySource::new(FixedActivitySource::default(), failures));
        let job = scheduled(
            service_with(flaky, repository.clone()),
            Arc::new(MemoryLeaseStore::new()),
        );
        let now = Utc.with_ymd_and_hms(2024, 1, 2, 3, 0, 0).unwrap();

        let report = job.execute_at(now, &["daily"], 2, false).await.unwrap();
        assert_eq!(report.retries, failures as u32);
        assert_eq!(report.successful_snapshots, 4);
        assert!(!report.has_failures());
    }
}

#[tokio::test]
async fn test_exhausted_retries_are_reported() {
    let repository = Arc::new(InMemorySnapshotRepository::new());
    let flaky = Arc::new(FlakySource::new(FixedActivitySource::default(), 3));
    let job = scheduled(service_with(flaky, repository.clone()), Arc::new(MemoryLeaseStore::new()));
    let now = Utc.with_ymd_and_hms(2024, 1, 2, 3, 0, 0).unwrap();

    let report = job.execute_at(now, &["daily"], 2, false).await.unwrap();

    assert_eq!(report.failed_snapshots, 1);
    assert_eq!(report.successful_snapshots, 3);
    assert_eq!(report.retries, 2);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].snapshot_type, SnapshotType::Overview);
    assert_eq!(report.errors[0].retries, 2);
    assert_eq!(report.errors[0].period, "daily:2024-01-01");
    assert_eq!(repository.len().await, 3);
}

#[tokio::test]
async fn test_live_lease_blocks_run() {
    let (service, repository) = service();
    let store: Arc<dyn LeaseStore> = Arc::new(MemoryLeaseStore::new());
    let now = Utc.with_ymd_and_hms(2024, 1, 2, 3, 0, 0).unwrap();
    let record = LeaseRecord {
        owner_pid: 4242,
        started_at: now,
        periods: vec!["daily".to_string()],
        hostname: local_hostname(),
    };
    assert!(store.try_create(&lease_key(&["daily"]), &record).unwrap());

    let job = scheduled(service.clone(), store.clone());
    let error = job.execute_at(now, &["daily"], 0, false).await.unwrap_err();
    assert!(matches!(
        error,
        StatsError::ConcurrentExecution { owner_pid: 4242, .. }
    ));
    assert!(repository.is_empty().await);

    // Same record, but its owner is gone
    let job = ScheduledSnapshotJob::new(service, leases(store.clone(), false), Duration::ZERO);
    let report = job.execute_at(now, &["daily"], 0, false).await.unwrap();
    assert_eq!(report.successful_snapshots, 4);
    assert!(store.read(&lease_key(&["daily"])).unwrap().is_none());
}

#[tokio::test]
async fn test_weekly_and_monthly_runs_use_previous_complete_windows() {
    let (service, repository) = service();
    let job = scheduled(service, Arc::new(MemoryLeaseStore::new()));
    // Wednesday
    let now = Utc.with_ymd_and_hms(2024, 3, 13, 15, 30, 0).unwrap();

    let report = job
        .execute_at(now, &["weekly", "monthly", "weekly"], 0, false)
        .await
        .unwrap();
    assert_eq!(report.total_snapshots, 8);
    assert_eq!(report.successful_snapshots, 8);
    assert_eq!(repository.len().await, 8);

    let week = Period::weekly(date(2024, 3, 4));
    assert_eq!(week.last_date(), date(2024, 3, 10));
    let month = Period::monthly(date(2024, 2, 1));
    assert_eq!(month.last_date(), date(2024, 2, 29));
    for snapshot_type in SnapshotType::ALL {
        assert!(repository.exists(snapshot_type, &week).await.unwrap());
        assert!(repository.exists(snapshot_type, &month).await.unwrap());
    }
}

/// Alive only for this test process
struct CurrentProcessLiveness;

impl ProcessLivenessChecker for CurrentProcessLiveness {
    fn is_alive(&self, pid: u32) -> bool {
        pid == std::process::id()
    }
}

#[test]
fn test_contended_reclaim_hands_lease_to_one_run() {
    let dir = TempDir::new().unwrap();
    let key = lease_key(&["daily"]);
    let abandoned = LeaseRecord {
        owner_pid: 3_999_999,
        started_at: Utc::now() - chrono::Duration::hours(1),
        periods: vec!["daily".to_string()],
        hostname: local_hostname(),
    };

    for _ in 0..200 {
        let store: Arc<dyn LeaseStore> = Arc::new(FileLeaseStore::new(dir.path()).unwrap());
        assert!(store.try_create(&key, &abandoned).unwrap());

        let barrier = Barrier::new(2);
        let acquired: Vec<bool> = thread::scope(|scope| {
            let contenders: Vec<_> = (0..2)
                .map(|_| {
                    let manager = LeaseManager::new(
                        store.clone(),
                        Arc::new(CurrentProcessLiveness),
                        None,
                    );
                    let barrier = &barrier;
                    scope.spawn(move || {
                        barrier.wait();
                        // Keep the guard alive so the winner still holds the lease
                        manager.acquire(&["daily"], Utc::now()).map(std::mem::forget).is_ok()
                    })
                })
                .collect();
            contenders.into_iter().map(|handle| handle.join().unwrap()).collect()
        });

        assert_eq!(acquired.iter().filter(|won| **won).count(), 1);
        let holder = store.read(&key).unwrap().unwrap();
        assert_eq!(holder.owner_pid, std::process::id());
        std::fs::remove_file(dir.path().join(format!("statsnap-{}.lease", key))).unwrap();
    }
}

#[tokio::test]
async fn test_invalid_periods_are_rejected_before_leasing() {
    let (service, _) = service();
    let store: Arc<dyn LeaseStore> = Arc::new(MemoryLeaseStore::new());
    let job = scheduled(service, store.clone());

    let error = job.execute(&["daily", "hourly"], 0, false).await.unwrap_err();
    assert!(matches!(error, StatsError::UnsupportedPeriod { .. }));
    assert!(store.read(&lease_key(&["daily", "hourly"])).unwrap().is_none());
}

#[tokio::test]
async fn test_backfill_dry_run_plans_without_writing() {
    let (service, repository) = service();
    let job = BackfillJob::new(service);
    let request = BackfillRequest {
        snapshot_type: Some("overview".to_string()),
        start_date: Some("2023-01-01".to_string()),
        end_date: Some("2023-01-03".to_string()),
        batch_size: 1,
        dry_run: true,
        ..BackfillRequest::default()
    };

    let report = job.run_at(&request, date(2024, 1, 1)).await.unwrap();

    assert!(report.dry_run);
    assert_eq!(report.tasks.len(), 3);
    assert!(report.tasks.iter().all(|task| task.action == TaskAction::Process));
    assert!(report.tasks.iter().all(|task| task.batch_start == task.batch_end));
    assert_eq!(report.tasks[2].batch_start, date(2023, 1, 3));
    assert_eq!(report.processed, 0);
    assert!(repository.is_empty().await);
}

#[tokio::test]
async fn test_backfill_reports_every_invalid_argument() {
    let (service, _) = service();
    let job = BackfillJob::new(service);
    let request = BackfillRequest {
        snapshot_type: Some("bogus".to_string()),
        start_date: Some("2023-02-01".to_string()),
        end_date: Some("2023-01-01".to_string()),
        batch_size: 0,
        ..BackfillRequest::default()
    };

    match job.plan_at(&request, date(2024, 1, 1)).await {
        Err(StatsError::InvalidArguments { errors }) => {
            assert_eq!(errors.len(), 3, "{:?}", errors);
            assert!(errors[0].contains("bogus"));
        }
        other => panic!("expected invalid arguments, got {:?}", other),
    }

    let request = BackfillRequest {
        start_date: Some("2023-13-01".to_string()),
        end_date: Some("2024-01-01".to_string()),
        ..BackfillRequest::default()
    };
    match job.plan_at(&request, date(2024, 1, 1)).await {
        Err(StatsError::InvalidArguments { errors }) => {
            assert_eq!(errors.len(), 2, "{:?}", errors);
            assert!(errors[1].contains("before today"));
        }
        other => panic!("expected invalid arguments, got {:?}", other),
    }
}

#[tokio::test]
async fn test_backfill_default_range_ends_yesterday() {
    let (service, _) = service();
    let job = BackfillJob::new(service);

    let plan = job
        .plan_at(&BackfillRequest::default(), date(2024, 1, 31))
        .await
        .unwrap();

    assert_eq!(plan.start_date, date(2024, 1, 1));
    assert_eq!(plan.end_date, date(2024, 1, 30));
    assert_eq!(plan.tasks.len(), 4);
}

#[tokio::test]
async fn test_backfill_skips_complete_windows() {
    let (service, repository) = service();
    service
        .create_overview_snapshot(&Period::daily(date(2023, 1, 2)), None)
        .await
        .unwrap();
    let job = BackfillJob::new(service);
    let request = BackfillRequest {
        snapshot_type: Some("overview".to_string()),
        start_date: Some("2023-01-01".to_string()),
        end_date: Some("2023-01-03".to_string()),
        batch_size: 1,
        ..BackfillRequest::default()
    };

    let report = job.run_at(&request, date(2024, 1, 1)).await.unwrap();

    assert!(report.is_success());
    assert_eq!(report.processed, 2);
    assert_eq!(report.succeeded, 2);
    assert_eq!(report.skipped, 1);
    assert_eq!(repository.len().await, 3);
}

#[tokio::test]
async fn test_backfill_isolates_failed_days() {
    let repository: Arc<dyn SnapshotRepository> = Arc::new(WriteLimitedRepository::new(1));
    let service = service_with(Arc::new(FixedActivitySource::default()), repository.clone());
    let job = BackfillJob::new(service);
    let request = BackfillRequest {
        snapshot_type: Some("overview".to_string()),
        start_date: Some("2023-01-01".to_string()),
        end_date: Some("2023-01-03".to_string()),
        batch_size: 3,
        ..BackfillRequest::default()
    };

    let report = job.run_at(&request, date(2024, 1, 1)).await.unwrap();

    assert!(!report.is_success());
    assert_eq!(report.processed, 1);
    assert_eq!(report.failed, 1);
    let failure = &report.failures[0];
    assert_eq!(failure.days_succeeded, 1);
    assert_eq!(failure.days_failed, 2);
    assert!(failure.message.starts_with("2023-01-03"));
    assert!(repository
        .exists(SnapshotType::Overview, &Period::daily(date(2023, 1, 1)))
        .await
        .unwrap());
}
