//! Snapshot model, storage ports and the aggregation service
//!
//! This crate owns the [`Period`] and [`Snapshot`] value types, the traits the
//! pipeline consumes its collaborators through, in-memory and file-backed
//! adapters for them, and the [`AggregationService`] that ties them together.

pub mod activity;
pub mod cache;
pub mod period;
pub mod ports;
pub mod reader;
pub mod repository;
pub mod service;
pub mod snapshot;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export commonly used types
pub use activity::{ActivityDump, PostRecord, RecordActivitySource, UserRecord};
pub use cache::{remember, snapshot_tags, CacheConfig, TaggedCache, STATISTICS_TAG};
pub use period::{Granularity, Period};
pub use ports::{PostActivitySource, SnapshotRepository, StatisticsCache, UserActivitySource};
pub use reader::SnapshotReader;
pub use repository::{FileSnapshotRepository, InMemorySnapshotRepository};
pub use service::{
    AggregationService, AggregationSettings, ChangeDirection, MetricTrend, SnapshotOutcome,
    SnapshotSource, TrendReport,
};
pub use snapshot::{Metadata, Snapshot, SnapshotType, StatisticsData};
