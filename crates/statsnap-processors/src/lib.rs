//! Chart and trend transforms over statistics series

pub mod category;
pub mod time_series;
pub mod trend_analysis;

pub use category::{AlignedSeries, CategoryPoint, CategoryProcessor, NamedSeries, SortOrder};
pub use time_series::{SeriesPoint, TimeGranularity, TimeRange, TimeSeriesProcessor};
pub use trend_analysis::{
    LinearTrend, TrendAnalysis, TrendAnalysisProcessor, TrendDirection, TrendOptions,
    TrendStatistics,
};
