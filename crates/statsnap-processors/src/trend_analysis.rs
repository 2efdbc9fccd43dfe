//! Trend analysis and statistical calculations over numeric series

use serde::{Deserialize, Serialize};
use statsnap_common::{Result, StatsError};

/// Number of phases in the seasonal index
pub const SEASON_LENGTH: usize = 12;

/// Window used when a series is too short for seasonal adjustment
const SEASONAL_FALLBACK_WINDOW: usize = 3;

/// Statistical indicators for a series
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrendStatistics {
    /// Total count of data points
    pub count: usize,
    /// Total sum of values
    pub sum: f64,
    /// Mean (average) value
    pub mean: f64,
    /// Median value
    pub median: f64,
    /// Minimum value in the dataset
    pub min: f64,
    /// Maximum value in the dataset
    pub max: f64,
    /// Population variance
    pub variance: f64,
    /// Standard deviation
    pub std_dev: f64,
    /// `max - min`
    pub range: f64,
}

/// Direction of trend movement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendDirection {
    Increasing,
    Decreasing,
    Stable,
    Volatile,
}

/// Ordinary least squares fit over index positions `1..=n`
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LinearTrend {
    pub slope: f64,
    pub intercept: f64,
    pub r_squared: f64,
}

impl LinearTrend {
    /// Fitted value at position `x` (1-based)
    pub fn value_at(&self, x: f64) -> f64 {
        self.slope * x + self.intercept
    }
}

/// Which parts of the analysis to compute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendOptions {
    pub moving_average_window: usize,
    pub forecast_periods: usize,
    pub seasonal_adjustment: bool,
}

impl Default for TrendOptions {
    fn default() -> Self {
        Self {
            moving_average_window: 3,
            forecast_periods: 3,
            seasonal_adjustment: true,
        }
    }
}

/// Complete trend analysis result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendAnalysis {
    /// Basic statistical indicators
    pub statistics: TrendStatistics,
    pub direction: TrendDirection,
    pub trend: LinearTrend,
    pub moving_average: Vec<f64>,
    /// Empty when seasonal adjustment is disabled
    pub seasonal_adjusted: Vec<f64>,
    pub growth_rates: Vec<f64>,
    pub forecast: Vec<f64>,
}

/// Trend analyzer for statistics series
#[derive(Debug, Clone, Default)]
pub struct TrendAnalysisProcessor {
    options: TrendOptions,
}

impl TrendAnalysisProcessor {
    pub fn new(options: TrendOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &TrendOptions {
        &self.options
    }

    /// Run every configured calculation over `values`
    pub fn analyze(&self, values: &[f64]) -> Result<TrendAnalysis> {
        let moving_average = Self::moving_average(values, self.options.moving_average_window)?;
        let seasonal_adjusted = if self.options.seasonal_adjustment {
            Self::seasonal_adjustment(values)
        } else {
            Vec::new()
        };

        Ok(TrendAnalysis {
            statistics: Self::descriptive_stats(values),
            direction: Self::direction(values),
            trend: Self::linear_trend(values),
            moving_average,
            seasonal_adjusted,
            growth_rates: Self::growth_rates(values),
            forecast: Self::forecast(values, self.options.forecast_periods),
        })
    }

    /// Calculate basic statistical indicators; all zeros for an empty series
    pub fn descriptive_stats(values: &[f64]) -> TrendStatistics {
        if values.is_empty() {
            return TrendStatistics::default();
        }

        let mut sorted_values = values.to_vec();
        sorted_values.sort_by(f64::total_cmp);

        let count = values.len();
        let min = sorted_values[0];
        let max = sorted_values[count - 1];
        let sum: f64 = values.iter().sum();
        let mean = sum / count as f64;

        let median = if count % 2 == 0 {
            (sorted_values[count / 2 - 1] + sorted_values[count / 2]) / 2.0
        } else {
            sorted_values[count / 2]
        };

        let variance: f64 = values.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / count as f64;

        TrendStatistics {
            count,
            sum,
            mean,
            median,
            min,
            max,
            variance,
            std_dev: variance.sqrt(),
            range: max - min,
        }
    }

    /// Determine the overall trend direction from step-wise movements
    pub fn direction(values: &[f64]) -> TrendDirection {
        if values.len() < 3 {
            return TrendDirection::Stable;
        }

        let mut increasing_count = 0;
        let mut decreasing_count = 0;

        for window in values.windows(2) {
            if window[1] > window[0] {
                increasing_count += 1;
            } else if window[1] < window[0] {
                decreasing_count += 1;
            }
        }

        let total_comparisons = (values.len() - 1) as f64;
        let increasing_ratio = increasing_count as f64 / total_comparisons;
        let decreasing_ratio = decreasing_count as f64 / total_comparisons;

        if increasing_ratio > 0.6 {
            TrendDirection::Increasing
        } else if decreasing_ratio > 0.6 {
            TrendDirection::Decreasing
        } else if increasing_count + decreasing_count > 0
            && (increasing_ratio - decreasing_ratio).abs() < 0.2
        {
            TrendDirection::Volatile
        } else {
            TrendDirection::Stable
        }
    }

    /// Fit a line through `(1, v1) .. (n, vn)` using linear regression
    pub fn linear_trend(values: &[f64]) -> LinearTrend {
        match values.len() {
            0 => return LinearTrend::default(),
            1 => {
                return LinearTrend {
                    slope: 0.0,
                    intercept: values[0],
                    r_squared: 1.0,
                }
            }
            _ => {}
        }

        let n = values.len() as f64;
        let x_values: Vec<f64> = (1..=values.len()).map(|x| x as f64).collect();
        let sum_x: f64 = x_values.iter().sum();
        let sum_y: f64 = values.iter().sum();
        let sum_xy: f64 = x_values.iter().zip(values).map(|(x, y)| x * y).sum();
        let sum_x_squared: f64 = x_values.iter().map(|x| x.powi(2)).sum();

        let slope = (n * sum_xy - sum_x * sum_y) / (n * sum_x_squared - sum_x.powi(2));
        let intercept = (sum_y - slope * sum_x) / n;

        let mean_y = sum_y / n;
        let total_sum_squares: f64 = values.iter().map(|y| (y - mean_y).powi(2)).sum();
        let residual_sum_squares: f64 = x_values
            .iter()
            .zip(values)
            .map(|(x, y)| (y - (slope * x + intercept)).powi(2))
            .sum();

        let r_squared = if total_sum_squares == 0.0 {
            1.0
        } else {
            1.0 - residual_sum_squares / total_sum_squares
        };

        LinearTrend {
            slope,
            intercept,
            r_squared,
        }
    }

    /// Cumulative mean for the first `window - 1` points, sliding mean afterwards
    pub fn moving_average(values: &[f64], window: usize) -> Result<Vec<f64>> {
        if window == 0 {
            return Err(StatsError::validation_field(
                "Moving average window must be at least 1",
                "moving_average_window",
            ));
        }

        let mut averages = Vec::with_capacity(values.len());
        let mut running_sum = 0.0;

        for (i, value) in values.iter().enumerate() {
            running_sum += value;
            if i >= window {
                running_sum -= values[i - window];
            }
            let span = (i + 1).min(window);
            averages.push(running_sum / span as f64);
        }

        Ok(averages)
    }

    /// Scale each value by the index of its phase (`i mod 12`).
    ///
    /// Series shorter than one full season fall back to a 3-point moving average.
    pub fn seasonal_adjustment(values: &[f64]) -> Vec<f64> {
        if values.len() < SEASON_LENGTH {
            return Self::moving_average(values, SEASONAL_FALLBACK_WINDOW).unwrap_or_default();
        }

        let index = Self::seasonal_index(values);
        values
            .iter()
            .enumerate()
            .map(|(i, value)| value * index[i % SEASON_LENGTH])
            .collect()
    }

    /// Phase means normalized so that the index averages to 1
    pub fn seasonal_index(values: &[f64]) -> [f64; SEASON_LENGTH] {
        let mut sums = [0.0; SEASON_LENGTH];
        let mut counts = [0usize; SEASON_LENGTH];
        for (i, value) in values.iter().enumerate() {
            sums[i % SEASON_LENGTH] += value;
            counts[i % SEASON_LENGTH] += 1;
        }

        let mut phase_means = [0.0; SEASON_LENGTH];
        for phase in 0..SEASON_LENGTH {
            if counts[phase] > 0 {
                phase_means[phase] = sums[phase] / counts[phase] as f64;
            }
        }

        let overall = phase_means.iter().sum::<f64>() / SEASON_LENGTH as f64;
        if overall == 0.0 {
            return [1.0; SEASON_LENGTH];
        }

        phase_means.map(|mean| mean / overall)
    }

    /// Percent change against the previous point; 0 at the start and after a zero
    pub fn growth_rates(values: &[f64]) -> Vec<f64> {
        let mut rates = Vec::with_capacity(values.len());
        if values.is_empty() {
            return rates;
        }

        rates.push(0.0);
        for window in values.windows(2) {
            let (previous, current) = (window[0], window[1]);
            rates.push(if previous == 0.0 {
                0.0
            } else {
                (current - previous) / previous * 100.0
            });
        }
        rates
    }

    /// Extend the fitted line `periods` steps past the end, never below zero
    pub fn forecast(values: &[f64], periods: usize) -> Vec<f64> {
        let Some(&last) = values.last() else {
            return Vec::new();
        };

        if values.len() < 3 {
            return vec![last; periods];
        }

        let trend = Self::linear_trend(values);
        let n = values.len();
        (n + 1..=n + periods)
            .map(|x| trend.value_at(x as f64).max(0.0))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < 1e-9,
            "expected {expected}, got {actual}"
        );
    }

    #[test]
    fn test_trend_analysis_basic() {
        let processor = TrendAnalysisProcessor::new(TrendOptions::default());
        let result = processor.analyze(&[10.0, 15.0, 12.0, 18.0, 20.0]).unwrap();

        assert_eq!(result.statistics.count, 5);
        assert_eq!(result.statistics.min, 10.0);
        assert_eq!(result.statistics.max, 20.0);
        assert_eq!(result.direction, TrendDirection::Increasing);
        assert_eq!(result.moving_average.len(), 5);
        assert_eq!(result.growth_rates.len(), 5);
        assert_eq!(result.forecast.len(), 3);
        // Short series: seasonal adjustment falls back to the 3-point moving average
        assert_eq!(result.seasonal_adjusted, result.moving_average);
    }

    #[test]
    fn test_statistics_calculation() {
        let stats = TrendAnalysisProcessor::descriptive_stats(&[10.0, 15.0, 12.0, 18.0, 20.0]);

        assert_eq!(stats.min, 10.0);
        assert_eq!(stats.max, 20.0);
        assert_eq!(stats.mean, 15.0);
        assert_eq!(stats.median, 15.0);
        assert_eq!(stats.sum, 75.0);
        assert_eq!(stats.count, 5);
        assert_eq!(stats.range, 10.0);
        assert_close(stats.variance, 13.6);
    }

    #[test]
    fn test_statistics_even_median_and_empty() {
        let stats = TrendAnalysisProcessor::descriptive_stats(&[4.0, 1.0, 3.0, 2.0]);
        assert_eq!(stats.median, 2.5);

        assert_eq!(
            TrendAnalysisProcessor::descriptive_stats(&[]),
            TrendStatistics::default()
        );
    }

    #[test]
    fn test_linear_trend_exact_line() {
        let trend = TrendAnalysisProcessor::linear_trend(&[3.0, 5.0, 7.0, 9.0]);
        assert_close(trend.slope, 2.0);
        assert_close(trend.intercept, 1.0);
        assert_close(trend.r_squared, 1.0);
    }

    #[test]
    fn test_moving_average_calculation() {
        let result =
            TrendAnalysisProcessor::moving_average(&[10.0, 15.0, 12.0, 18.0, 20.0], 3).unwrap();

        assert_eq!(result[0], 10.0);
        assert_eq!(result[1], 12.5);
        assert_close(result[2], (10.0 + 15.0 + 12.0) / 3.0);
        assert_close(result[3], (15.0 + 12.0 + 18.0) / 3.0);
        assert_close(result[4], (12.0 + 18.0 + 20.0) / 3.0);

        assert!(TrendAnalysisProcessor::moving_average(&[1.0], 0).is_err());
    }

    #[test]
    fn test_seasonal_index_is_normalized() {
        let values: Vec<f64> = (0..24).map(|i| (i % 12 + 1) as f64).collect();
        let index = TrendAnalysisProcessor::seasonal_index(&values);
        assert_close(index.iter().sum::<f64>() / SEASON_LENGTH as f64, 1.0);

        let adjusted = TrendAnalysisProcessor::seasonal_adjustment(&values);
        assert_eq!(adjusted.len(), 24);
        assert_close(adjusted[0], values[0] * index[0]);
        assert_close(adjusted[13], values[13] * index[1]);
    }

    #[test]
    fn test_seasonal_index_of_zeros_is_one() {
        let index = TrendAnalysisProcessor::seasonal_index(&[0.0; 12]);
        assert_eq!(index, [1.0; SEASON_LENGTH]);
    }

    #[test]
    fn test_growth_rates() {
        let rates = TrendAnalysisProcessor::growth_rates(&[0.0, 10.0, 15.0, 0.0, 5.0]);
        assert_eq!(rates, vec![0.0, 0.0, 50.0, -100.0, 0.0]);
        assert!(TrendAnalysisProcessor::growth_rates(&[]).is_empty());
    }

    #[test]
    fn test_forecast() {
        assert!(TrendAnalysisProcessor::forecast(&[], 3).is_empty());
        assert_eq!(TrendAnalysisProcessor::forecast(&[4.0, 6.0], 2), vec![6.0, 6.0]);

        let rising = TrendAnalysisProcessor::forecast(&[1.0, 2.0, 3.0], 2);
        assert_close(rising[0], 4.0);
        assert_close(rising[1], 5.0);

        let falling = TrendAnalysisProcessor::forecast(&[9.0, 5.0, 1.0], 3);
        assert_eq!(falling, vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_direction_classification() {
        assert_eq!(
            TrendAnalysisProcessor::direction(&[5.0, 4.0, 3.0, 2.0]),
            TrendDirection::Decreasing
        );
        assert_eq!(
            TrendAnalysisProcessor::direction(&[1.0, 3.0, 1.0, 3.0, 1.0]),
            TrendDirection::Volatile
        );
        assert_eq!(
            TrendAnalysisProcessor::direction(&[2.0, 2.0, 2.0]),
            TrendDirection::Stable
        );
    }

    proptest! {
        #[test]
        fn prop_moving_average_matches_window_mean(
            values in prop::collection::vec(-1_000.0f64..1_000.0, 1..40),
            window in 1usize..8,
        ) {
            let averages = TrendAnalysisProcessor::moving_average(&values, window).unwrap();
            prop_assert_eq!(averages.len(), values.len());
            for (i, average) in averages.iter().enumerate() {
                let start = (i + 1).saturating_sub(window);
                let slice = &values[start..=i];
                let expected = slice.iter().sum::<f64>() / slice.len() as f64;
                prop_assert!((average - expected).abs() < 1e-6);
            }
        }

        #[test]
        fn prop_growth_starts_at_zero_and_is_zero_after_zero(
            values in prop::collection::vec(prop_oneof![Just(0.0f64), 1.0f64..500.0], 1..40),
        ) {
            let rates = TrendAnalysisProcessor::growth_rates(&values);
            prop_assert_eq!(rates[0], 0.0);
            for i in 1..values.len() {
                if values[i - 1] == 0.0 {
                    prop_assert_eq!(rates[i], 0.0);
                }
            }
        }
    }
}
