//! Category (label/value) chart transforms

use serde::{Deserialize, Serialize};
use statsnap_common::utils::round_to;
use std::collections::HashMap;

/// Label of the bucket aggregating everything below the top N
pub const OTHERS_LABEL: &str = "others";

/// Ten-step ranking palette, cycled by position
pub const DEFAULT_PALETTE: [&str; 10] = [
    "#e74c3c", // #1 - Red
    "#f39c12", // #2 - Orange
    "#f1c40f", // #3 - Yellow
    "#2ecc71", // #4 - Green
    "#3498db", // #5 - Blue
    "#9b59b6", // #6 - Purple
    "#1abc9c", // #7 - Teal
    "#34495e", // #8 - Dark gray
    "#95a5a6", // #9 - Gray
    "#7f8c8d", // #10 - Light gray
];

/// One labelled value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryPoint {
    pub label: String,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

impl CategoryPoint {
    pub fn new(label: impl Into<String>, value: f64) -> Self {
        Self {
            label: label.into(),
            value,
            color: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Descending,
    Ascending,
}

/// A named series in an aligned set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedSeries {
    pub name: String,
    pub values: Vec<f64>,
}

/// Several series sharing one label axis
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlignedSeries {
    pub labels: Vec<String>,
    pub series: Vec<NamedSeries>,
}

/// Transforms for categorical data such as "posts by status"
#[derive(Debug, Clone)]
pub struct CategoryProcessor {
    palette: Vec<String>,
}

impl Default for CategoryProcessor {
    fn default() -> Self {
        Self::with_palette(DEFAULT_PALETTE.iter().map(|color| color.to_string()).collect())
    }
}

impl CategoryProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a custom palette; an empty palette leaves colors unset
    pub fn with_palette(palette: Vec<String>) -> Self {
        Self { palette }
    }

    pub fn filter_non_negative(&self, points: Vec<CategoryPoint>) -> Vec<CategoryPoint> {
        points.into_iter().filter(|point| point.value >= 0.0).collect()
    }

    /// Stable sort by value; ties keep their input order
    pub fn sort(&self, mut points: Vec<CategoryPoint>, order: SortOrder) -> Vec<CategoryPoint> {
        match order {
            SortOrder::Descending => points.sort_by(|a, b| b.value.total_cmp(&a.value)),
            SortOrder::Ascending => points.sort_by(|a, b| a.value.total_cmp(&b.value)),
        }
        points
    }

    /// Keep the `n` largest points and fold the rest into an `others` bucket.
    pub fn top_n_with_others(&self, points: Vec<CategoryPoint>, n: usize) -> Vec<CategoryPoint> {
        let mut sorted = self.sort(points, SortOrder::Descending);
        if sorted.len() <= n {
            return sorted;
        }

        let remainder = sorted.split_off(n);
        let others: f64 = remainder.iter().map(|point| point.value).sum();
        sorted.push(CategoryPoint::new(OTHERS_LABEL, others));
        sorted
    }

    /// Convert values to a percentage of the total, rounded to two decimals.
    /// A zero total yields no points.
    pub fn to_percentages(&self, points: &[CategoryPoint]) -> Vec<CategoryPoint> {
        let total: f64 = points.iter().map(|point| point.value).sum();
        if total == 0.0 {
            return Vec::new();
        }

        points
            .iter()
            .map(|point| CategoryPoint {
                value: round_to(point.value / total * 100.0, 2),
                ..point.clone()
            })
            .collect()
    }

    /// Align series on the union of their labels in first-seen order,
    /// filling missing combinations with 0
    pub fn align_series(&self, series: &[(String, Vec<CategoryPoint>)]) -> AlignedSeries {
        let mut labels: Vec<String> = Vec::new();
        let mut positions: HashMap<String, usize> = HashMap::new();

        for (_, points) in series {
            for point in points {
                if !positions.contains_key(&point.label) {
                    positions.insert(point.label.clone(), labels.len());
                    labels.push(point.label.clone());
                }
            }
        }

        let series = series
            .iter()
            .map(|(name, points)| {
                let mut values = vec![0.0; labels.len()];
                for point in points {
                    if let Some(&position) = positions.get(&point.label) {
                        values[position] += point.value;
                    }
                }
                NamedSeries {
                    name: name.clone(),
                    values,
                }
            })
            .collect();

        AlignedSeries { labels, series }
    }

    /// Color each point by its position, cycling through the palette
    pub fn assign_colors(&self, points: Vec<CategoryPoint>) -> Vec<CategoryPoint> {
        if self.palette.is_empty() {
            return points;
        }

        points
            .into_iter()
            .enumerate()
            .map(|(i, point)| CategoryPoint {
                color: Some(self.palette[i % self.palette.len()].clone()),
                ..point
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn points(values: &[(&str, f64)]) -> Vec<CategoryPoint> {
        values
            .iter()
            .map(|(label, value)| CategoryPoint::new(*label, *value))
            .collect()
    }

    #[test]
    fn test_top_n_with_others() {
        let processor = CategoryProcessor::new();
        let data = points(&[("a", 50.0), ("b", 30.0), ("c", 10.0), ("d", 6.0), ("e", 4.0)]);

        let top = processor.top_n_with_others(data, 3);
        assert_eq!(top.len(), 4);
        assert_eq!(top[3].label, OTHERS_LABEL);
        assert_eq!(top[3].value, 10.0);
    }

    #[test]
    fn test_top_n_without_remainder_has_no_others() {
        let processor = CategoryProcessor::new();
        let top = processor.top_n_with_others(points(&[("a", 1.0), ("b", 2.0)]), 2);
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].label, "b");
    }

    #[test]
    fn test_sort_is_stable() {
        let processor = CategoryProcessor::new();
        let sorted = processor.sort(
            points(&[("x", 1.0), ("y", 3.0), ("z", 1.0)]),
            SortOrder::Descending,
        );
        let labels: Vec<&str> = sorted.iter().map(|p| p.label.as_str()).collect();
        assert_eq!(labels, vec!["y", "x", "z"]);

        let sorted = processor.sort(points(&[("x", 2.0), ("y", 1.0)]), SortOrder::Ascending);
        assert_eq!(sorted[0].label, "y");
    }

    #[test]
    fn test_filter_non_negative() {
        let processor = CategoryProcessor::new();
        let filtered =
            processor.filter_non_negative(points(&[("a", -1.0), ("b", 0.0), ("c", 2.0)]));
        assert_eq!(filtered.len(), 2);
    }

    #[test]
    fn test_to_percentages() {
        let processor = CategoryProcessor::new();
        let percentages = processor.to_percentages(&points(&[("a", 1.0), ("b", 2.0)]));
        assert_eq!(percentages[0].value, 33.33);
        assert_eq!(percentages[1].value, 66.67);

        assert!(processor
            .to_percentages(&points(&[("a", 0.0), ("b", 0.0)]))
            .is_empty());
    }

    #[test]
    fn test_align_series() {
        let processor = CategoryProcessor::new();
        let aligned = processor.align_series(&[
            ("web".to_string(), points(&[("draft", 1.0), ("published", 4.0)])),
            ("api".to_string(), points(&[("published", 2.0), ("archived", 3.0)])),
        ]);

        assert_eq!(aligned.labels, vec!["draft", "published", "archived"]);
        assert_eq!(aligned.series[0].values, vec![1.0, 4.0, 0.0]);
        assert_eq!(aligned.series[1].values, vec![0.0, 2.0, 3.0]);
    }

    #[test]
    fn test_assign_colors_cycles_palette() {
        let processor = CategoryProcessor::new();
        let data: Vec<CategoryPoint> = (0..12)
            .map(|i| CategoryPoint::new(format!("item{i}"), i as f64))
            .collect();

        let colored = processor.assign_colors(data);
        assert_eq!(colored[0].color.as_deref(), Some("#e74c3c"));
        assert_eq!(colored[9].color.as_deref(), Some("#7f8c8d"));
        assert_eq!(colored[10].color.as_deref(), Some("#e74c3c"));
    }
}
