// 📊 Aggregator - per (entity_name, region) statistics over period sums
//
// Two passes so that a quarter reported in many rows weighs the same as a
// quarter reported in one:
//   (a) sum expense_value per (entity_name, region, year, quarter)
//   (b) total / mean / sample std_dev / count over those period sums
//
// Only non-negative values with a complete period reach pass (a).

use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::config::Policy;
use crate::records::{AggregatedGroup, EnrichedRecord, UNSPECIFIED};

const TOP_GROUPS: usize = 10;
const TOP_REGIONS: usize = 5;
const LOW_VARIABILITY_BELOW: f64 = 25.0;
const MEDIUM_VARIABILITY_UP_TO: f64 = 50.0;

// ============================================================================
// SMALL STATISTICS
// ============================================================================

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample standard deviation (n - 1). Zero for fewer than two values.
pub fn sample_std(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let squares: f64 = values.iter().map(|v| (v - m).powi(2)).sum();
    (squares / (values.len() - 1) as f64).sqrt()
}

pub fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

fn or_unspecified(value: &str) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        UNSPECIFIED.to_string()
    } else {
        trimmed.to_string()
    }
}

// ============================================================================
// AGGREGATOR
// ============================================================================

pub struct Aggregator {
    policy: Policy,
}

impl Aggregator {
    pub fn new(policy: Policy) -> Self {
        Aggregator { policy }
    }

    /// Unranked groups in (entity_name, region) order
    pub fn aggregate(&self, records: &[EnrichedRecord]) -> Vec<AggregatedGroup> {
        // pass (a): (name, region) → (year, quarter) → period sum
        let mut buckets: BTreeMap<(String, String), BTreeMap<(i32, i32), f64>> = BTreeMap::new();
        let mut excluded = 0usize;

        for enriched in records {
            let record = &enriched.record;
            let (value, year, quarter) = match (record.expense_value, record.year, record.quarter) {
                (Some(v), Some(y), Some(q)) if v >= 0.0 => (v, y, q),
                _ => {
                    excluded += 1;
                    continue;
                }
            };

            let key = (or_unspecified(&record.entity_name), or_unspecified(&enriched.region));
            *buckets
                .entry(key)
                .or_default()
                .entry((year, quarter))
                .or_insert(0.0) += value;
        }

        if excluded > 0 {
            warn!("{} records excluded from aggregation (absent/negative value or period)", excluded);
        }

        // pass (b)
        let groups: Vec<AggregatedGroup> = buckets
            .into_iter()
            .map(|((entity_name, region), periods)| {
                let sums: Vec<f64> = periods.into_values().collect();
                self.summarize(entity_name, region, &sums)
            })
            .collect();

        info!("aggregated {} records into {} groups", records.len() - excluded, groups.len());
        groups
    }

    fn summarize(&self, entity_name: String, region: String, sums: &[f64]) -> AggregatedGroup {
        let total: f64 = sums.iter().sum();
        let mean = mean(sums);
        let std_dev = sample_std(sums);
        let coefficient_of_variation = if mean == 0.0 { 0.0 } else { std_dev / mean * 100.0 };

        AggregatedGroup {
            rank: 0,
            entity_name,
            region,
            total,
            mean,
            mean_per_period: mean,
            std_dev,
            coefficient_of_variation,
            sample_count: sums.len(),
            high_variability: coefficient_of_variation > self.policy.high_variability_threshold,
        }
    }

    /// Aggregate then rank
    pub fn run(&self, records: &[EnrichedRecord]) -> Vec<AggregatedGroup> {
        rank(self.aggregate(records))
    }
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new(Policy::default())
    }
}

/// Sort by total descending (stable) and number 1..=N
pub fn rank(mut groups: Vec<AggregatedGroup>) -> Vec<AggregatedGroup> {
    groups.sort_by(|a, b| b.total.total_cmp(&a.total));
    for (idx, group) in groups.iter_mut().enumerate() {
        group.rank = idx + 1;
    }
    groups
}

// ============================================================================
// AGGREGATE ANALYSIS
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct VariabilityDistribution {
    pub low: usize,
    pub medium: usize,
    pub high: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedTotal {
    pub rank: usize,
    pub entity_name: String,
    pub region: String,
    pub total: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateAnalysis {
    pub group_count: usize,
    pub distinct_regions: usize,
    pub sum_of_totals: f64,
    pub mean_total: f64,
    pub median_total: f64,
    pub min_total: f64,
    pub max_total: f64,
    pub std_total: f64,
    pub high_variability_groups: usize,
    pub variability: VariabilityDistribution,
    pub top_groups: Vec<RankedTotal>,
    /// (region, summed total), largest first
    pub top_regions: Vec<(String, f64)>,
}

impl AggregateAnalysis {
    /// Expects ranked groups
    pub fn from_groups(groups: &[AggregatedGroup]) -> Self {
        let totals: Vec<f64> = groups.iter().map(|g| g.total).collect();

        let mut by_region: BTreeMap<&str, f64> = BTreeMap::new();
        for g in groups {
            *by_region.entry(g.region.as_str()).or_insert(0.0) += g.total;
        }
        let distinct_regions = by_region.len();
        let mut top_regions: Vec<(String, f64)> = by_region
            .into_iter()
            .map(|(r, t)| (r.to_string(), t))
            .collect();
        top_regions.sort_by(|a, b| b.1.total_cmp(&a.1));
        top_regions.truncate(TOP_REGIONS);

        let mut variability = VariabilityDistribution::default();
        for g in groups {
            let cv = g.coefficient_of_variation;
            if cv < LOW_VARIABILITY_BELOW {
                variability.low += 1;
            } else if cv <= MEDIUM_VARIABILITY_UP_TO {
                variability.medium += 1;
            } else {
                variability.high += 1;
            }
        }

        AggregateAnalysis {
            group_count: groups.len(),
            distinct_regions,
            sum_of_totals: totals.iter().sum(),
            mean_total: mean(&totals),
            median_total: median(&totals),
            min_total: totals.iter().copied().reduce(f64::min).unwrap_or(0.0),
            max_total: totals.iter().copied().reduce(f64::max).unwrap_or(0.0),
            std_total: sample_std(&totals),
            high_variability_groups: groups.iter().filter(|g| g.high_variability).count(),
            variability,
            top_groups: groups
                .iter()
                .take(TOP_GROUPS)
                .map(|g| RankedTotal {
                    rank: g.rank,
                    entity_name: g.entity_name.clone(),
                    region: g.region.clone(),
                    total: g.total,
                })
                .collect(),
            top_regions,
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "{} groups across {} regions: total {:.2}, mean {:.2}, median {:.2} | variability low/medium/high = {}/{}/{}",
            self.group_count,
            self.distinct_regions,
            self.sum_of_totals,
            self.mean_total,
            self.median_total,
            self.variability.low,
            self.variability.medium,
            self.variability.high
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{ExpenseRecord, MatchStatus};

    fn enriched(name: &str, region: &str, year: i32, quarter: i32, value: Option<f64>) -> EnrichedRecord {
        EnrichedRecord {
            record: ExpenseRecord::new("11222333000181", name, year, quarter, value),
            registry_id: "123".into(),
            modality: "".into(),
            region: region.into(),
            match_status: MatchStatus::Match,
        }
    }

    fn group(name: &str, total: f64) -> AggregatedGroup {
        AggregatedGroup {
            rank: 0,
            entity_name: name.into(),
            region: "SP".into(),
            total,
            mean: total,
            mean_per_period: total,
            std_dev: 0.0,
            coefficient_of_variation: 0.0,
            sample_count: 1,
            high_variability: false,
        }
    }

    #[test]
    fn test_small_statistics() {
        assert_eq!(mean(&[]), 0.0);
        assert_eq!(sample_std(&[5.0]), 0.0);
        assert!((sample_std(&[100.0, 200.0, 300.0]) - 100.0).abs() < 1e-9);
        assert_eq!(median(&[3.0, 1.0, 2.0]), 2.0);
        assert_eq!(median(&[4.0, 1.0, 2.0, 3.0]), 2.5);
    }

    #[test]
    fn test_rows_summed_per_period_first() {
        let records = vec![
            enriched("OP A", "SP", 2025, 1, Some(50.0)),
            enriched("OP A", "SP", 2025, 1, Some(50.0)),
            enriched("OP A", "SP", 2025, 2, Some(100.0)),
        ];

        let groups = Aggregator::default().aggregate(&records);

        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].sample_count, 2);
        assert_eq!(groups[0].total, 200.0);
        assert_eq!(groups[0].mean, 100.0);
        assert_eq!(groups[0].mean_per_period, 100.0);
        assert_eq!(groups[0].std_dev, 0.0);
    }

    #[test]
    fn test_single_bucket_std_is_zero() {
        let groups = Aggregator::default().aggregate(&[enriched("OP", "RJ", 2025, 1, Some(42.0))]);

        assert_eq!(groups[0].sample_count, 1);
        assert_eq!(groups[0].std_dev, 0.0);
        assert_eq!(groups[0].coefficient_of_variation, 0.0);
        assert!(!groups[0].high_variability);
    }

    #[test]
    fn test_high_variability_uses_policy() {
        let records = vec![
            enriched("OP", "SP", 2025, 1, Some(10.0)),
            enriched("OP", "SP", 2025, 2, Some(100.0)),
        ];
        let groups = Aggregator::default().aggregate(&records);
        assert!(groups[0].coefficient_of_variation > 50.0);
        assert!(groups[0].high_variability);

        let lenient = Aggregator::new(Policy {
            high_variability_threshold: 500.0,
            ..Policy::default()
        });
        assert!(!lenient.aggregate(&records)[0].high_variability);
    }

    #[test]
    fn test_negative_and_absent_values_excluded_zero_kept() {
        let records = vec![
            enriched("OP", "SP", 2025, 1, Some(-10.0)),
            enriched("OP", "SP", 2025, 2, None),
            enriched("OP", "SP", 2025, 3, Some(0.0)),
            enriched("OP", "SP", 2025, 4, Some(30.0)),
        ];
        let groups = Aggregator::default().aggregate(&records);

        assert_eq!(groups[0].sample_count, 2);
        assert_eq!(groups[0].total, 30.0);
    }

    #[test]
    fn test_zero_mean_keeps_cv_finite() {
        let groups = Aggregator::default().aggregate(&[enriched("OP", "SP", 2025, 1, Some(0.0))]);
        assert!(groups[0].coefficient_of_variation.is_finite());
    }

    #[test]
    fn test_absent_region_and_name_become_unspecified() {
        let groups = Aggregator::default().aggregate(&[enriched("", "", 2025, 1, Some(1.0))]);
        assert_eq!(groups[0].entity_name, UNSPECIFIED);
        assert_eq!(groups[0].region, UNSPECIFIED);
    }

    #[test]
    fn test_rank_is_stable() {
        let ranked = rank(vec![
            group("A", 10.0),
            group("B", 30.0),
            group("C", 10.0),
            group("D", 30.0),
        ]);

        let order: Vec<(&str, usize)> = ranked.iter().map(|g| (g.entity_name.as_str(), g.rank)).collect();
        assert_eq!(order, vec![("B", 1), ("D", 2), ("A", 3), ("C", 4)]);
    }

    #[test]
    fn test_aggregate_analysis() {
        let mut groups = rank(vec![group("A", 100.0), group("B", 300.0), group("C", 200.0)]);
        groups[0].region = "RJ".into();
        groups[0].coefficient_of_variation = 60.0;
        groups[0].high_variability = true;
        groups[1].coefficient_of_variation = 30.0;

        let analysis = AggregateAnalysis::from_groups(&groups);

        println!("Analysis: {}", analysis.summary());

        assert_eq!(analysis.group_count, 3);
        assert_eq!(analysis.distinct_regions, 2);
        assert_eq!(analysis.sum_of_totals, 600.0);
        assert_eq!(analysis.median_total, 200.0);
        assert_eq!(analysis.min_total, 100.0);
        assert_eq!(analysis.max_total, 300.0);
        assert_eq!(analysis.high_variability_groups, 1);
        assert_eq!(analysis.variability, VariabilityDistribution { low: 1, medium: 1, high: 1 });
        assert_eq!(analysis.top_groups[0].entity_name, "B");
        assert_eq!(analysis.top_regions[0], ("RJ".to_string(), 300.0));
    }
}
