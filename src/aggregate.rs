//! Fold the completed result set into report-level summaries.
//!
//! Pure functions over `AnalysisResult` values: no service calls, no cache
//! access, and no dependence on the order results were emitted in. Failed and
//! skipped units are excluded from every average and listed under
//! `not_analyzed` so a partial run is never silently presented as complete.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{AnalysisResult, DimensionScore, UnitOutcome};

/// One location's position in the best/worst ranking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationRank {
    pub location_id: String,
    pub location_name: String,

    /// Mean of this location's scored dimensions
    pub overall_score: f64,

    pub review_count: usize,
}

/// A unit that produced no scores, with the reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotAnalyzed {
    pub location_id: String,
    pub location_name: String,
    pub reason: String,
}

/// Report-level summary statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportSummary {
    /// Mean score per dimension across all analyzed locations
    pub dimension_means: BTreeMap<String, f64>,

    /// Best performers, best first
    pub best: Vec<LocationRank>,

    /// Worst performers, worst first
    pub worst: Vec<LocationRank>,

    /// How often each theme appeared across all analyzed locations
    pub theme_counts: BTreeMap<String, u64>,

    pub locations_analyzed: usize,
}

/// The aggregated report handed to export/rendering collaborators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    /// Per-location dimension scores, keyed by location id
    pub locations: BTreeMap<String, BTreeMap<String, DimensionScore>>,

    pub summary: ReportSummary,

    /// Units that produced no scores (failed or skipped)
    pub not_analyzed: Vec<NotAnalyzed>,
}

/// Aggregate a completed result set. `top_n` bounds the best/worst lists.
pub fn aggregate(results: &[AnalysisResult], top_n: usize) -> Report {
    let mut locations: BTreeMap<String, BTreeMap<String, DimensionScore>> = BTreeMap::new();
    let mut not_analyzed = Vec::new();
    let mut ranked: Vec<LocationRank> = Vec::new();

    let mut dimension_sums: BTreeMap<String, (f64, u64)> = BTreeMap::new();
    let mut theme_counts: BTreeMap<String, u64> = BTreeMap::new();

    for result in results {
        match &result.outcome {
            UnitOutcome::Analyzed { scores, .. } => {
                let mut location_sum = 0.0;
                let mut location_scored = 0u64;

                for (dimension, score) in scores {
                    if let Some(value) = score.score {
                        let (sum, count) = dimension_sums.entry(dimension.clone()).or_default();
                        *sum += value;
                        *count += 1;
                        location_sum += value;
                        location_scored += 1;
                    }
                    for theme in &score.themes {
                        *theme_counts.entry(theme.clone()).or_default() += 1;
                    }
                }

                // A location where every dimension came back not-applicable
                // has nothing to rank on
                if location_scored > 0 {
                    ranked.push(LocationRank {
                        location_id: result.location_id.clone(),
                        location_name: result.location_name.clone(),
                        overall_score: location_sum / location_scored as f64,
                        review_count: result.review_count,
                    });
                }

                locations.insert(result.location_id.clone(), scores.clone());
            }
            UnitOutcome::Failed { error } => {
                not_analyzed.push(NotAnalyzed {
                    location_id: result.location_id.clone(),
                    location_name: result.location_name.clone(),
                    reason: error.clone(),
                });
            }
            UnitOutcome::Skipped { reason } => {
                not_analyzed.push(NotAnalyzed {
                    location_id: result.location_id.clone(),
                    location_name: result.location_name.clone(),
                    reason: reason.clone(),
                });
            }
        }
    }

    // Ties break on review count (more reviews wins), then location name,
    // so the ranking is fully deterministic
    ranked.sort_by(|a, b| {
        b.overall_score
            .partial_cmp(&a.overall_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.review_count.cmp(&a.review_count))
            .then_with(|| a.location_name.cmp(&b.location_name))
    });

    let best: Vec<LocationRank> = ranked.iter().take(top_n).cloned().collect();
    let worst: Vec<LocationRank> = ranked.iter().rev().take(top_n).cloned().collect();

    let dimension_means = dimension_sums
        .into_iter()
        .map(|(dimension, (sum, count))| (dimension, sum / count as f64))
        .collect();

    Report {
        summary: ReportSummary {
            dimension_means,
            best,
            worst,
            theme_counts,
            locations_analyzed: locations.len(),
        },
        locations,
        not_analyzed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ResultSource, Sentiment};

    fn score(value: Option<f64>, themes: &[&str]) -> DimensionScore {
        DimensionScore {
            score: value,
            sentiment: Sentiment::Mixed,
            themes: themes.iter().map(|t| t.to_string()).collect(),
            quotes: vec![],
        }
    }

    fn analyzed(
        id: &str,
        name: &str,
        review_count: usize,
        scores: &[(&str, Option<f64>, &[&str])],
    ) -> AnalysisResult {
        let mut map = BTreeMap::new();
        for (dimension, value, themes) in scores {
            map.insert(dimension.to_string(), score(*value, themes));
        }
        AnalysisResult {
            location_id: id.to_string(),
            location_name: name.to_string(),
            review_count,
            outcome: UnitOutcome::Analyzed {
                scores: map,
                missing_dimensions: vec![],
                source: ResultSource::Fresh,
            },
        }
    }

    fn failed(id: &str, name: &str, error: &str) -> AnalysisResult {
        AnalysisResult {
            location_id: id.to_string(),
            location_name: name.to_string(),
            review_count: 0,
            outcome: UnitOutcome::Failed {
                error: error.to_string(),
            },
        }
    }

    #[test]
    fn dimension_means_exclude_not_applicable() {
        let results = vec![
            analyzed("L1", "Central", 3, &[("food_quality", Some(4.0), &[])]),
            analyzed("L2", "North", 2, &[("food_quality", Some(2.0), &[])]),
            analyzed("L3", "South", 1, &[("food_quality", None, &[])]),
        ];
        let report = aggregate(&results, 10);
        assert_eq!(report.summary.dimension_means["food_quality"], 3.0);
        assert_eq!(report.summary.locations_analyzed, 3);
    }

    #[test]
    fn ranking_ties_break_on_review_count_then_name() {
        let results = vec![
            analyzed("L1", "Beta", 5, &[("service_quality", Some(4.0), &[])]),
            analyzed("L2", "Alpha", 5, &[("service_quality", Some(4.0), &[])]),
            analyzed("L3", "Gamma", 9, &[("service_quality", Some(4.0), &[])]),
        ];
        let report = aggregate(&results, 3);
        let order: Vec<&str> = report
            .summary
            .best
            .iter()
            .map(|r| r.location_name.as_str())
            .collect();
        // Same score everywhere: review count 9 first, then Alpha before Beta
        assert_eq!(order, vec!["Gamma", "Alpha", "Beta"]);
    }

    #[test]
    fn worst_is_worst_first() {
        let results = vec![
            analyzed("L1", "Central", 1, &[("food_quality", Some(4.5), &[])]),
            analyzed("L2", "North", 1, &[("food_quality", Some(1.5), &[])]),
            analyzed("L3", "South", 1, &[("food_quality", Some(3.0), &[])]),
        ];
        let report = aggregate(&results, 2);
        assert_eq!(report.summary.worst[0].location_id, "L2");
        assert_eq!(report.summary.best[0].location_id, "L1");
    }

    #[test]
    fn failed_units_are_listed_not_averaged() {
        let results = vec![
            analyzed("L1", "Central", 2, &[("food_quality", Some(4.0), &[])]),
            failed("L2", "North", "retries exhausted after 3 attempts"),
        ];
        let report = aggregate(&results, 10);
        assert_eq!(report.summary.dimension_means["food_quality"], 4.0);
        assert_eq!(report.not_analyzed.len(), 1);
        assert_eq!(report.not_analyzed[0].location_id, "L2");
        assert!(!report.locations.contains_key("L2"));
    }

    #[test]
    fn theme_frequencies_accumulate_across_locations() {
        let results = vec![
            analyzed(
                "L1",
                "Central",
                2,
                &[("food_quality", Some(4.0), &["pastries", "coffee"])],
            ),
            analyzed("L2", "North", 2, &[("food_quality", Some(3.0), &["coffee"])]),
        ];
        let report = aggregate(&results, 10);
        assert_eq!(report.summary.theme_counts["coffee"], 2);
        assert_eq!(report.summary.theme_counts["pastries"], 1);
    }

    #[test]
    fn order_independence() {
        let a = vec![
            analyzed("L1", "Central", 2, &[("food_quality", Some(4.0), &[])]),
            analyzed("L2", "North", 3, &[("food_quality", Some(2.0), &[])]),
        ];
        let mut b = a.clone();
        b.reverse();
        assert_eq!(aggregate(&a, 10), aggregate(&b, 10));
    }
}
