use crate::models::AggregatedResult;
use serde::{Deserialize, Serialize};

/// Share of each normalised metric in the composite score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct ScoringWeights {
    pub sharpe: f64,
    pub cagr: f64,
    pub max_drawdown: f64,
    pub win_rate: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            sharpe: 0.5,
            cagr: 0.3,
            max_drawdown: 0.2,
            win_rate: 0.1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricRange {
    pub min: f64,
    pub max: f64,
}

impl MetricRange {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// Position of `value` inside the range; a degenerate range maps to 0.5.
    pub fn normalise(&self, value: f64) -> f64 {
        if self.max == self.min {
            0.5
        } else {
            (value - self.min) / (self.max - self.min)
        }
    }
}

/// Expected spread of each metric, used to put them on a common scale.
/// CAGR, drawdown and win rate are percentages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MetricRanges {
    pub sharpe: MetricRange,
    pub cagr: MetricRange,
    pub max_drawdown: MetricRange,
    pub win_rate: MetricRange,
}

impl Default for MetricRanges {
    fn default() -> Self {
        Self {
            sharpe: MetricRange::new(-1.0, 3.0),
            cagr: MetricRange::new(-50.0, 100.0),
            max_drawdown: MetricRange::new(0.0, 100.0),
            win_rate: MetricRange::new(0.0, 100.0),
        }
    }
}

/// Weighted, normalised score of a set of aggregated results, each weighted
/// equally. Missing averages contribute nothing (the worst case); an empty
/// set scores 0.
pub fn composite_score(
    results: &[AggregatedResult],
    weights: &ScoringWeights,
    ranges: &MetricRanges,
) -> f64 {
    if results.is_empty() {
        return 0.0;
    }
    let share = 1.0 / results.len() as f64;

    results
        .iter()
        .map(|result| {
            let higher_is_better = |value: Option<f64>, range: &MetricRange| {
                value.map_or(0.0, |v| range.normalise(v))
            };
            let sharpe = higher_is_better(result.avg_sharpe, &ranges.sharpe);
            let cagr = higher_is_better(result.avg_cagr, &ranges.cagr);
            let win_rate = higher_is_better(result.avg_win_rate, &ranges.win_rate);
            let drawdown = result
                .avg_max_drawdown
                .map_or(0.0, |v| 1.0 - ranges.max_drawdown.normalise(v));

            let score = weights.sharpe * sharpe
                + weights.cagr * cagr
                + weights.max_drawdown * drawdown
                + weights.win_rate * win_rate;
            score * share
        })
        .sum()
}
