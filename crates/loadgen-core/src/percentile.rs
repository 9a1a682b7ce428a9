use serde::{Deserialize, Serialize};

/// Percentile over latency samples in milliseconds.
///
/// Samples are sorted ascending and the value at index
/// `floor(p / 100 * (n - 1))` is returned, so the result does not depend on
/// input order. Empty input yields 0.
pub fn percentile(samples: &[f64], p: f64) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(f64::total_cmp);
    percentile_sorted(&sorted, p)
}

/// Same rule as [`percentile`], for input that is already sorted ascending.
pub fn percentile_sorted(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let p = p.clamp(0.0, 100.0);
    let idx = ((p / 100.0) * (sorted.len() - 1) as f64).floor() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

/// Distribution summary of a latency population.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub samples: usize,
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub stddev_ms: f64,
    pub p50_ms: f64,
    pub p90_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub p999_ms: f64,
}

impl LatencySummary {
    pub fn from_samples(samples: &[f64]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }

        let mut sorted = samples.to_vec();
        sorted.sort_by(f64::total_cmp);

        let n = sorted.len() as f64;
        let avg = sorted.iter().sum::<f64>() / n;
        let variance = sorted.iter().map(|v| (v - avg).powi(2)).sum::<f64>() / n;

        Self {
            samples: sorted.len(),
            avg_ms: avg,
            min_ms: sorted[0],
            max_ms: sorted[sorted.len() - 1],
            stddev_ms: variance.sqrt(),
            p50_ms: percentile_sorted(&sorted, 50.0),
            p90_ms: percentile_sorted(&sorted, 90.0),
            p95_ms: percentile_sorted(&sorted, 95.0),
            p99_ms: percentile_sorted(&sorted, 99.0),
            p999_ms: percentile_sorted(&sorted, 99.9),
        }
    }
}
