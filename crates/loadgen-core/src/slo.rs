use serde::{Deserialize, Serialize};

/// Configured service level targets, evaluated once at report time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlaThresholds {
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub success_rate_percent: f64,
}

impl Default for SlaThresholds {
    fn default() -> Self {
        Self {
            p95_latency_ms: 200.0,
            p99_latency_ms: 500.0,
            success_rate_percent: 99.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SloCheck {
    pub target: f64,
    pub measured: f64,
    pub passed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SloResult {
    pub p95_latency: SloCheck,
    pub p99_latency: SloCheck,
    pub success_rate: SloCheck,
    pub passed: bool,
}

impl SloResult {
    pub fn evaluate(
        thresholds: &SlaThresholds,
        p95_ms: f64,
        p99_ms: f64,
        success_rate_percent: f64,
    ) -> Self {
        let p95_latency = SloCheck {
            target: thresholds.p95_latency_ms,
            measured: p95_ms,
            passed: p95_ms <= thresholds.p95_latency_ms,
        };
        let p99_latency = SloCheck {
            target: thresholds.p99_latency_ms,
            measured: p99_ms,
            passed: p99_ms <= thresholds.p99_latency_ms,
        };
        let success_rate = SloCheck {
            target: thresholds.success_rate_percent,
            measured: success_rate_percent,
            passed: success_rate_percent >= thresholds.success_rate_percent,
        };
        let passed = p95_latency.passed && p99_latency.passed && success_rate.passed;

        Self {
            p95_latency,
            p99_latency,
            success_rate,
            passed,
        }
    }
}

pub fn verdict(passed: bool) -> &'static str {
    if passed {
        "PASS"
    } else {
        "FAIL"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_targets_met() {
        let result = SloResult::evaluate(&SlaThresholds::default(), 120.0, 500.0, 99.5);
        assert!(result.p95_latency.passed);
        // Boundary values pass
        assert!(result.p99_latency.passed);
        assert!(result.success_rate.passed);
        assert!(result.passed);
    }

    #[test]
    fn test_any_miss_fails_overall() {
        let thresholds = SlaThresholds::default();

        let result = SloResult::evaluate(&thresholds, 201.0, 300.0, 100.0);
        assert!(!result.p95_latency.passed);
        assert!(!result.passed);

        let result = SloResult::evaluate(&thresholds, 10.0, 20.0, 99.4);
        assert!(!result.success_rate.passed);
        assert!(!result.passed);
        assert_eq!(verdict(result.passed), "FAIL");
    }
}
