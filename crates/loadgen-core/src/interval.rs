use crate::config::{IntervalConfig, IntervalMode};
use rand::Rng;
use rand_distr::{Distribution, Exp};
use std::time::Duration;
use tracing::warn;

/// Longest gap a worker will wait between two messages.
pub const MAX_INTERVAL_SECS: f64 = 86_400.0;

/// Seconds to a sleepable duration. NaN and negatives become zero, anything
/// above [`MAX_INTERVAL_SECS`] is capped.
pub(crate) fn secs_to_duration(secs: f64) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(secs.min(MAX_INTERVAL_SECS))
}

/// How long a worker waits between messages.
#[derive(Debug, Clone)]
pub enum IntervalPolicy {
    Fixed {
        base: Duration,
    },
    /// Exponentially distributed gaps, i.e. Poisson arrivals, clamped to
    /// `[min_secs, max_secs]`.
    Poisson {
        mean_secs: f64,
        min_secs: f64,
        max_secs: f64,
        dist: Exp<f64>,
    },
}

impl IntervalPolicy {
    pub fn fixed(base_secs: f64) -> Self {
        IntervalPolicy::Fixed {
            base: secs_to_duration(base_secs),
        }
    }

    /// Poisson arrivals with a mean gap of `mean_secs`. Falls back to a fixed
    /// interval when the mean cannot parameterise the distribution. Inverted
    /// bounds are swapped.
    pub fn poisson(mean_secs: f64, min_secs: f64, max_secs: f64) -> Self {
        let (min_secs, max_secs) = if min_secs > max_secs {
            warn!(min_secs, max_secs, "Inverted interval bounds; swapping");
            (max_secs, min_secs)
        } else {
            (min_secs, max_secs)
        };
        if !(mean_secs > 0.0 && mean_secs.is_finite()) {
            warn!(mean_secs, "Invalid Poisson mean; using fixed interval");
            return Self::fixed(mean_secs);
        }
        match Exp::new(1.0 / mean_secs) {
            Ok(dist) => IntervalPolicy::Poisson {
                mean_secs,
                min_secs,
                max_secs,
                dist,
            },
            Err(e) => {
                warn!(
                    mean_secs,
                    error = %e,
                    "Cannot build exponential distribution; using fixed interval"
                );
                Self::fixed(mean_secs)
            }
        }
    }

    /// Poisson arrivals at `events_per_minute`.
    pub fn poisson_rate(events_per_minute: f64, min_secs: f64, max_secs: f64) -> Self {
        Self::poisson(60.0 / events_per_minute, min_secs, max_secs)
    }

    pub fn from_config(base_secs: f64, config: &IntervalConfig) -> Self {
        match config.mode {
            IntervalMode::Fixed => Self::fixed(base_secs),
            IntervalMode::Poisson => Self::poisson(
                base_secs,
                config.min_interval_secs,
                config.max_interval_secs,
            ),
        }
    }

    pub fn is_random(&self) -> bool {
        matches!(self, IntervalPolicy::Poisson { .. })
    }

    /// Configured mean rate in events per minute.
    pub fn lambda_per_minute(&self) -> f64 {
        let mean = match self {
            IntervalPolicy::Fixed { base } => base.as_secs_f64(),
            IntervalPolicy::Poisson { mean_secs, .. } => *mean_secs,
        };
        if mean > 0.0 {
            60.0 / mean
        } else {
            0.0
        }
    }

    /// Next gap in seconds. Each call is an independent draw for Poisson.
    pub fn next_secs<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        match self {
            IntervalPolicy::Fixed { base } => base.as_secs_f64(),
            IntervalPolicy::Poisson {
                min_secs,
                max_secs,
                dist,
                ..
            } => dist.sample(rng).max(*min_secs).min(*max_secs),
        }
    }

    pub fn next_interval<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        secs_to_duration(self.next_secs(rng))
    }
}
