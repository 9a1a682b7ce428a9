use crate::config::BurstConfig;
use std::time::Duration;

/// Deterministic burst planner: `normal` of base load, then `burst` at
/// `multiplier` times the load, repeating for the whole run.
///
/// State is a pure function of elapsed run time, so every worker agrees on
/// whether a burst is active without a scheduler thread.
#[derive(Debug, Clone, PartialEq)]
pub struct BurstSchedule {
    multiplier: f64,
    normal: Duration,
    burst: Duration,
}

impl BurstSchedule {
    pub fn new(multiplier: f64, normal: Duration, burst: Duration) -> Self {
        Self {
            multiplier: multiplier.max(1.0),
            normal,
            burst,
        }
    }

    /// `None` when burst mode is disabled.
    pub fn from_config(config: &BurstConfig) -> Option<Self> {
        if !config.enabled {
            return None;
        }
        Some(Self::new(
            config.multiplier,
            Duration::from_secs(config.frequency_secs),
            Duration::from_secs(config.duration_secs),
        ))
    }

    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    /// Length of one normal + burst cycle.
    pub fn cycle_duration(&self) -> Duration {
        self.normal + self.burst
    }

    pub fn is_active(&self, elapsed: Duration) -> bool {
        let cycle_ms = self.cycle_duration().as_millis();
        if self.burst.is_zero() || cycle_ms == 0 {
            return false;
        }
        let offset_ms = elapsed.as_millis() % cycle_ms;
        offset_ms >= self.normal.as_millis()
    }

    /// Interval to use at `elapsed`: divided by the multiplier during a burst.
    pub fn shape(&self, interval: Duration, elapsed: Duration) -> Duration {
        if self.is_active(elapsed) {
            interval.div_f64(self.multiplier)
        } else {
            interval
        }
    }
}
