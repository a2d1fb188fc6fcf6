//! # drover-sched
//!
//! Maps wall-clock time to an activity-intensity tier and derives sleep
//! durations and probability multipliers from it. This is the node's
//! backpressure: fleet-wide load tapers outside peak hours without any
//! external controller.

use chrono::{Local, Timelike};
use rand::RngExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Coarse time-of-day bucket, totally ordered by required
/// responsiveness: `High > Normal > Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityTier {
    Low,
    Normal,
    High,
}

impl std::fmt::Display for ActivityTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ActivityTier::Low => "low",
            ActivityTier::Normal => "normal",
            ActivityTier::High => "high",
        };
        f.write_str(s)
    }
}

/// Sleep range during peak hours.
const HIGH_SLEEP_MS: (u64, u64) = (5_000, 30_000);
/// Sleep range inside the quiet window.
const LOW_SLEEP_MS: (u64, u64) = (30_000, 100_000);

/// Derives activity tiers from configured peak hours and a quiet window.
///
/// The tier is a pure function of the clock — exactly one tier is active
/// at any instant, with peak proximity taking precedence over the quiet
/// window.
#[derive(Debug, Clone)]
pub struct ActivityScheduler {
    peak_hours: Vec<u32>,
    quiet_start: u32,
    quiet_end: u32,
    normal_sleep: (Duration, Duration),
}

impl ActivityScheduler {
    pub fn new(
        peak_hours: Vec<u32>,
        quiet_start: u32,
        quiet_end: u32,
        normal_sleep_min: Duration,
        normal_sleep_max: Duration,
    ) -> Self {
        Self {
            peak_hours,
            quiet_start,
            quiet_end,
            normal_sleep: (normal_sleep_min, normal_sleep_max),
        }
    }

    /// Tier for the local wall clock right now.
    pub fn current_tier(&self) -> ActivityTier {
        self.tier_at(Local::now().hour())
    }

    /// Tier for a given hour of day (0-23).
    ///
    /// High within ±1 hour of any peak — measured circularly, so a peak
    /// at 0 covers 23:00 and 01:00. Low inside the quiet window
    /// (wraparound supported). Normal otherwise.
    pub fn tier_at(&self, hour: u32) -> ActivityTier {
        let near_peak = self.peak_hours.iter().any(|&peak| {
            let diff = (hour as i32 - peak as i32).abs();
            diff.min(24 - diff) <= 1
        });
        if near_peak {
            return ActivityTier::High;
        }

        let quiet = if self.quiet_start <= self.quiet_end {
            hour >= self.quiet_start && hour < self.quiet_end
        } else {
            hour >= self.quiet_start || hour < self.quiet_end
        };
        if quiet {
            ActivityTier::Low
        } else {
            ActivityTier::Normal
        }
    }

    /// Draw a sleep duration from the tier's range.
    pub fn sleep_duration(&self, tier: ActivityTier) -> Duration {
        let (min_ms, max_ms) = match tier {
            ActivityTier::High => HIGH_SLEEP_MS,
            ActivityTier::Low => LOW_SLEEP_MS,
            ActivityTier::Normal => (
                self.normal_sleep.0.as_millis() as u64,
                self.normal_sleep.1.as_millis() as u64,
            ),
        };
        let ms = rand::rng().random_range(min_ms..=max_ms);
        Duration::from_millis(ms)
    }

    /// Scale the probability of an optional action by the current tier:
    /// 20% more aggressive at peak, half as aggressive in the quiet
    /// window.
    pub fn adjust_probability(&self, base: f64, tier: ActivityTier) -> f64 {
        match tier {
            ActivityTier::High => base * 1.2,
            ActivityTier::Low => base * 0.5,
            ActivityTier::Normal => base,
        }
    }
}

impl Default for ActivityScheduler {
    fn default() -> Self {
        Self::new(
            vec![10, 14, 20],
            0,
            6,
            Duration::from_millis(5_000),
            Duration::from_millis(100_000),
        )
    }
}
