//! # Tick Pacing
//!
//! Holds the tick loop at a target rate with a clamped PI controller.
//!
//! ## Design
//!
//! Each iteration measures `actual_dt` since the previous iteration start and
//! computes `error = desired_dt - actual_dt`. The integral term accumulates
//! `integral_gain * error`, clamped to [-1, 1] seconds, and the sleep before
//! the next iteration is `proportional_gain * error + i_term`, clamped to
//! [0, 1] seconds.
//!
//! When work alone exceeds the budget the delay bottoms out at zero, the
//! integral saturates, and the loop runs as fast as it can. That is counted
//! in [`PacingStats`], not reported as an error.

use std::time::{Duration, Instant};

const I_TERM_LIMIT: f64 = 1.0;
/// Upper bound on a single pacing sleep, in seconds.
const MAX_DELAY: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PacerConfig {
    /// Target iterations per second.
    pub target_rate: u32,
    pub proportional_gain: f64,
    pub integral_gain: f64,
}

impl Default for PacerConfig {
    fn default() -> Self {
        Self {
            target_rate: shared::DEFAULT_TICK_RATE,
            proportional_gain: 0.18,
            integral_gain: 0.06,
        }
    }
}

/// Pacing observability counters.
#[derive(Clone, Copy, Debug, Default)]
pub struct PacingStats {
    pub iterations: u64,
    /// Iterations that overran the budget even though the previous delay was zero.
    pub overruns: u64,
    /// Iterations that ended with the integral term pinned at its bound.
    pub saturated: u64,
    /// Rolling average of the measured period.
    pub average_period: Duration,
    pub last_period: Duration,
}

pub struct Pacer {
    desired_dt: f64,
    kp: f64,
    ki: f64,
    i_term: f64,
    last_start: Option<Instant>,
    last_delay: Duration,
    stats: PacingStats,
}

impl Pacer {
    pub fn new(config: PacerConfig) -> Self {
        let desired_dt = 1.0 / f64::from(config.target_rate.max(1));
        Self {
            desired_dt,
            kp: config.proportional_gain,
            ki: config.integral_gain,
            i_term: 0.0,
            last_start: None,
            last_delay: Duration::ZERO,
            stats: PacingStats {
                average_period: Duration::from_secs_f64(desired_dt),
                ..PacingStats::default()
            },
        }
    }

    /// Marks the start of an iteration and returns how long to sleep once
    /// the iteration's work is done.
    pub fn begin_iteration(&mut self, now: Instant) -> Duration {
        let actual_dt = match self.last_start {
            Some(previous) => now.saturating_duration_since(previous).as_secs_f64(),
            None => self.desired_dt,
        };
        self.last_start = Some(now);

        let error = self.desired_dt - actual_dt;
        self.i_term = (self.i_term + self.ki * error).clamp(-I_TERM_LIMIT, I_TERM_LIMIT);
        let delay = (self.kp * error + self.i_term).clamp(0.0, MAX_DELAY);

        self.record(actual_dt);
        // NaN from a non-finite gain lands here as a failed conversion.
        self.last_delay = Duration::try_from_secs_f64(delay).unwrap_or(Duration::ZERO);
        self.last_delay
    }

    fn record(&mut self, actual_dt: f64) {
        let period = Duration::from_secs_f64(actual_dt);
        self.stats.iterations += 1;
        self.stats.last_period = period;
        self.stats.average_period = (self.stats.average_period * 15 + period) / 16;

        if actual_dt > self.desired_dt && self.last_delay.is_zero() && self.stats.iterations > 1 {
            self.stats.overruns += 1;
        }
        if self.i_term.abs() >= I_TERM_LIMIT {
            self.stats.saturated += 1;
        }
    }

    pub fn desired_dt(&self) -> Duration {
        Duration::from_secs_f64(self.desired_dt)
    }

    pub fn i_term(&self) -> f64 {
        self.i_term
    }

    pub fn stats(&self) -> &PacingStats {
        &self.stats
    }
}
