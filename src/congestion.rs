//! Two-speed, hysteretic congestion controller: flips between a "good" and
//! "bad" send interval based on smoothed latency, with a throttle-time
//! dwell that widens on repeated flapping and halves on sustained good
//! quality.
//!
//! See `spec.md` §4.6.

use std::time::{Duration, Instant};

/// Coarse connection quality, driving the send interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quality {
    /// Latency is under threshold; send at the fast interval.
    Good,
    /// Latency is over threshold; send at the slow interval.
    Bad,
}

/// Send interval while [`Quality::Good`].
pub const GOOD_INTERVAL: Duration = Duration::from_nanos(1_000_000_000 / 40);
/// Send interval while [`Quality::Bad`].
pub const BAD_INTERVAL: Duration = Duration::from_nanos(1_000_000_000 / 20);
/// Latency above which quality flips to [`Quality::Bad`].
pub const LATENCY_THRESHOLD: f64 = 0.25;
/// Floor for `throttle_time`.
pub const MIN_THROTTLE_TIME: Duration = Duration::from_secs(1);
/// Ceiling for `throttle_time`.
pub const MAX_THROTTLE_TIME: Duration = Duration::from_secs(60);

/// Hysteretic congestion controller state, evaluated periodically (every
/// `MIN_THROTTLE_TIME / 2`) against the connection's current smoothed
/// latency.
#[derive(Debug, Clone)]
pub struct Congestion {
    quality: Quality,
    send_interval: Duration,
    throttle_time: Duration,
    last_quality_change: Instant,
    last_good_milestone: Instant,
}

impl Congestion {
    /// Creates a new controller starting in [`Quality::Good`], anchored at
    /// `now`.
    #[must_use]
    pub fn new(now: Instant) -> Self {
        Self {
            quality: Quality::Good,
            send_interval: GOOD_INTERVAL,
            throttle_time: MIN_THROTTLE_TIME,
            last_quality_change: now,
            last_good_milestone: now,
        }
    }

    /// Current coarse quality.
    #[must_use]
    pub fn quality(&self) -> Quality {
        self.quality
    }

    /// Current send interval, dictated by `quality`.
    #[must_use]
    pub fn send_interval(&self) -> Duration {
        self.send_interval
    }

    /// Current throttle-time dwell, exposed for tests/diagnostics.
    #[must_use]
    pub fn throttle_time(&self) -> Duration {
        self.throttle_time
    }

    /// Re-evaluates quality and throttle time given the connection's
    /// current smoothed `latency` (seconds) at time `now`.
    pub fn evaluate(&mut self, latency: f64, now: Instant) {
        match self.quality {
            Quality::Good => {
                if latency > LATENCY_THRESHOLD {
                    self.quality = Quality::Bad;
                    self.send_interval = BAD_INTERVAL;
                    if now.duration_since(self.last_quality_change) < self.throttle_time {
                        self.throttle_time = (self.throttle_time * 2).min(MAX_THROTTLE_TIME);
                    }
                    self.last_quality_change = now;
                } else if now.duration_since(self.last_good_milestone) > self.throttle_time {
                    self.send_interval = GOOD_INTERVAL;
                    self.throttle_time = (self.throttle_time / 2).max(MIN_THROTTLE_TIME);
                    self.last_good_milestone = now;
                }
            }
            Quality::Bad => {
                if latency < LATENCY_THRESHOLD {
                    self.quality = Quality::Good;
                    self.last_quality_change = now;
                    self.last_good_milestone = now;
                }
            }
        }
    }
}
