//! Per-endpoint request ceilings over calendar minute/day windows.
//!
//! Counters reset lazily: every read or increment first compares the current
//! UTC minute and day against the counter's markers and zeroes the matching
//! count when a boundary has passed. No timer is needed for correctness;
//! [`RateLimiter::sweep`] only tidies idle counters for status output.

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::config::EndpointConfig;

const SECS_PER_MINUTE: i64 = 60;
const SECS_PER_DAY: i64 = 86_400;

/// Request counts for one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateCounter {
    pub rpm_count: u64,
    pub rpd_count: u64,
    minute_marker: i64,
    day_marker: i64,
}

impl RateCounter {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            rpm_count: 0,
            rpd_count: 0,
            minute_marker: minute_of(now),
            day_marker: day_of(now),
        }
    }

    /// Zero any count whose window has rolled over since the last observation.
    fn roll(&mut self, now: DateTime<Utc>) {
        let minute = minute_of(now);
        if minute != self.minute_marker {
            self.rpm_count = 0;
            self.minute_marker = minute;
        }
        let day = day_of(now);
        if day != self.day_marker {
            self.rpd_count = 0;
            self.day_marker = day;
        }
    }
}

fn minute_of(now: DateTime<Utc>) -> i64 {
    now.timestamp().div_euclid(SECS_PER_MINUTE)
}

fn day_of(now: DateTime<Utc>) -> i64 {
    now.timestamp().div_euclid(SECS_PER_DAY)
}

/// Any negative limit (conventionally [`crate::config::UNLIMITED`]) disables the ceiling.
fn under_ceiling(count: u64, limit: i64) -> bool {
    limit < 0 || count < limit as u64
}

/// Concurrent rate limiter keyed by endpoint id.
///
/// Backed by [`DashMap`]: a counter is mutated under its shard's write lock,
/// so concurrent increments for one endpoint are never lost while distinct
/// endpoints rarely contend.
#[derive(Debug, Default)]
pub struct RateLimiter {
    counters: DashMap<String, RateCounter>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `endpoint` may take another request right now.
    pub fn is_within_limit(&self, endpoint: &EndpointConfig) -> bool {
        self.is_within_limit_at(endpoint, Utc::now())
    }

    pub fn is_within_limit_at(&self, endpoint: &EndpointConfig, now: DateTime<Utc>) -> bool {
        let mut counter = self
            .counters
            .entry(endpoint.id.clone())
            .or_insert_with(|| RateCounter::new(now));
        counter.roll(now);

        if !under_ceiling(counter.rpm_count, endpoint.rpm) {
            tracing::debug!(
                endpoint = %endpoint.name,
                count = counter.rpm_count,
                limit = endpoint.rpm,
                "RPM limit reached"
            );
            return false;
        }
        if !under_ceiling(counter.rpd_count, endpoint.rpd) {
            tracing::debug!(
                endpoint = %endpoint.name,
                count = counter.rpd_count,
                limit = endpoint.rpd,
                "RPD limit reached"
            );
            return false;
        }
        true
    }

    /// Count one request against `endpoint_id` in both windows.
    pub fn record_use(&self, endpoint_id: &str) {
        self.record_use_at(endpoint_id, Utc::now());
    }

    pub fn record_use_at(&self, endpoint_id: &str, now: DateTime<Utc>) {
        let mut counter = self
            .counters
            .entry(endpoint_id.to_string())
            .or_insert_with(|| RateCounter::new(now));
        counter.roll(now);
        counter.rpm_count += 1;
        counter.rpd_count += 1;

        tracing::debug!(
            endpoint_id = %endpoint_id,
            rpm = counter.rpm_count,
            rpd = counter.rpd_count,
            "Recorded endpoint use"
        );
    }

    /// Current (rpm, rpd) usage for `endpoint_id`; zero for unseen ids.
    pub fn usage(&self, endpoint_id: &str) -> (u64, u64) {
        self.usage_at(endpoint_id, Utc::now())
    }

    pub fn usage_at(&self, endpoint_id: &str, now: DateTime<Utc>) -> (u64, u64) {
        match self.counters.get_mut(endpoint_id) {
            Some(mut counter) => {
                counter.roll(now);
                (counter.rpm_count, counter.rpd_count)
            }
            None => (0, 0),
        }
    }

    /// Roll every counter forward so idle endpoints report zero.
    pub fn sweep(&self) {
        let now = Utc::now();
        for mut entry in self.counters.iter_mut() {
            entry.value_mut().roll(now);
        }
    }
}
