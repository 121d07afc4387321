//! Circuit breaker state machine for per-endpoint health tracking.
//!
//! Implements the Closed -> Open -> Closed lifecycle:
//! - **Closed**: requests flow normally, consecutive errors are counted
//! - **Open**: the endpoint is suspended until its deadline passes
//!
//! The Open -> Closed transition happens either on a recorded success or
//! lazily, the first time the endpoint is checked after its deadline. There
//! is no per-endpoint timer to schedule or cancel.

use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Number of consecutive errors required to trip the circuit.
pub const FAILURE_THRESHOLD: u32 = 3;

/// How long a tripped endpoint stays suspended.
pub const OPEN_DURATION: Duration = Duration::from_secs(10 * 60);

/// The two states of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation. Requests flow through, errors are counted.
    Closed,
    /// Circuit tripped. The endpoint is skipped until the deadline.
    Open,
}

impl CircuitState {
    /// Lowercase name used by the status route.
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
        }
    }
}

/// Information about the last error recorded against an endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastError {
    /// Category of the error (e.g., "5xx", "transport", "empty").
    pub error_type: String,
    /// Human-readable error message.
    pub message: String,
}

/// Snapshot of a single endpoint's circuit breaker state.
#[derive(Debug, Clone)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub consecutive_errors: u32,
    /// Time left before a suspended endpoint is re-enabled.
    pub remaining: Option<Duration>,
    pub trip_count: u32,
    pub last_error: Option<LastError>,
}

impl CircuitSnapshot {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_errors: 0,
            remaining: None,
            trip_count: 0,
            last_error: None,
        }
    }
}

/// Core circuit breaker state machine (not thread-safe on its own).
pub(crate) struct CircuitBreakerInner {
    pub(crate) state: CircuitState,
    /// Consecutive error count (resets on success and on re-enable).
    pub(crate) consecutive_errors: u32,
    /// Set exactly while the circuit is Open.
    pub(crate) disabled_until: Option<Instant>,
    pub(crate) last_error: Option<LastError>,
    /// Total number of times this circuit has tripped open.
    pub(crate) trip_count: u32,
}

impl CircuitBreakerInner {
    pub(crate) fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_errors: 0,
            disabled_until: None,
            last_error: None,
            trip_count: 0,
        }
    }

    /// Close the circuit if its suspension deadline has passed.
    fn expire(&mut self, endpoint_id: &str, now: Instant) {
        if let Some(deadline) = self.disabled_until {
            if now >= deadline {
                self.state = CircuitState::Closed;
                self.disabled_until = None;
                self.consecutive_errors = 0;
                tracing::info!(
                    endpoint_id = %endpoint_id,
                    trip_count = self.trip_count,
                    "circuit CLOSED: suspension elapsed, endpoint re-enabled"
                );
            }
        }
    }

    pub(crate) fn is_available(&mut self, endpoint_id: &str) -> bool {
        self.expire(endpoint_id, Instant::now());
        self.state == CircuitState::Closed
    }

    /// Record an error. Trips the circuit when the threshold is reached.
    pub(crate) fn record_error(&mut self, endpoint_id: &str, error_type: &str, message: &str) {
        let now = Instant::now();
        self.expire(endpoint_id, now);

        self.consecutive_errors += 1;
        self.last_error = Some(LastError {
            error_type: error_type.to_string(),
            message: message.to_string(),
        });

        tracing::warn!(
            endpoint_id = %endpoint_id,
            consecutive_errors = self.consecutive_errors,
            error_type = %error_type,
            "endpoint error recorded"
        );

        if self.state == CircuitState::Closed && self.consecutive_errors >= FAILURE_THRESHOLD {
            self.state = CircuitState::Open;
            self.disabled_until = Some(now + OPEN_DURATION);
            self.trip_count += 1;

            tracing::warn!(
                endpoint_id = %endpoint_id,
                consecutive_errors = self.consecutive_errors,
                last_error = ?self.last_error,
                trip_count = self.trip_count,
                "circuit OPENED: endpoint suspended for {}s",
                OPEN_DURATION.as_secs(),
            );
        }
    }

    /// Record a success. Resets the counter and closes an open circuit.
    pub(crate) fn record_success(&mut self, endpoint_id: &str) {
        self.consecutive_errors = 0;
        if self.state == CircuitState::Open {
            self.state = CircuitState::Closed;
            self.disabled_until = None;
            tracing::info!(
                endpoint_id = %endpoint_id,
                trip_count = self.trip_count,
                "circuit CLOSED: success recorded"
            );
        }
    }

    fn snapshot(&mut self, endpoint_id: &str) -> CircuitSnapshot {
        let now = Instant::now();
        self.expire(endpoint_id, now);
        CircuitSnapshot {
            state: self.state,
            consecutive_errors: self.consecutive_errors,
            remaining: self.disabled_until.map(|deadline| deadline - now),
            trip_count: self.trip_count,
            last_error: self.last_error.clone(),
        }
    }
}

// ── Registry ─────────────────────────────────────────────────────────

/// Concurrent circuit breaker registry with one breaker per endpoint id.
///
/// Backed by [`DashMap`] for per-shard locking (no global lock). Entries are
/// created lazily on the first recorded outcome and outlive config reloads.
#[derive(Default)]
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, CircuitBreakerInner>,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `endpoint_id` may receive traffic. Unknown ids are available.
    pub fn is_available(&self, endpoint_id: &str) -> bool {
        match self.breakers.get_mut(endpoint_id) {
            Some(mut entry) => entry.is_available(endpoint_id),
            None => true,
        }
    }

    /// Record a failed attempt for `endpoint_id`.
    pub fn record_error(&self, endpoint_id: &str, error_type: &str, message: &str) {
        self.breakers
            .entry(endpoint_id.to_string())
            .or_insert_with(CircuitBreakerInner::new)
            .record_error(endpoint_id, error_type, message);
    }

    /// Record a successful attempt for `endpoint_id`.
    pub fn record_success(&self, endpoint_id: &str) {
        self.breakers
            .entry(endpoint_id.to_string())
            .or_insert_with(CircuitBreakerInner::new)
            .record_success(endpoint_id);
    }

    /// Read-only accessor for the consecutive error count.
    pub fn consecutive_errors(&self, endpoint_id: &str) -> u32 {
        self.snapshot(endpoint_id).consecutive_errors
    }

    pub fn snapshot(&self, endpoint_id: &str) -> CircuitSnapshot {
        match self.breakers.get_mut(endpoint_id) {
            Some(mut entry) => entry.snapshot(endpoint_id),
            None => CircuitSnapshot::closed(),
        }
    }

    /// Close every circuit whose deadline has passed.
    pub fn sweep(&self) {
        let now = Instant::now();
        for mut entry in self.breakers.iter_mut() {
            let (id, inner) = entry.pair_mut();
            inner.expire(id, now);
        }
    }
}
