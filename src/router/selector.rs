//! Endpoint registry and random selection.

use arc_swap::ArcSwap;
use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;

use super::circuit_breaker::{CircuitBreakerRegistry, CircuitState};
use super::rate_limit::RateLimiter;
use crate::config::EndpointConfig;

/// Health and quota view of one endpoint, for the status surface.
#[derive(Debug, Clone)]
pub struct EndpointStatus {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub available: bool,
    pub temporarily_disabled: bool,
    pub circuit: CircuitState,
    pub error_count: u32,
    pub trip_count: u32,
    /// `"<type>: <message>"` of the most recent failure, if any.
    pub last_error: Option<String>,
    pub disabled_for_secs: Option<u64>,
    pub rpm_limit: i64,
    pub rpd_limit: i64,
    pub rpm_used: u64,
    pub rpd_used: u64,
}

/// Holds the current endpoint snapshot plus the shared per-endpoint health
/// and quota state.
///
/// The snapshot is replaced wholesale by [`EndpointRegistry::reload`];
/// readers see either the old or the new list. Rate and circuit state are
/// keyed by id and survive reloads.
pub struct EndpointRegistry {
    endpoints: ArcSwap<Vec<Arc<EndpointConfig>>>,
    rate_limiter: RateLimiter,
    breakers: CircuitBreakerRegistry,
}

impl EndpointRegistry {
    pub fn new(endpoints: Vec<EndpointConfig>) -> Self {
        Self {
            endpoints: ArcSwap::from_pointee(wrap(endpoints)),
            rate_limiter: RateLimiter::new(),
            breakers: CircuitBreakerRegistry::new(),
        }
    }

    /// Current endpoint snapshot.
    pub fn endpoints(&self) -> Arc<Vec<Arc<EndpointConfig>>> {
        self.endpoints.load_full()
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    /// Swap in a new endpoint list. In-flight requests keep the endpoints
    /// they already hold.
    pub fn reload(&self, endpoints: Vec<EndpointConfig>) {
        let count = endpoints.len();
        self.endpoints.store(Arc::new(wrap(endpoints)));
        tracing::info!(endpoints = count, "Endpoint list reloaded");
    }

    /// Endpoints eligible to take a request for `model` right now.
    ///
    /// Filters, in order: structural validity, enabled flag, rate ceilings,
    /// circuit availability, then model support when a model is given.
    pub fn available_endpoints(&self, model: Option<&str>) -> Vec<Arc<EndpointConfig>> {
        let snapshot = self.endpoints.load();
        snapshot
            .iter()
            .filter(|api| api.is_structurally_valid())
            .filter(|api| api.enabled)
            .filter(|api| self.rate_limiter.is_within_limit(api))
            .filter(|api| self.breakers.is_available(&api.id))
            .filter(|api| model.map_or(true, |m| api.supports_model(m)))
            .cloned()
            .collect()
    }

    /// Pick one eligible endpoint uniformly at random, skipping `tried`.
    pub fn pick(&self, model: Option<&str>, tried: &HashSet<String>) -> Option<Arc<EndpointConfig>> {
        let mut candidates: Vec<_> = self
            .available_endpoints(model)
            .into_iter()
            .filter(|api| !tried.contains(&api.id))
            .collect();

        if candidates.is_empty() {
            return None;
        }
        let index = rand::thread_rng().gen_range(0..candidates.len());
        Some(candidates.swap_remove(index))
    }

    /// Per-endpoint health and quota snapshot, in configuration order.
    pub fn status(&self) -> Vec<EndpointStatus> {
        self.endpoints
            .load()
            .iter()
            .map(|api| {
                let circuit = self.breakers.snapshot(&api.id);
                let (rpm_used, rpd_used) = self.rate_limiter.usage(&api.id);
                let temporarily_disabled = circuit.remaining.is_some();
                let available = api.is_structurally_valid()
                    && api.enabled
                    && !temporarily_disabled
                    && self.rate_limiter.is_within_limit(api);

                EndpointStatus {
                    id: api.id.clone(),
                    name: api.name.clone(),
                    enabled: api.enabled,
                    available,
                    temporarily_disabled,
                    circuit: circuit.state,
                    error_count: circuit.consecutive_errors,
                    trip_count: circuit.trip_count,
                    last_error: circuit
                        .last_error
                        .map(|e| format!("{}: {}", e.error_type, e.message)),
                    disabled_for_secs: circuit.remaining.map(|d| d.as_secs()),
                    rpm_limit: api.rpm,
                    rpd_limit: api.rpd,
                    rpm_used,
                    rpd_used,
                }
            })
            .collect()
    }
}

fn wrap(endpoints: Vec<EndpointConfig>) -> Vec<Arc<EndpointConfig>> {
    endpoints.into_iter().map(Arc::new).collect()
}
