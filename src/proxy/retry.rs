//! Failover loop across endpoints.
//!
//! Each attempt asks the caller for a fresh candidate not yet tried for this
//! request, so health and quota changes between attempts are honored. The
//! loop stops on the first success, on a failure that must not be retried,
//! when attempts run out, or when no untried candidate remains.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{DispatchConfig, EndpointConfig};

/// Attempt cap and pause between attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl From<&DispatchConfig> for RetryPolicy {
    fn from(config: &DispatchConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            backoff: config.backoff(),
        }
    }
}

/// Something the loop can try once and then exclude.
pub trait Candidate {
    fn id(&self) -> &str;
    fn name(&self) -> &str;
}

impl Candidate for EndpointConfig {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl<T: Candidate> Candidate for Arc<T> {
    fn id(&self) -> &str {
        (**self).id()
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// How a failed attempt steers the loop.
pub trait AttemptFailure {
    /// Whether another candidate may be tried.
    fn is_retryable(&self) -> bool;
    /// Whether the failure carries an upstream response worth relaying.
    fn has_response(&self) -> bool;
    /// Short reason for logs and the attempt summary.
    fn reason(&self) -> String;
}

/// Record of a single failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptRecord {
    pub endpoint_name: String,
    pub reason: String,
}

/// Why the loop ended without a success.
#[derive(Debug)]
pub enum RetryError<E> {
    /// No candidate was available for even one attempt.
    NoCandidates,
    /// A non-retryable failure, returned as soon as it was seen.
    Rejected(E),
    /// Every attempt failed. Holds the most recent failure that carried an
    /// upstream response, else the most recent failure.
    Exhausted(E),
}

/// Result of the whole loop plus the failures seen along the way.
pub struct RetryOutcome<T, E> {
    pub result: std::result::Result<T, RetryError<E>>,
    pub attempts: Vec<AttemptRecord>,
}

/// Format attempt records as `"1/alpha, 2/beta"`: failures per endpoint in
/// order of first appearance. `None` when nothing failed.
pub fn format_attempts(attempts: &[AttemptRecord]) -> Option<String> {
    if attempts.is_empty() {
        return None;
    }
    let mut counts: Vec<(&str, u32)> = Vec::new();
    for attempt in attempts {
        if let Some(entry) = counts
            .iter_mut()
            .find(|(name, _)| *name == attempt.endpoint_name)
        {
            entry.1 += 1;
        } else {
            counts.push((&attempt.endpoint_name, 1));
        }
    }
    Some(
        counts
            .iter()
            .map(|(name, count)| format!("{}/{}", count, name))
            .collect::<Vec<_>>()
            .join(", "),
    )
}

/// Run `send` against successive candidates from `pick` until one succeeds.
///
/// `pick` receives the ids already tried and is called after the backoff,
/// so it sees current state. `send` receives the candidate and the 1-based
/// attempt number. The backoff is slept before every attempt except the
/// first.
pub async fn retry_with_failover<C, T, E, P, F, Fut>(
    policy: RetryPolicy,
    mut pick: P,
    send: F,
) -> RetryOutcome<T, E>
where
    C: Candidate,
    E: AttemptFailure,
    P: FnMut(&HashSet<String>) -> Option<C>,
    F: Fn(C, u32) -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, E>>,
{
    let mut tried: HashSet<String> = HashSet::new();
    let mut attempts = Vec::new();
    let mut last_error: Option<E> = None;
    let mut last_with_response: Option<E> = None;

    for attempt in 1..=policy.max_attempts {
        // Pick after the pause so health and quota changes during it count
        if attempt > 1 {
            tokio::time::sleep(policy.backoff).await;
        }

        let Some(candidate) = pick(&tried) else {
            tracing::debug!(attempt, "No untried endpoint remains");
            break;
        };
        tried.insert(candidate.id().to_string());
        let name = candidate.name().to_string();

        match send(candidate, attempt).await {
            Ok(value) => {
                return RetryOutcome {
                    result: Ok(value),
                    attempts,
                };
            }
            Err(err) => {
                attempts.push(AttemptRecord {
                    endpoint_name: name.clone(),
                    reason: err.reason(),
                });

                if !err.is_retryable() {
                    return RetryOutcome {
                        result: Err(RetryError::Rejected(err)),
                        attempts,
                    };
                }

                tracing::warn!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    endpoint = %name,
                    reason = %err.reason(),
                    "Attempt failed, trying another endpoint"
                );

                if err.has_response() {
                    last_with_response = Some(err);
                } else {
                    last_error = Some(err);
                }
            }
        }
    }

    let result = match last_with_response.or(last_error) {
        Some(err) => Err(RetryError::Exhausted(err)),
        None => Err(RetryError::NoCandidates),
    };
    RetryOutcome { result, attempts }
}
