//! Per-endpoint token accounting with a flat JSON snapshot.
//!
//! Lifetime totals plus hourly and daily buckets keyed by the UTC hour/day
//! start (unix seconds). Mutations only mark the ledger dirty; a background
//! writer coalesces them and writes the whole map to a temp file, then
//! renames it over the previous snapshot.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use crate::error::{Error, Result};

const SECS_PER_HOUR: i64 = 3_600;
const SECS_PER_DAY: i64 = 86_400;

/// Hourly buckets older than this are dropped by [`TokenLedger::prune`].
pub const HOURLY_RETENTION_SECS: i64 = 48 * SECS_PER_HOUR;

/// Daily buckets older than this are dropped by [`TokenLedger::prune`].
pub const DAILY_RETENTION_SECS: i64 = 7 * SECS_PER_DAY;

/// Accumulated usage for one endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenStats {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub request_count: u64,
    pub last_used_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub hourly: BTreeMap<i64, u64>,
    #[serde(default)]
    pub daily: BTreeMap<i64, u64>,
}

impl TokenStats {
    fn has_activity(&self) -> bool {
        self.request_count > 0
    }
}

/// Aggregate view across every endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LedgerSummary {
    pub total_tokens: u64,
    pub total_prompt_tokens: u64,
    pub total_completion_tokens: u64,
    pub total_requests: u64,
    pub current_hour_tokens: u64,
    pub current_day_tokens: u64,
    pub average_tokens_per_request: u64,
    pub active_apis: usize,
}

fn hour_start(now: DateTime<Utc>) -> i64 {
    now.timestamp().div_euclid(SECS_PER_HOUR) * SECS_PER_HOUR
}

fn day_start(now: DateTime<Utc>) -> i64 {
    now.timestamp().div_euclid(SECS_PER_DAY) * SECS_PER_DAY
}

/// Concurrent token ledger keyed by endpoint id.
pub struct TokenLedger {
    stats: DashMap<String, TokenStats>,
    path: Option<PathBuf>,
    /// Pending-write flag for the writer task. Holds at most one wake-up.
    dirty: Notify,
    /// Taken by snapshot writers only, never by `record`.
    write_lock: Mutex<()>,
}

impl TokenLedger {
    /// A ledger that never touches disk.
    pub fn ephemeral() -> Self {
        Self {
            stats: DashMap::new(),
            path: None,
            dirty: Notify::new(),
            write_lock: Mutex::new(()),
        }
    }

    /// Open the ledger backed by `path`, loading any existing snapshot.
    ///
    /// A missing file starts empty. An unreadable or corrupt file is logged
    /// and also starts empty; it is overwritten on the next record.
    pub fn open(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let loaded = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<BTreeMap<String, TokenStats>>(&content) {
                Ok(loaded) => {
                    tracing::info!(
                        path = %path.display(),
                        endpoints = loaded.len(),
                        "Loaded token ledger"
                    );
                    loaded
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Ignoring corrupt token ledger");
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No token ledger yet, starting empty");
                BTreeMap::new()
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to read token ledger");
                BTreeMap::new()
            }
        };

        Self {
            stats: loaded.into_iter().collect(),
            path: Some(path),
            dirty: Notify::new(),
            write_lock: Mutex::new(()),
        }
    }

    /// Record one successful request's usage against `endpoint_id`.
    pub fn record(&self, endpoint_id: &str, prompt: u64, completion: u64, total: u64) {
        self.record_at(endpoint_id, prompt, completion, total, Utc::now());
    }

    pub fn record_at(
        &self,
        endpoint_id: &str,
        prompt: u64,
        completion: u64,
        total: u64,
        now: DateTime<Utc>,
    ) {
        // Counts come from upstream bodies, so saturate instead of overflowing
        let delta = if total > 0 {
            total
        } else {
            prompt.saturating_add(completion)
        };
        {
            let mut stats = self.stats.entry(endpoint_id.to_string()).or_default();
            stats.prompt_tokens = stats.prompt_tokens.saturating_add(prompt);
            stats.completion_tokens = stats.completion_tokens.saturating_add(completion);
            stats.total_tokens = stats.total_tokens.saturating_add(delta);
            stats.request_count = stats.request_count.saturating_add(1);
            stats.last_used_at = Some(now);
            let hourly = stats.hourly.entry(hour_start(now)).or_default();
            *hourly = hourly.saturating_add(delta);
            let daily = stats.daily.entry(day_start(now)).or_default();
            *daily = daily.saturating_add(delta);
        }

        tracing::info!(
            endpoint_id = %endpoint_id,
            prompt_tokens = prompt,
            completion_tokens = completion,
            total_tokens = delta,
            "Recorded token usage"
        );
        self.persist();
    }

    /// Stats for one endpoint.
    pub fn get(&self, endpoint_id: &str) -> Option<TokenStats> {
        self.stats.get(endpoint_id).map(|s| s.clone())
    }

    /// Every endpoint's stats, ordered by id.
    pub fn details(&self) -> BTreeMap<String, TokenStats> {
        self.stats
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn summary(&self) -> LedgerSummary {
        self.summary_at(Utc::now())
    }

    pub fn summary_at(&self, now: DateTime<Utc>) -> LedgerSummary {
        let hour = hour_start(now);
        let day = day_start(now);
        let mut summary = LedgerSummary::default();

        for entry in self.stats.iter() {
            let stats = entry.value();
            summary.total_tokens = summary.total_tokens.saturating_add(stats.total_tokens);
            summary.total_prompt_tokens =
                summary.total_prompt_tokens.saturating_add(stats.prompt_tokens);
            summary.total_completion_tokens = summary
                .total_completion_tokens
                .saturating_add(stats.completion_tokens);
            summary.total_requests = summary.total_requests.saturating_add(stats.request_count);
            summary.current_hour_tokens = summary
                .current_hour_tokens
                .saturating_add(stats.hourly.get(&hour).copied().unwrap_or(0));
            summary.current_day_tokens = summary
                .current_day_tokens
                .saturating_add(stats.daily.get(&day).copied().unwrap_or(0));
            if stats.has_activity() {
                summary.active_apis += 1;
            }
        }

        if summary.total_requests > 0 {
            summary.average_tokens_per_request =
                (summary.total_tokens as f64 / summary.total_requests as f64).round() as u64;
        }
        summary
    }

    /// Zero one endpoint's stats, or clear the whole ledger when `endpoint_id`
    /// is `None`. An unknown id is reported and leaves the ledger untouched.
    pub fn reset(&self, endpoint_id: Option<&str>) -> Result<()> {
        match endpoint_id {
            Some(id) => {
                let mut stats = self
                    .stats
                    .get_mut(id)
                    .ok_or_else(|| Error::NotFound(format!("no token stats for endpoint '{}'", id)))?;
                *stats = TokenStats::default();
                drop(stats);
                tracing::info!(endpoint_id = %id, "Token stats reset");
            }
            None => {
                self.stats.clear();
                tracing::info!("All token stats reset");
            }
        }
        self.persist();
        Ok(())
    }

    pub fn prune(&self) {
        self.prune_at(Utc::now());
    }

    /// Drop hourly buckets older than 48h and daily buckets older than 7 days.
    pub fn prune_at(&self, now: DateTime<Utc>) {
        let hourly_cutoff = hour_start(now) - HOURLY_RETENTION_SECS;
        let daily_cutoff = day_start(now) - DAILY_RETENTION_SECS;
        let mut dropped = 0usize;

        for mut entry in self.stats.iter_mut() {
            let stats = entry.value_mut();
            let before = stats.hourly.len() + stats.daily.len();
            stats.hourly.retain(|&start, _| start >= hourly_cutoff);
            stats.daily.retain(|&start, _| start >= daily_cutoff);
            dropped += before - (stats.hourly.len() + stats.daily.len());
        }

        tracing::debug!(dropped, "Pruned token ledger buckets");
        self.persist();
    }

    /// Mark the ledger as needing a write. Never blocks.
    fn persist(&self) {
        if self.path.is_some() {
            self.dirty.notify_one();
        }
    }

    /// Write the full snapshot now. Failures are logged, never propagated.
    ///
    /// Blocking; call it from a blocking context or at shutdown.
    pub fn flush(&self) {
        let Some(path) = &self.path else {
            return;
        };
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Err(e) = write_snapshot(path, &self.details()) {
            tracing::warn!(path = %path.display(), error = %e, "Failed to persist token ledger");
        }
    }

    /// Write a snapshot each time the ledger changes. Changes arriving while
    /// a write is in progress are folded into the next one.
    pub async fn run_writer(self: Arc<Self>) {
        loop {
            self.dirty.notified().await;
            let ledger = self.clone();
            if let Err(e) = tokio::task::spawn_blocking(move || ledger.flush()).await {
                tracing::error!(error = %e, "Token ledger writer panicked");
            }
        }
    }
}

fn write_snapshot(path: &Path, snapshot: &BTreeMap<String, TokenStats>) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_vec_pretty(snapshot)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 20, h, m, 0).unwrap()
    }

    #[test]
    fn test_record_accumulates_totals_and_buckets() {
        let ledger = TokenLedger::ephemeral();
        ledger.record_at("alpha", 3, 7, 10, at(10, 15));
        ledger.record_at("alpha", 5, 5, 0, at(10, 45));

        let stats = ledger.get("alpha").unwrap();
        assert_eq!(stats.prompt_tokens, 8);
        assert_eq!(stats.completion_tokens, 12);
        assert_eq!(stats.total_tokens, 20, "zero total falls back to prompt + completion");
        assert_eq!(stats.request_count, 2);
        assert_eq!(stats.last_used_at, Some(at(10, 45)));
        assert_eq!(stats.hourly.get(&hour_start(at(10, 0))), Some(&20));
        assert_eq!(stats.daily.get(&day_start(at(0, 0))), Some(&20));
    }

    #[test]
    fn test_summary_current_windows() {
        let ledger = TokenLedger::ephemeral();
        ledger.record_at("alpha", 1, 2, 3, at(9, 30));
        ledger.record_at("beta", 4, 6, 10, at(10, 5));
        ledger.record_at("beta", 0, 0, 4, at(10, 10));

        let summary = ledger.summary_at(at(10, 30));
        assert_eq!(summary.total_tokens, 17);
        assert_eq!(summary.total_prompt_tokens, 5);
        assert_eq!(summary.total_completion_tokens, 8);
        assert_eq!(summary.total_requests, 3);
        assert_eq!(summary.current_hour_tokens, 14);
        assert_eq!(summary.current_day_tokens, 17);
        assert_eq!(summary.average_tokens_per_request, 6);
        assert_eq!(summary.active_apis, 2);
    }

    #[test]
    fn test_empty_summary() {
        let summary = TokenLedger::ephemeral().summary();
        assert_eq!(summary, LedgerSummary::default());
    }

    #[test]
    fn test_reset_one_is_idempotent() {
        let ledger = TokenLedger::ephemeral();
        ledger.record_at("alpha", 3, 7, 10, at(8, 0));
        ledger.record_at("beta", 1, 1, 2, at(8, 0));

        ledger.reset(Some("alpha")).unwrap();
        ledger.reset(Some("alpha")).unwrap();

        assert_eq!(ledger.get("alpha"), Some(TokenStats::default()));
        assert_eq!(ledger.get("beta").unwrap().total_tokens, 2);
        assert_eq!(ledger.summary().active_apis, 1);
    }

    #[test]
    fn test_reset_unknown_is_not_found() {
        let ledger = TokenLedger::ephemeral();
        ledger.record_at("alpha", 3, 7, 10, at(8, 0));
        let before = ledger.details();

        let result = ledger.reset(Some("ghost"));
        assert!(matches!(result, Err(Error::NotFound(_))));
        assert_eq!(ledger.details(), before);
    }

    #[test]
    fn test_reset_all() {
        let ledger = TokenLedger::ephemeral();
        ledger.record_at("alpha", 3, 7, 10, at(8, 0));
        ledger.record_at("beta", 1, 1, 2, at(8, 0));
        ledger.reset(None).unwrap();
        assert!(ledger.details().is_empty());
    }

    #[test]
    fn test_prune_drops_old_buckets() {
        let ledger = TokenLedger::ephemeral();
        let now = at(12, 0);
        ledger.record_at("alpha", 0, 0, 1, now - Duration::days(8));
        ledger.record_at("alpha", 0, 0, 2, now - Duration::hours(49));
        ledger.record_at("alpha", 0, 0, 4, now - Duration::hours(47));

        ledger.prune_at(now);

        let stats = ledger.get("alpha").unwrap();
        assert_eq!(stats.hourly.values().sum::<u64>(), 4);
        assert_eq!(stats.daily.values().sum::<u64>(), 6);
        assert_eq!(stats.total_tokens, 7, "lifetime totals are not pruned");
    }

    #[test]
    fn test_snapshot_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("ledger.json");

        let ledger = TokenLedger::open(&path);
        ledger.record_at("alpha", 3, 7, 10, at(10, 0));
        assert!(!path.exists(), "record leaves the write to the writer");
        ledger.flush();
        assert!(path.exists());

        let reopened = TokenLedger::open(&path);
        assert_eq!(reopened.get("alpha"), ledger.get("alpha"));
    }

    #[test]
    fn test_corrupt_snapshot_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        std::fs::write(&path, "{ not json").unwrap();

        let ledger = TokenLedger::open(&path);
        assert!(ledger.details().is_empty());

        ledger.record("alpha", 1, 1, 2);
        ledger.flush();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("alpha"));
    }

    #[tokio::test]
    async fn test_writer_persists_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        let ledger = Arc::new(TokenLedger::open(&path));
        let writer = tokio::spawn(ledger.clone().run_writer());

        for _ in 0..5 {
            ledger.record("alpha", 1, 2, 3);
        }

        let mut persisted = None;
        for _ in 0..100 {
            persisted = TokenLedger::open(&path).get("alpha");
            if persisted.as_ref().is_some_and(|s| s.request_count == 5) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        writer.abort();

        assert_eq!(persisted.map(|s| s.total_tokens), Some(15));
    }

    #[test]
    fn test_oversized_usage_saturates() {
        let ledger = TokenLedger::ephemeral();
        ledger.record_at("alpha", u64::MAX, 1, 0, at(10, 0));
        ledger.record_at("alpha", 5, 5, u64::MAX, at(10, 5));

        let stats = ledger.get("alpha").unwrap();
        assert_eq!(stats.prompt_tokens, u64::MAX);
        assert_eq!(stats.total_tokens, u64::MAX);
        assert_eq!(stats.hourly.get(&hour_start(at(10, 0))), Some(&u64::MAX));
        assert_eq!(ledger.summary_at(at(10, 30)).total_tokens, u64::MAX);
    }

    #[test]
    fn test_concurrent_records_not_lost() {
        let ledger = Arc::new(TokenLedger::ephemeral());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ledger = ledger.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        ledger.record("alpha", 1, 1, 2);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let stats = ledger.get("alpha").unwrap();
        assert_eq!(stats.request_count, 800);
        assert_eq!(stats.total_tokens, 1_600);
    }
}
