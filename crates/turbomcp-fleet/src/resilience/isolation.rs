//! Error isolation and quarantine
//!
//! [`ErrorIsolator`] keeps per-server [`ErrorStats`], classifies every failure
//! into an [`ErrorCategory`] and quarantines a server once it fails
//! `quarantine_threshold` times in a row. Quarantine windows grow
//! exponentially per server: 30s, 60s, 120s, ... capped at 30 minutes.
//!
//! Each server's stats sit behind their own mutex; the map only guards entry
//! creation and removal.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_with::{DurationSeconds, serde_as};
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::{ErrorCategory, FleetError, FleetResult};

/// Shortest quarantine window; the window always ends in the future
pub const MIN_QUARANTINE: Duration = Duration::from_millis(1);

/// Quarantine configuration
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IsolationConfig {
    /// Consecutive failures that trigger quarantine
    pub quarantine_threshold: u32,
    /// Length of the first quarantine
    #[serde_as(as = "DurationSeconds<u64>")]
    pub base_quarantine: Duration,
    /// Upper bound for any quarantine
    #[serde_as(as = "DurationSeconds<u64>")]
    pub max_quarantine: Duration,
}

impl Default for IsolationConfig {
    fn default() -> Self {
        Self {
            quarantine_threshold: 5,
            base_quarantine: Duration::from_secs(30),
            max_quarantine: Duration::from_secs(1800),
        }
    }
}

/// Per-server error statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct ErrorStats {
    /// Failures ever recorded
    pub total_errors: u64,
    /// Failures since the last success
    pub consecutive_errors: u32,
    /// Wall-clock time of the last failure
    pub last_error_at: Option<DateTime<Utc>>,
    /// Message of the last failure
    pub last_error: Option<String>,
    /// Category of the last failure
    pub last_error_category: Option<ErrorCategory>,
    /// Failures per category
    pub error_type_counts: HashMap<ErrorCategory, u64>,
    /// Quarantine events so far
    pub quarantine_count: u32,
    /// Length of the most recent quarantine
    pub last_quarantine: Option<Duration>,
    /// End of the current quarantine window
    #[serde(skip)]
    pub quarantined_until: Option<Instant>,
}

impl ErrorStats {
    /// Whether the quarantine window is still open
    pub fn is_quarantined(&self) -> bool {
        self.quarantined_until
            .is_some_and(|until| Instant::now() < until)
    }

    /// Time left in the quarantine window
    pub fn quarantine_remaining(&self) -> Option<Duration> {
        self.quarantined_until
            .map(|until| until.saturating_duration_since(Instant::now()))
            .filter(|remaining| !remaining.is_zero())
    }
}

/// What recording a failure led to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureOutcome {
    /// Category of the recorded failure
    pub category: ErrorCategory,
    /// Failures since the last success, including this one
    pub consecutive_errors: u32,
    /// Set when this failure started a new quarantine
    pub quarantined_for: Option<Duration>,
}

/// Tracks failures per server and decides quarantine
#[derive(Debug, Default)]
pub struct ErrorIsolator {
    config: IsolationConfig,
    entries: DashMap<String, Arc<Mutex<ErrorStats>>>,
}

impl ErrorIsolator {
    /// Create a new isolator
    pub fn new(config: IsolationConfig) -> Self {
        Self {
            config,
            entries: DashMap::new(),
        }
    }

    fn entry(&self, id: &str) -> Arc<Mutex<ErrorStats>> {
        if let Some(entry) = self.entries.get(id) {
            return entry.clone();
        }
        self.entries.entry(id.to_string()).or_default().clone()
    }

    /// Run `operation`, recording its outcome against `id`
    ///
    /// Panics inside `operation` are caught and surfaced as an unclassified
    /// error so one misbehaving server cannot take the caller down. Fast-fail
    /// rejections (circuit open, quarantined) are passed through unrecorded.
    ///
    /// # Errors
    ///
    /// Returns the error produced by `operation`, after recording it.
    pub async fn isolated_call<F, Fut, T>(&self, id: &str, operation: F) -> FleetResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = FleetResult<T>>,
    {
        let result = Self::contain(operation()).await;

        match &result {
            Ok(_) => self.record_success(id),
            Err(e) if e.is_rejection() => {}
            Err(e) => {
                self.record_failure(id, e);
            }
        }
        result
    }

    /// Await `future`, turning a panic into an unclassified error
    ///
    /// # Errors
    ///
    /// Returns the future's own error, or `Other` if it panicked.
    pub async fn contain<Fut, T>(future: Fut) -> FleetResult<T>
    where
        Fut: Future<Output = FleetResult<T>>,
    {
        match AssertUnwindSafe(future).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(FleetError::Other(format!(
                "operation panicked: {}",
                panic_message(panic.as_ref())
            ))),
        }
    }

    /// Record a success, resetting the consecutive failure count
    pub fn record_success(&self, id: &str) {
        self.entry(id).lock().consecutive_errors = 0;
    }

    /// Record a failure and quarantine the server if the threshold is reached
    ///
    /// Quarantine only starts when the server is not already quarantined. The
    /// consecutive count survives quarantine, so a failure right after a
    /// window lapses re-quarantines with a doubled duration.
    pub fn record_failure(&self, id: &str, error: &FleetError) -> FailureOutcome {
        let category = error.category();
        let entry = self.entry(id);
        let mut stats = entry.lock();

        stats.total_errors += 1;
        stats.consecutive_errors += 1;
        stats.last_error_at = Some(Utc::now());
        stats.last_error = Some(error.to_string());
        stats.last_error_category = Some(category);
        *stats.error_type_counts.entry(category).or_insert(0) += 1;

        let quarantined_for = if stats.consecutive_errors >= self.config.quarantine_threshold
            && !stats.is_quarantined()
        {
            let next = self.next_duration(&stats);
            let duration = Self::apply_quarantine(&mut stats, next);
            tracing::warn!(
                server_id = %id,
                consecutive_errors = stats.consecutive_errors,
                quarantine_secs = duration.as_secs(),
                category = %category,
                "Server quarantined after repeated failures"
            );
            Some(duration)
        } else {
            None
        };

        FailureOutcome {
            category,
            consecutive_errors: stats.consecutive_errors,
            quarantined_for,
        }
    }

    /// Whether `id` has failed often enough to be quarantined
    pub fn should_quarantine(&self, id: &str) -> bool {
        self.entries.get(id).is_some_and(|entry| {
            entry.lock().consecutive_errors >= self.config.quarantine_threshold
        })
    }

    /// Quarantine `id` for `duration`, at least [`MIN_QUARANTINE`]
    ///
    /// Returns the window actually applied.
    pub fn quarantine_server(&self, id: &str, duration: Duration) -> Duration {
        let entry = self.entry(id);
        let mut stats = entry.lock();
        let duration = Self::apply_quarantine(&mut stats, duration);
        tracing::warn!(
            server_id = %id,
            quarantine_secs = duration.as_secs(),
            "Server quarantined"
        );
        duration
    }

    /// Duration the next quarantine of `id` would last
    pub fn next_quarantine_duration(&self, id: &str) -> Duration {
        match self.entries.get(id) {
            Some(entry) => self.next_duration(&entry.lock()),
            None => self.config.base_quarantine.min(self.config.max_quarantine),
        }
    }

    /// Whether `id` is inside a quarantine window
    pub fn is_quarantined(&self, id: &str) -> bool {
        self.entries
            .get(id)
            .is_some_and(|entry| entry.lock().is_quarantined())
    }

    /// Time left in the quarantine window of `id`
    pub fn quarantine_remaining(&self, id: &str) -> Option<Duration> {
        self.entries
            .get(id)
            .and_then(|entry| entry.lock().quarantine_remaining())
    }

    /// End the quarantine of `id` early
    pub fn release_quarantine(&self, id: &str) -> bool {
        let Some(entry) = self.entries.get(id).map(|e| e.clone()) else {
            return false;
        };
        let mut stats = entry.lock();
        let was_quarantined = stats.is_quarantined();
        stats.quarantined_until = None;
        if was_quarantined {
            tracing::info!(server_id = %id, "Quarantine released");
        }
        was_quarantined
    }

    /// Snapshot of the stats for `id` (empty stats if never seen)
    pub fn get_error_stats(&self, id: &str) -> ErrorStats {
        self.entries
            .get(id)
            .map(|entry| entry.lock().clone())
            .unwrap_or_default()
    }

    /// Forget all history for `id`, including quarantine backoff
    pub fn reset(&self, id: &str) {
        if let Some(entry) = self.entries.get(id) {
            *entry.lock() = ErrorStats::default();
        }
    }

    /// Drop the entry for `id`
    pub fn remove(&self, id: &str) {
        self.entries.remove(id);
    }

    fn next_duration(&self, stats: &ErrorStats) -> Duration {
        let next = match stats.last_quarantine {
            Some(previous) if stats.quarantine_count > 0 => previous.saturating_mul(2),
            _ => self.config.base_quarantine,
        };
        next.min(self.config.max_quarantine)
    }

    fn apply_quarantine(stats: &mut ErrorStats, duration: Duration) -> Duration {
        let duration = duration.max(MIN_QUARANTINE);
        stats.quarantined_until = Some(Instant::now() + duration);
        stats.quarantine_count += 1;
        stats.last_quarantine = Some(duration);
        duration
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
