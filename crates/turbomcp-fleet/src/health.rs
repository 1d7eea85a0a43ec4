//! Health checking and monitoring for managed servers
//!
//! This module provides:
//! - One cancellable background probe task per server, each on its own
//!   interval timer, so a hung probe on one server never delays another
//! - Kind-specific probes (capability listing for stdio, handshake for
//!   HTTP/SSE) with a timeout independent of the monitoring interval
//! - Ad-hoc probes for operator `test` commands
//! - Bounded per-server probe history
//!
//! A probe on a server whose quarantine has lapsed releases it first, so
//! recovery through the background loop and through agent access follow the
//! same path.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_with::{DurationSeconds, serde_as};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::details;
use crate::error::{ErrorCategory, FleetError};
use crate::handle::ProbeKind;
use crate::resilience::{CircuitState, ErrorIsolator};
use crate::server::ManagedServer;
use crate::status::{EventType, ServerState};

/// Health check configuration
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Time between background probes
    #[serde_as(as = "DurationSeconds<u64>")]
    pub interval: Duration,
    /// Deadline for a single probe
    #[serde_as(as = "DurationSeconds<u64>")]
    pub probe_timeout: Duration,
    /// Samples kept per server
    pub history_capacity: usize,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(10),
            history_capacity: 100,
        }
    }
}

/// Result of one probe
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSample {
    /// When the probe finished
    pub timestamp: DateTime<Utc>,
    /// Whether the probe passed
    pub healthy: bool,
    /// Probe duration, including handle construction if it was needed
    pub latency: Duration,
    /// Failure message
    pub error: Option<String>,
    /// Failure category
    pub category: Option<ErrorCategory>,
    /// Probe that was run
    pub probe_kind: ProbeKind,
}

/// Outcome of an ad-hoc health check, as shown to an operator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    /// Checked server
    pub server_id: String,
    /// The probe result
    pub sample: HealthSample,
    /// Lifecycle state after the probe
    pub state: ServerState,
    /// Circuit state after the probe
    pub circuit_state: CircuitState,
    /// Time left in quarantine, if quarantined
    pub quarantine_remaining: Option<Duration>,
}

impl HealthStatus {
    /// Whether the probe passed
    pub fn is_healthy(&self) -> bool {
        self.sample.healthy
    }
}

#[derive(Debug)]
struct MonitorTask {
    token: CancellationToken,
    join: JoinHandle<()>,
}

/// Runs health probes and keeps their history
#[derive(Debug, Default)]
pub struct HealthMonitor {
    config: HealthCheckConfig,
    history: DashMap<String, Arc<Mutex<VecDeque<HealthSample>>>>,
    tasks: Mutex<HashMap<String, MonitorTask>>,
}

impl HealthMonitor {
    /// Create a new monitor
    pub fn new(config: HealthCheckConfig) -> Self {
        Self {
            config,
            history: DashMap::new(),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Start the background probe loop for `server`
    ///
    /// Returns `false` if the server is already being monitored. The first
    /// probe runs immediately; servers that are disabled or quarantined are
    /// skipped until they become eligible again.
    pub fn start_monitoring(self: &Arc<Self>, server: Arc<ManagedServer>) -> bool {
        let id = server.id().to_string();
        let mut tasks = self.tasks.lock();
        if tasks.get(&id).is_some_and(|task| !task.join.is_finished()) {
            return false;
        }

        let token = CancellationToken::new();
        let cancelled = token.clone();
        let monitor = Arc::clone(self);
        let interval = self.config.interval;

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    () = cancelled.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                if !server.is_enabled()
                    || server.is_quarantined()
                    || server.check_config().is_err()
                {
                    continue;
                }

                tokio::select! {
                    () = cancelled.cancelled() => break,
                    status = monitor.check_health(&server) => {
                        tracing::debug!(
                            server_id = %status.server_id,
                            healthy = status.sample.healthy,
                            latency_ms = status.sample.latency.as_millis() as u64,
                            "Health probe finished"
                        );
                    }
                }
            }

            tracing::debug!(server_id = %server.id(), "Health monitoring stopped");
        });

        tracing::info!(server_id = %id, interval_secs = interval.as_secs(), "Health monitoring started");
        tasks.insert(id, MonitorTask { token, join });
        true
    }

    /// Cancel the probe loop for `id` and wait for it to exit
    pub async fn stop_monitoring(&self, id: &str) -> bool {
        let Some(task) = self.tasks.lock().remove(id) else {
            return false;
        };

        task.token.cancel();
        if let Err(e) = task.join.await {
            tracing::warn!(server_id = %id, error = %e, "Health monitor task ended abnormally");
        }
        true
    }

    /// Stop every probe loop
    pub async fn stop_all(&self) {
        let tasks: Vec<(String, MonitorTask)> = self.tasks.lock().drain().collect();
        for (_, task) in &tasks {
            task.token.cancel();
        }
        for (id, task) in tasks {
            if let Err(e) = task.join.await {
                tracing::warn!(server_id = %id, error = %e, "Health monitor task ended abnormally");
            }
        }
    }

    /// Whether a probe loop is running for `id`
    pub fn is_monitoring(&self, id: &str) -> bool {
        self.tasks
            .lock()
            .get(id)
            .is_some_and(|task| !task.join.is_finished())
    }

    /// Run one probe against `server` now
    ///
    /// A server whose quarantine has lapsed is released first, so a passing
    /// probe counts as its recovery trial. Constructs the handle if needed.
    /// The outcome is recorded in the history and the status tracker and fed
    /// to the server's isolator and breaker; an unusable configuration is
    /// reported without being counted as a failure.
    pub async fn check_health(&self, server: &ManagedServer) -> HealthStatus {
        let probe_kind = ProbeKind::for_kind(server.kind());
        let started = Instant::now();
        server.release_if_lapsed();

        let handle = match server.check_config() {
            Ok(()) => server.get_handle().await,
            Err(error) => Err(error),
        };
        let outcome = match handle {
            // Construction failures are recorded by the server itself
            Err(error) => Err((error, false)),
            Ok(handle) => {
                let deadline = self.config.probe_timeout;
                let probe = ErrorIsolator::contain(handle.probe(probe_kind));
                match tokio::time::timeout(deadline, probe).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(error)) => Err((error, true)),
                    Err(_) => Err((FleetError::timeout("health probe", deadline), true)),
                }
            }
        };
        let latency = started.elapsed();

        let sample = match outcome {
            Ok(()) => {
                server.record_success();
                HealthSample {
                    timestamp: Utc::now(),
                    healthy: true,
                    latency,
                    error: None,
                    category: None,
                    probe_kind,
                }
            }
            Err((error, needs_recording)) => {
                if needs_recording {
                    server.record_failure(&error, "probe").await;
                }
                HealthSample {
                    timestamp: Utc::now(),
                    healthy: false,
                    latency,
                    error: Some(error.to_string()),
                    category: Some(error.category()),
                    probe_kind,
                }
            }
        };

        if server.is_retired() {
            return self.status_of(server, sample);
        }

        server.tracker().record_event(
            server.id(),
            EventType::HealthCheck,
            details! {
                "healthy" => sample.healthy,
                "latency_ms" => sample.latency.as_millis() as u64,
                "probe" => probe_kind.to_string(),
                "error" => sample.error.clone(),
                "category" => sample.category.map(ErrorCategory::as_str),
            },
        );
        self.push_sample(server.id(), sample.clone());
        self.status_of(server, sample)
    }

    fn status_of(&self, server: &ManagedServer, sample: HealthSample) -> HealthStatus {
        HealthStatus {
            server_id: server.id().to_string(),
            sample,
            state: server.state(),
            circuit_state: server.circuit_breaker().state(),
            quarantine_remaining: server.quarantine_remaining(),
        }
    }

    fn push_sample(&self, id: &str, sample: HealthSample) {
        let entry = self.history.entry(id.to_string()).or_default().clone();
        let mut samples = entry.lock();
        if samples.len() >= self.config.history_capacity.max(1) {
            samples.pop_front();
        }
        samples.push_back(sample);
    }

    /// Most recent samples, oldest first; `limit` of `None` returns all
    pub fn get_health_history(&self, id: &str, limit: Option<usize>) -> Vec<HealthSample> {
        let Some(entry) = self.history.get(id).map(|e| e.clone()) else {
            return Vec::new();
        };
        let samples = entry.lock();
        let skip = limit.map_or(0, |limit| samples.len().saturating_sub(limit));
        samples.iter().skip(skip).cloned().collect()
    }

    /// The latest sample for `id`
    pub fn last_sample(&self, id: &str) -> Option<HealthSample> {
        self.history
            .get(id)
            .and_then(|entry| entry.lock().back().cloned())
    }

    /// Whether the latest probe of `id` passed
    pub fn is_healthy(&self, id: &str) -> bool {
        self.last_sample(id).is_some_and(|sample| sample.healthy)
    }

    /// Drop the history of `id`
    pub fn forget(&self, id: &str) {
        self.history.remove(id);
    }
}
