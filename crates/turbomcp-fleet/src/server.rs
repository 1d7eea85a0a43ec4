//! Managed server wrapper
//!
//! A [`ManagedServer`] ties one registry entry to its live state: the circuit
//! breaker it owns exclusively, its slots in the shared [`StatusTracker`] and
//! [`ErrorIsolator`], and a lazily constructed [`ServerHandle`].
//!
//! Handle construction happens under a per-server async lock, so concurrent
//! callers never build two handles for the same server, and under a deadline
//! independent of any probe or call timeout. Once [retired](ManagedServer::retire)
//! a server never builds a handle again.

use parking_lot::RwLock;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

use crate::config::{ServerConfig, ServerKind};
use crate::details;
use crate::error::{FleetError, FleetResult};
use crate::handle::{HandleFactory, ServerHandle};
use crate::resilience::{
    CircuitBreaker, CircuitBreakerConfig, ErrorIsolator, ErrorStats, FailureOutcome, RetryPolicy,
};
use crate::status::{EventType, ServerState, StatusTracker};

/// Runtime wrapper around one registered server
pub struct ManagedServer {
    id: String,
    config: RwLock<ServerConfig>,
    breaker: CircuitBreaker,
    tracker: Arc<StatusTracker>,
    isolator: Arc<ErrorIsolator>,
    factory: Arc<dyn HandleFactory>,
    handle: Mutex<Option<Arc<dyn ServerHandle>>>,
    construction_timeout: Duration,
    retired: AtomicBool,
}

impl std::fmt::Debug for ManagedServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedServer")
            .field("id", &self.id)
            .field("name", &self.config.read().name)
            .field("circuit", &self.breaker.state())
            .finish_non_exhaustive()
    }
}

impl ManagedServer {
    /// Wrap `config`; no handle is constructed until first use
    pub fn new(
        config: ServerConfig,
        breaker_config: CircuitBreakerConfig,
        tracker: Arc<StatusTracker>,
        isolator: Arc<ErrorIsolator>,
        factory: Arc<dyn HandleFactory>,
        construction_timeout: Duration,
    ) -> Self {
        let id = config.id.clone();
        Self {
            breaker: CircuitBreaker::new(id.clone(), breaker_config),
            id,
            config: RwLock::new(config),
            tracker,
            isolator,
            factory,
            handle: Mutex::new(None),
            construction_timeout,
            retired: AtomicBool::new(false),
        }
    }

    /// Server id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Server name
    pub fn name(&self) -> String {
        self.config.read().name.clone()
    }

    /// Current configuration
    pub fn config(&self) -> ServerConfig {
        self.config.read().clone()
    }

    /// Transport kind
    pub fn kind(&self) -> ServerKind {
        self.config.read().kind()
    }

    /// Whether the server may be handed to the agent
    pub fn is_enabled(&self) -> bool {
        self.config.read().enabled
    }

    /// Per-call timeout from the configuration
    pub fn timeout(&self) -> Duration {
        self.config.read().timeout
    }

    /// The circuit breaker guarding this server
    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// The shared status tracker
    pub fn tracker(&self) -> &StatusTracker {
        &self.tracker
    }

    /// Current lifecycle state
    pub fn state(&self) -> ServerState {
        self.tracker.get_status(&self.id)
    }

    /// Whether a quarantine window is open
    pub fn is_quarantined(&self) -> bool {
        self.isolator.is_quarantined(&self.id)
    }

    /// Time left in the quarantine window
    pub fn quarantine_remaining(&self) -> Option<Duration> {
        self.isolator.quarantine_remaining(&self.id)
    }

    /// Error statistics for this server
    pub fn error_stats(&self) -> ErrorStats {
        self.isolator.get_error_stats(&self.id)
    }

    /// Whether the server has been removed from the fleet
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    /// Problems with the current configuration, empty when usable
    pub fn config_errors(&self) -> Vec<String> {
        self.config.read().validate()
    }

    /// Whether a handle is currently cached
    pub async fn has_handle(&self) -> bool {
        self.handle.lock().await.is_some()
    }

    /// Replace the configuration, tearing down any cached handle
    pub async fn set_config(&self, config: ServerConfig) {
        *self.config.write() = config;
        self.discard_handle().await;
        self.tracker.set_status(&self.id, ServerState::Stopped);
        self.tracker
            .record_event(&self.id, EventType::ConfigChanged, details!());
    }

    /// Flip the enabled flag
    pub fn set_enabled(&self, enabled: bool) {
        self.config.write().enabled = enabled;
    }

    /// Reject a configuration that cannot be turned into a handle
    ///
    /// # Errors
    ///
    /// Returns `Validation` listing every problem with the configuration.
    pub fn check_config(&self) -> FleetResult<()> {
        let errors = self.config_errors();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(FleetError::validation(errors))
        }
    }

    /// Leave quarantine once its window has ended
    ///
    /// The state moves quarantined → stopped, a `released` event is recorded
    /// and the breaker moves to half-open so the next use is a recovery
    /// trial. Returns `true` if this call performed the release.
    pub fn release_if_lapsed(&self) -> bool {
        if self.isolator.is_quarantined(&self.id)
            || !self
                .tracker
                .transition(&self.id, ServerState::Quarantined, ServerState::Stopped)
        {
            return false;
        }

        self.tracker
            .record_event(&self.id, EventType::Released, details!());
        self.breaker.begin_trial();
        tracing::info!(server_id = %self.id, "Quarantine over, attempting recovery");
        true
    }

    /// Check whether the server may be used right now
    ///
    /// A server whose quarantine window has lapsed is released here.
    ///
    /// # Errors
    ///
    /// Returns `Disabled`, `Validation`, `Quarantined` or `CircuitOpen` when
    /// the server is not usable.
    pub fn check_eligible(&self) -> FleetResult<()> {
        if !self.is_enabled() {
            return Err(FleetError::Disabled {
                server_id: self.id.clone(),
            });
        }
        self.check_config()?;

        if let Some(remaining) = self.isolator.quarantine_remaining(&self.id) {
            return Err(FleetError::Quarantined {
                server_id: self.id.clone(),
                remaining,
            });
        }

        self.release_if_lapsed();
        self.breaker.try_acquire()
    }

    /// Get the cached handle, constructing it if needed
    ///
    /// # Errors
    ///
    /// Returns the construction error (or a timeout) after recording it as a
    /// failure against this server, or `NotFound` once the server is retired.
    pub async fn get_handle(&self) -> FleetResult<Arc<dyn ServerHandle>> {
        let mut slot = self.handle.lock().await;
        if self.is_retired() {
            return Err(FleetError::not_found(&self.id));
        }
        if let Some(handle) = slot.as_ref() {
            return Ok(handle.clone());
        }

        let config = self.config();
        self.tracker.set_status(&self.id, ServerState::Starting);

        let deadline = self.construction_timeout;
        let connect = ErrorIsolator::contain(self.factory.connect(&config));
        let result = match tokio::time::timeout(deadline, connect).await {
            Ok(result) => result,
            Err(_) => Err(FleetError::timeout(
                format!("constructing handle for '{}'", config.name),
                deadline,
            )),
        };

        match result {
            Ok(handle) if self.is_retired() => {
                drop(slot);
                if let Err(e) = handle.shutdown().await {
                    tracing::warn!(server_id = %self.id, error = %e, "Handle shutdown failed");
                }
                Err(FleetError::not_found(&self.id))
            }
            Ok(handle) => {
                *slot = Some(handle.clone());
                self.tracker.record_start_time(&self.id);
                self.tracker.set_status(&self.id, ServerState::Running);
                self.tracker.record_event(
                    &self.id,
                    EventType::Started,
                    details! { "kind" => config.kind().to_string() },
                );
                drop(slot);
                tracing::info!(server_id = %self.id, name = %config.name, "Server handle constructed");
                Ok(handle)
            }
            Err(error) => {
                drop(slot);
                if !self.is_retired() {
                    self.record_failure(&error, "construct").await;
                }
                Err(error)
            }
        }
    }

    /// Record a successful probe or call
    pub fn record_success(&self) {
        self.isolator.record_success(&self.id);
        self.breaker.record_success();
        if self.state() == ServerState::Error {
            self.tracker.set_status(&self.id, ServerState::Running);
        }
    }

    /// Record a failed construction, probe or call
    ///
    /// Feeds the isolator and the breaker; if this failure starts a
    /// quarantine the cached handle is torn down so the server is rebuilt
    /// once the window lapses.
    pub async fn record_failure(&self, error: &FleetError, operation: &str) -> FailureOutcome {
        let outcome = self.isolator.record_failure(&self.id, error);
        self.breaker.record_failure();

        self.tracker.record_event(
            &self.id,
            EventType::Error,
            details! {
                "operation" => operation,
                "error" => error.to_string(),
                "category" => outcome.category.as_str(),
                "consecutive_errors" => outcome.consecutive_errors,
            },
        );

        match outcome.quarantined_for {
            Some(duration) => self.enter_quarantine(duration).await,
            None if self.state() != ServerState::Quarantined => {
                self.tracker.set_status(&self.id, ServerState::Error);
            }
            None => {}
        }
        outcome
    }

    /// Quarantine this server for `duration` right away
    pub async fn quarantine(&self, duration: Duration) {
        let duration = self.isolator.quarantine_server(&self.id, duration);
        self.enter_quarantine(duration).await;
    }

    async fn enter_quarantine(&self, duration: Duration) {
        self.discard_handle().await;
        self.tracker.set_status(&self.id, ServerState::Quarantined);
        self.tracker.record_event(
            &self.id,
            EventType::Quarantined,
            details! { "duration_ms" => duration.as_millis() as u64 },
        );
    }

    /// Run `operation` against this server's handle
    ///
    /// Each attempt checks eligibility, obtains the handle, passes the
    /// circuit breaker and records the outcome; transient failures are
    /// retried by `retry`.
    ///
    /// # Errors
    ///
    /// Returns a fast-fail rejection, or the last error from `operation`.
    pub async fn invoke<F, Fut, T>(&self, retry: &RetryPolicy, operation: F) -> FleetResult<T>
    where
        F: Fn(Arc<dyn ServerHandle>) -> Fut,
        Fut: Future<Output = FleetResult<T>>,
    {
        retry.retry(&self.id, || self.attempt(&operation)).await
    }

    async fn attempt<F, Fut, T>(&self, operation: &F) -> FleetResult<T>
    where
        F: Fn(Arc<dyn ServerHandle>) -> Fut,
        Fut: Future<Output = FleetResult<T>>,
    {
        self.check_eligible()?;
        let handle = self.get_handle().await?;
        self.breaker.try_acquire()?;

        let deadline = self.timeout();
        let result = match tokio::time::timeout(deadline, ErrorIsolator::contain(operation(handle)))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(FleetError::timeout(format!("call to '{}'", self.id), deadline)),
        };

        match &result {
            Ok(_) => self.record_success(),
            Err(e) if e.is_rejection() => {}
            Err(e) => {
                self.record_failure(e, "call").await;
            }
        }
        result
    }

    /// Tear down the cached handle, if any
    pub async fn discard_handle(&self) {
        let Some(handle) = self.handle.lock().await.take() else {
            return;
        };

        self.tracker.set_status(&self.id, ServerState::Stopping);
        if let Err(e) = handle.shutdown().await {
            tracing::warn!(server_id = %self.id, error = %e, "Handle shutdown failed");
        }
        self.tracker.record_stop_time(&self.id);
        self.tracker
            .record_event(&self.id, EventType::Stopped, details!());
        self.tracker.set_status(&self.id, ServerState::Stopped);
    }

    /// Tear down for good; later handle requests fail with `NotFound`
    ///
    /// Waits for any in-flight construction, so no handle outlives this call.
    pub async fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
        self.discard_handle().await;
    }

    /// Drop the handle and forget circuit and error history
    pub async fn reload(&self) {
        self.discard_handle().await;
        self.breaker.reset();
        self.isolator.reset(&self.id);
        self.tracker.set_status(&self.id, ServerState::Stopped);
        self.tracker
            .record_event(&self.id, EventType::ConfigChanged, details! { "reason" => "reload" });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockBehavior, MockFactory};

    fn managed(factory: Arc<MockFactory>) -> ManagedServer {
        ManagedServer::new(
            ServerConfig::http("api", "http://localhost:9000").with_id("s1"),
            CircuitBreakerConfig::default(),
            Arc::new(StatusTracker::default()),
            Arc::new(ErrorIsolator::default()),
            factory,
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_handle_constructed_once() {
        let factory = Arc::new(MockFactory::default());
        let server = Arc::new(managed(factory.clone()));

        let (a, b) = tokio::join!(server.get_handle(), server.get_handle());
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(factory.connects("s1"), 1);
        assert_eq!(server.state(), ServerState::Running);
        assert!(server.tracker().get_uptime("s1").is_some());
    }

    #[tokio::test]
    async fn test_construction_failure_is_recorded() {
        let factory = Arc::new(MockFactory::default());
        factory.set_behavior("s1", MockBehavior::FailConnect);
        let server = managed(factory.clone());

        assert!(server.get_handle().await.is_err());
        assert_eq!(server.state(), ServerState::Error);
        assert!(!server.has_handle().await);
        let events = server.tracker().get_events("s1", None);
        assert_eq!(events.last().unwrap().event_type, EventType::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_construction_timeout() {
        let factory = Arc::new(MockFactory::default());
        factory.set_behavior("s1", MockBehavior::HangConnect);
        let server = managed(factory);

        let result = server.get_handle().await;
        assert!(matches!(result, Err(FleetError::Timeout { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_quarantine_then_recovery_trial() {
        let factory = Arc::new(MockFactory::default());
        let server = managed(factory.clone());
        server.get_handle().await.unwrap();

        for _ in 0..5 {
            server
                .record_failure(&FleetError::network("connection reset"), "probe")
                .await;
        }
        assert_eq!(server.state(), ServerState::Quarantined);
        assert!(!server.has_handle().await);
        assert!(matches!(
            server.check_eligible(),
            Err(FleetError::Quarantined { .. })
        ));

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(server.check_eligible().is_ok());
        assert!(server.circuit_breaker().is_half_open());
        assert_eq!(server.state(), ServerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lapsed_quarantine_released_once() {
        let server = managed(Arc::new(MockFactory::default()));
        for _ in 0..5 {
            server
                .record_failure(&FleetError::network("connection reset"), "probe")
                .await;
        }
        assert!(server.circuit_breaker().is_open());
        assert!(!server.release_if_lapsed());

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(server.release_if_lapsed());
        assert!(!server.release_if_lapsed());
        assert!(server.circuit_breaker().is_half_open());

        let released = server
            .tracker()
            .get_events("s1", None)
            .iter()
            .filter(|e| e.event_type == EventType::Released)
            .count();
        assert_eq!(released, 1);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected_before_construction() {
        let factory = Arc::new(MockFactory::default());
        let server = ManagedServer::new(
            ServerConfig::stdio("fs", "", vec![]).with_id("s1"),
            CircuitBreakerConfig::default(),
            Arc::new(StatusTracker::default()),
            Arc::new(ErrorIsolator::default()),
            factory.clone(),
            Duration::from_secs(5),
        );

        let error = server.check_eligible().unwrap_err();
        assert!(matches!(error, FleetError::Validation { .. }));
        assert_eq!(error.category(), crate::error::ErrorCategory::Configuration);
        assert_eq!(factory.connects("s1"), 0);
        assert_eq!(server.error_stats().total_errors, 0);
    }

    #[tokio::test]
    async fn test_retired_server_builds_no_handle() {
        let factory = Arc::new(MockFactory::default());
        let server = managed(factory.clone());
        server.get_handle().await.unwrap();

        server.retire().await;
        assert!(matches!(
            server.get_handle().await,
            Err(FleetError::NotFound { .. })
        ));
        assert_eq!(factory.connects("s1"), 1);
        assert_eq!(factory.shutdowns("s1"), 1);
        assert_eq!(server.error_stats().total_errors, 0);
    }

    #[tokio::test]
    async fn test_disabled_rejects() {
        let server = managed(Arc::new(MockFactory::default()));
        server.set_enabled(false);
        assert!(matches!(
            server.check_eligible(),
            Err(FleetError::Disabled { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invoke_retries_then_succeeds() {
        let server = managed(Arc::new(MockFactory::default()));
        let retry = RetryPolicy::default();
        let calls = std::sync::atomic::AtomicU32::new(0);

        let value = server
            .invoke(&retry, |_handle| {
                let n = calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(FleetError::from_status(503, "warming up"))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 1);
        assert_eq!(retry.get_retry_stats("s1").total_retries, 1);
        assert_eq!(server.circuit_breaker().statistics().failure_count, 0);
    }

    #[tokio::test]
    async fn test_reload_forgets_state() {
        let factory = Arc::new(MockFactory::default());
        let server = managed(factory.clone());
        server.get_handle().await.unwrap();
        server.circuit_breaker().force_open();

        server.reload().await;
        assert!(server.circuit_breaker().is_closed());
        assert!(!server.has_handle().await);

        server.get_handle().await.unwrap();
        assert_eq!(factory.connects("s1"), 2);
        assert_eq!(factory.shutdowns("s1"), 1);
    }
}
