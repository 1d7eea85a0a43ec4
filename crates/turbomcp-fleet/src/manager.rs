//! Fleet manager
//!
//! The [`Manager`] owns every [`ManagedServer`] and is the one entry point
//! for both the agent layer and operator tooling. Build one at start-up,
//! share it behind an `Arc`, and call [`Manager::shutdown`] before exit.
//!
//! # Agent hot path
//!
//! [`Manager::get_servers_for_agent`] only reads cached state: the enabled
//! flag, the quarantine window and the circuit state. The only I/O it may
//! do is lazy handle construction, under each server's own construction
//! lock and deadline. A server that fails to construct is logged and left
//! out; the call itself never fails.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::join_all;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::config::{FleetConfig, ServerConfig, ServerKind};
use crate::connector::DefaultConnector;
use crate::details;
use crate::error::{ErrorCategory, FleetError, FleetResult};
use crate::handle::{HandleFactory, ServerHandle};
use crate::health::{HealthMonitor, HealthSample, HealthStatus};
use crate::registry::Registry;
use crate::resilience::{
    CircuitBreakerStats, ErrorIsolator, ErrorStats, RetryPolicy, RetryStats,
};
use crate::server::ManagedServer;
use crate::status::{Event, EventType, ServerState, StatusTracker};

/// Everything known about one server, for operators
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatusReport {
    /// Server id
    pub id: String,
    /// Server name
    pub name: String,
    /// Transport kind
    pub kind: ServerKind,
    /// Command line or URL
    pub target: String,
    /// Whether the server may be handed to the agent
    pub enabled: bool,
    /// Lifecycle state
    pub state: ServerState,
    /// Time since the handle was constructed
    pub uptime: Option<Duration>,
    /// Circuit breaker snapshot
    pub circuit: CircuitBreakerStats,
    /// Error counters
    pub errors: ErrorStats,
    /// Time left in quarantine
    pub quarantine_remaining: Option<Duration>,
    /// Problems that keep the configuration from being used
    pub config_errors: Vec<String>,
    /// What an operator can do about the last error
    pub hint: Option<&'static str>,
    /// Most recent probe
    pub last_health: Option<HealthSample>,
    /// Whether a background probe loop is running
    pub monitored: bool,
    /// Retry counters for guarded calls
    pub retries: RetryStats,
}

/// Orchestrates the fleet
pub struct Manager {
    config: FleetConfig,
    registry: Registry,
    tracker: Arc<StatusTracker>,
    isolator: Arc<ErrorIsolator>,
    retry: RetryPolicy,
    monitor: Arc<HealthMonitor>,
    factory: Arc<dyn HandleFactory>,
    servers: DashMap<String, Arc<ManagedServer>>,
    started: AtomicBool,
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("registry", &self.registry.path())
            .field("servers", &self.servers.len())
            .field("started", &self.started.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Manager {
    /// Manager whose registry lives at `config.registry_path`
    ///
    /// # Errors
    ///
    /// Returns `Validation` if `config` fails [`FleetConfig::validate`].
    pub fn new(config: FleetConfig, factory: Arc<dyn HandleFactory>) -> FleetResult<Self> {
        let registry = Registry::new(config.registry_path.clone());
        Self::with_registry(config, registry, factory)
    }

    /// Manager with a registry that is never written to disk
    ///
    /// # Errors
    ///
    /// Returns `Validation` if `config` fails [`FleetConfig::validate`].
    pub fn in_memory(config: FleetConfig, factory: Arc<dyn HandleFactory>) -> FleetResult<Self> {
        Self::with_registry(config, Registry::in_memory(), factory)
    }

    /// Manager using the built-in stdio and HTTP/SSE transports
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built or `config` is
    /// invalid.
    pub fn with_default_connector(config: FleetConfig) -> FleetResult<Self> {
        let connector = DefaultConnector::new()?;
        Self::new(config, Arc::new(connector))
    }

    fn with_registry(
        config: FleetConfig,
        registry: Registry,
        factory: Arc<dyn HandleFactory>,
    ) -> FleetResult<Self> {
        let errors = config.validate();
        if !errors.is_empty() {
            return Err(FleetError::validation(errors));
        }

        Ok(Self {
            tracker: Arc::new(StatusTracker::new(config.event_capacity)),
            isolator: Arc::new(ErrorIsolator::new(config.isolation.clone())),
            retry: RetryPolicy::new(config.retry.clone()),
            monitor: Arc::new(HealthMonitor::new(config.health.clone())),
            registry,
            factory,
            servers: DashMap::new(),
            started: AtomicBool::new(false),
            config,
        })
    }

    /// Fleet configuration
    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    /// The server registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// The shared status tracker
    pub fn tracker(&self) -> &StatusTracker {
        &self.tracker
    }

    /// The health monitor
    pub fn monitor(&self) -> &HealthMonitor {
        &self.monitor
    }

    /// The retry policy used by [`Manager::call_server`]
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Load the registry and start monitoring every enabled server
    ///
    /// # Errors
    ///
    /// Returns an error if the registry document cannot be read.
    pub async fn start(&self) -> FleetResult<usize> {
        let count = self.registry.load().await?;
        self.started.store(true, Ordering::SeqCst);

        for config in self.registry.list_all() {
            let enabled = config.enabled;
            if let Some(server) = self.managed_for(config)
                && enabled
            {
                self.monitor.start_monitoring(server);
            }
        }

        tracing::info!(servers = count, "Fleet manager started");
        Ok(count)
    }

    /// Stop every monitor and tear down every handle
    pub async fn shutdown(&self) {
        self.started.store(false, Ordering::SeqCst);
        self.monitor.stop_all().await;

        let servers: Vec<Arc<ManagedServer>> =
            self.servers.iter().map(|entry| entry.value().clone()).collect();
        for server in servers {
            server.discard_handle().await;
        }

        tracing::info!("Fleet manager shut down");
    }

    /// Wrapper for `config`, created if the server is still registered
    ///
    /// The registry check runs under the map's entry lock, so an insert
    /// either precedes the removal in [`Manager::remove_server`] or sees the
    /// server already unregistered.
    fn managed_for(&self, config: ServerConfig) -> Option<Arc<ManagedServer>> {
        match self.servers.entry(config.id.clone()) {
            Entry::Occupied(entry) => Some(entry.get().clone()),
            Entry::Vacant(entry) => {
                self.registry.get(&config.id)?;
                let server = Arc::new(ManagedServer::new(
                    config,
                    self.config.circuit_breaker.clone(),
                    self.tracker.clone(),
                    self.isolator.clone(),
                    self.factory.clone(),
                    self.config.construction_timeout,
                ));
                entry.insert(server.clone());
                Some(server)
            }
        }
    }

    /// Runtime wrapper for `id`, created on first access
    pub fn server(&self, id: &str) -> Option<Arc<ManagedServer>> {
        if let Some(server) = self.servers.get(id) {
            return Some(server.clone());
        }
        self.registry.get(id).and_then(|config| self.managed_for(config))
    }

    fn require(&self, id: &str) -> FleetResult<Arc<ManagedServer>> {
        self.server(id).ok_or_else(|| FleetError::not_found(id))
    }

    /// Register a new server; its handle is built on first use
    ///
    /// # Errors
    ///
    /// Returns `Validation` if the config is malformed or its name is taken.
    pub async fn register_server(&self, config: ServerConfig) -> FleetResult<String> {
        let id = self.registry.register(config).await?;
        if let Some(config) = self.registry.get(&id) {
            let enabled = config.enabled;
            if let Some(server) = self.managed_for(config)
                && enabled
                && self.started.load(Ordering::SeqCst)
            {
                self.monitor.start_monitoring(server);
            }
        }
        Ok(id)
    }

    /// Handles for every server that is currently safe to use
    ///
    /// A server is included when it is enabled, not quarantined, its
    /// circuit is not open, and its handle exists or can be built. Any
    /// other server is skipped; nothing here fails.
    pub async fn get_servers_for_agent(&self) -> Vec<Arc<dyn ServerHandle>> {
        let mut eligible = Vec::new();
        for config in self.registry.list_all() {
            let Some(server) = self.managed_for(config) else {
                continue;
            };
            match server.check_eligible() {
                Ok(()) => eligible.push(server),
                Err(reason) => {
                    tracing::debug!(server_id = %server.id(), reason = %reason, "Server not eligible");
                }
            }
        }

        let handles = join_all(eligible.iter().map(|server| server.get_handle())).await;

        eligible
            .iter()
            .zip(handles)
            .filter_map(|(server, handle)| match handle {
                Ok(handle) => Some(handle),
                Err(e) => {
                    tracing::warn!(
                        server_id = %server.id(),
                        name = %server.name(),
                        category = %e.category(),
                        error = %e,
                        "Excluding server from agent pool"
                    );
                    None
                }
            })
            .collect()
    }

    async fn set_enabled(&self, id: &str, enabled: bool) -> FleetResult<bool> {
        if !self.registry.set_enabled(id, enabled).await? {
            return Ok(false);
        }

        let server = self.require(id)?;
        server.set_enabled(enabled);
        self.tracker.record_event(
            id,
            EventType::ConfigChanged,
            details! { "enabled" => enabled },
        );
        Ok(true)
    }

    /// Enable a server and persist the change
    ///
    /// # Errors
    ///
    /// Returns an error if the registry cannot be written.
    pub async fn enable_server(&self, id: &str) -> FleetResult<bool> {
        if !self.set_enabled(id, true).await? {
            return Ok(false);
        }
        if self.started.load(Ordering::SeqCst)
            && let Some(server) = self.server(id)
        {
            self.monitor.start_monitoring(server);
        }
        tracing::info!(server_id = %id, "Server enabled");
        Ok(true)
    }

    /// Disable a server, stop its monitor and tear down its handle
    ///
    /// # Errors
    ///
    /// Returns an error if the registry cannot be written.
    pub async fn disable_server(&self, id: &str) -> FleetResult<bool> {
        if !self.set_enabled(id, false).await? {
            return Ok(false);
        }
        self.monitor.stop_monitoring(id).await;
        if let Some(server) = self.server(id) {
            server.discard_handle().await;
        }
        tracing::info!(server_id = %id, "Server disabled");
        Ok(true)
    }

    /// Replace a server's config; its handle is rebuilt on next use
    ///
    /// # Errors
    ///
    /// Returns `Validation` if the config is malformed or its name is taken.
    pub async fn update_server(&self, id: &str, config: ServerConfig) -> FleetResult<bool> {
        if !self.registry.update(id, config).await? {
            return Ok(false);
        }
        let (Some(config), Some(server)) = (self.registry.get(id), self.server(id)) else {
            return Ok(false);
        };

        let enabled = config.enabled;
        server.set_config(config).await;
        if !enabled {
            self.monitor.stop_monitoring(id).await;
        } else if self.started.load(Ordering::SeqCst) {
            self.monitor.start_monitoring(server);
        }
        Ok(true)
    }

    /// Drop the cached handle and circuit/error state of a server
    pub async fn reload_server(&self, id: &str) -> bool {
        let Some(server) = self.server(id) else {
            return false;
        };
        server.reload().await;
        tracing::info!(server_id = %id, "Server reloaded");
        true
    }

    /// Stop monitoring, tear down and unregister a server
    ///
    /// # Errors
    ///
    /// Returns an error if the registry cannot be written.
    pub async fn remove_server(&self, id: &str) -> FleetResult<bool> {
        // The probe task must be gone before its state is deleted
        self.monitor.stop_monitoring(id).await;

        let removed = match self.registry.unregister(id).await {
            Ok(removed) => removed,
            Err(e) => {
                self.resume_monitoring(id);
                return Err(e);
            }
        };

        // Unregistered first: no agent turn can re-create the wrapper now
        if let Some((_, server)) = self.servers.remove(id) {
            server.retire().await;
        }
        // An enable racing the first stop may have restarted the loop
        self.monitor.stop_monitoring(id).await;

        self.tracker.clear(id);
        self.isolator.remove(id);
        self.retry.remove(id);
        self.monitor.forget(id);

        if removed {
            tracing::info!(server_id = %id, "Server removed");
        }
        Ok(removed)
    }

    fn resume_monitoring(&self, id: &str) {
        if self.started.load(Ordering::SeqCst)
            && let Some(server) = self.server(id)
            && server.is_enabled()
        {
            self.monitor.start_monitoring(server);
        }
    }

    /// Merged status of one server
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown id.
    pub async fn get_server_status(&self, id: &str) -> FleetResult<ServerStatusReport> {
        let server = self.require(id)?;
        let config = server.config();
        let errors = server.error_stats();
        let config_errors = config.validate();
        let hint = if config_errors.is_empty() {
            errors.last_error_category.map(ErrorCategory::hint)
        } else {
            Some(ErrorCategory::Configuration.hint())
        };

        Ok(ServerStatusReport {
            id: config.id.clone(),
            name: config.name.clone(),
            kind: config.kind(),
            target: config.connection.target(),
            enabled: config.enabled,
            state: server.state(),
            uptime: self.tracker.get_uptime(id),
            circuit: server.circuit_breaker().statistics(),
            quarantine_remaining: server.quarantine_remaining(),
            config_errors,
            hint,
            errors,
            last_health: self.monitor.last_sample(id),
            monitored: self.monitor.is_monitoring(id),
            retries: self.retry.get_retry_stats(id),
        })
    }

    /// Status of every registered server, sorted by name
    pub async fn list_statuses(&self) -> Vec<ServerStatusReport> {
        let mut reports = Vec::new();
        for config in self.registry.list_all() {
            if let Ok(report) = self.get_server_status(&config.id).await {
                reports.push(report);
            }
        }
        reports
    }

    /// Every registered config, sorted by name
    pub fn list_servers(&self) -> Vec<ServerConfig> {
        self.registry.list_all()
    }

    /// Probe a server now, outside the background loop
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown id; probe failures are reported in
    /// the returned status, not as errors.
    pub async fn check_health(&self, id: &str) -> FleetResult<HealthStatus> {
        let server = self.require(id)?;
        Ok(self.monitor.check_health(&server).await)
    }

    /// Recent events of a server, oldest first
    pub fn get_events(&self, id: &str, limit: Option<usize>) -> Vec<Event> {
        self.tracker.get_events(id, limit)
    }

    /// Run `operation` against a server through its breaker, isolator and
    /// retry policy
    ///
    /// # Errors
    ///
    /// Returns `NotFound`, a fast-fail rejection (`Disabled`, `Quarantined`,
    /// `CircuitOpen`) or the last error from `operation`.
    pub async fn call_server<F, Fut, T>(&self, id: &str, operation: F) -> FleetResult<T>
    where
        F: Fn(Arc<dyn ServerHandle>) -> Fut,
        Fut: Future<Output = FleetResult<T>>,
    {
        let server = self.require(id)?;
        server.invoke(&self.retry, operation).await
    }

    /// End a quarantine early; the next use is a recovery trial
    pub fn release_quarantine(&self, id: &str) -> bool {
        let Some(server) = self.server(id) else {
            return false;
        };
        if !self.isolator.release_quarantine(id) {
            return false;
        }
        server.release_if_lapsed();
        true
    }

    /// Close a server's circuit and clear its counters
    pub fn reset_circuit(&self, id: &str) -> bool {
        let Some(server) = self.server(id) else {
            return false;
        };
        server.circuit_breaker().reset();
        tracing::info!(server_id = %id, "Circuit reset by operator");
        true
    }
}
