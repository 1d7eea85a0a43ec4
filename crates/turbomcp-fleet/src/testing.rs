//! In-memory handle factory for tests and dry runs
//!
//! [`MockFactory`] builds [`MockHandle`]s whose behaviour is scripted per
//! server id, and counts connects, probes and shutdowns so tests can assert
//! on what the fleet actually did.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::config::{ServerConfig, ServerKind};
use crate::error::{FleetError, FleetResult};
use crate::handle::{HandleFactory, ProbeKind, ServerHandle};

/// Scripted behaviour for one server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MockBehavior {
    /// Connects and probes succeed
    #[default]
    Healthy,
    /// Connecting fails with a network error
    FailConnect,
    /// Connecting never completes
    HangConnect,
    /// Connecting panics
    PanicConnect,
    /// Connects, but every probe fails with a server error
    FailProbe,
    /// Connects, but every probe is rejected as unauthorized
    RejectAuth,
    /// Connects, but probes never complete
    HangProbe,
}

#[derive(Debug, Default)]
struct Counters {
    connects: AtomicUsize,
    probes: AtomicUsize,
    shutdowns: AtomicUsize,
}

/// Factory producing scripted handles
#[derive(Debug, Default)]
pub struct MockFactory {
    behaviors: Arc<DashMap<String, MockBehavior>>,
    counters: Arc<DashMap<String, Arc<Counters>>>,
}

impl MockFactory {
    /// Script the behaviour of `id`; applies to existing handles too
    pub fn set_behavior(&self, id: &str, behavior: MockBehavior) {
        self.behaviors.insert(id.to_string(), behavior);
    }

    fn behavior(behaviors: &DashMap<String, MockBehavior>, id: &str) -> MockBehavior {
        behaviors.get(id).map(|b| *b).unwrap_or_default()
    }

    fn counters(&self, id: &str) -> Arc<Counters> {
        self.counters.entry(id.to_string()).or_default().clone()
    }

    /// Number of connect attempts for `id`
    pub fn connects(&self, id: &str) -> usize {
        self.counters(id).connects.load(Ordering::SeqCst)
    }

    /// Number of probes run against `id`
    pub fn probes(&self, id: &str) -> usize {
        self.counters(id).probes.load(Ordering::SeqCst)
    }

    /// Number of handle shutdowns for `id`
    pub fn shutdowns(&self, id: &str) -> usize {
        self.counters(id).shutdowns.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HandleFactory for MockFactory {
    async fn connect(&self, config: &ServerConfig) -> FleetResult<Arc<dyn ServerHandle>> {
        let counters = self.counters(&config.id);
        counters.connects.fetch_add(1, Ordering::SeqCst);

        match Self::behavior(&self.behaviors, &config.id) {
            MockBehavior::FailConnect => Err(FleetError::network("connection refused")),
            MockBehavior::HangConnect => std::future::pending().await,
            MockBehavior::PanicConnect => panic!("mock transport blew up"),
            _ => Ok(Arc::new(MockHandle {
                id: config.id.clone(),
                kind: config.kind(),
                behaviors: self.behaviors.clone(),
                counters,
            })),
        }
    }
}

/// Handle produced by [`MockFactory`]
#[derive(Debug)]
pub struct MockHandle {
    id: String,
    kind: ServerKind,
    behaviors: Arc<DashMap<String, MockBehavior>>,
    counters: Arc<Counters>,
}

#[async_trait]
impl ServerHandle for MockHandle {
    fn server_id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ServerKind {
        self.kind
    }

    async fn probe(&self, _probe: ProbeKind) -> FleetResult<()> {
        self.counters.probes.fetch_add(1, Ordering::SeqCst);
        match MockFactory::behavior(&self.behaviors, &self.id) {
            MockBehavior::FailProbe => Err(FleetError::from_status(503, "service unavailable")),
            MockBehavior::RejectAuth => Err(FleetError::from_status(401, "unauthorized")),
            MockBehavior::HangProbe => std::future::pending().await,
            _ => Ok(()),
        }
    }

    async fn shutdown(&self) -> FleetResult<()> {
        self.counters.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
