//! Capability handles handed to the agent layer
//!
//! The fleet makes no assumption about the transport library behind a
//! server. A [`HandleFactory`] turns a [`ServerConfig`] into a
//! [`ServerHandle`]; the manager caches, probes and tears down handles but
//! never looks inside them.

use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::Arc;

use crate::config::{ServerConfig, ServerKind};
use crate::error::FleetResult;

/// Kind-specific lightweight health probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    /// Ask a subprocess server to list its capabilities
    ListCapabilities,
    /// Minimal request/handshake against a remote endpoint
    Handshake,
}

impl ProbeKind {
    /// Probe used for servers of `kind`
    pub const fn for_kind(kind: ServerKind) -> Self {
        match kind {
            ServerKind::Stdio => Self::ListCapabilities,
            ServerKind::Sse | ServerKind::Http => Self::Handshake,
        }
    }
}

impl std::fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::ListCapabilities => "list_capabilities",
            Self::Handshake => "handshake",
        })
    }
}

/// One usable server connection
///
/// Implementations must be cheap to clone behind an `Arc` and safe to call
/// from several tasks at once.
#[async_trait]
pub trait ServerHandle: Send + Sync + Debug {
    /// Id of the server this handle belongs to
    fn server_id(&self) -> &str;

    /// Transport kind
    fn kind(&self) -> ServerKind;

    /// Run a lightweight probe
    async fn probe(&self, probe: ProbeKind) -> FleetResult<()>;

    /// Release the underlying connection or process
    async fn shutdown(&self) -> FleetResult<()>;
}

/// Builds handles from configuration
#[async_trait]
pub trait HandleFactory: Send + Sync {
    /// Construct a handle for `config`
    async fn connect(&self, config: &ServerConfig) -> FleetResult<Arc<dyn ServerHandle>>;
}

#[async_trait]
impl<F> HandleFactory for Arc<F>
where
    F: HandleFactory + ?Sized,
{
    async fn connect(&self, config: &ServerConfig) -> FleetResult<Arc<dyn ServerHandle>> {
        (**self).connect(config).await
    }
}
