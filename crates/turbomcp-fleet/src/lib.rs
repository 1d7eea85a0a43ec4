//! turbomcp-fleet: lifecycle and resilience for a fleet of MCP servers
//!
//! An agent that calls into many independently failing tool servers needs
//! to know, on every turn, which of them are safe to use. This crate tracks
//! each server's health, isolates and quarantines misbehaving ones, and hands
//! the caller only the servers that currently work, without ever letting one
//! broken server block or crash the caller.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ Manager                                                  │
//! │ • get_servers_for_agent: cached-state filter, never fails│
//! │ • operator surface: enable/disable/reload/remove/status  │
//! └──────────────────────────────────────────────────────────┘
//!          ↓                     ↓                    ↓
//! ┌────────────────┐  ┌──────────────────────┐  ┌─────────────┐
//! │ Registry       │  │ ManagedServer (each) │  │ HealthMonitor│
//! │ JSON document  │  │ • CircuitBreaker     │  │ one task per │
//! │ atomic writes  │  │ • lazy ServerHandle  │  │ server       │
//! └────────────────┘  └──────────────────────┘  └─────────────┘
//!                              ↓
//!            StatusTracker · ErrorIsolator · RetryPolicy
//! ```
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use turbomcp_fleet::{FleetConfig, Manager, ServerConfig};
//!
//! # async fn example() -> turbomcp_fleet::FleetResult<()> {
//! let manager = Arc::new(Manager::with_default_connector(FleetConfig::default())?);
//! manager.start().await?;
//!
//! manager
//!     .register_server(ServerConfig::stdio("files", "npx", vec!["@mcp/fs".into()]))
//!     .await?;
//!
//! for handle in manager.get_servers_for_agent().await {
//!     println!("usable: {}", handle.server_id());
//! }
//!
//! manager.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod connector;
pub mod error;
pub mod handle;
pub mod health;
pub mod manager;
pub mod registry;
pub mod resilience;
pub mod server;
pub mod status;
pub mod testing;

pub use config::{Connection, FleetConfig, ServerConfig, ServerKind};
pub use connector::DefaultConnector;
pub use error::{ErrorCategory, FleetError, FleetResult};
pub use handle::{HandleFactory, ProbeKind, ServerHandle};
pub use health::{HealthCheckConfig, HealthMonitor, HealthSample, HealthStatus};
pub use manager::{Manager, ServerStatusReport};
pub use registry::Registry;
pub use resilience::{
    BackoffStrategy, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState,
    ErrorIsolator, ErrorStats, IsolationConfig, RetryConfig, RetryPolicy, RetryStats,
};
pub use server::ManagedServer;
pub use status::{Event, EventType, ServerState, StatusTracker};

/// Version of turbomcp-fleet
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
