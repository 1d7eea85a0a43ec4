//! Error types for turbomcp-fleet
//!
//! Every failure a managed server can produce is folded into [`FleetError`],
//! and every [`FleetError`] maps onto exactly one [`ErrorCategory`]. The
//! category drives the retry decision, the quarantine bookkeeping and what an
//! operator sees in `status`/`test` output.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type for fleet operations
pub type FleetResult<T> = std::result::Result<T, FleetError>;

/// Classified failure category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Connection refused, reset, unreachable, timed out
    Network,
    /// Malformed response or schema mismatch
    Protocol,
    /// Dependency-side failure (5xx-equivalent)
    Server,
    /// Too many requests (429-equivalent)
    RateLimit,
    /// Rejected credentials (401/403-equivalent)
    Auth,
    /// Invalid or missing local configuration
    Configuration,
    /// Could not be classified
    Unknown,
}

impl ErrorCategory {
    /// Whether failures of this category are transient and worth retrying
    pub const fn is_transient(self) -> bool {
        matches!(self, Self::Network | Self::Server | Self::RateLimit)
    }

    /// Short operator-facing hint
    pub const fn hint(self) -> &'static str {
        match self {
            Self::Network => "server unreachable; will recover automatically once reachable",
            Self::Protocol => "server replied with malformed data; check server version",
            Self::Server => "server reported an internal failure; waiting for recovery",
            Self::RateLimit => "server is throttling requests; backing off",
            Self::Auth => "credentials rejected; fix configuration and restart",
            Self::Configuration => "configuration is invalid; fix and reinstall",
            Self::Unknown => "unclassified failure; check logs",
        }
    }

    /// Stable lowercase name
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Protocol => "protocol",
            Self::Server => "server",
            Self::RateLimit => "rate_limit",
            Self::Auth => "auth",
            Self::Configuration => "configuration",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error type for turbomcp-fleet
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum FleetError {
    /// Server configuration failed validation
    #[error("Validation failed: {}", .errors.join("; "))]
    Validation {
        /// Every problem found, in field order
        errors: Vec<String>,
    },

    /// No server registered under this id
    #[error("Server not found: {id}")]
    NotFound {
        /// Requested server id
        id: String,
    },

    /// Server is disabled by the operator
    #[error("Server '{server_id}' is disabled")]
    Disabled {
        /// Disabled server id
        server_id: String,
    },

    /// Circuit breaker is rejecting calls
    #[error("Circuit breaker open for server '{server_id}'")]
    CircuitOpen {
        /// Guarded server id
        server_id: String,
    },

    /// Server is quarantined after repeated failures
    #[error("Server '{server_id}' quarantined for another {remaining:?}")]
    Quarantined {
        /// Quarantined server id
        server_id: String,
        /// Time left until the quarantine window lapses
        remaining: Duration,
    },

    /// Connection-level failure
    #[error("Network error: {message}")]
    Network {
        /// Underlying cause
        message: String,
    },

    /// Operation exceeded its deadline
    #[error("Timeout: {operation} exceeded {timeout_ms}ms")]
    Timeout {
        /// Operation that timed out
        operation: String,
        /// Deadline in milliseconds
        timeout_ms: u64,
    },

    /// Malformed or unexpected response
    #[error("Protocol error: {message}")]
    Protocol {
        /// What was wrong with the response
        message: String,
    },

    /// Server-side failure
    #[error("Server error{}: {message}", status_suffix(.status))]
    Server {
        /// Failure description
        message: String,
        /// HTTP-like status code if known
        status: Option<u16>,
    },

    /// Server is throttling
    #[error("Rate limit exceeded: {message}")]
    RateLimited {
        /// Failure description
        message: String,
        /// Server-provided back-off hint
        retry_after: Option<Duration>,
    },

    /// Authentication or authorization failure
    #[error("Authentication error{}: {message}", status_suffix(.status))]
    Auth {
        /// Failure description
        message: String,
        /// HTTP-like status code if known
        status: Option<u16>,
    },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML configuration error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Unstructured error, classified by message
    #[error("{0}")]
    Other(String),
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" [{s}]")).unwrap_or_default()
}

impl FleetError {
    /// Create a validation error from a list of problems
    pub fn validation(errors: Vec<String>) -> Self {
        Self::Validation { errors }
    }

    /// Create a not-found error
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }

    /// Create a network error
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    /// Create a protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a server error without a status code
    pub fn server(message: impl Into<String>) -> Self {
        Self::Server {
            message: message.into(),
            status: None,
        }
    }

    /// Create a rate limit error
    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self::RateLimited {
            message: message.into(),
            retry_after,
        }
    }

    /// Create an auth error without a status code
    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth {
            message: message.into(),
            status: None,
        }
    }

    /// Map an HTTP-like status code to an error
    ///
    /// 401/403 are auth, 429 is rate limiting, 5xx is server-side, any other
    /// non-success code is treated as a protocol mismatch.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 | 403 => Self::Auth {
                message,
                status: Some(status),
            },
            429 => Self::RateLimited {
                message,
                retry_after: None,
            },
            500..=599 => Self::Server {
                message,
                status: Some(status),
            },
            _ => Self::Protocol {
                message: format!("unexpected status {status}: {message}"),
            },
        }
    }

    /// Classify this error
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Network { .. } | Self::Timeout { .. } | Self::Io(_) => ErrorCategory::Network,
            Self::Protocol { .. } | Self::Serialization(_) => ErrorCategory::Protocol,
            Self::Server { .. } => ErrorCategory::Server,
            Self::RateLimited { .. } => ErrorCategory::RateLimit,
            Self::Auth { .. } => ErrorCategory::Auth,
            Self::Validation { .. }
            | Self::NotFound { .. }
            | Self::Disabled { .. }
            | Self::Yaml(_) => ErrorCategory::Configuration,
            // Fast-fail rejections mirror an already-failing dependency
            Self::CircuitOpen { .. } | Self::Quarantined { .. } => ErrorCategory::Server,
            Self::Other(message) => classify_message(message),
        }
    }

    /// Whether this error is transient
    pub fn is_retryable(&self) -> bool {
        self.category().is_transient()
    }

    /// Server-provided back-off hint, if any
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Whether this is a fast-fail rejection produced by the fleet itself
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::CircuitOpen { .. } | Self::Quarantined { .. } | Self::Disabled { .. }
        )
    }
}

/// Classify an unstructured error message
pub fn classify_message(message: &str) -> ErrorCategory {
    const NETWORK: &[&str] = &[
        "connection refused",
        "connection reset",
        "connection aborted",
        "network unreachable",
        "host unreachable",
        "no route to host",
        "broken pipe",
        "timed out",
        "timeout",
        "deadline exceeded",
    ];
    const RATE_LIMIT: &[&str] = &["rate limit", "too many requests", "429"];
    const AUTH: &[&str] = &["unauthorized", "forbidden", "401", "403", "invalid token"];
    const SERVER: &[&str] = &[
        "internal server error",
        "bad gateway",
        "service unavailable",
        "500",
        "502",
        "503",
        "504",
    ];
    const PROTOCOL: &[&str] = &["invalid json", "malformed", "schema", "unexpected response"];

    let lower = message.to_lowercase();
    let matches = |patterns: &[&str]| patterns.iter().any(|p| lower.contains(p));

    if matches(RATE_LIMIT) {
        ErrorCategory::RateLimit
    } else if matches(AUTH) {
        ErrorCategory::Auth
    } else if matches(NETWORK) {
        ErrorCategory::Network
    } else if matches(SERVER) {
        ErrorCategory::Server
    } else if matches(PROTOCOL) {
        ErrorCategory::Protocol
    } else {
        ErrorCategory::Unknown
    }
}
