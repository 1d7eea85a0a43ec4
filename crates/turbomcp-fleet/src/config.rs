//! Configuration types for turbomcp-fleet
//!
//! Two layers live here:
//! - [`ServerConfig`]: one persisted registry entry, with kind-specific
//!   connection parameters expressed as the [`Connection`] tagged union
//! - [`FleetConfig`]: process-wide tuning for health checks, circuit breaking,
//!   quarantine and retry, loadable from YAML or JSON

use serde::{Deserialize, Serialize};
use serde_with::{DurationSeconds, serde_as};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{FleetError, FleetResult};
use crate::health::HealthCheckConfig;
use crate::resilience::{CircuitBreakerConfig, IsolationConfig, RetryConfig};

/// Transport kind of a managed server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerKind {
    /// Local subprocess speaking over stdin/stdout
    Stdio,
    /// Server-Sent Events endpoint
    Sse,
    /// Plain HTTP endpoint
    Http,
}

impl fmt::Display for ServerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Stdio => "stdio",
            Self::Sse => "sse",
            Self::Http => "http",
        })
    }
}

/// Kind-specific connection parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Connection {
    /// Standard I/O backend (subprocess)
    Stdio {
        /// Command to execute (e.g., "npx", "python")
        command: String,
        /// Command arguments
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        args: Vec<String>,
        /// Extra environment variables
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        env: BTreeMap<String, String>,
        /// Optional working directory
        #[serde(default, skip_serializing_if = "Option::is_none")]
        working_dir: Option<PathBuf>,
    },
    /// Server-Sent Events backend
    Sse {
        /// Event stream URL
        url: String,
        /// Extra request headers
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        headers: BTreeMap<String, String>,
    },
    /// HTTP backend
    Http {
        /// Endpoint URL
        url: String,
        /// Extra request headers
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        headers: BTreeMap<String, String>,
    },
}

impl Connection {
    /// Transport kind of these parameters
    pub const fn kind(&self) -> ServerKind {
        match self {
            Self::Stdio { .. } => ServerKind::Stdio,
            Self::Sse { .. } => ServerKind::Sse,
            Self::Http { .. } => ServerKind::Http,
        }
    }

    /// Human-readable target (command line or URL)
    pub fn target(&self) -> String {
        match self {
            Self::Stdio { command, args, .. } if args.is_empty() => command.clone(),
            Self::Stdio { command, args, .. } => format!("{} {}", command, args.join(" ")),
            Self::Sse { url, .. } | Self::Http { url, .. } => url.clone(),
        }
    }
}

const fn default_enabled() -> bool {
    true
}

const fn default_server_timeout() -> Duration {
    Duration::from_secs(30)
}

/// One registered server
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Unique id; generated on registration when empty
    #[serde(default)]
    pub id: String,
    /// Unique human-readable name
    pub name: String,
    /// Whether the server may be handed to the agent
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Kind-specific connection parameters
    pub connection: Connection,
    /// Per-call timeout
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_server_timeout")]
    pub timeout: Duration,
}

impl ServerConfig {
    /// Create a config with the given connection and default settings
    pub fn new(name: impl Into<String>, connection: Connection) -> Self {
        Self {
            id: String::new(),
            name: name.into(),
            enabled: true,
            connection,
            timeout: default_server_timeout(),
        }
    }

    /// Create a stdio server config
    pub fn stdio(name: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self::new(
            name,
            Connection::Stdio {
                command: command.into(),
                args,
                env: BTreeMap::new(),
                working_dir: None,
            },
        )
    }

    /// Create an HTTP server config
    pub fn http(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self::new(
            name,
            Connection::Http {
                url: url.into(),
                headers: BTreeMap::new(),
            },
        )
    }

    /// Create an SSE server config
    pub fn sse(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self::new(
            name,
            Connection::Sse {
                url: url.into(),
                headers: BTreeMap::new(),
            },
        )
    }

    /// Set an explicit id
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Set the enabled flag
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the per-call timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Transport kind
    pub const fn kind(&self) -> ServerKind {
        self.connection.kind()
    }

    /// Check the shape of this config
    ///
    /// Pure: returns every problem found, empty when valid. Uniqueness of
    /// `id`/`name` is a registry concern and is not checked here.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.name.trim().is_empty() {
            errors.push("name must not be empty".to_string());
        } else if self.name.chars().any(char::is_whitespace) {
            errors.push(format!("name '{}' must not contain whitespace", self.name));
        }

        if self.timeout.is_zero() {
            errors.push("timeout must be greater than zero".to_string());
        }

        match &self.connection {
            Connection::Stdio { command, .. } => {
                if command.trim().is_empty() {
                    errors.push("stdio server requires a command".to_string());
                }
            }
            Connection::Sse { url, headers } | Connection::Http { url, headers } => {
                let kind = self.kind();
                if url.trim().is_empty() {
                    errors.push(format!("{kind} server requires a url"));
                } else {
                    match url::Url::parse(url) {
                        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {}
                        Ok(parsed) => errors.push(format!(
                            "{kind} url must use http or https, got '{}'",
                            parsed.scheme()
                        )),
                        Err(e) => errors.push(format!("{kind} url '{url}' is invalid: {e}")),
                    }
                }
                for name in headers.keys() {
                    if name.trim().is_empty() {
                        errors.push("header names must not be empty".to_string());
                    }
                }
            }
        }

        errors
    }
}

/// Process-wide fleet configuration
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    /// Where the registry document lives
    pub registry_path: PathBuf,
    /// Health monitoring settings
    pub health: HealthCheckConfig,
    /// Circuit breaker settings applied to every server
    pub circuit_breaker: CircuitBreakerConfig,
    /// Quarantine settings
    pub isolation: IsolationConfig,
    /// Retry settings for guarded invocations
    pub retry: RetryConfig,
    /// Deadline for constructing a transport handle
    #[serde_as(as = "DurationSeconds<u64>")]
    pub construction_timeout: Duration,
    /// Per-server event history capacity
    pub event_capacity: usize,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            registry_path: Self::default_registry_path(),
            health: HealthCheckConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            isolation: IsolationConfig::default(),
            retry: RetryConfig::default(),
            construction_timeout: Duration::from_secs(30),
            event_capacity: 100,
        }
    }
}

impl FleetConfig {
    /// Default registry location: `~/.turbomcp/fleet.json`
    pub fn default_registry_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".turbomcp")
            .join("fleet.json")
    }

    /// Load configuration from a YAML or JSON file
    ///
    /// The format is picked by extension; anything other than `.json` is
    /// parsed as YAML. Missing sections fall back to defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or `Validation`
    /// if the settings are unusable.
    pub fn from_file(path: impl AsRef<Path>) -> FleetResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&raw)?,
            _ => serde_yaml::from_str(&raw)?,
        };
        let errors = config.validate();
        if !errors.is_empty() {
            return Err(FleetError::validation(errors));
        }
        tracing::debug!(path = %path.display(), "Loaded fleet configuration");
        Ok(config)
    }

    /// Check the settings the runtime depends on
    ///
    /// Returns every problem found, empty when valid. Intervals, timeouts and
    /// thresholds must be non-zero and the jitter factor within `0.0..=1.0`.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let mut require_nonzero = |value: Duration, field: &str| {
            if value.is_zero() {
                errors.push(format!("{field} must be greater than zero"));
            }
        };

        require_nonzero(self.health.interval, "health.interval");
        require_nonzero(self.health.probe_timeout, "health.probe_timeout");
        require_nonzero(self.circuit_breaker.timeout, "circuit_breaker.timeout");
        require_nonzero(self.isolation.base_quarantine, "isolation.base_quarantine");
        require_nonzero(self.construction_timeout, "construction_timeout");

        if self.circuit_breaker.failure_threshold == 0 {
            errors.push("circuit_breaker.failure_threshold must be at least 1".to_string());
        }
        if self.circuit_breaker.success_threshold == 0 {
            errors.push("circuit_breaker.success_threshold must be at least 1".to_string());
        }
        if self.isolation.quarantine_threshold == 0 {
            errors.push("isolation.quarantine_threshold must be at least 1".to_string());
        }
        if self.isolation.max_quarantine < self.isolation.base_quarantine {
            errors.push("isolation.max_quarantine must not be below base_quarantine".to_string());
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            errors.push(format!(
                "retry.jitter_factor must be within 0.0..=1.0, got {}",
                self.retry.jitter_factor
            ));
        }
        if self.retry.max_delay < self.retry.base_delay {
            errors.push("retry.max_delay must not be below base_delay".to_string());
        }

        errors
    }

    /// Load from a file if it exists, otherwise use defaults
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be parsed.
    pub fn load_or_default(path: Option<&Path>) -> FleetResult<Self> {
        match path {
            Some(path) if path.exists() => Self::from_file(path),
            Some(path) => Err(FleetError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("config file {} not found", path.display()),
            ))),
            None => Ok(Self::default()),
        }
    }

    /// Override the registry location
    #[must_use]
    pub fn with_registry_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.registry_path = path.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_stdio_requires_command() {
        let config = ServerConfig::stdio("fs", "", vec![]);
        assert_eq!(config.validate(), vec!["stdio server requires a command"]);
    }

    #[test]
    fn test_http_requires_valid_url() {
        assert!(ServerConfig::http("api", "https://example.com/mcp")
            .validate()
            .is_empty());
        assert_eq!(ServerConfig::http("api", "").validate().len(), 1);
        assert_eq!(ServerConfig::sse("events", "not a url").validate().len(), 1);
        assert_eq!(
            ServerConfig::sse("events", "ftp://example.com").validate(),
            vec!["sse url must use http or https, got 'ftp'"]
        );
    }

    #[test]
    fn test_validate_collects_every_problem() {
        let config = ServerConfig::http(" ", "").with_timeout(Duration::ZERO);
        assert_eq!(config.validate().len(), 3);
    }

    #[test]
    fn test_server_config_json_shape() {
        let config = ServerConfig::stdio("fs", "npx", vec!["server-fs".into()]).with_id("a1");
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["connection"]["kind"], "stdio");
        assert_eq!(json["timeout"], 30);

        let back: ServerConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_server_config_defaults_when_omitted() {
        let config: ServerConfig = serde_json::from_str(
            r#"{"name":"api","connection":{"kind":"http","url":"http://localhost:8080"}}"#,
        )
        .unwrap();
        assert!(config.enabled);
        assert!(config.id.is_empty());
        assert_eq!(config.kind(), ServerKind::Http);
        assert_eq!(config.timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_fleet_config_partial_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleet.yaml");
        std::fs::write(
            &path,
            "registry_path: /tmp/fleet.json\nhealth:\n  interval: 5\ncircuit_breaker:\n  failure_threshold: 3\n",
        )
        .unwrap();

        let config = FleetConfig::from_file(&path).unwrap();
        assert_eq!(config.registry_path, PathBuf::from("/tmp/fleet.json"));
        assert_eq!(config.health.interval, Duration::from_secs(5));
        assert_eq!(config.circuit_breaker.failure_threshold, 3);
        assert_eq!(config.circuit_breaker.success_threshold, 2);
        assert_eq!(config.event_capacity, 100);
    }

    #[test]
    fn test_fleet_config_rejects_unusable_settings() {
        assert!(FleetConfig::default().validate().is_empty());

        let mut config = FleetConfig::default();
        config.health.interval = Duration::ZERO;
        config.circuit_breaker.success_threshold = 0;
        config.retry.jitter_factor = f64::NAN;
        assert_eq!(
            config.validate(),
            vec![
                "health.interval must be greater than zero",
                "circuit_breaker.success_threshold must be at least 1",
                "retry.jitter_factor must be within 0.0..=1.0, got NaN",
            ]
        );
    }

    #[test]
    fn test_zero_interval_in_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleet.yaml");
        std::fs::write(&path, "health:\n  interval: 0\n").unwrap();

        let result = FleetConfig::from_file(&path);
        assert!(matches!(result, Err(FleetError::Validation { .. })));
    }

    #[test]
    fn test_missing_config_file_is_an_error() {
        let result = FleetConfig::load_or_default(Some(Path::new("/nonexistent/fleet.yaml")));
        assert!(matches!(result, Err(FleetError::Io(_))));
        assert!(FleetConfig::load_or_default(None).is_ok());
    }
}
