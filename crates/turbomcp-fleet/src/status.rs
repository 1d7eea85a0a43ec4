//! In-memory per-server status tracking
//!
//! [`StatusTracker`] holds the current [`ServerState`], free-form metadata,
//! start/stop times and a bounded event history for every server. Each
//! server's entry has its own lock, so tracking one server never waits on
//! another.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Default number of events kept per server
pub const DEFAULT_EVENT_CAPACITY: usize = 100;

/// Lifecycle state of a managed server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    /// Not running (never started, disabled or stopped)
    #[default]
    Stopped,
    /// Transport handle is being constructed
    Starting,
    /// Handle constructed and last check passed
    Running,
    /// Handle is being torn down
    Stopping,
    /// Last construction or probe failed
    Error,
    /// Excluded after repeated failures
    Quarantined,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Error => "error",
            Self::Quarantined => "quarantined",
        })
    }
}

/// Kind of recorded event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Handle constructed
    Started,
    /// Handle torn down
    Stopped,
    /// Construction or call failed
    Error,
    /// Probe completed
    HealthCheck,
    /// Quarantine started
    Quarantined,
    /// Quarantine ended
    Released,
    /// Configuration changed
    ConfigChanged,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Started => "started",
            Self::Stopped => "stopped",
            Self::Error => "error",
            Self::HealthCheck => "health_check",
            Self::Quarantined => "quarantined",
            Self::Released => "released",
            Self::ConfigChanged => "config_changed",
        })
    }
}

/// One entry in a server's event history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// When the event happened
    pub timestamp: DateTime<Utc>,
    /// What happened
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Free-form details
    pub details: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug)]
struct TrackedServer {
    state: ServerState,
    metadata: HashMap<String, serde_json::Value>,
    events: VecDeque<Event>,
    started_at: Option<Instant>,
    stopped_at: Option<Instant>,
}

impl TrackedServer {
    fn new(capacity: usize) -> Self {
        Self {
            state: ServerState::Stopped,
            metadata: HashMap::new(),
            events: VecDeque::with_capacity(capacity.min(DEFAULT_EVENT_CAPACITY)),
            started_at: None,
            stopped_at: None,
        }
    }
}

/// Per-server state, metadata and event history
#[derive(Debug)]
pub struct StatusTracker {
    capacity: usize,
    servers: DashMap<String, Arc<Mutex<TrackedServer>>>,
}

impl Default for StatusTracker {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl StatusTracker {
    /// Create a tracker keeping at most `capacity` events per server
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            servers: DashMap::new(),
        }
    }

    fn entry(&self, id: &str) -> Arc<Mutex<TrackedServer>> {
        if let Some(entry) = self.servers.get(id) {
            return entry.clone();
        }
        self.servers
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(TrackedServer::new(self.capacity))))
            .clone()
    }

    /// Set the current state, returning the previous one
    pub fn set_status(&self, id: &str, state: ServerState) -> ServerState {
        let entry = self.entry(id);
        let mut server = entry.lock();
        let previous = std::mem::replace(&mut server.state, state);
        if previous != state {
            tracing::debug!(server_id = %id, from = %previous, to = %state, "Server state changed");
        }
        previous
    }

    /// Move from `from` to `to` in one step; `false` if the state was not `from`
    pub fn transition(&self, id: &str, from: ServerState, to: ServerState) -> bool {
        let entry = self.entry(id);
        let mut server = entry.lock();
        if server.state != from {
            return false;
        }
        server.state = to;
        tracing::debug!(server_id = %id, from = %from, to = %to, "Server state changed");
        true
    }

    /// Current state (`Stopped` for unknown servers)
    pub fn get_status(&self, id: &str) -> ServerState {
        self.servers
            .get(id)
            .map(|entry| entry.lock().state)
            .unwrap_or_default()
    }

    /// Set a metadata value
    pub fn set_metadata(&self, id: &str, key: impl Into<String>, value: serde_json::Value) {
        self.entry(id).lock().metadata.insert(key.into(), value);
    }

    /// Get a metadata value
    pub fn get_metadata(&self, id: &str, key: &str) -> Option<serde_json::Value> {
        self.servers
            .get(id)
            .and_then(|entry| entry.lock().metadata.get(key).cloned())
    }

    /// Append an event, evicting the oldest past capacity
    pub fn record_event(
        &self,
        id: &str,
        event_type: EventType,
        details: serde_json::Map<String, serde_json::Value>,
    ) {
        let entry = self.entry(id);
        let mut server = entry.lock();
        if server.events.len() >= self.capacity {
            server.events.pop_front();
        }
        server.events.push_back(Event {
            timestamp: Utc::now(),
            event_type,
            details,
        });
    }

    /// Most recent events, oldest first; `limit` of `None` returns all
    pub fn get_events(&self, id: &str, limit: Option<usize>) -> Vec<Event> {
        let Some(entry) = self.servers.get(id).map(|e| e.clone()) else {
            return Vec::new();
        };
        let server = entry.lock();
        let skip = limit.map_or(0, |limit| server.events.len().saturating_sub(limit));
        server.events.iter().skip(skip).cloned().collect()
    }

    /// Mark the server as started now
    pub fn record_start_time(&self, id: &str) {
        self.entry(id).lock().started_at = Some(Instant::now());
    }

    /// Mark the server as stopped now
    pub fn record_stop_time(&self, id: &str) {
        self.entry(id).lock().stopped_at = Some(Instant::now());
    }

    /// Time since the last start, or `None` if never started or stopped since
    pub fn get_uptime(&self, id: &str) -> Option<Duration> {
        let entry = self.servers.get(id)?.clone();
        let server = entry.lock();
        let started = server.started_at?;
        match server.stopped_at {
            Some(stopped) if stopped >= started => None,
            _ => Some(started.elapsed()),
        }
    }

    /// Forget everything about `id`
    pub fn clear(&self, id: &str) {
        self.servers.remove(id);
    }
}

/// Build an event details map from key/value pairs
#[macro_export]
macro_rules! details {
    () => { ::serde_json::Map::new() };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut map = ::serde_json::Map::new();
        $( map.insert(($key).to_string(), ::serde_json::json!($value)); )+
        map
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_server_defaults() {
        let tracker = StatusTracker::default();
        assert_eq!(tracker.get_status("missing"), ServerState::Stopped);
        assert!(tracker.get_events("missing", None).is_empty());
        assert!(tracker.get_uptime("missing").is_none());
        assert!(tracker.get_metadata("missing", "pid").is_none());
    }

    #[test]
    fn test_set_status_returns_previous() {
        let tracker = StatusTracker::default();
        assert_eq!(
            tracker.set_status("s1", ServerState::Starting),
            ServerState::Stopped
        );
        assert_eq!(
            tracker.set_status("s1", ServerState::Running),
            ServerState::Starting
        );
        assert_eq!(tracker.get_status("s1"), ServerState::Running);
    }

    #[test]
    fn test_event_buffer_is_bounded() {
        let tracker = StatusTracker::new(3);
        for i in 0..5 {
            tracker.record_event("s1", EventType::HealthCheck, details! { "seq" => i });
        }

        let events = tracker.get_events("s1", None);
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].details["seq"], 2);
        assert_eq!(events[2].details["seq"], 4);

        let latest = tracker.get_events("s1", Some(1));
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].details["seq"], 4);
    }

    #[test]
    fn test_transition_requires_expected_state() {
        let tracker = StatusTracker::default();
        tracker.set_status("s1", ServerState::Quarantined);

        assert!(!tracker.transition("s1", ServerState::Error, ServerState::Running));
        assert!(tracker.transition("s1", ServerState::Quarantined, ServerState::Stopped));
        assert!(!tracker.transition("s1", ServerState::Quarantined, ServerState::Stopped));
        assert_eq!(tracker.get_status("s1"), ServerState::Stopped);
    }

    #[test]
    fn test_metadata_round_trip() {
        let tracker = StatusTracker::default();
        tracker.set_metadata("s1", "pid", serde_json::json!(4242));
        assert_eq!(
            tracker.get_metadata("s1", "pid"),
            Some(serde_json::json!(4242))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_uptime_tracks_start_and_stop() {
        let tracker = StatusTracker::default();
        tracker.record_start_time("s1");
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(tracker.get_uptime("s1"), Some(Duration::from_secs(10)));

        tracker.record_stop_time("s1");
        assert!(tracker.get_uptime("s1").is_none());

        tokio::time::advance(Duration::from_secs(1)).await;
        tracker.record_start_time("s1");
        assert_eq!(tracker.get_uptime("s1"), Some(Duration::ZERO));
    }

    #[test]
    fn test_event_serializes_type_field() {
        let tracker = StatusTracker::default();
        tracker.record_event("s1", EventType::Started, details!());
        let json = serde_json::to_value(&tracker.get_events("s1", None)[0]).unwrap();
        assert_eq!(json["type"], "started");
    }
}
