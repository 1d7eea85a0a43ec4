//! End-to-end fleet behaviour against scripted handles

use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use turbomcp_fleet::testing::{MockBehavior, MockFactory};
use turbomcp_fleet::{
    BackoffStrategy, CircuitState, EventType, FleetConfig, FleetError, HealthCheckConfig, Manager,
    RetryPolicy, ServerConfig, ServerState,
};

fn fleet(factory: &Arc<MockFactory>) -> Manager {
    let config = FleetConfig {
        construction_timeout: Duration::from_secs(2),
        ..FleetConfig::default()
    };
    Manager::in_memory(config, factory.clone()).unwrap()
}

fn ids(handles: &[Arc<dyn turbomcp_fleet::ServerHandle>]) -> Vec<String> {
    let mut ids: Vec<String> = handles.iter().map(|h| h.server_id().to_string()).collect();
    ids.sort();
    ids
}

async fn register_abc(manager: &Manager, factory: &MockFactory) {
    factory.set_behavior("b", MockBehavior::FailConnect);
    manager
        .register_server(ServerConfig::stdio("alpha", "alpha-server", vec![]).with_id("a"))
        .await
        .unwrap();
    manager
        .register_server(ServerConfig::http("bravo", "http://localhost:9001/mcp").with_id("b"))
        .await
        .unwrap();
    manager
        .register_server(
            ServerConfig::sse("charlie", "http://localhost:9002/sse")
                .with_id("c")
                .with_enabled(false),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn agent_sees_only_usable_servers() {
    let factory = Arc::new(MockFactory::default());
    let manager = fleet(&factory);
    register_abc(&manager, &factory).await;

    let handles = manager.get_servers_for_agent().await;
    assert_eq!(ids(&handles), vec!["a"]);

    assert_eq!(factory.connects("c"), 0);
    assert_eq!(manager.tracker().get_status("b"), ServerState::Error);
}

#[tokio::test(start_paused = true)]
async fn failing_server_is_quarantined_then_retried() {
    let factory = Arc::new(MockFactory::default());
    factory.set_behavior("b", MockBehavior::FailProbe);
    let manager = fleet(&factory);
    manager
        .register_server(ServerConfig::stdio("alpha", "alpha-server", vec![]).with_id("a"))
        .await
        .unwrap();
    manager
        .register_server(ServerConfig::http("bravo", "http://localhost:9001/mcp").with_id("b"))
        .await
        .unwrap();

    for _ in 0..5 {
        let health = manager.check_health("b").await.unwrap();
        assert!(!health.is_healthy());
    }
    let report = manager.get_server_status("b").await.unwrap();
    assert_eq!(report.state, ServerState::Quarantined);
    assert_eq!(report.circuit.state, CircuitState::Open);
    assert_eq!(report.quarantine_remaining, Some(Duration::from_secs(30)));
    assert_eq!(factory.connects("b"), 1);
    assert_eq!(factory.shutdowns("b"), 1);

    assert_eq!(ids(&manager.get_servers_for_agent().await), vec!["a"]);

    tokio::time::advance(Duration::from_secs(31)).await;

    // The lapsed quarantine turns the next access into a recovery trial
    let handles = manager.get_servers_for_agent().await;
    assert_eq!(ids(&handles), vec!["a", "b"]);
    assert_eq!(factory.connects("b"), 2);
    let server = manager.server("b").unwrap();
    assert_eq!(server.circuit_breaker().state(), CircuitState::HalfOpen);

    // A renewed failure re-quarantines with a doubled window
    manager.check_health("b").await.unwrap();
    let report = manager.get_server_status("b").await.unwrap();
    assert_eq!(report.state, ServerState::Quarantined);
    assert_eq!(report.errors.quarantine_count, 2);
    assert_eq!(report.quarantine_remaining, Some(Duration::from_secs(60)));
    assert_eq!(report.circuit.state, CircuitState::Open);
}

#[tokio::test(start_paused = true)]
async fn retry_with_backoff_waits_between_attempts() {
    let policy = RetryPolicy::default();
    let calls = AtomicU32::new(0);
    let started = Instant::now();

    let result = policy
        .retry_with_backoff("b", 3, BackoffStrategy::Exponential, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(FleetError::network("connection reset"))
                } else {
                    Ok("done")
                }
            }
        })
        .await;

    assert_eq!(result.unwrap(), "done");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(3), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_millis(3100), "elapsed {elapsed:?}");
    assert_eq!(policy.get_retry_stats("b").total_retries, 2);
}

#[tokio::test(start_paused = true)]
async fn agent_call_never_fails() {
    let factory = Arc::new(MockFactory::default());
    factory.set_behavior("panics", MockBehavior::PanicConnect);
    factory.set_behavior("hangs", MockBehavior::HangConnect);
    factory.set_behavior("refuses", MockBehavior::FailConnect);
    let manager = fleet(&factory);

    for id in ["ok", "panics", "hangs", "refuses"] {
        manager
            .register_server(ServerConfig::stdio(id, "server", vec![]).with_id(id))
            .await
            .unwrap();
    }

    let handles = manager.get_servers_for_agent().await;
    assert_eq!(ids(&handles), vec!["ok"]);

    let stats = manager.get_server_status("panics").await.unwrap().errors;
    assert_eq!(stats.consecutive_errors, 1);
    assert!(
        stats
            .last_error
            .is_some_and(|message| message.contains("panicked"))
    );

    let report = manager.get_server_status("hangs").await.unwrap();
    assert_eq!(report.state, ServerState::Error);
}

#[tokio::test]
async fn duplicate_names_are_rejected() {
    let factory = Arc::new(MockFactory::default());
    let manager = fleet(&factory);

    manager
        .register_server(ServerConfig::stdio("alpha", "alpha-server", vec![]))
        .await
        .unwrap();
    let err = manager
        .register_server(ServerConfig::http("alpha", "http://localhost:9001"))
        .await
        .unwrap_err();

    assert!(matches!(err, FleetError::Validation { .. }));
    assert_eq!(manager.list_servers().len(), 1);
}

#[tokio::test]
async fn registry_survives_restart() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = FleetConfig::default().with_registry_path(dir.path().join("fleet.json"));
    let factory = Arc::new(MockFactory::default());

    let first = Manager::new(config.clone(), factory.clone()).unwrap();
    first.start().await.unwrap();
    first
        .register_server(ServerConfig::stdio("alpha", "alpha-server", vec![]).with_id("a"))
        .await
        .unwrap();
    first
        .register_server(ServerConfig::http("bravo", "http://localhost:9001").with_id("b"))
        .await
        .unwrap();
    assert!(first.disable_server("b").await.unwrap());
    assert!(first.remove_server("a").await.unwrap());
    first.shutdown().await;

    let second = Manager::new(config, factory.clone()).unwrap();
    assert_eq!(second.start().await.unwrap(), 1);
    let servers = second.list_servers();
    assert_eq!(servers.len(), 1);
    assert_eq!(servers[0].id, "b");
    assert!(!servers[0].enabled);
    assert!(!second.monitor().is_monitoring("b"));
    second.shutdown().await;
}

#[tokio::test]
async fn reload_forces_reconstruction() {
    let factory = Arc::new(MockFactory::default());
    let manager = fleet(&factory);
    manager
        .register_server(ServerConfig::stdio("alpha", "alpha-server", vec![]).with_id("a"))
        .await
        .unwrap();

    manager.get_servers_for_agent().await;
    assert!(manager.reload_server("a").await);
    assert!(!manager.reload_server("missing").await);
    manager.get_servers_for_agent().await;

    assert_eq!(factory.connects("a"), 2);
    assert_eq!(factory.shutdowns("a"), 1);
}

#[tokio::test(start_paused = true)]
async fn monitor_recovers_server_after_quarantine() {
    let factory = Arc::new(MockFactory::default());
    factory.set_behavior("b", MockBehavior::FailProbe);
    let manager = fleet(&factory);
    manager.start().await.unwrap();
    manager
        .register_server(ServerConfig::http("bravo", "http://localhost:9001/mcp").with_id("b"))
        .await
        .unwrap();

    // Background probes at 0, 30, 60, 90 and 120s all fail
    tokio::time::sleep(Duration::from_secs(125)).await;
    let server = manager.server("b").unwrap();
    assert_eq!(server.state(), ServerState::Quarantined);
    assert!(server.circuit_breaker().is_open());

    // The 150s probe lands as the 30s window lapses, well before the breaker timeout
    factory.set_behavior("b", MockBehavior::Healthy);
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert!(manager.monitor().is_healthy("b"));
    assert_eq!(server.state(), ServerState::Running);
    assert_eq!(server.circuit_breaker().state(), CircuitState::HalfOpen);
    assert!(
        manager
            .get_events("b", None)
            .iter()
            .any(|event| event.event_type == EventType::Released)
    );
    assert_eq!(ids(&manager.get_servers_for_agent().await), vec!["b"]);

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn hung_probe_does_not_delay_other_servers() {
    let factory = Arc::new(MockFactory::default());
    factory.set_behavior("stuck", MockBehavior::HangProbe);
    let config = FleetConfig {
        health: HealthCheckConfig {
            interval: Duration::from_secs(1),
            probe_timeout: Duration::from_secs(60),
            ..HealthCheckConfig::default()
        },
        ..FleetConfig::default()
    };
    let manager = Manager::in_memory(config, factory.clone()).unwrap();
    manager.start().await.unwrap();
    for id in ["stuck", "steady"] {
        manager
            .register_server(ServerConfig::stdio(id, "server", vec![]).with_id(id))
            .await
            .unwrap();
    }

    tokio::time::sleep(Duration::from_millis(10_500)).await;
    assert_eq!(factory.probes("stuck"), 1);
    assert_eq!(factory.probes("steady"), 11);
    assert!(manager.monitor().is_monitoring("stuck"));

    manager.shutdown().await;
    assert!(!manager.monitor().is_monitoring("stuck"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn removal_racing_agent_turns_leaves_nothing_behind() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = FleetConfig::default().with_registry_path(dir.path().join("fleet.json"));
    let factory = Arc::new(MockFactory::default());
    let manager = Arc::new(Manager::new(config, factory.clone()).unwrap());

    for round in 0..50 {
        let id = format!("s{round}");
        manager
            .register_server(ServerConfig::stdio(&id, "server", vec![]).with_id(&id))
            .await
            .unwrap();
        manager.get_servers_for_agent().await;

        let remover = tokio::spawn({
            let manager = manager.clone();
            let id = id.clone();
            async move { manager.remove_server(&id).await }
        });
        while !remover.is_finished() {
            manager.get_servers_for_agent().await;
        }
        assert!(remover.await.unwrap().unwrap());

        assert!(manager.get_servers_for_agent().await.is_empty(), "round {round}");
        assert!(manager.server(&id).is_none(), "round {round}");
        assert_eq!(
            factory.connects(&id),
            factory.shutdowns(&id),
            "round {round}: every handle built must be torn down"
        );
    }
}
