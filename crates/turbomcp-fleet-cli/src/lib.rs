//! # turbomcp-fleet CLI
//!
//! Operator tooling for a fleet of MCP servers. Each subcommand maps onto
//! one operation of the fleet [`Manager`]:
//!
//! | command   | operation                     |
//! |-----------|-------------------------------|
//! | `list`    | `Registry::list_all`          |
//! | `start`   | `Manager::enable_server`      |
//! | `stop`    | `Manager::disable_server`     |
//! | `restart` | `Manager::reload_server`      |
//! | `status`  | `Manager::get_server_status`  |
//! | `test`    | `HealthMonitor::check_health` |
//! | `logs`    | `StatusTracker::get_events`   |
//! | `install` | `Registry::register`          |
//! | `remove`  | `Manager::remove_server`      |
//!
//! ```bash
//! turbomcp-fleet install files --command npx -a -y -a @modelcontextprotocol/server-filesystem
//! turbomcp-fleet install search --kind http --url https://search.example.com/mcp
//! turbomcp-fleet test search
//! turbomcp-fleet status --json
//! ```

pub mod cli;
pub mod output;

use anyhow::{Context, bail};
use clap::Parser;
use std::collections::BTreeMap;
use std::io::IsTerminal;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use turbomcp_fleet::{Connection, FleetConfig, Manager, ServerConfig};

use cli::{Cli, Commands, InstallArgs, KindArg};
use output::Formatter;

/// Parse arguments and run one command
///
/// # Errors
///
/// Returns an error if configuration cannot be loaded or the command fails.
pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = FleetConfig::load_or_default(cli.config.as_deref())
        .context("failed to load fleet configuration")?;
    if let Some(path) = &cli.registry {
        config = config.with_registry_path(path);
    }

    let manager = Arc::new(Manager::with_default_connector(config)?);
    let colored = !cli.no_color && std::io::stdout().is_terminal();
    let out = Formatter::new(cli.json, colored);

    let result = execute(&manager, cli.command, out).await;
    manager.shutdown().await;
    result
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    // A second init (e.g. in tests) is harmless
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

/// Run `command` against `manager`
///
/// # Errors
///
/// Returns an error for unknown servers, invalid input or registry I/O
/// failures.
pub async fn execute(manager: &Arc<Manager>, command: Commands, out: Formatter) -> anyhow::Result<()> {
    manager
        .registry()
        .load()
        .await
        .context("failed to load server registry")?;

    match command {
        Commands::List => out.display_servers(&manager.list_servers()),
        Commands::Start(target) => {
            let id = resolve(manager, &target.server)?;
            manager.enable_server(&id).await?;
            out.print_success(&format!("Enabled {}", target.server));
            Ok(())
        }
        Commands::Stop(target) => {
            let id = resolve(manager, &target.server)?;
            manager.disable_server(&id).await?;
            out.print_success(&format!("Disabled {}", target.server));
            Ok(())
        }
        Commands::Restart(target) => {
            let id = resolve(manager, &target.server)?;
            manager.reload_server(&id).await;
            out.print_success(&format!("Reloaded {}", target.server));
            Ok(())
        }
        Commands::Status { server: Some(server) } => {
            let id = resolve(manager, &server)?;
            out.display_status(&manager.get_server_status(&id).await?)
        }
        Commands::Status { server: None } => out.display_statuses(&manager.list_statuses().await),
        Commands::Test(target) => {
            let id = resolve(manager, &target.server)?;
            let health = manager.check_health(&id).await?;
            out.display_health(&target.server, &health)?;
            if !health.is_healthy() {
                bail!("health check failed for {}", target.server);
            }
            Ok(())
        }
        Commands::Logs {
            server,
            limit,
            follow,
        } => {
            let id = resolve(manager, &server)?;
            if follow {
                follow_events(manager, &id, limit, out).await
            } else {
                out.display_events(&manager.get_events(&id, Some(limit)))
            }
        }
        Commands::Install(args) => {
            let config = install_config(args)?;
            let name = config.name.clone();
            let id = manager.register_server(config).await?;
            if out.is_json() {
                out.display_json(&serde_json::json!({ "id": id, "name": name }))
            } else {
                out.print_success(&format!("Installed {name} ({id})"));
                Ok(())
            }
        }
        Commands::Remove(target) => {
            let id = resolve(manager, &target.server)?;
            manager.remove_server(&id).await?;
            out.print_success(&format!("Removed {}", target.server));
            Ok(())
        }
        Commands::Run => run_fleet(manager, out).await,
    }
}

/// Resolve a server id or name to an id
fn resolve(manager: &Manager, server: &str) -> anyhow::Result<String> {
    let registry = manager.registry();
    if let Some(config) = registry.get(server) {
        return Ok(config.id);
    }
    match registry.get_by_name(server) {
        Some(config) => Ok(config.id),
        None => bail!("no server with id or name '{server}'"),
    }
}

fn parse_pairs(pairs: &[String], what: &str) -> anyhow::Result<BTreeMap<String, String>> {
    pairs
        .iter()
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
            _ => bail!("invalid {what} '{pair}' (expected KEY=VALUE)"),
        })
        .collect()
}

fn install_config(args: InstallArgs) -> anyhow::Result<ServerConfig> {
    let connection = match args.kind {
        KindArg::Stdio => Connection::Stdio {
            command: args.command.unwrap_or_default(),
            args: args.args,
            env: parse_pairs(&args.env, "environment variable")?,
            working_dir: args.working_dir,
        },
        KindArg::Http => Connection::Http {
            url: args.url.unwrap_or_default(),
            headers: parse_pairs(&args.headers, "header")?,
        },
        KindArg::Sse => Connection::Sse {
            url: args.url.unwrap_or_default(),
            headers: parse_pairs(&args.headers, "header")?,
        },
    };

    Ok(ServerConfig::new(args.name, connection)
        .with_enabled(!args.disabled)
        .with_timeout(Duration::from_secs(args.timeout)))
}

/// Monitor one server and stream its events until Ctrl-C
async fn follow_events(
    manager: &Arc<Manager>,
    id: &str,
    limit: usize,
    out: Formatter,
) -> anyhow::Result<()> {
    let server = manager
        .server(id)
        .with_context(|| format!("server '{id}' disappeared"))?;
    manager.check_health(id).await?;

    let backlog = manager.get_events(id, None);
    let start = backlog.len().saturating_sub(limit);
    for event in &backlog[start..] {
        out.print_event(event);
    }
    let mut last_seen = backlog.last().map(|e| e.timestamp);

    let mut ticker = tokio::time::interval(manager.config().health.interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                if server.is_enabled() && !server.is_quarantined() {
                    manager.check_health(id).await?;
                }
                for event in manager.get_events(id, None) {
                    if last_seen.is_none_or(|seen| event.timestamp > seen) {
                        out.print_event(&event);
                        last_seen = Some(event.timestamp);
                    }
                }
            }
        }
    }

    Ok(())
}

/// Start the whole fleet and report its agent-visible pool until Ctrl-C
async fn run_fleet(manager: &Arc<Manager>, out: Formatter) -> anyhow::Result<()> {
    let count = manager.start().await.context("failed to start fleet")?;
    out.print_info(&format!("Monitoring {count} servers, Ctrl-C to stop"));

    let mut ticker = tokio::time::interval(manager.config().health.interval);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                let handles = manager.get_servers_for_agent().await;
                let ids: Vec<&str> = handles.iter().map(|h| h.server_id()).collect();
                tracing::info!(available = handles.len(), servers = ?ids, "Agent-visible servers");
                if out.is_json() {
                    out.display_json(&manager.list_statuses().await)?;
                } else {
                    out.display_statuses(&manager.list_statuses().await)?;
                }
            }
        }
    }
    Ok(())
}
