//! CLI argument parsing

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Operator tooling for a fleet of MCP servers
#[derive(Parser, Debug)]
#[command(
    name = "turbomcp-fleet",
    version,
    about = "Manage, monitor and test a fleet of MCP servers",
    long_about = "turbomcp-fleet keeps a registry of MCP servers and reports their health,\n\
                  circuit breaker and quarantine state.\n\n\
                  SECURITY WARNING:\n\
                  - stdio servers are arbitrary commands executed on this machine\n\
                  - Only install servers from sources you trust"
)]
pub struct Cli {
    /// Subcommand to run
    #[command(subcommand)]
    pub command: Commands,

    /// Fleet configuration file (YAML or JSON)
    #[arg(long, short = 'c', global = true, env = "TURBOMCP_FLEET_CONFIG")]
    pub config: Option<PathBuf>,

    /// Registry document, overriding the configuration file
    #[arg(long, global = true, env = "TURBOMCP_FLEET_REGISTRY")]
    pub registry: Option<PathBuf>,

    /// Print machine-readable JSON
    #[arg(long, global = true)]
    pub json: bool,

    /// Enable debug logging
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List registered servers
    List,

    /// Enable a server
    Start(ServerRef),

    /// Disable a server and tear down its connection
    Stop(ServerRef),

    /// Drop a server's connection and circuit/error state
    Restart(ServerRef),

    /// Show merged status of one server, or of all servers
    Status {
        /// Server id or name; all servers when omitted
        server: Option<String>,
    },

    /// Probe a server now and report the outcome
    Test(ServerRef),

    /// Show a server's event history
    Logs {
        /// Server id or name
        server: String,

        /// Number of most recent events to show
        #[arg(long, short = 'n', default_value_t = 20)]
        limit: usize,

        /// Keep monitoring the server and print new events until Ctrl-C
        #[arg(long, short = 'f')]
        follow: bool,
    },

    /// Register a new server
    Install(InstallArgs),

    /// Unregister a server
    Remove(ServerRef),

    /// Monitor every enabled server until Ctrl-C
    Run,
}

/// A server given by id or name
#[derive(Args, Debug, Clone)]
pub struct ServerRef {
    /// Server id or name
    pub server: String,
}

/// Transport kind accepted by `install`
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum KindArg {
    /// Local subprocess over stdin/stdout
    Stdio,
    /// Server-Sent Events endpoint
    Sse,
    /// HTTP endpoint
    Http,
}

/// Arguments for `install`
#[derive(Args, Debug)]
pub struct InstallArgs {
    /// Unique server name
    pub name: String,

    /// Transport kind
    #[arg(long, short = 'k', value_enum, default_value = "stdio")]
    pub kind: KindArg,

    /// Command to run (stdio)
    #[arg(long, required_if_eq("kind", "stdio"))]
    pub command: Option<String>,

    /// Endpoint URL (http/sse)
    #[arg(long, required_if_eq_any([("kind", "http"), ("kind", "sse")]))]
    pub url: Option<String>,

    /// Command arguments (stdio)
    #[arg(long, short = 'a', allow_hyphen_values = true)]
    pub args: Vec<String>,

    /// Environment variables (KEY=VALUE, stdio)
    #[arg(long, short = 'e')]
    pub env: Vec<String>,

    /// Request headers (KEY=VALUE, http/sse)
    #[arg(long = "header", short = 'H')]
    pub headers: Vec<String>,

    /// Working directory (stdio)
    #[arg(long)]
    pub working_dir: Option<PathBuf>,

    /// Per-call timeout in seconds
    #[arg(long, default_value_t = 30)]
    pub timeout: u64,

    /// Register without enabling
    #[arg(long)]
    pub disabled: bool,
}
