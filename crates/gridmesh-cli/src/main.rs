//! gridmesh: plan overlay networks and workloads against a simulated grid.
//!
//! # Usage
//!
//! ```text
//! gridmesh plan --scenario cluster.toml --config gridmesh.toml --state plan.redb
//! gridmesh state --state plan.redb
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

const DEFAULT_FILTER: &str = "info,gridmesh=debug";

#[derive(Parser)]
#[command(
    name = "gridmesh",
    about = "gridmesh: WireGuard mesh and workload reconciliation",
    version,
    propagate_version = true
)]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run generate, deploy and sync for a scenario on an in-memory grid.
    Plan {
        /// Scenario file: nodes, network and resources.
        #[arg(short, long)]
        scenario: PathBuf,
        /// Grid config (gridmesh.toml). Defaults apply when omitted.
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// redb file receiving the network ledger and resource snapshots.
        #[arg(long)]
        state: Option<PathBuf>,
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },
    /// Print the network ledger and resources saved by `plan`.
    State {
        #[arg(long)]
        state: PathBuf,
        /// Only this network.
        #[arg(short, long)]
        network: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if cli.json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    match cli.command {
        Command::Plan {
            scenario,
            config,
            state,
            format,
        } => commands::plan::plan(&scenario, config.as_deref(), state.as_deref(), &format).await,
        Command::State { state, network } => commands::state::show(&state, network.as_deref()),
    }
}
