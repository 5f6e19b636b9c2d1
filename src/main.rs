use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sqlpool::{cli, config};

#[derive(Parser)]
#[command(name = "sqlpool")]
#[command(version, about = "Database connection pooling proxy core", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path (environment variables are used when omitted)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the configuration and show per-backend pool splits
    Check,

    /// Show per-node pool targets for a cluster
    Plan {
        /// Number of active nodes
        #[arg(long)]
        nodes: Option<usize>,

        /// Cluster-health report, e.g. "host1:1059(UP);host2:1059(DOWN)"
        #[arg(long)]
        report: Option<String>,
    },

    /// Run concurrent clients against in-memory backends
    Simulate {
        /// Number of concurrent clients
        #[arg(long, default_value = "16")]
        clients: usize,

        /// Sessions opened by each client
        #[arg(long, default_value = "50")]
        operations: usize,

        /// Simulated statement latency in milliseconds
        #[arg(long, default_value = "2")]
        latency_ms: u64,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // Only the simulation needs worker threads
    let runtime = if matches!(cli.command, Commands::Simulate { .. }) {
        tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?
    } else {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?
    };

    runtime.block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    let config = config::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Check => {
            cli::commands::cmd_check(&config)?;
        }
        Commands::Plan { nodes, report } => {
            cli::commands::cmd_plan(&config, nodes, report.as_deref())?;
        }
        Commands::Simulate {
            clients,
            operations,
            latency_ms,
        } => {
            cli::commands::cmd_simulate(config, clients, operations, latency_ms).await?;
        }
    }

    Ok(())
}
