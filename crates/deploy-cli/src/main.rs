use anyhow::Result;
use clap::{ArgGroup, Args, Parser, Subcommand};
use deploy_core::{OperationKind, TargetSet};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;
mod dispatch;

#[derive(Parser)]
#[command(name = "stackdeploy")]
#[command(about = "Deploy, upgrade and remove a software stack across a fleet of hosts", long_about = None)]
struct Cli {
    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (default: ~/.config/stackdeploy/deploy.yaml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Install the stack on the targets
    Install(OperationArgs),

    /// Remove the stack from the targets
    Uninstall(OperationArgs),

    /// Upgrade the stack on the targets
    Upgrade(OperationArgs),

    /// Check that hosts answer before deploying
    Probe {
        /// Host ids from the inventory, or plain addresses
        #[arg(required = true)]
        hosts: Vec<String>,

        /// Probe rounds (default from config)
        #[arg(short, long)]
        rounds: Option<u32>,
    },

    /// Show one operation, or list recent ones
    Status {
        /// Operation ID
        operation_id: Option<String>,

        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Show the operation log of one host
    Logs {
        /// Operation ID
        operation_id: String,

        /// Host ID
        host_id: String,

        /// Number of lines to show
        #[arg(short, long, default_value = "50")]
        lines: usize,
    },

    /// List inventory hosts with their last recorded status
    Hosts {
        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Show or initialize the config file
    Config {
        /// Print config file path
        #[arg(long)]
        path: bool,

        /// Write a sample config
        #[arg(long)]
        init: bool,
    },
}

#[derive(Args)]
#[command(group(ArgGroup::new("target").required(true).args(["hosts", "role", "cluster"])))]
struct OperationArgs {
    /// Comma-separated host ids
    #[arg(long, value_delimiter = ',')]
    hosts: Vec<String>,

    /// Every host of a role
    #[arg(long)]
    role: Option<String>,

    /// Every host of every role in a cluster
    #[arg(long)]
    cluster: Option<String>,

    /// Backend to run (default: the backend of the targeted roles)
    #[arg(long)]
    backend: Option<String>,

    /// Print the final report as JSON
    #[arg(long)]
    json: bool,
}

impl OperationArgs {
    fn target_set(&self) -> TargetSet {
        match (&self.role, &self.cluster) {
            (Some(role), _) => TargetSet::Role(role.clone()),
            (None, Some(cluster)) => TargetSet::Cluster(cluster.clone()),
            (None, None) => TargetSet::Hosts(self.hosts.clone()),
        }
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into())
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    use Commands::*;

    let ok = match cli.command {
        Install(args) => run_operation(cli.config, OperationKind::Install, args).await?,
        Uninstall(args) => run_operation(cli.config, OperationKind::Uninstall, args).await?,
        Upgrade(args) => run_operation(cli.config, OperationKind::Upgrade, args).await?,
        Probe { hosts, rounds } => {
            let config = dispatch::load_config(cli.config.as_deref())?;
            commands::probe(&config, &hosts, rounds).await?
        }
        Status { operation_id, json } => {
            let config = dispatch::load_config(cli.config.as_deref())?;
            commands::status(&config, operation_id.as_deref(), json).await?;
            true
        }
        Logs {
            operation_id,
            host_id,
            lines,
        } => {
            let config = dispatch::load_config(cli.config.as_deref())?;
            commands::logs(&config, &operation_id, &host_id, lines).await?;
            true
        }
        Hosts { json } => {
            let config = dispatch::load_config(cli.config.as_deref())?;
            commands::hosts(&config, json).await?;
            true
        }
        Config { path, init } => {
            commands::config(cli.config.as_deref(), path, init).await?;
            true
        }
    };

    Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

async fn run_operation(config_path: Option<PathBuf>, kind: OperationKind, args: OperationArgs) -> Result<bool> {
    let config = dispatch::load_config(config_path.as_deref())?;
    let targets = args.target_set();
    commands::deploy(config, kind, targets, args.backend, args.json).await
}
