//! Podforward CLI - Forward local ports to Kubernetes pods and services
//!
//! A command-line tool that opens port-forward tunnels through the API
//! server without shelling out to kubectl.

mod commands;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use podforward_core::{LogLevel, SettingsStore};
use tracing_subscriber::EnvFilter;

/// Overrides `--log-level` and the configured level with a full filter directive.
const LOG_ENV: &str = "PODFORWARD_LOG";

#[derive(Parser)]
#[command(name = "podforward")]
#[command(author, version, about = "Forward local ports to Kubernetes pods and services")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output in JSON format
    #[arg(long, global = true)]
    json: bool,

    /// Log verbosity (debug, info, warn, error, off)
    #[arg(long, global = true)]
    log_level: Option<LogLevel>,
}

#[derive(Subcommand)]
enum Commands {
    /// Forward one or more local ports to a pod or service
    #[command(alias = "pf")]
    Forward {
        /// Pod or service name
        target: String,

        /// Port mappings as `LOCAL:REMOTE`, `REMOTE` or `:REMOTE`
        #[arg(required = true)]
        ports: Vec<String>,

        /// IP address to listen on
        #[arg(long)]
        address: Option<String>,

        #[command(flatten)]
        cluster: ClusterArgs,
    },

    /// Show which pod a target resolves to
    Resolve {
        /// Pod or service name
        target: String,

        #[command(flatten)]
        cluster: ClusterArgs,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },
}

#[derive(Args)]
struct ClusterArgs {
    /// Namespace of the target
    #[arg(short, long)]
    namespace: Option<String>,

    /// Path to the kubeconfig file
    #[arg(long)]
    kubeconfig: Option<PathBuf>,

    /// Kubeconfig context to use
    #[arg(long)]
    context: Option<String>,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Write the default configuration if none exists
    Init,
    /// Print the configuration file path
    Path,
}

fn init_logging(level: LogLevel) {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::default().add_directive(level.as_level_filter().into()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let store = SettingsStore::new()?;
    let settings = store.load().await?;
    init_logging(cli.log_level.unwrap_or(settings.log_level));

    match cli.command {
        Commands::Forward {
            target,
            ports,
            address,
            cluster,
        } => {
            let options = commands::forward::Options {
                namespace: cluster.namespace,
                target,
                ports,
                address,
                kubeconfig: cluster.kubeconfig,
                context: cluster.context,
            };
            commands::forward::run(&settings, options, cli.json).await?;
        }
        Commands::Resolve { target, cluster } => {
            commands::resolve::run(
                &settings,
                cluster.namespace,
                &target,
                cluster.kubeconfig,
                cluster.context,
                cli.json,
            )
            .await?;
        }
        Commands::Config { action } => match action.unwrap_or(ConfigAction::Show) {
            ConfigAction::Show => commands::config::show(&store, &settings, cli.json)?,
            ConfigAction::Init => commands::config::init(&store).await?,
            ConfigAction::Path => println!("{}", store.path().display()),
        },
    }

    Ok(())
}
