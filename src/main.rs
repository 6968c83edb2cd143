use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dssim_controller::{
    config::{ClusterConfig, NetworkControlConfig},
    instance::{ContainerImage, Endpoint, Instance},
    k8s::ResourceExecutor,
    network::{self, Bandwidth, Delay, NetworkConditions},
    Orchestrator,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Emit logs as JSON lines
    #[arg(long, env = "DSSIM_JSON_LOGS")]
    json_logs: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Install the traffic shaping agent on every node
    NetworkControl,
    /// Deploy a single container image as a service
    DeployService {
        #[arg(long)]
        name: String,
        #[arg(long)]
        image: String,
        /// `name:path:port`, repeatable
        #[arg(long = "endpoint")]
        endpoints: Vec<Endpoint>,
    },
    /// Apply impairment to a deployment; with no options set this clears it
    Impair {
        #[arg(long)]
        deployment: String,
        /// e.g. `10mbit`
        #[arg(long)]
        bandwidth: Option<Bandwidth>,
        /// e.g. `100ms`
        #[arg(long)]
        delay: Option<Delay>,
        /// Percent
        #[arg(long)]
        loss: Option<f64>,
        #[arg(long)]
        duplicate: Option<f64>,
        #[arg(long)]
        corrupt: Option<f64>,
    },
    /// Delete everything labelled with this run's group
    TearDown,
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.json_logs);

    let cluster = ClusterConfig::from_env()?;
    let executor = ResourceExecutor::connect(&cluster).await?;
    info!(?args.command, "Starting DSSim controller");

    match args.command {
        Command::NetworkControl => {
            let orchestrator =
                Orchestrator::new(executor).with_network_control(NetworkControlConfig::from_env()?);
            orchestrator.setup().await?;
        }
        Command::DeployService {
            name,
            image,
            endpoints,
        } => {
            let service = Orchestrator::new(executor)
                .deploy_containerized_service(&name, ContainerImage::new(&image), endpoints, None)
                .await?;
            info!(hostname = ?service.base().hostname(), "Service deployed");
        }
        Command::Impair {
            deployment,
            bandwidth,
            delay,
            loss,
            duplicate,
            corrupt,
        } => {
            let conditions = NetworkConditions {
                bandwidth,
                delay,
                loss_rate: loss,
                duplicate_rate: duplicate,
                corruption_rate: corrupt,
            };
            network::set_network_control(&executor, &deployment, &conditions).await?;
        }
        Command::TearDown => {
            let report = Orchestrator::new(executor).tear_down().await;
            for failure in &report.failed {
                tracing::error!(kind = %failure.kind, name = ?failure.name, error = %failure.error, "Not deleted");
            }
            if !report.is_clean() {
                bail!("{} resources could not be deleted", report.failed.len());
            }
            info!(deleted = report.deleted.len(), "Teardown complete");
        }
    }

    Ok(())
}
