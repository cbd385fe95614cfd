//! The `relay` binary: run a coordinator or a worker.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::{Result, eyre::Context as _};
use tracing::info;
use tracing_subscriber::util::SubscriberInitExt as _;

use relay::artifact::Store;
use relay::coordinator::{Coordinator, CoordinatorConfig};
use relay::worker::{Worker, WorkerConfig};

#[derive(Clone, Debug, Parser)]
#[command(name = "relay", about = "Distributed execution for foreman")]
struct TopLevelFlags {
    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Debug, Subcommand)]
enum Command {
    /// Run the coordinator: accept workers, dispatch actions, store
    /// artifacts
    Coordinator {
        /// Address to listen on
        #[arg(long, default_value = "127.0.0.1:9940", env = "RELAY_BIND")]
        bind: String,

        /// Artifact store directory
        #[arg(long, default_value = ".foreman/artifacts", env = "RELAY_ARTIFACTS")]
        artifacts: PathBuf,

        /// Seconds without a heartbeat before a worker is dead
        #[arg(long, default_value_t = 15)]
        liveness_grace_secs: u64,
    },

    /// Run a worker: execute sandboxed actions for a coordinator
    Worker {
        /// Coordinator address
        #[arg(long, default_value = "127.0.0.1:9940", env = "RELAY_COORDINATOR")]
        coordinator: String,

        /// Address for the steal listener (port 0 picks one)
        #[arg(long, default_value = "127.0.0.1:0")]
        listen: String,

        /// Capabilities to advertise (repeatable)
        #[arg(long = "capability")]
        capabilities: Vec<String>,

        /// Maximum concurrently executing actions
        #[arg(short, long)]
        jobs: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_env_var("RELAY_LOG")
                .try_from_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("relay=info")),
        )
        .finish()
        .init();

    match TopLevelFlags::parse().command {
        Command::Coordinator {
            bind,
            artifacts,
            liveness_grace_secs,
        } => {
            let store = Arc::new(Store::new(artifacts));
            let config = CoordinatorConfig {
                liveness_grace: Duration::from_secs(liveness_grace_secs),
                ..CoordinatorConfig::default()
            };
            let coordinator = Coordinator::new(config, store);

            // Without an attached scheduler, results are just logged.
            let results = coordinator.results();
            tokio::spawn(async move {
                while let Ok(result) = results.recv_async().await {
                    info!(action = %result.id, status = %result.status, "action completed");
                }
            });

            let listener = tokio::net::TcpListener::bind(&bind)
                .await
                .with_context(|| format!("bind {bind}"))?;
            coordinator.serve(listener).await
        }
        Command::Worker {
            coordinator,
            listen,
            capabilities,
            jobs,
        } => {
            let mut config = WorkerConfig {
                coordinator_addr: coordinator,
                listen_addr: listen,
                ..WorkerConfig::default()
            };
            if !capabilities.is_empty() {
                config.capabilities = capabilities.into_iter().collect::<BTreeSet<_>>();
            }
            if let Some(jobs) = jobs {
                config.max_concurrent = jobs.max(1);
                config.queue_capacity = config.max_concurrent * 4;
            }
            Worker::new(config).run().await
        }
    }
}
