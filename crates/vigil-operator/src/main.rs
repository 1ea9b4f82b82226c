//! Vigil Operator - deploys and keeps monitoring gateways up to date

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::StatefulSet;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt};

use vigil_capability::{HttpRegistryClient, KubeClusterClient};
use vigil_common::crd::MonitoringAgent;
use vigil_operator::controller::{error_policy, reconcile, Context, ControllerConfig};
use vigil_operator::telemetry::{init_telemetry, LogFormat};

/// Watcher timeout (seconds), kept below the client read timeout
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Vigil - operator for monitoring gateway capabilities
#[derive(Parser, Debug)]
#[command(name = "vigil-operator", version, about, long_about = None)]
struct Cli {
    /// Print the MonitoringAgent CRD as YAML and exit
    #[arg(long)]
    crd: bool,

    /// Resolve new gateway images from the registry and roll them out
    #[arg(long, env = "VIGIL_ENABLE_UPDATES")]
    enable_updates: bool,

    /// Seconds between successful reconciles of an agent
    #[arg(long, env = "VIGIL_REQUEUE_SECS", default_value_t = 1800)]
    requeue_secs: u64,

    /// Log output format
    #[arg(long, env = "VIGIL_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

impl Cli {
    fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            enable_updates: self.enable_updates,
            requeue_interval: Duration::from_secs(self.requeue_secs),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&MonitoringAgent::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    init_telemetry(cli.log_format)?;
    run_controller(cli.controller_config()).await
}

async fn run_controller(config: ControllerConfig) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    tracing::info!(
        enable_updates = config.enable_updates,
        requeue_secs = config.requeue_interval.as_secs(),
        "Starting MonitoringAgent controller"
    );

    let ctx = Arc::new(Context::new(
        Arc::new(KubeClusterClient::new(client.clone())),
        Arc::new(HttpRegistryClient::new()?),
        config,
    ));

    let agents: Api<MonitoringAgent> = Api::all(client.clone());
    let statefulsets: Api<StatefulSet> = Api::all(client);

    Controller::new(agents, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
        .owns(
            statefulsets,
            WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
        )
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| {
            match result {
                Ok((agent, action)) => {
                    tracing::debug!(agent = %agent.name, ?action, "reconciliation completed")
                }
                Err(e) => tracing::error!(error = ?e, "reconciliation error"),
            }
            std::future::ready(())
        })
        .await;

    tracing::info!("Controller stopped");
    Ok(())
}
