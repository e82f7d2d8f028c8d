//! Micro Operator - reconciles Micro workloads into managed Deployments

use std::sync::Arc;

use clap::Parser;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use micro_operator::controller::{error_policy, reconcile, Context};
use micro_operator::crd::Micro;
use micro_operator::FIELD_MANAGER;

/// Watcher timeout (seconds) - must be less than the client read timeout.
/// This forces the API server to close the watch before the client times
/// out, preventing "body read timed out" errors on idle watches.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Micro - CRD-driven Kubernetes operator for replicated micro workloads
#[derive(Parser, Debug)]
#[command(name = "micro-operator", version, about, long_about = None)]
struct Cli {
    /// Generate the Micro CRD manifest and exit
    #[arg(long)]
    crd: bool,

    /// Skip installing the Micro CRD on startup
    #[arg(long)]
    no_install_crd: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&Micro::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    run_controller(cli.no_install_crd).await
}

/// Ensure the Micro CRD is installed
///
/// The operator installs its own CRD on startup using server-side apply,
/// so the CRD version always matches the operator version.
async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    tracing::info!("Installing Micro CRD...");
    crds.patch("micros.micro.dev", &params, &Patch::Apply(&Micro::crd()))
        .await
        .map_err(|e| anyhow::anyhow!("Failed to install Micro CRD: {}", e))?;

    Ok(())
}

/// Run the Micro controller until shutdown
async fn run_controller(no_install_crd: bool) -> anyhow::Result<()> {
    let client = Client::try_default().await?;

    if !no_install_crd {
        ensure_crd_installed(&client).await?;
    }

    let ctx = Arc::new(Context::builder(client.clone()).build());

    let micros: Api<Micro> = Api::all(client.clone());
    let deployments: Api<Deployment> = Api::all(client);

    tracing::info!("Starting controllers:");
    tracing::info!("- Micro controller");

    // Watch the primary Micro resources plus the Deployments they own, so a
    // Deployment mutated or deleted out-of-band re-queues its owner
    Controller::new(
        micros,
        WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
    )
    .owns(
        deployments,
        WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
    )
    .shutdown_on_signal()
    .run(reconcile, error_policy, ctx)
    .for_each(|result| {
        match result {
            Ok(action) => tracing::debug!(?action, "Micro reconciliation completed"),
            Err(e) => tracing::error!(error = ?e, "Micro reconciliation error"),
        }
        std::future::ready(())
    })
    .await;

    tracing::info!("controller shut down");
    Ok(())
}
