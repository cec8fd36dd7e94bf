//! virt-autopilot - automated platform configuration for KubeVirt workloads

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::Notify;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use virt_autopilot::controller::{watch, Context};
use virt_autopilot::engine::applier::{KubeResourceClient, ResourceClient};
use virt_autopilot::engine::crd_presence::CrdPresence;
use virt_autopilot::events::KubeEventSink;
use virt_autopilot::render::command::{self as render_command, RenderArgs};
use virt_autopilot::{HCO_CRD_NAME, OPERATOR_NAME};

/// Automated platform configuration for KubeVirt virtualization workloads.
///
/// Watches the HyperConverged resource and drives platform-level objects
/// toward an opinionated baseline, honoring user overrides expressed as
/// annotations.
#[derive(Parser, Debug)]
#[command(name = "virt-autopilot", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller (default mode)
    Run(RunArgs),

    /// Print the manifests the controller would apply
    Render(RenderArgs),
}

/// Controller mode arguments
#[derive(Parser, Debug)]
struct RunArgs {
    /// The namespace where the HyperConverged CR is located
    #[arg(long, env = "AUTOPILOT_NAMESPACE", default_value = virt_autopilot::DEFAULT_NAMESPACE)]
    namespace: String,

    /// Timeout in seconds for validating that required CRDs exist at startup
    #[arg(long, default_value = "10")]
    crd_validation_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => run_controller(args).await,
        Commands::Render(args) => {
            render_command::run(args).await?;
            Ok(())
        }
    }
}

/// Start the controller: validate startup invariants, compute the watch
/// set, and run the reconcile loop until a signal or a CRD-discovery
/// restart.
async fn run_controller(args: RunArgs) -> anyhow::Result<()> {
    tracing::info!(namespace = %args.namespace, "virt-autopilot starting");

    let client = kube::Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create Kubernetes client: {}", e))?;
    let resources: Arc<dyn ResourceClient> = Arc::new(KubeResourceClient::new(client.clone()));

    // The HCO CRD is installed by OLM; without it there is nothing to watch.
    let timeout = Duration::from_secs(args.crd_validation_timeout_secs);
    let hco_crd = tokio::time::timeout(timeout, resources.get_crd(HCO_CRD_NAME))
        .await
        .map_err(|_| anyhow::anyhow!("timed out validating the HyperConverged CRD"))??;
    if hco_crd.is_none() {
        anyhow::bail!("HyperConverged CRD not found; it must be installed before running");
    }
    tracing::info!("HyperConverged CRD validation passed");

    // Compute the startup watch set from the catalog.
    let loader = virt_autopilot::assets::Loader::new();
    let catalog = virt_autopilot::assets::Catalog::load(&loader)?;
    let kinds = watch::catalog_kinds(&catalog, &loader)?;
    let crds = CrdPresence::new(resources.clone());
    let (watch_kinds, watched_names) = watch::partition_watchable(&kinds, &crds).await?;

    // Shutdown fires on a signal or when the reconciler discovers a new
    // managed CRD; the orchestrator restarts us with the grown watch set.
    let restart = Arc::new(Notify::new());
    let restart_trigger = restart.clone();
    let shutdown = async move {
        tokio::select! {
            _ = restart.notified() => {
                tracing::info!("restart requested; shutting down to rebuild the watch set");
            }
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::error!(error = %e, "failed to listen for shutdown signal");
                }
                tracing::info!("signal received; shutting down");
            }
        }
    };

    let events = Arc::new(KubeEventSink::new(client.clone(), OPERATOR_NAME));
    let ctx = Arc::new(Context::new(
        resources,
        events,
        &args.namespace,
        watched_names,
        Arc::new(move || restart_trigger.notify_one()),
    )?);

    watch::run(client, ctx, watch_kinds, shutdown).await?;

    tracing::info!("virt-autopilot stopped");
    Ok(())
}
