//! istio-operator - Istio multi-cluster trust bootstrap for k0rdent

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use kube::CustomResourceExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use istio_operator::client::create_client;
use istio_operator::config::{
    MeshConfig, DEFAULT_ISTIO_NAMESPACE, DEFAULT_KCM_NAMESPACE, DEFAULT_RELEASE_NAME,
};
use istio_operator::controller::Context;
use istio_operator::crd::{Certificate, ClusterDeployment, Credential, MultiClusterService, Region};
use istio_operator::rotation::RotationScheduler;
use istio_operator::trigger::{self, KubeTrigger};

/// istio-operator - bootstraps Istio multi-cluster trust for k0rdent member clusters
#[derive(Parser, Debug)]
#[command(name = "istio-operator", version, about, long_about = None)]
struct Cli {
    /// Print the manifests of the resources the operator models and exit
    #[arg(long)]
    crd: bool,

    /// Kubeconfig of the management cluster; in-cluster or default config when unset
    #[arg(long, global = true)]
    kubeconfig: Option<PathBuf>,

    #[command(flatten)]
    mesh: MeshArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as controller (default mode)
    ///
    /// Watches member ClusterDeployments, maintains their remote secrets, CA
    /// certificates and propagation descriptors, and rotates remote secrets
    /// until SIGINT or SIGTERM.
    Controller,
}

/// Settings shared by reconciliation and rotation
#[derive(Args, Debug)]
struct MeshArgs {
    /// Namespace of istiod, remote secrets and CA certificates
    #[arg(long, env = "ISTIO_NAMESPACE", default_value = DEFAULT_ISTIO_NAMESPACE, global = true)]
    istio_namespace: String,

    /// Istio helm release name
    #[arg(long, env = "ISTIO_RELEASE_NAME", default_value = DEFAULT_RELEASE_NAME, global = true)]
    release_name: String,

    /// Namespace KCM runs in
    #[arg(long, env = "KCM_NAMESPACE", default_value = DEFAULT_KCM_NAMESPACE, global = true)]
    kcm_namespace: String,

    /// Seconds between remote secret rotation cycles
    #[arg(
        long,
        default_value = "3600",
        value_parser = clap::value_parser!(u64).range(1..),
        global = true
    )]
    rotation_interval_secs: u64,
}

impl From<MeshArgs> for MeshConfig {
    fn from(args: MeshArgs) -> Self {
        Self {
            istio_namespace: args.istio_namespace,
            release_name: args.release_name,
            kcm_namespace: args.kcm_namespace,
            rotation_interval: Duration::from_secs(args.rotation_interval_secs),
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    if cli.crd {
        for crd in [
            ClusterDeployment::crd(),
            Credential::crd(),
            Region::crd(),
            MultiClusterService::crd(),
            Certificate::crd(),
        ] {
            let yaml = serde_yaml::to_string(&crd)
                .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
            println!("---\n{yaml}");
        }
        return Ok(());
    }

    match cli.command {
        Some(Commands::Controller) | None => {
            run_controller(cli.kubeconfig.as_deref(), cli.mesh.into()).await
        }
    }
}

/// Run the trigger loop and the rotation task until shutdown
async fn run_controller(kubeconfig: Option<&Path>, config: MeshConfig) -> anyhow::Result<()> {
    tracing::info!(
        istio_namespace = %config.istio_namespace,
        release = %config.release_name,
        kcm_namespace = %config.kcm_namespace,
        rotation_interval = ?config.rotation_interval,
        "Starting istio-operator"
    );

    let client = create_client(kubeconfig)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    let config = Arc::new(config);
    let cancel = CancellationToken::new();
    let ctx = Arc::new(
        Context::builder(client.clone())
            .config(config.as_ref().clone())
            .shutdown(cancel.clone())
            .build(),
    );

    let rotation = {
        let scheduler = RotationScheduler::new(ctx.clone());
        let cancel = cancel.clone();
        tokio::spawn(async move { scheduler.run(cancel).await })
    };

    let watch = {
        let trigger = KubeTrigger::new(client, config);
        let cancel = cancel.clone();
        tokio::spawn(async move { trigger::run(&trigger, ctx, cancel).await })
    };

    shutdown_signal().await?;
    tracing::info!("Shutdown signal received, stopping");
    cancel.cancel();

    if let Err(e) = watch.await {
        tracing::error!(error = %e, "Watch task panicked");
    }
    if let Err(e) = rotation.await {
        tracing::error!(error = %e, "Rotation task panicked");
    }
    tracing::info!("istio-operator stopped");
    Ok(())
}

/// Resolve on SIGINT or SIGTERM
async fn shutdown_signal() -> anyhow::Result<()> {
    let mut terminate = signal(SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("Failed to install SIGTERM handler: {}", e))?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.map_err(|e| anyhow::anyhow!("Failed to listen for SIGINT: {}", e))?;
        }
        _ = terminate.recv() => {}
    }
    Ok(())
}
