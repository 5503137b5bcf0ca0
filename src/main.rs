//! Hypnos - scale-to-zero for Kubernetes HTTP/TLS workloads

use clap::{Parser, Subcommand};
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use hypnos::activator::{Activator, ActivatorConfig};
use hypnos::endpoints::{EndpointsController, EndpointsControllerConfig};
use hypnos::zeroscaler::{Zeroscaler, ZeroscalerConfig};
use hypnos::{
    DEFAULT_ACTIVATOR_HEALTHZ_PORT, DEFAULT_ACTIVATOR_PORT, DEFAULT_CONTROLLER_HEALTHZ_PORT,
    DEFAULT_METRICS_CHECK_INTERVAL, SHUTDOWN_GRACE,
};

/// Hypnos - scale-to-zero for Kubernetes workloads
#[derive(Parser, Debug)]
#[command(name = "hypnos", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the activator: the dynamic proxy that wakes idle workloads
    Activator(ActivatorArgs),

    /// Run the endpoints controller for opted-in services
    EndpointsController(EndpointsControllerArgs),

    /// Run the zeroscaler: scales idle workloads down to zero
    Zeroscaler(ZeroscalerArgs),
}

/// Activator arguments
#[derive(Parser, Debug)]
struct ActivatorArgs {
    /// Port the dynamic proxy listens on
    #[arg(long, env = "HYPNOS_ACTIVATOR_PORT", default_value_t = DEFAULT_ACTIVATOR_PORT)]
    port: u16,

    /// Port the health endpoint listens on
    #[arg(long, env = "HYPNOS_HEALTHZ_PORT", default_value_t = DEFAULT_ACTIVATOR_HEALTHZ_PORT)]
    healthz_port: u16,
}

/// Endpoints controller arguments
#[derive(Parser, Debug)]
struct EndpointsControllerArgs {
    /// Namespace the activator pods run in
    #[arg(long, env = "HYPNOS_NAMESPACE")]
    namespace: String,

    /// Label key identifying activator pods
    #[arg(long, env = "HYPNOS_ACTIVATOR_POD_LABEL_SELECTOR_KEY")]
    activator_pod_label_selector_key: String,

    /// Label value identifying activator pods
    #[arg(long, env = "HYPNOS_ACTIVATOR_POD_LABEL_SELECTOR_VALUE")]
    activator_pod_label_selector_value: String,

    /// Port fallback endpoints route wake-up traffic to (the activator's
    /// proxy port)
    #[arg(long, env = "HYPNOS_ACTIVATOR_PORT", default_value_t = DEFAULT_ACTIVATOR_PORT)]
    activator_port: u16,

    /// Port the health endpoint listens on
    #[arg(long, env = "HYPNOS_HEALTHZ_PORT", default_value_t = DEFAULT_CONTROLLER_HEALTHZ_PORT)]
    healthz_port: u16,
}

/// Zeroscaler arguments
#[derive(Parser, Debug)]
struct ZeroscalerArgs {
    /// Default seconds between idleness checks, for workloads without their
    /// own interval annotation
    #[arg(long, env = "HYPNOS_METRICS_CHECK_INTERVAL", default_value_t = DEFAULT_METRICS_CHECK_INTERVAL)]
    metrics_check_interval: u64,

    /// Port the health endpoint listens on
    #[arg(long, env = "HYPNOS_HEALTHZ_PORT", default_value_t = DEFAULT_CONTROLLER_HEALTHZ_PORT)]
    healthz_port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install crypto provider (ClientHello parsing relies on rustls)
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .expect("Failed to install crypto provider");

    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    // Cancelled on SIGINT or SIGTERM; every long-lived task observes it.
    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            tracing::info!("Shutdown signal received");
            shutdown.cancel();
        }
    });

    match cli.command {
        Commands::Activator(args) => {
            tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting Hypnos activator");
            let config = ActivatorConfig {
                proxy_port: args.port,
                healthz_port: args.healthz_port,
            };
            Activator::new(client).run(config, shutdown).await?;
        }
        Commands::EndpointsController(args) => {
            tracing::info!(
                version = env!("CARGO_PKG_VERSION"),
                "Starting Hypnos endpoints controller"
            );
            let config = EndpointsControllerConfig {
                namespace: args.namespace,
                activator_pod_label_key: args.activator_pod_label_selector_key,
                activator_pod_label_value: args.activator_pod_label_selector_value,
                activator_port: args.activator_port,
                healthz_port: args.healthz_port,
            };
            EndpointsController::new(client, config).run(shutdown).await?;
        }
        Commands::Zeroscaler(args) => {
            tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting Hypnos zeroscaler");
            let config = ZeroscalerConfig {
                metrics_check_interval: args.metrics_check_interval,
                healthz_port: args.healthz_port,
            };
            Zeroscaler::new(client, config).run(shutdown).await?;
        }
    }

    // A short grace period for in-flight work spawned by the components.
    tracing::info!(grace = ?SHUTDOWN_GRACE, "Allowing graceful shutdown to complete");
    tokio::time::sleep(SHUTDOWN_GRACE).await;
    Ok(())
}

/// Resolve when SIGINT or SIGTERM arrives.
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
