//! Gateway binary, spawned and supervised by `launchgate`.
//!
//! Reads the resources root and packaged flag from the environment, binds the
//! listeners and serves until terminated. The readiness line on stdout is the
//! contract the supervisor scrapes for; fatal errors go to stderr.

use launchgate::config::GatewayConfig;
use launchgate::server::GatewayServer;
use tokio::sync::watch;
use tracing::info;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("launchgate=debug".parse().expect("valid log directive")),
        )
        // stderr is reserved for the supervisor's error stream; the readiness
        // scanner tolerates log lines interleaved on stdout
        .init();

    if let Err(e) = run().await {
        eprintln!("[gateway] fatal: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let config = GatewayConfig::from_env();
    info!(
        resources = %config.resources_root.display(),
        packaged = config.packaged,
        http_port = config.http_port,
        https_port = config.https_port,
        "Gateway starting"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Terminate cleanly on SIGINT/SIGTERM
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm =
                signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), shutting down...");
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                }
            }
        }

        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c()
                .await
                .expect("Failed to listen for Ctrl+C");
            info!("Received Ctrl+C, shutting down...");
        }

        let _ = shutdown_tx.send(true);
    });

    let bound = GatewayServer::new(config, shutdown_rx).bind().await?;
    bound.serve().await?;

    info!("Gateway shut down cleanly");
    Ok(())
}
