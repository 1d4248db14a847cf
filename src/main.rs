use launchgate::config::Config;
use launchgate::control::{generate_token, ControlServer, PKG_NAME, VERSION};
use launchgate::supervisor::Supervisor;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("launchgate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("launchgate.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(
        name = PKG_NAME,
        version = VERSION,
        path = %config_path.display(),
        "Supervisor starting"
    );

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let supervisor = Supervisor::new(config.supervisor.clone());

    // Relay gateway events into the supervisor log
    let mut status_rx = supervisor.subscribe_status();
    tokio::spawn(async move {
        while status_rx.changed().await.is_ok() {
            let status = *status_rx.borrow();
            info!(?status, "Gateway status changed");
        }
    });
    let mut error_rx = supervisor.subscribe_errors();
    tokio::spawn(async move {
        loop {
            match error_rx.recv().await {
                Ok(line) => error!(line = %line, "Gateway error"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Gateway error stream lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // Generate or use configured control token
    let control_token = config.supervisor.control_token.clone().unwrap_or_else(|| {
        let token = generate_token();
        info!(token = %token, "Generated control API token (configure control_token to set a fixed value)");
        token
    });

    let control_addr: SocketAddr = format!("127.0.0.1:{}", config.supervisor.control_port)
        .parse()
        .map_err(|e| {
            error!(control_port = config.supervisor.control_port, error = %e, "Invalid control bind address");
            anyhow::anyhow!("Invalid control bind address: {}", e)
        })?;

    let control_server = ControlServer::new(
        control_addr,
        supervisor.clone(),
        shutdown_rx.clone(),
        control_token,
    );
    let control_handle = tokio::spawn(async move {
        if let Err(e) = control_server.run().await {
            error!(error = %e, "Control server error");
        }
    });

    // The gateway comes up with the supervisor
    if supervisor.start().await {
        info!("Gateway started");
    } else {
        warn!("Gateway failed to start; use the control API to retry");
    }

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
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

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    info!("Stopping gateway...");
    supervisor.stop();
    // Give the SIGTERM time to reach the child before the runtime drops
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;

    let _ = control_handle.await;

    info!("Supervisor shut down cleanly");
    Ok(())
}
