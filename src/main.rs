use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use switchboard::admin::{PKG_NAME, VERSION};
use switchboard::config::Config;
use switchboard::context::ControlPlane;
use switchboard::proxy::FrontDoor;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("switchboard=debug".parse().expect("valid log directive")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("switchboard.toml"));

    let mut config = Config::load_or_default(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;
    config.apply_env(|key| std::env::var(key).ok())?;
    config.validate()?;
    info!(path = %config_path.display(), "Configuration loaded");

    print_startup_banner(&config);

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port).parse()?;
    let plane = ControlPlane::new(config)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Listen before booting so health and logs are reachable during startup
    let front_door = FrontDoor::new(bind_addr, Arc::clone(&plane), shutdown_rx)?;
    let front_door_handle = tokio::spawn(async move {
        if let Err(e) = front_door.run().await {
            error!(error = %e, "Front door error");
        }
    });

    if let Err(e) = plane.boot().await {
        error!(error = %e, "Boot failed, shutting down");
        let _ = shutdown_tx.send(true);
        plane.shutdown().await;
        return Err(e.into());
    }

    wait_for_signal().await;

    let _ = shutdown_tx.send(true);
    info!("Stopping all services...");
    plane.shutdown().await;

    let _ = tokio::time::timeout(Duration::from_secs(5), front_door_handle).await;
    info!("Shutdown complete");
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received SIGINT (Ctrl+C), shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, shutting down...");
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting control plane");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        log_dir = %config.server.log_dir,
        layout = ?config.server.layout,
        external = config.server.external,
        "Server configuration"
    );
    info!(
        services = ?config.enabled_services(),
        routes = config.routes.len(),
        "Services"
    );
    info!(
        base_delay_ms = config.restart.base_delay_ms,
        max_delay_ms = config.restart.max_delay_ms,
        max_failures = config.restart.max_failures,
        stability_window_secs = config.restart.stability_window_secs,
        "Restart policy"
    );
}
