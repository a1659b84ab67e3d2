use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use stopper::Stopper;

use stand_schedule_controller::azure::AzureClient;
use stand_schedule_controller::clock::SystemClock;
use stand_schedule_controller::config::Config;
use stand_schedule_controller::controller::Controller;
use stand_schedule_controller::{health, kubernetes};

/// Generate future that awaits shutdown signal
async fn shutdown_signal(interrupt: Stopper) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    interrupt.stop();
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env()?;
    let client = kubernetes::client_for_access_type(config.kube_access_type).await?;
    let clock = Arc::new(SystemClock);
    let cloud = Arc::new(AzureClient::new(&config, clock.clone())?);

    // Prepare shutdown signal future
    let interrupt = Stopper::new();
    tokio::spawn(shutdown_signal(interrupt.clone()));

    // Spawn HTTP liveness server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let http_interrupt = interrupt.clone();
    let http_handle = tokio::spawn(
        axum::Server::bind(&addr)
            .serve(health::router().into_make_service())
            .with_graceful_shutdown(async move {
                http_interrupt.stop_future(std::future::pending::<()>()).await;
            }),
    );

    // Spawn controller
    let controller = Controller::new(&config, clock, client, cloud);
    let controller_handle = tokio::spawn(controller.run(interrupt.clone()));

    // Await all spawned futures
    let (http_res, controller_res) = tokio::try_join!(http_handle, controller_handle)?;
    http_res?;
    controller_res?;

    Ok(())
}
