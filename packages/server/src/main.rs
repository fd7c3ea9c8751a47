//! Notes server: the database, jobs, scheduler and realtime services on one bus.

use actors::{RealtimeService, RuntimeConfig};
use bus_core::ServiceEvent;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

mod database;
mod driver;
mod init;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let config = RuntimeConfig::from_env()?;
    tracing::info!("Starting notes server with {:?}", config);

    let (ingress, frames) = RealtimeService::channel();
    let bus = init::build_bus(config, frames)?;
    let event_log = tokio::spawn(log_events(bus.subscribe()));

    if let Err(e) = bus.start_all().await {
        tracing::error!("Startup failed: {}", e);
        bus.stop_all().await;
        return Err(e.into());
    }
    tracing::info!("Notes server ready, reading frames from stdin");

    let driver = tokio::spawn(driver::run_stdin(ingress));
    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("Interrupted, shutting down"),
        result = driver => match result {
            Ok(Ok(())) => tracing::info!("Input closed, shutting down"),
            Ok(Err(e)) => tracing::error!("Reading stdin failed: {}", e),
            Err(e) => tracing::error!("Stdin driver panicked: {}", e),
        },
    }

    bus.stop_all().await;
    for status in bus.health() {
        tracing::debug!("{} is {}", status.name, status.state);
    }
    event_log.abort();
    Ok(())
}

async fn log_events(mut events: broadcast::Receiver<ServiceEvent>) {
    loop {
        match events.recv().await {
            Ok(event @ ServiceEvent::ServiceFailed { .. }) => {
                tracing::error!("{}", event.description());
            }
            Ok(event) => tracing::debug!("{}", event.description()),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!("Event log skipped {} events", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
