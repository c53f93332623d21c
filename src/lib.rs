pub mod alerts;
pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod events;
pub mod feed;
pub mod health;
pub mod probe;
pub mod retry;
pub mod scheduler;
pub mod stream;
pub mod supervisor;
pub mod types;
pub mod watcher;

use std::path::Path;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::error::SupervisorError;
use crate::supervisor::{Supervisor, SupervisorEvent};
use crate::watcher::WatchEvent;

/// Initialize structured logging with tracing.
/// Respects RUST_LOG env var; defaults to `info` level for the fleetwatch crate.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("fleetwatch=info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}

fn build_supervisor(path: &Path) -> Result<Supervisor, SupervisorError> {
    let config = config::load_config(path)?;
    Supervisor::new(config)
}

fn log_event(event: &SupervisorEvent) {
    match serde_json::to_string(event) {
        Ok(json) => debug!(topic = event.topic(), payload = %json, "Supervisor event"),
        Err(e) => warn!(topic = event.topic(), error = %e, "Failed to serialize event"),
    }
}

/// Load config, start supervising, rebuild on config changes and shut
/// down cleanly on Ctrl-C.
pub async fn run() -> Result<(), SupervisorError> {
    init_tracing();
    dotenvy::dotenv().ok();

    let path = config::config_path()?;
    info!(path = %path.display(), "Loading configuration");
    let mut supervisor = build_supervisor(&path)?;

    let (tx, mut changes) = mpsc::unbounded_channel();
    // Missing config directory just means no hot reload.
    let _watcher = match watcher::watch_config(tx, path.clone()) {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            warn!(error = %e, "Config hot reload disabled");
            None
        }
    };

    supervisor.start();
    let mut events = supervisor.subscribe();

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.map_err(SupervisorError::Signal)?;
                info!("Shutdown requested");
                break;
            }
            Some(change) = changes.recv() => match change {
                WatchEvent::ConfigChanged => match build_supervisor(&path) {
                    Ok(next) if next.config() == supervisor.config() => {
                        debug!("Config touched but unchanged");
                    }
                    Ok(next) => {
                        supervisor.stop();
                        supervisor = next;
                        supervisor.start();
                        events = supervisor.subscribe();
                        info!("Configuration reloaded");
                    }
                    Err(e) => warn!(error = %e, "Ignoring invalid config change"),
                },
                WatchEvent::ConfigRemoved => {
                    warn!("Config file removed, keeping current configuration");
                }
            },
            received = events.recv() => match received {
                Ok(event) => log_event(&event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event log fell behind");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    events = supervisor.subscribe();
                }
            },
        }
    }

    supervisor.stop();
    Ok(())
}
