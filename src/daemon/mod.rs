//! Daemon module for the guard engine.
//!
//! This module contains the core daemon functionality:
//! - `engine`: countdown engine with persistence and commit-on-expiry
//! - `ipc`: Unix socket server dispatching requests to the engine
//!
//! [`run`] ties them together in a single-threaded loop that expires
//! countdowns once a second and serves one request at a time. Subscribed
//! clients get every bus message the engine publishes.

pub mod engine;
pub mod ipc;

pub use engine::{CountdownEngine, LocalEngine, TimerInfo};
pub use ipc::{IpcServer, RequestHandler};

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::time::{interval, MissedTickBehavior};

use crate::bus::EventBus;
use crate::clock::{Clock, SystemClock};
use crate::config::GuardConfig;
use crate::progress::TICK_INTERVAL;

/// Runs the daemon until Ctrl-C.
///
/// # Errors
///
/// Returns an error if the data directory cannot be opened or the socket
/// cannot be bound.
pub async fn run(config: &GuardConfig, socket_path: &Path) -> Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let data_dir = config.resolved_data_dir();

    let (engine, startup_events) =
        CountdownEngine::open(&data_dir, config.default_delay_timeout_ms, clock)
            .with_context(|| format!("Failed to open data directory: {:?}", data_dir))?;
    tracing::info!(
        data_dir = %data_dir.display(),
        committed = startup_events.len(),
        "engine opened"
    );

    let bus = EventBus::new();
    let mut events = bus.subscribe();
    let local = Arc::new(LocalEngine::new(engine, bus.clone()));
    for event in startup_events {
        bus.publish(event);
    }

    let server = IpcServer::new(socket_path)?;
    let handler = RequestHandler::new(local.clone()).with_events(bus.clone());

    let mut ticker = interval(TICK_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                local.tick().await;
            }
            accepted = server.accept() => match accepted {
                Ok(stream) => {
                    if let Err(e) = handler.serve(stream).await {
                        tracing::warn!(error = %e, "failed to answer request");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "accept failed"),
            },
            Some(event) = events.recv() => {
                tracing::info!(event = event.name(), "event");
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down");
                break;
            }
        }
    }

    let pending = local.active_keys().await;
    if !pending.is_empty() {
        tracing::info!(count = pending.len(), "countdowns persisted for next start");
    }
    Ok(())
}
