//! Pod modes and the shared stats/error sink plumbing.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{error, info};

use common::model::{ErrorEvent, StatsEvent};
use common::registry::Registry;

pub mod manager;
pub mod monitor;

/// Stats and error channels are effectively unbuffered: producers park
/// until the mode loop takes the event.
pub const EVENT_CHANNEL_CAPACITY: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Manager,
    Monitor,
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manager" => Ok(Mode::Manager),
            "monitor" => Ok(Mode::Monitor),
            _ => Err(format!("invalid mode '{s}'")),
        }
    }
}

pub(crate) async fn persist_stats(registry: &Arc<dyn Registry>, event: StatsEvent) {
    if let Err(err) = registry.record_stats(event).await {
        error!(error = %format!("{err:#}"), "failed to store stats");
    }
}

pub(crate) async fn persist_error(registry: &Arc<dyn Registry>, event: ErrorEvent) {
    if let Err(err) = registry.record_error(event).await {
        error!(error = %format!("{err:#}"), "failed to store error");
    }
}

/// Post-cancellation drain: keep persisting late stats/error events until
/// the shutdown window closes. Components report on their exit paths, so
/// the window has to stay open after the main loop stops.
pub(crate) async fn drain_events(
    registry: &Arc<dyn Registry>,
    stats_rx: &mut mpsc::Receiver<StatsEvent>,
    error_rx: &mut mpsc::Receiver<ErrorEvent>,
    max_shutdown_time: Duration,
) {
    info!("waiting for in-flight tasks to report before exiting");
    let deadline = tokio::time::Instant::now() + max_shutdown_time;
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {
                info!(period = ?max_shutdown_time, "shutdown waiting period expired, exiting now");
                return;
            }
            Some(event) = stats_rx.recv() => persist_stats(registry, event).await,
            Some(event) = error_rx.recv() => persist_error(registry, event).await,
        }
    }
}
