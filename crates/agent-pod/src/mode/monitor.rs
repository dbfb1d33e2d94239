//! The agents monitor: periodically scans the registry for orphaned
//! cameras and publishes them for manager pods to claim. Stateless
//! beyond its scan cursor.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use common::model::{ErrorEvent, StatsEvent};

use crate::orphan::OrphanSource;
use crate::pipeline::{emit_error, Services};

use super::{drain_events, persist_error, EVENT_CHANNEL_CAPACITY};

pub async fn run(
    cancel: CancellationToken,
    services: Services,
    orphan: Arc<dyn OrphanSource>,
) -> Result<()> {
    let (error_tx, mut error_rx) = mpsc::channel::<ErrorEvent>(EVENT_CHANNEL_CAPACITY);
    // The monitor emits no stats series; the channel still exists so the
    // shared drain applies.
    let (stats_tx, mut stats_rx) = mpsc::channel::<StatsEvent>(EVENT_CHANNEL_CAPACITY);
    drop(stats_tx);

    let period = services.config.agents_monitor_periodic_timeout;
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("agents monitor cancelled");
                break;
            }
            _ = ticker.tick() => {
                scan_and_publish(&services, &orphan, &error_tx).await;
            }
            Some(event) = error_rx.recv() => persist_error(&services.registry, event).await,
        }
    }

    drain_events(
        &services.registry,
        &mut stats_rx,
        &mut error_rx,
        services.config.mode_max_shutdown_time,
    )
    .await;
    Ok(())
}

async fn scan_and_publish(
    services: &Services,
    orphan: &Arc<dyn OrphanSource>,
    error_tx: &mpsc::Sender<ErrorEvent>,
) {
    let max = services.config.agents_monitor_max_orphaned_cameras;
    let cameras = match services.registry.retrieve_orphaned_cameras(max).await {
        Ok(cameras) => cameras,
        Err(err) => {
            emit_error(
                error_tx,
                ErrorEvent::new(
                    "agents_monitor",
                    &format!("{err:#}"),
                    "error retrieving orphaned cameras",
                ),
            )
            .await;
            return;
        }
    };

    if let Err(err) = orphan.publish(cameras).await {
        emit_error(
            error_tx,
            ErrorEvent::new(
                "agents_monitor",
                &err,
                "error publishing through orphan source",
            ),
        )
        .await;
    }
}
