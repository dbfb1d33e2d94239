//! The per-camera agent: claims the camera, wires streamers and the
//! framer together, and keeps the heartbeat fresh so the camera stops
//! looking orphaned.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use common::model::{AgentStats, Camera, ErrorEvent, StatsEvent};
use uuid::Uuid;

use super::framer::spawn_framer;
use super::streamer::{Streamer, StreamerContext};
use super::{Alert, Services};

/// Claims the camera and brings its pipeline up. The registry claim is
/// awaited here so a camera that cannot be claimed never looks running to
/// the manager. Once this returns Ok, the heartbeat loop runs until the
/// agent's token is cancelled.
pub async fn start(
    cancel: CancellationToken,
    services: Services,
    streamers: &[Arc<dyn Streamer>],
    error_tx: mpsc::Sender<ErrorEvent>,
    stats_tx: mpsc::Sender<StatsEvent>,
    alert_tx: mpsc::Sender<Alert>,
    camera: Camera,
) -> Result<()> {
    let agent_id = Uuid::new_v4().to_string();
    info!(
        agent_id = %agent_id,
        camera = %camera.name,
        framer_type = %camera.framer_type,
        rtsp = %camera.rtsp_url,
        streamers = streamers.len(),
        "agent starting"
    );

    services
        .registry
        .update_camera_agent_id(&camera.id, &agent_id)
        .await
        .context("error updating camera agent id")?;

    let mut channels = Vec::with_capacity(streamers.len());
    for streamer in streamers {
        let ctx = StreamerContext {
            cancel: cancel.child_token(),
            services: services.clone(),
            camera: camera.clone(),
            error_tx: error_tx.clone(),
            stats_tx: stats_tx.clone(),
            alert_tx: alert_tx.clone(),
        };
        channels.push(streamer.spawn(ctx));
    }

    spawn_framer(
        cancel.child_token(),
        services.clone(),
        camera.clone(),
        error_tx,
        stats_tx.clone(),
        channels,
    );

    tokio::spawn(run_heartbeat(cancel, services, camera, agent_id, stats_tx));
    Ok(())
}

async fn run_heartbeat(
    cancel: CancellationToken,
    services: Services,
    camera: Camera,
    agent_id: String,
    stats_tx: mpsc::Sender<StatsEvent>,
) {
    let begin = tokio::time::Instant::now();
    let period = services.config.agent_periodic_timeout;
    let mut ticker = tokio::time::interval_at(begin + period, period);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!(agent_id = %agent_id, camera = %camera.name, "agent cancelled");
                return;
            }
            _ = ticker.tick() => {}
        }

        if let Err(err) = services.registry.update_camera_heartbeat(&camera.id).await {
            error!(
                camera = %camera.name,
                error = %format!("{err:#}"),
                "error updating camera agent heartbeat"
            );
        }

        let stats = StatsEvent::Agent(AgentStats {
            id: agent_id.clone(),
            camera: camera.name.clone(),
            uptime: begin.elapsed().as_secs() as i64,
            timestamp: Utc::now().timestamp(),
        });
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = stats_tx.send(stats) => {}
        }
    }
}
