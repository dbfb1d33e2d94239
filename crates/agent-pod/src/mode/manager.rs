//! The agents manager: accepts orphaned cameras up to the pod cap, runs
//! one agent per camera, and reconciles against the exclusion list.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use rand::rngs::StdRng;
use rand::seq::IteratorRandom;
use rand::SeedableRng;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use common::model::{AgentsManagerStats, Camera, ErrorEvent, StatsEvent};

use crate::orphan::{OrphanError, OrphanSource};
use crate::pipeline::streamer::Streamer;
use crate::pipeline::{agent, alerter, Services};

use super::{drain_events, persist_error, persist_stats, EVENT_CHANNEL_CAPACITY};

struct AgentRecord {
    camera: Camera,
    cancel: CancellationToken,
}

pub async fn run(
    cancel: CancellationToken,
    services: Services,
    orphan: Arc<dyn OrphanSource>,
    streamers: Vec<Arc<dyn Streamer>>,
) -> Result<()> {
    let mut orphan_rx = Some(orphan.subscribe().await?);

    let (error_tx, mut error_rx) = mpsc::channel::<ErrorEvent>(EVENT_CHANNEL_CAPACITY);
    let (stats_tx, mut stats_rx) = mpsc::channel::<StatsEvent>(EVENT_CHANNEL_CAPACITY);
    let alert_tx = alerter::spawn(
        cancel.child_token(),
        services.clone(),
        error_tx.clone(),
        stats_tx.clone(),
    );

    let begin = tokio::time::Instant::now();
    let period = services.config.agents_manager_periodic_timeout;
    let mut ticker = tokio::time::interval_at(begin + period, period);
    let mut running: HashMap<String, AgentRecord> = HashMap::new();
    let mut stats = AgentsManagerStats::default();
    // One generator for the manager's lifetime; eviction stays uniform.
    let mut rng = StdRng::from_entropy();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("agents manager cancelled");
                break;
            }
            batch = next_batch(&mut orphan_rx) => match batch {
                Some(cameras) => {
                    stats.orphaned_requests += 1;
                    accept_batch(
                        &cancel,
                        &services,
                        &orphan,
                        &streamers,
                        &error_tx,
                        &stats_tx,
                        &alert_tx,
                        &mut running,
                        &mut stats,
                        &mut orphan_rx,
                        cameras,
                    )
                    .await;
                }
                None => {
                    // Delivery ended (unsubscribed or source shut down).
                    orphan_rx = None;
                }
            },
            _ = ticker.tick() => {
                reconcile(
                    &services,
                    &orphan,
                    &mut running,
                    &mut stats,
                    &mut orphan_rx,
                    &mut rng,
                    begin,
                )
                .await;
            }
            Some(event) = stats_rx.recv() => persist_stats(&services.registry, event).await,
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

/// Pending-forever once the subscription is gone, so the select just
/// ignores this arm until reconcile re-subscribes.
async fn next_batch(rx: &mut Option<mpsc::Receiver<Vec<Camera>>>) -> Option<Vec<Camera>> {
    match rx.as_mut() {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[allow(clippy::too_many_arguments)]
async fn accept_batch(
    cancel: &CancellationToken,
    services: &Services,
    orphan: &Arc<dyn OrphanSource>,
    streamers: &[Arc<dyn Streamer>],
    error_tx: &mpsc::Sender<ErrorEvent>,
    stats_tx: &mpsc::Sender<StatsEvent>,
    alert_tx: &mpsc::Sender<crate::pipeline::Alert>,
    running: &mut HashMap<String, AgentRecord>,
    stats: &mut AgentsManagerStats,
    orphan_rx: &mut Option<mpsc::Receiver<Vec<Camera>>>,
    cameras: Vec<Camera>,
) {
    let max_agents = services.config.max_agents_per_pod;
    let mut unaccommodated: Vec<String> = Vec::new();

    for camera in cameras {
        if running.len() >= max_agents {
            unaccommodated.push(camera.name.clone());
            continue;
        }
        if running.contains_key(&camera.id) {
            // Already ours; announcements carry no duplicate suppression.
            continue;
        }

        let agent_cancel = cancel.child_token();
        match agent::start(
            agent_cancel.clone(),
            services.clone(),
            streamers,
            error_tx.clone(),
            stats_tx.clone(),
            alert_tx.clone(),
            camera.clone(),
        )
        .await
        {
            Ok(()) => {
                running.insert(
                    camera.id.clone(),
                    AgentRecord {
                        camera,
                        cancel: agent_cancel,
                    },
                );
            }
            Err(err) => {
                agent_cancel.cancel();
                persist_error(
                    &services.registry,
                    ErrorEvent::new(
                        "agents_manager",
                        &format!("{err:#}"),
                        format!("error starting agent for camera: {}", camera.name),
                    ),
                )
                .await;
            }
        }
    }

    if !unaccommodated.is_empty() {
        stats.unaccommodated_cameras += unaccommodated.len() as i64;
        debug!(
            running = running.len(),
            max_agents_per_pod = max_agents,
            cameras = ?unaccommodated,
            "agents pod could not accommodate these cameras"
        );
    }

    if running.len() >= max_agents && orphan_rx.is_some() {
        // Full house: stop consuming announcements so peer pods get them.
        stats.orphaned_request_unsubscriptions += 1;
        match orphan.unsubscribe().await {
            Ok(()) => {
                *orphan_rx = None;
            }
            Err(err) => {
                error!(error = %err, "error unsubscribing from orphan source");
            }
        }
    }
}

async fn reconcile(
    services: &Services,
    orphan: &Arc<dyn OrphanSource>,
    running: &mut HashMap<String, AgentRecord>,
    stats: &mut AgentsManagerStats,
    orphan_rx: &mut Option<mpsc::Receiver<Vec<Camera>>>,
    rng: &mut StdRng,
    begin: tokio::time::Instant,
) {
    let ids: Vec<String> = running.keys().cloned().collect();
    match services.registry.retrieve_cameras_by_ids(&ids).await {
        Ok(cameras) => {
            for camera in cameras.iter().filter(|c| c.excluded) {
                debug!(camera_id = %camera.id, "camera is in exclusion list");
                evict_random_agent(running, rng);
            }
        }
        Err(err) => {
            error!(error = %format!("{err:#}"), "error retrieving running cameras");
        }
    }

    if running.len() < services.config.max_agents_per_pod && orphan_rx.is_none() {
        stats.orphaned_request_subscriptions += 1;
        match orphan.subscribe().await {
            Ok(rx) => {
                *orphan_rx = Some(rx);
            }
            // A live subscription from a racing path is fine.
            Err(OrphanError::AlreadySubscribed) => {}
            Err(err) => {
                error!(error = %err, "error subscribing to orphan source");
            }
        }
    }

    stats.running_agents_uptime = begin.elapsed().as_secs() as i64;
    stats.running_agents += running.len() as i64;
    stats.avg_running_agents_per_min = if stats.running_agents_uptime > 0 {
        stats.running_agents as f64 / (stats.running_agents_uptime as f64 / 60.0)
    } else {
        0.0
    };
    stats.timestamp = Utc::now().timestamp();
    persist_stats(&services.registry, StatsEvent::AgentsManager(stats.clone())).await;
}

/// Uniform-random eviction spreads re-claim load across the fleet instead
/// of stampeding the same camera.
fn evict_random_agent(running: &mut HashMap<String, AgentRecord>, rng: &mut StdRng) {
    let Some(key) = running.keys().choose(rng).cloned() else {
        return;
    };
    if let Some(record) = running.remove(&key) {
        record.cancel.cancel();
        debug!(camera_id = %key, camera = %record.camera.name, "evicted a random agent");
    }
}
