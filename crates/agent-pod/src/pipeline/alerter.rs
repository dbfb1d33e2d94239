//! The pod-wide alert pipeline: enriches raw detections (frame upload,
//! VMS clip) and posts them to the webhook.

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use common::model::{AlerterStats, ErrorEvent, StatsEvent, WebhookPayload};

use super::{emit_error, Alert, Services, ALERT_CAPACITY};

const ALERTER_NAME: &str = "alerter";

/// Seconds of context on each side of the alert timestamp when asking the
/// VMS for a clip.
const CLIP_CONTEXT_SECS: i64 = 5;

/// Spawns the alerter and returns the pod-wide alert channel. Senders
/// must use `try_send` — alerts are lossy under saturation by design.
pub fn spawn(
    cancel: CancellationToken,
    services: Services,
    error_tx: mpsc::Sender<ErrorEvent>,
    stats_tx: mpsc::Sender<StatsEvent>,
) -> mpsc::Sender<Alert> {
    let (tx, rx) = mpsc::channel(ALERT_CAPACITY);
    tokio::spawn(run(cancel, services, error_tx, stats_tx, rx));
    tx
}

async fn run(
    cancel: CancellationToken,
    services: Services,
    error_tx: mpsc::Sender<ErrorEvent>,
    stats_tx: mpsc::Sender<StatsEvent>,
    mut inbound: mpsc::Receiver<Alert>,
) {
    let begin = tokio::time::Instant::now();
    let period = services.config.agent_alerter_periodic_timeout;
    let mut ticker = tokio::time::interval_at(begin + period, period);
    let mut alerts: i64 = 0;
    let mut errors: i64 = 0;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("alerter cancelled");
                break;
            }
            _ = ticker.tick() => {
                let stats = StatsEvent::Alerter(AlerterStats {
                    name: ALERTER_NAME.to_string(),
                    alerts,
                    errors,
                    uptime: begin.elapsed().as_secs() as i64,
                    timestamp: Utc::now().timestamp(),
                });
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = stats_tx.send(stats) => {}
                }
            }
            alert = inbound.recv() => match alert {
                Some(alert) => {
                    alerts += 1;
                    if !handle_alert(&services, &error_tx, alert).await {
                        errors += 1;
                    }
                    // The alert (and any frame image it carried) is
                    // released here.
                }
                None => break,
            },
        }
    }

    let _ = stats_tx
        .send(StatsEvent::Alerter(AlerterStats {
            name: ALERTER_NAME.to_string(),
            alerts,
            errors,
            uptime: begin.elapsed().as_secs() as i64,
            timestamp: Utc::now().timestamp(),
        }))
        .await;
}

/// Enrich and deliver one alert. Returns false when any leg failed; the
/// failure is already recorded as an error event.
async fn handle_alert(
    services: &Services,
    error_tx: &mpsc::Sender<ErrorEvent>,
    alert: Alert,
) -> bool {
    let mut frame_url = alert.frame_url.clone();
    let mut clip_url = alert.clip_url.clone();

    // A recorder alert arrives with its clip already uploaded; a detector
    // alert carries only the frame image and needs both URLs.
    if clip_url.is_empty() {
        let path = services.config.recordings_folder.join(format!(
            "{}_alerted_frame_{}.jpg",
            alert.camera.id,
            Utc::now().timestamp_millis()
        ));
        let saved = async {
            tokio::fs::create_dir_all(&services.config.recordings_folder).await?;
            let frame = alert
                .frame
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("alert carries no frame image"))?;
            frame.image.save(&path)?;
            services.storage.store_file(&path).await
        }
        .await;
        frame_url = match saved {
            Ok(url) => url,
            Err(err) => {
                emit_error(
                    error_tx,
                    ErrorEvent::new(
                        ALERTER_NAME,
                        &format!("{err:#}"),
                        format!("error storing alerted frame {}", path.display()),
                    ),
                )
                .await;
                return false;
            }
        };

        let at = alert.timestamp.timestamp();
        clip_url = match services
            .vms
            .retrieve_clip(&alert.camera.vms_id, at - CLIP_CONTEXT_SECS, at + CLIP_CONTEXT_SECS)
            .await
        {
            Ok(url) => url,
            Err(err) => {
                emit_error(
                    error_tx,
                    ErrorEvent::new(
                        ALERTER_NAME,
                        &format!("{err:#}"),
                        format!("error retrieving a clip from VMS for camera {}", alert.camera.name),
                    ),
                )
                .await;
                return false;
            }
        };
    }

    let payload = WebhookPayload {
        source: alert.camera.name.clone(),
        alert_image_url: frame_url,
        alert_clip_url: clip_url,
        label: alert.label.clone(),
        confidence: alert.confidence,
        timestamp: Utc::now().to_rfc3339(),
    };
    info!(
        source = %payload.source,
        label = %payload.label,
        confidence = payload.confidence,
        "alert payload"
    );

    if let Err(err) = services.webhook.post(&payload).await {
        emit_error(
            error_tx,
            ErrorEvent::new(
                ALERTER_NAME,
                &format!("{err:#}"),
                format!("error posting to webhook for camera {}", alert.camera.name),
            ),
        )
        .await;
        return false;
    }
    true
}
