//! The frame source stage. Decodes (or synthesizes) frames and fans each
//! one out to every streamer's inbound channel.
//!
//! Release discipline: the original frame is released at the end of each
//! iteration; every clone sent on a channel hands release responsibility
//! to the receiver; a clone whose send loses the cancellation race (or
//! whose receiver is gone) is released at the send site.

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use common::frame::Frame;
use common::model::{Camera, ErrorEvent, FramerStats, StatsEvent};

use super::{emit_error, Services};

/// Cameras with this framer type get the synthetic source.
pub const RANDOM_FRAMER: &str = "random";

const SYNTHETIC_WIDTH: u32 = 640;
const SYNTHETIC_HEIGHT: u32 = 480;

pub fn spawn_framer(
    cancel: CancellationToken,
    services: Services,
    camera: Camera,
    error_tx: mpsc::Sender<ErrorEvent>,
    stats_tx: mpsc::Sender<StatsEvent>,
    channels: Vec<mpsc::Sender<Frame>>,
) {
    if camera.framer_type == RANDOM_FRAMER {
        tokio::spawn(random_framer(cancel, services, camera, stats_tx, channels));
    } else {
        tokio::spawn(rtsp_framer(
            cancel, services, camera, error_tx, stats_tx, channels,
        ));
    }
}

async fn rtsp_framer(
    cancel: CancellationToken,
    services: Services,
    camera: Camera,
    error_tx: mpsc::Sender<ErrorEvent>,
    stats_tx: mpsc::Sender<StatsEvent>,
    channels: Vec<mpsc::Sender<Frame>>,
) {
    let begin = tokio::time::Instant::now();
    let mut frames: i64 = 0;
    let mut skipped: i64 = 0;
    let mut errors: i64 = 0;

    let mut source = match services.video.open(&camera.rtsp_url).await {
        Ok(source) => Some(source),
        Err(err) => {
            emit_error(
                &error_tx,
                ErrorEvent::new(
                    "agent_rtsp_framer",
                    &format!("{err:#}"),
                    format!("error opening rtsp stream for camera {}", camera.name),
                ),
            )
            .await;
            None
        }
    };

    if let Some(source) = source.as_mut() {
        let mut index: u64 = 0;
        loop {
            index += 1;
            let frame = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(camera = %camera.name, "rtsp framer cancelled");
                    break;
                }
                result = source.read_frame() => match result {
                    Ok(Some(frame)) if !frame.is_empty() => frame,
                    Ok(Some(_empty)) => {
                        errors += 1;
                        continue;
                    }
                    Ok(None) => {
                        info!(camera = %camera.name, "rtsp stream ended");
                        break;
                    }
                    Err(err) => {
                        errors += 1;
                        debug!(camera = %camera.name, error = %format!("{err:#}"), "frame read failed");
                        continue;
                    }
                },
            };

            if services.inference.can_skip_frame(index) {
                skipped += 1;
                continue;
            }

            frames += 1;
            if !fan_out(&cancel, &channels, &frame).await {
                break;
            }
        }
    }

    let uptime = begin.elapsed().as_secs() as i64;
    let _ = stats_tx
        .send(StatsEvent::Framer(FramerStats {
            name: "rtspFramer".to_string(),
            camera: camera.name.clone(),
            frames,
            skipped_frames: skipped,
            errors,
            uptime,
            fps: if uptime > 0 { frames / uptime } else { frames },
            timestamp: Utc::now().timestamp(),
        }))
        .await;
}

async fn random_framer(
    cancel: CancellationToken,
    services: Services,
    camera: Camera,
    stats_tx: mpsc::Sender<StatsEvent>,
    channels: Vec<mpsc::Sender<Frame>>,
) {
    let begin = tokio::time::Instant::now();
    let interval = services.config.synthetic_frame_interval;
    let mut frames: i64 = 0;
    let mut seq: u64 = 0;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!(camera = %camera.name, "random framer cancelled");
                break;
            }
            _ = tokio::time::sleep(interval) => {}
        }

        seq += 1;
        let frame = Frame::synthetic(seq, SYNTHETIC_WIDTH, SYNTHETIC_HEIGHT);
        frames += 1;
        if !fan_out(&cancel, &channels, &frame).await {
            break;
        }
    }

    let uptime = begin.elapsed().as_secs() as i64;
    let _ = stats_tx
        .send(StatsEvent::Framer(FramerStats {
            name: "randomFramer".to_string(),
            camera: camera.name.clone(),
            frames,
            skipped_frames: 0,
            errors: 0,
            uptime,
            fps: if uptime > 0 { frames / uptime } else { frames },
            timestamp: Utc::now().timestamp(),
        }))
        .await;
}

/// Clone the frame into every inbound channel, each send racing
/// cancellation. Returns false when cancellation won; the in-flight clone
/// rides inside the abandoned send future and is released with it.
async fn fan_out(
    cancel: &CancellationToken,
    channels: &[mpsc::Sender<Frame>],
    frame: &Frame,
) -> bool {
    for tx in channels {
        let clone = frame.clone();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("framer cancelled while sending");
                return false;
            }
            result = tx.send(clone) => {
                if let Err(returned) = result {
                    // Streamer gone (failed init or torn down); release
                    // the clone and keep serving the others.
                    drop(returned.0);
                }
            }
        }
    }
    true
}
