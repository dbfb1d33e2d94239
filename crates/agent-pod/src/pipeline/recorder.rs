//! Clip recorder streamer. Single worker — frame order matters inside a
//! clip. Buffers frames, then flushes each clip asynchronously: encode to
//! MP4, upload, run clip-level inference, alert on a hit, delete the
//! local file.

use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use image::imageops::FilterType;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use common::config::RECORDER_STREAMER;
use common::frame::Frame;
use common::model::{ErrorEvent, StatsEvent, StreamerStats};

use super::streamer::{Streamer, StreamerContext, INBOUND_CAPACITY, WAIT_BEFORE_CANCEL};
use super::{emit_error, push_alert, Alert};

#[async_trait]
pub trait ClipEncoder: Send + Sync {
    /// Writes the frames to `path` as a playable clip. The first frame
    /// defines the clip dimensions; mismatched frames are resized with
    /// linear interpolation.
    async fn encode(&self, frames: &[Frame], path: &Path) -> Result<()>;
}

pub struct RecorderStreamer {
    encoder: Arc<dyn ClipEncoder>,
}

impl RecorderStreamer {
    pub fn new() -> Self {
        Self::with_encoder(Arc::new(Mp4Encoder { fps: 30 }))
    }

    pub fn with_encoder(encoder: Arc<dyn ClipEncoder>) -> Self {
        Self { encoder }
    }
}

impl Default for RecorderStreamer {
    fn default() -> Self {
        Self::new()
    }
}

impl Streamer for RecorderStreamer {
    fn name(&self) -> &'static str {
        RECORDER_STREAMER
    }

    fn spawn(&self, ctx: StreamerContext) -> mpsc::Sender<Frame> {
        let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
        tokio::spawn(run_recorder(ctx, rx, Arc::clone(&self.encoder)));
        tx
    }
}

async fn run_recorder(
    ctx: StreamerContext,
    mut inbound: mpsc::Receiver<Frame>,
    encoder: Arc<dyn ClipEncoder>,
) {
    let params = ctx.services.config.streamer_parameters(RECORDER_STREAMER);
    let begin = tokio::time::Instant::now();
    let mut recording_start = tokio::time::Instant::now();
    let mut buffer: Vec<Frame> = Vec::new();
    let mut flushes: JoinSet<()> = JoinSet::new();
    // Shared with the flush tasks, which emit this streamer's alerts.
    let dropped_alerts = Arc::new(AtomicI64::new(0));
    let mut frames: i64 = 0;
    let mut total_proc = std::time::Duration::ZERO;

    loop {
        let frame = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                info!(camera = %ctx.camera.name, "recorder cancelled");
                break;
            }
            frame = inbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let started = tokio::time::Instant::now();
        buffer.push(frame);
        if recording_start.elapsed() >= params.clip_duration {
            // Deep-clone the clip, release the originals synchronously,
            // flush off the hot path.
            let clip: Vec<Frame> = buffer.iter().cloned().collect();
            buffer.clear();
            recording_start = tokio::time::Instant::now();
            spawn_flush(&mut flushes, &ctx, &encoder, &dropped_alerts, clip);
        }
        frames += 1;
        total_proc += started.elapsed();

        reap_flushes(&mut flushes);
    }

    if ctx.cancel.is_cancelled() {
        // Give the framer a moment to observe cancellation before the
        // inbound channel goes away.
        tokio::time::sleep(WAIT_BEFORE_CANCEL).await;
    }

    // Final flush of whatever is still buffered.
    if !buffer.is_empty() {
        let remaining = std::mem::take(&mut buffer);
        spawn_flush(&mut flushes, &ctx, &encoder, &dropped_alerts, remaining);
    }
    while let Some(result) = flushes.join_next().await {
        if let Err(err) = result {
            error!(error = %err, "recorder flush panicked");
        }
    }

    let uptime = begin.elapsed().as_secs() as i64;
    let _ = ctx
        .stats_tx
        .send(StatsEvent::Streamer(StreamerStats {
            name: RECORDER_STREAMER.to_string(),
            worker: -1,
            camera: ctx.camera.name.clone(),
            frames,
            errors: 0,
            dropped_alerts: dropped_alerts.load(Ordering::Relaxed),
            uptime,
            fps: if uptime > 0 { frames / uptime } else { frames },
            avg_proc_time: if frames > 0 {
                total_proc.as_secs_f64() / frames as f64
            } else {
                0.0
            },
            timestamp: Utc::now().timestamp(),
        }))
        .await;
}

fn spawn_flush(
    flushes: &mut JoinSet<()>,
    ctx: &StreamerContext,
    encoder: &Arc<dyn ClipEncoder>,
    dropped_alerts: &Arc<AtomicI64>,
    clip: Vec<Frame>,
) {
    if clip.is_empty() {
        return;
    }
    let ctx = ctx.clone();
    let encoder = Arc::clone(encoder);
    let dropped_alerts = Arc::clone(dropped_alerts);
    flushes.spawn(async move {
        flush_clip(ctx, encoder, dropped_alerts, clip).await;
    });
}

/// Panics inside finished flush tasks surface here instead of unwinding
/// anything.
fn reap_flushes(flushes: &mut JoinSet<()>) {
    while let Some(result) = flushes.try_join_next() {
        if let Err(err) = result {
            error!(error = %err, "recorder flush panicked");
        }
    }
}

async fn flush_clip(
    ctx: StreamerContext,
    encoder: Arc<dyn ClipEncoder>,
    dropped_alerts: Arc<AtomicI64>,
    clip: Vec<Frame>,
) {
    let folder = &ctx.services.config.recordings_folder;
    if let Err(err) = tokio::fs::create_dir_all(folder).await {
        emit_error(
            &ctx.error_tx,
            ErrorEvent::new(
                RECORDER_STREAMER,
                &err,
                format!("error creating recordings folder {}", folder.display()),
            ),
        )
        .await;
        return;
    }

    let path = folder.join(format!(
        "{}_recording_{}.mp4",
        ctx.camera.name,
        Utc::now().timestamp_millis()
    ));
    if let Err(err) = encoder.encode(&clip, &path).await {
        emit_error(
            &ctx.error_tx,
            ErrorEvent::new(
                RECORDER_STREAMER,
                &format!("{err:#}"),
                "error saving frames as mp4",
            ),
        )
        .await;
        return;
    }
    // The clones served their purpose once the clip is on disk.
    drop(clip);

    if let Err(err) = enrich_clip(&ctx, &dropped_alerts, &path).await {
        emit_error(
            &ctx.error_tx,
            ErrorEvent::new(
                RECORDER_STREAMER,
                &format!("{err:#}"),
                format!("error processing clip {}", path.display()),
            ),
        )
        .await;
    }

    // The local file goes away whether or not enrichment succeeded.
    if let Err(err) = tokio::fs::remove_file(&path).await {
        emit_error(
            &ctx.error_tx,
            ErrorEvent::new(
                RECORDER_STREAMER,
                &err,
                format!("error deleting the local clip {}", path.display()),
            ),
        )
        .await;
    }
}

async fn enrich_clip(
    ctx: &StreamerContext,
    dropped_alerts: &AtomicI64,
    path: &Path,
) -> Result<()> {
    let clip_url = ctx
        .services
        .storage
        .store_file(path)
        .await
        .context("error storing a clip")?;

    let result = ctx
        .services
        .inference
        .invoke("", &clip_url)
        .await
        .context("error invoking clip inference")?;

    if !result.alert_image_url.is_empty() {
        let alert = Alert {
            frame: None,
            frame_url: result.alert_image_url,
            clip_url,
            camera: ctx.camera.clone(),
            label: "clip".to_string(),
            confidence: 100.0,
            timestamp: Utc::now(),
        };
        let mut dropped = 0i64;
        push_alert(&ctx.alert_tx, &ctx.camera.name, alert, &mut dropped);
        dropped_alerts.fetch_add(dropped, Ordering::Relaxed);
    }
    Ok(())
}

/// ffmpeg-backed encoder: raw RGB frames piped to stdin, H.264 MP4 out.
pub struct Mp4Encoder {
    pub fps: u32,
}

#[async_trait]
impl ClipEncoder for Mp4Encoder {
    async fn encode(&self, frames: &[Frame], path: &Path) -> Result<()> {
        let first = frames.first().context("no frames to encode")?;
        anyhow::ensure!(!first.is_empty(), "first frame has no pixels");
        let (width, height) = (first.width(), first.height());

        let size = format!("{width}x{height}");
        let fps = self.fps.to_string();
        let mut child = tokio::process::Command::new("ffmpeg")
            .args([
                "-hide_banner",
                "-loglevel",
                "error",
                "-y",
                "-f",
                "rawvideo",
                "-pix_fmt",
                "rgb24",
                "-s",
                size.as_str(),
                "-r",
                fps.as_str(),
                "-i",
                "pipe:0",
                "-pix_fmt",
                "yuv420p",
            ])
            .arg(path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .context("failed to spawn ffmpeg")?;
        let mut stdin = child.stdin.take().context("ffmpeg stdin unavailable")?;

        for frame in frames {
            if frame.width() != width || frame.height() != height {
                warn!(
                    frame_width = frame.width(),
                    frame_height = frame.height(),
                    clip_width = width,
                    clip_height = height,
                    "frame dimensions do not match clip dimensions, resizing"
                );
                let resized =
                    image::imageops::resize(&frame.image, width, height, FilterType::Triangle);
                stdin.write_all(resized.as_raw()).await?;
            } else {
                stdin.write_all(frame.image.as_raw()).await?;
            }
        }
        drop(stdin);

        let status = child.wait().await.context("error waiting for ffmpeg")?;
        anyhow::ensure!(status.success(), "ffmpeg exited with {status}");
        Ok(())
    }
}
