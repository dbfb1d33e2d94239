//! The streamer framework: bounded inbound channel, competing worker
//! pool, per-worker stats, cancellation-aware teardown.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use common::frame::Frame;
use common::model::{Camera, ErrorEvent, StatsEvent, StreamerStats};

use super::{emit_error, Alert, Services};

/// Capacity of every streamer's inbound frame channel.
pub const INBOUND_CAPACITY: usize = 100;

/// Grace the supervisor gives the framer to notice cancellation before
/// the stage tears down.
pub const WAIT_BEFORE_CANCEL: Duration = Duration::from_secs(3);

/// Everything a streamer needs to run one stage for one camera.
#[derive(Clone)]
pub struct StreamerContext {
    pub cancel: CancellationToken,
    pub services: Services,
    pub camera: Camera,
    pub error_tx: mpsc::Sender<ErrorEvent>,
    pub stats_tx: mpsc::Sender<StatsEvent>,
    pub alert_tx: mpsc::Sender<Alert>,
}

/// A per-frame processing stage. `spawn` wires the stage up and returns
/// its inbound channel; the framer owns the sender from then on.
pub trait Streamer: Send + Sync {
    fn name(&self) -> &'static str;
    fn spawn(&self, ctx: StreamerContext) -> mpsc::Sender<Frame>;
}

/// One worker's processing half. Workers are created per pool slot so
/// stages can hold per-worker state (e.g. a model handle that is not
/// thread-safe).
#[async_trait]
pub trait FrameWorker: Send {
    /// One-time setup before the worker starts draining frames. An error
    /// aborts this worker only.
    async fn init(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Handle one frame. The frame is consumed — dropping it is the
    /// release, on every path.
    async fn process(&mut self, frame: Frame) -> anyhow::Result<()>;

    /// Alerts this worker discarded because the alert channel was full.
    fn dropped_alerts(&self) -> i64 {
        0
    }
}

pub trait WorkerFactory: Send + Sync + 'static {
    fn make(&self, worker: usize) -> Box<dyn FrameWorker>;
}

/// Spawns `streamer_max_workers` competing workers over a fresh inbound
/// channel plus a supervisor that grants the framer a grace period on
/// cancellation. Returns the inbound sender.
pub fn spawn_worker_pool(
    name: &'static str,
    ctx: &StreamerContext,
    factory: Arc<dyn WorkerFactory>,
) -> mpsc::Sender<Frame> {
    let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
    let inbound = Arc::new(Mutex::new(rx));

    for worker in 0..ctx.services.config.streamer_max_workers {
        let ctx = ctx.clone();
        let inbound = Arc::clone(&inbound);
        let factory = Arc::clone(&factory);
        tokio::spawn(async move {
            run_worker(name, worker, ctx, inbound, factory).await;
        });
    }

    let cancel = ctx.cancel.clone();
    tokio::spawn(async move {
        cancel.cancelled().await;
        tokio::time::sleep(WAIT_BEFORE_CANCEL).await;
        info!(streamer = name, "streamer cancelled");
    });

    tx
}

async fn run_worker(
    name: &'static str,
    worker: usize,
    ctx: StreamerContext,
    inbound: Arc<Mutex<mpsc::Receiver<Frame>>>,
    factory: Arc<dyn WorkerFactory>,
) {
    let mut processor = factory.make(worker);
    if let Err(err) = processor.init().await {
        emit_error(
            &ctx.error_tx,
            ErrorEvent::new(
                name,
                &format!("{err:#}"),
                format!("worker {worker}: streamer initialization failed"),
            ),
        )
        .await;
        return;
    }

    let begin = tokio::time::Instant::now();
    let mut frames: i64 = 0;
    let mut errors: i64 = 0;
    let mut total_proc = Duration::ZERO;

    loop {
        let frame = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                debug!(streamer = name, worker, "worker cancelled");
                break;
            }
            frame = async { inbound.lock().await.recv().await } => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let started = tokio::time::Instant::now();
        if let Err(err) = processor.process(frame).await {
            errors += 1;
            debug!(streamer = name, worker, error = %format!("{err:#}"), "frame processing failed");
        }
        frames += 1;
        total_proc += started.elapsed();
    }

    let uptime = begin.elapsed().as_secs() as i64;
    let fps = if uptime > 0 { frames / uptime } else { frames };
    let avg_proc_time = if frames > 0 {
        total_proc.as_secs_f64() / frames as f64
    } else {
        0.0
    };
    let _ = ctx
        .stats_tx
        .send(StatsEvent::Streamer(StreamerStats {
            name: name.to_string(),
            worker: worker as i32,
            camera: ctx.camera.name.clone(),
            frames,
            errors,
            dropped_alerts: processor.dropped_alerts(),
            uptime,
            fps,
            avg_proc_time,
            timestamp: Utc::now().timestamp(),
        }))
        .await;
}

/// Failed stage bring-up: report the failure and hand back a sender whose
/// receiver is already gone, so the framer's sends fail fast and every
/// clone is released at the send site.
pub(crate) fn abort_streamer(
    ctx: &StreamerContext,
    name: &'static str,
    err: anyhow::Error,
) -> mpsc::Sender<Frame> {
    let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
    drop(rx);
    let error_tx = ctx.error_tx.clone();
    let event = ErrorEvent::new(
        name,
        &format!("{err:#}"),
        "streamer initialization failed",
    );
    tokio::spawn(async move {
        emit_error(&error_tx, event).await;
    });
    tx
}
