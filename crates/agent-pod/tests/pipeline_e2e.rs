//! Whole-pipeline run: synthetic framer feeding a detector-shaped
//! streamer through the manager, alerts flowing out the webhook, and a
//! clean teardown with a balanced frame ledger.

mod support;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use agent_pod::mode::manager;
use agent_pod::pipeline::detector::CooldownGate;
use agent_pod::pipeline::streamer::{
    spawn_worker_pool, FrameWorker, Streamer, StreamerContext, WorkerFactory,
};
use agent_pod::pipeline::Alert;
use common::frame::{self, Frame};
use common::model::Camera;
use support::{build_services, camera, test_config, MockRegistry, ScriptedOrphanSource, UnusedVideo};

/// Detector stand-in: flags a high-confidence person on every frame, so
/// the cooldown gate alone decides the alert rate.
struct InjectingStreamer;

impl Streamer for InjectingStreamer {
    fn name(&self) -> &'static str {
        "injector"
    }

    fn spawn(&self, ctx: StreamerContext) -> mpsc::Sender<Frame> {
        let params = ctx.services.config.streamer_parameters("detector");
        let factory = Arc::new(InjectingFactory {
            gate: Arc::new(CooldownGate::new(params.cool_down_period)),
            camera: ctx.camera.clone(),
            alert_tx: ctx.alert_tx.clone(),
        });
        spawn_worker_pool("injector", &ctx, factory)
    }
}

struct InjectingFactory {
    gate: Arc<CooldownGate>,
    camera: Camera,
    alert_tx: mpsc::Sender<Alert>,
}

impl WorkerFactory for InjectingFactory {
    fn make(&self, _worker: usize) -> Box<dyn FrameWorker> {
        Box::new(InjectingWorker {
            gate: Arc::clone(&self.gate),
            camera: self.camera.clone(),
            alert_tx: self.alert_tx.clone(),
        })
    }
}

struct InjectingWorker {
    gate: Arc<CooldownGate>,
    camera: Camera,
    alert_tx: mpsc::Sender<Alert>,
}

#[async_trait]
impl FrameWorker for InjectingWorker {
    async fn process(&mut self, frame: Frame) -> anyhow::Result<()> {
        if !self.gate.should_alert("person") {
            return Ok(());
        }
        let alert = Alert {
            frame: Some(frame.clone()),
            frame_url: String::new(),
            clip_url: String::new(),
            camera: self.camera.clone(),
            label: "person".to_string(),
            confidence: 0.99,
            timestamp: Utc::now(),
        };
        let _ = self.alert_tx.try_send(alert);
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn twelve_second_run_alerts_on_cooldown_and_releases_every_frame() {
    let ledger_before = frame::ledger();

    let tmp = tempfile::tempdir().unwrap();
    let cam = camera("cam-e2e", "random");
    let registry = MockRegistry::with_cameras(vec![cam.clone()]);
    let (services, collaborators) = build_services(
        test_config(tmp.path()),
        registry,
        Arc::new(UnusedVideo),
    );

    let orphan = ScriptedOrphanSource::new(vec![vec![cam]]);
    let root = CancellationToken::new();
    let handle = tokio::spawn(manager::run(
        root.child_token(),
        services,
        orphan,
        vec![Arc::new(InjectingStreamer) as Arc<dyn Streamer>],
    ));

    tokio::time::sleep(Duration::from_secs(12)).await;
    root.cancel();
    handle.await.unwrap().unwrap();

    // Cooldown of 5s over a 12s run: alerts near t=0, t=5 and t=10.
    let posts = collaborators.webhook.posts.lock().unwrap().clone();
    assert!(
        (2..=3).contains(&posts.len()),
        "expected 2..=3 alerts, got {}",
        posts.len()
    );
    assert!(posts.iter().all(|p| p.label == "person"));
    assert!(posts.iter().all(|p| !p.alert_image_url.is_empty()));
    assert!(posts.iter().all(|p| !p.alert_clip_url.is_empty()));

    // Each enriched alert went through storage and the VMS once.
    assert_eq!(
        collaborators
            .storage
            .calls
            .load(std::sync::atomic::Ordering::SeqCst),
        posts.len()
    );

    // Exit-path reporting made it out before the drain window closed.
    let kinds = collaborators.registry.stats_kinds();
    assert!(kinds.contains(&"framer-stats"));
    assert!(kinds.contains(&"streamer-stats"));
    assert!(kinds.contains(&"alerter-stats"));

    let framer_stats = collaborators
        .registry
        .stats
        .lock()
        .unwrap()
        .iter()
        .find_map(|event| match event {
            common::model::StatsEvent::Framer(s) => Some(s.clone()),
            _ => None,
        })
        .expect("framer stats present");
    assert!(framer_stats.frames > 0);
    assert_eq!(framer_stats.errors, 0);

    // No errors anywhere in the run.
    assert!(collaborators.registry.errors.lock().unwrap().is_empty());

    // Let every straggler task (supervisor grace, worker teardown) finish,
    // then check the ledger: exactly one release per allocation.
    tokio::time::sleep(Duration::from_secs(10)).await;
    let ledger_after = frame::ledger();
    assert_eq!(
        ledger_before.outstanding(),
        ledger_after.outstanding(),
        "frames leaked: {ledger_after:?}"
    );
}
