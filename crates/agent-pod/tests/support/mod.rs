//! Shared test doubles: counting collaborators and a scripted orphan
//! source.

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;

use agent_pod::orphan::{OrphanError, OrphanSource, ORPHAN_BATCH_CAPACITY};
use agent_pod::pipeline::Services;
use common::config::Config;
use common::frame::Frame;
use common::inference::{Inference, InferenceResult};
use common::model::{Camera, ErrorEvent, StatsEvent, WebhookPayload};
use common::registry::Registry;
use common::storage::Storage;
use common::video::{VideoSource, VideoSourceOpener};
use common::vms::Vms;
use common::webhook::Webhook;

pub fn camera(id: &str, framer_type: &str) -> Camera {
    Camera {
        id: id.to_string(),
        vms_id: format!("vms-{id}"),
        name: id.to_string(),
        rtsp_url: format!("rtsp://example/{id}"),
        framer_type: framer_type.to_string(),
        ..Camera::default()
    }
}

pub fn test_config(tmp: &Path) -> Config {
    Config {
        settings_folder: tmp.join("settings"),
        recordings_folder: tmp.join("recordings"),
        ..Config::default()
    }
}

#[derive(Default)]
pub struct MockRegistry {
    pub cameras: Mutex<Vec<Camera>>,
    pub orphans: Mutex<Vec<Camera>>,
    pub fail_orphan_scan: AtomicBool,
    pub claims: Mutex<Vec<(String, String)>>,
    pub heartbeats: Mutex<Vec<String>>,
    pub stats: Mutex<Vec<StatsEvent>>,
    pub errors: Mutex<Vec<ErrorEvent>>,
}

impl MockRegistry {
    pub fn with_cameras(cameras: Vec<Camera>) -> Arc<Self> {
        let registry = Self::default();
        *registry.cameras.lock().unwrap() = cameras;
        Arc::new(registry)
    }

    pub fn set_excluded(&self, id: &str) {
        let mut cameras = self.cameras.lock().unwrap();
        if let Some(camera) = cameras.iter_mut().find(|c| c.id == id) {
            camera.excluded = true;
        }
    }

    pub fn stats_kinds(&self) -> Vec<&'static str> {
        self.stats.lock().unwrap().iter().map(|s| s.kind()).collect()
    }
}

#[async_trait]
impl Registry for MockRegistry {
    async fn retrieve_cameras(&self) -> Result<Vec<Camera>> {
        Ok(self.cameras.lock().unwrap().clone())
    }

    async fn retrieve_cameras_by_ids(&self, ids: &[String]) -> Result<Vec<Camera>> {
        Ok(self
            .cameras
            .lock()
            .unwrap()
            .iter()
            .filter(|c| ids.contains(&c.id))
            .cloned()
            .collect())
    }

    async fn retrieve_orphaned_cameras(&self, max: usize) -> Result<Vec<Camera>> {
        if self.fail_orphan_scan.load(Ordering::SeqCst) {
            return Err(anyhow!("registry unavailable"));
        }
        let orphans = self.orphans.lock().unwrap();
        Ok(orphans.iter().take(max).cloned().collect())
    }

    async fn update_camera_agent_id(&self, camera_id: &str, agent_id: &str) -> Result<()> {
        self.claims
            .lock()
            .unwrap()
            .push((camera_id.to_string(), agent_id.to_string()));
        let mut cameras = self.cameras.lock().unwrap();
        if let Some(camera) = cameras.iter_mut().find(|c| c.id == camera_id) {
            camera.agent_id = agent_id.to_string();
        }
        Ok(())
    }

    async fn update_camera_heartbeat(&self, camera_id: &str) -> Result<()> {
        self.heartbeats.lock().unwrap().push(camera_id.to_string());
        Ok(())
    }

    async fn update_camera_excluded(&self, camera_id: &str, excluded: bool) -> Result<()> {
        let mut cameras = self.cameras.lock().unwrap();
        if let Some(camera) = cameras.iter_mut().find(|c| c.id == camera_id) {
            camera.excluded = excluded;
        }
        Ok(())
    }

    async fn record_error(&self, event: ErrorEvent) -> Result<()> {
        self.errors.lock().unwrap().push(event);
        Ok(())
    }

    async fn record_stats(&self, event: StatsEvent) -> Result<()> {
        self.stats.lock().unwrap().push(event);
        Ok(())
    }
}

/// Orphan source that hands its scripted batches to the first subscriber
/// and counts subscription churn.
#[derive(Default)]
pub struct ScriptedOrphanSource {
    batches: Mutex<Vec<Vec<Camera>>>,
    delivery: Mutex<Option<mpsc::Sender<Vec<Camera>>>>,
    pub subscribes: AtomicUsize,
    pub unsubscribes: AtomicUsize,
}

impl ScriptedOrphanSource {
    pub fn new(batches: Vec<Vec<Camera>>) -> Arc<Self> {
        let source = Self::default();
        *source.batches.lock().unwrap() = batches;
        Arc::new(source)
    }
}

#[async_trait]
impl OrphanSource for ScriptedOrphanSource {
    async fn subscribe(&self) -> Result<mpsc::Receiver<Vec<Camera>>, OrphanError> {
        self.subscribes.fetch_add(1, Ordering::SeqCst);
        let mut delivery = self.delivery.lock().unwrap();
        if delivery.is_some() {
            return Err(OrphanError::AlreadySubscribed);
        }
        let (tx, rx) = mpsc::channel(ORPHAN_BATCH_CAPACITY);
        for batch in self.batches.lock().unwrap().drain(..) {
            let _ = tx.try_send(batch);
        }
        *delivery = Some(tx);
        Ok(rx)
    }

    async fn unsubscribe(&self) -> Result<(), OrphanError> {
        self.unsubscribes.fetch_add(1, Ordering::SeqCst);
        match self.delivery.lock().unwrap().take() {
            Some(_) => Ok(()),
            None => Err(OrphanError::NotSubscribed),
        }
    }

    async fn publish(&self, _batch: Vec<Camera>) -> Result<(), OrphanError> {
        Ok(())
    }
}

#[derive(Default)]
pub struct CountingStorage {
    pub calls: AtomicUsize,
    pub fail: AtomicBool,
}

#[async_trait]
impl Storage for CountingStorage {
    async fn store_file(&self, _path: &Path) -> Result<String> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(anyhow!("storage unavailable"));
        }
        Ok(format!("https://storage.example/{n}"))
    }
}

#[derive(Default)]
pub struct CountingVms {
    pub calls: AtomicUsize,
    pub fail: AtomicBool,
}

#[async_trait]
impl Vms for CountingVms {
    async fn retrieve_clip(&self, vms_id: &str, _from: i64, _to: i64) -> Result<String> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(anyhow!("vms unavailable"));
        }
        Ok(format!("https://vms.example/{vms_id}/clip/{n}"))
    }
}

#[derive(Default)]
pub struct CountingWebhook {
    pub posts: Mutex<Vec<WebhookPayload>>,
}

#[async_trait]
impl Webhook for CountingWebhook {
    async fn post(&self, payload: &WebhookPayload) -> Result<()> {
        self.posts.lock().unwrap().push(payload.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct CountingInference {
    pub invokes: AtomicUsize,
    pub skip_odd_frames: AtomicBool,
    pub alert_image_url: Mutex<String>,
}

#[async_trait]
impl Inference for CountingInference {
    async fn invoke(&self, _model_name: &str, _input_url: &str) -> Result<InferenceResult> {
        self.invokes.fetch_add(1, Ordering::SeqCst);
        Ok(InferenceResult {
            alert_image_url: self.alert_image_url.lock().unwrap().clone(),
            ..InferenceResult::default()
        })
    }

    fn can_skip_frame(&self, frame_index: u64) -> bool {
        self.skip_odd_frames.load(Ordering::SeqCst) && frame_index % 2 == 1
    }
}

/// Video opener for tests that never reach a real stream.
pub struct UnusedVideo;

#[async_trait]
impl VideoSourceOpener for UnusedVideo {
    async fn open(&self, _uri: &str) -> Result<Box<dyn VideoSource>> {
        Err(anyhow!("no video source in tests"))
    }
}

/// Endless synthetic source with a read pace, standing in for a decoder.
pub struct FakeVideoOpener {
    pub frame_interval: Duration,
}

#[async_trait]
impl VideoSourceOpener for FakeVideoOpener {
    async fn open(&self, _uri: &str) -> Result<Box<dyn VideoSource>> {
        Ok(Box::new(FakeVideoSource {
            seq: 0,
            frame_interval: self.frame_interval,
        }))
    }
}

struct FakeVideoSource {
    seq: u64,
    frame_interval: Duration,
}

#[async_trait]
impl VideoSource for FakeVideoSource {
    async fn read_frame(&mut self) -> Result<Option<Frame>> {
        tokio::time::sleep(self.frame_interval).await;
        self.seq += 1;
        Ok(Some(Frame::synthetic(self.seq, 320, 240)))
    }
}

/// Mocked collaborator handles kept for assertions.
pub struct TestCollaborators {
    pub registry: Arc<MockRegistry>,
    pub storage: Arc<CountingStorage>,
    pub vms: Arc<CountingVms>,
    pub inference: Arc<CountingInference>,
    pub webhook: Arc<CountingWebhook>,
}

pub fn build_services(
    config: Config,
    registry: Arc<MockRegistry>,
    video: Arc<dyn VideoSourceOpener>,
) -> (Services, TestCollaborators) {
    let storage = Arc::new(CountingStorage::default());
    let vms = Arc::new(CountingVms::default());
    let inference = Arc::new(CountingInference::default());
    let webhook = Arc::new(CountingWebhook::default());
    let services = Services {
        config: Arc::new(config),
        registry: registry.clone(),
        storage: storage.clone(),
        vms: vms.clone(),
        inference: inference.clone(),
        webhook: webhook.clone(),
        video,
    };
    let collaborators = TestCollaborators {
        registry,
        storage,
        vms,
        inference,
        webhook,
    };
    (services, collaborators)
}
