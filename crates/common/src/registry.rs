//! The durable camera registry and stats/error sink.
//!
//! The core only ever reads cameras and writes the ownership fields; row
//! updates are serialized behind a single lock and the strongest promise
//! is last-writer-wins.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use crate::model::{Camera, ErrorEvent, StatsEvent};

#[async_trait]
pub trait Registry: Send + Sync {
    async fn retrieve_cameras(&self) -> Result<Vec<Camera>>;
    async fn retrieve_cameras_by_ids(&self, ids: &[String]) -> Result<Vec<Camera>>;
    async fn retrieve_orphaned_cameras(&self, max: usize) -> Result<Vec<Camera>>;
    async fn update_camera_agent_id(&self, camera_id: &str, agent_id: &str) -> Result<()>;
    async fn update_camera_heartbeat(&self, camera_id: &str) -> Result<()>;
    async fn update_camera_excluded(&self, camera_id: &str, excluded: bool) -> Result<()>;
    async fn record_error(&self, event: ErrorEvent) -> Result<()>;
    async fn record_stats(&self, event: StatsEvent) -> Result<()>;
}

/// Dev registry backed by JSON files under the settings folder:
/// `cameras.json` for the camera rows, one `<kind>.json` per stats series
/// and `errors.json` for error events.
pub struct FileRegistry {
    cameras_file: PathBuf,
    settings_folder: PathBuf,
    stale_after: Duration,
    write_lock: Mutex<()>,
}

impl FileRegistry {
    pub fn new(settings_folder: PathBuf, stale_after: Duration) -> Self {
        Self {
            cameras_file: settings_folder.join("cameras.json"),
            settings_folder,
            stale_after,
            write_lock: Mutex::new(()),
        }
    }

    async fn load_cameras(&self) -> Result<Vec<Camera>> {
        let data = tokio::fs::read(&self.cameras_file)
            .await
            .with_context(|| format!("error reading {}", self.cameras_file.display()))?;
        serde_json::from_slice(&data)
            .with_context(|| format!("error parsing {}", self.cameras_file.display()))
    }

    async fn save_cameras(&self, cameras: &[Camera]) -> Result<()> {
        let data = serde_json::to_vec_pretty(cameras)?;
        tokio::fs::write(&self.cameras_file, data)
            .await
            .with_context(|| format!("error writing {}", self.cameras_file.display()))
    }

    /// Read-modify-write of one camera row under the write lock.
    async fn update_camera<F>(&self, camera_id: &str, apply: F) -> Result<()>
    where
        F: FnOnce(&mut Camera),
    {
        let _guard = self.write_lock.lock().await;
        let mut cameras = self.load_cameras().await?;
        if let Some(camera) = cameras.iter_mut().find(|c| c.id == camera_id) {
            apply(camera);
        }
        self.save_cameras(&cameras).await
    }

    async fn append_entity(&self, kind: &str, entity: serde_json::Value) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.settings_folder.join(format!("{kind}.json"));
        let mut entities: Vec<serde_json::Value> = match tokio::fs::read(&path).await {
            Ok(data) => serde_json::from_slice(&data)
                .with_context(|| format!("error parsing {}", path.display()))?,
            Err(_) => Vec::new(),
        };
        entities.push(entity);
        let data = serde_json::to_vec_pretty(&entities)?;
        tokio::fs::write(&path, data)
            .await
            .with_context(|| format!("error writing {}", path.display()))
    }
}

#[async_trait]
impl Registry for FileRegistry {
    async fn retrieve_cameras(&self) -> Result<Vec<Camera>> {
        self.load_cameras().await
    }

    async fn retrieve_cameras_by_ids(&self, ids: &[String]) -> Result<Vec<Camera>> {
        let cameras = self.load_cameras().await?;
        Ok(cameras
            .into_iter()
            .filter(|c| ids.iter().any(|id| *id == c.id))
            .collect())
    }

    async fn retrieve_orphaned_cameras(&self, max: usize) -> Result<Vec<Camera>> {
        let cameras = self.load_cameras().await?;
        let now = Utc::now().timestamp();
        Ok(cameras
            .into_iter()
            .filter(|c| c.is_orphaned(now, self.stale_after))
            .take(max)
            .collect())
    }

    async fn update_camera_agent_id(&self, camera_id: &str, agent_id: &str) -> Result<()> {
        let now = Utc::now().timestamp();
        self.update_camera(camera_id, |camera| {
            camera.agent_id = agent_id.to_string();
            camera.startup_time = now;
            camera.last_heartbeat = now;
            camera.uptime = 0;
        })
        .await
    }

    async fn update_camera_heartbeat(&self, camera_id: &str) -> Result<()> {
        let now = Utc::now().timestamp();
        self.update_camera(camera_id, |camera| {
            camera.last_heartbeat = now;
            camera.uptime = camera.last_heartbeat - camera.startup_time;
        })
        .await
    }

    async fn update_camera_excluded(&self, camera_id: &str, excluded: bool) -> Result<()> {
        self.update_camera(camera_id, |camera| {
            camera.excluded = excluded;
        })
        .await
    }

    async fn record_error(&self, event: ErrorEvent) -> Result<()> {
        self.append_entity("errors", serde_json::to_value(&event)?).await
    }

    async fn record_stats(&self, event: StatsEvent) -> Result<()> {
        self.append_entity(event.kind(), event.to_value()?).await
    }
}
