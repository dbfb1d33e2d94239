//! Dev orphan source: walks a snapshot of all cameras, emitting one
//! every five seconds and wrapping around. Lets a single pod exercise
//! the manager loop without a monitor.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::info;

use common::model::Camera;
use common::registry::Registry;

use super::{OrphanError, OrphanSource, ORPHAN_BATCH_CAPACITY};

pub const TIMED_ORPHAN_INTERVAL: Duration = Duration::from_secs(5);

pub struct TimedOrphanSource {
    cancel: CancellationToken,
    cameras: Vec<Camera>,
    subscription: Mutex<Option<CancellationToken>>,
}

impl TimedOrphanSource {
    /// Snapshots all registry cameras once; delivery cycles the snapshot.
    pub async fn new(cancel: CancellationToken, registry: Arc<dyn Registry>) -> Result<Self> {
        let cameras = registry
            .retrieve_cameras()
            .await
            .context("error retrieving cameras for the timed orphan source")?;
        Ok(Self::with_cameras(cancel, cameras))
    }

    pub fn with_cameras(cancel: CancellationToken, cameras: Vec<Camera>) -> Self {
        Self {
            cancel,
            cameras,
            subscription: Mutex::new(None),
        }
    }
}

#[async_trait]
impl OrphanSource for TimedOrphanSource {
    async fn subscribe(&self) -> Result<mpsc::Receiver<Vec<Camera>>, OrphanError> {
        let mut subscription = self.subscription.lock().await;
        if subscription.is_some() {
            return Err(OrphanError::AlreadySubscribed);
        }

        let sub_cancel = self.cancel.child_token();
        let (tx, rx) = mpsc::channel(ORPHAN_BATCH_CAPACITY);
        let cameras = self.cameras.clone();
        let delivery_cancel = sub_cancel.clone();
        tokio::spawn(async move {
            let mut index = 0usize;
            loop {
                tokio::select! {
                    _ = delivery_cancel.cancelled() => {
                        info!("timed orphan delivery cancelled");
                        return;
                    }
                    _ = tokio::time::sleep(TIMED_ORPHAN_INTERVAL) => {
                        if cameras.is_empty() {
                            continue;
                        }
                        if index >= cameras.len() {
                            index = 0;
                        }
                        if tx.send(vec![cameras[index].clone()]).await.is_err() {
                            return;
                        }
                        index += 1;
                    }
                }
            }
        });

        *subscription = Some(sub_cancel);
        Ok(rx)
    }

    async fn unsubscribe(&self) -> Result<(), OrphanError> {
        let mut subscription = self.subscription.lock().await;
        match subscription.take() {
            Some(sub_cancel) => {
                sub_cancel.cancel();
                Ok(())
            }
            None => Err(OrphanError::NotSubscribed),
        }
    }

    async fn publish(&self, _batch: Vec<Camera>) -> Result<(), OrphanError> {
        // Delivery is timer-driven here; published batches have no
        // audience.
        Ok(())
    }
}
