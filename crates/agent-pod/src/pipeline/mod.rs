//! The per-camera streaming pipeline: agents, framers, streamer stages
//! and the alert path.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::warn;

use common::config::Config;
use common::frame::Frame;
use common::inference::Inference;
use common::model::{Camera, ErrorEvent};
use common::registry::Registry;
use common::storage::Storage;
use common::video::VideoSourceOpener;
use common::vms::Vms;
use common::webhook::Webhook;

pub mod agent;
pub mod alerter;
pub mod broadcaster;
pub mod detector;
pub mod framer;
pub mod recorder;
pub mod streamer;

/// Capacity of the pod-wide alert channel. Sends are non-blocking: under
/// saturation alerts drop, frames keep flowing.
pub const ALERT_CAPACITY: usize = 100;

/// The collaborators every pipeline component works against.
#[derive(Clone)]
pub struct Services {
    pub config: Arc<Config>,
    pub registry: Arc<dyn Registry>,
    pub storage: Arc<dyn Storage>,
    pub vms: Arc<dyn Vms>,
    pub inference: Arc<dyn Inference>,
    pub webhook: Arc<dyn Webhook>,
    pub video: Arc<dyn VideoSourceOpener>,
}

/// A detection on its way to the webhook. Holds its frame image until
/// the alerter has handled it.
#[derive(Debug)]
pub struct Alert {
    pub frame: Option<Frame>,
    pub frame_url: String,
    pub clip_url: String,
    pub camera: Camera,
    pub label: String,
    pub confidence: f32,
    pub timestamp: DateTime<Utc>,
}

/// Forward an error event to the mode loop. The channel closing during
/// shutdown is the only way this fails; the event is then only logged.
pub(crate) async fn emit_error(tx: &mpsc::Sender<ErrorEvent>, event: ErrorEvent) {
    if tx.send(event).await.is_err() {
        warn!("error channel closed, dropping error event");
    }
}

/// Non-blocking alert emission. A full channel drops the alert and counts
/// it; frame throughput is never sacrificed to alert delivery.
pub(crate) fn push_alert(
    alert_tx: &mpsc::Sender<Alert>,
    camera: &str,
    alert: Alert,
    dropped: &mut i64,
) {
    match alert_tx.try_send(alert) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(alert)) => {
            warn!(camera = %camera, "alertStream full, dropping alert");
            *dropped += 1;
            drop(alert);
        }
        Err(mpsc::error::TrySendError::Closed(alert)) => drop(alert),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn alert_push_never_blocks_and_counts_drops() {
        let (alert_tx, mut alert_rx) = mpsc::channel(1);
        let mut dropped = 0i64;

        let alert = || Alert {
            frame: None,
            frame_url: String::new(),
            clip_url: String::new(),
            camera: Camera::default(),
            label: "person".to_string(),
            confidence: 0.9,
            timestamp: chrono::Utc::now(),
        };

        push_alert(&alert_tx, "cam", alert(), &mut dropped);
        push_alert(&alert_tx, "cam", alert(), &mut dropped);
        push_alert(&alert_tx, "cam", alert(), &mut dropped);

        // One delivered, the overflow dropped without blocking.
        assert_eq!(dropped, 2);
        assert!(alert_rx.try_recv().is_ok());
        assert!(alert_rx.try_recv().is_err());
    }
}
