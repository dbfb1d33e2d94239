//! Shared domain model: cameras, stats events and error events.
//!
//! Everything here is serialized camelCase because these records are what
//! the registry persists and what the webhook receives.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// A camera as the registry stores it: immutable identity plus the
/// mutable ownership fields the fleet writes (agentId, heartbeat).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Camera {
    pub id: String,
    pub vms_id: String,
    pub name: String,
    pub rtsp_url: String,
    pub framer_type: String,
    pub excluded: bool,
    pub agent_id: String,
    pub startup_time: i64,
    pub last_heartbeat: i64,
    pub uptime: i64,
}

impl Camera {
    /// A camera is orphaned when it has never been claimed or its owner's
    /// heartbeat went stale. Ownership is advisory; staleness is the only
    /// arbiter.
    pub fn is_orphaned(&self, now: i64, stale_after: Duration) -> bool {
        self.agent_id.is_empty() || now - self.last_heartbeat > stale_after.as_secs() as i64
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentsManagerStats {
    pub orphaned_requests: i64,
    pub orphaned_request_subscriptions: i64,
    pub orphaned_request_unsubscriptions: i64,
    pub unaccommodated_cameras: i64,
    pub running_agents: i64,
    pub running_agents_uptime: i64,
    pub avg_running_agents_per_min: f64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentStats {
    pub id: String,
    pub camera: String,
    pub uptime: i64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FramerStats {
    pub name: String,
    pub camera: String,
    pub frames: i64,
    pub skipped_frames: i64,
    pub errors: i64,
    pub uptime: i64,
    pub fps: i64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StreamerStats {
    pub name: String,
    /// Worker index within the streamer's pool; -1 for single-worker stages.
    pub worker: i32,
    pub camera: String,
    pub frames: i64,
    pub errors: i64,
    pub dropped_alerts: i64,
    pub uptime: i64,
    pub fps: i64,
    pub avg_proc_time: f64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AlerterStats {
    pub name: String,
    pub alerts: i64,
    pub errors: i64,
    pub uptime: i64,
    pub timestamp: i64,
}

/// The one stats stream every component writes to. The registry fans each
/// variant out to its own persisted series.
#[derive(Debug, Clone)]
pub enum StatsEvent {
    AgentsManager(AgentsManagerStats),
    Agent(AgentStats),
    Framer(FramerStats),
    Streamer(StreamerStats),
    Alerter(AlerterStats),
}

impl StatsEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            StatsEvent::AgentsManager(_) => "agents-manager-stats",
            StatsEvent::Agent(_) => "agent-stats",
            StatsEvent::Framer(_) => "framer-stats",
            StatsEvent::Streamer(_) => "streamer-stats",
            StatsEvent::Alerter(_) => "alerter-stats",
        }
    }

    pub fn to_value(&self) -> serde_json::Result<serde_json::Value> {
        match self {
            StatsEvent::AgentsManager(s) => serde_json::to_value(s),
            StatsEvent::Agent(s) => serde_json::to_value(s),
            StatsEvent::Framer(s) => serde_json::to_value(s),
            StatsEvent::Streamer(s) => serde_json::to_value(s),
            StatsEvent::Alerter(s) => serde_json::to_value(s),
        }
    }
}

/// A recorded failure from any processor in the pod. Write-only to the
/// registry; never aborts the pod.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEvent {
    pub timestamp: i64,
    pub processor: String,
    #[serde(rename = "innerError")]
    pub inner: String,
    pub message: String,
    pub stack_trace: String,
    #[serde(default)]
    pub misc: BTreeMap<String, serde_json::Value>,
}

impl ErrorEvent {
    pub fn new(
        processor: &str,
        inner: &dyn std::fmt::Display,
        message: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now().timestamp(),
            processor: processor.to_string(),
            inner: inner.to_string(),
            message: message.into(),
            stack_trace: std::backtrace::Backtrace::force_capture().to_string(),
            misc: BTreeMap::new(),
        }
    }

    pub fn with_misc(mut self, key: &str, value: serde_json::Value) -> Self {
        self.misc.insert(key.to_string(), value);
        self
    }
}

/// Payload posted to the alert webhook. Field spellings are part of the
/// wire contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub source: String,
    #[serde(rename = "alertImageURL")]
    pub alert_image_url: String,
    #[serde(rename = "alertClipURL")]
    pub alert_clip_url: String,
    pub label: String,
    pub confidence: f32,
    /// RFC3339.
    pub timestamp: String,
}
