//! Pod configuration.
//!
//! Defaults are compiled in; every key can be overridden through the
//! environment (`.env` in dev). Per-streamer parameter blocks are keyed by
//! streamer name and resolved through `streamer_parameters`, with env
//! overrides prefixed by the upper-cased name (e.g. `DETECTOR_MODEL_PATH`).

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

pub const DETECTOR_STREAMER: &str = "detector";
pub const RECORDER_STREAMER: &str = "recorder";
pub const BROADCASTER_STREAMER: &str = "broadcaster";

#[derive(Debug, Clone)]
pub struct StreamerParameters {
    pub clip_duration: Duration,
    pub model_path: PathBuf,
    pub coco_names_path: PathBuf,
    pub object_confidence_threshold: f32,
    pub confidence_threshold: f32,
    pub cool_down_period: Duration,
    pub logging: bool,
    pub allowed_labels: Vec<String>,
}

impl Default for StreamerParameters {
    fn default() -> Self {
        Self {
            clip_duration: Duration::from_secs(6),
            model_path: PathBuf::from("./models/yolov5s.onnx"),
            coco_names_path: PathBuf::from("./models/coco.names"),
            object_confidence_threshold: 0.5,
            confidence_threshold: 0.45,
            cool_down_period: Duration::from_secs(5),
            logging: false,
            allowed_labels: vec!["person".to_string()],
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// How long a mode loop keeps draining stats/error events after
    /// cancellation before returning.
    pub mode_max_shutdown_time: Duration,
    pub max_agents_per_pod: usize,
    pub agent_periodic_timeout: Duration,
    pub agents_manager_periodic_timeout: Duration,
    pub agents_monitor_periodic_timeout: Duration,
    pub agents_monitor_max_orphaned_cameras: usize,
    pub agent_alerter_periodic_timeout: Duration,
    pub streamer_max_workers: usize,
    /// Heartbeats older than this make a camera look orphaned.
    pub orphan_stale_after: Duration,
    /// Pacing for the synthetic framer.
    pub synthetic_frame_interval: Duration,
    pub settings_folder: PathBuf,
    pub recordings_folder: PathBuf,
    pub webhook_url: Option<String>,
    pub streamers: HashMap<String, StreamerParameters>,
}

impl Default for Config {
    fn default() -> Self {
        let streamers = [DETECTOR_STREAMER, RECORDER_STREAMER, BROADCASTER_STREAMER]
            .iter()
            .map(|name| (name.to_string(), StreamerParameters::default()))
            .collect();
        Self {
            mode_max_shutdown_time: Duration::from_secs(5),
            max_agents_per_pod: 1,
            agent_periodic_timeout: Duration::from_secs(30),
            agents_manager_periodic_timeout: Duration::from_secs(30),
            agents_monitor_periodic_timeout: Duration::from_secs(30),
            agents_monitor_max_orphaned_cameras: 10,
            agent_alerter_periodic_timeout: Duration::from_secs(300),
            streamer_max_workers: 3,
            orphan_stale_after: Duration::from_secs(300),
            synthetic_frame_interval: Duration::from_millis(33),
            settings_folder: PathBuf::from("./settings"),
            recordings_folder: PathBuf::from("./recordings"),
            webhook_url: None,
            streamers,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.mode_max_shutdown_time =
            env_duration_secs("MODE_MAX_SHUTDOWN_TIME_SECS", config.mode_max_shutdown_time);
        config.max_agents_per_pod = env_usize("MAX_AGENTS_PER_POD", config.max_agents_per_pod);
        config.agent_periodic_timeout =
            env_duration_secs("AGENT_PERIODIC_TIMEOUT_SECS", config.agent_periodic_timeout);
        config.agents_manager_periodic_timeout = env_duration_secs(
            "AGENTS_MANAGER_PERIODIC_TIMEOUT_SECS",
            config.agents_manager_periodic_timeout,
        );
        config.agents_monitor_periodic_timeout = env_duration_secs(
            "AGENTS_MONITOR_PERIODIC_TIMEOUT_SECS",
            config.agents_monitor_periodic_timeout,
        );
        config.agents_monitor_max_orphaned_cameras = env_usize(
            "AGENTS_MONITOR_MAX_ORPHANED_CAMERAS",
            config.agents_monitor_max_orphaned_cameras,
        );
        config.agent_alerter_periodic_timeout = env_duration_secs(
            "AGENT_ALERTER_PERIODIC_TIMEOUT_SECS",
            config.agent_alerter_periodic_timeout,
        );
        config.streamer_max_workers =
            env_usize("STREAMER_MAX_WORKERS", config.streamer_max_workers);
        config.orphan_stale_after =
            env_duration_secs("ORPHAN_STALE_AFTER_SECS", config.orphan_stale_after);
        config.synthetic_frame_interval = env_duration_millis(
            "SYNTHETIC_FRAME_INTERVAL_MS",
            config.synthetic_frame_interval,
        );
        config.settings_folder = env_path("SETTINGS_FOLDER", config.settings_folder);
        config.recordings_folder = env_path("RECORDINGS_FOLDER", config.recordings_folder);
        config.webhook_url = env::var("WEBHOOK_URL").ok().filter(|v| !v.is_empty());

        for (name, params) in config.streamers.iter_mut() {
            let prefix = name.to_uppercase();
            params.clip_duration =
                env_duration_secs(&format!("{prefix}_CLIP_DURATION_SECS"), params.clip_duration);
            params.model_path =
                env_path(&format!("{prefix}_MODEL_PATH"), params.model_path.clone());
            params.coco_names_path = env_path(
                &format!("{prefix}_COCO_NAMES_PATH"),
                params.coco_names_path.clone(),
            );
            params.object_confidence_threshold = env_f32(
                &format!("{prefix}_OBJECT_CONFIDENCE_THRESHOLD"),
                params.object_confidence_threshold,
            );
            params.confidence_threshold = env_f32(
                &format!("{prefix}_CONFIDENCE_THRESHOLD"),
                params.confidence_threshold,
            );
            params.cool_down_period = env_duration_secs(
                &format!("{prefix}_COOL_DOWN_PERIOD_SECS"),
                params.cool_down_period,
            );
            params.logging = env_bool(&format!("{prefix}_LOGGING"), params.logging);
            if let Ok(labels) = env::var(format!("{prefix}_ALLOWED_LABELS")) {
                params.allowed_labels = labels
                    .split(',')
                    .map(|l| l.trim().to_string())
                    .filter(|l| !l.is_empty())
                    .collect();
            }
        }

        config
    }

    pub fn cameras_file(&self) -> PathBuf {
        self.settings_folder.join("cameras.json")
    }

    /// Parameters for a streamer by name; unknown names get defaults.
    pub fn streamer_parameters(&self, name: &str) -> StreamerParameters {
        self.streamers.get(name).cloned().unwrap_or_default()
    }
}

fn env_duration_secs(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

fn env_duration_millis(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_f32(key: &str, default: f32) -> f32 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_path(key: &str, default: PathBuf) -> PathBuf {
    env::var(key).map(PathBuf::from).unwrap_or(default)
}
