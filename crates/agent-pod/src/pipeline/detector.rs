//! YOLOv5-style object detector streamer backed by ONNX Runtime.
//!
//! Each worker loads its own session: the model handle is not assumed
//! thread-safe, and per-worker handles keep memory footprint
//! predictable. Workers share one per-label cooldown gate.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use image::imageops::FilterType;
use image::RgbImage;
use ndarray::{Array, IxDyn};
use ort::{
    session::{builder::GraphOptimizationLevel, Session},
    value::Value,
};
use tokio::sync::mpsc;
use tracing::debug;

use common::config::{StreamerParameters, DETECTOR_STREAMER};
use common::frame::Frame;
use common::model::Camera;

use super::streamer::{
    abort_streamer, spawn_worker_pool, FrameWorker, Streamer, StreamerContext, WorkerFactory,
};
use super::{push_alert, Alert};

/// Model input edge length.
const INPUT_SIZE: u32 = 640;

#[derive(Default)]
pub struct DetectorStreamer;

impl Streamer for DetectorStreamer {
    fn name(&self) -> &'static str {
        DETECTOR_STREAMER
    }

    fn spawn(&self, ctx: StreamerContext) -> mpsc::Sender<Frame> {
        let params = ctx.services.config.streamer_parameters(DETECTOR_STREAMER);

        if !params.model_path.exists() {
            return abort_streamer(
                &ctx,
                DETECTOR_STREAMER,
                anyhow::anyhow!("no model exists at {}", params.model_path.display()),
            );
        }
        let labels = match load_labels(&params.coco_names_path) {
            Ok(labels) => Arc::new(labels),
            Err(err) => return abort_streamer(&ctx, DETECTOR_STREAMER, err),
        };

        let factory = Arc::new(DetectorWorkerFactory {
            params: Arc::new(params.clone()),
            labels,
            allowed: Arc::new(allowed_set(&params.allowed_labels)),
            gate: Arc::new(CooldownGate::new(params.cool_down_period)),
            camera: ctx.camera.clone(),
            alert_tx: ctx.alert_tx.clone(),
        });
        spawn_worker_pool(DETECTOR_STREAMER, &ctx, factory)
    }
}

struct DetectorWorkerFactory {
    params: Arc<StreamerParameters>,
    labels: Arc<Vec<String>>,
    allowed: Arc<HashSet<String>>,
    gate: Arc<CooldownGate>,
    camera: Camera,
    alert_tx: mpsc::Sender<Alert>,
}

impl WorkerFactory for DetectorWorkerFactory {
    fn make(&self, worker: usize) -> Box<dyn FrameWorker> {
        Box::new(DetectorWorker {
            worker,
            params: Arc::clone(&self.params),
            labels: Arc::clone(&self.labels),
            allowed: Arc::clone(&self.allowed),
            gate: Arc::clone(&self.gate),
            camera: self.camera.clone(),
            alert_tx: self.alert_tx.clone(),
            session: None,
            dropped_alerts: 0,
        })
    }
}

struct DetectorWorker {
    worker: usize,
    params: Arc<StreamerParameters>,
    labels: Arc<Vec<String>>,
    allowed: Arc<HashSet<String>>,
    gate: Arc<CooldownGate>,
    camera: Camera,
    alert_tx: mpsc::Sender<Alert>,
    session: Option<Session>,
    dropped_alerts: i64,
}

#[async_trait]
impl FrameWorker for DetectorWorker {
    async fn init(&mut self) -> Result<()> {
        // The session is per worker on purpose; see module docs.
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .commit_from_file(&self.params.model_path)
            .with_context(|| {
                format!(
                    "worker {}: error reading model {}",
                    self.worker,
                    self.params.model_path.display()
                )
            })?;
        self.session = Some(session);
        Ok(())
    }

    async fn process(&mut self, frame: Frame) -> Result<()> {
        if frame.is_empty() {
            return Ok(());
        }
        let (frame_w, frame_h) = (frame.width(), frame.height());

        let input = preprocess(&frame.image, INPUT_SIZE);
        let session = self.session.as_mut().context("model not initialized")?;
        let input_tensor = Value::from_array(input)?;
        let outputs = session.run(ort::inputs![input_tensor])?;
        let output = outputs.get("output").context("no output tensor found")?;
        let (shape, data) = output.try_extract_tensor::<f32>()?;

        let dims: Vec<usize> = shape.as_ref().iter().map(|&d| d as usize).collect();
        anyhow::ensure!(
            dims.len() == 3 && dims[2] > 5,
            "unexpected detector output shape {dims:?}"
        );
        let stride = dims[2];

        let mut best: Option<Detection> = None;
        for (index, row) in data.chunks_exact(stride).enumerate() {
            let Some(detection) = decode_row(
                row,
                &self.labels,
                &self.allowed,
                self.params.object_confidence_threshold,
                self.params.confidence_threshold,
                frame_w,
                frame_h,
            ) else {
                continue;
            };
            if self.params.logging {
                debug!(
                    row = index,
                    label = %detection.label,
                    object_confidence = detection.object_confidence,
                    class_confidence = detection.class_confidence,
                    confidence = detection.confidence,
                    "detection candidate"
                );
            }
            best = match best {
                Some(current) if current.confidence >= detection.confidence => Some(current),
                _ => Some(detection),
            };
        }

        let Some(detection) = best else {
            return Ok(());
        };
        if !self.gate.should_alert(&detection.label) {
            return Ok(());
        }

        let alert = Alert {
            frame: Some(frame.clone()),
            frame_url: String::new(),
            clip_url: String::new(),
            camera: self.camera.clone(),
            label: detection.label,
            confidence: detection.confidence,
            timestamp: Utc::now(),
        };
        push_alert(&self.alert_tx, &self.camera.name, alert, &mut self.dropped_alerts);
        Ok(())
    }

    fn dropped_alerts(&self) -> i64 {
        self.dropped_alerts
    }
}

/// A decoded candidate from one output row.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub label: String,
    pub object_confidence: f32,
    pub class_confidence: f32,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundingBox {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

/// Decode one `[cx, cy, w, h, objConf, class...]` row. Returns the best
/// allowed-class candidate that clears both thresholds, with its box
/// scaled from normalized coordinates to the frame.
pub fn decode_row(
    row: &[f32],
    labels: &[String],
    allowed: &HashSet<String>,
    object_confidence_threshold: f32,
    confidence_threshold: f32,
    frame_width: u32,
    frame_height: u32,
) -> Option<Detection> {
    if row.len() < 5 || row.len() - 5 != labels.len() {
        return None;
    }

    let object_confidence = row[4];
    if object_confidence < object_confidence_threshold {
        return None;
    }

    let mut class_id = None;
    let mut class_confidence = 0.0f32;
    for (index, &score) in row[5..].iter().enumerate() {
        if !allowed.contains(&labels[index].to_ascii_lowercase()) {
            continue;
        }
        if score > class_confidence {
            class_confidence = score;
            class_id = Some(index);
        }
    }
    let class_id = class_id?;

    let confidence = object_confidence * class_confidence;
    if confidence < confidence_threshold {
        return None;
    }

    let cx = row[0] * frame_width as f32;
    let cy = row[1] * frame_height as f32;
    let w = row[2] * frame_width as f32;
    let h = row[3] * frame_height as f32;
    Some(Detection {
        label: labels[class_id].clone(),
        object_confidence,
        class_confidence,
        confidence,
        bbox: BoundingBox {
            x: (cx - w / 2.0) as i32,
            y: (cy - h / 2.0) as i32,
            width: w as i32,
            height: h as i32,
        },
    })
}

/// Per-label alert cooldown shared by one streamer's workers.
pub struct CooldownGate {
    period: Duration,
    last_alert_at: Mutex<HashMap<String, tokio::time::Instant>>,
}

impl CooldownGate {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            last_alert_at: Mutex::new(HashMap::new()),
        }
    }

    /// True when the label's cooldown has elapsed; records the alert time
    /// when it has.
    pub fn should_alert(&self, label: &str) -> bool {
        let now = tokio::time::Instant::now();
        let mut last_alert_at = self.last_alert_at.lock().unwrap();
        let due = last_alert_at
            .get(label)
            .map_or(true, |&at| now.duration_since(at) > self.period);
        if due {
            last_alert_at.insert(label.to_string(), now);
        }
        due
    }
}

/// Resize + 1/255 normalize into NCHW.
fn preprocess(image: &RgbImage, size: u32) -> Array<f32, IxDyn> {
    let resized = image::imageops::resize(image, size, size, FilterType::Triangle);
    let mut input = Array::zeros(IxDyn(&[1, 3, size as usize, size as usize]));
    for (x, y, pixel) in resized.enumerate_pixels() {
        input[[0, 0, y as usize, x as usize]] = pixel[0] as f32 / 255.0;
        input[[0, 1, y as usize, x as usize]] = pixel[1] as f32 / 255.0;
        input[[0, 2, y as usize, x as usize]] = pixel[2] as f32 / 255.0;
    }
    input
}

fn load_labels(path: &Path) -> Result<Vec<String>> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("error reading label list {}", path.display()))?;
    Ok(data
        .lines()
        .map(|line| line.trim().to_string())
        .filter(|line| !line.is_empty())
        .collect())
}

fn allowed_set(labels: &[String]) -> HashSet<String> {
    labels.iter().map(|l| l.to_ascii_lowercase()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels() -> Vec<String> {
        vec!["person".to_string(), "car".to_string()]
    }

    fn allowed() -> HashSet<String> {
        allowed_set(&["person".to_string()])
    }

    #[test]
    fn decode_row_picks_allowed_class() {
        // cx, cy, w, h, objConf, person, car
        let row = [0.5, 0.5, 0.2, 0.4, 0.9, 0.8, 0.95];
        let detection =
            decode_row(&row, &labels(), &allowed(), 0.5, 0.45, 640, 480).unwrap();
        // "car" scores higher but is not in the allow-list.
        assert_eq!(detection.label, "person");
        assert!((detection.confidence - 0.9 * 0.8).abs() < 1e-6);
        assert_eq!(detection.bbox.width, 128);
        assert_eq!(detection.bbox.height, 192);
        assert_eq!(detection.bbox.x, (0.5 * 640.0 - 64.0) as i32);
    }

    #[test]
    fn decode_row_skips_low_object_confidence() {
        let row = [0.5, 0.5, 0.2, 0.4, 0.3, 0.9, 0.0];
        assert!(decode_row(&row, &labels(), &allowed(), 0.5, 0.45, 640, 480).is_none());
    }

    #[test]
    fn decode_row_skips_low_final_confidence() {
        // objConf passes but objConf * classConf = 0.6 * 0.5 = 0.3 < 0.45.
        let row = [0.5, 0.5, 0.2, 0.4, 0.6, 0.5, 0.0];
        assert!(decode_row(&row, &labels(), &allowed(), 0.5, 0.45, 640, 480).is_none());
    }

    #[test]
    fn decode_row_skips_when_no_allowed_class_scores() {
        let row = [0.5, 0.5, 0.2, 0.4, 0.9, 0.0, 0.99];
        assert!(decode_row(&row, &labels(), &allowed(), 0.5, 0.45, 640, 480).is_none());
    }

    #[test]
    fn decode_row_rejects_malformed_rows() {
        let short = [0.5, 0.5, 0.2];
        assert!(decode_row(&short, &labels(), &allowed(), 0.5, 0.45, 640, 480).is_none());
        // Class count not matching the label list.
        let mismatched = [0.5, 0.5, 0.2, 0.4, 0.9, 0.8];
        assert!(decode_row(&mismatched, &labels(), &allowed(), 0.5, 0.45, 640, 480).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_gate_enforces_minimum_interval() {
        let gate = CooldownGate::new(Duration::from_secs(5));

        assert!(gate.should_alert("person"));
        assert!(!gate.should_alert("person"));

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(!gate.should_alert("person"));

        tokio::time::advance(Duration::from_millis(2_100)).await;
        assert!(gate.should_alert("person"));
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_gate_tracks_labels_independently() {
        let gate = CooldownGate::new(Duration::from_secs(5));

        assert!(gate.should_alert("person"));
        assert!(gate.should_alert("car"));
        assert!(!gate.should_alert("person"));
    }

    #[test]
    fn preprocess_produces_nchw_normalized_input() {
        let image = RgbImage::from_pixel(4, 4, image::Rgb([255, 0, 51]));
        let input = preprocess(&image, 8);
        assert_eq!(input.shape(), &[1, 3, 8, 8]);
        assert!((input[[0, 0, 0, 0]] - 1.0).abs() < 1e-6);
        assert!((input[[0, 1, 0, 0]]).abs() < 1e-6);
        assert!((input[[0, 2, 0, 0]] - 0.2).abs() < 1e-6);
    }
}
