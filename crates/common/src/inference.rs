//! Clip-level inference collaborator plus the frame skip policy the
//! framer consults.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InferenceResult {
    pub fps: i64,
    pub score: String,
    pub alert_image_url: String,
}

#[async_trait]
pub trait Inference: Send + Sync {
    /// Runs the named model over content at `input_url` (typically a
    /// stored clip).
    async fn invoke(&self, model_name: &str, input_url: &str) -> Result<InferenceResult>;

    /// Whether the framer may drop the frame at this index without
    /// routing it downstream.
    fn can_skip_frame(&self, frame_index: u64) -> bool;
}

/// Dev inference: never skips, never alerts.
pub struct FakeInference;

#[async_trait]
impl Inference for FakeInference {
    async fn invoke(&self, _model_name: &str, _input_url: &str) -> Result<InferenceResult> {
        Ok(InferenceResult::default())
    }

    fn can_skip_frame(&self, _frame_index: u64) -> bool {
        false
    }
}
