use crate::config::{TensorLayout, DEFAULT_THRESHOLD};
use crate::fingerprint::Fingerprint;
use crate::loader::ModelState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub id: String,
    pub name: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageInfo {
    pub width: u32,
    pub height: u32,
    pub format: String,
    pub fingerprint: Fingerprint,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Performance {
    pub inference_time_ms: u64,
    pub total_time_ms: u64,
    pub cached: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Secondary analysis attached when `enhanced_analysis` is requested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Enrichment {
    pub label: String,
    pub object_location: BoundingBox,
    pub coverage: f64,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecognitionResult {
    pub predictions: Vec<Prediction>,
    pub has_match: bool,
    pub top_match: Option<Prediction>,
    pub image_info: ImageInfo,
    pub performance: Performance,
    /// Threshold `predictions` were ranked against.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enrichment: Option<Enrichment>,
}

impl RecognitionResult {
    /// `predictions` must already be ranked; the first entry becomes the top match.
    pub fn from_ranked(
        predictions: Vec<Prediction>,
        image_info: ImageInfo,
        inference_time_ms: u64,
    ) -> Self {
        let top_match = predictions.first().cloned();
        Self {
            has_match: top_match.is_some(),
            top_match,
            predictions,
            image_info,
            performance: Performance {
                inference_time_ms,
                total_time_ms: 0,
                cached: false,
            },
            threshold: None,
            enrichment: None,
        }
    }

    /// Narrows a result ranked at a lower threshold to `threshold`. `None`
    /// when `threshold` is below the one it was ranked at (or unknown), since
    /// classes dropped then cannot be restored.
    pub fn narrowed_to(mut self, threshold: f64) -> Option<Self> {
        let ranked_at = self.threshold?;
        if threshold < ranked_at {
            return None;
        }
        self.predictions.retain(|p| p.confidence >= threshold);
        self.top_match = self.predictions.first().cloned();
        self.has_match = self.top_match.is_some();
        self.threshold = Some(threshold);
        Some(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecognizeOptions {
    pub threshold: f64,
    pub use_cache: bool,
    pub enhanced_analysis: bool,
}

impl Default for RecognizeOptions {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            use_cache: true,
            enhanced_analysis: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceIndexEntry {
    pub filename: String,
    pub fingerprint: Fingerprint,
    pub predictions: Vec<Prediction>,
    pub has_match: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexFailure {
    pub filename: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexReport {
    pub report_id: String,
    pub root: String,
    pub total: usize,
    pub processed: usize,
    pub failed: usize,
    pub entries: Vec<ReferenceIndexEntry>,
    pub errors: Vec<IndexFailure>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    pub state: ModelState,
    pub provider: Option<String>,
    pub label_count: usize,
    pub input_size: u32,
    pub tensor_layout: TensorLayout,
}
