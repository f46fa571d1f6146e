use serde::{Deserialize, Serialize};

use super::error::FailureReason;
use super::task_store::{TaskRecord, TaskStatus};

pub const DEFAULT_DETECT_THRESHOLD: f32 = 0.3;

/// Region prompt for the segmentation stage.
#[derive(Debug, Clone, PartialEq)]
pub enum SegmentationInput {
    /// Integer pixel rectangles `[x1, y1, x2, y2]`, never empty.
    Boxes(Vec<[i64; 4]>),
    /// Object names to detect, never empty.
    Labels { labels: Vec<String>, threshold: f32 },
}

impl SegmentationInput {
    pub fn describe(&self) -> String {
        match self {
            SegmentationInput::Boxes(boxes) => format!("{} boxes", boxes.len()),
            SegmentationInput::Labels { labels, .. } => format!("labels {}", labels.join(", ")),
        }
    }
}

/// A validated processing request.
#[derive(Debug, Clone)]
pub struct Submission {
    pub image: Vec<u8>,
    pub input: SegmentationInput,
    pub polygon_refinement: bool,
    pub edit_prompt: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessResponse {
    pub task_id: String,
    pub status_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: TaskStatus,
    pub message: String,
    pub progress: Option<f32>,
    pub model_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub failure_reason: Option<FailureReason>,
    pub updated_at: String,
}

impl From<TaskRecord> for StatusResponse {
    fn from(record: TaskRecord) -> Self {
        Self {
            status: record.status,
            message: record.message,
            progress: record.progress,
            model_url: record.result_locator,
            failure_reason: record.failure_reason,
            updated_at: record.updated_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiInfo {
    pub message: String,
    pub status: String,
}
