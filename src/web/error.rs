use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Machine-readable failure code attached to tasks that end in `error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Validation,
    ModelLoad,
    StageCompute,
    ExternalService,
    Cancelled,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::Validation => "validation",
            FailureReason::ModelLoad => "model_load",
            FailureReason::StageCompute => "stage_compute",
            FailureReason::ExternalService => "external_service",
            FailureReason::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{0}")]
    Validation(String),

    #[error("Model load failed: {0}")]
    ModelLoad(String),

    #[error("{0}")]
    StageCompute(String),

    #[error("External service error: {0}")]
    ExternalService(String),

    #[error("Task cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    pub fn reason(&self) -> FailureReason {
        match self {
            EngineError::Validation(_) => FailureReason::Validation,
            EngineError::ModelLoad(_) => FailureReason::ModelLoad,
            EngineError::ExternalService(_) => FailureReason::ExternalService,
            EngineError::Cancelled => FailureReason::Cancelled,
            EngineError::StageCompute(_) | EngineError::Io(_) | EngineError::Json(_) => {
                FailureReason::StageCompute
            }
        }
    }

    pub fn model_load(message: impl std::fmt::Display) -> Self {
        EngineError::ModelLoad(message.to_string())
    }

    pub fn stage(message: impl std::fmt::Display) -> Self {
        EngineError::StageCompute(message.to_string())
    }

    pub fn external(message: impl std::fmt::Display) -> Self {
        EngineError::ExternalService(message.to_string())
    }
}

impl From<image::ImageError> for EngineError {
    fn from(e: image::ImageError) -> Self {
        EngineError::StageCompute(format!("Image error: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Outcome of a failed task as it crosses the worker boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    pub reason: FailureReason,
    pub message: String,
}

impl TaskFailure {
    pub fn new(reason: FailureReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::new(FailureReason::Cancelled, "Task cancelled")
    }

    /// Message written to the status store for a failed task.
    pub fn status_message(&self) -> String {
        match self.reason {
            FailureReason::Cancelled => self.message.clone(),
            _ => format!("Error during processing: {}", self.message),
        }
    }
}

impl From<EngineError> for TaskFailure {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Cancelled => TaskFailure::cancelled(),
            other => TaskFailure::new(other.reason(), other.to_string()),
        }
    }
}
