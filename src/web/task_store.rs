use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::error::{FailureReason, TaskFailure};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Processing,
    Completed,
    Error,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Error)
    }
}

/// Latest known state of one task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    pub status: TaskStatus,
    pub message: String,
    pub progress: Option<f32>,
    pub result_locator: Option<String>,
    pub failure_reason: Option<FailureReason>,
    pub updated_at: DateTime<Utc>,
}

/// In-memory id → record map. Records are replaced whole and never evicted.
#[derive(Default)]
pub struct TaskStore {
    records: RwLock<HashMap<String, TaskRecord>>,
}

pub type SharedTaskStore = Arc<TaskStore>;

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(
        &self,
        task_id: &str,
        status: TaskStatus,
        message: impl Into<String>,
        progress: Option<f32>,
        result_locator: Option<String>,
    ) {
        self.put(
            task_id,
            TaskRecord {
                status,
                message: message.into(),
                progress,
                result_locator,
                failure_reason: None,
                updated_at: Utc::now(),
            },
        );
    }

    /// Terminal failure; keeps the last recorded progress.
    pub fn set_failed(&self, task_id: &str, failure: &TaskFailure) {
        let progress = self.get(task_id).and_then(|r| r.progress);
        self.put(
            task_id,
            TaskRecord {
                status: TaskStatus::Error,
                message: failure.status_message(),
                progress,
                result_locator: None,
                failure_reason: Some(failure.reason),
                updated_at: Utc::now(),
            },
        );
    }

    fn put(&self, task_id: &str, record: TaskRecord) {
        let mut records = self.records.write().unwrap_or_else(|p| p.into_inner());
        records.insert(task_id.to_string(), record);
    }

    pub fn get(&self, task_id: &str) -> Option<TaskRecord> {
        let records = self.records.read().unwrap_or_else(|p| p.into_inner());
        records.get(task_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_replaces_whole_record() {
        let store = TaskStore::new();
        store.set("t1", TaskStatus::Processing, "Generating 3D scene...", Some(0.5), None);
        store.set(
            "t1",
            TaskStatus::Completed,
            "done",
            Some(1.0),
            Some("/download/t1".to_string()),
        );

        let record = store.get("t1").unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
        assert_eq!(record.result_locator.as_deref(), Some("/download/t1"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn unknown_task_is_absent() {
        assert!(TaskStore::new().get("missing").is_none());
    }

    #[test]
    fn failure_keeps_progress_and_reason() {
        let store = TaskStore::new();
        store.set("t2", TaskStatus::Processing, "Loading 3D generation model...", Some(0.3), None);
        store.set_failed("t2", &TaskFailure::new(FailureReason::ModelLoad, "weights missing"));

        let record = store.get("t2").unwrap();
        assert_eq!(record.status, TaskStatus::Error);
        assert_eq!(record.progress, Some(0.3));
        assert_eq!(record.failure_reason, Some(FailureReason::ModelLoad));
        assert_eq!(record.message, "Error during processing: weights missing");
    }

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&TaskStatus::Queued).unwrap(), "\"queued\"");
        assert!(TaskStatus::Error.is_terminal());
        assert!(!TaskStatus::Processing.is_terminal());
    }
}
