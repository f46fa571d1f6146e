//! Artifact download.
//!
//! GET /download/{task_id} returns the textured scene as GLB bytes.
//! 404 for unknown tasks or a missing file, 400 while the task is unfinished.

use hyper::{Body, Response, StatusCode};
use std::convert::Infallible;

use crate::sys_error;
use crate::web::executor::{ArtifactError, SharedExecutor};
use crate::web::response_helpers::{file_response, json_error};

pub const GLB_CONTENT_TYPE: &str = "application/octet-stream";

pub async fn handle_download(
    task_id: &str,
    executor: SharedExecutor,
) -> Result<Response<Body>, Infallible> {
    let path = match executor.artifact(task_id) {
        Ok(path) => path,
        Err(ArtifactError::NotFound) => {
            return Ok(json_error(StatusCode::NOT_FOUND, "Task not found"))
        }
        Err(ArtifactError::NotCompleted) => {
            return Ok(json_error(StatusCode::BAD_REQUEST, "Task not completed yet"))
        }
        Err(ArtifactError::FileMissing) => {
            return Ok(json_error(StatusCode::NOT_FOUND, "Model file not found"))
        }
    };

    match tokio::fs::read(&path).await {
        Ok(bytes) => Ok(file_response(
            bytes,
            GLB_CONTENT_TYPE,
            &format!("scene_forge_{task_id}.glb"),
        )),
        Err(e) => {
            sys_error!("[DOWNLOAD] Failed to read {}: {}", path.display(), e);
            Ok(json_error(StatusCode::NOT_FOUND, "Model file not found"))
        }
    }
}
