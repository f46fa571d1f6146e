use hyper::{Body, Response, StatusCode};
use std::convert::Infallible;

use crate::web::executor::{CancelOutcome, SharedExecutor};
use crate::web::models::StatusResponse;
use crate::web::response_helpers::{json_error, json_message, json_response};

/// GET /status/{task_id}
pub async fn handle_status(
    task_id: &str,
    executor: SharedExecutor,
) -> Result<Response<Body>, Infallible> {
    match executor.status(task_id) {
        Some(record) => Ok(json_response(StatusCode::OK, &StatusResponse::from(record))),
        None => Ok(json_error(StatusCode::NOT_FOUND, "Task not found")),
    }
}

/// POST /cancel/{task_id}
pub async fn handle_cancel(
    task_id: &str,
    executor: SharedExecutor,
) -> Result<Response<Body>, Infallible> {
    match executor.cancel(task_id) {
        CancelOutcome::Requested => Ok(json_message("Cancellation requested")),
        CancelOutcome::AlreadyFinished => Ok(json_message("Task already finished")),
        CancelOutcome::NotFound => Ok(json_error(StatusCode::NOT_FOUND, "Task not found")),
    }
}
