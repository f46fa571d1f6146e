// Submission route handler
//
// POST /process?seg_mode=box|label&boxes_json=..&labels=..&detect_threshold=..
//               &polygon_refinement=..&edit_prompt=..
// Body is the raw image with an image/* content type.

use hyper::header::CONTENT_TYPE;
use hyper::{Body, Request, Response, StatusCode};
use std::convert::Infallible;

use crate::web::error::EngineError;
use crate::web::executor::SharedExecutor;
use crate::web::models::ProcessResponse;
use crate::web::request_parsing::{check_content_length, parse_submission, read_body_bytes};
use crate::web::response_helpers::{json_error, json_response};
use crate::{sys_error, sys_info, sys_warn};

pub async fn handle_process(
    req: Request<Body>,
    executor: SharedExecutor,
) -> Result<Response<Body>, Infallible> {
    let content_type = req
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let query = req.uri().query().unwrap_or_default().to_string();

    let limit = executor.config().max_upload_bytes();
    if let Err(error_response) = check_content_length(req.headers(), limit) {
        return Ok(error_response);
    }
    let body = match read_body_bytes(req.into_body(), limit).await {
        Ok(bytes) => bytes,
        Err(error_response) => return Ok(error_response),
    };

    let submission = match parse_submission(content_type.as_deref(), &query, body) {
        Ok(submission) => submission,
        Err(e) => {
            sys_warn!("[PROCESS] Rejected submission: {}", e);
            return Ok(json_error(StatusCode::BAD_REQUEST, &e.to_string()));
        }
    };

    match executor.submit(submission) {
        Ok(task_id) => {
            sys_info!("[PROCESS] Task {} queued", task_id);
            Ok(json_response(
                StatusCode::OK,
                &ProcessResponse {
                    status_url: format!("/status/{task_id}"),
                    task_id,
                },
            ))
        }
        Err(EngineError::Validation(message)) => Ok(json_error(StatusCode::BAD_REQUEST, &message)),
        Err(e) => {
            sys_error!("[PROCESS] Failed to queue task: {}", e);
            Ok(json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("Failed to queue task: {e}"),
            ))
        }
    }
}
