// Memory introspection and forced cleanup
//
// Both bypass the task executor and act on the registry directly.

use hyper::{Body, Response, StatusCode};
use std::convert::Infallible;
use tokio::task::spawn_blocking;

use crate::web::executor::SharedExecutor;
use crate::web::model_registry::try_lock_registry;
use crate::web::response_helpers::{json_error, json_response};
use crate::{sys_info, sys_warn};

/// GET /memory
pub async fn handle_memory(executor: SharedExecutor) -> Result<Response<Body>, Infallible> {
    let result = spawn_blocking(move || {
        let report = executor.memory_report();
        let models = match try_lock_registry(executor.registry()) {
            Some(registry) => serde_json::to_value(registry.status()).unwrap_or_default(),
            None => serde_json::Value::from("busy"),
        };
        (report, models)
    })
    .await;

    match result {
        Ok((report, models)) => {
            let mut json = serde_json::to_value(&report).unwrap_or_default();
            if let Some(obj) = json.as_object_mut() {
                obj.insert("text".to_string(), report.to_text().into());
                obj.insert("models".to_string(), models);
            }
            Ok(json_response(StatusCode::OK, &json))
        }
        Err(e) => {
            sys_warn!("[MEMORY] Report failed: {}", e);
            Ok(json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to collect memory information",
            ))
        }
    }
}

/// POST /cleanup
pub async fn handle_cleanup(executor: SharedExecutor) -> Result<Response<Body>, Infallible> {
    match spawn_blocking(move || executor.cleanup()).await {
        Ok(unloaded) => {
            sys_info!("[CLEANUP] Unloaded {} model groups", unloaded);
            Ok(json_response(
                StatusCode::OK,
                &serde_json::json!({
                    "message": "All models unloaded and memory freed",
                    "unloaded": unloaded,
                }),
            ))
        }
        Err(e) => {
            sys_warn!("[CLEANUP] Failed: {}", e);
            Ok(json_error(StatusCode::INTERNAL_SERVER_ERROR, "Cleanup failed"))
        }
    }
}
