// Health check route handlers

use hyper::{Body, Response, StatusCode};
use std::convert::Infallible;

use crate::web::executor::SharedExecutor;
use crate::web::model_registry::try_lock_registry;
use crate::web::models::ApiInfo;
use crate::web::response_helpers::json_response;

pub async fn handle_root() -> Result<Response<Body>, Infallible> {
    Ok(json_response(
        StatusCode::OK,
        &ApiInfo {
            message: "Scene Forge API is running".to_string(),
            status: "active".to_string(),
        },
    ))
}

pub async fn handle_health(executor: SharedExecutor) -> Result<Response<Body>, Infallible> {
    let models = match try_lock_registry(executor.registry()) {
        Some(registry) => serde_json::to_value(registry.status()).unwrap_or_default(),
        None => serde_json::Value::from("busy"),
    };
    Ok(json_response(
        StatusCode::OK,
        &serde_json::json!({
            "status": "ok",
            "service": "scene-forge",
            "tasks": executor.store().len(),
            "models": models,
        }),
    ))
}
