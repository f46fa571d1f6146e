// HTTP response helper functions shared by the route handlers

use hyper::http::response::Builder;
use hyper::{Body, Response, StatusCode};
use serde::Serialize;

/// Standard CORS headers
const CORS_ORIGIN: &str = "*";
const CORS_METHODS: &str = "GET, POST, OPTIONS";
const CORS_HEADERS: &str = "content-type, authorization";

fn with_cors(status: StatusCode) -> Builder {
    Response::builder()
        .status(status)
        .header("access-control-allow-origin", CORS_ORIGIN)
        .header("access-control-allow-methods", CORS_METHODS)
        .header("access-control-allow-headers", CORS_HEADERS)
}

fn finish(builder: Builder, body: Body) -> Response<Body> {
    builder.body(body).unwrap_or_else(|_| {
        let mut fallback = Response::new(Body::from(r#"{"error":"Invalid response"}"#));
        *fallback.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        fallback
    })
}

/// Build a JSON response with CORS headers
pub fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Body> {
    let json = serde_json::to_string(body)
        .unwrap_or_else(|_| r#"{"error":"Serialization failed"}"#.to_string());
    finish(
        with_cors(status).header("content-type", "application/json"),
        Body::from(json),
    )
}

/// Build a JSON error response: `{"error": message}`
pub fn json_error(status: StatusCode, message: &str) -> Response<Body> {
    json_response(status, &serde_json::json!({ "error": message }))
}

/// Build a JSON message response: `{"message": message}`
pub fn json_message(message: &str) -> Response<Body> {
    json_response(StatusCode::OK, &serde_json::json!({ "message": message }))
}

/// Binary attachment download
pub fn file_response(bytes: Vec<u8>, content_type: &str, filename: &str) -> Response<Body> {
    finish(
        with_cors(StatusCode::OK)
            .header("content-type", content_type)
            .header(
                "content-disposition",
                format!("attachment; filename=\"{filename}\""),
            ),
        Body::from(bytes),
    )
}

/// CORS preflight response
pub fn cors_preflight() -> Response<Body> {
    finish(with_cors(StatusCode::OK), Body::empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_json(response: Response<Body>) -> serde_json::Value {
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn json_error_escapes_quotes() {
        let response = json_error(StatusCode::BAD_REQUEST, r#"Error "quoted""#);
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response.headers()["access-control-allow-origin"],
            CORS_ORIGIN
        );
        assert_eq!(body_json(response).await["error"], r#"Error "quoted""#);
    }

    #[test]
    fn file_response_sets_attachment_name() {
        let response = file_response(vec![1, 2, 3], "model/gltf-binary", "scene.glb");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["content-disposition"],
            "attachment; filename=\"scene.glb\""
        );
    }

    #[test]
    fn preflight_is_ok() {
        assert_eq!(cors_preflight().status(), StatusCode::OK);
    }
}
