// Route handler modules

pub mod download;
pub mod health;
pub mod process;
pub mod status;
pub mod system;

use hyper::{Body, Method, Request, Response, StatusCode};
use std::convert::Infallible;

use crate::sys_debug;
use crate::web::executor::SharedExecutor;
use crate::web::request_parsing::extract_path_param;
use crate::web::response_helpers::{cors_preflight, json_error};

/// Dispatch one request to its handler.
pub async fn handle_request(
    req: Request<Body>,
    executor: SharedExecutor,
) -> Result<Response<Body>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    sys_debug!("[HTTP] {} {}", method, path);

    match (&method, path.as_str()) {
        (&Method::OPTIONS, _) => Ok(cors_preflight()),
        (&Method::GET, "/") => health::handle_root().await,
        (&Method::GET, "/health") => health::handle_health(executor).await,
        (&Method::POST, "/process") => process::handle_process(req, executor).await,
        (&Method::GET, "/memory") => system::handle_memory(executor).await,
        (&Method::POST, "/cleanup") => system::handle_cleanup(executor).await,
        (&Method::GET, p) if p.starts_with("/status/") => match extract_path_param(p, "/status/") {
            Some(id) => status::handle_status(id, executor).await,
            None => Ok(json_error(StatusCode::BAD_REQUEST, "Missing task id")),
        },
        (&Method::POST, p) if p.starts_with("/cancel/") => match extract_path_param(p, "/cancel/") {
            Some(id) => status::handle_cancel(id, executor).await,
            None => Ok(json_error(StatusCode::BAD_REQUEST, "Missing task id")),
        },
        (&Method::GET, p) if p.starts_with("/download/") => {
            match extract_path_param(p, "/download/") {
                Some(id) => download::handle_download(id, executor).await,
                None => Ok(json_error(StatusCode::BAD_REQUEST, "Missing task id")),
            }
        }
        _ => Ok(json_error(StatusCode::NOT_FOUND, "Not found")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::web::device::Accelerator;
    use crate::web::executor::TaskExecutor;
    use crate::web::mock_backend::{remove_test_dirs, test_config, MockBackends, MockFaults};
    use image::{ImageFormat, RgbImage};
    use std::io::Cursor;
    use std::sync::Arc;
    use std::time::Duration;

    fn executor() -> SharedExecutor {
        let config = Arc::new(test_config());
        let accelerator = Arc::new(Accelerator::cuda(config.accelerator_capacity_bytes()));
        let backends = MockBackends::new(MockFaults::default()).backends();
        Arc::new(TaskExecutor::new(config, accelerator, backends).unwrap())
    }

    fn png() -> Vec<u8> {
        let mut bytes = Cursor::new(Vec::new());
        RgbImage::from_pixel(32, 32, image::Rgb([10, 20, 30]))
            .write_to(&mut bytes, ImageFormat::Png)
            .unwrap();
        bytes.into_inner()
    }

    async fn send(
        executor: &SharedExecutor,
        req: Request<Body>,
    ) -> (StatusCode, serde_json::Value) {
        let response = handle_request(req, Arc::clone(executor)).await.unwrap();
        let status = response.status();
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null))
    }

    fn get(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    fn process(query: &str, body: Vec<u8>) -> Request<Body> {
        Request::post(format!("/process?{query}"))
            .header("content-type", "image/png")
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn submit_poll_download() {
        let executor = executor();
        let query = format!(
            "seg_mode=box&boxes_json={}",
            urlencoding::encode(r#"[{"x1":10,"y1":10,"x2":50,"y2":50}]"#)
        );
        let (status, body) = send(&executor, process(&query, png())).await;
        assert_eq!(status, StatusCode::OK);
        let task_id = body["task_id"].as_str().unwrap().to_string();
        assert_eq!(body["status_url"], format!("/status/{task_id}"));

        let mut last = serde_json::Value::Null;
        for _ in 0..1000 {
            let (code, body) = send(&executor, get(&format!("/status/{task_id}"))).await;
            assert_eq!(code, StatusCode::OK);
            if body["status"] == "completed" || body["status"] == "error" {
                last = body;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(last["status"], "completed", "{last}");
        assert_eq!(last["model_url"], format!("/download/{task_id}"));

        let response = handle_request(get(&format!("/download/{task_id}")), Arc::clone(&executor))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        assert_eq!(&bytes[0..4], b"glTF");
        remove_test_dirs(executor.config());
    }

    #[tokio::test]
    async fn invalid_submissions_are_rejected_synchronously() {
        let executor = executor();

        let empty_boxes = process("seg_mode=box&boxes_json=%5B%5D", png());
        let (status, body) = send(&executor, empty_boxes).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("at least one box"));

        let (status, _) = send(&executor, process("seg_mode=label&labels=", png())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let req = Request::post("/process?seg_mode=label&labels=chair")
            .header("content-type", "text/plain")
            .body(Body::from("hello"))
            .unwrap();
        let (status, _) = send(&executor, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        assert!(executor.store().is_empty());
        remove_test_dirs(executor.config());
    }

    #[tokio::test]
    async fn oversized_uploads_get_413() {
        let executor = executor();
        let limit = executor.config().max_upload_bytes();

        let declared = Request::post("/process?seg_mode=label&labels=chair")
            .header("content-type", "image/png")
            .header("content-length", (limit + 1).to_string())
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&executor, declared).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert!(body["error"].as_str().unwrap().contains("50 MB"));

        // no declared length: the read stops once the limit is crossed
        let chunk = vec![0u8; 1024 * 1024];
        let chunks = (0..=limit / chunk.len() as u64)
            .map(move |_| Ok::<_, std::io::Error>(chunk.clone()));
        let streamed = Request::post("/process?seg_mode=label&labels=chair")
            .header("content-type", "image/png")
            .body(Body::wrap_stream(futures_util::stream::iter(chunks)))
            .unwrap();
        let (status, _) = send(&executor, streamed).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);

        assert!(executor.store().is_empty());
        remove_test_dirs(executor.config());
    }

    #[tokio::test]
    async fn unknown_task_routes_return_404() {
        let executor = executor();
        for req in [
            get("/status/missing"),
            get("/download/missing"),
            Request::post("/cancel/missing").body(Body::empty()).unwrap(),
            get("/nowhere"),
        ] {
            let (status, body) = send(&executor, req).await;
            assert_eq!(status, StatusCode::NOT_FOUND);
            assert!(body["error"].is_string());
        }
        remove_test_dirs(executor.config());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn admin_endpoints() {
        let executor = executor();

        let (status, body) = send(&executor, get("/")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "active");

        let (status, body) = send(&executor, get("/memory")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["text"].as_str().unwrap().contains("GPU Memory"));
        assert_eq!(body["models"][0]["state"], "absent");

        let req = Request::post("/cleanup").body(Body::empty()).unwrap();
        let (status, body) = send(&executor, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["unloaded"], 0);
        remove_test_dirs(executor.config());
    }
}
