// Request parsing utilities for HTTP handlers

use hyper::body::HttpBody;
use hyper::header::CONTENT_LENGTH;
use hyper::{Body, HeaderMap, Response, StatusCode};
use std::collections::HashMap;

use super::error::{EngineError, Result};
use super::models::{SegmentationInput, Submission, DEFAULT_DETECT_THRESHOLD};
use super::response_helpers::json_error;

// Import logging macros
use crate::{sys_error, sys_warn};

fn too_large(limit: u64) -> Response<Body> {
    json_error(
        StatusCode::PAYLOAD_TOO_LARGE,
        &format!("Upload exceeds the {} MB limit", limit / (1024 * 1024)),
    )
}

/// Reject a request whose declared `Content-Length` is over `limit` bytes.
pub fn check_content_length(
    headers: &HeaderMap,
    limit: u64,
) -> std::result::Result<(), Response<Body>> {
    let declared = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());
    match declared {
        Some(length) if length > limit => {
            sys_warn!("[REQUEST] Declared body of {} bytes exceeds {}", length, limit);
            Err(too_large(limit))
        }
        _ => Ok(()),
    }
}

/// Read the request body, stopping as soon as it grows past `limit` bytes.
pub async fn read_body_bytes(
    mut body: Body,
    limit: u64,
) -> std::result::Result<Vec<u8>, Response<Body>> {
    let mut bytes = Vec::new();
    while let Some(chunk) = body.data().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                sys_error!("[REQUEST] Failed to read request body: {}", e);
                return Err(json_error(StatusCode::BAD_REQUEST, "Failed to read request body"));
            }
        };
        if (bytes.len() + chunk.len()) as u64 > limit {
            sys_warn!("[REQUEST] Body exceeded {} bytes, aborting read", limit);
            return Err(too_large(limit));
        }
        bytes.extend_from_slice(&chunk);
    }
    Ok(bytes)
}

/// Decode a query string into key/value pairs. `+` decodes to a space.
pub fn parse_query(query: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    for pair in query.trim_start_matches('?').split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let decode = |s: &str| {
            let spaced = s.replace('+', " ");
            urlencoding::decode(&spaced)
                .map(|d| d.into_owned())
                .unwrap_or(spaced)
        };
        params.insert(decode(key), decode(value));
    }
    params
}

/// Path segment after `prefix`, if non-empty and without further slashes.
pub fn extract_path_param<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    path.strip_prefix(prefix)
        .filter(|rest| !rest.is_empty() && !rest.contains('/'))
}

fn validation(message: impl Into<String>) -> EngineError {
    EngineError::Validation(message.into())
}

/// Parse one coordinate; integral floats are accepted, fractions are not.
fn parse_coordinate(value: &serde_json::Value) -> Result<i64> {
    if let Some(v) = value.as_i64() {
        return Ok(v);
    }
    match value.as_f64() {
        Some(v) if v.fract() == 0.0 && v.is_finite() => Ok(v as i64),
        _ => Err(validation(format!(
            "Box coordinates must be integers, got {value}"
        ))),
    }
}

fn parse_box(value: &serde_json::Value) -> Result<[i64; 4]> {
    let coords: Vec<&serde_json::Value> = match value {
        serde_json::Value::Array(items) => items.iter().collect(),
        serde_json::Value::Object(map) => {
            let mut coords = Vec::with_capacity(4);
            for key in ["x1", "y1", "x2", "y2"] {
                let v = map.get(key).ok_or_else(|| {
                    validation(format!("Invalid box format: missing '{key}'"))
                })?;
                coords.push(v);
            }
            coords
        }
        other => return Err(validation(format!("Invalid box format: {other}"))),
    };

    if coords.len() != 4 {
        return Err(validation(
            "Each box must contain exactly 4 coordinates [x1, y1, x2, y2]",
        ));
    }
    Ok([
        parse_coordinate(coords[0])?,
        parse_coordinate(coords[1])?,
        parse_coordinate(coords[2])?,
        parse_coordinate(coords[3])?,
    ])
}

/// Parse `boxes_json`: a non-empty list of `[x1, y1, x2, y2]` arrays or
/// `{"x1":..,"y1":..,"x2":..,"y2":..}` objects.
pub fn parse_boxes_json(json: &str) -> Result<Vec<[i64; 4]>> {
    let value: serde_json::Value = serde_json::from_str(json)
        .map_err(|_| validation("Invalid JSON format for boxes_json"))?;
    let items = value
        .as_array()
        .ok_or_else(|| validation("boxes_json must be a list of boxes"))?;
    if items.is_empty() {
        return Err(validation("boxes_json must contain at least one box"));
    }
    items.iter().map(parse_box).collect()
}

/// Comma-split and trim; empty entries are dropped.
pub fn parse_labels(labels: &str) -> Vec<String> {
    labels
        .split(',')
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        other => Err(validation(format!("Invalid boolean value '{other}'"))),
    }
}

fn parse_threshold(value: Option<&String>) -> Result<f32> {
    let Some(raw) = value else {
        return Ok(DEFAULT_DETECT_THRESHOLD);
    };
    let threshold: f32 = raw
        .trim()
        .parse()
        .map_err(|_| validation(format!("detect_threshold must be a number, got '{raw}'")))?;
    if !(0.0..=1.0).contains(&threshold) {
        return Err(validation("detect_threshold must be between 0 and 1"));
    }
    Ok(threshold)
}

fn non_empty<'a>(params: &'a HashMap<String, String>, key: &str) -> Option<&'a String> {
    params.get(key).filter(|v| !v.trim().is_empty())
}

/// Validate a processing request. Checks run in order: content type, mode,
/// mode parameters, then the image bytes themselves.
pub fn parse_submission(
    content_type: Option<&str>,
    query: &str,
    body: Vec<u8>,
) -> Result<Submission> {
    let is_image = content_type
        .map(|ct| ct.trim().to_ascii_lowercase().starts_with("image/"))
        .unwrap_or(false);
    if !is_image {
        return Err(validation("Uploaded file is not an image"));
    }

    let params = parse_query(query);
    let mode = params.get("seg_mode").map(|m| m.trim()).unwrap_or("box");
    let input = match mode {
        "box" => {
            let boxes_json = non_empty(&params, "boxes_json")
                .ok_or_else(|| validation("boxes_json is required when seg_mode is 'box'"))?;
            if non_empty(&params, "labels").is_some() {
                return Err(validation("labels cannot be combined with seg_mode 'box'"));
            }
            SegmentationInput::Boxes(parse_boxes_json(boxes_json)?)
        }
        "label" => {
            let labels = parse_labels(params.get("labels").map(String::as_str).unwrap_or(""));
            if labels.is_empty() {
                return Err(validation("labels is required when seg_mode is 'label'"));
            }
            if non_empty(&params, "boxes_json").is_some() {
                return Err(validation("boxes_json cannot be combined with seg_mode 'label'"));
            }
            SegmentationInput::Labels {
                labels,
                threshold: parse_threshold(params.get("detect_threshold"))?,
            }
        }
        _ => return Err(validation("seg_mode must be either 'box' or 'label'")),
    };

    let polygon_refinement = match params.get("polygon_refinement") {
        Some(v) => parse_bool(v)?,
        None => true,
    };
    let edit_prompt = non_empty(&params, "edit_prompt").map(|p| p.trim().to_string());

    if body.is_empty() || image::guess_format(&body).is_err() {
        return Err(validation("Uploaded file is not a decodable image"));
    }

    Ok(Submission {
        image: body,
        input,
        polygon_refinement,
        edit_prompt,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG_MAGIC: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];

    fn submit(query: &str) -> Result<Submission> {
        parse_submission(Some("image/png"), query, PNG_MAGIC.to_vec())
    }

    fn message(result: Result<Submission>) -> String {
        match result {
            Err(EngineError::Validation(m)) => m,
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn box_mode_accepts_lists_and_objects() {
        let query = format!(
            "seg_mode=box&boxes_json={}",
            urlencoding::encode(r#"[[10, 20, 110, 220], {"x1": 1, "y1": 2, "x2": 3.0, "y2": 4}]"#)
        );
        let submission = submit(&query).unwrap();
        assert_eq!(
            submission.input,
            SegmentationInput::Boxes(vec![[10, 20, 110, 220], [1, 2, 3, 4]])
        );
        assert!(submission.polygon_refinement);
        assert!(submission.edit_prompt.is_none());
    }

    #[test]
    fn empty_box_list_is_rejected() {
        assert!(message(submit("seg_mode=box&boxes_json=%5B%5D")).contains("at least one box"));
    }

    #[test]
    fn malformed_boxes_are_rejected() {
        assert_eq!(
            message(submit("seg_mode=box&boxes_json=%5B1")),
            "Invalid JSON format for boxes_json"
        );
        assert_eq!(
            message(submit("seg_mode=box&boxes_json=%5B%5B1%2C2%2C3%5D%5D")),
            "Each box must contain exactly 4 coordinates [x1, y1, x2, y2]"
        );
        assert!(message(submit("seg_mode=box&boxes_json=%5B%5B1%2C2%2C3%2C4.5%5D%5D"))
            .contains("integers"));
        assert!(message(submit("seg_mode=box")).contains("boxes_json is required"));
    }

    #[test]
    fn label_mode_trims_and_requires_labels() {
        let query = "seg_mode=label&labels=chair%2C+table+%2C%2Clamp&detect_threshold=0.45";
        let submission = submit(query).unwrap();
        assert_eq!(
            submission.input,
            SegmentationInput::Labels {
                labels: vec!["chair".into(), "table".into(), "lamp".into()],
                threshold: 0.45,
            }
        );

        assert_eq!(
            message(submit("seg_mode=label&labels=")),
            "labels is required when seg_mode is 'label'"
        );
        assert!(message(submit("seg_mode=label&labels=chair&detect_threshold=1.5"))
            .contains("between 0 and 1"));
    }

    #[test]
    fn mixing_modes_is_rejected() {
        assert!(message(submit("seg_mode=box&boxes_json=%5B%5B0%2C0%2C1%2C1%5D%5D&labels=chair"))
            .contains("cannot be combined"));
        assert!(message(submit("seg_mode=label&labels=chair&boxes_json=%5B%5D"))
            .contains("cannot be combined"));
    }

    #[test]
    fn missing_mode_defaults_to_boxes() {
        let query = format!(
            "boxes_json={}",
            urlencoding::encode(r#"[{"x1":10,"y1":10,"x2":50,"y2":50}]"#)
        );
        assert_eq!(
            submit(&query).unwrap().input,
            SegmentationInput::Boxes(vec![[10, 10, 50, 50]])
        );
    }

    #[test]
    fn mode_and_content_type_are_checked_first() {
        assert_eq!(
            message(submit("seg_mode=polygon")),
            "seg_mode must be either 'box' or 'label'"
        );
        assert_eq!(
            message(parse_submission(
                Some("text/plain"),
                "seg_mode=label&labels=a",
                PNG_MAGIC.to_vec()
            )),
            "Uploaded file is not an image"
        );
        assert_eq!(
            message(parse_submission(None, "seg_mode=label&labels=a", PNG_MAGIC.to_vec())),
            "Uploaded file is not an image"
        );
    }

    #[test]
    fn undecodable_image_is_rejected() {
        let result =
            parse_submission(Some("image/png"), "seg_mode=label&labels=a", b"hello".to_vec());
        assert_eq!(message(result), "Uploaded file is not a decodable image");
    }

    #[test]
    fn options_are_parsed() {
        let query = "seg_mode=label&labels=sofa&polygon_refinement=false&edit_prompt=make+it+red";
        let submission = submit(query).unwrap();
        assert!(!submission.polygon_refinement);
        assert_eq!(submission.edit_prompt.as_deref(), Some("make it red"));
        assert!(message(submit("seg_mode=label&labels=sofa&polygon_refinement=maybe"))
            .contains("Invalid boolean"));
    }

    #[tokio::test]
    async fn streamed_body_over_limit_is_cut_off() {
        let chunks: Vec<std::result::Result<Vec<u8>, std::io::Error>> =
            vec![Ok(vec![0u8; 600]), Ok(vec![0u8; 600]), Ok(vec![0u8; 600])];
        let body = Body::wrap_stream(futures_util::stream::iter(chunks));
        let response = read_body_bytes(body, 1000).await.unwrap_err();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);

        let body = Body::from(vec![7u8; 1000]);
        assert_eq!(read_body_bytes(body, 1000).await.unwrap().len(), 1000);
    }

    #[test]
    fn declared_length_over_limit_is_rejected() {
        let mut headers = HeaderMap::new();
        assert!(check_content_length(&headers, 1000).is_ok());

        headers.insert(CONTENT_LENGTH, "1000".parse().unwrap());
        assert!(check_content_length(&headers, 1000).is_ok());

        headers.insert(CONTENT_LENGTH, "1001".parse().unwrap());
        let response = check_content_length(&headers, 1000).unwrap_err();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[test]
    fn path_params() {
        assert_eq!(extract_path_param("/status/abc", "/status/"), Some("abc"));
        assert_eq!(extract_path_param("/status/", "/status/"), None);
        assert_eq!(extract_path_param("/status/a/b", "/status/"), None);
    }
}
