//! Client for an external prompt-queue generation service: upload inputs,
//! queue a workflow, wait on its event stream, then fetch the outputs.

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::Read;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;

use super::backends::ImageEditor;
use super::config::EngineConfig;
use super::error::{EngineError, Result};

// Import logging macros
use crate::{log_debug, log_info, log_warn};

pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(300);
const POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_NEGATIVE_PROMPT: &str = "deformed, blurry, over saturation, bad anatomy, \
    disfigured, poorly drawn face, mutation, mutated, extra_limb, ugly, poorly drawn hands, \
    fused fingers, messy drawing, broken legs censor, censored, censor_bar";
const NEGATIVE_PROMPT_NODE: &str = "110";
const POSITIVE_PROMPT_NODE: &str = "111";

fn default_input_type() -> String {
    "input".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadedImage {
    pub name: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default = "default_input_type")]
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueuedPrompt {
    pub prompt_id: String,
    pub client_id: String,
}

/// A file produced by a workflow output node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputFile {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default)]
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub completed: bool,
    pub outputs: Vec<OutputFile>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    Progress { value: u64, max: u64 },
    Executing { node: Option<String>, prompt_id: Option<String> },
    Other,
}

/// Decode one stream message.
pub fn parse_event(text: &str) -> QueueEvent {
    let Ok(json) = serde_json::from_str::<Value>(text) else {
        return QueueEvent::Other;
    };
    let data = &json["data"];
    match json["type"].as_str() {
        Some("progress") => QueueEvent::Progress {
            value: data["value"].as_u64().unwrap_or(0),
            max: data["max"].as_u64().unwrap_or(0),
        },
        Some("executing") => QueueEvent::Executing {
            node: data["node"].as_str().map(str::to_string),
            prompt_id: data["prompt_id"].as_str().map(str::to_string),
        },
        _ => QueueEvent::Other,
    }
}

/// Pull the entry for `prompt_id` out of a `/history/{id}` response.
pub fn parse_history(json: &Value, prompt_id: &str) -> Option<HistoryEntry> {
    let entry = json.get(prompt_id)?;
    let mut outputs = Vec::new();
    if let Some(nodes) = entry["outputs"].as_object() {
        for node in nodes.values() {
            if let Some(images) = node["images"].as_array() {
                outputs.extend(
                    images
                        .iter()
                        .filter_map(|img| serde_json::from_value::<OutputFile>(img.clone()).ok()),
                );
            }
        }
    }
    let completed = entry["status"]["completed"]
        .as_bool()
        .unwrap_or(!outputs.is_empty());
    Some(HistoryEntry { completed, outputs })
}

/// Substitute prompt text and the input image into a workflow graph.
/// Only inputs that already exist are replaced.
pub fn replace_prompt_in_workflow(
    workflow: &Value,
    prompt: &str,
    image_name: Option<&str>,
    negative_prompt: &str,
) -> Value {
    let mut updated = workflow.clone();
    let Some(nodes) = updated.as_object_mut() else {
        return updated;
    };

    for (node_id, node) in nodes.iter_mut() {
        let class_type = node["class_type"].as_str().unwrap_or_default().to_string();
        let Some(inputs) = node.get_mut("inputs").and_then(Value::as_object_mut) else {
            continue;
        };
        match class_type.as_str() {
            "CLIPTextEncode" if inputs.contains_key("text") => {
                inputs.insert("text".to_string(), Value::from(prompt));
            }
            "LoadImage" if inputs.contains_key("image") => {
                if let Some(name) = image_name.filter(|n| !n.is_empty()) {
                    inputs.insert("image".to_string(), Value::from(name));
                }
            }
            "TextEncodeQwenImageEditPlus" if inputs.contains_key("prompt") => {
                if node_id == NEGATIVE_PROMPT_NODE {
                    inputs.insert("prompt".to_string(), Value::from(negative_prompt));
                } else if node_id == POSITIVE_PROMPT_NODE {
                    inputs.insert("prompt".to_string(), Value::from(prompt));
                }
            }
            _ => {}
        }
    }
    updated
}

pub fn mime_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        _ => "application/octet-stream",
    }
}

fn multipart_body(
    boundary: &str,
    field: &str,
    filename: &str,
    mime: &str,
    bytes: &[u8],
) -> Vec<u8> {
    let mut body = Vec::with_capacity(bytes.len() + 256);
    body.extend_from_slice(
        format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"{filename}\"\r\nContent-Type: {mime}\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(bytes);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    body
}

fn call_error(context: &str, e: ureq::Error) -> EngineError {
    match e {
        ureq::Error::Status(code, response) => {
            let body = response.into_string().unwrap_or_default();
            EngineError::external(format!("{context}: HTTP {code}: {body}"))
        }
        other => EngineError::external(format!("{context}: {other}")),
    }
}

fn read_json(context: &str, response: ureq::Response) -> Result<Value> {
    let body = response
        .into_string()
        .map_err(|e| EngineError::external(format!("{context}: {e}")))?;
    serde_json::from_str(&body)
        .map_err(|e| EngineError::external(format!("{context}: malformed response: {e}")))
}

pub struct PromptQueueClient {
    address: String,
    agent: ureq::Agent,
}

impl PromptQueueClient {
    /// `address` is `host:port`; a leading `http://` and trailing `/` are ignored.
    pub fn new(address: &str) -> Self {
        let address = address
            .trim()
            .trim_start_matches("http://")
            .trim_end_matches('/')
            .to_string();
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(60))
            .build();
        Self { address, agent }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    fn http_url(&self, path: &str) -> String {
        format!("http://{}{}", self.address, path)
    }

    pub fn stream_url(&self, client_id: &str) -> String {
        format!("ws://{}/ws?clientId={}", self.address, client_id)
    }

    pub fn upload_image(&self, path: &Path) -> Result<UploadedImage> {
        let bytes = std::fs::read(path)?;
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("image.png");
        let boundary = format!("----scene-forge-{}", uuid::Uuid::new_v4().simple());
        let body = multipart_body(&boundary, "image", filename, mime_for(path), &bytes);

        let response = self
            .agent
            .post(&self.http_url("/upload/image"))
            .set("Content-Type", &format!("multipart/form-data; boundary={boundary}"))
            .send_bytes(&body)
            .map_err(|e| call_error("upload image", e))?;
        let uploaded: UploadedImage = serde_json::from_value(read_json("upload image", response)?)
            .map_err(|e| EngineError::external(format!("upload image: {e}")))?;
        log_info!("prompt_queue", "Uploaded {} as {}", path.display(), uploaded.name);
        Ok(uploaded)
    }

    pub fn queue_prompt(&self, workflow: &Value) -> Result<QueuedPrompt> {
        let client_id = uuid::Uuid::new_v4().to_string();
        let payload = serde_json::json!({ "prompt": workflow, "client_id": client_id });
        let response = self
            .agent
            .post(&self.http_url("/prompt"))
            .set("Content-Type", "application/json")
            .send_string(&payload.to_string())
            .map_err(|e| call_error("queue prompt", e))?;

        let json = read_json("queue prompt", response)?;
        let prompt_id = json["prompt_id"]
            .as_str()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| EngineError::external("queue prompt: response has no prompt_id"))?
            .to_string();
        log_info!("prompt_queue", "Queued prompt {}", prompt_id);
        Ok(QueuedPrompt {
            prompt_id,
            client_id,
        })
    }

    pub fn history(&self, prompt_id: &str) -> Result<Option<HistoryEntry>> {
        let response = self
            .agent
            .get(&self.http_url(&format!("/history/{prompt_id}")))
            .call()
            .map_err(|e| call_error("history", e))?;
        Ok(parse_history(&read_json("history", response)?, prompt_id))
    }

    pub fn fetch(&self, file: &OutputFile) -> Result<Vec<u8>> {
        let response = self
            .agent
            .get(&self.http_url("/view"))
            .query("filename", &file.filename)
            .query("subfolder", &file.subfolder)
            .query("type", &file.kind)
            .call()
            .map_err(|e| call_error("fetch output", e))?;
        let mut bytes = Vec::new();
        response.into_reader().read_to_end(&mut bytes)?;
        Ok(bytes)
    }

    /// Poll history until the prompt finishes. Checks at least once.
    pub fn poll_until_done(
        &self,
        prompt_id: &str,
        interval: Duration,
        timeout: Duration,
    ) -> Result<HistoryEntry> {
        let started = Instant::now();
        loop {
            if let Some(entry) = self.history(prompt_id)? {
                if entry.completed || !entry.outputs.is_empty() {
                    return Ok(entry);
                }
            }
            if started.elapsed() >= timeout {
                return Err(EngineError::external(format!(
                    "Timed out after {}s waiting for prompt {prompt_id}",
                    timeout.as_secs()
                )));
            }
            std::thread::sleep(interval);
        }
    }

    /// Follow the event stream until the prompt's final `executing` event.
    pub async fn stream_until_done<F: FnMut(u32)>(
        &self,
        prompt_id: &str,
        client_id: &str,
        timeout: Duration,
        mut on_progress: F,
    ) -> Result<()> {
        let url = self.stream_url(client_id);
        let wait = async {
            let (mut stream, _) = tokio_tungstenite::connect_async(url.as_str())
                .await
                .map_err(|e| EngineError::external(format!("stream connect: {e}")))?;

            while let Some(message) = stream.next().await {
                let message = message.map_err(|e| EngineError::external(format!("stream: {e}")))?;
                match message {
                    WsMessage::Text(text) => match parse_event(&text) {
                        QueueEvent::Progress { value, max } if max > 0 => {
                            on_progress((value.min(max) * 100 / max) as u32);
                        }
                        QueueEvent::Executing {
                            node: None,
                            prompt_id: Some(id),
                        } if id == prompt_id => return Ok(()),
                        _ => {}
                    },
                    WsMessage::Close(_) => break,
                    _ => {}
                }
            }
            Err::<(), _>(EngineError::external("stream closed before the prompt finished"))
        };

        tokio::time::timeout(timeout, wait).await.map_err(|_| {
            EngineError::external(format!(
                "Timed out after {}s waiting for prompt {prompt_id}",
                timeout.as_secs()
            ))
        })?
    }

    /// Blocking form of `stream_until_done`. Must not be called from an
    /// async task; blocking worker threads are fine.
    pub fn wait_for_completion<F: FnMut(u32)>(
        &self,
        prompt_id: &str,
        client_id: &str,
        timeout: Duration,
        on_progress: F,
    ) -> Result<()> {
        let wait = self.stream_until_done(prompt_id, client_id, timeout, on_progress);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle.block_on(wait),
            Err(_) => tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?
                .block_on(wait),
        }
    }

    /// Queue `workflow`, wait for it and return its output files. A broken
    /// stream falls back to history polling within the same deadline.
    pub fn run_workflow(
        &self,
        workflow: &Value,
        timeout: Duration,
        mut on_progress: impl FnMut(u32),
    ) -> Result<Vec<OutputFile>> {
        let deadline = Instant::now() + timeout;
        let queued = self.queue_prompt(workflow)?;

        let entry = match self.wait_for_completion(
            &queued.prompt_id,
            &queued.client_id,
            timeout,
            &mut on_progress,
        ) {
            Ok(()) => self.history(&queued.prompt_id)?,
            Err(e) => {
                log_warn!("prompt_queue", "Stream wait failed ({}), polling history", e);
                let remaining = deadline.saturating_duration_since(Instant::now());
                Some(self.poll_until_done(&queued.prompt_id, POLL_INTERVAL, remaining)?)
            }
        };

        let outputs = entry.map(|e| e.outputs).unwrap_or_default();
        if outputs.is_empty() {
            return Err(EngineError::external(format!(
                "prompt {} produced no output images",
                queued.prompt_id
            )));
        }
        log_debug!("prompt_queue", "Prompt {} produced {} files", queued.prompt_id, outputs.len());
        Ok(outputs)
    }
}

/// Edits images by running a stored workflow on the prompt queue.
pub struct PromptQueueEditor {
    client: PromptQueueClient,
    workflow: Value,
    timeout: Duration,
}

impl PromptQueueEditor {
    pub fn new(client: PromptQueueClient, workflow: Value, timeout: Duration) -> Self {
        Self {
            client,
            workflow,
            timeout,
        }
    }

    /// Build an editor when both the service address and workflow file are
    /// configured.
    pub fn from_config(config: &EngineConfig) -> Result<Option<Self>> {
        let (Some(address), Some(workflow_path)) =
            (config.prompt_queue_address.as_deref(), config.edit_workflow_path.as_deref())
        else {
            return Ok(None);
        };
        let workflow: Value = serde_json::from_str(&std::fs::read_to_string(workflow_path)?)?;
        if !workflow.is_object() {
            return Err(EngineError::Validation(format!(
                "{} is not a workflow graph",
                workflow_path.display()
            )));
        }
        Ok(Some(Self::new(
            PromptQueueClient::new(address),
            workflow,
            config.prompt_queue_timeout(),
        )))
    }
}

impl ImageEditor for PromptQueueEditor {
    fn edit(
        &self,
        input: &Path,
        prompt: &str,
        output: &Path,
        on_progress: &mut dyn FnMut(u32),
    ) -> Result<()> {
        let uploaded = self.client.upload_image(input)?;
        let workflow = replace_prompt_in_workflow(
            &self.workflow,
            prompt,
            Some(&uploaded.name),
            DEFAULT_NEGATIVE_PROMPT,
        );
        let outputs = self.client.run_workflow(&workflow, self.timeout, on_progress)?;
        let first = outputs
            .first()
            .ok_or_else(|| EngineError::external("No output images generated"))?;
        let bytes = self.client.fetch(first)?;
        std::fs::write(output, bytes)?;
        Ok(())
    }
}
