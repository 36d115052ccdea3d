use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::core::config::Settings;
use crate::schemas::grading::GradingResult;
use crate::services::documents;
use crate::services::grading::{
    build_user_prompt, parse_model_output, FileState, GradingBackend, GradingError,
    RemoteFileHandle, UploadError, GRADING_SYSTEM_PROMPT,
};

const API_KEY_HEADER: &str = "x-goog-api-key";
const UPLOAD_URL_HEADER: &str = "x-goog-upload-url";

#[derive(Debug, Clone)]
pub(crate) struct GeminiClient {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    temperature: f64,
    poll_interval: Duration,
    max_poll_attempts: u32,
}

#[derive(Debug, Deserialize)]
struct FileEnvelope {
    file: WireFile,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireFile {
    name: String,
    #[serde(default)]
    uri: String,
    #[serde(default)]
    mime_type: Option<String>,
    #[serde(default)]
    state: Option<String>,
}

impl WireFile {
    fn into_handle(self, fallback_mime_type: &str) -> RemoteFileHandle {
        RemoteFileHandle {
            state: FileState::from_wire(self.state.as_deref()),
            mime_type: self.mime_type.unwrap_or_else(|| fallback_mime_type.to_string()),
            name: self.name,
            uri: self.uri,
        }
    }
}

impl GeminiClient {
    pub(crate) fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let gemini = settings.gemini();
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(gemini.request_timeout_seconds))
            .build()
            .context("Failed to build Gemini HTTP client")?;

        Ok(Self {
            client,
            api_key: gemini.api_key.clone(),
            base_url: gemini.base_url.trim_end_matches('/').to_string(),
            model: gemini.model.clone(),
            temperature: gemini.temperature,
            poll_interval: Duration::from_millis(gemini.poll_interval_ms),
            max_poll_attempts: gemini.max_poll_attempts,
        })
    }

    async fn start_upload(
        &self,
        display_name: &str,
        mime_type: &str,
        content_length: usize,
    ) -> Result<String, UploadError> {
        let endpoint = format!("{}/upload/v1beta/files", self.base_url);
        let response = self
            .client
            .post(&endpoint)
            .header(API_KEY_HEADER, &self.api_key)
            .header("X-Goog-Upload-Protocol", "resumable")
            .header("X-Goog-Upload-Command", "start")
            .header("X-Goog-Upload-Header-Content-Length", content_length.to_string())
            .header("X-Goog-Upload-Header-Content-Type", mime_type)
            .json(&json!({"file": {"display_name": display_name}}))
            .send()
            .await
            .map_err(UploadError::Request)?;

        let response = reject_upload_failure(response).await?;

        response
            .headers()
            .get(UPLOAD_URL_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(ToString::to_string)
            .ok_or(UploadError::MissingUploadUrl)
    }

    async fn finish_upload(
        &self,
        upload_url: &str,
        mime_type: &str,
        bytes: Vec<u8>,
    ) -> Result<RemoteFileHandle, UploadError> {
        let response = self
            .client
            .post(upload_url)
            .header(API_KEY_HEADER, &self.api_key)
            .header("X-Goog-Upload-Command", "upload, finalize")
            .header("X-Goog-Upload-Offset", "0")
            .body(bytes)
            .send()
            .await
            .map_err(UploadError::Request)?;

        let response = reject_upload_failure(response).await?;
        let envelope: FileEnvelope = response
            .json()
            .await
            .map_err(|err| UploadError::InvalidResponse(err.to_string()))?;

        Ok(envelope.file.into_handle(mime_type))
    }

    async fn fetch_file(&self, current: &RemoteFileHandle) -> Result<RemoteFileHandle, UploadError> {
        let endpoint = format!("{}/v1beta/{}", self.base_url, current.name);
        let response = self
            .client
            .get(&endpoint)
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await
            .map_err(UploadError::Request)?;

        let response = reject_upload_failure(response).await?;
        let file: WireFile = response
            .json()
            .await
            .map_err(|err| UploadError::InvalidResponse(err.to_string()))?;

        Ok(file.into_handle(&current.mime_type))
    }

    async fn wait_until_ready(
        &self,
        mut handle: RemoteFileHandle,
    ) -> Result<RemoteFileHandle, UploadError> {
        let mut attempts = 0;

        loop {
            match handle.state {
                FileState::Active => return Ok(handle),
                FileState::Failed => return Err(UploadError::Failed { name: handle.name }),
                FileState::Processing => {}
            }

            if attempts >= self.max_poll_attempts {
                return Err(UploadError::Timeout { name: handle.name, attempts });
            }

            tokio::time::sleep(self.poll_interval).await;
            handle = self.fetch_file(&handle).await?;
            attempts += 1;
        }
    }

    async fn generate(
        &self,
        reference: &RemoteFileHandle,
        student: &RemoteFileHandle,
        rules: Option<&str>,
    ) -> Result<String, GradingError> {
        let payload = json!({
            "systemInstruction": {"parts": [{"text": GRADING_SYSTEM_PROMPT}]},
            "contents": [{
                "role": "user",
                "parts": [
                    {"fileData": {"mimeType": reference.mime_type, "fileUri": reference.uri}},
                    {"fileData": {"mimeType": student.mime_type, "fileUri": student.uri}},
                    {"text": build_user_prompt(rules)}
                ]
            }],
            "generationConfig": {
                "responseMimeType": "application/json",
                "temperature": self.temperature
            }
        });

        let url = format!("{}/v1beta/models/{}:generateContent", self.base_url, self.model);
        let response = self
            .client
            .post(&url)
            .header(API_KEY_HEADER, &self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(GradingError::Request)?;

        let status = response.status();
        let raw_body = response.text().await.map_err(GradingError::Request)?;
        if !status.is_success() {
            return Err(GradingError::Rejected {
                status: status.as_u16(),
                message: extract_error_message(&raw_body),
            });
        }

        let body: Value = serde_json::from_str(&raw_body).map_err(|err| {
            GradingError::MalformedOutput(format!("response envelope is not JSON: {err}"))
        })?;

        extract_candidate_text(&body)
    }
}

#[async_trait]
impl GradingBackend for GeminiClient {
    async fn upload_document(
        &self,
        path: &Path,
        media_type: Option<&str>,
    ) -> Result<RemoteFileHandle, UploadError> {
        let display_name =
            path.file_name().and_then(|name| name.to_str()).unwrap_or("document").to_string();
        let mime_type = match media_type {
            Some(value) => value.to_string(),
            None => documents::media_type_for_path(path)
                .ok_or_else(|| UploadError::UnsupportedMediaType(display_name.clone()))?
                .to_string(),
        };

        let bytes = tokio::fs::read(path)
            .await
            .map_err(|source| UploadError::Io { path: path.display().to_string(), source })?;

        tracing::debug!(file = %display_name, mime_type = %mime_type, size = bytes.len(), "Uploading document");

        let upload_url = self.start_upload(&display_name, &mime_type, bytes.len()).await?;
        let handle = self.finish_upload(&upload_url, &mime_type, bytes).await?;
        let handle = self.wait_until_ready(handle).await?;

        tracing::info!(file = %display_name, remote_name = %handle.name, "Document ready");
        Ok(handle)
    }

    async fn try_grade_submission(
        &self,
        reference: &RemoteFileHandle,
        student: &RemoteFileHandle,
        rules: Option<&str>,
    ) -> Result<GradingResult, GradingError> {
        let timer = Instant::now();
        tracing::info!(student_file = %student.name, model = %self.model, "Sending grading request");

        let text = self.generate(reference, student, rules).await?;
        let result = parse_model_output(&text)?;

        tracing::info!(
            student_file = %student.name,
            duration_seconds = timer.elapsed().as_secs_f64(),
            total_score = result.total_score,
            "Grading completed"
        );
        Ok(result)
    }
}

async fn reject_upload_failure(response: Response) -> Result<Response, UploadError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let raw_body = response.text().await.unwrap_or_default();
    Err(UploadError::Rejected { status: status.as_u16(), message: extract_error_message(&raw_body) })
}

fn extract_candidate_text(body: &Value) -> Result<String, GradingError> {
    let candidate = body.get("candidates").and_then(|candidates| candidates.get(0));

    let Some(candidate) = candidate else {
        if let Some(reason) = body
            .get("promptFeedback")
            .and_then(|feedback| feedback.get("blockReason"))
            .and_then(Value::as_str)
        {
            return Err(GradingError::Blocked(reason.to_string()));
        }
        return Err(GradingError::EmptyResponse);
    };

    let text = candidate
        .get("content")
        .and_then(|content| content.get("parts"))
        .and_then(Value::as_array)
        .map(|parts| {
            parts.iter().filter_map(|part| part.get("text").and_then(Value::as_str)).collect::<String>()
        })
        .unwrap_or_default();

    if text.trim().is_empty() {
        return match candidate.get("finishReason").and_then(Value::as_str) {
            Some(reason @ ("SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT")) => {
                Err(GradingError::Blocked(reason.to_string()))
            }
            _ => Err(GradingError::EmptyResponse),
        };
    }

    Ok(text)
}

fn extract_error_message(raw_body: &str) -> String {
    let Ok(payload) = serde_json::from_str::<Value>(raw_body) else {
        return if raw_body.trim().is_empty() {
            "unknown_error".to_string()
        } else {
            raw_body.trim().to_string()
        };
    };

    let error = payload.get("error").unwrap_or(&payload);
    let message = error.get("message").and_then(Value::as_str);
    let status = error.get("status").and_then(Value::as_str);

    match (status, message) {
        (Some(status), Some(message)) => format!("{status}: {message}"),
        (None, Some(message)) => message.to_string(),
        (Some(status), None) => status.to_string(),
        (None, None) => "unknown_error".to_string(),
    }
}
