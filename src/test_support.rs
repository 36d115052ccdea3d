use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{header, Method, Request},
    Router,
};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::api;
use crate::core::{config::Settings, state::AppState};
use crate::schemas::grading::{GradingResult, QuestionScore};
use crate::services::documents::SubmissionFile;
use crate::services::grading::{
    parse_model_output, FileState, GradingBackend, GradingError, RemoteFileHandle, UploadError,
};
use crate::services::pacing::{ItemOutcome, NoDelay, Pacer};

pub(crate) const MULTIPART_BOUNDARY: &str = "grading-test-boundary";

pub(crate) struct TestContext {
    pub(crate) app: Router,
    pub(crate) backend: Arc<FakeBackend>,
    _guard: OwnedMutexGuard<()>,
}

pub(crate) async fn env_lock() -> OwnedMutexGuard<()> {
    static LOCK: OnceLock<Arc<Mutex<()>>> = OnceLock::new();
    let lock = LOCK.get_or_init(|| Arc::new(Mutex::new(()))).clone();
    lock.lock_owned().await
}

pub(crate) fn set_test_env() {
    std::env::set_var("GRADER_ENV", "test");
    std::env::set_var("GRADER_STRICT_CONFIG", "0");
    std::env::set_var("GEMINI_API_KEY", "test-key");
    std::env::remove_var("GRADING_PACING");
    std::env::set_var("PROMETHEUS_ENABLED", "0");
    std::env::remove_var("GOOGLE_SERVICE_ACCOUNT_FILE");
    std::env::remove_var("ALLOWED_DOCUMENT_EXTENSIONS");
    std::env::remove_var("MAX_UPLOAD_SIZE_MB");
    std::env::remove_var("GEMINI_MODEL");
    std::env::remove_var("GEMINI_REQUEST_TIMEOUT");
    std::env::remove_var("GEMINI_POLL_INTERVAL_MS");
    std::env::remove_var("GRADING_DELAY_MS");
    std::env::remove_var("GRADING_MAX_DELAY_MS");
}

pub(crate) async fn setup_test_context() -> TestContext {
    let guard = env_lock().await;
    set_test_env();

    let settings = Settings::load().expect("settings");
    let backend = Arc::new(FakeBackend::default());
    let state = AppState::new(settings, backend.clone(), Arc::new(NoDelay), None);
    let app = api::router::router(state);

    TestContext { app, backend, _guard: guard }
}

pub(crate) fn submission(file_name: &str, body: &str) -> SubmissionFile {
    let allowed: Vec<String> =
        ["pdf", "png", "jpg", "jpeg"].iter().map(|ext| ext.to_string()).collect();
    SubmissionFile::new(file_name, None, body.as_bytes().to_vec(), &allowed).expect("fixture file")
}

#[derive(Debug, Clone)]
pub(crate) struct UploadRecord {
    pub(crate) path: PathBuf,
    pub(crate) media_type: Option<String>,
    pub(crate) existed_during_upload: bool,
}

/// In-memory stand-in for the inference service. Behaviour is keyed on the
/// uploaded file's content:
/// - `upload-fail`: the upload is rejected as if the connection dropped
/// - `rate-limited`: the upload is rejected with HTTP 429
/// - `malformed`: grading returns unparseable JSON
/// - anything else: graded with full marks, the content used as student name
#[derive(Debug, Default)]
pub(crate) struct FakeBackend {
    uploads: StdMutex<Vec<UploadRecord>>,
    rules: StdMutex<Vec<Option<String>>>,
}

impl FakeBackend {
    pub(crate) fn uploads(&self) -> Vec<UploadRecord> {
        self.uploads.lock().expect("uploads lock").clone()
    }

    pub(crate) fn upload_count(&self) -> usize {
        self.uploads.lock().expect("uploads lock").len()
    }

    pub(crate) fn grade_count(&self) -> usize {
        self.rules.lock().expect("rules lock").len()
    }

    pub(crate) fn rules_seen(&self) -> Vec<Option<String>> {
        self.rules.lock().expect("rules lock").clone()
    }
}

#[async_trait]
impl GradingBackend for FakeBackend {
    async fn upload_document(
        &self,
        path: &Path,
        media_type: Option<&str>,
    ) -> Result<RemoteFileHandle, UploadError> {
        let bytes = std::fs::read(path);
        let index = {
            let mut uploads = self.uploads.lock().expect("uploads lock");
            uploads.push(UploadRecord {
                path: path.to_path_buf(),
                media_type: media_type.map(str::to_string),
                existed_during_upload: bytes.is_ok(),
            });
            uploads.len()
        };

        let bytes =
            bytes.map_err(|source| UploadError::Io { path: path.display().to_string(), source })?;
        let content = String::from_utf8_lossy(&bytes).to_string();

        if content.starts_with("upload-fail") {
            return Err(UploadError::Rejected {
                status: 503,
                message: "connection reset by peer".to_string(),
            });
        }
        if content.starts_with("rate-limited") {
            return Err(UploadError::Rejected {
                status: 429,
                message: "RESOURCE_EXHAUSTED: quota exceeded".to_string(),
            });
        }

        Ok(RemoteFileHandle {
            name: format!("files/{index}"),
            uri: format!("fake://{content}"),
            mime_type: media_type.unwrap_or("application/pdf").to_string(),
            state: FileState::Active,
        })
    }

    async fn try_grade_submission(
        &self,
        _reference: &RemoteFileHandle,
        student: &RemoteFileHandle,
        rules: Option<&str>,
    ) -> Result<GradingResult, GradingError> {
        self.rules.lock().expect("rules lock").push(rules.map(str::to_string));

        let marker = student.uri.strip_prefix("fake://").unwrap_or_default();
        if marker.starts_with("malformed") {
            return parse_model_output("{\"student_name\": \"half");
        }

        Ok(GradingResult {
            student_name: marker.to_string(),
            scores: vec![QuestionScore {
                question_number: 1,
                score: 10.0,
                max_score: 10.0,
                reason: "Correct".to_string(),
            }],
            total_score: 10.0,
            feedback: "Well done".to_string(),
            source_file_name: "model-made-this-up.pdf".to_string(),
        })
    }
}

#[derive(Debug, Default)]
pub(crate) struct RecordingPacer {
    outcomes: StdMutex<Vec<ItemOutcome>>,
}

impl RecordingPacer {
    pub(crate) fn outcomes(&self) -> Vec<ItemOutcome> {
        self.outcomes.lock().expect("outcomes lock").clone()
    }
}

impl Pacer for RecordingPacer {
    fn delay_after(&self, outcome: ItemOutcome) -> Duration {
        self.outcomes.lock().expect("outcomes lock").push(outcome);
        Duration::ZERO
    }
}

pub(crate) enum Part<'a> {
    File { field: &'a str, file_name: &'a str, content_type: &'a str, body: &'a str },
    Text { field: &'a str, value: &'a str },
}

pub(crate) fn multipart_request(uri: &str, parts: &[Part<'_>]) -> Request<Body> {
    let mut body = String::new();
    for part in parts {
        body.push_str(&format!("--{MULTIPART_BOUNDARY}\r\n"));
        match part {
            Part::File { field, file_name, content_type, body: content } => {
                body.push_str(&format!(
                    "Content-Disposition: form-data; name=\"{field}\"; filename=\"{file_name}\"\r\n"
                ));
                body.push_str(&format!("Content-Type: {content_type}\r\n\r\n"));
                body.push_str(content);
            }
            Part::Text { field, value } => {
                body.push_str(&format!("Content-Disposition: form-data; name=\"{field}\"\r\n\r\n"));
                body.push_str(value);
            }
        }
        body.push_str("\r\n");
    }
    body.push_str(&format!("--{MULTIPART_BOUNDARY}--\r\n"));

    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, format!("multipart/form-data; boundary={MULTIPART_BOUNDARY}"))
        .body(Body::from(body))
        .expect("multipart request")
}

pub(crate) async fn read_json(response: axum::response::Response) -> serde_json::Value {
    let body = to_bytes(response.into_body(), usize::MAX).await.expect("read body");
    serde_json::from_slice(&body).expect("json body")
}
