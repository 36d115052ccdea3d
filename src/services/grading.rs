use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use crate::schemas::grading::{GradingResult, QuestionScore};

pub(crate) const GRADING_SYSTEM_PROMPT: &str = r#"You are a strict and fair exam grader.
Compare the provided [answer key / grading criteria] with the [student answer sheet] and grade every question.

Respond ONLY with JSON in exactly this format:
{
  "student_name": "the student's name as written on the answer sheet ('Unknown' if absent)",
  "scores": [
    {"q_num": 1, "score": 10, "max_score": 10, "reason": "Correct"},
    {"q_num": 2, "score": 0, "max_score": 5, "reason": "Wrong: calculation mistake"}
  ],
  "total_score": 85,
  "feedback": "Overall strong work, with a few calculation mistakes."
}
"#;

const GRADING_INSTRUCTION: &str =
    "Grade this student's answer sheet by comparing it with the answer key.";

const UNKNOWN_STUDENT_NAME: &str = "Unknown";

/// Processing state of a document on the inference service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FileState {
    Processing,
    Active,
    Failed,
}

impl FileState {
    /// Only `PROCESSING` keeps the poll loop going and only `FAILED` is an
    /// error; anything else is treated as usable.
    pub(crate) fn from_wire(value: Option<&str>) -> Self {
        match value.map(str::to_ascii_uppercase).as_deref() {
            Some("PROCESSING") => Self::Processing,
            Some("FAILED") => Self::Failed,
            _ => Self::Active,
        }
    }
}

/// Opaque reference to a document accepted by the inference service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RemoteFileHandle {
    pub(crate) name: String,
    pub(crate) uri: String,
    pub(crate) mime_type: String,
    pub(crate) state: FileState,
}

#[derive(Debug, Error)]
pub(crate) enum UploadError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("unsupported media type for {0}")]
    UnsupportedMediaType(String),
    #[error("upload request failed: {0}")]
    Request(#[source] reqwest::Error),
    #[error("upload rejected (status {status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("upload session did not return an upload URL")]
    MissingUploadUrl,
    #[error("invalid upload response: {0}")]
    InvalidResponse(String),
    #[error("file {name} failed server-side processing")]
    Failed { name: String },
    #[error("file {name} still processing after {attempts} polls")]
    Timeout { name: String, attempts: u32 },
}

impl UploadError {
    pub(crate) fn is_rate_limited(&self) -> bool {
        match self {
            Self::Rejected { status, message } => {
                *status == 429 || message.contains("RESOURCE_EXHAUSTED")
            }
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub(crate) enum GradingError {
    #[error("grading request failed: {0}")]
    Request(#[source] reqwest::Error),
    #[error("grading rejected (status {status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("model response was blocked: {0}")]
    Blocked(String),
    #[error("model returned an empty response")]
    EmptyResponse,
    #[error("model returned malformed grading JSON: {0}")]
    MalformedOutput(String),
}

impl GradingError {
    pub(crate) fn is_rate_limited(&self) -> bool {
        match self {
            Self::Rejected { status, message } => {
                *status == 429 || message.contains("RESOURCE_EXHAUSTED")
            }
            _ => false,
        }
    }
}

/// The two remote operations the batch runner needs from an inference service.
#[async_trait]
pub(crate) trait GradingBackend: Send + Sync {
    /// Sends the document and blocks until the service has finished processing it.
    async fn upload_document(
        &self,
        path: &Path,
        media_type: Option<&str>,
    ) -> Result<RemoteFileHandle, UploadError>;

    /// One grading round-trip. Errors are returned so callers can inspect them;
    /// use [`GradingBackend::grade_submission`] for the absorbing form.
    async fn try_grade_submission(
        &self,
        reference: &RemoteFileHandle,
        student: &RemoteFileHandle,
        rules: Option<&str>,
    ) -> Result<GradingResult, GradingError>;

    /// Never fails: any error becomes a degraded result carrying the error text.
    /// The batch runner calls `try_grade_submission` and [`absorb`] itself so it
    /// can classify the error for pacing first.
    #[allow(dead_code)]
    async fn grade_submission(
        &self,
        reference: &RemoteFileHandle,
        student: &RemoteFileHandle,
        rules: Option<&str>,
    ) -> GradingResult {
        absorb(self.try_grade_submission(reference, student, rules).await)
    }
}

pub(crate) fn absorb(outcome: Result<GradingResult, GradingError>) -> GradingResult {
    match outcome {
        Ok(result) => result,
        Err(err) => {
            tracing::warn!(error = %err, "Grading degraded");
            GradingResult::degraded(format!("Error during grading: {err}"))
        }
    }
}

pub(crate) fn build_user_prompt(rules: Option<&str>) -> String {
    let mut prompt = GRADING_INSTRUCTION.to_string();
    if let Some(rules) = rules.map(str::trim).filter(|rules| !rules.is_empty()) {
        prompt.push_str("\n\n[Additional OCR and grading rules]\n");
        prompt.push_str(rules);
    }
    prompt
}

#[derive(Debug, Deserialize)]
struct ModelGrading {
    student_name: String,
    scores: Vec<ModelScore>,
    total_score: f64,
    feedback: String,
}

#[derive(Debug, Deserialize)]
struct ModelScore {
    q_num: i64,
    score: f64,
    max_score: f64,
    reason: String,
}

/// Parses the model's answer into a result. Every schema key is required;
/// unknown keys are ignored.
pub(crate) fn parse_model_output(text: &str) -> Result<GradingResult, GradingError> {
    let body = strip_code_fence(text);
    if body.is_empty() {
        return Err(GradingError::EmptyResponse);
    }

    let parsed: ModelGrading = serde_json::from_str(body)
        .map_err(|err| GradingError::MalformedOutput(err.to_string()))?;

    if !parsed.total_score.is_finite() {
        return Err(GradingError::MalformedOutput("total_score is not finite".to_string()));
    }

    let mut scores = Vec::with_capacity(parsed.scores.len());
    for entry in parsed.scores {
        if !entry.score.is_finite() || !entry.max_score.is_finite() {
            return Err(GradingError::MalformedOutput(format!(
                "score for question {} is not finite",
                entry.q_num
            )));
        }
        scores.push(QuestionScore {
            question_number: entry.q_num,
            score: entry.score,
            max_score: entry.max_score,
            reason: entry.reason,
        });
    }

    let student_name = match parsed.student_name.trim() {
        "" => UNKNOWN_STUDENT_NAME.to_string(),
        name => name.to_string(),
    };

    Ok(GradingResult {
        student_name,
        scores,
        total_score: parsed.total_score,
        feedback: parsed.feedback,
        source_file_name: String::new(),
    })
}

fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}
