use serde::{Deserialize, Serialize};

/// Student name used for results that never reached a usable model answer.
pub(crate) const DEGRADED_STUDENT_NAME: &str = "Error";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct QuestionScore {
    #[serde(rename = "q_num")]
    pub(crate) question_number: i64,
    pub(crate) score: f64,
    pub(crate) max_score: f64,
    pub(crate) reason: String,
}

/// One graded student submission. `source_file_name` is filled in by the batch
/// runner from the uploaded file, never from model output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct GradingResult {
    pub(crate) student_name: String,
    pub(crate) scores: Vec<QuestionScore>,
    pub(crate) total_score: f64,
    pub(crate) feedback: String,
    #[serde(default)]
    pub(crate) source_file_name: String,
}

impl GradingResult {
    pub(crate) fn degraded(feedback: impl Into<String>) -> Self {
        Self {
            student_name: DEGRADED_STUDENT_NAME.to_string(),
            scores: Vec::new(),
            total_score: 0.0,
            feedback: feedback.into(),
            source_file_name: String::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn is_degraded(&self) -> bool {
        *self
            == Self::degraded(self.feedback.clone())
                .with_source_file_name(&self.source_file_name)
    }

    pub(crate) fn with_source_file_name(mut self, file_name: &str) -> Self {
        self.source_file_name = file_name.to_string();
        self
    }
}

/// Display projection of a [`GradingResult`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct ResultRow {
    pub(crate) student_name: String,
    pub(crate) total_score: f64,
    pub(crate) feedback: String,
    pub(crate) source_file_name: String,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub(crate) struct BatchProgress<'a> {
    pub(crate) completed: usize,
    pub(crate) total: usize,
    pub(crate) file_name: &'a str,
}

impl BatchProgress<'_> {
    pub(crate) fn fraction(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        self.completed as f64 / self.total as f64
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub(crate) enum SheetExportStatus {
    Appended { rows: usize },
    Failed { detail: String },
}

#[derive(Debug, Serialize)]
pub(crate) struct BatchResponse {
    pub(crate) batch_id: String,
    pub(crate) created_at: String,
    pub(crate) results: Vec<GradingResult>,
    pub(crate) rows: Vec<ResultRow>,
    pub(crate) export: Option<SheetExportStatus>,
}
