use std::io::Write as _;
use std::time::Instant;

use tempfile::NamedTempFile;
use thiserror::Error;

use crate::schemas::grading::{BatchProgress, GradingResult};
use crate::services::documents::SubmissionFile;
use crate::services::grading::{absorb, GradingBackend, RemoteFileHandle, UploadError};
use crate::services::pacing::{ItemOutcome, Pacer};

#[derive(Debug, Error)]
pub(crate) enum BatchError {
    #[error("{0}")]
    Precondition(String),
    #[error("reference answer key could not be processed: {0}")]
    ReferenceUpload(#[source] UploadError),
}

/// Grades student submissions against one reference key, strictly one item at
/// a time. Per-item failures become degraded results; only a missing input or
/// a failed reference upload ends the batch early.
pub(crate) struct BatchRunner<'a> {
    backend: &'a dyn GradingBackend,
    pacer: &'a dyn Pacer,
}

impl<'a> BatchRunner<'a> {
    pub(crate) fn new(backend: &'a dyn GradingBackend, pacer: &'a dyn Pacer) -> Self {
        Self { backend, pacer }
    }

    pub(crate) async fn run<F>(
        &self,
        reference: &SubmissionFile,
        students: &[SubmissionFile],
        rules: Option<&str>,
        mut on_progress: F,
    ) -> Result<Vec<GradingResult>, BatchError>
    where
        F: FnMut(BatchProgress<'_>) + Send,
    {
        if students.is_empty() {
            metrics::counter!("grading_batches_total", "status" => "rejected").increment(1);
            return Err(BatchError::Precondition(
                "At least one student submission is required".to_string(),
            ));
        }

        let reference_handle = match self.upload_reference(reference).await {
            Ok(handle) => handle,
            Err(err) => {
                tracing::error!(file = %reference.file_name, error = %err, "Reference upload failed");
                metrics::counter!("grading_batches_total", "status" => "failed").increment(1);
                return Err(BatchError::ReferenceUpload(err));
            }
        };

        let rules = rules.map(str::trim).filter(|rules| !rules.is_empty());
        let total = students.len();
        let mut results = Vec::with_capacity(total);

        for (index, student) in students.iter().enumerate() {
            let timer = Instant::now();
            let (result, outcome) = self.grade_one(&reference_handle, student, rules).await;
            let result = result.with_source_file_name(&student.file_name);

            let status = match outcome {
                ItemOutcome::Graded => "success",
                ItemOutcome::Degraded => "degraded",
                ItemOutcome::RateLimited => "rate_limited",
            };
            metrics::counter!("grading_items_total", "status" => status).increment(1);
            metrics::histogram!("grading_item_duration_seconds").record(timer.elapsed().as_secs_f64());
            tracing::info!(
                item = index + 1,
                total,
                file = %student.file_name,
                status,
                total_score = result.total_score,
                "Student submission processed"
            );

            results.push(result);
            on_progress(BatchProgress {
                completed: index + 1,
                total,
                file_name: &student.file_name,
            });

            self.pacer.pause(outcome).await;
        }

        metrics::counter!("grading_batches_total", "status" => "completed").increment(1);
        Ok(results)
    }

    async fn upload_reference(
        &self,
        reference: &SubmissionFile,
    ) -> Result<RemoteFileHandle, UploadError> {
        let staged = stage(reference).map_err(|source| UploadError::Io {
            path: reference.file_name.clone(),
            source,
        })?;
        self.backend.upload_document(staged.path(), Some(&reference.media_type)).await
    }

    /// Uploads and grades one student. The staged temp file lives only for the
    /// duration of this call and is removed on every exit path. Grading follows
    /// [`GradingBackend::grade_submission`], split so the outcome is known.
    async fn grade_one(
        &self,
        reference: &RemoteFileHandle,
        student: &SubmissionFile,
        rules: Option<&str>,
    ) -> (GradingResult, ItemOutcome) {
        let staged = match stage(student) {
            Ok(staged) => staged,
            Err(err) => {
                tracing::warn!(file = %student.file_name, error = %err, "Failed to stage submission");
                return (
                    GradingResult::degraded(format!("Could not stage submission: {err}")),
                    ItemOutcome::Degraded,
                );
            }
        };

        let handle =
            match self.backend.upload_document(staged.path(), Some(&student.media_type)).await {
                Ok(handle) => handle,
                Err(err) => {
                    tracing::warn!(file = %student.file_name, error = %err, "Student upload failed");
                    let outcome = if err.is_rate_limited() {
                        ItemOutcome::RateLimited
                    } else {
                        ItemOutcome::Degraded
                    };
                    return (GradingResult::degraded(format!("Upload failed: {err}")), outcome);
                }
            };

        let graded = self.backend.try_grade_submission(reference, &handle, rules).await;
        let outcome = match &graded {
            Ok(_) => ItemOutcome::Graded,
            Err(err) if err.is_rate_limited() => ItemOutcome::RateLimited,
            Err(_) => ItemOutcome::Degraded,
        };

        (absorb(graded), outcome)
    }
}

fn stage(file: &SubmissionFile) -> std::io::Result<NamedTempFile> {
    let suffix = file.extension().map(|ext| format!(".{ext}")).unwrap_or_default();
    let mut staged = tempfile::Builder::new().prefix("submission-").suffix(&suffix).tempfile()?;
    staged.write_all(&file.bytes)?;
    staged.flush()?;
    Ok(staged)
}
