use axum::{
    extract::{multipart::Field, Multipart, Query, State},
    http::header,
    response::{IntoResponse, Response},
    Json,
};
use tracing::Instrument;
use uuid::Uuid;

use super::BatchQuery;
use crate::api::errors::ApiError;
use crate::core::config::Settings;
use crate::core::state::AppState;
use crate::core::time::now_rfc3339;
use crate::schemas::grading::{BatchResponse, GradingResult, SheetExportStatus};
use crate::services::documents::SubmissionFile;
use crate::services::export::{table_rows, to_export_json};
use crate::tasks::batch::{BatchError, BatchRunner};

const EXPORT_FILE_NAME: &str = "grading_results.json";

#[derive(Debug, Default)]
struct BatchForm {
    reference: Option<SubmissionFile>,
    students: Vec<SubmissionFile>,
    rules: Option<String>,
    spreadsheet_url: Option<String>,
}

pub(super) async fn create_batch(
    State(state): State<AppState>,
    Query(query): Query<BatchQuery>,
    multipart: Multipart,
) -> Result<Response, ApiError> {
    let form = read_batch_form(state.settings(), multipart).await?;
    let reference = form
        .reference
        .ok_or_else(|| ApiError::BadRequest("Reference answer key is required".to_string()))?;

    let batch_id = Uuid::new_v4().to_string();
    let span = tracing::info_span!(
        "grading_batch",
        batch_id = %batch_id,
        students = form.students.len()
    );

    let runner = BatchRunner::new(state.backend(), state.pacer());
    let results = runner
        .run(&reference, &form.students, form.rules.as_deref(), |progress| {
            tracing::info!(
                completed = progress.completed,
                total = progress.total,
                file = %progress.file_name,
                "Processing {} ({:.0}%)",
                progress.file_name,
                progress.fraction() * 100.0
            );
        })
        .instrument(span)
        .await
        .map_err(|err| match err {
            BatchError::Precondition(message) => ApiError::BadRequest(message),
            BatchError::ReferenceUpload(_) => ApiError::BadGateway(err.to_string()),
        })?;

    let export = match form.spreadsheet_url.as_deref() {
        Some(url) => Some(export_to_sheet(&state, url, &results).await),
        None => None,
    };

    if query.download {
        let document = to_export_json(&results)
            .map_err(|err| ApiError::internal(err, "Failed to serialize grading results"))?;
        return Ok((
            [
                (header::CONTENT_TYPE, "application/json; charset=utf-8".to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{EXPORT_FILE_NAME}\""),
                ),
            ],
            document,
        )
            .into_response());
    }

    let rows = table_rows(&results);
    Ok(Json(BatchResponse { batch_id, created_at: now_rfc3339(), results, rows, export })
        .into_response())
}

async fn export_to_sheet(
    state: &AppState,
    spreadsheet_url: &str,
    results: &[GradingResult],
) -> SheetExportStatus {
    let Some(exporter) = state.sheets() else {
        return SheetExportStatus::Failed {
            detail: "Spreadsheet export is not configured".to_string(),
        };
    };

    match exporter.append_results(spreadsheet_url, results).await {
        Ok(rows) => SheetExportStatus::Appended { rows },
        Err(err) => {
            tracing::warn!(error = %err, "Spreadsheet export failed");
            SheetExportStatus::Failed { detail: err.to_string() }
        }
    }
}

async fn read_batch_form(settings: &Settings, mut multipart: Multipart) -> Result<BatchForm, ApiError> {
    let uploads = settings.uploads();
    let mut form = BatchForm::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|_| ApiError::BadRequest("Invalid multipart data".to_string()))?
    {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "reference" | "students" | "students[]" => {
                let file_name = field.file_name().map(|s| s.to_string()).ok_or_else(|| {
                    ApiError::BadRequest(format!("Field '{name}' must be a file upload"))
                })?;
                let content_type = field.content_type().map(|s| s.to_string());
                let bytes =
                    read_file_field(field, uploads.max_upload_bytes(), uploads.max_upload_size_mb)
                        .await?;
                let file = SubmissionFile::new(
                    &file_name,
                    content_type.as_deref(),
                    bytes,
                    &uploads.allowed_document_extensions,
                )
                .map_err(|err| ApiError::BadRequest(err.to_string()))?;

                if name == "reference" {
                    if form.reference.is_some() {
                        return Err(ApiError::BadRequest(
                            "Only one reference answer key may be uploaded".to_string(),
                        ));
                    }
                    form.reference = Some(file);
                } else {
                    form.students.push(file);
                }
            }
            "rules" => {
                let text = field
                    .text()
                    .await
                    .map_err(|_| ApiError::BadRequest("Invalid rules text".to_string()))?;
                form.rules = Some(text);
            }
            "spreadsheet_url" => {
                let text = field
                    .text()
                    .await
                    .map_err(|_| ApiError::BadRequest("Invalid spreadsheet URL".to_string()))?;
                let text = text.trim();
                if !text.is_empty() {
                    form.spreadsheet_url = Some(text.to_string());
                }
            }
            _ => {
                tracing::debug!(field = %name, "Ignoring unknown multipart field");
            }
        }
    }

    Ok(form)
}

async fn read_file_field(
    mut field: Field<'_>,
    max_bytes: u64,
    max_mb: u64,
) -> Result<Vec<u8>, ApiError> {
    let mut bytes = Vec::new();
    while let Some(chunk) = field
        .chunk()
        .await
        .map_err(|_| ApiError::BadRequest("Failed to read file".to_string()))?
    {
        let next_size = bytes.len() as u64 + chunk.len() as u64;
        if next_size > max_bytes {
            return Err(ApiError::BadRequest(format!("File size exceeds {max_mb}MB limit")));
        }
        bytes.extend_from_slice(&chunk);
    }
    Ok(bytes)
}
