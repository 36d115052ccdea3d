use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use std::collections::HashMap;

use crate::core::metrics;
use crate::core::state::AppState;
use crate::schemas::{HealthResponse, RootResponse};

pub(crate) async fn root(State(state): State<AppState>) -> Json<RootResponse> {
    let api = state.settings().api();
    let response = RootResponse {
        message: api.project_name.clone(),
        version: api.version.clone(),
        grading_url: format!("{}/grading/batches", api.api_v1_str),
    };

    Json(response)
}

/// Reports configuration health only; no upstream call is made.
pub(crate) async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    let mut status = "healthy".to_string();
    let mut components = HashMap::new();

    if state.settings().gemini().api_key.trim().is_empty() {
        components.insert("gemini".to_string(), "missing_api_key".to_string());
        status = "degraded".to_string();
    } else {
        components.insert("gemini".to_string(), "configured".to_string());
    }

    let sheets = match state.sheets() {
        Some(exporter) => format!("configured ({})", exporter.service_account_email()),
        None => "disabled".to_string(),
    };
    components.insert("sheets".to_string(), sheets);

    Json(HealthResponse { service: "grading-assistant".to_string(), status, components })
}

pub(crate) async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    if !state.settings().telemetry().prometheus_enabled {
        return StatusCode::NOT_FOUND.into_response();
    }

    match metrics::render() {
        Some(body) => ([(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
            .into_response(),
        None => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}
