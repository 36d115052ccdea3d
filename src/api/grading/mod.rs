mod handlers;

use axum::{extract::DefaultBodyLimit, routing::post, Router};
use serde::Deserialize;

use crate::core::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub(crate) struct BatchQuery {
    /// Respond with the export document as an attachment instead of the
    /// batch summary.
    #[serde(default)]
    pub(crate) download: bool,
}

pub(crate) fn router(max_body_bytes: usize) -> Router<AppState> {
    Router::new()
        .route("/batches", post(handlers::create_batch))
        .layer(DefaultBodyLimit::max(max_body_bytes))
}
