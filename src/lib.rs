pub(crate) mod api;
mod cli;
pub(crate) mod core;
pub(crate) mod schemas;
pub(crate) mod services;
pub(crate) mod tasks;

#[cfg(test)]
mod test_support;

use crate::core::{config::Settings, state::AppState, telemetry};
use crate::services::{gemini::GeminiClient, pacing, sheets::SheetsExporter};

pub async fn run() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = Settings::load()?;
    telemetry::init_tracing(&settings)?;
    core::metrics::init(&settings)?;

    let backend = GeminiClient::from_settings(&settings)?;
    let pacer = pacing::from_settings(&settings);
    let sheets = SheetsExporter::from_settings(&settings)?;
    match &sheets {
        Some(exporter) => tracing::info!(
            service_account = %exporter.service_account_email(),
            "Spreadsheet export enabled"
        ),
        None => tracing::info!("GOOGLE_SERVICE_ACCOUNT_FILE not set; spreadsheet export disabled"),
    }

    let state = AppState::new(settings, std::sync::Arc::new(backend), pacer, sheets);
    let app = api::router::router(state.clone());
    let listener = tokio::net::TcpListener::bind(state.settings().server_addr()).await?;

    tracing::info!(
        host = %state.settings().server_host(),
        port = state.settings().server_port(),
        environment = %state.settings().runtime().environment.as_str(),
        model = %state.settings().gemini().model,
        "Grading assistant API listening"
    );

    axum::serve(listener, app).with_graceful_shutdown(core::shutdown::shutdown_signal()).await?;

    Ok(())
}

/// Entry point for the `grade-batch` command: grades local files and writes
/// the results document.
pub async fn run_cli() -> anyhow::Result<()> {
    let args = cli::parse_args(std::env::args().skip(1))?;
    cli::run(args).await
}
