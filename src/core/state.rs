use std::sync::Arc;

use crate::core::config::Settings;
use crate::services::grading::GradingBackend;
use crate::services::pacing::Pacer;
use crate::services::sheets::SheetsExporter;

#[derive(Clone)]
pub(crate) struct AppState {
    inner: Arc<InnerState>,
}

struct InnerState {
    settings: Settings,
    backend: Arc<dyn GradingBackend>,
    pacer: Arc<dyn Pacer>,
    sheets: Option<SheetsExporter>,
}

impl AppState {
    pub(crate) fn new(
        settings: Settings,
        backend: Arc<dyn GradingBackend>,
        pacer: Arc<dyn Pacer>,
        sheets: Option<SheetsExporter>,
    ) -> Self {
        Self { inner: Arc::new(InnerState { settings, backend, pacer, sheets }) }
    }

    pub(crate) fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub(crate) fn backend(&self) -> &dyn GradingBackend {
        self.inner.backend.as_ref()
    }

    pub(crate) fn pacer(&self) -> &dyn Pacer {
        self.inner.pacer.as_ref()
    }

    pub(crate) fn sheets(&self) -> Option<&SheetsExporter> {
        self.inner.sheets.as_ref()
    }
}
