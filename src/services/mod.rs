pub(crate) mod documents;
pub(crate) mod export;
pub(crate) mod gemini;
pub(crate) mod grading;
pub(crate) mod pacing;
pub(crate) mod sheets;
