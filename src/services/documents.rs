use std::path::Path;

use thiserror::Error;

#[derive(Debug, Error)]
pub(crate) enum DocumentError {
    #[error("file '{0}' must have an extension")]
    MissingExtension(String),
    #[error("file extension '.{extension}' is not allowed for '{file_name}'")]
    ExtensionNotAllowed { file_name: String, extension: String },
    #[error("media type '{media_type}' does not match '{file_name}'")]
    MediaTypeMismatch { file_name: String, media_type: String },
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// A scanned answer sheet (reference key or student submission) held in memory
/// until the batch runner stages it for upload.
#[derive(Debug, Clone)]
pub(crate) struct SubmissionFile {
    pub(crate) file_name: String,
    pub(crate) media_type: String,
    pub(crate) bytes: Vec<u8>,
}

impl SubmissionFile {
    pub(crate) fn new(
        file_name: &str,
        declared_media_type: Option<&str>,
        bytes: Vec<u8>,
        allowed_extensions: &[String],
    ) -> Result<Self, DocumentError> {
        let file_name = base_file_name(file_name);
        let extension = extension_of(&file_name)
            .ok_or_else(|| DocumentError::MissingExtension(file_name.clone()))?;

        let inferred = media_type_for_extension(&extension)
            .filter(|_| allowed_extensions.iter().any(|allowed| allowed == &extension));
        let Some(inferred) = inferred else {
            return Err(DocumentError::ExtensionNotAllowed { file_name, extension });
        };

        // A declared type only has to agree with the extension; the stored type
        // is always the canonical one, e.g. `image/jpg` becomes `image/jpeg`.
        if let Some(declared) = declared_media_type.map(|value| value.trim().to_ascii_lowercase()) {
            if !is_generic_media_type(&declared) && !media_type_matches(&declared, &extension) {
                return Err(DocumentError::MediaTypeMismatch { file_name, media_type: declared });
            }
        }

        Ok(Self { file_name, media_type: inferred.to_string(), bytes })
    }

    pub(crate) async fn read_from_path(
        path: &Path,
        allowed_extensions: &[String],
    ) -> Result<Self, DocumentError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|source| DocumentError::Io { path: path.display().to_string(), source })?;
        let file_name = path.file_name().and_then(|name| name.to_str()).unwrap_or_default();

        Self::new(file_name, None, bytes, allowed_extensions)
    }

    pub(crate) fn extension(&self) -> Option<String> {
        extension_of(&self.file_name)
    }
}

pub(crate) fn media_type_for_extension(extension: &str) -> Option<&'static str> {
    match extension {
        "pdf" => Some("application/pdf"),
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        _ => None,
    }
}

pub(crate) fn media_type_for_path(path: &Path) -> Option<&'static str> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .and_then(|ext| media_type_for_extension(&ext))
}

fn media_type_matches(media_type: &str, extension: &str) -> bool {
    match extension {
        "pdf" => matches!(media_type, "application/pdf" | "application/x-pdf"),
        "jpg" | "jpeg" => matches!(media_type, "image/jpeg" | "image/jpg"),
        "png" => media_type == "image/png",
        "webp" => media_type == "image/webp",
        _ => false,
    }
}

fn is_generic_media_type(media_type: &str) -> bool {
    media_type.is_empty()
        || matches!(media_type, "application/octet-stream" | "binary/octet-stream")
}

// Browsers may send a full client path; only the last component is kept.
fn base_file_name(name: &str) -> String {
    name.rsplit(['/', '\\']).next().unwrap_or(name).trim().to_string()
}

fn extension_of(file_name: &str) -> Option<String> {
    Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .filter(|ext| !ext.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allowed() -> Vec<String> {
        ["pdf", "png", "jpg", "jpeg"].iter().map(|ext| ext.to_string()).collect()
    }

    #[test]
    fn infers_media_type_when_declared_type_is_generic() {
        let file = SubmissionFile::new(
            "답안지_김철수.PDF",
            Some("application/octet-stream"),
            b"%PDF".to_vec(),
            &allowed(),
        )
        .expect("pdf accepted");
        assert_eq!(file.media_type, "application/pdf");
        assert_eq!(file.file_name, "답안지_김철수.PDF");
        assert_eq!(file.extension().as_deref(), Some("pdf"));
    }

    #[test]
    fn normalizes_matching_declared_type() {
        let file = SubmissionFile::new("scan.jpg", Some("image/jpg"), vec![1, 2], &allowed())
            .expect("jpg accepted");
        assert_eq!(file.media_type, "image/jpeg");

        let file =
            SubmissionFile::new("key.pdf", Some("Application/X-PDF"), vec![1, 2], &allowed())
                .expect("pdf accepted");
        assert_eq!(file.media_type, "application/pdf");
    }

    #[test]
    fn rejects_mismatched_declared_type() {
        let err = SubmissionFile::new("scan.png", Some("application/pdf"), vec![], &allowed())
            .unwrap_err();
        assert!(matches!(err, DocumentError::MediaTypeMismatch { .. }));
    }

    #[test]
    fn rejects_disallowed_and_missing_extensions() {
        let err = SubmissionFile::new("notes.docx", None, vec![], &allowed()).unwrap_err();
        assert!(matches!(err, DocumentError::ExtensionNotAllowed { .. }));

        let err = SubmissionFile::new("README", None, vec![], &allowed()).unwrap_err();
        assert!(matches!(err, DocumentError::MissingExtension(_)));

        // Allowed by config but not a type the model accepts.
        let err =
            SubmissionFile::new("a.gif", None, vec![], &["gif".to_string()]).unwrap_err();
        assert!(matches!(err, DocumentError::ExtensionNotAllowed { .. }));
    }

    #[test]
    fn strips_client_directories_from_name() {
        let file = SubmissionFile::new("C:\\scans\\class 3\\a.png", None, vec![], &allowed())
            .expect("png accepted");
        assert_eq!(file.file_name, "a.png");
    }

    #[test]
    fn media_type_for_path_is_case_insensitive() {
        assert_eq!(media_type_for_path(Path::new("/tmp/key.JPEG")), Some("image/jpeg"));
        assert_eq!(media_type_for_path(Path::new("/tmp/key")), None);
    }
}
