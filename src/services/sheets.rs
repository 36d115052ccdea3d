use std::path::Path;
use std::time::Duration;

use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use time::OffsetDateTime;

use crate::core::config::Settings;
use crate::schemas::grading::GradingResult;
use crate::services::export::scores_cell;

const SHEETS_SCOPE: &str = "https://www.googleapis.com/auth/spreadsheets";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const TOKEN_LIFETIME_SECONDS: i64 = 3600;

#[derive(Debug, Error)]
pub(crate) enum ExportError {
    #[error("invalid service account credentials: {0}")]
    Credentials(String),
    #[error("invalid spreadsheet url: {0}")]
    InvalidSpreadsheetUrl(String),
    #[error("spreadsheet authentication failed: {0}")]
    Auth(String),
    #[error("spreadsheet request failed: {0}")]
    Request(#[source] reqwest::Error),
    #[error("spreadsheet rejected append (status {status}): {message}")]
    Rejected { status: u16, message: String },
}

#[derive(Debug, Clone, Deserialize)]
struct ServiceAccountKey {
    client_email: String,
    private_key: String,
    #[serde(default = "default_token_uri")]
    token_uri: String,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

#[derive(Debug, Serialize)]
struct TokenClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// Appends grading results to a Google spreadsheet as a service account.
#[derive(Debug, Clone)]
pub(crate) struct SheetsExporter {
    client: Client,
    key: ServiceAccountKey,
    base_url: String,
    range: String,
}

impl SheetsExporter {
    /// Returns `Ok(None)` when no service account key is configured.
    pub(crate) fn from_settings(settings: &Settings) -> Result<Option<Self>, ExportError> {
        let Some(path) = settings.sheets().service_account_file.as_deref() else {
            return Ok(None);
        };

        let key = load_service_account(path)?;
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(20))
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(ExportError::Request)?;

        Ok(Some(Self {
            client,
            key,
            base_url: settings.sheets().base_url.trim_end_matches('/').to_string(),
            range: settings.sheets().range.clone(),
        }))
    }

    pub(crate) fn service_account_email(&self) -> &str {
        &self.key.client_email
    }

    /// Appends one row per result: name, total score, feedback and the
    /// per-question scores as JSON. Returns the number of rows sent.
    pub(crate) async fn append_results(
        &self,
        spreadsheet_url: &str,
        results: &[GradingResult],
    ) -> Result<usize, ExportError> {
        let spreadsheet_id = spreadsheet_id_from_url(spreadsheet_url)?;
        if results.is_empty() {
            return Ok(0);
        }

        let token = self.access_token().await?;
        let url = self.append_url(&spreadsheet_id)?;
        let rows: Vec<Value> = results.iter().map(result_row).collect();

        let response = self
            .client
            .post(url)
            .bearer_auth(&token)
            .json(&json!({"majorDimension": "ROWS", "values": rows}))
            .send()
            .await
            .map_err(ExportError::Request)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExportError::Rejected {
                status: status.as_u16(),
                message: google_error_message(&body),
            });
        }

        tracing::info!(spreadsheet_id = %spreadsheet_id, rows = results.len(), "Appended grading results to spreadsheet");
        Ok(results.len())
    }

    async fn access_token(&self) -> Result<String, ExportError> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let claims = TokenClaims {
            iss: &self.key.client_email,
            scope: SHEETS_SCOPE,
            aud: &self.key.token_uri,
            iat: now,
            exp: now + TOKEN_LIFETIME_SECONDS,
        };
        let signing_key = EncodingKey::from_rsa_pem(self.key.private_key.as_bytes())
            .map_err(|err| ExportError::Credentials(err.to_string()))?;
        let assertion = encode(&Header::new(Algorithm::RS256), &claims, &signing_key)
            .map_err(|err| ExportError::Credentials(err.to_string()))?;

        let response = self
            .client
            .post(&self.key.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await
            .map_err(ExportError::Request)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExportError::Auth(format!("status {status}: {}", google_error_message(&body))));
        }

        let token: TokenResponse =
            response.json().await.map_err(|err| ExportError::Auth(err.to_string()))?;
        Ok(token.access_token)
    }

    fn append_url(&self, spreadsheet_id: &str) -> Result<Url, ExportError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|err| ExportError::InvalidSpreadsheetUrl(format!("{}: {err}", self.base_url)))?;
        url.path_segments_mut()
            .map_err(|_| ExportError::InvalidSpreadsheetUrl(self.base_url.clone()))?
            .pop_if_empty()
            .extend(["v4", "spreadsheets", spreadsheet_id, "values"])
            .push(&format!("{}:append", self.range));
        url.query_pairs_mut()
            .append_pair("valueInputOption", "USER_ENTERED")
            .append_pair("insertDataOption", "INSERT_ROWS");
        Ok(url)
    }
}

fn load_service_account(path: &Path) -> Result<ServiceAccountKey, ExportError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|err| ExportError::Credentials(format!("{}: {err}", path.display())))?;
    parse_service_account(&raw)
}

fn parse_service_account(raw: &str) -> Result<ServiceAccountKey, ExportError> {
    let key: ServiceAccountKey =
        serde_json::from_str(raw).map_err(|err| ExportError::Credentials(err.to_string()))?;
    if key.client_email.trim().is_empty() || key.private_key.trim().is_empty() {
        return Err(ExportError::Credentials("client_email and private_key are required".to_string()));
    }
    Ok(key)
}

fn result_row(result: &GradingResult) -> Value {
    json!([result.student_name, result.total_score, result.feedback, scores_cell(&result.scores)])
}

/// Accepts a full `.../spreadsheets/d/<id>/edit` link or a bare spreadsheet id.
pub(crate) fn spreadsheet_id_from_url(value: &str) -> Result<String, ExportError> {
    let trimmed = value.trim();
    let candidate = match trimmed.split_once("/spreadsheets/d/") {
        Some((_, rest)) => rest.split(['/', '?', '#']).next().unwrap_or_default(),
        None if !trimmed.contains('/') => trimmed,
        None => "",
    };

    let valid = !candidate.is_empty()
        && candidate.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(candidate.to_string())
    } else {
        Err(ExportError::InvalidSpreadsheetUrl(trimmed.to_string()))
    }
}

fn google_error_message(raw_body: &str) -> String {
    let Ok(payload) = serde_json::from_str::<Value>(raw_body) else {
        return raw_body.trim().to_string();
    };

    if let Some(message) = payload.get("error").and_then(|error| error.get("message")).and_then(Value::as_str) {
        return message.to_string();
    }

    // OAuth token endpoint errors are flat: {"error": "...", "error_description": "..."}
    payload
        .get("error_description")
        .and_then(Value::as_str)
        .or_else(|| payload.get("error").and_then(Value::as_str))
        .unwrap_or("unknown_error")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schemas::grading::QuestionScore;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TEST_PRIVATE_KEY: &str =
        include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/testdata/service_account_key.pem"));

    fn exporter(server: &MockServer) -> SheetsExporter {
        SheetsExporter {
            client: Client::new(),
            key: ServiceAccountKey {
                client_email: "grader@project.iam.gserviceaccount.com".to_string(),
                private_key: TEST_PRIVATE_KEY.to_string(),
                token_uri: format!("{}/token", server.uri()),
            },
            base_url: server.uri(),
            range: "A1".to_string(),
        }
    }

    fn results() -> Vec<GradingResult> {
        vec![
            GradingResult {
                student_name: "Park".to_string(),
                scores: vec![QuestionScore {
                    question_number: 1,
                    score: 3.0,
                    max_score: 5.0,
                    reason: "partial".to_string(),
                }],
                total_score: 3.0,
                feedback: "Review fractions".to_string(),
                source_file_name: "park.pdf".to_string(),
            },
            GradingResult::degraded("Upload failed: timeout").with_source_file_name("b.pdf"),
        ]
    }

    async fn mount_token(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "ya29.test-token",
                "expires_in": 3600,
                "token_type": "Bearer"
            })))
            .expect(1)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn appends_one_row_per_result() {
        let server = MockServer::start().await;
        mount_token(&server).await;
        Mock::given(method("POST"))
            .and(path("/v4/spreadsheets/sheet_123-abc/values/A1:append"))
            .and(query_param("valueInputOption", "USER_ENTERED"))
            .and(header("authorization", "Bearer ya29.test-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "updates": {"updatedRows": 2}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let appended = exporter(&server)
            .append_results(
                "https://docs.google.com/spreadsheets/d/sheet_123-abc/edit#gid=0",
                &results(),
            )
            .await
            .expect("append");
        assert_eq!(appended, 2);

        let requests = server.received_requests().await.expect("recorded requests");
        let token_form = String::from_utf8_lossy(&requests[0].body).to_string();
        assert!(token_form.contains("grant_type=urn%3Aietf%3Aparams%3Aoauth%3Agrant-type%3Ajwt-bearer"));
        assert!(token_form.contains("assertion="));

        let body: Value = requests[1].body_json().expect("json body");
        let rows = body["values"].as_array().expect("values");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][0], "Park");
        assert_eq!(rows[0][1], 3.0);
        assert_eq!(rows[0][2], "Review fractions");
        assert!(rows[0][3].as_str().unwrap_or_default().contains("\"q_num\":1"));
        assert_eq!(rows[1][0], "Error");
        assert_eq!(rows[1][3], "[]");
    }

    #[tokio::test]
    async fn token_rejection_is_an_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": "invalid_grant",
                "error_description": "Invalid JWT Signature."
            })))
            .mount(&server)
            .await;

        let err = exporter(&server).append_results("sheet123", &results()).await.unwrap_err();
        match err {
            ExportError::Auth(detail) => assert!(detail.contains("Invalid JWT Signature.")),
            other => panic!("expected auth error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn append_rejection_is_reported() {
        let server = MockServer::start().await;
        mount_token(&server).await;
        Mock::given(method("POST"))
            .and(path("/v4/spreadsheets/sheet123/values/A1:append"))
            .respond_with(ResponseTemplate::new(403).set_body_json(json!({
                "error": {"code": 403, "message": "The caller does not have permission", "status": "PERMISSION_DENIED"}
            })))
            .mount(&server)
            .await;

        let err = exporter(&server).append_results("sheet123", &results()).await.unwrap_err();
        assert!(matches!(err, ExportError::Rejected { status: 403, ref message } if message.contains("permission")));
    }

    #[tokio::test]
    async fn invalid_url_fails_before_any_request() {
        let server = MockServer::start().await;
        let err = exporter(&server)
            .append_results("https://example.com/not-a-sheet", &results())
            .await
            .unwrap_err();
        assert!(matches!(err, ExportError::InvalidSpreadsheetUrl(_)));
        assert!(server.received_requests().await.unwrap_or_default().is_empty());
    }

    #[test]
    fn spreadsheet_id_parsing() {
        assert_eq!(
            spreadsheet_id_from_url("https://docs.google.com/spreadsheets/d/1AbC_d-9/edit?usp=sharing")
                .unwrap(),
            "1AbC_d-9"
        );
        assert_eq!(spreadsheet_id_from_url(" 1AbC ").unwrap(), "1AbC");
        assert!(spreadsheet_id_from_url("https://docs.google.com/spreadsheets/d/").is_err());
        assert!(spreadsheet_id_from_url("").is_err());
    }

    #[test]
    fn service_account_requires_key_material() {
        let err = parse_service_account(r#"{"client_email": "", "private_key": ""}"#).unwrap_err();
        assert!(matches!(err, ExportError::Credentials(_)));

        let key = parse_service_account(
            r#"{"type": "service_account", "client_email": "a@b", "private_key": "pem"}"#,
        )
        .expect("parsed");
        assert_eq!(key.token_uri, DEFAULT_TOKEN_URI);
    }
}
