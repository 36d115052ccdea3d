use std::path::PathBuf;

use super::parsing::{
    env_optional, env_or_default, is_supported_document_extension, parse_bool,
    parse_cors_origins, parse_environment, parse_f64, parse_pacing, parse_string_list, parse_u32,
    parse_u64,
};
use super::types::{
    ApiSettings, ConfigError, CorsSettings, GeminiSettings, GradingSettings, RuntimeSettings,
    ServerHost, ServerPort, ServerSettings, Settings, SheetsSettings, TelemetrySettings,
    UploadSettings,
};

impl Settings {
    pub(crate) fn load() -> Result<Self, ConfigError> {
        let host = env_or_default("GRADER_HOST", "0.0.0.0");
        let port = env_or_default("GRADER_PORT", "8000");

        let environment =
            parse_environment(env_optional("GRADER_ENV").or_else(|| env_optional("ENVIRONMENT")));
        let strict_config =
            env_optional("GRADER_STRICT_CONFIG").map(|value| parse_bool(&value)).unwrap_or(false)
                || environment.is_production();

        let project_name = env_or_default("PROJECT_NAME", "Grading Assistant API");
        let version = env_or_default("VERSION", env!("CARGO_PKG_VERSION"));
        let api_v1_str = env_or_default("API_V1_STR", "/api/v1");

        let cors_origins = parse_cors_origins(env_optional("BACKEND_CORS_ORIGINS"))?;

        let gemini_api_key = env_or_default("GEMINI_API_KEY", "");
        let gemini_base_url =
            env_or_default("GEMINI_BASE_URL", "https://generativelanguage.googleapis.com");
        let gemini_model = env_or_default("GEMINI_MODEL", "gemini-2.0-flash-exp");
        let gemini_temperature =
            parse_f64("GEMINI_TEMPERATURE", env_or_default("GEMINI_TEMPERATURE", "0.2"))?;
        let request_timeout_seconds =
            parse_u64("GEMINI_REQUEST_TIMEOUT", env_or_default("GEMINI_REQUEST_TIMEOUT", "600"))?;
        let poll_interval_ms =
            parse_u64("GEMINI_POLL_INTERVAL_MS", env_or_default("GEMINI_POLL_INTERVAL_MS", "1000"))?;
        let max_poll_attempts = parse_u32(
            "GEMINI_MAX_POLL_ATTEMPTS",
            env_or_default("GEMINI_MAX_POLL_ATTEMPTS", "300"),
        )?;

        let pacing = parse_pacing(env_or_default("GRADING_PACING", "fixed"))?;
        let delay_ms = parse_u64("GRADING_DELAY_MS", env_or_default("GRADING_DELAY_MS", "1000"))?;
        let max_delay_ms =
            parse_u64("GRADING_MAX_DELAY_MS", env_or_default("GRADING_MAX_DELAY_MS", "30000"))?;

        let max_upload_size_mb =
            parse_u64("MAX_UPLOAD_SIZE_MB", env_or_default("MAX_UPLOAD_SIZE_MB", "20"))?;
        let max_batch_size_mb =
            parse_u64("MAX_BATCH_SIZE_MB", env_or_default("MAX_BATCH_SIZE_MB", "200"))?;
        let allowed_document_extensions = parse_string_list(
            env_optional("ALLOWED_DOCUMENT_EXTENSIONS"),
            &["pdf", "png", "jpg", "jpeg"],
        );

        let service_account_file = env_optional("GOOGLE_SERVICE_ACCOUNT_FILE").map(PathBuf::from);
        let sheets_base_url = env_or_default("SHEETS_BASE_URL", "https://sheets.googleapis.com");
        let sheets_range = env_or_default("SHEETS_RANGE", "A1");

        let log_level = env_or_default("GRADER_LOG_LEVEL", "info");
        let json = env_optional("GRADER_LOG_JSON").map(|value| parse_bool(&value)).unwrap_or(false);
        let prometheus_enabled =
            env_optional("PROMETHEUS_ENABLED").map(|value| parse_bool(&value)).unwrap_or(false);

        let settings = Self {
            server: ServerSettings { host: ServerHost::parse(host)?, port: ServerPort::parse(port)? },
            runtime: RuntimeSettings { environment, strict_config },
            api: ApiSettings { project_name, version, api_v1_str },
            cors: CorsSettings { origins: cors_origins },
            gemini: GeminiSettings {
                api_key: gemini_api_key,
                base_url: gemini_base_url,
                model: gemini_model,
                temperature: gemini_temperature,
                request_timeout_seconds,
                poll_interval_ms,
                max_poll_attempts,
            },
            grading: GradingSettings { pacing, delay_ms, max_delay_ms },
            uploads: UploadSettings {
                max_upload_size_mb,
                max_batch_size_mb,
                allowed_document_extensions,
            },
            sheets: SheetsSettings {
                service_account_file,
                base_url: sheets_base_url,
                range: sheets_range,
            },
            telemetry: TelemetrySettings { log_level, json, prometheus_enabled },
        };

        settings.validate()?;

        Ok(settings)
    }

    pub(crate) fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host.0, self.server.port.0)
    }

    pub(crate) fn server_host(&self) -> &str {
        &self.server.host.0
    }

    pub(crate) fn server_port(&self) -> u16 {
        self.server.port.0
    }

    pub(crate) fn api(&self) -> &ApiSettings {
        &self.api
    }

    pub(crate) fn cors(&self) -> &CorsSettings {
        &self.cors
    }

    pub(crate) fn gemini(&self) -> &GeminiSettings {
        &self.gemini
    }

    pub(crate) fn grading(&self) -> &GradingSettings {
        &self.grading
    }

    pub(crate) fn uploads(&self) -> &UploadSettings {
        &self.uploads
    }

    pub(crate) fn sheets(&self) -> &SheetsSettings {
        &self.sheets
    }

    pub(crate) fn telemetry(&self) -> &TelemetrySettings {
        &self.telemetry
    }

    pub(crate) fn runtime(&self) -> &RuntimeSettings {
        &self.runtime
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.uploads.allowed_document_extensions.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "ALLOWED_DOCUMENT_EXTENSIONS",
                value: String::from("<empty>"),
            });
        }
        for extension in &self.uploads.allowed_document_extensions {
            if !is_supported_document_extension(extension) {
                return Err(ConfigError::InvalidValue {
                    field: "ALLOWED_DOCUMENT_EXTENSIONS",
                    value: extension.clone(),
                });
            }
        }

        if self.gemini.max_poll_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "GEMINI_MAX_POLL_ATTEMPTS",
                value: String::from("0"),
            });
        }

        if self.grading.max_delay_ms < self.grading.delay_ms {
            return Err(ConfigError::InvalidValue {
                field: "GRADING_MAX_DELAY_MS",
                value: self.grading.max_delay_ms.to_string(),
            });
        }

        if !(self.runtime.strict_config || self.runtime.environment.is_production()) {
            return Ok(());
        }

        if self.gemini.api_key.is_empty() {
            return Err(ConfigError::MissingSecret("GEMINI_API_KEY"));
        }

        Ok(())
    }
}
