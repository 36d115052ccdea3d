use tracing_subscriber::{fmt, EnvFilter};

use crate::core::config::Settings;

pub(crate) fn init_tracing(settings: &Settings) -> anyhow::Result<()> {
    init(settings, false)
}

/// Same subscriber as the server, but logs go to stderr so the CLI can print
/// its result table on stdout.
pub(crate) fn init_cli_tracing(settings: &Settings) -> anyhow::Result<()> {
    init(settings, true)
}

fn init(settings: &Settings, stderr: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.telemetry().log_level.clone()));

    let builder = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_span_events(fmt::format::FmtSpan::CLOSE);

    let result = match (settings.telemetry().json, stderr) {
        (true, true) => builder.json().with_writer(std::io::stderr).try_init(),
        (true, false) => builder.json().try_init(),
        (false, true) => builder.with_writer(std::io::stderr).try_init(),
        (false, false) => builder.try_init(),
    };

    result.map_err(|err| anyhow::anyhow!(err.to_string()))
}
