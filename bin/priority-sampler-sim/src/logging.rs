use anyhow::Error;
use tracing_subscriber::{filter::LevelFilter, fmt, layer::SubscriberExt as _, util::SubscriberInitExt as _, EnvFilter};

/// Initializes logging.
///
/// Directives are read from `DD_LOG_LEVEL`, defaulting to `INFO`. Logs are written as JSON when `DD_LOG_FORMAT_JSON`
/// is `true` or `1`, and in a compact, human-readable format otherwise.
pub fn initialize_logging() -> Result<(), Error> {
    let is_json = std::env::var("DD_LOG_FORMAT_JSON")
        .map(|s| s.trim().to_lowercase())
        .map(|s| s == "true" || s == "1")
        .unwrap_or(false);

    let level_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var("DD_LOG_LEVEL")
        .from_env_lossy();

    let json_layer = is_json.then(|| fmt::layer().json().flatten_event(true).with_target(true));
    let compact_layer = (!is_json).then(|| fmt::layer().compact().with_ansi(true).with_target(true));

    tracing_subscriber::registry()
        .with(level_filter)
        .with(json_layer)
        .with(compact_layer)
        .try_init()?;

    Ok(())
}
