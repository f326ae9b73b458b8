use tracing_subscriber::{fmt, EnvFilter};

use crate::cfg::LogFormat;

/// Initialize `tracing` once. Respects `RUST_LOG`; falls back to `default_level`.
pub fn init(default_level: &str) {
    init_with(default_level, LogFormat::Pretty);
}

/// Initialize `tracing` once with an explicit output format.
///
/// Later calls are no-ops, so tests and the CLI can both call this freely.
/// Output goes to stderr; stdout is reserved for command output.
pub fn init_with(default_level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr);
    let _ = match format {
        LogFormat::Pretty => builder.try_init(),
        LogFormat::Json => builder.json().with_current_span(false).try_init(),
    };
}
