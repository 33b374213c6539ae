//! Shared logging initialization for omnis binaries.

use std::sync::OnceLock;

static INIT: OnceLock<()> = OnceLock::new();

fn parse_level() -> tracing::Level {
    match std::env::var("OMNIS_LOG")
        .unwrap_or_else(|_| "info".to_string())
        .to_ascii_lowercase()
        .as_str()
    {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    }
}

/// Initialize process-level tracing output.
///
/// The level comes from `override_level` when given (e.g. a `--verbose`
/// flag), otherwise from `OMNIS_LOG`. Safe to call multiple times; only the
/// first call initializes the subscriber. Intentionally best-effort and
/// never returns an error.
pub fn init(override_level: Option<tracing::Level>) {
    if INIT.get().is_some() {
        return;
    }
    let level = override_level.unwrap_or_else(parse_level);
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .try_init();
    let _ = INIT.set(());
}
