//! Tracing initialisation for Agentry binaries.
//!
//! Call [`init_tracing`] once at program start. Later calls are ignored,
//! since the global subscriber can only be set once per process.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Target used by the sandbox `log` module for lines written by functions.
pub const GUEST_LOG_TARGET: &str = "agentry::sandbox";

/// Filter used when `RUST_LOG` is unset: `level` everywhere, and function
/// log lines kept at `info` or louder even when `level` is quieter.
pub fn default_filter(level: Level) -> String {
    let base = level.as_str().to_ascii_lowercase();
    let guest = if level < Level::INFO { "info" } else { base.as_str() };
    format!("{base},{GUEST_LOG_TARGET}={guest}")
}

/// Install the global subscriber.
///
/// * `json`: newline-delimited JSON lines instead of human-readable text.
/// * `level`: base verbosity used when `RUST_LOG` is unset.
///
/// Output goes to stderr so command output on stdout stays machine-readable.
pub fn init_tracing(json: bool, level: Level) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(level)));
    let layer = fmt::layer().with_writer(std::io::stderr);
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry.with(layer.json()).try_init().ok();
    } else {
        registry.with(layer).try_init().ok();
    }
}
