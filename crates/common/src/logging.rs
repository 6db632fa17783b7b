//! Tracing setup, in the shape of `cmd_util::env::config_service` from the
//! teacher workspace, generalized to take the log level from the config
//! file's `[DEFAULT] log_level` instead of an environment variable, since
//! that's where spec.md §6 puts it.

use tracing::Level;
use tracing_subscriber::{
    fmt::format::format,
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
    Layer,
};

use crate::config::LogLevel;

/// Call once at binary startup, after the config has been loaded. Returns
/// a guard that must be held for the life of the process if file logging
/// is ever wired in (kept for parity with the teacher's `TracingGuard`
/// pattern, even though we only write to stdout today).
pub struct TracingGuard {
    _private: (),
}

pub fn init(level: LogLevel) -> TracingGuard {
    let level: Level = level.as_tracing_level();
    let color_disabled = std::env::var("NO_COLOR").is_ok();
    let format_layer = tracing_subscriber::fmt::layer()
        .with_ansi(!color_disabled)
        .event_format(format().compact())
        .with_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str())),
        );
    tracing_subscriber::registry().with(format_layer).init();
    TracingGuard { _private: () }
}
