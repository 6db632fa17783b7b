//! Error taxonomy (spec.md §7): Transient / Validation / Integrity /
//! Corruption / Shutdown. These are kinds, not a strict type hierarchy —
//! each crate defines its own `thiserror` enums and tags them with
//! [`Taxonomy`] so the control loops know how to react.

use std::path::PathBuf;

/// Which policy a given failure falls under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Taxonomy {
    /// Network hiccup, catalog unavailable, disk momentarily busy.
    /// Retried locally with bounded attempts, then surfaced to the tick
    /// loop, which sleeps and retries on the next pass.
    Transient,
    /// Bad config, bad regex, bad size suffix. Fatal at startup.
    Validation,
    /// Digest mismatch, entry-count mismatch, missing entry. Non-fatal:
    /// rolled back at the record/archive level, next tick retries.
    Integrity,
    /// Unreadable archive, unknown digest algorithm. Logged, requires
    /// operator attention, other archives keep being serviced.
    Corruption,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration file {0} not found")]
    FileNotFound(PathBuf),
    #[error("error parsing configuration file {0}: {1}")]
    Parse(PathBuf, String),
    #[error("missing option {1} in section {0}")]
    MissingOption(String, String),
    #[error("invalid log_level {0}, must be one of DEBUG|INFO|WARNING|ERROR|CRITICAL")]
    InvalidLogLevel(String),
    #[error("invalid verify mode {0}, must be one of filelist|chksum|off")]
    InvalidVerifyMode(String),
    #[error("invalid numeric value for {0}")]
    InvalidNumber(String),
    #[error("invalid archive_size suffix in {0}")]
    InvalidSize(String),
    #[error("invalid regex in section {0}: {1}")]
    InvalidRegex(String, String),
    #[error("script_id {0} contains invalid characters (/, $ or NUL)")]
    InvalidScriptId(String),
    #[error("mongo_db {0} contains an invalid character (.)")]
    InvalidMongoDb(String),
    #[error("stage_wait_min is bigger than stage_wait_max")]
    StageWaitOrder,
}

impl ConfigError {
    pub fn taxonomy(&self) -> Taxonomy {
        Taxonomy::Validation
    }
}

/// Top-level error a `main()` can return; its `Display` impl is what gets
/// printed before the process exits. Exit codes (spec.md §6):
/// 2 = must run as root, 1 = fatal config or unrecoverable storage error.
#[derive(Debug, thiserror::Error)]
pub enum MainError {
    #[error("must run as root")]
    NotRoot,
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("fatal error: {0}")]
    Fatal(#[from] anyhow::Error),
}

impl MainError {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::NotRoot => 2,
            Self::Config(_) | Self::Fatal(_) => 1,
        }
    }
}
