//! Error taxonomy shared by the widgets.
//!
//! None of these are fatal: sources that are not loaded yet degrade to
//! "no data", malformed tokens are skipped, and rejected write-backs are
//! reported to the caller without retry.

use thiserror::Error;

/// The host chat log could not be read.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("chat log source unavailable: {0}")]
    Unavailable(String),
}

/// A bracket fragment that looked like a token but could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseSkip {
    #[error("unknown token label '{0}'")]
    UnknownLabel(String),
    #[error("token '{label}' needs {expected} field(s), found {found}")]
    MissingFields {
        label: String,
        expected: usize,
        found: usize,
    },
}

/// A write-back could not be delivered to the host input controls.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WriteBackError {
    #[error("host input controls are not available")]
    ControlsMissing,
    #[error("host send control is disabled")]
    SendDisabled,
    #[error("invalid write-back action: {0}")]
    InvalidAction(String),
    #[error("host send failed: {0}")]
    Host(String),
    #[error("superseded tokens could not be patched: {0}")]
    Patch(#[from] SourceError),
}
