//! Errors that callers may want to match on.
//!
//! Everything else is propagated as [`anyhow::Error`] with context attached.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TraceError {
    /// No command was configured. Raised before any probe is touched.
    #[error("command not set")]
    CommandNotSet,
    /// A probe could not be attached, the trace would be structurally incomplete.
    #[error("failed to attach {probe}: {reason}")]
    Attach { probe: String, reason: String },
    #[error("invalid time unit '{0}', expected one of ns, us, ms, s")]
    InvalidTimeUnit(String),
    #[error("invalid source '{name}', valid sources: {valid}")]
    InvalidSource { name: String, valid: String },
    #[error("source '{0}' selected more than once")]
    DuplicateSource(String),
    #[error("failed to launch command: {0}")]
    Launch(String),
}
