//! Error types for the Shepherd core library.

use thiserror::Error;

/// Result type alias using the Shepherd core Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for protocol and specification handling.
#[derive(Debug, Error)]
pub enum Error {
    /// A control line carried a keyword the agent does not understand.
    #[error("Unknown control keyword: {0}")]
    UnknownKeyword(String),

    /// A protocol line's payload did not match its keyword.
    #[error("Malformed {keyword} payload: {line}")]
    Malformed { keyword: String, line: String },

    /// A `state` line carried an unrecognized state token.
    #[error("Unknown process state: {0}")]
    UnknownState(String),

    /// A command specification is unusable.
    #[error("Invalid command spec: {0}")]
    Spec(String),
}
