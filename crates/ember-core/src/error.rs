//! Error types for ember-core.

use thiserror::Error;

/// Result type for ember-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in ember-core.
#[derive(Debug, Error)]
pub enum Error {
    /// No worker could be started and handshaken within the connection budget.
    #[error("connection error: {0}")]
    Connection(String),

    /// The invocation failed after all same-process and process retries.
    ///
    /// `stack` carries the callee's stack trace when the worker reported one.
    #[error("invocation error: {message}")]
    Invocation {
        message: String,
        stack: Option<String>,
    },

    /// The caller cancelled the invocation.
    #[error("invocation cancelled")]
    Cancelled,

    /// Malformed invocation request.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Serialization error (request arguments or response body).
    #[error("serialization error: {0}")]
    Serialization(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// File watch error.
    #[error("file watch error: {0}")]
    Watch(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The engine was disposed.
    #[error("engine disposed")]
    Disposed,
}

impl Error {
    /// The callee's stack trace, if the worker reported one.
    pub fn callee_stack(&self) -> Option<&str> {
        match self {
            Error::Invocation { stack, .. } => stack.as_deref(),
            _ => None,
        }
    }

    /// Render the error together with its callee stack, if any.
    pub fn with_stack(&self) -> String {
        match self.callee_stack() {
            Some(stack) => format!("{}\n{}", self, stack),
            None => self.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<notify::Error> for Error {
    fn from(e: notify::Error) -> Self {
        Self::Watch(e.to_string())
    }
}
