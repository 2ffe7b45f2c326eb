//! Error types for the Matrixon appservice layer
//!
//! Errors fall in two broad families: transport failures, where no protocol
//! body came back, and protocol errors, where the homeserver answered with a
//! recognized `errcode`. Protocol errors are passed to callers untouched so
//! they can branch on the code.

use std::{io, sync::Arc, time::SystemTime};

use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::retry_after::parse_retry_after_header;

/// Well-known Matrix error codes the layer branches on.
pub mod errcode {
    pub const USER_IN_USE: &str = "M_USER_IN_USE";
    pub const LIMIT_EXCEEDED: &str = "M_LIMIT_EXCEEDED";
    pub const FORBIDDEN: &str = "M_FORBIDDEN";
    pub const NOT_FOUND: &str = "M_NOT_FOUND";
    pub const UNKNOWN: &str = "M_UNKNOWN";
}

/// A protocol-level error returned by the homeserver.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{errcode}: {error} (HTTP {status})")]
pub struct MatrixError {
    /// HTTP status of the response.
    pub status: u16,
    /// Machine-readable `errcode` from the body.
    pub errcode: String,
    /// Human-readable `error` from the body.
    pub error: String,
    /// Recommended delay before retrying, for rate-limited responses.
    pub retry_after_ms: Option<u64>,
}

impl MatrixError {
    pub fn new(status: u16, errcode: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            status,
            errcode: errcode.into(),
            error: error.into(),
            retry_after_ms: None,
        }
    }

    /// Builds an error from a response.
    ///
    /// The `Retry-After` header wins over the deprecated `retry_after_ms`
    /// body field. A header that does not parse is ignored and the body
    /// field is consulted instead; if neither yields a value the delay stays
    /// unset.
    pub fn from_response(status: u16, retry_after_header: Option<&str>, body: &Value) -> Self {
        let errcode = body
            .get("errcode")
            .and_then(Value::as_str)
            .unwrap_or(errcode::UNKNOWN);
        let error = body.get("error").and_then(Value::as_str).unwrap_or_default();

        let from_header = retry_after_header.and_then(|raw| {
            match parse_retry_after_header(raw, SystemTime::now()) {
                Ok(ms) => Some(ms),
                Err(e) => {
                    debug!("Ignoring unparseable Retry-After header: {}", e);
                    None
                }
            }
        });
        let retry_after_ms =
            from_header.or_else(|| body.get("retry_after_ms").and_then(Value::as_u64));

        Self {
            status,
            errcode: errcode.to_owned(),
            error: error.to_owned(),
            retry_after_ms,
        }
    }

    /// Whether this error carries the given `errcode`.
    pub fn is(&self, code: &str) -> bool {
        self.errcode == code
    }
}

/// Appservice layer error types
#[derive(Debug, Error)]
pub enum Error {
    /// Network failure, timeout, or a non-2xx response without a protocol body
    #[error("Transport error: {0}")]
    Transport(String),

    /// Recognized protocol error from the homeserver
    #[error("Matrix protocol error: {0}")]
    Matrix(#[from] MatrixError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Malformed Matrix identifier
    #[error("Invalid identifier: {0}")]
    InvalidId(#[from] ruma::IdParseError),

    /// Storage collaborator failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Crypto collaborator failure
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// A memoized encryption setup that already failed
    #[error("Encryption setup failed: {0}")]
    CryptoSetup(Arc<Error>),

    /// Invalid state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Result type for appservice operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// The protocol error, if this is one.
    pub fn as_matrix(&self) -> Option<&MatrixError> {
        match self {
            Error::Matrix(e) => Some(e),
            Error::CryptoSetup(inner) => inner.as_matrix(),
            _ => None,
        }
    }

    /// Whether this is a protocol error with the given `errcode`.
    pub fn is_errcode(&self, code: &str) -> bool {
        self.as_matrix().is_some_and(|e| e.is(code))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
