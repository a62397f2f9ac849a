//! Error types for PendingDNS
//!
//! The platform distinguishes a small number of failure kinds with very
//! different handling policies: rejected input returns an empty result to the
//! caller, storage trouble propagates verbatim, upstream trouble is absorbed
//! through caches where possible, and fatal conditions terminate the worker
//! so the supervisor can respawn it.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Main error type for PendingDNS operations
#[derive(Error, Debug)]
pub enum PendingError {
    /// The caller handed us something we refuse to act on (bad domain,
    /// unknown record type, malformed id). Mapped to `false`/`None` at the
    /// operation boundary, never to a transport error.
    #[error("rejected input: {reason}")]
    InputRejected { reason: String },

    /// A logical miss: no such record, zone or certificate.
    #[error("not found: {what}")]
    NotFound { what: String },

    /// The key store is unreachable or misbehaving. Always propagated.
    #[error("storage error: {message}")]
    Storage {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Upstream DNS or ACME trouble (timeout, refusal, protocol error).
    #[error("external error: {operation} - {message}")]
    External {
        operation: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A response or resource outgrew its budget (UDP reply over the MTU).
    #[error("resource limit: {message}")]
    Resource { message: String },

    /// Unrecoverable condition; the worker exits non-zero and the
    /// supervisor takes it from there.
    #[error("fatal: {message}")]
    Fatal { message: String, exit_code: i32 },
}

/// Result alias for PendingDNS operations
pub type PendingResult<T> = Result<T, PendingError>;

/// Process exit codes understood by the supervisor.
pub mod exit_codes {
    /// Clean shutdown.
    pub const OK: i32 = 0;
    /// Uncaught error escaped a worker.
    pub const UNCAUGHT: i32 = 1;
    /// An async task failed without a handler.
    pub const UNHANDLED_REJECTION: i32 = 2;
    /// The process could not finish starting up.
    pub const STARTUP_FAILURE: i32 = 3;
    /// `acme.email` is missing or not a valid address.
    pub const INVALID_ACME_EMAIL: i32 = 51;
}

impl PendingError {
    pub fn input(reason: impl Into<String>) -> Self {
        Self::InputRejected {
            reason: reason.into(),
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    pub fn external(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::External {
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn fatal(message: impl Into<String>, exit_code: i32) -> Self {
        Self::Fatal {
            message: message.into(),
            exit_code,
        }
    }

    /// Exit code if this error terminates the worker.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Fatal { exit_code, .. } => *exit_code,
            _ => exit_codes::UNCAUGHT,
        }
    }

    /// Whether the operation boundary should swallow this error and hand the
    /// caller an empty result instead.
    pub fn is_logical(&self) -> bool {
        matches!(self, Self::InputRejected { .. } | Self::NotFound { .. })
    }
}

/// Wire shape of a user-visible API failure: `{message, code?, fields?}`.
///
/// The REST collaborator serializes this for every 4xx it returns; the core
/// only produces the value.
#[derive(Debug, Clone, Serialize)]
pub struct ApiFailure {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<String>>,
}

impl ApiFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            fields: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl fmt::Display for ApiFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<&PendingError> for ApiFailure {
    fn from(err: &PendingError) -> Self {
        match err {
            PendingError::InputRejected { reason } => {
                ApiFailure::new(reason.clone()).with_code("invalid_input")
            }
            PendingError::NotFound { what } => {
                ApiFailure::new(format!("{} not found", what)).with_code("not_found")
            }
            _ => ApiFailure::new("internal error").with_code("internal"),
        }
    }
}
