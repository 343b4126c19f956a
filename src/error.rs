//! Error types for inventory synchronization
//!
//! Errors are structured with fields to aid debugging in production. Each
//! variant carries the resource kind or store context it happened in.
//! Failures scoped to one instance or one reference never surface here;
//! they are absorbed by the parser and resolver and recorded in the pass
//! report instead.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for inventory operations
#[derive(Debug, Error)]
pub enum Error {
    /// Network or transport failure talking to the API server
    #[error("remote unavailable [{kind}]: {message}")]
    RemoteUnavailable {
        /// Resource kind being collected
        kind: String,
        /// Description of what failed
        message: String,
    },

    /// The API server refused the request (authentication or permission)
    #[error("remote rejected [{kind}] with status {status}: {message}")]
    RemoteRejected {
        /// Resource kind being collected
        kind: String,
        /// HTTP status returned by the API server
        status: u16,
        /// Description of what failed
        message: String,
    },

    /// A single raw instance could not be mapped into the graph
    #[error("parse failure for {kind} {name}: {message}")]
    Parse {
        /// Resource kind of the instance
        kind: String,
        /// Namespaced name of the instance
        name: String,
        /// Description of what's invalid
        message: String,
    },

    /// A compare-and-swap write lost against a concurrent writer
    #[error("apply conflict for {kind} {identity}")]
    ApplyConflict {
        /// Entity kind being written
        kind: String,
        /// Remote identity of the conflicting entity
        identity: String,
    },

    /// The watch stream violated the notice protocol
    #[error("protocol violation [{kind}]: {message}")]
    Protocol {
        /// Resource kind being watched
        kind: String,
        /// Description of the violation
        message: String,
    },

    /// Persisted store failure
    #[error("store error [{context}]: {message}")]
    Store {
        /// Operation that failed (e.g., "upsert", "archive")
        context: String,
        /// Description of what failed
        message: String,
    },

    /// Invalid configuration
    #[error("configuration error: {message}")]
    Config {
        /// Description of what's invalid
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Context where the error occurred (e.g., "pass", "supervisor")
        context: String,
        /// Description of what failed
        message: String,
    },
}

impl Error {
    /// Create a remote-unavailable error for a resource kind
    pub fn remote_unavailable(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::RemoteUnavailable {
            kind: kind.into(),
            message: msg.into(),
        }
    }

    /// Create a remote-rejected error for a resource kind
    pub fn remote_rejected(kind: impl Into<String>, status: u16, msg: impl Into<String>) -> Self {
        Self::RemoteRejected {
            kind: kind.into(),
            status,
            message: msg.into(),
        }
    }

    /// Create a parse failure for one instance
    pub fn parse(kind: impl Into<String>, name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Parse {
            kind: kind.into(),
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Create an apply conflict error
    pub fn apply_conflict(kind: impl Into<String>, identity: impl Into<String>) -> Self {
        Self::ApplyConflict {
            kind: kind.into(),
            identity: identity.into(),
        }
    }

    /// Create a protocol violation error
    pub fn protocol(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Protocol {
            kind: kind.into(),
            message: msg.into(),
        }
    }

    /// Create a store error with the failing operation as context
    pub fn store(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Store {
            context: context.into(),
            message: msg.into(),
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            context: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            context: context.into(),
            message: msg.into(),
        }
    }

    /// Classify a kube-rs error raised while talking to the API server
    ///
    /// 401 and 403 are rejections; everything else (transport, 5xx, decode
    /// failures of the response envelope) counts as unavailability.
    pub fn from_kube(kind: impl Into<String>, err: kube::Error) -> Self {
        let kind = kind.into();
        match err {
            kube::Error::Api(resp) if resp.code == 401 || resp.code == 403 => {
                Self::remote_rejected(kind, resp.code, resp.message)
            }
            other => Self::remote_unavailable(kind, other.to_string()),
        }
    }

    /// Returns true if this error is transient and the operation may succeed on retry
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RemoteUnavailable { .. }
                | Self::RemoteRejected { .. }
                | Self::Protocol { .. }
                | Self::ApplyConflict { .. }
        )
    }

    /// Returns true if the API server refused our credentials or permissions
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::RemoteRejected { .. })
    }
}

impl From<sled::Error> for Error {
    fn from(e: sled::Error) -> Self {
        Self::store("sled", e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::store("encoding", e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Self::config(e.to_string())
    }
}
