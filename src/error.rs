//! Error types for the Nebula reconciliation engine.
//!
//! This module provides the error hierarchy for every stage of a
//! reconciliation: configuration and validation, remote calls, state waits,
//! identity resolution, partial updates and applied-state storage.

use std::path::PathBuf;
use thiserror::Error;

use crate::drivers::ResourceKind;

/// The main error type for the Nebula reconciliation engine.
#[derive(Debug, Error)]
pub enum NebulaError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Applied-state storage errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Remote API errors.
    #[error("OpenNebula API error: {0}")]
    Remote(#[from] RemoteError),

    /// Errors while waiting for a resource to settle.
    #[error("Wait error: {0}")]
    Wait(#[from] WaitError),

    /// Reconciliation errors.
    #[error("Reconciliation error: {0}")]
    Reconcile(#[from] ReconcileError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed. Raised before any remote call and never retried.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// Environment variable is missing.
    #[error("Missing environment variable: {name}")]
    MissingEnvVar {
        /// Name of the missing variable.
        name: String,
    },
}

/// Applied-state storage errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// State is corrupted.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// State lock is held by another process.
    #[error("State is locked by another process (lock holder: {holder}, since: {since})")]
    LockedByOther {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// Failed to acquire or release the state lock.
    #[error("State lock error: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// The state file could not be written or removed.
    #[error("State storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
    },

    /// State version mismatch.
    #[error("State version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected state version.
        expected: String,
        /// Found state version.
        found: String,
    },
}

/// Remote call errors.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// Authentication failed.
    #[error("authentication failed: {message}")]
    AuthenticationFailed {
        /// Description of the auth failure.
        message: String,
    },

    /// The HTTP endpoint rejected the request.
    #[error("request failed: {status} - {message}")]
    ApiRequestFailed {
        /// HTTP status code.
        status: u16,
        /// Response body.
        message: String,
    },

    /// The API answered the call with a failure.
    #[error("{method} failed (code {code}): {message}")]
    Fault {
        /// Remote method name.
        method: String,
        /// Error code reported by the API.
        code: i64,
        /// Error text reported by the API.
        message: String,
    },

    /// Network error.
    #[error("network error communicating with OpenNebula: {message}")]
    NetworkError {
        /// Description of the network error.
        message: String,
    },

    /// Invalid response from API.
    #[error("invalid response from OpenNebula: {message}")]
    InvalidResponse {
        /// Description of the response issue.
        message: String,
    },
}

/// Errors raised by the state poller.
#[derive(Debug, Error)]
pub enum WaitError {
    /// The target classification was not reached before the deadline.
    #[error("timeout waiting for {kind} {id} to reach state {target} (last state: {last_state})")]
    Timeout {
        /// Kind of resource.
        kind: ResourceKind,
        /// Last known numeric ID.
        id: i64,
        /// Target classification.
        target: String,
        /// Last observed classification.
        last_state: String,
    },

    /// The resource entered a terminal failure classification.
    #[error("{kind} {id} entered a failure state: {message}")]
    Failed {
        /// Kind of resource.
        kind: ResourceKind,
        /// Numeric ID.
        id: i64,
        /// Best-available diagnostic.
        message: String,
    },
}

/// Reconciliation errors.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// A reference that must exist could not be resolved.
    #[error("{kind} '{reference}' not found")]
    NotFound {
        /// Kind of resource.
        kind: ResourceKind,
        /// Reference that failed to resolve (ID or name).
        reference: String,
    },

    /// The update sequencer stopped partway; earlier steps stay applied.
    #[error("update of {kind} {id} stopped at step '{step}' (applied: [{}]): {reason}", .applied.join(", "))]
    PartialUpdate {
        /// Kind of resource.
        kind: ResourceKind,
        /// Numeric ID.
        id: i64,
        /// First step that did not complete.
        step: String,
        /// Steps applied before the failure.
        applied: Vec<String>,
        /// Proximate failure text.
        reason: String,
    },
}

/// Result type alias for Nebula operations.
pub type Result<T> = std::result::Result<T, NebulaError>;

impl NebulaError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error is a transport failure worth retrying by the caller.
    ///
    /// The engine itself never retries.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Remote(RemoteError::NetworkError { .. }))
    }

    /// Returns true if the API reported that the object does not exist.
    ///
    /// Other API failures, such as authorization faults, do not count.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::Remote(RemoteError::Fault {
                code: RemoteError::NO_EXISTS,
                ..
            })
        )
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }
}

impl RemoteError {
    /// Fault code the API uses for a missing object.
    pub const NO_EXISTS: i64 = 0x400;

    /// Creates an API request error.
    #[must_use]
    pub fn api_error(status: u16, message: impl Into<String>) -> Self {
        Self::ApiRequestFailed {
            status,
            message: message.into(),
        }
    }

    /// Creates a network error.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkError {
            message: message.into(),
        }
    }

    /// Creates an invalid-response error.
    #[must_use]
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidResponse {
            message: message.into(),
        }
    }
}
