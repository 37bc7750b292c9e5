//! Error types and the retry classification they drive
//!
//! Every failure raised inside the crate is an `InferenceError`; the retry
//! machinery never inspects strings, only `ErrorClass`. Budget exhaustion of
//! the tool loop is deliberately NOT represented here; it is a normal
//! terminal state of [`crate::tool_loop::LoopStatus`], not an error.

use std::time::Duration;

use thiserror::Error;

use crate::provider::Provider;

/// Result type alias used throughout the crate
pub type Result<T> = std::result::Result<T, InferenceError>;

/// Main error type for the inference core
#[derive(Debug, Error)]
pub enum InferenceError {
    /// Credential problem (401/403, missing or invalid key). Permanent.
    #[error("authentication failed: {message}")]
    Auth { message: String },

    /// An outbound call exceeded its deadline
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Upstream asked us to slow down (429)
    #[error("rate limited: {message}")]
    RateLimited { message: String },

    /// Connection-level failure (reset, DNS, unreachable)
    #[error("transport error: {message}")]
    Transport { message: String },

    /// Non-2xx response from the model endpoint
    #[error("upstream returned status {status}: {message}")]
    Upstream { status: u16, message: String },

    /// Response had an unexpected shape
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Provider is known but has no integrated flow
    #[error("provider {provider} is not integrated")]
    ProviderNotIntegrated { provider: Provider },

    /// Tool execution error, distinct from provider failures
    #[error("tool {name} failed: {message}")]
    ToolFailed { name: String, message: String },

    /// Composite error after the retry budget ran out
    #[error("request failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: usize,
        #[source]
        last: Box<InferenceError>,
    },

    /// Anything that escaped the taxonomy above
    #[error("{0}")]
    Internal(String),
}

/// How a failure should be treated by retry logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Never retried; surfaced immediately with the original cause
    Permanent,
    /// Retried with backoff until the budget is exhausted
    Transient,
    /// Retrying cannot fix a parse error; never retried
    Protocol,
}

impl InferenceError {
    pub fn class(&self) -> ErrorClass {
        match self {
            InferenceError::Auth { .. } | InferenceError::ProviderNotIntegrated { .. } => {
                ErrorClass::Permanent
            }
            InferenceError::Timeout(_)
            | InferenceError::RateLimited { .. }
            | InferenceError::Transport { .. }
            | InferenceError::ToolFailed { .. }
            | InferenceError::Internal(_) => ErrorClass::Transient,
            InferenceError::Upstream { status, .. } => {
                if *status >= 500 {
                    ErrorClass::Transient
                } else {
                    ErrorClass::Permanent
                }
            }
            InferenceError::Protocol(_) | InferenceError::Serialization(_) => ErrorClass::Protocol,
            // Already carries an exhausted budget; retrying again is pointless.
            InferenceError::RetriesExhausted { .. } => ErrorClass::Permanent,
        }
    }

    /// Map an HTTP status from a model endpoint into the taxonomy.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 | 403 => InferenceError::Auth { message },
            429 => InferenceError::RateLimited { message },
            _ => InferenceError::Upstream { status, message },
        }
    }

    /// Recover a typed error from a `tower::BoxError`.
    pub fn from_boxed(err: tower::BoxError) -> Self {
        match err.downcast::<InferenceError>() {
            Ok(typed) => *typed,
            Err(other) => InferenceError::Internal(other.to_string()),
        }
    }
}
