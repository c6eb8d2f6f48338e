//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation. Domain
//! refusals (denied allocations, denied access) are NOT errors; they are
//! returned as data. Errors cover missing ids and illegal state transitions.

use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error enum for the kernel.
#[derive(Error, Debug)]
pub enum Error {
    /// Caller supplied malformed input.
    #[error("validation error: {0}")]
    Validation(String),

    /// Unknown task, process, principal, pool, ...
    #[error("not found: {0}")]
    NotFound(String),

    /// Entity with the same id is already registered.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Structural bound reached (queue full, inbox full, process table full).
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Operation attempted on an entity in the wrong state.
    #[error("state transition error: {0}")]
    StateTransition(String),

    /// Internal errors (panicked timer callbacks and the like).
    #[error("internal error: {0}")]
    Internal(String),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors (config file loading).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for the "wrong state" family, the Rust rendition of a `false` return.
    pub fn is_state_transition(&self) -> bool {
        matches!(self, Error::StateTransition(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

// Convenience constructors
impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn already_exists(msg: impl Into<String>) -> Self {
        Self::AlreadyExists(msg.into())
    }

    pub fn quota_exceeded(msg: impl Into<String>) -> Self {
        Self::QuotaExceeded(msg.into())
    }

    pub fn state_transition(msg: impl Into<String>) -> Self {
        Self::StateTransition(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_context() {
        let err = Error::not_found("unknown task: t1");
        assert_eq!(err.to_string(), "not found: unknown task: t1");

        let err = Error::state_transition("cannot start");
        assert!(err.is_state_transition());
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_serde_error_converts() {
        let parse: std::result::Result<serde_json::Value, _> = serde_json::from_str("{");
        let err: Error = parse.unwrap_err().into();
        assert!(err.to_string().starts_with("serialization error"));
    }
}
