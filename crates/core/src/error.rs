//! Error types for pinstore
//!
//! This module defines the error taxonomy shared by the storage layer and
//! the classification engine. We use `thiserror` for automatic `Display`
//! and `Error` trait implementations.
//!
//! The engine distinguishes between errors it absorbs locally (a missing
//! entry on delete, a key tuple that cannot be typed) and errors that must
//! propagate to the enclosing transaction. See [`Error::is_fatal`].

use crate::types::ClassId;
use std::io;
use thiserror::Error;

/// Result type alias for pinstore operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for pinstore
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (config files)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Memory budget or page space exhausted
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Entry, class or pin not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Entry or registration already present
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Value cannot be converted to the type a key segment expects
    #[error("Type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        /// Type required by the key segment
        expected: &'static str,
        /// Type of the offered value
        actual: &'static str,
    },

    /// Persisted class descriptor could not be decoded
    #[error("Corrupted class {cid}: {reason}")]
    Corruption {
        /// Class whose descriptor is damaged
        cid: ClassId,
        /// What failed to decode
        reason: String,
    },

    /// Action hook failed after its sub-transaction regressed
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// Invalid operation or state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Invalid configuration
    #[error("Config error: {0}")]
    Config(String),
}

impl Error {
    /// Shorthand for a `NotFound` error
    pub fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound(what.into())
    }

    /// Shorthand for an `InvalidOperation` error
    pub fn invalid(what: impl Into<String>) -> Self {
        Error::InvalidOperation(what.into())
    }

    /// True for `NotFound`
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// True for errors that must abort the enclosing operation
    ///
    /// Resource exhaustion, corruption and I/O failures are never absorbed.
    /// Everything else may be converted to success by a caller that knows
    /// the condition is benign at its call site.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::ResourceExhausted(_) | Error::Corruption { .. }
        )
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_type_mismatch() {
        let err = Error::TypeMismatch {
            expected: "Int",
            actual: "String",
        };
        let msg = err.to_string();
        assert!(msg.contains("Type mismatch"));
        assert!(msg.contains("Int"));
        assert!(msg.contains("String"));
    }

    #[test]
    fn test_error_display_corruption() {
        let err = Error::Corruption {
            cid: ClassId(7),
            reason: "short descriptor".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("Corrupted class 7"));
        assert!(msg.contains("short descriptor"));
    }

    #[test]
    fn test_fatal_classification() {
        assert!(Error::ResourceExhausted("pages".into()).is_fatal());
        assert!(Error::Corruption {
            cid: ClassId(1),
            reason: String::new()
        }
        .is_fatal());
        assert!(!Error::not_found("key").is_fatal());
        assert!(!Error::AlreadyExists("cid".into()).is_fatal());
        assert!(Error::not_found("key").is_not_found());
    }

    #[test]
    fn test_error_from_io() {
        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "access denied");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_error_from_bincode() {
        let invalid_data = vec![0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF];
        let result: Result<String> = bincode::deserialize(&invalid_data).map_err(|e| e.into());
        assert!(matches!(result, Err(Error::Serialization(_))));
    }
}
