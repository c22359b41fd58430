//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic input failures (validation, parsing).
/// Broker and store concerns belong to the infrastructure crates.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. out-of-range coordinate).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}

/// Failure to interpret a broker topic or topic filter.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TopicError {
    /// The topic did not split into the expected number of segments.
    ///
    /// Events carried by such topics are dropped and never retried.
    #[error("malformed topic: expected {expected} segments, found {found}")]
    Malformed { expected: usize, found: usize },

    /// A subscription filter violates wildcard placement rules.
    #[error("invalid topic filter '{filter}': {reason}")]
    InvalidFilter { filter: String, reason: &'static str },

    /// A geohash head segment was not of the form `lat;lon`.
    #[error("invalid geohash head '{0}'")]
    InvalidGeohashHead(String),
}
