//! # Error Types — Structured Error Hierarchy
//!
//! [`FleetError`] is the error every service and store returns at its
//! public boundary. Component crates keep richer local enums and convert
//! into it with `From`.
//!
//! ## Taxonomy
//!
//! | Variant      | Meaning                                         | Retry? |
//! |--------------|-------------------------------------------------|--------|
//! | `Validation` | Malformed input, rejected before any write      | no     |
//! | `Persistence`| Transactional write failed and was rolled back  | yes    |
//! | `NotFound`   | Unknown device, policy or effective record      | no     |
//! | `Conflict`   | Priority collision or effective-policy race     | yes    |
//! | `Dependency` | Plugin or directory lookup failed               | yes    |

use thiserror::Error;

/// Top-level error type for the fleet policy engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FleetError {
    /// The request was malformed. Nothing was written.
    #[error("validation error: {0}")]
    Validation(String),

    /// A transactional write failed. The transaction was rolled back in full.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// The referenced record does not exist in the caller's tenant.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Record kind (`device`, `policy`, `effective policy`, ...).
        kind: &'static str,
        /// Identifier as supplied by the caller.
        id: String,
    },

    /// A concurrent writer won the race, or the requested state collides
    /// with existing state.
    #[error("conflict: {0}")]
    Conflict(String),

    /// An external collaborator (device-type plugin, user directory) failed.
    #[error("dependency error: {0}")]
    Dependency(String),
}

/// Coarse classification of a [`FleetError`], stable for logging and for
/// mapping onto transport status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    Persistence,
    NotFound,
    Conflict,
    Dependency,
}

impl ErrorKind {
    /// Machine-readable code (`VALIDATION_ERROR`, `NOT_FOUND`, ...).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "VALIDATION_ERROR",
            Self::Persistence => "PERSISTENCE_ERROR",
            Self::NotFound => "NOT_FOUND",
            Self::Conflict => "CONFLICT",
            Self::Dependency => "DEPENDENCY_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FleetError {
    /// Construct a not-found error for the given record kind.
    pub fn not_found(kind: &'static str, id: impl std::fmt::Display) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Construct a validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Construct a persistence error.
    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence(msg.into())
    }

    /// Construct a conflict error.
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Construct a dependency error.
    pub fn dependency(msg: impl Into<String>) -> Self {
        Self::Dependency(msg.into())
    }

    /// The coarse kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Persistence(_) => ErrorKind::Persistence,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Dependency(_) => ErrorKind::Dependency,
        }
    }

    /// Whether the caller may retry the same request later and expect a
    /// different outcome.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Persistence | ErrorKind::Conflict | ErrorKind::Dependency
        )
    }

    /// Whether this is a not-found error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Error during canonical serialization.
#[derive(Error, Debug)]
pub enum CanonicalizationError {
    /// Float values are not permitted in canonical representations.
    #[error("float values are not permitted in canonical representations: {0}")]
    FloatRejected(f64),

    /// JSON serialization failed.
    #[error("serialization failed: {0}")]
    SerializationFailed(#[from] serde_json::Error),
}

impl From<CanonicalizationError> for FleetError {
    fn from(err: CanonicalizationError) -> Self {
        Self::Validation(err.to_string())
    }
}
