// ⚠️ Error Taxonomy
// NotFound, ValidationFailed, UnresolvedReference, StoreUnavailable, Cancelled

use crate::entities::CodeSystem;
use rusqlite::ErrorCode;
use thiserror::Error;

// ============================================================================
// VALIDATION ERROR
// ============================================================================

/// A single rule violation found while validating a record on the write path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
    pub context: String,
}

impl ValidationError {
    pub fn new(
        context: impl Into<String>,
        field: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        ValidationError {
            field: field.into(),
            message: message.into(),
            context: context.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}: {}", self.context, self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

// ============================================================================
// BRIDGE ERROR
// ============================================================================

#[derive(Debug, Error)]
pub enum BridgeError {
    /// Entity absent. A negative result for `translate`, an error for `get`.
    #[error("code {code} not found in {system}")]
    NotFound { system: CodeSystem, code: String },

    /// Uniqueness or range invariant violated; the write was rejected in full.
    #[error("validation failed: {}", summarize(.0))]
    ValidationFailed(Vec<ValidationError>),

    /// A mapping points at a code the registry does not know yet.
    ///
    /// Informational only: the resolver reports forward references in-band
    /// as a result with `resolved == false` and never returns this variant.
    #[error("code {code} in {system} is referenced but not registered")]
    UnresolvedReference { system: CodeSystem, code: String },

    /// Backend I/O failure. Never retried here.
    #[error("storage backend unavailable: {0}")]
    StoreUnavailable(#[source] rusqlite::Error),

    /// Caller deadline exceeded or cancellation requested.
    #[error("operation cancelled before completion")]
    Cancelled,
}

impl BridgeError {
    pub fn validation(
        context: impl Into<String>,
        field: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        BridgeError::ValidationFailed(vec![ValidationError::new(context, field, message)])
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, BridgeError::NotFound { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, BridgeError::Cancelled)
    }
}

impl From<rusqlite::Error> for BridgeError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(code, _)
                if code.code == ErrorCode::OperationInterrupted =>
            {
                BridgeError::Cancelled
            }
            rusqlite::Error::SqliteFailure(code, _)
                if code.code == ErrorCode::ConstraintViolation =>
            {
                BridgeError::validation("store", "unique_index", err.to_string())
            }
            _ => BridgeError::StoreUnavailable(err),
        }
    }
}

fn summarize(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Unknown textual value for one of the closed enums (system, module, status, ...).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind}: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    pub fn new(kind: &'static str, value: &str) -> Self {
        ParseEnumError {
            kind,
            value: value.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constraint_violation_maps_to_validation_failed() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE),
            Some("UNIQUE constraint failed: namaste_codes.code".to_string()),
        );

        let mapped: BridgeError = err.into();
        assert!(matches!(mapped, BridgeError::ValidationFailed(_)));
    }

    #[test]
    fn test_interrupt_maps_to_cancelled() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_INTERRUPT),
            None,
        );

        let mapped: BridgeError = err.into();
        assert!(mapped.is_cancelled());
    }

    #[test]
    fn test_other_failures_surface_as_store_unavailable() {
        let mapped: BridgeError = rusqlite::Error::InvalidQuery.into();
        assert!(matches!(mapped, BridgeError::StoreUnavailable(_)));
    }

    #[test]
    fn test_validation_message_lists_every_issue() {
        let err = BridgeError::ValidationFailed(vec![
            ValidationError::new("ConceptMapping", "confidence", "out of range"),
            ValidationError::new("ConceptMapping", "sourceCode", "empty"),
        ]);

        let message = err.to_string();
        assert!(message.contains("confidence: out of range"));
        assert!(message.contains("sourceCode: empty"));
    }
}
