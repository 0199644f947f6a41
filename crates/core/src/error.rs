//! Why an aggregate rejected a command.

use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

/// A command rejection decided by an aggregate's `handle`.
///
/// Rejections are deterministic: replaying the same command against the same
/// state rejects it again. Storage and delivery failures are not represented
/// here.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// The command itself is malformed, whatever the state.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The state does not allow the command yet, or no longer does.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Accepting the command would break a rule the aggregate must keep.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl DomainError {
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation(reason.into())
    }

    pub fn conflict(reason: impl Into<String>) -> Self {
        Self::Conflict(reason.into())
    }

    pub fn invariant(reason: impl Into<String>) -> Self {
        Self::InvariantViolation(reason.into())
    }

    pub fn invalid_id(reason: impl Into<String>) -> Self {
        Self::InvalidId(reason.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_kind_of_rejection() {
        assert_eq!(
            DomainError::validation("quantity must be positive").to_string(),
            "validation failed: quantity must be positive"
        );
        assert_eq!(DomainError::conflict("already placed").to_string(), "conflict: already placed");
        assert_eq!(
            DomainError::invariant("empty order").to_string(),
            "invariant violated: empty order"
        );
    }
}
