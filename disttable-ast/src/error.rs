//! Error types for disttable-ast.

use thiserror::Error;

/// Statement error type
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AstError {
    /// The statement is not of the kind the caller required
    #[error("Unexpected statement kind: expected {expected}, found {found}")]
    UnexpectedKind {
        expected: &'static str,
        found: &'static str,
    },

    #[error("Invalid statement: {0}")]
    Invalid(String),
}

/// Result type for statement operations
pub type AstResult<T> = Result<T, AstError>;
