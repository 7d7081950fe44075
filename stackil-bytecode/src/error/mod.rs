//! Error types for metadata construction

use thiserror::Error;

/// Errors raised while building type metadata
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BytecodeError {
    #[error("Type {0} is already declared")]
    DuplicateType(String),

    #[error("Declaring {0} would create an inheritance cycle")]
    InheritanceCycle(String),
}

/// Convenient Result type
pub type Result<T> = std::result::Result<T, BytecodeError>;
