//! Error types and Result aliases for the SELECT compiler
//!
//! Every compile step returns [`Result`]. The compile context additionally
//! remembers the first error raised so that the diagnostic surfaced to the
//! caller is always the earliest one (see `Parse::set_error`).

use std::fmt;

/// Broad classification of a compile failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Generic user error in the query
    Error,
    /// Internal invariant violation
    Internal,
    /// Allocation failure
    NoMem,
    /// Expression tree too deep
    TooBig,
    /// Bind parameter out of range
    Range,
    /// Row-value or result-column count mismatch
    Mismatch,
    /// Two different explicit collations meet
    Collation,
    /// Misplaced clause
    Syntax,
    /// LIMIT/OFFSET value rejected at run time
    Limit,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Error => "SQL error",
            ErrorCode::Internal => "internal error",
            ErrorCode::NoMem => "out of memory",
            ErrorCode::TooBig => "expression too deep",
            ErrorCode::Range => "parameter out of range",
            ErrorCode::Mismatch => "column count mismatch",
            ErrorCode::Collation => "illegal collation mix",
            ErrorCode::Syntax => "syntax error",
            ErrorCode::Limit => "invalid limit",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A compile error: a code plus an optional human readable message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{}", .message.as_deref().unwrap_or(.code.as_str()))]
pub struct Error {
    pub code: ErrorCode,
    pub message: Option<String>,
}

impl Error {
    pub fn new(code: ErrorCode) -> Self {
        Error {
            code,
            message: None,
        }
    }

    pub fn with_message(code: ErrorCode, message: impl Into<String>) -> Self {
        Error {
            code,
            message: Some(message.into()),
        }
    }

    /// Invariant violation. Never expected for a correctly resolved tree.
    pub fn internal(message: impl Into<String>) -> Self {
        Error::with_message(ErrorCode::Internal, message)
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        self.message.as_deref().unwrap_or(self.code.as_str())
    }
}

/// Result type alias for compiler operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_uses_message() {
        let err = Error::with_message(ErrorCode::Collation, "Illegal mix of collations");
        assert_eq!(err.to_string(), "Illegal mix of collations");
        assert_eq!(err.code(), ErrorCode::Collation);
    }

    #[test]
    fn test_error_display_falls_back_to_code() {
        let err = Error::new(ErrorCode::NoMem);
        assert_eq!(err.to_string(), "out of memory");
        assert_eq!(err.message(), "out of memory");
    }
}
