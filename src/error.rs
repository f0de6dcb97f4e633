//! Script error types.

use std::fmt;

use thiserror::Error;

/// Result type for host-facing operations.
pub type ScriptResult<T> = Result<T, ScriptError>;

/// The six script-visible error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Generic error, also the catch-all base class.
    Error,
    /// Malformed `eval` arguments.
    EvalError,
    /// Numeric range violations (bad radix, stack overflow, bad length).
    RangeError,
    /// Unresolved identifier, or assignment to a non-reference.
    ReferenceError,
    /// Lex or tokenize failure, malformed break/continue target.
    SyntaxError,
    /// Wrong dynamic type (calling a non-function, member of null, ...).
    TypeError,
}

impl ErrorKind {
    /// Class name as exposed to scripts.
    pub fn name(self) -> &'static str {
        match self {
            ErrorKind::Error => "Error",
            ErrorKind::EvalError => "EvalError",
            ErrorKind::RangeError => "RangeError",
            ErrorKind::ReferenceError => "ReferenceError",
            ErrorKind::SyntaxError => "SyntaxError",
            ErrorKind::TypeError => "TypeError",
        }
    }

    /// All kinds, in prototype-registration order.
    pub fn all() -> [ErrorKind; 6] {
        [
            ErrorKind::Error,
            ErrorKind::EvalError,
            ErrorKind::RangeError,
            ErrorKind::ReferenceError,
            ErrorKind::SyntaxError,
            ErrorKind::TypeError,
        ]
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A script error with its source position.
///
/// `Display` renders `"<Kind>: <message> at <file>:<line>:<column>"`,
/// which is also the `toString()` of uncaught exceptions.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message} at {file}:{line}:{column}")]
pub struct ScriptError {
    /// Error kind.
    pub kind: ErrorKind,
    /// Human-readable message.
    pub message: String,
    /// Source file name (host-supplied, may be empty).
    pub file: String,
    /// Line number (1-based, 0 when unknown).
    pub line: u32,
    /// Column number (1-based, 0 when unknown).
    pub column: u32,
}

impl ScriptError {
    /// Create an error of the given kind without a position.
    pub fn new<M: Into<String>>(kind: ErrorKind, message: M) -> Self {
        ScriptError {
            kind,
            message: message.into(),
            file: String::new(),
            line: 0,
            column: 0,
        }
    }

    /// Create an error of the given kind with a position.
    pub fn at<M: Into<String>, F: Into<String>>(
        kind: ErrorKind,
        message: M,
        file: F,
        line: u32,
        column: u32,
    ) -> Self {
        ScriptError {
            kind,
            message: message.into(),
            file: file.into(),
            line,
            column,
        }
    }

    /// Create a syntax error.
    pub fn syntax<M: Into<String>>(msg: M) -> Self {
        ScriptError::new(ErrorKind::SyntaxError, msg)
    }

    /// Create a type error.
    pub fn type_error<M: Into<String>>(msg: M) -> Self {
        ScriptError::new(ErrorKind::TypeError, msg)
    }

    /// Create a reference error.
    pub fn reference<M: Into<String>>(msg: M) -> Self {
        ScriptError::new(ErrorKind::ReferenceError, msg)
    }

    /// Create a range error.
    pub fn range<M: Into<String>>(msg: M) -> Self {
        ScriptError::new(ErrorKind::RangeError, msg)
    }

    /// Attach a position if none is set yet.
    pub fn with_pos(mut self, file: &str, line: u32, column: u32) -> Self {
        if self.file.is_empty() && self.line == 0 {
            self.file = file.into();
            self.line = line;
            self.column = column;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_carries_position() {
        let err = ScriptError::at(ErrorKind::SyntaxError, "unexpected token", "boot.js", 3, 14);
        assert_eq!(err.to_string(), "SyntaxError: unexpected token at boot.js:3:14");
    }

    #[test]
    fn test_with_pos_does_not_overwrite() {
        let err = ScriptError::at(ErrorKind::TypeError, "x", "a.js", 1, 1).with_pos("b.js", 9, 9);
        assert_eq!(err.file, "a.js");
        assert_eq!(err.line, 1);
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(ErrorKind::ReferenceError.name(), "ReferenceError");
        assert_eq!(ErrorKind::all().len(), 6);
    }
}
