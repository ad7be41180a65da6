//! Error taxonomy for parsing, rendering, and file access.
//!
//! Strict mode surfaces every failure as an [`Error`]. Graceful mode turns
//! recoverable render failures into [`RenderErrorRecord`]s instead, which the
//! environment keeps per thread.

use miette::Diagnostic;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A 1-based line/column position in template source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceLocation {
    pub line: usize,
    pub column: usize,
}

impl std::fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}, column {}", self.line, self.column)
    }
}

/// Computes the line/column of a byte offset into `content`.
pub(crate) fn source_location(content: &str, offset: usize) -> SourceLocation {
    let offset = offset.min(content.len());
    let before = &content[..offset];
    let line = before.bytes().filter(|b| *b == b'\n').count() + 1;
    let column = match before.rfind('\n') {
        Some(newline) => offset - newline,
        None => offset + 1,
    };
    SourceLocation { line, column }
}

#[derive(Debug, Error, Diagnostic)]
pub enum Error {
    /// Malformed syntax, unmatched tags, or an unknown function in strict mode.
    #[error("parse error: {message} ({location})")]
    Parse {
        message: String,
        location: SourceLocation,
    },

    /// Missing variable, type mismatch, failed operation, or `super()` misuse.
    #[error("render error: {message} ({location})")]
    Render {
        message: String,
        location: SourceLocation,
    },

    /// Template or output file could not be accessed.
    #[error("file error: {message}")]
    File { message: String },

    /// Input data was not valid JSON.
    #[error("data error: {message}")]
    Data { message: String },

    /// Raised from a user callback; the renderer re-reports it with the
    /// location of the call site.
    #[error("callback error: {message}")]
    Callback { message: String },
}

impl Error {
    pub(crate) fn parse(message: impl Into<String>, location: SourceLocation) -> Self {
        Error::Parse {
            message: message.into(),
            location,
        }
    }

    pub(crate) fn render(message: impl Into<String>, location: SourceLocation) -> Self {
        Error::Render {
            message: message.into(),
            location,
        }
    }

    pub(crate) fn file(message: impl Into<String>) -> Self {
        Error::File {
            message: message.into(),
        }
    }

    /// Constructs a callback error; intended for use inside user callbacks.
    pub fn callback(message: impl Into<String>) -> Self {
        Error::Callback {
            message: message.into(),
        }
    }

    /// The source location of the failure, when the error carries one.
    pub fn location(&self) -> Option<SourceLocation> {
        match self {
            Error::Parse { location, .. } | Error::Render { location, .. } => Some(*location),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::File {
            message: err.to_string(),
        }
    }
}

/// A recoverable render failure recorded in graceful mode.
#[derive(Debug, Clone)]
pub struct RenderErrorRecord {
    pub message: String,
    pub location: SourceLocation,
    /// The literal template span that failed; echoed into the output for
    /// expression statements, empty otherwise.
    pub original_text: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_location_first_line() {
        let loc = source_location("hello", 3);
        assert_eq!(loc, SourceLocation { line: 1, column: 4 });
    }

    #[test]
    fn test_source_location_after_newlines() {
        let loc = source_location("a\nbc\ndef", 6);
        assert_eq!(loc, SourceLocation { line: 3, column: 2 });
    }

    #[test]
    fn test_source_location_clamps_offset() {
        let loc = source_location("ab", 99);
        assert_eq!(loc, SourceLocation { line: 1, column: 3 });
    }
}
