//! Parse error types and error reporting

use crate::token::{Span, Token};
use std::fmt;

/// A parse error with location and contextual information.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    /// The kind of error that occurred
    pub kind: ParseErrorKind,

    /// Source location of the error
    pub span: Span,

    /// Human-readable error message
    pub message: String,

    /// Optional suggestion for fixing the error
    pub suggestion: Option<String>,
}

/// The kind of parse error.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseErrorKind {
    /// Unexpected token found
    UnexpectedToken { expected: Vec<Token>, found: Token },

    /// Unexpected end of file
    UnexpectedEof { expected: Vec<Token> },

    /// Invalid syntax
    InvalidSyntax { reason: String },

    /// A recognized construct that task bodies do not support
    BannedFeature { feature: String, reason: String },

    /// Lexical error (unexpected characters)
    Lex { slice: String },
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Parse error at {}:{}: {}",
            self.span.line, self.span.column, self.message
        )?;

        if let Some(suggestion) = &self.suggestion {
            write!(f, "\n  Suggestion: {}", suggestion)?;
        }

        Ok(())
    }
}

impl std::error::Error for ParseError {}

impl ParseError {
    /// Create an "unexpected token" error.
    pub fn unexpected_token(expected: Vec<Token>, found: Token, span: Span) -> Self {
        let message = if expected.len() == 1 {
            format!("Expected {}, found {}", expected[0], found)
        } else {
            let names: Vec<String> = expected.iter().map(|t| t.to_string()).collect();
            format!("Expected one of {}, found {}", names.join(", "), found)
        };

        Self {
            kind: ParseErrorKind::UnexpectedToken { expected, found },
            span,
            message,
            suggestion: None,
        }
    }

    /// Create an "unexpected EOF" error.
    pub fn unexpected_eof(expected: Vec<Token>, span: Span) -> Self {
        let message = if expected.len() == 1 {
            format!("Unexpected end of input, expected {}", expected[0])
        } else {
            let names: Vec<String> = expected.iter().map(|t| t.to_string()).collect();
            format!("Unexpected end of input, expected one of {}", names.join(", "))
        };

        Self {
            kind: ParseErrorKind::UnexpectedEof { expected },
            span,
            message,
            suggestion: None,
        }
    }

    /// Create an "invalid syntax" error.
    pub fn invalid_syntax(reason: impl Into<String>, span: Span) -> Self {
        let reason = reason.into();
        Self {
            kind: ParseErrorKind::InvalidSyntax {
                reason: reason.clone(),
            },
            span,
            message: format!("Invalid syntax: {}", reason),
            suggestion: None,
        }
    }

    /// Create a "banned feature" error.
    pub fn banned_feature(
        feature: impl Into<String>,
        reason: impl Into<String>,
        span: Span,
    ) -> Self {
        let feature = feature.into();
        let reason = reason.into();

        Self {
            kind: ParseErrorKind::BannedFeature {
                feature: feature.clone(),
                reason: reason.clone(),
            },
            span,
            message: format!("'{}' is not supported in task bodies: {}", feature, reason),
            suggestion: None,
        }
    }

    /// Create a lexical error.
    pub fn lex(slice: impl Into<String>, span: Span) -> Self {
        let slice = slice.into();
        Self {
            kind: ParseErrorKind::Lex {
                slice: slice.clone(),
            },
            span,
            message: format!("Unexpected character(s) {:?}", slice),
            suggestion: None,
        }
    }

    /// Add a suggestion to this error.
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}
