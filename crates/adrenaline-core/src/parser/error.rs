//! Parser error types

use crate::lexer::{Span, TokenKind};
use thiserror::Error;

/// A parser error with location information
#[derive(Debug, Clone)]
pub struct ParseError {
    /// The kind of error
    pub kind: ParseErrorKind,
    /// Source location where the error occurred
    pub span: Span,
    /// Optional hint for fixing the error
    pub hint: Option<String>,
}

impl ParseError {
    /// Create a new parse error
    #[must_use]
    pub fn new(kind: ParseErrorKind, span: Span) -> Self {
        Self {
            kind,
            span,
            hint: None,
        }
    }

    /// Add a hint to this error
    #[must_use]
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} at {}", self.kind, self.span)?;
        if let Some(hint) = &self.hint {
            write!(f, " (hint: {hint})")?;
        }
        Ok(())
    }
}

impl std::error::Error for ParseError {}

/// The kind of parse error
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseErrorKind {
    #[error("unexpected token: found {found}, expected {expected}")]
    UnexpectedToken { found: TokenKind, expected: String },

    #[error("expected expression, found {0}")]
    ExpectedExpression(TokenKind),

    #[error("expected identifier, found {0}")]
    ExpectedIdentifier(TokenKind),

    #[error("invalid assignment target")]
    InvalidAssignmentTarget,

    #[error("invalid number literal: {0}")]
    InvalidNumber(String),

    #[error("duplicate parameter name: {0}")]
    DuplicateParameter(String),

    #[error("'break' outside loop")]
    BreakOutsideLoop,

    #[error("'continue' outside loop")]
    ContinueOutsideLoop,

    #[error("'return' outside function")]
    ReturnOutsideFunction,

    #[error("unsupported syntax: {0}")]
    UnsupportedSyntax(&'static str),

    #[error("lexical error: {0}")]
    Lex(String),
}
