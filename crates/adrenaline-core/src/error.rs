//! Engine error taxonomy
//!
//! None of these errors is fatal: every one of them routes the affected function to the
//! host interpreter. They surface as data through `Dispatcher::verdict` and as diagnostics,
//! never as panics across the dispatch boundary.

use std::fmt;

use thiserror::Error;

use crate::lexer::Span;

/// Broad category of an [`AdrenalineError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    UnsupportedConstruct,
    InconsistentType,
    CodegenLimitation,
    DirectiveConflict,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::UnsupportedConstruct => "UnsupportedConstruct",
            Self::InconsistentType => "InconsistentType",
            Self::CodegenLimitation => "CodegenLimitation",
            Self::DirectiveConflict => "DirectiveConflict",
        };
        f.write_str(name)
    }
}

/// A recoverable reason for not compiling (part of) a function
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdrenalineError {
    /// The analyzer found a node type it cannot compile
    #[error("unsupported construct in '{function}': {construct} ({reason})")]
    UnsupportedConstruct {
        function: String,
        construct: String,
        reason: String,
        span: Span,
    },

    /// Static types disagree (across branches, assignments or returns)
    #[error("inconsistent type in '{function}': {reason}")]
    InconsistentType {
        function: String,
        reason: String,
        span: Span,
    },

    /// The code generator could not lower an otherwise eligible body
    #[error("code generation failed for '{function}': {reason}")]
    CodegenLimitation { function: String, reason: String },

    /// Directives that cannot be honoured together
    #[error("conflicting directives on '{function}': {reason}")]
    DirectiveConflict { function: String, reason: String },
}

impl AdrenalineError {
    pub fn unsupported(
        function: impl Into<String>,
        construct: impl Into<String>,
        reason: impl Into<String>,
        span: Span,
    ) -> Self {
        Self::UnsupportedConstruct {
            function: function.into(),
            construct: construct.into(),
            reason: reason.into(),
            span,
        }
    }

    pub fn inconsistent(function: impl Into<String>, reason: impl Into<String>, span: Span) -> Self {
        Self::InconsistentType {
            function: function.into(),
            reason: reason.into(),
            span,
        }
    }

    pub fn codegen(function: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::CodegenLimitation {
            function: function.into(),
            reason: reason.to_string(),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::UnsupportedConstruct { .. } => ErrorKind::UnsupportedConstruct,
            Self::InconsistentType { .. } => ErrorKind::InconsistentType,
            Self::CodegenLimitation { .. } => ErrorKind::CodegenLimitation,
            Self::DirectiveConflict { .. } => ErrorKind::DirectiveConflict,
        }
    }

    /// Name of the function the error was raised for
    #[must_use]
    pub fn function(&self) -> &str {
        match self {
            Self::UnsupportedConstruct { function, .. }
            | Self::InconsistentType { function, .. }
            | Self::CodegenLimitation { function, .. }
            | Self::DirectiveConflict { function, .. } => function,
        }
    }

    /// The offending construct, when the error names one
    #[must_use]
    pub fn construct(&self) -> Option<&str> {
        match self {
            Self::UnsupportedConstruct { construct, .. } => Some(construct),
            _ => None,
        }
    }

    #[must_use]
    pub fn span(&self) -> Option<Span> {
        match self {
            Self::UnsupportedConstruct { span, .. } | Self::InconsistentType { span, .. } => {
                Some(*span)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_and_accessors() {
        let err = AdrenalineError::unsupported("f", "attribute access", "data.get", Span::new(3, 11));
        assert_eq!(err.kind(), ErrorKind::UnsupportedConstruct);
        assert_eq!(err.function(), "f");
        assert_eq!(err.construct(), Some("attribute access"));
        assert_eq!(err.span(), Some(Span::new(3, 11)));
        assert_eq!(err.kind().to_string(), "UnsupportedConstruct");
    }

    #[test]
    fn messages_name_the_function() {
        let err = AdrenalineError::inconsistent("g", "inconsistent return type", Span::default());
        assert_eq!(
            err.to_string(),
            "inconsistent type in 'g': inconsistent return type"
        );
        let err = AdrenalineError::codegen("h", "verifier error");
        assert_eq!(err.kind(), ErrorKind::CodegenLimitation);
        assert!(err.construct().is_none());
    }
}
