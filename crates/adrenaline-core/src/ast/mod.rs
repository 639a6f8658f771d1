//! Abstract Syntax Tree (AST) for the Python subset handled by the host front end
//!
//! All AST nodes include source location information via [`Span`] so that rejection
//! diagnostics can point at the construct that prevented compilation.

mod expr;
mod item;
mod stmt;
pub mod walk;

pub use expr::*;
pub use item::*;
pub use stmt::*;

// Re-export Span from lexer for convenience
pub use crate::lexer::Span;

/// A trait for AST nodes that have associated source location information
pub trait Spanned {
    /// Returns the source span of this node
    fn span(&self) -> Span;
}

/// An identifier with its source location
#[derive(Debug, Clone, PartialEq)]
pub struct Ident {
    /// The identifier name
    pub name: String,
    /// Source location
    pub span: Span,
}

impl Ident {
    /// Create a new identifier
    #[must_use]
    pub fn new(name: impl Into<String>, span: Span) -> Self {
        Self {
            name: name.into(),
            span,
        }
    }
}

impl Spanned for Ident {
    fn span(&self) -> Span {
        self.span
    }
}
