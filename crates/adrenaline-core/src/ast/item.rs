//! Function definitions and modules

use crate::lexer::Span;

use super::{Expr, Ident, Spanned, Stmt, StmtKind};

/// A function parameter
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: Ident,
    /// Type annotation (`n: int`)
    pub annotation: Option<Expr>,
    /// Default value (`n=10`)
    pub default: Option<Expr>,
}

/// A `def` statement
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDef {
    pub name: Ident,
    pub params: Vec<Param>,
    /// Return annotation (`-> int`)
    pub returns: Option<Expr>,
    /// Body statements, with the docstring (if any) removed
    pub body: Vec<Stmt>,
    /// Docstring text
    pub docstring: Option<String>,
    /// Comment lines directly above the `def` and before the first body statement,
    /// with the leading `#` removed
    pub leading_comments: Vec<String>,
    /// Exact source text of the definition
    pub source: String,
    pub span: Span,
}

impl FunctionDef {
    /// The function's leading documentation text: comments and docstring, one item per line
    #[must_use]
    pub fn documentation(&self) -> String {
        let mut text = self.leading_comments.join("\n");
        if let Some(doc) = &self.docstring {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(doc);
        }
        text
    }

    /// Parameter names in declaration order
    pub fn param_names(&self) -> impl Iterator<Item = &str> {
        self.params.iter().map(|p| p.name.name.as_str())
    }
}

impl Spanned for FunctionDef {
    fn span(&self) -> Span {
        self.span
    }
}

/// A parsed source module
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Module {
    pub body: Vec<Stmt>,
}

impl Module {
    /// Top-level function definitions in source order
    pub fn functions(&self) -> impl Iterator<Item = &FunctionDef> {
        self.body.iter().filter_map(|stmt| match &stmt.kind {
            StmtKind::FunctionDef(def) => Some(def.as_ref()),
            _ => None,
        })
    }

    /// Look up a top-level function by name; later definitions shadow earlier ones
    #[must_use]
    pub fn function(&self, name: &str) -> Option<&FunctionDef> {
        self.functions().filter(|f| f.name.name == name).last()
    }
}
