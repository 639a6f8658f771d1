//! Statement AST nodes

use crate::lexer::Span;

use super::{BinOp, Expr, FunctionDef, Ident, Spanned};

/// A statement with source location
#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    /// The kind of statement
    pub kind: StmtKind,
    /// Source location
    pub span: Span,
}

impl Stmt {
    /// Create a new statement
    #[must_use]
    pub fn new(kind: StmtKind, span: Span) -> Self {
        Self { kind, span }
    }

    /// Short human-readable description of the construct, used in rejection reasons
    #[must_use]
    pub fn describe(&self) -> &'static str {
        match &self.kind {
            StmtKind::Expr(_) => "expression statement",
            StmtKind::Assign { .. } => "assignment",
            StmtKind::AugAssign { .. } => "augmented assignment",
            StmtKind::Return(_) => "return",
            StmtKind::If { .. } => "if statement",
            StmtKind::While { .. } => "while loop",
            StmtKind::For { .. } => "for loop",
            StmtKind::Break => "break",
            StmtKind::Continue => "continue",
            StmtKind::Pass => "pass",
            StmtKind::Import(_) => "import",
            StmtKind::FromImport { .. } => "import",
            StmtKind::Global(_) => "global declaration",
            StmtKind::Nonlocal(_) => "nonlocal declaration",
            StmtKind::Try { .. } => "exception handling",
            StmtKind::Raise(_) => "raise",
            StmtKind::FunctionDef(_) => "nested function definition",
        }
    }
}

impl Spanned for Stmt {
    fn span(&self) -> Span {
        self.span
    }
}

/// The kind of statement
#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    /// Expression evaluated for its effect
    Expr(Expr),

    /// Assignment; `a = b = value` has two targets, `a, b = ...` a tuple target
    Assign { targets: Vec<Expr>, value: Expr },

    /// Augmented assignment (`x += 1`)
    AugAssign {
        target: Expr,
        op: BinOp,
        value: Expr,
    },

    Return(Option<Expr>),

    /// `if` with `elif` chains desugared into nested `orelse` blocks
    If {
        cond: Expr,
        body: Vec<Stmt>,
        orelse: Vec<Stmt>,
    },

    While { cond: Expr, body: Vec<Stmt> },

    For {
        target: Expr,
        iter: Expr,
        body: Vec<Stmt>,
    },

    Break,
    Continue,
    Pass,

    /// `import a.b as c`
    Import(Vec<ImportName>),

    /// `from module import a as b`
    FromImport {
        module: String,
        names: Vec<ImportName>,
    },

    Global(Vec<Ident>),
    Nonlocal(Vec<Ident>),

    Try {
        body: Vec<Stmt>,
        handlers: Vec<ExceptHandler>,
        finally: Vec<Stmt>,
    },

    Raise(Option<Expr>),

    FunctionDef(Box<FunctionDef>),
}

/// One imported name with optional alias
#[derive(Debug, Clone, PartialEq)]
pub struct ImportName {
    /// Dotted path as written
    pub path: String,
    pub alias: Option<Ident>,
    pub span: Span,
}

impl ImportName {
    /// The name bound in the importing scope
    #[must_use]
    pub fn bound_name(&self) -> &str {
        match &self.alias {
            Some(alias) => &alias.name,
            None => self.path.split('.').next().unwrap_or(&self.path),
        }
    }
}

/// An `except` clause
#[derive(Debug, Clone, PartialEq)]
pub struct ExceptHandler {
    /// Exception type expression; `None` for a bare `except:`
    pub kind: Option<Expr>,
    /// Name bound with `as`
    pub name: Option<Ident>,
    pub body: Vec<Stmt>,
    pub span: Span,
}
