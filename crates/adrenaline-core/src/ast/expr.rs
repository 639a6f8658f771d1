//! Expression AST nodes

use crate::lexer::Span;

use super::{Ident, Spanned};

/// An expression with source location
#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    /// The kind of expression
    pub kind: ExprKind,
    /// Source location
    pub span: Span,
}

impl Expr {
    /// Create a new expression
    #[must_use]
    pub fn new(kind: ExprKind, span: Span) -> Self {
        Self { kind, span }
    }

    /// The identifier name if this is a bare name expression
    #[must_use]
    pub fn as_name(&self) -> Option<&str> {
        match &self.kind {
            ExprKind::Name(name) => Some(name),
            _ => None,
        }
    }

    /// Short human-readable description of the construct, used in rejection reasons
    #[must_use]
    pub fn describe(&self) -> &'static str {
        match &self.kind {
            ExprKind::Int(_) => "integer literal",
            ExprKind::Float(_) => "float literal",
            ExprKind::Bool(_) => "boolean literal",
            ExprKind::None => "None",
            ExprKind::Str(_) => "string literal",
            ExprKind::Name(_) => "name",
            ExprKind::Binary { .. } => "binary operation",
            ExprKind::Unary { .. } => "unary operation",
            ExprKind::BoolOp { .. } => "boolean operation",
            ExprKind::Compare { .. } => "comparison",
            ExprKind::Call { .. } => "call",
            ExprKind::Attribute { .. } => "attribute access",
            ExprKind::Subscript { .. } => "subscript",
            ExprKind::List(_) => "list display",
            ExprKind::Tuple(_) => "tuple",
            ExprKind::Dict(_) => "dict display",
            ExprKind::Lambda { .. } => "lambda",
            ExprKind::IfExp { .. } => "conditional expression",
        }
    }
}

impl Spanned for Expr {
    fn span(&self) -> Span {
        self.span
    }
}

/// The kind of expression
#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    /// Integer literal
    Int(i64),
    /// Float literal
    Float(f64),
    /// `True` / `False`
    Bool(bool),
    /// `None`
    None,
    /// String literal (decoded)
    Str(String),
    /// Variable reference
    Name(String),

    /// Binary arithmetic or bitwise operation
    Binary {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },

    /// Unary operation
    Unary { op: UnaryOp, operand: Box<Expr> },

    /// Short-circuit `and` / `or`
    BoolOp {
        op: BoolOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },

    /// Comparison chain (`a < b <= c`)
    Compare {
        left: Box<Expr>,
        /// Each operator with its right-hand operand, evaluated left to right
        rest: Vec<(CmpOp, Expr)>,
    },

    /// Function or method call
    Call {
        func: Box<Expr>,
        args: Vec<Expr>,
        keywords: Vec<(Ident, Expr)>,
    },

    /// Attribute access (`obj.name`)
    Attribute { value: Box<Expr>, attr: Ident },

    /// Subscript (`a[i]`)
    Subscript { value: Box<Expr>, index: Box<Expr> },

    /// List display (`[a, b]`)
    List(Vec<Expr>),

    /// Tuple (`a, b` or `(a, b)`)
    Tuple(Vec<Expr>),

    /// Dict display (`{k: v}`)
    Dict(Vec<(Expr, Expr)>),

    /// `lambda params: body`
    Lambda { params: Vec<Ident>, body: Box<Expr> },

    /// `then if cond else otherwise`
    IfExp {
        cond: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
}

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    /// True division (`/`)
    Div,
    /// Floor division (`//`)
    FloorDiv,
    Mod,
    Pow,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    /// Matrix multiplication (`@`), parsed but never supported
    MatMul,
}

impl BinOp {
    /// Binding power; higher binds tighter. `Pow` is right associative.
    #[must_use]
    pub const fn precedence(&self) -> u8 {
        match self {
            Self::BitOr => 1,
            Self::BitXor => 2,
            Self::BitAnd => 3,
            Self::Shl | Self::Shr => 4,
            Self::Add | Self::Sub => 5,
            Self::Mul | Self::Div | Self::FloorDiv | Self::Mod | Self::MatMul => 6,
            Self::Pow => 8,
        }
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::FloorDiv => "//",
            Self::Mod => "%",
            Self::Pow => "**",
            Self::BitAnd => "&",
            Self::BitOr => "|",
            Self::BitXor => "^",
            Self::Shl => "<<",
            Self::Shr => ">>",
            Self::MatMul => "@",
        }
    }
}

impl std::fmt::Display for BinOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    /// `-x`
    Neg,
    /// `+x`
    Pos,
    /// `~x`
    Invert,
    /// `not x`
    Not,
}

/// Short-circuit boolean operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BoolOp {
    And,
    Or,
}

/// Comparison operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmpOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Is,
    IsNot,
    In,
    NotIn,
}

impl CmpOp {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::NotEq => "!=",
            Self::Lt => "<",
            Self::LtEq => "<=",
            Self::Gt => ">",
            Self::GtEq => ">=",
            Self::Is => "is",
            Self::IsNot => "is not",
            Self::In => "in",
            Self::NotIn => "not in",
        }
    }
}
