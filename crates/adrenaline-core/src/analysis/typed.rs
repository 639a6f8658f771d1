//! Typed intermediate representation of compilable functions
//!
//! Every construct that can appear here has a lowering in the code generator; the analyzer
//! is the only producer and refuses anything else, so the two agree by construction.
//!
//! A [`TypedBody`] is the unit of compilation: the root specialization (always index 0)
//! plus every callee specialization it can reach. Calls refer to callees by [`FuncIndex`].

use std::fmt;

use crate::directive::DirectiveSet;
use crate::lexer::Span;

/// Scalar numeric type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NumType {
    Int,
    Float,
    Bool,
}

impl fmt::Display for NumType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Int => "int",
            Self::Float => "float",
            Self::Bool => "bool",
        })
    }
}

/// Kind of a parameter or local: a scalar or a fixed-size array of scalars
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ValueKind {
    Scalar(NumType),
    /// Element type is `Int` or `Float`
    Array(NumType),
}

impl ValueKind {
    #[must_use]
    pub const fn is_array(self) -> bool {
        matches!(self, Self::Array(_))
    }

    #[must_use]
    pub const fn num_type(self) -> NumType {
        match self {
            Self::Scalar(t) | Self::Array(t) => t,
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scalar(t) => write!(f, "{t}"),
            Self::Array(t) => write!(f, "list[{t}]"),
        }
    }
}

/// What a function returns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReturnKind {
    Scalar(NumType),
    /// One of the array parameters, returned by reference
    Array(NumType),
    None,
}

impl fmt::Display for ReturnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scalar(t) => write!(f, "{t}"),
            Self::Array(t) => write!(f, "list[{t}]"),
            Self::None => f.write_str("None"),
        }
    }
}

/// Side-effect classification, ordered from least to most effectful
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum Purity {
    #[default]
    Pure,
    /// Reads a module-level constant
    ReadsGlobal,
    /// Stores into an array argument
    MutatesContainer,
}

/// Index of a local in a [`TypedFunction`]'s local table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalId(pub u32);

impl LocalId {
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Index of a specialization in a [`TypedBody`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FuncIndex(pub u32);

impl FuncIndex {
    pub const ROOT: Self = Self(0);

    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Label of an inlined body, target of [`TStmt::ExitBlock`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalOrigin {
    Param(usize),
    User,
    /// Introduced by the analyzer or an optimization pass
    Temp,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LocalDecl {
    pub name: String,
    pub kind: ValueKind,
    pub origin: LocalOrigin,
}

/// A literal
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Const {
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl Const {
    #[must_use]
    pub const fn num_type(self) -> NumType {
        match self {
            Self::Int(_) => NumType::Int,
            Self::Float(_) => NumType::Float,
            Self::Bool(_) => NumType::Bool,
        }
    }

    /// Bit pattern used when passing the constant through untyped slots
    #[must_use]
    pub fn to_bits(self) -> u64 {
        match self {
            Self::Int(i) => i as u64,
            Self::Float(f) => f.to_bits(),
            Self::Bool(b) => u64::from(b),
        }
    }
}

/// Arithmetic and bitwise operators; operands share the expression's type except where noted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    /// True division, floats only (integer operands are converted by the analyzer)
    Div,
    FloorDiv,
    Mod,
    /// Integer `**` only with a non-negative constant exponent
    Pow,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
}

impl ArithOp {
    #[must_use]
    pub const fn symbol(self) -> &'static str {
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
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnOp {
    Neg,
    /// Bitwise not, ints only
    Invert,
    /// Logical not, operand already converted to `Bool`
    Not,
}

/// Comparison; both operands have the same type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmpKind {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpKind {
    /// The comparison with operands swapped
    #[must_use]
    pub const fn swapped(self) -> Self {
        match self {
            Self::Lt => Self::Gt,
            Self::Le => Self::Ge,
            Self::Gt => Self::Lt,
            Self::Ge => Self::Le,
            other => other,
        }
    }
}

/// Value-returning short-circuit operators (`a and b`, `a or b`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogicOp {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CastOp {
    /// `float(i)` or an int operand mixed into float arithmetic (rounds)
    IntToFloat,
    /// Integer operand of a mixed comparison or true division; deoptimizes beyond 2^53
    IntToFloatExact,
    /// `int(x)` for floats; deoptimizes on NaN or out of range
    FloatToInt,
    BoolToInt,
    BoolToFloat,
    /// Truthiness
    ToBool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuiltinOp {
    Abs,
    Min,
    Max,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TArg {
    Scalar(TExpr),
    Array(LocalId),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TExprKind {
    Const(Const),
    Local(LocalId),
    Unary(UnOp, Box<TExpr>),
    Binary(ArithOp, Box<TExpr>, Box<TExpr>),
    Compare(CmpKind, Box<TExpr>, Box<TExpr>),
    Logic(LogicOp, Box<TExpr>, Box<TExpr>),
    Select {
        cond: Box<TExpr>,
        then: Box<TExpr>,
        otherwise: Box<TExpr>,
    },
    Cast(CastOp, Box<TExpr>),
    /// Element of an array local
    Index(LocalId, Box<TExpr>),
    Len(LocalId),
    Call(FuncIndex, Vec<TArg>),
    Builtin(BuiltinOp, Vec<TExpr>),
}

/// A typed expression
#[derive(Debug, Clone, PartialEq)]
pub struct TExpr {
    pub kind: TExprKind,
    pub ty: NumType,
}

impl TExpr {
    #[must_use]
    pub fn constant(value: Const) -> Self {
        Self {
            ty: value.num_type(),
            kind: TExprKind::Const(value),
        }
    }

    #[must_use]
    pub fn int(value: i64) -> Self {
        Self::constant(Const::Int(value))
    }

    #[must_use]
    pub fn local(id: LocalId, ty: NumType) -> Self {
        Self {
            kind: TExprKind::Local(id),
            ty,
        }
    }

    #[must_use]
    pub fn binary(op: ArithOp, left: TExpr, right: TExpr) -> Self {
        Self {
            ty: left.ty,
            kind: TExprKind::Binary(op, Box::new(left), Box::new(right)),
        }
    }

    #[must_use]
    pub fn compare(kind: CmpKind, left: TExpr, right: TExpr) -> Self {
        Self {
            ty: NumType::Bool,
            kind: TExprKind::Compare(kind, Box::new(left), Box::new(right)),
        }
    }

    #[must_use]
    pub fn cast(op: CastOp, operand: TExpr) -> Self {
        let ty = match op {
            CastOp::IntToFloat | CastOp::IntToFloatExact | CastOp::BoolToFloat => NumType::Float,
            CastOp::FloatToInt | CastOp::BoolToInt => NumType::Int,
            CastOp::ToBool => NumType::Bool,
        };
        Self {
            kind: TExprKind::Cast(op, Box::new(operand)),
            ty,
        }
    }

    #[must_use]
    pub const fn as_const(&self) -> Option<Const> {
        match self.kind {
            TExprKind::Const(c) => Some(c),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_local(&self) -> Option<LocalId> {
        match self.kind {
            TExprKind::Local(id) => Some(id),
            _ => None,
        }
    }

    /// Direct children
    pub fn children(&self) -> Vec<&TExpr> {
        match &self.kind {
            TExprKind::Const(_) | TExprKind::Local(_) | TExprKind::Len(_) => Vec::new(),
            TExprKind::Unary(_, e) | TExprKind::Cast(_, e) | TExprKind::Index(_, e) => vec![e],
            TExprKind::Binary(_, a, b) | TExprKind::Compare(_, a, b) | TExprKind::Logic(_, a, b) => {
                vec![a, b]
            }
            TExprKind::Select {
                cond,
                then,
                otherwise,
            } => vec![cond, then, otherwise],
            TExprKind::Call(_, args) => args
                .iter()
                .filter_map(|a| match a {
                    TArg::Scalar(e) => Some(e),
                    TArg::Array(_) => None,
                })
                .collect(),
            TExprKind::Builtin(_, args) => args.iter().collect(),
        }
    }

    /// Mutable direct children
    pub fn children_mut(&mut self) -> Vec<&mut TExpr> {
        match &mut self.kind {
            TExprKind::Const(_) | TExprKind::Local(_) | TExprKind::Len(_) => Vec::new(),
            TExprKind::Unary(_, e) | TExprKind::Cast(_, e) | TExprKind::Index(_, e) => vec![e],
            TExprKind::Binary(_, a, b) | TExprKind::Compare(_, a, b) | TExprKind::Logic(_, a, b) => {
                vec![a, b]
            }
            TExprKind::Select {
                cond,
                then,
                otherwise,
            } => vec![cond, then, otherwise],
            TExprKind::Call(_, args) => args
                .iter_mut()
                .filter_map(|a| match a {
                    TArg::Scalar(e) => Some(e),
                    TArg::Array(_) => None,
                })
                .collect(),
            TExprKind::Builtin(_, args) => args.iter_mut().collect(),
        }
    }

    /// Visit this expression and every subexpression (pre-order)
    pub fn walk(&self, f: &mut impl FnMut(&TExpr)) {
        f(self);
        for child in self.children() {
            child.walk(f);
        }
    }

    /// Number of nodes in the expression tree
    #[must_use]
    pub fn node_count(&self) -> usize {
        let mut count = 0;
        self.walk(&mut |_| count += 1);
        count
    }

    /// Locals (scalar or array) this expression reads
    pub fn read_locals(&self, out: &mut Vec<LocalId>) {
        self.walk(&mut |e| match &e.kind {
            TExprKind::Local(id) | TExprKind::Index(id, _) | TExprKind::Len(id) => out.push(*id),
            TExprKind::Call(_, args) => {
                for arg in args {
                    if let TArg::Array(id) = arg {
                        out.push(*id);
                    }
                }
            }
            _ => {}
        });
    }

    #[must_use]
    pub fn reads_local(&self, id: LocalId) -> bool {
        let mut found = false;
        self.walk(&mut |e| match &e.kind {
            TExprKind::Local(l) | TExprKind::Index(l, _) | TExprKind::Len(l) if *l == id => {
                found = true;
            }
            TExprKind::Call(_, args) => {
                if args.iter().any(|a| matches!(a, TArg::Array(l) if *l == id)) {
                    found = true;
                }
            }
            _ => {}
        });
        found
    }

    #[must_use]
    pub fn contains_call(&self) -> bool {
        let mut found = false;
        self.walk(&mut |e| {
            if matches!(e.kind, TExprKind::Call(..)) {
                found = true;
            }
        });
        found
    }

    /// Rewrite every local this expression references through `f`
    pub fn map_locals(&mut self, f: &mut impl FnMut(LocalId) -> LocalId) {
        match &mut self.kind {
            TExprKind::Local(id) | TExprKind::Len(id) | TExprKind::Index(id, _) => *id = f(*id),
            TExprKind::Call(_, args) => {
                for arg in args.iter_mut() {
                    if let TArg::Array(id) = arg {
                        *id = f(*id);
                    }
                }
            }
            _ => {}
        }
        for child in self.children_mut() {
            child.map_locals(f);
        }
    }

    /// Replace every read of `from` with `to` (array references included)
    pub fn rename_local(&mut self, from: LocalId, to: LocalId) {
        match &mut self.kind {
            TExprKind::Local(id) | TExprKind::Len(id) if *id == from => *id = to,
            TExprKind::Index(id, _) if *id == from => *id = to,
            TExprKind::Call(_, args) => {
                for arg in args.iter_mut() {
                    if let TArg::Array(id) = arg {
                        if *id == from {
                            *id = to;
                        }
                    }
                }
            }
            _ => {}
        }
        for child in self.children_mut() {
            child.rename_local(from, to);
        }
    }
}

/// How a counted loop compares its counter with the bound
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopBound {
    /// `range()` semantics: the sign of the step picks `<` or `>`
    Range,
    Lt,
    Le,
    Gt,
    Ge,
}

/// A counted loop `for var in range(start, stop, step)` or a normalized `while`
///
/// `start`, `stop` and `step` are evaluated once before the first iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct ForLoop {
    pub var: LocalId,
    pub start: TExpr,
    pub stop: TExpr,
    pub step: TExpr,
    pub bound: LoopBound,
    pub body: Vec<TStmt>,
    /// After normal exit `var` holds the first value that failed the bound test
    /// (normalized `while` loops); otherwise it keeps the last iterated value
    pub exit_value: bool,
    pub span: Span,
}

/// Reduction operator of a vectorized or parallel accumulator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReductionOp {
    /// `acc = acc + e`
    Add,
    /// `acc = acc - e`: partials accumulate `-e` and are added
    Sub,
    Mul,
    Min,
    Max,
}

impl ReductionOp {
    /// Arithmetic operator used to fold partials into the accumulator (`None` for min/max)
    #[must_use]
    pub const fn combine(self) -> Option<ArithOp> {
        match self {
            Self::Add | Self::Sub => Some(ArithOp::Add),
            Self::Mul => Some(ArithOp::Mul),
            Self::Min | Self::Max => None,
        }
    }

    /// Identity element for a partial accumulator
    ///
    /// Float sums start from `-0.0`, the only value that leaves every addend unchanged.
    #[must_use]
    pub fn identity(self, ty: NumType) -> Const {
        match (self, ty) {
            (Self::Add | Self::Sub, NumType::Float) => Const::Float(-0.0),
            (Self::Mul, NumType::Float) => Const::Float(1.0),
            (Self::Add | Self::Sub, _) => Const::Int(0),
            (Self::Mul, _) => Const::Int(1),
            (Self::Min, _) => Const::Int(i64::MAX),
            (Self::Max, _) => Const::Int(i64::MIN),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reduction {
    pub acc: LocalId,
    pub op: ReductionOp,
    pub ty: NumType,
}

/// Shape chosen by SIMD lowering
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorForm {
    /// Two-lane `f64` vector instructions
    Packed,
    /// `n` independent scalar lanes with split accumulators
    Lanes(usize),
}

impl VectorForm {
    #[must_use]
    pub const fn width(self) -> usize {
        match self {
            Self::Packed => 2,
            Self::Lanes(n) => n,
        }
    }
}

/// A unit-stride loop split into a vector phase and a scalar remainder
#[derive(Debug, Clone, PartialEq)]
pub struct VectorLoop {
    pub var: LocalId,
    pub start: TExpr,
    pub stop: TExpr,
    pub body: Vec<TStmt>,
    pub reductions: Vec<Reduction>,
    pub form: VectorForm,
    /// Float arrays the packed form loads or stores at the loop index
    pub arrays: Vec<LocalId>,
    pub span: Span,
}

/// A unit-stride loop outlined into a kernel run over contiguous chunks
#[derive(Debug, Clone, PartialEq)]
pub struct ParallelLoop {
    pub var: LocalId,
    pub start: TExpr,
    pub stop: TExpr,
    pub chunk_lo: LocalId,
    pub chunk_hi: LocalId,
    /// The per-chunk loop over `[chunk_lo, chunk_hi)`; a `For` or, after SIMD lowering, a `Vector`
    pub chunk: Box<TStmt>,
    pub reduction: Option<Reduction>,
    /// Scalar locals defined outside and read inside
    pub captures: Vec<LocalId>,
    /// Array locals referenced inside
    pub arrays: Vec<LocalId>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TReturn {
    Scalar(TExpr),
    Array(LocalId),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TStmt {
    Assign(LocalId, TExpr),
    Store {
        array: LocalId,
        index: TExpr,
        value: TExpr,
    },
    /// Evaluated for its effects (calls) and possible deoptimization
    Expr(TExpr),
    If {
        cond: TExpr,
        then: Vec<TStmt>,
        otherwise: Vec<TStmt>,
    },
    While {
        cond: TExpr,
        body: Vec<TStmt>,
        span: Span,
    },
    For(ForLoop),
    Break,
    Continue,
    Return(Option<TReturn>),
    /// Inlined callee body; `ExitBlock(label)` leaves it
    Block {
        label: Label,
        body: Vec<TStmt>,
    },
    ExitBlock(Label),
    Vector(VectorLoop),
    Parallel(ParallelLoop),
}

impl TStmt {
    /// Expressions evaluated directly by this statement (not by nested statements)
    pub fn exprs(&self) -> Vec<&TExpr> {
        match self {
            Self::Assign(_, e) | Self::Expr(e) => vec![e],
            Self::Store { index, value, .. } => vec![index, value],
            Self::If { cond, .. } | Self::While { cond, .. } => vec![cond],
            Self::For(l) => vec![&l.start, &l.stop, &l.step],
            Self::Return(Some(TReturn::Scalar(e))) => vec![e],
            Self::Vector(v) => vec![&v.start, &v.stop],
            Self::Parallel(p) => vec![&p.start, &p.stop],
            Self::Return(_)
            | Self::Break
            | Self::Continue
            | Self::Block { .. }
            | Self::ExitBlock(_) => Vec::new(),
        }
    }

    pub fn exprs_mut(&mut self) -> Vec<&mut TExpr> {
        match self {
            Self::Assign(_, e) | Self::Expr(e) => vec![e],
            Self::Store { index, value, .. } => vec![index, value],
            Self::If { cond, .. } | Self::While { cond, .. } => vec![cond],
            Self::For(l) => vec![&mut l.start, &mut l.stop, &mut l.step],
            Self::Return(Some(TReturn::Scalar(e))) => vec![e],
            Self::Vector(v) => vec![&mut v.start, &mut v.stop],
            Self::Parallel(p) => vec![&mut p.start, &mut p.stop],
            Self::Return(_)
            | Self::Break
            | Self::Continue
            | Self::Block { .. }
            | Self::ExitBlock(_) => Vec::new(),
        }
    }

    /// Nested statement lists
    pub fn blocks(&self) -> Vec<&[TStmt]> {
        match self {
            Self::If {
                then, otherwise, ..
            } => vec![then, otherwise],
            Self::While { body, .. } | Self::Block { body, .. } => vec![body],
            Self::For(l) => vec![&l.body],
            Self::Vector(v) => vec![&v.body],
            Self::Parallel(p) => vec![std::slice::from_ref(p.chunk.as_ref())],
            _ => Vec::new(),
        }
    }

    pub fn blocks_mut(&mut self) -> Vec<&mut Vec<TStmt>> {
        match self {
            Self::If {
                then, otherwise, ..
            } => vec![then, otherwise],
            Self::While { body, .. } | Self::Block { body, .. } => vec![body],
            Self::For(l) => vec![&mut l.body],
            Self::Vector(v) => vec![&mut v.body],
            _ => Vec::new(),
        }
    }

    /// Visit this statement and every nested statement (pre-order)
    pub fn walk(&self, f: &mut impl FnMut(&TStmt)) {
        f(self);
        for block in self.blocks() {
            for stmt in block {
                stmt.walk(f);
            }
        }
    }

    /// Visit every expression evaluated by this statement or a nested one
    pub fn walk_exprs(&self, f: &mut impl FnMut(&TExpr)) {
        self.walk(&mut |stmt| {
            for expr in stmt.exprs() {
                expr.walk(f);
            }
        });
    }

    /// Locals this statement (or a nested one) assigns, loop counters included
    pub fn written_locals(&self, out: &mut Vec<LocalId>) {
        self.walk(&mut |stmt| match stmt {
            Self::Assign(id, _) => out.push(*id),
            Self::For(l) => out.push(l.var),
            Self::Vector(v) => out.push(v.var),
            Self::Parallel(p) => {
                out.push(p.var);
                out.push(p.chunk_lo);
                out.push(p.chunk_hi);
            }
            _ => {}
        });
    }

    /// Rewrite every local this statement (or a nested one) references through `f`
    pub fn map_locals(&mut self, f: &mut impl FnMut(LocalId) -> LocalId) {
        match self {
            Self::Assign(id, _) | Self::Return(Some(TReturn::Array(id))) => *id = f(*id),
            Self::Store { array, .. } => *array = f(*array),
            Self::For(l) => l.var = f(l.var),
            Self::Vector(v) => {
                v.var = f(v.var);
                for r in &mut v.reductions {
                    r.acc = f(r.acc);
                }
                for a in &mut v.arrays {
                    *a = f(*a);
                }
            }
            Self::Parallel(p) => {
                p.var = f(p.var);
                p.chunk_lo = f(p.chunk_lo);
                p.chunk_hi = f(p.chunk_hi);
                if let Some(r) = &mut p.reduction {
                    r.acc = f(r.acc);
                }
                for c in p.captures.iter_mut().chain(p.arrays.iter_mut()) {
                    *c = f(*c);
                }
                p.chunk.map_locals(f);
            }
            _ => {}
        }
        for expr in self.exprs_mut() {
            expr.map_locals(f);
        }
        for block in self.blocks_mut() {
            for stmt in block.iter_mut() {
                stmt.map_locals(f);
            }
        }
    }

    /// Rewrite every block label this statement (or a nested one) uses through `f`
    pub fn map_labels(&mut self, f: &mut impl FnMut(Label) -> Label) {
        match self {
            Self::Block { label, .. } | Self::ExitBlock(label) => *label = f(*label),
            Self::Parallel(p) => p.chunk.map_labels(f),
            _ => {}
        }
        for block in self.blocks_mut() {
            for stmt in block.iter_mut() {
                stmt.map_labels(f);
            }
        }
    }

    /// Arrays this statement (or a nested one) stores into directly
    pub fn stored_arrays(&self, out: &mut Vec<LocalId>) {
        self.walk(&mut |stmt| {
            if let Self::Store { array, .. } = stmt {
                out.push(*array);
            }
        });
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        let mut count = 0;
        self.walk(&mut |stmt| {
            count += 1;
            for expr in stmt.exprs() {
                count += expr.node_count();
            }
        });
        count
    }
}

/// Total node count of a statement list
#[must_use]
pub fn block_node_count(body: &[TStmt]) -> usize {
    body.iter().map(TStmt::node_count).sum()
}

/// One specialization of one function for fixed argument kinds
#[derive(Debug, Clone, PartialEq)]
pub struct TypedFunction {
    pub name: String,
    pub arg_kinds: Vec<ValueKind>,
    pub params: Vec<LocalId>,
    pub locals: Vec<LocalDecl>,
    pub body: Vec<TStmt>,
    pub ret: ReturnKind,
    pub purity: Purity,
    pub directives: DirectiveSet,
    /// Module constants read by the body
    pub globals_read: Vec<String>,
    pub next_label: u32,
}

impl TypedFunction {
    #[must_use]
    pub fn local(&self, id: LocalId) -> &LocalDecl {
        &self.locals[id.index()]
    }

    /// Positions of the parameters among `ids`
    fn param_positions(&self, ids: &[LocalId]) -> Vec<usize> {
        self.params
            .iter()
            .enumerate()
            .filter(|(_, param)| ids.contains(param))
            .map(|(position, _)| position)
            .collect()
    }

    /// Declare a fresh temporary
    pub fn add_temp(&mut self, name: impl Into<String>, kind: ValueKind) -> LocalId {
        let id = LocalId(self.locals.len() as u32);
        self.locals.push(LocalDecl {
            name: name.into(),
            kind,
            origin: LocalOrigin::Temp,
        });
        id
    }

    pub fn fresh_label(&mut self) -> Label {
        let label = Label(self.next_label);
        self.next_label += 1;
        label
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        block_node_count(&self.body)
    }

    /// Specializations called directly from the body
    #[must_use]
    pub fn callees(&self) -> Vec<FuncIndex> {
        let mut callees = Vec::new();
        for stmt in &self.body {
            stmt.walk_exprs(&mut |e| {
                if let TExprKind::Call(index, _) = e.kind {
                    if !callees.contains(&index) {
                        callees.push(index);
                    }
                }
            });
        }
        callees
    }
}

/// A root specialization with its callee closure
#[derive(Debug, Clone, PartialEq)]
pub struct TypedBody {
    pub functions: Vec<TypedFunction>,
}

impl TypedBody {
    #[must_use]
    pub fn root(&self) -> &TypedFunction {
        &self.functions[FuncIndex::ROOT.index()]
    }

    #[must_use]
    pub fn function(&self, index: FuncIndex) -> &TypedFunction {
        &self.functions[index.index()]
    }

    /// Overall purity of the root, including what its callees do
    #[must_use]
    pub fn purity(&self) -> Purity {
        self.functions
            .iter()
            .map(|f| f.purity)
            .max()
            .unwrap_or_default()
    }

    /// True when `index` can reach itself through calls
    #[must_use]
    pub fn is_recursive(&self, index: FuncIndex) -> bool {
        let mut stack = self.function(index).callees();
        let mut seen = Vec::new();
        while let Some(next) = stack.pop() {
            if next == index {
                return true;
            }
            if seen.contains(&next) {
                continue;
            }
            seen.push(next);
            stack.extend(self.function(next).callees());
        }
        false
    }

    /// Specializations still reachable from the root
    #[must_use]
    pub fn reachable(&self) -> Vec<FuncIndex> {
        let mut order = vec![FuncIndex::ROOT];
        let mut cursor = 0;
        while cursor < order.len() {
            for callee in self.function(order[cursor]).callees() {
                if !order.contains(&callee) {
                    order.push(callee);
                }
            }
            cursor += 1;
        }
        order
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.root().node_count()
    }

    /// Root parameter positions whose arrays may be stored into, by the root or a callee
    #[must_use]
    pub fn stored_params(&self) -> Vec<usize> {
        let mut stored: Vec<Vec<usize>> = self
            .functions
            .iter()
            .map(|function| {
                let mut ids = Vec::new();
                for stmt in &function.body {
                    stmt.stored_arrays(&mut ids);
                }
                function.param_positions(&ids)
            })
            .collect();
        let mut changed = true;
        while changed {
            changed = false;
            for (index, function) in self.functions.iter().enumerate() {
                let mut passed = Vec::new();
                for stmt in &function.body {
                    stmt.walk_exprs(&mut |e| {
                        if let TExprKind::Call(callee, args) = &e.kind {
                            for (position, arg) in args.iter().enumerate() {
                                match arg {
                                    TArg::Array(id) if stored[callee.index()].contains(&position) => {
                                        passed.push(*id);
                                    }
                                    _ => {}
                                }
                            }
                        }
                    });
                }
                for position in function.param_positions(&passed) {
                    if !stored[index].contains(&position) {
                        stored[index].push(position);
                        changed = true;
                    }
                }
            }
        }
        let mut root = stored.swap_remove(FuncIndex::ROOT.index());
        root.sort_unstable();
        root
    }
}
