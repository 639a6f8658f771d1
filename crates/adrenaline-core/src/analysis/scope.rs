//! Structural screening and local-variable bookkeeping for the analyzer

use std::collections::{BTreeSet, HashMap};

use crate::ast::{Expr, ExprKind, FunctionDef, Stmt, StmtKind};
use crate::ast::walk::visit_statements;
use crate::error::AdrenalineError;
use crate::lexer::Span;

use super::typed::{LocalDecl, LocalId, LocalOrigin, ValueKind};

/// Reject statements and expressions that can never be compiled, whatever the argument kinds
///
/// Runs before argument kinds are known, so a function that handles host containers is
/// rejected on its first call even when its arguments cannot be described natively.
pub(crate) fn screen(def: &FunctionDef) -> Result<(), AdrenalineError> {
    let name = def.name.name.as_str();
    let mut first: Option<AdrenalineError> = None;
    visit_statements(&def.body, &mut |stmt| {
        if first.is_some() {
            return;
        }
        if let Some(reason) = unsupported_statement(stmt) {
            first = Some(AdrenalineError::unsupported(
                name,
                stmt.describe(),
                reason,
                stmt.span,
            ));
            return;
        }
        for expr in statement_exprs(stmt) {
            if let Some(err) = screen_expr(name, expr) {
                first = Some(err);
                return;
            }
        }
    });
    first.map_or(Ok(()), Err)
}

fn unsupported_statement(stmt: &Stmt) -> Option<&'static str> {
    match &stmt.kind {
        StmtKind::Try { .. } | StmtKind::Raise(_) => Some("exceptions are handled by the host"),
        StmtKind::Import(_) | StmtKind::FromImport { .. } => Some("imports run in the host"),
        StmtKind::Global(_) | StmtKind::Nonlocal(_) => Some("rebinding outer names"),
        StmtKind::FunctionDef(_) => Some("closures are not compiled"),
        _ => None,
    }
}

fn statement_exprs(stmt: &Stmt) -> Vec<&Expr> {
    match &stmt.kind {
        StmtKind::Expr(e) => vec![e],
        StmtKind::Assign { targets, value } => {
            let mut all: Vec<&Expr> = targets.iter().collect();
            all.push(value);
            all
        }
        StmtKind::AugAssign { target, value, .. } => vec![target, value],
        StmtKind::Return(Some(e)) => vec![e],
        StmtKind::If { cond, .. } | StmtKind::While { cond, .. } => vec![cond],
        StmtKind::For { target, iter, .. } => vec![target, iter],
        _ => Vec::new(),
    }
}

fn screen_expr(function: &str, expr: &Expr) -> Option<AdrenalineError> {
    let reason = match &expr.kind {
        ExprKind::Attribute { .. } => Some("attribute and method access need host objects"),
        ExprKind::Dict(_) => Some("mapping types are not compiled"),
        ExprKind::List(_) => Some("only fixed-size array arguments are compiled"),
        ExprKind::Lambda { .. } => Some("closures are not compiled"),
        ExprKind::Str(_) => Some("strings are not numeric"),
        _ => None,
    };
    if let Some(reason) = reason {
        return Some(AdrenalineError::unsupported(
            function,
            expr.describe(),
            reason,
            expr.span,
        ));
    }
    match &expr.kind {
        ExprKind::Binary { left, right, .. } | ExprKind::BoolOp { left, right, .. } => {
            screen_expr(function, left).or_else(|| screen_expr(function, right))
        }
        ExprKind::Unary { operand, .. } => screen_expr(function, operand),
        ExprKind::Compare { left, rest } => screen_expr(function, left)
            .or_else(|| rest.iter().find_map(|(_, e)| screen_expr(function, e))),
        ExprKind::Call {
            func,
            args,
            keywords,
        } => screen_expr(function, func)
            .or_else(|| args.iter().find_map(|a| screen_expr(function, a)))
            .or_else(|| keywords.iter().find_map(|(_, e)| screen_expr(function, e))),
        ExprKind::Subscript { value, index } => {
            screen_expr(function, value).or_else(|| screen_expr(function, index))
        }
        ExprKind::Tuple(items) => items.iter().find_map(|e| screen_expr(function, e)),
        ExprKind::IfExp {
            cond,
            then,
            otherwise,
        } => screen_expr(function, cond)
            .or_else(|| screen_expr(function, then))
            .or_else(|| screen_expr(function, otherwise)),
        _ => None,
    }
}

/// Which locals are assigned on every path reaching the current point
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Definite {
    assigned: BTreeSet<LocalId>,
    /// The current point cannot be reached (after `return`, `break` or `continue`)
    dead: bool,
}

impl Definite {
    pub(crate) fn new() -> Self {
        Self {
            assigned: BTreeSet::new(),
            dead: false,
        }
    }

    pub(crate) fn assign(&mut self, id: LocalId) {
        self.assigned.insert(id);
    }

    pub(crate) fn is_assigned(&self, id: LocalId) -> bool {
        self.dead || self.assigned.contains(&id)
    }

    pub(crate) fn kill(&mut self) {
        self.dead = true;
    }

    pub(crate) const fn is_dead(&self) -> bool {
        self.dead
    }

    /// Merge two paths meeting at a join point
    pub(crate) fn join(self, other: Self) -> Self {
        match (self.dead, other.dead) {
            (true, _) => other,
            (_, true) => self,
            _ => Self {
                assigned: self
                    .assigned
                    .intersection(&other.assigned)
                    .copied()
                    .collect(),
                dead: false,
            },
        }
    }
}

/// Local variables of one function under analysis
#[derive(Debug)]
pub(crate) struct Scope {
    /// Names bound anywhere in the function (Python's local-name rule)
    local_names: BTreeSet<String>,
    ids: HashMap<String, LocalId>,
    pub(crate) locals: Vec<LocalDecl>,
    pub(crate) definite: Definite,
}

impl Scope {
    pub(crate) fn new(local_names: BTreeSet<String>) -> Self {
        Self {
            local_names,
            ids: HashMap::new(),
            locals: Vec::new(),
            definite: Definite::new(),
        }
    }

    /// True when `name` refers to a local of this function rather than a module name
    pub(crate) fn is_local_name(&self, name: &str) -> bool {
        self.local_names.contains(name)
    }

    pub(crate) fn lookup(&self, name: &str) -> Option<LocalId> {
        self.ids.get(name).copied()
    }

    pub(crate) fn decl(&self, id: LocalId) -> &LocalDecl {
        &self.locals[id.index()]
    }

    pub(crate) fn declare_param(&mut self, name: &str, kind: ValueKind, position: usize) -> LocalId {
        let id = self.push(name.to_string(), kind, LocalOrigin::Param(position));
        self.ids.insert(name.to_string(), id);
        self.definite.assign(id);
        id
    }

    /// The local `name` with kind `kind`, declared on first use
    ///
    /// A local keeps the kind of its first assignment for the whole function.
    pub(crate) fn bind(
        &mut self,
        function: &str,
        name: &str,
        kind: ValueKind,
        span: Span,
    ) -> Result<LocalId, AdrenalineError> {
        if let Some(id) = self.lookup(name) {
            let declared = self.decl(id).kind;
            if declared != kind {
                return Err(AdrenalineError::inconsistent(
                    function,
                    format!("'{name}' is {declared} but is assigned {kind}"),
                    span,
                ));
            }
            return Ok(id);
        }
        let id = self.push(name.to_string(), kind, LocalOrigin::User);
        self.ids.insert(name.to_string(), id);
        Ok(id)
    }

    pub(crate) fn temp(&mut self, hint: &str, kind: ValueKind) -> LocalId {
        let name = format!("${hint}{}", self.locals.len());
        self.push(name, kind, LocalOrigin::Temp)
    }

    fn push(&mut self, name: String, kind: ValueKind, origin: LocalOrigin) -> LocalId {
        let id = LocalId(self.locals.len() as u32);
        self.locals.push(LocalDecl { name, kind, origin });
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::typed::NumType;
    use crate::error::ErrorKind;
    use crate::parser::Parser;

    fn def(source: &str) -> FunctionDef {
        Parser::parse_module(source)
            .unwrap()
            .functions()
            .next()
            .unwrap()
            .clone()
    }

    #[test]
    fn screen_rejects_mapping_access() {
        let f = def("def get_count(data):\n    return data.get(\"count\", 0)\n");
        let err = screen(&f).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedConstruct);
        assert_eq!(err.construct(), Some("attribute access"));
    }

    #[test]
    fn screen_rejects_nested_statements() {
        let f = def("def f(x):\n    if x:\n        try:\n            x = 1\n        except ValueError:\n            pass\n    return x\n");
        assert_eq!(screen(&f).unwrap_err().construct(), Some("exception handling"));
    }

    #[test]
    fn screen_accepts_numeric_code() {
        let f = def("def f(n):\n    t = 0\n    for i in range(n):\n        t += i * 2\n    return t\n");
        assert!(screen(&f).is_ok());
    }

    #[test]
    fn join_keeps_common_assignments() {
        let mut a = Definite::new();
        a.assign(LocalId(0));
        a.assign(LocalId(1));
        let mut b = Definite::new();
        b.assign(LocalId(1));
        let joined = a.clone().join(b);
        assert!(!joined.is_assigned(LocalId(0)));
        assert!(joined.is_assigned(LocalId(1)));

        let mut dead = Definite::new();
        dead.kill();
        assert_eq!(dead.join(a.clone()), a);
    }

    #[test]
    fn bind_fixes_kind() {
        let mut scope = Scope::new(BTreeSet::from(["x".to_string()]));
        let int = ValueKind::Scalar(NumType::Int);
        let id = scope.bind("f", "x", int, Span::default()).unwrap();
        assert_eq!(scope.bind("f", "x", int, Span::default()).unwrap(), id);
        let err = scope
            .bind("f", "x", ValueKind::Scalar(NumType::Float), Span::default())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InconsistentType);
    }
}
