//! Name-binding queries over function bodies

use std::collections::BTreeSet;

use super::{Expr, ExprKind, Stmt, StmtKind};

/// Names bound anywhere in `body` by assignment, `for` targets, imports or nested `def`s
///
/// Nested function bodies are not entered: their bindings belong to their own scope.
#[must_use]
pub fn assigned_names(body: &[Stmt]) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    collect_assigned(body, &mut names);
    names
}

/// Names declared `global` anywhere in `body`
#[must_use]
pub fn global_declarations(body: &[Stmt]) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    visit_statements(body, &mut |stmt| {
        if let StmtKind::Global(idents) = &stmt.kind {
            names.extend(idents.iter().map(|i| i.name.clone()));
        }
    });
    names
}

/// Call `f` on every statement in `body`, recursing into compound statements
/// (but not into nested function definitions)
pub fn visit_statements<'a>(body: &'a [Stmt], f: &mut impl FnMut(&'a Stmt)) {
    for stmt in body {
        f(stmt);
        match &stmt.kind {
            StmtKind::If { body, orelse, .. } => {
                visit_statements(body, f);
                visit_statements(orelse, f);
            }
            StmtKind::While { body, .. } | StmtKind::For { body, .. } => visit_statements(body, f),
            StmtKind::Try {
                body,
                handlers,
                finally,
            } => {
                visit_statements(body, f);
                for handler in handlers {
                    visit_statements(&handler.body, f);
                }
                visit_statements(finally, f);
            }
            _ => {}
        }
    }
}

/// Names a target expression binds (`a`, `a, b`, but not `a[i]`)
pub fn target_names<'a>(target: &'a Expr, out: &mut Vec<&'a str>) {
    match &target.kind {
        ExprKind::Name(name) => out.push(name),
        ExprKind::Tuple(items) | ExprKind::List(items) => {
            for item in items {
                target_names(item, out);
            }
        }
        _ => {}
    }
}

fn collect_assigned(body: &[Stmt], names: &mut BTreeSet<String>) {
    visit_statements(body, &mut |stmt| {
        let mut bound = Vec::new();
        match &stmt.kind {
            StmtKind::Assign { targets, .. } => {
                for target in targets {
                    target_names(target, &mut bound);
                }
            }
            StmtKind::AugAssign { target, .. } | StmtKind::For { target, .. } => {
                target_names(target, &mut bound);
            }
            StmtKind::Import(imports) | StmtKind::FromImport { names: imports, .. } => {
                bound.extend(imports.iter().map(|i| i.bound_name()));
            }
            StmtKind::FunctionDef(def) => bound.push(&def.name.name),
            StmtKind::Try { handlers, .. } => {
                bound.extend(
                    handlers
                        .iter()
                        .filter_map(|h| h.name.as_ref().map(|n| n.name.as_str())),
                );
            }
            _ => {}
        }
        names.extend(bound.into_iter().map(str::to_string));
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Parser;

    #[test]
    fn collects_every_binding_form() {
        let module = Parser::parse_module(
            "def f(n):\n    a = 1\n    b, c = 2, 3\n    for i in range(n):\n        d += i\n    import math\n    try:\n        pass\n    except ValueError as e:\n        pass\n    x[0] = 1\n",
        )
        .unwrap();
        let def = module.function("f").unwrap();
        let names: Vec<String> = assigned_names(&def.body).into_iter().collect();
        assert_eq!(names, vec!["a", "b", "c", "d", "e", "i", "math"]);
    }

    #[test]
    fn finds_global_declarations() {
        let module =
            Parser::parse_module("def f():\n    global counter\n    if True:\n        global total\n").unwrap();
        let def = module.function("f").unwrap();
        let names: Vec<String> = global_declarations(&def.body).into_iter().collect();
        assert_eq!(names, vec!["counter", "total"]);
    }
}
