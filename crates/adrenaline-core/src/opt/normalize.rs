//! Loop normalization
//!
//! Rewrites counting `while` loops into counted loops:
//!
//! ```python
//! i = 0
//! while i < n:
//!     ...
//!     i += 2
//! ```
//!
//! The loop must compare an integer local against an invariant bound, step it by a
//! constant of the matching sign as its last statement, never write it elsewhere and never
//! `continue`. After a normal exit the counter holds the first value that failed the test,
//! exactly as the `while` loop leaves it.

use crate::analysis::typed::{
    ArithOp, CmpKind, Const, ForLoop, LocalId, LoopBound, NumType, TExpr, TExprKind, TStmt,
    TypedFunction,
};
use crate::lexer::Span;

use super::PassReport;

pub(super) fn run(function: &mut TypedFunction, report: &mut PassReport) {
    let body = std::mem::take(&mut function.body);
    function.body = normalize_block(body, report);
}

fn normalize_block(statements: Vec<TStmt>, report: &mut PassReport) -> Vec<TStmt> {
    statements
        .into_iter()
        .map(|mut stmt| {
            for block in stmt.blocks_mut() {
                let inner = std::mem::take(block);
                *block = normalize_block(inner, report);
            }
            match stmt {
                TStmt::While { cond, body, span } => match counted_form(&cond, &body) {
                    Ok(shape) => {
                        report.applied(format!("while loop at {span} is counted"));
                        into_for(shape, body, span)
                    }
                    Err(reason) => {
                        report.skipped(format!("while loop at {span}: {reason}"));
                        TStmt::While { cond, body, span }
                    }
                },
                other => other,
            }
        })
        .collect()
}

struct Shape {
    var: LocalId,
    bound: LoopBound,
    stop: TExpr,
    step: i64,
}

fn counted_form(cond: &TExpr, body: &[TStmt]) -> Result<Shape, &'static str> {
    let TExprKind::Compare(kind, left, right) = &cond.kind else {
        return Err("condition is not a comparison");
    };
    let (var, stop, kind) = match (left.as_local(), right.as_local()) {
        (Some(var), _) if left.ty == NumType::Int && !right.reads_local(var) => {
            (var, (**right).clone(), *kind)
        }
        (_, Some(var)) if right.ty == NumType::Int && !left.reads_local(var) => {
            (var, (**left).clone(), kind.swapped())
        }
        _ => return Err("condition does not test an integer counter"),
    };
    let bound = match kind {
        CmpKind::Lt => LoopBound::Lt,
        CmpKind::Le => LoopBound::Le,
        CmpKind::Gt => LoopBound::Gt,
        CmpKind::Ge => LoopBound::Ge,
        CmpKind::Eq | CmpKind::Ne => return Err("equality tests have no direction"),
    };

    let Some((last, rest)) = body.split_last() else {
        return Err("empty body");
    };
    let step = step_of(last, var).ok_or("the last statement does not step the counter")?;
    let ascending = matches!(bound, LoopBound::Lt | LoopBound::Le);
    if step == 0 || (step > 0) != ascending {
        return Err("step direction does not approach the bound");
    }

    let mut written = Vec::new();
    for stmt in rest {
        stmt.written_locals(&mut written);
    }
    if written.contains(&var) {
        return Err("the counter is written inside the body");
    }
    if !is_invariant(&stop, &written, rest) {
        return Err("the bound changes inside the loop");
    }
    if rest.iter().any(has_own_continue) {
        return Err("continue would skip the step");
    }
    Ok(Shape {
        var,
        bound,
        stop,
        step,
    })
}

/// `i = i + c` or `i = i - c` with a constant `c`
fn step_of(stmt: &TStmt, var: LocalId) -> Option<i64> {
    let TStmt::Assign(target, value) = stmt else {
        return None;
    };
    if *target != var {
        return None;
    }
    let TExprKind::Binary(op, left, right) = &value.kind else {
        return None;
    };
    if left.as_local() != Some(var) {
        return None;
    }
    match (op, right.as_const()?) {
        (ArithOp::Add, Const::Int(c)) => Some(c),
        (ArithOp::Sub, Const::Int(c)) => c.checked_neg(),
        _ => None,
    }
}

fn is_invariant(expr: &TExpr, written: &[LocalId], body: &[TStmt]) -> bool {
    if expr.contains_call() {
        return false;
    }
    let mut stored = Vec::new();
    for stmt in body {
        stmt.stored_arrays(&mut stored);
    }
    let mut read = Vec::new();
    expr.read_locals(&mut read);
    read.iter()
        .all(|id| !written.contains(id) && !stored.contains(id))
}

/// A `continue` that belongs to the loop whose body contains `stmt`
fn has_own_continue(stmt: &TStmt) -> bool {
    match stmt {
        TStmt::Continue => true,
        TStmt::If {
            then, otherwise, ..
        } => then.iter().any(has_own_continue) || otherwise.iter().any(has_own_continue),
        TStmt::Block { body, .. } => body.iter().any(has_own_continue),
        _ => false,
    }
}

fn into_for(shape: Shape, mut body: Vec<TStmt>, span: Span) -> TStmt {
    body.pop();
    TStmt::For(ForLoop {
        var: shape.var,
        start: TExpr::local(shape.var, NumType::Int),
        stop: shape.stop,
        step: TExpr::int(shape.step),
        bound: shape.bound,
        body,
        exit_value: true,
        span,
    })
}
