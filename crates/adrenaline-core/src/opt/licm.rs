//! Loop-invariant code motion
//!
//! Subexpressions that read nothing the loop writes and can never deoptimize are computed
//! once into a temporary before the loop. Only non-trapping nodes move, so evaluating them
//! when the loop body would not have run is unobservable.

use crate::analysis::typed::{
    ArithOp, BuiltinOp, CastOp, LocalId, NumType, TExpr, TExprKind, TStmt, TypedFunction, UnOp,
    ValueKind,
};

use super::PassReport;

pub(super) fn run(function: &mut TypedFunction, report: &mut PassReport) {
    let body = std::mem::take(&mut function.body);
    function.body = hoist_block(function, body, report);
}

fn hoist_block(function: &mut TypedFunction, statements: Vec<TStmt>, report: &mut PassReport) -> Vec<TStmt> {
    let mut out = Vec::with_capacity(statements.len());
    for mut stmt in statements {
        for block in stmt.blocks_mut() {
            let inner = std::mem::take(block);
            *block = hoist_block(function, inner, report);
        }
        if matches!(stmt, TStmt::For(_) | TStmt::While { .. }) {
            let hoisted = hoist_loop(function, &mut stmt);
            if !hoisted.is_empty() {
                report.applied(format!("{} invariant expressions hoisted", hoisted.len()));
                out.extend(hoisted);
            }
        }
        out.push(stmt);
    }
    out
}

fn hoist_loop(function: &mut TypedFunction, stmt: &mut TStmt) -> Vec<TStmt> {
    let mut written = Vec::new();
    stmt.written_locals(&mut written);
    let mut hoister = Hoister {
        function,
        written,
        hoisted: Vec::new(),
    };
    match stmt {
        TStmt::For(l) => {
            for s in &mut l.body {
                hoister.stmt(s);
            }
        }
        TStmt::While { cond, body, .. } => {
            hoister.expr(cond);
            for s in body.iter_mut() {
                hoister.stmt(s);
            }
        }
        _ => {}
    }
    hoister.hoisted
}

struct Hoister<'f> {
    function: &'f mut TypedFunction,
    written: Vec<LocalId>,
    hoisted: Vec<TStmt>,
}

impl Hoister<'_> {
    fn stmt(&mut self, stmt: &mut TStmt) {
        // Loop bounds of inner counted loops are evaluated once per outer iteration too
        for expr in stmt.exprs_mut() {
            self.expr(expr);
        }
        for block in stmt.blocks_mut() {
            for s in block.iter_mut() {
                self.stmt(s);
            }
        }
    }

    fn expr(&mut self, expr: &mut TExpr) {
        if self.movable(expr) {
            if expr.node_count() > 1 {
                let temp = self
                    .function
                    .add_temp("$inv", ValueKind::Scalar(expr.ty));
                let value = std::mem::replace(expr, TExpr::local(temp, expr.ty));
                self.hoisted.push(TStmt::Assign(temp, value));
            }
            return;
        }
        for child in expr.children_mut() {
            self.expr(child);
        }
    }

    fn movable(&self, expr: &TExpr) -> bool {
        let mut ok = true;
        expr.walk(&mut |e| {
            ok &= match &e.kind {
                TExprKind::Local(id) => !self.written.contains(id),
                TExprKind::Const(_) | TExprKind::Len(_) => true,
                _ => cannot_trap(e),
            };
        });
        ok
    }
}

/// True for nodes whose evaluation never deoptimizes, whatever the operand values
fn cannot_trap(expr: &TExpr) -> bool {
    match &expr.kind {
        TExprKind::Binary(op, ..) => {
            expr.ty == NumType::Float && matches!(op, ArithOp::Add | ArithOp::Sub | ArithOp::Mul)
                || expr.ty == NumType::Int
                    && matches!(op, ArithOp::BitAnd | ArithOp::BitOr | ArithOp::BitXor)
        }
        TExprKind::Unary(op, _) => expr.ty == NumType::Float || *op != UnOp::Neg,
        TExprKind::Compare(..) | TExprKind::Logic(..) | TExprKind::Select { .. } => true,
        TExprKind::Cast(op, _) => matches!(
            op,
            CastOp::IntToFloat | CastOp::BoolToInt | CastOp::BoolToFloat | CastOp::ToBool
        ),
        TExprKind::Builtin(op, _) => expr.ty == NumType::Float || *op != BuiltinOp::Abs,
        TExprKind::Const(_) | TExprKind::Local(_) | TExprKind::Len(_) => true,
        TExprKind::Index(..) | TExprKind::Call(..) => false,
    }
}

#[cfg(test)]
mod tests {
    use crate::analysis::typed::{NumType, TStmt, ValueKind};
    use crate::opt::pass;
    use crate::opt::tests::optimized;
    use crate::testutil::{float, int};

    #[test]
    fn float_invariants_move_out() {
        let source = "def f(a: list[float], x: float, y: float):\n    t = 0.0\n    for i in range(len(a)):\n        t += a[i] * (x * y + 1.0)\n    return t\n";
        let (body, report) = optimized(
            source,
            "f",
            &[ValueKind::Array(NumType::Float), float(), float()],
        );
        assert_eq!(report.applied(pass::LICM), 1);
        let before_loop = body
            .root()
            .body
            .iter()
            .take_while(|s| !matches!(s, TStmt::For(_)))
            .filter(|s| matches!(s, TStmt::Assign(..)))
            .count();
        assert_eq!(before_loop, 2);
    }

    #[test]
    fn trapping_integer_math_stays() {
        let source = "def f(n, k):\n    t = 0\n    for i in range(n):\n        t += i * (k * k)\n    return t\n";
        let (_, report) = optimized(source, "f", &[int(), int()]);
        assert_eq!(report.applied(pass::LICM), 0);
    }
}
