//! SIMD lowering
//!
//! Innermost unit-stride loops without cross-iteration dependencies become [`VectorLoop`]s.
//! Straight-line float bodies that only load and store at the loop index use packed `f64x2`
//! arithmetic; everything else is unrolled into independent lanes with split reduction
//! accumulators. The code generator emits the scalar remainder loop.

use std::collections::HashMap;

use crate::analysis::typed::{
    ArithOp, Const, ForLoop, LocalId, NumType, ReductionOp, TExpr, TExprKind, TStmt,
    TypedFunction, UnOp, ValueKind, VectorForm, VectorLoop,
};

use super::deps::{self, LoopDeps, Target};
use super::{PassContext, PassReport};

pub(super) fn run(function: &mut TypedFunction, ctx: &PassContext<'_>, report: &mut PassReport) {
    if ctx.config.vector_width < 2 {
        report.skipped("vector width is below 2");
        return;
    }
    let reads = deps::read_counts(&function.body);
    let body = std::mem::take(&mut function.body);
    let mut lowering = Lowering {
        function,
        lanes: ctx.config.vector_width,
        reads,
        report,
    };
    let body = lowering.block(body);
    function.body = body;
}

struct Lowering<'f, 'r> {
    function: &'f TypedFunction,
    lanes: usize,
    reads: HashMap<LocalId, usize>,
    report: &'r mut PassReport,
}

impl Lowering<'_, '_> {
    fn block(&mut self, statements: Vec<TStmt>) -> Vec<TStmt> {
        statements.into_iter().map(|s| self.stmt(s)).collect()
    }

    fn stmt(&mut self, stmt: TStmt) -> TStmt {
        match stmt {
            TStmt::For(l) if deps::is_innermost(&l.body) => {
                match deps::analyze(self.function, &l, Target::Vector, &self.reads) {
                    Ok(found) => self.vectorize(l, &found),
                    Err(reason) => {
                        self.report.skipped(format!("loop at {}: {reason}", l.span));
                        TStmt::For(l)
                    }
                }
            }
            TStmt::Parallel(mut p) => {
                let chunk = std::mem::replace(p.chunk.as_mut(), TStmt::Continue);
                *p.chunk = self.stmt(chunk);
                TStmt::Parallel(p)
            }
            mut other => {
                for block in other.blocks_mut() {
                    let inner = std::mem::take(block);
                    *block = self.block(inner);
                }
                other
            }
        }
    }

    fn vectorize(&mut self, l: ForLoop, found: &LoopDeps) -> TStmt {
        let packed = is_packable(self.function, &l, found);
        let (form, arrays) = if packed {
            (VectorForm::Packed, found.arrays.clone())
        } else {
            (VectorForm::Lanes(self.lanes), Vec::new())
        };
        self.report.applied(match form {
            VectorForm::Packed => format!("loop at {} packed as f64x2", l.span),
            VectorForm::Lanes(n) => format!("loop at {} split into {n} lanes", l.span),
        });
        TStmt::Vector(VectorLoop {
            var: l.var,
            start: l.start,
            stop: l.stop,
            body: l.body,
            reductions: found.reductions.clone(),
            form,
            arrays,
            span: l.span,
        })
    }
}

fn is_packable(function: &TypedFunction, l: &ForLoop, found: &LoopDeps) -> bool {
    if !found.privates.is_empty() {
        return false;
    }
    if !found.reductions.iter().all(|r| {
        r.ty == NumType::Float && matches!(r.op, ReductionOp::Add | ReductionOp::Sub | ReductionOp::Mul)
    }) {
        return false;
    }
    let leaf = Leaves {
        function,
        var: l.var,
        invariants: &found.invariants,
    };
    l.body.iter().all(|stmt| match stmt {
        TStmt::Store {
            array,
            index,
            value,
        } => leaf.is_float_array(*array) && index.as_local() == Some(l.var) && leaf.packable(value),
        TStmt::Assign(acc, value) => {
            found.reductions.iter().any(|r| r.acc == *acc) && leaf.packable_update(*acc, value)
        }
        _ => false,
    })
}

struct Leaves<'a> {
    function: &'a TypedFunction,
    var: LocalId,
    invariants: &'a [LocalId],
}

impl Leaves<'_> {
    fn is_float_array(&self, id: LocalId) -> bool {
        self.function.local(id).kind == ValueKind::Array(NumType::Float)
    }

    fn packable(&self, expr: &TExpr) -> bool {
        if expr.ty != NumType::Float {
            return false;
        }
        match &expr.kind {
            TExprKind::Const(Const::Float(_)) => true,
            TExprKind::Local(id) => self.invariants.contains(id),
            TExprKind::Index(array, index) => {
                self.is_float_array(*array) && index.as_local() == Some(self.var)
            }
            TExprKind::Binary(ArithOp::Add | ArithOp::Sub | ArithOp::Mul, a, b) => {
                self.packable(a) && self.packable(b)
            }
            TExprKind::Unary(UnOp::Neg, a) => self.packable(a),
            _ => false,
        }
    }

    /// `acc = acc op e` with a packable `e`
    fn packable_update(&self, acc: LocalId, value: &TExpr) -> bool {
        match &value.kind {
            TExprKind::Binary(_, a, b) if a.as_local() == Some(acc) => self.packable(b),
            TExprKind::Binary(_, a, b) if b.as_local() == Some(acc) => self.packable(a),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::analysis::typed::{TStmt, ValueKind, VectorForm};
    use crate::config::AdrenalineConfig;
    use crate::opt::pass;
    use crate::opt::tests::{optimized, optimized_with};
    use crate::testutil::{float, float_array, int};

    fn vector_forms(body: &[TStmt]) -> Vec<VectorForm> {
        let mut forms = Vec::new();
        for stmt in body {
            stmt.walk(&mut |s| {
                if let TStmt::Vector(v) = s {
                    forms.push(v.form);
                }
            });
        }
        forms
    }

    #[test]
    fn integer_sum_uses_lanes() {
        let source = "def sum_range(n):\n    # #adrenaline:simd\n    total = 0\n    for i in range(n):\n        total += i\n    return total\n";
        let (body, report) = optimized(source, "sum_range", &[int()]);
        assert_eq!(report.applied(pass::SIMD), 1);
        assert_eq!(vector_forms(&body.root().body), vec![VectorForm::Lanes(4)]);
    }

    #[test]
    fn float_array_kernel_is_packed() {
        let source = "def axpy(x: list[float], y: list[float], out: list[float], k: float):\n    # #adrenaline:simd\n    for i in range(len(x)):\n        out[i] = k * x[i] + y[i]\n";
        let (body, _) = optimized(
            source,
            "axpy",
            &[float_array(), float_array(), float_array(), float()],
        );
        assert_eq!(vector_forms(&body.root().body), vec![VectorForm::Packed]);
        let Some(TStmt::Vector(v)) = body.root().body.iter().find(|s| matches!(s, TStmt::Vector(_))) else {
            panic!("expected a vector loop");
        };
        assert_eq!(v.arrays.len(), 3);
    }

    #[test]
    fn converted_counter_falls_back_to_lanes() {
        let source = "def numeric_loop(n):\n    # #adrenaline:simd\n    total = 0.0\n    for i in range(n):\n        total += float(i) * 1.5\n    return total\n";
        let (body, _) = optimized(source, "numeric_loop", &[int()]);
        assert_eq!(vector_forms(&body.root().body), vec![VectorForm::Lanes(4)]);
    }

    #[test]
    fn configured_width_is_used() {
        let source = "def f(n):\n    # #adrenaline:simd\n    t = 0\n    for i in range(n):\n        t += i * i\n    return t\n";
        let config = AdrenalineConfig::default().with_vector_width(8);
        let (body, _) = optimized_with(source, "f", &[int()], &config);
        assert_eq!(vector_forms(&body.root().body), vec![VectorForm::Lanes(8)]);
    }

    #[test]
    fn only_innermost_loops_vectorize() {
        let source = "def f(n):\n    # #adrenaline:simd\n    t = 0\n    for i in range(n):\n        for j in range(n):\n            t += i * j\n    return t\n";
        let (body, report) = optimized(source, "f", &[int()]);
        assert_eq!(report.applied(pass::SIMD), 1);
        let Some(TStmt::For(outer)) = body.root().body.iter().find(|s| matches!(s, TStmt::For(_))) else {
            panic!("outer loop should stay scalar");
        };
        assert!(matches!(outer.body[0], TStmt::Vector(_)));
    }

    #[test]
    fn dependency_is_reported() {
        let source = "def f(a: list[int]):\n    # #adrenaline:simd\n    for i in range(1, len(a)):\n        a[i] = a[i - 1] + 1\n";
        let (body, report) = optimized(source, "f", &[ValueKind::Array(crate::analysis::typed::NumType::Int)]);
        assert!(vector_forms(&body.root().body).is_empty());
        assert!(report
            .skipped(pass::SIMD)
            .iter()
            .any(|s| s.ends_with("cross-iteration dependency on 'a'")));
    }
}
