//! Parallel lowering
//!
//! The outermost loop that passes the dependence checks with at most one reduction is
//! outlined into a [`ParallelLoop`]: the runtime splits `[start, stop)` into contiguous
//! chunks, runs the chunk loop on the worker pool and folds the per-chunk partials in
//! chunk order.

use std::collections::HashMap;

use crate::analysis::typed::{
    ForLoop, LocalId, LoopBound, NumType, ParallelLoop, TExpr, TStmt, TypedFunction, ValueKind,
};

use super::deps::{self, LoopDeps, Target};
use super::PassReport;

pub(super) fn run(function: &mut TypedFunction, report: &mut PassReport) {
    let reads = deps::read_counts(&function.body);
    let body = std::mem::take(&mut function.body);
    function.body = lower_block(function, body, &reads, report);
}

fn lower_block(
    function: &mut TypedFunction,
    statements: Vec<TStmt>,
    reads: &HashMap<LocalId, usize>,
    report: &mut PassReport,
) -> Vec<TStmt> {
    statements
        .into_iter()
        .map(|stmt| match stmt {
            TStmt::For(mut l) => match deps::analyze(function, &l, Target::Parallel, reads) {
                Ok(found) => outline(function, l, found, report),
                Err(reason) => {
                    report.skipped(format!("loop at {}: {reason}", l.span));
                    let body = std::mem::take(&mut l.body);
                    l.body = lower_block(function, body, reads, report);
                    TStmt::For(l)
                }
            },
            mut other => {
                for block in other.blocks_mut() {
                    let inner = std::mem::take(block);
                    *block = lower_block(function, inner, reads, report);
                }
                other
            }
        })
        .collect()
}

fn outline(function: &mut TypedFunction, l: ForLoop, found: LoopDeps, report: &mut PassReport) -> TStmt {
    let chunk_lo = function.add_temp("$chunk_lo", ValueKind::Scalar(NumType::Int));
    let chunk_hi = function.add_temp("$chunk_hi", ValueKind::Scalar(NumType::Int));
    let reduction = found.reductions.first().copied();
    report.applied(match reduction {
        Some(r) => format!(
            "loop at {} runs in chunks reducing '{}'",
            l.span,
            function.local(r.acc).name
        ),
        None => format!("loop at {} runs in chunks", l.span),
    });
    let chunk = TStmt::For(ForLoop {
        var: l.var,
        start: TExpr::local(chunk_lo, NumType::Int),
        stop: TExpr::local(chunk_hi, NumType::Int),
        step: TExpr::int(1),
        bound: LoopBound::Range,
        body: l.body,
        exit_value: false,
        span: l.span,
    });
    TStmt::Parallel(ParallelLoop {
        var: l.var,
        start: l.start,
        stop: l.stop,
        chunk_lo,
        chunk_hi,
        chunk: Box::new(chunk),
        reduction,
        captures: found.invariants,
        arrays: found.arrays,
        span: l.span,
    })
}

#[cfg(test)]
mod tests {
    use crate::analysis::typed::{ReductionOp, TStmt};
    use crate::config::AdrenalineConfig;
    use crate::opt::pass;
    use crate::opt::tests::{optimized, optimized_with};
    use crate::testutil::{int, int_array};

    fn parallel_loops(body: &[TStmt]) -> Vec<&crate::analysis::typed::ParallelLoop> {
        body.iter()
            .filter_map(|s| match s {
                TStmt::Parallel(p) => Some(p),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn list_reduction_is_outlined() {
        let source = "def process_list(items: list[int]):\n    # #adrenaline:parallel\n    result = 0\n    for item in items:\n        result += item * 2\n    return result\n";
        let (body, report) = optimized(source, "process_list", &[int_array()]);
        assert_eq!(report.applied(pass::PARALLEL), 1);
        let loops = parallel_loops(&body.root().body);
        assert_eq!(loops.len(), 1);
        let reduction = loops[0].reduction.unwrap();
        assert_eq!(reduction.op, ReductionOp::Add);
        assert_eq!(loops[0].arrays.len(), 1);
        assert!(loops[0].captures.is_empty());
    }

    #[test]
    fn elementwise_store_has_no_reduction() {
        let source = "def scale(a: list[int], k):\n    # #adrenaline:parallel\n    for i in range(len(a)):\n        a[i] = a[i] * k\n";
        let (body, _) = optimized(source, "scale", &[int_array(), int()]);
        let loops = parallel_loops(&body.root().body);
        assert_eq!(loops.len(), 1);
        assert!(loops[0].reduction.is_none());
        assert_eq!(loops[0].captures.len(), 1);
    }

    #[test]
    fn inner_loop_is_tried_when_outer_fails() {
        let source = "def f(n):\n    # #adrenaline:parallel\n    prev = 0\n    t = 0\n    for i in range(n):\n        s = 0\n        for j in range(n):\n            s += j\n        t += s + prev\n        prev = i\n    return t\n";
        let (body, report) = optimized(source, "f", &[int()]);
        assert_eq!(report.applied(pass::PARALLEL), 1);
        assert!(parallel_loops(&body.root().body).is_empty());
        assert!(report
            .skipped(pass::PARALLEL)
            .iter()
            .any(|s| s.contains("'prev' carries a value")));
    }

    #[test]
    fn single_worker_still_lowers() {
        let source = "def f(n):\n    # #adrenaline:parallel\n    t = 0\n    for i in range(n):\n        t += i\n    return t\n";
        let config = AdrenalineConfig::default().with_parallel_workers(1);
        let (_, report) = optimized_with(source, "f", &[int()], &config);
        assert_eq!(report.applied(pass::PARALLEL), 1);
    }
}
