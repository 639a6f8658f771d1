//! Dependence analysis for unit-stride loops
//!
//! SIMD and parallel lowering both need to know that iterations of a loop can run out of
//! order. A loop qualifies when every scalar it writes is either
//!
//! - a reduction: only ever updated as `acc = acc op e` (or `e op acc`, or `min`/`max`) and
//!   read nowhere else in the body, or
//! - private: assigned before it is read on every path through one iteration,
//!
//! and every array it stores into is only accessed at the loop index.

use std::collections::HashMap;

use crate::analysis::typed::{
    ArithOp, BuiltinOp, ForLoop, LocalId, LoopBound, NumType, Reduction, ReductionOp, TExpr,
    TExprKind, TStmt, TypedFunction, ValueKind,
};

/// Which lowering is asking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Vector,
    Parallel,
}

/// How each local a loop touches behaves across iterations
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoopDeps {
    pub reductions: Vec<Reduction>,
    pub privates: Vec<LocalId>,
    /// Scalars read but never written by the body
    pub invariants: Vec<LocalId>,
    /// Every array the body references
    pub arrays: Vec<LocalId>,
    pub stored: Vec<LocalId>,
}

/// Scalar reads of every local in `body`, nested statements included
#[must_use]
pub fn read_counts(body: &[TStmt]) -> HashMap<LocalId, usize> {
    let mut counts = HashMap::new();
    for stmt in body {
        stmt.walk_exprs(&mut |e| {
            if let TExprKind::Local(id) = e.kind {
                *counts.entry(id).or_insert(0) += 1;
            }
        });
    }
    counts
}

/// True for `range(start, stop)` loops with a literal step of 1
#[must_use]
pub fn is_unit_stride(l: &ForLoop) -> bool {
    l.bound == LoopBound::Range
        && !l.exit_value
        && matches!(l.step.as_const(), Some(crate::analysis::typed::Const::Int(1)))
}

/// True when the body contains no nested loop of any kind
#[must_use]
pub fn is_innermost(body: &[TStmt]) -> bool {
    let mut nested = false;
    for stmt in body {
        stmt.walk(&mut |s| {
            if matches!(
                s,
                TStmt::For(_) | TStmt::While { .. } | TStmt::Vector(_) | TStmt::Parallel(_)
            ) {
                nested = true;
            }
        });
    }
    !nested
}

/// Classify the locals of `l`
///
/// `function_reads` holds the read counts of the whole enclosing function; parallel lowering
/// uses it to refuse privates that are still read after the loop.
pub fn analyze(
    function: &TypedFunction,
    l: &ForLoop,
    target: Target,
    function_reads: &HashMap<LocalId, usize>,
) -> Result<LoopDeps, String> {
    if !is_unit_stride(l) {
        return Err("stride is not a literal 1".into());
    }
    check_structure(&l.body)?;

    let mut written = Vec::new();
    for stmt in &l.body {
        stmt.written_locals(&mut written);
    }
    if written.contains(&l.var) {
        return Err("the loop counter is reassigned in the body".into());
    }
    dedup(&mut written);

    let loop_reads = read_counts(&l.body);
    let mut deps = LoopDeps::default();
    let mut private_candidates = Vec::new();
    for &id in &written {
        let decl = function.local(id);
        let ValueKind::Scalar(ty) = decl.kind else {
            continue;
        };
        match reduction_for(id, ty, &l.body, &loop_reads) {
            Some(op) => {
                if ty == NumType::Float && matches!(op, ReductionOp::Min | ReductionOp::Max) {
                    return Err(format!(
                        "float min/max reduction on '{}' depends on evaluation order",
                        decl.name
                    ));
                }
                if ty != NumType::Float && op == ReductionOp::Mul {
                    return Err(format!(
                        "integer product on '{}' may overflow at a different point when split",
                        decl.name
                    ));
                }
                deps.reductions.push(Reduction { acc: id, op, ty });
            }
            None => private_candidates.push(id),
        }
    }

    let mut flow = Flow::default();
    let mut read_first = None;
    flow_block(&l.body, &mut flow, &private_candidates, &mut read_first);
    if let Some(id) = read_first {
        return Err(format!(
            "'{}' carries a value between iterations",
            function.local(id).name
        ));
    }
    deps.privates = private_candidates;

    if target == Target::Parallel {
        if deps.reductions.len() > 1 {
            return Err("more than one reduction".into());
        }
        for &id in &deps.privates {
            let inside = loop_reads.get(&id).copied().unwrap_or(0);
            if function_reads.get(&id).copied().unwrap_or(0) > inside {
                return Err(format!(
                    "'{}' is read after the loop",
                    function.local(id).name
                ));
            }
        }
    }

    collect_arrays(&l.body, &mut deps);
    let aliases = index_aliases(l.var, &l.body, &deps.privates);
    for &array in &deps.stored {
        if !accessed_at_index(array, &l.body, &aliases) {
            return Err(format!(
                "cross-iteration dependency on '{}'",
                function.local(array).name
            ));
        }
    }

    for &id in loop_reads.keys() {
        if id != l.var
            && !written.contains(&id)
            && !function.local(id).kind.is_array()
            && !deps.invariants.contains(&id)
        {
            deps.invariants.push(id);
        }
    }
    deps.invariants.sort();
    Ok(deps)
}

fn dedup(ids: &mut Vec<LocalId>) {
    let mut seen = Vec::with_capacity(ids.len());
    ids.retain(|id| {
        if seen.contains(id) {
            false
        } else {
            seen.push(*id);
            true
        }
    });
}

fn check_structure(body: &[TStmt]) -> Result<(), String> {
    let mut problem = None;
    for stmt in body {
        stmt.walk(&mut |s| {
            if problem.is_some() {
                return;
            }
            problem = match s {
                TStmt::Break => Some("break leaves the loop early"),
                TStmt::Return(_) => Some("the body returns"),
                TStmt::While { .. } => Some("the body contains a while loop"),
                TStmt::Vector(_) | TStmt::Parallel(_) => Some("the body is already lowered"),
                _ if s.exprs().iter().any(|e| e.contains_call()) => Some("the body calls a function"),
                _ => None,
            };
        });
    }
    match problem {
        Some(p) => Err(p.into()),
        None => Ok(()),
    }
}

/// The reduction operator every write of `acc` uses, if all writes are reduction updates
/// and `acc` is read nowhere else
fn reduction_for(
    acc: LocalId,
    ty: NumType,
    body: &[TStmt],
    loop_reads: &HashMap<LocalId, usize>,
) -> Option<ReductionOp> {
    let mut op = None;
    let mut updates = 0;
    let mut other_write = false;
    for stmt in body {
        stmt.walk(&mut |s| match s {
            TStmt::Assign(id, value) if *id == acc => {
                match reduction_update(acc, value) {
                    Some(found) if op.is_none() || op == Some(found) => {
                        op = Some(found);
                        updates += 1;
                    }
                    _ => other_write = true,
                }
            }
            TStmt::For(l) if l.var == acc => other_write = true,
            _ => {}
        });
    }
    if other_write || ty == NumType::Bool {
        return None;
    }
    let op = op?;
    // Each update reads `acc` exactly once
    (loop_reads.get(&acc).copied().unwrap_or(0) == updates).then_some(op)
}

fn reduction_update(acc: LocalId, value: &TExpr) -> Option<ReductionOp> {
    let is_acc = |e: &TExpr| e.as_local() == Some(acc);
    match &value.kind {
        TExprKind::Binary(op, left, right) => {
            let commutative = matches!(op, ArithOp::Add | ArithOp::Mul);
            let operand = if is_acc(left) {
                right
            } else if commutative && is_acc(right) {
                left
            } else {
                return None;
            };
            if operand.reads_local(acc) {
                return None;
            }
            match op {
                ArithOp::Add => Some(ReductionOp::Add),
                ArithOp::Sub => Some(ReductionOp::Sub),
                ArithOp::Mul => Some(ReductionOp::Mul),
                _ => None,
            }
        }
        TExprKind::Builtin(op @ (BuiltinOp::Min | BuiltinOp::Max), args) if args.len() == 2 => {
            let operand = match (is_acc(&args[0]), is_acc(&args[1])) {
                (true, false) => &args[1],
                (false, true) => &args[0],
                _ => return None,
            };
            if operand.reads_local(acc) {
                return None;
            }
            Some(if *op == BuiltinOp::Min {
                ReductionOp::Min
            } else {
                ReductionOp::Max
            })
        }
        _ => None,
    }
}

#[derive(Debug, Clone, Default)]
struct Flow {
    assigned: Vec<LocalId>,
    dead: bool,
}

impl Flow {
    fn join(a: Self, b: Self) -> Self {
        if a.dead {
            return b;
        }
        if b.dead {
            return a;
        }
        Self {
            assigned: a
                .assigned
                .into_iter()
                .filter(|id| b.assigned.contains(id))
                .collect(),
            dead: false,
        }
    }
}

fn check_reads(expr: &TExpr, flow: &Flow, candidates: &[LocalId], bad: &mut Option<LocalId>) {
    if bad.is_some() {
        return;
    }
    expr.walk(&mut |e| {
        if let TExprKind::Local(id) = e.kind {
            if candidates.contains(&id) && !flow.assigned.contains(&id) && bad.is_none() {
                *bad = Some(id);
            }
        }
    });
}

fn flow_block(body: &[TStmt], flow: &mut Flow, candidates: &[LocalId], bad: &mut Option<LocalId>) {
    for stmt in body {
        if flow.dead {
            return;
        }
        match stmt {
            TStmt::Assign(id, value) => {
                check_reads(value, flow, candidates, bad);
                flow.assigned.push(*id);
            }
            TStmt::If {
                cond,
                then,
                otherwise,
            } => {
                check_reads(cond, flow, candidates, bad);
                let mut a = flow.clone();
                flow_block(then, &mut a, candidates, bad);
                let mut b = flow.clone();
                flow_block(otherwise, &mut b, candidates, bad);
                *flow = Flow::join(a, b);
            }
            TStmt::For(l) => {
                for e in [&l.start, &l.stop, &l.step] {
                    check_reads(e, flow, candidates, bad);
                }
                let mut inner = flow.clone();
                inner.assigned.push(l.var);
                flow_block(&l.body, &mut inner, candidates, bad);
            }
            TStmt::Block { body, .. } => {
                let mut inner = flow.clone();
                flow_block(body, &mut inner, candidates, bad);
            }
            TStmt::Continue | TStmt::Break | TStmt::Return(_) | TStmt::ExitBlock(_) => {
                flow.dead = true;
            }
            other => {
                for e in other.exprs() {
                    check_reads(e, flow, candidates, bad);
                }
            }
        }
    }
}

fn collect_arrays(body: &[TStmt], deps: &mut LoopDeps) {
    for stmt in body {
        stmt.walk(&mut |s| {
            if let TStmt::Store { array, .. } = s {
                push_unique(&mut deps.stored, *array);
                push_unique(&mut deps.arrays, *array);
            }
        });
        stmt.walk_exprs(&mut |e| match e.kind {
            TExprKind::Index(id, _) | TExprKind::Len(id) => push_unique(&mut deps.arrays, id),
            _ => {}
        });
    }
}

fn push_unique(ids: &mut Vec<LocalId>, id: LocalId) {
    if !ids.contains(&id) {
        ids.push(id);
    }
}

/// Privates only ever assigned the loop counter, as subscripted augmented assignments leave
fn index_aliases(var: LocalId, body: &[TStmt], privates: &[LocalId]) -> Vec<LocalId> {
    let mut aliases = vec![var];
    for &p in privates {
        let mut only_counter = true;
        for stmt in body {
            stmt.walk(&mut |s| match s {
                TStmt::Assign(id, value) if *id == p => {
                    only_counter &= value.as_local() == Some(var);
                }
                TStmt::For(l) if l.var == p => only_counter = false,
                _ => {}
            });
        }
        if only_counter {
            aliases.push(p);
        }
    }
    aliases
}

fn accessed_at_index(array: LocalId, body: &[TStmt], aliases: &[LocalId]) -> bool {
    let at_index = |e: &TExpr| e.as_local().is_some_and(|id| aliases.contains(&id));
    let mut ok = true;
    for stmt in body {
        stmt.walk(&mut |s| {
            if let TStmt::Store { array: a, index, .. } = s {
                if *a == array && !at_index(index) {
                    ok = false;
                }
            }
        });
        stmt.walk_exprs(&mut |e| {
            if let TExprKind::Index(a, index) = &e.kind {
                if *a == array && !at_index(index) {
                    ok = false;
                }
            }
        });
    }
    ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::typed::TypedBody;
    use crate::analysis::{Analyzer, EligibilityVerdict};
    use crate::host::{FunctionSource, HostProgram};
    use crate::testutil::{float_array, int, int_array};
    use crate::unit::FunctionUnit;

    fn body_of(source: &str, kinds: &[ValueKind]) -> TypedBody {
        let program = HostProgram::from_source(source, 1000).unwrap();
        let unit = FunctionUnit::new(program.function("f").unwrap());
        let EligibilityVerdict::Eligible(body) = Analyzer::new(&program).analyze(&unit, kinds).verdict else {
            panic!("f should be eligible");
        };
        body
    }

    fn first_for(function: &TypedFunction) -> &ForLoop {
        function
            .body
            .iter()
            .find_map(|s| match s {
                TStmt::For(l) => Some(l),
                _ => None,
            })
            .unwrap()
    }

    fn deps_of(source: &str, kinds: &[ValueKind], target: Target) -> Result<LoopDeps, String> {
        let body = body_of(source, kinds);
        let root = body.root();
        analyze(root, first_for(root), target, &read_counts(&root.body))
    }

    #[test]
    fn sum_is_a_reduction() {
        let deps = deps_of(
            "def f(n):\n    t = 0\n    for i in range(n):\n        t += i * 2\n    return t\n",
            &[int()],
            Target::Parallel,
        )
        .unwrap();
        assert_eq!(deps.reductions.len(), 1);
        assert_eq!(deps.reductions[0].op, ReductionOp::Add);
        assert!(deps.privates.is_empty());
    }

    #[test]
    fn min_and_product_reductions() {
        let deps = deps_of(
            "def f(a: list[int]):\n    lo = 1000\n    p = 1.0\n    for i in range(len(a)):\n        lo = min(lo, a[i])\n        p = p * 2.0\n    return lo + p\n",
            &[int_array()],
            Target::Vector,
        )
        .unwrap();
        let ops: Vec<_> = deps.reductions.iter().map(|r| r.op).collect();
        assert!(ops.contains(&ReductionOp::Min));
        assert!(ops.contains(&ReductionOp::Mul));
    }

    #[test]
    fn integer_product_is_not_split() {
        let err = deps_of(
            "def f(a: list[int]):\n    p = 1\n    for i in range(len(a)):\n        p = p * a[i]\n    return p\n",
            &[int_array()],
            Target::Vector,
        )
        .unwrap_err();
        assert!(err.contains("integer product on 'p'"), "{err}");
    }

    #[test]
    fn parallel_takes_a_single_reduction() {
        let err = deps_of(
            "def f(n):\n    a = 0\n    b = 0\n    for i in range(n):\n        a += i\n        b += 1\n    return a + b\n",
            &[int()],
            Target::Parallel,
        )
        .unwrap_err();
        assert_eq!(err, "more than one reduction");
    }

    #[test]
    fn carried_scalar_is_refused() {
        let err = deps_of(
            "def f(n):\n    prev = 0\n    t = 0\n    for i in range(n):\n        t += prev\n        prev = i\n    return t\n",
            &[int()],
            Target::Vector,
        )
        .unwrap_err();
        assert!(err.contains("'prev' carries a value"), "{err}");
    }

    #[test]
    fn private_temporaries_are_fine() {
        let deps = deps_of(
            "def f(a: list[float], out: list[float]):\n    for i in range(len(a)):\n        x = a[i] * 2.0\n        out[i] = x + 1.0\n",
            &[float_array(), float_array()],
            Target::Vector,
        )
        .unwrap();
        assert_eq!(deps.stored.len(), 1);
        assert_eq!(deps.arrays.len(), 2);
        assert_eq!(deps.privates.len(), 1);
    }

    #[test]
    fn shifted_index_is_a_dependency() {
        let err = deps_of(
            "def f(a: list[int]):\n    for i in range(1, len(a)):\n        a[i] = a[i - 1] + 1\n",
            &[int_array()],
            Target::Vector,
        )
        .unwrap_err();
        assert_eq!(err, "cross-iteration dependency on 'a'");
    }

    #[test]
    fn augmented_element_update_is_indexed_by_the_counter() {
        let deps = deps_of(
            "def f(a: list[int]):\n    for i in range(len(a)):\n        a[i] += 3\n",
            &[int_array()],
            Target::Parallel,
        )
        .unwrap();
        assert_eq!(deps.stored.len(), 1);
    }

    #[test]
    fn strided_and_early_exit_loops() {
        assert!(deps_of(
            "def f(n):\n    t = 0\n    for i in range(0, n, 2):\n        t += i\n    return t\n",
            &[int()],
            Target::Vector,
        )
        .is_err());
        let err = deps_of(
            "def f(n):\n    t = 0\n    for i in range(n):\n        if i > 5:\n            break\n        t += i\n    return t\n",
            &[int()],
            Target::Vector,
        )
        .unwrap_err();
        assert_eq!(err, "break leaves the loop early");
    }

    #[test]
    fn private_read_after_loop_blocks_parallel() {
        let source = "def f(n):\n    x = 0\n    for i in range(n):\n        x = i * 2\n    return x\n";
        assert!(deps_of(source, &[int()], Target::Vector).is_ok());
        let err = deps_of(source, &[int()], Target::Parallel).unwrap_err();
        assert_eq!(err, "'x' is read after the loop");
    }
}
