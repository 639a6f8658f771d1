//! Call inlining
//!
//! A call is replaced by a labelled copy of the callee's body whose returns assign a result
//! temporary and leave the block. Callee locals are renamed to fresh temporaries; array
//! parameters map straight onto the caller's arrays. Recursive callees stay call edges.

use std::collections::HashMap;

use crate::analysis::typed::{
    FuncIndex, Label, LocalId, Purity, ReturnKind, TArg, TExpr, TExprKind, TReturn, TStmt,
    TypedBody, TypedFunction, ValueKind,
};

use super::{PassContext, PassReport};

pub(super) fn run(body: &mut TypedBody, caller: FuncIndex, ctx: &PassContext<'_>, report: &mut PassReport) {
    for _ in 0..ctx.config.inline_depth {
        let mut function = body.function(caller).clone();
        let statements = std::mem::take(&mut function.body);
        let mut inliner = Inliner {
            body,
            caller,
            function: &mut function,
            ctx,
            report: &mut *report,
            inlined: 0,
        };
        let rewritten = inliner.block(statements);
        let inlined = inliner.inlined;
        function.body = rewritten;
        body.functions[caller.index()] = function;
        if inlined == 0 {
            break;
        }
    }
}

struct Inliner<'b, 'f, 'r> {
    body: &'b TypedBody,
    caller: FuncIndex,
    function: &'f mut TypedFunction,
    ctx: &'b PassContext<'b>,
    report: &'r mut PassReport,
    inlined: usize,
}

impl Inliner<'_, '_, '_> {
    fn block(&mut self, statements: Vec<TStmt>) -> Vec<TStmt> {
        let mut out = Vec::with_capacity(statements.len());
        for mut stmt in statements {
            for block in stmt.blocks_mut() {
                let inner = std::mem::take(block);
                *block = self.block(inner);
            }
            // A `while` condition runs on every iteration and cannot be hoisted
            if matches!(stmt, TStmt::While { .. }) {
                out.push(stmt);
                continue;
            }
            let reads_arrays = stmt.exprs().iter().any(|e| reads_array_elements(e));
            let mut hoisted = Vec::new();
            for expr in stmt.exprs_mut() {
                self.extract(expr, reads_arrays, &mut hoisted);
            }
            out.extend(hoisted);
            // A call to a `None` function leaves a constant behind
            if matches!(&stmt, TStmt::Expr(e) if e.as_const().is_some()) {
                continue;
            }
            out.push(stmt);
        }
        out
    }

    /// Inline the calls of `expr` that are evaluated unconditionally, innermost first
    fn extract(&mut self, expr: &mut TExpr, reads_arrays: bool, hoisted: &mut Vec<TStmt>) {
        match &mut expr.kind {
            TExprKind::Logic(_, left, _) => self.extract(left, reads_arrays, hoisted),
            TExprKind::Select { cond, .. } => self.extract(cond, reads_arrays, hoisted),
            _ => {
                for child in expr.children_mut() {
                    self.extract(child, reads_arrays, hoisted);
                }
            }
        }
        let TExprKind::Call(callee, args) = &expr.kind else {
            return;
        };
        let callee = *callee;
        if let Err(reason) = self.decide(callee, reads_arrays) {
            let name = &self.body.function(callee).name;
            self.report.skipped(format!("call to {name}: {reason}"));
            return;
        }
        let args = args.clone();
        *expr = self.expand(callee, args, hoisted);
        self.inlined += 1;
    }

    fn decide(&self, callee: FuncIndex, reads_arrays: bool) -> Result<(), &'static str> {
        if callee == self.caller {
            return Err("direct recursion is never inlined");
        }
        if self.body.is_recursive(callee) {
            return Err("recursive callee");
        }
        let target = self.body.function(callee);
        let requested = target.directives.wants_inline() || self.function.directives.wants_inline();
        let size = target.node_count();
        if requested {
            if size > self.ctx.inline_cap() {
                return Err("callee exceeds the inline cap");
            }
        } else if size > self.ctx.config.inline_node_threshold {
            return Err("callee exceeds the inline threshold");
        }
        // Hoisting the call would run its stores before the statement's own element reads
        if reads_arrays && self.transitive_purity(callee) == Purity::MutatesContainer {
            return Err("callee mutates arrays read by the same statement");
        }
        Ok(())
    }

    fn transitive_purity(&self, index: FuncIndex) -> Purity {
        let mut purity = self.body.function(index).purity;
        let mut stack = self.body.function(index).callees();
        let mut seen = vec![index];
        while let Some(next) = stack.pop() {
            if seen.contains(&next) {
                continue;
            }
            seen.push(next);
            purity = purity.max(self.body.function(next).purity);
            stack.extend(self.body.function(next).callees());
        }
        purity
    }

    fn expand(&mut self, callee_index: FuncIndex, args: Vec<TArg>, hoisted: &mut Vec<TStmt>) -> TExpr {
        let body = self.body;
        let callee = body.function(callee_index);
        let mut map: HashMap<LocalId, LocalId> = HashMap::new();

        for (param, arg) in callee.params.iter().zip(args) {
            match arg {
                TArg::Array(array) => {
                    map.insert(*param, array);
                }
                TArg::Scalar(value) => {
                    let decl = callee.local(*param);
                    let temp = self
                        .function
                        .add_temp(format!("{}.{}", callee.name, decl.name), decl.kind);
                    map.insert(*param, temp);
                    hoisted.push(TStmt::Assign(temp, value));
                }
            }
        }
        for (position, decl) in callee.locals.iter().enumerate() {
            let id = LocalId(position as u32);
            if !map.contains_key(&id) {
                let temp = self
                    .function
                    .add_temp(format!("{}.{}", callee.name, decl.name), decl.kind);
                map.insert(id, temp);
            }
        }

        let result = match callee.ret {
            ReturnKind::Scalar(ty) => Some((
                self.function
                    .add_temp(format!("{}.result", callee.name), ValueKind::Scalar(ty)),
                ty,
            )),
            ReturnKind::None | ReturnKind::Array(_) => None,
        };

        let base = self.function.next_label;
        self.function.next_label += callee.next_label;
        let label = self.function.fresh_label();

        let mut statements = callee.body.clone();
        for stmt in &mut statements {
            stmt.map_locals(&mut |id| map.get(&id).copied().unwrap_or(id));
            stmt.map_labels(&mut |Label(n)| Label(base + n));
        }
        let statements = rewrite_returns(statements, result.map(|(id, _)| id), label);
        hoisted.push(TStmt::Block {
            label,
            body: statements,
        });

        self.function.purity = self.function.purity.max(callee.purity);
        for global in &callee.globals_read {
            if !self.function.globals_read.contains(global) {
                self.function.globals_read.push(global.clone());
            }
        }
        self.report.applied(format!("inlined {}", callee.name));

        match result {
            Some((id, ty)) => TExpr::local(id, ty),
            None => TExpr::int(0),
        }
    }
}

fn rewrite_returns(statements: Vec<TStmt>, result: Option<LocalId>, label: Label) -> Vec<TStmt> {
    let mut out = Vec::with_capacity(statements.len());
    for mut stmt in statements {
        match stmt {
            TStmt::Return(value) => {
                if let (Some(TReturn::Scalar(e)), Some(result)) = (value, result) {
                    out.push(TStmt::Assign(result, e));
                }
                out.push(TStmt::ExitBlock(label));
            }
            _ => {
                for block in stmt.blocks_mut() {
                    let inner = std::mem::take(block);
                    *block = rewrite_returns(inner, result, label);
                }
                out.push(stmt);
            }
        }
    }
    out
}

fn reads_array_elements(expr: &TExpr) -> bool {
    let mut found = false;
    expr.walk(&mut |e| {
        if matches!(e.kind, TExprKind::Index(..)) {
            found = true;
        }
    });
    found
}

#[cfg(test)]
mod tests {
    use crate::analysis::typed::TStmt;
    use crate::config::AdrenalineConfig;
    use crate::opt::pass;
    use crate::opt::tests::{optimized, optimized_with};
    use crate::testutil::int;

    const CALLER: &str = "\
def square(x):
    return x * x

def sum_squares(n):
    total = 0
    for i in range(n):
        total += square(i)
    return total
";

    fn has_calls(body: &[TStmt]) -> bool {
        let mut calls = false;
        for stmt in body {
            stmt.walk_exprs(&mut |e| {
                if matches!(e.kind, crate::analysis::typed::TExprKind::Call(..)) {
                    calls = true;
                }
            });
        }
        calls
    }

    #[test]
    fn small_callee_is_inlined() {
        let (body, report) = optimized(CALLER, "sum_squares", &[int()]);
        assert_eq!(report.applied(pass::INLINE), 1);
        assert!(!has_calls(&body.root().body));
        assert_eq!(body.reachable().len(), 1);
    }

    #[test]
    fn threshold_limits_inlining() {
        let config = AdrenalineConfig {
            inline_node_threshold: 1,
            ..AdrenalineConfig::default()
        };
        let (body, report) = optimized_with(CALLER, "sum_squares", &[int()], &config);
        assert_eq!(report.applied(pass::INLINE), 0);
        assert!(has_calls(&body.root().body));
    }

    #[test]
    fn recursion_stays_a_call() {
        let source = "\
def fact(n):
    if n <= 1:
        return 1
    return n * fact(n - 1)

def twice(n):
    return fact(n) + fact(n)
";
        let (body, report) = optimized(source, "twice", &[int()]);
        assert_eq!(report.applied(pass::INLINE), 0);
        assert!(report
            .skipped(pass::INLINE)
            .iter()
            .any(|s| s.contains("recursive callee")));
        assert!(has_calls(&body.root().body));
    }
}
