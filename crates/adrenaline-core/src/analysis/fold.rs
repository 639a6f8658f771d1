//! Constant folding over typed bodies
//!
//! Only operations that cannot fail are folded: an expression whose evaluation would raise
//! in the host (overflow, division by zero, a domain error) stays in place so the compiled
//! code still reaches the deoptimization path at run time.

use crate::numeric;

use super::typed::{
    ArithOp, BuiltinOp, CastOp, CmpKind, Const, LogicOp, TExpr, TExprKind, TStmt, TypedFunction,
    UnOp,
};

/// Fold every expression in `function`; returns the number of nodes folded
pub fn fold_function(function: &mut TypedFunction) -> usize {
    fold_block(&mut function.body)
}

/// Fold a statement list in place
pub fn fold_block(body: &mut Vec<TStmt>) -> usize {
    let mut folded = 0;
    let mut out = Vec::with_capacity(body.len());
    for mut stmt in body.drain(..) {
        for expr in stmt.exprs_mut() {
            folded += fold_expr(expr);
        }
        for block in stmt.blocks_mut() {
            folded += fold_block(block);
        }
        match stmt {
            TStmt::If {
                cond,
                then,
                otherwise,
            } => match cond.as_const() {
                // The chosen branch is spliced in; definite assignment was already checked
                Some(Const::Bool(true)) => {
                    folded += 1;
                    out.extend(then);
                }
                Some(Const::Bool(false)) => {
                    folded += 1;
                    out.extend(otherwise);
                }
                _ => out.push(TStmt::If {
                    cond,
                    then,
                    otherwise,
                }),
            },
            TStmt::While { cond, .. } if cond.as_const() == Some(Const::Bool(false)) => {
                folded += 1;
            }
            other => out.push(other),
        }
    }
    *body = out;
    folded
}

/// Fold `expr` bottom-up; returns the number of nodes folded
pub fn fold_expr(expr: &mut TExpr) -> usize {
    let mut folded = 0;
    for child in expr.children_mut() {
        folded += fold_expr(child);
    }
    if let Some(value) = evaluate(expr) {
        *expr = TExpr::constant(value);
        folded += 1;
    } else if let Some(simplified) = simplify(expr) {
        *expr = simplified;
        folded += 1;
    }
    folded
}

/// Value of a node whose operands are all constants, when computing it cannot fail
fn evaluate(expr: &TExpr) -> Option<Const> {
    match &expr.kind {
        TExprKind::Unary(op, e) => unary(*op, e.as_const()?),
        TExprKind::Binary(op, a, b) => binary(*op, a.as_const()?, b.as_const()?),
        TExprKind::Compare(kind, a, b) => compare(*kind, a.as_const()?, b.as_const()?),
        TExprKind::Cast(op, e) => cast(*op, e.as_const()?),
        TExprKind::Builtin(op, args) => {
            let values: Option<Vec<Const>> = args.iter().map(TExpr::as_const).collect();
            builtin(*op, &values?)
        }
        _ => None,
    }
}

/// Short-circuit and selection nodes with a constant condition
fn simplify(expr: &TExpr) -> Option<TExpr> {
    match &expr.kind {
        TExprKind::Logic(op, a, b) => {
            let truthy = truthiness(a.as_const()?);
            let keep_left = match op {
                LogicOp::And => !truthy,
                LogicOp::Or => truthy,
            };
            Some(if keep_left { (**a).clone() } else { (**b).clone() })
        }
        TExprKind::Select {
            cond,
            then,
            otherwise,
        } => match cond.as_const()? {
            Const::Bool(true) => Some((**then).clone()),
            Const::Bool(false) => Some((**otherwise).clone()),
            _ => None,
        },
        _ => None,
    }
}

fn truthiness(c: Const) -> bool {
    match c {
        Const::Int(i) => i != 0,
        Const::Float(f) => f != 0.0,
        Const::Bool(b) => b,
    }
}

fn unary(op: UnOp, value: Const) -> Option<Const> {
    match (op, value) {
        (UnOp::Neg, Const::Int(i)) => i.checked_neg().map(Const::Int),
        (UnOp::Neg, Const::Float(f)) => Some(Const::Float(-f)),
        (UnOp::Invert, Const::Int(i)) => Some(Const::Int(!i)),
        (UnOp::Not, Const::Bool(b)) => Some(Const::Bool(!b)),
        _ => None,
    }
}

fn binary(op: ArithOp, a: Const, b: Const) -> Option<Const> {
    match (a, b) {
        (Const::Int(x), Const::Int(y)) => {
            let value = match op {
                ArithOp::Add => x.checked_add(y)?,
                ArithOp::Sub => x.checked_sub(y)?,
                ArithOp::Mul => x.checked_mul(y)?,
                ArithOp::FloorDiv => numeric::int_floordiv(x, y).ok()?,
                ArithOp::Mod => numeric::int_mod(x, y).ok()?,
                ArithOp::Pow => numeric::int_pow(x, y).ok()?,
                ArithOp::BitAnd => x & y,
                ArithOp::BitOr => x | y,
                ArithOp::BitXor => x ^ y,
                ArithOp::Shl => numeric::int_shl(x, y).ok()?,
                ArithOp::Shr => numeric::int_shr(x, y).ok()?,
                ArithOp::Div => return None,
            };
            Some(Const::Int(value))
        }
        (Const::Float(x), Const::Float(y)) => {
            let value = match op {
                ArithOp::Add => x + y,
                ArithOp::Sub => x - y,
                ArithOp::Mul => x * y,
                ArithOp::Div => numeric::float_truediv(x, y).ok()?,
                ArithOp::FloorDiv => numeric::float_floordiv(x, y).ok()?,
                ArithOp::Mod => numeric::float_mod(x, y).ok()?,
                ArithOp::Pow => numeric::float_pow(x, y).ok()?,
                _ => return None,
            };
            Some(Const::Float(value))
        }
        _ => None,
    }
}

fn compare(kind: CmpKind, a: Const, b: Const) -> Option<Const> {
    let ordering = match (a, b) {
        (Const::Int(x), Const::Int(y)) => Some(x.cmp(&y)),
        (Const::Float(x), Const::Float(y)) => x.partial_cmp(&y),
        (Const::Bool(x), Const::Bool(y)) => Some(x.cmp(&y)),
        _ => return None,
    };
    let result = match ordering {
        // NaN compares unequal to everything
        None => kind == CmpKind::Ne,
        Some(ord) => match kind {
            CmpKind::Eq => ord.is_eq(),
            CmpKind::Ne => ord.is_ne(),
            CmpKind::Lt => ord.is_lt(),
            CmpKind::Le => ord.is_le(),
            CmpKind::Gt => ord.is_gt(),
            CmpKind::Ge => ord.is_ge(),
        },
    };
    Some(Const::Bool(result))
}

fn cast(op: CastOp, value: Const) -> Option<Const> {
    match (op, value) {
        (CastOp::IntToFloat, Const::Int(i)) => Some(Const::Float(i as f64)),
        (CastOp::IntToFloatExact, Const::Int(i))
            if (-numeric::EXACT_FLOAT_INT..=numeric::EXACT_FLOAT_INT).contains(&i) =>
        {
            Some(Const::Float(i as f64))
        }
        (CastOp::FloatToInt, Const::Float(f)) => numeric::float_to_int(f).ok().map(Const::Int),
        (CastOp::BoolToInt, Const::Bool(b)) => Some(Const::Int(i64::from(b))),
        (CastOp::BoolToFloat, Const::Bool(b)) => Some(Const::Float(if b { 1.0 } else { 0.0 })),
        (CastOp::ToBool, c) => Some(Const::Bool(truthiness(c))),
        _ => None,
    }
}

fn builtin(op: BuiltinOp, args: &[Const]) -> Option<Const> {
    match (op, args) {
        (BuiltinOp::Abs, [Const::Int(i)]) => i.checked_abs().map(Const::Int),
        (BuiltinOp::Abs, [Const::Float(f)]) => Some(Const::Float(f.abs())),
        (BuiltinOp::Min, [Const::Int(a), Const::Int(b)]) => Some(Const::Int(if b < a { *b } else { *a })),
        (BuiltinOp::Max, [Const::Int(a), Const::Int(b)]) => Some(Const::Int(if b > a { *b } else { *a })),
        (BuiltinOp::Min, [Const::Float(a), Const::Float(b)]) => Some(Const::Float(numeric::float_min(*a, *b))),
        (BuiltinOp::Max, [Const::Float(a), Const::Float(b)]) => Some(Const::Float(numeric::float_max(*a, *b))),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::typed::{LocalId, NumType};

    fn int(i: i64) -> TExpr {
        TExpr::int(i)
    }

    #[test]
    fn folds_safe_arithmetic() {
        let mut e = TExpr::binary(
            ArithOp::Mul,
            TExpr::binary(ArithOp::Add, int(2), int(3)),
            int(4),
        );
        assert_eq!(fold_expr(&mut e), 2);
        assert_eq!(e.as_const(), Some(Const::Int(20)));
    }

    #[test]
    fn never_folds_failing_operations() {
        let mut div = TExpr::binary(ArithOp::FloorDiv, int(1), int(0));
        assert_eq!(fold_expr(&mut div), 0);
        assert!(div.as_const().is_none());

        let mut overflow = TExpr::binary(ArithOp::Add, int(i64::MAX), int(1));
        assert_eq!(fold_expr(&mut overflow), 0);

        let mut exact = TExpr::cast(CastOp::IntToFloatExact, int(i64::MAX));
        assert_eq!(fold_expr(&mut exact), 0);
    }

    #[test]
    fn python_rounding_rules() {
        let mut e = TExpr::binary(ArithOp::Mod, int(-7), int(2));
        fold_expr(&mut e);
        assert_eq!(e.as_const(), Some(Const::Int(1)));
        let mut e = TExpr::binary(ArithOp::FloorDiv, int(-7), int(2));
        fold_expr(&mut e);
        assert_eq!(e.as_const(), Some(Const::Int(-4)));
    }

    #[test]
    fn constant_branches_are_spliced() {
        let x = LocalId(0);
        let mut body = vec![TStmt::If {
            cond: TExpr::compare(CmpKind::Lt, int(1), int(2)),
            then: vec![TStmt::Assign(x, int(1))],
            otherwise: vec![TStmt::Assign(x, int(2))],
        }];
        fold_block(&mut body);
        assert_eq!(body, vec![TStmt::Assign(x, int(1))]);
    }

    #[test]
    fn short_circuit_keeps_python_value() {
        let x = TExpr::local(LocalId(0), NumType::Int);
        let mut e = TExpr {
            kind: TExprKind::Logic(LogicOp::Or, Box::new(int(0)), Box::new(x.clone())),
            ty: NumType::Int,
        };
        fold_expr(&mut e);
        assert_eq!(e, x);
    }
}
