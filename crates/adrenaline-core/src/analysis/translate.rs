//! Translation of one function body from the AST into the typed representation
//!
//! Types are inferred bottom-up and fixed per local at its first assignment. Anything the
//! translator cannot type exactly is refused; nothing is guessed.

use crate::ast::{BinOp, BoolOp, CmpOp, Expr, ExprKind, FunctionDef, Stmt, StmtKind, UnaryOp};
use crate::ast::walk::assigned_names;
use crate::directive::DirectiveSet;
use crate::error::AdrenalineError;
use crate::host::Value;
use crate::lexer::Span;

use super::scope::Scope;
use super::typed::{
    ArithOp, BuiltinOp, CastOp, CmpKind, Const, ForLoop, LogicOp, LoopBound, NumType, Purity,
    ReturnKind, TArg, TExpr, TExprKind, TReturn, TStmt, TypedFunction, UnOp, ValueKind,
};
use super::Specializer;

type Result<T> = std::result::Result<T, AdrenalineError>;

const INT: ValueKind = ValueKind::Scalar(NumType::Int);

pub(crate) fn translate(
    specializer: &mut Specializer<'_>,
    def: &FunctionDef,
    arg_kinds: &[ValueKind],
    directives: DirectiveSet,
) -> Result<TypedFunction> {
    let mut names = assigned_names(&def.body);
    names.extend(def.param_names().map(String::from));

    let mut translator = Translator {
        specializer,
        function: def.name.name.clone(),
        scope: Scope::new(names),
        returns: None,
        purity: Purity::Pure,
        globals_read: Vec::new(),
    };

    let mut params = Vec::with_capacity(arg_kinds.len());
    for (position, (param, kind)) in def.params.iter().zip(arg_kinds).enumerate() {
        params.push(
            translator
                .scope
                .declare_param(&param.name.name, *kind, position),
        );
    }

    let body = translator.block(&def.body)?;
    if !translator.scope.definite.is_dead() {
        translator.record_return(ReturnKind::None, def.span)?;
    }

    let ret = translator.returns.map_or(ReturnKind::None, |(kind, _)| kind);
    Ok(TypedFunction {
        name: translator.function,
        arg_kinds: arg_kinds.to_vec(),
        params,
        locals: translator.scope.locals,
        body,
        ret,
        purity: translator.purity,
        directives,
        globals_read: translator.globals_read,
        next_label: 0,
    })
}

struct Translator<'s, 'a> {
    specializer: &'s mut Specializer<'a>,
    function: String,
    scope: Scope,
    returns: Option<(ReturnKind, Span)>,
    purity: Purity,
    globals_read: Vec<String>,
}

impl Translator<'_, '_> {
    fn unsupported(&self, construct: impl Into<String>, reason: impl Into<String>, span: Span) -> AdrenalineError {
        AdrenalineError::unsupported(&self.function, construct, reason, span)
    }

    fn inconsistent(&self, reason: impl Into<String>, span: Span) -> AdrenalineError {
        AdrenalineError::inconsistent(&self.function, reason, span)
    }

    fn block(&mut self, body: &[Stmt]) -> Result<Vec<TStmt>> {
        let mut out = Vec::with_capacity(body.len());
        for stmt in body {
            // Statements after return/break/continue never run
            if self.scope.definite.is_dead() {
                break;
            }
            self.stmt(stmt, &mut out)?;
        }
        Ok(out)
    }

    fn stmt(&mut self, stmt: &Stmt, out: &mut Vec<TStmt>) -> Result<()> {
        match &stmt.kind {
            StmtKind::Pass => {}
            StmtKind::Expr(expr) => {
                let e = self.expr_or_void_call(expr)?;
                out.push(TStmt::Expr(e));
            }
            StmtKind::Assign { targets, value } => self.assign(targets, value, stmt.span, out)?,
            StmtKind::AugAssign { target, op, value } => {
                self.aug_assign(target, *op, value, stmt.span, out)?;
            }
            StmtKind::Return(value) => {
                let ret = self.return_value(value.as_ref(), stmt.span)?;
                out.push(TStmt::Return(ret));
                self.scope.definite.kill();
            }
            StmtKind::If { cond, body, orelse } => {
                let cond = self.condition(cond)?;
                let entry = self.scope.definite.clone();
                let then = self.block(body)?;
                let after_then = std::mem::replace(&mut self.scope.definite, entry);
                let otherwise = self.block(orelse)?;
                let after_else = self.scope.definite.clone();
                self.scope.definite = after_then.join(after_else);
                out.push(TStmt::If {
                    cond,
                    then,
                    otherwise,
                });
            }
            StmtKind::While { cond, body } => {
                let cond = self.condition(cond)?;
                let entry = self.scope.definite.clone();
                let body_t = self.block(body)?;
                self.scope.definite = entry;
                let infinite = matches!(cond.as_const(), Some(Const::Bool(true)));
                if infinite && !has_break(body) {
                    self.scope.definite.kill();
                }
                out.push(TStmt::While {
                    cond,
                    body: body_t,
                    span: stmt.span,
                });
            }
            StmtKind::For { target, iter, body } => self.for_loop(target, iter, body, stmt.span, out)?,
            StmtKind::Break => {
                out.push(TStmt::Break);
                self.scope.definite.kill();
            }
            StmtKind::Continue => {
                out.push(TStmt::Continue);
                self.scope.definite.kill();
            }
            StmtKind::Import(_)
            | StmtKind::FromImport { .. }
            | StmtKind::Global(_)
            | StmtKind::Nonlocal(_)
            | StmtKind::Try { .. }
            | StmtKind::Raise(_)
            | StmtKind::FunctionDef(_) => {
                return Err(self.unsupported(stmt.describe(), "not compilable", stmt.span));
            }
        }
        Ok(())
    }

    fn record_return(&mut self, kind: ReturnKind, span: Span) -> Result<()> {
        match self.returns {
            None => {
                self.returns = Some((kind, span));
                Ok(())
            }
            Some((existing, _)) if existing == kind => Ok(()),
            Some((existing, _)) => Err(self.inconsistent(
                format!("inconsistent return type: {existing} and {kind}"),
                span,
            )),
        }
    }

    fn return_value(&mut self, value: Option<&Expr>, span: Span) -> Result<Option<TReturn>> {
        let Some(value) = value else {
            self.record_return(ReturnKind::None, span)?;
            return Ok(None);
        };
        if matches!(value.kind, ExprKind::None) {
            self.record_return(ReturnKind::None, span)?;
            return Ok(None);
        }
        if let Some(array) = self.array_operand(value)? {
            let elem = self.scope.decl(array).kind.num_type();
            self.record_return(ReturnKind::Array(elem), span)?;
            return Ok(Some(TReturn::Array(array)));
        }
        let e = self.expr(value)?;
        self.record_return(ReturnKind::Scalar(e.ty), span)?;
        Ok(Some(TReturn::Scalar(e)))
    }

    fn assign(&mut self, targets: &[Expr], value: &Expr, span: Span, out: &mut Vec<TStmt>) -> Result<()> {
        if let Some(first) = targets.first() {
            if let ExprKind::Tuple(items) | ExprKind::List(items) = &first.kind {
                if targets.len() != 1 {
                    return Err(self.unsupported("chained tuple assignment", "not compilable", span));
                }
                return self.unpack(items, value, span, out);
            }
        }
        if self.array_operand(value)?.is_some() {
            return Err(self.unsupported(
                "array rebinding",
                "arrays may only be indexed, measured, passed or returned",
                value.span,
            ));
        }
        let value = self.expr(value)?;
        if targets.len() == 1 {
            return self.store_target(&targets[0], value, out);
        }
        // `a = b = v` evaluates `v` once
        let temp = self.scope.temp("chain", ValueKind::Scalar(value.ty));
        let ty = value.ty;
        out.push(TStmt::Assign(temp, value));
        self.scope.definite.assign(temp);
        for target in targets {
            self.store_target(target, TExpr::local(temp, ty), out)?;
        }
        Ok(())
    }

    /// `a, b = x, y`: every value is evaluated before any target is assigned
    fn unpack(&mut self, targets: &[Expr], value: &Expr, span: Span, out: &mut Vec<TStmt>) -> Result<()> {
        let ExprKind::Tuple(values) = &value.kind else {
            return Err(self.unsupported(
                "tuple unpacking",
                "only unpacking of a tuple display of scalars is compiled",
                value.span,
            ));
        };
        if values.len() != targets.len() {
            return Err(self.unsupported(
                "tuple unpacking",
                format!("{} targets for {} values", targets.len(), values.len()),
                span,
            ));
        }
        let mut temps = Vec::with_capacity(values.len());
        for value in values {
            let e = self.expr(value)?;
            let ty = e.ty;
            let temp = self.scope.temp("unpack", ValueKind::Scalar(ty));
            out.push(TStmt::Assign(temp, e));
            self.scope.definite.assign(temp);
            temps.push((temp, ty));
        }
        for (target, (temp, ty)) in targets.iter().zip(temps) {
            self.store_target(target, TExpr::local(temp, ty), out)?;
        }
        Ok(())
    }

    fn store_target(&mut self, target: &Expr, value: TExpr, out: &mut Vec<TStmt>) -> Result<()> {
        match &target.kind {
            ExprKind::Name(name) => {
                let id = self
                    .scope
                    .bind(&self.function, name, ValueKind::Scalar(value.ty), target.span)?;
                out.push(TStmt::Assign(id, value));
                self.scope.definite.assign(id);
                Ok(())
            }
            ExprKind::Subscript { value: base, index } => {
                let array = self.require_array(base)?;
                let index = self.index_expr(index)?;
                self.store_element(array, index, value, target.span, out)
            }
            _ => Err(self.unsupported(
                format!("assignment to {}", target.describe()),
                "not compilable",
                target.span,
            )),
        }
    }

    fn store_element(
        &mut self,
        array: super::typed::LocalId,
        index: TExpr,
        value: TExpr,
        span: Span,
        out: &mut Vec<TStmt>,
    ) -> Result<()> {
        let elem = self.scope.decl(array).kind.num_type();
        if value.ty != elem {
            return Err(self.inconsistent(
                format!(
                    "storing {} into '{}' of {}",
                    value.ty,
                    self.scope.decl(array).name,
                    self.scope.decl(array).kind
                ),
                span,
            ));
        }
        self.purity = self.purity.max(Purity::MutatesContainer);
        out.push(TStmt::Store {
            array,
            index,
            value,
        });
        Ok(())
    }

    fn aug_assign(&mut self, target: &Expr, op: BinOp, value: &Expr, span: Span, out: &mut Vec<TStmt>) -> Result<()> {
        match &target.kind {
            ExprKind::Name(_) => {
                let current = self.expr(target)?;
                let rhs = self.expr(value)?;
                let combined = self.arith(op, current, rhs, span)?;
                self.store_target(target, combined, out)
            }
            ExprKind::Subscript { value: base, index } => {
                let array = self.require_array(base)?;
                let index = self.index_expr(index)?;
                // The index is evaluated once
                let slot = self.scope.temp("idx", INT);
                out.push(TStmt::Assign(slot, index));
                self.scope.definite.assign(slot);
                let elem = self.scope.decl(array).kind.num_type();
                let current = TExpr {
                    kind: TExprKind::Index(array, Box::new(TExpr::local(slot, NumType::Int))),
                    ty: elem,
                };
                let rhs = self.expr(value)?;
                let combined = self.arith(op, current, rhs, span)?;
                self.store_element(array, TExpr::local(slot, NumType::Int), combined, span, out)
            }
            _ => Err(self.unsupported(
                format!("augmented assignment to {}", target.describe()),
                "not compilable",
                target.span,
            )),
        }
    }

    fn for_loop(&mut self, target: &Expr, iter: &Expr, body: &[Stmt], span: Span, out: &mut Vec<TStmt>) -> Result<()> {
        let ExprKind::Name(var_name) = &target.kind else {
            return Err(self.unsupported(
                format!("loop target {}", target.describe()),
                "only a plain name can be a loop target",
                target.span,
            ));
        };

        if let Some(array) = self.array_operand(iter)? {
            // `for x in a` walks the indices of the fixed-size array
            let elem = self.scope.decl(array).kind.num_type();
            let index = self.scope.temp("iter", INT);
            let var = self
                .scope
                .bind(&self.function, var_name, ValueKind::Scalar(elem), target.span)?;
            let entry = self.scope.definite.clone();
            self.scope.definite.assign(index);
            self.scope.definite.assign(var);
            let mut body_t = vec![TStmt::Assign(
                var,
                TExpr {
                    kind: TExprKind::Index(array, Box::new(TExpr::local(index, NumType::Int))),
                    ty: elem,
                },
            )];
            body_t.extend(self.block(body)?);
            self.scope.definite = entry;
            out.push(TStmt::For(ForLoop {
                var: index,
                start: TExpr::int(0),
                stop: TExpr {
                    kind: TExprKind::Len(array),
                    ty: NumType::Int,
                },
                step: TExpr::int(1),
                bound: LoopBound::Range,
                body: body_t,
                exit_value: false,
                span,
            }));
            return Ok(());
        }

        let ExprKind::Call { func, args, keywords } = &iter.kind else {
            return Err(self.unsupported(
                format!("iteration over {}", iter.describe()),
                "only range() and array arguments can be iterated",
                iter.span,
            ));
        };
        if func.as_name() != Some("range") || self.scope.is_local_name("range") || !keywords.is_empty() {
            return Err(self.unsupported(
                "iteration over a call result",
                "only range() and array arguments can be iterated",
                iter.span,
            ));
        }
        let mut bounds = Vec::with_capacity(args.len());
        for arg in args {
            let e = self.expr(arg)?;
            if e.ty != NumType::Int {
                return Err(self.unsupported(
                    format!("range() over {}", e.ty),
                    "range() bounds must be integers",
                    arg.span,
                ));
            }
            bounds.push(e);
        }
        let (start, stop, step) = match bounds.len() {
            1 => (TExpr::int(0), bounds.remove(0), TExpr::int(1)),
            2 => {
                let stop = bounds.remove(1);
                (bounds.remove(0), stop, TExpr::int(1))
            }
            3 => {
                let step = bounds.remove(2);
                let stop = bounds.remove(1);
                (bounds.remove(0), stop, step)
            }
            n => {
                return Err(self.unsupported(
                    format!("range() with {n} arguments"),
                    "range() takes 1 to 3 arguments",
                    iter.span,
                ))
            }
        };

        let var = self.scope.bind(&self.function, var_name, INT, target.span)?;
        let entry = self.scope.definite.clone();
        self.scope.definite.assign(var);
        let body_t = self.block(body)?;
        self.scope.definite = entry;
        out.push(TStmt::For(ForLoop {
            var,
            start,
            stop,
            step,
            bound: LoopBound::Range,
            body: body_t,
            exit_value: false,
            span,
        }));
        Ok(())
    }

    fn condition(&mut self, expr: &Expr) -> Result<TExpr> {
        let e = self.expr(expr)?;
        Ok(to_bool(e))
    }

    /// An expression statement; calls to functions returning `None` are allowed here
    fn expr_or_void_call(&mut self, expr: &Expr) -> Result<TExpr> {
        if let ExprKind::Call { func, args, keywords } = &expr.kind {
            if let Some(name) = func.as_name() {
                if self.is_module_function(name) {
                    return self.user_call(name, args, keywords, expr.span, true);
                }
            }
        }
        self.expr(expr)
    }

    /// The array local `expr` names, if it names one
    fn array_operand(&self, expr: &Expr) -> Result<Option<super::typed::LocalId>> {
        let ExprKind::Name(name) = &expr.kind else {
            return Ok(None);
        };
        let Some(id) = self.scope.lookup(name) else {
            return Ok(None);
        };
        if !self.scope.decl(id).kind.is_array() {
            return Ok(None);
        }
        Ok(Some(id))
    }

    fn require_array(&self, expr: &Expr) -> Result<super::typed::LocalId> {
        self.array_operand(expr)?.ok_or_else(|| {
            self.unsupported(
                format!("subscript of {}", expr.describe()),
                "only array arguments can be indexed",
                expr.span,
            )
        })
    }

    fn index_expr(&mut self, index: &Expr) -> Result<TExpr> {
        let e = self.expr(index)?;
        if e.ty != NumType::Int {
            return Err(self.unsupported(
                format!("{} index", e.ty),
                "array indices must be integers",
                index.span,
            ));
        }
        Ok(e)
    }

    fn is_module_function(&self, name: &str) -> bool {
        !self.scope.is_local_name(name) && self.specializer.source.function(name).is_some()
    }

    fn expr(&mut self, expr: &Expr) -> Result<TExpr> {
        match &expr.kind {
            ExprKind::Int(i) => Ok(TExpr::int(*i)),
            ExprKind::Float(f) => Ok(TExpr::constant(Const::Float(*f))),
            ExprKind::Bool(b) => Ok(TExpr::constant(Const::Bool(*b))),
            ExprKind::Name(name) => self.name(name, expr.span),
            ExprKind::Binary { op, left, right } => {
                let l = self.expr(left)?;
                let r = self.expr(right)?;
                self.arith(*op, l, r, expr.span)
            }
            ExprKind::Unary { op, operand } => {
                let e = self.expr(operand)?;
                self.unary(*op, e, expr.span)
            }
            ExprKind::BoolOp { op, left, right } => {
                let l = self.expr(left)?;
                let r = self.expr(right)?;
                if l.ty != r.ty {
                    return Err(self.inconsistent(
                        format!("operands of '{}' are {} and {}", bool_op_name(*op), l.ty, r.ty),
                        expr.span,
                    ));
                }
                let op = match op {
                    BoolOp::And => LogicOp::And,
                    BoolOp::Or => LogicOp::Or,
                };
                Ok(TExpr {
                    ty: l.ty,
                    kind: TExprKind::Logic(op, Box::new(l), Box::new(r)),
                })
            }
            ExprKind::Compare { left, rest } => self.compare_chain(left, rest, expr.span),
            ExprKind::Call { func, args, keywords } => self.call(func, args, keywords, expr.span),
            ExprKind::Subscript { value, index } => {
                let array = self.require_array(value)?;
                let index = self.index_expr(index)?;
                Ok(TExpr {
                    ty: self.scope.decl(array).kind.num_type(),
                    kind: TExprKind::Index(array, Box::new(index)),
                })
            }
            ExprKind::IfExp {
                cond,
                then,
                otherwise,
            } => {
                let cond = self.condition(cond)?;
                let then = self.expr(then)?;
                let otherwise = self.expr(otherwise)?;
                if then.ty != otherwise.ty {
                    return Err(self.inconsistent(
                        format!(
                            "conditional expression yields {} or {}",
                            then.ty, otherwise.ty
                        ),
                        expr.span,
                    ));
                }
                Ok(TExpr {
                    ty: then.ty,
                    kind: TExprKind::Select {
                        cond: Box::new(cond),
                        then: Box::new(then),
                        otherwise: Box::new(otherwise),
                    },
                })
            }
            ExprKind::None
            | ExprKind::Str(_)
            | ExprKind::Attribute { .. }
            | ExprKind::List(_)
            | ExprKind::Tuple(_)
            | ExprKind::Dict(_)
            | ExprKind::Lambda { .. } => Err(self.unsupported(
                expr.describe(),
                "not a numeric scalar",
                expr.span,
            )),
        }
    }

    fn name(&mut self, name: &str, span: Span) -> Result<TExpr> {
        if self.scope.is_local_name(name) {
            let Some(id) = self.scope.lookup(name) else {
                return Err(self.unsupported(
                    format!("read of '{name}'"),
                    "local variable may be referenced before assignment",
                    span,
                ));
            };
            if !self.scope.definite.is_assigned(id) {
                return Err(self.unsupported(
                    format!("read of '{name}'"),
                    "local variable may be referenced before assignment",
                    span,
                ));
            }
            return match self.scope.decl(id).kind {
                ValueKind::Scalar(ty) => Ok(TExpr::local(id, ty)),
                ValueKind::Array(_) => Err(self.unsupported(
                    format!("array '{name}' used as a value"),
                    "arrays may only be indexed, measured, passed or returned",
                    span,
                )),
            };
        }
        let constant = self.specializer.source.constant(name).and_then(|v| match v {
            Value::Int(i) => Some(Const::Int(i)),
            Value::Float(f) => Some(Const::Float(f)),
            Value::Bool(b) => Some(Const::Bool(b)),
            _ => None,
        });
        match constant {
            Some(c) => {
                self.purity = self.purity.max(Purity::ReadsGlobal);
                if !self.globals_read.iter().any(|g| g == name) {
                    self.globals_read.push(name.to_string());
                }
                self.specializer.globals.insert(name.to_string());
                Ok(TExpr::constant(c))
            }
            None => Err(self.unsupported(
                format!("global '{name}'"),
                "only module-level numeric constants can be read",
                span,
            )),
        }
    }

    fn arith(&self, op: BinOp, l: TExpr, r: TExpr, span: Span) -> Result<TExpr> {
        if l.ty == NumType::Bool || r.ty == NumType::Bool {
            return Err(self.unsupported(
                format!("'{}' on bool", op.as_str()),
                "arithmetic on booleans is not compiled",
                span,
            ));
        }
        let both_int = l.ty == NumType::Int && r.ty == NumType::Int;
        let op_t = match op {
            BinOp::Add => ArithOp::Add,
            BinOp::Sub => ArithOp::Sub,
            BinOp::Mul => ArithOp::Mul,
            BinOp::Div => ArithOp::Div,
            BinOp::FloorDiv => ArithOp::FloorDiv,
            BinOp::Mod => ArithOp::Mod,
            BinOp::Pow => ArithOp::Pow,
            BinOp::BitAnd => ArithOp::BitAnd,
            BinOp::BitOr => ArithOp::BitOr,
            BinOp::BitXor => ArithOp::BitXor,
            BinOp::Shl => ArithOp::Shl,
            BinOp::Shr => ArithOp::Shr,
            BinOp::MatMul => {
                return Err(self.unsupported("'@'", "matrix multiplication operator", span));
            }
        };
        match op_t {
            ArithOp::BitAnd | ArithOp::BitOr | ArithOp::BitXor | ArithOp::Shl | ArithOp::Shr => {
                if !both_int {
                    return Err(self.unsupported(
                        format!("'{}' on float", op.as_str()),
                        "bitwise operators need integers",
                        span,
                    ));
                }
                Ok(TExpr::binary(op_t, l, r))
            }
            ArithOp::Div if both_int => Ok(TExpr::binary(
                ArithOp::Div,
                TExpr::cast(CastOp::IntToFloatExact, l),
                TExpr::cast(CastOp::IntToFloatExact, r),
            )),
            ArithOp::Pow if both_int => match r.as_const() {
                Some(Const::Int(e)) if e >= 0 => Ok(TExpr::binary(ArithOp::Pow, l, r)),
                Some(Const::Int(_)) => Ok(TExpr::binary(
                    ArithOp::Pow,
                    TExpr::cast(CastOp::IntToFloat, l),
                    TExpr::cast(CastOp::IntToFloat, r),
                )),
                _ => Err(self.unsupported(
                    "integer '**' with a variable exponent",
                    "the result type depends on the exponent's sign",
                    span,
                )),
            },
            _ if both_int => Ok(TExpr::binary(op_t, l, r)),
            _ => Ok(TExpr::binary(op_t, promote(l), promote(r))),
        }
    }

    fn unary(&self, op: UnaryOp, e: TExpr, span: Span) -> Result<TExpr> {
        match op {
            UnaryOp::Not => Ok(TExpr {
                ty: NumType::Bool,
                kind: TExprKind::Unary(UnOp::Not, Box::new(to_bool(e))),
            }),
            _ if e.ty == NumType::Bool => Err(self.unsupported(
                "arithmetic on bool",
                "arithmetic on booleans is not compiled",
                span,
            )),
            UnaryOp::Pos => Ok(e),
            UnaryOp::Neg => Ok(TExpr {
                ty: e.ty,
                kind: TExprKind::Unary(UnOp::Neg, Box::new(e)),
            }),
            UnaryOp::Invert if e.ty == NumType::Int => Ok(TExpr {
                ty: NumType::Int,
                kind: TExprKind::Unary(UnOp::Invert, Box::new(e)),
            }),
            UnaryOp::Invert => Err(self.unsupported("'~' on float", "bitwise operators need integers", span)),
        }
    }

    fn compare_chain(&mut self, left: &Expr, rest: &[(CmpOp, Expr)], span: Span) -> Result<TExpr> {
        let mut lhs = self.expr(left)?;
        let mut result: Option<TExpr> = None;
        for (position, (op, right)) in rest.iter().enumerate() {
            let rhs = self.expr(right)?;
            let last = position + 1 == rest.len();
            if !last && rhs.contains_call() {
                return Err(self.unsupported(
                    "chained comparison through a call",
                    "the middle operand would be evaluated twice",
                    right.span,
                ));
            }
            let cmp = self.compare(*op, lhs, rhs.clone(), span)?;
            result = Some(match result {
                None => cmp,
                Some(prev) => TExpr {
                    ty: NumType::Bool,
                    kind: TExprKind::Logic(LogicOp::And, Box::new(prev), Box::new(cmp)),
                },
            });
            lhs = rhs;
        }
        result.ok_or_else(|| self.unsupported("empty comparison", "not compilable", span))
    }

    fn compare(&self, op: CmpOp, l: TExpr, r: TExpr, span: Span) -> Result<TExpr> {
        let kind = match op {
            CmpOp::Eq => CmpKind::Eq,
            CmpOp::NotEq => CmpKind::Ne,
            CmpOp::Lt => CmpKind::Lt,
            CmpOp::LtEq => CmpKind::Le,
            CmpOp::Gt => CmpKind::Gt,
            CmpOp::GtEq => CmpKind::Ge,
            CmpOp::Is | CmpOp::IsNot | CmpOp::In | CmpOp::NotIn => {
                return Err(self.unsupported(
                    format!("'{}' test", op.as_str()),
                    "identity and membership tests need host objects",
                    span,
                ));
            }
        };
        match (l.ty, r.ty) {
            (a, b) if a == b => Ok(TExpr::compare(kind, l, r)),
            (NumType::Int, NumType::Float) => Ok(TExpr::compare(
                kind,
                TExpr::cast(CastOp::IntToFloatExact, l),
                r,
            )),
            (NumType::Float, NumType::Int) => Ok(TExpr::compare(
                kind,
                l,
                TExpr::cast(CastOp::IntToFloatExact, r),
            )),
            (a, b) => Err(self.unsupported(
                format!("comparison of {a} with {b}"),
                "booleans only compare with booleans",
                span,
            )),
        }
    }

    fn call(&mut self, func: &Expr, args: &[Expr], keywords: &[(crate::ast::Ident, Expr)], span: Span) -> Result<TExpr> {
        let Some(name) = func.as_name() else {
            return Err(self.unsupported(
                format!("call through {}", func.describe()),
                "only module functions and numeric builtins are called",
                span,
            ));
        };
        if self.scope.is_local_name(name) {
            return Err(self.unsupported(
                format!("call of local '{name}'"),
                "locals are never callable in compiled code",
                span,
            ));
        }
        if self.specializer.source.function(name).is_some() {
            return self.user_call(name, args, keywords, span, false);
        }
        if !keywords.is_empty() {
            return Err(self.unsupported(
                format!("keyword arguments to {name}()"),
                "not compilable",
                span,
            ));
        }
        self.builtin_call(name, args, span)
    }

    fn builtin_call(&mut self, name: &str, args: &[Expr], span: Span) -> Result<TExpr> {
        let arity_error = |this: &Self, expected: &str| {
            this.unsupported(
                format!("{name}() with {} arguments", args.len()),
                format!("compiled {name}() takes {expected}"),
                span,
            )
        };
        match name {
            "len" => {
                if args.len() != 1 {
                    return Err(arity_error(self, "one array"));
                }
                let array = self.array_operand(&args[0])?.ok_or_else(|| {
                    self.unsupported(
                        format!("len() of {}", args[0].describe()),
                        "only array lengths are compiled",
                        span,
                    )
                })?;
                Ok(TExpr {
                    kind: TExprKind::Len(array),
                    ty: NumType::Int,
                })
            }
            "abs" => {
                if args.len() != 1 {
                    return Err(arity_error(self, "one argument"));
                }
                let e = self.expr(&args[0])?;
                if e.ty == NumType::Bool {
                    return Err(self.unsupported("abs() of bool", "arithmetic on booleans is not compiled", span));
                }
                Ok(TExpr {
                    ty: e.ty,
                    kind: TExprKind::Builtin(BuiltinOp::Abs, vec![e]),
                })
            }
            "min" | "max" => {
                if args.len() != 2 {
                    return Err(arity_error(self, "two scalars"));
                }
                let a = self.expr(&args[0])?;
                let b = self.expr(&args[1])?;
                if a.ty != b.ty || a.ty == NumType::Bool {
                    return Err(self.inconsistent(
                        format!("{name}() of {} and {}", a.ty, b.ty),
                        span,
                    ));
                }
                let op = if name == "min" { BuiltinOp::Min } else { BuiltinOp::Max };
                Ok(TExpr {
                    ty: a.ty,
                    kind: TExprKind::Builtin(op, vec![a, b]),
                })
            }
            "int" | "float" => {
                if args.len() != 1 {
                    return Err(arity_error(self, "one argument"));
                }
                let e = self.expr(&args[0])?;
                let cast = match (name, e.ty) {
                    ("int", NumType::Int) | ("float", NumType::Float) => return Ok(e),
                    ("int", NumType::Float) => CastOp::FloatToInt,
                    ("int", NumType::Bool) => CastOp::BoolToInt,
                    ("float", NumType::Int) => CastOp::IntToFloat,
                    _ => CastOp::BoolToFloat,
                };
                Ok(TExpr::cast(cast, e))
            }
            "range" => Err(self.unsupported(
                "range() outside a for loop",
                "ranges are only compiled as loop bounds",
                span,
            )),
            _ => Err(self.unsupported(
                format!("call to {name}()"),
                "not a compilable function",
                span,
            )),
        }
    }

    fn user_call(
        &mut self,
        name: &str,
        args: &[Expr],
        keywords: &[(crate::ast::Ident, Expr)],
        span: Span,
        statement: bool,
    ) -> Result<TExpr> {
        if !keywords.is_empty() {
            return Err(self.unsupported(
                format!("keyword arguments to {name}()"),
                "compiled calls pass arguments by position",
                span,
            ));
        }
        let mut targs = Vec::with_capacity(args.len());
        let mut kinds = Vec::with_capacity(args.len());
        for arg in args {
            if let Some(array) = self.array_operand(arg)? {
                kinds.push(self.scope.decl(array).kind);
                targs.push(TArg::Array(array));
            } else {
                let e = self.expr(arg)?;
                kinds.push(ValueKind::Scalar(e.ty));
                targs.push(TArg::Scalar(e));
            }
        }
        let (index, ret) = self
            .specializer
            .specialize(name, kinds, span)
            .map_err(|err| {
                if err.function() == self.function && name == self.function {
                    err
                } else {
                    self.unsupported(
                        format!("call to {name}()"),
                        format!("callee is not eligible: {err}"),
                        span,
                    )
                }
            })?;
        let ty = match ret {
            ReturnKind::Scalar(ty) => ty,
            ReturnKind::None if statement => NumType::Int,
            ReturnKind::None => {
                return Err(self.unsupported(
                    format!("result of {name}()"),
                    "the callee returns None",
                    span,
                ));
            }
            ReturnKind::Array(_) => {
                return Err(self.unsupported(
                    format!("array result of {name}()"),
                    "array results are only returned to the host",
                    span,
                ));
            }
        };
        Ok(TExpr {
            kind: TExprKind::Call(index, targs),
            ty,
        })
    }
}

fn bool_op_name(op: BoolOp) -> &'static str {
    match op {
        BoolOp::And => "and",
        BoolOp::Or => "or",
    }
}

/// Convert an integer operand mixed into float arithmetic
fn promote(e: TExpr) -> TExpr {
    match e.ty {
        NumType::Int => TExpr::cast(CastOp::IntToFloat, e),
        _ => e,
    }
}

/// Truthiness of a scalar
pub(crate) fn to_bool(e: TExpr) -> TExpr {
    if e.ty == NumType::Bool {
        e
    } else {
        TExpr::cast(CastOp::ToBool, e)
    }
}

/// True when `body` contains a `break` belonging to this loop
fn has_break(body: &[Stmt]) -> bool {
    body.iter().any(|stmt| match &stmt.kind {
        StmtKind::Break => true,
        StmtKind::If { body, orelse, .. } => has_break(body) || has_break(orelse),
        StmtKind::Try {
            body,
            handlers,
            finally,
        } => {
            has_break(body)
                || handlers.iter().any(|h| has_break(&h.body))
                || has_break(finally)
        }
        _ => false,
    })
}
