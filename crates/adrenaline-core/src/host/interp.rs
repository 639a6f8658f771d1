//! Tree-walking interpreter with host semantics

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::ast::{BinOp, BoolOp, CmpOp, Expr, ExprKind, FunctionDef, Stmt, StmtKind, UnaryOp};
use crate::numeric::{self, NumericError};

use super::builtins::{self, numeric_error, Builtin};
use super::program::{FunctionInfo, ProgramState};
use super::value::{Lambda, Value};
use super::{DepthGuard, HostError, HostResult, Invoke};

/// Stack left before a call or block grows onto a fresh segment
const STACK_RED_ZONE: usize = 128 * 1024;
/// Size of each segment added by [`stacker::maybe_grow`]
const STACK_SEGMENT: usize = 4 * 1024 * 1024;

/// Control flow out of a statement
enum Flow {
    Normal,
    Break,
    Continue,
    Return(Value),
}

enum Scope<'f> {
    /// Module level: every name is global
    Module,
    Function {
        local_names: &'f BTreeSet<String>,
        global_names: &'f BTreeSet<String>,
    },
    /// Lambda body: its captured frame plus parameters, globals behind that
    Lambda,
}

struct Frame<'f> {
    locals: HashMap<String, Value>,
    scope: Scope<'f>,
}

impl<'f> Frame<'f> {
    fn new(scope: Scope<'f>) -> Self {
        Self {
            locals: HashMap::new(),
            scope,
        }
    }
}

/// Evaluates function bodies of one program snapshot
pub struct Interpreter<'a> {
    state: &'a ProgramState,
    invoker: &'a dyn Invoke,
    output: &'a Mutex<String>,
    max_depth: u32,
}

impl<'a> Interpreter<'a> {
    pub fn new(
        state: &'a ProgramState,
        invoker: &'a dyn Invoke,
        output: &'a Mutex<String>,
        max_depth: u32,
    ) -> Self {
        Self {
            state,
            invoker,
            output,
            max_depth,
        }
    }

    /// Execute a module-level function
    pub fn call_function(&self, name: &str, args: Vec<Value>) -> HostResult<Value> {
        let info = self
            .state
            .function_info(name)
            .ok_or_else(|| HostError::Name(name.to_string()))?;
        let _depth = DepthGuard::enter(self.max_depth)?;
        stacker::maybe_grow(STACK_RED_ZONE, STACK_SEGMENT, || self.run_function(info, args))
    }

    fn run_function(&self, info: &FunctionInfo, args: Vec<Value>) -> HostResult<Value> {
        let def = &info.def;
        let mut frame = Frame::new(Scope::Function {
            local_names: &info.local_names,
            global_names: &info.global_names,
        });
        let args = self.complete_arguments(def, args, Vec::new())?;
        for (param, value) in def.params.iter().zip(args) {
            frame.locals.insert(param.name.name.clone(), value);
        }

        match self.exec_block(&mut frame, &def.body)? {
            Flow::Return(value) => Ok(value),
            Flow::Normal | Flow::Break | Flow::Continue => Ok(Value::None),
        }
    }

    /// Execute module-level statements
    pub fn run_module(&self, body: &[Stmt]) -> HostResult<()> {
        let mut frame = Frame::new(Scope::Module);
        self.exec_block(&mut frame, body).map(|_| ())
    }

    /// Fill in keyword arguments and defaults so `args` covers every parameter
    fn complete_arguments(
        &self,
        def: &FunctionDef,
        mut args: Vec<Value>,
        keywords: Vec<(String, Value)>,
    ) -> HostResult<Vec<Value>> {
        let name = &def.name.name;
        if args.len() > def.params.len() {
            return Err(HostError::Type(format!(
                "{name}() takes {} positional arguments but {} were given",
                def.params.len(),
                args.len()
            )));
        }
        let mut keywords: Vec<Option<(String, Value)>> = keywords.into_iter().map(Some).collect();
        for (index, param) in def.params.iter().enumerate() {
            let keyword = keywords
                .iter_mut()
                .find(|k| k.as_ref().is_some_and(|(n, _)| *n == param.name.name))
                .and_then(Option::take);
            if index < args.len() {
                if keyword.is_some() {
                    return Err(HostError::Type(format!(
                        "{name}() got multiple values for argument '{}'",
                        param.name.name
                    )));
                }
                continue;
            }
            let value = match (keyword, &param.default) {
                (Some((_, value)), _) => value,
                (None, Some(default)) => self.eval(&mut Frame::new(Scope::Module), default)?,
                (None, None) => {
                    return Err(HostError::Type(format!(
                        "{name}() missing required argument: '{}'",
                        param.name.name
                    )))
                }
            };
            args.push(value);
        }
        if let Some((unexpected, _)) = keywords.into_iter().flatten().next() {
            return Err(HostError::Type(format!(
                "{name}() got an unexpected keyword argument '{unexpected}'"
            )));
        }
        Ok(args)
    }

    // ========================================================================
    // Statements
    // ========================================================================

    fn exec_block(&self, frame: &mut Frame<'_>, body: &[Stmt]) -> HostResult<Flow> {
        stacker::maybe_grow(STACK_RED_ZONE, STACK_SEGMENT, || {
            for stmt in body {
                match self.exec(frame, stmt)? {
                    Flow::Normal => {}
                    flow => return Ok(flow),
                }
            }
            Ok(Flow::Normal)
        })
    }

    fn exec(&self, frame: &mut Frame<'_>, stmt: &Stmt) -> HostResult<Flow> {
        match &stmt.kind {
            StmtKind::Expr(expr) => {
                self.eval(frame, expr)?;
            }
            StmtKind::Assign { targets, value } => {
                let value = self.eval(frame, value)?;
                for target in targets {
                    self.assign(frame, target, value.clone())?;
                }
            }
            StmtKind::AugAssign { target, op, value } => self.aug_assign(frame, target, *op, value)?,
            StmtKind::Return(value) => {
                let value = match value {
                    Some(expr) => self.eval(frame, expr)?,
                    None => Value::None,
                };
                return Ok(Flow::Return(value));
            }
            StmtKind::If { cond, body, orelse } => {
                let branch = if self.eval(frame, cond)?.is_truthy() {
                    body
                } else {
                    orelse
                };
                return self.exec_block(frame, branch);
            }
            StmtKind::While { cond, body } => {
                while self.eval(frame, cond)?.is_truthy() {
                    match self.exec_block(frame, body)? {
                        Flow::Break => break,
                        Flow::Return(value) => return Ok(Flow::Return(value)),
                        Flow::Normal | Flow::Continue => {}
                    }
                }
            }
            StmtKind::For { target, iter, body } => return self.exec_for(frame, target, iter, body),
            StmtKind::Break => return Ok(Flow::Break),
            StmtKind::Continue => return Ok(Flow::Continue),
            StmtKind::Pass | StmtKind::Global(_) | StmtKind::FunctionDef(_) => {}
            StmtKind::Nonlocal(_) => {
                return Err(HostError::Raised {
                    kind: "SyntaxError".into(),
                    message: "no binding for nonlocal found".into(),
                })
            }
            StmtKind::Import(names) => {
                for import in names {
                    let module = builtins::module_value(&import.path).ok_or_else(|| {
                        HostError::Import(format!("No module named '{}'", import.path))
                    })?;
                    self.store(frame, import.bound_name(), module);
                }
            }
            StmtKind::FromImport { module, names } => {
                if module != "math" {
                    return Err(HostError::Import(format!("No module named '{module}'")));
                }
                for import in names {
                    let value = builtins::math_attribute(&import.path).map_err(|_| {
                        HostError::Import(format!(
                            "cannot import name '{}' from 'math'",
                            import.path
                        ))
                    })?;
                    self.store(frame, import.bound_name(), value);
                }
            }
            StmtKind::Try {
                body,
                handlers,
                finally,
            } => {
                let mut outcome = self.exec_block(frame, body);
                if let Err(err) = &outcome {
                    let err = err.clone();
                    for handler in handlers {
                        let caught = match &handler.kind {
                            None => true,
                            Some(kind) => handler_matches(kind, &err),
                        };
                        if caught {
                            if let Some(name) = &handler.name {
                                self.store(frame, &name.name, Value::str(err.message()));
                            }
                            outcome = self.exec_block(frame, &handler.body);
                            break;
                        }
                    }
                }
                if !finally.is_empty() {
                    match self.exec_block(frame, finally)? {
                        Flow::Normal => {}
                        flow => return Ok(flow),
                    }
                }
                return outcome;
            }
            StmtKind::Raise(exception) => return Err(self.raise(frame, exception.as_ref())?),
        }
        Ok(Flow::Normal)
    }

    fn exec_for(
        &self,
        frame: &mut Frame<'_>,
        target: &Expr,
        iter: &Expr,
        body: &[Stmt],
    ) -> HostResult<Flow> {
        let iterable = self.eval(frame, iter)?;
        let run = |frame: &mut Frame<'_>, item: Value| -> HostResult<Option<Flow>> {
            self.assign(frame, target, item)?;
            match self.exec_block(frame, body)? {
                Flow::Break => Ok(Some(Flow::Normal)),
                Flow::Return(value) => Ok(Some(Flow::Return(value))),
                Flow::Normal | Flow::Continue => Ok(None),
            }
        };
        match &iterable {
            Value::Range(range) => {
                for k in 0..range.len() {
                    if let Some(flow) = run(frame, Value::Int(range.nth(k)))? {
                        return Ok(flow);
                    }
                }
            }
            // Lists are walked by index so appends made by the body are visited
            Value::List(items) => {
                let mut k = 0;
                loop {
                    let item = match items.read().get(k) {
                        Some(item) => item.clone(),
                        None => break,
                    };
                    if let Some(flow) = run(frame, item)? {
                        return Ok(flow);
                    }
                    k += 1;
                }
            }
            other => {
                for item in builtins::iterate(other)? {
                    if let Some(flow) = run(frame, item)? {
                        return Ok(flow);
                    }
                }
            }
        }
        Ok(Flow::Normal)
    }

    fn raise(&self, frame: &mut Frame<'_>, exception: Option<&Expr>) -> HostResult<HostError> {
        let Some(exception) = exception else {
            return Ok(HostError::Raised {
                kind: "RuntimeError".into(),
                message: "No active exception to reraise".into(),
            });
        };
        let (kind, message) = match &exception.kind {
            ExprKind::Name(kind) => (kind.clone(), String::new()),
            ExprKind::Call { func, args, .. } => match func.as_name() {
                Some(kind) => {
                    let message = match args.first() {
                        Some(arg) => self.eval(frame, arg)?.to_string(),
                        None => String::new(),
                    };
                    (kind.to_string(), message)
                }
                None => {
                    return Ok(HostError::Type(
                        "exceptions must derive from BaseException".into(),
                    ))
                }
            },
            _ => {
                return Ok(HostError::Type(
                    "exceptions must derive from BaseException".into(),
                ))
            }
        };
        Ok(HostError::Raised { kind, message })
    }

    // ========================================================================
    // Names and assignment
    // ========================================================================

    fn load(&self, frame: &Frame<'_>, name: &str) -> HostResult<Value> {
        match &frame.scope {
            Scope::Module => self.load_global(name),
            Scope::Function {
                local_names,
                global_names,
            } => {
                if global_names.contains(name) || !local_names.contains(name) {
                    self.load_global(name)
                } else {
                    frame
                        .locals
                        .get(name)
                        .cloned()
                        .ok_or_else(|| HostError::UnboundLocal(name.to_string()))
                }
            }
            Scope::Lambda => match frame.locals.get(name) {
                Some(value) => Ok(value.clone()),
                None => self.load_global(name),
            },
        }
    }

    fn load_global(&self, name: &str) -> HostResult<Value> {
        if let Some(value) = self.state.global(name) {
            return Ok(value);
        }
        if self.state.function_info(name).is_some() {
            return Ok(Value::Function(Arc::from(name)));
        }
        Builtin::lookup(name)
            .map(Value::Builtin)
            .ok_or_else(|| HostError::Name(name.to_string()))
    }

    fn store(&self, frame: &mut Frame<'_>, name: &str, value: Value) {
        let global = match &frame.scope {
            Scope::Module => true,
            Scope::Function { global_names, .. } => global_names.contains(name),
            Scope::Lambda => false,
        };
        if global {
            self.state.set_global(name, value);
        } else {
            frame.locals.insert(name.to_string(), value);
        }
    }

    fn assign(&self, frame: &mut Frame<'_>, target: &Expr, value: Value) -> HostResult<()> {
        match &target.kind {
            ExprKind::Name(name) => {
                self.store(frame, name, value);
                Ok(())
            }
            ExprKind::Tuple(targets) | ExprKind::List(targets) => {
                let items = builtins::iterate(&value)?;
                if items.len() != targets.len() {
                    return Err(HostError::Value(format!(
                        "expected {} values to unpack, got {}",
                        targets.len(),
                        items.len()
                    )));
                }
                for (target, item) in targets.iter().zip(items) {
                    self.assign(frame, target, item)?;
                }
                Ok(())
            }
            ExprKind::Subscript {
                value: container,
                index,
            } => {
                let container = self.eval(frame, container)?;
                let index = self.eval(frame, index)?;
                set_item(&container, &index, value)
            }
            ExprKind::Attribute { attr, .. } => Err(HostError::Attribute(format!(
                "cannot assign attribute '{}'",
                attr.name
            ))),
            _ => Err(HostError::Type(format!(
                "cannot assign to {}",
                target.describe()
            ))),
        }
    }

    fn aug_assign(
        &self,
        frame: &mut Frame<'_>,
        target: &Expr,
        op: BinOp,
        value: &Expr,
    ) -> HostResult<()> {
        match &target.kind {
            ExprKind::Name(name) => {
                let current = self.load(frame, name)?;
                let rhs = self.eval(frame, value)?;
                if let (BinOp::Add, Value::List(items)) = (op, &current) {
                    let extra = builtins::iterate(&rhs)?;
                    items.write().extend(extra);
                    return Ok(());
                }
                let updated = binary(op, &current, &rhs)?;
                self.store(frame, name, updated);
                Ok(())
            }
            ExprKind::Subscript {
                value: container,
                index,
            } => {
                let container = self.eval(frame, container)?;
                let index = self.eval(frame, index)?;
                let current = get_item(&container, &index)?;
                let rhs = self.eval(frame, value)?;
                set_item(&container, &index, binary(op, &current, &rhs)?)
            }
            _ => Err(HostError::Type(format!(
                "illegal target for augmented assignment: {}",
                target.describe()
            ))),
        }
    }

    // ========================================================================
    // Expressions
    // ========================================================================

    fn eval(&self, frame: &mut Frame<'_>, expr: &Expr) -> HostResult<Value> {
        match &expr.kind {
            ExprKind::Int(i) => Ok(Value::Int(*i)),
            ExprKind::Float(f) => Ok(Value::Float(*f)),
            ExprKind::Bool(b) => Ok(Value::Bool(*b)),
            ExprKind::None => Ok(Value::None),
            ExprKind::Str(s) => Ok(Value::str(s)),
            ExprKind::Name(name) => self.load(frame, name),
            ExprKind::Binary { op, left, right } => {
                let left = self.eval(frame, left)?;
                let right = self.eval(frame, right)?;
                binary(*op, &left, &right)
            }
            ExprKind::Unary { op, operand } => {
                let operand = self.eval(frame, operand)?;
                unary(*op, &operand)
            }
            ExprKind::BoolOp { op, left, right } => {
                let left = self.eval(frame, left)?;
                let short_circuit = match op {
                    BoolOp::And => !left.is_truthy(),
                    BoolOp::Or => left.is_truthy(),
                };
                if short_circuit {
                    Ok(left)
                } else {
                    self.eval(frame, right)
                }
            }
            ExprKind::Compare { left, rest } => {
                let mut left = self.eval(frame, left)?;
                for (op, right) in rest {
                    let right = self.eval(frame, right)?;
                    if !compare(*op, &left, &right)? {
                        return Ok(Value::Bool(false));
                    }
                    left = right;
                }
                Ok(Value::Bool(true))
            }
            ExprKind::Call {
                func,
                args,
                keywords,
            } => self.eval_call(frame, func, args, keywords),
            ExprKind::Attribute { value, attr } => {
                let object = self.eval(frame, value)?;
                match &object {
                    Value::Module(module) if &**module == "math" => {
                        builtins::math_attribute(&attr.name)
                    }
                    other => Err(HostError::Attribute(format!(
                        "'{}' object has no attribute '{}'",
                        other.type_name(),
                        attr.name
                    ))),
                }
            }
            ExprKind::Subscript { value, index } => {
                let container = self.eval(frame, value)?;
                let index = self.eval(frame, index)?;
                get_item(&container, &index)
            }
            ExprKind::List(items) => {
                let items = self.eval_all(frame, items)?;
                Ok(Value::list(items))
            }
            ExprKind::Tuple(items) => {
                let items = self.eval_all(frame, items)?;
                Ok(Value::tuple(items))
            }
            ExprKind::Dict(entries) => {
                let mut dict: Vec<(Value, Value)> = Vec::with_capacity(entries.len());
                for (key, value) in entries {
                    let key = self.eval(frame, key)?;
                    check_hashable(&key)?;
                    let value = self.eval(frame, value)?;
                    match dict.iter_mut().find(|(k, _)| k.py_eq(&key)) {
                        Some(entry) => entry.1 = value,
                        None => dict.push((key, value)),
                    }
                }
                Ok(Value::dict(dict))
            }
            ExprKind::Lambda { params, body } => {
                let captured = frame
                    .locals
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                Ok(Value::Lambda(Arc::new(Lambda {
                    params: params.iter().map(|p| p.name.clone()).collect(),
                    body: (**body).clone(),
                    captured,
                })))
            }
            ExprKind::IfExp {
                cond,
                then,
                otherwise,
            } => {
                if self.eval(frame, cond)?.is_truthy() {
                    self.eval(frame, then)
                } else {
                    self.eval(frame, otherwise)
                }
            }
        }
    }

    fn eval_all(&self, frame: &mut Frame<'_>, exprs: &[Expr]) -> HostResult<Vec<Value>> {
        exprs.iter().map(|e| self.eval(frame, e)).collect()
    }

    fn eval_call(
        &self,
        frame: &mut Frame<'_>,
        func: &Expr,
        args: &[Expr],
        keywords: &[(crate::ast::Ident, Expr)],
    ) -> HostResult<Value> {
        if let ExprKind::Attribute { value, attr } = &func.kind {
            let receiver = self.eval(frame, value)?;
            if !matches!(receiver, Value::Module(_)) {
                let args = self.eval_all(frame, args)?;
                return call_method(&receiver, &attr.name, args);
            }
        }

        let callee = self.eval(frame, func)?;
        let args = self.eval_all(frame, args)?;
        let mut named = Vec::with_capacity(keywords.len());
        for (name, value) in keywords {
            named.push((name.name.clone(), self.eval(frame, value)?));
        }
        self.call_value(&callee, args, named)
    }

    fn call_value(
        &self,
        callee: &Value,
        args: Vec<Value>,
        keywords: Vec<(String, Value)>,
    ) -> HostResult<Value> {
        match callee {
            Value::Function(name) => {
                let args = if keywords.is_empty() {
                    args
                } else {
                    let info = self
                        .state
                        .function_info(name)
                        .ok_or_else(|| HostError::Name(name.to_string()))?;
                    self.complete_arguments(&info.def, args, keywords)?
                };
                self.invoker.invoke_by_name(name, args)
            }
            Value::Builtin(Builtin::Print) => {
                let mut sep = " ".to_string();
                let mut end = "\n".to_string();
                for (name, value) in keywords {
                    match name.as_str() {
                        "sep" => sep = value.to_string(),
                        "end" => end = value.to_string(),
                        other => {
                            return Err(HostError::Type(format!(
                                "'{other}' is an invalid keyword argument for print()"
                            )))
                        }
                    }
                }
                let line: Vec<String> = args.iter().map(ToString::to_string).collect();
                let mut output = self.output.lock();
                output.push_str(&line.join(&sep));
                output.push_str(&end);
                Ok(Value::None)
            }
            Value::Builtin(builtin) => {
                if let Some((name, _)) = keywords.first() {
                    return Err(HostError::Type(format!(
                        "{}() takes no keyword argument '{name}'",
                        builtin.name()
                    )));
                }
                builtin.call(args)
            }
            Value::Lambda(lambda) => {
                if !keywords.is_empty() || args.len() != lambda.params.len() {
                    return Err(HostError::Type(format!(
                        "<lambda>() takes {} arguments ({} given)",
                        lambda.params.len(),
                        args.len()
                    )));
                }
                let _depth = DepthGuard::enter(self.max_depth)?;
                let mut frame = Frame::new(Scope::Lambda);
                frame.locals.extend(lambda.captured.iter().cloned());
                frame
                    .locals
                    .extend(lambda.params.iter().cloned().zip(args));
                stacker::maybe_grow(STACK_RED_ZONE, STACK_SEGMENT, || self.eval(&mut frame, &lambda.body))
            }
            other => Err(HostError::Type(format!(
                "'{}' object is not callable",
                other.type_name()
            ))),
        }
    }
}

fn handler_matches(kind: &Expr, err: &HostError) -> bool {
    match &kind.kind {
        ExprKind::Name(name) => err.is_instance_of(name),
        ExprKind::Tuple(kinds) => kinds.iter().any(|k| handler_matches(k, err)),
        _ => false,
    }
}

// ============================================================================
// Operators
// ============================================================================

fn type_error(op: &str, a: &Value, b: &Value) -> HostError {
    HostError::Type(format!(
        "unsupported operand type(s) for {op}: '{}' and '{}'",
        a.type_name(),
        b.type_name()
    ))
}

/// Host binary operator
pub(crate) fn binary(op: BinOp, a: &Value, b: &Value) -> HostResult<Value> {
    if a.is_number() && b.is_number() {
        if matches!(a, Value::Float(_)) || matches!(b, Value::Float(_)) {
            return float_binary(op, a, b);
        }
        if let (Value::Bool(x), Value::Bool(y)) = (a, b) {
            match op {
                BinOp::BitAnd => return Ok(Value::Bool(*x & *y)),
                BinOp::BitOr => return Ok(Value::Bool(*x | *y)),
                BinOp::BitXor => return Ok(Value::Bool(*x ^ *y)),
                _ => {}
            }
        }
        let (x, y) = match (a.as_int(), b.as_int()) {
            (Some(x), Some(y)) => (x, y),
            _ => return Err(type_error(op.as_str(), a, b)),
        };
        return int_binary(op, x, y);
    }
    match (op, a, b) {
        (BinOp::Add, _, _) => builtins::add(a, b),
        (BinOp::Mul, Value::Str(s), n) | (BinOp::Mul, n, Value::Str(s)) if n.as_int().is_some() => {
            let count = usize::try_from(n.as_int().unwrap_or(0)).unwrap_or(0);
            Ok(Value::str(s.repeat(count)))
        }
        (BinOp::Mul, Value::List(items), n) | (BinOp::Mul, n, Value::List(items))
            if n.as_int().is_some() =>
        {
            let count = usize::try_from(n.as_int().unwrap_or(0)).unwrap_or(0);
            let items = items.read();
            let mut repeated = Vec::with_capacity(items.len() * count);
            for _ in 0..count {
                repeated.extend(items.iter().cloned());
            }
            Ok(Value::list(repeated))
        }
        _ => Err(type_error(op.as_str(), a, b)),
    }
}

fn int_binary(op: BinOp, x: i64, y: i64) -> HostResult<Value> {
    let overflow = || numeric_error(NumericError::Overflow);
    let result = match op {
        BinOp::Add => x.checked_add(y).ok_or_else(overflow)?,
        BinOp::Sub => x.checked_sub(y).ok_or_else(overflow)?,
        BinOp::Mul => x.checked_mul(y).ok_or_else(overflow)?,
        BinOp::Div => {
            return numeric::int_truediv(x, y)
                .map(Value::Float)
                .map_err(numeric_error)
        }
        BinOp::FloorDiv => numeric::int_floordiv(x, y).map_err(numeric_error)?,
        BinOp::Mod => numeric::int_mod(x, y).map_err(numeric_error)?,
        BinOp::Pow if y < 0 => {
            return numeric::float_pow(x as f64, y as f64)
                .map(Value::Float)
                .map_err(numeric_error)
        }
        BinOp::Pow => numeric::int_pow(x, y).map_err(numeric_error)?,
        BinOp::BitAnd => x & y,
        BinOp::BitOr => x | y,
        BinOp::BitXor => x ^ y,
        BinOp::Shl => numeric::int_shl(x, y).map_err(numeric_error)?,
        BinOp::Shr => numeric::int_shr(x, y).map_err(numeric_error)?,
        BinOp::MatMul => {
            return Err(type_error(
                op.as_str(),
                &Value::Int(x),
                &Value::Int(y),
            ))
        }
    };
    Ok(Value::Int(result))
}

fn float_binary(op: BinOp, a: &Value, b: &Value) -> HostResult<Value> {
    let (Some(x), Some(y)) = (a.as_float(), b.as_float()) else {
        return Err(type_error(op.as_str(), a, b));
    };
    let result = match op {
        BinOp::Add => x + y,
        BinOp::Sub => x - y,
        BinOp::Mul => x * y,
        BinOp::Div => numeric::float_truediv(x, y).map_err(numeric_error)?,
        BinOp::FloorDiv => numeric::float_floordiv(x, y).map_err(numeric_error)?,
        BinOp::Mod => numeric::float_mod(x, y).map_err(numeric_error)?,
        BinOp::Pow => numeric::float_pow(x, y).map_err(numeric_error)?,
        BinOp::BitAnd
        | BinOp::BitOr
        | BinOp::BitXor
        | BinOp::Shl
        | BinOp::Shr
        | BinOp::MatMul => return Err(type_error(op.as_str(), a, b)),
    };
    Ok(Value::Float(result))
}

fn unary(op: UnaryOp, operand: &Value) -> HostResult<Value> {
    let bad = || {
        HostError::Type(format!(
            "bad operand type for unary operator: '{}'",
            operand.type_name()
        ))
    };
    match (op, operand) {
        (UnaryOp::Not, value) => Ok(Value::Bool(!value.is_truthy())),
        (_, Value::Float(f)) => match op {
            UnaryOp::Neg => Ok(Value::Float(-f)),
            UnaryOp::Pos => Ok(Value::Float(*f)),
            _ => Err(bad()),
        },
        (_, value) => {
            let i = value.as_int().ok_or_else(bad)?;
            match op {
                UnaryOp::Neg => i
                    .checked_neg()
                    .map(Value::Int)
                    .ok_or_else(|| numeric_error(NumericError::Overflow)),
                UnaryOp::Pos => Ok(Value::Int(i)),
                UnaryOp::Invert => Ok(Value::Int(!i)),
                UnaryOp::Not => Ok(Value::Bool(i == 0)),
            }
        }
    }
}

fn is_identical(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::None, Value::None) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Int(x), Value::Int(y)) => x == y,
        (Value::List(x), Value::List(y)) => Arc::ptr_eq(x, y),
        (Value::Dict(x), Value::Dict(y)) => Arc::ptr_eq(x, y),
        (Value::Tuple(x), Value::Tuple(y)) => Arc::ptr_eq(x, y),
        (Value::Str(x), Value::Str(y)) => Arc::ptr_eq(x, y) || x == y,
        (Value::Function(x), Value::Function(y)) => x == y,
        _ => false,
    }
}

/// Host comparison operator
pub(crate) fn compare(op: CmpOp, a: &Value, b: &Value) -> HostResult<bool> {
    let ordering = |a: &Value, b: &Value| -> HostResult<Option<Ordering>> {
        if a.is_number() && b.is_number() {
            return Ok(a.numeric_cmp(b));
        }
        match (a, b) {
            (Value::Str(x), Value::Str(y)) => Ok(Some(x.cmp(y))),
            _ => Err(HostError::Type(format!(
                "'{}' not supported between instances of '{}' and '{}'",
                op.as_str(),
                a.type_name(),
                b.type_name()
            ))),
        }
    };
    Ok(match op {
        CmpOp::Eq => a.py_eq(b),
        CmpOp::NotEq => !a.py_eq(b),
        CmpOp::Lt => ordering(a, b)? == Some(Ordering::Less),
        CmpOp::LtEq => matches!(ordering(a, b)?, Some(Ordering::Less | Ordering::Equal)),
        CmpOp::Gt => ordering(a, b)? == Some(Ordering::Greater),
        CmpOp::GtEq => matches!(ordering(a, b)?, Some(Ordering::Greater | Ordering::Equal)),
        CmpOp::Is => is_identical(a, b),
        CmpOp::IsNot => !is_identical(a, b),
        CmpOp::In => contains(b, a)?,
        CmpOp::NotIn => !contains(b, a)?,
    })
}

fn contains(container: &Value, item: &Value) -> HostResult<bool> {
    match container {
        Value::List(items) => Ok(items.read().iter().any(|x| x.py_eq(item))),
        Value::Tuple(items) => Ok(items.iter().any(|x| x.py_eq(item))),
        Value::Dict(entries) => Ok(entries.read().iter().any(|(k, _)| k.py_eq(item))),
        Value::Str(s) => match item {
            Value::Str(needle) => Ok(s.contains(&**needle)),
            other => Err(HostError::Type(format!(
                "'in <string>' requires string as left operand, not {}",
                other.type_name()
            ))),
        },
        Value::Range(range) => Ok(match item.as_int() {
            Some(i) if item.is_number() && !matches!(item, Value::Float(_)) => {
                let offset = i128::from(i) - i128::from(range.start);
                let in_bounds = if range.step > 0 {
                    i >= range.start && i < range.stop
                } else {
                    i <= range.start && i > range.stop
                };
                in_bounds && offset % i128::from(range.step) == 0
            }
            _ => (0..range.len()).any(|k| Value::Int(range.nth(k)).py_eq(item)),
        }),
        other => Err(HostError::Type(format!(
            "argument of type '{}' is not iterable",
            other.type_name()
        ))),
    }
}

fn check_hashable(key: &Value) -> HostResult<()> {
    match key {
        Value::List(_) | Value::Dict(_) => Err(HostError::Type(format!(
            "unhashable type: '{}'",
            key.type_name()
        ))),
        _ => Ok(()),
    }
}

fn sequence_index(index: &Value, len: usize, what: &str) -> HostResult<usize> {
    let i = match index {
        Value::Int(i) => *i,
        Value::Bool(b) => i64::from(*b),
        other => {
            return Err(HostError::Type(format!(
                "{what} indices must be integers, not '{}'",
                other.type_name()
            )))
        }
    };
    let len = len as i64;
    let normalized = if i < 0 { i + len } else { i };
    if normalized < 0 || normalized >= len {
        return Err(HostError::Index(format!("{what} index out of range")));
    }
    Ok(normalized as usize)
}

/// `container[index]`
pub(crate) fn get_item(container: &Value, index: &Value) -> HostResult<Value> {
    match container {
        Value::List(items) => {
            let items = items.read();
            let i = sequence_index(index, items.len(), "list")?;
            Ok(items[i].clone())
        }
        Value::Tuple(items) => {
            let i = sequence_index(index, items.len(), "tuple")?;
            Ok(items[i].clone())
        }
        Value::Str(s) => {
            let chars: Vec<char> = s.chars().collect();
            let i = sequence_index(index, chars.len(), "string")?;
            Ok(Value::str(chars[i].to_string()))
        }
        Value::Range(range) => {
            let i = sequence_index(index, usize::try_from(range.len()).unwrap_or(usize::MAX), "range")?;
            Ok(Value::Int(range.nth(i as i64)))
        }
        Value::Dict(entries) => {
            check_hashable(index)?;
            entries
                .read()
                .iter()
                .find(|(k, _)| k.py_eq(index))
                .map(|(_, v)| v.clone())
                .ok_or_else(|| HostError::Key(index.repr()))
        }
        other => Err(HostError::Type(format!(
            "'{}' object is not subscriptable",
            other.type_name()
        ))),
    }
}

/// `container[index] = value`
pub(crate) fn set_item(container: &Value, index: &Value, value: Value) -> HostResult<()> {
    match container {
        Value::List(items) => {
            let mut items = items.write();
            let i = sequence_index(index, items.len(), "list assignment")?;
            items[i] = value;
            Ok(())
        }
        Value::Dict(entries) => {
            check_hashable(index)?;
            let mut entries = entries.write();
            match entries.iter_mut().find(|(k, _)| k.py_eq(index)) {
                Some(entry) => entry.1 = value,
                None => entries.push((index.clone(), value)),
            }
            Ok(())
        }
        other => Err(HostError::Type(format!(
            "'{}' object does not support item assignment",
            other.type_name()
        ))),
    }
}

fn call_method(receiver: &Value, method: &str, args: Vec<Value>) -> HostResult<Value> {
    let arity = |min: usize, max: usize| -> HostResult<()> {
        if args.len() < min || args.len() > max {
            return Err(HostError::Type(format!(
                "{method}() takes {min} to {max} arguments ({} given)",
                args.len()
            )));
        }
        Ok(())
    };
    match (receiver, method) {
        (Value::Dict(entries), "get") => {
            arity(1, 2)?;
            check_hashable(&args[0])?;
            let found = entries
                .read()
                .iter()
                .find(|(k, _)| k.py_eq(&args[0]))
                .map(|(_, v)| v.clone());
            Ok(found.unwrap_or_else(|| args.get(1).cloned().unwrap_or(Value::None)))
        }
        (Value::Dict(entries), "keys") => {
            arity(0, 0)?;
            Ok(Value::list(entries.read().iter().map(|(k, _)| k.clone()).collect()))
        }
        (Value::Dict(entries), "values") => {
            arity(0, 0)?;
            Ok(Value::list(entries.read().iter().map(|(_, v)| v.clone()).collect()))
        }
        (Value::Dict(entries), "items") => {
            arity(0, 0)?;
            Ok(Value::list(
                entries
                    .read()
                    .iter()
                    .map(|(k, v)| Value::tuple(vec![k.clone(), v.clone()]))
                    .collect(),
            ))
        }
        (Value::List(items), "append") => {
            arity(1, 1)?;
            items.write().extend(args);
            Ok(Value::None)
        }
        (Value::List(items), "extend") => {
            arity(1, 1)?;
            let extra = builtins::iterate(&args[0])?;
            items.write().extend(extra);
            Ok(Value::None)
        }
        (Value::List(items), "pop") => {
            arity(0, 1)?;
            let mut items = items.write();
            if items.is_empty() {
                return Err(HostError::Index("pop from empty list".into()));
            }
            let index = match args.first() {
                Some(index) => sequence_index(index, items.len(), "pop")?,
                None => items.len() - 1,
            };
            Ok(items.remove(index))
        }
        (other, _) => Err(HostError::Attribute(format!(
            "'{}' object has no attribute '{method}'",
            other.type_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_semantics() {
        assert_eq!(binary(BinOp::FloorDiv, &Value::Int(-7), &Value::Int(2)).unwrap(), Value::Int(-4));
        assert_eq!(binary(BinOp::Mod, &Value::Int(-7), &Value::Int(2)).unwrap(), Value::Int(1));
        assert_eq!(binary(BinOp::Div, &Value::Int(7), &Value::Int(2)).unwrap(), Value::Float(3.5));
        assert_eq!(binary(BinOp::Pow, &Value::Int(2), &Value::Int(-1)).unwrap(), Value::Float(0.5));
        assert!(matches!(
            binary(BinOp::Add, &Value::Int(i64::MAX), &Value::Int(1)),
            Err(HostError::Overflow(_))
        ));
        assert!(matches!(
            binary(BinOp::Mod, &Value::Int(1), &Value::Int(0)),
            Err(HostError::ZeroDivision(_))
        ));
    }

    #[test]
    fn mixed_and_bool_arithmetic() {
        assert_eq!(binary(BinOp::Add, &Value::Int(1), &Value::Float(0.5)).unwrap(), Value::Float(1.5));
        assert_eq!(binary(BinOp::Add, &Value::Bool(true), &Value::Int(1)).unwrap(), Value::Int(2));
        assert_eq!(
            binary(BinOp::BitAnd, &Value::Bool(true), &Value::Bool(false)).unwrap(),
            Value::Bool(false)
        );
        assert!(matches!(
            binary(BinOp::Shl, &Value::Float(1.0), &Value::Int(1)),
            Err(HostError::Type(_))
        ));
    }

    #[test]
    fn comparisons() {
        assert!(compare(CmpOp::Lt, &Value::Int(1), &Value::Float(1.5)).unwrap());
        assert!(!compare(CmpOp::Lt, &Value::Float(f64::NAN), &Value::Int(1)).unwrap());
        assert!(compare(CmpOp::NotEq, &Value::Float(f64::NAN), &Value::Float(f64::NAN)).unwrap());
        assert!(compare(CmpOp::In, &Value::Int(2), &Value::int_list(&[1, 2])).unwrap());
        assert!(compare(CmpOp::Is, &Value::None, &Value::None).unwrap());
        assert!(compare(CmpOp::Lt, &Value::str("a"), &Value::Int(1)).is_err());
    }

    #[test]
    fn indexing() {
        let list = Value::int_list(&[10, 20, 30]);
        assert_eq!(get_item(&list, &Value::Int(-1)).unwrap(), Value::Int(30));
        assert!(matches!(get_item(&list, &Value::Int(3)), Err(HostError::Index(_))));
        set_item(&list, &Value::Int(0), Value::Int(5)).unwrap();
        assert_eq!(get_item(&list, &Value::Int(0)).unwrap(), Value::Int(5));
        let dict = Value::dict(vec![(Value::str("count"), Value::Int(42))]);
        assert_eq!(get_item(&dict, &Value::str("count")).unwrap(), Value::Int(42));
        assert!(matches!(get_item(&dict, &Value::str("x")), Err(HostError::Key(_))));
    }

    #[test]
    fn dict_get_method() {
        let dict = Value::dict(vec![(Value::str("count"), Value::Int(42))]);
        let found = call_method(&dict, "get", vec![Value::str("count"), Value::Int(0)]).unwrap();
        assert_eq!(found, Value::Int(42));
        let missing = call_method(&dict, "get", vec![Value::str("other"), Value::Int(0)]).unwrap();
        assert_eq!(missing, Value::Int(0));
        assert!(call_method(&dict, "frobnicate", vec![]).is_err());
    }

    #[test]
    fn range_membership() {
        let range = Value::Range(crate::host::RangeValue {
            start: 0,
            stop: 10,
            step: 3,
        });
        assert!(compare(CmpOp::In, &Value::Int(9), &range).unwrap());
        assert!(!compare(CmpOp::In, &Value::Int(8), &range).unwrap());
        assert!(compare(CmpOp::In, &Value::Float(3.0), &range).unwrap());
    }
}
