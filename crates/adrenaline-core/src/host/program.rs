//! A loaded host program: parsed module, function table, globals and constants

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::ast::walk::{assigned_names, global_declarations, target_names, visit_statements};
use crate::ast::{Expr, ExprKind, FunctionDef, Module, StmtKind, UnaryOp};
use crate::parser::Parser;

use super::interp::Interpreter;
use super::value::Value;
use super::{FunctionSource, HostInterpreter, HostResult, Invoke, LoadError};

/// Module name bound to `__name__` while a program loads
pub const MODULE_NAME: &str = "__adrenaline__";

/// Per-function scope information computed once at load
#[derive(Debug)]
pub(crate) struct FunctionInfo {
    pub def: Arc<FunctionDef>,
    /// Names bound in the body (parameters included)
    pub local_names: BTreeSet<String>,
    /// Names the body declares `global`
    pub global_names: BTreeSet<String>,
}

/// Immutable snapshot of one version of the program (globals aside)
#[derive(Debug)]
pub struct ProgramState {
    module: Module,
    functions: HashMap<String, FunctionInfo>,
    order: Vec<String>,
    constants: HashMap<String, Value>,
    globals: RwLock<HashMap<String, Value>>,
}

impl ProgramState {
    fn build(module: Module) -> Self {
        let mut functions = HashMap::new();
        let mut order = Vec::new();
        let mut declared_global = BTreeSet::new();
        for def in module.functions() {
            let global_names = global_declarations(&def.body);
            declared_global.extend(global_names.iter().cloned());
            let mut local_names = assigned_names(&def.body);
            local_names.extend(def.param_names().map(str::to_string));
            for name in &global_names {
                local_names.remove(name);
            }
            let name = def.name.name.clone();
            if !order.contains(&name) {
                order.push(name.clone());
            }
            functions.insert(
                name,
                FunctionInfo {
                    def: Arc::new(def.clone()),
                    local_names,
                    global_names,
                },
            );
        }
        let constants = find_constants(&module, &declared_global);
        Self {
            module,
            functions,
            order,
            constants,
            globals: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) fn function_info(&self, name: &str) -> Option<&FunctionInfo> {
        self.functions.get(name)
    }

    /// Current value of a module global
    #[must_use]
    pub fn global(&self, name: &str) -> Option<Value> {
        self.globals.read().get(name).cloned()
    }

    pub fn set_global(&self, name: &str, value: Value) {
        self.globals.write().insert(name.to_string(), value);
    }

    #[must_use]
    pub fn module(&self) -> &Module {
        &self.module
    }
}

/// Top-level names bound exactly once, from a numeric literal, and never declared `global`
fn find_constants(module: &Module, declared_global: &BTreeSet<String>) -> HashMap<String, Value> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    visit_statements(&module.body, &mut |stmt| {
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
            _ => {}
        }
        for name in bound {
            *counts.entry(name.to_string()).or_default() += 1;
        }
    });

    let mut constants = HashMap::new();
    for stmt in &module.body {
        let StmtKind::Assign { targets, value } = &stmt.kind else {
            continue;
        };
        let Some(literal) = numeric_literal(value) else {
            continue;
        };
        for target in targets {
            if let ExprKind::Name(name) = &target.kind {
                if counts.get(name) == Some(&1) && !declared_global.contains(name) {
                    constants.insert(name.clone(), literal.clone());
                }
            }
        }
    }
    constants
}

fn numeric_literal(expr: &Expr) -> Option<Value> {
    match &expr.kind {
        ExprKind::Int(i) => Some(Value::Int(*i)),
        ExprKind::Float(f) => Some(Value::Float(*f)),
        ExprKind::Bool(b) => Some(Value::Bool(*b)),
        ExprKind::Unary {
            op: UnaryOp::Neg,
            operand,
        } => match numeric_literal(operand)? {
            Value::Int(i) => i.checked_neg().map(Value::Int),
            Value::Float(f) => Some(Value::Float(-f)),
            _ => None,
        },
        _ => None,
    }
}

/// Host program loaded from source
///
/// Loading runs the module body once (with `__name__` bound to [`MODULE_NAME`]), so module
/// globals and imports are in place before any function is called.
pub struct HostProgram {
    state: RwLock<Arc<ProgramState>>,
    output: Mutex<String>,
    max_depth: u32,
}

impl HostProgram {
    /// Parse and initialize a program
    pub fn from_source(source: &str, max_depth: u32) -> Result<Self, LoadError> {
        let program = Self {
            state: RwLock::new(Arc::new(ProgramState::build(Module::default()))),
            output: Mutex::new(String::new()),
            max_depth,
        };
        program.reload(source)?;
        Ok(program)
    }

    /// Replace the program with a new version of its source
    ///
    /// Globals are rebuilt by re-running the module body; on error the previous
    /// version stays active.
    pub fn reload(&self, source: &str) -> Result<(), LoadError> {
        let module = Parser::parse_module(source).map_err(LoadError::Parse)?;
        let state = Arc::new(ProgramState::build(module));
        state.set_global("__name__", Value::str(MODULE_NAME));
        let loader = StateInvoker {
            state: &state,
            output: &self.output,
            max_depth: self.max_depth,
        };
        Interpreter::new(&state, &loader, &self.output, self.max_depth)
            .run_module(&state.module().body)
            .map_err(LoadError::Init)?;
        *self.state.write() = state;
        Ok(())
    }

    /// The active program version
    #[must_use]
    pub fn snapshot(&self) -> Arc<ProgramState> {
        self.state.read().clone()
    }

    /// Call a function with pure interpretation (every nested call is interpreted too)
    pub fn call(&self, name: &str, args: Vec<Value>) -> HostResult<Value> {
        self.interpret(name, args, self)
    }

    /// Run the module body again as the main module (`__name__ == "__main__"`)
    pub fn run_main(&self, invoker: &dyn Invoke) -> HostResult<()> {
        let state = self.snapshot();
        state.set_global("__name__", Value::str("__main__"));
        let interpreter = Interpreter::new(&state, invoker, &self.output, self.max_depth);
        let result = interpreter.run_module(&state.module().body);
        state.set_global("__name__", Value::str(MODULE_NAME));
        result
    }

    /// Drain everything `print` has written so far
    pub fn take_output(&self) -> String {
        std::mem::take(&mut *self.output.lock())
    }

    #[must_use]
    pub const fn max_depth(&self) -> u32 {
        self.max_depth
    }
}

impl FunctionSource for HostProgram {
    fn function(&self, name: &str) -> Option<Arc<FunctionDef>> {
        self.state
            .read()
            .function_info(name)
            .map(|info| Arc::clone(&info.def))
    }

    fn constant(&self, name: &str) -> Option<Value> {
        self.state.read().constants.get(name).cloned()
    }

    fn function_names(&self) -> Vec<String> {
        self.state.read().order.clone()
    }
}

impl HostInterpreter for HostProgram {
    fn interpret(&self, name: &str, args: Vec<Value>, invoker: &dyn Invoke) -> HostResult<Value> {
        let state = self.snapshot();
        Interpreter::new(&state, invoker, &self.output, self.max_depth).call_function(name, args)
    }
}

impl Invoke for HostProgram {
    fn invoke_by_name(&self, name: &str, args: Vec<Value>) -> HostResult<Value> {
        self.interpret(name, args, self)
    }
}

impl std::fmt::Debug for HostProgram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostProgram")
            .field("functions", &self.function_names())
            .field("max_depth", &self.max_depth)
            .finish_non_exhaustive()
    }
}

/// Interprets calls against a program version that is not active yet (module initialization)
struct StateInvoker<'a> {
    state: &'a ProgramState,
    output: &'a Mutex<String>,
    max_depth: u32,
}

impl Invoke for StateInvoker<'_> {
    fn invoke_by_name(&self, name: &str, args: Vec<Value>) -> HostResult<Value> {
        Interpreter::new(self.state, self, self.output, self.max_depth).call_function(name, args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostError;

    fn load(source: &str) -> HostProgram {
        HostProgram::from_source(source, 1000).unwrap()
    }

    #[test]
    fn sum_range_interpreted() {
        let program = load(
            "def sum_range(n):\n    total = 0\n    for i in range(n):\n        total += i\n    return total\n",
        );
        assert_eq!(program.call("sum_range", vec![Value::Int(1000)]).unwrap(), Value::Int(499_500));
    }

    #[test]
    fn dict_access_returns_42() {
        let program = load(
            "def use_unsupported_feature():\n    data = {\"count\": 42}\n    return data.get(\"count\", 0)\n",
        );
        assert_eq!(
            program.call("use_unsupported_feature", vec![]).unwrap(),
            Value::Int(42)
        );
    }

    #[test]
    fn recursion_and_limit() {
        let program = load(
            "def fib(n):\n    if n < 2:\n        return n\n    return fib(n - 1) + fib(n - 2)\n\ndef down(n):\n    return down(n + 1)\n",
        );
        assert_eq!(program.call("fib", vec![Value::Int(15)]).unwrap(), Value::Int(610));
        assert_eq!(
            program.call("down", vec![Value::Int(0)]).unwrap_err(),
            HostError::Recursion
        );
    }

    #[test]
    fn deep_recursion_survives_a_small_thread_stack() {
        let outcome = std::thread::Builder::new()
            .stack_size(256 * 1024)
            .spawn(|| {
                let program = load(
                    "def depth(n):\n    if n == 0:\n        return 0\n    return 1 + depth(n - 1)\n",
                );
                let within = program.call("depth", vec![Value::Int(990)]);
                let beyond = program.call("depth", vec![Value::Int(5000)]);
                (within, beyond)
            })
            .unwrap()
            .join()
            .unwrap();
        assert_eq!(outcome.0.unwrap(), Value::Int(990));
        assert_eq!(outcome.1.unwrap_err(), HostError::Recursion);
    }

    #[test]
    fn constants_and_globals() {
        let program = load(
            "SCALE = 3\nLIMIT = -2.5\ncounter = 0\ncounter = 1\nTOTAL = 0\n\ndef bump():\n    global TOTAL\n    TOTAL += SCALE\n    return TOTAL\n",
        );
        assert_eq!(program.constant("SCALE"), Some(Value::Int(3)));
        assert_eq!(program.constant("LIMIT"), Some(Value::Float(-2.5)));
        assert_eq!(program.constant("counter"), None);
        assert_eq!(program.constant("TOTAL"), None);
        assert_eq!(program.call("bump", vec![]).unwrap(), Value::Int(3));
        assert_eq!(program.call("bump", vec![]).unwrap(), Value::Int(6));
    }

    #[test]
    fn unbound_local_and_unknown_name() {
        let program = load(
            "def f(c):\n    if c:\n        x = 1\n    return x\n\ndef g():\n    return missing\n",
        );
        assert_eq!(program.call("f", vec![Value::Bool(true)]).unwrap(), Value::Int(1));
        assert!(matches!(
            program.call("f", vec![Value::Bool(false)]),
            Err(HostError::UnboundLocal(_))
        ));
        assert!(matches!(program.call("g", vec![]), Err(HostError::Name(_))));
    }

    #[test]
    fn try_except_and_raise() {
        let program = load(
            "def safe_div(a, b):\n    try:\n        return a // b\n    except ZeroDivisionError:\n        return -1\n\ndef fail():\n    raise ValueError(\"nope\")\n",
        );
        assert_eq!(
            program.call("safe_div", vec![Value::Int(7), Value::Int(0)]).unwrap(),
            Value::Int(-1)
        );
        let err = program.call("fail", vec![]).unwrap_err();
        assert_eq!(err.kind_name(), "ValueError");
        assert_eq!(err.message(), "nope");
    }

    #[test]
    fn math_import_and_print() {
        let program = load(
            "import math\n\ndef hyp(a, b):\n    print(\"hyp\", a, b)\n    return math.sqrt(a * a + b * b)\n",
        );
        assert_eq!(
            program.call("hyp", vec![Value::Int(3), Value::Int(4)]).unwrap(),
            Value::Float(5.0)
        );
        assert_eq!(program.take_output(), "hyp 3 4\n");
    }

    #[test]
    fn keyword_and_default_arguments() {
        let program = load(
            "def scale(x, factor=2):\n    return x * factor\n\ndef caller():\n    return scale(3) + scale(x=1, factor=10)\n",
        );
        assert_eq!(program.call("caller", vec![]).unwrap(), Value::Int(16));
    }

    #[test]
    fn lists_mutate_in_place() {
        let program = load(
            "def fill(a, v):\n    for i in range(len(a)):\n        a[i] = v\n    a.append(v)\n    return a\n",
        );
        let list = Value::int_list(&[0, 0]);
        program.call("fill", vec![list.clone(), Value::Int(7)]).unwrap();
        assert_eq!(list, Value::int_list(&[7, 7, 7]));
    }

    #[test]
    fn main_guard_runs_only_on_request() {
        let program = load(
            "def f():\n    return 1\n\nif __name__ == \"__main__\":\n    print(\"main\", f())\n",
        );
        assert_eq!(program.take_output(), "");
        program.run_main(&program).unwrap();
        assert_eq!(program.take_output(), "main 1\n");
    }

    #[test]
    fn reload_swaps_definitions() {
        let program = load("def f():\n    return 1\n");
        program.reload("def f():\n    return 2\n\ndef g():\n    return 3\n").unwrap();
        assert_eq!(program.call("f", vec![]).unwrap(), Value::Int(2));
        assert_eq!(program.function_names(), vec!["f", "g"]);
        assert!(program.reload("def broken(:\n").is_err());
        assert_eq!(program.call("g", vec![]).unwrap(), Value::Int(3));
        assert!(program.function("nope").is_none());
    }
}
