//! Eligibility analysis
//!
//! The analyzer decides whether a function can be compiled for a given set of argument
//! kinds. An eligible function comes back as a [`TypedBody`]: its own typed specialization
//! plus the specializations of every function it calls. A single unsupported node anywhere
//! in that closure rejects the whole body.

pub mod fold;
mod scope;
mod translate;
pub mod typed;

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use crate::directive;
use crate::error::{AdrenalineError, ErrorKind};
use crate::host::FunctionSource;
use crate::lexer::Span;
use crate::unit::FunctionUnit;

use typed::{FuncIndex, NumType, ReturnKind, TypedBody, TypedFunction, ValueKind};

/// Return kinds tried, in order, for a recursive specialization whose own result is used
/// before any of its returns has been typed
const RECURSIVE_RETURN_CANDIDATES: [ReturnKind; 4] = [
    ReturnKind::Scalar(NumType::Int),
    ReturnKind::Scalar(NumType::Float),
    ReturnKind::Scalar(NumType::Bool),
    ReturnKind::None,
];

/// Why a function is not compiled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// The function carries `no-compile`
    OptOut,
    Unsupported(AdrenalineError),
}

impl Rejection {
    /// Error category, `None` for an opt-out
    #[must_use]
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::OptOut => None,
            Self::Unsupported(err) => Some(err.kind()),
        }
    }

    #[must_use]
    pub fn error(&self) -> Option<&AdrenalineError> {
        match self {
            Self::OptOut => None,
            Self::Unsupported(err) => Some(err),
        }
    }

    /// The offending construct, when one was named
    #[must_use]
    pub fn construct(&self) -> Option<&str> {
        self.error().and_then(AdrenalineError::construct)
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OptOut => f.write_str("directive opt-out"),
            Self::Unsupported(err) => write!(f, "{}: {err}", err.kind()),
        }
    }
}

/// Outcome of eligibility analysis
#[derive(Debug, Clone, PartialEq)]
pub enum EligibilityVerdict {
    Eligible(TypedBody),
    Rejected(Rejection),
}

impl EligibilityVerdict {
    #[must_use]
    pub const fn is_eligible(&self) -> bool {
        matches!(self, Self::Eligible(_))
    }
}

/// A verdict together with what it depends on
#[derive(Debug, Clone)]
pub struct Analysis {
    pub verdict: EligibilityVerdict,
    /// Module functions the verdict was derived from (the function itself included)
    pub dependencies: BTreeSet<String>,
    /// Module constants captured into the typed body
    pub globals_read: BTreeSet<String>,
}

/// Decides eligibility against a host's function definitions and constants
pub struct Analyzer<'a> {
    source: &'a dyn FunctionSource,
}

impl<'a> Analyzer<'a> {
    pub fn new(source: &'a dyn FunctionSource) -> Self {
        Self { source }
    }

    /// Checks that do not depend on argument kinds: the `no-compile` opt-out and every
    /// statement or expression form that is never compiled
    pub fn screen(&self, unit: &FunctionUnit) -> Result<(), Rejection> {
        if !unit.directives.should_compile() {
            return Err(Rejection::OptOut);
        }
        scope::screen(&unit.def).map_err(Rejection::Unsupported)
    }

    /// Full analysis of `unit` specialized for `arg_kinds`
    pub fn analyze(&self, unit: &FunctionUnit, arg_kinds: &[ValueKind]) -> Analysis {
        let mut dependencies = BTreeSet::from([unit.name.clone()]);
        if let Err(rejection) = self.screen(unit) {
            return Analysis {
                verdict: EligibilityVerdict::Rejected(rejection),
                dependencies,
                globals_read: BTreeSet::new(),
            };
        }

        let mut specializer = Specializer::new(self.source);
        let result = specializer
            .specialize_root(unit, arg_kinds)
            .and_then(|()| specializer.finish());
        dependencies.extend(specializer.dependencies);
        let verdict = match result {
            Ok(mut body) => {
                for function in &mut body.functions {
                    fold::fold_function(function);
                }
                EligibilityVerdict::Eligible(body)
            }
            Err(err) => EligibilityVerdict::Rejected(Rejection::Unsupported(err)),
        };
        Analysis {
            verdict,
            dependencies,
            globals_read: specializer.globals,
        }
    }
}

struct SpecSlot {
    name: String,
    arg_kinds: Vec<ValueKind>,
    ret: Option<ReturnKind>,
    guess: Option<ReturnKind>,
    guess_used: bool,
    function: Option<TypedFunction>,
}

/// Builds the specialization closure of one root function
pub(crate) struct Specializer<'a> {
    pub(crate) source: &'a dyn FunctionSource,
    slots: Vec<SpecSlot>,
    keys: HashMap<(String, Vec<ValueKind>), FuncIndex>,
    pub(crate) dependencies: BTreeSet<String>,
    pub(crate) globals: BTreeSet<String>,
}

impl<'a> Specializer<'a> {
    fn new(source: &'a dyn FunctionSource) -> Self {
        Self {
            source,
            slots: Vec::new(),
            keys: HashMap::new(),
            dependencies: BTreeSet::new(),
            globals: BTreeSet::new(),
        }
    }

    fn specialize_root(&mut self, unit: &FunctionUnit, arg_kinds: &[ValueKind]) -> Result<(), AdrenalineError> {
        if unit.arity() != arg_kinds.len() {
            return Err(AdrenalineError::unsupported(
                &unit.name,
                "call with missing arguments",
                format!("{} parameters, {} arguments", unit.arity(), arg_kinds.len()),
                unit.def.span,
            ));
        }
        self.build(&unit.name, unit.def.as_ref(), arg_kinds.to_vec(), unit.directives)
            .map(|_| ())
    }

    /// The specialization of `name` for `arg_kinds` and its return kind, analysing it on
    /// first request
    ///
    /// A request for a specialization that is still being analysed (recursion) answers with
    /// the return kind currently assumed for it; the assumption is verified when the
    /// specialization completes.
    pub(crate) fn specialize(
        &mut self,
        name: &str,
        arg_kinds: Vec<ValueKind>,
        span: Span,
    ) -> Result<(FuncIndex, ReturnKind), AdrenalineError> {
        let key = (name.to_string(), arg_kinds);
        if let Some(&index) = self.keys.get(&key) {
            let slot = &mut self.slots[index.index()];
            if let Some(ret) = slot.ret {
                return Ok((index, ret));
            }
            slot.guess_used = true;
            if let Some(guess) = slot.guess {
                return Ok((index, guess));
            }
        }
        let (name, arg_kinds) = key;

        let Some(def) = self.source.function(&name) else {
            return Err(AdrenalineError::unsupported(
                &name,
                "unknown function",
                "not a module-level function",
                span,
            ));
        };
        if def.params.len() != arg_kinds.len() {
            return Err(AdrenalineError::unsupported(
                &name,
                "call with missing arguments",
                format!("{} parameters, {} arguments", def.params.len(), arg_kinds.len()),
                span,
            ));
        }
        let directives = directive::extract(&def.documentation()).directives;
        if !directives.should_compile() {
            return Err(AdrenalineError::unsupported(
                &name,
                "no-compile function",
                "directive opt-out",
                def.span,
            ));
        }
        scope::screen(&def)?;
        self.build(&name, def.as_ref(), arg_kinds, directives)
    }

    fn build(
        &mut self,
        name: &str,
        def: &crate::ast::FunctionDef,
        arg_kinds: Vec<ValueKind>,
        directives: directive::DirectiveSet,
    ) -> Result<(FuncIndex, ReturnKind), AdrenalineError> {
        self.dependencies.insert(name.to_string());
        let index = FuncIndex(self.slots.len() as u32);
        self.keys.insert((name.to_string(), arg_kinds.clone()), index);
        self.slots.push(SpecSlot {
            name: name.to_string(),
            arg_kinds: arg_kinds.clone(),
            ret: None,
            guess: None,
            guess_used: false,
            function: None,
        });
        let mark = self.slots.len();

        let mut first_error = None;
        for candidate in RECURSIVE_RETURN_CANDIDATES {
            {
                let slot = &mut self.slots[index.index()];
                slot.guess = Some(candidate);
                slot.guess_used = false;
            }
            let result = translate::translate(self, def, &arg_kinds, directives);
            let used = self.slots[index.index()].guess_used;
            match result {
                Ok(function) if !used || function.ret == candidate => {
                    let ret = function.ret;
                    let slot = &mut self.slots[index.index()];
                    slot.ret = Some(ret);
                    slot.function = Some(function);
                    return Ok((index, ret));
                }
                Ok(_) => {}
                Err(err) if !used => {
                    self.abandon(index);
                    return Err(err);
                }
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
            self.truncate(mark);
        }

        self.abandon(index);
        Err(first_error.unwrap_or_else(|| {
            AdrenalineError::inconsistent(
                name,
                "inconsistent return type: the recursive result has no consistent type",
                def.span,
            )
        }))
    }

    /// Forget specializations created after `mark`
    fn truncate(&mut self, mark: usize) {
        self.slots.truncate(mark);
        self.keys.retain(|_, index| index.index() < mark);
    }

    /// Forget a failed specialization and everything created after it
    fn abandon(&mut self, index: FuncIndex) {
        self.truncate(index.index());
    }

    fn finish(&mut self) -> Result<TypedBody, AdrenalineError> {
        let mut functions = Vec::with_capacity(self.slots.len());
        for slot in self.slots.drain(..) {
            let function = slot.function.ok_or_else(|| {
                AdrenalineError::inconsistent(
                    &slot.name,
                    format!("specialization for {:?} never completed", slot.arg_kinds),
                    Span::synthetic(),
                )
            })?;
            functions.push(function);
        }
        self.keys.clear();
        Ok(TypedBody { functions })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{FunctionSource, HostProgram};
    use crate::testutil::{float, int, int_array};
    use typed::{Purity, TExprKind, TStmt};

    fn analyze(source: &str, name: &str, kinds: &[ValueKind]) -> Analysis {
        let program = HostProgram::from_source(source, 1000).unwrap();
        let unit = FunctionUnit::new(program.function(name).unwrap());
        Analyzer::new(&program).analyze(&unit, kinds)
    }

    fn eligible(source: &str, name: &str, kinds: &[ValueKind]) -> TypedBody {
        match analyze(source, name, kinds).verdict {
            EligibilityVerdict::Eligible(body) => body,
            EligibilityVerdict::Rejected(r) => panic!("expected eligible, got {r}"),
        }
    }

    fn rejected(source: &str, name: &str, kinds: &[ValueKind]) -> Rejection {
        match analyze(source, name, kinds).verdict {
            EligibilityVerdict::Rejected(r) => r,
            EligibilityVerdict::Eligible(_) => panic!("expected rejection"),
        }
    }

    const SUM_RANGE: &str = "\
def sum_range(n):
    total = 0
    for i in range(n):
        total += i
    return total
";

    #[test]
    fn sum_range_is_eligible() {
        let body = eligible(SUM_RANGE, "sum_range", &[int()]);
        assert_eq!(body.root().ret, ReturnKind::Scalar(NumType::Int));
        assert_eq!(body.purity(), Purity::Pure);
        assert_eq!(body.functions.len(), 1);
    }

    #[test]
    fn mapping_access_is_rejected() {
        let source = "def get_count(data):\n    return data.get(\"count\", 0)\n";
        let program = HostProgram::from_source(source, 1000).unwrap();
        let unit = FunctionUnit::new(program.function("get_count").unwrap());
        let rejection = Analyzer::new(&program).screen(&unit).unwrap_err();
        assert_eq!(rejection.kind(), Some(ErrorKind::UnsupportedConstruct));
    }

    #[test]
    fn no_compile_opts_out_without_inspection() {
        let source = "def f(x):\n    # #adrenaline:no-compile\n    return x\n";
        let r = rejected(source, "f", &[int()]);
        assert_eq!(r, Rejection::OptOut);
        assert_eq!(r.to_string(), "directive opt-out");
    }

    #[test]
    fn empty_body_is_eligible() {
        let body = eligible("def f():\n    pass\n", "f", &[]);
        assert_eq!(body.root().ret, ReturnKind::None);
    }

    #[test]
    fn mixed_returns_are_inconsistent() {
        let source = "def f(x):\n    if x > 0:\n        return 1\n    return 2.5\n";
        let r = rejected(source, "f", &[int()]);
        assert_eq!(r.kind(), Some(ErrorKind::InconsistentType));
        assert!(r.to_string().contains("inconsistent return type"));

        let source = "def g(x):\n    if x > 0:\n        return 1\n";
        assert_eq!(
            rejected(source, "g", &[int()]).kind(),
            Some(ErrorKind::InconsistentType)
        );
    }

    #[test]
    fn local_changing_type_is_inconsistent() {
        let source = "def f(x):\n    y = 1\n    y = 2.0\n    return y\n";
        assert_eq!(
            rejected(source, "f", &[int()]).kind(),
            Some(ErrorKind::InconsistentType)
        );
    }

    #[test]
    fn possibly_unbound_read_is_rejected() {
        let source = "def f(n):\n    for i in range(n):\n        pass\n    return i\n";
        let r = rejected(source, "f", &[int()]);
        assert_eq!(r.kind(), Some(ErrorKind::UnsupportedConstruct));

        let source = "def g(n):\n    if n > 0:\n        y = 1\n    else:\n        y = 2\n    return y\n";
        eligible(source, "g", &[int()]);
    }

    #[test]
    fn recursion_reaches_a_fixpoint() {
        let source = "def fib(n):\n    if n < 2:\n        return n\n    return fib(n - 1) + fib(n - 2)\n";
        let body = eligible(source, "fib", &[int()]);
        assert_eq!(body.root().ret, ReturnKind::Scalar(NumType::Int));
        assert!(body.is_recursive(FuncIndex::ROOT));

        let source = "def half(n):\n    if n <= 0:\n        return 1.0\n    return half(n - 1) / 2\n";
        let body = eligible(source, "half", &[int()]);
        assert_eq!(body.root().ret, ReturnKind::Scalar(NumType::Float));
    }

    #[test]
    fn mutual_recursion() {
        let source = "\
def is_even(n):
    if n == 0:
        return True
    return is_odd(n - 1)

def is_odd(n):
    if n == 0:
        return False
    return is_even(n - 1)
";
        let analysis = analyze(source, "is_even", &[int()]);
        let EligibilityVerdict::Eligible(body) = analysis.verdict else {
            panic!("expected eligible");
        };
        assert_eq!(body.functions.len(), 2);
        assert_eq!(body.root().ret, ReturnKind::Scalar(NumType::Bool));
        assert!(analysis.dependencies.contains("is_odd"));
    }

    #[test]
    fn ineligible_callee_rejects_caller() {
        let source = "\
def helper(x):
    print(x)
    return x

def f(x):
    return helper(x) + 1
";
        let r = rejected(source, "f", &[int()]);
        assert_eq!(r.construct(), Some("call to helper()"));
    }

    #[test]
    fn constants_are_captured() {
        let source = "SCALE = 3\n\ndef f(x):\n    return x * SCALE\n";
        let analysis = analyze(source, "f", &[int()]);
        assert!(analysis.globals_read.contains("SCALE"));
        let EligibilityVerdict::Eligible(body) = analysis.verdict else {
            panic!("expected eligible");
        };
        assert_eq!(body.purity(), Purity::ReadsGlobal);
    }

    #[test]
    fn array_stores_mark_mutation() {
        let source = "def scale(a: list[float], k: float):\n    for i in range(len(a)):\n        a[i] = a[i] * k\n";
        let body = eligible(source, "scale", &[ValueKind::Array(NumType::Float), float()]);
        assert_eq!(body.purity(), Purity::MutatesContainer);

        let source = "def bad(a):\n    a[0] = 1.5\n";
        assert_eq!(
            rejected(source, "bad", &[int_array()]).kind(),
            Some(ErrorKind::InconsistentType)
        );
    }

    #[test]
    fn stores_through_callees_are_attributed_to_root_params() {
        let source = "\
def put(dst: list[float], i: int):
    dst[i] = 2.0
    return i

def f(src: list[float], dst: list[float]):
    n = put(dst, 0)
    return src[n]
";
        let arrays = [ValueKind::Array(NumType::Float), ValueKind::Array(NumType::Float)];
        let body = eligible(source, "f", &arrays);
        assert_eq!(body.stored_params(), vec![1]);

        let body = eligible("def g(a: list[float]):\n    return a[0]\n", "g", &arrays[..1]);
        assert!(body.stored_params().is_empty());
    }

    #[test]
    fn mixed_arithmetic_promotes() {
        let body = eligible("def f(a, b):\n    return a + b\n", "f", &[int(), float()]);
        let TStmt::Return(Some(typed::TReturn::Scalar(e))) = &body.root().body[0] else {
            panic!("expected return");
        };
        assert_eq!(e.ty, NumType::Float);
        let TExprKind::Binary(_, left, _) = &e.kind else {
            panic!("expected binary");
        };
        assert!(matches!(left.kind, TExprKind::Cast(typed::CastOp::IntToFloat, _)));
    }

    #[test]
    fn bool_arithmetic_and_variable_int_power_are_rejected() {
        assert!(matches!(
            analyze("def f(a):\n    return (a > 1) + 1\n", "f", &[int()]).verdict,
            EligibilityVerdict::Rejected(_)
        ));
        assert!(matches!(
            analyze("def f(a, b):\n    return a ** b\n", "f", &[int(), int()]).verdict,
            EligibilityVerdict::Rejected(_)
        ));
        eligible("def f(a):\n    return a ** 2\n", "f", &[int()]);
    }
}
