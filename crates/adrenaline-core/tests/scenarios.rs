//! End-to-end scenarios: whole programs loaded into a runtime and called through the dispatcher

use adrenaline_core::analysis::typed::{NumType, ValueKind};
use adrenaline_core::opt::pass;
use adrenaline_core::testutil::{call_float, call_int, collecting_runtime, eager_config, eager_runtime};
use adrenaline_core::{
    AdrenalineConfig, DiagnosticKind, DispatchState, ErrorKind, FallbackReason, Rejection, Runtime, Value, Verdict,
};

const BASIC: &str = r#"
def fibonacci(n):
    """Calculate fibonacci number"""
    if n <= 1:
        return n
    return fibonacci(n - 1) + fibonacci(n - 2)


def sum_range(n):
    """Sum numbers 0 to n - 1"""
    total = 0
    for i in range(n):
        total += i
    return total


def sum_range_simd(n):
    """
    #adrenaline:simd
    """
    total = 0
    for i in range(n):
        total += i
    return total


def matrix_multiply(size):
    """Matrix multiplication style double loop"""
    # #adrenaline:hot
    # #adrenaline:simd
    # #adrenaline:parallel
    result = 0
    for i in range(size):
        for j in range(size):
            result += i * j
    return result


if __name__ == "__main__":
    print("Fibonacci(10):", fibonacci(10))
    print("Sum(1000):", sum_range(1000))
    print("Matrix multiply(100):", matrix_multiply(100))
"#;

const FALLBACK: &str = r#"
def use_unsupported_feature():
    """This function uses mapping access"""
    data = {"key": "value", "count": 42}
    return data.get("count", 0)


def opted_out():
    """
    #adrenaline:no-compile
    """
    data = {"count": 42}
    return data.get("count", 0)


def regular_function(x):
    return x * x + 2 * x + 1


def compute_factorial(n):
    if n <= 1:
        return 1
    return n * compute_factorial(n - 1)
"#;

const DIRECTIVES: &str = r#"
def hot_compute(iterations):
    """
    #adrenaline:hot
    #adrenaline:inline
    Compute-intensive loop
    """
    result = 0
    for i in range(iterations):
        result += (i * i) % 97
    return result


def numeric_loop(count):
    """
    #adrenaline:simd
    """
    total = 0.0
    for i in range(count):
        total += float(i) * 1.5
    return total


def process_list(items):
    """
    #adrenaline:parallel
    """
    result = 0
    for item in items:
        result += item * 2
    return result
"#;

fn state(runtime: &Runtime, name: &str) -> Option<DispatchState> {
    let id = runtime.dispatcher().resolve(name)?;
    runtime.dispatcher().state(id)
}

#[test]
fn test_sum_range_scalar_and_simd() {
    let runtime = eager_runtime(BASIC).unwrap();
    for name in ["sum_range", "sum_range_simd"] {
        // first call interprets and compiles, second runs native code
        assert_eq!(call_int(&runtime, name, vec![Value::Int(1000)]).unwrap(), 499_500);
        assert_eq!(state(&runtime, name), Some(DispatchState::Compiled));
        assert_eq!(call_int(&runtime, name, vec![Value::Int(1000)]).unwrap(), 499_500);
    }

    let dispatcher = runtime.dispatcher();
    let simd = dispatcher.artifact(dispatcher.resolve("sum_range_simd").unwrap()).unwrap();
    assert_eq!(simd.report.applied(pass::SIMD), 1);
    let scalar = dispatcher.artifact(dispatcher.resolve("sum_range").unwrap()).unwrap();
    assert_eq!(scalar.report.applied(pass::SIMD), 0);
    assert_eq!(scalar.arg_kinds(), &[ValueKind::Scalar(NumType::Int)]);

    let stats = dispatcher.stats(dispatcher.resolve("sum_range").unwrap()).unwrap();
    assert_eq!(stats.compiled_calls, 1);
    assert_eq!(stats.deopts, 0);
}

#[test]
fn test_mapping_access_is_rejected_and_interpreted() {
    let (runtime, sink) = collecting_runtime(FALLBACK, eager_config()).unwrap();
    let dispatcher = runtime.dispatcher();
    let id = dispatcher.resolve("use_unsupported_feature").unwrap();

    let Some(Verdict::Fallback(FallbackReason::Rejected(rejection))) = dispatcher.verdict(id) else {
        panic!("use_unsupported_feature should be rejected");
    };
    assert_eq!(rejection.kind(), Some(ErrorKind::UnsupportedConstruct));
    assert!(rejection.construct().is_some());

    for _ in 0..3 {
        assert_eq!(call_int(&runtime, "use_unsupported_feature", Vec::new()).unwrap(), 42);
    }
    let stats = dispatcher.stats(id).unwrap();
    assert_eq!(stats.interpreted_calls, 3);
    assert_eq!(stats.compiled_calls, 0);
    assert_eq!(stats.compile_attempts, 0);
    assert_eq!(sink.matching("use_unsupported_feature", DiagnosticKind::Rejected).len(), 1);
}

#[test]
fn test_no_compile_short_circuits() {
    let runtime = eager_runtime(FALLBACK).unwrap();
    let dispatcher = runtime.dispatcher();
    let id = dispatcher.resolve("opted_out").unwrap();
    assert_eq!(
        dispatcher.verdict(id),
        Some(Verdict::Fallback(FallbackReason::Rejected(Rejection::OptOut)))
    );
    assert_eq!(call_int(&runtime, "opted_out", Vec::new()).unwrap(), 42);
}

#[test]
fn test_matrix_multiply_hot_simd_parallel() {
    let runtime = eager_runtime(BASIC).unwrap();
    let dispatcher = runtime.dispatcher();
    let id = dispatcher.resolve("matrix_multiply").unwrap();

    // `hot` with a statically known `range(size)` parameter compiles at registration
    assert_eq!(dispatcher.state(id), Some(DispatchState::Compiled));
    let artifact = dispatcher.artifact(id).unwrap();
    assert_eq!(artifact.report.applied(pass::PARALLEL), 1);

    assert_eq!(call_int(&runtime, "matrix_multiply", vec![Value::Int(100)]).unwrap(), 24_502_500);
    assert_eq!(dispatcher.stats(id).unwrap().compiled_calls, 1);
}

#[test]
fn test_matrix_multiply_background_compile() {
    let runtime = Runtime::from_source(BASIC, AdrenalineConfig::default()).unwrap();
    // before or after compilation finishes, the answer is the same
    assert_eq!(call_int(&runtime, "matrix_multiply", vec![Value::Int(100)]).unwrap(), 24_502_500);
    runtime.dispatcher().wait_idle();
    assert_eq!(state(&runtime, "matrix_multiply"), Some(DispatchState::Compiled));
    assert_eq!(call_int(&runtime, "matrix_multiply", vec![Value::Int(100)]).unwrap(), 24_502_500);
}

#[test]
fn test_recursive_functions_compile() {
    let runtime = eager_runtime(BASIC).unwrap();
    assert_eq!(call_int(&runtime, "fibonacci", vec![Value::Int(10)]).unwrap(), 55);
    assert_eq!(state(&runtime, "fibonacci"), Some(DispatchState::Compiled));
    assert_eq!(call_int(&runtime, "fibonacci", vec![Value::Int(20)]).unwrap(), 6765);

    let runtime = eager_runtime(FALLBACK).unwrap();
    assert_eq!(call_int(&runtime, "compute_factorial", vec![Value::Int(10)]).unwrap(), 3_628_800);
    assert_eq!(call_int(&runtime, "compute_factorial", vec![Value::Int(20)]).unwrap(), 2_432_902_008_176_640_000);
    assert_eq!(call_int(&runtime, "regular_function", vec![Value::Int(5)]).unwrap(), 36);
}

#[test]
fn test_factorial_overflow_matches_host() {
    let runtime = eager_runtime(FALLBACK).unwrap();
    call_int(&runtime, "compute_factorial", vec![Value::Int(3)]).unwrap();
    assert_eq!(state(&runtime, "compute_factorial"), Some(DispatchState::Compiled));
    let err = runtime.call("compute_factorial", vec![Value::Int(21)]).unwrap_err();
    assert_eq!(err.kind_name(), "OverflowError");
}

#[test]
fn test_directive_examples() {
    let runtime = eager_runtime(DIRECTIVES).unwrap();
    let expected: i64 = (0..10_000_i64).map(|i| (i * i) % 97).sum();
    assert_eq!(call_int(&runtime, "hot_compute", vec![Value::Int(10_000)]).unwrap(), expected);
    assert_eq!(call_int(&runtime, "hot_compute", vec![Value::Int(10_000)]).unwrap(), expected);

    let numeric = (0..5000).map(|i| f64::from(i) * 1.5).sum::<f64>();
    call_float(&runtime, "numeric_loop", vec![Value::Int(5000)]).unwrap();
    let compiled = call_float(&runtime, "numeric_loop", vec![Value::Int(5000)]).unwrap();
    // every partial sum is an exact multiple of 0.5 below 2^53
    assert_eq!(compiled, numeric);

    let items = || Value::int_list(&[1, 2, 3, 4, 5, 10, 20]);
    assert_eq!(call_int(&runtime, "process_list", vec![items()]).unwrap(), 90);
    assert_eq!(state(&runtime, "process_list"), Some(DispatchState::Compiled));
    assert_eq!(call_int(&runtime, "process_list", vec![items()]).unwrap(), 90);
}

#[test]
fn test_main_block_routes_through_dispatcher() {
    let runtime = eager_runtime(BASIC).unwrap();
    runtime.run_main().unwrap();
    assert_eq!(
        runtime.take_output(),
        "Fibonacci(10): 55\nSum(1000): 499500\nMatrix multiply(100): 24502500\n"
    );
    let dispatcher = runtime.dispatcher();
    let fib = dispatcher.stats(dispatcher.resolve("fibonacci").unwrap()).unwrap();
    // recursive calls made by interpreted code come back through the dispatcher
    assert!(fib.calls > 1);
}
