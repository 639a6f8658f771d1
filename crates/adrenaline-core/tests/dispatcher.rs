//! Dispatcher behavior under concurrent callers

use std::sync::{Arc, Once};
use std::thread;

use tracing_subscriber::EnvFilter;

use adrenaline_core::testutil::{call_int, collecting_runtime, eager_config};
use adrenaline_core::{
    AdrenalineConfig, DiagnosticKind, DispatchState, ExecutionOverride, FallbackReason, Runtime, Value, Verdict,
};

const SOURCE: &str = r#"
def triangle(n):
    total = 0
    for i in range(n):
        total += i
    return total

def hot_loop(n):
    # #adrenaline:hot
    total = 0
    for i in range(n):
        total += i * 3
    return total

def lookup(n):
    table = {"a": n}
    return table.get("a", 0)

def caller(n):
    return triangle(n) + lookup(n)

def odd(x):
    return x * 2 + 1

def typo(n):
    # #adrenaline:simdd
    return n
"#;

/// Route dispatcher events to the test output; `RUST_LOG=adrenaline_core=debug` shows them
fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

fn background(workers: usize) -> Runtime {
    init_logging();
    let config = AdrenalineConfig::default().with_compile_workers(workers);
    Runtime::from_source(SOURCE, config).unwrap()
}

#[test]
fn test_racing_callers_compile_once() {
    let runtime = Arc::new(background(4));
    let handles: Vec<_> = (0..16)
        .map(|t| {
            let runtime = Arc::clone(&runtime);
            thread::spawn(move || {
                (0..50)
                    .map(|k| {
                        let n = (t * 50 + k) % 200;
                        let got = call_int(&runtime, "triangle", vec![Value::Int(n)]).unwrap();
                        assert_eq!(got, n * (n - 1) / 2);
                    })
                    .count()
            })
        })
        .collect();
    let calls: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    runtime.dispatcher().wait_idle();

    let dispatcher = runtime.dispatcher();
    let id = dispatcher.resolve("triangle").unwrap();
    assert_eq!(dispatcher.state(id), Some(DispatchState::Compiled));
    let stats = dispatcher.stats(id).unwrap();
    assert_eq!(stats.calls, calls as u64);
    assert_eq!(stats.compile_attempts, 1);
    assert_eq!(stats.compiled_calls + stats.interpreted_calls, stats.calls);
}

#[test]
fn test_compile_is_idempotent() {
    let runtime = background(2);
    for n in [5, 6, 7] {
        call_int(&runtime, "triangle", vec![Value::Int(n)]).unwrap();
    }
    runtime.dispatcher().wait_idle();
    let id = runtime.dispatcher().resolve("triangle").unwrap();
    let first = runtime.dispatcher().artifact(id).unwrap();
    for n in [8, 9] {
        call_int(&runtime, "triangle", vec![Value::Int(n)]).unwrap();
    }
    runtime.dispatcher().wait_idle();
    let second = runtime.dispatcher().artifact(id).unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(runtime.dispatcher().stats(id).unwrap().compile_attempts, 1);
}

#[test]
fn test_fallback_is_never_retried() {
    let runtime = Arc::new(background(2));
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let runtime = Arc::clone(&runtime);
            thread::spawn(move || {
                for n in 0..25 {
                    assert_eq!(call_int(&runtime, "lookup", vec![Value::Int(n)]).unwrap(), n);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    runtime.dispatcher().wait_idle();
    let id = runtime.dispatcher().resolve("lookup").unwrap();
    assert!(matches!(
        runtime.dispatcher().verdict(id),
        Some(Verdict::Fallback(FallbackReason::Rejected(_)))
    ));
    let stats = runtime.dispatcher().stats(id).unwrap();
    assert_eq!(stats.compile_attempts, 0);
    assert_eq!(stats.interpreted_calls, 200);
}

#[test]
fn test_callee_rejection_rejects_caller_without_affecting_siblings() {
    let runtime = Runtime::from_source(SOURCE, eager_config()).unwrap();
    assert_eq!(call_int(&runtime, "caller", vec![Value::Int(10)]).unwrap(), 55);
    let dispatcher = runtime.dispatcher();
    let caller = dispatcher.resolve("caller").unwrap();
    assert_eq!(dispatcher.state(caller), Some(DispatchState::Fallback));
    // triangle was reached through the interpreted caller and compiled on its own
    let triangle = dispatcher.resolve("triangle").unwrap();
    assert_eq!(dispatcher.state(triangle), Some(DispatchState::Compiled));
    assert_eq!(call_int(&runtime, "caller", vec![Value::Int(10)]).unwrap(), 55);
}

#[test]
fn test_hot_function_compiles_without_a_call() {
    let runtime = background(1);
    runtime.dispatcher().wait_idle();
    let id = runtime.dispatcher().resolve("hot_loop").unwrap();
    assert_eq!(runtime.dispatcher().state(id), Some(DispatchState::Compiled));
    assert_eq!(runtime.dispatcher().stats(id).unwrap().calls, 0);
    assert_eq!(call_int(&runtime, "hot_loop", vec![Value::Int(10)]).unwrap(), 135);
    assert_eq!(runtime.dispatcher().stats(id).unwrap().compiled_calls, 1);
}

#[test]
fn test_kind_mismatch_interprets_that_call_only() {
    let runtime = Runtime::from_source(SOURCE, eager_config()).unwrap();
    call_int(&runtime, "odd", vec![Value::Int(1)]).unwrap();
    let id = runtime.dispatcher().resolve("odd").unwrap();
    assert_eq!(runtime.dispatcher().state(id), Some(DispatchState::Compiled));

    let float = runtime.call("odd", vec![Value::Float(1.5)]).unwrap();
    assert!(matches!(float, Value::Float(f) if f == 4.0));
    assert_eq!(runtime.dispatcher().state(id), Some(DispatchState::Compiled));
    assert_eq!(call_int(&runtime, "odd", vec![Value::Int(4)]).unwrap(), 9);

    let stats = runtime.dispatcher().stats(id).unwrap();
    assert_eq!(stats.compiled_calls, 1);
    assert_eq!(stats.interpreted_calls, 2);
}

#[test]
fn test_interpret_all_and_compile_all() {
    let config = eager_config().with_override(ExecutionOverride::InterpretAll);
    let runtime = Runtime::from_source(SOURCE, config).unwrap();
    for _ in 0..3 {
        call_int(&runtime, "hot_loop", vec![Value::Int(10)]).unwrap();
    }
    let id = runtime.dispatcher().resolve("hot_loop").unwrap();
    assert_eq!(runtime.dispatcher().stats(id).unwrap().compiled_calls, 0);

    let mut config = eager_config().with_override(ExecutionOverride::CompileAll);
    config.compile_threshold = 1000;
    let runtime = Runtime::from_source(SOURCE, config).unwrap();
    let id = runtime.dispatcher().resolve("triangle").unwrap();
    // `range(n)` gives the parameter kind, so no call is needed
    assert_eq!(runtime.dispatcher().state(id), Some(DispatchState::Compiled));
}

#[test]
fn test_unknown_directive_is_reported() {
    let (runtime, sink) = collecting_runtime(SOURCE, eager_config()).unwrap();
    assert_eq!(sink.matching("typo", DiagnosticKind::UnknownDirective).len(), 1);
    assert_eq!(call_int(&runtime, "typo", vec![Value::Int(4)]).unwrap(), 4);
}

#[test]
fn test_hot_functions_profile() {
    let runtime = Runtime::from_source(SOURCE, eager_config()).unwrap();
    for n in 0..5 {
        call_int(&runtime, "odd", vec![Value::Int(n)]).unwrap();
    }
    call_int(&runtime, "triangle", vec![Value::Int(3)]).unwrap();
    let hot = runtime.dispatcher().hot_functions(2);
    assert_eq!(hot.len(), 1);
    assert_eq!(hot[0].0, "odd");
    assert_eq!(hot[0].1.calls, 5);
}
