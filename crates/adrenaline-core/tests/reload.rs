//! Reloading source invalidates exactly what changed

use adrenaline_core::testutil::{call_int, collecting_runtime, eager_config, eager_runtime};
use adrenaline_core::{DiagnosticKind, DispatchState, Runtime, Value};

const V1: &str = r#"
SCALE = 3

def helper(x):
    return x + 1

def uses_helper(n):
    total = 0
    for i in range(n):
        total += helper(i)
    return total

def scaled(n):
    return n * SCALE

def untouched(n):
    return n - 1

def removed_later(n):
    return n
"#;

const V2: &str = r#"
SCALE = 3

def helper(x):
    return x + 2

def uses_helper(n):
    total = 0
    for i in range(n):
        total += helper(i)
    return total

def scaled(n):
    return n * SCALE

def untouched(n):
    return n - 1

def added(n):
    return n * 100
"#;

const V3: &str = r#"
SCALE = 5

def helper(x):
    return x + 2

def uses_helper(n):
    total = 0
    for i in range(n):
        total += helper(i)
    return total

def scaled(n):
    return n * SCALE

def untouched(n):
    return n - 1

def added(n):
    return n * 100
"#;

fn state(runtime: &Runtime, name: &str) -> Option<DispatchState> {
    let dispatcher = runtime.dispatcher();
    dispatcher.state(dispatcher.resolve(name)?)
}

fn warm(runtime: &Runtime) {
    for name in ["uses_helper", "scaled", "untouched", "helper"] {
        call_int(runtime, name, vec![Value::Int(4)]).unwrap();
        assert_eq!(state(runtime, name), Some(DispatchState::Compiled), "{name}");
    }
}

#[test]
fn test_changed_callee_invalidates_its_callers() {
    let (runtime, sink) = collecting_runtime(V1, eager_config()).unwrap();
    warm(&runtime);
    assert_eq!(call_int(&runtime, "uses_helper", vec![Value::Int(4)]).unwrap(), 10);

    let summary = runtime.reload(V2).unwrap();
    assert_eq!(summary.changed, ["helper"]);
    assert_eq!(summary.added, ["added"]);
    assert_eq!(summary.removed, ["removed_later"]);
    assert!(summary.invalidated.contains(&"helper".to_string()));
    assert!(summary.invalidated.contains(&"uses_helper".to_string()));
    assert!(!summary.invalidated.contains(&"untouched".to_string()));
    assert!(!summary.invalidated.contains(&"scaled".to_string()));

    assert_eq!(state(&runtime, "untouched"), Some(DispatchState::Compiled));
    assert_eq!(state(&runtime, "uses_helper"), Some(DispatchState::Unanalyzed));
    assert!(sink.count(DiagnosticKind::Invalidated) >= 2);

    // new source is used by both paths
    assert_eq!(call_int(&runtime, "uses_helper", vec![Value::Int(4)]).unwrap(), 14);
    assert_eq!(call_int(&runtime, "uses_helper", vec![Value::Int(4)]).unwrap(), 14);
    assert_eq!(state(&runtime, "uses_helper"), Some(DispatchState::Compiled));
    assert_eq!(call_int(&runtime, "added", vec![Value::Int(2)]).unwrap(), 200);
    assert!(runtime.call("removed_later", vec![Value::Int(1)]).is_err());
}

#[test]
fn test_changed_constant_invalidates_readers() {
    let runtime = eager_runtime(V2).unwrap();
    warm(&runtime);
    assert_eq!(call_int(&runtime, "scaled", vec![Value::Int(2)]).unwrap(), 6);

    let summary = runtime.reload(V3).unwrap();
    assert!(summary.changed.is_empty());
    assert_eq!(summary.invalidated, ["scaled"]);
    assert_eq!(call_int(&runtime, "scaled", vec![Value::Int(2)]).unwrap(), 10);
    assert_eq!(call_int(&runtime, "scaled", vec![Value::Int(2)]).unwrap(), 10);
    assert_eq!(state(&runtime, "untouched"), Some(DispatchState::Compiled));
}

#[test]
fn test_identical_reload_keeps_everything() {
    let runtime = eager_runtime(V1).unwrap();
    warm(&runtime);
    let summary = runtime.reload(V1).unwrap();
    assert!(summary.invalidated.is_empty());
    for name in ["uses_helper", "scaled", "untouched", "helper"] {
        assert_eq!(state(&runtime, name), Some(DispatchState::Compiled), "{name}");
    }
}

#[test]
fn test_failed_reload_changes_nothing() {
    let runtime = eager_runtime(V1).unwrap();
    warm(&runtime);
    assert!(runtime.reload("def broken(:\n").is_err());
    assert_eq!(state(&runtime, "helper"), Some(DispatchState::Compiled));
    assert_eq!(call_int(&runtime, "helper", vec![Value::Int(1)]).unwrap(), 2);
}

#[test]
fn test_new_generation_after_fallback() {
    let source = "def f(n):\n    d = {\"n\": n}\n    return d.get(\"n\", 0)\n";
    let runtime = eager_runtime(source).unwrap();
    assert_eq!(state(&runtime, "f"), Some(DispatchState::Fallback));
    runtime.reload("def f(n):\n    return n + 1\n").unwrap();
    assert_eq!(call_int(&runtime, "f", vec![Value::Int(1)]).unwrap(), 2);
    assert_eq!(state(&runtime, "f"), Some(DispatchState::Compiled));
    let id = runtime.dispatcher().resolve("f").unwrap();
    assert_eq!(runtime.dispatcher().generation(id), Some(1));
}
