//! Test utilities for Adrenaline
//!
//! This module provides common helpers for tests and benchmarks: argument kinds,
//! runtimes in a known configuration, and typed result extraction.

use std::sync::Arc;

use crate::analysis::typed::{NumType, ValueKind};
use crate::config::AdrenalineConfig;
use crate::diagnostics::CollectingSink;
use crate::host::{HostProgram, Value};
use crate::runtime::Runtime;

/// Result type for test helpers
pub type TestResult<T> = Result<T, String>;

#[must_use]
pub const fn int() -> ValueKind {
    ValueKind::Scalar(NumType::Int)
}

#[must_use]
pub const fn float() -> ValueKind {
    ValueKind::Scalar(NumType::Float)
}

#[must_use]
pub const fn int_array() -> ValueKind {
    ValueKind::Array(NumType::Int)
}

#[must_use]
pub const fn float_array() -> ValueKind {
    ValueKind::Array(NumType::Float)
}

/// Configuration that compiles on the calling thread at the first call
#[must_use]
pub fn eager_config() -> AdrenalineConfig {
    AdrenalineConfig::default()
        .with_background_compile(false)
        .with_compile_threshold(1)
}

/// Load `source` into a runtime that compiles synchronously
///
/// # Errors
/// Returns error if the source fails to load
pub fn eager_runtime(source: &str) -> TestResult<Runtime> {
    Runtime::from_source(source, eager_config()).map_err(|e| format!("Load error: {e}"))
}

/// Load `source` with `config`, collecting diagnostics
///
/// # Errors
/// Returns error if the configuration is invalid or the source fails to load
pub fn collecting_runtime(source: &str, config: AdrenalineConfig) -> TestResult<(Runtime, Arc<CollectingSink>)> {
    let sink = Arc::new(CollectingSink::new());
    let runtime = Runtime::with_sink(source, config, sink.clone()).map_err(|e| format!("Load error: {e}"))?;
    Ok((runtime, sink))
}

/// Call `name` with pure interpretation, nested calls included
///
/// # Errors
/// Returns error if the source fails to load or the call raises
pub fn interpret(source: &str, name: &str, args: Vec<Value>) -> TestResult<Value> {
    let program = HostProgram::from_source(source, 1000).map_err(|e| format!("Load error: {e}"))?;
    program.call(name, args).map_err(|e| format!("Runtime error: {e}"))
}

/// Call through the runtime and expect an integer result
///
/// # Errors
/// Returns error if the call raises or the result is not an integer
pub fn call_int(runtime: &Runtime, name: &str, args: Vec<Value>) -> TestResult<i64> {
    match runtime.call(name, args).map_err(|e| format!("Runtime error: {e}"))? {
        Value::Int(n) => Ok(n),
        other => Err(format!("Expected int, got {}", other.type_name())),
    }
}

/// Call through the runtime and expect a float result
///
/// # Errors
/// Returns error if the call raises or the result is not a float
pub fn call_float(runtime: &Runtime, name: &str, args: Vec<Value>) -> TestResult<f64> {
    match runtime.call(name, args).map_err(|e| format!("Runtime error: {e}"))? {
        Value::Float(f) => Ok(f),
        other => Err(format!("Expected float, got {}", other.type_name())),
    }
}

/// Host-visible rendering of a result, exceptions included, for comparing two paths
#[must_use]
pub fn outcome(result: &crate::host::HostResult<Value>) -> String {
    match result {
        Ok(value) => format!("{}:{}", value.type_name(), value.repr()),
        Err(err) => format!("raise {}", err.kind_name()),
    }
}

/// Integers stored in a list value
///
/// # Errors
/// Returns error if the value is not a list of integers
pub fn list_ints(value: &Value) -> TestResult<Vec<i64>> {
    let Value::List(items) = value else {
        return Err(format!("Expected list, got {}", value.type_name()));
    };
    items
        .read()
        .iter()
        .map(|v| match v {
            Value::Int(n) => Ok(*n),
            other => Err(format!("Expected int element, got {}", other.type_name())),
        })
        .collect()
}

/// Floats stored in a list value
///
/// # Errors
/// Returns error if the value is not a list of floats
pub fn list_floats(value: &Value) -> TestResult<Vec<f64>> {
    let Value::List(items) = value else {
        return Err(format!("Expected list, got {}", value.type_name()));
    };
    items
        .read()
        .iter()
        .map(|v| match v {
            Value::Float(f) => Ok(*f),
            other => Err(format!("Expected float element, got {}", other.type_name())),
        })
        .collect()
}
