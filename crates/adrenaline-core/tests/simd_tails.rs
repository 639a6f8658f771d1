//! Vector loops must agree with scalar loops for every remainder length

use adrenaline_core::opt::pass;
use adrenaline_core::testutil::{call_float, call_int, eager_config, list_floats, outcome};
use adrenaline_core::{DispatchState, HostProgram, Runtime, Value};

const SOURCE: &str = r#"
def isum(xs: list[int]):
    # #adrenaline:simd
    total = 0
    for i in range(len(xs)):
        total += xs[i]
    return total

def isum_scalar(xs: list[int]):
    total = 0
    for i in range(len(xs)):
        total += xs[i]
    return total

def fdot(xs: list[float], ys: list[float]):
    # #adrenaline:simd
    total = 0.0
    for i in range(len(xs)):
        total += xs[i] * ys[i]
    return total

def imax(xs: list[int]):
    # #adrenaline:simd
    best = -1000000
    for i in range(len(xs)):
        best = max(best, xs[i])
    return best

def axpy(a: float, xs: list[float], ys: list[float]):
    # #adrenaline:simd
    for i in range(len(xs)):
        ys[i] = a * xs[i] + ys[i]
    return ys
"#;

const WIDTH: usize = 4;

fn runtime() -> Runtime {
    Runtime::from_source(SOURCE, eager_config().with_vector_width(WIDTH)).unwrap()
}

fn tail_lengths() -> [usize; 5] {
    [0, 1, WIDTH - 1, WIDTH, WIDTH + 1]
}

fn ints(n: usize) -> Vec<i64> {
    (0..n as i64).map(|i| i * 7 - 11).collect()
}

fn floats(n: usize) -> Vec<f64> {
    (0..n).map(|i| i as f64 * 0.5 - 1.0).collect()
}

/// Compile `name` (annotated parameters compile eagerly only under `hot`) and check it is native
fn warm(runtime: &Runtime, name: &str, args: Vec<Value>) {
    runtime.call(name, args).unwrap();
    let id = runtime.dispatcher().resolve(name).unwrap();
    assert_eq!(runtime.dispatcher().state(id), Some(DispatchState::Compiled), "{name}");
    let artifact = runtime.dispatcher().artifact(id).unwrap();
    if name != "isum_scalar" {
        assert_eq!(artifact.report.applied(pass::SIMD), 1, "{name}");
    }
}

#[test]
fn test_integer_sum_tails() {
    let runtime = runtime();
    warm(&runtime, "isum", vec![Value::int_list(&[1])]);
    warm(&runtime, "isum_scalar", vec![Value::int_list(&[1])]);
    for n in tail_lengths().into_iter().chain([37, 1000]) {
        let xs = ints(n);
        let expected: i64 = xs.iter().sum();
        assert_eq!(call_int(&runtime, "isum", vec![Value::int_list(&xs)]).unwrap(), expected, "n={n}");
        assert_eq!(call_int(&runtime, "isum_scalar", vec![Value::int_list(&xs)]).unwrap(), expected);
    }
}

#[test]
fn test_float_dot_tails() {
    let runtime = runtime();
    warm(&runtime, "fdot", vec![Value::float_list(&[1.0]), Value::float_list(&[1.0])]);
    for n in tail_lengths() {
        let xs = floats(n);
        let ys: Vec<f64> = xs.iter().map(|x| x + 2.0).collect();
        // small multiples of 0.25: every association order is exact
        let expected: f64 = xs.iter().zip(&ys).map(|(x, y)| x * y).sum();
        let got = call_float(&runtime, "fdot", vec![Value::float_list(&xs), Value::float_list(&ys)]).unwrap();
        assert_eq!(got, expected, "n={n}");
    }
}

#[test]
fn test_integer_max_tails() {
    let runtime = runtime();
    warm(&runtime, "imax", vec![Value::int_list(&[1])]);
    for n in tail_lengths() {
        let xs: Vec<i64> = ints(n).into_iter().rev().collect();
        let expected = xs.iter().copied().fold(-1_000_000, i64::max);
        assert_eq!(call_int(&runtime, "imax", vec![Value::int_list(&xs)]).unwrap(), expected, "n={n}");
    }
}

#[test]
fn test_packed_store_tails() {
    let runtime = runtime();
    warm(
        &runtime,
        "axpy",
        vec![Value::Float(1.0), Value::float_list(&[1.0]), Value::float_list(&[1.0])],
    );
    for n in tail_lengths() {
        let xs = floats(n);
        let ys_in: Vec<f64> = (0..n).map(|i| i as f64).collect();
        let ys = Value::float_list(&ys_in);
        runtime
            .call("axpy", vec![Value::Float(2.0), Value::float_list(&xs), ys.clone()])
            .unwrap();
        let expected: Vec<f64> = xs.iter().zip(&ys_in).map(|(x, y)| 2.0 * x + y).collect();
        assert_eq!(list_floats(&ys).unwrap(), expected, "n={n}");
    }
}

#[test]
fn test_sum_overflow_in_lanes_matches_host() {
    let runtime = runtime();
    warm(&runtime, "isum", vec![Value::int_list(&[1])]);
    let xs = [i64::MAX, 1, -5, 3, 2];
    let err = runtime.call("isum", vec![Value::int_list(&xs)]).unwrap_err();
    assert_eq!(err.kind_name(), "OverflowError");
}

/// The native outcome of a call next to the interpreter's
fn against_host(runtime: &Runtime, name: &str, args: Vec<Value>) -> (String, String) {
    let native = outcome(&runtime.call(name, args.clone()));
    let reference = HostProgram::from_source(SOURCE, 1000).unwrap();
    (native, outcome(&reference.call(name, args)))
}

fn deopts(runtime: &Runtime, name: &str) -> u64 {
    let id = runtime.dispatcher().resolve(name).unwrap();
    runtime.dispatcher().stats(id).unwrap().deopts
}

#[test]
fn test_running_total_overflow_raises_even_when_lanes_stay_in_range() {
    let runtime = runtime();
    warm(&runtime, "isum", vec![Value::int_list(&[1])]);
    // lane 0 sees 1 + 0, lane 1 sees MAX - 1; the sequential total passes 1 + MAX
    let xs = [1, i64::MAX, 0, 0, 0, -1, 0, 0];
    let (native, host) = against_host(&runtime, "isum", vec![Value::int_list(&xs)]);
    assert_eq!(host, "raise OverflowError");
    assert_eq!(native, host);
}

#[test]
fn test_lane_overflow_without_sequential_overflow_returns_host_value() {
    let runtime = runtime();
    warm(&runtime, "isum", vec![Value::int_list(&[1])]);
    // lane 0 sees MAX + MAX; the sequential total alternates between MAX and 0
    let xs: Vec<i64> = (0..8).map(|i| if i % 2 == 0 { i64::MAX } else { -i64::MAX }).collect();
    let (native, host) = against_host(&runtime, "isum", vec![Value::int_list(&xs)]);
    assert_eq!(host, "int:0");
    assert_eq!(native, host);
}

#[test]
fn test_large_operands_within_bound_stay_native() {
    let runtime = runtime();
    warm(&runtime, "isum", vec![Value::int_list(&[1])]);
    let quarter = i64::MAX / 4;
    let xs = [quarter, quarter, -quarter, quarter];
    let before = deopts(&runtime, "isum");
    assert_eq!(call_int(&runtime, "isum", vec![Value::int_list(&xs)]).unwrap(), 2 * quarter);
    assert_eq!(deopts(&runtime, "isum"), before);
}
