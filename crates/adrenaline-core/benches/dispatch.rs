//! Benchmark suite for dispatched calls
//!
//! Compares the same functions run through the host interpreter and through native code:
//! - sum_range: scalar loop
//! - weighted: simd float reduction over an array
//! - matrix_multiply: hot + simd + parallel double loop

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use adrenaline_core::testutil::eager_config;
use adrenaline_core::{ExecutionOverride, Runtime, Value};

const SOURCE: &str = r#"
def sum_range(n):
    total = 0
    for i in range(n):
        total += i
    return total

def weighted(xs: list[float]):
    # #adrenaline:simd
    total = 0.0
    for i in range(len(xs)):
        total += xs[i] * 0.5
    return total

def matrix_multiply(size):
    # #adrenaline:hot
    # #adrenaline:simd
    # #adrenaline:parallel
    result = 0
    for i in range(size):
        for j in range(size):
            result += i * j
    return result
"#;

/// An interpreter-only runtime and a compiling one, both warmed up
fn runtimes() -> [(&'static str, Runtime); 2] {
    let interpreted = Runtime::from_source(SOURCE, eager_config().with_override(ExecutionOverride::InterpretAll))
        .expect("Failed to load benchmark source");
    let compiled = Runtime::from_source(SOURCE, eager_config()).expect("Failed to load benchmark source");
    compiled.call("sum_range", vec![Value::Int(1)]).expect("warm-up failed");
    compiled
        .call("weighted", vec![Value::float_list(&[1.0])])
        .expect("warm-up failed");
    [("interpreted", interpreted), ("compiled", compiled)]
}

fn bench_sum_range(c: &mut Criterion) {
    let mut group = c.benchmark_group("sum_range");
    let runtimes = runtimes();

    for size in [100_i64, 10_000] {
        group.throughput(Throughput::Elements(size as u64));
        for (label, runtime) in &runtimes {
            group.bench_with_input(BenchmarkId::new(*label, size), &size, |b, &size| {
                b.iter(|| black_box(runtime.call("sum_range", vec![Value::Int(size)])));
            });
        }
    }

    group.finish();
}

fn bench_weighted(c: &mut Criterion) {
    let mut group = c.benchmark_group("weighted");
    let runtimes = runtimes();

    for size in [1_000_usize, 100_000] {
        let xs: Vec<f64> = (0..size).map(|i| i as f64).collect();
        group.throughput(Throughput::Elements(size as u64));
        for (label, runtime) in &runtimes {
            group.bench_with_input(BenchmarkId::new(*label, size), &xs, |b, xs| {
                b.iter(|| black_box(runtime.call("weighted", vec![Value::float_list(xs)])));
            });
        }
    }

    group.finish();
}

fn bench_matrix_multiply(c: &mut Criterion) {
    let mut group = c.benchmark_group("matrix_multiply");
    group.sample_size(20);
    let runtimes = runtimes();

    for (label, runtime) in &runtimes {
        group.bench_function(*label, |b| {
            b.iter(|| black_box(runtime.call("matrix_multiply", vec![Value::Int(300)])));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_sum_range, bench_weighted, bench_matrix_multiply);
criterion_main!(benches);
