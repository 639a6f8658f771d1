//! Per-function call profiling

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Live counters for one function; shared by every generation of its entry
#[derive(Debug, Default)]
pub(crate) struct Counters {
    calls: AtomicU64,
    compiled_calls: AtomicU64,
    interpreted_calls: AtomicU64,
    deopts: AtomicU64,
    compile_attempts: AtomicU64,
    total_nanos: AtomicU64,
}

impl Counters {
    /// Count a call; returns the number of calls including this one
    pub fn on_call(&self) -> u64 {
        self.calls.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn on_compiled(&self) {
        self.compiled_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_interpreted(&self) {
        self.interpreted_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_deopt(&self) {
        self.deopts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_compile_attempt(&self) {
        self.compile_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_time(&self, elapsed: Duration) {
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.total_nanos.fetch_add(nanos, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> FunctionStats {
        FunctionStats {
            calls: self.calls.load(Ordering::Relaxed),
            compiled_calls: self.compiled_calls.load(Ordering::Relaxed),
            interpreted_calls: self.interpreted_calls.load(Ordering::Relaxed),
            deopts: self.deopts.load(Ordering::Relaxed),
            compile_attempts: self.compile_attempts.load(Ordering::Relaxed),
            total_time: Duration::from_nanos(self.total_nanos.load(Ordering::Relaxed)),
        }
    }
}

/// Snapshot of a function's profile
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FunctionStats {
    pub calls: u64,
    /// Calls answered by native code
    pub compiled_calls: u64,
    /// Calls answered by the interpreter, deoptimized re-runs included
    pub interpreted_calls: u64,
    /// Native calls abandoned for the interpreter
    pub deopts: u64,
    /// Analyses started for this function (at most one per generation)
    pub compile_attempts: u64,
    /// Wall time spent inside `invoke`, nested calls included
    pub total_time: Duration,
}

impl FunctionStats {
    /// Average time per call
    #[must_use]
    pub fn mean_time(&self) -> Duration {
        let Some(calls) = std::num::NonZeroU64::new(self.calls) else {
            return Duration::ZERO;
        };
        let nanos = u64::try_from(self.total_time.as_nanos()).unwrap_or(u64::MAX);
        Duration::from_nanos(nanos / calls)
    }
}
