//! Call dispatch
//!
//! Every call to a module function goes through [`Dispatcher::invoke`]. Each registered
//! function owns an [`entry::Entry`] whose state decides the route:
//!
//! ```text
//! Unanalyzed --claim--> EligiblePending --+--> Compiled
//!                                         +--> Fallback (rejected or codegen failed)
//! ```
//!
//! Until native code is installed every call is interpreted. Compilation runs on background
//! workers; a call that observes a stale state simply takes the interpreter. `Fallback` is
//! never retried within a generation; [`Dispatcher::invalidate`] starts a new generation.

pub mod entry;
pub mod marshal;
pub mod stats;
mod worker;

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use parking_lot::RwLock;
use rayon::ThreadPool;
use tracing::{debug, info, warn};

use crate::analysis::typed::{Purity, ValueKind};
use crate::analysis::{Analyzer, EligibilityVerdict, Rejection};
use crate::config::{AdrenalineConfig, ExecutionOverride};
use crate::diagnostics::{Diagnostic, DiagnosticKind, DiagnosticSink, TracingSink};
use crate::error::AdrenalineError;
use crate::host::{call_depth, Host, HostError, HostResult, Invoke, Value};
use crate::jit::{ExecCtx, JitCompiler};
use crate::opt::Pipeline;
use crate::unit::{FunctionId, FunctionUnit};

pub use entry::{CompiledArtifact, DispatchState, FallbackReason, Verdict};
pub use stats::FunctionStats;

use entry::{Entry, Provenance};
use worker::{CompileQueue, Job};

/// State shared between callers and compile workers
struct Shared {
    host: Arc<dyn Host>,
    config: AdrenalineConfig,
    sink: Arc<dyn DiagnosticSink>,
    compiler: Result<JitCompiler, String>,
    pool: Option<ThreadPool>,
    /// Arena indexed by [`FunctionId`]
    entries: RwLock<Vec<Arc<Entry>>>,
    names: RwLock<HashMap<String, FunctionId>>,
    queue: Arc<CompileQueue>,
    /// Compile on workers; cleared when none could be started
    background: AtomicBool,
}

/// Routes calls between native code and the host interpreter
pub struct Dispatcher {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl Dispatcher {
    /// Create a dispatcher reporting diagnostics through `tracing`
    pub fn new(host: Arc<dyn Host>, config: AdrenalineConfig) -> Self {
        Self::with_sink(host, config, Arc::new(TracingSink))
    }

    pub fn with_sink(host: Arc<dyn Host>, config: AdrenalineConfig, sink: Arc<dyn DiagnosticSink>) -> Self {
        let compiler = JitCompiler::new().map_err(|e| e.to_string());
        if let Err(reason) = &compiler {
            warn!(event = "codegen_unavailable", reason = %reason);
        }
        let threads = config.effective_parallel_workers();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("adrenaline-par-{i}"))
            .build()
            .map_err(|e| warn!(event = "parallel_pool_unavailable", error = %e))
            .ok();

        let shared = Arc::new(Shared {
            host,
            sink,
            compiler,
            pool,
            entries: RwLock::new(Vec::new()),
            names: RwLock::new(HashMap::new()),
            queue: Arc::new(CompileQueue::default()),
            background: AtomicBool::new(config.background_compile),
            config,
        });

        let workers = if shared.config.background_compile {
            let runner = Arc::clone(&shared);
            worker::spawn_workers(
                shared.config.compile_workers,
                &shared.queue,
                Arc::new(move |job: Job| runner.compile(&job.entry, &job.kinds)),
            )
        } else {
            Vec::new()
        };
        if workers.is_empty() && shared.config.background_compile {
            warn!(event = "no_compile_workers", "compiling on calling threads");
            shared.background.store(false, Ordering::Release);
        }

        Self { shared, workers }
    }

    #[must_use]
    pub fn config(&self) -> &AdrenalineConfig {
        &self.shared.config
    }

    /// Register a function, replacing (and invalidating) an earlier unit of the same name
    pub fn register(&self, unit: FunctionUnit) -> FunctionId {
        self.install(unit).0
    }

    /// Register a new version of a function; returns every name whose compile decision
    /// was reset, the function itself first
    pub fn replace(&self, unit: FunctionUnit) -> Vec<String> {
        self.install(unit).1
    }

    fn install(&self, unit: FunctionUnit) -> (FunctionId, Vec<String>) {
        let shared = &self.shared;
        let unit = Arc::new(unit);
        info!(
            event = "unit_registered",
            function = %unit.name,
            hash = %unit.source_hash,
            directives = %unit.directives,
        );
        shared.report_directive_findings(&unit);

        let existing = shared.names.read().get(&unit.name).copied();
        let (id, entry, reset) = match existing {
            Some(id) => {
                let entry = shared.replace(id, Arc::clone(&unit));
                let mut reset = vec![unit.name.clone()];
                reset.extend(shared.invalidate_dependents(&unit.name, id));
                (id, entry, reset)
            }
            None => {
                let mut entries = shared.entries.write();
                let id = FunctionId(entries.len() as u32);
                let entry = Arc::new(Entry::new(Arc::clone(&unit), 0, Arc::default()));
                entries.push(Arc::clone(&entry));
                shared.names.write().insert(unit.name.clone(), id);
                (id, entry, Vec::new())
            }
        };
        shared.prepare(&entry);
        (id, reset)
    }

    #[must_use]
    pub fn resolve(&self, name: &str) -> Option<FunctionId> {
        self.shared.names.read().get(name).copied()
    }

    /// Call a registered function
    pub fn invoke(&self, id: FunctionId, args: Vec<Value>) -> HostResult<Value> {
        let entry = self
            .shared
            .entry(id)
            .ok_or_else(|| HostError::Name(id.to_string()))?;
        let started = Instant::now();
        let result = self.dispatch(&entry, args);
        entry.counters.record_time(started.elapsed());
        result
    }

    fn dispatch(&self, entry: &Arc<Entry>, args: Vec<Value>) -> HostResult<Value> {
        let shared = &self.shared;
        let calls = entry.counters.on_call();
        match entry.state() {
            DispatchState::Compiled => {
                if let Some(artifact) = entry.artifact() {
                    if let Some(result) = shared.run_native(entry, artifact, &args) {
                        entry.counters.on_compiled();
                        return result;
                    }
                }
            }
            DispatchState::Unanalyzed => shared.maybe_schedule(entry, calls, &args),
            DispatchState::EligiblePending | DispatchState::Fallback => {}
        }
        entry.counters.on_interpreted();
        shared.host.interpret(&entry.unit.name, args, self)
    }

    #[must_use]
    pub fn state(&self, id: FunctionId) -> Option<DispatchState> {
        self.shared.entry(id).map(|e| e.state())
    }

    #[must_use]
    pub fn artifact(&self, id: FunctionId) -> Option<Arc<CompiledArtifact>> {
        self.shared.entry(id).and_then(|e| e.artifact().cloned())
    }

    /// The decided verdict of the current generation, `None` while undecided
    #[must_use]
    pub fn verdict(&self, id: FunctionId) -> Option<Verdict> {
        self.shared.entry(id).and_then(|e| e.verdict())
    }

    #[must_use]
    pub fn unit(&self, id: FunctionId) -> Option<Arc<FunctionUnit>> {
        self.shared.entry(id).map(|e| Arc::clone(&e.unit))
    }

    #[must_use]
    pub fn generation(&self, id: FunctionId) -> Option<u64> {
        self.shared.entry(id).map(|e| e.generation)
    }

    #[must_use]
    pub fn stats(&self, id: FunctionId) -> Option<FunctionStats> {
        self.shared.entry(id).map(|e| e.counters.snapshot())
    }

    /// Functions called at least `threshold` times, most called first
    #[must_use]
    pub fn hot_functions(&self, threshold: u64) -> Vec<(String, FunctionStats)> {
        let mut hot: Vec<(String, FunctionStats)> = self
            .shared
            .entries
            .read()
            .iter()
            .map(|e| (e.unit.name.clone(), e.counters.snapshot()))
            .filter(|(_, s)| s.calls >= threshold)
            .collect();
        hot.sort_by(|a, b| b.1.calls.cmp(&a.1.calls).then_with(|| a.0.cmp(&b.0)));
        hot
    }

    /// Registered function names in registration order
    #[must_use]
    pub fn function_names(&self) -> Vec<String> {
        let mut named: Vec<(FunctionId, String)> = self
            .shared
            .names
            .read()
            .iter()
            .map(|(name, id)| (*id, name.clone()))
            .collect();
        named.sort();
        named.into_iter().map(|(_, name)| name).collect()
    }

    /// Constants captured by any current verdict
    #[must_use]
    pub fn globals_in_use(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .shared
            .entries
            .read()
            .iter()
            .filter_map(|e| e.provenance())
            .flat_map(|p| p.globals_read.iter().cloned())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Start a new generation for `name` (a function or constant) and for every function
    /// whose verdict was derived from it; returns the names reset
    pub fn invalidate(&self, name: &str) -> Vec<String> {
        let own = self.resolve(name);
        let mut reset = Vec::new();
        if let Some(id) = own {
            if let Some(entry) = self.shared.entry(id) {
                let fresh = self.shared.replace(id, Arc::clone(&entry.unit));
                self.shared.prepare(&fresh);
                reset.push(name.to_string());
            }
        }
        reset.extend(self.shared.invalidate_dependents(name, own.unwrap_or(FunctionId(u32::MAX))));
        reset
    }

    /// Forget a function that no longer exists
    ///
    /// Its name stops resolving, so calls by name reach the host (which raises `NameError`);
    /// calls by id are interpreted. Returns the names whose compile decision was reset.
    pub fn remove(&self, name: &str) -> Vec<String> {
        let Some(id) = self.shared.names.write().remove(name) else {
            return Vec::new();
        };
        let mut reset = vec![name.to_string()];
        if let Some(entry) = self.shared.entry(id) {
            let fresh = self.shared.replace(id, Arc::clone(&entry.unit));
            self.shared.fall_back(&fresh, FallbackReason::Removed);
        }
        reset.extend(self.shared.invalidate_dependents(name, id));
        reset
    }

    /// Block until every queued compilation has finished
    pub fn wait_idle(&self) {
        self.shared.queue.wait_idle();
    }
}

impl Invoke for Dispatcher {
    fn invoke_by_name(&self, name: &str, args: Vec<Value>) -> HostResult<Value> {
        match self.resolve(name) {
            Some(id) => self.invoke(id, args),
            None => self.shared.host.interpret(name, args, self),
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shared.queue.shutdown();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!(event = "worker_panicked");
            }
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("functions", &self.function_names())
            .field("workers", &self.workers.len())
            .finish_non_exhaustive()
    }
}

impl Shared {
    fn entry(&self, id: FunctionId) -> Option<Arc<Entry>> {
        self.entries.read().get(id.index()).cloned()
    }

    /// Install the next generation for `id`, keeping its profile
    fn replace(&self, id: FunctionId, unit: Arc<FunctionUnit>) -> Arc<Entry> {
        let mut entries = self.entries.write();
        let Some(slot) = entries.get_mut(id.index()) else {
            return Arc::new(Entry::new(unit, 0, Arc::default()));
        };
        let fresh = Arc::new(Entry::new(unit, slot.generation + 1, Arc::clone(&slot.counters)));
        let previous = std::mem::replace(slot, Arc::clone(&fresh));
        drop(entries);
        if previous.state() != DispatchState::Unanalyzed {
            self.sink.report(Diagnostic::new(
                &previous.unit.name,
                DiagnosticKind::Invalidated,
                format!("generation {} was {}", previous.generation, previous.state()),
            ));
        }
        info!(
            event = "invalidated",
            function = %previous.unit.name,
            generation = fresh.generation,
        );
        fresh
    }

    /// Reset every other entry whose verdict was derived from `name`
    fn invalidate_dependents(&self, name: &str, skip: FunctionId) -> Vec<String> {
        let dependents: Vec<(FunctionId, Arc<FunctionUnit>)> = self
            .entries
            .read()
            .iter()
            .enumerate()
            .filter(|(i, e)| *i != skip.index() && e.depends_on(name))
            .map(|(i, e)| (FunctionId(i as u32), Arc::clone(&e.unit)))
            .collect();
        dependents
            .into_iter()
            .map(|(id, unit)| {
                let name = unit.name.clone();
                let fresh = self.replace(id, unit);
                self.prepare(&fresh);
                name
            })
            .collect()
    }

    fn report_directive_findings(&self, unit: &FunctionUnit) {
        for name in &unit.unknown_directives {
            self.sink.report(Diagnostic::new(
                &unit.name,
                DiagnosticKind::UnknownDirective,
                format!("unknown directive '{name}' ignored"),
            ));
        }
        if !unit.overridden_directives.is_empty() {
            let dropped: Vec<String> = unit
                .overridden_directives
                .iter()
                .map(ToString::to_string)
                .collect();
            let err = AdrenalineError::DirectiveConflict {
                function: unit.name.clone(),
                reason: format!("no-compile overrides {}", dropped.join(", ")),
            };
            self.sink
                .report(Diagnostic::new(&unit.name, DiagnosticKind::DirectiveConflict, err.to_string()));
        }
    }

    /// Decisions available without a call: screening and eager queueing
    fn prepare(&self, entry: &Arc<Entry>) {
        if self.config.execution_override == Some(ExecutionOverride::InterpretAll) {
            return;
        }
        if let Err(rejection) = Analyzer::new(self.host.as_source()).screen(&entry.unit) {
            if entry.claim() {
                self.reject(entry, rejection);
            }
            return;
        }
        let eager = entry.unit.directives.is_hot()
            || self.config.execution_override == Some(ExecutionOverride::CompileAll);
        if eager {
            if let Some(kinds) = entry.unit.static_param_kinds() {
                self.schedule(entry, kinds);
            }
        }
    }

    fn maybe_schedule(&self, entry: &Arc<Entry>, calls: u64, args: &[Value]) {
        match self.config.execution_override {
            Some(ExecutionOverride::InterpretAll) => return,
            Some(ExecutionOverride::CompileAll) => {}
            None => {
                if calls < self.config.compile_threshold && !entry.unit.directives.is_hot() {
                    return;
                }
            }
        }
        // Calls that cannot be represented natively leave the state untouched
        if let Some(kinds) = marshal::observe(&entry.unit, args) {
            self.schedule(entry, kinds);
        }
    }

    fn schedule(&self, entry: &Arc<Entry>, kinds: Vec<ValueKind>) {
        if !entry.claim() {
            return;
        }
        let hot = entry.unit.directives.is_hot();
        if self.background.load(Ordering::Acquire) {
            debug!(event = "compile_queued", function = %entry.unit.name, hot);
            self.queue.push(Arc::clone(entry), kinds, hot);
        } else {
            self.compile(entry, &kinds);
        }
    }

    /// Analyze, optimize and generate code for a claimed entry
    fn compile(&self, entry: &Entry, kinds: &[ValueKind]) {
        let name = entry.unit.name.as_str();
        entry.counters.on_compile_attempt();
        info!(event = "compile_started", function = %name, generation = entry.generation);
        let started = Instant::now();

        let outcome = catch_unwind(AssertUnwindSafe(|| self.build(entry, kinds)));
        let result = outcome.unwrap_or_else(|_| {
            Err(FallbackReason::CompileFailed(AdrenalineError::codegen(
                name,
                "code generator panicked",
            )))
        });
        match result {
            Ok(artifact) => {
                info!(
                    event = "compiled",
                    function = %name,
                    generation = entry.generation,
                    elapsed_us = started.elapsed().as_micros() as u64,
                );
                entry.finish_compiled(Arc::new(artifact));
            }
            Err(FallbackReason::Rejected(rejection)) => self.reject(entry, rejection),
            Err(FallbackReason::CompileFailed(err)) => {
                warn!(event = "compile_failed", function = %name, error = %err);
                self.sink
                    .report(Diagnostic::new(name, DiagnosticKind::CodegenFailed, err.to_string()));
                self.fall_back(entry, FallbackReason::CompileFailed(err));
            }
            Err(reason @ FallbackReason::Removed) => self.fall_back(entry, reason),
        }
    }

    fn build(&self, entry: &Entry, kinds: &[ValueKind]) -> Result<CompiledArtifact, FallbackReason> {
        let unit = &entry.unit;
        let analysis = Analyzer::new(self.host.as_source()).analyze(unit, kinds);
        entry.record_provenance(Provenance {
            dependencies: analysis.dependencies.clone(),
            globals_read: analysis.globals_read.clone(),
        });
        let mut body = match analysis.verdict {
            EligibilityVerdict::Eligible(body) => body,
            EligibilityVerdict::Rejected(rejection) => return Err(FallbackReason::Rejected(rejection)),
        };

        let report = Pipeline::new(&self.config).run(&mut body);
        for diagnostic in report.diagnostics() {
            if diagnostic.kind == DiagnosticKind::PassSkipped {
                debug!(event = "loop_skipped", function = %diagnostic.function, reason = %diagnostic.message);
            }
            self.sink.report(diagnostic);
        }

        let compiler = self
            .compiler
            .as_ref()
            .map_err(|reason| FallbackReason::CompileFailed(AdrenalineError::codegen(&unit.name, reason)))?;
        let code = compiler
            .compile(&body)
            .map_err(|e| FallbackReason::CompileFailed(AdrenalineError::codegen(&unit.name, e)))?;

        Ok(CompiledArtifact {
            name: unit.name.clone(),
            directives: unit.directives,
            purity: body.purity(),
            stored_params: body.stored_params(),
            code,
            report,
            dependencies: analysis.dependencies,
            globals_read: analysis.globals_read,
        })
    }

    fn reject(&self, entry: &Entry, rejection: Rejection) {
        info!(event = "rejected", function = %entry.unit.name, reason = %rejection);
        self.sink
            .report(Diagnostic::new(&entry.unit.name, DiagnosticKind::Rejected, rejection.to_string()));
        self.fall_back(entry, FallbackReason::Rejected(rejection));
    }

    fn fall_back(&self, entry: &Entry, reason: FallbackReason) {
        debug!(event = "fallback", function = %entry.unit.name, reason = %reason);
        entry.finish_fallback(reason);
    }

    /// Run native code; `None` sends the call to the interpreter
    fn run_native(
        &self,
        entry: &Entry,
        artifact: &CompiledArtifact,
        args: &[Value],
    ) -> Option<HostResult<Value>> {
        let mut lowered = marshal::lower_args(artifact.arg_kinds(), args)?;
        let mut ctx = ExecCtx::new(
            call_depth(),
            self.config.max_recursion_depth,
            self.pool.as_ref(),
            self.config.min_chunk,
            self.config.target_chunks,
        );
        let bits = match artifact.code.invoke(&mut lowered.frame, &mut ctx) {
            Ok(bits) => bits,
            Err(e) => {
                warn!(event = "native_call_failed", function = %entry.unit.name, error = %e);
                return None;
            }
        };
        if ctx.deoptimized() {
            entry.counters.on_deopt();
            debug!(event = "deopt", function = %entry.unit.name);
            return None;
        }
        if artifact.purity == Purity::MutatesContainer {
            lowered.write_back(&artifact.stored_params);
        }
        Some(Ok(marshal::raise_result(artifact.ret(), bits, args)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::CollectingSink;
    use crate::error::ErrorKind;
    use crate::host::{FunctionSource, HostProgram};

    const SOURCE: &str = r#"
def sum_range(n):
    total = 0
    for i in range(n):
        total += i
    return total

def describe(n):
    return {"n": n}

def square(n):
    return n * n

def quiet(n):
    # #adrenaline:no-compile
    # #adrenaline:simd
    return n
"#;

    fn dispatcher(config: AdrenalineConfig) -> (Dispatcher, Arc<CollectingSink>) {
        let program = Arc::new(HostProgram::from_source(SOURCE, config.max_recursion_depth).unwrap());
        let sink = Arc::new(CollectingSink::new());
        let dispatcher = Dispatcher::with_sink(program.clone(), config, sink.clone());
        for name in program.function_names() {
            dispatcher.register(FunctionUnit::new(program.function(&name).unwrap()));
        }
        (dispatcher, sink)
    }

    fn sync_config() -> AdrenalineConfig {
        AdrenalineConfig::default().with_background_compile(false)
    }

    #[test]
    fn first_call_interprets_then_native_takes_over() {
        let (d, _) = dispatcher(sync_config());
        let id = d.resolve("sum_range").unwrap();
        assert_eq!(d.state(id), Some(DispatchState::Unanalyzed));
        assert!(matches!(d.invoke(id, vec![Value::Int(1000)]), Ok(Value::Int(499_500))));
        assert_eq!(d.state(id), Some(DispatchState::Compiled));
        assert!(matches!(d.invoke(id, vec![Value::Int(10)]), Ok(Value::Int(45))));
        let stats = d.stats(id).unwrap();
        assert_eq!(stats.calls, 2);
        assert_eq!(stats.interpreted_calls, 1);
        assert_eq!(stats.compiled_calls, 1);
    }

    #[test]
    fn unsupported_body_falls_back_at_registration() {
        let (d, sink) = dispatcher(sync_config());
        let id = d.resolve("describe").unwrap();
        let Some(Verdict::Fallback(FallbackReason::Rejected(rejection))) = d.verdict(id) else {
            panic!("describe should be rejected");
        };
        assert_eq!(rejection.kind(), Some(ErrorKind::UnsupportedConstruct));
        assert_eq!(sink.matching("describe", DiagnosticKind::Rejected).len(), 1);
        assert!(matches!(d.invoke(id, vec![Value::Int(3)]), Ok(Value::Dict(_))));
        assert_eq!(d.stats(id).unwrap().compile_attempts, 0);
    }

    #[test]
    fn opt_out_reports_the_dropped_directives() {
        let (d, sink) = dispatcher(sync_config());
        let id = d.resolve("quiet").unwrap();
        assert_eq!(
            d.verdict(id),
            Some(Verdict::Fallback(FallbackReason::Rejected(Rejection::OptOut)))
        );
        assert_eq!(sink.matching("quiet", DiagnosticKind::DirectiveConflict).len(), 1);
    }

    #[test]
    fn unrepresentable_arguments_leave_state_alone() {
        let (d, _) = dispatcher(sync_config());
        let id = d.resolve("sum_range").unwrap();
        assert!(d.invoke(id, vec![Value::str("x")]).is_err());
        assert_eq!(d.state(id), Some(DispatchState::Unanalyzed));
    }

    #[test]
    fn overflow_deopts_to_the_host_error() {
        let (d, _) = dispatcher(sync_config());
        let id = d.resolve("square").unwrap();
        assert!(matches!(d.invoke(id, vec![Value::Int(3)]), Ok(Value::Int(9))));
        assert_eq!(d.state(id), Some(DispatchState::Compiled));
        assert!(matches!(
            d.invoke(id, vec![Value::Int(1 << 40)]),
            Err(HostError::Overflow(_))
        ));
        let stats = d.stats(id).unwrap();
        assert_eq!(stats.deopts, 1);
        // the deopt is per call, native code stays installed
        assert_eq!(d.state(id), Some(DispatchState::Compiled));
        assert!(matches!(d.invoke(id, vec![Value::Int(4)]), Ok(Value::Int(16))));
    }

    #[test]
    fn interpret_all_never_compiles() {
        let config = sync_config().with_override(ExecutionOverride::InterpretAll);
        let (d, _) = dispatcher(config);
        let id = d.resolve("sum_range").unwrap();
        for _ in 0..3 {
            d.invoke(id, vec![Value::Int(5)]).unwrap();
        }
        assert_eq!(d.state(id), Some(DispatchState::Unanalyzed));
        assert_eq!(d.stats(id).unwrap().compiled_calls, 0);
    }

    #[test]
    fn threshold_delays_compilation() {
        let (d, _) = dispatcher(sync_config().with_compile_threshold(3));
        let id = d.resolve("sum_range").unwrap();
        d.invoke(id, vec![Value::Int(5)]).unwrap();
        d.invoke(id, vec![Value::Int(5)]).unwrap();
        assert_eq!(d.state(id), Some(DispatchState::Unanalyzed));
        d.invoke(id, vec![Value::Int(5)]).unwrap();
        assert_eq!(d.state(id), Some(DispatchState::Compiled));
    }

    #[test]
    fn invalidate_starts_a_new_generation() {
        let (d, sink) = dispatcher(sync_config());
        let id = d.resolve("sum_range").unwrap();
        d.invoke(id, vec![Value::Int(5)]).unwrap();
        assert_eq!(d.invalidate("sum_range"), ["sum_range"]);
        assert_eq!(d.state(id), Some(DispatchState::Unanalyzed));
        assert_eq!(d.generation(id), Some(1));
        assert_eq!(sink.count(DiagnosticKind::Invalidated), 1);
        // profile survives
        assert_eq!(d.stats(id).unwrap().calls, 1);
    }

    #[test]
    fn removed_function_stops_resolving_and_is_interpreted() {
        let (d, _) = dispatcher(sync_config());
        let id = d.resolve("sum_range").unwrap();
        d.invoke(id, vec![Value::Int(5)]).unwrap();
        d.invoke(id, vec![Value::Int(5)]).unwrap();
        assert_eq!(d.stats(id).unwrap().compiled_calls, 1);
        assert_eq!(d.remove("sum_range"), ["sum_range"]);
        assert_eq!(d.resolve("sum_range"), None);
        assert_eq!(d.state(id), Some(DispatchState::Fallback));
        assert!(matches!(d.invoke(id, vec![Value::Int(5)]), Ok(Value::Int(10))));
        assert_eq!(d.stats(id).unwrap().compiled_calls, 1);
    }

    #[test]
    fn hot_functions_are_ranked_by_calls() {
        let (d, _) = dispatcher(sync_config().with_override(ExecutionOverride::InterpretAll));
        let sum = d.resolve("sum_range").unwrap();
        let quiet = d.resolve("quiet").unwrap();
        for _ in 0..3 {
            d.invoke(sum, vec![Value::Int(1)]).unwrap();
        }
        d.invoke(quiet, vec![Value::Int(1)]).unwrap();
        let hot = d.hot_functions(1);
        assert_eq!(hot.len(), 2);
        assert_eq!(hot[0].0, "sum_range");
        assert_eq!(d.hot_functions(2).len(), 1);
    }

    #[test]
    fn unknown_id_is_a_name_error() {
        let (d, _) = dispatcher(sync_config());
        assert!(matches!(d.invoke(FunctionId(99), Vec::new()), Err(HostError::Name(_))));
    }
}
