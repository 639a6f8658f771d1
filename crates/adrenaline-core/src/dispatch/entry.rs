//! Per-function dispatch state

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use crate::analysis::typed::{Purity, ReturnKind, ValueKind};
use crate::analysis::Rejection;
use crate::directive::DirectiveSet;
use crate::error::AdrenalineError;
use crate::jit::CompiledCode;
use crate::opt::PipelineReport;
use crate::unit::FunctionUnit;

use super::stats::Counters;

/// Where a function stands in the dispatch state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatchState {
    /// Registered; no compile decision yet
    Unanalyzed,
    /// Claimed for compilation, analysis or code generation still running
    EligiblePending,
    /// Native code is installed
    Compiled,
    /// Permanently interpreted for this generation
    Fallback,
}

impl DispatchState {
    const fn to_u8(self) -> u8 {
        match self {
            Self::Unanalyzed => 0,
            Self::EligiblePending => 1,
            Self::Compiled => 2,
            Self::Fallback => 3,
        }
    }

    const fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::EligiblePending,
            2 => Self::Compiled,
            3 => Self::Fallback,
            _ => Self::Unanalyzed,
        }
    }
}

impl fmt::Display for DispatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unanalyzed => "unanalyzed",
            Self::EligiblePending => "eligible_pending",
            Self::Compiled => "compiled",
            Self::Fallback => "fallback",
        })
    }
}

/// Why a function runs interpreted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackReason {
    Rejected(Rejection),
    CompileFailed(AdrenalineError),
    /// The function was removed from the program
    Removed,
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rejected(rejection) => write!(f, "rejected: {rejection}"),
            Self::CompileFailed(err) => write!(f, "compile failed: {err}"),
            Self::Removed => f.write_str("removed from the program"),
        }
    }
}

/// Final compile decision for one generation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Compiled,
    Fallback(FallbackReason),
}

/// Native code for one specialization of a function
#[derive(Debug)]
pub struct CompiledArtifact {
    pub name: String,
    pub directives: DirectiveSet,
    pub purity: Purity,
    /// Array parameters native code may store into
    pub stored_params: Vec<usize>,
    pub code: CompiledCode,
    pub report: PipelineReport,
    /// Functions whose source the code was derived from
    pub dependencies: BTreeSet<String>,
    /// Module constants folded into the code
    pub globals_read: BTreeSet<String>,
}

impl CompiledArtifact {
    #[must_use]
    pub fn arg_kinds(&self) -> &[ValueKind] {
        self.code.arg_kinds()
    }

    #[must_use]
    pub fn ret(&self) -> ReturnKind {
        self.code.ret()
    }
}

/// What a decided verdict was derived from
#[derive(Debug, Clone, Default)]
pub(crate) struct Provenance {
    pub dependencies: BTreeSet<String>,
    pub globals_read: BTreeSet<String>,
}

/// One generation of a registered function
///
/// Invalidation never mutates an entry: it installs a fresh one, so a compilation that
/// finishes for an old generation lands on an entry nobody reads anymore.
pub(crate) struct Entry {
    pub unit: Arc<FunctionUnit>,
    pub generation: u64,
    pub counters: Arc<Counters>,
    state: AtomicU8,
    claimed: AtomicBool,
    artifact: OnceLock<Arc<CompiledArtifact>>,
    fallback: OnceLock<FallbackReason>,
    provenance: OnceLock<Provenance>,
}

impl Entry {
    pub fn new(unit: Arc<FunctionUnit>, generation: u64, counters: Arc<Counters>) -> Self {
        Self {
            unit,
            generation,
            counters,
            state: AtomicU8::new(DispatchState::Unanalyzed.to_u8()),
            claimed: AtomicBool::new(false),
            artifact: OnceLock::new(),
            fallback: OnceLock::new(),
            provenance: OnceLock::new(),
        }
    }

    pub fn state(&self) -> DispatchState {
        DispatchState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Take the single compile slot of this generation; true for exactly one caller
    pub fn claim(&self) -> bool {
        let won = self
            .claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            self.state
                .store(DispatchState::EligiblePending.to_u8(), Ordering::Release);
        }
        won
    }

    pub fn artifact(&self) -> Option<&Arc<CompiledArtifact>> {
        self.artifact.get()
    }

    pub fn provenance(&self) -> Option<&Provenance> {
        self.provenance.get()
    }

    pub fn verdict(&self) -> Option<Verdict> {
        match self.state() {
            DispatchState::Compiled => Some(Verdict::Compiled),
            DispatchState::Fallback => self.fallback.get().cloned().map(Verdict::Fallback),
            DispatchState::Unanalyzed | DispatchState::EligiblePending => None,
        }
    }

    /// Whether this generation's verdict was derived from `name`
    pub fn depends_on(&self, name: &str) -> bool {
        self.unit.name == name
            || self
                .provenance
                .get()
                .is_some_and(|p| p.dependencies.contains(name) || p.globals_read.contains(name))
    }

    pub fn record_provenance(&self, provenance: Provenance) {
        let _ = self.provenance.set(provenance);
    }

    /// Publish native code; the artifact is installed before the state says so
    pub fn finish_compiled(&self, artifact: Arc<CompiledArtifact>) {
        if self.artifact.set(artifact).is_ok() {
            self.state
                .store(DispatchState::Compiled.to_u8(), Ordering::Release);
        }
    }

    pub fn finish_fallback(&self, reason: FallbackReason) {
        if self.fallback.set(reason).is_ok() {
            self.claimed.store(true, Ordering::Release);
            self.state
                .store(DispatchState::Fallback.to_u8(), Ordering::Release);
        }
    }
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("name", &self.unit.name)
            .field("generation", &self.generation)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{FunctionSource, HostProgram};

    fn entry() -> Entry {
        let program = HostProgram::from_source("def f(n):\n    return n\n", 100).unwrap();
        Entry::new(Arc::new(FunctionUnit::new(program.function("f").unwrap())), 0, Arc::default())
    }

    #[test]
    fn only_one_claim_wins() {
        let entry = Arc::new(entry());
        let winners: usize = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let entry = Arc::clone(&entry);
                    s.spawn(move || usize::from(entry.claim()))
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });
        assert_eq!(winners, 1);
        assert_eq!(entry.state(), DispatchState::EligiblePending);
    }

    #[test]
    fn fallback_is_terminal() {
        let entry = entry();
        assert_eq!(entry.verdict(), None);
        entry.finish_fallback(FallbackReason::Rejected(Rejection::OptOut));
        assert_eq!(entry.state(), DispatchState::Fallback);
        assert!(!entry.claim());
        assert_eq!(
            entry.verdict(),
            Some(Verdict::Fallback(FallbackReason::Rejected(Rejection::OptOut)))
        );
    }

    #[test]
    fn provenance_drives_dependence() {
        let entry = entry();
        assert!(entry.depends_on("f"));
        assert!(!entry.depends_on("g"));
        entry.record_provenance(Provenance {
            dependencies: BTreeSet::from(["f".to_string(), "g".to_string()]),
            globals_read: BTreeSet::from(["SCALE".to_string()]),
        });
        assert!(entry.depends_on("g"));
        assert!(entry.depends_on("SCALE"));
    }
}
