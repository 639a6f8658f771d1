//! Optimization pipeline over typed bodies
//!
//! Passes run in a fixed order:
//!
//! 1. constant folding
//! 2. inlining
//! 3. loop normalization (`while` to counted loops)
//! 4. loop-invariant motion
//! 5. parallel lowering (`parallel`)
//! 6. SIMD lowering (`simd`)
//! 7. hot-path budget application (`hot`)
//!
//! Every pass is semantics preserving and idempotent. Loops a pass declines to transform
//! are recorded in the [`PipelineReport`] with the reason.

pub mod deps;
mod inline;
mod licm;
mod normalize;
mod parallel;
mod simd;

use std::fmt;

use tracing::debug;

use crate::analysis::fold;
use crate::analysis::typed::{FuncIndex, TypedBody};
use crate::config::AdrenalineConfig;
use crate::diagnostics::{Diagnostic, DiagnosticKind};

/// Name of each pass as it appears in reports
pub mod pass {
    pub const FOLD: &str = "fold";
    pub const INLINE: &str = "inline";
    pub const NORMALIZE: &str = "normalize";
    pub const LICM: &str = "licm";
    pub const PARALLEL: &str = "parallel";
    pub const SIMD: &str = "simd";
    pub const HOT: &str = "hot";
}

/// Settings shared by all passes for one pipeline run
#[derive(Debug, Clone, Copy)]
pub struct PassContext<'c> {
    pub config: &'c AdrenalineConfig,
    /// The root function carries `hot`
    pub hot: bool,
}

impl PassContext<'_> {
    fn scale(&self, limit: usize) -> usize {
        if self.hot {
            limit.saturating_mul(2)
        } else {
            limit
        }
    }

    /// Node budget for the expensive passes
    #[must_use]
    pub fn node_budget(&self) -> usize {
        self.scale(self.config.compile_node_budget)
    }

    /// Size cap for callees inlined on request
    #[must_use]
    pub fn inline_cap(&self) -> usize {
        self.scale(self.config.inline_directive_cap)
    }
}

/// What one pass did to one function
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub pass: &'static str,
    pub function: String,
    pub applied: Vec<String>,
    pub skipped: Vec<String>,
}

impl PassReport {
    fn new(pass: &'static str, function: &str) -> Self {
        Self {
            pass,
            function: function.to_string(),
            applied: Vec::new(),
            skipped: Vec::new(),
        }
    }

    pub(crate) fn applied(&mut self, what: impl Into<String>) {
        self.applied.push(what.into());
    }

    pub(crate) fn skipped(&mut self, why: impl Into<String>) {
        let why = why.into();
        if !self.skipped.contains(&why) {
            self.skipped.push(why);
        }
    }

    fn is_empty(&self) -> bool {
        self.applied.is_empty() && self.skipped.is_empty()
    }
}

impl fmt::Display for PassReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} on {}: {} applied, {} skipped",
            self.pass,
            self.function,
            self.applied.len(),
            self.skipped.len()
        )
    }
}

/// Reports of every pass that did or declined something
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineReport {
    pub passes: Vec<PassReport>,
    /// The body exceeded the node budget, so inlining and loop lowering were skipped
    pub over_budget: bool,
}

impl PipelineReport {
    fn push(&mut self, report: PassReport) {
        if !report.is_empty() {
            self.passes.push(report);
        }
    }

    /// Number of transformations `pass` applied
    #[must_use]
    pub fn applied(&self, pass: &str) -> usize {
        self.passes
            .iter()
            .filter(|r| r.pass == pass)
            .map(|r| r.applied.len())
            .sum()
    }

    /// Reasons `pass` declined to transform something
    #[must_use]
    pub fn skipped(&self, pass: &str) -> Vec<&str> {
        self.passes
            .iter()
            .filter(|r| r.pass == pass)
            .flat_map(|r| r.skipped.iter().map(String::as_str))
            .collect()
    }

    /// Reports as diagnostics for the observability sink
    #[must_use]
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        let mut out = Vec::new();
        for report in &self.passes {
            for applied in &report.applied {
                out.push(Diagnostic::new(
                    &report.function,
                    DiagnosticKind::PassApplied,
                    format!("{}: {applied}", report.pass),
                ));
            }
            for skipped in &report.skipped {
                out.push(Diagnostic::new(
                    &report.function,
                    DiagnosticKind::PassSkipped,
                    format!("{}: {skipped}", report.pass),
                ));
            }
        }
        out
    }
}

/// The fixed sequence of optimization passes
#[derive(Debug, Clone, Copy)]
pub struct Pipeline<'c> {
    config: &'c AdrenalineConfig,
}

impl<'c> Pipeline<'c> {
    pub fn new(config: &'c AdrenalineConfig) -> Self {
        Self { config }
    }

    /// Optimize `body` in place
    pub fn run(&self, body: &mut TypedBody) -> PipelineReport {
        let ctx = PassContext {
            config: self.config,
            hot: body.root().directives.is_hot(),
        };
        let mut report = PipelineReport::default();
        let size = body.node_count();
        report.over_budget = size > ctx.node_budget();

        for index in body.reachable() {
            let function = &mut body.functions[index.index()];
            let mut fold_report = PassReport::new(pass::FOLD, &function.name);
            let folded = fold::fold_function(function);
            if folded > 0 {
                fold_report.applied(format!("{folded} nodes folded"));
            }
            report.push(fold_report);
        }

        if report.over_budget {
            let mut skipped = PassReport::new(pass::INLINE, &body.root().name);
            skipped.skipped(format!(
                "body has {size} nodes, over the budget of {}",
                ctx.node_budget()
            ));
            report.push(skipped);
        } else {
            for index in body.reachable() {
                let mut inline_report = PassReport::new(pass::INLINE, &body.function(index).name);
                inline::run(body, index, &ctx, &mut inline_report);
                report.push(inline_report);
            }
        }

        // Inlining can leave specializations unreachable
        for index in body.reachable() {
            self.lower_loops(body, index, &ctx, &mut report);
        }

        if ctx.hot {
            let mut hot = PassReport::new(pass::HOT, &body.root().name);
            hot.applied(format!(
                "budget raised to {} nodes, inline cap to {}",
                ctx.node_budget(),
                ctx.inline_cap()
            ));
            report.push(hot);
        }

        debug!(
            event = "pipeline_finished",
            function = %body.root().name,
            nodes = body.node_count(),
            passes = report.passes.len(),
            over_budget = report.over_budget
        );
        report
    }

    fn lower_loops(&self, body: &mut TypedBody, index: FuncIndex, ctx: &PassContext<'_>, report: &mut PipelineReport) {
        let function = &mut body.functions[index.index()];
        let directives = function.directives;

        let mut normalize_report = PassReport::new(pass::NORMALIZE, &function.name);
        normalize::run(function, &mut normalize_report);
        report.push(normalize_report);

        let mut licm_report = PassReport::new(pass::LICM, &function.name);
        licm::run(function, &mut licm_report);
        report.push(licm_report);

        let lowering_allowed = !report.over_budget;
        if directives.wants_parallel() {
            let mut parallel_report = PassReport::new(pass::PARALLEL, &function.name);
            if lowering_allowed {
                parallel::run(function, &mut parallel_report);
            } else {
                parallel_report.skipped("over the node budget");
            }
            report.push(parallel_report);
        }
        if directives.wants_simd() {
            let mut simd_report = PassReport::new(pass::SIMD, &function.name);
            if lowering_allowed {
                simd::run(function, ctx, &mut simd_report);
            } else {
                simd_report.skipped("over the node budget");
            }
            report.push(simd_report);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::analysis::typed::{TStmt, ValueKind};
    use crate::analysis::{Analyzer, EligibilityVerdict};
    use crate::host::{FunctionSource, HostProgram};
    use crate::testutil::int;
    use crate::unit::FunctionUnit;

    pub(crate) fn optimized(source: &str, name: &str, kinds: &[ValueKind]) -> (TypedBody, PipelineReport) {
        optimized_with(source, name, kinds, &AdrenalineConfig::default())
    }

    pub(crate) fn optimized_with(
        source: &str,
        name: &str,
        kinds: &[ValueKind],
        config: &AdrenalineConfig,
    ) -> (TypedBody, PipelineReport) {
        let program = HostProgram::from_source(source, 1000).unwrap();
        let unit = FunctionUnit::new(program.function(name).unwrap());
        let EligibilityVerdict::Eligible(mut body) = Analyzer::new(&program).analyze(&unit, kinds).verdict else {
            panic!("{name} should be eligible");
        };
        let report = Pipeline::new(config).run(&mut body);
        (body, report)
    }

    const MATRIX: &str = "\
def matrix_multiply(size):
    # #adrenaline:hot
    # #adrenaline:simd
    # #adrenaline:parallel
    result = 0
    for i in range(size):
        for j in range(size):
            result += i * j
    return result
";

    #[test]
    fn parallel_then_simd_inside_partitions() {
        let (body, report) = optimized(MATRIX, "matrix_multiply", &[int()]);
        assert_eq!(report.applied(pass::PARALLEL), 1);
        assert_eq!(report.applied(pass::SIMD), 1);
        assert!(report.applied(pass::HOT) > 0);
        let parallel = body
            .root()
            .body
            .iter()
            .find_map(|s| match s {
                TStmt::Parallel(p) => Some(p),
                _ => None,
            })
            .unwrap();
        assert!(parallel.reduction.is_some());
        let mut vectors = 0;
        parallel.chunk.walk(&mut |s| {
            if matches!(s, TStmt::Vector(_)) {
                vectors += 1;
            }
        });
        assert_eq!(vectors, 1);
    }

    #[test]
    fn pipeline_is_idempotent() {
        let (mut body, _) = optimized(MATRIX, "matrix_multiply", &[int()]);
        let before = body.clone();
        let config = AdrenalineConfig::default();
        let report = Pipeline::new(&config).run(&mut body);
        assert_eq!(body, before);
        assert_eq!(report.applied(pass::PARALLEL), 0);
        assert_eq!(report.applied(pass::SIMD), 0);
    }

    #[test]
    fn over_budget_skips_lowering() {
        let config = AdrenalineConfig {
            compile_node_budget: 3,
            ..AdrenalineConfig::default()
        };
        let source = "def f(n):\n    # #adrenaline:simd\n    t = 0\n    for i in range(n):\n        t += i\n    return t\n";
        let (_, report) = optimized_with(source, "f", &[int()], &config);
        assert!(report.over_budget);
        assert_eq!(report.applied(pass::SIMD), 0);
        assert_eq!(report.skipped(pass::SIMD), vec!["over the node budget"]);
    }

    #[test]
    fn diagnostics_mirror_reports() {
        let source = "def f(a: list[int]):\n    # #adrenaline:simd\n    for i in range(1, len(a)):\n        a[i] = a[i - 1] + 1\n";
        let (_, report) = optimized(source, "f", &[ValueKind::Array(crate::analysis::typed::NumType::Int)]);
        let diagnostics = report.diagnostics();
        assert!(diagnostics
            .iter()
            .any(|d| d.kind == DiagnosticKind::PassSkipped && d.message.starts_with("simd:")));
    }
}
