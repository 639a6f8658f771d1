//! Diagnostics reported to an observability collaborator
//!
//! Rejections, skipped loops and codegen failures are not errors from the caller's point of
//! view: they are reported here and the function keeps running through the interpreter.

use std::fmt;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

/// What a [`Diagnostic`] is about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiagnosticKind {
    /// Eligibility analysis rejected the function
    Rejected,
    /// Directives that cannot coexist were dropped
    DirectiveConflict,
    /// An optimization pass declined to transform a loop or call
    PassSkipped,
    /// An optimization pass transformed the body
    PassApplied,
    /// Code generation failed after analysis succeeded
    CodegenFailed,
    /// A `#adrenaline:` line named an unknown directive
    UnknownDirective,
    /// A compiled or rejected function was invalidated by a source change
    Invalidated,
}

impl DiagnosticKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Rejected => "rejected",
            Self::DirectiveConflict => "directive_conflict",
            Self::PassSkipped => "pass_skipped",
            Self::PassApplied => "pass_applied",
            Self::CodegenFailed => "codegen_failed",
            Self::UnknownDirective => "unknown_directive",
            Self::Invalidated => "invalidated",
        }
    }
}

impl fmt::Display for DiagnosticKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One observation about one function
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub function: String,
    pub kind: DiagnosticKind,
    pub message: String,
}

impl Diagnostic {
    pub fn new(function: impl Into<String>, kind: DiagnosticKind, message: impl Into<String>) -> Self {
        Self {
            function: function.into(),
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.kind, self.function, self.message)
    }
}

/// Receiver of diagnostics
pub trait DiagnosticSink: Send + Sync {
    fn report(&self, diagnostic: Diagnostic);
}

/// Forwards every diagnostic to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn report(&self, diagnostic: Diagnostic) {
        let Diagnostic {
            function,
            kind,
            message,
        } = diagnostic;
        match kind {
            DiagnosticKind::Rejected
            | DiagnosticKind::CodegenFailed
            | DiagnosticKind::DirectiveConflict => {
                warn!(event = kind.as_str(), function = %function, message = %message);
            }
            DiagnosticKind::PassSkipped | DiagnosticKind::UnknownDirective => {
                debug!(event = kind.as_str(), function = %function, message = %message);
            }
            DiagnosticKind::PassApplied | DiagnosticKind::Invalidated => {
                info!(event = kind.as_str(), function = %function, message = %message);
            }
        }
    }
}

/// Buffers diagnostics in memory
#[derive(Debug, Default)]
pub struct CollectingSink {
    diagnostics: Mutex<Vec<Diagnostic>>,
}

impl CollectingSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything reported so far
    #[must_use]
    pub fn snapshot(&self) -> Vec<Diagnostic> {
        self.diagnostics.lock().clone()
    }

    /// Drain the buffer
    pub fn take(&self) -> Vec<Diagnostic> {
        std::mem::take(&mut *self.diagnostics.lock())
    }

    /// Diagnostics of one kind for one function
    #[must_use]
    pub fn matching(&self, function: &str, kind: DiagnosticKind) -> Vec<Diagnostic> {
        self.diagnostics
            .lock()
            .iter()
            .filter(|d| d.function == function && d.kind == kind)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn count(&self, kind: DiagnosticKind) -> usize {
        self.diagnostics.lock().iter().filter(|d| d.kind == kind).count()
    }
}

impl DiagnosticSink for CollectingSink {
    fn report(&self, diagnostic: Diagnostic) {
        self.diagnostics.lock().push(diagnostic);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collecting_sink_buffers_and_drains() {
        let sink = CollectingSink::new();
        sink.report(Diagnostic::new("f", DiagnosticKind::Rejected, "attribute access"));
        sink.report(Diagnostic::new("g", DiagnosticKind::PassApplied, "inlined 'h'"));
        assert_eq!(sink.count(DiagnosticKind::Rejected), 1);
        assert_eq!(sink.matching("g", DiagnosticKind::PassApplied).len(), 1);
        assert_eq!(sink.take().len(), 2);
        assert!(sink.snapshot().is_empty());
    }

    #[test]
    fn display_includes_kind() {
        let d = Diagnostic::new("f", DiagnosticKind::PassSkipped, "loop at 3: carried dependency");
        assert_eq!(d.to_string(), "[pass_skipped] f: loop at 3: carried dependency");
    }

    #[test]
    fn tracing_sink_accepts_every_kind() {
        let sink = TracingSink;
        for kind in [
            DiagnosticKind::Rejected,
            DiagnosticKind::DirectiveConflict,
            DiagnosticKind::PassSkipped,
            DiagnosticKind::PassApplied,
            DiagnosticKind::CodegenFailed,
            DiagnosticKind::UnknownDirective,
            DiagnosticKind::Invalidated,
        ] {
            sink.report(Diagnostic::new("f", kind, "message"));
        }
    }
}
