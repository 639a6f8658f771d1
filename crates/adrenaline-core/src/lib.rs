//! Adrenaline Core - selective native compilation for numeric Python functions
//!
//! This crate provides:
//! - Lexer, AST and parser for the Python subset the host front end accepts
//! - Host: dynamic values and the reference interpreter
//! - Directives: `#adrenaline:` comments attached to function definitions
//! - Analysis: eligibility and typed specialization
//! - Optimization: inlining, loop normalization, hoisting, parallel and SIMD lowering
//! - JIT: Cranelift code generation with deoptimization back to the interpreter
//! - Dispatch: per-function state machine, background compilation and call routing

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Lexer module - tokenization of host source code
pub mod lexer;

/// Abstract Syntax Tree - parsed representation of host source code
pub mod ast;

/// Parser module - converts tokens into AST
pub mod parser;

/// Host collaborator - values, interpreter and program store
pub mod host;

/// Host arithmetic shared by the interpreter and generated code
pub mod numeric;

pub mod directive;

pub mod config;

pub mod error;

pub mod diagnostics;

pub mod unit;

/// Eligibility analysis and typed bodies
pub mod analysis;

/// Optimization passes over typed bodies
pub mod opt;

/// JIT compilation module (Cranelift-based)
/// JIT requires unsafe code for memory management and function pointers
#[allow(unsafe_code, clippy::missing_safety_doc)]
pub mod jit;

/// Call routing between native code and the interpreter
pub mod dispatch;

pub mod runtime;

/// Test utilities - helpers for testing compiled and interpreted execution
pub mod testutil;

/// Convenience re-export of lexer
pub use lexer::Lexer;

/// Convenience re-export of parser
pub use parser::Parser;

pub use analysis::{Analyzer, EligibilityVerdict, Rejection};
pub use config::{AdrenalineConfig, ConfigError, ExecutionOverride};
pub use diagnostics::{CollectingSink, Diagnostic, DiagnosticKind, DiagnosticSink, TracingSink};
pub use directive::{Directive, DirectiveSet};
pub use dispatch::{CompiledArtifact, DispatchState, Dispatcher, FallbackReason, FunctionStats, Verdict};
pub use error::{AdrenalineError, ErrorKind};
pub use host::{HostError, HostProgram, HostResult, Value};
pub use jit::JitCompiler;
pub use opt::{Pipeline, PipelineReport};
pub use runtime::{ReloadSummary, Runtime, RuntimeError};
pub use unit::{FunctionId, FunctionUnit};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_exists() {
        assert!(!VERSION.is_empty());
    }
}
