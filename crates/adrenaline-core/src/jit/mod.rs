//! Native code generation with Cranelift
//!
//! # Architecture
//!
//! One optimized [`TypedBody`](crate::analysis::typed::TypedBody) becomes one JIT module:
//!
//! ```text
//! TypedBody → JitCompiler → Cranelift IR (functions, loop kernels, trampoline) → CompiledCode
//! ```
//!
//! Every reachable specialization is compiled as a native function with typed parameters.
//! Each outlined parallel loop becomes a kernel called by the parallel driver. A trampoline
//! with a fixed signature unpacks the [`Frame`] and calls the root.
//!
//! # Exactness
//!
//! Generated code never raises. Wherever host semantics would raise or produce a result
//! the native types cannot hold, the code sets a status flag and returns; the dispatcher
//! then runs the whole call in the interpreter. Compiled calls are therefore either exact
//! or invisible.

mod compiler;
mod lower;
pub mod runtime;
pub mod types;

pub use compiler::JitCompiler;
pub use runtime::{CompiledCode, ExecCtx, Frame};

use thiserror::Error;

/// Errors that can occur during code generation
#[derive(Debug, Error)]
pub enum JitError {
    /// Cranelift rejected the generated IR or could not be configured
    #[error("Cranelift compilation error: {0}")]
    Cranelift(String),

    /// A typed node the code generator has no lowering for
    #[error("Unsupported node: {0}")]
    Unsupported(String),

    /// Internal compiler error
    #[error("Internal JIT compiler error: {0}")]
    Internal(String),
}

/// Result type for JIT operations
pub type JitResult<T> = Result<T, JitError>;
