//! Host collaborator: dynamic values, the reference interpreter and the program store
//!
//! The engine consumes the host through two traits. [`FunctionSource`] hands out parsed
//! function definitions and module-level constants; [`HostInterpreter`] executes any
//! function with host semantics. [`HostProgram`] implements both for Python-subset source.
//!
//! Calls made from interpreted code go back through an [`Invoke`] implementation (normally
//! the dispatcher), so interpreted callers reach compiled callees and the other way round.

pub mod builtins;
mod interp;
mod program;
pub mod value;

use std::cell::Cell;
use std::sync::Arc;

use thiserror::Error;

use crate::ast::FunctionDef;
use crate::parser::ParseError;

pub use builtins::Builtin;
pub use interp::Interpreter;
pub use program::{HostProgram, ProgramState};
pub use value::{RangeValue, Value};

/// An exception raised by host execution
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HostError {
    #[error("OverflowError: {0}")]
    Overflow(String),

    #[error("ZeroDivisionError: {0}")]
    ZeroDivision(String),

    #[error("IndexError: {0}")]
    Index(String),

    #[error("KeyError: {0}")]
    Key(String),

    #[error("TypeError: {0}")]
    Type(String),

    #[error("ValueError: {0}")]
    Value(String),

    #[error("NameError: name '{0}' is not defined")]
    Name(String),

    #[error("UnboundLocalError: local variable '{0}' referenced before assignment")]
    UnboundLocal(String),

    #[error("RecursionError: maximum recursion depth exceeded")]
    Recursion,

    #[error("AttributeError: {0}")]
    Attribute(String),

    #[error("ImportError: {0}")]
    Import(String),

    /// Raised by a `raise` statement
    #[error("{kind}: {message}")]
    Raised { kind: String, message: String },
}

impl HostError {
    /// The exception class name
    #[must_use]
    pub fn kind_name(&self) -> &str {
        match self {
            Self::Overflow(_) => "OverflowError",
            Self::ZeroDivision(_) => "ZeroDivisionError",
            Self::Index(_) => "IndexError",
            Self::Key(_) => "KeyError",
            Self::Type(_) => "TypeError",
            Self::Value(_) => "ValueError",
            Self::Name(_) => "NameError",
            Self::UnboundLocal(_) => "UnboundLocalError",
            Self::Recursion => "RecursionError",
            Self::Attribute(_) => "AttributeError",
            Self::Import(_) => "ImportError",
            Self::Raised { kind, .. } => kind,
        }
    }

    /// The exception message (what `str(e)` shows)
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Self::Raised { message, .. } => message.clone(),
            Self::Recursion => "maximum recursion depth exceeded".to_string(),
            Self::Name(name) => format!("name '{name}' is not defined"),
            Self::UnboundLocal(name) => {
                format!("local variable '{name}' referenced before assignment")
            }
            Self::Overflow(m)
            | Self::ZeroDivision(m)
            | Self::Index(m)
            | Self::Key(m)
            | Self::Type(m)
            | Self::Value(m)
            | Self::Attribute(m)
            | Self::Import(m) => m.clone(),
        }
    }

    /// Whether an `except <class_name>` clause catches this exception
    #[must_use]
    pub fn is_instance_of(&self, class_name: &str) -> bool {
        let own = self.kind_name();
        if own == class_name || class_name == "Exception" || class_name == "BaseException" {
            return true;
        }
        matches!(
            (class_name, own),
            ("ArithmeticError", "OverflowError" | "ZeroDivisionError")
                | ("LookupError", "IndexError" | "KeyError")
                | ("NameError", "UnboundLocalError")
                | ("RuntimeError", "RecursionError")
        )
    }
}

/// Result type for host execution
pub type HostResult<T> = Result<T, HostError>;

/// Errors loading a host program
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("failed to parse program: {}", first_error(.0))]
    Parse(Vec<ParseError>),

    #[error("module initialization failed: {0}")]
    Init(HostError),
}

fn first_error(errors: &[ParseError]) -> String {
    errors
        .first()
        .map_or_else(|| "unknown error".to_string(), ToString::to_string)
}

/// Route for calls made by interpreted code
pub trait Invoke {
    fn invoke_by_name(&self, name: &str, args: Vec<Value>) -> HostResult<Value>;
}

/// Provider of function definitions and module constants
pub trait FunctionSource: Send + Sync {
    /// The current definition of a module-level function
    fn function(&self, name: &str) -> Option<Arc<FunctionDef>>;

    /// A module-level numeric constant: bound once from a literal and never declared `global`
    fn constant(&self, name: &str) -> Option<Value>;

    /// Names of all module-level functions in definition order
    fn function_names(&self) -> Vec<String>;
}

/// Executes functions with host semantics
pub trait HostInterpreter: Send + Sync {
    fn interpret(&self, name: &str, args: Vec<Value>, invoker: &dyn Invoke) -> HostResult<Value>;
}

/// A complete host collaborator
pub trait Host: FunctionSource + HostInterpreter {
    fn as_source(&self) -> &dyn FunctionSource;
}

impl<T: FunctionSource + HostInterpreter> Host for T {
    fn as_source(&self) -> &dyn FunctionSource {
        self
    }
}

thread_local! {
    static CALL_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// Current host call depth on this thread
#[must_use]
pub fn call_depth() -> u32 {
    CALL_DEPTH.with(Cell::get)
}

/// Marks one active host frame; the depth drops again when the guard is dropped
#[derive(Debug)]
pub struct DepthGuard(());

impl DepthGuard {
    /// Enter a frame, raising `RecursionError` beyond `limit`
    pub fn enter(limit: u32) -> HostResult<Self> {
        CALL_DEPTH.with(|depth| {
            let next = depth.get() + 1;
            if next > limit {
                return Err(HostError::Recursion);
            }
            depth.set(next);
            Ok(Self(()))
        })
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        CALL_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exception_hierarchy() {
        let err = HostError::ZeroDivision("division by zero".into());
        assert!(err.is_instance_of("ZeroDivisionError"));
        assert!(err.is_instance_of("ArithmeticError"));
        assert!(err.is_instance_of("Exception"));
        assert!(!err.is_instance_of("ValueError"));
        let err = HostError::Raised {
            kind: "ValueError".into(),
            message: "bad".into(),
        };
        assert!(err.is_instance_of("ValueError"));
        assert_eq!(err.to_string(), "ValueError: bad");
    }

    #[test]
    fn depth_guard_limits_and_restores() {
        let before = call_depth();
        {
            let _a = DepthGuard::enter(before + 2).unwrap();
            let _b = DepthGuard::enter(before + 2).unwrap();
            assert_eq!(call_depth(), before + 2);
            assert!(matches!(
                DepthGuard::enter(before + 2),
                Err(HostError::Recursion)
            ));
        }
        assert_eq!(call_depth(), before);
    }
}
