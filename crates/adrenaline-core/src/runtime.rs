//! Program plus dispatcher
//!
//! [`Runtime`] is the embedding surface: it loads a program, registers every module
//! function with a [`Dispatcher`] and routes calls, including calls made from interpreted
//! code, through it. [`Runtime::reload`] swaps in new source and invalidates only what the
//! change can affect.

use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use crate::config::{AdrenalineConfig, ConfigError};
use crate::diagnostics::{DiagnosticSink, TracingSink};
use crate::dispatch::Dispatcher;
use crate::host::{FunctionSource, HostProgram, HostResult, Invoke, LoadError, Value};
use crate::unit::FunctionUnit;

/// Errors creating a [`Runtime`]
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Load(#[from] LoadError),
}

/// What a reload changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReloadSummary {
    pub added: Vec<String>,
    /// Functions whose source hash changed
    pub changed: Vec<String>,
    pub removed: Vec<String>,
    /// Every function that lost its compile decision, dependents included
    pub invalidated: Vec<String>,
}

/// A loaded program whose calls go through the dispatcher
#[derive(Debug)]
pub struct Runtime {
    program: Arc<HostProgram>,
    dispatcher: Dispatcher,
}

impl Runtime {
    pub fn from_source(source: &str, config: AdrenalineConfig) -> Result<Self, RuntimeError> {
        Self::with_sink(source, config, Arc::new(TracingSink))
    }

    pub fn with_sink(
        source: &str,
        config: AdrenalineConfig,
        sink: Arc<dyn DiagnosticSink>,
    ) -> Result<Self, RuntimeError> {
        config.validate()?;
        let program = Arc::new(HostProgram::from_source(source, config.max_recursion_depth)?);
        let dispatcher = Dispatcher::with_sink(program.clone(), config, sink);
        let runtime = Self { program, dispatcher };
        for name in runtime.program.function_names() {
            if let Some(def) = runtime.program.function(&name) {
                runtime.dispatcher.register(FunctionUnit::new(def));
            }
        }
        Ok(runtime)
    }

    /// Call a module function by name
    pub fn call(&self, name: &str, args: Vec<Value>) -> HostResult<Value> {
        self.dispatcher.invoke_by_name(name, args)
    }

    /// Run the module body as `__main__`, with its calls dispatched
    pub fn run_main(&self) -> HostResult<()> {
        self.program.run_main(&self.dispatcher)
    }

    /// Everything `print` has written so far
    pub fn take_output(&self) -> String {
        self.program.take_output()
    }

    #[must_use]
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    #[must_use]
    pub fn program(&self) -> &HostProgram {
        &self.program
    }

    /// Replace the program source
    ///
    /// Functions whose source hash is unchanged keep their compiled code unless something
    /// they were derived from (a callee or a captured constant) changed. On error the
    /// previous program stays active and nothing is invalidated.
    pub fn reload(&self, source: &str) -> Result<ReloadSummary, LoadError> {
        let before: Vec<(String, String)> = self
            .dispatcher
            .function_names()
            .into_iter()
            .filter_map(|name| {
                let id = self.dispatcher.resolve(&name)?;
                let unit = self.dispatcher.unit(id)?;
                Some((name, unit.source_hash.clone()))
            })
            .collect();
        let constants: Vec<(String, Option<Value>)> = self
            .dispatcher
            .globals_in_use()
            .into_iter()
            .map(|name| {
                let value = self.program.constant(&name);
                (name, value)
            })
            .collect();

        self.program.reload(source)?;

        let mut summary = ReloadSummary::default();
        let current = self.program.function_names();
        for name in &current {
            let Some(def) = self.program.function(name) else {
                continue;
            };
            let unit = FunctionUnit::new(def);
            match before.iter().find(|(n, _)| n == name) {
                None => {
                    summary.added.push(name.clone());
                    self.dispatcher.register(unit);
                }
                Some((_, hash)) if *hash != unit.source_hash => {
                    summary.changed.push(name.clone());
                    summary.invalidated.extend(self.dispatcher.replace(unit));
                }
                Some(_) => {}
            }
        }
        for (name, _) in &before {
            if !current.contains(name) {
                summary.removed.push(name.clone());
                summary.invalidated.extend(self.dispatcher.remove(name));
            }
        }
        for (name, old) in constants {
            let new = self.program.constant(&name);
            if !same_constant(old.as_ref(), new.as_ref()) {
                summary.invalidated.extend(self.dispatcher.invalidate(&name));
            }
        }
        summary.invalidated.sort();
        summary.invalidated.dedup();

        info!(
            event = "reloaded",
            added = summary.added.len(),
            changed = summary.changed.len(),
            removed = summary.removed.len(),
            invalidated = summary.invalidated.len(),
        );
        Ok(summary)
    }
}

/// Constants are equal only when both kind and value agree (`1` and `1.0` differ)
fn same_constant(old: Option<&Value>, new: Option<&Value>) -> bool {
    match (old, new) {
        (Some(a), Some(b)) => a.type_name() == b.type_name() && a.py_eq(b),
        (None, None) => true,
        _ => false,
    }
}
