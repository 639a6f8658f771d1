//! Engine configuration (`adrenaline.toml`) parsing and validation.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Errors that can occur when loading a configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for '{field}': {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

/// Global override of per-function execution decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionOverride {
    /// Never compile; every function runs in the host interpreter
    InterpretAll,
    /// Queue every function for compilation at registration, ignoring the call threshold
    CompileAll,
}

/// Tunables for analysis, optimization, code generation and dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AdrenalineConfig {
    /// Number of background compile worker threads.
    pub compile_workers: usize,

    /// Compile on background workers; when false the triggering call compiles inline
    /// (and still runs interpreted itself).
    pub background_compile: bool,

    /// Calls before a function without `hot` is queued for compilation.
    pub compile_threshold: u64,

    /// Callees whose typed body has at most this many nodes are inlined without a directive.
    pub inline_node_threshold: usize,

    /// Size cap for callees inlined because of an `inline` directive.
    pub inline_directive_cap: usize,

    /// Maximum nesting of inlined bodies.
    pub inline_depth: usize,

    /// Functions larger than this (in typed nodes) skip the expensive passes unless `hot`.
    pub compile_node_budget: usize,

    /// Lanes used by the lane-split vector form.
    pub vector_width: usize,

    /// Threads in the pool running parallel loops; 0 uses the hardware concurrency.
    pub parallel_workers: usize,

    /// Smallest number of iterations given to one parallel task.
    pub min_chunk: usize,

    /// Number of chunks a large parallel loop is split into.
    pub target_chunks: usize,

    /// Call depth at which both the interpreter and compiled code stop recursing.
    pub max_recursion_depth: u32,

    /// Optional global override.
    pub execution_override: Option<ExecutionOverride>,
}

impl Default for AdrenalineConfig {
    fn default() -> Self {
        Self {
            compile_workers: 2,
            background_compile: true,
            compile_threshold: 1,
            inline_node_threshold: 20,
            inline_directive_cap: 200,
            inline_depth: 4,
            compile_node_budget: 2000,
            vector_width: 4,
            parallel_workers: 0,
            min_chunk: 64,
            target_chunks: 64,
            max_recursion_depth: 1000,
            execution_override: None,
        }
    }
}

impl AdrenalineConfig {
    /// Create a configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a configuration from a TOML file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse a configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize the configuration to a TOML string.
    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.compile_workers == 0 {
            return Err(ConfigError::Invalid {
                field: "compile_workers",
                reason: "at least one compile worker is required",
            });
        }
        if !self.vector_width.is_power_of_two() || self.vector_width > 16 {
            return Err(ConfigError::Invalid {
                field: "vector_width",
                reason: "must be a power of two between 1 and 16",
            });
        }
        if self.min_chunk == 0 {
            return Err(ConfigError::Invalid {
                field: "min_chunk",
                reason: "must be positive",
            });
        }
        if self.target_chunks == 0 {
            return Err(ConfigError::Invalid {
                field: "target_chunks",
                reason: "must be positive",
            });
        }
        if self.max_recursion_depth == 0 {
            return Err(ConfigError::Invalid {
                field: "max_recursion_depth",
                reason: "must be positive",
            });
        }
        Ok(())
    }

    /// Set the number of background compile workers
    #[must_use]
    pub fn with_compile_workers(mut self, workers: usize) -> Self {
        self.compile_workers = workers;
        self
    }

    /// Compile on the calling thread instead of the worker pool
    #[must_use]
    pub fn with_background_compile(mut self, background: bool) -> Self {
        self.background_compile = background;
        self
    }

    /// Set the call-count threshold for lazy compilation
    #[must_use]
    pub fn with_compile_threshold(mut self, threshold: u64) -> Self {
        self.compile_threshold = threshold;
        self
    }

    /// Set the lane count of the lane-split vector form
    #[must_use]
    pub fn with_vector_width(mut self, width: usize) -> Self {
        self.vector_width = width;
        self
    }

    /// Set the size of the parallel loop pool
    #[must_use]
    pub fn with_parallel_workers(mut self, workers: usize) -> Self {
        self.parallel_workers = workers;
        self
    }

    /// Set the minimum parallel chunk size
    #[must_use]
    pub fn with_min_chunk(mut self, min_chunk: usize) -> Self {
        self.min_chunk = min_chunk;
        self
    }

    /// Set the global execution override
    #[must_use]
    pub fn with_override(mut self, mode: ExecutionOverride) -> Self {
        self.execution_override = Some(mode);
        self
    }

    /// Threads to build the parallel pool with
    #[must_use]
    pub fn effective_parallel_workers(&self) -> usize {
        if self.parallel_workers > 0 {
            self.parallel_workers
        } else {
            std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
        }
    }
}
