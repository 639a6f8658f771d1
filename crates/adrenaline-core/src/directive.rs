//! Compilation directives embedded in a function's leading documentation
//!
//! A directive is a line of the exact form `#adrenaline:<name>` inside the comments or
//! docstring that introduce a function:
//!
//! ```python
//! def matrix_multiply(size):
//!     """Matrix multiplication"""
//!     # #adrenaline:hot
//!     # #adrenaline:simd
//!     # #adrenaline:parallel
//!     ...
//! ```
//!
//! Unknown names are ignored so newer sources keep working with older engines.

use std::fmt;

/// Prefix that introduces a directive on a documentation line
pub const DIRECTIVE_PREFIX: &str = "#adrenaline:";

/// A single compilation hint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Directive {
    /// Compile eagerly at high priority with relaxed optimization budgets
    Hot,
    /// Inline this function into its callers (and inline callees into it)
    Inline,
    /// Vectorize eligible loops
    Simd,
    /// Partition eligible loops across the parallel worker pool
    Parallel,
    /// Never compile; always run in the host interpreter
    NoCompile,
}

impl Directive {
    /// All directives in canonical order
    pub const ALL: [Directive; 5] = [
        Directive::Hot,
        Directive::Inline,
        Directive::Simd,
        Directive::Parallel,
        Directive::NoCompile,
    ];

    /// Parse a directive name exactly as written after the prefix
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "hot" => Some(Self::Hot),
            "inline" => Some(Self::Inline),
            "simd" => Some(Self::Simd),
            "parallel" => Some(Self::Parallel),
            "no-compile" => Some(Self::NoCompile),
            _ => None,
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Hot => "hot",
            Self::Inline => "inline",
            Self::Simd => "simd",
            Self::Parallel => "parallel",
            Self::NoCompile => "no-compile",
        }
    }

    const fn bit(self) -> u8 {
        1 << self as u8
    }
}

impl fmt::Display for Directive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An order-independent set of directives attached to one function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DirectiveSet {
    bits: u8,
}

impl DirectiveSet {
    /// The empty set (default heuristics everywhere)
    #[must_use]
    pub const fn new() -> Self {
        Self { bits: 0 }
    }

    /// Insert a directive; duplicates collapse
    pub fn insert(&mut self, directive: Directive) {
        self.bits |= directive.bit();
    }

    /// Builder-style insert
    #[must_use]
    pub fn with(mut self, directive: Directive) -> Self {
        self.insert(directive);
        self
    }

    #[must_use]
    pub const fn contains(&self, directive: Directive) -> bool {
        self.bits & directive.bit() != 0
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.bits == 0
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.bits.count_ones() as usize
    }

    /// Directives in canonical order
    pub fn iter(&self) -> impl Iterator<Item = Directive> + '_ {
        Directive::ALL.into_iter().filter(|d| self.contains(*d))
    }

    #[must_use]
    pub const fn is_hot(&self) -> bool {
        self.contains(Directive::Hot)
    }

    #[must_use]
    pub const fn wants_inline(&self) -> bool {
        self.contains(Directive::Inline)
    }

    #[must_use]
    pub const fn wants_simd(&self) -> bool {
        self.contains(Directive::Simd)
    }

    #[must_use]
    pub const fn wants_parallel(&self) -> bool {
        self.contains(Directive::Parallel)
    }

    /// False when the function opted out of compilation
    #[must_use]
    pub const fn should_compile(&self) -> bool {
        !self.contains(Directive::NoCompile)
    }
}

impl FromIterator<Directive> for DirectiveSet {
    fn from_iter<I: IntoIterator<Item = Directive>>(iter: I) -> Self {
        let mut set = Self::new();
        for directive in iter {
            set.insert(directive);
        }
        set
    }
}

impl fmt::Display for DirectiveSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.iter().map(Directive::name).collect();
        write!(f, "{{{}}}", names.join(", "))
    }
}

/// Result of scanning documentation text
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Extraction {
    /// The effective directive set after conflict resolution
    pub directives: DirectiveSet,
    /// Names that followed the prefix but are not recognized
    pub unknown: Vec<String>,
    /// Directives dropped because `no-compile` was also present
    pub overridden: Vec<Directive>,
}

impl Extraction {
    /// True when conflicting directives were dropped
    #[must_use]
    pub fn has_conflict(&self) -> bool {
        !self.overridden.is_empty()
    }
}

/// Scan leading documentation text for directives
///
/// Each line is trimmed; a line may carry the directive directly (`#adrenaline:simd`) or
/// inside a comment marker (`# #adrenaline:simd`). The name runs up to the first whitespace.
#[must_use]
pub fn extract(text: &str) -> Extraction {
    let mut found = DirectiveSet::new();
    let mut unknown: Vec<String> = Vec::new();

    for line in text.lines() {
        let Some(name) = directive_name(line) else {
            continue;
        };
        match Directive::from_name(name) {
            Some(directive) => found.insert(directive),
            None => {
                if !unknown.iter().any(|u| u == name) {
                    unknown.push(name.to_string());
                }
            }
        }
    }

    if found.contains(Directive::NoCompile) && found.len() > 1 {
        let overridden = found
            .iter()
            .filter(|d| *d != Directive::NoCompile)
            .collect();
        return Extraction {
            directives: DirectiveSet::new().with(Directive::NoCompile),
            unknown,
            overridden,
        };
    }

    Extraction {
        directives: found,
        unknown,
        overridden: Vec::new(),
    }
}

fn directive_name(line: &str) -> Option<&str> {
    let line = line.trim();
    let line = match line.strip_prefix('#') {
        Some(rest) if rest.trim_start().starts_with(DIRECTIVE_PREFIX) => rest.trim_start(),
        _ => line,
    };
    let rest = line.strip_prefix(DIRECTIVE_PREFIX)?;
    let name = rest.split_whitespace().next()?;
    Some(name)
}
