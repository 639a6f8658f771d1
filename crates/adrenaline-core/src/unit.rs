//! Compilation subjects
//!
//! A [`FunctionUnit`] is built once per distinct function definition and never changes.
//! Reloading a program produces new units; the source hash tells the dispatcher which ones
//! actually differ.

use std::fmt;
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::analysis::typed::{NumType, ValueKind};
use crate::ast::{Expr, ExprKind, FunctionDef, StmtKind};
use crate::ast::walk::visit_statements;
use crate::directive::{self, Directive, DirectiveSet};

/// Index of a unit in the dispatcher's arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionId(pub(crate) u32);

impl FunctionId {
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Declared kind of a parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamKind {
    Int,
    Float,
    Bool,
    IntArray,
    FloatArray,
    /// No usable annotation; specialized from the arguments seen at run time
    Unknown,
}

impl ParamKind {
    /// Read a parameter annotation (`int`, `float`, `bool`, `list[int]`, `list[float]`)
    #[must_use]
    pub fn from_annotation(annotation: Option<&Expr>) -> Self {
        let Some(annotation) = annotation else {
            return Self::Unknown;
        };
        match &annotation.kind {
            ExprKind::Name(name) => match name.as_str() {
                "int" => Self::Int,
                "float" => Self::Float,
                "bool" => Self::Bool,
                _ => Self::Unknown,
            },
            ExprKind::Subscript { value, index } => {
                let container = value.as_name();
                if !matches!(container, Some("list" | "List")) {
                    return Self::Unknown;
                }
                match index.as_name() {
                    Some("int") => Self::IntArray,
                    Some("float") => Self::FloatArray,
                    _ => Self::Unknown,
                }
            }
            _ => Self::Unknown,
        }
    }

    #[must_use]
    pub const fn value_kind(self) -> Option<ValueKind> {
        match self {
            Self::Int => Some(ValueKind::Scalar(NumType::Int)),
            Self::Float => Some(ValueKind::Scalar(NumType::Float)),
            Self::Bool => Some(ValueKind::Scalar(NumType::Bool)),
            Self::IntArray => Some(ValueKind::Array(NumType::Int)),
            Self::FloatArray => Some(ValueKind::Array(NumType::Float)),
            Self::Unknown => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub name: String,
    pub kind: ParamKind,
    pub has_default: bool,
}

/// A function definition prepared for analysis
#[derive(Debug, Clone)]
pub struct FunctionUnit {
    pub name: String,
    pub params: Vec<Parameter>,
    pub def: Arc<FunctionDef>,
    pub directives: DirectiveSet,
    /// Unrecognized directive names found in the documentation
    pub unknown_directives: Vec<String>,
    /// Directives dropped in favour of `no-compile`
    pub overridden_directives: Vec<Directive>,
    /// SHA-256 of the function's source text, lowercase hex
    pub source_hash: String,
}

impl FunctionUnit {
    #[must_use]
    pub fn new(def: Arc<FunctionDef>) -> Self {
        let extraction = directive::extract(&def.documentation());
        let params = def
            .params
            .iter()
            .map(|p| Parameter {
                name: p.name.name.clone(),
                kind: ParamKind::from_annotation(p.annotation.as_ref()),
                has_default: p.default.is_some(),
            })
            .collect();
        Self {
            name: def.name.name.clone(),
            params,
            source_hash: source_hash(&def.source),
            directives: extraction.directives,
            unknown_directives: extraction.unknown,
            overridden_directives: extraction.overridden,
            def,
        }
    }

    #[must_use]
    pub fn arity(&self) -> usize {
        self.params.len()
    }

    /// Parameter kinds known without seeing a call: annotations first, then `range(p)` usage
    ///
    /// Returns `None` when any parameter stays unknown.
    #[must_use]
    pub fn static_param_kinds(&self) -> Option<Vec<ValueKind>> {
        let range_args = range_argument_names(&self.def);
        self.params
            .iter()
            .map(|p| {
                p.kind.value_kind().or_else(|| {
                    range_args
                        .iter()
                        .any(|n| n == &p.name)
                        .then_some(ValueKind::Scalar(NumType::Int))
                })
            })
            .collect()
    }
}

/// Lowercase hex SHA-256 of `text`
#[must_use]
pub fn source_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

/// Plain names passed directly to `range(...)` anywhere in the body
fn range_argument_names(def: &FunctionDef) -> Vec<String> {
    let mut names = Vec::new();
    visit_statements(&def.body, &mut |stmt| {
        if let StmtKind::For { iter, .. } = &stmt.kind {
            if let ExprKind::Call { func, args, .. } = &iter.kind {
                if func.as_name() == Some("range") {
                    names.extend(args.iter().filter_map(|a| a.as_name().map(String::from)));
                }
            }
        }
    });
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Parser;

    fn unit(source: &str) -> FunctionUnit {
        let module = Parser::parse_module(source).unwrap();
        let def = module.functions().next().unwrap().clone();
        FunctionUnit::new(Arc::new(def))
    }

    #[test]
    fn annotations_become_kinds() {
        let u = unit("def f(a: int, b: list[float], c):\n    return a\n");
        assert_eq!(u.params[0].kind, ParamKind::Int);
        assert_eq!(u.params[1].kind, ParamKind::FloatArray);
        assert_eq!(u.params[2].kind, ParamKind::Unknown);
        assert_eq!(u.static_param_kinds(), None);
    }

    #[test]
    fn range_usage_infers_int() {
        let u = unit(
            "def sum_range(n):\n    # #adrenaline:hot\n    total = 0\n    for i in range(n):\n        total += i\n    return total\n",
        );
        assert!(u.directives.is_hot());
        assert_eq!(
            u.static_param_kinds(),
            Some(vec![ValueKind::Scalar(NumType::Int)])
        );
    }

    #[test]
    fn hash_tracks_source_text() {
        let a = unit("def f(x):\n    return x\n");
        let b = unit("def f(x):\n    return x + 1\n");
        let c = unit("def f(x):\n    return x\n");
        assert_ne!(a.source_hash, b.source_hash);
        assert_eq!(a.source_hash, c.source_hash);
        assert_eq!(a.source_hash.len(), 64);
    }

    #[test]
    fn conflicting_directives_are_recorded() {
        let u = unit("def f(x):\n    # #adrenaline:no-compile\n    # #adrenaline:simd\n    # #adrenaline:turbo\n    return x\n");
        assert!(!u.directives.should_compile());
        assert_eq!(u.overridden_directives, vec![Directive::Simd]);
        assert_eq!(u.unknown_directives, vec!["turbo".to_string()]);
    }
}
