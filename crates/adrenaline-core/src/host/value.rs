//! Dynamic host values

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::ast::Expr;
use crate::numeric;

use super::builtins::Builtin;

/// A mutable, shared list
pub type ListRef = Arc<RwLock<Vec<Value>>>;

/// A mutable, shared, insertion-ordered mapping
pub type DictRef = Arc<RwLock<Vec<(Value, Value)>>>;

/// A `lambda` together with the frame values it closed over
#[derive(Debug)]
pub struct Lambda {
    pub params: Vec<String>,
    pub body: Expr,
    pub captured: Vec<(String, Value)>,
}

/// A lazily evaluated `range(start, stop, step)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeValue {
    pub start: i64,
    pub stop: i64,
    pub step: i64,
}

impl RangeValue {
    #[must_use]
    pub fn len(&self) -> i64 {
        let (lo, hi, step) = if self.step > 0 {
            (self.start, self.stop, self.step)
        } else {
            (self.stop, self.start, -self.step)
        };
        if lo >= hi {
            0
        } else {
            let span = i128::from(hi) - i128::from(lo) - 1;
            (span / i128::from(step) + 1) as i64
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Element `k` (no bounds check)
    #[must_use]
    pub fn nth(&self, k: i64) -> i64 {
        self.start + k * self.step
    }
}

/// A host value
#[derive(Debug, Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    List(ListRef),
    Tuple(Arc<[Value]>),
    Dict(DictRef),
    Range(RangeValue),
    /// A module-level `def`, called by name through the dispatcher
    Function(Arc<str>),
    Builtin(Builtin),
    Lambda(Arc<Lambda>),
    /// An imported built-in module (`math`)
    Module(Arc<str>),
}

impl Value {
    pub fn str(s: impl AsRef<str>) -> Self {
        Self::Str(Arc::from(s.as_ref()))
    }

    #[must_use]
    pub fn list(items: Vec<Value>) -> Self {
        Self::List(Arc::new(RwLock::new(items)))
    }

    #[must_use]
    pub fn int_list(items: &[i64]) -> Self {
        Self::list(items.iter().copied().map(Value::Int).collect())
    }

    #[must_use]
    pub fn float_list(items: &[f64]) -> Self {
        Self::list(items.iter().copied().map(Value::Float).collect())
    }

    #[must_use]
    pub fn tuple(items: Vec<Value>) -> Self {
        Self::Tuple(Arc::from(items))
    }

    #[must_use]
    pub fn dict(entries: Vec<(Value, Value)>) -> Self {
        Self::Dict(Arc::new(RwLock::new(entries)))
    }

    /// The host type name used in error messages
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::None => "NoneType",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "str",
            Self::List(_) => "list",
            Self::Tuple(_) => "tuple",
            Self::Dict(_) => "dict",
            Self::Range(_) => "range",
            Self::Function(_) | Self::Lambda(_) => "function",
            Self::Builtin(_) => "builtin_function_or_method",
            Self::Module(_) => "module",
        }
    }

    #[must_use]
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::None => false,
            Self::Bool(b) => *b,
            Self::Int(i) => *i != 0,
            Self::Float(f) => *f != 0.0,
            Self::Str(s) => !s.is_empty(),
            Self::List(items) => !items.read().is_empty(),
            Self::Tuple(items) => !items.is_empty(),
            Self::Dict(entries) => !entries.read().is_empty(),
            Self::Range(range) => !range.is_empty(),
            Self::Function(_) | Self::Builtin(_) | Self::Lambda(_) | Self::Module(_) => true,
        }
    }

    #[must_use]
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Bool(b) => Some(*b as i64),
            _ => None,
        }
    }

    /// Numeric value as a float (ints convert with rounding)
    #[must_use]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            Self::Int(i) => Some(*i as f64),
            Self::Bool(b) => Some(f64::from(u8::from(*b))),
            _ => None,
        }
    }

    /// Snapshot of a list or tuple's elements
    #[must_use]
    pub fn as_items(&self) -> Option<Vec<Value>> {
        match self {
            Self::List(items) => Some(items.read().clone()),
            Self::Tuple(items) => Some(items.to_vec()),
            _ => None,
        }
    }

    #[must_use]
    pub const fn is_number(&self) -> bool {
        matches!(self, Self::Int(_) | Self::Float(_) | Self::Bool(_))
    }

    /// Host `==`
    #[must_use]
    pub fn py_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Self::None, Self::None) => true,
            (a, b) if a.is_number() && b.is_number() => {
                a.numeric_cmp(b) == Some(Ordering::Equal)
            }
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::List(a), Self::List(b)) => {
                Arc::ptr_eq(a, b) || seq_eq(&a.read(), &b.read())
            }
            (Self::Tuple(a), Self::Tuple(b)) => seq_eq(a, b),
            (Self::Dict(a), Self::Dict(b)) => {
                if Arc::ptr_eq(a, b) {
                    return true;
                }
                let (a, b) = (a.read(), b.read());
                a.len() == b.len()
                    && a.iter().all(|(k, v)| {
                        b.iter().any(|(k2, v2)| k.py_eq(k2) && v.py_eq(v2))
                    })
            }
            (Self::Range(a), Self::Range(b)) => a == b,
            (Self::Function(a), Self::Function(b)) | (Self::Module(a), Self::Module(b)) => a == b,
            (Self::Builtin(a), Self::Builtin(b)) => a == b,
            (Self::Lambda(a), Self::Lambda(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Ordering between two numbers (`None` for NaN or non-numbers)
    #[must_use]
    pub fn numeric_cmp(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Self::Float(a), Self::Float(b)) => a.partial_cmp(b),
            (Self::Float(a), b) => {
                numeric::compare_int_float(b.as_int()?, *a).map(Ordering::reverse)
            }
            (a, Self::Float(b)) => numeric::compare_int_float(a.as_int()?, *b),
            (a, b) => Some(a.as_int()?.cmp(&b.as_int()?)),
        }
    }

    /// Host `repr()`
    #[must_use]
    pub fn repr(&self) -> String {
        match self {
            Self::Str(s) => format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'")),
            other => other.to_string(),
        }
    }
}

fn seq_eq(a: &[Value], b: &[Value]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.py_eq(y))
}

/// Format a float the way the host prints it
#[must_use]
pub fn format_float(f: f64) -> String {
    if f.is_nan() {
        return "nan".to_string();
    }
    if f.is_infinite() {
        return if f > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    let magnitude = f.abs();
    if magnitude != 0.0 && !(1e-4..1e16).contains(&magnitude) {
        let formatted = format!("{f:e}");
        let (mantissa, exponent) = formatted.split_once('e').unwrap_or((&formatted, "0"));
        let (sign, digits) = match exponent.strip_prefix('-') {
            Some(digits) => ('-', digits),
            None => ('+', exponent),
        };
        return format!("{mantissa}e{sign}{digits:0>2}");
    }
    if f.fract() == 0.0 {
        format!("{f:.1}")
    } else {
        f.to_string()
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Bool(true) => f.write_str("True"),
            Self::Bool(false) => f.write_str("False"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => f.write_str(&format_float(*x)),
            Self::Str(s) => f.write_str(s),
            Self::List(items) => {
                let items: Vec<String> = items.read().iter().map(Value::repr).collect();
                write!(f, "[{}]", items.join(", "))
            }
            Self::Tuple(items) => {
                let parts: Vec<String> = items.iter().map(Value::repr).collect();
                if parts.len() == 1 {
                    write!(f, "({},)", parts[0])
                } else {
                    write!(f, "({})", parts.join(", "))
                }
            }
            Self::Dict(entries) => {
                let parts: Vec<String> = entries
                    .read()
                    .iter()
                    .map(|(k, v)| format!("{}: {}", k.repr(), v.repr()))
                    .collect();
                write!(f, "{{{}}}", parts.join(", "))
            }
            Self::Range(r) => {
                if r.step == 1 {
                    write!(f, "range({}, {})", r.start, r.stop)
                } else {
                    write!(f, "range({}, {}, {})", r.start, r.stop, r.step)
                }
            }
            Self::Function(name) => write!(f, "<function {name}>"),
            Self::Builtin(builtin) => write!(f, "<built-in function {}>", builtin.name()),
            Self::Lambda(_) => f.write_str("<function <lambda>>"),
            Self::Module(name) => write!(f, "<module '{name}'>"),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.py_eq(other)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::str(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_equality_crosses_types() {
        assert_eq!(Value::Int(1), Value::Float(1.0));
        assert_eq!(Value::Bool(true), Value::Int(1));
        assert_ne!(Value::Float(f64::NAN), Value::Float(f64::NAN));
        assert_ne!(Value::Int(1), Value::str("1"));
    }

    #[test]
    fn truthiness() {
        assert!(!Value::None.is_truthy());
        assert!(!Value::Int(0).is_truthy());
        assert!(Value::Float(f64::NAN).is_truthy());
        assert!(!Value::list(vec![]).is_truthy());
        assert!(!Value::Range(RangeValue { start: 5, stop: 5, step: 1 }).is_truthy());
    }

    #[test]
    fn range_length() {
        let r = |start, stop, step| RangeValue { start, stop, step }.len();
        assert_eq!(r(0, 10, 1), 10);
        assert_eq!(r(0, 10, 3), 4);
        assert_eq!(r(10, 0, -3), 4);
        assert_eq!(r(5, 0, 1), 0);
        assert_eq!(r(i64::MIN, i64::MAX, i64::MAX), 3);
    }

    #[test]
    fn float_formatting_matches_host() {
        assert_eq!(format_float(1.0), "1.0");
        assert_eq!(format_float(0.5), "0.5");
        assert_eq!(format_float(1e16), "1e+16");
        assert_eq!(format_float(1.5e-7), "1.5e-07");
        assert_eq!(format_float(-0.0), "-0.0");
        assert_eq!(format_float(f64::NEG_INFINITY), "-inf");
    }

    #[test]
    fn display_and_repr() {
        let v = Value::list(vec![Value::Int(1), Value::str("a"), Value::None]);
        assert_eq!(v.to_string(), "[1, 'a', None]");
        assert_eq!(Value::tuple(vec![Value::Int(1)]).to_string(), "(1,)");
        let d = Value::dict(vec![(Value::str("count"), Value::Int(42))]);
        assert_eq!(d.to_string(), "{'count': 42}");
    }

    #[test]
    fn lists_share_storage() {
        let a = Value::int_list(&[1, 2]);
        let b = a.clone();
        if let Value::List(items) = &a {
            items.write().push(Value::Int(3));
        }
        assert_eq!(b.as_items().unwrap().len(), 3);
    }
}
