//! Built-in functions and the `math` module

use std::sync::Arc;

use crate::numeric::{self, NumericError};

use super::value::{RangeValue, Value};
use super::{HostError, HostResult};

/// A built-in callable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Builtin {
    Range,
    Len,
    Abs,
    Min,
    Max,
    Int,
    Float,
    Bool,
    Sum,
    Str,
    List,
    Print,
    /// A function of the `math` module
    Math(MathFn),
}

/// Functions exposed by the built-in `math` module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MathFn {
    Sqrt,
    Floor,
    Ceil,
    Exp,
    Log,
    Sin,
    Cos,
    Fabs,
    Isnan,
}

impl Builtin {
    /// Resolve a global builtin by name
    #[must_use]
    pub fn lookup(name: &str) -> Option<Self> {
        Some(match name {
            "range" => Self::Range,
            "len" => Self::Len,
            "abs" => Self::Abs,
            "min" => Self::Min,
            "max" => Self::Max,
            "int" => Self::Int,
            "float" => Self::Float,
            "bool" => Self::Bool,
            "sum" => Self::Sum,
            "str" => Self::Str,
            "list" => Self::List,
            "print" => Self::Print,
            _ => return None,
        })
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Range => "range",
            Self::Len => "len",
            Self::Abs => "abs",
            Self::Min => "min",
            Self::Max => "max",
            Self::Int => "int",
            Self::Float => "float",
            Self::Bool => "bool",
            Self::Sum => "sum",
            Self::Str => "str",
            Self::List => "list",
            Self::Print => "print",
            Self::Math(f) => f.name(),
        }
    }
}

impl MathFn {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Sqrt => "sqrt",
            Self::Floor => "floor",
            Self::Ceil => "ceil",
            Self::Exp => "exp",
            Self::Log => "log",
            Self::Sin => "sin",
            Self::Cos => "cos",
            Self::Fabs => "fabs",
            Self::Isnan => "isnan",
        }
    }
}

/// Attribute of the `math` module
pub fn math_attribute(attr: &str) -> HostResult<Value> {
    let function = match attr {
        "pi" => return Ok(Value::Float(std::f64::consts::PI)),
        "e" => return Ok(Value::Float(std::f64::consts::E)),
        "inf" => return Ok(Value::Float(f64::INFINITY)),
        "nan" => return Ok(Value::Float(f64::NAN)),
        "sqrt" => MathFn::Sqrt,
        "floor" => MathFn::Floor,
        "ceil" => MathFn::Ceil,
        "exp" => MathFn::Exp,
        "log" => MathFn::Log,
        "sin" => MathFn::Sin,
        "cos" => MathFn::Cos,
        "fabs" => MathFn::Fabs,
        "isnan" => MathFn::Isnan,
        _ => {
            return Err(HostError::Attribute(format!(
                "module 'math' has no attribute '{attr}'"
            )))
        }
    };
    Ok(Value::Builtin(Builtin::Math(function)))
}

/// Map a numeric failure to the host exception it raises
#[must_use]
pub fn numeric_error(err: NumericError) -> HostError {
    match err {
        NumericError::Overflow => HostError::Overflow(err.message().to_string()),
        NumericError::ZeroDivision => HostError::ZeroDivision(err.message().to_string()),
        NumericError::Domain | NumericError::NegativeShift => {
            HostError::Value(err.message().to_string())
        }
    }
}

fn arity(name: &str, args: &[Value], min: usize, max: usize) -> HostResult<()> {
    if args.len() < min || args.len() > max {
        let expected = if min == max {
            format!("{min}")
        } else {
            format!("{min} to {max}")
        };
        return Err(HostError::Type(format!(
            "{name}() takes {expected} arguments ({} given)",
            args.len()
        )));
    }
    Ok(())
}

fn int_arg(name: &str, value: &Value) -> HostResult<i64> {
    match value {
        Value::Int(i) => Ok(*i),
        Value::Bool(b) => Ok(i64::from(*b)),
        other => Err(HostError::Type(format!(
            "'{}' object cannot be interpreted as an integer in {name}()",
            other.type_name()
        ))),
    }
}

fn float_arg(name: &str, value: &Value) -> HostResult<f64> {
    value.as_float().ok_or_else(|| {
        HostError::Type(format!(
            "{name}() argument must be a real number, not '{}'",
            value.type_name()
        ))
    })
}

/// Elements of an iterable value
pub fn iterate(value: &Value) -> HostResult<Vec<Value>> {
    match value {
        Value::List(items) => Ok(items.read().clone()),
        Value::Tuple(items) => Ok(items.to_vec()),
        Value::Range(range) => Ok((0..range.len()).map(|k| Value::Int(range.nth(k))).collect()),
        Value::Str(s) => Ok(s.chars().map(|c| Value::str(c.to_string())).collect()),
        Value::Dict(entries) => Ok(entries.read().iter().map(|(k, _)| k.clone()).collect()),
        other => Err(HostError::Type(format!(
            "'{}' object is not iterable",
            other.type_name()
        ))),
    }
}

/// `len(value)`
pub fn length(value: &Value) -> HostResult<i64> {
    let len = match value {
        Value::List(items) => items.read().len(),
        Value::Tuple(items) => items.len(),
        Value::Dict(entries) => entries.read().len(),
        Value::Str(s) => s.chars().count(),
        Value::Range(range) => return Ok(range.len()),
        other => {
            return Err(HostError::Type(format!(
                "object of type '{}' has no len()",
                other.type_name()
            )))
        }
    };
    Ok(len as i64)
}

/// Host addition, shared with `sum()`
pub fn add(a: &Value, b: &Value) -> HostResult<Value> {
    match (a, b) {
        (Value::Float(_), _) | (_, Value::Float(_)) if a.is_number() && b.is_number() => {
            Ok(Value::Float(float_arg("+", a)? + float_arg("+", b)?))
        }
        (x, y) if x.is_number() && y.is_number() => {
            let (x, y) = (int_arg("+", x)?, int_arg("+", y)?);
            x.checked_add(y)
                .map(Value::Int)
                .ok_or_else(|| numeric_error(NumericError::Overflow))
        }
        (Value::Str(x), Value::Str(y)) => Ok(Value::str(format!("{x}{y}"))),
        (Value::List(x), Value::List(y)) => {
            let mut items = x.read().clone();
            items.extend(y.read().iter().cloned());
            Ok(Value::list(items))
        }
        (Value::Tuple(x), Value::Tuple(y)) => {
            Ok(Value::tuple(x.iter().chain(y.iter()).cloned().collect()))
        }
        _ => Err(HostError::Type(format!(
            "unsupported operand type(s) for +: '{}' and '{}'",
            a.type_name(),
            b.type_name()
        ))),
    }
}

fn extreme(name: &str, args: Vec<Value>, want: std::cmp::Ordering) -> HostResult<Value> {
    let candidates = if args.len() == 1 {
        iterate(&args[0])?
    } else {
        args
    };
    let mut iter = candidates.into_iter();
    let mut best = iter
        .next()
        .ok_or_else(|| HostError::Value(format!("{name}() arg is an empty sequence")))?;
    for candidate in iter {
        if !(candidate.is_number() && best.is_number()) {
            return Err(HostError::Type(format!(
                "{name}() between instances of '{}' and '{}'",
                candidate.type_name(),
                best.type_name()
            )));
        }
        // NaN never compares as better, so the earlier value stays
        if candidate.numeric_cmp(&best) == Some(want) {
            best = candidate;
        }
    }
    Ok(best)
}

impl Builtin {
    /// Call a builtin that does not need interpreter state (everything except `print`)
    pub fn call(self, args: Vec<Value>) -> HostResult<Value> {
        let name = self.name();
        match self {
            Self::Range => {
                arity(name, &args, 1, 3)?;
                let ints: Vec<i64> = args
                    .iter()
                    .map(|a| int_arg(name, a))
                    .collect::<HostResult<_>>()?;
                let (start, stop, step) = match ints.as_slice() {
                    [stop] => (0, *stop, 1),
                    [start, stop] => (*start, *stop, 1),
                    [start, stop, step] => (*start, *stop, *step),
                    _ => return Err(HostError::Type("range expected 1 to 3 arguments".into())),
                };
                if step == 0 {
                    return Err(HostError::Value("range() arg 3 must not be zero".into()));
                }
                Ok(Value::Range(RangeValue { start, stop, step }))
            }
            Self::Len => {
                arity(name, &args, 1, 1)?;
                Ok(Value::Int(length(&args[0])?))
            }
            Self::Abs => {
                arity(name, &args, 1, 1)?;
                match &args[0] {
                    Value::Int(i) => i
                        .checked_abs()
                        .map(Value::Int)
                        .ok_or_else(|| numeric_error(NumericError::Overflow)),
                    Value::Bool(b) => Ok(Value::Int(i64::from(*b))),
                    Value::Float(f) => Ok(Value::Float(f.abs())),
                    other => Err(HostError::Type(format!(
                        "bad operand type for abs(): '{}'",
                        other.type_name()
                    ))),
                }
            }
            Self::Min => extreme(name, args, std::cmp::Ordering::Less),
            Self::Max => extreme(name, args, std::cmp::Ordering::Greater),
            Self::Int => {
                arity(name, &args, 0, 1)?;
                match args.first() {
                    None => Ok(Value::Int(0)),
                    Some(Value::Int(i)) => Ok(Value::Int(*i)),
                    Some(Value::Bool(b)) => Ok(Value::Int(i64::from(*b))),
                    Some(Value::Float(f)) => numeric::float_to_int(*f).map(Value::Int).map_err(
                        |e| match e {
                            NumericError::Domain => {
                                HostError::Value("cannot convert float NaN to integer".into())
                            }
                            _ => HostError::Overflow(
                                "cannot convert float infinity or out-of-range float to integer"
                                    .into(),
                            ),
                        },
                    ),
                    Some(Value::Str(s)) => s.trim().parse::<i64>().map(Value::Int).map_err(|_| {
                        HostError::Value(format!("invalid literal for int() with base 10: '{s}'"))
                    }),
                    Some(other) => Err(HostError::Type(format!(
                        "int() argument must be a string or a number, not '{}'",
                        other.type_name()
                    ))),
                }
            }
            Self::Float => {
                arity(name, &args, 0, 1)?;
                match args.first() {
                    None => Ok(Value::Float(0.0)),
                    Some(Value::Str(s)) => parse_float(s).map(Value::Float).ok_or_else(|| {
                        HostError::Value(format!("could not convert string to float: '{s}'"))
                    }),
                    Some(other) => Ok(Value::Float(float_arg(name, other)?)),
                }
            }
            Self::Bool => {
                arity(name, &args, 0, 1)?;
                Ok(Value::Bool(args.first().is_some_and(Value::is_truthy)))
            }
            Self::Sum => {
                arity(name, &args, 1, 2)?;
                let mut total = args.get(1).cloned().unwrap_or(Value::Int(0));
                for item in iterate(&args[0])? {
                    total = add(&total, &item)?;
                }
                Ok(total)
            }
            Self::Str => {
                arity(name, &args, 0, 1)?;
                Ok(Value::str(args.first().map(ToString::to_string).unwrap_or_default()))
            }
            Self::List => {
                arity(name, &args, 0, 1)?;
                match args.first() {
                    None => Ok(Value::list(Vec::new())),
                    Some(iterable) => Ok(Value::list(iterate(iterable)?)),
                }
            }
            Self::Print => Err(HostError::Type("print() needs an output".into())),
            Self::Math(function) => call_math(function, &args),
        }
    }
}

fn parse_float(s: &str) -> Option<f64> {
    match s.trim().to_ascii_lowercase().as_str() {
        "inf" | "+inf" | "infinity" => Some(f64::INFINITY),
        "-inf" | "-infinity" => Some(f64::NEG_INFINITY),
        "nan" | "+nan" | "-nan" => Some(f64::NAN),
        other => other.parse().ok(),
    }
}

fn call_math(function: MathFn, args: &[Value]) -> HostResult<Value> {
    let name = function.name();
    arity(name, args, 1, 1)?;
    if function == MathFn::Floor || function == MathFn::Ceil {
        if let Value::Int(i) = args[0] {
            return Ok(Value::Int(i));
        }
    }
    let x = float_arg(name, &args[0])?;
    let domain = || HostError::Value("math domain error".into());
    let result = match function {
        MathFn::Sqrt => {
            if x < 0.0 {
                return Err(domain());
            }
            x.sqrt()
        }
        MathFn::Floor | MathFn::Ceil => {
            let rounded = if function == MathFn::Floor {
                x.floor()
            } else {
                x.ceil()
            };
            return numeric::float_to_int(rounded)
                .map(Value::Int)
                .map_err(numeric_error);
        }
        MathFn::Exp => {
            let r = x.exp();
            if r.is_infinite() && x.is_finite() {
                return Err(HostError::Overflow("math range error".into()));
            }
            r
        }
        MathFn::Log => {
            if x <= 0.0 {
                return Err(domain());
            }
            x.ln()
        }
        MathFn::Sin | MathFn::Cos => {
            if x.is_infinite() {
                return Err(domain());
            }
            if function == MathFn::Sin {
                x.sin()
            } else {
                x.cos()
            }
        }
        MathFn::Fabs => x.abs(),
        MathFn::Isnan => return Ok(Value::Bool(x.is_nan())),
    };
    Ok(Value::Float(result))
}

/// The module object bound by `import name`, for modules built into the host
#[must_use]
pub fn module_value(name: &str) -> Option<Value> {
    (name == "math").then(|| Value::Module(Arc::from("math")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_and_len() {
        let r = Builtin::Range.call(vec![Value::Int(10)]).unwrap();
        assert_eq!(Builtin::Len.call(vec![r]).unwrap(), Value::Int(10));
        let err = Builtin::Range
            .call(vec![Value::Int(0), Value::Int(5), Value::Int(0)])
            .unwrap_err();
        assert!(matches!(err, HostError::Value(_)));
        let err = Builtin::Range.call(vec![Value::Float(3.0)]).unwrap_err();
        assert!(matches!(err, HostError::Type(_)));
    }

    #[test]
    fn min_max_over_arguments_and_iterables() {
        let max = Builtin::Max.call(vec![Value::Int(3), Value::Float(4.5)]).unwrap();
        assert_eq!(max, Value::Float(4.5));
        let min = Builtin::Min.call(vec![Value::int_list(&[5, 2, 9])]).unwrap();
        assert_eq!(min, Value::Int(2));
        assert!(Builtin::Max.call(vec![Value::list(vec![])]).is_err());
    }

    #[test]
    fn int_conversion_errors() {
        assert_eq!(Builtin::Int.call(vec![Value::Float(-2.7)]).unwrap(), Value::Int(-2));
        assert!(matches!(
            Builtin::Int.call(vec![Value::Float(f64::NAN)]),
            Err(HostError::Value(_))
        ));
        assert!(matches!(
            Builtin::Int.call(vec![Value::Float(f64::INFINITY)]),
            Err(HostError::Overflow(_))
        ));
    }

    #[test]
    fn sum_and_abs() {
        let total = Builtin::Sum.call(vec![Value::float_list(&[0.5, 0.25])]).unwrap();
        assert_eq!(total, Value::Float(0.75));
        assert!(matches!(
            Builtin::Abs.call(vec![Value::Int(i64::MIN)]),
            Err(HostError::Overflow(_))
        ));
    }

    #[test]
    fn math_module() {
        let sqrt = math_attribute("sqrt").unwrap();
        let Value::Builtin(sqrt) = sqrt else {
            panic!("expected builtin");
        };
        assert_eq!(sqrt.call(vec![Value::Int(16)]).unwrap(), Value::Float(4.0));
        assert!(sqrt.call(vec![Value::Float(-1.0)]).is_err());
        assert_eq!(
            Builtin::Math(MathFn::Floor).call(vec![Value::Float(-1.5)]).unwrap(),
            Value::Int(-2)
        );
        assert!(math_attribute("tau_squared").is_err());
    }
}
