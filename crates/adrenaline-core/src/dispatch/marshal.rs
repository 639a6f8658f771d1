//! Conversion between host values and the native calling convention

use std::sync::Arc;

use crate::analysis::typed::{NumType, ReturnKind, ValueKind};
use crate::host::value::ListRef;
use crate::host::Value;
use crate::jit::Frame;
use crate::unit::FunctionUnit;

/// Kind of a single argument value, `None` when it has no native representation
#[must_use]
pub fn kind_of(value: &Value) -> Option<ValueKind> {
    match value {
        Value::Int(_) => Some(ValueKind::Scalar(NumType::Int)),
        Value::Float(_) => Some(ValueKind::Scalar(NumType::Float)),
        Value::Bool(_) => Some(ValueKind::Scalar(NumType::Bool)),
        Value::List(list) => {
            let items = list.read();
            let elem = match items.first()? {
                Value::Int(_) => NumType::Int,
                Value::Float(_) => NumType::Float,
                _ => return None,
            };
            items
                .iter()
                .all(|v| element_fits(v, elem))
                .then_some(ValueKind::Array(elem))
        }
        _ => None,
    }
}

fn element_fits(value: &Value, elem: NumType) -> bool {
    matches!(
        (value, elem),
        (Value::Int(_), NumType::Int) | (Value::Float(_), NumType::Float)
    )
}

fn matches_kind(value: &Value, kind: ValueKind) -> bool {
    match (value, kind) {
        (Value::List(list), ValueKind::Array(elem)) => list.read().iter().all(|v| element_fits(v, elem)),
        _ => kind_of(value) == Some(kind),
    }
}

/// Argument kinds to specialize `unit` for, from its annotations and the values of one call
///
/// `None` when the call cannot be represented natively (wrong arity, a value of another
/// kind than declared, a heterogeneous or empty undeclared list).
#[must_use]
pub fn observe(unit: &FunctionUnit, args: &[Value]) -> Option<Vec<ValueKind>> {
    if args.len() != unit.arity() {
        return None;
    }
    unit.params
        .iter()
        .zip(args)
        .map(|(param, value)| match param.kind.value_kind() {
            Some(declared) => matches_kind(value, declared).then_some(declared),
            None => kind_of(value),
        })
        .collect()
}

/// Arguments copied into native buffers
#[derive(Debug)]
pub struct Lowered {
    pub frame: Frame,
    /// Source list, element type and parameter position of each array buffer
    lists: Vec<(ListRef, NumType, usize)>,
}

/// Copy `args` into a [`Frame`] for a body specialized on `kinds`
///
/// Returns `None` on any kind mismatch and when two array arguments are the same list,
/// since native code assumes array arguments do not alias.
#[must_use]
pub fn lower_args(kinds: &[ValueKind], args: &[Value]) -> Option<Lowered> {
    if kinds.len() != args.len() {
        return None;
    }
    let mut frame = Frame::default();
    let mut lists: Vec<(ListRef, NumType, usize)> = Vec::new();
    for (position, (kind, value)) in kinds.iter().zip(args).enumerate() {
        match (*kind, value) {
            (ValueKind::Scalar(NumType::Int), Value::Int(i)) => frame.scalars.push(*i as u64),
            (ValueKind::Scalar(NumType::Float), Value::Float(f)) => frame.scalars.push(f.to_bits()),
            (ValueKind::Scalar(NumType::Bool), Value::Bool(b)) => frame.scalars.push(u64::from(*b)),
            (ValueKind::Array(elem), Value::List(list)) => {
                if lists.iter().any(|(seen, ..)| Arc::ptr_eq(seen, list)) {
                    return None;
                }
                let buffer = list
                    .read()
                    .iter()
                    .map(|v| match (v, elem) {
                        (Value::Int(i), NumType::Int) => Some(*i as u64),
                        (Value::Float(f), NumType::Float) => Some(f.to_bits()),
                        _ => None,
                    })
                    .collect::<Option<Vec<u64>>>()?;
                frame.arrays.push(buffer);
                lists.push((Arc::clone(list), elem, position));
            }
            _ => return None,
        }
    }
    Some(Lowered { frame, lists })
}

impl Lowered {
    /// Publish the native buffers of the parameters at `stored` back into the host lists
    pub fn write_back(&self, stored: &[usize]) {
        for ((list, elem, position), buffer) in self.lists.iter().zip(&self.frame.arrays) {
            if !stored.contains(position) {
                continue;
            }
            let mut items = list.write();
            for (item, bits) in items.iter_mut().zip(buffer) {
                *item = match elem {
                    NumType::Float => Value::Float(f64::from_bits(*bits)),
                    NumType::Int | NumType::Bool => Value::Int(*bits as i64),
                };
            }
        }
    }
}

/// Host value for the bits a native call returned
#[must_use]
pub fn raise_result(ret: ReturnKind, bits: u64, args: &[Value]) -> Value {
    match ret {
        ReturnKind::Scalar(NumType::Int) => Value::Int(bits as i64),
        ReturnKind::Scalar(NumType::Float) => Value::Float(f64::from_bits(bits)),
        ReturnKind::Scalar(NumType::Bool) => Value::Bool(bits != 0),
        // The returned parameter itself, so identity is preserved
        ReturnKind::Array(_) => usize::try_from(bits)
            .ok()
            .and_then(|position| args.get(position).cloned())
            .unwrap_or(Value::None),
        ReturnKind::None => Value::None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{FunctionSource, HostProgram};
    use crate::testutil::{float, int, int_array};

    fn unit(source: &str, name: &str) -> FunctionUnit {
        let program = HostProgram::from_source(source, 100).unwrap();
        FunctionUnit::new(program.function(name).unwrap())
    }

    #[test]
    fn kinds_follow_values_and_annotations() {
        let u = unit("def f(n, xs: list[int], y: float):\n    return n\n", "f");
        let args = [Value::Int(3), Value::int_list(&[]), Value::Float(1.0)];
        assert_eq!(observe(&u, &args), Some(vec![int(), int_array(), float()]));
        let wrong = [Value::Int(3), Value::int_list(&[1]), Value::Int(1)];
        assert_eq!(observe(&u, &wrong), None);
    }

    #[test]
    fn unrepresentable_values_have_no_kind() {
        assert_eq!(kind_of(&Value::str("x")), None);
        assert_eq!(kind_of(&Value::list(Vec::new())), None);
        assert_eq!(kind_of(&Value::list(vec![Value::Int(1), Value::Float(2.0)])), None);
        assert_eq!(kind_of(&Value::float_list(&[1.0])), Some(ValueKind::Array(NumType::Float)));
    }

    #[test]
    fn aliased_arrays_are_refused() {
        let list = Value::int_list(&[1, 2]);
        assert!(lower_args(&[int_array(), int_array()], &[list.clone(), list]).is_none());
    }

    #[test]
    fn buffers_are_written_back() {
        let list = Value::int_list(&[1, 2, 3]);
        let mut lowered = lower_args(&[int_array(), int()], &[list.clone(), Value::Int(5)]).unwrap();
        assert_eq!(lowered.frame.scalars, vec![5]);
        lowered.frame.arrays[0][1] = 20;
        let Value::List(items) = &list else {
            unreachable!()
        };
        assert!(matches!(items.read()[1], Value::Int(2)));
        lowered.write_back(&[0]);
        assert!(matches!(items.read()[1], Value::Int(20)));
    }

    #[test]
    fn read_only_buffers_leave_host_lists_alone() {
        let src = Value::int_list(&[1, 2]);
        let dst = Value::int_list(&[0, 0]);
        let lowered = lower_args(&[int_array(), int_array()], &[src.clone(), dst.clone()]).unwrap();
        let Value::List(items) = &src else {
            unreachable!()
        };
        // a host write that lands while native code runs
        items.write()[0] = Value::Int(100);
        lowered.write_back(&[1]);
        assert!(matches!(items.read()[0], Value::Int(100)));
    }

    #[test]
    fn results_convert_back() {
        assert!(matches!(raise_result(ReturnKind::Scalar(NumType::Int), (-3i64) as u64, &[]), Value::Int(-3)));
        assert!(matches!(raise_result(ReturnKind::Scalar(NumType::Bool), 1, &[]), Value::Bool(true)));
        assert!(matches!(raise_result(ReturnKind::None, 0, &[]), Value::None));
        let args = [Value::Int(1), Value::int_list(&[7])];
        assert!(matches!(raise_result(ReturnKind::Array(NumType::Int), 1, &args), Value::List(_)));
    }
}
