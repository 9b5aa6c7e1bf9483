//! Binary and unary operator dispatch.
//!
//! Each operator tries the built-in fast paths first (numbers, strings,
//! sequences), then the left operand's dunder, then the right operand's
//! reflected dunder, and finally raises `TypeError`. Dunder selection is
//! by method presence: a class that does not define `__add__` simply
//! yields to the other operand's `__radd__`.

use std::cmp::Ordering;

use crate::{
    exceptions::{ExcKind, VmResult},
    heap::{Heap, HeapData},
    opcode::Opcode,
    value::{Value, values_equal},
    vm::Vm,
};

/// Source-level spelling of an operator, for error messages.
fn operator_symbol(op: Opcode) -> &'static str {
    match op {
        Opcode::Add => "+",
        Opcode::Subtract => "-",
        Opcode::Multiply => "*",
        Opcode::Divide => "/",
        Opcode::Floordiv => "//",
        Opcode::Modulo => "%",
        Opcode::Pow => "**",
        Opcode::Bitand => "&",
        Opcode::Bitor => "|",
        Opcode::Bitxor => "^",
        Opcode::Bitshiftl => "<<",
        Opcode::Bitshiftr => ">>",
        Opcode::Less => "<",
        Opcode::Greater => ">",
        Opcode::LessEqual => "<=",
        Opcode::GreaterEqual => ">=",
        _ => "?",
    }
}

/// The `(__op__, __rop__)` pair for a binary opcode.
fn binary_dunder_names(op: Opcode) -> (&'static str, &'static str) {
    match op {
        Opcode::Add => ("__add__", "__radd__"),
        Opcode::Subtract => ("__sub__", "__rsub__"),
        Opcode::Multiply => ("__mul__", "__rmul__"),
        Opcode::Divide => ("__truediv__", "__rtruediv__"),
        Opcode::Floordiv => ("__floordiv__", "__rfloordiv__"),
        Opcode::Modulo => ("__mod__", "__rmod__"),
        Opcode::Pow => ("__pow__", "__rpow__"),
        Opcode::Bitand => ("__and__", "__rand__"),
        Opcode::Bitor => ("__or__", "__ror__"),
        Opcode::Bitxor => ("__xor__", "__rxor__"),
        Opcode::Bitshiftl => ("__lshift__", "__rlshift__"),
        Opcode::Bitshiftr => ("__rshift__", "__rrshift__"),
        _ => unreachable!("not a binary operator opcode"),
    }
}

/// The `(__op__, __rop__)` pair for an ordering comparison. The reflected
/// name is the mirrored comparison.
fn comparison_dunder_names(op: Opcode) -> (&'static str, &'static str) {
    match op {
        Opcode::Less => ("__lt__", "__gt__"),
        Opcode::Greater => ("__gt__", "__lt__"),
        Opcode::LessEqual => ("__le__", "__ge__"),
        Opcode::GreaterEqual => ("__ge__", "__le__"),
        _ => unreachable!("not a comparison opcode"),
    }
}

impl Vm {
    /// Executes an arithmetic/bitwise binary opcode over the top two
    /// stack values.
    pub(crate) fn binary_operator(&mut self, op: Opcode) -> VmResult<()> {
        let b = self.peek(0);
        let a = self.peek(1);

        if let Some(result) = self.builtin_binary(op, a, b)? {
            self.pop();
            self.pop();
            self.push(result);
            return Ok(());
        }

        let (name, rname) = binary_dunder_names(op);
        if let Some(result) = self.try_instance_dunder(name, a, &[b])? {
            self.pop();
            self.pop();
            self.push(result);
            return Ok(());
        }
        if let Some(result) = self.try_instance_dunder(rname, b, &[a])? {
            self.pop();
            self.pop();
            self.push(result);
            return Ok(());
        }

        let symbol = operator_symbol(op);
        let left = a.type_name(&self.heap);
        let right = b.type_name(&self.heap);
        Err(self.error(
            ExcKind::TypeError,
            &format!("unsupported operand type(s) for {symbol}: '{left}' and '{right}'"),
        ))
    }

    /// Built-in operand handling; `Ok(None)` falls through to dunders.
    fn builtin_binary(&mut self, op: Opcode, a: Value, b: Value) -> VmResult<Option<Value>> {
        // Integer (and bool) lanes. Division is handled separately since
        // it produces floats.
        if let (Some(x), Some(y)) = (a.as_int(), b.as_int()) {
            let result = match op {
                Opcode::Add => Some(Value::Int(x.wrapping_add(y))),
                Opcode::Subtract => Some(Value::Int(x.wrapping_sub(y))),
                Opcode::Multiply => Some(Value::Int(x.wrapping_mul(y))),
                Opcode::Floordiv => {
                    if y == 0 {
                        return Err(self.error(ExcKind::ZeroDivisionError, "integer division by zero"));
                    }
                    Some(Value::Int(x.div_euclid(y)))
                }
                Opcode::Modulo => {
                    if y == 0 {
                        return Err(self.error(ExcKind::ZeroDivisionError, "integer modulo by zero"));
                    }
                    Some(Value::Int(x.rem_euclid(y)))
                }
                Opcode::Divide => {
                    if y == 0 {
                        return Err(self.error(ExcKind::ZeroDivisionError, "division by zero"));
                    }
                    if cfg!(feature = "no-float") {
                        Some(Value::Int(x.div_euclid(y)))
                    } else {
                        Some(Value::Float(x as f64 / y as f64))
                    }
                }
                Opcode::Pow => Some(integer_pow(x, y)),
                Opcode::Bitand => Some(Value::Int(x & y)),
                Opcode::Bitor => Some(Value::Int(x | y)),
                Opcode::Bitxor => Some(Value::Int(x ^ y)),
                Opcode::Bitshiftl => {
                    if y < 0 {
                        return Err(self.error(ExcKind::ValueError, "negative shift count"));
                    }
                    Some(Value::Int(x.wrapping_shl(y as u32)))
                }
                Opcode::Bitshiftr => {
                    if y < 0 {
                        return Err(self.error(ExcKind::ValueError, "negative shift count"));
                    }
                    Some(Value::Int(x.wrapping_shr(y as u32)))
                }
                _ => None,
            };
            return Ok(result);
        }

        // Mixed numeric lanes go through floats.
        if let (Some(x), Some(y)) = (a.as_number(), b.as_number()) {
            let result = match op {
                Opcode::Add => Some(Value::Float(x + y)),
                Opcode::Subtract => Some(Value::Float(x - y)),
                Opcode::Multiply => Some(Value::Float(x * y)),
                Opcode::Divide => {
                    if y == 0.0 {
                        return Err(self.error(ExcKind::ZeroDivisionError, "float division by zero"));
                    }
                    Some(Value::Float(x / y))
                }
                Opcode::Floordiv => {
                    if y == 0.0 {
                        return Err(self.error(ExcKind::ZeroDivisionError, "float floor division by zero"));
                    }
                    Some(Value::Float((x / y).floor()))
                }
                Opcode::Modulo => {
                    if y == 0.0 {
                        return Err(self.error(ExcKind::ZeroDivisionError, "float modulo by zero"));
                    }
                    Some(Value::Float(x.rem_euclid(y)))
                }
                Opcode::Pow => Some(Value::Float(x.powf(y))),
                _ => None,
            };
            return Ok(result);
        }

        // String and sequence operators.
        if let (Value::Ref(x), Value::Ref(y)) = (a, b) {
            match (self.heap.get(x), self.heap.get(y), op) {
                (HeapData::Str(_), HeapData::Str(_), Opcode::Add) => {
                    let mut combined = self.heap.as_str(x).to_string();
                    combined.push_str(self.heap.as_str(y));
                    let id = self.heap.intern(&combined);
                    return Ok(Some(Value::Ref(id)));
                }
                (HeapData::Bytes(_), HeapData::Bytes(_), Opcode::Add) => {
                    let mut combined = self.heap.bytes(x).data.to_vec();
                    combined.extend_from_slice(&self.heap.bytes(y).data);
                    let id = self.heap.allocate_bytes(combined);
                    return Ok(Some(Value::Ref(id)));
                }
                (HeapData::List(_), HeapData::List(_), Opcode::Add) => {
                    let mut combined = self.heap.list(x).items.clone();
                    combined.extend_from_slice(&self.heap.list(y).items);
                    let id = self.heap.allocate_list(combined);
                    return Ok(Some(Value::Ref(id)));
                }
                (HeapData::Tuple(_), HeapData::Tuple(_), Opcode::Add) => {
                    let mut combined = self.heap.tuple(x).items.clone();
                    combined.extend_from_slice(&self.heap.tuple(y).items);
                    let id = self.heap.allocate_tuple(combined);
                    return Ok(Some(Value::Ref(id)));
                }
                _ => {}
            }
        }

        // Sequence repetition, either operand order.
        if op == Opcode::Multiply {
            let (seq, count) = match (a, b.as_int()) {
                (Value::Ref(id), Some(n)) => (Some(id), n),
                _ => match (b, a.as_int()) {
                    (Value::Ref(id), Some(n)) => (Some(id), n),
                    _ => (None, 0),
                },
            };
            if let Some(id) = seq {
                let count = count.max(0) as usize;
                match self.heap.get(id) {
                    HeapData::Str(_) => {
                        let repeated = self.heap.as_str(id).repeat(count);
                        let new_id = self.heap.intern(&repeated);
                        return Ok(Some(Value::Ref(new_id)));
                    }
                    HeapData::List(_) => {
                        let items = self.heap.list(id).items.clone();
                        let mut repeated = Vec::with_capacity(items.len() * count);
                        for _ in 0..count {
                            repeated.extend_from_slice(&items);
                        }
                        let new_id = self.heap.allocate_list(repeated);
                        return Ok(Some(Value::Ref(new_id)));
                    }
                    HeapData::Tuple(_) => {
                        let items = self.heap.tuple(id).items.clone();
                        let mut repeated = Vec::with_capacity(items.len() * count);
                        for _ in 0..count {
                            repeated.extend_from_slice(&items);
                        }
                        let new_id = self.heap.allocate_tuple(repeated);
                        return Ok(Some(Value::Ref(new_id)));
                    }
                    _ => {}
                }
            }
        }

        Ok(None)
    }

    /// Calls `receiver.__name__(args...)` when the receiver is an
    /// instance whose class defines the method.
    fn try_instance_dunder(&mut self, name: &str, receiver: Value, args: &[Value]) -> VmResult<Option<Value>> {
        let Value::Ref(id) = receiver else {
            return Ok(None);
        };
        if !matches!(self.heap.get(id), HeapData::Instance(_)) {
            return Ok(None);
        }
        let class = self.heap.instance(id).class;
        let name_id = self.heap.intern(name);
        let Some(method) = self.lookup_class_attr(class, name_id) else {
            return Ok(None);
        };
        let result = self.call_dunder(method, receiver, args)?;
        Ok(Some(result))
    }

    /// Executes `EQUAL` / `LESS` / `GREATER` / `LESS_EQUAL` /
    /// `GREATER_EQUAL`.
    pub(crate) fn comparison_operator(&mut self, op: Opcode) -> VmResult<()> {
        let b = self.peek(0);
        let a = self.peek(1);

        if op == Opcode::Equal {
            if let Some(result) = self.try_instance_dunder("__eq__", a, &[b])? {
                let truthy = self.value_truthy(result)?;
                self.pop();
                self.pop();
                self.push(Value::Bool(truthy));
                return Ok(());
            }
            if let Some(result) = self.try_instance_dunder("__eq__", b, &[a])? {
                let truthy = self.value_truthy(result)?;
                self.pop();
                self.pop();
                self.push(Value::Bool(truthy));
                return Ok(());
            }
            let equal = values_equal(&self.heap, &a, &b);
            self.pop();
            self.pop();
            self.push(Value::Bool(equal));
            return Ok(());
        }

        if let Some(ordering) = compare_values(&self.heap, &a, &b) {
            let keep = match op {
                Opcode::Less => ordering == Ordering::Less,
                Opcode::Greater => ordering == Ordering::Greater,
                Opcode::LessEqual => ordering != Ordering::Greater,
                Opcode::GreaterEqual => ordering != Ordering::Less,
                _ => unreachable!(),
            };
            self.pop();
            self.pop();
            self.push(Value::Bool(keep));
            return Ok(());
        }

        let (name, rname) = comparison_dunder_names(op);
        if let Some(result) = self.try_instance_dunder(name, a, &[b])? {
            self.pop();
            self.pop();
            self.push(result);
            return Ok(());
        }
        if let Some(result) = self.try_instance_dunder(rname, b, &[a])? {
            self.pop();
            self.pop();
            self.push(result);
            return Ok(());
        }

        let symbol = operator_symbol(op);
        let left = a.type_name(&self.heap);
        let right = b.type_name(&self.heap);
        Err(self.error(
            ExcKind::TypeError,
            &format!("'{symbol}' not supported between instances of '{left}' and '{right}'"),
        ))
    }

    pub(crate) fn negate_operator(&mut self) -> VmResult<()> {
        let value = self.peek(0);
        match value {
            Value::Int(n) => {
                self.set_top(Value::Int(n.wrapping_neg()));
                Ok(())
            }
            Value::Bool(b) => {
                self.set_top(Value::Int(-i64::from(b)));
                Ok(())
            }
            Value::Float(f) => {
                self.set_top(Value::Float(-f));
                Ok(())
            }
            _ => {
                if let Some(result) = self.try_instance_dunder("__neg__", value, &[])? {
                    self.set_top(result);
                    return Ok(());
                }
                let kind = value.type_name(&self.heap);
                Err(self.error(
                    ExcKind::TypeError,
                    &format!("bad operand type for unary -: '{kind}'"),
                ))
            }
        }
    }

    pub(crate) fn invert_operator(&mut self) -> VmResult<()> {
        let value = self.peek(0);
        match value.as_int() {
            Some(n) => {
                self.set_top(Value::Int(!n));
                Ok(())
            }
            None => {
                let kind = value.type_name(&self.heap);
                Err(self.error(
                    ExcKind::TypeError,
                    &format!("bad operand type for unary ~: '{kind}'"),
                ))
            }
        }
    }

    /// Executes `CONTAINS`: stack `[item, container]` becomes a bool.
    pub(crate) fn contains_operator(&mut self) -> VmResult<()> {
        let container = self.peek(0);
        let item = self.peek(1);
        let result = self.value_contains(container, item)?;
        self.pop();
        self.pop();
        self.push(Value::Bool(result));
        Ok(())
    }

    pub(crate) fn value_contains(&mut self, container: Value, item: Value) -> VmResult<bool> {
        let Value::Ref(id) = container else {
            let kind = container.type_name(&self.heap);
            return Err(self.error(ExcKind::TypeError, &format!("argument of type '{kind}' is not iterable")));
        };
        match self.heap.get(id) {
            HeapData::Dict(_) => Ok(self.dict_get(id, item)?.is_some()),
            HeapData::Set(_) => self.set_contains(id, item),
            HeapData::Str(_) => {
                let Value::Ref(needle) = item else {
                    let kind = item.type_name(&self.heap);
                    return Err(self.error(
                        ExcKind::TypeError,
                        &format!("'in <string>' requires string as left operand, not '{kind}'"),
                    ));
                };
                if !matches!(self.heap.get(needle), HeapData::Str(_)) {
                    let kind = item.type_name(&self.heap);
                    return Err(self.error(
                        ExcKind::TypeError,
                        &format!("'in <string>' requires string as left operand, not '{kind}'"),
                    ));
                }
                Ok(self.heap.as_str(id).contains(self.heap.as_str(needle)))
            }
            HeapData::Bytes(_) => match item.as_int() {
                Some(byte) if (0..=255).contains(&byte) => {
                    Ok(self.heap.bytes(id).data.contains(&(byte as u8)))
                }
                _ => Ok(false),
            },
            HeapData::List(_) => {
                let items = self.heap.list(id).items.clone();
                Ok(items.iter().any(|v| values_equal(&self.heap, v, &item)))
            }
            HeapData::Tuple(_) => {
                let items = self.heap.tuple(id).items.clone();
                Ok(items.iter().any(|v| values_equal(&self.heap, v, &item)))
            }
            HeapData::Range(range) => {
                let range = *range;
                match item.as_int() {
                    Some(n) => {
                        let within = if range.step > 0 {
                            n >= range.start && n < range.stop
                        } else {
                            n <= range.start && n > range.stop
                        };
                        Ok(within && (n - range.start) % range.step == 0)
                    }
                    None => Ok(false),
                }
            }
            HeapData::Instance(_) => {
                let class = self.heap.instance(id).class;
                let contains = self.heap.class(class).dunders.get(crate::heap::Dunder::Contains);
                match contains {
                    Some(method) => {
                        let result = self.call_dunder(method, container, &[item])?;
                        self.value_truthy(result)
                    }
                    None => {
                        let kind = container.type_name(&self.heap);
                        Err(self.error(
                            ExcKind::TypeError,
                            &format!("argument of type '{kind}' is not iterable"),
                        ))
                    }
                }
            }
            _ => {
                let kind = container.type_name(&self.heap);
                Err(self.error(ExcKind::TypeError, &format!("argument of type '{kind}' is not iterable")))
            }
        }
    }
}

/// Integer exponentiation: wrapping for non-negative exponents, floating
/// for negative ones.
fn integer_pow(base: i64, exponent: i64) -> Value {
    if exponent < 0 {
        return Value::Float((base as f64).powi(exponent.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32));
    }
    let mut result: i64 = 1;
    let mut base = base;
    let mut exponent = exponent;
    while exponent > 0 {
        if exponent & 1 == 1 {
            result = result.wrapping_mul(base);
        }
        base = base.wrapping_mul(base);
        exponent >>= 1;
    }
    Value::Int(result)
}

/// Structural ordering for the built-in comparable kinds.
///
/// Numbers compare numerically across kinds, strings and bytes by
/// content, lists and tuples lexicographically. Everything else is
/// unordered (`None`), which routes comparison through dunders.
pub(crate) fn compare_values(heap: &Heap, a: &Value, b: &Value) -> Option<Ordering> {
    if let (Some(x), Some(y)) = (a.as_number(), b.as_number()) {
        return x.partial_cmp(&y);
    }
    let (Value::Ref(x), Value::Ref(y)) = (a, b) else {
        return None;
    };
    match (heap.get(*x), heap.get(*y)) {
        (HeapData::Str(p), HeapData::Str(q)) => Some(p.as_str().cmp(q.as_str())),
        (HeapData::Bytes(p), HeapData::Bytes(q)) => Some(p.data.cmp(&q.data)),
        (HeapData::List(p), HeapData::List(q)) => compare_sequences(heap, &p.items, &q.items),
        (HeapData::Tuple(p), HeapData::Tuple(q)) => compare_sequences(heap, &p.items, &q.items),
        _ => None,
    }
}

fn compare_sequences(heap: &Heap, a: &[Value], b: &[Value]) -> Option<Ordering> {
    for (x, y) in a.iter().zip(b.iter()) {
        match compare_values(heap, x, y) {
            Some(Ordering::Equal) => {}
            other => return other,
        }
    }
    Some(a.len().cmp(&b.len()))
}

/// Convenience used by `list.sort` and `sorted`.
pub(crate) fn compare_for_sort(heap: &Heap, a: &Value, b: &Value) -> Ordering {
    compare_values(heap, a, b).unwrap_or(Ordering::Equal)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_pow() {
        assert!(matches!(integer_pow(2, 10), Value::Int(1024)));
        assert!(matches!(integer_pow(3, 0), Value::Int(1)));
        assert!(matches!(integer_pow(-2, 3), Value::Int(-8)));
        assert!(matches!(integer_pow(2, -1), Value::Float(f) if (f - 0.5).abs() < 1e-12));
    }

    #[test]
    fn test_compare_sequences() {
        let mut heap = Heap::new();
        let a = heap.allocate_list(vec![Value::Int(1), Value::Int(2)]);
        let b = heap.allocate_list(vec![Value::Int(1), Value::Int(3)]);
        let c = heap.allocate_list(vec![Value::Int(1)]);
        assert_eq!(
            compare_values(&heap, &Value::Ref(a), &Value::Ref(b)),
            Some(Ordering::Less)
        );
        assert_eq!(
            compare_values(&heap, &Value::Ref(c), &Value::Ref(a)),
            Some(Ordering::Less)
        );
        assert_eq!(
            compare_values(&heap, &Value::Ref(a), &Value::Ref(a)),
            Some(Ordering::Equal)
        );
    }
}
