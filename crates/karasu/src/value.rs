//! The runtime value representation.
//!
//! A [`Value`] is a small copyable sum: immediate kinds (`None`, booleans,
//! integers, floats, and the internal handler/kwargs sentinels) are stored
//! inline, while everything else lives in the heap arena and is referenced
//! through a [`HeapId`] index handle. Copying a `Value` never allocates;
//! liveness of `Ref` handles is the garbage collector's concern.

use crate::{
    hashing::{combine_hashes, hash_float, hash_int},
    heap::{Heap, HeapData},
};

pub use crate::heap::HeapId;

/// Marks what kind of unwind target a [`Value::Handler`] protects.
///
/// Pushed by `PUSH_TRY`/`PUSH_WITH`; the exception machinery scans the stack
/// for these markers when an exception is raised. Never visible to programs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    /// A `try:` block; the target is the first except clause.
    Try,
    /// A `with:` block; the target is the synthetic cleanup block.
    With,
}

/// Stack marker giving the VM a jump target on exception.
///
/// The target is an absolute bytecode offset within the chunk of the frame
/// that pushed the marker. 24 bits of target is plenty: jump operands are
/// 16-bit with an overlong table, and chunks stay far below 16 MiB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerEntry {
    /// Which construct pushed this marker.
    pub kind: HandlerKind,
    /// Absolute bytecode offset of the handler body.
    pub target: u32,
}

/// A runtime value.
///
/// `Value` is `Copy`: heap kinds are index handles into the arena, so
/// duplicating one on the operand stack is free. There is deliberately no
/// derived `PartialEq`; use [`Value::identical`] for `is` semantics and
/// [`values_equal`] for `==` semantics.
#[derive(Debug, Clone, Copy)]
pub enum Value {
    /// The `None` singleton.
    None,
    /// `True` / `False`.
    Bool(bool),
    /// Platform-sized signed integer. Arithmetic wraps on overflow.
    Int(i64),
    /// IEEE-754 double.
    Float(f64),
    /// Exception/with-block frame marker; internal, never user-visible.
    Handler(HandlerEntry),
    /// Sentinel carrying the number of keyword `(name, value)` pairs that
    /// sit beneath it on the stack during a call; internal.
    Kwargs(u32),
    /// Reference to a heap object.
    Ref(HeapId),
}

impl Value {
    /// Returns true for the `None` singleton.
    #[must_use]
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// Identity comparison (`is`).
    ///
    /// Immediate values are identical when their representations match
    /// bit-for-bit; heap values when they are the same arena slot. Interned
    /// strings therefore compare identical whenever they compare equal.
    #[must_use]
    pub fn identical(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::None, Self::None) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a.to_bits() == b.to_bits(),
            (Self::Handler(a), Self::Handler(b)) => a == b,
            (Self::Kwargs(a), Self::Kwargs(b)) => a == b,
            (Self::Ref(a), Self::Ref(b)) => a == b,
            _ => false,
        }
    }

    /// Truthiness used by `if`, `while`, `and`, `or`, and `not`.
    ///
    /// `None`, `False`, numeric zero, and empty strings/containers are
    /// falsey. Instances are truthy here; `__bool__`/`__len__` dispatch for
    /// user classes happens in the VM before this is consulted.
    #[must_use]
    pub fn truthy(&self, heap: &Heap) -> bool {
        match self {
            Self::None => false,
            Self::Bool(b) => *b,
            Self::Int(i) => *i != 0,
            Self::Float(f) => *f != 0.0,
            Self::Handler(_) | Self::Kwargs(_) => true,
            Self::Ref(id) => match heap.get(*id) {
                HeapData::Str(s) => !s.as_str().is_empty(),
                HeapData::Bytes(b) => !b.data.is_empty(),
                HeapData::Tuple(t) => !t.items.is_empty(),
                HeapData::List(l) => !l.items.is_empty(),
                HeapData::Dict(d) => d.table.len() != 0,
                HeapData::Set(s) => s.table.len() != 0,
                _ => true,
            },
        }
    }

    /// A short name for the value's kind, used in error messages.
    #[must_use]
    pub fn type_name(&self, heap: &Heap) -> &'static str {
        match self {
            Self::None => "NoneType",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Handler(_) => "handler",
            Self::Kwargs(_) => "kwargs",
            Self::Ref(id) => heap.get(*id).type_name(),
        }
    }

    /// Returns the float value of a numeric `Value`, if it is numeric.
    #[must_use]
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Bool(b) => Some(f64::from(i32::from(*b))),
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Returns the integer value of an int or bool.
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Bool(b) => Some(i64::from(*b)),
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }
}

/// Error raised when hashing an unhashable value.
///
/// Carries the offending type name so the VM can build the `TypeError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unhashable(pub &'static str);

/// Structural hash of a value, for table probing.
///
/// Numbers hash via their integer representation so cross-type equality is
/// preserved; strings and bytes use the hash cached in their object header;
/// tuples combine element hashes in order. Lists, dicts, and sets are
/// unhashable. Instances hash by identity here; classes that define
/// `__hash__` are intercepted by the VM before this function is reached.
pub(crate) fn value_hash(heap: &Heap, value: &Value) -> Result<u32, Unhashable> {
    match value {
        Value::None => Ok(hash_int(0x6e6f)),
        Value::Bool(b) => Ok(hash_int(i64::from(*b))),
        Value::Int(i) => Ok(hash_int(*i)),
        Value::Float(f) => Ok(hash_float(*f)),
        Value::Handler(h) => Ok(hash_int(i64::from(h.target))),
        Value::Kwargs(n) => Ok(hash_int(i64::from(*n))),
        Value::Ref(id) => match heap.get(*id) {
            HeapData::Str(_) | HeapData::Bytes(_) => Ok(heap.cached_hash(*id)),
            HeapData::Tuple(t) => {
                let mut acc = 0x7455_0110;
                for item in &t.items {
                    acc = combine_hashes(acc, value_hash(heap, item)?);
                }
                Ok(acc)
            }
            HeapData::List(_) => Err(Unhashable("list")),
            HeapData::Dict(_) => Err(Unhashable("dict")),
            HeapData::Set(_) => Err(Unhashable("set")),
            _ => Ok(hash_int(i64::from(id.index() as u32))),
        },
    }
}

/// Maximum recursion depth for structural equality.
///
/// Beyond this, comparison falls back to identity, which keeps degenerate
/// mutually-recursive containers from overflowing the Rust stack.
const MAX_EQ_DEPTH: u32 = 64;

/// Structural equality (`==`) over values.
///
/// Numeric kinds compare across `Int`/`Float`/`Bool`. Strings compare by
/// identity (interning makes equal strings identical); bytes by content;
/// tuples and lists element-wise; dicts and sets by unordered contents.
/// Instances compare by identity here; `__eq__` dispatch happens in the VM.
#[must_use]
pub(crate) fn values_equal(heap: &Heap, a: &Value, b: &Value) -> bool {
    values_equal_depth(heap, a, b, 0)
}

/// Identity-or-equality, the default key comparison for table probing.
#[must_use]
pub(crate) fn values_same_or_equal(heap: &Heap, a: &Value, b: &Value) -> bool {
    a.identical(b) || values_equal(heap, a, b)
}

fn values_equal_depth(heap: &Heap, a: &Value, b: &Value, depth: u32) -> bool {
    if a.identical(b) {
        return true;
    }
    if depth >= MAX_EQ_DEPTH {
        return false;
    }
    match (a, b) {
        (Value::Int(x), Value::Float(y)) | (Value::Float(y), Value::Int(x)) => (*x as f64) == *y,
        (Value::Bool(x), Value::Int(y)) | (Value::Int(y), Value::Bool(x)) => i64::from(*x) == *y,
        (Value::Bool(x), Value::Float(y)) | (Value::Float(y), Value::Bool(x)) => f64::from(i32::from(*x)) == *y,
        (Value::Ref(x), Value::Ref(y)) => match (heap.get(*x), heap.get(*y)) {
            // Interned strings share identity, caught above; distinct ids
            // always hold distinct content.
            (HeapData::Str(_), HeapData::Str(_)) => false,
            (HeapData::Bytes(p), HeapData::Bytes(q)) => p.data == q.data,
            (HeapData::Tuple(p), HeapData::Tuple(q)) => sequences_equal(heap, &p.items, &q.items, depth),
            (HeapData::List(p), HeapData::List(q)) => sequences_equal(heap, &p.items, &q.items, depth),
            (HeapData::Dict(p), HeapData::Dict(q)) => {
                if p.table.len() != q.table.len() {
                    return false;
                }
                p.table.iter().all(|(k, v)| {
                    value_hash(heap, k).is_ok_and(|h| {
                        q.table
                            .get_with(h, |candidate| values_equal_depth(heap, candidate, k, depth + 1))
                            .is_some_and(|other| values_equal_depth(heap, v, &other, depth + 1))
                    })
                })
            }
            (HeapData::Set(p), HeapData::Set(q)) => {
                if p.table.len() != q.table.len() {
                    return false;
                }
                p.table.iter().all(|(k, _)| {
                    value_hash(heap, k).is_ok_and(|h| {
                        q.table
                            .get_with(h, |candidate| values_equal_depth(heap, candidate, k, depth + 1))
                            .is_some()
                    })
                })
            }
            _ => false,
        },
        _ => false,
    }
}

fn sequences_equal(heap: &Heap, a: &[Value], b: &[Value], depth: u32) -> bool {
    a.len() == b.len()
        && a.iter()
            .zip(b.iter())
            .all(|(x, y)| values_equal_depth(heap, x, y, depth + 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::Heap;

    #[test]
    fn test_identity_of_immediates() {
        assert!(Value::Int(3).identical(&Value::Int(3)));
        assert!(!Value::Int(3).identical(&Value::Float(3.0)));
        assert!(Value::None.identical(&Value::None));
        assert!(!Value::Bool(true).identical(&Value::Int(1)));
    }

    #[test]
    fn test_cross_type_numeric_equality() {
        let heap = Heap::new();
        assert!(values_equal(&heap, &Value::Int(1), &Value::Float(1.0)));
        assert!(values_equal(&heap, &Value::Bool(true), &Value::Int(1)));
        assert!(values_equal(&heap, &Value::Bool(false), &Value::Float(0.0)));
        assert!(!values_equal(&heap, &Value::Int(1), &Value::Int(2)));
    }

    #[test]
    fn test_interned_strings_are_identical() {
        let mut heap = Heap::new();
        let a = heap.intern("hello");
        let b = heap.intern("hello");
        assert_eq!(a, b);
        assert!(Value::Ref(a).identical(&Value::Ref(b)));
    }

    #[test]
    fn test_truthiness() {
        let mut heap = Heap::new();
        assert!(!Value::None.truthy(&heap));
        assert!(!Value::Int(0).truthy(&heap));
        assert!(Value::Int(-1).truthy(&heap));
        assert!(!Value::Float(0.0).truthy(&heap));
        let empty = heap.intern("");
        let full = heap.intern("x");
        assert!(!Value::Ref(empty).truthy(&heap));
        assert!(Value::Ref(full).truthy(&heap));
    }

    #[test]
    fn test_hash_agreement_between_int_and_float() {
        let heap = Heap::new();
        let a = value_hash(&heap, &Value::Int(9)).unwrap();
        let b = value_hash(&heap, &Value::Float(9.0)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_lists_are_unhashable() {
        let mut heap = Heap::new();
        let id = heap.allocate_list(Vec::new());
        assert_eq!(value_hash(&heap, &Value::Ref(id)), Err(Unhashable("list")));
    }

    #[test]
    fn test_tuple_hash_stable_until_contents_differ() {
        let mut heap = Heap::new();
        let t1 = heap.allocate_tuple(vec![Value::Int(1), Value::Int(2)]);
        let t2 = heap.allocate_tuple(vec![Value::Int(1), Value::Int(2)]);
        let t3 = heap.allocate_tuple(vec![Value::Int(2), Value::Int(1)]);
        let h1 = value_hash(&heap, &Value::Ref(t1)).unwrap();
        let h2 = value_hash(&heap, &Value::Ref(t2)).unwrap();
        let h3 = value_hash(&heap, &Value::Ref(t3)).unwrap();
        assert_eq!(h1, h2);
        assert_ne!(h1, h3);
    }
}
