//! Constructors for `int`, `float`, and `bool`.

use crate::{
    exceptions::{ExcKind, VmResult},
    heap::{Heap, HeapData, HeapId},
    value::Value,
    vm::{Arguments, Vm},
};

pub(crate) fn install(heap: &mut Heap, int_class: HeapId, float_class: HeapId, bool_class: HeapId) {
    heap.class_mut(int_class).native_ctor = Some(int_ctor);
    heap.class_mut(float_class).native_ctor = Some(float_ctor);
    heap.class_mut(bool_class).native_ctor = Some(bool_ctor);
}

fn int_ctor(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    let (value, base) = match args.values[..] {
        [] => return Ok(Value::Int(0)),
        [value] => (value, None),
        [value, base] => (value, Some(base)),
        _ => return Err(vm.error(ExcKind::ArgumentError, "int() takes at most 2 arguments")),
    };
    if let Some(base) = base {
        let Some(base) = base.as_int() else {
            return Err(vm.error(ExcKind::TypeError, "int() base must be an integer"));
        };
        if !(2..=36).contains(&base) {
            return Err(vm.error(ExcKind::ValueError, "int() base must be >= 2 and <= 36"));
        }
        let Value::Ref(id) = value else {
            return Err(vm.error(ExcKind::TypeError, "int() can't convert non-string with explicit base"));
        };
        if !matches!(vm.heap.get(id), HeapData::Str(_)) {
            return Err(vm.error(ExcKind::TypeError, "int() can't convert non-string with explicit base"));
        }
        let text = vm.heap.as_str(id).trim().to_string();
        return match i64::from_str_radix(&text, base as u32) {
            Ok(n) => Ok(Value::Int(n)),
            Err(_) => Err(vm.error(
                ExcKind::ValueError,
                &format!("invalid literal for int() with base {base}: '{text}'"),
            )),
        };
    }
    match value {
        Value::Int(n) => Ok(Value::Int(n)),
        Value::Bool(b) => Ok(Value::Int(i64::from(b))),
        Value::Float(f) => Ok(Value::Int(f.trunc() as i64)),
        Value::Ref(id) if matches!(vm.heap.get(id), HeapData::Str(_)) => {
            let text = vm.heap.as_str(id).trim().to_string();
            match text.parse::<i64>() {
                Ok(n) => Ok(Value::Int(n)),
                Err(_) => Err(vm.error(
                    ExcKind::ValueError,
                    &format!("invalid literal for int() with base 10: '{text}'"),
                )),
            }
        }
        _ => {
            let kind = value.type_name(&vm.heap);
            Err(vm.error(
                ExcKind::TypeError,
                &format!("int() argument must be a string or a number, not '{kind}'"),
            ))
        }
    }
}

fn float_ctor(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    let value = match args.values[..] {
        [] => return Ok(Value::Float(0.0)),
        [value] => value,
        _ => return Err(vm.error(ExcKind::ArgumentError, "float() takes at most 1 argument")),
    };
    match value {
        Value::Float(f) => Ok(Value::Float(f)),
        Value::Int(n) => Ok(Value::Float(n as f64)),
        Value::Bool(b) => Ok(Value::Float(f64::from(i32::from(b)))),
        Value::Ref(id) if matches!(vm.heap.get(id), HeapData::Str(_)) => {
            let text = vm.heap.as_str(id).trim().to_string();
            match text.parse::<f64>() {
                Ok(f) => Ok(Value::Float(f)),
                Err(_) => Err(vm.error(
                    ExcKind::ValueError,
                    &format!("could not convert string to float: '{text}'"),
                )),
            }
        }
        _ => {
            let kind = value.type_name(&vm.heap);
            Err(vm.error(
                ExcKind::TypeError,
                &format!("float() argument must be a string or a number, not '{kind}'"),
            ))
        }
    }
}

fn bool_ctor(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    match args.values[..] {
        [] => Ok(Value::Bool(false)),
        [value] => {
            let truthy = vm.value_truthy(value)?;
            Ok(Value::Bool(truthy))
        }
        _ => Err(vm.error(ExcKind::ArgumentError, "bool() takes at most 1 argument")),
    }
}
