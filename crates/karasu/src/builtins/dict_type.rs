//! The `dict` class: constructor and methods.
//!
//! Iteration order of every view follows table insertion order.

use crate::{
    builtins::define_method,
    exceptions::{ExcKind, VmResult},
    heap::{Heap, HeapData, HeapId},
    value::Value,
    vm::{Arguments, Vm},
};

pub(crate) fn install(heap: &mut Heap, class: HeapId) {
    heap.class_mut(class).native_ctor = Some(dict_ctor);
    define_method(heap, class, "get", get);
    define_method(heap, class, "keys", keys);
    define_method(heap, class, "values", values);
    define_method(heap, class, "items", items);
    define_method(heap, class, "pop", pop);
    define_method(heap, class, "setdefault", setdefault);
    define_method(heap, class, "update", update);
    define_method(heap, class, "clear", clear);
    define_method(heap, class, "copy", copy);
    define_method(heap, class, "__getitem__", getitem);
    define_method(heap, class, "__setitem__", setitem);
    define_method(heap, class, "__delitem__", delitem);
}

fn receiver(vm: &mut Vm, args: &Arguments, method: &str) -> VmResult<HeapId> {
    let receiver = args.values[0];
    if let Value::Ref(id) = receiver
        && matches!(vm.heap.get(id), HeapData::Dict(_))
    {
        return Ok(id);
    }
    let kind = receiver.type_name(&vm.heap);
    Err(vm.error(
        ExcKind::TypeError,
        &format!("dict.{method}() requires a dict receiver, not '{kind}'"),
    ))
}

fn dict_ctor(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    let dict = vm.heap.allocate_dict();
    let depth = vm.heap.scratch_push(Value::Ref(dict));
    let outcome = (|| -> VmResult<()> {
        match args.values[..] {
            [] => {}
            [source] => {
                let Value::Ref(id) = source else {
                    let kind = source.type_name(&vm.heap);
                    return Err(vm.error(ExcKind::TypeError, &format!("'{kind}' object is not a mapping")));
                };
                if !matches!(vm.heap.get(id), HeapData::Dict(_)) {
                    let kind = source.type_name(&vm.heap);
                    return Err(vm.error(ExcKind::TypeError, &format!("'{kind}' object is not a mapping")));
                }
                let entries: Vec<(Value, Value)> = vm.heap.dict(id).table.iter().map(|(k, v)| (*k, *v)).collect();
                for (key, value) in entries {
                    vm.dict_set(dict, key, value)?;
                }
            }
            _ => return Err(vm.error(ExcKind::ArgumentError, "dict() takes at most 1 argument")),
        }
        if let Some(kwargs) = args.kwargs {
            let entries: Vec<(Value, Value)> = vm.heap.dict(kwargs).table.iter().map(|(k, v)| (*k, *v)).collect();
            for (key, value) in entries {
                vm.dict_set(dict, key, value)?;
            }
        }
        Ok(())
    })();
    vm.heap.scratch_truncate(depth);
    outcome?;
    Ok(Value::Ref(dict))
}

fn get(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    let id = receiver(vm, args, "get")?;
    let (key, default) = match args.values[..] {
        [_, key] => (key, Value::None),
        [_, key, default] => (key, default),
        _ => return Err(vm.error(ExcKind::ArgumentError, "dict.get() takes 1 or 2 arguments")),
    };
    Ok(vm.dict_get(id, key)?.unwrap_or(default))
}

fn keys(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    let id = receiver(vm, args, "keys")?;
    let items: Vec<Value> = vm.heap.dict(id).table.iter().map(|(k, _)| *k).collect();
    Ok(Value::Ref(vm.heap.allocate_list(items)))
}

fn values(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    let id = receiver(vm, args, "values")?;
    let items: Vec<Value> = vm.heap.dict(id).table.iter().map(|(_, v)| *v).collect();
    Ok(Value::Ref(vm.heap.allocate_list(items)))
}

fn items(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    let id = receiver(vm, args, "items")?;
    let entries: Vec<(Value, Value)> = vm.heap.dict(id).table.iter().map(|(k, v)| (*k, *v)).collect();
    let mut rows = Vec::with_capacity(entries.len());
    let scratch = vm.heap.scratch_len();
    for (key, value) in entries {
        let pair = vm.heap.allocate_tuple(vec![key, value]);
        vm.heap.scratch_push(Value::Ref(pair));
        rows.push(Value::Ref(pair));
    }
    let list = vm.heap.allocate_list(rows);
    vm.heap.scratch_truncate(scratch);
    Ok(Value::Ref(list))
}

fn pop(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    let id = receiver(vm, args, "pop")?;
    let (key, default) = match args.values[..] {
        [_, key] => (key, None),
        [_, key, default] => (key, Some(default)),
        _ => return Err(vm.error(ExcKind::ArgumentError, "dict.pop() takes 1 or 2 arguments")),
    };
    match vm.dict_delete(id, key)? {
        Some(value) => Ok(value),
        None => match default {
            Some(default) => Ok(default),
            None => {
                let repr = vm.repr_value(key)?;
                Err(vm.error(ExcKind::KeyError, &repr))
            }
        },
    }
}

fn setdefault(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    let id = receiver(vm, args, "setdefault")?;
    let (key, default) = match args.values[..] {
        [_, key] => (key, Value::None),
        [_, key, default] => (key, default),
        _ => return Err(vm.error(ExcKind::ArgumentError, "dict.setdefault() takes 1 or 2 arguments")),
    };
    if let Some(existing) = vm.dict_get(id, key)? {
        return Ok(existing);
    }
    vm.dict_set(id, key, default)?;
    Ok(default)
}

fn update(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    let id = receiver(vm, args, "update")?;
    let Some(source) = args.values.get(1).copied() else {
        return Err(vm.error(ExcKind::ArgumentError, "dict.update() takes exactly one argument"));
    };
    let Value::Ref(other) = source else {
        let kind = source.type_name(&vm.heap);
        return Err(vm.error(ExcKind::TypeError, &format!("'{kind}' object is not a mapping")));
    };
    if !matches!(vm.heap.get(other), HeapData::Dict(_)) {
        let kind = source.type_name(&vm.heap);
        return Err(vm.error(ExcKind::TypeError, &format!("'{kind}' object is not a mapping")));
    }
    let entries: Vec<(Value, Value)> = vm.heap.dict(other).table.iter().map(|(k, v)| (*k, *v)).collect();
    for (key, value) in entries {
        vm.dict_set(id, key, value)?;
    }
    Ok(Value::None)
}

fn clear(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    let id = receiver(vm, args, "clear")?;
    vm.heap.dict_mut(id).table.clear();
    Ok(Value::None)
}

fn copy(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    let id = receiver(vm, args, "copy")?;
    let entries: Vec<(Value, Value)> = vm.heap.dict(id).table.iter().map(|(k, v)| (*k, *v)).collect();
    let dict = vm.heap.allocate_dict();
    let depth = vm.heap.scratch_push(Value::Ref(dict));
    for (key, value) in entries {
        vm.dict_set(dict, key, value)?;
    }
    vm.heap.scratch_truncate(depth);
    Ok(Value::Ref(dict))
}

fn getitem(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    let id = receiver(vm, args, "__getitem__")?;
    let Some(key) = args.values.get(1).copied() else {
        return Err(vm.error(ExcKind::ArgumentError, "dict.__getitem__() takes exactly one argument"));
    };
    match vm.dict_get(id, key)? {
        Some(value) => Ok(value),
        None => {
            let repr = vm.repr_value(key)?;
            Err(vm.error(ExcKind::KeyError, &repr))
        }
    }
}

fn setitem(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    let id = receiver(vm, args, "__setitem__")?;
    let (Some(key), Some(value)) = (args.values.get(1).copied(), args.values.get(2).copied()) else {
        return Err(vm.error(ExcKind::ArgumentError, "dict.__setitem__() takes exactly 2 arguments"));
    };
    vm.dict_set(id, key, value)?;
    Ok(value)
}

fn delitem(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    let id = receiver(vm, args, "__delitem__")?;
    let Some(key) = args.values.get(1).copied() else {
        return Err(vm.error(ExcKind::ArgumentError, "dict.__delitem__() takes exactly one argument"));
    };
    match vm.dict_delete(id, key)? {
        Some(_) => Ok(Value::None),
        None => {
            let repr = vm.repr_value(key)?;
            Err(vm.error(ExcKind::KeyError, &repr))
        }
    }
}
