//! The `set` class: constructor and methods.

use crate::{
    builtins::define_method,
    exceptions::{ExcKind, VmResult},
    heap::{Heap, HeapData, HeapId},
    value::Value,
    vm::{Arguments, Vm},
};

pub(crate) fn install(heap: &mut Heap, class: HeapId) {
    heap.class_mut(class).native_ctor = Some(set_ctor);
    define_method(heap, class, "add", add);
    define_method(heap, class, "remove", remove);
    define_method(heap, class, "discard", discard);
    define_method(heap, class, "clear", clear);
    define_method(heap, class, "copy", copy);
    define_method(heap, class, "union", union);
    define_method(heap, class, "intersection", intersection);
    define_method(heap, class, "difference", difference);
}

fn receiver(vm: &mut Vm, args: &Arguments, method: &str) -> VmResult<HeapId> {
    let receiver = args.values[0];
    if let Value::Ref(id) = receiver
        && matches!(vm.heap.get(id), HeapData::Set(_))
    {
        return Ok(id);
    }
    let kind = receiver.type_name(&vm.heap);
    Err(vm.error(
        ExcKind::TypeError,
        &format!("set.{method}() requires a set receiver, not '{kind}'"),
    ))
}

fn build_set(vm: &mut Vm, items: &[Value]) -> VmResult<HeapId> {
    let set = vm.heap.allocate_set();
    let depth = vm.heap.scratch_push(Value::Ref(set));
    for item in items {
        vm.set_add(set, *item)?;
    }
    vm.heap.scratch_truncate(depth);
    Ok(set)
}

fn set_ctor(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    match args.values[..] {
        [] => Ok(Value::Ref(vm.heap.allocate_set())),
        [iterable] => {
            let items = vm.iterate_value(iterable)?;
            Ok(Value::Ref(build_set(vm, &items)?))
        }
        _ => Err(vm.error(ExcKind::ArgumentError, "set() takes at most 1 argument")),
    }
}

fn add(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    let id = receiver(vm, args, "add")?;
    let Some(item) = args.values.get(1).copied() else {
        return Err(vm.error(ExcKind::ArgumentError, "set.add() takes exactly one argument"));
    };
    vm.set_add(id, item)?;
    Ok(Value::None)
}

fn remove(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    let id = receiver(vm, args, "remove")?;
    let Some(item) = args.values.get(1).copied() else {
        return Err(vm.error(ExcKind::ArgumentError, "set.remove() takes exactly one argument"));
    };
    let hash = vm.hash_value(item)?;
    let mut table = vm.heap.take_set_table(id);
    let removed = table.delete_with(hash, |candidate| {
        crate::value::values_same_or_equal(&vm.heap, candidate, &item)
    });
    vm.heap.put_set_table(id, table);
    match removed {
        Some(_) => Ok(Value::None),
        None => {
            let repr = vm.repr_value(item)?;
            Err(vm.error(ExcKind::KeyError, &repr))
        }
    }
}

fn discard(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    let id = receiver(vm, args, "discard")?;
    let Some(item) = args.values.get(1).copied() else {
        return Err(vm.error(ExcKind::ArgumentError, "set.discard() takes exactly one argument"));
    };
    let hash = vm.hash_value(item)?;
    let mut table = vm.heap.take_set_table(id);
    table.delete_with(hash, |candidate| {
        crate::value::values_same_or_equal(&vm.heap, candidate, &item)
    });
    vm.heap.put_set_table(id, table);
    Ok(Value::None)
}

fn clear(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    let id = receiver(vm, args, "clear")?;
    vm.heap.set_obj_mut(id).table.clear();
    Ok(Value::None)
}

fn copy(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    let id = receiver(vm, args, "copy")?;
    let items: Vec<Value> = vm.heap.set_obj(id).table.iter().map(|(k, _)| *k).collect();
    Ok(Value::Ref(build_set(vm, &items)?))
}

fn union(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    let id = receiver(vm, args, "union")?;
    let Some(other) = args.values.get(1).copied() else {
        return Err(vm.error(ExcKind::ArgumentError, "set.union() takes exactly one argument"));
    };
    let mut items: Vec<Value> = vm.heap.set_obj(id).table.iter().map(|(k, _)| *k).collect();
    items.extend(vm.iterate_value(other)?);
    Ok(Value::Ref(build_set(vm, &items)?))
}

fn intersection(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    let id = receiver(vm, args, "intersection")?;
    let Some(other) = args.values.get(1).copied() else {
        return Err(vm.error(ExcKind::ArgumentError, "set.intersection() takes exactly one argument"));
    };
    let other_items = vm.iterate_value(other)?;
    let other_set = build_set(vm, &other_items)?;
    let candidates: Vec<Value> = vm.heap.set_obj(id).table.iter().map(|(k, _)| *k).collect();
    let mut kept = Vec::new();
    let scratch = vm.heap.scratch_push(Value::Ref(other_set));
    for item in candidates {
        if vm.set_contains(other_set, item)? {
            kept.push(item);
        }
    }
    vm.heap.scratch_truncate(scratch);
    Ok(Value::Ref(build_set(vm, &kept)?))
}

fn difference(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    let id = receiver(vm, args, "difference")?;
    let Some(other) = args.values.get(1).copied() else {
        return Err(vm.error(ExcKind::ArgumentError, "set.difference() takes exactly one argument"));
    };
    let other_items = vm.iterate_value(other)?;
    let other_set = build_set(vm, &other_items)?;
    let candidates: Vec<Value> = vm.heap.set_obj(id).table.iter().map(|(k, _)| *k).collect();
    let mut kept = Vec::new();
    let scratch = vm.heap.scratch_push(Value::Ref(other_set));
    for item in candidates {
        if !vm.set_contains(other_set, item)? {
            kept.push(item);
        }
    }
    vm.heap.scratch_truncate(scratch);
    Ok(Value::Ref(build_set(vm, &kept)?))
}
