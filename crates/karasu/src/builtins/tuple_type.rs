//! The `tuple` class: constructor and methods.

use crate::{
    builtins::{define_method, normalize_index, slice_indices},
    exceptions::{ExcKind, VmResult},
    heap::{Heap, HeapData, HeapId},
    value::{Value, values_equal},
    vm::{Arguments, Vm},
};

pub(crate) fn install(heap: &mut Heap, class: HeapId) {
    heap.class_mut(class).native_ctor = Some(tuple_ctor);
    define_method(heap, class, "index", index);
    define_method(heap, class, "count", count);
    define_method(heap, class, "__getitem__", getitem);
    define_method(heap, class, "__getslice__", getslice);
}

fn receiver(vm: &mut Vm, args: &Arguments, method: &str) -> VmResult<HeapId> {
    let receiver = args.values[0];
    if let Value::Ref(id) = receiver
        && matches!(vm.heap.get(id), HeapData::Tuple(_))
    {
        return Ok(id);
    }
    let kind = receiver.type_name(&vm.heap);
    Err(vm.error(
        ExcKind::TypeError,
        &format!("tuple.{method}() requires a tuple receiver, not '{kind}'"),
    ))
}

fn tuple_ctor(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    match args.values[..] {
        [] => Ok(Value::Ref(vm.heap.allocate_tuple(Vec::new()))),
        [iterable] => {
            let items = vm.iterate_value(iterable)?;
            Ok(Value::Ref(vm.heap.allocate_tuple(items)))
        }
        _ => Err(vm.error(ExcKind::ArgumentError, "tuple() takes at most 1 argument")),
    }
}

fn index(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    let id = receiver(vm, args, "index")?;
    let Some(item) = args.values.get(1).copied() else {
        return Err(vm.error(ExcKind::ArgumentError, "tuple.index() takes exactly one argument"));
    };
    let position = vm
        .heap
        .tuple(id)
        .items
        .iter()
        .position(|v| values_equal(&vm.heap, v, &item));
    match position {
        Some(at) => Ok(Value::Int(at as i64)),
        None => Err(vm.error(ExcKind::ValueError, "value not in tuple")),
    }
}

fn count(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    let id = receiver(vm, args, "count")?;
    let Some(item) = args.values.get(1).copied() else {
        return Err(vm.error(ExcKind::ArgumentError, "tuple.count() takes exactly one argument"));
    };
    let total = vm
        .heap
        .tuple(id)
        .items
        .iter()
        .filter(|v| values_equal(&vm.heap, v, &item))
        .count();
    Ok(Value::Int(total as i64))
}

fn getitem(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    let id = receiver(vm, args, "__getitem__")?;
    let Some(position) = args.values.get(1).copied() else {
        return Err(vm.error(ExcKind::ArgumentError, "tuple.__getitem__() takes exactly one argument"));
    };
    let len = vm.heap.tuple(id).items.len();
    let at = normalize_index(vm, position, len, "tuple")?;
    Ok(vm.heap.tuple(id).items[at])
}

fn getslice(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    let id = receiver(vm, args, "__getslice__")?;
    let [_, start, end, step] = args.values[..] else {
        return Err(vm.error(ExcKind::ArgumentError, "tuple.__getslice__() takes exactly 3 arguments"));
    };
    let len = vm.heap.tuple(id).items.len();
    let indices = slice_indices(vm, start, end, step, len)?;
    let items: Vec<Value> = indices.into_iter().map(|i| vm.heap.tuple(id).items[i]).collect();
    Ok(Value::Ref(vm.heap.allocate_tuple(items)))
}
