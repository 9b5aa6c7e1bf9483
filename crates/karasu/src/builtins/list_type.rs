//! The `list` class: constructor and methods.

use crate::{
    builtins::{define_method, normalize_index, slice_indices},
    exceptions::{ExcKind, VmResult},
    heap::{Heap, HeapData, HeapId},
    value::{Value, values_equal},
    vm::{Arguments, Vm},
};

pub(crate) fn install(heap: &mut Heap, class: HeapId) {
    heap.class_mut(class).native_ctor = Some(list_ctor);
    define_method(heap, class, "append", append);
    define_method(heap, class, "extend", extend);
    define_method(heap, class, "insert", insert);
    define_method(heap, class, "pop", pop);
    define_method(heap, class, "remove", remove);
    define_method(heap, class, "clear", clear);
    define_method(heap, class, "index", index);
    define_method(heap, class, "count", count);
    define_method(heap, class, "sort", sort);
    define_method(heap, class, "reverse", reverse);
    define_method(heap, class, "copy", copy);
    define_method(heap, class, "__getitem__", getitem);
    define_method(heap, class, "__setitem__", setitem);
    define_method(heap, class, "__delitem__", delitem);
    define_method(heap, class, "__getslice__", getslice);
    define_method(heap, class, "__setslice__", setslice);
}

fn receiver(vm: &mut Vm, args: &Arguments, method: &str) -> VmResult<HeapId> {
    let receiver = args.values[0];
    if let Value::Ref(id) = receiver
        && matches!(vm.heap.get(id), HeapData::List(_))
    {
        return Ok(id);
    }
    let kind = receiver.type_name(&vm.heap);
    Err(vm.error(
        ExcKind::TypeError,
        &format!("list.{method}() requires a list receiver, not '{kind}'"),
    ))
}

fn list_ctor(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    match args.values[..] {
        [] => Ok(Value::Ref(vm.heap.allocate_list(Vec::new()))),
        [iterable] => {
            let items = vm.iterate_value(iterable)?;
            Ok(Value::Ref(vm.heap.allocate_list(items)))
        }
        _ => Err(vm.error(ExcKind::ArgumentError, "list() takes at most 1 argument")),
    }
}

fn append(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    let id = receiver(vm, args, "append")?;
    let Some(item) = args.values.get(1).copied() else {
        return Err(vm.error(ExcKind::ArgumentError, "list.append() takes exactly one argument"));
    };
    vm.heap.list_mut(id).items.push(item);
    Ok(Value::None)
}

fn extend(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    let id = receiver(vm, args, "extend")?;
    let Some(iterable) = args.values.get(1).copied() else {
        return Err(vm.error(ExcKind::ArgumentError, "list.extend() takes exactly one argument"));
    };
    let items = vm.iterate_value(iterable)?;
    vm.heap.list_mut(id).items.extend(items);
    Ok(Value::None)
}

fn insert(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    let id = receiver(vm, args, "insert")?;
    let (Some(position), Some(item)) = (args.values.get(1).copied(), args.values.get(2).copied()) else {
        return Err(vm.error(ExcKind::ArgumentError, "list.insert() takes exactly 2 arguments"));
    };
    let Some(mut at) = position.as_int() else {
        return Err(vm.error(ExcKind::TypeError, "list.insert() index must be an integer"));
    };
    let len = vm.heap.list(id).items.len() as i64;
    if at < 0 {
        at += len;
    }
    let at = at.clamp(0, len) as usize;
    vm.heap.list_mut(id).items.insert(at, item);
    Ok(Value::None)
}

fn pop(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    let id = receiver(vm, args, "pop")?;
    let len = vm.heap.list(id).items.len();
    if len == 0 {
        return Err(vm.error(ExcKind::IndexError, "pop from empty list"));
    }
    let at = match args.values.get(1).copied() {
        Some(position) => normalize_index(vm, position, len, "list")?,
        None => len - 1,
    };
    Ok(vm.heap.list_mut(id).items.remove(at))
}

fn remove(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    let id = receiver(vm, args, "remove")?;
    let Some(item) = args.values.get(1).copied() else {
        return Err(vm.error(ExcKind::ArgumentError, "list.remove() takes exactly one argument"));
    };
    let position = vm
        .heap
        .list(id)
        .items
        .iter()
        .position(|v| values_equal(&vm.heap, v, &item));
    match position {
        Some(at) => {
            vm.heap.list_mut(id).items.remove(at);
            Ok(Value::None)
        }
        None => Err(vm.error(ExcKind::ValueError, "list.remove(x): x not in list")),
    }
}

fn clear(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    let id = receiver(vm, args, "clear")?;
    vm.heap.list_mut(id).items.clear();
    Ok(Value::None)
}

fn index(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    let id = receiver(vm, args, "index")?;
    let Some(item) = args.values.get(1).copied() else {
        return Err(vm.error(ExcKind::ArgumentError, "list.index() takes exactly one argument"));
    };
    let position = vm
        .heap
        .list(id)
        .items
        .iter()
        .position(|v| values_equal(&vm.heap, v, &item));
    match position {
        Some(at) => Ok(Value::Int(at as i64)),
        None => Err(vm.error(ExcKind::ValueError, "value not in list")),
    }
}

fn count(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    let id = receiver(vm, args, "count")?;
    let Some(item) = args.values.get(1).copied() else {
        return Err(vm.error(ExcKind::ArgumentError, "list.count() takes exactly one argument"));
    };
    let total = vm
        .heap
        .list(id)
        .items
        .iter()
        .filter(|v| values_equal(&vm.heap, v, &item))
        .count();
    Ok(Value::Int(total as i64))
}

fn sort(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    let id = receiver(vm, args, "sort")?;
    let mut key = Value::None;
    let mut reverse = false;
    if let Some(kwargs) = args.kwargs {
        let key_name = vm.heap.intern("key");
        if let Some(value) = vm.dict_get(kwargs, Value::Ref(key_name))? {
            key = value;
        }
        let reverse_name = vm.heap.intern("reverse");
        if let Some(value) = vm.dict_get(kwargs, Value::Ref(reverse_name))? {
            reverse = vm.value_truthy(value)?;
        }
    }
    vm.sort_values(id, key, reverse)?;
    Ok(Value::None)
}

fn reverse(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    let id = receiver(vm, args, "reverse")?;
    vm.heap.list_mut(id).items.reverse();
    Ok(Value::None)
}

fn copy(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    let id = receiver(vm, args, "copy")?;
    let items = vm.heap.list(id).items.clone();
    Ok(Value::Ref(vm.heap.allocate_list(items)))
}

fn getitem(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    let id = receiver(vm, args, "__getitem__")?;
    let Some(position) = args.values.get(1).copied() else {
        return Err(vm.error(ExcKind::ArgumentError, "list.__getitem__() takes exactly one argument"));
    };
    let len = vm.heap.list(id).items.len();
    let at = normalize_index(vm, position, len, "list")?;
    Ok(vm.heap.list(id).items[at])
}

fn setitem(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    let id = receiver(vm, args, "__setitem__")?;
    let (Some(position), Some(item)) = (args.values.get(1).copied(), args.values.get(2).copied()) else {
        return Err(vm.error(ExcKind::ArgumentError, "list.__setitem__() takes exactly 2 arguments"));
    };
    let len = vm.heap.list(id).items.len();
    let at = normalize_index(vm, position, len, "list")?;
    vm.heap.list_mut(id).items[at] = item;
    Ok(item)
}

fn delitem(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    let id = receiver(vm, args, "__delitem__")?;
    let Some(position) = args.values.get(1).copied() else {
        return Err(vm.error(ExcKind::ArgumentError, "list.__delitem__() takes exactly one argument"));
    };
    let len = vm.heap.list(id).items.len();
    let at = normalize_index(vm, position, len, "list")?;
    vm.heap.list_mut(id).items.remove(at);
    Ok(Value::None)
}

fn getslice(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    let id = receiver(vm, args, "__getslice__")?;
    let [_, start, end, step] = args.values[..] else {
        return Err(vm.error(ExcKind::ArgumentError, "list.__getslice__() takes exactly 3 arguments"));
    };
    let len = vm.heap.list(id).items.len();
    let indices = slice_indices(vm, start, end, step, len)?;
    let items: Vec<Value> = indices.into_iter().map(|i| vm.heap.list(id).items[i]).collect();
    Ok(Value::Ref(vm.heap.allocate_list(items)))
}

fn setslice(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    let id = receiver(vm, args, "__setslice__")?;
    let [_, start, end, step, value] = args.values[..] else {
        return Err(vm.error(ExcKind::ArgumentError, "list.__setslice__() takes exactly 4 arguments"));
    };
    if !matches!(step, Value::None | Value::Int(1)) {
        return Err(vm.error(ExcKind::ValueError, "slice assignment requires step 1"));
    }
    let replacement = vm.iterate_value(value)?;
    let len = vm.heap.list(id).items.len();
    let indices = slice_indices(vm, start, end, Value::Int(1), len)?;
    let (from, to) = match (indices.first(), indices.last()) {
        (Some(first), Some(last)) => (*first, *last + 1),
        _ => {
            // Empty selection: insert at the (clamped) start position.
            let at = match start.as_int() {
                Some(n) if n < 0 => (n + len as i64).clamp(0, len as i64) as usize,
                Some(n) => (n as usize).min(len),
                None => 0,
            };
            (at, at)
        }
    };
    vm.heap.list_mut(id).items.splice(from..to, replacement);
    Ok(value)
}
