//! The `bytes` class: constructor and methods.

use crate::{
    builtins::{define_method, normalize_index, slice_indices},
    exceptions::{ExcKind, VmResult},
    heap::{Heap, HeapData, HeapId},
    value::Value,
    vm::{Arguments, Vm},
};

pub(crate) fn install(heap: &mut Heap, class: HeapId) {
    heap.class_mut(class).native_ctor = Some(bytes_ctor);
    define_method(heap, class, "decode", decode);
    define_method(heap, class, "__getitem__", getitem);
    define_method(heap, class, "__getslice__", getslice);
}

fn receiver(vm: &mut Vm, args: &Arguments, method: &str) -> VmResult<HeapId> {
    let receiver = args.values[0];
    if let Value::Ref(id) = receiver
        && matches!(vm.heap.get(id), HeapData::Bytes(_))
    {
        return Ok(id);
    }
    let kind = receiver.type_name(&vm.heap);
    Err(vm.error(
        ExcKind::TypeError,
        &format!("bytes.{method}() requires a bytes receiver, not '{kind}'"),
    ))
}

fn bytes_ctor(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    match args.values[..] {
        [] => Ok(Value::Ref(vm.heap.allocate_bytes(Vec::new()))),
        [source] => match source {
            Value::Int(n) => {
                let size = usize::try_from(n)
                    .map_err(|_| vm.error(ExcKind::ValueError, "negative count"))?;
                Ok(Value::Ref(vm.heap.allocate_bytes(vec![0; size])))
            }
            Value::Ref(id) if matches!(vm.heap.get(id), HeapData::Bytes(_)) => {
                let data = vm.heap.bytes(id).data.to_vec();
                Ok(Value::Ref(vm.heap.allocate_bytes(data)))
            }
            _ => {
                let items = vm.iterate_value(source)?;
                let mut data = Vec::with_capacity(items.len());
                for item in items {
                    match item.as_int() {
                        Some(byte) if (0..=255).contains(&byte) => data.push(byte as u8),
                        Some(_) => {
                            return Err(vm.error(ExcKind::ValueError, "bytes must be in range(0, 256)"));
                        }
                        None => {
                            let kind = item.type_name(&vm.heap);
                            return Err(vm.error(
                                ExcKind::TypeError,
                                &format!("'{kind}' object cannot be interpreted as an integer"),
                            ));
                        }
                    }
                }
                Ok(Value::Ref(vm.heap.allocate_bytes(data)))
            }
        },
        _ => Err(vm.error(ExcKind::ArgumentError, "bytes() takes at most 1 argument")),
    }
}

fn decode(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    let id = receiver(vm, args, "decode")?;
    let data = vm.heap.bytes(id).data.to_vec();
    match String::from_utf8(data) {
        Ok(text) => Ok(Value::Ref(vm.heap.intern(&text))),
        Err(_) => Err(vm.error(ExcKind::ValueError, "invalid utf-8 sequence")),
    }
}

fn getitem(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    let id = receiver(vm, args, "__getitem__")?;
    let Some(position) = args.values.get(1).copied() else {
        return Err(vm.error(ExcKind::ArgumentError, "bytes.__getitem__() takes exactly one argument"));
    };
    let len = vm.heap.bytes(id).data.len();
    let at = normalize_index(vm, position, len, "bytes")?;
    Ok(Value::Int(i64::from(vm.heap.bytes(id).data[at])))
}

fn getslice(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    let id = receiver(vm, args, "__getslice__")?;
    let [_, start, end, step] = args.values[..] else {
        return Err(vm.error(ExcKind::ArgumentError, "bytes.__getslice__() takes exactly 3 arguments"));
    };
    let len = vm.heap.bytes(id).data.len();
    let indices = slice_indices(vm, start, end, step, len)?;
    let data: Vec<u8> = indices.into_iter().map(|i| vm.heap.bytes(id).data[i]).collect();
    Ok(Value::Ref(vm.heap.allocate_bytes(data)))
}
