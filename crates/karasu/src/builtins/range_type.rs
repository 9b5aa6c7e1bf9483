//! The `range` class.
//!
//! Ranges are lazily iterated; only the constructor is native, with
//! iteration handled by the VM's builtin-iterator fast path.

use crate::{
    exceptions::{ExcKind, VmResult},
    heap::{Heap, HeapData, HeapId, RangeObject},
    value::Value,
    vm::{Arguments, Vm},
};

pub(crate) fn install(heap: &mut Heap, class: HeapId) {
    heap.class_mut(class).native_ctor = Some(range_ctor);
}

fn range_ctor(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    let int_of = |vm: &mut Vm, value: Value| -> VmResult<i64> {
        value.as_int().ok_or_else(|| {
            let kind = value.type_name(&vm.heap);
            vm.error(
                ExcKind::TypeError,
                &format!("'{kind}' object cannot be interpreted as an integer"),
            )
        })
    };
    let (start, stop, step) = match args.values[..] {
        [stop] => (0, int_of(vm, stop)?, 1),
        [start, stop] => (int_of(vm, start)?, int_of(vm, stop)?, 1),
        [start, stop, step] => (int_of(vm, start)?, int_of(vm, stop)?, int_of(vm, step)?),
        _ => return Err(vm.error(ExcKind::ArgumentError, "range() takes 1 to 3 arguments")),
    };
    if step == 0 {
        return Err(vm.error(ExcKind::ValueError, "range() arg 3 must not be zero"));
    }
    let id = vm.heap.allocate(HeapData::Range(RangeObject { start, stop, step }));
    Ok(Value::Ref(id))
}
