//! The `str` class: constructor and methods.

use crate::{
    builtins::{define_method, normalize_index, slice_indices},
    exceptions::{ExcKind, VmResult},
    heap::{Heap, HeapData, HeapId},
    value::Value,
    vm::{Arguments, Vm},
};

pub(crate) fn install(heap: &mut Heap, class: HeapId) {
    heap.class_mut(class).native_ctor = Some(str_ctor);
    define_method(heap, class, "upper", upper);
    define_method(heap, class, "lower", lower);
    define_method(heap, class, "strip", strip);
    define_method(heap, class, "lstrip", lstrip);
    define_method(heap, class, "rstrip", rstrip);
    define_method(heap, class, "split", split);
    define_method(heap, class, "join", join);
    define_method(heap, class, "replace", replace);
    define_method(heap, class, "startswith", startswith);
    define_method(heap, class, "endswith", endswith);
    define_method(heap, class, "find", find);
    define_method(heap, class, "index", index);
    define_method(heap, class, "count", count);
    define_method(heap, class, "encode", encode);
    define_method(heap, class, "__getitem__", getitem);
    define_method(heap, class, "__getslice__", getslice);
}

/// Extracts the receiver string, or raises `TypeError`.
fn receiver(vm: &mut Vm, args: &Arguments, method: &str) -> VmResult<HeapId> {
    let receiver = args.values[0];
    if let Value::Ref(id) = receiver
        && matches!(vm.heap.get(id), HeapData::Str(_))
    {
        return Ok(id);
    }
    let kind = receiver.type_name(&vm.heap);
    Err(vm.error(
        ExcKind::TypeError,
        &format!("str.{method}() requires a str receiver, not '{kind}'"),
    ))
}

fn expect_str_arg(vm: &mut Vm, value: Value, method: &str) -> VmResult<HeapId> {
    if let Value::Ref(id) = value
        && matches!(vm.heap.get(id), HeapData::Str(_))
    {
        return Ok(id);
    }
    let kind = value.type_name(&vm.heap);
    Err(vm.error(
        ExcKind::TypeError,
        &format!("str.{method}() argument must be a str, not '{kind}'"),
    ))
}

fn str_ctor(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    match args.values[..] {
        [] => {
            let id = vm.heap.intern("");
            Ok(Value::Ref(id))
        }
        [value] => {
            let text = vm.str_value(value)?;
            let id = vm.heap.intern(&text);
            Ok(Value::Ref(id))
        }
        _ => Err(vm.error(ExcKind::ArgumentError, "str() takes at most 1 argument")),
    }
}

fn upper(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    let id = receiver(vm, args, "upper")?;
    let result = vm.heap.as_str(id).to_uppercase();
    Ok(Value::Ref(vm.heap.intern(&result)))
}

fn lower(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    let id = receiver(vm, args, "lower")?;
    let result = vm.heap.as_str(id).to_lowercase();
    Ok(Value::Ref(vm.heap.intern(&result)))
}

fn strip_impl(vm: &mut Vm, args: &Arguments, method: &str, left: bool, right: bool) -> VmResult<Value> {
    let id = receiver(vm, args, method)?;
    let chars: Option<Vec<char>> = match args.values.get(1) {
        Some(value) => {
            let arg = expect_str_arg(vm, *value, method)?;
            Some(vm.heap.as_str(arg).chars().collect())
        }
        None => None,
    };
    let text = vm.heap.as_str(id);
    let matcher = |c: char| match &chars {
        Some(set) => set.contains(&c),
        None => c.is_whitespace(),
    };
    let result = match (left, right) {
        (true, true) => text.trim_matches(matcher),
        (true, false) => text.trim_start_matches(matcher),
        _ => text.trim_end_matches(matcher),
    }
    .to_string();
    Ok(Value::Ref(vm.heap.intern(&result)))
}

fn strip(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    strip_impl(vm, args, "strip", true, true)
}

fn lstrip(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    strip_impl(vm, args, "lstrip", true, false)
}

fn rstrip(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    strip_impl(vm, args, "rstrip", false, true)
}

fn split(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    let id = receiver(vm, args, "split")?;
    let pieces: Vec<String> = match args.values.get(1) {
        None | Some(Value::None) => vm.heap.as_str(id).split_whitespace().map(str::to_string).collect(),
        Some(value) => {
            let sep = expect_str_arg(vm, *value, "split")?;
            let sep_text = vm.heap.as_str(sep);
            if sep_text.is_empty() {
                return Err(vm.error(ExcKind::ValueError, "empty separator"));
            }
            vm.heap.as_str(id).split(sep_text).map(str::to_string).collect()
        }
    };
    let mut items = Vec::with_capacity(pieces.len());
    let scratch = vm.heap.scratch_len();
    for piece in pieces {
        let piece_id = vm.heap.intern(&piece);
        vm.heap.scratch_push(Value::Ref(piece_id));
        items.push(Value::Ref(piece_id));
    }
    let list = vm.heap.allocate_list(items);
    vm.heap.scratch_truncate(scratch);
    Ok(Value::Ref(list))
}

fn join(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    let id = receiver(vm, args, "join")?;
    let Some(iterable) = args.values.get(1).copied() else {
        return Err(vm.error(ExcKind::ArgumentError, "str.join() takes exactly one argument"));
    };
    let items = vm.iterate_value(iterable)?;
    let separator = vm.heap.as_str(id).to_string();
    let mut out = String::new();
    for (i, item) in items.iter().enumerate() {
        let piece = expect_str_arg(vm, *item, "join")?;
        if i > 0 {
            out.push_str(&separator);
        }
        out.push_str(vm.heap.as_str(piece));
    }
    Ok(Value::Ref(vm.heap.intern(&out)))
}

fn replace(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    let id = receiver(vm, args, "replace")?;
    let (Some(old), Some(new)) = (args.values.get(1).copied(), args.values.get(2).copied()) else {
        return Err(vm.error(ExcKind::ArgumentError, "str.replace() takes exactly 2 arguments"));
    };
    let old = expect_str_arg(vm, old, "replace")?;
    let new = expect_str_arg(vm, new, "replace")?;
    let result = vm
        .heap
        .as_str(id)
        .replace(vm.heap.as_str(old), vm.heap.as_str(new));
    Ok(Value::Ref(vm.heap.intern(&result)))
}

fn startswith(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    let id = receiver(vm, args, "startswith")?;
    let Some(prefix) = args.values.get(1).copied() else {
        return Err(vm.error(ExcKind::ArgumentError, "str.startswith() takes exactly one argument"));
    };
    let prefix = expect_str_arg(vm, prefix, "startswith")?;
    Ok(Value::Bool(vm.heap.as_str(id).starts_with(vm.heap.as_str(prefix))))
}

fn endswith(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    let id = receiver(vm, args, "endswith")?;
    let Some(suffix) = args.values.get(1).copied() else {
        return Err(vm.error(ExcKind::ArgumentError, "str.endswith() takes exactly one argument"));
    };
    let suffix = expect_str_arg(vm, suffix, "endswith")?;
    Ok(Value::Bool(vm.heap.as_str(id).ends_with(vm.heap.as_str(suffix))))
}

/// Byte offset to codepoint index.
fn char_index_of(text: &str, byte_offset: usize) -> i64 {
    text[..byte_offset].chars().count() as i64
}

fn find(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    let id = receiver(vm, args, "find")?;
    let Some(needle) = args.values.get(1).copied() else {
        return Err(vm.error(ExcKind::ArgumentError, "str.find() takes exactly one argument"));
    };
    let needle = expect_str_arg(vm, needle, "find")?;
    let text = vm.heap.as_str(id);
    match text.find(vm.heap.as_str(needle)) {
        Some(offset) => Ok(Value::Int(char_index_of(text, offset))),
        None => Ok(Value::Int(-1)),
    }
}

fn index(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    match find(vm, args)? {
        Value::Int(-1) => Err(vm.error(ExcKind::ValueError, "substring not found")),
        found => Ok(found),
    }
}

fn count(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    let id = receiver(vm, args, "count")?;
    let Some(needle) = args.values.get(1).copied() else {
        return Err(vm.error(ExcKind::ArgumentError, "str.count() takes exactly one argument"));
    };
    let needle = expect_str_arg(vm, needle, "count")?;
    let needle_text = vm.heap.as_str(needle);
    if needle_text.is_empty() {
        let length = vm.heap.str_object(id).codepoints as i64;
        return Ok(Value::Int(length + 1));
    }
    Ok(Value::Int(vm.heap.as_str(id).matches(needle_text).count() as i64))
}

fn encode(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    let id = receiver(vm, args, "encode")?;
    let data = vm.heap.as_str(id).as_bytes().to_vec();
    let bytes = vm.heap.allocate_bytes(data);
    Ok(Value::Ref(bytes))
}

fn getitem(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    let id = receiver(vm, args, "__getitem__")?;
    let Some(index) = args.values.get(1).copied() else {
        return Err(vm.error(ExcKind::ArgumentError, "str.__getitem__() takes exactly one argument"));
    };
    let length = vm.heap.str_object(id).codepoints;
    let i = normalize_index(vm, index, length, "string")?;
    let ch = vm.heap.str_object(id).char_at(i).expect("index normalized");
    let mut buf = [0u8; 4];
    Ok(Value::Ref(vm.heap.intern(ch.encode_utf8(&mut buf))))
}

fn getslice(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    let id = receiver(vm, args, "__getslice__")?;
    let [_, start, end, step] = args.values[..] else {
        return Err(vm.error(ExcKind::ArgumentError, "str.__getslice__() takes exactly 3 arguments"));
    };
    let length = vm.heap.str_object(id).codepoints;
    let indices = slice_indices(vm, start, end, step, length)?;
    let mut out = String::with_capacity(indices.len());
    for i in indices {
        out.push(vm.heap.str_object(id).char_at(i).expect("slice index in range"));
    }
    Ok(Value::Ref(vm.heap.intern(&out)))
}
