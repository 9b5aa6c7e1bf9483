//! Global builtin functions and the `repr`/`str` rendering core.

use std::fmt::Write as _;

use crate::{
    exceptions::{ExcKind, VmResult},
    heap::{Dunder, HeapData, HeapId},
    value::Value,
    vm::{Arguments, Vm},
};

/// The global function table installed into the `builtins` module.
pub(crate) const GLOBALS: &[(&str, crate::vm::NativeFn, &str)] = &[
    ("print", print, "Print values separated by sep, followed by end."),
    ("len", len, "Return the number of items in a container."),
    ("repr", repr, "Return the canonical string representation."),
    ("type", type_, "Return the class of a value."),
    ("isinstance", isinstance, "Check whether a value is an instance of a class."),
    ("issubclass", issubclass, "Check whether a class derives from another."),
    ("hash", hash, "Return the hash of a value."),
    ("ord", ord, "Return the codepoint of a one-character string."),
    ("chr", chr, "Return the one-character string for a codepoint."),
    ("hex", hex, "Format an integer in base 16."),
    ("oct", oct, "Format an integer in base 8."),
    ("bin", bin, "Format an integer in base 2."),
    ("abs", abs, "Absolute value of a number."),
    ("min", min, "Smallest of the arguments or of an iterable."),
    ("max", max, "Largest of the arguments or of an iterable."),
    ("sum", sum, "Sum of an iterable, plus an optional start value."),
    ("any", any, "True if any element of the iterable is truthy."),
    ("all", all, "True if every element of the iterable is truthy."),
    ("sorted", sorted, "Return a sorted list of the iterable's items."),
    ("getattr", getattr, "Get a named attribute, with an optional default."),
    ("setattr", setattr, "Set a named attribute."),
    ("hasattr", hasattr, "Check whether an attribute exists."),
    ("dir", dir, "List an object's attribute names."),
    ("id", id, "Return a value's identity."),
    ("globals", globals, "Return a snapshot of the current module globals."),
    ("__import__", crate::modules::import_builtin, "Import a module by name."),
    ("__export__", crate::modules::export_builtin, "Mark module members for star-visibility."),
];

fn arity_error(vm: &mut Vm, name: &str, expected: &str, got: usize) -> crate::exceptions::VmError {
    vm.error(
        ExcKind::ArgumentError,
        &format!("{name}() takes {expected} arguments ({got} given)"),
    )
}

fn print(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    let mut sep = String::from(" ");
    let mut end = String::from("\n");
    if let Some(kwargs) = args.kwargs {
        let sep_name = vm.heap.intern("sep");
        if let Some(value) = vm.dict_get(kwargs, Value::Ref(sep_name))? {
            sep = vm.str_value(value)?;
        }
        let end_name = vm.heap.intern("end");
        if let Some(value) = vm.dict_get(kwargs, Value::Ref(end_name))? {
            end = vm.str_value(value)?;
        }
    }
    let mut rendered = Vec::with_capacity(args.values.len());
    for value in &args.values {
        rendered.push(vm.str_value(*value)?);
    }
    for (i, text) in rendered.iter().enumerate() {
        if i > 0 {
            vm.stdout.stdout_write(&sep);
        }
        vm.stdout.stdout_write(text);
    }
    for ch in end.chars() {
        vm.stdout.stdout_push(ch);
    }
    Ok(Value::None)
}

fn len(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    let [value] = args.values[..] else {
        return Err(arity_error(vm, "len", "exactly 1", args.values.len()));
    };
    let length = vm.value_length(value)?;
    Ok(Value::Int(length))
}

fn repr(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    let [value] = args.values[..] else {
        return Err(arity_error(vm, "repr", "exactly 1", args.values.len()));
    };
    let text = vm.repr_value(value)?;
    let id = vm.heap.intern(&text);
    Ok(Value::Ref(id))
}

fn type_(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    let [value] = args.values[..] else {
        return Err(arity_error(vm, "type", "exactly 1", args.values.len()));
    };
    Ok(Value::Ref(vm.class_of(value)))
}

fn isinstance(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    let [value, classinfo] = args.values[..] else {
        return Err(arity_error(vm, "isinstance", "exactly 2", args.values.len()));
    };
    Ok(Value::Bool(isinstance_check(vm, value, classinfo)?))
}

fn isinstance_check(vm: &mut Vm, value: Value, classinfo: Value) -> VmResult<bool> {
    match classinfo {
        Value::Ref(id) => match vm.heap.get(id) {
            HeapData::Class(_) => Ok(vm.isinstance(value, id)),
            HeapData::Tuple(t) => {
                let options = t.items.clone();
                for option in options {
                    if isinstance_check(vm, value, option)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            _ => Err(vm.error(ExcKind::TypeError, "isinstance() arg 2 must be a class or tuple of classes")),
        },
        _ => Err(vm.error(ExcKind::TypeError, "isinstance() arg 2 must be a class or tuple of classes")),
    }
}

fn issubclass(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    let [class, base] = args.values[..] else {
        return Err(arity_error(vm, "issubclass", "exactly 2", args.values.len()));
    };
    let (Value::Ref(class_id), Value::Ref(base_id)) = (class, base) else {
        return Err(vm.error(ExcKind::TypeError, "issubclass() arguments must be classes"));
    };
    if !matches!(vm.heap.get(class_id), HeapData::Class(_)) || !matches!(vm.heap.get(base_id), HeapData::Class(_)) {
        return Err(vm.error(ExcKind::TypeError, "issubclass() arguments must be classes"));
    }
    Ok(Value::Bool(vm.is_subclass(class_id, base_id)))
}

fn hash(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    let [value] = args.values[..] else {
        return Err(arity_error(vm, "hash", "exactly 1", args.values.len()));
    };
    let hash = vm.hash_value(value)?;
    Ok(Value::Int(i64::from(hash)))
}

fn ord(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    let [value] = args.values[..] else {
        return Err(arity_error(vm, "ord", "exactly 1", args.values.len()));
    };
    let Value::Ref(id) = value else {
        let kind = value.type_name(&vm.heap);
        return Err(vm.error(ExcKind::TypeError, &format!("ord() expected a string, got '{kind}'")));
    };
    let HeapData::Str(s) = vm.heap.get(id) else {
        let kind = value.type_name(&vm.heap);
        return Err(vm.error(ExcKind::TypeError, &format!("ord() expected a string, got '{kind}'")));
    };
    if s.codepoints != 1 {
        let count = s.codepoints;
        return Err(vm.error(
            ExcKind::TypeError,
            &format!("ord() expected a character, but string of length {count} found"),
        ));
    }
    let ch = s.char_at(0).expect("length checked");
    Ok(Value::Int(i64::from(ch as u32)))
}

fn chr(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    let [value] = args.values[..] else {
        return Err(arity_error(vm, "chr", "exactly 1", args.values.len()));
    };
    let Some(code) = value.as_int() else {
        let kind = value.type_name(&vm.heap);
        return Err(vm.error(ExcKind::TypeError, &format!("chr() expected an integer, got '{kind}'")));
    };
    let ch = u32::try_from(code)
        .ok()
        .and_then(char::from_u32)
        .ok_or_else(|| vm.error(ExcKind::ValueError, "chr() arg not in range(0x110000)"))?;
    let mut buf = [0u8; 4];
    let id = vm.heap.intern(ch.encode_utf8(&mut buf));
    Ok(Value::Ref(id))
}

fn format_radix(vm: &mut Vm, args: &Arguments, name: &str, prefix: &str, radix: u32) -> VmResult<Value> {
    let [value] = args.values[..] else {
        return Err(arity_error(vm, name, "exactly 1", args.values.len()));
    };
    let Some(n) = value.as_int() else {
        let kind = value.type_name(&vm.heap);
        return Err(vm.error(
            ExcKind::TypeError,
            &format!("{name}() expected an integer, got '{kind}'"),
        ));
    };
    let magnitude = n.unsigned_abs();
    let digits = match radix {
        16 => format!("{magnitude:x}"),
        8 => format!("{magnitude:o}"),
        _ => format!("{magnitude:b}"),
    };
    let sign = if n < 0 { "-" } else { "" };
    let id = vm.heap.intern(&format!("{sign}{prefix}{digits}"));
    Ok(Value::Ref(id))
}

fn hex(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    format_radix(vm, args, "hex", "0x", 16)
}

fn oct(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    format_radix(vm, args, "oct", "0o", 8)
}

fn bin(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    format_radix(vm, args, "bin", "0b", 2)
}

fn abs(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    let [value] = args.values[..] else {
        return Err(arity_error(vm, "abs", "exactly 1", args.values.len()));
    };
    match value {
        Value::Int(n) => Ok(Value::Int(n.wrapping_abs())),
        Value::Bool(b) => Ok(Value::Int(i64::from(b))),
        Value::Float(f) => Ok(Value::Float(f.abs())),
        _ => {
            let kind = value.type_name(&vm.heap);
            Err(vm.error(ExcKind::TypeError, &format!("bad operand type for abs(): '{kind}'")))
        }
    }
}

fn min_max(vm: &mut Vm, args: &Arguments, name: &str, want_greater: bool) -> VmResult<Value> {
    let candidates = if args.values.len() > 1 {
        args.values.to_vec()
    } else {
        let [iterable] = args.values[..] else {
            return Err(arity_error(vm, name, "at least 1", 0));
        };
        vm.iterate_value(iterable)?
    };
    if candidates.is_empty() {
        return Err(vm.error(ExcKind::ValueError, &format!("{name}() arg is an empty sequence")));
    }
    let mut best = candidates[0];
    for candidate in &candidates[1..] {
        let ordering = crate::vm::binary::compare_values(&vm.heap, candidate, &best);
        let Some(ordering) = ordering else {
            return Err(vm.error(ExcKind::TypeError, &format!("{name}() got unorderable values")));
        };
        let replace = if want_greater {
            ordering == std::cmp::Ordering::Greater
        } else {
            ordering == std::cmp::Ordering::Less
        };
        if replace {
            best = *candidate;
        }
    }
    Ok(best)
}

fn min(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    min_max(vm, args, "min", false)
}

fn max(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    min_max(vm, args, "max", true)
}

fn sum(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    let (iterable, start) = match args.values[..] {
        [iterable] => (iterable, Value::Int(0)),
        [iterable, start] => (iterable, start),
        _ => return Err(arity_error(vm, "sum", "1 or 2", args.values.len())),
    };
    let items = vm.iterate_value(iterable)?;
    let mut acc = start;
    for item in items {
        // Reuse the operator path so floats and dunders behave.
        vm.push(acc);
        vm.push(item);
        vm.binary_operator(crate::opcode::Opcode::Add)?;
        acc = vm.pop();
    }
    Ok(acc)
}

fn any(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    let [iterable] = args.values[..] else {
        return Err(arity_error(vm, "any", "exactly 1", args.values.len()));
    };
    let items = vm.iterate_value(iterable)?;
    for item in items {
        if vm.value_truthy(item)? {
            return Ok(Value::Bool(true));
        }
    }
    Ok(Value::Bool(false))
}

fn all(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    let [iterable] = args.values[..] else {
        return Err(arity_error(vm, "all", "exactly 1", args.values.len()));
    };
    let items = vm.iterate_value(iterable)?;
    for item in items {
        if !vm.value_truthy(item)? {
            return Ok(Value::Bool(false));
        }
    }
    Ok(Value::Bool(true))
}

fn sorted(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    let [iterable] = args.values[..] else {
        return Err(arity_error(vm, "sorted", "exactly 1", args.values.len()));
    };
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
    let items = vm.iterate_value(iterable)?;
    let result = vm.heap.allocate_list(items);
    // The items stay rooted through the result list while keys run.
    let depth = vm.heap.scratch_push(Value::Ref(result));
    let outcome = vm.sort_values(result, key, reverse);
    vm.heap.scratch_truncate(depth);
    outcome?;
    Ok(Value::Ref(result))
}

fn getattr(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    let (value, name, default) = match args.values[..] {
        [value, name] => (value, name, None),
        [value, name, default] => (value, name, Some(default)),
        _ => return Err(arity_error(vm, "getattr", "2 or 3", args.values.len())),
    };
    let Value::Ref(name_id) = name else {
        return Err(vm.error(ExcKind::TypeError, "attribute name must be a string"));
    };
    if !matches!(vm.heap.get(name_id), HeapData::Str(_)) {
        return Err(vm.error(ExcKind::TypeError, "attribute name must be a string"));
    }
    match vm.get_attribute_value(value, name) {
        Ok(found) => Ok(found),
        Err(err) => {
            let attribute_error = vm.registry.exception_class(ExcKind::AttributeError);
            if vm.isinstance(err.value(), attribute_error)
                && let Some(default) = default
            {
                Ok(default)
            } else {
                Err(err)
            }
        }
    }
}

fn setattr(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    let [value, name, attribute] = args.values[..] else {
        return Err(arity_error(vm, "setattr", "exactly 3", args.values.len()));
    };
    let Value::Ref(name_id) = name else {
        return Err(vm.error(ExcKind::TypeError, "attribute name must be a string"));
    };
    if !matches!(vm.heap.get(name_id), HeapData::Str(_)) {
        return Err(vm.error(ExcKind::TypeError, "attribute name must be a string"));
    }
    vm.push(value);
    vm.push(attribute);
    vm.set_property(name)?;
    vm.pop();
    Ok(Value::None)
}

fn hasattr(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    let [value, name] = args.values[..] else {
        return Err(arity_error(vm, "hasattr", "exactly 2", args.values.len()));
    };
    let Value::Ref(name_id) = name else {
        return Err(vm.error(ExcKind::TypeError, "attribute name must be a string"));
    };
    if !matches!(vm.heap.get(name_id), HeapData::Str(_)) {
        return Err(vm.error(ExcKind::TypeError, "attribute name must be a string"));
    }
    match vm.get_attribute_value(value, name) {
        Ok(_) => Ok(Value::Bool(true)),
        Err(err) => {
            let attribute_error = vm.registry.exception_class(ExcKind::AttributeError);
            if vm.isinstance(err.value(), attribute_error) {
                Ok(Value::Bool(false))
            } else {
                Err(err)
            }
        }
    }
}

fn dir(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    let [value] = args.values[..] else {
        return Err(arity_error(vm, "dir", "exactly 1", args.values.len()));
    };
    let mut names: Vec<String> = Vec::new();
    if let Value::Ref(id) = value
        && let HeapData::Instance(instance) = vm.heap.get(id)
    {
        for (key, _) in instance.fields.iter() {
            if let Value::Ref(name_id) = key {
                names.push(vm.heap.as_str(*name_id).to_string());
            }
        }
    }
    let mut class = Some(vm.class_of(value));
    while let Some(class_id) = class {
        for (key, _) in vm.heap.class(class_id).table.iter() {
            if let Value::Ref(name_id) = key {
                names.push(vm.heap.as_str(*name_id).to_string());
            }
        }
        class = vm.heap.class(class_id).base;
    }
    names.sort();
    names.dedup();
    let mut items = Vec::with_capacity(names.len());
    for name in names {
        let id = vm.heap.intern(&name);
        items.push(Value::Ref(id));
    }
    let list = vm.heap.allocate_list(items);
    Ok(Value::Ref(list))
}

fn id(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    let [value] = args.values[..] else {
        return Err(arity_error(vm, "id", "exactly 1", args.values.len()));
    };
    match value {
        Value::Ref(heap_id) => Ok(Value::Int(heap_id.index() as i64)),
        other => {
            let hash = crate::value::value_hash(&vm.heap, &other)
                .map_err(|_| vm.error(ExcKind::TypeError, "unidentifiable value"))?;
            Ok(Value::Int(i64::from(hash)))
        }
    }
}

fn globals(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    if !args.values.is_empty() {
        return Err(arity_error(vm, "globals", "no", args.values.len()));
    }
    let Some(frame) = vm.thread.frames.last() else {
        return Err(vm.error(ExcKind::SystemError, "globals() outside of any frame"));
    };
    let module = frame.globals;
    let entries: Vec<(Value, Value)> = vm
        .heap
        .instance(module)
        .fields
        .iter()
        .map(|(k, v)| (*k, *v))
        .collect();
    let dict = vm.heap.allocate_dict();
    let depth = vm.heap.scratch_push(Value::Ref(dict));
    for (key, value) in entries {
        vm.dict_set(dict, key, value)?;
    }
    vm.heap.scratch_truncate(depth);
    Ok(Value::Ref(dict))
}

// ======================================================================
// Exception instance behavior
// ======================================================================

pub(crate) fn exception_init(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    let receiver = args.values[0];
    let Value::Ref(instance) = receiver else {
        return Err(vm.error(ExcKind::TypeError, "__init__ on a non-instance"));
    };
    if let Some(argument) = args.values.get(1) {
        let arg_name = vm.registry.name_arg;
        let hash = vm.heap.cached_hash(arg_name);
        vm.heap
            .instance_mut(instance)
            .fields
            .set_exact(Value::Ref(arg_name), hash, *argument);
    }
    Ok(Value::None)
}

pub(crate) fn exception_str(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    let receiver = args.values[0];
    let text = vm.exception_message(receiver).unwrap_or_default();
    let id = vm.heap.intern(&text);
    Ok(Value::Ref(id))
}

pub(crate) fn exception_repr(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    let receiver = args.values[0];
    let class = vm.class_of(receiver);
    let class_name = vm.heap.as_str(vm.heap.class(class).name).to_string();
    let text = match vm.exception_message(receiver) {
        Some(message) if !message.is_empty() => format!("{class_name}({message:?})"),
        _ => format!("{class_name}()"),
    };
    let id = vm.heap.intern(&text);
    Ok(Value::Ref(id))
}

// ======================================================================
// repr / str rendering
// ======================================================================

impl Vm {
    /// The length of a container, dispatching `__len__` for instances.
    pub(crate) fn value_length(&mut self, value: Value) -> VmResult<i64> {
        if let Value::Ref(id) = value {
            let length = match self.heap.get(id) {
                HeapData::Str(s) => Some(s.codepoints as i64),
                HeapData::Bytes(b) => Some(b.data.len() as i64),
                HeapData::Tuple(t) => Some(t.items.len() as i64),
                HeapData::List(l) => Some(l.items.len() as i64),
                HeapData::Dict(d) => Some(d.table.len() as i64),
                HeapData::Set(s) => Some(s.table.len() as i64),
                HeapData::Range(r) => Some(r.len()),
                _ => None,
            };
            if let Some(length) = length {
                return Ok(length);
            }
            if matches!(self.heap.get(id), HeapData::Instance(_)) {
                let class = self.heap.instance(id).class;
                if let Some(method) = self.heap.class(class).dunders.get(Dunder::Len) {
                    let result = self.call_dunder(method, value, &[])?;
                    if let Some(n) = result.as_int() {
                        return Ok(n);
                    }
                    return Err(self.error(ExcKind::TypeError, "__len__ must return an integer"));
                }
            }
        }
        let kind = value.type_name(&self.heap);
        Err(self.error(ExcKind::TypeError, &format!("object of type '{kind}' has no len()")))
    }

    /// Materializes any iterable into a vector of values.
    pub(crate) fn iterate_value(&mut self, value: Value) -> VmResult<Vec<Value>> {
        if let Value::Ref(id) = value {
            match self.heap.get(id) {
                HeapData::List(l) => return Ok(l.items.clone()),
                HeapData::Tuple(t) => return Ok(t.items.clone()),
                HeapData::Dict(d) => return Ok(d.table.iter().map(|(k, _)| *k).collect()),
                HeapData::Set(s) => return Ok(s.table.iter().map(|(k, _)| *k).collect()),
                HeapData::Bytes(b) => {
                    return Ok(b.data.iter().map(|byte| Value::Int(i64::from(*byte))).collect());
                }
                HeapData::Range(r) => {
                    let r = *r;
                    let mut items = Vec::new();
                    let mut current = r.start;
                    while if r.step > 0 { current < r.stop } else { current > r.stop } {
                        items.push(Value::Int(current));
                        current += r.step;
                    }
                    return Ok(items);
                }
                HeapData::Str(_) => {
                    let chars: Vec<char> = self.heap.as_str(id).chars().collect();
                    let mut items = Vec::with_capacity(chars.len());
                    for ch in chars {
                        let mut buf = [0u8; 4];
                        let s = self.heap.intern(ch.encode_utf8(&mut buf));
                        // Keep interned chars alive while the rest allocate.
                        self.heap.scratch_push(Value::Ref(s));
                        items.push(Value::Ref(s));
                    }
                    self.heap.scratch_truncate(self.heap.scratch_len() - items.len());
                    return Ok(items);
                }
                _ => {}
            }
        }
        // Protocol path: iter() then call-until-sentinel. Collected values
        // are parked in the scratch roots until the vector is complete.
        self.push(value);
        self.invoke_iter()?;
        let iterator = self.pop();
        let mut items = Vec::new();
        let scratch_base = self.heap.scratch_len();
        self.heap.scratch_push(iterator);
        loop {
            let next = self.call_direct(iterator, &[])?;
            if next.identical(&iterator) {
                break;
            }
            self.heap.scratch_push(next);
            items.push(next);
        }
        self.heap.scratch_truncate(scratch_base);
        Ok(items)
    }

    /// Sorts a list in place, optionally through a key function.
    pub(crate) fn sort_values(&mut self, list: HeapId, key: Value, reverse: bool) -> VmResult<()> {
        let items = self.heap.list(list).items.clone();
        let mut decorated: Vec<(Value, Value)> = Vec::with_capacity(items.len());
        if key.is_none() {
            for item in &items {
                decorated.push((*item, *item));
            }
        } else {
            let scratch_base = self.heap.scratch_len();
            for item in &items {
                let computed = self.call_direct(key, &[*item])?;
                self.heap.scratch_push(computed);
                decorated.push((computed, *item));
            }
            self.heap.scratch_truncate(scratch_base);
        }
        decorated.sort_by(|a, b| crate::vm::binary::compare_for_sort(&self.heap, &a.0, &b.0));
        if reverse {
            decorated.reverse();
        }
        let sorted: Vec<Value> = decorated.into_iter().map(|(_, item)| item).collect();
        self.heap.list_mut(list).items = sorted;
        Ok(())
    }

    /// Canonical string representation.
    pub(crate) fn repr_value(&mut self, value: Value) -> VmResult<String> {
        match value {
            Value::None => Ok(String::from("None")),
            Value::Bool(true) => Ok(String::from("True")),
            Value::Bool(false) => Ok(String::from("False")),
            Value::Int(n) => Ok(n.to_string()),
            Value::Float(f) => Ok(format_float(f)),
            Value::Handler(_) => Ok(String::from("<handler>")),
            Value::Kwargs(_) => Ok(String::from("<kwargs>")),
            Value::Ref(id) => self.repr_heap_value(id),
        }
    }

    fn repr_heap_value(&mut self, id: HeapId) -> VmResult<String> {
        match self.heap.get(id) {
            HeapData::Str(_) => Ok(quote_string(self.heap.as_str(id))),
            HeapData::Bytes(b) => {
                let mut out = String::from("b'");
                for byte in &b.data {
                    match byte {
                        b'\\' => out.push_str("\\\\"),
                        b'\'' => out.push_str("\\'"),
                        b'\n' => out.push_str("\\n"),
                        b'\r' => out.push_str("\\r"),
                        b'\t' => out.push_str("\\t"),
                        0x20..=0x7e => out.push(char::from(*byte)),
                        _ => {
                            let _ = write!(out, "\\x{byte:02x}");
                        }
                    }
                }
                out.push('\'');
                Ok(out)
            }
            HeapData::Tuple(_) => {
                if !self.heap.enter_repr(id) {
                    return Ok(String::from("(...)"));
                }
                let items = self.heap.tuple(id).items.clone();
                let result = self.join_reprs(&items, "(", ")", items.len() == 1);
                self.heap.exit_repr(id);
                result
            }
            HeapData::List(_) => {
                if !self.heap.enter_repr(id) {
                    return Ok(String::from("[...]"));
                }
                let items = self.heap.list(id).items.clone();
                let result = self.join_reprs(&items, "[", "]", false);
                self.heap.exit_repr(id);
                result
            }
            HeapData::Set(_) => {
                if self.heap.set_obj(id).table.is_empty() {
                    return Ok(String::from("set()"));
                }
                if !self.heap.enter_repr(id) {
                    return Ok(String::from("{...}"));
                }
                let items: Vec<Value> = self.heap.set_obj(id).table.iter().map(|(k, _)| *k).collect();
                let result = self.join_reprs(&items, "{", "}", false);
                self.heap.exit_repr(id);
                result
            }
            HeapData::Dict(_) => {
                if !self.heap.enter_repr(id) {
                    return Ok(String::from("{...}"));
                }
                let entries: Vec<(Value, Value)> =
                    self.heap.dict(id).table.iter().map(|(k, v)| (*k, *v)).collect();
                let result = (|| {
                    let mut out = String::from("{");
                    for (i, (key, value)) in entries.iter().enumerate() {
                        if i > 0 {
                            out.push_str(", ");
                        }
                        out.push_str(&self.repr_value(*key)?);
                        out.push_str(": ");
                        out.push_str(&self.repr_value(*value)?);
                    }
                    out.push('}');
                    Ok(out)
                })();
                self.heap.exit_repr(id);
                result
            }
            HeapData::Range(r) => {
                let r = *r;
                if r.step == 1 {
                    Ok(format!("range({}, {})", r.start, r.stop))
                } else {
                    Ok(format!("range({}, {}, {})", r.start, r.stop, r.step))
                }
            }
            HeapData::Class(c) => {
                let name = self.heap.as_str(c.name).to_string();
                Ok(format!("<class '{name}'>"))
            }
            HeapData::Closure(c) => {
                let code = c.code;
                let qualname = self.heap.code(code).qualname.clone();
                Ok(format!("<function {qualname}>"))
            }
            HeapData::Native(n) => Ok(format!("<built-in function {}>", n.name)),
            HeapData::BoundMethod(b) => {
                let method = b.method;
                let method_repr = self.repr_value(method)?;
                Ok(format!("<bound method {method_repr}>"))
            }
            HeapData::Code(code) => Ok(format!("<code {}>", code.qualname)),
            HeapData::Generator(g) => {
                let closure = g.closure;
                let code = self.heap.closure(closure).code;
                let qualname = self.heap.code(code).qualname.clone();
                Ok(format!("<generator {qualname}>"))
            }
            HeapData::NativeIter(_) => Ok(String::from("<iterator>")),
            HeapData::Upvalue(_) => Ok(String::from("<cell>")),
            HeapData::Instance(instance) => {
                let class = instance.class;
                if let Some(method) = self.heap.class(class).dunders.get(Dunder::Repr) {
                    if !self.heap.enter_repr(id) {
                        return Ok(String::from("..."));
                    }
                    let result = self.call_dunder(method, Value::Ref(id), &[]);
                    self.heap.exit_repr(id);
                    let result = result?;
                    let Value::Ref(text_id) = result else {
                        return Err(self.error(ExcKind::TypeError, "__repr__ must return a string"));
                    };
                    if !matches!(self.heap.get(text_id), HeapData::Str(_)) {
                        return Err(self.error(ExcKind::TypeError, "__repr__ must return a string"));
                    }
                    return Ok(self.heap.as_str(text_id).to_string());
                }
                let name = self.heap.as_str(self.heap.class(class).name).to_string();
                Ok(format!("<{name} object at {:#x}>", id.index()))
            }
        }
    }

    fn join_reprs(&mut self, items: &[Value], open: &str, close: &str, trailing_comma: bool) -> VmResult<String> {
        let mut out = String::from(open);
        for (i, item) in items.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            out.push_str(&self.repr_value(*item)?);
        }
        if trailing_comma {
            out.push(',');
        }
        out.push_str(close);
        Ok(out)
    }

    /// Human-facing string conversion: `str` passes through, instances
    /// dispatch `__str__`, everything else falls back to `repr`.
    pub(crate) fn str_value(&mut self, value: Value) -> VmResult<String> {
        if let Value::Ref(id) = value {
            match self.heap.get(id) {
                HeapData::Str(_) => return Ok(self.heap.as_str(id).to_string()),
                HeapData::Instance(instance) => {
                    let class = instance.class;
                    if let Some(method) = self.heap.class(class).dunders.get(Dunder::Str) {
                        let result = self.call_dunder(method, value, &[])?;
                        let Value::Ref(text_id) = result else {
                            return Err(self.error(ExcKind::TypeError, "__str__ must return a string"));
                        };
                        if !matches!(self.heap.get(text_id), HeapData::Str(_)) {
                            return Err(self.error(ExcKind::TypeError, "__str__ must return a string"));
                        }
                        return Ok(self.heap.as_str(text_id).to_string());
                    }
                }
                _ => {}
            }
        }
        self.repr_value(value)
    }
}

/// Python-style float rendering: shortest round-trip via ryu, with a
/// guaranteed decimal point and `e+`/`e-` exponent spelling.
pub(crate) fn format_float(f: f64) -> String {
    if f.is_nan() {
        return String::from("nan");
    }
    if f.is_infinite() {
        return String::from(if f > 0.0 { "inf" } else { "-inf" });
    }
    let mut buffer = ryu::Buffer::new();
    let text = buffer.format(f);
    if let Some(pos) = text.find(['e', 'E']) {
        let (mantissa, exponent) = text.split_at(pos);
        let exponent = &exponent[1..];
        if exponent.starts_with('-') {
            format!("{mantissa}e{exponent}")
        } else {
            format!("{mantissa}e+{exponent}")
        }
    } else {
        text.to_string()
    }
}

/// Python-style single-quoted string repr.
fn quote_string(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('\'');
    for ch in text.chars() {
        match ch {
            '\'' => out.push_str("\\'"),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                let _ = write!(out, "\\x{:02x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_float() {
        assert_eq!(format_float(1.0), "1.0");
        assert_eq!(format_float(2.5), "2.5");
        assert_eq!(format_float(-0.125), "-0.125");
        assert_eq!(format_float(f64::NAN), "nan");
        assert_eq!(format_float(f64::INFINITY), "inf");
        assert_eq!(format_float(1e30), "1e+30");
    }

    #[test]
    fn test_quote_string() {
        assert_eq!(quote_string("abc"), "'abc'");
        assert_eq!(quote_string("a'b"), "'a\\'b'");
        assert_eq!(quote_string("a\nb"), "'a\\nb'");
    }
}
