//! The embedding surface: stack manipulation, attribute attachment,
//! native registration, and format-driven argument parsing.
//!
//! A host exposes functionality by attaching values and natives to a
//! module (or class), then running source with [`Vm::interpret`]. Native
//! implementations decode their arguments with [`Vm::parse_args`]:
//!
//! ```text
//! spec characters:
//!   i   integer            f   float (accepts int)
//!   s   str object         O   any heap object
//!   V   any value          !   previous slot must satisfy a class check
//!   |   optional from here $   keyword-only from here
//!   *   collect remaining positionals into the slot as a tuple
//!   ~   tolerate unknown keyword arguments
//! ```

use smallvec::SmallVec;

use crate::{
    exceptions::{ExcKind, VmError, VmResult},
    heap::{HeapData, HeapId, NativeObject},
    value::Value,
    vm::{Arguments, NativeFn, Vm},
};

/// Parsed argument slots, aligned with the `names` list.
pub type ParsedArgs = SmallVec<[Option<Value>; 8]>;

impl Vm {
    // ==================================================================
    // Stack
    // ==================================================================

    /// Pushes a value onto the current thread's stack.
    pub fn stack_push(&mut self, value: Value) {
        self.push(value);
    }

    /// Pops the top of the current thread's stack.
    pub fn stack_pop(&mut self) -> Value {
        self.pop()
    }

    /// Reads `distance` slots below the top without popping.
    #[must_use]
    pub fn stack_peek(&self, distance: usize) -> Value {
        self.peek(distance)
    }

    /// Swaps the top of stack with the value `distance` slots below it.
    pub fn stack_swap(&mut self, distance: usize) {
        let len = self.thread.stack.len();
        self.thread.stack.swap(len - 1, len - 1 - distance);
    }

    // ==================================================================
    // Values
    // ==================================================================

    /// Interns a string and returns it as a value.
    pub fn string_value(&mut self, text: &str) -> Value {
        Value::Ref(self.heap.intern(text))
    }

    /// Allocates a bytes object.
    pub fn bytes_value(&mut self, data: Vec<u8>) -> Value {
        Value::Ref(self.heap.allocate_bytes(data))
    }

    /// Allocates a list.
    pub fn list_value(&mut self, items: Vec<Value>) -> Value {
        Value::Ref(self.heap.allocate_list(items))
    }

    /// Allocates a tuple.
    pub fn tuple_value(&mut self, items: Vec<Value>) -> Value {
        Value::Ref(self.heap.allocate_tuple(items))
    }

    /// Reads a string value's text, when it is one.
    #[must_use]
    pub fn value_as_str(&self, value: Value) -> Option<&str> {
        match value {
            Value::Ref(id) if matches!(self.heap.get(id), HeapData::Str(_)) => Some(self.heap.as_str(id)),
            _ => None,
        }
    }

    /// Renders a value the way `repr()` would.
    pub fn value_repr(&mut self, value: Value) -> VmResult<String> {
        self.repr_value(value)
    }

    /// Renders a value the way `str()` would.
    pub fn value_str(&mut self, value: Value) -> VmResult<String> {
        self.str_value(value)
    }

    /// The module instance registered as `__main__`, creating it if
    /// needed. Attach host values here to expose them to scripts.
    pub fn main_module(&mut self) -> Value {
        Value::Ref(self.ensure_module("__main__"))
    }

    // ==================================================================
    // Attachment
    // ==================================================================

    /// Installs an attribute on a module instance, class, or instance.
    pub fn attach_named_value(&mut self, target: Value, name: &str, value: Value) -> VmResult<()> {
        let name_id = self.heap.intern(name);
        let hash = self.heap.cached_hash(name_id);
        let Value::Ref(id) = target else {
            let kind = target.type_name(&self.heap);
            return Err(self.error(
                ExcKind::TypeError,
                &format!("cannot attach attributes to '{kind}'"),
            ));
        };
        match self.heap.get(id) {
            HeapData::Instance(_) => {
                self.heap
                    .instance_mut(id)
                    .fields
                    .set_exact(Value::Ref(name_id), hash, value);
                Ok(())
            }
            HeapData::Class(_) => {
                self.install_class_attribute(id, name_id, hash, value);
                Ok(())
            }
            _ => {
                let kind = target.type_name(&self.heap);
                Err(self.error(
                    ExcKind::TypeError,
                    &format!("cannot attach attributes to '{kind}'"),
                ))
            }
        }
    }

    /// Reads an attribute through the full resolution machinery.
    pub fn get_attribute(&mut self, target: Value, name: &str) -> VmResult<Value> {
        let name_id = self.heap.intern(name);
        self.get_attribute_value(target, Value::Ref(name_id))
    }

    /// Exposes a host function as `name` on the target.
    pub fn define_native(&mut self, target: Value, name: &str, func: NativeFn) -> VmResult<()> {
        let native = self.heap.allocate(HeapData::Native(NativeObject {
            func,
            name: name.into(),
            docstring: None,
        }));
        self.attach_named_value(target, name, Value::Ref(native))
    }

    /// Constructs an exception for a native to raise.
    ///
    /// Conventionally used as `return Err(vm.runtime_error(...))`.
    pub fn runtime_error(&mut self, kind: ExcKind, message: &str) -> VmError {
        self.error(kind, message)
    }

    // ==================================================================
    // Argument parsing
    // ==================================================================

    /// Decodes a native's arguments by format string.
    ///
    /// Returns one slot per name; optional parameters that were not
    /// supplied stay `None`. `classes` supplies the expectation for each
    /// `!` in the spec, in order.
    pub fn parse_args(
        &mut self,
        func_name: &str,
        spec: &str,
        names: &[&str],
        classes: &[HeapId],
        args: &Arguments,
    ) -> VmResult<ParsedArgs> {
        let mut slots: ParsedArgs = SmallVec::new();
        slots.resize(names.len(), None);

        let mut optional = false;
        let mut keyword_only = false;
        let mut tolerate_extras = false;
        let mut slot = 0usize;
        let mut class_cursor = 0usize;
        let mut positional_cursor = 0usize;

        #[derive(Clone, Copy)]
        struct SlotSpec {
            kind: char,
            class_check: Option<usize>,
            keyword_only: bool,
            required: bool,
            collects_rest: bool,
        }
        let mut slot_specs: SmallVec<[SlotSpec; 8]> = SmallVec::new();

        let mut chars = spec.chars().peekable();
        while let Some(ch) = chars.next() {
            match ch {
                '|' => optional = true,
                '$' => {
                    keyword_only = true;
                    optional = true;
                }
                '~' => tolerate_extras = true,
                '*' => {
                    if slot >= names.len() {
                        return Err(self.error(ExcKind::SystemError, "parse_args spec exceeds name list"));
                    }
                    slot_specs.push(SlotSpec {
                        kind: '*',
                        class_check: None,
                        keyword_only: false,
                        required: false,
                        collects_rest: true,
                    });
                    slot += 1;
                    keyword_only = true;
                }
                'i' | 'f' | 's' | 'O' | 'V' => {
                    if slot >= names.len() {
                        return Err(self.error(ExcKind::SystemError, "parse_args spec exceeds name list"));
                    }
                    let class_check = if chars.peek() == Some(&'!') {
                        chars.next();
                        let index = class_cursor;
                        class_cursor += 1;
                        Some(index)
                    } else {
                        None
                    };
                    slot_specs.push(SlotSpec {
                        kind: ch,
                        class_check,
                        keyword_only,
                        required: !optional,
                        collects_rest: false,
                    });
                    slot += 1;
                }
                other => {
                    return Err(self.error(
                        ExcKind::SystemError,
                        &format!("parse_args: unknown spec character '{other}'"),
                    ));
                }
            }
        }

        // Fill from positionals.
        for (index, spec) in slot_specs.iter().enumerate() {
            if spec.keyword_only {
                continue;
            }
            if spec.collects_rest {
                let rest: Vec<Value> = args.values[positional_cursor.min(args.values.len())..].to_vec();
                positional_cursor = args.values.len();
                let tuple = self.heap.allocate_tuple(rest);
                slots[index] = Some(Value::Ref(tuple));
                continue;
            }
            if positional_cursor < args.values.len() {
                slots[index] = Some(args.values[positional_cursor]);
                positional_cursor += 1;
            }
        }
        if positional_cursor < args.values.len() {
            return Err(self.error(
                ExcKind::ArgumentError,
                &format!(
                    "{func_name}() takes at most {} positional arguments ({} given)",
                    slot_specs.iter().filter(|s| !s.keyword_only && !s.collects_rest).count(),
                    args.values.len()
                ),
            ));
        }

        // Fill from keywords by name.
        if let Some(kwargs) = args.kwargs {
            let entries: Vec<(Value, Value)> = self.heap.dict(kwargs).table.iter().map(|(k, v)| (*k, *v)).collect();
            for (key, value) in entries {
                let Value::Ref(key_id) = key else {
                    return Err(self.error(ExcKind::TypeError, "keywords must be strings"));
                };
                let key_text = self.heap.as_str(key_id).to_string();
                match names.iter().position(|n| *n == key_text) {
                    Some(index) if index < slot_specs.len() => {
                        if slots[index].is_some() && !slot_specs[index].collects_rest {
                            return Err(self.error(
                                ExcKind::ArgumentError,
                                &format!("{func_name}() got multiple values for argument '{key_text}'"),
                            ));
                        }
                        slots[index] = Some(value);
                    }
                    _ if tolerate_extras => {}
                    _ => {
                        return Err(self.error(
                            ExcKind::ArgumentError,
                            &format!("{func_name}() got an unexpected keyword argument '{key_text}'"),
                        ));
                    }
                }
            }
        }

        // Validate presence and types.
        for (index, spec) in slot_specs.iter().enumerate() {
            let Some(value) = slots[index] else {
                if spec.required {
                    return Err(self.error(
                        ExcKind::ArgumentError,
                        &format!("{func_name}() missing required argument '{}'", names[index]),
                    ));
                }
                continue;
            };
            match spec.kind {
                'i' => {
                    if value.as_int().is_none() {
                        return self.parse_type_error(func_name, names[index], "an integer", value);
                    }
                }
                'f' => {
                    if value.as_number().is_none() {
                        return self.parse_type_error(func_name, names[index], "a number", value);
                    }
                }
                's' => {
                    let ok = matches!(value, Value::Ref(id) if matches!(self.heap.get(id), HeapData::Str(_)));
                    if !ok {
                        return self.parse_type_error(func_name, names[index], "a string", value);
                    }
                }
                'O' => {
                    if !matches!(value, Value::Ref(_)) {
                        return self.parse_type_error(func_name, names[index], "an object", value);
                    }
                }
                _ => {}
            }
            if let Some(class_index) = spec.class_check {
                let Some(class) = classes.get(class_index).copied() else {
                    return Err(self.error(ExcKind::SystemError, "parse_args: missing class for '!' check"));
                };
                if !self.isinstance(value, class) {
                    let expected = self.heap.as_str(self.heap.class(class).name).to_string();
                    return self.parse_type_error(func_name, names[index], &expected, value);
                }
            }
        }

        Ok(slots)
    }

    fn parse_type_error(
        &mut self,
        func_name: &str,
        arg_name: &str,
        expected: &str,
        value: Value,
    ) -> VmResult<ParsedArgs> {
        let got = value.type_name(&self.heap);
        Err(self.error(
            ExcKind::TypeError,
            &format!("{func_name}() argument '{arg_name}' must be {expected}, not '{got}'"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::{Arguments, VmFlags};

    fn vm() -> Vm {
        Vm::with_output(VmFlags::default(), Box::new(crate::io::NoPrint))
    }

    #[test]
    fn test_parse_args_positional() {
        let mut vm = vm();
        let text = vm.string_value("hi");
        let args = Arguments::positional(&[Value::Int(3), text]);
        let slots = vm.parse_args("f", "is", &["count", "label"], &[], &args).unwrap();
        assert!(matches!(slots[0], Some(Value::Int(3))));
        assert!(slots[1].is_some());
    }

    #[test]
    fn test_parse_args_optional() {
        let mut vm = vm();
        let args = Arguments::positional(&[Value::Int(1)]);
        let slots = vm.parse_args("f", "i|i", &["a", "b"], &[], &args).unwrap();
        assert!(matches!(slots[0], Some(Value::Int(1))));
        assert!(slots[1].is_none());
    }

    #[test]
    fn test_parse_args_missing_required() {
        let mut vm = vm();
        let args = Arguments::positional(&[]);
        let err = vm.parse_args("f", "i", &["a"], &[], &args).unwrap_err();
        let message = vm.exception_line(err.value());
        assert!(message.contains("missing required argument"), "{message}");
    }

    #[test]
    fn test_parse_args_type_mismatch() {
        let mut vm = vm();
        let args = Arguments::positional(&[Value::Float(1.5)]);
        let err = vm.parse_args("f", "i", &["a"], &[], &args).unwrap_err();
        let message = vm.exception_line(err.value());
        assert!(message.contains("must be an integer"), "{message}");
    }

    #[test]
    fn test_parse_args_var_positional() {
        let mut vm = vm();
        let args = Arguments::positional(&[Value::Int(1), Value::Int(2), Value::Int(3)]);
        let slots = vm.parse_args("f", "i*", &["first", "rest"], &[], &args).unwrap();
        assert!(matches!(slots[0], Some(Value::Int(1))));
        let Some(Value::Ref(rest)) = slots[1] else {
            panic!("rest tuple missing");
        };
        assert_eq!(vm.heap.tuple(rest).items.len(), 2);
    }

    #[test]
    fn test_parse_args_class_check() {
        let mut vm = vm();
        let list = vm.list_value(vec![Value::Int(1)]);
        let list_class = vm.registry.list_class;
        let args = Arguments::positional(&[list]);
        assert!(vm.parse_args("f", "O!", &["items"], &[list_class], &args).is_ok());
        let args = Arguments::positional(&[Value::Int(3)]);
        assert!(vm.parse_args("f", "O!", &["items"], &[list_class], &args).is_err());
    }

    #[test]
    fn test_attach_and_read_back() {
        let mut vm = vm();
        let module = vm.main_module();
        vm.attach_named_value(module, "answer", Value::Int(42)).unwrap();
        let result = vm.interpret("answer + 0\nlet out = answer\n", "<test>");
        assert!(result.is_ok());
    }
}
