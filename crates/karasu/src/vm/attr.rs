//! Attribute access and class machinery.
//!
//! `GET_PROPERTY` resolution order for an instance: own fields, then the
//! class chain (functions wrap into bound methods, descriptors dispatch
//! through `__get__`), then the class's `__getattr__`, then
//! `AttributeError`. Every other value resolves through its builtin
//! class's attribute table, so `"a".upper` binds exactly like a method on
//! a user object.

use crate::{
    exceptions::{ExcKind, VmResult},
    heap::{BoundMethodObject, ClassObject, Dunder, DunderCache, HeapData, HeapId},
    value::Value,
    vm::Vm,
};

impl Vm {
    /// The class object governing a value's behavior.
    #[must_use]
    pub(crate) fn class_of(&self, value: Value) -> HeapId {
        let registry = &self.registry;
        match value {
            Value::None => registry.none_class,
            Value::Bool(_) => registry.bool_class,
            Value::Int(_) => registry.int_class,
            Value::Float(_) => registry.float_class,
            Value::Handler(_) | Value::Kwargs(_) => registry.object_class,
            Value::Ref(id) => match self.heap.get(id) {
                HeapData::Str(_) => registry.str_class,
                HeapData::Bytes(_) => registry.bytes_class,
                HeapData::Tuple(_) => registry.tuple_class,
                HeapData::List(_) => registry.list_class,
                HeapData::Dict(_) => registry.dict_class,
                HeapData::Set(_) => registry.set_class,
                HeapData::Range(_) => registry.range_class,
                HeapData::Closure(_) | HeapData::Code(_) => registry.function_class,
                HeapData::Native(_) => registry.function_class,
                HeapData::BoundMethod(_) => registry.method_class,
                HeapData::Class(_) => registry.type_class,
                HeapData::Generator(_) => registry.generator_class,
                HeapData::NativeIter(_) | HeapData::Upvalue(_) => registry.object_class,
                HeapData::Instance(instance) => instance.class,
            },
        }
    }

    /// Whether `value` is an instance of `class_id` (or a subclass).
    #[must_use]
    pub(crate) fn isinstance(&self, value: Value, class_id: HeapId) -> bool {
        self.is_subclass(self.class_of(value), class_id)
    }

    /// Walks the single-inheritance chain.
    #[must_use]
    pub(crate) fn is_subclass(&self, mut class: HeapId, target: HeapId) -> bool {
        loop {
            if class == target {
                return true;
            }
            match self.heap.class(class).base {
                Some(base) => class = base,
                None => return false,
            }
        }
    }

    /// Looks `name` up through a class and its bases.
    #[must_use]
    pub(crate) fn lookup_class_attr(&self, mut class: HeapId, name_id: HeapId) -> Option<Value> {
        let name = Value::Ref(name_id);
        let hash = self.heap.cached_hash(name_id);
        loop {
            if let Some(value) = self.heap.class(class).table.get_exact(&name, hash) {
                return Some(value);
            }
            match self.heap.class(class).base {
                Some(base) => class = base,
                None => return None,
            }
        }
    }

    /// `GET_PROPERTY name`: replaces the top of stack with the attribute.
    pub(crate) fn get_property(&mut self, name: Value) -> VmResult<()> {
        let receiver = self.peek(0);
        let value = self.get_attribute_value(receiver, name)?;
        self.set_top(value);
        Ok(())
    }

    /// Full attribute resolution for any value.
    pub(crate) fn get_attribute_value(&mut self, receiver: Value, name: Value) -> VmResult<Value> {
        let Value::Ref(name_id) = name else {
            panic!("attribute name is not a string");
        };
        let hash = self.heap.cached_hash(name_id);

        // Universal attributes.
        if name_id == self.registry.name_class_attr {
            return Ok(Value::Ref(self.class_of(receiver)));
        }

        if let Value::Ref(id) = receiver {
            match self.heap.get(id) {
                HeapData::Instance(instance) => {
                    if let Some(value) = instance.fields.get_exact(&name, hash) {
                        return Ok(value);
                    }
                    let class = instance.class;
                    if let Some(found) = self.lookup_class_attr(class, name_id) {
                        return self.bind_class_attribute(receiver, found);
                    }
                    if let Some(getattr) = self.heap.class(class).dunders.get(Dunder::Getattr) {
                        return self.call_dunder(getattr, receiver, &[name]);
                    }
                    return Err(self.attribute_error(receiver, name_id));
                }
                HeapData::Class(_) => {
                    if name_id == self.registry.name_name_attr {
                        let class_name = self.heap.class(id).name;
                        return Ok(Value::Ref(class_name));
                    }
                    if let Some(found) = self.lookup_class_attr(id, name_id) {
                        // Unbound: class attribute access does not bind.
                        return Ok(found);
                    }
                    return Err(self.attribute_error(receiver, name_id));
                }
                HeapData::Closure(closure) => {
                    if let Some(attrs) = &closure.attrs
                        && let Some(value) = attrs.get_exact(&name, hash)
                    {
                        return Ok(value);
                    }
                    if name_id == self.registry.name_name_attr {
                        let code = closure.code;
                        let code_name = self.heap.code(code).name;
                        return Ok(Value::Ref(code_name));
                    }
                    if name_id == self.registry.name_doc_attr {
                        let code = closure.code;
                        return Ok(self.heap.code(code).docstring.unwrap_or(Value::None));
                    }
                    return Err(self.attribute_error(receiver, name_id));
                }
                _ => {}
            }
        }

        // Everything else: the builtin class's table, bound on access.
        let class = self.class_of(receiver);
        if let Some(found) = self.lookup_class_attr(class, name_id) {
            return self.bind_class_attribute(receiver, found);
        }
        Err(self.attribute_error(receiver, name_id))
    }

    /// Wraps functions into bound methods and dispatches descriptors.
    fn bind_class_attribute(&mut self, receiver: Value, found: Value) -> VmResult<Value> {
        if let Value::Ref(found_id) = found {
            match self.heap.get(found_id) {
                HeapData::Closure(_) | HeapData::Native(_) => {
                    let bound = self.heap.allocate(HeapData::BoundMethod(BoundMethodObject {
                        receiver,
                        method: found,
                    }));
                    return Ok(Value::Ref(bound));
                }
                HeapData::Instance(instance) => {
                    // Descriptor protocol: a class attribute whose class
                    // defines __get__ computes the attribute value.
                    let desc_class = instance.class;
                    if let Some(get) = self.heap.class(desc_class).dunders.get(Dunder::Get) {
                        return self.call_dunder(get, found, &[receiver]);
                    }
                }
                _ => {}
            }
        }
        Ok(found)
    }

    /// `SET_PROPERTY name`: stack `[obj, value]` becomes `[value]`.
    pub(crate) fn set_property(&mut self, name: Value) -> VmResult<()> {
        let Value::Ref(name_id) = name else {
            panic!("attribute name is not a string");
        };
        let hash = self.heap.cached_hash(name_id);
        let value = self.pop();
        let receiver = self.pop();
        match receiver {
            Value::Ref(id) => match self.heap.get(id) {
                HeapData::Instance(instance) => {
                    // A data descriptor on the class intercepts the store.
                    let class = instance.class;
                    let descriptor = self.lookup_class_attr(class, name_id).and_then(|found| {
                        if let Value::Ref(found_id) = found
                            && let HeapData::Instance(desc) = self.heap.get(found_id)
                        {
                            let desc_class = desc.class;
                            self.heap
                                .class(desc_class)
                                .dunders
                                .get(Dunder::Set)
                                .map(|set| (set, found))
                        } else {
                            None
                        }
                    });
                    if let Some((set, found)) = descriptor {
                        self.call_dunder(set, found, &[receiver, value])?;
                    } else {
                        self.heap.instance_mut(id).fields.set_exact(name, hash, value);
                    }
                }
                HeapData::Class(_) => {
                    self.install_class_attribute(id, name_id, hash, value);
                }
                HeapData::Closure(_) => {
                    let closure = self.heap.closure_mut(id);
                    closure
                        .attrs
                        .get_or_insert_with(|| Box::new(crate::table::Table::new()))
                        .set_exact(name, hash, value);
                }
                _ => {
                    return Err(self.attribute_set_error(receiver, name_id));
                }
            },
            _ => {
                return Err(self.attribute_set_error(receiver, name_id));
            }
        }
        self.push(value);
        Ok(())
    }

    /// `DEL_PROPERTY name`: pops the object; no result is pushed.
    pub(crate) fn delete_property(&mut self, name: Value) -> VmResult<()> {
        let Value::Ref(name_id) = name else {
            panic!("attribute name is not a string");
        };
        let hash = self.heap.cached_hash(name_id);
        let receiver = self.pop();
        if let Value::Ref(id) = receiver
            && matches!(self.heap.get(id), HeapData::Instance(_))
        {
            if self.heap.instance_mut(id).fields.delete_exact(&name, hash).is_some() {
                return Ok(());
            }
        }
        Err(self.attribute_error(receiver, name_id))
    }

    /// `GET_SUPER name`: stack `[receiver, superclass]` becomes the bound
    /// base-class method.
    pub(crate) fn get_super(&mut self, name: Value) -> VmResult<()> {
        let Value::Ref(name_id) = name else {
            panic!("attribute name is not a string");
        };
        let superclass = self.pop();
        let receiver = self.pop();
        let Value::Ref(class_id) = superclass else {
            return Err(self.error(ExcKind::TypeError, "base class is not a class"));
        };
        if !matches!(self.heap.get(class_id), HeapData::Class(_)) {
            return Err(self.error(ExcKind::TypeError, "base class is not a class"));
        }
        let Some(found) = self.lookup_class_attr(class_id, name_id) else {
            return Err(self.attribute_error(receiver, name_id));
        };
        let value = self.bind_class_attribute(receiver, found)?;
        self.push(value);
        Ok(())
    }

    // ==================================================================
    // Class construction opcodes
    // ==================================================================

    /// `CLASS name`: a fresh user class deriving `object`.
    pub(crate) fn new_user_class(&mut self, name_id: HeapId) -> HeapId {
        let object_class = self.registry.object_class;
        let mut class = ClassObject::new(name_id, Some(object_class));
        class.dunders.inherit_from(&self.heap.class(object_class).dunders);
        self.heap.allocate(HeapData::Class(class))
    }

    /// `INHERIT`: stack `[base, class]`; copies the base's method table
    /// into the class, then pops the class.
    pub(crate) fn inherit(&mut self) -> VmResult<()> {
        let class_value = self.pop();
        let base_value = self.peek(0);
        let Value::Ref(class_id) = class_value else {
            return Err(self.error(ExcKind::TypeError, "INHERIT on a non-class"));
        };
        let Value::Ref(base_id) = base_value else {
            let kind = base_value.type_name(&self.heap);
            return Err(self.error(ExcKind::TypeError, &format!("cannot inherit from '{kind}'")));
        };
        if !matches!(self.heap.get(base_id), HeapData::Class(_)) {
            let kind = base_value.type_name(&self.heap);
            return Err(self.error(ExcKind::TypeError, &format!("cannot inherit from '{kind}'")));
        }
        // Method-table copy: entries present on the base when the subclass
        // is defined are shared; later base mutations do not retroactively
        // appear (the chain walk in lookup covers the rest).
        let entries: Vec<(Value, u32, Value)> = self
            .heap
            .class(base_id)
            .table
            .iter_rows()
            .map(|row| (row.key, row.hash, row.value))
            .collect();
        let base_dunders = {
            let mut cache = DunderCache::default();
            cache.inherit_from(&self.heap.class(base_id).dunders);
            cache
        };
        let class = self.heap.class_mut(class_id);
        class.base = Some(base_id);
        class.dunders = base_dunders;
        for (key, hash, value) in entries {
            class.table.set_exact(key, hash, value);
        }
        Ok(())
    }

    /// `METHOD name`: stack `[class, value]`; installs the attribute and
    /// pops the value.
    pub(crate) fn install_method(&mut self, name: Value) -> VmResult<()> {
        let Value::Ref(name_id) = name else {
            panic!("method name is not a string");
        };
        let value = self.pop();
        let class_value = self.peek(0);
        let Value::Ref(class_id) = class_value else {
            return Err(self.error(ExcKind::TypeError, "METHOD outside of a class body"));
        };
        if !matches!(self.heap.get(class_id), HeapData::Class(_)) {
            return Err(self.error(ExcKind::TypeError, "METHOD outside of a class body"));
        }
        let hash = self.heap.cached_hash(name_id);
        self.install_class_attribute(class_id, name_id, hash, value);
        Ok(())
    }

    /// Installs a class attribute, refreshing the dunder cache when the
    /// name is one of the cached protocol methods.
    pub(crate) fn install_class_attribute(&mut self, class_id: HeapId, name_id: HeapId, hash: u32, value: Value) {
        let dunder = self.registry.dunder_for_name(name_id);
        let class = self.heap.class_mut(class_id);
        class.table.set_exact(Value::Ref(name_id), hash, value);
        if let Some(dunder) = dunder {
            class.dunders.set(dunder, value);
        }
    }

    // ==================================================================
    // Errors
    // ==================================================================

    /// The receiver's user-facing type name (class name for instances).
    fn receiver_type_name(&self, receiver: Value) -> String {
        if let Value::Ref(id) = receiver
            && let HeapData::Instance(instance) = self.heap.get(id)
        {
            let class = instance.class;
            return self.heap.as_str(self.heap.class(class).name).to_string();
        }
        receiver.type_name(&self.heap).to_string()
    }

    fn attribute_error(&mut self, receiver: Value, name_id: HeapId) -> crate::exceptions::VmError {
        let kind = self.receiver_type_name(receiver);
        let name = self.heap.as_str(name_id).to_string();
        self.error(
            ExcKind::AttributeError,
            &format!("'{kind}' object has no attribute '{name}'"),
        )
    }

    fn attribute_set_error(&mut self, receiver: Value, name_id: HeapId) -> crate::exceptions::VmError {
        let kind = receiver.type_name(&self.heap);
        let name = self.heap.as_str(name_id).to_string();
        self.error(
            ExcKind::AttributeError,
            &format!("cannot set attribute '{name}' on '{kind}' object"),
        )
    }
}
