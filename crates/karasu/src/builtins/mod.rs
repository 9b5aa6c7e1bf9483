//! Built-in classes, functions, and the boot-time registry.
//!
//! [`bootstrap`] runs once per interpreter: it interns the protocol names,
//! builds the builtin class objects (marked immortal) with their native
//! method tables, grows the exception tree, and assembles the `builtins`
//! module whose fields back every global-name fallback.

pub(crate) mod bytes_type;
pub(crate) mod dict_type;
pub(crate) mod functions;
pub(crate) mod list_type;
pub(crate) mod number_type;
pub(crate) mod range_type;
pub(crate) mod set_type;
pub(crate) mod str_type;
pub(crate) mod tuple_type;

use strum::IntoEnumIterator;

use crate::{
    exceptions::ExcKind,
    heap::{ClassObject, Dunder, FLAG_IMMORTAL, Heap, HeapData, HeapId, InstanceObject, NativeObject},
    table::Table,
    value::Value,
    vm::NativeFn,
};

/// Boot-time handles the VM needs for the rest of its life.
#[derive(Debug)]
pub(crate) struct Registry {
    pub object_class: HeapId,
    pub type_class: HeapId,
    pub none_class: HeapId,
    pub bool_class: HeapId,
    pub int_class: HeapId,
    pub float_class: HeapId,
    pub str_class: HeapId,
    pub bytes_class: HeapId,
    pub tuple_class: HeapId,
    pub list_class: HeapId,
    pub dict_class: HeapId,
    pub set_class: HeapId,
    pub range_class: HeapId,
    pub function_class: HeapId,
    pub method_class: HeapId,
    pub generator_class: HeapId,
    pub module_class: HeapId,
    /// Exception classes indexed by `ExcKind` discriminant.
    exceptions: Vec<HeapId>,
    /// Module instance backing global-name fallback.
    pub builtins_module: HeapId,
    /// Interned dunder names paired with their cache slots.
    special_names: Vec<(HeapId, Dunder)>,
    pub name_arg: HeapId,
    pub name_traceback: HeapId,
    pub name_cause: HeapId,
    pub name_class_attr: HeapId,
    pub name_name_attr: HeapId,
    pub name_doc_attr: HeapId,
    pub name_exports: HeapId,
    pub name_module_name: HeapId,
}

impl Registry {
    #[must_use]
    pub fn exception_class(&self, kind: ExcKind) -> HeapId {
        self.exceptions[kind as usize]
    }

    /// Maps an interned name to its dunder cache slot, if it has one.
    #[must_use]
    pub fn dunder_for_name(&self, name: HeapId) -> Option<Dunder> {
        self.special_names
            .iter()
            .find(|(id, _)| *id == name)
            .map(|(_, dunder)| *dunder)
    }

    /// Adds every registry handle to a GC root set.
    pub fn collect_roots(&self, roots: &mut Vec<HeapId>) {
        roots.extend([
            self.object_class,
            self.type_class,
            self.none_class,
            self.bool_class,
            self.int_class,
            self.float_class,
            self.str_class,
            self.bytes_class,
            self.tuple_class,
            self.list_class,
            self.dict_class,
            self.set_class,
            self.range_class,
            self.function_class,
            self.method_class,
            self.generator_class,
            self.module_class,
            self.builtins_module,
            self.name_arg,
            self.name_traceback,
            self.name_cause,
            self.name_class_attr,
            self.name_name_attr,
            self.name_doc_attr,
            self.name_exports,
            self.name_module_name,
        ]);
        roots.extend(self.exceptions.iter().copied());
        roots.extend(self.special_names.iter().map(|(id, _)| *id));
    }
}

/// Creates an immortal class object.
fn new_class(heap: &mut Heap, name: &str, base: Option<HeapId>) -> HeapId {
    let name_id = heap.intern(name);
    heap.set_flag(name_id, FLAG_IMMORTAL);
    let mut class = ClassObject::new(name_id, base);
    if let Some(base) = base {
        class.dunders.inherit_from(&heap.class(base).dunders);
    }
    let id = heap.allocate(HeapData::Class(class));
    heap.set_flag(id, FLAG_IMMORTAL);
    id
}

/// Creates an immortal native function object.
fn new_native(heap: &mut Heap, name: &str, func: NativeFn, docstring: Option<&'static str>) -> HeapId {
    let id = heap.allocate(HeapData::Native(NativeObject {
        func,
        name: name.into(),
        docstring,
    }));
    heap.set_flag(id, FLAG_IMMORTAL);
    id
}

/// Installs a native method on a class, refreshing the dunder cache for
/// protocol names.
pub(crate) fn define_method(heap: &mut Heap, class: HeapId, name: &str, func: NativeFn) {
    let native = new_native(heap, name, func, None);
    let name_id = heap.intern(name);
    heap.set_flag(name_id, FLAG_IMMORTAL);
    let hash = heap.cached_hash(name_id);
    let dunder = Dunder::iter().find(|d| d.name() == name);
    let class_obj = heap.class_mut(class);
    class_obj.table.set_exact(Value::Ref(name_id), hash, Value::Ref(native));
    if let Some(dunder) = dunder {
        class_obj.dunders.set(dunder, Value::Ref(native));
    }
}

/// Installs a value into a module instance's fields.
fn attach(heap: &mut Heap, module: HeapId, name: &str, value: Value) {
    let name_id = heap.intern(name);
    heap.set_flag(name_id, FLAG_IMMORTAL);
    let hash = heap.cached_hash(name_id);
    heap.instance_mut(module).fields.set_exact(Value::Ref(name_id), hash, value);
}

/// Normalizes a (possibly negative) index into `0..len`.
pub(crate) fn normalize_index(
    vm: &mut crate::vm::Vm,
    index: Value,
    len: usize,
    kind: &str,
) -> crate::exceptions::VmResult<usize> {
    let Some(mut n) = index.as_int() else {
        let got = index.type_name(&vm.heap);
        return Err(vm.error(
            ExcKind::TypeError,
            &format!("{kind} indices must be integers, not '{got}'"),
        ));
    };
    if n < 0 {
        n += len as i64;
    }
    if n < 0 || n >= len as i64 {
        return Err(vm.error(ExcKind::IndexError, &format!("{kind} index out of range")));
    }
    Ok(n as usize)
}

/// Resolves slice bounds into the element indices they select.
///
/// `None` bounds take the Python defaults for the step direction; out of
/// range bounds clamp rather than raise.
pub(crate) fn slice_indices(
    vm: &mut crate::vm::Vm,
    start: Value,
    end: Value,
    step: Value,
    len: usize,
) -> crate::exceptions::VmResult<Vec<usize>> {
    let step = match step {
        Value::None => 1,
        other => other
            .as_int()
            .ok_or_else(|| vm.error(ExcKind::TypeError, "slice step must be an integer"))?,
    };
    if step == 0 {
        return Err(vm.error(ExcKind::ValueError, "slice step cannot be zero"));
    }
    let len = len as i64;
    let start = match start {
        Value::None => {
            if step > 0 {
                0
            } else {
                len - 1
            }
        }
        other => {
            let Some(mut n) = other.as_int() else {
                return Err(vm.error(ExcKind::TypeError, "slice indices must be integers"));
            };
            if n < 0 {
                n += len;
            }
            n
        }
    };
    let end = match end {
        Value::None => {
            if step > 0 {
                len
            } else {
                -1
            }
        }
        other => {
            let Some(mut n) = other.as_int() else {
                return Err(vm.error(ExcKind::TypeError, "slice indices must be integers"));
            };
            if n < 0 {
                n += len;
            }
            n
        }
    };
    let mut indices = Vec::new();
    if step > 0 {
        let mut i = start.max(0);
        let end = end.min(len);
        while i < end {
            indices.push(i as usize);
            i += step;
        }
    } else {
        let mut i = start.min(len - 1);
        let end = end.max(-1);
        while i > end {
            indices.push(i as usize);
            i += step;
        }
    }
    Ok(indices)
}

/// Builds the entire builtin world.
pub(crate) fn bootstrap(heap: &mut Heap) -> Registry {
    let intern_immortal = |heap: &mut Heap, text: &str| {
        let id = heap.intern(text);
        heap.set_flag(id, FLAG_IMMORTAL);
        id
    };

    let special_names: Vec<(HeapId, Dunder)> = Dunder::iter()
        .map(|dunder| (intern_immortal(heap, dunder.name()), dunder))
        .collect();

    // Core classes.
    let object_class = new_class(heap, "object", None);
    let type_class = new_class(heap, "type", Some(object_class));
    let none_class = new_class(heap, "NoneType", Some(object_class));
    let bool_class = new_class(heap, "bool", Some(object_class));
    let int_class = new_class(heap, "int", Some(object_class));
    let float_class = new_class(heap, "float", Some(object_class));
    let str_class = new_class(heap, "str", Some(object_class));
    let bytes_class = new_class(heap, "bytes", Some(object_class));
    let tuple_class = new_class(heap, "tuple", Some(object_class));
    let list_class = new_class(heap, "list", Some(object_class));
    let dict_class = new_class(heap, "dict", Some(object_class));
    let set_class = new_class(heap, "set", Some(object_class));
    let range_class = new_class(heap, "range", Some(object_class));
    let function_class = new_class(heap, "function", Some(object_class));
    let method_class = new_class(heap, "method", Some(object_class));
    let generator_class = new_class(heap, "generator", Some(object_class));
    let module_class = new_class(heap, "module", Some(object_class));

    // Native constructors and method tables.
    number_type::install(heap, int_class, float_class, bool_class);
    str_type::install(heap, str_class);
    bytes_type::install(heap, bytes_class);
    tuple_type::install(heap, tuple_class);
    list_type::install(heap, list_class);
    dict_type::install(heap, dict_class);
    set_type::install(heap, set_class);
    range_type::install(heap, range_class);

    // Exception tree, in declaration order so parents exist first. The
    // root's methods install before any subclass copies its dunder cache.
    let mut exceptions = Vec::with_capacity(ExcKind::iter().count());
    for kind in ExcKind::iter() {
        let base = match kind.parent() {
            Some(parent) => exceptions[parent as usize],
            None => object_class,
        };
        let class = new_class(heap, kind.name(), Some(base));
        if kind == ExcKind::BaseException {
            define_method(heap, class, "__init__", functions::exception_init);
            define_method(heap, class, "__str__", functions::exception_str);
            define_method(heap, class, "__repr__", functions::exception_repr);
        }
        exceptions.push(class);
    }

    // The builtins module: global functions plus the classes by name.
    let builtins_module = heap.allocate(HeapData::Instance(InstanceObject {
        class: module_class,
        fields: Table::new(),
    }));
    heap.set_flag(builtins_module, FLAG_IMMORTAL);
    let module_name = intern_immortal(heap, "builtins");
    attach(heap, builtins_module, "__name__", Value::Ref(module_name));

    for (name, class) in [
        ("object", object_class),
        ("type", type_class),
        ("bool", bool_class),
        ("int", int_class),
        ("float", float_class),
        ("str", str_class),
        ("bytes", bytes_class),
        ("tuple", tuple_class),
        ("list", list_class),
        ("dict", dict_class),
        ("set", set_class),
        ("range", range_class),
    ] {
        attach(heap, builtins_module, name, Value::Ref(class));
    }
    for (kind, class) in ExcKind::iter().zip(exceptions.iter()) {
        attach(heap, builtins_module, kind.name(), Value::Ref(*class));
    }
    for (name, func, doc) in functions::GLOBALS {
        let native = new_native(heap, name, *func, Some(*doc));
        attach(heap, builtins_module, name, Value::Ref(native));
    }

    Registry {
        object_class,
        type_class,
        none_class,
        bool_class,
        int_class,
        float_class,
        str_class,
        bytes_class,
        tuple_class,
        list_class,
        dict_class,
        set_class,
        range_class,
        function_class,
        method_class,
        generator_class,
        module_class,
        exceptions,
        builtins_module,
        special_names,
        name_arg: intern_immortal(heap, "arg"),
        name_traceback: intern_immortal(heap, "__traceback__"),
        name_cause: intern_immortal(heap, "__cause__"),
        name_class_attr: intern_immortal(heap, "__class__"),
        name_name_attr: intern_immortal(heap, "__name__"),
        name_doc_attr: intern_immortal(heap, "__doc__"),
        name_exports: intern_immortal(heap, "__exports__"),
        name_module_name: intern_immortal(heap, "__name__"),
    }
}
