//! Module objects and source-file imports.
//!
//! A module is an instance of the builtin `module` class whose fields are
//! the module's globals. The global modules table caches one instance per
//! name; `import` inserts the module before executing its body, so cyclic
//! imports observe a partially-initialized module instead of recursing.

use crate::{
    exceptions::{ExcKind, VmResult},
    heap::{HeapData, HeapId, InstanceObject},
    table::Table,
    value::Value,
    vm::{Arguments, Vm},
};

/// File extension searched by `import`.
const MODULE_EXTENSION: &str = "kar";

impl Vm {
    /// Returns the module registered under `name`, creating it if needed.
    pub(crate) fn ensure_module(&mut self, name: &str) -> HeapId {
        let name_id = self.heap.intern(name);
        let hash = self.heap.cached_hash(name_id);
        if let Some(Value::Ref(module)) = self.modules.get_exact(&Value::Ref(name_id), hash) {
            return module;
        }
        self.create_module(name_id)
    }

    /// Creates and registers a fresh module instance.
    pub(crate) fn create_module(&mut self, name_id: HeapId) -> HeapId {
        let class = self.registry.module_class;
        let module = self.heap.allocate(HeapData::Instance(InstanceObject {
            class,
            fields: Table::new(),
        }));
        let attr = self.registry.name_module_name;
        let attr_hash = self.heap.cached_hash(attr);
        self.heap
            .instance_mut(module)
            .fields
            .set_exact(Value::Ref(attr), attr_hash, Value::Ref(name_id));
        let hash = self.heap.cached_hash(name_id);
        self.modules.set_exact(Value::Ref(name_id), hash, Value::Ref(module));
        module
    }

    fn unregister_module(&mut self, name_id: HeapId) {
        let hash = self.heap.cached_hash(name_id);
        self.modules.delete_exact(&Value::Ref(name_id), hash);
    }

    /// Imports a module by name: cached instance, or compile-and-run from
    /// the module search path.
    pub(crate) fn import_module(&mut self, name_id: HeapId) -> VmResult<Value> {
        let hash = self.heap.cached_hash(name_id);
        if let Some(module) = self.modules.get_exact(&Value::Ref(name_id), hash) {
            return Ok(module);
        }

        let name = self.heap.as_str(name_id).to_string();
        let mut found = None;
        for base in &self.module_paths {
            let candidate = base.join(format!("{name}.{MODULE_EXTENSION}"));
            if candidate.is_file() {
                found = Some(candidate);
                break;
            }
        }
        let Some(path) = found else {
            return Err(self.error(ExcKind::ImportError, &format!("no module named '{name}'")));
        };
        let source = match std::fs::read_to_string(&path) {
            Ok(source) => source,
            Err(err) => {
                return Err(self.error(
                    ExcKind::ImportError,
                    &format!("could not read module '{name}': {err}"),
                ));
            }
        };

        // Register before executing so cyclic imports terminate.
        let module = self.create_module(name_id);
        let filename = path.to_string_lossy().to_string();
        match self.interpret_in_module(&source, &filename, module) {
            Ok(_) => Ok(Value::Ref(module)),
            Err(err) => {
                self.unregister_module(name_id);
                Err(err)
            }
        }
    }
}

/// The `__import__` builtin behind `import` statements.
pub(crate) fn import_builtin(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    let [name] = args.values[..] else {
        return Err(vm.error(ExcKind::ArgumentError, "__import__() takes exactly one argument"));
    };
    let Value::Ref(name_id) = name else {
        return Err(vm.error(ExcKind::TypeError, "module name must be a string"));
    };
    if !matches!(vm.heap.get(name_id), HeapData::Str(_)) {
        return Err(vm.error(ExcKind::TypeError, "module name must be a string"));
    }
    vm.import_module(name_id)
}

/// The `__export__` builtin behind `export` statements: appends names to
/// the calling module's `__exports__` list.
pub(crate) fn export_builtin(vm: &mut Vm, args: &Arguments) -> VmResult<Value> {
    let Some(frame) = vm.thread.frames.last() else {
        return Err(vm.error(ExcKind::SystemError, "export outside of any frame"));
    };
    let module = frame.globals;
    let exports_name = vm.registry.name_exports;
    let hash = vm.heap.cached_hash(exports_name);
    let list = match vm
        .heap
        .instance(module)
        .fields
        .get_exact(&Value::Ref(exports_name), hash)
    {
        Some(Value::Ref(list)) if matches!(vm.heap.get(list), HeapData::List(_)) => list,
        _ => {
            let list = vm.heap.allocate_list(Vec::new());
            vm.heap
                .instance_mut(module)
                .fields
                .set_exact(Value::Ref(exports_name), hash, Value::Ref(list));
            list
        }
    };
    for name in &args.values {
        vm.heap.list_mut(list).items.push(*name);
    }
    Ok(Value::None)
}
