//! The call protocol: closures, natives, classes, bound methods,
//! generators, and the argument binder.
//!
//! Stack convention: a call site pushes the callee, then `argc` argument
//! slots. Keyword arguments travel as `(name, value)` pairs topped by a
//! `Kwargs(n)` sentinel counting the pairs; `*sequence` and `**mapping`
//! arguments use reserved pseudo-names inside that region. The binder
//! rewrites the argument region in place into the callee's local layout:
//! positional parameters, the `*args` tuple, keyword-only parameters, then
//! the `**kwargs` dict.
//!
//! Frames address their locals as `stack[slots + n]`. For plain calls the
//! callee sits one below `slots` and is removed when the frame returns
//! (`ret_slot`); for bound methods, class instantiation, and `__call__`
//! dispatch the receiver is written over the callee's slot and becomes
//! local 0.

use smallvec::SmallVec;

use crate::{
    compiler::{KWARGS_DOUBLE_STAR, KWARGS_STAR},
    exceptions::{ExcKind, VmResult},
    heap::{Dunder, GeneratorObject, GeneratorState, HeapData, HeapId},
    value::Value,
    vm::{Arguments, CallFrame, Vm},
};

/// What a call dispatch did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CallDispatch {
    /// A frame was pushed; the dispatch loop continues into it.
    Frame,
    /// The call completed immediately; its result is on the stack.
    Value,
}

/// Keyword arguments staged during binding.
struct StagedKeywords {
    /// `(name, value)` pairs with interned-string names.
    named: SmallVec<[(HeapId, Value); 8]>,
    /// Extra positionals spliced from `*sequence` arguments.
    splice: SmallVec<[Value; 8]>,
}

impl Vm {
    /// Dispatches a call to the value at `callee_pos` with `argc` argument
    /// slots above it.
    pub(crate) fn call_value(&mut self, callee_pos: usize, argc: usize) -> VmResult<CallDispatch> {
        let callee = self.thread.stack[callee_pos];
        self.dispatch_call(callee, callee_pos, argc, true)
    }

    fn dispatch_call(
        &mut self,
        callee: Value,
        callee_pos: usize,
        argc: usize,
        callable_on_stack: bool,
    ) -> VmResult<CallDispatch> {
        let Value::Ref(id) = callee else {
            let kind = callee.type_name(&self.heap);
            return Err(self.error(ExcKind::TypeError, &format!("'{kind}' object is not callable")));
        };
        match self.heap.get(id) {
            HeapData::Closure(_) => self.call_closure(id, callee_pos, argc, callable_on_stack, false),
            HeapData::Native(_) => self.call_native(id, callee_pos, argc, callable_on_stack),
            HeapData::Class(_) => self.call_class(id, callee_pos, argc),
            HeapData::BoundMethod(bound) => {
                let receiver = bound.receiver;
                let method = bound.method;
                self.thread.stack[callee_pos] = receiver;
                self.dispatch_call(method, callee_pos, argc + 1, false)
            }
            HeapData::Generator(_) => self.resume_generator(id, callee_pos, argc, callable_on_stack),
            HeapData::Instance(instance) => {
                let class = instance.class;
                let Some(call) = self.heap.class(class).dunders.get(Dunder::Call) else {
                    let kind = callee.type_name(&self.heap);
                    return Err(self.error(ExcKind::TypeError, &format!("'{kind}' object is not callable")));
                };
                // The instance is already in the callee slot; it becomes
                // the receiver.
                self.dispatch_call(call, callee_pos, argc + 1, false)
            }
            _ => {
                let kind = callee.type_name(&self.heap);
                Err(self.error(ExcKind::TypeError, &format!("'{kind}' object is not callable")))
            }
        }
    }

    /// `CALL_METHOD name argc`: look up and invoke in one step, without
    /// materializing a bound method.
    pub(crate) fn call_method(&mut self, name: Value, argc: usize) -> VmResult<()> {
        let recv_pos = self.thread.stack.len() - argc - 1;
        let receiver = self.thread.stack[recv_pos];
        let Value::Ref(name_id) = name else {
            panic!("method name is not a string");
        };

        // Instance fields shadow class methods.
        if let Value::Ref(id) = receiver
            && matches!(self.heap.get(id), HeapData::Instance(_))
        {
            let hash = self.heap.cached_hash(name_id);
            if let Some(field) = self.heap.instance(id).fields.get_exact(&name, hash) {
                self.thread.stack[recv_pos] = field;
                self.call_value(recv_pos, argc)?;
                return Ok(());
            }
        }

        let class = self.class_of(receiver);
        if let Some(method) = self.lookup_class_attr(class, name_id) {
            match method {
                Value::Ref(mid) => match self.heap.get(mid) {
                    HeapData::Closure(_) => {
                        self.call_closure(mid, recv_pos, argc + 1, false, false)?;
                        return Ok(());
                    }
                    HeapData::Native(_) => {
                        self.call_native_with_receiver(mid, recv_pos, argc)?;
                        return Ok(());
                    }
                    _ => {}
                },
                _ => {}
            }
        }

        // Slow path: full attribute resolution, then a plain call.
        let resolved = self.get_attribute_value(receiver, name)?;
        self.thread.stack[recv_pos] = resolved;
        self.call_value(recv_pos, argc)?;
        Ok(())
    }

    /// Calls a closure, binding arguments and pushing a frame (or creating
    /// a generator when the code object is flagged).
    pub(crate) fn call_closure(
        &mut self,
        closure_id: HeapId,
        callee_pos: usize,
        argc: usize,
        callable_on_stack: bool,
        is_initializer: bool,
    ) -> VmResult<CallDispatch> {
        if self.thread.frames.len() + 1 >= self.flags.max_call_depth {
            return Err(self.error(ExcKind::SystemError, "maximum call depth exceeded"));
        }
        let slots = callee_pos + usize::from(callable_on_stack);
        let ret_slot = callee_pos;
        self.bind_arguments(closure_id, slots, argc)?;

        let closure = self.heap.closure(closure_id);
        let code_id = closure.code;
        let globals = closure.globals;
        let code = self.heap.code(code_id).share();

        if code.is_generator() {
            // Calls to generator functions bind their arguments and return
            // a paused generator instead of running the body.
            let saved: Vec<Value> = self.thread.stack.drain(slots..).collect();
            let generator = self.heap.allocate(HeapData::Generator(GeneratorObject {
                closure: closure_id,
                ip: 0,
                stack: saved,
                state: GeneratorState::Ready,
            }));
            self.thread.stack.truncate(ret_slot);
            self.push(Value::Ref(generator));
            return Ok(CallDispatch::Value);
        }

        let qualname = code.qualname.clone();
        self.thread.frames.push(CallFrame {
            closure: closure_id,
            code,
            code_id,
            ip: 0,
            slots,
            ret_slot,
            globals,
            generator: None,
            is_initializer,
        });
        self.tracer.on_call(&qualname, self.thread.frames.len());
        Ok(CallDispatch::Frame)
    }

    /// Invokes a native function over the staged argument region.
    fn call_native(
        &mut self,
        native_id: HeapId,
        callee_pos: usize,
        argc: usize,
        callable_on_stack: bool,
    ) -> VmResult<CallDispatch> {
        let args_start = callee_pos + usize::from(callable_on_stack);
        self.invoke_native(native_id, args_start, callee_pos, argc)
    }

    /// `obj.method(...)` fast path: the receiver is the first argument.
    fn call_native_with_receiver(&mut self, native_id: HeapId, recv_pos: usize, argc: usize) -> VmResult<CallDispatch> {
        self.invoke_native(native_id, recv_pos, recv_pos, argc + 1)
    }

    fn invoke_native(
        &mut self,
        native_id: HeapId,
        args_start: usize,
        ret_slot: usize,
        argc: usize,
    ) -> VmResult<CallDispatch> {
        let (values, kwargs) = self.stage_native_arguments(args_start, argc)?;
        // Root the kwargs dict across the native call.
        let scratch = self.heap.scratch_len();
        if let Some(dict) = kwargs {
            self.heap.scratch_push(Value::Ref(dict));
        }
        let func = match self.heap.get(native_id) {
            HeapData::Native(native) => native.func,
            other => panic!("expected native, found {}", other.type_name()),
        };
        let arguments = Arguments { values, kwargs };
        let result = func(self, &arguments);
        self.heap.scratch_truncate(scratch);
        let result = result?;
        self.thread.stack.truncate(ret_slot);
        self.push(result);
        Ok(CallDispatch::Value)
    }

    /// Splits a raw argument region into positional values and a kwargs
    /// dict for a native call.
    fn stage_native_arguments(
        &mut self,
        args_start: usize,
        argc: usize,
    ) -> VmResult<(SmallVec<[Value; 8]>, Option<HeapId>)> {
        let (positional_count, staged) = self.collect_keywords(args_start, argc)?;
        let mut values: SmallVec<[Value; 8]> =
            SmallVec::from_slice(&self.thread.stack[args_start..args_start + positional_count]);
        let Some(staged) = staged else {
            return Ok((values, None));
        };
        values.extend(staged.splice.iter().copied());
        if staged.named.is_empty() {
            return Ok((values, None));
        }
        let dict = self.heap.allocate_dict();
        // Stack still holds the raw pairs, so everything here is rooted.
        for (name, value) in &staged.named {
            self.dict_set(dict, Value::Ref(*name), *value)?;
        }
        Ok((values, Some(dict)))
    }

    /// Parses the kwargs sentinel region (if present) without disturbing
    /// the stack. Returns the plain positional count and the staged
    /// keyword data.
    fn collect_keywords(&mut self, args_start: usize, argc: usize) -> VmResult<(usize, Option<StagedKeywords>)> {
        if argc == 0 {
            return Ok((0, None));
        }
        let top = args_start + argc - 1;
        let Value::Kwargs(pairs) = self.thread.stack[top] else {
            return Ok((argc, None));
        };
        let pairs = pairs as usize;
        let positional_count = argc - pairs * 2 - 1;
        let mut staged = StagedKeywords {
            named: SmallVec::new(),
            splice: SmallVec::new(),
        };
        for i in 0..pairs {
            let key = self.thread.stack[args_start + positional_count + i * 2];
            let value = self.thread.stack[args_start + positional_count + i * 2 + 1];
            match key {
                Value::Kwargs(KWARGS_STAR) => match value {
                    Value::Ref(id) => match self.heap.get(id) {
                        HeapData::Tuple(t) => staged.splice.extend(t.items.iter().copied()),
                        HeapData::List(l) => staged.splice.extend(l.items.iter().copied()),
                        _ => {
                            let kind = value.type_name(&self.heap);
                            return Err(self.error(
                                ExcKind::TypeError,
                                &format!("argument after * must be a sequence, not '{kind}'"),
                            ));
                        }
                    },
                    _ => {
                        let kind = value.type_name(&self.heap);
                        return Err(self.error(
                            ExcKind::TypeError,
                            &format!("argument after * must be a sequence, not '{kind}'"),
                        ));
                    }
                },
                Value::Kwargs(KWARGS_DOUBLE_STAR) => {
                    let Value::Ref(id) = value else {
                        let kind = value.type_name(&self.heap);
                        return Err(self.error(
                            ExcKind::TypeError,
                            &format!("argument after ** must be a mapping, not '{kind}'"),
                        ));
                    };
                    let HeapData::Dict(dict) = self.heap.get(id) else {
                        let kind = value.type_name(&self.heap);
                        return Err(self.error(
                            ExcKind::TypeError,
                            &format!("argument after ** must be a mapping, not '{kind}'"),
                        ));
                    };
                    let entries: Vec<(Value, Value)> = dict.table.iter().map(|(k, v)| (*k, *v)).collect();
                    for (key, value) in entries {
                        let Value::Ref(name_id) = key else {
                            return Err(self.error(ExcKind::TypeError, "keywords must be strings"));
                        };
                        if !matches!(self.heap.get(name_id), HeapData::Str(_)) {
                            return Err(self.error(ExcKind::TypeError, "keywords must be strings"));
                        }
                        staged.named.push((name_id, value));
                    }
                }
                Value::Ref(name_id) => staged.named.push((name_id, value)),
                _ => return Err(self.error(ExcKind::TypeError, "keywords must be strings")),
            }
        }
        Ok((positional_count, Some(staged)))
    }

    /// Binds a closure call's arguments, rewriting `stack[slots..]` into
    /// the frame's local layout.
    fn bind_arguments(&mut self, closure_id: HeapId, slots: usize, argc: usize) -> VmResult<()> {
        let (positional_count, staged) = self.collect_keywords(slots, argc)?;

        let closure = self.heap.closure(closure_id);
        let code = self.heap.code(closure.code).share();
        let defaults: SmallVec<[Value; 4]> = SmallVec::from_slice(&closure.defaults);
        let kw_defaults: SmallVec<[Value; 4]> = SmallVec::from_slice(&closure.kw_defaults);
        let func_name = self.heap.as_str(code.name).to_string();

        let nparams = code.positional.len();
        let has_varargs = code.collects_args();
        let has_kwargs = code.collects_kwargs();
        let nkwonly = code.keyword_only.len();
        let layout_len = nparams + usize::from(has_varargs) + nkwonly + usize::from(has_kwargs);

        let mut locals: SmallVec<[Value; 16]> = SmallVec::new();
        locals.resize(layout_len, Value::None);
        let mut filled: SmallVec<[bool; 16]> = SmallVec::new();
        filled.resize(layout_len, false);

        // Positionals from the stack, then any *sequence splice.
        let mut given: SmallVec<[Value; 8]> =
            SmallVec::from_slice(&self.thread.stack[slots..slots + positional_count]);
        let mut extra_positional: Vec<Value> = Vec::new();
        if let Some(staged) = &staged {
            given.extend(staged.splice.iter().copied());
        }
        for (i, value) in given.iter().enumerate() {
            if i < nparams {
                locals[i] = *value;
                filled[i] = true;
            } else if has_varargs {
                extra_positional.push(*value);
            } else {
                return Err(self.error(
                    ExcKind::ArgumentError,
                    &format!(
                        "{func_name}() takes {nparams} positional argument{} but {} {} given",
                        if nparams == 1 { "" } else { "s" },
                        given.len(),
                        if given.len() == 1 { "was" } else { "were" },
                    ),
                ));
            }
        }

        // Keywords by name.
        let varargs_slot = nparams;
        let kwonly_base = nparams + usize::from(has_varargs);
        let kwargs_slot = kwonly_base + nkwonly;
        let mut overflow_keywords: Vec<(HeapId, Value)> = Vec::new();
        if let Some(staged) = &staged {
            for (name_id, value) in &staged.named {
                if let Some(i) = code.positional.iter().position(|p| p == name_id) {
                    if filled[i] {
                        let name = self.heap.as_str(*name_id).to_string();
                        return Err(self.error(
                            ExcKind::ArgumentError,
                            &format!("{func_name}() got multiple values for argument '{name}'"),
                        ));
                    }
                    locals[i] = *value;
                    filled[i] = true;
                } else if let Some(j) = code.keyword_only.iter().position(|p| p == name_id) {
                    if filled[kwonly_base + j] {
                        let name = self.heap.as_str(*name_id).to_string();
                        return Err(self.error(
                            ExcKind::ArgumentError,
                            &format!("{func_name}() got multiple values for argument '{name}'"),
                        ));
                    }
                    locals[kwonly_base + j] = *value;
                    filled[kwonly_base + j] = true;
                } else if has_kwargs {
                    overflow_keywords.push((*name_id, *value));
                } else {
                    let name = self.heap.as_str(*name_id).to_string();
                    return Err(self.error(
                        ExcKind::ArgumentError,
                        &format!("{func_name}() got an unexpected keyword argument '{name}'"),
                    ));
                }
            }
        }

        // Defaults, right-aligned on their name lists.
        let first_default = nparams - defaults.len();
        for i in 0..nparams {
            if !filled[i] {
                if i >= first_default {
                    locals[i] = defaults[i - first_default];
                    filled[i] = true;
                } else {
                    let name = self.heap.as_str(code.positional[i]).to_string();
                    return Err(self.error(
                        ExcKind::ArgumentError,
                        &format!("{func_name}() missing required argument '{name}'"),
                    ));
                }
            }
        }
        let first_kw_default = nkwonly - kw_defaults.len();
        for j in 0..nkwonly {
            if !filled[kwonly_base + j] {
                if j >= first_kw_default {
                    locals[kwonly_base + j] = kw_defaults[j - first_kw_default];
                    filled[kwonly_base + j] = true;
                } else {
                    let name = self.heap.as_str(code.keyword_only[j]).to_string();
                    return Err(self.error(
                        ExcKind::ArgumentError,
                        &format!("{func_name}() missing required keyword-only argument '{name}'"),
                    ));
                }
            }
        }

        // The *args tuple and **kwargs dict allocate after everything else
        // is staged; their contents are still rooted on the stack.
        if has_varargs {
            let tuple = self.heap.allocate_tuple(extra_positional);
            locals[varargs_slot] = Value::Ref(tuple);
        }
        if has_kwargs {
            let dict = self.heap.allocate_dict();
            locals[kwargs_slot] = Value::Ref(dict);
            for (name_id, value) in overflow_keywords {
                self.dict_set(dict, Value::Ref(name_id), value)?;
            }
        }

        // Replace the raw argument region with the bound layout.
        self.thread.stack.truncate(slots);
        self.thread.stack.extend(locals);
        Ok(())
    }

    /// Class call: allocate an instance and run `__init__` (or defer to a
    /// native constructor or `__new__`).
    fn call_class(&mut self, class_id: HeapId, callee_pos: usize, argc: usize) -> VmResult<CallDispatch> {
        let native_ctor = self.heap.class(class_id).native_ctor;
        let new_method = self.heap.class(class_id).dunders.get(Dunder::New);
        let init = self.heap.class(class_id).dunders.get(Dunder::Init);
        if let Some(ctor) = native_ctor {
            let (values, kwargs) = self.stage_native_arguments(callee_pos + 1, argc)?;
            let scratch = self.heap.scratch_len();
            if let Some(dict) = kwargs {
                self.heap.scratch_push(Value::Ref(dict));
            }
            let arguments = Arguments { values, kwargs };
            let result = ctor(self, &arguments);
            self.heap.scratch_truncate(scratch);
            let result = result?;
            self.thread.stack.truncate(callee_pos);
            self.push(result);
            return Ok(CallDispatch::Value);
        }

        if let Some(new) = new_method {
            // __new__ takes over construction entirely; the class value in
            // the callee slot becomes its first argument.
            return self.dispatch_call(new, callee_pos, argc + 1, false);
        }

        let instance = self.heap.allocate_instance(class_id);
        self.thread.stack[callee_pos] = Value::Ref(instance);
        match init {
            Some(Value::Ref(init_id)) => match self.heap.get(init_id) {
                HeapData::Closure(_) => self.call_closure(init_id, callee_pos, argc + 1, false, true),
                HeapData::Native(_) => {
                    self.call_native_with_receiver(init_id, callee_pos, argc)?;
                    // Natives return through the result slot; restore the
                    // instance as the call's value.
                    self.set_top(Value::Ref(instance));
                    Ok(CallDispatch::Value)
                }
                _ => Err(self.error(ExcKind::TypeError, "__init__ is not callable")),
            },
            Some(_) => Err(self.error(ExcKind::TypeError, "__init__ is not callable")),
            None => {
                if argc != 0 {
                    let name = self.heap.as_str(self.heap.class(class_id).name).to_string();
                    return Err(self.error(
                        ExcKind::ArgumentError,
                        &format!("{name}() takes no arguments ({argc} given)"),
                    ));
                }
                self.thread.stack.truncate(callee_pos + 1);
                Ok(CallDispatch::Value)
            }
        }
    }

    /// Resumes (or rejects resumption of) a generator.
    fn resume_generator(
        &mut self,
        generator_id: HeapId,
        callee_pos: usize,
        argc: usize,
        callable_on_stack: bool,
    ) -> VmResult<CallDispatch> {
        if self.thread.frames.len() + 1 >= self.flags.max_call_depth {
            return Err(self.error(ExcKind::SystemError, "maximum call depth exceeded"));
        }
        let args_start = callee_pos + usize::from(callable_on_stack);
        if argc > 1 {
            return Err(self.error(ExcKind::ArgumentError, "generators take at most one argument"));
        }
        let sent = if argc == 1 {
            self.thread.stack[args_start]
        } else {
            Value::None
        };
        let state = self.heap.generator(generator_id).state;
        match state {
            GeneratorState::Running => {
                return Err(self.error(ExcKind::ValueError, "generator already executing"));
            }
            GeneratorState::Finished => {
                self.thread.stack.truncate(callee_pos);
                self.push(Value::Ref(generator_id));
                return Ok(CallDispatch::Value);
            }
            GeneratorState::Ready | GeneratorState::Suspended => {}
        }

        let ret_slot = callee_pos;
        self.thread.stack.truncate(callee_pos);
        let slots = self.thread.stack.len();
        let (closure_id, resume_ip, saved) = {
            let gen_ = self.heap.generator_mut(generator_id);
            let saved = std::mem::take(&mut gen_.stack);
            gen_.state = GeneratorState::Running;
            (gen_.closure, gen_.ip, saved)
        };
        self.thread.stack.extend(saved);
        let closure = self.heap.closure(closure_id);
        let code_id = closure.code;
        let globals = closure.globals;
        let code = self.heap.code(code_id).share();
        self.thread.frames.push(CallFrame {
            closure: closure_id,
            code,
            code_id,
            ip: resume_ip,
            slots,
            ret_slot,
            globals,
            generator: Some(generator_id),
            is_initializer: false,
        });
        if state == GeneratorState::Suspended {
            // The sent value becomes the result of the paused `yield`.
            self.push(sent);
        }
        Ok(CallDispatch::Frame)
    }
}
