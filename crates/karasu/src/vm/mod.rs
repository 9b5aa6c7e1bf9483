//! The virtual machine: thread state, call frames, and the dispatch loop.
//!
//! Execution state lives in a [`ThreadState`]: one contiguous operand stack
//! holding both temporaries and locals, a frame stack, the open-upvalue
//! list, and the current-exception slot. The dispatch loop fetches one
//! opcode at a time and executes it; fallible operations thread
//! `Result<_, VmError>` and unwinding walks the stack for `Handler`
//! markers (see `vm::exceptions`).
//!
//! Nested evaluation (dunder calls from native code, `repr` of instances,
//! descriptor protocol) re-enters the same loop through
//! [`Vm::call_direct`], bounded by a frame floor so inner exceptions never
//! unwind past their entry point.

pub(crate) mod attr;
pub(crate) mod binary;
pub(crate) mod call;
pub(crate) mod exceptions;

use std::{
    path::PathBuf,
    rc::Rc,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use serde::Serialize;
use smallvec::SmallVec;

use crate::{
    builtins::{self, Registry},
    chunk::CodeObject,
    compiler,
    exceptions::{ExcKind, VmError, VmResult},
    heap::{
        ClosureObject, Dunder, GcStats, GeneratorState, Heap, HeapData, HeapId, NativeIterObject, UpvalueObject,
        UpvalueState,
    },
    io::{PrintWriter, StdPrint},
    opcode::Opcode,
    table::Table,
    tracer::{NoopTracer, StepAction, TraceFrame, VmTracer},
    value::{HandlerEntry, HandlerKind, Value, value_hash},
};

/// Signature of host functions exposed to programs.
///
/// `args.values[0]` is the receiver when the native was invoked as a
/// method. Natives may call back into the VM; values they hold across such
/// calls must be parked on the stack or in the heap's scratch roots first.
pub type NativeFn = fn(&mut Vm, &Arguments) -> VmResult<Value>;

/// Decoded argument set handed to a native function.
#[derive(Debug)]
pub struct Arguments {
    /// Positional arguments (receiver first for method calls).
    pub values: SmallVec<[Value; 8]>,
    /// Keyword arguments collected into a dict, when any were passed.
    pub kwargs: Option<HeapId>,
}

impl Arguments {
    #[must_use]
    pub fn positional(values: &[Value]) -> Self {
        Self {
            values: SmallVec::from_slice(values),
            kwargs: None,
        }
    }
}

/// Hard limit on call depth; one more call raises `SystemError`.
pub const CALL_FRAMES_MAX: usize = 1000;

/// Interpreter configuration flags.
#[derive(Debug, Clone, Serialize)]
pub struct VmFlags {
    /// Collect at every instruction boundary; for liveness debugging.
    pub stress_gc: bool,
    /// Invoke the tracer's single-step hook after every instruction.
    pub single_step: bool,
    /// Maximum call-frame depth.
    pub max_call_depth: usize,
}

impl Default for VmFlags {
    fn default() -> Self {
        Self {
            stress_gc: false,
            single_step: false,
            max_call_depth: CALL_FRAMES_MAX,
        }
    }
}

/// One function activation.
#[derive(Debug)]
pub(crate) struct CallFrame {
    pub closure: HeapId,
    /// Shared handle on the running code; stable across arena growth.
    pub code: Rc<CodeObject>,
    pub code_id: HeapId,
    /// Offset of the next byte to execute.
    pub ip: usize,
    /// Stack index of local slot 0 (the first argument).
    pub slots: usize,
    /// Stack index the frame's return value replaces.
    pub ret_slot: usize,
    /// Module instance whose fields are this frame's globals.
    pub globals: HeapId,
    /// Set when this frame belongs to a resumed generator.
    pub generator: Option<HeapId>,
    /// `__init__` frames return their receiver regardless of body returns.
    pub is_initializer: bool,
}

/// An upvalue still pointing into the stack.
#[derive(Debug, Clone, Copy)]
pub(crate) struct OpenUpvalue {
    pub slot: usize,
    pub upvalue: HeapId,
}

/// Per-thread execution state.
#[derive(Debug, Default)]
pub(crate) struct ThreadState {
    pub stack: Vec<Value>,
    pub frames: Vec<CallFrame>,
    /// Open upvalues sorted by descending stack slot.
    pub open_upvalues: Vec<OpenUpvalue>,
    pub current_exception: Option<Value>,
    pub has_exception: bool,
}

/// The interpreter.
///
/// Owns the heap, the main thread state, the module and builtin
/// registries, and the embedding configuration.
pub struct Vm {
    pub(crate) heap: Heap,
    pub(crate) thread: ThreadState,
    /// Loaded modules by interned name.
    pub(crate) modules: Table,
    pub(crate) registry: Registry,
    pub(crate) flags: VmFlags,
    pub(crate) stdout: Box<dyn PrintWriter>,
    pub(crate) tracer: Box<dyn VmTracer>,
    /// Raised from any thread to interrupt at the next instruction.
    signalled: Arc<AtomicBool>,
    /// Directories searched by `import`.
    pub(crate) module_paths: Vec<PathBuf>,
    /// Instruction offset of the opcode currently executing.
    pub(crate) instruction_ip: usize,
}

impl Vm {
    /// Builds a fresh interpreter: heap, builtin classes and functions,
    /// exception tree, and the main thread.
    #[must_use]
    pub fn new(flags: VmFlags) -> Self {
        Self::with_output(flags, Box::new(StdPrint::new()))
    }

    /// As [`Vm::new`], with print output routed to `stdout`.
    #[must_use]
    pub fn with_output(flags: VmFlags, stdout: Box<dyn PrintWriter>) -> Self {
        let mut heap = Heap::new();
        heap.stress = flags.stress_gc;
        let registry = builtins::bootstrap(&mut heap);
        Self {
            heap,
            thread: ThreadState::default(),
            modules: Table::new(),
            registry,
            flags,
            stdout,
            tracer: Box::new(NoopTracer),
            signalled: Arc::new(AtomicBool::new(false)),
            module_paths: vec![PathBuf::from(".")],
            instruction_ip: 0,
        }
    }

    /// Replaces the tracer. Pair with `flags.single_step` for debugging.
    pub fn set_tracer(&mut self, tracer: Box<dyn VmTracer>) {
        self.tracer = tracer;
    }

    /// A handle other threads may flip to raise `KeyboardInterrupt` at the
    /// next instruction boundary.
    #[must_use]
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.signalled)
    }

    /// Appends a directory to the module search path.
    pub fn add_module_path(&mut self, path: impl Into<PathBuf>) {
        self.module_paths.push(path.into());
    }

    /// Collector counters.
    #[must_use]
    pub fn gc_stats(&self) -> GcStats {
        self.heap.stats()
    }

    /// The exception that escaped the last failed run, if any.
    #[must_use]
    pub fn current_exception(&self) -> Option<Value> {
        self.thread.current_exception
    }

    // ==================================================================
    // Entry points
    // ==================================================================

    /// Compiles and runs a source string in the `__main__` module.
    pub fn interpret(&mut self, source: &str, name: &str) -> VmResult<Value> {
        let module = self.ensure_module("__main__");
        self.interpret_in_module(source, name, module)
    }

    /// Compiles and runs a source string with a given module's globals.
    pub(crate) fn interpret_in_module(&mut self, source: &str, name: &str, module: HeapId) -> VmResult<Value> {
        let code_id = match compiler::compile(&mut self.heap, source, name) {
            Ok(id) => id,
            Err(err) => return Err(self.syntax_error(&err)),
        };
        let closure = self.heap.allocate(HeapData::Closure(ClosureObject {
            code: code_id,
            upvalues: SmallVec::new(),
            defaults: Vec::new(),
            kw_defaults: Vec::new(),
            globals: module,
            attrs: None,
            annotations: None,
        }));
        self.push(Value::Ref(closure));
        self.call_stack(0)
    }

    /// Reads and interprets a script file.
    pub fn run_file(&mut self, path: &str) -> VmResult<Value> {
        let source = match std::fs::read_to_string(path) {
            Ok(source) => source,
            Err(err) => {
                return Err(self.error(ExcKind::IOError, &format!("could not read {path}: {err}")));
            }
        };
        if let Some(dir) = std::path::Path::new(path).parent() {
            self.module_paths.push(dir.to_path_buf());
        }
        self.interpret(&source, path)
    }

    /// Invokes the callable sitting under `argc` pushed arguments.
    ///
    /// On return the callable and arguments are consumed and the result is
    /// returned (not left on the stack).
    pub fn call_stack(&mut self, argc: usize) -> VmResult<Value> {
        let floor = self.thread.frames.len();
        let callee_pos = self.thread.stack.len() - argc - 1;
        match self.call_value(callee_pos, argc) {
            Ok(call::CallDispatch::Frame) => self.run_until(floor),
            Ok(call::CallDispatch::Value) => Ok(self.pop()),
            Err(err) => {
                // Clean the staged call off the stack before propagating.
                self.thread.stack.truncate(callee_pos);
                Err(err)
            }
        }
    }

    /// Pushes `callee` and `args` and runs the call to completion.
    ///
    /// The workhorse for dunder dispatch and native re-entry.
    pub(crate) fn call_direct(&mut self, callee: Value, args: &[Value]) -> VmResult<Value> {
        self.push(callee);
        for arg in args {
            self.push(*arg);
        }
        self.call_stack(args.len())
    }

    /// Calls `method` with `receiver` as its first argument.
    pub(crate) fn call_dunder(&mut self, method: Value, receiver: Value, args: &[Value]) -> VmResult<Value> {
        self.push(method);
        self.push(receiver);
        for arg in args {
            self.push(*arg);
        }
        self.call_stack(args.len() + 1)
    }

    // ==================================================================
    // Stack primitives
    // ==================================================================

    pub(crate) fn push(&mut self, value: Value) {
        self.thread.stack.push(value);
    }

    pub(crate) fn pop(&mut self) -> Value {
        self.thread.stack.pop().expect("operand stack underflow")
    }

    /// The value `distance` slots below the top.
    #[must_use]
    pub(crate) fn peek(&self, distance: usize) -> Value {
        let len = self.thread.stack.len();
        self.thread.stack[len - 1 - distance]
    }

    pub(crate) fn set_top(&mut self, value: Value) {
        let len = self.thread.stack.len();
        self.thread.stack[len - 1] = value;
    }

    // ==================================================================
    // Upvalues
    // ==================================================================

    /// Finds or creates the upvalue cell for an absolute stack slot.
    ///
    /// The open list stays sorted by descending slot so closing can stop
    /// at the first entry below the threshold.
    pub(crate) fn capture_upvalue(&mut self, slot: usize) -> HeapId {
        for open in &self.thread.open_upvalues {
            if open.slot == slot {
                return open.upvalue;
            }
            if open.slot < slot {
                break;
            }
        }
        let upvalue = self.heap.allocate(HeapData::Upvalue(UpvalueObject {
            state: UpvalueState::Open { slot },
        }));
        let position = self
            .thread
            .open_upvalues
            .partition_point(|open| open.slot > slot);
        self.thread.open_upvalues.insert(position, OpenUpvalue { slot, upvalue });
        upvalue
    }

    /// Closes every open upvalue at or above `from_slot`, copying the
    /// stack value into the cell. Each upvalue closes exactly once.
    pub(crate) fn close_upvalues(&mut self, from_slot: usize) {
        while let Some(open) = self.thread.open_upvalues.first().copied() {
            if open.slot < from_slot {
                break;
            }
            let value = self.thread.stack[open.slot];
            self.heap.upvalue_mut(open.upvalue).state = UpvalueState::Closed(value);
            self.thread.open_upvalues.remove(0);
        }
    }

    // ==================================================================
    // The dispatch loop
    // ==================================================================

    /// Executes until the frame stack shrinks back to `floor`, returning
    /// the final frame's return value.
    pub(crate) fn run_until(&mut self, floor: usize) -> VmResult<Value> {
        macro_rules! vm_try {
            ($self:expr, $expr:expr) => {
                match $expr {
                    Ok(value) => value,
                    Err(err) => {
                        $self.handle_exception(err, floor)?;
                        continue;
                    }
                }
            };
        }

        loop {
            if self.heap.should_gc() {
                self.run_gc();
            }
            if self.signalled.swap(false, Ordering::Relaxed) {
                let err = self.error(ExcKind::KeyboardInterrupt, "");
                self.handle_exception(err, floor)?;
                continue;
            }

            // Fetch.
            let frame_index = self.thread.frames.len() - 1;
            let code = self.thread.frames[frame_index].code.share();
            let mut ip = self.thread.frames[frame_index].ip;
            self.instruction_ip = ip;
            let byte = code.chunk.code[ip];
            ip += 1;
            let op = Opcode::from_repr(byte).expect("invalid opcode in bytecode");
            self.tracer
                .on_instruction(self.instruction_ip, op, self.thread.stack.len());

            // Decode helpers over the local ip cursor.
            let bytecode = &code.chunk.code;
            let mut fetch_byte = |ip: &mut usize| {
                let value = bytecode[*ip];
                *ip += 1;
                value
            };
            let mut fetch_index = |ip: &mut usize, wide: bool| {
                if wide {
                    let b0 = bytecode[*ip];
                    let b1 = bytecode[*ip + 1];
                    let b2 = bytecode[*ip + 2];
                    *ip += 3;
                    usize::from(b0) | (usize::from(b1) << 8) | (usize::from(b2) << 16)
                } else {
                    let b0 = bytecode[*ip];
                    *ip += 1;
                    usize::from(b0)
                }
            };
            let mut fetch_u16 = |ip: &mut usize| {
                let lo = bytecode[*ip];
                let hi = bytecode[*ip + 1];
                *ip += 2;
                u16::from_le_bytes([lo, hi])
            };

            match op {
                // ----- stack and constants -----
                Opcode::Pop => {
                    self.thread.frames[frame_index].ip = ip;
                    self.pop();
                }
                Opcode::None => {
                    self.thread.frames[frame_index].ip = ip;
                    self.push(Value::None);
                }
                Opcode::True => {
                    self.thread.frames[frame_index].ip = ip;
                    self.push(Value::Bool(true));
                }
                Opcode::False => {
                    self.thread.frames[frame_index].ip = ip;
                    self.push(Value::Bool(false));
                }
                Opcode::Constant | Opcode::ConstantLong => {
                    let idx = fetch_index(&mut ip, op == Opcode::ConstantLong);
                    self.thread.frames[frame_index].ip = ip;
                    self.push(code.chunk.constants[idx]);
                }
                Opcode::Dup | Opcode::DupLong => {
                    let depth = fetch_index(&mut ip, op == Opcode::DupLong);
                    self.thread.frames[frame_index].ip = ip;
                    self.push(self.peek(depth));
                }
                Opcode::Swap | Opcode::SwapLong => {
                    let depth = fetch_index(&mut ip, op == Opcode::SwapLong);
                    self.thread.frames[frame_index].ip = ip;
                    let len = self.thread.stack.len();
                    self.thread.stack.swap(len - 1, len - 1 - depth);
                }

                // ----- arithmetic, logic, comparison -----
                Opcode::Add
                | Opcode::Subtract
                | Opcode::Multiply
                | Opcode::Divide
                | Opcode::Floordiv
                | Opcode::Modulo
                | Opcode::Pow
                | Opcode::Bitand
                | Opcode::Bitor
                | Opcode::Bitxor
                | Opcode::Bitshiftl
                | Opcode::Bitshiftr => {
                    self.thread.frames[frame_index].ip = ip;
                    vm_try!(self, self.binary_operator(op));
                }
                Opcode::Equal | Opcode::Less | Opcode::Greater | Opcode::LessEqual | Opcode::GreaterEqual => {
                    self.thread.frames[frame_index].ip = ip;
                    vm_try!(self, self.comparison_operator(op));
                }
                Opcode::Negate => {
                    self.thread.frames[frame_index].ip = ip;
                    vm_try!(self, self.negate_operator());
                }
                Opcode::Not => {
                    self.thread.frames[frame_index].ip = ip;
                    let value = self.pop();
                    let truthy = vm_try!(self, self.value_truthy(value));
                    self.push(Value::Bool(!truthy));
                }
                Opcode::Invert => {
                    self.thread.frames[frame_index].ip = ip;
                    vm_try!(self, self.invert_operator());
                }
                Opcode::Is => {
                    self.thread.frames[frame_index].ip = ip;
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a.identical(&b)));
                }
                Opcode::Contains => {
                    self.thread.frames[frame_index].ip = ip;
                    vm_try!(self, self.contains_operator());
                }

                // ----- names -----
                Opcode::DefineGlobal | Opcode::DefineGlobalLong => {
                    let idx = fetch_index(&mut ip, op == Opcode::DefineGlobalLong);
                    self.thread.frames[frame_index].ip = ip;
                    let name = code.chunk.constants[idx];
                    let value = self.pop();
                    self.define_global(frame_index, name, value);
                }
                Opcode::GetGlobal | Opcode::GetGlobalLong => {
                    let idx = fetch_index(&mut ip, op == Opcode::GetGlobalLong);
                    self.thread.frames[frame_index].ip = ip;
                    let name = code.chunk.constants[idx];
                    let value = vm_try!(self, self.get_global(frame_index, name));
                    self.push(value);
                }
                Opcode::SetGlobal | Opcode::SetGlobalLong => {
                    let idx = fetch_index(&mut ip, op == Opcode::SetGlobalLong);
                    self.thread.frames[frame_index].ip = ip;
                    let name = code.chunk.constants[idx];
                    vm_try!(self, self.set_global(frame_index, name));
                }
                Opcode::DelGlobal | Opcode::DelGlobalLong => {
                    let idx = fetch_index(&mut ip, op == Opcode::DelGlobalLong);
                    self.thread.frames[frame_index].ip = ip;
                    let name = code.chunk.constants[idx];
                    vm_try!(self, self.delete_global(frame_index, name));
                }
                Opcode::GetLocal | Opcode::GetLocalLong => {
                    let slot = fetch_index(&mut ip, op == Opcode::GetLocalLong);
                    self.thread.frames[frame_index].ip = ip;
                    let base = self.thread.frames[frame_index].slots;
                    self.push(self.thread.stack[base + slot]);
                }
                Opcode::SetLocal | Opcode::SetLocalLong => {
                    let slot = fetch_index(&mut ip, op == Opcode::SetLocalLong);
                    self.thread.frames[frame_index].ip = ip;
                    let base = self.thread.frames[frame_index].slots;
                    self.thread.stack[base + slot] = self.peek(0);
                }
                Opcode::GetUpvalue | Opcode::GetUpvalueLong => {
                    let slot = fetch_index(&mut ip, op == Opcode::GetUpvalueLong);
                    self.thread.frames[frame_index].ip = ip;
                    let closure = self.thread.frames[frame_index].closure;
                    let upvalue = self.heap.closure(closure).upvalues[slot];
                    let value = match self.heap.upvalue(upvalue).state {
                        UpvalueState::Open { slot } => self.thread.stack[slot],
                        UpvalueState::Closed(value) => value,
                    };
                    self.push(value);
                }
                Opcode::SetUpvalue | Opcode::SetUpvalueLong => {
                    let slot = fetch_index(&mut ip, op == Opcode::SetUpvalueLong);
                    self.thread.frames[frame_index].ip = ip;
                    let closure = self.thread.frames[frame_index].closure;
                    let upvalue = self.heap.closure(closure).upvalues[slot];
                    let value = self.peek(0);
                    match self.heap.upvalue(upvalue).state {
                        UpvalueState::Open { slot } => self.thread.stack[slot] = value,
                        UpvalueState::Closed(_) => {
                            self.heap.upvalue_mut(upvalue).state = UpvalueState::Closed(value);
                        }
                    }
                }
                Opcode::CloseUpvalue => {
                    self.thread.frames[frame_index].ip = ip;
                    let top = self.thread.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop();
                }

                // ----- attributes -----
                Opcode::GetProperty | Opcode::GetPropertyLong => {
                    let idx = fetch_index(&mut ip, op == Opcode::GetPropertyLong);
                    self.thread.frames[frame_index].ip = ip;
                    let name = code.chunk.constants[idx];
                    vm_try!(self, self.get_property(name));
                }
                Opcode::SetProperty | Opcode::SetPropertyLong => {
                    let idx = fetch_index(&mut ip, op == Opcode::SetPropertyLong);
                    self.thread.frames[frame_index].ip = ip;
                    let name = code.chunk.constants[idx];
                    vm_try!(self, self.set_property(name));
                }
                Opcode::DelProperty | Opcode::DelPropertyLong => {
                    let idx = fetch_index(&mut ip, op == Opcode::DelPropertyLong);
                    self.thread.frames[frame_index].ip = ip;
                    let name = code.chunk.constants[idx];
                    vm_try!(self, self.delete_property(name));
                }
                Opcode::GetSuper | Opcode::GetSuperLong => {
                    let idx = fetch_index(&mut ip, op == Opcode::GetSuperLong);
                    self.thread.frames[frame_index].ip = ip;
                    let name = code.chunk.constants[idx];
                    vm_try!(self, self.get_super(name));
                }

                // ----- control flow -----
                Opcode::Jump => {
                    let raw = fetch_u16(&mut ip);
                    let target = code.resolve_jump(self.instruction_ip, raw, true);
                    self.thread.frames[frame_index].ip = target;
                }
                Opcode::JumpIfFalse => {
                    let raw = fetch_u16(&mut ip);
                    self.thread.frames[frame_index].ip = ip;
                    let value = self.peek(0);
                    let truthy = vm_try!(self, self.value_truthy(value));
                    if !truthy {
                        let target = code.resolve_jump(self.instruction_ip, raw, true);
                        self.thread.frames[frame_index].ip = target;
                    }
                }
                Opcode::JumpIfTrue => {
                    let raw = fetch_u16(&mut ip);
                    self.thread.frames[frame_index].ip = ip;
                    let value = self.peek(0);
                    let truthy = vm_try!(self, self.value_truthy(value));
                    if truthy {
                        let target = code.resolve_jump(self.instruction_ip, raw, true);
                        self.thread.frames[frame_index].ip = target;
                    }
                }
                Opcode::Loop => {
                    let raw = fetch_u16(&mut ip);
                    let target = code.resolve_jump(self.instruction_ip, raw, false);
                    self.thread.frames[frame_index].ip = target;
                }

                // ----- exceptions -----
                Opcode::PushTry => {
                    let raw = fetch_u16(&mut ip);
                    self.thread.frames[frame_index].ip = ip;
                    let target = code.resolve_jump(self.instruction_ip, raw, true) as u32;
                    self.push(Value::Handler(HandlerEntry {
                        kind: HandlerKind::Try,
                        target,
                    }));
                }
                Opcode::PushWith => {
                    let raw = fetch_u16(&mut ip);
                    self.thread.frames[frame_index].ip = ip;
                    let target = code.resolve_jump(self.instruction_ip, raw, true) as u32;
                    self.push(Value::Handler(HandlerEntry {
                        kind: HandlerKind::With,
                        target,
                    }));
                }
                Opcode::Raise => {
                    self.thread.frames[frame_index].ip = ip;
                    let value = self.pop();
                    let err = vm_try!(self, self.raise_value(value));
                    self.handle_exception(err, floor)?;
                }
                Opcode::RaiseFrom => {
                    self.thread.frames[frame_index].ip = ip;
                    let cause = self.pop();
                    let value = self.pop();
                    let err = vm_try!(self, self.raise_value_from(value, cause));
                    self.handle_exception(err, floor)?;
                }
                Opcode::FilterExcept => {
                    self.thread.frames[frame_index].ip = ip;
                    vm_try!(self, self.filter_except());
                }

                // ----- functions, classes, calls -----
                Opcode::Closure | Opcode::ClosureLong => {
                    let idx = fetch_index(&mut ip, op == Opcode::ClosureLong);
                    let code_value = code.chunk.constants[idx];
                    let Value::Ref(code_id) = code_value else {
                        panic!("CLOSURE constant is not a code object");
                    };
                    let inner = self.heap.code(code_id).share();
                    let mut upvalues: SmallVec<[HeapId; 4]> = SmallVec::new();
                    for _ in 0..inner.upvalue_count {
                        let is_local = fetch_byte(&mut ip) != 0;
                        let lo = fetch_byte(&mut ip);
                        let hi = fetch_byte(&mut ip);
                        let index = usize::from(u16::from_le_bytes([lo, hi]));
                        if is_local {
                            let base = self.thread.frames[frame_index].slots;
                            upvalues.push(self.capture_upvalue(base + index));
                        } else {
                            let closure = self.thread.frames[frame_index].closure;
                            upvalues.push(self.heap.closure(closure).upvalues[index]);
                        }
                    }
                    self.thread.frames[frame_index].ip = ip;
                    // Defaults were pushed before the CLOSURE instruction.
                    let kw_count = usize::from(inner.kw_default_count);
                    let pos_count = usize::from(inner.default_count);
                    let mut kw_defaults = vec![Value::None; kw_count];
                    for slot in (0..kw_count).rev() {
                        kw_defaults[slot] = self.pop();
                    }
                    let mut defaults = vec![Value::None; pos_count];
                    for slot in (0..pos_count).rev() {
                        defaults[slot] = self.pop();
                    }
                    let globals = self.thread.frames[frame_index].globals;
                    let closure = self.heap.allocate(HeapData::Closure(ClosureObject {
                        code: code_id,
                        upvalues,
                        defaults,
                        kw_defaults,
                        globals,
                        attrs: None,
                        annotations: None,
                    }));
                    self.push(Value::Ref(closure));
                }
                Opcode::Class | Opcode::ClassLong => {
                    let idx = fetch_index(&mut ip, op == Opcode::ClassLong);
                    self.thread.frames[frame_index].ip = ip;
                    let name = code.chunk.constants[idx];
                    let Value::Ref(name_id) = name else {
                        panic!("CLASS constant is not a name");
                    };
                    let class = self.new_user_class(name_id);
                    self.push(Value::Ref(class));
                }
                Opcode::Inherit => {
                    self.thread.frames[frame_index].ip = ip;
                    vm_try!(self, self.inherit());
                }
                Opcode::Method | Opcode::MethodLong => {
                    let idx = fetch_index(&mut ip, op == Opcode::MethodLong);
                    self.thread.frames[frame_index].ip = ip;
                    let name = code.chunk.constants[idx];
                    vm_try!(self, self.install_method(name));
                }
                Opcode::Call | Opcode::CallLong => {
                    let argc = fetch_index(&mut ip, op == Opcode::CallLong);
                    self.thread.frames[frame_index].ip = ip;
                    let callee_pos = self.thread.stack.len() - argc - 1;
                    vm_try!(self, self.call_value(callee_pos, argc));
                }
                Opcode::CallMethod | Opcode::CallMethodLong => {
                    let idx = fetch_index(&mut ip, op == Opcode::CallMethodLong);
                    let argc = usize::from(fetch_byte(&mut ip));
                    self.thread.frames[frame_index].ip = ip;
                    let name = code.chunk.constants[idx];
                    vm_try!(self, self.call_method(name, argc));
                }
                Opcode::Return => {
                    self.thread.frames[frame_index].ip = ip;
                    let value = self.frame_return();
                    self.tracer.on_return(self.thread.frames.len());
                    if self.thread.frames.len() == floor {
                        let _ = self.pop();
                        return Ok(value);
                    }
                }
                Opcode::Yield => {
                    self.thread.frames[frame_index].ip = ip;
                    let value = vm_try!(self, self.generator_yield());
                    if self.thread.frames.len() == floor {
                        let _ = self.pop();
                        return Ok(value);
                    }
                }

                // ----- containers -----
                Opcode::BuildTuple | Opcode::BuildTupleLong => {
                    let count = fetch_index(&mut ip, op == Opcode::BuildTupleLong);
                    self.thread.frames[frame_index].ip = ip;
                    let base = self.thread.stack.len() - count;
                    let items: Vec<Value> = self.thread.stack[base..].to_vec();
                    let id = self.heap.allocate_tuple(items);
                    self.thread.stack.truncate(base);
                    self.push(Value::Ref(id));
                }
                Opcode::BuildList | Opcode::BuildListLong => {
                    let count = fetch_index(&mut ip, op == Opcode::BuildListLong);
                    self.thread.frames[frame_index].ip = ip;
                    let base = self.thread.stack.len() - count;
                    let items: Vec<Value> = self.thread.stack[base..].to_vec();
                    let id = self.heap.allocate_list(items);
                    self.thread.stack.truncate(base);
                    self.push(Value::Ref(id));
                }
                Opcode::BuildDict | Opcode::BuildDictLong => {
                    let count = fetch_index(&mut ip, op == Opcode::BuildDictLong);
                    self.thread.frames[frame_index].ip = ip;
                    vm_try!(self, self.build_dict(count));
                }
                Opcode::BuildSet | Opcode::BuildSetLong => {
                    let count = fetch_index(&mut ip, op == Opcode::BuildSetLong);
                    self.thread.frames[frame_index].ip = ip;
                    vm_try!(self, self.build_set(count));
                }
                Opcode::Unpack | Opcode::UnpackLong => {
                    let count = fetch_index(&mut ip, op == Opcode::UnpackLong);
                    self.thread.frames[frame_index].ip = ip;
                    vm_try!(self, self.unpack(count));
                }

                // ----- iteration -----
                Opcode::InvokeIter => {
                    self.thread.frames[frame_index].ip = ip;
                    vm_try!(self, self.invoke_iter());
                }
                Opcode::InvokeNext => {
                    self.thread.frames[frame_index].ip = ip;
                    vm_try!(self, self.invoke_next());
                }
            }

            if self.flags.single_step {
                let action = self.single_step_hook();
                match action {
                    StepAction::Step => {}
                    StepAction::Continue => self.flags.single_step = false,
                    StepAction::Quit => {
                        let err = self.error(ExcKind::SystemError, "debugger requested quit");
                        self.handle_exception(err, floor)?;
                    }
                }
            }
        }
    }

    fn single_step_hook(&mut self) -> StepAction {
        let Some(frame) = self.thread.frames.last() else {
            return StepAction::Continue;
        };
        let line = frame.code.chunk.line_for_offset(self.instruction_ip);
        let trace = TraceFrame {
            function: &frame.code.qualname,
            filename: &frame.code.filename,
            ip: self.instruction_ip,
            line,
            depth: self.thread.frames.len(),
        };
        self.tracer.on_single_step(trace)
    }

    // ==================================================================
    // Frame transitions
    // ==================================================================

    /// Pops the returning frame and delivers its value.
    fn frame_return(&mut self) -> Value {
        let mut value = self.pop();
        let (slots, ret_slot, generator, is_initializer) = {
            let frame = self.thread.frames.last().expect("no frame to return from");
            (frame.slots, frame.ret_slot, frame.generator, frame.is_initializer)
        };
        if is_initializer {
            value = self.thread.stack[slots];
        }
        if let Some(generator) = generator {
            let gen_ = self.heap.generator_mut(generator);
            gen_.state = GeneratorState::Finished;
            gen_.stack.clear();
            // Exhausted generators deliver themselves: the iteration
            // protocol's sentinel convention.
            value = Value::Ref(generator);
        }
        self.close_upvalues(slots);
        self.thread.frames.pop();
        self.thread.stack.truncate(ret_slot);
        self.push(value);
        value
    }

    /// Suspends the current generator frame at a `yield`.
    fn generator_yield(&mut self) -> VmResult<Value> {
        let (slots, ret_slot, resume_ip, generator) = {
            let frame = self.thread.frames.last().expect("no frame to yield from");
            (frame.slots, frame.ret_slot, frame.ip, frame.generator)
        };
        let Some(generator) = generator else {
            return Err(self.error(ExcKind::SystemError, "yield outside of a generator frame"));
        };
        let value = self.pop();
        self.close_upvalues(slots);
        let saved: Vec<Value> = self.thread.stack.drain(slots..).collect();
        let gen_ = self.heap.generator_mut(generator);
        gen_.stack = saved;
        gen_.ip = resume_ip;
        gen_.state = GeneratorState::Suspended;
        self.thread.frames.pop();
        self.thread.stack.truncate(ret_slot);
        self.push(value);
        Ok(value)
    }

    // ==================================================================
    // Globals
    // ==================================================================

    fn globals_of(&self, frame_index: usize) -> HeapId {
        self.thread.frames[frame_index].globals
    }

    fn define_global(&mut self, frame_index: usize, name: Value, value: Value) {
        let Value::Ref(name_id) = name else {
            panic!("global name is not a string");
        };
        let hash = self.heap.cached_hash(name_id);
        let globals = self.globals_of(frame_index);
        self.heap.instance_mut(globals).fields.set_exact(name, hash, value);
    }

    fn get_global(&mut self, frame_index: usize, name: Value) -> VmResult<Value> {
        let Value::Ref(name_id) = name else {
            panic!("global name is not a string");
        };
        let hash = self.heap.cached_hash(name_id);
        let globals = self.globals_of(frame_index);
        if let Some(value) = self.heap.instance(globals).fields.get_exact(&name, hash) {
            return Ok(value);
        }
        let builtins = self.registry.builtins_module;
        if let Some(value) = self.heap.instance(builtins).fields.get_exact(&name, hash) {
            return Ok(value);
        }
        let text = self.heap.as_str(name_id).to_string();
        Err(self.error(ExcKind::NameError, &format!("name '{text}' is not defined")))
    }

    fn set_global(&mut self, frame_index: usize, name: Value) -> VmResult<()> {
        let Value::Ref(name_id) = name else {
            panic!("global name is not a string");
        };
        let hash = self.heap.cached_hash(name_id);
        let globals = self.globals_of(frame_index);
        let value = self.peek(0);
        // Assignment creates module globals freely, like any other store.
        self.heap.instance_mut(globals).fields.set_exact(name, hash, value);
        Ok(())
    }

    fn delete_global(&mut self, frame_index: usize, name: Value) -> VmResult<()> {
        let Value::Ref(name_id) = name else {
            panic!("global name is not a string");
        };
        let hash = self.heap.cached_hash(name_id);
        let globals = self.globals_of(frame_index);
        if self.heap.instance_mut(globals).fields.delete_exact(&name, hash).is_none() {
            let text = self.heap.as_str(name_id).to_string();
            return Err(self.error(ExcKind::NameError, &format!("name '{text}' is not defined")));
        }
        Ok(())
    }

    // ==================================================================
    // Hashing and truthiness with dunder dispatch
    // ==================================================================

    /// Hashes a value, dispatching `__hash__` for instances and caching
    /// the result in the object header.
    pub(crate) fn hash_value(&mut self, value: Value) -> VmResult<u32> {
        if let Value::Ref(id) = value
            && matches!(self.heap.get(id), HeapData::Instance(_))
        {
            if self.heap.has_cached_hash(id) {
                return Ok(self.heap.cached_hash(id));
            }
            let class = self.heap.instance(id).class;
            if let Some(method) = self.heap.class(class).dunders.get(Dunder::Hash) {
                let result = self.call_dunder(method, value, &[])?;
                let Some(raw) = result.as_int() else {
                    return Err(self.error(ExcKind::TypeError, "__hash__ must return an integer"));
                };
                let hash = crate::hashing::hash_int(raw);
                self.heap.set_cached_hash(id, hash);
                return Ok(hash);
            }
        }
        match value_hash(&self.heap, &value) {
            Ok(hash) => Ok(hash),
            Err(unhashable) => Err(self.error(
                ExcKind::TypeError,
                &format!("unhashable type: '{}'", unhashable.0),
            )),
        }
    }

    /// Truthiness with `__bool__`/`__len__` dispatch for instances.
    pub(crate) fn value_truthy(&mut self, value: Value) -> VmResult<bool> {
        if let Value::Ref(id) = value
            && matches!(self.heap.get(id), HeapData::Instance(_))
        {
            let class = self.heap.instance(id).class;
            if let Some(method) = self.heap.class(class).dunders.get(Dunder::Bool) {
                let result = self.call_dunder(method, value, &[])?;
                return Ok(result.truthy(&self.heap));
            }
            if let Some(method) = self.heap.class(class).dunders.get(Dunder::Len) {
                let result = self.call_dunder(method, value, &[])?;
                return Ok(result.as_int().is_some_and(|n| n != 0));
            }
        }
        Ok(value.truthy(&self.heap))
    }

    // ==================================================================
    // Containers
    // ==================================================================

    fn build_dict(&mut self, pairs: usize) -> VmResult<()> {
        let base = self.thread.stack.len() - pairs * 2;
        let dict = self.heap.allocate_dict();
        // Keep the pairs on the stack (rooted) while inserting.
        self.push(Value::Ref(dict));
        for i in 0..pairs {
            let key = self.thread.stack[base + i * 2];
            let value = self.thread.stack[base + i * 2 + 1];
            self.dict_set(dict, key, value)?;
        }
        self.thread.stack.truncate(base);
        self.push(Value::Ref(dict));
        Ok(())
    }

    fn build_set(&mut self, count: usize) -> VmResult<()> {
        let base = self.thread.stack.len() - count;
        let set = self.heap.allocate_set();
        self.push(Value::Ref(set));
        for i in 0..count {
            let item = self.thread.stack[base + i];
            self.set_add(set, item)?;
        }
        self.thread.stack.truncate(base);
        self.push(Value::Ref(set));
        Ok(())
    }

    /// Inserts into a dict, dispatching `__hash__` as needed.
    pub(crate) fn dict_set(&mut self, dict: HeapId, key: Value, value: Value) -> VmResult<()> {
        let hash = self.hash_value(key)?;
        let mut table = self.heap.take_dict_table(dict);
        table.set_with(key, hash, value, |candidate| {
            crate::value::values_same_or_equal(&self.heap, candidate, &key)
        });
        self.heap.put_dict_table(dict, table);
        Ok(())
    }

    /// Looks up a dict key.
    pub(crate) fn dict_get(&mut self, dict: HeapId, key: Value) -> VmResult<Option<Value>> {
        let hash = self.hash_value(key)?;
        let table = &self.heap.dict(dict).table;
        Ok(table.get_with(hash, |candidate| {
            crate::value::values_same_or_equal(&self.heap, candidate, &key)
        }))
    }

    /// Removes a dict key, returning its value.
    pub(crate) fn dict_delete(&mut self, dict: HeapId, key: Value) -> VmResult<Option<Value>> {
        let hash = self.hash_value(key)?;
        let mut table = self.heap.take_dict_table(dict);
        let removed = table.delete_with(hash, |candidate| {
            crate::value::values_same_or_equal(&self.heap, candidate, &key)
        });
        self.heap.put_dict_table(dict, table);
        Ok(removed)
    }

    pub(crate) fn set_add(&mut self, set: HeapId, item: Value) -> VmResult<()> {
        let hash = self.hash_value(item)?;
        let mut table = self.heap.take_set_table(set);
        table.set_with(item, hash, Value::None, |candidate| {
            crate::value::values_same_or_equal(&self.heap, candidate, &item)
        });
        self.heap.put_set_table(set, table);
        Ok(())
    }

    pub(crate) fn set_contains(&mut self, set: HeapId, item: Value) -> VmResult<bool> {
        let hash = self.hash_value(item)?;
        let table = &self.heap.set_obj(set).table;
        Ok(table
            .get_with(hash, |candidate| {
                crate::value::values_same_or_equal(&self.heap, candidate, &item)
            })
            .is_some())
    }

    fn unpack(&mut self, count: usize) -> VmResult<()> {
        let value = self.pop();
        let items: Vec<Value> = match value {
            Value::Ref(id) => match self.heap.get(id) {
                HeapData::Tuple(t) => t.items.clone(),
                HeapData::List(l) => l.items.clone(),
                _ => {
                    // General iterables: drain through the protocol.
                    self.push(value);
                    self.invoke_iter()?;
                    let iterator = self.pop();
                    let mut items = Vec::new();
                    loop {
                        let next = self.call_direct(iterator, &[])?;
                        if next.identical(&iterator) {
                            break;
                        }
                        let depth = self.heap.scratch_push(next);
                        let _ = depth;
                        items.push(next);
                        if items.len() > count {
                            break;
                        }
                    }
                    self.heap.scratch_truncate(self.heap.scratch_len() - items.len());
                    items
                }
            },
            _ => {
                let kind = value.type_name(&self.heap);
                return Err(self.error(ExcKind::TypeError, &format!("cannot unpack '{kind}' object")));
            }
        };
        if items.len() != count {
            return Err(self.error(
                ExcKind::ValueError,
                &format!("expected {count} values to unpack, got {}", items.len()),
            ));
        }
        for item in items {
            self.push(item);
        }
        Ok(())
    }

    // ==================================================================
    // Iteration protocol
    // ==================================================================

    /// Replaces the top of stack with its iterator.
    pub(crate) fn invoke_iter(&mut self) -> VmResult<()> {
        let value = self.peek(0);
        let Value::Ref(id) = value else {
            let kind = value.type_name(&self.heap);
            return Err(self.error(ExcKind::TypeError, &format!("'{kind}' object is not iterable")));
        };
        let iterator = match self.heap.get(id) {
            HeapData::List(_) => NativeIterObject::List { list: id, index: 0 },
            HeapData::Tuple(_) => NativeIterObject::Tuple { tuple: id, index: 0 },
            HeapData::Str(_) => NativeIterObject::Str { string: id, index: 0 },
            HeapData::Bytes(_) => NativeIterObject::Bytes { bytes: id, index: 0 },
            HeapData::Dict(_) => NativeIterObject::DictKeys { dict: id, index: 0 },
            HeapData::Set(_) => NativeIterObject::Set { set: id, index: 0 },
            HeapData::Range(range) => NativeIterObject::Range {
                current: range.start,
                stop: range.stop,
                step: range.step,
            },
            HeapData::Generator(_) | HeapData::NativeIter(_) => return Ok(()),
            HeapData::Instance(instance) => {
                let class = instance.class;
                let Some(method) = self.heap.class(class).dunders.get(Dunder::Iter) else {
                    let kind = value.type_name(&self.heap);
                    return Err(self.error(ExcKind::TypeError, &format!("'{kind}' object is not iterable")));
                };
                let result = self.call_dunder(method, value, &[])?;
                self.set_top(result);
                return Ok(());
            }
            _ => {
                let kind = value.type_name(&self.heap);
                return Err(self.error(ExcKind::TypeError, &format!("'{kind}' object is not iterable")));
            }
        };
        let iter_id = self.heap.allocate(HeapData::NativeIter(iterator));
        self.set_top(Value::Ref(iter_id));
        Ok(())
    }

    /// Calls the iterator on top of the stack for its next value.
    ///
    /// Built-in iterators advance inline; everything else goes through the
    /// ordinary call protocol (iterators are callables in this language).
    fn invoke_next(&mut self) -> VmResult<()> {
        let value = self.peek(0);
        if let Value::Ref(id) = value
            && matches!(self.heap.get(id), HeapData::NativeIter(_))
        {
            let next = self.advance_native_iter(id);
            self.set_top(next);
            return Ok(());
        }
        let callee_pos = self.thread.stack.len() - 1;
        self.call_value(callee_pos, 0)?;
        Ok(())
    }

    /// Steps a built-in iterator; exhaustion returns the iterator itself.
    ///
    /// The cursor advances even when the step comes up empty, so repeated
    /// calls on an exhausted iterator keep returning the sentinel.
    fn advance_native_iter(&mut self, id: HeapId) -> Value {
        let exhausted = Value::Ref(id);
        let state = {
            let HeapData::NativeIter(iter) = self.heap.get(id) else {
                unreachable!("checked by caller");
            };
            iter.clone()
        };
        let (result, next_state) = match state {
            NativeIterObject::Range { current, stop, step } => {
                let done = if step >= 0 { current >= stop } else { current <= stop };
                if done {
                    (exhausted, NativeIterObject::Range { current, stop, step })
                } else {
                    (
                        Value::Int(current),
                        NativeIterObject::Range {
                            current: current + step,
                            stop,
                            step,
                        },
                    )
                }
            }
            NativeIterObject::List { list, index } => {
                let item = self.heap.list(list).items.get(index).copied();
                (item.unwrap_or(exhausted), NativeIterObject::List { list, index: index + 1 })
            }
            NativeIterObject::Tuple { tuple, index } => {
                let item = self.heap.tuple(tuple).items.get(index).copied();
                (
                    item.unwrap_or(exhausted),
                    NativeIterObject::Tuple { tuple, index: index + 1 },
                )
            }
            NativeIterObject::Str { string, index } => {
                let item = match self.heap.str_object(string).char_at(index) {
                    Some(ch) => {
                        let mut buf = [0u8; 4];
                        let encoded = ch.encode_utf8(&mut buf).to_string();
                        Value::Ref(self.heap.intern(&encoded))
                    }
                    None => exhausted,
                };
                (item, NativeIterObject::Str { string, index: index + 1 })
            }
            NativeIterObject::Bytes { bytes, index } => {
                let item = self
                    .heap
                    .bytes(bytes)
                    .data
                    .get(index)
                    .map_or(exhausted, |byte| Value::Int(i64::from(*byte)));
                (item, NativeIterObject::Bytes { bytes, index: index + 1 })
            }
            NativeIterObject::DictKeys { dict, index } => {
                let item = self.heap.dict(dict).table.nth(index).map_or(exhausted, |(k, _)| k);
                (item, NativeIterObject::DictKeys { dict, index: index + 1 })
            }
            NativeIterObject::DictValues { dict, index } => {
                let item = self.heap.dict(dict).table.nth(index).map_or(exhausted, |(_, v)| v);
                (item, NativeIterObject::DictValues { dict, index: index + 1 })
            }
            NativeIterObject::DictItems { dict, index } => {
                let item = match self.heap.dict(dict).table.nth(index) {
                    Some((key, value)) => Value::Ref(self.heap.allocate_tuple(vec![key, value])),
                    None => exhausted,
                };
                (item, NativeIterObject::DictItems { dict, index: index + 1 })
            }
            NativeIterObject::Set { set, index } => {
                let item = self.heap.set_obj(set).table.nth(index).map_or(exhausted, |(k, _)| k);
                (item, NativeIterObject::Set { set, index: index + 1 })
            }
        };
        *self.heap.get_mut(id) = HeapData::NativeIter(next_state);
        result
    }

    // ==================================================================
    // Garbage collection
    // ==================================================================

    /// Runs a full collection with the VM's root set.
    pub fn run_gc(&mut self) {
        let mut roots: Vec<HeapId> = Vec::with_capacity(self.thread.stack.len() + 64);
        for value in &self.thread.stack {
            if let Value::Ref(id) = value {
                roots.push(*id);
            }
        }
        for frame in &self.thread.frames {
            roots.push(frame.closure);
            roots.push(frame.code_id);
            roots.push(frame.globals);
            if let Some(generator) = frame.generator {
                roots.push(generator);
            }
        }
        for open in &self.thread.open_upvalues {
            roots.push(open.upvalue);
        }
        if let Some(Value::Ref(id)) = self.thread.current_exception {
            roots.push(id);
        }
        for (key, value) in self.modules.iter() {
            if let Value::Ref(id) = key {
                roots.push(*id);
            }
            if let Value::Ref(id) = value {
                roots.push(*id);
            }
        }
        self.registry.collect_roots(&mut roots);
        self.heap.collect_garbage(roots);
    }
}
