//! Exception raising, unwinding, and traceback rendering.
//!
//! `PUSH_TRY`/`PUSH_WITH` leave [`Value::Handler`] markers on the operand
//! stack. Raising walks the stack from the top for the nearest marker
//! within the current run's frame window, pops the frames above it
//! (closing their upvalues and recording traceback rows), truncates the
//! stack to the marker, pushes the exception, and jumps to the handler
//! body. With no marker the error propagates out of [`Vm::run_until`],
//! where the embedding caller observes it.

use crate::{
    compiler::CompileError,
    exceptions::{ExcKind, VmError, VmResult},
    heap::{HeapData, HeapId},
    value::Value,
    vm::Vm,
};

impl Vm {
    /// Builds (without raising) an exception of a builtin kind.
    ///
    /// The conventional use is `return Err(self.error(...))`.
    pub(crate) fn error(&mut self, kind: ExcKind, message: &str) -> VmError {
        let class = self.registry.exception_class(kind);
        let instance = self.heap.allocate_instance(class);
        if !message.is_empty() {
            let msg = self.heap.intern(message);
            let arg_name = self.registry.name_arg;
            let hash = self.heap.cached_hash(arg_name);
            self.heap
                .instance_mut(instance)
                .fields
                .set_exact(Value::Ref(arg_name), hash, Value::Ref(msg));
        }
        self.ensure_traceback(instance);
        VmError::new(Value::Ref(instance))
    }

    /// Converts a compile failure into a `SyntaxError`.
    pub(crate) fn syntax_error(&mut self, err: &CompileError) -> VmError {
        self.error(ExcKind::SyntaxError, &format!("{} (line {})", err.message, err.line))
    }

    /// `RAISE`: validates and wraps the raised value.
    ///
    /// Classes are instantiated with no arguments; `None` re-raises the
    /// exception currently being handled.
    pub(crate) fn raise_value(&mut self, value: Value) -> VmResult<VmError> {
        match value {
            Value::None => match self.thread.current_exception {
                Some(exc) => Ok(VmError::new(exc)),
                None => Ok(self.error(ExcKind::TypeError, "no active exception to re-raise")),
            },
            Value::Ref(id) => match self.heap.get(id) {
                HeapData::Class(_) => {
                    let exc = self.call_direct(value, &[])?;
                    self.raise_value(exc)
                }
                HeapData::Instance(_) => {
                    let base = self.registry.exception_class(ExcKind::BaseException);
                    if self.isinstance(value, base) {
                        self.ensure_traceback(id);
                        Ok(VmError::new(value))
                    } else {
                        Ok(self.error(ExcKind::TypeError, "exceptions must derive from BaseException"))
                    }
                }
                _ => Ok(self.error(ExcKind::TypeError, "exceptions must derive from BaseException")),
            },
            _ => Ok(self.error(ExcKind::TypeError, "exceptions must derive from BaseException")),
        }
    }

    /// `RAISE_FROM`: as `RAISE`, recording the cause on the exception.
    pub(crate) fn raise_value_from(&mut self, value: Value, cause: Value) -> VmResult<VmError> {
        let err = self.raise_value(value)?;
        if let Value::Ref(id) = err.exception {
            let cause_name = self.registry.name_cause;
            let hash = self.heap.cached_hash(cause_name);
            self.heap
                .instance_mut(id)
                .fields
                .set_exact(Value::Ref(cause_name), hash, cause);
        }
        Ok(err)
    }

    /// `FILTER_EXCEPT`: stack `[exc, type]` becomes a match flag.
    pub(crate) fn filter_except(&mut self) -> VmResult<()> {
        let ty = self.pop();
        let exc = self.pop();
        let matched = self.exception_matches(exc, ty)?;
        self.push(Value::Bool(matched));
        Ok(())
    }

    fn exception_matches(&mut self, exc: Value, ty: Value) -> VmResult<bool> {
        match ty {
            Value::Ref(id) => match self.heap.get(id) {
                HeapData::Class(_) => Ok(self.isinstance(exc, id)),
                HeapData::Tuple(t) => {
                    let options = t.items.clone();
                    for option in options {
                        if self.exception_matches(exc, option)? {
                            return Ok(true);
                        }
                    }
                    Ok(false)
                }
                _ => Err(self.error(
                    ExcKind::TypeError,
                    "catching classes that do not inherit from BaseException is not allowed",
                )),
            },
            _ => Err(self.error(
                ExcKind::TypeError,
                "catching classes that do not inherit from BaseException is not allowed",
            )),
        }
    }

    /// Unwinds toward the nearest handler within this run's frame window.
    ///
    /// Returns `Ok(())` when a handler took over (the dispatch loop
    /// continues) and `Err` when the exception escapes past `floor`.
    pub(crate) fn handle_exception(&mut self, err: VmError, floor: usize) -> VmResult<()> {
        let exc = err.exception;
        if self.thread.frames.len() <= floor {
            self.thread.current_exception = Some(exc);
            self.thread.has_exception = true;
            return Err(err);
        }

        // The faulting frame's traceback row uses the precise opcode
        // offset; deeper frames use their saved return addresses.
        let top_code = self.thread.frames[self.thread.frames.len() - 1].code_id;
        self.push_traceback(exc, top_code, self.instruction_ip);

        let lower_bound = self.thread.frames[floor].slots;
        let handler = self.thread.stack[lower_bound..]
            .iter()
            .rposition(|value| matches!(value, Value::Handler(_)))
            .map(|offset| lower_bound + offset);

        match handler {
            Some(position) => {
                let Value::Handler(entry) = self.thread.stack[position] else {
                    unreachable!("handler probe returned a non-handler");
                };
                let frame_index = self
                    .thread
                    .frames
                    .iter()
                    .rposition(|frame| frame.slots <= position)
                    .expect("handler below every frame");
                let mut first = true;
                while self.thread.frames.len() - 1 > frame_index {
                    self.record_and_pop_frame(exc, first);
                    first = false;
                }
                self.thread.stack.truncate(position);
                self.push(exc);
                self.thread.frames[frame_index].ip = entry.target as usize;
                self.thread.current_exception = Some(exc);
                Ok(())
            }
            None => {
                let entry_ret = self.thread.frames[floor].ret_slot;
                let mut first = true;
                while self.thread.frames.len() > floor {
                    self.record_and_pop_frame(exc, first);
                    first = false;
                }
                self.thread.stack.truncate(entry_ret);
                self.thread.current_exception = Some(exc);
                self.thread.has_exception = true;
                Err(err)
            }
        }
    }

    /// Pops the top frame during unwinding, recording its traceback row
    /// unless it was already recorded as the faulting frame.
    fn record_and_pop_frame(&mut self, exc: Value, already_recorded: bool) {
        let frame = self.thread.frames.last().expect("no frame to unwind");
        let code_id = frame.code_id;
        let ip = frame.ip.saturating_sub(1);
        let slots = frame.slots;
        // A finished generator frame must not stay marked running.
        if let Some(generator) = frame.generator {
            let gen_ = self.heap.generator_mut(generator);
            gen_.state = crate::heap::GeneratorState::Finished;
            gen_.stack.clear();
        }
        if !already_recorded {
            self.push_traceback(exc, code_id, ip);
        }
        self.close_upvalues(slots);
        self.thread.frames.pop();
    }

    /// Guarantees the exception instance carries a traceback list.
    fn ensure_traceback(&mut self, instance: HeapId) {
        let tb_name = self.registry.name_traceback;
        let hash = self.heap.cached_hash(tb_name);
        let existing = self
            .heap
            .instance(instance)
            .fields
            .get_exact(&Value::Ref(tb_name), hash);
        if existing.is_none() {
            let list = self.heap.allocate_list(Vec::new());
            self.heap
                .instance_mut(instance)
                .fields
                .set_exact(Value::Ref(tb_name), hash, Value::Ref(list));
        }
    }

    /// Appends a `(code, offset)` row to the exception's traceback.
    fn push_traceback(&mut self, exc: Value, code_id: HeapId, ip: usize) {
        let Value::Ref(instance) = exc else {
            return;
        };
        if !matches!(self.heap.get(instance), HeapData::Instance(_)) {
            return;
        }
        self.ensure_traceback(instance);
        let tb_name = self.registry.name_traceback;
        let hash = self.heap.cached_hash(tb_name);
        let Some(Value::Ref(list)) = self
            .heap
            .instance(instance)
            .fields
            .get_exact(&Value::Ref(tb_name), hash)
        else {
            return;
        };
        let row = self
            .heap
            .allocate_tuple(vec![Value::Ref(code_id), Value::Int(ip as i64)]);
        if let HeapData::List(entries) = self.heap.get_mut(list) {
            entries.items.push(Value::Ref(row));
        }
    }

    /// Renders a traceback in call order with source lines when the file
    /// is readable, ending with `Class: message`.
    pub fn format_traceback(&mut self, err: &VmError) -> String {
        let exc = err.value();
        let mut out = String::new();
        if let Value::Ref(instance) = exc
            && matches!(self.heap.get(instance), HeapData::Instance(_))
        {
            let tb_name = self.registry.name_traceback;
            let hash = self.heap.cached_hash(tb_name);
            let rows: Vec<(HeapId, usize)> = match self
                .heap
                .instance(instance)
                .fields
                .get_exact(&Value::Ref(tb_name), hash)
            {
                Some(Value::Ref(list)) => match self.heap.get(list) {
                    HeapData::List(entries) => entries
                        .items
                        .iter()
                        .filter_map(|row| {
                            let Value::Ref(tuple) = row else { return None };
                            let HeapData::Tuple(t) = self.heap.get(*tuple) else {
                                return None;
                            };
                            let Value::Ref(code) = t.items[0] else { return None };
                            let Value::Int(ip) = t.items[1] else { return None };
                            Some((code, ip as usize))
                        })
                        .collect(),
                    _ => Vec::new(),
                },
                _ => Vec::new(),
            };
            if !rows.is_empty() {
                out.push_str("Traceback (most recent call last):\n");
                // Rows were appended innermost first; print in call order.
                for (code_id, ip) in rows.iter().rev() {
                    let code = self.heap.code(*code_id).share();
                    let line = code.chunk.line_for_offset(*ip);
                    out.push_str(&format!(
                        "  File \"{}\", line {}, in {}\n",
                        code.filename, line, code.qualname
                    ));
                    if let Some(text) = read_source_line(&code.filename, line) {
                        out.push_str(&format!("    {}\n", text.trim()));
                    }
                }
            }
        }
        out.push_str(&self.exception_line(exc));
        out.push('\n');
        out
    }

    /// The final `Class: message` line of a traceback.
    pub(crate) fn exception_line(&mut self, exc: Value) -> String {
        let class = self.class_of(exc);
        let class_name = self.heap.as_str(self.heap.class(class).name).to_string();
        let message = self.exception_message(exc);
        match message {
            Some(message) if !message.is_empty() => format!("{class_name}: {message}"),
            _ => class_name,
        }
    }

    /// The exception's message argument rendered as text.
    pub(crate) fn exception_message(&mut self, exc: Value) -> Option<String> {
        let Value::Ref(instance) = exc else {
            return None;
        };
        if !matches!(self.heap.get(instance), HeapData::Instance(_)) {
            return None;
        }
        let arg_name = self.registry.name_arg;
        let hash = self.heap.cached_hash(arg_name);
        let arg = self
            .heap
            .instance(instance)
            .fields
            .get_exact(&Value::Ref(arg_name), hash)?;
        match self.str_value(arg) {
            Ok(text) => Some(text),
            Err(_) => Some(String::from("<unprintable exception argument>")),
        }
    }
}

/// Reads one line of a source file for traceback display.
fn read_source_line(filename: &str, line: u32) -> Option<String> {
    if line == 0 {
        return None;
    }
    let contents = std::fs::read_to_string(filename).ok()?;
    contents.lines().nth(line as usize - 1).map(str::to_string)
}
