//! Bytecode disassembler.
//!
//! Renders a code object's chunk as one instruction per line with offsets,
//! source lines, opcode names, and decoded operands, then recurses into
//! nested code objects found in the constant pool. Used by tests and the
//! CLI's `--dis` flag.

use std::fmt::Write as _;

use crate::{
    chunk::CodeObject,
    heap::{Heap, HeapData},
    opcode::{Opcode, OperandLayout},
    value::Value,
    vm::Vm,
};

impl Vm {
    /// Compiles a source string and returns its disassembly listing.
    pub fn disassemble(&mut self, source: &str, name: &str) -> Result<String, crate::exceptions::VmError> {
        let code_id = match crate::compiler::compile(&mut self.heap, source, name) {
            Ok(id) => id,
            Err(err) => return Err(self.syntax_error(&err)),
        };
        let code = self.heap.code(code_id).share();
        Ok(disassemble_code(&self.heap, &code))
    }
}

/// Renders a code object and, recursively, every code object it holds.
pub(crate) fn disassemble_code(heap: &Heap, code: &CodeObject) -> String {
    let mut out = String::new();
    let mut nested = Vec::new();
    let _ = writeln!(out, "== {} ==", code.qualname);
    let mut offset = 0usize;
    let bytecode = &code.chunk.code;
    let mut last_line = u32::MAX;
    while offset < bytecode.len() {
        let line = code.chunk.line_for_offset(offset);
        if line == last_line {
            let _ = write!(out, "{offset:04}      | ");
        } else {
            let _ = write!(out, "{offset:04} {line:5} ");
            last_line = line;
        }
        let Some(op) = Opcode::from_repr(bytecode[offset]) else {
            let _ = writeln!(out, "?? {:#04x}", bytecode[offset]);
            offset += 1;
            continue;
        };
        offset += 1;
        match op.layout() {
            OperandLayout::None => {
                let _ = writeln!(out, "{}", op.name());
            }
            OperandLayout::Byte => {
                let operand = usize::from(bytecode[offset]);
                offset += 1;
                let _ = writeln!(out, "{:<18} {}{}", op.name(), operand, operand_note(heap, code, op, operand));
            }
            OperandLayout::Wide => {
                let operand = usize::from(bytecode[offset])
                    | (usize::from(bytecode[offset + 1]) << 8)
                    | (usize::from(bytecode[offset + 2]) << 16);
                offset += 3;
                let _ = writeln!(out, "{:<18} {}{}", op.name(), operand, operand_note(heap, code, op, operand));
            }
            OperandLayout::Jump => {
                let raw = u16::from_le_bytes([bytecode[offset], bytecode[offset + 1]]);
                offset += 2;
                let target = code.resolve_jump(offset - 3, raw, op.jumps_forward());
                let _ = writeln!(out, "{:<18} -> {target:04}", op.name());
            }
            OperandLayout::ClosureByte | OperandLayout::ClosureWide => {
                let wide = op.layout() == OperandLayout::ClosureWide;
                let operand = if wide {
                    let value = usize::from(bytecode[offset])
                        | (usize::from(bytecode[offset + 1]) << 8)
                        | (usize::from(bytecode[offset + 2]) << 16);
                    offset += 3;
                    value
                } else {
                    let value = usize::from(bytecode[offset]);
                    offset += 1;
                    value
                };
                let constant = code.chunk.constants[operand];
                let mut captures = 0usize;
                if let Value::Ref(inner_id) = constant
                    && let HeapData::Code(inner) = heap.get(inner_id)
                {
                    captures = usize::from(inner.upvalue_count);
                    nested.push(inner.share());
                }
                let _ = write!(out, "{:<18} {}{}", op.name(), operand, operand_note(heap, code, op, operand));
                for _ in 0..captures {
                    let is_local = bytecode[offset] != 0;
                    let index = u16::from_le_bytes([bytecode[offset + 1], bytecode[offset + 2]]);
                    offset += 3;
                    let _ = write!(out, " [{} {index}]", if is_local { "local" } else { "upvalue" });
                }
                let _ = writeln!(out);
            }
            OperandLayout::MethodByte | OperandLayout::MethodWide => {
                let wide = op.layout() == OperandLayout::MethodWide;
                let operand = if wide {
                    let value = usize::from(bytecode[offset])
                        | (usize::from(bytecode[offset + 1]) << 8)
                        | (usize::from(bytecode[offset + 2]) << 16);
                    offset += 3;
                    value
                } else {
                    let value = usize::from(bytecode[offset]);
                    offset += 1;
                    value
                };
                let argc = bytecode[offset];
                offset += 1;
                let _ = writeln!(
                    out,
                    "{:<18} {}{} ({argc} args)",
                    op.name(),
                    operand,
                    operand_note(heap, code, op, operand)
                );
            }
        }
    }
    for inner in nested {
        out.push('\n');
        out.push_str(&disassemble_code(heap, &inner));
    }
    out
}

/// A parenthesized rendering of what an operand refers to.
fn operand_note(heap: &Heap, code: &CodeObject, op: Opcode, operand: usize) -> String {
    use Opcode as O;
    match op {
        O::Constant
        | O::ConstantLong
        | O::DefineGlobal
        | O::DefineGlobalLong
        | O::GetGlobal
        | O::GetGlobalLong
        | O::SetGlobal
        | O::SetGlobalLong
        | O::DelGlobal
        | O::DelGlobalLong
        | O::GetProperty
        | O::GetPropertyLong
        | O::SetProperty
        | O::SetPropertyLong
        | O::DelProperty
        | O::DelPropertyLong
        | O::GetSuper
        | O::GetSuperLong
        | O::Class
        | O::ClassLong
        | O::Method
        | O::MethodLong
        | O::Closure
        | O::ClosureLong
        | O::CallMethod
        | O::CallMethodLong => {
            format!(" ({})", constant_summary(heap, code.chunk.constants[operand]))
        }
        O::GetLocal | O::GetLocalLong | O::SetLocal | O::SetLocalLong => {
            match code.local_name(operand as u16) {
                Some(name) => format!(" ({})", heap.as_str(name)),
                None => String::new(),
            }
        }
        _ => String::new(),
    }
}

/// A short, VM-free rendering of a constant.
fn constant_summary(heap: &Heap, value: Value) -> String {
    match value {
        Value::None => String::from("None"),
        Value::Bool(b) => String::from(if b { "True" } else { "False" }),
        Value::Int(n) => n.to_string(),
        Value::Float(f) => crate::builtins::functions::format_float(f),
        Value::Kwargs(n) => format!("kwargs {n}"),
        Value::Handler(_) => String::from("handler"),
        Value::Ref(id) => match heap.get(id) {
            HeapData::Str(s) => format!("{:?}", s.as_str()),
            HeapData::Bytes(b) => format!("bytes[{}]", b.data.len()),
            HeapData::Code(c) => format!("<code {}>", c.qualname),
            other => format!("<{}>", other.type_name()),
        },
    }
}
