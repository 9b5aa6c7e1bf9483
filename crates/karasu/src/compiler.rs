//! Single-pass bytecode compiler.
//!
//! A recursive-descent statement parser layered over a Pratt expression
//! core. There is no AST: every parse action emits bytecode straight into
//! the current code object's chunk. Lexical scope is a stack of
//! [`FunctionCompiler`] records; name resolution walks locals, then
//! enclosing functions (creating upvalue descriptors), then falls back to
//! globals by name.
//!
//! Two places re-read source text instead of buffering: comprehensions
//! rewind the scanner to re-parse the head expression once the iteration
//! scaffolding is emitted, and `finally` blocks are compiled twice (normal
//! path and exception path) by rewinding across the block.

use std::rc::Rc;

use smallvec::SmallVec;

use crate::{
    chunk::{
        CODE_COLLECTS_ARGS, CODE_COLLECTS_KWARGS, CODE_IS_COROUTINE, CODE_IS_GENERATOR, Chunk, CodeObject, LocalName,
        OVERLONG_JUMP_SENTINEL, OverlongJump,
    },
    heap::{Heap, HeapData, HeapId},
    opcode::Opcode,
    scanner::{Scanner, ScannerState, Token, TokenType},
    value::Value,
};

/// Kwargs-pair pseudo-name marking an `*iterable` argument.
pub(crate) const KWARGS_STAR: u32 = u32::MAX - 1;
/// Kwargs-pair pseudo-name marking a `**mapping` argument.
pub(crate) const KWARGS_DOUBLE_STAR: u32 = u32::MAX - 2;

/// A compile failure, reported as a `SyntaxError` to the embedder.
#[derive(Debug, Clone)]
pub struct CompileError {
    pub message: String,
    pub line: u32,
}

type CRes<T> = Result<T, CompileError>;

/// What kind of function body a [`FunctionCompiler`] is building.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionType {
    Module,
    Function,
    Method,
    Initializer,
    Lambda,
}

/// One local variable slot.
#[derive(Debug)]
struct Local<'src> {
    name: &'src str,
    depth: u32,
    captured: bool,
}

/// One upvalue descriptor: where the enclosing function finds the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct UpvalueDesc {
    index: u16,
    is_local: bool,
}

/// An enclosing loop, for `break`/`continue`.
#[derive(Debug)]
struct LoopContext {
    start: usize,
    /// Scope depth at the loop body; early exits pop locals deeper than it.
    depth: u32,
    /// Offsets of `break` jumps awaiting the loop end.
    breaks: Vec<usize>,
}

/// Per-function compilation state.
struct FunctionCompiler<'src> {
    chunk: Chunk,
    ty: FunctionType,
    name: HeapId,
    qualname: String,
    locals: Vec<Local<'src>>,
    max_locals: usize,
    upvalues: Vec<UpvalueDesc>,
    scope_depth: u32,
    loops: Vec<LoopContext>,
    overlong_jumps: Vec<OverlongJump>,
    local_names: Vec<LocalName>,
    positional: Vec<HeapId>,
    default_count: u8,
    keyword_only: Vec<HeapId>,
    kw_default_count: u8,
    flags: u8,
    docstring: Option<Value>,
}

impl<'src> FunctionCompiler<'src> {
    fn new(ty: FunctionType, name: HeapId, qualname: String) -> Self {
        Self {
            chunk: Chunk::new(),
            ty,
            name,
            qualname,
            locals: Vec::new(),
            max_locals: 0,
            upvalues: Vec::new(),
            scope_depth: 0,
            loops: Vec::new(),
            overlong_jumps: Vec::new(),
            local_names: Vec::new(),
            positional: Vec::new(),
            default_count: 0,
            keyword_only: Vec::new(),
            kw_default_count: 0,
            flags: 0,
            docstring: None,
        }
    }
}

/// Operator precedence, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Prec {
    None,
    /// `a if c else b`
    Ternary,
    Or,
    And,
    Not,
    Comparison,
    BitOr,
    BitXor,
    BitAnd,
    Shift,
    Term,
    Factor,
    Unary,
    Power,
    Call,
}

impl Prec {
    fn one_higher(self) -> Self {
        match self {
            Self::None => Self::Ternary,
            Self::Ternary => Self::Or,
            Self::Or => Self::And,
            Self::And => Self::Not,
            Self::Not => Self::Comparison,
            Self::Comparison => Self::BitOr,
            Self::BitOr => Self::BitXor,
            Self::BitXor => Self::BitAnd,
            Self::BitAnd => Self::Shift,
            Self::Shift => Self::Term,
            Self::Term => Self::Factor,
            Self::Factor => Self::Unary,
            Self::Unary => Self::Power,
            Self::Power | Self::Call => Self::Call,
        }
    }
}

/// Saved parse position: scanner state plus the two-token window.
#[derive(Debug, Clone, Copy)]
struct Checkpoint<'src> {
    scanner: ScannerState,
    current: Token<'src>,
    previous: Token<'src>,
}

/// Which container a comprehension accumulates into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ComprehensionKind {
    List,
    Set,
    Dict,
    Generator,
}

impl ComprehensionKind {
    fn hidden_name(self) -> &'static str {
        match self {
            Self::List => "<listcomp>",
            Self::Set => "<setcomp>",
            Self::Dict => "<dictcomp>",
            Self::Generator => "<genexpr>",
        }
    }
}

/// The compiler. One instance compiles one module.
pub(crate) struct Compiler<'src, 'h> {
    heap: &'h mut Heap,
    scanner: Scanner<'src>,
    current: Token<'src>,
    previous: Token<'src>,
    functions: Vec<FunctionCompiler<'src>>,
    filename: Rc<str>,
}

/// Compiles a module body, returning the heap id of its code object.
pub(crate) fn compile(heap: &mut Heap, source: &str, filename: &str) -> Result<HeapId, CompileError> {
    let roots_mark = heap.compiler_roots_len();
    let result = Compiler::new(heap, source, filename).run();
    heap.compiler_roots_truncate(roots_mark);
    result
}

impl<'src, 'h> Compiler<'src, 'h> {
    fn new(heap: &'h mut Heap, source: &'src str, filename: &str) -> Self {
        let placeholder = Token {
            ty: TokenType::Eof,
            text: "",
            line: 1,
            width: 0,
            note: None,
        };
        let module_name = heap.intern("<module>");
        heap.push_compiler_root(module_name);
        let mut functions = Vec::new();
        functions.push(FunctionCompiler::new(FunctionType::Module, module_name, "<module>".into()));
        Self {
            heap,
            scanner: Scanner::new(source),
            current: placeholder,
            previous: placeholder,
            functions,
            filename: filename.into(),
        }
    }

    fn run(mut self) -> CRes<HeapId> {
        self.advance()?;
        while self.current.ty != TokenType::Eof {
            self.consume(TokenType::Indentation, "expected start of line")?;
            if self.previous.width != 0 {
                return Err(self.error("unexpected indentation at module level"));
            }
            self.statement(0)?;
        }
        self.emit_op(Opcode::None);
        self.emit_op(Opcode::Return);
        let function = self.functions.pop().expect("module compiler missing");
        Ok(self.finish_function(function))
    }

    // ==================================================================
    // Token plumbing
    // ==================================================================

    fn advance(&mut self) -> CRes<()> {
        self.previous = self.current;
        let token = self.scanner.next_token();
        if token.ty == TokenType::Error {
            return Err(CompileError {
                message: token.note.unwrap_or("scan error").to_string(),
                line: token.line,
            });
        }
        self.current = token;
        Ok(())
    }

    fn check(&self, ty: TokenType) -> bool {
        self.current.ty == ty
    }

    fn match_token(&mut self, ty: TokenType) -> CRes<bool> {
        if self.check(ty) {
            self.advance()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn consume(&mut self, ty: TokenType, message: &str) -> CRes<()> {
        if self.check(ty) {
            self.advance()
        } else {
            Err(self.error(message))
        }
    }

    fn error(&self, message: &str) -> CompileError {
        CompileError {
            message: message.to_string(),
            line: self.current.line,
        }
    }

    fn checkpoint(&self) -> Checkpoint<'src> {
        Checkpoint {
            scanner: self.scanner.save(),
            current: self.current,
            previous: self.previous,
        }
    }

    fn rewind(&mut self, checkpoint: Checkpoint<'src>) {
        self.scanner.restore(checkpoint.scanner);
        self.current = checkpoint.current;
        self.previous = checkpoint.previous;
    }

    /// Peeks one raw token past the lookahead without consuming anything.
    fn peek_second(&mut self) -> TokenType {
        let token = self.scanner.next_token();
        let ty = token.ty;
        self.scanner.push_back(token);
        ty
    }

    // ==================================================================
    // Emission
    // ==================================================================

    fn func(&mut self) -> &mut FunctionCompiler<'src> {
        self.functions.last_mut().expect("no active function compiler")
    }

    fn func_ref(&self) -> &FunctionCompiler<'src> {
        self.functions.last().expect("no active function compiler")
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.func().chunk.write(byte, line);
    }

    fn emit_op(&mut self, op: Opcode) {
        self.emit_byte(op as u8);
    }

    /// Emits an indexed opcode, widening to the `_LONG` form when needed.
    fn emit_indexed(&mut self, op: Opcode, index: usize) {
        if index < 256 {
            self.emit_op(op);
            self.emit_byte(index as u8);
        } else {
            assert!(index < 1 << 24, "operand index exceeds 24 bits");
            self.emit_op(op.wide());
            self.emit_byte((index & 0xff) as u8);
            self.emit_byte(((index >> 8) & 0xff) as u8);
            self.emit_byte(((index >> 16) & 0xff) as u8);
        }
    }

    fn make_constant(&mut self, value: Value) -> usize {
        self.func().chunk.add_constant(value)
    }

    fn emit_constant(&mut self, value: Value) {
        let idx = self.make_constant(value);
        self.emit_indexed(Opcode::Constant, idx);
    }

    /// Interns a name and returns its constant-pool index.
    fn identifier_constant(&mut self, text: &str) -> usize {
        let id = self.heap.intern(text);
        self.heap.push_compiler_root(id);
        self.make_constant(Value::Ref(id))
    }

    fn intern_rooted(&mut self, text: &str) -> HeapId {
        let id = self.heap.intern(text);
        self.heap.push_compiler_root(id);
        id
    }

    /// Emits a jump with a placeholder operand; returns the opcode offset.
    fn emit_jump(&mut self, op: Opcode) -> usize {
        self.emit_op(op);
        let at = self.func().chunk.code.len() - 1;
        self.emit_byte(0);
        self.emit_byte(0);
        at
    }

    /// Patches a forward jump to land at the current offset.
    ///
    /// Distances past 16 bits divert through the overlong table: the
    /// in-stream operand becomes the sentinel and the real target is
    /// recorded against the jump's own offset.
    fn patch_jump(&mut self, at: usize) {
        let target = self.func().chunk.code.len();
        let distance = target - (at + 3);
        if distance >= usize::from(OVERLONG_JUMP_SENTINEL) {
            let entry = OverlongJump {
                instruction: at as u32,
                target: target as u32,
            };
            let func = self.func();
            let pos = func.overlong_jumps.partition_point(|j| j.instruction < entry.instruction);
            func.overlong_jumps.insert(pos, entry);
            let bytes = OVERLONG_JUMP_SENTINEL.to_le_bytes();
            func.chunk.code[at + 1] = bytes[0];
            func.chunk.code[at + 2] = bytes[1];
        } else {
            let bytes = (distance as u16).to_le_bytes();
            let func = self.func();
            func.chunk.code[at + 1] = bytes[0];
            func.chunk.code[at + 2] = bytes[1];
        }
    }

    /// Emits a backward `LOOP` to a known target.
    fn emit_loop(&mut self, start: usize) {
        self.emit_op(Opcode::Loop);
        let at = self.func().chunk.code.len() - 1;
        let distance = (at + 3) - start;
        if distance >= usize::from(OVERLONG_JUMP_SENTINEL) {
            let entry = OverlongJump {
                instruction: at as u32,
                target: start as u32,
            };
            let func = self.func();
            let pos = func.overlong_jumps.partition_point(|j| j.instruction < entry.instruction);
            func.overlong_jumps.insert(pos, entry);
            let bytes = OVERLONG_JUMP_SENTINEL.to_le_bytes();
            self.emit_byte(bytes[0]);
            self.emit_byte(bytes[1]);
        } else {
            let bytes = (distance as u16).to_le_bytes();
            self.emit_byte(bytes[0]);
            self.emit_byte(bytes[1]);
        }
    }

    // ==================================================================
    // Scopes and variables
    // ==================================================================

    fn begin_scope(&mut self) {
        self.func().scope_depth += 1;
    }

    /// Leaves a scope, popping its locals (closing captured ones).
    fn end_scope(&mut self) {
        let depth = self.func().scope_depth;
        self.func().scope_depth -= 1;
        while let Some(local) = self.func_ref().locals.last() {
            if local.depth < depth {
                break;
            }
            let captured = local.captured;
            self.func().locals.pop();
            if captured {
                self.emit_op(Opcode::CloseUpvalue);
            } else {
                self.emit_op(Opcode::Pop);
            }
        }
    }

    fn at_module_scope(&self) -> bool {
        self.functions.len() == 1 && self.func_ref().scope_depth == 0
    }

    fn add_local(&mut self, name: &'src str) -> CRes<u16> {
        let depth = self.func_ref().scope_depth;
        if !name.is_empty() {
            let shadowed = self
                .func_ref()
                .locals
                .iter()
                .rev()
                .take_while(|l| l.depth == depth)
                .any(|l| l.name == name);
            if shadowed {
                return Err(self.error("duplicate variable in this scope"));
            }
        }
        let func = self.func();
        let slot = func.locals.len();
        if slot >= usize::from(u16::MAX) {
            return Err(self.error("too many local variables"));
        }
        func.locals.push(Local {
            name,
            depth,
            captured: false,
        });
        func.max_locals = func.max_locals.max(func.locals.len());
        if !name.is_empty() {
            let name_id = self.intern_rooted(name);
            let func = self.func();
            func.local_names.push(LocalName {
                slot: slot as u16,
                name: name_id,
            });
        }
        Ok(slot as u16)
    }

    fn resolve_local(&self, function: usize, name: &str) -> Option<u16> {
        let func = &self.functions[function];
        func.locals
            .iter()
            .enumerate()
            .rev()
            .find(|(_, l)| l.name == name)
            .map(|(i, _)| i as u16)
    }

    /// Walks enclosing functions for a captured variable, threading an
    /// upvalue descriptor through every intervening function.
    fn resolve_upvalue(&mut self, function: usize, name: &str) -> Option<u16> {
        if function == 0 {
            return None;
        }
        let enclosing = function - 1;
        if let Some(local) = self.resolve_local(enclosing, name) {
            self.functions[enclosing].locals[usize::from(local)].captured = true;
            return Some(self.add_upvalue(function, local, true));
        }
        if let Some(upvalue) = self.resolve_upvalue(enclosing, name) {
            return Some(self.add_upvalue(function, upvalue, false));
        }
        None
    }

    fn add_upvalue(&mut self, function: usize, index: u16, is_local: bool) -> u16 {
        let desc = UpvalueDesc { index, is_local };
        let upvalues = &mut self.functions[function].upvalues;
        if let Some(existing) = upvalues.iter().position(|u| *u == desc) {
            return existing as u16;
        }
        upvalues.push(desc);
        (upvalues.len() - 1) as u16
    }

    /// Compiles a read, write, or augmented write of a named variable.
    fn named_variable(&mut self, name: &'src str, can_assign: bool) -> CRes<()> {
        let function = self.functions.len() - 1;
        let (get, set, arg): (Opcode, Opcode, usize) = if let Some(slot) = self.resolve_local(function, name) {
            (Opcode::GetLocal, Opcode::SetLocal, usize::from(slot))
        } else if let Some(slot) = self.resolve_upvalue(function, name) {
            (Opcode::GetUpvalue, Opcode::SetUpvalue, usize::from(slot))
        } else {
            let idx = self.identifier_constant(name);
            (Opcode::GetGlobal, Opcode::SetGlobal, idx)
        };
        if can_assign && self.match_token(TokenType::Assign)? {
            self.expression_list()?;
            self.emit_indexed(set, arg);
        } else if can_assign && self.current.ty.is_augmented_assign() {
            let op = binary_op_for_augmented(self.current.ty);
            self.advance()?;
            self.emit_indexed(get, arg);
            self.expression()?;
            self.emit_op(op);
            self.emit_indexed(set, arg);
        } else {
            self.emit_indexed(get, arg);
        }
        Ok(())
    }

    // ==================================================================
    // Expressions (Pratt core)
    // ==================================================================

    fn expression(&mut self) -> CRes<()> {
        self.parse_precedence(Prec::Ternary, false)
    }

    /// Parses `e1[, e2, ...]`, folding multiple values into a tuple.
    fn expression_list(&mut self) -> CRes<()> {
        self.expression()?;
        let mut count = 1usize;
        while self.match_token(TokenType::Comma)? {
            if !self.can_start_expression() {
                break;
            }
            self.expression()?;
            count += 1;
        }
        if count > 1 {
            self.emit_indexed(Opcode::BuildTuple, count);
        }
        Ok(())
    }

    fn can_start_expression(&self) -> bool {
        use TokenType as T;
        matches!(
            self.current.ty,
            T::Identifier
                | T::SelfKw
                | T::Super
                | T::Int
                | T::Float
                | T::Str
                | T::FString
                | T::Bytes
                | T::Codepoint
                | T::True
                | T::False
                | T::None
                | T::LeftParen
                | T::LeftBracket
                | T::LeftBrace
                | T::Minus
                | T::Plus
                | T::Tilde
                | T::Not
                | T::Lambda
                | T::Await
                | T::Yield
        )
    }

    fn parse_precedence(&mut self, prec: Prec, can_assign_stmt: bool) -> CRes<()> {
        self.advance()?;
        let can_assign = can_assign_stmt && prec <= Prec::Ternary;
        self.prefix(self.previous.ty, can_assign)?;
        while prec <= infix_precedence(self.current.ty) {
            self.advance()?;
            self.infix(self.previous.ty, can_assign)?;
        }
        Ok(())
    }

    fn prefix(&mut self, ty: TokenType, can_assign: bool) -> CRes<()> {
        use TokenType as T;
        match ty {
            T::Int => self.integer_literal(),
            T::Float => self.float_literal(),
            T::Codepoint => self.codepoint_literal(),
            T::Str => self.string_literal(),
            T::FString => self.fstring_literal(),
            T::Bytes => self.bytes_literal(),
            T::True => {
                self.emit_op(Opcode::True);
                Ok(())
            }
            T::False => {
                self.emit_op(Opcode::False);
                Ok(())
            }
            T::None => {
                self.emit_op(Opcode::None);
                Ok(())
            }
            T::Identifier => {
                let name = self.previous.text;
                self.named_variable(name, can_assign)
            }
            T::SelfKw => self.named_variable("self", can_assign),
            T::Super => self.super_expression(),
            T::LeftParen => self.grouping(),
            T::LeftBracket => self.list_display(),
            T::LeftBrace => self.dict_or_set_display(),
            T::Minus => {
                self.parse_precedence(Prec::Unary, false)?;
                self.emit_op(Opcode::Negate);
                Ok(())
            }
            T::Plus => self.parse_precedence(Prec::Unary, false),
            T::Tilde => {
                self.parse_precedence(Prec::Unary, false)?;
                self.emit_op(Opcode::Invert);
                Ok(())
            }
            T::Not => {
                self.parse_precedence(Prec::Not, false)?;
                self.emit_op(Opcode::Not);
                Ok(())
            }
            T::Lambda => self.lambda(),
            T::Await => {
                self.parse_precedence(Prec::Unary, false)?;
                let idx = self.identifier_constant("__await__");
                self.emit_indexed(Opcode::CallMethod, idx);
                self.emit_byte(0);
                self.emit_op(Opcode::InvokeNext);
                Ok(())
            }
            T::Yield => self.yield_expression(),
            _ => Err(self.error("expected an expression")),
        }
    }

    fn infix(&mut self, ty: TokenType, can_assign: bool) -> CRes<()> {
        use TokenType as T;
        match ty {
            T::LeftParen => self.call_arguments(),
            T::LeftBracket => self.subscript(can_assign),
            T::Dot => self.attribute(can_assign),
            T::Plus => self.binary(Prec::Term, Opcode::Add),
            T::Minus => self.binary(Prec::Term, Opcode::Subtract),
            T::Star => self.binary(Prec::Factor, Opcode::Multiply),
            T::Slash => self.binary(Prec::Factor, Opcode::Divide),
            T::SlashSlash => self.binary(Prec::Factor, Opcode::Floordiv),
            T::Percent => self.binary(Prec::Factor, Opcode::Modulo),
            T::At => self.binary(Prec::Factor, Opcode::Multiply),
            T::StarStar => {
                // Right-associative.
                self.parse_precedence(Prec::Power, false)?;
                self.emit_op(Opcode::Pow);
                Ok(())
            }
            T::Amp => self.binary(Prec::BitAnd, Opcode::Bitand),
            T::Pipe => self.binary(Prec::BitOr, Opcode::Bitor),
            T::Caret => self.binary(Prec::BitXor, Opcode::Bitxor),
            T::LeftShift => self.binary(Prec::Shift, Opcode::Bitshiftl),
            T::RightShift => self.binary(Prec::Shift, Opcode::Bitshiftr),
            T::EqualEqual => self.binary(Prec::Comparison, Opcode::Equal),
            T::BangEqual => {
                self.binary(Prec::Comparison, Opcode::Equal)?;
                self.emit_op(Opcode::Not);
                Ok(())
            }
            T::Less => self.binary(Prec::Comparison, Opcode::Less),
            T::Greater => self.binary(Prec::Comparison, Opcode::Greater),
            T::LessEqual => self.binary(Prec::Comparison, Opcode::LessEqual),
            T::GreaterEqual => self.binary(Prec::Comparison, Opcode::GreaterEqual),
            T::In => self.binary(Prec::Comparison, Opcode::Contains),
            T::Is => {
                let negate = self.match_token(TokenType::Not)?;
                self.parse_precedence(Prec::Comparison.one_higher(), false)?;
                self.emit_op(Opcode::Is);
                if negate {
                    self.emit_op(Opcode::Not);
                }
                Ok(())
            }
            T::Not => {
                // Only valid as `not in`.
                self.consume(TokenType::In, "expected 'in' after 'not'")?;
                self.binary(Prec::Comparison, Opcode::Contains)?;
                self.emit_op(Opcode::Not);
                Ok(())
            }
            T::And => {
                let end = self.emit_jump(Opcode::JumpIfFalse);
                self.emit_op(Opcode::Pop);
                self.parse_precedence(Prec::And, false)?;
                self.patch_jump(end);
                Ok(())
            }
            T::Or => {
                let end = self.emit_jump(Opcode::JumpIfTrue);
                self.emit_op(Opcode::Pop);
                self.parse_precedence(Prec::Or, false)?;
                self.patch_jump(end);
                Ok(())
            }
            T::If => self.ternary(),
            _ => Err(self.error("unexpected operator")),
        }
    }

    fn binary(&mut self, prec: Prec, op: Opcode) -> CRes<()> {
        self.parse_precedence(prec.one_higher(), false)?;
        self.emit_op(op);
        Ok(())
    }

    /// `a if c else b` — the condition is parsed after `a` is on the stack.
    fn ternary(&mut self) -> CRes<()> {
        self.parse_precedence(Prec::Or, false)?;
        // Stack: [a, c]
        let use_b = self.emit_jump(Opcode::JumpIfFalse);
        self.emit_op(Opcode::Pop); // c
        let done = self.emit_jump(Opcode::Jump);
        self.patch_jump(use_b);
        self.emit_op(Opcode::Pop); // c
        self.emit_op(Opcode::Pop); // a
        self.consume(TokenType::Else, "expected 'else' in conditional expression")?;
        self.parse_precedence(Prec::Ternary, false)?;
        self.patch_jump(done);
        Ok(())
    }

    // ----- literals -----

    fn integer_literal(&mut self) -> CRes<()> {
        let text: String = self.previous.text.chars().filter(|c| *c != '_').collect();
        let parsed = if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
            i64::from_str_radix(hex, 16)
        } else if let Some(bin) = text.strip_prefix("0b").or_else(|| text.strip_prefix("0B")) {
            i64::from_str_radix(bin, 2)
        } else if let Some(oct) = text.strip_prefix("0o").or_else(|| text.strip_prefix("0O")) {
            i64::from_str_radix(oct, 8)
        } else {
            text.parse::<i64>()
        };
        match parsed {
            Ok(value) => self.emit_constant(Value::Int(value)),
            Err(_) => {
                // Out of i64 range: fall back to a float literal.
                let value: f64 = text.parse().map_err(|_| self.error("invalid integer literal"))?;
                self.emit_constant(Value::Float(value));
            }
        }
        Ok(())
    }

    fn float_literal(&mut self) -> CRes<()> {
        #[cfg(feature = "no-float")]
        {
            return Err(self.error("float literals are disabled in this build"));
        }
        #[cfg(not(feature = "no-float"))]
        {
            let text: String = self.previous.text.chars().filter(|c| *c != '_').collect();
            let value: f64 = text.parse().map_err(|_| self.error("invalid float literal"))?;
            self.emit_constant(Value::Float(value));
            Ok(())
        }
    }

    fn codepoint_literal(&mut self) -> CRes<()> {
        let cooked = unescape(self.previous.text).map_err(|m| self.error(m))?;
        let ch = cooked.chars().next().ok_or_else(|| self.error("empty character literal"))?;
        self.emit_constant(Value::Int(i64::from(ch as u32)));
        Ok(())
    }

    fn string_literal(&mut self) -> CRes<()> {
        let cooked = unescape(self.previous.text).map_err(|m| self.error(m))?;
        let id = self.intern_rooted(&cooked);
        self.emit_constant(Value::Ref(id));
        Ok(())
    }

    fn bytes_literal(&mut self) -> CRes<()> {
        let cooked = unescape_bytes(self.previous.text).map_err(|m| self.error(m))?;
        let id = self.heap.allocate_bytes(cooked);
        self.heap.push_compiler_root(id);
        self.emit_constant(Value::Ref(id));
        Ok(())
    }

    /// Compiles an f-string into string parts folded together with `ADD`.
    ///
    /// Embedded expressions are compiled by pointing a fresh scanner at the
    /// brace body, then converted with the `str` builtin.
    fn fstring_literal(&mut self) -> CRes<()> {
        let raw = self.previous.text;
        let mut parts = 0usize;
        let mut literal = String::new();
        let mut rest = raw;
        loop {
            let Some(brace) = rest.find(['{', '}']) else {
                literal.push_str(rest);
                break;
            };
            let (before, at) = rest.split_at(brace);
            literal.push_str(before);
            if at.starts_with("{{") {
                literal.push('{');
                rest = &at[2..];
                continue;
            }
            if at.starts_with("}}") {
                literal.push('}');
                rest = &at[2..];
                continue;
            }
            if at.starts_with('}') {
                return Err(self.error("single '}' in f-string"));
            }
            let close = at.find('}').ok_or_else(|| self.error("unterminated '{' in f-string"))?;
            let expr_text = &at[1..close];
            rest = &at[close + 1..];
            // Flush the pending literal part.
            if !literal.is_empty() || parts == 0 {
                let cooked = unescape(&literal).map_err(|m| self.error(m))?;
                let id = self.intern_rooted(&cooked);
                self.emit_constant(Value::Ref(id));
                if parts > 0 {
                    self.emit_op(Opcode::Add);
                }
                parts += 1;
                literal.clear();
            }
            self.compile_embedded_expression(expr_text)?;
            if parts > 0 {
                self.emit_op(Opcode::Add);
            }
            parts += 1;
        }
        if !literal.is_empty() || parts == 0 {
            let cooked = unescape(&literal).map_err(|m| self.error(m))?;
            let id = self.intern_rooted(&cooked);
            self.emit_constant(Value::Ref(id));
            if parts > 0 {
                self.emit_op(Opcode::Add);
            }
        }
        Ok(())
    }

    /// Compiles one `{expr}` body from an f-string, wrapped in `str(...)`.
    fn compile_embedded_expression(&mut self, text: &'src str) -> CRes<()> {
        let idx = self.identifier_constant("str");
        self.emit_indexed(Opcode::GetGlobal, idx);
        let saved_scanner = std::mem::replace(&mut self.scanner, Scanner::new(text));
        let saved_current = self.current;
        let saved_previous = self.previous;
        let result = (|| -> CRes<()> {
            self.advance()?; // first token is the embedded Indentation
            if self.current.ty == TokenType::Eof {
                return Err(self.error("empty expression in f-string"));
            }
            self.expression()?;
            if !matches!(self.current.ty, TokenType::Eol | TokenType::Eof) {
                return Err(self.error("unexpected token in f-string expression"));
            }
            Ok(())
        })();
        self.scanner = saved_scanner;
        self.current = saved_current;
        self.previous = saved_previous;
        result?;
        self.emit_indexed(Opcode::Call, 1);
        Ok(())
    }

    // ----- displays, comprehensions, grouping -----

    fn grouping(&mut self) -> CRes<()> {
        if self.match_token(TokenType::RightParen)? {
            self.emit_indexed(Opcode::BuildTuple, 0);
            return Ok(());
        }
        let head = self.checkpoint();
        let chunk_len = self.func_ref().chunk.code.len();
        self.expression()?;
        if self.check(TokenType::For) {
            self.comprehension(head, chunk_len, ComprehensionKind::Generator)?;
            self.consume(TokenType::RightParen, "expected ')' after generator expression")?;
            return Ok(());
        }
        if self.check(TokenType::Comma) {
            let mut count = 1usize;
            while self.match_token(TokenType::Comma)? {
                if self.check(TokenType::RightParen) {
                    break;
                }
                self.expression()?;
                count += 1;
            }
            self.emit_indexed(Opcode::BuildTuple, count);
        }
        self.consume(TokenType::RightParen, "expected ')'")?;
        Ok(())
    }

    fn list_display(&mut self) -> CRes<()> {
        if self.match_token(TokenType::RightBracket)? {
            self.emit_indexed(Opcode::BuildList, 0);
            return Ok(());
        }
        let head = self.checkpoint();
        let chunk_len = self.func_ref().chunk.code.len();
        self.expression()?;
        if self.check(TokenType::For) {
            self.comprehension(head, chunk_len, ComprehensionKind::List)?;
            self.consume(TokenType::RightBracket, "expected ']' after comprehension")?;
            return Ok(());
        }
        let mut count = 1usize;
        while self.match_token(TokenType::Comma)? {
            if self.check(TokenType::RightBracket) {
                break;
            }
            self.expression()?;
            count += 1;
        }
        self.consume(TokenType::RightBracket, "expected ']'")?;
        self.emit_indexed(Opcode::BuildList, count);
        Ok(())
    }

    fn dict_or_set_display(&mut self) -> CRes<()> {
        if self.match_token(TokenType::RightBrace)? {
            self.emit_indexed(Opcode::BuildDict, 0);
            return Ok(());
        }
        let head = self.checkpoint();
        let chunk_len = self.func_ref().chunk.code.len();
        self.expression()?;
        if self.match_token(TokenType::Colon)? {
            // Dict display or comprehension.
            self.expression()?;
            if self.check(TokenType::For) {
                self.comprehension(head, chunk_len, ComprehensionKind::Dict)?;
                self.consume(TokenType::RightBrace, "expected '}' after comprehension")?;
                return Ok(());
            }
            let mut count = 1usize;
            while self.match_token(TokenType::Comma)? {
                if self.check(TokenType::RightBrace) {
                    break;
                }
                self.expression()?;
                self.consume(TokenType::Colon, "expected ':' in dict display")?;
                self.expression()?;
                count += 1;
            }
            self.consume(TokenType::RightBrace, "expected '}'")?;
            self.emit_indexed(Opcode::BuildDict, count);
            return Ok(());
        }
        // Set display or comprehension.
        if self.check(TokenType::For) {
            self.comprehension(head, chunk_len, ComprehensionKind::Set)?;
            self.consume(TokenType::RightBrace, "expected '}' after comprehension")?;
            return Ok(());
        }
        let mut count = 1usize;
        while self.match_token(TokenType::Comma)? {
            if self.check(TokenType::RightBrace) {
                break;
            }
            self.expression()?;
            count += 1;
        }
        self.consume(TokenType::RightBrace, "expected '}'")?;
        self.emit_indexed(Opcode::BuildSet, count);
        Ok(())
    }

    // ----- calls, attributes, subscripts -----

    /// Compiles a call's argument list. Keyword arguments are encoded as
    /// `(name, value)` pairs topped by a `Kwargs` sentinel constant; `*seq`
    /// and `**map` use reserved pseudo-names.
    fn call_arguments(&mut self) -> CRes<()> {
        let mut positional = 0usize;
        let mut pairs = 0usize;
        if !self.check(TokenType::RightParen) {
            loop {
                if self.match_token(TokenType::Star)? {
                    self.emit_constant(Value::Kwargs(KWARGS_STAR));
                    self.expression()?;
                    pairs += 1;
                } else if self.match_token(TokenType::StarStar)? {
                    self.emit_constant(Value::Kwargs(KWARGS_DOUBLE_STAR));
                    self.expression()?;
                    pairs += 1;
                } else if self.check(TokenType::Identifier) && self.peek_second() == TokenType::Assign {
                    let name = self.current.text;
                    self.advance()?;
                    self.advance()?;
                    let id = self.intern_rooted(name);
                    self.emit_constant(Value::Ref(id));
                    self.expression()?;
                    pairs += 1;
                } else {
                    if pairs > 0 {
                        return Err(self.error("positional argument after keyword argument"));
                    }
                    self.expression()?;
                    positional += 1;
                }
                if !self.match_token(TokenType::Comma)? {
                    break;
                }
                if self.check(TokenType::RightParen) {
                    break;
                }
            }
        }
        self.consume(TokenType::RightParen, "expected ')' after arguments")?;
        if pairs > 0 {
            self.emit_constant(Value::Kwargs(pairs as u32));
            self.emit_indexed(Opcode::Call, positional + pairs * 2 + 1);
        } else {
            self.emit_indexed(Opcode::Call, positional);
        }
        Ok(())
    }

    fn attribute(&mut self, can_assign: bool) -> CRes<()> {
        self.consume(TokenType::Identifier, "expected attribute name after '.'")?;
        let name = self.previous.text;
        let idx = self.identifier_constant(name);
        if can_assign && self.match_token(TokenType::Assign)? {
            self.expression_list()?;
            self.emit_indexed(Opcode::SetProperty, idx);
        } else if can_assign && self.current.ty.is_augmented_assign() {
            let op = binary_op_for_augmented(self.current.ty);
            self.advance()?;
            self.emit_indexed(Opcode::Dup, 0);
            self.emit_indexed(Opcode::GetProperty, idx);
            self.expression()?;
            self.emit_op(op);
            self.emit_indexed(Opcode::SetProperty, idx);
        } else if self.check(TokenType::LeftParen) {
            // Method call fast path: avoids the bound-method allocation.
            self.advance()?;
            self.method_call_arguments(idx)?;
        } else {
            self.emit_indexed(Opcode::GetProperty, idx);
        }
        Ok(())
    }

    /// Arguments for `obj.name(...)` via `CALL_METHOD`.
    ///
    /// `CALL_METHOD` encodes only a plain count, so calls carrying
    /// keyword, `*`, or `**` arguments resolve the attribute first and go
    /// through the ordinary call path instead. The decision is made by
    /// lookahead, before any argument code is emitted.
    fn method_call_arguments(&mut self, name_idx: usize) -> CRes<()> {
        if self.call_needs_general_path() {
            self.emit_indexed(Opcode::GetProperty, name_idx);
            return self.call_arguments();
        }
        let mut positional = 0usize;
        if !self.check(TokenType::RightParen) {
            loop {
                self.expression()?;
                positional += 1;
                if !self.match_token(TokenType::Comma)? {
                    break;
                }
                if self.check(TokenType::RightParen) {
                    break;
                }
            }
        }
        self.consume(TokenType::RightParen, "expected ')' after arguments")?;
        self.emit_indexed(Opcode::CallMethod, name_idx);
        self.emit_byte(positional as u8);
        Ok(())
    }

    /// Scans ahead (without consuming) for anything that rules out the
    /// `CALL_METHOD` fast path: keyword arguments, `*seq`, or `**map`.
    /// False positives (say, a lambda default inside an argument) are
    /// harmless; the general path handles plain positionals too.
    fn call_needs_general_path(&mut self) -> bool {
        let mut lookahead = self.scanner.clone();
        let mut depth = 1u32;
        let mut at_argument_start = true;
        let mut ty = self.current.ty;
        loop {
            match ty {
                TokenType::LeftParen | TokenType::LeftBracket | TokenType::LeftBrace => depth += 1,
                TokenType::RightParen | TokenType::RightBracket | TokenType::RightBrace => {
                    if depth == 1 {
                        return false;
                    }
                    depth -= 1;
                }
                TokenType::Star | TokenType::StarStar if depth == 1 && at_argument_start => return true,
                TokenType::Assign if depth == 1 => return true,
                TokenType::Eof | TokenType::Eol | TokenType::Error => return false,
                _ => {}
            }
            at_argument_start = depth == 1 && ty == TokenType::Comma;
            ty = lookahead.next_token().ty;
        }
    }

    fn subscript(&mut self, can_assign: bool) -> CRes<()> {
        // Slice forms compile to __getslice__/__setslice__ with None
        // standing in for omitted bounds.
        let mut is_slice = false;
        if self.check(TokenType::Colon) {
            self.emit_op(Opcode::None);
            is_slice = true;
        } else {
            self.expression()?;
        }
        if self.match_token(TokenType::Colon)? {
            is_slice = true;
            if self.check(TokenType::RightBracket) || self.check(TokenType::Colon) {
                self.emit_op(Opcode::None);
            } else {
                self.expression()?;
            }
            if self.match_token(TokenType::Colon)? {
                if self.check(TokenType::RightBracket) {
                    self.emit_op(Opcode::None);
                } else {
                    self.expression()?;
                }
            } else {
                self.emit_op(Opcode::None);
            }
        }
        self.consume(TokenType::RightBracket, "expected ']'")?;
        if is_slice {
            if can_assign && self.match_token(TokenType::Assign)? {
                self.expression()?;
                let idx = self.identifier_constant("__setslice__");
                self.emit_indexed(Opcode::CallMethod, idx);
                self.emit_byte(4);
            } else {
                let idx = self.identifier_constant("__getslice__");
                self.emit_indexed(Opcode::CallMethod, idx);
                self.emit_byte(3);
            }
            return Ok(());
        }
        if can_assign && self.match_token(TokenType::Assign)? {
            self.expression_list()?;
            let idx = self.identifier_constant("__setitem__");
            self.emit_indexed(Opcode::CallMethod, idx);
            self.emit_byte(2);
        } else if can_assign && self.current.ty.is_augmented_assign() {
            let op = binary_op_for_augmented(self.current.ty);
            self.advance()?;
            self.emit_indexed(Opcode::Dup, 1);
            self.emit_indexed(Opcode::Dup, 1);
            let get_idx = self.identifier_constant("__getitem__");
            self.emit_indexed(Opcode::CallMethod, get_idx);
            self.emit_byte(1);
            self.expression()?;
            self.emit_op(op);
            let set_idx = self.identifier_constant("__setitem__");
            self.emit_indexed(Opcode::CallMethod, set_idx);
            self.emit_byte(2);
        } else {
            let idx = self.identifier_constant("__getitem__");
            self.emit_indexed(Opcode::CallMethod, idx);
            self.emit_byte(1);
        }
        Ok(())
    }

    /// `super.name` (or `super().name`): binds the base-class method to the
    /// current receiver.
    fn super_expression(&mut self) -> CRes<()> {
        if self.match_token(TokenType::LeftParen)? {
            self.consume(TokenType::RightParen, "expected ')' after 'super('")?;
        }
        self.consume(TokenType::Dot, "expected '.' after 'super'")?;
        self.consume(TokenType::Identifier, "expected method name after 'super.'")?;
        let name = self.previous.text;
        let idx = self.identifier_constant(name);
        let function = self.functions.len() - 1;
        if !matches!(
            self.func_ref().ty,
            FunctionType::Method | FunctionType::Initializer
        ) {
            return Err(self.error("'super' outside of a method"));
        }
        // Receiver is always the method's first parameter.
        self.emit_indexed(Opcode::GetLocal, 0);
        if let Some(slot) = self.resolve_local(function, "super") {
            self.emit_indexed(Opcode::GetLocal, usize::from(slot));
        } else if let Some(slot) = self.resolve_upvalue(function, "super") {
            self.emit_indexed(Opcode::GetUpvalue, usize::from(slot));
        } else {
            return Err(self.error("'super' in a class with no base class"));
        }
        self.emit_indexed(Opcode::GetSuper, idx);
        Ok(())
    }

    fn yield_expression(&mut self) -> CRes<()> {
        if self.func_ref().ty == FunctionType::Module {
            return Err(self.error("'yield' outside of a function"));
        }
        if self.can_start_expression() {
            self.expression_list()?;
        } else {
            self.emit_op(Opcode::None);
        }
        self.func().flags |= CODE_IS_GENERATOR;
        self.emit_op(Opcode::Yield);
        Ok(())
    }

    // ==================================================================
    // Comprehensions and generator expressions
    // ==================================================================

    /// Compiles a comprehension or generator expression.
    ///
    /// Comprehensions get their own scope: a hidden function taking the
    /// prepared iterator as its single parameter, immediately called with
    /// `iter(ITER)`. List/set/dict kinds accumulate and return the
    /// container; the generator kind is flagged as a generator and yields.
    ///
    /// Called with the scanner sitting on `for` after the head expression
    /// was tentatively compiled into the enclosing chunk; that emission is
    /// discarded (`chunk_len` truncation) and the head is re-parsed from
    /// `head` into the loop body.
    fn comprehension(&mut self, head: Checkpoint<'src>, chunk_len: usize, kind: ComprehensionKind) -> CRes<()> {
        self.func().chunk.code.truncate(chunk_len);
        self.consume(TokenType::For, "expected 'for'")?;
        let mut targets: SmallVec<[&'src str; 2]> = SmallVec::new();
        loop {
            self.consume(TokenType::Identifier, "expected loop variable name")?;
            targets.push(self.previous.text);
            if !self.match_token(TokenType::Comma)? {
                break;
            }
        }
        self.consume(TokenType::In, "expected 'in'")?;
        // The iterable is evaluated eagerly, in the enclosing scope.
        self.expression()?;
        self.emit_op(Opcode::InvokeIter);

        let name_id = self.intern_rooted(kind.hidden_name());
        let qualname = format!("{}.{}", self.func_ref().qualname, kind.hidden_name());
        let mut inner = FunctionCompiler::new(FunctionType::Lambda, name_id, qualname);
        if kind == ComprehensionKind::Generator {
            inner.flags |= CODE_IS_GENERATOR;
        }
        inner.positional.push(self.intern_rooted(".iterable"));
        self.functions.push(inner);
        self.begin_scope();
        self.add_local(".iterable")?;

        let acc = match kind {
            ComprehensionKind::List => {
                self.emit_indexed(Opcode::BuildList, 0);
                Some(self.add_local("")?)
            }
            ComprehensionKind::Set => {
                self.emit_indexed(Opcode::BuildSet, 0);
                Some(self.add_local("")?)
            }
            ComprehensionKind::Dict => {
                self.emit_indexed(Opcode::BuildDict, 0);
                Some(self.add_local("")?)
            }
            ComprehensionKind::Generator => None,
        };
        for _ in &targets {
            self.emit_op(Opcode::None);
        }
        let mut var_slots: SmallVec<[u16; 2]> = SmallVec::new();
        for target in &targets {
            var_slots.push(self.add_local(target)?);
        }

        let loop_start = self.func_ref().chunk.code.len();
        self.emit_indexed(Opcode::GetLocal, 0);
        self.emit_op(Opcode::InvokeNext);
        self.emit_indexed(Opcode::Dup, 0);
        self.emit_indexed(Opcode::GetLocal, 0);
        self.emit_op(Opcode::Is);
        let exit = self.emit_jump(Opcode::JumpIfTrue);
        self.emit_op(Opcode::Pop);
        self.bind_loop_targets(&var_slots);

        let filter = if self.check(TokenType::If) {
            self.advance()?;
            self.expression()?;
            let skip = self.emit_jump(Opcode::JumpIfFalse);
            self.emit_op(Opcode::Pop);
            Some(skip)
        } else {
            None
        };

        // Element step: rewind to re-parse the head expression(s).
        let tail = self.checkpoint();
        self.rewind(head);
        match kind {
            ComprehensionKind::List => {
                self.emit_indexed(Opcode::GetLocal, usize::from(acc.expect("accumulator slot")));
                self.expression()?;
                let idx = self.identifier_constant("append");
                self.emit_indexed(Opcode::CallMethod, idx);
                self.emit_byte(1);
                self.emit_op(Opcode::Pop);
            }
            ComprehensionKind::Set => {
                self.emit_indexed(Opcode::GetLocal, usize::from(acc.expect("accumulator slot")));
                self.expression()?;
                let idx = self.identifier_constant("add");
                self.emit_indexed(Opcode::CallMethod, idx);
                self.emit_byte(1);
                self.emit_op(Opcode::Pop);
            }
            ComprehensionKind::Dict => {
                self.emit_indexed(Opcode::GetLocal, usize::from(acc.expect("accumulator slot")));
                self.expression()?;
                self.consume(TokenType::Colon, "expected ':' in dict comprehension")?;
                self.expression()?;
                let idx = self.identifier_constant("__setitem__");
                self.emit_indexed(Opcode::CallMethod, idx);
                self.emit_byte(2);
                self.emit_op(Opcode::Pop);
            }
            ComprehensionKind::Generator => {
                self.expression()?;
                self.emit_op(Opcode::Yield);
                self.emit_op(Opcode::Pop);
            }
        }
        self.rewind(tail);

        self.emit_loop(loop_start);
        if let Some(skip) = filter {
            self.patch_jump(skip);
            self.emit_op(Opcode::Pop);
            self.emit_loop(loop_start);
        }
        self.patch_jump(exit);
        self.emit_op(Opcode::Pop); // comparison result
        self.emit_op(Opcode::Pop); // exhausted sentinel value
        match acc {
            Some(slot) => self.emit_indexed(Opcode::GetLocal, usize::from(slot)),
            None => self.emit_op(Opcode::None),
        }
        self.emit_op(Opcode::Return);

        let inner = self.functions.pop().expect("comprehension compiler missing");
        let upvalues: Vec<UpvalueDesc> = inner.upvalues.clone();
        let code_id = self.finish_function(inner);
        let const_idx = self.make_constant(Value::Ref(code_id));
        self.emit_closure(const_idx, &upvalues);
        // Stack: [iterator, closure] — bring the callee underneath.
        self.emit_indexed(Opcode::Swap, 1);
        self.emit_indexed(Opcode::Call, 1);
        Ok(())
    }

    fn bind_loop_targets(&mut self, var_slots: &[u16]) {
        if var_slots.len() == 1 {
            self.emit_indexed(Opcode::SetLocal, usize::from(var_slots[0]));
            self.emit_op(Opcode::Pop);
        } else {
            self.emit_indexed(Opcode::Unpack, var_slots.len());
            for slot in var_slots.iter().rev() {
                self.emit_indexed(Opcode::SetLocal, usize::from(*slot));
                self.emit_op(Opcode::Pop);
            }
        }
    }

    // ==================================================================
    // Statements
    // ==================================================================

    /// Compiles one statement. `width` is the line's indentation width.
    fn statement(&mut self, width: u32) -> CRes<()> {
        use TokenType as T;
        // A leading bare string in a module or function body is its
        // docstring; it is recorded on the code object, not executed.
        if self.current.ty == T::Str
            && matches!(self.peek_second(), T::Eol | T::Eof)
            && self.func_ref().chunk.code.is_empty()
            && self.func_ref().docstring.is_none()
        {
            self.advance()?;
            let cooked = unescape(self.previous.text).map_err(|m| self.error(m))?;
            let id = self.intern_rooted(&cooked);
            self.func().docstring = Some(Value::Ref(id));
            return self.end_of_statement();
        }
        match self.current.ty {
            T::Let => {
                self.advance()?;
                self.let_statement()
            }
            T::If => {
                self.advance()?;
                self.if_statement(width)
            }
            T::While => {
                self.advance()?;
                self.while_statement(width)
            }
            T::For => {
                self.advance()?;
                self.for_statement(width)
            }
            T::Def => {
                self.advance()?;
                self.def_statement(width, 0)
            }
            T::Async => {
                self.advance()?;
                self.consume(TokenType::Def, "expected 'def' after 'async'")?;
                self.def_statement(width, CODE_IS_COROUTINE)
            }
            T::At => {
                self.advance()?;
                self.decorated_statement(width)
            }
            T::Class => {
                self.advance()?;
                self.class_statement(width)
            }
            T::Try => {
                self.advance()?;
                self.try_statement(width)
            }
            T::With => {
                self.advance()?;
                self.with_statement(width)
            }
            T::Return => {
                self.advance()?;
                self.return_statement()
            }
            T::Raise => {
                self.advance()?;
                self.raise_statement()
            }
            T::Import => {
                self.advance()?;
                self.import_statement()
            }
            T::From => {
                self.advance()?;
                self.from_import_statement()
            }
            T::Export => {
                self.advance()?;
                self.export_statement()
            }
            T::Del => {
                self.advance()?;
                self.del_statement()
            }
            T::Assert => {
                self.advance()?;
                self.assert_statement()
            }
            T::Break => {
                self.advance()?;
                self.break_statement()
            }
            T::Continue => {
                self.advance()?;
                self.continue_statement()
            }
            T::Pass => {
                self.advance()?;
                self.end_of_statement()
            }
            _ => self.expression_statement(),
        }
    }

    /// Consumes the statement's trailing end-of-line (or `;`).
    fn end_of_statement(&mut self) -> CRes<()> {
        if self.match_token(TokenType::Semicolon)? {
            // `a; b` — the caller's loop parses the next simple statement.
            return Ok(());
        }
        if self.check(TokenType::Eof) {
            return Ok(());
        }
        self.consume(TokenType::Eol, "expected end of line")
    }

    /// Compiles a statement body after `:`: either inline simple
    /// statements or an indented block of lines wider than `width`.
    fn body(&mut self, width: u32) -> CRes<()> {
        self.consume(TokenType::Colon, "expected ':'")?;
        if !self.match_token(TokenType::Eol)? {
            // Inline body: simple statements separated by ';'.
            loop {
                self.statement(width)?;
                if self.previous.ty != TokenType::Semicolon {
                    break;
                }
            }
            return Ok(());
        }
        self.indented_block(width)
    }

    /// Parses an indented block: the first line fixes the block width W;
    /// following lines with width >= W belong to the block.
    fn indented_block(&mut self, parent_width: u32) -> CRes<()> {
        if !self.check(TokenType::Indentation) || self.current.width <= parent_width {
            return Err(self.error("expected an indented block"));
        }
        let block_width = self.current.width;
        while self.check(TokenType::Indentation) && self.current.width >= block_width {
            self.advance()?;
            self.statement(block_width)?;
        }
        Ok(())
    }

    /// Checks whether the next line continues this statement with one of
    /// `continuations` (e.g. `elif`/`else`) at the same width. Consumes
    /// the indentation and keyword when it does.
    fn block_continuation(&mut self, width: u32, continuations: &[TokenType]) -> CRes<Option<TokenType>> {
        if self.current.ty != TokenType::Indentation || self.current.width != width {
            return Ok(None);
        }
        let next = self.scanner.next_token();
        if next.ty == TokenType::Error {
            return Err(CompileError {
                message: next.note.unwrap_or("scan error").to_string(),
                line: next.line,
            });
        }
        if continuations.contains(&next.ty) {
            self.previous = next;
            let following = self.scanner.next_token();
            if following.ty == TokenType::Error {
                return Err(CompileError {
                    message: following.note.unwrap_or("scan error").to_string(),
                    line: following.line,
                });
            }
            self.current = following;
            Ok(Some(next.ty))
        } else {
            self.scanner.push_back(next);
            Ok(None)
        }
    }

    fn expression_statement(&mut self) -> CRes<()> {
        // `a, b = ...` needs lookahead: scan the line for a top-level `=`
        // preceded by a top-level comma.
        if self.line_is_multi_assignment()? {
            return self.multi_assignment_statement();
        }
        self.parse_precedence(Prec::Ternary, true)?;
        if self.check(TokenType::Comma) {
            // Tuple expression statement.
            let mut count = 1usize;
            while self.match_token(TokenType::Comma)? {
                if !self.can_start_expression() {
                    break;
                }
                self.expression()?;
                count += 1;
            }
            if count > 1 {
                self.emit_indexed(Opcode::BuildTuple, count);
            }
        }
        self.emit_op(Opcode::Pop);
        self.end_of_statement()
    }

    /// Scans ahead (without consuming) for `name, name, ... =` shape.
    fn line_is_multi_assignment(&mut self) -> CRes<bool> {
        let mut lookahead = self.scanner.clone();
        let mut depth = 0u32;
        let mut saw_comma = false;
        let mut token_ty = self.current.ty;
        loop {
            match token_ty {
                TokenType::LeftParen | TokenType::LeftBracket | TokenType::LeftBrace => depth += 1,
                TokenType::RightParen | TokenType::RightBracket | TokenType::RightBrace => {
                    depth = depth.saturating_sub(1);
                }
                TokenType::Comma if depth == 0 => saw_comma = true,
                TokenType::Assign if depth == 0 => return Ok(saw_comma),
                TokenType::Eol | TokenType::Eof | TokenType::Error => return Ok(false),
                ty if ty.is_augmented_assign() && depth == 0 => return Ok(false),
                _ => {}
            }
            token_ty = lookahead.next_token().ty;
        }
    }

    /// `a, b[, ...] = expr` — plain-name targets only.
    fn multi_assignment_statement(&mut self) -> CRes<()> {
        let mut names: SmallVec<[&'src str; 4]> = SmallVec::new();
        loop {
            if self.match_token(TokenType::SelfKw)? {
                names.push("self");
            } else {
                self.consume(
                    TokenType::Identifier,
                    "only plain names can be targets of unpacking assignment",
                )?;
                names.push(self.previous.text);
            }
            if !self.match_token(TokenType::Comma)? {
                break;
            }
        }
        self.consume(TokenType::Assign, "expected '='")?;
        // RHS: one iterable or a matching tuple of expressions.
        self.expression()?;
        let mut rhs_count = 1usize;
        while self.match_token(TokenType::Comma)? {
            if !self.can_start_expression() {
                break;
            }
            self.expression()?;
            rhs_count += 1;
        }
        if rhs_count > 1 {
            self.emit_indexed(Opcode::BuildTuple, rhs_count);
        }
        self.emit_indexed(Opcode::Unpack, names.len());
        for name in names.iter().rev() {
            self.store_and_pop(name)?;
        }
        self.end_of_statement()
    }

    /// `SET_x name; POP` for whichever scope holds `name`.
    fn store_and_pop(&mut self, name: &'src str) -> CRes<()> {
        let function = self.functions.len() - 1;
        if let Some(slot) = self.resolve_local(function, name) {
            self.emit_indexed(Opcode::SetLocal, usize::from(slot));
        } else if let Some(slot) = self.resolve_upvalue(function, name) {
            self.emit_indexed(Opcode::SetUpvalue, usize::from(slot));
        } else {
            let idx = self.identifier_constant(name);
            self.emit_indexed(Opcode::SetGlobal, idx);
        }
        self.emit_op(Opcode::Pop);
        Ok(())
    }

    fn let_statement(&mut self) -> CRes<()> {
        let mut names: SmallVec<[&'src str; 4]> = SmallVec::new();
        loop {
            self.consume(TokenType::Identifier, "expected variable name after 'let'")?;
            names.push(self.previous.text);
            if !self.match_token(TokenType::Comma)? {
                break;
            }
        }
        let has_init = self.match_token(TokenType::Assign)?;
        if has_init {
            self.expression()?;
            let mut count = 1usize;
            while self.match_token(TokenType::Comma)? {
                self.expression()?;
                count += 1;
            }
            if count == 1 && names.len() > 1 {
                self.emit_indexed(Opcode::Unpack, names.len());
            } else if count != names.len() {
                if names.len() == 1 && count > 1 {
                    self.emit_indexed(Opcode::BuildTuple, count);
                } else {
                    return Err(self.error("mismatched names and values in 'let'"));
                }
            }
        } else {
            for _ in &names {
                self.emit_op(Opcode::None);
            }
        }
        if self.at_module_scope() {
            // Values are on the stack in declaration order; define from the
            // top down.
            for name in names.iter().rev() {
                let idx = self.identifier_constant(name);
                self.emit_indexed(Opcode::DefineGlobal, idx);
            }
        } else {
            // The pushed values land exactly at the new local slots.
            for name in &names {
                self.add_local(name)?;
            }
        }
        self.end_of_statement()
    }

    fn if_statement(&mut self, width: u32) -> CRes<()> {
        self.expression()?;
        let else_jump = self.emit_jump(Opcode::JumpIfFalse);
        self.emit_op(Opcode::Pop);
        self.begin_scope();
        self.body(width)?;
        self.end_scope();
        let end_jump = self.emit_jump(Opcode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(Opcode::Pop);
        match self.block_continuation(width, &[TokenType::Elif, TokenType::Else])? {
            Some(TokenType::Elif) => self.if_statement(width)?,
            Some(TokenType::Else) => {
                self.begin_scope();
                self.body(width)?;
                self.end_scope();
            }
            _ => {}
        }
        self.patch_jump(end_jump);
        Ok(())
    }

    fn while_statement(&mut self, width: u32) -> CRes<()> {
        let loop_start = self.func_ref().chunk.code.len();
        self.expression()?;
        let exit_jump = self.emit_jump(Opcode::JumpIfFalse);
        self.emit_op(Opcode::Pop);
        let depth = self.func_ref().scope_depth;
        self.func().loops.push(LoopContext {
            start: loop_start,
            depth,
            breaks: Vec::new(),
        });
        self.begin_scope();
        self.body(width)?;
        self.end_scope();
        self.emit_loop(loop_start);
        self.patch_jump(exit_jump);
        self.emit_op(Opcode::Pop);
        // Optional else: runs when the loop ends without break.
        if let Some(TokenType::Else) = self.block_continuation(width, &[TokenType::Else])? {
            self.begin_scope();
            self.body(width)?;
            self.end_scope();
        }
        let context = self.func().loops.pop().expect("loop context missing");
        for offset in context.breaks {
            self.patch_jump(offset);
        }
        Ok(())
    }

    fn for_statement(&mut self, width: u32) -> CRes<()> {
        self.begin_scope();
        let mut targets: SmallVec<[&'src str; 2]> = SmallVec::new();
        loop {
            self.consume(TokenType::Identifier, "expected loop variable name")?;
            targets.push(self.previous.text);
            if !self.match_token(TokenType::Comma)? {
                break;
            }
        }
        self.consume(TokenType::In, "expected 'in'")?;
        self.expression_list()?;
        self.emit_op(Opcode::InvokeIter);
        let iter_slot = self.add_local("")?;
        for _ in &targets {
            self.emit_op(Opcode::None);
        }
        let mut var_slots: SmallVec<[u16; 2]> = SmallVec::new();
        for target in &targets {
            var_slots.push(self.add_local(target)?);
        }
        let loop_start = self.func_ref().chunk.code.len();
        self.emit_indexed(Opcode::GetLocal, usize::from(iter_slot));
        self.emit_op(Opcode::InvokeNext);
        self.emit_indexed(Opcode::Dup, 0);
        self.emit_indexed(Opcode::GetLocal, usize::from(iter_slot));
        self.emit_op(Opcode::Is);
        let exit_jump = self.emit_jump(Opcode::JumpIfTrue);
        self.emit_op(Opcode::Pop);
        self.bind_loop_targets(&var_slots);
        let depth = self.func_ref().scope_depth;
        self.func().loops.push(LoopContext {
            start: loop_start,
            depth,
            breaks: Vec::new(),
        });
        self.begin_scope();
        self.body(width)?;
        self.end_scope();
        self.emit_loop(loop_start);
        self.patch_jump(exit_jump);
        self.emit_op(Opcode::Pop); // comparison result
        self.emit_op(Opcode::Pop); // exhausted sentinel value
        if let Some(TokenType::Else) = self.block_continuation(width, &[TokenType::Else])? {
            self.begin_scope();
            self.body(width)?;
            self.end_scope();
        }
        let context = self.func().loops.pop().expect("loop context missing");
        for offset in context.breaks {
            self.patch_jump(offset);
        }
        self.end_scope();
        Ok(())
    }

    fn break_statement(&mut self) -> CRes<()> {
        if self.func_ref().loops.is_empty() {
            return Err(self.error("'break' outside of a loop"));
        }
        self.pop_locals_to_loop_depth();
        let offset = self.emit_jump(Opcode::Jump);
        self.func()
            .loops
            .last_mut()
            .expect("loop context missing")
            .breaks
            .push(offset);
        self.end_of_statement()
    }

    fn continue_statement(&mut self) -> CRes<()> {
        let Some(context) = self.func_ref().loops.last() else {
            return Err(self.error("'continue' outside of a loop"));
        };
        let start = context.start;
        self.pop_locals_to_loop_depth();
        self.emit_loop(start);
        self.end_of_statement()
    }

    /// Pops stack values for locals declared inside the innermost loop,
    /// without removing them from the compiler's scope bookkeeping.
    fn pop_locals_to_loop_depth(&mut self) {
        let loop_depth = self.func_ref().loops.last().expect("loop context missing").depth;
        let count = self
            .func_ref()
            .locals
            .iter()
            .rev()
            .take_while(|l| l.depth > loop_depth)
            .count();
        for _ in 0..count {
            self.emit_op(Opcode::Pop);
        }
    }

    fn return_statement(&mut self) -> CRes<()> {
        if self.func_ref().ty == FunctionType::Module {
            return Err(self.error("'return' outside of a function"));
        }
        if self.check(TokenType::Eol) || self.check(TokenType::Eof) || self.check(TokenType::Semicolon) {
            self.emit_op(Opcode::None);
        } else {
            if self.func_ref().ty == FunctionType::Initializer {
                return Err(self.error("cannot return a value from __init__"));
            }
            self.expression_list()?;
        }
        self.emit_op(Opcode::Return);
        self.end_of_statement()
    }

    fn raise_statement(&mut self) -> CRes<()> {
        if self.check(TokenType::Eol) || self.check(TokenType::Eof) {
            // Bare re-raise of the in-flight exception.
            self.emit_op(Opcode::None);
            self.emit_op(Opcode::Raise);
            return self.end_of_statement();
        }
        self.expression()?;
        if self.match_token(TokenType::From)? {
            self.expression()?;
            self.emit_op(Opcode::RaiseFrom);
        } else {
            self.emit_op(Opcode::Raise);
        }
        self.end_of_statement()
    }

    fn assert_statement(&mut self) -> CRes<()> {
        self.expression()?;
        let ok_jump = self.emit_jump(Opcode::JumpIfTrue);
        self.emit_op(Opcode::Pop);
        let idx = self.identifier_constant("AssertionError");
        self.emit_indexed(Opcode::GetGlobal, idx);
        if self.match_token(TokenType::Comma)? {
            self.expression()?;
            self.emit_indexed(Opcode::Call, 1);
        } else {
            self.emit_indexed(Opcode::Call, 0);
        }
        self.emit_op(Opcode::Raise);
        self.patch_jump(ok_jump);
        self.emit_op(Opcode::Pop);
        self.end_of_statement()
    }

    fn del_statement(&mut self) -> CRes<()> {
        loop {
            self.del_target()?;
            if !self.match_token(TokenType::Comma)? {
                break;
            }
        }
        self.end_of_statement()
    }

    fn del_target(&mut self) -> CRes<()> {
        self.consume(TokenType::Identifier, "expected name in 'del'")?;
        let name = self.previous.text;
        if self.check(TokenType::Dot) || self.check(TokenType::LeftBracket) {
            // Attribute or subscript target: compile the object reference.
            self.named_variable(name, false)?;
            loop {
                if self.match_token(TokenType::Dot)? {
                    self.consume(TokenType::Identifier, "expected attribute name after '.'")?;
                    let attr = self.previous.text;
                    let idx = self.identifier_constant(attr);
                    if self.check(TokenType::Dot) || self.check(TokenType::LeftBracket) {
                        self.emit_indexed(Opcode::GetProperty, idx);
                    } else {
                        self.emit_indexed(Opcode::DelProperty, idx);
                        return Ok(());
                    }
                } else if self.match_token(TokenType::LeftBracket)? {
                    self.expression()?;
                    self.consume(TokenType::RightBracket, "expected ']'")?;
                    if self.check(TokenType::Dot) || self.check(TokenType::LeftBracket) {
                        let idx = self.identifier_constant("__getitem__");
                        self.emit_indexed(Opcode::CallMethod, idx);
                        self.emit_byte(1);
                    } else {
                        let idx = self.identifier_constant("__delitem__");
                        self.emit_indexed(Opcode::CallMethod, idx);
                        self.emit_byte(1);
                        self.emit_op(Opcode::Pop);
                        return Ok(());
                    }
                } else {
                    return Err(self.error("expected '.' or '[' in 'del' target"));
                }
            }
        }
        let function = self.functions.len() - 1;
        if self.resolve_local(function, name).is_some() {
            Err(self.error("cannot delete a local variable"))
        } else {
            let idx = self.identifier_constant(name);
            self.emit_indexed(Opcode::DelGlobal, idx);
            Ok(())
        }
    }

    // ----- imports -----

    fn import_statement(&mut self) -> CRes<()> {
        loop {
            self.consume(TokenType::Identifier, "expected module name")?;
            let module = self.previous.text;
            let bind_name = if self.match_token(TokenType::As)? {
                self.consume(TokenType::Identifier, "expected name after 'as'")?;
                self.previous.text
            } else {
                module
            };
            let import_idx = self.identifier_constant("__import__");
            self.emit_indexed(Opcode::GetGlobal, import_idx);
            let name_id = self.intern_rooted(module);
            self.emit_constant(Value::Ref(name_id));
            self.emit_indexed(Opcode::Call, 1);
            self.define_variable(bind_name)?;
            if !self.match_token(TokenType::Comma)? {
                break;
            }
        }
        self.end_of_statement()
    }

    fn from_import_statement(&mut self) -> CRes<()> {
        self.consume(TokenType::Identifier, "expected module name")?;
        let module = self.previous.text;
        self.consume(TokenType::Import, "expected 'import'")?;
        let import_idx = self.identifier_constant("__import__");
        self.emit_indexed(Opcode::GetGlobal, import_idx);
        let name_id = self.intern_rooted(module);
        self.emit_constant(Value::Ref(name_id));
        self.emit_indexed(Opcode::Call, 1);
        let mut bindings: SmallVec<[(&'src str, &'src str); 4]> = SmallVec::new();
        loop {
            self.consume(TokenType::Identifier, "expected name to import")?;
            let member = self.previous.text;
            let bind = if self.match_token(TokenType::As)? {
                self.consume(TokenType::Identifier, "expected name after 'as'")?;
                self.previous.text
            } else {
                member
            };
            bindings.push((member, bind));
            if !self.match_token(TokenType::Comma)? {
                break;
            }
        }
        if self.at_module_scope() {
            // The module object is consumed by the last member fetch.
            let last = bindings.len() - 1;
            for (i, (member, bind)) in bindings.iter().enumerate() {
                if i != last {
                    self.emit_indexed(Opcode::Dup, 0);
                }
                let idx = self.identifier_constant(member);
                self.emit_indexed(Opcode::GetProperty, idx);
                let bind_idx = self.identifier_constant(bind);
                self.emit_indexed(Opcode::DefineGlobal, bind_idx);
            }
        } else {
            // Bound locals stay on the stack, so fetch each member from a
            // hidden slot holding the module instead of from the top.
            let module_slot = self.add_local("")?;
            for (member, bind) in bindings.clone() {
                self.emit_indexed(Opcode::GetLocal, usize::from(module_slot));
                let idx = self.identifier_constant(member);
                self.emit_indexed(Opcode::GetProperty, idx);
                self.add_local(bind)?;
            }
        }
        self.end_of_statement()
    }

    fn export_statement(&mut self) -> CRes<()> {
        let idx = self.identifier_constant("__export__");
        self.emit_indexed(Opcode::GetGlobal, idx);
        let mut count = 0usize;
        loop {
            self.consume(TokenType::Identifier, "expected name to export")?;
            let name = self.previous.text;
            let id = self.intern_rooted(name);
            self.emit_constant(Value::Ref(id));
            count += 1;
            if !self.match_token(TokenType::Comma)? {
                break;
            }
        }
        self.emit_indexed(Opcode::Call, count);
        self.emit_op(Opcode::Pop);
        self.end_of_statement()
    }

    /// Binds the value on top of the stack to `name` in the right scope.
    fn define_variable(&mut self, name: &'src str) -> CRes<()> {
        if self.at_module_scope() {
            let idx = self.identifier_constant(name);
            self.emit_indexed(Opcode::DefineGlobal, idx);
        } else {
            self.add_local(name)?;
        }
        Ok(())
    }

    // ----- functions and classes -----

    fn def_statement(&mut self, width: u32, extra_flags: u8) -> CRes<()> {
        self.consume(TokenType::Identifier, "expected function name")?;
        let name = self.previous.text;
        if self.at_module_scope() {
            self.function_body(FunctionType::Function, name, width, extra_flags)?;
            let idx = self.identifier_constant(name);
            self.emit_indexed(Opcode::DefineGlobal, idx);
        } else {
            // Declare first so the body can capture itself for recursion;
            // CLOSURE consumes any defaults and lands in the new slot.
            self.add_local(name)?;
            self.function_body(FunctionType::Function, name, width, extra_flags)?;
        }
        // A def ends with its block; no trailing Eol of its own.
        Ok(())
    }

    /// `@decorator` lines stacked over a `def` or `class`.
    fn decorated_statement(&mut self, width: u32) -> CRes<()> {
        let mut count = 0usize;
        loop {
            self.expression()?;
            count += 1;
            self.consume(TokenType::Eol, "expected end of line after decorator")?;
            if self.current.ty != TokenType::Indentation || self.current.width != width {
                return Err(self.error("expected 'def' or 'class' after decorator"));
            }
            self.advance()?;
            if self.match_token(TokenType::At)? {
                continue;
            }
            break;
        }
        if !self.match_token(TokenType::Def)? {
            return Err(self.error("expected 'def' after decorator"));
        }
        self.consume(TokenType::Identifier, "expected function name")?;
        let name = self.previous.text;
        self.function_body(FunctionType::Function, name, width, 0)?;
        for _ in 0..count {
            self.emit_indexed(Opcode::Call, 1);
        }
        self.define_variable(name)?;
        Ok(())
    }

    /// Compiles a function definition from its parameter list through its
    /// body, leaving the closure on the stack.
    fn function_body(&mut self, ty: FunctionType, name: &'src str, width: u32, extra_flags: u8) -> CRes<()> {
        let name_id = self.intern_rooted(name);
        let qualname = if self.func_ref().ty == FunctionType::Module {
            name.to_string()
        } else {
            format!("{}.{}", self.func_ref().qualname, name)
        };
        let mut inner = FunctionCompiler::new(ty, name_id, qualname);
        inner.flags |= extra_flags;
        self.functions.push(inner);
        self.begin_scope();

        self.consume(TokenType::LeftParen, "expected '(' after function name")?;
        let mut defaults = 0usize;
        let mut kw_defaults = 0usize;
        let mut kw_only = false;
        if !self.check(TokenType::RightParen) {
            loop {
                if self.match_token(TokenType::Star)? {
                    if self.func_ref().flags & CODE_COLLECTS_ARGS != 0 {
                        return Err(self.error("duplicate '*' in parameter list"));
                    }
                    self.func().flags |= CODE_COLLECTS_ARGS;
                    // The collected tuple's slot comes right after the
                    // positional parameters. A bare `*` keeps the slot
                    // anonymously and simply discards extras.
                    if self.check(TokenType::Identifier) {
                        self.advance()?;
                        let star_name = self.previous.text;
                        self.add_local(star_name)?;
                    } else {
                        self.add_local("")?;
                    }
                    kw_only = true;
                } else if self.match_token(TokenType::StarStar)? {
                    self.consume(TokenType::Identifier, "expected parameter name after '**'")?;
                    let kw_name = self.previous.text;
                    self.func().flags |= CODE_COLLECTS_KWARGS;
                    self.add_local(kw_name)?;
                } else {
                    let param = if self.match_token(TokenType::SelfKw)? {
                        "self"
                    } else {
                        self.consume(TokenType::Identifier, "expected parameter name")?;
                        self.previous.text
                    };
                    let param_id = self.intern_rooted(param);
                    if self.match_token(TokenType::Colon)? {
                        self.skip_annotation()?;
                    }
                    if kw_only {
                        self.func().keyword_only.push(param_id);
                        if self.match_token(TokenType::Assign)? {
                            self.compile_default_in_enclosing()?;
                            kw_defaults += 1;
                        } else if kw_defaults > 0 {
                            return Err(self.error("parameter without default follows parameter with default"));
                        }
                    } else {
                        self.func().positional.push(param_id);
                        if self.match_token(TokenType::Assign)? {
                            self.compile_default_in_enclosing()?;
                            defaults += 1;
                        } else if defaults > 0 {
                            return Err(self.error("parameter without default follows parameter with default"));
                        }
                    }
                    self.add_local(param)?;
                }
                if !self.match_token(TokenType::Comma)? {
                    break;
                }
                if self.check(TokenType::RightParen) {
                    break;
                }
            }
        }
        self.consume(TokenType::RightParen, "expected ')' after parameters")?;
        self.func().default_count = defaults as u8;
        self.func().kw_default_count = kw_defaults as u8;
        if self.match_token(TokenType::Arrow)? {
            self.skip_annotation()?;
        }

        self.body(width)?;
        self.emit_op(Opcode::None);
        self.emit_op(Opcode::Return);

        let inner = self.functions.pop().expect("function compiler missing");
        let upvalues: Vec<UpvalueDesc> = inner.upvalues.clone();
        let code_id = self.finish_function(inner);
        let const_idx = self.make_constant(Value::Ref(code_id));
        self.emit_closure(const_idx, &upvalues);
        Ok(())
    }

    /// Emits `CLOSURE` with its trailing capture table. Default values
    /// were already pushed by the enclosing code; `CLOSURE` consumes them.
    fn emit_closure(&mut self, const_idx: usize, upvalues: &[UpvalueDesc]) {
        self.emit_indexed(Opcode::Closure, const_idx);
        for upvalue in upvalues {
            self.emit_byte(u8::from(upvalue.is_local));
            let bytes = upvalue.index.to_le_bytes();
            self.emit_byte(bytes[0]);
            self.emit_byte(bytes[1]);
        }
    }

    /// Default-value expressions evaluate at definition time in the
    /// enclosing scope, so emission is temporarily redirected one level up.
    fn compile_default_in_enclosing(&mut self) -> CRes<()> {
        let inner = self.functions.pop().expect("function compiler missing");
        let result = self.expression();
        self.functions.push(inner);
        result
    }

    /// Parses and discards an annotation expression.
    fn skip_annotation(&mut self) -> CRes<()> {
        // Compile into a scratch position and drop the emitted code.
        let mark = self.func_ref().chunk.code.len();
        self.expression()?;
        self.func().chunk.code.truncate(mark);
        Ok(())
    }

    fn class_statement(&mut self, width: u32) -> CRes<()> {
        self.consume(TokenType::Identifier, "expected class name")?;
        let name = self.previous.text;
        let name_idx = self.identifier_constant(name);

        // Bind the class name first so the base-scope bookkeeping below
        // cannot disturb its slot; the class is re-loaded for the body.
        self.emit_indexed(Opcode::Class, name_idx);
        self.define_variable(name)?;

        let has_base = if self.match_token(TokenType::LeftParen)? {
            if self.match_token(TokenType::RightParen)? {
                false
            } else {
                self.begin_scope();
                self.expression()?;
                self.add_local("super")?;
                self.consume(TokenType::RightParen, "expected ')' after base class")?;
                true
            }
        } else {
            false
        };

        // Re-load the class for INHERIT and the METHOD installs.
        self.named_variable(name, false)?;
        if has_base {
            // Stack: [base("super" local), class] — INHERIT copies the
            // base's attributes into the class and pops the class.
            self.emit_op(Opcode::Inherit);
            self.named_variable(name, false)?;
        }

        self.class_body(width)?;

        self.emit_op(Opcode::Pop); // the re-loaded class
        if has_base {
            self.end_scope(); // pops (or closes) the "super" local
        }
        Ok(())
    }

    /// Class bodies are a restricted statement set executed at definition
    /// time: methods, attribute assignments, docstrings, `pass`.
    fn class_body(&mut self, width: u32) -> CRes<()> {
        self.consume(TokenType::Colon, "expected ':' after class header")?;
        if !self.match_token(TokenType::Eol)? {
            self.class_member(width)?;
            return Ok(());
        }
        if !self.check(TokenType::Indentation) || self.current.width <= width {
            return Err(self.error("expected an indented class body"));
        }
        let block_width = self.current.width;
        while self.check(TokenType::Indentation) && self.current.width >= block_width {
            self.advance()?;
            self.class_member(block_width)?;
        }
        Ok(())
    }

    fn class_member(&mut self, width: u32) -> CRes<()> {
        use TokenType as T;
        match self.current.ty {
            T::Pass => {
                self.advance()?;
                self.end_of_statement()
            }
            T::Str => {
                // Docstring.
                self.advance()?;
                let cooked = unescape(self.previous.text).map_err(|m| self.error(m))?;
                let id = self.intern_rooted(&cooked);
                self.emit_constant(Value::Ref(id));
                let idx = self.identifier_constant("__doc__");
                self.emit_indexed(Opcode::Method, idx);
                self.end_of_statement()
            }
            T::Def => {
                self.advance()?;
                self.consume(TokenType::Identifier, "expected method name")?;
                let method_name = self.previous.text;
                let ty = if method_name == "__init__" {
                    FunctionType::Initializer
                } else {
                    FunctionType::Method
                };
                let idx = self.identifier_constant(method_name);
                self.function_body(ty, method_name, width, 0)?;
                self.emit_indexed(Opcode::Method, idx);
                Ok(())
            }
            T::At => {
                self.advance()?;
                let mut count = 0usize;
                loop {
                    self.expression()?;
                    count += 1;
                    self.consume(TokenType::Eol, "expected end of line after decorator")?;
                    if self.current.ty != TokenType::Indentation || self.current.width != width {
                        return Err(self.error("expected 'def' after decorator"));
                    }
                    self.advance()?;
                    if self.match_token(TokenType::At)? {
                        continue;
                    }
                    break;
                }
                self.consume(TokenType::Def, "expected 'def' after decorator")?;
                self.consume(TokenType::Identifier, "expected method name")?;
                let method_name = self.previous.text;
                let idx = self.identifier_constant(method_name);
                self.function_body(FunctionType::Method, method_name, width, 0)?;
                for _ in 0..count {
                    self.emit_indexed(Opcode::Call, 1);
                }
                self.emit_indexed(Opcode::Method, idx);
                Ok(())
            }
            T::Identifier => {
                // Class attribute: `name = expr`.
                let attr = self.current.text;
                self.advance()?;
                self.consume(TokenType::Assign, "expected '=' in class attribute")?;
                self.expression()?;
                let idx = self.identifier_constant(attr);
                self.emit_indexed(Opcode::Method, idx);
                self.end_of_statement()
            }
            _ => Err(self.error("unexpected statement in class body")),
        }
    }

    fn lambda(&mut self) -> CRes<()> {
        let name_id = self.intern_rooted("<lambda>");
        let qualname = format!("{}.<lambda>", self.func_ref().qualname);
        let inner = FunctionCompiler::new(FunctionType::Lambda, name_id, qualname);
        self.functions.push(inner);
        self.begin_scope();
        let mut defaults = 0usize;
        if !self.check(TokenType::Colon) {
            loop {
                let param = if self.match_token(TokenType::SelfKw)? {
                    "self"
                } else {
                    self.consume(TokenType::Identifier, "expected parameter name")?;
                    self.previous.text
                };
                let param_id = self.intern_rooted(param);
                self.func().positional.push(param_id);
                if self.match_token(TokenType::Assign)? {
                    self.compile_default_in_enclosing()?;
                    defaults += 1;
                } else if defaults > 0 {
                    return Err(self.error("parameter without default follows parameter with default"));
                }
                self.add_local(param)?;
                if !self.match_token(TokenType::Comma)? {
                    break;
                }
            }
        }
        self.func().default_count = defaults as u8;
        self.consume(TokenType::Colon, "expected ':' in lambda")?;
        self.expression()?;
        self.emit_op(Opcode::Return);
        let inner = self.functions.pop().expect("lambda compiler missing");
        let upvalues: Vec<UpvalueDesc> = inner.upvalues.clone();
        let code_id = self.finish_function(inner);
        let const_idx = self.make_constant(Value::Ref(code_id));
        self.emit_closure(const_idx, &upvalues);
        Ok(())
    }

    // ----- try / with -----

    /// Reserves a compiler slot for a stack value the emitted code keeps
    /// live across statements (a handler marker, and later the exception
    /// that replaces it). Keeps local numbering aligned with the stack.
    fn add_hidden_slot(&mut self) -> CRes<u16> {
        self.add_local("")
    }

    /// Retires a hidden slot whose runtime value every path has already
    /// consumed. Compile-time bookkeeping only; emits nothing.
    fn drop_hidden_slot(&mut self) {
        self.func().locals.pop();
    }

    fn rename_local(&mut self, slot: u16, name: &'src str) {
        self.func().locals[usize::from(slot)].name = name;
    }

    fn try_statement(&mut self, width: u32) -> CRes<()> {
        // When a finally block exists it wraps everything; we discover it
        // only after the handlers, so the outer guard is always emitted and
        // patched to a plain re-raise shim when no finally block follows.
        // Each handler marker owns a hidden slot; the exception delivered
        // to a handler lands in that same slot.
        let outer_try = self.emit_jump(Opcode::PushTry);
        self.add_hidden_slot()?;
        let inner_try = self.emit_jump(Opcode::PushTry);
        let inner_slot = self.add_hidden_slot()?;

        self.begin_scope();
        self.body(width)?;
        self.end_scope();
        self.emit_op(Opcode::Pop); // inner handler, normal completion
        let after_body = self.emit_jump(Opcode::Jump);

        // Handler: the exception replaces the inner handler's slot.
        self.patch_jump(inner_try);
        let mut end_jumps: SmallVec<[usize; 4]> = SmallVec::new();
        let mut saw_bare_except = false;
        let mut saw_any_except = false;
        while let Some(TokenType::Except) = self.block_continuation(width, &[TokenType::Except])? {
            saw_any_except = true;
            if saw_bare_except {
                return Err(self.error("bare 'except' must be the last clause"));
            }
            let next_clause = if self.check(TokenType::Colon) || self.check(TokenType::As) {
                saw_bare_except = self.check(TokenType::Colon);
                None
            } else {
                self.emit_indexed(Opcode::Dup, 0);
                self.expression()?;
                self.emit_op(Opcode::FilterExcept);
                let skip = self.emit_jump(Opcode::JumpIfFalse);
                self.emit_op(Opcode::Pop); // match flag
                Some(skip)
            };
            // The exception stays in the hidden slot for the clause body;
            // `as` just names that slot.
            let bound = if self.match_token(TokenType::As)? {
                self.consume(TokenType::Identifier, "expected name after 'as'")?;
                let bind = self.previous.text;
                self.rename_local(inner_slot, bind);
                true
            } else {
                false
            };
            self.begin_scope();
            self.body(width)?;
            self.end_scope();
            if bound {
                self.rename_local(inner_slot, "");
            }
            self.emit_op(Opcode::Pop); // exception
            end_jumps.push(self.emit_jump(Opcode::Jump));
            if let Some(skip) = next_clause {
                self.patch_jump(skip);
                self.emit_op(Opcode::Pop); // match flag
            }
        }
        // No clause matched: re-raise the exception on top of the stack.
        if !saw_any_except || !saw_bare_except {
            self.emit_op(Opcode::Raise);
        }

        // Both paths arrive with the inner slot consumed: the normal path
        // popped its handler, the clauses popped the exception.
        self.patch_jump(after_body);
        self.drop_hidden_slot(); // inner
        // Optional else clause: runs only on normal completion.
        if let Some(TokenType::Else) = self.block_continuation(width, &[TokenType::Else])? {
            if !saw_any_except {
                return Err(self.error("'else' requires at least one 'except' clause"));
            }
            self.begin_scope();
            self.body(width)?;
            self.end_scope();
        }
        for jump in end_jumps {
            self.patch_jump(jump);
        }

        // Optional finally: compiled twice, for the normal and the
        // exceptional path, by rewinding the scanner across the block.
        self.emit_op(Opcode::Pop); // outer handler, normal completion
        if let Some(TokenType::Finally) = self.block_continuation(width, &[TokenType::Finally])? {
            let block_start = self.checkpoint();
            self.begin_scope();
            self.body(width)?;
            self.end_scope();
            let done = self.emit_jump(Opcode::Jump);
            self.patch_jump(outer_try);
            // Exception path: the exception sits in the outer slot; run
            // the block, then re-raise.
            self.rewind(block_start);
            self.begin_scope();
            self.body(width)?;
            self.end_scope();
            self.emit_op(Opcode::Raise);
            self.patch_jump(done);
        } else {
            let done = self.emit_jump(Opcode::Jump);
            self.patch_jump(outer_try);
            self.emit_op(Opcode::Raise);
            self.patch_jump(done);
        }
        self.drop_hidden_slot(); // outer
        Ok(())
    }

    fn with_statement(&mut self, width: u32) -> CRes<()> {
        self.begin_scope();
        self.expression()?;
        let ctx_slot = self.add_local("")?;
        self.emit_indexed(Opcode::GetLocal, usize::from(ctx_slot));
        let enter_idx = self.identifier_constant("__enter__");
        self.emit_indexed(Opcode::CallMethod, enter_idx);
        self.emit_byte(0);
        if self.match_token(TokenType::As)? {
            self.consume(TokenType::Identifier, "expected name after 'as'")?;
            let bind = self.previous.text;
            self.add_local(bind)?;
        } else {
            self.emit_op(Opcode::Pop);
        }

        let cleanup = self.emit_jump(Opcode::PushWith);
        self.add_hidden_slot()?;
        self.begin_scope();
        self.body(width)?;
        self.end_scope();
        self.emit_op(Opcode::Pop); // handler, normal completion
        self.emit_indexed(Opcode::GetLocal, usize::from(ctx_slot));
        let exit_idx = self.identifier_constant("__exit__");
        self.emit_indexed(Opcode::GetProperty, exit_idx);
        self.emit_op(Opcode::None);
        self.emit_op(Opcode::None);
        self.emit_op(Opcode::None);
        self.emit_indexed(Opcode::Call, 3);
        self.emit_op(Opcode::Pop);
        let done = self.emit_jump(Opcode::Jump);

        // Exceptional path: the exception sits in the handler's slot.
        // Call __exit__(type, value, traceback); truthy suppresses.
        self.patch_jump(cleanup);
        self.emit_indexed(Opcode::GetLocal, usize::from(ctx_slot));
        self.emit_indexed(Opcode::GetProperty, exit_idx);
        self.emit_indexed(Opcode::Dup, 1);
        let class_idx = self.identifier_constant("__class__");
        self.emit_indexed(Opcode::GetProperty, class_idx);
        self.emit_indexed(Opcode::Dup, 2);
        self.emit_indexed(Opcode::Dup, 3);
        let tb_idx = self.identifier_constant("__traceback__");
        self.emit_indexed(Opcode::GetProperty, tb_idx);
        self.emit_indexed(Opcode::Call, 3);
        let suppress = self.emit_jump(Opcode::JumpIfTrue);
        self.emit_op(Opcode::Pop); // __exit__ result
        self.emit_op(Opcode::Raise);
        self.patch_jump(suppress);
        self.emit_op(Opcode::Pop); // __exit__ result
        self.emit_op(Opcode::Pop); // exception

        self.patch_jump(done);
        self.drop_hidden_slot(); // handler slot; consumed on every path
        self.end_scope();
        Ok(())
    }

    // ==================================================================
    // Finalization
    // ==================================================================

    /// Seals a finished function compiler into a heap code object.
    fn finish_function(&mut self, func: FunctionCompiler<'src>) -> HeapId {
        let code = CodeObject {
            chunk: func.chunk,
            name: func.name,
            qualname: func.qualname.into_boxed_str(),
            filename: Rc::clone(&self.filename),
            positional: func.positional,
            default_count: func.default_count,
            keyword_only: func.keyword_only,
            kw_default_count: func.kw_default_count,
            flags: func.flags,
            upvalue_count: func.upvalues.len() as u16,
            max_locals: func.max_locals as u16,
            local_names: func.local_names,
            docstring: func.docstring,
            overlong_jumps: func.overlong_jumps,
        };
        let id = self.heap.allocate(HeapData::Code(Rc::new(code)));
        self.heap.push_compiler_root(id);
        id
    }
}

/// Maps an augmented-assignment token to its binary opcode.
fn binary_op_for_augmented(ty: TokenType) -> Opcode {
    match ty {
        TokenType::PlusAssign => Opcode::Add,
        TokenType::MinusAssign => Opcode::Subtract,
        TokenType::StarAssign | TokenType::AtAssign => Opcode::Multiply,
        TokenType::StarStarAssign => Opcode::Pow,
        TokenType::SlashAssign => Opcode::Divide,
        TokenType::SlashSlashAssign => Opcode::Floordiv,
        TokenType::PercentAssign => Opcode::Modulo,
        TokenType::AmpAssign => Opcode::Bitand,
        TokenType::PipeAssign => Opcode::Bitor,
        TokenType::CaretAssign => Opcode::Bitxor,
        TokenType::LeftShiftAssign => Opcode::Bitshiftl,
        TokenType::RightShiftAssign => Opcode::Bitshiftr,
        _ => unreachable!("not an augmented assignment token"),
    }
}

/// Infix precedence of a token, or `Prec::None` when it has no infix role.
fn infix_precedence(ty: TokenType) -> Prec {
    use TokenType as T;
    match ty {
        T::If => Prec::Ternary,
        T::Or => Prec::Or,
        T::And => Prec::And,
        T::EqualEqual
        | T::BangEqual
        | T::Less
        | T::Greater
        | T::LessEqual
        | T::GreaterEqual
        | T::In
        | T::Is
        | T::Not => Prec::Comparison,
        T::Pipe => Prec::BitOr,
        T::Caret => Prec::BitXor,
        T::Amp => Prec::BitAnd,
        T::LeftShift | T::RightShift => Prec::Shift,
        T::Plus | T::Minus => Prec::Term,
        T::Star | T::Slash | T::SlashSlash | T::Percent | T::At => Prec::Factor,
        T::StarStar => Prec::Power,
        T::LeftParen | T::LeftBracket | T::Dot => Prec::Call,
        _ => Prec::None,
    }
}

/// Processes escape sequences in a raw bytes-literal body.
///
/// Unlike [`unescape`], `\x` escapes produce raw bytes rather than
/// codepoints; other characters contribute their UTF-8 encoding.
fn unescape_bytes(raw: &str) -> Result<Vec<u8>, &'static str> {
    let mut out = Vec::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            let mut buf = [0u8; 4];
            out.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
            continue;
        }
        let Some(escape) = chars.next() else {
            return Err("trailing backslash in bytes literal");
        };
        match escape {
            'n' => out.push(b'\n'),
            'r' => out.push(b'\r'),
            't' => out.push(b'\t'),
            'a' => out.push(0x07),
            'b' => out.push(0x08),
            'f' => out.push(0x0c),
            'v' => out.push(0x0b),
            '0' => out.push(0),
            '\\' => out.push(b'\\'),
            '\'' => out.push(b'\''),
            '"' => out.push(b'"'),
            '\n' => {}
            'x' => {
                let hi = chars.next().ok_or("truncated \\x escape")?;
                let lo = chars.next().ok_or("truncated \\x escape")?;
                let byte =
                    u8::from_str_radix(&format!("{hi}{lo}"), 16).map_err(|_| "invalid \\x escape")?;
                out.push(byte);
            }
            other => {
                out.push(b'\\');
                let mut buf = [0u8; 4];
                out.extend_from_slice(other.encode_utf8(&mut buf).as_bytes());
            }
        }
    }
    Ok(out)
}

/// Processes escape sequences in a raw string body.
pub(crate) fn unescape(raw: &str) -> Result<String, &'static str> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        let Some(escape) = chars.next() else {
            return Err("trailing backslash in string");
        };
        match escape {
            'n' => out.push('\n'),
            'r' => out.push('\r'),
            't' => out.push('\t'),
            'a' => out.push('\x07'),
            'b' => out.push('\x08'),
            'f' => out.push('\x0c'),
            'v' => out.push('\x0b'),
            '0' => out.push('\0'),
            '\\' => out.push('\\'),
            '\'' => out.push('\''),
            '"' => out.push('"'),
            '\n' => {}
            'x' => {
                let hi = chars.next().ok_or("truncated \\x escape")?;
                let lo = chars.next().ok_or("truncated \\x escape")?;
                let byte =
                    u8::from_str_radix(&format!("{hi}{lo}"), 16).map_err(|_| "invalid \\x escape")?;
                out.push(char::from(byte));
            }
            'u' => {
                let mut value = 0u32;
                for _ in 0..4 {
                    let digit = chars.next().ok_or("truncated \\u escape")?;
                    value = value * 16 + digit.to_digit(16).ok_or("invalid \\u escape")?;
                }
                out.push(char::from_u32(value).ok_or("invalid \\u escape")?);
            }
            'U' => {
                let mut value = 0u32;
                for _ in 0..8 {
                    let digit = chars.next().ok_or("truncated \\U escape")?;
                    value = value * 16 + digit.to_digit(16).ok_or("invalid \\U escape")?;
                }
                out.push(char::from_u32(value).ok_or("invalid \\U escape")?);
            }
            other => {
                // Unknown escapes keep the backslash, like the scanners of
                // our reference languages.
                out.push('\\');
                out.push(other);
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{chunk::CODE_IS_GENERATOR, dis, heap::Heap};

    fn disassembled(source: &str) -> String {
        let mut heap = Heap::new();
        let code_id = compile(&mut heap, source, "<test>").expect("compile failed");
        let code = heap.code(code_id).share();
        dis::disassemble_code(&heap, &code)
    }

    fn compile_error(source: &str) -> CompileError {
        let mut heap = Heap::new();
        compile(&mut heap, source, "<test>").expect_err("compile unexpectedly succeeded")
    }

    /// Asserts the listing contains these needles, in order.
    fn assert_sequence(listing: &str, needles: &[&str]) {
        let mut cursor = 0usize;
        for needle in needles {
            match listing[cursor..].find(needle) {
                Some(offset) => cursor += offset + needle.len(),
                None => panic!("missing {needle:?} (after byte {cursor}) in:\n{listing}"),
            }
        }
    }

    #[test]
    fn test_arithmetic_respects_precedence() {
        let listing = disassembled("print(1 + 2 * 3)\n");
        assert_sequence(
            &listing,
            &[
                "GET_GLOBAL",
                "(\"print\")",
                "CONSTANT",
                "(1)",
                "CONSTANT",
                "(2)",
                "CONSTANT",
                "(3)",
                "MULTIPLY",
                "ADD",
                "CALL",
                "POP",
                "NONE",
                "RETURN",
            ],
        );
    }

    #[test]
    fn test_module_tail_is_none_return() {
        let listing = disassembled("pass\n");
        assert_sequence(&listing, &["== <module> ==", "NONE", "RETURN"]);
    }

    #[test]
    fn test_let_at_module_scope_defines_global() {
        let listing = disassembled("let x = 42\n");
        assert_sequence(&listing, &["CONSTANT", "(42)", "DEFINE_GLOBAL", "(\"x\")"]);
    }

    #[test]
    fn test_let_inside_function_uses_locals() {
        let listing = disassembled("def f():\n    let x = 1\n    return x\n");
        assert_sequence(&listing, &["== f ==", "CONSTANT", "(1)", "GET_LOCAL", "(x)", "RETURN"]);
        assert!(!listing.contains("DEFINE_GLOBAL           (\"x\")"));
    }

    #[test]
    fn test_if_else_shape() {
        let listing = disassembled("if 1:\n    pass\nelse:\n    pass\n");
        assert_sequence(&listing, &["JUMP_IF_FALSE", "POP", "JUMP", "POP"]);
    }

    #[test]
    fn test_and_short_circuits_with_peek_jump() {
        let listing = disassembled("1 and 2\n");
        assert_sequence(&listing, &["CONSTANT", "JUMP_IF_FALSE", "POP", "CONSTANT", "POP"]);
    }

    #[test]
    fn test_while_emits_backward_loop() {
        let listing = disassembled("while 0:\n    pass\n");
        assert_sequence(&listing, &["JUMP_IF_FALSE", "POP", "LOOP", "POP"]);
    }

    #[test]
    fn test_for_lowering_uses_iterator_sentinel() {
        let listing = disassembled("for x in y:\n    pass\n");
        assert_sequence(
            &listing,
            &[
                "GET_GLOBAL",
                "(\"y\")",
                "INVOKE_ITER",
                "GET_LOCAL",
                "INVOKE_NEXT",
                "DUP",
                "GET_LOCAL",
                "IS",
                "JUMP_IF_TRUE",
                "POP",
                "SET_LOCAL",
                "(x)",
                "LOOP",
            ],
        );
    }

    #[test]
    fn test_closure_captures_local() {
        let listing = disassembled(concat!(
            "def outer():\n",
            "    let n = 1\n",
            "    def inner():\n",
            "        return n\n",
            "    return inner\n",
        ));
        assert_sequence(&listing, &["== outer ==", "CLOSURE", "[local 1]", "== outer.inner ==", "GET_UPVALUE"]);
    }

    #[test]
    fn test_method_call_uses_call_method() {
        let listing = disassembled("x.append(1)\n");
        assert_sequence(&listing, &["CALL_METHOD", "(\"append\")", "(1 args)"]);
    }

    #[test]
    fn test_method_call_with_keywords_falls_back() {
        let listing = disassembled("x.sort(key=f)\n");
        assert_sequence(&listing, &["GET_PROPERTY", "(\"sort\")", "CONSTANT", "(\"key\")", "CALL"]);
        assert!(!listing.contains("CALL_METHOD"));
    }

    #[test]
    fn test_subscript_compiles_to_getitem() {
        let listing = disassembled("a[0]\na[1] = 2\n");
        assert_sequence(&listing, &["(\"__getitem__\")", "(\"__setitem__\")"]);
    }

    #[test]
    fn test_slice_compiles_to_getslice_with_none_bounds() {
        let listing = disassembled("a[1:]\n");
        assert_sequence(&listing, &["CONSTANT", "(1)", "NONE", "NONE", "CALL_METHOD", "(\"__getslice__\")", "(3 args)"]);
    }

    #[test]
    fn test_class_with_base_copies_methods() {
        let listing = disassembled(concat!(
            "class B(A):\n",
            "    def m(s):\n",
            "        return 1\n",
        ));
        assert_sequence(&listing, &["CLASS", "(\"B\")", "GET_GLOBAL", "(\"A\")", "INHERIT", "CLOSURE", "METHOD", "(\"m\")"]);
    }

    #[test]
    fn test_super_reads_receiver_and_base() {
        let listing = disassembled(concat!(
            "class B(A):\n",
            "    def m(s):\n",
            "        return super.m()\n",
        ));
        assert_sequence(&listing, &["== B.m ==", "GET_LOCAL", "GET_UPVALUE", "GET_SUPER", "(\"m\")"]);
    }

    #[test]
    fn test_try_except_filters() {
        let listing = disassembled(concat!(
            "try:\n",
            "    pass\n",
            "except ValueError as e:\n",
            "    pass\n",
        ));
        assert_sequence(
            &listing,
            &["PUSH_TRY", "PUSH_TRY", "POP", "JUMP", "DUP", "GET_GLOBAL", "(\"ValueError\")", "FILTER_EXCEPT", "RAISE"],
        );
    }

    #[test]
    fn test_with_emits_enter_and_exit() {
        let listing = disassembled("with ctx() as c:\n    pass\n");
        assert_sequence(&listing, &["(\"__enter__\")", "PUSH_WITH", "(\"__exit__\")", "RAISE"]);
    }

    #[test]
    fn test_finally_block_is_emitted_twice() {
        let listing = disassembled(concat!(
            "try:\n",
            "    pass\n",
            "finally:\n",
            "    cleanup()\n",
        ));
        let occurrences = listing.matches("(\"cleanup\")").count();
        assert_eq!(occurrences, 2, "finally body should appear on both paths:\n{listing}");
    }

    #[test]
    fn test_comprehension_compiles_to_hidden_function() {
        let listing = disassembled("[x * x for x in data]\n");
        assert_sequence(
            &listing,
            &["INVOKE_ITER", "CLOSURE", "SWAP", "CALL", "<listcomp> ==", "BUILD_LIST", "(\"append\")"],
        );
    }

    #[test]
    fn test_generator_expression_flags_generator() {
        let mut heap = Heap::new();
        let module = compile(&mut heap, "(x for x in data)\n", "<test>").expect("compile failed");
        let module_code = heap.code(module).share();
        let genexpr = module_code
            .chunk
            .constants
            .iter()
            .find_map(|constant| match constant {
                Value::Ref(id) => match heap.get(*id) {
                    crate::heap::HeapData::Code(code) if &*code.qualname == "<module>.<genexpr>" => Some(code.share()),
                    _ => None,
                },
                _ => None,
            })
            .expect("genexpr code object missing");
        assert!(genexpr.flags & CODE_IS_GENERATOR != 0);
    }

    #[test]
    fn test_yield_flags_generator() {
        let mut heap = Heap::new();
        let module = compile(&mut heap, "def g():\n    yield 1\n", "<test>").expect("compile failed");
        let module_code = heap.code(module).share();
        let inner = module_code
            .chunk
            .constants
            .iter()
            .find_map(|constant| match constant {
                Value::Ref(id) => match heap.get(*id) {
                    crate::heap::HeapData::Code(code) if &*code.qualname == "g" => Some(code.share()),
                    _ => None,
                },
                _ => None,
            })
            .expect("function code object missing");
        assert!(inner.flags & CODE_IS_GENERATOR != 0);
    }

    #[test]
    fn test_module_docstring_recorded_not_executed() {
        let mut heap = Heap::new();
        let module = compile(&mut heap, "\"\"\"the docs\"\"\"\npass\n", "<test>").expect("compile failed");
        let code = heap.code(module).share();
        let Some(Value::Ref(doc)) = code.docstring else {
            panic!("docstring missing");
        };
        assert_eq!(heap.as_str(doc), "the docs");
    }

    #[test]
    fn test_fstring_builds_with_str_calls() {
        let listing = disassembled("f\"a{b}c\"\n");
        assert_sequence(&listing, &["(\"a\")", "GET_GLOBAL", "(\"str\")", "GET_GLOBAL", "(\"b\")", "CALL", "ADD", "(\"c\")", "ADD"]);
    }

    #[test]
    fn test_char_literal_is_integer_constant() {
        let listing = disassembled("'a'\n");
        assert_sequence(&listing, &["CONSTANT", "(97)"]);
    }

    #[test]
    fn test_overlong_jump_diverts_through_table() {
        let mut source = String::from("if x:\n");
        for _ in 0..16000 {
            source.push_str("    y = 1\n");
        }
        let mut heap = Heap::new();
        let module = compile(&mut heap, &source, "<test>").expect("compile failed");
        let code = heap.code(module).share();
        assert!(!code.overlong_jumps.is_empty(), "expected an overlong jump entry");
        // The listing still decodes every instruction.
        let listing = dis::disassemble_code(&heap, &code);
        assert!(listing.contains("JUMP_IF_FALSE"));
    }

    #[test]
    fn test_wide_constant_form_kicks_in() {
        let mut source = String::from("let t = [");
        for i in 0..400 {
            source.push_str(&format!("{i}, "));
        }
        source.push_str("]\n");
        let listing = disassembled(&source);
        assert!(listing.contains("CONSTANT_LONG"), "expected wide constants:\n{listing}");
    }

    #[test]
    fn test_errors() {
        assert!(compile_error("return 1\n").message.contains("outside of a function"));
        assert!(compile_error("break\n").message.contains("outside of a loop"));
        assert!(compile_error("continue\n").message.contains("outside of a loop"));
        assert!(compile_error("let x = \n").message.contains("expected an expression"));
        assert!(compile_error("if x:\npass\n").message.contains("indented block"));
        assert!(compile_error("\"open\n").message.contains("unterminated"));
        assert!(compile_error("def f(a=1, b):\n    pass\n")
            .message
            .contains("without default"));
        assert!(compile_error("yield 1\n").message.contains("outside of a function"));
    }

    #[test]
    fn test_unescape() {
        assert_eq!(unescape("a\\nb").unwrap(), "a\nb");
        assert_eq!(unescape("\\x41\\u0042").unwrap(), "AB");
        assert_eq!(unescape("\\q").unwrap(), "\\q");
        assert!(unescape("tail\\").is_err());
    }
}
