// Single-pass Pratt-parsing compiler (spec.md §4.E). There is no AST: each
// grammar production emits bytecode directly into the chunk of whichever
// function is currently being compiled. Precedence climbing drives
// expression parsing; a stack of `FunctionState` drives nested function
// (and method) compilation, mirroring the call stack the VM will later use
// to run the result.

use crate::chunk::{Chunk, OpCode};
use crate::error::CompileError;
use crate::heap::Heap;
use crate::object::{ObjFunction, ObjRef};
use crate::scanner::{Scanner, Token, TokenKind};
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment, // =
    Or,         // or
    And,        // and
    Equality,   // == !=
    Comparison, // < > <= >=
    Term,       // + -
    Factor,     // * /
    Unary,      // ! -
    Call,       // . ()
    Primary,
}

impl Precedence {
    fn next(self) -> Precedence {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call => Precedence::Primary,
            Precedence::Primary => Precedence::Primary,
        }
    }
}

fn precedence_of(kind: TokenKind) -> Precedence {
    use TokenKind::*;
    match kind {
        Minus | Plus => Precedence::Term,
        Slash | Star => Precedence::Factor,
        BangEqual | EqualEqual => Precedence::Equality,
        Greater | GreaterEqual | Less | LessEqual => Precedence::Comparison,
        And => Precedence::And,
        Or => Precedence::Or,
        LeftParen | Dot => Precedence::Call,
        _ => Precedence::None,
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum FunctionType {
    Script,
    Function,
    Method,
    Initializer,
}

struct Local {
    name: Vec<u8>,
    depth: Option<usize>,
    is_captured: bool,
}

struct UpvalueRef {
    index: u8,
    is_local: bool,
}

const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;
const MAX_ARGS: usize = 255;

struct FunctionState {
    chunk: Chunk,
    function_type: FunctionType,
    name: Option<ObjRef>,
    arity: u8,
    locals: Vec<Local>,
    upvalues: Vec<UpvalueRef>,
    scope_depth: usize,
}

impl FunctionState {
    fn new(function_type: FunctionType) -> FunctionState {
        // Slot 0 is reserved: the receiver in methods/initializers, an
        // unnamed placeholder everywhere else (spec.md §4.E "call frames
        // reserve stack slot 0").
        let reserved_name = if matches!(function_type, FunctionType::Method | FunctionType::Initializer) {
            b"this".to_vec()
        } else {
            Vec::new()
        };
        FunctionState {
            chunk: Chunk::new(),
            function_type,
            name: None,
            arity: 0,
            locals: vec![Local { name: reserved_name, depth: Some(0), is_captured: false }],
            upvalues: Vec::new(),
            scope_depth: 0,
        }
    }
}

struct ClassState {
    has_superclass: bool,
}

pub struct Compiler<'src, 'h> {
    scanner: Scanner<'src>,
    previous: Token<'src>,
    current: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    errors: Vec<CompileError>,
    heap: &'h mut Heap,
    functions: Vec<FunctionState>,
    classes: Vec<ClassState>,
    /// Set when a top-level `fun main(...)` declaration is seen. Drives the
    /// implicit `main()` call `compile` appends unless `skip_main` is set
    /// (spec.md §4.E's `skip_main` flag).
    saw_top_level_main: bool,
}

/// Compile `source` as a runnable script: if it declares a top-level
/// `main()` function, an implicit call to it is appended after all other
/// top-level declarations, so running the returned function executes
/// `main` the way a scripting entry point does elsewhere in the pack.
/// Equivalent to `compile_with_options(source, heap, false)`.
pub fn compile(source: &str, heap: &mut Heap) -> Result<ObjRef, Vec<CompileError>> {
    compile_with_options(source, heap, false)
}

/// `compile(source, skip_main?)` from spec.md §6. `skip_main = true`
/// compiles module-style: top-level declarations run in order (as they
/// always do) but no implicit call to `main()` is appended even if one is
/// declared, for collaborators that load a Sox file as a library of
/// functions/classes rather than an executable script.
pub fn compile_with_options(source: &str, heap: &mut Heap, skip_main: bool) -> Result<ObjRef, Vec<CompileError>> {
    let mut compiler = Compiler {
        scanner: Scanner::new(source),
        previous: Token { kind: TokenKind::Eof, lexeme: &[], line: 0 },
        current: Token { kind: TokenKind::Eof, lexeme: &[], line: 0 },
        had_error: false,
        panic_mode: false,
        errors: Vec::new(),
        heap,
        functions: vec![FunctionState::new(FunctionType::Script)],
        classes: Vec::new(),
        saw_top_level_main: false,
    };
    compiler.advance();
    while !compiler.match_token(TokenKind::Eof) {
        compiler.declaration();
    }
    if !skip_main && compiler.saw_top_level_main && !compiler.had_error {
        compiler.emit_main_invocation();
    }
    let function = compiler.end_function();
    if compiler.had_error {
        Err(compiler.errors)
    } else {
        Ok(function)
    }
}

impl<'src, 'h> Compiler<'src, 'h> {
    // ---- token stream -----------------------------------------------------

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.scan_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let message = self.current.lexeme_str().into_owned();
            self.error_at_current(&message);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn match_token(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
        } else {
            self.error_at_current(message);
        }
    }

    fn error_at_current(&mut self, message: &str) {
        let token = self.current;
        self.error_at(token, message);
    }

    fn error(&mut self, message: &str) {
        let token = self.previous;
        self.error_at(token, message);
    }

    fn error_at(&mut self, token: Token<'src>, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        let at = if token.kind == TokenKind::Eof {
            " at end".to_string()
        } else if token.kind == TokenKind::Error {
            String::new()
        } else {
            format!(" at '{}'", token.lexeme_str())
        };
        self.errors.push(CompileError { line: token.line, at, message: message.to_string() });
        self.had_error = true;
    }

    /// Skip to the next statement boundary after a parse error, so one
    /// mistake doesn't cascade into a wall of spurious diagnostics
    /// (spec.md §4.E "panic-mode recovery").
    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Class | TokenKind::Fun | TokenKind::Var | TokenKind::For
                | TokenKind::If | TokenKind::While | TokenKind::Print | TokenKind::Return => return,
                _ => {}
            }
            self.advance();
        }
    }

    // ---- bytecode emission -------------------------------------------------

    fn chunk(&mut self) -> &mut Chunk {
        &mut self.functions.last_mut().unwrap().chunk
    }

    fn line(&self) -> usize {
        self.previous.line
    }

    fn emit_op(&mut self, op: OpCode) {
        let line = self.line();
        self.chunk().write_op(op, line);
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.line();
        self.chunk().write(byte, line);
    }

    fn emit_ops(&mut self, a: OpCode, b: u8) {
        self.emit_op(a);
        self.emit_byte(b);
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);
        let offset = self.chunk().code.len() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
        }
        let line = self.line();
        self.chunk().write_u16(offset as u16, line);
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        let line = self.line();
        self.chunk().write_u16(0xffff, line);
        self.chunk().code.len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        let jump = self.chunk().code.len() - offset - 2;
        if jump > u16::MAX as usize {
            self.error("Too much code to jump over.");
        }
        self.chunk().patch_u16(offset, jump as u16);
    }

    fn emit_return(&mut self) {
        let function_type = self.functions.last().unwrap().function_type;
        if function_type == FunctionType::Initializer {
            self.emit_ops(OpCode::GetLocal, 0);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.emit_op(OpCode::Return);
    }

    /// A generic literal constant (number/string). Unlike name-reference
    /// opcodes, `OP_CONSTANT`/`OP_CONSTANT_LONG` support pool indices past
    /// a byte, so literals alone are exempt from the 256-entry ceiling.
    fn emit_constant(&mut self, value: Value) {
        let index = self.chunk().add_constant(value);
        let line = self.line();
        self.chunk().write_constant(index, line);
    }

    /// A constant referenced by a single-byte operand (global/property/
    /// method names, classes). Enforces the byte ceiling the encoding
    /// actually supports, unlike `emit_constant`.
    fn make_name_constant(&mut self, bytes: &[u8]) -> u8 {
        let handle = self.intern(bytes);
        let index = self.chunk().add_constant(Value::Obj(handle));
        if index >= 256 {
            self.error("Too many constants in one chunk.");
            return 0;
        }
        index as u8
    }

    /// Mark every object reachable from the compiler's own state: each
    /// in-progress function's chunk (its constant pool may already hold
    /// `Value::Obj` handles to interned strings or finished nested
    /// functions) and that function's own name. This is the compiler half
    /// of spec.md §3's root set, the VM's stack/frames/globals are the
    /// other half, and each collaborator marks its own roots before a
    /// shared `trace_references`/`sweep` (spec.md §6's embedding API).
    pub fn mark_compiler_roots(&mut self) {
        for state in self.functions.iter() {
            for value in state.chunk.constants.iter() {
                self.heap.mark_value(*value);
            }
            if let Some(name) = state.name {
                self.heap.mark_object(name);
            }
        }
    }

    fn collect_garbage(&mut self) {
        log::debug!("gc begin (compile), {} bytes allocated", self.heap.bytes_allocated());
        self.mark_compiler_roots();
        self.heap.trace_references();
        self.heap.sweep();
        self.heap.update_next_gc();
        log::debug!("gc end (compile), {} bytes allocated, next at {}", self.heap.bytes_allocated(), self.heap.next_gc());
    }

    fn maybe_collect(&mut self) {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
    }

    /// Every string intern during compilation routes through here rather
    /// than calling `heap.intern` directly, so a collection triggered by
    /// the new allocation still sees the compiler's own roots.
    fn intern(&mut self, bytes: &[u8]) -> ObjRef {
        self.maybe_collect();
        self.heap.intern(bytes)
    }

    // ---- scopes and locals --------------------------------------------------

    fn begin_scope(&mut self) {
        self.functions.last_mut().unwrap().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.functions.last_mut().unwrap().scope_depth -= 1;
        let depth = self.functions.last().unwrap().scope_depth;
        loop {
            let popped = match self.functions.last().unwrap().locals.last() {
                Some(local) if local.depth.map_or(false, |d| d > depth) => Some(local.is_captured),
                _ => None,
            };
            match popped {
                Some(is_captured) => {
                    self.emit_op(if is_captured { OpCode::CloseUpvalue } else { OpCode::Pop });
                    self.functions.last_mut().unwrap().locals.pop();
                }
                None => break,
            }
        }
    }

    fn identifiers_equal(a: &[u8], b: &[u8]) -> bool {
        a == b
    }

    fn resolve_local(&mut self, func_idx: usize, name: &[u8]) -> Option<u8> {
        let found = self.functions[func_idx]
            .locals
            .iter()
            .enumerate()
            .rev()
            .find(|(_, local)| Self::identifiers_equal(&local.name, name))
            .map(|(i, local)| (i as u8, local.depth.is_none()));
        match found {
            Some((index, uninitialized)) => {
                if uninitialized && func_idx == self.functions.len() - 1 {
                    self.error("Can't read local variable in its own initializer.");
                }
                Some(index)
            }
            None => None,
        }
    }

    fn add_upvalue(&mut self, func_idx: usize, index: u8, is_local: bool) -> u8 {
        let func = &mut self.functions[func_idx];
        for (i, up) in func.upvalues.iter().enumerate() {
            if up.index == index && up.is_local == is_local {
                return i as u8;
            }
        }
        if func.upvalues.len() >= MAX_UPVALUES {
            self.error("Too many closure variables in function.");
            return 0;
        }
        func.upvalues.push(UpvalueRef { index, is_local });
        (func.upvalues.len() - 1) as u8
    }

    fn resolve_upvalue(&mut self, func_idx: usize, name: &[u8]) -> Option<u8> {
        if func_idx == 0 {
            return None;
        }
        if let Some(local_idx) = self.resolve_local(func_idx - 1, name) {
            self.functions[func_idx - 1].locals[local_idx as usize].is_captured = true;
            return Some(self.add_upvalue(func_idx, local_idx, true));
        }
        if let Some(up_idx) = self.resolve_upvalue(func_idx - 1, name) {
            return Some(self.add_upvalue(func_idx, up_idx, false));
        }
        None
    }

    fn add_local(&mut self, name: Vec<u8>) {
        let func = self.functions.last_mut().unwrap();
        if func.locals.len() >= MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }
        func.locals.push(Local { name, depth: None, is_captured: false });
    }

    fn declare_variable(&mut self) {
        let func_idx = self.functions.len() - 1;
        if self.functions[func_idx].scope_depth == 0 {
            return;
        }
        let name = self.previous.lexeme.to_vec();
        let depth = self.functions[func_idx].scope_depth;
        let mut duplicate = false;
        for local in self.functions[func_idx].locals.iter().rev() {
            if local.depth.map_or(false, |d| d < depth) {
                break;
            }
            if Self::identifiers_equal(&local.name, &name) {
                duplicate = true;
                break;
            }
        }
        if duplicate {
            self.error("Already a variable with this name in this scope.");
        }
        self.add_local(name);
    }

    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenKind::Identifier, message);
        self.declare_variable();
        if self.functions.last().unwrap().scope_depth > 0 {
            return 0;
        }
        let name = self.previous.lexeme.to_vec();
        self.make_name_constant(&name)
    }

    fn mark_initialized(&mut self) {
        let func = self.functions.last_mut().unwrap();
        if func.scope_depth == 0 {
            return;
        }
        let depth = func.scope_depth;
        if let Some(local) = func.locals.last_mut() {
            local.depth = Some(depth);
        }
    }

    fn define_variable(&mut self, global: u8) {
        if self.functions.last().unwrap().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_ops(OpCode::DefineGlobal, global);
    }

    // ---- expressions --------------------------------------------------------

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let can_assign = precedence <= Precedence::Assignment;
        if !self.prefix_rule(self.previous.kind, can_assign) {
            self.error("Expect expression.");
            return;
        }
        while precedence <= precedence_of(self.current.kind) {
            self.advance();
            self.infix_rule(self.previous.kind, can_assign);
        }
        if can_assign && self.match_token(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn prefix_rule(&mut self, kind: TokenKind, can_assign: bool) -> bool {
        match kind {
            TokenKind::LeftParen => self.grouping(),
            TokenKind::Minus | TokenKind::Bang => self.unary(kind),
            TokenKind::Number => self.number(),
            TokenKind::String => self.string(),
            TokenKind::False | TokenKind::True | TokenKind::Nil => self.literal(kind),
            TokenKind::Identifier => self.variable(can_assign),
            TokenKind::This => self.this_expr(),
            TokenKind::Super => self.super_expr(),
            _ => return false,
        }
        true
    }

    fn infix_rule(&mut self, kind: TokenKind, can_assign: bool) {
        match kind {
            TokenKind::Minus | TokenKind::Plus | TokenKind::Slash | TokenKind::Star
            | TokenKind::BangEqual | TokenKind::EqualEqual | TokenKind::Greater
            | TokenKind::GreaterEqual | TokenKind::Less | TokenKind::LessEqual => self.binary(kind),
            TokenKind::And => self.and_expr(),
            TokenKind::Or => self.or_expr(),
            TokenKind::LeftParen => self.call_expr(),
            TokenKind::Dot => self.dot_expr(can_assign),
            _ => {}
        }
    }

    fn grouping(&mut self) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn unary(&mut self, kind: TokenKind) {
        self.parse_precedence(Precedence::Unary);
        match kind {
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            TokenKind::Bang => self.emit_op(OpCode::Not),
            _ => unreachable!(),
        }
    }

    fn binary(&mut self, kind: TokenKind) {
        let prec = precedence_of(kind);
        self.parse_precedence(prec.next());
        match kind {
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Subtract),
            TokenKind::Star => self.emit_op(OpCode::Multiply),
            TokenKind::Slash => self.emit_op(OpCode::Divide),
            TokenKind::BangEqual => {
                self.emit_op(OpCode::Equal);
                self.emit_op(OpCode::Not);
            }
            TokenKind::EqualEqual => self.emit_op(OpCode::Equal),
            TokenKind::Greater => self.emit_op(OpCode::Greater),
            TokenKind::GreaterEqual => {
                self.emit_op(OpCode::Less);
                self.emit_op(OpCode::Not);
            }
            TokenKind::Less => self.emit_op(OpCode::Less),
            TokenKind::LessEqual => {
                self.emit_op(OpCode::Greater);
                self.emit_op(OpCode::Not);
            }
            _ => unreachable!(),
        }
    }

    fn number(&mut self) {
        let text = self.previous.lexeme_str();
        let value: f64 = text.parse().unwrap_or(0.0);
        self.emit_constant(Value::Number(value));
    }

    fn string(&mut self) {
        let raw = self.previous.lexeme;
        let bytes = &raw[1..raw.len() - 1]; // strip quotes
        let handle = self.intern(bytes);
        self.emit_constant(Value::Obj(handle));
    }

    fn literal(&mut self, kind: TokenKind) {
        match kind {
            TokenKind::False => self.emit_op(OpCode::False),
            TokenKind::True => self.emit_op(OpCode::True),
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            _ => unreachable!(),
        }
    }

    fn named_variable(&mut self, name: &[u8], can_assign: bool) {
        let func_idx = self.functions.len() - 1;
        let (get_op, set_op, arg) = if let Some(slot) = self.resolve_local(func_idx, name) {
            (OpCode::GetLocal, OpCode::SetLocal, slot)
        } else if let Some(slot) = self.resolve_upvalue(func_idx, name) {
            (OpCode::GetUpvalue, OpCode::SetUpvalue, slot)
        } else {
            let slot = self.make_name_constant(name);
            (OpCode::GetGlobal, OpCode::SetGlobal, slot)
        };

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_ops(set_op, arg);
        } else {
            self.emit_ops(get_op, arg);
        }
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.previous.lexeme.to_vec();
        self.named_variable(&name, can_assign);
    }

    fn this_expr(&mut self) {
        if self.classes.is_empty() {
            self.error("Can't use 'this' outside of a class.");
            return;
        }
        self.named_variable(b"this", false);
    }

    fn super_expr(&mut self) {
        if self.classes.is_empty() {
            self.error("Can't use 'super' outside of a class.");
        } else if !self.classes.last().unwrap().has_superclass {
            self.error("Can't use 'super' in a class with no superclass.");
        }
        self.consume(TokenKind::Dot, "Expect '.' after 'super'.");
        self.consume(TokenKind::Identifier, "Expect superclass method name.");
        let name = self.previous.lexeme.to_vec();
        let method_constant = self.make_name_constant(&name);

        let func_idx = self.functions.len() - 1;
        self.named_variable(b"this", false);
        if self.match_token(TokenKind::LeftParen) {
            let arg_count = self.argument_list();
            self.named_variable_super(func_idx);
            self.emit_op(OpCode::SuperInvoke);
            self.emit_byte(method_constant);
            self.emit_byte(arg_count);
        } else {
            self.named_variable_super(func_idx);
            self.emit_ops(OpCode::GetSuper, method_constant);
        }
    }

    fn named_variable_super(&mut self, func_idx: usize) {
        // Looks up "super" exactly like any other captured variable, it
        // is bound as a synthetic local/upvalue when the enclosing class
        // has a superclass (see `class_declaration`).
        if let Some(slot) = self.resolve_local(func_idx, b"super") {
            self.emit_ops(OpCode::GetLocal, slot);
        } else if let Some(slot) = self.resolve_upvalue(func_idx, b"super") {
            self.emit_ops(OpCode::GetUpvalue, slot);
        }
    }

    fn and_expr(&mut self) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_expr(&mut self) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: usize = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if count >= MAX_ARGS {
                    self.error("Can't have more than 255 arguments.");
                }
                count += 1;
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        count as u8
    }

    fn call_expr(&mut self) {
        let arg_count = self.argument_list();
        self.emit_ops(OpCode::Call, arg_count);
    }

    fn dot_expr(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let name = self.previous.lexeme.to_vec();
        let name_constant = self.make_name_constant(&name);

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_ops(OpCode::SetProperty, name_constant);
        } else if self.match_token(TokenKind::LeftParen) {
            let arg_count = self.argument_list();
            self.emit_op(OpCode::Invoke);
            self.emit_byte(name_constant);
            self.emit_byte(arg_count);
        } else {
            self.emit_ops(OpCode::GetProperty, name_constant);
        }
    }

    // ---- statements -----------------------------------------------------

    fn declaration(&mut self) {
        if self.match_token(TokenKind::Class) {
            self.class_declaration();
        } else if self.match_token(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn statement(&mut self) {
        if self.match_token(TokenKind::Print) {
            self.print_statement();
        } else if self.match_token(TokenKind::If) {
            self.if_statement();
        } else if self.match_token(TokenKind::Return) {
            self.return_statement();
        } else if self.match_token(TokenKind::While) {
            self.while_statement();
        } else if self.match_token(TokenKind::For) {
            self.for_statement();
        } else if self.match_token(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");
        if self.match_token(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.");
        self.define_variable(global);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_op(OpCode::Pop);
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit_op(OpCode::Print);
    }

    fn return_statement(&mut self) {
        if self.functions.last().unwrap().function_type == FunctionType::Script {
            self.error("Can't return from top-level code.");
        }
        if self.match_token(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.functions.last().unwrap().function_type == FunctionType::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_op(OpCode::Return);
        }
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();

        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);

        if self.match_token(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.chunk().code.len();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
    }

    /// Desugars into a `while` loop wrapped in its own scope, the way
    /// clox-style compilers do to avoid a dedicated for-loop opcode.
    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");

        if self.match_token(TokenKind::Semicolon) {
            // no initializer
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.chunk().code.len();
        let mut exit_jump: Option<usize> = None;
        if !self.match_token(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.match_token(TokenKind::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.chunk().code.len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit) = exit_jump {
            self.patch_jump(exit);
            self.emit_op(OpCode::Pop);
        }
        self.end_scope();
    }

    // ---- functions and classes -------------------------------------------

    fn end_function(&mut self) -> ObjRef {
        self.emit_return();
        self.maybe_collect();
        let func = self.functions.pop().unwrap();
        let object = ObjFunction {
            arity: func.arity,
            upvalue_count: func.upvalues.len(),
            chunk: func.chunk,
            name: func.name,
        };
        self.heap.alloc_function(object)
    }

    fn function(&mut self, function_type: FunctionType) {
        self.functions.push(FunctionState::new(function_type));
        let name = self.previous.lexeme.to_vec();
        let name_handle = self.intern(&name);
        self.functions.last_mut().unwrap().name = Some(name_handle);

        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                let func = self.functions.last_mut().unwrap();
                func.arity += 1;
                if func.arity as usize > MAX_ARGS {
                    self.error_at_current("Can't have more than 255 parameters.");
                }
                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant);
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();

        let upvalues: Vec<(bool, u8)> = self
            .functions
            .last()
            .unwrap()
            .upvalues
            .iter()
            .map(|u| (u.is_local, u.index))
            .collect();
        let function_handle = self.end_function();

        let index = self.chunk().add_constant(Value::Obj(function_handle));
        if index >= 256 {
            self.error("Too many constants in one chunk.");
        }
        let line = self.line();
        self.chunk().write_op(OpCode::Closure, line);
        self.emit_byte(index as u8);
        self.emit_byte(upvalues.len() as u8);
        for (is_local, index) in &upvalues {
            self.emit_byte(if *is_local { 1 } else { 0 });
            self.emit_byte(*index);
        }
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        let name = self.previous.lexeme.to_vec();
        if self.functions.len() == 1 && name == b"main" {
            self.saw_top_level_main = true;
        }
        self.mark_initialized();
        self.function(FunctionType::Function);
        self.define_variable(global);
    }

    /// Emit `GET_GLOBAL main; CALL 0; POP` at the end of the top-level
    /// function's chunk, discarding whatever `main` returns.
    fn emit_main_invocation(&mut self) {
        let constant = self.make_name_constant(b"main");
        self.emit_ops(OpCode::GetGlobal, constant);
        self.emit_ops(OpCode::Call, 0);
        self.emit_op(OpCode::Pop);
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        let name = self.previous.lexeme.to_vec();
        let constant = self.make_name_constant(&name);
        let function_type = if name.as_slice() == b"init" { FunctionType::Initializer } else { FunctionType::Method };
        self.function(function_type);
        self.emit_ops(OpCode::Method, constant);
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let class_name = self.previous.lexeme.to_vec();
        let name_constant = self.make_name_constant(&class_name);
        self.declare_variable();

        self.emit_ops(OpCode::Class, name_constant);
        self.define_variable(name_constant);

        self.classes.push(ClassState { has_superclass: false });

        if self.match_token(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "Expect superclass name.");
            let superclass_name = self.previous.lexeme.to_vec();
            self.variable(false);

            if superclass_name == class_name {
                self.error("A class can't inherit from itself.");
            }

            self.begin_scope();
            self.add_local(b"super".to_vec());
            self.mark_initialized();

            self.named_variable(&class_name, false);
            self.emit_op(OpCode::Inherit);
            self.classes.last_mut().unwrap().has_superclass = true;
        }

        self.named_variable(&class_name, false);
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit_op(OpCode::Pop);

        let class = self.classes.pop().unwrap();
        if class.has_superclass {
            self.end_scope();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::Heap;
    use crate::object::Obj;

    fn compiles(heap: &mut Heap, source: &str) -> bool {
        compile(source, heap).is_ok()
    }

    /// A bare two-level `Compiler` (script + one nested function) for unit
    /// tests that drive `add_local`/`add_upvalue` directly rather than
    /// through source text, so the 256-entry caps (spec.md §8 boundary
    /// tests) can be hit exactly without fighting the parser's own 256-local
    /// ceiling on the *enclosing* function too.
    fn bare_compiler(heap: &mut Heap) -> Compiler<'static, '_> {
        Compiler {
            scanner: Scanner::new(""),
            previous: Token { kind: TokenKind::Eof, lexeme: &[], line: 0 },
            current: Token { kind: TokenKind::Eof, lexeme: &[], line: 0 },
            had_error: false,
            panic_mode: false,
            errors: Vec::new(),
            heap,
            functions: vec![FunctionState::new(FunctionType::Script), FunctionState::new(FunctionType::Function)],
            classes: Vec::new(),
            saw_top_level_main: false,
        }
    }

    #[test]
    fn local_cap_rejects_the_257th_local() {
        let mut heap = Heap::new();
        let mut c = bare_compiler(&mut heap);
        // Slot 0 is already reserved, so 255 more locals reaches MAX_LOCALS.
        for i in 0..255 {
            c.add_local(format!("v{}", i).into_bytes());
        }
        assert!(!c.had_error);
        assert_eq!(c.functions[1].locals.len(), MAX_LOCALS);
        c.add_local(b"overflow".to_vec());
        assert!(c.had_error);
    }

    #[test]
    fn upvalue_cap_rejects_the_257th_upvalue() {
        let mut heap = Heap::new();
        let mut c = bare_compiler(&mut heap);
        for i in 0..256u16 {
            let idx = c.add_upvalue(1, i as u8, true);
            assert_eq!(idx, i as u8);
        }
        assert!(!c.had_error);
        // Distinct from every prior (index, is_local) pair above: same index
        // range but the other `is_local` value.
        c.add_upvalue(1, 255, false);
        assert!(c.had_error);
    }

    #[test]
    fn many_top_level_locals_in_one_function_is_a_compile_error() {
        let mut src = String::from("fun f() {\n");
        for i in 0..300 {
            src.push_str(&format!("var a{} = {};\n", i, i));
        }
        src.push_str("}\n");
        let mut heap = Heap::new();
        assert!(!compiles(&mut heap, &src));
    }

    #[test]
    fn locals_under_the_cap_compile_cleanly() {
        let mut src = String::from("fun f() {\n");
        for i in 0..200 {
            src.push_str(&format!("var a{} = {};\n", i, i));
        }
        src.push_str("}\n");
        let mut heap = Heap::new();
        assert!(compiles(&mut heap, &src));
    }

    #[test]
    fn constant_pool_past_256_entries_still_compiles() {
        let mut src = String::new();
        for i in 0..300 {
            src.push_str(&format!("print {};\n", i));
        }
        let mut heap = Heap::new();
        assert!(compiles(&mut heap, &src));
    }

    /// spec.md §8 "chunk determinism": compiling the same source twice
    /// produces byte-identical chunks. Compares code + line arrays across
    /// two independently-compiled heaps; constants aren't compared directly
    /// since `Value::Obj` handles are only meaningful within their own heap.
    #[test]
    fn compiling_the_same_source_twice_is_byte_identical() {
        let source = r#"
            fun fib(n) {
                if (n < 2) { return n; }
                return fib(n - 1) + fib(n - 2);
            }
            class Shape { area() { return 0; } }
            class Circle < Shape {
                init(r) { this.r = r; }
                area() { return this.r * this.r * 3; }
            }
            var c = Circle(2);
            print c.area();
        "#;

        let mut heap_a = Heap::new();
        let fn_a = compile(source, &mut heap_a).expect("compiles");
        let (code_a, lines_a) = match heap_a.get(fn_a) {
            Obj::Function(f) => (f.chunk.code.clone(), f.chunk.lines.clone()),
            _ => unreachable!(),
        };

        let mut heap_b = Heap::new();
        let fn_b = compile(source, &mut heap_b).expect("compiles");
        let (code_b, lines_b) = match heap_b.get(fn_b) {
            Obj::Function(f) => (f.chunk.code.clone(), f.chunk.lines.clone()),
            _ => unreachable!(),
        };

        assert_eq!(code_a, code_b);
        assert_eq!(lines_a, lines_b);
    }

    /// spec.md §8: `end_scope` followed by `begin_scope` restores the
    /// locals array to its pre-entry length and depth.
    #[test]
    fn end_scope_then_begin_scope_restores_locals_length_and_depth() {
        let mut heap = Heap::new();
        let mut c = bare_compiler(&mut heap);
        let before_len = c.functions[1].locals.len();
        let before_depth = c.functions[1].scope_depth;

        c.begin_scope();
        c.add_local(b"tmp".to_vec());
        c.mark_initialized();
        assert_eq!(c.functions[1].locals.len(), before_len + 1);

        c.end_scope();
        assert_eq!(c.functions[1].locals.len(), before_len);
        assert_eq!(c.functions[1].scope_depth, before_depth);

        c.begin_scope();
        assert_eq!(c.functions[1].locals.len(), before_len);
        assert_eq!(c.functions[1].scope_depth, before_depth + 1);
    }

    /// spec.md §6's `mark_compiler_roots`: a string already sitting in an
    /// in-progress function's constant pool must survive a collection run
    /// against the compiler's own root set, even though nothing has put it
    /// on a VM stack or into globals yet.
    #[test]
    fn mark_compiler_roots_keeps_in_progress_constants_alive() {
        let mut heap = Heap::new();
        let mut c = bare_compiler(&mut heap);
        let handle = c.intern(b"still_compiling");
        c.functions[1].chunk.add_constant(Value::Obj(handle));

        c.mark_compiler_roots();
        c.heap.trace_references();
        c.heap.sweep();

        assert_eq!(c.heap.as_string(handle).bytes.as_ref(), b"still_compiling" as &[u8]);
    }
}
