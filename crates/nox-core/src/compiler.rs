use std::sync::Arc;

use crate::{
    SourceMap, Value,
    chunk::{Chunk, OpCode, SourceLocation},
    error::{ErrorReporter, NoxCompilerError, NoxPipelineError},
    memory::{FunctionHandle, HeapAllocator},
    object::FunctionObject,
    tokenizer::{Token, TokenType, Tokenizer},
};

pub const FRAME_MAX: usize = 64;
pub const LOCAL_SLOTS: usize = 256;
pub const STACK_MAX: usize = FRAME_MAX * LOCAL_SLOTS;

const MAX_UPVALUES: usize = 256;
const MAX_ARITY: usize = 255;

/// Binding power ladder, weakest first. Variant order matters: the Pratt
/// loop compares precedences directly.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
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

type ParseFn = for<'a, 'b> fn(&'a mut Compiler<'b>, bool);

struct ParseRule {
    prefix: Option<ParseFn>,
    infix: Option<ParseFn>,
    precedence: Precedence,
}

impl ParseRule {
    const fn new(
        prefix: Option<ParseFn>,
        infix: Option<ParseFn>,
        precedence: Precedence,
    ) -> Self {
        Self {
            prefix,
            infix,
            precedence,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

#[derive(Debug, Clone)]
struct Local {
    name: String,
    depth: i32,
    is_captured: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct UpvalueDesc {
    index: u8,
    is_local: bool,
}

/// Per-function compilation state. Nested function bodies push a fresh state
/// onto the compiler's stack and pop it when the body ends.
struct FuncState {
    function: FunctionObject,
    kind: FunctionKind,
    locals: Vec<Local>,
    upvalues: Vec<UpvalueDesc>,
    scope_depth: i32,
}

impl FuncState {
    fn new(function: FunctionObject, kind: FunctionKind) -> Self {
        // Slot zero belongs to the callee. Methods and initializers expose it
        // as `this`; plain functions keep it unnameable.
        let slot_zero = Local {
            name: if matches!(kind, FunctionKind::Method | FunctionKind::Initializer) {
                "this".to_string()
            } else {
                String::new()
            },
            depth: 0,
            is_captured: false,
        };

        Self {
            function,
            kind,
            locals: vec![slot_zero],
            upvalues: Vec::new(),
            scope_depth: 0,
        }
    }
}

struct ClassState {
    has_superclass: bool,
}

/// Single-pass compiler: pulls tokens and emits bytecode directly, with no
/// intermediate tree. Expressions are parsed by precedence climbing over the
/// rule table at the bottom of this file.
pub struct Compiler<'a> {
    source_map: Arc<SourceMap>,
    tokenizer: Tokenizer,
    alloc: &'a mut HeapAllocator,
    errors: ErrorReporter,
    previous: Token,
    current: Token,
    panic_mode: bool,
    func_states: Vec<FuncState>,
    class_states: Vec<ClassState>,
}

impl<'a> Compiler<'a> {
    pub fn new(source_map: Arc<SourceMap>, alloc: &'a mut HeapAllocator) -> Self {
        let placeholder = Token {
            token_type: TokenType::Eof,
            start: 0,
            end: 0,
            error_message: None,
        };

        Self {
            tokenizer: Tokenizer::new(source_map.clone()),
            source_map,
            alloc,
            errors: ErrorReporter::new(),
            previous: placeholder.clone(),
            current: placeholder,
            panic_mode: false,
            func_states: Vec::new(),
            class_states: Vec::new(),
        }
    }

    /// Compiles the whole source into the implicit top-level script function.
    /// All diagnostics from the run are surfaced together; the function is
    /// only produced when none occurred.
    pub fn compile(mut self) -> Result<FunctionHandle, NoxPipelineError> {
        self.func_states.push(FuncState::new(
            FunctionObject::new(None),
            FunctionKind::Script,
        ));

        self.advance();
        while !self.match_token(TokenType::Eof) {
            self.declaration();
        }

        self.emit_return();
        let state = self.func_states.pop().expect("script state");

        if self.errors.has_errors() {
            Err(NoxPipelineError::new(self.errors.take_errors()))
        } else {
            Ok(self.alloc.allocate_function(state.function))
        }
    }

    fn fs(&self) -> &FuncState {
        self.func_states.last().expect("function state")
    }

    fn fs_mut(&mut self) -> &mut FuncState {
        self.func_states.last_mut().expect("function state")
    }

    fn current_chunk_mut(&mut self) -> &mut Chunk {
        &mut self.fs_mut().function.chunk
    }

    fn loc(&self) -> SourceLocation {
        SourceLocation::new(
            self.previous.line(&self.source_map),
            self.previous.col(&self.source_map),
        )
    }

    // ---- Token plumbing ----

    fn advance(&mut self) {
        self.previous = self.current.clone();

        loop {
            let at = self.previous.end;
            self.current = self.tokenizer.next().unwrap_or(Token {
                token_type: TokenType::Eof,
                start: at,
                end: at,
                error_message: None,
            });

            if self.current.token_type != TokenType::Error {
                break;
            }

            let message = self.current.error_message.clone().unwrap_or_default();
            self.error_at_current(&message);
        }
    }

    fn consume(&mut self, token_type: TokenType, message: &str) {
        if self.current.token_type == token_type {
            self.advance();
        } else {
            self.error_at_current(message);
        }
    }

    fn check(&self, token_type: TokenType) -> bool {
        self.current.token_type == token_type
    }

    fn match_token(&mut self, token_type: TokenType) -> bool {
        if self.check(token_type) {
            self.advance();
            true
        } else {
            false
        }
    }

    // ---- Error reporting ----

    fn error_at(&mut self, token: &Token, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;

        let line = token.line(&self.source_map);
        let formatted = match token.token_type {
            TokenType::Eof => format!("[line {}] Error at end: {}", line, message),
            TokenType::Error => format!("[line {}] Error: {}", line, message),
            _ => format!(
                "[line {}] Error at '{}': {}",
                line,
                token.lexeme_string(&self.source_map),
                message
            ),
        };

        self.errors.report_error(NoxCompilerError::new(formatted, line));
    }

    fn error(&mut self, message: &str) {
        let token = self.previous.clone();
        self.error_at(&token, message);
    }

    fn error_at_current(&mut self, message: &str) {
        let token = self.current.clone();
        self.error_at(&token, message);
    }

    /// Skips to a statement boundary so one mistake produces one diagnostic.
    fn synchronize(&mut self) {
        self.panic_mode = false;

        while self.current.token_type != TokenType::Eof {
            if self.previous.token_type == TokenType::Semicolon {
                return;
            }

            match self.current.token_type {
                TokenType::Class
                | TokenType::Fun
                | TokenType::Var
                | TokenType::For
                | TokenType::If
                | TokenType::While
                | TokenType::Print
                | TokenType::Return => return,
                _ => {}
            }

            self.advance();
        }
    }

    // ---- Emitters ----

    fn emit_opcode(&mut self, opcode: OpCode) {
        let loc = self.loc();
        self.current_chunk_mut().write_opcode(opcode, loc);
    }

    fn emit_byte(&mut self, byte: u8) {
        let loc = self.loc();
        self.current_chunk_mut().write(byte, loc);
    }

    fn emit_opcode_and_byte(&mut self, opcode: OpCode, byte: u8) {
        self.emit_opcode(opcode);
        self.emit_byte(byte);
    }

    fn emit_jump(&mut self, opcode: OpCode) -> usize {
        self.emit_opcode(opcode);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.current_chunk_mut().code.len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        // -2 adjusts for the operand bytes themselves.
        let jump = self.current_chunk_mut().code.len() - offset - 2;

        if jump > u16::MAX as usize {
            self.error("Too much code to jump over.");
        }

        self.current_chunk_mut().code[offset] = ((jump >> 8) & 0xff) as u8;
        self.current_chunk_mut().code[offset + 1] = (jump & 0xff) as u8;
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_opcode(OpCode::Loop);

        let offset = self.current_chunk_mut().code.len() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
        }

        self.emit_byte(((offset >> 8) & 0xff) as u8);
        self.emit_byte((offset & 0xff) as u8);
    }

    fn emit_return(&mut self) {
        if self.fs().kind == FunctionKind::Initializer {
            self.emit_opcode_and_byte(OpCode::GetLocal, 0);
        } else {
            self.emit_opcode(OpCode::Nil);
        }
        self.emit_opcode(OpCode::Return);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        let index = self.current_chunk_mut().add_constant(value);

        if index > u8::MAX as usize {
            self.error("Too many constants in one chunk.");
            return 0;
        }

        index as u8
    }

    fn emit_constant(&mut self, value: Value) {
        let constant = self.make_constant(value);
        self.emit_opcode_and_byte(OpCode::Constant, constant);
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let handle = self.alloc.strings.intern(name);
        self.make_constant(Value::string(handle))
    }

    // ---- Scopes, locals, upvalues ----

    fn begin_scope(&mut self) {
        self.fs_mut().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.fs_mut().scope_depth -= 1;

        loop {
            let state = self.fs();
            let Some(local) = state.locals.last() else {
                break;
            };
            if local.depth <= state.scope_depth {
                break;
            }

            if local.is_captured {
                self.emit_opcode(OpCode::CloseUpvalue);
            } else {
                self.emit_opcode(OpCode::Pop);
            }
            self.fs_mut().locals.pop();
        }
    }

    fn add_local(&mut self, name: String) {
        if self.fs().locals.len() >= LOCAL_SLOTS {
            self.error("Too many local variables in function.");
            return;
        }

        self.fs_mut().locals.push(Local {
            name,
            depth: -1, // declared but not yet initialized
            is_captured: false,
        });
    }

    fn declare_variable(&mut self) {
        if self.fs().scope_depth == 0 {
            return;
        }

        let name = self.previous.lexeme_string(&self.source_map);
        let mut is_duplicate = false;

        for local in self.fs().locals.iter().rev() {
            if local.depth != -1 && local.depth < self.fs().scope_depth {
                break;
            }
            if local.name == name {
                is_duplicate = true;
                break;
            }
        }

        if is_duplicate {
            self.error("Already a variable with this name in this scope.");
        }
        self.add_local(name);
    }

    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenType::Identifier, message);
        self.declare_variable();

        if self.fs().scope_depth > 0 {
            return 0;
        }

        let name = self.previous.lexeme_string(&self.source_map);
        self.identifier_constant(&name)
    }

    fn mark_initialized(&mut self) {
        if self.fs().scope_depth == 0 {
            return;
        }
        let depth = self.fs().scope_depth;
        if let Some(local) = self.fs_mut().locals.last_mut() {
            local.depth = depth;
        }
    }

    fn define_variable(&mut self, global: u8) {
        if self.fs().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_opcode_and_byte(OpCode::DefineGlobal, global);
    }

    fn resolve_local(&mut self, state_index: usize, name: &str) -> Option<u8> {
        let locals_len = self.func_states[state_index].locals.len();

        for i in (0..locals_len).rev() {
            let local = &self.func_states[state_index].locals[i];
            if local.name == name {
                if local.depth == -1 {
                    self.error("Can't read local variable in its own initializer.");
                }
                return Some(i as u8);
            }
        }

        None
    }

    /// Walks outward through enclosing functions. The first hit marks the
    /// owning local as captured; every intermediate function records an
    /// indirect upvalue so the chain stays intact at runtime.
    fn resolve_upvalue(&mut self, state_index: usize, name: &str) -> Option<u8> {
        if state_index == 0 {
            return None;
        }

        if let Some(local) = self.resolve_local(state_index - 1, name) {
            self.func_states[state_index - 1].locals[local as usize].is_captured = true;
            return Some(self.add_upvalue(state_index, local, true));
        }

        if let Some(upvalue) = self.resolve_upvalue(state_index - 1, name) {
            return Some(self.add_upvalue(state_index, upvalue, false));
        }

        None
    }

    fn add_upvalue(&mut self, state_index: usize, index: u8, is_local: bool) -> u8 {
        let desc = UpvalueDesc { index, is_local };

        for (i, existing) in self.func_states[state_index].upvalues.iter().enumerate() {
            if *existing == desc {
                return i as u8;
            }
        }

        if self.func_states[state_index].upvalues.len() >= MAX_UPVALUES {
            self.error("Too many closure variables in function.");
            return 0;
        }

        let state = &mut self.func_states[state_index];
        state.upvalues.push(desc);
        state.function.upvalue_count = state.upvalues.len();
        (state.upvalues.len() - 1) as u8
    }

    fn named_variable(&mut self, name: &str, can_assign: bool) {
        let state_index = self.func_states.len() - 1;

        let (get_op, set_op, arg) = if let Some(local) = self.resolve_local(state_index, name) {
            (OpCode::GetLocal, OpCode::SetLocal, local)
        } else if let Some(upvalue) = self.resolve_upvalue(state_index, name) {
            (OpCode::GetUpvalue, OpCode::SetUpvalue, upvalue)
        } else {
            let constant = self.identifier_constant(name);
            (OpCode::GetGlobal, OpCode::SetGlobal, constant)
        };

        if can_assign && self.match_token(TokenType::Equals) {
            self.expression();
            self.emit_opcode_and_byte(set_op, arg);
        } else {
            self.emit_opcode_and_byte(get_op, arg);
        }
    }

    // ---- Expressions ----

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();

        let Some(prefix) = Self::rule(self.previous.token_type).prefix else {
            self.error("Expect expression.");
            return;
        };

        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while precedence <= Self::rule(self.current.token_type).precedence {
            self.advance();
            if let Some(infix) = Self::rule(self.previous.token_type).infix {
                infix(self, can_assign);
            }
        }

        if can_assign && self.match_token(TokenType::Equals) {
            self.error("Invalid assignment target.");
        }
    }

    fn argument_list(&mut self) -> u8 {
        let mut arg_count: usize = 0;

        if !self.check(TokenType::RightParen) {
            loop {
                self.expression();
                if arg_count == MAX_ARITY {
                    self.error("Can't have more than 255 arguments.");
                }
                arg_count += 1;
                if !self.match_token(TokenType::Comma) {
                    break;
                }
            }
        }

        self.consume(TokenType::RightParen, "Expect ')' after arguments.");
        arg_count.min(u8::MAX as usize) as u8
    }

    fn grouping(compiler: &mut Compiler, _can_assign: bool) {
        compiler.expression();
        compiler.consume(TokenType::RightParen, "Expect ')' after expression.");
    }

    fn number(compiler: &mut Compiler, _can_assign: bool) {
        let value: f64 = compiler
            .previous
            .lexeme_string(&compiler.source_map)
            .parse()
            .unwrap_or(0.0);
        compiler.emit_constant(Value::number(value));
    }

    fn string(compiler: &mut Compiler, _can_assign: bool) {
        let chars = compiler.previous.lexeme(&compiler.source_map);
        let text: String = chars[1..chars.len() - 1].iter().collect();
        let handle = compiler.alloc.strings.intern(&text);
        compiler.emit_constant(Value::string(handle));
    }

    fn literal(compiler: &mut Compiler, _can_assign: bool) {
        match compiler.previous.token_type {
            TokenType::False => compiler.emit_opcode(OpCode::False),
            TokenType::True => compiler.emit_opcode(OpCode::True),
            TokenType::Nil => compiler.emit_opcode(OpCode::Nil),
            _ => unreachable!("literal rule on non-literal token"),
        }
    }

    fn variable(compiler: &mut Compiler, can_assign: bool) {
        let name = compiler.previous.lexeme_string(&compiler.source_map);
        compiler.named_variable(&name, can_assign);
    }

    fn unary(compiler: &mut Compiler, _can_assign: bool) {
        let operator = compiler.previous.token_type;

        compiler.parse_precedence(Precedence::Unary);

        match operator {
            TokenType::Minus => compiler.emit_opcode(OpCode::Negate),
            TokenType::Bang => compiler.emit_opcode(OpCode::Not),
            _ => unreachable!("unary rule on non-unary token"),
        }
    }

    fn binary(compiler: &mut Compiler, _can_assign: bool) {
        let operator = compiler.previous.token_type;
        let precedence = Self::rule(operator).precedence;
        compiler.parse_precedence(precedence.next());

        match operator {
            TokenType::BangEquals => {
                compiler.emit_opcode(OpCode::Equal);
                compiler.emit_opcode(OpCode::Not);
            }
            TokenType::EqualsEquals => compiler.emit_opcode(OpCode::Equal),
            TokenType::Greater => compiler.emit_opcode(OpCode::Greater),
            TokenType::GreaterEquals => {
                compiler.emit_opcode(OpCode::Less);
                compiler.emit_opcode(OpCode::Not);
            }
            TokenType::Less => compiler.emit_opcode(OpCode::Less),
            TokenType::LessEquals => {
                compiler.emit_opcode(OpCode::Greater);
                compiler.emit_opcode(OpCode::Not);
            }
            TokenType::Plus => compiler.emit_opcode(OpCode::Add),
            TokenType::Minus => compiler.emit_opcode(OpCode::Subtract),
            TokenType::Star => compiler.emit_opcode(OpCode::Multiply),
            TokenType::Slash => compiler.emit_opcode(OpCode::Divide),
            _ => unreachable!("binary rule on non-binary token"),
        }
    }

    fn and_(compiler: &mut Compiler, _can_assign: bool) {
        let end_jump = compiler.emit_jump(OpCode::JumpIfFalse);

        compiler.emit_opcode(OpCode::Pop);
        compiler.parse_precedence(Precedence::And);

        compiler.patch_jump(end_jump);
    }

    fn or_(compiler: &mut Compiler, _can_assign: bool) {
        let else_jump = compiler.emit_jump(OpCode::JumpIfFalse);
        let end_jump = compiler.emit_jump(OpCode::Jump);

        compiler.patch_jump(else_jump);
        compiler.emit_opcode(OpCode::Pop);

        compiler.parse_precedence(Precedence::Or);
        compiler.patch_jump(end_jump);
    }

    fn call(compiler: &mut Compiler, _can_assign: bool) {
        let arg_count = compiler.argument_list();
        compiler.emit_opcode_and_byte(OpCode::Call, arg_count);
    }

    fn dot(compiler: &mut Compiler, can_assign: bool) {
        compiler.consume(TokenType::Identifier, "Expect property name after '.'.");
        let name = compiler.previous.lexeme_string(&compiler.source_map);
        let name_constant = compiler.identifier_constant(&name);

        if can_assign && compiler.match_token(TokenType::Equals) {
            compiler.expression();
            compiler.emit_opcode_and_byte(OpCode::SetProperty, name_constant);
        } else if compiler.match_token(TokenType::LeftParen) {
            let arg_count = compiler.argument_list();
            compiler.emit_opcode_and_byte(OpCode::Invoke, name_constant);
            compiler.emit_byte(arg_count);
        } else {
            compiler.emit_opcode_and_byte(OpCode::GetProperty, name_constant);
        }
    }

    fn this_(compiler: &mut Compiler, _can_assign: bool) {
        if compiler.class_states.is_empty() {
            compiler.error("Can't use 'this' outside of a class.");
            return;
        }
        compiler.named_variable("this", false);
    }

    fn super_(compiler: &mut Compiler, _can_assign: bool) {
        if compiler.class_states.is_empty() {
            compiler.error("Can't use 'super' outside of a class.");
        } else if !compiler.class_states.last().expect("class state").has_superclass {
            compiler.error("Can't use 'super' in a class with no superclass.");
        }

        compiler.consume(TokenType::Dot, "Expect '.' after 'super'.");
        compiler.consume(TokenType::Identifier, "Expect superclass method name.");
        let method = compiler.previous.lexeme_string(&compiler.source_map);
        let name_constant = compiler.identifier_constant(&method);

        compiler.named_variable("this", false);
        if compiler.match_token(TokenType::LeftParen) {
            let arg_count = compiler.argument_list();
            compiler.named_variable("super", false);
            compiler.emit_opcode_and_byte(OpCode::SuperInvoke, name_constant);
            compiler.emit_byte(arg_count);
        } else {
            compiler.named_variable("super", false);
            compiler.emit_opcode_and_byte(OpCode::GetSuper, name_constant);
        }
    }

    // ---- Declarations and statements ----

    fn declaration(&mut self) {
        if self.match_token(TokenType::Class) {
            self.class_declaration();
        } else if self.match_token(TokenType::Fun) {
            self.fun_declaration();
        } else if self.match_token(TokenType::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }

        if self.panic_mode {
            self.synchronize();
        }
    }

    fn statement(&mut self) {
        if self.match_token(TokenType::Print) {
            self.print_statement();
        } else if self.match_token(TokenType::For) {
            self.for_statement();
        } else if self.match_token(TokenType::If) {
            self.if_statement();
        } else if self.match_token(TokenType::Return) {
            self.return_statement();
        } else if self.match_token(TokenType::While) {
            self.while_statement();
        } else if self.match_token(TokenType::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenType::RightBrace) && !self.check(TokenType::Eof) {
            self.declaration();
        }
        self.consume(TokenType::RightBrace, "Expect '}' after block.");
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenType::Semicolon, "Expect ';' after value.");
        self.emit_opcode(OpCode::Print);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenType::Semicolon, "Expect ';' after expression.");
        self.emit_opcode(OpCode::Pop);
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");

        if self.match_token(TokenType::Equals) {
            self.expression();
        } else {
            self.emit_opcode(OpCode::Nil);
        }
        self.consume(
            TokenType::Semicolon,
            "Expect ';' after variable declaration.",
        );

        self.define_variable(global);
    }

    fn if_statement(&mut self) {
        self.consume(TokenType::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenType::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_opcode(OpCode::Pop);
        self.statement();

        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        self.emit_opcode(OpCode::Pop);

        if self.match_token(TokenType::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.current_chunk_mut().code.len();

        self.consume(TokenType::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenType::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_opcode(OpCode::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_opcode(OpCode::Pop);
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenType::LeftParen, "Expect '(' after 'for'.");

        if self.match_token(TokenType::Semicolon) {
            // No initializer.
        } else if self.match_token(TokenType::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.current_chunk_mut().code.len();

        let mut exit_jump = None;
        if !self.match_token(TokenType::Semicolon) {
            self.expression();
            self.consume(TokenType::Semicolon, "Expect ';' after loop condition.");

            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_opcode(OpCode::Pop);
        }

        // The increment clause textually precedes the body but runs after it,
        // so it is compiled out of order: jump over it into the body, and
        // loop back to it from the body's end.
        if !self.match_token(TokenType::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.current_chunk_mut().code.len();

            self.expression();
            self.emit_opcode(OpCode::Pop);
            self.consume(TokenType::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit_opcode(OpCode::Pop);
        }

        self.end_scope();
    }

    fn return_statement(&mut self) {
        if self.fs().kind == FunctionKind::Script {
            self.error("Can't return from top-level code.");
        }

        if self.match_token(TokenType::Semicolon) {
            self.emit_return();
        } else {
            if self.fs().kind == FunctionKind::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression();
            self.consume(TokenType::Semicolon, "Expect ';' after return value.");
            self.emit_opcode(OpCode::Return);
        }
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        // A function may recurse into itself by name, so it counts as
        // initialized as soon as it is declared.
        self.mark_initialized();
        self.function(FunctionKind::Function);
        self.define_variable(global);
    }

    fn function(&mut self, kind: FunctionKind) {
        let name = self.previous.lexeme_string(&self.source_map);
        let name_handle = self.alloc.strings.intern(&name);
        let function = FunctionObject::new(Some(name_handle));

        self.func_states.push(FuncState::new(function, kind));
        self.begin_scope();

        self.consume(TokenType::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenType::RightParen) {
            loop {
                if self.fs().function.arity >= MAX_ARITY {
                    self.error_at_current("Can't have more than 255 parameters.");
                }
                self.fs_mut().function.arity += 1;

                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant);

                if !self.match_token(TokenType::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenType::RightParen, "Expect ')' after parameters.");

        self.consume(TokenType::LeftBrace, "Expect '{' before function body.");
        self.block();
        self.emit_return();

        // No end_scope: the whole frame unwinds when the function returns.
        let state = self.func_states.pop().expect("function state");
        let handle = self.alloc.allocate_function(state.function);

        let constant = self.make_constant(Value::function(handle));
        self.emit_opcode_and_byte(OpCode::Closure, constant);

        for upvalue in state.upvalues {
            self.emit_byte(if upvalue.is_local { 1 } else { 0 });
            self.emit_byte(upvalue.index);
        }
    }

    fn class_declaration(&mut self) {
        self.consume(TokenType::Identifier, "Expect class name.");
        let class_name = self.previous.lexeme_string(&self.source_map);
        let name_constant = self.identifier_constant(&class_name);
        self.declare_variable();

        self.emit_opcode_and_byte(OpCode::Class, name_constant);
        self.define_variable(name_constant);

        self.class_states.push(ClassState {
            has_superclass: false,
        });

        if self.match_token(TokenType::Less) {
            self.consume(TokenType::Identifier, "Expect superclass name.");
            let superclass_name = self.previous.lexeme_string(&self.source_map);
            Self::variable(self, false);

            if class_name == superclass_name {
                self.error("A class can't inherit from itself.");
            }

            // `super` lives in its own scope so each class body sees its own.
            self.begin_scope();
            self.add_local("super".to_string());
            self.define_variable(0);

            self.named_variable(&class_name, false);
            self.emit_opcode(OpCode::Inherit);
            self.class_states
                .last_mut()
                .expect("class state")
                .has_superclass = true;
        }

        self.named_variable(&class_name, false);
        self.consume(TokenType::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenType::RightBrace) && !self.check(TokenType::Eof) {
            self.method();
        }
        self.consume(TokenType::RightBrace, "Expect '}' after class body.");
        self.emit_opcode(OpCode::Pop);

        if self.class_states.last().expect("class state").has_superclass {
            self.end_scope();
        }
        self.class_states.pop();
    }

    fn method(&mut self) {
        self.consume(TokenType::Identifier, "Expect method name.");
        let method_name = self.previous.lexeme_string(&self.source_map);
        let name_constant = self.identifier_constant(&method_name);

        let kind = if method_name == "init" {
            FunctionKind::Initializer
        } else {
            FunctionKind::Method
        };
        self.function(kind);

        self.emit_opcode_and_byte(OpCode::Method, name_constant);
    }

    // ---- Rule table ----

    fn rule(token_type: TokenType) -> ParseRule {
        match token_type {
            TokenType::LeftParen => ParseRule::new(
                Some(Self::grouping),
                Some(Self::call),
                Precedence::Call,
            ),
            TokenType::Dot => ParseRule::new(None, Some(Self::dot), Precedence::Call),
            TokenType::Minus => ParseRule::new(
                Some(Self::unary),
                Some(Self::binary),
                Precedence::Term,
            ),
            TokenType::Plus => ParseRule::new(None, Some(Self::binary), Precedence::Term),
            TokenType::Slash => ParseRule::new(None, Some(Self::binary), Precedence::Factor),
            TokenType::Star => ParseRule::new(None, Some(Self::binary), Precedence::Factor),
            TokenType::Bang => ParseRule::new(Some(Self::unary), None, Precedence::None),
            TokenType::BangEquals => {
                ParseRule::new(None, Some(Self::binary), Precedence::Equality)
            }
            TokenType::EqualsEquals => {
                ParseRule::new(None, Some(Self::binary), Precedence::Equality)
            }
            TokenType::Greater => ParseRule::new(None, Some(Self::binary), Precedence::Comparison),
            TokenType::GreaterEquals => {
                ParseRule::new(None, Some(Self::binary), Precedence::Comparison)
            }
            TokenType::Less => ParseRule::new(None, Some(Self::binary), Precedence::Comparison),
            TokenType::LessEquals => {
                ParseRule::new(None, Some(Self::binary), Precedence::Comparison)
            }
            TokenType::Identifier => ParseRule::new(Some(Self::variable), None, Precedence::None),
            TokenType::String => ParseRule::new(Some(Self::string), None, Precedence::None),
            TokenType::Number => ParseRule::new(Some(Self::number), None, Precedence::None),
            TokenType::And => ParseRule::new(None, Some(Self::and_), Precedence::And),
            TokenType::Or => ParseRule::new(None, Some(Self::or_), Precedence::Or),
            TokenType::False => ParseRule::new(Some(Self::literal), None, Precedence::None),
            TokenType::True => ParseRule::new(Some(Self::literal), None, Precedence::None),
            TokenType::Nil => ParseRule::new(Some(Self::literal), None, Precedence::None),
            TokenType::Super => ParseRule::new(Some(Self::super_), None, Precedence::None),
            TokenType::This => ParseRule::new(Some(Self::this_), None, Precedence::None),
            _ => ParseRule::new(None, None, Precedence::None),
        }
    }
}
