//! Single-pass compiler
//!
//! Parsing and emission are fused: each statement and expression writes
//! instructions as it is recognized, with jump targets back-patched once
//! known. Expressions evaluate into a target register and use a bump cursor
//! for scratch; the cursor resets at statement boundaries, and loop
//! counters reserve a register floor so body statements cannot clobber
//! them.
//!
//! The compiler is deliberately scope-agnostic: every name compiles to a
//! constant-pool string moved through `load_global`/`store_global`/
//! `declare_local`, and the VM resolves locals-before-globals at runtime.
//! Shadowing therefore works without the compiler tracking scopes at all.
//!
//! Nothing here panics on malformed input; every failure path is a
//! [`ParseError`] carrying the offending token's line and column.

use crate::lexer::{Token, TokenKind, tokenize};
use ghostlang_core::bytecode::{CompiledChunk, FunctionInfo, Instruction, OpCode, SourcePos};
use ghostlang_core::{ParseError, Value};
use std::mem;
use std::sync::Arc;

/// Register file size; expressions needing more scratch are rejected.
const REGISTER_LIMIT: u16 = 256;

/// Recursion guard for statements and expressions, so hostile nesting
/// yields a parse error instead of exhausting the host stack.
const MAX_NESTING: u32 = 200;

/// Compile `source` into a runnable chunk.
pub fn compile(source: &str) -> Result<CompiledChunk, ParseError> {
    let tokens = tokenize(source)?;
    let mut compiler = Compiler::new(tokens);
    compiler.program()?;
    Ok(CompiledChunk {
        code: compiler.code,
        constants: compiler.constants,
        functions: Arc::new(compiler.functions),
        lines: compiler.lines,
    })
}

/// An expression whose emission may still be pending.
///
/// A bare identifier stays un-emitted until we know whether it names a
/// string intrinsic being called (which compiles to a dedicated opcode,
/// no `load_global` involved) or an ordinary read.
enum Place {
    Reg(u16),
    Ident(String),
}

struct Compiler {
    tokens: Vec<Token>,
    pos: usize,
    /// Position of the most recently consumed token, recorded per emit.
    last_pos: SourcePos,

    code: Vec<Instruction>,
    lines: Vec<SourcePos>,
    constants: Vec<Value>,
    functions: Vec<FunctionInfo>,

    next_reg: u16,
    /// Registers below this are reserved by an enclosing loop.
    reg_floor: u16,
    local_count: u16,
    nesting: u32,
}

impl Compiler {
    fn new(tokens: Vec<Token>) -> Self {
        Compiler {
            tokens,
            pos: 0,
            last_pos: SourcePos { line: 1, column: 1 },
            code: Vec::new(),
            lines: Vec::new(),
            constants: Vec::new(),
            functions: Vec::new(),
            next_reg: 0,
            reg_floor: 0,
            local_count: 0,
            nesting: 0,
        }
    }

    // ---- token plumbing ----

    fn peek(&self) -> &TokenKind {
        &self.tokens[self.pos].kind
    }

    fn peek_next(&self) -> &TokenKind {
        self.tokens
            .get(self.pos + 1)
            .map(|t| &t.kind)
            .unwrap_or(&TokenKind::Eof)
    }

    fn advance(&mut self) -> TokenKind {
        let token = self.tokens[self.pos].clone();
        self.last_pos = SourcePos {
            line: token.line,
            column: token.column,
        };
        // The Eof sentinel is sticky.
        if !matches!(token.kind, TokenKind::Eof) {
            self.pos += 1;
        }
        token.kind
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.peek() == kind {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> Result<(), ParseError> {
        if self.peek() == &kind {
            self.advance();
            Ok(())
        } else {
            Err(self.error_here(format!("expected {what}, found {}", self.peek().describe())))
        }
    }

    fn expect_ident(&mut self) -> Result<String, ParseError> {
        match self.peek() {
            TokenKind::Ident(name) => {
                let name = name.clone();
                self.advance();
                Ok(name)
            }
            other => Err(self.error_here(format!(
                "expected identifier, found {}",
                other.describe()
            ))),
        }
    }

    fn error_here(&self, message: impl Into<String>) -> ParseError {
        let token = &self.tokens[self.pos];
        ParseError::new(token.line, token.column, message)
    }

    // ---- emission plumbing ----

    fn emit(&mut self, instr: Instruction) -> Result<usize, ParseError> {
        if self.code.len() >= u16::MAX as usize {
            return Err(self.error_here("function too large"));
        }
        self.code.push(instr);
        self.lines.push(self.last_pos);
        Ok(self.code.len() - 1)
    }

    /// Point a placeholder jump at the current end of code.
    fn patch_jump(&mut self, index: usize) -> Result<(), ParseError> {
        let target = self.code.len() as u16;
        let instr = &mut self.code[index];
        match instr.op {
            OpCode::Jump => instr.a = target,
            OpCode::JumpIfFalse | OpCode::JumpIfTrue => instr.b = target,
            OpCode::ForInNext => instr.c = target,
            _ => {
                return Err(self.error_here("internal error: patch target is not a jump"));
            }
        }
        Ok(())
    }

    fn alloc_reg(&mut self) -> Result<u16, ParseError> {
        if self.next_reg >= REGISTER_LIMIT {
            return Err(self.error_here("expression too complex: out of registers"));
        }
        let reg = self.next_reg;
        self.next_reg += 1;
        Ok(reg)
    }

    fn add_const(&mut self, value: Value) -> Result<u16, ParseError> {
        let found = self.constants.iter().position(|existing| match (existing, &value) {
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a.as_str() == b.as_str(),
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Nil, Value::Nil) => true,
            _ => false,
        });
        if let Some(index) = found {
            return Ok(index as u16);
        }
        if self.constants.len() >= u16::MAX as usize {
            return Err(self.error_here("too many constants"));
        }
        self.constants.push(value);
        Ok((self.constants.len() - 1) as u16)
    }

    fn add_name(&mut self, name: &str) -> Result<u16, ParseError> {
        self.add_const(Value::string(name))
    }

    // ---- statements ----

    fn program(&mut self) -> Result<(), ParseError> {
        let mut last_expr: Option<u16> = None;
        loop {
            while self.eat(&TokenKind::Semicolon) {}
            if matches!(self.peek(), TokenKind::Eof) {
                break;
            }
            last_expr = self.statement()?;
        }
        // The value of a trailing expression statement is the script result.
        match last_expr {
            Some(reg) => self.emit(Instruction::ab(OpCode::Ret, reg, 1))?,
            None => self.emit(Instruction::none(OpCode::Ret))?,
        };
        Ok(())
    }

    fn statement(&mut self) -> Result<Option<u16>, ParseError> {
        self.nesting += 1;
        if self.nesting > MAX_NESTING {
            self.nesting -= 1;
            return Err(self.error_here("statements nested too deeply"));
        }
        let result = self.statement_inner();
        self.nesting -= 1;
        result
    }

    fn statement_inner(&mut self) -> Result<Option<u16>, ParseError> {
        match self.peek() {
            TokenKind::KwVar => {
                self.advance();
                let name = self.expect_ident()?;
                let name_k = self.add_name(&name)?;
                self.expect(TokenKind::Assign, "'='")?;
                let reg = self.expr_statement_value()?;
                self.emit(Instruction::ab(OpCode::StoreGlobal, reg, name_k))?;
                Ok(None)
            }
            TokenKind::KwLocal => {
                self.advance();
                let name = self.expect_ident()?;
                let name_k = self.add_name(&name)?;
                self.expect(TokenKind::Assign, "'='")?;
                let reg = self.expr_statement_value()?;
                self.emit(Instruction::ab(OpCode::DeclareLocal, name_k, reg))?;
                self.local_count = self.local_count.saturating_add(1);
                Ok(None)
            }
            TokenKind::KwIf => {
                self.advance();
                self.if_statement()?;
                Ok(None)
            }
            TokenKind::KwWhile => {
                self.advance();
                self.while_statement()?;
                Ok(None)
            }
            TokenKind::KwFor => {
                self.advance();
                self.for_statement()?;
                Ok(None)
            }
            TokenKind::KwFunction => {
                self.advance();
                self.function_statement()?;
                Ok(None)
            }
            TokenKind::KwReturn => {
                self.advance();
                self.return_statement()?;
                Ok(None)
            }
            TokenKind::Ident(_) if matches!(self.peek_next(), TokenKind::Assign) => {
                let name = self.expect_ident()?;
                let name_k = self.add_name(&name)?;
                self.advance(); // '='
                let reg = self.expr_statement_value()?;
                self.emit(Instruction::ab(OpCode::StoreGlobal, reg, name_k))?;
                Ok(None)
            }
            _ => self.expression_statement(),
        }
    }

    /// Evaluate one expression in statement scratch space.
    fn expr_statement_value(&mut self) -> Result<u16, ParseError> {
        self.next_reg = self.reg_floor;
        let dst = self.alloc_reg()?;
        self.expr_into(dst)
    }

    /// Expression statement, including indexed/member assignment, which is
    /// recognized by converting the just-emitted read into a store.
    fn expression_statement(&mut self) -> Result<Option<u16>, ParseError> {
        self.next_reg = self.reg_floor;
        let dst = self.alloc_reg()?;
        let reg = self.expr_into(dst)?;

        if !matches!(self.peek(), TokenKind::Assign) {
            self.eat(&TokenKind::Semicolon);
            return Ok(Some(reg));
        }
        self.advance(); // '='

        let last = self
            .code
            .last()
            .copied()
            .ok_or_else(|| self.error_here("invalid assignment target"))?;
        match last.op {
            OpCode::ArrayGet => {
                self.code.pop();
                self.lines.pop();
                // The base and index registers must survive the value
                // expression.
                self.next_reg = self.next_reg.max(last.b + 1).max(last.c + 1);
                let value = self.alloc_reg()?;
                let value = self.expr_into(value)?;
                self.emit(Instruction::abc(OpCode::ArraySet, last.b, last.c, value))?;
            }
            OpCode::GetTable => {
                self.code.pop();
                self.lines.pop();
                self.next_reg = self.next_reg.max(last.b + 1).max(last.c + 1);
                let value = self.alloc_reg()?;
                let value = self.expr_into(value)?;
                self.emit(Instruction::abc(OpCode::SetTable, last.b, last.c, value))?;
            }
            _ => return Err(self.error_here("invalid assignment target")),
        }
        Ok(None)
    }

    /// Parse statements until `terminator`, consuming it.
    fn block_until(&mut self, terminator: TokenKind) -> Result<(), ParseError> {
        loop {
            while self.eat(&TokenKind::Semicolon) {}
            if self.peek() == &terminator {
                self.advance();
                return Ok(());
            }
            if matches!(self.peek(), TokenKind::Eof) {
                return Err(self.error_here(format!(
                    "unexpected end of input, expected {}",
                    terminator.describe()
                )));
            }
            self.statement()?;
        }
    }

    fn if_statement(&mut self) -> Result<(), ParseError> {
        let mut end_jumps = Vec::new();
        loop {
            self.expect(TokenKind::LParen, "'('")?;
            self.next_reg = self.reg_floor;
            let cond = self.alloc_reg()?;
            let cond = self.expr_into(cond)?;
            self.expect(TokenKind::RParen, "')'")?;
            self.expect(TokenKind::LBrace, "'{'")?;
            let skip = self.emit(Instruction::ab(OpCode::JumpIfFalse, cond, 0))?;
            self.block_until(TokenKind::RBrace)?;

            let has_more = matches!(self.peek(), TokenKind::KwElseif | TokenKind::KwElse);
            if has_more {
                end_jumps.push(self.emit(Instruction::none(OpCode::Jump))?);
            }
            self.patch_jump(skip)?;

            match self.peek() {
                TokenKind::KwElseif => {
                    self.advance();
                    continue;
                }
                TokenKind::KwElse => {
                    self.advance();
                    self.expect(TokenKind::LBrace, "'{'")?;
                    self.block_until(TokenKind::RBrace)?;
                }
                _ => {}
            }
            break;
        }
        for jump in end_jumps {
            self.patch_jump(jump)?;
        }
        Ok(())
    }

    fn while_statement(&mut self) -> Result<(), ParseError> {
        let loop_top = self.code.len() as u16;
        self.next_reg = self.reg_floor;
        let cond = self.alloc_reg()?;
        let cond = self.expr_into(cond)?;
        let exit = self.emit(Instruction::ab(OpCode::JumpIfFalse, cond, 0))?;

        if self.eat(&TokenKind::KwDo) {
            self.block_until(TokenKind::KwEnd)?;
        } else if self.eat(&TokenKind::LBrace) {
            self.block_until(TokenKind::RBrace)?;
        } else {
            return Err(self.error_here(format!(
                "expected 'do' or '{{' after while condition, found {}",
                self.peek().describe()
            )));
        }

        self.emit(Instruction::a(OpCode::Jump, loop_top))?;
        self.patch_jump(exit)
    }

    fn for_statement(&mut self) -> Result<(), ParseError> {
        let name = self.expect_ident()?;
        if self.eat(&TokenKind::Assign) {
            self.numeric_for(&name)
        } else if self.eat(&TokenKind::Comma) {
            self.for_in(&name)
        } else {
            Err(self.error_here(format!(
                "expected '=' or ',' after loop variable, found {}",
                self.peek().describe()
            )))
        }
    }

    /// `for i = a, b do ... end`
    ///
    /// Emits the init/label/body/`for_loop` shape: the counter is written to
    /// the named variable at the top of every trip, and `for_loop`
    /// increments and jumps back while the counter stays within the bound.
    fn numeric_for(&mut self, name: &str) -> Result<(), ParseError> {
        let name_k = self.add_name(name)?;
        let saved_floor = self.reg_floor;

        self.next_reg = saved_floor;
        let start = self.alloc_reg()?;
        let start = self.expr_into(start)?;
        self.expect(TokenKind::Comma, "','")?;
        let end = self.alloc_reg()?;
        let end = self.expr_into(end)?;
        let iter = self.alloc_reg()?;
        self.emit(Instruction::abc(OpCode::ForInit, iter, start, end))?;

        // The counter and bound live across body statements.
        self.reg_floor = iter + 1;
        self.expect(TokenKind::KwDo, "'do'")?;
        let loop_top = self.code.len() as u16;
        self.emit(Instruction::ab(OpCode::StoreGlobal, iter, name_k))?;
        self.block_until(TokenKind::KwEnd)?;
        self.emit(Instruction::abc(OpCode::ForLoop, iter, end, loop_top))?;
        self.reg_floor = saved_floor;
        Ok(())
    }

    /// `for k, v in pairs(t) do ... end`
    fn for_in(&mut self, key_name: &str) -> Result<(), ParseError> {
        let key_k = self.add_name(key_name)?;
        let val_name = self.expect_ident()?;
        let val_k = self.add_name(&val_name)?;
        self.expect(TokenKind::KwIn, "'in'")?;
        let iterator = self.expect_ident()?;
        if iterator != "pairs" {
            return Err(self.error_here(format!(
                "expected 'pairs' in for-in loop, found '{iterator}'"
            )));
        }
        self.expect(TokenKind::LParen, "'('")?;
        let saved_floor = self.reg_floor;
        self.next_reg = saved_floor;
        let table = self.alloc_reg()?;
        let table = self.expr_into(table)?;
        self.expect(TokenKind::RParen, "')'")?;
        self.expect(TokenKind::KwDo, "'do'")?;

        self.emit(Instruction::a(OpCode::ForInInit, table))?;
        let key = self.alloc_reg()?;
        let value = self.alloc_reg()?;
        self.reg_floor = value + 1;

        let loop_top = self.code.len() as u16;
        let exit = self.emit(Instruction::abc(OpCode::ForInNext, key, value, 0))?;
        self.emit(Instruction::ab(OpCode::StoreGlobal, key, key_k))?;
        self.emit(Instruction::ab(OpCode::StoreGlobal, value, val_k))?;
        self.block_until(TokenKind::KwEnd)?;
        self.emit(Instruction::a(OpCode::Jump, loop_top))?;
        self.patch_jump(exit)?;
        self.reg_floor = saved_floor;
        Ok(())
    }

    /// `function name(params) body end`
    ///
    /// The body compiles into fresh instruction/constant buffers; the
    /// resulting function joins the script's table and the defining site
    /// materializes a closure into a global of the same name.
    fn function_statement(&mut self) -> Result<(), ParseError> {
        let name = self.expect_ident()?;
        let name_k = self.add_name(&name)?;
        self.expect(TokenKind::LParen, "'('")?;
        let mut params = Vec::new();
        if !matches!(self.peek(), TokenKind::RParen) {
            loop {
                params.push(self.expect_ident()?);
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(TokenKind::RParen, "')'")?;

        let saved_code = mem::take(&mut self.code);
        let saved_lines = mem::take(&mut self.lines);
        let saved_constants = mem::take(&mut self.constants);
        let saved_next = self.next_reg;
        let saved_floor = self.reg_floor;
        let saved_locals = self.local_count;
        self.next_reg = 0;
        self.reg_floor = 0;
        self.local_count = params.len() as u16;

        let body = self.block_until(TokenKind::KwEnd);

        // Restore outer buffers whether or not the body parsed, so errors
        // don't leave the compiler in a torn state.
        let code = mem::replace(&mut self.code, saved_code);
        let lines = mem::replace(&mut self.lines, saved_lines);
        let constants = mem::replace(&mut self.constants, saved_constants);
        let local_count = self.local_count;
        self.next_reg = saved_next;
        self.reg_floor = saved_floor;
        self.local_count = saved_locals;
        body?;

        let mut code = code;
        let mut lines = lines;
        if !matches!(code.last().map(|i| i.op), Some(OpCode::Ret)) {
            code.push(Instruction::none(OpCode::Ret));
            lines.push(self.last_pos);
        }

        if self.functions.len() >= u16::MAX as usize {
            return Err(self.error_here("too many functions"));
        }
        let fn_id = self.functions.len() as u16;
        self.functions.push(FunctionInfo {
            name,
            params,
            local_count,
            code,
            constants,
            lines,
        });

        self.next_reg = self.reg_floor;
        let dst = self.alloc_reg()?;
        self.emit(Instruction::abc(OpCode::MakeClosure, dst, fn_id, 0))?;
        self.emit(Instruction::ab(OpCode::StoreGlobal, dst, name_k))?;
        Ok(())
    }

    fn return_statement(&mut self) -> Result<(), ParseError> {
        match self.peek() {
            TokenKind::KwEnd
            | TokenKind::RBrace
            | TokenKind::KwElseif
            | TokenKind::KwElse
            | TokenKind::Semicolon
            | TokenKind::Eof => {
                self.emit(Instruction::none(OpCode::Ret))?;
            }
            _ => {
                let reg = self.expr_statement_value()?;
                self.emit(Instruction::ab(OpCode::Ret, reg, 1))?;
            }
        }
        Ok(())
    }

    // ---- expressions ----

    /// Evaluate an expression into `dst`, returning the register that
    /// holds the result.
    fn expr_into(&mut self, dst: u16) -> Result<u16, ParseError> {
        self.nesting += 1;
        if self.nesting > MAX_NESTING {
            self.nesting -= 1;
            return Err(self.error_here("expression nested too deeply"));
        }
        let result = self.binary_expr(0, dst);
        self.nesting -= 1;
        result
    }

    fn binary_expr(&mut self, level: usize, dst: u16) -> Result<u16, ParseError> {
        // Precedence, loosest first.
        const LEVELS: &[&[(TokenKind, OpCode)]] = &[
            &[(TokenKind::OrOr, OpCode::LogicalOr)],
            &[(TokenKind::AndAnd, OpCode::LogicalAnd)],
            &[(TokenKind::EqEq, OpCode::Eq), (TokenKind::Ne, OpCode::Ne)],
            &[
                (TokenKind::Lt, OpCode::Lt),
                (TokenKind::Le, OpCode::Le),
                (TokenKind::Gt, OpCode::Gt),
                (TokenKind::Ge, OpCode::Ge),
            ],
            &[(TokenKind::Concat, OpCode::Concat)],
            &[(TokenKind::Plus, OpCode::Add), (TokenKind::Minus, OpCode::Sub)],
            &[
                (TokenKind::Star, OpCode::Mul),
                (TokenKind::Slash, OpCode::Div),
                (TokenKind::Percent, OpCode::Mod),
            ],
        ];

        if level == LEVELS.len() {
            return self.unary(dst);
        }

        let mut lhs = self.binary_expr(level + 1, dst)?;
        loop {
            let Some(op) = LEVELS[level]
                .iter()
                .find(|(kind, _)| kind == self.peek())
                .map(|(_, op)| *op)
            else {
                break;
            };
            self.advance();
            let scratch_base = self.next_reg;
            let rhs = self.alloc_reg()?;
            let rhs = self.binary_expr(level + 1, rhs)?;
            self.emit(Instruction::abc(op, dst, lhs, rhs))?;
            self.next_reg = scratch_base;
            lhs = dst;
        }
        Ok(lhs)
    }

    fn unary(&mut self, dst: u16) -> Result<u16, ParseError> {
        if self.eat(&TokenKind::Not) {
            let src = self.unary(dst)?;
            self.emit(Instruction::ab(OpCode::LogicalNot, dst, src))?;
            return Ok(dst);
        }
        if self.eat(&TokenKind::Minus) {
            // Unary minus compiles as `0 - x`.
            let zero = self.add_const(Value::Number(0.0))?;
            self.emit(Instruction::ab(OpCode::LoadConst, dst, zero))?;
            let scratch_base = self.next_reg;
            let rhs = self.alloc_reg()?;
            let rhs = self.unary(rhs)?;
            self.emit(Instruction::abc(OpCode::Sub, dst, dst, rhs))?;
            self.next_reg = scratch_base;
            return Ok(dst);
        }
        self.postfix(dst)
    }

    fn postfix(&mut self, dst: u16) -> Result<u16, ParseError> {
        let mut place = self.primary(dst)?;
        loop {
            match self.peek() {
                TokenKind::Dot => {
                    self.advance();
                    let field = self.expect_ident()?;
                    let field_k = self.add_name(&field)?;
                    let base = self.materialize(&place, dst)?;
                    let scratch_base = self.next_reg;
                    let key = self.alloc_reg()?;
                    self.emit(Instruction::ab(OpCode::LoadConst, key, field_k))?;
                    self.emit(Instruction::abc(OpCode::GetTable, dst, base, key))?;
                    self.next_reg = scratch_base;
                    if self.eat(&TokenKind::LParen) {
                        let (arg_start, argc) = self.call_args()?;
                        self.emit(Instruction::call(OpCode::CallClosure, dst, arg_start, argc))?;
                    }
                    place = Place::Reg(dst);
                }
                TokenKind::LBracket => {
                    self.advance();
                    let base = self.materialize(&place, dst)?;
                    let scratch_base = self.next_reg;
                    let index = self.alloc_reg()?;
                    let index = self.expr_into(index)?;
                    self.expect(TokenKind::RBracket, "']'")?;
                    self.emit(Instruction::abc(OpCode::ArrayGet, dst, base, index))?;
                    self.next_reg = scratch_base;
                    place = Place::Reg(dst);
                }
                TokenKind::LParen => {
                    self.advance();
                    // The compiler cannot know whether a bare name resolves
                    // to a native or a guest closure, so every call goes
                    // through call_closure; the call opcode is reserved for
                    // callers that can guarantee a native.
                    if let Place::Ident(name) = &place {
                        let name = name.clone();
                        if let Some(result) = self.intrinsic_call(&name, dst)? {
                            place = Place::Reg(result);
                        } else {
                            let name_k = self.add_name(&name)?;
                            self.emit(Instruction::ab(OpCode::LoadGlobal, dst, name_k))?;
                            let (arg_start, argc) = self.call_args()?;
                            self.emit(Instruction::call(
                                OpCode::CallClosure,
                                dst,
                                arg_start,
                                argc,
                            ))?;
                            place = Place::Reg(dst);
                        }
                    } else {
                        let base = self.materialize(&place, dst)?;
                        let (arg_start, argc) = self.call_args()?;
                        self.emit(Instruction::call(OpCode::CallClosure, base, arg_start, argc))?;
                        place = Place::Reg(base);
                    }
                }
                _ => break,
            }
        }
        self.materialize(&place, dst)
    }

    fn materialize(&mut self, place: &Place, dst: u16) -> Result<u16, ParseError> {
        match place {
            Place::Reg(reg) => Ok(*reg),
            Place::Ident(name) => {
                let name_k = self.add_name(name)?;
                self.emit(Instruction::ab(OpCode::LoadGlobal, dst, name_k))?;
                Ok(dst)
            }
        }
    }

    /// Argument list after a consumed `(`. Arguments evaluate into
    /// consecutive registers starting at the current cursor.
    fn call_args(&mut self) -> Result<(u16, u16), ParseError> {
        let arg_start = self.next_reg;
        let mut argc: u16 = 0;
        if !matches!(self.peek(), TokenKind::RParen) {
            loop {
                let slot = arg_start + argc;
                if slot >= REGISTER_LIMIT {
                    return Err(self.error_here("too many call arguments"));
                }
                self.next_reg = slot + 1;
                self.expr_into(slot)?;
                argc += 1;
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(TokenKind::RParen, "')'")?;
        self.next_reg = arg_start + argc;
        Ok((arg_start, argc))
    }

    /// String intrinsics compile to dedicated opcodes; the equivalent
    /// natives stay available for computed calls.
    fn intrinsic_call(&mut self, name: &str, dst: u16) -> Result<Option<u16>, ParseError> {
        let (op, arity): (OpCode, u16) = match name {
            "strlen" => (OpCode::StrLen, 1),
            "substr" => (OpCode::SubStr, 3),
            "strupper" => (OpCode::StrUpper, 1),
            "strlower" => (OpCode::StrLower, 1),
            "strfind" => (OpCode::StrFind, 2),
            _ => return Ok(None),
        };
        let scratch_base = self.next_reg;
        let (arg_start, argc) = self.call_args()?;
        if argc != arity {
            return Err(self.error_here(format!(
                "{name} expects {arity} argument{}, got {argc}",
                if arity == 1 { "" } else { "s" }
            )));
        }
        let instr = match op {
            OpCode::SubStr => Instruction {
                op,
                a: dst,
                b: arg_start,
                c: arg_start + 1,
                extra: arg_start + 2,
            },
            OpCode::StrFind => Instruction::abc(op, dst, arg_start, arg_start + 1),
            _ => Instruction::ab(op, dst, arg_start),
        };
        self.emit(instr)?;
        self.next_reg = scratch_base;
        Ok(Some(dst))
    }

    fn primary(&mut self, dst: u16) -> Result<Place, ParseError> {
        match self.peek().clone() {
            TokenKind::Number(n) => {
                self.advance();
                let k = self.add_const(Value::Number(n))?;
                self.emit(Instruction::ab(OpCode::LoadConst, dst, k))?;
                Ok(Place::Reg(dst))
            }
            TokenKind::Str(s) => {
                self.advance();
                let k = self.add_const(Value::string(s))?;
                self.emit(Instruction::ab(OpCode::LoadConst, dst, k))?;
                Ok(Place::Reg(dst))
            }
            TokenKind::KwTrue => {
                self.advance();
                let k = self.add_const(Value::Bool(true))?;
                self.emit(Instruction::ab(OpCode::LoadConst, dst, k))?;
                Ok(Place::Reg(dst))
            }
            TokenKind::KwFalse => {
                self.advance();
                let k = self.add_const(Value::Bool(false))?;
                self.emit(Instruction::ab(OpCode::LoadConst, dst, k))?;
                Ok(Place::Reg(dst))
            }
            TokenKind::KwNil => {
                self.advance();
                let k = self.add_const(Value::Nil)?;
                self.emit(Instruction::ab(OpCode::LoadConst, dst, k))?;
                Ok(Place::Reg(dst))
            }
            TokenKind::Ident(name) => {
                self.advance();
                Ok(Place::Ident(name))
            }
            TokenKind::LParen => {
                self.advance();
                let reg = self.expr_into(dst)?;
                self.expect(TokenKind::RParen, "')'")?;
                Ok(Place::Reg(reg))
            }
            TokenKind::LBrace => {
                self.advance();
                self.table_literal(dst)?;
                Ok(Place::Reg(dst))
            }
            TokenKind::LBracket => {
                self.advance();
                self.array_literal(dst)?;
                Ok(Place::Reg(dst))
            }
            TokenKind::KwRequire => {
                self.advance();
                self.expect(TokenKind::LParen, "'('")?;
                let path = match self.peek() {
                    TokenKind::Str(path) => path.clone(),
                    other => {
                        return Err(self.error_here(format!(
                            "require expects a string path, found {}",
                            other.describe()
                        )));
                    }
                };
                self.advance();
                self.expect(TokenKind::RParen, "')'")?;
                let path_k = self.add_const(Value::string(path))?;
                self.emit(Instruction::ab(OpCode::RequireModule, dst, path_k))?;
                Ok(Place::Reg(dst))
            }
            other => Err(self.error_here(format!(
                "expected an expression, found {}",
                other.describe()
            ))),
        }
    }

    /// `{ key = expr, ... }` — identifier or string keys.
    fn table_literal(&mut self, dst: u16) -> Result<(), ParseError> {
        self.emit(Instruction::a(OpCode::NewTable, dst))?;
        if self.eat(&TokenKind::RBrace) {
            return Ok(());
        }
        loop {
            let key = match self.peek() {
                TokenKind::Ident(name) => name.clone(),
                TokenKind::Str(s) => s.clone(),
                other => {
                    return Err(self.error_here(format!(
                        "expected table key, found {}",
                        other.describe()
                    )));
                }
            };
            self.advance();
            let key_k = self.add_name(&key)?;
            self.expect(TokenKind::Assign, "'='")?;

            let scratch_base = self.next_reg;
            let key_reg = self.alloc_reg()?;
            self.emit(Instruction::ab(OpCode::LoadConst, key_reg, key_k))?;
            let value = self.alloc_reg()?;
            let value = self.expr_into(value)?;
            self.emit(Instruction::abc(OpCode::SetTable, dst, key_reg, value))?;
            self.next_reg = scratch_base;

            if self.eat(&TokenKind::Comma) {
                if self.eat(&TokenKind::RBrace) {
                    return Ok(()); // trailing comma
                }
                continue;
            }
            return self.expect(TokenKind::RBrace, "'}'");
        }
    }

    /// `[ expr, ... ]`
    fn array_literal(&mut self, dst: u16) -> Result<(), ParseError> {
        self.emit(Instruction::a(OpCode::NewArray, dst))?;
        if self.eat(&TokenKind::RBracket) {
            return Ok(());
        }
        loop {
            let scratch_base = self.next_reg;
            let item = self.alloc_reg()?;
            let item = self.expr_into(item)?;
            self.emit(Instruction::ab(OpCode::ArrayPush, dst, item))?;
            self.next_reg = scratch_base;

            if self.eat(&TokenKind::Comma) {
                if self.eat(&TokenKind::RBracket) {
                    return Ok(());
                }
                continue;
            }
            return self.expect(TokenKind::RBracket, "']'");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ops(chunk: &CompiledChunk) -> Vec<OpCode> {
        chunk.code.iter().map(|i| i.op).collect()
    }

    #[test]
    fn test_empty_source_compiles_to_bare_ret() {
        let chunk = compile("").unwrap();
        assert_eq!(ops(&chunk), vec![OpCode::Ret]);
        assert_eq!(chunk.code[0].b, 0);
    }

    #[test]
    fn test_expression_statement_feeds_final_ret() {
        let chunk = compile("3 + 4").unwrap();
        assert_eq!(
            ops(&chunk),
            vec![OpCode::LoadConst, OpCode::LoadConst, OpCode::Add, OpCode::Ret]
        );
        let ret = chunk.code.last().unwrap();
        assert_eq!(ret.b, 1);
        assert_eq!(ret.a, chunk.code[2].a);
    }

    #[test]
    fn test_precedence_mul_before_add() {
        let chunk = compile("1 + 2 * 3").unwrap();
        assert_eq!(
            ops(&chunk),
            vec![
                OpCode::LoadConst, // 1
                OpCode::LoadConst, // 2
                OpCode::LoadConst, // 3
                OpCode::Mul,
                OpCode::Add,
                OpCode::Ret,
            ]
        );
    }

    #[test]
    fn test_var_emits_store_global() {
        let chunk = compile("var x = 10").unwrap();
        assert_eq!(ops(&chunk), vec![OpCode::LoadConst, OpCode::StoreGlobal, OpCode::Ret]);
        let name = &chunk.constants[chunk.code[1].b as usize];
        assert_eq!(name.as_str(), Some("x"));
    }

    #[test]
    fn test_local_emits_declare_local() {
        let chunk = compile("local x = 1").unwrap();
        assert_eq!(ops(&chunk), vec![OpCode::LoadConst, OpCode::DeclareLocal, OpCode::Ret]);
    }

    #[test]
    fn test_while_backpatches_exit() {
        let chunk = compile("while (x < 3) { x = x + 1 }").unwrap();
        let exit = chunk
            .code
            .iter()
            .find(|i| i.op == OpCode::JumpIfFalse)
            .unwrap();
        // The exit jump lands on the final ret.
        assert_eq!(exit.b as usize, chunk.code.len() - 1);
        let back = chunk.code.iter().find(|i| i.op == OpCode::Jump).unwrap();
        assert_eq!(back.a, 0);
    }

    #[test]
    fn test_if_elseif_else_chain() {
        let chunk = compile(
            "if (a) { var x = 1 } elseif (b) { var x = 2 } else { var x = 3 }",
        )
        .unwrap();
        let jumps: Vec<_> = chunk
            .code
            .iter()
            .filter(|i| i.op == OpCode::JumpIfFalse)
            .collect();
        assert_eq!(jumps.len(), 2);
        // Both arm-skipping jumps land within the code stream.
        for j in jumps {
            assert!((j.b as usize) <= chunk.code.len());
        }
    }

    #[test]
    fn test_numeric_for_shape() {
        let chunk = compile("for i = 1, 3 do var x = i end").unwrap();
        let kinds = ops(&chunk);
        assert!(kinds.contains(&OpCode::ForInit));
        assert!(kinds.contains(&OpCode::ForLoop));
        let for_loop = chunk.code.iter().find(|i| i.op == OpCode::ForLoop).unwrap();
        let init = chunk.code.iter().find(|i| i.op == OpCode::ForInit).unwrap();
        // for_loop jumps back to the store of the loop variable.
        assert_eq!(chunk.code[for_loop.c as usize].op, OpCode::StoreGlobal);
        assert_eq!(init.a, for_loop.a);
    }

    #[test]
    fn test_for_in_pairs_shape() {
        let chunk = compile("for k, v in pairs(t) do var x = v end").unwrap();
        let kinds = ops(&chunk);
        assert!(kinds.contains(&OpCode::ForInInit));
        assert!(kinds.contains(&OpCode::ForInNext));
        let next = chunk.code.iter().find(|i| i.op == OpCode::ForInNext).unwrap();
        assert!((next.c as usize) <= chunk.code.len());
    }

    #[test]
    fn test_function_definition_populates_table() {
        let chunk = compile("function add(a, b)\n  return a + b\nend").unwrap();
        assert_eq!(chunk.functions.len(), 1);
        let info = &chunk.functions[0];
        assert_eq!(info.name, "add");
        assert_eq!(info.params, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(info.code.last().map(|i| i.op), Some(OpCode::Ret));
        // Defining site: closure then store under the function's name.
        assert!(ops(&chunk).contains(&OpCode::MakeClosure));
    }

    #[test]
    fn test_function_body_without_return_gets_ret() {
        let chunk = compile("function noop()\nend").unwrap();
        assert_eq!(chunk.functions[0].code.last().map(|i| i.op), Some(OpCode::Ret));
    }

    #[test]
    fn test_bare_call_compiles_to_load_global_call_closure() {
        // The call opcode requires a native at runtime, and a bare name
        // may just as well hold a guest closure, so the compiler never
        // emits it.
        let chunk = compile("print(\"hi\")").unwrap();
        let kinds = ops(&chunk);
        assert!(kinds.contains(&OpCode::LoadGlobal));
        assert!(kinds.contains(&OpCode::CallClosure));
        assert!(!kinds.contains(&OpCode::Call));
    }

    #[test]
    fn test_nested_call_uses_call_closure() {
        let chunk = compile("var x = add(1, 2)").unwrap();
        assert!(ops(&chunk).contains(&OpCode::CallClosure));
    }

    #[test]
    fn test_method_call_goes_through_get_table() {
        let chunk = compile("obj.greet(1)").unwrap();
        let kinds = ops(&chunk);
        assert!(kinds.contains(&OpCode::GetTable));
        assert!(kinds.contains(&OpCode::CallClosure));
    }

    #[test]
    fn test_array_store_statement() {
        let chunk = compile("a[0] = 5").unwrap();
        let kinds = ops(&chunk);
        assert!(kinds.contains(&OpCode::ArraySet));
        assert!(!kinds.contains(&OpCode::ArrayGet));
    }

    #[test]
    fn test_property_store_statement() {
        let chunk = compile("a.b = 5").unwrap();
        let kinds = ops(&chunk);
        assert!(kinds.contains(&OpCode::SetTable));
    }

    #[test]
    fn test_table_and_array_literals() {
        let chunk = compile("var t = { name = \"x\", count = 2 }\nvar a = [1, 2, 3]").unwrap();
        let kinds = ops(&chunk);
        assert!(kinds.contains(&OpCode::NewTable));
        assert_eq!(kinds.iter().filter(|o| **o == OpCode::SetTable).count(), 2);
        assert!(kinds.contains(&OpCode::NewArray));
        assert_eq!(kinds.iter().filter(|o| **o == OpCode::ArrayPush).count(), 3);
    }

    #[test]
    fn test_string_intrinsics_compile_to_opcodes() {
        let chunk = compile("var n = strlen(\"abc\")\nvar s = substr(\"hello\", 1, 3)").unwrap();
        let kinds = ops(&chunk);
        assert!(kinds.contains(&OpCode::StrLen));
        assert!(kinds.contains(&OpCode::SubStr));
        assert!(!kinds.contains(&OpCode::Call));
    }

    #[test]
    fn test_require_emits_module_opcode() {
        let chunk = compile("require(\"lib/util.gza\")").unwrap();
        assert!(ops(&chunk).contains(&OpCode::RequireModule));
    }

    #[test]
    fn test_constants_are_deduplicated() {
        let chunk = compile("var x = 1\nvar y = 1\nvar z = \"a\"\nvar w = \"a\"").unwrap();
        let numbers = chunk
            .constants
            .iter()
            .filter(|c| matches!(c, Value::Number(_)))
            .count();
        assert_eq!(numbers, 1);
    }

    #[test]
    fn test_trailing_semicolons_tolerated() {
        assert!(compile("var x = 1;\nx + 1;").is_ok());
        assert!(compile(";;;").is_ok());
    }

    #[test]
    fn test_parse_error_positions() {
        let err = compile("var = 5").unwrap_err();
        assert_eq!(err.line, 1);
        assert!(err.message.contains("identifier"));

        let err = compile("if (x) {").unwrap_err();
        assert!(err.message.contains("unexpected end of input"));
    }

    #[test]
    fn test_unbalanced_brackets_report_errors() {
        assert!(compile("var a = [1, 2").is_err());
        assert!(compile("var t = { x = 1").is_err());
        assert!(compile("f(1, 2").is_err());
    }

    #[test]
    fn test_deep_nesting_is_an_error_not_a_crash() {
        // Run on a thread with a larger stack: the default test-thread stack
        // (2MiB) is smaller than a normal process main thread (8MiB), and the
        // deeply recursive parser needs the latter to hit the nesting guard
        // before the stack itself runs out.
        std::thread::Builder::new()
            .stack_size(16 * 1024 * 1024)
            .spawn(|| {
                let source = format!("var x = {}1{}", "(".repeat(500), ")".repeat(500));
                assert!(compile(&source).is_err());
            })
            .unwrap()
            .join()
            .unwrap();
    }

    #[test]
    fn test_moderate_nesting_is_fine() {
        let source = format!("var x = {}1{}", "(".repeat(64), ")".repeat(64));
        assert!(compile(&source).is_ok());
    }

    #[test]
    fn test_long_identifier_accepted() {
        let name = "x".repeat(4096);
        assert!(compile(&format!("var {name} = 1")).is_ok());
    }

    #[test]
    fn test_line_table_parallels_code() {
        let chunk = compile("var x = 1\nvar y = 2").unwrap();
        assert_eq!(chunk.code.len(), chunk.lines.len());
        // The store for y sits on line 2.
        let store_y = chunk
            .code
            .iter()
            .zip(&chunk.lines)
            .filter(|(i, _)| i.op == OpCode::StoreGlobal)
            .nth(1)
            .unwrap();
        assert_eq!(store_y.1.line, 2);
    }
}
