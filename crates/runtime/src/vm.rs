//! Register virtual machine
//!
//! A fetch-decode-execute loop over 256-register frames. Before every
//! dispatch the loop checks the shared [`RunBudget`]: wall-clock deadline
//! first, then the instruction ceiling, so an infinite loop terminates
//! deterministically under either bound. Nested calls push fresh frames but
//! share the budget, which is how an inner call can never escape the outer
//! deadline.
//!
//! Name resolution happens here, not in the compiler: `load_global` and
//! `store_global` consult the frame's named locals (innermost first), then
//! the script-run globals, then the engine-wide globals. `declare_local`
//! pushes a new named binding, which is all the compiler needs to make
//! shadowing work.
//!
//! Errors are wrapped exactly once with an [`ErrorContext`] at the failing
//! frame; frames unwound on the way out append themselves to the trace.

use crate::engine::{InstrumentEvent, InstrumentFn};
use ghostlang_core::bytecode::{CompiledChunk, FunctionInfo, Instruction, OpCode, SourcePos};
use ghostlang_core::value::{Array, Closure, Table};
use ghostlang_core::{
    ErrorContext, ExecError, FrameInfo, GhostStr, MemoryTracker, NativeContext, NativeFunction,
    SecurityContext, Value,
};
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::trace;

/// Register file size per frame.
const REGISTER_COUNT: usize = 256;

/// Named-local stack capacity per frame.
const LOCAL_LIMIT: usize = 256;

/// Nested call ceiling shared across one run.
const MAX_CALL_DEPTH: usize = 128;

/// Limits shared by every frame of one `run`/`call`.
///
/// The start timestamp is taken once at construction; nested calls reuse
/// the same budget, so the deadline is global to the run, never reset.
pub(crate) struct RunBudget {
    started: Instant,
    timeout: Duration,
    instruction_limit: u64,
    executed: AtomicU64,
    depth: AtomicUsize,
}

impl RunBudget {
    pub fn new(timeout_ms: u64, instruction_limit: u64) -> Arc<Self> {
        Arc::new(RunBudget {
            started: Instant::now(),
            timeout: Duration::from_millis(timeout_ms),
            instruction_limit,
            executed: AtomicU64::new(0),
            depth: AtomicUsize::new(0),
        })
    }

    fn check_deadline(&self) -> Result<(), ExecError> {
        if self.started.elapsed() >= self.timeout {
            trace!(timeout_ms = self.timeout.as_millis() as u64, "deadline exceeded");
            return Err(ExecError::ExecutionTimeout {
                limit_ms: self.timeout.as_millis() as u64,
            });
        }
        Ok(())
    }

    fn charge_instruction(&self) -> Result<(), ExecError> {
        let executed = self.executed.fetch_add(1, Ordering::Relaxed);
        if executed >= self.instruction_limit {
            return Err(ExecError::InstructionLimitExceeded {
                limit: self.instruction_limit,
            });
        }
        Ok(())
    }

    fn enter_call(&self) -> Result<(), ExecError> {
        let depth = self.depth.fetch_add(1, Ordering::Relaxed) + 1;
        if depth > MAX_CALL_DEPTH {
            self.depth.fetch_sub(1, Ordering::Relaxed);
            return Err(ExecError::StackOverflow { depth });
        }
        Ok(())
    }

    fn exit_call(&self) {
        self.depth.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn instructions_executed(&self) -> u64 {
        self.executed.load(Ordering::Relaxed)
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Engine-side services a VM run needs.
pub(crate) struct VmContext {
    pub memory: Arc<MemoryTracker>,
    pub security: Arc<SecurityContext>,
    pub engine_globals: Arc<RwLock<HashMap<String, Value>>>,
    pub instrument: Option<InstrumentFn>,
}

/// One activation record.
struct Frame<'c> {
    code: &'c [Instruction],
    constants: &'c [Value],
    lines: &'c [SourcePos],
    functions: &'c Arc<Vec<FunctionInfo>>,
    registers: Vec<Value>,
    locals: Vec<(String, Value)>,
    iters: Vec<TableIter>,
    function_name: Option<String>,
}

struct TableIter {
    entries: Vec<(String, Value)>,
    index: usize,
}

impl<'c> Frame<'c> {
    fn root(chunk: &'c CompiledChunk) -> Self {
        Frame {
            code: &chunk.code,
            constants: &chunk.constants,
            lines: &chunk.lines,
            functions: &chunk.functions,
            registers: vec![Value::Nil; REGISTER_COUNT],
            locals: Vec::new(),
            iters: Vec::new(),
            function_name: None,
        }
    }
}

enum Step {
    Next,
    Jump(usize),
    Return(Value),
}

pub(crate) struct Vm<'a> {
    ctx: &'a VmContext,
    budget: Arc<RunBudget>,
    script_globals: &'a mut HashMap<String, Value>,
}

impl<'a> Vm<'a> {
    pub fn new(
        ctx: &'a VmContext,
        budget: Arc<RunBudget>,
        script_globals: &'a mut HashMap<String, Value>,
    ) -> Self {
        Vm {
            ctx,
            budget,
            script_globals,
        }
    }

    /// Run a chunk's root instruction stream to completion.
    pub fn run_chunk(&mut self, chunk: &CompiledChunk) -> Result<Value, ExecError> {
        let mut frame = Frame::root(chunk);
        self.run_frame(&mut frame)
    }

    /// Invoke a closure directly (the `engine.call` entry point).
    pub fn call_closure_value(
        &mut self,
        closure: &Closure,
        args: &[Value],
    ) -> Result<Value, ExecError> {
        self.call_function(closure, &[], args)
    }

    fn run_frame(&mut self, frame: &mut Frame<'_>) -> Result<Value, ExecError> {
        let mut pc: usize = 0;
        loop {
            // Falling off the end of the stream is an implicit nil return;
            // patched jumps may legitimately land one past the last
            // instruction.
            if pc >= frame.code.len() {
                return Ok(Value::Nil);
            }
            if let Err(kind) = self.budget.check_deadline() {
                return Err(wrap_error(kind, frame, pc));
            }
            if let Err(kind) = self.budget.charge_instruction() {
                return Err(wrap_error(kind, frame, pc));
            }
            let instr = frame.code[pc];
            match self.exec(frame, instr) {
                Ok(Step::Next) => pc += 1,
                Ok(Step::Jump(target)) => pc = target,
                Ok(Step::Return(value)) => return Ok(value),
                Err(err) => return Err(wrap_error(err, frame, pc)),
            }
        }
    }

    fn exec(&mut self, frame: &mut Frame<'_>, instr: Instruction) -> Result<Step, ExecError> {
        match instr.op {
            OpCode::Nop => Ok(Step::Next),

            // ---- data movement ----
            OpCode::LoadConst => {
                // Pool strings are shared by handle, never duplicated.
                let value = const_value(frame, instr.b)?;
                set_reg(frame, instr.a, value)?;
                Ok(Step::Next)
            }
            OpCode::LoadLocal => {
                let slot = instr.b as usize;
                let value = frame
                    .locals
                    .get(slot)
                    .map(|(_, v)| v.clone())
                    .ok_or_else(|| invalid(format!("local slot {slot} out of range")))?;
                set_reg(frame, instr.a, value)?;
                Ok(Step::Next)
            }
            OpCode::StoreLocal => {
                let value = reg(frame, instr.a)?;
                let slot = instr.b as usize;
                let entry = frame
                    .locals
                    .get_mut(slot)
                    .ok_or_else(|| invalid(format!("local slot {slot} out of range")))?;
                entry.1 = value;
                Ok(Step::Next)
            }
            OpCode::LoadGlobal => {
                let name = const_name(frame, instr.b, NameKind::Global)?;
                let value = self
                    .resolve_name(frame, &name)
                    .ok_or(ExecError::UndefinedVariable { name })?;
                set_reg(frame, instr.a, value)?;
                Ok(Step::Next)
            }
            OpCode::StoreGlobal => {
                let name = const_name(frame, instr.b, NameKind::Global)?;
                let value = reg(frame, instr.a)?;
                self.store_name(frame, name, value);
                Ok(Step::Next)
            }
            OpCode::DeclareLocal => {
                let name = const_name(frame, instr.a, NameKind::Global)?;
                if frame.locals.len() >= LOCAL_LIMIT {
                    return Err(ExecError::StackOverflow {
                        depth: frame.locals.len(),
                    });
                }
                let value = reg(frame, instr.b)?;
                frame.locals.push((name, value));
                Ok(Step::Next)
            }

            // ---- arithmetic ----
            OpCode::Add | OpCode::Sub | OpCode::Mul | OpCode::Div | OpCode::Mod => {
                let lhs = number_operand(frame, instr.b, instr.op)?;
                let rhs = number_operand(frame, instr.c, instr.op)?;
                // Division by zero follows IEEE-754: inf/NaN, not an error.
                let result = match instr.op {
                    OpCode::Add => lhs + rhs,
                    OpCode::Sub => lhs - rhs,
                    OpCode::Mul => lhs * rhs,
                    OpCode::Div => lhs / rhs,
                    _ => lhs % rhs,
                };
                set_reg(frame, instr.a, Value::Number(result))?;
                Ok(Step::Next)
            }
            OpCode::Concat => {
                let lhs = reg(frame, instr.b)?;
                let rhs = reg(frame, instr.c)?;
                let lhs = stringlike(&lhs, "concat")?;
                let rhs = stringlike(&rhs, "concat")?;
                let mut text = String::with_capacity(lhs.len() + rhs.len());
                text.push_str(&lhs);
                text.push_str(&rhs);
                set_reg(
                    frame,
                    instr.a,
                    Value::Str(GhostStr::tracked(&self.ctx.memory, text)?),
                )?;
                Ok(Step::Next)
            }

            // ---- comparison and logic ----
            OpCode::Eq => {
                let result = reg(frame, instr.b)? == reg(frame, instr.c)?;
                set_reg(frame, instr.a, Value::Bool(result))?;
                Ok(Step::Next)
            }
            OpCode::Ne => {
                let result = reg(frame, instr.b)? != reg(frame, instr.c)?;
                set_reg(frame, instr.a, Value::Bool(result))?;
                Ok(Step::Next)
            }
            OpCode::Lt | OpCode::Le | OpCode::Gt | OpCode::Ge => {
                let lhs = number_operand(frame, instr.b, instr.op)?;
                let rhs = number_operand(frame, instr.c, instr.op)?;
                let result = match instr.op {
                    OpCode::Lt => lhs < rhs,
                    OpCode::Le => lhs <= rhs,
                    OpCode::Gt => lhs > rhs,
                    _ => lhs >= rhs,
                };
                set_reg(frame, instr.a, Value::Bool(result))?;
                Ok(Step::Next)
            }
            OpCode::LogicalAnd => {
                let result = reg(frame, instr.b)?.is_truthy() && reg(frame, instr.c)?.is_truthy();
                set_reg(frame, instr.a, Value::Bool(result))?;
                Ok(Step::Next)
            }
            OpCode::LogicalOr => {
                let result = reg(frame, instr.b)?.is_truthy() || reg(frame, instr.c)?.is_truthy();
                set_reg(frame, instr.a, Value::Bool(result))?;
                Ok(Step::Next)
            }
            OpCode::LogicalNot => {
                let result = !reg(frame, instr.b)?.is_truthy();
                set_reg(frame, instr.a, Value::Bool(result))?;
                Ok(Step::Next)
            }

            // ---- control flow ----
            OpCode::Jump => Ok(Step::Jump(instr.a as usize)),
            OpCode::JumpIfFalse => {
                if reg(frame, instr.a)?.is_truthy() {
                    Ok(Step::Next)
                } else {
                    Ok(Step::Jump(instr.b as usize))
                }
            }
            OpCode::JumpIfTrue => {
                if reg(frame, instr.a)?.is_truthy() {
                    Ok(Step::Jump(instr.b as usize))
                } else {
                    Ok(Step::Next)
                }
            }
            OpCode::Ret => {
                let value = if instr.b == 1 {
                    reg(frame, instr.a)?
                } else {
                    Value::Nil
                };
                Ok(Step::Return(value))
            }

            // ---- calls ----
            OpCode::Call => {
                let name = const_name(frame, instr.a, NameKind::Function)?;
                let callee = self
                    .resolve_name(frame, &name)
                    .ok_or_else(|| ExecError::FunctionNotFound { name: name.clone() })?;
                // call takes registered natives only; closures (and
                // everything else) go through call_closure.
                let Value::Native(native) = callee else {
                    return Err(ExecError::NotAFunction { name });
                };
                let start = instr.b as usize;
                let end = start + instr.extra as usize;
                if end > frame.registers.len() {
                    return Err(invalid("argument window out of range"));
                }
                let result = self.invoke_native(&native, &frame.registers[start..end])?;
                set_reg(frame, instr.b, result)?;
                Ok(Step::Next)
            }
            OpCode::CallClosure => {
                let callee = reg(frame, instr.a)?;
                let name = callee_name(&callee);
                let result = self.dispatch_call(frame, &callee, &name, instr.b, instr.extra)?;
                set_reg(frame, instr.a, result)?;
                Ok(Step::Next)
            }

            // ---- tables ----
            OpCode::NewTable => {
                set_reg(frame, instr.a, Value::Table(Table::tracked(&self.ctx.memory)?))?;
                Ok(Step::Next)
            }
            OpCode::GetTable => {
                let table = reg(frame, instr.b)?;
                let key = reg(frame, instr.c)?;
                let value = match (&table, &key) {
                    (Value::Table(t), Value::Str(k)) => t.get(k.as_str()).unwrap_or(Value::Nil),
                    (Value::Table(_), other) => {
                        return Err(ExecError::type_error(format!(
                            "table keys must be strings, got {}",
                            other.type_name()
                        )));
                    }
                    (other, _) => {
                        return Err(ExecError::type_error(format!(
                            "cannot index {} as a table",
                            other.type_name()
                        )));
                    }
                };
                set_reg(frame, instr.a, value)?;
                Ok(Step::Next)
            }
            OpCode::SetTable => {
                let table = reg(frame, instr.a)?;
                let key = reg(frame, instr.b)?;
                let value = reg(frame, instr.c)?;
                match (&table, &key) {
                    (Value::Table(t), Value::Str(k)) => t.insert(k.as_str(), value)?,
                    (Value::Table(_), other) => {
                        return Err(ExecError::type_error(format!(
                            "table keys must be strings, got {}",
                            other.type_name()
                        )));
                    }
                    (other, _) => {
                        return Err(ExecError::type_error(format!(
                            "cannot index {} as a table",
                            other.type_name()
                        )));
                    }
                }
                Ok(Step::Next)
            }

            // ---- arrays ----
            OpCode::NewArray => {
                set_reg(frame, instr.a, Value::Array(Array::tracked(&self.ctx.memory)?))?;
                Ok(Step::Next)
            }
            OpCode::ArrayGet => {
                let container = reg(frame, instr.b)?;
                let index = reg(frame, instr.c)?;
                let value = indexed_get(&container, &index)?;
                set_reg(frame, instr.a, value)?;
                Ok(Step::Next)
            }
            OpCode::ArraySet => {
                let container = reg(frame, instr.a)?;
                let index = reg(frame, instr.b)?;
                let value = reg(frame, instr.c)?;
                indexed_set(&container, &index, value)?;
                Ok(Step::Next)
            }
            OpCode::ArrayPush => {
                let container = reg(frame, instr.a)?;
                let value = reg(frame, instr.b)?;
                match container {
                    Value::Array(arr) => arr.push(value)?,
                    other => {
                        return Err(ExecError::type_error(format!(
                            "array_push expects an array, got {}",
                            other.type_name()
                        )));
                    }
                }
                Ok(Step::Next)
            }
            OpCode::ArrayLen => {
                let container = reg(frame, instr.b)?;
                let len = match container {
                    Value::Array(arr) => arr.len(),
                    other => {
                        return Err(ExecError::type_error(format!(
                            "array_len expects an array, got {}",
                            other.type_name()
                        )));
                    }
                };
                set_reg(frame, instr.a, Value::Number(len as f64))?;
                Ok(Step::Next)
            }

            // ---- loops ----
            OpCode::ForInit => {
                let start = reg(frame, instr.b)?;
                set_reg(frame, instr.a, start)?;
                Ok(Step::Next)
            }
            OpCode::ForLoop => {
                let counter = number_operand(frame, instr.a, instr.op)?;
                let bound = number_operand(frame, instr.b, instr.op)?;
                let next = counter + 1.0;
                set_reg(frame, instr.a, Value::Number(next))?;
                if next <= bound {
                    Ok(Step::Jump(instr.c as usize))
                } else {
                    Ok(Step::Next)
                }
            }
            OpCode::ForInInit => {
                let table = reg(frame, instr.a)?;
                match table {
                    Value::Table(t) => {
                        frame.iters.push(TableIter {
                            entries: t.snapshot(),
                            index: 0,
                        });
                        Ok(Step::Next)
                    }
                    other => Err(ExecError::type_error(format!(
                        "pairs expects a table, got {}",
                        other.type_name()
                    ))),
                }
            }
            OpCode::ForInNext => {
                let iter = frame
                    .iters
                    .last_mut()
                    .ok_or_else(|| invalid("iterator stack underflow"))?;
                if iter.index < iter.entries.len() {
                    let (key, value) = iter.entries[iter.index].clone();
                    iter.index += 1;
                    let key = Value::Str(GhostStr::tracked(&self.ctx.memory, key)?);
                    set_reg(frame, instr.a, key)?;
                    set_reg(frame, instr.b, value)?;
                    Ok(Step::Next)
                } else {
                    frame.iters.pop();
                    Ok(Step::Jump(instr.c as usize))
                }
            }

            // ---- closures ----
            OpCode::MakeClosure => {
                let index = instr.b as usize;
                if index >= frame.functions.len() {
                    return Err(invalid(format!("function index {index} out of range")));
                }
                let upvalues: Vec<Value> = (0..instr.c)
                    .map(|i| reg(frame, i))
                    .collect::<Result<_, _>>()?;
                let closure = Closure::tracked(
                    &self.ctx.memory,
                    Arc::clone(frame.functions),
                    index,
                    upvalues,
                )?;
                set_reg(frame, instr.a, Value::Closure(closure))?;
                Ok(Step::Next)
            }

            // ---- string intrinsics ----
            OpCode::StrLen => {
                let s = string_operand(frame, instr.b, "strlen")?;
                set_reg(frame, instr.a, Value::Number(s.len() as f64))?;
                Ok(Step::Next)
            }
            OpCode::SubStr => {
                let s = string_operand(frame, instr.b, "substr")?;
                let start = number_operand(frame, instr.c, instr.op)?;
                let count = number_operand(frame, instr.extra, instr.op)?;
                let text = substring(s.as_str(), start, count);
                set_reg(
                    frame,
                    instr.a,
                    Value::Str(GhostStr::tracked(&self.ctx.memory, text)?),
                )?;
                Ok(Step::Next)
            }
            OpCode::StrUpper | OpCode::StrLower => {
                let s = string_operand(frame, instr.b, instr.op.mnemonic())?;
                let text = if instr.op == OpCode::StrUpper {
                    s.as_str().to_uppercase()
                } else {
                    s.as_str().to_lowercase()
                };
                set_reg(
                    frame,
                    instr.a,
                    Value::Str(GhostStr::tracked(&self.ctx.memory, text)?),
                )?;
                Ok(Step::Next)
            }
            OpCode::StrFind => {
                let haystack = string_operand(frame, instr.b, "strfind")?;
                let needle = string_operand(frame, instr.c, "strfind")?;
                let value = match haystack.as_str().find(needle.as_str()) {
                    Some(byte_pos) => {
                        let char_pos = haystack.as_str()[..byte_pos].chars().count();
                        Value::Number((char_pos + 1) as f64)
                    }
                    None => Value::Nil,
                };
                set_reg(frame, instr.a, value)?;
                Ok(Step::Next)
            }

            // ---- modules ----
            OpCode::RequireModule => {
                let path = const_name(frame, instr.b, NameKind::Module)?;
                let value = self.require_module(&path)?;
                set_reg(frame, instr.a, value)?;
                Ok(Step::Next)
            }
        }
    }

    fn resolve_name(&self, frame: &Frame<'_>, name: &str) -> Option<Value> {
        if let Some((_, value)) = frame.locals.iter().rev().find(|(n, _)| n == name) {
            return Some(value.clone());
        }
        if let Some(value) = self.script_globals.get(name) {
            return Some(value.clone());
        }
        self.ctx
            .engine_globals
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Locals first, then an existing global, else a fresh engine global.
    fn store_name(&mut self, frame: &mut Frame<'_>, name: String, value: Value) {
        if let Some(slot) = frame.locals.iter_mut().rev().find(|(n, _)| *n == name) {
            slot.1 = value;
            return;
        }
        if let Some(existing) = self.script_globals.get_mut(&name) {
            *existing = value;
            return;
        }
        let mut globals = self
            .ctx
            .engine_globals
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        globals.insert(name, value);
    }

    /// `call_closure` dispatch: closures get a fresh frame, natives are
    /// invoked directly, anything else is not callable.
    fn dispatch_call(
        &mut self,
        frame: &mut Frame<'_>,
        callee: &Value,
        name: &str,
        arg_start: u16,
        argc: u16,
    ) -> Result<Value, ExecError> {
        let start = arg_start as usize;
        let end = start + argc as usize;
        if end > frame.registers.len() {
            return Err(invalid("argument window out of range"));
        }
        match callee {
            Value::Native(native) => {
                let args = &frame.registers[start..end];
                self.invoke_native(native, args)
            }
            Value::Closure(closure) => {
                let args: Vec<Value> = frame.registers[start..end].to_vec();
                self.budget.enter_call()?;
                let result = self.call_function(closure, &frame.locals, &args);
                self.budget.exit_call();
                result
            }
            _ => Err(ExecError::NotAFunction {
                name: name.to_string(),
            }),
        }
    }

    /// Execute a closure in a fresh frame sharing this run's budget.
    ///
    /// The caller's named locals are copied in, then parameters are seeded
    /// on top so they shadow anything of the same name. Missing arguments
    /// become nil; extras are ignored.
    fn call_function(
        &mut self,
        closure: &Closure,
        caller_locals: &[(String, Value)],
        args: &[Value],
    ) -> Result<Value, ExecError> {
        let info = closure
            .functions
            .get(closure.index)
            .ok_or_else(|| invalid(format!("function index {} out of range", closure.index)))?;

        let mut locals = caller_locals.to_vec();
        for (i, param) in info.params.iter().enumerate() {
            let value = args.get(i).cloned().unwrap_or(Value::Nil);
            locals.push((param.clone(), value));
        }
        if locals.len() > LOCAL_LIMIT {
            return Err(ExecError::StackOverflow {
                depth: locals.len(),
            });
        }

        let mut frame = Frame {
            code: &info.code,
            constants: &info.constants,
            lines: &info.lines,
            functions: &closure.functions,
            registers: vec![Value::Nil; REGISTER_COUNT],
            locals,
            iters: Vec::new(),
            function_name: Some(info.name.clone()),
        };
        self.run_frame(&mut frame)
    }

    fn invoke_native(&self, native: &NativeFunction, args: &[Value]) -> Result<Value, ExecError> {
        if let Some(hook) = &self.ctx.instrument {
            hook(&InstrumentEvent::NativeCall {
                name: native.name().to_string(),
            });
        }
        let ctx = NativeContext::new(Arc::clone(&self.ctx.memory), Arc::clone(&self.ctx.security));
        native.invoke(&ctx, args)
    }

    /// Minimal module stub: reading succeeds with `{content = ...}`, a
    /// missing file yields `{version = "1.0.0"}`, anything else nil. The
    /// read is behind the I/O gate.
    fn require_module(&self, path: &str) -> Result<Value, ExecError> {
        self.ctx.security.check_io_allowed()?;
        match std::fs::read(path) {
            Ok(bytes) => {
                let table = Table::tracked(&self.ctx.memory)?;
                let content = String::from_utf8_lossy(&bytes).into_owned();
                table.insert(
                    "content",
                    Value::Str(GhostStr::tracked(&self.ctx.memory, content)?),
                )?;
                Ok(Value::Table(table))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let table = Table::tracked(&self.ctx.memory)?;
                table.insert(
                    "version",
                    Value::Str(GhostStr::tracked(&self.ctx.memory, "1.0.0")?),
                )?;
                Ok(Value::Table(table))
            }
            Err(_) => Ok(Value::Nil),
        }
    }
}

// ---- operand helpers ----

enum NameKind {
    Global,
    Function,
    Module,
}

fn invalid(message: impl Into<String>) -> ExecError {
    ExecError::InvalidSyntax {
        message: message.into(),
    }
}

fn reg(frame: &Frame<'_>, index: u16) -> Result<Value, ExecError> {
    frame
        .registers
        .get(index as usize)
        .cloned()
        .ok_or_else(|| invalid(format!("register r{index} out of range")))
}

fn set_reg(frame: &mut Frame<'_>, index: u16, value: Value) -> Result<(), ExecError> {
    match frame.registers.get_mut(index as usize) {
        Some(slot) => {
            *slot = value;
            Ok(())
        }
        None => Err(invalid(format!("register r{index} out of range"))),
    }
}

fn const_value(frame: &Frame<'_>, index: u16) -> Result<Value, ExecError> {
    frame
        .constants
        .get(index as usize)
        .cloned()
        .ok_or_else(|| invalid(format!("constant k{index} out of range")))
}

fn const_name(frame: &Frame<'_>, index: u16, kind: NameKind) -> Result<String, ExecError> {
    match frame.constants.get(index as usize) {
        Some(Value::Str(s)) => Ok(s.as_str().to_string()),
        _ => Err(match kind {
            NameKind::Global => ExecError::InvalidGlobalName {
                index: index as usize,
            },
            NameKind::Function => ExecError::InvalidFunctionName {
                index: index as usize,
            },
            NameKind::Module => ExecError::InvalidModuleName {
                index: index as usize,
            },
        }),
    }
}

fn number_operand(frame: &Frame<'_>, index: u16, op: OpCode) -> Result<f64, ExecError> {
    let value = reg(frame, index)?;
    value.as_number().ok_or_else(|| {
        ExecError::type_error(format!(
            "{} expects numbers, got {}",
            op.mnemonic(),
            value.type_name()
        ))
    })
}

fn string_operand(
    frame: &Frame<'_>,
    index: u16,
    what: &str,
) -> Result<Arc<GhostStr>, ExecError> {
    match reg(frame, index)? {
        Value::Str(s) => Ok(s),
        other => Err(ExecError::type_error(format!(
            "{what} expects a string, got {}",
            other.type_name()
        ))),
    }
}

/// Strings and numbers concatenate; numbers format the way they print.
fn stringlike<'v>(value: &'v Value, op: &str) -> Result<Cow<'v, str>, ExecError> {
    match value {
        Value::Str(s) => Ok(Cow::Borrowed(s.as_str())),
        Value::Number(_) => Ok(Cow::Owned(value.to_string())),
        other => Err(ExecError::type_error(format!(
            "{op} expects strings, got {}",
            other.type_name()
        ))),
    }
}

fn indexed_get(container: &Value, index: &Value) -> Result<Value, ExecError> {
    match (container, index) {
        (Value::Array(arr), Value::Number(n)) => {
            if *n < 0.0 {
                Ok(Value::Nil)
            } else {
                Ok(arr.get(*n as usize).unwrap_or(Value::Nil))
            }
        }
        (Value::Array(_), other) => Err(ExecError::type_error(format!(
            "array index must be a number, got {}",
            other.type_name()
        ))),
        (Value::Table(t), Value::Str(k)) => Ok(t.get(k.as_str()).unwrap_or(Value::Nil)),
        (Value::Table(_), other) => Err(ExecError::type_error(format!(
            "table keys must be strings, got {}",
            other.type_name()
        ))),
        (other, _) => Err(ExecError::type_error(format!(
            "cannot index {}",
            other.type_name()
        ))),
    }
}

fn indexed_set(container: &Value, index: &Value, value: Value) -> Result<(), ExecError> {
    match (container, index) {
        (Value::Array(arr), Value::Number(n)) => {
            // Negative and far-out-of-range writes are dropped to keep the
            // array dense.
            if *n >= 0.0 {
                arr.set(*n as usize, value)?;
            }
            Ok(())
        }
        (Value::Array(_), other) => Err(ExecError::type_error(format!(
            "array index must be a number, got {}",
            other.type_name()
        ))),
        (Value::Table(t), Value::Str(k)) => t.insert(k.as_str(), value),
        (Value::Table(_), other) => Err(ExecError::type_error(format!(
            "table keys must be strings, got {}",
            other.type_name()
        ))),
        (other, _) => Err(ExecError::type_error(format!(
            "cannot index {}",
            other.type_name()
        ))),
    }
}

/// 1-based character slice, clamped at both ends.
fn substring(s: &str, start: f64, count: f64) -> String {
    if count <= 0.0 {
        return String::new();
    }
    let skip = if start <= 1.0 { 0 } else { (start - 1.0) as usize };
    s.chars().skip(skip).take(count as usize).collect()
}

fn callee_name(value: &Value) -> String {
    match value {
        Value::Closure(c) => c.name().to_string(),
        Value::Native(n) => n.name().to_string(),
        other => other.type_name().to_string(),
    }
}

fn wrap_error(err: ExecError, frame: &Frame<'_>, pc: usize) -> ExecError {
    let pos = frame.lines.get(pc).copied().unwrap_or_default();
    let function = frame
        .function_name
        .clone()
        .unwrap_or_else(|| "<script>".to_string());
    match err {
        ExecError::Runtime {
            kind,
            context,
            mut frames,
        } => {
            frames.push(FrameInfo {
                function,
                line: pos.line,
            });
            ExecError::Runtime {
                kind,
                context,
                frames,
            }
        }
        kind => ExecError::Runtime {
            kind: Box::new(kind),
            context: ErrorContext {
                line: pos.line,
                column: pos.column,
                instruction_pointer: pc,
                function_name: frame.function_name.clone(),
            },
            frames: vec![FrameInfo {
                function,
                line: pos.line,
            }],
        },
    }
}
