//! Error taxonomy for the engine
//!
//! Three families cross the host boundary:
//!
//! - [`ParseError`]: the compiler rejected the source (line/column/message)
//! - [`ExecError`]: anything the VM or a native function can fail with
//! - [`PatternError`]: a malformed string pattern
//!
//! The VM performs no internal catch: every runtime failure propagates
//! eagerly to the `run`/`call` boundary, wrapped once with an
//! [`ErrorContext`] and a frame list so the host can render a trace.

use thiserror::Error;

/// Source position and dispatch state captured at the failing instruction.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ErrorContext {
    /// 1-indexed source line.
    pub line: u32,
    /// 1-indexed source column.
    pub column: u32,
    /// Offset of the failing instruction in its code stream.
    pub instruction_pointer: usize,
    /// Name of the enclosing function, if not the top-level script.
    pub function_name: Option<String>,
}

/// One call-stack entry of a runtime trace, innermost first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameInfo {
    /// Function name, or `"<script>"` for the root stream.
    pub function: String,
    /// 1-indexed source line of the active instruction in that frame.
    pub line: u32,
}

/// Compiler rejection with the position of the offending token.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("parse error at line {line}, column {column}: {message}")]
pub struct ParseError {
    /// 1-indexed line.
    pub line: u32,
    /// 1-indexed column.
    pub column: u32,
    pub message: String,
}

impl ParseError {
    pub fn new(line: u32, column: u32, message: impl Into<String>) -> Self {
        ParseError {
            line,
            column,
            message: message.into(),
        }
    }
}

/// Malformed string pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PatternError {
    #[error("malformed pattern: missing ']'")]
    UnclosedSet,
    #[error("malformed pattern: unbalanced capture parentheses")]
    UnbalancedCapture,
    #[error("malformed pattern: '%' at end of pattern")]
    DanglingEscape,
    #[error("malformed pattern: too many captures")]
    TooManyCaptures,
    #[error("pattern too long")]
    TooLong,
    #[error("invalid capture index in replacement")]
    InvalidCaptureIndex,
}

/// Everything the VM, the engine facade, or a native function can fail with.
///
/// The [`ExecError::Runtime`] variant is the trace wrapper: the dispatch
/// loop wraps the underlying kind exactly once at the failing frame, and
/// outer frames append themselves to `frames` on the way out. Use
/// [`ExecError::root`] to match on the kind regardless of wrapping.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExecError {
    #[error("type error: {message}")]
    Type { message: String },

    #[error("undefined variable '{name}'")]
    UndefinedVariable { name: String },

    #[error("function '{name}' not found")]
    FunctionNotFound { name: String },

    #[error("'{name}' is not a function")]
    NotAFunction { name: String },

    #[error(
        "memory limit exceeded: requested {requested} bytes with {used} of {limit} in use"
    )]
    MemoryLimitExceeded {
        requested: usize,
        used: usize,
        limit: usize,
    },

    #[error("execution timeout after {limit_ms} ms")]
    ExecutionTimeout { limit_ms: u64 },

    #[error("instruction limit of {limit} exceeded")]
    InstructionLimitExceeded { limit: u64 },

    #[error("I/O is not allowed in this sandbox")]
    IoNotAllowed,

    #[error("syscalls are not allowed in this sandbox")]
    SyscallNotAllowed,

    #[error("security violation: {message}")]
    SecurityViolation { message: String },

    #[error("stack overflow at depth {depth}")]
    StackOverflow { depth: usize },

    #[error("invalid syntax in compiled program: {message}")]
    InvalidSyntax { message: String },

    #[error("constant {index} is not a valid function name")]
    InvalidFunctionName { index: usize },

    #[error("constant {index} is not a valid global name")]
    InvalidGlobalName { index: usize },

    #[error("constant {index} is not a valid module name")]
    InvalidModuleName { index: usize },

    #[error("host allocator failure")]
    OutOfMemory,

    #[error(transparent)]
    Pattern(#[from] PatternError),

    #[error("{kind}")]
    Runtime {
        kind: Box<ExecError>,
        context: ErrorContext,
        frames: Vec<FrameInfo>,
    },
}

impl ExecError {
    /// Convenience constructor for operand type mismatches.
    pub fn type_error(message: impl Into<String>) -> Self {
        ExecError::Type {
            message: message.into(),
        }
    }

    /// The underlying kind, unwrapping the trace wrapper if present.
    pub fn root(&self) -> &ExecError {
        match self {
            ExecError::Runtime { kind, .. } => kind.root(),
            other => other,
        }
    }

    /// The captured context, if this error was wrapped by the VM.
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            ExecError::Runtime { context, .. } => Some(context),
            _ => None,
        }
    }

    /// The call-frame trace, innermost first. Empty when unwrapped.
    pub fn frames(&self) -> &[FrameInfo] {
        match self {
            ExecError::Runtime { frames, .. } => frames,
            _ => &[],
        }
    }
}

/// Either side of the load-then-run boundary, for `Engine::eval`.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Exec(#[from] ExecError),
}
