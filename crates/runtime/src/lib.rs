//! Ghostlang Runtime
//!
//! The sandboxed execution half of the engine: a register-based bytecode
//! VM with wall-clock and instruction ceilings, the Lua-style pattern
//! engine behind the string natives, and the [`Engine`] facade hosts embed.
//!
//! A host typically does four things:
//!
//! ```rust
//! use ghostlang_runtime::{Engine, stdlib};
//! use ghostlang_core::{EngineConfig, Value};
//!
//! let engine = Engine::new(EngineConfig::default());
//! stdlib::install(&engine);
//! engine.register_function("answer", |_ctx, _args| Ok(Value::Number(42.0)));
//! assert_eq!(engine.eval("answer() / 2").unwrap(), Value::Number(21.0));
//! ```
//!
//! # Modules
//!
//! - `engine`: the embedding facade ([`Engine`], [`Script`])
//! - `vm`: the dispatch loop (crate-internal)
//! - `pattern`: Lua-style pattern compile + backtracking matcher
//! - `stdlib`: the built-in native function set

pub mod engine;
pub mod pattern;
pub mod stdlib;
mod vm;

pub use engine::{Engine, InstrumentEvent, InstrumentFn, Script, ScriptState};
pub use pattern::{MatchResult, Pattern};

// Re-exported so embedders need only this crate for the common path.
pub use ghostlang_core::{
    EngineConfig, EngineError, ErrorContext, ExecError, FrameInfo, NativeContext, NativeFunction,
    ParseError, PatternError, Value,
};
