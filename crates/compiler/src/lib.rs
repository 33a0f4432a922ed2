//! Ghostlang Compiler
//!
//! Turns Ghostlang source into register bytecode in a single pass: the
//! recursive-descent parser emits instructions as it recognizes each
//! construct, back-patching jump targets once they are known. There is no
//! AST and no type checking; every runtime question (scope resolution,
//! operand types) is deferred to the VM.
//!
//! ```rust
//! use ghostlang_compiler::compile;
//!
//! let chunk = compile("var x = 2\nx * 21").unwrap();
//! assert!(!chunk.code.is_empty());
//! ```

pub mod compile;
pub mod disassemble;
pub mod lexer;

pub use self::compile::compile;
pub use self::disassemble::disassemble;
pub use self::lexer::{Token, TokenKind, tokenize};
