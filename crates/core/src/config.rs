//! Engine creation parameters
//!
//! A [`EngineConfig`] is plain data handed to the engine once at creation;
//! the limits and capability flags it carries are immutable afterwards.

use std::path::PathBuf;

/// Limits and capabilities for one engine instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Hard cap on bytes the engine's values may hold at once.
    pub memory_limit_bytes: usize,
    /// Wall-clock deadline for a single `run`/`call`, in milliseconds.
    pub execution_timeout_ms: u64,
    /// Maximum VM instructions per `run`/`call`, nested calls included.
    pub instruction_limit: u64,
    /// Whether native functions may touch files, stdout, or the network.
    pub allow_io: bool,
    /// Whether native functions may issue syscalls beyond plain I/O.
    pub allow_syscalls: bool,
    /// When set, natives must refuse non-deterministic results (time,
    /// randomness, environment).
    pub deterministic: bool,
    /// Path prefixes readable by natives that consult the security context.
    /// Empty means the `allow_io` gate is the only check.
    pub read_whitelist: Vec<PathBuf>,
    /// Path prefixes writable by natives that consult the security context.
    pub write_whitelist: Vec<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            memory_limit_bytes: 16 * 1024 * 1024,
            execution_timeout_ms: 5_000,
            instruction_limit: 10_000_000,
            allow_io: false,
            allow_syscalls: false,
            deterministic: false,
            read_whitelist: Vec::new(),
            write_whitelist: Vec::new(),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit_bytes = bytes;
        self
    }

    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.execution_timeout_ms = ms;
        self
    }

    pub fn with_instruction_limit(mut self, limit: u64) -> Self {
        self.instruction_limit = limit;
        self
    }

    pub fn with_io(mut self, allowed: bool) -> Self {
        self.allow_io = allowed;
        self
    }

    pub fn with_syscalls(mut self, allowed: bool) -> Self {
        self.allow_syscalls = allowed;
        self
    }

    pub fn with_deterministic(mut self, deterministic: bool) -> Self {
        self.deterministic = deterministic;
        self
    }

    pub fn with_read_path(mut self, prefix: impl Into<PathBuf>) -> Self {
        self.read_whitelist.push(prefix.into());
        self
    }

    pub fn with_write_path(mut self, prefix: impl Into<PathBuf>) -> Self {
        self.write_whitelist.push(prefix.into());
        self
    }
}
