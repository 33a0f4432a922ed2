//! Capability gates for native functions
//!
//! The VM itself performs no I/O. These queries exist so native functions
//! registered by the host can consult the sandbox policy before acting on
//! the guest's behalf. The context is built once from the engine config and
//! never changes afterwards.

use crate::config::EngineConfig;
use crate::error::ExecError;
use std::path::{Path, PathBuf};

/// Immutable sandbox policy shared by the engine and its natives.
#[derive(Debug, Clone)]
pub struct SecurityContext {
    allow_io: bool,
    allow_syscalls: bool,
    deterministic: bool,
    read_whitelist: Vec<PathBuf>,
    write_whitelist: Vec<PathBuf>,
}

impl SecurityContext {
    pub fn from_config(config: &EngineConfig) -> Self {
        SecurityContext {
            allow_io: config.allow_io,
            allow_syscalls: config.allow_syscalls,
            deterministic: config.deterministic,
            read_whitelist: config.read_whitelist.clone(),
            write_whitelist: config.write_whitelist.clone(),
        }
    }

    /// Ok iff the sandbox permits I/O.
    pub fn check_io_allowed(&self) -> Result<(), ExecError> {
        if self.allow_io {
            Ok(())
        } else {
            Err(ExecError::IoNotAllowed)
        }
    }

    /// Ok iff the sandbox permits syscalls.
    pub fn check_syscall_allowed(&self) -> Result<(), ExecError> {
        if self.allow_syscalls {
            Ok(())
        } else {
            Err(ExecError::SyscallNotAllowed)
        }
    }

    /// Ok iff the sandbox permits non-deterministic results.
    pub fn check_non_deterministic_allowed(&self) -> Result<(), ExecError> {
        if self.deterministic {
            Err(ExecError::SecurityViolation {
                message: "non-deterministic operation in deterministic mode".to_string(),
            })
        } else {
            Ok(())
        }
    }

    /// Whether natives may read `path`.
    ///
    /// An empty whitelist does not restrict paths; the `allow_io` gate is
    /// then the only check.
    pub fn can_read(&self, path: impl AsRef<Path>) -> bool {
        self.allow_io && Self::matches(&self.read_whitelist, path.as_ref())
    }

    /// Whether natives may write `path`.
    pub fn can_write(&self, path: impl AsRef<Path>) -> bool {
        self.allow_io && Self::matches(&self.write_whitelist, path.as_ref())
    }

    fn matches(whitelist: &[PathBuf], path: &Path) -> bool {
        whitelist.is_empty() || whitelist.iter().any(|prefix| path.starts_with(prefix))
    }
}
