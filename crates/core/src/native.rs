//! Host function boundary
//!
//! Native functions are host-supplied callables registered into engine
//! globals. They receive a read-only argument window borrowed from the
//! caller's registers plus a [`NativeContext`] handle, which is how a native
//! allocates through the engine's accounted memory and consults the
//! sandbox policy before doing anything restricted.
//!
//! Returning a heap-bearing value transfers the handle to the VM; sharing
//! an argument back out is just another handle clone.

use crate::error::ExecError;
use crate::memory::MemoryTracker;
use crate::security::SecurityContext;
use crate::value::{Array, GhostStr, Table, Value};
use std::fmt;
use std::sync::Arc;

/// What a native function returns.
pub type NativeResult = Result<Value, ExecError>;

/// Engine services available to a native during a call.
///
/// The handle is only valid for the duration of the call; natives must not
/// stash it.
#[derive(Clone)]
pub struct NativeContext {
    memory: Arc<MemoryTracker>,
    security: Arc<SecurityContext>,
}

impl NativeContext {
    pub fn new(memory: Arc<MemoryTracker>, security: Arc<SecurityContext>) -> Self {
        NativeContext { memory, security }
    }

    /// Sandbox policy for capability checks.
    pub fn security(&self) -> &SecurityContext {
        &self.security
    }

    /// The engine's memory gauge.
    pub fn memory(&self) -> &Arc<MemoryTracker> {
        &self.memory
    }

    /// Build a string accounted against the engine.
    pub fn new_string(&self, text: impl Into<String>) -> NativeResult {
        Ok(Value::Str(GhostStr::tracked(&self.memory, text)?))
    }

    /// Build an empty accounted table.
    pub fn new_table(&self) -> NativeResult {
        Ok(Value::Table(Table::tracked(&self.memory)?))
    }

    /// Build an empty accounted array.
    pub fn new_array(&self) -> NativeResult {
        Ok(Value::Array(Array::tracked(&self.memory)?))
    }
}

type NativeFnInner = dyn Fn(&NativeContext, &[Value]) -> NativeResult + Send + Sync;

/// A registered host callable.
#[derive(Clone)]
pub struct NativeFunction {
    name: Arc<str>,
    func: Arc<NativeFnInner>,
}

impl NativeFunction {
    pub fn new(
        name: impl Into<String>,
        func: impl Fn(&NativeContext, &[Value]) -> NativeResult + Send + Sync + 'static,
    ) -> Self {
        NativeFunction {
            name: name.into().into(),
            func: Arc::new(func),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn invoke(&self, ctx: &NativeContext, args: &[Value]) -> NativeResult {
        (self.func)(ctx, args)
    }
}

impl fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NativeFunction({})", self.name)
    }
}

impl PartialEq for NativeFunction {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.func, &other.func)
    }
}
