//! Embedding facade
//!
//! An [`Engine`] owns the accounted memory tracker, the sandbox policy,
//! and the engine-wide globals map. Hosts load scripts, register native
//! functions, and call entry points through it.
//!
//! Globals are deliberately engine-wide: two scripts loaded by the same
//! engine observe each other's `var` writes, which is what lets an
//! embedder compose modules out of several scripts. Hosts that want
//! isolation create one engine per trust domain. A [`Script`] additionally
//! carries its own script-local globals map, which `Script::set_global`
//! writes, so per-script seeding never leaks across scripts.
//!
//! ```rust
//! use ghostlang_runtime::Engine;
//! use ghostlang_core::{EngineConfig, Value};
//!
//! let engine = Engine::new(EngineConfig::default());
//! let result = engine.eval("3 + 4").unwrap();
//! assert_eq!(result, Value::Number(7.0));
//! ```

use crate::vm::{RunBudget, Vm, VmContext};
use ghostlang_core::bytecode::CompiledChunk;
use ghostlang_core::value::Table;
use ghostlang_core::{
    EngineConfig, EngineError, ExecError, MemoryTracker, NativeContext, NativeFunction,
    NativeResult, ParseError, SecurityContext, Value,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tracing::debug;

/// Callback type for engine instrumentation.
pub type InstrumentFn = Arc<dyn Fn(&InstrumentEvent) + Send + Sync>;

/// What an instrumented engine reports.
#[derive(Debug, Clone)]
pub enum InstrumentEvent {
    RunStarted,
    RunFinished {
        instructions: u64,
        duration: Duration,
    },
    NativeCall {
        name: String,
    },
}

struct EngineInner {
    config: EngineConfig,
    memory: Arc<MemoryTracker>,
    security: Arc<SecurityContext>,
    globals: Arc<RwLock<HashMap<String, Value>>>,
    instrument: RwLock<Option<InstrumentFn>>,
}

/// A sandboxed scripting engine instance.
///
/// Cheap to clone (shared handle). Single-threaded by contract: hosts
/// must serialize `run`/`call` into one engine, though the memory gauge
/// may be read from anywhere.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        let memory = Arc::new(MemoryTracker::new(config.memory_limit_bytes));
        let security = Arc::new(SecurityContext::from_config(&config));
        Engine {
            inner: Arc::new(EngineInner {
                config,
                memory,
                security,
                globals: Arc::new(RwLock::new(HashMap::new())),
                instrument: RwLock::new(None),
            }),
        }
    }

    /// Compile `source` into a runnable [`Script`].
    pub fn load_script(&self, source: &str) -> Result<Script, ParseError> {
        let chunk = ghostlang_compiler::compile(source)?;
        debug!(
            source_bytes = source.len(),
            instructions = chunk.code.len(),
            functions = chunk.functions.len(),
            "script loaded"
        );
        Ok(Script::new(self.clone(), chunk))
    }

    /// Like [`Self::load_script`] for hosts holding raw bytes.
    pub fn load_script_bytes(&self, source: &[u8]) -> Result<Script, ParseError> {
        let source = std::str::from_utf8(source)
            .map_err(|_| ParseError::new(1, 1, "source is not valid UTF-8"))?;
        self.load_script(source)
    }

    /// Load and run in one step.
    pub fn eval(&self, source: &str) -> Result<Value, EngineError> {
        let script = self.load_script(source)?;
        Ok(script.run()?)
    }

    /// Register a host function under `name` in the engine globals.
    pub fn register_function(
        &self,
        name: &str,
        func: impl Fn(&NativeContext, &[Value]) -> NativeResult + Send + Sync + 'static,
    ) {
        self.register_native(NativeFunction::new(name, func));
    }

    /// Register an already-built [`NativeFunction`] under its own name.
    pub fn register_native(&self, func: NativeFunction) {
        let name = func.name().to_string();
        self.globals_mut().insert(name, Value::Native(func));
    }

    /// Register a family of natives under `prefix`.
    ///
    /// Each function lands twice: as the flat global `prefix.name` (so
    /// hosts can `call` it by qualified name) and as a member of a table
    /// stored under `prefix` (so guest code can write `prefix.name(...)`).
    pub fn register_module(
        &self,
        prefix: &str,
        functions: impl IntoIterator<Item = NativeFunction>,
    ) {
        let table = Table::untracked();
        let mut globals = self.globals_mut();
        for func in functions {
            let name = func.name().to_string();
            let value = Value::Native(func);
            // Untracked tables never refuse an insert.
            let _ = table.insert(&name, value.clone());
            globals.insert(format!("{prefix}.{name}"), value);
        }
        globals.insert(prefix.to_string(), Value::Table(table));
    }

    /// Call a registered function or a guest-defined closure by name.
    ///
    /// The deadline and instruction budget start now.
    pub fn call(&self, name: &str, args: &[Value]) -> Result<Value, ExecError> {
        let callee = self
            .global(name)
            .ok_or_else(|| ExecError::FunctionNotFound {
                name: name.to_string(),
            })?;
        match callee {
            Value::Native(native) => {
                self.emit_event(&InstrumentEvent::NativeCall {
                    name: native.name().to_string(),
                });
                let ctx = NativeContext::new(
                    Arc::clone(&self.inner.memory),
                    Arc::clone(&self.inner.security),
                );
                native.invoke(&ctx, args)
            }
            Value::Closure(closure) => {
                let budget = RunBudget::new(
                    self.inner.config.execution_timeout_ms,
                    self.inner.config.instruction_limit,
                );
                let ctx = self.vm_context();
                let mut script_globals = HashMap::new();
                let mut vm = Vm::new(&ctx, budget, &mut script_globals);
                vm.call_closure_value(&closure, args)
            }
            _ => Err(ExecError::NotAFunction {
                name: name.to_string(),
            }),
        }
    }

    /// Read an engine-wide global.
    pub fn global(&self, name: &str) -> Option<Value> {
        self.inner
            .globals
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Write an engine-wide global.
    pub fn set_global(&self, name: &str, value: Value) {
        self.globals_mut().insert(name.to_string(), value);
    }

    /// Install the instrumentation callback.
    pub fn set_instrument(&self, hook: impl Fn(&InstrumentEvent) + Send + Sync + 'static) {
        *self
            .inner
            .instrument
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(hook));
    }

    pub fn clear_instrument(&self) {
        *self
            .inner
            .instrument
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// The engine's memory gauge, readable from any thread.
    pub fn memory(&self) -> &Arc<MemoryTracker> {
        &self.inner.memory
    }

    /// The sandbox policy.
    pub fn security(&self) -> &Arc<SecurityContext> {
        &self.inner.security
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    fn globals_mut(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Value>> {
        self.inner
            .globals
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn emit_event(&self, event: &InstrumentEvent) {
        let hook = self
            .inner
            .instrument
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(hook) = hook {
            hook(event);
        }
    }

    pub(crate) fn vm_context(&self) -> VmContext {
        VmContext {
            memory: Arc::clone(&self.inner.memory),
            security: Arc::clone(&self.inner.security),
            engine_globals: Arc::clone(&self.inner.globals),
            instrument: self
                .inner
                .instrument
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }
}

impl Default for Engine {
    fn default() -> Self {
        Engine::new(EngineConfig::default())
    }
}

/// Lifecycle of a loaded script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptState {
    Loaded,
    Running,
    Completed,
    Failed,
}

/// A compiled script bound to its engine.
///
/// Re-running is permitted and resets the program counter and instruction
/// budget while preserving globals written by earlier runs. After a failed
/// run the VM state is considered poisoned: the script will still accept
/// another `run`, but hosts should prefer dropping it once they have
/// inspected its globals.
pub struct Script {
    engine: Engine,
    chunk: CompiledChunk,
    globals: Mutex<HashMap<String, Value>>,
    state: Mutex<ScriptState>,
}

impl Script {
    fn new(engine: Engine, chunk: CompiledChunk) -> Self {
        Script {
            engine,
            chunk,
            globals: Mutex::new(HashMap::new()),
            state: Mutex::new(ScriptState::Loaded),
        }
    }

    /// Execute the script under the engine's limits.
    pub fn run(&self) -> Result<Value, ExecError> {
        self.set_state(ScriptState::Running);
        self.engine.emit_event(&InstrumentEvent::RunStarted);

        let budget = RunBudget::new(
            self.engine.inner.config.execution_timeout_ms,
            self.engine.inner.config.instruction_limit,
        );
        let ctx = self.engine.vm_context();
        let result = {
            let mut globals = self
                .globals
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let mut vm = Vm::new(&ctx, Arc::clone(&budget), &mut globals);
            vm.run_chunk(&self.chunk)
        };

        let instructions = budget.instructions_executed();
        let duration = budget.elapsed();
        match &result {
            Ok(_) => {
                self.set_state(ScriptState::Completed);
                debug!(instructions, ?duration, "script completed");
            }
            Err(err) => {
                self.set_state(ScriptState::Failed);
                debug!(instructions, ?duration, error = %err, "script failed");
            }
        }
        self.engine.emit_event(&InstrumentEvent::RunFinished {
            instructions,
            duration,
        });
        result
    }

    pub fn state(&self) -> ScriptState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Script-local global first, then the engine-wide map.
    pub fn get_global(&self, name: &str) -> Option<Value> {
        let local = self
            .globals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned();
        local.or_else(|| self.engine.global(name))
    }

    /// Seed a script-local global; never visible to other scripts.
    pub fn set_global(&self, name: &str, value: Value) {
        self.globals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), value);
    }

    /// The compiled form, e.g. for disassembly.
    pub fn chunk(&self) -> &CompiledChunk {
        &self.chunk
    }

    fn set_state(&self, state: ScriptState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ghostlang_core::ExecError;

    #[test]
    fn test_eval_arithmetic() {
        let engine = Engine::default();
        assert_eq!(engine.eval("3 + 4").unwrap(), Value::Number(7.0));
        // Idempotent on a fresh engine every time.
        assert_eq!(engine.eval("3 + 4").unwrap(), Value::Number(7.0));
    }

    #[test]
    fn test_register_function_callable_from_guest() {
        let engine = Engine::default();
        engine.register_function("double", |_ctx, args| {
            let n = args.first().and_then(Value::as_number).unwrap_or(0.0);
            Ok(Value::Number(n * 2.0))
        });
        assert_eq!(engine.eval("double(21)").unwrap(), Value::Number(42.0));
    }

    #[test]
    fn test_register_module_surface_and_host_paths() {
        let engine = Engine::default();
        engine.register_module(
            "math2",
            [NativeFunction::new("triple", |_ctx, args: &[Value]| {
                let n = args.first().and_then(Value::as_number).unwrap_or(0.0);
                Ok(Value::Number(n * 3.0))
            })],
        );
        // Guest syntax goes through the module table.
        assert_eq!(engine.eval("math2.triple(3)").unwrap(), Value::Number(9.0));
        // Hosts can call the flat qualified name.
        assert_eq!(
            engine.call("math2.triple", &[Value::Number(4.0)]).unwrap(),
            Value::Number(12.0)
        );
    }

    #[test]
    fn test_call_missing_name_is_function_not_found() {
        let engine = Engine::default();
        let err = engine.call("nope", &[]).unwrap_err();
        assert_eq!(
            err.root(),
            &ExecError::FunctionNotFound {
                name: "nope".to_string()
            }
        );
    }

    #[test]
    fn test_call_non_callable_is_not_a_function() {
        let engine = Engine::default();
        engine.set_global("answer", Value::Number(42.0));
        let err = engine.call("answer", &[]).unwrap_err();
        assert!(matches!(err.root(), ExecError::NotAFunction { .. }));
    }

    #[test]
    fn test_script_state_transitions() {
        let engine = Engine::default();
        let script = engine.load_script("1 + 1").unwrap();
        assert_eq!(script.state(), ScriptState::Loaded);
        script.run().unwrap();
        assert_eq!(script.state(), ScriptState::Completed);

        let bad = engine.load_script("missing_fn()").unwrap();
        assert!(bad.run().is_err());
        assert_eq!(bad.state(), ScriptState::Failed);
    }

    #[test]
    fn test_rerun_preserves_globals() {
        let engine = Engine::default();
        let script = engine
            .load_script("var total = counter + 1\ncounter = total\ntotal")
            .unwrap();
        engine.set_global("counter", Value::Number(0.0));
        assert_eq!(script.run().unwrap(), Value::Number(1.0));
        assert_eq!(script.run().unwrap(), Value::Number(2.0));
    }

    #[test]
    fn test_script_local_globals_do_not_leak() {
        let engine = Engine::default();
        let a = engine.load_script("seed").unwrap();
        a.set_global("seed", Value::Number(5.0));
        assert_eq!(a.run().unwrap(), Value::Number(5.0));
        // Another script in the same engine does not see the seed.
        let b = engine.load_script("seed").unwrap();
        assert!(b.run().is_err());
    }

    #[test]
    fn test_engine_wide_globals_are_shared_between_scripts() {
        let engine = Engine::default();
        engine.eval("var shared = 11").unwrap();
        assert_eq!(engine.eval("shared + 1").unwrap(), Value::Number(12.0));
    }

    #[test]
    fn test_instrument_sees_native_calls() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let engine = Engine::default();
        engine.register_function("noop", |_ctx, _args| Ok(Value::Nil));
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        engine.set_instrument(move |event| {
            if matches!(event, InstrumentEvent::NativeCall { .. }) {
                seen.fetch_add(1, Ordering::Relaxed);
            }
        });
        engine.eval("noop()").unwrap();
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_load_script_bytes_rejects_invalid_utf8() {
        let engine = Engine::default();
        assert!(engine.load_script_bytes(&[0xff, 0xfe, 0x00]).is_err());
    }
}
