//! End-to-end scenarios through the public embedding API: load, run,
//! host calls, and every sandbox limit.

use ghostlang_core::{EngineConfig, ExecError, Value};
use ghostlang_runtime::{Engine, stdlib};
use std::time::Instant;

fn engine() -> Engine {
    Engine::new(EngineConfig::default())
}

#[test]
fn test_arithmetic_precedence() {
    let result = engine().eval("3 + 4 * 5 - 6 / 2").unwrap();
    assert_eq!(result, Value::Number(20.0));
}

#[test]
fn test_arithmetic_mutates_no_globals() {
    let engine = engine();
    engine.eval("3 + 4 * 5 - 6 / 2").unwrap();
    assert!(engine.global("x").is_none());
}

#[test]
fn test_local_plus_global_visibility() {
    let engine = engine();
    let script = engine.load_script("local x = 10\nvar y = 20\nx + y").unwrap();
    assert_eq!(script.run().unwrap(), Value::Number(30.0));
    // `var` created an engine global; `local` stayed invisible.
    assert_eq!(engine.global("y"), Some(Value::Number(20.0)));
    assert!(engine.global("x").is_none());
}

#[test]
fn test_while_loop_hits_deadline() {
    let engine = Engine::new(EngineConfig::default().with_timeout_ms(10));
    let script = engine
        .load_script("var i = 0\nwhile (i < 1000000) { i = i + 1 }")
        .unwrap();
    let started = Instant::now();
    let err = script.run().unwrap_err();
    let elapsed = started.elapsed();

    assert_eq!(err.root(), &ExecError::ExecutionTimeout { limit_ms: 10 });
    // The loop was cut short mid-flight and the partial count is visible.
    match engine.global("i") {
        Some(Value::Number(i)) => assert!(i < 1_000_000.0),
        other => panic!("expected a partial counter, got {other:?}"),
    }
    // Deadline is checked before every dispatch, so overshoot is tiny.
    assert!(elapsed.as_millis() < 100, "took {elapsed:?}");
}

#[test]
fn test_infinite_loop_bounded_by_deadline() {
    let engine = Engine::new(EngineConfig::default().with_timeout_ms(50));
    let err = engine.eval("while (true) { }").unwrap_err();
    let exec = match err {
        ghostlang_core::EngineError::Exec(exec) => exec,
        other => panic!("expected exec error, got {other:?}"),
    };
    assert_eq!(exec.root(), &ExecError::ExecutionTimeout { limit_ms: 50 });
}

#[test]
fn test_infinite_loop_bounded_by_instruction_limit() {
    let engine = Engine::new(
        EngineConfig::default()
            .with_timeout_ms(10_000)
            .with_instruction_limit(1_000),
    );
    let script = engine.load_script("while (true) { }").unwrap();
    let err = script.run().unwrap_err();
    assert_eq!(
        err.root(),
        &ExecError::InstructionLimitExceeded { limit: 1_000 }
    );
}

#[test]
fn test_function_definition_and_host_call() {
    let engine = engine();
    let script = engine
        .load_script("function add(a, b)\n  return a + b\nend\nadd(2, 3)")
        .unwrap();
    assert_eq!(script.run().unwrap(), Value::Number(5.0));

    // The defined closure is an engine global, callable from the host.
    let result = engine
        .call("add", &[Value::Number(7.0), Value::Number(8.0)])
        .unwrap();
    assert_eq!(result, Value::Number(15.0));
}

#[test]
fn test_memory_cap_stops_string_growth() {
    let engine = Engine::new(EngineConfig::default().with_memory_limit(1024));
    let chunk100 = "x".repeat(100);
    let source = format!("var s = \"{chunk100}\"\nwhile (true) do s = s .. s end");
    let script = engine.load_script(&source).unwrap();
    let err = script.run().unwrap_err();
    assert!(matches!(err.root(), ExecError::MemoryLimitExceeded { .. }));
    // The gauge never passed the cap, and the refused charge left it alone.
    assert!(engine.memory().bytes_in_use() <= 1024);
    assert!(engine.memory().peak_bytes() <= 1024);
}

#[test]
fn test_pattern_capture_through_native() {
    let engine = engine();
    stdlib::install(&engine);
    let result = engine
        .call(
            "stringGsub",
            &[
                Value::string("hello world"),
                Value::string("(%w+) (%w+)"),
                Value::string("%2 %1"),
            ],
        )
        .unwrap();
    assert_eq!(result, Value::string("world hello"));
}

#[test]
fn test_empty_source_returns_nil() {
    assert_eq!(engine().eval("").unwrap(), Value::Nil);
}

#[test]
fn test_single_number_returns_itself() {
    assert_eq!(engine().eval("42").unwrap(), Value::Number(42.0));
}

#[test]
fn test_truthiness_table() {
    let engine = engine();
    assert_eq!(engine.eval("!nil").unwrap(), Value::Bool(true));
    assert_eq!(engine.eval("!false").unwrap(), Value::Bool(true));
    // Legacy rule: zero is falsy.
    assert_eq!(engine.eval("!0").unwrap(), Value::Bool(true));
    assert_eq!(engine.eval("!\"\"").unwrap(), Value::Bool(false));
    assert_eq!(engine.eval("!{}").unwrap(), Value::Bool(false));
}

#[test]
fn test_string_constant_round_trip() {
    let engine = engine();
    assert_eq!(
        engine.eval("\"line\\none \\\"quoted\\\" \\\\slash\"").unwrap(),
        Value::string("line\none \"quoted\" \\slash")
    );
}

#[test]
fn test_numeric_for_accumulates() {
    let engine = engine();
    assert_eq!(
        engine
            .eval("var sum = 0\nfor i = 1, 5 do sum = sum + i end\nsum")
            .unwrap(),
        Value::Number(15.0)
    );
}

#[test]
fn test_for_in_pairs_visits_every_entry() {
    let engine = engine();
    let result = engine
        .eval(
            "var t = { a = 1, b = 2, c = 3 }\n\
             var total = 0\n\
             for k, v in pairs(t) do total = total + v end\n\
             total",
        )
        .unwrap();
    assert_eq!(result, Value::Number(6.0));
}

#[test]
fn test_while_do_end_form() {
    let engine = engine();
    assert_eq!(
        engine
            .eval("var i = 0\nwhile i < 3 do i = i + 1 end\ni")
            .unwrap(),
        Value::Number(3.0)
    );
}

#[test]
fn test_elseif_chain_picks_middle_arm() {
    let engine = engine();
    let source = "var x = 5\n\
                  var label = \"\"\n\
                  if (x < 3) { label = \"small\" } elseif (x < 10) { label = \"medium\" } else { label = \"large\" }\n\
                  label";
    assert_eq!(engine.eval(source).unwrap(), Value::string("medium"));
}

#[test]
fn test_string_intrinsic_opcodes() {
    let engine = engine();
    assert_eq!(engine.eval("strlen(\"ghost\")").unwrap(), Value::Number(5.0));
    assert_eq!(
        engine.eval("substr(\"ghostlang\", 6, 4)").unwrap(),
        Value::string("lang")
    );
    assert_eq!(
        engine.eval("strupper(\"gza\")").unwrap(),
        Value::string("GZA")
    );
    assert_eq!(
        engine.eval("strlower(\"GZA\")").unwrap(),
        Value::string("gza")
    );
    assert_eq!(
        engine.eval("strfind(\"ghostlang\", \"lang\")").unwrap(),
        Value::Number(6.0)
    );
    assert_eq!(engine.eval("strfind(\"abc\", \"z\")").unwrap(), Value::Nil);
}

#[test]
fn test_concat_produces_owned_string() {
    let engine = engine();
    assert_eq!(
        engine.eval("\"ghost\" .. \"lang\"").unwrap(),
        Value::string("ghostlang")
    );
    // Numbers are stringlike for concat.
    assert_eq!(
        engine.eval("\"v\" .. 2").unwrap(),
        Value::string("v2")
    );
}

#[test]
fn test_division_by_zero_is_ieee_not_an_error() {
    let engine = engine();
    match engine.eval("1 / 0").unwrap() {
        Value::Number(n) => assert!(n.is_infinite() && n > 0.0),
        other => panic!("expected inf, got {other:?}"),
    }
    match engine.eval("0 / 0").unwrap() {
        Value::Number(n) => assert!(n.is_nan()),
        other => panic!("expected NaN, got {other:?}"),
    }
}

#[test]
fn test_type_errors_carry_context() {
    let engine = engine();
    let script = engine.load_script("var x = 1\nvar y = \"s\" * 2").unwrap();
    let err = script.run().unwrap_err();
    assert!(matches!(err.root(), ExecError::Type { .. }));
    let context = err.context().expect("runtime errors carry context");
    assert_eq!(context.line, 2);
}

#[test]
fn test_undefined_variable_error() {
    let engine = engine();
    let err = engine.load_script("ghost_town").unwrap().run().unwrap_err();
    assert_eq!(
        err.root(),
        &ExecError::UndefinedVariable {
            name: "ghost_town".to_string()
        }
    );
}

#[test]
fn test_runaway_recursion_is_stack_overflow() {
    // Run on a thread with a larger stack: the default test-thread stack
    // (2MiB) is smaller than a normal process main thread (8MiB), and the
    // recursive interpreter needs the latter to hit the call-depth guard
    // before the native stack itself runs out.
    std::thread::Builder::new()
        .stack_size(16 * 1024 * 1024)
        .spawn(|| {
            let engine = Engine::new(EngineConfig::default().with_timeout_ms(10_000));
            let err = engine
                .eval("function f(n)\n  return f(n)\nend\nf(1)")
                .unwrap_err();
            let exec = match err {
                ghostlang_core::EngineError::Exec(exec) => exec,
                other => panic!("expected exec error, got {other:?}"),
            };
            assert!(matches!(exec.root(), ExecError::StackOverflow { .. }));
            // The trace shows the recursive frames.
            assert!(!exec.frames().is_empty());
        })
        .unwrap()
        .join()
        .unwrap();
}

#[test]
fn test_nested_call_shares_outer_deadline() {
    let engine = Engine::new(EngineConfig::default().with_timeout_ms(50));
    let err = engine
        .eval("function spin()\n  while (true) { }\nend\nspin()")
        .unwrap_err();
    let exec = match err {
        ghostlang_core::EngineError::Exec(exec) => exec,
        other => panic!("expected exec error, got {other:?}"),
    };
    assert_eq!(exec.root(), &ExecError::ExecutionTimeout { limit_ms: 50 });
}

#[test]
fn test_shadowing_and_scope_resolution() {
    let engine = engine();
    let result = engine
        .eval("var x = 1\nlocal x = 2\nx")
        .unwrap();
    // The local shadows the global at lookup time.
    assert_eq!(result, Value::Number(2.0));
    // Reassignment through the shadow updates the local, not the global.
    let engine = Engine::new(EngineConfig::default());
    engine.eval("var x = 1\nlocal x = 2\nx = 3").unwrap();
    assert_eq!(engine.global("x"), Some(Value::Number(1.0)));
}

#[test]
fn test_tables_and_arrays_end_to_end() {
    let engine = engine();
    assert_eq!(
        engine
            .eval("var t = { greeting = \"hi\" }\nt.greeting")
            .unwrap(),
        Value::string("hi")
    );
    assert_eq!(
        engine.eval("var a = [1, 2, 3]\na[1] + a[2]").unwrap(),
        Value::Number(5.0)
    );
    assert_eq!(
        engine.eval("var a = [1]\na[5] = 99\na[0]").unwrap(),
        Value::Number(1.0)
    );
    // Missing lookups are nil, not errors.
    assert_eq!(engine.eval("var t = {}\nt.absent").unwrap(), Value::Nil);
    assert_eq!(engine.eval("var a = []\na[7]").unwrap(), Value::Nil);
}

#[test]
fn test_table_string_index_syntax() {
    let engine = engine();
    assert_eq!(
        engine
            .eval("var t = { key = 4 }\nt[\"key\"]")
            .unwrap(),
        Value::Number(4.0)
    );
}

#[test]
fn test_require_reads_file_behind_io_gate() {
    let dir = tempfile::tempdir().unwrap();
    let module = dir.path().join("mod.gza");
    std::fs::write(&module, "var m = 1").unwrap();

    // Closed gate: the read is refused.
    let closed = Engine::new(EngineConfig::default());
    let source = format!("require(\"{}\")", module.display());
    let err = closed.eval(&source).unwrap_err();
    let exec = match err {
        ghostlang_core::EngineError::Exec(exec) => exec,
        other => panic!("expected exec error, got {other:?}"),
    };
    assert_eq!(exec.root(), &ExecError::IoNotAllowed);

    // Open gate: the stub module carries the file bytes.
    let open = Engine::new(EngineConfig::default().with_io(true));
    match open.eval(&source).unwrap() {
        Value::Table(table) => {
            assert_eq!(table.get("content"), Some(Value::string("var m = 1")));
        }
        other => panic!("expected module table, got {other:?}"),
    }

    // Missing file: the version stub.
    let missing = format!("require(\"{}\")", dir.path().join("nope.gza").display());
    match open.eval(&missing).unwrap() {
        Value::Table(table) => {
            assert_eq!(table.get("version"), Some(Value::string("1.0.0")));
        }
        other => panic!("expected stub table, got {other:?}"),
    }
}

#[test]
fn test_comparison_and_logic_operators() {
    let engine = engine();
    assert_eq!(engine.eval("1 < 2 && 2 <= 2").unwrap(), Value::Bool(true));
    assert_eq!(engine.eval("1 > 2 || 3 >= 4").unwrap(), Value::Bool(false));
    assert_eq!(engine.eval("\"a\" == \"a\"").unwrap(), Value::Bool(true));
    assert_eq!(engine.eval("\"a\" != \"b\"").unwrap(), Value::Bool(true));
    assert_eq!(engine.eval("1 ~= 2").unwrap(), Value::Bool(true));
    assert_eq!(engine.eval("nil == nil").unwrap(), Value::Bool(true));
    assert_eq!(engine.eval("1 == \"1\"").unwrap(), Value::Bool(false));
}

#[test]
fn test_table_equality_is_by_handle() {
    let engine = engine();
    assert_eq!(
        engine.eval("var t = {}\nvar u = t\nt == u").unwrap(),
        Value::Bool(true)
    );
    assert_eq!(
        engine.eval("var t = {}\nvar u = {}\nt == u").unwrap(),
        Value::Bool(false)
    );
}

#[test]
fn test_unary_minus_and_modulo() {
    let engine = engine();
    assert_eq!(engine.eval("-5 + 8").unwrap(), Value::Number(3.0));
    assert_eq!(engine.eval("7 % 3").unwrap(), Value::Number(1.0));
}

#[test]
fn test_numeric_for_runs_body_at_least_once() {
    // The init/label/body/for_loop shape tests the bound after the body.
    let engine = engine();
    assert_eq!(
        engine
            .eval("var n = 0\nfor i = 5, 1 do n = n + 1 end\nn")
            .unwrap(),
        Value::Number(1.0)
    );
}

#[test]
fn test_instruction_count_is_observable() {
    use ghostlang_runtime::InstrumentEvent;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    let engine = engine();
    let seen = Arc::new(AtomicU64::new(0));
    let sink = Arc::clone(&seen);
    engine.set_instrument(move |event| {
        if let InstrumentEvent::RunFinished { instructions, .. } = event {
            sink.store(*instructions, Ordering::Relaxed);
        }
    });
    engine.eval("1 + 1").unwrap();
    let count = seen.load(Ordering::Relaxed);
    assert!(count >= 3, "expected a few instructions, saw {count}");
}
