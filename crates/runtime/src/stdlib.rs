//! Built-in native functions
//!
//! The minimal embedder-facing set: printing, type introspection, string
//! operations backed by the pattern engine, and 1-based array/table
//! helpers over the VM's 0-based layer. These are ordinary registered
//! natives; an embedder can skip [`install`] entirely and register its
//! own.
//!
//! Every native that touches the outside world consults the engine's
//! security context first: `print`/`readFile`/`writeFile` sit behind the
//! I/O gate (files additionally behind the path whitelists) and `clock`
//! behind the determinism gate.

use crate::engine::Engine;
use crate::pattern;
use ghostlang_core::value::{Array, Table};
use ghostlang_core::{ExecError, NativeContext, Value};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Register the built-in natives into `engine`'s globals.
pub fn install(engine: &Engine) {
    engine.register_function("print", print);
    engine.register_function("type", type_of);
    engine.register_function("tostring", tostring);
    engine.register_function("tonumber", tonumber);

    engine.register_function("stringLen", string_len);
    engine.register_function("stringSub", string_sub);
    engine.register_function("stringUpper", string_upper);
    engine.register_function("stringLower", string_lower);
    engine.register_function("stringRep", string_rep);
    engine.register_function("stringFind", string_find);
    engine.register_function("stringMatch", string_match);
    engine.register_function("stringGsub", string_gsub);

    engine.register_function("arrayPush", array_push);
    engine.register_function("arrayGet", array_get);
    engine.register_function("arraySet", array_set);
    engine.register_function("arrayLen", array_len);

    engine.register_function("tableGet", table_get);
    engine.register_function("tableSet", table_set);
    engine.register_function("tableHas", table_has);
    engine.register_function("tableKeys", table_keys);

    engine.register_function("readFile", read_file);
    engine.register_function("writeFile", write_file);
    engine.register_function("clock", clock);
}

// ---- argument plumbing ----

fn want_str<'a>(args: &'a [Value], index: usize, what: &str) -> Result<&'a str, ExecError> {
    match args.get(index) {
        Some(Value::Str(s)) => Ok(s.as_str()),
        Some(other) => Err(ExecError::type_error(format!(
            "{what}: argument {} must be a string, got {}",
            index + 1,
            other.type_name()
        ))),
        None => Err(ExecError::type_error(format!(
            "{what}: missing argument {}",
            index + 1
        ))),
    }
}

fn want_num(args: &[Value], index: usize, what: &str) -> Result<f64, ExecError> {
    match args.get(index) {
        Some(Value::Number(n)) => Ok(*n),
        Some(other) => Err(ExecError::type_error(format!(
            "{what}: argument {} must be a number, got {}",
            index + 1,
            other.type_name()
        ))),
        None => Err(ExecError::type_error(format!(
            "{what}: missing argument {}",
            index + 1
        ))),
    }
}

fn want_array<'a>(
    args: &'a [Value],
    index: usize,
    what: &str,
) -> Result<&'a Arc<Array>, ExecError> {
    match args.get(index) {
        Some(Value::Array(a)) => Ok(a),
        Some(other) => Err(ExecError::type_error(format!(
            "{what}: argument {} must be an array, got {}",
            index + 1,
            other.type_name()
        ))),
        None => Err(ExecError::type_error(format!(
            "{what}: missing argument {}",
            index + 1
        ))),
    }
}

fn want_table<'a>(
    args: &'a [Value],
    index: usize,
    what: &str,
) -> Result<&'a Arc<Table>, ExecError> {
    match args.get(index) {
        Some(Value::Table(t)) => Ok(t),
        Some(other) => Err(ExecError::type_error(format!(
            "{what}: argument {} must be a table, got {}",
            index + 1,
            other.type_name()
        ))),
        None => Err(ExecError::type_error(format!(
            "{what}: missing argument {}",
            index + 1
        ))),
    }
}

/// Optional 1-based position argument, defaulting to 1.
fn optional_init(args: &[Value], index: usize, what: &str) -> Result<usize, ExecError> {
    match args.get(index) {
        None | Some(Value::Nil) => Ok(0),
        Some(_) => {
            let n = want_num(args, index, what)?;
            Ok(if n <= 1.0 { 0 } else { (n - 1.0) as usize })
        }
    }
}

// ---- core ----

fn print(ctx: &NativeContext, args: &[Value]) -> Result<Value, ExecError> {
    ctx.security().check_io_allowed()?;
    let line = args
        .iter()
        .map(Value::to_string)
        .collect::<Vec<_>>()
        .join("\t");
    println!("{line}");
    Ok(Value::Nil)
}

fn type_of(ctx: &NativeContext, args: &[Value]) -> Result<Value, ExecError> {
    let value = args.first().unwrap_or(&Value::Nil);
    ctx.new_string(value.type_name())
}

fn tostring(ctx: &NativeContext, args: &[Value]) -> Result<Value, ExecError> {
    let value = args.first().unwrap_or(&Value::Nil);
    ctx.new_string(value.to_string())
}

fn tonumber(_ctx: &NativeContext, args: &[Value]) -> Result<Value, ExecError> {
    Ok(match args.first() {
        Some(Value::Number(n)) => Value::Number(*n),
        Some(Value::Str(s)) => s
            .as_str()
            .trim()
            .parse::<f64>()
            .map(Value::Number)
            .unwrap_or(Value::Nil),
        _ => Value::Nil,
    })
}

// ---- strings ----

fn string_len(_ctx: &NativeContext, args: &[Value]) -> Result<Value, ExecError> {
    let s = want_str(args, 0, "stringLen")?;
    Ok(Value::Number(s.len() as f64))
}

fn string_sub(ctx: &NativeContext, args: &[Value]) -> Result<Value, ExecError> {
    let s = want_str(args, 0, "stringSub")?;
    let start = want_num(args, 1, "stringSub")?;
    let count = want_num(args, 2, "stringSub")?;
    let skip = if start <= 1.0 { 0 } else { (start - 1.0) as usize };
    let take = if count < 0.0 { 0 } else { count as usize };
    let text: String = s.chars().skip(skip).take(take).collect();
    ctx.new_string(text)
}

fn string_upper(ctx: &NativeContext, args: &[Value]) -> Result<Value, ExecError> {
    let s = want_str(args, 0, "stringUpper")?;
    ctx.new_string(s.to_uppercase())
}

fn string_lower(ctx: &NativeContext, args: &[Value]) -> Result<Value, ExecError> {
    let s = want_str(args, 0, "stringLower")?;
    ctx.new_string(s.to_lowercase())
}

fn string_rep(ctx: &NativeContext, args: &[Value]) -> Result<Value, ExecError> {
    let s = want_str(args, 0, "stringRep")?;
    let n = want_num(args, 1, "stringRep")?;
    let n = if n < 0.0 { 0 } else { n as usize };
    ctx.new_string(s.repeat(n))
}

fn string_find(_ctx: &NativeContext, args: &[Value]) -> Result<Value, ExecError> {
    let s = want_str(args, 0, "stringFind")?;
    let pat = want_str(args, 1, "stringFind")?;
    let init = optional_init(args, 2, "stringFind")?;
    Ok(match pattern::find(s, pat, init)? {
        Some(m) => Value::Number((m.start + 1) as f64),
        None => Value::Nil,
    })
}

fn string_match(ctx: &NativeContext, args: &[Value]) -> Result<Value, ExecError> {
    let s = want_str(args, 0, "stringMatch")?;
    let pat = want_str(args, 1, "stringMatch")?;
    let init = optional_init(args, 2, "stringMatch")?;
    match pattern::match_str(s, pat, init)? {
        Some(text) => ctx.new_string(text),
        None => Ok(Value::Nil),
    }
}

fn string_gsub(ctx: &NativeContext, args: &[Value]) -> Result<Value, ExecError> {
    let s = want_str(args, 0, "stringGsub")?;
    let pat = want_str(args, 1, "stringGsub")?;
    let repl = want_str(args, 2, "stringGsub")?;
    let (out, _count) = pattern::gsub(s, pat, repl)?;
    ctx.new_string(out)
}

// ---- arrays (1-based surface over the 0-based VM layer) ----

fn array_push(_ctx: &NativeContext, args: &[Value]) -> Result<Value, ExecError> {
    let arr = want_array(args, 0, "arrayPush")?;
    let value = args.get(1).cloned().unwrap_or(Value::Nil);
    arr.push(value)?;
    Ok(Value::Nil)
}

fn array_get(_ctx: &NativeContext, args: &[Value]) -> Result<Value, ExecError> {
    let arr = want_array(args, 0, "arrayGet")?;
    let index = want_num(args, 1, "arrayGet")?;
    if index < 1.0 {
        return Ok(Value::Nil);
    }
    Ok(arr.get(index as usize - 1).unwrap_or(Value::Nil))
}

fn array_set(_ctx: &NativeContext, args: &[Value]) -> Result<Value, ExecError> {
    let arr = want_array(args, 0, "arraySet")?;
    let index = want_num(args, 1, "arraySet")?;
    let value = args.get(2).cloned().unwrap_or(Value::Nil);
    if index >= 1.0 {
        arr.set(index as usize - 1, value)?;
    }
    Ok(Value::Nil)
}

fn array_len(_ctx: &NativeContext, args: &[Value]) -> Result<Value, ExecError> {
    let arr = want_array(args, 0, "arrayLen")?;
    Ok(Value::Number(arr.len() as f64))
}

// ---- tables ----

fn table_get(_ctx: &NativeContext, args: &[Value]) -> Result<Value, ExecError> {
    let table = want_table(args, 0, "tableGet")?;
    let key = want_str(args, 1, "tableGet")?;
    Ok(table.get(key).unwrap_or(Value::Nil))
}

fn table_set(_ctx: &NativeContext, args: &[Value]) -> Result<Value, ExecError> {
    let table = want_table(args, 0, "tableSet")?;
    let key = want_str(args, 1, "tableSet")?;
    let value = args.get(2).cloned().unwrap_or(Value::Nil);
    table.insert(key, value)?;
    Ok(Value::Nil)
}

fn table_has(_ctx: &NativeContext, args: &[Value]) -> Result<Value, ExecError> {
    let table = want_table(args, 0, "tableHas")?;
    let key = want_str(args, 1, "tableHas")?;
    Ok(Value::Bool(table.contains_key(key)))
}

fn table_keys(ctx: &NativeContext, args: &[Value]) -> Result<Value, ExecError> {
    let table = want_table(args, 0, "tableKeys")?;
    let keys_value = ctx.new_array()?;
    if let Value::Array(arr) = &keys_value {
        for key in table.keys() {
            arr.push(ctx.new_string(key)?)?;
        }
    }
    Ok(keys_value)
}

// ---- host I/O and time, behind the capability gates ----

fn read_file(ctx: &NativeContext, args: &[Value]) -> Result<Value, ExecError> {
    let path = want_str(args, 0, "readFile")?;
    ctx.security().check_io_allowed()?;
    if !ctx.security().can_read(path) {
        return Err(ExecError::SecurityViolation {
            message: format!("read of '{path}' denied by whitelist"),
        });
    }
    match std::fs::read_to_string(path) {
        Ok(content) => ctx.new_string(content),
        Err(_) => Ok(Value::Nil),
    }
}

fn write_file(ctx: &NativeContext, args: &[Value]) -> Result<Value, ExecError> {
    let path = want_str(args, 0, "writeFile")?;
    let content = want_str(args, 1, "writeFile")?;
    ctx.security().check_io_allowed()?;
    if !ctx.security().can_write(path) {
        return Err(ExecError::SecurityViolation {
            message: format!("write of '{path}' denied by whitelist"),
        });
    }
    Ok(Value::Bool(std::fs::write(path, content).is_ok()))
}

fn clock(ctx: &NativeContext, _args: &[Value]) -> Result<Value, ExecError> {
    ctx.security().check_non_deterministic_allowed()?;
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    Ok(Value::Number(now.as_secs_f64()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ghostlang_core::EngineConfig;

    fn io_engine() -> Engine {
        let engine = Engine::new(EngineConfig::default().with_io(true));
        install(&engine);
        engine
    }

    #[test]
    fn test_string_natives_round_trip_through_guest() {
        let engine = io_engine();
        assert_eq!(
            engine.eval("stringUpper(\"ghost\")").unwrap(),
            Value::string("GHOST")
        );
        assert_eq!(
            engine.eval("stringSub(\"ghostlang\", 1, 5)").unwrap(),
            Value::string("ghost")
        );
        assert_eq!(
            engine.eval("stringRep(\"ab\", 3)").unwrap(),
            Value::string("ababab")
        );
    }

    #[test]
    fn test_pattern_natives() {
        let engine = io_engine();
        assert_eq!(
            engine
                .eval("stringGsub(\"hello world\", \"(%w+) (%w+)\", \"%2 %1\")")
                .unwrap(),
            Value::string("world hello")
        );
        assert_eq!(
            engine.eval("stringFind(\"abc 123\", \"%d+\")").unwrap(),
            Value::Number(5.0)
        );
        assert_eq!(
            engine.eval("stringMatch(\"v1.2\", \"(%d+)%.\")").unwrap(),
            Value::string("1")
        );
    }

    #[test]
    fn test_array_helpers_are_one_based() {
        let engine = io_engine();
        let result = engine
            .eval("var a = [10, 20, 30]\narrayGet(a, 1)")
            .unwrap();
        assert_eq!(result, Value::Number(10.0));
        let len = engine
            .eval("var b = [1]\narrayPush(b, 2)\narrayLen(b)")
            .unwrap();
        assert_eq!(len, Value::Number(2.0));
    }

    #[test]
    fn test_table_helpers() {
        let engine = io_engine();
        assert_eq!(
            engine
                .eval("var t = { a = 1 }\ntableSet(t, \"b\", 2)\ntableGet(t, \"b\")")
                .unwrap(),
            Value::Number(2.0)
        );
        assert_eq!(
            engine.eval("var u = { x = 1 }\ntableHas(u, \"y\")").unwrap(),
            Value::Bool(false)
        );
    }

    #[test]
    fn test_print_is_gated_on_io() {
        let engine = Engine::new(EngineConfig::default());
        install(&engine);
        let err = engine.eval("print(\"hi\")").unwrap_err();
        match err {
            ghostlang_core::EngineError::Exec(exec) => {
                assert_eq!(exec.root(), &ExecError::IoNotAllowed);
            }
            other => panic!("expected exec error, got {other:?}"),
        }
    }

    #[test]
    fn test_clock_is_gated_on_determinism() {
        let engine = Engine::new(EngineConfig::default().with_deterministic(true));
        install(&engine);
        let err = engine.eval("clock()").unwrap_err();
        match err {
            ghostlang_core::EngineError::Exec(exec) => {
                assert!(matches!(exec.root(), ExecError::SecurityViolation { .. }));
            }
            other => panic!("expected exec error, got {other:?}"),
        }
    }

    #[test]
    fn test_read_file_respects_whitelist() {
        let dir = tempfile::tempdir().unwrap();
        let allowed = dir.path().join("ok.txt");
        std::fs::write(&allowed, "fine").unwrap();

        let engine = Engine::new(
            EngineConfig::default()
                .with_io(true)
                .with_read_path(dir.path()),
        );
        install(&engine);

        let source = format!("readFile(\"{}\")", allowed.display());
        assert_eq!(engine.eval(&source).unwrap(), Value::string("fine"));

        let err = engine.eval("readFile(\"/etc/hostname\")").unwrap_err();
        match err {
            ghostlang_core::EngineError::Exec(exec) => {
                assert!(matches!(exec.root(), ExecError::SecurityViolation { .. }));
            }
            other => panic!("expected exec error, got {other:?}"),
        }
    }
}
