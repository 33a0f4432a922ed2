//! Ghostlang CLI
//!
//! `ghost script.gza` reads the script, runs it under the sandbox limits,
//! and prints the resulting value. Limits come from defaults, then an
//! optional `ghost.toml` next to the script (or `--config`), then flags.
//!
//! Exit codes: 0 on success, 1 when the script fails to parse or run,
//! 2 on usage or file-system errors. Set `GHOST_LOG` for engine traces
//! (e.g. `GHOST_LOG=ghostlang_runtime=debug`).

use clap::Parser;
use ghostlang_core::{EngineConfig, ExecError};
use ghostlang_core::Value;
use ghostlang_runtime::{Engine, stdlib};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "ghost")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run Ghostlang (.gza) scripts in a sandboxed engine", long_about = None)]
struct Cli {
    /// Script file to run
    script: PathBuf,

    /// Print the compiled bytecode instead of running
    #[arg(long)]
    dump_bytecode: bool,

    /// Wall-clock limit for the run, in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Cap on bytes of live script values
    #[arg(long)]
    memory_limit: Option<usize>,

    /// Cap on executed VM instructions
    #[arg(long)]
    instruction_limit: Option<u64>,

    /// Close the I/O gate (print, readFile, require, ...)
    #[arg(long)]
    no_io: bool,

    /// Open the syscall gate for natives that want it
    #[arg(long)]
    allow_syscalls: bool,

    /// Refuse non-deterministic natives such as clock()
    #[arg(long)]
    deterministic: bool,

    /// Limits file (defaults to ghost.toml next to the script)
    #[arg(long)]
    config: Option<PathBuf>,
}

/// Optional `ghost.toml` overlay; every field falls back to the default.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct LimitsFile {
    memory_limit_bytes: Option<usize>,
    execution_timeout_ms: Option<u64>,
    instruction_limit: Option<u64>,
    allow_io: Option<bool>,
    allow_syscalls: Option<bool>,
    deterministic: Option<bool>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("GHOST_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    ExitCode::from(run(&cli))
}

fn run(cli: &Cli) -> u8 {
    let source = match std::fs::read_to_string(&cli.script) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("ghost: cannot read {}: {err}", cli.script.display());
            return 2;
        }
    };

    let config = match build_config(cli) {
        Ok(config) => config,
        Err(message) => {
            eprintln!("ghost: {message}");
            return 2;
        }
    };

    let engine = Engine::new(config);
    stdlib::install(&engine);

    let script = match engine.load_script(&source) {
        Ok(script) => script,
        Err(err) => {
            eprintln!("ghost: {err}");
            return 1;
        }
    };

    if cli.dump_bytecode {
        print!("{}", ghostlang_compiler::disassemble(script.chunk()));
        return 0;
    }

    match script.run() {
        Ok(Value::Nil) => 0,
        Ok(value) => {
            println!("{value}");
            0
        }
        Err(err) => {
            report(&err);
            1
        }
    }
}

fn build_config(cli: &Cli) -> Result<EngineConfig, String> {
    // The CLI is a trusted local runner, so I/O starts open; everything
    // else keeps the engine defaults.
    let mut config = EngineConfig::default().with_io(true);

    if let Some(limits) = load_limits(cli)? {
        if let Some(bytes) = limits.memory_limit_bytes {
            config.memory_limit_bytes = bytes;
        }
        if let Some(ms) = limits.execution_timeout_ms {
            config.execution_timeout_ms = ms;
        }
        if let Some(count) = limits.instruction_limit {
            config.instruction_limit = count;
        }
        if let Some(io) = limits.allow_io {
            config.allow_io = io;
        }
        if let Some(syscalls) = limits.allow_syscalls {
            config.allow_syscalls = syscalls;
        }
        if let Some(deterministic) = limits.deterministic {
            config.deterministic = deterministic;
        }
    }

    if let Some(ms) = cli.timeout_ms {
        config.execution_timeout_ms = ms;
    }
    if let Some(bytes) = cli.memory_limit {
        config.memory_limit_bytes = bytes;
    }
    if let Some(count) = cli.instruction_limit {
        config.instruction_limit = count;
    }
    if cli.no_io {
        config.allow_io = false;
    }
    if cli.allow_syscalls {
        config.allow_syscalls = true;
    }
    if cli.deterministic {
        config.deterministic = true;
    }
    Ok(config)
}

fn load_limits(cli: &Cli) -> Result<Option<LimitsFile>, String> {
    let path = match &cli.config {
        Some(path) => path.clone(),
        None => {
            let sibling = cli
                .script
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .join("ghost.toml");
            if !sibling.exists() {
                return Ok(None);
            }
            sibling
        }
    };
    let text = std::fs::read_to_string(&path)
        .map_err(|err| format!("cannot read {}: {err}", path.display()))?;
    let limits = toml::from_str(&text)
        .map_err(|err| format!("invalid limits in {}: {err}", path.display()))?;
    Ok(Some(limits))
}

fn report(err: &ExecError) {
    eprintln!("ghost: {err}");
    if let Some(context) = err.context() {
        eprintln!(
            "  at line {}, column {} (instruction {})",
            context.line, context.column, context.instruction_pointer
        );
    }
    for frame in err.frames() {
        eprintln!("  in {} (line {})", frame.function, frame.line);
    }
}
