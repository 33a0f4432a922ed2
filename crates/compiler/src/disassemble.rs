//! Human-readable bytecode listings
//!
//! Used by the CLI's `--dump-bytecode` and handy in tests when a codegen
//! shape is surprising.

use ghostlang_core::bytecode::{CompiledChunk, FunctionInfo, Instruction, OpCode, SourcePos};
use ghostlang_core::Value;
use std::fmt::Write;

/// Render a whole chunk: the root stream, its constants, then every
/// function in the table.
pub fn disassemble(chunk: &CompiledChunk) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "; script ({} instructions)", chunk.code.len());
    listing(&mut out, &chunk.code, &chunk.constants, &chunk.lines);
    constants(&mut out, &chunk.constants);
    for (index, function) in chunk.functions.iter().enumerate() {
        function_listing(&mut out, index, function);
    }
    out
}

fn function_listing(out: &mut String, index: usize, function: &FunctionInfo) {
    let _ = writeln!(
        out,
        "\n; function {} '{}' ({} params, {} locals)",
        index,
        function.name,
        function.params.len(),
        function.local_count
    );
    listing(out, &function.code, &function.constants, &function.lines);
    constants(out, &function.constants);
}

fn listing(out: &mut String, code: &[Instruction], consts: &[Value], lines: &[SourcePos]) {
    for (offset, instr) in code.iter().enumerate() {
        let line = lines.get(offset).map(|p| p.line).unwrap_or(0);
        let _ = writeln!(
            out,
            "{offset:4}  [{line:3}]  {:<14} {}",
            instr.op.mnemonic(),
            operands(instr, consts)
        );
    }
}

fn operands(instr: &Instruction, consts: &[Value]) -> String {
    let named = |index: u16| -> String {
        match consts.get(index as usize) {
            Some(Value::Str(s)) => format!("{index} ; \"{}\"", s.as_str()),
            Some(value) => format!("{index} ; {value}"),
            None => format!("{index} ; ??"),
        }
    };
    match instr.op {
        OpCode::Nop => String::new(),
        OpCode::LoadConst => format!("r{}, k{}", instr.a, named(instr.b)),
        OpCode::LoadGlobal | OpCode::StoreGlobal => format!("r{}, k{}", instr.a, named(instr.b)),
        OpCode::DeclareLocal => format!("k{}, r{}", named(instr.a), instr.b),
        OpCode::LoadLocal | OpCode::StoreLocal => format!("r{}, l{}", instr.a, instr.b),
        OpCode::Jump => format!("-> {}", instr.a),
        OpCode::JumpIfFalse | OpCode::JumpIfTrue => format!("r{} -> {}", instr.a, instr.b),
        OpCode::Ret => {
            if instr.b == 1 {
                format!("r{}", instr.a)
            } else {
                String::new()
            }
        }
        OpCode::Call => format!("k{}, r{}+{}", named(instr.a), instr.b, instr.extra),
        OpCode::CallClosure => format!("r{}, r{}+{}", instr.a, instr.b, instr.extra),
        OpCode::MakeClosure => format!("r{}, f{}, {} upvalues", instr.a, instr.b, instr.c),
        OpCode::ForLoop | OpCode::ForInNext => {
            format!("r{}, r{} -> {}", instr.a, instr.b, instr.c)
        }
        OpCode::RequireModule => format!("r{}, k{}", instr.a, named(instr.b)),
        OpCode::SubStr => format!(
            "r{}, r{}, r{}, r{}",
            instr.a, instr.b, instr.c, instr.extra
        ),
        _ => {
            // Plain register triples; trailing zero operands elided.
            let mut parts = vec![format!("r{}", instr.a)];
            if instr.b != 0 || instr.c != 0 {
                parts.push(format!("r{}", instr.b));
            }
            if instr.c != 0 {
                parts.push(format!("r{}", instr.c));
            }
            parts.join(", ")
        }
    }
}

fn constants(out: &mut String, consts: &[Value]) {
    if consts.is_empty() {
        return;
    }
    let _ = writeln!(out, "; constants:");
    for (index, value) in consts.iter().enumerate() {
        match value {
            Value::Str(s) => {
                let _ = writeln!(out, ";   k{index} = \"{}\"", s.as_str());
            }
            other => {
                let _ = writeln!(out, ";   k{index} = {other}");
            }
        }
    }
}
