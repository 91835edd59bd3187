use std::collections::HashMap;
use std::fmt::Write;

use crate::bytecode::ir::{ByteCode, Program, decode_string};
use crate::bytecode::op::{Format, Instruction, OpCode};

/// Print disassembly of a whole program
pub fn print_program(program: &Program) {
    print!("{}", format_program(program));
}

/// Disassembly of every chunk, entry first.
pub fn format_program(program: &Program) -> String {
    let mut output = String::from("=== BYTECODE PROGRAM ===\n\n");

    if !program.externals.is_empty() {
        output.push_str("externals:\n");
        for (index, name) in program.externals.iter().enumerate() {
            let _ = writeln!(output, "  [{}] {}", index, name);
        }
        output.push('\n');
    }

    for (index, chunk) in program.chunks.iter().enumerate() {
        let marker = if index == program.entry_point {
            " (entry)"
        } else {
            ""
        };
        output.push_str("════════════════════════════════════════\n");
        let _ = writeln!(output, " [{}] {}{}", index, chunk.name, marker);
        let _ = writeln!(
            output,
            " {} instructions, {} constant words",
            chunk.instructions.len(),
            chunk.constants.len()
        );
        output.push_str("════════════════════════════════════════\n");
        output.push_str(&disassemble_to_string(chunk, program));
        output.push('\n');
    }
    output
}

/// One line per instruction; jump targets are marked.
pub fn disassemble_to_string(chunk: &ByteCode, program: &Program) -> String {
    let mut output = String::new();
    let jump_targets = collect_jump_targets(&chunk.instructions);

    for (ip, instruction) in chunk.instructions.iter().enumerate() {
        if jump_targets.contains(&ip) {
            output.push_str("      ┌──────────────────────────────────\n");
        }

        let _ = write!(output, "{:04} ", ip);
        if jump_targets.contains(&ip) {
            output.push_str("► ");
        } else {
            output.push_str("  ");
        }

        output.push_str(&format_instruction(*instruction, ip, chunk, program));
        output.push('\n');
    }
    output
}

fn jump_target(ip: usize, displacement: i16) -> usize {
    (ip as i64 + 1 + displacement as i64).max(0) as usize
}

fn collect_jump_targets(instructions: &[Instruction]) -> Vec<usize> {
    let mut targets = Vec::new();

    for (ip, instruction) in instructions.iter().enumerate() {
        if matches!(
            instruction.opcode(),
            Some(OpCode::Jump | OpCode::JumpIfFalse)
        ) {
            let target = jump_target(ip, instruction.signed_short());
            if !targets.contains(&target) {
                targets.push(target);
            }
        }
    }

    targets
}

fn format_instruction(
    instruction: Instruction,
    ip: usize,
    chunk: &ByteCode,
    program: &Program,
) -> String {
    let Some(op) = instruction.opcode() else {
        return format!("??? {:#04x}", instruction.opcode_byte());
    };
    let name = op.mnemonic();

    match op {
        OpCode::Jump | OpCode::JumpIfFalse => {
            let offset = instruction.signed_short();
            format!(
                "{:<18}{:+} (→ {:04})",
                name,
                offset,
                jump_target(ip, offset)
            )
        }
        OpCode::Call => {
            let callee = program
                .chunks
                .get(instruction.short() as usize)
                .map_or("<missing>", |c| c.name.as_str());
            format!(
                "{:<18}{} params={} ; {}",
                name,
                instruction.short(),
                instruction.a(),
                callee
            )
        }
        OpCode::CallExternal => {
            let callee = program
                .externals
                .get(instruction.short() as usize)
                .map_or("<missing>", |n| n.as_str());
            format!(
                "{:<18}{} params={} ; {}",
                name,
                instruction.short(),
                instruction.a(),
                callee
            )
        }
        OpCode::LoadConstant => {
            let index = instruction.short() as usize;
            match chunk.constants.get(index) {
                Some(word) => format!(
                    "{:<18}{} ; {} / {}",
                    name,
                    index,
                    *word as i32,
                    f32::from_bits(*word)
                ),
                None => format!("{:<18}{} ; <missing>", name, index),
            }
        }
        OpCode::LoadHeapConstant => {
            let index = instruction.short() as usize;
            format!("{:<18}{} ; {:?}", name, index, string_constant(chunk, index))
        }
        _ => format!("{:<18}{}", name, format_operands(instruction, op)),
    }
}

fn format_operands(instruction: Instruction, op: OpCode) -> String {
    match op.format() {
        Format::None => String::new(),
        Format::Bytes => format!(
            "{} {} {}",
            instruction.a(),
            instruction.b(),
            instruction.c()
        ),
        Format::ByteShort => format!("{} {}", instruction.a(), instruction.short()),
        Format::SignedShort => format!("{:+}", instruction.signed_short()),
        Format::Immediate => format!("{}", instruction.immediate_value()),
    }
}

fn string_constant(chunk: &ByteCode, index: usize) -> String {
    let Some(&length) = chunk.constants.get(index) else {
        return "<missing>".to_string();
    };
    let start = index + 1;
    let end = (start + length as usize).min(chunk.constants.len());
    decode_string(&chunk.constants[start.min(end)..end])
}

// =============================================================================
// Statistics
// =============================================================================

/// Print bytecode statistics
pub fn print_stats(program: &Program) {
    println!("=== BYTECODE STATISTICS ===\n");

    let total = program.instruction_count();
    println!("Chunks:        {}", program.chunks.len());
    println!("Externals:     {}", program.externals.len());
    println!("Instructions:  {}", total);
    println!();

    let counts = count_ops(program);
    println!("Op frequency:");
    let mut counts: Vec<_> = counts.into_iter().collect();
    counts.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));

    for (op, count) in counts.iter().take(10) {
        let pct = (*count as f64 / total.max(1) as f64) * 100.0;
        println!("  {:<18} {:>4} ({:>5.1}%)", op, count, pct);
    }
}

fn count_ops(program: &Program) -> HashMap<&'static str, usize> {
    let mut counts = HashMap::new();
    for chunk in &program.chunks {
        for instruction in &chunk.instructions {
            let name = instruction.opcode().map_or("<invalid>", OpCode::mnemonic);
            *counts.entry(name).or_insert(0) += 1;
        }
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::ir::encode_string;

    fn program_from(instructions: Vec<Instruction>, constants: Vec<u32>) -> Program {
        let mut chunk = ByteCode::new("<entry>");
        chunk.instructions = instructions;
        chunk.constants = constants;
        Program {
            chunks: vec![chunk],
            entry_point: 0,
            externals: vec!["Print".to_string()],
        }
    }

    #[test]
    fn test_jump_target_is_marked() {
        let program = program_from(
            vec![
                Instruction::immediate(OpCode::PushImmediate, 1),
                Instruction::signed(OpCode::JumpIfFalse, 1),
                Instruction::immediate(OpCode::PushImmediate, 2),
                Instruction::none(OpCode::Halt),
            ],
            vec![],
        );
        let output = disassemble_to_string(&program.chunks[0], &program);
        assert!(output.contains("(→ 0003)"));
        assert!(output.contains("0003 ► Halt"));
    }

    #[test]
    fn test_constants_are_annotated() {
        let mut constants = vec![1.5f32.to_bits()];
        constants.extend(encode_string("hi"));
        let program = program_from(
            vec![
                Instruction::byte_short(OpCode::LoadConstant, 0, 0),
                Instruction::byte_short(OpCode::LoadHeapConstant, 0, 1),
                Instruction::byte_short(OpCode::CallExternal, 1, 0),
            ],
            constants,
        );
        let output = format_program(&program);
        assert!(output.contains("1.5"));
        assert!(output.contains("\"hi\""));
        assert!(output.contains("; Print"));
        assert!(output.contains("(entry)"));
    }

    #[test]
    fn test_invalid_opcode_does_not_panic() {
        let program = program_from(vec![Instruction([0xEE, 0, 0, 0])], vec![]);
        assert!(format_program(&program).contains("??? 0xee"));
    }

    #[test]
    fn test_op_counts() {
        let program = program_from(
            vec![
                Instruction::immediate(OpCode::PushImmediate, 1),
                Instruction::immediate(OpCode::PushImmediate, 2),
                Instruction::none(OpCode::AddInt),
                Instruction::none(OpCode::Halt),
            ],
            vec![],
        );
        let counts = count_ops(&program);
        assert_eq!(counts.get("PushImmediate"), Some(&2));
        assert_eq!(counts.get("AddInt"), Some(&1));
    }
}
