//! Structural checks for programs that did not come straight from the
//! compiler, e.g. ones decoded with [`Program::from_bytes`].

use thiserror::Error;

use crate::bytecode::ir::Program;
use crate::bytecode::op::{Instruction, OpCode};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerifyError {
    #[error("entry point {0} does not name a chunk")]
    MissingEntry(usize),
    #[error("{chunk}:{ip}: invalid opcode {byte:#04x}")]
    InvalidOpcode { chunk: usize, ip: usize, byte: u8 },
    #[error("{chunk}:{ip}: jump lands outside the chunk (target {target})")]
    JumpOutOfRange { chunk: usize, ip: usize, target: i64 },
    #[error("{chunk}:{ip}: call to missing chunk {callee}")]
    UnknownChunk { chunk: usize, ip: usize, callee: u16 },
    #[error("{chunk}:{ip}: call to missing external {index}")]
    UnknownExternal { chunk: usize, ip: usize, index: u16 },
    #[error("{chunk}:{ip}: constant {index} is outside the pool")]
    ConstantOutOfRange { chunk: usize, ip: usize, index: usize },
    #[error("chunk {0} can run past its last instruction")]
    MissingTerminator(usize),
}

/// Checks every chunk of `program`.
pub fn verify(program: &Program) -> Result<(), VerifyError> {
    if program.entry().is_none() {
        return Err(VerifyError::MissingEntry(program.entry_point));
    }
    for chunk in 0..program.chunks.len() {
        verify_chunk(program, chunk)?;
    }
    Ok(())
}

fn verify_chunk(program: &Program, index: usize) -> Result<(), VerifyError> {
    let chunk = &program.chunks[index];
    let length = chunk.instructions.len();

    for (ip, instruction) in chunk.instructions.iter().enumerate() {
        let Some(op) = instruction.opcode() else {
            return Err(VerifyError::InvalidOpcode {
                chunk: index,
                ip,
                byte: instruction.opcode_byte(),
            });
        };
        match op {
            OpCode::Jump | OpCode::JumpIfFalse => {
                let target = ip as i64 + 1 + instruction.signed_short() as i64;
                // landing exactly at the end is only reachable if the chunk
                // is missing its terminator, which is reported below
                if target < 0 || target > length as i64 {
                    return Err(VerifyError::JumpOutOfRange {
                        chunk: index,
                        ip,
                        target,
                    });
                }
            }
            OpCode::Call => {
                let callee = instruction.short();
                if callee as usize >= program.chunks.len() {
                    return Err(VerifyError::UnknownChunk {
                        chunk: index,
                        ip,
                        callee,
                    });
                }
            }
            OpCode::CallExternal => {
                let external = instruction.short();
                if external as usize >= program.externals.len() {
                    return Err(VerifyError::UnknownExternal {
                        chunk: index,
                        ip,
                        index: external,
                    });
                }
            }
            OpCode::LoadConstant => check_constant(program, index, ip, instruction.short() as usize, 1)?,
            OpCode::LoadHeapConstant => {
                let at = instruction.short() as usize;
                let payload = chunk.constants.get(at).copied().unwrap_or(0) as usize;
                check_constant(program, index, ip, at, payload + 1)?;
            }
            _ => {}
        }
    }

    if !chunk.instructions.last().is_some_and(|i| terminates(*i)) {
        return Err(VerifyError::MissingTerminator(index));
    }
    Ok(())
}

fn check_constant(
    program: &Program,
    chunk: usize,
    ip: usize,
    index: usize,
    words: usize,
) -> Result<(), VerifyError> {
    if index + words > program.chunks[chunk].constants.len() {
        return Err(VerifyError::ConstantOutOfRange { chunk, ip, index });
    }
    Ok(())
}

fn terminates(instruction: Instruction) -> bool {
    matches!(
        instruction.opcode(),
        Some(OpCode::Halt | OpCode::Return | OpCode::Jump)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::ir::{ByteCode, encode_string};

    fn program_from(instructions: Vec<Instruction>) -> Program {
        let mut chunk = ByteCode::new("<entry>");
        chunk.instructions = instructions;
        Program {
            chunks: vec![chunk],
            entry_point: 0,
            externals: Vec::new(),
        }
    }

    #[test]
    fn test_minimal_program_is_valid() {
        let program = program_from(vec![Instruction::none(OpCode::Halt)]);
        assert_eq!(verify(&program), Ok(()));
    }

    #[test]
    fn test_missing_entry() {
        let mut program = program_from(vec![Instruction::none(OpCode::Halt)]);
        program.entry_point = 3;
        assert_eq!(verify(&program), Err(VerifyError::MissingEntry(3)));
    }

    #[test]
    fn test_invalid_opcode() {
        let program = program_from(vec![Instruction([0xFF, 0, 0, 0])]);
        assert!(matches!(
            verify(&program),
            Err(VerifyError::InvalidOpcode { byte: 0xFF, .. })
        ));
    }

    #[test]
    fn test_jump_out_of_range() {
        let program = program_from(vec![
            Instruction::signed(OpCode::Jump, -5),
            Instruction::none(OpCode::Halt),
        ]);
        assert!(matches!(
            verify(&program),
            Err(VerifyError::JumpOutOfRange { target: -4, .. })
        ));
    }

    #[test]
    fn test_unknown_callee() {
        let program = program_from(vec![
            Instruction::byte_short(OpCode::Call, 0, 7),
            Instruction::none(OpCode::Halt),
        ]);
        assert!(matches!(
            verify(&program),
            Err(VerifyError::UnknownChunk { callee: 7, .. })
        ));
    }

    #[test]
    fn test_unbound_external_index() {
        let program = program_from(vec![
            Instruction::byte_short(OpCode::CallExternal, 0, 0),
            Instruction::none(OpCode::Halt),
        ]);
        assert!(matches!(
            verify(&program),
            Err(VerifyError::UnknownExternal { index: 0, .. })
        ));
    }

    #[test]
    fn test_string_constant_must_fit() {
        let mut program = program_from(vec![
            Instruction::byte_short(OpCode::LoadHeapConstant, 0, 0),
            Instruction::none(OpCode::Halt),
        ]);
        program.chunks[0].constants = encode_string("hello");
        assert_eq!(verify(&program), Ok(()));
        program.chunks[0].constants.pop();
        assert!(matches!(
            verify(&program),
            Err(VerifyError::ConstantOutOfRange { index: 0, .. })
        ));
    }

    #[test]
    fn test_falling_off_the_end() {
        let program = program_from(vec![Instruction::immediate(OpCode::PushImmediate, 1)]);
        assert_eq!(verify(&program), Err(VerifyError::MissingTerminator(0)));
    }
}
