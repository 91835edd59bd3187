use serde::{Deserialize, Serialize};

use crate::bytecode::op::Instruction;

/// A compiled program: one chunk per function.
///
/// Built once by the compiler, read-only afterwards and shared by every
/// machine that executes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Program {
    /// Convention: `chunks[entry_point]` is the implicit top-level chunk.
    pub chunks: Vec<ByteCode>,
    pub entry_point: usize,
    /// Names of `external function` declarations, by table index.
    pub externals: Vec<String>,
}

/// One function's instructions and word-addressed constant pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteCode {
    pub name: String,
    pub instructions: Vec<Instruction>,
    pub constants: Vec<u32>,
}

impl ByteCode {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instructions: Vec::new(),
            constants: Vec::new(),
        }
    }
}

impl Program {
    pub fn entry(&self) -> Option<&ByteCode> {
        self.chunks.get(self.entry_point)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_allocvec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(bytes)
    }

    pub fn instruction_count(&self) -> usize {
        self.chunks.iter().map(|c| c.instructions.len()).sum()
    }
}

/// Encodes a string constant: payload word count, then UTF-8 bytes padded
/// with zeros to a whole number of words.
pub fn encode_string(text: &str) -> Vec<u32> {
    let bytes = text.as_bytes();
    let mut words = Vec::with_capacity(1 + bytes.len().div_ceil(4));
    words.push(bytes.len().div_ceil(4) as u32);
    for chunk in bytes.chunks(4) {
        let mut word = [0u8; 4];
        word[..chunk.len()].copy_from_slice(chunk);
        words.push(u32::from_le_bytes(word));
    }
    words
}

/// Inverse of [`encode_string`] over the payload words; zero padding is
/// trimmed.
pub fn decode_string(payload: &[u32]) -> String {
    let mut bytes: Vec<u8> = payload.iter().flat_map(|w| w.to_le_bytes()).collect();
    while bytes.last() == Some(&0) {
        bytes.pop();
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::op::OpCode;

    #[test]
    fn test_string_layout() {
        let words = encode_string("hello");
        assert_eq!(words.len(), 3);
        assert_eq!(words[0], 2);
        assert_eq!(decode_string(&words[1..]), "hello");
    }

    #[test]
    fn test_empty_string() {
        let words = encode_string("");
        assert_eq!(words, vec![0]);
        assert_eq!(decode_string(&words[1..]), "");
    }

    #[test]
    fn test_program_bytes_roundtrip() {
        let mut chunk = ByteCode::new("<entry>");
        chunk
            .instructions
            .push(Instruction::immediate(OpCode::PushImmediate, -19));
        chunk.instructions.push(Instruction::none(OpCode::Halt));
        chunk.constants.push(0x4048_0000);
        let program = Program {
            chunks: vec![chunk],
            entry_point: 0,
            externals: vec!["Print".to_string()],
        };

        let bytes = program.to_bytes().unwrap();
        let decoded = Program::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, program);
        assert_eq!(decoded.instruction_count(), 2);
    }
}
