pub mod compile;
pub mod compile_error;
pub mod disasm;
pub mod ir;
pub mod op;
pub mod verify;

pub use compile::Compiler;
pub use compile_error::{CompileErrorKind, CompilerError};
pub use ir::{ByteCode, Program};
pub use op::{Instruction, OpCode};
pub use verify::{VerifyError, verify};
