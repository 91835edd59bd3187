use thiserror::Error;

use crate::bytecode::verify::VerifyError;
use crate::runtime::heap::HeapError;

/// What went wrong while executing, without the location.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FaultKind {
    #[error("no program has been booted")]
    NotBooted,
    #[error("invalid opcode {0:#04x}")]
    InvalidOpcode(u8),
    #[error("stack underflow")]
    StackUnderflow,
    #[error("address {0:#010x} is out of bounds")]
    AddressOutOfBounds(u32),
    #[error("index {index} out of bounds for length {length}")]
    IndexOutOfBounds { index: i32, length: u32 },
    #[error("division by zero")]
    DivisionByZero,
    #[error("call depth limit exceeded ({0}) - possible infinite recursion")]
    CallDepthExceeded(usize),
    #[error("external function {index} ('{name}') is not bound")]
    UnboundExternal { index: u16, name: String },
    #[error("no implementation registered for external functions: {}", .0.join(", "))]
    MissingExternals(Vec<String>),
    #[error("chunk {0} does not exist")]
    InvalidChunk(usize),
    #[error("invalid program: {0}")]
    InvalidProgram(String),
    #[error(transparent)]
    Verify(#[from] VerifyError),
    #[error(transparent)]
    Heap(#[from] HeapError),
    #[error("external function failed: {0}")]
    External(String),
}

/// A fault plus the call stack it happened in, innermost last.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("runtime error: {kind}{}", format_call_stack(.call_stack))]
pub struct MachineError {
    pub kind: FaultKind,
    pub call_stack: Vec<String>,
}

impl MachineError {
    pub fn new(kind: FaultKind) -> Self {
        MachineError {
            kind,
            call_stack: Vec::new(),
        }
    }

    /// For host callables reporting their own failure.
    pub fn external(message: impl Into<String>) -> Self {
        Self::new(FaultKind::External(message.into()))
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.call_stack.push(context.into());
        self
    }
}

impl From<FaultKind> for MachineError {
    fn from(kind: FaultKind) -> Self {
        MachineError::new(kind)
    }
}

impl From<HeapError> for MachineError {
    fn from(error: HeapError) -> Self {
        MachineError::new(error.into())
    }
}

impl From<VerifyError> for MachineError {
    fn from(error: VerifyError) -> Self {
        MachineError::new(error.into())
    }
}

fn format_call_stack(call_stack: &[String]) -> String {
    let mut out = String::new();
    if !call_stack.is_empty() {
        out.push_str("\n  call stack:");
        for (i, frame) in call_stack.iter().rev().enumerate() {
            out.push_str(&format!("\n    {}: {}", i, frame));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_without_context() {
        let error = MachineError::new(FaultKind::DivisionByZero);
        assert_eq!(error.to_string(), "runtime error: division by zero");
    }

    #[test]
    fn test_display_lists_innermost_first() {
        let error = MachineError::new(FaultKind::StackUnderflow)
            .with_context("<entry> @ 3")
            .with_context("Add @ 1");
        assert_eq!(
            error.to_string(),
            "runtime error: stack underflow\n  call stack:\n    0: Add @ 1\n    1: <entry> @ 3"
        );
    }

    #[test]
    fn test_heap_error_converts() {
        let error: MachineError = HeapError::OutOfBounds {
            index: 4,
            length: 1,
        }
        .into();
        assert!(matches!(error.kind, FaultKind::Heap(_)));
    }
}
