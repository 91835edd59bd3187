//! Cinder: an embeddable, statically typed scripting language.
//!
//! Source is tokenized ([`frontend`]), compiled in a single pass straight to
//! bytecode ([`bytecode`]) and executed by a word-addressed [`Machine`] that a
//! host drives frame by frame, suspending wherever a script `yield`s.
//!
//! ```no_run
//! use cinder::{EnvironmentState, ExternalTable, Machine, compile_source};
//!
//! let program = compile_source("demo", "external function Tick()\nTick()\n")?;
//! let mut table = ExternalTable::new();
//! table.register("Tick", |_| Ok(()));
//!
//! let mut machine = Machine::new(1024);
//! machine.boot(program)?;
//! machine.bind_externals(&table)?;
//! while !machine.run(EnvironmentState::default())? {}
//! # Ok::<(), cinder::Error>(())
//! ```

pub mod bytecode;
pub mod frontend;
pub mod lang;
pub mod runtime;

use thiserror::Error;

pub use bytecode::{CompilerError, Program};
pub use frontend::{Module, Tokenizer, TokenizerError};
pub use runtime::{
    EnvironmentState, ExecutionState, ExternalFunction, ExternalTable, FaultKind, Machine,
    MachineConfig, MachineError,
};

/// Anything that can go wrong between source text and a finished run.
#[derive(Debug, Error)]
pub enum Error {
    #[error("tokenizer error: {0}")]
    Tokenize(#[from] TokenizerError),
    #[error("compile error: {0}")]
    Compile(#[from] CompilerError),
    #[error(transparent)]
    Runtime(#[from] MachineError),
    #[error("program encoding error: {0}")]
    Encoding(#[from] postcard::Error),
}

impl Error {
    /// Like `Display`, but source-located errors quote the offending line.
    pub fn render(&self, source: &str) -> String {
        match self {
            Error::Tokenize(e) => format!("tokenizer error: {}", e.render(source)),
            Error::Compile(e) => format!("compile error: {}", e.render(source)),
            other => other.to_string(),
        }
    }
}

/// Tokenizes and compiles a single module.
pub fn compile_source(name: &str, source: &str) -> Result<Program, Error> {
    compile_modules(&[(name, source)])
}

/// Compiles modules in order into one program. Each module sees the
/// declarations of the ones before it, and their top-level statements run in
/// the same order.
pub fn compile_modules(modules: &[(&str, &str)]) -> Result<Program, Error> {
    let mut compiler = bytecode::Compiler::new();
    for (name, source) in modules {
        let mut module = Module::new(name, *source);
        Tokenizer::tokenize_module(&mut module)?;
        compiler.add_module(&module)?;
    }
    Ok(compiler.build())
}

/// Decodes a program written with [`Program::to_bytes`] and checks it
/// structurally, so it is safe to boot.
pub fn decode_program(bytes: &[u8]) -> Result<Program, Error> {
    let program = Program::from_bytes(bytes)?;
    bytecode::verify(&program).map_err(MachineError::from)?;
    Ok(program)
}
