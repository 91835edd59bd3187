use thiserror::Error;

use crate::frontend::lexer::render_caret;
use crate::frontend::token::Token;

/// Compilation stops at the first error; the token is where it was detected.
#[derive(Debug, Clone, Error)]
#[error("{}:{}: {kind}", .token.span.line, .token.span.col)]
pub struct CompilerError {
    pub token: Token,
    pub kind: CompileErrorKind,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CompileErrorKind {
    #[error("expected {expected}, found {found}")]
    Expected { expected: String, found: String },

    #[error("'{name}' is already declared in this scope")]
    Redeclaration { name: String },

    #[error("unknown identifier '{name}'")]
    UnknownIdentifier { name: String },

    #[error("unknown type '{name}'")]
    UnknownType { name: String },

    #[error("unknown function '{name}'")]
    UnknownFunction { name: String },

    #[error("type {ty} has no member '{member}'")]
    UnknownMember { ty: String, member: String },

    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },

    #[error("operator {op} cannot be applied to {left} and {right}")]
    InvalidOperands {
        op: String,
        left: String,
        right: String,
    },

    #[error("'{name}' takes {expected} argument(s) but {found} were supplied")]
    ArityMismatch {
        name: String,
        expected: usize,
        found: usize,
    },

    #[error("index {index} is out of bounds for length {length}")]
    IndexOutOfBounds { index: i64, length: u32 },

    #[error("{target} is not assignable")]
    NotAssignable { target: String },

    #[error("type {ty} cannot be indexed")]
    NotIndexable { ty: String },

    #[error("'{name}' expects {expected} type argument(s) but {found} were supplied")]
    TypeArgumentCount {
        name: String,
        expected: usize,
        found: usize,
    },

    #[error("type parameter of '{name}' is unresolved after substitution")]
    UnresolvedPlaceholder { name: String },

    #[error("structure '{name}' contains itself by value")]
    RecursiveStructure { name: String },

    #[error("{construct} {reason}")]
    InvalidPosition { construct: String, reason: String },

    #[error("literal {literal} is out of range")]
    LiteralOutOfRange { literal: String },

    #[error("{what} exceeds the instruction format limit")]
    TooLarge { what: String },

    #[error("expected an indented block")]
    ExpectedBlock,

    #[error("unexpected indentation")]
    UnexpectedIndentation,
}

impl CompilerError {
    pub fn new(token: &Token, kind: CompileErrorKind) -> Self {
        CompilerError {
            token: token.clone(),
            kind,
        }
    }

    pub fn expected(token: &Token, expected: impl Into<String>) -> Self {
        Self::new(
            token,
            CompileErrorKind::Expected {
                expected: expected.into(),
                found: token.to_string(),
            },
        )
    }

    pub fn mismatch(token: &Token, expected: impl Into<String>, found: impl Into<String>) -> Self {
        Self::new(
            token,
            CompileErrorKind::TypeMismatch {
                expected: expected.into(),
                found: found.into(),
            },
        )
    }

    /// A construct that is valid syntax but not allowed where it appeared.
    pub fn invalid_position(
        token: &Token,
        construct: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::new(
            token,
            CompileErrorKind::InvalidPosition {
                construct: construct.into(),
                reason: reason.into(),
            },
        )
    }

    pub fn too_large(token: &Token, what: impl Into<String>) -> Self {
        Self::new(token, CompileErrorKind::TooLarge { what: what.into() })
    }

    pub fn render(&self, source: &str) -> String {
        render_caret(source, self.token.span, &self.kind.to_string())
    }
}
