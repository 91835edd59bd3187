//! Compile-time model of the language: types, structure layouts and the
//! lexical scopes the compiler resolves names against.

pub mod scope;
pub mod types;
