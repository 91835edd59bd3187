pub mod lexer;
pub mod token;
pub mod token_dumper;

pub use lexer::{Module, Tokenizer, TokenizerError};
pub use token::{Span, Token, TokenKind};
pub use token_dumper::TokenDumper;
