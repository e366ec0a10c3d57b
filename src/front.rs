//! The front-end of the compiler.

pub mod compile;
pub mod lex;

pub use compile::{compile, CompileError};
pub use lex::{LexError, Token, Tokens};
