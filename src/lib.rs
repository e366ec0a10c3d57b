//! An ahead-of-time compiler and bytecode interpreter for a tiny imperative
//! language with integer functions, conditionals, loops, and console I/O.
//!
//! Source text is compiled in a single pass into fixed-width register-machine
//! instructions (no AST, no IR) and executed by a dispatch loop over a flat
//! memory holding a stack of register windows.  See `src/bin` for the
//! executable program using this library.

pub mod back;
pub mod common;
pub mod front;
