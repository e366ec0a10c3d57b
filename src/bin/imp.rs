//! the imp compiler and interpreter. takes a source file, compiles it, and
//! runs it (or prints an intermediate stage instead).
//!
//! run with `--help` for more info.

use std::io;

use clap::{Parser, ValueEnum};

use imp::back::vm;
use imp::front::{self, lex};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// the input file
    file: String,
    /// what to produce: an intermediate stage, or a program run
    #[arg(value_enum, short, long, default_value_t = Output::Run)]
    emit: Output,
    /// register memory size in bytes
    #[arg(long, default_value_t = vm::DEFAULT_MEMORY_BYTES)]
    memory: usize,
    /// print every executed instruction to stderr (needs the `trace`
    /// feature)
    #[arg(long, default_value_t = false)]
    trace: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, ValueEnum)]
enum Output {
    /// the list of tokens
    Tokens,
    /// the disassembled bytecode
    Bytecode,
    /// compile and run the program, exiting with its exit code
    Run,
}

fn main() {
    use Output::*;
    let args = Args::parse();

    let source = std::fs::read_to_string(&args.file).expect("file should be readable");

    match args.emit {
        Tokens => match lex::Tokens::lex(&source) {
            Ok(tokens) => {
                for (token, pos) in tokens.items() {
                    println!("{pos}: {token}");
                }
            }
            Err(error) => fail(error),
        },
        Bytecode => match front::compile(&source) {
            Ok(bytecode) => {
                for (pos, insn) in bytecode.iter().enumerate() {
                    println!("{pos:08} {insn}");
                }
            }
            Err(error) => fail(error),
        },
        Run => {
            let bytecode = match front::compile(&source) {
                Ok(bytecode) => bytecode,
                Err(error) => fail(error),
            };
            let options = vm::Options {
                memory_bytes: args.memory,
                trace: args.trace,
            };
            let stdin = io::stdin().lock();
            let stdout = io::stdout().lock();
            match vm::interpret(&bytecode, &options, stdin, stdout) {
                // The host keeps the low byte, per convention.
                Ok(code) => std::process::exit(code as i32),
                Err(trap) => fail(trap),
            }
        }
    }
}

fn fail(error: impl std::fmt::Display) -> ! {
    eprintln!("{error}");
    std::process::exit(1);
}
