//! The interpreter.
//!
//! Execution state is two values: the instruction pointer and the base of
//! the current register window inside one flat, zero-initialized memory.
//! Register `i` of the running function is `memory[base + i]`, and the
//! caller's window sits right below, so a call only slides the base up and
//! a return slides it back.
//!
//! There is no separate call stack.  [Opcode::Call] expects the callee's
//! entry displacement in its header register (the compiler loads it there),
//! jumps relative to the call site, and overwrites the header with the call
//! site's position.  A return finds that position at `memory[base - 1]`,
//! re-reads the `a` field of the call instruction there to learn how far to
//! slide the base down, and leaves the return value in the vacated header
//! slot.
//!
//! Dispatch is a single match inside the run loop; rustc lowers it to a
//! jump table.  The replicated per-opcode dispatch of some interpreters
//! needs computed goto, which Rust does not expose.
//!
//! Arithmetic wraps.  Division by zero, running the frame base past the end
//! of memory, and straying instruction pointers stop execution with a
//! [Trap] instead of going undefined.

use std::io::{BufRead, Write};

use derive_more::Display;

use crate::back::code::{Instruction, Opcode};

/// Default size of the register memory, in bytes.
pub const DEFAULT_MEMORY_BYTES: usize = 1024 * 1024;

/// One register window: indices go up to 254, so a frame can touch this
/// many cells above its base.
const FRAME_REGS: usize = 255;

/// Interpreter settings.
#[derive(Clone, Debug)]
pub struct Options {
    /// Size of the register memory in bytes.
    pub memory_bytes: usize,
    /// Print every executed instruction to stderr.  Only effective when
    /// the crate is built with the `trace` feature.
    pub trace: bool,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            memory_bytes: DEFAULT_MEMORY_BYTES,
            trace: false,
        }
    }
}

/// A runtime error.  The interpreted program has no way to observe these;
/// execution stops.
#[derive(Display)]
pub enum Trap {
    #[display("Runtime error: division by zero at instruction {at}")]
    DivisionByZero { at: usize },
    #[display("Runtime error: call stack exhausted at instruction {at}")]
    StackOverflow { at: usize },
    #[display("Runtime error: instruction pointer out of range at {at}")]
    PcOutOfRange { at: usize },
    #[display("Runtime error: {_0}")]
    Io(std::io::Error),
}

impl std::fmt::Debug for Trap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self}")
    }
}

impl From<std::io::Error> for Trap {
    fn from(error: std::io::Error) -> Trap {
        Trap::Io(error)
    }
}

/// Executes the bytecode from position 0 and returns the value passed to
/// [Opcode::Exit].
///
/// `input` and `output` carry the program's `in`/`out` traffic; tests drive
/// them with in-memory buffers, the binary with the standard streams.
pub fn interpret<R: BufRead, W: Write>(
    bytecode: &[Instruction],
    options: &Options,
    input: R,
    output: W,
) -> Result<i64, Trap> {
    let cells = options.memory_bytes / std::mem::size_of::<i64>();
    if cells < FRAME_REGS + 1 {
        return Err(Trap::StackOverflow { at: 0 });
    }
    Machine {
        bytecode,
        memory: vec![0; cells],
        base: 0,
        ip: 0,
        input,
        output,
        trace: options.trace,
    }
    .run()
}

struct Machine<'a, R, W> {
    bytecode: &'a [Instruction],
    memory: Vec<i64>,
    base: usize,
    ip: usize,
    input: R,
    output: W,
    trace: bool,
}

// A binary instruction: decode the operands per the opcode's mode, apply,
// store into register a, fall through to the next instruction.
macro_rules! binary {
    ($machine:ident, $insn:ident, $operands:ident, $apply:expr) => {{
        let (x, y) = $machine.$operands($insn);
        $machine.set_reg($insn.a(), $apply(x, y));
        $machine.ip += 1;
    }};
}

// Same, for division and remainder, which can trap.
macro_rules! binary_checked {
    ($machine:ident, $insn:ident, $operands:ident, $apply:ident) => {{
        let (x, y) = $machine.$operands($insn);
        let value = $machine.$apply(x, y)?;
        $machine.set_reg($insn.a(), value);
        $machine.ip += 1;
    }};
}

impl<R: BufRead, W: Write> Machine<'_, R, W> {
    fn run(mut self) -> Result<i64, Trap> {
        use Opcode::*;

        loop {
            let insn = match self.bytecode.get(self.ip) {
                Some(&insn) => insn,
                None => return Err(Trap::PcOutOfRange { at: self.ip }),
            };
            if cfg!(feature = "trace") && self.trace {
                eprintln!("{:08} {insn}", self.ip);
            }
            match insn.opcode() {
                // Commutative binary instructions.
                AddRr => binary!(self, insn, rr, |x: i64, y: i64| x.wrapping_add(y)),
                MulRr => binary!(self, insn, rr, |x: i64, y: i64| x.wrapping_mul(y)),
                EqRr => binary!(self, insn, rr, |x, y| (x == y) as i64),
                NeRr => binary!(self, insn, rr, |x, y| (x != y) as i64),
                AddRi => binary!(self, insn, ri, |x: i64, y: i64| x.wrapping_add(y)),
                MulRi => binary!(self, insn, ri, |x: i64, y: i64| x.wrapping_mul(y)),
                EqRi => binary!(self, insn, ri, |x, y| (x == y) as i64),
                NeRi => binary!(self, insn, ri, |x, y| (x != y) as i64),
                // Noncommutative binary instructions.
                SubRr => binary!(self, insn, rr, |x: i64, y: i64| x.wrapping_sub(y)),
                DivRr => binary_checked!(self, insn, rr, div),
                ModRr => binary_checked!(self, insn, rr, rem),
                LtRr => binary!(self, insn, rr, |x, y| (x < y) as i64),
                LeRr => binary!(self, insn, rr, |x, y| (x <= y) as i64),
                SubRi => binary!(self, insn, ri, |x: i64, y: i64| x.wrapping_sub(y)),
                DivRi => binary_checked!(self, insn, ri, div),
                ModRi => binary_checked!(self, insn, ri, rem),
                LtRi => binary!(self, insn, ri, |x, y| (x < y) as i64),
                LeRi => binary!(self, insn, ri, |x, y| (x <= y) as i64),
                SubIr => binary!(self, insn, ir, |x: i64, y: i64| x.wrapping_sub(y)),
                DivIr => binary_checked!(self, insn, ir, div),
                ModIr => binary_checked!(self, insn, ir, rem),
                LtIr => binary!(self, insn, ir, |x, y| (x < y) as i64),
                LeIr => binary!(self, insn, ir, |x, y| (x <= y) as i64),
                // Unary instructions.
                Neg => {
                    self.set_reg(insn.a(), self.reg(insn.b()).wrapping_neg());
                    self.ip += 1;
                }
                Not => {
                    self.set_reg(insn.a(), (self.reg(insn.b()) == 0) as i64);
                    self.ip += 1;
                }
                // Move instructions.
                Movi => {
                    self.set_reg(insn.a(), insn.d() as i64);
                    self.ip += 1;
                }
                Movr => {
                    self.set_reg(insn.a(), self.reg(insn.b()));
                    self.ip += 1;
                }
                // Jump instructions.
                Jmp => self.branch(insn),
                Jt => {
                    if self.reg(insn.a()) != 0 {
                        self.branch(insn);
                    } else {
                        self.ip += 1;
                    }
                }
                Jf => {
                    if self.reg(insn.a()) == 0 {
                        self.branch(insn);
                    } else {
                        self.ip += 1;
                    }
                }
                // Call/ret instructions.
                Call => {
                    let header = insn.a() as usize;
                    let displacement = self.reg(insn.a());
                    let new_base = self.base + header + 1;
                    if new_base + FRAME_REGS > self.memory.len() {
                        return Err(Trap::StackOverflow { at: self.ip });
                    }
                    // The header slot trades the entry displacement for the
                    // return position.
                    self.set_reg(insn.a(), self.ip as i64);
                    self.base = new_base;
                    self.ip = self.ip.wrapping_add_signed(displacement as isize + 1);
                }
                Retr => {
                    let value = self.reg(insn.a());
                    self.ret(value)?;
                }
                Reti => {
                    let value = insn.d() as i64;
                    self.ret(value)?;
                }
                // System instructions.
                Exit => {
                    self.output.flush()?;
                    return Ok(self.reg(insn.a()));
                }
                In => {
                    if let Some(value) = read_integer(&mut self.input)? {
                        self.set_reg(insn.a(), value);
                    }
                    self.ip += 1;
                }
                Out => {
                    let value = self.reg(insn.a());
                    writeln!(self.output, "{value}")?;
                    self.ip += 1;
                }
            }
        }
    }

    fn reg(&self, index: u8) -> i64 {
        self.memory[self.base + index as usize]
    }

    fn set_reg(&mut self, index: u8, value: i64) {
        self.memory[self.base + index as usize] = value;
    }

    fn rr(&self, insn: Instruction) -> (i64, i64) {
        (self.reg(insn.b()), self.reg(insn.c()))
    }

    fn ri(&self, insn: Instruction) -> (i64, i64) {
        (self.reg(insn.b()), insn.c() as i8 as i64)
    }

    fn ir(&self, insn: Instruction) -> (i64, i64) {
        (insn.b() as i8 as i64, self.reg(insn.c()))
    }

    fn div(&self, x: i64, y: i64) -> Result<i64, Trap> {
        if y == 0 {
            Err(Trap::DivisionByZero { at: self.ip })
        } else {
            Ok(x.wrapping_div(y))
        }
    }

    fn rem(&self, x: i64, y: i64) -> Result<i64, Trap> {
        if y == 0 {
            Err(Trap::DivisionByZero { at: self.ip })
        } else {
            Ok(x.wrapping_rem(y))
        }
    }

    fn branch(&mut self, insn: Instruction) {
        self.ip = self.ip.wrapping_add_signed(insn.d() as isize + 1);
    }

    // Returns to the position saved in the slot below this window and
    // leaves `value` there for the caller.  The width of the vanishing
    // frame comes from the call instruction at the return position.
    fn ret(&mut self, value: i64) -> Result<(), Trap> {
        let return_to = self.memory[self.base - 1] as usize;
        let call = match self.bytecode.get(return_to) {
            Some(&call) => call,
            None => return Err(Trap::PcOutOfRange { at: return_to }),
        };
        self.memory[self.base - 1] = value;
        self.base -= call.a() as usize + 1;
        self.ip = return_to + 1;
        Ok(())
    }
}

// Reads one whitespace-delimited decimal integer, C-scanf style.  `None`
// means end of input or no parseable number at the cursor; the caller
// leaves its destination register alone in that case.
fn read_integer<R: BufRead>(input: &mut R) -> Result<Option<i64>, std::io::Error> {
    loop {
        let (skipped, available) = {
            let buffer = input.fill_buf()?;
            let skipped = buffer
                .iter()
                .take_while(|byte| byte.is_ascii_whitespace())
                .count();
            (skipped, buffer.len())
        };
        if available == 0 {
            return Ok(None);
        }
        input.consume(skipped);
        if skipped < available {
            break;
        }
    }
    let mut text = String::new();
    loop {
        let (taken, available) = {
            let buffer = input.fill_buf()?;
            let mut taken = 0;
            for &byte in buffer {
                let sign = text.is_empty() && taken == 0 && (byte == b'-' || byte == b'+');
                if sign || byte.is_ascii_digit() {
                    text.push(byte as char);
                    taken += 1;
                } else {
                    break;
                }
            }
            (taken, buffer.len())
        };
        input.consume(taken);
        if taken == 0 || taken < available {
            break;
        }
    }
    Ok(text.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    use Opcode::*;

    fn run(bytecode: &[Instruction], stdin: &str) -> Result<(i64, String), Trap> {
        let mut output = Vec::new();
        let code = interpret(
            bytecode,
            &Options::default(),
            Cursor::new(stdin.to_owned()),
            &mut output,
        )?;
        Ok((code, String::from_utf8(output).expect("output should be utf8")))
    }

    #[test]
    fn arithmetic_and_output() {
        let program = [
            Instruction::ad(Movi, 0, 7),
            Instruction::abc(AddRi, 0, 0, 5),
            Instruction::abc(Out, 0, 0, 0),
            Instruction::abc(Exit, 0, 0, 0),
        ];
        assert_eq!(run(&program, "").unwrap(), (12, "12\n".to_owned()));
    }

    #[test]
    fn immediate_operands_are_sign_extended() {
        let program = [
            Instruction::ad(Movi, 0, 10),
            Instruction::abc(AddRi, 1, 0, -3i8 as u8),
            Instruction::abc(SubIr, 2, -5i8 as u8, 0),
            Instruction::abc(Out, 1, 0, 0),
            Instruction::abc(Out, 2, 0, 0),
            Instruction::ad(Movi, 0, 0),
            Instruction::abc(Exit, 0, 0, 0),
        ];
        let (_, out) = run(&program, "").unwrap();
        assert_eq!(out, "7\n-15\n");
    }

    #[test]
    fn modulo_is_a_remainder() {
        let program = [
            Instruction::ad(Movi, 0, 7),
            Instruction::abc(ModRi, 1, 0, 3),
            Instruction::ad(Movi, 2, -7),
            Instruction::abc(ModRi, 3, 2, 3),
            Instruction::abc(Out, 1, 0, 0),
            Instruction::abc(Out, 3, 0, 0),
            Instruction::abc(Exit, 1, 0, 0),
        ];
        // Truncated toward zero, like the division it complements.
        let (_, out) = run(&program, "").unwrap();
        assert_eq!(out, "1\n-1\n");
    }

    #[test]
    fn comparisons_produce_zero_or_one() {
        let program = [
            Instruction::ad(Movi, 0, 3),
            Instruction::abc(LtRi, 1, 0, 5),
            Instruction::abc(LeRi, 2, 0, 3),
            Instruction::abc(EqRi, 3, 0, 4),
            Instruction::abc(NeRi, 4, 0, 4),
            Instruction::abc(Out, 1, 0, 0),
            Instruction::abc(Out, 2, 0, 0),
            Instruction::abc(Out, 3, 0, 0),
            Instruction::abc(Out, 4, 0, 0),
            Instruction::abc(Exit, 3, 0, 0),
        ];
        let (code, out) = run(&program, "").unwrap();
        assert_eq!(out, "1\n1\n0\n1\n");
        assert_eq!(code, 0);
    }

    #[test]
    fn branches_follow_the_displacement_convention() {
        // jt skips the first out when r0 != 0; jmp 0 falls through.
        let program = [
            Instruction::ad(Movi, 0, 1),
            Instruction::ad(Jmp, 0, 0),
            Instruction::abc(Jt, 0, 0, 0), // patched below
            Instruction::abc(Out, 0, 0, 0),
            Instruction::abc(Out, 0, 0, 0),
            Instruction::abc(Exit, 1, 0, 0),
        ];
        let mut program = program;
        program[2].set_d(1);
        let (_, out) = run(&program, "").unwrap();
        assert_eq!(out, "1\n");

        // jf does not branch on a nonzero register.
        let program = [
            Instruction::ad(Movi, 0, 1),
            Instruction::ad(Jf, 0, 1),
            Instruction::abc(Out, 0, 0, 0),
            Instruction::abc(Exit, 1, 0, 0),
        ];
        let (_, out) = run(&program, "").unwrap();
        assert_eq!(out, "1\n");
    }

    #[test]
    fn calls_shift_the_register_window() {
        // main: r1 <- 21, call double(r1), print the result.
        // double: r0 <- r0 + r0 (the argument arrives in its register 0).
        let program = [
            Instruction::ad(Movi, 0, 1),  // entry displacement: 4 - 2 - 1
            Instruction::ad(Movi, 1, 21), // argument
            Instruction::abc(Call, 0, 1, 0),
            Instruction::abc(Exit, 0, 0, 0),
            Instruction::abc(AddRr, 0, 0, 0), // double's body
            Instruction::abc(Retr, 0, 0, 0),
        ];
        let (code, _) = run(&program, "").unwrap();
        assert_eq!(code, 42);
    }

    #[test]
    fn reti_returns_an_immediate() {
        let program = [
            Instruction::ad(Movi, 0, 1), // entry displacement: 3 - 1 - 1
            Instruction::abc(Call, 0, 0, 0),
            Instruction::abc(Exit, 0, 0, 0),
            Instruction::ad(Reti, 0, -7),
        ];
        let (code, _) = run(&program, "").unwrap();
        assert_eq!(code, -7);
    }

    #[test]
    fn nested_calls_keep_caller_registers() {
        // main: r0 <- 5 is live across a call placed at header r1.
        let program = [
            Instruction::ad(Movi, 0, 5),
            Instruction::ad(Movi, 1, 2), // entry displacement: 5 - 2 - 1
            Instruction::abc(Call, 1, 0, 0),
            Instruction::abc(AddRr, 0, 0, 1), // 5 + returned 10
            Instruction::abc(Exit, 0, 0, 0),
            Instruction::ad(Reti, 0, 10),
        ];
        let (code, _) = run(&program, "").unwrap();
        assert_eq!(code, 15);
    }

    #[test]
    fn division_by_zero_traps() {
        let program = [
            Instruction::ad(Movi, 0, 1),
            Instruction::ad(Movi, 1, 0),
            Instruction::abc(DivRr, 2, 0, 1),
            Instruction::abc(Exit, 2, 0, 0),
        ];
        assert!(matches!(
            run(&program, ""),
            Err(Trap::DivisionByZero { at: 2 })
        ));
    }

    #[test]
    fn runaway_recursion_traps() {
        let program = [
            Instruction::ad(Movi, 0, 1),
            Instruction::abc(Call, 0, 0, 0),
            Instruction::abc(Exit, 0, 0, 0),
            Instruction::ad(Movi, 0, -2), // entry displacement back to itself
            Instruction::abc(Call, 0, 0, 0),
            Instruction::ad(Reti, 0, 0),
        ];
        let options = Options {
            memory_bytes: 4096,
            ..Options::default()
        };
        let result = interpret(
            &program,
            &options,
            Cursor::new(String::new()),
            &mut Vec::new(),
        );
        assert!(matches!(result, Err(Trap::StackOverflow { .. })));
    }

    #[test]
    fn running_off_the_bytecode_traps() {
        let program = [Instruction::ad(Movi, 0, 1)];
        assert!(matches!(
            run(&program, ""),
            Err(Trap::PcOutOfRange { at: 1 })
        ));
    }

    #[test]
    fn in_reads_decimal_integers() {
        let program = [
            Instruction::abc(In, 0, 0, 0),
            Instruction::abc(In, 1, 0, 0),
            Instruction::abc(Out, 0, 0, 0),
            Instruction::abc(Out, 1, 0, 0),
            Instruction::abc(Exit, 2, 0, 0),
        ];
        let (_, out) = run(&program, "  42\n\t-17 ").unwrap();
        assert_eq!(out, "42\n-17\n");
    }

    #[test]
    fn in_leaves_the_register_alone_on_eof_or_garbage() {
        let program = [
            Instruction::ad(Movi, 0, 5),
            Instruction::abc(In, 0, 0, 0),
            Instruction::abc(Out, 0, 0, 0),
            Instruction::abc(Exit, 1, 0, 0),
        ];
        let (_, out) = run(&program, "").unwrap();
        assert_eq!(out, "5\n");
        let (_, out) = run(&program, "oops").unwrap();
        assert_eq!(out, "5\n");
    }

    #[test]
    fn exit_reports_the_register_value() {
        let program = [
            Instruction::ad(Movi, 0, 3),
            Instruction::abc(Exit, 0, 0, 0),
        ];
        assert_eq!(run(&program, "").unwrap().0, 3);
    }

    #[test]
    fn tiny_memory_is_rejected() {
        let options = Options {
            memory_bytes: 128,
            ..Options::default()
        };
        let result = interpret(
            &[Instruction::abc(Exit, 0, 0, 0)],
            &options,
            Cursor::new(String::new()),
            &mut Vec::new(),
        );
        assert!(matches!(result, Err(Trap::StackOverflow { at: 0 })));
    }
}
