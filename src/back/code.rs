//! The instruction set.
//!
//! Every instruction is one 32-bit word: an opcode byte followed by three
//! operand bytes `(a, b, c)`.  The `b` and `c` bytes also alias a single
//! signed 16-bit field `d` used for move immediates and branch displacements.
//! `a` is always a register index; whether `b` and `c` are register indices
//! or 8-bit signed immediates is part of the opcode (the `R`/`I` suffixes).
//!
//! A branch at position `p` with displacement `d` transfers control to
//! `p + d + 1`, so a zero displacement falls through.

use derive_more::Display;

/// Operation codes.
///
/// The declaration order is load-bearing: within an operator family the
/// operand-mode variants sit at fixed offsets (`AddRi` is `AddRr` plus the
/// same constant that `MulRi` is `MulRr` plus, and likewise for the
/// noncommutative `Ri`/`Ir` rows), so the compiler can select a variant by
/// adding an offset to the family base.  See [Opcode::offset].
#[derive(Clone, Copy, PartialEq, Eq, Debug, Display)]
#[repr(u8)]
pub enum Opcode {
    // Commutative binary instructions.
    #[display("addrr")]
    AddRr, // a <- b + c
    #[display("mulrr")]
    MulRr, // a <- b * c
    #[display("eqrr")]
    EqRr, // a <- b == c
    #[display("nerr")]
    NeRr, // a <- b != c
    #[display("addri")]
    AddRi, // a <- b + $c
    #[display("mulri")]
    MulRi, // a <- b * $c
    #[display("eqri")]
    EqRi, // a <- b == $c
    #[display("neri")]
    NeRi, // a <- b != $c
    // Noncommutative binary instructions.
    #[display("subrr")]
    SubRr, // a <- b - c
    #[display("divrr")]
    DivRr, // a <- b / c
    #[display("modrr")]
    ModRr, // a <- b % c
    #[display("ltrr")]
    LtRr, // a <- b < c
    #[display("lerr")]
    LeRr, // a <- b <= c
    #[display("subri")]
    SubRi, // a <- b - $c
    #[display("divri")]
    DivRi, // a <- b / $c
    #[display("modri")]
    ModRi, // a <- b % $c
    #[display("ltri")]
    LtRi, // a <- b < $c
    #[display("leri")]
    LeRi, // a <- b <= $c
    #[display("subir")]
    SubIr, // a <- $b - c
    #[display("divir")]
    DivIr, // a <- $b / c
    #[display("modir")]
    ModIr, // a <- $b % c
    #[display("ltir")]
    LtIr, // a <- $b < c
    #[display("leir")]
    LeIr, // a <- $b <= c
    // Unary instructions.
    #[display("neg")]
    Neg, // a <- -b
    #[display("not")]
    Not, // a <- !b
    // Move instructions.
    #[display("movi")]
    Movi, // a <- $d
    #[display("movr")]
    Movr, // a <- b
    // Jump instructions.
    #[display("jmp")]
    Jmp, // goto $d
    #[display("jt")]
    Jt, // if a != 0 goto $d
    #[display("jf")]
    Jf, // if a == 0 goto $d
    // Call/ret instructions.
    #[display("call")]
    Call, // a <- a(a + 1, a + 2, ..., a + b)
    #[display("retr")]
    Retr, // return a
    #[display("reti")]
    Reti, // return $d
    // System instructions.
    #[display("exit")]
    Exit, // exit(a)
    #[display("in")]
    In, // read a
    #[display("out")]
    Out, // print a
}

impl Opcode {
    /// Number of opcodes; they are dense over `0..COUNT`.
    pub const COUNT: usize = 36;

    /// The opcode `n` places after `self` in declaration order.  Used by the
    /// compiler to select an operand-mode variant from a family base.
    pub fn offset(self, n: u8) -> Opcode {
        OPCODES[self as usize + n as usize]
    }
}

const OPCODES: [Opcode; Opcode::COUNT] = [
    Opcode::AddRr,
    Opcode::MulRr,
    Opcode::EqRr,
    Opcode::NeRr,
    Opcode::AddRi,
    Opcode::MulRi,
    Opcode::EqRi,
    Opcode::NeRi,
    Opcode::SubRr,
    Opcode::DivRr,
    Opcode::ModRr,
    Opcode::LtRr,
    Opcode::LeRr,
    Opcode::SubRi,
    Opcode::DivRi,
    Opcode::ModRi,
    Opcode::LtRi,
    Opcode::LeRi,
    Opcode::SubIr,
    Opcode::DivIr,
    Opcode::ModIr,
    Opcode::LtIr,
    Opcode::LeIr,
    Opcode::Neg,
    Opcode::Not,
    Opcode::Movi,
    Opcode::Movr,
    Opcode::Jmp,
    Opcode::Jt,
    Opcode::Jf,
    Opcode::Call,
    Opcode::Retr,
    Opcode::Reti,
    Opcode::Exit,
    Opcode::In,
    Opcode::Out,
];

/// One 32-bit instruction word.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct Instruction {
    opcode: Opcode,
    a: u8,
    b: u8,
    c: u8,
}

const _: () = assert!(std::mem::size_of::<Instruction>() == std::mem::size_of::<u32>());

impl Instruction {
    /// Make an instruction with three register/immediate byte operands.
    pub fn abc(opcode: Opcode, a: u8, b: u8, c: u8) -> Instruction {
        Instruction { opcode, a, b, c }
    }

    /// Make an instruction with a register operand and a 16-bit immediate.
    pub fn ad(opcode: Opcode, a: u8, d: i16) -> Instruction {
        let [b, c] = d.to_ne_bytes();
        Instruction { opcode, a, b, c }
    }

    pub fn opcode(self) -> Opcode {
        self.opcode
    }

    pub fn a(self) -> u8 {
        self.a
    }

    pub fn b(self) -> u8 {
        self.b
    }

    pub fn c(self) -> u8 {
        self.c
    }

    /// The signed 16-bit field aliasing `b` and `c`.
    pub fn d(self) -> i16 {
        i16::from_ne_bytes([self.b, self.c])
    }

    /// Overwrite the `d` field, leaving opcode and `a` alone.  This is how
    /// the compiler patches forward branches.
    pub fn set_d(&mut self, d: i16) {
        [self.b, self.c] = d.to_ne_bytes();
    }
}

impl std::fmt::Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use Opcode::*;

        let op = self.opcode;
        match op {
            AddRr | MulRr | EqRr | NeRr | SubRr | DivRr | ModRr | LtRr | LeRr => {
                write!(f, "{op} r{}, r{}, r{}", self.a, self.b, self.c)
            }
            AddRi | MulRi | EqRi | NeRi | SubRi | DivRi | ModRi | LtRi | LeRi => {
                write!(f, "{op} r{}, r{}, {}", self.a, self.b, self.c as i8)
            }
            SubIr | DivIr | ModIr | LtIr | LeIr => {
                write!(f, "{op} r{}, {}, r{}", self.a, self.b as i8, self.c)
            }
            Neg | Not | Movr => write!(f, "{op} r{}, r{}", self.a, self.b),
            Movi => write!(f, "{op} r{}, {}", self.a, self.d()),
            Jmp => write!(f, "{op} {}", self.d()),
            Jt | Jf => write!(f, "{op} r{}, {}", self.a, self.d()),
            Call => write!(f, "{op} r{}, {}", self.a, self.b),
            Retr | Exit | In | Out => write!(f, "{op} r{}", self.a),
            Reti => write!(f, "{op} {}", self.d()),
        }
    }
}

impl std::fmt::Debug for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self}")
    }
}
