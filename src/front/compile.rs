//! The compiler: a recursive-descent parser that emits final bytecode while
//! it parses.
//!
//! There is no AST and no intermediate representation.  Each grammar
//! production compiles its construct directly into the instruction vector,
//! so the whole translation is one pass over the tokens, preceded by a
//! lightweight discovery pass that only collects function names and arities
//! (bodies are skipped by brace matching).  Function entry positions become
//! known as the second pass reaches them, and every call site is patched at
//! the end once all entries are fixed.
//!
//! # Expressions and registers
//!
//! An expression under compilation is a [Value]: either a constant folded at
//! compile time or the register holding the result.  Registers are a bump
//! cursor per function: variables occupy the low registers in declaration
//! order, temporaries are pushed above them and popped as soon as an
//! operation consumes its operands.  At every statement boundary the cursor
//! is back at the first register above the live variables.
//!
//! Binary operators prefer the immediate instruction forms when one operand
//! is a constant fitting 8 bits; commutative operators swap a constant left
//! operand to the right, noncommutative ones use the dedicated
//! immediate-left forms.  There are no greater-than instructions at all:
//! `a > b` compiles as `b < a`.
//!
//! # Forward branches
//!
//! A branch whose target is not yet known joins a [JumpList]: the chain of
//! pending branches is threaded through their own displacement fields, and
//! patching walks the chain once the target position is reached.  `if`
//! chains keep one list for the current arm's false edge and one for the
//! jumps past the whole chain; `while` patches its false list after the
//! back-jump to the loop head.
//!
//! # Calls
//!
//! A call reserves a header register, loads it with the callee's entry
//! (encoded relative to the call instruction, which the patch pass fixes
//! up), compiles the arguments into the registers right above the header,
//! and emits [Opcode::Call].  The interpreter leaves the return value in the
//! header register, which is the value of the call expression.

use derive_more::Display;

use crate::back::code::{Instruction, Opcode};
use crate::common::{Id, Map};
use crate::front::lex::{LexError, Token, Tokens};

/// Compile a whole program to bytecode.
///
/// The returned vector starts with a three-instruction prologue that calls
/// `main` and exits with its return value, so position 0 is the entry point
/// of the compiled program.
pub fn compile(source: &str) -> Result<Vec<Instruction>, CompileError> {
    let tokens = Tokens::lex(source)?;
    Compiler::new(tokens).run()
}

#[derive(Display)]
pub enum CompileError {
    #[display("{_0}")]
    Lex(LexError),
    #[display("Parse error: unexpected {found}, expected {expected}, at byte {pos}")]
    Unexpected {
        pos: usize,
        found: String,
        expected: &'static str,
    },
    #[display("Compile error: undefined variable `{name}` at byte {pos}")]
    UndefinedVariable { pos: usize, name: Id },
    #[display("Compile error: undefined function `{name}` at byte {pos}")]
    UndefinedFunction { pos: usize, name: Id },
    #[display("Compile error: variable `{name}` is already defined in this scope, at byte {pos}")]
    DuplicateVariable { pos: usize, name: Id },
    #[display("Compile error: function `{name}` is already defined, at byte {pos}")]
    DuplicateFunction { pos: usize, name: Id },
    #[display(
        "Compile error: `{name}` takes {expected} argument(s) but {found} were passed, at byte {pos}"
    )]
    ArityMismatch {
        pos: usize,
        name: Id,
        expected: usize,
        found: usize,
    },
    #[display("Compile error: division by zero in a constant expression at byte {pos}")]
    DivisionByZero { pos: usize },
    #[display("Compile error: expression too complex, out of registers at byte {pos}")]
    TooManyRegisters { pos: usize },
    #[display("Compile error: function `{name}` has too many parameters at byte {pos}")]
    TooManyParameters { pos: usize, name: Id },
    #[display("Compile error: branch displacement out of range at instruction {at}")]
    JumpOutOfRange { at: usize },
    #[display("Compile error: no `main` function")]
    MissingMain,
}

impl std::fmt::Debug for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self}")
    }
}

impl From<LexError> for CompileError {
    fn from(error: LexError) -> CompileError {
        CompileError::Lex(error)
    }
}

/// An expression under compilation: either a constant known at compile time
/// or the register its result lives in.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Value {
    Const(i64),
    Reg(u8),
}

/// Binary operators.  The declaration order mirrors the opcode table so
/// that instruction selection is base opcode plus operator index; `Gt` and
/// `Ge` have no instructions and are rewritten by swapping operands.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum BinOp {
    // Commutative.
    Add,
    Mul,
    Eq,
    Ne,
    // Noncommutative.
    Sub,
    Div,
    Mod,
    Lt,
    Le,
    // Without corresponding instructions.
    Gt,
    Ge,
}

// These relations must hold, otherwise opcode selection emits wrong code.
const _: () = {
    assert!(BinOp::Mul as u8 - BinOp::Add as u8 == Opcode::MulRr as u8 - Opcode::AddRr as u8);
    assert!(BinOp::Eq as u8 - BinOp::Add as u8 == Opcode::EqRr as u8 - Opcode::AddRr as u8);
    assert!(BinOp::Ne as u8 - BinOp::Add as u8 == Opcode::NeRr as u8 - Opcode::AddRr as u8);
    assert!(BinOp::Mul as u8 - BinOp::Add as u8 == Opcode::MulRi as u8 - Opcode::AddRi as u8);
    assert!(BinOp::Eq as u8 - BinOp::Add as u8 == Opcode::EqRi as u8 - Opcode::AddRi as u8);
    assert!(BinOp::Ne as u8 - BinOp::Add as u8 == Opcode::NeRi as u8 - Opcode::AddRi as u8);
    assert!(BinOp::Div as u8 - BinOp::Sub as u8 == Opcode::DivRr as u8 - Opcode::SubRr as u8);
    assert!(BinOp::Mod as u8 - BinOp::Sub as u8 == Opcode::ModRr as u8 - Opcode::SubRr as u8);
    assert!(BinOp::Lt as u8 - BinOp::Sub as u8 == Opcode::LtRr as u8 - Opcode::SubRr as u8);
    assert!(BinOp::Le as u8 - BinOp::Sub as u8 == Opcode::LeRr as u8 - Opcode::SubRr as u8);
    assert!(BinOp::Div as u8 - BinOp::Sub as u8 == Opcode::DivRi as u8 - Opcode::SubRi as u8);
    assert!(BinOp::Mod as u8 - BinOp::Sub as u8 == Opcode::ModRi as u8 - Opcode::SubRi as u8);
    assert!(BinOp::Lt as u8 - BinOp::Sub as u8 == Opcode::LtRi as u8 - Opcode::SubRi as u8);
    assert!(BinOp::Le as u8 - BinOp::Sub as u8 == Opcode::LeRi as u8 - Opcode::SubRi as u8);
    assert!(BinOp::Div as u8 - BinOp::Sub as u8 == Opcode::DivIr as u8 - Opcode::SubIr as u8);
    assert!(BinOp::Mod as u8 - BinOp::Sub as u8 == Opcode::ModIr as u8 - Opcode::SubIr as u8);
    assert!(BinOp::Lt as u8 - BinOp::Sub as u8 == Opcode::LtIr as u8 - Opcode::SubIr as u8);
    assert!(BinOp::Le as u8 - BinOp::Sub as u8 == Opcode::LeIr as u8 - Opcode::SubIr as u8);
    assert!(BinOp::Ge as u8 - BinOp::Gt as u8 == BinOp::Le as u8 - BinOp::Lt as u8);
    assert!(UnOp::Not as u8 - UnOp::Neg as u8 == Opcode::Not as u8 - Opcode::Neg as u8);
};

impl BinOp {
    fn is_commutative(self) -> bool {
        (self as u8) < BinOp::Sub as u8
    }

    /// The register-register instruction for this operator.
    fn rr(self) -> Opcode {
        debug_assert!(self != BinOp::Gt && self != BinOp::Ge);
        if self.is_commutative() {
            Opcode::AddRr.offset(self as u8 - BinOp::Add as u8)
        } else {
            Opcode::SubRr.offset(self as u8 - BinOp::Sub as u8)
        }
    }

    /// The register-immediate instruction for this operator.
    fn ri(self) -> Opcode {
        debug_assert!(self != BinOp::Gt && self != BinOp::Ge);
        if self.is_commutative() {
            Opcode::AddRi.offset(self as u8 - BinOp::Add as u8)
        } else {
            Opcode::SubRi.offset(self as u8 - BinOp::Sub as u8)
        }
    }

    /// The immediate-register instruction; only noncommutative operators
    /// have one.
    fn ir(self) -> Opcode {
        debug_assert!(!self.is_commutative() && self != BinOp::Gt && self != BinOp::Ge);
        Opcode::SubIr.offset(self as u8 - BinOp::Sub as u8)
    }
}

/// Unary operators, in opcode order.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum UnOp {
    Neg,
    Not,
}

impl UnOp {
    fn opcode(self) -> Opcode {
        Opcode::Neg.offset(self as u8 - UnOp::Neg as u8)
    }
}

/// Binary operator and precedence for a token, if it is one.
fn binary_op(token: Token) -> Option<(BinOp, u8)> {
    let op = match token {
        Token::EqEq => (BinOp::Eq, 1),
        Token::Ne => (BinOp::Ne, 1),
        Token::Lt => (BinOp::Lt, 2),
        Token::Le => (BinOp::Le, 2),
        Token::Gt => (BinOp::Gt, 2),
        Token::Ge => (BinOp::Ge, 2),
        Token::Plus => (BinOp::Add, 3),
        Token::Minus => (BinOp::Sub, 3),
        Token::Star => (BinOp::Mul, 4),
        Token::Slash => (BinOp::Div, 4),
        Token::Percent => (BinOp::Mod, 4),
        _ => return None,
    };
    Some(op)
}

/// Does the constant fit the 8-bit immediate operand of the `-Ri`/`-Ir`
/// instruction forms?
fn fits_imm(value: i64) -> bool {
    i8::try_from(value).is_ok()
}

fn fold_unary_op(op: UnOp, value: i64) -> i64 {
    match op {
        UnOp::Neg => value.wrapping_neg(),
        UnOp::Not => (value == 0) as i64,
    }
}

/// A chain of emitted forward branches whose shared target is not yet
/// known.  The chain is threaded through the branches' own displacement
/// fields: the list head is the most recently added branch, each branch's
/// `d` holds the offset back to the previous one, and zero terminates the
/// chain (a branch never links to itself).
#[derive(Clone, Copy)]
struct JumpList(Option<usize>);

impl JumpList {
    const EMPTY: JumpList = JumpList(None);
}

/// Number of instructions reserved at position 0 for the startup sequence
/// that calls `main` and exits with its result.
const PROLOGUE_LEN: usize = 3;

/// Parameters go in registers `0..arity`, and every register index must
/// stay below 255.
const MAX_ARITY: usize = 254;

/// Entry placeholder for functions discovered but not yet compiled.
const ENTRY_UNKNOWN: usize = usize::MAX;

#[derive(Clone, Copy)]
struct Function {
    entry: usize,
    arity: usize,
}

/// A compiled call, remembered so the header load can be patched to the
/// callee's entry once all entries are known.
#[derive(Clone, Copy)]
struct CallSite {
    movi: usize,
    call: usize,
    callee: Id,
}

struct Compiler {
    tokens: Tokens,
    bytecode: Vec<Instruction>,
    /// Defined functions with their entry positions and arities.
    functions: Map<Id, Function>,
    /// Registers of the variables visible right now.
    variables: Map<Id, u8>,
    /// Undo log for `variables`: declarations in order, with the binding
    /// each one shadowed.  Blocks truncate it back on exit.
    declarations: Vec<(Id, Option<u8>)>,
    calls: Vec<CallSite>,
    /// Index into `declarations` where the innermost scope begins.
    scope_start: usize,
    first_free_reg: u8,
    num_variables: u8,
}

impl Compiler {
    fn new(tokens: Tokens) -> Compiler {
        Compiler {
            tokens,
            bytecode: Vec::new(),
            functions: Map::new(),
            variables: Map::new(),
            declarations: Vec::new(),
            calls: Vec::new(),
            scope_start: 0,
            first_free_reg: 0,
            num_variables: 0,
        }
    }

    fn run(mut self) -> Result<Vec<Instruction>, CompileError> {
        self.first_pass()?;
        self.tokens.reset();
        self.second_pass()?;
        Ok(self.bytecode)
    }

    // Discovers every function definition, recording name and arity;
    // bodies are skipped.
    fn first_pass(&mut self) -> Result<(), CompileError> {
        while self.tokens.peek() != Token::Eof {
            self.expect(Token::Fn, "`fn`")?;
            let pos = self.tokens.pos();
            let name = self.expect_ident("a function name")?;
            self.expect(Token::LParen, "`(`")?;
            let mut arity = 0;
            if self.tokens.peek() != Token::RParen {
                loop {
                    self.expect_ident("a parameter name")?;
                    arity += 1;
                    if self.tokens.peek() == Token::Comma {
                        self.tokens.advance();
                    } else {
                        break;
                    }
                }
            }
            self.expect(Token::RParen, "`)`")?;
            if arity > MAX_ARITY {
                return Err(CompileError::TooManyParameters { pos, name });
            }
            let function = Function {
                entry: ENTRY_UNKNOWN,
                arity,
            };
            if self.functions.insert(name, function).is_some() {
                return Err(CompileError::DuplicateFunction { pos, name });
            }
            self.skip_block()?;
        }
        Ok(())
    }

    // Skips a balanced `{ ... }` without compiling anything.
    fn skip_block(&mut self) -> Result<(), CompileError> {
        self.expect(Token::LBrace, "`{`")?;
        let mut depth = 1;
        loop {
            match self.tokens.advance() {
                Token::LBrace => depth += 1,
                Token::RBrace => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(());
                    }
                }
                Token::Eof => return Err(self.unexpected("`}`")),
                _ => {}
            }
        }
    }

    // Emits all function bodies, then fills in the prologue and patches
    // every call site.
    fn second_pass(&mut self) -> Result<(), CompileError> {
        for _ in 0..PROLOGUE_LEN {
            self.emit(Instruction::ad(Opcode::Movi, 0, 0));
        }
        while self.tokens.peek() != Token::Eof {
            self.parse_fn()?;
        }
        let main = Id::new("main".to_owned());
        let function = match self.functions.get(&main) {
            Some(function) => *function,
            None => return Err(CompileError::MissingMain),
        };
        self.bytecode[0] = Instruction::ad(Opcode::Movi, 0, 0);
        self.bytecode[1] = Instruction::abc(Opcode::Call, 0, function.arity as u8, 0);
        self.bytecode[2] = Instruction::abc(Opcode::Exit, 0, 0, 0);
        self.calls.push(CallSite {
            movi: 0,
            call: 1,
            callee: main,
        });
        self.patch_calls()
    }

    // Patches every recorded header load to the displacement from its call
    // instruction to the callee's entry.
    fn patch_calls(&mut self) -> Result<(), CompileError> {
        let calls = std::mem::take(&mut self.calls);
        for site in calls {
            let entry = self.functions[&site.callee].entry;
            debug_assert_ne!(entry, ENTRY_UNKNOWN);
            let d = i16::try_from(entry as i64 - site.call as i64 - 1)
                .map_err(|_| CompileError::JumpOutOfRange { at: site.call })?;
            self.bytecode[site.movi].set_d(d);
        }
        Ok(())
    }

    // fn -> FN IDENTIFIER '(' arguments ')' block
    fn parse_fn(&mut self) -> Result<(), CompileError> {
        self.expect(Token::Fn, "`fn`")?;
        let name = self.expect_ident("a function name")?;
        let entry = self.pc();
        if let Some(function) = self.functions.get_mut(&name) {
            function.entry = entry;
        }
        self.variables.clear();
        self.declarations.clear();
        self.scope_start = 0;
        self.first_free_reg = 0;
        self.num_variables = 0;
        self.expect(Token::LParen, "`(`")?;
        if self.tokens.peek() != Token::RParen {
            loop {
                let pos = self.tokens.pos();
                let parameter = self.expect_ident("a parameter name")?;
                let reg = self.first_free_reg;
                if self.variables.insert(parameter, reg).is_some() {
                    return Err(CompileError::DuplicateVariable {
                        pos,
                        name: parameter,
                    });
                }
                self.declarations.push((parameter, None));
                self.first_free_reg += 1;
                self.num_variables += 1;
                if self.tokens.peek() == Token::Comma {
                    self.tokens.advance();
                } else {
                    break;
                }
            }
        }
        self.expect(Token::RParen, "`)`")?;
        self.parse_block()?;
        // A body that falls off the end returns zero.
        self.emit(Instruction::ad(Opcode::Reti, 0, 0));
        Ok(())
    }

    // block -> '{' { statement } '}'
    //
    // Declarations inside the block go out of scope at the closing brace,
    // and their registers are handed back.
    fn parse_block(&mut self) -> Result<(), CompileError> {
        self.expect(Token::LBrace, "`{`")?;
        let saved_regs = (self.first_free_reg, self.num_variables);
        let saved_scope = (self.scope_start, self.declarations.len());
        self.scope_start = self.declarations.len();
        while self.tokens.peek() != Token::RBrace {
            if self.tokens.peek() == Token::Eof {
                return Err(self.unexpected("`}`"));
            }
            self.parse_statement()?;
        }
        self.tokens.advance();
        while self.declarations.len() > saved_scope.1 {
            if let Some((name, shadowed)) = self.declarations.pop() {
                match shadowed {
                    Some(reg) => self.variables.insert(name, reg),
                    None => self.variables.remove(&name),
                };
            }
        }
        (self.first_free_reg, self.num_variables) = saved_regs;
        self.scope_start = saved_scope.0;
        Ok(())
    }

    // statement -> block | if | in | let | out | return | while |
    //              assignment_or_call
    fn parse_statement(&mut self) -> Result<(), CompileError> {
        match self.tokens.peek() {
            Token::LBrace => self.parse_block(),
            Token::If => self.parse_if(),
            Token::In => self.parse_in(),
            Token::Let => self.parse_let(),
            Token::Out => self.parse_out(),
            Token::Return => self.parse_return(),
            Token::While => self.parse_while(),
            Token::Ident(_) => self.parse_assignment_or_call(),
            _ => Err(self.unexpected("a statement")),
        }
    }

    // cond_block -> expr block
    //
    // Returns the jump list taken when the condition is false.  A constant
    // condition needs no test at all: a true one falls through into the
    // block, a false one skips it with an unconditional jump.
    fn parse_cond_block(&mut self) -> Result<JumpList, CompileError> {
        let cond = self.parse_expr()?;
        let mut false_list = JumpList::EMPTY;
        match cond {
            Value::Const(0) => {
                let jump = self.emit(Instruction::ad(Opcode::Jmp, 0, 0));
                self.append_jump(&mut false_list, jump)?;
            }
            Value::Const(_) => {}
            Value::Reg(reg) => {
                let jump = self.emit(Instruction::abc(Opcode::Jf, reg, 0, 0));
                self.append_jump(&mut false_list, jump)?;
                self.free_reg(reg);
            }
        }
        self.parse_block()?;
        Ok(false_list)
    }

    // if -> IF cond_block { ELSE IF cond_block } [ ELSE block ]
    fn parse_if(&mut self) -> Result<(), CompileError> {
        self.tokens.advance();
        let mut end_list = JumpList::EMPTY;
        let mut false_list = self.parse_cond_block()?;
        while self.tokens.peek() == Token::Else {
            self.tokens.advance();
            // The taken arm jumps past the rest of the chain.
            let jump = self.emit(Instruction::ad(Opcode::Jmp, 0, 0));
            self.append_jump(&mut end_list, jump)?;
            self.patch_jump_list_to_here(false_list)?;
            false_list = JumpList::EMPTY;
            if self.tokens.peek() == Token::If {
                self.tokens.advance();
                false_list = self.parse_cond_block()?;
            } else {
                self.parse_block()?;
                break;
            }
        }
        self.patch_jump_list_to_here(false_list)?;
        self.patch_jump_list_to_here(end_list)?;
        Ok(())
    }

    // while -> WHILE cond_block
    fn parse_while(&mut self) -> Result<(), CompileError> {
        self.tokens.advance();
        let head = self.pc();
        let false_list = self.parse_cond_block()?;
        let back = self.emit(Instruction::ad(Opcode::Jmp, 0, 0));
        self.patch_single_jump(back, head)?;
        self.patch_jump_list_to_here(false_list)?;
        Ok(())
    }

    // in -> IN IDENTIFIER ';'
    fn parse_in(&mut self) -> Result<(), CompileError> {
        self.tokens.advance();
        let pos = self.tokens.pos();
        let name = self.expect_ident("a variable name")?;
        let reg = match self.variables.get(&name) {
            Some(&reg) => reg,
            None => return Err(CompileError::UndefinedVariable { pos, name }),
        };
        self.emit(Instruction::abc(Opcode::In, reg, 0, 0));
        self.expect(Token::Semi, "`;`")
    }

    // let -> LET IDENTIFIER '=' expr ';'
    fn parse_let(&mut self) -> Result<(), CompileError> {
        self.tokens.advance();
        let pos = self.tokens.pos();
        let name = self.expect_ident("a variable name")?;
        if self.declarations[self.scope_start..]
            .iter()
            .any(|(declared, _)| *declared == name)
        {
            return Err(CompileError::DuplicateVariable { pos, name });
        }
        self.expect(Token::Assign, "`=`")?;
        let value = self.parse_expr()?;
        let reg = self.value_to_next_reg(value)?;
        self.num_variables += 1;
        let shadowed = self.variables.insert(name, reg);
        self.declarations.push((name, shadowed));
        self.expect(Token::Semi, "`;`")
    }

    // out -> OUT expr ';'
    fn parse_out(&mut self) -> Result<(), CompileError> {
        self.tokens.advance();
        let value = self.parse_expr()?;
        let reg = self.value_to_any_reg(value)?;
        self.emit(Instruction::abc(Opcode::Out, reg, 0, 0));
        self.free_reg(reg);
        self.expect(Token::Semi, "`;`")
    }

    // return -> RETURN expr ';'
    fn parse_return(&mut self) -> Result<(), CompileError> {
        self.tokens.advance();
        let value = self.parse_expr()?;
        match value {
            Value::Const(k) if i16::try_from(k).is_ok() => {
                self.emit(Instruction::ad(Opcode::Reti, 0, k as i16));
            }
            value => {
                let reg = self.value_to_any_reg(value)?;
                self.emit(Instruction::abc(Opcode::Retr, reg, 0, 0));
                self.free_reg(reg);
            }
        }
        self.expect(Token::Semi, "`;`")
    }

    // assignment_or_call -> IDENTIFIER '=' expr ';' |
    //                       IDENTIFIER '(' parameters ')' ';'
    fn parse_assignment_or_call(&mut self) -> Result<(), CompileError> {
        let pos = self.tokens.pos();
        let name = self.expect_ident("an identifier")?;
        match self.tokens.peek() {
            Token::LParen => {
                let result = self.parse_call_expr(name, pos)?;
                self.free_value(result);
            }
            Token::Assign => {
                self.tokens.advance();
                let reg = match self.variables.get(&name) {
                    Some(&reg) => reg,
                    None => return Err(CompileError::UndefinedVariable { pos, name }),
                };
                let value = self.parse_expr()?;
                self.value_to_reg(value, reg)?;
                self.free_value(value);
            }
            _ => return Err(self.unexpected("`=` or `(`")),
        }
        self.expect(Token::Semi, "`;`")
    }

    // expr -> binary_expr
    fn parse_expr(&mut self) -> Result<Value, CompileError> {
        self.parse_binary_expr(0)
    }

    // binary_expr -> unary_expr [ ( '+' | '-' | ... ) binary_expr ]
    //
    // Precedence climbing: only operators binding tighter than `limit` are
    // consumed at this level.
    fn parse_binary_expr(&mut self, limit: u8) -> Result<Value, CompileError> {
        let mut lhs = self.parse_unary_expr()?;
        while let Some((op, precedence)) = binary_op(self.tokens.peek()) {
            if precedence <= limit {
                break;
            }
            self.tokens.advance();
            let rhs = self.parse_binary_expr(precedence)?;
            lhs = self.emit_binary_op(op, lhs, rhs)?;
        }
        Ok(lhs)
    }

    // unary_expr -> [ '!' | '-' ] primary_expr
    fn parse_unary_expr(&mut self) -> Result<Value, CompileError> {
        let op = match self.tokens.peek() {
            Token::Minus => UnOp::Neg,
            Token::Bang => UnOp::Not,
            _ => return self.parse_primary_expr(),
        };
        self.tokens.advance();
        let value = self.parse_primary_expr()?;
        self.emit_unary_op(op, value)
    }

    // primary_expr -> identifier_expr | integer_literal_expr |
    //                 parentheses_expr
    fn parse_primary_expr(&mut self) -> Result<Value, CompileError> {
        match self.tokens.peek() {
            Token::Int(value) => {
                self.tokens.advance();
                Ok(Value::Const(value))
            }
            Token::Ident(_) => self.parse_identifier_expr(),
            Token::LParen => {
                self.tokens.advance();
                let value = self.parse_expr()?;
                self.expect(Token::RParen, "`)`")?;
                Ok(value)
            }
            _ => Err(self.unexpected("an expression")),
        }
    }

    // identifier_expr -> IDENTIFIER [ '(' parameters ')' ]
    fn parse_identifier_expr(&mut self) -> Result<Value, CompileError> {
        let pos = self.tokens.pos();
        let name = self.expect_ident("an identifier")?;
        if self.tokens.peek() == Token::LParen {
            return self.parse_call_expr(name, pos);
        }
        match self.variables.get(&name) {
            Some(&reg) => Ok(Value::Reg(reg)),
            None => Err(CompileError::UndefinedVariable { pos, name }),
        }
    }

    // parameters -> <none> | expr { ',' expr }
    //
    // Reserves the header register, loads it with the callee entry (patched
    // later), and compiles the arguments into the registers right above it.
    fn parse_call_expr(&mut self, name: Id, pos: usize) -> Result<Value, CompileError> {
        let arity = match self.functions.get(&name) {
            Some(function) => function.arity,
            None => return Err(CompileError::UndefinedFunction { pos, name }),
        };
        let header = self.alloc_reg()?;
        let movi = self.emit(Instruction::ad(Opcode::Movi, header, 0));
        self.expect(Token::LParen, "`(`")?;
        let mut found = 0;
        if self.tokens.peek() != Token::RParen {
            loop {
                let value = self.parse_expr()?;
                self.value_to_next_reg(value)?;
                found += 1;
                if self.tokens.peek() == Token::Comma {
                    self.tokens.advance();
                } else {
                    break;
                }
            }
        }
        self.expect(Token::RParen, "`)`")?;
        if found != arity {
            return Err(CompileError::ArityMismatch {
                pos,
                name,
                expected: arity,
                found,
            });
        }
        let call = self.emit(Instruction::abc(Opcode::Call, header, found as u8, 0));
        self.calls.push(CallSite {
            movi,
            call,
            callee: name,
        });
        // The argument registers die with the call; the header keeps the
        // return value.
        self.first_free_reg = header + 1;
        Ok(Value::Reg(header))
    }

    fn emit_unary_op(&mut self, op: UnOp, value: Value) -> Result<Value, CompileError> {
        if let Value::Const(k) = value {
            return Ok(Value::Const(fold_unary_op(op, k)));
        }
        let operand = self.value_to_any_reg(value)?;
        self.free_reg(operand);
        let dest = self.alloc_reg()?;
        self.emit(Instruction::abc(op.opcode(), dest, operand, 0));
        Ok(Value::Reg(dest))
    }

    fn emit_binary_op(&mut self, op: BinOp, lhs: Value, rhs: Value) -> Result<Value, CompileError> {
        if let (Value::Const(a), Value::Const(b)) = (lhs, rhs) {
            return Ok(Value::Const(self.fold_binary_op(op, a, b)?));
        }
        // There are no greater-than instructions; swap the operands.
        let (op, lhs, rhs) = match op {
            BinOp::Gt => (BinOp::Lt, rhs, lhs),
            BinOp::Ge => (BinOp::Le, rhs, lhs),
            _ => (op, lhs, rhs),
        };
        if op.is_commutative() {
            self.emit_commutative_op(op, lhs, rhs)
        } else {
            self.emit_noncommutative_op(op, lhs, rhs)
        }
    }

    fn emit_commutative_op(
        &mut self,
        op: BinOp,
        lhs: Value,
        rhs: Value,
    ) -> Result<Value, CompileError> {
        match (lhs, rhs) {
            (operand, Value::Const(k)) | (Value::Const(k), operand) if fits_imm(k) => {
                let b = self.value_to_any_reg(operand)?;
                self.free_reg(b);
                let dest = self.alloc_reg()?;
                self.emit(Instruction::abc(op.ri(), dest, b, k as i8 as u8));
                Ok(Value::Reg(dest))
            }
            (lhs, rhs) => {
                let (b, c) = self.binary_operands(lhs, rhs)?;
                let dest = self.alloc_reg()?;
                self.emit(Instruction::abc(op.rr(), dest, b, c));
                Ok(Value::Reg(dest))
            }
        }
    }

    fn emit_noncommutative_op(
        &mut self,
        op: BinOp,
        lhs: Value,
        rhs: Value,
    ) -> Result<Value, CompileError> {
        match (lhs, rhs) {
            (lhs, Value::Const(k)) if fits_imm(k) => {
                let b = self.value_to_any_reg(lhs)?;
                self.free_reg(b);
                let dest = self.alloc_reg()?;
                self.emit(Instruction::abc(op.ri(), dest, b, k as i8 as u8));
                Ok(Value::Reg(dest))
            }
            (Value::Const(k), rhs) if fits_imm(k) => {
                let c = self.value_to_any_reg(rhs)?;
                self.free_reg(c);
                let dest = self.alloc_reg()?;
                self.emit(Instruction::abc(op.ir(), dest, k as i8 as u8, c));
                Ok(Value::Reg(dest))
            }
            (lhs, rhs) => {
                let (b, c) = self.binary_operands(lhs, rhs)?;
                let dest = self.alloc_reg()?;
                self.emit(Instruction::abc(op.rr(), dest, b, c));
                Ok(Value::Reg(dest))
            }
        }
    }

    // Materializes both operands and frees their temporaries, leaving the
    // cursor ready for the destination.  The right operand was allocated
    // last, so it is freed first.
    fn binary_operands(&mut self, lhs: Value, rhs: Value) -> Result<(u8, u8), CompileError> {
        let b = self.value_to_any_reg(lhs)?;
        let c = self.value_to_any_reg(rhs)?;
        self.free_reg(c);
        self.free_reg(b);
        Ok((b, c))
    }

    fn fold_binary_op(&self, op: BinOp, lhs: i64, rhs: i64) -> Result<i64, CompileError> {
        let value = match op {
            BinOp::Add => lhs.wrapping_add(rhs),
            BinOp::Mul => lhs.wrapping_mul(rhs),
            BinOp::Sub => lhs.wrapping_sub(rhs),
            BinOp::Div | BinOp::Mod if rhs == 0 => {
                return Err(CompileError::DivisionByZero {
                    pos: self.tokens.pos(),
                });
            }
            BinOp::Div => lhs.wrapping_div(rhs),
            BinOp::Mod => lhs.wrapping_rem(rhs),
            BinOp::Eq => (lhs == rhs) as i64,
            BinOp::Ne => (lhs != rhs) as i64,
            BinOp::Lt => (lhs < rhs) as i64,
            BinOp::Le => (lhs <= rhs) as i64,
            BinOp::Gt => (lhs > rhs) as i64,
            BinOp::Ge => (lhs >= rhs) as i64,
        };
        Ok(value)
    }

    /// Stores the value into the given register.
    fn value_to_reg(&mut self, value: Value, reg: u8) -> Result<(), CompileError> {
        match value {
            Value::Const(k) => self.materialize_const(reg, k)?,
            Value::Reg(src) if src != reg => {
                self.emit(Instruction::abc(Opcode::Movr, reg, src, 0));
            }
            Value::Reg(_) => {}
        }
        Ok(())
    }

    /// Stores the value into the next free register.
    fn value_to_next_reg(&mut self, value: Value) -> Result<u8, CompileError> {
        self.free_value(value);
        let reg = self.alloc_reg()?;
        self.value_to_reg(value, reg)?;
        Ok(reg)
    }

    /// Stores the value into any register.
    fn value_to_any_reg(&mut self, value: Value) -> Result<u8, CompileError> {
        match value {
            Value::Reg(reg) => Ok(reg),
            Value::Const(_) => self.value_to_next_reg(value),
        }
    }

    /// Loads a constant into `reg`.  Constants beyond the 16-bit `movi`
    /// range are built from their base-10000 digits with one scratch
    /// register; signed digits make the reconstruction exact for every
    /// 64-bit value.
    fn materialize_const(&mut self, reg: u8, value: i64) -> Result<(), CompileError> {
        if let Ok(d) = i16::try_from(value) {
            self.emit(Instruction::ad(Opcode::Movi, reg, d));
            return Ok(());
        }
        let mut digits = Vec::new();
        let mut rest = value;
        while rest != 0 {
            digits.push((rest % 10_000) as i16);
            rest /= 10_000;
        }
        let scratch = self.alloc_reg()?;
        let mut digits = digits.into_iter().rev();
        let leading = digits.next().unwrap_or(0);
        self.emit(Instruction::ad(Opcode::Movi, reg, leading));
        for digit in digits {
            self.emit(Instruction::ad(Opcode::Movi, scratch, 10_000));
            self.emit(Instruction::abc(Opcode::MulRr, reg, reg, scratch));
            self.emit(Instruction::ad(Opcode::Movi, scratch, digit));
            self.emit(Instruction::abc(Opcode::AddRr, reg, reg, scratch));
        }
        self.free_reg(scratch);
        Ok(())
    }

    fn alloc_reg(&mut self) -> Result<u8, CompileError> {
        if self.first_free_reg == u8::MAX {
            return Err(CompileError::TooManyRegisters {
                pos: self.tokens.pos(),
            });
        }
        let reg = self.first_free_reg;
        self.first_free_reg += 1;
        Ok(reg)
    }

    /// Hands back a temporary register.  Variable registers stay put.
    fn free_reg(&mut self, reg: u8) {
        if reg >= self.num_variables {
            self.first_free_reg -= 1;
            debug_assert_eq!(self.first_free_reg, reg);
        }
    }

    fn free_value(&mut self, value: Value) {
        if let Value::Reg(reg) = value {
            self.free_reg(reg);
        }
    }

    fn emit(&mut self, instruction: Instruction) -> usize {
        let pos = self.bytecode.len();
        self.bytecode.push(instruction);
        pos
    }

    /// The position the next instruction will be emitted at.
    fn pc(&self) -> usize {
        self.bytecode.len()
    }

    /// Links the branch at `pos` into the list as its new head.
    fn append_jump(&mut self, list: &mut JumpList, pos: usize) -> Result<(), CompileError> {
        let d = match list.0 {
            None => 0,
            Some(previous) => i16::try_from(previous as i64 - pos as i64)
                .map_err(|_| CompileError::JumpOutOfRange { at: pos })?,
        };
        self.bytecode[pos].set_d(d);
        list.0 = Some(pos);
        Ok(())
    }

    /// The branch before `pos` on its jump list, if any.
    fn next_jump(&self, pos: usize) -> Option<usize> {
        match self.bytecode[pos].d() {
            0 => None,
            d => Some((pos as i64 + d as i64) as usize),
        }
    }

    fn patch_single_jump(&mut self, pos: usize, target: usize) -> Result<(), CompileError> {
        let d = i16::try_from(target as i64 - pos as i64 - 1)
            .map_err(|_| CompileError::JumpOutOfRange { at: pos })?;
        self.bytecode[pos].set_d(d);
        Ok(())
    }

    fn patch_jump_list(&mut self, list: JumpList, target: usize) -> Result<(), CompileError> {
        let mut head = list.0;
        while let Some(pos) = head {
            head = self.next_jump(pos);
            self.patch_single_jump(pos, target)?;
        }
        Ok(())
    }

    fn patch_jump_list_to_here(&mut self, list: JumpList) -> Result<(), CompileError> {
        let target = self.pc();
        self.patch_jump_list(list, target)
    }

    fn expect(&mut self, token: Token, expected: &'static str) -> Result<(), CompileError> {
        if self.tokens.peek() == token {
            self.tokens.advance();
            Ok(())
        } else {
            Err(self.unexpected(expected))
        }
    }

    fn expect_ident(&mut self, expected: &'static str) -> Result<Id, CompileError> {
        match self.tokens.peek() {
            Token::Ident(name) => {
                self.tokens.advance();
                Ok(name)
            }
            _ => Err(self.unexpected(expected)),
        }
    }

    fn unexpected(&self, expected: &'static str) -> CompileError {
        CompileError::Unexpected {
            pos: self.tokens.pos(),
            found: self.tokens.peek().to_string(),
            expected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn program(source: &str) -> Vec<Instruction> {
        let bytecode = compile(source).expect("program should compile");
        assert_valid(&bytecode);
        bytecode
    }

    // Checks the structural invariants every compiled program must satisfy:
    // operands in range, branches inside the program, calls resolved via
    // their header loads.
    fn assert_valid(bytecode: &[Instruction]) {
        for (pos, insn) in bytecode.iter().enumerate() {
            assert!(insn.a() < 255, "operand a out of range at {pos}");
            match insn.opcode() {
                Opcode::Jmp | Opcode::Jt | Opcode::Jf => {
                    let target = pos as i64 + insn.d() as i64 + 1;
                    assert!(
                        (0..=bytecode.len() as i64).contains(&target),
                        "branch at {pos} targets {target}"
                    );
                }
                Opcode::Call => {
                    let header = insn.a();
                    let movi = bytecode[..pos]
                        .iter()
                        .rposition(|i| i.opcode() == Opcode::Movi && i.a() == header)
                        .expect("every call loads its header register");
                    let entry = pos as i64 + bytecode[movi].d() as i64 + 1;
                    assert!(
                        (0..bytecode.len() as i64).contains(&entry),
                        "call at {pos} targets {entry}"
                    );
                }
                _ => {}
            }
        }
    }

    fn count(bytecode: &[Instruction], opcode: Opcode) -> usize {
        bytecode.iter().filter(|i| i.opcode() == opcode).count()
    }

    fn find(bytecode: &[Instruction], opcode: Opcode) -> Instruction {
        *bytecode
            .iter()
            .find(|i| i.opcode() == opcode)
            .unwrap_or_else(|| panic!("no {opcode} instruction emitted"))
    }

    #[test]
    fn prologue_calls_main_and_exits() {
        let bytecode = program("fn main() { return 0; }");
        assert_eq!(bytecode[0].opcode(), Opcode::Movi);
        assert_eq!(bytecode[1].opcode(), Opcode::Call);
        assert_eq!(bytecode[2].opcode(), Opcode::Exit);
        // main starts right after the prologue, so the header displacement
        // from the call at position 1 is 1.
        assert_eq!(bytecode[0].d(), 1);
    }

    #[test]
    fn folds_constant_expressions() {
        // The whole expression folds to one immediate load.
        let bytecode = program("fn main() { out 2 + 3 * 4; return 0; }");
        assert_eq!(bytecode[3].opcode(), Opcode::Movi);
        assert_eq!(bytecode[3].d(), 14);
        assert_eq!(bytecode[4].opcode(), Opcode::Out);
        assert_eq!(count(&bytecode, Opcode::Out), 1);
        assert_eq!(count(&bytecode, Opcode::AddRr), 0);
        assert_eq!(count(&bytecode, Opcode::MulRr), 0);
    }

    #[test]
    fn folds_unary_operators() {
        let bytecode = program("fn main() { out -(7); out !0; return 0; }");
        let loads: Vec<i16> = bytecode[3..]
            .iter()
            .filter(|i| i.opcode() == Opcode::Movi)
            .map(|i| i.d())
            .collect();
        assert_eq!(loads, vec![-7, 1]);
        assert_eq!(count(&bytecode, Opcode::Neg), 0);
        assert_eq!(count(&bytecode, Opcode::Not), 0);
    }

    #[test]
    fn selects_immediate_operands() {
        let bytecode = program("fn main() { let a = 10; out a + 5; out 200 + a; return 0; }");
        // a + 5 fits the 8-bit immediate form.
        let addri = find(&bytecode, Opcode::AddRi);
        assert_eq!(addri.b(), 0);
        assert_eq!(addri.c() as i8, 5);
        // 200 does not fit 8 bits, so it is materialized and added
        // register-register.
        assert_eq!(count(&bytecode, Opcode::AddRr), 1);
        assert!(bytecode.iter().any(|i| i.opcode() == Opcode::Movi && i.d() == 200));
    }

    #[test]
    fn commutative_swap_uses_the_immediate_form() {
        let bytecode = program("fn main() { let a = 10; out 5 + a; return 0; }");
        let addri = find(&bytecode, Opcode::AddRi);
        assert_eq!(addri.b(), 0);
        assert_eq!(addri.c() as i8, 5);
        assert_eq!(count(&bytecode, Opcode::AddRr), 0);
    }

    #[test]
    fn noncommutative_constant_left_uses_the_ir_form() {
        let bytecode = program("fn main() { let a = 10; out 5 - a; return 0; }");
        let subir = find(&bytecode, Opcode::SubIr);
        assert_eq!(subir.b() as i8, 5);
        assert_eq!(subir.c(), 0);
    }

    #[test]
    fn greater_than_swaps_into_less_than() {
        let bytecode = program("fn main() { let a = 1; let b = 2; out a > b; return 0; }");
        let lt = find(&bytecode, Opcode::LtRr);
        assert_eq!((lt.b(), lt.c()), (1, 0)); // b < a

        let bytecode = program("fn main() { let a = 1; out a >= 5; return 0; }");
        let le = find(&bytecode, Opcode::LeIr);
        assert_eq!(le.b() as i8, 5); // 5 <= a
        assert_eq!(le.c(), 0);
    }

    #[test]
    fn returns_use_the_immediate_form_when_possible() {
        let bytecode = program("fn main() { return 1; }");
        assert_eq!(find(&bytecode, Opcode::Reti).d(), 1);

        let bytecode = program("fn main() { let x = 1; return x; }");
        assert_eq!(find(&bytecode, Opcode::Retr).a(), 0);

        // Out of i16 range: materialized, then returned from a register.
        let bytecode = program("fn main() { return 100000; }");
        assert_eq!(count(&bytecode, Opcode::Retr), 1);
    }

    #[test]
    fn large_constants_are_staged() {
        let bytecode = program("fn main() { out 100000; return 0; }");
        // 100000 = 10 * 10000 + 0
        assert_eq!(bytecode[3].opcode(), Opcode::Movi);
        assert_eq!(bytecode[3].d(), 10);
        assert!(count(&bytecode, Opcode::MulRr) >= 1);
        assert_eq!(count(&bytecode, Opcode::Out), 1);
    }

    #[test]
    fn while_loops_jump_back_to_the_condition() {
        let bytecode =
            program("fn main() { let i = 0; while i < 10 { i = i + 1; } return i; }");
        let back = bytecode
            .iter()
            .find(|i| i.opcode() == Opcode::Jmp && i.d() < 0)
            .expect("a loop has a backward jump");
        assert!(back.d() < 0);
        assert_eq!(count(&bytecode, Opcode::Jf), 1);
    }

    #[test]
    fn sibling_scopes_reuse_registers() {
        let bytecode =
            program("fn main() { { let a = 1; out a; } { let b = 2; out b; } return 0; }");
        let loads: Vec<u8> = bytecode[3..]
            .iter()
            .filter(|i| i.opcode() == Opcode::Movi && (i.d() == 1 || i.d() == 2))
            .map(|i| i.a())
            .collect();
        assert_eq!(loads, vec![0, 0]);
    }

    #[test]
    fn long_if_chains_patch_correctly() {
        let mut source = String::from("fn main() { let x = 31; ");
        for i in 0..32 {
            let else_ = if i == 0 { "" } else { "else " };
            source += &format!("{else_}if x == {i} {{ out {i}; }} ");
        }
        source += "else { out 99; } return 0; }";
        // assert_valid inside `program` checks every branch target.
        let bytecode = program(&source);
        assert_eq!(count(&bytecode, Opcode::EqRi), 32);
    }

    #[test]
    fn calls_load_their_headers_and_pass_arguments_in_order() {
        let bytecode = program(
            "fn add(a, b) { return a + b; }
             fn main() { out add(1, 2); return 0; }",
        );
        let call = find(&bytecode, Opcode::Call);
        assert_eq!(call.b(), 2);
        // assert_valid already resolved the header load; check the argument
        // registers sit right above the header.
        let header = call.a();
        assert!(bytecode
            .iter()
            .any(|i| i.opcode() == Opcode::Movi && i.a() == header + 1 && i.d() == 1));
        assert!(bytecode
            .iter()
            .any(|i| i.opcode() == Opcode::Movi && i.a() == header + 2 && i.d() == 2));
    }

    #[test]
    fn recursive_and_forward_calls_resolve() {
        // `even` calls `odd` before `odd` is compiled.
        program(
            "fn even(n) { if n == 0 { return 1; } return odd(n - 1); }
             fn odd(n) { if n == 0 { return 0; } return even(n - 1); }
             fn main() { out even(10); return 0; }",
        );
    }

    #[test]
    fn constant_conditions_emit_no_test() {
        let bytecode = program("fn main() { if 1 == 1 { out 7; } else { out 8; } return 0; }");
        assert_eq!(count(&bytecode, Opcode::Jf), 0);
        assert_eq!(count(&bytecode, Opcode::Jt), 0);

        let bytecode = program("fn main() { if 0 { out 7; } return 0; }");
        assert_eq!(count(&bytecode, Opcode::Jf), 0);
        assert_eq!(count(&bytecode, Opcode::Jmp), 1);
    }

    #[test]
    fn in_reads_into_the_variable_register() {
        let bytecode = program("fn main() { let x = 0; in x; out x; return 0; }");
        assert_eq!(find(&bytecode, Opcode::In).a(), 0);
    }

    #[test]
    fn reports_division_by_zero_when_folding() {
        assert!(matches!(
            compile("fn main() { out 1 / 0; return 0; }"),
            Err(CompileError::DivisionByZero { .. })
        ));
        assert!(matches!(
            compile("fn main() { out 1 % 0; return 0; }"),
            Err(CompileError::DivisionByZero { .. })
        ));
    }

    #[test]
    fn reports_undefined_names() {
        assert!(matches!(
            compile("fn main() { out x; return 0; }"),
            Err(CompileError::UndefinedVariable { .. })
        ));
        assert!(matches!(
            compile("fn main() { out f(); return 0; }"),
            Err(CompileError::UndefinedFunction { .. })
        ));
    }

    #[test]
    fn reports_duplicate_declarations() {
        assert!(matches!(
            compile("fn main() { let x = 1; let x = 2; return 0; }"),
            Err(CompileError::DuplicateVariable { .. })
        ));
        assert!(matches!(
            compile("fn f() { return 0; } fn f() { return 1; } fn main() { return 0; }"),
            Err(CompileError::DuplicateFunction { .. })
        ));
        // Shadowing in a nested block is fine.
        assert!(compile("fn main() { let x = 1; { let x = 2; out x; } out x; return 0; }").is_ok());
    }

    #[test]
    fn reports_arity_mismatches() {
        assert!(matches!(
            compile("fn f(a) { return a; } fn main() { out f(); return 0; }"),
            Err(CompileError::ArityMismatch {
                expected: 1,
                found: 0,
                ..
            })
        ));
        assert!(matches!(
            compile("fn f(a) { return a; } fn main() { out f(1, 2); return 0; }"),
            Err(CompileError::ArityMismatch {
                expected: 1,
                found: 2,
                ..
            })
        ));
    }

    #[test]
    fn reports_a_missing_main() {
        assert!(matches!(
            compile("fn f() { return 0; }"),
            Err(CompileError::MissingMain)
        ));
    }

    #[test]
    fn reports_syntax_errors_with_positions() {
        match compile("fn main() { let = 1; return 0; }") {
            Err(CompileError::Unexpected { pos, .. }) => assert_eq!(pos, 16),
            other => panic!("expected a parse error, got {other:?}"),
        }
    }
}
