//! The lexer.

use derive_more::Display;
use regex::Regex;

use crate::common::Id;

/// Tokens in the program.
#[derive(Clone, Copy, PartialEq, Eq, Display)]
pub enum Token {
    #[display("identifier `{_0}`")]
    Ident(Id),
    #[display("integer literal `{_0}`")]
    Int(i64),
    #[display("`let`")]
    Let,
    #[display("`if`")]
    If,
    #[display("`else`")]
    Else,
    #[display("`while`")]
    While,
    #[display("`return`")]
    Return,
    #[display("`in`")]
    In,
    #[display("`out`")]
    Out,
    #[display("`fn`")]
    Fn,
    #[display("`(`")]
    LParen,
    #[display("`)`")]
    RParen,
    #[display("`{{`")]
    LBrace,
    #[display("`}}`")]
    RBrace,
    #[display("`,`")]
    Comma,
    #[display("`;`")]
    Semi,
    #[display("`+`")]
    Plus,
    #[display("`-`")]
    Minus,
    #[display("`*`")]
    Star,
    #[display("`/`")]
    Slash,
    #[display("`%`")]
    Percent,
    #[display("`==`")]
    EqEq,
    #[display("`!=`")]
    Ne,
    #[display("`<`")]
    Lt,
    #[display("`<=`")]
    Le,
    #[display("`>`")]
    Gt,
    #[display("`>=`")]
    Ge,
    #[display("`!`")]
    Bang,
    #[display("`=`")]
    Assign,
    #[display("end of input")]
    Eof,
}

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self}")
    }
}

// Fixed-spelling tokens, longest spellings first so that `==` wins over `=`.
static OPERATORS: [(&str, Token); 19] = [
    ("==", Token::EqEq),
    ("!=", Token::Ne),
    ("<=", Token::Le),
    (">=", Token::Ge),
    ("(", Token::LParen),
    (")", Token::RParen),
    ("{", Token::LBrace),
    ("}", Token::RBrace),
    (",", Token::Comma),
    (";", Token::Semi),
    ("+", Token::Plus),
    ("-", Token::Minus),
    ("*", Token::Star),
    ("/", Token::Slash),
    ("%", Token::Percent),
    ("<", Token::Lt),
    (">", Token::Gt),
    ("!", Token::Bang),
    ("=", Token::Assign),
];

#[derive(Display)]
pub enum LexError {
    #[display("Lexer error: unexpected character {ch:?} at byte {pos}")]
    Char { pos: usize, ch: char },
    #[display("Lexer error: integer literal `{text}` does not fit 64 bits at byte {pos}")]
    Literal { pos: usize, text: String },
}

impl std::fmt::Debug for LexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self}")
    }
}

pub struct Lexer<'input> {
    input: &'input str,
    pos: usize,
    whitespace: Regex,
    ident: Regex,
    number: Regex,
}

impl<'input> Lexer<'input> {
    pub fn new(input: &'input str) -> Self {
        Lexer {
            input,
            pos: 0,
            whitespace: Regex::new(r"\A(?:[ \t\f\r\n\v]|(?://.*))*").unwrap(),
            ident: Regex::new(r"\A[A-Za-z_][A-Za-z0-9_]*").unwrap(),
            number: Regex::new(r"\A[0-9]+").unwrap(),
        }
    }

    /// Has the lexer reached the end of input?
    pub fn end_of_input(&self) -> bool {
        self.pos == self.input.len()
    }

    // Skip comments and whitespace
    fn skip_whitespace(&mut self) {
        if let Some(m) = self.whitespace.find(&self.input[self.pos..]) {
            self.pos += m.end()
        }
    }

    /// Get the next token, with its byte offset, if possible.
    ///
    /// The return type distinguishes between end-of-input and lexer error.
    pub fn next(&mut self) -> Result<Option<(Token, usize)>, LexError> {
        self.skip_whitespace();
        if self.end_of_input() {
            return Ok(None);
        }
        let pos = self.pos;
        let rest = &self.input[pos..];
        if let Some(m) = self.ident.find(rest) {
            self.pos += m.end();
            let token = match m.as_str() {
                "let" => Token::Let,
                "if" => Token::If,
                "else" => Token::Else,
                "while" => Token::While,
                "return" => Token::Return,
                "in" => Token::In,
                "out" => Token::Out,
                "fn" => Token::Fn,
                text => Token::Ident(Id::new(text.to_owned())),
            };
            return Ok(Some((token, pos)));
        }
        if let Some(m) = self.number.find(rest) {
            self.pos += m.end();
            let value = m.as_str().parse().map_err(|_| LexError::Literal {
                pos,
                text: m.as_str().to_owned(),
            })?;
            return Ok(Some((Token::Int(value), pos)));
        }
        for (spelling, token) in &OPERATORS {
            if rest.starts_with(spelling) {
                self.pos += spelling.len();
                return Ok(Some((*token, pos)));
            }
        }
        let ch = rest.chars().next().unwrap_or('\u{0}');
        Err(LexError::Char { pos, ch })
    }
}

/// A fully lexed program: a forward-only token cursor that the parser peeks
/// and advances, resettable so the compiler can run its two passes over the
/// same tokens.
pub struct Tokens {
    items: Vec<(Token, usize)>,
    cursor: usize,
}

impl Tokens {
    /// Lex the whole input up front.  A trailing [Token::Eof] marks the end
    /// of input explicitly.
    pub fn lex(input: &str) -> Result<Self, LexError> {
        let mut lexer = Lexer::new(input);
        let mut items = Vec::new();
        while let Some(item) = lexer.next()? {
            items.push(item);
        }
        items.push((Token::Eof, input.len()));
        Ok(Tokens { items, cursor: 0 })
    }

    /// The current token.
    pub fn peek(&self) -> Token {
        self.items[self.cursor].0
    }

    /// Byte offset of the current token, for diagnostics.
    pub fn pos(&self) -> usize {
        self.items[self.cursor].1
    }

    /// Consume and return the current token.  Advancing past the end of
    /// input keeps returning [Token::Eof].
    pub fn advance(&mut self) -> Token {
        let token = self.peek();
        if token != Token::Eof {
            self.cursor += 1;
        }
        token
    }

    /// Rewind to the first token.
    pub fn reset(&mut self) {
        self.cursor = 0;
    }

    /// All tokens with their byte offsets, in order.
    pub fn items(&self) -> &[(Token, usize)] {
        &self.items
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(input: &str) -> Vec<Token> {
        Tokens::lex(input)
            .unwrap()
            .items()
            .iter()
            .map(|(token, _)| *token)
            .collect()
    }

    #[test]
    fn lexes_a_function_header() {
        let id = |name: &str| Token::Ident(Id::new(name.to_owned()));
        assert_eq!(
            kinds("fn main() { let x = 42; }"),
            vec![
                Token::Fn,
                id("main"),
                Token::LParen,
                Token::RParen,
                Token::LBrace,
                Token::Let,
                id("x"),
                Token::Assign,
                Token::Int(42),
                Token::Semi,
                Token::RBrace,
                Token::Eof,
            ]
        );
    }

    #[test]
    fn skips_comments_and_whitespace() {
        assert_eq!(
            kinds("// nothing here\n  1 // trailing\n\t2"),
            vec![Token::Int(1), Token::Int(2), Token::Eof]
        );
        assert_eq!(kinds("// only a comment"), vec![Token::Eof]);
    }

    #[test]
    fn two_character_operators_win_over_prefixes() {
        assert_eq!(
            kinds("== = <= < >= > != !"),
            vec![
                Token::EqEq,
                Token::Assign,
                Token::Le,
                Token::Lt,
                Token::Ge,
                Token::Gt,
                Token::Ne,
                Token::Bang,
                Token::Eof,
            ]
        );
    }

    #[test]
    fn keywords_do_not_swallow_longer_identifiers() {
        let tokens = kinds("letter input outer");
        assert!(matches!(tokens[0], Token::Ident(_)));
        assert!(matches!(tokens[1], Token::Ident(_)));
        assert!(matches!(tokens[2], Token::Ident(_)));
    }

    #[test]
    fn rejects_unknown_characters() {
        match Tokens::lex("let x @ 1;") {
            Err(LexError::Char { pos, ch }) => {
                assert_eq!(pos, 6);
                assert_eq!(ch, '@');
            }
            other => panic!("expected a lexer error, got {:?}", other.map(|t| kindless(t))),
        }
    }

    #[test]
    fn rejects_overflowing_literals() {
        assert!(matches!(
            Tokens::lex("99999999999999999999"),
            Err(LexError::Literal { pos: 0, .. })
        ));
        // i64::MAX itself is fine.
        assert_eq!(
            kinds("9223372036854775807"),
            vec![Token::Int(i64::MAX), Token::Eof]
        );
    }

    #[test]
    fn cursor_peeks_advances_and_resets() {
        let mut tokens = Tokens::lex("1 2").unwrap();
        assert_eq!(tokens.peek(), Token::Int(1));
        assert_eq!(tokens.advance(), Token::Int(1));
        assert_eq!(tokens.advance(), Token::Int(2));
        assert_eq!(tokens.advance(), Token::Eof);
        // Advancing past the end stays at Eof.
        assert_eq!(tokens.advance(), Token::Eof);
        tokens.reset();
        assert_eq!(tokens.peek(), Token::Int(1));
    }

    fn kindless(tokens: Tokens) -> Vec<Token> {
        tokens.items().iter().map(|(token, _)| *token).collect()
    }
}
