//! Restricted formula interpreter for decoding raw PID payloads
//!
//! Formulas come from externally supplied pro-pack files, so the grammar is
//! closed: byte variables `A`..`Z`, decimal literals, `+ - * /`, unary minus,
//! parentheses and `signed(x)`. Anything else is rejected at parse time.
//!
//! ```text
//! expr    := term (('+' | '-') term)*
//! term    := unary (('*' | '/') unary)*
//! unary   := '-' unary | primary
//! primary := NUMBER | VAR | 'signed' '(' expr ')' | '(' expr ')'
//! ```

use crate::error::FormulaError;
use std::fmt;
use std::str::FromStr;

/// Longest formula text accepted
const MAX_FORMULA_LEN: usize = 256;

/// Deepest expression nesting accepted
const MAX_DEPTH: usize = 32;

/// Binary operators available in formulas
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// Parsed formula expression tree
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Payload byte at the given index (`A` = 0)
    ByteVar(usize),
    /// Numeric literal
    Literal(f64),
    /// Binary operation
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    /// Unary minus
    Negate(Box<Expr>),
    /// `signed(x)`: unsigned byte reinterpreted as two's complement
    SignedCast(Box<Expr>),
}

impl Expr {
    fn eval(&self, bytes: &[u8]) -> Result<f64, FormulaError> {
        match self {
            Expr::ByteVar(index) => bytes
                .get(*index)
                .map(|b| f64::from(*b))
                .ok_or(FormulaError::ByteOutOfRange {
                    variable: variable_name(*index),
                    available: bytes.len(),
                }),
            Expr::Literal(value) => Ok(*value),
            Expr::Negate(inner) => Ok(-inner.eval(bytes)?),
            Expr::SignedCast(inner) => {
                let value = inner.eval(bytes)?;
                Ok(if value > 127.0 { value - 256.0 } else { value })
            }
            Expr::Binary { op, lhs, rhs } => {
                let l = lhs.eval(bytes)?;
                let r = rhs.eval(bytes)?;
                match op {
                    BinaryOp::Add => Ok(l + r),
                    BinaryOp::Sub => Ok(l - r),
                    BinaryOp::Mul => Ok(l * r),
                    BinaryOp::Div if r == 0.0 => Err(FormulaError::DivisionByZero),
                    BinaryOp::Div => Ok(l / r),
                }
            }
        }
    }

    /// Highest byte index referenced, if any
    fn max_byte(&self) -> Option<usize> {
        match self {
            Expr::ByteVar(index) => Some(*index),
            Expr::Literal(_) => None,
            Expr::Negate(inner) | Expr::SignedCast(inner) => inner.max_byte(),
            Expr::Binary { lhs, rhs, .. } => match (lhs.max_byte(), rhs.max_byte()) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (a, b) => a.or(b),
            },
        }
    }
}

fn variable_name(index: usize) -> char {
    (b'A' + index.min(25) as u8) as char
}

/// A validated formula ready for repeated evaluation
#[derive(Debug, Clone, PartialEq)]
pub struct Formula {
    source: String,
    root: Expr,
}

impl Formula {
    /// Parse formula text into an expression tree
    pub fn parse(text: &str) -> Result<Self, FormulaError> {
        if text.len() > MAX_FORMULA_LEN {
            return Err(FormulaError::TooComplex("formula text too long"));
        }
        let tokens = tokenize(text)?;
        let mut parser = Parser {
            tokens: &tokens,
            pos: 0,
            depth: 0,
        };
        let root = parser.expr()?;
        if let Some(token) = parser.peek() {
            return Err(FormulaError::Syntax(format!("unexpected trailing {token}")));
        }
        Ok(Self {
            source: text.to_string(),
            root,
        })
    }

    /// Evaluate against a response payload (`A` = first data byte)
    pub fn evaluate(&self, bytes: &[u8]) -> Result<f64, FormulaError> {
        let value = self.root.eval(bytes)?;
        if value.is_finite() {
            Ok(value)
        } else {
            Err(FormulaError::NonFinite)
        }
    }

    /// Number of payload bytes this formula needs
    pub fn bytes_required(&self) -> usize {
        self.root.max_byte().map_or(0, |i| i + 1)
    }

    /// Original formula text
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Parsed expression tree
    pub fn expr(&self) -> &Expr {
        &self.root
    }
}

impl FromStr for Formula {
    type Err = FormulaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Formula::parse(s)
    }
}

impl fmt::Display for Formula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Parse and evaluate in one step
pub fn evaluate(formula: &str, bytes: &[u8]) -> Result<f64, FormulaError> {
    Formula::parse(formula)?.evaluate(bytes)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Var(usize),
    Signed,
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Number(n) => write!(f, "number {n}"),
            Token::Var(i) => write!(f, "variable {}", variable_name(*i)),
            Token::Signed => f.write_str("'signed'"),
            Token::Plus => f.write_str("'+'"),
            Token::Minus => f.write_str("'-'"),
            Token::Star => f.write_str("'*'"),
            Token::Slash => f.write_str("'/'"),
            Token::LParen => f.write_str("'('"),
            Token::RParen => f.write_str("')'"),
        }
    }
}

fn tokenize(text: &str) -> Result<Vec<Token>, FormulaError> {
    let chars: Vec<char> = text.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let literal: String = chars[start..i].iter().collect();
                let value = literal
                    .parse::<f64>()
                    .map_err(|_| FormulaError::Syntax(format!("invalid number '{literal}'")))?;
                tokens.push(Token::Number(value));
            }
            c if c.is_ascii_alphabetic() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let ident: String = chars[start..i].iter().collect();
                match ident.as_str() {
                    "signed" => tokens.push(Token::Signed),
                    single if single.len() == 1 && c.is_ascii_uppercase() => {
                        tokens.push(Token::Var((c as u8 - b'A') as usize));
                    }
                    _ => return Err(FormulaError::UnknownIdentifier(ident)),
                }
            }
            other => {
                return Err(FormulaError::UnexpectedChar {
                    found: other,
                    position: i,
                })
            }
        }
    }

    Ok(tokens)
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    depth: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, expected: Token) -> Result<(), FormulaError> {
        match self.next() {
            Some(ref token) if *token == expected => Ok(()),
            Some(token) => Err(FormulaError::Syntax(format!(
                "expected {expected}, found {token}"
            ))),
            None => Err(FormulaError::Syntax(format!(
                "expected {expected}, found end of formula"
            ))),
        }
    }

    fn descend(&mut self) -> Result<(), FormulaError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            Err(FormulaError::TooComplex("nesting too deep"))
        } else {
            Ok(())
        }
    }

    fn expr(&mut self) -> Result<Expr, FormulaError> {
        self.descend()?;
        let mut lhs = self.term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.term()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        self.depth -= 1;
        Ok(lhs)
    }

    fn term(&mut self) -> Result<Expr, FormulaError> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, FormulaError> {
        if self.peek() == Some(&Token::Minus) {
            self.pos += 1;
            self.descend()?;
            let inner = self.unary()?;
            self.depth -= 1;
            return Ok(Expr::Negate(Box::new(inner)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, FormulaError> {
        match self.next() {
            Some(Token::Number(value)) => Ok(Expr::Literal(value)),
            Some(Token::Var(index)) => Ok(Expr::ByteVar(index)),
            Some(Token::Signed) => {
                self.expect(Token::LParen)?;
                let inner = self.expr()?;
                self.expect(Token::RParen)?;
                Ok(Expr::SignedCast(Box::new(inner)))
            }
            Some(Token::LParen) => {
                let inner = self.expr()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(token) => Err(FormulaError::Syntax(format!("unexpected {token}"))),
            None => Err(FormulaError::Syntax("unexpected end of formula".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_signed_cast() {
        assert_eq!(evaluate("signed(A)", &[0xFF]).unwrap(), -1.0);
        assert_eq!(evaluate("signed(A)", &[0x7F]).unwrap(), 127.0);
        assert_eq!(evaluate("signed(A)", &[0x80]).unwrap(), -128.0);
    }

    #[test]
    fn test_two_byte_value() {
        assert_eq!(evaluate("(A*256)+B", &[0x0A, 0x05]).unwrap(), 2565.0);
    }

    #[test]
    fn test_scaled_value() {
        let value = evaluate("((A*256)+B)*0.1", &[0x01, 0xF4]).unwrap();
        assert!((value - 50.0).abs() < 1e-9);

        let value = evaluate("((A*256)+B)/100", &[0x0A, 0x14]).unwrap();
        assert!((value - 25.8).abs() < 1e-9);
    }

    #[test]
    fn test_precedence_and_unary_minus() {
        assert_eq!(evaluate("A+B*2", &[1, 3]).unwrap(), 7.0);
        assert_eq!(evaluate("A-40", &[0x73]).unwrap(), 75.0);
        assert_eq!(evaluate("-A+10", &[4]).unwrap(), 6.0);
        assert_eq!(evaluate("A/2-64", &[0x90]).unwrap(), 8.0);
    }

    #[test]
    fn test_byte_out_of_range() {
        let err = evaluate("(A*256)+B", &[0x0A]).unwrap_err();
        assert_eq!(
            err,
            FormulaError::ByteOutOfRange {
                variable: 'B',
                available: 1
            }
        );
        assert!(evaluate("A", &[]).is_err());
    }

    #[test]
    fn test_rejects_foreign_identifiers() {
        assert!(matches!(
            Formula::parse("exec(A)"),
            Err(FormulaError::UnknownIdentifier(_))
        ));
        assert!(matches!(
            Formula::parse("__import__('os')"),
            Err(FormulaError::UnexpectedChar { found: '_', .. })
        ));
        assert!(matches!(
            Formula::parse("abs(A)"),
            Err(FormulaError::UnknownIdentifier(_))
        ));
        assert!(matches!(
            Formula::parse("a+1"),
            Err(FormulaError::UnknownIdentifier(_))
        ));
        assert!(matches!(
            Formula::parse("A ** 2"),
            Err(FormulaError::Syntax(_))
        ));
        assert!(matches!(
            Formula::parse("A; B"),
            Err(FormulaError::UnexpectedChar { found: ';', .. })
        ));
    }

    #[test]
    fn test_malformed_syntax() {
        assert!(Formula::parse("").is_err());
        assert!(Formula::parse("(A+1").is_err());
        assert!(Formula::parse("A+").is_err());
        assert!(Formula::parse("signed A").is_err());
        assert!(Formula::parse("1.2.3").is_err());
        assert!(Formula::parse("A B").is_err());
    }

    #[test]
    fn test_limits() {
        let deep = format!("{}A{}", "(".repeat(40), ")".repeat(40));
        assert_eq!(
            Formula::parse(&deep),
            Err(FormulaError::TooComplex("nesting too deep"))
        );
        let long = "A+".repeat(200) + "A";
        assert!(matches!(
            Formula::parse(&long),
            Err(FormulaError::TooComplex(_))
        ));
    }

    #[test]
    fn test_division_by_zero() {
        assert_eq!(
            evaluate("A/B", &[10, 0]),
            Err(FormulaError::DivisionByZero)
        );
    }

    #[test]
    fn test_bytes_required() {
        assert_eq!(Formula::parse("((A*256)+B)/4").unwrap().bytes_required(), 2);
        assert_eq!(Formula::parse("signed(D)").unwrap().bytes_required(), 4);
        assert_eq!(Formula::parse("42").unwrap().bytes_required(), 0);
    }

    proptest! {
        #[test]
        fn prop_signed_stays_in_i8_range(byte in any::<u8>()) {
            let value = evaluate("signed(A)", &[byte]).unwrap();
            prop_assert_eq!(value, f64::from(byte as i8));
        }

        #[test]
        fn prop_never_reads_past_payload(len in 0usize..4) {
            let payload = vec![1u8; len];
            let result = evaluate("A+B+C+D", &payload);
            prop_assert_eq!(result.is_ok(), len == 4);
        }
    }
}
