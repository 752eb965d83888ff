//! Recursive-descent parser producing an `Expr` tree.
//!
//! Precedence, lowest to highest:
//! `or` / `||`, `and` / `&&`, `not` / `!`, comparison (`== != < <= > >= in
//! not in`), `+ -`, `* / %`, unary `-`, postfix (`.name`, `[index]`).

use std::fmt;

use serde_json::Value;

use super::ExpressionError;
use super::lexer::{Lexer, Spanned, Token};

/// Nesting beyond this depth is rejected instead of risking the stack.
const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Ident(String),
    List(Vec<Expr>),
    Member {
        object: Box<Expr>,
        property: String,
    },
    Index {
        object: Box<Expr>,
        index: Box<Expr>,
    },
    Call {
        name: String,
        args: Vec<Expr>,
    },
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
    And,
    Or,
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::In => "in",
            BinaryOp::NotIn => "not in",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
        };
        f.write_str(s)
    }
}

/// Parse `source` into an expression tree.
pub fn parse(source: &str) -> Result<Expr, ExpressionError> {
    let tokens = Lexer::new(source).tokenize()?;
    let mut parser = Parser {
        tokens,
        position: 0,
        depth: 0,
    };
    let expr = parser.parse_or()?;
    if parser.peek() != &Token::Eof {
        return Err(parser.error(&format!("unexpected token '{}'", parser.peek())));
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<Spanned>,
    position: usize,
    depth: usize,
}

impl Parser {
    fn parse_or(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_and()?;
        while self.check(&Token::Or) {
            self.advance();
            let right = self.parse_and()?;
            left = binary(BinaryOp::Or, left, right);
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_not()?;
        while self.check(&Token::And) {
            self.advance();
            let right = self.parse_not()?;
            left = binary(BinaryOp::And, left, right);
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, ExpressionError> {
        if self.check(&Token::Not) {
            self.advance();
            self.enter()?;
            let expr = self.parse_not()?;
            self.depth -= 1;
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                expr: Box::new(expr),
            });
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_additive()?;
        loop {
            let op = match self.peek() {
                Token::Eq => BinaryOp::Eq,
                Token::Ne => BinaryOp::Ne,
                Token::Lt => BinaryOp::Lt,
                Token::Le => BinaryOp::Le,
                Token::Gt => BinaryOp::Gt,
                Token::Ge => BinaryOp::Ge,
                Token::In => BinaryOp::In,
                Token::Not if self.peek_next() == &Token::In => {
                    self.advance();
                    BinaryOp::NotIn
                }
                _ => break,
            };
            self.advance();
            let right = self.parse_additive()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Token::Plus => BinaryOp::Add,
                Token::Minus => BinaryOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.parse_multiplicative()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Token::Star => BinaryOp::Mul,
                Token::Slash => BinaryOp::Div,
                Token::Percent => BinaryOp::Mod,
                _ => break,
            };
            self.advance();
            let right = self.parse_unary()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ExpressionError> {
        if self.check(&Token::Minus) {
            self.advance();
            self.enter()?;
            let expr = self.parse_unary()?;
            self.depth -= 1;
            return Ok(Expr::Unary {
                op: UnaryOp::Neg,
                expr: Box::new(expr),
            });
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Expr, ExpressionError> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek() {
                Token::Dot => {
                    self.advance();
                    let property = match self.advance() {
                        Token::Ident(name) => name,
                        Token::Int(n) => n.to_string(),
                        other => {
                            return Err(self.error_before(&format!(
                                "expected member name after '.', found '{other}'"
                            )));
                        }
                    };
                    expr = Expr::Member {
                        object: Box::new(expr),
                        property,
                    };
                }
                Token::LBracket => {
                    self.advance();
                    self.enter()?;
                    let index = self.parse_or()?;
                    self.depth -= 1;
                    self.expect(&Token::RBracket)?;
                    expr = Expr::Index {
                        object: Box::new(expr),
                        index: Box::new(index),
                    };
                }
                _ => return Ok(expr),
            }
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, ExpressionError> {
        let expr = match self.advance() {
            Token::Null => Expr::Literal(Value::Null),
            Token::True => Expr::Literal(Value::Bool(true)),
            Token::False => Expr::Literal(Value::Bool(false)),
            Token::Int(n) => Expr::Literal(Value::from(n)),
            Token::Float(n) => Expr::Literal(Value::from(n)),
            Token::Str(s) => Expr::Literal(Value::String(s)),
            Token::Ident(name) if self.check(&Token::LParen) => {
                self.advance();
                let args = self.parse_sequence(&Token::RParen)?;
                Expr::Call { name, args }
            }
            Token::Ident(name) => Expr::Ident(name),
            Token::LParen => {
                self.enter()?;
                let inner = self.parse_or()?;
                self.depth -= 1;
                self.expect(&Token::RParen)?;
                inner
            }
            Token::LBracket => Expr::List(self.parse_sequence(&Token::RBracket)?),
            Token::Eof => return Err(self.error("unexpected end of expression")),
            other => return Err(self.error_before(&format!("unexpected token '{other}'"))),
        };
        Ok(expr)
    }

    /// Comma-separated expressions up to and including `close`. A trailing
    /// comma is allowed.
    fn parse_sequence(&mut self, close: &Token) -> Result<Vec<Expr>, ExpressionError> {
        self.enter()?;
        let mut items = Vec::new();
        while !self.check(close) {
            items.push(self.parse_or()?);
            if !self.check(&Token::Comma) {
                break;
            }
            self.advance();
        }
        self.expect(close)?;
        self.depth -= 1;
        Ok(items)
    }

    // -- token helpers ------------------------------------------------------

    fn peek(&self) -> &Token {
        self.tokens
            .get(self.position)
            .map(|s| &s.token)
            .unwrap_or(&Token::Eof)
    }

    fn peek_next(&self) -> &Token {
        self.tokens
            .get(self.position + 1)
            .map(|s| &s.token)
            .unwrap_or(&Token::Eof)
    }

    fn check(&self, token: &Token) -> bool {
        self.peek() == token
    }

    /// Consume the current token. `Eof` is never consumed.
    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if token != Token::Eof {
            self.position += 1;
        }
        token
    }

    fn expect(&mut self, token: &Token) -> Result<(), ExpressionError> {
        if self.check(token) {
            self.advance();
            Ok(())
        } else {
            Err(self.error(&format!("expected '{token}', found '{}'", self.peek())))
        }
    }

    fn enter(&mut self) -> Result<(), ExpressionError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(self.error("expression nested too deeply"));
        }
        Ok(())
    }

    fn current_position(&self) -> usize {
        self.tokens
            .get(self.position)
            .or_else(|| self.tokens.last())
            .map(|s| s.position)
            .unwrap_or(0)
    }

    fn error(&self, message: &str) -> ExpressionError {
        ExpressionError::Parse {
            message: message.to_string(),
            position: self.current_position(),
        }
    }

    /// Error located at the token just consumed.
    fn error_before(&self, message: &str) -> ExpressionError {
        let position = self
            .position
            .checked_sub(1)
            .and_then(|i| self.tokens.get(i))
            .map(|s| s.position)
            .unwrap_or_else(|| self.current_position());
        ExpressionError::Parse {
            message: message.to_string(),
            position,
        }
    }
}

fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
    Expr::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
}
