//! Tokenizer for condition expressions.

use std::fmt;
use std::iter::Peekable;
use std::str::CharIndices;

use super::ExpressionError;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    // Literals
    Null,
    True,
    False,
    Int(i64),
    Float(f64),
    Str(String),

    Ident(String),

    // Keywords / operators
    And,
    Or,
    Not,
    In,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Dot,
    Comma,

    // Delimiters
    LParen,
    RParen,
    LBracket,
    RBracket,

    Eof,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Null => write!(f, "null"),
            Token::True => write!(f, "true"),
            Token::False => write!(f, "false"),
            Token::Int(n) => write!(f, "{n}"),
            Token::Float(n) => write!(f, "{n}"),
            Token::Str(s) => write!(f, "'{s}'"),
            Token::Ident(s) => write!(f, "{s}"),
            Token::And => write!(f, "and"),
            Token::Or => write!(f, "or"),
            Token::Not => write!(f, "not"),
            Token::In => write!(f, "in"),
            Token::Plus => write!(f, "+"),
            Token::Minus => write!(f, "-"),
            Token::Star => write!(f, "*"),
            Token::Slash => write!(f, "/"),
            Token::Percent => write!(f, "%"),
            Token::Eq => write!(f, "=="),
            Token::Ne => write!(f, "!="),
            Token::Lt => write!(f, "<"),
            Token::Le => write!(f, "<="),
            Token::Gt => write!(f, ">"),
            Token::Ge => write!(f, ">="),
            Token::Dot => write!(f, "."),
            Token::Comma => write!(f, ","),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::LBracket => write!(f, "["),
            Token::RBracket => write!(f, "]"),
            Token::Eof => write!(f, "end of input"),
        }
    }
}

/// A token and the byte offset where it starts.
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub position: usize,
}

pub struct Lexer<'a> {
    input: &'a str,
    chars: Peekable<CharIndices<'a>>,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        Self {
            input,
            chars: input.char_indices().peekable(),
        }
    }

    /// Tokenize the entire input. The last token is always `Eof`.
    pub fn tokenize(mut self) -> Result<Vec<Spanned>, ExpressionError> {
        let mut tokens = Vec::new();
        loop {
            let spanned = self.next_token()?;
            let done = spanned.token == Token::Eof;
            tokens.push(spanned);
            if done {
                return Ok(tokens);
            }
        }
    }

    fn next_token(&mut self) -> Result<Spanned, ExpressionError> {
        while self.chars.next_if(|(_, c)| c.is_whitespace()).is_some() {}

        let Some(&(pos, ch)) = self.chars.peek() else {
            return Ok(Spanned {
                token: Token::Eof,
                position: self.input.len(),
            });
        };

        let token = match ch {
            '+' => self.single(Token::Plus),
            '-' => self.single(Token::Minus),
            '*' => self.single(Token::Star),
            '/' => self.single(Token::Slash),
            '%' => self.single(Token::Percent),
            '.' => self.single(Token::Dot),
            ',' => self.single(Token::Comma),
            '(' => self.single(Token::LParen),
            ')' => self.single(Token::RParen),
            '[' => self.single(Token::LBracket),
            ']' => self.single(Token::RBracket),
            '=' => {
                self.chars.next();
                if self.eat('=') {
                    Token::Eq
                } else {
                    return Err(lex_error("expected '==', found '='", pos));
                }
            }
            '!' => {
                self.chars.next();
                if self.eat('=') { Token::Ne } else { Token::Not }
            }
            '<' => {
                self.chars.next();
                if self.eat('=') { Token::Le } else { Token::Lt }
            }
            '>' => {
                self.chars.next();
                if self.eat('=') { Token::Ge } else { Token::Gt }
            }
            '&' => {
                self.chars.next();
                if self.eat('&') {
                    Token::And
                } else {
                    return Err(lex_error("expected '&&'", pos));
                }
            }
            '|' => {
                self.chars.next();
                if self.eat('|') {
                    Token::Or
                } else {
                    return Err(lex_error("expected '||'", pos));
                }
            }
            '\'' | '"' => self.string(ch, pos)?,
            c if c.is_ascii_digit() => self.number(pos)?,
            c if c.is_alphabetic() || c == '_' => self.word(pos),
            other => return Err(lex_error(&format!("unexpected character '{other}'"), pos)),
        };

        Ok(Spanned {
            token,
            position: pos,
        })
    }

    fn single(&mut self, token: Token) -> Token {
        self.chars.next();
        token
    }

    fn eat(&mut self, expected: char) -> bool {
        self.chars.next_if(|&(_, c)| c == expected).is_some()
    }

    fn string(&mut self, quote: char, start: usize) -> Result<Token, ExpressionError> {
        self.chars.next();
        let mut value = String::new();
        loop {
            match self.chars.next() {
                None => return Err(lex_error("unterminated string literal", start)),
                Some((_, c)) if c == quote => return Ok(Token::Str(value)),
                Some((pos, '\\')) => match self.chars.next() {
                    Some((_, 'n')) => value.push('\n'),
                    Some((_, 't')) => value.push('\t'),
                    Some((_, c @ ('\\' | '\'' | '"'))) => value.push(c),
                    Some((_, other)) => {
                        return Err(lex_error(&format!("unknown escape '\\{other}'"), pos));
                    }
                    None => return Err(lex_error("unterminated string literal", start)),
                },
                Some((_, c)) => value.push(c),
            }
        }
    }

    fn number(&mut self, start: usize) -> Result<Token, ExpressionError> {
        let mut end = start;
        let mut is_float = false;
        while let Some(&(pos, c)) = self.chars.peek() {
            if c.is_ascii_digit() {
                end = pos + 1;
                self.chars.next();
            } else if c == '.' && !is_float && self.digit_follows(pos) {
                is_float = true;
                end = pos + 1;
                self.chars.next();
            } else {
                break;
            }
        }

        let text = &self.input[start..end];
        if is_float {
            text.parse::<f64>()
                .map(Token::Float)
                .map_err(|_| lex_error(&format!("invalid number '{text}'"), start))
        } else {
            text.parse::<i64>()
                .map(Token::Int)
                .map_err(|_| lex_error(&format!("integer '{text}' out of range"), start))
        }
    }

    /// Whether the character after the `.` at `dot` is a digit, so `1.5` is a
    /// float while `items.0` stays member access.
    fn digit_follows(&self, dot: usize) -> bool {
        self.input[dot + 1..]
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_digit())
    }

    fn word(&mut self, start: usize) -> Token {
        let mut end = start;
        while let Some((pos, c)) = self.chars.next_if(|(_, c)| c.is_alphanumeric() || *c == '_') {
            end = pos + c.len_utf8();
        }
        match &self.input[start..end] {
            "true" | "True" => Token::True,
            "false" | "False" => Token::False,
            "null" | "None" => Token::Null,
            "and" => Token::And,
            "or" => Token::Or,
            "not" => Token::Not,
            "in" => Token::In,
            ident => Token::Ident(ident.to_string()),
        }
    }
}

fn lex_error(message: &str, position: usize) -> ExpressionError {
    ExpressionError::Lex {
        message: message.to_string(),
        position,
    }
}
