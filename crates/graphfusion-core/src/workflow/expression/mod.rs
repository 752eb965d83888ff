//! Condition expressions for conditional steps.
//!
//! A small fixed grammar evaluated against the execution context:
//! literals, step-id identifiers, member/index access, comparison, boolean
//! and arithmetic operators, `in` / `not in`, and a handful of pure builtin
//! functions. Nothing outside the context is reachable.
//!
//! - `lexer` -- source text to tokens
//! - `parser` -- tokens to `Expr` (recursive descent)
//! - `evaluator` -- tree-walking evaluation and truthiness

pub mod evaluator;
pub mod lexer;
pub mod parser;

pub use evaluator::{evaluate, evaluate_condition, is_truthy};
pub use parser::{BinaryOp, Expr, UnaryOp, parse};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur while lexing, parsing or evaluating a condition.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExpressionError {
    #[error("lex error at position {position}: {message}")]
    Lex { message: String, position: usize },

    #[error("parse error at position {position}: {message}")]
    Parse { message: String, position: usize },

    #[error("unknown identifier '{0}'")]
    UnknownIdentifier(String),

    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    #[error("type error: {0}")]
    Type(String),
}
