//! Tree-walking evaluator for condition expressions.
//!
//! Values are `serde_json::Value`s. Identifiers name step ids in the
//! execution context; `context` names the whole context. Truthiness:
//! null, false, 0, "", [] and {} are false, everything else is true.

use std::cmp::Ordering;

use serde_json::{Number, Value};

use super::ExpressionError;
use super::parser::{BinaryOp, Expr, UnaryOp, parse};
use crate::workflow::context::ExecutionContext;

/// Identifier that evaluates to the whole context object.
const CONTEXT_IDENT: &str = "context";

/// Parse and evaluate `source`, reducing the result to a boolean.
pub fn evaluate_condition(source: &str, context: &ExecutionContext) -> Result<bool, ExpressionError> {
    let expr = parse(source)?;
    evaluate(&expr, context).map(|value| is_truthy(&value))
}

/// Evaluate a parsed expression against `context`.
pub fn evaluate(expr: &Expr, context: &ExecutionContext) -> Result<Value, ExpressionError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Ident(name) => match context.get(name) {
            Some(value) => Ok(value.clone()),
            None if name == CONTEXT_IDENT => Ok(context.to_value()),
            None => Err(ExpressionError::UnknownIdentifier(name.clone())),
        },
        Expr::List(items) => items
            .iter()
            .map(|item| evaluate(item, context))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Expr::Member { object, property } => {
            let object = evaluate(object, context)?;
            member(&object, property)
        }
        Expr::Index { object, index } => {
            let object = evaluate(object, context)?;
            let index = evaluate(index, context)?;
            index_value(&object, &index)
        }
        Expr::Call { name, args } => {
            let args = args
                .iter()
                .map(|arg| evaluate(arg, context))
                .collect::<Result<Vec<_>, _>>()?;
            call(name, &args)
        }
        Expr::Unary { op, expr } => {
            let value = evaluate(expr, context)?;
            match op {
                UnaryOp::Not => Ok(Value::Bool(!is_truthy(&value))),
                UnaryOp::Neg => match &value {
                    Value::Number(n) => match n.as_i64() {
                        Some(i) => i
                            .checked_neg()
                            .map(Value::from)
                            .ok_or_else(|| type_error("integer overflow")),
                        None => float_value(-as_f64(n)),
                    },
                    other => Err(type_error(&format!(
                        "bad operand type for unary -: {}",
                        type_name(other)
                    ))),
                },
            }
        }
        Expr::Binary { op, left, right } => match op {
            // Short-circuit; the deciding operand is the result.
            BinaryOp::And => {
                let left = evaluate(left, context)?;
                if is_truthy(&left) { evaluate(right, context) } else { Ok(left) }
            }
            BinaryOp::Or => {
                let left = evaluate(left, context)?;
                if is_truthy(&left) { Ok(left) } else { evaluate(right, context) }
            }
            _ => {
                let left = evaluate(left, context)?;
                let right = evaluate(right, context)?;
                binary(*op, &left, &right)
            }
        },
    }
}

/// Truthiness of a value.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => as_f64(n) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

// ---------------------------------------------------------------------------
// Operators
// ---------------------------------------------------------------------------

fn binary(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, ExpressionError> {
    match op {
        BinaryOp::Eq => Ok(Value::Bool(values_equal(left, right))),
        BinaryOp::Ne => Ok(Value::Bool(!values_equal(left, right))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = compare(left, right).ok_or_else(|| {
                type_error(&format!(
                    "'{op}' not supported between {} and {}",
                    type_name(left),
                    type_name(right)
                ))
            })?;
            Ok(Value::Bool(match op {
                BinaryOp::Lt => ordering == Ordering::Less,
                BinaryOp::Le => ordering != Ordering::Greater,
                BinaryOp::Gt => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            }))
        }
        BinaryOp::In => contains(right, left).map(Value::Bool),
        BinaryOp::NotIn => contains(right, left).map(|found| Value::Bool(!found)),
        BinaryOp::Add => match (left, right) {
            (Value::String(a), Value::String(b)) => Ok(Value::String(format!("{a}{b}"))),
            (Value::Array(a), Value::Array(b)) => {
                Ok(Value::Array(a.iter().chain(b.iter()).cloned().collect()))
            }
            _ => arithmetic(op, left, right),
        },
        BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => {
            arithmetic(op, left, right)
        }
        BinaryOp::And => Ok(Value::Bool(is_truthy(left) && is_truthy(right))),
        BinaryOp::Or => Ok(Value::Bool(is_truthy(left) || is_truthy(right))),
    }
}

fn arithmetic(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, ExpressionError> {
    let (Some(a), Some(b)) = (numeric(left), numeric(right)) else {
        return Err(type_error(&format!(
            "unsupported operand types for {op}: {} and {}",
            type_name(left),
            type_name(right)
        )));
    };

    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        let result = match op {
            BinaryOp::Add => x.checked_add(y),
            BinaryOp::Sub => x.checked_sub(y),
            BinaryOp::Mul => x.checked_mul(y),
            BinaryOp::Mod if y == 0 => return Err(type_error("modulo by zero")),
            BinaryOp::Mod => x.checked_rem(y).map(|r| floor_mod(r, y)),
            _ => None,
        };
        if let Some(result) = result {
            return Ok(Value::from(result));
        }
        if op != BinaryOp::Div {
            return Err(type_error("integer overflow"));
        }
    }

    let (x, y) = (as_f64(&a), as_f64(&b));
    let result = match op {
        BinaryOp::Add => x + y,
        BinaryOp::Sub => x - y,
        BinaryOp::Mul => x * y,
        BinaryOp::Div if y == 0.0 => return Err(type_error("division by zero")),
        BinaryOp::Div => x / y,
        BinaryOp::Mod if y == 0.0 => return Err(type_error("modulo by zero")),
        _ => {
            let r = x % y;
            if r != 0.0 && (r < 0.0) != (y < 0.0) { r + y } else { r }
        }
    };
    float_value(result)
}

/// Remainder taking the sign of the divisor, so `-7 % 3 == 2`.
fn floor_mod(r: i64, divisor: i64) -> i64 {
    if r != 0 && (r < 0) != (divisor < 0) { r + divisor } else { r }
}

/// Equality with numbers compared by value, so `1 == 1.0`.
fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => match (a.as_i64(), b.as_i64()) {
            (Some(x), Some(y)) => x == y,
            _ => as_f64(a) == as_f64(b),
        },
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| values_equal(x, y))
        }
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && a.iter()
                    .all(|(k, v)| b.get(k).is_some_and(|other| values_equal(v, other)))
        }
        _ => left == right,
    }
}

fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Array(a), Value::Array(b)) => {
            for (x, y) in a.iter().zip(b) {
                match compare(x, y)? {
                    Ordering::Equal => continue,
                    other => return Some(other),
                }
            }
            Some(a.len().cmp(&b.len()))
        }
        _ => {
            let (a, b) = (numeric(left)?, numeric(right)?);
            match (a.as_i64(), b.as_i64()) {
                (Some(x), Some(y)) => Some(x.cmp(&y)),
                _ => as_f64(&a).partial_cmp(&as_f64(&b)),
            }
        }
    }
}

/// `needle in haystack`.
fn contains(haystack: &Value, needle: &Value) -> Result<bool, ExpressionError> {
    match (haystack, needle) {
        (Value::String(h), Value::String(n)) => Ok(h.contains(n.as_str())),
        (Value::Array(items), _) => Ok(items.iter().any(|item| values_equal(item, needle))),
        (Value::Object(map), Value::String(key)) => Ok(map.contains_key(key)),
        _ => Err(type_error(&format!(
            "'in' not supported between {} and {}",
            type_name(needle),
            type_name(haystack)
        ))),
    }
}

fn member(object: &Value, property: &str) -> Result<Value, ExpressionError> {
    match object {
        Value::Object(map) => map
            .get(property)
            .cloned()
            .ok_or_else(|| type_error(&format!("object has no member '{property}'"))),
        Value::Array(_) | Value::String(_) => match property.parse::<i64>() {
            Ok(i) => index_value(object, &Value::from(i)),
            Err(_) => Err(type_error(&format!(
                "{} has no member '{property}'",
                type_name(object)
            ))),
        },
        other => Err(type_error(&format!(
            "{} has no member '{property}'",
            type_name(other)
        ))),
    }
}

fn index_value(object: &Value, index: &Value) -> Result<Value, ExpressionError> {
    match (object, index) {
        (Value::Object(map), Value::String(key)) => map
            .get(key)
            .cloned()
            .ok_or_else(|| type_error(&format!("key '{key}' not found"))),
        (Value::Array(items), Value::Number(n)) => {
            let i = position(n, items.len())?;
            Ok(items[i].clone())
        }
        (Value::String(s), Value::Number(n)) => {
            let chars: Vec<char> = s.chars().collect();
            let i = position(n, chars.len())?;
            Ok(Value::String(chars[i].to_string()))
        }
        _ => Err(type_error(&format!(
            "{} cannot be indexed by {}",
            type_name(object),
            type_name(index)
        ))),
    }
}

/// Resolve a possibly negative index against `len`.
fn position(n: &Number, len: usize) -> Result<usize, ExpressionError> {
    let i = n
        .as_i64()
        .ok_or_else(|| type_error("index must be an integer"))?;
    let resolved = if i < 0 { len as i64 + i } else { i };
    if resolved < 0 || resolved >= len as i64 {
        return Err(type_error(&format!("index {i} out of range")));
    }
    Ok(resolved as usize)
}

// ---------------------------------------------------------------------------
// Builtin functions
// ---------------------------------------------------------------------------

fn call(name: &str, args: &[Value]) -> Result<Value, ExpressionError> {
    match name {
        "bool" => {
            let [value] = expect_args::<1>(name, args)?;
            Ok(Value::Bool(is_truthy(value)))
        }
        "int" => {
            let [value] = expect_args::<1>(name, args)?;
            to_int(value)
        }
        "float" => {
            let [value] = expect_args::<1>(name, args)?;
            let f = match value {
                Value::Number(n) => as_f64(n),
                Value::Bool(b) => f64::from(u8::from(*b)),
                Value::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .map_err(|_| type_error(&format!("could not convert string to float: '{s}'")))?,
                other => {
                    return Err(type_error(&format!(
                        "float() argument must be a string or a number, not {}",
                        type_name(other)
                    )));
                }
            };
            float_value(f)
        }
        "str" => {
            let [value] = expect_args::<1>(name, args)?;
            Ok(Value::String(display(value)))
        }
        "len" => {
            let [value] = expect_args::<1>(name, args)?;
            let len = match value {
                Value::String(s) => s.chars().count(),
                Value::Array(items) => items.len(),
                Value::Object(map) => map.len(),
                other => {
                    return Err(type_error(&format!(
                        "object of type {} has no len()",
                        type_name(other)
                    )));
                }
            };
            Ok(Value::from(len as u64))
        }
        "abs" => {
            let [value] = expect_args::<1>(name, args)?;
            let n = numeric(value).ok_or_else(|| {
                type_error(&format!("bad operand type for abs(): {}", type_name(value)))
            })?;
            match n.as_i64() {
                Some(i) => i
                    .checked_abs()
                    .map(Value::from)
                    .ok_or_else(|| type_error("integer overflow")),
                None => float_value(as_f64(&n).abs()),
            }
        }
        "min" | "max" => {
            let items: &[Value] = match args {
                [Value::Array(items)] => items.as_slice(),
                [_] | [] => {
                    return Err(type_error(&format!(
                        "{name}() expects a list or at least two arguments"
                    )));
                }
                _ => args,
            };
            let wanted = if name == "min" { Ordering::Less } else { Ordering::Greater };
            let mut best = items
                .first()
                .ok_or_else(|| type_error(&format!("{name}() arg is an empty sequence")))?;
            for item in &items[1..] {
                let ordering = compare(item, best).ok_or_else(|| {
                    type_error(&format!(
                        "{name}() cannot compare {} and {}",
                        type_name(item),
                        type_name(best)
                    ))
                })?;
                if ordering == wanted {
                    best = item;
                }
            }
            Ok(best.clone())
        }
        other => Err(ExpressionError::UnknownFunction(other.to_string())),
    }
}

fn expect_args<'a, const N: usize>(
    name: &str,
    args: &'a [Value],
) -> Result<&'a [Value; N], ExpressionError> {
    args.try_into().map_err(|_| {
        type_error(&format!(
            "{name}() takes {N} argument(s), got {}",
            args.len()
        ))
    })
}

fn to_int(value: &Value) -> Result<Value, ExpressionError> {
    match value {
        Value::Number(n) => match n.as_i64() {
            Some(i) => Ok(Value::from(i)),
            None => {
                let f = as_f64(n).trunc();
                if f.is_finite() && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
                    Ok(Value::from(f as i64))
                } else {
                    Err(type_error("cannot convert float to integer"))
                }
            }
        },
        Value::Bool(b) => Ok(Value::from(i64::from(*b))),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map(Value::from)
            .map_err(|_| type_error(&format!("invalid literal for int(): '{s}'"))),
        other => Err(type_error(&format!(
            "int() argument must be a string or a number, not {}",
            type_name(other)
        ))),
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Numeric view of a value; booleans count as 0 and 1.
fn numeric(value: &Value) -> Option<Number> {
    match value {
        Value::Number(n) => Some(n.clone()),
        Value::Bool(b) => Some(Number::from(i64::from(*b))),
        _ => None,
    }
}

fn as_f64(n: &Number) -> f64 {
    n.as_f64().unwrap_or(0.0)
}

fn float_value(f: f64) -> Result<Value, ExpressionError> {
    Number::from_f64(f)
        .map(Value::Number)
        .ok_or_else(|| type_error("result is not a finite number"))
}

fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "None".to_string(),
        Value::Bool(true) => "True".to_string(),
        Value::Bool(false) => "False".to_string(),
        Value::Number(n) => n.to_string(),
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "int",
        Value::String(_) => "str",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

fn type_error(message: &str) -> ExpressionError {
    ExpressionError::Type(message.to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
