//! Step condition evaluation.
//!
//! Conditions are interpolated first, then parsed as a small boolean
//! expression language: `||`, `&&`, `!`, comparisons
//! (`== != > >= < <=`), parentheses, and literals. Bare words evaluate as
//! string literals, which is exactly what an interpolated reference leaves
//! behind. Anything malformed evaluates to `false` and skips the step.

use serde_json::Value;
use tracing::warn;

use crate::workflow::interpolate::interpolate_string;

/// Evaluates a condition against the execution context. Malformed or
/// throwing conditions are `false`.
pub fn evaluate_condition(expression: &str, context: &Value) -> bool {
    let interpolated = match interpolate_string(expression, context) {
        Value::String(s) => s,
        // The whole condition was a single reference; use its truthiness.
        other => return truthy(&other),
    };
    match parse_and_eval(&interpolated) {
        Ok(value) => truthy(&value),
        Err(error) => {
            warn!(expression, error = %error, "condition failed to evaluate; skipping step");
            false
        }
    }
}

fn parse_and_eval(input: &str) -> Result<Value, String> {
    let tokens = tokenize(input)?;
    Parser {
        tokens,
        position: 0,
    }
    .parse()
}

pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Reads a value in the numeric class: JSON numbers directly, strings when
/// they parse as a number after trimming.
fn numeric_of(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Reads a value in the boolean class: JSON booleans directly, the words
/// `true`/`false` in any casing.
fn flag_of(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) if s.eq_ignore_ascii_case("true") => Some(true),
        Value::String(s) if s.eq_ignore_ascii_case("false") => Some(false),
        _ => None,
    }
}

/// Loose equality. Exact matches win outright; otherwise both sides are
/// compared in the widest class they share, numbers before booleans.
/// Collections never equal anything they are not identical to.
fn values_equal(left: &Value, right: &Value) -> bool {
    if left == right {
        return true;
    }
    if matches!(left, Value::Array(_) | Value::Object(_))
        || matches!(right, Value::Array(_) | Value::Object(_))
    {
        return false;
    }
    if let (Some(a), Some(b)) = (numeric_of(left), numeric_of(right)) {
        return a == b;
    }
    matches!((flag_of(left), flag_of(right)), (Some(a), Some(b)) if a == b)
}

/// Both sides in the numeric class, or an error naming the refusing side.
fn numeric_pair(left: &Value, right: &Value) -> Result<(f64, f64), String> {
    let a = numeric_of(left).ok_or_else(|| format!("not numeric: {left}"))?;
    let b = numeric_of(right).ok_or_else(|| format!("not numeric: {right}"))?;
    Ok((a, b))
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    Not,
    And,
    Or,
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Literal(Value),
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\r' | '\n' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '&' => {
                if chars.get(i + 1) == Some(&'&') {
                    tokens.push(Token::And);
                    i += 2;
                } else {
                    return Err("single '&'".to_string());
                }
            }
            '|' => {
                if chars.get(i + 1) == Some(&'|') {
                    tokens.push(Token::Or);
                    i += 2;
                } else {
                    return Err("single '|'".to_string());
                }
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Eq);
                    i += 2;
                } else {
                    return Err("single '='".to_string());
                }
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ne);
                    i += 2;
                } else {
                    tokens.push(Token::Not);
                    i += 1;
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ge);
                    i += 2;
                } else {
                    tokens.push(Token::Gt);
                    i += 1;
                }
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Le);
                    i += 2;
                } else {
                    tokens.push(Token::Lt);
                    i += 1;
                }
            }
            '\'' | '"' => {
                let quote = c;
                let mut literal = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            literal.push(ch);
                            i += 1;
                        }
                        None => return Err("unterminated string".to_string()),
                    }
                }
                tokens.push(Token::Literal(Value::String(literal)));
            }
            _ => {
                let mut word = String::new();
                while let Some(&ch) = chars.get(i) {
                    if ch.is_whitespace() || "()&|!=<>".contains(ch) {
                        break;
                    }
                    word.push(ch);
                    i += 1;
                }
                if word.is_empty() {
                    return Err(format!("unexpected character '{c}'"));
                }
                tokens.push(Token::Literal(word_to_value(word)));
            }
        }
    }
    Ok(tokens)
}

fn word_to_value(word: String) -> Value {
    match word.as_str() {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        "null" => Value::Null,
        _ => match word.parse::<f64>() {
            Ok(number) => serde_json::Number::from_f64(number)
                .map(Value::Number)
                .unwrap_or(Value::String(word)),
            Err(_) => Value::String(word),
        },
    }
}

struct Parser {
    tokens: Vec<Token>,
    position: usize,
}

impl Parser {
    fn parse(mut self) -> Result<Value, String> {
        if self.tokens.is_empty() {
            return Err("empty expression".to_string());
        }
        let value = self.parse_or()?;
        if self.position != self.tokens.len() {
            return Err("trailing tokens".to_string());
        }
        Ok(value)
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.position).cloned();
        if token.is_some() {
            self.position += 1;
        }
        token
    }

    fn parse_or(&mut self) -> Result<Value, String> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.advance();
            let right = self.parse_and()?;
            left = Value::Bool(truthy(&left) || truthy(&right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Value, String> {
        let mut left = self.parse_not()?;
        while self.peek() == Some(&Token::And) {
            self.advance();
            let right = self.parse_not()?;
            left = Value::Bool(truthy(&left) && truthy(&right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Value, String> {
        if self.peek() == Some(&Token::Not) {
            self.advance();
            let value = self.parse_not()?;
            return Ok(Value::Bool(!truthy(&value)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Value, String> {
        enum Cmp {
            Eq,
            Ne,
            Gt,
            Ge,
            Lt,
            Le,
        }

        let left = self.parse_primary()?;
        let op = match self.peek() {
            Some(Token::Eq) => Cmp::Eq,
            Some(Token::Ne) => Cmp::Ne,
            Some(Token::Gt) => Cmp::Gt,
            Some(Token::Ge) => Cmp::Ge,
            Some(Token::Lt) => Cmp::Lt,
            Some(Token::Le) => Cmp::Le,
            _ => return Ok(left),
        };
        self.advance();
        let right = self.parse_primary()?;
        let result = match op {
            Cmp::Eq => values_equal(&left, &right),
            Cmp::Ne => !values_equal(&left, &right),
            Cmp::Gt => {
                let (a, b) = numeric_pair(&left, &right)?;
                a > b
            }
            Cmp::Ge => {
                let (a, b) = numeric_pair(&left, &right)?;
                a >= b
            }
            Cmp::Lt => {
                let (a, b) = numeric_pair(&left, &right)?;
                a < b
            }
            Cmp::Le => {
                let (a, b) = numeric_pair(&left, &right)?;
                a <= b
            }
        };
        Ok(Value::Bool(result))
    }

    fn parse_primary(&mut self) -> Result<Value, String> {
        match self.advance() {
            Some(Token::LParen) => {
                let value = self.parse_or()?;
                if self.advance() != Some(Token::RParen) {
                    return Err("missing ')'".to_string());
                }
                Ok(value)
            }
            Some(Token::Literal(value)) => Ok(value),
            other => Err(format!("unexpected token {other:?}")),
        }
    }
}
