#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};

use dq_runtime::RuntimePolicy;
use dq_types::{Row, Scalar};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FieldRef(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryOp {
    #[must_use]
    pub fn apply(self, left: f64, right: f64) -> f64 {
        match self {
            Self::Add => left + right,
            Self::Sub => left - right,
            Self::Mul => left * right,
            Self::Div => left / right,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Expr {
    Number {
        value: f64,
    },
    Field {
        name: FieldRef,
    },
    Neg {
        expr: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
}

impl Expr {
    /// Every field name the expression reads.
    #[must_use]
    pub fn field_refs(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_fields(&mut out);
        out
    }

    fn collect_fields(&self, out: &mut BTreeSet<String>) {
        match self {
            Self::Number { .. } => {}
            Self::Field { name } => {
                out.insert(name.0.clone());
            }
            Self::Neg { expr } => expr.collect_fields(out),
            Self::Binary { left, right, .. } => {
                left.collect_fields(out);
                right.collect_fields(out);
            }
        }
    }
}

/// Numeric bindings visible to an expression.
///
/// Fields present in the source row but without a numeric value are kept
/// aside so a reference to them fails as "not numeric" rather than "unknown".
#[derive(Debug, Clone, Default)]
pub struct EvalContext {
    values: BTreeMap<String, f64>,
    non_numeric: BTreeSet<String>,
}

impl EvalContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: f64) {
        let name = name.into();
        self.non_numeric.remove(&name);
        self.values.insert(name, value);
    }

    pub fn insert_scalar(&mut self, name: impl Into<String>, value: &Scalar) {
        let name = name.into();
        match value {
            Scalar::Int64(_) | Scalar::Float64(_) | Scalar::Bool(_) => {
                if let Ok(number) = value.to_f64() {
                    self.insert(name, number);
                }
            }
            _ => {
                self.values.remove(&name);
                self.non_numeric.insert(name);
            }
        }
    }

    #[must_use]
    pub fn from_row(row: &Row) -> Self {
        let mut context = Self::new();
        for (name, value) in row.iter() {
            context.insert_scalar(name, value);
        }
        context
    }

    pub fn get(&self, name: &str) -> Result<f64, ExpressionError> {
        if let Some(value) = self.values.get(name) {
            return Ok(*value);
        }
        if self.non_numeric.contains(name) {
            return Err(ExpressionError::NonNumericField(name.to_owned()));
        }
        Err(ExpressionError::UnknownField(name.to_owned()))
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExpressionError {
    #[error("expression is empty")]
    Empty,
    #[error("expression is {len} characters long; the limit is {max}")]
    TooLong { len: usize, max: usize },
    #[error("disallowed character {ch:?} at offset {offset}")]
    DisallowedCharacter { ch: char, offset: usize },
    #[error("expression nests deeper than {max} levels")]
    TooDeep { max: usize },
    #[error("parse error: {0}")]
    Parse(String),
    #[error("unknown field: {0}")]
    UnknownField(String),
    #[error("field {0} is not numeric")]
    NonNumericField(String),
}

pub fn evaluate(expr: &Expr, context: &EvalContext) -> Result<f64, ExpressionError> {
    match expr {
        Expr::Number { value } => Ok(*value),
        Expr::Field { name } => context.get(&name.0),
        Expr::Neg { expr } => Ok(-evaluate(expr, context)?),
        Expr::Binary { op, left, right } => {
            let lhs = evaluate(left, context)?;
            let rhs = evaluate(right, context)?;
            Ok(op.apply(lhs, rhs))
        }
    }
}

/// Parse and evaluate in one step.
pub fn eval_str(
    input: &str,
    context: &EvalContext,
    policy: &RuntimePolicy,
) -> Result<f64, ExpressionError> {
    let expr = parse_expr(input, policy)?;
    evaluate(&expr, context)
}

// ── Validation ──────────────────────────────────────────────────────────

fn is_allowed_char(c: char) -> bool {
    c.is_ascii_alphanumeric()
        || c.is_ascii_whitespace()
        || matches!(c, '_' | '+' | '-' | '*' | '/' | '(' | ')' | '.')
}

/// Length cap and character allow-list, checked before tokenizing.
pub fn validate_source(input: &str, policy: &RuntimePolicy) -> Result<(), ExpressionError> {
    let len = input.chars().count();
    if len > policy.max_expression_len {
        return Err(ExpressionError::TooLong {
            len,
            max: policy.max_expression_len,
        });
    }
    if let Some((offset, ch)) = input.char_indices().find(|(_, c)| !is_allowed_char(*c)) {
        return Err(ExpressionError::DisallowedCharacter { ch, offset });
    }
    if input.trim().is_empty() {
        return Err(ExpressionError::Empty);
    }
    Ok(())
}

// ── Parser ──────────────────────────────────────────────────────────────

/// Parse a formula into an `Expr` AST.
///
/// Syntax:
///   expr  → term ( ("+" | "-") term )*
///   term  → unary ( ("*" | "/") unary )*
///   unary → "-" unary | atom
///   atom  → NUMBER | IDENT | "(" expr ")"
pub fn parse_expr(input: &str, policy: &RuntimePolicy) -> Result<Expr, ExpressionError> {
    validate_source(input, policy)?;
    let tokens = tokenize(input)?;
    let mut parser = Parser {
        tokens: &tokens,
        pos: 0,
        depth: 0,
        max_depth: policy.max_expression_depth,
    };
    let result = parser.parse_add()?;
    if let Some(token) = parser.peek() {
        return Err(ExpressionError::Parse(format!(
            "unexpected token at position {}: {token:?}",
            parser.pos
        )));
    }
    Ok(result)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>, ExpressionError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }
        match c {
            '+' => tokens.push(Token::Plus),
            '-' => tokens.push(Token::Minus),
            '*' => tokens.push(Token::Star),
            '/' => tokens.push(Token::Slash),
            '(' => tokens.push(Token::LParen),
            ')' => tokens.push(Token::RParen),
            _ if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let num_str: String = chars[start..i].iter().collect();
                let value = num_str
                    .parse::<f64>()
                    .map_err(|_| ExpressionError::Parse(format!("invalid number: {num_str}")))?;
                tokens.push(Token::Number(value));
                continue;
            }
            _ if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
                continue;
            }
            _ => {
                return Err(ExpressionError::Parse(format!(
                    "unexpected character: '{c}'"
                )));
            }
        }
        i += 1;
    }
    Ok(tokens)
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    depth: usize,
    max_depth: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn descend(&mut self) -> Result<(), ExpressionError> {
        self.depth += 1;
        if self.depth > self.max_depth {
            return Err(ExpressionError::TooDeep {
                max: self.max_depth,
            });
        }
        Ok(())
    }

    fn parse_add(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_mul()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_mul()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_mul(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ExpressionError> {
        if self.peek() == Some(&Token::Minus) {
            self.pos += 1;
            self.descend()?;
            let inner = self.parse_unary()?;
            self.depth -= 1;
            return Ok(Expr::Neg {
                expr: Box::new(inner),
            });
        }
        self.parse_atom()
    }

    fn parse_atom(&mut self) -> Result<Expr, ExpressionError> {
        let Some(token) = self.peek().cloned() else {
            return Err(ExpressionError::Parse(
                "unexpected end of expression".into(),
            ));
        };
        self.pos += 1;
        match token {
            Token::Number(value) => Ok(Expr::Number { value }),
            Token::Ident(name) => Ok(Expr::Field {
                name: FieldRef(name),
            }),
            Token::LParen => {
                self.descend()?;
                let inner = self.parse_add()?;
                if self.peek() != Some(&Token::RParen) {
                    return Err(ExpressionError::Parse("expected closing ')'".into()));
                }
                self.pos += 1;
                self.depth -= 1;
                Ok(inner)
            }
            other => Err(ExpressionError::Parse(format!(
                "unexpected token: {other:?}"
            ))),
        }
    }
}
