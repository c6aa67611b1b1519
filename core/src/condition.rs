//! Condition expressions for conditional tool calls.
//!
//! A conditional call carries a small boolean expression evaluated at the
//! moment the call becomes ready, against the results of its completed
//! dependencies. Each dependency is visible as a variable named by its
//! toolId, an object of the form `{"status": "succeeded", "value": ...}`,
//! so expressions read like:
//!
//! - `check.status == "succeeded"`
//! - `fetch.value.count > 3 && !probe.value.degraded`
//!
//! Supported: `==`, `!=`, `<`, `<=`, `>`, `>=`, `&&`, `||`, `!`,
//! parentheses, string/number/bool/null literals, and dotted path access
//! (numeric segments index into arrays).

use std::collections::HashMap;

use serde_json::Value;

use crate::errors::{ConditionError, ConditionResult};

/// Completed-dependency values a condition is evaluated against.
#[derive(Debug, Clone, Default)]
pub struct ConditionContext {
    vars: HashMap<String, Value>,
}

impl ConditionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_var(mut self, name: &str, value: Value) -> Self {
        self.vars.insert(name.to_string(), value);
        self
    }

    pub fn set(&mut self, name: &str, value: Value) {
        self.vars.insert(name.to_string(), value);
    }

    /// Resolve a dotted path like `fetch.value.items.0`.
    fn get(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let root = self.vars.get(parts.next()?)?;
        parts.try_fold(root, |value, part| match value {
            Value::Object(map) => map.get(part),
            Value::Array(arr) => part.parse::<usize>().ok().and_then(|i| arr.get(i)),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Variable(String),
    Binary {
        left: Box<Expr>,
        op: BinaryOp,
        right: Box<Expr>,
    },
    Not(Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinaryOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinaryOp {
    fn precedence(&self) -> u8 {
        match self {
            BinaryOp::Or => 1,
            BinaryOp::And => 2,
            BinaryOp::Eq | BinaryOp::Ne => 3,
            BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Bool(bool),
    Null,
    Path(String),
    Op(BinaryOp),
    Not,
    LParen,
    RParen,
    Eof,
}

struct Tokenizer<'a> {
    input: &'a str,
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
    pos: usize,
}

impl<'a> Tokenizer<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input,
            chars: input.char_indices().peekable(),
            pos: 0,
        }
    }

    fn error(&self, position: usize, message: impl Into<String>) -> ConditionError {
        ConditionError::ParseError {
            position,
            message: message.into(),
        }
    }

    fn next_token(&mut self) -> ConditionResult<Token> {
        while matches!(self.chars.peek(), Some((_, c)) if c.is_whitespace()) {
            self.chars.next();
        }

        let (pos, ch) = match self.chars.next() {
            Some((pos, ch)) => {
                self.pos = pos;
                (pos, ch)
            }
            None => return Ok(Token::Eof),
        };

        match ch {
            '(' => Ok(Token::LParen),
            ')' => Ok(Token::RParen),
            '=' => match self.eat('=') {
                true => Ok(Token::Op(BinaryOp::Eq)),
                false => Err(self.error(pos, "expected '==' ")),
            },
            '!' => match self.eat('=') {
                true => Ok(Token::Op(BinaryOp::Ne)),
                false => Ok(Token::Not),
            },
            '<' => Ok(Token::Op(if self.eat('=') { BinaryOp::Le } else { BinaryOp::Lt })),
            '>' => Ok(Token::Op(if self.eat('=') { BinaryOp::Ge } else { BinaryOp::Gt })),
            '&' => match self.eat('&') {
                true => Ok(Token::Op(BinaryOp::And)),
                false => Err(self.error(pos, "expected '&&'")),
            },
            '|' => match self.eat('|') {
                true => Ok(Token::Op(BinaryOp::Or)),
                false => Err(self.error(pos, "expected '||'")),
            },
            '"' => self.read_string(),
            '0'..='9' | '-' => self.read_number(pos, ch),
            c if c.is_ascii_alphabetic() || c == '_' => Ok(self.read_path(c)),
            c => Err(self.error(pos, format!("unexpected character '{c}'"))),
        }
    }

    fn eat(&mut self, expected: char) -> bool {
        if matches!(self.chars.peek(), Some((_, c)) if *c == expected) {
            self.chars.next();
            return true;
        }
        false
    }

    fn read_string(&mut self) -> ConditionResult<Token> {
        let mut s = String::new();
        loop {
            match self.chars.next() {
                Some((_, '"')) => return Ok(Token::Str(s)),
                Some((_, '\\')) => match self.chars.next() {
                    Some((_, 'n')) => s.push('\n'),
                    Some((_, 't')) => s.push('\t'),
                    Some((_, c @ ('"' | '\\'))) => s.push(c),
                    Some((p, c)) => return Err(self.error(p, format!("unknown escape '\\{c}'"))),
                    None => return Err(self.error(self.input.len(), "unterminated string")),
                },
                Some((_, c)) => s.push(c),
                None => return Err(self.error(self.input.len(), "unterminated string")),
            }
        }
    }

    fn read_number(&mut self, start: usize, first: char) -> ConditionResult<Token> {
        let mut s = String::from(first);
        while matches!(self.chars.peek(), Some((_, c)) if c.is_ascii_digit() || *c == '.') {
            s.push(self.chars.next().unwrap().1);
        }
        s.parse::<f64>()
            .map(Token::Number)
            .map_err(|_| self.error(start, format!("invalid number '{s}'")))
    }

    fn read_path(&mut self, first: char) -> Token {
        let mut s = String::from(first);
        while matches!(self.chars.peek(), Some((_, c))
            if c.is_alphanumeric() || matches!(c, '_' | '-' | '.'))
        {
            s.push(self.chars.next().unwrap().1);
        }
        match s.as_str() {
            "true" => Token::Bool(true),
            "false" => Token::Bool(false),
            "null" => Token::Null,
            _ => Token::Path(s),
        }
    }
}

struct Parser<'a> {
    tokenizer: Tokenizer<'a>,
    current: Token,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> ConditionResult<Self> {
        let mut tokenizer = Tokenizer::new(input);
        let current = tokenizer.next_token()?;
        Ok(Self { tokenizer, current })
    }

    fn advance(&mut self) -> ConditionResult<()> {
        self.current = self.tokenizer.next_token()?;
        Ok(())
    }

    fn parse(&mut self) -> ConditionResult<Expr> {
        if self.current == Token::Eof {
            return Err(ConditionError::EmptyExpression);
        }
        let expr = self.parse_expression(0)?;
        if self.current != Token::Eof {
            return Err(ConditionError::ParseError {
                position: self.tokenizer.pos,
                message: format!("unexpected trailing token {:?}", self.current),
            });
        }
        Ok(expr)
    }

    fn parse_expression(&mut self, min_precedence: u8) -> ConditionResult<Expr> {
        let mut left = self.parse_unary()?;
        while let Token::Op(op) = self.current {
            if op.precedence() < min_precedence {
                break;
            }
            self.advance()?;
            let right = self.parse_expression(op.precedence() + 1)?;
            left = Expr::Binary {
                left: Box::new(left),
                op,
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> ConditionResult<Expr> {
        if self.current == Token::Not {
            self.advance()?;
            return Ok(Expr::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> ConditionResult<Expr> {
        let expr = match &self.current {
            Token::Number(n) => Expr::Literal(
                serde_json::Number::from_f64(*n)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
            ),
            Token::Str(s) => Expr::Literal(Value::String(s.clone())),
            Token::Bool(b) => Expr::Literal(Value::Bool(*b)),
            Token::Null => Expr::Literal(Value::Null),
            Token::Path(p) => Expr::Variable(p.clone()),
            Token::LParen => {
                self.advance()?;
                let inner = self.parse_expression(0)?;
                if self.current != Token::RParen {
                    return Err(ConditionError::ParseError {
                        position: self.tokenizer.pos,
                        message: "expected ')'".to_string(),
                    });
                }
                inner
            }
            other => {
                return Err(ConditionError::ParseError {
                    position: self.tokenizer.pos,
                    message: format!("unexpected token {other:?}"),
                })
            }
        };
        self.advance()?;
        Ok(expr)
    }
}

/// Evaluate a condition expression to a boolean.
pub fn evaluate(expression: &str, ctx: &ConditionContext) -> ConditionResult<bool> {
    let expr = Parser::new(expression)?.parse()?;
    Ok(truthy(&eval(&expr, ctx)?))
}

fn eval(expr: &Expr, ctx: &ConditionContext) -> ConditionResult<Value> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Variable(path) => ctx
            .get(path)
            .cloned()
            .ok_or_else(|| ConditionError::UnknownVariable(path.clone())),
        Expr::Not(inner) => Ok(Value::Bool(!truthy(&eval(inner, ctx)?))),
        Expr::Binary { left, op, right } => {
            let l = eval(left, ctx)?;
            let r = eval(right, ctx)?;
            binary(*op, &l, &r)
        }
    }
}

fn binary(op: BinaryOp, left: &Value, right: &Value) -> ConditionResult<Value> {
    let out = match op {
        BinaryOp::And => Value::Bool(truthy(left) && truthy(right)),
        BinaryOp::Or => Value::Bool(truthy(left) || truthy(right)),
        BinaryOp::Eq => Value::Bool(loose_eq(left, right)),
        BinaryOp::Ne => Value::Bool(!loose_eq(left, right)),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let (a, b) = match (left.as_f64(), right.as_f64()) {
                (Some(a), Some(b)) => (a, b),
                _ => {
                    return Err(ConditionError::TypeError(format!(
                        "ordering comparison needs numbers, got {left} and {right}"
                    )))
                }
            };
            Value::Bool(match op {
                BinaryOp::Lt => a < b,
                BinaryOp::Le => a <= b,
                BinaryOp::Gt => a > b,
                _ => a >= b,
            })
        }
    };
    Ok(out)
}

/// Numeric equality compares by value so `1 == 1.0` holds.
fn loose_eq(left: &Value, right: &Value) -> bool {
    match (left.as_f64(), right.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => left == right,
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(_) => true,
    }
}
