//! Built-in selector language
//!
//! A small CEL-flavoured expression language over one device:
//!
//! ```text
//! device.driver == "gpu.example.com"
//!     && device.attributes["gpu.example.com/model"] == "a100"
//!     && device.capacity["memory"] >= quantity("40Gi")
//!     && (!has(device.attributes["mig"]) || device.attributes["mig"] == false)
//!     && device.attributes["driverVersion"] >= semver("535.0.0")
//! ```
//!
//! Like CEL, reading a key the device does not have is a runtime error, so
//! optional keys must be guarded with `has(...)`.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use super::{DeviceMatcher, DeviceView, Evaluation, SelectorEngine, SelectorError};
use crate::model::{DeviceAttribute, Quantity};

/// Engine for the built-in language. Stateless; wrap it in a
/// [`super::SelectorCache`] to avoid recompiling.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExpressionEngine;

impl SelectorEngine for ExpressionEngine {
    fn compile(&self, expression: &str) -> Result<Arc<dyn DeviceMatcher>, SelectorError> {
        let tokens = tokenize(expression)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
        };
        let expr = parser.parse_or()?;
        if let Some(token) = parser.peek() {
            return Err(SelectorError::Compile(format!(
                "unexpected {} after end of expression",
                token
            )));
        }
        Ok(Arc::new(Program { expr }))
    }
}

// ============================================================================
// Lexer
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Int(i64),
    Dot,
    Comma,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Not,
    And,
    Or,
    Cmp(CmpOp),
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ident(s) => write!(f, "'{}'", s),
            Token::Str(s) => write!(f, "{:?}", s),
            Token::Int(i) => write!(f, "{}", i),
            Token::Dot => f.write_str("'.'"),
            Token::Comma => f.write_str("','"),
            Token::LParen => f.write_str("'('"),
            Token::RParen => f.write_str("')'"),
            Token::LBracket => f.write_str("'['"),
            Token::RBracket => f.write_str("']'"),
            Token::Not => f.write_str("'!'"),
            Token::And => f.write_str("'&&'"),
            Token::Or => f.write_str("'||'"),
            Token::Cmp(op) => write!(f, "'{}'", op),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl fmt::Display for CmpOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        })
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, SelectorError> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some((pos, c)) = chars.next() {
        let token = match c {
            c if c.is_whitespace() => continue,
            '.' => Token::Dot,
            ',' => Token::Comma,
            '(' => Token::LParen,
            ')' => Token::RParen,
            '[' => Token::LBracket,
            ']' => Token::RBracket,
            '&' | '|' => {
                if chars.next_if(|(_, n)| *n == c).is_none() {
                    return Err(SelectorError::Compile(format!(
                        "expected '{}{}' at offset {}",
                        c, c, pos
                    )));
                }
                if c == '&' {
                    Token::And
                } else {
                    Token::Or
                }
            }
            '!' => {
                if chars.next_if(|(_, n)| *n == '=').is_some() {
                    Token::Cmp(CmpOp::Ne)
                } else {
                    Token::Not
                }
            }
            '=' => {
                if chars.next_if(|(_, n)| *n == '=').is_none() {
                    return Err(SelectorError::Compile(format!(
                        "expected '==' at offset {}",
                        pos
                    )));
                }
                Token::Cmp(CmpOp::Eq)
            }
            '<' | '>' => {
                let or_equal = chars.next_if(|(_, n)| *n == '=').is_some();
                Token::Cmp(match (c, or_equal) {
                    ('<', false) => CmpOp::Lt,
                    ('<', true) => CmpOp::Le,
                    ('>', false) => CmpOp::Gt,
                    _ => CmpOp::Ge,
                })
            }
            '"' | '\'' => Token::Str(lex_string(c, pos, &mut chars)?),
            c if c.is_ascii_digit() || (c == '-' && chars.peek().is_some_and(|(_, n)| n.is_ascii_digit())) => {
                let mut text = String::from(c);
                while let Some((_, d)) = chars.next_if(|(_, d)| d.is_ascii_digit()) {
                    text.push(d);
                }
                let value = text.parse().map_err(|_| {
                    SelectorError::Compile(format!("integer literal {} out of range", text))
                })?;
                Token::Int(value)
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut ident = String::from(c);
                while let Some((_, d)) = chars.next_if(|(_, d)| d.is_ascii_alphanumeric() || *d == '_') {
                    ident.push(d);
                }
                Token::Ident(ident)
            }
            other => {
                return Err(SelectorError::Compile(format!(
                    "unexpected character {:?} at offset {}",
                    other, pos
                )));
            }
        };
        tokens.push(token);
    }

    Ok(tokens)
}

fn lex_string(
    quote: char,
    start: usize,
    chars: &mut std::iter::Peekable<std::str::CharIndices<'_>>,
) -> Result<String, SelectorError> {
    let mut value = String::new();
    while let Some((_, c)) = chars.next() {
        match c {
            c if c == quote => return Ok(value),
            '\\' => match chars.next() {
                Some((_, 'n')) => value.push('\n'),
                Some((_, 't')) => value.push('\t'),
                Some((_, escaped)) => value.push(escaped),
                None => break,
            },
            c => value.push(c),
        }
    }
    Err(SelectorError::Compile(format!(
        "unterminated string starting at offset {}",
        start
    )))
}

// ============================================================================
// Parser
// ============================================================================

#[derive(Debug, Clone)]
enum Expr {
    Literal(Value),
    Driver,
    Attribute(String),
    Capacity(String),
    Has(Box<Expr>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(CmpOp, Box<Expr>, Box<Expr>),
}

/// Bound on nested parentheses, negations and chained `&&`/`||` operators.
/// The parser enforces it so the tree, and every recursive walk over it,
/// stays shallow.
const MAX_NESTING_DEPTH: usize = 100;

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn descend(&mut self) -> Result<(), SelectorError> {
        self.depth += 1;
        if self.depth > MAX_NESTING_DEPTH {
            return Err(SelectorError::Compile(
                "expression nested too deeply".to_string(),
            ));
        }
        Ok(())
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: Token) -> Result<(), SelectorError> {
        match self.next() {
            Some(token) if token == expected => Ok(()),
            Some(token) => Err(SelectorError::Compile(format!(
                "expected {}, found {}",
                expected, token
            ))),
            None => Err(SelectorError::Compile(format!(
                "expected {}, found end of expression",
                expected
            ))),
        }
    }

    // Chains fold to the left, so each operator adds a level.
    fn parse_or(&mut self) -> Result<Expr, SelectorError> {
        let entered = self.depth;
        let mut left = self.parse_and()?;
        while self.eat(&Token::Or) {
            self.descend()?;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        self.depth = entered;
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, SelectorError> {
        let entered = self.depth;
        let mut left = self.parse_unary()?;
        while self.eat(&Token::And) {
            self.descend()?;
            let right = self.parse_unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        self.depth = entered;
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, SelectorError> {
        if self.eat(&Token::Not) {
            self.descend()?;
            let inner = self.parse_unary()?;
            self.depth -= 1;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, SelectorError> {
        let left = self.parse_primary()?;
        if let Some(Token::Cmp(op)) = self.peek() {
            let op = *op;
            self.pos += 1;
            let right = self.parse_primary()?;
            return Ok(Expr::Compare(op, Box::new(left), Box::new(right)));
        }
        Ok(left)
    }

    fn parse_primary(&mut self) -> Result<Expr, SelectorError> {
        match self.next() {
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Int(i)) => Ok(Expr::Literal(Value::Int(i))),
            Some(Token::LParen) => {
                self.descend()?;
                let inner = self.parse_or()?;
                self.depth -= 1;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Ident(ident)) => match ident.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "device" => self.parse_device_path(),
                "has" | "quantity" | "semver" => self.parse_call(&ident),
                other => Err(SelectorError::Compile(format!(
                    "undeclared reference to '{}'",
                    other
                ))),
            },
            Some(token) => Err(SelectorError::Compile(format!("unexpected {}", token))),
            None => Err(SelectorError::Compile(
                "unexpected end of expression".to_string(),
            )),
        }
    }

    fn parse_device_path(&mut self) -> Result<Expr, SelectorError> {
        self.expect(Token::Dot)?;
        let field = match self.next() {
            Some(Token::Ident(field)) => field,
            _ => {
                return Err(SelectorError::Compile(
                    "expected a field name after 'device.'".to_string(),
                ))
            }
        };
        match field.as_str() {
            "driver" => Ok(Expr::Driver),
            "attributes" | "capacity" => {
                self.expect(Token::LBracket)?;
                let key = match self.next() {
                    Some(Token::Str(key)) => key,
                    _ => {
                        return Err(SelectorError::Compile(format!(
                            "device.{} must be indexed with a string",
                            field
                        )))
                    }
                };
                self.expect(Token::RBracket)?;
                Ok(if field == "attributes" {
                    Expr::Attribute(key)
                } else {
                    Expr::Capacity(key)
                })
            }
            other => Err(SelectorError::Compile(format!(
                "device has no field '{}'",
                other
            ))),
        }
    }

    fn parse_call(&mut self, function: &str) -> Result<Expr, SelectorError> {
        self.expect(Token::LParen)?;
        let expr = match function {
            "has" => {
                let arg = self.parse_primary()?;
                if !matches!(arg, Expr::Attribute(_) | Expr::Capacity(_)) {
                    return Err(SelectorError::Compile(
                        "has() expects device.attributes[...] or device.capacity[...]"
                            .to_string(),
                    ));
                }
                Expr::Has(Box::new(arg))
            }
            _ => {
                let text = match self.next() {
                    Some(Token::Str(text)) => text,
                    _ => {
                        return Err(SelectorError::Compile(format!(
                            "{}() expects a string literal",
                            function
                        )))
                    }
                };
                if function == "quantity" {
                    let q = Quantity::parse(&text)
                        .map_err(|e| SelectorError::Compile(e.to_string()))?;
                    Expr::Literal(Value::Quantity(q))
                } else {
                    Version::parse(&text).ok_or_else(|| {
                        SelectorError::Compile(format!("invalid semantic version {:?}", text))
                    })?;
                    Expr::Literal(Value::Version(text))
                }
            }
        };
        self.expect(Token::RParen)?;
        Ok(expr)
    }
}

// ============================================================================
// Evaluation
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Bool(bool),
    Int(i64),
    String(String),
    Version(String),
    Quantity(Quantity),
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::String(_) => "string",
            Value::Version(_) => "semver",
            Value::Quantity(_) => "quantity",
        }
    }
}

impl From<&DeviceAttribute> for Value {
    fn from(attribute: &DeviceAttribute) -> Self {
        match attribute {
            DeviceAttribute::String(s) => Value::String(s.clone()),
            DeviceAttribute::Int(i) => Value::Int(*i),
            DeviceAttribute::Bool(b) => Value::Bool(*b),
            DeviceAttribute::Version(v) => Value::Version(v.clone()),
        }
    }
}

/// Semantic version, compared by precedence (build metadata ignored)
#[derive(Debug, PartialEq, Eq)]
struct Version<'a> {
    core: [u64; 3],
    pre: Option<&'a str>,
}

impl<'a> Version<'a> {
    fn parse(text: &'a str) -> Option<Self> {
        let text = text.split_once('+').map_or(text, |(v, _)| v);
        let (core, pre) = match text.split_once('-') {
            Some((core, pre)) if !pre.is_empty() => (core, Some(pre)),
            Some(_) => return None,
            None => (text, None),
        };
        let mut parts = core.split('.');
        let mut numbers = [0u64; 3];
        for slot in numbers.iter_mut() {
            let part = parts.next()?;
            if part.is_empty() || (part.len() > 1 && part.starts_with('0')) {
                return None;
            }
            *slot = part.parse().ok()?;
        }
        if parts.next().is_some() {
            return None;
        }
        Some(Self { core: numbers, pre })
    }
}

impl Ord for Version<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.core.cmp(&other.core).then_with(|| match (self.pre, other.pre) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(a), Some(b)) => compare_prerelease(a, b),
        })
    }
}

impl PartialOrd for Version<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

fn compare_prerelease(a: &str, b: &str) -> Ordering {
    let mut left = a.split('.');
    let mut right = b.split('.');
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => {
                let ord = match (x.parse::<u64>(), y.parse::<u64>()) {
                    (Ok(x), Ok(y)) => x.cmp(&y),
                    (Ok(_), Err(_)) => Ordering::Less,
                    (Err(_), Ok(_)) => Ordering::Greater,
                    (Err(_), Err(_)) => x.cmp(y),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

struct Program {
    expr: Expr,
}

impl DeviceMatcher for Program {
    fn matches(&self, device: &DeviceView<'_>) -> Result<Evaluation, SelectorError> {
        let mut cost = 0;
        match eval(&self.expr, device, &mut cost)? {
            Value::Bool(matches) => Ok(Evaluation { matches, cost }),
            other => Err(SelectorError::Runtime(format!(
                "expression evaluated to {}, expected bool",
                other.type_name()
            ))),
        }
    }
}

fn eval(expr: &Expr, device: &DeviceView<'_>, cost: &mut u64) -> Result<Value, SelectorError> {
    *cost += 1;
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Driver => Ok(Value::String(device.driver.to_string())),
        Expr::Attribute(name) => device
            .device
            .lookup_attribute(device.driver, name)
            .map(Value::from)
            .ok_or_else(|| no_such_key("attributes", name)),
        Expr::Capacity(name) => device
            .device
            .lookup_capacity(device.driver, name)
            .map(|q| Value::Quantity(q.clone()))
            .ok_or_else(|| no_such_key("capacity", name)),
        Expr::Has(inner) => Ok(Value::Bool(match inner.as_ref() {
            Expr::Attribute(name) => device.device.lookup_attribute(device.driver, name).is_some(),
            Expr::Capacity(name) => device.device.lookup_capacity(device.driver, name).is_some(),
            _ => false,
        })),
        Expr::Not(inner) => Ok(Value::Bool(!expect_bool(eval(inner, device, cost)?, "!")?)),
        Expr::And(left, right) => {
            if !expect_bool(eval(left, device, cost)?, "&&")? {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(expect_bool(eval(right, device, cost)?, "&&")?))
        }
        Expr::Or(left, right) => {
            if expect_bool(eval(left, device, cost)?, "||")? {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(expect_bool(eval(right, device, cost)?, "||")?))
        }
        Expr::Compare(op, left, right) => {
            let left = eval(left, device, cost)?;
            let right = eval(right, device, cost)?;
            compare(*op, &left, &right).map(Value::Bool)
        }
    }
}

fn no_such_key(map: &str, key: &str) -> SelectorError {
    SelectorError::Runtime(format!("no such key: device.{}[{:?}]", map, key))
}

fn expect_bool(value: Value, op: &str) -> Result<bool, SelectorError> {
    match value {
        Value::Bool(b) => Ok(b),
        other => Err(SelectorError::Runtime(format!(
            "no matching overload for '{}' applied to {}",
            op,
            other.type_name()
        ))),
    }
}

fn compare(op: CmpOp, left: &Value, right: &Value) -> Result<bool, SelectorError> {
    let mismatch = || {
        SelectorError::Runtime(format!(
            "no matching overload for '{}' applied to ({}, {})",
            op,
            left.type_name(),
            right.type_name()
        ))
    };

    let ordering = match (left, right) {
        (Value::Int(a), Value::Int(b)) => a.cmp(b),
        (Value::String(a), Value::String(b)) => a.cmp(b),
        (Value::Quantity(a), Value::Quantity(b)) => a.cmp(b),
        (Value::Bool(a), Value::Bool(b)) => {
            return match op {
                CmpOp::Eq => Ok(a == b),
                CmpOp::Ne => Ok(a != b),
                _ => Err(mismatch()),
            };
        }
        (Value::Version(a), Value::Version(b)) => {
            let invalid = |v: &str| SelectorError::Runtime(format!("invalid semantic version {:?}", v));
            let a = Version::parse(a).ok_or_else(|| invalid(a))?;
            let b = Version::parse(b).ok_or_else(|| invalid(b))?;
            a.cmp(&b)
        }
        _ => return Err(mismatch()),
    };

    Ok(match op {
        CmpOp::Eq => ordering == Ordering::Equal,
        CmpOp::Ne => ordering != Ordering::Equal,
        CmpOp::Lt => ordering == Ordering::Less,
        CmpOp::Le => ordering != Ordering::Greater,
        CmpOp::Gt => ordering == Ordering::Greater,
        CmpOp::Ge => ordering != Ordering::Less,
    })
}
