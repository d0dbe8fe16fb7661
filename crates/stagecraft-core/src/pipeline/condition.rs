//! Stage condition expressions
//!
//! ```text
//! expr       := or
//! or         := and ( "||" and )*
//! and        := unary ( "&&" unary )*
//! unary      := "!" unary | comparison
//! comparison := primary ( ("==" | "!=" | "<" | "<=" | ">" | ">=") primary
//!                       | "=~" string )?
//! primary    := string | number | true | false | null | identifier | "(" expr ")"
//! ```
//!
//! Identifiers are dotted references (`plan.risk`, `input.mode`) or bare
//! names of the stage's resolved inputs. Truthiness follows JavaScript:
//! `null`, `false`, `0`, `NaN` and `""` are false.

use regex::Regex;
use serde_json::Value;
use std::cmp::Ordering;

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone)]
pub enum Expr {
    Literal(Value),
    Identifier(String),
    Not(Box<Expr>),
    Compare(CompareOp, Box<Expr>, Box<Expr>),
    Matches(Box<Expr>, Regex),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Str(String),
    Num(f64),
    Ident(String),
    Op(&'static str),
    LParen,
    RParen,
}

/// A parsed condition expression
#[derive(Debug, Clone)]
pub struct Condition {
    source: String,
    expr: Expr,
}

impl Condition {
    pub fn parse(source: &str) -> Result<Self> {
        let tokens = tokenize(source)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            source,
        };
        let expr = parser.parse_or()?;
        if parser.pos != parser.tokens.len() {
            return Err(parser.error("unexpected trailing input"));
        }
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Every identifier used by the expression
    pub fn identifiers(&self) -> Vec<&str> {
        let mut out = Vec::new();
        collect_identifiers(&self.expr, &mut out);
        out
    }

    /// Evaluate with `lookup` resolving identifiers to values
    pub fn evaluate(&self, lookup: impl Fn(&str) -> Value) -> bool {
        truthy(&eval(&self.expr, &lookup))
    }
}

fn collect_identifiers<'a>(expr: &'a Expr, out: &mut Vec<&'a str>) {
    match expr {
        Expr::Literal(_) => {}
        Expr::Identifier(name) => out.push(name),
        Expr::Not(inner) | Expr::Matches(inner, _) => collect_identifiers(inner, out),
        Expr::Compare(_, l, r) | Expr::And(l, r) | Expr::Or(l, r) => {
            collect_identifiers(l, out);
            collect_identifiers(r, out);
        }
    }
}

fn eval(expr: &Expr, lookup: &dyn Fn(&str) -> Value) -> Value {
    match expr {
        Expr::Literal(v) => v.clone(),
        Expr::Identifier(name) => lookup(name),
        Expr::Not(inner) => Value::Bool(!truthy(&eval(inner, lookup))),
        Expr::And(l, r) => {
            let left = eval(l, lookup);
            if truthy(&left) { eval(r, lookup) } else { left }
        }
        Expr::Or(l, r) => {
            let left = eval(l, lookup);
            if truthy(&left) { left } else { eval(r, lookup) }
        }
        Expr::Compare(op, l, r) => Value::Bool(compare(*op, &eval(l, lookup), &eval(r, lookup))),
        Expr::Matches(inner, regex) => {
            let value = eval(inner, lookup);
            let text = match &value {
                Value::String(s) => s.clone(),
                Value::Null => return Value::Bool(false),
                other => other.to_string(),
            };
            Value::Bool(regex.is_match(&text))
        }
    }
}

/// JavaScript-like truthiness
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn compare(op: CompareOp, left: &Value, right: &Value) -> bool {
    let ordering = match (left, right) {
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => a.partial_cmp(&b),
            _ => None,
        },
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    };

    match op {
        CompareOp::Eq => ordering == Some(Ordering::Equal) || (ordering.is_none() && left == right),
        CompareOp::Ne => !(ordering == Some(Ordering::Equal) || (ordering.is_none() && left == right)),
        CompareOp::Lt => ordering == Some(Ordering::Less) && is_ordered(left),
        CompareOp::Le => matches!(ordering, Some(Ordering::Less | Ordering::Equal)) && is_ordered(left),
        CompareOp::Gt => ordering == Some(Ordering::Greater) && is_ordered(left),
        CompareOp::Ge => matches!(ordering, Some(Ordering::Greater | Ordering::Equal)) && is_ordered(left),
    }
}

/// Only numbers and strings have a meaningful order
fn is_ordered(value: &Value) -> bool {
    matches!(value, Value::Number(_) | Value::String(_))
}

fn tokenize(source: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    let err = |msg: String| Error::config(format!("Invalid condition '{}': {}", source, msg));

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '"' | '\'' => {
                let quote = c;
                let mut text = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(err("unterminated string".to_string())),
                        Some('\\') => {
                            let escaped = chars
                                .get(i + 1)
                                .ok_or_else(|| err("unterminated escape".to_string()))?;
                            text.push(match escaped {
                                'n' => '\n',
                                't' => '\t',
                                other => *other,
                            });
                            i += 2;
                        }
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            text.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(text));
            }
            c if c.is_ascii_digit()
                || (c == '-' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())) =>
            {
                let start = i;
                i += 1;
                while chars.get(i).is_some_and(|n| n.is_ascii_digit() || *n == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let number = text
                    .parse::<f64>()
                    .map_err(|_| err(format!("invalid number '{}'", text)))?;
                tokens.push(Token::Num(number));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while chars
                    .get(i)
                    .is_some_and(|n| n.is_alphanumeric() || matches!(n, '_' | '-' | '.'))
                {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            _ => {
                let two: String = chars[i..(i + 2).min(chars.len())].iter().collect();
                let op = match two.as_str() {
                    "==" => Some("=="),
                    "!=" => Some("!="),
                    "<=" => Some("<="),
                    ">=" => Some(">="),
                    "=~" => Some("=~"),
                    "&&" => Some("&&"),
                    "||" => Some("||"),
                    _ => None,
                };
                if let Some(op) = op {
                    tokens.push(Token::Op(op));
                    i += 2;
                    continue;
                }
                let op = match c {
                    '<' => "<",
                    '>' => ">",
                    '!' => "!",
                    _ => return Err(err(format!("unexpected character '{}'", c))),
                };
                tokens.push(Token::Op(op));
                i += 1;
            }
        }
    }

    Ok(tokens)
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    source: &'a str,
}

impl Parser<'_> {
    fn error(&self, msg: &str) -> Error {
        Error::config(format!("Invalid condition '{}': {}", self.source, msg))
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if matches!(self.peek(), Some(Token::Op(o)) if *o == op) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut left = self.parse_and()?;
        while self.eat_op("||") {
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut left = self.parse_unary()?;
        while self.eat_op("&&") {
            let right = self.parse_unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        if self.eat_op("!") {
            return Ok(Expr::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr> {
        let left = self.parse_primary()?;

        if self.eat_op("=~") {
            let pattern = match self.tokens.get(self.pos) {
                Some(Token::Str(p)) => p.clone(),
                _ => return Err(self.error("'=~' expects a string pattern")),
            };
            self.pos += 1;
            let regex = Regex::new(&pattern)
                .map_err(|e| self.error(&format!("invalid pattern: {}", e)))?;
            return Ok(Expr::Matches(Box::new(left), regex));
        }

        let op = match self.peek() {
            Some(Token::Op("==")) => CompareOp::Eq,
            Some(Token::Op("!=")) => CompareOp::Ne,
            Some(Token::Op("<")) => CompareOp::Lt,
            Some(Token::Op("<=")) => CompareOp::Le,
            Some(Token::Op(">")) => CompareOp::Gt,
            Some(Token::Op(">=")) => CompareOp::Ge,
            _ => return Ok(left),
        };
        self.pos += 1;
        let right = self.parse_primary()?;
        Ok(Expr::Compare(op, Box::new(left), Box::new(right)))
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| self.error("unexpected end of expression"))?;
        self.pos += 1;

        match token {
            Token::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Token::Num(n) => Ok(Expr::Literal(
                serde_json::Number::from_f64(n)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
            )),
            Token::Ident(name) => Ok(match name.as_str() {
                "true" => Expr::Literal(Value::Bool(true)),
                "false" => Expr::Literal(Value::Bool(false)),
                "null" => Expr::Literal(Value::Null),
                _ => Expr::Identifier(name),
            }),
            Token::LParen => {
                let inner = self.parse_or()?;
                if self.tokens.get(self.pos) != Some(&Token::RParen) {
                    return Err(self.error("missing ')'"));
                }
                self.pos += 1;
                Ok(inner)
            }
            Token::RParen => Err(self.error("unexpected ')'")),
            Token::Op(op) => Err(self.error(&format!("unexpected operator '{}'", op))),
        }
    }
}
