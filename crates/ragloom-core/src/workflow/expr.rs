//! Typed expression layer for workflow conditions, loops, and templates.
//!
//! A deliberately small grammar -- no general-purpose evaluation:
//! - path lookups: dotted segments with an optional `[index]` per segment
//!   (`find.output.hits[0].score`)
//! - comparisons: `== != > >= < <=`
//! - boolean connectives: `&& || !` and parentheses
//! - literals: single/double-quoted strings, numbers, `true`, `false`, `null`
//!
//! Every expression is a side-effect-free lookup against a [`Scope`]; nothing
//! here executes code. Parsing is exact, so implicit-dependency scanning works
//! on path roots instead of substrings.

use std::collections::BTreeSet;
use std::fmt;

use serde_json::Value;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur while parsing an expression.
#[derive(Debug, thiserror::Error)]
pub enum ExprError {
    #[error("unexpected character '{ch}' at byte {pos}")]
    UnexpectedChar { ch: char, pos: usize },

    #[error("unexpected end of expression")]
    UnexpectedEnd,

    #[error("expected {expected}, found {found}")]
    UnexpectedToken { expected: &'static str, found: String },

    #[error("invalid number literal '{0}'")]
    InvalidNumber(String),

    #[error("unterminated string literal")]
    UnterminatedString,

    #[error("trailing input after expression: '{0}'")]
    TrailingInput(String),

    #[error("empty expression")]
    Empty,
}

// ---------------------------------------------------------------------------
// Scope
// ---------------------------------------------------------------------------

/// Name resolution for the first segment of a path expression.
///
/// Implemented by the execution context (workflow inputs and step outputs)
/// and by loop-local scopes layered on top of it. `Sync` so evaluation can
/// happen inside `Send` futures.
pub trait Scope: Sync {
    /// Resolve a root name (`inputs`, a step ID, or a loop binding).
    fn root(&self, name: &str) -> Option<&Value>;
}

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

/// One segment of a path: a key plus an optional array index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathSegment {
    pub key: String,
    pub index: Option<usize>,
}

/// A parsed dotted-path expression (`find.output.hits[0]`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathExpr {
    pub segments: Vec<PathSegment>,
}

impl PathExpr {
    /// The root name (first segment key) of this path.
    pub fn root(&self) -> &str {
        &self.segments[0].key
    }

    /// Resolve this path against a scope. Missing keys or out-of-range
    /// indices yield `None`, never an error.
    pub fn resolve(&self, scope: &dyn Scope) -> Option<Value> {
        let first = &self.segments[0];
        let mut current = scope.root(&first.key)?;
        if let Some(i) = first.index {
            current = current.get(i)?;
        }
        for seg in &self.segments[1..] {
            current = current.get(seg.key.as_str())?;
            if let Some(i) = seg.index {
                current = current.get(i)?;
            }
        }
        Some(current.clone())
    }
}

impl fmt::Display for PathExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, seg) in self.segments.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            f.write_str(&seg.key)?;
            if let Some(idx) = seg.index {
                write!(f, "[{idx}]")?;
            }
        }
        Ok(())
    }
}

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

/// A parsed expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Path(PathExpr),
    Compare {
        op: CmpOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
}

impl Expr {
    /// Evaluate against a scope. Missing paths yield `Value::Null`;
    /// comparisons and connectives yield `Value::Bool`.
    pub fn eval(&self, scope: &dyn Scope) -> Value {
        match self {
            Expr::Literal(v) => v.clone(),
            Expr::Path(path) => path.resolve(scope).unwrap_or(Value::Null),
            Expr::Compare { op, lhs, rhs } => {
                Value::Bool(compare(*op, &lhs.eval(scope), &rhs.eval(scope)))
            }
            Expr::And(lhs, rhs) => {
                if truthy(&lhs.eval(scope)) {
                    Value::Bool(truthy(&rhs.eval(scope)))
                } else {
                    Value::Bool(false)
                }
            }
            Expr::Or(lhs, rhs) => {
                if truthy(&lhs.eval(scope)) {
                    Value::Bool(true)
                } else {
                    Value::Bool(truthy(&rhs.eval(scope)))
                }
            }
            Expr::Not(inner) => Value::Bool(!truthy(&inner.eval(scope))),
        }
    }

    /// Evaluate to a boolean using JS-like truthiness.
    pub fn eval_bool(&self, scope: &dyn Scope) -> bool {
        truthy(&self.eval(scope))
    }

    /// Collect every path root referenced by this expression.
    pub fn roots(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_roots(&mut out);
        out
    }

    fn collect_roots(&self, out: &mut BTreeSet<String>) {
        match self {
            Expr::Literal(_) => {}
            Expr::Path(path) => {
                out.insert(path.root().to_string());
            }
            Expr::Compare { lhs, rhs, .. } => {
                lhs.collect_roots(out);
                rhs.collect_roots(out);
            }
            Expr::And(lhs, rhs) | Expr::Or(lhs, rhs) => {
                lhs.collect_roots(out);
                rhs.collect_roots(out);
            }
            Expr::Not(inner) => inner.collect_roots(out),
        }
    }
}

/// JS-like truthiness: null and false are falsy, zero and the empty string
/// are falsy, arrays and objects are always truthy.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Keep whole-number literals as JSON integers so they round-trip cleanly.
fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() <= i64::MAX as f64 {
        Value::Number((n as i64).into())
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

fn compare(op: CmpOp, lhs: &Value, rhs: &Value) -> bool {
    use std::cmp::Ordering;

    // Numbers compare numerically regardless of integer/float representation.
    let ordering = match (lhs, rhs) {
        (Value::Number(a), Value::Number(b)) => a
            .as_f64()
            .zip(b.as_f64())
            .and_then(|(a, b)| a.partial_cmp(&b)),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    };

    match op {
        CmpOp::Eq => match ordering {
            Some(ord) => ord == Ordering::Equal,
            None => lhs == rhs,
        },
        CmpOp::Ne => match ordering {
            Some(ord) => ord != Ordering::Equal,
            None => lhs != rhs,
        },
        CmpOp::Gt => ordering == Some(Ordering::Greater),
        CmpOp::Ge => matches!(ordering, Some(Ordering::Greater | Ordering::Equal)),
        CmpOp::Lt => ordering == Some(Ordering::Less),
        CmpOp::Le => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
    }
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    True,
    False,
    Null,
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    AndAnd,
    OrOr,
    Bang,
    LParen,
    RParen,
    Dot,
    LBracket,
    RBracket,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Ident(s) => format!("identifier '{s}'"),
            Token::Number(n) => format!("number {n}"),
            Token::Str(s) => format!("string '{s}'"),
            other => format!("{other:?}"),
        }
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    // Step IDs commonly contain hyphens ("rerank-hits"); there is no
    // arithmetic in this grammar, so '-' inside an identifier is unambiguous.
    c.is_alphanumeric() || c == '_' || c == '-'
}

fn tokenize(input: &str) -> Result<Vec<Token>, ExprError> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some(&(pos, c)) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '[' => {
                chars.next();
                tokens.push(Token::LBracket);
            }
            ']' => {
                chars.next();
                tokens.push(Token::RBracket);
            }
            '.' => {
                chars.next();
                tokens.push(Token::Dot);
            }
            '!' => {
                chars.next();
                if chars.peek().is_some_and(|&(_, c)| c == '=') {
                    chars.next();
                    tokens.push(Token::Ne);
                } else {
                    tokens.push(Token::Bang);
                }
            }
            '=' => {
                chars.next();
                match chars.peek() {
                    Some(&(_, '=')) => {
                        chars.next();
                        tokens.push(Token::Eq);
                    }
                    _ => return Err(ExprError::UnexpectedChar { ch: '=', pos }),
                }
            }
            '>' => {
                chars.next();
                if chars.peek().is_some_and(|&(_, c)| c == '=') {
                    chars.next();
                    tokens.push(Token::Ge);
                } else {
                    tokens.push(Token::Gt);
                }
            }
            '<' => {
                chars.next();
                if chars.peek().is_some_and(|&(_, c)| c == '=') {
                    chars.next();
                    tokens.push(Token::Le);
                } else {
                    tokens.push(Token::Lt);
                }
            }
            '&' => {
                chars.next();
                match chars.peek() {
                    Some(&(_, '&')) => {
                        chars.next();
                        tokens.push(Token::AndAnd);
                    }
                    _ => return Err(ExprError::UnexpectedChar { ch: '&', pos }),
                }
            }
            '|' => {
                chars.next();
                match chars.peek() {
                    Some(&(_, '|')) => {
                        chars.next();
                        tokens.push(Token::OrOr);
                    }
                    _ => return Err(ExprError::UnexpectedChar { ch: '|', pos }),
                }
            }
            '\'' | '"' => {
                let quote = c;
                chars.next();
                let mut s = String::new();
                let mut closed = false;
                for (_, c) in chars.by_ref() {
                    if c == quote {
                        closed = true;
                        break;
                    }
                    s.push(c);
                }
                if !closed {
                    return Err(ExprError::UnterminatedString);
                }
                tokens.push(Token::Str(s));
            }
            '-' | '0'..='9' => {
                let mut s = String::new();
                if c == '-' {
                    s.push(c);
                    chars.next();
                }
                while let Some(&(_, c)) = chars.peek() {
                    if c.is_ascii_digit() || c == '.' {
                        s.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let n: f64 = s.parse().map_err(|_| ExprError::InvalidNumber(s))?;
                tokens.push(Token::Number(n));
            }
            c if is_ident_start(c) => {
                let mut s = String::new();
                while let Some(&(_, c)) = chars.peek() {
                    if is_ident_char(c) {
                        s.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(match s.as_str() {
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    _ => Token::Ident(s),
                });
            }
            other => return Err(ExprError::UnexpectedChar { ch: other, pos }),
        }
    }

    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

/// Parse an expression.
///
/// A single wrapping `{{ ... }}` marker is tolerated and stripped, since
/// authors write conditions both bare (`item.score > 0.7`) and wrapped.
pub fn parse_expression(input: &str) -> Result<Expr, ExprError> {
    let mut parser = Parser::new(unwrap_marker(input))?;
    let expr = parser.parse_or()?;
    parser.expect_end()?;
    Ok(expr)
}

/// Parse a strict path expression (the only form allowed inside template
/// markers): dotted segments with optional indices, nothing else.
pub fn parse_path(input: &str) -> Result<PathExpr, ExprError> {
    let mut parser = Parser::new(input)?;
    let path = parser.parse_path()?;
    parser.expect_end()?;
    Ok(path)
}

/// Strip a single wrapping `{{ ... }}` marker, if the whole trimmed input is
/// one marker. Inputs with interior markers are returned unchanged.
fn unwrap_marker(input: &str) -> &str {
    let trimmed = input.trim();
    if let Some(body) = trimmed
        .strip_prefix("{{")
        .and_then(|rest| rest.strip_suffix("}}"))
    {
        if !body.contains("{{") && !body.contains("}}") {
            return body.trim();
        }
    }
    trimmed
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(input: &str) -> Result<Self, ExprError> {
        let tokens = tokenize(input)?;
        if tokens.is_empty() {
            return Err(ExprError::Empty);
        }
        Ok(Self { tokens, pos: 0 })
    }

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

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_end(&self) -> Result<(), ExprError> {
        match self.peek() {
            None => Ok(()),
            Some(t) => Err(ExprError::TrailingInput(t.describe())),
        }
    }

    fn parse_or(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.parse_and()?;
        while self.eat(&Token::OrOr) {
            let rhs = self.parse_and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.parse_unary()?;
        while self.eat(&Token::AndAnd) {
            let rhs = self.parse_unary()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, ExprError> {
        if self.eat(&Token::Bang) {
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, ExprError> {
        let lhs = self.parse_term()?;
        let op = match self.peek() {
            Some(Token::Eq) => CmpOp::Eq,
            Some(Token::Ne) => CmpOp::Ne,
            Some(Token::Gt) => CmpOp::Gt,
            Some(Token::Ge) => CmpOp::Ge,
            Some(Token::Lt) => CmpOp::Lt,
            Some(Token::Le) => CmpOp::Le,
            _ => return Ok(lhs),
        };
        self.pos += 1;
        let rhs = self.parse_term()?;
        Ok(Expr::Compare {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        })
    }

    fn parse_term(&mut self) -> Result<Expr, ExprError> {
        match self.next() {
            Some(Token::Number(n)) => Ok(Expr::Literal(number_value(n))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::True) => Ok(Expr::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(Expr::Literal(Value::Bool(false))),
            Some(Token::Null) => Ok(Expr::Literal(Value::Null)),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                if !self.eat(&Token::RParen) {
                    return Err(ExprError::UnexpectedToken {
                        expected: "')'",
                        found: self
                            .peek()
                            .map(Token::describe)
                            .unwrap_or_else(|| "end of input".to_string()),
                    });
                }
                Ok(inner)
            }
            Some(Token::Ident(_)) => {
                self.pos -= 1;
                Ok(Expr::Path(self.parse_path()?))
            }
            Some(other) => Err(ExprError::UnexpectedToken {
                expected: "a value or path",
                found: other.describe(),
            }),
            None => Err(ExprError::UnexpectedEnd),
        }
    }

    fn parse_path(&mut self) -> Result<PathExpr, ExprError> {
        let mut segments = Vec::new();
        loop {
            let key = match self.next() {
                Some(Token::Ident(key)) => key,
                Some(other) => {
                    return Err(ExprError::UnexpectedToken {
                        expected: "a path segment",
                        found: other.describe(),
                    });
                }
                None => return Err(ExprError::UnexpectedEnd),
            };
            let index = if self.eat(&Token::LBracket) {
                let n = match self.next() {
                    Some(Token::Number(n)) if n >= 0.0 && n.fract() == 0.0 => n as usize,
                    Some(other) => {
                        return Err(ExprError::UnexpectedToken {
                            expected: "an array index",
                            found: other.describe(),
                        });
                    }
                    None => return Err(ExprError::UnexpectedEnd),
                };
                if !self.eat(&Token::RBracket) {
                    return Err(ExprError::UnexpectedToken {
                        expected: "']'",
                        found: self
                            .peek()
                            .map(Token::describe)
                            .unwrap_or_else(|| "end of input".to_string()),
                    });
                }
                Some(n)
            } else {
                None
            };
            segments.push(PathSegment { key, index });
            if !self.eat(&Token::Dot) {
                break;
            }
        }
        Ok(PathExpr { segments })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
