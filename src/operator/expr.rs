//! Tiny expression sub-language (spec §4.4, §1 Non-goals: "queries are given
//! as already-parsed operator trees plus a simple expression sub-language").
//!
//! An [`Expr`] is a small AST of field references, literals, arithmetic,
//! comparison and logical operators; [`Expr::compile`] resolves every field
//! reference against a concrete [`ExtentType`] once, and the resulting
//! [`CompiledExpr`] evaluates per row with no further name lookups — the
//! same "resolve once, evaluate many" shape as
//! [`crate::extent::value::GeneralField`]. [`select::SelectOperator`] uses
//! this for its `where` clause.
//!
//! A caller building a query programmatically constructs an [`Expr`]
//! directly; [`parse`] additionally offers a minimal textual grammar for
//! tools (such as [`crate::server`]'s `getTableData`) that only have a
//! string to work with. This is not a SQL parser — no sub-selects, no joins,
//! just a single boolean expression over one row's fields.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::extent::value::{GeneralField, GeneralValue};
use crate::extent::Extent;
use crate::types::ExtentType;

/// An uncompiled expression AST node.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Field(String),
    LitInt(i64),
    LitBool(bool),
    LitBytes(Vec<u8>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Eq(Box<Expr>, Box<Expr>),
    Ne(Box<Expr>, Box<Expr>),
    Lt(Box<Expr>, Box<Expr>),
    Le(Box<Expr>, Box<Expr>),
    Gt(Box<Expr>, Box<Expr>),
    Ge(Box<Expr>, Box<Expr>),
    Add(Box<Expr>, Box<Expr>),
    Sub(Box<Expr>, Box<Expr>),
    Mul(Box<Expr>, Box<Expr>),
    Div(Box<Expr>, Box<Expr>),
}

impl Expr {
    /// Resolve every [`Expr::Field`] leaf against `ty`, failing with
    /// [`Error::FieldNotFound`] up front — schema errors are "detected at
    /// operator setup; fail the query before any extent is produced" (spec
    /// §7).
    pub fn compile(&self, ty: &ExtentType) -> Result<CompiledExpr> {
        Ok(match self {
            Expr::Field(name) => CompiledExpr::Field(GeneralField::new(ty, name)?),
            Expr::LitInt(v) => CompiledExpr::Lit(GeneralValue::Int64(*v)),
            Expr::LitBool(v) => CompiledExpr::Lit(GeneralValue::Bool(*v)),
            Expr::LitBytes(v) => CompiledExpr::Lit(GeneralValue::Variable32(v.clone())),
            Expr::Not(e) => CompiledExpr::Not(Box::new(e.compile(ty)?)),
            Expr::And(a, b) => CompiledExpr::And(Box::new(a.compile(ty)?), Box::new(b.compile(ty)?)),
            Expr::Or(a, b) => CompiledExpr::Or(Box::new(a.compile(ty)?), Box::new(b.compile(ty)?)),
            Expr::Eq(a, b) => CompiledExpr::Cmp(Box::new(a.compile(ty)?), Box::new(b.compile(ty)?), Cmp::Eq),
            Expr::Ne(a, b) => CompiledExpr::Cmp(Box::new(a.compile(ty)?), Box::new(b.compile(ty)?), Cmp::Ne),
            Expr::Lt(a, b) => CompiledExpr::Cmp(Box::new(a.compile(ty)?), Box::new(b.compile(ty)?), Cmp::Lt),
            Expr::Le(a, b) => CompiledExpr::Cmp(Box::new(a.compile(ty)?), Box::new(b.compile(ty)?), Cmp::Le),
            Expr::Gt(a, b) => CompiledExpr::Cmp(Box::new(a.compile(ty)?), Box::new(b.compile(ty)?), Cmp::Gt),
            Expr::Ge(a, b) => CompiledExpr::Cmp(Box::new(a.compile(ty)?), Box::new(b.compile(ty)?), Cmp::Ge),
            Expr::Add(a, b) => CompiledExpr::Arith(Box::new(a.compile(ty)?), Box::new(b.compile(ty)?), Arith::Add),
            Expr::Sub(a, b) => CompiledExpr::Arith(Box::new(a.compile(ty)?), Box::new(b.compile(ty)?), Arith::Sub),
            Expr::Mul(a, b) => CompiledExpr::Arith(Box::new(a.compile(ty)?), Box::new(b.compile(ty)?), Arith::Mul),
            Expr::Div(a, b) => CompiledExpr::Arith(Box::new(a.compile(ty)?), Box::new(b.compile(ty)?), Arith::Div),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cmp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Arith {
    Add,
    Sub,
    Mul,
    Div,
}

/// A compiled [`Expr`], with every field reference already resolved. Cheap
/// to evaluate per row; owns no per-call allocation beyond the
/// [`GeneralValue`]s produced along the way.
#[derive(Debug, Clone)]
pub enum CompiledExpr {
    Field(GeneralField),
    Lit(GeneralValue),
    Not(Box<CompiledExpr>),
    And(Box<CompiledExpr>, Box<CompiledExpr>),
    Or(Box<CompiledExpr>, Box<CompiledExpr>),
    Cmp(Box<CompiledExpr>, Box<CompiledExpr>, Cmp),
    Arith(Box<CompiledExpr>, Box<CompiledExpr>, Arith),
}

impl CompiledExpr {
    /// Evaluate against `(extent, record)`, producing a [`GeneralValue`].
    pub fn eval(&self, extent: &Extent, record: usize) -> Result<GeneralValue> {
        Ok(match self {
            CompiledExpr::Field(f) => f.get(extent, record)?,
            CompiledExpr::Lit(v) => v.clone(),
            CompiledExpr::Not(e) => GeneralValue::Bool(!as_bool(&e.eval(extent, record)?)),
            CompiledExpr::And(a, b) => GeneralValue::Bool(
                as_bool(&a.eval(extent, record)?) && as_bool(&b.eval(extent, record)?),
            ),
            CompiledExpr::Or(a, b) => GeneralValue::Bool(
                as_bool(&a.eval(extent, record)?) || as_bool(&b.eval(extent, record)?),
            ),
            CompiledExpr::Cmp(a, b, op) => {
                let (av, bv) = (a.eval(extent, record)?, b.eval(extent, record)?);
                GeneralValue::Bool(apply_cmp(*op, &av, &bv))
            }
            CompiledExpr::Arith(a, b, op) => {
                let av = as_int(&a.eval(extent, record)?);
                let bv = as_int(&b.eval(extent, record)?);
                GeneralValue::Int64(match op {
                    Arith::Add => av.wrapping_add(bv),
                    Arith::Sub => av.wrapping_sub(bv),
                    Arith::Mul => av.wrapping_mul(bv),
                    Arith::Div => if bv == 0 { 0 } else { av / bv },
                })
            }
        })
    }

    /// Convenience for `where`-style boolean evaluation.
    pub fn eval_bool(&self, extent: &Extent, record: usize) -> Result<bool> {
        Ok(as_bool(&self.eval(extent, record)?))
    }
}

fn as_bool(v: &GeneralValue) -> bool {
    match v {
        GeneralValue::Bool(b) => *b,
        GeneralValue::Null => false,
        other => as_int(other) != 0,
    }
}

fn as_int(v: &GeneralValue) -> i64 {
    match v {
        GeneralValue::Byte(b) => *b as i64,
        GeneralValue::Int32(i) => *i as i64,
        GeneralValue::Int64(i) => *i,
        GeneralValue::Bool(b) => *b as i64,
        _ => 0,
    }
}

fn apply_cmp(op: Cmp, a: &GeneralValue, b: &GeneralValue) -> bool {
    use std::cmp::Ordering;
    let ord = if matches!(a, GeneralValue::Variable32(_)) || matches!(b, GeneralValue::Variable32(_)) {
        a.partial_cmp(b).unwrap_or(Ordering::Equal)
    } else {
        as_int(a).cmp(&as_int(b))
    };
    match op {
        Cmp::Eq => ord == Ordering::Equal,
        Cmp::Ne => ord != Ordering::Equal,
        Cmp::Lt => ord == Ordering::Less,
        Cmp::Le => ord != Ordering::Greater,
        Cmp::Gt => ord == Ordering::Greater,
        Cmp::Ge => ord != Ordering::Less,
    }
}

/// Parse a textual expression into an [`Expr`] AST. Grammar (lowest to
/// highest precedence): `||`, `&&`, `! `, comparisons (`==` `!=` `<` `<=`
/// `>` `>=`), `+`/`-`, `*`/`/`, and atoms (`field_name`, integer literals,
/// `true`/`false`, `"string"` literals, parenthesized sub-expressions).
pub fn parse(source: &str) -> Result<Expr> {
    let mut p = Parser { tokens: tokenize(source)?, pos: 0 };
    let expr = p.parse_or()?;
    if p.pos != p.tokens.len() {
        return Err(Error::RequestError(format!("trailing input in expression near token {}", p.pos)));
    }
    Ok(expr)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Int(i64),
    Str(String),
    True,
    False,
    AndAnd,
    OrOr,
    Not,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
}

fn tokenize(source: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = source.chars().collect();
    let mut i = 0;
    let mut tokens = Vec::new();
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        match c {
            '(' => { tokens.push(Token::LParen); i += 1; }
            ')' => { tokens.push(Token::RParen); i += 1; }
            '+' => { tokens.push(Token::Plus); i += 1; }
            '-' => { tokens.push(Token::Minus); i += 1; }
            '*' => { tokens.push(Token::Star); i += 1; }
            '/' => { tokens.push(Token::Slash); i += 1; }
            '&' if chars.get(i + 1) == Some(&'&') => { tokens.push(Token::AndAnd); i += 2; }
            '|' if chars.get(i + 1) == Some(&'|') => { tokens.push(Token::OrOr); i += 2; }
            '!' if chars.get(i + 1) == Some(&'=') => { tokens.push(Token::NotEq); i += 2; }
            '!' => { tokens.push(Token::Not); i += 1; }
            '=' if chars.get(i + 1) == Some(&'=') => { tokens.push(Token::EqEq); i += 2; }
            '<' if chars.get(i + 1) == Some(&'=') => { tokens.push(Token::Le); i += 2; }
            '<' => { tokens.push(Token::Lt); i += 1; }
            '>' if chars.get(i + 1) == Some(&'=') => { tokens.push(Token::Ge); i += 2; }
            '>' => { tokens.push(Token::Gt); i += 1; }
            '"' => {
                let start = i + 1;
                let mut j = start;
                while j < chars.len() && chars[j] != '"' {
                    j += 1;
                }
                if j >= chars.len() {
                    return Err(Error::RequestError("unterminated string literal".into()));
                }
                tokens.push(Token::Str(chars[start..j].iter().collect()));
                i = j + 1;
            }
            c if c.is_ascii_digit() || (c == '-' && false) => {
                let start = i;
                let mut j = i;
                while j < chars.len() && (chars[j].is_ascii_digit()) {
                    j += 1;
                }
                let text: String = chars[start..j].iter().collect();
                tokens.push(Token::Int(text.parse().map_err(|_| {
                    Error::RequestError(format!("invalid integer literal '{text}'"))
                })?));
                i = j;
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                let mut j = i;
                while j < chars.len() && (chars[j].is_alphanumeric() || chars[j] == '_' || chars[j] == '.') {
                    j += 1;
                }
                let text: String = chars[start..j].iter().collect();
                tokens.push(match text.as_str() {
                    "true" => Token::True,
                    "false" => Token::False,
                    _ => Token::Ident(text),
                });
                i = j;
            }
            other => return Err(Error::RequestError(format!("unexpected character '{other}' in expression"))),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_and()?;
        while matches!(self.peek(), Some(Token::OrOr)) {
            self.bump();
            let rhs = self.parse_and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_not()?;
        while matches!(self.peek(), Some(Token::AndAnd)) {
            self.bump();
            let rhs = self.parse_not()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_not(&mut self) -> Result<Expr> {
        if matches!(self.peek(), Some(Token::Not)) {
            self.bump();
            return Ok(Expr::Not(Box::new(self.parse_not()?)));
        }
        self.parse_cmp()
    }

    fn parse_cmp(&mut self) -> Result<Expr> {
        let lhs = self.parse_additive()?;
        let op = match self.peek() {
            Some(Token::EqEq) => Some(Expr::Eq as fn(Box<Expr>, Box<Expr>) -> Expr),
            Some(Token::NotEq) => Some(Expr::Ne as fn(Box<Expr>, Box<Expr>) -> Expr),
            Some(Token::Lt) => Some(Expr::Lt as fn(Box<Expr>, Box<Expr>) -> Expr),
            Some(Token::Le) => Some(Expr::Le as fn(Box<Expr>, Box<Expr>) -> Expr),
            Some(Token::Gt) => Some(Expr::Gt as fn(Box<Expr>, Box<Expr>) -> Expr),
            Some(Token::Ge) => Some(Expr::Ge as fn(Box<Expr>, Box<Expr>) -> Expr),
            _ => None,
        };
        let Some(ctor) = op else { return Ok(lhs) };
        self.bump();
        let rhs = self.parse_additive()?;
        Ok(ctor(Box::new(lhs), Box::new(rhs)))
    }

    fn parse_additive(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let ctor = match self.peek() {
                Some(Token::Plus) => Expr::Add as fn(Box<Expr>, Box<Expr>) -> Expr,
                Some(Token::Minus) => Expr::Sub as fn(Box<Expr>, Box<Expr>) -> Expr,
                _ => break,
            };
            self.bump();
            let rhs = self.parse_multiplicative()?;
            lhs = ctor(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_atom()?;
        loop {
            let ctor = match self.peek() {
                Some(Token::Star) => Expr::Mul as fn(Box<Expr>, Box<Expr>) -> Expr,
                Some(Token::Slash) => Expr::Div as fn(Box<Expr>, Box<Expr>) -> Expr,
                _ => break,
            };
            self.bump();
            let rhs = self.parse_atom()?;
            lhs = ctor(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_atom(&mut self) -> Result<Expr> {
        match self.bump() {
            Some(Token::Ident(name)) => Ok(Expr::Field(name)),
            Some(Token::Int(v)) => Ok(Expr::LitInt(v)),
            Some(Token::True) => Ok(Expr::LitBool(true)),
            Some(Token::False) => Ok(Expr::LitBool(false)),
            Some(Token::Str(s)) => Ok(Expr::LitBytes(s.into_bytes())),
            Some(Token::Minus) => Ok(Expr::Sub(Box::new(Expr::LitInt(0)), Box::new(self.parse_atom()?))),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.bump() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(Error::RequestError("expected ')'".into())),
                }
            }
            other => Err(Error::RequestError(format!("unexpected token {other:?} in expression"))),
        }
    }
}

/// Compile and evaluate `source` as a one-shot boolean predicate, for tests
/// and small ad-hoc calls. Real operators compile once via [`Expr::compile`]
/// and reuse the [`CompiledExpr`] across every row.
pub fn eval_where(source: &str, ty: &ExtentType, extent: &Extent, record: usize) -> Result<bool> {
    parse(source)?.compile(ty)?.eval_bool(extent, record)
}
