//! Symbolic expressions over parameters, state variables, ports and aliases.
//!
//! Expressions serialize as their textual form, so a sentinel written to disk
//! and read back compares equal to the in-memory tree it came from as long as
//! the printer and the parser agree (see `parser_roundtrip` tests).

mod lexer;
mod parser;
mod simplify;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{DynamicsError, Result};

pub use lexer::{lex, LexError, Spanned, Token};
pub use parser::parse;

/// Name of the independent variable
pub const TIME: &str = "t";

/// Built-in functions that may appear in expressions
pub const BUILTIN_FUNCTIONS: &[&str] = &[
    "exp", "log", "log10", "sqrt", "pow", "abs", "fabs", "floor", "ceil", "sin", "cos", "tan",
    "sinh", "cosh", "tanh", "asin", "acos", "atan", "atan2", "min", "max", "fmod",
    "random.uniform", "random.normal", "random.exponential", "random.poisson",
];

/// Built-in constants (value known without a declaration)
pub const BUILTIN_CONSTANTS: &[(&str, f64)] = &[("pi", std::f64::consts::PI), ("e", std::f64::consts::E)];

/// Unary operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnOp {
    /// Arithmetic negation
    Neg,
    /// Logical negation
    Not,
}

/// Binary operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/`
    Div,
    /// `^`
    Pow,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `&&`
    And,
    /// `||`
    Or,
}

impl BinOp {
    /// Binding strength; higher binds tighter
    pub fn precedence(self) -> u8 {
        match self {
            BinOp::Or => 1,
            BinOp::And => 2,
            BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge | BinOp::Eq | BinOp::Ne => 3,
            BinOp::Add | BinOp::Sub => 4,
            BinOp::Mul | BinOp::Div => 5,
            BinOp::Pow => 7,
        }
    }

    /// Operator symbol as printed
    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Pow => "^",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::And => "&&",
            BinOp::Or => "||",
        }
    }

    /// True for relational operators
    pub fn is_comparison(self) -> bool {
        self.precedence() == 3
    }

    /// True for `&&` and `||`
    pub fn is_logical(self) -> bool {
        matches!(self, BinOp::And | BinOp::Or)
    }
}

const UNARY_PRECEDENCE: u8 = 6;

/// One branch of a piecewise expression
#[derive(Debug, Clone, PartialEq)]
pub enum Piece {
    /// `value` when `cond` holds
    When {
        /// Branch condition
        cond: Expr,
        /// Branch value
        value: Expr,
    },
    /// Fallback branch
    Otherwise {
        /// Fallback value
        value: Expr,
    },
}

impl Piece {
    /// Value of the branch
    pub fn value(&self) -> &Expr {
        match self {
            Piece::When { value, .. } | Piece::Otherwise { value } => value,
        }
    }
}

/// Expression tree
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Numeric literal
    Num(f64),
    /// Reference to a named element
    Sym(String),
    /// Unary operation
    Unary(UnOp, Box<Expr>),
    /// Binary operation
    Binary(BinOp, Box<Expr>, Box<Expr>),
    /// Function call
    Call(String, Vec<Expr>),
    /// Ordered piecewise expression; the first matching branch wins
    Piecewise(Vec<Piece>),
}

impl Expr {
    /// Numeric literal
    pub fn num(value: f64) -> Self {
        Expr::Num(value)
    }

    /// Symbol reference
    pub fn sym(name: impl Into<String>) -> Self {
        Expr::Sym(name.into())
    }

    /// Negation; folds numeric literals
    pub fn neg(e: Expr) -> Self {
        match e {
            Expr::Num(v) => Expr::Num(-v),
            other => Expr::Unary(UnOp::Neg, Box::new(other)),
        }
    }

    /// Logical negation
    pub fn not(e: Expr) -> Self {
        Expr::Unary(UnOp::Not, Box::new(e))
    }

    /// Binary operation
    pub fn binary(op: BinOp, lhs: Expr, rhs: Expr) -> Self {
        Expr::Binary(op, Box::new(lhs), Box::new(rhs))
    }

    /// `lhs + rhs`
    pub fn add(lhs: Expr, rhs: Expr) -> Self {
        Self::binary(BinOp::Add, lhs, rhs)
    }

    /// `lhs - rhs`
    pub fn sub(lhs: Expr, rhs: Expr) -> Self {
        Self::binary(BinOp::Sub, lhs, rhs)
    }

    /// `lhs * rhs`
    pub fn mul(lhs: Expr, rhs: Expr) -> Self {
        Self::binary(BinOp::Mul, lhs, rhs)
    }

    /// `lhs / rhs`
    pub fn div(lhs: Expr, rhs: Expr) -> Self {
        Self::binary(BinOp::Div, lhs, rhs)
    }

    /// `base ^ exponent`
    pub fn pow(base: Expr, exponent: Expr) -> Self {
        Self::binary(BinOp::Pow, base, exponent)
    }

    /// `lhs && rhs`
    pub fn and(lhs: Expr, rhs: Expr) -> Self {
        Self::binary(BinOp::And, lhs, rhs)
    }

    /// Function call
    pub fn call(name: impl Into<String>, args: Vec<Expr>) -> Self {
        Expr::Call(name.into(), args)
    }

    /// Sum of terms (`0` when empty)
    pub fn sum(terms: impl IntoIterator<Item = Expr>) -> Self {
        terms
            .into_iter()
            .reduce(Expr::add)
            .unwrap_or(Expr::Num(0.0))
    }

    /// Product of factors (`1` when empty)
    pub fn product(factors: impl IntoIterator<Item = Expr>) -> Self {
        factors
            .into_iter()
            .reduce(Expr::mul)
            .unwrap_or(Expr::Num(1.0))
    }

    /// Parse from text
    pub fn parse(text: &str) -> Result<Self> {
        parser::parse(text)
    }

    /// Literal value, if this is a number
    pub fn as_num(&self) -> Option<f64> {
        match self {
            Expr::Num(v) => Some(*v),
            _ => None,
        }
    }

    /// Symbol name, if this is a bare symbol
    pub fn as_sym(&self) -> Option<&str> {
        match self {
            Expr::Sym(s) => Some(s),
            _ => None,
        }
    }

    /// True if this is the literal zero
    pub fn is_zero(&self) -> bool {
        self.as_num() == Some(0.0)
    }

    /// Simplified copy
    pub fn simplify(&self) -> Expr {
        simplify::simplify(self)
    }

    /// Free symbols (function names excluded)
    pub fn symbols(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.visit(&mut |e| {
            if let Expr::Sym(s) = e {
                out.insert(s.clone());
            }
        });
        out
    }

    /// Names of called functions
    pub fn functions(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.visit(&mut |e| {
            if let Expr::Call(name, _) = e {
                out.insert(name.clone());
            }
        });
        out
    }

    /// True if `name` occurs as a symbol
    pub fn contains(&self, name: &str) -> bool {
        let mut found = false;
        self.visit(&mut |e| {
            if let Expr::Sym(s) = e {
                found |= s == name;
            }
        });
        found
    }

    /// Number of occurrences of `name`
    pub fn count(&self, name: &str) -> usize {
        let mut n = 0;
        self.visit(&mut |e| {
            if matches!(e, Expr::Sym(s) if s == name) {
                n += 1;
            }
        });
        n
    }

    /// Pre-order traversal
    pub fn visit<F: FnMut(&Expr)>(&self, f: &mut F) {
        f(self);
        match self {
            Expr::Num(_) | Expr::Sym(_) => {}
            Expr::Unary(_, e) => e.visit(f),
            Expr::Binary(_, a, b) => {
                a.visit(f);
                b.visit(f);
            }
            Expr::Call(_, args) => args.iter().for_each(|a| a.visit(f)),
            Expr::Piecewise(pieces) => {
                for piece in pieces {
                    if let Piece::When { cond, .. } = piece {
                        cond.visit(f);
                    }
                    piece.value().visit(f);
                }
            }
        }
    }

    /// Rebuild the tree bottom-up, letting `f` replace each node
    pub fn map<F: FnMut(Expr) -> Expr>(self, f: &mut F) -> Expr {
        let rebuilt = match self {
            Expr::Unary(op, e) => Expr::Unary(op, Box::new(e.map(f))),
            Expr::Binary(op, a, b) => Expr::Binary(op, Box::new(a.map(f)), Box::new(b.map(f))),
            Expr::Call(name, args) => Expr::Call(name, args.into_iter().map(|a| a.map(f)).collect()),
            Expr::Piecewise(pieces) => Expr::Piecewise(
                pieces
                    .into_iter()
                    .map(|p| match p {
                        Piece::When { cond, value } => Piece::When {
                            cond: cond.map(f),
                            value: value.map(f),
                        },
                        Piece::Otherwise { value } => Piece::Otherwise { value: value.map(f) },
                    })
                    .collect(),
            ),
            leaf => leaf,
        };
        f(rebuilt)
    }

    /// Replace every occurrence of symbol `name` by `replacement`
    pub fn substitute(&self, name: &str, replacement: &Expr) -> Expr {
        self.clone().map(&mut |e| match e {
            Expr::Sym(ref s) if s == name => replacement.clone(),
            other => other,
        })
    }

    /// Replace several symbols at once (no rescanning of replacements)
    pub fn substitute_all(&self, subs: &BTreeMap<String, Expr>) -> Expr {
        if subs.is_empty() {
            return self.clone();
        }
        self.clone().map(&mut |e| match e {
            Expr::Sym(s) => match subs.get(&s) {
                Some(replacement) => replacement.clone(),
                None => Expr::Sym(s),
            },
            other => other,
        })
    }

    /// Rename symbol `old` to `new` in place
    pub fn rename(&mut self, old: &str, new: &str) {
        let replaced = self.substitute(old, &Expr::sym(new));
        *self = replaced;
    }

    /// Flatten sums into signed additive terms (`+1.0` / `-1.0`)
    pub fn additive_terms(&self) -> Vec<(f64, &Expr)> {
        let mut out = Vec::new();
        collect_terms(self, 1.0, &mut out);
        out
    }

    /// Evaluate numerically; booleans are `1.0` / `0.0`
    pub fn eval(&self, lookup: &dyn Fn(&str) -> Option<f64>) -> Result<f64> {
        match self {
            Expr::Num(v) => Ok(*v),
            Expr::Sym(s) => lookup(s)
                .or_else(|| BUILTIN_CONSTANTS.iter().find(|(n, _)| n == s).map(|(_, v)| *v))
                .ok_or_else(|| DynamicsError::eval(format!("unbound symbol '{}'", s))),
            Expr::Unary(UnOp::Neg, e) => Ok(-e.eval(lookup)?),
            Expr::Unary(UnOp::Not, e) => Ok(truth(e.eval(lookup)? == 0.0)),
            Expr::Binary(op, a, b) => {
                let a = a.eval(lookup)?;
                // short-circuit so guarded branches don't raise
                match op {
                    BinOp::And if a == 0.0 => return Ok(0.0),
                    BinOp::Or if a != 0.0 => return Ok(1.0),
                    _ => {}
                }
                let b = b.eval(lookup)?;
                Ok(apply_binary(*op, a, b))
            }
            Expr::Call(name, args) => {
                let values = args
                    .iter()
                    .map(|a| a.eval(lookup))
                    .collect::<Result<Vec<_>>>()?;
                apply_function(name, &values)
            }
            Expr::Piecewise(pieces) => {
                for piece in pieces {
                    match piece {
                        Piece::When { cond, value } => {
                            if cond.eval(lookup)? != 0.0 {
                                return value.eval(lookup);
                            }
                        }
                        Piece::Otherwise { value } => return value.eval(lookup),
                    }
                }
                Err(DynamicsError::eval("no piecewise branch matched"))
            }
        }
    }

    fn precedence(&self) -> u8 {
        match self {
            Expr::Num(v) if *v < 0.0 || (*v == 0.0 && v.is_sign_negative()) => UNARY_PRECEDENCE,
            Expr::Unary(..) => UNARY_PRECEDENCE,
            Expr::Binary(op, ..) => op.precedence(),
            _ => u8::MAX,
        }
    }
}

fn collect_terms<'a>(e: &'a Expr, sign: f64, out: &mut Vec<(f64, &'a Expr)>) {
    match e {
        Expr::Binary(BinOp::Add, a, b) => {
            collect_terms(a, sign, out);
            collect_terms(b, sign, out);
        }
        Expr::Binary(BinOp::Sub, a, b) => {
            collect_terms(a, sign, out);
            collect_terms(b, -sign, out);
        }
        Expr::Unary(UnOp::Neg, a) => collect_terms(a, -sign, out),
        other => out.push((sign, other)),
    }
}

fn truth(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}

pub(crate) fn apply_binary(op: BinOp, a: f64, b: f64) -> f64 {
    match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => a / b,
        BinOp::Pow => a.powf(b),
        BinOp::Lt => truth(a < b),
        BinOp::Le => truth(a <= b),
        BinOp::Gt => truth(a > b),
        BinOp::Ge => truth(a >= b),
        BinOp::Eq => truth(a == b),
        BinOp::Ne => truth(a != b),
        BinOp::And => truth(a != 0.0 && b != 0.0),
        BinOp::Or => truth(a != 0.0 || b != 0.0),
    }
}

pub(crate) fn apply_function(name: &str, args: &[f64]) -> Result<f64> {
    let arity = |n: usize| -> Result<()> {
        if args.len() == n {
            Ok(())
        } else {
            Err(DynamicsError::eval(format!(
                "function '{}' expects {} argument(s), got {}",
                name,
                n,
                args.len()
            )))
        }
    };
    let value = match name {
        "exp" => {
            arity(1)?;
            args[0].exp()
        }
        "log" => {
            arity(1)?;
            args[0].ln()
        }
        "log10" => {
            arity(1)?;
            args[0].log10()
        }
        "sqrt" => {
            arity(1)?;
            args[0].sqrt()
        }
        "abs" | "fabs" => {
            arity(1)?;
            args[0].abs()
        }
        "floor" => {
            arity(1)?;
            args[0].floor()
        }
        "ceil" => {
            arity(1)?;
            args[0].ceil()
        }
        "sin" => {
            arity(1)?;
            args[0].sin()
        }
        "cos" => {
            arity(1)?;
            args[0].cos()
        }
        "tan" => {
            arity(1)?;
            args[0].tan()
        }
        "sinh" => {
            arity(1)?;
            args[0].sinh()
        }
        "cosh" => {
            arity(1)?;
            args[0].cosh()
        }
        "tanh" => {
            arity(1)?;
            args[0].tanh()
        }
        "asin" => {
            arity(1)?;
            args[0].asin()
        }
        "acos" => {
            arity(1)?;
            args[0].acos()
        }
        "atan" => {
            arity(1)?;
            args[0].atan()
        }
        "atan2" => {
            arity(2)?;
            args[0].atan2(args[1])
        }
        "pow" => {
            arity(2)?;
            args[0].powf(args[1])
        }
        "fmod" => {
            arity(2)?;
            args[0] % args[1]
        }
        "min" => {
            arity(2)?;
            args[0].min(args[1])
        }
        "max" => {
            arity(2)?;
            args[0].max(args[1])
        }
        other => {
            return Err(DynamicsError::eval(format!(
                "function '{}' cannot be evaluated in-process",
                other
            )))
        }
    };
    Ok(value)
}

fn fmt_child(f: &mut Formatter<'_>, child: &Expr, min_precedence: u8) -> fmt::Result {
    if child.precedence() < min_precedence {
        write!(f, "({})", child)
    } else {
        write!(f, "{}", child)
    }
}

impl Display for Expr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Num(v) => write!(f, "{}", v),
            Expr::Sym(s) => write!(f, "{}", s),
            Expr::Unary(op, e) => {
                let sym = match op {
                    UnOp::Neg => "-",
                    UnOp::Not => "!",
                };
                write!(f, "{}", sym)?;
                // `--x` would lex fine but reads badly
                if matches!(**e, Expr::Unary(..)) || e.precedence() == UNARY_PRECEDENCE {
                    write!(f, "({})", e)
                } else {
                    fmt_child(f, e, UNARY_PRECEDENCE)
                }
            }
            Expr::Binary(op, a, b) => {
                let p = op.precedence();
                if *op == BinOp::Pow {
                    // right associative: parenthesise a left operand of equal precedence
                    fmt_child(f, a, p + 1)?;
                    write!(f, "^")?;
                    fmt_child(f, b, UNARY_PRECEDENCE)
                } else {
                    fmt_child(f, a, p)?;
                    write!(f, " {} ", op.symbol())?;
                    fmt_child(f, b, p + 1)
                }
            }
            Expr::Call(name, args) => {
                write!(f, "{}(", name)?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", a)?;
                }
                write!(f, ")")
            }
            Expr::Piecewise(pieces) => {
                write!(f, "{{")?;
                for (i, piece) in pieces.iter().enumerate() {
                    if i > 0 {
                        write!(f, ";")?;
                    }
                    match piece {
                        Piece::When { cond, value } => write!(f, " {} if {}", value, cond)?,
                        Piece::Otherwise { value } => write!(f, " {} otherwise", value)?,
                    }
                }
                write!(f, " }}")
            }
        }
    }
}

impl FromStr for Expr {
    type Err = DynamicsError;

    fn from_str(s: &str) -> Result<Self> {
        parser::parse(s)
    }
}

impl Serialize for Expr {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Expr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        parser::parse(&text).map_err(serde::de::Error::custom)
    }
}
