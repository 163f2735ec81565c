//! Local algebraic rewrites applied bottom-up until nothing changes.

use super::{apply_binary, BinOp, Expr, Piece, UnOp};

const MAX_ROUNDS: usize = 32;

pub(super) fn simplify(expr: &Expr) -> Expr {
    let mut current = expr.clone();
    for _ in 0..MAX_ROUNDS {
        let next = current.clone().map(&mut rewrite);
        if next == current {
            break;
        }
        current = next;
    }
    current
}

fn is_num(e: &Expr, v: f64) -> bool {
    e.as_num() == Some(v)
}

fn rewrite(e: Expr) -> Expr {
    match e {
        Expr::Unary(UnOp::Neg, inner) => match *inner {
            Expr::Num(v) => Expr::Num(-v),
            Expr::Unary(UnOp::Neg, x) => *x,
            other => Expr::Unary(UnOp::Neg, Box::new(other)),
        },
        Expr::Unary(UnOp::Not, inner) => match *inner {
            Expr::Num(v) => Expr::Num(if v == 0.0 { 1.0 } else { 0.0 }),
            other => Expr::not(other),
        },
        Expr::Binary(op, a, b) => rewrite_binary(op, *a, *b),
        Expr::Piecewise(pieces) => rewrite_piecewise(pieces),
        other => other,
    }
}

fn rewrite_binary(op: BinOp, a: Expr, b: Expr) -> Expr {
    if let (Some(x), Some(y)) = (a.as_num(), b.as_num()) {
        let folded = apply_binary(op, x, y);
        if folded.is_finite() {
            return Expr::Num(folded);
        }
    }
    match op {
        BinOp::Add => {
            if a.is_zero() {
                return b;
            }
            if b.is_zero() {
                return a;
            }
            match b {
                Expr::Unary(UnOp::Neg, y) => Expr::sub(a, *y),
                Expr::Num(v) if v < 0.0 => Expr::sub(a, Expr::Num(-v)),
                b => Expr::add(a, b),
            }
        }
        BinOp::Sub => {
            if b.is_zero() {
                return a;
            }
            if a.is_zero() {
                return Expr::neg(b);
            }
            if a == b {
                return Expr::Num(0.0);
            }
            match b {
                Expr::Unary(UnOp::Neg, y) => Expr::add(a, *y),
                Expr::Num(v) if v < 0.0 => Expr::add(a, Expr::Num(-v)),
                b => Expr::sub(a, b),
            }
        }
        BinOp::Mul => {
            if a.is_zero() || b.is_zero() {
                return Expr::Num(0.0);
            }
            if is_num(&a, 1.0) {
                return b;
            }
            if is_num(&b, 1.0) {
                return a;
            }
            if is_num(&a, -1.0) {
                return Expr::neg(b);
            }
            if is_num(&b, -1.0) {
                return Expr::neg(a);
            }
            match (a, b) {
                (Expr::Unary(UnOp::Neg, x), y) => Expr::neg(Expr::mul(*x, y)),
                (x, Expr::Unary(UnOp::Neg, y)) => Expr::neg(Expr::mul(x, *y)),
                // (n / d) * d
                (Expr::Binary(BinOp::Div, n, d), c) if *d == c => *n,
                // d * (n / d)
                (c, Expr::Binary(BinOp::Div, n, d)) if *d == c => *n,
                (x, y) => Expr::mul(x, y),
            }
        }
        BinOp::Div => {
            if is_num(&b, 1.0) {
                return a;
            }
            if a.is_zero() && !b.is_zero() {
                return Expr::Num(0.0);
            }
            if a == b && !a.is_zero() {
                return Expr::Num(1.0);
            }
            match (a, b) {
                (Expr::Unary(UnOp::Neg, x), y) => Expr::neg(Expr::div(*x, y)),
                (Expr::Binary(BinOp::Mul, x, y), c) if *y == c => *x,
                (Expr::Binary(BinOp::Mul, x, y), c) if *x == c => *y,
                (x, y) => Expr::div(x, y),
            }
        }
        BinOp::Pow => {
            if is_num(&b, 1.0) {
                return a;
            }
            if b.is_zero() {
                return Expr::Num(1.0);
            }
            Expr::pow(a, b)
        }
        op => Expr::binary(op, a, b),
    }
}

fn rewrite_piecewise(pieces: Vec<Piece>) -> Expr {
    let mut kept = Vec::with_capacity(pieces.len());
    for piece in pieces {
        match piece {
            Piece::When { cond, value } => match cond.as_num() {
                Some(c) if c == 0.0 => continue,
                Some(_) => {
                    kept.push(Piece::Otherwise { value });
                    break;
                }
                None => kept.push(Piece::When { cond, value }),
            },
            Piece::Otherwise { value } => {
                kept.push(Piece::Otherwise { value });
                break;
            }
        }
    }
    // all branches agree
    if let Some(first) = kept.first() {
        let v = first.value();
        if kept.iter().all(|p| p.value() == v) && matches!(kept.last(), Some(Piece::Otherwise { .. })) {
            return v.clone();
        }
    }
    Expr::Piecewise(kept)
}
