//! Precedence-climbing parser over [`Token`]s.

use super::lexer::{lex, Spanned, Token};
use super::{BinOp, Expr, Piece};
use crate::{DynamicsError, Result};

/// Parse an expression from text
pub fn parse(source: &str) -> Result<Expr> {
    let tokens = lex(source).map_err(|e| DynamicsError::parse(source, e.to_string()))?;
    let mut parser = Parser {
        source,
        tokens,
        pos: 0,
    };
    let expr = parser.expr(1)?;
    if let Some(tok) = parser.peek() {
        return Err(parser.error(format!("unexpected trailing token {:?}", tok)));
    }
    Ok(expr)
}

struct Parser<'src> {
    source: &'src str,
    tokens: Vec<Spanned<Token<'src>>>,
    pos: usize,
}

impl<'src> Parser<'src> {
    fn peek(&self) -> Option<&Token<'src>> {
        self.tokens.get(self.pos).map(|s| &s.token)
    }

    fn bump(&mut self) -> Option<Token<'src>> {
        let tok = self.tokens.get(self.pos).map(|s| s.token.clone());
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn error(&self, reason: impl Into<String>) -> DynamicsError {
        let at = self
            .tokens
            .get(self.pos)
            .map(|s| s.span.start)
            .unwrap_or(self.source.len());
        DynamicsError::parse(self.source, format!("{} (at byte {})", reason.into(), at))
    }

    fn expect(&mut self, expected: Token<'src>) -> Result<()> {
        match self.bump() {
            Some(tok) if tok == expected => Ok(()),
            Some(tok) => {
                self.pos -= 1;
                Err(self.error(format!("expected {:?}, found {:?}", expected, tok)))
            }
            None => Err(self.error(format!("expected {:?}, found end of input", expected))),
        }
    }

    fn binary_op(&self) -> Option<BinOp> {
        let op = match self.peek()? {
            Token::Plus => BinOp::Add,
            Token::Minus => BinOp::Sub,
            Token::Star => BinOp::Mul,
            Token::Slash => BinOp::Div,
            Token::Less => BinOp::Lt,
            Token::LessEq => BinOp::Le,
            Token::Greater => BinOp::Gt,
            Token::GreaterEq => BinOp::Ge,
            Token::DoubleEq => BinOp::Eq,
            Token::NotEq => BinOp::Ne,
            Token::And => BinOp::And,
            Token::Or => BinOp::Or,
            _ => return None,
        };
        Some(op)
    }

    fn expr(&mut self, min_precedence: u8) -> Result<Expr> {
        let mut lhs = self.unary()?;
        while let Some(op) = self.binary_op() {
            let p = op.precedence();
            if p < min_precedence {
                break;
            }
            self.pos += 1;
            let rhs = self.expr(p + 1)?;
            lhs = Expr::binary(op, lhs, rhs);
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr> {
        match self.peek() {
            Some(Token::Minus) => {
                self.pos += 1;
                Ok(Expr::neg(self.unary()?))
            }
            Some(Token::Plus) => {
                self.pos += 1;
                self.unary()
            }
            Some(Token::Not) => {
                self.pos += 1;
                Ok(Expr::not(self.unary()?))
            }
            _ => self.power(),
        }
    }

    fn power(&mut self) -> Result<Expr> {
        let base = self.primary()?;
        if matches!(self.peek(), Some(Token::Pow)) {
            self.pos += 1;
            let exponent = self.unary()?;
            return Ok(Expr::pow(base, exponent));
        }
        Ok(base)
    }

    fn primary(&mut self) -> Result<Expr> {
        match self.bump() {
            Some(Token::Number(text)) => text
                .parse::<f64>()
                .map(Expr::Num)
                .map_err(|_| self.error(format!("bad number '{}'", text))),
            Some(Token::Ident(name)) => {
                if matches!(self.peek(), Some(Token::ParenOpen)) {
                    self.pos += 1;
                    let mut args = Vec::new();
                    if !matches!(self.peek(), Some(Token::ParenClose)) {
                        loop {
                            args.push(self.expr(1)?);
                            if matches!(self.peek(), Some(Token::Comma)) {
                                self.pos += 1;
                            } else {
                                break;
                            }
                        }
                    }
                    self.expect(Token::ParenClose)?;
                    Ok(Expr::call(name, args))
                } else {
                    Ok(Expr::sym(name))
                }
            }
            Some(Token::ParenOpen) => {
                let inner = self.expr(1)?;
                self.expect(Token::ParenClose)?;
                Ok(inner)
            }
            Some(Token::BraceOpen) => self.piecewise(),
            Some(tok) => {
                self.pos -= 1;
                Err(self.error(format!("unexpected token {:?}", tok)))
            }
            None => Err(self.error("unexpected end of input")),
        }
    }

    /// `{ value if cond; value otherwise }`
    fn piecewise(&mut self) -> Result<Expr> {
        let mut pieces = Vec::new();
        loop {
            let value = self.expr(1)?;
            match self.bump() {
                Some(Token::Ident("if")) => {
                    let cond = self.expr(1)?;
                    pieces.push(Piece::When { cond, value });
                }
                Some(Token::Ident("otherwise")) => pieces.push(Piece::Otherwise { value }),
                _ => {
                    self.pos = self.pos.saturating_sub(1);
                    return Err(self.error("expected 'if' or 'otherwise' in piecewise branch"));
                }
            }
            match self.bump() {
                Some(Token::Semicolon) => continue,
                Some(Token::BraceClose) => break,
                _ => {
                    self.pos = self.pos.saturating_sub(1);
                    return Err(self.error("expected ';' or '}' after piecewise branch"));
                }
            }
        }
        if pieces.is_empty() {
            return Err(self.error("empty piecewise expression"));
        }
        Ok(Expr::Piecewise(pieces))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::UnOp;

    #[test]
    fn precedence_and_associativity() {
        let e = parse("a + b * c - d").unwrap();
        assert_eq!(
            e,
            Expr::sub(
                Expr::add(Expr::sym("a"), Expr::mul(Expr::sym("b"), Expr::sym("c"))),
                Expr::sym("d")
            )
        );
        let p = parse("a ** b ** c").unwrap();
        assert_eq!(
            p,
            Expr::pow(Expr::sym("a"), Expr::pow(Expr::sym("b"), Expr::sym("c")))
        );
    }

    #[test]
    fn unary_minus_binds_looser_than_power() {
        let e = parse("-x^2").unwrap();
        assert_eq!(
            e,
            Expr::Unary(UnOp::Neg, Box::new(Expr::pow(Expr::sym("x"), Expr::num(2.0))))
        );
        assert_eq!(parse("-3").unwrap(), Expr::num(-3.0));
    }

    #[test]
    fn logical_operators() {
        let e = parse("v > theta && !(t < t_ref) || flag").unwrap();
        match e {
            Expr::Binary(BinOp::Or, lhs, _) => assert!(matches!(*lhs, Expr::Binary(BinOp::And, ..))),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn function_calls() {
        let e = parse("pow(x, 2) + random.uniform()").unwrap();
        let f = e.functions();
        assert!(f.contains("pow"));
        assert!(f.contains("random.uniform"));
    }

    #[test]
    fn piecewise_branches() {
        let e = parse("{ 1 if v > 0; -1 if v < 0; 0 otherwise }").unwrap();
        match e {
            Expr::Piecewise(pieces) => {
                assert_eq!(pieces.len(), 3);
                assert!(matches!(pieces[2], Piece::Otherwise { .. }));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn errors_name_the_source() {
        let err = parse("a + (b").unwrap_err();
        assert!(err.to_string().contains("a + (b"));
        assert!(parse("a b").is_err());
        assert!(parse("{ a }").is_err());
    }

    #[test]
    fn printed_form_reparses() {
        for src in [
            "-(a + b) / c",
            "a / (b * c)",
            "(-2)^x",
            "a - -3",
            "!(a < b) && c >= d",
            "{ exp(-v / 10) if v < -50; 1 otherwise }",
            "1e-08 * x",
        ] {
            let e = parse(src).unwrap();
            let again = parse(&e.to_string()).unwrap();
            assert_eq!(e, again, "{}", src);
        }
    }
}
