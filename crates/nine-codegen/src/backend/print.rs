//! Printing expressions in back-end syntax.

use nine_dynamics::{BinOp, Expr, Piece, UnOp};

use crate::error::{PipelineError, Result};
use crate::render::Snippet;

const UNARY: u8 = 6;
const ATOM: u8 = u8::MAX;

/// Target language of a printer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// NEURON's NMODL
    Nmodl,
    /// C++ against the NEST module API
    Cpp,
}

/// Random draws, the only calls with back-end specific spellings
pub const NMODL_SNIPPETS: &[(&str, Snippet)] = &[
    ("random_uniform", nmodl_uniform),
    ("random_normal", nmodl_normal),
    ("random_exponential", nmodl_exponential),
    ("random_poisson", nmodl_poisson),
];

/// See [`NMODL_SNIPPETS`]
pub const CPP_SNIPPETS: &[(&str, Snippet)] = &[
    ("random_uniform", cpp_uniform),
    ("random_normal", cpp_normal),
    ("random_exponential", cpp_exponential),
    ("random_poisson", cpp_poisson),
];

fn nmodl_uniform(args: &[String]) -> String {
    format!("nineml_gsl_uniform({})", args.join(", "))
}

fn nmodl_normal(args: &[String]) -> String {
    format!("nineml_gsl_normal({})", args.join(", "))
}

fn nmodl_exponential(args: &[String]) -> String {
    format!("nineml_gsl_exponential({})", args.join(", "))
}

fn nmodl_poisson(args: &[String]) -> String {
    format!("nineml_gsl_poisson({})", args.join(", "))
}

fn cpp_uniform(args: &[String]) -> String {
    format!("nineml_uniform(rng, {})", args.join(", "))
}

fn cpp_normal(args: &[String]) -> String {
    format!("nineml_normal(rng, {})", args.join(", "))
}

fn cpp_exponential(args: &[String]) -> String {
    format!("nineml_exponential(rng, {})", args.join(", "))
}

fn cpp_poisson(args: &[String]) -> String {
    format!("nineml_poisson(rng, {})", args.join(", "))
}

/// Prints [`Expr`] trees for one dialect
#[derive(Debug, Clone, Copy)]
pub struct ExprPrinter {
    dialect: Dialect,
}

impl ExprPrinter {
    /// NMODL printer
    pub fn nmodl() -> Self {
        Self { dialect: Dialect::Nmodl }
    }

    /// C++ printer
    pub fn cpp() -> Self {
        Self { dialect: Dialect::Cpp }
    }

    /// Dialect printed
    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn snippets(&self) -> &'static [(&'static str, Snippet)] {
        match self.dialect {
            Dialect::Nmodl => NMODL_SNIPPETS,
            Dialect::Cpp => CPP_SNIPPETS,
        }
    }

    /// Print a single expression
    pub fn print(&self, e: &Expr) -> Result<String> {
        let mut out = String::new();
        self.write(e, &mut out)?;
        Ok(out)
    }

    /// `lhs = e` as statements; a top-level piecewise becomes an if/else chain
    pub fn assignment(&self, lhs: &str, e: &Expr) -> Result<Vec<String>> {
        let terminator = match self.dialect {
            Dialect::Nmodl => "",
            Dialect::Cpp => ";",
        };
        let Expr::Piecewise(pieces) = e else {
            return Ok(vec![format!("{} = {}{}", lhs, self.print(e)?, terminator)]);
        };
        let mut lines = Vec::new();
        for (i, piece) in pieces.iter().enumerate() {
            let value = format!("{} = {}{}", lhs, self.print(piece.value())?, terminator);
            match piece {
                Piece::When { cond, .. } => {
                    let keyword = if i == 0 { "if" } else { "} else if" };
                    lines.push(format!("{} ({}) {{", keyword, self.print(cond)?));
                }
                Piece::Otherwise { .. } if i == 0 => {
                    lines.push(value);
                    return Ok(lines);
                }
                Piece::Otherwise { .. } => lines.push("} else {".to_string()),
            }
            lines.push(format!("    {}", value));
        }
        lines.push("}".to_string());
        Ok(lines)
    }

    fn write(&self, e: &Expr, out: &mut String) -> Result<()> {
        match e {
            Expr::Num(v) => out.push_str(&self.number(*v)),
            Expr::Sym(s) => out.push_str(self.symbol(s)),
            Expr::Unary(op, inner) => {
                out.push_str(match op {
                    UnOp::Neg => "-",
                    UnOp::Not => "!",
                });
                if precedence(inner) <= UNARY {
                    out.push('(');
                    self.write(inner, out)?;
                    out.push(')');
                } else {
                    self.write(inner, out)?;
                }
            }
            Expr::Binary(BinOp::Pow, base, exponent) => match self.dialect {
                Dialect::Nmodl => {
                    self.child(base, BinOp::Pow.precedence() + 1, out)?;
                    out.push('^');
                    self.child(exponent, ATOM, out)?;
                }
                Dialect::Cpp => {
                    out.push_str("std::pow(");
                    self.write(base, out)?;
                    out.push_str(", ");
                    self.write(exponent, out)?;
                    out.push(')');
                }
            },
            Expr::Binary(op, a, b) => {
                let p = op.precedence();
                self.child(a, p, out)?;
                out.push(' ');
                out.push_str(op.symbol());
                out.push(' ');
                self.child(b, p + 1, out)?;
            }
            Expr::Call(name, args) => {
                let printed = args.iter().map(|a| self.print(a)).collect::<Result<Vec<_>>>()?;
                if let Some(rest) = name.strip_prefix("random.") {
                    let key = format!("random_{}", rest);
                    let snippet = self
                        .snippets()
                        .iter()
                        .find(|(n, _)| *n == key)
                        .map(|(_, f)| *f)
                        .ok_or_else(|| PipelineError::render(name.as_str(), "no snippet for this distribution"))?;
                    out.push_str(&snippet(&printed));
                } else {
                    out.push_str(self.function(name));
                    out.push('(');
                    out.push_str(&printed.join(", "));
                    out.push(')');
                }
            }
            Expr::Piecewise(pieces) => match self.dialect {
                Dialect::Nmodl => {
                    return Err(PipelineError::render(
                        e.to_string(),
                        "piecewise expressions must be at the top level of an assignment in NMODL",
                    ))
                }
                Dialect::Cpp => self.ternary(pieces, out)?,
            },
        }
        Ok(())
    }

    fn child(&self, e: &Expr, min: u8, out: &mut String) -> Result<()> {
        if precedence(e) < min {
            out.push('(');
            self.write(e, out)?;
            out.push(')');
            Ok(())
        } else {
            self.write(e, out)
        }
    }

    fn ternary(&self, pieces: &[Piece], out: &mut String) -> Result<()> {
        out.push('(');
        let mut closing = 0;
        for piece in pieces {
            match piece {
                Piece::When { cond, value } => {
                    out.push('(');
                    self.write(cond, out)?;
                    out.push_str(") ? (");
                    self.write(value, out)?;
                    out.push_str(") : (");
                    closing += 1;
                }
                Piece::Otherwise { value } => {
                    self.write(value, out)?;
                    break;
                }
            }
        }
        if matches!(pieces.last(), Some(Piece::When { .. })) {
            out.push_str("std::numeric_limits<double>::quiet_NaN()");
        }
        out.push_str(&")".repeat(closing));
        out.push(')');
        Ok(())
    }

    fn number(&self, v: f64) -> String {
        let text = if v.is_infinite() {
            match self.dialect {
                Dialect::Nmodl => "1e300".to_string(),
                Dialect::Cpp => "std::numeric_limits<double>::infinity()".to_string(),
            }
        } else {
            format!("{}", v.abs())
        };
        let text = match self.dialect {
            // keep C++ arithmetic in double
            Dialect::Cpp if text.chars().all(|c| c.is_ascii_digit()) => format!("{}.0", text),
            _ => text,
        };
        if v.is_sign_negative() && v != 0.0 {
            format!("-{}", text)
        } else {
            text
        }
    }

    fn symbol<'a>(&self, name: &'a str) -> &'a str {
        match (self.dialect, name) {
            (Dialect::Nmodl, "pi") => "PI",
            (Dialect::Cpp, "pi") => "M_PI",
            (Dialect::Cpp, "e") => "M_E",
            (_, other) => other,
        }
    }

    fn function<'a>(&self, name: &'a str) -> &'a str {
        match (self.dialect, name) {
            (Dialect::Nmodl, "abs") => "fabs",
            (Dialect::Cpp, "abs") => "std::fabs",
            (Dialect::Cpp, "exp") => "std::exp",
            (Dialect::Cpp, "log") => "std::log",
            (Dialect::Cpp, "pow") => "std::pow",
            (Dialect::Cpp, "sqrt") => "std::sqrt",
            (Dialect::Cpp, "min") => "std::min",
            (Dialect::Cpp, "max") => "std::max",
            (_, other) => other,
        }
    }
}

fn precedence(e: &Expr) -> u8 {
    match e {
        Expr::Num(v) if v.is_sign_negative() && *v != 0.0 => UNARY,
        Expr::Unary(..) => UNARY,
        Expr::Binary(op, ..) => op.precedence(),
        _ => ATOM,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn e(s: &str) -> Expr {
        Expr::parse(s).unwrap()
    }

    #[test]
    fn nmodl_syntax() {
        let p = ExprPrinter::nmodl();
        assert_eq!(p.print(&e("g * n^4 * (v - ek)")).unwrap(), "g * n^4 * (v - ek)");
        assert_eq!(p.print(&e("abs(x) > 1 && !(y < 2)")).unwrap(), "fabs(x) > 1 && !(y < 2)");
        assert_eq!(p.print(&e("2 * pi")).unwrap(), "2 * PI");
        assert_eq!(
            p.print(&e("t + random.exponential(1 / rate)")).unwrap(),
            "t + nineml_gsl_exponential(1 / rate)"
        );
    }

    #[test]
    fn nmodl_piecewise_only_at_top_level() {
        let p = ExprPrinter::nmodl();
        let lines = p.assignment("x", &e("{ a if v > 0; b otherwise }")).unwrap();
        assert_eq!(lines, vec!["if (v > 0) {", "    x = a", "} else {", "    x = b", "}"]);
        let err = p.print(&e("1 + { a if v > 0; b otherwise }")).unwrap_err();
        assert!(matches!(err, PipelineError::Render { .. }));
    }

    #[test]
    fn cpp_syntax() {
        let p = ExprPrinter::cpp();
        assert_eq!(p.print(&e("x^2 / 2")).unwrap(), "std::pow(x, 2.0) / 2.0");
        assert_eq!(p.print(&e("exp(-x)")).unwrap(), "std::exp(-x)");
        assert_eq!(
            p.print(&e("{ a if v > 0; b otherwise }")).unwrap(),
            "((v > 0.0) ? (a) : (b))"
        );
        assert_eq!(p.assignment("y", &e("1.5")).unwrap(), vec!["y = 1.5;"]);
        assert_eq!(
            p.print(&e("random.uniform(0, 1)")).unwrap(),
            "nineml_uniform(rng, 0.0, 1.0)"
        );
    }
}
