//! Statements of procedural blocks.

use crate::{ImportError, Result};

/// One branch of an `if` chain; `test` is `None` for the final `else`
#[derive(Debug, Clone, PartialEq)]
pub struct Branch {
    /// Condition text
    pub test: Option<String>,
    /// Statements of the branch
    pub body: Vec<Stmt>,
}

/// A statement of a procedural block
#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    /// `lhs = rhs`, including derivatives `x' = rhs`
    Assign {
        /// Assigned name, with a trailing `'` for derivatives
        lhs: String,
        /// Expression text
        rhs: String,
    },
    /// `if (...) {...} else if (...) {...} else {...}`
    If {
        /// Branches in order
        branches: Vec<Branch>,
    },
    /// Procedure call
    Call {
        /// Procedure name
        name: String,
        /// Argument texts
        args: Vec<String>,
    },
    /// `SOLVE block METHOD method` or `SOLVE block STEADYSTATE method`
    Solve {
        /// Solved block
        block: String,
        /// Integration method
        method: Option<String>,
        /// Steady-state method, when initialising
        steady_state: Option<String>,
    },
    /// Kinetic reaction text after `~`
    Reaction(String),
    /// `CONSERVE` constraint text
    Conserve(String),
    /// `COMPARTMENT` declaration text
    Compartment(String),
}

/// Split block text into trimmed lines with braces on their own terms
///
/// Every `{` ends a line and every `}` stands alone, so `if (x) { y = 1 }`
/// becomes `if (x) {`, `y = 1`, `}`.
pub fn lines(body: &str) -> Vec<String> {
    let mut text = String::with_capacity(body.len() + 16);
    for c in body.chars() {
        match c {
            '{' => text.push_str("{\n"),
            '}' => text.push_str("\n}\n"),
            '\t' | '\r' => text.push(' '),
            _ => text.push(c),
        }
    }
    let mut out: Vec<String> = Vec::new();
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if line == "{" {
            if let Some(prev) = out.last_mut() {
                prev.push_str(" {");
                continue;
            }
        }
        out.push(line.to_string());
    }
    out
}

/// Split `text` at top-level commas
pub fn split_args(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut depth = 0i32;
    let mut current = String::new();
    for c in text.chars() {
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            ',' if depth == 0 => {
                out.push(current.trim().to_string());
                current.clear();
                continue;
            }
            _ => {}
        }
        current.push(c);
    }
    if !current.trim().is_empty() {
        out.push(current.trim().to_string());
    }
    out
}

/// Position of the `)` matching the `(` at `open`
pub fn matching_paren(text: &str, open: usize) -> Option<usize> {
    let mut depth = 0i32;
    for (i, c) in text.char_indices().skip_while(|(i, _)| *i < open) {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Split `lhs = rhs` at an assignment `=` (not `==`, `<=`, `>=`, `!=`)
pub fn split_assignment(line: &str) -> Option<(&str, &str)> {
    let bytes = line.as_bytes();
    for (i, b) in bytes.iter().enumerate() {
        if *b != b'=' {
            continue;
        }
        let prev = if i > 0 { bytes[i - 1] } else { b' ' };
        let next = bytes.get(i + 1).copied().unwrap_or(b' ');
        if matches!(prev, b'<' | b'>' | b'!' | b'=') || next == b'=' {
            continue;
        }
        return Some((line[..i].trim(), line[i + 1..].trim()));
    }
    None
}

fn is_name(text: &str) -> bool {
    let mut chars = text.chars();
    matches!(chars.next(), Some(c) if c.is_alphabetic() || c == '_')
        && chars.all(|c| c.is_alphanumeric() || c == '_' || c == '.')
}

/// Parse the statements of a procedural block body
pub fn parse_block(body: &str) -> Result<Vec<Stmt>> {
    let lines = lines(body);
    let mut pos = 0;
    let stmts = parse_lines(&lines, &mut pos)?;
    if pos < lines.len() {
        return Err(ImportError::syntax(lines[pos].clone(), "unbalanced '}'"));
    }
    Ok(stmts)
}

/// Parse until a closing `}` at this level (consumed) or the end
fn parse_lines(lines: &[String], pos: &mut usize) -> Result<Vec<Stmt>> {
    let mut out = Vec::new();
    while *pos < lines.len() {
        let line = lines[*pos].as_str();
        if line == "}" {
            return Ok(out);
        }
        *pos += 1;
        let keyword = line
            .split(|c: char| !(c.is_alphanumeric() || c == '_'))
            .next()
            .unwrap_or("");
        match keyword {
            "LOCAL" | "UNITSON" | "UNITSOFF" => {}
            "TABLE" => {
                // TABLE ... DEPEND ... FROM ... TO ... WITH n may span lines
                let mut current = line;
                while !current.contains("WITH") && *pos < lines.len() {
                    current = lines[*pos].as_str();
                    *pos += 1;
                }
            }
            "VERBATIM" | "for" | "while" | "FROM" | "WATCH" | "LAG" | "SWEEP" => {
                return Err(ImportError::unsupported(keyword, line))
            }
            "SOLVE" => out.push(parse_solve(line)?),
            "CONSERVE" => out.push(Stmt::Conserve(line["CONSERVE".len()..].trim().to_string())),
            "COMPARTMENT" => out.push(Stmt::Compartment(line["COMPARTMENT".len()..].trim().to_string())),
            "if" => out.push(parse_if(line, lines, pos)?),
            "else" => return Err(ImportError::syntax(line, "'else' without 'if'")),
            _ if line.starts_with('~') => out.push(Stmt::Reaction(line[1..].trim().to_string())),
            _ => out.push(parse_simple(line)?),
        }
    }
    Ok(out)
}

fn parse_simple(line: &str) -> Result<Stmt> {
    if let Some((lhs, rhs)) = split_assignment(line) {
        let name = lhs.trim_end_matches('\'');
        let array_name = name.split('[').next().unwrap_or(name);
        if !is_name(array_name) {
            return Err(ImportError::syntax(line, "invalid assignment target"));
        }
        return Ok(Stmt::Assign {
            lhs: lhs.replace(' ', ""),
            rhs: rhs.to_string(),
        });
    }
    if let Some(open) = line.find('(') {
        let name = line[..open].trim();
        let close = matching_paren(line, open).ok_or_else(|| ImportError::syntax(line, "unbalanced '('"))?;
        if is_name(name) && line[close + 1..].trim().is_empty() {
            return Ok(Stmt::Call {
                name: name.to_string(),
                args: split_args(&line[open + 1..close]),
            });
        }
    }
    Err(ImportError::syntax(line, "unrecognised statement"))
}

fn parse_solve(line: &str) -> Result<Stmt> {
    let words: Vec<&str> = line.split_whitespace().collect();
    let block = words
        .get(1)
        .ok_or_else(|| ImportError::syntax(line, "SOLVE without a block"))?
        .to_string();
    let after = |key: &str| {
        words
            .iter()
            .position(|w| *w == key)
            .and_then(|i| words.get(i + 1))
            .map(|w| w.to_string())
    };
    Ok(Stmt::Solve {
        block,
        method: after("METHOD"),
        steady_state: after("STEADYSTATE"),
    })
}

/// Condition between the first `(` and its match
fn condition(line: &str) -> Result<String> {
    let open = line.find('(').ok_or_else(|| ImportError::syntax(line, "missing condition"))?;
    let close = matching_paren(line, open).ok_or_else(|| ImportError::syntax(line, "unbalanced '('"))?;
    Ok(line[open + 1..close].trim().to_string())
}

fn parse_if(first: &str, lines: &[String], pos: &mut usize) -> Result<Stmt> {
    if !first.ends_with('{') {
        return Err(ImportError::syntax(first, "'if' body must be braced"));
    }
    let mut branches = vec![Branch {
        test: Some(condition(first)?),
        body: parse_lines(lines, pos)?,
    }];
    expect_close(lines, pos, first)?;
    while let Some(line) = lines.get(*pos) {
        let line = line.as_str();
        if !line.starts_with("else") {
            break;
        }
        *pos += 1;
        let rest = line["else".len()..].trim();
        if rest.starts_with("if") {
            branches.push(Branch {
                test: Some(condition(rest)?),
                body: parse_lines(lines, pos)?,
            });
            expect_close(lines, pos, line)?;
        } else if rest == "{" {
            branches.push(Branch {
                test: None,
                body: parse_lines(lines, pos)?,
            });
            expect_close(lines, pos, line)?;
            break;
        } else {
            return Err(ImportError::syntax(line, "malformed 'else'"));
        }
    }
    Ok(Stmt::If { branches })
}

fn expect_close(lines: &[String], pos: &mut usize, opener: &str) -> Result<()> {
    match lines.get(*pos) {
        Some(line) if line == "}" => {
            *pos += 1;
            Ok(())
        }
        _ => Err(ImportError::syntax(opener, "missing closing '}'")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn brace_normalisation() {
        assert_eq!(lines("if (x) { y = 1 }"), vec!["if (x) {", "y = 1", "}"]);
        assert_eq!(lines("if (x)\n{\ny = 1\n}"), vec!["if (x) {", "y = 1", "}"]);
    }

    #[test]
    fn assignments_and_calls() {
        let stmts = parse_block("LOCAL a\nm' = (minf - m)/mtau\nrates(v, celsius)\nTABLE minf FROM -100 TO 100 WITH 200\n").unwrap();
        assert_eq!(
            stmts,
            vec![
                Stmt::Assign {
                    lhs: "m'".into(),
                    rhs: "(minf - m)/mtau".into()
                },
                Stmt::Call {
                    name: "rates".into(),
                    args: vec!["v".into(), "celsius".into()]
                },
            ]
        );
    }

    #[test]
    fn comparisons_are_not_assignments() {
        assert_eq!(split_assignment("a = b <= c"), Some(("a", "b <= c")));
        assert_eq!(split_assignment("a == b"), None);
        assert_eq!(split_assignment("x != 1"), None);
    }

    #[test]
    fn if_chains() {
        let stmts = parse_block("if (v > 0) {\n a = 1\n} else if (v < -10) {\n a = 2\n} else {\n a = 3\n}\nb = a").unwrap();
        assert_eq!(stmts.len(), 2);
        match &stmts[0] {
            Stmt::If { branches } => {
                assert_eq!(branches.len(), 3);
                assert_eq!(branches[0].test.as_deref(), Some("v > 0"));
                assert_eq!(branches[1].test.as_deref(), Some("v < -10"));
                assert!(branches[2].test.is_none());
            }
            other => panic!("expected if, got {:?}", other),
        }
    }

    #[test]
    fn solve_statements() {
        let stmts = parse_block("SOLVE states METHOD cnexp\nSOLVE kin STEADYSTATE sparse").unwrap();
        assert_eq!(
            stmts[0],
            Stmt::Solve {
                block: "states".into(),
                method: Some("cnexp".into()),
                steady_state: None
            }
        );
        assert!(matches!(&stmts[1], Stmt::Solve { steady_state: Some(s), .. } if s == "sparse"));
    }

    #[test]
    fn loops_are_unsupported() {
        let err = parse_block("for (i = 0; i < 3; i = i + 1) {\n a = i\n}").unwrap_err();
        assert!(matches!(err, ImportError::UnsupportedConstruct { .. }), "unexpected error: {}", err);
    }

    #[test]
    fn reactions() {
        let stmts = parse_block("~ C <-> O (a, b)\nCONSERVE C + O = 1").unwrap();
        assert_eq!(stmts[0], Stmt::Reaction("C <-> O (a, b)".into()));
        assert_eq!(stmts[1], Stmt::Conserve("C + O = 1".into()));
    }
}
