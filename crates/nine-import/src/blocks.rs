//! Top-level block structure of a mechanism file.

use std::fmt;

use log::trace;

use crate::{ImportError, Result};

/// Keyword of a top-level block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockKind {
    /// `UNITS { (mV) = (millivolt) }`
    Units,
    /// `NEURON { SUFFIX ... }`
    Neuron,
    /// `PARAMETER { gbar = 0.1 (S/cm2) }`
    Parameter,
    /// `CONSTANT { ... }`
    Constant,
    /// `ASSIGNED { ... }`
    Assigned,
    /// `STATE { ... }`
    State,
    /// `INITIAL { ... }`
    Initial,
    /// `DERIVATIVE name { ... }`
    Derivative,
    /// `BREAKPOINT { ... }`
    Breakpoint,
    /// `KINETIC name { ... }`
    Kinetic,
    /// `LINEAR name { ... }`
    Linear,
    /// `NET_RECEIVE(w) { ... }`
    NetReceive,
    /// `PROCEDURE name(args) { ... }`
    Procedure,
    /// `FUNCTION name(args) { ... }`
    Function,
    /// `INDEPENDENT { t FROM 0 TO 1 WITH 1 (ms) }`
    Independent,
}

impl BlockKind {
    /// Kind of a block keyword
    pub fn from_keyword(keyword: &str) -> Option<Self> {
        Some(match keyword {
            "UNITS" => Self::Units,
            "NEURON" => Self::Neuron,
            "PARAMETER" => Self::Parameter,
            "CONSTANT" => Self::Constant,
            "ASSIGNED" => Self::Assigned,
            "STATE" => Self::State,
            "INITIAL" => Self::Initial,
            "DERIVATIVE" => Self::Derivative,
            "BREAKPOINT" => Self::Breakpoint,
            "KINETIC" => Self::Kinetic,
            "LINEAR" => Self::Linear,
            "NET_RECEIVE" => Self::NetReceive,
            "PROCEDURE" => Self::Procedure,
            "FUNCTION" => Self::Function,
            "INDEPENDENT" => Self::Independent,
            _ => return None,
        })
    }

    /// Keyword as written in source
    pub fn keyword(&self) -> &'static str {
        match self {
            Self::Units => "UNITS",
            Self::Neuron => "NEURON",
            Self::Parameter => "PARAMETER",
            Self::Constant => "CONSTANT",
            Self::Assigned => "ASSIGNED",
            Self::State => "STATE",
            Self::Initial => "INITIAL",
            Self::Derivative => "DERIVATIVE",
            Self::Breakpoint => "BREAKPOINT",
            Self::Kinetic => "KINETIC",
            Self::Linear => "LINEAR",
            Self::NetReceive => "NET_RECEIVE",
            Self::Procedure => "PROCEDURE",
            Self::Function => "FUNCTION",
            Self::Independent => "INDEPENDENT",
        }
    }
}

impl fmt::Display for BlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

/// One top-level block
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    /// Keyword
    pub kind: BlockKind,
    /// Text between the keyword and the opening brace (name, arguments, units)
    pub header: String,
    /// Text between the braces
    pub body: String,
}

/// A mechanism file split into blocks
#[derive(Debug, Clone, Default)]
pub struct SourceFile {
    /// Text of the TITLE line
    pub title: Option<String>,
    /// Contents of COMMENT ... ENDCOMMENT sections
    pub comments: Vec<String>,
    /// Blocks in source order
    pub blocks: Vec<Block>,
}

impl SourceFile {
    /// Blocks of one kind in source order
    pub fn blocks_of(&self, kind: BlockKind) -> impl Iterator<Item = &Block> {
        self.blocks.iter().filter(move |b| b.kind == kind)
    }

    /// First block of one kind
    pub fn block(&self, kind: BlockKind) -> Option<&Block> {
        self.blocks_of(kind).next()
    }
}

fn first_word(line: &str) -> &str {
    line.split(|c: char| !(c.is_alphanumeric() || c == '_')).next().unwrap_or("")
}

/// Remove comments, capturing TITLE and COMMENT sections
fn strip_comments(source: &str, file: &mut SourceFile) -> Result<String> {
    let mut out = String::with_capacity(source.len());
    let mut comment: Option<Vec<&str>> = None;
    for line in source.lines() {
        let trimmed = line.trim();
        if let Some(lines) = comment.as_mut() {
            if first_word(trimmed) == "ENDCOMMENT" {
                file.comments.push(lines.join("\n"));
                comment = None;
            } else {
                lines.push(line);
            }
            out.push('\n');
            continue;
        }
        match first_word(trimmed) {
            "COMMENT" => {
                comment = Some(Vec::new());
                out.push('\n');
                continue;
            }
            "TITLE" => {
                file.title = Some(trimmed["TITLE".len()..].trim().to_string());
                out.push('\n');
                continue;
            }
            "VERBATIM" => return Err(ImportError::unsupported("VERBATIM", trimmed)),
            _ => {}
        }
        // both ':' and '?' start a line comment
        let code = match line.find([':', '?']) {
            Some(pos) => &line[..pos],
            None => line,
        };
        out.push_str(code);
        out.push('\n');
    }
    if comment.is_some() {
        return Err(ImportError::syntax("COMMENT", "missing ENDCOMMENT"));
    }
    Ok(out)
}

/// Split mechanism source into its top-level blocks
pub fn split(source: &str) -> Result<SourceFile> {
    let mut file = SourceFile::default();
    let code = strip_comments(source, &mut file)?;

    let mut header = String::new();
    let mut body = String::new();
    let mut depth = 0usize;
    let mut current: Option<(BlockKind, String)> = None;

    for c in code.chars() {
        match c {
            '{' if depth == 0 => {
                let text = header.trim().to_string();
                let keyword = first_word(&text).to_string();
                let kind = BlockKind::from_keyword(&keyword)
                    .ok_or_else(|| ImportError::UnknownBlock { name: keyword.clone() })?;
                current = Some((kind, text[keyword.len()..].trim().to_string()));
                header.clear();
                depth = 1;
            }
            '{' => {
                depth += 1;
                body.push(c);
            }
            '}' if depth == 0 => return Err(ImportError::syntax("top level", "unbalanced '}'")),
            '}' => {
                depth -= 1;
                if depth == 0 {
                    if let Some((kind, header)) = current.take() {
                        trace!("block {} '{}'", kind, header);
                        file.blocks.push(Block {
                            kind,
                            header,
                            body: std::mem::take(&mut body),
                        });
                    }
                } else {
                    body.push(c);
                }
            }
            '\n' if depth == 0 => {
                // standalone directives between blocks
                if matches!(header.trim(), "UNITSON" | "UNITSOFF" | "THREADSAFE") {
                    header.clear();
                } else {
                    header.push(' ');
                }
            }
            _ if depth == 0 => header.push(c),
            _ => body.push(c),
        }
    }

    if depth > 0 {
        let name = current.map(|(k, _)| k.keyword()).unwrap_or("block");
        return Err(ImportError::syntax(name, "missing closing '}'"));
    }
    let rest = header.trim();
    if !rest.is_empty() {
        return Err(ImportError::UnknownBlock {
            name: first_word(rest).to_string(),
        });
    }
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &str = r#"
TITLE leak channel
COMMENT
A passive leak
ENDCOMMENT

UNITS {
    (mA) = (milliamp) : current
}

NEURON { SUFFIX leak NONSPECIFIC_CURRENT i RANGE g, e }

PARAMETER {
    g = 0.001 (S/cm2)
    e = -65 (mV)
}

FUNCTION f(x) {
    if (x > 0) { f = x } else { f = 0 }
}
"#;

    #[test]
    fn splits_blocks() {
        let file = split(SOURCE).unwrap();
        assert_eq!(file.title.as_deref(), Some("leak channel"));
        assert_eq!(file.comments, vec!["A passive leak".to_string()]);
        let kinds: Vec<BlockKind> = file.blocks.iter().map(|b| b.kind).collect();
        assert_eq!(
            kinds,
            vec![BlockKind::Units, BlockKind::Neuron, BlockKind::Parameter, BlockKind::Function]
        );
        let function = file.block(BlockKind::Function).unwrap();
        assert_eq!(function.header, "f(x)");
        assert!(function.body.contains("else { f = 0 }"));
        assert!(!file.block(BlockKind::Units).unwrap().body.contains("current"));
    }

    #[test]
    fn unknown_block_is_fatal() {
        let err = split("DEFINE NSTEP 5\nNEURON { SUFFIX x }").unwrap_err();
        assert!(matches!(err, ImportError::UnknownBlock { ref name } if name == "DEFINE"), "unexpected error: {}", err);
    }

    #[test]
    fn verbatim_is_unsupported() {
        let err = split("NEURON { SUFFIX x }\nVERBATIM\nstatic int x;\nENDVERBATIM\n").unwrap_err();
        assert!(matches!(err, ImportError::UnsupportedConstruct { .. }), "unexpected error: {}", err);
    }

    #[test]
    fn unbalanced_braces() {
        assert!(split("NEURON { SUFFIX x ").is_err());
        assert!(split("NEURON { SUFFIX x } }").is_err());
    }

    #[test]
    fn directives_between_blocks_are_skipped() {
        let file = split("UNITSOFF\nNEURON\n{ SUFFIX x }\nUNITSON\n").unwrap();
        assert_eq!(file.blocks.len(), 1);
        assert_eq!(file.blocks[0].header, "");
    }
}
