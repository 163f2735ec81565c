//! Tokenizer for dynamics expressions.
//!
//! Accepts both the 9ML spelling (`**`, `&`, `|`) and the NMODL spelling
//! (`^`, `&&`, `||`) of operators so that imported mechanism code can be
//! parsed with the same grammar.

use logos::{Logos, Span};

/// Expression token
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n\f]+")]
pub enum Token<'src> {
    /// Numeric literal (integer, decimal or scientific)
    #[regex(r"[0-9]+(\.[0-9]*)?([eE][+-]?[0-9]+)?", |lex| lex.slice())]
    #[regex(r"\.[0-9]+([eE][+-]?[0-9]+)?", |lex| lex.slice())]
    Number(&'src str),

    /// Identifier, optionally dotted (`random.uniform`)
    #[regex(r"[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)*", |lex| lex.slice())]
    Ident(&'src str),

    #[token("(")]
    ParenOpen,
    #[token(")")]
    ParenClose,
    #[token("{")]
    BraceOpen,
    #[token("}")]
    BraceClose,
    #[token(",")]
    Comma,
    #[token(";")]
    Semicolon,

    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("^")]
    #[token("**")]
    Pow,

    #[token("<")]
    Less,
    #[token("<=")]
    LessEq,
    #[token(">")]
    Greater,
    #[token(">=")]
    GreaterEq,
    #[token("==")]
    DoubleEq,
    #[token("!=")]
    NotEq,

    #[token("&&")]
    #[token("&")]
    And,
    #[token("||")]
    #[token("|")]
    Or,
    #[token("!")]
    Not,
}

/// A token with its byte span in the source
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned<T> {
    /// The token
    pub token: T,
    /// Byte range in the source
    pub span: Span,
}

impl<T> Spanned<T> {
    /// Pair a token with its span
    pub fn new(token: T, span: Span) -> Self {
        Self { token, span }
    }
}

/// Error during lexing
#[derive(Debug, Clone)]
pub struct LexError {
    /// Offending span
    pub span: Span,
    /// Offending text
    pub slice: String,
}

impl std::fmt::Display for LexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unexpected character(s) '{}' at {:?}", self.slice, self.span)
    }
}

impl std::error::Error for LexError {}

/// Tokenize an expression into spanned tokens
pub fn lex(source: &str) -> Result<Vec<Spanned<Token<'_>>>, LexError> {
    let mut lexer = Token::lexer(source);
    let mut tokens = Vec::new();

    while let Some(result) = lexer.next() {
        match result {
            Ok(token) => tokens.push(Spanned::new(token, lexer.span())),
            Err(()) => {
                return Err(LexError {
                    span: lexer.span(),
                    slice: lexer.slice().to_string(),
                });
            }
        }
    }

    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numbers() {
        let tokens = lex("42 3.14 1e10 5.67e-8 .5 1.").unwrap();
        let slices: Vec<_> = tokens.iter().map(|t| t.token.clone()).collect();
        assert_eq!(
            slices,
            vec![
                Token::Number("42"),
                Token::Number("3.14"),
                Token::Number("1e10"),
                Token::Number("5.67e-8"),
                Token::Number(".5"),
                Token::Number("1."),
            ]
        );
    }

    #[test]
    fn test_operator_spellings() {
        let a = lex("a ** 2 & b | !c").unwrap();
        let b = lex("a ^ 2 && b || !c").unwrap();
        let a: Vec<_> = a.into_iter().map(|t| t.token).collect();
        let b: Vec<_> = b.into_iter().map(|t| t.token).collect();
        assert_eq!(a, b);
    }

    #[test]
    fn test_dotted_identifier() {
        let tokens = lex("random.uniform(0, 1)").unwrap();
        assert_eq!(tokens[0].token, Token::Ident("random.uniform"));
        assert_eq!(tokens[1].token, Token::ParenOpen);
    }

    #[test]
    fn test_comparison_longest_match() {
        let tokens = lex("v >= 1 <= 2 != 3 == 4").unwrap();
        assert_eq!(tokens[1].token, Token::GreaterEq);
        assert_eq!(tokens[3].token, Token::LessEq);
        assert_eq!(tokens[5].token, Token::NotEq);
        assert_eq!(tokens[7].token, Token::DoubleEq);
    }

    #[test]
    fn test_bad_character() {
        let err = lex("a $ b").unwrap_err();
        assert_eq!(err.slice, "$");
    }
}
