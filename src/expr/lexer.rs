//! Lexer for `{{ ... }}` expressions using logos

use logos::Logos;

use crate::error::{ParseError, Span};

#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\n\r]+")]
pub enum Token {
    // Keyword literals; the capitalised spellings are accepted as aliases
    #[token("true")]
    #[token("True")]
    True,
    #[token("false")]
    #[token("False")]
    False,
    #[token("null")]
    #[token("None")]
    Null,

    // Boolean operators
    #[token("and")]
    And,
    #[token("or")]
    Or,
    #[token("not")]
    Not,

    // Arithmetic
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("%")]
    Percent,

    // Comparison operators (longer first)
    #[token("==")]
    EqEq,
    #[token("!=")]
    NotEq,
    #[token("<=")]
    LessOrEqual,
    #[token(">=")]
    GreaterOrEqual,
    #[token("<")]
    Less,
    #[token(">")]
    Greater,
    #[token("=")]
    Assign,

    // Delimiters
    #[token("|")]
    Pipe,
    #[token(".")]
    Dot,
    #[token(",")]
    Comma,
    #[token("(")]
    ParenOpen,
    #[token(")")]
    ParenClose,
    #[token("[")]
    BracketOpen,
    #[token("]")]
    BracketClose,

    // Literals - identifiers must come after keywords
    #[regex(r"[a-zA-Z_][a-zA-Z0-9_]*", |lex| lex.slice().to_string(), priority = 1)]
    Ident(String),

    #[regex(r#""([^"\\]|\\.)*""#, |lex| unescape(lex.slice()))]
    #[regex(r#"'([^'\\]|\\.)*'"#, |lex| unescape(lex.slice()))]
    String(String),

    #[regex(r"[0-9]+\.[0-9]+", |lex| lex.slice().parse::<f64>().ok())]
    Float(f64),

    #[regex(r"[0-9]+", |lex| lex.slice().parse::<i64>().ok())]
    Int(i64),
}

/// Strip the quotes of a string literal and resolve its escapes
fn unescape(quoted: &str) -> String {
    let inner = &quoted[1..quoted.len() - 1];
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('0') => out.push('\0'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

/// Lex an expression into tokens with spans
pub fn lex(input: &str) -> Result<Vec<(Token, Span)>, ParseError> {
    lex_at(input, 0)
}

/// Lex an expression embedded at `offset` in a larger source text
///
/// Returned spans are absolute positions in that larger text.
pub fn lex_at(input: &str, offset: usize) -> Result<Vec<(Token, Span)>, ParseError> {
    let mut lexer = Token::lexer(input).spanned();
    let mut tokens = Vec::new();
    while let Some((tok, span)) = lexer.next() {
        let span = span.start + offset..span.end + offset;
        match tok {
            Ok(tok) => tokens.push((tok, span)),
            Err(()) => {
                let text = &input[span.start - offset..span.end - offset];
                return Err(ParseError::syntax(
                    span,
                    format!("Unexpected character sequence '{}'", text),
                ));
            }
        }
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(input: &str) -> Vec<Token> {
        lex(input).expect("lexes").into_iter().map(|(t, _)| t).collect()
    }

    #[test]
    fn test_keywords_and_aliases() {
        assert_eq!(
            kinds("true True false False null None"),
            vec![
                Token::True,
                Token::True,
                Token::False,
                Token::False,
                Token::Null,
                Token::Null
            ]
        );
    }

    #[test]
    fn test_keyword_prefix_is_identifier() {
        assert_eq!(
            kinds("android notify"),
            vec![
                Token::Ident("android".to_string()),
                Token::Ident("notify".to_string())
            ]
        );
    }

    #[test]
    fn test_numbers() {
        assert_eq!(
            kinds("42 3.14 -10"),
            vec![
                Token::Int(42),
                Token::Float(3.14),
                Token::Minus,
                Token::Int(10)
            ]
        );
    }

    #[test]
    fn test_strings_both_quotes() {
        assert_eq!(
            kinds(r#""a \"b\"" 'it\'s' 'tab\there'"#),
            vec![
                Token::String("a \"b\"".to_string()),
                Token::String("it's".to_string()),
                Token::String("tab\there".to_string()),
            ]
        );
    }

    #[test]
    fn test_comparison_operators() {
        assert_eq!(
            kinds("== != <= >= < > ="),
            vec![
                Token::EqEq,
                Token::NotEq,
                Token::LessOrEqual,
                Token::GreaterOrEqual,
                Token::Less,
                Token::Greater,
                Token::Assign
            ]
        );
    }

    #[test]
    fn test_attribute_and_filter() {
        assert_eq!(
            kinds("params.name | upper"),
            vec![
                Token::Ident("params".to_string()),
                Token::Dot,
                Token::Ident("name".to_string()),
                Token::Pipe,
                Token::Ident("upper".to_string()),
            ]
        );
    }

    #[test]
    fn test_spans_are_offset() {
        let tokens = lex_at("x + 1", 10).unwrap();
        assert_eq!(tokens[0].1, 10..11);
        assert_eq!(tokens[2].1, 14..15);
    }

    #[test]
    fn test_unknown_character_is_error() {
        let err = lex("a $ b").unwrap_err();
        assert_eq!(err.span(), &(2..3));
    }

    #[test]
    fn test_integer_overflow_is_error() {
        assert!(lex("99999999999999999999").is_err());
    }
}
