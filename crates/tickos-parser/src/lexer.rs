//! Lexer for the tickos task-body language.
//!
//! This module implements the lexer using the logos library. It converts
//! source code into a stream of tokens with precise source location
//! information.

use crate::token::{Span, Token};
use logos::Logos;
use std::fmt;

/// Logos-based token enum for lexing.
///
/// This enum is used internally by logos for efficient tokenization.
/// It's converted to our main Token enum after lexing.
#[derive(Logos, Debug, Clone, PartialEq)]
enum LogosToken {
    // Whitespace (skip)
    #[regex(r"[ \t\r\n]+", logos::skip)]
    Whitespace,

    // Comments (skip)
    #[regex(r"//[^\n]*", logos::skip)]
    LineComment,

    #[regex(r"/\*[^*]*\*+(?:[^/*][^*]*\*+)*/", logos::skip)]
    BlockComment,

    // Keywords (must come before identifiers)
    #[token("let")]
    Let,

    #[token("const")]
    Const,

    #[token("if")]
    If,

    #[token("else")]
    Else,

    #[token("while")]
    While,

    #[token("do")]
    Do,

    #[token("for")]
    For,

    #[token("break")]
    Break,

    #[token("continue")]
    Continue,

    #[token("return")]
    Return,

    #[token("function")]
    Function,

    #[token("try")]
    Try,

    #[token("catch")]
    Catch,

    #[token("throw")]
    Throw,

    #[token("true")]
    True,

    #[token("false")]
    False,

    #[token("null")]
    Null,

    // Recognized-but-banned keywords; the parser rejects these with a
    // targeted diagnostic instead of a generic syntax error.
    #[token("switch")]
    Switch,

    #[token("finally")]
    Finally,

    #[token("class")]
    Class,

    #[token("new")]
    New,

    #[token("async")]
    Async,

    #[token("await")]
    Await,

    // Note: 'yield' is deliberately NOT a keyword here; it lexes as an
    // identifier so that `k.yield()` parses as an ordinary method call.

    // Identifiers (must come after keywords)
    #[regex(r"[a-zA-Z_$][a-zA-Z0-9_$]*", |lex| lex.slice().to_string())]
    Identifier(String),

    // Numbers
    #[regex(r"[0-9]+", parse_int)]
    IntLiteral(i64),

    #[regex(r"[0-9]+\.[0-9]+([eE][+-]?[0-9]+)?", parse_float)]
    #[regex(r"[0-9]+[eE][+-]?[0-9]+", parse_float)]
    FloatLiteral(f64),

    // Strings
    #[regex(r#""([^"\\]|\\.)*""#, parse_string)]
    #[regex(r"'([^'\\]|\\.)*'", parse_string)]
    StringLiteral(String),

    // Operators (longest match wins in logos, so multi-char forms are safe)
    #[token("===")]
    EqualEqualEqual,

    #[token("!==")]
    BangEqualEqual,

    #[token("==")]
    EqualEqual,

    #[token("!=")]
    BangEqual,

    #[token("<=")]
    LessEqual,

    #[token(">=")]
    GreaterEqual,

    #[token("&&")]
    AmpAmp,

    #[token("||")]
    PipePipe,

    #[token("++")]
    PlusPlus,

    #[token("--")]
    MinusMinus,

    #[token("**")]
    StarStar,

    #[token("=>")]
    FatArrow,

    #[token("+=")]
    PlusEqual,

    #[token("-=")]
    MinusEqual,

    #[token("*=")]
    StarEqual,

    #[token("/=")]
    SlashEqual,

    #[token("%=")]
    PercentEqual,

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

    #[token("!")]
    Bang,

    #[token("<")]
    Less,

    #[token(">")]
    Greater,

    #[token("=")]
    Equal,

    #[token("(")]
    LeftParen,

    #[token(")")]
    RightParen,

    #[token("{")]
    LeftBrace,

    #[token("}")]
    RightBrace,

    #[token("[")]
    LeftBracket,

    #[token("]")]
    RightBracket,

    #[token(",")]
    Comma,

    #[token(";")]
    Semicolon,

    #[token(":")]
    Colon,

    #[token("?")]
    Question,

    #[token(".")]
    Dot,
}

fn parse_int(lex: &mut logos::Lexer<'_, LogosToken>) -> Option<i64> {
    lex.slice().parse().ok()
}

fn parse_float(lex: &mut logos::Lexer<'_, LogosToken>) -> Option<f64> {
    lex.slice().parse().ok()
}

/// Unescape a quoted string literal.
fn parse_string(lex: &mut logos::Lexer<'_, LogosToken>) -> Option<String> {
    let slice = lex.slice();
    let inner = &slice[1..slice.len() - 1];

    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next()? {
            'n' => out.push('\n'),
            't' => out.push('\t'),
            'r' => out.push('\r'),
            '0' => out.push('\0'),
            '\\' => out.push('\\'),
            '\'' => out.push('\''),
            '"' => out.push('"'),
            other => out.push(other),
        }
    }
    Some(out)
}

/// A lexical error with location information.
#[derive(Debug, Clone, PartialEq)]
pub struct LexError {
    /// The offending source slice
    pub slice: String,

    /// Source location of the error
    pub span: Span,
}

impl fmt::Display for LexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Unexpected character(s) {:?} at {}:{}",
            self.slice, self.span.line, self.span.column
        )
    }
}

impl std::error::Error for LexError {}

/// Lexer for task-body source code.
pub struct Lexer<'a> {
    source: &'a str,
    /// Byte offsets at which each line starts, for line/column mapping.
    line_starts: Vec<usize>,
}

impl<'a> Lexer<'a> {
    /// Create a new lexer over the given source.
    pub fn new(source: &'a str) -> Self {
        let mut line_starts = vec![0];
        for (i, b) in source.bytes().enumerate() {
            if b == b'\n' {
                line_starts.push(i + 1);
            }
        }
        Self {
            source,
            line_starts,
        }
    }

    /// Map a byte offset to a (line, column) pair, both 1-based.
    fn location(&self, offset: usize) -> (u32, u32) {
        let line_idx = match self.line_starts.binary_search(&offset) {
            Ok(i) => i,
            Err(i) => i - 1,
        };
        let line_start = self.line_starts[line_idx];
        let column = self.source[line_start..offset].chars().count() + 1;
        (line_idx as u32 + 1, column as u32)
    }

    fn span_for(&self, range: std::ops::Range<usize>) -> Span {
        let (line, column) = self.location(range.start);
        Span::new(range.start, range.end, line, column)
    }

    /// Tokenize the entire input.
    ///
    /// Returns the token stream (without a trailing EOF) or all lexical
    /// errors encountered.
    pub fn tokenize(&self) -> Result<Vec<(Token, Span)>, Vec<LexError>> {
        let mut tokens = Vec::new();
        let mut errors = Vec::new();

        let mut lexer = LogosToken::lexer(self.source);
        while let Some(result) = lexer.next() {
            let span = self.span_for(lexer.span());
            match result {
                Ok(tok) => tokens.push((convert(tok), span)),
                Err(()) => errors.push(LexError {
                    slice: lexer.slice().to_string(),
                    span,
                }),
            }
        }

        if errors.is_empty() {
            Ok(tokens)
        } else {
            Err(errors)
        }
    }
}

/// Convert the internal logos token to the public token type.
fn convert(tok: LogosToken) -> Token {
    match tok {
        LogosToken::Whitespace | LogosToken::LineComment | LogosToken::BlockComment => {
            unreachable!("skipped by logos")
        }
        LogosToken::Let => Token::Let,
        LogosToken::Const => Token::Const,
        LogosToken::If => Token::If,
        LogosToken::Else => Token::Else,
        LogosToken::While => Token::While,
        LogosToken::Do => Token::Do,
        LogosToken::For => Token::For,
        LogosToken::Break => Token::Break,
        LogosToken::Continue => Token::Continue,
        LogosToken::Return => Token::Return,
        LogosToken::Function => Token::Function,
        LogosToken::Try => Token::Try,
        LogosToken::Catch => Token::Catch,
        LogosToken::Throw => Token::Throw,
        LogosToken::True => Token::True,
        LogosToken::False => Token::False,
        LogosToken::Null => Token::Null,
        LogosToken::Switch => Token::Switch,
        LogosToken::Finally => Token::Finally,
        LogosToken::Class => Token::Class,
        LogosToken::New => Token::New,
        LogosToken::Async => Token::Async,
        LogosToken::Await => Token::Await,
        LogosToken::Identifier(name) => Token::Identifier(name),
        LogosToken::IntLiteral(n) => Token::IntLiteral(n),
        LogosToken::FloatLiteral(n) => Token::FloatLiteral(n),
        LogosToken::StringLiteral(s) => Token::StringLiteral(s),
        LogosToken::EqualEqualEqual => Token::EqualEqualEqual,
        LogosToken::BangEqualEqual => Token::BangEqualEqual,
        LogosToken::EqualEqual => Token::EqualEqual,
        LogosToken::BangEqual => Token::BangEqual,
        LogosToken::LessEqual => Token::LessEqual,
        LogosToken::GreaterEqual => Token::GreaterEqual,
        LogosToken::AmpAmp => Token::AmpAmp,
        LogosToken::PipePipe => Token::PipePipe,
        LogosToken::PlusPlus => Token::PlusPlus,
        LogosToken::MinusMinus => Token::MinusMinus,
        LogosToken::StarStar => Token::StarStar,
        LogosToken::FatArrow => Token::FatArrow,
        LogosToken::PlusEqual => Token::PlusEqual,
        LogosToken::MinusEqual => Token::MinusEqual,
        LogosToken::StarEqual => Token::StarEqual,
        LogosToken::SlashEqual => Token::SlashEqual,
        LogosToken::PercentEqual => Token::PercentEqual,
        LogosToken::Plus => Token::Plus,
        LogosToken::Minus => Token::Minus,
        LogosToken::Star => Token::Star,
        LogosToken::Slash => Token::Slash,
        LogosToken::Percent => Token::Percent,
        LogosToken::Bang => Token::Bang,
        LogosToken::Less => Token::Less,
        LogosToken::Greater => Token::Greater,
        LogosToken::Equal => Token::Equal,
        LogosToken::LeftParen => Token::LeftParen,
        LogosToken::RightParen => Token::RightParen,
        LogosToken::LeftBrace => Token::LeftBrace,
        LogosToken::RightBrace => Token::RightBrace,
        LogosToken::LeftBracket => Token::LeftBracket,
        LogosToken::RightBracket => Token::RightBracket,
        LogosToken::Comma => Token::Comma,
        LogosToken::Semicolon => Token::Semicolon,
        LogosToken::Colon => Token::Colon,
        LogosToken::Question => Token::Question,
        LogosToken::Dot => Token::Dot,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(source: &str) -> Vec<Token> {
        Lexer::new(source)
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|(tok, _)| tok)
            .collect()
    }

    #[test]
    fn test_keywords_and_identifiers() {
        let tokens = lex("let x = delay");
        assert_eq!(
            tokens,
            vec![
                Token::Let,
                Token::Identifier("x".to_string()),
                Token::Equal,
                Token::Identifier("delay".to_string()),
            ]
        );
    }

    #[test]
    fn test_yield_is_an_identifier() {
        let tokens = lex("k.yield()");
        assert_eq!(
            tokens,
            vec![
                Token::Identifier("k".to_string()),
                Token::Dot,
                Token::Identifier("yield".to_string()),
                Token::LeftParen,
                Token::RightParen,
            ]
        );
    }

    #[test]
    fn test_numbers() {
        let tokens = lex("42 3.5 1e3");
        assert_eq!(
            tokens,
            vec![
                Token::IntLiteral(42),
                Token::FloatLiteral(3.5),
                Token::FloatLiteral(1000.0),
            ]
        );
    }

    #[test]
    fn test_string_escapes() {
        let tokens = lex(r#""a\nb" 'c\'d'"#);
        assert_eq!(
            tokens,
            vec![
                Token::StringLiteral("a\nb".to_string()),
                Token::StringLiteral("c'd".to_string()),
            ]
        );
    }

    #[test]
    fn test_multi_char_operators() {
        let tokens = lex("=== !== == != <= >= && || ++ -- ** => +=");
        assert_eq!(
            tokens,
            vec![
                Token::EqualEqualEqual,
                Token::BangEqualEqual,
                Token::EqualEqual,
                Token::BangEqual,
                Token::LessEqual,
                Token::GreaterEqual,
                Token::AmpAmp,
                Token::PipePipe,
                Token::PlusPlus,
                Token::MinusMinus,
                Token::StarStar,
                Token::FatArrow,
                Token::PlusEqual,
            ]
        );
    }

    #[test]
    fn test_comments_skipped() {
        let tokens = lex("1 // line\n/* block\n comment */ 2");
        assert_eq!(tokens, vec![Token::IntLiteral(1), Token::IntLiteral(2)]);
    }

    #[test]
    fn test_spans_track_lines() {
        let spans: Vec<Span> = Lexer::new("a\n  b")
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|(_, span)| span)
            .collect();
        assert_eq!(spans[0].line, 1);
        assert_eq!(spans[0].column, 1);
        assert_eq!(spans[1].line, 2);
        assert_eq!(spans[1].column, 3);
    }

    #[test]
    fn test_lex_error() {
        let result = Lexer::new("let @ = 1").tokenize();
        let errors = result.unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].slice, "@");
    }
}
