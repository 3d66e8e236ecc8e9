//! Parser for task-body source code
//!
//! This module implements a recursive descent parser that transforms a token
//! stream from the lexer into a [`TaskBody`] AST. Three entry forms are
//! accepted and normalized: `function` declarations, arrow bodies, and bare
//! statement lists.

pub mod error;
pub mod expr;
pub mod precedence;
pub mod recovery;
pub mod stmt;

use crate::ast::*;
use crate::lexer::Lexer;
use crate::token::{Span, Token};

pub use error::{ParseError, ParseErrorKind};

/// Parser state for the task-body language.
///
/// Recursive descent with one-token lookahead; errors are accumulated so a
/// single parse can report more than one problem.
pub struct Parser {
    /// Pre-tokenized input
    tokens: Vec<(Token, Span)>,

    /// Current position in token stream
    pos: usize,

    /// Accumulated parse errors (allows continuing after errors)
    errors: Vec<ParseError>,
}

impl Parser {
    /// Create a new parser from source code.
    pub fn new(source: &str) -> Result<Self, Vec<ParseError>> {
        let lexer = Lexer::new(source);
        let mut tokens = match lexer.tokenize() {
            Ok(tokens) => tokens,
            Err(lex_errors) => {
                return Err(lex_errors
                    .into_iter()
                    .map(|e| ParseError::lex(e.slice, e.span))
                    .collect());
            }
        };

        // Terminate the stream with an explicit EOF token
        let eof_span = if let Some((_, last_span)) = tokens.last() {
            Span::new(last_span.end, last_span.end, last_span.line, last_span.column)
        } else {
            Span::new(0, 0, 1, 1)
        };
        tokens.push((Token::Eof, eof_span));

        Ok(Self {
            tokens,
            pos: 0,
            errors: Vec::new(),
        })
    }

    /// Parse the source as a task body.
    ///
    /// Returns the body on success, or all accumulated errors on failure.
    pub fn parse_task_body(mut self) -> Result<TaskBody, Vec<ParseError>> {
        let start_span = self.current_span();

        let (params, body) = match self.entry_form() {
            EntryForm::Function => self.parse_function_entry(),
            EntryForm::Arrow => self.parse_arrow_entry(),
            EntryForm::Bare => (Vec::new(), self.parse_statements_until_eof()),
        };

        // Anything left over after a function/arrow body is an error
        while matches!(self.current(), Token::Semicolon) {
            self.advance();
        }
        if !self.at_eof() {
            let span = self.current_span();
            let found = self.current().clone();
            self.errors
                .push(ParseError::unexpected_token(vec![Token::Eof], found, span));
        }

        if !self.errors.is_empty() {
            return Err(self.errors);
        }

        let span = if let Some(last) = body.last() {
            start_span.merge(last.span())
        } else {
            start_span
        };

        Ok(TaskBody { params, body, span })
    }

    /// Decide which entry form the token stream starts with.
    fn entry_form(&self) -> EntryForm {
        match self.current() {
            Token::Function => EntryForm::Function,
            Token::Identifier(_) if matches!(self.peek(), Some(Token::FatArrow)) => {
                EntryForm::Arrow
            }
            Token::LeftParen if self.paren_group_is_arrow_head() => EntryForm::Arrow,
            _ => EntryForm::Bare,
        }
    }

    /// Lookahead: does the parenthesized group starting at the current token
    /// close and continue with `=>`?
    fn paren_group_is_arrow_head(&self) -> bool {
        debug_assert!(matches!(self.current(), Token::LeftParen));
        let mut depth = 0usize;
        let mut i = self.pos;
        while i < self.tokens.len() {
            match &self.tokens[i].0 {
                Token::LeftParen => depth += 1,
                Token::RightParen => {
                    depth -= 1;
                    if depth == 0 {
                        return matches!(
                            self.tokens.get(i + 1).map(|(t, _)| t),
                            Some(Token::FatArrow)
                        );
                    }
                }
                Token::Eof => return false,
                _ => {}
            }
            i += 1;
        }
        false
    }

    /// Parse `function name?(params) { ... }`.
    fn parse_function_entry(&mut self) -> (Vec<Ident>, Vec<Statement>) {
        let result = (|| -> Result<(Vec<Ident>, Vec<Statement>), ParseError> {
            self.expect(Token::Function)?;
            // Function expressions may be anonymous
            if matches!(self.current(), Token::Identifier(_)) {
                self.advance();
            }
            let params = self.parse_param_list()?;
            let block = stmt::parse_block(self)?;
            Ok((params, block.statements))
        })();

        match result {
            Ok(parsed) => parsed,
            Err(err) => {
                self.errors.push(err);
                self.skip_to_eof();
                (Vec::new(), Vec::new())
            }
        }
    }

    /// Parse `(params) => { ... }` or `param => { ... }`.
    fn parse_arrow_entry(&mut self) -> (Vec<Ident>, Vec<Statement>) {
        let result = (|| -> Result<(Vec<Ident>, Vec<Statement>), ParseError> {
            let params = if matches!(self.current(), Token::LeftParen) {
                self.parse_param_list()?
            } else {
                vec![self.expect_ident()?]
            };
            self.expect(Token::FatArrow)?;
            if !matches!(self.current(), Token::LeftBrace) {
                return Err(ParseError::invalid_syntax(
                    "arrow task bodies must use a block: (k) => { ... }",
                    self.current_span(),
                ));
            }
            let block = stmt::parse_block(self)?;
            Ok((params, block.statements))
        })();

        match result {
            Ok(parsed) => parsed,
            Err(err) => {
                self.errors.push(err);
                self.skip_to_eof();
                (Vec::new(), Vec::new())
            }
        }
    }

    /// Parse a parenthesized comma-separated identifier list.
    fn parse_param_list(&mut self) -> Result<Vec<Ident>, ParseError> {
        self.expect(Token::LeftParen)?;
        let mut params = Vec::new();
        if !matches!(self.current(), Token::RightParen) {
            loop {
                params.push(self.expect_ident()?);
                if matches!(self.current(), Token::Comma) {
                    self.advance();
                } else {
                    break;
                }
            }
        }
        self.expect(Token::RightParen)?;
        Ok(params)
    }

    /// Parse top-level statements until EOF, recovering at statement
    /// boundaries after errors.
    fn parse_statements_until_eof(&mut self) -> Vec<Statement> {
        let mut statements = Vec::new();
        while !self.at_eof() {
            match stmt::parse_statement(self) {
                Ok(statement) => statements.push(statement),
                Err(err) => {
                    self.errors.push(err);
                    recovery::sync_to_statement_boundary(self);
                }
            }
        }
        statements
    }

    fn skip_to_eof(&mut self) {
        while !self.at_eof() {
            self.advance();
        }
    }

    // ========================================================================
    // Token Management
    // ========================================================================

    /// Get the current token.
    #[inline]
    pub fn current(&self) -> &Token {
        &self.tokens[self.pos].0
    }

    /// Get the current token's span.
    #[inline]
    pub fn current_span(&self) -> Span {
        self.tokens[self.pos].1
    }

    /// Peek at the next token (lookahead).
    #[inline]
    pub fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos + 1).map(|(tok, _)| tok)
    }

    /// Advance to the next token, returning the previous current token.
    pub fn advance(&mut self) -> Token {
        let tok = self.tokens[self.pos].0.clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        tok
    }

    /// Check if the current token matches the given kind.
    #[inline]
    pub fn check(&self, expected: &Token) -> bool {
        std::mem::discriminant(self.current()) == std::mem::discriminant(expected)
    }

    /// Check if we've reached EOF.
    #[inline]
    pub fn at_eof(&self) -> bool {
        matches!(self.current(), Token::Eof)
    }

    /// Consume the current token if it matches the expected kind.
    pub fn expect(&mut self, expected: Token) -> Result<Token, ParseError> {
        if self.check(&expected) {
            Ok(self.advance())
        } else {
            Err(self.unexpected_token(&[expected]))
        }
    }

    /// Consume an identifier token, returning it as an [`Ident`].
    pub fn expect_ident(&mut self) -> Result<Ident, ParseError> {
        let span = self.current_span();
        match self.current().clone() {
            Token::Identifier(name) => {
                self.advance();
                Ok(Ident::new(name, span))
            }
            _ => Err(self.unexpected_token(&[Token::Identifier(String::new())])),
        }
    }

    /// Consume a semicolon if one is present.
    pub fn eat_semicolon(&mut self) {
        if matches!(self.current(), Token::Semicolon) {
            self.advance();
        }
    }

    // ========================================================================
    // Error Handling
    // ========================================================================

    /// Create an "unexpected token" error at the current position.
    pub fn unexpected_token(&self, expected: &[Token]) -> ParseError {
        let span = self.current_span();
        if self.at_eof() {
            ParseError::unexpected_eof(expected.to_vec(), span)
        } else {
            ParseError::unexpected_token(expected.to_vec(), self.current().clone(), span)
        }
    }
}

enum EntryForm {
    Function,
    Arrow,
    Bare,
}

/// Parse a source string into a [`TaskBody`].
///
/// This is the crate's main entry point.
pub fn parse_task_body(source: &str) -> Result<TaskBody, Vec<ParseError>> {
    Parser::new(source)?.parse_task_body()
}
