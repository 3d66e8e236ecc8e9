//! Error recovery: resynchronize the token stream after a parse error.

use super::Parser;
use crate::token::Token;

/// Advance past the current (broken) statement so parsing can continue.
///
/// Stops after a semicolon, or just before a token that plausibly starts a
/// new statement or closes the enclosing block.
pub fn sync_to_statement_boundary(parser: &mut Parser) {
    while !parser.at_eof() {
        match parser.current() {
            Token::Semicolon => {
                parser.advance();
                return;
            }
            Token::RightBrace
            | Token::Let
            | Token::Const
            | Token::If
            | Token::While
            | Token::Do
            | Token::For
            | Token::Break
            | Token::Continue
            | Token::Return
            | Token::Throw
            | Token::Try
            | Token::Function => return,
            _ => {
                parser.advance();
            }
        }
    }
}
