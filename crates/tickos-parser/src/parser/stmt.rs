//! Statement parsing

use super::{expr, ParseError, Parser};
use crate::ast::*;
use crate::token::Token;

/// Parse a statement.
pub fn parse_statement(parser: &mut Parser) -> Result<Statement, ParseError> {
    match parser.current().clone() {
        Token::Let | Token::Const => parse_variable_statement(parser),
        Token::If => parse_if(parser),
        Token::While => parse_while(parser),
        Token::Do => parse_do_while(parser),
        Token::For => parse_for(parser),
        Token::Break => {
            let span = parser.current_span();
            parser.advance();
            parser.eat_semicolon();
            Ok(Statement::Break(span))
        }
        Token::Continue => {
            let span = parser.current_span();
            parser.advance();
            parser.eat_semicolon();
            Ok(Statement::Continue(span))
        }
        Token::Return => parse_return(parser),
        Token::Throw => parse_throw(parser),
        Token::Try => parse_try(parser),
        Token::Function => parse_function_decl(parser),
        Token::LeftBrace => Ok(Statement::Block(parse_block(parser)?)),
        Token::Semicolon => {
            let span = parser.current_span();
            parser.advance();
            Ok(Statement::Empty(span))
        }
        tok if tok.is_banned_keyword() => Err(expr::banned(parser, &tok)),
        _ => {
            // Expression statement
            let start_span = parser.current_span();
            let expression = expr::parse_expression(parser)?;
            let span = start_span.merge(expression.span());
            parser.eat_semicolon();
            Ok(Statement::Expression(ExpressionStatement { expression, span }))
        }
    }
}

/// Parse a braced block.
pub fn parse_block(parser: &mut Parser) -> Result<Block, ParseError> {
    let start_span = parser.current_span();
    parser.expect(Token::LeftBrace)?;

    let mut statements = Vec::new();
    while !matches!(parser.current(), Token::RightBrace) {
        if parser.at_eof() {
            return Err(parser.unexpected_token(&[Token::RightBrace]));
        }
        statements.push(parse_statement(parser)?);
    }

    let end_span = parser.current_span();
    parser.expect(Token::RightBrace)?;

    Ok(Block {
        statements,
        span: start_span.merge(&end_span),
    })
}

/// Parse `let`/`const` without the trailing semicolon (shared with for-init).
fn parse_variable_decl(parser: &mut Parser) -> Result<VariableDecl, ParseError> {
    let start_span = parser.current_span();
    let kind = match parser.advance() {
        Token::Let => VariableKind::Let,
        Token::Const => VariableKind::Const,
        _ => unreachable!("caller checked for let/const"),
    };

    let name = parser.expect_ident()?;

    let initializer = if matches!(parser.current(), Token::Equal) {
        parser.advance();
        Some(expr::parse_expression(parser)?)
    } else {
        None
    };

    if kind == VariableKind::Const && initializer.is_none() {
        return Err(ParseError::invalid_syntax(
            "const declarations require an initializer",
            start_span.merge(&name.span),
        ));
    }

    let span = match &initializer {
        Some(init) => start_span.merge(init.span()),
        None => start_span.merge(&name.span),
    };

    Ok(VariableDecl {
        kind,
        name,
        initializer,
        span,
    })
}

fn parse_variable_statement(parser: &mut Parser) -> Result<Statement, ParseError> {
    let decl = parse_variable_decl(parser)?;
    parser.eat_semicolon();
    Ok(Statement::VariableDecl(decl))
}

fn parse_if(parser: &mut Parser) -> Result<Statement, ParseError> {
    let start_span = parser.current_span();
    parser.expect(Token::If)?;
    parser.expect(Token::LeftParen)?;
    let condition = expr::parse_expression(parser)?;
    parser.expect(Token::RightParen)?;

    let consequent = Box::new(parse_statement(parser)?);

    let alternate = if matches!(parser.current(), Token::Else) {
        parser.advance();
        Some(Box::new(parse_statement(parser)?))
    } else {
        None
    };

    let end_span = alternate
        .as_deref()
        .map(|s| *s.span())
        .unwrap_or(*consequent.span());

    Ok(Statement::If(IfStatement {
        condition,
        consequent,
        alternate,
        span: start_span.merge(&end_span),
    }))
}

fn parse_while(parser: &mut Parser) -> Result<Statement, ParseError> {
    let start_span = parser.current_span();
    parser.expect(Token::While)?;
    parser.expect(Token::LeftParen)?;
    let condition = expr::parse_expression(parser)?;
    parser.expect(Token::RightParen)?;
    let body = Box::new(parse_statement(parser)?);
    let span = start_span.merge(body.span());

    Ok(Statement::While(WhileStatement {
        condition,
        body,
        span,
    }))
}

fn parse_do_while(parser: &mut Parser) -> Result<Statement, ParseError> {
    let start_span = parser.current_span();
    parser.expect(Token::Do)?;
    let body = Box::new(parse_statement(parser)?);
    parser.expect(Token::While)?;
    parser.expect(Token::LeftParen)?;
    let condition = expr::parse_expression(parser)?;
    let end_span = parser.current_span();
    parser.expect(Token::RightParen)?;
    parser.eat_semicolon();

    Ok(Statement::DoWhile(DoWhileStatement {
        body,
        condition,
        span: start_span.merge(&end_span),
    }))
}

fn parse_for(parser: &mut Parser) -> Result<Statement, ParseError> {
    let start_span = parser.current_span();
    parser.expect(Token::For)?;
    parser.expect(Token::LeftParen)?;

    let init = match parser.current() {
        Token::Semicolon => None,
        Token::Let | Token::Const => Some(ForInit::Decl(parse_variable_decl(parser)?)),
        _ => Some(ForInit::Expr(expr::parse_expression(parser)?)),
    };
    if matches!(parser.current(), Token::Identifier(name) if name == "of" || name == "in") {
        return Err(ParseError::invalid_syntax(
            "for-of/for-in loops are not supported; use an index loop",
            parser.current_span(),
        ));
    }
    parser.expect(Token::Semicolon)?;

    let condition = if matches!(parser.current(), Token::Semicolon) {
        None
    } else {
        Some(expr::parse_expression(parser)?)
    };
    parser.expect(Token::Semicolon)?;

    let update = if matches!(parser.current(), Token::RightParen) {
        None
    } else {
        Some(expr::parse_expression(parser)?)
    };
    parser.expect(Token::RightParen)?;

    let body = Box::new(parse_statement(parser)?);
    let span = start_span.merge(body.span());

    Ok(Statement::For(ForStatement {
        init,
        condition,
        update,
        body,
        span,
    }))
}

fn parse_return(parser: &mut Parser) -> Result<Statement, ParseError> {
    let start_span = parser.current_span();
    parser.expect(Token::Return)?;

    let value = match parser.current() {
        Token::Semicolon | Token::RightBrace | Token::Eof => None,
        _ => Some(expr::parse_expression(parser)?),
    };

    let span = match &value {
        Some(v) => start_span.merge(v.span()),
        None => start_span,
    };
    parser.eat_semicolon();

    Ok(Statement::Return(ReturnStatement { value, span }))
}

fn parse_throw(parser: &mut Parser) -> Result<Statement, ParseError> {
    let start_span = parser.current_span();
    parser.expect(Token::Throw)?;
    let value = expr::parse_expression(parser)?;
    let span = start_span.merge(value.span());
    parser.eat_semicolon();

    Ok(Statement::Throw(ThrowStatement { value, span }))
}

fn parse_try(parser: &mut Parser) -> Result<Statement, ParseError> {
    let start_span = parser.current_span();
    parser.expect(Token::Try)?;
    let block = parse_block(parser)?;

    parser.expect(Token::Catch)?;
    let catch_param = if matches!(parser.current(), Token::LeftParen) {
        parser.advance();
        let param = parser.expect_ident()?;
        parser.expect(Token::RightParen)?;
        Some(param)
    } else {
        None
    };
    let catch_block = parse_block(parser)?;

    if matches!(parser.current(), Token::Finally) {
        let tok = parser.current().clone();
        return Err(expr::banned(parser, &tok));
    }

    let span = start_span.merge(&catch_block.span);

    Ok(Statement::Try(TryStatement {
        block,
        catch_param,
        catch_block,
        span,
    }))
}

fn parse_function_decl(parser: &mut Parser) -> Result<Statement, ParseError> {
    let start_span = parser.current_span();
    parser.expect(Token::Function)?;
    let name = parser.expect_ident()?;

    parser.expect(Token::LeftParen)?;
    let mut params = Vec::new();
    if !matches!(parser.current(), Token::RightParen) {
        loop {
            params.push(parser.expect_ident()?);
            if matches!(parser.current(), Token::Comma) {
                parser.advance();
            } else {
                break;
            }
        }
    }
    parser.expect(Token::RightParen)?;

    let body = parse_block(parser)?;
    let span = start_span.merge(&body.span);

    Ok(Statement::FunctionDecl(FunctionDecl {
        name,
        params,
        body,
        span,
    }))
}

#[cfg(test)]
mod tests {
    use super::super::ParseErrorKind;
    use super::*;

    fn parse_one(source: &str) -> Statement {
        let mut parser = Parser::new(source).unwrap();
        parse_statement(&mut parser).unwrap()
    }

    fn parse_err(source: &str) -> ParseError {
        let mut parser = Parser::new(source).unwrap();
        parse_statement(&mut parser).unwrap_err()
    }

    #[test]
    fn test_let_declaration() {
        match parse_one("let x = 42;") {
            Statement::VariableDecl(decl) => {
                assert_eq!(decl.kind, VariableKind::Let);
                assert_eq!(decl.name.name, "x");
                assert!(decl.initializer.is_some());
            }
            other => panic!("expected variable decl, got {:?}", other),
        }
    }

    #[test]
    fn test_const_requires_initializer() {
        let err = parse_err("const x;");
        assert!(matches!(err.kind, ParseErrorKind::InvalidSyntax { .. }));
    }

    #[test]
    fn test_if_else() {
        match parse_one("if (a < b) { a = b; } else { b = a; }") {
            Statement::If(stmt) => {
                assert!(stmt.alternate.is_some());
            }
            other => panic!("expected if, got {:?}", other),
        }
    }

    #[test]
    fn test_while_with_single_statement_body() {
        match parse_one("while (true) x = x + 1;") {
            Statement::While(stmt) => {
                assert!(matches!(*stmt.body, Statement::Expression(_)));
            }
            other => panic!("expected while, got {:?}", other),
        }
    }

    #[test]
    fn test_do_while() {
        assert!(matches!(
            parse_one("do { i++; } while (i < 3);"),
            Statement::DoWhile(_)
        ));
    }

    #[test]
    fn test_classic_for() {
        match parse_one("for (let i = 0; i < 10; i++) { print(i); }") {
            Statement::For(stmt) => {
                assert!(matches!(stmt.init, Some(ForInit::Decl(_))));
                assert!(stmt.condition.is_some());
                assert!(stmt.update.is_some());
            }
            other => panic!("expected for, got {:?}", other),
        }
    }

    #[test]
    fn test_for_with_empty_clauses() {
        match parse_one("for (;;) { break; }") {
            Statement::For(stmt) => {
                assert!(stmt.init.is_none());
                assert!(stmt.condition.is_none());
                assert!(stmt.update.is_none());
            }
            other => panic!("expected for, got {:?}", other),
        }
    }

    #[test]
    fn test_return_without_value() {
        match parse_one("return;") {
            Statement::Return(stmt) => assert!(stmt.value.is_none()),
            other => panic!("expected return, got {:?}", other),
        }
    }

    #[test]
    fn test_try_catch() {
        match parse_one("try { risky(); } catch (e) { print(e); }") {
            Statement::Try(stmt) => {
                assert_eq!(stmt.catch_param.as_ref().unwrap().name, "e");
            }
            other => panic!("expected try, got {:?}", other),
        }
    }

    #[test]
    fn test_try_catch_without_binding() {
        match parse_one("try { risky(); } catch { recover(); }") {
            Statement::Try(stmt) => assert!(stmt.catch_param.is_none()),
            other => panic!("expected try, got {:?}", other),
        }
    }

    #[test]
    fn test_finally_is_banned() {
        let err = parse_err("try { a(); } catch { } finally { }");
        assert!(matches!(err.kind, ParseErrorKind::BannedFeature { .. }));
    }

    #[test]
    fn test_switch_is_banned() {
        let err = parse_err("switch (x) { }");
        assert!(matches!(err.kind, ParseErrorKind::BannedFeature { .. }));
    }

    #[test]
    fn test_for_of_rejected() {
        let err = parse_err("for (let x of items) { }");
        assert!(matches!(err.kind, ParseErrorKind::InvalidSyntax { .. }));
    }

    #[test]
    fn test_nested_function_decl() {
        match parse_one("function helper(n) { return n * 2; }") {
            Statement::FunctionDecl(decl) => {
                assert_eq!(decl.name.name, "helper");
                assert_eq!(decl.params.len(), 1);
            }
            other => panic!("expected function decl, got {:?}", other),
        }
    }
}
