//! Expression parsing (precedence climbing)

use super::precedence::{get_precedence, is_right_associative, Precedence};
use super::{ParseError, Parser};
use crate::ast::*;
use crate::token::Token;

/// Parse a full expression (assignment level and below).
pub fn parse_expression(parser: &mut Parser) -> Result<Expression, ParseError> {
    parse_precedence(parser, Precedence::Assignment)
}

/// Precedence-climbing loop over binary, logical, ternary, and assignment
/// operators.
fn parse_precedence(parser: &mut Parser, min_prec: Precedence) -> Result<Expression, ParseError> {
    let mut left = parse_unary(parser)?;

    if matches!(parser.current(), Token::FatArrow) {
        return Err(ParseError::invalid_syntax(
            "arrow functions are only allowed as the task body itself",
            parser.current_span(),
        ));
    }

    loop {
        let tok = parser.current().clone();
        let prec = get_precedence(&tok);
        if prec == Precedence::None || prec < min_prec {
            break;
        }

        match tok {
            // Assignment (right-associative, target validated structurally)
            Token::Equal
            | Token::PlusEqual
            | Token::MinusEqual
            | Token::StarEqual
            | Token::SlashEqual
            | Token::PercentEqual => {
                let op = assign_op(&tok);
                let target = to_assign_target(&left).ok_or_else(|| {
                    ParseError::invalid_syntax(
                        "invalid assignment target (expected a variable or index slot)",
                        *left.span(),
                    )
                })?;
                if op != AssignOp::Assign && matches!(target, AssignTarget::Index(_)) {
                    return Err(ParseError::invalid_syntax(
                        "compound assignment requires a plain variable target",
                        *left.span(),
                    ));
                }
                parser.advance();
                let value = parse_precedence(parser, Precedence::Assignment)?;
                let span = left.span().merge(value.span());
                left = Expression::Assign(AssignExpression {
                    target,
                    op,
                    value: Box::new(value),
                    span,
                });
            }

            // Ternary conditional
            Token::Question => {
                parser.advance();
                let consequent = parse_precedence(parser, Precedence::Assignment)?;
                parser.expect(Token::Colon)?;
                let alternate = parse_precedence(parser, Precedence::Assignment)?;
                let span = left.span().merge(alternate.span());
                left = Expression::Conditional(ConditionalExpression {
                    condition: Box::new(left),
                    consequent: Box::new(consequent),
                    alternate: Box::new(alternate),
                    span,
                });
            }

            // Short-circuit logical
            Token::AmpAmp | Token::PipePipe => {
                let op = if matches!(tok, Token::AmpAmp) {
                    LogicalOp::And
                } else {
                    LogicalOp::Or
                };
                parser.advance();
                let right = parse_precedence(parser, one_tighter(prec))?;
                let span = left.span().merge(right.span());
                left = Expression::Logical(LogicalExpression {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                    span,
                });
            }

            // Plain binary operators
            tok => {
                let op = binary_op(&tok);
                let right_assoc = is_right_associative(&tok);
                parser.advance();
                let next_min = if right_assoc { prec } else { one_tighter(prec) };
                let right = parse_precedence(parser, next_min)?;
                let span = left.span().merge(right.span());
                left = Expression::Binary(BinaryExpression {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                    span,
                });
            }
        }
    }

    Ok(left)
}

/// The next-tighter precedence tier, used for left-associative operators.
fn one_tighter(prec: Precedence) -> Precedence {
    match prec {
        Precedence::LogicalOr => Precedence::LogicalAnd,
        Precedence::LogicalAnd => Precedence::Equality,
        Precedence::Equality => Precedence::Relational,
        Precedence::Relational => Precedence::Additive,
        Precedence::Additive => Precedence::Multiplicative,
        Precedence::Multiplicative => Precedence::Exponentiation,
        _ => Precedence::Unary,
    }
}

fn assign_op(token: &Token) -> AssignOp {
    match token {
        Token::Equal => AssignOp::Assign,
        Token::PlusEqual => AssignOp::Add,
        Token::MinusEqual => AssignOp::Sub,
        Token::StarEqual => AssignOp::Mul,
        Token::SlashEqual => AssignOp::Div,
        Token::PercentEqual => AssignOp::Rem,
        _ => unreachable!("not an assignment token"),
    }
}

fn binary_op(token: &Token) -> BinaryOp {
    match token {
        Token::Plus => BinaryOp::Add,
        Token::Minus => BinaryOp::Sub,
        Token::Star => BinaryOp::Mul,
        Token::Slash => BinaryOp::Div,
        Token::Percent => BinaryOp::Rem,
        Token::StarStar => BinaryOp::Pow,
        Token::EqualEqual => BinaryOp::Eq,
        Token::BangEqual => BinaryOp::Ne,
        Token::EqualEqualEqual => BinaryOp::StrictEq,
        Token::BangEqualEqual => BinaryOp::StrictNe,
        Token::Less => BinaryOp::Lt,
        Token::LessEqual => BinaryOp::Le,
        Token::Greater => BinaryOp::Gt,
        Token::GreaterEqual => BinaryOp::Ge,
        _ => unreachable!("not a binary operator token"),
    }
}

/// Convert an already-parsed expression into an assignment target, if it has
/// the right shape.
fn to_assign_target(expr: &Expression) -> Option<AssignTarget> {
    match expr {
        Expression::Identifier(ident) => Some(AssignTarget::Ident(ident.clone())),
        Expression::Index(index) => Some(AssignTarget::Index(index.clone())),
        _ => None,
    }
}

/// Parse prefix operators: unary minus/not and prefix increment/decrement.
fn parse_unary(parser: &mut Parser) -> Result<Expression, ParseError> {
    let start_span = parser.current_span();
    match parser.current().clone() {
        tok @ (Token::Minus | Token::Bang) => {
            let op = if matches!(tok, Token::Minus) {
                UnaryOp::Neg
            } else {
                UnaryOp::Not
            };
            parser.advance();
            let operand = parse_unary(parser)?;
            let span = start_span.merge(operand.span());
            Ok(Expression::Unary(UnaryExpression {
                op,
                operand: Box::new(operand),
                span,
            }))
        }
        tok @ (Token::PlusPlus | Token::MinusMinus) => {
            let increment = matches!(tok, Token::PlusPlus);
            parser.advance();
            let operand = parse_unary(parser)?;
            let target = match operand {
                Expression::Identifier(ident) => ident,
                other => {
                    return Err(ParseError::invalid_syntax(
                        "++/-- requires a plain variable",
                        *other.span(),
                    ));
                }
            };
            let span = start_span.merge(&target.span);
            Ok(Expression::Update(UpdateExpression {
                target,
                prefix: true,
                increment,
                span,
            }))
        }
        _ => parse_postfix(parser),
    }
}

/// Parse postfix chains: member access, indexing, calls, and postfix
/// increment/decrement.
fn parse_postfix(parser: &mut Parser) -> Result<Expression, ParseError> {
    let mut expr = parse_primary(parser)?;

    loop {
        match parser.current().clone() {
            Token::Dot => {
                parser.advance();
                let property = parser.expect_ident()?;
                let span = expr.span().merge(&property.span);
                expr = Expression::Member(MemberExpression {
                    object: Box::new(expr),
                    property,
                    span,
                });
            }
            Token::LeftBracket => {
                parser.advance();
                let index = parse_expression(parser)?;
                let end_span = parser.current_span();
                parser.expect(Token::RightBracket)?;
                let span = expr.span().merge(&end_span);
                expr = Expression::Index(IndexExpression {
                    object: Box::new(expr),
                    index: Box::new(index),
                    span,
                });
            }
            Token::LeftParen => {
                if !matches!(expr, Expression::Identifier(_) | Expression::Member(_)) {
                    return Err(ParseError::invalid_syntax(
                        "only named functions and methods can be called",
                        *expr.span(),
                    ));
                }
                parser.advance();
                let mut args = Vec::new();
                if !matches!(parser.current(), Token::RightParen) {
                    loop {
                        args.push(parse_expression(parser)?);
                        if matches!(parser.current(), Token::Comma) {
                            parser.advance();
                        } else {
                            break;
                        }
                    }
                }
                let end_span = parser.current_span();
                parser.expect(Token::RightParen)?;
                let span = expr.span().merge(&end_span);
                expr = Expression::Call(CallExpression {
                    callee: Box::new(expr),
                    args,
                    span,
                });
            }
            tok @ (Token::PlusPlus | Token::MinusMinus) => {
                let increment = matches!(tok, Token::PlusPlus);
                let op_span = parser.current_span();
                let target = match expr {
                    Expression::Identifier(ident) => ident,
                    other => {
                        return Err(ParseError::invalid_syntax(
                            "++/-- requires a plain variable",
                            *other.span(),
                        ));
                    }
                };
                parser.advance();
                let span = target.span.merge(&op_span);
                expr = Expression::Update(UpdateExpression {
                    target,
                    prefix: false,
                    increment,
                    span,
                });
            }
            _ => break,
        }
    }

    Ok(expr)
}

/// Parse a primary expression: literals, identifiers, parenthesized
/// expressions, and array literals.
fn parse_primary(parser: &mut Parser) -> Result<Expression, ParseError> {
    let span = parser.current_span();
    match parser.current().clone() {
        Token::IntLiteral(value) => {
            parser.advance();
            Ok(Expression::IntLiteral(IntLiteral { value, span }))
        }
        Token::FloatLiteral(value) => {
            parser.advance();
            Ok(Expression::FloatLiteral(FloatLiteral { value, span }))
        }
        Token::StringLiteral(value) => {
            parser.advance();
            Ok(Expression::StringLiteral(StringLiteral { value, span }))
        }
        Token::True => {
            parser.advance();
            Ok(Expression::BooleanLiteral(BooleanLiteral { value: true, span }))
        }
        Token::False => {
            parser.advance();
            Ok(Expression::BooleanLiteral(BooleanLiteral {
                value: false,
                span,
            }))
        }
        Token::Null => {
            parser.advance();
            Ok(Expression::NullLiteral(span))
        }
        Token::Identifier(name) => {
            parser.advance();
            Ok(Expression::Identifier(Ident::new(name, span)))
        }
        Token::LeftParen => {
            parser.advance();
            let expr = parse_expression(parser)?;
            parser.expect(Token::RightParen)?;
            Ok(expr)
        }
        Token::LeftBracket => {
            parser.advance();
            let mut elements = Vec::new();
            if !matches!(parser.current(), Token::RightBracket) {
                loop {
                    elements.push(parse_expression(parser)?);
                    if matches!(parser.current(), Token::Comma) {
                        parser.advance();
                    } else {
                        break;
                    }
                }
            }
            let end_span = parser.current_span();
            parser.expect(Token::RightBracket)?;
            Ok(Expression::Array(ArrayLiteral {
                elements,
                span: span.merge(&end_span),
            }))
        }
        Token::LeftBrace => Err(ParseError::invalid_syntax(
            "object literals are not supported; use arrays or separate variables",
            span,
        )),
        tok if tok.is_banned_keyword() => Err(banned(parser, &tok)),
        _ => Err(parser.unexpected_token(&[
            Token::IntLiteral(0),
            Token::Identifier(String::new()),
            Token::LeftParen,
        ])),
    }
}

/// Build the targeted diagnostic for a banned keyword in expression position.
pub(super) fn banned(parser: &Parser, tok: &Token) -> ParseError {
    let span = parser.current_span();
    match tok {
        Token::Switch => ParseError::banned_feature("switch", "use if/else chains", span),
        Token::Finally => ParseError::banned_feature(
            "finally",
            "restructure so cleanup runs in both the try and catch paths",
            span,
        ),
        Token::Class => ParseError::banned_feature("class", "bodies are plain procedures", span),
        Token::New => ParseError::banned_feature("new", "there are no constructible objects", span),
        Token::Async => {
            ParseError::banned_feature("async", "suspension is expressed with delay()", span)
        }
        Token::Await => {
            ParseError::banned_feature("await", "suspension is expressed with delay()", span)
        }
        _ => ParseError::invalid_syntax("unsupported construct", span),
    }
}
