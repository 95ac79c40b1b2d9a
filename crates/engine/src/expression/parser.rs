//! Pratt parser producing the expression AST.

use serde_json::Value;

use super::lexer::{Spanned, Token, tokenize};
use crate::error::ExpressionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UnaryOp {
    Not,
    Negate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinaryOp {
    Or,
    And,
    Eq,
    NotEq,
    Less,
    LessEq,
    Greater,
    GreaterEq,
    In,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Expr {
    Literal(Value),
    Ident(String),
    Array(Vec<Expr>),
    Member(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Ternary(Box<Expr>, Box<Expr>, Box<Expr>),
}

const TERNARY_POWER: u8 = 1;
const PREFIX_POWER: u8 = 15;
const POSTFIX_POWER: u8 = 17;

pub(crate) fn parse(source: &str) -> Result<Expr, ExpressionError> {
    let tokens = tokenize(source)?;
    if tokens.is_empty() {
        return Err(ExpressionError::syntax(0, "empty expression"));
    }
    let mut parser = Parser {
        tokens,
        cursor: 0,
        source_len: source.len(),
    };
    let expr = parser.expression(0)?;
    if let Some(extra) = parser.peek() {
        return Err(ExpressionError::syntax(extra.position, format!("unexpected token {:?}", extra.token)));
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<Spanned>,
    cursor: usize,
    source_len: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Spanned> {
        self.tokens.get(self.cursor)
    }

    fn next(&mut self) -> Result<Spanned, ExpressionError> {
        let spanned = self
            .tokens
            .get(self.cursor)
            .cloned()
            .ok_or_else(|| ExpressionError::syntax(self.source_len, "unexpected end of expression"))?;
        self.cursor += 1;
        Ok(spanned)
    }

    fn expect(&mut self, expected: Token) -> Result<(), ExpressionError> {
        let spanned = self.next()?;
        if spanned.token == expected {
            Ok(())
        } else {
            Err(ExpressionError::syntax(
                spanned.position,
                format!("expected {expected:?}, found {:?}", spanned.token),
            ))
        }
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek().is_some_and(|spanned| &spanned.token == token) {
            self.cursor += 1;
            true
        } else {
            false
        }
    }

    fn expression(&mut self, min_power: u8) -> Result<Expr, ExpressionError> {
        let mut lhs = self.prefix()?;

        loop {
            let Some(spanned) = self.peek() else { break };
            let token = spanned.token.clone();

            if matches!(token, Token::Dot | Token::LeftBracket | Token::LeftParen) {
                if POSTFIX_POWER < min_power {
                    break;
                }
                lhs = self.postfix(lhs)?;
                continue;
            }

            if token == Token::Question {
                if TERNARY_POWER < min_power {
                    break;
                }
                self.cursor += 1;
                let when_true = self.expression(0)?;
                self.expect(Token::Colon)?;
                let when_false = self.expression(TERNARY_POWER)?;
                lhs = Expr::Ternary(Box::new(lhs), Box::new(when_true), Box::new(when_false));
                continue;
            }

            let Some((op, left_power, right_power)) = infix_binding(&token) else {
                break;
            };
            if left_power < min_power {
                break;
            }
            self.cursor += 1;
            let rhs = self.expression(right_power)?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }

        Ok(lhs)
    }

    fn prefix(&mut self) -> Result<Expr, ExpressionError> {
        let spanned = self.next()?;
        let expr = match spanned.token {
            Token::Integer(value) => Expr::Literal(Value::from(value)),
            Token::Float(value) => Expr::Literal(Value::from(value)),
            Token::Str(value) => Expr::Literal(Value::String(value)),
            Token::True => Expr::Literal(Value::Bool(true)),
            Token::False => Expr::Literal(Value::Bool(false)),
            Token::Null => Expr::Literal(Value::Null),
            Token::Ident(name) => Expr::Ident(name),
            Token::Bang => Expr::Unary(UnaryOp::Not, Box::new(self.expression(PREFIX_POWER)?)),
            Token::Minus => Expr::Unary(UnaryOp::Negate, Box::new(self.expression(PREFIX_POWER)?)),
            Token::LeftParen => {
                let inner = self.expression(0)?;
                self.expect(Token::RightParen)?;
                inner
            }
            Token::LeftBracket => Expr::Array(self.list(Token::RightBracket)?),
            other => {
                return Err(ExpressionError::syntax(spanned.position, format!("unexpected token {other:?}")));
            }
        };
        Ok(expr)
    }

    fn postfix(&mut self, lhs: Expr) -> Result<Expr, ExpressionError> {
        let spanned = self.next()?;
        match spanned.token {
            Token::Dot => {
                let name = self.next()?;
                match name.token {
                    Token::Ident(field) => Ok(Expr::Member(Box::new(lhs), field)),
                    // keywords are valid field names after a dot
                    Token::In => Ok(Expr::Member(Box::new(lhs), "in".into())),
                    Token::True => Ok(Expr::Member(Box::new(lhs), "true".into())),
                    Token::False => Ok(Expr::Member(Box::new(lhs), "false".into())),
                    Token::Null => Ok(Expr::Member(Box::new(lhs), "null".into())),
                    other => Err(ExpressionError::syntax(
                        name.position,
                        format!("expected field name after '.', found {other:?}"),
                    )),
                }
            }
            Token::LeftBracket => {
                let index = self.expression(0)?;
                self.expect(Token::RightBracket)?;
                Ok(Expr::Index(Box::new(lhs), Box::new(index)))
            }
            Token::LeftParen => {
                let Expr::Ident(function) = lhs else {
                    return Err(ExpressionError::syntax(spanned.position, "only named functions can be called"));
                };
                Ok(Expr::Call(function, self.list(Token::RightParen)?))
            }
            other => Err(ExpressionError::syntax(spanned.position, format!("unexpected token {other:?}"))),
        }
    }

    fn list(&mut self, closing: Token) -> Result<Vec<Expr>, ExpressionError> {
        let mut items = Vec::new();
        if self.eat(&closing) {
            return Ok(items);
        }
        loop {
            items.push(self.expression(0)?);
            if self.eat(&Token::Comma) {
                // trailing comma
                if self.eat(&closing) {
                    return Ok(items);
                }
                continue;
            }
            self.expect(closing)?;
            return Ok(items);
        }
    }
}

fn infix_binding(token: &Token) -> Option<(BinaryOp, u8, u8)> {
    let binding = match token {
        Token::OrOr => (BinaryOp::Or, 3, 4),
        Token::AndAnd => (BinaryOp::And, 5, 6),
        Token::EqEq => (BinaryOp::Eq, 7, 8),
        Token::NotEq => (BinaryOp::NotEq, 7, 8),
        Token::Less => (BinaryOp::Less, 9, 10),
        Token::LessEq => (BinaryOp::LessEq, 9, 10),
        Token::Greater => (BinaryOp::Greater, 9, 10),
        Token::GreaterEq => (BinaryOp::GreaterEq, 9, 10),
        Token::In => (BinaryOp::In, 9, 10),
        Token::Plus => (BinaryOp::Add, 11, 12),
        Token::Minus => (BinaryOp::Sub, 11, 12),
        Token::Star => (BinaryOp::Mul, 13, 14),
        Token::Slash => (BinaryOp::Div, 13, 14),
        Token::Percent => (BinaryOp::Rem, 13, 14),
        _ => return None,
    };
    Some(binding)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn ident(name: &str) -> Box<Expr> {
        Box::new(Expr::Ident(name.into()))
    }

    fn literal(value: Value) -> Box<Expr> {
        Box::new(Expr::Literal(value))
    }

    #[test]
    fn multiplication_binds_tighter_than_addition() {
        let expr = parse("1 + 2 * 3").expect("parse");
        assert_eq!(
            expr,
            Expr::Binary(
                BinaryOp::Add,
                literal(json!(1)),
                Box::new(Expr::Binary(BinaryOp::Mul, literal(json!(2)), literal(json!(3))))
            )
        );
    }

    #[test]
    fn member_and_index_chain_left_to_right() {
        let expr = parse("steps[1].res").expect("parse");
        assert_eq!(
            expr,
            Expr::Member(Box::new(Expr::Index(ident("steps"), literal(json!(1)))), "res".into())
        );
    }

    #[test]
    fn negation_applies_to_the_whole_path() {
        let expr = parse("!vars.done").expect("parse");
        assert_eq!(
            expr,
            Expr::Unary(UnaryOp::Not, Box::new(Expr::Member(ident("vars"), "done".into())))
        );
    }

    #[test]
    fn ternary_is_right_associative() {
        let expr = parse("a ? 1 : b ? 2 : 3").expect("parse");
        let Expr::Ternary(_, _, otherwise) = expr else {
            panic!("expected ternary");
        };
        assert!(matches!(*otherwise, Expr::Ternary(..)));
    }

    #[test]
    fn calls_and_arrays_parse_argument_lists() {
        let expr = parse("len([1, 2,])").expect("parse");
        assert_eq!(
            expr,
            Expr::Call("len".into(), vec![Expr::Array(vec![Expr::Literal(json!(1)), Expr::Literal(json!(2))])])
        );
    }

    #[test]
    fn reports_trailing_garbage_and_truncation() {
        assert!(matches!(parse("a b"), Err(ExpressionError::Syntax { position: 2, .. })));
        assert!(matches!(parse("vars."), Err(ExpressionError::Syntax { .. })));
        assert!(matches!(parse(""), Err(ExpressionError::Syntax { position: 0, .. })));
        assert!(matches!(parse("vars.x()"), Err(ExpressionError::Syntax { .. })));
    }
}
