//! Recursive-descent parser for filter expressions.
//!
//! Precedence, tightest first:
//!
//! ```text
//! postfix   = primary ("." member | "." fn "(" args ")" | "[" expr "]")*
//! union     = postfix ("|" postfix)*
//! compare   = union (("=" | "!=" | "<" | ">" | "<=" | ">=") union)*
//! member    = compare (("in" | "contains") compare)*
//! and       = member ("and" member)*
//! or        = and (("or" | "xor") and)*
//! implies   = or ("implies" or)*
//! ```

use super::ExpressionError;
use super::lexer::{Lexer, Token};

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Str(String),
    Number(f64),
    Bool(bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Union,
    Eq,
    NotEq,
    Lt,
    Gt,
    Le,
    Ge,
    In,
    Contains,
    And,
    Or,
    Xor,
    Implies,
}

/// A parsed filter expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// `{}`
    Empty,
    Literal(Literal),
    /// `$this`
    This,
    /// `%name`
    Variable(String),
    /// Member navigation; a missing base navigates from the current focus.
    Member {
        base: Option<Box<Expr>>,
        name: String,
    },
    Function {
        base: Option<Box<Expr>>,
        name: String,
        args: Vec<Expr>,
    },
    Index {
        base: Box<Expr>,
        index: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
}

pub(crate) struct Parser<'a> {
    input: &'a str,
    lexer: Lexer<'a>,
    current: Token,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Result<Self, ExpressionError> {
        let mut lexer = Lexer::new(input);
        let current = lexer.next_token()?;
        Ok(Self {
            input,
            lexer,
            current,
        })
    }

    fn advance(&mut self) -> Result<Token, ExpressionError> {
        let next = self.lexer.next_token()?;
        Ok(std::mem::replace(&mut self.current, next))
    }

    fn error(&self, message: impl Into<String>) -> ExpressionError {
        ExpressionError::syntax(self.input, message)
    }

    fn expect(&mut self, token: Token, what: &str) -> Result<(), ExpressionError> {
        if self.current != token {
            return Err(self.error(format!("expected {what}, found {:?}", self.current)));
        }
        self.advance()?;
        Ok(())
    }

    fn at_keyword(&self, keyword: &str) -> bool {
        matches!(&self.current, Token::Identifier(word) if word == keyword)
    }

    fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
        Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    fn parse(&mut self) -> Result<Expr, ExpressionError> {
        self.parse_implies()
    }

    fn parse_implies(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_or()?;
        while self.at_keyword("implies") {
            self.advance()?;
            let right = self.parse_or()?;
            left = Self::binary(BinaryOp::Implies, left, right);
        }
        Ok(left)
    }

    fn parse_or(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_and()?;
        loop {
            let op = if self.at_keyword("or") {
                BinaryOp::Or
            } else if self.at_keyword("xor") {
                BinaryOp::Xor
            } else {
                break;
            };
            self.advance()?;
            let right = self.parse_and()?;
            left = Self::binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_membership()?;
        while self.at_keyword("and") {
            self.advance()?;
            let right = self.parse_membership()?;
            left = Self::binary(BinaryOp::And, left, right);
        }
        Ok(left)
    }

    fn parse_membership(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_comparison()?;
        loop {
            let op = if self.at_keyword("in") {
                BinaryOp::In
            } else if self.at_keyword("contains") {
                BinaryOp::Contains
            } else {
                break;
            };
            self.advance()?;
            let right = self.parse_comparison()?;
            left = Self::binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_union()?;
        loop {
            let op = match self.current {
                Token::Eq => BinaryOp::Eq,
                Token::NotEq => BinaryOp::NotEq,
                Token::Lt => BinaryOp::Lt,
                Token::Gt => BinaryOp::Gt,
                Token::Le => BinaryOp::Le,
                Token::Ge => BinaryOp::Ge,
                _ => break,
            };
            self.advance()?;
            let right = self.parse_union()?;
            left = Self::binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_union(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_postfix()?;
        while self.current == Token::Pipe {
            self.advance()?;
            let right = self.parse_postfix()?;
            left = Self::binary(BinaryOp::Union, left, right);
        }
        Ok(left)
    }

    fn parse_postfix(&mut self) -> Result<Expr, ExpressionError> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.current {
                Token::Dot => {
                    self.advance()?;
                    let Token::Identifier(name) = self.advance()? else {
                        return Err(self.error("expected member name after '.'"));
                    };
                    expr = self.parse_invocation(Some(expr), name)?;
                }
                Token::OpenBracket => {
                    self.advance()?;
                    let index = self.parse()?;
                    self.expect(Token::CloseBracket, "']'")?;
                    expr = Expr::Index {
                        base: Box::new(expr),
                        index: Box::new(index),
                    };
                }
                _ => return Ok(expr),
            }
        }
    }

    /// A member access, or a function call when followed by `(`.
    fn parse_invocation(
        &mut self,
        base: Option<Expr>,
        name: String,
    ) -> Result<Expr, ExpressionError> {
        let base = base.map(Box::new);
        if self.current != Token::OpenParen {
            return Ok(Expr::Member { base, name });
        }
        self.advance()?;
        let mut args = Vec::new();
        if self.current != Token::CloseParen {
            loop {
                args.push(self.parse()?);
                if self.current == Token::Comma {
                    self.advance()?;
                } else {
                    break;
                }
            }
        }
        self.expect(Token::CloseParen, "')'")?;
        Ok(Expr::Function { base, name, args })
    }

    fn parse_primary(&mut self) -> Result<Expr, ExpressionError> {
        match self.advance()? {
            Token::OpenParen => {
                let expr = self.parse()?;
                self.expect(Token::CloseParen, "')'")?;
                Ok(expr)
            }
            Token::OpenBrace => {
                self.expect(Token::CloseBrace, "'}'")?;
                Ok(Expr::Empty)
            }
            Token::Str(value) => Ok(Expr::Literal(Literal::Str(value))),
            Token::Number(value) => Ok(Expr::Literal(Literal::Number(value))),
            Token::Minus => match self.advance()? {
                Token::Number(value) => Ok(Expr::Literal(Literal::Number(-value))),
                other => Err(self.error(format!("expected number after '-', found {other:?}"))),
            },
            Token::This => Ok(Expr::This),
            Token::Variable(name) => Ok(Expr::Variable(name)),
            Token::Identifier(word) => match word.as_str() {
                "true" => Ok(Expr::Literal(Literal::Bool(true))),
                "false" => Ok(Expr::Literal(Literal::Bool(false))),
                _ => self.parse_invocation(None, word),
            },
            other => Err(self.error(format!("unexpected token {other:?}"))),
        }
    }
}

/// Parses a complete filter expression.
///
/// # Errors
///
/// Returns `ExpressionError::Syntax` for malformed input or trailing tokens.
pub fn parse_expression(input: &str) -> Result<Expr, ExpressionError> {
    let mut parser = Parser::new(input)?;
    let expr = parser.parse()?;
    if parser.current != Token::Eof {
        return Err(parser.error(format!("unexpected {:?} after expression", parser.current)));
    }
    Ok(expr)
}
