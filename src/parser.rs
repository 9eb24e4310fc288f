//! Recursive-descent parser for the Kestrel language.
//!
//! Statements are parsed by a hand-written descent; expressions by one
//! function per precedence level, lowest first:
//!
//! | Level | Operators | Assoc |
//! |---|---|---|
//! | assignment | `= += -= *= /= %= <<= >>= \|= &= ^=` | right |
//! | logical or | `\|\|` | left |
//! | logical and | `&&` | left |
//! | comparison | `== != < <= > >=` | left |
//! | bit or / xor / and | `\|` `^` `&` | left |
//! | shift | `<< >>` | left |
//! | additive | `+ -` | left |
//! | multiplicative | `* / %` | left |
//! | unary | `- ! ~ ++x --x` | prefix |
//! | exponent | `**` | right |
//! | postfix | calls, `.name`, `[i]`, `x++ x--` | |
//!
//! Errors are collected; after a bad statement the parser skips to the next
//! `;` or `}` and carries on.

use thiserror::Error;

use crate::arith::IncrOp;
use crate::ast::*;
use crate::token::{Span, Token, TokenKind};
use crate::value::TypeMask;

#[derive(Debug, Clone, PartialEq, Error)]
#[error("[{}:{}] {message}", span.line, span.col)]
pub struct ParseError {
    pub message: String,
    pub span: Span,
}

type PResult<T> = Result<T, ParseError>;

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    errors: Vec<ParseError>,
}

/// Parse a token stream (ending in `Eof`) into a [`Program`].
pub fn parse(tokens: Vec<Token>) -> Result<Program, Vec<ParseError>> {
    Parser::new(tokens).parse_program()
}

impl Parser {
    pub fn new(mut tokens: Vec<Token>) -> Self {
        if !tokens.last().is_some_and(Token::is_eof) {
            let span = tokens.last().map(|t| t.span).unwrap_or_default();
            tokens.push(Token::new(TokenKind::Eof, span));
        }
        Self {
            tokens,
            pos: 0,
            errors: Vec::new(),
        }
    }

    pub fn parse_program(mut self) -> Result<Program, Vec<ParseError>> {
        let start = self.span();
        let mut body = Vec::new();
        while !self.at(&TokenKind::Eof) {
            match self.statement() {
                Ok(stmt) => body.push(stmt),
                Err(err) => {
                    self.errors.push(err);
                    self.synchronize();
                }
            }
        }
        if self.errors.is_empty() {
            Ok(Program {
                body,
                span: start.merge(self.span()),
            })
        } else {
            Err(self.errors)
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Token helpers
    // ─────────────────────────────────────────────────────────────────────────

    fn peek(&self) -> &TokenKind {
        self.peek_at(0)
    }

    fn peek_at(&self, n: usize) -> &TokenKind {
        let i = (self.pos + n).min(self.tokens.len() - 1);
        &self.tokens[i].kind
    }

    fn span(&self) -> Span {
        self.tokens[self.pos.min(self.tokens.len() - 1)].span
    }

    fn previous_span(&self) -> Span {
        self.tokens[self.pos.saturating_sub(1)].span
    }

    fn at(&self, kind: &TokenKind) -> bool {
        self.peek() == kind
    }

    fn advance(&mut self) -> TokenKind {
        let kind = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        kind
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.at(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &TokenKind, context: &str) -> PResult<Span> {
        if self.at(kind) {
            let span = self.span();
            self.advance();
            Ok(span)
        } else {
            Err(self.error(format!("expected {kind} {context}, found {}", self.peek())))
        }
    }

    fn ident(&mut self, context: &str) -> PResult<String> {
        match self.peek().clone() {
            TokenKind::Ident(name) => {
                self.advance();
                Ok(name)
            }
            other => Err(self.error(format!("expected identifier {context}, found {other}"))),
        }
    }

    fn error(&self, message: String) -> ParseError {
        ParseError {
            message,
            span: self.span(),
        }
    }

    fn synchronize(&mut self) {
        loop {
            match self.peek() {
                TokenKind::Eof => return,
                TokenKind::Semicolon | TokenKind::RBrace => {
                    self.advance();
                    return;
                }
                _ => {
                    self.advance();
                }
            }
        }
    }

    /// An identifier naming a type, followed by a declared name.
    fn at_typed_declaration(&self) -> bool {
        matches!(
            (self.peek(), self.peek_at(1)),
            (TokenKind::Ident(t), TokenKind::Ident(_)) if TypeMask::from_type_name(t).is_some()
        )
    }

    /// `<int, float>` after `var`.
    fn type_list(&mut self) -> PResult<Vec<String>> {
        let mut types = Vec::new();
        if !self.eat(&TokenKind::Lt) {
            return Ok(types);
        }
        loop {
            let span = self.span();
            let name = match self.advance() {
                TokenKind::Ident(name) => name,
                TokenKind::Null => "null".into(),
                TokenKind::Struct => "struct".into(),
                TokenKind::Function => "function".into(),
                other => {
                    return Err(ParseError {
                        message: format!("expected type name, found {other}"),
                        span,
                    })
                }
            };
            if TypeMask::from_type_name(&name).is_none() {
                return Err(ParseError {
                    message: format!("unknown type `{name}`"),
                    span,
                });
            }
            types.push(name);
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(&TokenKind::Gt, "to close the type list")?;
        Ok(types)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Statements
    // ─────────────────────────────────────────────────────────────────────────

    fn statement(&mut self) -> PResult<Stmt> {
        let span = self.span();
        match self.peek() {
            TokenKind::Export => {
                self.advance();
                self.declaration(true)
            }
            TokenKind::Var | TokenKind::Const => self.declaration(false),
            TokenKind::Function if matches!(self.peek_at(1), TokenKind::Ident(_)) => {
                self.declaration(false)
            }
            TokenKind::Struct if matches!(self.peek_at(1), TokenKind::Ident(_)) => {
                self.declaration(false)
            }
            _ if self.at_typed_declaration() => self.declaration(false),
            TokenKind::Return => {
                self.advance();
                let value = if self.at(&TokenKind::Semicolon) {
                    None
                } else {
                    Some(self.expression()?)
                };
                self.expect(&TokenKind::Semicolon, "after return")?;
                Ok(Stmt::Return(value, span))
            }
            TokenKind::If => {
                self.advance();
                self.expect(&TokenKind::LParen, "after `if`")?;
                let cond = self.expression()?;
                self.expect(&TokenKind::RParen, "after condition")?;
                let then_branch = Box::new(self.statement()?);
                let else_branch = if self.eat(&TokenKind::Else) {
                    Some(Box::new(self.statement()?))
                } else {
                    None
                };
                Ok(Stmt::If {
                    cond,
                    then_branch,
                    else_branch,
                    span,
                })
            }
            TokenKind::While => {
                self.advance();
                self.expect(&TokenKind::LParen, "after `while`")?;
                let cond = self.expression()?;
                self.expect(&TokenKind::RParen, "after condition")?;
                let body = Box::new(self.statement()?);
                Ok(Stmt::While { cond, body, span })
            }
            TokenKind::For => self.for_statement(),
            TokenKind::Break => {
                self.advance();
                self.expect(&TokenKind::Semicolon, "after `break`")?;
                Ok(Stmt::Break(span))
            }
            TokenKind::Continue => {
                self.advance();
                self.expect(&TokenKind::Semicolon, "after `continue`")?;
                Ok(Stmt::Continue(span))
            }
            TokenKind::LBrace => {
                let body = self.block()?;
                Ok(Stmt::Block(body, span.merge(self.previous_span())))
            }
            TokenKind::Semicolon => {
                self.advance();
                Ok(Stmt::Block(Vec::new(), span))
            }
            _ => {
                let expr = self.expression()?;
                self.expect(&TokenKind::Semicolon, "after expression")?;
                Ok(Stmt::Expr(expr))
            }
        }
    }

    fn block(&mut self) -> PResult<Vec<Stmt>> {
        self.expect(&TokenKind::LBrace, "to open a block")?;
        let mut body = Vec::new();
        while !self.at(&TokenKind::RBrace) && !self.at(&TokenKind::Eof) {
            match self.statement() {
                Ok(stmt) => body.push(stmt),
                Err(err) => {
                    self.errors.push(err);
                    self.synchronize();
                }
            }
        }
        self.expect(&TokenKind::RBrace, "to close the block")?;
        Ok(body)
    }

    fn for_statement(&mut self) -> PResult<Stmt> {
        let span = self.expect(&TokenKind::For, "")?;
        self.expect(&TokenKind::LParen, "after `for`")?;
        let init = if self.eat(&TokenKind::Semicolon) {
            None
        } else {
            Some(Box::new(self.statement()?))
        };
        let cond = if self.at(&TokenKind::Semicolon) {
            None
        } else {
            Some(self.expression()?)
        };
        self.expect(&TokenKind::Semicolon, "after loop condition")?;
        let step = if self.at(&TokenKind::RParen) {
            None
        } else {
            Some(self.expression()?)
        };
        self.expect(&TokenKind::RParen, "after `for` clauses")?;
        let body = Box::new(self.statement()?);
        Ok(Stmt::For {
            init,
            cond,
            step,
            body,
            span,
        })
    }

    fn declaration(&mut self, exported: bool) -> PResult<Stmt> {
        let span = self.span();
        match self.peek() {
            TokenKind::Function => {
                let decl = self.function(true)?;
                Ok(Stmt::Function { decl, exported })
            }
            TokenKind::Struct => {
                let decl = self.struct_body(true)?;
                self.eat(&TokenKind::Semicolon);
                Ok(Stmt::Struct { decl, exported })
            }
            _ => {
                let (types, is_const) = self.declared_type()?;
                let name = self.ident("in declaration")?;
                let init = if self.eat(&TokenKind::Eq) {
                    Some(self.expression()?)
                } else {
                    None
                };
                if is_const && init.is_none() {
                    return Err(self.error(format!("const `{name}` needs an initializer")));
                }
                self.expect(&TokenKind::Semicolon, "after declaration")?;
                Ok(Stmt::Var(VarDecl {
                    name,
                    types,
                    is_const,
                    init,
                    exported,
                    span,
                }))
            }
        }
    }

    /// `var`, `var<T,..>`, `const`, `const var<..>`, or a type name.
    fn declared_type(&mut self) -> PResult<(Vec<String>, bool)> {
        let is_const = self.eat(&TokenKind::Const);
        if self.eat(&TokenKind::Var) {
            return Ok((self.type_list()?, is_const));
        }
        if self.at_typed_declaration() {
            if let TokenKind::Ident(t) = self.advance() {
                return Ok((vec![t], is_const));
            }
        }
        if is_const {
            return Ok((Vec::new(), true));
        }
        Err(self.error(format!("expected declaration, found {}", self.peek())))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Functions and structs
    // ─────────────────────────────────────────────────────────────────────────

    fn function(&mut self, named: bool) -> PResult<FunctionDecl> {
        let start = self.expect(&TokenKind::Function, "")?;
        let name = if named || matches!(self.peek(), TokenKind::Ident(_)) {
            Some(self.ident("after `function`")?)
        } else {
            None
        };
        let params = self.params()?;
        let body = self.block()?;
        Ok(FunctionDecl {
            name,
            params,
            body,
            span: start.merge(self.previous_span()),
        })
    }

    fn params(&mut self) -> PResult<Vec<Param>> {
        self.expect(&TokenKind::LParen, "to open parameters")?;
        let mut params: Vec<Param> = Vec::new();
        while !self.at(&TokenKind::RParen) {
            let span = self.span();
            let types = if self.eat(&TokenKind::Var) {
                self.type_list()?
            } else if self.at_typed_declaration() {
                match self.advance() {
                    TokenKind::Ident(t) => vec![t],
                    _ => Vec::new(),
                }
            } else {
                Vec::new()
            };
            let name = self.ident("as parameter name")?;
            let default = if self.eat(&TokenKind::Eq) {
                Some(self.expression()?)
            } else {
                None
            };
            if default.is_none() && params.iter().any(|p| p.default.is_some()) {
                return Err(ParseError {
                    message: format!("parameter `{name}` follows a defaulted parameter"),
                    span,
                });
            }
            params.push(Param {
                name,
                types,
                default,
                span,
            });
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(&TokenKind::RParen, "to close parameters")?;
        Ok(params)
    }

    fn struct_body(&mut self, named: bool) -> PResult<StructDecl> {
        let start = self.expect(&TokenKind::Struct, "")?;
        let name = if named {
            Some(self.ident("after `struct`")?)
        } else {
            None
        };
        self.expect(&TokenKind::LBrace, "to open the struct body")?;
        let mut items = Vec::new();
        while !self.at(&TokenKind::RBrace) && !self.at(&TokenKind::Eof) {
            items.push(self.struct_item()?);
        }
        self.expect(&TokenKind::RBrace, "to close the struct body")?;
        Ok(StructDecl {
            name,
            items,
            span: start.merge(self.previous_span()),
        })
    }

    fn struct_item(&mut self) -> PResult<StructItem> {
        let span = self.span();
        let (mut is_static, mut is_private, mut is_const) = (false, false, false);
        loop {
            match self.peek() {
                TokenKind::Static => is_static = true,
                TokenKind::Private => is_private = true,
                TokenKind::Const => is_const = true,
                _ => break,
            }
            self.advance();
        }
        let item = |name, kind| StructItem {
            name,
            kind,
            is_static,
            is_private,
            is_const,
            span,
        };

        match self.peek() {
            TokenKind::Constructor => {
                self.advance();
                let params = self.params()?;
                if self.eat(&TokenKind::Eq) {
                    self.expect(&TokenKind::Default, "after `constructor() =`")?;
                    self.expect(&TokenKind::Semicolon, "after `= default`")?;
                    if !params.is_empty() {
                        return Err(ParseError {
                            message: "a default constructor takes no parameters".into(),
                            span,
                        });
                    }
                    return Ok(item("constructor".into(), StructItemKind::DefaultConstructor));
                }
                let body = self.block()?;
                self.eat(&TokenKind::Semicolon);
                let decl = FunctionDecl {
                    name: Some("constructor".into()),
                    params,
                    body,
                    span: span.merge(self.previous_span()),
                };
                Ok(item("constructor".into(), StructItemKind::Constructor(decl)))
            }
            TokenKind::Function => {
                let decl = self.function(true)?;
                self.eat(&TokenKind::Semicolon);
                let name = decl.name.clone().unwrap_or_default();
                Ok(item(name, StructItemKind::Method(decl)))
            }
            _ => {
                let types = if self.eat(&TokenKind::Var) {
                    self.type_list()?
                } else if self.at_typed_declaration() {
                    match self.advance() {
                        TokenKind::Ident(t) => vec![t],
                        _ => Vec::new(),
                    }
                } else if is_const && matches!(self.peek(), TokenKind::Ident(_)) {
                    Vec::new()
                } else {
                    return Err(self.error(format!("expected struct member, found {}", self.peek())));
                };
                let name = self.ident("as member name")?;
                let init = if self.eat(&TokenKind::Eq) {
                    Some(self.expression()?)
                } else {
                    None
                };
                self.expect(&TokenKind::Semicolon, "after member")?;
                Ok(item(name, StructItemKind::Member { types, init }))
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Expressions
    // ─────────────────────────────────────────────────────────────────────────

    pub fn expression(&mut self) -> PResult<Expr> {
        self.assignment()
    }

    fn assignment(&mut self) -> PResult<Expr> {
        let target = self.logical_or()?;
        let op = match self.peek() {
            TokenKind::Eq => None,
            TokenKind::PlusEq => Some(BinOp::Add),
            TokenKind::MinusEq => Some(BinOp::Sub),
            TokenKind::StarEq => Some(BinOp::Mul),
            TokenKind::SlashEq => Some(BinOp::Div),
            TokenKind::PercentEq => Some(BinOp::Mod),
            TokenKind::LtLtEq => Some(BinOp::Shl),
            TokenKind::GtGtEq => Some(BinOp::Shr),
            TokenKind::PipeEq => Some(BinOp::BitOr),
            TokenKind::AmpEq => Some(BinOp::BitAnd),
            TokenKind::CaretEq => Some(BinOp::BitXor),
            _ => return Ok(target),
        };
        if !target.is_assignable() {
            return Err(self.error("invalid assignment target".into()));
        }
        self.advance();
        let value = self.assignment()?;
        let span = target.span().merge(value.span());
        Ok(Expr::Assign {
            op,
            target: Box::new(target),
            value: Box::new(value),
            span,
        })
    }

    fn logical_or(&mut self) -> PResult<Expr> {
        let mut lhs = self.logical_and()?;
        while self.eat(&TokenKind::PipePipe) {
            let rhs = self.logical_and()?;
            let span = lhs.span().merge(rhs.span());
            lhs = Expr::Logical {
                is_and: false,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                span,
            };
        }
        Ok(lhs)
    }

    fn logical_and(&mut self) -> PResult<Expr> {
        let mut lhs = self.comparison()?;
        while self.eat(&TokenKind::AmpAmp) {
            let rhs = self.comparison()?;
            let span = lhs.span().merge(rhs.span());
            lhs = Expr::Logical {
                is_and: true,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                span,
            };
        }
        Ok(lhs)
    }

    /// One left-associative binary level.
    fn binary_level(
        &mut self,
        ops: &[(TokenKind, BinOp)],
        next: fn(&mut Self) -> PResult<Expr>,
    ) -> PResult<Expr> {
        let mut lhs = next(self)?;
        'outer: loop {
            for (kind, op) in ops {
                if self.eat(kind) {
                    let rhs = next(self)?;
                    let span = lhs.span().merge(rhs.span());
                    lhs = Expr::Binary {
                        op: *op,
                        lhs: Box::new(lhs),
                        rhs: Box::new(rhs),
                        span,
                    };
                    continue 'outer;
                }
            }
            return Ok(lhs);
        }
    }

    fn comparison(&mut self) -> PResult<Expr> {
        self.binary_level(
            &[
                (TokenKind::EqEq, BinOp::Eq),
                (TokenKind::BangEq, BinOp::Ne),
                (TokenKind::LtEq, BinOp::Le),
                (TokenKind::GtEq, BinOp::Ge),
                (TokenKind::Lt, BinOp::Lt),
                (TokenKind::Gt, BinOp::Gt),
            ],
            Self::bit_or,
        )
    }

    fn bit_or(&mut self) -> PResult<Expr> {
        self.binary_level(&[(TokenKind::Pipe, BinOp::BitOr)], Self::bit_xor)
    }

    fn bit_xor(&mut self) -> PResult<Expr> {
        self.binary_level(&[(TokenKind::Caret, BinOp::BitXor)], Self::bit_and)
    }

    fn bit_and(&mut self) -> PResult<Expr> {
        self.binary_level(&[(TokenKind::Amp, BinOp::BitAnd)], Self::shift)
    }

    fn shift(&mut self) -> PResult<Expr> {
        self.binary_level(
            &[(TokenKind::LtLt, BinOp::Shl), (TokenKind::GtGt, BinOp::Shr)],
            Self::additive,
        )
    }

    fn additive(&mut self) -> PResult<Expr> {
        self.binary_level(
            &[(TokenKind::Plus, BinOp::Add), (TokenKind::Minus, BinOp::Sub)],
            Self::multiplicative,
        )
    }

    fn multiplicative(&mut self) -> PResult<Expr> {
        self.binary_level(
            &[
                (TokenKind::Star, BinOp::Mul),
                (TokenKind::Slash, BinOp::Div),
                (TokenKind::Percent, BinOp::Mod),
            ],
            Self::unary,
        )
    }

    fn unary(&mut self) -> PResult<Expr> {
        let span = self.span();
        let op = match self.peek() {
            TokenKind::Minus => UnOp::Neg,
            TokenKind::Bang => UnOp::Not,
            TokenKind::Tilde => UnOp::BitNot,
            TokenKind::PlusPlus | TokenKind::MinusMinus => {
                let op = if self.advance() == TokenKind::PlusPlus {
                    IncrOp::PreIncr
                } else {
                    IncrOp::PreDecr
                };
                let target = self.unary()?;
                if !target.is_assignable() {
                    return Err(ParseError {
                        message: "`++`/`--` needs an assignable operand".into(),
                        span,
                    });
                }
                let span = span.merge(target.span());
                return Ok(Expr::Incr {
                    op,
                    target: Box::new(target),
                    span,
                });
            }
            _ => return self.exponent(),
        };
        self.advance();
        let operand = self.unary()?;
        let span = span.merge(operand.span());
        Ok(Expr::Unary {
            op,
            operand: Box::new(operand),
            span,
        })
    }

    fn exponent(&mut self) -> PResult<Expr> {
        let base = self.postfix()?;
        if self.eat(&TokenKind::StarStar) {
            let rhs = self.unary()?;
            let span = base.span().merge(rhs.span());
            return Ok(Expr::Binary {
                op: BinOp::Exp,
                lhs: Box::new(base),
                rhs: Box::new(rhs),
                span,
            });
        }
        Ok(base)
    }

    fn postfix(&mut self) -> PResult<Expr> {
        let mut expr = self.primary()?;
        loop {
            match self.peek() {
                TokenKind::LParen => {
                    let args = self.arguments()?;
                    let span = expr.span().merge(self.previous_span());
                    expr = Expr::Call {
                        callee: Box::new(expr),
                        args,
                        span,
                    };
                }
                TokenKind::Dot => {
                    self.advance();
                    let name = self.ident("after `.`")?;
                    if self.at(&TokenKind::LParen) {
                        let args = self.arguments()?;
                        let span = expr.span().merge(self.previous_span());
                        expr = Expr::MethodCall {
                            object: Box::new(expr),
                            name,
                            args,
                            span,
                        };
                    } else {
                        let span = expr.span().merge(self.previous_span());
                        expr = Expr::Field {
                            object: Box::new(expr),
                            name,
                            span,
                        };
                    }
                }
                TokenKind::LBracket => {
                    self.advance();
                    let index = self.expression()?;
                    self.expect(&TokenKind::RBracket, "to close the index")?;
                    let span = expr.span().merge(self.previous_span());
                    expr = Expr::Index {
                        object: Box::new(expr),
                        index: Box::new(index),
                        span,
                    };
                }
                TokenKind::PlusPlus | TokenKind::MinusMinus if expr.is_assignable() => {
                    let op = if self.advance() == TokenKind::PlusPlus {
                        IncrOp::Incr
                    } else {
                        IncrOp::Decr
                    };
                    let span = expr.span().merge(self.previous_span());
                    expr = Expr::Incr {
                        op,
                        target: Box::new(expr),
                        span,
                    };
                }
                _ => return Ok(expr),
            }
        }
    }

    fn arguments(&mut self) -> PResult<Vec<Expr>> {
        self.expect(&TokenKind::LParen, "to open arguments")?;
        let mut args = Vec::new();
        while !self.at(&TokenKind::RParen) {
            args.push(self.expression()?);
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(&TokenKind::RParen, "to close arguments")?;
        Ok(args)
    }

    fn primary(&mut self) -> PResult<Expr> {
        let span = self.span();
        match self.peek().clone() {
            TokenKind::Null => {
                self.advance();
                Ok(Expr::Null(span))
            }
            TokenKind::True => {
                self.advance();
                Ok(Expr::Bool(true, span))
            }
            TokenKind::False => {
                self.advance();
                Ok(Expr::Bool(false, span))
            }
            TokenKind::Int(n) => {
                self.advance();
                Ok(Expr::Int(n, span))
            }
            TokenKind::Float(f) => {
                self.advance();
                Ok(Expr::Float(f, span))
            }
            TokenKind::Str(s) => {
                self.advance();
                Ok(Expr::Str(s, span))
            }
            TokenKind::Ident(name) => {
                self.advance();
                Ok(Expr::Ident(name, span))
            }
            TokenKind::This => {
                self.advance();
                Ok(Expr::This(span))
            }
            TokenKind::LParen => {
                self.advance();
                let expr = self.expression()?;
                self.expect(&TokenKind::RParen, "to close the group")?;
                Ok(expr)
            }
            TokenKind::LBracket => {
                self.advance();
                let mut items = Vec::new();
                while !self.at(&TokenKind::RBracket) {
                    items.push(self.expression()?);
                    if !self.eat(&TokenKind::Comma) {
                        break;
                    }
                }
                self.expect(&TokenKind::RBracket, "to close the array")?;
                Ok(Expr::Array(items, span.merge(self.previous_span())))
            }
            TokenKind::LBrace => self.table(),
            TokenKind::Function => Ok(Expr::Function(Box::new(self.function(false)?))),
            TokenKind::Struct => Ok(Expr::Struct(Box::new(self.struct_body(false)?))),
            other => Err(self.error(format!("expected expression, found {other}"))),
        }
    }

    fn table(&mut self) -> PResult<Expr> {
        let start = self.expect(&TokenKind::LBrace, "")?;
        let mut entries = Vec::new();
        while !self.at(&TokenKind::RBrace) {
            let key_span = self.span();
            let key = match self.peek().clone() {
                TokenKind::Ident(name) => {
                    self.advance();
                    Expr::Str(name, key_span)
                }
                TokenKind::Str(s) => {
                    self.advance();
                    Expr::Str(s, key_span)
                }
                TokenKind::LBracket => {
                    self.advance();
                    let key = self.expression()?;
                    self.expect(&TokenKind::RBracket, "to close the key")?;
                    key
                }
                other => return Err(self.error(format!("expected table key, found {other}"))),
            };
            self.expect(&TokenKind::Eq, "after table key")?;
            let value = self.expression()?;
            entries.push((key, value));
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(&TokenKind::RBrace, "to close the table")?;
        Ok(Expr::Table(entries, start.merge(self.previous_span())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::lex;

    fn parse_ok(src: &str) -> Program {
        let (tokens, errs) = lex(src);
        assert!(errs.is_empty(), "lex errors: {errs:?}");
        parse(tokens).unwrap_or_else(|e| panic!("parse errors: {e:?}"))
    }

    fn parse_err(src: &str) -> Vec<ParseError> {
        let (tokens, _) = lex(src);
        parse(tokens).expect_err("expected a parse error")
    }

    fn expr(src: &str) -> Expr {
        match parse_ok(src).body.remove(0) {
            Stmt::Expr(e) => e,
            other => panic!("expected expression statement, got {other:?}"),
        }
    }

    #[test]
    fn test_precedence() {
        let Expr::Binary { op, rhs, .. } = expr("1 + 2 * 3;") else { panic!() };
        assert_eq!(op, BinOp::Add);
        assert!(matches!(*rhs, Expr::Binary { op: BinOp::Mul, .. }));

        let Expr::Unary { op, operand, .. } = expr("-2 ** 2;") else { panic!() };
        assert_eq!(op, UnOp::Neg);
        assert!(matches!(*operand, Expr::Binary { op: BinOp::Exp, .. }));
    }

    #[test]
    fn test_assignment_is_right_associative() {
        let Expr::Assign { value, .. } = expr("a = b += 1;") else { panic!() };
        assert!(matches!(*value, Expr::Assign { op: Some(BinOp::Add), .. }));
    }

    #[test]
    fn test_declarations() {
        let program = parse_ok("var<int, float> x = 1; const y = 2; int z; export var e = 3;");
        let decls: Vec<&VarDecl> = program
            .body
            .iter()
            .map(|s| match s {
                Stmt::Var(v) => v,
                other => panic!("{other:?}"),
            })
            .collect();
        assert_eq!(decls[0].types, vec!["int", "float"]);
        assert!(decls[1].is_const);
        assert_eq!(decls[2].types, vec!["int"]);
        assert!(decls[2].init.is_none());
        assert!(decls[3].exported);
    }

    #[test]
    fn test_struct_declaration() {
        let program = parse_ok(
            "struct P {
                constructor(a = 0, b = 0) { this.a = a; this.b = b; }
                var a = 0;
                const var c = 1;
                static const var s = 2;
                private var p = 3;
                int typed = 4;
                function sum() { return this.a + this.b; }
             };",
        );
        let Stmt::Struct { decl, .. } = &program.body[0] else { panic!() };
        assert_eq!(decl.name.as_deref(), Some("P"));
        assert_eq!(decl.items.len(), 7);
        assert!(matches!(decl.items[0].kind, StructItemKind::Constructor(_)));
        assert!(decl.items[2].is_const);
        assert!(decl.items[3].is_static && decl.items[3].is_const);
        assert!(decl.items[4].is_private);
        assert!(matches!(decl.items[6].kind, StructItemKind::Method(_)));
    }

    #[test]
    fn test_default_constructor() {
        let program = parse_ok("struct Q { constructor() = default; var x = 1; }");
        let Stmt::Struct { decl, .. } = &program.body[0] else { panic!() };
        assert!(matches!(decl.items[0].kind, StructItemKind::DefaultConstructor));
    }

    #[test]
    fn test_postfix_chain() {
        let e = expr("a.b(1)[2].c++;");
        let Expr::Incr { op, target, .. } = e else { panic!() };
        assert_eq!(op, IncrOp::Incr);
        assert!(matches!(*target, Expr::Field { .. }));
    }

    #[test]
    fn test_table_and_array_literals() {
        let Expr::Table(entries, _) = expr("x = {a = 1, [\"b\"] = [1, 2], c = {}};")
            .clone()
            .into_assign_value()
        else {
            panic!()
        };
        assert_eq!(entries.len(), 3);
    }

    #[test]
    fn test_control_flow() {
        let program = parse_ok(
            "for (var i = 0; i < 3; i++) { if (i == 1) continue; else break; } while (true) {}",
        );
        assert!(matches!(program.body[0], Stmt::For { .. }));
        assert!(matches!(program.body[1], Stmt::While { .. }));
    }

    #[test]
    fn test_errors_recover_and_collect() {
        let errs = parse_err("var = 1; var ok = 2; 3 +;");
        assert_eq!(errs.len(), 2);
        assert!(errs[0].to_string().starts_with("[1:5]"));
    }

    #[test]
    fn test_defaults_must_trail() {
        let errs = parse_err("function f(a = 1, b) {}");
        assert!(errs[0].message.contains("follows a defaulted parameter"));
    }

    #[test]
    fn test_invalid_assignment_target() {
        let errs = parse_err("1 = 2;");
        assert!(errs[0].message.contains("invalid assignment target"));
    }

    impl Expr {
        fn into_assign_value(self) -> Expr {
            match self {
                Expr::Assign { value, .. } => *value,
                other => other,
            }
        }
    }
}
