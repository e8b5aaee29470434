// Copyright 2025 The Fluxion Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! Hand-written recursive descent parser for stock-and-flow equations.
//!
//! Consumes the lexer's token stream and produces the untyped AST
//! (Expr0, IndexExpr0).  Precedence, low to high: if/then/else, `|`,
//! `&`, `= == ≠`, `< ≤ > ≥`, `+ -`, `* / mod`, unary `+ - !`, `^`
//! (right-associative), postfix (call, subscript, transpose), atom.

use crate::ast::{BinaryOp, Expr0, IndexExpr0, UnaryOp};
use crate::builtins::{Loc, UntypedBuiltinFn};
use crate::common::{canonicalize, EquationError, ErrorCode};
use crate::token::{Lexer, LexerType, Spanned, Token};

#[cfg(test)]
mod tests;

/// Token discriminant for peek comparisons without payload matching.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TokenKind {
    If,
    Then,
    Else,
    Eq,
    EqEq,
    Neq,
    Not,
    Mod,
    Exp,
    Lt,
    Lte,
    Gt,
    Gte,
    And,
    Or,
    Plus,
    Minus,
    Mul,
    Div,
    SafeDiv,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Colon,
    Apostrophe,
    At,
    Nan,
    Ident,
    Num,
}

impl<'a> From<&Token<'a>> for TokenKind {
    fn from(token: &Token<'a>) -> Self {
        match token {
            Token::If => TokenKind::If,
            Token::Then => TokenKind::Then,
            Token::Else => TokenKind::Else,
            Token::Eq => TokenKind::Eq,
            Token::EqEq => TokenKind::EqEq,
            Token::Neq => TokenKind::Neq,
            Token::Not => TokenKind::Not,
            Token::Mod => TokenKind::Mod,
            Token::Exp => TokenKind::Exp,
            Token::Lt => TokenKind::Lt,
            Token::Lte => TokenKind::Lte,
            Token::Gt => TokenKind::Gt,
            Token::Gte => TokenKind::Gte,
            Token::And => TokenKind::And,
            Token::Or => TokenKind::Or,
            Token::Plus => TokenKind::Plus,
            Token::Minus => TokenKind::Minus,
            Token::Mul => TokenKind::Mul,
            Token::Div => TokenKind::Div,
            Token::SafeDiv => TokenKind::SafeDiv,
            Token::LParen => TokenKind::LParen,
            Token::RParen => TokenKind::RParen,
            Token::LBracket => TokenKind::LBracket,
            Token::RBracket => TokenKind::RBracket,
            Token::Comma => TokenKind::Comma,
            Token::Colon => TokenKind::Colon,
            Token::Apostrophe => TokenKind::Apostrophe,
            Token::At => TokenKind::At,
            Token::Nan => TokenKind::Nan,
            Token::Ident(_) => TokenKind::Ident,
            Token::Num(_) => TokenKind::Num,
        }
    }
}

struct Parser<'input> {
    tokens: Vec<Spanned<Token<'input>>>,
    pos: usize,
}

impl<'input> Parser<'input> {
    /// Collect all tokens up front; the first lexer error aborts parsing.
    fn new(lexer: Lexer<'input>) -> Result<Self, EquationError> {
        let mut tokens = Vec::new();
        for result in lexer {
            match result {
                Ok(tok) => tokens.push(tok),
                Err(e) => return Err(e),
            }
        }
        Ok(Parser { tokens, pos: 0 })
    }

    fn peek(&self) -> Option<&Spanned<Token<'input>>> {
        self.tokens.get(self.pos)
    }

    fn peek_kind(&self) -> Option<TokenKind> {
        self.peek().map(|(_, tok, _)| TokenKind::from(tok))
    }

    fn advance(&mut self) -> Option<&Spanned<Token<'input>>> {
        if self.pos < self.tokens.len() {
            let tok = &self.tokens[self.pos];
            self.pos += 1;
            Some(tok)
        } else {
            None
        }
    }

    fn expect(&mut self, expected: TokenKind) -> Result<&Spanned<Token<'input>>, EquationError> {
        if self.peek_kind() == Some(expected) {
            Ok(self.advance().unwrap())
        } else {
            Err(self.err_at_current(ErrorCode::UnrecognizedToken))
        }
    }

    fn eof_position(&self) -> usize {
        if let Some((_, _, end)) = self.tokens.last() {
            *end
        } else {
            0
        }
    }

    fn err_at_current(&self, code: ErrorCode) -> EquationError {
        if let Some((start, _, end)) = self.peek() {
            EquationError {
                start: *start as u16,
                end: *end as u16,
                code,
            }
        } else {
            let pos = self.eof_position();
            EquationError {
                start: pos as u16,
                end: (pos + 1) as u16,
                code: ErrorCode::UnrecognizedEof,
            }
        }
    }

    fn is_at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    /// Ok(None) for empty or comment-only input.
    fn parse_equation(&mut self) -> Result<Option<Expr0>, EquationError> {
        if self.is_at_end() {
            return Ok(None);
        }

        let expr = self.parse_expr()?;

        if self.peek().is_some() {
            return Err(self.err_at_current(ErrorCode::ExtraToken));
        }

        Ok(Some(expr))
    }

    fn parse_expr(&mut self) -> Result<Expr0, EquationError> {
        if self.peek_kind() == Some(TokenKind::If) {
            self.parse_if()
        } else {
            self.parse_logical()
        }
    }

    fn parse_if(&mut self) -> Result<Expr0, EquationError> {
        let (lpos, _, _) = *self.expect(TokenKind::If)?;
        let cond = self.parse_expr()?;
        self.expect(TokenKind::Then)?;
        let t = self.parse_expr()?;
        self.expect(TokenKind::Else)?;
        let f = self.parse_expr()?;
        let rpos = f.get_loc().end as usize;
        Ok(Expr0::If(
            Box::new(cond),
            Box::new(t),
            Box::new(f),
            Loc::new(lpos, rpos),
        ))
    }

    fn parse_logical(&mut self) -> Result<Expr0, EquationError> {
        let mut left = self.parse_conjunction()?;

        while self.peek_kind() == Some(TokenKind::Or) {
            self.advance();
            let right = self.parse_conjunction()?;
            let loc = left.get_loc().union(&right.get_loc());
            left = Expr0::Op2(BinaryOp::Or, Box::new(left), Box::new(right), loc);
        }

        Ok(left)
    }

    fn parse_conjunction(&mut self) -> Result<Expr0, EquationError> {
        let mut left = self.parse_equality()?;

        while self.peek_kind() == Some(TokenKind::And) {
            self.advance();
            let right = self.parse_equality()?;
            let loc = left.get_loc().union(&right.get_loc());
            left = Expr0::Op2(BinaryOp::And, Box::new(left), Box::new(right), loc);
        }

        Ok(left)
    }

    fn parse_equality(&mut self) -> Result<Expr0, EquationError> {
        let mut left = self.parse_comparison()?;

        loop {
            let op = match self.peek_kind() {
                // = and == are tokenized apart but mean the same thing
                Some(TokenKind::Eq) | Some(TokenKind::EqEq) => BinaryOp::Eq,
                Some(TokenKind::Neq) => BinaryOp::Neq,
                _ => break,
            };
            self.advance();
            let right = self.parse_comparison()?;
            let loc = left.get_loc().union(&right.get_loc());
            left = Expr0::Op2(op, Box::new(left), Box::new(right), loc);
        }

        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<Expr0, EquationError> {
        let mut left = self.parse_additive()?;

        loop {
            let op = match self.peek_kind() {
                Some(TokenKind::Lt) => BinaryOp::Lt,
                Some(TokenKind::Lte) => BinaryOp::Lte,
                Some(TokenKind::Gt) => BinaryOp::Gt,
                Some(TokenKind::Gte) => BinaryOp::Gte,
                _ => break,
            };
            self.advance();
            let right = self.parse_additive()?;
            let loc = left.get_loc().union(&right.get_loc());
            left = Expr0::Op2(op, Box::new(left), Box::new(right), loc);
        }

        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<Expr0, EquationError> {
        let mut left = self.parse_multiplicative()?;

        loop {
            let op = match self.peek_kind() {
                Some(TokenKind::Plus) => BinaryOp::Add,
                Some(TokenKind::Minus) => BinaryOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.parse_multiplicative()?;
            let loc = left.get_loc().union(&right.get_loc());
            left = Expr0::Op2(op, Box::new(left), Box::new(right), loc);
        }

        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr0, EquationError> {
        let mut left = self.parse_unary()?;

        loop {
            let op = match self.peek_kind() {
                Some(TokenKind::Mul) => BinaryOp::Mul,
                Some(TokenKind::Div) => BinaryOp::Div,
                Some(TokenKind::Mod) => BinaryOp::Mod,
                Some(TokenKind::SafeDiv) => {
                    // `a // b` is sugar for safediv(a, b)
                    self.advance();
                    let right = self.parse_unary()?;
                    let loc = left.get_loc().union(&right.get_loc());
                    left = Expr0::App(
                        UntypedBuiltinFn("safediv".to_string(), vec![left, right]),
                        loc,
                    );
                    continue;
                }
                _ => break,
            };
            self.advance();
            let right = self.parse_unary()?;
            let loc = left.get_loc().union(&right.get_loc());
            left = Expr0::Op2(op, Box::new(left), Box::new(right), loc);
        }

        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr0, EquationError> {
        let op = match self.peek_kind() {
            Some(TokenKind::Plus) => UnaryOp::Positive,
            Some(TokenKind::Minus) => UnaryOp::Negative,
            Some(TokenKind::Not) => UnaryOp::Not,
            _ => return self.parse_exponentiation(),
        };
        let (lpos, _, _) = *self.advance().unwrap();
        let operand = self.parse_exponentiation()?;
        let rpos = operand.get_loc().end as usize;
        Ok(Expr0::Op1(op, Box::new(operand), Loc::new(lpos, rpos)))
    }

    /// `^` is right-associative: 2^3^2 is 2^(3^2).
    fn parse_exponentiation(&mut self) -> Result<Expr0, EquationError> {
        let left = self.parse_app()?;

        if self.peek_kind() == Some(TokenKind::Exp) {
            self.advance();
            let right = self.parse_unary()?;
            let loc = left.get_loc().union(&right.get_loc());
            return Ok(Expr0::Op2(
                BinaryOp::Exp,
                Box::new(left),
                Box::new(right),
                loc,
            ));
        }

        Ok(left)
    }

    fn parse_app(&mut self) -> Result<Expr0, EquationError> {
        if self.peek_kind() == Some(TokenKind::Ident)
            && self.pos + 1 < self.tokens.len()
            && TokenKind::from(&self.tokens[self.pos + 1].1) == TokenKind::LParen
        {
            let (lpos, tok, _) = *self.advance().unwrap();
            let name = if let Token::Ident(s) = tok {
                canonicalize(s)
            } else {
                unreachable!()
            };

            self.advance(); // consume '('
            let args = self.parse_comma_separated_exprs()?;
            let (_, _, rpos) = *self.expect(TokenKind::RParen)?;

            return Ok(Expr0::App(
                UntypedBuiltinFn(name, args),
                Loc::new(lpos, rpos),
            ));
        }

        self.parse_postfix()
    }

    /// Postfix transpose: `a'`, `a[x, y]'`.
    fn parse_postfix(&mut self) -> Result<Expr0, EquationError> {
        let mut expr = self.parse_subscript()?;

        while self.peek_kind() == Some(TokenKind::Apostrophe) {
            let (_, _, rpos) = *self.advance().unwrap();
            let lpos = expr.get_loc().start as usize;
            expr = Expr0::Op1(UnaryOp::Transpose, Box::new(expr), Loc::new(lpos, rpos));
        }

        Ok(expr)
    }

    fn parse_subscript(&mut self) -> Result<Expr0, EquationError> {
        if self.peek_kind() == Some(TokenKind::Ident)
            && self.pos + 1 < self.tokens.len()
            && TokenKind::from(&self.tokens[self.pos + 1].1) == TokenKind::LBracket
        {
            let (lpos, tok, _) = *self.advance().unwrap();
            let name = if let Token::Ident(s) = tok {
                canonicalize(s)
            } else {
                unreachable!()
            };

            self.advance(); // consume '['
            let indices = self.parse_index_exprs()?;
            let (_, _, rpos) = *self.expect(TokenKind::RBracket)?;

            return Ok(Expr0::Subscript(name, indices, Loc::new(lpos, rpos)));
        }

        self.parse_atom()
    }

    fn parse_atom(&mut self) -> Result<Expr0, EquationError> {
        match self.peek_kind() {
            Some(TokenKind::Num) => {
                let (lpos, tok, rpos) = *self.advance().unwrap();
                if let Token::Num(s) = tok {
                    match s.parse::<f64>() {
                        Ok(n) => Ok(Expr0::Const(s.to_string(), n, Loc::new(lpos, rpos))),
                        Err(_) => Err(EquationError {
                            start: lpos as u16,
                            end: rpos as u16,
                            code: ErrorCode::ExpectedNumber,
                        }),
                    }
                } else {
                    unreachable!()
                }
            }
            Some(TokenKind::Nan) => {
                let (lpos, _, rpos) = *self.advance().unwrap();
                Ok(Expr0::Const(
                    "NaN".to_string(),
                    f64::NAN,
                    Loc::new(lpos, rpos),
                ))
            }
            Some(TokenKind::Ident) => {
                let (lpos, tok, rpos) = *self.advance().unwrap();
                if let Token::Ident(s) = tok {
                    Ok(Expr0::Var(canonicalize(s), Loc::new(lpos, rpos)))
                } else {
                    unreachable!()
                }
            }
            Some(TokenKind::LParen) => {
                self.advance(); // consume '('
                let expr = self.parse_expr()?;
                self.expect(TokenKind::RParen)?;
                Ok(expr)
            }
            Some(_) => Err(self.err_at_current(ErrorCode::UnrecognizedToken)),
            None => Err(self.err_at_current(ErrorCode::UnrecognizedEof)),
        }
    }

    fn parse_comma_separated_exprs(&mut self) -> Result<Vec<Expr0>, EquationError> {
        let mut exprs = Vec::new();

        if self.peek_kind() == Some(TokenKind::RParen) {
            return Ok(exprs);
        }

        exprs.push(self.parse_expr()?);

        while self.peek_kind() == Some(TokenKind::Comma) {
            self.advance();

            // trailing comma
            if self.peek_kind() == Some(TokenKind::RParen) {
                break;
            }

            exprs.push(self.parse_expr()?);
        }

        Ok(exprs)
    }

    fn parse_index_exprs(&mut self) -> Result<Vec<IndexExpr0>, EquationError> {
        let mut indices = Vec::new();

        if self.peek_kind() == Some(TokenKind::RBracket) {
            return Ok(indices);
        }

        indices.push(self.parse_index_expr()?);

        while self.peek_kind() == Some(TokenKind::Comma) {
            self.advance();

            // trailing comma
            if self.peek_kind() == Some(TokenKind::RBracket) {
                break;
            }

            indices.push(self.parse_index_expr()?);
        }

        Ok(indices)
    }

    fn parse_index_expr(&mut self) -> Result<IndexExpr0, EquationError> {
        match self.peek_kind() {
            // `*` wildcard, or `*:subdim` splat
            Some(TokenKind::Mul) => {
                let (lpos, _, rpos) = *self.advance().unwrap();

                if self.peek_kind() == Some(TokenKind::Colon) {
                    self.advance(); // consume ':'

                    if self.peek_kind() == Some(TokenKind::Ident) {
                        let (_, tok, rpos2) = *self.advance().unwrap();
                        if let Token::Ident(s) = tok {
                            return Ok(IndexExpr0::StarRange(
                                canonicalize(s),
                                Loc::new(lpos, rpos2),
                            ));
                        }
                    }

                    return Err(self.err_at_current(ErrorCode::ExpectedIdent));
                }

                Ok(IndexExpr0::Wildcard(Loc::new(lpos, rpos)))
            }

            // `@n` dimension position
            Some(TokenKind::At) => {
                let (lpos, _, _) = *self.advance().unwrap();

                if self.peek_kind() == Some(TokenKind::Num) {
                    let (_, tok, rpos) = *self.advance().unwrap();
                    if let Token::Num(s) = tok {
                        return match s.parse::<u32>() {
                            Ok(n) => Ok(IndexExpr0::DimPosition(n, Loc::new(lpos, rpos))),
                            Err(_) => Err(EquationError {
                                start: lpos as u16,
                                end: rpos as u16,
                                code: ErrorCode::ExpectedInteger,
                            }),
                        };
                    }
                }

                Err(self.err_at_current(ErrorCode::ExpectedInteger))
            }

            // expression, or inclusive range `a:b`
            _ => {
                let left = self.parse_expr()?;

                if self.peek_kind() == Some(TokenKind::Colon) {
                    self.advance(); // consume ':'

                    let right = self.parse_expr()?;
                    let loc = left.get_loc().union(&right.get_loc());

                    Ok(IndexExpr0::Range(left, right, loc))
                } else {
                    Ok(IndexExpr0::Expr(left))
                }
            }
        }
    }
}

/// Parse an equation string.
///
/// - `Ok(Some(expr))` for valid equations
/// - `Ok(None)` for empty or comment-only input
/// - `Err(errors)` for lex or parse errors
pub fn parse(input: &str, lexer_type: LexerType) -> Result<Option<Expr0>, Vec<EquationError>> {
    let lexer = Lexer::new(input, lexer_type);
    let mut parser = match Parser::new(lexer) {
        Ok(p) => p,
        Err(e) => return Err(vec![e]),
    };

    let expr = parser.parse_equation().map_err(|e| vec![e])?;
    Ok(expr.map(|expr| match lexer_type {
        // in equations a bare `pi` or `TIME` means a call of the 0-arity
        // builtin; in unit definitions `time` is just a unit name
        LexerType::Equation => expr.reify_0_arity_builtins(),
        LexerType::Units => expr,
    }))
}
