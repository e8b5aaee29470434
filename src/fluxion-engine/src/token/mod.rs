// Copyright 2025 The Fluxion Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

use std::str::CharIndices;

use unicode_xid::UnicodeXID;

use self::Token::*;
use crate::common::ErrorCode::*;
use crate::common::{EquationError, ErrorCode};

#[cfg(test)]
mod test;

/// Equations and unit definitions share a grammar but not an alphabet:
/// `$` is a valid unit name character, and `time` is a keyword-ish
/// builtin in equations but a perfectly good unit.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LexerType {
    Equation,
    Units,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Token<'input> {
    If,
    Then,
    Else,
    Eq,
    // `==` is tokenized distinctly from `=`; both evaluate identically
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
    // `//`, the safe-division spelling
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
    Ident(&'input str),
    Num(&'input str),
}

fn error<T>(code: ErrorCode, start: usize, end: usize) -> Result<T, EquationError> {
    Err(EquationError {
        start: start as u16,
        end: end as u16,
        code,
    })
}

pub type Spanned<T> = (usize, T, usize);

const KEYWORDS: &[(&str, Token<'static>)] = &[
    ("if", If),
    ("then", Then),
    ("else", Else),
    ("not", Not),
    ("mod", Mod),
    ("and", And),
    ("or", Or),
    ("nan", Nan),
];

pub struct Lexer<'input> {
    text: &'input str,
    chars: CharIndices<'input>,
    lookahead: Option<(usize, char)>,
    is_units: bool,
}

impl<'input> Lexer<'input> {
    pub fn new(input: &'input str, lexer_type: LexerType) -> Self {
        let mut t = Lexer {
            text: input,
            chars: input.char_indices(),
            lookahead: None,
            is_units: matches!(lexer_type, LexerType::Units),
        };
        t.bump();
        t
    }

    fn bump(&mut self) -> Option<(usize, char)> {
        self.lookahead = self.chars.next();
        self.lookahead
    }

    fn take_while<F>(&mut self, mut keep_going: F) -> Option<usize>
    where
        F: FnMut(char) -> bool,
    {
        self.take_until(|c| !keep_going(c))
    }

    fn take_until<F>(&mut self, mut terminate: F) -> Option<usize>
    where
        F: FnMut(char) -> bool,
    {
        loop {
            match self.lookahead {
                None => {
                    return None;
                }
                Some((idx1, c)) => {
                    if terminate(c) {
                        return Some(idx1);
                    } else {
                        self.bump();
                    }
                }
            }
        }
    }

    fn word(&mut self, idx0: usize) -> Spanned<&'input str> {
        let is_units = self.is_units;
        match self.take_while(|c| is_identifier_continue(c, is_units)) {
            Some(end) => (idx0, &self.text[idx0..end], end),
            None => (idx0, &self.text[idx0..], self.text.len()),
        }
    }

    fn identifierish(&mut self, idx0: usize) -> Spanned<Token<'input>> {
        let (start, word, end) = self.word(idx0);
        let lower_word = word.to_lowercase();

        let tok = KEYWORDS
            .iter()
            .filter(|&&(w, _)| w == lower_word)
            .map(|(_, t)| *t)
            .next()
            .unwrap_or(Ident(word));

        (start, tok, end)
    }

    /// Scan a number starting at idx0.  The exponent marker is only
    /// committed to if at least one digit follows it (after an optional
    /// sign); otherwise we emit the longest valid prefix and restart the
    /// lexer there, so input like `.1e.1e1` never aborts tokenization.
    fn number(&mut self, idx0: usize) -> Spanned<Token<'input>> {
        let bytes = self.text.as_bytes();
        let len = self.text.len();
        let mut end = idx0;

        while end < len && bytes[end].is_ascii_digit() {
            end += 1;
        }
        if end < len && bytes[end] == b'.' {
            end += 1;
            while end < len && bytes[end].is_ascii_digit() {
                end += 1;
            }
        }
        if end < len && (bytes[end] == b'e' || bytes[end] == b'E') {
            let mut exp_end = end + 1;
            if exp_end < len && (bytes[exp_end] == b'+' || bytes[exp_end] == b'-') {
                exp_end += 1;
            }
            if exp_end < len && bytes[exp_end].is_ascii_digit() {
                exp_end += 1;
                while exp_end < len && bytes[exp_end].is_ascii_digit() {
                    exp_end += 1;
                }
                end = exp_end;
            }
        }

        // advance the char iterator to the first char past the number
        while let Some((i, _)) = self.lookahead {
            if i >= end {
                break;
            }
            self.bump();
        }

        (idx0, Num(&self.text[idx0..end]), end)
    }

    fn quoted_identifier(&mut self, idx0: usize) -> Result<Spanned<Token<'input>>, EquationError> {
        // eat the opening '"'
        self.bump();

        match self.take_until(|c| c == '"') {
            Some(idx1) => {
                // eat the trailing '"'
                self.bump();
                Ok((idx0, Ident(&self.text[idx0..idx1 + 1]), idx1 + 1))
            }
            None => error(UnclosedQuotedIdent, idx0, self.text.len()),
        }
    }

    /// `{ ... }` comments are skipped.  An unclosed brace consumes the
    /// rest of the input and is surfaced as a diagnostic.
    fn comment_end(&mut self) -> Result<(), EquationError> {
        let idx0 = match self.lookahead {
            Some((i, _)) => i,
            None => self.text.len(),
        };
        match self.take_until(|c| c == '}') {
            Some(_) => {
                self.bump(); // consume the '}'
                Ok(())
            }
            None => error(UnclosedComment, idx0, self.text.len()),
        }
    }

    #[allow(clippy::unnecessary_wraps)]
    fn consume(
        &mut self,
        i: usize,
        tok: Token<'input>,
        len: usize,
    ) -> Option<Result<Spanned<Token<'input>>, EquationError>> {
        self.bump();
        Some(Ok((i, tok, i + len)))
    }
}

impl<'input> Iterator for Lexer<'input> {
    type Item = Result<Spanned<Token<'input>>, EquationError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            return match self.lookahead {
                Some((i, '/')) => match self.bump() {
                    Some((_, '/')) => self.consume(i, SafeDiv, 2),
                    _ => Some(Ok((i, Div, i + 1))),
                },
                Some((i, '=')) => match self.bump() {
                    Some((_, '=')) => self.consume(i, EqEq, 2),
                    // already bumped, don't consume
                    _ => Some(Ok((i, Eq, i + 1))),
                },
                Some((i, '^')) => self.consume(i, Exp, 1),
                Some((i, '≠')) => self.consume(i, Neq, '≠'.len_utf8()),
                Some((i, '≤')) => self.consume(i, Lte, '≤'.len_utf8()),
                Some((i, '≥')) => self.consume(i, Gte, '≥'.len_utf8()),
                Some((i, '<')) => match self.bump() {
                    Some((_, '>')) => self.consume(i, Neq, 2),
                    Some((_, '=')) => self.consume(i, Lte, 2),
                    _ => Some(Ok((i, Lt, i + 1))),
                },
                Some((i, '>')) => match self.bump() {
                    Some((_, '=')) => self.consume(i, Gte, 2),
                    _ => Some(Ok((i, Gt, i + 1))),
                },
                Some((i, '!')) => match self.bump() {
                    Some((_, '=')) => self.consume(i, Neq, 2),
                    _ => Some(Ok((i, Not, i + 1))),
                },
                Some((i, '&')) => match self.bump() {
                    Some((_, '&')) => self.consume(i, And, 2),
                    _ => Some(Ok((i, And, i + 1))),
                },
                Some((i, '|')) => match self.bump() {
                    Some((_, '|')) => self.consume(i, Or, 2),
                    _ => Some(Ok((i, Or, i + 1))),
                },
                Some((i, '-')) => self.consume(i, Minus, 1),
                Some((i, '+')) => self.consume(i, Plus, 1),
                Some((i, '*')) => self.consume(i, Mul, 1),
                Some((i, ':')) => self.consume(i, Colon, 1),
                Some((i, '\'')) => self.consume(i, Apostrophe, 1),
                Some((i, '@')) => self.consume(i, At, 1),
                Some((i, '{')) => {
                    self.bump();
                    match self.comment_end() {
                        Ok(()) => continue,
                        Err(_) => Some(error(UnclosedComment, i, self.text.len())),
                    }
                }
                Some((i, '(')) => self.consume(i, LParen, 1),
                Some((i, ')')) => self.consume(i, RParen, 1),
                Some((i, '[')) => self.consume(i, LBracket, 1),
                Some((i, ']')) => self.consume(i, RBracket, 1),
                Some((i, ',')) => self.consume(i, Comma, 1),
                Some((i, '"')) => Some(self.quoted_identifier(i)),
                Some((i, c)) if is_identifier_start(c, self.is_units) => {
                    Some(Ok(self.identifierish(i)))
                }
                Some((i, c)) if is_number_start(c) => Some(Ok(self.number(i))),
                Some((_, c)) if c.is_whitespace() => {
                    self.bump();
                    continue;
                }
                Some((i, _)) => {
                    // eat whatever is killing us and surface it as an
                    // error token so the parser can report it in place
                    self.bump();
                    let end = match self.lookahead {
                        Some((end, _)) => end,
                        None => self.text.len(),
                    };
                    Some(error(UnrecognizedToken, i, end))
                }
                None => None,
            };
        }
    }
}

fn is_number_start(c: char) -> bool {
    c.is_ascii_digit() || c == '.'
}

fn is_identifier_start(c: char, is_units: bool) -> bool {
    UnicodeXID::is_xid_start(c) || c == '_' || (is_units && c == '$')
}

fn is_identifier_continue(c: char, is_units: bool) -> bool {
    UnicodeXID::is_xid_continue(c) || c == '.' || (is_units && c == '$')
}
