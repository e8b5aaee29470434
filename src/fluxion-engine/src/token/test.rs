// Copyright 2025 The Fluxion Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

use super::*;

fn lex(input: &str) -> Vec<Token> {
    Lexer::new(input, LexerType::Equation)
        .map(|t| t.unwrap().1)
        .collect()
}

fn lex_spanned(input: &str) -> Vec<Spanned<Token>> {
    Lexer::new(input, LexerType::Equation)
        .map(|t| t.unwrap())
        .collect()
}

#[test]
fn test_empty() {
    assert_eq!(Vec::<Token>::new(), lex(""));
    assert_eq!(Vec::<Token>::new(), lex("   \t\n  "));
    assert_eq!(Vec::<Token>::new(), lex("{only a comment}"));
}

#[test]
fn test_single_tokens() {
    assert_eq!(vec![Plus], lex("+"));
    assert_eq!(vec![Minus], lex("-"));
    assert_eq!(vec![Mul], lex("*"));
    assert_eq!(vec![Div], lex("/"));
    assert_eq!(vec![Exp], lex("^"));
    assert_eq!(vec![Colon], lex(":"));
    assert_eq!(vec![Apostrophe], lex("'"));
    assert_eq!(vec![At], lex("@"));
    assert_eq!(vec![Comma], lex(","));
}

#[test]
fn test_safediv_spelling() {
    assert_eq!(vec![Ident("a"), SafeDiv, Ident("b")], lex("a // b"));
    assert_eq!(vec![Ident("a"), Div, Ident("b")], lex("a / b"));
}

#[test]
fn test_comparison_normalization() {
    assert_eq!(vec![Gte], lex(">="));
    assert_eq!(vec![Lte], lex("<="));
    assert_eq!(vec![Neq], lex("<>"));
    assert_eq!(vec![Neq], lex("!="));
    assert_eq!(vec![Gte], lex("≥"));
    assert_eq!(vec![Lte], lex("≤"));
    assert_eq!(vec![Neq], lex("≠"));
    // == is its own token, distinct from =
    assert_eq!(vec![EqEq], lex("=="));
    assert_eq!(vec![Eq], lex("="));
    assert_eq!(vec![Eq, Eq, Eq], lex("= = ="));
}

#[test]
fn test_keywords() {
    assert_eq!(vec![If, Then, Else], lex("if then else"));
    assert_eq!(vec![If, Then, Else], lex("IF THEN ELSE"));
    assert_eq!(vec![And, Or, Not, Mod], lex("and OR Not mod"));
    assert_eq!(vec![And, Or], lex("&& ||"));
    assert_eq!(vec![And, Or], lex("& |"));
    assert_eq!(vec![Not], lex("!"));
    assert_eq!(vec![Nan], lex("NaN"));
}

#[test]
fn test_identifiers() {
    assert_eq!(vec![Ident("hares")], lex("hares"));
    assert_eq!(vec![Ident("hares_1")], lex("hares_1"));
    assert_eq!(vec![Ident("_hares")], lex("_hares"));
    assert_eq!(vec![Ident("Größe")], lex("Größe"));
    // quoted identifiers keep their quotes
    assert_eq!(vec![Ident("\"birth rate\"")], lex("\"birth rate\""));
    // ifs is an identifier, not the keyword if
    assert_eq!(vec![Ident("ifs")], lex("ifs"));
}

#[test]
fn test_numbers() {
    assert_eq!(vec![Num("12")], lex("12"));
    assert_eq!(vec![Num("12.")], lex("12."));
    assert_eq!(vec![Num(".5")], lex(".5"));
    assert_eq!(vec![Num("3.14159")], lex("3.14159"));
    assert_eq!(vec![Num("1e5")], lex("1e5"));
    assert_eq!(vec![Num("1E5")], lex("1E5"));
    assert_eq!(vec![Num("1e-5")], lex("1e-5"));
    assert_eq!(vec![Num("1.5e+12")], lex("1.5e+12"));
}

#[test]
fn test_unary_minus_not_folded() {
    assert_eq!(vec![Minus, Num("5")], lex("-5"));
    assert_eq!(vec![Num("3"), Minus, Num("5")], lex("3-5"));
    assert_eq!(vec![Num("1e2"), Minus, Num("3")], lex("1e2-3"));
}

#[test]
fn test_number_backoff() {
    // an exponent marker with no digits after it is not part of the
    // number; the lexer emits the longest valid prefix and restarts
    assert_eq!(vec![Num(".1"), Ident("e.1e1")], lex(".1e.1e1"));
    assert_eq!(vec![Num("1"), Ident("e")], lex("1e"));
    assert_eq!(vec![Num("2"), Ident("e"), Plus], lex("2e+"));
}

#[test]
fn test_comments() {
    assert_eq!(vec![Num("1"), Plus, Num("2")], lex("1 {one} + {two} 2"));
    assert_eq!(vec![Ident("a")], lex("a {trailing comment}"));
}

#[test]
fn test_unclosed_comment_is_diagnostic() {
    let results: Vec<_> = Lexer::new("1 + {oops", LexerType::Equation).collect();
    assert_eq!(Ok((0, Num("1"), 1)), results[0]);
    assert_eq!(Ok((2, Plus, 3)), results[1]);
    assert_eq!(
        Err(EquationError {
            start: 4,
            end: 9,
            code: ErrorCode::UnclosedComment,
        }),
        results[2]
    );
}

#[test]
fn test_unclosed_quoted_ident() {
    let results: Vec<_> = Lexer::new("\"oops", LexerType::Equation).collect();
    assert_eq!(1, results.len());
    assert_eq!(ErrorCode::UnclosedQuotedIdent, results[0].clone().unwrap_err().code);
}

#[test]
fn test_invalid_char_is_error_not_panic() {
    let results: Vec<_> = Lexer::new("a # b", LexerType::Equation).collect();
    assert_eq!(3, results.len());
    assert!(results[0].is_ok());
    assert_eq!(ErrorCode::UnrecognizedToken, results[1].clone().unwrap_err().code);
    assert!(results[2].is_ok());
}

#[test]
fn test_spans() {
    assert_eq!(
        vec![(0, Ident("a"), 1), (2, Plus, 3), (4, Ident("b"), 5)],
        lex_spanned("a + b")
    );
    assert_eq!(
        vec![(0, Num("10"), 2), (3, Mul, 4), (5, Ident("rate"), 9)],
        lex_spanned("10 * rate")
    );
}

#[test]
fn test_units_mode() {
    let toks: Vec<_> = Lexer::new("$/year", LexerType::Units)
        .map(|t| t.unwrap().1)
        .collect();
    assert_eq!(vec![Ident("$"), Div, Ident("year")], toks);
}

#[test]
fn test_full_equation() {
    assert_eq!(
        vec![
            If,
            Ident("a"),
            Lt,
            Num("1"),
            Then,
            Ident("birth_rate"),
            Mul,
            Ident("population"),
            Else,
            Num("0")
        ],
        lex("IF a < 1 THEN birth_rate * population ELSE 0")
    );
}

#[test]
fn test_subscript_tokens() {
    assert_eq!(
        vec![
            Ident("a"),
            LBracket,
            Num("1"),
            Colon,
            Num("3"),
            Comma,
            Mul,
            Colon,
            Ident("sub"),
            Comma,
            At,
            Num("2"),
            RBracket
        ],
        lex("a[1:3, *:sub, @2]")
    );
}

#[test]
fn test_lexer_total_no_panic() {
    // lexing arbitrary junk must never panic
    for s in &[
        "", "~", "\u{0}", "a~b", "\"", "{", "}", "1..2", "...", "e", ".e1", "१२३", "🎈",
        "a'[*:']", "@@", "1e1e1e1",
    ] {
        let _ = Lexer::new(s, LexerType::Equation).count();
        let _ = Lexer::new(s, LexerType::Units).count();
    }
}
