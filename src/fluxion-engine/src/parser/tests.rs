// Copyright 2025 The Fluxion Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

use super::*;
use crate::ast::{BinaryOp, Expr0, IndexExpr0, UnaryOp};
use crate::builtins::UntypedBuiltinFn;

fn parse_eqn(eqn: &str) -> Expr0 {
    parse(eqn, LexerType::Equation)
        .unwrap()
        .unwrap()
        .strip_loc()
}

fn parse_err(eqn: &str) -> EquationError {
    parse(eqn, LexerType::Equation).unwrap_err()[0].clone()
}

fn var(id: &str) -> Box<Expr0> {
    Box::new(Expr0::Var(id.to_string(), Loc::default()))
}

fn num(s: &str, n: f64) -> Box<Expr0> {
    Box::new(Expr0::Const(s.to_string(), n, Loc::default()))
}

fn binop(op: BinaryOp, l: Box<Expr0>, r: Box<Expr0>) -> Box<Expr0> {
    Box::new(Expr0::Op2(op, l, r, Loc::default()))
}

#[test]
fn test_empty_is_none() {
    assert_eq!(None, parse("", LexerType::Equation).unwrap());
    assert_eq!(None, parse("   ", LexerType::Equation).unwrap());
    assert_eq!(None, parse("{just a comment}", LexerType::Equation).unwrap());
}

#[test]
fn test_atoms() {
    assert_eq!(*num("42", 42.0), parse_eqn("42"));
    assert_eq!(*num("4.2", 4.2), parse_eqn("4.2"));
    assert_eq!(*var("hares"), parse_eqn("hares"));
    assert_eq!(*var("hares"), parse_eqn("(hares)"));
    assert_eq!(*var("birth_rate"), parse_eqn("\"birth rate\""));
}

#[test]
fn test_precedence() {
    // * binds tighter than +
    assert_eq!(
        *binop(
            BinaryOp::Add,
            var("a"),
            binop(BinaryOp::Mul, var("b"), var("c"))
        ),
        parse_eqn("a + b * c")
    );
    // parens override
    assert_eq!(
        *binop(
            BinaryOp::Mul,
            binop(BinaryOp::Add, var("a"), var("b")),
            var("c")
        ),
        parse_eqn("(a + b) * c")
    );
    // comparison below additive
    assert_eq!(
        *binop(
            BinaryOp::Lt,
            binop(BinaryOp::Add, var("a"), var("b")),
            var("c")
        ),
        parse_eqn("a + b < c")
    );
    // and/or below comparison
    assert_eq!(
        *binop(
            BinaryOp::And,
            binop(BinaryOp::Gt, var("a"), var("b")),
            binop(BinaryOp::Lt, var("c"), var("d"))
        ),
        parse_eqn("a > b and c < d")
    );
}

#[test]
fn test_left_associativity() {
    assert_eq!(
        *binop(
            BinaryOp::Sub,
            binop(BinaryOp::Sub, var("a"), var("b")),
            var("c")
        ),
        parse_eqn("a - b - c")
    );
}

#[test]
fn test_exponent_right_associative() {
    // 2^3^2 is 2^(3^2)
    assert_eq!(
        *binop(
            BinaryOp::Exp,
            num("2", 2.0),
            binop(BinaryOp::Exp, num("3", 3.0), num("2", 2.0))
        ),
        parse_eqn("2^3^2")
    );
}

#[test]
fn test_unary() {
    assert_eq!(
        Expr0::Op1(UnaryOp::Negative, var("a"), Loc::default()),
        parse_eqn("-a")
    );
    assert_eq!(
        Expr0::Op1(UnaryOp::Not, var("a"), Loc::default()),
        parse_eqn("!a")
    );
    assert_eq!(
        Expr0::Op1(UnaryOp::Not, var("a"), Loc::default()),
        parse_eqn("not a")
    );
    // unary binds looser than ^: -2^2 is -(2^2)
    assert_eq!(
        Expr0::Op1(
            UnaryOp::Negative,
            binop(BinaryOp::Exp, num("2", 2.0), num("2", 2.0)),
            Loc::default()
        ),
        parse_eqn("-2^2")
    );
    // and ^ accepts a unary rhs
    assert_eq!(
        *binop(
            BinaryOp::Exp,
            num("2", 2.0),
            Box::new(Expr0::Op1(UnaryOp::Negative, num("3", 3.0), Loc::default()))
        ),
        parse_eqn("2^-3")
    );
}

#[test]
fn test_if_then_else() {
    assert_eq!(
        Expr0::If(var("a"), var("b"), var("c"), Loc::default()),
        parse_eqn("if a then b else c")
    );
    // nested
    assert_eq!(
        Expr0::If(
            var("a"),
            var("b"),
            Box::new(Expr0::If(var("c"), var("d"), var("e"), Loc::default())),
            Loc::default()
        ),
        parse_eqn("if a then b else if c then d else e")
    );
}

#[test]
fn test_eq_and_eqeq_both_mean_equals() {
    let expected = *binop(BinaryOp::Eq, var("a"), num("1", 1.0));
    assert_eq!(expected, parse_eqn("a = 1"));
    assert_eq!(expected, parse_eqn("a == 1"));
}

#[test]
fn test_calls() {
    assert_eq!(
        Expr0::App(
            UntypedBuiltinFn("abs".to_string(), vec![*var("a")]),
            Loc::default()
        ),
        parse_eqn("abs(a)")
    );
    assert_eq!(
        Expr0::App(
            UntypedBuiltinFn("max".to_string(), vec![*var("a"), *var("b")]),
            Loc::default()
        ),
        parse_eqn("MAX(a, b)")
    );
    assert_eq!(
        Expr0::App(UntypedBuiltinFn("pi".to_string(), vec![]), Loc::default()),
        parse_eqn("pi()")
    );
}

#[test]
fn test_zero_arity_reification() {
    // a bare `time` becomes a call in equation mode
    assert_eq!(
        Expr0::App(UntypedBuiltinFn("time".to_string(), vec![]), Loc::default()),
        parse_eqn("time")
    );
    // but not in units mode
    assert_eq!(
        Expr0::Var("time".to_string(), Loc::default()),
        parse("time", LexerType::Units).unwrap().unwrap().strip_loc()
    );
}

#[test]
fn test_subscripts() {
    assert_eq!(
        Expr0::Subscript(
            "a".to_string(),
            vec![IndexExpr0::Expr(*num("1", 1.0))],
            Loc::default()
        ),
        parse_eqn("a[1]")
    );
    assert_eq!(
        Expr0::Subscript(
            "a".to_string(),
            vec![
                IndexExpr0::Expr(*var("boston")),
                IndexExpr0::Expr(*var("pants"))
            ],
            Loc::default()
        ),
        parse_eqn("a[Boston, pants]")
    );
    assert_eq!(
        Expr0::Subscript(
            "a".to_string(),
            vec![
                IndexExpr0::Range(*num("1", 1.0), *num("3", 3.0), Loc::default()),
                IndexExpr0::Wildcard(Loc::default())
            ],
            Loc::default()
        ),
        parse_eqn("a[1:3, *]")
    );
    assert_eq!(
        Expr0::Subscript(
            "a".to_string(),
            vec![
                IndexExpr0::StarRange("sub".to_string(), Loc::default()),
                IndexExpr0::DimPosition(2, Loc::default())
            ],
            Loc::default()
        ),
        parse_eqn("a[*:sub, @2]")
    );
}

#[test]
fn test_transpose() {
    assert_eq!(
        Expr0::Op1(UnaryOp::Transpose, var("a"), Loc::default()),
        parse_eqn("a'")
    );
    // transpose of a subscripted expression
    assert_eq!(
        Expr0::Op1(
            UnaryOp::Transpose,
            Box::new(Expr0::Subscript(
                "a".to_string(),
                vec![
                    IndexExpr0::Wildcard(Loc::default()),
                    IndexExpr0::Wildcard(Loc::default())
                ],
                Loc::default()
            )),
            Loc::default()
        ),
        parse_eqn("a[*, *]'")
    );
    // transpose binds tighter than *
    assert_eq!(
        *binop(
            BinaryOp::Mul,
            Box::new(Expr0::Op1(UnaryOp::Transpose, var("a"), Loc::default())),
            var("b")
        ),
        parse_eqn("a' * b")
    );
}

#[test]
fn test_safediv_sugar() {
    assert_eq!(
        Expr0::App(
            UntypedBuiltinFn("safediv".to_string(), vec![*var("a"), *var("b")]),
            Loc::default()
        ),
        parse_eqn("a // b")
    );
}

#[test]
fn test_mod_operator() {
    assert_eq!(
        *binop(BinaryOp::Mod, var("a"), num("5", 5.0)),
        parse_eqn("a mod 5")
    );
}

#[test]
fn test_comparison_spellings() {
    let expected = *binop(BinaryOp::Neq, var("a"), var("b"));
    assert_eq!(expected, parse_eqn("a <> b"));
    assert_eq!(expected, parse_eqn("a != b"));
    assert_eq!(expected, parse_eqn("a ≠ b"));

    let expected = *binop(BinaryOp::Gte, var("a"), var("b"));
    assert_eq!(expected, parse_eqn("a >= b"));
    assert_eq!(expected, parse_eqn("a ≥ b"));
}

#[test]
fn test_errors() {
    assert_eq!(ErrorCode::UnrecognizedEof, parse_err("a +").code);
    assert_eq!(ErrorCode::UnrecognizedToken, parse_err("a + + +").code);
    assert_eq!(ErrorCode::UnrecognizedEof, parse_err("(a").code);
    assert_eq!(ErrorCode::UnrecognizedEof, parse_err("f(a").code);
    assert_eq!(ErrorCode::ExtraToken, parse_err("a b").code);
    assert_eq!(ErrorCode::UnrecognizedEof, parse_err("if a then b").code);
    assert_eq!(ErrorCode::ExpectedInteger, parse_err("a[@x]").code);
    assert_eq!(ErrorCode::ExpectedIdent, parse_err("a[*:2]").code);
    assert_eq!(ErrorCode::UnclosedComment, parse_err("a + {oops").code);
}

#[test]
fn test_error_spans() {
    // the unary + at 4 is consumed; the second + has no operand
    let err = parse_err("a + + +");
    assert_eq!(6, err.start);
    assert_eq!(7, err.end);
}

#[test]
fn test_canonicalized_identifiers() {
    assert_eq!(*var("birth_rate"), parse_eqn("\"Birth Rate\""));
    assert_eq!(*var("a·b"), parse_eqn("a.b"));
}

#[test]
fn test_trailing_comma_in_call() {
    assert_eq!(
        Expr0::App(
            UntypedBuiltinFn("max".to_string(), vec![*var("a"), *var("b")]),
            Loc::default()
        ),
        parse_eqn("max(a, b,)")
    );
}
