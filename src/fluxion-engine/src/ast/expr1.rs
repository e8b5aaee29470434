// Copyright 2025 The Fluxion Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

use super::expr0::{BinaryOp, Expr0, IndexExpr0, UnaryOp};
use crate::builtins::{walk_builtin_expr, BuiltinContents, BuiltinFn, Loc};
use crate::common::{EquationResult, Ident};
use crate::dimensions::DimensionsContext;
use crate::eqn_err;

/// IndexExpr1: subscript index after builtin resolution.
#[derive(PartialEq, Clone, Debug)]
pub enum IndexExpr1 {
    Wildcard(Loc),
    StarRange(Ident, Loc),
    Range(Expr1, Expr1, Loc),
    DimPosition(u32, Loc),
    Expr(Expr1),
}

impl IndexExpr1 {
    pub(crate) fn from(expr: IndexExpr0) -> EquationResult<Self> {
        let expr = match expr {
            IndexExpr0::Wildcard(loc) => IndexExpr1::Wildcard(loc),
            IndexExpr0::StarRange(ident, loc) => IndexExpr1::StarRange(ident, loc),
            IndexExpr0::Range(l, r, loc) => {
                IndexExpr1::Range(Expr1::from(l)?, Expr1::from(r)?, loc)
            }
            IndexExpr0::DimPosition(n, loc) => IndexExpr1::DimPosition(n, loc),
            IndexExpr0::Expr(e) => IndexExpr1::Expr(Expr1::from(e)?),
        };

        Ok(expr)
    }

    pub(crate) fn constify_dimensions(self, ctx: &DimensionsContext) -> Self {
        match self {
            IndexExpr1::Wildcard(loc) => IndexExpr1::Wildcard(loc),
            IndexExpr1::StarRange(id, loc) => IndexExpr1::StarRange(id, loc),
            IndexExpr1::Range(l, r, loc) => IndexExpr1::Range(
                l.constify_dimensions(ctx),
                r.constify_dimensions(ctx),
                loc,
            ),
            IndexExpr1::DimPosition(n, loc) => IndexExpr1::DimPosition(n, loc),
            IndexExpr1::Expr(e) => IndexExpr1::Expr(e.constify_dimensions(ctx)),
        }
    }

    pub(crate) fn get_var_loc(&self, ident: &str) -> Option<Loc> {
        match self {
            IndexExpr1::Wildcard(_) => None,
            IndexExpr1::StarRange(v, loc) => {
                if v == ident {
                    Some(*loc)
                } else {
                    None
                }
            }
            IndexExpr1::Range(l, r, _) => {
                if let Some(loc) = l.get_var_loc(ident) {
                    return Some(loc);
                }
                r.get_var_loc(ident)
            }
            IndexExpr1::DimPosition(_, _) => None,
            IndexExpr1::Expr(e) => e.get_var_loc(ident),
        }
    }
}

/// Expr1: a parsed equation after builtin function calls have been
/// checked and resolved.
#[derive(PartialEq, Clone, Debug)]
pub enum Expr1 {
    Const(String, f64, Loc),
    Var(Ident, Loc),
    App(BuiltinFn<Expr1>, Loc),
    Subscript(Ident, Vec<IndexExpr1>, Loc),
    Op1(UnaryOp, Box<Expr1>, Loc),
    Op2(BinaryOp, Box<Expr1>, Box<Expr1>, Loc),
    If(Box<Expr1>, Box<Expr1>, Box<Expr1>, Loc),
}

impl Expr1 {
    pub(crate) fn from(expr: Expr0) -> EquationResult<Self> {
        let expr = match expr {
            Expr0::Const(s, n, loc) => Expr1::Const(s, n, loc),
            Expr0::Var(id, loc) => Expr1::Var(id, loc),
            Expr0::App(crate::builtins::UntypedBuiltinFn(id, orig_args), loc) => {
                let args: EquationResult<Vec<Expr1>> =
                    orig_args.into_iter().map(Expr1::from).collect();
                let mut args = args?;

                macro_rules! check_arity {
                    ($builtin_fn:tt, 0) => {{
                        if !args.is_empty() {
                            return eqn_err!(BadBuiltinArgs, loc.start, loc.end);
                        }

                        BuiltinFn::$builtin_fn
                    }};
                    ($builtin_fn:tt, 1) => {{
                        if args.len() != 1 {
                            return eqn_err!(BadBuiltinArgs, loc.start, loc.end);
                        }

                        let a = args.remove(0);
                        BuiltinFn::$builtin_fn(Box::new(a))
                    }};
                    ($builtin_fn:tt, 2) => {{
                        if args.len() != 2 {
                            return eqn_err!(BadBuiltinArgs, loc.start, loc.end);
                        }

                        let b = args.remove(1);
                        let a = args.remove(0);
                        BuiltinFn::$builtin_fn(Box::new(a), Box::new(b))
                    }};
                    ($builtin_fn:tt, 1, 2) => {{
                        if args.len() == 1 {
                            let a = args.remove(0);
                            BuiltinFn::$builtin_fn(Box::new(a), None)
                        } else if args.len() == 2 {
                            let b = args.remove(1);
                            let a = args.remove(0);
                            BuiltinFn::$builtin_fn(Box::new(a), Some(Box::new(b)))
                        } else {
                            return eqn_err!(BadBuiltinArgs, loc.start, loc.end);
                        }
                    }};
                    ($builtin_fn:tt, 2, 3) => {{
                        if args.len() == 2 {
                            let b = args.remove(1);
                            let a = args.remove(0);
                            BuiltinFn::$builtin_fn(Box::new(a), Box::new(b), None)
                        } else if args.len() == 3 {
                            let c = args.remove(2);
                            let b = args.remove(1);
                            let a = args.remove(0);
                            BuiltinFn::$builtin_fn(Box::new(a), Box::new(b), Some(Box::new(c)))
                        } else {
                            return eqn_err!(BadBuiltinArgs, loc.start, loc.end);
                        }
                    }};
                }

                let builtin = match id.as_str() {
                    "lookup" => {
                        if args.len() != 2 {
                            return eqn_err!(BadBuiltinArgs, loc.start, loc.end);
                        }
                        if let Expr1::Var(ident, vloc) = &args[0] {
                            BuiltinFn::Lookup(ident.clone(), Box::new(args[1].clone()), *vloc)
                        } else {
                            return eqn_err!(BadTable, loc.start, loc.end);
                        }
                    }
                    "if_then_else" => {
                        if args.len() != 3 {
                            return eqn_err!(BadBuiltinArgs, loc.start, loc.end);
                        }
                        let f = args.remove(2);
                        let t = args.remove(1);
                        let cond = args.remove(0);
                        return Ok(Expr1::If(
                            Box::new(cond),
                            Box::new(t),
                            Box::new(f),
                            loc,
                        ));
                    }
                    "ismoduleinput" => {
                        if let Some(Expr1::Var(ident, vloc)) = args.first() {
                            BuiltinFn::IsModuleInput(ident.clone(), *vloc)
                        } else {
                            return eqn_err!(ExpectedIdent, loc.start, loc.end);
                        }
                    }
                    "mean" => BuiltinFn::Mean(args),
                    "rand" => {
                        if args.is_empty() {
                            BuiltinFn::Rand(None)
                        } else if args.len() == 2 {
                            let b = args.remove(1);
                            let a = args.remove(0);
                            BuiltinFn::Rand(Some((Box::new(a), Box::new(b))))
                        } else {
                            return eqn_err!(BadBuiltinArgs, loc.start, loc.end);
                        }
                    }
                    "rank" => {
                        if args.is_empty() || args.len() > 3 {
                            return eqn_err!(BadBuiltinArgs, loc.start, loc.end);
                        }
                        let c = if args.len() == 3 {
                            Some(Box::new(args.remove(2)))
                        } else {
                            None
                        };
                        let b = if args.len() == 2 {
                            Some((Box::new(args.remove(1)), c))
                        } else {
                            None
                        };
                        let a = args.remove(0);
                        BuiltinFn::Rank(Box::new(a), b)
                    }
                    "abs" => check_arity!(Abs, 1),
                    "arccos" => check_arity!(Arccos, 1),
                    "arcsin" => check_arity!(Arcsin, 1),
                    "arctan" => check_arity!(Arctan, 1),
                    "cos" => check_arity!(Cos, 1),
                    "exp" => check_arity!(Exp, 1),
                    "inf" => check_arity!(Inf, 0),
                    "int" => check_arity!(Int, 1),
                    "ln" => check_arity!(Ln, 1),
                    "log10" => check_arity!(Log10, 1),
                    "max" => check_arity!(Max, 1, 2),
                    "min" => check_arity!(Min, 1, 2),
                    "pi" => check_arity!(Pi, 0),
                    "pulse" => check_arity!(Pulse, 2, 3),
                    "ramp" => check_arity!(Ramp, 2, 3),
                    "safediv" => check_arity!(SafeDiv, 2, 3),
                    "sign" => check_arity!(Sign, 1),
                    "sin" => check_arity!(Sin, 1),
                    "sqrt" => check_arity!(Sqrt, 1),
                    "step" => check_arity!(Step, 2),
                    "tan" => check_arity!(Tan, 1),
                    "time" => check_arity!(Time, 0),
                    "time_step" | "timestep" | "dt" => check_arity!(TimeStep, 0),
                    "initial_time" | "starttime" => check_arity!(StartTime, 0),
                    "final_time" | "stoptime" => check_arity!(FinalTime, 0),
                    "size" => check_arity!(Size, 1),
                    "stddev" => check_arity!(Stddev, 1),
                    "sum" => check_arity!(Sum, 1),
                    _ => {
                        // stateful builtins were expanded into modules
                        // before this point; anything left is unknown
                        return eqn_err!(UnknownBuiltin, loc.start, loc.end);
                    }
                };
                Expr1::App(builtin, loc)
            }
            Expr0::Subscript(id, args, loc) => {
                let args: EquationResult<Vec<IndexExpr1>> =
                    args.into_iter().map(IndexExpr1::from).collect();
                Expr1::Subscript(id, args?, loc)
            }
            Expr0::Op1(op, l, loc) => Expr1::Op1(op, Box::new(Expr1::from(*l)?), loc),
            Expr0::Op2(op, l, r, loc) => Expr1::Op2(
                op,
                Box::new(Expr1::from(*l)?),
                Box::new(Expr1::from(*r)?),
                loc,
            ),
            Expr0::If(cond, t, f, loc) => Expr1::If(
                Box::new(Expr1::from(*cond)?),
                Box::new(Expr1::from(*t)?),
                Box::new(Expr1::from(*f)?),
                loc,
            ),
        };
        Ok(expr)
    }

    /// Replace references to dimension elements (`boston`,
    /// `location·boston`) with their 1-based subscript constants.
    pub(crate) fn constify_dimensions(self, ctx: &DimensionsContext) -> Self {
        match self {
            Expr1::Const(s, n, loc) => Expr1::Const(s, n, loc),
            Expr1::Var(id, loc) => {
                if let Some(off) = ctx.lookup(&id) {
                    Expr1::Const(id, off as f64, loc)
                } else {
                    Expr1::Var(id, loc)
                }
            }
            Expr1::App(func, loc) => {
                let func = match func {
                    BuiltinFn::Inf => BuiltinFn::Inf,
                    BuiltinFn::Pi => BuiltinFn::Pi,
                    BuiltinFn::Time => BuiltinFn::Time,
                    BuiltinFn::TimeStep => BuiltinFn::TimeStep,
                    BuiltinFn::StartTime => BuiltinFn::StartTime,
                    BuiltinFn::FinalTime => BuiltinFn::FinalTime,
                    BuiltinFn::IsModuleInput(id, loc) => BuiltinFn::IsModuleInput(id, loc),
                    BuiltinFn::Lookup(id, arg, vloc) => {
                        BuiltinFn::Lookup(id, Box::new(arg.constify_dimensions(ctx)), vloc)
                    }
                    BuiltinFn::Abs(a) => BuiltinFn::Abs(Box::new(a.constify_dimensions(ctx))),
                    BuiltinFn::Arccos(a) => BuiltinFn::Arccos(Box::new(a.constify_dimensions(ctx))),
                    BuiltinFn::Arcsin(a) => BuiltinFn::Arcsin(Box::new(a.constify_dimensions(ctx))),
                    BuiltinFn::Arctan(a) => BuiltinFn::Arctan(Box::new(a.constify_dimensions(ctx))),
                    BuiltinFn::Cos(a) => BuiltinFn::Cos(Box::new(a.constify_dimensions(ctx))),
                    BuiltinFn::Exp(a) => BuiltinFn::Exp(Box::new(a.constify_dimensions(ctx))),
                    BuiltinFn::Int(a) => BuiltinFn::Int(Box::new(a.constify_dimensions(ctx))),
                    BuiltinFn::Ln(a) => BuiltinFn::Ln(Box::new(a.constify_dimensions(ctx))),
                    BuiltinFn::Log10(a) => BuiltinFn::Log10(Box::new(a.constify_dimensions(ctx))),
                    BuiltinFn::Sign(a) => BuiltinFn::Sign(Box::new(a.constify_dimensions(ctx))),
                    BuiltinFn::Sin(a) => BuiltinFn::Sin(Box::new(a.constify_dimensions(ctx))),
                    BuiltinFn::Sqrt(a) => BuiltinFn::Sqrt(Box::new(a.constify_dimensions(ctx))),
                    BuiltinFn::Tan(a) => BuiltinFn::Tan(Box::new(a.constify_dimensions(ctx))),
                    BuiltinFn::Mean(args) => BuiltinFn::Mean(
                        args.into_iter()
                            .map(|arg| arg.constify_dimensions(ctx))
                            .collect(),
                    ),
                    BuiltinFn::Max(a, b) => BuiltinFn::Max(
                        Box::new(a.constify_dimensions(ctx)),
                        b.map(|expr| Box::new(expr.constify_dimensions(ctx))),
                    ),
                    BuiltinFn::Min(a, b) => BuiltinFn::Min(
                        Box::new(a.constify_dimensions(ctx)),
                        b.map(|expr| Box::new(expr.constify_dimensions(ctx))),
                    ),
                    BuiltinFn::Step(a, b) => BuiltinFn::Step(
                        Box::new(a.constify_dimensions(ctx)),
                        Box::new(b.constify_dimensions(ctx)),
                    ),
                    BuiltinFn::Pulse(a, b, c) => BuiltinFn::Pulse(
                        Box::new(a.constify_dimensions(ctx)),
                        Box::new(b.constify_dimensions(ctx)),
                        c.map(|arg| Box::new(arg.constify_dimensions(ctx))),
                    ),
                    BuiltinFn::Ramp(a, b, c) => BuiltinFn::Ramp(
                        Box::new(a.constify_dimensions(ctx)),
                        Box::new(b.constify_dimensions(ctx)),
                        c.map(|arg| Box::new(arg.constify_dimensions(ctx))),
                    ),
                    BuiltinFn::Rand(args) => BuiltinFn::Rand(args.map(|(a, b)| {
                        (
                            Box::new(a.constify_dimensions(ctx)),
                            Box::new(b.constify_dimensions(ctx)),
                        )
                    })),
                    BuiltinFn::SafeDiv(a, b, c) => BuiltinFn::SafeDiv(
                        Box::new(a.constify_dimensions(ctx)),
                        Box::new(b.constify_dimensions(ctx)),
                        c.map(|arg| Box::new(arg.constify_dimensions(ctx))),
                    ),
                    BuiltinFn::Rank(a, rest) => BuiltinFn::Rank(
                        Box::new(a.constify_dimensions(ctx)),
                        rest.map(|(b, c)| {
                            (
                                Box::new(b.constify_dimensions(ctx)),
                                c.map(|c| Box::new(c.constify_dimensions(ctx))),
                            )
                        }),
                    ),
                    BuiltinFn::Size(a) => BuiltinFn::Size(Box::new(a.constify_dimensions(ctx))),
                    BuiltinFn::Stddev(a) => BuiltinFn::Stddev(Box::new(a.constify_dimensions(ctx))),
                    BuiltinFn::Sum(a) => BuiltinFn::Sum(Box::new(a.constify_dimensions(ctx))),
                };
                Expr1::App(func, loc)
            }
            Expr1::Subscript(id, args, loc) => Expr1::Subscript(
                id,
                args.into_iter()
                    .map(|arg| arg.constify_dimensions(ctx))
                    .collect(),
                loc,
            ),
            Expr1::Op1(op, l, loc) => Expr1::Op1(op, Box::new(l.constify_dimensions(ctx)), loc),
            Expr1::Op2(op, l, r, loc) => Expr1::Op2(
                op,
                Box::new(l.constify_dimensions(ctx)),
                Box::new(r.constify_dimensions(ctx)),
                loc,
            ),
            Expr1::If(cond, l, r, loc) => Expr1::If(
                Box::new(cond.constify_dimensions(ctx)),
                Box::new(l.constify_dimensions(ctx)),
                Box::new(r.constify_dimensions(ctx)),
                loc,
            ),
        }
    }

    pub(crate) fn get_loc(&self) -> Loc {
        match self {
            Expr1::Const(_, _, loc) => *loc,
            Expr1::Var(_, loc) => *loc,
            Expr1::App(_, loc) => *loc,
            Expr1::Subscript(_, _, loc) => *loc,
            Expr1::Op1(_, _, loc) => *loc,
            Expr1::Op2(_, _, _, loc) => *loc,
            Expr1::If(_, _, _, loc) => *loc,
        }
    }

    pub(crate) fn get_var_loc(&self, ident: &str) -> Option<Loc> {
        match self {
            Expr1::Const(_s, _n, _loc) => None,
            Expr1::Var(v, loc) if v == ident => Some(*loc),
            Expr1::Var(_v, _loc) => None,
            Expr1::App(builtin, _loc) => {
                let mut loc: Option<Loc> = None;
                walk_builtin_expr(builtin, |contents| match contents {
                    BuiltinContents::Ident(id, id_loc) => {
                        if ident == id {
                            loc = Some(id_loc);
                        }
                    }
                    BuiltinContents::Expr(expr) => {
                        if loc.is_none() {
                            loc = expr.get_var_loc(ident);
                        }
                    }
                });
                loc
            }
            Expr1::Subscript(id, subscripts, loc) => {
                if id == ident {
                    let start = loc.start as usize;
                    return Some(Loc::new(start, start + id.len()));
                }
                for arg in subscripts.iter() {
                    if let Some(loc) = arg.get_var_loc(ident) {
                        return Some(loc);
                    }
                }
                None
            }
            Expr1::Op1(_op, r, _loc) => r.get_var_loc(ident),
            Expr1::Op2(_op, l, r, _loc) => l.get_var_loc(ident).or_else(|| r.get_var_loc(ident)),
            Expr1::If(cond, t, f, _loc) => cond
                .get_var_loc(ident)
                .or_else(|| t.get_var_loc(ident))
                .or_else(|| f.get_var_loc(ident)),
        }
    }
}

impl Default for Expr1 {
    fn default() -> Self {
        Expr1::Const("0.0".to_string(), 0.0, Loc::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::LexerType;

    fn parse1(eqn: &str) -> EquationResult<Expr1> {
        let expr = Expr0::new(eqn, LexerType::Equation).unwrap().unwrap();
        Expr1::from(expr)
    }

    #[test]
    fn test_builtin_resolution() {
        assert!(parse1("abs(-3)").is_ok());
        assert!(parse1("max(1, 2)").is_ok());
        assert!(parse1("max(x)").is_ok());
        assert!(parse1("pulse(1, 5, 10)").is_ok());
        assert!(parse1("pulse(1, 5)").is_ok());
        assert!(parse1("time").is_ok());
        assert!(parse1("sum(x)").is_ok());
    }

    #[test]
    fn test_bad_arity() {
        assert_eq!(
            crate::common::ErrorCode::BadBuiltinArgs,
            parse1("abs(1, 2)").unwrap_err().code
        );
        assert_eq!(
            crate::common::ErrorCode::BadBuiltinArgs,
            parse1("pi(1)").unwrap_err().code
        );
        assert_eq!(
            crate::common::ErrorCode::BadBuiltinArgs,
            parse1("pulse(1)").unwrap_err().code
        );
    }

    #[test]
    fn test_unknown_builtin() {
        assert_eq!(
            crate::common::ErrorCode::UnknownBuiltin,
            parse1("frobnicate(1)").unwrap_err().code
        );
    }

    #[test]
    fn test_if_then_else_synonym() {
        let ternary = parse1("if_then_else(c, 1, 0)").unwrap();
        assert!(matches!(ternary, Expr1::If(_, _, _, _)));
    }

    #[test]
    fn test_constify_dimensions() {
        use crate::datamodel::Dimension;
        let ctx = DimensionsContext::from(&[Dimension::Named(
            "letters".to_string(),
            vec!["a".to_string(), "b".to_string(), "c".to_string()],
        )]);

        let expr = parse1("x[b]").unwrap().constify_dimensions(&ctx);
        if let Expr1::Subscript(id, args, _) = expr {
            assert_eq!("x", id);
            assert_eq!(1, args.len());
            if let IndexExpr1::Expr(Expr1::Const(_, n, _)) = &args[0] {
                assert_eq!(2.0, *n);
            } else {
                panic!("expected constified subscript, got {:?}", args[0]);
            }
        } else {
            panic!("expected subscript");
        }
    }
}
