// Copyright 2025 The Fluxion Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

use crate::common::Ident;

/// Loc describes a location in an equation's source text as [start, end)
/// byte offsets.
#[derive(PartialEq, Eq, Clone, Copy, Default, Debug)]
pub struct Loc {
    pub start: u16,
    pub end: u16,
}

impl Loc {
    pub fn new(start: usize, end: usize) -> Self {
        Loc {
            start: start as u16,
            end: end as u16,
        }
    }

    /// union returns a Loc that spans both self and other.
    pub fn union(&self, other: &Self) -> Self {
        Loc {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

/// A function call as the parser sees it: just a name and positional
/// arguments.  Builtins are recognized later, at type-check time.
#[derive(PartialEq, Clone, Debug)]
pub struct UntypedBuiltinFn<Expr>(pub Ident, pub Vec<Expr>);

/// The closed set of builtin functions, shared (generic over the
/// expression type) by every stage of the AST and by the compiler's IR.
#[derive(PartialEq, Clone, Debug)]
pub enum BuiltinFn<Expr> {
    Lookup(Ident, Box<Expr>, Loc),
    Abs(Box<Expr>),
    Arccos(Box<Expr>),
    Arcsin(Box<Expr>),
    Arctan(Box<Expr>),
    Cos(Box<Expr>),
    Exp(Box<Expr>),
    Inf,
    Int(Box<Expr>),
    IsModuleInput(Ident, Loc),
    Ln(Box<Expr>),
    Log10(Box<Expr>),
    Max(Box<Expr>, Option<Box<Expr>>),
    Mean(Vec<Expr>),
    Min(Box<Expr>, Option<Box<Expr>>),
    Pi,
    Pulse(Box<Expr>, Box<Expr>, Option<Box<Expr>>),
    Ramp(Box<Expr>, Box<Expr>, Option<Box<Expr>>),
    Rand(Option<(Box<Expr>, Box<Expr>)>),
    SafeDiv(Box<Expr>, Box<Expr>, Option<Box<Expr>>),
    Sign(Box<Expr>),
    Sin(Box<Expr>),
    Sqrt(Box<Expr>),
    Step(Box<Expr>, Box<Expr>),
    Tan(Box<Expr>),
    Time,
    TimeStep,
    StartTime,
    FinalTime,
    // array reductions; their argument is array-valued
    Rank(Box<Expr>, Option<(Box<Expr>, Option<Box<Expr>>)>),
    Size(Box<Expr>),
    Stddev(Box<Expr>),
    Sum(Box<Expr>),
}

impl<Expr> BuiltinFn<Expr> {
    pub fn name(&self) -> &'static str {
        use BuiltinFn::*;
        match self {
            Lookup(_, _, _) => "lookup",
            Abs(_) => "abs",
            Arccos(_) => "arccos",
            Arcsin(_) => "arcsin",
            Arctan(_) => "arctan",
            Cos(_) => "cos",
            Exp(_) => "exp",
            Inf => "inf",
            Int(_) => "int",
            IsModuleInput(_, _) => "ismoduleinput",
            Ln(_) => "ln",
            Log10(_) => "log10",
            Max(_, _) => "max",
            Mean(_) => "mean",
            Min(_, _) => "min",
            Pi => "pi",
            Pulse(_, _, _) => "pulse",
            Ramp(_, _, _) => "ramp",
            Rand(_) => "rand",
            SafeDiv(_, _, _) => "safediv",
            Sign(_) => "sign",
            Sin(_) => "sin",
            Sqrt(_) => "sqrt",
            Step(_, _) => "step",
            Tan(_) => "tan",
            Time => "time",
            TimeStep => "time_step",
            StartTime => "initial_time",
            FinalTime => "final_time",
            Rank(_, _) => "rank",
            Size(_) => "size",
            Stddev(_) => "stddev",
            Sum(_) => "sum",
        }
    }
}

/// 0-arity builtins are callable without parens in equations: `TIME`,
/// `pi`, etc.  The parser reifies bare references to them into calls.
pub fn is_0_arity_builtin_fn(name: &str) -> bool {
    matches!(
        name,
        "inf" | "pi" | "time" | "time_step" | "timestep" | "dt" | "initial_time" | "starttime"
            | "final_time" | "stoptime" | "rand"
    )
}

pub fn is_builtin_fn(name: &str) -> bool {
    matches!(
        name,
        "lookup"
            | "abs"
            | "arccos"
            | "arcsin"
            | "arctan"
            | "cos"
            | "exp"
            | "inf"
            | "int"
            | "if_then_else"
            | "ismoduleinput"
            | "ln"
            | "log10"
            | "max"
            | "mean"
            | "min"
            | "pi"
            | "pulse"
            | "ramp"
            | "rand"
            | "safediv"
            | "sign"
            | "sin"
            | "sqrt"
            | "step"
            | "tan"
            | "time"
            | "time_step"
            | "timestep"
            | "dt"
            | "initial_time"
            | "starttime"
            | "final_time"
            | "stoptime"
            | "rank"
            | "size"
            | "stddev"
            | "sum"
    )
}

/// Stateful builtins don't have a direct implementation; they expand into
/// instances of stdlib models (see builtins_visitor).
pub fn is_stateful_builtin_fn(name: &str) -> bool {
    matches!(
        name,
        "smooth" | "smth1" | "smth3" | "delay" | "delay1" | "delay3" | "trend" | "init"
            | "previous"
    )
}

pub enum BuiltinContents<'a, Expr> {
    Ident(&'a str, Loc),
    Expr(&'a Expr),
}

/// walk_builtin_expr visits the contents of a builtin call: identifiers
/// for the table/module-input forms, child expressions for everything
/// else.
pub fn walk_builtin_expr<'a, Expr, F>(builtin: &'a BuiltinFn<Expr>, mut cb: F)
where
    F: FnMut(BuiltinContents<'a, Expr>),
{
    use BuiltinContents::{Expr, Ident};
    match builtin {
        BuiltinFn::Inf
        | BuiltinFn::Pi
        | BuiltinFn::Time
        | BuiltinFn::TimeStep
        | BuiltinFn::StartTime
        | BuiltinFn::FinalTime => {}
        BuiltinFn::IsModuleInput(id, loc) => cb(Ident(id, *loc)),
        BuiltinFn::Lookup(id, a, loc) => {
            cb(Ident(id, *loc));
            cb(Expr(a));
        }
        BuiltinFn::Abs(a)
        | BuiltinFn::Arccos(a)
        | BuiltinFn::Arcsin(a)
        | BuiltinFn::Arctan(a)
        | BuiltinFn::Cos(a)
        | BuiltinFn::Exp(a)
        | BuiltinFn::Int(a)
        | BuiltinFn::Ln(a)
        | BuiltinFn::Log10(a)
        | BuiltinFn::Sign(a)
        | BuiltinFn::Sin(a)
        | BuiltinFn::Sqrt(a)
        | BuiltinFn::Tan(a)
        | BuiltinFn::Size(a)
        | BuiltinFn::Stddev(a)
        | BuiltinFn::Sum(a) => cb(Expr(a)),
        BuiltinFn::Mean(args) => {
            args.iter().for_each(|a| cb(Expr(a)));
        }
        BuiltinFn::Max(a, b) | BuiltinFn::Min(a, b) => {
            cb(Expr(a));
            if let Some(b) = b {
                cb(Expr(b));
            }
        }
        BuiltinFn::Step(a, b) => {
            cb(Expr(a));
            cb(Expr(b));
        }
        BuiltinFn::Pulse(a, b, c) | BuiltinFn::Ramp(a, b, c) | BuiltinFn::SafeDiv(a, b, c) => {
            cb(Expr(a));
            cb(Expr(b));
            if let Some(c) = c {
                cb(Expr(c));
            }
        }
        BuiltinFn::Rand(args) => {
            if let Some((a, b)) = args {
                cb(Expr(a));
                cb(Expr(b));
            }
        }
        BuiltinFn::Rank(a, rest) => {
            cb(Expr(a));
            if let Some((b, c)) = rest {
                cb(Expr(b));
                if let Some(c) = c {
                    cb(Expr(c));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_builtin_fn() {
        assert!(is_builtin_fn("lookup"));
        assert!(is_builtin_fn("sum"));
        assert!(is_builtin_fn("sign"));
        assert!(!is_builtin_fn("lookupz"));
        assert!(!is_builtin_fn("smth1"));
    }

    #[test]
    fn test_is_0_arity_builtin_fn() {
        assert!(!is_0_arity_builtin_fn("lookup"));
        assert!(is_0_arity_builtin_fn("time"));
        assert!(is_0_arity_builtin_fn("dt"));
        assert!(is_0_arity_builtin_fn("rand"));
    }

    #[test]
    fn test_is_stateful_builtin_fn() {
        assert!(is_stateful_builtin_fn("smth3"));
        assert!(is_stateful_builtin_fn("previous"));
        assert!(!is_stateful_builtin_fn("sum"));
    }

    #[test]
    fn test_loc_union() {
        let a = Loc::new(3, 7);
        let b = Loc::new(5, 12);
        assert_eq!(Loc::new(3, 12), a.union(&b));
    }
}
