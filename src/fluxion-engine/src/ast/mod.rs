// Copyright 2025 The Fluxion Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! The staged equation AST.
//!
//! Equations move through three progressive rewrites on their way to the
//! compiler: Expr0 (parsed, untyped), Expr1 (builtins resolved, dimension
//! names constified), Expr2 (array bounds inferred and checked), Expr3
//! (subscripts resolved to views, array intermediates assigned scratch
//! temporaries).

pub mod array_view;
pub mod expr0;
pub mod expr1;
pub mod expr2;
pub mod expr3;

pub use expr0::{BinaryOp, Expr0, IndexExpr0, UnaryOp};
pub use expr1::{Expr1, IndexExpr1};
pub use expr2::{Axis, Expr2, IndexExpr2, Shape};
pub use expr3::{Expr3, LoweredEquation};

pub use crate::builtins::Loc;
use crate::builtins::UntypedBuiltinFn;
use crate::common::{ElementName, EquationResult};
use crate::datamodel::Dimension;
use crate::dimensions::DimensionsContext;
use std::collections::HashMap;

/// An equation is scalar, apply-to-all arrayed (one expression for every
/// element), or explicitly arrayed (one expression per subscript tuple).
#[derive(Clone, PartialEq, Debug)]
pub enum Ast<T> {
    Scalar(T),
    ApplyToAll(Vec<Dimension>, T),
    Arrayed(Vec<Dimension>, HashMap<ElementName, T>),
}

impl<T> Ast<T> {
    pub fn dimensions(&self) -> Option<&[Dimension]> {
        match self {
            Ast::Scalar(_) => None,
            Ast::ApplyToAll(dims, _) | Ast::Arrayed(dims, _) => Some(dims),
        }
    }
}

impl Ast<Expr1> {
    pub(crate) fn get_var_loc(&self, ident: &str) -> Option<Loc> {
        match self {
            Ast::Scalar(expr) => expr.get_var_loc(ident),
            Ast::ApplyToAll(_, expr) => expr.get_var_loc(ident),
            Ast::Arrayed(_, subscripts) => {
                for expr in subscripts.values() {
                    if let Some(loc) = expr.get_var_loc(ident) {
                        return Some(loc);
                    }
                }
                None
            }
        }
    }
}

/// Promote a parsed equation to stage 1: resolve builtin calls and turn
/// dimension/element name references into constants.
pub(crate) fn lower_ast(ctx: &DimensionsContext, ast: Ast<Expr0>) -> EquationResult<Ast<Expr1>> {
    match ast {
        Ast::Scalar(expr) => Expr1::from(expr)
            .map(|expr| expr.constify_dimensions(ctx))
            .map(Ast::Scalar),
        Ast::ApplyToAll(dims, expr) => Expr1::from(expr)
            .map(|expr| expr.constify_dimensions(ctx))
            .map(|expr| Ast::ApplyToAll(dims, expr)),
        Ast::Arrayed(dims, elements) => {
            let elements: EquationResult<HashMap<ElementName, Expr1>> = elements
                .into_iter()
                .map(
                    |(id, expr)| match Expr1::from(expr).map(|e| e.constify_dimensions(ctx)) {
                        Ok(expr) => Ok((id, expr)),
                        Err(err) => Err(err),
                    },
                )
                .collect();
            elements.map(|elements| Ast::Arrayed(dims, elements))
        }
    }
}

macro_rules! child_needs_parens(
    ($expr:tt, $parent:expr, $child:expr) => {{
        match $parent {
            // no children, doesn't matter
            $expr::Const(_, _, _) | $expr::Var(_, _) => false,
            // children are comma separated, no ambiguity possible
            $expr::App(_, _) | $expr::Subscript(_, _, _) => false,
            $expr::Op1(_, _, _) => matches!($child, $expr::Op2(_, _, _, _)),
            $expr::Op2(parent_op, _, _, _) => match $child {
                $expr::Const(_, _, _)
                | $expr::Var(_, _)
                | $expr::App(_, _)
                | $expr::Subscript(_, _, _)
                | $expr::If(_, _, _, _)
                | $expr::Op1(_, _, _) => false,
                $expr::Op2(child_op, _, _, _) => {
                    parent_op.precedence() > child_op.precedence()
                }
            },
            $expr::If(_, _, _, _) => false,
        }
    }}
);

fn paren_if_necessary(parent: &Expr0, child: &Expr0, eqn: String) -> String {
    if child_needs_parens!(Expr0, parent, child) {
        format!("({})", eqn)
    } else {
        eqn
    }
}

struct PrintVisitor {}

impl PrintVisitor {
    fn walk_index(&mut self, expr: &IndexExpr0) -> String {
        match expr {
            IndexExpr0::Wildcard(_) => "*".to_string(),
            IndexExpr0::StarRange(id, _) => format!("*:{}", id),
            IndexExpr0::Range(l, r, _) => format!("{}:{}", self.walk(l), self.walk(r)),
            IndexExpr0::DimPosition(n, _) => format!("@{}", n),
            IndexExpr0::Expr(e) => self.walk(e),
        }
    }

    fn walk(&mut self, expr: &Expr0) -> String {
        match expr {
            Expr0::Const(s, _, _) => s.clone(),
            Expr0::Var(id, _) => id.clone(),
            Expr0::App(UntypedBuiltinFn(func, args), _) => {
                let args: Vec<String> = args.iter().map(|e| self.walk(e)).collect();
                format!("{}({})", func, args.join(", "))
            }
            Expr0::Subscript(id, args, _) => {
                let args: Vec<String> = args.iter().map(|e| self.walk_index(e)).collect();
                format!("{}[{}]", id, args.join(", "))
            }
            Expr0::Op1(op, l, _) => {
                let l = paren_if_necessary(expr, l, self.walk(l));
                match op {
                    UnaryOp::Positive => format!("+{}", l),
                    UnaryOp::Negative => format!("-{}", l),
                    UnaryOp::Not => format!("!{}", l),
                    UnaryOp::Transpose => format!("{}'", l),
                }
            }
            Expr0::Op2(op, l, r, _) => {
                let l = paren_if_necessary(expr, l, self.walk(l));
                let r = paren_if_necessary(expr, r, self.walk(r));
                let op: &str = match op {
                    BinaryOp::Add => "+",
                    BinaryOp::Sub => "-",
                    BinaryOp::Exp => "^",
                    BinaryOp::Mul => "*",
                    BinaryOp::Div => "/",
                    BinaryOp::Mod => "mod",
                    BinaryOp::Gt => ">",
                    BinaryOp::Lt => "<",
                    BinaryOp::Gte => ">=",
                    BinaryOp::Lte => "<=",
                    BinaryOp::Eq => "=",
                    BinaryOp::Neq => "<>",
                    BinaryOp::And => "and",
                    BinaryOp::Or => "or",
                };
                format!("{} {} {}", l, op, r)
            }
            Expr0::If(cond, t, f, _) => {
                let cond = self.walk(cond);
                let t = self.walk(t);
                let f = self.walk(f);
                format!("if ({}) then ({}) else ({})", cond, t, f)
            }
        }
    }
}

/// Render an Expr0 back into equation source.  Used when module expansion
/// hoists computed arguments into synthesized variables.
pub fn print_eqn(expr: &Expr0) -> String {
    let mut visitor = PrintVisitor {};
    visitor.walk(expr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_print_eqn() {
        assert_eq!(
            "a + b",
            print_eqn(&Expr0::Op2(
                BinaryOp::Add,
                Box::new(Expr0::Var("a".to_string(), Loc::new(0, 1))),
                Box::new(Expr0::Var("b".to_string(), Loc::new(4, 5))),
                Loc::new(0, 5),
            ))
        );
        assert_eq!(
            "a + b * c",
            print_eqn(&Expr0::Op2(
                BinaryOp::Add,
                Box::new(Expr0::Var("a".to_string(), Loc::default())),
                Box::new(Expr0::Op2(
                    BinaryOp::Mul,
                    Box::new(Expr0::Var("b".to_string(), Loc::default())),
                    Box::new(Expr0::Var("c".to_owned(), Loc::default())),
                    Loc::default()
                )),
                Loc::default(),
            ))
        );
        assert_eq!(
            "a * (b + c)",
            print_eqn(&Expr0::Op2(
                BinaryOp::Mul,
                Box::new(Expr0::Var("a".to_string(), Loc::default())),
                Box::new(Expr0::Op2(
                    BinaryOp::Add,
                    Box::new(Expr0::Var("b".to_string(), Loc::default())),
                    Box::new(Expr0::Var("c".to_owned(), Loc::default())),
                    Loc::default()
                )),
                Loc::default(),
            ))
        );
    }

    #[test]
    fn test_print_transpose() {
        assert_eq!(
            "a' + b",
            print_eqn(&Expr0::Op2(
                BinaryOp::Add,
                Box::new(Expr0::Op1(
                    UnaryOp::Transpose,
                    Box::new(Expr0::Var("a".to_string(), Loc::default())),
                    Loc::default()
                )),
                Box::new(Expr0::Var("b".to_string(), Loc::default())),
                Loc::default(),
            ))
        );
    }

    #[test]
    fn test_print_subscript() {
        assert_eq!(
            "a[1:3, *, @2]",
            print_eqn(&Expr0::Subscript(
                "a".to_string(),
                vec![
                    IndexExpr0::Range(
                        Expr0::Const("1".to_string(), 1.0, Loc::default()),
                        Expr0::Const("3".to_string(), 3.0, Loc::default()),
                        Loc::default()
                    ),
                    IndexExpr0::Wildcard(Loc::default()),
                    IndexExpr0::DimPosition(2, Loc::default()),
                ],
                Loc::default(),
            ))
        );
    }
}
