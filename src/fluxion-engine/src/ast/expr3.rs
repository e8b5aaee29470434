// Copyright 2025 The Fluxion Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! Stage 3: array accesses become views, array intermediates become
//! scratch temporaries.
//!
//! After this rewrite the compiler never re-walks shape logic: a
//! subscript either carries a fully precomputed `ArrayView`, or is a
//! dynamic element lookup whose indices are scalar expressions.  Array
//! arguments to reductions that aren't plain variable references are
//! evaluated element-by-element into a temporary ahead of the consuming
//! expression.

use super::array_view::{ArrayView, ViewSource};
use super::expr0::{BinaryOp, UnaryOp};
use super::expr2::{Expr2, IndexExpr2, Shape};
use crate::builtins::{BuiltinFn, Loc};
use crate::common::{EquationResult, Ident};
use crate::dimensions::DimensionsContext;
use crate::eqn_err;

#[derive(PartialEq, Clone, Debug)]
pub enum Expr3 {
    Const(String, f64, Loc),
    /// scalar variable reference, or a whole-array reference when the
    /// variable is arrayed (consumers resolve which via metadata)
    Var(Ident, Loc),
    App(BuiltinFn<Expr3>, Loc),
    /// dynamic element lookup; indices are scalar expressions producing
    /// 1-based values at runtime
    Subscript(Ident, Vec<Expr3>, Loc),
    /// subscript resolved fully at compile time
    StaticView(Ident, ArrayView, Loc),
    /// reference to a temporary filled earlier in the same equation
    TempArray(u32, ArrayView, Loc),
    Op1(UnaryOp, Box<Expr3>, Loc),
    Op2(BinaryOp, Box<Expr3>, Box<Expr3>, Loc),
    If(Box<Expr3>, Box<Expr3>, Box<Expr3>, Loc),
    /// statement: evaluate the body once per element of the view,
    /// writing results into the scratch region
    AssignTemp(u32, Box<Expr3>, ArrayView),
}

impl Expr3 {
    pub fn get_loc(&self) -> Loc {
        match self {
            Expr3::Const(_, _, loc) => *loc,
            Expr3::Var(_, loc) => *loc,
            Expr3::App(_, loc) => *loc,
            Expr3::Subscript(_, _, loc) => *loc,
            Expr3::StaticView(_, _, loc) => *loc,
            Expr3::TempArray(_, _, loc) => *loc,
            Expr3::Op1(_, _, loc) => *loc,
            Expr3::Op2(_, _, _, loc) => *loc,
            Expr3::If(_, _, _, loc) => *loc,
            Expr3::AssignTemp(_, _, _) => Loc::default(),
        }
    }
}

/// A lowered equation: zero or more temporary fills, then the value
/// expression that consumes them.
#[derive(PartialEq, Clone, Debug)]
pub struct LoweredEquation {
    pub temps: Vec<Expr3>,
    pub expr: Expr3,
}

/// Hands out non-overlapping extents of the per-step scratch region.
#[derive(Default, Debug)]
pub struct TempAllocator {
    next_id: u32,
    total_size: usize,
}

impl TempAllocator {
    pub fn alloc(&mut self, size: usize) -> (u32, usize) {
        let id = self.next_id;
        let offset = self.total_size;
        self.next_id += 1;
        self.total_size += size;
        (id, offset)
    }

    pub fn total_size(&self) -> usize {
        self.total_size
    }
}

pub struct LowerContext<'a> {
    pub dims: &'a DimensionsContext,
    pub var_shapes: &'a std::collections::HashMap<Ident, Shape>,
}

impl LowerContext<'_> {
    fn var_shape(&self, ident: &str) -> Shape {
        self.var_shapes.get(ident).cloned().unwrap_or_else(Shape::scalar)
    }
}

pub fn lower_equation(
    expr: Expr2,
    ctx: &LowerContext,
    alloc: &mut TempAllocator,
) -> EquationResult<LoweredEquation> {
    let mut temps = vec![];
    let expr = lower(expr, ctx, alloc, &mut temps)?;
    Ok(LoweredEquation { temps, expr })
}

fn lower(
    expr: Expr2,
    ctx: &LowerContext,
    alloc: &mut TempAllocator,
    temps: &mut Vec<Expr3>,
) -> EquationResult<Expr3> {
    let result = match expr {
        Expr2::Const(s, n, loc) => Expr3::Const(s, n, loc),
        Expr2::Var(id, _shape, loc) => Expr3::Var(id, loc),
        Expr2::Subscript(id, indices, _shape, loc) => {
            lower_subscript(id, indices, ctx, alloc, temps, loc)?
        }
        Expr2::Op1(UnaryOp::Transpose, e, shape, loc) => {
            if shape.is_scalar() {
                // transposing a scalar is the identity
                lower(*e, ctx, alloc, temps)?
            } else {
                let inner = lower(*e, ctx, alloc, temps)?;
                match inner {
                    Expr3::Var(id, vloc) => {
                        let base = ctx.var_shape(&id);
                        let view = contiguous_view(&base);
                        Expr3::StaticView(id, view.transpose(), vloc)
                    }
                    Expr3::StaticView(id, view, vloc) => {
                        Expr3::StaticView(id, view.transpose(), vloc)
                    }
                    Expr3::TempArray(id, view, vloc) => {
                        Expr3::TempArray(id, view.transpose(), vloc)
                    }
                    inner => {
                        // a computed array: materialize it, then read the
                        // temporary through a transposed view
                        let (id, view) = materialize(inner, &shape.transpose(), alloc, temps);
                        Expr3::TempArray(id, view.transpose(), loc)
                    }
                }
            }
        }
        Expr2::Op1(op, e, _shape, loc) => {
            let e = lower(*e, ctx, alloc, temps)?;
            Expr3::Op1(op, Box::new(e), loc)
        }
        Expr2::Op2(op, l, r, _shape, loc) => {
            let l = lower(*l, ctx, alloc, temps)?;
            let r = lower(*r, ctx, alloc, temps)?;
            Expr3::Op2(op, Box::new(l), Box::new(r), loc)
        }
        Expr2::If(cond, t, f, _shape, loc) => {
            let cond = lower(*cond, ctx, alloc, temps)?;
            let t = lower(*t, ctx, alloc, temps)?;
            let f = lower(*f, ctx, alloc, temps)?;
            Expr3::If(Box::new(cond), Box::new(t), Box::new(f), loc)
        }
        Expr2::App(builtin, _shape, loc) => {
            use BuiltinFn::*;
            let builtin: BuiltinFn<Expr3> = match builtin {
                Inf => Inf,
                Pi => Pi,
                Time => Time,
                TimeStep => TimeStep,
                StartTime => StartTime,
                FinalTime => FinalTime,
                IsModuleInput(id, iloc) => IsModuleInput(id, iloc),
                Lookup(id, a, iloc) => {
                    Lookup(id, Box::new(lower(*a, ctx, alloc, temps)?), iloc)
                }
                Abs(a) => Abs(Box::new(lower(*a, ctx, alloc, temps)?)),
                Arccos(a) => Arccos(Box::new(lower(*a, ctx, alloc, temps)?)),
                Arcsin(a) => Arcsin(Box::new(lower(*a, ctx, alloc, temps)?)),
                Arctan(a) => Arctan(Box::new(lower(*a, ctx, alloc, temps)?)),
                Cos(a) => Cos(Box::new(lower(*a, ctx, alloc, temps)?)),
                Exp(a) => Exp(Box::new(lower(*a, ctx, alloc, temps)?)),
                Int(a) => Int(Box::new(lower(*a, ctx, alloc, temps)?)),
                Ln(a) => Ln(Box::new(lower(*a, ctx, alloc, temps)?)),
                Log10(a) => Log10(Box::new(lower(*a, ctx, alloc, temps)?)),
                Sign(a) => Sign(Box::new(lower(*a, ctx, alloc, temps)?)),
                Sin(a) => Sin(Box::new(lower(*a, ctx, alloc, temps)?)),
                Sqrt(a) => Sqrt(Box::new(lower(*a, ctx, alloc, temps)?)),
                Tan(a) => Tan(Box::new(lower(*a, ctx, alloc, temps)?)),
                Step(a, b) => Step(
                    Box::new(lower(*a, ctx, alloc, temps)?),
                    Box::new(lower(*b, ctx, alloc, temps)?),
                ),
                Pulse(a, b, c) => Pulse(
                    Box::new(lower(*a, ctx, alloc, temps)?),
                    Box::new(lower(*b, ctx, alloc, temps)?),
                    lower_opt(c, ctx, alloc, temps)?,
                ),
                Ramp(a, b, c) => Ramp(
                    Box::new(lower(*a, ctx, alloc, temps)?),
                    Box::new(lower(*b, ctx, alloc, temps)?),
                    lower_opt(c, ctx, alloc, temps)?,
                ),
                Rand(args) => Rand(match args {
                    Some((a, b)) => Some((
                        Box::new(lower(*a, ctx, alloc, temps)?),
                        Box::new(lower(*b, ctx, alloc, temps)?),
                    )),
                    None => None,
                }),
                SafeDiv(a, b, c) => SafeDiv(
                    Box::new(lower(*a, ctx, alloc, temps)?),
                    Box::new(lower(*b, ctx, alloc, temps)?),
                    lower_opt(c, ctx, alloc, temps)?,
                ),

                // reductions consume an array view
                Sum(a) => Sum(Box::new(lower_array_arg(*a, ctx, alloc, temps)?)),
                Stddev(a) => Stddev(Box::new(lower_array_arg(*a, ctx, alloc, temps)?)),
                Size(a) => Size(Box::new(lower_array_arg(*a, ctx, alloc, temps)?)),
                Min(a, None) => Min(Box::new(lower_array_arg(*a, ctx, alloc, temps)?), None),
                Max(a, None) => Max(Box::new(lower_array_arg(*a, ctx, alloc, temps)?), None),
                Min(a, Some(b)) => Min(
                    Box::new(lower(*a, ctx, alloc, temps)?),
                    Some(Box::new(lower(*b, ctx, alloc, temps)?)),
                ),
                Max(a, Some(b)) => Max(
                    Box::new(lower(*a, ctx, alloc, temps)?),
                    Some(Box::new(lower(*b, ctx, alloc, temps)?)),
                ),
                Mean(args) => {
                    if args.len() == 1 && !args[0].shape().is_scalar() {
                        let arg = args.into_iter().next().unwrap();
                        Mean(vec![lower_array_arg(arg, ctx, alloc, temps)?])
                    } else {
                        let args: EquationResult<Vec<Expr3>> = args
                            .into_iter()
                            .map(|arg| lower(arg, ctx, alloc, temps))
                            .collect();
                        Mean(args?)
                    }
                }
                Rank(a, rest) => {
                    let a = Box::new(lower_array_arg(*a, ctx, alloc, temps)?);
                    let rest = match rest {
                        Some((b, c)) => {
                            let b = Box::new(lower(*b, ctx, alloc, temps)?);
                            let c = match c {
                                Some(c) => Some(Box::new(lower(*c, ctx, alloc, temps)?)),
                                None => None,
                            };
                            Some((b, c))
                        }
                        None => None,
                    };
                    Rank(a, rest)
                }
            };
            Expr3::App(builtin, loc)
        }
    };

    Ok(result)
}

fn lower_opt(
    expr: Option<Box<Expr2>>,
    ctx: &LowerContext,
    alloc: &mut TempAllocator,
    temps: &mut Vec<Expr3>,
) -> EquationResult<Option<Box<Expr3>>> {
    match expr {
        Some(e) => Ok(Some(Box::new(lower(*e, ctx, alloc, temps)?))),
        None => Ok(None),
    }
}

/// Lower the array argument of a reduction.  Plain variables and static
/// subscripts read in place; computed arrays are filled into a scratch
/// temporary first.
fn lower_array_arg(
    expr: Expr2,
    ctx: &LowerContext,
    alloc: &mut TempAllocator,
    temps: &mut Vec<Expr3>,
) -> EquationResult<Expr3> {
    let shape = expr.shape().clone();
    let lowered = lower(expr, ctx, alloc, temps)?;

    if shape.is_scalar() {
        // reducing a scalar is legal; the consumer sees it as a
        // degenerate one-element aggregate
        return Ok(lowered);
    }

    match lowered {
        Expr3::Var(id, loc) => {
            let base = ctx.var_shape(&id);
            Ok(Expr3::StaticView(id, contiguous_view(&base), loc))
        }
        lowered @ Expr3::StaticView(_, _, _) | lowered @ Expr3::TempArray(_, _, _) => Ok(lowered),
        lowered => {
            let loc = lowered.get_loc();
            let (id, view) = materialize(lowered, &shape, alloc, temps);
            Ok(Expr3::TempArray(id, view, loc))
        }
    }
}

/// Evaluate an array-valued expression into a fresh temporary, returning
/// the temporary's id and view.
fn materialize(
    expr: Expr3,
    shape: &Shape,
    alloc: &mut TempAllocator,
    temps: &mut Vec<Expr3>,
) -> (u32, ArrayView) {
    let (id, offset) = alloc.alloc(shape.size());
    let mut view = ArrayView::contiguous(
        shape.sizes(),
        shape.axes().iter().map(|a| a.name.clone()).collect(),
    );
    view.offset = offset;
    view.source = ViewSource::Temp;
    temps.push(Expr3::AssignTemp(id, Box::new(expr), view.clone()));
    (id, view)
}

fn contiguous_view(shape: &Shape) -> ArrayView {
    ArrayView::contiguous(
        shape.sizes(),
        shape.axes().iter().map(|a| a.name.clone()).collect(),
    )
}

fn lower_subscript(
    id: Ident,
    indices: Vec<IndexExpr2>,
    ctx: &LowerContext,
    alloc: &mut TempAllocator,
    temps: &mut Vec<Expr3>,
    loc: Loc,
) -> EquationResult<Expr3> {
    let base = ctx.var_shape(&id);

    let all_static = indices.iter().all(|index| {
        matches!(
            index,
            IndexExpr2::Const(_, _)
                | IndexExpr2::Wildcard(_)
                | IndexExpr2::Range(_, _, _)
                | IndexExpr2::StarRange(_, _)
                | IndexExpr2::DimPosition(_, _)
        )
    });

    if all_static {
        let dim_positions = indices
            .iter()
            .filter(|index| matches!(index, IndexExpr2::DimPosition(_, _)))
            .count();
        if dim_positions > 0 && dim_positions != indices.len() {
            // @n mixed with selections has no consistent meaning
            return eqn_err!(ArraysNotImplemented, loc.start, loc.end);
        }

        let mut view = contiguous_view(&base);

        if dim_positions > 0 {
            let order: Vec<usize> = indices
                .iter()
                .map(|index| match index {
                    IndexExpr2::DimPosition(n, _) => (*n - 1) as usize,
                    _ => unreachable!(),
                })
                .collect();
            let view = view
                .permute(&order)
                .map_err(|_| crate::common::EquationError {
                    start: loc.start,
                    end: loc.end,
                    code: crate::common::ErrorCode::MismatchedDimensions,
                })?;
            return Ok(Expr3::StaticView(id, view, loc));
        }

        // apply selections right-to-left so axis removal doesn't shift
        // the positions of indices we haven't applied yet
        for (axis, index) in indices.iter().enumerate().rev() {
            view = match index {
                IndexExpr2::Wildcard(_) => view,
                IndexExpr2::Const(k, iloc) => view.select(axis, *k).map_err(|_| {
                    crate::common::EquationError {
                        start: iloc.start,
                        end: iloc.end,
                        code: crate::common::ErrorCode::SubscriptOutOfRange,
                    }
                })?,
                IndexExpr2::Range(l, r, iloc) => view.range(axis, *l, *r).map_err(|_| {
                    crate::common::EquationError {
                        start: iloc.start,
                        end: iloc.end,
                        code: crate::common::ErrorCode::SubscriptOutOfRange,
                    }
                })?,
                IndexExpr2::StarRange(sub, iloc) => {
                    let axis_name = base.axes()[axis].name.clone();
                    if *sub == axis_name {
                        view
                    } else {
                        let offsets = ctx
                            .dims
                            .subdimension_offsets(sub, &axis_name)
                            .map(|offs| offs.to_vec());
                        match offsets {
                            Some(offsets) => view
                                .splat(axis, offsets, sub.clone())
                                .map_err(|_| crate::common::EquationError {
                                    start: iloc.start,
                                    end: iloc.end,
                                    code: crate::common::ErrorCode::MismatchedDimensions,
                                })?,
                            None => {
                                return eqn_err!(MismatchedDimensions, iloc.start, iloc.end);
                            }
                        }
                    }
                }
                IndexExpr2::DimPosition(_, _) | IndexExpr2::Expr(_) => unreachable!(),
            };
        }

        return Ok(Expr3::StaticView(id, view, loc));
    }

    // dynamic path: every index must select a single element
    let mut lowered: Vec<Expr3> = Vec::with_capacity(indices.len());
    for index in indices.into_iter() {
        match index {
            IndexExpr2::Const(k, iloc) => {
                lowered.push(Expr3::Const((k + 1).to_string(), (k + 1) as f64, iloc));
            }
            IndexExpr2::Expr(e) => {
                lowered.push(lower(e, ctx, alloc, temps)?);
            }
            IndexExpr2::Wildcard(iloc)
            | IndexExpr2::Range(_, _, iloc)
            | IndexExpr2::StarRange(_, iloc)
            | IndexExpr2::DimPosition(_, iloc) => {
                // slicing mixed with runtime indices has no lowering
                return eqn_err!(ArraysNotImplemented, iloc.start, iloc.end);
            }
        }
    }

    Ok(Expr3::Subscript(id, lowered, loc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::expr2::{Axis, ShapeContext};
    use crate::ast::{Expr0, Expr1};
    use crate::datamodel::Dimension;
    use crate::token::LexerType;
    use std::collections::HashMap;

    fn shape2(d1: usize, d2: usize) -> Shape {
        Shape::new(vec![
            Axis {
                name: "d1".to_string(),
                indexed: false,
                size: d1,
            },
            Axis {
                name: "d2".to_string(),
                indexed: false,
                size: d2,
            },
        ])
    }

    fn lower_str(eqn: &str, var_shapes: &HashMap<String, Shape>) -> LoweredEquation {
        let dims = DimensionsContext::from(&[
            Dimension::Named(
                "d1".to_string(),
                vec!["e1".to_string(), "e2".to_string()],
            ),
            Dimension::Named(
                "d2".to_string(),
                vec!["f1".to_string(), "f2".to_string(), "f3".to_string()],
            ),
        ]);
        let expr0 = Expr0::new(eqn, LexerType::Equation).unwrap().unwrap();
        let expr1 = Expr1::from(expr0).unwrap().constify_dimensions(&dims);
        let shape_ctx = ShapeContext {
            var_shapes,
            dims: &dims,
        };
        let expr2 = Expr2::from(expr1, &shape_ctx).unwrap();
        let lower_ctx = LowerContext {
            dims: &dims,
            var_shapes,
        };
        let mut alloc = TempAllocator::default();
        lower_equation(expr2, &lower_ctx, &mut alloc).unwrap()
    }

    #[test]
    fn test_static_element_selection() {
        let mut shapes = HashMap::new();
        shapes.insert("a".to_string(), shape2(2, 3));

        let lowered = lower_str("a[e2, f1]", &shapes);
        assert!(lowered.temps.is_empty());
        if let Expr3::StaticView(id, view, _) = lowered.expr {
            assert_eq!("a", id);
            assert_eq!(0, view.ndim());
            assert_eq!(3, view.offset);
        } else {
            panic!("expected static view, got {:?}", lowered.expr);
        }
    }

    #[test]
    fn test_transpose_is_a_view() {
        let mut shapes = HashMap::new();
        shapes.insert("a".to_string(), shape2(2, 3));

        let lowered = lower_str("a'", &shapes);
        assert!(lowered.temps.is_empty());
        if let Expr3::StaticView(_, view, _) = lowered.expr {
            assert_eq!(vec![3, 2], view.dims);
            assert_eq!(vec![1, 3], view.strides);
        } else {
            panic!("expected static view, got {:?}", lowered.expr);
        }
    }

    #[test]
    fn test_reduction_of_var_needs_no_temp() {
        let mut shapes = HashMap::new();
        shapes.insert("x".to_string(), shape2(2, 3));

        let lowered = lower_str("sum(x)", &shapes);
        assert!(lowered.temps.is_empty());
        if let Expr3::App(BuiltinFn::Sum(arg), _) = lowered.expr {
            assert!(matches!(*arg, Expr3::StaticView(_, _, _)));
        } else {
            panic!("expected sum app");
        }
    }

    #[test]
    fn test_reduction_of_computed_array_uses_temp() {
        let mut shapes = HashMap::new();
        shapes.insert("x".to_string(), shape2(2, 3));

        let lowered = lower_str("sum(x * 2)", &shapes);
        assert_eq!(1, lowered.temps.len());
        assert!(matches!(lowered.temps[0], Expr3::AssignTemp(0, _, _)));
        if let Expr3::App(BuiltinFn::Sum(arg), _) = lowered.expr {
            if let Expr3::TempArray(id, view, _) = &*arg {
                assert_eq!(0, *id);
                assert_eq!(6, view.size());
                assert_eq!(ViewSource::Temp, view.source);
            } else {
                panic!("expected temp array");
            }
        } else {
            panic!("expected sum app");
        }
    }

    #[test]
    fn test_dynamic_subscript() {
        let mut shapes = HashMap::new();
        shapes.insert(
            "x".to_string(),
            Shape::new(vec![Axis {
                name: "d2".to_string(),
                indexed: false,
                size: 3,
            }]),
        );

        let lowered = lower_str("x[int(time) + 1]", &shapes);
        assert!(lowered.temps.is_empty());
        assert!(matches!(lowered.expr, Expr3::Subscript(_, _, _)));
    }

    #[test]
    fn test_range_subscript() {
        let mut shapes = HashMap::new();
        shapes.insert(
            "x".to_string(),
            Shape::new(vec![Axis {
                name: "d2".to_string(),
                indexed: false,
                size: 3,
            }]),
        );

        let lowered = lower_str("sum(x[1:2])", &shapes);
        if let Expr3::App(BuiltinFn::Sum(arg), _) = lowered.expr {
            if let Expr3::StaticView(_, view, _) = &*arg {
                assert_eq!(vec![2], view.dims);
            } else {
                panic!("expected static view");
            }
        } else {
            panic!("expected sum app");
        }
    }
}
