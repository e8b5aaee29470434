// Copyright 2025 The Fluxion Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

use std::collections::HashMap;

use super::expr0::{BinaryOp, UnaryOp};
use super::expr1::{Expr1, IndexExpr1};
use crate::builtins::{BuiltinFn, Loc};
use crate::common::{DimensionName, EquationResult, Ident};
use crate::datamodel::Dimension;
use crate::dimensions::DimensionsContext;
use crate::eqn_err;

/// One axis of an array-valued expression.  `indexed` axes (from indexed
/// dimensions, ranges, or anonymous intermediates) may match other axes
/// by size; named axes only ever match by name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Axis {
    pub name: DimensionName,
    pub indexed: bool,
    pub size: usize,
}

/// The array bounds of an expression: a (possibly empty) ordered list of
/// axes.  Empty means scalar.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Shape {
    axes: Vec<Axis>,
}

impl Shape {
    pub fn new(axes: Vec<Axis>) -> Self {
        Shape { axes }
    }

    pub fn scalar() -> Self {
        Shape { axes: vec![] }
    }

    pub fn from_dims(dims: &[Dimension]) -> Self {
        Shape {
            axes: dims
                .iter()
                .map(|dim| Axis {
                    name: crate::common::canonicalize(dim.name()),
                    indexed: matches!(dim, Dimension::Indexed(_, _)),
                    size: dim.len(),
                })
                .collect(),
        }
    }

    pub fn is_scalar(&self) -> bool {
        self.axes.is_empty()
    }

    pub fn ndim(&self) -> usize {
        self.axes.len()
    }

    pub fn size(&self) -> usize {
        self.axes.iter().map(|a| a.size).product()
    }

    pub fn axes(&self) -> &[Axis] {
        &self.axes
    }

    pub fn sizes(&self) -> Vec<usize> {
        self.axes.iter().map(|a| a.size).collect()
    }

    pub fn names(&self) -> Vec<&str> {
        self.axes.iter().map(|a| a.name.as_str()).collect()
    }

    pub fn transpose(&self) -> Shape {
        let mut axes = self.axes.clone();
        axes.reverse();
        Shape { axes }
    }

    /// The n-dimensional matching algorithm for element-wise operands:
    /// for each source axis find a target axis with the same name; if
    /// none and both are indexed, match by size; anything left over
    /// broadcasts by appending a new axis to the result.  Matching is
    /// bijective; a named source axis that matches a target axis with a
    /// different size is an error (that is a subdimension, not a match).
    pub fn unify(&self, other: &Shape, loc: Loc) -> EquationResult<Shape> {
        if self.is_scalar() {
            return Ok(other.clone());
        }
        if other.is_scalar() {
            return Ok(self.clone());
        }

        // the higher-rank operand anchors the result
        let (target, source) = if self.ndim() >= other.ndim() {
            (self, other)
        } else {
            (other, self)
        };

        let mut matched = vec![false; target.axes.len()];
        let mut extra: Vec<Axis> = vec![];

        for src in source.axes.iter() {
            // (a) match by name
            let by_name = target
                .axes
                .iter()
                .enumerate()
                .find(|(i, t)| !matched[*i] && !src.name.is_empty() && t.name == src.name);
            if let Some((i, t)) = by_name {
                if t.size != src.size {
                    return eqn_err!(MismatchedDimensions, loc.start, loc.end);
                }
                matched[i] = true;
                continue;
            }

            // (b) indexed axes match by size
            if src.indexed {
                let by_size = target
                    .axes
                    .iter()
                    .enumerate()
                    .find(|(i, t)| !matched[*i] && t.indexed && t.size == src.size);
                if let Some((i, _)) = by_size {
                    matched[i] = true;
                    continue;
                }
            }

            // (c) broadcast: the source axis becomes a fresh result axis
            if target.axes.iter().any(|t| t.name == src.name) && !src.name.is_empty() {
                // same name already claimed by another source axis
                return eqn_err!(MismatchedDimensions, loc.start, loc.end);
            }
            extra.push(src.clone());
        }

        let mut axes = target.axes.clone();
        axes.extend(extra);
        Ok(Shape { axes })
    }
}

/// Subscript index with static parts resolved.  Offsets are 0-based from
/// here on; the 1-based convention is purely a surface-syntax thing.
#[derive(PartialEq, Clone, Debug)]
pub enum IndexExpr2 {
    Wildcard(Loc),
    StarRange(Ident, Loc),
    /// inclusive, 0-based
    Range(usize, usize, Loc),
    DimPosition(u32, Loc),
    /// static single-element selection, 0-based
    Const(usize, Loc),
    /// dynamic index, evaluated at runtime
    Expr(Expr2),
}

/// Expr2: a bounds-annotated expression.  Every node knows its shape.
#[derive(PartialEq, Clone, Debug)]
pub enum Expr2 {
    Const(String, f64, Loc),
    Var(Ident, Shape, Loc),
    App(BuiltinFn<Expr2>, Shape, Loc),
    Subscript(Ident, Vec<IndexExpr2>, Shape, Loc),
    Op1(UnaryOp, Box<Expr2>, Shape, Loc),
    Op2(BinaryOp, Box<Expr2>, Box<Expr2>, Shape, Loc),
    If(Box<Expr2>, Box<Expr2>, Box<Expr2>, Shape, Loc),
}

/// Context for shape inference: the declared shape of every variable in
/// the model, plus the project's dimensions.
pub struct ShapeContext<'a> {
    pub var_shapes: &'a HashMap<Ident, Shape>,
    pub dims: &'a DimensionsContext,
}

impl Expr2 {
    pub fn shape(&self) -> &Shape {
        static SCALAR: once_shape::OnceShape = once_shape::OnceShape::new();
        match self {
            Expr2::Const(_, _, _) => SCALAR.get(),
            Expr2::Var(_, shape, _) => shape,
            Expr2::App(_, shape, _) => shape,
            Expr2::Subscript(_, _, shape, _) => shape,
            Expr2::Op1(_, _, shape, _) => shape,
            Expr2::Op2(_, _, _, shape, _) => shape,
            Expr2::If(_, _, _, shape, _) => shape,
        }
    }

    pub fn get_loc(&self) -> Loc {
        match self {
            Expr2::Const(_, _, loc) => *loc,
            Expr2::Var(_, _, loc) => *loc,
            Expr2::App(_, _, loc) => *loc,
            Expr2::Subscript(_, _, _, loc) => *loc,
            Expr2::Op1(_, _, _, loc) => *loc,
            Expr2::Op2(_, _, _, _, loc) => *loc,
            Expr2::If(_, _, _, _, loc) => *loc,
        }
    }

    pub fn from(expr: Expr1, ctx: &ShapeContext) -> EquationResult<Self> {
        let result = match expr {
            Expr1::Const(s, n, loc) => Expr2::Const(s, n, loc),
            Expr1::Var(id, loc) => {
                let shape = ctx.var_shapes.get(&id).cloned().unwrap_or_else(Shape::scalar);
                Expr2::Var(id, shape, loc)
            }
            Expr1::App(builtin, loc) => {
                let (builtin, shape) = Self::infer_builtin(builtin, ctx, loc)?;
                Expr2::App(builtin, shape, loc)
            }
            Expr1::Subscript(id, indices, loc) => {
                let base = ctx.var_shapes.get(&id).cloned().unwrap_or_else(Shape::scalar);
                if base.is_scalar() {
                    return eqn_err!(MismatchedDimensions, loc.start, loc.end);
                }
                if indices.len() != base.ndim() {
                    return eqn_err!(MismatchedDimensions, loc.start, loc.end);
                }

                let mut result_axes: Vec<Axis> = vec![];
                let mut lowered: Vec<IndexExpr2> = Vec::with_capacity(indices.len());
                for (i, index) in indices.into_iter().enumerate() {
                    let axis = &base.axes()[i];
                    match index {
                        IndexExpr1::Wildcard(iloc) => {
                            result_axes.push(axis.clone());
                            lowered.push(IndexExpr2::Wildcard(iloc));
                        }
                        IndexExpr1::StarRange(sub, iloc) => {
                            let sub_dim = match ctx.dims.get(&sub) {
                                Some(dim) => dim,
                                None => {
                                    return eqn_err!(BadDimensionName, iloc.start, iloc.end);
                                }
                            };
                            let legal = sub == axis.name
                                || ctx.dims.is_subdimension_of(&sub, &axis.name);
                            if !legal {
                                return eqn_err!(MismatchedDimensions, iloc.start, iloc.end);
                            }
                            result_axes.push(Axis {
                                name: sub.clone(),
                                indexed: matches!(sub_dim, Dimension::Indexed(_, _)),
                                size: sub_dim.len(),
                            });
                            lowered.push(IndexExpr2::StarRange(sub, iloc));
                        }
                        IndexExpr1::Range(l, r, iloc) => {
                            let (l, r) = match (const_index(&l), const_index(&r)) {
                                (Some(l), Some(r)) => (l, r),
                                // dynamic range bounds don't have a
                                // lowering; reject them explicitly
                                _ => {
                                    return eqn_err!(ArraysNotImplemented, iloc.start, iloc.end);
                                }
                            };
                            if l < 1 || r < l || r > axis.size {
                                return eqn_err!(SubscriptOutOfRange, iloc.start, iloc.end);
                            }
                            result_axes.push(Axis {
                                name: axis.name.clone(),
                                indexed: true,
                                size: r - l + 1,
                            });
                            lowered.push(IndexExpr2::Range(l - 1, r - 1, iloc));
                        }
                        IndexExpr1::DimPosition(n, iloc) => {
                            if n < 1 || n as usize > base.ndim() {
                                return eqn_err!(MismatchedDimensions, iloc.start, iloc.end);
                            }
                            result_axes.push(base.axes()[(n - 1) as usize].clone());
                            lowered.push(IndexExpr2::DimPosition(n, iloc));
                        }
                        IndexExpr1::Expr(e) => {
                            let iloc = e.get_loc();
                            if let Some(k) = const_index(&e) {
                                if k < 1 || k > axis.size {
                                    return eqn_err!(SubscriptOutOfRange, iloc.start, iloc.end);
                                }
                                lowered.push(IndexExpr2::Const(k - 1, iloc));
                            } else {
                                let e = Expr2::from(e, ctx)?;
                                if !e.shape().is_scalar() {
                                    return eqn_err!(MismatchedDimensions, iloc.start, iloc.end);
                                }
                                lowered.push(IndexExpr2::Expr(e));
                            }
                        }
                    }
                }

                Expr2::Subscript(id, lowered, Shape::new(result_axes), loc)
            }
            Expr1::Op1(op, e, loc) => {
                let e = Box::new(Self::from(*e, ctx)?);
                let shape = match op {
                    UnaryOp::Transpose => e.shape().transpose(),
                    _ => e.shape().clone(),
                };
                Expr2::Op1(op, e, shape, loc)
            }
            Expr1::Op2(op, l, r, loc) => {
                let l = Box::new(Self::from(*l, ctx)?);
                let r = Box::new(Self::from(*r, ctx)?);
                let shape = l.shape().unify(r.shape(), loc)?;
                Expr2::Op2(op, l, r, shape, loc)
            }
            Expr1::If(cond, t, f, loc) => {
                let cond = Box::new(Self::from(*cond, ctx)?);
                let t = Box::new(Self::from(*t, ctx)?);
                let f = Box::new(Self::from(*f, ctx)?);
                let shape = t.shape().unify(f.shape(), loc)?;
                let shape = cond.shape().unify(&shape, loc)?;
                Expr2::If(cond, t, f, shape, loc)
            }
        };

        Ok(result)
    }

    fn infer_builtin(
        builtin: BuiltinFn<Expr1>,
        ctx: &ShapeContext,
        loc: Loc,
    ) -> EquationResult<(BuiltinFn<Expr2>, Shape)> {
        use BuiltinFn::*;

        macro_rules! elementwise1 {
            ($builtin_fn:tt, $a:expr) => {{
                let a = Box::new(Expr2::from(*$a, ctx)?);
                let shape = a.shape().clone();
                Ok(($builtin_fn(a), shape))
            }};
        }

        match builtin {
            Inf => Ok((Inf, Shape::scalar())),
            Pi => Ok((Pi, Shape::scalar())),
            Time => Ok((Time, Shape::scalar())),
            TimeStep => Ok((TimeStep, Shape::scalar())),
            StartTime => Ok((StartTime, Shape::scalar())),
            FinalTime => Ok((FinalTime, Shape::scalar())),
            IsModuleInput(id, iloc) => Ok((IsModuleInput(id, iloc), Shape::scalar())),

            Abs(a) => elementwise1!(Abs, a),
            Arccos(a) => elementwise1!(Arccos, a),
            Arcsin(a) => elementwise1!(Arcsin, a),
            Arctan(a) => elementwise1!(Arctan, a),
            Cos(a) => elementwise1!(Cos, a),
            Exp(a) => elementwise1!(Exp, a),
            Int(a) => elementwise1!(Int, a),
            Ln(a) => elementwise1!(Ln, a),
            Log10(a) => elementwise1!(Log10, a),
            Sign(a) => elementwise1!(Sign, a),
            Sin(a) => elementwise1!(Sin, a),
            Sqrt(a) => elementwise1!(Sqrt, a),
            Tan(a) => elementwise1!(Tan, a),

            Lookup(id, a, iloc) => {
                let a = Box::new(Expr2::from(*a, ctx)?);
                let shape = a.shape().clone();
                Ok((Lookup(id, a, iloc), shape))
            }

            // single-argument min/max over an array is a reduction
            Min(a, None) => {
                let a = Box::new(Expr2::from(*a, ctx)?);
                Ok((Min(a, None), Shape::scalar()))
            }
            Max(a, None) => {
                let a = Box::new(Expr2::from(*a, ctx)?);
                Ok((Max(a, None), Shape::scalar()))
            }
            Min(a, Some(b)) => {
                let a = Box::new(Expr2::from(*a, ctx)?);
                let b = Box::new(Expr2::from(*b, ctx)?);
                let shape = a.shape().unify(b.shape(), loc)?;
                Ok((Min(a, Some(b)), shape))
            }
            Max(a, Some(b)) => {
                let a = Box::new(Expr2::from(*a, ctx)?);
                let b = Box::new(Expr2::from(*b, ctx)?);
                let shape = a.shape().unify(b.shape(), loc)?;
                Ok((Max(a, Some(b)), shape))
            }

            Mean(args) => {
                let args: EquationResult<Vec<Expr2>> = args
                    .into_iter()
                    .map(|arg| Expr2::from(arg, ctx))
                    .collect();
                let args = args?;
                // mean of a single array argument is a reduction; the
                // n-ary form requires scalars
                if args.len() != 1 && args.iter().any(|arg| !arg.shape().is_scalar()) {
                    return eqn_err!(MismatchedDimensions, loc.start, loc.end);
                }
                Ok((Mean(args), Shape::scalar()))
            }

            Sum(a) => {
                let a = Box::new(Expr2::from(*a, ctx)?);
                Ok((Sum(a), Shape::scalar()))
            }
            Stddev(a) => {
                let a = Box::new(Expr2::from(*a, ctx)?);
                Ok((Stddev(a), Shape::scalar()))
            }
            Size(a) => {
                let a = Box::new(Expr2::from(*a, ctx)?);
                Ok((Size(a), Shape::scalar()))
            }
            Rank(a, rest) => {
                let a = Box::new(Expr2::from(*a, ctx)?);
                let rest = match rest {
                    Some((b, c)) => {
                        let b = Box::new(Expr2::from(*b, ctx)?);
                        let c = match c {
                            Some(c) => Some(Box::new(Expr2::from(*c, ctx)?)),
                            None => None,
                        };
                        Some((b, c))
                    }
                    None => None,
                };
                Ok((Rank(a, rest), Shape::scalar()))
            }

            Pulse(a, b, c) => {
                let a = Box::new(Expr2::from(*a, ctx)?);
                let b = Box::new(Expr2::from(*b, ctx)?);
                let c = match c {
                    Some(c) => Some(Box::new(Expr2::from(*c, ctx)?)),
                    None => None,
                };
                let shape = a.shape().clone();
                Ok((Pulse(a, b, c), shape))
            }
            Ramp(a, b, c) => {
                let a = Box::new(Expr2::from(*a, ctx)?);
                let b = Box::new(Expr2::from(*b, ctx)?);
                let c = match c {
                    Some(c) => Some(Box::new(Expr2::from(*c, ctx)?)),
                    None => None,
                };
                let shape = a.shape().clone();
                Ok((Ramp(a, b, c), shape))
            }
            Step(a, b) => {
                let a = Box::new(Expr2::from(*a, ctx)?);
                let b = Box::new(Expr2::from(*b, ctx)?);
                let shape = a.shape().clone();
                Ok((Step(a, b), shape))
            }
            Rand(args) => {
                let args = match args {
                    Some((a, b)) => Some((
                        Box::new(Expr2::from(*a, ctx)?),
                        Box::new(Expr2::from(*b, ctx)?),
                    )),
                    None => None,
                };
                Ok((Rand(args), Shape::scalar()))
            }
            SafeDiv(a, b, c) => {
                let a = Box::new(Expr2::from(*a, ctx)?);
                let b = Box::new(Expr2::from(*b, ctx)?);
                let c = match c {
                    Some(c) => Some(Box::new(Expr2::from(*c, ctx)?)),
                    None => None,
                };
                let shape = a.shape().unify(b.shape(), loc)?;
                Ok((SafeDiv(a, b, c), shape))
            }
        }
    }
}

/// Evaluate a subscript index expression to a positive integer, if it is
/// statically known.  Returns the 1-based value.
fn const_index(expr: &Expr1) -> Option<usize> {
    match expr {
        Expr1::Const(_, n, _) => {
            if *n >= 1.0 && n.fract() == 0.0 {
                Some(*n as usize)
            } else {
                None
            }
        }
        _ => None,
    }
}

// a tiny once-cell so Expr2::shape can hand out a &Shape for constants
// without storing one per node
mod once_shape {
    use super::Shape;
    use std::sync::OnceLock;

    pub struct OnceShape(OnceLock<Shape>);

    impl OnceShape {
        pub const fn new() -> Self {
            OnceShape(OnceLock::new())
        }

        pub fn get(&self) -> &Shape {
            self.0.get_or_init(Shape::scalar)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn axis(name: &str, size: usize) -> Axis {
        Axis {
            name: name.to_string(),
            indexed: false,
            size,
        }
    }

    fn indexed_axis(name: &str, size: usize) -> Axis {
        Axis {
            name: name.to_string(),
            indexed: true,
            size,
        }
    }

    #[test]
    fn test_unify_scalars() {
        let scalar = Shape::scalar();
        let arr = Shape::new(vec![axis("d", 3)]);
        assert_eq!(arr, scalar.unify(&arr, Loc::default()).unwrap());
        assert_eq!(arr, arr.unify(&scalar, Loc::default()).unwrap());
    }

    #[test]
    fn test_unify_by_name() {
        let a = Shape::new(vec![axis("location", 3), axis("product", 2)]);
        let b = Shape::new(vec![axis("product", 2)]);
        assert_eq!(a, a.unify(&b, Loc::default()).unwrap());
    }

    #[test]
    fn test_unify_name_size_conflict() {
        let a = Shape::new(vec![axis("location", 3)]);
        let b = Shape::new(vec![axis("location", 4)]);
        assert!(a.unify(&b, Loc::default()).is_err());
    }

    #[test]
    fn test_unify_indexed_by_size() {
        let a = Shape::new(vec![indexed_axis("x", 5)]);
        let b = Shape::new(vec![indexed_axis("y", 5)]);
        let unified = a.unify(&b, Loc::default()).unwrap();
        assert_eq!(1, unified.ndim());
        assert_eq!(5, unified.size());
    }

    #[test]
    fn test_unify_broadcast_positional() {
        // different named dimensions never match: they broadcast into a
        // higher-rank result
        let a = Shape::new(vec![axis("x", 2)]);
        let b = Shape::new(vec![axis("y", 3)]);
        let unified = a.unify(&b, Loc::default()).unwrap();
        assert_eq!(2, unified.ndim());
        assert_eq!(vec!["x", "y"], unified.names());
        assert_eq!(6, unified.size());
    }

    #[test]
    fn test_transpose() {
        let a = Shape::new(vec![axis("d1", 2), axis("d2", 3)]);
        let t = a.transpose();
        assert_eq!(vec!["d2", "d1"], t.names());
        assert_eq!(vec![3, 2], t.sizes());
        assert_eq!(a, t.transpose());
    }
}
