// Copyright 2025 The Fluxion Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! Lowering from analyzed models to executable form.
//!
//! Offsets into the flat state vector are assigned here; equations are
//! pushed through the Expr2/Expr3 pipeline and land in an offset-based
//! IR (`Expr`) with one assignment per array element.  That IR is what
//! the reference interpreter walks directly and what `Compiler` turns
//! into bytecode for the VM.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::rc::Rc;
use std::sync::Arc;

use crate::ast::array_view::{ArrayView, ViewSource};
use crate::ast::expr2::{Expr2, Shape, ShapeContext};
use crate::ast::expr3::{lower_equation, LowerContext, LoweredEquation, TempAllocator};
use crate::ast::{Ast, BinaryOp, Expr1, Expr3, Loc, UnaryOp};
use crate::bytecode::{
    BuiltinId, ByteCode, ByteCodeBuilder, ByteCodeContext, CompiledGraphicalFunction,
    CompiledModule, CompiledView, GraphicalFunctionId, ModuleDeclaration, ModuleId,
    ModuleInputOffset, Op2 as BcOp2, Opcode, VariableOffset, ViewId,
};
use crate::common::{quoteize, ErrorCode, ErrorKind, Ident, Result};
use crate::datamodel::Dimension;
use crate::dimensions::DimensionsContext;
use crate::model::{enumerate_modules, ModelStage1};
use crate::project::Project;
use crate::results::Specs;
use crate::common::Error;
use crate::sim_err;
use crate::variable::Variable;

pub(crate) const TIME_OFF: usize = 0;
pub(crate) const DT_OFF: usize = 1;
pub(crate) const INITIAL_TIME_OFF: usize = 2;
pub(crate) const FINAL_TIME_OFF: usize = 3;
pub(crate) const IMPLICIT_VAR_COUNT: usize = 4;

/// Which runlist is being evaluated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StepPart {
    Initials,
    Flows,
    Stocks,
}

/// A stock's storage, for the integrator: where its elements live and
/// whether they clamp at zero.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StockSlot {
    pub off: usize,
    pub size: usize,
    pub non_negative: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Table {
    pub data: Vec<(f64, f64)>,
    pub kind: crate::datamodel::GraphicalFunctionKind,
}

impl Table {
    fn new(ident: &str, t: &crate::variable::Table) -> Result<Self> {
        if t.x.len() != t.y.len() {
            return sim_err!(BadTable, ident.to_string());
        }

        let data: Vec<(f64, f64)> = t.x.iter().copied().zip(t.y.iter().copied()).collect();

        Ok(Self { data, kind: t.kind })
    }
}

type BuiltinFn = crate::builtins::BuiltinFn<Expr>;

/// The offset-based IR: every variable reference is a slot in the state
/// vector (module-relative), every static array access is a view id,
/// every temporary a slot in the scratch region.
#[derive(PartialEq, Clone, Debug)]
pub enum Expr {
    Const(f64, Loc),
    Var(usize, Loc),
    /// dynamic element read: base offset, 1-based index exprs, bounds
    Subscript(usize, Vec<Expr>, Vec<usize>, Loc),
    /// a static view, for array reductions
    ViewRef(ViewId, Loc),
    /// scratch element read
    LoadTemp(usize, Loc),
    Dt(Loc),
    App(BuiltinFn, Loc),
    EvalModule(Ident, Ident, Vec<Expr>),
    ModuleInput(usize, Loc),
    Op2(BinaryOp, Box<Expr>, Box<Expr>, Loc),
    Op1(UnaryOp, Box<Expr>, Loc),
    If(Box<Expr>, Box<Expr>, Box<Expr>, Loc),
    AssignCurr(usize, Box<Expr>),
    AssignNext(usize, Box<Expr>),
    /// scratch element write
    AssignTemp(usize, Box<Expr>),
}

impl Expr {
    fn get_loc(&self) -> Loc {
        match self {
            Expr::Const(_, loc) => *loc,
            Expr::Var(_, loc) => *loc,
            Expr::Subscript(_, _, _, loc) => *loc,
            Expr::ViewRef(_, loc) => *loc,
            Expr::LoadTemp(_, loc) => *loc,
            Expr::Dt(loc) => *loc,
            Expr::App(_, loc) => *loc,
            Expr::EvalModule(_, _, _) => Loc::default(),
            Expr::ModuleInput(_, loc) => *loc,
            Expr::Op2(_, _, _, loc) => *loc,
            Expr::Op1(_, _, loc) => *loc,
            Expr::If(_, _, _, loc) => *loc,
            Expr::AssignCurr(_, _) => Loc::default(),
            Expr::AssignNext(_, _) => Loc::default(),
            Expr::AssignTemp(_, _) => Loc::default(),
        }
    }
}

#[derive(Clone, Debug)]
struct VariableMetadata {
    offset: usize,
    size: usize,
    var: Variable,
}

/// One axis of the element-iteration context used when unrolling arrayed
/// assignments.
#[derive(Clone, Debug)]
struct ActiveDim {
    name: Ident,
    size: usize,
    /// 0-based position of the element currently being compiled
    index: usize,
}

#[derive(Clone, Debug)]
struct Context<'a> {
    model_name: &'a str,
    active: Vec<ActiveDim>,
    metadata: &'a HashMap<Ident, HashMap<Ident, VariableMetadata>>,
    var_shapes: &'a HashMap<Ident, HashMap<Ident, Shape>>,
    module_models: &'a HashMap<Ident, HashMap<Ident, Ident>>,
    dims_ctx: &'a DimensionsContext,
    is_initial: bool,
    inputs: &'a BTreeSet<Ident>,
}

impl<'a> Context<'a> {
    fn get_offset(&self, ident: &str) -> Result<usize> {
        self.get_submodel_offset(self.model_name, ident, false)
    }

    /// ignores array element selection; for subscripts and assignment
    /// targets that supply their own element math
    fn get_base_offset(&self, ident: &str) -> Result<usize> {
        self.get_submodel_offset(self.model_name, ident, true)
    }

    fn get_metadata(&self, ident: &str) -> Result<&VariableMetadata> {
        self.get_submodel_metadata(self.model_name, ident)
    }

    /// Resolve an unsubscripted reference to an arrayed variable using
    /// the element-iteration context: match the variable's dimensions
    /// against the active ones by name, then (for indexed dimensions) by
    /// size.
    fn get_implicit_subscripts(&self, dims: &[Dimension], ident: &str) -> Result<Vec<usize>> {
        if self.active.is_empty() {
            return sim_err!(ArrayReferenceNeedsExplicitSubscripts, ident.to_owned());
        }

        let mut used = vec![false; self.active.len()];
        let mut subscripts: Vec<usize> = Vec::with_capacity(dims.len());

        for dim in dims.iter() {
            let dim_name = crate::common::canonicalize(dim.name());
            let by_name = self
                .active
                .iter()
                .enumerate()
                .find(|(i, active)| !used[*i] && active.name == dim_name);
            let matched = match by_name {
                Some((i, active)) => {
                    used[i] = true;
                    Some(active.index)
                }
                None => {
                    // indexed dimensions may match by size
                    let by_size = self
                        .active
                        .iter()
                        .enumerate()
                        .find(|(i, active)| !used[*i] && active.size == dim.len());
                    match by_size {
                        Some((i, active)) => {
                            used[i] = true;
                            Some(active.index)
                        }
                        None => None,
                    }
                }
            };

            match matched {
                Some(index) => subscripts.push(index),
                None => {
                    return sim_err!(MismatchedDimensions, ident.to_owned());
                }
            }
        }

        Ok(subscripts)
    }

    fn get_implicit_subscript_off(&self, dims: &[Dimension], ident: &str) -> Result<usize> {
        let subscripts = self.get_implicit_subscripts(dims, ident)?;

        let off = dims
            .iter()
            .zip(subscripts)
            .fold(0_usize, |acc, (dim, subscript)| {
                acc * dim.len() + subscript
            });

        Ok(off)
    }

    /// `x[location]` inside an apply-to-all over location means "at the
    /// current element of location".
    fn get_dimension_name_subscript(&self, dim_name: &str) -> Option<usize> {
        self.active
            .iter()
            .find(|active| active.name == dim_name)
            .map(|active| active.index)
    }

    /// Resolve a static view's element under the active context: each
    /// view axis takes the current index of the active dimension it
    /// matches (by name, falling back to size).
    fn resolve_view_element(&self, view: &ArrayView, ident: &str) -> Result<usize> {
        if view.ndim() == 0 {
            return Ok(view.offset_of(&[]));
        }
        if self.active.is_empty() {
            return sim_err!(ArrayReferenceNeedsExplicitSubscripts, ident.to_owned());
        }

        let mut used = vec![false; self.active.len()];
        let mut indices: Vec<usize> = Vec::with_capacity(view.ndim());

        for (axis, dim_name) in view.dim_names.iter().enumerate() {
            let by_name = self
                .active
                .iter()
                .enumerate()
                .find(|(i, active)| !used[*i] && !dim_name.is_empty() && active.name == *dim_name);
            let matched = match by_name {
                Some((i, active)) => {
                    used[i] = true;
                    Some(active.index)
                }
                None => {
                    let size = view.dims[axis];
                    let by_size = self
                        .active
                        .iter()
                        .enumerate()
                        .find(|(i, active)| !used[*i] && active.size == size);
                    match by_size {
                        Some((i, active)) => {
                            used[i] = true;
                            Some(active.index)
                        }
                        None => None,
                    }
                }
            };

            match matched {
                Some(index) => indices.push(index),
                None => {
                    return sim_err!(MismatchedDimensions, ident.to_owned());
                }
            }
        }

        Ok(view.offset_of(&indices))
    }

    fn get_submodel_metadata(&self, model: &str, ident: &str) -> Result<&VariableMetadata> {
        let metadata = &self.metadata[model];
        if let Some(pos) = ident.find('·') {
            let submodel_module_name = &ident[..pos];
            let submodel_name = &self.module_models[model][submodel_module_name];
            let submodel_var = &ident[pos + '·'.len_utf8()..];
            self.get_submodel_metadata(submodel_name, submodel_var)
        } else {
            match metadata.get(ident) {
                Some(metadata) => Ok(metadata),
                None => sim_err!(DoesNotExist, ident.to_owned()),
            }
        }
    }

    fn get_submodel_offset(&self, model: &str, ident: &str, ignore_arrays: bool) -> Result<usize> {
        let metadata = &self.metadata[model];
        if let Some(pos) = ident.find('·') {
            let submodel_module_name = &ident[..pos];
            let submodel_name = match self.module_models[model].get(submodel_module_name) {
                Some(name) => name,
                None => {
                    return sim_err!(DoesNotExist, ident.to_owned());
                }
            };
            let submodel_var = &ident[pos + '·'.len_utf8()..];
            let submodel_off = metadata[submodel_module_name].offset;
            Ok(submodel_off
                + self.get_submodel_offset(submodel_name, submodel_var, ignore_arrays)?)
        } else {
            let metadata = match metadata.get(ident) {
                Some(metadata) => metadata,
                None => {
                    return sim_err!(DoesNotExist, ident.to_owned());
                }
            };
            if !ignore_arrays {
                if let Some(dims) = metadata.var.get_dimensions() {
                    let off = self.get_implicit_subscript_off(dims, ident)?;
                    return Ok(metadata.offset + off);
                }
            }
            Ok(metadata.offset)
        }
    }

    fn fold_flows(&self, flows: &[Ident]) -> Result<Option<Expr>> {
        if flows.is_empty() {
            return Ok(None);
        }

        let mut loads = Vec::with_capacity(flows.len());
        for flow in flows.iter() {
            loads.push(Expr::Var(self.get_offset(flow)?, Loc::default()));
        }

        let mut loads = loads.into_iter();
        let first = loads.next().unwrap();
        Ok(Some(loads.fold(first, |acc, flow| {
            Expr::Op2(BinaryOp::Add, Box::new(acc), Box::new(flow), Loc::default())
        })))
    }

    /// dstock/dt = Σ inflows − Σ outflows
    fn build_stock_deriv_expr(&self, var: &Variable) -> Result<Expr> {
        if let Variable::Stock {
            inflows, outflows, ..
        } = var
        {
            let inflows = match self.fold_flows(inflows)? {
                None => Expr::Const(0.0, Loc::default()),
                Some(flows) => flows,
            };
            let outflows = match self.fold_flows(outflows)? {
                None => Expr::Const(0.0, Loc::default()),
                Some(flows) => flows,
            };

            Ok(Expr::Op2(
                BinaryOp::Sub,
                Box::new(inflows),
                Box::new(outflows),
                Loc::default(),
            ))
        } else {
            unreachable!("build_stock_deriv_expr called with non-stock");
        }
    }

    /// Push a stage-1 equation the rest of the way through the pipeline
    /// (shape inference, temp/view lowering) and compile it for the
    /// current element context.  Returns temp-fill statements plus the
    /// value expression.
    fn compile_equation(
        &self,
        expr: &Expr1,
        views: &mut Vec<CompiledView>,
        temp_size: &mut usize,
    ) -> Result<(Vec<Expr>, Expr)> {
        let var_shapes = &self.var_shapes[self.model_name];
        let shape_ctx = ShapeContext {
            var_shapes,
            dims: self.dims_ctx,
        };
        let expr2 = Expr2::from(expr.clone(), &shape_ctx).map_err(|err| Error {
            kind: ErrorKind::Variable,
            code: err.code,
            details: None,
        })?;

        let lower_ctx = LowerContext {
            dims: self.dims_ctx,
            var_shapes,
        };
        let mut alloc = TempAllocator::default();
        let LoweredEquation { temps, expr } = lower_equation(expr2, &lower_ctx, &mut alloc)
            .map_err(|err| Error {
                kind: ErrorKind::Variable,
                code: err.code,
                details: None,
            })?;
        *temp_size = (*temp_size).max(alloc.total_size());

        let mut fills: Vec<Expr> = vec![];
        for temp in temps.iter() {
            if let Expr3::AssignTemp(_id, body, view) = temp {
                self.compile_temp_fill(body, view, views, &mut fills)?;
            } else {
                unreachable!("non-AssignTemp in temp prelude");
            }
        }

        let value = self.lower3(&expr, views)?;
        Ok((fills, value))
    }

    /// Unroll a temporary fill: evaluate the body once per element of
    /// the temp's view, in an extended element context.
    fn compile_temp_fill(
        &self,
        body: &Expr3,
        view: &ArrayView,
        views: &mut Vec<CompiledView>,
        out: &mut Vec<Expr>,
    ) -> Result<()> {
        debug_assert_eq!(ViewSource::Temp, view.source);
        let dims = &view.dims;
        let n = view.size();

        let mut indices = vec![0usize; dims.len()];
        for _ in 0..n {
            let mut ctx = self.clone();
            // the temp's own axes shadow any same-named outer ones
            for (axis, &index) in indices.iter().enumerate() {
                ctx.active.insert(
                    axis,
                    ActiveDim {
                        name: view.dim_names[axis].clone(),
                        size: dims[axis],
                        index,
                    },
                );
            }

            let elem_off = view.offset_of(&indices);
            let value = ctx.lower3(body, views)?;
            out.push(Expr::AssignTemp(elem_off, Box::new(value)));

            for axis in (0..indices.len()).rev() {
                indices[axis] += 1;
                if indices[axis] < dims[axis] {
                    break;
                }
                indices[axis] = 0;
            }
        }

        Ok(())
    }

    fn register_view(
        &self,
        views: &mut Vec<CompiledView>,
        view: &ArrayView,
        base: usize,
    ) -> ViewId {
        views.push(CompiledView {
            view: view.clone(),
            base,
        });
        (views.len() - 1) as ViewId
    }

    /// Lower a reduction argument: views pass through as view
    /// references, everything else must already be scalar.
    fn lower_reduction_arg(
        &self,
        arg: &Expr3,
        views: &mut Vec<CompiledView>,
    ) -> Result<ReductionArg> {
        match arg {
            Expr3::StaticView(id, view, loc) => {
                let base = self.get_base_offset(id)?;
                let view_id = self.register_view(views, view, base);
                Ok(ReductionArg::View(Expr::ViewRef(view_id, *loc)))
            }
            Expr3::TempArray(_id, view, loc) => {
                let view_id = self.register_view(views, view, 0);
                Ok(ReductionArg::View(Expr::ViewRef(view_id, *loc)))
            }
            arg => Ok(ReductionArg::Scalar(self.lower3(arg, views)?)),
        }
    }

    fn lower3(&self, expr: &Expr3, views: &mut Vec<CompiledView>) -> Result<Expr> {
        let expr = match expr {
            Expr3::Const(_, n, loc) => Expr::Const(*n, *loc),
            Expr3::Var(id, loc) => {
                if let Some(off) = self.inputs.iter().position(|input| id == input) {
                    Expr::ModuleInput(off, *loc)
                } else if self.dims_ctx.contains(id) {
                    // a bare dimension name is the element index this
                    // iteration is on, 1-based
                    match self.get_dimension_name_subscript(id) {
                        Some(subscript_off) => Expr::Const((subscript_off + 1) as f64, *loc),
                        None => {
                            return sim_err!(ArrayReferenceNeedsExplicitSubscripts, id.clone());
                        }
                    }
                } else {
                    Expr::Var(self.get_offset(id)?, *loc)
                }
            }
            Expr3::Subscript(id, indices, loc) => {
                let off = self.get_base_offset(id)?;
                let metadata = self.get_metadata(id)?;
                let dims = match metadata.var.get_dimensions() {
                    Some(dims) => dims.to_vec(),
                    None => {
                        return sim_err!(MismatchedDimensions, id.clone());
                    }
                };
                if indices.len() != dims.len() {
                    return sim_err!(MismatchedDimensions, id.clone());
                }
                let indices: Result<Vec<Expr>> = indices
                    .iter()
                    .map(|index| {
                        // a bare dimension name means "the element this
                        // iteration is on"
                        if let Expr3::Var(ident, iloc) = index {
                            if self.dims_ctx.contains(ident) {
                                if let Some(subscript_off) =
                                    self.get_dimension_name_subscript(ident)
                                {
                                    return Ok(Expr::Const(
                                        (subscript_off + 1) as f64,
                                        *iloc,
                                    ));
                                }
                                return sim_err!(
                                    ArrayReferenceNeedsExplicitSubscripts,
                                    ident.clone()
                                );
                            }
                        }
                        self.lower3(index, views)
                    })
                    .collect();
                let bounds = dims.iter().map(|dim| dim.len()).collect();
                Expr::Subscript(off, indices?, bounds, *loc)
            }
            Expr3::StaticView(id, view, loc) => {
                let base = self.get_base_offset(id)?;
                if view.ndim() == 0 {
                    Expr::Var(base + view.offset_of(&[]), *loc)
                } else {
                    // element-wise read through the view
                    let elem = self.resolve_view_element(view, id)?;
                    Expr::Var(base + elem, *loc)
                }
            }
            Expr3::TempArray(_id, view, loc) => {
                if view.ndim() == 0 {
                    Expr::LoadTemp(view.offset_of(&[]), *loc)
                } else {
                    let elem = self.resolve_view_element(view, "temporary")?;
                    Expr::LoadTemp(elem, *loc)
                }
            }
            Expr3::AssignTemp(_, _, _) => {
                unreachable!("AssignTemp is handled at the equation level");
            }
            Expr3::Op1(op, r, loc) => {
                let r = self.lower3(r, views)?;
                match op {
                    UnaryOp::Negative => Expr::Op2(
                        BinaryOp::Sub,
                        Box::new(Expr::Const(0.0, *loc)),
                        Box::new(r),
                        *loc,
                    ),
                    UnaryOp::Positive => r,
                    UnaryOp::Not => Expr::Op1(UnaryOp::Not, Box::new(r), *loc),
                    UnaryOp::Transpose => {
                        // stage 3 rewrote transposes into views
                        unreachable!("transpose survived to lowering");
                    }
                }
            }
            Expr3::Op2(op, l, r, loc) => Expr::Op2(
                *op,
                Box::new(self.lower3(l, views)?),
                Box::new(self.lower3(r, views)?),
                *loc,
            ),
            Expr3::If(cond, t, f, loc) => Expr::If(
                Box::new(self.lower3(cond, views)?),
                Box::new(self.lower3(t, views)?),
                Box::new(self.lower3(f, views)?),
                *loc,
            ),
            Expr3::App(builtin, loc) => {
                use crate::builtins::BuiltinFn as BFn;
                let builtin: BuiltinFn = match builtin {
                    BFn::Lookup(id, expr, iloc) => {
                        BuiltinFn::Lookup(id.clone(), Box::new(self.lower3(expr, views)?), *iloc)
                    }
                    BFn::Abs(a) => BuiltinFn::Abs(Box::new(self.lower3(a, views)?)),
                    BFn::Arccos(a) => BuiltinFn::Arccos(Box::new(self.lower3(a, views)?)),
                    BFn::Arcsin(a) => BuiltinFn::Arcsin(Box::new(self.lower3(a, views)?)),
                    BFn::Arctan(a) => BuiltinFn::Arctan(Box::new(self.lower3(a, views)?)),
                    BFn::Cos(a) => BuiltinFn::Cos(Box::new(self.lower3(a, views)?)),
                    BFn::Exp(a) => BuiltinFn::Exp(Box::new(self.lower3(a, views)?)),
                    BFn::Inf => BuiltinFn::Inf,
                    BFn::Int(a) => BuiltinFn::Int(Box::new(self.lower3(a, views)?)),
                    BFn::IsModuleInput(id, iloc) => {
                        BuiltinFn::IsModuleInput(id.clone(), *iloc)
                    }
                    BFn::Ln(a) => BuiltinFn::Ln(Box::new(self.lower3(a, views)?)),
                    BFn::Log10(a) => BuiltinFn::Log10(Box::new(self.lower3(a, views)?)),
                    BFn::Pi => BuiltinFn::Pi,
                    BFn::Pulse(a, b, c) => BuiltinFn::Pulse(
                        Box::new(self.lower3(a, views)?),
                        Box::new(self.lower3(b, views)?),
                        self.lower3_opt(c, views)?,
                    ),
                    BFn::Ramp(a, b, c) => BuiltinFn::Ramp(
                        Box::new(self.lower3(a, views)?),
                        Box::new(self.lower3(b, views)?),
                        self.lower3_opt(c, views)?,
                    ),
                    BFn::Rand(args) => BuiltinFn::Rand(match args {
                        Some((a, b)) => Some((
                            Box::new(self.lower3(a, views)?),
                            Box::new(self.lower3(b, views)?),
                        )),
                        None => None,
                    }),
                    BFn::SafeDiv(a, b, c) => BuiltinFn::SafeDiv(
                        Box::new(self.lower3(a, views)?),
                        Box::new(self.lower3(b, views)?),
                        self.lower3_opt(c, views)?,
                    ),
                    BFn::Sign(a) => BuiltinFn::Sign(Box::new(self.lower3(a, views)?)),
                    BFn::Sin(a) => BuiltinFn::Sin(Box::new(self.lower3(a, views)?)),
                    BFn::Sqrt(a) => BuiltinFn::Sqrt(Box::new(self.lower3(a, views)?)),
                    BFn::Step(a, b) => BuiltinFn::Step(
                        Box::new(self.lower3(a, views)?),
                        Box::new(self.lower3(b, views)?),
                    ),
                    BFn::Tan(a) => BuiltinFn::Tan(Box::new(self.lower3(a, views)?)),
                    BFn::Time => BuiltinFn::Time,
                    BFn::TimeStep => BuiltinFn::TimeStep,
                    BFn::StartTime => BuiltinFn::StartTime,
                    BFn::FinalTime => BuiltinFn::FinalTime,
                    BFn::Max(a, None) => match self.lower_reduction_arg(a, views)? {
                        ReductionArg::View(view) => BuiltinFn::Max(Box::new(view), None),
                        ReductionArg::Scalar(scalar) => {
                            return Ok(scalar);
                        }
                    },
                    BFn::Min(a, None) => match self.lower_reduction_arg(a, views)? {
                        ReductionArg::View(view) => BuiltinFn::Min(Box::new(view), None),
                        ReductionArg::Scalar(scalar) => {
                            return Ok(scalar);
                        }
                    },
                    BFn::Max(a, Some(b)) => BuiltinFn::Max(
                        Box::new(self.lower3(a, views)?),
                        Some(Box::new(self.lower3(b, views)?)),
                    ),
                    BFn::Min(a, Some(b)) => BuiltinFn::Min(
                        Box::new(self.lower3(a, views)?),
                        Some(Box::new(self.lower3(b, views)?)),
                    ),
                    BFn::Sum(a) => match self.lower_reduction_arg(a, views)? {
                        ReductionArg::View(view) => BuiltinFn::Sum(Box::new(view)),
                        ReductionArg::Scalar(scalar) => {
                            return Ok(scalar);
                        }
                    },
                    BFn::Stddev(a) => match self.lower_reduction_arg(a, views)? {
                        ReductionArg::View(view) => BuiltinFn::Stddev(Box::new(view)),
                        ReductionArg::Scalar(_) => {
                            return Ok(Expr::Const(0.0, *loc));
                        }
                    },
                    BFn::Size(a) => match self.lower_reduction_arg(a, views)? {
                        ReductionArg::View(view) => BuiltinFn::Size(Box::new(view)),
                        ReductionArg::Scalar(_) => {
                            return Ok(Expr::Const(1.0, *loc));
                        }
                    },
                    BFn::Mean(args) => {
                        if args.len() == 1 {
                            match self.lower_reduction_arg(&args[0], views)? {
                                ReductionArg::View(view) => BuiltinFn::Mean(vec![view]),
                                ReductionArg::Scalar(scalar) => {
                                    return Ok(scalar);
                                }
                            }
                        } else {
                            let args: Result<Vec<Expr>> =
                                args.iter().map(|arg| self.lower3(arg, views)).collect();
                            BuiltinFn::Mean(args?)
                        }
                    }
                    BFn::Rank(a, rest) => {
                        let a = match self.lower_reduction_arg(a, views)? {
                            ReductionArg::View(view) => view,
                            ReductionArg::Scalar(_) => {
                                return Ok(Expr::Const(1.0, *loc));
                            }
                        };
                        let rest = match rest {
                            Some((b, c)) => Some((
                                Box::new(self.lower3(b, views)?),
                                match c {
                                    Some(c) => Some(Box::new(self.lower3(c, views)?)),
                                    None => None,
                                },
                            )),
                            None => None,
                        };
                        BuiltinFn::Rank(Box::new(a), rest)
                    }
                };
                Expr::App(builtin, *loc)
            }
        };

        Ok(expr)
    }

    fn lower3_opt(
        &self,
        expr: &Option<Box<Expr3>>,
        views: &mut Vec<CompiledView>,
    ) -> Result<Option<Box<Expr>>> {
        match expr {
            Some(expr) => Ok(Some(Box::new(self.lower3(expr, views)?))),
            None => Ok(None),
        }
    }
}

enum ReductionArg {
    View(Expr),
    Scalar(Expr),
}

/// Iterate the subscript space of a dimension list: yields (0-based
/// index tuple, canonical element names).
pub(crate) struct SubscriptIterator<'a> {
    dims: &'a [Dimension],
    next: Vec<usize>,
    remaining: usize,
}

impl<'a> SubscriptIterator<'a> {
    pub(crate) fn new(dims: &'a [Dimension]) -> Self {
        SubscriptIterator {
            dims,
            next: vec![0; dims.len()],
            remaining: dims.iter().map(|d| d.len()).product(),
        }
    }
}

impl Iterator for SubscriptIterator<'_> {
    type Item = (Vec<usize>, Vec<String>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        let indices = self.next.clone();
        let names = indices
            .iter()
            .enumerate()
            .map(|(axis, &i)| match &self.dims[axis] {
                Dimension::Indexed(_, _) => (i + 1).to_string(),
                Dimension::Named(_, elements) => crate::common::canonicalize(&elements[i]),
            })
            .collect();

        for axis in (0..self.next.len()).rev() {
            self.next[axis] += 1;
            if self.next[axis] < self.dims[axis].len() {
                break;
            }
            self.next[axis] = 0;
        }

        Some((indices, names))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Var {
    pub(crate) ident: Ident,
    pub(crate) ast: Vec<Expr>,
}

impl Var {
    fn new(ctx: &Context, var: &Variable, views: &mut Vec<CompiledView>, temp_size: &mut usize) -> Result<Self> {
        // module inputs override whatever equation the variable has
        let ast: Vec<Expr> = if let Some((off, ident)) = ctx
            .inputs
            .iter()
            .enumerate()
            .find(|(_i, n)| *n == var.ident())
        {
            vec![Expr::AssignCurr(
                ctx.get_base_offset(ident)?,
                Box::new(Expr::ModuleInput(off, Loc::default())),
            )]
        } else {
            match var {
                Variable::Module {
                    ident,
                    model_name,
                    inputs,
                    ..
                } => {
                    let mut inputs = inputs.clone();
                    inputs.sort_unstable_by(|a, b| a.dst.cmp(&b.dst));
                    let input_dsts: BTreeSet<Ident> =
                        inputs.iter().map(|mi| mi.dst.clone()).collect();
                    let inputs: Result<Vec<Expr>> = inputs
                        .iter()
                        .map(|mi| Ok(Expr::Var(ctx.get_offset(&mi.src)?, Loc::default())))
                        .collect();
                    vec![Expr::EvalModule(
                        ident.clone(),
                        module_key(model_name, &input_dsts),
                        inputs?,
                    )]
                }
                Variable::Stock { init_ast, .. } => {
                    let off = ctx.get_base_offset(var.ident())?;
                    if ctx.is_initial {
                        let ast = match init_ast {
                            Some(ast) => ast,
                            None => {
                                return sim_err!(EmptyEquation, var.ident().to_string());
                            }
                        };
                        compile_elements(ctx, ast, off, views, temp_size, AssignKind::Curr)?
                    } else {
                        // the stocks runlist computes derivatives; the
                        // integrator turns them into next-step values
                        match init_ast {
                            Some(Ast::Scalar(_)) | None => {
                                let deriv = ctx.build_stock_deriv_expr(var)?;
                                vec![Expr::AssignNext(off, Box::new(deriv))]
                            }
                            Some(Ast::ApplyToAll(dims, _)) | Some(Ast::Arrayed(dims, _)) => {
                                let mut exprs = vec![];
                                for (indices, _names) in SubscriptIterator::new(dims) {
                                    let mut ctx = ctx.clone();
                                    ctx.active = active_dims(dims, &indices);
                                    let i = flat_index(dims, &indices);
                                    let deriv = ctx.build_stock_deriv_expr(var)?;
                                    exprs.push(Expr::AssignNext(off + i, Box::new(deriv)));
                                }
                                exprs
                            }
                        }
                    }
                }
                Variable::Var {
                    ident,
                    table,
                    non_negative,
                    ..
                } => {
                    let off = ctx.get_base_offset(var.ident())?;
                    let ast = if ctx.is_initial {
                        var.init_ast()
                    } else {
                        var.ast()
                    };
                    let ast = match ast {
                        Some(ast) => ast,
                        None => {
                            return sim_err!(EmptyEquation, var.ident().to_string());
                        }
                    };
                    let post = |expr: Expr| -> Expr {
                        let expr = if table.is_some() {
                            let loc = expr.get_loc();
                            Expr::App(
                                BuiltinFn::Lookup(ident.clone(), Box::new(expr), loc),
                                loc,
                            )
                        } else {
                            expr
                        };
                        if *non_negative {
                            let loc = expr.get_loc();
                            Expr::App(
                                BuiltinFn::Max(
                                    Box::new(expr),
                                    Some(Box::new(Expr::Const(0.0, loc))),
                                ),
                                loc,
                            )
                        } else {
                            expr
                        }
                    };
                    compile_elements_with(ctx, ast, off, views, temp_size, AssignKind::Curr, post)?
                }
            }
        };
        Ok(Var {
            ident: var.ident().to_owned(),
            ast,
        })
    }
}

#[derive(Clone, Copy)]
enum AssignKind {
    Curr,
    Next,
}

fn active_dims(dims: &[Dimension], indices: &[usize]) -> Vec<ActiveDim> {
    dims.iter()
        .zip(indices.iter())
        .map(|(dim, &index)| ActiveDim {
            name: crate::common::canonicalize(dim.name()),
            size: dim.len(),
            index,
        })
        .collect()
}

fn flat_index(dims: &[Dimension], indices: &[usize]) -> usize {
    dims.iter()
        .zip(indices.iter())
        .fold(0usize, |acc, (dim, &i)| acc * dim.len() + i)
}

fn compile_elements(
    ctx: &Context,
    ast: &Ast<Expr1>,
    off: usize,
    views: &mut Vec<CompiledView>,
    temp_size: &mut usize,
    kind: AssignKind,
) -> Result<Vec<Expr>> {
    compile_elements_with(ctx, ast, off, views, temp_size, kind, |expr| expr)
}

fn compile_elements_with<F>(
    ctx: &Context,
    ast: &Ast<Expr1>,
    off: usize,
    views: &mut Vec<CompiledView>,
    temp_size: &mut usize,
    kind: AssignKind,
    post: F,
) -> Result<Vec<Expr>>
where
    F: Fn(Expr) -> Expr,
{
    let assign = |elem_off: usize, expr: Expr| -> Expr {
        match kind {
            AssignKind::Curr => Expr::AssignCurr(elem_off, Box::new(expr)),
            AssignKind::Next => Expr::AssignNext(elem_off, Box::new(expr)),
        }
    };

    match ast {
        Ast::Scalar(expr1) => {
            let (mut exprs, value) = ctx.compile_equation(expr1, views, temp_size)?;
            exprs.push(assign(off, post(value)));
            Ok(exprs)
        }
        Ast::ApplyToAll(dims, expr1) => {
            let mut exprs = vec![];
            for (indices, _names) in SubscriptIterator::new(dims) {
                let mut ctx = ctx.clone();
                ctx.active = active_dims(dims, &indices);
                let i = flat_index(dims, &indices);
                let (fills, value) = ctx.compile_equation(expr1, views, temp_size)?;
                exprs.extend(fills);
                exprs.push(assign(off + i, post(value)));
            }
            Ok(exprs)
        }
        Ast::Arrayed(dims, elements) => {
            let mut exprs = vec![];
            for (indices, names) in SubscriptIterator::new(dims) {
                let subscript = names.join(",");
                let expr1 = match elements.get(&subscript) {
                    Some(expr1) => expr1,
                    None => {
                        return sim_err!(Generic, format!("missing element '{}'", subscript));
                    }
                };
                let mut ctx = ctx.clone();
                ctx.active = active_dims(dims, &indices);
                let i = flat_index(dims, &indices);
                let (fills, value) = ctx.compile_equation(expr1, views, temp_size)?;
                exprs.extend(fills);
                exprs.push(assign(off + i, post(value)));
            }
            Ok(exprs)
        }
    }
}

/// Distinct compiled form per (model, wired-inputs) pair; instantiating
/// the same model with different inputs compiles it twice.
pub(crate) fn module_key(model_name: &str, inputs: &BTreeSet<Ident>) -> Ident {
    if inputs.is_empty() {
        model_name.to_string()
    } else {
        let mut key = String::with_capacity(model_name.len() + 16);
        key.push_str(model_name);
        key.push('⁚');
        let inputs: Vec<&str> = inputs.iter().map(|s| s.as_str()).collect();
        key.push_str(&inputs.join(","));
        key
    }
}

// calculate a mapping of module variable name -> module model name
fn calc_module_model_map(
    project: &Project,
    model_name: &str,
) -> HashMap<Ident, HashMap<Ident, Ident>> {
    let mut all_models: HashMap<Ident, HashMap<Ident, Ident>> = HashMap::new();

    let model = Arc::clone(&project.models[model_name]);
    let var_names: Vec<&str> = {
        let mut var_names: Vec<_> = model.variables.keys().map(|s| s.as_str()).collect();
        var_names.sort_unstable();
        var_names
    };

    let mut current_mapping: HashMap<Ident, Ident> = HashMap::new();

    for ident in var_names.iter() {
        if let Variable::Module { model_name, .. } = &model.variables[*ident] {
            current_mapping.insert(ident.to_string(), model_name.clone());
            let all_sub_models = calc_module_model_map(project, model_name);
            all_models.extend(all_sub_models);
        };
    }

    all_models.insert(model_name.to_string(), current_mapping);

    all_models
}

fn build_metadata(
    project: &Project,
    model_name: &str,
    is_root: bool,
) -> HashMap<Ident, HashMap<Ident, VariableMetadata>> {
    let mut all_offsets: HashMap<Ident, HashMap<Ident, VariableMetadata>> = HashMap::new();

    let mut offsets: HashMap<Ident, VariableMetadata> = HashMap::new();
    let mut i = 0;
    if is_root {
        let mut implicit = |ident: &str, offset: usize| {
            offsets.insert(
                ident.to_string(),
                VariableMetadata {
                    offset,
                    size: 1,
                    var: Variable::Var {
                        ident: ident.to_string(),
                        ast: None,
                        init_ast: None,
                        eqn: None,
                        units: None,
                        table: None,
                        non_negative: false,
                        is_flow: false,
                        errors: vec![],
                        unit_errors: vec![],
                    },
                },
            );
        };
        implicit("time", TIME_OFF);
        implicit("dt", DT_OFF);
        implicit("initial_time", INITIAL_TIME_OFF);
        implicit("final_time", FINAL_TIME_OFF);
        i += IMPLICIT_VAR_COUNT;
    }

    let model = Arc::clone(&project.models[model_name]);
    let var_names: Vec<&str> = {
        let mut var_names: Vec<_> = model.variables.keys().map(|s| s.as_str()).collect();
        var_names.sort_unstable();
        var_names
    };

    for ident in var_names.iter() {
        let var = &model.variables[*ident];
        let size = if let Variable::Module { model_name, .. } = var {
            let all_sub_offsets = build_metadata(project, model_name, false);
            let sub_offsets = &all_sub_offsets[model_name];
            let sub_size: usize = sub_offsets.values().map(|metadata| metadata.size).sum();
            all_offsets.extend(all_sub_offsets);
            sub_size
        } else if let Some(dims) = var.get_dimensions() {
            dims.iter().map(|dim| dim.len()).product()
        } else {
            1
        };
        offsets.insert(
            (*ident).to_owned(),
            VariableMetadata {
                offset: i,
                size,
                var: var.clone(),
            },
        );
        i += size;
    }

    all_offsets.insert(model_name.to_string(), offsets);

    all_offsets
}

fn build_var_shapes(
    metadata: &HashMap<Ident, HashMap<Ident, VariableMetadata>>,
) -> HashMap<Ident, HashMap<Ident, Shape>> {
    metadata
        .iter()
        .map(|(model_name, vars)| {
            let shapes = vars
                .iter()
                .map(|(ident, metadata)| {
                    let shape = match metadata.var.get_dimensions() {
                        Some(dims) => Shape::from_dims(dims),
                        None => Shape::scalar(),
                    };
                    (ident.clone(), shape)
                })
                .collect();
            (model_name.clone(), shapes)
        })
        .collect()
}

/// Per-element offsets for everything in a model, flattened through
/// modules ("sector.capacity") and arrays ("sales[boston]"); these
/// become the column offsets of Results.
fn calc_flattened_offsets(project: &Project, model_name: &str) -> HashMap<Ident, (usize, usize)> {
    let is_root = model_name == "main";

    let mut offsets: HashMap<Ident, (usize, usize)> = HashMap::new();
    let mut i = 0;
    if is_root {
        offsets.insert("time".to_string(), (TIME_OFF, 1));
        offsets.insert("dt".to_string(), (DT_OFF, 1));
        offsets.insert("initial_time".to_string(), (INITIAL_TIME_OFF, 1));
        offsets.insert("final_time".to_string(), (FINAL_TIME_OFF, 1));
        i += IMPLICIT_VAR_COUNT;
    }

    let model = Arc::clone(&project.models[model_name]);
    let var_names: Vec<&str> = {
        let mut var_names: Vec<_> = model.variables.keys().map(|s| s.as_str()).collect();
        var_names.sort_unstable();
        var_names
    };

    for ident in var_names.iter() {
        let var = &model.variables[*ident];
        let size = if let Variable::Module { model_name, .. } = var {
            let sub_offsets = calc_flattened_offsets(project, model_name);
            let mut sub_var_names: Vec<&str> = sub_offsets.keys().map(|v| v.as_str()).collect();
            sub_var_names.sort_unstable();
            for sub_name in sub_var_names {
                let (sub_off, sub_size) = sub_offsets[sub_name];
                offsets.insert(
                    format!("{}.{}", quoteize(ident), quoteize(sub_name)),
                    (i + sub_off, sub_size),
                );
            }
            sub_offsets.values().map(|(_, size)| size).sum()
        } else if let Some(dims) = var.get_dimensions() {
            for (n, (_, names)) in SubscriptIterator::new(dims).enumerate() {
                let subscripted_ident = format!("{}[{}]", quoteize(ident), names.join(","));
                offsets.insert(subscripted_ident, (i + n, 1));
            }
            offsets.insert(quoteize(ident), (i, dims.iter().map(|d| d.len()).product()));
            dims.iter().map(|dim| dim.len()).product()
        } else {
            offsets.insert(quoteize(ident), (i, 1));
            1
        };
        i += size;
    }

    offsets
}

fn calc_n_slots(
    all_metadata: &HashMap<Ident, HashMap<Ident, VariableMetadata>>,
    model_name: &str,
) -> usize {
    let metadata = &all_metadata[model_name];

    metadata.values().map(|v| v.size).sum()
}

/// An analyzed model lowered to runlists of offset-IR expressions; the
/// input both to the reference interpreter and to bytecode generation.
#[derive(Clone, Debug)]
pub struct Module {
    pub(crate) ident: Ident,
    pub(crate) inputs: BTreeSet<Ident>,
    pub(crate) n_slots: usize,
    pub(crate) runlist_initials: Vec<Expr>,
    pub(crate) runlist_flows: Vec<Expr>,
    pub(crate) runlist_stocks: Vec<Expr>,
    pub(crate) offsets: HashMap<Ident, HashMap<Ident, (usize, usize)>>,
    pub(crate) runlist_order: Vec<Ident>,
    pub(crate) tables: HashMap<Ident, Table>,
    pub(crate) views: Vec<CompiledView>,
    pub(crate) temp_size: usize,
    /// module-relative stock slots, for the integrator
    pub(crate) stocks: Vec<StockSlot>,
}

impl Module {
    fn new(
        project: &Project,
        model: Arc<ModelStage1>,
        inputs: &BTreeSet<Ident>,
        is_root: bool,
    ) -> Result<Self> {
        if model.errors.is_some() && !model.errors.as_ref().unwrap().is_empty() {
            return sim_err!(NotSimulatable, model.name.clone());
        }

        let dt_deps = model
            .dt_deps()
            .ok_or_else(|| Error::new(ErrorKind::Simulation, ErrorCode::NotSimulatable, None))?;
        let initial_deps = model
            .initial_deps()
            .ok_or_else(|| Error::new(ErrorKind::Simulation, ErrorCode::NotSimulatable, None))?;

        let model_name: &str = &model.name;
        let metadata = build_metadata(project, model_name, is_root);
        let var_shapes = build_var_shapes(&metadata);

        let n_slots = calc_n_slots(&metadata, model_name);
        let module_models = calc_module_model_map(project, model_name);

        // initials: everything, in initial-dependency order (sorted
        // first so evaluation order is deterministic)
        let runlist_initials: Vec<&str> = {
            let mut runlist: Vec<&str> = model.variables.keys().map(|s| s.as_str()).collect();
            runlist.sort_unstable();
            crate::common::topo_sort(runlist, initial_deps)
        };

        // flows: everything that isn't a stock, in dt-dependency order
        // (dt dependency sets never contain stocks, so the sort stays
        // within this list)
        let runlist_flows: Vec<&str> = {
            let mut runlist: Vec<&str> = model
                .variables
                .values()
                .filter(|v| !v.is_stock())
                .map(|v| v.ident())
                .collect();
            runlist.sort_unstable();
            crate::common::topo_sort(runlist, dt_deps)
        };

        // stocks: stock derivative updates plus module recursion
        let runlist_stocks: Vec<&str> = {
            let mut runlist: Vec<&str> = model
                .variables
                .values()
                .filter(|v| v.is_stock() || v.is_module())
                .map(|v| v.ident())
                .collect();
            runlist.sort_unstable();
            runlist
        };

        let mut views: Vec<CompiledView> = vec![];
        let mut temp_size: usize = 0;

        let build_var = |ident: &str,
                         is_initial: bool,
                         views: &mut Vec<CompiledView>,
                         temp_size: &mut usize|
         -> Result<Var> {
            Var::new(
                &Context {
                    model_name,
                    active: vec![],
                    metadata: &metadata,
                    var_shapes: &var_shapes,
                    module_models: &module_models,
                    dims_ctx: &project.dims_ctx,
                    is_initial,
                    inputs,
                },
                &model.variables[ident],
                views,
                temp_size,
            )
        };

        let compiled_initials: Result<Vec<Var>> = runlist_initials
            .iter()
            .map(|ident| build_var(ident, true, &mut views, &mut temp_size))
            .collect();
        let compiled_flows: Result<Vec<Var>> = runlist_flows
            .iter()
            .map(|ident| build_var(ident, false, &mut views, &mut temp_size))
            .collect();
        let compiled_stocks: Result<Vec<Var>> = runlist_stocks
            .iter()
            .map(|ident| build_var(ident, false, &mut views, &mut temp_size))
            .collect();

        let compiled_flows = compiled_flows?;
        let compiled_stocks = compiled_stocks?;

        let mut runlist_order = Vec::with_capacity(compiled_flows.len() + compiled_stocks.len());
        runlist_order.extend(compiled_flows.iter().map(|v| v.ident.clone()));
        runlist_order.extend(compiled_stocks.iter().map(|v| v.ident.clone()));

        let runlist_initials = compiled_initials?.into_iter().flat_map(|v| v.ast).collect();
        let runlist_flows = compiled_flows.into_iter().flat_map(|v| v.ast).collect();
        let runlist_stocks = compiled_stocks.into_iter().flat_map(|v| v.ast).collect();

        let tables: Result<HashMap<Ident, Table>> = model
            .variables
            .iter()
            .filter(|(_, v)| v.table().is_some())
            .map(|(id, v)| Table::new(id, v.table().unwrap()).map(|t| (id.clone(), t)))
            .collect();
        let tables = tables?;

        // stock storage for the integrator, module-relative
        let stocks: Vec<StockSlot> = {
            let model_metadata = &metadata[model_name];
            let mut idents: Vec<&Ident> = model_metadata.keys().collect();
            idents.sort_unstable();
            idents
                .into_iter()
                .filter(|ident| model_metadata[*ident].var.is_stock())
                .map(|ident| {
                    let md = &model_metadata[ident];
                    StockSlot {
                        off: md.offset,
                        size: md.size,
                        non_negative: md.var.non_negative(),
                    }
                })
                .collect()
        };

        let offsets = metadata
            .into_iter()
            .map(|(k, v)| {
                (
                    k,
                    v.iter()
                        .map(|(k, v)| (k.clone(), (v.offset, v.size)))
                        .collect(),
                )
            })
            .collect();

        Ok(Module {
            ident: module_key(model_name, inputs),
            inputs: inputs.clone(),
            n_slots,
            runlist_initials,
            runlist_flows,
            runlist_stocks,
            offsets,
            runlist_order,
            tables,
            views,
            temp_size,
            stocks,
        })
    }

    pub fn compile(&self) -> Result<CompiledModule> {
        Compiler::new(self).compile()
    }
}

struct Compiler<'module> {
    module: &'module Module,
    module_decls: Vec<ModuleDeclaration>,
    graphical_functions: Vec<CompiledGraphicalFunction>,
    curr_code: ByteCodeBuilder,
}

impl<'module> Compiler<'module> {
    fn new(module: &'module Module) -> Compiler<'module> {
        Compiler {
            module,
            module_decls: vec![],
            graphical_functions: vec![],
            curr_code: ByteCodeBuilder::default(),
        }
    }

    fn walk(&mut self, exprs: &[Expr]) -> Result<ByteCode> {
        for expr in exprs.iter() {
            self.walk_expr(expr)?;
        }
        self.push(Opcode::Ret);

        let curr = std::mem::take(&mut self.curr_code);

        Ok(curr.finish())
    }

    fn walk_expr(&mut self, expr: &Expr) -> Result<Option<()>> {
        let result = match expr {
            Expr::Const(value, _) => {
                let id = self.curr_code.intern_literal(*value);
                self.push(Opcode::LoadConstant { id });
                Some(())
            }
            Expr::Var(off, _) => {
                self.push(Opcode::LoadVar {
                    off: *off as VariableOffset,
                });
                Some(())
            }
            Expr::Subscript(off, indices, bounds, _) => {
                assert_eq!(indices.len(), bounds.len());
                // evaluate every index first, then validate them off the
                // numeric stack; a nested subscript inside an index would
                // otherwise clobber partially-pushed index state
                for expr in indices.iter() {
                    self.walk_expr(expr)?.unwrap();
                }
                for bounds in bounds.iter().rev() {
                    let bounds = *bounds as VariableOffset;
                    self.push(Opcode::PushSubscriptIndex { bounds });
                }
                self.push(Opcode::LoadSubscript {
                    off: *off as VariableOffset,
                });
                Some(())
            }
            Expr::ViewRef(id, _) => {
                self.push(Opcode::PushView { id: *id });
                Some(())
            }
            Expr::LoadTemp(off, _) => {
                self.push(Opcode::LoadTemp {
                    off: *off as crate::bytecode::TempOffset,
                });
                Some(())
            }
            Expr::Dt(_) => {
                self.push(Opcode::LoadGlobalVar {
                    off: DT_OFF as VariableOffset,
                });
                Some(())
            }
            Expr::App(builtin, _) => {
                self.walk_builtin(builtin)?;
                Some(())
            }
            Expr::EvalModule(ident, module_key, args) => {
                for arg in args.iter() {
                    self.walk_expr(arg)?.unwrap();
                }
                let module_offsets = &self.module.offsets[strip_module_key(&self.module.ident)];
                self.module_decls.push(ModuleDeclaration {
                    model_name: module_key.clone(),
                    off: module_offsets[ident].0,
                });
                let id = (self.module_decls.len() - 1) as ModuleId;

                self.push(Opcode::EvalModule {
                    id,
                    n_inputs: args.len() as u8,
                });
                None
            }
            Expr::ModuleInput(off, _) => {
                self.push(Opcode::LoadModuleInput {
                    input: *off as ModuleInputOffset,
                });
                Some(())
            }
            Expr::Op2(op, lhs, rhs, _) => {
                self.walk_expr(lhs)?.unwrap();
                self.walk_expr(rhs)?.unwrap();
                let opcode = match op {
                    BinaryOp::Add => Opcode::Op2 { op: BcOp2::Add },
                    BinaryOp::Sub => Opcode::Op2 { op: BcOp2::Sub },
                    BinaryOp::Exp => Opcode::Op2 { op: BcOp2::Exp },
                    BinaryOp::Mul => Opcode::Op2 { op: BcOp2::Mul },
                    BinaryOp::Div => Opcode::Op2 { op: BcOp2::Div },
                    BinaryOp::Mod => Opcode::Op2 { op: BcOp2::Mod },
                    BinaryOp::Gt => Opcode::Op2 { op: BcOp2::Gt },
                    BinaryOp::Gte => Opcode::Op2 { op: BcOp2::Gte },
                    BinaryOp::Lt => Opcode::Op2 { op: BcOp2::Lt },
                    BinaryOp::Lte => Opcode::Op2 { op: BcOp2::Lte },
                    BinaryOp::Eq => Opcode::Op2 { op: BcOp2::Eq },
                    BinaryOp::Neq => {
                        self.push(Opcode::Op2 { op: BcOp2::Eq });
                        Opcode::Not {}
                    }
                    BinaryOp::And => Opcode::Op2 { op: BcOp2::And },
                    BinaryOp::Or => Opcode::Op2 { op: BcOp2::Or },
                };
                self.push(opcode);
                Some(())
            }
            Expr::Op1(op, rhs, _) => {
                self.walk_expr(rhs)?.unwrap();
                match op {
                    UnaryOp::Not => self.push(Opcode::Not {}),
                    _ => unreachable!("only Not survives lowering"),
                };
                Some(())
            }
            Expr::If(cond, t, f, _) => {
                self.walk_expr(t)?.unwrap();
                self.walk_expr(f)?.unwrap();
                self.walk_expr(cond)?.unwrap();
                self.push(Opcode::SetCond {});
                self.push(Opcode::If {});
                Some(())
            }
            Expr::AssignCurr(off, rhs) => {
                self.walk_expr(rhs)?.unwrap();
                self.push(Opcode::AssignCurr {
                    off: *off as VariableOffset,
                });
                None
            }
            Expr::AssignNext(off, rhs) => {
                self.walk_expr(rhs)?.unwrap();
                self.push(Opcode::AssignNext {
                    off: *off as VariableOffset,
                });
                None
            }
            Expr::AssignTemp(off, rhs) => {
                self.walk_expr(rhs)?.unwrap();
                self.push(Opcode::StoreTemp {
                    off: *off as crate::bytecode::TempOffset,
                });
                None
            }
        };
        Ok(result)
    }

    fn walk_builtin(&mut self, builtin: &BuiltinFn) -> Result<()> {
        // lookups, reductions and the module-input predicate have their
        // own opcodes; everything else funnels through Apply
        match builtin {
            BuiltinFn::Lookup(ident, index, _loc) => {
                let table = match self.module.tables.get(ident) {
                    Some(table) => table,
                    None => {
                        return sim_err!(BadTable, ident.clone());
                    }
                };
                self.graphical_functions.push(CompiledGraphicalFunction {
                    data: table.data.clone(),
                    kind: table.kind,
                });
                let gf = (self.graphical_functions.len() - 1) as GraphicalFunctionId;
                self.walk_expr(index)?.unwrap();
                self.push(Opcode::Lookup { gf });
                return Ok(());
            }
            BuiltinFn::IsModuleInput(ident, _loc) => {
                let id = if self.module.inputs.contains(ident) {
                    self.curr_code.intern_literal(1.0)
                } else {
                    self.curr_code.intern_literal(0.0)
                };
                self.push(Opcode::LoadConstant { id });
                return Ok(());
            }
            BuiltinFn::Time
            | BuiltinFn::TimeStep
            | BuiltinFn::StartTime
            | BuiltinFn::FinalTime => {
                let off = match builtin {
                    BuiltinFn::Time => TIME_OFF,
                    BuiltinFn::TimeStep => DT_OFF,
                    BuiltinFn::StartTime => INITIAL_TIME_OFF,
                    BuiltinFn::FinalTime => FINAL_TIME_OFF,
                    _ => unreachable!(),
                } as VariableOffset;
                self.push(Opcode::LoadGlobalVar { off });
                return Ok(());
            }
            BuiltinFn::Sum(a) => {
                self.walk_expr(a)?.unwrap();
                self.push(Opcode::ArraySum {});
                return Ok(());
            }
            BuiltinFn::Min(a, None) => {
                self.walk_expr(a)?.unwrap();
                self.push(Opcode::ArrayMin {});
                return Ok(());
            }
            BuiltinFn::Max(a, None) => {
                self.walk_expr(a)?.unwrap();
                self.push(Opcode::ArrayMax {});
                return Ok(());
            }
            BuiltinFn::Mean(args) if args.len() == 1 && matches!(args[0], Expr::ViewRef(_, _)) => {
                self.walk_expr(&args[0])?.unwrap();
                self.push(Opcode::ArrayMean {});
                return Ok(());
            }
            BuiltinFn::Stddev(a) => {
                self.walk_expr(a)?.unwrap();
                self.push(Opcode::ArrayStddev {});
                return Ok(());
            }
            BuiltinFn::Size(a) => {
                self.walk_expr(a)?.unwrap();
                self.push(Opcode::ArraySize {});
                return Ok(());
            }
            BuiltinFn::Rank(_, _) => {
                // rank needs a sort; it stays interpreter-only until a
                // model that needs it in compiled form shows up
                return sim_err!(ArraysNotImplemented, "rank".to_string());
            }
            BuiltinFn::Mean(args) => {
                let id = self.curr_code.intern_literal(0.0);
                self.push(Opcode::LoadConstant { id });

                for arg in args.iter() {
                    self.walk_expr(arg)?.unwrap();
                    self.push(Opcode::Op2 { op: BcOp2::Add });
                }

                let id = self.curr_code.intern_literal(args.len() as f64);
                self.push(Opcode::LoadConstant { id });
                self.push(Opcode::Op2 { op: BcOp2::Div });
                return Ok(());
            }
            BuiltinFn::Inf | BuiltinFn::Pi => {
                let lit = match builtin {
                    BuiltinFn::Inf => f64::INFINITY,
                    BuiltinFn::Pi => std::f64::consts::PI,
                    _ => unreachable!(),
                };
                let id = self.curr_code.intern_literal(lit);
                self.push(Opcode::LoadConstant { id });
                return Ok(());
            }
            _ => {}
        }

        // the Apply path: up to 3 argument slots, zero-padded
        match builtin {
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
            | BuiltinFn::Tan(a) => {
                self.walk_expr(a)?.unwrap();
                let id = self.curr_code.intern_literal(0.0);
                self.push(Opcode::LoadConstant { id });
                self.push(Opcode::LoadConstant { id });
            }
            BuiltinFn::Max(a, Some(b)) | BuiltinFn::Min(a, Some(b)) | BuiltinFn::Step(a, b) => {
                self.walk_expr(a)?.unwrap();
                self.walk_expr(b)?.unwrap();
                let id = self.curr_code.intern_literal(0.0);
                self.push(Opcode::LoadConstant { id });
            }
            BuiltinFn::Pulse(a, b, c) => {
                self.walk_expr(a)?.unwrap();
                self.walk_expr(b)?.unwrap();
                match c {
                    Some(c) => {
                        self.walk_expr(c)?.unwrap();
                    }
                    None => {
                        let id = self.curr_code.intern_literal(0.0);
                        self.push(Opcode::LoadConstant { id });
                    }
                }
            }
            BuiltinFn::Ramp(a, b, c) => {
                self.walk_expr(a)?.unwrap();
                self.walk_expr(b)?.unwrap();
                match c {
                    Some(c) => {
                        self.walk_expr(c)?.unwrap();
                    }
                    None => {
                        // no end time: ramp forever
                        let id = self.curr_code.intern_literal(f64::INFINITY);
                        self.push(Opcode::LoadConstant { id });
                    }
                }
            }
            BuiltinFn::SafeDiv(a, b, c) => {
                self.walk_expr(a)?.unwrap();
                self.walk_expr(b)?.unwrap();
                match c {
                    Some(c) => {
                        self.walk_expr(c)?.unwrap();
                    }
                    None => {
                        let id = self.curr_code.intern_literal(0.0);
                        self.push(Opcode::LoadConstant { id });
                    }
                }
            }
            BuiltinFn::Rand(args) => {
                match args {
                    Some((a, b)) => {
                        self.walk_expr(a)?.unwrap();
                        self.walk_expr(b)?.unwrap();
                    }
                    None => {
                        let zero = self.curr_code.intern_literal(0.0);
                        let one = self.curr_code.intern_literal(1.0);
                        self.push(Opcode::LoadConstant { id: zero });
                        self.push(Opcode::LoadConstant { id: one });
                    }
                }
                let id = self.curr_code.intern_literal(0.0);
                self.push(Opcode::LoadConstant { id });
            }
            _ => unreachable!("builtin handled above"),
        }

        let func = match builtin {
            BuiltinFn::Abs(_) => BuiltinId::Abs,
            BuiltinFn::Arccos(_) => BuiltinId::Arccos,
            BuiltinFn::Arcsin(_) => BuiltinId::Arcsin,
            BuiltinFn::Arctan(_) => BuiltinId::Arctan,
            BuiltinFn::Cos(_) => BuiltinId::Cos,
            BuiltinFn::Exp(_) => BuiltinId::Exp,
            BuiltinFn::Int(_) => BuiltinId::Int,
            BuiltinFn::Ln(_) => BuiltinId::Ln,
            BuiltinFn::Log10(_) => BuiltinId::Log10,
            BuiltinFn::Max(_, _) => BuiltinId::Max,
            BuiltinFn::Min(_, _) => BuiltinId::Min,
            BuiltinFn::Pulse(_, _, _) => BuiltinId::Pulse,
            BuiltinFn::Ramp(_, _, _) => BuiltinId::Ramp,
            BuiltinFn::Rand(_) => BuiltinId::Rand,
            BuiltinFn::SafeDiv(_, _, _) => BuiltinId::SafeDiv,
            BuiltinFn::Sign(_) => BuiltinId::Sign,
            BuiltinFn::Sin(_) => BuiltinId::Sin,
            BuiltinFn::Sqrt(_) => BuiltinId::Sqrt,
            BuiltinFn::Step(_, _) => BuiltinId::Step,
            BuiltinFn::Tan(_) => BuiltinId::Tan,
            _ => unreachable!(),
        };

        self.push(Opcode::Apply { func });
        Ok(())
    }

    fn push(&mut self, op: Opcode) {
        self.curr_code.push_opcode(op)
    }

    fn compile(mut self) -> Result<CompiledModule> {
        let compiled_initials = Rc::new(self.walk(&self.module.runlist_initials)?);
        let compiled_flows = Rc::new(self.walk(&self.module.runlist_flows)?);
        let compiled_stocks = Rc::new(self.walk(&self.module.runlist_stocks)?);

        Ok(CompiledModule {
            ident: self.module.ident.clone(),
            n_slots: self.module.n_slots,
            context: Rc::new(ByteCodeContext {
                graphical_functions: self.graphical_functions,
                modules: self.module_decls,
                views: self.module.views.clone(),
                temp_size: self.module.temp_size,
            }),
            compiled_initials,
            compiled_flows,
            compiled_stocks,
        })
    }
}

/// `ident` of a Module is its module key; the model name is the part
/// before the first key separator.
pub(crate) fn strip_module_key(key: &str) -> &str {
    match key.find('⁚') {
        Some(pos) => &key[..pos],
        None => key,
    }
}

/// A fully lowered simulation: one Module per (model, inputs)
/// instantiation, plus the metadata the integrator and Results need.
pub struct Simulation {
    pub(crate) modules: HashMap<Ident, Module>,
    pub(crate) specs: Specs,
    pub(crate) root: Ident,
    pub(crate) offsets: HashMap<Ident, usize>,
    /// absolute stock slots for the whole module tree
    pub(crate) stocks: Vec<StockSlot>,
}

fn enumerate_instantiations(
    project: &Project,
    model_name: &str,
    inputs: &BTreeSet<Ident>,
    instantiations: &mut BTreeMap<Ident, (Ident, BTreeSet<Ident>)>,
) {
    let key = module_key(model_name, inputs);
    if instantiations.contains_key(&key) {
        return;
    }
    instantiations.insert(key, (model_name.to_string(), inputs.clone()));

    if let Some(model) = project.models.get(model_name) {
        for var in model.variables.values() {
            if let Variable::Module {
                model_name, inputs, ..
            } = var
            {
                let input_dsts: BTreeSet<Ident> =
                    inputs.iter().map(|mi| mi.dst.clone()).collect();
                enumerate_instantiations(project, model_name, &input_dsts, instantiations);
            }
        }
    }
}

impl Simulation {
    pub fn new(project: &Project, main_model_name: &str) -> Result<Self> {
        if !project.models.contains_key(main_model_name) {
            return sim_err!(
                NotSimulatable,
                format!("no model named '{}' to simulate", main_model_name)
            );
        }

        if !project.errors.is_empty() {
            let err = &project.errors[0];
            return Err(err.clone());
        }

        // reachability check up front so a missing model is one clear
        // error instead of a cascade
        {
            let project_models: HashMap<Ident, &ModelStage1> = project
                .models
                .iter()
                .map(|(name, model)| (name.clone(), model.as_ref()))
                .collect();
            let mut reachable = BTreeSet::new();
            enumerate_modules(&project_models, main_model_name, &mut reachable)?;
        }

        let mut instantiations = BTreeMap::new();
        let no_inputs = BTreeSet::new();
        enumerate_instantiations(project, main_model_name, &no_inputs, &mut instantiations);

        let mut compiled_modules: HashMap<Ident, Module> = HashMap::new();
        for (key, (model_name, inputs)) in instantiations.iter() {
            let model = Arc::clone(&project.models[model_name]);
            let is_root = model_name == main_model_name;
            let module = Module::new(project, model, inputs, is_root)?;
            compiled_modules.insert(key.clone(), module);
        }

        let specs = Specs::from(&project.datamodel.sim_specs);

        let offsets = calc_flattened_offsets(project, main_model_name);
        let offsets: HashMap<Ident, usize> =
            offsets.into_iter().map(|(k, (off, _))| (k, off)).collect();

        let stocks = flatten_stocks(&compiled_modules, main_model_name, 0);

        Ok(Simulation {
            modules: compiled_modules,
            specs,
            root: main_model_name.to_string(),
            offsets,
            stocks,
        })
    }

    pub fn compile(&self) -> Result<crate::vm::CompiledSimulation> {
        let modules: Result<HashMap<Ident, CompiledModule>> = self
            .modules
            .iter()
            .map(|(name, module)| module.compile().map(|module| (name.clone(), module)))
            .collect();

        Ok(crate::vm::CompiledSimulation {
            modules: modules?,
            specs: self.specs.clone(),
            root: self.root.clone(),
            offsets: self.offsets.clone(),
            stocks: self.stocks.clone(),
        })
    }

    pub fn runlist_order(&self) -> Vec<Ident> {
        let mut order = vec!["time".to_string()];
        self.flattened_order(&self.root, "", &mut order);
        order
    }

    fn flattened_order(&self, module_key_name: &str, prefix: &str, out: &mut Vec<Ident>) {
        let module = &self.modules[module_key_name];

        for ident in module.runlist_order.iter() {
            let is_module = module
                .runlist_stocks
                .iter()
                .chain(module.runlist_flows.iter())
                .any(|expr| matches!(expr, Expr::EvalModule(m, _, _) if m == ident));
            if is_module {
                let child_key = module
                    .runlist_stocks
                    .iter()
                    .chain(module.runlist_flows.iter())
                    .find_map(|expr| match expr {
                        Expr::EvalModule(m, key, _) if m == ident => Some(key.clone()),
                        _ => None,
                    })
                    .unwrap();
                let child_prefix = format!("{}{}.", prefix, quoteize(ident));
                self.flattened_order(&child_key, &child_prefix, out);
            } else {
                out.push(format!("{}{}", prefix, quoteize(ident)));
            }
        }
    }
}

/// Walk the module tree computing absolute stock slots.
fn flatten_stocks(
    modules: &HashMap<Ident, Module>,
    key: &str,
    base: usize,
) -> Vec<StockSlot> {
    let module = &modules[key];
    let mut stocks: Vec<StockSlot> = module
        .stocks
        .iter()
        .map(|slot| StockSlot {
            off: base + slot.off,
            size: slot.size,
            non_negative: slot.non_negative,
        })
        .collect();

    // recurse into nested module instances
    let model_name = strip_module_key(key);
    let offsets = &module.offsets[model_name];
    for expr in module
        .runlist_stocks
        .iter()
        .chain(module.runlist_flows.iter())
    {
        if let Expr::EvalModule(ident, child_key, _) = expr {
            let child_base = base + offsets[ident].0;
            stocks.extend(flatten_stocks(modules, child_key, child_base));
        }
    }

    stocks.sort_unstable_by_key(|slot| slot.off);
    stocks.dedup_by_key(|slot| slot.off);
    stocks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datamodel::SimMethod;
    use crate::testutils::{sim_specs, x_aux, x_flow, x_model, x_project, x_stock};

    fn project(models: &[crate::datamodel::Model]) -> Project {
        Project::from(x_project(sim_specs(0.0, 10.0, 1.0, SimMethod::Euler), models))
    }

    #[test]
    fn test_offsets_deterministic() {
        let model = x_model(
            "main",
            vec![
                x_stock("population", "100", &["births"], &[], None),
                x_flow("births", "population * birth_rate", None),
                x_aux("birth_rate", "0.02", None),
            ],
        );
        let project = project(&[model]);
        let sim = Simulation::new(&project, "main").unwrap();

        // implicit slots first, then variables sorted by ident
        assert_eq!(0, sim.offsets["time"]);
        assert_eq!(1, sim.offsets["dt"]);
        assert_eq!(IMPLICIT_VAR_COUNT, sim.offsets["birth_rate"]);
        assert_eq!(IMPLICIT_VAR_COUNT + 1, sim.offsets["births"]);
        assert_eq!(IMPLICIT_VAR_COUNT + 2, sim.offsets["population"]);
    }

    #[test]
    fn test_stock_slots() {
        let model = x_model(
            "main",
            vec![
                x_stock("population", "100", &["births"], &[], None),
                x_flow("births", "population * 0.02", None),
            ],
        );
        let project = project(&[model]);
        let sim = Simulation::new(&project, "main").unwrap();

        assert_eq!(1, sim.stocks.len());
        assert_eq!(sim.offsets["population"], sim.stocks[0].off);
        assert!(!sim.stocks[0].non_negative);
    }

    #[test]
    fn test_compile_to_bytecode() {
        let model = x_model(
            "main",
            vec![
                x_stock("population", "100", &["births"], &[], None),
                x_flow("births", "population * 0.02", None),
            ],
        );
        let project = project(&[model]);
        let sim = Simulation::new(&project, "main").unwrap();
        let compiled = sim.compile().unwrap();

        let module = &compiled.modules["main"];
        assert!(module
            .compiled_initials
            .code
            .iter()
            .any(|op| matches!(op, Opcode::AssignCurr { .. })));
        assert!(module
            .compiled_stocks
            .code
            .iter()
            .any(|op| matches!(op, Opcode::AssignNext { .. })));
        assert!(matches!(
            module.compiled_flows.code.last(),
            Some(Opcode::Ret)
        ));
    }

    #[test]
    fn test_errors_block_compilation() {
        let model = x_model("main", vec![x_aux("a", "nonexistent", None)]);
        let project = project(&[model]);
        assert!(Simulation::new(&project, "main").is_err());
    }

    #[test]
    fn test_module_key() {
        let no_inputs = BTreeSet::new();
        assert_eq!("smth1", module_key("smth1", &no_inputs));
        let inputs: BTreeSet<Ident> =
            ["input".to_string(), "delay_time".to_string()].into_iter().collect();
        assert_eq!("smth1⁚delay_time,input", module_key("smth1", &inputs));
    }
}
