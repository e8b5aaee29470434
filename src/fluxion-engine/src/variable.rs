// Copyright 2025 The Fluxion Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::ast::{Ast, Expr0, Expr1, IndexExpr1};
use crate::builtins::{walk_builtin_expr, BuiltinContents, BuiltinFn};
use crate::builtins_visitor::instantiate_implicit_modules;
use crate::common::{
    canonicalize, DimensionName, EquationError, EquationResult, ErrorCode, Ident, UnitError,
};
use crate::datamodel::{Dimension, GraphicalFunctionKind};
use crate::dimensions::DimensionsContext;
use crate::token::LexerType;
use crate::units::{parse_units, UnitMap};
use crate::{datamodel, eqn_err, units};

/// A graphical function normalized for evaluation: explicit x for every
/// y, plus the interpolation kind.
#[derive(Clone, PartialEq, Debug)]
pub struct Table {
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    pub kind: GraphicalFunctionKind,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ModuleInput {
    /// the identifier in the instantiating model to read
    pub src: Ident,
    /// the identifier in the module's model to override
    pub dst: Ident,
}

/// The engine's view of a variable, parameterized by equation stage.
/// Flows and auxes share the `Var` variant (a flow is an aux whose value
/// is integrated into stocks).
#[derive(Clone, PartialEq, Debug)]
pub enum Variable<E = Expr1> {
    Stock {
        ident: Ident,
        init_ast: Option<Ast<E>>,
        eqn: Option<datamodel::Equation>,
        units: Option<UnitMap>,
        inflows: Vec<Ident>,
        outflows: Vec<Ident>,
        non_negative: bool,
        errors: Vec<EquationError>,
        unit_errors: Vec<UnitError>,
    },
    Var {
        ident: Ident,
        ast: Option<Ast<E>>,
        init_ast: Option<Ast<E>>,
        eqn: Option<datamodel::Equation>,
        units: Option<UnitMap>,
        table: Option<Table>,
        non_negative: bool,
        is_flow: bool,
        errors: Vec<EquationError>,
        unit_errors: Vec<UnitError>,
    },
    Module {
        ident: Ident,
        model_name: Ident,
        units: Option<UnitMap>,
        inputs: Vec<ModuleInput>,
        errors: Vec<EquationError>,
        unit_errors: Vec<UnitError>,
    },
}

impl<E> Variable<E> {
    pub fn ident(&self) -> &str {
        match self {
            Variable::Stock { ident, .. }
            | Variable::Var { ident, .. }
            | Variable::Module { ident, .. } => ident.as_str(),
        }
    }

    pub fn ast(&self) -> Option<&Ast<E>> {
        match self {
            Variable::Stock {
                init_ast: Some(ast),
                ..
            }
            | Variable::Var { ast: Some(ast), .. } => Some(ast),
            _ => None,
        }
    }

    /// the initial-value AST if one exists, otherwise the regular one
    pub fn init_ast(&self) -> Option<&Ast<E>> {
        if let Variable::Var {
            init_ast: Some(ast),
            ..
        } = self
        {
            return Some(ast);
        }
        self.ast()
    }

    pub fn get_dimensions(&self) -> Option<&[Dimension]> {
        self.ast().and_then(|ast| ast.dimensions())
    }

    pub fn is_stock(&self) -> bool {
        matches!(self, Variable::Stock { .. })
    }

    pub fn is_flow(&self) -> bool {
        matches!(self, Variable::Var { is_flow: true, .. })
    }

    pub fn is_module(&self) -> bool {
        matches!(self, Variable::Module { .. })
    }

    pub fn non_negative(&self) -> bool {
        match self {
            Variable::Stock { non_negative, .. } | Variable::Var { non_negative, .. } => {
                *non_negative
            }
            Variable::Module { .. } => false,
        }
    }

    pub fn table(&self) -> Option<&Table> {
        match self {
            Variable::Var { table, .. } => table.as_ref(),
            _ => None,
        }
    }

    pub fn units(&self) -> Option<&UnitMap> {
        match self {
            Variable::Stock { units, .. }
            | Variable::Var { units, .. }
            | Variable::Module { units, .. } => units.as_ref(),
        }
    }

    pub fn equation_errors(&self) -> Option<Vec<EquationError>> {
        let errors = match self {
            Variable::Stock { errors, .. }
            | Variable::Var { errors, .. }
            | Variable::Module { errors, .. } => errors,
        };
        if errors.is_empty() {
            None
        } else {
            Some(errors.clone())
        }
    }

    pub fn unit_errors(&self) -> Option<Vec<UnitError>> {
        let errors = match self {
            Variable::Stock { unit_errors, .. }
            | Variable::Var { unit_errors, .. }
            | Variable::Module { unit_errors, .. } => unit_errors,
        };
        if errors.is_empty() {
            None
        } else {
            Some(errors.clone())
        }
    }

    pub fn push_error(&mut self, err: EquationError) {
        match self {
            Variable::Stock { errors, .. }
            | Variable::Var { errors, .. }
            | Variable::Module { errors, .. } => errors.push(err),
        }
    }

    pub fn push_unit_error(&mut self, err: UnitError) {
        match self {
            Variable::Stock { unit_errors, .. }
            | Variable::Var { unit_errors, .. }
            | Variable::Module { unit_errors, .. } => unit_errors.push(err),
        }
    }
}

fn parse_table(gf: &Option<datamodel::GraphicalFunction>) -> EquationResult<Option<Table>> {
    let gf = match gf {
        Some(gf) => gf,
        None => return Ok(None),
    };

    if gf.y_points.is_empty() {
        return eqn_err!(BadTable, 0, 0);
    }

    let x: Vec<f64> = match &gf.x_points {
        Some(x_points) => {
            if x_points.len() != gf.y_points.len() {
                return eqn_err!(BadTable, 0, 0);
            }
            // explicit x-points must be strictly increasing
            if x_points.windows(2).any(|w| w[0] >= w[1]) {
                return eqn_err!(BadTable, 0, 0);
            }
            x_points.clone()
        }
        None => {
            let x_min = gf.x_scale.min;
            let x_max = gf.x_scale.max;
            let size = gf.y_points.len() as f64;
            gf.y_points
                .iter()
                .enumerate()
                .map(|(i, _)| {
                    if size <= 1.0 {
                        x_min
                    } else {
                        ((i as f64) / (size - 1.0)) * (x_max - x_min) + x_min
                    }
                })
                .collect()
        }
    };

    Ok(Some(Table {
        x,
        y: gf.y_points.clone(),
        kind: gf.kind,
    }))
}

fn get_dimensions(
    ctx: &DimensionsContext,
    names: &[DimensionName],
) -> Result<Vec<Dimension>, EquationError> {
    names
        .iter()
        .map(|name| {
            let name = canonicalize(name);
            match ctx.get(&name) {
                Some(dim) => Ok(dim.clone()),
                None => eqn_err!(BadDimensionName, 0, 0),
            }
        })
        .collect()
}

fn parse_equation(
    eqn: &datamodel::Equation,
    dims_ctx: &DimensionsContext,
    is_initial: bool,
) -> (Option<Ast<Expr0>>, Vec<EquationError>) {
    fn parse_inner(eqn: &str) -> (Option<Expr0>, Vec<EquationError>) {
        match Expr0::new(eqn, LexerType::Equation) {
            Ok(expr) => (expr, vec![]),
            Err(errors) => (None, errors),
        }
    }
    match eqn {
        datamodel::Equation::Scalar(eqn, init_eqn) => {
            let (ast, errors) = if !is_initial {
                parse_inner(eqn)
            } else if let Some(init_eqn) = init_eqn {
                parse_inner(init_eqn)
            } else {
                (None, vec![])
            };
            (ast.map(Ast::Scalar), errors)
        }
        datamodel::Equation::ApplyToAll(dimension_names, eqn, init_eqn) => {
            let (ast, mut errors) = if !is_initial {
                parse_inner(eqn)
            } else if let Some(init_eqn) = init_eqn {
                parse_inner(init_eqn)
            } else {
                (None, vec![])
            };

            match get_dimensions(dims_ctx, dimension_names) {
                Ok(dims) => (ast.map(|ast| Ast::ApplyToAll(dims, ast)), errors),
                Err(err) => {
                    errors.push(err);
                    (None, errors)
                }
            }
        }
        datamodel::Equation::Arrayed(dimension_names, elements) => {
            let mut errors: Vec<EquationError> = vec![];
            let elements: HashMap<_, _> = elements
                .iter()
                .map(|(subscript, eqn, init_eqn)| {
                    let (ast, single_errors) = if is_initial && init_eqn.is_some() {
                        parse_inner(init_eqn.as_ref().unwrap())
                    } else if is_initial {
                        (None, vec![])
                    } else {
                        parse_inner(eqn)
                    };
                    errors.extend(single_errors);
                    (canonicalize(subscript), ast)
                })
                .filter(|(_, ast)| ast.is_some())
                .map(|(subscript, ast)| (subscript, ast.unwrap()))
                .collect();

            if elements.is_empty() && is_initial {
                return (None, errors);
            }

            match get_dimensions(dims_ctx, dimension_names) {
                Ok(dims) => (Some(Ast::Arrayed(dims, elements)), errors),
                Err(err) => {
                    errors.push(err);
                    (None, errors)
                }
            }
        }
    }
}

/// Parse a datamodel variable into the engine's stage-0 representation.
/// Stateful builtin calls expand here; the synthesized variables they
/// produce are appended to `implicit_vars`.
pub fn parse_var<F>(
    dims_ctx: &DimensionsContext,
    v: &datamodel::Variable,
    implicit_vars: &mut Vec<datamodel::Variable>,
    units_ctx: &units::Context,
    module_input_mapper: F,
) -> Variable<Expr0>
where
    F: Fn(&datamodel::ModuleReference) -> EquationResult<Option<ModuleInput>>,
{
    let mut parse_and_expand = |ident: &str,
                                eqn: &datamodel::Equation,
                                is_initial: bool,
                                can_be_module_input: bool|
     -> (Option<Ast<Expr0>>, Vec<EquationError>) {
        let (ast, mut errors) = parse_equation(eqn, dims_ctx, is_initial);
        let ast = match ast {
            Some(ast) => match instantiate_implicit_modules(ident, ast) {
                Ok((ast, mut new_vars)) => {
                    implicit_vars.append(&mut new_vars);
                    Some(ast)
                }
                Err(err) => {
                    errors.push(err);
                    None
                }
            },
            None => {
                if errors.is_empty() && !is_initial && !can_be_module_input {
                    errors.push(EquationError {
                        start: 0,
                        end: 0,
                        code: ErrorCode::EmptyEquation,
                    })
                }
                None
            }
        };

        (ast, errors)
    };

    let mut parse_units_for = |units: Option<&str>,
                               unit_errors: &mut Vec<UnitError>|
     -> Option<UnitMap> {
        match parse_units(units_ctx, units) {
            Ok(units) => units,
            Err(errors) => {
                for err in errors.into_iter() {
                    unit_errors.push(err);
                }
                None
            }
        }
    };

    match v {
        datamodel::Variable::Stock(v) => {
            let ident = canonicalize(&v.ident);

            let (init_ast, errors) =
                parse_and_expand(&ident, &v.equation, false, v.can_be_module_input);

            let mut unit_errors: Vec<UnitError> = vec![];
            let units = parse_units_for(v.units.as_deref(), &mut unit_errors);

            Variable::Stock {
                ident,
                init_ast,
                eqn: Some(v.equation.clone()),
                units,
                inflows: v.inflows.iter().map(|id| canonicalize(id)).collect(),
                outflows: v.outflows.iter().map(|id| canonicalize(id)).collect(),
                non_negative: v.non_negative,
                errors,
                unit_errors,
            }
        }
        datamodel::Variable::Flow(v) => {
            let ident = canonicalize(&v.ident);

            let (ast, mut errors) =
                parse_and_expand(&ident, &v.equation, false, v.can_be_module_input);
            let (init_ast, init_errors) =
                parse_and_expand(&ident, &v.equation, true, v.can_be_module_input);
            errors.extend(init_errors);

            let mut unit_errors: Vec<UnitError> = vec![];
            let units = parse_units_for(v.units.as_deref(), &mut unit_errors);

            let table = match parse_table(&v.gf) {
                Ok(table) => table,
                Err(err) => {
                    errors.push(err);
                    None
                }
            };

            Variable::Var {
                ident,
                ast,
                init_ast,
                eqn: Some(v.equation.clone()),
                units,
                table,
                non_negative: v.non_negative,
                is_flow: true,
                errors,
                unit_errors,
            }
        }
        datamodel::Variable::Aux(v) => {
            let ident = canonicalize(&v.ident);

            let (ast, mut errors) =
                parse_and_expand(&ident, &v.equation, false, v.can_be_module_input);
            let (init_ast, init_errors) =
                parse_and_expand(&ident, &v.equation, true, v.can_be_module_input);
            errors.extend(init_errors);

            let mut unit_errors: Vec<UnitError> = vec![];
            let units = parse_units_for(v.units.as_deref(), &mut unit_errors);

            let table = match parse_table(&v.gf) {
                Ok(table) => table,
                Err(err) => {
                    errors.push(err);
                    None
                }
            };

            Variable::Var {
                ident,
                ast,
                init_ast,
                eqn: Some(v.equation.clone()),
                units,
                table,
                non_negative: false,
                is_flow: false,
                errors,
                unit_errors,
            }
        }
        datamodel::Variable::Module(v) => {
            let ident = canonicalize(&v.ident);
            let inputs = v.references.iter().map(module_input_mapper);
            let (inputs, errors): (Vec<_>, Vec<_>) = inputs.partition(EquationResult::is_ok);
            let inputs: Vec<ModuleInput> = inputs.into_iter().flat_map(|i| i.unwrap()).collect();
            let errors: Vec<EquationError> = errors.into_iter().map(|e| e.unwrap_err()).collect();

            let mut unit_errors: Vec<UnitError> = vec![];
            let units = parse_units_for(v.units.as_deref(), &mut unit_errors);

            Variable::Module {
                model_name: canonicalize(&v.model_name),
                ident,
                units,
                inputs,
                errors,
                unit_errors,
            }
        }
    }
}

struct IdentifierSetVisitor<'a> {
    identifiers: HashSet<Ident>,
    dims_ctx: &'a DimensionsContext,
    module_inputs: Option<&'a BTreeSet<Ident>>,
}

impl IdentifierSetVisitor<'_> {
    fn walk_index(&mut self, e: &IndexExpr1) {
        match e {
            IndexExpr1::Wildcard(_) => {}
            IndexExpr1::StarRange(_, _) => {}
            IndexExpr1::DimPosition(_, _) => {}
            IndexExpr1::Range(l, r, _) => {
                self.walk(l);
                self.walk(r);
            }
            IndexExpr1::Expr(expr) => {
                // a bare dimension name inside a subscript is a
                // positional reference, not a data dependency
                if let Expr1::Var(id, _) = expr {
                    if self.dims_ctx.contains(id) {
                        return;
                    }
                }
                self.walk(expr)
            }
        }
    }

    fn walk(&mut self, e: &Expr1) {
        match e {
            Expr1::Const(_, _, _) => (),
            Expr1::Var(id, _) => {
                // a bare dimension name evaluates to the current element
                // index, not to a variable
                if !self.dims_ctx.contains(id) {
                    self.identifiers.insert(id.clone());
                }
            }
            Expr1::App(builtin, _) => {
                walk_builtin_expr(builtin, |contents| match contents {
                    BuiltinContents::Ident(id, _loc) => {
                        // ismoduleinput() queries structure, not data
                        if !matches!(builtin, BuiltinFn::IsModuleInput(_, _)) {
                            self.identifiers.insert(id.to_owned());
                        }
                    }
                    BuiltinContents::Expr(expr) => self.walk(expr),
                });
            }
            Expr1::Subscript(id, args, _) => {
                self.identifiers.insert(id.clone());
                args.iter().for_each(|arg| self.walk_index(arg));
            }
            Expr1::Op2(_, l, r, _) => {
                self.walk(l);
                self.walk(r);
            }
            Expr1::Op1(_, l, _) => {
                self.walk(l);
            }
            Expr1::If(cond, t, f, _) => {
                // with module-input knowledge, an `if ismoduleinput(x)`
                // conditional only depends on the branch that will
                // actually be taken
                if let Some(module_inputs) = self.module_inputs {
                    if let Expr1::App(BuiltinFn::IsModuleInput(ident, _), _) = cond.as_ref() {
                        if module_inputs.contains(ident) {
                            self.walk(t);
                        } else {
                            self.walk(f);
                        }
                        return;
                    }
                }

                self.walk(cond);
                self.walk(t);
                self.walk(f);
            }
        }
    }
}

/// The set of identifiers an equation reads.
pub fn identifier_set(
    ast: &Ast<Expr1>,
    dims_ctx: &DimensionsContext,
    module_inputs: Option<&BTreeSet<Ident>>,
) -> HashSet<Ident> {
    let mut id_visitor = IdentifierSetVisitor {
        identifiers: HashSet::new(),
        dims_ctx,
        module_inputs,
    };
    match ast {
        Ast::Scalar(ast) => id_visitor.walk(ast),
        Ast::ApplyToAll(_, ast) => id_visitor.walk(ast),
        Ast::Arrayed(_, elements) => {
            for ast in elements.values() {
                id_visitor.walk(ast);
            }
        }
    };
    id_visitor.identifiers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::lower_ast;
    use crate::datamodel::{Equation, GraphicalFunction, GraphicalFunctionScale};

    fn identifiers(eqn: &str, module_inputs: Option<&[&str]>) -> HashSet<Ident> {
        let dims_ctx = DimensionsContext::from(&[Dimension::Named(
            "dim1".to_string(),
            vec!["foo".to_string()],
        )]);
        let (ast, errors) =
            parse_equation(&Equation::Scalar(eqn.to_string(), None), &dims_ctx, false);
        assert!(errors.is_empty());
        let ast = lower_ast(&dims_ctx, ast.unwrap()).unwrap();
        let module_inputs: Option<BTreeSet<Ident>> =
            module_inputs.map(|ids| ids.iter().map(|s| s.to_string()).collect());
        identifier_set(&ast, &dims_ctx, module_inputs.as_ref())
    }

    fn set(ids: &[&str]) -> HashSet<Ident> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_identifier_sets() {
        assert_eq!(set(&["a", "b", "c"]), identifiers("if a then b else c", None));
        assert_eq!(set(&["b", "c"]), identifiers("lookup(b, c)", None));
        assert_eq!(set(&["a"]), identifiers("-(a)", None));
        assert_eq!(
            set(&["a", "b", "c"]),
            identifiers("if a = 1 then -c else lookup(c,b)", None)
        );
        assert_eq!(set(&["a·d", "b", "c"]), identifiers("if a.d then b else c", None));
        // a subscript that names a dimension element is not a dependency
        assert_eq!(set(&["g"]), identifiers("g[foo]", None));
        // nor is one that names a whole dimension
        assert_eq!(set(&["g"]), identifiers("g[dim1]", None));
    }

    #[test]
    fn test_ismoduleinput_narrowing() {
        assert_eq!(
            set(&["b"]),
            identifiers("if ismoduleinput(input) then b else c", Some(&["input"]))
        );
        assert_eq!(
            set(&["c"]),
            identifiers("if ismoduleinput(input) then b else c", Some(&[]))
        );
    }

    #[test]
    fn test_table_parsing() {
        let gf = GraphicalFunction {
            kind: GraphicalFunctionKind::Continuous,
            x_points: None,
            y_points: vec![0.0, 0.5, 1.0],
            x_scale: GraphicalFunctionScale { min: 0.0, max: 10.0 },
            y_scale: GraphicalFunctionScale { min: 0.0, max: 1.0 },
        };
        let table = parse_table(&Some(gf)).unwrap().unwrap();
        assert_eq!(vec![0.0, 5.0, 10.0], table.x);

        // explicit x-points must be strictly increasing
        let gf = GraphicalFunction {
            kind: GraphicalFunctionKind::Continuous,
            x_points: Some(vec![0.0, 0.0, 1.0]),
            y_points: vec![0.0, 0.5, 1.0],
            x_scale: GraphicalFunctionScale { min: 0.0, max: 1.0 },
            y_scale: GraphicalFunctionScale { min: 0.0, max: 1.0 },
        };
        assert!(parse_table(&Some(gf)).is_err());
    }

    #[test]
    fn test_parse_var_stock() {
        let dims_ctx = DimensionsContext::default();
        let units_ctx = units::Context::default();
        let x_var = datamodel::Variable::Stock(datamodel::Stock {
            ident: "Population".to_string(),
            equation: Equation::Scalar("100".to_string(), None),
            documentation: "".to_string(),
            units: None,
            inflows: vec!["Births".to_string()],
            outflows: vec![],
            non_negative: false,
            can_be_module_input: false,
        });

        let mut implicit_vars = Vec::new();
        let var = parse_var(&dims_ctx, &x_var, &mut implicit_vars, &units_ctx, |mi| {
            Ok(Some(ModuleInput {
                src: canonicalize(&mi.src),
                dst: canonicalize(&mi.dst),
            }))
        });

        assert!(implicit_vars.is_empty());
        assert_eq!("population", var.ident());
        assert!(var.is_stock());
        assert!(var.equation_errors().is_none());
        if let Variable::Stock { inflows, .. } = &var {
            assert_eq!(vec!["births".to_string()], *inflows);
        }
    }
}
