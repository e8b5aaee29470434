// Copyright 2025 The Fluxion Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! Per-model semantic analysis: variable parsing, module wiring, and the
//! dependency maps the compiler's runlists are built from.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::result::Result as StdResult;

use crate::ast::lower_ast;
use crate::common::{
    canonicalize, len_utf8, EquationError, EquationResult, Error, ErrorCode, ErrorKind, Ident,
    Result,
};
use crate::dimensions::DimensionsContext;
use crate::variable::{identifier_set, parse_var, ModuleInput, Variable};
use crate::{datamodel, eqn_err, model_err, var_eqn_err};

pub type ModuleInputSet = BTreeSet<Ident>;
pub type DependencySet = BTreeSet<Ident>;

/// Stage 0: variables parsed (Expr0), module expansion done, nothing
/// resolved yet.
#[derive(Clone, Debug)]
pub struct ModelStage0 {
    pub name: Ident,
    pub variables: HashMap<Ident, Variable<crate::ast::Expr0>>,
    pub implicit: bool,
    /// duplicate-identifier errors found while collecting variables
    pub errors: Vec<(Ident, EquationError)>,
}

/// Stage 1: equations promoted to Expr1 and dependency maps computed.
#[derive(Clone, Debug)]
pub struct ModelStage1 {
    pub name: Ident,
    pub variables: HashMap<Ident, Variable>,
    pub errors: Option<Vec<Error>>,
    /// transitive set of model names referenced from modules here
    pub model_deps: Option<BTreeSet<Ident>>,
    dt_dep_map: Option<HashMap<Ident, DependencySet>>,
    initial_dep_map: Option<HashMap<Ident, DependencySet>>,
    pub implicit: bool,
}

pub fn build_xvars_map(
    name: Ident,
    m: &datamodel::Model,
) -> (Ident, HashMap<Ident, &datamodel::Variable>) {
    (
        canonicalize(&name),
        m.variables
            .iter()
            .map(|v| (canonicalize(v.get_ident()), v))
            .collect(),
    )
}

fn resolve_relative<'a>(
    models: &HashMap<Ident, HashMap<Ident, &'a datamodel::Variable>>,
    model_name: &str,
    ident: &str,
) -> Option<&'a datamodel::Variable> {
    let model = models.get(model_name)?;

    let input_prefix = format!("{}·", model_name);
    let ident = ident.strip_prefix(&input_prefix).unwrap_or(ident);

    // a still-dotted identifier is a further submodel reference
    if let Some(pos) = ident.find('·') {
        let submodel_module_name = &ident[..pos];
        let submodel_var = &ident[pos + len_utf8('·')..];
        let submodel_name = match model.get(submodel_module_name) {
            Some(datamodel::Variable::Module(module)) => canonicalize(&module.model_name),
            _ => return None,
        };
        resolve_relative(models, &submodel_name, submodel_var)
    } else {
        model.get(ident).copied()
    }
}

/// Resolve a module instantiation's `src → dst` pair against the models
/// it connects, reporting which end is broken if either is.
pub fn resolve_module_input(
    models: &HashMap<Ident, HashMap<Ident, &datamodel::Variable>>,
    parent_model_name: &str,
    module_ident: &str,
    orig_src: &str,
    orig_dst: &str,
) -> EquationResult<Option<ModuleInput>> {
    let input_prefix = format!("{}·", module_ident);

    let src: Ident = canonicalize(orig_src);
    let dst: Ident = canonicalize(orig_dst);

    let dst = match dst.strip_prefix(&input_prefix) {
        Some(dst) => dst.to_string(),
        None => {
            return eqn_err!(BadModuleInputDst, 0, 0);
        }
    };

    // synthesized identifiers (module expansion) are trusted; they refer
    // to variables added to the model in the same pass
    if src.starts_with(crate::common::SYNTHETIC_PREFIX) {
        return Ok(Some(ModuleInput { src, dst }));
    }

    match resolve_relative(models, parent_model_name, &src) {
        Some(_) => Ok(Some(ModuleInput { src, dst })),
        None => eqn_err!(BadModuleInputSrc, 0, 0),
    }
}

impl ModelStage0 {
    pub fn new(
        models: &HashMap<Ident, HashMap<Ident, &datamodel::Variable>>,
        x_model: &datamodel::Model,
        dims_ctx: &DimensionsContext,
        units_ctx: &crate::units::Context,
        implicit: bool,
    ) -> Self {
        let model_name = canonicalize(&x_model.name);
        let mut implicit_vars: Vec<datamodel::Variable> = Vec::new();

        let mapper = |mi: &datamodel::ModuleReference| -> EquationResult<Option<ModuleInput>> {
            // the module ident is the prefix of the dst
            let dst = canonicalize(&mi.dst);
            let module_ident = match dst.find('·') {
                Some(pos) => dst[..pos].to_string(),
                None => dst.clone(),
            };
            resolve_module_input(models, &model_name, &module_ident, &mi.src, &mi.dst)
        };

        let mut variable_list: Vec<Variable<crate::ast::Expr0>> = x_model
            .variables
            .iter()
            .map(|v| parse_var(dims_ctx, v, &mut implicit_vars, units_ctx, &mapper))
            .collect();

        {
            // expansion of stateful builtins inside the implicit vars
            // themselves has already happened; parsing them can't add more
            let mut dummy_implicit_vars: Vec<datamodel::Variable> = Vec::new();
            variable_list.extend(implicit_vars.iter().map(|x_var| {
                parse_var(dims_ctx, x_var, &mut dummy_implicit_vars, units_ctx, &mapper)
            }));
            assert_eq!(0, dummy_implicit_vars.len());
        }

        let mut errors: Vec<(Ident, EquationError)> = vec![];
        let mut variables: HashMap<Ident, Variable<crate::ast::Expr0>> = HashMap::new();
        for v in variable_list.into_iter() {
            let ident = v.ident().to_string();
            if variables.contains_key(&ident) {
                errors.push((
                    ident,
                    EquationError {
                        start: 0,
                        end: 0,
                        code: ErrorCode::DuplicateVariable,
                    },
                ));
            } else {
                variables.insert(ident, v);
            }
        }

        ModelStage0 {
            name: model_name,
            variables,
            implicit,
            errors,
        }
    }
}

pub(crate) fn lower_variable(
    dims_ctx: &DimensionsContext,
    var: &Variable<crate::ast::Expr0>,
) -> Variable {
    match var {
        Variable::Stock {
            ident,
            init_ast,
            eqn,
            units,
            inflows,
            outflows,
            non_negative,
            errors,
            unit_errors,
        } => {
            let mut errors = errors.clone();
            let init_ast = match init_ast {
                Some(ast) => match lower_ast(dims_ctx, ast.clone()) {
                    Ok(ast) => Some(ast),
                    Err(err) => {
                        errors.push(err);
                        None
                    }
                },
                None => None,
            };
            Variable::Stock {
                ident: ident.clone(),
                init_ast,
                eqn: eqn.clone(),
                units: units.clone(),
                inflows: inflows.clone(),
                outflows: outflows.clone(),
                non_negative: *non_negative,
                errors,
                unit_errors: unit_errors.clone(),
            }
        }
        Variable::Var {
            ident,
            ast,
            init_ast,
            eqn,
            units,
            table,
            non_negative,
            is_flow,
            errors,
            unit_errors,
        } => {
            let mut errors = errors.clone();
            let mut lower = |ast: &Option<crate::ast::Ast<crate::ast::Expr0>>| match ast {
                Some(ast) => match lower_ast(dims_ctx, ast.clone()) {
                    Ok(ast) => Some(ast),
                    Err(err) => {
                        errors.push(err);
                        None
                    }
                },
                None => None,
            };
            let ast = lower(ast);
            let init_ast = lower(init_ast);
            Variable::Var {
                ident: ident.clone(),
                ast,
                init_ast,
                eqn: eqn.clone(),
                units: units.clone(),
                table: table.clone(),
                non_negative: *non_negative,
                is_flow: *is_flow,
                errors,
                unit_errors: unit_errors.clone(),
            }
        }
        Variable::Module {
            ident,
            model_name,
            units,
            inputs,
            errors,
            unit_errors,
        } => Variable::Module {
            ident: ident.clone(),
            model_name: model_name.clone(),
            units: units.clone(),
            inputs: inputs.clone(),
            errors: errors.clone(),
            unit_errors: unit_errors.clone(),
        },
    }
}

struct DepContext<'a> {
    is_initial: bool,
    model_name: &'a str,
    models: &'a HashMap<Ident, &'a ModelStage1>,
    sibling_vars: &'a HashMap<Ident, Variable>,
    module_inputs: Option<&'a [ModuleInput]>,
    dims_ctx: &'a DimensionsContext,
}

fn resolve_relative_var<'a>(ctx: &DepContext<'a>, ident: &str) -> Option<&'a Variable> {
    let model_name = ctx.model_name;

    let input_prefix = format!("{}·", model_name);
    let ident = ident.strip_prefix(&input_prefix).unwrap_or(ident);

    if let Some(pos) = ident.find('·') {
        let submodel_module_name = &ident[..pos];
        let submodel_var = &ident[pos + len_utf8('·')..];
        let submodel_name = match ctx.sibling_vars.get(submodel_module_name) {
            Some(Variable::Module { model_name, .. }) => model_name.as_str(),
            _ => return None,
        };
        let submodel = ctx.models.get(submodel_name)?;
        let sub_ctx = DepContext {
            is_initial: ctx.is_initial,
            model_name: submodel_name,
            models: ctx.models,
            sibling_vars: &submodel.variables,
            module_inputs: None,
            dims_ctx: ctx.dims_ctx,
        };
        resolve_relative_var(&sub_ctx, submodel_var)
    } else {
        ctx.sibling_vars.get(ident)
    }
}

/// A module instance's dependencies on its siblings: the sources of its
/// wired inputs, except stocks (whose values come from the previous
/// step and don't order evaluation).
fn module_deps(ctx: &DepContext, var: &Variable) -> Vec<Ident> {
    if let Variable::Module { inputs, .. } = var {
        inputs
            .iter()
            .filter_map(|r| {
                let src = &r.src;
                let direct_dep = match src.find('·') {
                    Some(pos) => &src[..pos],
                    None => src.as_str(),
                };

                let is_stock = matches!(
                    resolve_relative_var(ctx, src),
                    Some(Variable::Stock { .. })
                );
                if is_stock && !ctx.is_initial {
                    None
                } else {
                    Some(direct_dep.to_string())
                }
            })
            .collect()
    } else {
        unreachable!();
    }
}

/// When `parent_var` reads `module·output`, the real dependencies are
/// the module instance itself plus the sources wired to whatever the
/// output depends on inside the module's model.
fn module_output_deps<'a>(
    ctx: &DepContext,
    model_name: &str,
    output_ident: &str,
    inputs: &'a [ModuleInput],
    module_ident: &'a str,
) -> Result<BTreeSet<Ident>> {
    let model = match ctx.models.get(model_name) {
        Some(model) => *model,
        None => {
            return model_err!(BadModelName, model_name.to_owned());
        }
    };

    let deps = if ctx.is_initial {
        model.initial_deps()
    } else {
        model.dt_deps()
    };
    let deps = match deps {
        Some(deps) => deps,
        None => {
            return model_err!(NotSimulatable, model_name.to_owned());
        }
    };

    if !deps.contains_key(output_ident) {
        return model_err!(UnknownDependency, output_ident.to_owned());
    }

    let output_var = &model.variables[output_ident];
    let output_deps = &deps[output_ident];

    let mut final_deps: BTreeSet<Ident> = BTreeSet::new();

    if ctx.is_initial || !output_var.is_stock() {
        final_deps.insert(module_ident.to_string());
    }

    for module_input in inputs.iter() {
        if module_input.dst == output_ident {
            final_deps.insert(module_input.src.clone());
        }
    }

    for dep in output_deps.iter() {
        for module_input in inputs.iter() {
            if module_input.dst == *dep {
                final_deps.insert(module_input.src.clone());
            }
        }
    }

    Ok(final_deps)
}

fn direct_deps(ctx: &DepContext, var: &Variable) -> Vec<Ident> {
    if var.is_module() {
        module_deps(ctx, var)
    } else {
        let ast = if ctx.is_initial {
            var.init_ast()
        } else {
            var.ast()
        };
        match ast {
            Some(ast) => {
                let module_inputs: Option<BTreeSet<Ident>> = ctx
                    .module_inputs
                    .map(|inputs| inputs.iter().map(|mi| mi.dst.clone()).collect());
                identifier_set(ast, ctx.dims_ctx, module_inputs.as_ref())
                    .into_iter()
                    .collect()
            }
            None => vec![],
        }
    }
}

/// Transitive dependency computation for every variable in a model.
/// Stocks terminate chains (except in the initial pass, where their
/// initial equations participate like any other).  A cycle through
/// non-stock variables is an error attributed to every variable on it.
fn all_deps<'a, Iter>(
    ctx: &DepContext,
    vars: Iter,
) -> StdResult<HashMap<Ident, DependencySet>, (Vec<Ident>, EquationError)>
where
    Iter: Iterator<Item = &'a Variable>,
{
    let vars = vars.collect::<Vec<_>>();
    let mut processing: BTreeSet<Ident> = BTreeSet::new();
    let mut all_vars: HashMap<&'a str, &'a Variable> =
        vars.iter().map(|v| (v.ident(), *v)).collect();
    let mut all_var_deps: HashMap<Ident, Option<DependencySet>> =
        vars.iter().map(|v| (v.ident().to_owned(), None)).collect();

    fn all_deps_inner<'a>(
        ctx: &DepContext,
        id: &str,
        processing: &mut BTreeSet<Ident>,
        all_vars: &mut HashMap<&'a str, &'a Variable>,
        all_var_deps: &mut HashMap<Ident, Option<DependencySet>>,
    ) -> StdResult<(), (Vec<Ident>, EquationError)> {
        let var = all_vars[id];

        // already done
        if all_var_deps[id].is_some() {
            return Ok(());
        }

        // dependency chains break at stocks: their values come from the
        // previous step.  in the initial pass they are ordinary.
        if var.is_stock() && !ctx.is_initial {
            all_var_deps.insert(id.to_owned(), Some(BTreeSet::new()));
            return Ok(());
        }

        processing.insert(id.to_owned());

        let mut all_deps: DependencySet = BTreeSet::new();

        for dep in direct_deps(ctx, var).into_iter() {
            // a dotted dependency like `sector·output` fans out into the
            // module plus the inputs the output depends on
            let filtered_deps: Vec<Ident> = if dep.contains('·') {
                let parts = dep.splitn(2, '·').collect::<Vec<_>>();
                let module_ident = parts[0];
                let output_ident = parts[1];

                if !all_vars.contains_key(module_ident) {
                    let loc = var
                        .ast()
                        .and_then(|ast| ast.get_var_loc(&dep))
                        .unwrap_or_default();
                    return var_eqn_err!(
                        vec![var.ident().to_owned()],
                        UnknownDependency,
                        loc.start,
                        loc.end
                    );
                }

                if let Variable::Module {
                    model_name, inputs, ..
                } = all_vars[module_ident]
                {
                    match module_output_deps(ctx, model_name, output_ident, inputs, module_ident)
                    {
                        Ok(deps) => deps.into_iter().collect(),
                        Err(err) => {
                            return Err((vec![var.ident().to_owned()], err.into()));
                        }
                    }
                } else {
                    let loc = var
                        .ast()
                        .and_then(|ast| ast.get_var_loc(&dep))
                        .unwrap_or_default();
                    return var_eqn_err!(
                        vec![var.ident().to_owned()],
                        ExpectedModule,
                        loc.start,
                        loc.end
                    );
                }
            } else {
                vec![dep]
            };

            for dep in filtered_deps {
                if !all_vars.contains_key(dep.as_str()) {
                    let loc = var
                        .ast()
                        .and_then(|ast| ast.get_var_loc(&dep))
                        .unwrap_or_default();
                    return var_eqn_err!(
                        vec![var.ident().to_owned()],
                        UnknownDependency,
                        loc.start,
                        loc.end
                    );
                }

                if ctx.is_initial || !all_vars[dep.as_str()].is_stock() {
                    all_deps.insert(dep.to_string());

                    if processing.contains(dep.as_str()) {
                        // a simultaneous-equation cycle; report it
                        // against everything participating
                        let loc = match var.ast() {
                            Some(ast) => ast.get_var_loc(&dep).unwrap_or_default(),
                            None => Default::default(),
                        };
                        let members: Vec<Ident> = processing.iter().cloned().collect();
                        return var_eqn_err!(members, CircularDependency, loc.start, loc.end);
                    }

                    if all_var_deps[dep.as_str()].is_none() {
                        all_deps_inner(ctx, &dep, processing, all_vars, all_var_deps)?;
                    }

                    // module deps were already flattened through
                    // module_output_deps above
                    if !all_vars[dep.as_str()].is_module() {
                        let dep_deps = all_var_deps[dep.as_str()].as_ref().unwrap();
                        all_deps.extend(dep_deps.iter().cloned());
                    }
                }
            }
        }

        processing.remove(id);

        all_var_deps.insert(id.to_owned(), Some(all_deps));

        Ok(())
    }

    for var in vars {
        all_deps_inner(
            ctx,
            var.ident(),
            &mut processing,
            &mut all_vars,
            &mut all_var_deps,
        )?;
    }

    let var_deps: HashMap<Ident, DependencySet> = all_var_deps
        .into_iter()
        .map(|(k, v)| (k, v.unwrap()))
        .collect();

    Ok(var_deps)
}

impl ModelStage1 {
    pub fn new(dims_ctx: &DimensionsContext, model: &ModelStage0) -> Self {
        let variables: HashMap<Ident, Variable> = model
            .variables
            .iter()
            .map(|(ident, var)| (ident.clone(), lower_variable(dims_ctx, var)))
            .collect();

        let model_deps = variables
            .values()
            .filter(|v| v.is_module())
            .map(|v| {
                if let Variable::Module { model_name, .. } = v {
                    model_name.to_owned()
                } else {
                    unreachable!();
                }
            })
            .collect();

        let mut errors: Vec<Error> = vec![];
        for (ident, err) in model.errors.iter() {
            errors.push(Error::new(
                ErrorKind::Variable,
                err.code,
                Some(ident.clone()),
            ));
        }

        ModelStage1 {
            name: model.name.clone(),
            variables,
            errors: if errors.is_empty() {
                None
            } else {
                Some(errors)
            },
            model_deps: Some(model_deps),
            dt_dep_map: None,
            initial_dep_map: None,
            implicit: model.implicit,
        }
    }

    pub(crate) fn dt_deps(&self) -> Option<&HashMap<Ident, DependencySet>> {
        self.dt_dep_map.as_ref()
    }

    pub(crate) fn initial_deps(&self) -> Option<&HashMap<Ident, DependencySet>> {
        self.initial_dep_map.as_ref()
    }

    /// Check stock inflow/outflow references and compute both dependency
    /// maps, collecting any errors onto the offending variables.
    pub fn set_dependencies(
        &mut self,
        models: &HashMap<Ident, &ModelStage1>,
        dims_ctx: &DimensionsContext,
    ) {
        let mut var_errors: HashMap<Ident, HashSet<EquationError>> = HashMap::new();

        // flows named by stocks must exist
        for (ident, var) in self.variables.iter() {
            if let Variable::Stock {
                inflows, outflows, ..
            } = var
            {
                for flow in inflows.iter().chain(outflows.iter()) {
                    if !self.variables.contains_key(flow) {
                        var_errors.entry(ident.clone()).or_default().insert(
                            EquationError {
                                start: 0,
                                end: 0,
                                code: ErrorCode::DanglingFlow,
                            },
                        );
                    }
                }
            }
        }

        let mut ctx = DepContext {
            is_initial: false,
            model_name: self.name.as_str(),
            models,
            sibling_vars: &self.variables,
            module_inputs: None,
            dims_ctx,
        };

        match all_deps(&ctx, self.variables.values()) {
            Ok(deps) => self.dt_dep_map = Some(deps),
            Err((idents, err)) => {
                for ident in idents {
                    var_errors.entry(ident).or_default().insert(err.clone());
                }
            }
        }

        ctx.is_initial = true;

        match all_deps(&ctx, self.variables.values()) {
            Ok(deps) => self.initial_dep_map = Some(deps),
            Err((idents, err)) => {
                for ident in idents {
                    var_errors.entry(ident).or_default().insert(err.clone());
                }
            }
        }

        let mut errors: Vec<Error> = self.errors.take().unwrap_or_default();
        let mut variables_have_errors = false;
        for (ident, var) in self.variables.iter_mut() {
            if var_errors.contains_key(ident) {
                let errs = std::mem::take(var_errors.get_mut(ident).unwrap());
                for error in errs.into_iter() {
                    var.push_error(error);
                }
                variables_have_errors = true;
            }
            if var.equation_errors().is_some() {
                variables_have_errors = true;
            }
        }

        if variables_have_errors {
            errors.push(Error::new(
                ErrorKind::Model,
                ErrorCode::VariablesHaveErrors,
                None,
            ));
        }

        self.errors = match errors.len() {
            0 => None,
            _ => Some(errors),
        };
    }

    pub fn get_variable_errors(&self) -> HashMap<Ident, Vec<EquationError>> {
        self.variables
            .iter()
            .filter(|(_, var)| var.equation_errors().is_some())
            .map(|(ident, var)| (ident.clone(), var.equation_errors().unwrap()))
            .collect()
    }

    pub fn get_unit_errors(&self) -> HashMap<Ident, Vec<crate::common::UnitError>> {
        self.variables
            .iter()
            .filter(|(_, var)| var.unit_errors().is_some())
            .map(|(ident, var)| (ident.clone(), var.unit_errors().unwrap()))
            .collect()
    }
}

/// Walk the instantiation graph, recording every model reachable from
/// `model_name` through module variables.
pub(crate) fn enumerate_modules(
    models: &HashMap<Ident, &ModelStage1>,
    model_name: &str,
    modules: &mut BTreeSet<Ident>,
) -> Result<()> {
    let model = *models.get(model_name).ok_or_else(|| Error {
        kind: ErrorKind::Simulation,
        code: ErrorCode::NotSimulatable,
        details: Some(format!("model for module '{}' not found", model_name)),
    })?;
    for v in model.variables.values() {
        if let Variable::Module { model_name, .. } = v {
            if modules.insert(model_name.clone()) {
                enumerate_modules(models, model_name, modules)?;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::{x_aux, x_flow, x_model, x_stock};

    fn stage1(x_model: &datamodel::Model) -> ModelStage1 {
        let dims_ctx = DimensionsContext::default();
        let units_ctx = crate::units::Context::default();
        let models: HashMap<Ident, HashMap<Ident, &datamodel::Variable>> =
            [build_xvars_map(x_model.name.clone(), x_model)]
                .into_iter()
                .collect();
        let s0 = ModelStage0::new(&models, x_model, &dims_ctx, &units_ctx, false);
        let mut s1 = ModelStage1::new(&dims_ctx, &s0);
        let empty = HashMap::new();
        s1.set_dependencies(&empty, &dims_ctx);
        s1
    }

    #[test]
    fn test_simple_deps() {
        let model = x_model(
            "main",
            vec![
                x_aux("a", "1", None),
                x_aux("b", "a + 1", None),
                x_aux("c", "b * 2", None),
                x_stock("s", "c", &["inflow"], &[], None),
                x_flow("inflow", "s / 4", None),
            ],
        );
        let model = stage1(&model);
        assert!(model.errors.is_none());

        let dt_deps = model.dt_deps().unwrap();
        assert_eq!(
            dt_deps["c"],
            ["a", "b"].iter().map(|s| s.to_string()).collect()
        );
        // stocks terminate dependency chains in the dt pass
        assert!(dt_deps["inflow"].is_empty());
        assert!(dt_deps["s"].is_empty());

        // in the initial pass the stock's initial equation participates
        let initial_deps = model.initial_deps().unwrap();
        assert_eq!(
            initial_deps["s"],
            ["a", "b", "c"].iter().map(|s| s.to_string()).collect()
        );
    }

    #[test]
    fn test_unknown_dependency() {
        let model = x_model("main", vec![x_aux("a", "nonexistent * 2", None)]);
        let model = stage1(&model);
        assert!(model.errors.is_some());
        let var_errors = model.get_variable_errors();
        assert_eq!(
            ErrorCode::UnknownDependency,
            var_errors["a"][0].code
        );
    }

    #[test]
    fn test_cycle_detection_names_all_members() {
        let model = x_model(
            "main",
            vec![x_aux("x", "y + 1", None), x_aux("y", "x + 1", None)],
        );
        let model = stage1(&model);
        assert!(model.errors.is_some());

        let var_errors = model.get_variable_errors();
        assert!(var_errors.contains_key("x"), "cycle error names x");
        assert!(var_errors.contains_key("y"), "cycle error names y");
        assert!(var_errors
            .values()
            .flatten()
            .all(|e| e.code == ErrorCode::CircularDependency));
    }

    #[test]
    fn test_self_reference_is_a_cycle() {
        let model = x_model("main", vec![x_aux("a", "a", None)]);
        let model = stage1(&model);
        assert!(model.errors.is_some());
        let var_errors = model.get_variable_errors();
        assert_eq!(ErrorCode::CircularDependency, var_errors["a"][0].code);
    }

    #[test]
    fn test_stock_self_loop_is_legal() {
        let model = x_model(
            "main",
            vec![
                x_stock("population", "100", &["births"], &[], None),
                x_flow("births", "population * 0.02", None),
            ],
        );
        let model = stage1(&model);
        assert!(model.errors.is_none());
    }

    #[test]
    fn test_dangling_flow() {
        let model = x_model(
            "main",
            vec![x_stock("s", "100", &["does_not_exist"], &[], None)],
        );
        let model = stage1(&model);
        assert!(model.errors.is_some());
        let var_errors = model.get_variable_errors();
        assert_eq!(ErrorCode::DanglingFlow, var_errors["s"][0].code);
    }

    #[test]
    fn test_duplicate_variable() {
        let model = x_model(
            "main",
            vec![x_aux("a", "1", None), x_aux("A", "2", None)],
        );
        let model = stage1(&model);
        assert!(model.errors.is_some());
    }
}
