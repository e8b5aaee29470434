// Copyright 2025 The Fluxion Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::common::{topo_sort, Error, ErrorCode, ErrorKind, Ident, Result};
use crate::datamodel;
use crate::dimensions::DimensionsContext;
use crate::ltm_augment::generate_ltm_variables;
use crate::model::{build_xvars_map, ModelStage0, ModelStage1};
use crate::units::Context as UnitContext;
use crate::variable::Variable;

/// A semantically analyzed project: every model parsed, dependencies
/// resolved, units checked, stdlib templates injected.  Deeply immutable
/// once constructed; simulations hold their own mutable state.
#[derive(Clone, Debug)]
pub struct Project {
    pub datamodel: datamodel::Project,
    // Arcs so multiple compiled modules can share a ModelStage1
    pub models: HashMap<Ident, Arc<ModelStage1>>,
    pub errors: Vec<Error>,
    pub dims_ctx: DimensionsContext,
    pub units_ctx: UnitContext,
}

impl Project {
    pub fn name(&self) -> &str {
        &self.datamodel.name
    }

    /// Models with errors, for diagnostics surfaces.
    pub fn models_with_errors(&self) -> Vec<&ModelStage1> {
        self.models
            .values()
            .filter(|m| m.errors.is_some())
            .map(|m| m.as_ref())
            .collect()
    }

    /// Rebuild this project with Loops-That-Matter instrumentation:
    /// synthetic link-score and loop-score variables are injected and
    /// become ordinary time series in the results.
    pub fn with_ltm(self) -> Result<Self> {
        abort_if_arrayed(&self)?;

        let ltm_vars = generate_ltm_variables(&self)?;
        if ltm_vars.is_empty() {
            // no loops detected, nothing to instrument
            return Ok(self);
        }

        let mut new_datamodel = self.datamodel.clone();

        for model in &mut new_datamodel.models {
            let model_name = crate::common::canonicalize(&model.name);

            if let Some(synthetic_vars) = ltm_vars.get(&model_name) {
                for (_, var) in synthetic_vars {
                    model.variables.push(var.clone());
                }
            }
        }

        Ok(Project::from(new_datamodel))
    }
}

impl From<datamodel::Project> for Project {
    fn from(project_datamodel: datamodel::Project) -> Self {
        let mut project_errors = vec![];

        let units_ctx = UnitContext::new_with_builtins(
            &project_datamodel.units,
            &project_datamodel.sim_specs,
        )
        .unwrap_or_else(|errs| {
            for (unit_name, unit_errs) in errs {
                for err in unit_errs {
                    project_errors.push(Error {
                        kind: ErrorKind::Model,
                        code: ErrorCode::UnitDefinitionErrors,
                        details: Some(format!("{}: {}", unit_name, err)),
                    });
                }
            }
            Default::default()
        });

        let dims_ctx = DimensionsContext::from(&project_datamodel.dimensions);

        // simulation specs sanity; a broken project still parses, but we
        // record why it won't simulate
        {
            let specs = &project_datamodel.sim_specs;
            let dt = match specs.dt {
                datamodel::Dt::Dt(dt) => dt,
                datamodel::Dt::Reciprocal(dt) => 1.0 / dt,
            };
            if specs.stop < specs.start || dt <= 0.0 || !dt.is_finite() {
                project_errors.push(Error {
                    kind: ErrorKind::Simulation,
                    code: ErrorCode::BadSimSpecs,
                    details: None,
                });
            }
        }

        // the stdlib's template models come first, marked implicit
        let stdlib_models: Vec<datamodel::Model> = crate::stdlib::MODEL_NAMES
            .iter()
            .map(|name| crate::stdlib::get(name).unwrap())
            .collect();

        let x_models: HashMap<Ident, HashMap<Ident, &datamodel::Variable>> = stdlib_models
            .iter()
            .chain(project_datamodel.models.iter())
            .map(|m| build_xvars_map(m.name.clone(), m))
            .collect();

        let mut models_list: Vec<ModelStage0> = stdlib_models
            .iter()
            .map(|x_model| ModelStage0::new(&x_models, x_model, &dims_ctx, &units_ctx, true))
            .collect();

        models_list.extend(
            project_datamodel
                .models
                .iter()
                .map(|m| ModelStage0::new(&x_models, m, &dims_ctx, &units_ctx, false)),
        );

        let mut models_list: Vec<ModelStage1> = models_list
            .iter()
            .map(|model| ModelStage1::new(&dims_ctx, model))
            .collect();

        // order models so module targets are analyzed before the models
        // that instantiate them
        let model_order: HashMap<Ident, usize> = {
            let known: std::collections::HashSet<Ident> =
                models_list.iter().map(|m| m.name.clone()).collect();
            let model_deps: HashMap<Ident, BTreeSet<Ident>> = models_list
                .iter_mut()
                .map(|model| {
                    let mut deps = model.model_deps.take().unwrap();
                    // a module naming a model that doesn't exist is
                    // reported at compile time; it can't order models
                    deps.retain(|dep| known.contains(dep));
                    (model.name.clone(), deps)
                })
                .collect();

            let model_runlist: Vec<&str> = model_deps.keys().map(|id| id.as_str()).collect();
            let model_runlist = topo_sort(model_runlist, &model_deps);
            model_runlist
                .into_iter()
                .enumerate()
                .map(|(i, n)| (n.to_owned(), i))
                .collect()
        };

        models_list.sort_unstable_by(|a, b| model_order[&a.name].cmp(&model_order[&b.name]));

        {
            let mut models: HashMap<Ident, &ModelStage1> = HashMap::new();
            for model in models_list.iter_mut() {
                model.set_dependencies(&models, &dims_ctx);
                // unit checking is advisory: errors collect on variables
                // but never block compilation
                if !model.implicit {
                    crate::units_check::check_model(&units_ctx, model);
                }
                models.insert(model.name.clone(), model);
            }
        }

        let models = models_list
            .into_iter()
            .map(|m| (m.name.clone(), Arc::new(m)))
            .collect();

        Project {
            datamodel: project_datamodel,
            models,
            errors: project_errors,
            dims_ctx,
            units_ctx,
        }
    }
}

/// The LTM rewrite doesn't extend to arrayed models; reject them with a
/// clear error rather than producing wrong scores.
fn abort_if_arrayed(project: &Project) -> Result<()> {
    for (model_name, model) in &project.models {
        if model.implicit {
            continue;
        }

        for (var_name, var) in &model.variables {
            let has_arrays = match var {
                Variable::Stock { eqn, .. } | Variable::Var { eqn, .. } => matches!(
                    eqn,
                    Some(datamodel::Equation::ApplyToAll(..))
                        | Some(datamodel::Equation::Arrayed(..))
                ),
                _ => false,
            };

            if has_arrays {
                return Err(Error {
                    kind: ErrorKind::Model,
                    code: ErrorCode::LtmNoArrays,
                    details: Some(format!(
                        "loop scoring does not support arrayed variables; model '{}' contains arrayed variable '{}'",
                        model_name, var_name
                    )),
                });
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datamodel::SimMethod;
    use crate::testutils::{sim_specs, x_a2a_aux, x_aux, x_flow, x_model, x_project, x_stock};

    #[test]
    fn test_project_from_datamodel() {
        let model = x_model(
            "main",
            vec![
                x_stock("population", "100", &["births"], &[], None),
                x_flow("births", "population * birth_rate", None),
                x_aux("birth_rate", "0.02", None),
            ],
        );
        let project = Project::from(x_project(
            sim_specs(0.0, 10.0, 1.0, SimMethod::Euler),
            &[model],
        ));

        assert!(project.errors.is_empty());
        assert!(project.models.contains_key("main"));
        // the stdlib came along
        assert!(project.models.contains_key("stdlib⁚smth1"));
        assert!(project.models["stdlib⁚smth1"].implicit);
        assert!(project.models["main"].errors.is_none());
    }

    #[test]
    fn test_smooth_expansion_end_to_end() {
        let model = x_model(
            "main",
            vec![
                x_aux("input", "step(1, 1)", None),
                x_aux("output", "smth3(input, 3)", None),
            ],
        );
        let project = Project::from(x_project(
            sim_specs(0.0, 10.0, 0.5, SimMethod::Euler),
            &[model],
        ));

        let main = &project.models["main"];
        assert!(main.errors.is_none(), "errors: {:?}", main.errors);
        // the expansion synthesized a module instance
        assert!(main.variables.values().any(|v| v.is_module()));
    }

    #[test]
    fn test_bad_sim_specs() {
        let model = x_model("main", vec![x_aux("a", "1", None)]);
        let project = Project::from(x_project(
            sim_specs(10.0, 0.0, 1.0, SimMethod::Euler),
            &[model],
        ));
        assert!(project
            .errors
            .iter()
            .any(|e| e.code == ErrorCode::BadSimSpecs));
    }

    #[test]
    fn test_ltm_rejects_arrays() {
        let model = x_model(
            "main",
            vec![x_a2a_aux("arr", &["letters"], "10")],
        );
        let mut project_datamodel = x_project(sim_specs(0.0, 1.0, 1.0, SimMethod::Euler), &[model]);
        project_datamodel.dimensions = vec![datamodel::Dimension::Named(
            "letters".to_string(),
            vec!["a".to_string(), "b".to_string()],
        )];
        let project = Project::from(project_datamodel);

        let result = project.with_ltm();
        assert!(result.is_err());
        assert_eq!(ErrorCode::LtmNoArrays, result.unwrap_err().code);
    }
}
