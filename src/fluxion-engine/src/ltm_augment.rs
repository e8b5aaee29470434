// Copyright 2025 The Fluxion Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! LTM instrumentation: synthesized link-score and loop-score variables.
//!
//! Link scores measure how much of a variable's change is attributable
//! to each of its causal inputs; loop scores are products of link scores
//! around each feedback loop.  The generated equations are ordinary
//! model equations built on the one-step history `previous(...)`
//! provides, so the augmented project compiles and simulates normally
//! and the scores come out as regular time series.

use std::collections::{HashMap, HashSet};

use crate::ast::{print_eqn, Expr0, IndexExpr0};
use crate::builtins::UntypedBuiltinFn;
use crate::common::{Ident, Result, SYNTHETIC_PREFIX};
use crate::datamodel::{Aux, Equation, Variable as XVariable};
use crate::ltm::{detect_loops, Link, Loop};
use crate::project::Project;
use crate::token::LexerType;
use crate::variable::Variable;

type SyntheticVariables = Vec<(Ident, XVariable)>;

pub fn link_score_name(from: &str, to: &str) -> String {
    format!("{}ltm⁚link_score⁚{}⁚{}", SYNTHETIC_PREFIX, from, to)
}

pub fn loop_score_name(loop_id: &str) -> String {
    format!("{}ltm⁚loop_score⁚{}", SYNTHETIC_PREFIX, loop_id)
}

pub fn relative_loop_score_name(loop_id: &str) -> String {
    format!("{}ltm⁚rel_loop_score⁚{}", SYNTHETIC_PREFIX, loop_id)
}

/// How to spell an identifier inside a generated equation: synthesized
/// names contain characters the lexer only accepts in quoted form.
fn eqn_ref(ident: &str) -> String {
    if ident.starts_with('$') {
        format!("\"{}\"", ident)
    } else {
        ident.to_string()
    }
}

fn prev(ident: &str) -> String {
    format!("previous({})", eqn_ref(ident))
}

/// Generate all synthetic variables for the project, keyed by model.
pub fn generate_ltm_variables(project: &Project) -> Result<HashMap<Ident, SyntheticVariables>> {
    let loops = detect_loops(project)?;

    let mut result = HashMap::new();

    for (model_name, model_loops) in &loops {
        let model = match project.models.get(model_name) {
            Some(model) if !model.implicit => model,
            _ => continue,
        };

        let mut synthetic_vars: SyntheticVariables = Vec::new();

        let mut all_links = HashSet::new();
        for loop_item in model_loops {
            for link in &loop_item.links {
                all_links.insert(link.clone());
            }
        }
        let mut all_links: Vec<Link> = all_links.into_iter().collect();
        all_links.sort_by(|a, b| (&a.from, &a.to).cmp(&(&b.from, &b.to)));

        for link in &all_links {
            let var_name = link_score_name(&link.from, &link.to);
            let equation = match model.variables.get(&link.to) {
                Some(to_var) => link_score_equation(&link.from, &link.to, to_var, model),
                None => continue,
            };
            synthetic_vars.push((
                var_name.clone(),
                create_aux_variable(&var_name, &equation),
            ));
        }

        for loop_item in model_loops {
            let var_name = loop_score_name(&loop_item.id);
            let equation = loop_score_equation(loop_item);
            synthetic_vars.push((
                var_name.clone(),
                create_aux_variable(&var_name, &equation),
            ));
        }

        // relative scores normalize across every loop, including a lone
        // one (whose relative score is 1 whenever it is active)
        for loop_item in model_loops {
            let var_name = relative_loop_score_name(&loop_item.id);
            let equation = relative_loop_score_equation(&loop_item.id, model_loops);
            synthetic_vars.push((
                var_name.clone(),
                create_aux_variable(&var_name, &equation),
            ));
        }

        if !synthetic_vars.is_empty() {
            result.insert(model_name.clone(), synthetic_vars);
        }
    }

    Ok(result)
}

fn link_score_equation(
    from: &Ident,
    to: &Ident,
    to_var: &Variable,
    model: &crate::model::ModelStage1,
) -> String {
    // flow -> stock links use the 2023 corrected formulation with the
    // stock's acceleration in the denominator
    if let Variable::Stock {
        inflows, outflows, ..
    } = to_var
    {
        let is_inflow = inflows.contains(from);
        let is_outflow = outflows.contains(from);
        if is_inflow || is_outflow {
            return flow_to_stock_equation(from, to, is_inflow);
        }
    }

    if to_var.is_module() || model.variables.get(from).map(|v| v.is_module()).unwrap_or(false) {
        // modules are black boxes: score by sign of the transfer only
        return module_link_equation(from, to);
    }

    magnitude_and_sign_equation(from, to, to_var)
}

/// The general form: magnitude × sign, where the "partial" change of
/// `to` is its equation with every dependency except `from` frozen at
/// the previous step.
fn magnitude_and_sign_equation(from: &Ident, to: &Ident, to_var: &Variable) -> String {
    let partial = match partial_equation(to_var, from) {
        Some(partial) => partial,
        None => return "0".to_string(),
    };

    format!(
        "if ({to} - {prev_to}) = 0 or ({from} - {prev_from}) = 0 then 0 \
         else abs(safediv(({partial}) - {prev_to}, {to} - {prev_to}, 0)) \
         * sign(safediv(({partial}) - {prev_to}, {from} - {prev_from}, 0))",
        to = eqn_ref(to),
        from = eqn_ref(from),
        prev_to = prev(to),
        prev_from = prev(from),
        partial = partial,
    )
}

fn flow_to_stock_equation(flow: &Ident, stock: &Ident, is_inflow: bool) -> String {
    let sign = if is_inflow { "" } else { "-" };
    format!(
        "{sign}safediv({flow} - {prev_flow}, ({stock} - {prev_stock}) - ({prev_stock} - previous({prev_stock})), 0)",
        flow = eqn_ref(flow),
        prev_flow = prev(flow),
        stock = eqn_ref(stock),
        prev_stock = prev(stock),
    )
}

fn module_link_equation(from: &Ident, to: &Ident) -> String {
    format!(
        "if ({to} - {prev_to}) = 0 or ({from} - {prev_from}) = 0 then 0 \
         else sign(safediv({to} - {prev_to}, {from} - {prev_from}, 0))",
        to = eqn_ref(to),
        from = eqn_ref(from),
        prev_to = prev(to),
        prev_from = prev(from),
    )
}

/// Rewrite the `to` variable's equation with every dependency except
/// `keep` wrapped in previous(...).  The substitution happens on the
/// AST, so name boundaries are exact.
fn partial_equation(to_var: &Variable, keep: &Ident) -> Option<String> {
    let eqn = match to_var {
        Variable::Stock { eqn, .. } | Variable::Var { eqn, .. } => match eqn {
            Some(Equation::Scalar(eqn, _)) => eqn.clone(),
            _ => return None,
        },
        Variable::Module { .. } => return None,
    };

    let expr = match Expr0::new(&eqn, LexerType::Equation) {
        Ok(Some(expr)) => expr,
        _ => return None,
    };

    let rewritten = freeze_other_deps(expr, keep);
    Some(print_eqn(&rewritten))
}

fn freeze_other_deps(expr: Expr0, keep: &Ident) -> Expr0 {
    match expr {
        Expr0::Const(_, _, _) => expr,
        Expr0::Var(ref id, loc) => {
            if id == keep {
                expr
            } else {
                Expr0::App(
                    UntypedBuiltinFn("previous".to_string(), vec![expr.clone()]),
                    loc,
                )
            }
        }
        Expr0::App(UntypedBuiltinFn(func, args), loc) => {
            let args = args
                .into_iter()
                .map(|arg| freeze_other_deps(arg, keep))
                .collect();
            Expr0::App(UntypedBuiltinFn(func, args), loc)
        }
        Expr0::Subscript(id, args, loc) => {
            let args = args
                .into_iter()
                .map(|arg| match arg {
                    IndexExpr0::Expr(e) => IndexExpr0::Expr(freeze_other_deps(e, keep)),
                    arg => arg,
                })
                .collect();
            Expr0::Subscript(id, args, loc)
        }
        Expr0::Op1(op, r, loc) => Expr0::Op1(op, Box::new(freeze_other_deps(*r, keep)), loc),
        Expr0::Op2(op, l, r, loc) => Expr0::Op2(
            op,
            Box::new(freeze_other_deps(*l, keep)),
            Box::new(freeze_other_deps(*r, keep)),
            loc,
        ),
        Expr0::If(cond, t, f, loc) => Expr0::If(
            Box::new(freeze_other_deps(*cond, keep)),
            Box::new(freeze_other_deps(*t, keep)),
            Box::new(freeze_other_deps(*f, keep)),
            loc,
        ),
    }
}

fn loop_score_equation(loop_item: &Loop) -> String {
    let link_scores: Vec<String> = loop_item
        .links
        .iter()
        .map(|link| eqn_ref(&link_score_name(&link.from, &link.to)))
        .collect();

    if link_scores.is_empty() {
        "0".to_string()
    } else {
        link_scores.join(" * ")
    }
}

fn relative_loop_score_equation(loop_id: &str, all_loops: &[Loop]) -> String {
    let this_score = eqn_ref(&loop_score_name(loop_id));

    let all_scores: Vec<String> = all_loops
        .iter()
        .map(|loop_item| format!("abs({})", eqn_ref(&loop_score_name(&loop_item.id))))
        .collect();

    format!(
        "safediv(abs({}), {}, 0)",
        this_score,
        all_scores.join(" + ")
    )
}

fn create_aux_variable(name: &str, equation: &str) -> XVariable {
    XVariable::Aux(Aux {
        ident: name.to_string(),
        equation: Equation::Scalar(equation.to_string(), None),
        documentation: "".to_string(),
        units: None,
        gf: None,
        can_be_module_input: false,
    })
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
    fn test_generate_for_simple_loop() {
        let model = x_model(
            "main",
            vec![
                x_stock("population", "100", &["births"], &[], None),
                x_flow("births", "population * birth_rate", None),
                x_aux("birth_rate", "0.02", None),
            ],
        );
        let project = project(&[model]);
        let ltm_vars = generate_ltm_variables(&project).unwrap();

        let vars = &ltm_vars["main"];
        assert!(!vars.is_empty());

        let has_pop_to_births = vars
            .iter()
            .any(|(name, _)| name.contains("link_score⁚population⁚births"));
        let has_births_to_pop = vars
            .iter()
            .any(|(name, _)| name.contains("link_score⁚births⁚population"));
        assert!(has_pop_to_births);
        assert!(has_births_to_pop);

        let has_loop_score = vars
            .iter()
            .any(|(name, _)| name.contains("⁚loop_score⁚"));
        let has_rel_score = vars
            .iter()
            .any(|(name, _)| name.contains("⁚rel_loop_score⁚"));
        assert!(has_loop_score);
        assert!(has_rel_score);
    }

    #[test]
    fn test_flow_to_stock_uses_acceleration() {
        let eqn = flow_to_stock_equation(&"births".to_string(), &"population".to_string(), true);
        // second difference of the stock in the denominator
        assert!(eqn.contains("previous(previous(population))"));
        assert!(eqn.starts_with("safediv("));

        let eqn = flow_to_stock_equation(&"deaths".to_string(), &"population".to_string(), false);
        assert!(eqn.starts_with("-safediv("));
    }

    #[test]
    fn test_partial_freezes_other_deps() {
        let model = x_model(
            "main",
            vec![
                x_aux("a", "1", None),
                x_aux("b", "2", None),
                x_aux("c", "a + b", None),
            ],
        );
        let project = project(&[model]);
        let c = &project.models["main"].variables["c"];
        let partial = partial_equation(c, &"a".to_string()).unwrap();
        assert_eq!("a + previous(b)", partial);
    }

    #[test]
    fn test_augmented_project_compiles() {
        let model = x_model(
            "main",
            vec![
                x_stock("population", "100", &["births"], &[], None),
                x_flow("births", "population * birth_rate", None),
                x_aux("birth_rate", "0.02", None),
            ],
        );
        let project = project(&[model]);
        let augmented = project.with_ltm().unwrap();

        let main = &augmented.models["main"];
        assert!(
            main.errors.is_none(),
            "augmented model has errors: {:?}",
            main.errors
        );

        let sim = crate::compiler::Simulation::new(&augmented, "main").unwrap();
        let results = sim.run_to_end().unwrap();

        // score series made it into the results
        let has_scores = results
            .offsets
            .keys()
            .any(|name| name.contains("ltm⁚loop_score⁚"));
        assert!(has_scores);
    }
}
