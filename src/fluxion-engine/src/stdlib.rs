// Copyright 2025 The Fluxion Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! The standard library of stateful-builtin template models.
//!
//! `SMTH1(input, delay_time)` and friends aren't functions: they are
//! tiny sub-models with their own stocks.  Each template here is an
//! ordinary datamodel Model; module expansion instantiates them with the
//! call's arguments wired to the `input`/`delay_time`/`initial_value`
//! variables.  Optional arguments are resolved inside the templates with
//! the `ismoduleinput()` conditional.

use crate::datamodel::{Aux, Equation, Flow, Model, Stock, Variable};

pub const MODEL_NAMES: [&str; 7] = [
    "delay1", "delay3", "init", "previous", "smth1", "smth3", "trend",
];

/// The canonical model name for a stdlib template.
pub fn qualified_name(name: &str) -> String {
    format!("stdlib⁚{}", name)
}

pub fn is_stdlib_model_name(name: &str) -> bool {
    name.strip_prefix("stdlib⁚")
        .map(|name| MODEL_NAMES.contains(&name))
        .unwrap_or(false)
}

fn input_aux(ident: &str) -> Variable {
    Variable::Aux(Aux {
        ident: ident.to_string(),
        equation: Equation::Scalar("0".to_string(), None),
        documentation: "".to_string(),
        units: None,
        gf: None,
        can_be_module_input: true,
    })
}

fn stock(ident: &str, eqn: &str, inflows: &[&str], outflows: &[&str]) -> Variable {
    Variable::Stock(Stock {
        ident: ident.to_string(),
        equation: Equation::Scalar(eqn.to_string(), None),
        documentation: "".to_string(),
        units: None,
        inflows: inflows.iter().map(|s| s.to_string()).collect(),
        outflows: outflows.iter().map(|s| s.to_string()).collect(),
        non_negative: false,
        can_be_module_input: false,
    })
}

fn flow(ident: &str, eqn: &str) -> Variable {
    Variable::Flow(Flow {
        ident: ident.to_string(),
        equation: Equation::Scalar(eqn.to_string(), None),
        documentation: "".to_string(),
        units: None,
        gf: None,
        non_negative: false,
        can_be_module_input: false,
    })
}

fn aux(ident: &str, eqn: &str) -> Variable {
    Variable::Aux(Aux {
        ident: ident.to_string(),
        equation: Equation::Scalar(eqn.to_string(), None),
        documentation: "".to_string(),
        units: None,
        gf: None,
        can_be_module_input: false,
    })
}

/// Retrieve a stdlib template model by short name.
pub fn get(name: &str) -> Option<Model> {
    let variables = match name {
        "smth1" => vec![
            input_aux("input"),
            input_aux("delay_time"),
            input_aux("initial_value"),
            stock(
                "output",
                "if ismoduleinput(initial_value) then initial_value else input",
                &["adjustment"],
                &[],
            ),
            flow("adjustment", "(input - output) / delay_time"),
        ],
        "smth3" => vec![
            input_aux("input"),
            input_aux("delay_time"),
            input_aux("initial_value"),
            aux("delay_time_3", "delay_time / 3"),
            stock(
                "level_1",
                "if ismoduleinput(initial_value) then initial_value else input",
                &["adjust_1"],
                &[],
            ),
            flow("adjust_1", "(input - level_1) / delay_time_3"),
            stock("level_2", "level_1", &["adjust_2"], &[]),
            flow("adjust_2", "(level_1 - level_2) / delay_time_3"),
            stock("output", "level_2", &["adjust_3"], &[]),
            flow("adjust_3", "(level_2 - output) / delay_time_3"),
        ],
        "delay1" => vec![
            input_aux("input"),
            input_aux("delay_time"),
            input_aux("initial_value"),
            stock(
                "accumulator",
                "(if ismoduleinput(initial_value) then initial_value else input) * delay_time",
                &["inflow"],
                &["output"],
            ),
            flow("inflow", "input"),
            flow("output", "accumulator / delay_time"),
        ],
        "delay3" => vec![
            input_aux("input"),
            input_aux("delay_time"),
            input_aux("initial_value"),
            aux("delay_time_3", "delay_time / 3"),
            stock(
                "accumulator_1",
                "(if ismoduleinput(initial_value) then initial_value else input) * delay_time_3",
                &["inflow"],
                &["transfer_1"],
            ),
            flow("inflow", "input"),
            flow("transfer_1", "accumulator_1 / delay_time_3"),
            stock(
                "accumulator_2",
                "accumulator_1",
                &["transfer_1"],
                &["transfer_2"],
            ),
            flow("transfer_2", "accumulator_2 / delay_time_3"),
            stock(
                "accumulator_3",
                "accumulator_2",
                &["transfer_2"],
                &["output"],
            ),
            flow("output", "accumulator_3 / delay_time_3"),
        ],
        "trend" => vec![
            input_aux("input"),
            input_aux("delay_time"),
            input_aux("initial_value"),
            stock(
                "average",
                "if ismoduleinput(initial_value) then input / (1 + initial_value * delay_time) else input",
                &["change_in_average"],
                &[],
            ),
            flow("change_in_average", "(input - average) / delay_time"),
            aux(
                "output",
                "safediv(input - average, abs(average) * delay_time)",
            ),
        ],
        "previous" => vec![
            input_aux("input"),
            input_aux("initial_value"),
            stock(
                "output",
                "if ismoduleinput(initial_value) then initial_value else input",
                &["update"],
                &[],
            ),
            flow("update", "(input - output) / time_step"),
        ],
        "init" => vec![input_aux("input"), stock("output", "input", &[], &[])],
        _ => {
            return None;
        }
    };

    Some(Model {
        name: qualified_name(name),
        variables,
        views: vec![],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_models_retrievable() {
        for name in MODEL_NAMES.iter() {
            let model = get(name).unwrap();
            assert_eq!(qualified_name(name), model.name);
            assert!(
                model.get_variable("output").is_some(),
                "{} has an output",
                name
            );
            assert!(
                model.get_variable("input").is_some(),
                "{} has an input",
                name
            );
        }
        assert!(get("bogus").is_none());
    }

    #[test]
    fn test_is_stdlib_model_name() {
        assert!(is_stdlib_model_name("stdlib⁚smth1"));
        assert!(!is_stdlib_model_name("smth1"));
        assert!(!is_stdlib_model_name("stdlib⁚bogus"));
    }

    #[test]
    fn test_delay_chain_conserved() {
        // every accumulator's outflow is the next accumulator's inflow
        let model = get("delay3").unwrap();
        let a2 = model.get_variable("accumulator_2").unwrap();
        if let Variable::Stock(s) = a2 {
            assert_eq!(vec!["transfer_1".to_string()], s.inflows);
            assert_eq!(vec!["transfer_2".to_string()], s.outflows);
        } else {
            panic!("expected stock");
        }
    }
}
