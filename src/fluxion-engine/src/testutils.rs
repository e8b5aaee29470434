// Copyright 2025 The Fluxion Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! Builders shared by unit and integration tests.

use crate::datamodel::{
    Aux, Dimension, Dt, Equation, Flow, GraphicalFunction, Model, Module, ModuleReference,
    Project, SimMethod, SimSpecs, Stock, Variable,
};

pub fn x_aux(ident: &str, eqn: &str, units: Option<&str>) -> Variable {
    Variable::Aux(Aux {
        ident: ident.to_string(),
        equation: Equation::Scalar(eqn.to_string(), None),
        documentation: "".to_string(),
        units: units.map(|s| s.to_owned()),
        gf: None,
        can_be_module_input: false,
    })
}

pub fn x_aux_with_gf(ident: &str, eqn: &str, gf: GraphicalFunction) -> Variable {
    Variable::Aux(Aux {
        ident: ident.to_string(),
        equation: Equation::Scalar(eqn.to_string(), None),
        documentation: "".to_string(),
        units: None,
        gf: Some(gf),
        can_be_module_input: false,
    })
}

pub fn x_arrayed_aux(ident: &str, dims: &[&str], elements: &[(&str, &str)]) -> Variable {
    Variable::Aux(Aux {
        ident: ident.to_string(),
        equation: Equation::Arrayed(
            dims.iter().map(|s| s.to_string()).collect(),
            elements
                .iter()
                .map(|(el, eqn)| (el.to_string(), eqn.to_string(), None))
                .collect(),
        ),
        documentation: "".to_string(),
        units: None,
        gf: None,
        can_be_module_input: false,
    })
}

pub fn x_a2a_aux(ident: &str, dims: &[&str], eqn: &str) -> Variable {
    Variable::Aux(Aux {
        ident: ident.to_string(),
        equation: Equation::ApplyToAll(
            dims.iter().map(|s| s.to_string()).collect(),
            eqn.to_string(),
            None,
        ),
        documentation: "".to_string(),
        units: None,
        gf: None,
        can_be_module_input: false,
    })
}

pub fn x_flow(ident: &str, eqn: &str, units: Option<&str>) -> Variable {
    Variable::Flow(Flow {
        ident: ident.to_string(),
        equation: Equation::Scalar(eqn.to_string(), None),
        documentation: "".to_string(),
        units: units.map(|s| s.to_owned()),
        gf: None,
        non_negative: false,
        can_be_module_input: false,
    })
}

pub fn x_stock(
    ident: &str,
    eqn: &str,
    inflows: &[&str],
    outflows: &[&str],
    units: Option<&str>,
) -> Variable {
    Variable::Stock(Stock {
        ident: ident.to_string(),
        equation: Equation::Scalar(eqn.to_string(), None),
        documentation: "".to_string(),
        units: units.map(|s| s.to_owned()),
        inflows: inflows.iter().map(|s| s.to_string()).collect(),
        outflows: outflows.iter().map(|s| s.to_string()).collect(),
        non_negative: false,
        can_be_module_input: false,
    })
}

pub fn x_non_negative_stock(
    ident: &str,
    eqn: &str,
    inflows: &[&str],
    outflows: &[&str],
) -> Variable {
    Variable::Stock(Stock {
        ident: ident.to_string(),
        equation: Equation::Scalar(eqn.to_string(), None),
        documentation: "".to_string(),
        units: None,
        inflows: inflows.iter().map(|s| s.to_string()).collect(),
        outflows: outflows.iter().map(|s| s.to_string()).collect(),
        non_negative: true,
        can_be_module_input: false,
    })
}

pub fn x_module(ident: &str, model_name: &str, refs: &[(&str, &str)]) -> Variable {
    let references: Vec<ModuleReference> = refs
        .iter()
        .map(|(src, dst)| ModuleReference {
            src: src.to_string(),
            dst: dst.to_string(),
        })
        .collect();

    Variable::Module(Module {
        ident: ident.to_string(),
        model_name: model_name.to_string(),
        documentation: "".to_string(),
        units: None,
        references,
        can_be_module_input: false,
    })
}

pub fn x_model(ident: &str, variables: Vec<Variable>) -> Model {
    Model {
        name: ident.to_string(),
        variables,
        views: vec![],
    }
}

pub fn sim_specs(start: f64, stop: f64, dt: f64, method: SimMethod) -> SimSpecs {
    SimSpecs {
        start,
        stop,
        dt: Dt::Dt(dt),
        save_step: None,
        sim_method: method,
        time_units: Some("time".to_string()),
    }
}

pub fn x_project(sim_specs: SimSpecs, models: &[Model]) -> Project {
    Project {
        name: "test project".to_string(),
        sim_specs,
        dimensions: vec![],
        units: vec![],
        models: models.to_vec(),
        source: None,
    }
}

pub fn x_project_with_dimensions(
    sim_specs: SimSpecs,
    dimensions: Vec<Dimension>,
    models: &[Model],
) -> Project {
    Project {
        name: "test project".to_string(),
        sim_specs,
        dimensions,
        units: vec![],
        models: models.to_vec(),
        source: None,
    }
}
