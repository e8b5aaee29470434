// Copyright 2025 The Fluxion Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! The project exchange shape: what a stock-and-flow project looks like
//! before the engine has analyzed anything.  This is the public model
//! type document readers produce and the thing `project_io`/`serde`
//! serialize; serde derives provide the JSON convenience mirror.

use serde::{Deserialize, Serialize};

use crate::common::{DimensionName, ElementName, Ident};

#[derive(Copy, Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum GraphicalFunctionKind {
    Continuous,
    Extrapolate,
    Discrete,
}

#[derive(Copy, Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct GraphicalFunctionScale {
    pub min: f64,
    pub max: f64,
}

/// A graphical lookup function: y-points over either explicit x-points or
/// an implicit uniform scale.  Explicit x-points must be strictly
/// increasing; y-points must be non-empty.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct GraphicalFunction {
    pub kind: GraphicalFunctionKind,
    pub x_points: Option<Vec<f64>>,
    pub y_points: Vec<f64>,
    pub x_scale: GraphicalFunctionScale,
    pub y_scale: GraphicalFunctionScale,
}

/// The three equation shapes.  The second string, where present, is a
/// separate initial-value equation.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum Equation {
    Scalar(String, Option<String>),
    ApplyToAll(Vec<DimensionName>, String, Option<String>),
    Arrayed(Vec<DimensionName>, Vec<(ElementName, String, Option<String>)>),
}

impl Default for Equation {
    fn default() -> Self {
        Equation::Scalar(String::new(), None)
    }
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct Stock {
    pub ident: Ident,
    pub equation: Equation,
    pub documentation: String,
    pub units: Option<String>,
    pub inflows: Vec<Ident>,
    pub outflows: Vec<Ident>,
    pub non_negative: bool,
    pub can_be_module_input: bool,
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct Flow {
    pub ident: Ident,
    pub equation: Equation,
    pub documentation: String,
    pub units: Option<String>,
    pub gf: Option<GraphicalFunction>,
    pub non_negative: bool,
    pub can_be_module_input: bool,
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct Aux {
    pub ident: Ident,
    pub equation: Equation,
    pub documentation: String,
    pub units: Option<String>,
    pub gf: Option<GraphicalFunction>,
    pub can_be_module_input: bool,
}

/// `src → dst` wiring of a module instantiation: `src` names a variable
/// in the instantiating model, `dst` a variable inside the module.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct ModuleReference {
    pub src: Ident,
    pub dst: Ident,
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct Module {
    pub ident: Ident,
    pub model_name: Ident,
    pub documentation: String,
    pub units: Option<String>,
    pub references: Vec<ModuleReference>,
    pub can_be_module_input: bool,
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub enum Variable {
    Stock(Stock),
    Flow(Flow),
    Aux(Aux),
    Module(Module),
}

impl Variable {
    pub fn get_ident(&self) -> &str {
        match self {
            Variable::Stock(stock) => stock.ident.as_str(),
            Variable::Flow(flow) => flow.ident.as_str(),
            Variable::Aux(aux) => aux.ident.as_str(),
            Variable::Module(module) => module.ident.as_str(),
        }
    }

    pub fn get_equation(&self) -> Option<&Equation> {
        match self {
            Variable::Stock(stock) => Some(&stock.equation),
            Variable::Flow(flow) => Some(&flow.equation),
            Variable::Aux(aux) => Some(&aux.equation),
            Variable::Module(_module) => None,
        }
    }

    pub fn set_ident(&mut self, ident: Ident) {
        match self {
            Variable::Stock(stock) => stock.ident = ident,
            Variable::Flow(flow) => flow.ident = ident,
            Variable::Aux(aux) => aux.ident = ident,
            Variable::Module(module) => module.ident = ident,
        }
    }

    pub fn can_be_module_input(&self) -> bool {
        match self {
            Variable::Stock(stock) => stock.can_be_module_input,
            Variable::Flow(flow) => flow.can_be_module_input,
            Variable::Aux(aux) => aux.can_be_module_input,
            Variable::Module(module) => module.can_be_module_input,
        }
    }
}

pub mod view_element {
    use serde::{Deserialize, Serialize};

    #[derive(Copy, Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
    pub enum LabelSide {
        Top,
        Left,
        Center,
        Bottom,
        Right,
    }

    #[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
    pub struct Aux {
        pub name: String,
        pub uid: i32,
        pub x: f64,
        pub y: f64,
        pub label_side: LabelSide,
    }

    #[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
    pub struct Stock {
        pub name: String,
        pub uid: i32,
        pub x: f64,
        pub y: f64,
        pub label_side: LabelSide,
    }

    #[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
    pub struct FlowPoint {
        pub x: f64,
        pub y: f64,
        pub attached_to_uid: Option<i32>,
    }

    #[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
    pub struct Flow {
        pub name: String,
        pub uid: i32,
        pub x: f64,
        pub y: f64,
        pub label_side: LabelSide,
        pub points: Vec<FlowPoint>,
    }

    #[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
    pub struct Link {
        pub uid: i32,
        pub from_uid: i32,
        pub to_uid: i32,
        pub arc: Option<f64>,
    }

    #[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
    pub struct Module {
        pub name: String,
        pub uid: i32,
        pub x: f64,
        pub y: f64,
        pub label_side: LabelSide,
    }

    #[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
    pub struct Cloud {
        pub uid: i32,
        pub flow_uid: i32,
        pub x: f64,
        pub y: f64,
    }
}

/// Diagram elements pass through the engine untouched; they only exist
/// so projects round-trip byte-exactly.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub enum ViewElement {
    Aux(view_element::Aux),
    Stock(view_element::Stock),
    Flow(view_element::Flow),
    Link(view_element::Link),
    Module(view_element::Module),
    Cloud(view_element::Cloud),
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub enum View {
    StockFlow(Vec<ViewElement>),
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct Model {
    pub name: String,
    pub variables: Vec<Variable>,
    pub views: Vec<View>,
}

impl Model {
    pub fn get_variable(&self, ident: &str) -> Option<&Variable> {
        self.variables.iter().find(|v| v.get_ident() == ident)
    }

    pub fn get_variable_mut(&mut self, ident: &str) -> Option<&mut Variable> {
        self.variables.iter_mut().find(|v| v.get_ident() == ident)
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum SimMethod {
    Euler,
    RungeKutta4,
}

/// Dt as the user wrote it: modelers like exact fractions (1/3) that
/// don't display well as decimals.
#[derive(Copy, Clone, PartialEq, Debug, Serialize, Deserialize)]
pub enum Dt {
    Dt(f64),
    Reciprocal(f64),
}

impl Default for Dt {
    fn default() -> Self {
        Dt::Dt(1.0)
    }
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct SimSpecs {
    pub start: f64,
    pub stop: f64,
    pub dt: Dt,
    pub save_step: Option<Dt>,
    pub sim_method: SimMethod,
    pub time_units: Option<String>,
}

/// A dimension is either indexed (just a size; elements are 1..=n) or
/// named (an ordered list of unique element names).
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum Dimension {
    Indexed(DimensionName, u32),
    Named(DimensionName, Vec<ElementName>),
}

impl Dimension {
    pub fn name(&self) -> &str {
        match self {
            Dimension::Indexed(name, _) | Dimension::Named(name, _) => name,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Dimension::Indexed(_, size) => *size as usize,
            Dimension::Named(_, elements) => elements.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 0-based offset of a named element (or numeric subscript string).
    pub fn get_offset(&self, subscript: &str) -> Option<usize> {
        match self {
            Dimension::Indexed(_, size) => match subscript.parse::<usize>() {
                Ok(n) if n >= 1 && n <= *size as usize => Some(n - 1),
                _ => None,
            },
            Dimension::Named(_, elements) => {
                elements.iter().position(|element| element == subscript)
            }
        }
    }
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct Unit {
    pub name: String,
    pub equation: Option<String>,
    pub disabled: bool,
    pub aliases: Vec<String>,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum Extension {
    Unspecified,
    Xmile,
    Vensim,
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct Source {
    pub extension: Extension,
    pub content: String,
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct Project {
    pub name: String,
    pub sim_specs: SimSpecs,
    pub dimensions: Vec<Dimension>,
    pub units: Vec<Unit>,
    pub models: Vec<Model>,
    pub source: Option<Source>,
}

impl Project {
    pub fn get_model(&self, model_name: &str) -> Option<&Model> {
        self.models
            .iter()
            .find(|m| m.name == model_name || (model_name == "main" && m.name.is_empty()))
    }

    pub fn get_model_mut(&mut self, model_name: &str) -> Option<&mut Model> {
        self.models.iter_mut().find(|m| m.name == model_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dimension_get_offset() {
        let named = Dimension::Named(
            "location".to_string(),
            vec!["boston".to_string(), "chicago".to_string(), "la".to_string()],
        );
        assert_eq!(Some(0), named.get_offset("boston"));
        assert_eq!(Some(2), named.get_offset("la"));
        assert_eq!(None, named.get_offset("nyc"));
        assert_eq!(3, named.len());

        let indexed = Dimension::Indexed("cohort".to_string(), 5);
        assert_eq!(Some(0), indexed.get_offset("1"));
        assert_eq!(Some(4), indexed.get_offset("5"));
        assert_eq!(None, indexed.get_offset("0"));
        assert_eq!(None, indexed.get_offset("6"));
        assert_eq!(5, indexed.len());
    }
}
