// Copyright 2025 The Fluxion Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! The byte-exact project interchange format.
//!
//! These are protobuf messages; the field tags are the compatibility
//! contract and must never be renumbered or reused.  `serde.rs` maps
//! between these and the in-memory datamodel.

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Project {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(message, optional, tag = "2")]
    pub sim_specs: Option<SimSpecs>,
    #[prost(message, repeated, tag = "3")]
    pub dimensions: Vec<Dimension>,
    #[prost(message, repeated, tag = "4")]
    pub units: Vec<Unit>,
    #[prost(message, repeated, tag = "5")]
    pub models: Vec<Model>,
    #[prost(message, optional, tag = "6")]
    pub source: Option<Source>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum SimMethod {
    Unspecified = 0,
    Euler = 1,
    RungeKutta4 = 2,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Dt {
    #[prost(double, tag = "1")]
    pub value: f64,
    #[prost(bool, tag = "2")]
    pub is_reciprocal: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SimSpecs {
    #[prost(double, tag = "1")]
    pub start: f64,
    #[prost(double, tag = "2")]
    pub stop: f64,
    #[prost(message, optional, tag = "3")]
    pub dt: Option<Dt>,
    #[prost(message, optional, tag = "4")]
    pub save_step: Option<Dt>,
    #[prost(enumeration = "SimMethod", tag = "5")]
    pub sim_method: i32,
    #[prost(string, optional, tag = "6")]
    pub time_units: Option<String>,
}

/// size > 0 means an indexed dimension; otherwise the elements list is
/// authoritative.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Dimension {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(uint32, tag = "2")]
    pub size: u32,
    #[prost(string, repeated, tag = "3")]
    pub elements: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Unit {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, optional, tag = "2")]
    pub equation: Option<String>,
    #[prost(bool, tag = "3")]
    pub disabled: bool,
    #[prost(string, repeated, tag = "4")]
    pub aliases: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum SourceExtension {
    Unspecified = 0,
    Xmile = 1,
    Vensim = 2,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Source {
    #[prost(enumeration = "SourceExtension", tag = "1")]
    pub extension: i32,
    #[prost(string, tag = "2")]
    pub content: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Model {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(message, repeated, tag = "2")]
    pub variables: Vec<Variable>,
    #[prost(message, repeated, tag = "3")]
    pub views: Vec<View>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ScalarEquation {
    #[prost(string, tag = "1")]
    pub equation: String,
    #[prost(string, optional, tag = "2")]
    pub initial_equation: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ApplyToAllEquation {
    #[prost(string, repeated, tag = "1")]
    pub dimension_names: Vec<String>,
    #[prost(string, tag = "2")]
    pub equation: String,
    #[prost(string, optional, tag = "3")]
    pub initial_equation: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ArrayedElement {
    #[prost(string, tag = "1")]
    pub subscript: String,
    #[prost(string, tag = "2")]
    pub equation: String,
    #[prost(string, optional, tag = "3")]
    pub initial_equation: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ArrayedEquation {
    #[prost(string, repeated, tag = "1")]
    pub dimension_names: Vec<String>,
    #[prost(message, repeated, tag = "2")]
    pub elements: Vec<ArrayedElement>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Equation {
    #[prost(oneof = "equation::Equation", tags = "1, 2, 3")]
    pub equation: Option<equation::Equation>,
}

pub mod equation {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Equation {
        #[prost(message, tag = "1")]
        Scalar(super::ScalarEquation),
        #[prost(message, tag = "2")]
        ApplyToAll(super::ApplyToAllEquation),
        #[prost(message, tag = "3")]
        Arrayed(super::ArrayedEquation),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum GraphicalFunctionKind {
    Continuous = 0,
    Extrapolate = 1,
    Discrete = 2,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GraphicalFunctionScale {
    #[prost(double, tag = "1")]
    pub min: f64,
    #[prost(double, tag = "2")]
    pub max: f64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GraphicalFunction {
    #[prost(enumeration = "GraphicalFunctionKind", tag = "1")]
    pub kind: i32,
    #[prost(double, repeated, tag = "2")]
    pub x_points: Vec<f64>,
    #[prost(double, repeated, tag = "3")]
    pub y_points: Vec<f64>,
    #[prost(message, optional, tag = "4")]
    pub x_scale: Option<GraphicalFunctionScale>,
    #[prost(message, optional, tag = "5")]
    pub y_scale: Option<GraphicalFunctionScale>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Stock {
    #[prost(string, tag = "1")]
    pub ident: String,
    #[prost(message, optional, tag = "2")]
    pub equation: Option<Equation>,
    #[prost(string, tag = "3")]
    pub documentation: String,
    #[prost(string, optional, tag = "4")]
    pub units: Option<String>,
    #[prost(string, repeated, tag = "5")]
    pub inflows: Vec<String>,
    #[prost(string, repeated, tag = "6")]
    pub outflows: Vec<String>,
    #[prost(bool, tag = "7")]
    pub non_negative: bool,
    #[prost(bool, tag = "8")]
    pub can_be_module_input: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Flow {
    #[prost(string, tag = "1")]
    pub ident: String,
    #[prost(message, optional, tag = "2")]
    pub equation: Option<Equation>,
    #[prost(string, tag = "3")]
    pub documentation: String,
    #[prost(string, optional, tag = "4")]
    pub units: Option<String>,
    #[prost(message, optional, tag = "5")]
    pub gf: Option<GraphicalFunction>,
    #[prost(bool, tag = "6")]
    pub non_negative: bool,
    #[prost(bool, tag = "7")]
    pub can_be_module_input: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Aux {
    #[prost(string, tag = "1")]
    pub ident: String,
    #[prost(message, optional, tag = "2")]
    pub equation: Option<Equation>,
    #[prost(string, tag = "3")]
    pub documentation: String,
    #[prost(string, optional, tag = "4")]
    pub units: Option<String>,
    #[prost(message, optional, tag = "5")]
    pub gf: Option<GraphicalFunction>,
    #[prost(bool, tag = "6")]
    pub can_be_module_input: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ModuleReference {
    #[prost(string, tag = "1")]
    pub src: String,
    #[prost(string, tag = "2")]
    pub dst: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Module {
    #[prost(string, tag = "1")]
    pub ident: String,
    #[prost(string, tag = "2")]
    pub model_name: String,
    #[prost(string, tag = "3")]
    pub documentation: String,
    #[prost(string, optional, tag = "4")]
    pub units: Option<String>,
    #[prost(message, repeated, tag = "5")]
    pub references: Vec<ModuleReference>,
    #[prost(bool, tag = "6")]
    pub can_be_module_input: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Variable {
    #[prost(oneof = "variable::V", tags = "1, 2, 3, 4")]
    pub v: Option<variable::V>,
}

pub mod variable {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum V {
        #[prost(message, tag = "1")]
        Stock(super::Stock),
        #[prost(message, tag = "2")]
        Flow(super::Flow),
        #[prost(message, tag = "3")]
        Aux(super::Aux),
        #[prost(message, tag = "4")]
        Module(super::Module),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum LabelSide {
    Top = 0,
    Left = 1,
    Center = 2,
    Bottom = 3,
    Right = 4,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ViewAux {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(int32, tag = "2")]
    pub uid: i32,
    #[prost(double, tag = "3")]
    pub x: f64,
    #[prost(double, tag = "4")]
    pub y: f64,
    #[prost(enumeration = "LabelSide", tag = "5")]
    pub label_side: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ViewStock {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(int32, tag = "2")]
    pub uid: i32,
    #[prost(double, tag = "3")]
    pub x: f64,
    #[prost(double, tag = "4")]
    pub y: f64,
    #[prost(enumeration = "LabelSide", tag = "5")]
    pub label_side: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FlowPoint {
    #[prost(double, tag = "1")]
    pub x: f64,
    #[prost(double, tag = "2")]
    pub y: f64,
    #[prost(int32, optional, tag = "3")]
    pub attached_to_uid: Option<i32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ViewFlow {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(int32, tag = "2")]
    pub uid: i32,
    #[prost(double, tag = "3")]
    pub x: f64,
    #[prost(double, tag = "4")]
    pub y: f64,
    #[prost(enumeration = "LabelSide", tag = "5")]
    pub label_side: i32,
    #[prost(message, repeated, tag = "6")]
    pub points: Vec<FlowPoint>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ViewLink {
    #[prost(int32, tag = "1")]
    pub uid: i32,
    #[prost(int32, tag = "2")]
    pub from_uid: i32,
    #[prost(int32, tag = "3")]
    pub to_uid: i32,
    #[prost(double, optional, tag = "4")]
    pub arc: Option<f64>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ViewModule {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(int32, tag = "2")]
    pub uid: i32,
    #[prost(double, tag = "3")]
    pub x: f64,
    #[prost(double, tag = "4")]
    pub y: f64,
    #[prost(enumeration = "LabelSide", tag = "5")]
    pub label_side: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ViewCloud {
    #[prost(int32, tag = "1")]
    pub uid: i32,
    #[prost(int32, tag = "2")]
    pub flow_uid: i32,
    #[prost(double, tag = "3")]
    pub x: f64,
    #[prost(double, tag = "4")]
    pub y: f64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ViewElement {
    #[prost(oneof = "view_element::Element", tags = "1, 2, 3, 4, 5, 6")]
    pub element: Option<view_element::Element>,
}

pub mod view_element {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Element {
        #[prost(message, tag = "1")]
        Aux(super::ViewAux),
        #[prost(message, tag = "2")]
        Stock(super::ViewStock),
        #[prost(message, tag = "3")]
        Flow(super::ViewFlow),
        #[prost(message, tag = "4")]
        Link(super::ViewLink),
        #[prost(message, tag = "5")]
        Module(super::ViewModule),
        #[prost(message, tag = "6")]
        Cloud(super::ViewCloud),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct View {
    #[prost(message, repeated, tag = "1")]
    pub elements: Vec<ViewElement>,
}
