// Copyright 2025 The Fluxion Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! Lossless conversion between the in-memory datamodel and the
//! protobuf interchange messages, plus the public byte-level
//! serialize/deserialize entry points.

use prost::Message;

use crate::common::{Error, ErrorCode, ErrorKind, Result};
use crate::datamodel;
use crate::project_io;

impl From<datamodel::Dt> for project_io::Dt {
    fn from(dt: datamodel::Dt) -> Self {
        match dt {
            datamodel::Dt::Dt(value) => project_io::Dt {
                value,
                is_reciprocal: false,
            },
            datamodel::Dt::Reciprocal(value) => project_io::Dt {
                value,
                is_reciprocal: true,
            },
        }
    }
}

impl From<project_io::Dt> for datamodel::Dt {
    fn from(dt: project_io::Dt) -> Self {
        if dt.is_reciprocal {
            datamodel::Dt::Reciprocal(dt.value)
        } else {
            datamodel::Dt::Dt(dt.value)
        }
    }
}

impl From<datamodel::SimMethod> for project_io::SimMethod {
    fn from(method: datamodel::SimMethod) -> Self {
        match method {
            datamodel::SimMethod::Euler => project_io::SimMethod::Euler,
            datamodel::SimMethod::RungeKutta4 => project_io::SimMethod::RungeKutta4,
        }
    }
}

impl From<project_io::SimMethod> for datamodel::SimMethod {
    fn from(method: project_io::SimMethod) -> Self {
        match method {
            project_io::SimMethod::Unspecified | project_io::SimMethod::Euler => {
                datamodel::SimMethod::Euler
            }
            project_io::SimMethod::RungeKutta4 => datamodel::SimMethod::RungeKutta4,
        }
    }
}

impl From<datamodel::SimSpecs> for project_io::SimSpecs {
    fn from(specs: datamodel::SimSpecs) -> Self {
        project_io::SimSpecs {
            start: specs.start,
            stop: specs.stop,
            dt: Some(specs.dt.into()),
            save_step: specs.save_step.map(|dt| dt.into()),
            sim_method: project_io::SimMethod::from(specs.sim_method) as i32,
            time_units: specs.time_units,
        }
    }
}

impl From<project_io::SimSpecs> for datamodel::SimSpecs {
    fn from(specs: project_io::SimSpecs) -> Self {
        datamodel::SimSpecs {
            start: specs.start,
            stop: specs.stop,
            dt: specs.dt.map(|dt| dt.into()).unwrap_or_default(),
            save_step: specs.save_step.map(|dt| dt.into()),
            sim_method: project_io::SimMethod::try_from(specs.sim_method)
                .unwrap_or(project_io::SimMethod::Euler)
                .into(),
            time_units: specs.time_units,
        }
    }
}

impl From<datamodel::Dimension> for project_io::Dimension {
    fn from(dim: datamodel::Dimension) -> Self {
        match dim {
            datamodel::Dimension::Indexed(name, size) => project_io::Dimension {
                name,
                size,
                elements: vec![],
            },
            datamodel::Dimension::Named(name, elements) => project_io::Dimension {
                name,
                size: 0,
                elements,
            },
        }
    }
}

impl From<project_io::Dimension> for datamodel::Dimension {
    fn from(dim: project_io::Dimension) -> Self {
        if dim.size > 0 {
            datamodel::Dimension::Indexed(dim.name, dim.size)
        } else {
            datamodel::Dimension::Named(dim.name, dim.elements)
        }
    }
}

impl From<datamodel::Unit> for project_io::Unit {
    fn from(unit: datamodel::Unit) -> Self {
        project_io::Unit {
            name: unit.name,
            equation: unit.equation,
            disabled: unit.disabled,
            aliases: unit.aliases,
        }
    }
}

impl From<project_io::Unit> for datamodel::Unit {
    fn from(unit: project_io::Unit) -> Self {
        datamodel::Unit {
            name: unit.name,
            equation: unit.equation,
            disabled: unit.disabled,
            aliases: unit.aliases,
        }
    }
}

impl From<datamodel::Extension> for project_io::SourceExtension {
    fn from(extension: datamodel::Extension) -> Self {
        match extension {
            datamodel::Extension::Unspecified => project_io::SourceExtension::Unspecified,
            datamodel::Extension::Xmile => project_io::SourceExtension::Xmile,
            datamodel::Extension::Vensim => project_io::SourceExtension::Vensim,
        }
    }
}

impl From<project_io::SourceExtension> for datamodel::Extension {
    fn from(extension: project_io::SourceExtension) -> Self {
        match extension {
            project_io::SourceExtension::Unspecified => datamodel::Extension::Unspecified,
            project_io::SourceExtension::Xmile => datamodel::Extension::Xmile,
            project_io::SourceExtension::Vensim => datamodel::Extension::Vensim,
        }
    }
}

impl From<datamodel::Source> for project_io::Source {
    fn from(source: datamodel::Source) -> Self {
        project_io::Source {
            extension: project_io::SourceExtension::from(source.extension) as i32,
            content: source.content,
        }
    }
}

impl From<project_io::Source> for datamodel::Source {
    fn from(source: project_io::Source) -> Self {
        datamodel::Source {
            extension: project_io::SourceExtension::try_from(source.extension)
                .unwrap_or(project_io::SourceExtension::Unspecified)
                .into(),
            content: source.content,
        }
    }
}

impl From<datamodel::Equation> for project_io::Equation {
    fn from(eqn: datamodel::Equation) -> Self {
        let equation = match eqn {
            datamodel::Equation::Scalar(equation, initial_equation) => {
                project_io::equation::Equation::Scalar(project_io::ScalarEquation {
                    equation,
                    initial_equation,
                })
            }
            datamodel::Equation::ApplyToAll(dimension_names, equation, initial_equation) => {
                project_io::equation::Equation::ApplyToAll(project_io::ApplyToAllEquation {
                    dimension_names,
                    equation,
                    initial_equation,
                })
            }
            datamodel::Equation::Arrayed(dimension_names, elements) => {
                project_io::equation::Equation::Arrayed(project_io::ArrayedEquation {
                    dimension_names,
                    elements: elements
                        .into_iter()
                        .map(
                            |(subscript, equation, initial_equation)| project_io::ArrayedElement {
                                subscript,
                                equation,
                                initial_equation,
                            },
                        )
                        .collect(),
                })
            }
        };
        project_io::Equation {
            equation: Some(equation),
        }
    }
}

impl From<project_io::Equation> for datamodel::Equation {
    fn from(eqn: project_io::Equation) -> Self {
        match eqn.equation {
            Some(project_io::equation::Equation::Scalar(scalar)) => {
                datamodel::Equation::Scalar(scalar.equation, scalar.initial_equation)
            }
            Some(project_io::equation::Equation::ApplyToAll(a2a)) => {
                datamodel::Equation::ApplyToAll(
                    a2a.dimension_names,
                    a2a.equation,
                    a2a.initial_equation,
                )
            }
            Some(project_io::equation::Equation::Arrayed(arrayed)) => {
                datamodel::Equation::Arrayed(
                    arrayed.dimension_names,
                    arrayed
                        .elements
                        .into_iter()
                        .map(|element| {
                            (element.subscript, element.equation, element.initial_equation)
                        })
                        .collect(),
                )
            }
            None => datamodel::Equation::Scalar(String::new(), None),
        }
    }
}

impl From<datamodel::GraphicalFunctionKind> for project_io::GraphicalFunctionKind {
    fn from(kind: datamodel::GraphicalFunctionKind) -> Self {
        match kind {
            datamodel::GraphicalFunctionKind::Continuous => {
                project_io::GraphicalFunctionKind::Continuous
            }
            datamodel::GraphicalFunctionKind::Extrapolate => {
                project_io::GraphicalFunctionKind::Extrapolate
            }
            datamodel::GraphicalFunctionKind::Discrete => {
                project_io::GraphicalFunctionKind::Discrete
            }
        }
    }
}

impl From<project_io::GraphicalFunctionKind> for datamodel::GraphicalFunctionKind {
    fn from(kind: project_io::GraphicalFunctionKind) -> Self {
        match kind {
            project_io::GraphicalFunctionKind::Continuous => {
                datamodel::GraphicalFunctionKind::Continuous
            }
            project_io::GraphicalFunctionKind::Extrapolate => {
                datamodel::GraphicalFunctionKind::Extrapolate
            }
            project_io::GraphicalFunctionKind::Discrete => {
                datamodel::GraphicalFunctionKind::Discrete
            }
        }
    }
}

impl From<datamodel::GraphicalFunctionScale> for project_io::GraphicalFunctionScale {
    fn from(scale: datamodel::GraphicalFunctionScale) -> Self {
        project_io::GraphicalFunctionScale {
            min: scale.min,
            max: scale.max,
        }
    }
}

impl From<project_io::GraphicalFunctionScale> for datamodel::GraphicalFunctionScale {
    fn from(scale: project_io::GraphicalFunctionScale) -> Self {
        datamodel::GraphicalFunctionScale {
            min: scale.min,
            max: scale.max,
        }
    }
}

impl From<datamodel::GraphicalFunction> for project_io::GraphicalFunction {
    fn from(gf: datamodel::GraphicalFunction) -> Self {
        project_io::GraphicalFunction {
            kind: project_io::GraphicalFunctionKind::from(gf.kind) as i32,
            x_points: gf.x_points.unwrap_or_default(),
            y_points: gf.y_points,
            x_scale: Some(gf.x_scale.into()),
            y_scale: Some(gf.y_scale.into()),
        }
    }
}

impl From<project_io::GraphicalFunction> for datamodel::GraphicalFunction {
    fn from(gf: project_io::GraphicalFunction) -> Self {
        datamodel::GraphicalFunction {
            kind: project_io::GraphicalFunctionKind::try_from(gf.kind)
                .unwrap_or(project_io::GraphicalFunctionKind::Continuous)
                .into(),
            x_points: if gf.x_points.is_empty() {
                None
            } else {
                Some(gf.x_points)
            },
            y_points: gf.y_points,
            x_scale: gf.x_scale.map(|s| s.into()).unwrap_or(
                datamodel::GraphicalFunctionScale { min: 0.0, max: 1.0 },
            ),
            y_scale: gf.y_scale.map(|s| s.into()).unwrap_or(
                datamodel::GraphicalFunctionScale { min: 0.0, max: 1.0 },
            ),
        }
    }
}

impl From<datamodel::Variable> for project_io::Variable {
    fn from(var: datamodel::Variable) -> Self {
        let v = match var {
            datamodel::Variable::Stock(stock) => {
                project_io::variable::V::Stock(project_io::Stock {
                    ident: stock.ident,
                    equation: Some(stock.equation.into()),
                    documentation: stock.documentation,
                    units: stock.units,
                    inflows: stock.inflows,
                    outflows: stock.outflows,
                    non_negative: stock.non_negative,
                    can_be_module_input: stock.can_be_module_input,
                })
            }
            datamodel::Variable::Flow(flow) => project_io::variable::V::Flow(project_io::Flow {
                ident: flow.ident,
                equation: Some(flow.equation.into()),
                documentation: flow.documentation,
                units: flow.units,
                gf: flow.gf.map(|gf| gf.into()),
                non_negative: flow.non_negative,
                can_be_module_input: flow.can_be_module_input,
            }),
            datamodel::Variable::Aux(aux) => project_io::variable::V::Aux(project_io::Aux {
                ident: aux.ident,
                equation: Some(aux.equation.into()),
                documentation: aux.documentation,
                units: aux.units,
                gf: aux.gf.map(|gf| gf.into()),
                can_be_module_input: aux.can_be_module_input,
            }),
            datamodel::Variable::Module(module) => {
                project_io::variable::V::Module(project_io::Module {
                    ident: module.ident,
                    model_name: module.model_name,
                    documentation: module.documentation,
                    units: module.units,
                    references: module
                        .references
                        .into_iter()
                        .map(|r| project_io::ModuleReference {
                            src: r.src,
                            dst: r.dst,
                        })
                        .collect(),
                    can_be_module_input: module.can_be_module_input,
                })
            }
        };
        project_io::Variable { v: Some(v) }
    }
}

impl From<project_io::Variable> for datamodel::Variable {
    fn from(var: project_io::Variable) -> Self {
        match var.v {
            Some(project_io::variable::V::Stock(stock)) => {
                datamodel::Variable::Stock(datamodel::Stock {
                    ident: stock.ident,
                    equation: stock.equation.map(|e| e.into()).unwrap_or_default(),
                    documentation: stock.documentation,
                    units: stock.units,
                    inflows: stock.inflows,
                    outflows: stock.outflows,
                    non_negative: stock.non_negative,
                    can_be_module_input: stock.can_be_module_input,
                })
            }
            Some(project_io::variable::V::Flow(flow)) => {
                datamodel::Variable::Flow(datamodel::Flow {
                    ident: flow.ident,
                    equation: flow.equation.map(|e| e.into()).unwrap_or_default(),
                    documentation: flow.documentation,
                    units: flow.units,
                    gf: flow.gf.map(|gf| gf.into()),
                    non_negative: flow.non_negative,
                    can_be_module_input: flow.can_be_module_input,
                })
            }
            Some(project_io::variable::V::Aux(aux)) => datamodel::Variable::Aux(datamodel::Aux {
                ident: aux.ident,
                equation: aux.equation.map(|e| e.into()).unwrap_or_default(),
                documentation: aux.documentation,
                units: aux.units,
                gf: aux.gf.map(|gf| gf.into()),
                can_be_module_input: aux.can_be_module_input,
            }),
            Some(project_io::variable::V::Module(module)) => {
                datamodel::Variable::Module(datamodel::Module {
                    ident: module.ident,
                    model_name: module.model_name,
                    documentation: module.documentation,
                    units: module.units,
                    references: module
                        .references
                        .into_iter()
                        .map(|r| datamodel::ModuleReference {
                            src: r.src,
                            dst: r.dst,
                        })
                        .collect(),
                    can_be_module_input: module.can_be_module_input,
                })
            }
            None => datamodel::Variable::Aux(datamodel::Aux {
                ident: String::new(),
                equation: Default::default(),
                documentation: String::new(),
                units: None,
                gf: None,
                can_be_module_input: false,
            }),
        }
    }
}

impl From<datamodel::view_element::LabelSide> for project_io::LabelSide {
    fn from(side: datamodel::view_element::LabelSide) -> Self {
        use datamodel::view_element::LabelSide;
        match side {
            LabelSide::Top => project_io::LabelSide::Top,
            LabelSide::Left => project_io::LabelSide::Left,
            LabelSide::Center => project_io::LabelSide::Center,
            LabelSide::Bottom => project_io::LabelSide::Bottom,
            LabelSide::Right => project_io::LabelSide::Right,
        }
    }
}

impl From<project_io::LabelSide> for datamodel::view_element::LabelSide {
    fn from(side: project_io::LabelSide) -> Self {
        use datamodel::view_element::LabelSide;
        match side {
            project_io::LabelSide::Top => LabelSide::Top,
            project_io::LabelSide::Left => LabelSide::Left,
            project_io::LabelSide::Center => LabelSide::Center,
            project_io::LabelSide::Bottom => LabelSide::Bottom,
            project_io::LabelSide::Right => LabelSide::Right,
        }
    }
}

fn label_side_from_i32(side: i32) -> datamodel::view_element::LabelSide {
    project_io::LabelSide::try_from(side)
        .unwrap_or(project_io::LabelSide::Top)
        .into()
}

impl From<datamodel::ViewElement> for project_io::ViewElement {
    fn from(element: datamodel::ViewElement) -> Self {
        use datamodel::ViewElement;
        let element = match element {
            ViewElement::Aux(aux) => {
                project_io::view_element::Element::Aux(project_io::ViewAux {
                    name: aux.name,
                    uid: aux.uid,
                    x: aux.x,
                    y: aux.y,
                    label_side: project_io::LabelSide::from(aux.label_side) as i32,
                })
            }
            ViewElement::Stock(stock) => {
                project_io::view_element::Element::Stock(project_io::ViewStock {
                    name: stock.name,
                    uid: stock.uid,
                    x: stock.x,
                    y: stock.y,
                    label_side: project_io::LabelSide::from(stock.label_side) as i32,
                })
            }
            ViewElement::Flow(flow) => {
                project_io::view_element::Element::Flow(project_io::ViewFlow {
                    name: flow.name,
                    uid: flow.uid,
                    x: flow.x,
                    y: flow.y,
                    label_side: project_io::LabelSide::from(flow.label_side) as i32,
                    points: flow
                        .points
                        .into_iter()
                        .map(|p| project_io::FlowPoint {
                            x: p.x,
                            y: p.y,
                            attached_to_uid: p.attached_to_uid,
                        })
                        .collect(),
                })
            }
            ViewElement::Link(link) => {
                project_io::view_element::Element::Link(project_io::ViewLink {
                    uid: link.uid,
                    from_uid: link.from_uid,
                    to_uid: link.to_uid,
                    arc: link.arc,
                })
            }
            ViewElement::Module(module) => {
                project_io::view_element::Element::Module(project_io::ViewModule {
                    name: module.name,
                    uid: module.uid,
                    x: module.x,
                    y: module.y,
                    label_side: project_io::LabelSide::from(module.label_side) as i32,
                })
            }
            ViewElement::Cloud(cloud) => {
                project_io::view_element::Element::Cloud(project_io::ViewCloud {
                    uid: cloud.uid,
                    flow_uid: cloud.flow_uid,
                    x: cloud.x,
                    y: cloud.y,
                })
            }
        };
        project_io::ViewElement {
            element: Some(element),
        }
    }
}

impl From<project_io::ViewElement> for datamodel::ViewElement {
    fn from(element: project_io::ViewElement) -> Self {
        use datamodel::view_element;
        match element.element {
            Some(project_io::view_element::Element::Aux(aux)) => {
                datamodel::ViewElement::Aux(view_element::Aux {
                    name: aux.name,
                    uid: aux.uid,
                    x: aux.x,
                    y: aux.y,
                    label_side: label_side_from_i32(aux.label_side),
                })
            }
            Some(project_io::view_element::Element::Stock(stock)) => {
                datamodel::ViewElement::Stock(view_element::Stock {
                    name: stock.name,
                    uid: stock.uid,
                    x: stock.x,
                    y: stock.y,
                    label_side: label_side_from_i32(stock.label_side),
                })
            }
            Some(project_io::view_element::Element::Flow(flow)) => {
                datamodel::ViewElement::Flow(view_element::Flow {
                    name: flow.name,
                    uid: flow.uid,
                    x: flow.x,
                    y: flow.y,
                    label_side: label_side_from_i32(flow.label_side),
                    points: flow
                        .points
                        .into_iter()
                        .map(|p| view_element::FlowPoint {
                            x: p.x,
                            y: p.y,
                            attached_to_uid: p.attached_to_uid,
                        })
                        .collect(),
                })
            }
            Some(project_io::view_element::Element::Link(link)) => {
                datamodel::ViewElement::Link(view_element::Link {
                    uid: link.uid,
                    from_uid: link.from_uid,
                    to_uid: link.to_uid,
                    arc: link.arc,
                })
            }
            Some(project_io::view_element::Element::Module(module)) => {
                datamodel::ViewElement::Module(view_element::Module {
                    name: module.name,
                    uid: module.uid,
                    x: module.x,
                    y: module.y,
                    label_side: label_side_from_i32(module.label_side),
                })
            }
            Some(project_io::view_element::Element::Cloud(cloud)) => {
                datamodel::ViewElement::Cloud(view_element::Cloud {
                    uid: cloud.uid,
                    flow_uid: cloud.flow_uid,
                    x: cloud.x,
                    y: cloud.y,
                })
            }
            None => datamodel::ViewElement::Cloud(view_element::Cloud {
                uid: 0,
                flow_uid: 0,
                x: 0.0,
                y: 0.0,
            }),
        }
    }
}

impl From<datamodel::View> for project_io::View {
    fn from(view: datamodel::View) -> Self {
        match view {
            datamodel::View::StockFlow(elements) => project_io::View {
                elements: elements.into_iter().map(|e| e.into()).collect(),
            },
        }
    }
}

impl From<project_io::View> for datamodel::View {
    fn from(view: project_io::View) -> Self {
        datamodel::View::StockFlow(view.elements.into_iter().map(|e| e.into()).collect())
    }
}

impl From<datamodel::Model> for project_io::Model {
    fn from(model: datamodel::Model) -> Self {
        project_io::Model {
            name: model.name,
            variables: model.variables.into_iter().map(|v| v.into()).collect(),
            views: model.views.into_iter().map(|v| v.into()).collect(),
        }
    }
}

impl From<project_io::Model> for datamodel::Model {
    fn from(model: project_io::Model) -> Self {
        datamodel::Model {
            name: model.name,
            variables: model.variables.into_iter().map(|v| v.into()).collect(),
            views: model.views.into_iter().map(|v| v.into()).collect(),
        }
    }
}

impl From<datamodel::Project> for project_io::Project {
    fn from(project: datamodel::Project) -> Self {
        project_io::Project {
            name: project.name,
            sim_specs: Some(project.sim_specs.into()),
            dimensions: project.dimensions.into_iter().map(|d| d.into()).collect(),
            units: project.units.into_iter().map(|u| u.into()).collect(),
            models: project.models.into_iter().map(|m| m.into()).collect(),
            source: project.source.map(|s| s.into()),
        }
    }
}

impl From<project_io::Project> for datamodel::Project {
    fn from(project: project_io::Project) -> Self {
        datamodel::Project {
            name: project.name,
            sim_specs: project
                .sim_specs
                .map(|s| s.into())
                .unwrap_or(datamodel::SimSpecs {
                    start: 0.0,
                    stop: 10.0,
                    dt: Default::default(),
                    save_step: None,
                    sim_method: datamodel::SimMethod::Euler,
                    time_units: None,
                }),
            dimensions: project.dimensions.into_iter().map(|d| d.into()).collect(),
            units: project.units.into_iter().map(|u| u.into()).collect(),
            models: project.models.into_iter().map(|m| m.into()).collect(),
            source: project.source.map(|s| s.into()),
        }
    }
}

/// Encode a project in the byte-exact interchange format.
pub fn serialize(project: &datamodel::Project) -> Vec<u8> {
    let pb_project: project_io::Project = project.clone().into();
    let mut buf = Vec::with_capacity(pb_project.encoded_len());
    // encoding into a Vec can't fail
    pb_project.encode(&mut buf).unwrap();
    buf
}

/// Decode a project from the byte-exact interchange format.
pub fn deserialize(bytes: &[u8]) -> Result<datamodel::Project> {
    let pb_project = project_io::Project::decode(bytes).map_err(|err| {
        Error::new(
            ErrorKind::Import,
            ErrorCode::ProtobufDecode,
            Some(err.to_string()),
        )
    })?;
    Ok(pb_project.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datamodel::SimMethod;
    use crate::testutils::{sim_specs, x_aux, x_flow, x_model, x_project, x_stock};

    fn example_project() -> datamodel::Project {
        let mut project = x_project(
            sim_specs(0.0, 100.0, 0.25, SimMethod::RungeKutta4),
            &[x_model(
                "main",
                vec![
                    x_stock("population", "100", &["births"], &["deaths"], Some("people")),
                    x_flow("births", "population * birth_rate", Some("people/year")),
                    x_flow("deaths", "population / lifetime", Some("people/year")),
                    x_aux("birth_rate", "0.04", Some("1/year")),
                    x_aux("lifetime", "80", Some("year")),
                ],
            )],
        );
        project.dimensions = vec![
            datamodel::Dimension::Named(
                "location".to_string(),
                vec!["boston".to_string(), "chicago".to_string()],
            ),
            datamodel::Dimension::Indexed("cohort".to_string(), 10),
        ];
        project.units = vec![datamodel::Unit {
            name: "people".to_string(),
            equation: None,
            disabled: false,
            aliases: vec!["person".to_string()],
        }];
        project.source = Some(datamodel::Source {
            extension: datamodel::Extension::Xmile,
            content: "<xmile/>".to_string(),
        });
        project
    }

    #[test]
    fn test_structural_roundtrip() {
        let project = example_project();
        let bytes = serialize(&project);
        let decoded = deserialize(&bytes).unwrap();
        assert_eq!(project, decoded);
    }

    #[test]
    fn test_byte_roundtrip() {
        // serialize(deserialize(b)) == b for bytes we produced
        let project = example_project();
        let bytes = serialize(&project);
        let decoded = deserialize(&bytes).unwrap();
        let bytes2 = serialize(&decoded);
        assert_eq!(bytes, bytes2);
    }

    #[test]
    fn test_bad_bytes() {
        let err = deserialize(&[0xff, 0xff, 0xff, 0xff]).unwrap_err();
        assert_eq!(ErrorCode::ProtobufDecode, err.code);
    }

    #[test]
    fn test_equation_variants_roundtrip() {
        let cases = vec![
            datamodel::Equation::Scalar("x + 1".to_string(), Some("5".to_string())),
            datamodel::Equation::ApplyToAll(
                vec!["location".to_string()],
                "x * 2".to_string(),
                None,
            ),
            datamodel::Equation::Arrayed(
                vec!["location".to_string()],
                vec![
                    ("boston".to_string(), "1".to_string(), None),
                    ("chicago".to_string(), "2".to_string(), Some("0".to_string())),
                ],
            ),
        ];
        for eqn in cases {
            let pb: project_io::Equation = eqn.clone().into();
            let back: datamodel::Equation = pb.into();
            assert_eq!(eqn, back);
        }
    }

    #[test]
    fn test_gf_roundtrip() {
        let gf = datamodel::GraphicalFunction {
            kind: datamodel::GraphicalFunctionKind::Discrete,
            x_points: Some(vec![0.0, 1.0, 2.0]),
            y_points: vec![0.0, 10.0, 30.0],
            x_scale: datamodel::GraphicalFunctionScale { min: 0.0, max: 2.0 },
            y_scale: datamodel::GraphicalFunctionScale { min: 0.0, max: 30.0 },
        };
        let pb: project_io::GraphicalFunction = gf.clone().into();
        let back: datamodel::GraphicalFunction = pb.into();
        assert_eq!(gf, back);
    }

    #[test]
    fn test_dimension_roundtrip() {
        for dim in [
            datamodel::Dimension::Indexed("cohort".to_string(), 5),
            datamodel::Dimension::Named(
                "location".to_string(),
                vec!["a".to_string(), "b".to_string()],
            ),
        ] {
            let pb: project_io::Dimension = dim.clone().into();
            let back: datamodel::Dimension = pb.into();
            assert_eq!(dim, back);
        }
    }
}
