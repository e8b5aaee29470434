// Copyright 2025 The Fluxion Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! Loops That Matter: finding the feedback structure of a model.
//!
//! Builds the causal graph (equation dependencies plus flow→stock
//! edges), enumerates elementary circuits, and classifies each loop as
//! reinforcing or balancing.  The scoring instrumentation built on top
//! of this lives in ltm_augment.

use std::collections::{HashMap, HashSet};

use crate::ast::{Ast, BinaryOp, Expr1, UnaryOp};
use crate::common::{Ident, Result};
use crate::dimensions::DimensionsContext;
use crate::model::ModelStage1;
use crate::project::Project;
use crate::variable::{identifier_set, Variable};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkPolarity {
    Positive,
    Negative,
    Unknown,
}

/// A causal link between two variables.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Link {
    pub from: Ident,
    pub to: Ident,
    pub polarity: LinkPolarity,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopPolarity {
    /// an even number of negative links
    Reinforcing,
    /// an odd number of negative links
    Balancing,
}

#[derive(Debug, Clone)]
pub struct Loop {
    pub id: String,
    pub links: Vec<Link>,
    pub stocks: Vec<Ident>,
    pub polarity: LoopPolarity,
}

pub struct CausalGraph {
    edges: HashMap<Ident, Vec<Ident>>,
    stocks: HashSet<Ident>,
    variables: HashMap<Ident, Variable>,
}

impl CausalGraph {
    pub fn from_model(model: &ModelStage1, dims_ctx: &DimensionsContext) -> Result<Self> {
        let mut edges: HashMap<Ident, Vec<Ident>> = HashMap::new();
        let mut stocks = HashSet::new();
        let mut variables = HashMap::new();

        for (var_name, var) in &model.variables {
            variables.insert(var_name.clone(), var.clone());

            if var.is_stock() {
                stocks.insert(var_name.clone());
            }

            // equation dependencies become edges dep -> var
            if let Some(ast) = var.ast() {
                for dep in identifier_set(ast, dims_ctx, None) {
                    edges.entry(dep).or_default().push(var_name.clone());
                }
            }

            // flows act on their stocks
            if let Variable::Stock {
                inflows, outflows, ..
            } = var
            {
                for flow in inflows.iter().chain(outflows.iter()) {
                    edges.entry(flow.clone()).or_default().push(var_name.clone());
                }
            }
        }

        for targets in edges.values_mut() {
            targets.sort_unstable();
            targets.dedup();
        }

        Ok(CausalGraph {
            edges,
            stocks,
            variables,
        })
    }

    /// All elementary circuits, deduplicated by node set.
    pub fn find_loops(&self) -> Vec<Loop> {
        let mut loops = Vec::new();
        let mut loop_count = 0;

        let mut nodes: Vec<_> = self.edges.keys().cloned().collect();
        nodes.sort();

        for start_node in &nodes {
            let circuits = self.find_circuits_from(start_node);
            for circuit in circuits {
                if circuit.len() > 1 {
                    let links = self.circuit_to_links(&circuit);
                    let stocks = circuit
                        .iter()
                        .filter(|node| self.stocks.contains(*node))
                        .cloned()
                        .collect();
                    let polarity = calculate_polarity(&links);

                    loop_count += 1;
                    let id = if polarity == LoopPolarity::Reinforcing {
                        format!("r{}", loop_count)
                    } else {
                        format!("b{}", loop_count)
                    };

                    loops.push(Loop {
                        id,
                        links,
                        stocks,
                        polarity,
                    });
                }
            }
        }

        dedup_loops(loops)
    }

    fn find_circuits_from(&self, start: &Ident) -> Vec<Vec<Ident>> {
        let mut circuits = Vec::new();
        let mut path = vec![start.clone()];
        let mut visited = HashSet::new();
        visited.insert(start.clone());

        self.dfs_circuits(start, start, &mut path, &mut visited, &mut circuits);

        circuits
    }

    fn dfs_circuits(
        &self,
        start: &Ident,
        current: &Ident,
        path: &mut Vec<Ident>,
        visited: &mut HashSet<Ident>,
        circuits: &mut Vec<Vec<Ident>>,
    ) {
        if let Some(neighbors) = self.edges.get(current) {
            for neighbor in neighbors {
                if neighbor == start && path.len() > 1 {
                    circuits.push(path.clone());
                } else if !visited.contains(neighbor) && neighbor.as_str() >= start.as_str() {
                    // only visit nodes ordered after start, so each
                    // circuit is discovered exactly once
                    visited.insert(neighbor.clone());
                    path.push(neighbor.clone());
                    self.dfs_circuits(start, neighbor, path, visited, circuits);
                    path.pop();
                    visited.remove(neighbor);
                }
            }
        }
    }

    fn circuit_to_links(&self, circuit: &[Ident]) -> Vec<Link> {
        let mut links = Vec::new();
        for i in 0..circuit.len() {
            let from = &circuit[i];
            let to = &circuit[(i + 1) % circuit.len()];
            let polarity = self.link_polarity(from, to);
            links.push(Link {
                from: from.clone(),
                to: to.clone(),
                polarity,
            });
        }
        links
    }

    fn link_polarity(&self, from: &Ident, to: &Ident) -> LinkPolarity {
        if let Some(to_var) = self.variables.get(to) {
            // flow -> stock edges have structural polarity
            if let Variable::Stock {
                inflows, outflows, ..
            } = to_var
            {
                if inflows.contains(from) {
                    return LinkPolarity::Positive;
                }
                if outflows.contains(from) {
                    return LinkPolarity::Negative;
                }
            }
            if let Some(ast) = to_var.ast() {
                return analyze_link_polarity(ast, from);
            }
        }
        LinkPolarity::Unknown
    }
}

fn calculate_polarity(links: &[Link]) -> LoopPolarity {
    let negative_count = links
        .iter()
        .filter(|link| link.polarity == LinkPolarity::Negative)
        .count();

    if negative_count % 2 == 0 {
        LoopPolarity::Reinforcing
    } else {
        LoopPolarity::Balancing
    }
}

fn dedup_loops(loops: Vec<Loop>) -> Vec<Loop> {
    let mut unique_loops = Vec::new();
    let mut seen_sets = HashSet::new();

    for loop_item in loops {
        let mut node_set: Vec<_> = loop_item
            .links
            .iter()
            .map(|link| link.from.as_str())
            .collect();
        node_set.sort_unstable();
        let key = node_set.join(",");

        if seen_sets.insert(key) {
            unique_loops.push(loop_item);
        }
    }

    unique_loops
}

/// All loops in every (non-stdlib) model of a project.
pub fn detect_loops(project: &Project) -> Result<HashMap<Ident, Vec<Loop>>> {
    let mut all_loops = HashMap::new();

    for (model_name, model) in &project.models {
        if model.implicit {
            continue;
        }
        let graph = CausalGraph::from_model(model, &project.dims_ctx)?;
        let loops = graph.find_loops();
        all_loops.insert(model_name.clone(), loops);
    }

    Ok(all_loops)
}

/// How a change in `from_var` moves the value of an equation.
fn analyze_link_polarity(ast: &Ast<Expr1>, from_var: &Ident) -> LinkPolarity {
    match ast {
        Ast::Scalar(expr) => analyze_expr_polarity(expr, from_var, LinkPolarity::Positive),
        Ast::ApplyToAll(_, expr) => analyze_expr_polarity(expr, from_var, LinkPolarity::Positive),
        Ast::Arrayed(_, elements) => {
            let mut polarity = LinkPolarity::Unknown;
            for expr in elements.values() {
                let elem_polarity =
                    analyze_expr_polarity(expr, from_var, LinkPolarity::Positive);
                if polarity == LinkPolarity::Unknown {
                    polarity = elem_polarity;
                } else if polarity != elem_polarity && elem_polarity != LinkPolarity::Unknown {
                    return LinkPolarity::Unknown;
                }
            }
            polarity
        }
    }
}

fn analyze_expr_polarity(expr: &Expr1, from_var: &Ident, current: LinkPolarity) -> LinkPolarity {
    match expr {
        Expr1::Const(_, _, _) => LinkPolarity::Unknown,
        Expr1::Var(ident, _) => {
            if ident == from_var {
                current
            } else {
                LinkPolarity::Unknown
            }
        }
        Expr1::Subscript(ident, _, _) => {
            if ident == from_var {
                current
            } else {
                LinkPolarity::Unknown
            }
        }
        Expr1::Op2(op, left, right, _) => {
            let left_pol = analyze_expr_polarity(left, from_var, current);
            let right_pol = analyze_expr_polarity(right, from_var, current);

            match op {
                BinaryOp::Add => {
                    if left_pol != LinkPolarity::Unknown {
                        left_pol
                    } else {
                        right_pol
                    }
                }
                BinaryOp::Sub => {
                    if left_pol != LinkPolarity::Unknown {
                        left_pol
                    } else if right_pol != LinkPolarity::Unknown {
                        flip_polarity(right_pol)
                    } else {
                        LinkPolarity::Unknown
                    }
                }
                BinaryOp::Mul => {
                    if left_pol != LinkPolarity::Unknown {
                        if is_positive_constant(right) {
                            left_pol
                        } else if is_negative_constant(right) {
                            flip_polarity(left_pol)
                        } else if matches!(right.as_ref(), Expr1::Var(_, _)) {
                            // variables are assumed positive-valued for
                            // static polarity purposes
                            left_pol
                        } else {
                            LinkPolarity::Unknown
                        }
                    } else if right_pol != LinkPolarity::Unknown {
                        if is_positive_constant(left) {
                            right_pol
                        } else if is_negative_constant(left) {
                            flip_polarity(right_pol)
                        } else if matches!(left.as_ref(), Expr1::Var(_, _)) {
                            right_pol
                        } else {
                            LinkPolarity::Unknown
                        }
                    } else {
                        LinkPolarity::Unknown
                    }
                }
                BinaryOp::Div => {
                    if left_pol != LinkPolarity::Unknown {
                        left_pol
                    } else if right_pol != LinkPolarity::Unknown {
                        // the denominator flips
                        flip_polarity(right_pol)
                    } else {
                        LinkPolarity::Unknown
                    }
                }
                _ => LinkPolarity::Unknown,
            }
        }
        Expr1::Op1(op, operand, _) => {
            let operand_pol = analyze_expr_polarity(operand, from_var, current);
            match op {
                UnaryOp::Negative | UnaryOp::Not => flip_polarity(operand_pol),
                UnaryOp::Positive | UnaryOp::Transpose => operand_pol,
            }
        }
        Expr1::If(_, t, f, _) => {
            let t_pol = analyze_expr_polarity(t, from_var, current);
            let f_pol = analyze_expr_polarity(f, from_var, current);

            if t_pol == f_pol {
                t_pol
            } else {
                LinkPolarity::Unknown
            }
        }
        Expr1::App(_, _) => LinkPolarity::Unknown,
    }
}

fn flip_polarity(pol: LinkPolarity) -> LinkPolarity {
    match pol {
        LinkPolarity::Positive => LinkPolarity::Negative,
        LinkPolarity::Negative => LinkPolarity::Positive,
        LinkPolarity::Unknown => LinkPolarity::Unknown,
    }
}

fn is_positive_constant(expr: &Expr1) -> bool {
    matches!(expr, Expr1::Const(_, n, _) if *n > 0.0)
}

fn is_negative_constant(expr: &Expr1) -> bool {
    matches!(expr, Expr1::Const(_, n, _) if *n < 0.0)
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
    fn test_simple_reinforcing_loop() {
        let model = x_model(
            "main",
            vec![
                x_stock("population", "100", &["births"], &[], None),
                x_flow("births", "population * birth_rate", None),
                x_aux("birth_rate", "0.02", None),
            ],
        );
        let project = project(&[model]);
        let loops = detect_loops(&project).unwrap();

        let model_loops = &loops["main"];
        assert_eq!(1, model_loops.len());

        let loop_item = &model_loops[0];
        assert_eq!(2, loop_item.links.len());
        assert_eq!(vec!["population".to_string()], loop_item.stocks);
        assert_eq!(LoopPolarity::Reinforcing, loop_item.polarity);
    }

    #[test]
    fn test_no_loops() {
        let model = x_model(
            "main",
            vec![
                x_aux("input", "10", None),
                x_aux("output", "input * 2", None),
            ],
        );
        let project = project(&[model]);
        let loops = detect_loops(&project).unwrap();
        assert!(loops["main"].is_empty());
    }

    #[test]
    fn test_balancing_loop() {
        let model = x_model(
            "main",
            vec![
                x_stock("level", "100", &["adjustment"], &[], None),
                x_flow("adjustment", "gap / adjustment_time", None),
                x_aux("gap", "goal - level", None),
                x_aux("goal", "200", None),
                x_aux("adjustment_time", "5", None),
            ],
        );
        let project = project(&[model]);
        let loops = detect_loops(&project).unwrap();

        let model_loops = &loops["main"];
        assert!(!model_loops.is_empty());
        assert!(model_loops
            .iter()
            .any(|l| l.polarity == LoopPolarity::Balancing));
    }

    #[test]
    fn test_two_loops_dedup() {
        // births reinforce, deaths balance; each loop found exactly once
        let model = x_model(
            "main",
            vec![
                x_stock("population", "100", &["births"], &["deaths"], None),
                x_flow("births", "population * 0.02", None),
                x_flow("deaths", "population * 0.01", None),
            ],
        );
        let project = project(&[model]);
        let loops = detect_loops(&project).unwrap();

        let model_loops = &loops["main"];
        assert_eq!(2, model_loops.len());
        assert!(model_loops
            .iter()
            .any(|l| l.polarity == LoopPolarity::Reinforcing));
        assert!(model_loops
            .iter()
            .any(|l| l.polarity == LoopPolarity::Balancing));
    }
}
