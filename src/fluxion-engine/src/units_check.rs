// Copyright 2025 The Fluxion Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! Dimensional consistency checking.
//!
//! A separate, advisory pass: it walks every equation bottom-up
//! associating a unit with each sub-expression and records mismatches as
//! unit errors on the offending variables.  Variables without declared
//! units propagate "unknown", which silences checks involving them —
//! a modeler gets exactly as much unit checking as they paid for in
//! declarations.

use std::collections::HashMap;

use crate::ast::{Ast, BinaryOp, Expr1, UnaryOp};
use crate::builtins::BuiltinFn;
use crate::common::{EquationError, ErrorCode, Ident, UnitError};
use crate::model::ModelStage1;
use crate::units::{combine, pretty_print_unit, Context, UnitMap};
use crate::variable::Variable;

struct UnitEvaluator<'a> {
    ctx: &'a Context,
    var_units: &'a HashMap<Ident, Option<UnitMap>>,
    errors: Vec<UnitError>,
}

impl UnitEvaluator<'_> {
    fn mismatch(&mut self, loc: crate::ast::Loc, l: &UnitMap, r: &UnitMap) {
        self.errors.push(UnitError::ConsistencyError(
            EquationError {
                start: loc.start,
                end: loc.end,
                code: ErrorCode::UnitMismatch,
            },
            Some(format!(
                "'{}' vs '{}'",
                pretty_print_unit(l),
                pretty_print_unit(r)
            )),
        ));
    }

    fn expect_equal(
        &mut self,
        loc: crate::ast::Loc,
        l: Option<UnitMap>,
        r: Option<UnitMap>,
    ) -> Option<UnitMap> {
        match (l, r) {
            (Some(l), Some(r)) => {
                if l != r {
                    self.mismatch(loc, &l, &r);
                }
                Some(l)
            }
            (Some(l), None) => Some(l),
            (None, r) => r,
        }
    }

    fn time_units(&self) -> Option<UnitMap> {
        self.ctx
            .time_units
            .as_ref()
            .map(|units| [(units.clone(), 1)].iter().cloned().collect())
    }

    fn walk(&mut self, expr: &Expr1) -> Option<UnitMap> {
        match expr {
            // a bare constant takes on whatever units its context needs
            Expr1::Const(_, _, _) => None,
            Expr1::Var(id, _) => self.var_units.get(id).cloned().flatten(),
            Expr1::Subscript(id, _, _) => self.var_units.get(id).cloned().flatten(),
            Expr1::App(builtin, _) => {
                use BuiltinFn::*;
                match builtin {
                    Time | TimeStep | StartTime | FinalTime => self.time_units(),
                    Pi | Inf | Rand(_) => Some(UnitMap::new()),
                    // the magnitude-preserving single-argument builtins
                    Abs(a) | Int(a) => self.walk(a),
                    // transcendental inputs and outputs are dimensionless
                    Arccos(_) | Arcsin(_) | Arctan(_) | Cos(_) | Exp(_) | Ln(_) | Log10(_)
                    | Sin(_) | Tan(_) => Some(UnitMap::new()),
                    Sign(_) => Some(UnitMap::new()),
                    Sqrt(_) => None,
                    IsModuleInput(_, _) => Some(UnitMap::new()),
                    Lookup(id, _, _) => self.var_units.get(id).cloned().flatten(),
                    Max(a, b) | Min(a, b) => {
                        let a_units = self.walk(a);
                        match b {
                            Some(b) => {
                                let loc = expr.get_loc();
                                let b_units = self.walk(b);
                                self.expect_equal(loc, a_units, b_units)
                            }
                            None => a_units,
                        }
                    }
                    Mean(args) => {
                        let mut units: Option<UnitMap> = None;
                        for arg in args.iter() {
                            let arg_units = self.walk(arg);
                            let loc = expr.get_loc();
                            units = self.expect_equal(loc, units, arg_units);
                        }
                        units
                    }
                    Sum(a) | Stddev(a) => self.walk(a),
                    Size(_) | Rank(_, _) => Some(UnitMap::new()),
                    Step(height, _) => self.walk(height),
                    Pulse(volume, _, _) => {
                        // a pulse distributes its volume over one dt
                        let volume = self.walk(volume)?;
                        let time = self.time_units()?;
                        Some(combine(&volume, &time, -1))
                    }
                    Ramp(slope, _, _) => {
                        let slope = self.walk(slope)?;
                        let time = self.time_units()?;
                        Some(combine(&slope, &time, 1))
                    }
                    SafeDiv(a, b, c) => {
                        let a_units = self.walk(a);
                        let b_units = self.walk(b);
                        let result = match (a_units, b_units) {
                            (Some(a), Some(b)) => Some(combine(&a, &b, -1)),
                            _ => None,
                        };
                        if let Some(c) = c {
                            let loc = expr.get_loc();
                            let c_units = self.walk(c);
                            self.expect_equal(loc, result, c_units)
                        } else {
                            result
                        }
                    }
                }
            }
            Expr1::Op1(op, e, _) => {
                let units = self.walk(e);
                match op {
                    UnaryOp::Positive | UnaryOp::Negative | UnaryOp::Transpose => units,
                    UnaryOp::Not => Some(UnitMap::new()),
                }
            }
            Expr1::Op2(op, l, r, loc) => {
                let l_units = self.walk(l);
                let r_units = self.walk(r);
                match op {
                    BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mod => {
                        self.expect_equal(*loc, l_units, r_units)
                    }
                    BinaryOp::Mul => match (l_units, r_units) {
                        (Some(l), Some(r)) => Some(combine(&l, &r, 1)),
                        _ => None,
                    },
                    BinaryOp::Div => match (l_units, r_units) {
                        (Some(l), Some(r)) => Some(combine(&l, &r, -1)),
                        _ => None,
                    },
                    BinaryOp::Exp => {
                        // exponents must be dimensionless
                        if let Some(r) = r_units {
                            if !r.is_empty() {
                                self.mismatch(*loc, &UnitMap::new(), &r);
                            }
                        }
                        l_units
                    }
                    BinaryOp::Gt
                    | BinaryOp::Lt
                    | BinaryOp::Gte
                    | BinaryOp::Lte
                    | BinaryOp::Eq
                    | BinaryOp::Neq => {
                        // comparisons need matching units and produce a
                        // dimensionless truth value
                        self.expect_equal(*loc, l_units, r_units);
                        Some(UnitMap::new())
                    }
                    BinaryOp::And | BinaryOp::Or => Some(UnitMap::new()),
                }
            }
            Expr1::If(_, t, f, loc) => {
                let t_units = self.walk(t);
                let f_units = self.walk(f);
                self.expect_equal(*loc, t_units, f_units)
            }
        }
    }
}

fn check_ast(
    ctx: &Context,
    var_units: &HashMap<Ident, Option<UnitMap>>,
    ast: &Ast<Expr1>,
    declared: Option<&UnitMap>,
) -> Vec<UnitError> {
    let mut eval = UnitEvaluator {
        ctx,
        var_units,
        errors: vec![],
    };

    let mut check_one = |expr: &Expr1| {
        let computed = eval.walk(expr);
        if let (Some(declared), Some(computed)) = (declared, computed.as_ref()) {
            if declared != computed {
                let loc = expr.get_loc();
                eval.errors.push(UnitError::ConsistencyError(
                    EquationError {
                        start: loc.start,
                        end: loc.end,
                        code: ErrorCode::UnitMismatch,
                    },
                    Some(format!(
                        "declared '{}' but equation is '{}'",
                        pretty_print_unit(declared),
                        pretty_print_unit(computed)
                    )),
                ));
            }
        }
    };

    match ast {
        Ast::Scalar(expr) => check_one(expr),
        Ast::ApplyToAll(_, expr) => check_one(expr),
        Ast::Arrayed(_, elements) => {
            for expr in elements.values() {
                check_one(expr);
            }
        }
    }

    eval.errors
}

/// Check every variable in a model, appending consistency errors to the
/// offending variables.  Advisory: never blocks compilation.
pub fn check_model(ctx: &Context, model: &mut ModelStage1) {
    let var_units: HashMap<Ident, Option<UnitMap>> = model
        .variables
        .iter()
        .map(|(ident, var)| (ident.clone(), var.units().cloned()))
        .collect();

    let mut new_errors: HashMap<Ident, Vec<UnitError>> = HashMap::new();

    for (ident, var) in model.variables.iter() {
        if let Some(ast) = var.ast() {
            let errors = check_ast(ctx, &var_units, ast, var.units());
            if !errors.is_empty() {
                new_errors.insert(ident.clone(), errors);
            }
        }

        // a stock's flows must carry stock-units per time
        if let Variable::Stock {
            inflows,
            outflows,
            units: Some(stock_units),
            ..
        } = var
        {
            if let Some(time_units) = ctx.time_units.as_ref() {
                let time: UnitMap = [(time_units.clone(), 1)].iter().cloned().collect();
                let expected_flow_units = combine(stock_units, &time, -1);
                for flow in inflows.iter().chain(outflows.iter()) {
                    if let Some(Some(flow_units)) = var_units.get(flow) {
                        if *flow_units != expected_flow_units {
                            new_errors.entry(flow.clone()).or_default().push(
                                UnitError::ConsistencyError(
                                    EquationError {
                                        start: 0,
                                        end: 0,
                                        code: ErrorCode::UnitMismatch,
                                    },
                                    Some(format!(
                                        "flow into '{}' should be '{}' but is '{}'",
                                        ident,
                                        pretty_print_unit(&expected_flow_units),
                                        pretty_print_unit(flow_units)
                                    )),
                                ),
                            );
                        }
                    }
                }
            }
        }
    }

    for (ident, errors) in new_errors.into_iter() {
        if let Some(var) = model.variables.get_mut(&ident) {
            for err in errors.into_iter() {
                var.push_unit_error(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datamodel::{SimMethod, Unit};
    use crate::dimensions::DimensionsContext;
    use crate::model::{build_xvars_map, ModelStage0};
    use crate::testutils::{sim_specs, x_aux, x_flow, x_model, x_stock};

    fn checked_model(variables: Vec<crate::datamodel::Variable>) -> ModelStage1 {
        let x_model = x_model("main", variables);
        let specs = sim_specs(0.0, 10.0, 1.0, SimMethod::Euler);
        let units = &[
            Unit {
                name: "people".to_string(),
                equation: None,
                disabled: false,
                aliases: vec!["person".to_string()],
            },
            Unit {
                name: "time".to_string(),
                equation: None,
                disabled: false,
                aliases: vec![],
            },
        ];
        let units_ctx = Context::new_with_builtins(units, &specs).unwrap();
        let dims_ctx = DimensionsContext::default();
        let models = [build_xvars_map("main".to_string(), &x_model)]
            .into_iter()
            .collect();
        let s0 = ModelStage0::new(&models, &x_model, &dims_ctx, &units_ctx, false);
        let mut s1 = ModelStage1::new(&dims_ctx, &s0);
        let empty = HashMap::new();
        s1.set_dependencies(&empty, &dims_ctx);
        check_model(&units_ctx, &mut s1);
        s1
    }

    #[test]
    fn test_consistent_units_pass() {
        let model = checked_model(vec![
            x_stock("population", "100", &["births"], &[], Some("people")),
            x_flow("births", "population * birth_rate", Some("people/time")),
            x_aux("birth_rate", "0.02", Some("1/time")),
        ]);
        assert!(
            model.get_unit_errors().is_empty(),
            "unexpected unit errors: {:?}",
            model.get_unit_errors()
        );
    }

    #[test]
    fn test_addition_mismatch() {
        let model = checked_model(vec![
            x_aux("a", "1", Some("people")),
            x_aux("b", "2", Some("time")),
            x_aux("c", "a + b", None),
        ]);
        let errors = model.get_unit_errors();
        assert!(errors.contains_key("c"));
        match &errors["c"][0] {
            UnitError::ConsistencyError(err, _) => {
                assert_eq!(ErrorCode::UnitMismatch, err.code)
            }
            other => panic!("expected consistency error, got {:?}", other),
        }
    }

    #[test]
    fn test_declared_vs_computed_mismatch() {
        let model = checked_model(vec![
            x_aux("a", "1", Some("people")),
            x_aux("b", "a * a", Some("people")),
        ]);
        let errors = model.get_unit_errors();
        assert!(errors.contains_key("b"));
    }

    #[test]
    fn test_flow_units_checked_against_stock() {
        let model = checked_model(vec![
            x_stock("population", "100", &["births"], &[], Some("people")),
            // wrong: flows into a people stock must be people/time
            x_flow("births", "1", Some("people")),
        ]);
        let errors = model.get_unit_errors();
        assert!(errors.contains_key("births"));
    }

    #[test]
    fn test_unknown_units_are_silent() {
        let model = checked_model(vec![
            x_aux("a", "1", None),
            x_aux("b", "a + 2", None),
        ]);
        assert!(model.get_unit_errors().is_empty());
    }
}
