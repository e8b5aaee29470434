// Copyright 2025 The Fluxion Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! Unit expressions and their algebra.
//!
//! A unit expression is a product of named units raised to integer
//! exponents; we normalize everything to a `UnitMap` (name -> exponent).
//! Parsing reuses the equation grammar in Units mode.

use std::collections::{BTreeMap, HashMap};
use std::result::Result as StdResult;

use float_cmp::approx_eq;

use crate::ast::{BinaryOp, Expr0, UnaryOp};
use crate::common::{EquationError, EquationResult, ErrorCode, UnitError};
use crate::datamodel::{SimSpecs, Unit};
use crate::eqn_err;
use crate::token::LexerType;

/// name -> exponent; an empty map is dimensionless.
pub type UnitMap = BTreeMap<String, i32>;

const DIMENSIONLESS_NAMES: &[&str] = &["dmnl", "dimensionless", "unitless", "1"];

pub fn is_dimensionless_name(name: &str) -> bool {
    DIMENSIONLESS_NAMES.contains(&name)
}

/// Multiply two unit maps (add exponents, dropping zeroes).
pub fn combine(l: &UnitMap, r: &UnitMap, r_exponent: i32) -> UnitMap {
    let mut result = l.clone();
    for (unit, n) in r.iter() {
        let n = n * r_exponent;
        let new_value = match result.get(unit) {
            None => n,
            Some(m) => n + *m,
        };
        if new_value == 0 {
            result.remove(unit);
        } else {
            result.insert(unit.clone(), new_value);
        }
    }
    result
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Context {
    aliases: HashMap<String, String>,
    units: HashMap<String, UnitMap>,
    pub time_units: Option<String>,
}

impl Context {
    pub fn new(units: &[Unit]) -> StdResult<Self, Vec<(String, Vec<EquationError>)>> {
        let mut unit_errors: Vec<(String, Vec<EquationError>)> = Vec::new();

        // pass 1: prime units (no defining equation)
        let mut aliases = HashMap::new();
        let mut parsed_units = HashMap::new();
        for unit in units.iter().filter(|unit| unit.equation.is_none()) {
            if unit.disabled {
                continue;
            }
            for alias in unit.aliases.iter() {
                if aliases.contains_key(alias) {
                    unit_errors.push((
                        unit.name.clone(),
                        vec![EquationError {
                            start: 0,
                            end: 0,
                            code: ErrorCode::DuplicateUnit,
                        }],
                    ));
                } else {
                    aliases.insert(alias.clone(), unit.name.clone());
                }
            }
            if aliases.contains_key(&unit.name) || parsed_units.contains_key(&unit.name) {
                unit_errors.push((
                    unit.name.clone(),
                    vec![EquationError {
                        start: 0,
                        end: 0,
                        code: ErrorCode::DuplicateUnit,
                    }],
                ));
            } else {
                parsed_units.insert(
                    unit.name.clone(),
                    [(unit.name.clone(), 1)].iter().cloned().collect(),
                );
            }
        }

        let mut ctx = Context {
            aliases,
            units: parsed_units,
            time_units: None,
        };

        // pass 2: derived units, parsed against the prime ones
        for unit in units.iter().filter(|unit| unit.equation.is_some()) {
            if unit.disabled {
                continue;
            }
            for alias in unit.aliases.iter() {
                if ctx.aliases.contains_key(alias) {
                    unit_errors.push((
                        unit.name.clone(),
                        vec![EquationError {
                            start: 0,
                            end: 0,
                            code: ErrorCode::DuplicateUnit,
                        }],
                    ));
                } else {
                    ctx.aliases.insert(alias.clone(), unit.name.clone());
                }
            }

            let eqn = unit.equation.as_ref().unwrap();

            let ast = match Expr0::new(eqn, LexerType::Units) {
                Ok(ast) => ast,
                Err(errors) => {
                    unit_errors.push((unit.name.clone(), errors));
                    continue;
                }
            };

            let components = match ast {
                Some(ref ast) => match build_unit_components(&ctx, ast) {
                    Ok(components) => components,
                    Err(err) => {
                        unit_errors.push((unit.name.clone(), vec![err]));
                        continue;
                    }
                },
                None => [(unit.name.clone(), 1)].iter().cloned().collect(),
            };

            if ctx.aliases.contains_key(&unit.name) || ctx.units.contains_key(&unit.name) {
                unit_errors.push((
                    unit.name.clone(),
                    vec![EquationError {
                        start: 0,
                        end: 0,
                        code: ErrorCode::DuplicateUnit,
                    }],
                ));
            } else {
                ctx.units.insert(unit.name.clone(), components);
            }
        }

        if unit_errors.is_empty() {
            Ok(ctx)
        } else {
            Err(unit_errors)
        }
    }

    pub fn new_with_builtins(
        units: &[Unit],
        sim_specs: &SimSpecs,
    ) -> StdResult<Self, Vec<(String, Vec<EquationError>)>> {
        let mut ctx = Self::new(units)?;
        if let Some(time_units) = &sim_specs.time_units {
            let time_units = ctx
                .aliases
                .get(time_units)
                .cloned()
                .unwrap_or_else(|| time_units.clone());
            ctx.units
                .entry(time_units.clone())
                .or_insert_with(|| [(time_units.clone(), 1)].iter().cloned().collect());
            ctx.time_units = Some(time_units);
        }
        Ok(ctx)
    }

    fn resolve<'a>(&'a self, name: &'a str) -> &'a str {
        self.aliases.get(name).map(|s| s.as_str()).unwrap_or(name)
    }

    /// The normalized unit map for a single unit name.
    pub fn lookup(&self, name: &str) -> UnitMap {
        let name = self.resolve(name);
        if is_dimensionless_name(name) {
            return UnitMap::new();
        }
        match self.units.get(name) {
            Some(map) => map.clone(),
            // unknown names are implicitly prime units
            None => [(name.to_string(), 1)].iter().cloned().collect(),
        }
    }
}

fn const_int_eval(ast: &Expr0) -> EquationResult<i32> {
    match ast {
        Expr0::Const(_, n, loc) => {
            if approx_eq!(f64, *n, n.round()) {
                Ok(n.round() as i32)
            } else {
                eqn_err!(ExpectedInteger, loc.start, loc.end)
            }
        }
        Expr0::Var(_, loc) => {
            eqn_err!(ExpectedInteger, loc.start, loc.end)
        }
        Expr0::App(_, loc) => {
            eqn_err!(ExpectedInteger, loc.start, loc.end)
        }
        Expr0::Subscript(_, _, loc) => {
            eqn_err!(ExpectedInteger, loc.start, loc.end)
        }
        Expr0::Op1(op, expr, loc) => {
            let expr = const_int_eval(expr)?;
            let result = match op {
                UnaryOp::Positive => expr,
                UnaryOp::Negative => -expr,
                UnaryOp::Not => {
                    if expr == 0 {
                        1
                    } else {
                        0
                    }
                }
                UnaryOp::Transpose => {
                    return eqn_err!(ExpectedInteger, loc.start, loc.end);
                }
            };
            Ok(result)
        }
        Expr0::Op2(op, l, r, _) => {
            let l = const_int_eval(l)?;
            let r = const_int_eval(r)?;
            let result = match op {
                BinaryOp::Add => l + r,
                BinaryOp::Sub => l - r,
                BinaryOp::Exp => l.pow(r as u32),
                BinaryOp::Mul => l * r,
                BinaryOp::Div => {
                    if r == 0 {
                        0
                    } else {
                        l / r
                    }
                }
                BinaryOp::Mod => l % r,
                BinaryOp::Gt => (l > r) as i32,
                BinaryOp::Lt => (l < r) as i32,
                BinaryOp::Gte => (l >= r) as i32,
                BinaryOp::Lte => (l <= r) as i32,
                BinaryOp::Eq => (l == r) as i32,
                BinaryOp::Neq => (l != r) as i32,
                BinaryOp::And => ((l != 0) && (r != 0)) as i32,
                BinaryOp::Or => ((l != 0) || (r != 0)) as i32,
            };
            Ok(result)
        }
        Expr0::If(_, _, _, loc) => {
            eqn_err!(ExpectedInteger, loc.start, loc.end)
        }
    }
}

fn build_unit_components(ctx: &Context, ast: &Expr0) -> EquationResult<UnitMap> {
    let unit_map: UnitMap = match ast {
        Expr0::Const(_, _, loc) => {
            // bare constants only make sense as the 1 in 1/x, handled in
            // the Div arm below
            return eqn_err!(NoConstInUnits, loc.start, loc.end);
        }
        Expr0::Var(id, _) => {
            let id = ctx.resolve(id);
            if is_dimensionless_name(id) {
                UnitMap::new()
            } else {
                [(id.to_owned(), 1)].iter().cloned().collect()
            }
        }
        Expr0::App(_, loc) => {
            return eqn_err!(NoAppInUnits, loc.start, loc.end);
        }
        Expr0::Subscript(_, _, loc) => {
            return eqn_err!(NoSubscriptInUnits, loc.start, loc.end);
        }
        Expr0::Op1(_, _, loc) => {
            return eqn_err!(NoUnaryOpInUnits, loc.start, loc.end);
        }
        Expr0::Op2(op, l, r, loc) => match op {
            BinaryOp::Exp => {
                let exp = const_int_eval(r)?;
                let mut unit_map = build_unit_components(ctx, l)?;
                unit_map.iter_mut().for_each(|(_name, unit)| {
                    *unit *= exp;
                });
                unit_map
            }
            BinaryOp::Mul => {
                let l = build_unit_components(ctx, l)?;
                let r = build_unit_components(ctx, r)?;
                combine(&l, &r, 1)
            }
            BinaryOp::Div => {
                // the reciprocal case: 1/x
                if let Ok(i) = const_int_eval(l) {
                    if i != 1 {
                        let loc = l.get_loc();
                        return eqn_err!(ExpectedIntegerOne, loc.start, loc.end);
                    }
                    let unit_map = build_unit_components(ctx, r)?;
                    combine(&UnitMap::new(), &unit_map, -1)
                } else {
                    let l = build_unit_components(ctx, l)?;
                    let r = build_unit_components(ctx, r)?;
                    combine(&l, &r, -1)
                }
            }
            _ => {
                return eqn_err!(BadBinaryOpInUnits, loc.start, loc.end);
            }
        },
        Expr0::If(_, _, _, loc) => {
            return eqn_err!(NoIfInUnits, loc.start, loc.end);
        }
    };

    Ok(unit_map)
}

/// Parse a variable's declared units string into a normalized UnitMap.
pub fn parse_units(
    ctx: &Context,
    units: Option<&str>,
) -> StdResult<Option<UnitMap>, Vec<UnitError>> {
    let units = match units {
        Some(units) if !units.trim().is_empty() => units,
        _ => return Ok(None),
    };

    let ast = match Expr0::new(units, LexerType::Units) {
        Ok(Some(ast)) => ast,
        Ok(None) => return Ok(None),
        Err(errors) => {
            return Err(errors
                .into_iter()
                .map(UnitError::DefinitionError)
                .collect());
        }
    };

    match build_unit_components(ctx, &ast) {
        Ok(map) => Ok(Some(map)),
        Err(err) => Err(vec![UnitError::DefinitionError(err)]),
    }
}

/// Render a unit map the way a modeler would write it.
pub fn pretty_print_unit(map: &UnitMap) -> String {
    if map.is_empty() {
        return "dmnl".to_string();
    }

    let numerator: Vec<String> = map
        .iter()
        .filter(|(_, n)| **n > 0)
        .map(|(unit, n)| {
            if *n == 1 {
                unit.clone()
            } else {
                format!("{}^{}", unit, n)
            }
        })
        .collect();
    let denominator: Vec<String> = map
        .iter()
        .filter(|(_, n)| **n < 0)
        .map(|(unit, n)| {
            if *n == -1 {
                unit.clone()
            } else {
                format!("{}^{}", unit, -n)
            }
        })
        .collect();

    match (numerator.is_empty(), denominator.is_empty()) {
        (true, true) => "dmnl".to_string(),
        (false, true) => numerator.join("*"),
        (true, false) => format!("1/{}", denominator.join("/")),
        (false, false) => format!("{}/{}", numerator.join("*"), denominator.join("/")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(name: &str, equation: Option<&str>, aliases: &[&str]) -> Unit {
        Unit {
            name: name.to_string(),
            equation: equation.map(|s| s.to_string()),
            disabled: false,
            aliases: aliases.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_context_creation() {
        let ctx = Context::new(&[
            unit("time", None, &[]),
            unit("people", None, &["person", "persons"]),
        ])
        .unwrap();

        assert_eq!(
            ctx.lookup("person"),
            [("people".to_string(), 1)].iter().cloned().collect()
        );
        assert_eq!(ctx.lookup("dmnl"), UnitMap::new());
    }

    #[test]
    fn test_derived_units() {
        let ctx = Context::new(&[
            unit("time", None, &[]),
            unit("invtime", Some("1/time"), &["itime"]),
        ])
        .unwrap();

        assert_eq!(
            ctx.lookup("invtime"),
            [("time".to_string(), -1)].iter().cloned().collect()
        );
    }

    #[test]
    fn test_duplicate_units() {
        let err = Context::new(&[unit("time", None, &[]), unit("time", None, &[])]).unwrap_err();
        assert_eq!(ErrorCode::DuplicateUnit, err[0].1[0].code);
    }

    #[test]
    fn test_unit_expression_parsing() {
        let ctx = Context::new(&[
            unit("meter", None, &["m", "meters"]),
            unit("second", None, &["s"]),
            unit("people", None, &["person", "persons"]),
            unit("time", None, &[]),
        ])
        .unwrap();

        let positive_cases: &[(&str, &[(&str, i32)])] = &[
            ("m^2/s", &[("meter", 2), ("second", -1)]),
            ("person * people * persons", &[("people", 3)]),
            ("m^2/meters", &[("meter", 1)]),
            ("time * people / time", &[("people", 1)]),
            ("1/time", &[("time", -1)]),
        ];

        for (input, expected) in positive_cases {
            let expected: UnitMap = expected
                .iter()
                .map(|(name, n)| (name.to_string(), *n))
                .collect();
            let result = parse_units(&ctx, Some(input)).unwrap().unwrap();
            assert_eq!(expected, result, "for {}", input);
        }

        let negative_cases: &[(&str, ErrorCode)] = &[
            ("2 / time", ErrorCode::ExpectedIntegerOne),
            ("2 * time", ErrorCode::NoConstInUnits),
            ("foo(time)", ErrorCode::NoAppInUnits),
            ("bar[time]", ErrorCode::NoSubscriptInUnits),
            ("time + people", ErrorCode::BadBinaryOpInUnits),
        ];

        for (input, expected) in negative_cases {
            let errs = parse_units(&ctx, Some(input)).unwrap_err();
            match &errs[0] {
                UnitError::DefinitionError(err) => assert_eq!(*expected, err.code, "for {}", input),
                other => panic!("unexpected error {:?} for {}", other, input),
            }
        }
    }

    #[test]
    fn test_pretty_print() {
        let map: UnitMap = [("people".to_string(), 1), ("time".to_string(), -1)]
            .iter()
            .cloned()
            .collect();
        assert_eq!("people/time", pretty_print_unit(&map));
        assert_eq!("dmnl", pretty_print_unit(&UnitMap::new()));
    }

    #[test]
    fn test_const_int_eval() {
        let cases = &[
            ("1", 1),
            ("-1", -1),
            ("3^(1+2)", 27),
            ("15 mod 7", 1),
            ("not 7", 0),
        ];
        for (input, expected) in cases {
            let expr = Expr0::new(input, LexerType::Units).unwrap().unwrap();
            assert_eq!(*expected, const_int_eval(&expr).unwrap());
        }
    }
}
