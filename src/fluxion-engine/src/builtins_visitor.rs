// Copyright 2025 The Fluxion Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! Expansion of stateful builtins into module instances.
//!
//! `SMOOTH(expr, 3)` can't be evaluated as a function call: it owns
//! state.  This visitor rewrites such calls into instances of the
//! matching stdlib template, hoisting non-identifier arguments into
//! synthesized auxiliary variables.  Every synthesized identifier starts
//! with the reserved `$⁚` prefix, so collisions with user names are
//! impossible.

use std::collections::HashMap;

use crate::ast::{print_eqn, Ast, Expr0};
use crate::builtins::{is_builtin_fn, UntypedBuiltinFn};
use crate::common::{EquationError, Ident, SYNTHETIC_PREFIX};
use crate::{datamodel, eqn_err, stdlib};

/// The positional module inputs of each stdlib template, and how many of
/// them a call must provide.
fn stdlib_args(name: &str) -> Option<(&'static [&'static str], usize)> {
    let args: (&'static [&'static str], usize) = match name {
        "smth1" | "smth3" | "delay1" | "delay3" | "trend" => {
            (&["input", "delay_time", "initial_value"], 2)
        }
        "previous" => (&["input", "initial_value"], 1),
        "init" => (&["input"], 1),
        _ => {
            return None;
        }
    };
    Some(args)
}

/// User-facing aliases for the stdlib templates.
fn normalize_stdlib_name(name: &str) -> &str {
    match name {
        "smooth" => "smth1",
        "delay" => "delay1",
        name => name,
    }
}

pub struct BuiltinVisitor<'a> {
    variable_name: &'a str,
    vars: HashMap<Ident, datamodel::Variable>,
    n: usize,
}

impl<'a> BuiltinVisitor<'a> {
    pub fn new(variable_name: &'a str) -> Self {
        Self {
            variable_name,
            vars: Default::default(),
            n: 0,
        }
    }

    fn walk_index(&mut self, expr: crate::ast::IndexExpr0) -> Result<crate::ast::IndexExpr0, EquationError> {
        use crate::ast::IndexExpr0;
        let result = match expr {
            IndexExpr0::Wildcard(_)
            | IndexExpr0::StarRange(_, _)
            | IndexExpr0::DimPosition(_, _) => expr,
            IndexExpr0::Range(l, r, loc) => IndexExpr0::Range(self.walk(l)?, self.walk(r)?, loc),
            IndexExpr0::Expr(e) => IndexExpr0::Expr(self.walk(e)?),
        };
        Ok(result)
    }

    fn walk(&mut self, expr: Expr0) -> Result<Expr0, EquationError> {
        use crate::ast::Expr0::*;
        use std::mem;
        let result: Expr0 = match expr {
            Const(_, _, _) => expr,
            Var(_, _) => expr,
            App(UntypedBuiltinFn(func, args), loc) => {
                let args: Result<Vec<Expr0>, EquationError> =
                    args.into_iter().map(|e| self.walk(e)).collect();
                let args = args?;
                if is_builtin_fn(&func) {
                    return Ok(App(UntypedBuiltinFn(func, args), loc));
                }

                let func = normalize_stdlib_name(&func).to_string();
                let (input_names, required) = match stdlib_args(&func) {
                    Some(spec) => spec,
                    None => {
                        return eqn_err!(UnknownBuiltin, loc.start, loc.end);
                    }
                };
                if args.len() < required || args.len() > input_names.len() {
                    return eqn_err!(BadBuiltinArgs, loc.start, loc.end);
                }

                // arguments that aren't plain identifiers get hoisted
                // into synthesized auxes so module references stay
                // name-to-name
                let ident_args: Vec<Ident> = args
                    .into_iter()
                    .enumerate()
                    .map(|(i, arg)| {
                        if let Expr0::Var(id, _loc) = arg {
                            id
                        } else {
                            let id = format!(
                                "{}{}⁚{}⁚arg{}",
                                SYNTHETIC_PREFIX, self.variable_name, self.n, i
                            );
                            let eqn = print_eqn(&arg);
                            let x_var = datamodel::Variable::Aux(datamodel::Aux {
                                ident: id.clone(),
                                equation: datamodel::Equation::Scalar(eqn, None),
                                documentation: "".to_string(),
                                units: None,
                                gf: None,
                                can_be_module_input: false,
                            });
                            self.vars.insert(id.clone(), x_var);
                            id
                        }
                    })
                    .collect();

                let module_name = format!(
                    "{}{}⁚{}⁚{}",
                    SYNTHETIC_PREFIX, self.variable_name, self.n, func
                );
                let references: Vec<_> = ident_args
                    .into_iter()
                    .enumerate()
                    .map(|(i, src)| datamodel::ModuleReference {
                        src,
                        dst: format!("{}·{}", module_name, input_names[i]),
                    })
                    .collect();
                let x_module = datamodel::Variable::Module(datamodel::Module {
                    ident: module_name.clone(),
                    model_name: stdlib::qualified_name(&func),
                    documentation: "".to_string(),
                    units: None,
                    references,
                    can_be_module_input: false,
                });
                let module_output_name = format!("{}·output", module_name);
                self.vars.insert(module_name, x_module);

                self.n += 1;
                Var(module_output_name, loc)
            }
            Subscript(id, args, loc) => {
                let args: Result<Vec<_>, EquationError> =
                    args.into_iter().map(|e| self.walk_index(e)).collect();
                Subscript(id, args?, loc)
            }
            Op1(op, mut r, loc) => {
                *r = self.walk(mem::take(&mut *r))?;
                Op1(op, r, loc)
            }
            Op2(op, mut l, mut r, loc) => {
                *l = self.walk(mem::take(&mut *l))?;
                *r = self.walk(mem::take(&mut *r))?;
                Op2(op, l, r, loc)
            }
            If(mut cond, mut t, mut f, loc) => {
                *cond = self.walk(mem::take(&mut *cond))?;
                *t = self.walk(mem::take(&mut *t))?;
                *f = self.walk(mem::take(&mut *f))?;
                If(cond, t, f, loc)
            }
        };

        Ok(result)
    }
}

/// Rewrite stateful builtin calls in an equation into module
/// instantiations, returning the rewritten AST plus the synthesized
/// variables that now need to live beside it in the model.
pub fn instantiate_implicit_modules(
    variable_name: &str,
    ast: Ast<Expr0>,
) -> Result<(Ast<Expr0>, Vec<datamodel::Variable>), EquationError> {
    let mut visitor = BuiltinVisitor::new(variable_name);
    let ast = match ast {
        Ast::Scalar(ast) => Ast::Scalar(visitor.walk(ast)?),
        Ast::ApplyToAll(dims, ast) => Ast::ApplyToAll(dims, visitor.walk(ast)?),
        Ast::Arrayed(dims, elements) => {
            let elements: Result<HashMap<_, _>, EquationError> = elements
                .into_iter()
                .map(|(subscript, eqn)| visitor.walk(eqn).map(|ast| (subscript, ast)))
                .collect();
            Ast::Arrayed(dims, elements?)
        }
    };
    let mut vars: Vec<_> = visitor.vars.into_values().collect();
    vars.sort_unstable_by(|a, b| a.get_ident().cmp(b.get_ident()));
    Ok((ast, vars))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::LexerType;

    fn expand(ident: &str, eqn: &str) -> (Ast<Expr0>, Vec<datamodel::Variable>) {
        let expr = Expr0::new(eqn, LexerType::Equation).unwrap().unwrap();
        instantiate_implicit_modules(ident, Ast::Scalar(expr)).unwrap()
    }

    #[test]
    fn test_no_expansion_for_pure_builtins() {
        let (_, vars) = expand("x", "abs(input) + max(1, 2)");
        assert!(vars.is_empty());
    }

    #[test]
    fn test_smooth_expansion() {
        let (ast, vars) = expand("output", "smth3(input, 3)");
        // one synthesized module, one hoisted arg for the literal 3
        assert_eq!(2, vars.len());

        let module = vars
            .iter()
            .find(|v| matches!(v, datamodel::Variable::Module(_)))
            .unwrap();
        if let datamodel::Variable::Module(module) = module {
            assert_eq!("stdlib⁚smth3", module.model_name);
            assert!(module.ident.starts_with(SYNTHETIC_PREFIX));
            assert_eq!(2, module.references.len());
            assert_eq!("input", module.references[0].src);
        }

        if let Ast::Scalar(Expr0::Var(id, _)) = ast {
            assert!(id.starts_with(SYNTHETIC_PREFIX));
            assert!(id.ends_with("·output"));
        } else {
            panic!("expected rewritten var reference");
        }
    }

    #[test]
    fn test_smooth_alias() {
        let (_, vars) = expand("output", "smooth(input, 3)");
        let module = vars
            .iter()
            .find(|v| matches!(v, datamodel::Variable::Module(_)))
            .unwrap();
        if let datamodel::Variable::Module(module) = module {
            assert_eq!("stdlib⁚smth1", module.model_name);
        }
    }

    #[test]
    fn test_nested_expansion() {
        // previous(previous(x)) expands twice
        let (_, vars) = expand("y", "previous(previous(x))");
        let modules: Vec<_> = vars
            .iter()
            .filter(|v| matches!(v, datamodel::Variable::Module(_)))
            .collect();
        assert_eq!(2, modules.len());
    }

    #[test]
    fn test_bad_arity() {
        let expr = Expr0::new("smth1(x)", LexerType::Equation).unwrap().unwrap();
        let err = instantiate_implicit_modules("y", Ast::Scalar(expr)).unwrap_err();
        assert_eq!(crate::common::ErrorCode::BadBuiltinArgs, err.code);
    }

    #[test]
    fn test_unknown_function_flagged() {
        let expr = Expr0::new("frobnicate(x)", LexerType::Equation)
            .unwrap()
            .unwrap();
        let err = instantiate_implicit_modules("y", Ast::Scalar(expr)).unwrap_err();
        assert_eq!(crate::common::ErrorCode::UnknownBuiltin, err.code);
    }
}
