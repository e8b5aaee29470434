// Copyright 2025 The Fluxion Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! Property-based checks of the universal invariants.

use proptest::prelude::*;

use fluxion_engine::datamodel::{Dt, Equation, SimMethod, SimSpecs};
use fluxion_engine::{canonicalize, LexerType};

proptest! {
    #[test]
    fn canonicalize_is_idempotent(s in "\\PC*") {
        let once = canonicalize(&s);
        let twice = canonicalize(&once);
        prop_assert_eq!(once, twice);
    }

    #[test]
    fn canonicalize_never_panics(s in ".*") {
        let _ = canonicalize(&s);
    }

    #[test]
    fn lexer_is_total(s in "\\PC*") {
        // lexing arbitrary input never panics; errors are values
        let _ = fluxion_engine::ast::Expr0::new(&s, LexerType::Equation);
        let _ = fluxion_engine::ast::Expr0::new(&s, LexerType::Units);
    }

    #[test]
    fn serde_roundtrips_arbitrary_scalar_projects(
        name in "[a-z][a-z0-9 ]{0,30}",
        eqn in "[a-z0-9+*() .]{0,40}",
        start in 0.0_f64..100.0,
        duration in 0.1_f64..100.0,
        dt in prop::sample::select(vec![0.125, 0.25, 0.5, 1.0]),
    ) {
        let project = fluxion_engine::datamodel::Project {
            name,
            sim_specs: SimSpecs {
                start,
                stop: start + duration,
                dt: Dt::Dt(dt),
                save_step: None,
                sim_method: SimMethod::Euler,
                time_units: Some("time".to_string()),
            },
            dimensions: vec![],
            units: vec![],
            models: vec![fluxion_engine::datamodel::Model {
                name: "main".to_string(),
                variables: vec![fluxion_engine::datamodel::Variable::Aux(
                    fluxion_engine::datamodel::Aux {
                        ident: "a".to_string(),
                        equation: Equation::Scalar(eqn, None),
                        documentation: "".to_string(),
                        units: None,
                        gf: None,
                        can_be_module_input: false,
                    },
                )],
                views: vec![],
            }],
            source: None,
        };

        let bytes = fluxion_engine::serde::serialize(&project);
        let decoded = fluxion_engine::serde::deserialize(&bytes).unwrap();
        prop_assert_eq!(&project, &decoded);

        // byte-exactness in the serialize direction
        let bytes2 = fluxion_engine::serde::serialize(&decoded);
        prop_assert_eq!(bytes, bytes2);
    }

    #[test]
    fn parser_never_panics_on_junk(s in "[a-z0-9+\\-*/^()\\[\\]:,.'@ ]{0,60}") {
        let _ = fluxion_engine::ast::Expr0::new(&s, LexerType::Equation);
    }
}
