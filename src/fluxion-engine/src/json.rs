// Copyright 2025 The Fluxion Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! JSON convenience mirror of the interchange format.
//!
//! The protobuf encoding (serde.rs) is the compatibility contract; this
//! is for humans: diagnostics dumps, test fixtures, poking at projects
//! with jq.

use crate::common::{Error, ErrorCode, ErrorKind, Result};
use crate::datamodel;

pub fn to_json(project: &datamodel::Project) -> Result<String> {
    serde_json::to_string_pretty(project).map_err(|err| {
        Error::new(
            ErrorKind::Import,
            ErrorCode::JsonDecode,
            Some(err.to_string()),
        )
    })
}

pub fn from_json(json: &str) -> Result<datamodel::Project> {
    serde_json::from_str(json).map_err(|err| {
        Error::new(
            ErrorKind::Import,
            ErrorCode::JsonDecode,
            Some(err.to_string()),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datamodel::SimMethod;
    use crate::testutils::{sim_specs, x_aux, x_model, x_project};

    #[test]
    fn test_json_roundtrip() {
        let project = x_project(
            sim_specs(0.0, 10.0, 1.0, SimMethod::Euler),
            &[x_model("main", vec![x_aux("answer", "42", None)])],
        );

        let json = to_json(&project).unwrap();
        let decoded = from_json(&json).unwrap();
        assert_eq!(project, decoded);
    }

    #[test]
    fn test_bad_json() {
        let err = from_json("{not json").unwrap_err();
        assert_eq!(ErrorCode::JsonDecode, err.code);
    }
}
