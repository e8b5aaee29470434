// Copyright 2025 The Fluxion Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

use std::borrow::Cow;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::{error, result};

use lazy_static::lazy_static;
use regex::Regex;

pub type Ident = String;
pub type DimensionName = String;
pub type ElementName = String;

/// Reserved prefix for identifiers synthesized by the engine (module
/// expansion, LTM instrumentation).  `⁚` is not a valid identifier
/// character in user equations, so collisions are impossible.
pub const SYNTHETIC_PREFIX: &str = "$⁚";

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    NoError, // will never be produced
    DoesNotExist,
    ProtobufDecode,
    JsonDecode,
    InvalidToken,
    UnrecognizedEof,
    UnrecognizedToken,
    ExtraToken,
    UnclosedComment,
    UnclosedQuotedIdent,
    ExpectedNumber,
    ExpectedInteger,
    ExpectedIntegerOne,
    ExpectedIdent,
    UnknownBuiltin,
    BadBuiltinArgs,
    EmptyEquation,
    BadModuleInputSrc,
    BadModuleInputDst,
    NotSimulatable,
    BadTable,
    BadSimSpecs,
    CircularDependency,
    BadDimensionName,
    BadModelName,
    MismatchedDimensions,
    SubscriptOutOfRange,
    ArrayReferenceNeedsExplicitSubscripts,
    ArraysNotImplemented,
    DuplicateVariable,
    UnknownDependency,
    VariablesHaveErrors,
    UnitDefinitionErrors,
    UnitMismatch,
    DuplicateUnit,
    NoConstInUnits,
    NoAppInUnits,
    NoSubscriptInUnits,
    NoUnaryOpInUnits,
    NoIfInUnits,
    BadBinaryOpInUnits,
    ExpectedModule,
    DanglingFlow,
    BadLookupInput,
    LtmNoArrays,
    LtmPreviousAtStart,
    Generic,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use ErrorCode::*;
        let name = match self {
            NoError => "no_error",
            DoesNotExist => "does_not_exist",
            ProtobufDecode => "protobuf_decode",
            JsonDecode => "json_decode",
            InvalidToken => "invalid_token",
            UnrecognizedEof => "unrecognized_eof",
            UnrecognizedToken => "unrecognized_token",
            ExtraToken => "extra_token",
            UnclosedComment => "unclosed_comment",
            UnclosedQuotedIdent => "unclosed_quoted_ident",
            ExpectedNumber => "expected_number",
            ExpectedInteger => "expected_integer",
            ExpectedIntegerOne => "expected_integer_one",
            ExpectedIdent => "expected_ident",
            UnknownBuiltin => "unknown_builtin",
            BadBuiltinArgs => "bad_builtin_args",
            EmptyEquation => "empty_equation",
            BadModuleInputSrc => "bad_module_input_src",
            BadModuleInputDst => "bad_module_input_dst",
            NotSimulatable => "not_simulatable",
            BadTable => "bad_table",
            BadSimSpecs => "bad_sim_specs",
            CircularDependency => "circular_dependency",
            BadDimensionName => "bad_dimension_name",
            BadModelName => "bad_model_name",
            MismatchedDimensions => "mismatched_dimensions",
            SubscriptOutOfRange => "subscript_out_of_range",
            ArrayReferenceNeedsExplicitSubscripts => "array_reference_needs_explicit_subscripts",
            ArraysNotImplemented => "arrays_not_implemented",
            DuplicateVariable => "duplicate_variable",
            UnknownDependency => "unknown_dependency",
            VariablesHaveErrors => "variables_have_errors",
            UnitDefinitionErrors => "unit_definition_errors",
            UnitMismatch => "unit_mismatch",
            DuplicateUnit => "duplicate_unit",
            NoConstInUnits => "no_const_in_units",
            NoAppInUnits => "no_app_in_units",
            NoSubscriptInUnits => "no_subscript_in_units",
            NoUnaryOpInUnits => "no_unary_op_in_units",
            NoIfInUnits => "no_if_in_units",
            BadBinaryOpInUnits => "bad_binary_op_in_units",
            ExpectedModule => "expected_module",
            DanglingFlow => "dangling_flow",
            BadLookupInput => "bad_lookup_input",
            LtmNoArrays => "ltm_no_arrays",
            LtmPreviousAtStart => "ltm_previous_at_start",
            Generic => "generic",
        };

        write!(f, "{}", name)
    }
}

/// An error pinned to a span of an equation's source text.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EquationError {
    pub start: u16,
    pub end: u16,
    pub code: ErrorCode,
}

impl fmt::Display for EquationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}:{}", self.start, self.end, self.code)
    }
}

impl From<Error> for EquationError {
    fn from(err: Error) -> Self {
        EquationError {
            code: err.code,
            start: 0,
            end: 0,
        }
    }
}

/// Unit problems come in two flavors: the unit expression itself doesn't
/// parse (well-formedness), or it parses but disagrees with the equation
/// (consistency).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum UnitError {
    DefinitionError(EquationError),
    ConsistencyError(EquationError, Option<String>),
}

impl fmt::Display for UnitError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            UnitError::DefinitionError(err) => write!(f, "unit definition:{}", err),
            UnitError::ConsistencyError(err, details) => match details {
                Some(details) => write!(f, "unit consistency:{} ({})", err, details),
                None => write!(f, "unit consistency:{}", err),
            },
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Import,
    Model,
    Simulation,
    Variable,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Error {
    pub kind: ErrorKind,
    pub code: ErrorCode,
    pub details: Option<String>,
}

impl Error {
    pub fn new(kind: ErrorKind, code: ErrorCode, details: Option<String>) -> Self {
        Error {
            kind,
            code,
            details,
        }
    }
}

impl From<(Ident, EquationError)> for Error {
    fn from(err: (Ident, EquationError)) -> Self {
        Error {
            kind: ErrorKind::Variable,
            code: err.1.code,
            details: Some(err.0),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let kind = match self.kind {
            ErrorKind::Import => "ImportError",
            ErrorKind::Model => "ModelError",
            ErrorKind::Simulation => "SimulationError",
            ErrorKind::Variable => "VariableError",
        };
        match self.details {
            Some(ref details) => write!(f, "{}{{{}: {}}}", kind, self.code, details),
            None => write!(f, "{}{{{}}}", kind, self.code),
        }
    }
}

impl error::Error for Error {}

pub type Result<T> = result::Result<T, Error>;
pub type EquationResult<T> = result::Result<T, EquationError>;

#[macro_export]
macro_rules! eprintln(
    ($($arg:tt)*) => {{
        use std::io::Write;
        let r = writeln!(&mut ::std::io::stderr(), $($arg)*);
        r.expect("failed printing to stderr");
    }}
);

#[macro_export]
macro_rules! eqn_err(
    ($code:tt, $start:expr, $end:expr) => {{
        use $crate::common::{EquationError, ErrorCode};
        Err(EquationError{ start: $start, end: $end, code: ErrorCode::$code})
    }}
);

#[macro_export]
macro_rules! var_eqn_err(
    ($ident:expr, $code:tt, $start:expr, $end:expr) => {{
        use $crate::common::{EquationError, ErrorCode};
        Err(($ident, EquationError{ start: $start, end: $end, code: ErrorCode::$code}))
    }}
);

#[macro_export]
macro_rules! model_err(
    ($code:tt, $str:expr) => {{
        use $crate::common::{Error, ErrorCode, ErrorKind};
        Err(Error{
            kind: ErrorKind::Model,
            code: ErrorCode::$code,
            details: Some($str),
        })
    }}
);

#[macro_export]
macro_rules! sim_err {
    ($code:tt, $str:expr) => {{
        use $crate::common::{Error, ErrorCode, ErrorKind};
        Err(Error {
            kind: ErrorKind::Simulation,
            code: ErrorCode::$code,
            details: Some($str),
        })
    }};
    ($code:tt) => {{
        use $crate::common::{Error, ErrorCode, ErrorKind};
        Err(Error {
            kind: ErrorKind::Simulation,
            code: ErrorCode::$code,
            details: None,
        })
    }};
}

/// canonicalize converts a user-visible variable name into the single
/// internal spelling the engine uses for identity: lowercased, whitespace
/// runs collapsed to `_`, quoting removed, `.` module separators rewritten
/// to `·` so they can't be confused with quoted dots.  Idempotent.
pub fn canonicalize(name: &str) -> Ident {
    // trim before testing for quotedness; a quoted string is sacrosanct
    let name = name.trim();

    lazy_static! {
        static ref UNDERSCORE_RE: Regex = Regex::new(r"(\\n|\\r|\n|\r| |\x{00A0})+").unwrap();
        // splits a."b \" c" into: ('a.', '"b \" c"')
        static ref QUOTED_RE: Regex = Regex::new(r#"[^"]+|"((\\")|[^"])*""#).unwrap();
    }

    let mut canonicalized_name = String::with_capacity(name.len());

    for part in QUOTED_RE.find_iter(name).map(|part| part.as_str()) {
        let bytes = part.as_bytes();
        let quoted: bool =
            { bytes.len() >= 2 && bytes[0] == b'"' && bytes[bytes.len() - 1] == b'"' };

        let part = if quoted {
            Cow::Borrowed(&part[1..bytes.len() - 1])
        } else {
            Cow::Owned(part.replace('.', "·"))
        };

        let part = part.replace("\\\\", "\\");
        let part = UNDERSCORE_RE.replace_all(&part, "_");
        let part = part.to_lowercase();

        canonicalized_name.push_str(&part);
    }

    canonicalized_name
}

/// quoteize is the display-direction inverse of the `·` rewriting in
/// canonicalize.
pub fn quoteize(ident: &str) -> String {
    ident.replace('·', ".")
}

/// topo_sort orders a runlist so every variable appears after its
/// dependencies.  Cycles must have been rejected before this is called.
pub fn topo_sort<'out>(
    runlist: Vec<&'out str>,
    dependencies: &'out HashMap<Ident, BTreeSet<Ident>>,
) -> Vec<&'out str> {
    use std::collections::HashSet;

    let runlist_len = runlist.len();
    let mut result: Vec<&'out str> = Vec::with_capacity(runlist_len);
    let mut used: HashSet<&str> = HashSet::new();

    // postorder traversal so dependencies land before their dependents
    fn add<'a>(
        dependencies: &'a HashMap<Ident, BTreeSet<Ident>>,
        result: &mut Vec<&'a str>,
        used: &mut HashSet<&'a str>,
        ident: &'a str,
    ) {
        if used.contains(ident) {
            return;
        }
        used.insert(ident);
        for dep in dependencies[ident].iter() {
            add(dependencies, result, used, dep)
        }
        result.push(ident);
    }

    for ident in runlist.into_iter() {
        add(dependencies, &mut result, &mut used, ident);
    }

    assert_eq!(runlist_len, result.len());
    result
}

#[inline(always)]
/// number of bytes in the utf8 encoding of a char; const version of
/// char::len_utf8.
pub const fn len_utf8(code: char) -> usize {
    const MAX_ONE_B: u32 = 0x80;
    const MAX_TWO_B: u32 = 0x800;
    const MAX_THREE_B: u32 = 0x10000;

    let code = code as u32;
    if code < MAX_ONE_B {
        1
    } else if code < MAX_TWO_B {
        2
    } else if code < MAX_THREE_B {
        3
    } else {
        4
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonicalize() {
        assert_eq!("a.b", canonicalize("\"a.b\""));
        assert_eq!("a/d·b_c", canonicalize("\"a/d\".\"b c\""));
        assert_eq!("a·b_c", canonicalize("a.\"b c\""));
        assert_eq!("a/d·b", canonicalize("\"a/d\".b"));
        assert_eq!("quoted", canonicalize("\"quoted\""));
        assert_eq!("a_b", canonicalize("   a b"));
        assert_eq!("å_b", canonicalize("Å\nb"));
        assert_eq!("a_b", canonicalize("a \n b"));
        assert_eq!("a·b", canonicalize("a.b"));
    }

    #[test]
    fn test_canonicalize_idempotent() {
        for s in &["Birth Rate", "\"a.b\"", "a.\"b c\"", "Å\nb", "déjà vu"] {
            let once = canonicalize(s);
            assert_eq!(once, canonicalize(&once));
        }
    }

    #[test]
    fn test_quoteize() {
        assert_eq!("a_b", quoteize("a_b"));
        assert_eq!("a.b", quoteize("a·b"));
    }

    #[test]
    fn test_len_utf8() {
        assert_eq!(1, len_utf8('a'));
        assert_eq!(2, len_utf8('·'));
        assert_eq!(3, len_utf8('⁚'));
        assert_eq!(4, len_utf8('📊'));
    }

    #[test]
    fn test_topo_sort() {
        let deps: HashMap<Ident, BTreeSet<Ident>> = [
            ("a".to_string(), BTreeSet::new()),
            (
                "b".to_string(),
                ["a".to_string()].iter().cloned().collect(),
            ),
            (
                "c".to_string(),
                ["b".to_string(), "a".to_string()].iter().cloned().collect(),
            ),
        ]
        .iter()
        .cloned()
        .collect();

        let sorted = topo_sort(vec!["c", "a", "b"], &deps);
        assert_eq!(vec!["a", "b", "c"], sorted);
    }
}
