// Copyright 2025 The Fluxion Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! Precomputed dimension lookups.
//!
//! Dimension and element questions are asked constantly during type
//! checking and compilation ("is `boston` an element, and of what?",
//! "is `urban` a subdimension of `location`?"), so everything is
//! computed once per project and answered in O(1) after that.

use std::collections::HashMap;

use crate::common::{canonicalize, DimensionName, Ident};
use crate::datamodel::Dimension;

#[derive(Clone, Debug, Default)]
pub struct DimensionsContext {
    dimensions: HashMap<DimensionName, Dimension>,
    /// canonical element name -> (canonical dimension name, 0-based offset)
    elements: HashMap<Ident, (DimensionName, usize)>,
    /// (subdimension, parent) -> offsets of the sub's elements in the parent
    subdimensions: HashMap<(DimensionName, DimensionName), Vec<usize>>,
}

impl DimensionsContext {
    pub fn from(dimensions: &[Dimension]) -> Self {
        let mut ctx = DimensionsContext::default();

        for dim in dimensions {
            let dim_name = canonicalize(dim.name());
            if let Dimension::Named(_, elements) = dim {
                for (i, element) in elements.iter().enumerate() {
                    let element = canonicalize(element);
                    // first dimension wins on cross-dimension collisions
                    ctx.elements
                        .entry(element)
                        .or_insert_with(|| (dim_name.clone(), i));
                }
            }
            ctx.dimensions.insert(dim_name, dim.clone());
        }

        // a dimension is a subdimension of another if its elements are an
        // in-order subset of the other's
        for (sub_name, sub) in ctx.dimensions.iter() {
            let sub_elements = match sub {
                Dimension::Named(_, elements) => elements,
                Dimension::Indexed(_, _) => continue,
            };
            for (parent_name, parent) in ctx.dimensions.iter() {
                if sub_name == parent_name {
                    continue;
                }
                let parent_elements = match parent {
                    Dimension::Named(_, elements) => elements,
                    Dimension::Indexed(_, _) => continue,
                };
                if sub_elements.len() >= parent_elements.len() {
                    continue;
                }
                let mut offsets = Vec::with_capacity(sub_elements.len());
                let mut parent_off = 0;
                for element in sub_elements {
                    while parent_off < parent_elements.len()
                        && parent_elements[parent_off] != *element
                    {
                        parent_off += 1;
                    }
                    if parent_off >= parent_elements.len() {
                        break;
                    }
                    offsets.push(parent_off);
                    parent_off += 1;
                }
                if offsets.len() == sub_elements.len() {
                    ctx.subdimensions
                        .insert((sub_name.clone(), parent_name.clone()), offsets);
                }
            }
        }

        ctx
    }

    pub fn contains(&self, name: &str) -> bool {
        self.dimensions.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&Dimension> {
        self.dimensions.get(name)
    }

    pub fn len(&self) -> usize {
        self.dimensions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dimensions.is_empty()
    }

    /// 1-based subscript offset if `ident` names a dimension element,
    /// either bare (`boston`) or dimension-qualified (`location·boston`).
    pub fn lookup(&self, ident: &str) -> Option<usize> {
        if let Some((_, off)) = self.elements.get(ident) {
            return Some(off + 1);
        }
        if let Some(pos) = ident.find('·') {
            let dim_name = &ident[..pos];
            let element = &ident[pos + '·'.len_utf8()..];
            if let Some(dim) = self.dimensions.get(dim_name) {
                return dim.get_offset(element).map(|off| off + 1);
            }
        }
        None
    }

    /// The dimension a bare element name belongs to.
    pub fn lookup_element_dimension(&self, ident: &str) -> Option<&Dimension> {
        self.elements
            .get(ident)
            .and_then(|(dim_name, _)| self.dimensions.get(dim_name))
    }

    pub fn is_subdimension_of(&self, sub: &str, parent: &str) -> bool {
        self.subdimensions
            .contains_key(&(sub.to_string(), parent.to_string()))
    }

    /// Offsets of the subdimension's elements within the parent, in the
    /// subdimension's element order.
    pub fn subdimension_offsets(&self, sub: &str, parent: &str) -> Option<&[usize]> {
        self.subdimensions
            .get(&(sub.to_string(), parent.to_string()))
            .map(|v| v.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> DimensionsContext {
        DimensionsContext::from(&[
            Dimension::Named(
                "location".to_string(),
                vec![
                    "boston".to_string(),
                    "chicago".to_string(),
                    "la".to_string(),
                ],
            ),
            Dimension::Named(
                "coastal".to_string(),
                vec!["boston".to_string(), "la".to_string()],
            ),
            Dimension::Indexed("cohort".to_string(), 5),
        ])
    }

    #[test]
    fn test_element_lookup() {
        let ctx = ctx();
        assert_eq!(Some(1), ctx.lookup("boston"));
        assert_eq!(Some(2), ctx.lookup("chicago"));
        assert_eq!(Some(3), ctx.lookup("la"));
        assert_eq!(None, ctx.lookup("nyc"));
        assert_eq!(Some(2), ctx.lookup("location·chicago"));
    }

    #[test]
    fn test_subdimensions() {
        let ctx = ctx();
        assert!(ctx.is_subdimension_of("coastal", "location"));
        assert!(!ctx.is_subdimension_of("location", "coastal"));
        assert!(!ctx.is_subdimension_of("cohort", "location"));
        assert_eq!(
            Some(&[0usize, 2][..]),
            ctx.subdimension_offsets("coastal", "location")
        );
    }

    #[test]
    fn test_indexed_dimension() {
        let ctx = ctx();
        assert!(ctx.contains("cohort"));
        assert_eq!(5, ctx.get("cohort").unwrap().len());
    }
}
