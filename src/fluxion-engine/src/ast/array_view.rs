// Copyright 2025 The Fluxion Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

use crate::common::{DimensionName, Result};
use crate::sim_err;

/// Where a view's backing data lives: the simulation state slab, or the
/// per-step scratch region that holds temporaries.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum ViewSource {
    State,
    Temp,
}

/// A strided view of a logical k-dimensional tile over a flat backing
/// array.  Subscripting, slicing, transpose, and subdimension splats all
/// become view transforms; no data is copied.
///
/// `offset` and `strides` are in elements, relative to the start of the
/// viewed variable (or temporary).  A sparse axis (from a `*:sub` splat
/// over non-contiguous parent elements) carries the explicit parent
/// offsets to iterate instead of a stride.
#[derive(PartialEq, Clone, Debug)]
pub struct ArrayView {
    pub dims: Vec<usize>,
    pub strides: Vec<isize>,
    pub offset: usize,
    /// per-axis: Some(parent element offsets) if the axis is sparse
    pub sparse: Vec<Option<Vec<usize>>>,
    /// canonical dimension name per axis; empty string when anonymous
    pub dim_names: Vec<DimensionName>,
    pub source: ViewSource,
}

impl ArrayView {
    /// A contiguous row-major view over a freshly laid out array.
    pub fn contiguous(dims: Vec<usize>, dim_names: Vec<DimensionName>) -> Self {
        let mut strides = vec![1isize; dims.len()];
        for i in (0..dims.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * dims[i + 1] as isize;
        }
        let dim_names = if dim_names.is_empty() {
            vec![String::new(); dims.len()]
        } else {
            dim_names
        };
        let sparse = vec![None; dims.len()];
        ArrayView {
            dims,
            strides,
            offset: 0,
            sparse,
            dim_names,
            source: ViewSource::State,
        }
    }

    pub fn size(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn ndim(&self) -> usize {
        self.dims.len()
    }

    pub fn is_scalar(&self) -> bool {
        self.size() == 1 && self.dims.is_empty()
    }

    pub fn is_contiguous(&self) -> bool {
        if self.offset != 0 || self.sparse.iter().any(|s| s.is_some()) {
            return false;
        }
        let mut expected = 1isize;
        for i in (0..self.dims.len()).rev() {
            if self.strides[i] != expected {
                return false;
            }
            expected *= self.dims[i] as isize;
        }
        true
    }

    /// Select a single element on an axis (removing the axis).
    /// `index` is 0-based.
    pub fn select(&self, axis: usize, index: usize) -> Result<ArrayView> {
        if axis >= self.dims.len() {
            return sim_err!(MismatchedDimensions, "axis out of bounds".to_string());
        }
        if index >= self.dims[axis] {
            return sim_err!(SubscriptOutOfRange, format!("index {} on axis {}", index, axis));
        }
        let mut view = self.clone();
        let extra = match &view.sparse[axis] {
            Some(offsets) => offsets[index] as isize * view.strides[axis],
            None => index as isize * view.strides[axis],
        };
        view.offset = (view.offset as isize + extra) as usize;
        view.dims.remove(axis);
        view.strides.remove(axis);
        view.sparse.remove(axis);
        view.dim_names.remove(axis);
        Ok(view)
    }

    /// Restrict an axis to the inclusive 0-based range [start, end].
    pub fn range(&self, axis: usize, start: usize, end: usize) -> Result<ArrayView> {
        if axis >= self.dims.len() {
            return sim_err!(MismatchedDimensions, "axis out of bounds".to_string());
        }
        if start > end || end >= self.dims[axis] {
            return sim_err!(SubscriptOutOfRange, format!("range on axis {}", axis));
        }
        if self.sparse[axis].is_some() {
            return sim_err!(ArraysNotImplemented, "range over sparse axis".to_string());
        }
        let mut view = self.clone();
        view.offset = (view.offset as isize + start as isize * view.strides[axis]) as usize;
        view.dims[axis] = end - start + 1;
        Ok(view)
    }

    /// Restrict an axis to an explicit set of (possibly non-contiguous)
    /// parent offsets; used for subdimension splats.
    pub fn splat(&self, axis: usize, offsets: Vec<usize>, name: DimensionName) -> Result<ArrayView> {
        if axis >= self.dims.len() {
            return sim_err!(MismatchedDimensions, "axis out of bounds".to_string());
        }
        if offsets.iter().any(|off| *off >= self.dims[axis]) {
            return sim_err!(SubscriptOutOfRange, format!("splat on axis {}", axis));
        }
        if self.sparse[axis].is_some() {
            return sim_err!(ArraysNotImplemented, "splat over sparse axis".to_string());
        }
        let mut view = self.clone();
        view.dims[axis] = offsets.len();
        view.sparse[axis] = Some(offsets);
        view.dim_names[axis] = name;
        Ok(view)
    }

    /// Transpose: reverse axis order.  Only the strides move; the data
    /// stays where it is.
    pub fn transpose(&self) -> ArrayView {
        let mut view = self.clone();
        view.dims.reverse();
        view.strides.reverse();
        view.sparse.reverse();
        view.dim_names.reverse();
        view
    }

    /// Reorder axes so that result axis i is current axis order[i].
    pub fn permute(&self, order: &[usize]) -> Result<ArrayView> {
        if order.len() != self.dims.len() {
            return sim_err!(MismatchedDimensions, "permutation rank".to_string());
        }
        let mut seen = vec![false; order.len()];
        for &axis in order {
            if axis >= order.len() || seen[axis] {
                return sim_err!(MismatchedDimensions, "bad permutation".to_string());
            }
            seen[axis] = true;
        }
        let mut view = self.clone();
        view.dims = order.iter().map(|&i| self.dims[i]).collect();
        view.strides = order.iter().map(|&i| self.strides[i]).collect();
        view.sparse = order.iter().map(|&i| self.sparse[i].clone()).collect();
        view.dim_names = order.iter().map(|&i| self.dim_names[i].clone()).collect();
        Ok(view)
    }

    /// Element offset (relative to the variable base) for a 0-based
    /// logical index tuple.
    pub fn offset_of(&self, indices: &[usize]) -> usize {
        assert_eq!(indices.len(), self.dims.len());
        let mut off = self.offset as isize;
        for (axis, &idx) in indices.iter().enumerate() {
            let idx = match &self.sparse[axis] {
                Some(offsets) => offsets[idx],
                None => idx,
            };
            off += idx as isize * self.strides[axis];
        }
        off as usize
    }

    /// All element offsets in row-major view order.
    pub fn iter_offsets(&self) -> ViewOffsetIterator {
        ViewOffsetIterator {
            view: self,
            next: vec![0; self.dims.len()],
            remaining: self.size(),
        }
    }
}

pub struct ViewOffsetIterator<'a> {
    view: &'a ArrayView,
    next: Vec<usize>,
    remaining: usize,
}

impl<'a> Iterator for ViewOffsetIterator<'a> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        let off = self.view.offset_of(&self.next);

        for axis in (0..self.next.len()).rev() {
            self.next[axis] += 1;
            if self.next[axis] < self.view.dims[axis] {
                break;
            }
            self.next[axis] = 0;
        }

        Some(off)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contiguous() {
        let view = ArrayView::contiguous(vec![3, 4], vec![]);
        assert_eq!(vec![3, 4], view.dims);
        assert_eq!(vec![4, 1], view.strides);
        assert_eq!(0, view.offset);
        assert_eq!(12, view.size());
        assert!(view.is_contiguous());
    }

    #[test]
    fn test_select() {
        let view = ArrayView::contiguous(vec![3, 4], vec![]);
        let row = view.select(0, 1).unwrap();
        assert_eq!(vec![4], row.dims);
        assert_eq!(4, row.offset);
        assert_eq!(vec![4, 5, 6, 7], row.iter_offsets().collect::<Vec<_>>());

        let col = view.select(1, 2).unwrap();
        assert_eq!(vec![3], col.dims);
        assert_eq!(2, col.offset);
        assert_eq!(vec![2, 6, 10], col.iter_offsets().collect::<Vec<_>>());
    }

    #[test]
    fn test_range_inclusive() {
        let view = ArrayView::contiguous(vec![5], vec![]);
        // 1-based [1:3] arrives here as 0-based [0, 2]
        let sliced = view.range(0, 0, 2).unwrap();
        assert_eq!(vec![3], sliced.dims);
        assert_eq!(vec![0, 1, 2], sliced.iter_offsets().collect::<Vec<_>>());
    }

    #[test]
    fn test_transpose_strides() {
        let view = ArrayView::contiguous(vec![2, 3], vec![]);
        let t = view.transpose();
        assert_eq!(vec![3, 2], t.dims);
        assert_eq!(vec![1, 3], t.strides);
        // [[1,2,3],[4,5,6]] transposed reads 0,3,1,4,2,5
        assert_eq!(vec![0, 3, 1, 4, 2, 5], t.iter_offsets().collect::<Vec<_>>());
        assert!(!t.is_contiguous());
    }

    #[test]
    fn test_sparse_splat() {
        let view = ArrayView::contiguous(vec![3], vec!["location".to_string()]);
        let splat = view.splat(0, vec![0, 2], "coastal".to_string()).unwrap();
        assert_eq!(vec![2], splat.dims);
        assert_eq!(vec![0, 2], splat.iter_offsets().collect::<Vec<_>>());
        assert!(!splat.is_contiguous());
    }

    #[test]
    fn test_permute() {
        let view = ArrayView::contiguous(vec![2, 3, 4], vec![]);
        let p = view.permute(&[2, 0, 1]).unwrap();
        assert_eq!(vec![4, 2, 3], p.dims);
        assert_eq!(vec![1, 12, 4], p.strides);
        assert!(view.permute(&[0, 0, 1]).is_err());
    }

    #[test]
    fn test_range_errors() {
        let view = ArrayView::contiguous(vec![5, 4], vec![]);
        assert!(view.range(2, 0, 1).is_err());
        assert!(view.range(0, 3, 2).is_err());
        assert!(view.range(0, 0, 5).is_err());
    }

    #[test]
    fn test_offset_of() {
        let view = ArrayView::contiguous(vec![2, 3], vec![]);
        assert_eq!(0, view.offset_of(&[0, 0]));
        assert_eq!(5, view.offset_of(&[1, 2]));
    }
}
