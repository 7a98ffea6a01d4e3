// Copyright 2026 Strata Project Authors. Licensed under Apache-2.0.

use std::cmp::Ordering;

use bytes::Buf;

use super::{NativeType, ValueType, F64};

/// Decoded values of one column.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Vector {
    Int32(Vec<i32>),
    Int64(Vec<i64>),
    Float64(Vec<F64>),
    Utf8(Vec<String>),
    Blob(Vec<Vec<u8>>),
}

/// Dispatches `$body` over the concrete element vector of one [`Vector`].
macro_rules! dispatch {
    ($vector:expr, $inner:ident => $body:expr) => {
        match $vector {
            Vector::Int32($inner) => $body,
            Vector::Int64($inner) => $body,
            Vector::Float64($inner) => $body,
            Vector::Utf8($inner) => $body,
            Vector::Blob($inner) => $body,
        }
    };
}

/// Dispatches `$body` over two [`Vector`]s of the same value type.
macro_rules! dispatch2 {
    ($left:expr, $right:expr, $x:ident, $y:ident => $body:expr) => {
        match ($left, $right) {
            (Vector::Int32($x), Vector::Int32($y)) => $body,
            (Vector::Int64($x), Vector::Int64($y)) => $body,
            (Vector::Float64($x), Vector::Float64($y)) => $body,
            (Vector::Utf8($x), Vector::Utf8($y)) => $body,
            (Vector::Blob($x), Vector::Blob($y)) => $body,
            _ => panic!("value type mismatch between vectors"),
        }
    };
}

impl Vector {
    pub fn new(value_type: ValueType) -> Self {
        Self::with_capacity(value_type, 0)
    }

    pub fn with_capacity(value_type: ValueType, capacity: usize) -> Self {
        match value_type {
            ValueType::Int32 => Vector::Int32(Vec::with_capacity(capacity)),
            ValueType::Int64 => Vector::Int64(Vec::with_capacity(capacity)),
            ValueType::Float64 => Vector::Float64(Vec::with_capacity(capacity)),
            ValueType::Utf8 => Vector::Utf8(Vec::with_capacity(capacity)),
            ValueType::Blob => Vector::Blob(Vec::with_capacity(capacity)),
        }
    }

    pub fn value_type(&self) -> ValueType {
        match self {
            Vector::Int32(_) => ValueType::Int32,
            Vector::Int64(_) => ValueType::Int64,
            Vector::Float64(_) => ValueType::Float64,
            Vector::Utf8(_) => ValueType::Utf8,
            Vector::Blob(_) => ValueType::Blob,
        }
    }

    pub fn len(&self) -> usize {
        dispatch!(self, xs => xs.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        dispatch!(self, xs => xs.clear())
    }

    /// Append one row cloned from `other`.
    pub fn push_from(&mut self, other: &Vector, idx: usize) {
        dispatch2!(self, other, xs, ys => xs.push(ys[idx].clone()))
    }

    /// Append all rows of `other`.
    pub fn append(&mut self, other: &Vector) {
        dispatch2!(self, other, xs, ys => xs.extend_from_slice(ys))
    }

    pub fn cmp_rows(&self, idx: usize, other: &Vector, other_idx: usize) -> Ordering {
        dispatch2!(self, other, xs, ys => xs[idx].cmp(&ys[other_idx]))
    }

    pub fn encode_row(&self, idx: usize, buf: &mut Vec<u8>) {
        dispatch!(self, xs => xs[idx].encode(buf))
    }

    pub fn encoded_row_len(&self, idx: usize) -> usize {
        dispatch!(self, xs => xs[idx].encoded_len())
    }

    pub fn decode_push(&mut self, buf: &mut impl Buf) {
        dispatch!(self, xs => xs.push(NativeType::decode(buf)))
    }

    /// Stable sort by value. Returns the permutation `perm` where
    /// `perm[new_pos]` is the old position of the row now at `new_pos`.
    pub fn sort_with_permutation(&self) -> Vec<u32> {
        dispatch!(self, xs => {
            let mut perm: Vec<u32> = (0..xs.len() as u32).collect();
            perm.sort_by(|&a, &b| xs[a as usize].cmp(&xs[b as usize]));
            perm
        })
    }

    /// Gather rows in permutation order: output row `i` is `self[perm[i]]`.
    pub fn apply_permutation(&self, perm: &[u32]) -> Vector {
        dispatch!(self, xs => {
            let mut out = Vec::with_capacity(perm.len());
            for &old in perm {
                out.push(xs[old as usize].clone());
            }
            out.into()
        })
    }

    /// Number of distinct values, assuming the vector is sorted ascending.
    pub fn distinct_in_sorted(&self) -> u32 {
        dispatch!(self, xs => {
            if xs.is_empty() {
                return 0;
            }
            let mut distinct = 1u32;
            for window in xs.windows(2) {
                if window[0] != window[1] {
                    distinct += 1;
                }
            }
            distinct
        })
    }

    /// Number of leading entries less than or equal to `probe[row]`,
    /// assuming `self` is sorted ascending.
    pub fn partition_point_le(&self, probe: &Vector, row: usize) -> usize {
        dispatch2!(self, probe, xs, ys => {
            let key = &ys[row];
            xs.partition_point(|v| v <= key)
        })
    }

    /// Verify the rows are sorted ascending. Test helper for sort invariants.
    pub fn is_sorted_ascending(&self) -> bool {
        dispatch!(self, xs => xs.windows(2).all(|w| w[0] <= w[1]))
    }
}

macro_rules! impl_from_vec {
    ($native:ty, $variant:ident) => {
        impl From<Vec<$native>> for Vector {
            fn from(values: Vec<$native>) -> Self {
                Vector::$variant(values)
            }
        }
    };
}

impl_from_vec! { i32, Int32 }
impl_from_vec! { i64, Int64 }
impl_from_vec! { F64, Float64 }
impl_from_vec! { String, Utf8 }
impl_from_vec! { Vec<u8>, Blob }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sort_with_permutation_is_stable() {
        let v: Vector = vec![3, 1, 2, 1, 3].into();
        let perm = v.sort_with_permutation();
        // equal keys keep their original relative order
        assert_eq!(perm, vec![1, 3, 2, 0, 4]);
        let sorted = v.apply_permutation(&perm);
        assert!(sorted.is_sorted_ascending());
        assert_eq!(sorted, vec![1, 1, 2, 3, 3].into());
    }

    #[test]
    fn test_distinct_in_sorted() {
        let v: Vector = vec!["a".to_string(), "a".to_string(), "b".to_string()].into();
        assert_eq!(v.distinct_in_sorted(), 2);
        let empty = Vector::new(ValueType::Int64);
        assert_eq!(empty.distinct_in_sorted(), 0);
    }

    #[test]
    fn test_encode_decode_row() {
        let v: Vector = vec!["hello".to_string(), "".to_string()].into();
        let mut buf = vec![];
        v.encode_row(0, &mut buf);
        v.encode_row(1, &mut buf);
        let mut out = Vector::new(ValueType::Utf8);
        let mut cursor = &buf[..];
        out.decode_push(&mut cursor);
        out.decode_push(&mut cursor);
        assert_eq!(v, out);
        assert!(!cursor.has_remaining());
    }
}
