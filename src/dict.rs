// Copyright 2026 Strata Project Authors. Licensed under Apache-2.0.

//! Sorted column dictionaries and the N-way dictionary merge.
//!
//! A dictionary is an ordered, duplicate-free sequence of distinct column
//! values. Codes are assigned by ascending value order, so code order is
//! value order and compressed streams stay mergeable without decoding.

use bytes::{Buf, BufMut, Bytes};

use crate::error::{StorageError, StorageResult, TracedStorageError};
use crate::value::{ValueType, Vector};

/// Result of merging the dictionaries of one column across N sources.
pub struct MergedDictionary {
    pub dictionary: Dictionary,

    /// Per source, old code to merged code. Valid only for the merge
    /// operation that produced it and never persisted.
    pub conversions: Vec<Vec<u32>>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Dictionary {
    values: Vector,
    code_width: u8,
}

impl Dictionary {
    /// Create a dictionary from values already sorted ascending with
    /// duplicates removed.
    pub fn from_sorted_values(values: Vector) -> Self {
        debug_assert!(values.is_sorted_ascending());
        let code_width = Self::fit_code_width(values.len());
        Self { values, code_width }
    }

    /// Build a dictionary from arbitrary column values, returning the code
    /// of every input row alongside it.
    pub fn build(values: &Vector) -> (Self, Vec<u32>) {
        let perm = values.sort_with_permutation();
        let mut distinct = Vector::new(values.value_type());
        let mut codes = vec![0u32; values.len()];
        for &old in &perm {
            let is_new = distinct.is_empty()
                || distinct.cmp_rows(distinct.len() - 1, values, old as usize)
                    != std::cmp::Ordering::Equal;
            if is_new {
                distinct.push_from(values, old as usize);
            }
            codes[old as usize] = (distinct.len() - 1) as u32;
        }
        (Self::from_sorted_values(distinct), codes)
    }

    /// Smallest of 1/2/4 bytes that fits `entries` distinct codes.
    pub fn fit_code_width(entries: usize) -> u8 {
        if entries <= 1 << 8 {
            1
        } else if entries <= 1 << 16 {
            2
        } else {
            4
        }
    }

    /// An unrecognized width is a fatal configuration error for the column.
    pub fn validate_code_width(width: u8) -> StorageResult<()> {
        match width {
            1 | 2 | 4 => Ok(()),
            other => Err(StorageError::CodeWidth(other).into()),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn code_width(&self) -> u8 {
        self.code_width
    }

    pub fn value_type(&self) -> ValueType {
        self.values.value_type()
    }

    pub fn values(&self) -> &Vector {
        &self.values
    }

    /// Append the value of `code` to `out`.
    pub fn push_value(&self, code: u32, out: &mut Vector) {
        out.push_from(&self.values, code as usize);
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![];
        buf.put_u32_le(self.values.len() as u32);
        buf.put_u8(self.code_width);
        for idx in 0..self.values.len() {
            self.values.encode_row(idx, &mut buf);
        }
        buf
    }

    pub fn decode(body: Bytes, value_type: ValueType) -> StorageResult<Self> {
        let mut buf = body;
        if buf.remaining() < 5 {
            return Err(TracedStorageError::decode("dictionary stream too short"));
        }
        let entries = buf.get_u32_le() as usize;
        let code_width = buf.get_u8();
        Self::validate_code_width(code_width)?;
        let mut values = Vector::with_capacity(value_type, entries);
        for _ in 0..entries {
            values.decode_push(&mut buf);
        }
        if buf.has_remaining() {
            return Err(TracedStorageError::decode(
                "trailing bytes after dictionary entries",
            ));
        }
        Ok(Self { values, code_width })
    }

    /// Merge N sorted dictionaries of one column into a single sorted
    /// dictionary, building every source's index-conversion table along the
    /// way. An N-way merge suffices because each input is already sorted
    /// and duplicate-free; the conversion entry for an old code is exactly
    /// the position its value lands at in the merged sequence.
    pub fn merge(sources: &[&Dictionary]) -> StorageResult<MergedDictionary> {
        assert!(!sources.is_empty(), "dictionary merge needs at least one source");
        for dict in sources {
            Self::validate_code_width(dict.code_width)?;
        }
        let value_type = sources[0].value_type();
        let mut heads = vec![0usize; sources.len()];
        let mut conversions: Vec<Vec<u32>> = sources
            .iter()
            .map(|d| Vec::with_capacity(d.len()))
            .collect();
        let mut merged = Vector::new(value_type);

        loop {
            let mut min_source: Option<usize> = None;
            for (idx, dict) in sources.iter().enumerate() {
                if heads[idx] >= dict.len() {
                    continue;
                }
                min_source = Some(match min_source {
                    None => idx,
                    Some(best) => {
                        let ord = sources[best]
                            .values
                            .cmp_rows(heads[best], &dict.values, heads[idx]);
                        if ord == std::cmp::Ordering::Greater {
                            idx
                        } else {
                            best
                        }
                    }
                });
            }
            let min_source = match min_source {
                Some(idx) => idx,
                None => break,
            };

            merged.push_from(&sources[min_source].values, heads[min_source]);
            let code = (merged.len() - 1) as u32;

            // every source whose head equals the minimum consumes it
            for (idx, dict) in sources.iter().enumerate() {
                if heads[idx] < dict.len()
                    && dict
                        .values
                        .cmp_rows(heads[idx], &merged, merged.len() - 1)
                        == std::cmp::Ordering::Equal
                {
                    conversions[idx].push(code);
                    heads[idx] += 1;
                }
            }
        }

        Ok(MergedDictionary {
            dictionary: Dictionary::from_sorted_values(merged),
            conversions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ValueType;

    fn dict_of(values: &[&str]) -> Dictionary {
        Dictionary::from_sorted_values(
            values.iter().map(|s| s.to_string()).collect::<Vec<_>>().into(),
        )
    }

    #[test]
    fn test_merge_builds_conversion_tables() {
        let a = dict_of(&["apple", "cherry", "plum"]);
        let b = dict_of(&["banana", "cherry"]);
        let merged = Dictionary::merge(&[&a, &b]).unwrap();

        assert_eq!(
            merged.dictionary.values(),
            &vec![
                "apple".to_string(),
                "banana".to_string(),
                "cherry".to_string(),
                "plum".to_string()
            ]
            .into()
        );
        assert_eq!(merged.conversions[0], vec![0, 2, 3]);
        assert_eq!(merged.conversions[1], vec![1, 2]);
    }

    #[test]
    fn test_merge_round_trip() {
        // decoding a merged code must reproduce the original source value
        let a = dict_of(&["ant", "bee"]);
        let b = dict_of(&["bee", "wasp"]);
        let merged = Dictionary::merge(&[&a, &b]).unwrap();
        for (src, dict) in [&a, &b].iter().enumerate() {
            for old_code in 0..dict.len() as u32 {
                let new_code = merged.conversions[src][old_code as usize];
                let mut original = Vector::new(ValueType::Utf8);
                let mut reencoded = Vector::new(ValueType::Utf8);
                dict.push_value(old_code, &mut original);
                merged.dictionary.push_value(new_code, &mut reencoded);
                assert_eq!(original, reencoded);
            }
        }
    }

    #[test]
    fn test_merged_width_grows_with_cardinality() {
        let left: Vec<i32> = (0..200).map(|x| x * 2).collect();
        let right: Vec<i32> = (0..200).map(|x| x * 2 + 1).collect();
        let a = Dictionary::from_sorted_values(left.into());
        let b = Dictionary::from_sorted_values(right.into());
        assert_eq!(a.code_width(), 1);
        let merged = Dictionary::merge(&[&a, &b]).unwrap();
        assert_eq!(merged.dictionary.len(), 400);
        assert_eq!(merged.dictionary.code_width(), 2);
    }

    #[test]
    fn test_fit_code_width() {
        assert_eq!(Dictionary::fit_code_width(0), 1);
        assert_eq!(Dictionary::fit_code_width(256), 1);
        assert_eq!(Dictionary::fit_code_width(257), 2);
        assert_eq!(Dictionary::fit_code_width(1 << 16), 2);
        assert_eq!(Dictionary::fit_code_width((1 << 16) + 1), 4);
    }

    #[test]
    fn test_invalid_width_is_fatal() {
        assert!(Dictionary::validate_code_width(3).is_err());
        assert!(Dictionary::validate_code_width(8).is_err());
    }

    #[test]
    fn test_encode_decode() {
        let (dict, codes) = Dictionary::build(&vec![5i32, 3, 5, 9, 3].into());
        assert_eq!(dict.values(), &vec![3i32, 5, 9].into());
        assert_eq!(codes, vec![1, 0, 1, 2, 0]);
        let bytes = Bytes::from(dict.encode());
        let decoded = Dictionary::decode(bytes, ValueType::Int32).unwrap();
        assert_eq!(decoded, dict);
    }
}
