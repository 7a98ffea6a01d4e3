// Copyright 2026 Strata Project Authors. Licensed under Apache-2.0.

//! Partition mergers.
//!
//! [`SameSchemeMerger`] combines partitions sharing one compression/sort
//! scheme, either by concatenation or by a k-way merge over the compressed
//! sort keys. [`GeneralMerger`] combines arbitrarily-encoded partitions by
//! decoding to memory first.

mod general;
mod same_scheme;

use std::path::PathBuf;
use std::sync::Arc;

pub use general::*;
use itertools::Itertools;
pub use same_scheme::*;

use crate::bundle::{ColumnCursor, ColumnDesc, ColumnFileMeta, ColumnFileReader, ColumnFileWriter};
use crate::error::{StorageError, StorageResult};
use crate::value::Vector;

/// Produced column files of one merged partition, in column order.
pub struct MergeOutput {
    pub stems: Vec<PathBuf>,
    pub metas: Vec<ColumnFileMeta>,
}

/// Validate an N×C grid of source columns and return the shared column
/// descriptors.
///
/// Mismatched value types (or, when `same_compression` is required,
/// mismatched compression) across sources are contract violations; a tuple
/// count differing between sibling columns of one source is malformed
/// input.
pub(crate) fn validate_grid(
    sources: &[Vec<ColumnFileReader>],
    same_compression: bool,
) -> StorageResult<Vec<ColumnDesc>> {
    assert!(!sources.is_empty(), "merge needs at least one source");
    let descs = sources[0].iter().map(|r| r.desc()).collect_vec();
    assert!(!descs.is_empty(), "merge needs at least one column");
    for source in sources {
        assert_eq!(
            source.len(),
            descs.len(),
            "all sources must share the column count"
        );
        for (reader, desc) in source.iter().zip(&descs) {
            assert_eq!(
                reader.desc().value_type,
                desc.value_type,
                "all sources must share column value types"
            );
            if same_compression {
                assert_eq!(
                    reader.desc().compression,
                    desc.compression,
                    "all sources must share column compression"
                );
            }
        }
        let tuple_count = source[0].tuple_count();
        for reader in source {
            if reader.tuple_count() != tuple_count {
                return Err(StorageError::TupleCountMismatch(
                    reader.tuple_count() as u64,
                    tuple_count as u64,
                )
                .into());
            }
        }
    }
    Ok(descs)
}

/// Sum of all source tuple counts, checked against the 31-bit limit.
pub(crate) fn total_tuples(sources: &[Vec<ColumnFileReader>]) -> StorageResult<u32> {
    let total: u64 = sources.iter().map(|s| s[0].tuple_count() as u64).sum();
    if total > i32::MAX as u64 {
        return Err(StorageError::TupleCountOverflow(total).into());
    }
    Ok(total as u32)
}

/// Moves rows from one source column into one output column through a
/// fixed-size scratch buffer, applying the dictionary index-conversion
/// table inline when the column is dictionary-compressed.
pub(crate) struct ColumnPump {
    cursor: ColumnCursor,
    conversion: Option<Arc<Vec<u32>>>,
    is_dict: bool,
    scratch_codes: Vec<u32>,
    scratch: Vector,
}

impl ColumnPump {
    pub fn new(reader: &ColumnFileReader, conversion: Option<Arc<Vec<u32>>>) -> Self {
        let is_dict = reader.dictionary().is_some();
        assert!(
            !is_dict || conversion.is_some(),
            "dictionary column needs a conversion table"
        );
        Self {
            cursor: reader.cursor(),
            conversion,
            is_dict,
            scratch_codes: vec![],
            scratch: Vector::new(reader.desc().value_type),
        }
    }

    /// Move up to `count` rows into `writer`, batched by `batch_size`.
    /// Returns the number of rows actually moved.
    pub fn pump(
        &mut self,
        writer: &mut ColumnFileWriter,
        count: usize,
        batch_size: usize,
    ) -> usize {
        let mut moved = 0;
        while moved < count {
            let take = (count - moved).min(batch_size);
            let got = if self.is_dict {
                self.scratch_codes.clear();
                let got = self.cursor.next_codes(&mut self.scratch_codes, take);
                if got > 0 {
                    let conversion = self.conversion.as_ref().unwrap();
                    for code in &mut self.scratch_codes {
                        *code = conversion[*code as usize];
                    }
                    writer.append_codes(&self.scratch_codes);
                }
                got
            } else {
                self.scratch.clear();
                let got = self.cursor.next_values(&mut self.scratch, take);
                if got > 0 {
                    writer.append_values(&self.scratch, 0..got);
                }
                got
            };
            if got == 0 {
                break;
            }
            moved += got;
        }
        moved
    }
}
