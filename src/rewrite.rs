// Copyright 2026 Strata Project Authors. Licensed under Apache-2.0.

//! Partition rewriting.
//!
//! Rebuilds one partition under a new sort/compression scheme from a buddy
//! replica holding the same rows. Per column, the cheapest sufficient path
//! is chosen: byte-for-byte copy, re-encode without reordering, or decode,
//! permute, re-encode when the sort changes.

use std::path::PathBuf;
use std::sync::Arc;

use itertools::Itertools;
use tracing::info;

use crate::bundle::{
    path_of_column_stem, path_of_data_file, path_of_dict_file, path_of_position_file,
    path_of_value_index_file, ColumnDesc, ColumnFileReader, ColumnFileWriter, CompressionKind,
    OutputGuard,
};
use crate::dict::Dictionary;
use crate::error::{StorageError, StorageResult};
use crate::merge::MergeOutput;
use crate::options::{CancelToken, ColumnWriterOptions, TransformOptions};
use crate::value::Vector;
use crate::TaskOutcome;

pub struct PartitionRewriter {
    buddy_stems: Vec<PathBuf>,
    buddy_descs: Vec<ColumnDesc>,
    target_descs: Vec<ColumnDesc>,
    old_sort: Option<usize>,
    new_sort: Option<usize>,
    dest_dir: PathBuf,
    options: TransformOptions,
}

impl PartitionRewriter {
    pub fn new(
        buddy_stems: Vec<PathBuf>,
        buddy_descs: Vec<ColumnDesc>,
        target_descs: Vec<ColumnDesc>,
        old_sort: Option<usize>,
        new_sort: Option<usize>,
        dest_dir: impl Into<PathBuf>,
        options: TransformOptions,
    ) -> Self {
        let columns = buddy_stems.len();
        assert_eq!(buddy_descs.len(), columns);
        assert_eq!(target_descs.len(), columns);
        for (buddy, target) in buddy_descs.iter().zip(&target_descs) {
            assert_eq!(
                buddy.value_type, target.value_type,
                "rewriting cannot change column value types"
            );
        }
        if let Some(sort) = old_sort {
            assert!(sort < columns, "buddy sort column {} out of range", sort);
        }
        if let Some(sort) = new_sort {
            assert!(sort < columns, "target sort column {} out of range", sort);
        }
        Self {
            buddy_stems,
            buddy_descs,
            target_descs,
            old_sort,
            new_sort,
            dest_dir: dest_dir.into(),
            options,
        }
    }

    pub async fn rewrite(self, cancel: &CancelToken) -> StorageResult<TaskOutcome<MergeOutput>> {
        tokio::fs::create_dir_all(&self.dest_dir)
            .await
            .map_err(|e| StorageError::CreateDir(self.dest_dir.display().to_string(), e))?;

        let columns = self.buddy_stems.len();
        let stems = (0..columns)
            .map(|c| path_of_column_stem(&self.dest_dir, c))
            .collect_vec();
        let mut guard = OutputGuard::new();
        for stem in &stems {
            guard.track_stem(stem);
        }

        // a changed sort column forces a reorder of every column
        let permutation = if self.old_sort == self.new_sort {
            None
        } else if let Some(new_sort) = self.new_sort {
            let reader =
                ColumnFileReader::open(&self.buddy_stems[new_sort], self.buddy_descs[new_sort])
                    .await?;
            let mut values = Vector::with_capacity(
                self.buddy_descs[new_sort].value_type,
                reader.tuple_count() as usize,
            );
            let mut cursor = reader.cursor();
            loop {
                if cancel.is_canceled() {
                    return Ok(TaskOutcome::Canceled);
                }
                if cursor.next_values(&mut values, self.options.batch_size) == 0 {
                    break;
                }
            }
            Some(values.sort_with_permutation())
        } else {
            // dropping the sort entirely keeps the physical order
            None
        };

        let mut metas = Vec::with_capacity(columns);
        for c in 0..columns {
            if cancel.is_canceled() {
                return Ok(TaskOutcome::Canceled);
            }
            let buddy = self.buddy_descs[c];
            let target = self.target_descs[c];
            let meta = if permutation.is_none() && buddy == target {
                // same sort, same compression: inherit every artifact
                self.copy_column(c, &stems[c]).await?
            } else {
                match self
                    .reencode_column(c, &stems[c], permutation.as_deref(), cancel)
                    .await?
                {
                    Some(meta) => meta,
                    None => return Ok(TaskOutcome::Canceled),
                }
            };
            metas.push(meta);
        }
        crate::bundle::sync_dir(&self.dest_dir).await?;
        guard.disarm();

        info!(
            columns = columns,
            resorted = permutation.is_some(),
            dest = %self.dest_dir.display(),
            "partition rewrite complete"
        );
        Ok(TaskOutcome::Completed(MergeOutput { stems, metas }))
    }

    /// Byte-for-byte copy of all buddy artifacts and statistics.
    async fn copy_column(
        &self,
        c: usize,
        stem: &PathBuf,
    ) -> StorageResult<crate::bundle::ColumnFileMeta> {
        let buddy_stem = &self.buddy_stems[c];
        let reader = ColumnFileReader::open(buddy_stem, self.buddy_descs[c]).await?;
        tokio::fs::copy(path_of_data_file(buddy_stem), path_of_data_file(stem)).await?;
        let mut siblings = vec![
            (path_of_dict_file(buddy_stem), path_of_dict_file(stem)),
            (path_of_position_file(buddy_stem), path_of_position_file(stem)),
        ];
        // the value index only rides on the scheme's sort column
        if self.new_sort == Some(c) {
            siblings.push((
                path_of_value_index_file(buddy_stem),
                path_of_value_index_file(stem),
            ));
        }
        for (from, to) in siblings {
            if tokio::fs::try_exists(&from).await? {
                tokio::fs::copy(from, to).await?;
            }
        }
        Ok(reader.meta().clone())
    }

    /// Returns `None` when canceled mid-column; the caller's output guard
    /// removes anything already written.
    async fn reencode_column(
        &self,
        c: usize,
        stem: &PathBuf,
        permutation: Option<&[u32]>,
        cancel: &CancelToken,
    ) -> StorageResult<Option<crate::bundle::ColumnFileMeta>> {
        let buddy = self.buddy_descs[c];
        let target = self.target_descs[c];
        let reader = ColumnFileReader::open(&self.buddy_stems[c], buddy).await?;
        let is_sort = self.new_sort == Some(c);
        let batch = self.options.batch_size;
        let writer_options = ColumnWriterOptions::from_transform_options(&self.options);

        // dictionary to dictionary: the vocabulary cannot change, so the
        // dictionary stream is inherited and only the code stream is
        // rewritten in the new order
        if buddy.compression == CompressionKind::Dictionary
            && target.compression == CompressionKind::Dictionary
        {
            let dict = reader.dictionary().unwrap().clone();
            let mut cursor = reader.cursor();
            let mut codes = Vec::with_capacity(reader.tuple_count() as usize);
            loop {
                if cancel.is_canceled() {
                    return Ok(None);
                }
                if cursor.next_codes(&mut codes, batch) == 0 {
                    break;
                }
            }
            let codes = match permutation {
                Some(perm) => perm.iter().map(|&old| codes[old as usize]).collect_vec(),
                None => codes,
            };

            let mut writer =
                ColumnFileWriter::create(stem, target, writer_options, is_sort, Some(dict))
                    .await?;
            writer.inherit_dictionary();
            for chunk in codes.chunks(batch) {
                writer.append_codes(chunk);
                writer.spill().await?;
            }
            let meta = writer.finish().await?;
            tokio::fs::copy(
                path_of_dict_file(&self.buddy_stems[c]),
                path_of_dict_file(stem),
            )
            .await?;
            return Ok(Some(meta));
        }

        // decode once, reorder if the sort changed, re-encode
        let mut values = Vector::with_capacity(buddy.value_type, reader.tuple_count() as usize);
        let mut cursor = reader.cursor();
        loop {
            if cancel.is_canceled() {
                return Ok(None);
            }
            if cursor.next_values(&mut values, batch) == 0 {
                break;
            }
        }
        let values = match permutation {
            Some(perm) => values.apply_permutation(perm),
            None => values,
        };

        let meta = if target.compression == CompressionKind::Dictionary {
            let (dict, codes) = Dictionary::build(&values);
            let mut writer =
                ColumnFileWriter::create(stem, target, writer_options, is_sort, Some(Arc::new(dict)))
                    .await?;
            for chunk in codes.chunks(batch) {
                writer.append_codes(chunk);
                writer.spill().await?;
            }
            writer.finish().await?
        } else {
            let mut writer =
                ColumnFileWriter::create(stem, target, writer_options, is_sort, None).await?;
            if is_sort {
                writer.set_distinct_count(values.distinct_in_sorted());
            } else if reader.meta().distinct_count > 0 {
                writer.set_distinct_count(reader.meta().distinct_count);
            }
            let mut row = 0;
            while row < values.len() {
                let end = (row + batch).min(values.len());
                writer.append_values(&values, row..end);
                writer.spill().await?;
                row = end;
            }
            writer.finish().await?
        };
        Ok(Some(meta))
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::value::ValueType;

    /// A buddy partition with a dictionary string column and a plain i64
    /// column, physically sorted by the i64 column.
    async fn write_buddy(dir: &Path) -> (Vec<PathBuf>, Vec<ColumnDesc>) {
        tokio::fs::create_dir_all(dir).await.unwrap();
        let descs = vec![
            ColumnDesc::new(ValueType::Utf8, CompressionKind::Dictionary),
            ColumnDesc::new(ValueType::Int64, CompressionKind::None),
        ];
        let names: Vector = vec!["delta", "bravo", "echo", "alpha", "bravo"]
            .into_iter()
            .map(str::to_string)
            .collect::<Vec<_>>()
            .into();
        let numbers: Vector = vec![10i64, 20, 30, 40, 50].into();

        let stems = vec![path_of_column_stem(dir, 0), path_of_column_stem(dir, 1)];
        let (dict, codes) = Dictionary::build(&names);
        let mut writer = ColumnFileWriter::create(
            &stems[0],
            descs[0],
            ColumnWriterOptions::default_for_test(),
            false,
            Some(Arc::new(dict)),
        )
        .await
        .unwrap();
        writer.append_codes(&codes);
        writer.finish().await.unwrap();

        let mut writer = ColumnFileWriter::create(
            &stems[1],
            descs[1],
            ColumnWriterOptions::default_for_test(),
            true,
            None,
        )
        .await
        .unwrap();
        writer.append_values(&numbers, 0..numbers.len());
        writer.finish().await.unwrap();

        (stems, descs)
    }

    fn decode_all(reader: &ColumnFileReader) -> Vector {
        let mut cursor = reader.cursor();
        let mut out = Vector::new(reader.desc().value_type);
        while cursor.next_values(&mut out, 3) > 0 {}
        out
    }

    #[tokio::test]
    async fn test_idempotent_rewrite_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let (stems, descs) = write_buddy(&dir.path().join("buddy")).await;

        let rewriter = PartitionRewriter::new(
            stems.clone(),
            descs.clone(),
            descs.clone(),
            Some(1),
            Some(1),
            dir.path().join("out"),
            TransformOptions::default_for_test(),
        );
        let output = rewriter
            .rewrite(&CancelToken::new())
            .await
            .unwrap()
            .completed()
            .unwrap();

        for (buddy_stem, out_stem) in stems.iter().zip(&output.stems) {
            let original = std::fs::read(path_of_data_file(buddy_stem)).unwrap();
            let copied = std::fs::read(path_of_data_file(out_stem)).unwrap();
            assert_eq!(original, copied);
        }
        let original_dict = std::fs::read(path_of_dict_file(&stems[0])).unwrap();
        let copied_dict = std::fs::read(path_of_dict_file(&output.stems[0])).unwrap();
        assert_eq!(original_dict, copied_dict);
        assert_eq!(output.metas[0].tuple_count, 5);
    }

    #[tokio::test]
    async fn test_resort_inherits_dictionary() {
        let dir = tempfile::tempdir().unwrap();
        let (stems, descs) = write_buddy(&dir.path().join("buddy")).await;

        // re-sort by the string column instead of the i64 column
        let rewriter = PartitionRewriter::new(
            stems.clone(),
            descs.clone(),
            descs.clone(),
            Some(1),
            Some(0),
            dir.path().join("out"),
            TransformOptions::default_for_test(),
        );
        let output = rewriter
            .rewrite(&CancelToken::new())
            .await
            .unwrap()
            .completed()
            .unwrap();

        // vocabulary unchanged: the dictionary stream is inherited verbatim
        let original_dict = std::fs::read(path_of_dict_file(&stems[0])).unwrap();
        let inherited_dict = std::fs::read(path_of_dict_file(&output.stems[0])).unwrap();
        assert_eq!(original_dict, inherited_dict);

        let names = ColumnFileReader::open(&output.stems[0], descs[0]).await.unwrap();
        let numbers = ColumnFileReader::open(&output.stems[1], descs[1]).await.unwrap();
        let names = decode_all(&names);
        let numbers = decode_all(&numbers);
        assert!(names.is_sorted_ascending());
        assert_eq!(
            names,
            vec!["alpha", "bravo", "bravo", "delta", "echo"]
                .into_iter()
                .map(str::to_string)
                .collect::<Vec<_>>()
                .into()
        );
        // stable sort: the two bravo rows keep their old relative order
        assert_eq!(numbers, vec![40i64, 20, 50, 10, 30].into());
    }

    #[tokio::test]
    async fn test_recompress_without_reorder() {
        let dir = tempfile::tempdir().unwrap();
        let (stems, descs) = write_buddy(&dir.path().join("buddy")).await;

        let targets = vec![
            descs[0],
            ColumnDesc::new(ValueType::Int64, CompressionKind::RunLength),
        ];
        let rewriter = PartitionRewriter::new(
            stems,
            descs,
            targets.clone(),
            Some(1),
            Some(1),
            dir.path().join("out"),
            TransformOptions::default_for_test(),
        );
        let output = rewriter
            .rewrite(&CancelToken::new())
            .await
            .unwrap()
            .completed()
            .unwrap();

        assert_eq!(output.metas[1].compression, CompressionKind::RunLength);
        let reader = ColumnFileReader::open(&output.stems[1], targets[1]).await.unwrap();
        assert_eq!(decode_all(&reader), vec![10i64, 20, 30, 40, 50].into());
    }

    #[tokio::test]
    #[should_panic(expected = "target sort column")]
    async fn test_sort_column_out_of_range_is_a_defect() {
        let _ = PartitionRewriter::new(
            vec![PathBuf::from("0")],
            vec![ColumnDesc::new(ValueType::Int32, CompressionKind::None)],
            vec![ColumnDesc::new(ValueType::Int32, CompressionKind::None)],
            None,
            Some(7),
            "out",
            TransformOptions::default_for_test(),
        );
    }
}
