// Copyright 2026 Strata Project Authors. Licensed under Apache-2.0.

use std::path::PathBuf;
use std::sync::Arc;

use itertools::Itertools;
use tracing::info;

use super::{total_tuples, validate_grid, MergeOutput};
use crate::bundle::{
    path_of_column_stem, ColumnFileReader, ColumnFileWriter, CompressionKind, OutputGuard,
};
use crate::dict::Dictionary;
use crate::error::{StorageError, StorageResult};
use crate::options::{CancelToken, ColumnWriterOptions, TransformOptions};
use crate::value::Vector;
use crate::TaskOutcome;

/// Combines N partitions with heterogeneous encodings.
///
/// Every source column is decoded fully into one in-memory vector per
/// column; there is no shared order to exploit, so a merge-sort would buy
/// nothing. If a sort column is designated, a stable key sort of that
/// column yields a permutation applied to every other column.
pub struct GeneralMerger {
    sources: Vec<Vec<ColumnFileReader>>,
    sort_column: Option<usize>,
    options: TransformOptions,
}

impl GeneralMerger {
    pub fn new(
        sources: Vec<Vec<ColumnFileReader>>,
        sort_column: Option<usize>,
        options: TransformOptions,
    ) -> Self {
        if let Some(sort_column) = sort_column {
            assert!(
                sort_column < sources[0].len(),
                "sort column {} out of range",
                sort_column
            );
        }
        Self {
            sources,
            sort_column,
            options,
        }
    }

    /// Decode and (optionally) sort, returning the merged columns as typed
    /// arrays for direct consumption.
    pub async fn merge_in_memory(
        self,
        cancel: &CancelToken,
    ) -> StorageResult<TaskOutcome<Vec<Vector>>> {
        let sort_column = self.sort_column;
        let columns = match self.decode_sources(cancel).await? {
            TaskOutcome::Completed(columns) => columns,
            TaskOutcome::Canceled => return Ok(TaskOutcome::Canceled),
        };
        Ok(TaskOutcome::Completed(sort_columns(columns, sort_column)))
    }

    /// Decode, sort, and persist new column-file bundles re-compressed to
    /// `target` compression kinds (one per column).
    pub async fn merge_to_disk(
        self,
        dest_dir: impl Into<PathBuf>,
        target: &[CompressionKind],
        cancel: &CancelToken,
    ) -> StorageResult<TaskOutcome<MergeOutput>> {
        let dest_dir = dest_dir.into();
        let sort_column = self.sort_column;
        let options = self.options.clone();
        assert_eq!(
            target.len(),
            self.sources[0].len(),
            "one target compression per column"
        );

        let columns = match self.decode_sources(cancel).await? {
            TaskOutcome::Completed(columns) => columns,
            TaskOutcome::Canceled => return Ok(TaskOutcome::Canceled),
        };
        let columns = sort_columns(columns, sort_column);

        tokio::fs::create_dir_all(&dest_dir)
            .await
            .map_err(|e| StorageError::CreateDir(dest_dir.display().to_string(), e))?;
        let mut guard = OutputGuard::new();
        let stems = (0..columns.len())
            .map(|c| path_of_column_stem(&dest_dir, c))
            .collect_vec();
        for stem in &stems {
            guard.track_stem(stem);
        }

        let batch = options.batch_size;
        let mut metas = Vec::with_capacity(columns.len());
        for (c, values) in columns.iter().enumerate() {
            if cancel.is_canceled() {
                return Ok(TaskOutcome::Canceled);
            }
            let desc = crate::bundle::ColumnDesc::new(values.value_type(), target[c]);
            let is_sort = sort_column == Some(c);
            let writer_options = ColumnWriterOptions::from_transform_options(&options);
            let meta = if target[c] == CompressionKind::Dictionary {
                let (dict, codes) = Dictionary::build(values);
                let mut writer = ColumnFileWriter::create(
                    &stems[c],
                    desc,
                    writer_options,
                    is_sort,
                    Some(Arc::new(dict)),
                )
                .await?;
                for chunk in codes.chunks(batch) {
                    if cancel.is_canceled() {
                        return Ok(TaskOutcome::Canceled);
                    }
                    writer.append_codes(chunk);
                    writer.spill().await?;
                }
                writer.finish().await?
            } else {
                let mut writer =
                    ColumnFileWriter::create(&stems[c], desc, writer_options, is_sort, None)
                        .await?;
                if is_sort {
                    // the sort column is already sorted, so the distinct
                    // count falls out of run boundaries without building a
                    // dictionary
                    writer.set_distinct_count(values.distinct_in_sorted());
                }
                let mut row = 0;
                while row < values.len() {
                    if cancel.is_canceled() {
                        return Ok(TaskOutcome::Canceled);
                    }
                    let end = (row + batch).min(values.len());
                    writer.append_values(values, row..end);
                    writer.spill().await?;
                    row = end;
                }
                writer.finish().await?
            };
            metas.push(meta);
        }
        crate::bundle::sync_dir(&dest_dir).await?;
        guard.disarm();

        info!(
            tuples = metas[0].tuple_count,
            dest = %dest_dir.display(),
            "general merge complete"
        );
        Ok(TaskOutcome::Completed(MergeOutput { stems, metas }))
    }

    /// Decode every source column fully into one destination vector per
    /// column, appending source-by-source.
    async fn decode_sources(self, cancel: &CancelToken) -> StorageResult<TaskOutcome<Vec<Vector>>> {
        let descs = validate_grid(&self.sources, false)?;
        let total = total_tuples(&self.sources)? as usize;
        let batch = self.options.batch_size;

        let mut columns = descs
            .iter()
            .map(|desc| Vector::with_capacity(desc.value_type, total))
            .collect_vec();
        for source in &self.sources {
            for (c, reader) in source.iter().enumerate() {
                let mut cursor = reader.cursor();
                loop {
                    if cancel.is_canceled() {
                        return Ok(TaskOutcome::Canceled);
                    }
                    if cursor.next_values(&mut columns[c], batch) == 0 {
                        break;
                    }
                }
            }
        }
        Ok(TaskOutcome::Completed(columns))
    }
}

fn sort_columns(columns: Vec<Vector>, sort_column: Option<usize>) -> Vec<Vector> {
    let Some(sort_column) = sort_column else {
        return columns;
    };
    let perm = columns[sort_column].sort_with_permutation();
    columns
        .into_iter()
        .map(|column| column.apply_permutation(&perm))
        .collect_vec()
}
