// Copyright 2026 Strata Project Authors. Licensed under Apache-2.0.

//! Recursive repartitioning.
//!
//! Re-buckets rows into a target partitioning scheme while keeping the
//! number of simultaneously open writer sets bounded by the fan-out limit.
//! Each pass groups its partition span into at most `max_fanout` fragments,
//! streams every source row into its fragment's writer set, then reprocesses
//! any fragment still spanning more than one partition with the narrowed
//! range. Open files and writer buffers stay O(fan-out) regardless of the
//! total partition count, at the cost of one re-scan per recursion level.

mod text;

use std::collections::VecDeque;
use std::path::PathBuf;

use itertools::Itertools;
pub use text::*;
use tracing::{debug, info};

use crate::bundle::{
    path_of_column_stem, path_of_data_file, path_of_position_file, ColumnDesc, ColumnFileReader,
    ColumnFileWriter, CompressionKind, OutputGuard,
};
use crate::error::{StorageError, StorageResult};
use crate::merge::MergeOutput;
use crate::options::{CancelToken, ColumnWriterOptions, TransformOptions};
use crate::range::RangeSet;
use crate::summary::{ColumnFileDescriptor, Summary};
use crate::value::Vector;
use crate::TaskOutcome;

/// A recursion this deep means the fan-out bound failed to shrink the span;
/// with fan-out >= 2 the depth is logarithmic in the partition count.
const MAX_RECURSION_DEPTH: usize = 64;

pub struct Repartitioner {
    ranges: RangeSet,
    partition_column: usize,
    max_fanout: usize,
    options: TransformOptions,
}

/// Final per-partition file sets. Intermediate fragment files are deleted
/// once the pass that read them completes.
pub struct RepartitionOutput {
    pub partitions: Vec<Option<MergeOutput>>,
}

impl RepartitionOutput {
    /// Manifest for the scheduler: one descriptor array per target
    /// partition (with stems relative to `root`), or the empty sentinel.
    pub fn to_summary(&self, root: &std::path::Path) -> Summary {
        Summary {
            partitions: self
                .partitions
                .iter()
                .map(|partition| {
                    partition.as_ref().map(|files| {
                        files
                            .stems
                            .iter()
                            .zip(&files.metas)
                            .map(|(stem, meta)| ColumnFileDescriptor {
                                stem: stem
                                    .strip_prefix(root)
                                    .unwrap_or(stem)
                                    .display()
                                    .to_string(),
                                tuple_count: meta.tuple_count,
                                compression: meta.compression,
                            })
                            .collect()
                    })
                })
                .collect(),
        }
    }
}

struct PendingPass {
    folder: PathBuf,
    stems: Vec<PathBuf>,
    range_start: usize,
    range_count: usize,
    depth: usize,
}

impl Repartitioner {
    pub fn new(
        ranges: RangeSet,
        partition_column: usize,
        max_fanout: usize,
        options: TransformOptions,
    ) -> Self {
        assert!(max_fanout >= 1, "fan-out bound must be positive");
        Self {
            ranges,
            partition_column,
            max_fanout,
            options,
        }
    }

    pub async fn repartition(
        self,
        sources: Vec<Vec<ColumnFileReader>>,
        work_dir: impl Into<PathBuf>,
        cancel: &CancelToken,
    ) -> StorageResult<TaskOutcome<RepartitionOutput>> {
        let work_dir = work_dir.into();
        let descs = crate::merge::validate_grid(&sources, false)?;
        assert!(
            self.partition_column < descs.len(),
            "partition column {} out of range",
            self.partition_column
        );
        // fragment and leaf files are written plain; the final scheme is
        // applied by the merger that consumes them
        let plain_descs = descs
            .iter()
            .map(|d| ColumnDesc::new(d.value_type, CompressionKind::None))
            .collect_vec();

        tokio::fs::create_dir_all(&work_dir)
            .await
            .map_err(|e| StorageError::CreateDir(work_dir.display().to_string(), e))?;

        let mut output = RepartitionOutput {
            partitions: (0..self.ranges.len()).map(|_| None).collect(),
        };
        let mut guard = OutputGuard::new();
        let mut worklist = VecDeque::new();

        let children = match self
            .process_pass(
                sources,
                &work_dir,
                0,
                self.ranges.len(),
                0,
                &plain_descs,
                &mut output,
                &mut guard,
                cancel,
            )
            .await?
        {
            Some(children) => children,
            None => return Ok(TaskOutcome::Canceled),
        };
        worklist.extend(children);

        while let Some(pass) = worklist.pop_front() {
            assert!(
                pass.depth < MAX_RECURSION_DEPTH,
                "repartition recursion failed to converge"
            );
            let mut readers = Vec::with_capacity(plain_descs.len());
            for (c, desc) in plain_descs.iter().enumerate() {
                readers.push(ColumnFileReader::open(&pass.stems[c], *desc).await?);
            }
            debug!(
                folder = %pass.folder.display(),
                range_start = pass.range_start,
                range_count = pass.range_count,
                depth = pass.depth,
                "recursing into fragment"
            );
            let children = match self
                .process_pass(
                    vec![readers],
                    &pass.folder,
                    pass.range_start,
                    pass.range_count,
                    pass.depth,
                    &plain_descs,
                    &mut output,
                    &mut guard,
                    cancel,
                )
                .await?
            {
                Some(children) => children,
                None => return Ok(TaskOutcome::Canceled),
            };
            // the fragment's intermediate files were fully consumed
            for stem in &pass.stems {
                let _ = tokio::fs::remove_file(path_of_data_file(stem)).await;
                let _ = tokio::fs::remove_file(path_of_position_file(stem)).await;
            }
            worklist.extend(children);
        }

        guard.disarm();
        info!(
            partitions = output.partitions.iter().filter(|p| p.is_some()).count(),
            "repartition complete"
        );
        Ok(TaskOutcome::Completed(output))
    }

    /// One scanning/finalizing pass over `sources`, fanning rows out into at
    /// most `max_fanout` fragments of the span `[range_start, range_start +
    /// range_count)`. Returns the passes still needed for multi-partition
    /// fragments, or `None` when canceled.
    #[allow(clippy::too_many_arguments)]
    async fn process_pass(
        &self,
        sources: Vec<Vec<ColumnFileReader>>,
        folder: &PathBuf,
        range_start: usize,
        range_count: usize,
        depth: usize,
        plain_descs: &[ColumnDesc],
        output: &mut RepartitionOutput,
        guard: &mut OutputGuard,
        cancel: &CancelToken,
    ) -> StorageResult<Option<Vec<PendingPass>>> {
        let columns = plain_descs.len();
        let per_fragment = range_count.div_ceil(self.max_fanout);
        let fragments = range_count.div_ceil(per_fragment);
        assert!(fragments <= self.max_fanout);

        let mut writer_sets: Vec<Option<Vec<ColumnFileWriter>>> =
            (0..fragments).map(|_| None).collect();
        let mut fragment_stems: Vec<Option<Vec<PathBuf>>> = vec![None; fragments];

        let batch = self.options.batch_size;
        let mut scratch = plain_descs
            .iter()
            .map(|d| Vector::new(d.value_type))
            .collect_vec();

        for source in &sources {
            let mut cursors = source.iter().map(|r| r.cursor()).collect_vec();
            loop {
                if cancel.is_canceled() {
                    return Ok(None);
                }
                for column in scratch.iter_mut() {
                    column.clear();
                }
                let got = cursors[0].next_values(&mut scratch[0], batch);
                for (c, cursor) in cursors.iter_mut().enumerate().skip(1) {
                    let aligned = cursor.next_values(&mut scratch[c], batch);
                    assert_eq!(aligned, got, "column streams out of alignment");
                }
                if got == 0 {
                    break;
                }

                for row in 0..got {
                    let partition = self.ranges.find_partition_in(
                        &scratch[self.partition_column],
                        row,
                        range_start,
                        range_count,
                    );
                    let fragment = (partition - range_start) / per_fragment;
                    if writer_sets[fragment].is_none() {
                        let first_partition = range_start + fragment * per_fragment;
                        let fragment_dir = folder.join(format!("frag_{}", first_partition));
                        tokio::fs::create_dir_all(&fragment_dir).await.map_err(|e| {
                            StorageError::CreateDir(fragment_dir.display().to_string(), e)
                        })?;
                        let mut writers = Vec::with_capacity(columns);
                        let mut stems = Vec::with_capacity(columns);
                        for (c, desc) in plain_descs.iter().enumerate() {
                            let stem = path_of_column_stem(&fragment_dir, c);
                            guard.track_stem(&stem);
                            writers.push(
                                ColumnFileWriter::create(
                                    &stem,
                                    *desc,
                                    ColumnWriterOptions::from_transform_options(&self.options),
                                    false,
                                    None,
                                )
                                .await?,
                            );
                            stems.push(stem);
                        }
                        writer_sets[fragment] = Some(writers);
                        fragment_stems[fragment] = Some(stems);
                    }
                    let writers = writer_sets[fragment].as_mut().unwrap();
                    for (c, writer) in writers.iter_mut().enumerate() {
                        writer.append_values(&scratch[c], row..row + 1);
                    }
                }

                for writers in writer_sets.iter_mut().flatten() {
                    for writer in writers.iter_mut() {
                        writer.spill().await?;
                    }
                }
            }
        }

        // finalize: close every fragment writer set, then either register a
        // leaf partition or queue a deeper pass
        let mut children = vec![];
        for (fragment, writers) in writer_sets.into_iter().enumerate() {
            let Some(writers) = writers else { continue };
            let stems = fragment_stems[fragment].take().unwrap();
            let mut metas = Vec::with_capacity(columns);
            for writer in writers {
                metas.push(writer.finish().await?);
            }

            let first_partition = range_start + fragment * per_fragment;
            let span = per_fragment.min(range_count - fragment * per_fragment);
            if span == 1 {
                output.partitions[first_partition] = Some(MergeOutput { stems, metas });
            } else {
                children.push(PendingPass {
                    folder: folder.join(format!("frag_{}", first_partition)),
                    stems,
                    range_start: first_partition,
                    range_count: span,
                    depth: depth + 1,
                });
            }
        }
        Ok(Some(children))
    }
}
