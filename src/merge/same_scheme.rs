// Copyright 2026 Strata Project Authors. Licensed under Apache-2.0.

use std::path::PathBuf;
use std::sync::Arc;

use itertools::Itertools;
use tracing::info;

use super::{total_tuples, validate_grid, ColumnPump, MergeOutput};
use crate::bundle::{
    path_of_column_stem, ColumnCursor, ColumnFileReader, ColumnFileWriter, CompressionKind,
    OutputGuard,
};
use crate::dict::Dictionary;
use crate::error::{StorageError, StorageResult};
use crate::options::{CancelToken, ColumnWriterOptions, TransformOptions};
use crate::value::{ValueType, Vector, F64};
use crate::TaskOutcome;

/// Combines N partitions sharing identical compression and sort scheme
/// into one.
///
/// Without a sort column, each output column is the source-by-source
/// concatenation of its inputs. With a sort column, the sources (each
/// already sorted) are merged k-way on the sort column's compressed
/// representation, so no tuple is ever materialized just for comparison.
pub struct SameSchemeMerger {
    sources: Vec<Vec<ColumnFileReader>>,
    sort_column: Option<usize>,
    dest_dir: PathBuf,
    options: TransformOptions,
}

impl SameSchemeMerger {
    pub fn new(
        sources: Vec<Vec<ColumnFileReader>>,
        sort_column: Option<usize>,
        dest_dir: impl Into<PathBuf>,
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
            dest_dir: dest_dir.into(),
            options,
        }
    }

    pub async fn merge(self, cancel: &CancelToken) -> StorageResult<TaskOutcome<MergeOutput>> {
        let descs = validate_grid(&self.sources, true)?;
        let total = total_tuples(&self.sources)?;
        let columns = descs.len();

        tokio::fs::create_dir_all(&self.dest_dir)
            .await
            .map_err(|e| StorageError::CreateDir(self.dest_dir.display().to_string(), e))?;

        let mut guard = OutputGuard::new();
        let stems = (0..columns)
            .map(|c| path_of_column_stem(&self.dest_dir, c))
            .collect_vec();
        for stem in &stems {
            guard.track_stem(stem);
        }

        // merge the dictionaries of every dictionary-compressed column and
        // keep each source's conversion table for the copy phase
        let mut merged_dicts: Vec<Option<Arc<Dictionary>>> = vec![None; columns];
        let mut conversions: Vec<Vec<Option<Arc<Vec<u32>>>>> =
            vec![vec![None; columns]; self.sources.len()];
        for (c, desc) in descs.iter().enumerate() {
            if desc.compression != CompressionKind::Dictionary {
                continue;
            }
            let dicts = self
                .sources
                .iter()
                .map(|s| s[c].dictionary().unwrap().as_ref())
                .collect_vec();
            let merged = Dictionary::merge(&dicts)?;
            merged_dicts[c] = Some(Arc::new(merged.dictionary));
            for (s, table) in merged.conversions.into_iter().enumerate() {
                conversions[s][c] = Some(Arc::new(table));
            }
        }

        let mut writers = Vec::with_capacity(columns);
        for (c, desc) in descs.iter().enumerate() {
            writers.push(
                ColumnFileWriter::create(
                    &stems[c],
                    *desc,
                    ColumnWriterOptions::from_transform_options(&self.options),
                    self.sort_column == Some(c),
                    merged_dicts[c].clone(),
                )
                .await?,
            );
        }

        let completed = match self.sort_column {
            None => {
                self.merge_unsorted(&mut writers, &conversions, cancel)
                    .await?
            }
            Some(sort_column) => {
                let sort_desc = descs[sort_column];
                let mut feeds = Vec::with_capacity(self.sources.len());
                let mut pumps = Vec::with_capacity(self.sources.len());
                for (s, source) in self.sources.iter().enumerate() {
                    feeds.push(KeyFeedInput {
                        cursor: source[sort_column].cursor(),
                        conversion: conversions[s][sort_column].clone(),
                    });
                    pumps.push(
                        source
                            .iter()
                            .enumerate()
                            .map(|(c, reader)| ColumnPump::new(reader, conversions[s][c].clone()))
                            .collect_vec(),
                    );
                }
                let batch = self.options.batch_size;
                match (sort_desc.compression, sort_desc.value_type) {
                    (CompressionKind::Dictionary, _) => {
                        merge_sorted::<u32>(feeds, &mut pumps, &mut writers, batch, cancel).await?
                    }
                    (_, ValueType::Int32) => {
                        merge_sorted::<i32>(feeds, &mut pumps, &mut writers, batch, cancel).await?
                    }
                    (_, ValueType::Int64) => {
                        merge_sorted::<i64>(feeds, &mut pumps, &mut writers, batch, cancel).await?
                    }
                    (_, ValueType::Float64) => {
                        merge_sorted::<F64>(feeds, &mut pumps, &mut writers, batch, cancel).await?
                    }
                    (_, ValueType::Utf8) => {
                        merge_sorted::<String>(feeds, &mut pumps, &mut writers, batch, cancel)
                            .await?
                    }
                    (_, ValueType::Blob) => {
                        merge_sorted::<Vec<u8>>(feeds, &mut pumps, &mut writers, batch, cancel)
                            .await?
                    }
                }
            }
        };
        if !completed {
            return Ok(TaskOutcome::Canceled);
        }

        let mut metas = Vec::with_capacity(columns);
        for writer in writers {
            let meta = writer.finish().await?;
            assert_eq!(meta.tuple_count, total, "merged tuple count drifted");
            metas.push(meta);
        }
        crate::bundle::sync_dir(&self.dest_dir).await?;
        guard.disarm();

        info!(
            sources = self.sources.len(),
            tuples = total,
            dest = %self.dest_dir.display(),
            "same-scheme merge complete"
        );
        Ok(TaskOutcome::Completed(MergeOutput { stems, metas }))
    }

    /// Copy every column source-by-source in order, converting dictionary
    /// codes inline. Returns `false` when canceled.
    async fn merge_unsorted(
        &self,
        writers: &mut [ColumnFileWriter],
        conversions: &[Vec<Option<Arc<Vec<u32>>>>],
        cancel: &CancelToken,
    ) -> StorageResult<bool> {
        let batch = self.options.batch_size;
        for (c, writer) in writers.iter_mut().enumerate() {
            for (s, source) in self.sources.iter().enumerate() {
                let mut pump = ColumnPump::new(&source[c], conversions[s][c].clone());
                loop {
                    if cancel.is_canceled() {
                        return Ok(false);
                    }
                    if pump.pump(writer, batch, batch) == 0 {
                        break;
                    }
                    writer.spill().await?;
                }
            }
        }
        Ok(true)
    }
}

/// Sort-key extraction from a column's compressed representation. One
/// implementation per concrete key type keeps the merge loop monomorphic:
/// dictionary columns compare converted codes, everything else compares
/// native values.
trait MergeKey: Ord + Clone {
    fn fill(
        cursor: &mut ColumnCursor,
        conversion: Option<&[u32]>,
        out: &mut Vec<Self>,
        max: usize,
    ) -> usize;
}

impl MergeKey for u32 {
    fn fill(
        cursor: &mut ColumnCursor,
        conversion: Option<&[u32]>,
        out: &mut Vec<Self>,
        max: usize,
    ) -> usize {
        let got = cursor.next_codes(out, max);
        if let Some(conversion) = conversion {
            let start = out.len() - got;
            for code in &mut out[start..] {
                *code = conversion[*code as usize];
            }
        }
        got
    }
}

macro_rules! impl_merge_key {
    ($native:ty, $value_type:ident, $variant:ident) => {
        impl MergeKey for $native {
            fn fill(
                cursor: &mut ColumnCursor,
                _conversion: Option<&[u32]>,
                out: &mut Vec<Self>,
                max: usize,
            ) -> usize {
                let mut scratch = Vector::new(ValueType::$value_type);
                let got = cursor.next_values(&mut scratch, max);
                match scratch {
                    Vector::$variant(values) => out.extend(values),
                    _ => unreachable!(),
                }
                got
            }
        }
    };
}

impl_merge_key! { i32, Int32, Int32 }
impl_merge_key! { i64, Int64, Int64 }
impl_merge_key! { F64, Float64, Float64 }
impl_merge_key! { String, Utf8, Utf8 }
impl_merge_key! { Vec<u8>, Blob, Blob }

struct KeyFeedInput {
    cursor: ColumnCursor,
    conversion: Option<Arc<Vec<u32>>>,
}

struct KeyFeed<K> {
    cursor: ColumnCursor,
    conversion: Option<Arc<Vec<u32>>>,
    buffer: Vec<K>,
    pos: usize,
    finished: bool,
}

impl<K: MergeKey> KeyFeed<K> {
    fn new(input: KeyFeedInput) -> Self {
        Self {
            cursor: input.cursor,
            conversion: input.conversion,
            buffer: vec![],
            pos: 0,
            finished: false,
        }
    }

    fn refill(&mut self, batch: usize) {
        self.buffer.clear();
        self.pos = 0;
        let got = K::fill(
            &mut self.cursor,
            self.conversion.as_deref().map(|c| c.as_slice()),
            &mut self.buffer,
            batch,
        );
        if got == 0 {
            self.finished = true;
        }
    }

    fn current(&self) -> Option<&K> {
        self.buffer.get(self.pos)
    }
}

/// The k-way merge over buffered sort keys.
///
/// Each step finds the minimum current key across all non-exhausted
/// sources, consumes every leading buffered tuple equal to it (ties are
/// taken together, source order preserved), and emits that many tuples from
/// every matching source for every column. Fully-consumed key buffers are
/// refilled from the sort column's compressed stream. Returns `false` when
/// canceled.
async fn merge_sorted<K: MergeKey>(
    feeds: Vec<KeyFeedInput>,
    pumps: &mut [Vec<ColumnPump>],
    writers: &mut [ColumnFileWriter],
    batch: usize,
    cancel: &CancelToken,
) -> StorageResult<bool> {
    let mut feeds = feeds.into_iter().map(KeyFeed::<K>::new).collect_vec();

    loop {
        if cancel.is_canceled() {
            return Ok(false);
        }
        for feed in &mut feeds {
            if !feed.finished && feed.pos == feed.buffer.len() {
                feed.refill(batch);
            }
        }

        let mut min_key: Option<K> = None;
        for feed in &feeds {
            if let Some(key) = feed.current() {
                match &min_key {
                    Some(best) if key >= best => {}
                    _ => min_key = Some(key.clone()),
                }
            }
        }
        let min_key = match min_key {
            Some(key) => key,
            None => break,
        };

        for (s, feed) in feeds.iter_mut().enumerate() {
            let mut count = 0;
            while feed.pos + count < feed.buffer.len() && feed.buffer[feed.pos + count] == min_key {
                count += 1;
            }
            if count == 0 {
                continue;
            }
            feed.pos += count;
            for (c, pump) in pumps[s].iter_mut().enumerate() {
                let moved = pump.pump(&mut writers[c], count, batch);
                assert_eq!(moved, count, "sort key and data streams out of sync");
            }
        }

        for writer in writers.iter_mut() {
            writer.spill().await?;
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::path::Path;

    use super::*;
    use crate::bundle::ColumnDesc;

    async fn write_source(
        base: &Path,
        columns: &[(ColumnDesc, Vector)],
    ) -> Vec<ColumnFileReader> {
        tokio::fs::create_dir_all(base).await.unwrap();
        let mut readers = vec![];
        for (c, (desc, values)) in columns.iter().enumerate() {
            let stem = path_of_column_stem(base, c);
            if desc.compression == CompressionKind::Dictionary {
                let (dict, codes) = Dictionary::build(values);
                let mut writer = ColumnFileWriter::create(
                    &stem,
                    *desc,
                    ColumnWriterOptions::default_for_test(),
                    false,
                    Some(Arc::new(dict)),
                )
                .await
                .unwrap();
                writer.append_codes(&codes);
                writer.finish().await.unwrap();
            } else {
                let mut writer = ColumnFileWriter::create(
                    &stem,
                    *desc,
                    ColumnWriterOptions::default_for_test(),
                    false,
                    None,
                )
                .await
                .unwrap();
                writer.append_values(values, 0..values.len());
                writer.finish().await.unwrap();
            }
            readers.push(ColumnFileReader::open(&stem, *desc).await.unwrap());
        }
        readers
    }

    fn decode_all(reader: &ColumnFileReader) -> Vector {
        let mut cursor = reader.cursor();
        let mut out = Vector::new(reader.desc().value_type);
        while cursor.next_values(&mut out, 13) > 0 {}
        out
    }

    /// `count` sorted keys with a payload derived from each key, so row
    /// alignment survives any reordering check.
    fn keyed_rows(count: usize, salt: usize) -> (Vec<String>, Vec<i64>) {
        let mut keys: Vec<String> = (0..count)
            .map(|i| format!("w{:03}", (i * salt + 7) % 50))
            .collect();
        keys.sort();
        let payloads = keys.iter().map(|k| payload_of(k)).collect();
        (keys, payloads)
    }

    fn payload_of(key: &str) -> i64 {
        key[1..].parse::<i64>().unwrap() * 10
    }

    #[tokio::test]
    async fn test_sorted_merge_of_two_dictionary_partitions() {
        let dir = tempfile::tempdir().unwrap();
        let key_desc = ColumnDesc::new(ValueType::Utf8, CompressionKind::Dictionary);
        let payload_desc = ColumnDesc::new(ValueType::Int64, CompressionKind::None);

        let (keys_a, payloads_a) = keyed_rows(45, 3);
        let (keys_b, payloads_b) = keyed_rows(24, 11);
        let distinct: HashSet<String> = keys_a.iter().chain(&keys_b).cloned().collect();

        let source_a = write_source(
            &dir.path().join("a"),
            &[
                (key_desc, keys_a.clone().into()),
                (payload_desc, payloads_a.into()),
            ],
        )
        .await;
        let source_b = write_source(
            &dir.path().join("b"),
            &[
                (key_desc, keys_b.clone().into()),
                (payload_desc, payloads_b.into()),
            ],
        )
        .await;

        let merger = SameSchemeMerger::new(
            vec![source_a, source_b],
            Some(0),
            dir.path().join("out"),
            TransformOptions::default_for_test(),
        );
        let output = match merger.merge(&CancelToken::new()).await.unwrap() {
            TaskOutcome::Completed(output) => output,
            TaskOutcome::Canceled => panic!("not canceled"),
        };

        assert_eq!(output.metas[0].tuple_count, 69);
        assert_eq!(output.metas[1].tuple_count, 69);
        assert_eq!(output.metas[0].distinct_count, distinct.len() as u32);

        let key_reader = ColumnFileReader::open(&output.stems[0], key_desc)
            .await
            .unwrap();
        let payload_reader = ColumnFileReader::open(&output.stems[1], payload_desc)
            .await
            .unwrap();
        let keys = decode_all(&key_reader);
        let payloads = decode_all(&payload_reader);
        assert!(keys.is_sorted_ascending());

        // the merge of two sorted runs is the globally sorted multiset
        let mut expected: Vec<String> = keys_a.into_iter().chain(keys_b).collect();
        expected.sort();
        assert_eq!(keys, expected.clone().into());

        // every payload still rides next to its key
        let (Vector::Utf8(keys), Vector::Int64(payloads)) = (&keys, &payloads) else {
            unreachable!()
        };
        for (key, payload) in keys.iter().zip(payloads) {
            assert_eq!(*payload, payload_of(key));
        }
    }

    #[tokio::test]
    async fn test_unsorted_merge_concatenates_in_source_order() {
        let dir = tempfile::tempdir().unwrap();
        let key_desc = ColumnDesc::new(ValueType::Utf8, CompressionKind::Dictionary);

        let keys_a = vec!["pear".to_string(), "apple".to_string()];
        let keys_b = vec!["apple".to_string(), "quince".to_string()];
        let source_a = write_source(&dir.path().join("a"), &[(key_desc, keys_a.clone().into())]).await;
        let source_b = write_source(&dir.path().join("b"), &[(key_desc, keys_b.clone().into())]).await;

        let merger = SameSchemeMerger::new(
            vec![source_a, source_b],
            None,
            dir.path().join("out"),
            TransformOptions::default_for_test(),
        );
        let output = merger
            .merge(&CancelToken::new())
            .await
            .unwrap()
            .completed()
            .unwrap();
        assert_eq!(output.metas[0].tuple_count, 4);

        // decoding through the merged dictionary reproduces every source
        // value in source order
        let reader = ColumnFileReader::open(&output.stems[0], key_desc)
            .await
            .unwrap();
        let expected: Vec<String> = keys_a.into_iter().chain(keys_b).collect();
        assert_eq!(decode_all(&reader), expected.into());
        assert_eq!(output.metas[0].distinct_count, 3);
    }

    #[tokio::test]
    async fn test_merged_code_width_grows() {
        let dir = tempfile::tempdir().unwrap();
        let desc = ColumnDesc::new(ValueType::Int32, CompressionKind::Dictionary);

        let values_a: Vec<i32> = (0..200).map(|x| x * 2).collect();
        let values_b: Vec<i32> = (0..200).map(|x| x * 2 + 1).collect();
        let source_a = write_source(&dir.path().join("a"), &[(desc, values_a.clone().into())]).await;
        let source_b = write_source(&dir.path().join("b"), &[(desc, values_b.clone().into())]).await;
        assert_eq!(source_a[0].dictionary().unwrap().code_width(), 1);

        let merger = SameSchemeMerger::new(
            vec![source_a, source_b],
            Some(0),
            dir.path().join("out"),
            TransformOptions::default_for_test(),
        );
        let output = merger
            .merge(&CancelToken::new())
            .await
            .unwrap()
            .completed()
            .unwrap();
        assert_eq!(output.metas[0].distinct_count, 400);

        let reader = ColumnFileReader::open(&output.stems[0], desc).await.unwrap();
        assert_eq!(reader.dictionary().unwrap().code_width(), 2);
        let mut expected: Vec<i32> = values_a.into_iter().chain(values_b).collect();
        expected.sort_unstable();
        assert_eq!(decode_all(&reader), expected.into());
    }

    #[tokio::test]
    async fn test_canceled_merge_leaves_no_output() {
        let dir = tempfile::tempdir().unwrap();
        let desc = ColumnDesc::new(ValueType::Int64, CompressionKind::None);
        let source = write_source(
            &dir.path().join("a"),
            &[(desc, (0..100i64).collect::<Vec<_>>().into())],
        )
        .await;

        let cancel = CancelToken::new();
        cancel.cancel();
        let out_dir = dir.path().join("out");
        let merger = SameSchemeMerger::new(
            vec![source],
            None,
            &out_dir,
            TransformOptions::default_for_test(),
        );
        let outcome = merger.merge(&cancel).await.unwrap();
        assert!(outcome.is_canceled());
        assert!(std::fs::read_dir(&out_dir).unwrap().next().is_none());
    }
}
