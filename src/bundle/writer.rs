// Copyright 2026 Strata Project Authors. Licensed under Apache-2.0.

use std::path::PathBuf;
use std::sync::Arc;

use bytes::BufMut;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncWriteExt, BufWriter};

use super::{
    path_of_data_file, path_of_dict_file, path_of_position_file, path_of_value_index_file,
    pipe_to_file, seal_stream, ChecksumBuilder, ColumnDesc, ColumnFileMeta, CompressionKind,
    ValueIndex, STREAM_MAGIC,
};
use crate::dict::Dictionary;
use crate::error::{StorageError, StorageResult};
use crate::options::ColumnWriterOptions;
use crate::value::Vector;

/// Pending encoded bytes are flushed to disk once they exceed this size, so
/// writer memory stays bounded no matter how large the output column grows.
const SPILL_THRESHOLD: usize = 256 * (1 << 10);

/// Streams one output column file bundle to disk.
///
/// Values (or pre-converted dictionary codes) are appended in batches; the
/// data stream is written incrementally with an incremental checksum, and
/// the sibling streams are emitted on [`ColumnFileWriter::finish`].
pub struct ColumnFileWriter {
    stem: PathBuf,
    desc: ColumnDesc,
    options: ColumnWriterOptions,

    file: BufWriter<tokio::fs::File>,
    checksum: ChecksumBuilder,
    /// Plain-encoded bytes not yet flushed (for block compression, not yet
    /// framed).
    encode_buf: Vec<u8>,
    /// Plain body bytes produced so far, before any block framing.
    plain_len: u64,

    tuple_count: u64,
    run_count: u32,
    positions: Vec<u64>,
    distinct_override: Option<u32>,

    dictionary: Option<Arc<Dictionary>>,
    /// The dictionary stream is inherited byte-for-byte from a buddy file,
    /// so `finish` must not write it again.
    dict_inherited: bool,

    // current run of a run-length column
    run_value: Vector,
    run_len: u32,

    // sparse value index, sort column only
    sort_column: bool,
    vix_rows: Vec<u32>,
    vix_keys: Vector,
}

impl ColumnFileWriter {
    pub async fn create(
        stem: impl Into<PathBuf>,
        desc: ColumnDesc,
        options: ColumnWriterOptions,
        sort_column: bool,
        dictionary: Option<Arc<Dictionary>>,
    ) -> StorageResult<Self> {
        assert_eq!(
            desc.compression == CompressionKind::Dictionary,
            dictionary.is_some(),
            "dictionary column requires a dictionary"
        );
        let stem = stem.into();
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path_of_data_file(&stem))
            .await?;
        Ok(Self {
            file: BufWriter::new(file),
            checksum: ChecksumBuilder::new(options.checksum_type),
            encode_buf: vec![],
            plain_len: 0,
            tuple_count: 0,
            run_count: 0,
            positions: vec![],
            distinct_override: None,
            dict_inherited: false,
            run_value: Vector::new(desc.value_type),
            run_len: 0,
            sort_column,
            vix_rows: vec![],
            vix_keys: Vector::new(desc.value_type),
            dictionary,
            desc,
            options,
            stem,
        })
    }

    pub fn stem(&self) -> &PathBuf {
        &self.stem
    }

    pub fn tuple_count(&self) -> u64 {
        self.tuple_count
    }

    /// Mark the dictionary stream as inherited from a buddy file; `finish`
    /// skips writing it.
    pub fn inherit_dictionary(&mut self) {
        assert!(self.dictionary.is_some());
        self.dict_inherited = true;
    }

    /// Distinct-value count for columns whose writer cannot derive it
    /// (plain sorted data, counted by the caller).
    pub fn set_distinct_count(&mut self, distinct: u32) {
        self.distinct_override = Some(distinct);
    }

    /// Append decoded values `range` of `values`.
    pub fn append_values(&mut self, values: &Vector, range: std::ops::Range<usize>) {
        assert_ne!(
            self.desc.compression,
            CompressionKind::Dictionary,
            "dictionary columns take codes, not values"
        );
        for row in range {
            self.sample_value_index(values, row);
            match self.desc.compression {
                CompressionKind::None | CompressionKind::Block => {
                    values.encode_row(row, &mut self.encode_buf);
                    self.plain_len += values.encoded_row_len(row) as u64;
                    if self.desc.value_type.is_var_len() {
                        self.positions.push(self.plain_len);
                    }
                }
                CompressionKind::RunLength => self.append_run(values, row),
                CompressionKind::Dictionary => unreachable!(),
            }
            self.tuple_count += 1;
        }
    }

    /// Append dictionary codes already converted to this writer's merged
    /// dictionary.
    pub fn append_codes(&mut self, codes: &[u32]) {
        assert_eq!(self.desc.compression, CompressionKind::Dictionary);
        let dict = self.dictionary.clone().unwrap();
        for &code in codes {
            if self.sort_column && self.tuple_count % self.options.value_index_interval as u64 == 0
            {
                self.vix_rows.push(self.tuple_count as u32);
                dict.push_value(code, &mut self.vix_keys);
            }
            match dict.code_width() {
                1 => self.encode_buf.put_u8(code as u8),
                2 => self.encode_buf.put_u16_le(code as u16),
                4 => self.encode_buf.put_u32_le(code),
                _ => unreachable!("code width validated at dictionary construction"),
            }
            self.plain_len += dict.code_width() as u64;
            self.tuple_count += 1;
        }
    }

    fn sample_value_index(&mut self, values: &Vector, row: usize) {
        if self.sort_column && self.tuple_count % self.options.value_index_interval as u64 == 0 {
            self.vix_rows.push(self.tuple_count as u32);
            self.vix_keys.push_from(values, row);
        }
    }

    fn append_run(&mut self, values: &Vector, row: usize) {
        if self.run_len > 0
            && self.run_value.cmp_rows(0, values, row) == std::cmp::Ordering::Equal
        {
            self.run_len += 1;
            return;
        }
        if self.run_len > 0 {
            self.close_run();
        }
        self.run_value.clear();
        self.run_value.push_from(values, row);
        self.run_len = 1;
    }

    fn close_run(&mut self) {
        self.encode_buf.put_u32_le(self.run_len);
        self.run_value.encode_row(0, &mut self.encode_buf);
        self.plain_len += 4 + self.run_value.encoded_row_len(0) as u64;
        self.run_count += 1;
        self.run_len = 0;
        // the closed run ends exactly at the current tuple count
        self.positions.push(self.tuple_count);
    }

    /// Flush pending encoded bytes to disk once they exceed the spill
    /// threshold. Cheap when the buffer is small; drivers call this between
    /// batches.
    pub async fn spill(&mut self) -> StorageResult<()> {
        if self.encode_buf.len() >= SPILL_THRESHOLD {
            self.flush_buffered(false).await?;
        }
        Ok(())
    }

    async fn flush_buffered(&mut self, force: bool) -> StorageResult<()> {
        if self.desc.compression == CompressionKind::Block {
            let block_size = self.options.target_block_size;
            while self.encode_buf.len() >= block_size || (force && !self.encode_buf.is_empty()) {
                let take = self.encode_buf.len().min(block_size);
                let chunk: Vec<u8> = self.encode_buf.drain(..take).collect();
                let compressed = snap::raw::Encoder::new()
                    .compress_vec(&chunk)
                    .map_err(|e| StorageError::Compression(e.to_string()))?;
                let mut frame = Vec::with_capacity(8 + compressed.len());
                frame.put_u32(chunk.len() as u32);
                frame.put_u32(compressed.len() as u32);
                frame.extend_from_slice(&compressed);
                self.checksum.update(&frame);
                self.file.write_all(&frame).await?;
            }
        } else if force || !self.encode_buf.is_empty() {
            self.checksum.update(&self.encode_buf);
            self.file.write_all(&self.encode_buf).await?;
            self.encode_buf.clear();
        }
        Ok(())
    }

    /// Flush, stamp the footer, and emit the sibling streams. Returns the
    /// metadata recorded in the data stream footer.
    pub async fn finish(mut self) -> StorageResult<ColumnFileMeta> {
        if self.desc.compression == CompressionKind::RunLength && self.run_len > 0 {
            self.close_run();
        }
        self.flush_buffered(true).await?;

        if self.tuple_count > i32::MAX as u64 {
            return Err(StorageError::TupleCountOverflow(self.tuple_count).into());
        }

        let distinct_count = match &self.dictionary {
            Some(dict) => dict.len() as u32,
            None => self.distinct_override.unwrap_or(0),
        };
        let meta = ColumnFileMeta {
            tuple_count: self.tuple_count as u32,
            compression: self.desc.compression,
            distinct_count,
            run_count: self.run_count,
            uncompressed_size: self.plain_len,
            checksum: self.checksum.finish(),
        };

        let mut footer = vec![];
        footer.put_u32(meta.tuple_count);
        footer.put_i32(meta.compression.into());
        footer.put_u32(meta.distinct_count);
        footer.put_u32(meta.run_count);
        footer.put_u64(meta.uncompressed_size);
        footer.put_i32(self.options.checksum_type.into());
        footer.put_u64(meta.checksum);
        footer.put_u32(STREAM_MAGIC);
        self.file.write_all(&footer).await?;
        self.file.flush().await?;
        let file = self.file.into_inner();
        file.sync_data().await?;

        if self.desc.has_position_stream() {
            let mut data = vec![];
            for &pos in &self.positions {
                data.put_u64_le(pos);
            }
            seal_stream(&mut data, self.options.checksum_type);
            pipe_to_file(path_of_position_file(&self.stem), &data).await?;
        }

        if let Some(dict) = &self.dictionary {
            if !self.dict_inherited {
                let mut data = dict.encode();
                seal_stream(&mut data, self.options.checksum_type);
                pipe_to_file(path_of_dict_file(&self.stem), &data).await?;
            }
        }

        if self.sort_column {
            let index = ValueIndex {
                rows: self.vix_rows,
                keys: self.vix_keys,
            };
            let data = index.encode(self.options.checksum_type);
            pipe_to_file(path_of_value_index_file(&self.stem), &data).await?;
        }

        Ok(meta)
    }
}
