// Copyright 2026 Strata Project Authors. Licensed under Apache-2.0.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::{Buf, Bytes};

use super::{
    open_stream, path_of_data_file, path_of_dict_file, path_of_position_file, verify_checksum,
    ChecksumType, ColumnDesc, ColumnFileMeta, CompressionKind, COLUMN_FOOTER_SIZE, STREAM_MAGIC,
};
use crate::dict::Dictionary;
use crate::error::{StorageError, StorageResult, TracedStorageError};
use crate::value::Vector;

/// One source column file bundle, opened and validated.
///
/// The data stream body is held as [`Bytes`], so cursors are cheap to create
/// and the same file can feed both a key stream and a data stream during a
/// merge.
pub struct ColumnFileReader {
    stem: PathBuf,
    desc: ColumnDesc,
    meta: ColumnFileMeta,
    /// Plain body: block frames are decompressed on open.
    body: Bytes,
    positions: Option<Vec<u64>>,
    dictionary: Option<Arc<Dictionary>>,
}

impl ColumnFileReader {
    pub async fn open(stem: impl AsRef<Path>, desc: ColumnDesc) -> StorageResult<Self> {
        let stem = stem.as_ref().to_path_buf();
        let data = Bytes::from(tokio::fs::read(path_of_data_file(&stem)).await?);
        if data.len() < COLUMN_FOOTER_SIZE {
            return Err(TracedStorageError::decode(
                "column file is smaller than footer",
            ));
        }

        let stored = data.slice(..data.len() - COLUMN_FOOTER_SIZE);
        let mut footer = &data[data.len() - COLUMN_FOOTER_SIZE..];
        let tuple_count = footer.get_u32();
        let compression = CompressionKind::try_from(footer.get_i32())?;
        let distinct_count = footer.get_u32();
        let run_count = footer.get_u32();
        let uncompressed_size = footer.get_u64();
        let checksum_type = ChecksumType::try_from(footer.get_i32())?;
        let checksum = footer.get_u64();
        if footer.get_u32() != STREAM_MAGIC {
            return Err(TracedStorageError::decode("invalid column file magic"));
        }
        verify_checksum(checksum_type, &stored, checksum)?;

        if compression != desc.compression {
            return Err(TracedStorageError::decode(format!(
                "expected {:?} compression, file carries {:?}",
                desc.compression, compression
            )));
        }
        let meta = ColumnFileMeta {
            tuple_count,
            compression,
            distinct_count,
            run_count,
            uncompressed_size,
            checksum,
        };

        let body = match compression {
            CompressionKind::Block => decompress_blocks(stored, uncompressed_size)?,
            _ => stored,
        };

        let positions = if desc.has_position_stream() {
            let data = Bytes::from(tokio::fs::read(path_of_position_file(&stem)).await?);
            let mut body = open_stream(data)?;
            let mut positions = Vec::with_capacity(body.remaining() / 8);
            while body.remaining() >= 8 {
                positions.push(body.get_u64_le());
            }
            if body.has_remaining() {
                return Err(TracedStorageError::decode("truncated position stream"));
            }
            let expected = match compression {
                CompressionKind::RunLength => meta.run_count as u64,
                _ => meta.tuple_count as u64,
            };
            if positions.len() as u64 != expected {
                return Err(StorageError::TupleCountMismatch(
                    positions.len() as u64,
                    expected,
                )
                .into());
            }
            Some(positions)
        } else {
            None
        };

        let dictionary = if desc.has_dictionary_stream() {
            let data = Bytes::from(tokio::fs::read(path_of_dict_file(&stem)).await?);
            let dict = Dictionary::decode(open_stream(data)?, desc.value_type)?;
            if dict.len() as u32 != meta.distinct_count {
                return Err(StorageError::TupleCountMismatch(
                    dict.len() as u64,
                    meta.distinct_count as u64,
                )
                .into());
            }
            Some(Arc::new(dict))
        } else {
            None
        };

        Ok(Self {
            stem,
            desc,
            meta,
            body,
            positions,
            dictionary,
        })
    }

    pub fn stem(&self) -> &PathBuf {
        &self.stem
    }

    pub fn desc(&self) -> ColumnDesc {
        self.desc
    }

    pub fn meta(&self) -> &ColumnFileMeta {
        &self.meta
    }

    pub fn tuple_count(&self) -> u32 {
        self.meta.tuple_count
    }

    pub fn dictionary(&self) -> Option<&Arc<Dictionary>> {
        self.dictionary.as_ref()
    }

    pub fn positions(&self) -> Option<&[u64]> {
        self.positions.as_deref()
    }

    /// A fresh cursor over the whole column.
    pub fn cursor(&self) -> ColumnCursor {
        ColumnCursor {
            desc: self.desc,
            buf: self.body.clone(),
            remaining: self.meta.tuple_count as usize,
            dictionary: self.dictionary.clone(),
            run_remaining: 0,
            run_value: Vector::new(self.desc.value_type),
        }
    }
}

fn decompress_blocks(stored: Bytes, uncompressed_size: u64) -> StorageResult<Bytes> {
    let mut buf = stored;
    let mut plain = Vec::with_capacity(uncompressed_size as usize);
    while buf.has_remaining() {
        if buf.remaining() < 8 {
            return Err(TracedStorageError::decode("truncated block frame header"));
        }
        let uncompressed_len = buf.get_u32() as usize;
        let compressed_len = buf.get_u32() as usize;
        if buf.remaining() < compressed_len {
            return Err(TracedStorageError::decode("truncated block frame"));
        }
        let chunk = buf.slice(..compressed_len);
        buf.advance(compressed_len);
        let decompressed = snap::raw::Decoder::new()
            .decompress_vec(&chunk)
            .map_err(|e| StorageError::Compression(e.to_string()))?;
        if decompressed.len() != uncompressed_len {
            return Err(TracedStorageError::decode(
                "block frame size does not match header",
            ));
        }
        plain.extend_from_slice(&decompressed);
    }
    if plain.len() as u64 != uncompressed_size {
        return Err(TracedStorageError::decode(
            "uncompressed body size does not match footer",
        ));
    }
    Ok(Bytes::from(plain))
}

/// Batched scan over one column file. Yields raw dictionary codes or decoded
/// values through caller-owned scratch buffers.
pub struct ColumnCursor {
    desc: ColumnDesc,
    buf: Bytes,
    remaining: usize,
    dictionary: Option<Arc<Dictionary>>,
    run_remaining: u32,
    run_value: Vector,
}

impl ColumnCursor {
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    /// Read up to `max` raw dictionary codes into `out`. Returns the number
    /// read; 0 means the column is exhausted.
    pub fn next_codes(&mut self, out: &mut Vec<u32>, max: usize) -> usize {
        let dict = self
            .dictionary
            .as_ref()
            .expect("code scan on a non-dictionary column");
        let n = max.min(self.remaining);
        for _ in 0..n {
            let code = match dict.code_width() {
                1 => self.buf.get_u8() as u32,
                2 => self.buf.get_u16_le() as u32,
                4 => self.buf.get_u32_le(),
                _ => unreachable!("code width validated on open"),
            };
            out.push(code);
        }
        self.remaining -= n;
        n
    }

    /// Decode up to `max` values into `out`. Returns the number decoded;
    /// 0 means the column is exhausted. `out` is not cleared.
    pub fn next_values(&mut self, out: &mut Vector, max: usize) -> usize {
        let n = max.min(self.remaining);
        match self.desc.compression {
            CompressionKind::None | CompressionKind::Block => {
                for _ in 0..n {
                    out.decode_push(&mut self.buf);
                }
            }
            CompressionKind::Dictionary => {
                let dict = self.dictionary.clone().unwrap();
                for _ in 0..n {
                    let code = match dict.code_width() {
                        1 => self.buf.get_u8() as u32,
                        2 => self.buf.get_u16_le() as u32,
                        4 => self.buf.get_u32_le(),
                        _ => unreachable!(),
                    };
                    dict.push_value(code, out);
                }
            }
            CompressionKind::RunLength => {
                let mut left = n;
                while left > 0 {
                    if self.run_remaining == 0 {
                        self.run_remaining = self.buf.get_u32_le();
                        self.run_value.clear();
                        self.run_value.decode_push(&mut self.buf);
                    }
                    let take = left.min(self.run_remaining as usize);
                    for _ in 0..take {
                        out.push_from(&self.run_value, 0);
                    }
                    self.run_remaining -= take as u32;
                    left -= take;
                }
            }
        }
        self.remaining -= n;
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::ColumnFileWriter;
    use crate::options::ColumnWriterOptions;
    use crate::value::ValueType;

    async fn write_and_read(
        desc: ColumnDesc,
        values: &Vector,
        sort_column: bool,
        dictionary: Option<Arc<Dictionary>>,
        codes: Option<&[u32]>,
    ) -> (ColumnFileMeta, Vector) {
        let dir = tempfile::tempdir().unwrap();
        let stem = dir.path().join("0");
        let mut writer = ColumnFileWriter::create(
            &stem,
            desc,
            ColumnWriterOptions::default_for_test(),
            sort_column,
            dictionary,
        )
        .await
        .unwrap();
        match codes {
            Some(codes) => writer.append_codes(codes),
            None => writer.append_values(values, 0..values.len()),
        }
        let meta = writer.finish().await.unwrap();

        let reader = ColumnFileReader::open(&stem, desc).await.unwrap();
        assert_eq!(reader.meta(), &meta);
        let mut cursor = reader.cursor();
        let mut out = Vector::new(desc.value_type);
        // odd batch size to cross run and frame boundaries
        while cursor.next_values(&mut out, 3) > 0 {}
        (meta, out)
    }

    #[tokio::test]
    async fn test_plain_var_len_round_trip() {
        let values: Vector = vec!["a".to_string(), "".to_string(), "long-ish".to_string()].into();
        let desc = ColumnDesc::new(ValueType::Utf8, CompressionKind::None);
        let (meta, out) = write_and_read(desc, &values, false, None, None).await;
        assert_eq!(meta.tuple_count, 3);
        assert_eq!(out, values);
    }

    #[tokio::test]
    async fn test_run_length_round_trip() {
        let values: Vector = vec![7i32, 7, 7, 3, 3, 9, 9, 9, 9].into();
        let desc = ColumnDesc::new(ValueType::Int32, CompressionKind::RunLength);
        let (meta, out) = write_and_read(desc, &values, false, None, None).await;
        assert_eq!(meta.run_count, 3);
        assert_eq!(out, values);
    }

    #[tokio::test]
    async fn test_block_round_trip_spans_frames() {
        // larger than the 128-byte test block size, so several frames
        let values: Vector = (0..600i64).collect::<Vec<_>>().into();
        let desc = ColumnDesc::new(ValueType::Int64, CompressionKind::Block);
        let (meta, out) = write_and_read(desc, &values, false, None, None).await;
        assert_eq!(meta.uncompressed_size, 600 * 8);
        assert_eq!(out, values);
    }

    #[tokio::test]
    async fn test_dictionary_round_trip() {
        let decoded: Vector = vec![
            "bee".to_string(),
            "ant".to_string(),
            "bee".to_string(),
            "cow".to_string(),
        ]
        .into();
        let (dict, codes) = Dictionary::build(&decoded);
        let desc = ColumnDesc::new(ValueType::Utf8, CompressionKind::Dictionary);
        let (meta, out) =
            write_and_read(desc, &decoded, false, Some(Arc::new(dict)), Some(&codes)).await;
        assert_eq!(meta.distinct_count, 3);
        assert_eq!(out, decoded);
    }

    #[tokio::test]
    async fn test_corrupted_body_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let stem = dir.path().join("0");
        let desc = ColumnDesc::new(ValueType::Int32, CompressionKind::None);
        let mut writer = ColumnFileWriter::create(
            &stem,
            desc,
            ColumnWriterOptions::default_for_test(),
            false,
            None,
        )
        .await
        .unwrap();
        writer.append_values(&vec![1i32, 2, 3].into(), 0..3);
        writer.finish().await.unwrap();

        let path = path_of_data_file(&stem);
        let mut data = std::fs::read(&path).unwrap();
        data[0] ^= 0xff;
        std::fs::write(&path, data).unwrap();
        assert!(ColumnFileReader::open(&stem, desc).await.is_err());
    }

    #[tokio::test]
    async fn test_value_index_sampling() {
        let dir = tempfile::tempdir().unwrap();
        let stem = dir.path().join("0");
        let desc = ColumnDesc::new(ValueType::Int32, CompressionKind::None);
        let mut writer = ColumnFileWriter::create(
            &stem,
            desc,
            ColumnWriterOptions::default_for_test(),
            true,
            None,
        )
        .await
        .unwrap();
        let values: Vector = (0..300i32).collect::<Vec<_>>().into();
        writer.append_values(&values, 0..300);
        writer.finish().await.unwrap();

        let index = crate::bundle::ValueIndex::load(&stem, ValueType::Int32)
            .await
            .unwrap();
        assert_eq!(index.rows, vec![0, 128, 256]);
        assert_eq!(index.keys, vec![0i32, 128, 256].into());
    }
}
