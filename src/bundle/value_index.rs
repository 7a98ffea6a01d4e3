// Copyright 2026 Strata Project Authors. Licensed under Apache-2.0.

use bytes::{Buf, BufMut, Bytes};

use super::{open_stream, path_of_value_index_file, seal_stream, ChecksumType};
use crate::error::{StorageResult, TracedStorageError};
use crate::value::{ValueType, Vector};

/// Sparse key index over the sort column: one `(row id, key)` sample every
/// [`crate::TransformOptions::value_index_interval`] tuples, letting readers
/// seek near a key without scanning the data stream.
pub struct ValueIndex {
    pub rows: Vec<u32>,
    pub keys: Vector,
}

impl ValueIndex {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn encode(&self, checksum_type: ChecksumType) -> Vec<u8> {
        assert_eq!(self.rows.len(), self.keys.len());
        let mut data = vec![];
        data.put_u32_le(self.rows.len() as u32);
        for (idx, &row) in self.rows.iter().enumerate() {
            data.put_u32_le(row);
            self.keys.encode_row(idx, &mut data);
        }
        seal_stream(&mut data, checksum_type);
        data
    }

    pub fn decode(data: Bytes, value_type: ValueType) -> StorageResult<Self> {
        let mut body = open_stream(data)?;
        if body.remaining() < 4 {
            return Err(TracedStorageError::decode("value index too short"));
        }
        let entries = body.get_u32_le() as usize;
        let mut rows = Vec::with_capacity(entries);
        let mut keys = Vector::with_capacity(value_type, entries);
        for _ in 0..entries {
            rows.push(body.get_u32_le());
            keys.decode_push(&mut body);
        }
        if body.has_remaining() {
            return Err(TracedStorageError::decode(
                "trailing bytes after value index entries",
            ));
        }
        Ok(Self { rows, keys })
    }

    pub async fn load(
        stem: impl AsRef<std::path::Path>,
        value_type: ValueType,
    ) -> StorageResult<Self> {
        let data = tokio::fs::read(path_of_value_index_file(stem)).await?;
        Self::decode(Bytes::from(data), value_type)
    }
}
