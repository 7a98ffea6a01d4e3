// Copyright 2026 Strata Project Authors. Licensed under Apache-2.0.

//! Task output manifests.
//!
//! A merge or repartition task reports its produced files as a
//! length-prefixed sequence of per-partition column-file descriptor arrays.
//! Partitions that received no tuples are recorded with a sentinel, so the
//! scheduler can still garbage-collect the slot later.

use bytes::{Buf, BufMut, Bytes};

use crate::bundle::CompressionKind;
use crate::error::{StorageResult, TracedStorageError};

/// Sentinel marking a partition with no tuples.
const EMPTY_PARTITION: i32 = -1;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColumnFileDescriptor {
    /// Path stem of the column-file bundle, relative to the task's output
    /// folder.
    pub stem: String,
    pub tuple_count: u32,
    pub compression: CompressionKind,
}

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Summary {
    /// One entry per target partition; `None` means no tuples.
    pub partitions: Vec<Option<Vec<ColumnFileDescriptor>>>,
}

impl Summary {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![];
        buf.put_u32(self.partitions.len() as u32);
        for partition in &self.partitions {
            match partition {
                None => buf.put_i32(EMPTY_PARTITION),
                Some(descriptors) => {
                    buf.put_i32(descriptors.len() as i32);
                    for desc in descriptors {
                        buf.put_u16(desc.stem.len() as u16);
                        buf.put_slice(desc.stem.as_bytes());
                        buf.put_u32(desc.tuple_count);
                        buf.put_i32(desc.compression.into());
                    }
                }
            }
        }
        buf
    }

    pub fn decode(data: Bytes) -> StorageResult<Self> {
        let mut buf = data;
        if buf.remaining() < 4 {
            return Err(TracedStorageError::decode("summary too short"));
        }
        let partition_count = buf.get_u32() as usize;
        let mut partitions = Vec::with_capacity(partition_count);
        for _ in 0..partition_count {
            if buf.remaining() < 4 {
                return Err(TracedStorageError::decode("truncated summary"));
            }
            let count = buf.get_i32();
            if count == EMPTY_PARTITION {
                partitions.push(None);
                continue;
            }
            if count < 0 {
                return Err(TracedStorageError::decode("invalid descriptor count"));
            }
            let mut descriptors = Vec::with_capacity(count as usize);
            for _ in 0..count {
                if buf.remaining() < 2 {
                    return Err(TracedStorageError::decode("truncated summary"));
                }
                let stem_len = buf.get_u16() as usize;
                if buf.remaining() < stem_len + 8 {
                    return Err(TracedStorageError::decode("truncated summary"));
                }
                let mut stem = vec![0; stem_len];
                buf.copy_to_slice(&mut stem);
                let stem = String::from_utf8(stem)
                    .map_err(|_| TracedStorageError::decode("summary stem is not utf8"))?;
                descriptors.push(ColumnFileDescriptor {
                    stem,
                    tuple_count: buf.get_u32(),
                    compression: CompressionKind::try_from(buf.get_i32())?,
                });
            }
            partitions.push(Some(descriptors));
        }
        if buf.has_remaining() {
            return Err(TracedStorageError::decode("trailing bytes after summary"));
        }
        Ok(Self { partitions })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_with_sentinel() {
        let summary = Summary {
            partitions: vec![
                Some(vec![
                    ColumnFileDescriptor {
                        stem: "12/0".to_string(),
                        tuple_count: 69,
                        compression: CompressionKind::Dictionary,
                    },
                    ColumnFileDescriptor {
                        stem: "12/1".to_string(),
                        tuple_count: 69,
                        compression: CompressionKind::None,
                    },
                ]),
                None,
                Some(vec![]),
            ],
        };
        let decoded = Summary::decode(Bytes::from(summary.encode())).unwrap();
        assert_eq!(decoded, summary);
    }

    #[test]
    fn test_truncated_rejected() {
        let summary = Summary {
            partitions: vec![Some(vec![ColumnFileDescriptor {
                stem: "0".to_string(),
                tuple_count: 1,
                compression: CompressionKind::None,
            }])],
        };
        let mut data = summary.encode();
        data.truncate(data.len() - 3);
        assert!(Summary::decode(Bytes::from(data)).is_err());
    }
}
