// Copyright 2026 Strata Project Authors. Licensed under Apache-2.0.

//! Column-file bundles.
//!
//! The physical representation of one column within one partition version:
//! a data stream (`.col`), an optional dictionary stream (`.dict`), an
//! optional position stream (`.pos`), and an optional sparse value-index
//! stream (`.vix`), all sharing one path stem. The data stream carries a
//! footer with the tuple count, compression kind, statistics, and a CRC
//! over the stored body.

mod checksum;
mod reader;
mod value_index;
mod writer;

use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, Bytes};
pub use checksum::*;
pub use reader::*;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
pub use value_index::*;
pub use writer::*;

use crate::error::{StorageResult, TracedStorageError};
use crate::value::ValueType;

pub const STREAM_MAGIC: u32 = 0x53545231;

/// `checksum type (4B) | checksum (8B) | magic (4B)` at the end of every
/// sibling stream.
pub const STREAM_FOOTER_SIZE: usize = 4 + 8 + 4;

/// The data stream footer additionally holds tuple count, compression,
/// distinct count, run count, and uncompressed size.
pub const COLUMN_FOOTER_SIZE: usize = 4 + 4 + 4 + 4 + 8 + STREAM_FOOTER_SIZE;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompressionKind {
    None,
    Dictionary,
    RunLength,
    Block,
}

impl From<CompressionKind> for i32 {
    fn from(kind: CompressionKind) -> i32 {
        match kind {
            CompressionKind::None => 0,
            CompressionKind::Dictionary => 1,
            CompressionKind::RunLength => 2,
            CompressionKind::Block => 3,
        }
    }
}

impl TryFrom<i32> for CompressionKind {
    type Error = TracedStorageError;

    fn try_from(value: i32) -> StorageResult<Self> {
        match value {
            0 => Ok(CompressionKind::None),
            1 => Ok(CompressionKind::Dictionary),
            2 => Ok(CompressionKind::RunLength),
            3 => Ok(CompressionKind::Block),
            other => Err(TracedStorageError::decode(format!(
                "invalid compression kind {}",
                other
            ))),
        }
    }
}

/// Value type and compression of one column, shared by every source of a
/// same-scheme merge.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ColumnDesc {
    pub value_type: ValueType,
    pub compression: CompressionKind,
}

impl ColumnDesc {
    pub fn new(value_type: ValueType, compression: CompressionKind) -> Self {
        Self {
            value_type,
            compression,
        }
    }

    /// Whether the bundle carries a position stream: run boundaries for
    /// run-length data, value boundaries for var-len data. Dictionary code
    /// streams are fixed-width and need none.
    pub fn has_position_stream(&self) -> bool {
        match self.compression {
            CompressionKind::RunLength => true,
            CompressionKind::Dictionary => false,
            CompressionKind::None | CompressionKind::Block => self.value_type.is_var_len(),
        }
    }

    pub fn has_dictionary_stream(&self) -> bool {
        self.compression == CompressionKind::Dictionary
    }
}

/// Scalar metadata of one column file, stored in the data stream footer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColumnFileMeta {
    pub tuple_count: u32,
    pub compression: CompressionKind,
    pub distinct_count: u32,
    pub run_count: u32,
    pub uncompressed_size: u64,
    pub checksum: u64,
}

pub fn path_of_data_file(stem: impl AsRef<Path>) -> PathBuf {
    path_with_suffix(stem, ".col")
}

pub fn path_of_dict_file(stem: impl AsRef<Path>) -> PathBuf {
    path_with_suffix(stem, ".dict")
}

pub fn path_of_position_file(stem: impl AsRef<Path>) -> PathBuf {
    path_with_suffix(stem, ".pos")
}

pub fn path_of_value_index_file(stem: impl AsRef<Path>) -> PathBuf {
    path_with_suffix(stem, ".vix")
}

pub fn path_of_column_stem(base: impl AsRef<Path>, column_idx: usize) -> PathBuf {
    base.as_ref().join(column_idx.to_string())
}

fn path_with_suffix(stem: impl AsRef<Path>, suffix: &str) -> PathBuf {
    let mut name = stem.as_ref().as_os_str().to_os_string();
    name.push(suffix);
    name.into()
}

/// Append the shared stream footer: checksum over everything written so
/// far, then the magic number.
pub fn seal_stream(data: &mut Vec<u8>, checksum_type: ChecksumType) {
    let checksum = build_checksum(checksum_type, data);
    data.put_i32(checksum_type.into());
    data.put_u64(checksum);
    data.put_u32(STREAM_MAGIC);
}

/// Validate the shared stream footer and return the body.
pub fn open_stream(data: Bytes) -> StorageResult<Bytes> {
    if data.len() < STREAM_FOOTER_SIZE {
        return Err(TracedStorageError::decode("stream is smaller than footer"));
    }
    let body = data.slice(..data.len() - STREAM_FOOTER_SIZE);
    let mut footer = &data[data.len() - STREAM_FOOTER_SIZE..];
    let checksum_type = ChecksumType::try_from(footer.get_i32())?;
    let checksum = footer.get_u64();
    if footer.get_u32() != STREAM_MAGIC {
        return Err(TracedStorageError::decode("invalid stream magic"));
    }
    verify_checksum(checksum_type, &body, checksum)?;
    Ok(body)
}

/// Write a fully-built sibling stream to disk.
pub async fn pipe_to_file(path: impl AsRef<Path>, data: &[u8]) -> StorageResult<()> {
    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path.as_ref())
        .await?;

    let mut writer = BufWriter::new(file);
    writer.write_all(data).await?;
    writer.flush().await?;

    let file = writer.into_inner();
    file.sync_data().await?;

    Ok(())
}

pub async fn sync_dir(path: impl AsRef<Path>) -> StorageResult<()> {
    File::open(path.as_ref()).await?.sync_data().await?;
    Ok(())
}

/// Keeps a failed or canceled task's declared output either complete or
/// entirely absent: every tracked file is removed on drop unless the task
/// reached [`OutputGuard::disarm`].
pub struct OutputGuard {
    files: Vec<PathBuf>,
    armed: bool,
}

impl OutputGuard {
    pub fn new() -> Self {
        Self {
            files: vec![],
            armed: true,
        }
    }

    /// Track all sibling streams of one column stem.
    pub fn track_stem(&mut self, stem: impl AsRef<Path>) {
        self.files.push(path_of_data_file(&stem));
        self.files.push(path_of_dict_file(&stem));
        self.files.push(path_of_position_file(&stem));
        self.files.push(path_of_value_index_file(&stem));
    }

    pub fn track_file(&mut self, path: impl Into<PathBuf>) {
        self.files.push(path.into());
    }

    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl Default for OutputGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for OutputGuard {
    fn drop(&mut self) {
        if self.armed {
            for path in &self.files {
                let _ = std::fs::remove_file(path);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_seal_round_trip() {
        let mut data = b"payload".to_vec();
        seal_stream(&mut data, ChecksumType::Crc32);
        let body = open_stream(Bytes::from(data)).unwrap();
        assert_eq!(&body[..], b"payload");
    }

    #[test]
    fn test_stream_corruption_detected() {
        let mut data = b"payload".to_vec();
        seal_stream(&mut data, ChecksumType::Crc32);
        data[0] ^= 0xff;
        assert!(open_stream(Bytes::from(data)).is_err());
    }

    #[test]
    fn test_output_guard_removes_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let stem = dir.path().join("0");
        std::fs::write(path_of_data_file(&stem), b"x").unwrap();
        {
            let mut guard = OutputGuard::new();
            guard.track_stem(&stem);
        }
        assert!(!path_of_data_file(&stem).exists());
    }

    #[test]
    fn test_output_guard_disarm_keeps_files() {
        let dir = tempfile::tempdir().unwrap();
        let stem = dir.path().join("0");
        std::fs::write(path_of_data_file(&stem), b"x").unwrap();
        let mut guard = OutputGuard::new();
        guard.track_stem(&stem);
        guard.disarm();
        assert!(path_of_data_file(&stem).exists());
    }
}
