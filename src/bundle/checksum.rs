// Copyright 2026 Strata Project Authors. Licensed under Apache-2.0.

use crate::error::{StorageResult, TracedStorageError};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ChecksumType {
    None,
    #[default]
    Crc32,
}

impl From<ChecksumType> for i32 {
    fn from(ty: ChecksumType) -> i32 {
        match ty {
            ChecksumType::None => 0,
            ChecksumType::Crc32 => 1,
        }
    }
}

impl TryFrom<i32> for ChecksumType {
    type Error = TracedStorageError;

    fn try_from(value: i32) -> StorageResult<Self> {
        match value {
            0 => Ok(ChecksumType::None),
            1 => Ok(ChecksumType::Crc32),
            other => Err(TracedStorageError::decode(format!(
                "invalid checksum type {}",
                other
            ))),
        }
    }
}

pub fn build_checksum(checksum_type: ChecksumType, data: &[u8]) -> u64 {
    match checksum_type {
        ChecksumType::None => 0,
        ChecksumType::Crc32 => crc32fast::hash(data) as u64,
    }
}

pub fn verify_checksum(
    checksum_type: ChecksumType,
    data: &[u8],
    checksum: u64,
) -> StorageResult<()> {
    let found = build_checksum(checksum_type, data);
    if found != checksum {
        return Err(TracedStorageError::checksum(found, checksum));
    }
    Ok(())
}

/// Incremental checksum over a streamed body.
pub struct ChecksumBuilder {
    checksum_type: ChecksumType,
    hasher: crc32fast::Hasher,
}

impl ChecksumBuilder {
    pub fn new(checksum_type: ChecksumType) -> Self {
        Self {
            checksum_type,
            hasher: crc32fast::Hasher::new(),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        if self.checksum_type == ChecksumType::Crc32 {
            self.hasher.update(data);
        }
    }

    pub fn finish(self) -> u64 {
        match self.checksum_type {
            ChecksumType::None => 0,
            ChecksumType::Crc32 => self.hasher.finalize() as u64,
        }
    }
}
