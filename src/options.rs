// Copyright 2026 Strata Project Authors. Licensed under Apache-2.0.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::bundle::ChecksumType;

/// Options shared by every transformation task.
#[derive(Clone)]
pub struct TransformOptions {
    /// Number of rows moved per scratch batch.
    pub batch_size: usize,

    /// Checksum type stamped into every produced stream.
    pub checksum_type: ChecksumType,

    /// One value-index sample is taken every this many tuples
    /// on the sort column.
    pub value_index_interval: u32,

    /// Default bound on simultaneously open output groups
    /// during repartitioning.
    pub max_fanout: usize,

    /// Target size (in bytes) of general-purpose compressed blocks.
    pub target_block_size: usize,
}

impl TransformOptions {
    pub fn default_for_task() -> Self {
        Self {
            batch_size: 4096,
            checksum_type: ChecksumType::Crc32,
            value_index_interval: 128,
            max_fanout: 16,
            target_block_size: 64 * (1 << 10), // 64KB
        }
    }

    pub fn default_for_test() -> Self {
        Self {
            batch_size: 7,
            checksum_type: ChecksumType::Crc32,
            value_index_interval: 128,
            max_fanout: 4,
            target_block_size: 128,
        }
    }
}

/// Options for [`crate::bundle::ColumnFileWriter`]s.
#[derive(Clone)]
pub struct ColumnWriterOptions {
    pub checksum_type: ChecksumType,
    pub value_index_interval: u32,
    pub target_block_size: usize,
}

impl ColumnWriterOptions {
    pub fn from_transform_options(options: &TransformOptions) -> Self {
        Self {
            checksum_type: options.checksum_type,
            value_index_interval: options.value_index_interval,
            target_block_size: options.target_block_size,
        }
    }

    #[cfg(test)]
    pub fn default_for_test() -> Self {
        Self {
            checksum_type: ChecksumType::Crc32,
            value_index_interval: 128,
            target_block_size: 128,
        }
    }
}

/// Cooperative cancellation flag, polled between row batches.
///
/// The external scheduler owns one end; the running task checks
/// [`CancelToken::is_canceled`] at batch boundaries and never mid-batch.
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_canceled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}
