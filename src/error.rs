// Copyright 2026 Strata Project Authors. Licensed under Apache-2.0.

use std::backtrace::Backtrace;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] Box<std::io::Error>),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("invalid checksum: found {0}, expected {1}")]
    Checksum(u64, u64),
    #[error("malformed temporary file name: {0}")]
    NameGrammar(String),
    #[error("tuple count mismatch across sibling files: {0} != {1}")]
    TupleCountMismatch(u64, u64),
    #[error("tuple count overflows the 31-bit addressable limit: {0}")]
    TupleCountOverflow(u64),
    #[error("unsupported dictionary code width: {0}")]
    CodeWidth(u8),
    #[error("unsupported value type for {0}")]
    UnsupportedType(&'static str),
    #[error("failed to create output folder {0}: {1}")]
    CreateDir(String, std::io::Error),
    #[error("compression error: {0}")]
    Compression(String),
}

impl From<std::io::Error> for TracedStorageError {
    #[inline]
    fn from(e: std::io::Error) -> TracedStorageError {
        StorageError::Io(e.into()).into()
    }
}

/// [`StorageError`] with backtrace.
pub struct TracedStorageError {
    source: StorageError,
    trace: Backtrace,
}

impl std::fmt::Display for TracedStorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.source)
    }
}

impl std::error::Error for TracedStorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

impl std::fmt::Debug for TracedStorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}\n{}", self.source, self.trace)
    }
}

impl From<StorageError> for TracedStorageError {
    #[inline]
    fn from(source: StorageError) -> Self {
        Self {
            source,
            trace: Backtrace::capture(),
        }
    }
}

impl TracedStorageError {
    pub fn decode(message: impl ToString) -> Self {
        StorageError::Decode(message.to_string()).into()
    }

    pub fn checksum(found: u64, expected: u64) -> Self {
        StorageError::Checksum(found, expected).into()
    }

    pub fn name_grammar(name: impl ToString) -> Self {
        StorageError::NameGrammar(name.to_string()).into()
    }
}

pub type StorageResult<T> = std::result::Result<T, TracedStorageError>;
