// Copyright 2026 Strata Project Authors. Licensed under Apache-2.0.

//! Temporary file name codec.
//!
//! Intermediate repartitioning files embed their provenance in the file
//! name, so a merger running on another node can recover origin node,
//! replica group, fracture, partition, and compression from a bare path
//! without a metadata round-trip:
//!
//! ```plain
//! <folder>/<nodeId>_<groupId>_<fractureId>_<partition>_<uniquifier>.<ext>
//! ```

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{StorageResult, TracedStorageError};

static FILE_NAME_GRAMMAR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+)_(\d+)_(\d+)_(\d+)_(\d+)\.(txt|snappy|gz)$").unwrap());

/// Compression of a raw-text intermediate, denoted by its extension.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TextCompression {
    Plain,
    Snappy,
    Gzip,
}

impl TextCompression {
    pub fn extension(self) -> &'static str {
        match self {
            TextCompression::Plain => "txt",
            TextCompression::Snappy => "snappy",
            TextCompression::Gzip => "gz",
        }
    }

    fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "txt" => Some(TextCompression::Plain),
            "snappy" => Some(TextCompression::Snappy),
            "gz" => Some(TextCompression::Gzip),
            _ => None,
        }
    }
}

/// Origin identifiers shared by every file one task emits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TempFileTag {
    pub node_id: u32,
    pub group_id: u32,
    pub fracture_id: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TempFilePath {
    pub tag: TempFileTag,
    pub partition: u32,
    pub uniquifier: u32,
    pub compression: TextCompression,
}

impl TempFilePath {
    pub fn new(
        tag: TempFileTag,
        partition: u32,
        uniquifier: u32,
        compression: TextCompression,
    ) -> Self {
        Self {
            tag,
            partition,
            uniquifier,
            compression,
        }
    }

    pub fn file_name(&self) -> String {
        format!(
            "{}_{}_{}_{}_{}.{}",
            self.tag.node_id,
            self.tag.group_id,
            self.tag.fracture_id,
            self.partition,
            self.uniquifier,
            self.compression.extension()
        )
    }

    pub fn encode(&self, folder: impl AsRef<Path>) -> PathBuf {
        folder.as_ref().join(self.file_name())
    }

    /// Decode a path produced by [`TempFilePath::encode`]. Any name not
    /// matching the grammar, or an unrecognized extension, is a hard parse
    /// failure.
    pub fn parse(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| TracedStorageError::name_grammar(path.display()))?;
        let captures = FILE_NAME_GRAMMAR
            .captures(name)
            .ok_or_else(|| TracedStorageError::name_grammar(name))?;

        let field = |idx: usize| {
            captures[idx]
                .parse()
                .map_err(|_| TracedStorageError::name_grammar(name))
        };
        let compression = TextCompression::from_extension(&captures[6])
            .ok_or_else(|| TracedStorageError::name_grammar(name))?;
        Ok(Self {
            tag: TempFileTag {
                node_id: field(1)?,
                group_id: field(2)?,
                fracture_id: captures[3]
                    .parse()
                    .map_err(|_| TracedStorageError::name_grammar(name))?,
            },
            partition: field(4)?,
            uniquifier: field(5)?,
            compression,
        })
    }
}
