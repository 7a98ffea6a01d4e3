// Copyright 2026 Strata Project Authors. Licensed under Apache-2.0.

//! Row-oriented text repartitioning.
//!
//! The text variant of the recursive repartitioner works on raw lines
//! instead of column files. Intermediates carry their provenance in the
//! file name (see [`crate::temp_path`]) and are framed per the task's
//! compression: snappy blocks are prefixed with two big-endian u32 sizes
//! (uncompressed, compressed), gzip is one stream per file. Alongside the
//! line bytes, every file gets a sidecar stream of assigned-partition
//! integers so deeper passes never re-derive the assignment by re-parsing.

use std::io::Read;
use std::io::Write;
use std::collections::VecDeque;
use std::path::PathBuf;

use bytes::{Buf, BufMut, Bytes};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::info;

use crate::error::{StorageError, StorageResult, TracedStorageError};
use crate::options::{CancelToken, TransformOptions};
use crate::range::RangeSet;
use crate::temp_path::{TempFilePath, TempFileTag, TextCompression};
use crate::TaskOutcome;

use super::MAX_RECURSION_DEPTH;

/// Derives the target partition of one raw line. Implemented by the
/// ingestion layer, which knows the line format; only the first pass needs
/// it, later passes reuse the persisted assignments.
pub trait PartitionAssigner {
    fn assign(&self, line: &[u8], ranges: &RangeSet) -> StorageResult<usize>;
}

pub struct TextRepartitioner {
    ranges: RangeSet,
    max_fanout: usize,
    tag: TempFileTag,
    compression: TextCompression,
    options: TransformOptions,
}

/// Final text file of one target partition, plus its partition-id sidecar.
pub struct TextPartitionFile {
    pub path: PathBuf,
    pub pid_path: PathBuf,
    pub lines: u32,
}

pub struct TextRepartitionOutput {
    pub partitions: Vec<Option<TextPartitionFile>>,
}

struct TextPassInput {
    data: PathBuf,
    compression: TextCompression,
    /// Partition assignments persisted by the previous pass.
    pids: Option<PathBuf>,
}

struct PendingTextPass {
    folder: PathBuf,
    input: TextPassInput,
    range_start: usize,
    range_count: usize,
    depth: usize,
}

impl TextRepartitioner {
    pub fn new(
        ranges: RangeSet,
        max_fanout: usize,
        tag: TempFileTag,
        compression: TextCompression,
        options: TransformOptions,
    ) -> Self {
        assert!(max_fanout >= 1, "fan-out bound must be positive");
        Self {
            ranges,
            max_fanout,
            tag,
            compression,
            options,
        }
    }

    /// Fan raw text files out into one file per target partition. `inputs`
    /// are uncompressed line files; every produced intermediate and leaf is
    /// compressed per the task's [`TextCompression`].
    pub async fn repartition<A: PartitionAssigner>(
        self,
        inputs: Vec<PathBuf>,
        assigner: &A,
        work_dir: impl Into<PathBuf>,
        cancel: &CancelToken,
    ) -> StorageResult<TaskOutcome<TextRepartitionOutput>> {
        let work_dir = work_dir.into();
        tokio::fs::create_dir_all(&work_dir)
            .await
            .map_err(|e| StorageError::CreateDir(work_dir.display().to_string(), e))?;

        let mut output = TextRepartitionOutput {
            partitions: (0..self.ranges.len()).map(|_| None).collect(),
        };
        let mut guard = crate::bundle::OutputGuard::new();
        let mut uniquifier = 0u32;
        let mut worklist = VecDeque::new();

        for input in inputs {
            let input = TextPassInput {
                data: input,
                compression: TextCompression::Plain,
                pids: None,
            };
            let children = match self
                .process_pass(
                    input,
                    assigner,
                    &work_dir,
                    0,
                    self.ranges.len(),
                    0,
                    &mut output,
                    &mut guard,
                    &mut uniquifier,
                    cancel,
                )
                .await?
            {
                Some(children) => children,
                None => return Ok(TaskOutcome::Canceled),
            };
            worklist.extend(children);
        }

        while let Some(pass) = worklist.pop_front() {
            assert!(
                pass.depth < MAX_RECURSION_DEPTH,
                "text repartition recursion failed to converge"
            );
            let consumed_data = pass.input.data.clone();
            let consumed_pids = pass.input.pids.clone();
            let children = match self
                .process_pass(
                    pass.input,
                    assigner,
                    &pass.folder,
                    pass.range_start,
                    pass.range_count,
                    pass.depth,
                    &mut output,
                    &mut guard,
                    &mut uniquifier,
                    cancel,
                )
                .await?
            {
                Some(children) => children,
                None => return Ok(TaskOutcome::Canceled),
            };
            let _ = tokio::fs::remove_file(&consumed_data).await;
            if let Some(pids) = consumed_pids {
                let _ = tokio::fs::remove_file(&pids).await;
            }
            worklist.extend(children);
        }

        guard.disarm();
        info!(
            partitions = output.partitions.iter().filter(|p| p.is_some()).count(),
            "text repartition complete"
        );
        Ok(TaskOutcome::Completed(output))
    }

    #[allow(clippy::too_many_arguments)]
    async fn process_pass<A: PartitionAssigner>(
        &self,
        input: TextPassInput,
        assigner: &A,
        folder: &PathBuf,
        range_start: usize,
        range_count: usize,
        depth: usize,
        output: &mut TextRepartitionOutput,
        guard: &mut crate::bundle::OutputGuard,
        uniquifier: &mut u32,
        cancel: &CancelToken,
    ) -> StorageResult<Option<Vec<PendingTextPass>>> {
        let per_fragment = range_count.div_ceil(self.max_fanout);
        let fragments = range_count.div_ceil(per_fragment);

        let content = read_text_content(&input.data, input.compression).await?;
        let lines = lines_of(&content);
        let pids = match &input.pids {
            Some(path) => {
                let pids = read_pid_stream(path).await?;
                if pids.len() != lines.len() {
                    return Err(StorageError::TupleCountMismatch(
                        pids.len() as u64,
                        lines.len() as u64,
                    )
                    .into());
                }
                Some(pids)
            }
            None => None,
        };

        let mut writers: Vec<Option<TextFragmentWriter>> = (0..fragments).map(|_| None).collect();
        for (idx, line) in lines.iter().enumerate() {
            if idx % self.options.batch_size == 0 && cancel.is_canceled() {
                return Ok(None);
            }
            let partition = match &pids {
                Some(pids) => pids[idx] as usize,
                None => assigner.assign(line, &self.ranges)?,
            };
            assert!(
                partition >= range_start && partition < range_start + range_count,
                "assigned partition {} outside the pass range",
                partition
            );
            let fragment = (partition - range_start) / per_fragment;
            if writers[fragment].is_none() {
                let first_partition = range_start + fragment * per_fragment;
                let fragment_dir = folder.join(format!("frag_{}", first_partition));
                tokio::fs::create_dir_all(&fragment_dir).await.map_err(|e| {
                    StorageError::CreateDir(fragment_dir.display().to_string(), e)
                })?;
                let name = TempFilePath::new(
                    self.tag,
                    first_partition as u32,
                    *uniquifier,
                    self.compression,
                );
                *uniquifier += 1;
                let writer = TextFragmentWriter::create(
                    name.encode(&fragment_dir),
                    self.compression,
                    self.options.target_block_size,
                )
                .await?;
                guard.track_file(&writer.path);
                guard.track_file(&writer.pid_path);
                writers[fragment] = Some(writer);
            }
            writers[fragment]
                .as_mut()
                .unwrap()
                .write_line(line, partition as u32)
                .await?;
        }

        let mut children = vec![];
        for (fragment, writer) in writers.into_iter().enumerate() {
            let Some(writer) = writer else { continue };
            let first_partition = range_start + fragment * per_fragment;
            let span = per_fragment.min(range_count - fragment * per_fragment);
            let (path, pid_path, lines) = writer.close().await?;
            if span == 1 {
                output.partitions[first_partition] = Some(TextPartitionFile {
                    path,
                    pid_path,
                    lines,
                });
            } else {
                children.push(PendingTextPass {
                    folder: folder.join(format!("frag_{}", first_partition)),
                    input: TextPassInput {
                        data: path,
                        compression: self.compression,
                        pids: Some(pid_path),
                    },
                    range_start: first_partition,
                    range_count: span,
                    depth: depth + 1,
                });
            }
        }
        Ok(Some(children))
    }
}

/// Split `content` into lines, ignoring one trailing newline.
fn lines_of(content: &[u8]) -> Vec<&[u8]> {
    let content = content.strip_suffix(b"\n").unwrap_or(content);
    if content.is_empty() {
        return vec![];
    }
    content.split(|&b| b == b'\n').collect()
}

async fn read_text_content(path: &PathBuf, compression: TextCompression) -> StorageResult<Bytes> {
    let raw = tokio::fs::read(path).await?;
    match compression {
        TextCompression::Plain => Ok(Bytes::from(raw)),
        TextCompression::Gzip => {
            let mut decoder = GzDecoder::new(&raw[..]);
            let mut content = vec![];
            decoder
                .read_to_end(&mut content)
                .map_err(|e| StorageError::Compression(e.to_string()))?;
            Ok(Bytes::from(content))
        }
        TextCompression::Snappy => {
            let mut buf = Bytes::from(raw);
            let mut content = vec![];
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
                content.extend_from_slice(&decompressed);
            }
            Ok(Bytes::from(content))
        }
    }
}

async fn read_pid_stream(path: &PathBuf) -> StorageResult<Vec<u32>> {
    let raw = tokio::fs::read(path).await?;
    if raw.len() % 4 != 0 {
        return Err(TracedStorageError::decode("truncated partition-id stream"));
    }
    Ok(raw
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
        .collect())
}

enum TextEncoder {
    Passthrough,
    Snappy,
    Gzip(GzEncoder<Vec<u8>>),
}

/// One open fragment: the framed line file plus its partition-id sidecar.
struct TextFragmentWriter {
    path: PathBuf,
    pid_path: PathBuf,
    file: BufWriter<tokio::fs::File>,
    pid_file: BufWriter<tokio::fs::File>,
    encoder: TextEncoder,
    buf: Vec<u8>,
    pid_buf: Vec<u8>,
    block_size: usize,
    lines: u32,
}

impl TextFragmentWriter {
    async fn create(
        path: PathBuf,
        compression: TextCompression,
        block_size: usize,
    ) -> StorageResult<Self> {
        let pid_path = pid_path_of(&path);
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;
        let pid_file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&pid_path)
            .await?;
        let encoder = match compression {
            TextCompression::Plain => TextEncoder::Passthrough,
            TextCompression::Snappy => TextEncoder::Snappy,
            TextCompression::Gzip => {
                TextEncoder::Gzip(GzEncoder::new(vec![], Compression::default()))
            }
        };
        Ok(Self {
            path,
            pid_path,
            file: BufWriter::new(file),
            pid_file: BufWriter::new(pid_file),
            encoder,
            buf: vec![],
            pid_buf: vec![],
            block_size,
            lines: 0,
        })
    }

    async fn write_line(&mut self, line: &[u8], partition: u32) -> StorageResult<()> {
        match &mut self.encoder {
            TextEncoder::Gzip(encoder) => {
                encoder
                    .write_all(line)
                    .and_then(|_| encoder.write_all(b"\n"))
                    .map_err(|e| StorageError::Compression(e.to_string()))?;
            }
            _ => {
                self.buf.extend_from_slice(line);
                self.buf.push(b'\n');
            }
        }
        self.pid_buf.put_u32_le(partition);
        self.lines += 1;

        if self.buf.len() >= self.block_size {
            self.flush_block().await?;
        }
        if self.pid_buf.len() >= self.block_size {
            self.pid_file.write_all(&self.pid_buf).await?;
            self.pid_buf.clear();
        }
        Ok(())
    }

    async fn flush_block(&mut self) -> StorageResult<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        match &self.encoder {
            TextEncoder::Passthrough => {
                self.file.write_all(&self.buf).await?;
            }
            TextEncoder::Snappy => {
                let compressed = snap::raw::Encoder::new()
                    .compress_vec(&self.buf)
                    .map_err(|e| StorageError::Compression(e.to_string()))?;
                let mut frame = Vec::with_capacity(8 + compressed.len());
                frame.put_u32(self.buf.len() as u32);
                frame.put_u32(compressed.len() as u32);
                frame.extend_from_slice(&compressed);
                self.file.write_all(&frame).await?;
            }
            TextEncoder::Gzip(_) => unreachable!("gzip lines go through the encoder"),
        }
        self.buf.clear();
        Ok(())
    }

    async fn close(mut self) -> StorageResult<(PathBuf, PathBuf, u32)> {
        self.flush_block().await?;
        if let TextEncoder::Gzip(encoder) = self.encoder {
            let compressed = encoder
                .finish()
                .map_err(|e| StorageError::Compression(e.to_string()))?;
            self.file.write_all(&compressed).await?;
        }
        self.file.flush().await?;
        self.file.into_inner().sync_data().await?;

        self.pid_file.write_all(&self.pid_buf).await?;
        self.pid_file.flush().await?;
        self.pid_file.into_inner().sync_data().await?;
        Ok((self.path, self.pid_path, self.lines))
    }
}

/// Sidecar path of a text file: the data file name plus `.pid`.
pub fn pid_path_of(path: &PathBuf) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".pid");
    name.into()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Lines are `<key>,<payload>`; the key is the leading integer field.
    struct LeadingIntAssigner;

    impl PartitionAssigner for LeadingIntAssigner {
        fn assign(&self, line: &[u8], ranges: &RangeSet) -> StorageResult<usize> {
            let text = std::str::from_utf8(line)
                .map_err(|_| TracedStorageError::decode("line is not utf8"))?;
            let key: i32 = text
                .split(',')
                .next()
                .unwrap()
                .parse()
                .map_err(|_| TracedStorageError::decode("line has no integer key"))?;
            let probe: crate::value::Vector = vec![key].into();
            Ok(ranges.find_partition(&probe, 0))
        }
    }

    async fn run_repartition(
        compression: TextCompression,
        partition_count: i32,
        max_fanout: usize,
    ) -> (tempfile::TempDir, TextRepartitionOutput, Vec<String>) {
        let dir = tempfile::tempdir().unwrap();
        let ranges = RangeSet::new(
            (0..partition_count)
                .map(|i| i * 10)
                .collect::<Vec<i32>>()
                .into(),
        );

        let lines: Vec<String> = (0..120)
            .map(|i| {
                let key = (i * 13) % (partition_count * 10);
                format!("{key},row-{i}")
            })
            .collect();
        let input = dir.path().join("input.txt");
        tokio::fs::write(&input, lines.join("\n")).await.unwrap();

        let repartitioner = TextRepartitioner::new(
            ranges,
            max_fanout,
            TempFileTag {
                node_id: 3,
                group_id: 1,
                fracture_id: 9,
            },
            compression,
            TransformOptions::default_for_test(),
        );
        let output = repartitioner
            .repartition(
                vec![input],
                &LeadingIntAssigner,
                dir.path().join("work"),
                &CancelToken::new(),
            )
            .await
            .unwrap()
            .completed()
            .unwrap();
        (dir, output, lines)
    }

    #[tokio::test]
    async fn test_snappy_repartition_with_recursion() {
        let (_dir, output, lines) = run_repartition(TextCompression::Snappy, 6, 2).await;

        let mut seen = 0;
        for (p, partition) in output.partitions.iter().enumerate() {
            let Some(partition) = partition else { continue };
            seen += partition.lines;

            // provenance survives in the leaf file name
            let parsed = TempFilePath::parse(&partition.path).unwrap();
            assert_eq!(parsed.partition, p as u32);
            assert_eq!(parsed.tag.node_id, 3);

            let content = read_text_content(&partition.path, TextCompression::Snappy)
                .await
                .unwrap();
            let pids = read_pid_stream(&partition.pid_path).await.unwrap();
            let leaf_lines = lines_of(&content);
            assert_eq!(leaf_lines.len(), partition.lines as usize);
            assert_eq!(pids.len(), leaf_lines.len());
            for (line, pid) in leaf_lines.iter().zip(&pids) {
                assert_eq!(*pid as usize, p);
                let key: i32 = std::str::from_utf8(line)
                    .unwrap()
                    .split(',')
                    .next()
                    .unwrap()
                    .parse()
                    .unwrap();
                assert!(key >= (p as i32) * 10 && key < (p as i32 + 1) * 10);
            }
        }
        assert_eq!(seen as usize, lines.len());
    }

    #[tokio::test]
    async fn test_gzip_round_trip() {
        let (_dir, output, lines) = run_repartition(TextCompression::Gzip, 3, 3).await;
        let mut recovered = vec![];
        for partition in output.partitions.iter().flatten() {
            let content = read_text_content(&partition.path, TextCompression::Gzip)
                .await
                .unwrap();
            for line in lines_of(&content) {
                recovered.push(String::from_utf8(line.to_vec()).unwrap());
            }
        }
        recovered.sort();
        let mut expected = lines;
        expected.sort();
        assert_eq!(recovered, expected);
    }
}
