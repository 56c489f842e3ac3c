//! Bundle archive decoding
//!
//! Bundles are gzip-compressed tar streams. [`ArchiveReader::records`] yields
//! one [`Record`] at a time straight off the decompressor, so a consumer that
//! drops each record before pulling the next holds at most one decoded record
//! regardless of archive size. [`decode_all`] is the eager variant.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{self, Read};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

use crate::error::DecodeError;

/// Default per-record size limit (1 GiB)
pub const DEFAULT_SIZE_LIMIT_BYTES: u64 = 1024 * 1024 * 1024;

/// Largest buffer reserved up front from a header's declared size
const MAX_RECORD_PREALLOCATION: u64 = 64 * 1024 * 1024;

/// One file from the archive
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    /// Normalized archive path, always starting with `/`
    pub path: String,
    pub content: Vec<u8>,
}

/// Counts bytes pulled from the compressed input so errors can carry an offset
struct CountingReader<R> {
    inner: R,
    count: Arc<AtomicU64>,
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }
}

pub struct ArchiveReader<R: Read> {
    archive: tar::Archive<GzDecoder<CountingReader<R>>>,
    consumed: Arc<AtomicU64>,
    size_limit: u64,
}

impl<R: Read> ArchiveReader<R> {
    pub fn new(input: R) -> Self {
        let consumed = Arc::new(AtomicU64::new(0));
        let counting = CountingReader {
            inner: input,
            count: consumed.clone(),
        };
        Self {
            archive: tar::Archive::new(GzDecoder::new(counting)),
            consumed,
            size_limit: DEFAULT_SIZE_LIMIT_BYTES,
        }
    }

    pub fn with_size_limit(mut self, size_limit: u64) -> Self {
        self.size_limit = size_limit;
        self
    }

    /// Stream records in archive order
    pub fn records(&mut self) -> Result<Records<'_, R>, DecodeError> {
        let consumed = self.consumed.clone();
        let size_limit = self.size_limit;
        let entries = self
            .archive
            .entries()
            .map_err(|e| DecodeError::new(e.to_string()).at(consumed.load(Ordering::Relaxed)))?;
        Ok(Records {
            entries,
            consumed,
            size_limit,
            index: 0,
            failed: false,
        })
    }
}

/// Pull-based record sequence; fused after the first error
pub struct Records<'a, R: Read> {
    entries: tar::Entries<'a, GzDecoder<CountingReader<R>>>,
    consumed: Arc<AtomicU64>,
    size_limit: u64,
    index: usize,
    failed: bool,
}

impl<R: Read> Records<'_, R> {
    fn fail(&mut self, index: usize, message: impl Into<String>) -> DecodeError {
        self.failed = true;
        DecodeError::new(message)
            .in_record(index)
            .at(self.consumed.load(Ordering::Relaxed))
    }
}

impl<R: Read> Iterator for Records<'_, R> {
    type Item = Result<Record, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            let mut entry = match self.entries.next()? {
                Ok(entry) => entry,
                Err(e) => {
                    let index = self.index;
                    return Some(Err(self.fail(index, e.to_string())));
                }
            };
            let index = self.index;
            self.index += 1;

            if !entry.header().entry_type().is_file() {
                continue;
            }

            let raw_path = match entry.path() {
                Ok(path) => path.to_string_lossy().into_owned(),
                Err(e) => return Some(Err(self.fail(index, format!("bad entry path: {}", e)))),
            };
            let path = normalize_path(&raw_path);

            let size = entry.size();
            if size > self.size_limit {
                return Some(Err(self.fail(
                    index,
                    format!(
                    "{} exceeds size limit ({} > {} bytes)",
                    path, size, self.size_limit
                ),
                )));
            }

            // The header size is untrusted until the bytes actually arrive
            let mut content = Vec::with_capacity(size.min(MAX_RECORD_PREALLOCATION) as usize);
            if let Err(e) = entry.read_to_end(&mut content) {
                return Some(Err(self.fail(index, format!("{}: {}", path, e))));
            }
            if content.len() as u64 != size {
                return Some(Err(self.fail(
                    index,
                    format!(
                    "{}: truncated record ({} of {} bytes)",
                    path,
                    content.len(),
                    size
                ),
                )));
            }

            trace!(index, path = %path, size, "Decoded record");
            return Some(Ok(Record { path, content }));
        }
    }
}

/// Decode every record before returning; partial output is discarded on error
pub fn decode_all<R: Read>(input: R, size_limit: u64) -> Result<Vec<Record>, DecodeError> {
    let mut reader = ArchiveReader::new(input).with_size_limit(size_limit);
    let records = reader.records()?;
    records.collect()
}

/// `./a/b`, `a/b` and `/a/b` all become `/a/b`
pub fn normalize_path(raw: &str) -> String {
    let trimmed = raw.trim_start_matches("./").trim_start_matches('/');
    format!("/{}", trimmed)
}

/// Build a gzip-compressed tarball from `(path, content)` pairs, in order
pub fn write_tarball<P, C>(files: impl IntoIterator<Item = (P, C)>) -> io::Result<Vec<u8>>
where
    P: AsRef<str>,
    C: AsRef<[u8]>,
{
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (path, content) in files {
        let content = content.as_ref();
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        builder.append_data(&mut header, path.as_ref().trim_start_matches('/'), content)?;
    }
    builder.into_inner()?.finish()
}
