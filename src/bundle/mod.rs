//! Bundles - versioned document packages fetched from a bundle service
//!
//! A bundle archive holds:
//! - `/.manifest`: revision and declared roots (required)
//! - `/.signatures.json`: signature metadata (optional, carried through)
//! - `<dir>/data.json` or `<dir>/data.yaml`: the document stored at `<mount>/<dir>`
//!
//! Anything else in the archive is ignored.

pub mod archive;
pub mod assembler;
pub mod manifest;

use bytes::Bytes;

use crate::storage::StoragePath;

pub use archive::{ArchiveReader, Record};
pub use assembler::{AssembledBundle, Assembler, Document, DocumentTree, Step};
pub use manifest::{Manifest, SignaturesConfig};

pub const MANIFEST_FILE: &str = "/.manifest";
pub const SIGNATURES_FILE: &str = "/.signatures.json";

/// How a record is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Manifest,
    Signatures,
    Json,
    Yaml,
    Other,
}

impl FileKind {
    pub fn of(path: &str) -> Self {
        if path == MANIFEST_FILE {
            return FileKind::Manifest;
        }
        if path == SIGNATURES_FILE {
            return FileKind::Signatures;
        }
        match path.rsplit('/').next() {
            Some("data.json") => FileKind::Json,
            Some("data.yaml") | Some("data.yml") => FileKind::Yaml,
            _ => FileKind::Other,
        }
    }
}

/// A freshly downloaded bundle, consumed by exactly one activation
#[derive(Debug)]
pub struct Bundle {
    pub name: String,
    /// Store path the archive's paths are placed under
    pub mount: StoragePath,
    /// Compressed archive size in bytes
    pub size: u64,
    pub content: BundleContent,
}

#[derive(Debug)]
pub enum BundleContent {
    /// Fully decoded and validated
    Eager(AssembledBundle),
    /// Raw archive, decoded record by record during activation
    Lazy { archive: Bytes, size_limit: u64 },
}

impl Bundle {
    /// Manifest, when already known (eager bundles)
    pub fn manifest(&self) -> Option<&Manifest> {
        match &self.content {
            BundleContent::Eager(assembled) => Some(&assembled.manifest),
            BundleContent::Lazy { .. } => None,
        }
    }

    pub fn is_lazy(&self) -> bool {
        matches!(self.content, BundleContent::Lazy { .. })
    }
}
