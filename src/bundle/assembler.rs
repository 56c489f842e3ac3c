//! Bundle assembly
//!
//! The [`Assembler`] turns decoded records into documents one record at a
//! time. Eager loading collects everything into a [`DocumentTree`] up front;
//! lazy activation feeds records straight from the archive stream and writes
//! each document as soon as it is produced.

use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

use super::archive::Record;
use super::manifest::{Manifest, SignaturesConfig};
use super::{FileKind, MANIFEST_FILE};
use crate::error::{BundleError, ValidationError};
use crate::storage::StoragePath;

/// A parsed document and the store path it belongs at
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub path: StoragePath,
    pub value: Value,
}

/// Outcome of feeding one record to the assembler
#[derive(Debug)]
pub enum Step {
    /// The manifest was read; roots are now known
    Manifest,
    Signatures,
    Document(Document),
    Skipped,
}

/// Path-addressed documents of an eagerly loaded bundle
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentTree {
    documents: BTreeMap<StoragePath, Value>,
}

impl DocumentTree {
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&StoragePath, &Value)> {
        self.documents.iter()
    }

    fn insert(&mut self, bundle: &str, doc: Document) -> Result<(), ValidationError> {
        if self.documents.contains_key(&doc.path) {
            return Err(ValidationError::new(bundle, "duplicate document path")
                .at_path(doc.path.to_string()));
        }
        self.documents.insert(doc.path, doc.value);
        Ok(())
    }
}

/// Manifest plus documents, fully decoded and validated
#[derive(Debug, Clone)]
pub struct AssembledBundle {
    pub manifest: Manifest,
    pub signatures: Option<SignaturesConfig>,
    pub documents: DocumentTree,
}

/// Record-at-a-time bundle builder
pub struct Assembler {
    bundle: String,
    mount: StoragePath,
    manifest: Option<Manifest>,
    roots: Vec<StoragePath>,
    signatures: Option<SignaturesConfig>,
    documents: usize,
}

impl Assembler {
    pub fn new(bundle: impl Into<String>, mount: StoragePath) -> Self {
        Self {
            bundle: bundle.into(),
            mount,
            manifest: None,
            roots: Vec::new(),
            signatures: None,
            documents: 0,
        }
    }

    pub fn manifest(&self) -> Option<&Manifest> {
        self.manifest.as_ref()
    }

    /// Declared roots placed under the mount point
    pub fn roots(&self) -> &[StoragePath] {
        &self.roots
    }

    /// Documents produced so far
    pub fn document_count(&self) -> usize {
        self.documents
    }

    /// Interpret one record. The manifest must arrive before any document.
    pub fn accept(&mut self, record: Record) -> Result<Step, BundleError> {
        match FileKind::of(&record.path) {
            FileKind::Manifest => {
                if self.manifest.is_some() {
                    return Err(self.invalid("duplicate manifest", &record.path).into());
                }
                let manifest = Manifest::parse(&self.bundle, &record.content)?;
                self.roots = manifest.mounted_roots(&self.bundle, &self.mount)?;
                self.manifest = Some(manifest);
                Ok(Step::Manifest)
            }
            FileKind::Signatures => {
                let signatures = serde_json::from_slice(&record.content)
                    .map_err(|e| self.invalid(&format!("malformed signatures: {}", e), &record.path))?;
                self.signatures = Some(signatures);
                Ok(Step::Signatures)
            }
            FileKind::Json | FileKind::Yaml => self.document(record).map(Step::Document),
            FileKind::Other => {
                debug!(bundle = %self.bundle, path = %record.path, "Skipping non-data file");
                Ok(Step::Skipped)
            }
        }
    }

    fn document(&mut self, record: Record) -> Result<Document, BundleError> {
        if self.manifest.is_none() {
            return Err(self.invalid("data file precedes manifest", &record.path).into());
        }

        let dir = record
            .path
            .rsplit_once('/')
            .map(|(dir, _)| dir)
            .unwrap_or_default();
        let rel = StoragePath::parse_relative(dir.trim_start_matches('/'))
            .map_err(|_| self.invalid("invalid document path", &record.path))?;
        let path = self.mount.join(&rel);

        if !self.roots.iter().any(|root| root.is_prefix_of(&path)) {
            return Err(self.invalid("document path outside manifest roots", &record.path).into());
        }

        let value: Value = match FileKind::of(&record.path) {
            FileKind::Yaml => serde_yaml::from_slice(&record.content)
                .map_err(|e| self.invalid(&format!("malformed YAML: {}", e), &record.path))?,
            _ => serde_json::from_slice(&record.content)
                .map_err(|e| self.invalid(&format!("malformed JSON: {}", e), &record.path))?,
        };

        self.documents += 1;
        Ok(Document { path, value })
    }

    fn invalid(&self, message: &str, path: &str) -> ValidationError {
        ValidationError::new(self.bundle.clone(), message).at_path(path)
    }

    /// Eagerly assemble a complete bundle.
    ///
    /// The manifest may appear anywhere in `records`; it is read first.
    pub fn assemble(mut self, records: Vec<Record>) -> Result<AssembledBundle, BundleError> {
        let mut records = records;
        let manifest_at = records
            .iter()
            .position(|r| r.path == MANIFEST_FILE)
            .ok_or_else(|| {
                ValidationError::new(self.bundle.clone(), "missing manifest").at_path(MANIFEST_FILE)
            })?;
        let manifest = records.remove(manifest_at);
        self.accept(manifest)?;

        let mut tree = DocumentTree::default();
        for record in records {
            if let Step::Document(doc) = self.accept(record)? {
                tree.insert(&self.bundle, doc)?;
            }
        }

        let manifest = self
            .manifest
            .take()
            .ok_or_else(|| ValidationError::new(self.bundle.clone(), "missing manifest"))?;
        Ok(AssembledBundle {
            manifest,
            signatures: self.signatures.take(),
            documents: tree,
        })
    }
}

/// Decode and assemble in one step (eager loading)
pub fn load_eager(
    bundle: &str,
    mount: StoragePath,
    archive: &[u8],
    size_limit: u64,
) -> Result<AssembledBundle, BundleError> {
    let records = super::archive::decode_all(archive, size_limit)?;
    Assembler::new(bundle, mount).assemble(records)
}
