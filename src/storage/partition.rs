//! Partition declarations
//!
//! A partition is a path prefix the store replaces as one unit. A `*` segment
//! matches any single segment, so `/system/bundles/*` declares one partition
//! per bundle name.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::path::StoragePath;
use crate::error::StoreError;

pub const WILDCARD: &str = "*";

/// A declared partition pattern
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Partition(StoragePath);

impl Partition {
    pub fn new(path: StoragePath) -> Self {
        Self(path)
    }

    pub fn parse(s: &str) -> Result<Self, StoreError> {
        Ok(Self(StoragePath::parse(s)?))
    }

    pub fn pattern(&self) -> &StoragePath {
        &self.0
    }

    /// Concrete partition containing `path`, if `path` falls under this pattern
    pub fn resolve(&self, path: &StoragePath) -> Option<StoragePath> {
        let pattern = self.0.segments();
        let segments = path.segments();
        if segments.len() < pattern.len() {
            return None;
        }
        let matches = pattern
            .iter()
            .zip(segments)
            .all(|(pat, seg)| pat == WILDCARD || pat == seg);
        matches.then(|| path.truncate(pattern.len()))
    }

    /// True when some path could fall under both patterns
    pub fn overlaps(&self, other: &Partition) -> bool {
        self.0
            .segments()
            .iter()
            .zip(other.0.segments())
            .all(|(a, b)| a == WILDCARD || b == WILDCARD || a == b)
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The store's full set of partition patterns; disjoint by construction.
#[derive(Debug, Clone, Default)]
pub struct PartitionSet {
    partitions: Vec<Partition>,
}

impl PartitionSet {
    /// Build a set, rejecting root partitions and overlapping patterns
    pub fn new(partitions: Vec<Partition>) -> Result<Self, StoreError> {
        for (i, a) in partitions.iter().enumerate() {
            if a.pattern().is_root() {
                return Err(StoreError::InvalidPath(
                    "the root path cannot be a partition".to_string(),
                ));
            }
            if let Some(b) = partitions[i + 1..].iter().find(|b| a.overlaps(b)) {
                return Err(StoreError::InvalidPath(format!(
                    "partitions {} and {} overlap",
                    a, b
                )));
            }
        }
        Ok(Self { partitions })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Partition> {
        self.partitions.iter()
    }

    /// Concrete partition that owns `path`
    pub fn resolve(&self, path: &StoragePath) -> Option<StoragePath> {
        self.partitions.iter().find_map(|p| p.resolve(path))
    }
}
