//! Absolute, slash-separated document paths

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::error::StoreError;

/// Absolute path into the document store, e.g. `/resources/fr/foo`.
///
/// The root path `/` has no segments. Segments are never empty and never
/// contain `/`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct StoragePath(Vec<String>);

impl StoragePath {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn parse(s: &str) -> Result<Self, StoreError> {
        if !s.starts_with('/') {
            return Err(StoreError::InvalidPath(format!("{} (must be absolute)", s)));
        }
        Self::parse_relative(&s[1..])
    }

    /// Parse a path without the leading slash; an empty string is the root.
    pub fn parse_relative(s: &str) -> Result<Self, StoreError> {
        let trimmed = s.trim_end_matches('/');
        if trimmed.is_empty() {
            return Ok(Self::root());
        }
        let mut segments = Vec::new();
        for seg in trimmed.split('/') {
            if seg.is_empty() || seg == "." || seg == ".." {
                return Err(StoreError::InvalidPath(s.to_string()));
            }
            segments.push(seg.to_string());
        }
        Ok(Self(segments))
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// True when `self` equals `other` or is one of its ancestors
    pub fn is_prefix_of(&self, other: &StoragePath) -> bool {
        self.0.len() <= other.0.len() && self.0.iter().zip(&other.0).all(|(a, b)| a == b)
    }

    /// True when either path contains the other
    pub fn overlaps(&self, other: &StoragePath) -> bool {
        self.is_prefix_of(other) || other.is_prefix_of(self)
    }

    pub fn join(&self, other: &StoragePath) -> StoragePath {
        let mut segments = self.0.clone();
        segments.extend(other.0.iter().cloned());
        Self(segments)
    }

    pub fn child(&self, segment: impl Into<String>) -> StoragePath {
        let mut segments = self.0.clone();
        segments.push(segment.into());
        Self(segments)
    }

    /// First `n` segments
    pub fn truncate(&self, n: usize) -> StoragePath {
        Self(self.0[..n.min(self.0.len())].to_vec())
    }

    /// Segments of `self` below `prefix`, if `prefix` is a prefix of `self`
    pub fn strip_prefix(&self, prefix: &StoragePath) -> Option<&[String]> {
        if prefix.is_prefix_of(self) {
            Some(&self.0[prefix.0.len()..])
        } else {
            None
        }
    }

    /// Store key form; descendants of a path share the key plus `/` as prefix.
    pub fn key(&self) -> String {
        self.to_string()
    }

    /// Key prefix shared by every strict descendant
    pub fn descendant_prefix(&self) -> String {
        if self.is_root() {
            "/".to_string()
        } else {
            format!("{}/", self)
        }
    }
}

impl fmt::Display for StoragePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "/");
        }
        for seg in &self.0 {
            write!(f, "/{}", seg)?;
        }
        Ok(())
    }
}

impl FromStr for StoragePath {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for StoragePath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for StoragePath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> StoragePath {
        StoragePath::parse(s).unwrap()
    }

    #[test]
    fn test_parse_and_display() {
        assert_eq!(p("/a/b/c").to_string(), "/a/b/c");
        assert_eq!(p("/").to_string(), "/");
        assert_eq!(p("/a/b/").to_string(), "/a/b");
        assert!(p("/").is_root());
    }

    #[test]
    fn test_parse_rejects_bad_paths() {
        assert!(StoragePath::parse("a/b").is_err());
        assert!(StoragePath::parse("/a//b").is_err());
        assert!(StoragePath::parse("/a/../b").is_err());
    }

    #[test]
    fn test_prefix_relations() {
        assert!(p("/a").is_prefix_of(&p("/a/b")));
        assert!(p("/a/b").is_prefix_of(&p("/a/b")));
        assert!(!p("/a/b").is_prefix_of(&p("/a")));
        assert!(!p("/a/b").is_prefix_of(&p("/a/bc")));
        assert!(p("/").is_prefix_of(&p("/x")));
        assert!(p("/a/b").overlaps(&p("/a")));
        assert!(!p("/a/b").overlaps(&p("/a/c")));
    }

    #[test]
    fn test_join_and_strip() {
        let mount = p("/mnt");
        let joined = mount.join(&StoragePath::parse_relative("x/y").unwrap());
        assert_eq!(joined.to_string(), "/mnt/x/y");
        assert_eq!(joined.strip_prefix(&mount).unwrap(), ["x", "y"]);
    }
}
