//! Partitioned document store
//!
//! The activation engine only touches the store through [`Store::begin`]:
//! every mutation happens inside a [`Transaction`] scoped to a set of
//! partitions, and becomes visible all at once on commit.

pub mod disk;
pub mod partition;
pub mod path;

use serde_json::Value;

use crate::error::StoreError;

pub use disk::{DiskOptions, DiskStore};
pub use partition::{Partition, PartitionSet};
pub use path::StoragePath;

/// Reserved partition holding one subtree per activated bundle
pub const BUNDLES_PARTITION: &str = "/system/bundles/*";

/// Parent of every per-bundle system subtree
pub fn bundles_path() -> StoragePath {
    StoragePath::root().child("system").child("bundles")
}

/// A bundle's system subtree; one concrete partition per bundle
pub fn bundle_path(bundle: &str) -> StoragePath {
    bundles_path().child(bundle)
}

/// Store path of a bundle's activated manifest
pub fn manifest_path(bundle: &str) -> StoragePath {
    bundle_path(bundle).child("manifest")
}

/// Store path of the mount point a bundle was activated under
pub fn mount_path(bundle: &str) -> StoragePath {
    bundle_path(bundle).child("mount")
}

pub trait Store: Send + Sync {
    /// Open a transaction over the partitions containing `paths`.
    ///
    /// Blocks while another transaction holds any of those partitions.
    fn begin(&self, paths: &[StoragePath]) -> Result<Box<dyn Transaction + '_>, StoreError>;

    /// Read the committed value at `path`
    fn read(&self, path: &StoragePath) -> Result<Option<Value>, StoreError>;

    fn partitions(&self) -> &PartitionSet;
}

pub trait Transaction: Send {
    fn write(&mut self, path: &StoragePath, value: &Value) -> Result<(), StoreError>;

    /// Remove `path` and everything below it
    fn delete(&mut self, path: &StoragePath) -> Result<(), StoreError>;

    /// True when `path` was written by this transaction
    fn contains(&self, path: &StoragePath) -> Result<bool, StoreError>;

    fn commit(self: Box<Self>) -> Result<(), StoreError>;

    fn abort(self: Box<Self>);
}
