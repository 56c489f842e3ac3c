//! Shared fixtures for integration tests

#![allow(dead_code)]

use bytes::Bytes;
use std::path::Path;
use std::sync::Arc;

use bundle_agent::bundle::archive::{write_tarball, DEFAULT_SIZE_LIMIT_BYTES};
use bundle_agent::bundle::assembler::load_eager;
use bundle_agent::bundle::{Bundle, BundleContent};
use bundle_agent::storage::{DiskOptions, DiskStore, Partition, StoragePath, Store};

pub const AUTHZ_ROOT: &str = "/resources/fr/foo/authorization";

pub fn path(s: &str) -> StoragePath {
    StoragePath::parse(s).unwrap()
}

pub fn open_store(dir: &Path, partitions: &[&str]) -> Arc<dyn Store> {
    let partitions = partitions
        .iter()
        .map(|p| Partition::parse(p).unwrap())
        .collect();
    Arc::new(DiskStore::open(DiskOptions::new(dir, partitions)).unwrap())
}

/// Tarball with the manifest first, then `docs` as `(dir, json)` pairs
pub fn tarball(revision: &str, roots: &[&str], docs: Vec<(String, String)>) -> Vec<u8> {
    let manifest = serde_json::json!({ "revision": revision, "roots": roots }).to_string();
    let mut files = vec![("/.manifest".to_string(), manifest)];
    files.extend(
        docs.into_iter()
            .map(|(dir, json)| (format!("{}/data.json", dir.trim_end_matches('/')), json)),
    );
    write_tarball(files).unwrap()
}

/// `n` small documents under the authorization root, named like `17a3f2`
pub fn authz_docs(n: usize, revision: &str) -> Vec<(String, String)> {
    (0..n)
        .map(|i| {
            let suffix = (i as u64).wrapping_mul(2_654_435_761) & 0xffff;
            (
                format!("{}/{}{:04x}", AUTHZ_ROOT, i, suffix),
                format!(r#"{{"id": {}, "revision": "{}", "allow": true}}"#, i, revision),
            )
        })
        .collect()
}

pub fn authz_tarball(n: usize, revision: &str) -> Vec<u8> {
    tarball(
        revision,
        &[AUTHZ_ROOT.trim_start_matches('/')],
        authz_docs(n, revision),
    )
}

pub fn eager_bundle(name: &str, archive: &[u8]) -> Bundle {
    let assembled =
        load_eager(name, StoragePath::root(), archive, DEFAULT_SIZE_LIMIT_BYTES).unwrap();
    Bundle {
        name: name.to_string(),
        mount: StoragePath::root(),
        size: archive.len() as u64,
        content: BundleContent::Eager(assembled),
    }
}

pub fn lazy_bundle(name: &str, archive: Vec<u8>) -> Bundle {
    Bundle {
        name: name.to_string(),
        mount: StoragePath::root(),
        size: archive.len() as u64,
        content: BundleContent::Lazy {
            archive: Bytes::from(archive),
            size_limit: DEFAULT_SIZE_LIMIT_BYTES,
        },
    }
}
