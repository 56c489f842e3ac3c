//! Bundle manifest format
//!
//! The manifest is the `.manifest` file at the top of every bundle archive:
//!
//! ```json
//! {"revision": "2024-06-01T10:00:00Z", "roots": ["resources/fr"], "metadata": {}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ValidationError;
use crate::storage::StoragePath;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Manifest {
    /// Opaque revision identifier; equal revisions mean equal content
    #[serde(default)]
    pub revision: String,

    /// Declared roots, relative to the bundle's mount point.
    /// Absent means the bundle owns its whole mount point.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roots: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl Manifest {
    pub fn parse(bundle: &str, bytes: &[u8]) -> Result<Self, ValidationError> {
        let manifest: Manifest = serde_json::from_slice(bytes).map_err(|e| {
            ValidationError::new(bundle, format!("malformed manifest: {}", e))
                .at_path(super::MANIFEST_FILE)
        })?;
        manifest.root_paths(bundle)?;
        Ok(manifest)
    }

    /// Declared roots as relative paths; `[""]` when none are declared
    pub fn root_paths(&self, bundle: &str) -> Result<Vec<StoragePath>, ValidationError> {
        let Some(ref roots) = self.roots else {
            return Ok(vec![StoragePath::root()]);
        };
        let mut paths: Vec<StoragePath> = Vec::with_capacity(roots.len());
        for root in roots {
            let path = StoragePath::parse_relative(root.trim_start_matches('/')).map_err(|_| {
                ValidationError::new(bundle, "invalid manifest root").at_path(root.clone())
            })?;
            if let Some(other) = paths.iter().find(|p| p.overlaps(&path)) {
                return Err(ValidationError::new(
                    bundle,
                    format!("manifest roots overlap with {}", other),
                )
                .at_path(root.clone()));
            }
            paths.push(path);
        }
        Ok(paths)
    }

    /// Roots placed under `mount`
    pub fn mounted_roots(
        &self,
        bundle: &str,
        mount: &StoragePath,
    ) -> Result<Vec<StoragePath>, ValidationError> {
        Ok(self
            .root_paths(bundle)?
            .iter()
            .map(|root| mount.join(root))
            .collect())
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn from_value(value: Value) -> Option<Self> {
        serde_json::from_value(value).ok()
    }
}

/// Optional `.signatures.json` content, retained but not verified here
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SignaturesConfig {
    #[serde(default)]
    pub signatures: Vec<String>,
}
