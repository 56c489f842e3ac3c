//! Error types for bundle-agent
//!
//! `BundleError` is the taxonomy every component reports through. Everything
//! except `Config` is recoverable: the orchestrator records it in the bundle's
//! status and keeps polling.

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum BundleError {
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl BundleError {
    /// Stable identifier exposed in status records
    pub fn kind(&self) -> &'static str {
        match self {
            BundleError::Network(_) => "network_error",
            BundleError::Decode(_) => "decode_error",
            BundleError::Validation(_) => "validation_error",
            BundleError::Transaction(_) => "transaction_error",
            BundleError::Config(_) => "config_error",
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        BundleError::Config(msg.into())
    }
}

impl From<StoreError> for BundleError {
    fn from(e: StoreError) -> Self {
        BundleError::Transaction(e.to_string())
    }
}

/// Transport failure. Transient: retried with backoff, never touches the store.
#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct NetworkError {
    pub status: Option<u16>,
    pub message: String,
}

impl NetworkError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
        }
    }

    pub fn with_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
        }
    }
}

/// Malformed or truncated archive
#[derive(Error, Debug, Clone)]
pub struct DecodeError {
    /// Byte offset into the compressed stream, when known
    pub offset: Option<u64>,
    /// Zero-based index of the record being decoded
    pub record: Option<usize>,
    pub message: String,
}

impl DecodeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            offset: None,
            record: None,
            message: message.into(),
        }
    }

    pub fn at(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn in_record(mut self, record: usize) -> Self {
        self.record = Some(record);
        self
    }
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(record) = self.record {
            write!(f, " (record {})", record)?;
        }
        if let Some(offset) = self.offset {
            write!(f, " (offset {})", offset)?;
        }
        Ok(())
    }
}

/// Manifest or path violation in a bundle
#[derive(Error, Debug, Clone)]
pub struct ValidationError {
    pub bundle: String,
    /// First offending path, if the failure is tied to one
    pub path: Option<String>,
    pub message: String,
}

impl ValidationError {
    pub fn new(bundle: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            bundle: bundle.into(),
            path: None,
            message: message.into(),
        }
    }

    pub fn at_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "bundle {}: {}", self.bundle, self.message)?;
        if let Some(ref path) = self.path {
            write!(f, ": {}", path)?;
        }
        Ok(())
    }
}

/// Storage layer errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sled::Error),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Path {0} is outside the transaction's partitions")]
    OutsidePartitions(String),

    #[error("Path {0} is not covered by any partition")]
    NoPartition(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt store: {0}")]
    Corrupt(String),

    #[error("Commit failed: {0}")]
    Commit(String),
}

pub type Result<T> = std::result::Result<T, BundleError>;
