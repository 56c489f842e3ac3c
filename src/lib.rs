//! bundle-agent: keeps a partitioned document store in sync with remote
//! configuration bundles
//!
//! Data flow per bundle:
//!
//! ```text
//! Downloader -> Archive decoder -> Assembler -> ActivationEngine -> Store
//!                                                      |
//!                                               StatusRegistry -> listeners
//! ```

pub mod activation;
pub mod api;
pub mod bundle;
pub mod config;
pub mod download;
pub mod error;
pub mod metrics;
pub mod orchestrator;
pub mod status;
pub mod storage;

pub use activation::{ActivationEngine, ActivationReport, Outcome, Phase, PhaseChange};
pub use config::Config;
pub use error::{BundleError, Result};
pub use orchestrator::Orchestrator;
pub use status::{Status, StatusRegistry};
