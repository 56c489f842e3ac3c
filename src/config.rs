//! Agent configuration
//!
//! Loaded from TOML. Everything is checked by [`Config::validate`] before any
//! task starts; a broken configuration is fatal.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::bundle::archive::DEFAULT_SIZE_LIMIT_BYTES;
use crate::download::PollerConfig;
use crate::error::{BundleError, Result};
use crate::storage::partition::WILDCARD;
use crate::storage::{Partition, PartitionSet, StoragePath, BUNDLES_PARTITION};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub services: BTreeMap<String, ServiceConfig>,
    #[serde(default)]
    pub bundles: BTreeMap<String, BundleConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory for the on-disk store
    #[serde(default = "default_store_dir")]
    pub dir: PathBuf,

    /// Partition path prefixes, e.g. `/resources/fr/foo/authorization`
    #[serde(default)]
    pub partitions: Vec<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: default_store_dir(),
            partitions: Vec::new(),
        }
    }
}

fn default_store_dir() -> PathBuf {
    PathBuf::from("/var/lib/bundle-agent")
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Status API listen address; absent disables the API
    #[serde(default)]
    pub listen: Option<SocketAddr>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub url: String,

    /// Per-request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,

    /// Static headers sent with every request
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

fn default_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleConfig {
    /// Name of the service to download from
    pub service: String,

    /// Resource path on the service; defaults to `bundles/<name>`
    #[serde(default)]
    pub resource: Option<String>,

    /// Store path the bundle's content is placed under
    #[serde(default = "default_mount")]
    pub mount: String,

    #[serde(default)]
    pub lazy_loading_mode: bool,

    /// Largest single record accepted from the archive
    #[serde(default = "default_size_limit")]
    pub size_limit_bytes: u64,

    #[serde(default)]
    pub polling: PollingConfig,
}

fn default_mount() -> String {
    "/".to_string()
}

fn default_size_limit() -> u64 {
    DEFAULT_SIZE_LIMIT_BYTES
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Trigger {
    #[default]
    Periodic,
    LongPoll,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    #[serde(default)]
    pub trigger: Trigger,

    #[serde(default = "default_min_delay")]
    pub min_delay_seconds: u64,

    #[serde(default = "default_max_delay")]
    pub max_delay_seconds: u64,

    /// Server-side wait for long polling
    #[serde(default)]
    pub long_polling_timeout_seconds: Option<u64>,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            trigger: Trigger::Periodic,
            min_delay_seconds: default_min_delay(),
            max_delay_seconds: default_max_delay(),
            long_polling_timeout_seconds: None,
        }
    }
}

fn default_min_delay() -> u64 {
    60
}
fn default_max_delay() -> u64 {
    120
}

impl Config {
    /// Parse and validate
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| BundleError::config(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| BundleError::config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_toml(&content)
    }

    pub fn validate(&self) -> Result<()> {
        self.partition_set()?;

        for (name, service) in &self.services {
            if service.url.is_empty() {
                return Err(BundleError::config(format!("service {}: url is empty", name)));
            }
        }

        for (name, bundle) in &self.bundles {
            validate_bundle_name(name)?;
            if !self.services.contains_key(&bundle.service) {
                return Err(BundleError::config(format!(
                    "bundle {}: unknown service {}",
                    name, bundle.service
                )));
            }
            StoragePath::parse(&bundle.mount).map_err(|e| {
                BundleError::config(format!("bundle {}: invalid mount: {}", name, e))
            })?;

            let polling = &bundle.polling;
            if polling.max_delay_seconds == 0 {
                return Err(BundleError::config(format!(
                    "bundle {}: max_delay_seconds must be positive",
                    name
                )));
            }
            if polling.min_delay_seconds > polling.max_delay_seconds {
                return Err(BundleError::config(format!(
                    "bundle {}: min_delay_seconds ({}) exceeds max_delay_seconds ({})",
                    name, polling.min_delay_seconds, polling.max_delay_seconds
                )));
            }
            if polling.trigger == Trigger::LongPoll
                && polling.long_polling_timeout_seconds.unwrap_or(0) == 0
            {
                return Err(BundleError::config(format!(
                    "bundle {}: long-poll requires a positive long_polling_timeout_seconds",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Configured partitions, checked for disjointness against each other and
    /// the reserved bundles partition
    pub fn partitions(&self) -> Result<Vec<Partition>> {
        self.store
            .partitions
            .iter()
            .map(|p| {
                Partition::parse(p)
                    .map_err(|e| BundleError::config(format!("invalid partition {}: {}", p, e)))
            })
            .collect()
    }

    fn partition_set(&self) -> Result<PartitionSet> {
        let mut partitions = self.partitions()?;
        partitions.push(
            Partition::parse(BUNDLES_PARTITION).map_err(|e| BundleError::config(e.to_string()))?,
        );
        PartitionSet::new(partitions).map_err(|e| BundleError::config(e.to_string()))
    }

    /// Downloader settings for one configured bundle
    pub fn poller(&self, name: &str) -> Result<PollerConfig> {
        let bundle = self
            .bundles
            .get(name)
            .ok_or_else(|| BundleError::config(format!("unknown bundle {}", name)))?;
        let service = self.services.get(&bundle.service).ok_or_else(|| {
            BundleError::config(format!("bundle {}: unknown service {}", name, bundle.service))
        })?;
        let mount = StoragePath::parse(&bundle.mount)
            .map_err(|e| BundleError::config(format!("bundle {}: invalid mount: {}", name, e)))?;

        Ok(PollerConfig {
            name: name.to_string(),
            resource: bundle
                .resource
                .clone()
                .unwrap_or_else(|| format!("bundles/{}", name)),
            mount,
            trigger: bundle.polling.trigger,
            min_delay: Duration::from_secs(bundle.polling.min_delay_seconds),
            max_delay: Duration::from_secs(bundle.polling.max_delay_seconds),
            long_poll_timeout: bundle
                .polling
                .long_polling_timeout_seconds
                .map(Duration::from_secs),
            request_timeout: Duration::from_secs(service.timeout_seconds),
            lazy: bundle.lazy_loading_mode,
            size_limit: bundle.size_limit_bytes,
        })
    }
}

/// A bundle name becomes one segment of `/system/bundles/<name>`
fn validate_bundle_name(name: &str) -> Result<()> {
    let invalid = || BundleError::config(format!("invalid bundle name {:?}", name));
    let path = StoragePath::parse_relative(name).map_err(|_| invalid())?;
    if path.len() != 1 || name.ends_with('/') || name == WILDCARD {
        return Err(invalid());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = r#"
        [store]
        dir = "/tmp/agent"
        partitions = ["/resources/fr/foo/authorization"]

        [services.test-svc]
        url = "http://localhost:8080"

        [bundles.bundle0]
        service = "test-svc"
        lazy_loading_mode = true
        [bundles.bundle0.polling]
        min_delay_seconds = 1
        max_delay_seconds = 2
    "#;

    #[test]
    fn test_parse_with_defaults() {
        let config = Config::from_toml(BASE).unwrap();
        let poller = config.poller("bundle0").unwrap();
        assert_eq!(poller.resource, "bundles/bundle0");
        assert_eq!(poller.mount, StoragePath::root());
        assert_eq!(poller.trigger, Trigger::Periodic);
        assert_eq!(poller.min_delay, Duration::from_secs(1));
        assert_eq!(poller.request_timeout, Duration::from_secs(30));
        assert!(poller.lazy);
        assert_eq!(poller.size_limit, DEFAULT_SIZE_LIMIT_BYTES);
        assert!(config.api.listen.is_none());
    }

    #[test]
    fn test_polling_defaults() {
        let polling = PollingConfig::default();
        assert_eq!(polling.min_delay_seconds, 60);
        assert_eq!(polling.max_delay_seconds, 120);
    }

    #[test]
    fn test_unknown_trigger_rejected() {
        let toml = BASE.replace("min_delay_seconds = 1", "trigger = \"sometimes\"");
        let err = Config::from_toml(&toml).unwrap_err();
        assert_eq!(err.kind(), "config_error");
    }

    #[test]
    fn test_inverted_delays_rejected() {
        let toml = BASE.replace("min_delay_seconds = 1", "min_delay_seconds = 5");
        let err = Config::from_toml(&toml).unwrap_err();
        assert!(err.to_string().contains("exceeds"));
    }

    #[test]
    fn test_long_poll_requires_timeout() {
        let toml = BASE.replace("min_delay_seconds = 1", "trigger = \"long-poll\"");
        assert!(Config::from_toml(&toml).is_err());

        let toml = BASE.replace(
            "min_delay_seconds = 1",
            "trigger = \"long-poll\"\nlong_polling_timeout_seconds = 10",
        );
        let config = Config::from_toml(&toml).unwrap();
        assert_eq!(
            config.poller("bundle0").unwrap().long_poll_timeout,
            Some(Duration::from_secs(10))
        );
    }

    #[test]
    fn test_overlapping_partitions_rejected() {
        let toml = BASE.replace(
            r#"partitions = ["/resources/fr/foo/authorization"]"#,
            r#"partitions = ["/resources/fr", "/resources/fr/foo"]"#,
        );
        let err = Config::from_toml(&toml).unwrap_err();
        assert_eq!(err.kind(), "config_error");
        assert!(err.to_string().contains("overlap"));
    }

    #[test]
    fn test_reserved_partition_overlap_rejected() {
        let toml = BASE.replace(
            r#"partitions = ["/resources/fr/foo/authorization"]"#,
            r#"partitions = ["/system"]"#,
        );
        assert!(Config::from_toml(&toml).is_err());
    }

    #[test]
    fn test_unknown_service_rejected() {
        let toml = BASE.replace(r#"service = "test-svc""#, r#"service = "nope""#);
        let err = Config::from_toml(&toml).unwrap_err();
        assert!(err.to_string().contains("unknown service"));
    }

    #[test]
    fn test_relative_partition_rejected() {
        let toml = BASE.replace(
            r#"partitions = ["/resources/fr/foo/authorization"]"#,
            r#"partitions = ["resources"]"#,
        );
        assert!(Config::from_toml(&toml).is_err());
    }

    #[test]
    fn test_bundle_names_must_be_single_segments() {
        for bad in ["", ".", "..", "*", "a/b", "a/", "/a"] {
            let toml = BASE
                .replace("[bundles.bundle0]", &format!("[bundles.{:?}]", bad))
                .replace("[bundles.bundle0.polling]", &format!("[bundles.{:?}.polling]", bad));
            let err = Config::from_toml(&toml).unwrap_err();
            assert!(
                err.to_string().contains("invalid bundle name"),
                "{:?} accepted: {}",
                bad,
                err
            );
        }
        let toml = BASE.replace("bundle0", "authz-v2_tenant1");
        assert!(Config::from_toml(&toml).is_ok());
    }
}
