//! Configuration loading tests

use std::time::Duration;
use tempfile::TempDir;

use bundle_agent::config::Trigger;
use bundle_agent::storage::{DiskOptions, DiskStore, StoragePath, Store};
use bundle_agent::Config;

const CONFIG: &str = r#"
[store]
partitions = ["/resources/fr/foo/authorization", "/resources/fr/bar/*"]

[api]
listen = "127.0.0.1:8181"

[services.acme]
url = "https://bundles.example.com"
timeout_seconds = 5
headers = { Authorization = "Bearer secret" }

[bundles.authz]
service = "acme"
resource = "v1/bundles/authz.tar.gz"
mount = "/resources"

[bundles.authz.polling]
trigger = "long-poll"
min_delay_seconds = 10
max_delay_seconds = 20
long_polling_timeout_seconds = 30

[bundles.extra]
service = "acme"
"#;

#[test]
fn test_load_from_file() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("bundle-agent.toml");
    std::fs::write(&file, CONFIG).unwrap();

    let config = Config::load(&file).unwrap();
    assert_eq!(config.bundles.len(), 2);
    assert_eq!(config.api.listen.unwrap().port(), 8181);
    assert_eq!(
        config.services["acme"].headers.get("Authorization").map(String::as_str),
        Some("Bearer secret")
    );

    let authz = config.poller("authz").unwrap();
    assert_eq!(authz.resource, "v1/bundles/authz.tar.gz");
    assert_eq!(authz.mount, StoragePath::parse("/resources").unwrap());
    assert_eq!(authz.trigger, Trigger::LongPoll);
    assert_eq!(authz.long_poll_timeout, Some(Duration::from_secs(30)));
    assert_eq!(authz.request_timeout, Duration::from_secs(5));
    assert!(!authz.lazy);

    let extra = config.poller("extra").unwrap();
    assert_eq!(extra.resource, "bundles/extra");
    assert_eq!(extra.min_delay, Duration::from_secs(60));
    assert_eq!(extra.max_delay, Duration::from_secs(120));
}

#[test]
fn test_missing_file_is_config_error() {
    let dir = TempDir::new().unwrap();
    let err = Config::load(&dir.path().join("absent.toml")).unwrap_err();
    assert_eq!(err.kind(), "config_error");
}

#[test]
fn test_unknown_bundle_has_no_poller() {
    let config = Config::from_toml(CONFIG).unwrap();
    assert!(config.poller("missing").is_err());
}

#[test]
fn test_configured_partitions_open_a_store() {
    let dir = TempDir::new().unwrap();
    let config = Config::from_toml(CONFIG).unwrap();
    let store = DiskStore::open(DiskOptions::new(dir.path(), config.partitions().unwrap())).unwrap();

    let partitions = store.partitions();
    assert!(partitions
        .resolve(&StoragePath::parse("/resources/fr/foo/authorization/x").unwrap())
        .is_some());
    assert!(partitions
        .resolve(&StoragePath::parse("/resources/fr/bar/tenant1/y").unwrap())
        .is_some());
    assert!(partitions
        .resolve(&StoragePath::parse("/system/bundles/authz/manifest").unwrap())
        .is_some());
    assert!(partitions
        .resolve(&StoragePath::parse("/resources/fr/baz").unwrap())
        .is_none());
}
