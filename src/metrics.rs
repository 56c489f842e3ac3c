//! Per-load metrics carried in each bundle's status

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

pub const TIMER_DOWNLOAD: &str = "timer_bundle_download_ns";
pub const TIMER_DECODE: &str = "timer_bundle_decode_ns";
pub const TIMER_ACTIVATION: &str = "timer_bundle_activation_ns";
pub const COUNTER_DOCUMENTS: &str = "counter_documents_written";
pub const COUNTER_BYTES: &str = "counter_bundle_bytes";

/// Timers (nanoseconds) and counters for one download + activation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metrics {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub timers: BTreeMap<String, u64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub counters: BTreeMap<String, u64>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, timer: &str, elapsed: Duration) {
        let ns = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        *self.timers.entry(timer.to_string()).or_default() += ns;
    }

    pub fn add(&mut self, counter: &str, n: u64) {
        *self.counters.entry(counter.to_string()).or_default() += n;
    }

    pub fn timer(&self, timer: &str) -> Option<u64> {
        self.timers.get(timer).copied()
    }

    pub fn counter(&self, counter: &str) -> u64 {
        self.counters.get(counter).copied().unwrap_or(0)
    }

    /// Fold `other` into `self`, summing shared keys
    pub fn merge(&mut self, other: &Metrics) {
        for (k, v) in &other.timers {
            *self.timers.entry(k.clone()).or_default() += v;
        }
        for (k, v) in &other.counters {
            *self.counters.entry(k.clone()).or_default() += v;
        }
    }
}
