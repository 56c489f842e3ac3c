//! Status registry
//!
//! One [`Status`] per configured bundle, replaced wholesale on every
//! transition. After each replacement every registered [`StatusListener`]
//! receives a copy of the whole table, synchronously and in registration
//! order. A failing or panicking listener is reported and skipped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{debug, warn};

use crate::error::BundleError;
use crate::metrics::Metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    NotReady,
    Ok,
    Error,
}

/// Last failure, with enough detail to diagnose without logs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusError {
    pub kind: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl StatusError {
    pub fn from_error(err: &BundleError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
            at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub name: String,
    pub state: State,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_revision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_successful_download: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_successful_activation: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_request: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StatusError>,
    /// Compressed size of the last downloaded archive
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub metrics: Metrics,
}

impl Status {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: State::NotReady,
            active_revision: None,
            last_successful_download: None,
            last_successful_activation: None,
            last_request: None,
            error: None,
            size: 0,
            metrics: Metrics::default(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.state == State::Ok
    }

    /// Record a failure; everything else is kept
    pub fn failed(mut self, err: &BundleError) -> Self {
        self.state = State::Error;
        self.error = Some(StatusError::from_error(err));
        self
    }
}

/// Full status table, keyed by bundle name
pub type Snapshot = BTreeMap<String, Status>;

pub trait StatusListener: Send + Sync {
    fn on_status_change(&self, snapshot: &Snapshot) -> anyhow::Result<()>;
}

impl<F> StatusListener for F
where
    F: Fn(&Snapshot) -> anyhow::Result<()> + Send + Sync,
{
    fn on_status_change(&self, snapshot: &Snapshot) -> anyhow::Result<()> {
        self(snapshot)
    }
}

/// Result of one listener invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerOutcome {
    Delivered,
    Failed(String),
    Panicked,
}

#[derive(Default)]
pub struct StatusRegistry {
    statuses: RwLock<Snapshot>,
    listeners: RwLock<Vec<(String, Arc<dyn StatusListener>)>>,
    // Orders dispatch so listeners see snapshots in commit order
    dispatch: Mutex<()>,
}

impl StatusRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace `status.name`'s record and notify listeners.
    ///
    /// Listeners must not call back into `set_status`.
    pub fn set_status(&self, status: Status) -> Vec<(String, ListenerOutcome)> {
        let _dispatch = self.dispatch.lock().unwrap_or_else(PoisonError::into_inner);

        let snapshot = {
            let mut statuses = self.statuses.write().unwrap_or_else(PoisonError::into_inner);
            statuses.insert(status.name.clone(), status);
            statuses.clone()
        };
        self.dispatch(&snapshot)
    }

    pub fn get_status(&self, name: &str) -> Option<Status> {
        self.statuses
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn snapshot(&self) -> Snapshot {
        self.statuses.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Register `listener` under `id`, replacing any listener with that id
    pub fn register_listener(
        &self,
        id: impl Into<String>,
        listener: impl StatusListener + 'static,
    ) {
        let id = id.into();
        let listener: Arc<dyn StatusListener> = Arc::new(listener);
        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        listeners.retain(|(existing, _)| *existing != id);
        debug!(listener = %id, "Registered status listener");
        listeners.push((id, listener));
    }

    pub fn remove_listener(&self, id: &str) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(existing, _)| existing != id);
        listeners.len() != before
    }

    fn dispatch(&self, snapshot: &Snapshot) -> Vec<(String, ListenerOutcome)> {
        let listeners: Vec<(String, Arc<dyn StatusListener>)> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        listeners
            .into_iter()
            .map(|(id, listener)| {
                let outcome =
                    match catch_unwind(AssertUnwindSafe(|| listener.on_status_change(snapshot))) {
                        Ok(Ok(())) => ListenerOutcome::Delivered,
                        Ok(Err(e)) => {
                            warn!(listener = %id, error = %e, "Status listener failed");
                            ListenerOutcome::Failed(e.to_string())
                        }
                        Err(_) => {
                            warn!(listener = %id, "Status listener panicked");
                            ListenerOutcome::Panicked
                        }
                    };
                (id, outcome)
            })
            .collect()
    }
}
