//! Orchestrator
//!
//! Each configured bundle gets two tasks:
//! - a downloader polling its service and offering every [`Update`] to a
//!   single-slot pending queue
//! - an activation worker taking the newest pending update, running it
//!   through the [`ActivationEngine`] on the blocking pool and recording the
//!   result in the [`StatusRegistry`]
//!
//! A slow activation never blocks downloads. Updates that arrive while one is
//! in flight coalesce: only the latest is applied next, except that a queued
//! bundle is never displaced by a poll result without a bundle. The poller
//! has already cached that bundle's ETag, so dropping it would leave the store
//! behind the server until the next revision.

use chrono::Utc;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::activation::{ActivationEngine, Outcome};
use crate::download::{Downloader, EtagCache, PollerConfig, Transport, Update};
use crate::error::BundleError;
use crate::status::{State, Status, StatusRegistry};

/// What [`PendingUpdate::offer`] did with an update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offered {
    /// The slot was empty
    Queued,
    /// An older unconsumed update was dropped in its favour
    Superseded,
    /// A bundle is waiting; the update carried none and was dropped
    Ignored,
}

/// Single-slot queue. A newer update replaces an unconsumed older one, but
/// only another bundle may replace a queued bundle.
#[derive(Default)]
pub struct PendingUpdate {
    slot: Mutex<Option<Update>>,
    ready: Notify,
}

impl PendingUpdate {
    pub fn offer(&self, update: Update) -> Offered {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        let bundle_queued = matches!(*slot, Some(Update::NewBundle { .. }));
        if bundle_queued && !matches!(update, Update::NewBundle { .. }) {
            return Offered::Ignored;
        }
        let offered = match slot.replace(update) {
            Some(_) => Offered::Superseded,
            None => Offered::Queued,
        };
        drop(slot);
        self.ready.notify_one();
        offered
    }

    pub fn take(&self) -> Option<Update> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

/// Entry point for updates of one bundle
#[derive(Clone)]
pub struct BundleHandle {
    name: String,
    pending: Arc<PendingUpdate>,
}

impl BundleHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn submit(&self, update: Update) -> Offered {
        let offered = self.pending.offer(update);
        match offered {
            Offered::Superseded => debug!(bundle = %self.name, "Superseded a queued update"),
            Offered::Ignored => debug!(bundle = %self.name, "Bundle still queued, update dropped"),
            Offered::Queued => {}
        }
        offered
    }
}

pub struct Orchestrator {
    engine: Arc<ActivationEngine>,
    registry: Arc<StatusRegistry>,
    shutdown: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl Orchestrator {
    pub fn new(engine: Arc<ActivationEngine>, registry: Arc<StatusRegistry>) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            engine,
            registry,
            shutdown,
            tasks: Vec::new(),
        }
    }

    pub fn registry(&self) -> &Arc<StatusRegistry> {
        &self.registry
    }

    pub fn engine(&self) -> &Arc<ActivationEngine> {
        &self.engine
    }

    /// Start polling and activating one bundle
    pub fn start_bundle(&mut self, config: PollerConfig, transport: Arc<dyn Transport>) {
        let downloader = Downloader::new(config.clone(), transport);
        let handle = self.spawn_worker(&config.name, downloader.etag_cache());

        let shutdown = self.shutdown.subscribe();
        let poller = tokio::spawn(async move {
            downloader
                .run(
                    move |update| {
                        handle.submit(update);
                    },
                    shutdown,
                )
                .await;
        });
        self.tasks.push(poller);
    }

    /// Start only the activation worker for `name`; updates are fed through
    /// the returned handle.
    pub fn spawn_worker(&mut self, name: &str, etag: EtagCache) -> BundleHandle {
        let mut status = Status::new(name);
        status.active_revision = self.engine.active_revision(name);
        self.registry.set_status(status);

        let pending = Arc::new(PendingUpdate::default());
        let handle = BundleHandle {
            name: name.to_string(),
            pending: pending.clone(),
        };

        let worker = Worker {
            name: name.to_string(),
            engine: self.engine.clone(),
            registry: self.registry.clone(),
            etag,
        };
        let shutdown = self.shutdown.subscribe();
        self.tasks.push(tokio::spawn(worker.run(pending, shutdown)));

        info!(bundle = %name, "Bundle worker started");
        handle
    }

    /// Cancel polling and wait for in-flight activations to finish
    pub async fn stop(self) {
        info!("Stopping orchestrator");
        let _ = self.shutdown.send(());
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Bundle task ended abnormally");
            }
        }
        info!("Orchestrator stopped");
    }
}

/// Applies updates for one bundle
struct Worker {
    name: String,
    engine: Arc<ActivationEngine>,
    registry: Arc<StatusRegistry>,
    etag: EtagCache,
}

impl Worker {
    async fn run(self, pending: Arc<PendingUpdate>, mut shutdown: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => break,
                _ = pending.ready.notified() => {}
            }
            let Some(update) = pending.take() else {
                continue;
            };
            self.apply(update).await;
        }
        debug!(bundle = %self.name, "Bundle worker stopped");
    }

    async fn apply(&self, update: Update) {
        let now = Utc::now();
        let mut status = self
            .registry
            .get_status(&self.name)
            .unwrap_or_else(|| Status::new(&self.name));
        status.last_request = Some(now);

        match update {
            Update::NotModified => {
                // A network blip that cleared up leaves the active revision valid
                let recovered = status.active_revision.is_some()
                    && status
                        .error
                        .as_ref()
                        .map_or(true, |e| e.kind == "network_error");
                if recovered {
                    status.state = State::Ok;
                    status.error = None;
                }
            }
            Update::Error(e) => {
                self.log_failure(&e);
                status = status.failed(&e);
            }
            Update::NewBundle { bundle, metrics } => {
                status.last_successful_download = Some(now);
                status.size = bundle.size;
                status.metrics = metrics;

                let engine = self.engine.clone();
                let result = tokio::task::spawn_blocking(move || engine.activate(bundle))
                    .await
                    .unwrap_or_else(|e| {
                        Err(BundleError::Transaction(format!("activation task failed: {}", e)))
                    });

                match result {
                    Ok(report) => {
                        status.state = State::Ok;
                        status.error = None;
                        status.active_revision = Some(report.revision);
                        status.metrics.merge(&report.metrics);
                        if let Outcome::Applied { .. } = report.outcome {
                            status.last_successful_activation = Some(Utc::now());
                        }
                    }
                    Err(e) => {
                        self.log_failure(&e);
                        // Force a full download next time
                        self.etag.clear();
                        status = status.failed(&e);
                    }
                }
            }
        }

        self.registry.set_status(status);
    }

    fn log_failure(&self, err: &BundleError) {
        match err {
            BundleError::Network(_) => {
                warn!(bundle = %self.name, error = %err, "Bundle download failed")
            }
            _ => error!(bundle = %self.name, kind = err.kind(), error = %err, "Bundle activation failed"),
        }
    }
}
