//! Bundle activation
//!
//! The [`ActivationEngine`] replaces the store content under a bundle's roots
//! with the bundle's documents inside a single transaction. Each bundle name
//! has its own slot, locked for the whole activation, so activations of one
//! bundle are strictly serialized while different bundles proceed in
//! parallel (serialized by the store only when they share a partition).
//!
//! Activation is blocking; async callers run it on the blocking pool.
//!
//! Per bundle name:
//!
//! ```text
//!   Idle -> Activating -> Applied -> Idle
//!                     \-> Failed  -> Idle
//! ```

use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::bundle::{ArchiveReader, Assembler, Bundle, BundleContent, Manifest, Step};
use crate::error::{BundleError, ValidationError};
use crate::metrics::{Metrics, COUNTER_DOCUMENTS, TIMER_ACTIVATION};
use crate::storage::{
    bundle_path, bundles_path, manifest_path, mount_path, Store, StoragePath, Transaction,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Phase {
    Idle,
    Activating,
    Applied,
    Failed,
}

/// Published on every phase transition
#[derive(Debug, Clone)]
pub struct PhaseChange {
    pub bundle: String,
    pub phase: Phase,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// New content committed
    Applied { documents: usize },
    /// Same revision already active; the store was not touched
    Unchanged,
}

#[derive(Debug, Clone)]
pub struct ActivationReport {
    pub revision: String,
    pub outcome: Outcome,
    pub metrics: Metrics,
}

/// What the engine remembers about an active bundle
#[derive(Debug, Clone)]
struct Active {
    manifest: Manifest,
    mount: StoragePath,
    roots: Vec<StoragePath>,
}

struct Slot {
    active: Option<Active>,
}

pub struct ActivationEngine {
    store: Arc<dyn Store>,
    slots: Mutex<HashMap<String, Arc<Mutex<Slot>>>>,
    /// Roots claimed by each bundle, including in-flight activations
    claims: Mutex<HashMap<String, Vec<StoragePath>>>,
    /// Current phase per bundle, kept outside the slots so it can be read
    /// while an activation holds its slot
    current: Mutex<HashMap<String, Phase>>,
    phases: broadcast::Sender<PhaseChange>,
}

impl ActivationEngine {
    /// Build an engine, picking up bundles activated by earlier runs
    pub fn new(store: Arc<dyn Store>) -> Result<Self, BundleError> {
        let (phases, _) = broadcast::channel(64);
        let engine = Self {
            store,
            slots: Mutex::new(HashMap::new()),
            claims: Mutex::new(HashMap::new()),
            current: Mutex::new(HashMap::new()),
            phases,
        };
        engine.load_active()?;
        Ok(engine)
    }

    fn load_active(&self) -> Result<(), BundleError> {
        let Some(Value::Object(bundles)) = self.store.read(&bundles_path())? else {
            return Ok(());
        };

        for (name, record) in bundles {
            let manifest = record.get("manifest").cloned().and_then(Manifest::from_value);
            let mount = record
                .get("mount")
                .and_then(Value::as_str)
                .and_then(|m| StoragePath::parse(m).ok());
            let (Some(manifest), Some(mount)) = (manifest, mount) else {
                warn!(bundle = %name, "Ignoring unreadable stored manifest");
                continue;
            };
            let roots = manifest.mounted_roots(&name, &mount)?;

            info!(bundle = %name, revision = %manifest.revision, "Found active bundle");
            self.claims_lock().insert(name.clone(), roots.clone());
            self.slot(&name)
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .active = Some(Active {
                manifest,
                mount,
                roots,
            });
        }
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PhaseChange> {
        self.phases.subscribe()
    }

    pub fn phase(&self, name: &str) -> Phase {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .copied()
            .unwrap_or(Phase::Idle)
    }

    /// Revision of the last successful activation.
    ///
    /// Waits for an in-flight activation of `name` to finish.
    pub fn active_revision(&self, name: &str) -> Option<String> {
        self.slot(name)
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .active
            .as_ref()
            .map(|a| a.manifest.revision.clone())
    }

    /// Names of bundles with committed content, sorted
    pub fn active_bundles(&self) -> Vec<String> {
        let slots: Vec<(String, Arc<Mutex<Slot>>)> = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, slot)| (name.clone(), slot.clone()))
            .collect();
        let mut names: Vec<String> = slots
            .into_iter()
            .filter(|(_, slot)| {
                slot.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .active
                    .is_some()
            })
            .map(|(name, _)| name)
            .collect();
        names.sort();
        names
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    fn slot(&self, name: &str) -> Arc<Mutex<Slot>> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(Slot { active: None }))
            })
            .clone()
    }

    fn claims_lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<StoragePath>>> {
        self.claims.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, bundle: &str, phase: Phase) {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(bundle.to_string(), phase);
        let _ = self.phases.send(PhaseChange {
            bundle: bundle.to_string(),
            phase,
        });
    }

    /// Activate `bundle`, consuming it.
    ///
    /// On error the store is exactly as it was before the call.
    pub fn activate(&self, bundle: Bundle) -> Result<ActivationReport, BundleError> {
        let slot = self.slot(&bundle.name);
        let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
        let name = bundle.name.clone();

        self.publish(&name, Phase::Activating);
        let started = Instant::now();

        let result = match bundle.content {
            BundleContent::Eager(assembled) => {
                let documents = assembled.documents;
                self.apply(&mut slot, &name, &bundle.mount, assembled.manifest, |txn| {
                    for (path, value) in documents.iter() {
                        txn.write(path, value)?;
                    }
                    Ok(documents.len())
                })
            }
            BundleContent::Lazy {
                archive,
                size_limit,
            } => self.activate_lazy(&mut slot, &name, &bundle.mount, &archive, size_limit),
        };

        match result {
            Ok((revision, outcome)) => {
                self.publish(&name, Phase::Applied);
                self.publish(&name, Phase::Idle);

                let mut metrics = Metrics::new();
                metrics.record(TIMER_ACTIVATION, started.elapsed());
                if let Outcome::Applied { documents } = outcome {
                    metrics.add(COUNTER_DOCUMENTS, documents as u64);
                }
                Ok(ActivationReport {
                    revision,
                    outcome,
                    metrics,
                })
            }
            Err(e) => {
                self.publish(&name, Phase::Failed);
                self.publish(&name, Phase::Idle);
                Err(e)
            }
        }
    }

    /// Stream records from the archive straight into the transaction
    fn activate_lazy(
        &self,
        slot: &mut Slot,
        name: &str,
        mount: &StoragePath,
        archive: &[u8],
        size_limit: u64,
    ) -> Result<(String, Outcome), BundleError> {
        let mut reader = ArchiveReader::new(archive).with_size_limit(size_limit);
        let mut records = reader.records()?;
        let mut assembler = Assembler::new(name, mount.clone());

        // Everything up to the manifest; data records here are rejected
        let manifest = loop {
            let Some(record) = records.next() else {
                return Err(ValidationError::new(name, "missing manifest")
                    .at_path(crate::bundle::MANIFEST_FILE)
                    .into());
            };
            if let Step::Manifest = assembler.accept(record?)? {
                if let Some(manifest) = assembler.manifest() {
                    break manifest.clone();
                }
            }
        };

        self.apply(slot, name, mount, manifest, |txn| {
            for record in records.by_ref() {
                match assembler.accept(record?)? {
                    Step::Document(doc) => {
                        if txn.contains(&doc.path)? {
                            return Err(ValidationError::new(name, "duplicate document path")
                                .at_path(doc.path.to_string())
                                .into());
                        }
                        txn.write(&doc.path, &doc.value)?;
                    }
                    Step::Manifest | Step::Signatures | Step::Skipped => {}
                }
            }
            Ok(assembler.document_count())
        })
    }

    /// Validate roots, then replace their content inside one transaction.
    ///
    /// `fill` writes the documents; any error it returns aborts the
    /// transaction.
    fn apply<F>(
        &self,
        slot: &mut Slot,
        name: &str,
        mount: &StoragePath,
        manifest: Manifest,
        fill: F,
    ) -> Result<(String, Outcome), BundleError>
    where
        F: FnOnce(&mut dyn Transaction) -> Result<usize, BundleError>,
    {
        let revision = manifest.revision.clone();
        if let Some(ref active) = slot.active {
            if !revision.is_empty()
                && active.manifest.revision == revision
                && active.mount == *mount
            {
                debug!(bundle = %name, revision = %revision, "Revision already active");
                return Ok((revision, Outcome::Unchanged));
            }
        }

        let roots = manifest.mounted_roots(name, mount)?;
        let previous: Vec<StoragePath> = slot
            .active
            .as_ref()
            .map(|a| a.roots.clone())
            .unwrap_or_default();
        self.claim(name, &roots, &previous)?;

        let result = self.write(name, mount, &manifest, &roots, &previous, fill);

        let mut claims = self.claims_lock();
        match result {
            Ok(documents) => {
                claims.insert(name.to_string(), roots.clone());
                drop(claims);
                info!(bundle = %name, revision = %revision, documents, "Bundle activated");
                slot.active = Some(Active {
                    manifest,
                    mount: mount.clone(),
                    roots,
                });
                Ok((revision, Outcome::Applied { documents }))
            }
            Err(e) => {
                if previous.is_empty() {
                    claims.remove(name);
                } else {
                    claims.insert(name.to_string(), previous);
                }
                Err(e)
            }
        }
    }

    /// Reserve `roots` for `name`, failing if another bundle owns any of them
    fn claim(
        &self,
        name: &str,
        roots: &[StoragePath],
        previous: &[StoragePath],
    ) -> Result<(), BundleError> {
        let reserved = bundles_path();
        for root in roots {
            if root.overlaps(&reserved) {
                return Err(ValidationError::new(name, "root overlaps reserved system path")
                    .at_path(root.to_string())
                    .into());
            }
            if self.store.partitions().resolve(root).is_none() {
                return Err(ValidationError::new(name, "root is not inside a configured partition")
                    .at_path(root.to_string())
                    .into());
            }
        }

        let mut claims = self.claims_lock();
        for (other, owned) in claims.iter() {
            if other == name {
                continue;
            }
            if let Some(root) = roots.iter().find(|r| owned.iter().any(|o| o.overlaps(r))) {
                return Err(ValidationError::new(
                    name,
                    format!("root conflicts with bundle {}", other),
                )
                .at_path(root.to_string())
                .into());
            }
        }

        let mut claimed = previous.to_vec();
        claimed.extend(roots.iter().filter(|r| !previous.contains(r)).cloned());
        claims.insert(name.to_string(), claimed);
        Ok(())
    }

    fn write<F>(
        &self,
        name: &str,
        mount: &StoragePath,
        manifest: &Manifest,
        roots: &[StoragePath],
        previous: &[StoragePath],
        fill: F,
    ) -> Result<usize, BundleError>
    where
        F: FnOnce(&mut dyn Transaction) -> Result<usize, BundleError>,
    {
        let mut scope: Vec<StoragePath> = roots.to_vec();
        scope.extend(previous.iter().cloned());
        scope.push(manifest_path(name));

        let mut txn = self.store.begin(&scope)?;
        let filled = (|| {
            for root in roots.iter().chain(previous) {
                txn.delete(root)?;
            }
            let documents = fill(txn.as_mut())?;
            txn.write(&manifest_path(name), &manifest.to_value())?;
            txn.write(&mount_path(name), &Value::String(mount.to_string()))?;
            Ok::<_, BundleError>(documents)
        })();

        match filled {
            Ok(documents) => {
                txn.commit()?;
                Ok(documents)
            }
            Err(e) => {
                txn.abort();
                Err(e)
            }
        }
    }

    /// Remove a bundle's content and its stored manifest in one transaction.
    ///
    /// Returns false when the bundle was not active.
    pub fn deactivate(&self, name: &str) -> Result<bool, BundleError> {
        let slot = self.slot(name);
        let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(active) = slot.active.clone() else {
            return Ok(false);
        };

        let mut scope = active.roots.clone();
        scope.push(manifest_path(name));
        let mut txn = self.store.begin(&scope)?;
        let cleared = (|| {
            for root in &active.roots {
                txn.delete(root)?;
            }
            txn.delete(&bundle_path(name))?;
            Ok::<_, BundleError>(())
        })();
        match cleared {
            Ok(()) => txn.commit()?,
            Err(e) => {
                txn.abort();
                return Err(e);
            }
        }

        self.claims_lock().remove(name);
        slot.active = None;
        info!(bundle = %name, "Bundle deactivated");
        Ok(true)
    }
}
