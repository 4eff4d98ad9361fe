//! The capture result: concurrent maps of what a traced run touched.
//!
//! Discoveries arrive from whichever thread the traced program happens to be
//! running on. Each one is inserted under a short lock and, only when the key
//! is new, handed to the matching sink after the lock is released. A channel
//! without a sink accumulates nothing.

use crate::capture::policy::InclusionPolicy;
use crate::capture::sink::Sink;
use crate::capture::task::Task;
use crate::catalog::{Catalog, CatalogEntry, DiscoveryKey, UnitBytes};
use crate::error::CaptureError;
use crate::loader::{LoadObserver, ResourceHandle};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace, warn};

/// A resolved non-code resource backed by a regular file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CapturedResource {
    /// Name the program asked for, e.g. `config.properties`.
    pub name: String,
    /// Absolute path of the backing file.
    pub path: PathBuf,
    pub content: UnitBytes,
}

pub(crate) struct Discoveries {
    catalog: Arc<Catalog>,
    units: Mutex<BTreeMap<DiscoveryKey, Arc<CatalogEntry>>>,
    resources: Mutex<BTreeMap<PathBuf, CapturedResource>>,
    store: Option<PathBuf>,
    unit_sink: Option<Arc<dyn Sink>>,
    resource_sink: Option<Arc<dyn Sink>>,
    closed: AtomicBool,
}

impl Discoveries {
    pub(crate) fn new(
        catalog: Arc<Catalog>,
        store: Option<PathBuf>,
        unit_sink: Option<Arc<dyn Sink>>,
        resource_sink: Option<Arc<dyn Sink>>,
    ) -> Self {
        Self {
            catalog,
            units: Mutex::new(BTreeMap::new()),
            resources: Mutex::new(BTreeMap::new()),
            store,
            unit_sink,
            resource_sink,
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Record the catalog entry seeded for `name`, if there is one.
    pub(crate) fn put(&self, name: &str) -> Option<Arc<CatalogEntry>> {
        if self.is_closed() {
            return None;
        }
        let Some(entry) = self.catalog.seed_for(name).cloned() else {
            trace!(unit = name, "requested unit is not in the catalog");
            return None;
        };
        self.record_unit(&entry);
        Some(entry)
    }

    fn record_unit(&self, entry: &Arc<CatalogEntry>) {
        let Some(sink) = &self.unit_sink else {
            return;
        };
        let inserted = {
            let mut units = lock(&self.units);
            if self.is_closed() || units.contains_key(&entry.key) {
                false
            } else {
                units.insert(entry.key.clone(), entry.clone());
                true
            }
        };
        if !inserted {
            return;
        }
        debug!(unit = %entry.name, key = %entry.key, "unit captured");
        if let Err(err) = sink.accept(
            self.store.as_deref(),
            entry.key.as_str(),
            &entry.relative_path,
            &entry.content,
        ) {
            warn!(unit = %entry.name, error = %format!("{err:#}"), "unit sink failed; skipping");
        }
    }

    /// Record a resolved resource. Anything but an existing regular file is
    /// ignored, as is a file that cannot be read.
    pub(crate) fn put_resource(&self, resource: &ResourceHandle) {
        if self.is_closed() {
            return;
        }
        let Some(sink) = &self.resource_sink else {
            return;
        };
        let Some(file) = resource.regular_file() else {
            trace!(resource = %resource.name, "resource is not a regular file");
            return;
        };
        let path = resolved(file);
        if let Some(store) = &self.store {
            let store = resolved(store);
            if path.starts_with(&store) {
                trace!(resource = %resource.name, "resource already materialized");
                return;
            }
        }
        if lock(&self.resources).contains_key(&path) {
            return;
        }

        let content = match resource.read() {
            Ok(content) => UnitBytes::from(content),
            Err(err) => {
                warn!(resource = %resource.name, path = %path.display(), error = %err, "unreadable resource; skipping");
                return;
            }
        };
        let captured = CapturedResource {
            name: resource.name.trim_start_matches('/').to_string(),
            path: path.clone(),
            content,
        };

        let inserted = {
            let mut resources = lock(&self.resources);
            if self.is_closed() || resources.contains_key(&path) {
                false
            } else {
                resources.insert(path.clone(), captured.clone());
                true
            }
        };
        if !inserted {
            return;
        }
        debug!(resource = %captured.name, path = %path.display(), "resource captured");
        let key = DiscoveryKey::for_path(&path);
        if let Err(err) = sink.accept(
            self.store.as_deref(),
            key.as_str(),
            &captured.name,
            &captured.content,
        ) {
            warn!(resource = %captured.name, error = %format!("{err:#}"), "resource sink failed; skipping");
        }
    }

    pub(crate) fn has_units(&self) -> bool {
        !lock(&self.units).is_empty()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        lock(&self.units).clear();
        lock(&self.resources).clear();
    }
}

/// Canonical form of `path`, or its absolute form when it does not exist yet.
fn resolved(path: &Path) -> PathBuf {
    fs::canonicalize(path)
        .or_else(|_| std::path::absolute(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Bridges tracking-loader notifications into a capture, applying the
/// inclusion policy to unit requests.
pub(crate) struct CaptureObserver {
    discoveries: Arc<Discoveries>,
    policy: InclusionPolicy,
}

impl CaptureObserver {
    pub(crate) fn new(discoveries: Arc<Discoveries>, policy: InclusionPolicy) -> Self {
        Self {
            discoveries,
            policy,
        }
    }
}

impl LoadObserver for CaptureObserver {
    fn unit_requested(&self, name: &str) {
        if self.policy.admits(name) {
            self.discoveries.put(name);
        } else {
            trace!(unit = name, "excluded by inclusion policy");
        }
    }

    fn resource_resolved(&self, resource: &ResourceHandle) {
        self.discoveries.put_resource(resource);
    }
}

/// Handle on an in-flight or finished capture.
///
/// The background task keeps filling the maps while the caller holds this;
/// [`Capture::wait`] blocks until it is done and reports its outcome.
pub struct Capture {
    discoveries: Arc<Discoveries>,
    task: Option<Task>,
}

impl Capture {
    pub(crate) fn new(discoveries: Arc<Discoveries>, task: Option<Task>) -> Self {
        Self { discoveries, task }
    }

    /// Snapshot of the captured units, keyed by discovery key.
    pub fn units(&self) -> BTreeMap<DiscoveryKey, Arc<CatalogEntry>> {
        lock(&self.discoveries.units).clone()
    }

    pub fn unit_names(&self) -> BTreeSet<String> {
        lock(&self.discoveries.units)
            .values()
            .map(|entry| entry.name.clone())
            .collect()
    }

    /// Snapshot of the captured resources, keyed by absolute path.
    pub fn resources(&self) -> BTreeMap<PathBuf, CapturedResource> {
        lock(&self.discoveries.resources).clone()
    }

    pub fn store(&self) -> Option<&Path> {
        self.discoveries.store.as_deref()
    }

    pub fn catalog(&self) -> &Catalog {
        self.discoveries.catalog()
    }

    /// Capture `name` explicitly, outside of any traced execution.
    pub fn load(&self, name: &str) -> Result<Option<Arc<CatalogEntry>>, CaptureError> {
        self.ensure_open()?;
        Ok(self.discoveries.put(name))
    }

    /// Capture every name in `names` that the catalog knows about and return
    /// the entries that were found.
    pub fn load_all<I, S>(&self, names: I) -> Result<Vec<Arc<CatalogEntry>>, CaptureError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.ensure_open()?;
        let wanted: BTreeSet<String> = names
            .into_iter()
            .map(|name| name.as_ref().to_string())
            .collect();
        Ok(wanted
            .iter()
            .filter_map(|name| self.discoveries.put(name))
            .collect())
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(Task::is_finished)
    }

    /// Block until the background work (both passes) is over.
    pub fn wait(&self) -> Result<(), CaptureError> {
        self.ensure_open()?;
        match &self.task {
            Some(task) => task.join(),
            None => Ok(()),
        }
    }

    /// Cancel the background work and drop everything captured so far.
    /// The capture cannot be used afterwards.
    pub fn close(&self) {
        if let Some(task) = &self.task {
            task.close();
        }
        self.discoveries.close();
        debug!("capture closed");
    }

    pub fn is_closed(&self) -> bool {
        self.discoveries.is_closed()
    }

    fn ensure_open(&self) -> Result<(), CaptureError> {
        if self.is_closed() {
            return Err(CaptureError::Closed);
        }
        Ok(())
    }
}
