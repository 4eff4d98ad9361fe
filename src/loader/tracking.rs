use crate::catalog::{Catalog, UnitBytes, qualified_name};
use crate::loader::{Loader, MemoryLoader, ResourceHandle};
use anyhow::Result;
use std::sync::Arc;
use tracing::{debug, trace};

/// Receives every request a `TrackingLoader` observes.
pub trait LoadObserver: Send + Sync {
    /// A unit was requested by name, whether or not it resolved.
    fn unit_requested(&self, name: &str);

    /// A resource lookup resolved to `resource`.
    fn resource_resolved(&self, resource: &ResourceHandle);
}

/// Decorator that forwards to a delegate loader and reports each request.
pub struct TrackingLoader {
    delegate: Arc<dyn Loader>,
    observer: Arc<dyn LoadObserver>,
}

impl TrackingLoader {
    pub fn new(delegate: Arc<dyn Loader>, observer: Arc<dyn LoadObserver>) -> Self {
        Self { delegate, observer }
    }

    /// Build the loader a capture runs under: every catalog seed is registered
    /// in memory before anything executes, `ambient` handles the rest.
    pub fn seeded(
        catalog: &Catalog,
        ambient: Arc<dyn Loader>,
        observer: Arc<dyn LoadObserver>,
    ) -> Self {
        let memory = MemoryLoader::new(ambient);
        let seeded = memory.seed_from(catalog);
        debug!(seeded, "tracking loader seeded from catalog");
        Self::new(Arc::new(memory), observer)
    }

    fn report_resource(&self, name: &str, resource: &ResourceHandle) {
        // Raw unit bytes read as a resource count as a use of that unit.
        if let Some(unit) = qualified_name(name) {
            self.observer.unit_requested(&unit);
        }
        self.observer.resource_resolved(resource);
    }
}

impl Loader for TrackingLoader {
    fn resolve_unit(&self, name: &str) -> Option<UnitBytes> {
        let resolved = self.delegate.resolve_unit(name);
        trace!(unit = name, found = resolved.is_some(), "unit requested");
        self.observer.unit_requested(name);
        resolved
    }

    fn resolve_resource(&self, name: &str) -> Option<ResourceHandle> {
        let resolved = self.delegate.resolve_resource(name);
        trace!(resource = name, found = resolved.is_some(), "resource requested");
        if let Some(resource) = &resolved {
            self.report_resource(name, resource);
        }
        resolved
    }

    fn resolve_resources(&self, name: &str) -> Vec<ResourceHandle> {
        let resolved = self.delegate.resolve_resources(name);
        for resource in &resolved {
            self.report_resource(name, resource);
        }
        resolved
    }

    fn define_unit(&self, name: &str, content: UnitBytes) -> Result<()> {
        self.delegate.define_unit(name, content)?;
        self.observer.unit_requested(name);
        Ok(())
    }
}
