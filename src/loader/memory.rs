use crate::catalog::{Catalog, UnitBytes, qualified_name};
use crate::loader::{Loader, ResourceHandle, ResourceLocation};
use anyhow::Result;
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Units held in memory, with a parent for everything else.
///
/// Unit content requested as a resource (`com/acme/Demo.unit`) is answered
/// from memory only; other resources always come from the parent because the
/// catalog never indexes them.
pub struct MemoryLoader {
    units: RwLock<BTreeMap<String, UnitBytes>>,
    parent: Arc<dyn Loader>,
}

impl MemoryLoader {
    pub fn new(parent: Arc<dyn Loader>) -> Self {
        Self {
            units: RwLock::new(BTreeMap::new()),
            parent,
        }
    }

    pub fn add_unit(&self, name: &str, content: UnitBytes) {
        self.units
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), content);
    }

    /// Register every catalog seed up front. Returns how many were added.
    pub fn seed_from(&self, catalog: &Catalog) -> usize {
        let mut units = self.units.write().unwrap_or_else(PoisonError::into_inner);
        let mut seeded = 0;
        for entry in catalog.seeds() {
            units.insert(entry.name.clone(), entry.content.clone());
            seeded += 1;
        }
        seeded
    }

    pub fn contains(&self, name: &str) -> bool {
        self.units
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    fn seeded(&self, name: &str) -> Option<UnitBytes> {
        self.units
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    fn seeded_resource(&self, resource: &str) -> Option<ResourceHandle> {
        let unit = qualified_name(resource)?;
        self.seeded(&unit).map(|content| ResourceHandle {
            name: resource.to_string(),
            location: ResourceLocation::Seeded(content),
        })
    }
}

impl Loader for MemoryLoader {
    fn resolve_unit(&self, name: &str) -> Option<UnitBytes> {
        self.seeded(name).or_else(|| self.parent.resolve_unit(name))
    }

    fn resolve_resource(&self, name: &str) -> Option<ResourceHandle> {
        if qualified_name(name).is_some() {
            return self.seeded_resource(name);
        }
        self.parent.resolve_resource(name)
    }

    fn resolve_resources(&self, name: &str) -> Vec<ResourceHandle> {
        if qualified_name(name).is_some() {
            return self.seeded_resource(name).into_iter().collect();
        }
        self.parent.resolve_resources(name)
    }

    fn define_unit(&self, name: &str, content: UnitBytes) -> Result<()> {
        self.add_unit(name, content);
        Ok(())
    }
}
