//! Indexed view over every unit reachable from a set of candidate paths.
//!
//! Entries are keyed by discovery key. A secondary name index remembers scan
//! order per qualified name so seeding can pick the latest-scanned entry when
//! several origins ship a unit with the same name.

use crate::catalog::entry::{CatalogEntry, DiscoveryKey};
use crate::catalog::scan::scan_paths;
use crate::error::CaptureError;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct Catalog {
    entries: BTreeMap<DiscoveryKey, Arc<CatalogEntry>>,
    by_name: BTreeMap<String, Vec<DiscoveryKey>>,
    roots: Vec<PathBuf>,
}

impl Catalog {
    /// Scan `paths` and build the index.
    ///
    /// Missing paths contribute nothing; unreadable ones abort the scan.
    pub fn scan<P: AsRef<Path>>(paths: &[P]) -> Result<Self, CaptureError> {
        let mut catalog = Catalog::default();
        scan_paths(paths, &mut catalog)?;
        Ok(catalog)
    }

    pub(crate) fn record_root(&mut self, root: PathBuf) {
        if !self.roots.contains(&root) {
            self.roots.push(root);
        }
    }

    pub(crate) fn insert(&mut self, entry: CatalogEntry) {
        let keys = self.by_name.entry(entry.name.clone()).or_default();
        keys.retain(|key| key != &entry.key);
        keys.push(entry.key.clone());
        self.entries.insert(entry.key.clone(), Arc::new(entry));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &DiscoveryKey) -> Option<&Arc<CatalogEntry>> {
        self.entries.get(key)
    }

    /// The entry a loader should be seeded with for `name`.
    pub fn seed_for(&self, name: &str) -> Option<&Arc<CatalogEntry>> {
        let key = self.by_name.get(name)?.last()?;
        self.entries.get(key)
    }

    /// One entry per qualified name, the latest scanned.
    pub fn seeds(&self) -> impl Iterator<Item = &Arc<CatalogEntry>> {
        self.by_name
            .values()
            .filter_map(|keys| keys.last())
            .filter_map(|key| self.entries.get(key))
    }

    /// Every entry in key order, shadowed duplicates included.
    pub fn entries(&self) -> impl Iterator<Item = &Arc<CatalogEntry>> {
        self.entries.values()
    }

    pub fn contains_name(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Roots that were actually scanned, canonicalized, in request order.
    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Origins contributing any unit named in `names`, in root order.
    pub fn origins_of(&self, names: &BTreeSet<String>) -> Vec<PathBuf> {
        let contributing: BTreeSet<&PathBuf> = names
            .iter()
            .filter_map(|name| self.by_name.get(name))
            .flatten()
            .filter_map(|key| self.entries.get(key))
            .map(|entry| &entry.origin)
            .collect();
        self.roots
            .iter()
            .filter(|root| contributing.contains(root))
            .cloned()
            .collect()
    }
}
