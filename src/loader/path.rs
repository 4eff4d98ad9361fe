use crate::catalog::{UnitBytes, is_archive, is_enclosed, read_archive_member, unit_relative_path};
use crate::config;
use crate::loader::{Loader, ResourceHandle, ResourceLocation};
use std::fs;
use std::path::PathBuf;
use tracing::debug;

/// Resolves units and resources straight from a search path.
///
/// This is the ambient environment a capture falls back to: nothing is
/// indexed ahead of time, every lookup tries the roots in order.
#[derive(Clone, Debug, Default)]
pub struct PathLoader {
    roots: Vec<PathBuf>,
}

impl PathLoader {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self { roots }
    }

    /// Search path taken from `LOADTRACE_PATH`.
    pub fn from_env() -> Self {
        Self::new(config::search_path_from_env())
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Append roots that are not already on the search path.
    pub fn extended<I>(mut self, extra: I) -> Self
    where
        I: IntoIterator<Item = PathBuf>,
    {
        for root in extra {
            if !self.roots.contains(&root) {
                self.roots.push(root);
            }
        }
        self
    }
}

impl Loader for PathLoader {
    fn resolve_unit(&self, name: &str) -> Option<UnitBytes> {
        let relative = unit_relative_path(name);
        if !is_enclosed(&relative) {
            debug!(unit = name, "rejecting unit name that leaves the search roots");
            return None;
        }
        for root in &self.roots {
            let found = if is_archive(root) {
                read_archive_member(root, &relative).ok().flatten()
            } else {
                fs::read(root.join(&relative)).ok()
            };
            if let Some(content) = found {
                return Some(UnitBytes::from(content));
            }
        }
        None
    }

    fn resolve_resource(&self, name: &str) -> Option<ResourceHandle> {
        self.resolve_resources(name).into_iter().next()
    }

    fn resolve_resources(&self, name: &str) -> Vec<ResourceHandle> {
        let relative = name.trim_start_matches('/');
        let mut found = Vec::new();
        if !is_enclosed(relative) {
            debug!(resource = name, "rejecting resource name that leaves the search roots");
            return found;
        }
        for root in &self.roots {
            if is_archive(root) {
                match read_archive_member(root, relative) {
                    Ok(Some(_)) => found.push(ResourceHandle {
                        name: name.to_string(),
                        location: ResourceLocation::Archive {
                            archive: root.clone(),
                            member: relative.to_string(),
                        },
                    }),
                    Ok(None) => {}
                    Err(err) => {
                        debug!(archive = %root.display(), error = %err, "unreadable archive on search path");
                    }
                }
                continue;
            }
            let candidate = root.join(relative);
            if candidate.exists() {
                found.push(ResourceHandle::file(name, candidate));
            }
        }
        found
    }
}
