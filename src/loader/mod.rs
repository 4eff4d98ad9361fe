//! Loader interface and the implementations a capture composes.
//!
//! A loader answers two questions: "give me the bytes of unit `X`" and "where
//! is resource `y`". The capture engine stacks three of them: a `PathLoader`
//! over the ambient search path, a `MemoryLoader` seeded from the catalog on
//! top of it, and a `TrackingLoader` decorator that reports every request.

pub mod ambient;
pub mod memory;
pub mod path;
pub mod tracking;

use crate::catalog::{UnitBytes, read_archive_member};
use anyhow::{Result, bail};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub use memory::MemoryLoader;
pub use path::PathLoader;
pub use tracking::{LoadObserver, TrackingLoader};

pub trait Loader: Send + Sync {
    /// Bytes of the unit with qualified name `name`.
    fn resolve_unit(&self, name: &str) -> Option<UnitBytes>;

    /// First resource matching `name`.
    fn resolve_resource(&self, name: &str) -> Option<ResourceHandle>;

    /// Every resource matching `name`, in search order.
    fn resolve_resources(&self, name: &str) -> Vec<ResourceHandle> {
        self.resolve_resource(name).into_iter().collect()
    }

    /// Register a unit synthesized at run time.
    fn define_unit(&self, name: &str, content: UnitBytes) -> Result<()> {
        let _ = content;
        bail!("loader does not accept synthesized units (attempted to define {name})")
    }
}

/// Where a resolved resource actually lives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResourceLocation {
    File(PathBuf),
    Archive { archive: PathBuf, member: String },
    /// Unit content served from loader memory.
    Seeded(UnitBytes),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceHandle {
    pub name: String,
    pub location: ResourceLocation,
}

impl ResourceHandle {
    pub fn file(name: &str, path: PathBuf) -> Self {
        Self {
            name: name.to_string(),
            location: ResourceLocation::File(path),
        }
    }

    /// The backing path when this resource is an existing regular file.
    pub fn regular_file(&self) -> Option<&Path> {
        match &self.location {
            ResourceLocation::File(path) if path.is_file() => Some(path),
            _ => None,
        }
    }

    pub fn read(&self) -> io::Result<Vec<u8>> {
        match &self.location {
            ResourceLocation::File(path) => fs::read(path),
            ResourceLocation::Archive { archive, member } => {
                read_archive_member(archive, member)?.ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("{member} no longer present in {}", archive.display()),
                    )
                })
            }
            ResourceLocation::Seeded(content) => Ok(content.to_vec()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn only_existing_regular_files_qualify() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("config.properties");
        fs::write(&file, "a=1").unwrap();

        let present = ResourceHandle::file("config.properties", file.clone());
        assert_eq!(present.regular_file(), Some(file.as_path()));
        assert_eq!(present.read().unwrap(), b"a=1");

        let dir = ResourceHandle::file("conf", temp.path().to_path_buf());
        assert!(dir.regular_file().is_none());

        let gone = ResourceHandle::file("gone", temp.path().join("gone"));
        assert!(gone.regular_file().is_none());

        let seeded = ResourceHandle {
            name: "Demo.unit".into(),
            location: ResourceLocation::Seeded(UnitBytes::from(&b"load X"[..])),
        };
        assert!(seeded.regular_file().is_none());
        assert_eq!(seeded.read().unwrap(), b"load X");
    }
}
