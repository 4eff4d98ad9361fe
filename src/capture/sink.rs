//! Persistence callbacks and the destination store layout.
//!
//! Every discovery is handed to a sink at most once. The store sink writes it
//! under `<store>/[seg1][seg2]..[segN]/<relative path>`, where the bracketed
//! segments spell out the origin root, so units with the same relative path
//! from different origins never collide. Writes go through a temporary file
//! and never replace an existing file.

use crate::catalog::is_enclosed;
use anyhow::{Context, Result, bail};
use std::fs;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::{debug, trace};

pub trait Sink: Send + Sync {
    /// `key` is the discovery key (absolute location), `relative_path` the
    /// location below the origin root.
    fn accept(
        &self,
        store_root: Option<&Path>,
        key: &str,
        relative_path: &str,
        content: &[u8],
    ) -> Result<()>;
}

impl<F> Sink for F
where
    F: Fn(Option<&Path>, &str, &str, &[u8]) -> Result<()> + Send + Sync,
{
    fn accept(
        &self,
        store_root: Option<&Path>,
        key: &str,
        relative_path: &str,
        content: &[u8],
    ) -> Result<()> {
        self(store_root, key, relative_path, content)
    }
}

/// Keeps discoveries in the capture maps without persisting anything.
pub struct CollectSink;

impl Sink for CollectSink {
    fn accept(&self, _: Option<&Path>, _: &str, _: &str, _: &[u8]) -> Result<()> {
        Ok(())
    }
}

/// Writes each discovery into the destination store, once.
pub struct StoreSink;

impl Sink for StoreSink {
    fn accept(
        &self,
        store_root: Option<&Path>,
        key: &str,
        relative_path: &str,
        content: &[u8],
    ) -> Result<()> {
        let Some(root) = store_root else {
            bail!("no destination store configured for {relative_path}");
        };
        let target = store_entry_path(root, key, relative_path)?;
        match persist_once(&target, content)? {
            Persisted::Written => debug!(
                item = relative_path,
                target = %target.display(),
                "stored"
            ),
            Persisted::AlreadyPresent => trace!(
                item = relative_path,
                target = %target.display(),
                "already stored"
            ),
        }
        Ok(())
    }
}

pub fn collect() -> Arc<dyn Sink> {
    Arc::new(CollectSink)
}

pub fn store() -> Arc<dyn Sink> {
    Arc::new(StoreSink)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Persisted {
    Written,
    AlreadyPresent,
}

/// Write `content` to `target` unless something is already there.
pub fn persist_once(target: &Path, content: &[u8]) -> Result<Persisted> {
    if target.exists() {
        return Ok(Persisted::AlreadyPresent);
    }
    let parent = target
        .parent()
        .with_context(|| format!("store target {} has no parent", target.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    let mut staged = NamedTempFile::new_in(parent)
        .with_context(|| format!("staging a write in {}", parent.display()))?;
    staged
        .write_all(content)
        .with_context(|| format!("writing staged copy of {}", target.display()))?;
    match staged.persist_noclobber(target) {
        Ok(_) => Ok(Persisted::Written),
        Err(err) if err.error.kind() == io::ErrorKind::AlreadyExists => {
            Ok(Persisted::AlreadyPresent)
        }
        Err(err) => Err(err.error).with_context(|| format!("persisting {}", target.display())),
    }
}

/// Directory inside the store that mirrors the origin root of `key`.
pub fn store_entry_base(store_root: &Path, key: &str, relative_path: &str) -> PathBuf {
    let key_parts = normal_parts(Path::new(key));
    let relative_parts: Vec<String> = relative_path
        .split('/')
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect();

    let origin_parts = if !relative_parts.is_empty() && key_parts.ends_with(&relative_parts) {
        &key_parts[..key_parts.len() - relative_parts.len()]
    } else {
        &key_parts[..key_parts.len().saturating_sub(1)]
    };

    bracketed(store_root, origin_parts)
}

/// Store directory mirroring an origin root (directory or archive).
pub fn origin_store_dir(store_root: &Path, origin: &Path) -> PathBuf {
    bracketed(store_root, &normal_parts(origin))
}

fn bracketed(store_root: &Path, origin_parts: &[String]) -> PathBuf {
    if origin_parts.is_empty() {
        return store_root.to_path_buf();
    }
    let segments: String = origin_parts
        .iter()
        .map(|segment| format!("[{segment}]"))
        .collect();
    store_root.join(segments)
}

/// Full store location for an item. Fails for a relative path that would
/// leave its origin directory.
pub fn store_entry_path(store_root: &Path, key: &str, relative_path: &str) -> Result<PathBuf> {
    let relative = relative_path.trim_start_matches('/');
    if !is_enclosed(relative) {
        bail!("refusing to store {relative_path:?} outside {}", store_root.display());
    }
    let mut target = store_entry_base(store_root, key, relative);
    for part in relative.split('/') {
        target.push(part);
    }
    Ok(target)
}

fn normal_parts(path: &Path) -> Vec<String> {
    path.components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect()
}
