use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

/// File extension carried by compiled units.
pub const UNIT_EXTENSION: &str = "unit";

/// Candidate paths with these extensions are scanned as zip archives.
pub const ARCHIVE_EXTENSIONS: &[&str] = &["zip", "jar"];

/// Immutable unit content, shared between the catalog, loaders and captures.
pub type UnitBytes = Arc<[u8]>;

/// Identity used to de-duplicate catalog entries and captured units.
///
/// The key is the absolute location of the unit: the file path for directory
/// roots, `<archive>/<entry>` for archive members. Two units may share a
/// qualified name but never a key.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DiscoveryKey(pub String);

impl DiscoveryKey {
    pub fn for_path(path: &Path) -> Self {
        DiscoveryKey(path.to_string_lossy().into_owned())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DiscoveryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One unit found by the cataloger. Read-only once produced.
#[derive(Clone, Debug)]
pub struct CatalogEntry {
    pub key: DiscoveryKey,
    /// Qualified name, e.g. `com.acme.Demo`.
    pub name: String,
    /// Location relative to the origin root, always `/`-separated.
    pub relative_path: String,
    /// Candidate root (directory or archive) the unit was found under.
    pub origin: PathBuf,
    pub content: UnitBytes,
}

/// Map a root-relative unit path to its qualified name.
///
/// Returns `None` for anything that is not a `.unit` file or that would
/// produce an empty name.
pub fn qualified_name(relative_path: &str) -> Option<String> {
    let stem = relative_path
        .trim_start_matches('/')
        .strip_suffix(UNIT_EXTENSION)?
        .strip_suffix('.')?;
    if stem.is_empty() || stem.ends_with('/') {
        return None;
    }
    Some(stem.replace('/', "."))
}

/// Inverse of [`qualified_name`]: where a unit lives relative to a root.
pub fn unit_relative_path(name: &str) -> String {
    format!("{}.{UNIT_EXTENSION}", name.replace('.', "/"))
}

/// True when a `/`-separated relative path stays below whatever root it is
/// joined to: no root, prefix, `.` or `..` parts and no empty segments.
pub fn is_enclosed(relative: &str) -> bool {
    !relative.is_empty()
        && relative.split('/').all(|part| {
            let mut components = Path::new(part).components();
            matches!(
                (components.next(), components.next()),
                (Some(Component::Normal(_)), None)
            )
        })
}

/// True when a resource name addresses unit content rather than a plain file.
pub fn is_unit_resource(name: &str) -> bool {
    qualified_name(name).is_some()
}

pub fn is_archive(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            ARCHIVE_EXTENSIONS
                .iter()
                .any(|candidate| candidate.eq_ignore_ascii_case(ext))
        })
        .unwrap_or(false)
}

/// Render a relative path with `/` separators regardless of platform.
pub(crate) fn slash_path(relative: &Path) -> String {
    relative
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}
