//! Filesystem and archive walker feeding the catalog.

use crate::catalog::Catalog;
use crate::catalog::entry::{
    CatalogEntry, DiscoveryKey, is_archive, is_enclosed, qualified_name, slash_path,
};
use crate::error::CaptureError;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;
use walkdir::WalkDir;
use zip::ZipArchive;
use zip::result::ZipError;

pub(crate) fn scan_paths<P: AsRef<Path>>(
    paths: &[P],
    catalog: &mut Catalog,
) -> Result<(), CaptureError> {
    for raw in paths {
        let raw = raw.as_ref();
        if !raw.exists() {
            debug!(path = %raw.display(), "skipping missing candidate path");
            continue;
        }
        let root = fs::canonicalize(raw).map_err(|err| CaptureError::scan(raw, err))?;
        if root.is_dir() {
            catalog.record_root(root.clone());
            scan_directory(&root, catalog)?;
        } else if is_archive(&root) {
            catalog.record_root(root.clone());
            scan_archive(&root, catalog)?;
        } else {
            debug!(path = %root.display(), "candidate is neither a directory nor an archive");
        }
    }
    debug!(units = catalog.len(), roots = catalog.roots().len(), "catalog scan finished");
    Ok(())
}

fn scan_directory(root: &Path, catalog: &mut Catalog) -> Result<(), CaptureError> {
    for item in WalkDir::new(root).follow_links(true).sort_by_file_name() {
        let item = item.map_err(|err| {
            let path = err
                .path()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| root.to_path_buf());
            CaptureError::scan(path, io::Error::from(err))
        })?;
        if !item.file_type().is_file() {
            continue;
        }
        let path = item.path();
        let Ok(relative) = path.strip_prefix(root) else {
            continue;
        };
        let relative = slash_path(relative);
        let Some(name) = qualified_name(&relative) else {
            continue;
        };
        let content = fs::read(path).map_err(|err| CaptureError::scan(path, err))?;
        catalog.insert(CatalogEntry {
            key: DiscoveryKey::for_path(path),
            name,
            relative_path: relative,
            origin: root.to_path_buf(),
            content: Arc::from(content),
        });
    }
    Ok(())
}

fn scan_archive(root: &Path, catalog: &mut Catalog) -> Result<(), CaptureError> {
    let file = File::open(root).map_err(|err| CaptureError::scan(root, err))?;
    let mut archive =
        ZipArchive::new(file).map_err(|err| CaptureError::scan(root, zip_io_error(err)))?;
    for index in 0..archive.len() {
        let mut member = archive
            .by_index(index)
            .map_err(|err| CaptureError::scan(root, zip_io_error(err)))?;
        if !member.is_file() {
            continue;
        }
        let relative = member.name().trim_start_matches('/').to_string();
        if member.enclosed_name().is_none() || !is_enclosed(&relative) {
            debug!(archive = %root.display(), member = member.name(), "skipping member that escapes the archive root");
            continue;
        }
        let Some(name) = qualified_name(&relative) else {
            continue;
        };
        let mut content = Vec::with_capacity(member.size() as usize);
        member
            .read_to_end(&mut content)
            .map_err(|err| CaptureError::scan(root, err))?;
        catalog.insert(CatalogEntry {
            key: DiscoveryKey::for_path(&root.join(&relative)),
            name,
            relative_path: relative,
            origin: root.to_path_buf(),
            content: Arc::from(content),
        });
    }
    Ok(())
}

/// Read one member out of a zip archive; `Ok(None)` when it is absent.
pub(crate) fn read_archive_member(archive: &Path, member: &str) -> io::Result<Option<Vec<u8>>> {
    let member = member.trim_start_matches('/');
    if !is_enclosed(member) {
        return Ok(None);
    }
    let file = File::open(archive)?;
    let mut archive = ZipArchive::new(file).map_err(zip_io_error)?;
    let mut entry = match archive.by_name(member) {
        Ok(entry) => entry,
        Err(ZipError::FileNotFound) => return Ok(None),
        Err(err) => return Err(zip_io_error(err)),
    };
    if !entry.is_file() {
        return Ok(None);
    }
    let mut content = Vec::with_capacity(entry.size() as usize);
    entry.read_to_end(&mut content)?;
    Ok(Some(content))
}

fn zip_io_error(err: ZipError) -> io::Error {
    match err {
        ZipError::Io(inner) => inner,
        other => io::Error::new(io::ErrorKind::InvalidData, other),
    }
}
