//! Unit catalog wiring.
//!
//! The cataloger walks candidate paths (directories and zip archives) once per
//! capture and produces the authoritative name-to-content index the tracking
//! loader is seeded from. Callers use `Catalog` for lookups; the entry types
//! carry the naming rules shared with loaders and the store layout.

pub mod entry;
pub mod index;
mod scan;

pub use entry::{
    ARCHIVE_EXTENSIONS, CatalogEntry, DiscoveryKey, UNIT_EXTENSION, UnitBytes, is_archive,
    is_enclosed, is_unit_resource, qualified_name, unit_relative_path,
};
pub use index::Catalog;

pub(crate) use scan::read_archive_member;
