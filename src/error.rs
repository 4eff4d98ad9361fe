//! Failure taxonomy for a capture.
//!
//! Catalog scans fail before anything runs; everything that happens inside the
//! traced execution is folded into a single `EntryPoint` failure that callers
//! observe when they wait on the capture. Store failures never reach this type:
//! the accumulator logs and skips them.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum CaptureError {
    /// A candidate path exists but could not be read or decoded.
    #[error("failed to scan candidate path {}", path.display())]
    CatalogScan {
        path: PathBuf,
        #[source]
        source: Arc<io::Error>,
    },

    /// The traced program (or the loader setup around it) failed.
    #[error("entry point {entry} failed: {message}")]
    EntryPoint { entry: String, message: String },

    /// The second-pass child could not be started.
    #[error("second pass could not be launched: {message}")]
    SecondPass { message: String },

    #[error("capture was cancelled")]
    Cancelled,

    #[error("capture has been closed")]
    Closed,
}

impl CaptureError {
    pub(crate) fn scan(path: impl Into<PathBuf>, source: io::Error) -> Self {
        CaptureError::CatalogScan {
            path: path.into(),
            source: Arc::new(source),
        }
    }

    pub(crate) fn entry_point(entry: &str, err: &anyhow::Error) -> Self {
        CaptureError::EntryPoint {
            entry: entry.to_string(),
            message: format!("{err:#}"),
        }
    }
}
