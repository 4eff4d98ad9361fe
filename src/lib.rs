//! Runtime dependency capture.
//!
//! `loadtrace` runs a program under an instrumented loader and records every
//! compiled unit and resource it actually asks for, optionally persisting each
//! one into a destination store. A capture can then relaunch itself out of
//! process over the reduced path set to validate and extend the result.
//!
//! The pieces, leaf first: [`catalog`] indexes candidate paths, [`loader`]
//! provides the loader stack and the ambient slot, [`runtime`] executes entry
//! points, [`capture`] coordinates a run and accumulates its results, and
//! [`second_pass`] owns the relaunch protocol.

pub mod capture;
pub mod catalog;
pub mod config;
pub mod error;
pub mod loader;
pub mod logging;
pub mod manifest;
pub mod runtime;
pub mod second_pass;

pub use capture::{
    CancelToken, Capture, CaptureRequest, CapturedResource, Capturer, InclusionPolicy, Sink,
};
pub use catalog::{Catalog, CatalogEntry, DiscoveryKey, UnitBytes};
pub use error::CaptureError;
pub use loader::{LoadObserver, Loader, MemoryLoader, PathLoader, ResourceHandle, TrackingLoader};
pub use manifest::{Manifest, parse_manifest_stream};
pub use runtime::{LoadContext, Runtime};
pub use second_pass::{PROTOCOL_VERSION, PassArgs, SecondPassPlan, SecondPassSettings};
