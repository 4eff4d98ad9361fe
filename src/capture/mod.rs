//! Capture coordinator.
//!
//! [`Capturer::capture`] scans the candidate paths, then runs the entry point
//! on a background thread under a seeded tracking loader installed as the
//! ambient loader. The returned [`Capture`] fills up while the program runs;
//! waiting on it also covers the relaunched passes when those are requested.

pub mod policy;
pub mod result;
pub mod sink;
pub mod task;

pub use policy::InclusionPolicy;
pub use result::{Capture, CapturedResource};
pub use sink::{CollectSink, Sink, StoreSink};
pub use task::CancelToken;

use crate::catalog::Catalog;
use crate::config;
use crate::error::CaptureError;
use crate::loader::{Loader, PathLoader, TrackingLoader, ambient};
use crate::runtime::Runtime;
use crate::second_pass::{Handover, SecondPassSettings};
use result::{CaptureObserver, Discoveries};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use task::Task;
use tracing::{debug, info};

/// Everything one capture needs up front.
#[derive(Clone)]
pub struct CaptureRequest {
    pub entry: String,
    pub candidate_paths: Vec<PathBuf>,
    /// Receives each captured unit; `None` disables unit capture.
    pub unit_sink: Option<Arc<dyn Sink>>,
    /// Receives each captured resource; `None` disables resource capture.
    pub resource_sink: Option<Arc<dyn Sink>>,
    /// Whether the entry unit itself counts as a dependency.
    pub include_entry: bool,
    /// Pause after the entry returns so deferred loads are still observed.
    pub grace: Option<Duration>,
    pub store: Option<PathBuf>,
    /// Relaunch out of process after the in-process run.
    pub second_pass: Option<SecondPassSettings>,
    /// Loader behind the catalog seeds. Defaults to `LOADTRACE_PATH` plus the
    /// candidate paths.
    pub ambient: Option<Arc<dyn Loader>>,
}

impl CaptureRequest {
    pub fn new<I, P>(entry: &str, candidate_paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            entry: entry.to_string(),
            candidate_paths: candidate_paths.into_iter().map(Into::into).collect(),
            unit_sink: None,
            resource_sink: None,
            include_entry: false,
            grace: None,
            store: None,
            second_pass: None,
            ambient: None,
        }
    }

    pub fn unit_sink(mut self, sink: Arc<dyn Sink>) -> Self {
        self.unit_sink = Some(sink);
        self
    }

    pub fn resource_sink(mut self, sink: Arc<dyn Sink>) -> Self {
        self.resource_sink = Some(sink);
        self
    }

    pub fn include_entry(mut self, include: bool) -> Self {
        self.include_entry = include;
        self
    }

    pub fn grace(mut self, grace: Option<Duration>) -> Self {
        self.grace = grace.filter(|delay| !delay.is_zero());
        self
    }

    pub fn store(mut self, store: impl Into<PathBuf>) -> Self {
        self.store = Some(store.into());
        self
    }

    pub fn second_pass(mut self, settings: SecondPassSettings) -> Self {
        self.second_pass = Some(settings);
        self
    }

    pub fn ambient(mut self, loader: Arc<dyn Loader>) -> Self {
        self.ambient = Some(loader);
        self
    }
}

/// Runs captures with a shared [`Runtime`].
#[derive(Clone, Default)]
pub struct Capturer {
    runtime: Arc<Runtime>,
}

impl Capturer {
    pub fn new(runtime: Runtime) -> Self {
        Self {
            runtime: Arc::new(runtime),
        }
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    /// Start a capture. Returns as soon as the catalog is built and the
    /// background task is running.
    pub fn capture(&self, request: CaptureRequest) -> Result<Capture, CaptureError> {
        let catalog = Arc::new(Catalog::scan(&request.candidate_paths)?);
        info!(
            entry = %request.entry,
            units = catalog.len(),
            roots = catalog.roots().len(),
            "catalog built"
        );

        let handover = match &request.second_pass {
            Some(settings) => {
                let Some(destination) = request.store.clone() else {
                    return Err(CaptureError::SecondPass {
                        message: "a relaunched pass needs a destination store".to_string(),
                    });
                };
                Some(Handover {
                    entry: request.entry.clone(),
                    candidates: request.candidate_paths.clone(),
                    destination,
                    store_resources: request.resource_sink.is_some(),
                    include_entry: request.include_entry,
                    grace: request.grace,
                    settings: settings.clone(),
                })
            }
            None => None,
        };

        let discoveries = Arc::new(Discoveries::new(
            catalog.clone(),
            request.store.clone(),
            request.unit_sink.clone(),
            request.resource_sink.clone(),
        ));
        let observer = Arc::new(CaptureObserver::new(
            discoveries.clone(),
            InclusionPolicy::for_entry(&request.entry, request.include_entry),
        ));
        let ambient_loader = request.ambient.clone().unwrap_or_else(|| {
            Arc::new(PathLoader::from_env().extended(catalog.roots().iter().cloned()))
                as Arc<dyn Loader>
        });

        let run = InProcessRun {
            runtime: self.runtime.clone(),
            entry: request.entry.clone(),
            catalog,
            ambient: ambient_loader,
            observer,
            grace: request.grace,
        };
        let cancel = CancelToken::new();
        let worker_cancel = cancel.clone();
        let worker_discoveries = discoveries.clone();
        let entry = request.entry.clone();
        let task = Task::spawn(&entry, cancel, move || {
            run.execute(&worker_cancel)?;
            if worker_cancel.is_cancelled() {
                return Err(CaptureError::Cancelled);
            }
            match handover {
                Some(handover) => {
                    let captured_new = worker_discoveries.has_units();
                    handover.run(captured_new, &worker_cancel)
                }
                None => Ok(()),
            }
        })
        .map_err(|err| CaptureError::EntryPoint {
            entry: entry.clone(),
            message: format!("unable to start capture thread: {err}"),
        })?;

        Ok(Capture::new(discoveries, Some(task)))
    }

    /// Capture into `destination` with store sinks and a relaunched pass.
    ///
    /// Empty `candidate_paths` fall back to the `LOADTRACE_PATH` search path.
    #[allow(clippy::too_many_arguments)]
    pub fn capture_and_store(
        &self,
        entry: &str,
        candidate_paths: &[PathBuf],
        destination: &Path,
        store_resources: bool,
        include_entry: bool,
        grace: Option<Duration>,
        settings: SecondPassSettings,
    ) -> Result<Capture, CaptureError> {
        let candidates = config::candidate_paths_or_env(candidate_paths.to_vec());
        let mut request = CaptureRequest::new(entry, candidates)
            .unit_sink(sink::store())
            .store(destination)
            .include_entry(include_entry)
            .grace(grace)
            .second_pass(settings);
        if store_resources {
            request = request.resource_sink(sink::store());
        }
        self.capture(request)
    }
}

/// The in-process half of a capture, moved onto the background thread.
struct InProcessRun {
    runtime: Arc<Runtime>,
    entry: String,
    catalog: Arc<Catalog>,
    ambient: Arc<dyn Loader>,
    observer: Arc<CaptureObserver>,
    grace: Option<Duration>,
}

impl InProcessRun {
    fn execute(self, cancel: &CancelToken) -> Result<(), CaptureError> {
        let owner = ambient::acquire();
        let loader: Arc<dyn Loader> = Arc::new(TrackingLoader::seeded(
            &self.catalog,
            self.ambient.clone(),
            self.observer.clone(),
        ));
        let _guard = ambient::install(&owner, loader.clone());
        debug!(entry = %self.entry, "entry point starting");

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            self.runtime.invoke(&self.entry, loader, cancel.clone())
        }));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                if cancel.is_cancelled() {
                    return Err(CaptureError::Cancelled);
                }
                return Err(CaptureError::entry_point(&self.entry, &err));
            }
            Err(panic) => {
                return Err(CaptureError::EntryPoint {
                    entry: self.entry.clone(),
                    message: panic_message(panic.as_ref()),
                });
            }
        }

        if let Some(grace) = self.grace {
            debug!(grace_ms = grace.as_millis() as u64, "waiting for deferred loads");
            if !cancel.sleep(grace) {
                return Err(CaptureError::Cancelled);
            }
        }
        debug!(entry = %self.entry, "entry point finished");
        Ok(())
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panicked: {message}")
    } else {
        "panicked".to_string()
    }
}
