//! Executes traced programs.
//!
//! An entry point is either a native function registered under a qualified
//! name or, by default, the entry unit's own content run as a unit script.
//! Every unit and resource the program touches goes through the loader carried
//! by its [`LoadContext`]; threads the program starts pick up the ambient
//! loader instead, the way real code on a fresh thread would.

pub mod script;

use crate::capture::CancelToken;
use crate::catalog::UnitBytes;
use crate::loader::{Loader, ResourceHandle, ambient};
use anyhow::{Context, Result, anyhow, bail};
use script::Directive;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use tracing::{debug, trace};

pub type NativeEntry = Arc<dyn Fn(&LoadContext) -> Result<()> + Send + Sync>;

/// Registry of native entry points plus the unit-script interpreter.
#[derive(Default)]
pub struct Runtime {
    natives: BTreeMap<String, NativeEntry>,
}

impl Runtime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `entry` natively whenever unit `name` is initialized.
    pub fn register<F>(&mut self, name: &str, entry: F) -> &mut Self
    where
        F: Fn(&LoadContext) -> Result<()> + Send + Sync + 'static,
    {
        self.natives.insert(name.to_string(), Arc::new(entry));
        self
    }

    pub fn with_native<F>(mut self, name: &str, entry: F) -> Self
    where
        F: Fn(&LoadContext) -> Result<()> + Send + Sync + 'static,
    {
        self.register(name, entry);
        self
    }

    pub fn has_native(&self, name: &str) -> bool {
        self.natives.contains_key(name)
    }

    /// Resolve `entry` through `loader` and run it to completion.
    pub fn invoke(
        self: &Arc<Self>,
        entry: &str,
        loader: Arc<dyn Loader>,
        cancel: CancelToken,
    ) -> Result<()> {
        let context = LoadContext::new(self.clone(), loader, cancel);
        context
            .load(entry)
            .with_context(|| format!("running entry point {entry}"))
    }
}

/// Loader context threaded through a traced execution.
#[derive(Clone)]
pub struct LoadContext {
    runtime: Arc<Runtime>,
    loader: Arc<dyn Loader>,
    cancel: CancelToken,
    initialized: Arc<Mutex<BTreeSet<String>>>,
}

impl LoadContext {
    pub fn new(runtime: Arc<Runtime>, loader: Arc<dyn Loader>, cancel: CancelToken) -> Self {
        Self {
            runtime,
            loader,
            cancel,
            initialized: Arc::default(),
        }
    }

    pub fn loader(&self) -> &Arc<dyn Loader> {
        &self.loader
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// The same execution, seen from a thread that only has the ambient
    /// loader to go on.
    pub fn ambient(&self) -> Self {
        Self {
            loader: ambient::current(),
            ..self.clone()
        }
    }

    /// Resolve unit `name` and run it, once per execution.
    pub fn load(&self, name: &str) -> Result<()> {
        if self.cancel.is_cancelled() {
            bail!("execution cancelled before loading {name}");
        }
        let content = self.loader.resolve_unit(name);
        let native = self.runtime.natives.get(name).cloned();
        if native.is_none() && content.is_none() {
            bail!("unit {name} not found");
        }
        if !self.mark_initialized(name) {
            trace!(unit = name, "already initialized");
            return Ok(());
        }

        match (native, content) {
            (Some(native), _) => native(self).with_context(|| format!("native unit {name}")),
            (None, Some(content)) => self.run_script(name, &content),
            (None, None) => Ok(()),
        }
    }

    pub fn resource(&self, name: &str) -> Option<ResourceHandle> {
        self.loader.resolve_resource(name)
    }

    pub fn resources(&self, name: &str) -> Vec<ResourceHandle> {
        self.loader.resolve_resources(name)
    }

    pub fn define(&self, name: &str, content: UnitBytes) -> Result<()> {
        self.loader.define_unit(name, content)
    }

    fn mark_initialized(&self, name: &str) -> bool {
        self.initialized
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string())
    }

    fn run_script(&self, name: &str, content: &[u8]) -> Result<()> {
        let directives = script::parse(content).with_context(|| format!("parsing unit {name}"))?;
        for directive in directives {
            if self.cancel.is_cancelled() {
                bail!("execution of {name} cancelled");
            }
            self.execute(directive)
                .with_context(|| format!("in unit {name}"))?;
        }
        Ok(())
    }

    fn execute(&self, directive: Directive) -> Result<()> {
        match directive {
            Directive::Load(unit) => self.load(&unit),
            Directive::Resource(resource) => {
                if self.resource(&resource).is_none() {
                    trace!(resource = %resource, "resource not found");
                }
                Ok(())
            }
            Directive::Resources(resource) => {
                let found = self.resources(&resource).len();
                trace!(resource = %resource, found, "resources listed");
                Ok(())
            }
            Directive::Spawn(unit) => {
                let worker = self.ambient();
                thread::scope(|scope| {
                    scope
                        .spawn(|| worker.load(&unit))
                        .join()
                        .map_err(|_| anyhow!("thread loading {unit} panicked"))?
                })
            }
            Directive::Defer { delay, unit } => {
                let deferred = self.clone();
                let label = format!("loadtrace-defer-{unit}");
                thread::Builder::new()
                    .name(label.clone())
                    .spawn(move || {
                        if !deferred.cancel.sleep(delay) {
                            return;
                        }
                        if let Err(err) = deferred.ambient().load(&unit) {
                            debug!(unit = %unit, error = %format!("{err:#}"), "deferred load failed");
                        }
                    })
                    .with_context(|| format!("spawning {label}"))?;
                Ok(())
            }
            Directive::Define(unit) => self.define(&unit, UnitBytes::from(&[][..])),
            Directive::Sleep(duration) => {
                if !self.cancel.sleep(duration) {
                    bail!("sleep interrupted by cancellation");
                }
                Ok(())
            }
            Directive::Fail(message) => Err(anyhow!(message)),
        }
    }
}
