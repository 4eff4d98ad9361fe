//! Out-of-process refinement of a capture.
//!
//! After the in-process run, the program relaunches itself with a reduced
//! candidate set: everything already materialized in the destination store
//! becomes the child's search path, and only the candidate paths that still
//! have to be scanned are passed on. The request crosses the process boundary
//! as a flat, versioned argument list ([`PassArgs`]) that both sides build
//! and parse with the same `clap` definition.
//!
//! Relaunching stops once the pass limit is reached, nothing remains to scan,
//! or a later pass captured nothing new.

use crate::capture::sink::{self, origin_store_dir};
use crate::capture::{CancelToken, CaptureRequest, Capturer};
use crate::catalog::Catalog;
use crate::config;
use crate::error::CaptureError;
use crate::loader::PathLoader;
use anyhow::{Context, Result, bail};
use clap::{ArgAction, Parser};
use std::collections::BTreeSet;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Version of the relaunch argument layout. Bump on any incompatible change.
pub const PROTOCOL_VERSION: u32 = 1;

const CHILD_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Arguments of the `pass` subcommand, i.e. the relaunch wire format.
#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[command(name = "pass")]
#[command(about = "Run one relaunched capture pass (internal protocol)")]
pub struct PassArgs {
    /// Protocol version the sender speaks.
    #[arg(long, default_value_t = PROTOCOL_VERSION)]
    pub protocol: u32,
    /// Materialized roots, joined with the native path separator.
    #[arg(long, default_value = "")]
    pub search_path: OsString,
    /// Number of this pass; the in-process run is pass 1.
    #[arg(long, default_value_t = 2)]
    pub pass: u32,
    #[arg(long, default_value_t = config::DEFAULT_MAX_PASSES)]
    pub max_passes: u32,
    /// Qualified name of the entry unit.
    pub entry: String,
    /// Candidate paths still to scan, joined with the native path separator.
    pub paths: OsString,
    pub destination: PathBuf,
    #[arg(action = ArgAction::Set)]
    pub store_resources: bool,
    #[arg(action = ArgAction::Set)]
    pub include_entry: bool,
    /// Grace delay in milliseconds; 0 disables it.
    pub grace_ms: u64,
}

impl PassArgs {
    /// Command-line form, starting with the subcommand name.
    pub fn to_args(&self) -> Vec<OsString> {
        vec![
            "pass".into(),
            "--protocol".into(),
            self.protocol.to_string().into(),
            "--search-path".into(),
            self.search_path.clone(),
            "--pass".into(),
            self.pass.to_string().into(),
            "--max-passes".into(),
            self.max_passes.to_string().into(),
            self.entry.clone().into(),
            self.paths.clone(),
            self.destination.clone().into_os_string(),
            self.store_resources.to_string().into(),
            self.include_entry.to_string().into(),
            self.grace_ms.to_string().into(),
        ]
    }

    pub fn validate(&self) -> Result<()> {
        if self.protocol != PROTOCOL_VERSION {
            bail!(
                "unsupported relaunch protocol {} (this build speaks {PROTOCOL_VERSION})",
                self.protocol
            );
        }
        if self.pass == 0 || self.max_passes == 0 {
            bail!("pass numbers start at 1");
        }
        if self.entry.trim().is_empty() {
            bail!("relaunch request carries no entry point");
        }
        Ok(())
    }

    pub fn search_path(&self) -> Vec<PathBuf> {
        config::split_search_path(&self.search_path)
    }

    pub fn candidate_paths(&self) -> Vec<PathBuf> {
        config::split_search_path(&self.paths)
    }

    pub fn grace(&self) -> Option<Duration> {
        (self.grace_ms > 0).then(|| Duration::from_millis(self.grace_ms))
    }
}

/// Whether a capture relaunches itself once its in-process run is over.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SecondPassSettings {
    /// Executable to relaunch; the running binary (or `LOADTRACE_EXE`) when unset.
    pub program: Option<PathBuf>,
    /// Number of the pass this capture runs as.
    pub pass: u32,
    pub max_passes: u32,
    /// Units the relaunched program needs on its search path besides the entry.
    pub support_units: Vec<String>,
}

impl Default for SecondPassSettings {
    fn default() -> Self {
        Self {
            program: None,
            pass: 1,
            max_passes: config::DEFAULT_MAX_PASSES,
            support_units: Vec::new(),
        }
    }
}

impl SecondPassSettings {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            max_passes: config::max_passes_from_env()?,
            support_units: config::support_units_from_env(),
            ..Self::default()
        })
    }

    fn program(&self) -> Result<PathBuf, CaptureError> {
        match &self.program {
            Some(program) => Ok(program.clone()),
            None => config::self_binary().map_err(|err| CaptureError::SecondPass {
                message: format!("{err:#}"),
            }),
        }
    }
}

/// Termination rule for the relaunch chain.
///
/// The first pass always hands over to a second one for validation. Later
/// passes continue only while candidates remain and they found something new.
pub fn should_relaunch(pass: u32, max_passes: u32, remaining: usize, captured_new: bool) -> bool {
    if pass >= max_passes {
        return false;
    }
    pass == 1 || (remaining > 0 && captured_new)
}

/// Reduced path set handed to the next pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SecondPassPlan {
    /// Roots the child resolves from without scanning.
    pub search_path: Vec<PathBuf>,
    /// Candidate paths the child still scans.
    pub remaining: Vec<PathBuf>,
}

/// Compute the next pass's paths.
///
/// Starts from the candidates minus the destination, puts every immediate
/// child of the destination on the search path and drops the candidates that
/// already have one. Every candidate that provides one of `support_units` is
/// then moved onto the search path, materialized or not.
pub fn plan(
    candidates: &[PathBuf],
    destination: &Path,
    support_units: &BTreeSet<String>,
) -> Result<SecondPassPlan, CaptureError> {
    let destination = canonical(destination);
    let mut remaining: Vec<PathBuf> = Vec::new();
    for candidate in candidates {
        if !candidate.exists() {
            debug!(path = %candidate.display(), "dropping missing candidate from relaunch");
            continue;
        }
        let candidate = canonical(candidate);
        if candidate != destination && !remaining.contains(&candidate) {
            remaining.push(candidate);
        }
    }

    let mut search_path = materialized_roots(&destination)?;
    let catalog = Catalog::scan(&remaining)?;
    remaining.retain(|path| {
        let materialized = search_path.contains(&origin_store_dir(&destination, path));
        if materialized {
            debug!(path = %path.display(), "candidate already materialized");
        }
        !materialized
    });

    for origin in catalog.origins_of(support_units) {
        debug!(origin = %origin.display(), "self-located support origin");
        remaining.retain(|path| path != &origin);
        if !search_path.contains(&origin) {
            search_path.push(origin);
        }
    }

    Ok(SecondPassPlan {
        search_path,
        remaining,
    })
}

fn materialized_roots(destination: &Path) -> Result<Vec<PathBuf>, CaptureError> {
    if !destination.is_dir() {
        return Ok(Vec::new());
    }
    let mut roots = Vec::new();
    let listing = fs::read_dir(destination).map_err(|err| CaptureError::scan(destination, err))?;
    for child in listing {
        let child = child.map_err(|err| CaptureError::scan(destination, err))?;
        roots.push(child.path());
    }
    roots.sort();
    Ok(roots)
}

fn canonical(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Program plus arguments for a relaunch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: OsString,
    pub args: Vec<OsString>,
}

impl CommandSpec {
    pub fn for_pass(program: &Path, args: &PassArgs) -> Self {
        Self {
            program: program.as_os_str().to_os_string(),
            args: args.to_args(),
        }
    }
}

/// Spawn the relaunch with inherited stdio and block until it exits.
///
/// The exit status is only logged; a cancelled wait kills the child.
pub fn launch(spec: &CommandSpec, cancel: &CancelToken) -> Result<ExitStatus, CaptureError> {
    let mut child = Command::new(&spec.program)
        .args(&spec.args)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(|err| CaptureError::SecondPass {
            message: format!("failed to execute {}: {err}", spec.program.to_string_lossy()),
        })?;
    debug!(pid = child.id(), program = %spec.program.to_string_lossy(), "relaunched");

    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                info!(%status, "relaunched pass exited");
                return Ok(status);
            }
            Ok(None) => {}
            Err(err) => {
                return Err(CaptureError::SecondPass {
                    message: format!("waiting on relaunched pass: {err}"),
                });
            }
        }
        if !cancel.sleep(CHILD_POLL_INTERVAL) {
            if let Err(err) = child.kill() {
                warn!(error = %err, "could not terminate relaunched pass");
            }
            let _ = child.wait();
            return Err(CaptureError::Cancelled);
        }
    }
}

/// Everything a finished in-process run needs to hand over to the next pass.
#[derive(Clone, Debug)]
pub(crate) struct Handover {
    pub(crate) entry: String,
    pub(crate) candidates: Vec<PathBuf>,
    pub(crate) destination: PathBuf,
    pub(crate) store_resources: bool,
    pub(crate) include_entry: bool,
    pub(crate) grace: Option<Duration>,
    pub(crate) settings: SecondPassSettings,
}

impl Handover {
    /// Plan and launch the next pass if the termination rule allows it.
    pub(crate) fn run(&self, captured_new: bool, cancel: &CancelToken) -> Result<(), CaptureError> {
        let mut support: BTreeSet<String> = self.settings.support_units.iter().cloned().collect();
        support.insert(self.entry.clone());
        let plan = plan(&self.candidates, &self.destination, &support)?;

        if !should_relaunch(
            self.settings.pass,
            self.settings.max_passes,
            plan.remaining.len(),
            captured_new,
        ) {
            info!(
                pass = self.settings.pass,
                remaining = plan.remaining.len(),
                captured_new,
                "relaunch chain complete"
            );
            return Ok(());
        }
        if cancel.is_cancelled() {
            return Err(CaptureError::Cancelled);
        }

        let join = |paths: &[PathBuf]| {
            config::join_search_path(paths).map_err(|err| CaptureError::SecondPass {
                message: format!("{err:#}"),
            })
        };
        let args = PassArgs {
            protocol: PROTOCOL_VERSION,
            search_path: join(&plan.search_path)?,
            pass: self.settings.pass + 1,
            max_passes: self.settings.max_passes,
            entry: self.entry.clone(),
            paths: join(&plan.remaining)?,
            destination: self.destination.clone(),
            store_resources: self.store_resources,
            include_entry: self.include_entry,
            grace_ms: self.grace.map_or(0, |grace| grace.as_millis() as u64),
        };
        let spec = CommandSpec::for_pass(&self.settings.program()?, &args);
        info!(
            pass = args.pass,
            search_path = plan.search_path.len(),
            remaining = plan.remaining.len(),
            "launching next pass"
        );
        launch(&spec, cancel).map(|_| ())
    }
}

/// Receiving side of the relaunch protocol: run one pass in this process.
///
/// The pass resolves from the materialized search path, scans only the
/// remaining candidates, and may relaunch once more.
pub fn run_pass(args: &PassArgs, capturer: &Capturer) -> Result<crate::capture::Capture> {
    args.validate()?;
    let candidates = args.candidate_paths();
    let ambient = PathLoader::new(args.search_path()).extended(candidates.clone());
    let settings = SecondPassSettings {
        pass: args.pass,
        max_passes: args.max_passes,
        ..SecondPassSettings::from_env()?
    };
    info!(pass = args.pass, entry = %args.entry, "running relaunched pass");

    let mut request = CaptureRequest::new(&args.entry, candidates)
        .unit_sink(sink::store())
        .store(&args.destination)
        .include_entry(args.include_entry)
        .grace(args.grace())
        .second_pass(settings)
        .ambient(Arc::new(ambient));
    if args.store_resources {
        request = request.resource_sink(sink::store());
    }
    let capture = capturer
        .capture(request)
        .with_context(|| format!("starting pass {}", args.pass))?;
    capture
        .wait()
        .with_context(|| format!("pass {} failed", args.pass))?;
    Ok(capture)
}
