//! Environment-driven configuration shared by the library and the CLI.
//!
//! Command-line flags always win; these helpers supply the fallbacks. Parsing
//! is strict: a malformed value is an error rather than a silent default.

use anyhow::{Context, Result, bail};
use std::env;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Ambient search path used when nothing else is installed.
pub const ENV_SEARCH_PATH: &str = "LOADTRACE_PATH";
/// Executable the second pass relaunches (defaults to the running binary).
pub const ENV_EXE: &str = "LOADTRACE_EXE";
pub const ENV_MAX_PASSES: &str = "LOADTRACE_MAX_PASSES";
pub const ENV_GRACE_MS: &str = "LOADTRACE_GRACE_MS";
/// Extra unit names the second pass must find on its search path.
pub const ENV_SUPPORT_UNITS: &str = "LOADTRACE_SUPPORT_UNITS";
/// `tracing` filter directives for the CLI.
pub const ENV_LOG: &str = "LOADTRACE_LOG";

pub const DEFAULT_MAX_PASSES: u32 = 2;

pub fn search_path_from_env() -> Vec<PathBuf> {
    env::var_os(ENV_SEARCH_PATH)
        .map(|raw| split_search_path(&raw))
        .unwrap_or_default()
}

/// Explicit candidate paths, or the `LOADTRACE_PATH` search path when none
/// were given.
pub fn candidate_paths_or_env(paths: Vec<PathBuf>) -> Vec<PathBuf> {
    if paths.is_empty() {
        search_path_from_env()
    } else {
        paths
    }
}

/// Split a native search path (`:` on Unix, `;` on Windows), dropping empties.
pub fn split_search_path(value: &OsStr) -> Vec<PathBuf> {
    env::split_paths(value)
        .filter(|path| !path.as_os_str().is_empty())
        .collect()
}

pub fn join_search_path(paths: &[PathBuf]) -> Result<OsString> {
    env::join_paths(paths).context("search path entry contains the path separator")
}

/// Split comma- or whitespace-delimited configuration lists into tokens.
pub fn split_list(value: &str) -> Vec<String> {
    value
        .replace(',', " ")
        .split_whitespace()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

pub fn parse_max_passes(raw: &str) -> Result<u32> {
    let value: u32 = raw
        .trim()
        .parse()
        .with_context(|| format!("invalid pass limit '{raw}'"))?;
    if value == 0 {
        bail!("pass limit must be at least 1");
    }
    Ok(value)
}

/// Grace delay in milliseconds; zero means no delay.
pub fn parse_grace_ms(raw: &str) -> Result<Option<Duration>> {
    let millis: u64 = raw
        .trim()
        .parse()
        .with_context(|| format!("invalid grace delay '{raw}'"))?;
    Ok((millis > 0).then(|| Duration::from_millis(millis)))
}

pub fn max_passes_from_env() -> Result<u32> {
    match non_empty_var(ENV_MAX_PASSES) {
        Some(raw) => parse_max_passes(&raw).with_context(|| format!("reading {ENV_MAX_PASSES}")),
        None => Ok(DEFAULT_MAX_PASSES),
    }
}

pub fn grace_from_env() -> Result<Option<Duration>> {
    match non_empty_var(ENV_GRACE_MS) {
        Some(raw) => parse_grace_ms(&raw).with_context(|| format!("reading {ENV_GRACE_MS}")),
        None => Ok(None),
    }
}

pub fn support_units_from_env() -> Vec<String> {
    non_empty_var(ENV_SUPPORT_UNITS)
        .map(|raw| split_list(&raw))
        .unwrap_or_default()
}

/// Executable used to relaunch the capture out of process.
///
/// `LOADTRACE_EXE` wins when it names an executable file; otherwise the
/// running binary relaunches itself.
pub fn self_binary() -> Result<PathBuf> {
    if let Some(raw) = non_empty_var(ENV_EXE) {
        let candidate = PathBuf::from(raw);
        if helper_is_executable(&candidate) {
            return Ok(candidate);
        }
        bail!(
            "{ENV_EXE} points at {}, which is not an executable file",
            candidate.display()
        );
    }
    env::current_exe().context("unable to locate the running executable")
}

/// Returns true when a file exists and has any execute bit set.
pub fn helper_is_executable(path: &Path) -> bool {
    if !path.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(meta) = std::fs::metadata(path) {
            return meta.permissions().mode() & 0o111 != 0;
        }
        false
    }
    #[cfg(not(unix))]
    {
        true
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}
