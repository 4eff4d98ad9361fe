#![allow(dead_code)]

use anyhow::{Context, Result, bail};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Scratch tree for one test: candidate roots, archives and a store.
pub struct Fixture {
    temp: TempDir,
}

impl Fixture {
    pub fn new() -> Result<Self> {
        Ok(Self {
            temp: TempDir::new().context("allocating fixture directory")?,
        })
    }

    /// Canonical path under the fixture root.
    pub fn path(&self, relative: &str) -> PathBuf {
        let root = fs::canonicalize(self.temp.path()).unwrap_or_else(|_| self.temp.path().into());
        root.join(relative)
    }

    /// Write `body` to `<root>/<relative>`, creating parents.
    pub fn file(&self, root: &str, relative: &str, body: &str) -> Result<PathBuf> {
        let target = self.path(root).join(relative);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        fs::write(&target, body).with_context(|| format!("writing {}", target.display()))?;
        Ok(target)
    }

    /// Write a unit script for qualified name `name` under `root`.
    pub fn unit(&self, root: &str, name: &str, script: &str) -> Result<PathBuf> {
        let relative = format!("{}.unit", name.replace('.', "/"));
        self.file(root, &relative, script)
    }

    /// Build a stored zip archive from `(entry, body)` pairs.
    pub fn archive(&self, name: &str, entries: &[(&str, &str)]) -> Result<PathBuf> {
        let target = self.path(name);
        let file = File::create(&target).with_context(|| format!("creating {}", target.display()))?;
        let mut zip = ZipWriter::new(file);
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
        for (entry, body) in entries {
            zip.start_file(*entry, options)?;
            zip.write_all(body.as_bytes())?;
        }
        zip.finish().context("finishing fixture archive")?;
        Ok(target)
    }
}

/// Every regular file below `root`, relative to it, sorted.
pub fn files_under(root: &Path) -> Vec<PathBuf> {
    if !root.exists() {
        return Vec::new();
    }
    let mut files: Vec<PathBuf> = WalkDir::new(root)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.path().strip_prefix(root).ok().map(Path::to_path_buf))
        .collect();
    files.sort();
    files
}

pub fn loadtrace_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_loadtrace"))
}

pub fn run_command(mut cmd: Command) -> Result<Output> {
    let output = cmd
        .output()
        .with_context(|| format!("failed to run command: {:?}", cmd))?;
    if output.status.success() {
        Ok(output)
    } else {
        bail!(
            "command {:?} failed: status {:?}\nstdout: {}\nstderr: {}",
            cmd,
            output.status.code(),
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        )
    }
}
