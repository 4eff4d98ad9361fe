//! Serializable record of one capture pass.
//!
//! The CLI prints one manifest per pass as a single JSON line on stdout.
//! Relaunched passes inherit stdout, so a multi-pass run produces an NDJSON
//! stream; [`parse_manifest_stream`] reads it back (or a JSON array of the
//! same records).

use crate::capture::Capture;
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

pub const MANIFEST_SCHEMA_VERSION: &str = "loadtrace_manifest_v1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Units and resources captured by a single pass.
///
/// `store` is `None` for captures that only collected in memory. Entries are
/// ordered by discovery key (units) or absolute path (resources).
pub struct Manifest {
    pub schema_version: String,
    pub pass: u32,
    pub entry: String,
    #[serde(default)]
    pub store: Option<PathBuf>,
    #[serde(default)]
    pub units: Vec<UnitRecord>,
    #[serde(default)]
    pub resources: Vec<ResourceRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitRecord {
    pub name: String,
    pub key: String,
    /// Location relative to the origin root.
    pub path: String,
    pub size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub name: String,
    pub path: PathBuf,
    pub size: usize,
}

impl Manifest {
    pub fn from_capture(pass: u32, entry: &str, capture: &Capture) -> Self {
        let units = capture
            .units()
            .into_values()
            .map(|unit| UnitRecord {
                name: unit.name.clone(),
                key: unit.key.to_string(),
                path: unit.relative_path.clone(),
                size: unit.content.len(),
            })
            .collect();
        let resources = capture
            .resources()
            .into_values()
            .map(|resource| ResourceRecord {
                size: resource.content.len(),
                name: resource.name,
                path: resource.path,
            })
            .collect();
        Manifest {
            schema_version: MANIFEST_SCHEMA_VERSION.to_string(),
            pass,
            entry: entry.to_string(),
            store: capture.store().map(PathBuf::from),
            units,
            resources,
        }
    }

    pub fn unit_names(&self) -> Vec<&str> {
        self.units.iter().map(|unit| unit.name.as_str()).collect()
    }

    pub fn to_json_line(&self) -> Result<String> {
        serde_json::to_string(self).context("serializing manifest")
    }
}

/// Parse manifests from a JSON array, a single object, or NDJSON.
pub fn parse_manifest_stream(input: &str) -> Result<Vec<Manifest>> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        bail!("no manifest input provided");
    }

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        let manifests: Vec<Manifest> = match value {
            Value::Array(items) => items
                .into_iter()
                .map(serde_json::from_value)
                .collect::<Result<Vec<_>, _>>()
                .context("unable to parse JSON array of manifests")?,
            Value::Object(_) => serde_json::from_value(value)
                .map(|manifest| vec![manifest])
                .context("unable to parse manifest")?,
            _ => bail!("unsupported JSON input; expected object or array"),
        };
        return check_versions(manifests);
    }

    let mut manifests = Vec::new();
    for (idx, line) in trimmed.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let manifest: Manifest = serde_json::from_str(line)
            .with_context(|| format!("unable to parse manifest from line {}", idx + 1))?;
        manifests.push(manifest);
    }
    check_versions(manifests)
}

fn check_versions(manifests: Vec<Manifest>) -> Result<Vec<Manifest>> {
    if manifests.is_empty() {
        bail!("no manifests found in input stream");
    }
    if let Some(other) = manifests
        .iter()
        .find(|manifest| manifest.schema_version != MANIFEST_SCHEMA_VERSION)
    {
        bail!(
            "unsupported manifest schema_version '{}' (expected {MANIFEST_SCHEMA_VERSION})",
            other.schema_version
        );
    }
    Ok(manifests)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(pass: u32) -> Manifest {
        Manifest {
            schema_version: MANIFEST_SCHEMA_VERSION.to_string(),
            pass,
            entry: "Demo".into(),
            store: Some(PathBuf::from("/store")),
            units: vec![UnitRecord {
                name: "Demo$Helper".into(),
                key: "/app/Demo$Helper.unit".into(),
                path: "Demo$Helper.unit".into(),
                size: 0,
            }],
            resources: Vec::new(),
        }
    }

    #[test]
    fn ndjson_and_array_inputs_agree() {
        let lines = format!(
            "{}\n\n{}\n",
            sample(2).to_json_line().unwrap(),
            sample(1).to_json_line().unwrap()
        );
        let from_lines = parse_manifest_stream(&lines).unwrap();
        let array = serde_json::to_string(&vec![sample(2), sample(1)]).unwrap();
        assert_eq!(parse_manifest_stream(&array).unwrap(), from_lines);
        assert_eq!(from_lines[1].unit_names(), vec!["Demo$Helper"]);
    }

    #[test]
    fn rejects_empty_and_foreign_input() {
        assert!(parse_manifest_stream("  \n").is_err());
        assert!(parse_manifest_stream("42").is_err());

        let mut foreign = sample(1);
        foreign.schema_version = "something_else".into();
        let err = parse_manifest_stream(&foreign.to_json_line().unwrap()).unwrap_err();
        assert!(err.to_string().contains("something_else"));

        let err = parse_manifest_stream("{\"pass\":1}\nnot json").unwrap_err();
        assert!(format!("{err:#}").contains("line 1"));
    }
}
