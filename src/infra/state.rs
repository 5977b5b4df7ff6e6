//! Local Terraform state inspection and cleanup.
//!
//! Each project has two candidate working directories under
//! `<infra_root>/<project_id>/`. Whichever holds a non-empty state file
//! modified most recently is authoritative.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::Deserialize;
use tracing::debug;

use crate::errors::InfraError;

pub const STATE_FILE: &str = "terraform.tfstate";
pub const PLACEHOLDER_FILE: &str = "shipyard_placeholder.tf";
pub const PLACEHOLDER_MARKER: &str = ".shipyard-placeholder";

/// Local artifacts removed after a successful destroy.
const STATE_ARTIFACTS: &[&str] = &[
    STATE_FILE,
    "terraform.tfstate.backup",
    ".terraform.lock.hcl",
    ".terraform.tfstate.lock.info",
    super::terraform::PLAN_FILE,
    PLACEHOLDER_FILE,
    PLACEHOLDER_MARKER,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateLocation {
    Validation,
    Deployment,
}

impl StateLocation {
    pub const ALL: [StateLocation; 2] = [StateLocation::Validation, StateLocation::Deployment];

    pub fn dir_name(self) -> &'static str {
        match self {
            StateLocation::Validation => "validation",
            StateLocation::Deployment => "deployment",
        }
    }

    pub fn path(self, project_root: &Path) -> PathBuf {
        project_root.join(self.dir_name())
    }
}

impl fmt::Display for StateLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

#[derive(Debug, Deserialize)]
struct StateFile {
    #[serde(default)]
    resources: Vec<StateResource>,
}

#[derive(Debug, Deserialize)]
struct StateResource {
    #[serde(default)]
    mode: Option<String>,
    #[serde(rename = "type")]
    kind: String,
    name: String,
    #[serde(default)]
    module: Option<String>,
    #[serde(default)]
    provider: Option<String>,
}

impl StateResource {
    fn address(&self) -> String {
        let prefix = if self.mode.as_deref() == Some("data") {
            "data."
        } else {
            ""
        };
        match &self.module {
            Some(module) => format!("{}.{}{}.{}", module, prefix, self.kind, self.name),
            None => format!("{}{}.{}", prefix, self.kind, self.name),
        }
    }
}

fn read_state(dir: &Path) -> Option<String> {
    std::fs::read_to_string(dir.join(STATE_FILE)).ok()
}

/// A non-empty `resources` array, or a non-empty file that doesn't parse.
pub fn has_state(dir: &Path) -> bool {
    let Some(content) = read_state(dir) else {
        return false;
    };
    if content.trim().is_empty() {
        return false;
    }
    match serde_json::from_str::<StateFile>(&content) {
        Ok(state) => !state.resources.is_empty(),
        Err(e) => {
            debug!(dir = %dir.display(), error = %e, "unparsable state counts as present");
            true
        }
    }
}

fn state_mtime(dir: &Path) -> Option<SystemTime> {
    std::fs::metadata(dir.join(STATE_FILE))
        .and_then(|m| m.modified())
        .ok()
}

/// Locations holding state, most recently modified first.
pub fn locations_with_state(project_root: &Path) -> Vec<StateLocation> {
    let mut found: Vec<(StateLocation, Option<SystemTime>)> = StateLocation::ALL
        .into_iter()
        .filter(|loc| has_state(&loc.path(project_root)))
        .map(|loc| (loc, state_mtime(&loc.path(project_root))))
        .collect();
    found.sort_by(|a, b| b.1.cmp(&a.1));
    found.into_iter().map(|(loc, _)| loc).collect()
}

/// The location whose state reflects reality, if any holds state.
pub fn authoritative_location(project_root: &Path) -> Option<StateLocation> {
    locations_with_state(project_root).into_iter().next()
}

/// Managed and data resource addresses read straight from the state file.
pub fn resource_addresses(dir: &Path) -> Vec<String> {
    read_state(dir)
        .and_then(|c| serde_json::from_str::<StateFile>(&c).ok())
        .map(|s| s.resources.iter().map(StateResource::address).collect())
        .unwrap_or_default()
}

/// Provider short names (`aws`, `random`, ...) referenced by the state.
pub fn providers_in_state(dir: &Path) -> BTreeSet<String> {
    let Some(state) = read_state(dir).and_then(|c| serde_json::from_str::<StateFile>(&c).ok())
    else {
        return BTreeSet::new();
    };
    state
        .resources
        .iter()
        .filter_map(|r| r.provider.as_deref())
        .filter_map(provider_short_name)
        .collect()
}

/// `provider["registry.terraform.io/hashicorp/aws"].west` → `aws`.
fn provider_short_name(provider: &str) -> Option<String> {
    let start = provider.find('"')? + 1;
    let rest = &provider[start..];
    let end = rest.find('"')?;
    let source = &rest[..end];
    source.rsplit('/').next().filter(|s| !s.is_empty()).map(String::from)
}

/// Whether any `*.tf` file exists directly in `dir`.
pub fn has_configuration(dir: &Path) -> bool {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries.filter_map(|e| e.ok()).any(|e| {
                e.path().extension().and_then(|x| x.to_str()) == Some("tf") && e.path().is_file()
            })
        })
        .unwrap_or(false)
}

pub fn is_placeholder(dir: &Path) -> bool {
    dir.join(PLACEHOLDER_MARKER).exists()
}

/// Write a provider-only configuration so `terraform destroy` can run
/// against state whose source is gone.
pub fn write_placeholder(
    dir: &Path,
    default_provider: &str,
    default_region: &str,
) -> Result<BTreeSet<String>, InfraError> {
    let mut providers = providers_in_state(dir);
    if providers.is_empty() {
        providers.insert(default_provider.to_string());
    }

    let mut body = String::from("# Generated by shipyard to destroy orphaned state. Never apply.\n");
    for provider in &providers {
        if provider == "aws" {
            body.push_str(&format!(
                "\nprovider \"aws\" {{\n  region = \"{}\"\n}}\n",
                default_region
            ));
        } else {
            body.push_str(&format!("\nprovider \"{}\" {{}}\n", provider));
        }
    }

    let file = dir.join(PLACEHOLDER_FILE);
    std::fs::write(&file, body).map_err(|source| InfraError::Io { path: file, source })?;
    let marker = dir.join(PLACEHOLDER_MARKER);
    std::fs::write(&marker, "placeholder\n")
        .map_err(|source| InfraError::Io { path: marker, source })?;
    Ok(providers)
}

/// Remove the placeholder configuration and its marker. Returns whether
/// either existed.
pub fn remove_placeholder(dir: &Path) -> Result<bool, InfraError> {
    let mut removed = false;
    for name in [PLACEHOLDER_FILE, PLACEHOLDER_MARKER] {
        let path = dir.join(name);
        if path.exists() {
            std::fs::remove_file(&path).map_err(|source| InfraError::Io {
                path: path.clone(),
                source,
            })?;
            removed = true;
        }
    }
    Ok(removed)
}

/// Remove every local state artifact in `dir`. Returns the removed names.
pub fn clean_artifacts(dir: &Path) -> Result<Vec<String>, InfraError> {
    let mut removed = Vec::new();
    for name in STATE_ARTIFACTS {
        let path = dir.join(name);
        if path.exists() {
            std::fs::remove_file(&path).map_err(|source| InfraError::Io {
                path: path.clone(),
                source,
            })?;
            removed.push(name.to_string());
        }
    }
    let plugins = dir.join(".terraform");
    if plugins.exists() {
        std::fs::remove_dir_all(&plugins).map_err(|source| InfraError::Io {
            path: plugins.clone(),
            source,
        })?;
        removed.push(".terraform/".to_string());
    }
    Ok(removed)
}

/// Whether any state artifact remains in `dir`.
pub fn has_artifacts(dir: &Path) -> bool {
    STATE_ARTIFACTS.iter().any(|n| dir.join(n).exists()) || dir.join(".terraform").exists()
}
