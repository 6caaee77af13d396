//! Path policy for files an agent step may touch.
//!
//! Patterns use shell-style globs where `*` also crosses `/`, so `.runtime/**`
//! and `.runtime/*` both cover every file under `.runtime/`.

use std::path::{Component, Path};

use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyMode {
    /// Everything is allowed except the denylist.
    #[default]
    AllowAllWithDenylist,
    /// Only the allowlist is allowed, and the denylist still wins.
    Allowlist,
}

/// Why a path was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathVerdict {
    Allowed,
    Denied { pattern: String },
    NotAllowlisted,
    /// Absolute path or a `..` component.
    Escapes,
}

impl PathVerdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, PathVerdict::Allowed)
    }
}

#[derive(Debug, Clone)]
pub struct PathPolicy {
    mode: PolicyMode,
    allowed: GlobSet,
    denied: GlobSet,
    denied_patterns: Vec<String>,
}

impl PathPolicy {
    pub fn new(mode: PolicyMode, allowed: &[String], denied: &[String]) -> Result<Self> {
        Ok(Self {
            mode,
            allowed: build_set(allowed).context("build allowed path globs")?,
            denied: build_set(denied).context("build denied path globs")?,
            denied_patterns: denied.to_vec(),
        })
    }

    pub fn mode(&self) -> PolicyMode {
        self.mode
    }

    pub fn check(&self, raw: &str) -> PathVerdict {
        let Some(path) = normalize(raw) else {
            return PathVerdict::Escapes;
        };
        if let Some(idx) = self.denied.matches(&path).first() {
            return PathVerdict::Denied {
                pattern: self.denied_patterns[*idx].clone(),
            };
        }
        if self.mode == PolicyMode::Allowlist && !self.allowed.is_match(&path) {
            return PathVerdict::NotAllowlisted;
        }
        PathVerdict::Allowed
    }

    /// Paths that fail the policy, in input order.
    pub fn violations(&self, paths: &[String]) -> Vec<String> {
        paths
            .iter()
            .filter(|path| !self.check(path).is_allowed())
            .cloned()
            .collect()
    }

    /// Whether `path` matches the denylist (ignores allowlist mode).
    pub fn is_denied(&self, raw: &str) -> bool {
        matches!(
            self.check(raw),
            PathVerdict::Denied { .. } | PathVerdict::Escapes
        )
    }
}

fn build_set(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern.trim()).with_context(|| format!("invalid glob '{pattern}'"))?;
        builder.add(glob);
    }
    Ok(builder.build()?)
}

/// Normalize a repo-relative path to forward slashes without `./` prefixes.
///
/// Returns `None` for paths that leave the workspace.
fn normalize(raw: &str) -> Option<String> {
    let unified = raw.trim().replace('\\', "/");
    let path = Path::new(&unified);
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}
