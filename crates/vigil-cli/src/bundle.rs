//! # Policy Bundles
//!
//! Loading bundle files and building an in-memory engine from them.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Deserialize;

use vigil_core::SubjectId;
use vigil_policy::model::PolicyDraft;
use vigil_policy::{EngineConfig, Policy, PolicyEngine, StaticDirectory, SubjectAttributes};

/// Actor recorded in the ledger for policies loaded from a bundle.
pub const BUNDLE_ACTOR: &str = "vigil-cli";

/// One subject in a bundle's static directory.
#[derive(Debug, Clone, Deserialize)]
pub struct DirectoryEntry {
    /// Subject the entry describes.
    pub subject_id: String,
    /// Identifier matched by user scopes; defaults to the subject ID.
    #[serde(default)]
    pub identifier: Option<String>,
    /// Department.
    #[serde(default)]
    pub department: Option<String>,
    /// Role.
    #[serde(default)]
    pub role: Option<String>,
}

/// A bundle as written on disk.
///
/// Policies stay untyped until [`Bundle::drafts`] so that one malformed
/// policy does not hide problems in the others.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Bundle {
    /// Policy definitions.
    #[serde(default)]
    pub policies: Vec<serde_yaml::Value>,
    /// Static subject directory.
    #[serde(default)]
    pub directory: Vec<DirectoryEntry>,
}

/// Outcome of loading one bundle policy.
#[derive(Debug)]
pub struct LoadedPolicy {
    /// Position in the bundle, zero-based.
    pub index: usize,
    /// Name if the entry carries one.
    pub name: Option<String>,
    /// The created policy, or why it was rejected.
    pub result: Result<Arc<Policy>, String>,
}

impl Bundle {
    /// Read and parse a bundle file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read bundle: {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("failed to parse bundle: {}", path.display()))
    }

    /// Parse bundle text. YAML is a superset of JSON, so both are accepted.
    pub fn parse(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    /// Decode each policy entry independently.
    pub fn drafts(&self) -> Vec<(Option<String>, Result<PolicyDraft, String>)> {
        self.policies
            .iter()
            .map(|value| {
                let name = value
                    .get("name")
                    .and_then(serde_yaml::Value::as_str)
                    .map(str::to_string);
                let draft = serde_yaml::from_value::<PolicyDraft>(value.clone()).map_err(|e| e.to_string());
                (name, draft)
            })
            .collect()
    }

    /// Build the static directory.
    pub fn directory(&self) -> Result<StaticDirectory> {
        let directory = StaticDirectory::new();
        for entry in &self.directory {
            let subject = SubjectId::new(entry.subject_id.clone())
                .with_context(|| format!("invalid directory subject_id {:?}", entry.subject_id))?;
            let identifier = entry.identifier.clone().unwrap_or_else(|| entry.subject_id.clone());
            directory.insert(
                subject,
                SubjectAttributes {
                    identifier,
                    department: entry.department.clone(),
                    role: entry.role.clone(),
                },
            );
        }
        Ok(directory)
    }

    /// Build an in-memory engine and load every policy into it.
    ///
    /// Rejected policies are reported in the returned list, not as an error.
    pub fn into_engine(&self) -> Result<(PolicyEngine, Vec<LoadedPolicy>)> {
        let directory = self.directory()?;
        let engine = PolicyEngine::in_memory(EngineConfig::default(), Arc::new(directory))
            .context("failed to build engine")?;
        let loaded = self
            .drafts()
            .into_iter()
            .enumerate()
            .map(|(index, (name, draft))| {
                let result = draft.and_then(|draft| {
                    engine
                        .store()
                        .create_policy(draft, BUNDLE_ACTOR)
                        .map_err(|e| e.to_string())
                });
                LoadedPolicy { index, name, result }
            })
            .collect();
        Ok((engine, loaded))
    }
}

/// Build an engine, failing on the first rejected policy.
pub fn load_engine(path: &Path) -> Result<PolicyEngine> {
    let bundle = Bundle::load(path)?;
    let (engine, loaded) = bundle.into_engine()?;
    if let Some(bad) = loaded.iter().find(|p| p.result.is_err()) {
        let reason = bad.result.as_ref().err().cloned().unwrap_or_default();
        anyhow::bail!(
            "policy #{} ({}) is invalid: {reason}; run `vigil validate` for a full report",
            bad.index + 1,
            bad.name.as_deref().unwrap_or("unnamed")
        );
    }
    Ok(engine)
}

/// Single-threaded runtime for the async engine calls.
pub fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")
}
