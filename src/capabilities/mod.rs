//! Capability Registry
//!
//! Named operations generated code may call as `actions.<name>(...)`.
//! Capabilities are declared by JSON manifests in a source directory and
//! can be reloaded at any time; every execution sees the immutable
//! snapshot that was current when it started.

mod builtin;
mod script;

pub use builtin::{render, BuiltinCapability, BuiltinOp};
pub use script::{ScriptCapability, ScriptLanguage, DEFAULT_SCRIPT_TIMEOUT};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

/// A callable exposed to generated code.
pub trait Capability: Send + Sync {
    /// Get the unique name of the capability
    fn name(&self) -> String;

    /// Get a description of what the capability does
    fn description(&self) -> String;

    /// Invoke with positional arguments
    fn call(&self, args: &[Value]) -> Result<Value>;
}

/// Manifest entry for one capability
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityManifest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Built-in operation backing this capability
    #[serde(default)]
    pub builtin: Option<String>,
    /// "python", "node" or "shell" for script capabilities
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub script_path: Option<String>,
    /// Per-run deadline for script capabilities
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ManifestFile {
    One(CapabilityManifest),
    Many(Vec<CapabilityManifest>),
}

impl CapabilityManifest {
    fn into_capability(self, base_path: &Path) -> Result<Arc<dyn Capability>> {
        if let Some(op) = &self.builtin {
            let op = BuiltinOp::parse(op).with_context(|| format!("Unknown builtin '{}' for capability {}", op, self.name))?;
            return Ok(Arc::new(BuiltinCapability::new(self.name, self.description, op)));
        }

        match (&self.language, &self.script_path) {
            (Some(language), Some(script_path)) => {
                let language = ScriptLanguage::parse(language)
                    .with_context(|| format!("Unsupported language '{}' for capability {}", language, self.name))?;
                let mut capability =
                    ScriptCapability::new(self.name, self.description, language, base_path.join(script_path));
                if let Some(ms) = self.timeout_ms {
                    capability = capability.with_timeout(std::time::Duration::from_millis(ms));
                }
                Ok(Arc::new(capability))
            }
            _ => anyhow::bail!("Capability {} declares neither a builtin nor a script", self.name),
        }
    }
}

/// Immutable view of the registry handed to one execution.
#[derive(Default, Clone)]
pub struct CapabilitySet {
    entries: HashMap<String, Arc<dyn Capability>>,
}

impl CapabilitySet {
    /// Every built-in operation under its default name.
    pub fn builtins() -> Self {
        BuiltinCapability::standard_set()
            .into_iter()
            .map(|c| Arc::new(c) as Arc<dyn Capability>)
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Capability>> {
        self.entries.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Sorted for stable prompts.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn with(&self, capability: Arc<dyn Capability>) -> Self {
        let mut entries = self.entries.clone();
        entries.insert(capability.name(), capability);
        Self { entries }
    }
}

impl FromIterator<Arc<dyn Capability>> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Arc<dyn Capability>>>(iter: I) -> Self {
        let entries = iter.into_iter().map(|c| (c.name(), c)).collect();
        Self { entries }
    }
}

impl std::fmt::Debug for CapabilitySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilitySet").field("names", &self.names()).finish()
    }
}

pub struct CapabilityRegistry {
    current: RwLock<Arc<CapabilitySet>>,
    source_dir: Option<PathBuf>,
}

impl CapabilityRegistry {
    /// Registry backed by a manifest directory. Empty until [`reload`](Self::reload).
    pub fn new(source_dir: impl Into<PathBuf>) -> Self {
        Self {
            current: RwLock::new(Arc::new(CapabilitySet::default())),
            source_dir: Some(source_dir.into()),
        }
    }

    /// Registry with no source; populated only through `register_*`.
    pub fn detached() -> Self {
        Self {
            current: RwLock::new(Arc::new(CapabilitySet::default())),
            source_dir: None,
        }
    }

    /// Register a capability instance
    pub async fn register_instance<C: Capability + 'static>(&self, capability: C) {
        let mut current = self.current.write().await;
        *current = Arc::new(current.with(Arc::new(capability)));
    }

    /// Register every built-in operation under its default name
    pub async fn register_builtins(&self) {
        for capability in BuiltinCapability::standard_set() {
            self.register_instance(capability).await;
        }
    }

    /// Rebuild the set from the source directory. A missing directory
    /// yields an empty registry; broken manifests are skipped.
    pub async fn reload(&self) -> Result<usize> {
        let Some(dir) = &self.source_dir else {
            return Ok(self.current.read().await.len());
        };

        let set = Self::load_dir(dir)?;
        let count = set.len();
        tracing::info!("⚡ Loaded capabilities: {}", set.names().join(", "));
        *self.current.write().await = Arc::new(set);
        Ok(count)
    }

    fn load_dir(dir: &Path) -> Result<CapabilitySet> {
        let mut set = CapabilitySet::default();
        if !dir.exists() {
            tracing::warn!("Capability directory {:?} not found; registry is empty", dir);
            return Ok(set);
        }

        let mut manifests: Vec<PathBuf> = std::fs::read_dir(dir)
            .with_context(|| format!("Failed to read capability directory {:?}", dir))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().and_then(|s| s.to_str()) == Some("json"))
            .collect();
        manifests.sort();

        for path in manifests {
            let entries = match Self::read_manifest(&path) {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::warn!("Failed to load capability manifest at {:?}: {:#}", path, e);
                    continue;
                }
            };

            for manifest in entries {
                let name = manifest.name.clone();
                match manifest.into_capability(dir) {
                    Ok(capability) => set = set.with(capability),
                    Err(e) => tracing::warn!("Skipping capability {}: {:#}", name, e),
                }
            }
        }

        Ok(set)
    }

    fn read_manifest(path: &Path) -> Result<Vec<CapabilityManifest>> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read capability manifest at {:?}", path))?;
        let file: ManifestFile = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse capability manifest at {:?}", path))?;
        Ok(match file {
            ManifestFile::One(manifest) => vec![manifest],
            ManifestFile::Many(manifests) => manifests,
        })
    }

    /// The set executions should use right now
    pub async fn snapshot(&self) -> Arc<CapabilitySet> {
        self.current.read().await.clone()
    }

    /// Get all capability names, sorted
    pub async fn names(&self) -> Vec<String> {
        self.current.read().await.names()
    }
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new("capabilities")
    }
}
