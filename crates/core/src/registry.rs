//! Module registry
//!
//! Holds the validated set of module descriptors loaded at startup from a
//! module listing file. Pure data plus validation and lookup; the registry
//! never mutates a descriptor after load.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::error::{Error, Result};

/// Launch settings for a module's worker process.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleLaunch {
    /// Program to run (absolute path or something on PATH)
    pub command: String,

    /// Arguments passed to the program
    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory for the process
    #[serde(default)]
    pub working_dir: Option<String>,

    /// Desired poll-loop parallelism inside the worker (MODULE_TASKS)
    #[serde(default)]
    pub parallelism: Option<u32>,

    /// Extra time after spawn before the module is considered Started, in
    /// seconds. Overrides the server-wide default when set.
    #[serde(default)]
    pub post_start_pause_secs: Option<u64>,

    /// Memory the module needs to operate, in MB. Informational only.
    #[serde(default)]
    pub required_mb: Option<u64>,

    /// Whether the worker may probe for GPU execution providers
    #[serde(default = "default_true")]
    pub enable_gpu: bool,
}

fn default_true() -> bool {
    true
}

/// Immutable description of one module, as loaded from the listing file.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleDescriptor {
    /// Unique module id
    #[serde(default)]
    pub module_id: String,

    /// Display name; defaults to the module id
    #[serde(default)]
    pub name: Option<String>,

    /// Module version string
    #[serde(default)]
    pub version: Option<String>,

    /// Queue the module's workers poll; defaults to `"<module_id>_queue"`
    #[serde(default)]
    pub queue: Option<String>,

    /// Whether the supervisor launches this module at startup
    #[serde(default)]
    pub auto_start: bool,

    /// Platforms the module supports: `"all"`, platform names, and
    /// `"!platform"` exclusions (an exclusion wins over `"all"`)
    #[serde(default)]
    pub platforms: Vec<String>,

    /// Lowest server version the module works with (inclusive)
    #[serde(default)]
    pub min_server_version: Option<String>,

    /// Highest server version the module works with (inclusive)
    #[serde(default)]
    pub max_server_version: Option<String>,

    /// How to launch the worker process; a module without launch settings
    /// can only be driven by externally started workers
    #[serde(default)]
    pub launch: Option<ModuleLaunch>,
}

impl ModuleDescriptor {
    /// The display name, falling back to the module id.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.module_id)
    }

    /// The effective queue name: explicit queue, or `"<module_id>_queue"`.
    /// Queue names are case-insensitive; the effective name is lowercased.
    pub fn queue_name(&self) -> String {
        match &self.queue {
            Some(queue) if !queue.trim().is_empty() => queue.trim().to_lowercase(),
            _ => format!("{}_queue", self.module_id.to_lowercase()),
        }
    }

    /// Checks the required fields. Invalid descriptors are dropped at load.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.module_id.trim().is_empty() {
            return Err("missing module id".into());
        }
        if self
            .module_id
            .chars()
            .any(|c| c.is_whitespace() || c == '/' || c == '\\')
        {
            return Err(format!("module id '{}' contains invalid characters", self.module_id));
        }
        if let Some(launch) = &self.launch {
            if launch.command.trim().is_empty() {
                return Err(format!("module '{}' has launch settings without a command", self.module_id));
            }
        }
        Ok(())
    }

    /// Whether the module supports the given platform.
    ///
    /// An empty list means "all". A `"!platform"` entry excludes that
    /// platform even when `"all"` is present, and a list holding only
    /// exclusions means "everything except those".
    pub fn supports_platform(&self, platform: &str) -> bool {
        if self.platforms.is_empty() {
            return true;
        }
        let excluded = self
            .platforms
            .iter()
            .filter_map(|p| p.strip_prefix('!'))
            .any(|p| p.eq_ignore_ascii_case(platform));
        if excluded {
            return false;
        }
        let has_positive = self.platforms.iter().any(|p| !p.starts_with('!'));
        if !has_positive {
            return true;
        }
        self.platforms
            .iter()
            .any(|p| p.eq_ignore_ascii_case("all") || p.eq_ignore_ascii_case(platform))
    }

    /// Whether the module's server-version range admits `server_version`.
    pub fn supports_version(&self, server_version: &str) -> bool {
        let server = version_key(server_version);
        if let Some(min) = &self.min_server_version {
            if server < version_key(min) {
                return false;
            }
        }
        if let Some(max) = &self.max_server_version {
            if server > version_key(max) {
                return false;
            }
        }
        true
    }

    /// Platform plus version availability in one check.
    pub fn is_available(&self, platform: &str, server_version: &str) -> bool {
        self.supports_platform(platform) && self.supports_version(server_version)
    }
}

/// Sort key for dotted numeric versions ("2.5.1" → [2, 5, 1]).
///
/// Non-numeric segments compare as 0, which makes malformed constraints
/// permissive rather than silently disabling a module.
fn version_key(version: &str) -> Vec<u64> {
    version
        .trim()
        .split('.')
        .map(|part| part.trim().parse::<u64>().unwrap_or(0))
        .collect()
}

/// The validated set of module descriptors.
#[derive(Debug, Default)]
pub struct ModuleRegistry {
    modules: Vec<ModuleDescriptor>,
    by_id: HashMap<String, usize>,
    platform: String,
}

impl ModuleRegistry {
    /// Builds a registry from descriptors, dropping invalid ones with a
    /// warning. Duplicate ids keep the first occurrence.
    pub fn new(descriptors: Vec<ModuleDescriptor>) -> Self {
        Self::with_platform(descriptors, current_platform())
    }

    /// As [`ModuleRegistry::new`] with an explicit platform string.
    pub fn with_platform(descriptors: Vec<ModuleDescriptor>, platform: impl Into<String>) -> Self {
        let mut modules = Vec::with_capacity(descriptors.len());
        let mut by_id = HashMap::new();

        for descriptor in descriptors {
            if let Err(reason) = descriptor.validate() {
                warn!(module_id = %descriptor.module_id, %reason, "Dropping invalid module descriptor");
                continue;
            }
            if by_id.contains_key(&descriptor.module_id) {
                warn!(module_id = %descriptor.module_id, "Dropping duplicate module descriptor");
                continue;
            }
            by_id.insert(descriptor.module_id.clone(), modules.len());
            modules.push(descriptor);
        }

        Self {
            modules,
            by_id,
            platform: platform.into(),
        }
    }

    /// Loads a registry from a module listing file.
    ///
    /// The listing is either a JSON array of descriptors or a map of
    /// id → descriptor (both shapes exist in the wild; in the map shape the
    /// key wins over any embedded `moduleId`).
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read module listing {}: {e}", path.display()))
        })?;
        let value: Value = serde_json::from_str(&text).map_err(|e| {
            Error::Config(format!("cannot parse module listing {}: {e}", path.display()))
        })?;

        let descriptors = match value {
            Value::Array(entries) => entries
                .into_iter()
                .filter_map(|entry| deserialize_entry(entry, None))
                .collect(),
            Value::Object(map) => map
                .into_iter()
                .filter_map(|(id, entry)| deserialize_entry(entry, Some(id)))
                .collect(),
            _ => {
                return Err(Error::Config(format!(
                    "module listing {} must be a JSON array or object",
                    path.display()
                )))
            }
        };

        Ok(Self::new(descriptors))
    }

    /// Looks up a descriptor by module id.
    pub fn get(&self, module_id: &str) -> Option<&ModuleDescriptor> {
        self.by_id.get(module_id).map(|&i| &self.modules[i])
    }

    /// Iterates descriptors in listing order.
    pub fn iter(&self) -> impl Iterator<Item = &ModuleDescriptor> {
        self.modules.iter()
    }

    /// Number of valid modules.
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// The platform string availability checks run against.
    pub fn platform(&self) -> &str {
        &self.platform
    }
}

fn deserialize_entry(entry: Value, id_from_key: Option<String>) -> Option<ModuleDescriptor> {
    match serde_json::from_value::<ModuleDescriptor>(entry) {
        Ok(mut descriptor) => {
            if let Some(id) = id_from_key {
                descriptor.module_id = id;
            }
            Some(descriptor)
        }
        Err(e) => {
            warn!(error = %e, "Skipping unreadable module listing entry");
            None
        }
    }
}

/// The platform string modules are matched against.
pub fn current_platform() -> String {
    std::env::consts::OS.to_string()
}
