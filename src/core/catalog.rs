//! Registry of deployable versions.
//!
//! Every non-hidden immediate subdirectory of the source root is a version.
//! User-entered metadata lives in `versions.json` inside the source root and
//! is merged with whatever subdirectories exist at load time.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::CatalogError;

pub const CATALOG_FILE: &str = "versions.json";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRecord {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub function: String,
}

impl VersionRecord {
    /// One-line summary, `None` when no metadata was entered.
    pub fn summary(&self) -> Option<String> {
        let mut parts = Vec::new();
        if !self.description.is_empty() {
            parts.push(self.description.clone());
        }
        if !self.function.is_empty() {
            parts.push(format!("Function: {}", self.function));
        }
        (!parts.is_empty()).then(|| parts.join("  "))
    }
}

#[derive(Debug, Clone)]
pub struct VersionCatalog {
    path: PathBuf,
    entries: BTreeMap<String, VersionRecord>,
}

impl VersionCatalog {
    /// Load the catalog for `source_root`, registering new subdirectories.
    ///
    /// Entries for subdirectories that have since disappeared are kept.
    pub fn load(source_root: &Path) -> Result<Self, CatalogError> {
        let path = source_root.join(CATALOG_FILE);
        let existed = path.exists();
        let mut entries = if existed {
            read_entries(&path)
        } else {
            BTreeMap::new()
        };

        let mut changed = false;
        for name in scan_versions(source_root)? {
            if !entries.contains_key(&name) {
                debug!(version = %name, "Registering new version");
                entries.insert(name, VersionRecord::default());
                changed = true;
            }
        }

        let catalog = Self { path, entries };
        if changed || !existed {
            catalog.save()?;
        }

        info!(
            path = %catalog.path.display(),
            versions = catalog.entries.len(),
            "Version catalog loaded"
        );
        Ok(catalog)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn get(&self, name: &str) -> Option<&VersionRecord> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// The remembered version if it is still catalogued, else the first one.
    pub fn preferred<'a>(&'a self, last_version: &str) -> Option<&'a str> {
        if let Some((name, _)) = self.entries.get_key_value(last_version) {
            return Some(name.as_str());
        }
        self.names().next()
    }

    pub fn update(
        &mut self,
        name: &str,
        description: impl Into<String>,
        function: impl Into<String>,
    ) -> Result<(), CatalogError> {
        let record = self
            .entries
            .get_mut(name)
            .ok_or_else(|| CatalogError::UnknownVersion(name.to_string()))?;
        record.description = description.into();
        record.function = function.into();
        self.save()
    }

    /// Rewrite the whole catalog file through a temporary sibling.
    fn save(&self) -> Result<(), CatalogError> {
        let content = serde_json::to_string_pretty(&self.entries)?;
        let tmp = self.path.with_extension("json.tmp");
        let write_err = |source| CatalogError::Write {
            path: self.path.clone(),
            source,
        };

        fs::write(&tmp, content).map_err(write_err)?;
        fs::rename(&tmp, &self.path).map_err(write_err)?;
        Ok(())
    }
}

fn read_entries(path: &Path) -> BTreeMap<String, VersionRecord> {
    let parsed: Result<BTreeMap<String, VersionRecord>, String> = fs::read_to_string(path)
        .map_err(|e| e.to_string())
        .and_then(|content| serde_json::from_str(&content).map_err(|e| e.to_string()));

    match parsed {
        Ok(entries) => entries,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Version catalog unreadable, starting empty");
            BTreeMap::new()
        }
    }
}

fn scan_versions(source_root: &Path) -> Result<Vec<String>, CatalogError> {
    let unreadable = |source| CatalogError::SourceUnreadable {
        path: source_root.to_path_buf(),
        source,
    };

    let mut names = Vec::new();
    for entry in fs::read_dir(source_root).map_err(unreadable)? {
        let entry = entry.map_err(unreadable)?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') {
            continue;
        }
        if entry.path().is_dir() {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}
