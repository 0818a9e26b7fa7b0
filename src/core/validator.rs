//! Safety checks run against a target volume before anything destructive.
//!
//! Checks run in a fixed order and stop at the first failure. Only a root
//! that cannot be listed is reported as corrupt; every policy mismatch means
//! the wrong volume was probably selected and is never auto-recovered.

use std::collections::BTreeSet;
use std::fs;
use std::io::{self, ErrorKind};
use std::path::Path;

use tracing::{debug, info};

use crate::core::models::ValidationVerdict;

/// Names the OS drops on removable media, compared case-insensitively.
const SYSTEM_ENTRIES: &[&str] = &[
    "system volume information",
    "$recycle.bin",
    "recycler",
    "$recyclebin",
    "found.000",
];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationPolicy {
    /// Lowercase extensions including the dot. Empty allows everything.
    pub allowed_extensions: BTreeSet<String>,
    pub max_files: usize,
    pub allow_subdirectories: bool,
    pub max_capacity_gb: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Other,
}

/// One entry of a volume root listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootEntry {
    pub name: String,
    pub kind: EntryKind,
}

impl RootEntry {
    pub fn file(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: EntryKind::File,
        }
    }

    pub fn directory(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: EntryKind::Directory,
        }
    }

    fn extension(&self) -> String {
        Path::new(&self.name)
            .extension()
            .map(|ext| format!(".{}", ext.to_string_lossy().to_lowercase()))
            .unwrap_or_default()
    }
}

/// OS bookkeeping entries plus anything hidden by a `$` or `.` prefix.
pub fn is_system_entry(name: &str) -> bool {
    let lower = name.to_lowercase();
    SYSTEM_ENTRIES.contains(&lower.as_str()) || name.starts_with('$') || name.starts_with('.')
}

/// List the volume root.
pub fn list_root(root: &Path) -> io::Result<Vec<RootEntry>> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        // file_type() does not follow symlinks; resolve them like the OS shell would.
        let kind = match fs::metadata(entry.path()) {
            Ok(meta) if meta.is_dir() => EntryKind::Directory,
            Ok(meta) if meta.is_file() => EntryKind::File,
            _ => EntryKind::Other,
        };
        entries.push(RootEntry { name, kind });
    }
    Ok(entries)
}

/// Turn a failed root listing into a verdict.
pub fn verdict_for_listing_error(volume_id: &str, error: &io::Error) -> ValidationVerdict {
    if error.kind() == ErrorKind::PermissionDenied {
        ValidationVerdict::rejected("No read access to this volume.")
    } else {
        ValidationVerdict::corrupt(format!(
            "Volume {volume_id} is not readable, the filesystem may be corrupt ({error})."
        ))
    }
}

/// Apply the policy checks to an already obtained root listing.
pub fn evaluate(
    entries: &[RootEntry],
    policy: &ValidationPolicy,
    measured_capacity_gb: Option<f64>,
) -> ValidationVerdict {
    let real: Vec<&RootEntry> = entries.iter().filter(|e| !is_system_entry(&e.name)).collect();

    if let (Some(max_gb), Some(size_gb)) = (policy.max_capacity_gb, measured_capacity_gb) {
        if size_gb > max_gb {
            return ValidationVerdict::rejected(format!(
                "Volume is {size_gb:.1} GB, the maximum allowed is {max_gb:.1} GB. Possibly the wrong volume."
            ));
        }
    }

    let subdirs = real.iter().filter(|e| e.kind == EntryKind::Directory).count();
    if subdirs > 0 && !policy.allow_subdirectories {
        return ValidationVerdict::rejected(format!(
            "Volume contains {subdirs} folder(s). Possibly the wrong volume (or allow folders in the settings)."
        ));
    }

    let files: Vec<&&RootEntry> = real.iter().filter(|e| e.kind == EntryKind::File).collect();
    if files.len() > policy.max_files {
        return ValidationVerdict::rejected(format!(
            "Volume contains {} files (max {}). Possibly the wrong volume.",
            files.len(),
            policy.max_files
        ));
    }

    if !policy.allowed_extensions.is_empty() {
        if let Some(bad) = files
            .iter()
            .find(|f| !policy.allowed_extensions.contains(&f.extension()))
        {
            return ValidationVerdict::rejected(format!(
                "Volume contains files that are not allowed (e.g. {}). Possibly the wrong volume.",
                bad.name
            ));
        }
    }

    ValidationVerdict::ok()
}

/// Validate the volume mounted at `volume_id`. Blocking.
pub fn validate_volume(
    volume_id: &str,
    policy: &ValidationPolicy,
    measured_capacity_gb: Option<f64>,
) -> ValidationVerdict {
    let verdict = match list_root(Path::new(volume_id)) {
        Ok(entries) => {
            debug!(volume = %volume_id, entries = entries.len(), "Volume root listed");
            evaluate(&entries, policy, measured_capacity_gb)
        }
        Err(e) => verdict_for_listing_error(volume_id, &e),
    };

    info!(
        volume = %volume_id,
        ok = verdict.ok,
        corrupt = verdict.is_corrupt,
        reason = %verdict.reason,
        "Volume validated"
    );
    verdict
}
