//! Emptying a volume: delete everything, reformat if deletion fails.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::core::events::EventSink;
use crate::core::models::FormatOutcome;
use crate::error::FormatError;

pub const FORMAT_TIMEOUT: Duration = Duration::from_secs(120);

/// Largest volume still formatted as FAT32.
const FAT32_CEILING_GB: f64 = 32.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilesystemKind {
    Fat32,
    Exfat,
}

impl FilesystemKind {
    /// FAT32 up to 32 GB (or when the size is unknown), exFAT above.
    pub fn for_capacity(capacity_gb: Option<f64>) -> Self {
        match capacity_gb {
            Some(gb) if gb > FAT32_CEILING_GB => Self::Exfat,
            _ => Self::Fat32,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fat32 => "FAT32",
            Self::Exfat => "exFAT",
        }
    }
}

impl fmt::Display for FilesystemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// OS-level quick-format facility.
#[async_trait]
pub trait Formatter: Send + Sync {
    /// Quick-format the volume mounted at `volume`, leaving it mounted at the
    /// same place. Returns the tool's output on success.
    async fn format(&self, volume: &Path, filesystem: FilesystemKind) -> Result<String, FormatError>;
}

/// Format `volume_id` with a bounded timeout. Never fails the caller.
pub async fn format_volume(
    formatter: &dyn Formatter,
    volume_id: &str,
    measured_capacity_gb: Option<f64>,
    events: &EventSink,
) -> FormatOutcome {
    format_volume_within(formatter, volume_id, measured_capacity_gb, events, FORMAT_TIMEOUT).await
}

pub async fn format_volume_within(
    formatter: &dyn Formatter,
    volume_id: &str,
    measured_capacity_gb: Option<f64>,
    events: &EventSink,
    limit: Duration,
) -> FormatOutcome {
    let filesystem = FilesystemKind::for_capacity(measured_capacity_gb);
    events.warning(format!("Formatting {volume_id} as {filesystem}..."));
    info!(volume = %volume_id, filesystem = %filesystem, "Starting format");

    let result = match tokio::time::timeout(limit, formatter.format(Path::new(volume_id), filesystem)).await {
        Ok(result) => result,
        Err(_) => Err(FormatError::Timeout(limit.as_secs())),
    };

    match result {
        Ok(output) => {
            events.success(format!("{volume_id} formatted as {filesystem}."));
            info!(volume = %volume_id, "Format complete");
            FormatOutcome {
                success: true,
                diagnostic: output.trim().to_string(),
            }
        }
        Err(e) => {
            let diagnostic = e.to_string();
            events.error(format!("Formatting failed: {diagnostic}"));
            error!(volume = %volume_id, error = %diagnostic, "Format failed");
            FormatOutcome {
                success: false,
                diagnostic,
            }
        }
    }
}

/// Per-item deletion failure.
#[derive(Debug, Clone)]
pub struct DeletionError {
    pub path: PathBuf,
    pub message: String,
}

/// Delete every entry at the volume root, OS bookkeeping entries included.
/// Blocking; collects failures instead of stopping at the first one.
pub fn delete_contents(root: &Path) -> Vec<DeletionError> {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) => {
            return vec![DeletionError {
                path: root.to_path_buf(),
                message: e.to_string(),
            }];
        }
    };

    let mut errors = Vec::new();
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                errors.push(DeletionError {
                    path: root.to_path_buf(),
                    message: e.to_string(),
                });
                continue;
            }
        };

        let path = entry.path();
        debug!(path = %path.display(), "Deleting entry");

        let result = match entry.file_type() {
            Ok(ft) if ft.is_dir() => fs::remove_dir_all(&path),
            Ok(_) => fs::remove_file(&path),
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            warn!(path = %path.display(), error = %e, "Failed to delete entry");
            errors.push(DeletionError {
                path,
                message: e.to_string(),
            });
        }
    }
    errors
}

/// Empty the volume; on any deletion error fall back to a format.
///
/// Succeeds when every entry was deleted or the fallback format succeeded.
pub async fn clear_volume(
    formatter: &dyn Formatter,
    volume_id: &str,
    measured_capacity_gb: Option<f64>,
    events: &EventSink,
) -> bool {
    let root = PathBuf::from(volume_id);
    let errors = match tokio::task::spawn_blocking(move || delete_contents(&root)).await {
        Ok(errors) => errors,
        Err(e) => vec![DeletionError {
            path: PathBuf::from(volume_id),
            message: e.to_string(),
        }],
    };

    if errors.is_empty() {
        info!(volume = %volume_id, "Volume cleared");
        return true;
    }

    events.warning(format!(
        "Could not delete {} item(s). Trying to format...",
        errors.len()
    ));
    format_volume(formatter, volume_id, measured_capacity_gb, events)
        .await
        .success
}
