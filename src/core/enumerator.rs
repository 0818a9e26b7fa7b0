use async_trait::async_trait;
use tracing::{debug, warn};

use crate::core::models::{BYTES_PER_GB, VolumeDescriptor};

/// Anything smaller is an empty slot of a multi-card reader.
pub const MIN_VOLUME_GB: f64 = 0.01;

/// Filesystems that mark a volume as removable media even without the flag.
const REMOVABLE_FILESYSTEMS: &[&str] = &["fat32", "fat", "exfat", "vfat", "msdos"];

/// Boot and EFI partitions are FAT too but never removable media.
const SYSTEM_MOUNT_POINTS: &[&str] = &["/", "/boot", "/boot/efi", "/efi"];

/// A way of asking the OS for mounted removable volumes.
#[async_trait]
pub trait VolumeProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Volumes that could not be measured are left out rather than failing
    /// the whole listing.
    async fn list(&self) -> anyhow::Result<Vec<VolumeDescriptor>>;
}

/// A raw partition as reported by the OS, before filtering.
#[derive(Debug, Clone)]
pub struct PartitionInfo {
    pub mount_point: String,
    pub filesystem: String,
    pub removable: bool,
    pub total_bytes: u64,
}

pub fn is_removable_filesystem(filesystem: &str) -> bool {
    REMOVABLE_FILESYSTEMS.contains(&filesystem.to_lowercase().as_str())
}

pub fn is_system_mount_point(mount_point: &str) -> bool {
    let trimmed = match mount_point.trim_end_matches('/') {
        "" => "/",
        other => other,
    };
    SYSTEM_MOUNT_POINTS.contains(&trimmed) || trimmed.starts_with("/boot/")
}

pub fn display_label(id: &str, name: Option<&str>, capacity_bytes: u64) -> String {
    let gb = capacity_bytes as f64 / BYTES_PER_GB;
    match name {
        Some(name) => format!("{id}  {name}  [{gb:.1} GB]"),
        None => format!("{id}  [{gb:.1} GB]"),
    }
}

/// Keep a partition if it is removable media with a real card inserted.
pub fn admit(partition: &PartitionInfo) -> Option<VolumeDescriptor> {
    if is_system_mount_point(&partition.mount_point) {
        return None;
    }
    if !partition.removable && !is_removable_filesystem(&partition.filesystem) {
        return None;
    }
    if (partition.total_bytes as f64 / BYTES_PER_GB) < MIN_VOLUME_GB {
        return None;
    }

    let id = partition.mount_point.clone();
    let trimmed = id.trim_end_matches('\\');
    Some(VolumeDescriptor {
        label: display_label(trimmed, None, partition.total_bytes),
        id,
        capacity_bytes: partition.total_bytes,
    })
}

/// Ask each provider in turn; the first non-empty answer wins.
///
/// Never fails: a provider error just moves on to the next provider.
pub async fn list_removable_volumes(providers: &[Box<dyn VolumeProvider>]) -> Vec<VolumeDescriptor> {
    for provider in providers {
        match provider.list().await {
            Ok(mut volumes) if !volumes.is_empty() => {
                volumes.sort_by(|a, b| a.id.cmp(&b.id));
                volumes.dedup_by(|a, b| a.id == b.id);
                debug!(provider = provider.name(), count = volumes.len(), "Removable volumes found");
                return volumes;
            }
            Ok(_) => debug!(provider = provider.name(), "No removable volumes"),
            Err(e) => warn!(provider = provider.name(), error = %e, "Volume enumeration failed"),
        }
    }
    Vec::new()
}
