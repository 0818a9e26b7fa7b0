use anyhow::Result;
use async_trait::async_trait;
use sysinfo::Disks;

use crate::core::enumerator::{PartitionInfo, VolumeProvider, admit};
use crate::core::models::VolumeDescriptor;

/// Portable partition listing through `sysinfo`.
pub struct SysinfoProvider;

#[async_trait]
impl VolumeProvider for SysinfoProvider {
    fn name(&self) -> &'static str {
        "sysinfo"
    }

    async fn list(&self) -> Result<Vec<VolumeDescriptor>> {
        let volumes = tokio::task::spawn_blocking(|| {
            let disks = Disks::new_with_refreshed_list();
            disks
                .list()
                .iter()
                .map(|disk| PartitionInfo {
                    mount_point: disk.mount_point().to_string_lossy().to_string(),
                    filesystem: disk.file_system().to_string_lossy().to_string(),
                    removable: disk.is_removable(),
                    total_bytes: disk.total_space(),
                })
                .filter_map(|partition| admit(&partition))
                .collect::<Vec<_>>()
        })
        .await?;

        Ok(volumes)
    }
}
