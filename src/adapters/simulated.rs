use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Notify;

use crate::core::enumerator::{VolumeProvider, display_label};
use crate::core::models::VolumeDescriptor;
use crate::core::wiper::{FilesystemKind, Formatter};
use crate::error::FormatError;

/// Handle for inserting and removing simulated volumes.
#[derive(Clone)]
pub struct Simulator {
    volumes: Arc<Mutex<Vec<VolumeDescriptor>>>,
}

impl Simulator {
    /// Present the directory at `path` as a removable volume of `size_gb`.
    pub fn add_volume(&self, path: &str, size_gb: f64) {
        let capacity_bytes = (size_gb * 1024.0 * 1024.0 * 1024.0) as u64;
        let volume = VolumeDescriptor {
            id: path.to_string(),
            label: display_label(path, None, capacity_bytes),
            capacity_bytes,
        };

        if let Ok(mut volumes) = self.volumes.lock() {
            volumes.retain(|v| v.id != path);
            volumes.push(volume);
        }
    }

    pub fn remove_volume(&self, path: &str) {
        if let Ok(mut volumes) = self.volumes.lock() {
            volumes.retain(|v| v.id != path);
        }
    }
}

pub struct SimulatedProvider {
    volumes: Arc<Mutex<Vec<VolumeDescriptor>>>,
}

impl SimulatedProvider {
    pub fn new() -> (Self, Simulator) {
        let volumes = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                volumes: Arc::clone(&volumes),
            },
            Simulator { volumes },
        )
    }
}

#[async_trait]
impl VolumeProvider for SimulatedProvider {
    fn name(&self) -> &'static str {
        "simulated"
    }

    async fn list(&self) -> Result<Vec<VolumeDescriptor>> {
        let volumes = self
            .volumes
            .lock()
            .map_err(|_| anyhow::anyhow!("simulated volume list poisoned"))?;
        Ok(volumes.clone())
    }
}

/// Formatter that "formats" by replacing whatever is at the volume path with
/// an empty directory, and records every call.
#[derive(Default)]
pub struct SimulatedFormatter {
    calls: Mutex<Vec<(PathBuf, FilesystemKind)>>,
    failure: Option<String>,
    delay: Option<Duration>,
    gate: Option<Arc<Notify>>,
}

impl SimulatedFormatter {
    pub fn failing(message: &str) -> Self {
        Self {
            failure: Some(message.to_string()),
            ..Default::default()
        }
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    /// Every format waits until the returned handle is notified.
    pub fn gated() -> (Self, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        (
            Self {
                gate: Some(Arc::clone(&gate)),
                ..Default::default()
            },
            gate,
        )
    }

    pub fn calls(&self) -> Vec<(PathBuf, FilesystemKind)> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Formatter for SimulatedFormatter {
    async fn format(&self, volume: &Path, filesystem: FilesystemKind) -> Result<String, FormatError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((volume.to_path_buf(), filesystem));
        }
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = &self.failure {
            return Err(FormatError::Exit {
                command: "simulated format".to_string(),
                status: "exit status: 1".to_string(),
                output: message.clone(),
            });
        }

        let spawn_err = |source| FormatError::Spawn {
            command: "simulated format".to_string(),
            source,
        };
        if volume.is_dir() {
            fs::remove_dir_all(volume).map_err(spawn_err)?;
        } else if volume.exists() {
            fs::remove_file(volume).map_err(spawn_err)?;
        }
        fs::create_dir_all(volume).map_err(spawn_err)?;
        Ok(format!("Simulated {filesystem} format of {}", volume.display()))
    }
}
