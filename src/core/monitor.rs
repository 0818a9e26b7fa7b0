//! Periodic volume detection.
//!
//! The monitor re-enumerates removable volumes on a fixed interval and reports
//! changes as a diff against the previous snapshot.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::core::enumerator::{VolumeProvider, list_removable_volumes};
use crate::core::models::VolumeDescriptor;

pub const POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl SnapshotDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug, Clone)]
pub enum VolumeEvent {
    /// First snapshot after the monitor starts. Sets the baseline; nothing in
    /// it counts as newly inserted.
    Initial { volumes: Vec<VolumeDescriptor> },
    /// The set of volume identifiers changed since the previous poll.
    Changed {
        volumes: Vec<VolumeDescriptor>,
        diff: SnapshotDiff,
    },
}

/// Set difference of identifiers between two consecutive snapshots.
pub fn diff_snapshots(previous: &BTreeSet<String>, current: &BTreeSet<String>) -> SnapshotDiff {
    SnapshotDiff {
        added: current.difference(previous).cloned().collect(),
        removed: previous.difference(current).cloned().collect(),
    }
}

/// Keep the previous selection while it is still present, else take the first.
pub fn reselect(previous: Option<&str>, volumes: &[VolumeDescriptor]) -> Option<VolumeDescriptor> {
    previous
        .and_then(|id| volumes.iter().find(|v| v.id == id))
        .or_else(|| volumes.first())
        .cloned()
}

pub struct VolumeMonitor {
    providers: Arc<Vec<Box<dyn VolumeProvider>>>,
    interval: Duration,
}

impl VolumeMonitor {
    pub fn new(providers: Vec<Box<dyn VolumeProvider>>) -> Self {
        Self {
            providers: Arc::new(providers),
            interval: POLL_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub async fn snapshot(&self) -> Vec<VolumeDescriptor> {
        list_removable_volumes(&self.providers).await
    }

    /// Spawn the polling task. The first event is always `Initial`; after that
    /// only changes are sent. Stops when `token` is cancelled or the receiver
    /// is dropped.
    pub fn start(&self, tx: mpsc::Sender<VolumeEvent>, token: CancellationToken) -> tokio::task::JoinHandle<()> {
        let providers = Arc::clone(&self.providers);
        let period = self.interval;

        tokio::spawn(async move {
            info!(interval_ms = period.as_millis() as u64, "Volume monitor started");
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;

            let volumes = list_removable_volumes(&providers).await;
            let mut known: BTreeSet<String> = volumes.iter().map(|v| v.id.clone()).collect();
            debug!(count = known.len(), "Initial volume snapshot");
            if tx.send(VolumeEvent::Initial { volumes }).await.is_err() {
                return;
            }

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let volumes = list_removable_volumes(&providers).await;
                let current: BTreeSet<String> = volumes.iter().map(|v| v.id.clone()).collect();
                let diff = diff_snapshots(&known, &current);
                known = current;

                if diff.is_empty() {
                    continue;
                }
                debug!(added = diff.added.len(), removed = diff.removed.len(), "Volume set changed");
                if tx.send(VolumeEvent::Changed { volumes, diff }).await.is_err() {
                    break;
                }
            }
            info!("Volume monitor stopped");
        })
    }
}
