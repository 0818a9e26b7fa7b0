use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Local;
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, info_span, warn};
use uuid::Uuid;

use crate::context::AppContext;
use crate::core::catalog::VersionCatalog;
use crate::core::copier::copy_version;
use crate::core::events::EventSink;
use crate::core::models::{
    CopySummary, FormatOutcome, Stage, TransferOutcome, TransferState, VolumeDescriptor,
};
use crate::core::monitor::{VolumeEvent, VolumeMonitor, reselect};
use crate::core::validator::{ValidationPolicy, validate_volume};
use crate::core::wiper::{Formatter, clear_volume, format_volume};
use crate::error::StartError;

/// Everything a background transfer needs, captured when it is requested.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub source_root: PathBuf,
    pub version: String,
    pub volume: VolumeDescriptor,
    pub policy: ValidationPolicy,
    pub auto_format_on_corruption: bool,
}

/// Holds the busy flag for one background operation; releases it on drop.
struct BusyGuard(Arc<AtomicBool>);

impl BusyGuard {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(Arc::clone(flag)))
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct Orchestrator {
    ctx: AppContext,
    formatter: Arc<dyn Formatter>,
    busy: Arc<AtomicBool>,
    state: Arc<RwLock<TransferState>>,
    volumes: Vec<VolumeDescriptor>,
    selected: Option<VolumeDescriptor>,
}

impl Orchestrator {
    pub fn new(ctx: AppContext, formatter: Arc<dyn Formatter>) -> Self {
        Self {
            ctx,
            formatter,
            busy: Arc::new(AtomicBool::new(false)),
            state: Arc::new(RwLock::new(TransferState::Idle)),
            volumes: Vec::new(),
            selected: None,
        }
    }

    pub fn ctx(&self) -> &AppContext {
        &self.ctx
    }

    pub fn ctx_mut(&mut self) -> &mut AppContext {
        &mut self.ctx
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub async fn state(&self) -> TransferState {
        self.state.read().await.clone()
    }

    pub fn volumes(&self) -> &[VolumeDescriptor] {
        &self.volumes
    }

    pub fn selected_volume(&self) -> Option<&VolumeDescriptor> {
        self.selected.as_ref()
    }

    /// Replace the known volume list, keeping the selection where possible.
    pub fn set_volumes(&mut self, volumes: Vec<VolumeDescriptor>) {
        self.selected = reselect(self.selected.as_ref().map(|v| v.id.as_str()), &volumes);
        self.volumes = volumes;
    }

    pub fn select_volume(&mut self, id: &str) -> Option<&VolumeDescriptor> {
        self.selected = self.volumes.iter().find(|v| v.id == id).cloned();
        self.selected.as_ref()
    }

    /// The remembered version if the catalog still has it, else the first
    /// catalogued one. `None` when the source root or catalog is unusable.
    pub fn preferred_version(&self) -> Option<String> {
        let source_root = self.ctx.config.source_root()?;
        let catalog = VersionCatalog::load(&source_root).ok()?;
        catalog.preferred(&self.ctx.config.last_version).map(str::to_string)
    }

    /// Check the start preconditions against the current config.
    pub fn prepare_transfer(
        &self,
        version: &str,
        volume: Option<&VolumeDescriptor>,
    ) -> Result<TransferRequest, StartError> {
        let volume = volume.ok_or(StartError::NoVolume)?;
        let config = &self.ctx.config;
        let source_root = config.source_root().ok_or(StartError::SourceRootMissing)?;

        let catalog = VersionCatalog::load(&source_root).map_err(|e| {
            warn!(error = %e, "Version catalog unavailable");
            StartError::SourceRootMissing
        })?;
        if !catalog.contains(version) {
            return Err(StartError::UnknownVersion(version.to_string()));
        }

        Ok(TransferRequest {
            source_root,
            version: version.to_string(),
            volume: volume.clone(),
            policy: config.validation_policy(),
            // Only trust a corruption verdict when the size check can rule out a wrong drive.
            auto_format_on_corruption: config.auto_format_corrupt
                && config.max_capacity_gb().is_some(),
        })
    }

    /// Prepare and start a transfer, reporting refusals on the event stream.
    ///
    /// A request while busy is rejected with `StartError::Busy` and no event.
    pub fn request_transfer(
        &self,
        version: &str,
        volume: Option<&VolumeDescriptor>,
    ) -> Result<JoinHandle<TransferOutcome>, StartError> {
        if self.is_busy() {
            return Err(StartError::Busy);
        }
        let req = self.prepare_transfer(version, volume).inspect_err(|e| {
            self.ctx.events.error(e.to_string());
        })?;
        self.start_transfer(req)
    }

    /// Like `request_transfer`, and remember `version` as `last_version` once
    /// the request was accepted. A failed save is reported, not fatal.
    pub fn request_transfer_remembered(
        &mut self,
        version: &str,
        volume: Option<&VolumeDescriptor>,
    ) -> Result<JoinHandle<TransferOutcome>, StartError> {
        let handle = self.request_transfer(version, volume)?;
        if self.ctx.config.last_version != version {
            self.ctx.config.last_version = version.to_string();
            if let Err(e) = self.ctx.save_config() {
                warn!(error = %e, "Failed to remember selected version");
                self.ctx.events.warning(format!("Could not save settings: {e}"));
            }
        }
        Ok(handle)
    }

    /// Run Validate, Wipe and Copy on the background worker.
    pub fn start_transfer(&self, req: TransferRequest) -> Result<JoinHandle<TransferOutcome>, StartError> {
        let guard = BusyGuard::acquire(&self.busy).ok_or(StartError::Busy)?;
        let formatter = Arc::clone(&self.formatter);
        let events = self.ctx.events.clone();
        let state = Arc::clone(&self.state);

        let span = info_span!(
            "transfer",
            id = %Uuid::now_v7(),
            version = %req.version,
            volume = %req.volume.id
        );

        Ok(tokio::spawn(
            async move {
                let _guard = guard;
                info!("Transfer started");
                let outcome = run_transfer(&req, formatter.as_ref(), &events, &state).await;
                *state.write().await = TransferState::from(&outcome);
                info!(done = outcome.is_done(), "Transfer finished");
                outcome
            }
            .instrument(span),
        ))
    }

    /// Format a volume on the background worker.
    ///
    /// Refused while busy, and for volumes above the configured capacity limit.
    pub fn start_format(&self, volume: &VolumeDescriptor) -> Result<JoinHandle<FormatOutcome>, StartError> {
        if self.is_busy() {
            return Err(StartError::Busy);
        }

        let size_gb = volume.capacity_gb();
        if let Some(max_gb) = self.ctx.config.max_capacity_gb() {
            if size_gb > max_gb {
                let err = StartError::CapacityExceeded { size_gb, max_gb };
                self.ctx.events.error(err.to_string());
                return Err(err);
            }
        }

        let guard = BusyGuard::acquire(&self.busy).ok_or(StartError::Busy)?;
        let formatter = Arc::clone(&self.formatter);
        let events = self.ctx.events.clone();
        let state = Arc::clone(&self.state);
        let volume_id = volume.id.clone();

        Ok(tokio::spawn(async move {
            let _guard = guard;
            *state.write().await = TransferState::Formatting;
            events.warning(format!("Format started for {volume_id}..."));

            let outcome = format_volume(formatter.as_ref(), &volume_id, Some(size_gb), &events).await;
            if outcome.success {
                events.success(format!("{volume_id} is ready for use."));
                *state.write().await = TransferState::Idle;
            } else {
                events.error(format!(
                    "Formatting {volume_id} failed. Try running as administrator."
                ));
                *state.write().await = TransferState::Failed {
                    stage: Stage::Formatting,
                    reason: outcome.diagnostic.clone(),
                };
            }
            outcome
        }))
    }

    /// React to a change in the set of mounted volumes.
    ///
    /// Returns the transfer handle when auto-start kicked one off.
    pub fn handle_volume_event(&mut self, event: VolumeEvent) -> Option<JoinHandle<TransferOutcome>> {
        match event {
            VolumeEvent::Initial { volumes } => {
                self.ctx.events.info(format!("{} removable volume(s) present", volumes.len()));
                self.set_volumes(volumes);
                None
            }
            VolumeEvent::Changed { volumes, diff } => {
                for id in &diff.added {
                    self.ctx.events.info(format!("New volume found: {id}"));
                }
                for id in &diff.removed {
                    self.ctx.events.warning(format!("Volume removed: {id}"));
                }
                self.set_volumes(volumes);

                if diff.added.is_empty() || !self.ctx.config.auto_start || self.is_busy() {
                    return None;
                }
                let version = self
                    .preferred_version()
                    .unwrap_or_else(|| self.ctx.config.last_version.clone());
                let selected = self.selected.clone();
                self.request_transfer(&version, selected.as_ref()).ok()
            }
        }
    }

    /// Host loop: poll volumes until `token` is cancelled.
    pub async fn watch(&mut self, monitor: &VolumeMonitor, token: CancellationToken) {
        let (tx, mut rx) = mpsc::channel(32);
        let poller = monitor.start(tx, token.clone());

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => {
                        self.handle_volume_event(event);
                    }
                    None => break,
                },
            }
        }

        token.cancel();
        drop(rx);
        let _ = poller.await;
    }
}

async fn set_state(state: &RwLock<TransferState>, next: TransferState) {
    *state.write().await = next;
}

async fn run_transfer(
    req: &TransferRequest,
    formatter: &dyn Formatter,
    events: &EventSink,
    state: &RwLock<TransferState>,
) -> TransferOutcome {
    let volume_id = req.volume.id.as_str();
    let size_gb = Some(req.volume.capacity_gb());

    // 1. Validate
    set_state(state, TransferState::Validating).await;
    events.info(format!("Validating volume {volume_id}..."));
    let verdict = {
        let id = volume_id.to_string();
        let policy = req.policy.clone();
        match tokio::task::spawn_blocking(move || validate_volume(&id, &policy, size_gb)).await {
            Ok(verdict) => verdict,
            Err(e) => {
                let reason = format!("Validation task failed: {e}");
                events.error(reason.clone());
                return TransferOutcome::Failed {
                    stage: Stage::Validating,
                    reason,
                };
            }
        }
    };

    if verdict.ok {
        events.success(format!("Volume {volume_id} passed validation."));
    } else {
        events.error(format!("Volume validation failed: {}", verdict.reason));

        if !(verdict.is_corrupt && req.auto_format_on_corruption) {
            events.error("Writing to this volume is not possible.");
            return TransferOutcome::Failed {
                stage: Stage::Validating,
                reason: verdict.reason,
            };
        }

        set_state(state, TransferState::RecoveringCorruption).await;
        events.warning("Corrupt volume detected, formatting automatically...");
        let formatted = format_volume(formatter, volume_id, size_gb, events).await;
        if !formatted.success {
            events.error("Automatic format failed. Try running as administrator.");
            return TransferOutcome::Failed {
                stage: Stage::RecoveringCorruption,
                reason: formatted.diagnostic,
            };
        }
        events.success(format!("{volume_id} formatted, continuing..."));
    }

    // 2. Clear
    set_state(state, TransferState::Clearing).await;
    events.info(format!("Clearing volume {volume_id}..."));
    if !clear_volume(formatter, volume_id, size_gb, events).await {
        let reason = format!("Could not clear {volume_id}.");
        events.error(reason.clone());
        return TransferOutcome::Failed {
            stage: Stage::Clearing,
            reason,
        };
    }

    // 3. Copy
    set_state(state, TransferState::Copying).await;
    events.info(format!("Copying new files from [{}]...", req.version));
    match copy_version(&req.source_root, &req.version, &req.volume.root()).await {
        Ok(stats) => {
            let summary = CopySummary {
                files: stats.files,
                directories: stats.directories,
                bytes: stats.bytes,
                finished_at: Local::now(),
            };
            let dir_info = if stats.directories > 0 {
                format!(", {} director(y/ies)", stats.directories)
            } else {
                String::new()
            };
            events.success(format!(
                "{} file(s){} from [{}] written to [{}] at {}.",
                stats.files,
                dir_info,
                req.version,
                volume_id,
                summary.finished_at.format("%H:%M")
            ));
            TransferOutcome::Done(summary)
        }
        Err(e) => {
            let reason = e.to_string();
            events.error(format!("Copy failed: {reason}"));
            TransferOutcome::Failed {
                stage: Stage::Copying,
                reason,
            }
        }
    }
}
