use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use sdprov::adapters::SimulatedFormatter;
use sdprov::config::AppConfig;
use sdprov::context::AppContext;
use sdprov::core::{
    Event, EventSink, Formatter, Orchestrator, Severity, Stage, TransferOutcome, TransferState,
    VolumeDescriptor,
};
use sdprov::error::StartError;
use tempfile::{TempDir, tempdir};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

const GB: u64 = 1024 * 1024 * 1024;

struct Fixture {
    _temp: TempDir,
    library: PathBuf,
    card: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let temp = tempdir().unwrap();
        let library = temp.path().join("library");
        let v1 = library.join("v1");
        fs::create_dir_all(v1.join("data")).unwrap();
        fs::write(v1.join("firmware.bin"), b"firmware").unwrap();
        fs::write(v1.join("data/table.dat"), b"table").unwrap();
        fs::create_dir_all(library.join("v2")).unwrap();

        let card = temp.path().join("card");
        fs::create_dir_all(&card).unwrap();

        Self {
            _temp: temp,
            library,
            card,
        }
    }

    fn config(&self) -> AppConfig {
        AppConfig {
            source_dir: self.library.to_string_lossy().to_string(),
            allowed_extensions: vec![".bin".into()],
            max_files: 2,
            allow_subdirs: false,
            ..Default::default()
        }
    }

    fn volume(&self) -> VolumeDescriptor {
        VolumeDescriptor {
            id: self.card.to_string_lossy().to_string(),
            label: "card".to_string(),
            capacity_bytes: 2 * GB,
        }
    }

    fn orchestrator(
        &self,
        config: AppConfig,
        formatter: Arc<dyn Formatter>,
    ) -> (Orchestrator, UnboundedReceiver<Event>) {
        let (events, rx) = EventSink::channel();
        let ctx = AppContext::new(self.library.join("cfg.json"), config, events);
        (Orchestrator::new(ctx, formatter), rx)
    }
}

fn drain(rx: &mut UnboundedReceiver<Event>) -> Vec<Event> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

fn make_unreadable(path: &Path) {
    fs::remove_dir_all(path).unwrap();
    fs::write(path, b"corrupt filesystem").unwrap();
}

#[tokio::test]
async fn policy_violation_stops_before_clearing() {
    let fx = Fixture::new();
    for name in ["a.bin", "b.bin", "c.bin"] {
        fs::write(fx.card.join(name), b"old").unwrap();
    }
    let formatter = Arc::new(SimulatedFormatter::default());
    let (orch, mut rx) = fx.orchestrator(fx.config(), formatter.clone());

    let outcome = orch
        .request_transfer("v1", Some(&fx.volume()))
        .unwrap()
        .await
        .unwrap();

    match &outcome {
        TransferOutcome::Failed { stage, reason } => {
            assert_eq!(*stage, Stage::Validating);
            assert!(reason.contains("3 files"), "reason: {reason}");
        }
        other => panic!("expected failure, got {other:?}"),
    }
    // Nothing was cleared or written.
    assert!(fx.card.join("a.bin").exists());
    assert!(!fx.card.join("firmware.bin").exists());
    assert!(formatter.calls().is_empty());
    assert!(matches!(orch.state().await, TransferState::Failed { stage: Stage::Validating, .. }));
    assert!(!orch.is_busy());

    let events = drain(&mut rx);
    assert!(events.iter().any(|e| e.severity == Severity::Error));
}

#[tokio::test]
async fn valid_volume_is_cleared_and_written() {
    let fx = Fixture::new();
    fs::write(fx.card.join("old.bin"), b"old").unwrap();
    let config = AppConfig {
        allow_subdirs: true,
        ..fx.config()
    };
    let (orch, mut rx) = fx.orchestrator(config, Arc::new(SimulatedFormatter::default()));

    let outcome = orch
        .request_transfer("v1", Some(&fx.volume()))
        .unwrap()
        .await
        .unwrap();

    let TransferOutcome::Done(summary) = outcome else {
        panic!("expected success");
    };
    assert_eq!(summary.files, 2);
    assert_eq!(summary.directories, 1);
    assert!(!fx.card.join("old.bin").exists());
    assert_eq!(fs::read(fx.card.join("firmware.bin")).unwrap(), b"firmware");
    assert_eq!(fs::read(fx.card.join("data/table.dat")).unwrap(), b"table");
    assert!(matches!(orch.state().await, TransferState::Done(_)));

    let events = drain(&mut rx);
    let last = events.last().unwrap();
    assert_eq!(last.severity, Severity::Success);
    assert!(last.message.contains("2 file(s)"));
}

#[tokio::test]
async fn corrupt_volume_is_formatted_and_written_when_enabled() {
    let fx = Fixture::new();
    make_unreadable(&fx.card);
    let config = AppConfig {
        auto_format_corrupt: true,
        ..fx.config()
    };
    let formatter = Arc::new(SimulatedFormatter::default());
    let (orch, _rx) = fx.orchestrator(config, formatter.clone());

    let outcome = orch
        .request_transfer("v1", Some(&fx.volume()))
        .unwrap()
        .await
        .unwrap();

    assert!(outcome.is_done(), "outcome: {outcome:?}");
    assert_eq!(formatter.calls().len(), 1);
    assert!(fx.card.join("firmware.bin").exists());
}

#[tokio::test]
async fn corrupt_volume_fails_when_auto_format_disabled() {
    let fx = Fixture::new();
    make_unreadable(&fx.card);
    let formatter = Arc::new(SimulatedFormatter::default());
    let (orch, _rx) = fx.orchestrator(fx.config(), formatter.clone());

    let outcome = orch
        .request_transfer("v1", Some(&fx.volume()))
        .unwrap()
        .await
        .unwrap();

    assert!(matches!(outcome, TransferOutcome::Failed { stage: Stage::Validating, .. }));
    assert!(formatter.calls().is_empty());
}

#[tokio::test]
async fn auto_format_needs_a_capacity_limit() {
    let fx = Fixture::new();
    make_unreadable(&fx.card);
    let config = AppConfig {
        auto_format_corrupt: true,
        max_drive_gb: 0.0,
        ..fx.config()
    };
    let formatter = Arc::new(SimulatedFormatter::default());
    let (orch, _rx) = fx.orchestrator(config, formatter.clone());

    let outcome = orch
        .request_transfer("v1", Some(&fx.volume()))
        .unwrap()
        .await
        .unwrap();

    assert!(!outcome.is_done());
    assert!(formatter.calls().is_empty());
}

#[tokio::test]
async fn failed_recovery_format_ends_the_transfer() {
    let fx = Fixture::new();
    make_unreadable(&fx.card);
    let config = AppConfig {
        auto_format_corrupt: true,
        ..fx.config()
    };
    let (orch, _rx) = fx.orchestrator(config, Arc::new(SimulatedFormatter::failing("access denied")));

    let outcome = orch
        .request_transfer("v1", Some(&fx.volume()))
        .unwrap()
        .await
        .unwrap();

    match outcome {
        TransferOutcome::Failed { stage, reason } => {
            assert_eq!(stage, Stage::RecoveringCorruption);
            assert!(reason.contains("access denied"));
        }
        other => panic!("expected failure, got {other:?}"),
    }
}

#[tokio::test]
async fn second_start_while_busy_is_rejected() {
    let fx = Fixture::new();
    make_unreadable(&fx.card);
    let config = AppConfig {
        auto_format_corrupt: true,
        ..fx.config()
    };
    let (formatter, gate) = SimulatedFormatter::gated();
    let formatter = Arc::new(formatter);
    let (orch, _rx) = fx.orchestrator(config, formatter.clone());

    let first = orch.request_transfer("v1", Some(&fx.volume())).unwrap();
    assert!(orch.is_busy());

    let second = orch.request_transfer("v1", Some(&fx.volume()));
    assert_eq!(second.err(), Some(StartError::Busy));
    assert_eq!(
        orch.start_format(&fx.volume()).err(),
        Some(StartError::Busy)
    );

    gate.notify_one();
    let outcome = timeout(Duration::from_secs(5), first).await.unwrap().unwrap();
    assert!(outcome.is_done());
    assert_eq!(formatter.calls().len(), 1);
    assert!(!orch.is_busy());

    // The flag is released, so a new transfer may start.
    let third = orch.request_transfer("v2", Some(&fx.volume()));
    assert!(third.is_ok());
    timeout(Duration::from_secs(5), third.unwrap()).await.unwrap().unwrap();
}

#[tokio::test]
async fn start_preconditions_are_reported() {
    let fx = Fixture::new();
    let (orch, mut rx) = fx.orchestrator(fx.config(), Arc::new(SimulatedFormatter::default()));

    assert_eq!(orch.request_transfer("v1", None).err(), Some(StartError::NoVolume));
    assert_eq!(
        orch.request_transfer("v9", Some(&fx.volume())).err(),
        Some(StartError::UnknownVersion("v9".to_string()))
    );

    let no_source = AppConfig {
        source_dir: String::new(),
        ..fx.config()
    };
    let (orch, _rx) = fx.orchestrator(no_source, Arc::new(SimulatedFormatter::default()));
    assert_eq!(
        orch.request_transfer("v1", Some(&fx.volume())).err(),
        Some(StartError::SourceRootMissing)
    );

    assert_eq!(drain(&mut rx).len(), 2);
}

#[tokio::test]
async fn standalone_format_respects_capacity_limit() {
    let fx = Fixture::new();
    let formatter = Arc::new(SimulatedFormatter::default());
    let (orch, _rx) = fx.orchestrator(fx.config(), formatter.clone());

    let big = VolumeDescriptor {
        capacity_bytes: 64 * GB,
        ..fx.volume()
    };
    assert!(matches!(
        orch.start_format(&big).err(),
        Some(StartError::CapacityExceeded { .. })
    ));
    assert!(formatter.calls().is_empty());

    fs::write(fx.card.join("junk.txt"), b"junk").unwrap();
    let outcome = orch.start_format(&fx.volume()).unwrap().await.unwrap();
    assert!(outcome.success);
    assert!(!fx.card.join("junk.txt").exists());
    assert_eq!(orch.state().await, TransferState::Idle);
}

#[tokio::test]
async fn only_accepted_versions_are_remembered() {
    let fx = Fixture::new();
    let config_path = fx.library.join("cfg.json");
    let config = AppConfig {
        last_version: "v2".to_string(),
        allow_subdirs: true,
        ..fx.config()
    };
    let (mut orch, _rx) = fx.orchestrator(config, Arc::new(SimulatedFormatter::default()));

    let typo = orch.request_transfer_remembered("v1x", Some(&fx.volume()));
    assert_eq!(typo.err(), Some(StartError::UnknownVersion("v1x".to_string())));
    assert_eq!(orch.ctx().config.last_version, "v2");
    assert!(!config_path.exists());

    let handle = orch.request_transfer_remembered("v1", Some(&fx.volume())).unwrap();
    assert!(handle.await.unwrap().is_done());
    assert_eq!(AppConfig::load(&config_path).last_version, "v1");
}
