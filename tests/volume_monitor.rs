use std::fs;
use std::sync::Arc;
use std::time::Duration;

use sdprov::adapters::{SimulatedFormatter, SimulatedProvider};
use sdprov::config::AppConfig;
use sdprov::context::AppContext;
use sdprov::core::monitor::SnapshotDiff;
use sdprov::core::{EventSink, Orchestrator, Severity, VolumeEvent, VolumeMonitor, VolumeProvider};
use tempfile::tempdir;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

async fn next_change(rx: &mut mpsc::Receiver<VolumeEvent>) -> (Vec<String>, SnapshotDiff) {
    let event = timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timeout waiting for event")
        .expect("channel closed");

    match event {
        VolumeEvent::Changed { volumes, diff } => (volumes.into_iter().map(|v| v.id).collect(), diff),
        other => panic!("expected a change, got {other:?}"),
    }
}

async fn initial_snapshot(rx: &mut mpsc::Receiver<VolumeEvent>) -> Vec<String> {
    let event = timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timeout waiting for event")
        .expect("channel closed");

    match event {
        VolumeEvent::Initial { volumes } => volumes.into_iter().map(|v| v.id).collect(),
        other => panic!("expected the initial snapshot, got {other:?}"),
    }
}

/// Library with `v1/firmware.bin` and a card directory holding `existing.bin`.
fn library_and_card(root: &std::path::Path) -> (String, std::path::PathBuf) {
    let library = root.join("library");
    fs::create_dir_all(library.join("v1")).unwrap();
    fs::write(library.join("v1/firmware.bin"), b"fw").unwrap();
    let card = root.join("card");
    fs::create_dir_all(&card).unwrap();
    fs::write(card.join("existing.bin"), b"old").unwrap();
    (library.to_string_lossy().to_string(), card)
}

#[tokio::test]
async fn test_list_volumes_empty() {
    let (provider, _controller) = SimulatedProvider::new();
    assert!(provider.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_add_and_remove_volume() {
    let (provider, controller) = SimulatedProvider::new();
    let monitor = VolumeMonitor::new(vec![Box::new(provider)]).with_interval(Duration::from_millis(20));
    let (tx, mut rx) = mpsc::channel(32);
    let token = CancellationToken::new();
    let handle = monitor.start(tx, token.clone());
    assert!(initial_snapshot(&mut rx).await.is_empty());

    controller.add_volume("/media/card-1", 2.0);
    let (ids, diff) = next_change(&mut rx).await;
    assert_eq!(ids, vec!["/media/card-1"]);
    assert_eq!(diff.added, vec!["/media/card-1"]);
    assert!(diff.removed.is_empty());

    controller.remove_volume("/media/card-1");
    let (ids, diff) = next_change(&mut rx).await;
    assert!(ids.is_empty());
    assert_eq!(diff.removed, vec!["/media/card-1"]);

    token.cancel();
    timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_unchanged_polls_are_silent() {
    let (provider, controller) = SimulatedProvider::new();
    controller.add_volume("/media/card-1", 2.0);
    let monitor = VolumeMonitor::new(vec![Box::new(provider)]).with_interval(Duration::from_millis(10));
    let (tx, mut rx) = mpsc::channel(32);
    let token = CancellationToken::new();
    let _handle = monitor.start(tx, token.clone());

    assert_eq!(initial_snapshot(&mut rx).await, vec!["/media/card-1"]);
    // Several polls pass without another event.
    assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());
    token.cancel();
}

#[tokio::test]
async fn test_auto_start_writes_to_new_volume() {
    let temp = tempdir().unwrap();
    let library = temp.path().join("library");
    fs::create_dir_all(library.join("v1")).unwrap();
    fs::write(library.join("v1/firmware.bin"), b"fw").unwrap();
    let card = temp.path().join("card");
    fs::create_dir_all(&card).unwrap();
    let card_id = card.to_string_lossy().to_string();

    let config = AppConfig {
        source_dir: library.to_string_lossy().to_string(),
        last_version: "v1".to_string(),
        auto_start: true,
        ..Default::default()
    };
    let (events, mut rx) = EventSink::channel();
    let ctx = AppContext::new(temp.path().join("cfg.json"), config, events);
    let mut orch = Orchestrator::new(ctx, Arc::new(SimulatedFormatter::default()));

    let (provider, controller) = SimulatedProvider::new();
    controller.add_volume(&card_id, 2.0);
    let volumes = provider.list().await.unwrap();

    let handle = orch
        .handle_volume_event(VolumeEvent::Changed {
            volumes,
            diff: SnapshotDiff {
                added: vec![card_id.clone()],
                removed: vec![],
            },
        })
        .expect("auto-start should begin a transfer");

    assert_eq!(orch.selected_volume().map(|v| v.id.as_str()), Some(card_id.as_str()));
    assert!(handle.await.unwrap().is_done());
    assert_eq!(fs::read(card.join("firmware.bin")).unwrap(), b"fw");

    let first = rx.recv().await.unwrap();
    assert_eq!(first.severity, Severity::Info);
    assert!(first.message.contains("New volume found"));
}

#[tokio::test]
async fn test_removal_does_not_start_a_transfer() {
    let temp = tempdir().unwrap();
    let config = AppConfig {
        auto_start: true,
        ..Default::default()
    };
    let (events, mut rx) = EventSink::channel();
    let ctx = AppContext::new(temp.path().join("cfg.json"), config, events);
    let mut orch = Orchestrator::new(ctx, Arc::new(SimulatedFormatter::default()));

    let started = orch.handle_volume_event(VolumeEvent::Changed {
        volumes: vec![],
        diff: SnapshotDiff {
            added: vec![],
            removed: vec!["/media/gone".to_string()],
        },
    });

    assert!(started.is_none());
    assert!(orch.selected_volume().is_none());
    assert_eq!(rx.recv().await.unwrap().severity, Severity::Warning);
}

#[tokio::test]
async fn test_card_present_before_watching_is_left_alone() {
    let temp = tempdir().unwrap();
    let (library, card) = library_and_card(temp.path());
    let card_id = card.to_string_lossy().to_string();

    let config = AppConfig {
        source_dir: library,
        last_version: "v1".to_string(),
        auto_start: true,
        ..Default::default()
    };
    let (events, _rx) = EventSink::channel();
    let ctx = AppContext::new(temp.path().join("cfg.json"), config, events);
    let formatter = Arc::new(SimulatedFormatter::default());
    let mut orch = Orchestrator::new(ctx, formatter.clone());

    let (provider, controller) = SimulatedProvider::new();
    controller.add_volume(&card_id, 2.0);
    let monitor = VolumeMonitor::new(vec![Box::new(provider)]).with_interval(Duration::from_millis(20));

    let token = CancellationToken::new();
    let stop = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        stop.cancel();
    });
    timeout(Duration::from_secs(2), orch.watch(&monitor, token))
        .await
        .unwrap();

    assert_eq!(orch.selected_volume().map(|v| v.id.as_str()), Some(card_id.as_str()));
    assert!(!orch.is_busy());
    assert!(card.join("existing.bin").exists());
    assert!(!card.join("firmware.bin").exists());
    assert!(formatter.calls().is_empty());
}

#[tokio::test]
async fn test_auto_start_falls_back_to_first_version() {
    let temp = tempdir().unwrap();
    let (library, card) = library_and_card(temp.path());
    let card_id = card.to_string_lossy().to_string();

    let config = AppConfig {
        source_dir: library,
        last_version: String::new(),
        auto_start: true,
        ..Default::default()
    };
    let (events, _rx) = EventSink::channel();
    let ctx = AppContext::new(temp.path().join("cfg.json"), config, events);
    let mut orch = Orchestrator::new(ctx, Arc::new(SimulatedFormatter::default()));
    assert_eq!(orch.preferred_version().as_deref(), Some("v1"));

    let (provider, controller) = SimulatedProvider::new();
    controller.add_volume(&card_id, 2.0);
    let volumes = provider.list().await.unwrap();

    let handle = orch
        .handle_volume_event(VolumeEvent::Changed {
            volumes,
            diff: SnapshotDiff {
                added: vec![card_id.clone()],
                removed: vec![],
            },
        })
        .expect("auto-start should begin a transfer");

    assert!(handle.await.unwrap().is_done());
    assert_eq!(fs::read(card.join("firmware.bin")).unwrap(), b"fw");
    assert!(!card.join("existing.bin").exists());
}
