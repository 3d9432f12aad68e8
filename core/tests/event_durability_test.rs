//! Durability invariants for the event bus + checkpoint store pairing:
//! every published event lands in the log, seq values are contiguous
//! from 1, timestamps never decrease with seq, and late subscribers
//! observe completion even after the live channel is gone.

use std::sync::Arc;

use modernizer_core::{
    CheckpointStore, EventBus, EventDraft, EventKind, MigrationSource, MigrationState, Phase,
    ProjectType,
};

fn sample_state(id: &str, phase: Phase) -> MigrationState {
    let mut state = MigrationState::new(
        id.to_string(),
        std::path::PathBuf::from("/tmp/p"),
        ProjectType::Node,
        MigrationSource::Local {
            path: std::path::PathBuf::from("/tmp/p"),
        },
        3,
    );
    state.phase = phase;
    state
}

#[tokio::test]
async fn published_events_are_durable_and_contiguous() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(CheckpointStore::open(dir.path()).unwrap());
    let bus = EventBus::with_store(store.clone());

    bus.publish("mig-1", EventDraft::new(EventKind::WorkflowStart));
    bus.publish("mig-1", EventDraft::new(EventKind::PhaseEnter));
    bus.publish("mig-1", EventDraft::new(EventKind::StageResult));
    bus.publish("mig-1", EventDraft::new(EventKind::Succeeded));

    let events = store.read_events("mig-1").unwrap();
    assert_eq!(events.len(), 4);

    // Contiguous from 1.
    for (i, event) in events.iter().enumerate() {
        assert_eq!(event.seq, i as u64 + 1);
    }
    // Timestamps are non-decreasing with seq.
    for pair in events.windows(2) {
        assert!(pair[0].ts <= pair[1].ts);
    }
    // Exactly one terminal event.
    assert_eq!(events.iter().filter(|e| e.kind.is_terminal()).count(), 1);
    assert_eq!(events.last().unwrap().kind, EventKind::Succeeded);
}

#[tokio::test]
async fn late_subscriber_replays_terminal_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(CheckpointStore::open(dir.path()).unwrap());
    let bus = EventBus::with_store(store.clone());

    bus.publish("mig-1", EventDraft::new(EventKind::WorkflowStart));
    bus.publish("mig-1", EventDraft::new(EventKind::Escalated));
    // The workflow task is gone and the channel was dropped.
    bus.forget("mig-1");

    let mut stream = bus.subscribe("mig-1").unwrap();
    let event = stream.next().await.unwrap();
    assert_eq!(event.kind, EventKind::Escalated);
    assert_eq!(event.seq, 2);
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn subscriber_to_persisted_state_without_terminal_event_sees_synthetic() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(CheckpointStore::open(dir.path()).unwrap());
    let bus = EventBus::with_store(store.clone());

    // A crashed run: committed state, no terminal event in the log.
    store.save_state(&sample_state("mig-crashed", Phase::Failed)).unwrap();

    let mut stream = bus.subscribe("mig-crashed").unwrap();
    let event = stream.next().await.unwrap();
    assert_eq!(event.kind, EventKind::Failed);
    assert_eq!(event.payload["replayed"], true);
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn resumed_migration_continues_its_sequence() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(CheckpointStore::open(dir.path()).unwrap());

    {
        let bus = EventBus::with_store(store.clone());
        bus.publish("mig-1", EventDraft::new(EventKind::WorkflowStart));
        bus.publish("mig-1", EventDraft::new(EventKind::PhaseEnter));
    }

    // A fresh bus after process restart: seq picks up where the log ends.
    let bus = EventBus::with_store(store.clone());
    let event = bus.publish("mig-1", EventDraft::new(EventKind::PhaseEnter));
    assert_eq!(event.seq, 3);

    let events = store.read_events("mig-1").unwrap();
    let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
    assert_eq!(seqs, vec![1, 2, 3]);
}

#[tokio::test]
async fn unknown_migration_fails_even_with_store() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(CheckpointStore::open(dir.path()).unwrap());
    let bus = EventBus::with_store(store);
    assert!(bus.subscribe("ghost").is_err());
}
