//! Event bus: per-migration fan-out to subscribers.
//!
//! Built on Tokio broadcast channels, one per live migration. The bus
//! assigns `seq`, appends each event to the durable log, then broadcasts.
//! A slow subscriber lags: broadcast drops its oldest pending events (the
//! stream counts them) but the newest events survive, so a terminal event
//! is never lost. Subscribing after termination replays the terminal
//! event from persisted state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::types::{Event, EventDraft, EventKind};
use crate::state::store::CheckpointStore;
use crate::state::types::{MigrationId, Phase};

/// Per-subscriber buffer capacity before lag kicks in.
const CHANNEL_CAPACITY: usize = 256;

/// Error type for bus operations. `publish` never fails from the caller's
/// perspective; only `subscribe` can.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Unknown migration: {0}")]
    UnknownMigration(MigrationId),
}

pub type SharedEventBus = Arc<EventBus>;

struct Channel {
    sender: broadcast::Sender<Event>,
    next_seq: u64,
    terminal: Option<Event>,
}

impl Channel {
    fn new(first_seq: u64) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            next_seq: first_seq,
            terminal: None,
        }
    }
}

/// Registry mapping live migrations to their broadcast channels.
pub struct EventBus {
    channels: Mutex<HashMap<MigrationId, Channel>>,
    store: Option<Arc<CheckpointStore>>,
}

impl EventBus {
    /// A bus without durable logging (unit tests).
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            store: None,
        }
    }

    /// A bus that appends every published event to the checkpoint store.
    pub fn with_store(store: Arc<CheckpointStore>) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            store: Some(store),
        }
    }

    pub fn shared(self) -> SharedEventBus {
        Arc::new(self)
    }

    /// First seq for a channel: continues after any persisted events so a
    /// resumed workflow keeps its log contiguous.
    fn first_seq(&self, id: &str) -> u64 {
        let last = self
            .store
            .as_ref()
            .and_then(|s| s.read_events(id).ok())
            .and_then(|events| events.last().map(|e| e.seq))
            .unwrap_or(0);
        last + 1
    }

    /// Publish an event for a migration. Assigns seq and timestamp,
    /// persists, and delivers to current subscribers. Never blocks on a
    /// slow subscriber and never returns an error.
    pub fn publish(&self, id: &str, draft: EventDraft) -> Event {
        let mut channels = self.channels.lock().expect("event bus lock poisoned");
        let channel = match channels.get_mut(id) {
            Some(ch) => ch,
            None => {
                let first = self.first_seq(id);
                channels.entry(id.to_string()).or_insert(Channel::new(first))
            }
        };

        let seq = channel.next_seq;
        channel.next_seq += 1;
        let event = draft.into_event(id.to_string(), seq);

        if let Some(store) = &self.store {
            if let Err(e) = store.append_event(&event) {
                warn!(migration_id = %id, seq, error = %e, "failed to persist event");
            }
        }

        if event.kind.is_terminal() {
            channel.terminal = Some(event.clone());
        }

        // No receivers is fine; the event is already durable.
        match channel.sender.send(event.clone()) {
            Ok(count) => debug!(migration_id = %id, seq, kind = %event.kind, receivers = count, "event published"),
            Err(_) => debug!(migration_id = %id, seq, kind = %event.kind, "event published (no receivers)"),
        }

        event
    }

    /// Subscribe to a migration's event stream.
    ///
    /// For a live migration the stream delivers events in seq order and
    /// ends after the terminal event. For a terminated one (still
    /// registered, or only on disk) it delivers the terminal event alone.
    /// A persisted migration that has not terminated (queued, resuming,
    /// or started a moment ago) gets a live channel so events flow once
    /// publishing begins. Fails only when the id is neither registered
    /// nor persisted.
    pub fn subscribe(&self, id: &str) -> Result<EventStream, BusError> {
        let mut channels = self.channels.lock().expect("event bus lock poisoned");
        if let Some(channel) = channels.get(id) {
            if let Some(terminal) = &channel.terminal {
                return Ok(EventStream::replay(terminal.clone()));
            }
            return Ok(EventStream::live(channel.sender.subscribe()));
        }

        let Some(store) = &self.store else {
            return Err(BusError::UnknownMigration(id.to_string()));
        };
        if let Some(terminal) = replay_from_disk(store, id) {
            return Ok(EventStream::replay(terminal));
        }
        if store.exists(id) {
            // Persisted but not yet terminated: attach live.
            let first = self.first_seq(id);
            let channel = channels.entry(id.to_string()).or_insert(Channel::new(first));
            return Ok(EventStream::live(channel.sender.subscribe()));
        }
        Err(BusError::UnknownMigration(id.to_string()))
    }

    /// Drop a migration's channel. Existing subscribers keep their
    /// receivers and drain whatever was already broadcast.
    pub fn forget(&self, id: &str) {
        self.channels
            .lock()
            .expect("event bus lock poisoned")
            .remove(id);
    }

    /// Number of live subscribers for a migration.
    pub fn subscriber_count(&self, id: &str) -> usize {
        self.channels
            .lock()
            .expect("event bus lock poisoned")
            .get(id)
            .map(|ch| ch.sender.receiver_count())
            .unwrap_or(0)
    }
}

/// Reconstruct the terminal event for a terminated migration: replay it
/// from the event log when present, otherwise synthesize one from the
/// committed state. Returns `None` for non-terminal or unknown ids.
fn replay_from_disk(store: &CheckpointStore, id: &str) -> Option<Event> {
    let events = store.read_events(id).ok()?;
    if let Some(terminal) = events.iter().rev().find(|e| e.kind.is_terminal()) {
        return Some(terminal.clone());
    }

    let state = store.load_state(id).ok()?;
    let kind = match state.phase {
        Phase::Succeeded => EventKind::Succeeded,
        Phase::Failed => EventKind::Failed,
        Phase::Escalated => EventKind::Escalated,
        // Crashed or awaiting resume: no completion to replay.
        _ => return None,
    };
    let last_seq = events.last().map(|e| e.seq).unwrap_or(0);
    let draft = EventDraft::new(kind).with_payload(serde_json::json!({
        "phase": state.phase,
        "errors": state.errors,
        "pr_url": state.deployment.as_ref().map(|d| d.pr_url.clone()),
        "replayed": true,
    }));
    Some(draft.into_event(id.to_string(), last_seq + 1))
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

enum StreamMode {
    Live(broadcast::Receiver<Event>),
    Replay(Option<Event>),
}

/// A single subscriber's view of one migration's events.
pub struct EventStream {
    mode: StreamMode,
    dropped: u64,
    done: bool,
}

impl EventStream {
    fn live(receiver: broadcast::Receiver<Event>) -> Self {
        Self {
            mode: StreamMode::Live(receiver),
            dropped: 0,
            done: false,
        }
    }

    fn replay(terminal: Event) -> Self {
        Self {
            mode: StreamMode::Replay(Some(terminal)),
            dropped: 0,
            done: false,
        }
    }

    /// Next event in seq order. Returns `None` once the terminal event has
    /// been delivered (or the publisher vanished without one).
    pub async fn next(&mut self) -> Option<Event> {
        if self.done {
            return None;
        }
        match &mut self.mode {
            StreamMode::Replay(slot) => {
                self.done = true;
                slot.take()
            }
            StreamMode::Live(receiver) => loop {
                match receiver.recv().await {
                    Ok(event) => {
                        if event.kind.is_terminal() {
                            self.done = true;
                        }
                        return Some(event);
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        self.dropped += n;
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        self.done = true;
                        return None;
                    }
                }
            },
        }
    }

    /// How many events this subscriber missed by lagging.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
