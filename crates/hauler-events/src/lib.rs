#![forbid(unsafe_code)]

//! Event bus for the Hauler orchestrator.
//!
//! The bus provides a typed event enum, per-task channels built on
//! `tokio::broadcast`, sequential identifiers, and a bounded replay
//! ring so reconnecting subscribers (e.g. SSE clients that supply a
//! last-seen id) can backfill missed events. Publishing never blocks
//! on slow subscribers; when a channel overflows, the oldest events
//! are dropped.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use hauler_core::{FileState, TaskMode, TaskStatus};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::error;
use uuid::Uuid;

/// Identifier assigned to each event within a task's channel.
pub type EventId = u64;

/// Default per-task replay ring capacity.
const DEFAULT_REPLAY_CAPACITY: usize = 256;

/// One manifest entry as carried by [`Event::FilesListed`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListedFile {
    /// File identifier.
    pub file_id: Uuid,
    /// 0-based manifest position.
    pub index: u32,
    /// Safe filename.
    pub name: String,
    /// Size in bytes when known.
    pub size: Option<u64>,
    /// Current file state.
    pub state: FileState,
}

/// Typed domain events fanned out to live subscribers.
///
/// The serialized form is the wire contract: a `type` tag plus
/// camelCase fields, one JSON object per event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    /// Synthesized greeting on subscribe and on task creation.
    #[serde(rename = "hello", rename_all = "camelCase")]
    Hello {
        /// Task identifier.
        task_id: Uuid,
        /// Task mode.
        mode: TaskMode,
        /// Status at the time of the greeting.
        status: TaskStatus,
    },
    /// Task-level state transition.
    #[serde(rename = "state", rename_all = "camelCase")]
    State {
        /// Task identifier.
        task_id: Uuid,
        /// New status.
        status: TaskStatus,
        /// Short reason code for failed/canceled transitions.
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// The provider manifest materialised.
    #[serde(rename = "files.listed", rename_all = "camelCase")]
    FilesListed {
        /// Task identifier.
        task_id: Uuid,
        /// The listed files, ordered by index.
        files: Vec<ListedFile>,
    },
    /// A file changed sub-state.
    #[serde(rename = "file.state", rename_all = "camelCase")]
    FileState {
        /// Task identifier.
        task_id: Uuid,
        /// File identifier.
        file_id: Uuid,
        /// New file state.
        state: FileState,
    },
    /// Byte-count progress for an in-flight file.
    #[serde(rename = "file.progress", rename_all = "camelCase")]
    FileProgress {
        /// Task identifier.
        task_id: Uuid,
        /// File identifier.
        file_id: Uuid,
        /// Bytes observed on disk.
        bytes_downloaded: u64,
        /// Expected total, 0 when unknown.
        total: u64,
    },
    /// A file reached its terminal good state.
    #[serde(rename = "file.done", rename_all = "camelCase")]
    FileDone {
        /// Task identifier.
        task_id: Uuid,
        /// File identifier.
        file_id: Uuid,
        /// Final on-disk path.
        local_path: String,
    },
    /// A file failed permanently.
    #[serde(rename = "file.failed", rename_all = "camelCase")]
    FileFailed {
        /// Task identifier.
        task_id: Uuid,
        /// File identifier.
        file_id: Uuid,
        /// Short failure reason.
        reason: String,
    },
}

impl Event {
    /// Machine-friendly discriminator, identical to the wire tag.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "hello",
            Self::State { .. } => "state",
            Self::FilesListed { .. } => "files.listed",
            Self::FileState { .. } => "file.state",
            Self::FileProgress { .. } => "file.progress",
            Self::FileDone { .. } => "file.done",
            Self::FileFailed { .. } => "file.failed",
        }
    }

    /// The task this event belongs to.
    #[must_use]
    pub const fn task_id(&self) -> Uuid {
        match self {
            Self::Hello { task_id, .. }
            | Self::State { task_id, .. }
            | Self::FilesListed { task_id, .. }
            | Self::FileState { task_id, .. }
            | Self::FileProgress { task_id, .. }
            | Self::FileDone { task_id, .. }
            | Self::FileFailed { task_id, .. } => *task_id,
        }
    }
}

/// Metadata wrapper around events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Sequential identifier within the task's channel.
    pub id: EventId,
    /// Emission timestamp.
    pub timestamp: DateTime<Utc>,
    /// Wrapped event payload.
    pub event: Event,
}

struct TaskChannel {
    sender: broadcast::Sender<EventEnvelope>,
    replay: VecDeque<EventEnvelope>,
    next_id: EventId,
}

impl TaskChannel {
    fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            replay: VecDeque::with_capacity(capacity),
            next_id: 1,
        }
    }
}

/// Shared per-task event bus.
#[derive(Clone)]
pub struct EventBus {
    channels: Arc<Mutex<HashMap<Uuid, TaskChannel>>>,
    capacity: usize,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

impl EventBus {
    /// Construct a bus whose per-task channels hold `capacity` events.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "event bus capacity must be positive");
        Self {
            channels: Arc::new(Mutex::new(HashMap::new())),
            capacity,
        }
    }

    /// Construct a bus with the default replay capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_REPLAY_CAPACITY)
    }

    /// Publish an event onto its task's channel.
    ///
    /// Returns the sequential identifier assigned to the event. A
    /// channel with no live subscribers still records the event in its
    /// replay ring.
    pub fn publish(&self, event: Event) -> EventId {
        let task_id = event.task_id();
        let mut channels = self.lock_channels();
        let capacity = self.capacity;
        let channel = channels
            .entry(task_id)
            .or_insert_with(|| TaskChannel::new(capacity));

        let id = channel.next_id;
        channel.next_id += 1;
        let envelope = EventEnvelope {
            id,
            timestamp: Utc::now(),
            event,
        };
        if channel.replay.len() == capacity {
            channel.replay.pop_front();
        }
        channel.replay.push_back(envelope.clone());
        let _ = channel.sender.send(envelope);
        id
    }

    /// Subscribe to a task's channel, replaying buffered events newer
    /// than `since` first.
    #[must_use]
    pub fn subscribe(&self, task_id: Uuid, since: Option<EventId>) -> EventStream {
        let mut channels = self.lock_channels();
        let capacity = self.capacity;
        let channel = channels
            .entry(task_id)
            .or_insert_with(|| TaskChannel::new(capacity));

        let mut backlog = VecDeque::new();
        if let Some(since) = since {
            for item in &channel.replay {
                if item.id > since {
                    backlog.push_back(item.clone());
                }
            }
        }
        EventStream {
            backlog,
            receiver: channel.sender.subscribe(),
        }
    }

    /// Buffered events for a task newer than `since`, without a
    /// long-lived subscription.
    #[must_use]
    pub fn backlog_since(&self, task_id: Uuid, since: EventId) -> Vec<EventEnvelope> {
        let channels = self.lock_channels();
        channels.get(&task_id).map_or_else(Vec::new, |channel| {
            channel
                .replay
                .iter()
                .filter(|item| item.id > since)
                .cloned()
                .collect()
        })
    }

    /// Drop a task's channel; live subscriber streams end.
    pub fn retire(&self, task_id: Uuid) {
        let mut channels = self.lock_channels();
        channels.remove(&task_id);
    }

    fn lock_channels(&self) -> MutexGuard<'_, HashMap<Uuid, TaskChannel>> {
        match self.channels.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                error!("event channel map mutex poisoned; continuing with recovered guard");
                poisoned.into_inner()
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Stream yielding events from the replay backlog first, then live.
#[derive(Debug)]
pub struct EventStream {
    backlog: VecDeque<EventEnvelope>,
    receiver: broadcast::Receiver<EventEnvelope>,
}

impl EventStream {
    /// Receive the next event; `None` once the channel is retired.
    pub async fn next(&mut self) -> Option<EventEnvelope> {
        if let Some(event) = self.backlog.pop_front() {
            return Some(event);
        }
        match self.receiver.recv().await {
            Ok(event) => Some(event),
            Err(broadcast::error::RecvError::Lagged(_)) => self.receiver.recv().await.ok(),
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }

    /// Non-blocking poll used by feed timers.
    pub fn try_next(&mut self) -> Option<EventEnvelope> {
        if let Some(event) = self.backlog.pop_front() {
            return Some(event);
        }
        match self.receiver.try_recv() {
            Ok(event) => Some(event),
            Err(_) => None,
        }
    }
}
