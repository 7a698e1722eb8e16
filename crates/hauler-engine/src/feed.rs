//! Live feed: the subscription object handed to streaming clients.
//!
//! A feed greets its subscriber with a synthesized `hello` plus a full
//! snapshot, then pumps bus events. Three timers run alongside: a
//! heartbeat so intermediaries never idle-close the connection, an
//! aggressive store poll while the task has no file rows yet, and a
//! gentle snapshot refresh afterwards that catches missed messages.
//! Identical consecutive snapshots are suppressed.

use std::collections::VecDeque;

use chrono::Utc;
use hauler_config::TimingSettings;
use hauler_core::TaskDetail;
use hauler_data::TaskStore;
use hauler_events::{Event, EventEnvelope, EventStream};
use serde_json::Value;
use tokio::time::{Duration, Instant};
use tracing::warn;
use uuid::Uuid;

/// One frame yielded by a feed.
#[derive(Debug, Clone)]
pub enum FeedFrame {
    /// A bus event (or the synthesized greeting).
    Event(EventEnvelope),
    /// A full task snapshot.
    Snapshot(Value),
    /// Keep-alive marker.
    Heartbeat,
}

impl FeedFrame {
    /// Render the frame in SSE framing. Heartbeats become comments so
    /// they are invisible to `EventSource` consumers.
    #[must_use]
    pub fn to_sse(&self) -> String {
        match self {
            Self::Event(envelope) => format!(
                "id: {}\nevent: {}\ndata: {}\n\n",
                envelope.id,
                envelope.event.kind(),
                serde_json::to_string(&envelope.event).unwrap_or_else(|_| "{}".to_owned())
            ),
            Self::Snapshot(value) => format!("data: {value}\n\n"),
            Self::Heartbeat => format!(": keep-alive {}\n\n", Utc::now().timestamp()),
        }
    }
}

/// Live subscription for one task.
pub struct TaskFeed {
    store: TaskStore,
    task_id: Uuid,
    stream: EventStream,
    pending: VecDeque<FeedFrame>,
    last_snapshot: Option<String>,
    files_seen: bool,
    connected_at: Instant,
    last_emit: Instant,
    last_refresh: Instant,
    heartbeat: Duration,
    refresh: Duration,
    empty_poll: Duration,
    max_empty_wait: Duration,
}

impl std::fmt::Debug for TaskFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskFeed")
            .field("task_id", &self.task_id)
            .finish_non_exhaustive()
    }
}

impl TaskFeed {
    /// Open a feed primed with the greeting and initial snapshot.
    #[must_use]
    pub fn open(store: TaskStore, detail: TaskDetail, timing: &TimingSettings) -> Self {
        let task_id = detail.task.id;
        let stream = store.events().subscribe(task_id, None);
        let now = Instant::now();

        let hello = EventEnvelope {
            id: 0,
            timestamp: Utc::now(),
            event: Event::Hello {
                task_id,
                mode: detail.task.mode,
                status: detail.task.status,
            },
        };
        let snapshot = snapshot_value(&detail);
        let mut pending = VecDeque::new();
        pending.push_back(FeedFrame::Event(hello));
        pending.push_back(FeedFrame::Snapshot(snapshot.clone()));

        Self {
            store,
            task_id,
            stream,
            pending,
            last_snapshot: Some(snapshot.to_string()),
            files_seen: !detail.files.is_empty(),
            connected_at: now,
            last_emit: now,
            last_refresh: now,
            heartbeat: timing.heartbeat_interval(),
            refresh: timing.refresh_interval(),
            empty_poll: timing.empty_files_poll(),
            max_empty_wait: timing.max_empty_wait(),
        }
    }

    /// Next frame; `None` once the task's channel is retired.
    pub async fn next(&mut self) -> Option<FeedFrame> {
        loop {
            if let Some(frame) = self.pending.pop_front() {
                self.last_emit = Instant::now();
                return Some(frame);
            }

            let wait = if self.files_seen {
                self.refresh.min(self.heartbeat)
            } else {
                self.empty_poll
            };
            match tokio::time::timeout(wait, self.stream.next()).await {
                Ok(Some(envelope)) => {
                    if matches!(envelope.event, Event::FilesListed { .. }) {
                        self.files_seen = true;
                    }
                    self.last_emit = Instant::now();
                    return Some(FeedFrame::Event(envelope));
                }
                Ok(None) => return None,
                Err(_) => {
                    let now = Instant::now();
                    if self.files_seen {
                        if now.duration_since(self.last_refresh) >= self.refresh {
                            self.last_refresh = now;
                            self.queue_snapshot_if_changed().await;
                        }
                    } else if now.duration_since(self.connected_at) <= self.max_empty_wait {
                        self.queue_snapshot_if_changed().await;
                    }
                    if self.pending.is_empty()
                        && now.duration_since(self.last_emit) >= self.heartbeat
                    {
                        self.last_emit = now;
                        return Some(FeedFrame::Heartbeat);
                    }
                }
            }
        }
    }

    /// Fetch a fresh snapshot and queue it when it differs from the
    /// last one sent. Store failures are logged and skipped; the next
    /// timer fires again anyway.
    async fn queue_snapshot_if_changed(&mut self) {
        let detail = match self.store.get_detail(self.task_id).await {
            Ok(Some(detail)) => detail,
            Ok(None) => return, // deleted; channel retirement ends the feed
            Err(err) => {
                warn!(task_id = %self.task_id, error = %err, "snapshot refresh failed");
                return;
            }
        };
        if !detail.files.is_empty() {
            self.files_seen = true;
        }
        let snapshot = snapshot_value(&detail);
        let rendered = snapshot.to_string();
        if self.last_snapshot.as_deref() != Some(rendered.as_str()) {
            self.last_snapshot = Some(rendered);
            self.pending.push_back(FeedFrame::Snapshot(snapshot));
        }
    }
}

/// The wire shape of a full task snapshot.
fn snapshot_value(detail: &TaskDetail) -> Value {
    serde_json::json!({
        "taskId": detail.task.id,
        "mode": detail.task.mode,
        "status": detail.task.status,
        "label": detail.task.label,
        "identifier": detail.task.identifier,
        "progressPct": detail.task.progress_pct,
        "files": detail.files.iter().map(|file| serde_json::json!({
            "fileId": file.id,
            "index": file.index,
            "name": file.name,
            "size": file.size_bytes,
            "state": file.state,
            "bytesDownloaded": file.bytes_downloaded,
            "localPath": file.local_path,
        })).collect::<Vec<_>>(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use hauler_core::{SourceKind, TaskMode, TaskStatus};
    use hauler_data::NewTask;
    use hauler_events::EventBus;

    fn fast_timing() -> TimingSettings {
        TimingSettings {
            heartbeat_secs: 1,
            refresh_secs: 1,
            empty_files_poll_ms: 10,
            max_empty_wait_secs: 1,
            ..TimingSettings::default()
        }
    }

    async fn store_and_task() -> (TaskStore, Uuid) {
        let store = TaskStore::in_memory(EventBus::with_capacity(64))
            .await
            .unwrap();
        let task = store
            .create_task(NewTask {
                label: Some("demo".to_owned()),
                mode: TaskMode::Auto,
                source_kind: SourceKind::Magnet,
                source: "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567".to_owned(),
                identifier: "0123456789abcdef0123456789abcdef01234567".to_owned(),
                provider: "debrid".to_owned(),
                owner: None,
            })
            .await
            .unwrap();
        (store, task.id)
    }

    #[tokio::test]
    async fn feed_opens_with_hello_then_snapshot() {
        let (store, task_id) = store_and_task().await;
        let detail = store.get_detail(task_id).await.unwrap().unwrap();
        let mut feed = TaskFeed::open(store, detail, &fast_timing());

        match feed.next().await.unwrap() {
            FeedFrame::Event(envelope) => {
                assert!(matches!(envelope.event, Event::Hello { .. }));
            }
            other => panic!("expected hello, got {other:?}"),
        }
        match feed.next().await.unwrap() {
            FeedFrame::Snapshot(value) => {
                assert_eq!(value["status"], "queued");
                assert_eq!(value["files"], serde_json::json!([]));
            }
            other => panic!("expected snapshot, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn quiet_feed_emits_heartbeat() {
        let (store, task_id) = store_and_task().await;
        let detail = store.get_detail(task_id).await.unwrap().unwrap();
        let mut feed = TaskFeed::open(store, detail, &fast_timing());
        let _ = feed.next().await; // hello
        let _ = feed.next().await; // snapshot

        let frame = tokio::time::timeout(Duration::from_secs(5), feed.next())
            .await
            .expect("feed stalled")
            .expect("feed ended");
        assert!(matches!(frame, FeedFrame::Heartbeat), "got {frame:?}");
    }

    #[tokio::test]
    async fn live_events_are_forwarded() {
        let (store, task_id) = store_and_task().await;
        let detail = store.get_detail(task_id).await.unwrap().unwrap();
        let mut feed = TaskFeed::open(store.clone(), detail, &fast_timing());
        let _ = feed.next().await;
        let _ = feed.next().await;

        store
            .update_status(task_id, TaskStatus::Resolving, None)
            .await
            .unwrap();
        let frame = tokio::time::timeout(Duration::from_secs(5), feed.next())
            .await
            .expect("feed stalled")
            .expect("feed ended");
        match frame {
            FeedFrame::Event(envelope) => {
                assert!(matches!(
                    envelope.event,
                    Event::State {
                        status: TaskStatus::Resolving,
                        ..
                    }
                ));
            }
            other => panic!("expected state event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn retiring_the_channel_ends_the_feed() {
        let (store, task_id) = store_and_task().await;
        let detail = store.get_detail(task_id).await.unwrap().unwrap();
        let mut feed = TaskFeed::open(store.clone(), detail, &fast_timing());
        let _ = feed.next().await;
        let _ = feed.next().await;

        store.delete_task(task_id).await.unwrap();
        store.events().retire(task_id);
        let frame = tokio::time::timeout(Duration::from_secs(5), feed.next())
            .await
            .expect("feed stalled");
        assert!(frame.is_none());
    }

    #[test]
    fn sse_rendering() {
        let heartbeat = FeedFrame::Heartbeat.to_sse();
        assert!(heartbeat.starts_with(": keep-alive"));
        assert!(heartbeat.ends_with("\n\n"));

        let envelope = EventEnvelope {
            id: 7,
            timestamp: Utc::now(),
            event: Event::State {
                task_id: Uuid::nil(),
                status: TaskStatus::Ready,
                reason: None,
            },
        };
        let rendered = FeedFrame::Event(envelope).to_sse();
        assert!(rendered.starts_with("id: 7\nevent: state\ndata: "));
    }
}
