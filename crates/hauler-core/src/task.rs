//! Task and file lifecycle types.
//!
//! The state machines here are the single source of truth for legal
//! transitions; the store refuses any update that does not follow an
//! arrow defined in this module.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Download mode chosen at submission time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskMode {
    /// Every file in the manifest is selected as soon as it is listed.
    Auto,
    /// The task waits for an explicit file selection before downloading.
    Select,
}

impl TaskMode {
    /// Stable string form used in the database and on the wire.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Select => "select",
        }
    }

    /// Parse the stable string form.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "auto" => Some(Self::Auto),
            "select" => Some(Self::Select),
            _ => None,
        }
    }
}

/// Kind of source the task was created from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// A `magnet:` URI carrying a BitTorrent infohash.
    Magnet,
    /// A direct HTTP(S) link handled by the provider's unlocker.
    Link,
    /// A file uploaded straight into storage, bypassing the provider.
    Upload,
}

impl SourceKind {
    /// Stable string form used in the database and on the wire.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Magnet => "magnet",
            Self::Link => "link",
            Self::Upload => "upload",
        }
    }

    /// Parse the stable string form.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "magnet" => Some(Self::Magnet),
            "link" => Some(Self::Link),
            "upload" => Some(Self::Upload),
            _ => None,
        }
    }
}

/// Lifecycle state of a task.
///
/// ```text
/// queued -> resolving -> waiting_selection -> downloading -> ready
///    |           |                          ^
///    |           +-------- (mode=auto) -----+
///    +---------> ready   (dedup shortcut)
/// queued/resolving/downloading              -> failed
/// queued/resolving/waiting_selection/downloading -> canceled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Accepted but not yet picked up by the resolver.
    Queued,
    /// Uploaded to the provider; polling for the file manifest.
    Resolving,
    /// Manifest known; waiting for the user to pick files.
    WaitingSelection,
    /// Files selected; downloads admitted and dispatched.
    Downloading,
    /// Every file reached its terminal good state.
    Ready,
    /// The task hit a permanent error; reason recorded.
    Failed,
    /// Canceled by the user or by selection timeout.
    Canceled,
}

impl TaskStatus {
    /// Stable string form used in the database and on the wire.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Resolving => "resolving",
            Self::WaitingSelection => "waiting_selection",
            Self::Downloading => "downloading",
            Self::Ready => "ready",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    /// Parse the stable string form.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(Self::Queued),
            "resolving" => Some(Self::Resolving),
            "waiting_selection" => Some(Self::WaitingSelection),
            "downloading" => Some(Self::Downloading),
            "ready" => Some(Self::Ready),
            "failed" => Some(Self::Failed),
            "canceled" => Some(Self::Canceled),
            _ => None,
        }
    }

    /// True once no further transitions are possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Ready | Self::Failed | Self::Canceled)
    }

    /// Whether moving from `self` to `next` follows a legal arrow.
    #[must_use]
    pub const fn can_transition(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Resolving)
                | (Self::Queued, Self::Ready)
                | (Self::Queued, Self::Failed)
                | (Self::Queued, Self::Canceled)
                | (Self::Resolving, Self::WaitingSelection)
                | (Self::Resolving, Self::Downloading)
                | (Self::Resolving, Self::Failed)
                | (Self::Resolving, Self::Canceled)
                | (Self::WaitingSelection, Self::Downloading)
                | (Self::WaitingSelection, Self::Canceled)
                | (Self::Downloading, Self::Ready)
                | (Self::Downloading, Self::Failed)
                | (Self::Downloading, Self::Canceled)
        )
    }
}

/// Sub-state of an individual task file.
///
/// `listed -> selected -> downloading -> done`, with `failed` reachable
/// from `selected` and `downloading`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileState {
    /// Present in the provider manifest, not yet chosen.
    Listed,
    /// Chosen for download, waiting for a dispatch slot.
    Selected,
    /// Handed to the download executor.
    Downloading,
    /// Fully materialised on disk.
    Done,
    /// Unlock or download failed permanently.
    Failed,
}

impl FileState {
    /// Stable string form used in the database and on the wire.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Listed => "listed",
            Self::Selected => "selected",
            Self::Downloading => "downloading",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    /// Parse the stable string form.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "listed" => Some(Self::Listed),
            "selected" => Some(Self::Selected),
            "downloading" => Some(Self::Downloading),
            "done" => Some(Self::Done),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// States whose remaining bytes count toward the disk reservation.
    #[must_use]
    pub const fn reserves_space(self) -> bool {
        matches!(self, Self::Listed | Self::Selected | Self::Downloading)
    }

    /// Whether moving from `self` to `next` follows a legal arrow.
    #[must_use]
    pub const fn can_transition(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Listed, Self::Selected)
                | (Self::Selected, Self::Downloading)
                | (Self::Selected, Self::Failed)
                | (Self::Downloading, Self::Done)
                | (Self::Downloading, Self::Failed)
        )
    }
}

/// Severity attached to entries in the per-task event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventLevel {
    /// Diagnostic chatter, off by default.
    Debug,
    /// Normal lifecycle milestones.
    Info,
    /// Recoverable anomalies.
    Warning,
    /// Failures worth operator attention.
    Error,
    /// High-frequency progress samples.
    Progress,
}

impl EventLevel {
    /// Stable string form used in the database.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Progress => "progress",
        }
    }
}

/// Durable record of one submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Task identifier.
    pub id: Uuid,
    /// Optional human label supplied at submission.
    pub label: Option<String>,
    /// Auto or select mode.
    pub mode: TaskMode,
    /// What kind of source produced the task.
    pub source_kind: SourceKind,
    /// The raw submitted source (or an upload sentinel).
    pub source: String,
    /// Stable dedup identifier derived from the source.
    pub identifier: String,
    /// Opaque provider tag (e.g. `debrid`).
    pub provider: String,
    /// Provider-side reference, assigned after the first upload.
    pub provider_ref: Option<String>,
    /// Current lifecycle state.
    pub status: TaskStatus,
    /// Aggregate completion percentage, 0-100.
    pub progress_pct: u8,
    /// Optional owner reference.
    pub owner: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp, monotone non-decreasing.
    pub updated_at: DateTime<Utc>,
}

/// Durable record of one downloadable artifact within a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskFileRecord {
    /// File identifier.
    pub id: Uuid,
    /// Owning task.
    pub task_id: Uuid,
    /// 0-based position in the provider manifest; stable.
    pub index: u32,
    /// Validated safe filename (no separators, no control characters).
    pub name: String,
    /// Total size in bytes, unknown until the provider reports it.
    pub size_bytes: Option<u64>,
    /// Current sub-state.
    pub state: FileState,
    /// Bytes observed on disk so far.
    pub bytes_downloaded: u64,
    /// Final path, set when the file reaches `done`.
    pub local_path: Option<String>,
    /// Provider-side locked URL from the manifest.
    pub locked_url: Option<String>,
    /// Last direct URL obtained from the provider; short-lived.
    pub unlocked_url: Option<String>,
}

/// Input for inserting a manifest entry as a task file.
#[derive(Debug, Clone)]
pub struct NewTaskFile {
    /// 0-based manifest position.
    pub index: u32,
    /// Sanitised filename.
    pub name: String,
    /// Size reported by the provider, if any.
    pub size_bytes: Option<u64>,
    /// Locked URL reported by the provider, if any.
    pub locked_url: Option<String>,
}

/// A task together with its files, as returned to API consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDetail {
    /// The task record.
    pub task: TaskRecord,
    /// Files ordered by manifest index.
    pub files: Vec<TaskFileRecord>,
}
