// src/models.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Identifies a remote object to fetch and where it lands on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub url: String,
    /// Extra request headers sent with every probe and range request.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub destination: PathBuf,
    /// Optional lowercase hex SHA-256 the merged file must match.
    #[serde(default)]
    pub expected_sha256: Option<String>,
}

impl ResourceDescriptor {
    pub fn new(url: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            headers: BTreeMap::new(),
            destination: destination.into(),
            expected_sha256: None,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_sha256(mut self, digest: impl Into<String>) -> Self {
        self.expected_sha256 = Some(digest.into());
        self
    }

    /// Path of the segment file backing chunk `index`.
    /// e.g. for "/path/to/file.mp4" and index 2 it returns "/path/to/file.mp4.vdm-part2"
    pub fn segment_path(&self, index: usize) -> PathBuf {
        segment_path(&self.destination, index)
    }
}

pub fn segment_path(destination: &Path, index: usize) -> PathBuf {
    let destination_str = destination.to_string_lossy();
    PathBuf::from(format!("{}.vdm-part{}", destination_str, index))
}

/// An inclusive byte range `[start, end]` stored in exactly one segment file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub index: usize,
    pub start: u64,
    pub end: u64,
}

impl Chunk {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn range_header_value(&self, offset: u64) -> String {
        format!("bytes={}-{}", self.start + offset, self.end)
    }
}

/// Size plus change tag (ETag or Last-Modified) used to confirm a remote
/// resource is unchanged before resuming.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationToken {
    pub size: u64,
    pub tag: Option<String>,
}

impl fmt::Display for ValidationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.tag {
            Some(tag) => write!(f, "{} bytes, tag {}", self.size, tag),
            None => write!(f, "{} bytes, no tag", self.size),
        }
    }
}

/// Persisted state of one resumable transfer.
/// This struct is serialized as pretty JSON, one file per session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub url: String,
    pub destination: PathBuf,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub token: ValidationToken,
    /// Whether the server honoured byte ranges when the session was planned.
    pub ranges_supported: bool,
    pub chunks: Vec<Chunk>,
    pub segments: Vec<PathBuf>,
    pub created_at: DateTime<Utc>,
}

impl SessionMetadata {
    pub fn new(
        resource: &ResourceDescriptor,
        token: ValidationToken,
        ranges_supported: bool,
        chunks: Vec<Chunk>,
    ) -> Self {
        let segments = chunks.iter().map(|c| resource.segment_path(c.index)).collect();
        Self {
            url: resource.url.clone(),
            destination: resource.destination.clone(),
            headers: resource.headers.clone(),
            token,
            ranges_supported,
            chunks,
            segments,
            created_at: Utc::now(),
        }
    }
}

pub type TaskId = Uuid;

/// The lifecycle state of a task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Downloading,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled)
    }

    /// Whether `self -> next` is an edge of the task state machine.
    ///
    /// `Downloading -> Pending` is only taken by restart recovery and
    /// orchestrator shutdown, never by a user request.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Downloading)
                | (Downloading, Completed)
                | (Downloading, Failed)
                | (Downloading, Pending)
                | (Pending, Paused)
                | (Paused, Pending)
                | (Pending, Cancelled)
                | (Paused, Cancelled)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Downloading => "DOWNLOADING",
            TaskStatus::Paused => "PAUSED",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

/// Per-task preferences. The scheduler never looks inside; the orchestrator
/// and the resolver do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    pub video_quality: String,
    pub audio_quality: String,
    pub codec: String,
    #[serde(default)]
    pub audio_only: bool,
    pub download_dir: PathBuf,
    pub cache_dir: PathBuf,
    /// Number of concurrent segments per stream.
    pub threads: usize,
    /// Allow resuming a previous session for this task's streams.
    #[serde(default = "default_true")]
    pub resume: bool,
}

fn default_true() -> bool {
    true
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            video_quality: "1080P".to_string(),
            audio_quality: "192K".to_string(),
            codec: "H264".to_string(),
            audio_only: false,
            download_dir: PathBuf::from("downloads"),
            cache_dir: PathBuf::from("cache"),
            threads: 4,
            resume: true,
        }
    }
}

/// A request to schedule a new task. Id and creation time are generated by
/// the scheduler when absent.
#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub id: Option<TaskId>,
    pub input: String,
    pub config: TaskConfig,
    pub priority: i32,
    pub created_at: Option<DateTime<Utc>>,
}

impl TaskRequest {
    pub fn new(input: impl Into<String>, config: TaskConfig) -> Self {
        Self {
            id: None,
            input: input.into(),
            config,
            priority: 0,
            created_at: None,
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// One scheduled job. Owned by the scheduler; everything else works on
/// cloned snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub input: String,
    pub config: TaskConfig,
    /// Higher is served first.
    pub priority: i32,
    pub status: TaskStatus,
    /// Percentage in `[0, 100]`.
    pub progress: f64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl TaskRecord {
    pub fn summary(&self) -> TaskSummary {
        TaskSummary {
            id: self.id,
            input: self.input.clone(),
            status: self.status,
            progress: self.progress,
            error: self.error.clone(),
        }
    }
}

/// The view handed to front ends when listing tasks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskSummary {
    pub id: TaskId,
    pub input: String,
    pub status: TaskStatus,
    pub progress: f64,
    pub error: Option<String>,
}
