//! The download task record and its status.
//!
//! A [`DownloadTask`] is what gets persisted in the task store and what is
//! handed to an execution unit when the task is admitted.

use std::{
    ffi::OsString,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The suffix of the temporary sibling file that receives bytes until the
/// transfer is complete.
pub const TEMP_SUFFIX: &str = ".download";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// waiting in the pending queue
    #[default]
    Queued,
    /// admitted, either still resolving or held by an execution unit
    Downloading,
    Paused,
    Completed,
    Error,
    Cancelled,
}

impl TaskStatus {
    /// `Downloading`, `Queued` or `Paused`, i.e. the task still owns its destination
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Downloading | Self::Queued | Self::Paused)
    }

    /// terminal states, which only move again on an explicit retry
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Cancelled)
    }
}

/// Options for the tag writing step, opaque to the scheduler except for the
/// `lyric` flag which decides whether the lyric resolver runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TagWriteOptions {
    #[serde(default)]
    pub lyric: bool,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A progress report produced by an execution unit.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressInfo {
    /// 0 - 100
    pub progress: f64,
    /// bytes per second
    pub speed: u64,
    pub total_size: u64,
    pub downloaded_size: u64,
    /// seconds, None if unknown
    pub remaining_time: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadTask {
    pub id: String,
    pub status: TaskStatus,
    /// possibly empty, resolved lazily at admission
    pub url: String,
    pub file_path: PathBuf,
    /// lower is served first
    pub priority: i32,
    pub progress: f64,
    pub speed: u64,
    pub total_size: u64,
    pub downloaded_size: u64,
    pub remaining_time: Option<u64>,
    pub retries: u32,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub song_info: serde_json::Value,
    #[serde(default)]
    pub tag_write_options: TagWriteOptions,
    #[serde(default)]
    pub plugin_id: Option<String>,
    #[serde(default)]
    pub quality: Option<String>,
    #[serde(default)]
    pub lyric: Option<String>,
}

impl DownloadTask {
    pub(crate) fn from_request(request: NewTask) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            status: TaskStatus::Queued,
            url: request.url,
            file_path: request.file_path,
            priority: request.priority,
            progress: 0.0,
            speed: 0,
            total_size: 0,
            downloaded_size: 0,
            remaining_time: None,
            retries: 0,
            error: None,
            created_at: Utc::now(),
            song_info: request.song_info,
            tag_write_options: request.tag_write_options,
            plugin_id: request.plugin_id,
            quality: request.quality,
            lyric: None,
        }
    }

    /// the sibling file that holds the partial content
    pub fn temp_path(&self) -> PathBuf {
        temp_path_for(&self.file_path)
    }

    pub(crate) fn apply_progress(&mut self, info: &ProgressInfo) {
        self.progress = info.progress;
        self.speed = info.speed;
        self.total_size = info.total_size;
        self.downloaded_size = info.downloaded_size;
        self.remaining_time = info.remaining_time;
    }

    /// drop the rate fields once the task is no longer transferring
    pub(crate) fn clear_rate(&mut self) {
        self.speed = 0;
        self.remaining_time = None;
    }

    pub(crate) fn reset_for_retry(&mut self) {
        self.retries = 0;
        self.error = None;
        self.progress = 0.0;
        self.downloaded_size = 0;
        self.clear_rate();
    }
}

pub(crate) fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(TEMP_SUFFIX);
    PathBuf::from(name)
}

/// A request to create a download task.
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub song_info: serde_json::Value,
    pub url: String,
    pub file_path: PathBuf,
    pub tag_write_options: TagWriteOptions,
    pub priority: i32,
    pub plugin_id: Option<String>,
    pub quality: Option<String>,
}

impl NewTask {
    pub fn new(file_path: impl Into<PathBuf>) -> Self {
        Self {
            file_path: file_path.into(),
            ..Default::default()
        }
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn song_info(mut self, song_info: serde_json::Value) -> Self {
        self.song_info = song_info;
        self
    }

    pub fn tag_write_options(mut self, options: TagWriteOptions) -> Self {
        self.tag_write_options = options;
        self
    }

    pub fn plugin_id(mut self, plugin_id: impl Into<String>) -> Self {
        self.plugin_id = Some(plugin_id.into());
        self
    }

    pub fn quality(mut self, quality: impl Into<String>) -> Self {
        self.quality = Some(quality.into());
        self
    }
}

/// The buckets used by the bulk clear operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClearKind {
    /// downloading, queued and paused tasks
    Queue,
    Completed,
    /// errored and cancelled tasks
    Failed,
    All,
}

impl ClearKind {
    pub fn matches(&self, status: TaskStatus) -> bool {
        match self {
            ClearKind::Queue => status.is_in_flight(),
            ClearKind::Completed => status == TaskStatus::Completed,
            ClearKind::Failed => matches!(status, TaskStatus::Error | TaskStatus::Cancelled),
            ClearKind::All => true,
        }
    }
}
