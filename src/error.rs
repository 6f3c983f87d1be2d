use std::path::PathBuf;

/// The error type returned by the host supplied collaborators
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ManagerError {
    /// another queued, paused or downloading task writes the same file
    #[error("already downloading: {}", .0.display())]
    AlreadyDownloading(PathBuf),
    /// a completed task owns the file and the file is still on disk
    #[error("already downloaded: {}", .0.display())]
    AlreadyDownloaded(PathBuf),
    #[error("task not found: {0}")]
    TaskNotFound(String),
    /// the scheduler loop is gone, either shut down or all handles dropped
    #[error("the download manager is closed")]
    Closed,
}

pub type Result<T, E = ManagerError> = std::result::Result<T, E>;
