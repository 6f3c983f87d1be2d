//! Collaborators injected by the host application.

use std::path::Path;

use async_trait::async_trait;

use crate::{error::BoxError, task::DownloadTask};

/// Resolves a playable url for a task that was queued without one.
/// A failure is a start-up failure and goes through the retry policy.
#[async_trait]
pub trait UrlResolver: Send + Sync {
    async fn resolve_url(&self, task: &DownloadTask) -> Result<String, BoxError>;
}

/// Fetches lyric text when the tag write options ask for it.
/// A failure is logged and never fails the task.
#[async_trait]
pub trait LyricResolver: Send + Sync {
    async fn resolve_lyric(&self, task: &DownloadTask) -> Result<Option<String>, BoxError>;
}

/// Runs inside the execution unit once the file is in place,
/// e.g. tag writing and cover embedding.
#[async_trait]
pub trait PostProcessor: Send + Sync {
    async fn process(&self, task: &DownloadTask, path: &Path) -> Result<(), BoxError>;
}
