use async_channel::Sender;

use crate::{
    builder::ManagerBuilder,
    error::{ManagerError, Result},
    event::{EventBus, EventReceiver},
    manager::{CommandResponse, ManagerCommand},
    task::{ClearKind, DownloadTask, NewTask},
};

/// A handle to the download manager.
/// Cheap to clone, every clone talks to the same scheduler. The scheduler
/// stops once [`DownloadManager::shutdown`] is called or every handle is dropped.
#[derive(Clone)]
pub struct DownloadManager {
    cmd_tx: Sender<ManagerCommand>,
    events: EventBus,
}

impl DownloadManager {
    pub fn builder() -> ManagerBuilder {
        ManagerBuilder::default()
    }

    pub(crate) fn new(cmd_tx: Sender<ManagerCommand>, events: EventBus) -> Self {
        Self { cmd_tx, events }
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(CommandResponse<T>) -> ManagerCommand,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(command(tx))
            .await
            .map_err(|_| ManagerError::Closed)?;
        rx.await.map_err(|_| ManagerError::Closed)?
    }

    /// Queue a new task. Fails if another task already owns the destination.
    pub async fn add_task(&self, request: NewTask) -> Result<DownloadTask> {
        self.request(|tx| ManagerCommand::AddTask(request, tx)).await
    }

    pub async fn pause_task(&self, id: &str) -> Result<()> {
        self.request(|tx| ManagerCommand::PauseTask(id.to_string(), tx))
            .await
    }

    pub async fn resume_task(&self, id: &str) -> Result<()> {
        self.request(|tx| ManagerCommand::ResumeTask(id.to_string(), tx))
            .await
    }

    pub async fn cancel_task(&self, id: &str) -> Result<()> {
        self.request(|tx| ManagerCommand::CancelTask(id.to_string(), tx))
            .await
    }

    /// Remove the task record, optionally with its downloaded file
    pub async fn delete_task(&self, id: &str, delete_file: bool) -> Result<()> {
        self.request(|response| ManagerCommand::DeleteTask {
            id: id.to_string(),
            delete_file,
            response,
        })
        .await
    }

    pub async fn retry_task(&self, id: &str) -> Result<()> {
        self.request(|tx| ManagerCommand::RetryTask(id.to_string(), tx))
            .await
    }

    pub async fn pause_all_tasks(&self) -> Result<()> {
        self.request(ManagerCommand::PauseAll).await
    }

    pub async fn resume_all_tasks(&self) -> Result<()> {
        self.request(ManagerCommand::ResumeAll).await
    }

    pub async fn clear_tasks(&self, kind: ClearKind) -> Result<()> {
        self.request(|tx| ManagerCommand::ClearTasks(kind, tx)).await
    }

    /// `0` is treated as `1`
    pub async fn set_max_concurrent_downloads(&self, max: usize) -> Result<()> {
        self.request(|tx| ManagerCommand::SetMaxConcurrent(max, tx))
            .await
    }

    pub async fn max_concurrent_downloads(&self) -> Result<usize> {
        self.request(ManagerCommand::GetMaxConcurrent).await
    }

    pub async fn get_task(&self, id: &str) -> Result<Option<DownloadTask>> {
        self.request(|tx| ManagerCommand::GetTask(id.to_string(), tx))
            .await
    }

    /// all tasks in insertion order
    pub async fn get_tasks(&self) -> Result<Vec<DownloadTask>> {
        self.request(ManagerCommand::GetTasks).await
    }

    /// Mark completed tasks whose file is gone as failed, returns how many
    pub async fn validate_files(&self) -> Result<usize> {
        self.request(ManagerCommand::ValidateFiles).await
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    /// Stop the scheduler. Running transfers are interrupted and kept as paused.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(ManagerCommand::Shutdown).await
    }
}
