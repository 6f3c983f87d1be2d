//! The scheduler.
//!
//! One async task owns the task store, the pending queue and the sets of
//! initializing and active tasks, so none of it needs a lock. Everything else
//! talks to it through channels: callers send [`ManagerCommand`]s, runners
//! report with [`RunnerMessage`]s and the URL/lyric resolution of an admitted
//! task posts a [`StartupMessage`] back once it is done.
//!
//! A runner that was paused or cancelled gives up its slot at once but is
//! tracked until it exits. One that already renamed its file finishes the
//! post processing and its completion still counts.

use std::{collections::HashMap, path::Path, sync::Arc, time::Duration};

use async_channel::{Receiver, Sender};
use futures::FutureExt;

use crate::{
    adapter::AnyAdapter,
    error::{ManagerError, Result},
    event::{EventBus, ManagerEvent},
    resolver::{LyricResolver, PostProcessor, UrlResolver},
    runner::{ManagerMessage, RunnerId, RunnerMessage, RunnerMessageKind, TaskRunner, TransferOutcome},
    runtime::{self, AbortHandle, ExitStatus},
    task::{ClearKind, DownloadTask, NewTask, ProgressInfo, TaskStatus},
};

pub mod queue;
pub mod store;

pub use queue::PendingQueue;
pub use store::{Settings, SettingsStore, StoreError, TaskStore, DEFAULT_SETTINGS_FILE};

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_MAX_CONCURRENT: usize = 3;
pub const DEFAULT_TERMINATE_GRACE: Duration = Duration::from_secs(2);

pub(crate) type CommandResponse<T> = oneshot::Sender<Result<T>>;

pub(crate) enum ManagerCommand {
    AddTask(NewTask, CommandResponse<DownloadTask>),
    PauseTask(String, CommandResponse<()>),
    ResumeTask(String, CommandResponse<()>),
    CancelTask(String, CommandResponse<()>),
    DeleteTask {
        id: String,
        delete_file: bool,
        response: CommandResponse<()>,
    },
    RetryTask(String, CommandResponse<()>),
    PauseAll(CommandResponse<()>),
    ResumeAll(CommandResponse<()>),
    ClearTasks(ClearKind, CommandResponse<()>),
    SetMaxConcurrent(usize, CommandResponse<()>),
    GetMaxConcurrent(CommandResponse<usize>),
    GetTask(String, CommandResponse<Option<DownloadTask>>),
    GetTasks(CommandResponse<Vec<DownloadTask>>),
    ValidateFiles(CommandResponse<usize>),
    Shutdown(CommandResponse<()>),
}

/// what the start-up of an admitted task resolved
#[derive(Debug)]
pub(crate) struct Prepared {
    url: String,
    lyric: Option<String>,
}

pub(crate) struct StartupMessage {
    task_id: String,
    /// must still match the task's admission, otherwise the result is stale
    admission: u64,
    result: std::result::Result<Prepared, String>,
}

#[derive(Debug, Clone)]
pub(crate) struct SchedulerConfig {
    pub max_retries: u32,
    pub progress_interval: Duration,
    pub terminate_grace: Duration,
}

#[derive(Clone)]
pub(crate) struct Collaborators {
    pub adapter: AnyAdapter,
    pub url_resolver: Option<Arc<dyn UrlResolver>>,
    pub lyric_resolver: Option<Arc<dyn LyricResolver>>,
    pub post_processor: Option<Arc<dyn PostProcessor>>,
}

/// admitted, still resolving, no runner yet
struct Initializing {
    admission: u64,
    abort: AbortHandle,
}

struct ActiveRunner {
    runner_id: RunnerId,
    admission: u64,
    control: Sender<ManagerMessage>,
    abort: AbortHandle,
    /// the url came from the resolver and is dropped again on failure
    resolved_url: bool,
    /// past the rename, the unit no longer reads control signals
    finalizing: bool,
}

/// signalled to stop, waiting for its exit
struct StoppingRunner {
    task_id: String,
    signal: ManagerMessage,
    abort: AbortHandle,
    finalizing: bool,
    /// kept open so the signal is read before the channel closes
    _control: Sender<ManagerMessage>,
}

enum Inbound {
    Runner(RunnerMessage),
    Startup(StartupMessage),
    /// the terminate grace of a stopping runner is over
    Deadline(RunnerId),
    Command(ManagerCommand),
    Closed,
}

async fn prepare(
    task: &DownloadTask,
    url_resolver: Option<&dyn UrlResolver>,
    lyric_resolver: Option<&dyn LyricResolver>,
) -> std::result::Result<Prepared, String> {
    let url = if task.url.is_empty() {
        let resolver = url_resolver.ok_or_else(|| "no url and no url resolver".to_string())?;
        let url = resolver
            .resolve_url(task)
            .await
            .map_err(|e| format!("failed to resolve the url: {}", e))?;
        if url.is_empty() {
            return Err("failed to resolve the url: empty url".to_string());
        }
        url
    } else {
        task.url.clone()
    };

    let lyric = match lyric_resolver {
        Some(resolver) if task.tag_write_options.lyric && task.lyric.is_none() => {
            match resolver.resolve_lyric(task).await {
                Ok(lyric) => lyric,
                Err(e) => {
                    log::warn!("failed to resolve the lyric of task {}: {}", task.id, e);
                    None
                }
            }
        }
        _ => task.lyric.clone(),
    };
    Ok(Prepared { url, lyric })
}

pub(crate) struct Scheduler {
    store: TaskStore,
    settings: SettingsStore,
    queue: PendingQueue,
    initializing: HashMap<String, Initializing>,
    active: HashMap<String, ActiveRunner>,
    stopping: HashMap<RunnerId, StoppingRunner>,
    config: SchedulerConfig,
    collaborators: Collaborators,
    events: EventBus,
    cmd_rx: Receiver<ManagerCommand>,
    runner_channel: (Sender<RunnerMessage>, Receiver<RunnerMessage>),
    startup_channel: (Sender<StartupMessage>, Receiver<StartupMessage>),
    deadline_channel: (Sender<RunnerId>, Receiver<RunnerId>),
    next_runner_id: RunnerId,
    next_admission: u64,
}

impl Scheduler {
    pub(crate) fn new(
        store: TaskStore,
        settings: SettingsStore,
        config: SchedulerConfig,
        collaborators: Collaborators,
        events: EventBus,
        cmd_rx: Receiver<ManagerCommand>,
    ) -> Self {
        let mut queue = PendingQueue::default();
        for task in store
            .all()
            .iter()
            .filter(|task| task.status == TaskStatus::Queued)
        {
            queue.push_sorted(task.id.clone(), task.priority);
        }
        Self {
            store,
            settings,
            queue,
            initializing: HashMap::new(),
            active: HashMap::new(),
            stopping: HashMap::new(),
            config,
            collaborators,
            events,
            cmd_rx,
            runner_channel: async_channel::unbounded(),
            startup_channel: async_channel::unbounded(),
            deadline_channel: async_channel::unbounded(),
            next_runner_id: 0,
            next_admission: 0,
        }
    }

    /// the main loop of the scheduler
    /// It returns once shut down or once every handle is dropped.
    pub(crate) async fn run(mut self) {
        log::debug!(
            "scheduler started with {} tasks, {} queued",
            self.store.len(),
            self.queue.len()
        );
        self.admit().await;
        loop {
            let inbound = {
                let runner = self.runner_channel.1.recv().fuse();
                let startup = self.startup_channel.1.recv().fuse();
                let deadline = self.deadline_channel.1.recv().fuse();
                let command = self.cmd_rx.recv().fuse();
                futures::pin_mut!(runner, startup, deadline, command);
                // runner messages first, so a command never acts on outdated progress
                futures::select_biased! {
                    msg = runner => msg.map(Inbound::Runner).unwrap_or(Inbound::Closed),
                    msg = startup => msg.map(Inbound::Startup).unwrap_or(Inbound::Closed),
                    id = deadline => id.map(Inbound::Deadline).unwrap_or(Inbound::Closed),
                    cmd = command => cmd.map(Inbound::Command).unwrap_or(Inbound::Closed),
                }
            };
            match inbound {
                Inbound::Runner(msg) => self.handle_runner_message(msg).await,
                Inbound::Startup(msg) => self.handle_startup(msg).await,
                Inbound::Deadline(runner_id) => self.handle_deadline(runner_id).await,
                Inbound::Command(cmd) => {
                    if let Some(response) = self.handle_cmd(cmd).await {
                        self.shutdown().await;
                        let _ = response.send(Ok(()));
                        return;
                    }
                }
                // Only the cmd is closed, all the handles are gone
                Inbound::Closed => {
                    self.shutdown().await;
                    return;
                }
            }
            self.admit().await;
        }
    }

    /// Answer a command. A shutdown is handed back to the loop with its response.
    async fn handle_cmd(&mut self, cmd: ManagerCommand) -> Option<CommandResponse<()>> {
        match cmd {
            ManagerCommand::AddTask(request, response) => {
                let _ = response.send(self.add_task(request).await);
            }
            ManagerCommand::PauseTask(id, response) => {
                let _ = response.send(self.pause_task(&id).await);
            }
            ManagerCommand::ResumeTask(id, response) => {
                let _ = response.send(self.resume_task(&id).await);
            }
            ManagerCommand::CancelTask(id, response) => {
                let _ = response.send(self.cancel_task(&id).await);
            }
            ManagerCommand::DeleteTask {
                id,
                delete_file,
                response,
            } => {
                let _ = response.send(self.delete_task(&id, delete_file).await);
            }
            ManagerCommand::RetryTask(id, response) => {
                let _ = response.send(self.retry_task(&id).await);
            }
            ManagerCommand::PauseAll(response) => {
                self.pause_all().await;
                let _ = response.send(Ok(()));
            }
            ManagerCommand::ResumeAll(response) => {
                self.resume_all().await;
                let _ = response.send(Ok(()));
            }
            ManagerCommand::ClearTasks(kind, response) => {
                self.clear_tasks(kind).await;
                let _ = response.send(Ok(()));
            }
            ManagerCommand::SetMaxConcurrent(max, response) => {
                self.set_max_concurrent(max).await;
                let _ = response.send(Ok(()));
            }
            ManagerCommand::GetMaxConcurrent(response) => {
                let _ = response.send(Ok(self.settings.max_concurrent()));
            }
            ManagerCommand::GetTask(id, response) => {
                let _ = response.send(Ok(self.store.get(&id).cloned()));
            }
            ManagerCommand::GetTasks(response) => {
                let _ = response.send(Ok(self.store.all().to_vec()));
            }
            ManagerCommand::ValidateFiles(response) => {
                let _ = response.send(Ok(self.validate_files().await));
            }
            ManagerCommand::Shutdown(response) => return Some(response),
        }
        None
    }

    fn in_flight(&self) -> usize {
        self.active.len() + self.initializing.len()
    }

    fn emit(&self, event: ManagerEvent) {
        self.events.emit(event);
    }

    /// set the status, drop the rate fields and return a copy for the event
    fn transition(&mut self, id: &str, status: TaskStatus) -> Option<DownloadTask> {
        let task = self.store.get_mut(id)?;
        log::debug!("task {}: {:?} -> {:?}", id, task.status, status);
        task.status = status;
        task.clear_rate();
        Some(task.clone())
    }

    fn status_of(&self, id: &str) -> Result<TaskStatus> {
        self.store
            .get(id)
            .map(|task| task.status)
            .ok_or_else(|| ManagerError::TaskNotFound(id.to_string()))
    }

    /// Move queued tasks into start-up while there is capacity
    async fn admit(&mut self) {
        let mut admitted = false;
        while self.in_flight() < self.settings.max_concurrent() {
            let Some(id) = self.queue.pop_front() else {
                break;
            };
            let Some(task) = self.store.get_mut(&id) else {
                log::warn!("queued task {} is not in the store", id);
                continue;
            };
            if task.status != TaskStatus::Queued {
                log::warn!("task {} was queued with status {:?}", id, task.status);
                continue;
            }
            task.status = TaskStatus::Downloading;
            let task = task.clone();

            self.next_admission += 1;
            let admission = self.next_admission;
            let abort = self.spawn_startup(task.clone(), admission);
            self.initializing
                .insert(id.clone(), Initializing { admission, abort });
            log::debug!("admitted task {} ({})", id, admission);
            self.emit(ManagerEvent::TaskStatusChanged { task });
            admitted = true;
        }
        if admitted {
            self.store.save().await;
        }
    }

    fn spawn_startup(&self, task: DownloadTask, admission: u64) -> AbortHandle {
        let url_resolver = self.collaborators.url_resolver.clone();
        let lyric_resolver = self.collaborators.lyric_resolver.clone();
        let tx = self.startup_channel.0.clone();
        let exit_tx = tx.clone();
        let task_id = task.id.clone();
        runtime::spawn_supervised(
            async move {
                let result = prepare(&task, url_resolver.as_deref(), lyric_resolver.as_deref()).await;
                let _ = tx
                    .send(StartupMessage {
                        task_id: task.id.clone(),
                        admission,
                        result,
                    })
                    .await;
            },
            move |status| async move {
                if let ExitStatus::Panicked(msg) = status {
                    let _ = exit_tx
                        .send(StartupMessage {
                            task_id,
                            admission,
                            result: Err(format!("start-up panicked: {}", msg)),
                        })
                        .await;
                }
            },
        )
    }

    async fn handle_startup(&mut self, msg: StartupMessage) {
        match self.initializing.get(&msg.task_id) {
            Some(init) if init.admission == msg.admission => {}
            _ => {
                log::debug!("drop a stale start-up result of task {}", msg.task_id);
                return;
            }
        }
        self.initializing.remove(&msg.task_id);
        match msg.result {
            Ok(prepared) => self.start_runner(&msg.task_id, msg.admission, prepared).await,
            Err(error) => self.fail_task(&msg.task_id, error).await,
        }
    }

    async fn start_runner(&mut self, id: &str, admission: u64, prepared: Prepared) {
        let Some(task) = self.store.get_mut(id) else {
            return;
        };
        let resolved_url = task.url.is_empty();
        task.url = prepared.url;
        task.lyric = prepared.lyric;
        task.error = None;
        let payload = task.clone();

        self.next_runner_id += 1;
        let runner_id = self.next_runner_id;
        let (control_tx, control_rx) = async_channel::unbounded();
        let runner = TaskRunner::new(
            runner_id,
            payload,
            self.collaborators.adapter.clone(),
            control_rx,
            self.runner_channel.0.clone(),
        )
        .post_processor(self.collaborators.post_processor.clone())
        .progress_interval(self.config.progress_interval);
        let exit_tx = self.runner_channel.0.clone();
        let abort = runtime::spawn_supervised(runner.run(), move |status| async move {
            let _ = exit_tx
                .send(RunnerMessage(runner_id, RunnerMessageKind::Exited(status)))
                .await;
        });
        self.active.insert(
            id.to_string(),
            ActiveRunner {
                runner_id,
                admission,
                control: control_tx,
                abort,
                resolved_url,
                finalizing: false,
            },
        );
        log::info!("task {} is downloading with runner {}", id, runner_id);
        self.store.save().await;
    }

    fn task_of_runner(&self, runner_id: RunnerId) -> Option<String> {
        self.active
            .iter()
            .find(|(_, runner)| runner.runner_id == runner_id)
            .map(|(id, _)| id.clone())
    }

    fn apply_progress(&mut self, id: String, progress: ProgressInfo) {
        if let Some(task) = self.store.get_mut(&id) {
            task.apply_progress(&progress);
            self.emit(ManagerEvent::TaskProgress { id, progress });
        }
    }

    async fn handle_runner_message(&mut self, RunnerMessage(runner_id, kind): RunnerMessage) {
        if self.stopping.contains_key(&runner_id) {
            self.handle_stopping_message(runner_id, kind).await;
            return;
        }
        let Some(id) = self.task_of_runner(runner_id) else {
            log::trace!("drop a message of the released runner {}", runner_id);
            return;
        };
        match kind {
            RunnerMessageKind::Progress(progress) => self.apply_progress(id, progress),
            RunnerMessageKind::Finalizing(progress) => {
                if let Some(runner) = self.active.get_mut(&id) {
                    runner.finalizing = true;
                }
                self.apply_progress(id, progress);
            }
            RunnerMessageKind::Completed(outcome) => self.complete_task(&id, outcome).await,
            RunnerMessageKind::Failed(error) => self.fail_task(&id, error).await,
            RunnerMessageKind::Exited(status) => {
                // still active, so the runner is gone without a terminal message
                let error = match status {
                    ExitStatus::Panicked(msg) => format!("the download unit panicked: {}", msg),
                    status => format!("the download unit exited unexpectedly: {:?}", status),
                };
                self.fail_task(&id, error).await;
            }
            RunnerMessageKind::Paused | RunnerMessageKind::Cancelled => {
                self.fail_task(&id, "the download unit stopped unexpectedly".to_string())
                    .await;
            }
        }
    }

    /// Messages of a runner that was told to stop. Only a completion still
    /// matters, everything else is already settled by the stop.
    async fn handle_stopping_message(&mut self, runner_id: RunnerId, kind: RunnerMessageKind) {
        match kind {
            RunnerMessageKind::Finalizing(_) => {
                if let Some(stopping) = self.stopping.get_mut(&runner_id) {
                    stopping.finalizing = true;
                }
            }
            RunnerMessageKind::Completed(outcome) => {
                if let Some(stopping) = self.stopping.remove(&runner_id) {
                    self.complete_stopped_task(&stopping.task_id, outcome).await;
                }
            }
            RunnerMessageKind::Exited(status) => {
                if let Some(stopping) = self.stopping.remove(&runner_id) {
                    log::debug!(
                        "stopped runner {} of task {} exited: {:?}",
                        runner_id,
                        stopping.task_id,
                        status
                    );
                }
            }
            RunnerMessageKind::Progress(_)
            | RunnerMessageKind::Failed(_)
            | RunnerMessageKind::Paused
            | RunnerMessageKind::Cancelled => {}
        }
    }

    /// The file of a paused or cancelled task landed anyway
    async fn complete_stopped_task(&mut self, id: &str, outcome: TransferOutcome) {
        match self.store.get(id).map(|task| task.status) {
            None => {
                log::debug!("task {} was removed before its transfer completed", id);
                return;
            }
            Some(TaskStatus::Completed) => return,
            Some(status) => log::info!(
                "task {} completed after it was stopped ({:?})",
                id,
                status
            ),
        }
        self.queue.remove(id);
        // a newer attempt would only download the same file again
        self.stop_unit(id, ManagerMessage::Cancel);
        self.complete_task(id, outcome).await;
    }

    async fn complete_task(&mut self, id: &str, outcome: TransferOutcome) {
        self.active.remove(id);
        if let Some(error) = &outcome.post_process_error {
            log::warn!("post processing of task {} failed: {}", id, error);
        }
        let Some(task) = self.store.get_mut(id) else {
            return;
        };
        task.status = TaskStatus::Completed;
        task.error = None;
        task.progress = 100.0;
        task.total_size = outcome.size;
        task.downloaded_size = outcome.size;
        task.clear_rate();
        let task = task.clone();
        log::info!(
            "task {} completed: {} ({} bytes, resumed from {})",
            id,
            outcome.path.display(),
            outcome.size,
            outcome.resumed_from
        );
        self.store.save().await;
        self.emit(ManagerEvent::TaskStatusChanged { task: task.clone() });
        self.emit(ManagerEvent::TaskCompleted { task });
    }

    /// The retry policy: requeue at the front until the retries run out
    async fn fail_task(&mut self, id: &str, error: String) {
        self.initializing.remove(id);
        let resolved_url = self
            .active
            .remove(id)
            .map(|runner| runner.resolved_url)
            .unwrap_or(false);
        let max_retries = self.config.max_retries;
        let Some(task) = self.store.get_mut(id) else {
            return;
        };
        task.retries += 1;
        task.error = Some(error.clone());
        task.clear_rate();
        if resolved_url {
            task.url.clear();
        }
        let retries = task.retries;
        if retries < max_retries {
            task.status = TaskStatus::Queued;
            let priority = task.priority;
            let task = task.clone();
            log::warn!(
                "task {} failed ({}/{}), retry: {}",
                id,
                retries,
                max_retries,
                error
            );
            self.queue.push_front(id.to_string(), priority);
            self.emit(ManagerEvent::TaskRetrying {
                id: id.to_string(),
                retries,
                error,
            });
            self.emit(ManagerEvent::TaskStatusChanged { task });
        } else {
            task.status = TaskStatus::Error;
            let task = task.clone();
            log::error!("task {} failed after {} attempts: {}", id, retries, error);
            self.emit(ManagerEvent::TaskStatusChanged { task });
            self.emit(ManagerEvent::TaskError {
                id: id.to_string(),
                error,
            });
        }
        self.store.save().await;
    }

    /// Reject a destination owned by an in-flight task, or by a completed task
    /// whose file is still there
    async fn check_destination(&self, path: &Path, except: Option<&str>) -> Result<()> {
        for task in self.store.all() {
            if except == Some(task.id.as_str()) || task.file_path != path {
                continue;
            }
            if task.status.is_in_flight() {
                return Err(ManagerError::AlreadyDownloading(path.to_path_buf()));
            }
            if task.status == TaskStatus::Completed && async_fs::metadata(path).await.is_ok() {
                return Err(ManagerError::AlreadyDownloaded(path.to_path_buf()));
            }
        }
        Ok(())
    }

    /// Signal the unit of the task, if any, and release its slot.
    /// Returns false if there was no runner to signal.
    fn stop_unit(&mut self, id: &str, signal: ManagerMessage) -> bool {
        if let Some(init) = self.initializing.remove(id) {
            init.abort.abort();
        }
        let Some(runner) = self.active.remove(id) else {
            return false;
        };
        let _ = runner.control.try_send(signal);
        let runner_id = runner.runner_id;
        self.stopping.insert(
            runner_id,
            StoppingRunner {
                task_id: id.to_string(),
                signal,
                abort: runner.abort,
                finalizing: runner.finalizing,
                _control: runner.control,
            },
        );
        let grace = self.config.terminate_grace;
        let deadline = self.deadline_channel.0.clone();
        runtime::spawn(async move {
            tokio::time::sleep(grace).await;
            let _ = deadline.send(runner_id).await;
        });
        true
    }

    /// Abort a stopping runner that outlived the grace, unless it is past the rename
    async fn handle_deadline(&mut self, runner_id: RunnerId) {
        let Some(stopping) = self.stopping.get(&runner_id) else {
            return;
        };
        if stopping.finalizing || stopping.abort.is_finished() {
            return;
        }
        let Some(stopping) = self.stopping.remove(&runner_id) else {
            return;
        };
        log::warn!(
            "runner {} ignored {:?} for {:?}, abort it",
            runner_id,
            stopping.signal,
            self.config.terminate_grace
        );
        stopping.abort.abort();
        let id = stopping.task_id.as_str();
        if stopping.signal != ManagerMessage::Cancel
            || self.active.contains_key(id)
            || self.initializing.contains_key(id)
        {
            return;
        }
        if let Some(task) = self.store.get(id) {
            let _ = async_fs::remove_file(task.temp_path()).await;
        }
    }

    /// Stop everything that still works on the task and drop its partial file
    async fn discard_work(&mut self, id: &str) {
        self.queue.remove(id);
        if self.stop_unit(id, ManagerMessage::Cancel) {
            // the runner removes the partial file itself
            return;
        }
        if let Some(task) = self.store.get(id) {
            match async_fs::remove_file(task.temp_path()).await {
                Ok(()) => log::debug!("removed the partial file of task {}", id),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => log::warn!("failed to remove the partial file of task {}: {}", id, e),
            }
        }
    }

    async fn add_task(&mut self, request: NewTask) -> Result<DownloadTask> {
        self.check_destination(&request.file_path, None).await?;
        let task = DownloadTask::from_request(request);
        self.queue.push_sorted(task.id.clone(), task.priority);
        self.store.upsert(task.clone());
        self.store.save().await;
        log::info!("task {} added: {}", task.id, task.file_path.display());
        self.emit(ManagerEvent::TaskAdded { task: task.clone() });
        Ok(task)
    }

    async fn pause_task(&mut self, id: &str) -> Result<()> {
        if self.status_of(id)? != TaskStatus::Downloading {
            return Ok(());
        }
        self.stop_unit(id, ManagerMessage::Pause);
        if let Some(task) = self.transition(id, TaskStatus::Paused) {
            self.emit(ManagerEvent::TaskStatusChanged { task });
        }
        self.store.save().await;
        Ok(())
    }

    async fn resume_task(&mut self, id: &str) -> Result<()> {
        if self.status_of(id)? != TaskStatus::Paused {
            return Ok(());
        }
        if let Some(task) = self.transition(id, TaskStatus::Queued) {
            self.queue.push_front(task.id.clone(), task.priority);
            self.emit(ManagerEvent::TaskStatusChanged { task });
        }
        self.store.save().await;
        Ok(())
    }

    async fn cancel_task(&mut self, id: &str) -> Result<()> {
        if !matches!(
            self.status_of(id)?,
            TaskStatus::Downloading | TaskStatus::Queued
        ) {
            return Ok(());
        }
        self.discard_work(id).await;
        if let Some(task) = self.transition(id, TaskStatus::Cancelled) {
            log::info!("task {} cancelled", id);
            self.emit(ManagerEvent::TaskStatusChanged { task });
        }
        self.store.save().await;
        Ok(())
    }

    async fn delete_task(&mut self, id: &str, delete_file: bool) -> Result<()> {
        self.status_of(id)?;
        self.discard_work(id).await;
        let Some(task) = self.store.remove(id) else {
            return Ok(());
        };
        if delete_file {
            match async_fs::remove_file(&task.file_path).await {
                Ok(()) => log::debug!("removed {}", task.file_path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => log::warn!("failed to remove {}: {}", task.file_path.display(), e),
            }
        }
        log::info!("task {} deleted", id);
        self.store.save().await;
        self.emit(ManagerEvent::TaskDeleted { id: id.to_string() });
        Ok(())
    }

    async fn retry_task(&mut self, id: &str) -> Result<()> {
        if !self.status_of(id)?.is_terminal() {
            return Ok(());
        }
        let path = match self.store.get(id) {
            Some(task) => task.file_path.clone(),
            None => return Ok(()),
        };
        self.check_destination(&path, Some(id)).await?;
        let Some(task) = self.store.get_mut(id) else {
            return Ok(());
        };
        task.reset_for_retry();
        task.status = TaskStatus::Queued;
        let task = task.clone();
        self.queue.push_back(task.id.clone(), task.priority);
        log::info!("task {} queued for retry", id);
        self.emit(ManagerEvent::TaskStatusChanged { task });
        self.store.save().await;
        Ok(())
    }

    async fn pause_all(&mut self) {
        let targets: Vec<String> = self
            .store
            .all()
            .iter()
            .filter(|task| matches!(task.status, TaskStatus::Downloading | TaskStatus::Queued))
            .map(|task| task.id.clone())
            .collect();
        for id in &targets {
            self.queue.remove(id);
            self.stop_unit(id, ManagerMessage::Pause);
            if let Some(task) = self.transition(id, TaskStatus::Paused) {
                self.emit(ManagerEvent::TaskStatusChanged { task });
            }
        }
        if !targets.is_empty() {
            log::info!("paused {} tasks", targets.len());
            self.store.save().await;
        }
    }

    async fn resume_all(&mut self) {
        let targets: Vec<(String, i32)> = self
            .store
            .all()
            .iter()
            .filter(|task| task.status == TaskStatus::Paused)
            .map(|task| (task.id.clone(), task.priority))
            .collect();
        // pushed in reverse so they keep their store order at the front
        for (id, priority) in targets.iter().rev() {
            self.queue.push_front(id.clone(), *priority);
        }
        for (id, _) in &targets {
            if let Some(task) = self.transition(id, TaskStatus::Queued) {
                self.emit(ManagerEvent::TaskStatusChanged { task });
            }
        }
        if !targets.is_empty() {
            log::info!("resumed {} tasks", targets.len());
            self.store.save().await;
        }
    }

    async fn clear_tasks(&mut self, kind: ClearKind) {
        let targets: Vec<String> = self
            .store
            .all()
            .iter()
            .filter(|task| kind.matches(task.status))
            .map(|task| task.id.clone())
            .collect();
        for id in &targets {
            self.discard_work(id).await;
            self.store.remove(id);
        }
        log::info!("cleared {} tasks ({:?})", targets.len(), kind);
        self.store.save().await;
        self.emit(ManagerEvent::TasksReset {
            tasks: self.store.all().to_vec(),
        });
    }

    /// Shrinking the limit evicts the most recently admitted tasks back to the
    /// front of the queue, keeping their partial files.
    async fn set_max_concurrent(&mut self, max: usize) {
        self.settings.set_max_concurrent(max);
        let max = self.settings.max_concurrent();
        self.settings.save().await;
        log::info!("max concurrent downloads set to {}", max);

        let mut evicted = false;
        while self.in_flight() > max {
            let newest = self
                .initializing
                .iter()
                .map(|(id, init)| (init.admission, id))
                .chain(self.active.iter().map(|(id, runner)| (runner.admission, id)))
                .max_by_key(|(admission, _)| *admission)
                .map(|(_, id)| id.clone());
            let Some(id) = newest else {
                break;
            };
            self.stop_unit(&id, ManagerMessage::Pause);
            if let Some(task) = self.transition(&id, TaskStatus::Queued) {
                log::debug!("evicted task {}", id);
                self.queue.push_front(task.id.clone(), task.priority);
                self.emit(ManagerEvent::TaskStatusChanged { task });
            }
            evicted = true;
        }
        if evicted {
            self.store.save().await;
        }
    }

    async fn validate_files(&mut self) -> usize {
        let invalid = self.store.validate_files().await;
        for id in &invalid {
            if let Some(task) = self.store.get(id).cloned() {
                let error = task.error.clone().unwrap_or_default();
                self.emit(ManagerEvent::TaskStatusChanged { task });
                self.emit(ManagerEvent::TaskError {
                    id: id.clone(),
                    error,
                });
            }
        }
        if !invalid.is_empty() {
            self.store.save().await;
        }
        invalid.len()
    }

    /// Stop every unit, the interrupted tasks are kept as paused
    async fn shutdown(&mut self) {
        let mut interrupted = Vec::new();
        for (id, init) in self.initializing.drain() {
            init.abort.abort();
            interrupted.push(id);
        }
        for (id, runner) in self.active.drain() {
            let _ = runner.control.try_send(ManagerMessage::Pause);
            runner.abort.abort();
            interrupted.push(id);
        }
        for (runner_id, stopping) in self.stopping.drain() {
            if stopping.finalizing {
                log::debug!("leave runner {} to finish its post processing", runner_id);
            } else {
                stopping.abort.abort();
            }
        }
        for id in &interrupted {
            if let Some(task) = self.store.get_mut(id) {
                task.status = TaskStatus::Paused;
                task.clear_rate();
            }
        }
        self.store.save().await;
        log::info!(
            "download manager stopped, {} tasks interrupted",
            interrupted.len()
        );
    }
}
