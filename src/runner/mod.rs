//! The execution unit.
//!
//! A [`TaskRunner`] owns one task's byte transfer. It talks to the scheduler
//! only through channels: [`ManagerMessage`] in, [`RunnerMessage`] out. It
//! writes into the temporary sibling file, resumes from its size with a range
//! request and only renames it to the destination once the transfer is whole.

use std::{path::PathBuf, sync::Arc, time::Duration};

use async_channel::{Receiver, Sender};
use futures::{AsyncWriteExt, FutureExt, StreamExt};
use url::Url;

use crate::{
    adapter::AnyAdapter,
    resolver::PostProcessor,
    runtime::ExitStatus,
    task::{DownloadTask, ProgressInfo},
};

mod progress;

pub use progress::ProgressTracker;

pub type RunnerId = usize;

pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

/// messages for manager -> runner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerMessage {
    /// stop and keep the partial file for a later resume
    Pause,
    /// stop and remove the partial file
    Cancel,
}

/// messages for runner -> manager
#[derive(Debug)]
pub struct RunnerMessage(pub RunnerId, pub RunnerMessageKind);

#[derive(Debug)]
pub enum RunnerMessageKind {
    /// rate-limited progress report
    Progress(ProgressInfo),
    /// the file is renamed into place and post processing starts,
    /// control signals are no longer read
    Finalizing(ProgressInfo),
    /// the file is in place
    Completed(TransferOutcome),
    /// the transfer failed
    Failed(String),
    /// acknowledged a pause signal
    Paused,
    /// acknowledged a cancel signal
    Cancelled,
    /// sent by the supervisor after the runner is gone
    Exited(ExitStatus),
}

/// The result of a successful transfer
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TransferOutcome {
    pub path: PathBuf,
    pub size: u64,
    /// the size of the partial file the transfer continued from
    pub resumed_from: u64,
    /// the post processing step failed, the file itself is fine
    pub post_process_error: Option<String>,
}

#[derive(Clone)]
/// a wrapper of the runner message sender
pub(crate) struct RunnerMessageSender(RunnerId, Sender<RunnerMessage>);

impl RunnerMessageSender {
    pub fn new(runner_id: RunnerId, sender: Sender<RunnerMessage>) -> Self {
        Self(runner_id, sender)
    }

    pub async fn send(
        &self,
        message: RunnerMessageKind,
    ) -> Result<(), async_channel::SendError<RunnerMessage>> {
        self.1.send(RunnerMessage(self.0, message)).await
    }
}

#[derive(Debug)]
enum TaskRunError {
    Paused,
    Cancelled,
    Failed(String),
}

impl From<std::io::Error> for TaskRunError {
    fn from(err: std::io::Error) -> Self {
        Self::Failed(format!("io error: {}", err))
    }
}

fn signal_to_error(signal: Result<ManagerMessage, async_channel::RecvError>) -> TaskRunError {
    match signal {
        Ok(ManagerMessage::Pause) => TaskRunError::Paused,
        Ok(ManagerMessage::Cancel) => TaskRunError::Cancelled,
        // the manager is released, nobody is waiting for this transfer
        Err(_) => TaskRunError::Failed("control channel closed".to_string()),
    }
}

/// Await `fut` unless a control signal arrives first
async fn until_signal<F: std::future::Future>(
    control_signal: &Receiver<ManagerMessage>,
    fut: F,
) -> Result<F::Output, TaskRunError> {
    let signal = control_signal.recv().fuse();
    let fut = fut.fuse();
    futures::pin_mut!(signal, fut);
    futures::select! {
        signal = signal => Err(signal_to_error(signal)),
        output = fut => Ok(output),
    }
}

/// runner for a single task, responsible for the transfer and the post processing
pub struct TaskRunner {
    id: RunnerId,
    /// the payload handed over at start
    task: DownloadTask,
    adapter: AnyAdapter,
    post_processor: Option<Arc<dyn PostProcessor>>,
    /// the receiver of the manager messages
    control_signal: Receiver<ManagerMessage>,
    /// the sender of the runner messages
    notify: RunnerMessageSender,
    progress_interval: Duration,
}

impl TaskRunner {
    pub fn new(
        id: RunnerId,
        task: DownloadTask,
        adapter: AnyAdapter,
        control_signal: Receiver<ManagerMessage>,
        notify: Sender<RunnerMessage>,
    ) -> Self {
        Self {
            id,
            task,
            adapter,
            post_processor: None,
            control_signal,
            notify: RunnerMessageSender::new(id, notify),
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }

    pub fn post_processor(mut self, post_processor: Option<Arc<dyn PostProcessor>>) -> Self {
        self.post_processor = post_processor;
        self
    }

    pub fn progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    /// run the task runner
    /// This function will block until the transfer is finished, failed, paused or cancelled.
    /// It should be called in a new thread or async spawn context
    pub async fn run(mut self) {
        let message = match self.run_inner().await {
            Ok(outcome) => RunnerMessageKind::Completed(outcome),
            Err(TaskRunError::Paused) => {
                log::debug!("runner {}: paused task {}", self.id, self.task.id);
                RunnerMessageKind::Paused
            }
            Err(TaskRunError::Cancelled) => {
                log::debug!("runner {}: cancelled task {}", self.id, self.task.id);
                let _ = async_fs::remove_file(self.task.temp_path()).await;
                RunnerMessageKind::Cancelled
            }
            Err(TaskRunError::Failed(msg)) => {
                log::warn!("runner {}: task {} failed: {}", self.id, self.task.id, msg);
                RunnerMessageKind::Failed(msg)
            }
        };
        let _ = self.notify.send(message).await;
    }

    async fn run_inner(&mut self) -> Result<TransferOutcome, TaskRunError> {
        let url = Url::parse(&self.task.url)
            .map_err(|e| TaskRunError::Failed(format!("invalid url {:?}: {}", self.task.url, e)))?;
        let temp_path = self.task.temp_path();
        if let Some(parent) = temp_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            async_fs::create_dir_all(parent).await?;
        }
        let existing = async_fs::metadata(&temp_path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);

        let response = until_signal(&self.control_signal, self.adapter.open(&url, existing))
            .await?
            .map_err(|e| TaskRunError::Failed(e.to_string()))?;
        let offset = match response.offset {
            offset if offset == existing => existing,
            0 => {
                log::debug!(
                    "runner {}: source ignored the range, restart {} from 0",
                    self.id,
                    self.task.id
                );
                0
            }
            offset => {
                return Err(TaskRunError::Failed(format!(
                    "source answered from byte {} instead of {}",
                    offset, existing
                )));
            }
        };
        log::debug!(
            "runner {}: start task {} at {}, total {:?}",
            self.id,
            self.task.id,
            offset,
            response.total
        );

        let mut file = if offset > 0 {
            async_fs::OpenOptions::new()
                .append(true)
                .open(&temp_path)
                .await?
        } else {
            async_fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temp_path)
                .await?
        };

        let mut tracker = ProgressTracker::new(offset, response.total, self.progress_interval);
        let mut stream = response.stream;
        let control_signal = self.control_signal.clone();
        loop {
            let signal = control_signal.recv().fuse();
            let chunk = stream.next().fuse();
            futures::pin_mut!(signal, chunk);
            let next = futures::select! {
                signal = signal => Err(signal_to_error(signal)),
                item = chunk => Ok(item),
            };
            match next {
                Ok(Some(Ok(bytes))) => {
                    file.write_all(&bytes).await?;
                    if let Some(report) = tracker.advance(bytes.len() as u64) {
                        self.notify
                            .send(RunnerMessageKind::Progress(report))
                            .await
                            .map_err(|_| TaskRunError::Failed("channel closed".to_string()))?;
                    }
                }
                Ok(Some(Err(err))) => {
                    let _ = file.flush().await;
                    return Err(TaskRunError::Failed(err.to_string()));
                }
                // In this case, the stream is finished
                Ok(None) => break,
                Err(err) => {
                    let _ = file.flush().await;
                    return Err(err);
                }
            }
        }
        file.flush().await?;
        drop(file);

        match tracker.total() {
            Some(total) if total == tracker.downloaded() => {}
            Some(total) => {
                if tracker.downloaded() > total {
                    // the partial file is unusable for a resume
                    let _ = async_fs::remove_file(&temp_path).await;
                }
                return Err(TaskRunError::Failed(format!(
                    "downloaded content does not match the total size, total: {}, downloaded: {}",
                    total,
                    tracker.downloaded()
                )));
            }
            None if tracker.downloaded() > 0 => {}
            None => {
                return Err(TaskRunError::Failed("empty content".to_string()));
            }
        }

        if let Some(parent) = self.task.file_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            async_fs::create_dir_all(parent).await?;
        }
        async_fs::rename(&temp_path, &self.task.file_path).await?;
        let _ = self
            .notify
            .send(RunnerMessageKind::Finalizing(tracker.finish()))
            .await;

        let post_process_error = match &self.post_processor {
            Some(post_processor) => post_processor
                .process(&self.task, &self.task.file_path)
                .await
                .err()
                .map(|e| e.to_string()),
            None => None,
        };

        Ok(TransferOutcome {
            path: self.task.file_path.clone(),
            size: tracker.downloaded(),
            resumed_from: offset,
            post_process_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        adapter::{AdapterError, AnyBytesStream, DownloadAdapter, TransferResponse},
        error::BoxError,
        task::NewTask,
    };
    use async_stream::stream;
    use async_trait::async_trait;
    use bytes::Bytes;
    use pretty_assertions::assert_eq;
    use std::{path::Path, sync::Mutex};
    use test_log::test;
    use tokio::time::sleep;

    struct FnAdapter<F>(F);

    #[async_trait]
    impl<F> DownloadAdapter for FnAdapter<F>
    where
        F: Fn(u64) -> Result<TransferResponse, AdapterError> + Send + Sync,
    {
        async fn open(&self, _url: &Url, offset: u64) -> Result<TransferResponse, AdapterError> {
            (self.0)(offset)
        }
    }

    fn chunked(payload: Vec<u8>, start: usize) -> AnyBytesStream {
        Box::pin(stream! {
            for part in payload[start..].chunks(10) {
                yield Ok(Bytes::copy_from_slice(part));
            }
        })
    }

    fn endless() -> AnyBytesStream {
        Box::pin(stream! {
            loop {
                sleep(Duration::from_millis(10)).await;
                yield Ok(Bytes::from(vec![1; 10]));
            }
        })
    }

    fn payload() -> Vec<u8> {
        (0..100u8).collect()
    }

    /// serves `payload` honoring the requested offset, records the offsets
    fn range_adapter(payload: Vec<u8>, offsets: Arc<Mutex<Vec<u64>>>) -> AnyAdapter {
        Arc::new(FnAdapter(move |offset: u64| {
            offsets.lock().unwrap().push(offset);
            Ok(TransferResponse {
                offset,
                total: Some(payload.len() as u64),
                stream: chunked(payload.clone(), offset as usize),
            })
        }))
    }

    fn task_in(dir: &Path) -> DownloadTask {
        DownloadTask::from_request(
            NewTask::new(dir.join("out").join("song.mp3")).url("http://localhost/song.mp3"),
        )
    }

    fn start(
        task: DownloadTask,
        adapter: AnyAdapter,
    ) -> (Sender<ManagerMessage>, Receiver<RunnerMessage>) {
        let (control_tx, control_rx) = async_channel::unbounded();
        let (tx, rx) = async_channel::unbounded();
        let runner = TaskRunner::new(1, task, adapter, control_rx, tx)
            .progress_interval(Duration::from_millis(1));
        tokio::spawn(runner.run());
        (control_tx, rx)
    }

    /// wait for the terminal message, skipping progress reports
    async fn terminal(rx: &Receiver<RunnerMessage>) -> RunnerMessageKind {
        while let Ok(RunnerMessage(id, kind)) = rx.recv().await {
            assert_eq!(id, 1);
            if !matches!(
                kind,
                RunnerMessageKind::Progress(_) | RunnerMessageKind::Finalizing(_)
            ) {
                return kind;
            }
        }
        panic!("runner channel closed without a terminal message");
    }

    #[test(tokio::test)]
    async fn test_normal_download() {
        let dir = tempfile::tempdir().unwrap();
        let task = task_in(dir.path());
        let offsets = Arc::new(Mutex::new(vec![]));
        let (_control, rx) = start(task.clone(), range_adapter(payload(), offsets.clone()));

        let mut last_progress = None;
        let outcome = loop {
            match rx.recv().await.unwrap().1 {
                RunnerMessageKind::Progress(_) => {}
                RunnerMessageKind::Finalizing(p) => last_progress = Some(p),
                RunnerMessageKind::Completed(outcome) => break outcome,
                other => panic!("unexpected message: {:?}", other),
            }
        };
        assert_eq!(outcome.size, 100);
        assert_eq!(outcome.resumed_from, 0);
        assert_eq!(outcome.post_process_error, None);
        assert_eq!(last_progress.unwrap().progress, 100.0);
        assert_eq!(std::fs::read(&task.file_path).unwrap(), payload());
        assert!(!task.temp_path().exists());
        assert_eq!(*offsets.lock().unwrap(), vec![0]);
    }

    #[test(tokio::test)]
    async fn test_resume_from_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let task = task_in(dir.path());
        std::fs::create_dir_all(task.temp_path().parent().unwrap()).unwrap();
        std::fs::write(task.temp_path(), &payload()[..40]).unwrap();

        let offsets = Arc::new(Mutex::new(vec![]));
        let (_control, rx) = start(task.clone(), range_adapter(payload(), offsets.clone()));
        match terminal(&rx).await {
            RunnerMessageKind::Completed(outcome) => {
                assert_eq!(outcome.resumed_from, 40);
                assert_eq!(outcome.size, 100);
            }
            other => panic!("unexpected message: {:?}", other),
        }
        // only the remaining 60% was requested
        assert_eq!(*offsets.lock().unwrap(), vec![40]);
        assert_eq!(std::fs::read(&task.file_path).unwrap(), payload());
    }

    #[test(tokio::test)]
    async fn test_range_ignored_restarts_from_zero() {
        let dir = tempfile::tempdir().unwrap();
        let task = task_in(dir.path());
        std::fs::create_dir_all(task.temp_path().parent().unwrap()).unwrap();
        std::fs::write(task.temp_path(), vec![0xff; 40]).unwrap();

        let adapter: AnyAdapter = Arc::new(FnAdapter(|_offset: u64| {
            Ok(TransferResponse {
                offset: 0,
                total: Some(100),
                stream: chunked(payload(), 0),
            })
        }));
        let (_control, rx) = start(task.clone(), adapter);
        assert!(matches!(terminal(&rx).await, RunnerMessageKind::Completed(_)));
        assert_eq!(std::fs::read(&task.file_path).unwrap(), payload());
    }

    #[test(tokio::test)]
    async fn test_pause_keeps_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let task = task_in(dir.path());
        let adapter: AnyAdapter = Arc::new(FnAdapter(|offset: u64| {
            Ok(TransferResponse {
                offset,
                total: None,
                stream: endless(),
            })
        }));
        let (control, rx) = start(task.clone(), adapter);

        // wait for some bytes to land
        while let Ok(RunnerMessage(_, kind)) = rx.recv().await {
            if matches!(kind, RunnerMessageKind::Progress(_)) {
                break;
            }
        }
        control.send(ManagerMessage::Pause).await.unwrap();
        assert!(matches!(terminal(&rx).await, RunnerMessageKind::Paused));
        assert!(std::fs::metadata(task.temp_path()).unwrap().len() > 0);
        assert!(!task.file_path.exists());
    }

    #[test(tokio::test)]
    async fn test_cancel_removes_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let task = task_in(dir.path());
        let adapter: AnyAdapter = Arc::new(FnAdapter(|offset: u64| {
            Ok(TransferResponse {
                offset,
                total: None,
                stream: endless(),
            })
        }));
        let (control, rx) = start(task.clone(), adapter);
        while let Ok(RunnerMessage(_, kind)) = rx.recv().await {
            if matches!(kind, RunnerMessageKind::Progress(_)) {
                break;
            }
        }
        control.send(ManagerMessage::Cancel).await.unwrap();
        assert!(matches!(terminal(&rx).await, RunnerMessageKind::Cancelled));
        assert!(!task.temp_path().exists());
    }

    #[test(tokio::test)]
    async fn test_network_error() {
        let dir = tempfile::tempdir().unwrap();
        let task = task_in(dir.path());
        let adapter: AnyAdapter = Arc::new(FnAdapter(|offset: u64| {
            Ok(TransferResponse {
                offset,
                total: Some(20),
                stream: Box::pin(stream! {
                    yield Ok(Bytes::from(vec![1; 10]));
                    yield Err(AdapterError::Network("connection reset".to_string()));
                }),
            })
        }));
        let (_control, rx) = start(task.clone(), adapter);
        match terminal(&rx).await {
            RunnerMessageKind::Failed(msg) => assert!(msg.contains("connection reset")),
            other => panic!("unexpected message: {:?}", other),
        }
        // the partial file stays for the retry
        assert_eq!(std::fs::metadata(task.temp_path()).unwrap().len(), 10);
    }

    #[test(tokio::test)]
    async fn test_open_error() {
        let dir = tempfile::tempdir().unwrap();
        let task = task_in(dir.path());
        let adapter: AnyAdapter =
            Arc::new(FnAdapter(|_offset: u64| Err(AdapterError::Status(503))));
        let (_control, rx) = start(task, adapter);
        match terminal(&rx).await {
            RunnerMessageKind::Failed(msg) => assert!(msg.contains("503")),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test(tokio::test)]
    async fn test_size_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let task = task_in(dir.path());
        let adapter: AnyAdapter = Arc::new(FnAdapter(|offset: u64| {
            Ok(TransferResponse {
                offset,
                total: Some(10),
                stream: chunked(vec![2; 20], 0),
            })
        }));
        let (_control, rx) = start(task.clone(), adapter);
        assert!(matches!(terminal(&rx).await, RunnerMessageKind::Failed(_)));
        assert!(!task.temp_path().exists());
        assert!(!task.file_path.exists());
    }

    #[test(tokio::test)]
    async fn test_empty_content() {
        let dir = tempfile::tempdir().unwrap();
        let task = task_in(dir.path());
        let adapter: AnyAdapter =
            Arc::new(FnAdapter(|_offset: u64| Ok(TransferResponse::empty(0, None))));
        let (_control, rx) = start(task, adapter);
        match terminal(&rx).await {
            RunnerMessageKind::Failed(msg) => assert_eq!(msg, "empty content"),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test(tokio::test)]
    async fn test_invalid_url() {
        let dir = tempfile::tempdir().unwrap();
        let mut task = task_in(dir.path());
        task.url = "not a url".to_string();
        let offsets = Arc::new(Mutex::new(vec![]));
        let (_control, rx) = start(task, range_adapter(payload(), offsets.clone()));
        assert!(matches!(terminal(&rx).await, RunnerMessageKind::Failed(_)));
        assert!(offsets.lock().unwrap().is_empty());
    }

    struct FailingTagWriter;

    #[async_trait]
    impl PostProcessor for FailingTagWriter {
        async fn process(&self, _task: &DownloadTask, path: &Path) -> Result<(), BoxError> {
            assert!(path.exists());
            Err("cover art is corrupted".into())
        }
    }

    #[test(tokio::test)]
    async fn test_post_process_error_keeps_file() {
        let dir = tempfile::tempdir().unwrap();
        let task = task_in(dir.path());
        let offsets = Arc::new(Mutex::new(vec![]));
        let (control_tx, control_rx) = async_channel::unbounded();
        let (tx, rx) = async_channel::unbounded();
        let runner = TaskRunner::new(
            1,
            task.clone(),
            range_adapter(payload(), offsets),
            control_rx,
            tx,
        )
        .post_processor(Some(Arc::new(FailingTagWriter)));
        tokio::spawn(runner.run());

        match terminal(&rx).await {
            RunnerMessageKind::Completed(outcome) => {
                assert_eq!(
                    outcome.post_process_error,
                    Some("cover art is corrupted".to_string())
                );
            }
            other => panic!("unexpected message: {:?}", other),
        }
        assert!(task.file_path.exists());
        drop(control_tx);
    }

    struct SlowTagWriter;

    #[async_trait]
    impl PostProcessor for SlowTagWriter {
        async fn process(&self, _task: &DownloadTask, _path: &Path) -> Result<(), BoxError> {
            sleep(Duration::from_millis(200)).await;
            Ok(())
        }
    }

    #[test(tokio::test)]
    async fn test_signal_during_post_processing_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let task = task_in(dir.path());
        let offsets = Arc::new(Mutex::new(vec![]));
        let (control_tx, control_rx) = async_channel::unbounded();
        let (tx, rx) = async_channel::unbounded();
        let runner = TaskRunner::new(
            1,
            task.clone(),
            range_adapter(payload(), offsets),
            control_rx,
            tx,
        )
        .post_processor(Some(Arc::new(SlowTagWriter)));
        tokio::spawn(runner.run());

        while let Ok(RunnerMessage(_, kind)) = rx.recv().await {
            if matches!(kind, RunnerMessageKind::Finalizing(_)) {
                break;
            }
        }
        assert!(task.file_path.exists());
        control_tx.send(ManagerMessage::Cancel).await.unwrap();
        assert!(matches!(terminal(&rx).await, RunnerMessageKind::Completed(_)));
        assert_eq!(std::fs::read(&task.file_path).unwrap(), payload());
    }
}
