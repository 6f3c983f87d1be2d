#![allow(dead_code)]

use std::{
    collections::HashMap,
    path::Path,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_stream::stream;
use async_trait::async_trait;
use bolt_queue::{
    adapter::{AdapterError, AnyBytesStream, DownloadAdapter, TransferResponse},
    DownloadManager, DownloadTask, ManagerBuilder, TaskStatus,
};
use bytes::Bytes;
use url::Url;

pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub enum Behavior {
    /// serve the payload at once, honoring the offset
    Serve(Vec<u8>),
    /// serve the payload in 10 byte chunks, 5ms apart
    Slow(Vec<u8>),
    /// answer with a status error
    Fail(u16),
    /// a stream without end
    Hang,
}

/// A scripted byte source keyed by url, records every open call
#[derive(Default)]
pub struct MockAdapter {
    routes: Mutex<HashMap<String, Behavior>>,
    opened: Mutex<Vec<(String, u64)>>,
}

impl MockAdapter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn route(&self, url: &str, behavior: Behavior) {
        self.routes
            .lock()
            .unwrap()
            .insert(url.to_string(), behavior);
    }

    /// the offsets requested for `url`, in order
    pub fn offsets(&self, url: &str) -> Vec<u64> {
        self.opened
            .lock()
            .unwrap()
            .iter()
            .filter(|(u, _)| u == url)
            .map(|(_, offset)| *offset)
            .collect()
    }
}

fn chunked(payload: Vec<u8>, start: usize, size: usize, delay: Option<Duration>) -> AnyBytesStream {
    Box::pin(stream! {
        for part in payload[start..].chunks(size) {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            yield Ok(Bytes::copy_from_slice(part));
        }
    })
}

#[async_trait]
impl DownloadAdapter for MockAdapter {
    async fn open(&self, url: &Url, offset: u64) -> Result<TransferResponse, AdapterError> {
        let url = url.to_string();
        self.opened.lock().unwrap().push((url.clone(), offset));
        let behavior = self.routes.lock().unwrap().get(&url).cloned();
        match behavior {
            Some(Behavior::Serve(payload)) => Ok(TransferResponse {
                offset,
                total: Some(payload.len() as u64),
                stream: chunked(payload, offset as usize, 64, None),
            }),
            Some(Behavior::Slow(payload)) => Ok(TransferResponse {
                offset,
                total: Some(payload.len() as u64),
                stream: chunked(payload, offset as usize, 10, Some(Duration::from_millis(5))),
            }),
            Some(Behavior::Fail(status)) => Err(AdapterError::Status(status)),
            Some(Behavior::Hang) => Ok(TransferResponse {
                offset,
                total: None,
                stream: Box::pin(stream! {
                    loop {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        yield Ok(Bytes::from_static(&[7; 16]));
                    }
                }),
            }),
            None => Err(AdapterError::Status(404)),
        }
    }
}

pub fn url(name: &str) -> String {
    format!("http://mock.local/{}", name)
}

pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

pub fn builder(dir: &Path, adapter: Arc<MockAdapter>) -> ManagerBuilder {
    DownloadManager::builder()
        .store_path(dir.join("tasks.json"))
        .adapter(adapter)
        .progress_interval(Duration::from_millis(10))
        .terminate_grace(Duration::from_millis(200))
}

/// poll until the task satisfies `pred`
pub async fn wait_for(
    manager: &DownloadManager,
    id: &str,
    pred: impl Fn(&DownloadTask) -> bool,
) -> DownloadTask {
    let polling = async {
        loop {
            if let Some(task) = manager.get_task(id).await.unwrap() {
                if pred(&task) {
                    return task;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(WAIT_TIMEOUT, polling)
        .await
        .unwrap_or_else(|_| panic!("task {} never reached the expected state", id))
}

pub async fn wait_status(manager: &DownloadManager, id: &str, status: TaskStatus) -> DownloadTask {
    wait_for(manager, id, |task| task.status == status).await
}

/// poll until the whole task list satisfies `pred`
pub async fn wait_all(
    manager: &DownloadManager,
    pred: impl Fn(&[DownloadTask]) -> bool,
) -> Vec<DownloadTask> {
    let polling = async {
        loop {
            let tasks = manager.get_tasks().await.unwrap();
            if pred(&tasks) {
                return tasks;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(WAIT_TIMEOUT, polling)
        .await
        .expect("the task list never reached the expected state")
}

pub fn count(tasks: &[DownloadTask], status: TaskStatus) -> usize {
    tasks.iter().filter(|task| task.status == status).count()
}
