//! Durable state of the manager: the task document and the settings document.
//! Both are rewritten wholesale and atomically. Nothing here fails the
//! scheduler: a missing or broken document loads as empty, a failed write is
//! logged and the in-memory state stays the record.

use std::{
    io::Write,
    path::{Path, PathBuf},
};

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::task::{DownloadTask, TaskStatus};

pub const DEFAULT_SETTINGS_FILE: &str = "settings.json";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid document: {0}")]
    Json(#[from] serde_json::Error),
}

async fn read_document<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let bytes = match async_fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(Some(serde_json::from_slice(&bytes)?))
}

/// write to a temp file in the same directory, then move it over `path`
async fn write_document(path: PathBuf, bytes: Vec<u8>) -> Result<(), StoreError> {
    blocking::unblock(move || -> Result<(), StoreError> {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)?;
        let mut file = tempfile::NamedTempFile::new_in(&dir)?;
        file.write_all(&bytes)?;
        file.as_file().sync_all()?;
        file.persist(&path).map_err(|e| e.error)?;
        Ok(())
    })
    .await
}

/// All known tasks, in insertion order
#[derive(Debug)]
pub struct TaskStore {
    path: PathBuf,
    tasks: Vec<DownloadTask>,
}

impl TaskStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            tasks: Vec::new(),
        }
    }

    /// Load the document at `path`, starting empty if it is missing or corrupt
    pub async fn load(path: impl Into<PathBuf>) -> Self {
        let mut store = Self::new(path);
        match read_document::<Vec<DownloadTask>>(&store.path).await {
            Ok(Some(tasks)) => {
                log::debug!("loaded {} tasks from {}", tasks.len(), store.path.display());
                store.tasks = tasks;
            }
            Ok(None) => {
                log::debug!("no task store at {}, start empty", store.path.display());
            }
            Err(e) => {
                log::warn!(
                    "failed to load the task store {}, start empty: {}",
                    store.path.display(),
                    e
                );
            }
        }
        store
    }

    /// Tasks left `Downloading` by a previous process lost their runner.
    /// They become `Paused`, their partial file is kept for a resume.
    pub fn recover_interrupted(&mut self) -> Vec<String> {
        let mut recovered = Vec::new();
        for task in self
            .tasks
            .iter_mut()
            .filter(|task| task.status == TaskStatus::Downloading)
        {
            task.status = TaskStatus::Paused;
            task.clear_rate();
            recovered.push(task.id.clone());
        }
        if !recovered.is_empty() {
            log::info!("recovered {} interrupted tasks as paused", recovered.len());
        }
        recovered
    }

    /// Mark every completed task whose file is gone as `Error`, returns their ids
    pub async fn validate_files(&mut self) -> Vec<String> {
        let mut invalid = Vec::new();
        for task in self
            .tasks
            .iter_mut()
            .filter(|task| task.status == TaskStatus::Completed)
        {
            if async_fs::metadata(&task.file_path).await.is_ok() {
                continue;
            }
            log::warn!(
                "completed task {} lost its file {}",
                task.id,
                task.file_path.display()
            );
            task.status = TaskStatus::Error;
            task.error = Some(format!("file was removed: {}", task.file_path.display()));
            invalid.push(task.id.clone());
        }
        invalid
    }

    pub fn get(&self, id: &str) -> Option<&DownloadTask> {
        self.tasks.iter().find(|task| task.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut DownloadTask> {
        self.tasks.iter_mut().find(|task| task.id == id)
    }

    /// insert a new task or replace the one with the same id in place
    pub fn upsert(&mut self, task: DownloadTask) {
        match self.get_mut(&task.id) {
            Some(existing) => *existing = task,
            None => self.tasks.push(task),
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<DownloadTask> {
        let index = self.tasks.iter().position(|task| task.id == id)?;
        Some(self.tasks.remove(index))
    }

    pub fn all(&self) -> &[DownloadTask] {
        &self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub async fn try_save(&self) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(&self.tasks)?;
        write_document(self.path.clone(), bytes).await
    }

    /// best effort, a failure is only logged
    pub async fn save(&self) {
        if let Err(e) = self.try_save().await {
            log::error!(
                "failed to save the task store {}: {}",
                self.path.display(),
                e
            );
        }
    }
}

/// The settings document. Keys owned by the host application are kept as is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_downloads: Option<usize>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug)]
pub struct SettingsStore {
    path: PathBuf,
    settings: Settings,
    default_max_concurrent: usize,
}

impl SettingsStore {
    pub async fn load(path: impl Into<PathBuf>, default_max_concurrent: usize) -> Self {
        let path = path.into();
        let settings = match read_document::<Settings>(&path).await {
            Ok(settings) => settings.unwrap_or_default(),
            Err(e) => {
                log::warn!(
                    "failed to load the settings {}, use defaults: {}",
                    path.display(),
                    e
                );
                Settings::default()
            }
        };
        Self {
            path,
            settings,
            default_max_concurrent: default_max_concurrent.max(1),
        }
    }

    /// never zero, a zero limit would never admit anything
    pub fn max_concurrent(&self) -> usize {
        self.settings
            .max_concurrent_downloads
            .unwrap_or(self.default_max_concurrent)
            .max(1)
    }

    pub fn set_max_concurrent(&mut self, max: usize) {
        self.settings.max_concurrent_downloads = Some(max.max(1));
    }

    pub async fn save(&self) {
        let result = match serde_json::to_vec_pretty(&self.settings) {
            Ok(bytes) => write_document(self.path.clone(), bytes).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            log::error!("failed to save the settings {}: {}", self.path.display(), e);
        }
    }
}
