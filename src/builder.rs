use std::{path::PathBuf, sync::Arc, time::Duration};

use crate::{
    adapter::AnyAdapter,
    client::DownloadManager,
    event::{EventBus, DEFAULT_EVENT_CAPACITY},
    manager::{
        Collaborators, Scheduler, SchedulerConfig, SettingsStore, TaskStore,
        DEFAULT_MAX_CONCURRENT, DEFAULT_MAX_RETRIES, DEFAULT_SETTINGS_FILE,
        DEFAULT_TERMINATE_GRACE,
    },
    resolver::{LyricResolver, PostProcessor, UrlResolver},
    runner::DEFAULT_PROGRESS_INTERVAL,
    runtime,
};

#[derive(Debug, thiserror::Error)]
pub enum ManagerBuildError {
    #[error("field validation failed: {0}")]
    FieldValidationFailed(String),
}

pub struct ManagerBuilder {
    store_path: Option<PathBuf>,
    settings_path: Option<PathBuf>,
    adapter: Option<AnyAdapter>,
    url_resolver: Option<Arc<dyn UrlResolver>>,
    lyric_resolver: Option<Arc<dyn LyricResolver>>,
    post_processor: Option<Arc<dyn PostProcessor>>,
    max_retries: u32,
    default_max_concurrent: usize,
    progress_interval: Duration,
    terminate_grace: Duration,
    event_capacity: usize,
}

impl Default for ManagerBuilder {
    fn default() -> Self {
        Self {
            store_path: None,
            settings_path: None,
            adapter: None,
            url_resolver: None,
            lyric_resolver: None,
            post_processor: None,
            max_retries: DEFAULT_MAX_RETRIES,
            default_max_concurrent: DEFAULT_MAX_CONCURRENT,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            terminate_grace: DEFAULT_TERMINATE_GRACE,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

#[cfg(feature = "reqwest")]
fn default_adapter() -> Option<AnyAdapter> {
    Some(Arc::new(crate::adapter::ReqwestAdapter::default()))
}

#[cfg(not(feature = "reqwest"))]
fn default_adapter() -> Option<AnyAdapter> {
    None
}

impl ManagerBuilder {
    /// set the path of the task document
    pub fn store_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.store_path = Some(path.into());
        self
    }

    /// set the path of the settings document,
    /// defaults to `settings.json` next to the task document
    pub fn settings_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.settings_path = Some(path.into());
        self
    }

    /// set the adapter, defaults to a plain reqwest client
    pub fn adapter(mut self, adapter: AnyAdapter) -> Self {
        self.adapter = Some(adapter);
        self
    }

    pub fn url_resolver(mut self, resolver: Arc<dyn UrlResolver>) -> Self {
        self.url_resolver = Some(resolver);
        self
    }

    pub fn lyric_resolver(mut self, resolver: Arc<dyn LyricResolver>) -> Self {
        self.lyric_resolver = Some(resolver);
        self
    }

    pub fn post_processor(mut self, post_processor: Arc<dyn PostProcessor>) -> Self {
        self.post_processor = Some(post_processor);
        self
    }

    /// how many failed attempts turn a task into an error
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// used until the settings document holds a value
    pub fn default_max_concurrent(mut self, max: usize) -> Self {
        self.default_max_concurrent = max;
        self
    }

    pub fn progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    /// how long a stopped unit may take before it is aborted
    pub fn terminate_grace(mut self, grace: Duration) -> Self {
        self.terminate_grace = grace;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    fn validate(&self) -> Result<(), ManagerBuildError> {
        if self.store_path.is_none() {
            return Err(ManagerBuildError::FieldValidationFailed(
                "store path is not set".to_string(),
            ));
        }
        if self.default_max_concurrent == 0 {
            return Err(ManagerBuildError::FieldValidationFailed(
                "default max concurrent downloads must be at least 1".to_string(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(ManagerBuildError::FieldValidationFailed(
                "event capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Load the persisted state and start the scheduler.
    /// Must be called within a tokio runtime.
    pub async fn build(mut self) -> Result<DownloadManager, ManagerBuildError> {
        self.validate()?;
        let adapter = self.adapter.take().or_else(default_adapter).ok_or_else(|| {
            ManagerBuildError::FieldValidationFailed("adapter is not set".to_string())
        })?;
        let store_path = self.store_path.take().ok_or_else(|| {
            ManagerBuildError::FieldValidationFailed("store path is not set".to_string())
        })?;
        let settings_path = self
            .settings_path
            .take()
            .unwrap_or_else(|| store_path.with_file_name(DEFAULT_SETTINGS_FILE));

        let mut store = TaskStore::load(store_path).await;
        let recovered = store.recover_interrupted();
        let invalid = store.validate_files().await;
        if !recovered.is_empty() || !invalid.is_empty() {
            store.save().await;
        }
        let settings = SettingsStore::load(settings_path, self.default_max_concurrent).await;

        let events = EventBus::new(self.event_capacity);
        let (cmd_tx, cmd_rx) = async_channel::unbounded();
        let scheduler = Scheduler::new(
            store,
            settings,
            SchedulerConfig {
                max_retries: self.max_retries,
                progress_interval: self.progress_interval,
                terminate_grace: self.terminate_grace,
            },
            Collaborators {
                adapter,
                url_resolver: self.url_resolver.take(),
                lyric_resolver: self.lyric_resolver.take(),
                post_processor: self.post_processor.take(),
            },
            events.clone(),
            cmd_rx,
        );
        runtime::spawn(scheduler.run());
        Ok(DownloadManager::new(cmd_tx, events))
    }
}
