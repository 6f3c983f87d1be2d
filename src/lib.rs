//! A persistent download queue.
//!
//! [`DownloadManager`] accepts download requests, runs at most
//! `maxConcurrentDownloads` of them at a time, resumes partial files with
//! range requests, retries failures and keeps every task in a JSON document
//! so the queue survives a restart.

pub mod adapter;
mod builder;
mod client;
pub mod error;
pub mod event;
pub mod manager;
pub mod resolver;
pub mod runner;
mod runtime;
pub mod task;

pub use builder::*;
pub use client::*;
pub use error::{BoxError, ManagerError};
pub use event::{EventReceiver, ManagerEvent};
pub use runtime::ExitStatus;
pub use task::{ClearKind, DownloadTask, NewTask, ProgressInfo, TagWriteOptions, TaskStatus};
