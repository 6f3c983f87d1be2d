//! Lifecycle events and their fan-out.

use async_broadcast::{InactiveReceiver, Receiver, Sender, TrySendError};
use serde::Serialize;

use crate::task::{DownloadTask, ProgressInfo};

pub type EventReceiver = Receiver<ManagerEvent>;

pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Fire-and-forget notifications, serialized with a kebab-case `type` tag
/// (`task-added`, `task-progress`, ...).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ManagerEvent {
    TaskAdded {
        task: DownloadTask,
    },
    TaskProgress {
        id: String,
        #[serde(flatten)]
        progress: ProgressInfo,
    },
    TaskStatusChanged {
        task: DownloadTask,
    },
    TaskCompleted {
        task: DownloadTask,
    },
    TaskError {
        id: String,
        error: String,
    },
    TaskDeleted {
        id: String,
    },
    /// an automatic retry was scheduled
    TaskRetrying {
        id: String,
        retries: u32,
        error: String,
    },
    /// the task list changed wholesale, listeners should replace their copy
    TasksReset {
        tasks: Vec<DownloadTask>,
    },
}

impl ManagerEvent {
    /// the task the event is about, if it is about a single one
    pub fn task_id(&self) -> Option<&str> {
        match self {
            ManagerEvent::TaskAdded { task }
            | ManagerEvent::TaskStatusChanged { task }
            | ManagerEvent::TaskCompleted { task } => Some(&task.id),
            ManagerEvent::TaskProgress { id, .. }
            | ManagerEvent::TaskError { id, .. }
            | ManagerEvent::TaskDeleted { id }
            | ManagerEvent::TaskRetrying { id, .. } => Some(id),
            ManagerEvent::TasksReset { .. } => None,
        }
    }
}

/// Broadcast of [`ManagerEvent`]s to any number of subscribers.
/// A slow subscriber loses its oldest events, it never blocks the manager.
#[derive(Clone)]
pub struct EventBus {
    sender: Sender<ManagerEvent>,
    /// keeps the channel open while nobody listens
    keepalive: InactiveReceiver<ManagerEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (mut sender, receiver) = async_broadcast::broadcast(capacity.max(1));
        sender.set_overflow(true);
        Self {
            sender,
            keepalive: receiver.deactivate(),
        }
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.keepalive.activate_cloned()
    }

    pub fn emit(&self, event: ManagerEvent) {
        match self.sender.try_broadcast(event) {
            Ok(None) => {}
            Ok(Some(dropped)) => {
                log::trace!("event buffer is full, dropped {:?}", dropped.task_id());
            }
            // no active subscriber
            Err(TrySendError::Inactive(_)) => {}
            Err(e) => log::warn!("failed to emit event: {:?}", e),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
