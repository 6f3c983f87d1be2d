//! Spawning and supervision of execution units.
//! The scheduler never awaits a unit directly, it keeps an abort handle as a
//! backstop and learns about the exit through the unit's channel.

use std::future::Future;

/// How an execution unit ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitStatus {
    /// the unit returned normally
    Success,
    /// the unit was forcibly terminated by the scheduler
    Aborted,
    /// the unit panicked, carrying the panic message if any
    Panicked(String),
}

impl From<tokio::task::JoinError> for ExitStatus {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            return ExitStatus::Aborted;
        }
        let payload = err.into_panic();
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        ExitStatus::Panicked(message)
    }
}

pub struct JoinHandle<T: Send + 'static>(tokio::task::JoinHandle<T>);

impl<T: Send + 'static> JoinHandle<T> {
    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle(self.0.abort_handle())
    }

    pub async fn join(self) -> Result<T, ExitStatus> {
        self.0.await.map_err(ExitStatus::from)
    }
}

/// A cloneable handle to forcibly terminate a spawned unit
#[derive(Debug, Clone)]
pub struct AbortHandle(tokio::task::AbortHandle);

impl AbortHandle {
    pub fn abort(&self) {
        self.0.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.0.is_finished()
    }
}

pub fn spawn<F>(future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    JoinHandle(tokio::spawn(future))
}

/// Spawn `future` and a supervisor that calls `on_exit` once it ends, however it ends.
pub fn spawn_supervised<F, E, EF>(future: F, on_exit: E) -> AbortHandle
where
    F: Future<Output = ()> + Send + 'static,
    E: FnOnce(ExitStatus) -> EF + Send + 'static,
    EF: Future<Output = ()> + Send + 'static,
{
    let handle = spawn(future);
    let abort = handle.abort_handle();
    spawn(async move {
        let status = match handle.join().await {
            Ok(()) => ExitStatus::Success,
            Err(status) => status,
        };
        on_exit(status).await;
    });
    abort
}
