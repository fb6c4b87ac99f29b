use std::future::Future;
use std::pin::Pin;
use std::sync::Weak;
use std::task::{Context, Poll};
use std::thread;
use std::time::{Duration, Instant};

use tokio::sync::oneshot::{self, error::TryRecvError};

use super::Shared;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub(crate) u64);

/// How often a timer task runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repeat {
    /// Total number of executions; must be at least 1.
    Times(u32),
    Forever,
}

impl Repeat {
    pub fn once() -> Self {
        Repeat::Times(1)
    }

    /// The repeat budget left after one more execution, or `None` when done.
    pub(crate) fn after_run(self) -> Option<Repeat> {
        match self {
            Repeat::Times(n) if n > 1 => Some(Repeat::Times(n - 1)),
            Repeat::Times(_) => None,
            Repeat::Forever => Some(Repeat::Forever),
        }
    }
}

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;
pub(crate) type RecurringJob = Box<dyn FnMut() + Send + 'static>;

pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}

/// Completion of a task submitted to the scheduler.
///
/// Resolves exactly once: with the task's value, with `TaskFailed` if the task
/// panicked, or with `Cancelled` if it was dropped before running.
pub struct TaskHandle<R> {
    id: TaskId,
    rx: oneshot::Receiver<Result<R>>,
}

impl<R> TaskHandle<R> {
    pub(crate) fn new(id: TaskId, rx: oneshot::Receiver<Result<R>>) -> Self {
        Self { id, rx }
    }

    /// A handle that is already resolved.
    pub(crate) fn ready(id: TaskId, value: Result<R>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(value);
        Self { id, rx }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Blocks the current thread until the task completes. Must not be called
    /// from inside an async context.
    pub fn wait(self) -> Result<R> {
        self.rx.blocking_recv().unwrap_or(Err(Error::Cancelled))
    }

    pub fn wait_timeout(&mut self, timeout: Duration) -> Result<R> {
        let deadline = Instant::now().checked_add(timeout);
        loop {
            match self.rx.try_recv() {
                Ok(result) => return result,
                Err(TryRecvError::Closed) => return Err(Error::Cancelled),
                Err(TryRecvError::Empty) if deadline.is_some_and(|at| Instant::now() >= at) => {
                    return Err(Error::Timeout(format!("task {:?}", self.id)));
                }
                Err(TryRecvError::Empty) => thread::sleep(Duration::from_millis(1)),
            }
        }
    }

    /// Non-blocking check; `None` while the task is still pending.
    pub fn try_result(&mut self) -> Option<Result<R>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Closed) => Some(Err(Error::Cancelled)),
            Err(TryRecvError::Empty) => None,
        }
    }
}

impl<R> Future for TaskHandle<R> {
    type Output = Result<R>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(Error::Cancelled)))
    }
}

/// Handle to a timer task. Its completion resolves after the final execution.
pub struct TimerHandle {
    completion: TaskHandle<()>,
    shared: Weak<Shared>,
}

impl TimerHandle {
    pub(crate) fn new(completion: TaskHandle<()>, shared: Weak<Shared>) -> Self {
        Self { completion, shared }
    }

    pub fn id(&self) -> TaskId {
        self.completion.id()
    }

    /// Stops future executions. Returns false if the timer already finished.
    pub fn cancel(&self) -> bool {
        match self.shared.upgrade() {
            Some(shared) => shared.cancel(self.id()),
            None => false,
        }
    }

    pub fn completion(self) -> TaskHandle<()> {
        self.completion
    }
}
