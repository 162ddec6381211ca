//! FIFO of tasks waiting for a worker slot.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use crate::task::{DownloadTask, TaskId};

/// What the queue report shows about a waiting task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedEntry {
    pub id: TaskId,
    pub file_name: String,
    pub expected_size: u64,
}

/// Ordered queue of pending tasks. Append at the tail, pop from the head.
#[derive(Debug, Default)]
pub struct TaskQueue {
    tasks: Mutex<VecDeque<DownloadTask>>,
    pushed: Notify,
}

impl TaskQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<DownloadTask>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends a task and returns its 1-based position.
    pub fn push(&self, task: DownloadTask) -> usize {
        let position = {
            let mut tasks = self.lock();
            tasks.push_back(task);
            tasks.len()
        };
        self.pushed.notify_one();
        position
    }

    /// Removes the head task if there is one.
    pub fn try_pop(&self) -> Option<DownloadTask> {
        self.lock().pop_front()
    }

    /// Waits until a task is available and removes it.
    pub async fn pop(&self) -> DownloadTask {
        loop {
            let pushed = self.pushed.notified();
            if let Some(task) = self.try_pop() {
                return task;
            }
            pushed.await;
        }
    }

    /// Removes a task that has not started yet.
    pub fn remove(&self, id: TaskId) -> Option<DownloadTask> {
        let mut tasks = self.lock();
        let index = tasks.iter().position(|t| t.id == id)?;
        tasks.remove(index)
    }

    /// Removes every waiting task.
    pub fn drain(&self) -> Vec<DownloadTask> {
        self.lock().drain(..).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Lists waiting tasks in queue order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<QueuedEntry> {
        self.lock()
            .iter()
            .map(|t| QueuedEntry {
                id: t.id,
                file_name: t.file_name().to_string(),
                expected_size: t.expected_size,
            })
            .collect()
    }
}
