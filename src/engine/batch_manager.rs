use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

/// Identifier of one processor task.
pub type TaskId = u64;

const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// In-flight task ids of one group of asynchronous tasks.
///
/// A task id is added before its input is queued and removed by the
/// processor when the task ends, whatever the outcome.
#[derive(Debug, Default)]
pub struct BatchManager {
    in_progress: Mutex<HashSet<TaskId>>,
    next_id: AtomicU64,
}

impl BatchManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<TaskId>> {
        self.in_progress.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Allocate a fresh task id and mark it in flight.
    pub fn next_task(&self) -> TaskId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.add(id);
        id
    }

    pub fn add(&self, task_id: TaskId) {
        self.lock().insert(task_id);
    }

    /// Completion signal of a task.
    pub fn callback(&self, task_id: TaskId) {
        self.lock().remove(&task_id);
    }

    pub fn is_everything_processed(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn in_flight(&self) -> usize {
        self.lock().len()
    }

    /// Poll until every task has signalled. `None` waits forever.
    ///
    /// # Returns
    /// * `bool` - false when the timeout elapsed first
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let start = Instant::now();
        loop {
            if self.is_everything_processed() {
                return true;
            }
            if let Some(timeout) = timeout {
                if start.elapsed() >= timeout {
                    return false;
                }
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}
