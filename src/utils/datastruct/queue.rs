use std::collections::VecDeque;
use std::sync::Mutex;

/// Mutex guarded FIFO shared between producers and worker threads.
///
/// Workers never block on it: they `try_pop` and sleep for a short idle
/// interval when nothing is queued.
#[derive(Debug)]
pub struct ThreadSafeQueue<T> {
    inner: Mutex<VecDeque<T>>,
}

impl<T> Default for ThreadSafeQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ThreadSafeQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
        }
    }

    #[inline]
    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<T>> {
        // poisoned な queue でも中身は一貫しているので使い続ける
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn push(&self, value: T) {
        self.lock().push_back(value);
    }

    pub fn try_pop(&self) -> Option<T> {
        self.lock().pop_front()
    }

    pub fn size(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drop every queued element, returning how many were dropped.
    pub fn clear(&self) -> usize {
        let mut guard = self.lock();
        let n = guard.len();
        guard.clear();
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn fifo_order() {
        let q = ThreadSafeQueue::new();
        q.push(1);
        q.push(2);
        q.push(3);
        assert_eq!(q.size(), 3);
        assert_eq!(q.try_pop(), Some(1));
        assert_eq!(q.try_pop(), Some(2));
        assert_eq!(q.clear(), 1);
        assert!(q.is_empty());
        assert_eq!(q.try_pop(), None);
    }

    #[test]
    fn concurrent_producers() {
        let q = Arc::new(ThreadSafeQueue::new());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let q = Arc::clone(&q);
                thread::spawn(move || {
                    for i in 0..100 {
                        q.push(t * 100 + i);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(q.size(), 400);
    }
}
