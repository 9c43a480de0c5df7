use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

// ── FIFO counting semaphore ──────────────────────────────────────────────

struct SemState {
    in_use: usize,
    waiters: VecDeque<oneshot::Sender<()>>,
}

/// Counting semaphore with a strict FIFO waiter queue.
///
/// `release` hands the slot directly to the head waiter without decrementing,
/// so under contention the in-use count never dips below the demand. Waiter
/// futures must be polled to completion once enqueued; the orchestrator holds
/// them until granted.
pub struct FifoSemaphore {
    max: usize,
    state: Mutex<SemState>,
}

/// Slot holder; releases on drop.
pub struct SemaphorePermit<'a> {
    sem: &'a FifoSemaphore,
}

impl Drop for SemaphorePermit<'_> {
    fn drop(&mut self) {
        self.sem.release();
    }
}

impl FifoSemaphore {
    pub fn new(max: usize) -> Self {
        Self {
            max: max.max(1),
            state: Mutex::new(SemState { in_use: 0, waiters: VecDeque::new() }),
        }
    }

    pub async fn acquire(&self) -> SemaphorePermit<'_> {
        let rx = {
            let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if st.in_use < self.max {
                st.in_use += 1;
                None
            } else {
                let (tx, rx) = oneshot::channel();
                st.waiters.push_back(tx);
                Some(rx)
            }
        };
        if let Some(rx) = rx {
            // Sender side only drops if the semaphore itself is torn down.
            let _ = rx.await;
        }
        SemaphorePermit { sem: self }
    }

    fn release(&self) {
        let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        while let Some(tx) = st.waiters.pop_front() {
            // Pass the slot to the head waiter without decrementing.
            if tx.send(()).is_ok() {
                return;
            }
            // Waiter gave up before the grant; try the next one.
        }
        st.in_use = st.in_use.saturating_sub(1);
    }

    pub fn available(&self) -> usize {
        let st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        self.max - st.in_use
    }

    pub fn waiting(&self) -> usize {
        let st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        st.waiters.len()
    }

    pub fn acquired(&self) -> usize {
        let st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        st.in_use
    }

    pub fn max(&self) -> usize {
        self.max
    }
}

// ── Per-repository lock ──────────────────────────────────────────────────

/// Strict FIFO mutual exclusion keyed by normalised repository path.
///
/// Everything that mutates shared repo state (branch create, fetch, push)
/// runs under this lock; independent repos proceed in parallel.
pub struct RepoLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

/// Trailing separators stripped so `/a/b/` and `/a/b` share one lock.
pub fn normalize_repo_path(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

impl RepoLocks {
    pub fn new() -> Self {
        Self { locks: Mutex::new(HashMap::new()) }
    }

    fn mutex_for(&self, path: &str) -> Arc<tokio::sync::Mutex<()>> {
        let key = normalize_repo_path(path);
        let mut map = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(map.entry(key).or_default())
    }

    /// Run `f` holding the repo lock; released on every exit path, including
    /// unwind (guard drop).
    pub async fn with_repo_lock<T, F, Fut>(&self, path: &str, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let mutex = self.mutex_for(path);
        let _guard = mutex.lock().await;
        f().await
    }

    /// Whether the lock for `path` is currently held.
    pub fn is_locked(&self, path: &str) -> bool {
        self.mutex_for(path).try_lock().is_err()
    }
}

impl Default for RepoLocks {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn path_normalisation() {
        assert_eq!(normalize_repo_path("/a/b/"), "/a/b");
        assert_eq!(normalize_repo_path("/a/b"), "/a/b");
        assert_eq!(normalize_repo_path("///"), "/");
    }

    #[tokio::test]
    async fn semaphore_never_exceeds_max() {
        let sem = Arc::new(FifoSemaphore::new(3));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let sem = Arc::clone(&sem);
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                let _permit = sem.acquire().await;
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.expect("task panicked");
        }
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(sem.acquired(), 0);
        assert_eq!(sem.available(), 3);
        assert_eq!(sem.waiting(), 0);
    }

    #[tokio::test]
    async fn semaphore_grants_in_fifo_order() {
        let sem = Arc::new(FifoSemaphore::new(1));
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = sem.acquire().await;
        let mut handles = Vec::new();
        for i in 0..5 {
            let sem = Arc::clone(&sem);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let _p = sem.acquire().await;
                order.lock().unwrap_or_else(|e| e.into_inner()).push(i);
            }));
            // Let each waiter enqueue before spawning the next.
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(sem.waiting(), 5);
        drop(first);
        for h in handles {
            h.await.expect("task panicked");
        }
        let order = order.lock().unwrap_or_else(|e| e.into_inner()).clone();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn repo_lock_serialises_same_path() {
        let locks = Arc::new(RepoLocks::new());
        let seq = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..100u32 {
            let locks = Arc::clone(&locks);
            let seq = Arc::clone(&seq);
            handles.push(tokio::spawn(async move {
                locks
                    .with_repo_lock("/repos/acme/app/", || async {
                        seq.lock().unwrap_or_else(|e| e.into_inner()).push((i, "enter"));
                        tokio::task::yield_now().await;
                        seq.lock().unwrap_or_else(|e| e.into_inner()).push((i, "exit"));
                    })
                    .await;
            }));
            // Queue in submission order so FIFO fairness is observable.
            tokio::task::yield_now().await;
        }
        for h in handles {
            h.await.expect("task panicked");
        }
        let seq = seq.lock().unwrap_or_else(|e| e.into_inner()).clone();
        assert_eq!(seq.len(), 200);
        // Enter/exit pairs never interleave across tasks.
        for pair in seq.chunks(2) {
            assert_eq!(pair[0].0, pair[1].0);
            assert_eq!(pair[0].1, "enter");
            assert_eq!(pair[1].1, "exit");
        }
    }

    #[tokio::test]
    async fn different_repos_run_in_parallel() {
        let locks = Arc::new(RepoLocks::new());
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for path in ["/repos/a", "/repos/b"] {
            let locks = Arc::clone(&locks);
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                locks
                    .with_repo_lock(path, || async {
                        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await;
            }));
        }
        for h in handles {
            h.await.expect("task panicked");
        }
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }
}
