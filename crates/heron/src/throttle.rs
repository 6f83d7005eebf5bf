//
// throttle.rs
//
// Bounded-concurrency admission gate for I/O and subprocess jobs
//

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;

/// Caps the number of jobs of one kind that run concurrently.
///
/// Built on a fair `tokio::sync::Semaphore`: callers past the capacity
/// suspend and are admitted in arrival order. The permit is tied to a
/// guard that is dropped on every exit path, so a failing job can never
/// leak its slot.
pub struct Throttle {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl Throttle {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "throttle capacity must be at least 1");
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Run `job`, suspending first if `capacity` jobs are already active.
    ///
    /// The slot is released when `job` completes, whether it succeeds,
    /// returns an error value, or panics.
    pub async fn run<F, T>(&self, job: F) -> T
    where
        F: Future<Output = T>,
    {
        // The semaphore is never closed, so acquire only fails on a
        // programming error.
        let _permit = self
            .semaphore
            .acquire()
            .await
            .expect("throttle semaphore closed");
        job.await
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of jobs currently holding a slot.
    pub fn active(&self) -> usize {
        self.capacity - self.semaphore.available_permits()
    }
}

impl std::fmt::Debug for Throttle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Throttle")
            .field("capacity", &self.capacity)
            .field("active", &self.active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_never_exceeds_capacity() {
        let throttle = Arc::new(Throttle::new(2));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let throttle = throttle.clone();
            let active = active.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                throttle
                    .run(async {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(throttle.active(), 0);
    }

    #[tokio::test]
    async fn test_fifo_admission_order() {
        let throttle = Arc::new(Throttle::new(1));
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        // Occupy the single slot so every job below has to queue.
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let blocker = {
            let throttle = throttle.clone();
            tokio::spawn(async move {
                throttle
                    .run(async {
                        let _ = release_rx.await;
                    })
                    .await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut handles = Vec::new();
        for i in 0..4 {
            let throttle = throttle.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                throttle
                    .run(async {
                        order.lock().unwrap().push(i);
                    })
                    .await;
            }));
            // Give each submission time to reach the wait queue before the next.
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        release_tx.send(()).unwrap();
        blocker.await.unwrap();
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_slot_released_on_failure() {
        let throttle = Throttle::new(1);

        let result: Result<(), &str> = throttle.run(async { Err("job failed") }).await;
        assert!(result.is_err());

        // The slot must be free again despite the failure.
        assert_eq!(throttle.active(), 0);
        let ok: Result<(), &str> = throttle.run(async { Ok(()) }).await;
        assert!(ok.is_ok());
    }

    #[tokio::test]
    async fn test_all_jobs_eventually_complete() {
        let throttle = Arc::new(Throttle::new(3));
        let done = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let throttle = throttle.clone();
            let done = done.clone();
            handles.push(tokio::spawn(async move {
                throttle
                    .run(async {
                        tokio::time::sleep(Duration::from_millis(1)).await;
                        done.fetch_add(1, Ordering::SeqCst);
                    })
                    .await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(done.load(Ordering::SeqCst), 20);
    }
}
