//! Cooperative priority scheduler for core server work.
//!
//! Exactly one scheduled task holds the *turn* at a time; a task gives the
//! turn up only at declared suspension points (`yield_now`, `suspend`, task
//! completion). When several tasks are ready to resume, interactive-class
//! tasks are granted the turn before background-class tasks regardless of
//! arrival order, and arrival order is preserved within a class. Background
//! tasks are resumed whenever no interactive task is waiting, so a yielding
//! workspace scan is delayed but never starved.
//!
//! Contract: `yield_now` and `suspend` are only meaningful inside a future
//! driven by `run` or `spawn`; called elsewhere they degrade to no-ops.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Priority class attached to a suspension point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// User-facing request work: runs before any waiting background task.
    Interactive,
    /// Batch work (scans, indexing): runs when no interactive task is ready.
    Background,
}

struct TurnState {
    turn_held: bool,
    interactive: VecDeque<Arc<Notify>>,
    background: VecDeque<Arc<Notify>>,
}

impl TurnState {
    fn pop_next(&mut self) -> Option<Arc<Notify>> {
        self.interactive
            .pop_front()
            .or_else(|| self.background.pop_front())
    }
}

/// Cloning is cheap and shares the same turn: every clone schedules against
/// one queue.
#[derive(Clone)]
pub struct Scheduler {
    state: Arc<Mutex<TurnState>>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(TurnState {
                turn_held: false,
                interactive: VecDeque::new(),
                background: VecDeque::new(),
            })),
        }
    }

    /// Start an independently scheduled task and return immediately.
    ///
    /// The task acquires the turn at `priority` before its first poll and
    /// releases it when it completes (or panics).
    pub fn spawn<F, T>(&self, priority: Priority, fut: F) -> TaskHandle<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let scheduler = self.clone();
        let handle = tokio::spawn(async move { scheduler.run(priority, fut).await });
        TaskHandle { handle }
    }

    /// Run `fut` as a scheduled task on the caller's own stack.
    ///
    /// Acquires the turn at `priority`, drives `fut`, and releases the turn
    /// on every exit path. Must not be nested inside another `run`.
    pub async fn run<F>(&self, priority: Priority, fut: F) -> F::Output
    where
        F: Future,
    {
        self.acquire_turn(priority).await;
        let _turn = TurnGuard { scheduler: self };
        fut.await
    }

    /// Voluntary suspension point.
    ///
    /// If any other task is waiting for the turn, hand it over and re-queue
    /// the caller at `priority`; otherwise keep the turn and return at once.
    pub async fn yield_now(&self, priority: Priority) {
        let notify = {
            let mut state = self.state.lock().unwrap();
            if !state.turn_held {
                return;
            }
            match priority {
                // Nothing queued outranks or precedes an interactive caller.
                Priority::Interactive if state.interactive.is_empty() => return,
                Priority::Background
                    if state.interactive.is_empty() && state.background.is_empty() =>
                {
                    return
                }
                _ => {}
            }
            let notify = Arc::new(Notify::new());
            match priority {
                Priority::Interactive => state.interactive.push_back(notify.clone()),
                Priority::Background => state.background.push_back(notify.clone()),
            }
            // Hand the turn to the front waiter; it cannot be ourselves since
            // a waiter already preceded us in some queue.
            if let Some(next) = state.pop_next() {
                next.notify_one();
            }
            notify
        };
        notify.notified().await;
    }

    /// Release the turn for the duration of an I/O future.
    ///
    /// Other tasks run while `fut` is in flight; the caller re-queues at
    /// `priority` once it completes.
    pub async fn suspend<F>(&self, priority: Priority, fut: F) -> F::Output
    where
        F: Future,
    {
        let held = {
            let state = self.state.lock().unwrap();
            state.turn_held
        };
        if held {
            self.release_turn();
        }
        let out = fut.await;
        if held {
            self.acquire_turn(priority).await;
        }
        out
    }

    async fn acquire_turn(&self, priority: Priority) {
        let notify = {
            let mut state = self.state.lock().unwrap();
            if !state.turn_held {
                state.turn_held = true;
                None
            } else {
                let notify = Arc::new(Notify::new());
                match priority {
                    Priority::Interactive => state.interactive.push_back(notify.clone()),
                    Priority::Background => state.background.push_back(notify.clone()),
                }
                Some(notify)
            }
        };
        if let Some(notify) = notify {
            // The turn is transferred to us by the releaser; `turn_held`
            // stays set across the hand-off.
            notify.notified().await;
        }
    }

    fn release_turn(&self) {
        let mut state = self.state.lock().unwrap();
        if let Some(next) = state.pop_next() {
            next.notify_one();
        } else {
            state.turn_held = false;
        }
    }
}

struct TurnGuard<'a> {
    scheduler: &'a Scheduler,
}

impl Drop for TurnGuard<'_> {
    fn drop(&mut self) {
        self.scheduler.release_turn();
    }
}

/// Handle to a task started with [`Scheduler::spawn`].
pub struct TaskHandle<T> {
    handle: JoinHandle<Result<T>>,
}

impl<T> TaskHandle<T> {
    /// Wait for the task to finish, propagating its failure to the caller.
    ///
    /// A task running on the scheduler must wrap this in
    /// [`Scheduler::suspend`] so the awaited task can take the turn.
    pub async fn join(self) -> Result<T> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) => Err(anyhow!("scheduled task panicked: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    type Log = Arc<std::sync::Mutex<Vec<String>>>;

    fn push(log: &Log, entry: &str) {
        log.lock().unwrap().push(entry.to_string());
    }

    #[tokio::test]
    async fn test_one_task_at_a_time() {
        let sched = Arc::new(Scheduler::new());
        let active = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let peak = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let active = active.clone();
            let peak = peak.clone();
            handles.push(sched.spawn(Priority::Background, async move {
                use std::sync::atomic::Ordering;
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }));
        }
        for h in handles {
            h.join().await.unwrap();
        }
        assert_eq!(peak.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_interactive_overtakes_background_at_yield() {
        let sched = Arc::new(Scheduler::new());
        let log: Log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let (started_tx, started_rx) = tokio::sync::oneshot::channel::<()>();
        let (resume_tx, resume_rx) = tokio::sync::oneshot::channel::<()>();

        let bg = {
            let sched = sched.clone();
            let log = log.clone();
            let inner = sched.clone();
            sched.spawn(Priority::Background, async move {
                started_tx.send(()).ok();
                // Hold the turn until the test has queued an interactive task.
                resume_rx.await.ok();
                for i in 0..3 {
                    push(&log, &format!("b{i}"));
                    inner.yield_now(Priority::Background).await;
                }
                Ok(())
            })
        };

        started_rx.await.unwrap();
        let it = {
            let log = log.clone();
            sched.spawn(Priority::Interactive, async move {
                push(&log, "i");
                Ok(())
            })
        };
        // Let the interactive task reach the wait queue.
        tokio::time::sleep(Duration::from_millis(30)).await;
        resume_tx.send(()).unwrap();

        bg.join().await.unwrap();
        it.join().await.unwrap();

        // The interactive task ran at the first yield point, then the
        // background task resumed and finished (no starvation).
        assert_eq!(*log.lock().unwrap(), vec!["b0", "i", "b1", "b2"]);
    }

    #[tokio::test]
    async fn test_fifo_within_class() {
        let sched = Arc::new(Scheduler::new());
        let log: Log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let (started_tx, started_rx) = tokio::sync::oneshot::channel::<()>();
        let (resume_tx, resume_rx) = tokio::sync::oneshot::channel::<()>();

        let blocker = {
            let sched = sched.clone();
            sched.spawn(Priority::Background, async move {
                started_tx.send(()).ok();
                resume_rx.await.ok();
                Ok(())
            })
        };
        started_rx.await.unwrap();

        let mut handles = Vec::new();
        for i in 0..3 {
            let log = log.clone();
            handles.push(sched.spawn(Priority::Background, async move {
                push(&log, &format!("t{i}"));
                Ok(())
            }));
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        resume_tx.send(()).unwrap();
        blocker.join().await.unwrap();
        for h in handles {
            h.join().await.unwrap();
        }

        assert_eq!(*log.lock().unwrap(), vec!["t0", "t1", "t2"]);
    }

    #[tokio::test]
    async fn test_join_propagates_failure() {
        let sched = Arc::new(Scheduler::new());
        let task = sched.spawn(Priority::Interactive, async move {
            Err::<(), _>(anyhow!("boom"))
        });
        let err = task.join().await.unwrap_err();
        assert!(err.to_string().contains("boom"));

        // The turn was released despite the failure.
        let ok = sched.spawn(Priority::Interactive, async move { Ok(1) });
        assert_eq!(ok.join().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_suspend_releases_turn_during_io() {
        let sched = Arc::new(Scheduler::new());
        let log: Log = Arc::new(std::sync::Mutex::new(Vec::new()));

        let slow = {
            let sched2 = sched.clone();
            let log = log.clone();
            sched.spawn(Priority::Background, async move {
                push(&log, "slow-start");
                sched2
                    .suspend(Priority::Background, async {
                        tokio::time::sleep(Duration::from_millis(60)).await;
                    })
                    .await;
                push(&log, "slow-end");
                Ok(())
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let fast = {
            let log = log.clone();
            sched.spawn(Priority::Interactive, async move {
                push(&log, "fast");
                Ok(())
            })
        };

        slow.join().await.unwrap();
        fast.join().await.unwrap();

        // The interactive task ran while the background task's I/O was in
        // flight.
        assert_eq!(*log.lock().unwrap(), vec!["slow-start", "fast", "slow-end"]);
    }

    #[tokio::test]
    async fn test_yield_now_outside_scheduler_is_noop() {
        let sched = Scheduler::new();
        // Must return immediately rather than corrupting turn state.
        sched.yield_now(Priority::Background).await;
        sched.run(Priority::Interactive, async {}).await;
    }
}
