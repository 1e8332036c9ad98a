//! Priority call gate: the single serialization point in front of the
//! generation service.
//!
//! Every background task and every interactive request that needs the
//! generation service goes through [`CallGate::enqueue`]. At most one action
//! executes at any instant; pending actions are ordered by priority, then by
//! arrival. A failing, panicking or stuck action never blocks the queue.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;

use anyhow::{anyhow, Result};
use futures_util::future::{BoxFuture, FutureExt};
use serde::Serialize;
use tokio::sync::{oneshot, Notify};

use crate::error::CallError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallPriority {
    Low,
    High,
}

type Job = Box<dyn FnOnce(Duration) -> BoxFuture<'static, ()> + Send>;

struct QueuedTask {
    priority: CallPriority,
    requester_key: String,
    job: Job,
}

#[derive(Default)]
struct GateState {
    /// Kept sorted: priority descending, arrival order within a priority.
    queue: Vec<QueuedTask>,
    running: Option<String>,
}

struct GateInner {
    state: Mutex<GateState>,
    idle: Notify,
    deadline: Mutex<Duration>,
}

/// Cheap to clone; all clones share one queue.
#[derive(Clone)]
pub struct CallGate {
    inner: Arc<GateInner>,
}

/// Resolves with the action's result once the gate has run it.
pub struct GateTicket<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> Future for GateTicket<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|received| {
            received.unwrap_or_else(|_| Err(anyhow!("gate task was dropped before completing")))
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GateSnapshot {
    pub busy: bool,
    pub running: Option<String>,
    pub pending: Vec<String>,
}

impl CallGate {
    pub fn new(deadline: Duration) -> Self {
        Self {
            inner: Arc::new(GateInner {
                state: Mutex::new(GateState::default()),
                idle: Notify::new(),
                deadline: Mutex::new(deadline),
            }),
        }
    }

    pub fn set_deadline(&self, deadline: Duration) {
        *lock(&self.inner.deadline) = deadline;
    }

    /// Queue `action` and return a ticket for its result.
    ///
    /// Registration happens before this returns, so `is_queued` sees the task
    /// immediately. Errors are handed back untouched; the gate never retries.
    /// Must be called from within a tokio runtime.
    pub fn enqueue<T, F, Fut>(
        &self,
        priority: CallPriority,
        requester_key: impl Into<String>,
        action: F,
    ) -> GateTicket<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let requester_key = requester_key.into();
        let (tx, rx) = oneshot::channel();
        let label = requester_key.clone();

        let job: Job = Box::new(move |deadline: Duration| {
            async move {
                let guarded = async move { tokio::time::timeout(deadline, action()).await };
                let outcome = AssertUnwindSafe(guarded).catch_unwind().await;
                let result = match outcome {
                    Ok(Ok(result)) => result,
                    Ok(Err(_elapsed)) => Err(CallError::Transient(format!(
                        "task '{}' exceeded its {}s deadline",
                        label,
                        deadline.as_secs()
                    ))
                    .into()),
                    Err(_panic) => Err(anyhow!("task '{}' panicked", label)),
                };
                if let Err(ref e) = result {
                    tracing::debug!("Gate task '{}' failed: {:#}", label, e);
                }
                // Caller may have stopped listening; the work still counted.
                let _ = tx.send(result);
            }
            .boxed()
        });

        {
            let mut state = lock(&self.inner.state);
            let position = state
                .queue
                .iter()
                .position(|queued| queued.priority < priority)
                .unwrap_or(state.queue.len());
            state.queue.insert(
                position,
                QueuedTask {
                    priority,
                    requester_key,
                    job,
                },
            );
        }

        self.pump();
        GateTicket { rx }
    }

    /// True while a task for `requester_key` is waiting or executing.
    pub fn is_queued(&self, requester_key: &str) -> bool {
        let state = lock(&self.inner.state);
        state.running.as_deref() == Some(requester_key)
            || state
                .queue
                .iter()
                .any(|queued| queued.requester_key == requester_key)
    }

    pub fn is_busy(&self) -> bool {
        lock(&self.inner.state).running.is_some()
    }

    pub fn pending_len(&self) -> usize {
        lock(&self.inner.state).queue.len()
    }

    pub fn snapshot(&self) -> GateSnapshot {
        let state = lock(&self.inner.state);
        GateSnapshot {
            busy: state.running.is_some(),
            running: state.running.clone(),
            pending: state
                .queue
                .iter()
                .map(|queued| queued.requester_key.clone())
                .collect(),
        }
    }

    /// Resolves once nothing is queued or running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            {
                let state = lock(&self.inner.state);
                if state.running.is_none() && state.queue.is_empty() {
                    return;
                }
            }
            notified.await;
        }
    }

    /// Start draining if nothing is executing. A no-op while busy: the
    /// running drain loop will pick the new task up.
    fn pump(&self) {
        let Some(first) = self.take_next(false) else {
            return;
        };

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut next = Some(first);
            while let Some(job) = next.take() {
                let deadline = *lock(&inner.deadline);
                job(deadline).await;
                next = CallGate { inner: inner.clone() }.take_next(true);
            }
        });
    }

    /// Pop the highest priority task and mark the gate busy. `draining` is set
    /// by the loop that already owns the busy flag.
    fn take_next(&self, draining: bool) -> Option<Job> {
        let mut state = lock(&self.inner.state);
        if !draining && state.running.is_some() {
            return None;
        }
        if state.queue.is_empty() {
            state.running = None;
            drop(state);
            self.inner.idle.notify_waiters();
            return None;
        }
        let task = state.queue.remove(0);
        state.running = Some(task.requester_key);
        Some(task.job)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // No user code runs while these locks are held, so poisoning carries no
    // broken invariant worth refusing to continue over.
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn gate() -> CallGate {
        CallGate::new(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn runs_at_most_one_action_at_a_time() {
        let gate = gate();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut tickets = Vec::new();
        for i in 0..12 {
            let in_flight = in_flight.clone();
            let max_seen = max_seen.clone();
            let priority = if i % 3 == 0 {
                CallPriority::High
            } else {
                CallPriority::Low
            };
            tickets.push(gate.enqueue(priority, format!("task-{i}"), move || async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(i)
            }));
        }

        for (i, ticket) in tickets.into_iter().enumerate() {
            assert_eq!(ticket.await.unwrap(), i);
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert!(!gate.is_busy());
    }

    #[tokio::test]
    async fn high_priority_jumps_ahead_of_waiting_low_priority() {
        let gate = gate();
        let order = Arc::new(Mutex::new(Vec::new()));
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let blocker = gate.enqueue(CallPriority::Low, "current", move || async move {
            let _ = release_rx.await;
            Ok(())
        });

        let mut tickets = Vec::new();
        for (name, priority) in [
            ("A", CallPriority::Low),
            ("B", CallPriority::High),
            ("C", CallPriority::Low),
        ] {
            let order = order.clone();
            tickets.push(gate.enqueue(priority, name, move || async move {
                order.lock().unwrap().push(name);
                Ok(())
            }));
        }

        assert_eq!(gate.snapshot().pending, vec!["B", "A", "C"]);
        release_tx.send(()).unwrap();
        blocker.await.unwrap();
        for ticket in tickets {
            ticket.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec!["B", "A", "C"]);
    }

    #[tokio::test]
    async fn failing_task_does_not_block_the_queue() {
        let gate = gate();
        let failing = gate.enqueue(CallPriority::Low, "bad", || async {
            Err::<(), _>(anyhow!("service unavailable"))
        });
        let healthy = gate.enqueue(CallPriority::Low, "good", || async { Ok("done") });

        assert!(failing.await.is_err());
        assert_eq!(healthy.await.unwrap(), "done");
    }

    #[tokio::test]
    async fn panicking_task_is_reported_and_queue_continues() {
        let gate = gate();
        let panicking = gate.enqueue(CallPriority::High, "boom", || async {
            if true {
                panic!("action blew up");
            }
            Ok(())
        });
        let after = gate.enqueue(CallPriority::Low, "after", || async { Ok(7) });

        let err = panicking.await.unwrap_err();
        assert!(err.to_string().contains("panicked"));
        assert_eq!(after.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn stuck_task_times_out_as_transient() {
        let gate = CallGate::new(Duration::from_millis(50));
        let stuck = gate.enqueue(CallPriority::Low, "stuck", || async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        });
        let next = gate.enqueue(CallPriority::Low, "next", || async { Ok(1) });

        let err = stuck.await.unwrap_err();
        assert!(crate::error::call_error(&err).is_some_and(CallError::is_transient));
        assert_eq!(next.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn is_queued_covers_pending_and_running_tasks() {
        let gate = gate();
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let running = gate.enqueue(CallPriority::Low, "agent:a", move || async move {
            let _ = release_rx.await;
            Ok(())
        });
        let waiting = gate.enqueue(CallPriority::Low, "agent:b", || async { Ok(()) });

        assert!(gate.is_queued("agent:a"));
        assert!(gate.is_queued("agent:b"));
        assert!(!gate.is_queued("agent:c"));

        release_tx.send(()).unwrap();
        running.await.unwrap();
        waiting.await.unwrap();
        gate.wait_idle().await;
        assert!(!gate.is_queued("agent:a"));
        assert!(!gate.is_queued("agent:b"));
        assert_eq!(gate.pending_len(), 0);
    }

    #[tokio::test]
    async fn dropped_ticket_still_runs_the_action() {
        let gate = gate();
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        drop(gate.enqueue(CallPriority::Low, "fire-and-forget", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        gate.wait_idle().await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
