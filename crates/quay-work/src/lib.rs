//! Background task queues for quay services.
//!
//! Resolvers schedule work (webhook deliveries, outbound mail) onto named
//! queues. Tasks run concurrently on the runtime, retry transient failures
//! with exponential backoff up to a bounded attempt count, and report their
//! final outcome to an optional completion hook. At shutdown the server
//! joins every queue: enqueued work is finished, including work enqueued by
//! in-flight tasks, before the process exits.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use quay_core::Context;

/// Task failure modes.
#[derive(Debug, Clone, Error)]
pub enum WorkError {
    /// The task failed in a way that may succeed on retry (network errors,
    /// upstream 5xx).
    #[error("{0}")]
    Transient(String),

    /// The task failed in a way that cannot succeed on retry (malformed
    /// input, permanent rejection).
    #[error("{0}")]
    Permanent(String),
}

impl WorkError {
    /// A retryable failure.
    #[must_use]
    pub fn transient(err: impl std::fmt::Display) -> Self {
        WorkError::Transient(err.to_string())
    }

    /// A failure that must not be retried.
    #[must_use]
    pub fn permanent(err: impl std::fmt::Display) -> Self {
        WorkError::Permanent(err.to_string())
    }
}

/// The final outcome of a task, passed to its completion hook.
#[derive(Debug)]
pub struct TaskStatus {
    /// How many attempts ran, including the successful or final failing one.
    pub attempts: u32,
    /// The final result.
    pub result: Result<(), WorkError>,
}

type TaskFn = Arc<dyn Fn(Context) -> BoxFuture<'static, Result<(), WorkError>> + Send + Sync>;
type AfterFn = Box<dyn FnOnce(&Context, &TaskStatus) + Send>;

/// A unit of queued work.
pub struct Task {
    run: TaskFn,
    max_attempts: u32,
    after: Option<AfterFn>,
}

impl Task {
    /// Create a task from an async function. The function may run several
    /// times; each attempt receives the queue's base context.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), WorkError>> + Send + 'static,
    {
        Self {
            run: Arc::new(move |ctx| Box::pin(f(ctx))),
            max_attempts: 1,
            after: None,
        }
    }

    /// Allow up to `n` attempts, retrying transient failures with
    /// exponential backoff.
    #[must_use]
    pub fn retries(mut self, n: u32) -> Self {
        self.max_attempts = n.max(1);
        self
    }

    /// Run `f` once after the final attempt, successful or not.
    #[must_use]
    pub fn after<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&Context, &TaskStatus) + Send + 'static,
    {
        self.after = Some(Box::new(f));
        self
    }
}

/// A named work queue.
pub struct Queue {
    name: Arc<str>,
    tx: mpsc::UnboundedSender<Task>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Task>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    tracker: TaskTracker,
    token: CancellationToken,
}

impl Queue {
    /// Create a queue. It accepts tasks immediately but runs nothing until
    /// [`Queue::start`] is called.
    #[must_use]
    pub fn new(name: &str) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            name: Arc::from(name),
            tx,
            rx: Mutex::new(Some(rx)),
            dispatcher: Mutex::new(None),
            tracker: TaskTracker::new(),
            token: CancellationToken::new(),
        }
    }

    /// The queue's name, used in logs.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue a task.
    pub fn enqueue(&self, task: Task) {
        if self.tx.send(task).is_err() {
            tracing::error!(target: "work", queue = %self.name, "enqueue on terminated queue");
        }
    }

    /// Start dispatching tasks. Every task runs against a clone of `ctx`.
    ///
    /// Panics when called twice.
    pub fn start(&self, ctx: Context) {
        let mut rx = self
            .rx
            .lock()
            .unwrap()
            .take()
            .expect("queue started twice");
        let name = self.name.clone();
        let tracker = self.tracker.clone();
        let token = self.token.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    maybe = rx.recv() => match maybe {
                        Some(task) => spawn_task(&tracker, &name, &ctx, task),
                        None => break,
                    },
                    () = token.cancelled() => break,
                }
            }

            // Drain: run everything still buffered, plus anything in-flight
            // tasks enqueue while we wait.
            tracker.close();
            loop {
                while let Ok(task) = rx.try_recv() {
                    spawn_task(&tracker, &name, &ctx, task);
                }
                tracker.wait().await;
                if rx.is_empty() {
                    break;
                }
            }
        });
        *self.dispatcher.lock().unwrap() = Some(handle);
    }

    /// Stop accepting dispatches and wait for all queued and in-flight
    /// tasks (including their retries) to finish.
    pub async fn join(&self) {
        self.token.cancel();
        let handle = self.dispatcher.lock().unwrap().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(target: "work", queue = %self.name, error = %e, "queue dispatcher panicked");
            }
        }
    }
}

fn spawn_task(tracker: &TaskTracker, name: &Arc<str>, ctx: &Context, task: Task) {
    let name = name.clone();
    let ctx = ctx.clone();
    tracker.spawn(async move {
        run_task(&name, ctx, task).await;
    });
}

async fn run_task(queue: &str, ctx: Context, task: Task) {
    let mut attempts = 0u32;
    let result = loop {
        attempts += 1;
        match (task.run)(ctx.clone()).await {
            Ok(()) => break Ok(()),
            Err(err @ WorkError::Permanent(_)) => break Err(err),
            Err(err @ WorkError::Transient(_)) => {
                if attempts >= task.max_attempts {
                    break Err(err);
                }
                let delay = backoff(attempts);
                tracing::debug!(
                    target: "work",
                    queue,
                    attempt = attempts,
                    delay_secs = delay.as_secs(),
                    error = %err,
                    "task failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    };

    if let Err(err) = &result {
        tracing::warn!(
            target: "work",
            queue,
            attempts,
            error = %err,
            "task failed permanently"
        );
    }

    if let Some(after) = task.after {
        after(&ctx, &TaskStatus { attempts, result });
    }
}

/// Delay before attempt `attempt + 1`: 1 s, 2 s, 4 s, … capped at 64 s.
fn backoff(attempt: u32) -> Duration {
    Duration::from_secs(1 << (attempt - 1).min(6))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_is_exponential_and_capped() {
        assert_eq!(backoff(1), Duration::from_secs(1));
        assert_eq!(backoff(2), Duration::from_secs(2));
        assert_eq!(backoff(3), Duration::from_secs(4));
        assert_eq!(backoff(10), Duration::from_secs(64));
    }

    #[tokio::test]
    async fn tasks_run_and_join_drains() {
        let queue = Queue::new("test");
        let ran = Arc::new(AtomicU32::new(0));

        for _ in 0..4 {
            let ran = ran.clone();
            queue.enqueue(Task::new(move |_ctx| {
                let ran = ran.clone();
                async move {
                    ran.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }));
        }

        queue.start(Context::new());
        queue.join().await;
        assert_eq!(ran.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_retry_up_to_the_limit() {
        let queue = Queue::new("test");
        let attempts = Arc::new(AtomicU32::new(0));
        let observed = Arc::new(Mutex::new(None));

        let task_attempts = attempts.clone();
        let task_observed = observed.clone();
        queue.enqueue(
            Task::new(move |_ctx| {
                let attempts = task_attempts.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err(WorkError::transient("upstream unavailable"))
                }
            })
            .retries(5)
            .after(move |_ctx, status| {
                *task_observed.lock().unwrap() = Some(status.attempts);
            }),
        );

        queue.start(Context::new());
        queue.join().await;

        assert_eq!(attempts.load(Ordering::SeqCst), 5);
        assert_eq!(*observed.lock().unwrap(), Some(5));
    }

    #[tokio::test]
    async fn permanent_errors_do_not_retry() {
        let queue = Queue::new("test");
        let attempts = Arc::new(AtomicU32::new(0));

        let task_attempts = attempts.clone();
        queue.enqueue(
            Task::new(move |_ctx| {
                let attempts = task_attempts.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err(WorkError::permanent("bad URL"))
                }
            })
            .retries(5),
        );

        queue.start(Context::new());
        queue.join().await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn tasks_enqueued_by_tasks_survive_join() {
        let queue = Arc::new(Queue::new("test"));
        let ran = Arc::new(AtomicU32::new(0));

        let inner_ran = ran.clone();
        let inner_queue = queue.clone();
        queue.enqueue(Task::new(move |_ctx| {
            let ran = inner_ran.clone();
            let queue = inner_queue.clone();
            async move {
                queue.enqueue(Task::new(move |_ctx| {
                    let ran = ran.clone();
                    async move {
                        ran.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }));
                Ok(())
            }
        }));

        queue.start(Context::new());
        queue.join().await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn queue_context_reaches_tasks() {
        #[derive(Debug, PartialEq)]
        struct Marker(&'static str);

        let queue = Queue::new("test");
        let seen = Arc::new(Mutex::new(None));

        let task_seen = seen.clone();
        queue.enqueue(Task::new(move |ctx| {
            let seen = task_seen.clone();
            async move {
                *seen.lock().unwrap() = ctx.get::<Marker>().map(|m| m.0);
                Ok(())
            }
        }));

        queue.start(Context::new().with(Marker("base")));
        queue.join().await;
        assert_eq!(*seen.lock().unwrap(), Some("base"));
    }
}
