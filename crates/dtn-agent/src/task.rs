//! Single-worker task queues.
//!
//! Every stateful component (the agent, each link, each router) owns one
//! [`TaskQueue`]. Tasks run one at a time on the queue's dedicated thread in
//! submission order, which gives the owner exclusive access to its state
//! without a lock around each operation.
//!
//! ```text
//!  any thread ──post──▶ ┌──────────────┐
//!  any thread ──at────▶ │ crossbeam rx │──▶ worker: run in order,
//!                       └──────────────┘    timers from a min-heap
//! ```

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use quanta::Instant;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;
use tracing::{debug, error};

use crate::error::AgentError;

pub type Job = Box<dyn FnOnce() -> anyhow::Result<()> + Send + 'static>;

/// Receives the queue name and the error of every failed task.
pub type ErrorHandler = Arc<dyn Fn(&str, &anyhow::Error) + Send + Sync>;

#[derive(Default)]
struct TaskState {
    cancelled: AtomicBool,
    done: AtomicBool,
}

/// Handle to a posted or scheduled task.
#[derive(Clone)]
pub struct TaskHandle {
    state: Arc<TaskState>,
}

impl TaskHandle {
    /// Prevents the task from running if it has not started yet.
    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::Acquire)
    }

    pub fn is_done(&self) -> bool {
        self.state.done.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("cancelled", &self.is_cancelled())
            .field("done", &self.is_done())
            .finish()
    }
}

enum Command {
    Run(Job, Arc<TaskState>),
    At(Instant, Job, Arc<TaskState>),
    Shutdown,
}

struct Timer {
    at: Instant,
    seq: u64,
    job: Job,
    state: Arc<TaskState>,
}

impl PartialEq for Timer {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for Timer {}

impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timer {
    // reversed: BinaryHeap is a max-heap and the earliest timer must be on top
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.at.cmp(&self.at).then_with(|| other.seq.cmp(&self.seq))
    }
}

struct QueueInner {
    name: String,
    tx: Sender<Command>,
    worker: ThreadId,
    handle: Mutex<Option<JoinHandle<()>>>,
    scale: f64,
    closed: AtomicBool,
}

impl Drop for QueueInner {
    fn drop(&mut self) {
        let _ = self.tx.send(Command::Shutdown);
    }
}

/// A named single-threaded executor. Cloning shares the worker.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<QueueInner>,
}

impl TaskQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_time_scale(name, 1.0)
    }

    /// Queue whose scheduled delays are multiplied by `time_scale`.
    pub fn with_time_scale(name: impl Into<String>, time_scale: f64) -> Self {
        let handler: ErrorHandler = Arc::new(|queue: &str, e: &anyhow::Error| {
            error!(queue, error = %e, "task failed");
        });
        Self::with_error_handler(name, time_scale, handler)
    }

    pub fn with_error_handler(
        name: impl Into<String>,
        time_scale: f64,
        handler: ErrorHandler,
    ) -> Self {
        let name = name.into();
        let (tx, rx) = unbounded();
        let worker_name = name.clone();

        let handle = thread::Builder::new()
            .name(format!("dtn-{name}"))
            .spawn(move || worker_loop(worker_name, rx, handler))
            .expect("failed to spawn task queue worker");

        Self {
            inner: Arc::new(QueueInner {
                name,
                tx,
                worker: handle.thread().id(),
                handle: Mutex::new(Some(handle)),
                scale: if time_scale > 0.0 { time_scale } else { 1.0 },
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn time_scale(&self) -> f64 {
        self.inner.scale
    }

    pub fn is_on_worker(&self) -> bool {
        thread::current().id() == self.inner.worker
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Appends a task. Tasks run in submission order.
    pub fn post<F>(&self, task: F) -> TaskHandle
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        let state = Arc::new(TaskState::default());
        if self.inner.tx.send(Command::Run(Box::new(task), state.clone())).is_err() {
            debug!(queue = %self.inner.name, "post after shutdown dropped");
        }
        TaskHandle { state }
    }

    /// Runs `task` on the worker and returns its result.
    ///
    /// Runs inline when already on the worker, so a task may call this on
    /// its own queue.
    pub fn post_and_wait<F, R>(&self, task: F) -> Result<R, AgentError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_on_worker() {
            return Ok(task());
        }
        let (tx, rx) = bounded(1);
        self.post(move || {
            let _ = tx.send(task());
            Ok(())
        });
        rx.recv()
            .map_err(|_| AgentError::QueueClosed(self.inner.name.clone()))
    }

    /// One-shot task after `delay`, scaled by the queue's time scale.
    pub fn schedule<F>(&self, delay: Duration, task: F) -> TaskHandle
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        let state = Arc::new(TaskState::default());
        let at = Instant::now() + delay.mul_f64(self.inner.scale);
        if self
            .inner
            .tx
            .send(Command::At(at, Box::new(task), state.clone()))
            .is_err()
        {
            debug!(queue = %self.inner.name, "schedule after shutdown dropped");
        }
        TaskHandle { state }
    }

    /// Stops the worker after the tasks already queued. Pending timers are
    /// discarded. Joins the worker unless called from it.
    pub fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.inner.tx.send(Command::Shutdown);
        if self.is_on_worker() {
            return;
        }
        let handle = self
            .inner
            .handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("name", &self.inner.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ─── Worker ──────────────────────────────────────────────────────────────────

fn worker_loop(name: String, rx: Receiver<Command>, handler: ErrorHandler) {
    let mut timers: BinaryHeap<Timer> = BinaryHeap::new();
    let mut seq = 0u64;

    loop {
        let now = Instant::now();
        while timers.peek().is_some_and(|t| t.at <= now) {
            if let Some(timer) = timers.pop() {
                run(&name, &handler, timer.job, &timer.state);
            }
        }

        let command = match timers.peek() {
            Some(next) => rx.recv_timeout(next.at.saturating_duration_since(Instant::now())),
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };

        match command {
            Ok(Command::Run(job, state)) => run(&name, &handler, job, &state),
            Ok(Command::At(at, job, state)) => {
                seq += 1;
                timers.push(Timer { at, seq, job, state });
            }
            Ok(Command::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
    }

    debug!(queue = %name, pending_timers = timers.len(), "task queue stopped");
}

fn run(name: &str, handler: &ErrorHandler, job: Job, state: &TaskState) {
    if state.cancelled.load(Ordering::Acquire) {
        return;
    }
    match catch_unwind(AssertUnwindSafe(job)) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => handler(name, &e),
        Err(panic) => {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".into());
            handler(name, &anyhow::anyhow!("task panicked: {msg}"));
        }
    }
    state.done.store(true, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn tasks_run_in_submission_order() {
        let queue = TaskQueue::new("order");
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..100 {
            let seen = seen.clone();
            queue.post(move || {
                seen.lock().unwrap().push(i);
                Ok(())
            });
        }
        queue.post_and_wait(|| ()).unwrap();
        assert_eq!(*seen.lock().unwrap(), (0..100).collect::<Vec<_>>());
        queue.shutdown();
    }

    #[test]
    fn post_and_wait_is_reentrant() {
        let queue = TaskQueue::new("reentrant");
        let q = queue.clone();
        let value = queue
            .post_and_wait(move || q.post_and_wait(|| 41).unwrap() + 1)
            .unwrap();
        assert_eq!(value, 42);
        queue.shutdown();
    }

    #[test]
    fn is_on_worker() {
        let queue = TaskQueue::new("worker");
        assert!(!queue.is_on_worker());
        let q = queue.clone();
        assert!(queue.post_and_wait(move || q.is_on_worker()).unwrap());
        queue.shutdown();
    }

    #[test]
    fn failing_task_does_not_stop_queue() {
        let failures = Arc::new(AtomicUsize::new(0));
        let counter = failures.clone();
        let handler: ErrorHandler = Arc::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let queue = TaskQueue::with_error_handler("failing", 1.0, handler);

        queue.post(|| Err(anyhow::anyhow!("boom")));
        queue.post(|| panic!("kaboom"));
        assert_eq!(queue.post_and_wait(|| 7).unwrap(), 7);
        assert_eq!(failures.load(Ordering::SeqCst), 2);
        queue.shutdown();
    }

    #[test]
    fn scheduled_tasks_fire_in_time_order() {
        let queue = TaskQueue::new("timers");
        let (tx, rx) = unbounded();
        for (delay, tag) in [(60u64, "c"), (20, "a"), (40, "b")] {
            let tx = tx.clone();
            queue.schedule(Duration::from_millis(delay), move || {
                let _ = tx.send(tag);
                Ok(())
            });
        }
        let order: Vec<_> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap())
            .collect();
        assert_eq!(order, vec!["a", "b", "c"]);
        queue.shutdown();
    }

    #[test]
    fn cancelled_timer_never_runs() {
        let queue = TaskQueue::new("cancel");
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let handle = queue.schedule(Duration::from_millis(30), move || {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });
        handle.cancel();
        thread::sleep(Duration::from_millis(80));
        queue.post_and_wait(|| ()).unwrap();
        assert!(!ran.load(Ordering::SeqCst));
        assert!(!handle.is_done());
        queue.shutdown();
    }

    #[test]
    fn time_scale_shortens_delays() {
        let queue = TaskQueue::with_time_scale("scaled", 0.01);
        let (tx, rx) = bounded(1);
        let start = std::time::Instant::now();
        queue.schedule(Duration::from_secs(10), move || {
            let _ = tx.send(());
            Ok(())
        });
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(start.elapsed() < Duration::from_secs(2));
        queue.shutdown();
    }

    #[test]
    fn post_and_wait_after_shutdown_errors() {
        let queue = TaskQueue::new("closed");
        queue.shutdown();
        assert!(matches!(
            queue.post_and_wait(|| ()),
            Err(AgentError::QueueClosed(_))
        ));
    }
}
