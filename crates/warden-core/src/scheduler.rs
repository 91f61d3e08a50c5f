//! Per-agent priority task scheduler.
//!
//! One dispatch loop per agent pops the highest-priority queued task (FIFO
//! within a priority class) whenever a concurrency permit is free, and runs
//! the agent's `TaskHandler` for one attempt in its own tokio task.
//!
//! Attempt outcomes:
//! - success: terminal, recorded and broadcast on the result channel
//! - failure with attempts left: requeued at the back of its class
//! - failure on the last attempt: terminal `RetriesExhausted` result
//!
//! A handler that returns `Err` or panics counts as a failed attempt. Nothing
//! a handler does ever propagates into the dispatch loop.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use warden_contracts::{
    error::{WardenError, WardenResult},
    task::{Task, TaskId, TaskResult, TaskSpec},
};

use crate::{
    context::{AgentContext, TaskContext},
    traits::TaskHandler,
};

/// Error text of results for tasks that never ran because the agent
/// terminated first.
pub const CANCELLED: &str = "cancelled";

const RESULT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Terminal results kept for `result` / `recent_results` lookups.
    pub result_history: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            result_history: 256,
        }
    }
}

/// Point-in-time scheduler counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub submitted: u64,
    pub succeeded: u64,
    /// Terminal failures, including cancellations.
    pub failed: u64,
    /// Failed attempts that were requeued.
    pub retried: u64,
    pub cancelled: u64,
    pub queued: usize,
    pub in_flight: usize,
    pub peak_in_flight: usize,
    pub max_concurrent: usize,
}

// ── Queue ─────────────────────────────────────────────────────────────────────

struct QueuedTask {
    task: Task,
    seq: u64,
}

// Max-heap order: higher priority first, then lower sequence number.
impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.task
            .priority
            .cmp(&other.task.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for QueuedTask {}

#[derive(Default)]
struct TaskQueue {
    heap: BinaryHeap<QueuedTask>,
    next_seq: u64,
    closed: bool,
}

impl TaskQueue {
    /// Hands the task back when the queue is closed.
    fn push(&mut self, task: Task) -> Result<(), Task> {
        if self.closed {
            return Err(task);
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(QueuedTask { task, seq });
        Ok(())
    }

    fn pop(&mut self) -> Option<Task> {
        self.heap.pop().map(|queued| queued.task)
    }

    fn close_and_drain(&mut self) -> Vec<Task> {
        self.closed = true;
        let mut drained = Vec::with_capacity(self.heap.len());
        while let Some(task) = self.pop() {
            drained.push(task);
        }
        drained
    }
}

// ── Shared state ──────────────────────────────────────────────────────────────

struct DispatchLoop {
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

struct SchedulerShared {
    handler: Arc<dyn TaskHandler>,
    context: AgentContext,
    queue: Mutex<TaskQueue>,
    wake: Notify,
    permits: Arc<Semaphore>,
    max_concurrent: usize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    submitted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    cancelled: AtomicU64,
    history: Mutex<VecDeque<TaskResult>>,
    history_limit: usize,
    results: broadcast::Sender<TaskResult>,
    /// Fires once, on shutdown. Every attempt's cancellation token is a child.
    shutdown: CancellationToken,
    dispatch: Mutex<Option<DispatchLoop>>,
}

impl SchedulerShared {
    /// Pop the next task and count it in flight under one queue lock, so
    /// idle checks never see it missing from both.
    fn take_next(&self) -> Option<(Task, usize)> {
        let mut queue = self.queue.lock().expect("task queue lock poisoned");
        let task = queue.pop()?;
        let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);
        Some((task, now_in_flight))
    }

    fn launch(self: &Arc<Self>, mut task: Task, now_in_flight: usize, permit: OwnedSemaphorePermit) {
        task.attempt_count += 1;
        let attempt = task.attempt_count;

        debug!(
            agent_id = %self.context.agent_id(),
            task_id = %task.id,
            task_type = %task.task_type,
            priority = ?task.priority,
            attempt,
            in_flight = now_in_flight,
            "dispatching task"
        );

        let shared = Arc::clone(self);
        tokio::spawn(async move {
            let ctx = TaskContext::new(
                shared.context.clone(),
                attempt,
                shared.shutdown.child_token(),
            );
            let handler = Arc::clone(&shared.handler);
            let attempt_copy = task.clone();
            let started = Instant::now();

            // Nested spawn so a handler panic surfaces as a JoinError here.
            let outcome =
                tokio::spawn(async move { handler.process_task(attempt_copy, ctx).await }).await;

            shared.complete(task, outcome, started.elapsed());
            shared.in_flight.fetch_sub(1, Ordering::SeqCst);
            drop(permit);
        });
    }

    fn complete(
        &self,
        task: Task,
        outcome: Result<WardenResult<TaskResult>, JoinError>,
        elapsed: Duration,
    ) {
        let attempt = task.attempt_count;
        let reason = match outcome {
            Ok(Ok(result)) if result.success => {
                let result = TaskResult {
                    task_id: task.id.clone(),
                    duration: elapsed,
                    attempts: attempt,
                    timestamp: Utc::now(),
                    ..result
                };
                self.succeeded.fetch_add(1, Ordering::Relaxed);
                debug!(
                    agent_id = %self.context.agent_id(),
                    task_id = %task.id,
                    attempt,
                    "task succeeded"
                );
                self.record(result);
                return;
            }
            Ok(Ok(result)) => result
                .error
                .unwrap_or_else(|| "handler reported failure".to_string()),
            Ok(Err(err)) => err.to_string(),
            Err(join_err) => join_failure_reason(join_err),
        };

        let failure = WardenError::TaskHandlerFailure {
            task_id: task.id.to_string(),
            attempt,
            reason: reason.clone(),
        };

        if self.shutdown.is_cancelled() {
            self.finish_failed(
                &task,
                format!("{CANCELLED}: {failure}"),
                elapsed,
                true,
            );
            return;
        }

        if task.has_attempts_left() {
            warn!(
                agent_id = %self.context.agent_id(),
                error = %failure,
                remaining = task.max_attempts() - attempt,
                "task attempt failed, requeueing"
            );
            let requeued = self
                .queue
                .lock()
                .expect("task queue lock poisoned")
                .push(task);
            match requeued {
                Ok(()) => {
                    self.retried.fetch_add(1, Ordering::Relaxed);
                    self.wake.notify_one();
                }
                Err(task) => {
                    self.finish_failed(&task, format!("{CANCELLED}: {failure}"), elapsed, true)
                }
            }
            return;
        }

        let exhausted = WardenError::RetriesExhausted {
            task_id: task.id.to_string(),
            attempts: attempt,
            reason,
        };
        warn!(agent_id = %self.context.agent_id(), error = %exhausted, "task failed");
        self.finish_failed(&task, exhausted.to_string(), elapsed, false);
    }

    fn finish_failed(&self, task: &Task, error: String, elapsed: Duration, cancelled: bool) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        if cancelled {
            self.cancelled.fetch_add(1, Ordering::Relaxed);
        }
        let mut result = TaskResult::failure(task.id.clone(), error);
        result.duration = elapsed;
        result.attempts = task.attempt_count;
        self.record(result);
    }

    fn record(&self, result: TaskResult) {
        {
            let mut history = self.history.lock().expect("result history lock poisoned");
            if self.history_limit > 0 {
                while history.len() >= self.history_limit {
                    history.pop_front();
                }
                history.push_back(result.clone());
            }
        }
        // No listeners is fine.
        let _ = self.results.send(result);
    }
}

fn join_failure_reason(err: JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload = err.into_panic();
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());
    format!("handler panicked: {message}")
}

async fn dispatch_loop(shared: Arc<SchedulerShared>, stop: CancellationToken) {
    loop {
        let permit = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            permit = Arc::clone(&shared.permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let task = loop {
            if let Some(next) = shared.take_next() {
                break Some(next);
            }
            tokio::select! {
                biased;
                _ = stop.cancelled() => break None,
                _ = shared.wake.notified() => {}
            }
        };

        match task {
            Some((task, now_in_flight)) => shared.launch(task, now_in_flight, permit),
            None => break,
        }
    }

    debug!(agent_id = %shared.context.agent_id(), "dispatch loop stopped");
}

// ── Scheduler ─────────────────────────────────────────────────────────────────

/// Queue, dispatch loop and result channel for one agent.
///
/// Clones share everything.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<SchedulerShared>,
}

impl Scheduler {
    pub(crate) fn new(
        handler: Arc<dyn TaskHandler>,
        context: AgentContext,
        config: &SchedulerConfig,
    ) -> Self {
        let max_concurrent = context.identity().max_concurrent_tasks().max(1);
        let (results, _) = broadcast::channel(RESULT_CHANNEL_CAPACITY);
        Self {
            shared: Arc::new(SchedulerShared {
                handler,
                context,
                queue: Mutex::new(TaskQueue::default()),
                wake: Notify::new(),
                permits: Arc::new(Semaphore::new(max_concurrent)),
                max_concurrent,
                in_flight: AtomicUsize::new(0),
                peak_in_flight: AtomicUsize::new(0),
                submitted: AtomicU64::new(0),
                succeeded: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                retried: AtomicU64::new(0),
                cancelled: AtomicU64::new(0),
                history: Mutex::new(VecDeque::new()),
                history_limit: config.result_history,
                results,
                shutdown: CancellationToken::new(),
                dispatch: Mutex::new(None),
            }),
        }
    }

    /// Queue a task and return its id. Never waits on task execution.
    ///
    /// Lifecycle and capability checks are the agent's job; the scheduler
    /// only refuses once it has been shut down.
    pub fn submit(&self, spec: TaskSpec) -> WardenResult<TaskId> {
        let task = Task::from_spec(spec);
        let id = task.id.clone();
        let priority = task.priority;

        self.shared
            .queue
            .lock()
            .expect("task queue lock poisoned")
            .push(task)
            .map_err(|_| {
                WardenError::invalid_transition(
                    self.shared.context.current_state(),
                    "submit a task",
                )
            })?;

        self.shared.submitted.fetch_add(1, Ordering::Relaxed);
        self.shared.wake.notify_one();
        debug!(
            agent_id = %self.shared.context.agent_id(),
            task_id = %id,
            priority = ?priority,
            "task queued"
        );
        Ok(id)
    }

    /// Spawn the dispatch loop. A no-op if it is already running or the
    /// scheduler has shut down.
    pub fn start_dispatch(&self) {
        if self.shared.shutdown.is_cancelled() {
            return;
        }
        let mut dispatch = self.shared.dispatch.lock().expect("dispatch lock poisoned");
        if dispatch.is_some() {
            return;
        }
        let stop = CancellationToken::new();
        let handle = tokio::spawn(dispatch_loop(Arc::clone(&self.shared), stop.clone()));
        *dispatch = Some(DispatchLoop { stop, handle });
        debug!(agent_id = %self.shared.context.agent_id(), "dispatch loop started");
    }

    /// Stop dequeuing. Attempts already running finish normally, and a
    /// failed one is still requeued for when dispatch resumes.
    pub async fn pause(&self) {
        let running = self
            .shared
            .dispatch
            .lock()
            .expect("dispatch lock poisoned")
            .take();
        if let Some(DispatchLoop { stop, handle }) = running {
            stop.cancel();
            let _ = handle.await;
        }
    }

    /// Stop dispatch for good, signal cancellation to running attempts, and
    /// turn every queued task into a `cancelled` result. Returns how many
    /// queued tasks were cancelled.
    pub async fn shutdown(&self) -> usize {
        self.pause().await;
        self.shared.shutdown.cancel();

        let drained = self
            .shared
            .queue
            .lock()
            .expect("task queue lock poisoned")
            .close_and_drain();
        let count = drained.len();
        for task in &drained {
            self.shared
                .finish_failed(task, CANCELLED.to_string(), Duration::ZERO, true);
        }

        if count > 0 {
            info!(
                agent_id = %self.shared.context.agent_id(),
                cancelled = count,
                "queued tasks cancelled"
            );
        }
        count
    }

    /// Signal the dispatch loop and running attempts to stop without waiting
    /// for either. Used when the owning agent is dropped unterminated; the
    /// loop then releases its hold on the handler and context.
    pub(crate) fn abandon(&self) {
        self.shared.shutdown.cancel();
        let running = self
            .shared
            .dispatch
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(DispatchLoop { stop, .. }) = running {
            stop.cancel();
        }
    }

    pub fn is_dispatching(&self) -> bool {
        self.shared
            .dispatch
            .lock()
            .expect("dispatch lock poisoned")
            .is_some()
    }

    /// Receive every terminal result produced after this call.
    pub fn subscribe_results(&self) -> broadcast::Receiver<TaskResult> {
        self.shared.results.subscribe()
    }

    /// Terminal result for `id`, if it is still in the history.
    pub fn result(&self, id: &TaskId) -> Option<TaskResult> {
        self.shared
            .history
            .lock()
            .expect("result history lock poisoned")
            .iter()
            .rev()
            .find(|r| &r.task_id == id)
            .cloned()
    }

    /// Retained terminal results, oldest first.
    pub fn recent_results(&self) -> Vec<TaskResult> {
        self.shared
            .history
            .lock()
            .expect("result history lock poisoned")
            .iter()
            .cloned()
            .collect()
    }

    pub fn queued_len(&self) -> usize {
        self.shared
            .queue
            .lock()
            .expect("task queue lock poisoned")
            .heap
            .len()
    }

    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> SchedulerStats {
        let s = &self.shared;
        SchedulerStats {
            submitted: s.submitted.load(Ordering::Relaxed),
            succeeded: s.succeeded.load(Ordering::Relaxed),
            failed: s.failed.load(Ordering::Relaxed),
            retried: s.retried.load(Ordering::Relaxed),
            cancelled: s.cancelled.load(Ordering::Relaxed),
            queued: self.queued_len(),
            in_flight: self.in_flight(),
            peak_in_flight: s.peak_in_flight.load(Ordering::SeqCst),
            max_concurrent: s.max_concurrent,
        }
    }

    /// Wait until nothing is queued or running, or `timeout` elapses.
    /// Returns false on timeout.
    pub async fn wait_for_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.queued_len() == 0 && self.in_flight() == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("agent_id", self.shared.context.agent_id())
            .field("stats", &self.stats())
            .finish()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
