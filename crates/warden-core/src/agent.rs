//! The WARDEN agent: identity, lifecycle, task scheduling and bus access
//! behind one handle.
//!
//! Every lifecycle operation follows the same sequence:
//!
//!   lock → validate → side effects → hook → audit → commit
//!
//! A rejected operation leaves the state untouched. A failing hook undoes the
//! side effects and rolls the state back, except during `terminate`, which
//! always completes.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use warden_audit::TamperEvidentLog;
use warden_contracts::{
    agent::{AgentId, AgentIdentity, LifecycleState},
    error::{WardenError, WardenResult},
    message::MessageTarget,
    task::{TaskId, TaskResult, TaskSpec},
};

use crate::{
    bus::{MessageBus, Subscription},
    context::AgentContext,
    lifecycle::{LifecycleOp, StateMachine, Transition},
    scheduler::{Scheduler, SchedulerConfig, SchedulerStats},
    timer::ScheduledTask,
    traits::{LifecycleHooks, MessageHandler, TaskHandler},
};

/// Topic of the periodic liveness broadcast.
pub const HEARTBEAT_TOPIC: &str = "agent.heartbeat";

#[derive(Debug, Clone)]
struct RecurringTask {
    spec: TaskSpec,
    interval: Duration,
}

/// Timers of a running agent, plus the runtime they were started on so that
/// recurring tasks registered from any thread join them.
struct RunningTimers {
    runtime: Handle,
    tasks: Vec<ScheduledTask>,
}

struct AgentInner {
    context: AgentContext,
    scheduler: Scheduler,
    hooks: Arc<dyn LifecycleHooks>,
    /// Serializes lifecycle operations. Never held by `current_state`.
    op_lock: tokio::sync::Mutex<()>,
    subscriptions: Mutex<Vec<Subscription>>,
    recurring: Mutex<Vec<RecurringTask>>,
    /// `Some` while the agent is running. Lock after `recurring`, never before.
    timers: Mutex<Option<RunningTimers>>,
}

// Dropping the last handle without `terminate` still stops the agent's
// background work: timers cancel through their own `Drop`, the dispatch loop
// through this one.
impl Drop for AgentInner {
    fn drop(&mut self) {
        self.scheduler.abandon();
        if let Ok(subscriptions) = self.subscriptions.get_mut() {
            for subscription in subscriptions.drain(..) {
                subscription.unsubscribe();
            }
        }
    }
}

/// A long-lived agent. Cheap to clone; clones drive the same agent.
#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

impl Agent {
    pub fn new(
        identity: AgentIdentity,
        hooks: Arc<dyn LifecycleHooks>,
        handler: Arc<dyn TaskHandler>,
    ) -> Self {
        Self::with_scheduler_config(identity, hooks, handler, &SchedulerConfig::default())
    }

    pub fn with_scheduler_config(
        identity: AgentIdentity,
        hooks: Arc<dyn LifecycleHooks>,
        handler: Arc<dyn TaskHandler>,
        config: &SchedulerConfig,
    ) -> Self {
        let context = AgentContext::new(identity);
        let scheduler = Scheduler::new(handler, context.clone(), config);
        Self {
            inner: Arc::new(AgentInner {
                context,
                scheduler,
                hooks,
                op_lock: tokio::sync::Mutex::new(()),
                subscriptions: Mutex::new(Vec::new()),
                recurring: Mutex::new(Vec::new()),
                timers: Mutex::new(None),
            }),
        }
    }

    // ── Accessors ─────────────────────────────────────────────────────────────

    pub fn agent_id(&self) -> &AgentId {
        self.inner.context.agent_id()
    }

    pub fn identity(&self) -> &AgentIdentity {
        self.inner.context.identity()
    }

    /// Lock-free read of the lifecycle state.
    pub fn current_state(&self) -> LifecycleState {
        self.inner.context.current_state()
    }

    pub fn context(&self) -> &AgentContext {
        &self.inner.context
    }

    /// This agent's own tamper-evident log.
    pub fn audit_log(&self) -> &TamperEvidentLog {
        self.inner.context.audit_log()
    }

    fn lifecycle(&self) -> &StateMachine {
        self.inner.context.lifecycle()
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// `uninitialized → ready`. Binds `bus` and runs `on_initialize`.
    ///
    /// # Errors
    ///
    /// `InvalidStateTransition` unless uninitialized; `HookFailed` if
    /// `on_initialize` fails, in which case the bus is released again and the
    /// agent is back to uninitialized.
    pub async fn initialize(&self, bus: MessageBus) -> WardenResult<()> {
        let _op = self.inner.op_lock.lock().await;
        let transition = self.lifecycle().begin(LifecycleOp::Initialize)?;

        self.inner.context.bind_bus(bus);
        if let Err(err) = self.inner.hooks.on_initialize(&self.inner.context).await {
            self.inner.context.unbind_bus();
            return Err(self.hook_failed(transition, "on_initialize", err));
        }

        let identity = self.identity();
        let capabilities: Vec<&str> = identity.capabilities().all().map(|c| c.0.as_str()).collect();
        self.finish(
            transition,
            "lifecycle.initialized",
            json!({
                "role": identity.role(),
                "public_key": identity.public_key_hex(),
                "capabilities": capabilities,
                "max_concurrent_tasks": identity.max_concurrent_tasks(),
            }),
        )
        .inspect_err(|_| self.inner.context.unbind_bus())
    }

    /// `ready | paused → running`. Runs `on_start`, then starts dispatch and
    /// the agent's timers.
    pub async fn start(&self) -> WardenResult<()> {
        let _op = self.inner.op_lock.lock().await;
        let transition = self.lifecycle().begin(LifecycleOp::Start)?;

        if let Err(err) = self.inner.hooks.on_start(&self.inner.context).await {
            return Err(self.hook_failed(transition, "on_start", err));
        }

        self.finish(
            transition,
            "lifecycle.started",
            json!({ "from": transition.from }),
        )?;
        self.inner.scheduler.start_dispatch();
        self.start_timers();
        Ok(())
    }

    /// `running → paused`. Stops new dequeues and the agent's timers, lets
    /// in-flight attempts finish, then runs `on_stop`.
    ///
    /// If `on_stop` fails, dispatch and timers resume and the agent stays
    /// running.
    pub async fn stop(&self) -> WardenResult<()> {
        let _op = self.inner.op_lock.lock().await;
        let transition = self.lifecycle().begin(LifecycleOp::Stop)?;

        self.stop_timers().await;
        self.inner.scheduler.pause().await;

        if let Err(err) = self.inner.hooks.on_stop(&self.inner.context).await {
            self.inner.scheduler.start_dispatch();
            self.start_timers();
            return Err(self.hook_failed(transition, "on_stop", err));
        }

        let result = self.finish(
            transition,
            "lifecycle.stopped",
            json!({ "in_flight": self.inner.scheduler.in_flight() }),
        );
        if result.is_err() {
            self.inner.scheduler.start_dispatch();
            self.start_timers();
        }
        result
    }

    /// Any state `→ terminated`. Idempotent.
    ///
    /// # Sequence
    ///
    /// 1. Cancel timers and the dispatch loop
    /// 2. Cancel queued tasks (each yields a `cancelled` result) and signal
    ///    cancellation to in-flight attempts without aborting them
    /// 3. Drop every bus subscription and release the bus
    /// 4. Run `on_stop` if the agent was running; a failure is only logged
    /// 5. Audit `lifecycle.terminated`, then close the log to appends
    pub async fn terminate(&self) -> WardenResult<()> {
        let _op = self.inner.op_lock.lock().await;
        let transition = self.lifecycle().begin(LifecycleOp::Terminate)?;
        if transition.from.is_terminal() {
            debug!(agent_id = %self.agent_id(), "already terminated");
            return Ok(());
        }

        self.stop_timers().await;
        let cancelled = self.inner.scheduler.shutdown().await;

        let subscriptions =
            std::mem::take(&mut *self.inner.subscriptions.lock().expect("subscription lock poisoned"));
        for subscription in &subscriptions {
            subscription.unsubscribe();
        }
        self.inner.context.unbind_bus();

        if transition.from == LifecycleState::Running {
            if let Err(err) = self.inner.hooks.on_stop(&self.inner.context).await {
                warn!(
                    agent_id = %self.agent_id(),
                    error = %err,
                    "on_stop failed during terminate, continuing"
                );
            }
        }

        if let Err(err) = self.inner.context.log_audit(
            "lifecycle.terminated",
            json!({ "from": transition.from, "cancelled_tasks": cancelled }),
        ) {
            warn!(agent_id = %self.agent_id(), error = %err, "could not audit termination");
        }
        self.audit_log().close();
        self.lifecycle().commit(transition);

        info!(
            agent_id = %self.agent_id(),
            from = %transition.from,
            cancelled_tasks = cancelled,
            "agent terminated"
        );
        Ok(())
    }

    fn finish(
        &self,
        transition: Transition,
        action: &str,
        data: serde_json::Value,
    ) -> WardenResult<()> {
        if let Err(err) = self.inner.context.log_audit(action, data) {
            self.lifecycle().rollback(transition);
            return Err(err);
        }
        self.lifecycle().commit(transition);
        info!(
            agent_id = %self.agent_id(),
            op = %transition.op,
            from = %transition.from,
            to = %transition.to,
            "lifecycle transition"
        );
        Ok(())
    }

    fn hook_failed(&self, transition: Transition, hook: &str, err: WardenError) -> WardenError {
        self.lifecycle().rollback(transition);
        warn!(
            agent_id = %self.agent_id(),
            op = %transition.op,
            hook,
            error = %err,
            "lifecycle hook failed, transition rolled back"
        );
        WardenError::hook_failed(hook, err)
    }

    // ── Tasks ─────────────────────────────────────────────────────────────────

    /// Queue a task and return its id without waiting for it to run.
    ///
    /// Accepted in every state but `terminated`; tasks submitted before
    /// `start` or while paused wait in the queue.
    ///
    /// # Errors
    ///
    /// `InvalidStateTransition` once terminated; `CapabilityMissing` when the
    /// identity restricts capabilities and `task_type` is not granted.
    pub fn submit_task(&self, spec: TaskSpec) -> WardenResult<TaskId> {
        let state = self.current_state();
        if state.is_terminal() {
            return Err(WardenError::invalid_transition(state, "submit a task"));
        }
        self.check_capability(&spec.task_type)?;
        self.inner.scheduler.submit(spec)
    }

    /// Re-submit `spec` every `interval` while the agent is running. Each run
    /// gets a fresh task id.
    ///
    /// Callable from any thread: while running, the timer is spawned on the
    /// runtime the agent was started on.
    pub fn schedule_recurring(&self, spec: TaskSpec, interval: Duration) -> WardenResult<()> {
        let state = self.current_state();
        if state.is_terminal() {
            return Err(WardenError::invalid_transition(state, "schedule a recurring task"));
        }
        self.check_capability(&spec.task_type)?;

        let recurring = RecurringTask { spec, interval };
        let mut defs = self.inner.recurring.lock().expect("recurring lock poisoned");
        if let Some(running) = self
            .inner
            .timers
            .lock()
            .expect("timer lock poisoned")
            .as_mut()
        {
            let timer = self.recurring_timer(&running.runtime, &recurring);
            running.tasks.push(timer);
        }
        debug!(
            agent_id = %self.agent_id(),
            task_type = %recurring.spec.task_type,
            interval_ms = recurring.interval.as_millis() as u64,
            "recurring task registered"
        );
        defs.push(recurring);
        Ok(())
    }

    fn check_capability(&self, task_type: &str) -> WardenResult<()> {
        if self.identity().capabilities().permits(task_type) {
            Ok(())
        } else {
            Err(WardenError::CapabilityMissing {
                capability: task_type.to_string(),
                agent_id: self.agent_id().to_string(),
            })
        }
    }

    pub fn subscribe_results(&self) -> broadcast::Receiver<TaskResult> {
        self.inner.scheduler.subscribe_results()
    }

    pub fn task_result(&self, id: &TaskId) -> Option<TaskResult> {
        self.inner.scheduler.result(id)
    }

    pub fn recent_results(&self) -> Vec<TaskResult> {
        self.inner.scheduler.recent_results()
    }

    pub fn stats(&self) -> SchedulerStats {
        self.inner.scheduler.stats()
    }

    /// Wait until no task is queued or running. Returns false on timeout.
    pub async fn wait_for_idle(&self, timeout: Duration) -> bool {
        self.inner.scheduler.wait_for_idle(timeout).await
    }

    // ── Messaging & audit ─────────────────────────────────────────────────────

    pub fn send_message(
        &self,
        target: impl Into<MessageTarget>,
        topic: impl Into<String>,
        payload: serde_json::Value,
    ) -> WardenResult<()> {
        self.inner.context.send_message(target, topic, payload)
    }

    /// Subscribe to `topic` under this agent's id: broadcasts plus messages
    /// addressed to this agent. Dropped automatically on `terminate`.
    pub fn subscribe<H>(&self, topic: impl Into<String>, handler: H) -> WardenResult<()>
    where
        H: MessageHandler + 'static,
    {
        let state = self.current_state();
        if state.is_terminal() {
            return Err(WardenError::invalid_transition(state, "subscribe"));
        }
        let bus = self
            .inner
            .context
            .bus()
            .ok_or_else(|| WardenError::invalid_transition(state, "subscribe without a bus"))?;

        let subscription = bus.subscribe_as(self.agent_id().clone(), topic, handler);
        self.inner
            .subscriptions
            .lock()
            .expect("subscription lock poisoned")
            .push(subscription);
        Ok(())
    }

    pub fn log_audit(&self, action: &str, data: serde_json::Value) -> WardenResult<String> {
        self.inner.context.log_audit(action, data)
    }

    // ── Timers ────────────────────────────────────────────────────────────────

    /// Only called from lifecycle operations, which run inside the runtime.
    fn start_timers(&self) {
        let defs = self.inner.recurring.lock().expect("recurring lock poisoned");
        let mut slot = self.inner.timers.lock().expect("timer lock poisoned");
        if slot.is_some() {
            return;
        }

        let runtime = Handle::current();
        let mut tasks: Vec<ScheduledTask> = defs
            .iter()
            .map(|d| self.recurring_timer(&runtime, d))
            .collect();
        let heartbeat_ms = self.identity().heartbeat_interval_ms();
        if heartbeat_ms > 0 {
            tasks.push(self.heartbeat_timer(&runtime, Duration::from_millis(heartbeat_ms)));
        }
        *slot = Some(RunningTimers { runtime, tasks });
    }

    async fn stop_timers(&self) {
        let running = self.inner.timers.lock().expect("timer lock poisoned").take();
        for timer in running.into_iter().flat_map(|r| r.tasks) {
            timer.shutdown().await;
        }
    }

    // Timer closures hold the scheduler and context, never the agent.

    fn recurring_timer(&self, runtime: &Handle, recurring: &RecurringTask) -> ScheduledTask {
        let scheduler = self.inner.scheduler.clone();
        let spec = recurring.spec.clone();
        let agent_id = self.agent_id().clone();
        ScheduledTask::every_on(
            runtime,
            format!("{agent_id}/recurring/{}", spec.task_type),
            recurring.interval,
            move || {
                let mut run = spec.clone();
                run.id = None;
                if let Err(err) = scheduler.submit(run) {
                    warn!(agent_id = %agent_id, error = %err, "recurring submit failed");
                }
            },
        )
    }

    fn heartbeat_timer(&self, runtime: &Handle, period: Duration) -> ScheduledTask {
        let context = self.inner.context.clone();
        let scheduler = self.inner.scheduler.clone();
        let name = format!("{}/heartbeat", self.agent_id());
        ScheduledTask::every_on(runtime, name, period, move || {
            let payload = json!({
                "agent_id": context.agent_id(),
                "role": context.identity().role(),
                "state": context.current_state(),
                "queued": scheduler.queued_len(),
            });
            if let Err(err) = context.send_message(MessageTarget::Broadcast, HEARTBEAT_TOPIC, payload) {
                debug!(agent_id = %context.agent_id(), error = %err, "heartbeat not sent");
            }
        })
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("agent_id", self.agent_id())
            .field("state", &self.current_state())
            .field("scheduler", &self.inner.scheduler)
            .finish()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::json;

    use warden_contracts::agent::AgentRole;
    use warden_contracts::message::Message;

    use super::*;
    use crate::bus::BusConfig;
    use crate::traits::{handler_fn, NoopHooks};

    // ── Mock hooks ────────────────────────────────────────────────────────────

    #[derive(Default)]
    struct RecordingHooks {
        calls: Mutex<Vec<&'static str>>,
        fail_on: Option<&'static str>,
    }

    impl RecordingHooks {
        fn failing(hook: &'static str) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail_on: Some(hook),
            }
        }

        fn record(&self, hook: &'static str) -> WardenResult<()> {
            self.calls.lock().unwrap().push(hook);
            if self.fail_on == Some(hook) {
                return Err(WardenError::ConfigError {
                    reason: format!("{hook} refused"),
                });
            }
            Ok(())
        }

        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl LifecycleHooks for RecordingHooks {
        async fn on_initialize(&self, _ctx: &AgentContext) -> WardenResult<()> {
            self.record("on_initialize")
        }

        async fn on_start(&self, _ctx: &AgentContext) -> WardenResult<()> {
            self.record("on_start")
        }

        async fn on_stop(&self, _ctx: &AgentContext) -> WardenResult<()> {
            self.record("on_stop")
        }
    }

    // ── Helpers ───────────────────────────────────────────────────────────────

    fn echo_handler() -> Arc<dyn TaskHandler> {
        handler_fn(|task, _ctx| async move { Ok(TaskResult::success(task.id, task.payload)) })
    }

    fn counting_handler() -> (Arc<AtomicUsize>, Arc<dyn TaskHandler>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let handler = handler_fn(move |task, _ctx| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(TaskResult::success(task.id, json!(null)))
            }
        });
        (calls, handler)
    }

    fn identity() -> AgentIdentity {
        AgentIdentity::generate(AgentRole::Watchdog, "n1")
    }

    fn agent_with(hooks: Arc<dyn LifecycleHooks>) -> Agent {
        Agent::new(identity(), hooks, echo_handler())
    }

    fn bus() -> MessageBus {
        MessageBus::new(BusConfig::default())
    }

    const IDLE: Duration = Duration::from_secs(5);

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn initialize_start_stop_start_ends_running() {
        let hooks = Arc::new(RecordingHooks::default());
        let agent = agent_with(hooks.clone());

        agent.initialize(bus()).await.unwrap();
        assert_eq!(agent.current_state(), LifecycleState::Ready);
        agent.start().await.unwrap();
        agent.stop().await.unwrap();
        assert_eq!(agent.current_state(), LifecycleState::Paused);
        agent.start().await.unwrap();

        assert_eq!(agent.current_state(), LifecycleState::Running);
        assert_eq!(
            hooks.calls(),
            vec!["on_initialize", "on_start", "on_stop", "on_start"]
        );
        agent.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn start_before_initialize_is_rejected() {
        let agent = agent_with(Arc::new(NoopHooks));
        let err = agent.start().await.unwrap_err();
        assert!(matches!(err, WardenError::InvalidStateTransition { .. }));
        assert_eq!(agent.current_state(), LifecycleState::Uninitialized);
        assert_eq!(agent.audit_log().length(), 0);
    }

    #[tokio::test]
    async fn terminate_is_idempotent() {
        let hooks = Arc::new(RecordingHooks::default());
        let agent = agent_with(hooks.clone());
        agent.initialize(bus()).await.unwrap();
        agent.start().await.unwrap();

        agent.terminate().await.unwrap();
        let entries_after_first = agent.audit_log().length();
        agent.terminate().await.unwrap();

        assert_eq!(agent.current_state(), LifecycleState::Terminated);
        assert_eq!(agent.audit_log().length(), entries_after_first);
        assert_eq!(hooks.calls().iter().filter(|c| **c == "on_stop").count(), 1);
    }

    #[tokio::test]
    async fn terminate_from_uninitialized_skips_on_stop() {
        let hooks = Arc::new(RecordingHooks::default());
        let agent = agent_with(hooks.clone());
        agent.terminate().await.unwrap();

        assert_eq!(agent.current_state(), LifecycleState::Terminated);
        assert!(hooks.calls().is_empty());
        assert!(agent.initialize(bus()).await.is_err());
    }

    #[tokio::test]
    async fn failing_initialize_hook_rolls_back() {
        let hooks = Arc::new(RecordingHooks::failing("on_initialize"));
        let agent = agent_with(hooks);
        let err = agent.initialize(bus()).await.unwrap_err();

        assert!(matches!(err, WardenError::HookFailed { .. }));
        assert_eq!(agent.current_state(), LifecycleState::Uninitialized);
        assert!(agent.send_message("broadcast", "t", json!(null)).is_err());
    }

    #[tokio::test]
    async fn failing_start_hook_stays_ready() {
        let agent = agent_with(Arc::new(RecordingHooks::failing("on_start")));
        agent.initialize(bus()).await.unwrap();

        assert!(agent.start().await.is_err());
        assert_eq!(agent.current_state(), LifecycleState::Ready);
    }

    #[tokio::test]
    async fn failing_stop_hook_keeps_running() {
        let (calls, handler) = counting_handler();
        let agent = Agent::new(
            identity(),
            Arc::new(RecordingHooks::failing("on_stop")),
            handler,
        );
        agent.initialize(bus()).await.unwrap();
        agent.start().await.unwrap();

        assert!(agent.stop().await.is_err());
        assert_eq!(agent.current_state(), LifecycleState::Running);

        // Dispatch resumed.
        agent.submit_task(TaskSpec::new("scan")).unwrap();
        assert!(agent.wait_for_idle(IDLE).await);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // A failing on_stop never blocks termination.
        agent.terminate().await.unwrap();
        assert_eq!(agent.current_state(), LifecycleState::Terminated);
    }

    #[tokio::test]
    async fn transitions_are_audited() {
        let agent = agent_with(Arc::new(NoopHooks));
        agent.initialize(bus()).await.unwrap();
        agent.start().await.unwrap();
        agent.stop().await.unwrap();
        agent.terminate().await.unwrap();

        let actions: Vec<String> = agent
            .audit_log()
            .entries()
            .into_iter()
            .map(|e| e.action)
            .collect();
        assert_eq!(
            actions,
            vec![
                "lifecycle.initialized",
                "lifecycle.started",
                "lifecycle.stopped",
                "lifecycle.terminated",
            ]
        );
        assert!(agent.audit_log().verify().valid);
        assert!(agent.audit_log().is_closed());
        assert!(matches!(
            agent.log_audit("late", json!(null)),
            Err(WardenError::AuditLogClosed { .. })
        ));
    }

    // ── Tasks ─────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn tasks_wait_until_start() {
        let (calls, handler) = counting_handler();
        let agent = Agent::new(identity(), Arc::new(NoopHooks), handler);
        agent.initialize(bus()).await.unwrap();

        let id = agent.submit_task(TaskSpec::new("scan")).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        agent.start().await.unwrap();
        assert!(agent.wait_for_idle(IDLE).await);
        assert!(agent.task_result(&id).unwrap().success);
        agent.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn terminate_cancels_queued_tasks_and_rejects_new_ones() {
        let agent = agent_with(Arc::new(NoopHooks));
        agent.initialize(bus()).await.unwrap();
        let id = agent.submit_task(TaskSpec::new("scan")).unwrap();

        agent.terminate().await.unwrap();

        let result = agent.task_result(&id).unwrap();
        assert_eq!(result.error.as_deref(), Some("cancelled"));
        assert!(matches!(
            agent.submit_task(TaskSpec::new("scan")),
            Err(WardenError::InvalidStateTransition { .. })
        ));
        assert_eq!(agent.stats().cancelled, 1);
    }

    #[tokio::test]
    async fn capability_gate_rejects_ungranted_task_types() {
        let identity = identity().with_capabilities(["scan:model"]);
        let agent = Agent::new(identity, Arc::new(NoopHooks), echo_handler());

        assert!(agent.submit_task(TaskSpec::new("scan:model")).is_ok());
        match agent.submit_task(TaskSpec::new("block:model")) {
            Err(WardenError::CapabilityMissing { capability, agent_id }) => {
                assert_eq!(capability, "block:model");
                assert_eq!(agent_id, "watchdog-n1");
            }
            other => panic!("expected CapabilityMissing, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn handler_sees_agent_context() {
        let handler = handler_fn(|task, ctx| async move {
            assert_eq!(ctx.current_state(), LifecycleState::Running);
            let tip = ctx.log_audit("scan.done", json!({ "task": task.id.to_string() }))?;
            Ok(TaskResult::success(task.id, json!({ "tip": tip })))
        });
        let agent = Agent::new(identity(), Arc::new(NoopHooks), handler);
        agent.initialize(bus()).await.unwrap();
        agent.start().await.unwrap();

        let id = agent.submit_task(TaskSpec::new("scan")).unwrap();
        assert!(agent.wait_for_idle(IDLE).await);

        let result = agent.task_result(&id).unwrap();
        assert!(result.success);
        assert_eq!(agent.audit_log().entries()[2].action, "scan.done");
        agent.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn recurring_task_runs_only_while_running() {
        let (calls, handler) = counting_handler();
        let agent = Agent::new(identity(), Arc::new(NoopHooks), handler);
        agent.initialize(bus()).await.unwrap();
        agent
            .schedule_recurring(TaskSpec::new("sample"), Duration::from_millis(10))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(agent.stats().submitted, 0);

        agent.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        agent.stop().await.unwrap();
        let while_running = agent.stats().submitted;
        assert!(while_running >= 2, "expected repeated runs, got {while_running}");
        assert!(calls.load(Ordering::SeqCst) >= 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(agent.stats().submitted, while_running);
        agent.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn recurring_task_registered_from_plain_thread() {
        let (calls, handler) = counting_handler();
        let agent = Agent::new(identity(), Arc::new(NoopHooks), handler);
        agent.initialize(bus()).await.unwrap();
        agent.start().await.unwrap();

        let remote = agent.clone();
        std::thread::spawn(move || {
            remote.schedule_recurring(TaskSpec::new("sample"), Duration::from_millis(10))
        })
        .join()
        .unwrap()
        .unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        agent.terminate().await.unwrap();
        assert!(agent.stats().submitted >= 1);
        assert!(calls.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn dropping_running_agent_releases_handler() {
        let handler = echo_handler();
        let agent = Agent::new(
            identity().with_heartbeat_interval_ms(10),
            Arc::new(NoopHooks),
            Arc::clone(&handler),
        );
        agent.initialize(bus()).await.unwrap();
        agent
            .schedule_recurring(TaskSpec::new("sample"), Duration::from_millis(10))
            .unwrap();
        agent.start().await.unwrap();
        agent.submit_task(TaskSpec::new("scan")).unwrap();
        assert!(agent.wait_for_idle(IDLE).await);
        assert!(Arc::strong_count(&handler) > 1);

        drop(agent);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(Arc::strong_count(&handler), 1);
    }

    // ── Messaging ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn heartbeat_is_broadcast_while_running() {
        let bus = bus();
        let beats = Arc::new(Mutex::new(Vec::<Message>::new()));
        let sink = Arc::clone(&beats);
        let _sub = bus.subscribe(HEARTBEAT_TOPIC, move |m: &Message| {
            sink.lock().unwrap().push(m.clone())
        });

        let agent = Agent::new(
            identity().with_heartbeat_interval_ms(10),
            Arc::new(NoopHooks),
            echo_handler(),
        );
        agent.initialize(bus.clone()).await.unwrap();
        agent.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        agent.terminate().await.unwrap();
        bus.process_pending();

        let beats = beats.lock().unwrap();
        assert!(!beats.is_empty());
        assert_eq!(beats[0].payload["agent_id"], "watchdog-n1");
        assert_eq!(beats[0].payload["state"], "running");
        assert_eq!(beats[0].payload["role"], "watchdog");
    }

    #[tokio::test]
    async fn addressed_messages_reach_subscribed_agent_until_terminate() {
        let bus = bus();
        let watchdog = agent_with(Arc::new(NoopHooks));
        let scout = Agent::new(
            AgentIdentity::generate(AgentRole::Scout, "n1"),
            Arc::new(NoopHooks),
            echo_handler(),
        );
        watchdog.initialize(bus.clone()).await.unwrap();
        scout.initialize(bus.clone()).await.unwrap();

        let received = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&received);
        watchdog
            .subscribe("finding", move |_: &Message| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        scout
            .send_message(watchdog.agent_id().clone(), "finding", json!({ "model": "m-1" }))
            .unwrap();
        scout
            .send_message("enforcer-n9", "finding", json!({ "model": "m-2" }))
            .unwrap();
        bus.process_pending();
        assert_eq!(received.load(Ordering::SeqCst), 1);

        watchdog.terminate().await.unwrap();
        assert_eq!(bus.subscriber_count(), 0);
        assert!(watchdog
            .send_message("broadcast", "finding", json!(null))
            .is_err());
        scout.terminate().await.unwrap();
    }
}
