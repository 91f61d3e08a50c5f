//! Extension points for domain agents.
//!
//! The runtime depends only on these traits, never on concrete agent kinds:
//!
//! - `TaskHandler`: the one required extension point, invoked per attempt
//! - `LifecycleHooks`: optional callbacks around lifecycle transitions
//! - `MessageHandler`: a bus subscriber callback
//!
//! Scouts, watchdogs, auditors and the rest each supply their own
//! `TaskHandler`; the scheduler calls it without knowing which one it holds.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use warden_contracts::{
    error::WardenResult,
    message::Message,
    task::{Task, TaskResult},
};

use crate::context::{AgentContext, TaskContext};

/// Domain logic run by the scheduler, once per attempt.
///
/// The handler owns its copy of `task` for the attempt. Returning
/// `Ok(TaskResult { success: false, .. })`, returning `Err`, and panicking
/// are all treated as a failed attempt and go through the retry policy.
///
/// Handlers may run concurrently with each other (up to the agent's
/// `max_concurrent_tasks`) and must synchronize any state they share.
/// They should watch `ctx.cancelled()` so `terminate()` can complete quickly.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn process_task(&self, task: Task, ctx: TaskContext) -> WardenResult<TaskResult>;
}

/// Callbacks awaited by the lifecycle operations before a transition
/// completes. A failing hook rolls the transition back (except during
/// `terminate`, which always completes).
#[async_trait]
pub trait LifecycleHooks: Send + Sync {
    async fn on_initialize(&self, _ctx: &AgentContext) -> WardenResult<()> {
        Ok(())
    }

    async fn on_start(&self, _ctx: &AgentContext) -> WardenResult<()> {
        Ok(())
    }

    async fn on_stop(&self, _ctx: &AgentContext) -> WardenResult<()> {
        Ok(())
    }
}

/// Hooks that do nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl LifecycleHooks for NoopHooks {}

/// A bus subscriber. Called from the bus processing tick, so it should
/// return quickly; long work belongs in a submitted task.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, message: &Message);
}

impl<F> MessageHandler for F
where
    F: Fn(&Message) + Send + Sync,
{
    fn handle(&self, message: &Message) {
        self(message)
    }
}

/// Adapts an async closure into a `TaskHandler`.
pub struct FnTaskHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> TaskHandler for FnTaskHandler<F>
where
    F: Fn(Task, TaskContext) -> Fut + Send + Sync,
    Fut: Future<Output = WardenResult<TaskResult>> + Send + 'static,
{
    async fn process_task(&self, task: Task, ctx: TaskContext) -> WardenResult<TaskResult> {
        (self.f)(task, ctx).await
    }
}

/// Build a shareable `TaskHandler` from an async closure.
///
/// ```rust,ignore
/// let handler = handler_fn(|task, _ctx| async move {
///     Ok(TaskResult::success(task.id, serde_json::json!({ "ok": true })))
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn TaskHandler>
where
    F: Fn(Task, TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = WardenResult<TaskResult>> + Send + 'static,
{
    Arc::new(FnTaskHandler { f })
}
