//! The view of the runtime that hooks and task handlers receive.

use std::sync::{Arc, RwLock};

use tokio_util::sync::CancellationToken;
use tracing::warn;

use warden_audit::TamperEvidentLog;
use warden_contracts::{
    agent::{AgentId, AgentIdentity, LifecycleState},
    error::{WardenError, WardenResult},
    message::{Message, MessageTarget},
};

use crate::{bus::MessageBus, lifecycle::StateMachine};

/// Handle on one agent's identity, state, bus binding and audit log.
///
/// Cheap to clone. The scheduler hands a clone to every task attempt and
/// the recurring timers hold one, so nothing here points back at the
/// `Agent` itself.
#[derive(Clone)]
pub struct AgentContext {
    identity: Arc<AgentIdentity>,
    agent_id: AgentId,
    lifecycle: Arc<StateMachine>,
    bus: Arc<RwLock<Option<MessageBus>>>,
    audit: TamperEvidentLog,
}

impl AgentContext {
    pub(crate) fn new(identity: AgentIdentity) -> Self {
        let agent_id = identity.agent_id();
        Self {
            audit: TamperEvidentLog::new(agent_id.as_str()),
            identity: Arc::new(identity),
            agent_id,
            lifecycle: Arc::new(StateMachine::new()),
            bus: Arc::new(RwLock::new(None)),
        }
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    pub fn identity(&self) -> &AgentIdentity {
        &self.identity
    }

    pub fn current_state(&self) -> LifecycleState {
        self.lifecycle.current()
    }

    pub(crate) fn lifecycle(&self) -> &StateMachine {
        &self.lifecycle
    }

    /// Publish a message from this agent.
    ///
    /// Fails when the agent is terminated or was never bound to a bus. A
    /// bound but stopped bus drops the message with a warning and this still
    /// returns `Ok`.
    pub fn send_message(
        &self,
        target: impl Into<MessageTarget>,
        topic: impl Into<String>,
        payload: serde_json::Value,
    ) -> WardenResult<()> {
        let state = self.current_state();
        if state.is_terminal() {
            return Err(WardenError::invalid_transition(state, "send a message"));
        }
        let bus = self
            .bus()
            .ok_or_else(|| WardenError::invalid_transition(state, "send a message without a bus"))?;

        let message = Message::new(self.agent_id.clone(), target, topic, payload);
        if !bus.publish(message) {
            warn!(agent_id = %self.agent_id, "outgoing message was not queued");
        }
        Ok(())
    }

    /// Append an entry to this agent's tamper-evident log. Returns the new
    /// chain tip.
    pub fn log_audit(&self, action: &str, data: serde_json::Value) -> WardenResult<String> {
        self.audit.append(action, data)
    }

    pub fn audit_log(&self) -> &TamperEvidentLog {
        &self.audit
    }

    pub(crate) fn bind_bus(&self, bus: MessageBus) {
        *self.bus.write().expect("agent bus lock poisoned") = Some(bus);
    }

    pub(crate) fn unbind_bus(&self) {
        self.bus.write().expect("agent bus lock poisoned").take();
    }

    pub(crate) fn bus(&self) -> Option<MessageBus> {
        self.bus.read().expect("agent bus lock poisoned").clone()
    }
}

impl std::fmt::Debug for AgentContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentContext")
            .field("agent_id", &self.agent_id)
            .field("state", &self.current_state())
            .finish()
    }
}

/// Passed to `TaskHandler::process_task` for one attempt.
#[derive(Debug, Clone)]
pub struct TaskContext {
    agent: AgentContext,
    attempt: u32,
    cancellation: CancellationToken,
}

impl TaskContext {
    pub(crate) fn new(agent: AgentContext, attempt: u32, cancellation: CancellationToken) -> Self {
        Self {
            agent,
            attempt,
            cancellation,
        }
    }

    pub fn agent(&self) -> &AgentContext {
        &self.agent
    }

    /// 1 for the first attempt, 2 for the first retry, and so on.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// True once the owning agent has begun terminating.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves once the owning agent has begun terminating.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }

    pub fn current_state(&self) -> LifecycleState {
        self.agent.current_state()
    }

    pub fn send_message(
        &self,
        target: impl Into<MessageTarget>,
        topic: impl Into<String>,
        payload: serde_json::Value,
    ) -> WardenResult<()> {
        self.agent.send_message(target, topic, payload)
    }

    pub fn log_audit(&self, action: &str, data: serde_json::Value) -> WardenResult<String> {
        self.agent.log_audit(action, data)
    }
}
