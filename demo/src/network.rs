//! A small governance network built on the WARDEN runtime.
//!
//! Flow for each scanned model:
//!   1. Scout runs `scan:model`, audits the report, sends it to its watchdog peer
//!   2. Watchdog receives the finding, runs `assess:risk`
//!   3. Above the threshold, watchdog sends an enforcement request to its peer
//!   4. Enforcer runs `block:model` (its gateway rejects the first attempt,
//!      so the retry policy is exercised)
//!   5. Every step broadcasts a `governance.event`; the auditor records each
//!      one into the centralized compliance chain under the sender's id

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

use warden_audit::TamperEvidentLog;
use warden_contracts::{
    agent::AgentRole,
    error::{WardenError, WardenResult},
    message::{Message, MessageTarget},
    task::{Task, TaskPriority, TaskResult, TaskSpec},
};
use warden_core::{
    handler_fn, Agent, AgentContext, LifecycleHooks, MessageBus, RuntimeConfig, TaskContext,
    TaskHandler,
};

use crate::mock_data::{find_model, scan_report, ENFORCEMENT_THRESHOLD};

pub const TOPIC_FINDING: &str = "scan.finding";
pub const TOPIC_ENFORCEMENT: &str = "enforcement.request";
pub const TOPIC_GOVERNANCE: &str = "governance.event";
pub const TOPIC_ONLINE: &str = "agent.online";

// ── Helpers ───────────────────────────────────────────────────────────────────

fn payload_str<'a>(task: &'a Task, key: &str) -> WardenResult<&'a str> {
    task.payload[key]
        .as_str()
        .ok_or_else(|| WardenError::TaskHandlerFailure {
            task_id: task.id.to_string(),
            attempt: task.attempt_count,
            reason: format!("payload field '{}' missing", key),
        })
}

fn governance_event(ctx: &TaskContext, action: &str, detail: serde_json::Value) -> WardenResult<()> {
    ctx.send_message(
        MessageTarget::Broadcast,
        TOPIC_GOVERNANCE,
        json!({ "action": action, "detail": detail }),
    )
}

fn send_to_peers(ctx: &TaskContext, topic: &str, payload: serde_json::Value) -> WardenResult<()> {
    let peers = ctx.agent().identity().peer_agents();
    if peers.is_empty() {
        return ctx.send_message(MessageTarget::Broadcast, topic, payload);
    }
    for peer in peers {
        ctx.send_message(peer.clone(), topic, payload.clone())?;
    }
    Ok(())
}

// ── Task handlers ─────────────────────────────────────────────────────────────

/// Handles `scan:model`: read the model's metrics and report them.
pub struct ScoutHandler;

#[async_trait]
impl TaskHandler for ScoutHandler {
    async fn process_task(&self, task: Task, ctx: TaskContext) -> WardenResult<TaskResult> {
        let model_id = payload_str(&task, "model_id")?.to_string();
        let Some(model) = find_model(&model_id) else {
            return Ok(TaskResult::failure(
                task.id,
                format!("model '{}' not in registry", model_id),
            ));
        };

        let report = scan_report(&model);
        ctx.log_audit("scan.completed", report.clone())?;
        send_to_peers(&ctx, TOPIC_FINDING, report.clone())?;
        governance_event(&ctx, "scan.completed", json!({ "model_id": model.model_id }))?;

        Ok(TaskResult::success(task.id, report))
    }
}

/// Handles `assess:risk`: compare a scan report against the enforcement threshold.
pub struct WatchdogHandler {
    pub threshold: f64,
}

#[async_trait]
impl TaskHandler for WatchdogHandler {
    async fn process_task(&self, task: Task, ctx: TaskContext) -> WardenResult<TaskResult> {
        let model_id = payload_str(&task, "model_id")?.to_string();
        let score = task.payload["risk_score"].as_f64().unwrap_or(0.0);
        let escalate = score >= self.threshold;

        let verdict = json!({
            "model_id": model_id,
            "risk_score": score,
            "threshold": self.threshold,
            "escalate": escalate,
        });
        ctx.log_audit("risk.assessed", verdict.clone())?;

        if escalate {
            warn!(model_id = %model_id, risk_score = score, "risk above threshold, requesting enforcement");
            send_to_peers(
                &ctx,
                TOPIC_ENFORCEMENT,
                json!({ "model_id": model_id, "risk_score": score }),
            )?;
        }
        governance_event(&ctx, "risk.assessed", verdict.clone())?;

        Ok(TaskResult::success(task.id, verdict))
    }
}

/// Handles `block:model`: take a model out of service.
#[derive(Default)]
pub struct EnforcerHandler {
    blocked: Mutex<BTreeSet<String>>,
}

impl EnforcerHandler {
    pub fn blocked(&self) -> Vec<String> {
        self.blocked
            .lock()
            .expect("blocked set lock poisoned")
            .iter()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl TaskHandler for EnforcerHandler {
    async fn process_task(&self, task: Task, ctx: TaskContext) -> WardenResult<TaskResult> {
        let model_id = payload_str(&task, "model_id")?.to_string();

        // The simulated deployment gateway times out on first contact.
        if ctx.attempt() == 1 {
            return Ok(TaskResult::failure(task.id, "deployment gateway timed out"));
        }

        let newly_blocked = self
            .blocked
            .lock()
            .expect("blocked set lock poisoned")
            .insert(model_id.clone());

        let action = json!({ "model_id": model_id, "newly_blocked": newly_blocked });
        ctx.log_audit("model.blocked", action.clone())?;
        governance_event(&ctx, "model.blocked", action.clone())?;

        Ok(TaskResult::success(task.id, action))
    }
}

// ── Lifecycle hooks ───────────────────────────────────────────────────────────

/// Announces the agent on the bus when it starts.
pub struct AnnounceHooks;

#[async_trait]
impl LifecycleHooks for AnnounceHooks {
    async fn on_start(&self, ctx: &AgentContext) -> WardenResult<()> {
        ctx.send_message(
            MessageTarget::Broadcast,
            TOPIC_ONLINE,
            json!({
                "agent_id": ctx.agent_id(),
                "public_key": ctx.identity().public_key_hex(),
            }),
        )
    }

    async fn on_stop(&self, ctx: &AgentContext) -> WardenResult<()> {
        info!(agent_id = %ctx.agent_id(), "agent going offline");
        Ok(())
    }
}

// ── Network ───────────────────────────────────────────────────────────────────

/// Every agent in the demo, their shared bus, and the compliance chain.
pub struct Network {
    pub bus: MessageBus,
    pub agents: Vec<Agent>,
    pub compliance: TamperEvidentLog,
    pub enforcer: Arc<EnforcerHandler>,
}

impl Network {
    /// Build, initialize, wire and start every agent in `config`.
    pub async fn launch(config: &RuntimeConfig) -> WardenResult<Self> {
        let bus = MessageBus::start(config.bus.clone());
        let compliance = TamperEvidentLog::new("compliance");
        let enforcer_handler = Arc::new(EnforcerHandler::default());

        let mut agents = Vec::with_capacity(config.agents.len());
        for agent_config in &config.agents {
            let identity = agent_config.build_identity();
            let handler: Arc<dyn TaskHandler> = match identity.role() {
                AgentRole::Scout => Arc::new(ScoutHandler),
                AgentRole::Watchdog => Arc::new(WatchdogHandler {
                    threshold: ENFORCEMENT_THRESHOLD,
                }),
                AgentRole::Enforcer => enforcer_handler.clone(),
                _ => handler_fn(|task: Task, _ctx| async move {
                    Ok(TaskResult::failure(task.id, "no handler for this role"))
                }),
            };

            let agent = Agent::with_scheduler_config(
                identity,
                Arc::new(AnnounceHooks),
                handler,
                &config.scheduler,
            );
            agent.initialize(bus.clone()).await?;
            agents.push(agent);
        }

        let network = Self {
            bus,
            agents,
            compliance,
            enforcer: enforcer_handler,
        };
        network.wire()?;

        for agent in &network.agents {
            agent.start().await?;
        }
        info!(agents = network.agents.len(), "governance network online");
        Ok(network)
    }

    fn wire(&self) -> WardenResult<()> {
        for agent in &self.agents {
            match agent.identity().role() {
                AgentRole::Watchdog => {
                    let watchdog = agent.clone();
                    agent.subscribe(TOPIC_FINDING, move |message: &Message| {
                        let spec = TaskSpec::new("assess:risk").with_payload(message.payload.clone());
                        if let Err(err) = watchdog.submit_task(spec) {
                            warn!(error = %err, "finding not assessed");
                        }
                    })?;
                }
                AgentRole::Enforcer => {
                    let enforcer = agent.clone();
                    agent.subscribe(TOPIC_ENFORCEMENT, move |message: &Message| {
                        let spec = TaskSpec::new("block:model")
                            .with_priority(TaskPriority::High)
                            .with_max_retries(2)
                            .with_payload(message.payload.clone());
                        if let Err(err) = enforcer.submit_task(spec) {
                            warn!(error = %err, "enforcement request dropped");
                        }
                    })?;
                }
                AgentRole::Auditor => {
                    let compliance = self.compliance.clone();
                    agent.subscribe(TOPIC_GOVERNANCE, move |message: &Message| {
                        let action = message.payload["action"].as_str().unwrap_or("unknown");
                        if let Err(err) = compliance.append_as(
                            message.sender_id.as_str(),
                            action,
                            message.payload["detail"].clone(),
                        ) {
                            warn!(error = %err, "compliance entry not recorded");
                        }
                    })?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn agent(&self, role: AgentRole) -> WardenResult<&Agent> {
        self.agents
            .iter()
            .find(|a| a.identity().role() == role)
            .ok_or_else(|| WardenError::ConfigError {
                reason: format!("network has no {} agent", role),
            })
    }

    /// Wait until no agent has queued or running work and the bus is empty.
    ///
    /// Work cascades across agents through the bus, so one idle pass is not
    /// enough; this keeps checking until a full pass finds nothing to do.
    pub async fn settle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        let tick = Duration::from_millis(self.bus.config().processing_interval_ms);
        loop {
            let mut idle = self.bus.queued_len() == 0;
            for agent in &self.agents {
                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                idle &= agent.wait_for_idle(remaining).await;
            }
            // Give the bus one more tick to surface follow-up messages.
            tokio::time::sleep(tick * 2).await;
            if idle && self.bus.queued_len() == 0 && self.agents.iter().all(|a| a.stats().queued == 0) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
        }
    }

    /// Terminate every agent and stop the bus.
    pub async fn shutdown(&self) -> WardenResult<()> {
        for agent in &self.agents {
            agent.terminate().await?;
        }
        self.bus.stop();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NETWORK: &str = include_str!("../network.toml");

    #[tokio::test]
    async fn test_high_risk_model_is_blocked_and_recorded() {
        let config = RuntimeConfig::from_toml_str(NETWORK).unwrap();
        let network = Network::launch(&config).await.unwrap();

        let scout = network.agent(AgentRole::Scout).unwrap();
        for model_id in ["resume-ranker-v2", "fraud-detector-v5"] {
            scout
                .submit_task(TaskSpec::new("scan:model").with_payload(json!({ "model_id": model_id })))
                .unwrap();
        }
        assert!(network.settle(Duration::from_secs(10)).await);

        assert_eq!(network.enforcer.blocked(), vec!["resume-ranker-v2".to_string()]);

        let enforcer = network.agent(AgentRole::Enforcer).unwrap();
        let stats = enforcer.stats();
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.retried, 1);

        let actions: Vec<String> = network
            .compliance
            .entries()
            .into_iter()
            .map(|e| e.action)
            .collect();
        assert_eq!(actions.iter().filter(|a| *a == "scan.completed").count(), 2);
        assert_eq!(actions.iter().filter(|a| *a == "model.blocked").count(), 1);
        assert!(network.compliance.verify().valid);

        network.shutdown().await.unwrap();
        for agent in &network.agents {
            assert!(agent.audit_log().verify().valid);
        }
    }

    #[tokio::test]
    async fn test_unknown_model_fails_without_escalation() {
        let config = RuntimeConfig::from_toml_str(NETWORK).unwrap();
        let network = Network::launch(&config).await.unwrap();

        let scout = network.agent(AgentRole::Scout).unwrap();
        let id = scout
            .submit_task(TaskSpec::new("scan:model").with_payload(json!({ "model_id": "ghost" })))
            .unwrap();
        assert!(network.settle(Duration::from_secs(10)).await);

        let result = scout.task_result(&id).unwrap();
        assert!(!result.success);
        assert!(network.enforcer.blocked().is_empty());
        network.shutdown().await.unwrap();
    }
}
