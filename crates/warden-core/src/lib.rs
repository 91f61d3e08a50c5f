//! # warden-core
//!
//! The agent execution runtime for WARDEN governance networks.
//!
//! This crate provides:
//! - `Agent`: lifecycle state machine, per-agent task scheduler and bus access
//! - `MessageBus`: topic pub/sub delivered on a periodic tick
//! - `ScheduledTask`: the owned timer behind every recurring activity
//! - `RuntimeConfig`: TOML configuration for a whole network
//! - The extension traits (`TaskHandler`, `LifecycleHooks`, `MessageHandler`)
//!
//! ## Usage
//!
//! ```rust,ignore
//! use warden_core::{handler_fn, Agent, BusConfig, MessageBus, NoopHooks};
//!
//! let bus = MessageBus::start(BusConfig::default());
//! let agent = Agent::new(identity, Arc::new(NoopHooks), handler_fn(|task, _ctx| async move {
//!     Ok(TaskResult::success(task.id, serde_json::json!({ "ok": true })))
//! }));
//!
//! agent.initialize(bus.clone()).await?;
//! agent.start().await?;
//! agent.submit_task(TaskSpec::new("scan:model"))?;
//! ```

pub mod agent;
pub mod bus;
pub mod config;
pub mod context;
pub mod lifecycle;
pub mod scheduler;
pub mod timer;
pub mod traits;

pub use agent::{Agent, HEARTBEAT_TOPIC};
pub use bus::{BusConfig, BusStats, MessageBus, Subscription};
pub use config::{AgentConfig, RuntimeConfig};
pub use context::{AgentContext, TaskContext};
pub use lifecycle::{LifecycleOp, StateMachine};
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerStats};
pub use timer::ScheduledTask;
pub use traits::{handler_fn, LifecycleHooks, MessageHandler, NoopHooks, TaskHandler};
