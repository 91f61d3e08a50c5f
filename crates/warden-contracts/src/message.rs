//! Bus message types.
//!
//! Messages are transient: the bus holds them only between `publish` and the
//! next processing tick, and never persists them.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agent::AgentId;

/// Who a message is for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageTarget {
    /// Every current subscriber of the topic.
    Broadcast,
    /// Only subscribers registered under this agent identity.
    Agent(AgentId),
}

impl MessageTarget {
    pub const BROADCAST: &'static str = "broadcast";

    pub fn agent(id: impl Into<String>) -> Self {
        MessageTarget::Agent(AgentId(id.into()))
    }

    pub fn is_broadcast(&self) -> bool {
        matches!(self, MessageTarget::Broadcast)
    }
}

/// `"broadcast"` maps to `Broadcast`; anything else names an agent.
impl From<&str> for MessageTarget {
    fn from(target: &str) -> Self {
        if target == Self::BROADCAST {
            MessageTarget::Broadcast
        } else {
            MessageTarget::agent(target)
        }
    }
}

impl From<AgentId> for MessageTarget {
    fn from(id: AgentId) -> Self {
        MessageTarget::Agent(id)
    }
}

impl fmt::Display for MessageTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageTarget::Broadcast => f.write_str(Self::BROADCAST),
            MessageTarget::Agent(id) => write!(f, "{}", id),
        }
    }
}

/// One message travelling over the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: uuid::Uuid,
    pub sender_id: AgentId,
    pub target: MessageTarget,
    pub topic: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(
        sender_id: AgentId,
        target: impl Into<MessageTarget>,
        topic: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            sender_id,
            target: target.into(),
            topic: topic.into(),
            payload,
            timestamp: Utc::now(),
        }
    }
}
