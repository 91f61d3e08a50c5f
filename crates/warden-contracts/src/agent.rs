//! Agent identity and lifecycle types.
//!
//! An `AgentIdentity` is built once when an agent is constructed and never
//! changes afterwards. The runtime reads it to name the agent on the bus, to
//! gate task types against granted capabilities, and to size the scheduler.

use std::fmt;
use std::str::FromStr;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand_core::OsRng;
use serde::{Deserialize, Serialize};

use crate::capability::{Capability, CapabilitySet};
use crate::error::{WardenError, WardenResult};

/// Stable identifier for one agent in the network.
///
/// Used as the addressing key on the message bus and as the `agent_id`
/// field of every audit entry the agent writes.
/// Example: AgentId("watchdog-node-3")
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentId(pub String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

/// The kinds of agent that make up a governance network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    Scout,
    Sensor,
    Learner,
    Watchdog,
    Auditor,
    Enforcer,
    Proposer,
    Liaison,
    Forensic,
}

impl AgentRole {
    pub const ALL: [AgentRole; 9] = [
        AgentRole::Scout,
        AgentRole::Sensor,
        AgentRole::Learner,
        AgentRole::Watchdog,
        AgentRole::Auditor,
        AgentRole::Enforcer,
        AgentRole::Proposer,
        AgentRole::Liaison,
        AgentRole::Forensic,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Scout => "scout",
            AgentRole::Sensor => "sensor",
            AgentRole::Learner => "learner",
            AgentRole::Watchdog => "watchdog",
            AgentRole::Auditor => "auditor",
            AgentRole::Enforcer => "enforcer",
            AgentRole::Proposer => "proposer",
            AgentRole::Liaison => "liaison",
            AgentRole::Forensic => "forensic",
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentRole {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AgentRole::ALL
            .iter()
            .copied()
            .find(|role| role.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| WardenError::ConfigError {
                reason: format!("unknown agent role '{}'", s),
            })
    }
}

/// The lifecycle position of one agent.
///
/// Only the agent's state machine moves between these; everything else reads.
/// The `u8` representation lets the state machine store the value in an
/// atomic so reads never block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum LifecycleState {
    Uninitialized = 0,
    Initializing = 1,
    Ready = 2,
    Running = 3,
    Paused = 4,
    Terminated = 5,
}

impl LifecycleState {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(LifecycleState::Uninitialized),
            1 => Some(LifecycleState::Initializing),
            2 => Some(LifecycleState::Ready),
            3 => Some(LifecycleState::Running),
            4 => Some(LifecycleState::Paused),
            5 => Some(LifecycleState::Terminated),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::Terminated)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Uninitialized => "uninitialized",
            LifecycleState::Initializing => "initializing",
            LifecycleState::Ready => "ready",
            LifecycleState::Running => "running",
            LifecycleState::Paused => "paused",
            LifecycleState::Terminated => "terminated",
        };
        f.pad(name)
    }
}

/// Immutable description of one agent: who it is, what it may do, and how
/// the runtime should size it.
///
/// Built with `AgentIdentity::generate` (fresh ed25519 key pair) or
/// `AgentIdentity::from_secret_key`, then refined with the `with_*` builder
/// methods before being handed to `Agent::new`. No mutating accessor exists
/// after that point.
#[derive(Clone)]
pub struct AgentIdentity {
    role: AgentRole,
    node_id: String,
    signing_key: SigningKey,
    capabilities: CapabilitySet,
    knowledge_endpoints: Vec<String>,
    peer_agents: Vec<AgentId>,
    heartbeat_interval_ms: u64,
    max_concurrent_tasks: usize,
}

impl AgentIdentity {
    pub const DEFAULT_MAX_CONCURRENT_TASKS: usize = 4;

    /// Create an identity with a freshly generated key pair.
    ///
    /// Heartbeats are disabled (`0`) until `with_heartbeat_interval_ms` is set.
    pub fn generate(role: AgentRole, node_id: impl Into<String>) -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self::with_key(role, node_id.into(), signing_key)
    }

    /// Create an identity from a known 32-byte ed25519 secret.
    pub fn from_secret_key(role: AgentRole, node_id: impl Into<String>, secret: [u8; 32]) -> Self {
        Self::with_key(role, node_id.into(), SigningKey::from_bytes(&secret))
    }

    fn with_key(role: AgentRole, node_id: String, signing_key: SigningKey) -> Self {
        Self {
            role,
            node_id,
            signing_key,
            capabilities: CapabilitySet::default(),
            knowledge_endpoints: Vec::new(),
            peer_agents: Vec::new(),
            heartbeat_interval_ms: 0,
            max_concurrent_tasks: Self::DEFAULT_MAX_CONCURRENT_TASKS,
        }
    }

    pub fn with_capabilities<I, C>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Capability>,
    {
        for capability in capabilities {
            self.capabilities.grant(capability.into());
        }
        self
    }

    pub fn with_knowledge_endpoints<I, S>(mut self, endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.knowledge_endpoints.extend(endpoints.into_iter().map(Into::into));
        self
    }

    pub fn with_peer_agents<I>(mut self, peers: I) -> Self
    where
        I: IntoIterator<Item = AgentId>,
    {
        self.peer_agents.extend(peers);
        self
    }

    pub fn with_heartbeat_interval_ms(mut self, interval_ms: u64) -> Self {
        self.heartbeat_interval_ms = interval_ms;
        self
    }

    /// Set the concurrency bound. Values below 1 are raised to 1.
    pub fn with_max_concurrent_tasks(mut self, max: usize) -> Self {
        self.max_concurrent_tasks = max.max(1);
        self
    }

    /// The bus address of this agent: `<role>-<node_id>`.
    pub fn agent_id(&self) -> AgentId {
        AgentId(format!("{}-{}", self.role, self.node_id))
    }

    pub fn role(&self) -> AgentRole {
        self.role
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn public_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Lowercase hex of the 32-byte public key.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key().as_bytes())
    }

    pub fn capabilities(&self) -> &CapabilitySet {
        &self.capabilities
    }

    pub fn knowledge_endpoints(&self) -> &[String] {
        &self.knowledge_endpoints
    }

    pub fn peer_agents(&self) -> &[AgentId] {
        &self.peer_agents
    }

    pub fn heartbeat_interval_ms(&self) -> u64 {
        self.heartbeat_interval_ms
    }

    pub fn max_concurrent_tasks(&self) -> usize {
        self.max_concurrent_tasks
    }

    /// Sign `message` with this agent's private key.
    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    /// Check that `signature` over `message` was produced by this identity.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> WardenResult<()> {
        self.public_key()
            .verify(message, signature)
            .map_err(|e| WardenError::SignatureInvalid {
                agent_id: self.agent_id().0,
                reason: e.to_string(),
            })
    }
}

// The private key never appears in debug output.
impl fmt::Debug for AgentIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentIdentity")
            .field("role", &self.role)
            .field("node_id", &self.node_id)
            .field("public_key", &self.public_key_hex())
            .field("capabilities", &self.capabilities)
            .field("knowledge_endpoints", &self.knowledge_endpoints)
            .field("peer_agents", &self.peer_agents)
            .field("heartbeat_interval_ms", &self.heartbeat_interval_ms)
            .field("max_concurrent_tasks", &self.max_concurrent_tasks)
            .finish()
    }
}
