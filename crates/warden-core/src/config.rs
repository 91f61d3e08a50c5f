//! TOML runtime configuration.
//!
//! ```toml
//! [bus]
//! processing_interval_ms = 50
//! max_queue_len = 10000
//!
//! [scheduler]
//! result_history = 256
//!
//! [[agents]]
//! role = "watchdog"
//! node_id = "n1"
//! capabilities = ["scan:model", "alert"]
//! peer_agents = ["enforcer-n2"]
//! heartbeat_interval_ms = 1000
//! max_concurrent_tasks = 2
//! ```
//!
//! Every field has a default, so an empty document is a valid config.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use warden_contracts::{
    agent::{AgentId, AgentIdentity, AgentRole},
    error::{WardenError, WardenResult},
};

use crate::{bus::BusConfig, scheduler::SchedulerConfig};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub bus: BusConfig,
    pub scheduler: SchedulerConfig,
    pub agents: Vec<AgentConfig>,
}

impl RuntimeConfig {
    /// Parse and validate `s`.
    ///
    /// Returns `WardenError::ConfigError` if the TOML is malformed, does not
    /// match the schema, or fails `validate`.
    pub fn from_toml_str(s: &str) -> WardenResult<Self> {
        let config: RuntimeConfig = toml::from_str(s).map_err(|e| WardenError::ConfigError {
            reason: format!("failed to parse runtime TOML: {}", e),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> WardenResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| WardenError::ConfigError {
            reason: format!("failed to read config file '{}': {}", path.display(), e),
        })?;
        Self::from_toml_str(&contents)
    }

    /// Reject a zero bus interval or queue length, and duplicate agent ids.
    pub fn validate(&self) -> WardenResult<()> {
        if self.bus.processing_interval_ms == 0 {
            return Err(WardenError::ConfigError {
                reason: "bus.processing_interval_ms must be greater than zero".to_string(),
            });
        }
        if self.bus.max_queue_len == 0 {
            return Err(WardenError::ConfigError {
                reason: "bus.max_queue_len must be greater than zero".to_string(),
            });
        }

        let mut seen = HashSet::new();
        for agent in &self.agents {
            let id = agent.agent_id();
            if !seen.insert(id.clone()) {
                return Err(WardenError::ConfigError {
                    reason: format!("duplicate agent id '{}'", id),
                });
            }
        }
        Ok(())
    }
}

/// One `[[agents]]` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub role: AgentRole,
    pub node_id: String,
    /// Empty means unrestricted.
    pub capabilities: Vec<String>,
    pub knowledge_endpoints: Vec<String>,
    pub peer_agents: Vec<String>,
    /// 0 disables the heartbeat.
    pub heartbeat_interval_ms: u64,
    pub max_concurrent_tasks: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            role: AgentRole::Scout,
            node_id: "local".to_string(),
            capabilities: Vec::new(),
            knowledge_endpoints: Vec::new(),
            peer_agents: Vec::new(),
            heartbeat_interval_ms: 0,
            max_concurrent_tasks: AgentIdentity::DEFAULT_MAX_CONCURRENT_TASKS,
        }
    }
}

impl AgentConfig {
    pub fn agent_id(&self) -> AgentId {
        AgentId(format!("{}-{}", self.role, self.node_id))
    }

    /// Build an identity with a freshly generated key pair.
    pub fn build_identity(&self) -> AgentIdentity {
        AgentIdentity::generate(self.role, self.node_id.clone())
            .with_capabilities(self.capabilities.iter().map(String::as_str))
            .with_knowledge_endpoints(self.knowledge_endpoints.iter().cloned())
            .with_peer_agents(self.peer_agents.iter().map(AgentId::new))
            .with_heartbeat_interval_ms(self.heartbeat_interval_ms)
            .with_max_concurrent_tasks(self.max_concurrent_tasks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NETWORK: &str = r#"
        [bus]
        processing_interval_ms = 20

        [scheduler]
        result_history = 16

        [[agents]]
        role = "watchdog"
        node_id = "n1"
        capabilities = ["scan:model", "alert"]
        peer_agents = ["enforcer-n2"]
        heartbeat_interval_ms = 500
        max_concurrent_tasks = 2

        [[agents]]
        role = "enforcer"
        node_id = "n2"
    "#;

    #[test]
    fn test_parse_network() {
        let config = RuntimeConfig::from_toml_str(NETWORK).unwrap();
        assert_eq!(config.bus.processing_interval_ms, 20);
        assert_eq!(config.bus.max_queue_len, BusConfig::default().max_queue_len);
        assert_eq!(config.scheduler.result_history, 16);
        assert_eq!(config.agents.len(), 2);

        let watchdog = config.agents[0].build_identity();
        assert_eq!(watchdog.agent_id(), AgentId::new("watchdog-n1"));
        assert!(watchdog.capabilities().permits("alert"));
        assert!(!watchdog.capabilities().permits("block"));
        assert_eq!(watchdog.peer_agents(), &[AgentId::new("enforcer-n2")]);
        assert_eq!(watchdog.heartbeat_interval_ms(), 500);
        assert_eq!(watchdog.max_concurrent_tasks(), 2);

        let enforcer = config.agents[1].build_identity();
        assert!(enforcer.capabilities().is_empty());
        assert_eq!(
            enforcer.max_concurrent_tasks(),
            AgentIdentity::DEFAULT_MAX_CONCURRENT_TASKS
        );
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = RuntimeConfig::from_toml_str("").unwrap();
        assert_eq!(config, RuntimeConfig::default());
    }

    #[test]
    fn test_malformed_toml_is_config_error() {
        let err = RuntimeConfig::from_toml_str("[bus\nprocessing_interval_ms = ").unwrap_err();
        assert!(matches!(err, WardenError::ConfigError { .. }));
    }

    #[test]
    fn test_unknown_role_is_config_error() {
        let err = RuntimeConfig::from_toml_str("[[agents]]\nrole = \"oracle\"").unwrap_err();
        assert!(matches!(err, WardenError::ConfigError { .. }));
    }

    #[test]
    fn test_duplicate_agent_ids_rejected() {
        let doc = "[[agents]]\nrole = \"scout\"\nnode_id = \"a\"\n[[agents]]\nrole = \"scout\"\nnode_id = \"a\"";
        let err = RuntimeConfig::from_toml_str(doc).unwrap_err();
        assert!(err.to_string().contains("duplicate agent id 'scout-a'"));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let err = RuntimeConfig::from_toml_str("[bus]\nprocessing_interval_ms = 0").unwrap_err();
        assert!(err.to_string().contains("processing_interval_ms"));
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = RuntimeConfig::from_file(Path::new("/nonexistent/warden.toml")).unwrap_err();
        assert!(matches!(err, WardenError::ConfigError { .. }));
    }
}
