//! # warden-contracts
//!
//! Shared types, identities, and error contracts for the WARDEN agent runtime.
//!
//! Every crate in the workspace imports from here. No scheduling, messaging,
//! or hashing logic lives in this crate, only data definitions, their
//! constructors, and the error type.

pub mod agent;
pub mod capability;
pub mod error;
pub mod message;
pub mod task;

#[cfg(test)]
mod tests {
    use super::*;
    use agent::{AgentId, AgentIdentity, AgentRole, LifecycleState};
    use capability::{Capability, CapabilitySet};
    use error::WardenError;
    use message::{Message, MessageTarget};
    use task::{Task, TaskId, TaskPriority, TaskSpec};

    // ── CapabilitySet ────────────────────────────────────────────────────────

    #[test]
    fn capability_set_grant_and_has() {
        let mut caps = CapabilitySet::default();
        let scan = Capability::new("scan:model");
        let score = Capability::new("score:risk");

        assert!(!caps.has(&scan));
        caps.grant(scan.clone());
        assert!(caps.has(&scan));
        assert!(!caps.has(&score));
    }

    #[test]
    fn empty_capability_set_permits_everything() {
        let caps = CapabilitySet::default();
        assert!(caps.permits("scan:model"));
        assert!(caps.permits("anything"));
    }

    #[test]
    fn non_empty_capability_set_is_an_allow_list() {
        let caps: CapabilitySet = ["scan:model"].into_iter().collect();
        assert!(caps.permits("scan:model"));
        assert!(!caps.permits("enforce:block"));
    }

    #[test]
    fn wildcard_capability_permits_every_type() {
        let caps: CapabilitySet = ["*"].into_iter().collect();
        assert!(caps.permits("enforce:block"));
    }

    #[test]
    fn duplicate_grant_is_idempotent() {
        let mut caps = CapabilitySet::default();
        caps.grant(Capability::new("audit:append"));
        caps.grant(Capability::new("audit:append"));
        assert_eq!(caps.len(), 1);
    }

    // ── Identity ─────────────────────────────────────────────────────────────

    #[test]
    fn identity_agent_id_combines_role_and_node() {
        let identity = AgentIdentity::generate(AgentRole::Watchdog, "node-3");
        assert_eq!(identity.agent_id(), AgentId::new("watchdog-node-3"));
    }

    #[test]
    fn identity_max_concurrent_tasks_has_floor_of_one() {
        let identity =
            AgentIdentity::generate(AgentRole::Scout, "n1").with_max_concurrent_tasks(0);
        assert_eq!(identity.max_concurrent_tasks(), 1);
    }

    #[test]
    fn identity_signature_round_trip() {
        let identity = AgentIdentity::from_secret_key(AgentRole::Auditor, "n1", [7u8; 32]);
        let signature = identity.sign(b"verdict:block");

        assert!(identity.verify(b"verdict:block", &signature).is_ok());
        assert!(matches!(
            identity.verify(b"verdict:allow", &signature),
            Err(WardenError::SignatureInvalid { .. })
        ));
    }

    #[test]
    fn identity_debug_does_not_leak_private_key() {
        let identity = AgentIdentity::from_secret_key(AgentRole::Auditor, "n1", [9u8; 32]);
        let rendered = format!("{:?}", identity);
        assert!(rendered.contains("public_key"));
        assert!(!rendered.contains("signing_key"));
    }

    #[test]
    fn agent_role_parses_case_insensitively() {
        assert_eq!("Forensic".parse::<AgentRole>().unwrap(), AgentRole::Forensic);
        assert!(matches!(
            "oracle".parse::<AgentRole>(),
            Err(WardenError::ConfigError { .. })
        ));
    }

    #[test]
    fn lifecycle_state_u8_round_trip() {
        for state in [
            LifecycleState::Uninitialized,
            LifecycleState::Initializing,
            LifecycleState::Ready,
            LifecycleState::Running,
            LifecycleState::Paused,
            LifecycleState::Terminated,
        ] {
            assert_eq!(LifecycleState::from_u8(state as u8), Some(state));
        }
        assert_eq!(LifecycleState::from_u8(42), None);
    }

    // ── Tasks ────────────────────────────────────────────────────────────────

    #[test]
    fn priority_orders_high_above_low() {
        assert!(TaskPriority::High > TaskPriority::Medium);
        assert!(TaskPriority::Medium > TaskPriority::Low);
        assert_eq!(TaskPriority::default(), TaskPriority::Medium);
    }

    #[test]
    fn task_from_spec_generates_missing_id() {
        let a = Task::from_spec(TaskSpec::new("scan:model"));
        let b = Task::from_spec(TaskSpec::new("scan:model"));
        assert_ne!(a.id, b.id);
        assert_eq!(a.attempt_count, 0);

        let named = Task::from_spec(TaskSpec::new("scan:model").with_id("t-1"));
        assert_eq!(named.id, TaskId::from("t-1"));
    }

    #[test]
    fn task_attempt_budget_is_retries_plus_one() {
        let mut task = Task::from_spec(TaskSpec::new("x").with_max_retries(2));
        assert_eq!(task.max_attempts(), 3);
        task.attempt_count = 3;
        assert!(!task.has_attempts_left());
    }

    #[test]
    fn task_spec_deserializes_with_defaults() {
        let spec: TaskSpec = serde_json::from_str(r#"{ "task_type": "score:risk" }"#).unwrap();
        assert_eq!(spec.priority, TaskPriority::Medium);
        assert_eq!(spec.max_retries, 0);
        assert!(spec.id.is_none());
    }

    // ── Messages ─────────────────────────────────────────────────────────────

    #[test]
    fn message_target_from_str() {
        assert_eq!(MessageTarget::from("broadcast"), MessageTarget::Broadcast);
        assert_eq!(
            MessageTarget::from("enforcer-n2"),
            MessageTarget::Agent(AgentId::new("enforcer-n2"))
        );
    }

    #[test]
    fn message_new_assigns_unique_ids() {
        let sender = AgentId::new("scout-n1");
        let a = Message::new(sender.clone(), "broadcast", "incident", serde_json::Value::Null);
        let b = Message::new(sender, "broadcast", "incident", serde_json::Value::Null);
        assert_ne!(a.id, b.id);
        assert!(a.target.is_broadcast());
    }

    // ── WardenError display messages ─────────────────────────────────────────

    #[test]
    fn error_invalid_transition_display() {
        let err = WardenError::invalid_transition(LifecycleState::Terminated, "start");
        let msg = err.to_string();
        assert!(msg.contains("cannot start"));
        assert!(msg.contains("terminated"));
    }

    #[test]
    fn error_retries_exhausted_display() {
        let err = WardenError::RetriesExhausted {
            task_id: "t-9".to_string(),
            attempts: 3,
            reason: "upstream timeout".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("t-9"));
        assert!(msg.contains("3 attempt(s)"));
        assert!(msg.contains("upstream timeout"));
    }

    #[test]
    fn error_chain_integrity_display_lists_indices() {
        let err = WardenError::ChainIntegrityViolation { indices: vec![1, 4] };
        assert!(err.to_string().contains("[1, 4]"));
    }

    #[test]
    fn error_capability_missing_display() {
        let err = WardenError::CapabilityMissing {
            capability: "enforce:block".to_string(),
            agent_id: "scout-n1".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("enforce:block"));
        assert!(msg.contains("scout-n1"));
    }
}
