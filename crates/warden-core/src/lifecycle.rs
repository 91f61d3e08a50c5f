//! The agent lifecycle state machine.
//!
//! ```text
//! uninitialized ──initialize──▶ (initializing) ──▶ ready ──start──▶ running
//!                                                      paused ◀──stop──┘ │
//!                                                        └────start──────┘
//! any non-terminal ──terminate──▶ terminated ──terminate──▶ terminated
//! ```
//!
//! Operations are validated with `begin`, then either `commit`ted once the
//! lifecycle hooks succeed or `rollback`ed to the starting state. Only
//! `initialize` is visible while in progress (as `initializing`); the other
//! transitions change the state at commit. The current state lives in an
//! atomic so readers never block.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use warden_contracts::{
    agent::LifecycleState,
    error::{WardenError, WardenResult},
};

/// A lifecycle operation requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleOp {
    Initialize,
    Start,
    Stop,
    Terminate,
}

impl fmt::Display for LifecycleOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleOp::Initialize => "initialize",
            LifecycleOp::Start => "start",
            LifecycleOp::Stop => "stop",
            LifecycleOp::Terminate => "terminate",
        };
        f.write_str(name)
    }
}

/// A validated, not yet committed transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub op: LifecycleOp,
    pub from: LifecycleState,
    pub to: LifecycleState,
}

/// Destination of `op` from `from`, or `InvalidStateTransition`.
pub fn destination(from: LifecycleState, op: LifecycleOp) -> WardenResult<LifecycleState> {
    use LifecycleState::*;

    match (from, op) {
        (Uninitialized, LifecycleOp::Initialize) => Ok(Ready),
        (Ready, LifecycleOp::Start) | (Paused, LifecycleOp::Start) => Ok(Running),
        (Running, LifecycleOp::Stop) => Ok(Paused),
        (_, LifecycleOp::Terminate) => Ok(Terminated),
        _ => Err(WardenError::invalid_transition(from, op.to_string())),
    }
}

/// Holds one agent's lifecycle state.
///
/// Callers must serialize `begin`/`commit`/`rollback` sequences; the agent
/// does so with its lifecycle lock.
#[derive(Debug)]
pub struct StateMachine {
    state: AtomicU8,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(LifecycleState::Uninitialized as u8),
        }
    }

    pub fn current(&self) -> LifecycleState {
        // Only valid discriminants are ever stored.
        LifecycleState::from_u8(self.state.load(Ordering::Acquire))
            .unwrap_or(LifecycleState::Terminated)
    }

    /// Validate `op` against the current state.
    ///
    /// For `Initialize` the state moves to `Initializing` immediately. No
    /// other operation changes the state until `commit`. On error nothing
    /// changes.
    pub fn begin(&self, op: LifecycleOp) -> WardenResult<Transition> {
        let from = self.current();
        let to = destination(from, op)?;
        if op == LifecycleOp::Initialize {
            self.store(LifecycleState::Initializing);
        }
        Ok(Transition { op, from, to })
    }

    pub fn commit(&self, transition: Transition) {
        self.store(transition.to);
    }

    pub fn rollback(&self, transition: Transition) {
        self.store(transition.from);
    }

    fn store(&self, state: LifecycleState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use LifecycleState::*;

    fn drive(machine: &StateMachine, op: LifecycleOp) -> WardenResult<LifecycleState> {
        let transition = machine.begin(op)?;
        machine.commit(transition);
        Ok(machine.current())
    }

    #[test]
    fn full_cycle_reaches_running_after_restart() {
        let machine = StateMachine::new();
        assert_eq!(drive(&machine, LifecycleOp::Initialize).unwrap(), Ready);
        assert_eq!(drive(&machine, LifecycleOp::Start).unwrap(), Running);
        assert_eq!(drive(&machine, LifecycleOp::Stop).unwrap(), Paused);
        assert_eq!(drive(&machine, LifecycleOp::Start).unwrap(), Running);
    }

    #[test]
    fn start_before_initialize_is_rejected_without_mutation() {
        let machine = StateMachine::new();
        let err = machine.begin(LifecycleOp::Start).unwrap_err();
        assert!(matches!(
            err,
            WardenError::InvalidStateTransition { from: Uninitialized, .. }
        ));
        assert_eq!(machine.current(), Uninitialized);
    }

    #[test]
    fn running_cannot_be_reached_without_ready() {
        for from in [Uninitialized, Initializing, Running, Terminated] {
            assert!(destination(from, LifecycleOp::Start).is_err(), "start from {from}");
        }
    }

    #[test]
    fn initialize_is_visible_while_in_progress() {
        let machine = StateMachine::new();
        let transition = machine.begin(LifecycleOp::Initialize).unwrap();
        assert_eq!(machine.current(), Initializing);

        machine.rollback(transition);
        assert_eq!(machine.current(), Uninitialized);
    }

    #[test]
    fn terminated_only_accepts_terminate() {
        let machine = StateMachine::new();
        drive(&machine, LifecycleOp::Terminate).unwrap();

        for op in [LifecycleOp::Initialize, LifecycleOp::Start, LifecycleOp::Stop] {
            assert!(machine.begin(op).is_err(), "{op} after terminate");
            assert_eq!(machine.current(), Terminated);
        }
        assert_eq!(drive(&machine, LifecycleOp::Terminate).unwrap(), Terminated);
    }

    #[test]
    fn terminate_allowed_from_every_non_terminal_state() {
        for from in [Uninitialized, Initializing, Ready, Running, Paused] {
            assert_eq!(destination(from, LifecycleOp::Terminate).unwrap(), Terminated);
        }
    }

    #[test]
    fn stop_requires_running() {
        for from in [Uninitialized, Ready, Paused, Terminated] {
            assert!(destination(from, LifecycleOp::Stop).is_err(), "stop from {from}");
        }
    }
}
