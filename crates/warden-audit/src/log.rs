//! The tamper-evident log itself.
//!
//! `TamperEvidentLog` keeps its chain in a `Vec` behind a `Mutex`. Each
//! append reads the current tip and pushes the new entry under one lock
//! acquisition, so concurrent `log_audit` calls from parallel task handlers
//! can never interleave into a broken chain. Clones share the same chain.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::{debug, info};

use warden_contracts::error::{WardenError, WardenResult};

use crate::{
    chain::{hash_entry, verify_chain, ChainVerification},
    entry::{AuditTrail, LogEntry},
};

// ── Internal mutable state ────────────────────────────────────────────────────

pub(crate) struct LogState {
    /// All entries, in append order.
    pub(crate) entries: Vec<LogEntry>,

    /// Set once by `close()`; appends fail afterwards.
    pub(crate) closed: bool,
}

// ── Public log ────────────────────────────────────────────────────────────────

/// An append-only SHA-256 hash chain.
///
/// There is no remove or edit operation. `last_hash` and `length` are derived
/// from the stored entries rather than tracked separately.
#[derive(Clone)]
pub struct TamperEvidentLog {
    owner: String,
    pub(crate) state: Arc<Mutex<LogState>>,
}

impl TamperEvidentLog {
    /// Create an empty chain owned by `owner` (an agent id, or a compliance
    /// role name for a centralized chain).
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            state: Arc::new(Mutex::new(LogState {
                entries: Vec::new(),
                closed: false,
            })),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Append an entry attributed to the log's owner. Returns the new tip.
    pub fn append(&self, action: &str, data: serde_json::Value) -> WardenResult<String> {
        let owner = self.owner.clone();
        self.append_as(&owner, action, data)
    }

    /// Append an entry attributed to `agent_id`.
    ///
    /// Centralized chains record actions from many agents; per-agent chains
    /// go through `append`.
    pub fn append_as(
        &self,
        agent_id: &str,
        action: &str,
        data: serde_json::Value,
    ) -> WardenResult<String> {
        let mut state = self.state.lock().map_err(|e| WardenError::AuditWriteFailed {
            reason: format!("audit log lock poisoned: {}", e),
        })?;

        if state.closed {
            return Err(WardenError::AuditLogClosed {
                owner: self.owner.clone(),
            });
        }

        let prev_hash = state
            .entries
            .last()
            .map(|e| e.entry_hash.clone())
            .unwrap_or_else(|| LogEntry::GENESIS_HASH.to_string());
        let sequence_number = state.entries.len() as u64;
        let timestamp = Utc::now();

        let entry_hash = hash_entry(&prev_hash, &timestamp, agent_id, action, &data);

        state.entries.push(LogEntry {
            sequence_number,
            timestamp,
            agent_id: agent_id.to_string(),
            action: action.to_string(),
            data,
            entry_hash: entry_hash.clone(),
            prev_hash,
        });

        debug!(
            owner = %self.owner,
            sequence = sequence_number,
            action = %action,
            "audit entry appended"
        );

        Ok(entry_hash)
    }

    /// The tip of the chain, or `GENESIS_HASH` when empty.
    pub fn last_hash(&self) -> String {
        let state = self.state.lock().expect("audit log lock poisoned");
        state
            .entries
            .last()
            .map(|e| e.entry_hash.clone())
            .unwrap_or_else(|| LogEntry::GENESIS_HASH.to_string())
    }

    /// Same as `last_hash`; the root of a linear chain is its tip.
    pub fn root(&self) -> String {
        self.last_hash()
    }

    pub fn length(&self) -> usize {
        self.state.lock().expect("audit log lock poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.length() == 0
    }

    /// Recompute the chain from genesis and report every divergent entry.
    pub fn verify(&self) -> ChainVerification {
        let state = self.state.lock().expect("audit log lock poisoned");
        verify_chain(&state.entries)
    }

    /// A snapshot copy of every entry.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.state.lock().expect("audit log lock poisoned").entries.clone()
    }

    /// Export a sealed copy of the chain as it stands now.
    pub fn export(&self) -> AuditTrail {
        let state = self.state.lock().expect("audit log lock poisoned");
        let terminal_hash = state
            .entries
            .last()
            .map(|e| e.entry_hash.clone())
            .unwrap_or_else(|| LogEntry::GENESIS_HASH.to_string());

        AuditTrail {
            owner: self.owner.clone(),
            entries: state.entries.clone(),
            sealed_at: Utc::now(),
            terminal_hash,
        }
    }

    /// Refuse further appends. Reads and verification keep working.
    ///
    /// Closing twice is harmless.
    pub fn close(&self) {
        let mut state = self.state.lock().expect("audit log lock poisoned");
        if state.closed {
            return;
        }
        state.closed = true;

        let terminal_hash = state
            .entries
            .last()
            .map(|e| e.entry_hash.as_str())
            .unwrap_or(LogEntry::GENESIS_HASH);
        info!(
            owner = %self.owner,
            entry_count = state.entries.len(),
            terminal_hash = %terminal_hash,
            "audit log closed"
        );
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().expect("audit log lock poisoned").closed
    }
}

impl std::fmt::Debug for TamperEvidentLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TamperEvidentLog")
            .field("owner", &self.owner)
            .field("length", &self.length())
            .finish()
    }
}
